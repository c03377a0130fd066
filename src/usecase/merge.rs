use std::collections::{BTreeSet, HashSet};

use crate::domain::notification::{Notification, NotificationId};

/// Concatenates the per-source lists, drops dismissed and duplicate ids and
/// orders the result newest first. Equal timestamps keep input order.
pub fn merge<I>(lists: I, dismissed: &BTreeSet<NotificationId>) -> Vec<Notification>
where
    I: IntoIterator<Item = Vec<Notification>>,
{
    let mut seen = HashSet::new();
    let mut merged: Vec<Notification> = lists
        .into_iter()
        .flatten()
        .filter(|n| !dismissed.contains(&n.id))
        .filter(|n| seen.insert(n.id.clone()))
        .collect();

    merged.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use uuid::Uuid;

    use crate::domain::actor::ActorSnapshot;
    use crate::domain::notification::NotificationKind;
    use crate::domain::raw_event::SourceTable;

    fn notification(id: &str, created_at: DateTime<Utc>) -> Notification {
        Notification {
            id: NotificationId::from(id),
            source: SourceTable::Likes,
            kind: NotificationKind::Likes,
            actor: ActorSnapshot::placeholder(Uuid::nil(), "User"),
            message: "liked your post".to_string(),
            content: None,
            created_at,
            is_read: false,
            action_url: "/feed".to_string(),
            action_label: "View post".to_string(),
        }
    }

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_sorted_descending_for_every_source_order() {
        let t = base();
        let a = vec![notification("a1", t), notification("a2", t + Duration::minutes(5))];
        let b = vec![notification("b1", t + Duration::minutes(2))];
        let c = vec![
            notification("c1", t - Duration::minutes(1)),
            notification("c2", t + Duration::minutes(9)),
        ];

        let orders = [
            [a.clone(), b.clone(), c.clone()],
            [c.clone(), a.clone(), b.clone()],
            [b.clone(), c.clone(), a.clone()],
        ];

        for lists in orders {
            let merged = merge(lists, &BTreeSet::new());
            let ids: Vec<&str> = merged.iter().map(|n| n.id.as_str()).collect();
            assert_eq!(ids, vec!["c2", "a2", "b1", "a1", "c1"]);
            assert!(merged.windows(2).all(|w| w[0].created_at >= w[1].created_at));
        }
    }

    #[test]
    fn test_ties_keep_input_order() {
        let t = base();
        let merged = merge(
            [vec![notification("x", t)], vec![notification("y", t)]],
            &BTreeSet::new(),
        );
        let ids: Vec<&str> = merged.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["x", "y"]);
    }

    #[test]
    fn test_dismissed_and_duplicates_removed() {
        let t = base();
        let dismissed: BTreeSet<_> = [NotificationId::from("gone")].into_iter().collect();

        let merged = merge(
            [
                vec![notification("gone", t), notification("dup", t)],
                vec![notification("dup", t + Duration::seconds(1))],
            ],
            &dismissed,
        );

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].id.as_str(), "dup");
        assert_eq!(merged[0].created_at, t);
    }

    #[test]
    fn test_merge_is_deterministic() {
        let t = base();
        let input = || {
            [
                vec![notification("l", t + Duration::minutes(3))],
                vec![notification("c", t)],
                vec![notification("e", t + Duration::minutes(1))],
            ]
        };

        let first = serde_json::to_vec(&merge(input(), &BTreeSet::new())).unwrap();
        let second = serde_json::to_vec(&merge(input(), &BTreeSet::new())).unwrap();
        assert_eq!(first, second);
    }
}
