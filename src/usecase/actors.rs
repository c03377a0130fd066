use std::collections::{BTreeSet, HashMap};

use uuid::Uuid;

use crate::domain::actor::ActorSnapshot;
use crate::repository::errors::RepositoryError;
use crate::usecase::contracts::NotificationSource;
use crate::usecase::sources::FetchedEvents;

/// Actor lookup for one refresh. Unknown actors resolve to a placeholder.
#[derive(Debug, Clone, Default)]
pub struct ActorDirectory {
    actors: HashMap<Uuid, ActorSnapshot>,
    placeholder: String,
}

impl ActorDirectory {
    pub fn new(actors: HashMap<Uuid, ActorSnapshot>, placeholder: impl Into<String>) -> Self {
        Self {
            actors,
            placeholder: placeholder.into(),
        }
    }

    pub fn snapshot(&self, actor_id: Uuid) -> ActorSnapshot {
        self.actors
            .get(&actor_id)
            .cloned()
            .unwrap_or_else(|| ActorSnapshot::placeholder(actor_id, &self.placeholder))
    }

    pub fn len(&self) -> usize {
        self.actors.len()
    }
}

/// Resolves every distinct actor of `events` with a single profile lookup.
#[tracing::instrument(skip(source, events), fields(events = events.len()))]
pub async fn resolve_actors<S>(
    source: &S,
    events: &FetchedEvents,
    placeholder: &str,
) -> Result<ActorDirectory, RepositoryError>
where
    S: NotificationSource + ?Sized,
{
    let actor_ids: Vec<Uuid> = events
        .iter()
        .map(|event| event.actor_id())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    if actor_ids.is_empty() {
        return Ok(ActorDirectory::new(HashMap::new(), placeholder));
    }

    let profiles = source.profiles(&actor_ids).await?;

    let actors: HashMap<Uuid, ActorSnapshot> = profiles
        .iter()
        .map(|profile| (profile.id, ActorSnapshot::from_profile(profile, placeholder)))
        .collect();

    let directory = ActorDirectory::new(actors, placeholder);
    let missing = actor_ids.len().saturating_sub(directory.len());
    if missing > 0 {
        tracing::debug!(missing, "some actor profiles not found, using placeholder");
    }

    Ok(directory)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::actor::ActorProfile;
    use crate::domain::raw_event::{CommentRow, LikeRow, RawEvent};
    use crate::usecase::contracts::MockNotificationSource;
    use chrono::Utc;

    fn like(actor: Uuid) -> RawEvent {
        RawEvent::Like {
            row: LikeRow {
                post_id: Uuid::new_v4(),
                user_id: actor,
                created_at: Utc::now(),
            },
            post_snippet: None,
        }
    }

    fn comment(actor: Uuid) -> RawEvent {
        RawEvent::Comment(CommentRow {
            id: Uuid::new_v4(),
            post_id: Uuid::new_v4(),
            user_id: actor,
            content: "Tebrikler".to_string(),
            created_at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn test_single_lookup_with_distinct_ids() {
        let mut source = MockNotificationSource::new();
        let known = Uuid::new_v4();
        let other = Uuid::new_v4();

        let events = FetchedEvents {
            likes: vec![like(known), like(other)],
            comments: vec![comment(known)],
            attendances: vec![],
        };

        source
            .expect_profiles()
            .withf(move |ids| ids.len() == 2 && ids.contains(&known) && ids.contains(&other))
            .times(1)
            .returning(move |_| {
                Ok(vec![ActorProfile {
                    id: known,
                    first_name: Some("Elif".to_string()),
                    last_name: Some("Kaya".to_string()),
                    username: None,
                    avatar_url: Some("https://cdn.example/elif.png".to_string()),
                }])
            });

        let directory = tokio_test::assert_ok!(resolve_actors(&source, &events, "User").await);

        assert_eq!(directory.len(), 1);
        assert_eq!(directory.snapshot(known).name, "Elif Kaya");
        let missing = directory.snapshot(other);
        assert_eq!(missing.name, "User");
        assert!(missing.avatar_url.is_none());
    }

    #[tokio::test]
    async fn test_no_events_skips_lookup() {
        let mut source = MockNotificationSource::new();
        source.expect_profiles().never();

        let directory = resolve_actors(&source, &FetchedEvents::default(), "Kullanıcı")
            .await
            .unwrap();

        assert_eq!(directory.len(), 0);
    }

    #[tokio::test]
    async fn test_lookup_failure_is_an_error() {
        let mut source = MockNotificationSource::new();
        source
            .expect_profiles()
            .returning(|_| Err(RepositoryError::DatabaseError("boom".to_string())));

        let events = FetchedEvents {
            likes: vec![like(Uuid::new_v4())],
            ..Default::default()
        };

        assert!(resolve_actors(&source, &events, "User").await.is_err());
    }
}
