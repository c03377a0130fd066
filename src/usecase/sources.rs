use std::collections::HashMap;

use uuid::Uuid;

use crate::domain::raw_event::{AttendanceStatus, RawEvent};
use crate::repository::errors::RepositoryError;
use crate::usecase::contracts::NotificationSource;

/// Raw events of one refresh, grouped by source table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchedEvents {
    pub likes: Vec<RawEvent>,
    pub comments: Vec<RawEvent>,
    pub attendances: Vec<RawEvent>,
}

impl FetchedEvents {
    pub fn iter(&self) -> impl Iterator<Item = &RawEvent> {
        self.likes
            .iter()
            .chain(self.comments.iter())
            .chain(self.attendances.iter())
    }

    pub fn len(&self) -> usize {
        self.likes.len() + self.comments.len() + self.attendances.len()
    }
}

/// Fetches every reaction to content owned by `user_id`. The post branch and
/// the event branch run concurrently; any query error fails the whole fetch.
#[tracing::instrument(skip(source), fields(%user_id, %owned_posts_limit))]
pub async fn fetch_raw_events<S>(
    source: &S,
    user_id: Uuid,
    owned_posts_limit: i64,
) -> Result<FetchedEvents, RepositoryError>
where
    S: NotificationSource + ?Sized,
{
    tracing::debug!("fetching raw events");

    let ((likes, comments), attendances) = tokio::try_join!(
        fetch_post_reactions(source, user_id, owned_posts_limit),
        fetch_event_attendance(source, user_id),
    )?;

    let events = FetchedEvents {
        likes,
        comments,
        attendances,
    };

    tracing::debug!(
        likes = events.likes.len(),
        comments = events.comments.len(),
        attendances = events.attendances.len(),
        "raw events fetched"
    );
    Ok(events)
}

async fn fetch_post_reactions<S>(
    source: &S,
    user_id: Uuid,
    limit: i64,
) -> Result<(Vec<RawEvent>, Vec<RawEvent>), RepositoryError>
where
    S: NotificationSource + ?Sized,
{
    let posts = source.owned_posts(user_id, limit).await?;
    if posts.is_empty() {
        tracing::debug!("user owns no posts, skipping like and comment queries");
        return Ok((Vec::new(), Vec::new()));
    }

    let post_ids: Vec<Uuid> = posts.iter().map(|post| post.id).collect();
    let snippets: HashMap<Uuid, Option<String>> =
        posts.iter().map(|post| (post.id, post.snippet())).collect();

    let (like_rows, comment_rows) = tokio::try_join!(
        source.likes(&post_ids, user_id),
        source.comments(&post_ids, user_id),
    )?;

    let likes = like_rows
        .into_iter()
        .filter(|row| row.user_id != user_id)
        .map(|row| {
            let post_snippet = snippets.get(&row.post_id).cloned().flatten();
            RawEvent::Like { row, post_snippet }
        })
        .collect();

    let comments = comment_rows
        .into_iter()
        .filter(|row| row.user_id != user_id)
        .map(RawEvent::Comment)
        .collect();

    Ok((likes, comments))
}

async fn fetch_event_attendance<S>(source: &S, user_id: Uuid) -> Result<Vec<RawEvent>, RepositoryError>
where
    S: NotificationSource + ?Sized,
{
    let events = source.organized_events(user_id).await?;
    if events.is_empty() {
        tracing::debug!("user organizes no events, skipping attendance query");
        return Ok(Vec::new());
    }

    let event_ids: Vec<Uuid> = events.iter().map(|event| event.id).collect();
    let titles: HashMap<Uuid, String> = events
        .into_iter()
        .map(|event| (event.id, event.title))
        .collect();

    let rows = source.event_attendees(&event_ids, user_id).await?;

    Ok(rows
        .into_iter()
        .filter(|row| row.user_id != user_id)
        .filter(|row| row.status != AttendanceStatus::NotGoing)
        .map(|row| {
            let event_title = titles.get(&row.event_id).cloned();
            RawEvent::Attendance { row, event_title }
        })
        .collect())
}
