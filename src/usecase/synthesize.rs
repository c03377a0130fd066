use std::collections::BTreeSet;

use crate::domain::notification::{Notification, NotificationId, NotificationKind};
use crate::domain::raw_event::RawEvent;
use crate::usecase::actors::ActorDirectory;

const FEED_URL: &str = "/feed";

pub fn synthesize(
    event: &RawEvent,
    actors: &ActorDirectory,
    read: &BTreeSet<NotificationId>,
) -> Notification {
    let (id, kind, message, content, action_url, action_label) = match event {
        RawEvent::Like { row, post_snippet } => (
            NotificationId::like(row.post_id, row.user_id),
            NotificationKind::Likes,
            "liked your post",
            post_snippet.clone(),
            FEED_URL.to_string(),
            "View post",
        ),
        RawEvent::Comment(row) => (
            NotificationId::comment(row.id),
            NotificationKind::Comments,
            "commented on your post",
            Some(row.content.clone()),
            FEED_URL.to_string(),
            "View comment",
        ),
        RawEvent::Attendance { row, event_title } => (
            NotificationId::attendance(row.event_id, row.user_id),
            NotificationKind::Events,
            "is attending your event",
            event_title.clone(),
            format!("/events/{}", row.event_id),
            "View event",
        ),
    };

    Notification {
        is_read: read.contains(&id),
        id,
        source: event.source_table(),
        kind,
        actor: actors.snapshot(event.actor_id()),
        message: message.to_string(),
        content,
        created_at: event.created_at(),
        action_url,
        action_label: action_label.to_string(),
    }
}

pub fn synthesize_all(
    events: &[RawEvent],
    actors: &ActorDirectory,
    read: &BTreeSet<NotificationId>,
) -> Vec<Notification> {
    events
        .iter()
        .map(|event| synthesize(event, actors, read))
        .collect()
}
