use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::actor::ActorSnapshot;
use crate::domain::raw_event::SourceTable;

/// Deterministic notification id derived from the underlying row, so that
/// read and dismissed state survives a refresh.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotificationId(String);

impl NotificationId {
    pub fn like(post_id: Uuid, actor_id: Uuid) -> Self {
        Self(format!("{}:{}:{}", SourceTable::Likes, post_id, actor_id))
    }

    pub fn comment(comment_id: Uuid) -> Self {
        Self(format!("{}:{}", SourceTable::Comments, comment_id))
    }

    pub fn attendance(event_id: Uuid, actor_id: Uuid) -> Self {
        Self(format!("{}:{}:{}", SourceTable::EventAttendees, event_id, actor_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for NotificationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for NotificationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for NotificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Likes,
    Comments,
    Events,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    pub source: SourceTable,
    pub kind: NotificationKind,
    pub actor: ActorSnapshot,
    pub message: String,
    pub content: Option<String>,
    pub created_at: DateTime<Utc>,
    pub is_read: bool,
    pub action_url: String,
    pub action_label: String,
}
