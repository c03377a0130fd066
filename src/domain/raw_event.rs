use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

const SNIPPET_MAX_CHARS: usize = 80;

/// Backend tables a notification can originate from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceTable {
    Likes,
    Comments,
    EventAttendees,
}

impl SourceTable {
    pub const ALL: [SourceTable; 3] = [
        SourceTable::Likes,
        SourceTable::Comments,
        SourceTable::EventAttendees,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceTable::Likes => "likes",
            SourceTable::Comments => "comments",
            SourceTable::EventAttendees => "event_attendees",
        }
    }
}

impl fmt::Display for SourceTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown attendance status: {0}")]
pub struct UnknownAttendanceStatus(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceStatus {
    Going,
    Interested,
    NotGoing,
}

impl FromStr for AttendanceStatus {
    type Err = UnknownAttendanceStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "going" => Ok(AttendanceStatus::Going),
            "interested" => Ok(AttendanceStatus::Interested),
            "not_going" => Ok(AttendanceStatus::NotGoing),
            other => Err(UnknownAttendanceStatus(other.to_string())),
        }
    }
}

impl TryFrom<String> for AttendanceStatus {
    type Error = UnknownAttendanceStatus;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A post owned by the notification recipient.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct OwnedPost {
    pub id: Uuid,
    pub content: Option<String>,
}

impl OwnedPost {
    /// Shortened post body shown next to a like, if the post has any text.
    pub fn snippet(&self) -> Option<String> {
        let content = self.content.as_deref()?.trim();
        if content.is_empty() {
            return None;
        }
        if content.chars().count() <= SNIPPET_MAX_CHARS {
            return Some(content.to_string());
        }
        let cut: String = content.chars().take(SNIPPET_MAX_CHARS).collect();
        Some(format!("{}…", cut.trim_end()))
    }
}

/// An event organized by the notification recipient.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct OrganizedEvent {
    pub id: Uuid,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct LikeRow {
    pub post_id: Uuid,
    pub user_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct CommentRow {
    pub id: Uuid,
    pub post_id: Uuid,
    pub user_id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct AttendanceRow {
    pub event_id: Uuid,
    pub user_id: Uuid,
    #[sqlx(try_from = "String")]
    pub status: AttendanceStatus,
    pub created_at: DateTime<Utc>,
}

/// A reaction to something the recipient owns, as fetched from the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum RawEvent {
    Like {
        row: LikeRow,
        post_snippet: Option<String>,
    },
    Comment(CommentRow),
    Attendance {
        row: AttendanceRow,
        event_title: Option<String>,
    },
}

impl RawEvent {
    pub fn source_table(&self) -> SourceTable {
        match self {
            RawEvent::Like { .. } => SourceTable::Likes,
            RawEvent::Comment(_) => SourceTable::Comments,
            RawEvent::Attendance { .. } => SourceTable::EventAttendees,
        }
    }

    pub fn actor_id(&self) -> Uuid {
        match self {
            RawEvent::Like { row, .. } => row.user_id,
            RawEvent::Comment(row) => row.user_id,
            RawEvent::Attendance { row, .. } => row.user_id,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            RawEvent::Like { row, .. } => row.created_at,
            RawEvent::Comment(row) => row.created_at,
            RawEvent::Attendance { row, .. } => row.created_at,
        }
    }
}
