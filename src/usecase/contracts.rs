use async_trait::async_trait;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::domain::actor::ActorProfile;
use crate::domain::change::TableChange;
use crate::domain::raw_event::{AttendanceRow, CommentRow, LikeRow, OrganizedEvent, OwnedPost};
use crate::repository::errors::{RepositoryError, StorageError};

/// Read-only query surface of the backend. Every method issues at most one
/// query; id-set filters are applied server side.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationSource: Send + Sync {
    async fn owned_posts(&self, user_id: Uuid, limit: i64) -> Result<Vec<OwnedPost>, RepositoryError>;
    async fn likes(&self, post_ids: &[Uuid], exclude_user: Uuid) -> Result<Vec<LikeRow>, RepositoryError>;
    async fn comments(&self, post_ids: &[Uuid], exclude_user: Uuid) -> Result<Vec<CommentRow>, RepositoryError>;
    async fn organized_events(&self, user_id: Uuid) -> Result<Vec<OrganizedEvent>, RepositoryError>;
    /// Attendance rows other than `not_going`.
    async fn event_attendees(
        &self,
        event_ids: &[Uuid],
        exclude_user: Uuid,
    ) -> Result<Vec<AttendanceRow>, RepositoryError>;
    async fn profiles(&self, actor_ids: &[Uuid]) -> Result<Vec<ActorProfile>, RepositoryError>;
}

/// Client-local string key/value storage.
#[cfg_attr(test, mockall::automock)]
pub trait LocalStorage: Send + Sync {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError>;
}

/// Stream of insert/update/delete notifications on the source tables.
pub trait ChangeFeed: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<TableChange>;
}
