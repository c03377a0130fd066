use std::time::Duration;

use sqlx::postgres::{PgListener, PgPoolOptions};
use sqlx::PgPool;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::{
    domain::actor::ActorProfile,
    domain::change::{ChangeOperation, TableChange},
    domain::raw_event::{AttendanceRow, CommentRow, LikeRow, OrganizedEvent, OwnedPost, SourceTable},
    repository::errors::RepositoryError,
    usecase::contracts::{ChangeFeed, NotificationSource},
};

/// Channel the change trigger in `migrations/` notifies on.
pub const CHANGE_CHANNEL: &str = "notifeed_changes";

const CHANGE_BUFFER: usize = 256;
const LISTENER_RETRY_DELAY: Duration = Duration::from_secs(1);

pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}

pub struct PostgresNotificationSource {
    pool: PgPool,
}

impl PostgresNotificationSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl NotificationSource for PostgresNotificationSource {
    #[tracing::instrument(skip(self), fields(%user_id, %limit))]
    async fn owned_posts(&self, user_id: Uuid, limit: i64) -> Result<Vec<OwnedPost>, RepositoryError> {
        let posts = sqlx::query_as::<_, OwnedPost>(
            r#"
            SELECT id, content
            FROM posts
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        tracing::debug!(count = posts.len(), "owned posts loaded");
        Ok(posts)
    }

    #[tracing::instrument(skip(self, post_ids), fields(posts = post_ids.len(), %exclude_user))]
    async fn likes(&self, post_ids: &[Uuid], exclude_user: Uuid) -> Result<Vec<LikeRow>, RepositoryError> {
        let likes = sqlx::query_as::<_, LikeRow>(
            r#"
            SELECT post_id, user_id, created_at
            FROM likes
            WHERE post_id = ANY($1) AND user_id <> $2
            "#,
        )
        .bind(post_ids)
        .bind(exclude_user)
        .fetch_all(&self.pool)
        .await?;

        tracing::debug!(count = likes.len(), "likes loaded");
        Ok(likes)
    }

    #[tracing::instrument(skip(self, post_ids), fields(posts = post_ids.len(), %exclude_user))]
    async fn comments(&self, post_ids: &[Uuid], exclude_user: Uuid) -> Result<Vec<CommentRow>, RepositoryError> {
        let comments = sqlx::query_as::<_, CommentRow>(
            r#"
            SELECT id, post_id, user_id, content, created_at
            FROM comments
            WHERE post_id = ANY($1) AND user_id <> $2
            "#,
        )
        .bind(post_ids)
        .bind(exclude_user)
        .fetch_all(&self.pool)
        .await?;

        tracing::debug!(count = comments.len(), "comments loaded");
        Ok(comments)
    }

    #[tracing::instrument(skip(self), fields(%user_id))]
    async fn organized_events(&self, user_id: Uuid) -> Result<Vec<OrganizedEvent>, RepositoryError> {
        let events = sqlx::query_as::<_, OrganizedEvent>(
            r#"
            SELECT id, title
            FROM events
            WHERE organizer_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        tracing::debug!(count = events.len(), "organized events loaded");
        Ok(events)
    }

    #[tracing::instrument(skip(self, event_ids), fields(events = event_ids.len(), %exclude_user))]
    async fn event_attendees(
        &self,
        event_ids: &[Uuid],
        exclude_user: Uuid,
    ) -> Result<Vec<AttendanceRow>, RepositoryError> {
        let attendees = sqlx::query_as::<_, AttendanceRow>(
            r#"
            SELECT event_id, user_id, status, created_at
            FROM event_attendees
            WHERE event_id = ANY($1) AND user_id <> $2 AND status <> 'not_going'
            "#,
        )
        .bind(event_ids)
        .bind(exclude_user)
        .fetch_all(&self.pool)
        .await?;

        tracing::debug!(count = attendees.len(), "event attendees loaded");
        Ok(attendees)
    }

    #[tracing::instrument(skip(self, actor_ids), fields(actors = actor_ids.len()))]
    async fn profiles(&self, actor_ids: &[Uuid]) -> Result<Vec<ActorProfile>, RepositoryError> {
        let profiles = sqlx::query_as::<_, ActorProfile>(
            r#"
            SELECT id, first_name, last_name, username, avatar_url
            FROM profiles
            WHERE id = ANY($1)
            "#,
        )
        .bind(actor_ids)
        .fetch_all(&self.pool)
        .await?;

        tracing::debug!(count = profiles.len(), "profiles loaded");
        Ok(profiles)
    }
}

/// Fans `LISTEN notifeed_changes` out to every live refresh subscriber.
pub struct PgChangeFeed {
    sender: broadcast::Sender<TableChange>,
}

impl PgChangeFeed {
    /// Connects a dedicated listener connection and spawns the task that
    /// forwards notifications. The task reconnects on its own.
    pub async fn listen(pool: &PgPool) -> Result<(Self, JoinHandle<()>), RepositoryError> {
        let mut listener = PgListener::connect_with(pool).await?;
        listener.listen(CHANGE_CHANNEL).await?;
        tracing::info!(channel = CHANGE_CHANNEL, "listening for table changes");

        let (sender, _) = broadcast::channel(CHANGE_BUFFER);
        let forwarder = ChangeForwarder {
            sender: sender.clone(),
        };

        let task = tokio::spawn(async move {
            let mut recovering = false;
            loop {
                if recovering {
                    // Any statement forces the listener to reconnect and
                    // re-subscribe before we announce the catch-up.
                    match sqlx::query("SELECT 1").execute(&mut listener).await {
                        Ok(_) => {
                            recovering = false;
                            forwarder.forward(ListenerEvent::Reconnected);
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "change listener reconnect failed, retrying");
                            tokio::time::sleep(LISTENER_RETRY_DELAY).await;
                            continue;
                        }
                    }
                }

                match listener.try_recv().await {
                    Ok(Some(notification)) => {
                        forwarder.forward(ListenerEvent::Payload(notification.payload()));
                    }
                    Ok(None) => {
                        forwarder.forward(ListenerEvent::ConnectionLost);
                        recovering = true;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "change listener failed, retrying");
                        recovering = true;
                        tokio::time::sleep(LISTENER_RETRY_DELAY).await;
                    }
                }
            }
        });

        Ok((Self { sender }, task))
    }
}

enum ListenerEvent<'a> {
    Payload(&'a str),
    ConnectionLost,
    Reconnected,
}

/// Turns listener events into table changes. Notifications sent while the
/// connection was down are gone, so losing and regaining it both publish a
/// synthetic change that makes every session refetch.
struct ChangeForwarder {
    sender: broadcast::Sender<TableChange>,
}

impl ChangeForwarder {
    fn forward(&self, event: ListenerEvent<'_>) {
        let change = match event {
            ListenerEvent::Payload(payload) => match parse_change(payload) {
                Some(change) => change,
                None => {
                    tracing::warn!(payload, "ignoring malformed change notification");
                    return;
                }
            },
            ListenerEvent::ConnectionLost => {
                tracing::warn!("change listener connection lost, requesting catch-up refresh");
                catch_up_change()
            }
            ListenerEvent::Reconnected => {
                tracing::info!("change listener reconnected, requesting catch-up refresh");
                catch_up_change()
            }
        };
        // No receivers just means no session is signed in.
        let _ = self.sender.send(change);
    }
}

fn catch_up_change() -> TableChange {
    TableChange {
        table: SourceTable::Likes,
        operation: ChangeOperation::Update,
    }
}

impl ChangeFeed for PgChangeFeed {
    fn subscribe(&self) -> broadcast::Receiver<TableChange> {
        self.sender.subscribe()
    }
}

fn parse_change(payload: &str) -> Option<TableChange> {
    serde_json::from_str(payload).ok()
}
