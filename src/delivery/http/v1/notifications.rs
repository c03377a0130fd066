use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::delivery::http::v1::middleware::AuthenticatedUser;
use crate::domain::notification::{Notification, NotificationId};
use crate::domain::raw_event::SourceTable;
use crate::usecase::error::UsecaseError;
use crate::usecase::feed::FeedClosed;
use crate::{AppState, Feed};

/// Notification ids are `{table}:{key}[:{key}]`; the path segment arrives
/// percent-decoded.
#[derive(Debug, Deserialize, Validate)]
pub struct NotificationIdPath {
    #[validate(length(min = 3, max = 200), custom(function = "validate_notification_id"))]
    pub id: String,
}

fn validate_notification_id(id: &str) -> Result<(), ValidationError> {
    let mut parts = id.split(':');
    let table = parts.next().unwrap_or_default();
    let keys: Vec<&str> = parts.collect();

    let expected_keys = SourceTable::ALL
        .iter()
        .find(|t| t.as_str() == table)
        .map(|t| match t {
            SourceTable::Comments => 1,
            SourceTable::Likes | SourceTable::EventAttendees => 2,
        });

    match expected_keys {
        Some(n) if keys.len() == n && keys.iter().all(|k| !k.is_empty()) => Ok(()),
        _ => Err(ValidationError::new("notification_id")),
    }
}

impl NotificationIdPath {
    fn into_id(self) -> Result<NotificationId, UsecaseError> {
        if let Err(validation_errors) = self.validate() {
            tracing::warn!(?validation_errors, "invalid notification id");
            return Err(UsecaseError::Validation(format!("{:?}", validation_errors)));
        }
        Ok(NotificationId::from(self.id))
    }
}

/// Runs a mutation against the user's feed. A concurrent sign-out can close
/// the feed between lookup and use; that case gets one retry on a fresh
/// session before it is reported as a conflict.
async fn with_open_feed<T>(
    state: &AppState,
    user_id: Uuid,
    op: impl Fn(&Feed) -> Result<T, FeedClosed>,
) -> Result<T, UsecaseError> {
    let feed = state.sessions.sign_in(user_id).await;
    match op(&feed) {
        Ok(value) => Ok(value),
        Err(FeedClosed) => {
            tracing::debug!("feed closed during mutation, retrying on a new session");
            let feed = state.sessions.sign_in(user_id).await;
            Ok(op(&feed)?)
        }
    }
}

#[derive(Serialize)]
pub struct NotificationsListResponse {
    pub notifications: Vec<Notification>,
    pub unread_count: usize,
}

#[derive(Serialize)]
pub struct UnreadCountResponse {
    pub unread_count: usize,
}

/// Starts the session on first use, so the first call hydrates read state
/// and waits for the initial refresh.
#[tracing::instrument(skip(state), fields(user_id = %user.user_id))]
pub async fn list_notifications(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Result<impl IntoResponse, UsecaseError> {
    let feed = state.sessions.sign_in(user.user_id).await;
    let snapshot = feed.snapshot();
    tracing::debug!(count = snapshot.notifications.len(), "listing notifications");

    Ok(Json(NotificationsListResponse {
        notifications: snapshot.notifications,
        unread_count: snapshot.unread_count,
    }))
}

#[tracing::instrument(skip(state), fields(user_id = %user.user_id))]
pub async fn unread_count(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Result<impl IntoResponse, UsecaseError> {
    let feed = state.sessions.sign_in(user.user_id).await;
    Ok(Json(UnreadCountResponse {
        unread_count: feed.unread_count(),
    }))
}

#[tracing::instrument(skip(state, path), fields(user_id = %user.user_id))]
pub async fn mark_read(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(path): Path<NotificationIdPath>,
) -> Result<impl IntoResponse, UsecaseError> {
    let id = path.into_id()?;
    let changed = with_open_feed(&state, user.user_id, |feed| feed.mark_read(&id)).await?;
    tracing::debug!(notification_id = %id, changed, "notification marked as read");
    Ok(StatusCode::NO_CONTENT)
}

#[tracing::instrument(skip(state), fields(user_id = %user.user_id))]
pub async fn mark_all_read(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Result<impl IntoResponse, UsecaseError> {
    let marked = with_open_feed(&state, user.user_id, |feed| feed.mark_all_read()).await?;
    tracing::debug!(marked, "all notifications marked as read");
    Ok(StatusCode::NO_CONTENT)
}

#[tracing::instrument(skip(state, path), fields(user_id = %user.user_id))]
pub async fn dismiss(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(path): Path<NotificationIdPath>,
) -> Result<impl IntoResponse, UsecaseError> {
    let id = path.into_id()?;
    let changed = with_open_feed(&state, user.user_id, |feed| feed.dismiss(&id)).await?;
    tracing::debug!(notification_id = %id, changed, "notification dismissed");
    Ok(StatusCode::NO_CONTENT)
}

/// Schedules a refresh and returns immediately.
#[tracing::instrument(skip(state), fields(user_id = %user.user_id))]
pub async fn refresh(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Result<impl IntoResponse, UsecaseError> {
    let feed = state.sessions.sign_in(user.user_id).await;
    tokio::spawn(async move {
        if let Err(e) = feed.refresh().await {
            tracing::warn!(error = %e, "manual refresh failed");
        }
    });
    Ok(StatusCode::ACCEPTED)
}

#[tracing::instrument(skip(state), fields(user_id = %user.user_id))]
pub async fn sign_out(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Result<impl IntoResponse, UsecaseError> {
    let ended = state.sessions.sign_out(user.user_id).await;
    tracing::debug!(ended, "sign-out handled");
    Ok(StatusCode::NO_CONTENT)
}
