use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

use crate::AppState;

#[derive(Clone, Debug)]
pub struct AuthenticatedUser {
    pub user_id: Uuid,
    pub email: Option<String>,
}

pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, (StatusCode, String)> {
    let token = request
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|header| header.strip_prefix("Bearer "));

    let Some(token) = token else {
        tracing::warn!("missing or invalid authorization header");
        return Err((
            StatusCode::UNAUTHORIZED,
            "Missing or invalid Authorization header".to_string(),
        ));
    };

    let claims = state.jwt_service.validate_token(token).map_err(|e| {
        tracing::warn!(error = %e, "invalid token");
        (StatusCode::UNAUTHORIZED, format!("Invalid token: {}", e))
    })?;

    let authenticated_user = AuthenticatedUser {
        user_id: claims.sub,
        email: claims.email,
    };

    tracing::debug!(
        user_id = %authenticated_user.user_id,
        email = ?authenticated_user.email,
        "user authenticated"
    );
    request.extensions_mut().insert(authenticated_user);

    Ok(next.run(request).await)
}
