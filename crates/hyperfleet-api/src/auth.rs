//! Bearer token check for the protocol routes.

use axum::extract::{Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::warn;

use crate::ApiState;
use crate::handlers::error_response;

/// The token from an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header_value: &str) -> Option<&str> {
    let token = header_value.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then_some(token)
}

/// Reject requests without the configured token. A no-op when none is set.
pub async fn require_token(State(state): State<ApiState>, request: Request, next: Next) -> Response {
    let Some(expected) = state.token.as_deref() else {
        return next.run(request).await;
    };

    let provided = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token);

    if provided == Some(expected) {
        next.run(request).await
    } else {
        warn!(path = %request.uri().path(), "rejected request without a valid token");
        error_response("missing or invalid bearer token", StatusCode::UNAUTHORIZED).into_response()
    }
}
