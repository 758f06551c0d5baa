use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::error::OpsError;
use crate::state::OpsState;

/// Rejects the request with 403 before any handler runs unless it carries the
/// configured bearer token. Only lengths and the path are logged.
pub async fn require_bearer(State(state): State<OpsState>, request: Request, next: Next) -> Response {
    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(bearer_token);
    if let (Some(expected), Some(presented)) = (state.token(), presented)
        && token_matches(expected, presented)
    {
        return next.run(request).await;
    }
    tracing::warn!(
        path = %request.uri().path(),
        configured_len = state.token().map_or(0, str::len),
        presented_len = presented.map_or(0, str::len),
        "rejected ops request"
    );
    OpsError::forbidden().into_response()
}

fn bearer_token(value: &str) -> Option<&str> {
    let value = value.trim();
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Compares trimmed tokens without short-circuiting on the first mismatch.
pub fn token_matches(expected: &str, presented: &str) -> bool {
    let expected = expected.trim().as_bytes();
    let presented = presented.trim().as_bytes();
    let mut diff = expected.len() ^ presented.len();
    for index in 0..expected.len().max(presented.len()) {
        let left = expected.get(index).copied().unwrap_or(0);
        let right = presented.get(index).copied().unwrap_or(0);
        diff |= usize::from(left ^ right);
    }
    diff == 0
}
