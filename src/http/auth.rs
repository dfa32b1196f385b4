//! Request authentication helpers
//!
//! Bearer tokens go through the auth state machine in
//! [`crate::auth::AuthService`]; handlers then require the path
//! `:id` to equal the authenticated inbox. The admin key is compared
//! in constant time.

use super::AppState;
use super::error::ApiError;
use crate::auth::AuthContext;
use crate::crypto::secure_compare;
use crate::error::Error;
use axum::http::HeaderMap;

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

/// Authenticate the request and require the path inbox id to match
/// the token's inbox.
pub async fn require_inbox(
    state: &AppState,
    headers: &HeaderMap,
    path_inbox_id: &str,
) -> Result<AuthContext, ApiError> {
    let ctx = state
        .auth
        .authenticate(bearer_token(headers))
        .await
        .map_err(|e| state.fail(&e))?;

    if ctx.inbox_id != path_inbox_id {
        return Err(state.fail(&Error::Authorization(
            "token does not grant access to this inbox".into(),
        )));
    }

    Ok(ctx)
}

/// Validate the `X-Admin-Key` header against the configured secret.
pub fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let provided = headers
        .get("x-admin-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if provided.is_empty() || !secure_compare(provided, &state.admin_key) {
        return Err(state.fail(&Error::Authentication("invalid admin key".into())));
    }
    Ok(())
}
