//! HTTP surface
//!
//! Thin axum routing over the core services. Handlers validate,
//! call into the store/auth/fetch services, and map failures to the
//! documented error envelope. Serve the router with
//! `into_make_service_with_connect_info::<SocketAddr>()` so handlers
//! can see the caller's network address.

mod admin;
mod auth;
mod error;
mod inboxes;
mod messages;
mod rate_limit;

pub use error::ApiError;
pub use rate_limit::RateLimiter;

use crate::auth::AuthService;
use crate::config::Environment;
use crate::crypto::BlobCipher;
use crate::domains::LocalDomains;
use crate::error::Error;
use crate::fetch::FetchQueue;
use crate::store::Store;
use axum::Json;
use axum::extract::State;
use axum::routing::{get, post, put};
use axum::Router;
use std::sync::Arc;

/// Shared handler context. Cheap to clone; built once at startup.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub auth: AuthService,
    pub cipher: Arc<BlobCipher>,
    pub fetch: FetchQueue,
    pub domains: Arc<LocalDomains>,
    pub rate_limiter: Arc<RateLimiter>,
    pub environment: Environment,
    pub admin_key: String,
}

impl AppState {
    /// Apply the environment's masking policy to an error.
    pub(crate) fn fail(&self, e: &Error) -> ApiError {
        ApiError::new(e, self.environment)
    }
}

/// Build the full application router.
#[must_use]
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/v1/inboxes", post(inboxes::create))
        .route(
            "/v1/inboxes/{id}",
            get(inboxes::show).delete(inboxes::delete),
        )
        .route("/v1/inboxes/{id}/token:rotate", post(inboxes::rotate_token))
        .route("/v1/inboxes/{id}/messages", get(messages::list))
        .route(
            "/v1/inboxes/{id}/messages/{uid}/attachments/{attachment_id}",
            get(messages::download_attachment),
        )
        .route(
            "/v1/admin/domains",
            post(admin::create_domain).get(admin::list_domains),
        )
        .route(
            "/v1/admin/domains/{id}",
            put(admin::update_domain).delete(admin::delete_domain),
        )
        .route("/v1/admin/generate", post(admin::generate))
        .route("/v1/admin/export", get(admin::export))
        .route("/v1/admin/stats", get(admin::stats))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Liveness plus a database ping.
async fn ready(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    state.store.ping().await.map_err(|e| state.fail(&e))?;
    Ok(Json(serde_json::json!({ "status": "ready" })))
}

/// Render a stored microsecond timestamp for API responses.
pub(crate) fn micros_to_rfc3339(micros: i64) -> Option<String> {
    chrono::DateTime::from_timestamp_micros(micros).map(|dt| dt.to_rfc3339())
}
