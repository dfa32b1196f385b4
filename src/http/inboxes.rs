//! Inbox lifecycle handlers: create, show, rotate, delete

use super::auth::require_inbox;
use super::error::ApiError;
use super::{AppState, micros_to_rfc3339};
use crate::auth::random_hex;
use crate::error::Error;
use crate::store::{InboxRow, InboxType, NewInbox};
use axum::Json;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, StatusCode};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};

#[derive(Debug, Deserialize)]
pub struct CreateInboxRequest {
    pub mode: String,
    // External mode: bring-your-own POP3 mailbox.
    pub email: Option<String>,
    pub pop3_host: Option<String>,
    pub pop3_port: Option<i64>,
    pub pop3_tls: Option<bool>,
    pub username: Option<String>,
    pub password: Option<String>,
    // Generated mode: optional pinned issuing domain.
    pub domain_id: Option<String>,
    pub ttl_seconds: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct InboxBody {
    pub id: String,
    pub email: String,
    #[serde(rename = "type")]
    pub inbox_type: String,
    pub status: String,
    pub last_seen_uid: Option<String>,
    pub ttl_seconds: i64,
    pub created_at: Option<String>,
}

impl From<InboxRow> for InboxBody {
    fn from(row: InboxRow) -> Self {
        Self {
            id: row.id,
            email: row.email,
            inbox_type: row.inbox_type,
            status: row.status,
            last_seen_uid: row.last_seen_uid,
            ttl_seconds: row.ttl_seconds,
            created_at: micros_to_rfc3339(row.created_at),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CreateInboxResponse {
    pub inbox: InboxBody,
    /// The raw bearer token. This is the only response that carries
    /// it; afterwards only its hash exists.
    pub token: String,
    pub token_expires_at: Option<String>,
}

pub async fn create(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(req): Json<CreateInboxRequest>,
) -> Result<(StatusCode, Json<CreateInboxResponse>), ApiError> {
    state
        .rate_limiter
        .check(addr.ip())
        .map_err(|e| state.fail(&e))?;

    let mode: InboxType = req.mode.parse().map_err(|e| state.fail(&e))?;
    let caller_ip = addr.ip().to_string();

    let (new_inbox, plain_password) = match mode {
        InboxType::External => (
            build_external(&state, &req, &caller_ip).map_err(|e| state.fail(&e))?,
            None,
        ),
        InboxType::Generated => {
            let (inbox, password) = build_generated(&state, &req, &caller_ip)
                .await
                .map_err(|e| state.fail(&e))?;
            (inbox, Some(password))
        }
    };

    let ttl = state.auth.clamp_ttl(req.ttl_seconds);
    let row = state
        .store
        .create_inbox(new_inbox)
        .await
        .map_err(|e| state.fail(&e))?;

    let token = state
        .auth
        .issue(&row.id, ttl, &caller_ip)
        .await
        .map_err(|e| state.fail(&e))?;

    state
        .store
        .audit(
            "inbox_created",
            Some(&row.id),
            &caller_ip,
            serde_json::json!({
                "mode": mode.as_str(),
                "email": row.email,
                "generated_password": plain_password.is_some(),
            }),
        )
        .await;

    Ok((
        StatusCode::CREATED,
        Json(CreateInboxResponse {
            token_expires_at: micros_to_rfc3339(token.expires_at),
            token: token.raw,
            inbox: row.into(),
        }),
    ))
}

fn build_external(
    state: &AppState,
    req: &CreateInboxRequest,
    caller_ip: &str,
) -> Result<NewInbox, Error> {
    let email = req
        .email
        .as_deref()
        .ok_or_else(|| Error::Validation("email is required for external inboxes".into()))?;
    validate_email(email)?;

    let host = req
        .pop3_host
        .as_deref()
        .ok_or_else(|| Error::Validation("pop3_host is required for external inboxes".into()))?;

    if state.environment.is_production() && is_forbidden_pop3_host(host) {
        return Err(Error::Validation(format!(
            "pop3_host {host} points at a private or loopback address"
        )));
    }

    let username = req
        .username
        .as_deref()
        .ok_or_else(|| Error::Validation("username is required for external inboxes".into()))?;
    let password = req
        .password
        .as_deref()
        .ok_or_else(|| Error::Validation("password is required for external inboxes".into()))?;

    Ok(NewInbox {
        email: email.to_string(),
        inbox_type: InboxType::External.as_str().to_string(),
        pop3_host: Some(host.to_string()),
        pop3_port: Some(req.pop3_port.unwrap_or(995)),
        pop3_tls: req.pop3_tls.unwrap_or(true),
        username_enc: state.cipher.encrypt(username.as_bytes())?,
        password_enc: state.cipher.encrypt(password.as_bytes())?,
        domain_id: None,
        created_by_ip: caller_ip.to_string(),
        ttl_seconds: ttl_or_default(state, req.ttl_seconds),
    })
}

async fn build_generated(
    state: &AppState,
    req: &CreateInboxRequest,
    caller_ip: &str,
) -> Result<(NewInbox, String), Error> {
    let domain = match &req.domain_id {
        Some(id) => {
            let domain = state
                .store
                .domain_by_id(id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("domain {id}")))?;
            if !domain.is_active() {
                return Err(Error::Validation(format!(
                    "domain {} is not active",
                    domain.domain
                )));
            }
            domain
        }
        None => {
            let domains = state.store.active_domains().await?;
            if domains.is_empty() {
                return Err(Error::Validation(
                    "no active domains available for generated inboxes".into(),
                ));
            }
            let pick = rand::thread_rng().gen_range(0..domains.len());
            domains[pick].clone()
        }
    };

    let email = format!("{}@{}", random_hex(6), domain.domain);
    let password = random_hex(9);

    // Locally-hosted domains receive via the SMTP receiver; others
    // carry the provider's POP3 coordinates copied onto the inbox so
    // the fetch worker never needs a domain join.
    let (pop3_host, pop3_port, pop3_tls) = if domain.is_local() {
        (None, None, true)
    } else {
        (
            domain.pop3_host.clone(),
            domain.pop3_port,
            domain.pop3_tls != 0,
        )
    };

    Ok((
        NewInbox {
            email: email.clone(),
            inbox_type: InboxType::Generated.as_str().to_string(),
            pop3_host,
            pop3_port,
            pop3_tls,
            username_enc: state.cipher.encrypt(email.as_bytes())?,
            password_enc: state.cipher.encrypt(password.as_bytes())?,
            domain_id: Some(domain.id),
            created_by_ip: caller_ip.to_string(),
            ttl_seconds: ttl_or_default(state, req.ttl_seconds),
        },
        password,
    ))
}

fn ttl_or_default(state: &AppState, requested: Option<u64>) -> i64 {
    i64::try_from(state.auth.clamp_ttl(requested).as_secs()).unwrap_or(i64::MAX)
}

pub async fn show(
    State(state): State<AppState>,
    Path(inbox_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<InboxBody>, ApiError> {
    require_inbox(&state, &headers, &inbox_id).await?;

    let row = state
        .store
        .inbox_by_id(&inbox_id)
        .await
        .map_err(|e| state.fail(&e))?
        .ok_or_else(|| state.fail(&Error::NotFound(format!("inbox {inbox_id}"))))?;

    Ok(Json(row.into()))
}

pub async fn rotate_token(
    State(state): State<AppState>,
    Path(inbox_id): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_inbox(&state, &headers, &inbox_id).await?;

    let row = state
        .store
        .inbox_by_id(&inbox_id)
        .await
        .map_err(|e| state.fail(&e))?
        .ok_or_else(|| state.fail(&Error::NotFound(format!("inbox {inbox_id}"))))?;

    let ttl = state
        .auth
        .clamp_ttl(u64::try_from(row.ttl_seconds).ok());
    let token = state
        .auth
        .rotate(&inbox_id, ttl, &addr.ip().to_string())
        .await
        .map_err(|e| state.fail(&e))?;

    state
        .store
        .audit(
            "token_rotated",
            Some(&inbox_id),
            &addr.ip().to_string(),
            serde_json::json!({}),
        )
        .await;

    Ok(Json(serde_json::json!({
        "token": token.raw,
        "token_expires_at": micros_to_rfc3339(token.expires_at),
    })))
}

pub async fn delete(
    State(state): State<AppState>,
    Path(inbox_id): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_inbox(&state, &headers, &inbox_id).await?;

    state
        .store
        .delete_inbox(&inbox_id)
        .await
        .map_err(|e| state.fail(&e))?;

    state
        .store
        .audit(
            "inbox_deleted",
            Some(&inbox_id),
            &addr.ip().to_string(),
            serde_json::json!({}),
        )
        .await;

    Ok(Json(serde_json::json!({ "deleted": true })))
}

fn validate_email(email: &str) -> Result<(), Error> {
    if email.len() > 320 {
        return Err(Error::Validation("email exceeds 320 characters".into()));
    }
    let Some((local, domain)) = email.rsplit_once('@') else {
        return Err(Error::Validation("email must contain '@'".into()));
    };
    if local.is_empty() || domain.is_empty() || !domain.contains('.') {
        return Err(Error::Validation(format!("invalid email address: {email}")));
    }
    Ok(())
}

/// SSRF guard for externally supplied POP3 hosts: loopback, private,
/// and link-local targets are rejected in production.
fn is_forbidden_pop3_host(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_unspecified()
        }
        Ok(IpAddr::V6(v6)) => v6.is_loopback() || v6.is_unspecified(),
        Err(_) => false,
    }
}
