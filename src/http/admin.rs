//! Administrator endpoints: domain CRUD, bulk generation, export,
//! stats. All guarded by the `X-Admin-Key` shared secret.

use super::auth::require_admin;
use super::error::ApiError;
use super::{AppState, micros_to_rfc3339};
use crate::auth::random_hex;
use crate::error::Error;
use crate::store::{DomainRow, InboxType, NewDomain, NewInbox, UpdateDomain};
use axum::Json;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;

#[derive(Debug, Deserialize)]
pub struct CreateDomainRequest {
    pub domain: String,
    pub pop3_host: Option<String>,
    pub pop3_port: Option<i64>,
    pub pop3_tls: Option<bool>,
    #[serde(default)]
    pub is_local: bool,
}

#[derive(Debug, Deserialize)]
pub struct UpdateDomainRequest {
    pub pop3_host: Option<String>,
    pub pop3_port: Option<i64>,
    pub pop3_tls: Option<bool>,
    pub is_local: Option<bool>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct DomainBody {
    pub id: String,
    pub domain: String,
    pub pop3_host: Option<String>,
    pub pop3_port: Option<i64>,
    pub pop3_tls: bool,
    pub is_local: bool,
    pub is_active: bool,
    pub inbox_count: i64,
    pub created_at: Option<String>,
}

impl DomainBody {
    fn from_row(row: DomainRow, inbox_count: i64) -> Self {
        Self {
            id: row.id.clone(),
            domain: row.domain.clone(),
            pop3_host: row.pop3_host.clone(),
            pop3_port: row.pop3_port,
            pop3_tls: row.pop3_tls != 0,
            is_local: row.is_local(),
            is_active: row.is_active(),
            inbox_count,
            created_at: micros_to_rfc3339(row.created_at),
        }
    }
}

pub async fn create_domain(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<CreateDomainRequest>,
) -> Result<(StatusCode, Json<DomainBody>), ApiError> {
    require_admin(&state, &headers)?;

    let name = req.domain.trim().to_ascii_lowercase();
    if name.is_empty() || !name.contains('.') {
        return Err(state.fail(&Error::Validation(format!("invalid domain: {name}"))));
    }
    if !req.is_local && req.pop3_host.is_none() {
        return Err(state.fail(&Error::Validation(
            "non-local domains need pop3_host coordinates".into(),
        )));
    }

    let row = state
        .store
        .create_domain(NewDomain {
            domain: name.clone(),
            pop3_host: req.pop3_host,
            pop3_port: req.pop3_port,
            pop3_tls: req.pop3_tls.unwrap_or(true),
            is_local: req.is_local,
        })
        .await
        .map_err(|e| state.fail(&e))?;

    // A new local domain should be routable without waiting for the
    // next cache refresh tick.
    if row.is_local() {
        if let Err(e) = state.domains.refresh(&state.store).await {
            tracing::warn!("domain cache refresh after create failed: {e}");
        }
    }

    state
        .store
        .audit(
            "domain_created",
            None,
            &addr.ip().to_string(),
            serde_json::json!({ "domain": name, "is_local": req.is_local }),
        )
        .await;

    Ok((StatusCode::CREATED, Json(DomainBody::from_row(row, 0))))
}

pub async fn list_domains(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<DomainBody>>, ApiError> {
    require_admin(&state, &headers)?;

    let rows = state.store.list_domains().await.map_err(|e| state.fail(&e))?;
    let counts: HashMap<String, i64> = state
        .store
        .inbox_counts_by_domain()
        .await
        .map_err(|e| state.fail(&e))?
        .into_iter()
        .map(|c| (c.domain_id, c.inbox_count))
        .collect();

    let bodies = rows
        .into_iter()
        .map(|row| {
            let count = counts.get(&row.id).copied().unwrap_or(0);
            DomainBody::from_row(row, count)
        })
        .collect();
    Ok(Json(bodies))
}

pub async fn update_domain(
    State(state): State<AppState>,
    Path(domain_id): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<UpdateDomainRequest>,
) -> Result<Json<DomainBody>, ApiError> {
    require_admin(&state, &headers)?;

    let row = state
        .store
        .update_domain(
            &domain_id,
            UpdateDomain {
                pop3_host: req.pop3_host.map(Some),
                pop3_port: req.pop3_port.map(Some),
                pop3_tls: req.pop3_tls,
                is_local: req.is_local,
                is_active: req.is_active,
            },
        )
        .await
        .map_err(|e| state.fail(&e))?;

    if let Err(e) = state.domains.refresh(&state.store).await {
        tracing::warn!("domain cache refresh after update failed: {e}");
    }

    state
        .store
        .audit(
            "domain_updated",
            None,
            &addr.ip().to_string(),
            serde_json::json!({ "domain_id": domain_id }),
        )
        .await;

    let count = state
        .store
        .active_inbox_count_for_domain(&row.id)
        .await
        .map_err(|e| state.fail(&e))?;
    Ok(Json(DomainBody::from_row(row, count)))
}

pub async fn delete_domain(
    State(state): State<AppState>,
    Path(domain_id): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_admin(&state, &headers)?;

    state
        .store
        .delete_domain(&domain_id)
        .await
        .map_err(|e| state.fail(&e))?;

    if let Err(e) = state.domains.refresh(&state.store).await {
        tracing::warn!("domain cache refresh after delete failed: {e}");
    }

    state
        .store
        .audit(
            "domain_deleted",
            None,
            &addr.ip().to_string(),
            serde_json::json!({ "domain_id": domain_id }),
        )
        .await;

    Ok(Json(serde_json::json!({ "deleted": true })))
}

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub count: u32,
    pub domain_ids: Option<Vec<String>>,
    pub ttl_seconds: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct GeneratedInbox {
    pub id: String,
    pub email: String,
}

#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    pub requested: u32,
    pub created: u32,
    pub inboxes: Vec<GeneratedInbox>,
}

/// Bulk-create generated inboxes, assigning domains round-robin.
pub async fn generate(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<GenerateRequest>,
) -> Result<(StatusCode, Json<GenerateResponse>), ApiError> {
    require_admin(&state, &headers)?;

    if req.count == 0 || req.count > 1000 {
        return Err(state.fail(&Error::Validation(
            "count must be between 1 and 1000".into(),
        )));
    }

    let domains = match &req.domain_ids {
        Some(ids) => {
            let mut selected = Vec::with_capacity(ids.len());
            for id in ids {
                let domain = state
                    .store
                    .domain_by_id(id)
                    .await
                    .map_err(|e| state.fail(&e))?
                    .ok_or_else(|| state.fail(&Error::NotFound(format!("domain {id}"))))?;
                if domain.is_active() {
                    selected.push(domain);
                }
            }
            selected
        }
        None => state
            .store
            .active_domains()
            .await
            .map_err(|e| state.fail(&e))?,
    };

    if domains.is_empty() {
        return Err(state.fail(&Error::Validation("no active domains selected".into())));
    }

    let ttl_seconds =
        i64::try_from(state.auth.clamp_ttl(req.ttl_seconds).as_secs()).unwrap_or(i64::MAX);
    let caller_ip = addr.ip().to_string();
    let mut created = Vec::new();

    for i in 0..req.count as usize {
        let domain = &domains[i % domains.len()];
        let email = format!("{}@{}", random_hex(6), domain.domain);
        let password = random_hex(9);

        let (pop3_host, pop3_port, pop3_tls) = if domain.is_local() {
            (None, None, true)
        } else {
            (
                domain.pop3_host.clone(),
                domain.pop3_port,
                domain.pop3_tls != 0,
            )
        };

        let new_inbox = NewInbox {
            email: email.clone(),
            inbox_type: InboxType::Generated.as_str().to_string(),
            pop3_host,
            pop3_port,
            pop3_tls,
            username_enc: state
                .cipher
                .encrypt(email.as_bytes())
                .map_err(|e| state.fail(&e))?,
            password_enc: state
                .cipher
                .encrypt(password.as_bytes())
                .map_err(|e| state.fail(&e))?,
            domain_id: Some(domain.id.clone()),
            created_by_ip: caller_ip.clone(),
            ttl_seconds,
        };

        match state.store.create_inbox(new_inbox).await {
            Ok(row) => created.push(GeneratedInbox {
                id: row.id,
                email: row.email,
            }),
            Err(e) => tracing::warn!(%email, "bulk generation insert failed: {e}"),
        }
    }

    let domain_ids: Vec<String> = domains.iter().map(|d| d.id.clone()).collect();
    state
        .store
        .record_bulk_generation(
            i64::from(req.count),
            i64::try_from(created.len()).unwrap_or(i64::MAX),
            &domain_ids,
            &caller_ip,
        )
        .await
        .map_err(|e| state.fail(&e))?;

    state
        .store
        .audit(
            "bulk_generation",
            None,
            &caller_ip,
            serde_json::json!({ "requested": req.count, "created": created.len() }),
        )
        .await;

    Ok((
        StatusCode::CREATED,
        Json(GenerateResponse {
            requested: req.count,
            created: u32::try_from(created.len()).unwrap_or(u32::MAX),
            inboxes: created,
        }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct ExportQuery {
    pub format: Option<String>,
}

/// Export active generated inboxes as `email:password` in the
/// requested format.
pub async fn export(
    State(state): State<AppState>,
    Query(query): Query<ExportQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    require_admin(&state, &headers)?;

    let rows = state
        .store
        .generated_inboxes_for_export()
        .await
        .map_err(|e| state.fail(&e))?;

    let mut entries = Vec::with_capacity(rows.len());
    for row in rows {
        let password = state
            .cipher
            .decrypt_string(&row.password_enc)
            .map_err(|e| state.fail(&e))?;
        entries.push((row.email, password));
    }

    let format = query.format.as_deref().unwrap_or("text");
    match format {
        "text" => {
            let body = entries
                .iter()
                .map(|(email, password)| format!("{email}:{password}"))
                .collect::<Vec<_>>()
                .join("\n");
            Ok(([("content-type", "text/plain; charset=utf-8")], body).into_response())
        }
        "csv" => {
            let mut body = String::from("email,password\n");
            for (email, password) in &entries {
                body.push_str(&format!("{email},{password}\n"));
            }
            Ok(([("content-type", "text/csv; charset=utf-8")], body).into_response())
        }
        "json" => {
            let body: Vec<serde_json::Value> = entries
                .iter()
                .map(|(email, password)| {
                    serde_json::json!({ "email": email, "password": password })
                })
                .collect();
            Ok(Json(body).into_response())
        }
        other => Err(state.fail(&Error::Validation(format!(
            "unknown export format: {other}"
        )))),
    }
}

pub async fn stats(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<crate::store::Stats>, ApiError> {
    require_admin(&state, &headers)?;
    let stats = state.store.stats().await.map_err(|e| state.fail(&e))?;
    Ok(Json(stats))
}
