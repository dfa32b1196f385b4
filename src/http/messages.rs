//! Message listing and attachment download handlers

use super::auth::require_inbox;
use super::error::ApiError;
use super::{AppState, micros_to_rfc3339};
use crate::error::Error;
use crate::fetch::FetchJob;
use crate::mime::Recipient;
use crate::store::{AttachmentMeta, MessageWithAttachments};
use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tracing::warn;

const DEFAULT_PAGE: i64 = 50;
const MAX_PAGE: i64 = 200;

static CHECKSUM_HEADER: HeaderName = HeaderName::from_static("x-checksum-sha256");

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub since_uid: Option<String>,
    pub limit: Option<i64>,
    pub fetch_new: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct AttachmentBody {
    pub id: String,
    pub filename: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub content_id: Option<String>,
    pub checksum: String,
}

impl From<AttachmentMeta> for AttachmentBody {
    fn from(meta: AttachmentMeta) -> Self {
        Self {
            id: meta.id,
            filename: meta.filename,
            content_type: meta.content_type,
            size_bytes: meta.size_bytes,
            content_id: meta.content_id,
            checksum: meta.checksum,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MessageBody {
    pub uid: String,
    pub message_id: Option<String>,
    pub sender: String,
    pub recipients: Vec<Recipient>,
    pub subject: String,
    pub body_text: String,
    pub body_html: String,
    pub headers: serde_json::Value,
    pub size_bytes: i64,
    pub received_at: Option<String>,
    pub fetched_at: Option<String>,
    pub attachments: Vec<AttachmentBody>,
}

impl From<MessageWithAttachments> for MessageBody {
    fn from(item: MessageWithAttachments) -> Self {
        let m = item.message;
        Self {
            uid: m.uid,
            message_id: m.message_id,
            sender: m.sender,
            recipients: serde_json::from_str(&m.recipients).unwrap_or_default(),
            subject: m.subject,
            body_text: m.body_text,
            body_html: m.body_html,
            headers: serde_json::from_str(&m.headers)
                .unwrap_or_else(|_| serde_json::json!({})),
            size_bytes: m.size_bytes,
            received_at: m.received_at.and_then(micros_to_rfc3339_opt),
            fetched_at: micros_to_rfc3339(m.fetched_at),
            attachments: item.attachments.into_iter().map(Into::into).collect(),
        }
    }
}

fn micros_to_rfc3339_opt(micros: i64) -> Option<String> {
    micros_to_rfc3339(micros)
}

#[derive(Debug, Serialize)]
pub struct ListResponse {
    pub messages: Vec<MessageBody>,
    pub count: usize,
    pub last_seen_uid: Option<String>,
}

/// `GET /v1/inboxes/{id}/messages`
///
/// Optionally triggers a fetch first. A POP3-side failure degrades
/// to the cached set with a warning; it never fails the request.
pub async fn list(
    State(state): State<AppState>,
    Path(inbox_id): Path<String>,
    Query(query): Query<ListQuery>,
    headers: HeaderMap,
) -> Result<Json<ListResponse>, ApiError> {
    require_inbox(&state, &headers, &inbox_id).await?;

    if query.fetch_new.unwrap_or(true) {
        let job = FetchJob {
            inbox_id: inbox_id.clone(),
            since_uid: None,
            limit: None,
        };
        match state.fetch.fetch(job).await {
            Ok(_) => {}
            // Provider-side failures (including provider auth
            // rejections) degrade to the cached view.
            Err(e @ (Error::Pop3 { .. } | Error::Authentication(_))) => {
                warn!(inbox = %inbox_id, "fetch failed; serving cached messages: {e}");
            }
            Err(e) => return Err(state.fail(&e)),
        }
    }

    let limit = query.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);
    let items = state
        .store
        .messages_after(&inbox_id, query.since_uid.as_deref(), limit)
        .await
        .map_err(|e| state.fail(&e))?;

    let cursor = state
        .store
        .inbox_by_id(&inbox_id)
        .await
        .map_err(|e| state.fail(&e))?
        .and_then(|row| row.last_seen_uid);

    let messages: Vec<MessageBody> = items.into_iter().map(Into::into).collect();
    Ok(Json(ListResponse {
        count: messages.len(),
        last_seen_uid: cursor,
        messages,
    }))
}

/// `GET /v1/inboxes/{id}/messages/{uid}/attachments/{attachment_id}`
///
/// Binary download with content type, disposition, and checksum
/// headers.
pub async fn download_attachment(
    State(state): State<AppState>,
    Path((inbox_id, uid, attachment_id)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    require_inbox(&state, &headers, &inbox_id).await?;

    let attachment = state
        .store
        .attachment_for_download(&inbox_id, &uid, &attachment_id)
        .await
        .map_err(|e| state.fail(&e))?
        .ok_or_else(|| state.fail(&Error::NotFound(format!("attachment {attachment_id}"))))?;

    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_str(&attachment.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    let disposition = format!(
        "attachment; filename=\"{}\"",
        sanitize_filename(&attachment.filename)
    );
    response_headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&disposition)
            .unwrap_or_else(|_| HeaderValue::from_static("attachment")),
    );
    response_headers.insert(
        CHECKSUM_HEADER.clone(),
        HeaderValue::from_str(&attachment.checksum)
            .unwrap_or_else(|_| HeaderValue::from_static("")),
    );

    Ok((response_headers, attachment.content).into_response())
}

/// Strip quotes and control characters so the filename is always a
/// valid quoted-string in the Content-Disposition header.
fn sanitize_filename(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_control() && *c != '"' && *c != '\\')
        .collect()
}
