//! MIME parser adapter
//!
//! Normalizes raw RFC 5322 bytes into the record the store persists:
//! addressing, subject, text and HTML bodies, a header allow-list,
//! and size-capped attachments with SHA-256 checksums.

use crate::crypto::sha256_hex;
use chrono::{DateTime, Utc};
use mail_parser::{Address, HeaderValue, MessageParser, MimeHeaders};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

/// Header keys exported into the normalized header map.
const HEADER_ALLOWLIST: &[&str] = &[
    "message-id",
    "date",
    "from",
    "to",
    "cc",
    "bcc",
    "reply-to",
    "content-type",
    "x-mailer",
    "x-spam-status",
];

/// HTML bodies beyond this size are replaced with the empty string;
/// the record still parses.
const MAX_HTML_BYTES: usize = 5 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Recipient {
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ParsedAttachment {
    pub filename: String,
    pub content_type: String,
    pub size_bytes: usize,
    pub content_id: Option<String>,
    /// SHA-256 over the exact stored bytes.
    pub checksum: String,
    pub content: Vec<u8>,
}

/// Normalized message record produced from one raw message.
#[derive(Debug, Clone)]
pub struct ParsedMessage {
    pub uid: String,
    pub message_id: Option<String>,
    pub sender: String,
    pub recipients: Vec<Recipient>,
    pub subject: String,
    pub body_text: String,
    pub body_html: String,
    pub headers: BTreeMap<String, String>,
    pub size_bytes: usize,
    pub received_at: Option<DateTime<Utc>>,
    pub attachments: Vec<ParsedAttachment>,
    /// Attachments dropped for exceeding the per-attachment cap.
    pub dropped_attachments: usize,
}

/// Parse raw message bytes into a normalized record.
///
/// Never fails: unparseable input produces an empty record that still
/// carries the uid and exact byte length, so ingestion stays
/// idempotent even for garbage messages.
#[must_use]
pub fn parse_message(uid: &str, raw: &[u8], max_attachment_bytes: usize) -> ParsedMessage {
    let size_bytes = raw.len();

    let Some(message) = MessageParser::default().parse(raw) else {
        warn!(uid, size_bytes, "message did not parse; storing empty record");
        return ParsedMessage {
            uid: uid.to_string(),
            message_id: None,
            sender: String::new(),
            recipients: Vec::new(),
            subject: String::new(),
            body_text: String::new(),
            body_html: String::new(),
            headers: BTreeMap::new(),
            size_bytes,
            received_at: None,
            attachments: Vec::new(),
            dropped_attachments: 0,
        };
    };

    let sender = message
        .from()
        .and_then(|a| a.first())
        .map(format_addr)
        .unwrap_or_default();

    let recipients = message
        .to()
        .map(|addrs| {
            addrs
                .iter()
                .map(|a| Recipient {
                    address: a.address.as_deref().unwrap_or_default().to_string(),
                    name: a.name.as_deref().map(ToString::to_string),
                })
                .collect()
        })
        .unwrap_or_default();

    let mut headers = BTreeMap::new();
    for header in message.headers() {
        let name = header.name.as_str().to_ascii_lowercase();
        if HEADER_ALLOWLIST.contains(&name.as_str()) {
            headers.insert(name, header_value_string(&header.value));
        }
    }

    let body_text = if message.text_body.is_empty() {
        String::new()
    } else {
        message
            .body_text(0)
            .map(|t| t.to_string())
            .unwrap_or_default()
    };

    let body_html = if message.html_body.is_empty() {
        String::new()
    } else {
        let html = message
            .body_html(0)
            .map(|h| h.to_string())
            .unwrap_or_default();
        if html.len() > MAX_HTML_BYTES {
            warn!(uid, html_bytes = html.len(), "HTML body over limit; dropped");
            String::new()
        } else {
            html
        }
    };

    let mut attachments = Vec::new();
    let mut dropped_attachments = 0usize;
    for part in message.attachments() {
        let content = part.contents();
        if content.len() > max_attachment_bytes {
            dropped_attachments += 1;
            continue;
        }
        attachments.push(ParsedAttachment {
            filename: part
                .attachment_name()
                .unwrap_or("unnamed")
                .to_string(),
            content_type: part.content_type().map_or_else(
                || "application/octet-stream".to_string(),
                |ct| match &ct.c_subtype {
                    Some(sub) => format!("{}/{}", ct.c_type, sub),
                    None => ct.c_type.to_string(),
                },
            ),
            size_bytes: content.len(),
            content_id: part.content_id().map(ToString::to_string),
            checksum: sha256_hex(content),
            content: content.to_vec(),
        });
    }
    if dropped_attachments > 0 {
        warn!(
            uid,
            dropped_attachments, max_attachment_bytes, "oversize attachments dropped"
        );
    }

    ParsedMessage {
        uid: uid.to_string(),
        message_id: message.message_id().map(ToString::to_string),
        sender,
        recipients,
        subject: message.subject().unwrap_or_default().to_string(),
        body_text,
        body_html,
        headers,
        size_bytes,
        received_at: message
            .date()
            .and_then(|d| DateTime::<Utc>::from_timestamp(d.to_timestamp(), 0)),
        attachments,
        dropped_attachments,
    }
}

fn format_addr(addr: &mail_parser::Addr<'_>) -> String {
    let address = addr.address.as_deref().unwrap_or_default();
    match addr.name.as_deref() {
        Some(name) if !name.is_empty() => format!("{name} <{address}>"),
        _ => address.to_string(),
    }
}

fn format_address_list(addrs: &Address<'_>) -> String {
    addrs
        .iter()
        .map(format_addr)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Coerce a structured header value to a flat string.
fn header_value_string(value: &HeaderValue<'_>) -> String {
    match value {
        HeaderValue::Address(addrs) => format_address_list(addrs),
        HeaderValue::Text(t) => t.to_string(),
        HeaderValue::TextList(list) => list.join(", "),
        HeaderValue::DateTime(dt) => dt.to_rfc3339(),
        HeaderValue::ContentType(ct) => match &ct.c_subtype {
            Some(sub) => format!("{}/{}", ct.c_type, sub),
            None => ct.c_type.to_string(),
        },
        HeaderValue::Received(_) | HeaderValue::Empty => String::new(),
    }
}
