//! Message and attachment persistence
//!
//! Ingestion is transactional and idempotent on `(inbox, uid)`: a
//! conflicting message is skipped silently and its attachments are
//! not written, so re-fetching the same slice is a no-op.

use super::{Store, next_fetched_at};
use crate::error::Result;
use crate::mime::ParsedMessage;
use uuid::Uuid;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MessageRow {
    pub id: String,
    pub inbox_id: String,
    pub uid: String,
    pub message_id: Option<String>,
    pub sender: String,
    /// JSON array of `{address, name}` in To-header order.
    pub recipients: String,
    pub subject: String,
    pub body_text: String,
    pub body_html: String,
    /// JSON object of allow-listed headers.
    pub headers: String,
    pub size_bytes: i64,
    pub received_at: Option<i64>,
    pub fetched_at: i64,
}

/// Attachment metadata without the payload, for message listings.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AttachmentMeta {
    pub id: String,
    pub message_id: String,
    pub filename: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub content_id: Option<String>,
    pub checksum: String,
}

/// Full attachment row including payload bytes.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AttachmentRow {
    pub id: String,
    pub message_id: String,
    pub inbox_id: String,
    pub filename: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub content_id: Option<String>,
    pub checksum: String,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct MessageWithAttachments {
    pub message: MessageRow,
    pub attachments: Vec<AttachmentMeta>,
}

impl Store {
    /// Insert parsed messages for one inbox in a single transaction.
    ///
    /// Conflicting `(inbox, uid)` rows are skipped along with their
    /// attachments. Returns the number of newly inserted messages.
    pub async fn insert_messages(
        &self,
        inbox_id: &str,
        parsed: &[ParsedMessage],
    ) -> Result<u64> {
        let mut tx = self.pool().begin().await?;
        let mut inserted = 0u64;

        for message in parsed {
            let message_row_id = Uuid::new_v4().to_string();
            let result = sqlx::query(
                "INSERT INTO messages \
                 (id, inbox_id, uid, message_id, sender, recipients, subject, \
                  body_text, body_html, headers, size_bytes, received_at, fetched_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT (inbox_id, uid) DO NOTHING",
            )
            .bind(&message_row_id)
            .bind(inbox_id)
            .bind(&message.uid)
            .bind(&message.message_id)
            .bind(&message.sender)
            .bind(serde_json::to_string(&message.recipients)?)
            .bind(&message.subject)
            .bind(&message.body_text)
            .bind(&message.body_html)
            .bind(serde_json::to_string(&message.headers)?)
            .bind(i64::try_from(message.size_bytes).unwrap_or(i64::MAX))
            .bind(message.received_at.map(|t| t.timestamp_micros()))
            .bind(next_fetched_at())
            .execute(tx.as_mut())
            .await?;

            if result.rows_affected() == 0 {
                continue;
            }
            inserted += 1;

            for attachment in &message.attachments {
                sqlx::query(
                    "INSERT INTO attachments \
                     (id, message_id, inbox_id, filename, content_type, size_bytes, \
                      content_id, checksum, content) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(Uuid::new_v4().to_string())
                .bind(&message_row_id)
                .bind(inbox_id)
                .bind(&attachment.filename)
                .bind(&attachment.content_type)
                .bind(i64::try_from(attachment.size_bytes).unwrap_or(i64::MAX))
                .bind(&attachment.content_id)
                .bind(&attachment.checksum)
                .bind(&attachment.content)
                .execute(tx.as_mut())
                .await?;
            }
        }

        tx.commit().await?;
        Ok(inserted)
    }

    /// Cursor read: messages strictly after `since_uid`'s stored
    /// `fetched_at`, ascending, with attachment metadata aggregated.
    /// An unknown or absent cursor falls back to the first page.
    pub async fn messages_after(
        &self,
        inbox_id: &str,
        since_uid: Option<&str>,
        limit: i64,
    ) -> Result<Vec<MessageWithAttachments>> {
        let after = match since_uid {
            Some(uid) => {
                sqlx::query_scalar::<_, i64>(
                    "SELECT fetched_at FROM messages WHERE inbox_id = ? AND uid = ?",
                )
                .bind(inbox_id)
                .bind(uid)
                .fetch_optional(self.pool())
                .await?
            }
            None => None,
        };

        let rows = sqlx::query_as::<_, MessageRow>(
            "SELECT * FROM messages \
             WHERE inbox_id = ? AND fetched_at > ? \
             ORDER BY fetched_at ASC LIMIT ?",
        )
        .bind(inbox_id)
        .bind(after.unwrap_or(i64::MIN))
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for message in rows {
            let attachments = self.attachments_for_message(&message.id).await?;
            out.push(MessageWithAttachments {
                message,
                attachments,
            });
        }
        Ok(out)
    }

    async fn attachments_for_message(&self, message_row_id: &str) -> Result<Vec<AttachmentMeta>> {
        let rows = sqlx::query_as::<_, AttachmentMeta>(
            "SELECT id, message_id, filename, content_type, size_bytes, content_id, checksum \
             FROM attachments WHERE message_id = ? ORDER BY id",
        )
        .bind(message_row_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// Resolve an attachment for download, scoped to the inbox and
    /// the message uid from the request path.
    pub async fn attachment_for_download(
        &self,
        inbox_id: &str,
        message_uid: &str,
        attachment_id: &str,
    ) -> Result<Option<AttachmentRow>> {
        let row = sqlx::query_as::<_, AttachmentRow>(
            "SELECT a.id, a.message_id, a.inbox_id, a.filename, a.content_type, \
                    a.size_bytes, a.content_id, a.checksum, a.content \
             FROM attachments a \
             JOIN messages m ON m.id = a.message_id \
             WHERE a.id = ? AND a.inbox_id = ? AND m.uid = ?",
        )
        .bind(attachment_id)
        .bind(inbox_id)
        .bind(message_uid)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    pub async fn message_count(&self, inbox_id: &str) -> Result<i64> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM messages WHERE inbox_id = ?")
                .bind(inbox_id)
                .fetch_one(self.pool())
                .await?;
        Ok(count)
    }

    pub async fn attachment_count(&self, inbox_id: &str) -> Result<i64> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM attachments WHERE inbox_id = ?")
                .bind(inbox_id)
                .fetch_one(self.pool())
                .await?;
        Ok(count)
    }
}
