//! Inbox persistence

use super::{INBOX_ACTIVE, INBOX_DELETED, Store, TOKEN_ACTIVE, TOKEN_REVOKED, now_micros};
use crate::error::{Error, Result};
use serde::Serialize;
use uuid::Uuid;

/// A row in `inboxes`. Credential blobs are opaque ciphertext and
/// are blanked when the inbox is deleted.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct InboxRow {
    pub id: String,
    pub email: String,
    pub inbox_type: String,
    pub status: String,
    pub pop3_host: Option<String>,
    pub pop3_port: Option<i64>,
    pub pop3_tls: i64,
    pub username_enc: String,
    pub password_enc: String,
    pub last_seen_uid: Option<String>,
    pub domain_id: Option<String>,
    pub created_by_ip: String,
    pub ttl_seconds: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
}

impl InboxRow {
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == INBOX_ACTIVE
    }

    #[must_use]
    pub const fn uses_tls(&self) -> bool {
        self.pop3_tls != 0
    }
}

/// Input for inbox creation. Credentials arrive already encrypted.
#[derive(Debug, Clone)]
pub struct NewInbox {
    pub email: String,
    pub inbox_type: String,
    pub pop3_host: Option<String>,
    pub pop3_port: Option<i64>,
    pub pop3_tls: bool,
    pub username_enc: String,
    pub password_enc: String,
    pub domain_id: Option<String>,
    pub created_by_ip: String,
    pub ttl_seconds: i64,
}

/// Per-type inbox counters used by domain listings.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DomainInboxCount {
    pub domain_id: String,
    pub inbox_count: i64,
}

impl Store {
    /// Insert a new inbox as `active` and return the stored row.
    pub async fn create_inbox(&self, new: NewInbox) -> Result<InboxRow> {
        let id = Uuid::new_v4().to_string();
        let now = now_micros();

        sqlx::query(
            "INSERT INTO inboxes \
             (id, email, inbox_type, status, pop3_host, pop3_port, pop3_tls, \
              username_enc, password_enc, last_seen_uid, domain_id, created_by_ip, \
              ttl_seconds, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&new.email)
        .bind(&new.inbox_type)
        .bind(INBOX_ACTIVE)
        .bind(&new.pop3_host)
        .bind(new.pop3_port)
        .bind(i64::from(new.pop3_tls))
        .bind(&new.username_enc)
        .bind(&new.password_enc)
        .bind(&new.domain_id)
        .bind(&new.created_by_ip)
        .bind(new.ttl_seconds)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.inbox_by_id(&id)
            .await?
            .ok_or_else(|| Error::Internal("inbox vanished after insert".into()))
    }

    pub async fn inbox_by_id(&self, id: &str) -> Result<Option<InboxRow>> {
        let row = sqlx::query_as::<_, InboxRow>("SELECT * FROM inboxes WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row)
    }

    /// Case-insensitive lookup of an active inbox by address; used by
    /// the SMTP receiver's RCPT gate.
    pub async fn active_inbox_by_email(&self, email: &str) -> Result<Option<InboxRow>> {
        let row = sqlx::query_as::<_, InboxRow>(
            "SELECT * FROM inboxes WHERE lower(email) = lower(?) AND status = 'active'",
        )
        .bind(email)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    /// Conditionally advance the fetch cursor.
    ///
    /// The update only applies while `last_seen_uid` still holds the
    /// value observed when the job started, so concurrent jobs can
    /// never regress the cursor. Returns whether the advance won.
    pub async fn advance_last_seen_uid(
        &self,
        inbox_id: &str,
        observed: Option<&str>,
        new_uid: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE inboxes SET last_seen_uid = ?, updated_at = ? \
             WHERE id = ? AND last_seen_uid IS ?",
        )
        .bind(new_uid)
        .bind(now_micros())
        .bind(inbox_id)
        .bind(observed)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Hard-delete an inbox and everything it owns, in one
    /// transaction: attachments, messages, token revocation, then the
    /// tombstone with blanked credential blobs.
    pub async fn delete_inbox(&self, inbox_id: &str) -> Result<()> {
        let now = now_micros();
        let mut tx = self.pool().begin().await?;

        sqlx::query("DELETE FROM attachments WHERE inbox_id = ?")
            .bind(inbox_id)
            .execute(tx.as_mut())
            .await?;

        sqlx::query("DELETE FROM messages WHERE inbox_id = ?")
            .bind(inbox_id)
            .execute(tx.as_mut())
            .await?;

        sqlx::query(
            "UPDATE tokens SET status = ?, revoked_at = ? WHERE inbox_id = ? AND status = ?",
        )
        .bind(TOKEN_REVOKED)
        .bind(now)
        .bind(inbox_id)
        .bind(TOKEN_ACTIVE)
        .execute(tx.as_mut())
        .await?;

        sqlx::query(
            "UPDATE inboxes SET status = ?, username_enc = '', password_enc = '', \
             deleted_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(INBOX_DELETED)
        .bind(now)
        .bind(now)
        .bind(inbox_id)
        .execute(tx.as_mut())
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Active generated inboxes with their encrypted passwords, for
    /// the admin export.
    pub async fn generated_inboxes_for_export(&self) -> Result<Vec<InboxRow>> {
        let rows = sqlx::query_as::<_, InboxRow>(
            "SELECT * FROM inboxes \
             WHERE inbox_type = 'generated' AND status = 'active' \
             ORDER BY created_at",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// Count of non-deleted inboxes per domain.
    pub async fn inbox_counts_by_domain(&self) -> Result<Vec<DomainInboxCount>> {
        let rows = sqlx::query_as::<_, DomainInboxCount>(
            "SELECT domain_id, COUNT(*) AS inbox_count FROM inboxes \
             WHERE domain_id IS NOT NULL AND status != 'deleted' \
             GROUP BY domain_id",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// Count of active inboxes referencing one domain; guards domain
    /// deletion.
    pub async fn active_inbox_count_for_domain(&self, domain_id: &str) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM inboxes WHERE domain_id = ? AND status = 'active'",
        )
        .bind(domain_id)
        .fetch_one(self.pool())
        .await?;
        Ok(count)
    }
}
