//! Token persistence
//!
//! Only token hashes are stored. Rotation revokes every active token
//! for the inbox and issues the replacement inside one transaction,
//! so at most one token is active per inbox afterwards.

use super::{Store, TOKEN_ACTIVE, TOKEN_EXPIRED, TOKEN_REVOKED, now_micros};
use crate::error::{Error, Result};
use uuid::Uuid;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TokenRow {
    pub id: String,
    pub inbox_id: String,
    pub token_hash: String,
    pub status: String,
    pub expires_at: i64,
    pub issued_by_ip: String,
    pub created_at: i64,
    pub revoked_at: Option<i64>,
}

/// Token row joined with its inbox status, for request-path
/// authentication.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TokenAuthRow {
    pub id: String,
    pub inbox_id: String,
    pub status: String,
    pub expires_at: i64,
    pub inbox_status: String,
}

impl Store {
    /// Insert a new active token for the inbox.
    pub async fn create_token(
        &self,
        inbox_id: &str,
        token_hash: &str,
        expires_at: i64,
        issued_by_ip: &str,
    ) -> Result<TokenRow> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO tokens (id, inbox_id, token_hash, status, expires_at, issued_by_ip, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(inbox_id)
        .bind(token_hash)
        .bind(TOKEN_ACTIVE)
        .bind(expires_at)
        .bind(issued_by_ip)
        .bind(now_micros())
        .execute(self.pool())
        .await?;

        self.token_by_id(&id)
            .await?
            .ok_or_else(|| Error::Internal("token vanished after insert".into()))
    }

    async fn token_by_id(&self, id: &str) -> Result<Option<TokenRow>> {
        let row = sqlx::query_as::<_, TokenRow>("SELECT * FROM tokens WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row)
    }

    /// Revoke every active token for the inbox. Returns how many were
    /// revoked.
    pub async fn revoke_active_tokens(&self, inbox_id: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE tokens SET status = ?, revoked_at = ? WHERE inbox_id = ? AND status = ?",
        )
        .bind(TOKEN_REVOKED)
        .bind(now_micros())
        .bind(inbox_id)
        .bind(TOKEN_ACTIVE)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }

    /// Rotate: revoke all active tokens and create the replacement in
    /// one transaction.
    pub async fn rotate_token(
        &self,
        inbox_id: &str,
        token_hash: &str,
        expires_at: i64,
        issued_by_ip: &str,
    ) -> Result<TokenRow> {
        let id = Uuid::new_v4().to_string();
        let now = now_micros();
        let mut tx = self.pool().begin().await?;

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
            "INSERT INTO tokens (id, inbox_id, token_hash, status, expires_at, issued_by_ip, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(inbox_id)
        .bind(token_hash)
        .bind(TOKEN_ACTIVE)
        .bind(expires_at)
        .bind(issued_by_ip)
        .bind(now)
        .execute(tx.as_mut())
        .await?;

        tx.commit().await?;

        self.token_by_id(&id)
            .await?
            .ok_or_else(|| Error::Internal("token vanished after rotate".into()))
    }

    /// Lookup by hash for the request path, joined with the inbox
    /// status so the auth state machine needs a single round trip.
    pub async fn token_auth_by_hash(&self, token_hash: &str) -> Result<Option<TokenAuthRow>> {
        let row = sqlx::query_as::<_, TokenAuthRow>(
            "SELECT t.id, t.inbox_id, t.status, t.expires_at, i.status AS inbox_status \
             FROM tokens t \
             JOIN inboxes i ON i.id = t.inbox_id \
             WHERE t.token_hash = ?",
        )
        .bind(token_hash)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    /// Background sweep: flip active-but-expired tokens to `expired`.
    /// Returns how many were swept.
    pub async fn sweep_expired_tokens(&self, now: i64) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE tokens SET status = ? WHERE status = ? AND expires_at < ?",
        )
        .bind(TOKEN_EXPIRED)
        .bind(TOKEN_ACTIVE)
        .bind(now)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }

    /// Active token count for one inbox; used by tests to verify the
    /// single-active-token invariant after rotate.
    pub async fn active_token_count(&self, inbox_id: &str) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM tokens WHERE inbox_id = ? AND status = 'active'",
        )
        .bind(inbox_id)
        .fetch_one(self.pool())
        .await?;
        Ok(count)
    }
}
