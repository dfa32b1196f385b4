//! Append-only audit trail
//!
//! Written alongside state changes, never read on the hot path. A
//! failed write is logged and swallowed so it can never fail the
//! request that produced it.

use super::{Store, now_micros};
use uuid::Uuid;

impl Store {
    pub async fn audit(
        &self,
        event: &str,
        inbox_id: Option<&str>,
        actor_ip: &str,
        metadata: serde_json::Value,
    ) {
        let result = sqlx::query(
            "INSERT INTO audit_logs (id, event, inbox_id, actor_ip, metadata, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(event)
        .bind(inbox_id)
        .bind(actor_ip)
        .bind(metadata.to_string())
        .bind(now_micros())
        .execute(self.pool())
        .await;

        if let Err(e) = result {
            tracing::warn!(event, "audit write failed: {e}");
        }
    }
}
