//! Relational store
//!
//! Owner of the transactional boundary. All persistence goes through
//! [`Store`], a thin handle over a SQLite pool configured with WAL
//! and enforced foreign keys. Timestamps are unix microseconds;
//! `fetched_at` values come from a process-wide monotonic clock so
//! the pagination cursor never ties or runs backwards.

mod audit;
mod domains;
mod inboxes;
mod messages;
mod tokens;

pub use domains::{DomainRow, NewDomain, UpdateDomain};
pub use inboxes::{InboxRow, NewInbox};
pub use messages::{AttachmentMeta, AttachmentRow, MessageRow, MessageWithAttachments};
pub use tokens::{TokenAuthRow, TokenRow};

use crate::error::Result;
use chrono::Utc;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// Inbox modality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboxType {
    External,
    Generated,
}

impl InboxType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::External => "external",
            Self::Generated => "generated",
        }
    }
}

impl FromStr for InboxType {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "external" => Ok(Self::External),
            "generated" => Ok(Self::Generated),
            other => Err(crate::error::Error::Validation(format!(
                "Invalid inbox mode: {other}"
            ))),
        }
    }
}

pub const INBOX_ACTIVE: &str = "active";
pub const INBOX_SUSPENDED: &str = "suspended";
pub const INBOX_DELETED: &str = "deleted";

pub const TOKEN_ACTIVE: &str = "active";
pub const TOKEN_REVOKED: &str = "revoked";
pub const TOKEN_EXPIRED: &str = "expired";

/// Aggregate counters for the admin stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub inboxes_total: i64,
    pub inboxes_active: i64,
    pub inboxes_generated: i64,
    pub inboxes_external: i64,
    pub messages_total: i64,
    pub attachments_total: i64,
    pub tokens_active: i64,
    pub domains_active: i64,
}

/// Handle over the database pool. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Connect to the configured database and run migrations.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(sqlx::Error::from)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5))
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .foreign_keys(true)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// In-memory store for tests and tooling. Uses a single pooled
    /// connection so the database outlives individual acquires.
    pub async fn connect_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(sqlx::Error::from)?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| crate::error::Error::Internal(format!("migration failed: {e}")))?;
        Ok(())
    }

    /// Liveness probe used by `/ready`.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn stats(&self) -> Result<Stats> {
        let count = |sql: &'static str| {
            let pool = self.pool.clone();
            async move {
                sqlx::query_scalar::<_, i64>(sql)
                    .fetch_one(&pool)
                    .await
            }
        };

        Ok(Stats {
            inboxes_total: count("SELECT COUNT(*) FROM inboxes").await?,
            inboxes_active: count("SELECT COUNT(*) FROM inboxes WHERE status = 'active'").await?,
            inboxes_generated: count(
                "SELECT COUNT(*) FROM inboxes WHERE inbox_type = 'generated' AND status != 'deleted'",
            )
            .await?,
            inboxes_external: count(
                "SELECT COUNT(*) FROM inboxes WHERE inbox_type = 'external' AND status != 'deleted'",
            )
            .await?,
            messages_total: count("SELECT COUNT(*) FROM messages").await?,
            attachments_total: count("SELECT COUNT(*) FROM attachments").await?,
            tokens_active: count("SELECT COUNT(*) FROM tokens WHERE status = 'active'").await?,
            domains_active: count("SELECT COUNT(*) FROM domains WHERE is_active = 1").await?,
        })
    }

    /// Record a bulk-generation run for the admin audit trail.
    pub async fn record_bulk_generation(
        &self,
        requested: i64,
        created: i64,
        domain_ids: &[String],
        actor_ip: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO bulk_generations (id, requested, created, domain_ids, actor_ip, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(requested)
        .bind(created)
        .bind(serde_json::to_string(domain_ids)?)
        .bind(actor_ip)
        .bind(now_micros())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Close the underlying pool. Called last during shutdown.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub(crate) const fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Current wall-clock time in unix microseconds.
#[must_use]
pub fn now_micros() -> i64 {
    Utc::now().timestamp_micros()
}

static LAST_FETCHED_AT: AtomicI64 = AtomicI64::new(0);

/// Monotonic `fetched_at` assignment: never before the wall clock,
/// never twice the same value, never backwards within the process.
pub(crate) fn next_fetched_at() -> i64 {
    let now = now_micros();
    let mut prev = LAST_FETCHED_AT.load(Ordering::Relaxed);
    loop {
        let candidate = now.max(prev + 1);
        match LAST_FETCHED_AT.compare_exchange_weak(
            prev,
            candidate,
            Ordering::AcqRel,
            Ordering::Relaxed,
        ) {
            Ok(_) => return candidate,
            Err(observed) => prev = observed,
        }
    }
}
