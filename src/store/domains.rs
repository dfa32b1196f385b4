//! Issuing-domain persistence

use super::{Store, now_micros};
use crate::error::{Error, Result};
use uuid::Uuid;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DomainRow {
    pub id: String,
    pub domain: String,
    pub pop3_host: Option<String>,
    pub pop3_port: Option<i64>,
    pub pop3_tls: i64,
    pub is_local: i64,
    pub is_active: i64,
    pub created_at: i64,
}

impl DomainRow {
    #[must_use]
    pub const fn is_local(&self) -> bool {
        self.is_local != 0
    }

    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.is_active != 0
    }
}

#[derive(Debug, Clone)]
pub struct NewDomain {
    pub domain: String,
    pub pop3_host: Option<String>,
    pub pop3_port: Option<i64>,
    pub pop3_tls: bool,
    pub is_local: bool,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateDomain {
    pub pop3_host: Option<Option<String>>,
    pub pop3_port: Option<Option<i64>>,
    pub pop3_tls: Option<bool>,
    pub is_local: Option<bool>,
    pub is_active: Option<bool>,
}

impl Store {
    /// Insert a domain. A duplicate domain string is a conflict.
    pub async fn create_domain(&self, new: NewDomain) -> Result<DomainRow> {
        let id = Uuid::new_v4().to_string();

        let result = sqlx::query(
            "INSERT INTO domains (id, domain, pop3_host, pop3_port, pop3_tls, is_local, is_active, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, 1, ?)",
        )
        .bind(&id)
        .bind(new.domain.to_ascii_lowercase())
        .bind(&new.pop3_host)
        .bind(new.pop3_port)
        .bind(i64::from(new.pop3_tls))
        .bind(i64::from(new.is_local))
        .bind(now_micros())
        .execute(self.pool())
        .await;

        match result {
            Ok(_) => self
                .domain_by_id(&id)
                .await?
                .ok_or_else(|| Error::Internal("domain vanished after insert".into())),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(Error::Conflict(
                format!("domain {} already exists", new.domain),
            )),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn domain_by_id(&self, id: &str) -> Result<Option<DomainRow>> {
        let row = sqlx::query_as::<_, DomainRow>("SELECT * FROM domains WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row)
    }

    pub async fn list_domains(&self) -> Result<Vec<DomainRow>> {
        let rows = sqlx::query_as::<_, DomainRow>("SELECT * FROM domains ORDER BY domain")
            .fetch_all(self.pool())
            .await?;
        Ok(rows)
    }

    /// Active domains available for generated-inbox assignment.
    pub async fn active_domains(&self) -> Result<Vec<DomainRow>> {
        let rows = sqlx::query_as::<_, DomainRow>(
            "SELECT * FROM domains WHERE is_active = 1 ORDER BY domain",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// Lower-cased names of active locally-hosted domains; feeds the
    /// SMTP receiver's in-memory cache.
    pub async fn active_local_domain_names(&self) -> Result<Vec<String>> {
        let rows = sqlx::query_scalar::<_, String>(
            "SELECT domain FROM domains WHERE is_active = 1 AND is_local = 1",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn update_domain(&self, id: &str, update: UpdateDomain) -> Result<DomainRow> {
        let Some(current) = self.domain_by_id(id).await? else {
            return Err(Error::NotFound(format!("domain {id}")));
        };

        let pop3_host = update.pop3_host.unwrap_or(current.pop3_host);
        let pop3_port = update.pop3_port.unwrap_or(current.pop3_port);
        let pop3_tls = update.pop3_tls.map_or(current.pop3_tls, i64::from);
        let is_local = update.is_local.map_or(current.is_local, i64::from);
        let is_active = update.is_active.map_or(current.is_active, i64::from);

        sqlx::query(
            "UPDATE domains SET pop3_host = ?, pop3_port = ?, pop3_tls = ?, is_local = ?, is_active = ? \
             WHERE id = ?",
        )
        .bind(&pop3_host)
        .bind(pop3_port)
        .bind(pop3_tls)
        .bind(is_local)
        .bind(is_active)
        .bind(id)
        .execute(self.pool())
        .await?;

        self.domain_by_id(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("domain {id}")))
    }

    /// Delete a domain. Refused while active inboxes still reference
    /// it; cascading is an administrative decision, not runtime
    /// behavior.
    pub async fn delete_domain(&self, id: &str) -> Result<()> {
        if self.domain_by_id(id).await?.is_none() {
            return Err(Error::NotFound(format!("domain {id}")));
        }
        let active = self.active_inbox_count_for_domain(id).await?;
        if active > 0 {
            return Err(Error::Conflict(format!(
                "domain has {active} active inboxes"
            )));
        }

        // Tombstoned inboxes may still reference the domain; detach
        // them so the foreign key lets the row go.
        let mut tx = self.pool().begin().await?;
        sqlx::query("UPDATE inboxes SET domain_id = NULL WHERE domain_id = ?")
            .bind(id)
            .execute(tx.as_mut())
            .await?;
        sqlx::query("DELETE FROM domains WHERE id = ?")
            .bind(id)
            .execute(tx.as_mut())
            .await?;
        tx.commit().await?;
        Ok(())
    }
}
