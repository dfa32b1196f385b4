//! Token lifecycle and request authentication
//!
//! Tokens are opaque 32-byte random hex strings. The raw value
//! crosses the wire exactly once, at issue or rotate; only its
//! SHA-256 is stored, and the hash lookup is authoritative on every
//! request. A background sweep retires expired rows, but the request
//! path re-checks expiry so a lagging sweep can never extend access.

use crate::config::TokenConfig;
use crate::crypto::hash_token;
use crate::error::{Error, Result};
use crate::store::{INBOX_ACTIVE, Store, TOKEN_ACTIVE, now_micros};
use rand::RngCore;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Smallest TTL an inbox may request, in seconds.
const MIN_TTL_SECS: u64 = 60;

/// A freshly issued token. The only place the raw value ever exists.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub raw: String,
    pub expires_at: i64,
}

/// Identity attached to an authenticated request.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub token_id: String,
    pub inbox_id: String,
}

#[derive(Clone)]
pub struct AuthService {
    store: Store,
    config: TokenConfig,
}

impl AuthService {
    #[must_use]
    pub const fn new(store: Store, config: TokenConfig) -> Self {
        Self { store, config }
    }

    /// Clamp a requested TTL to the configured bounds, falling back
    /// to the default when absent.
    #[must_use]
    pub fn clamp_ttl(&self, requested_secs: Option<u64>) -> Duration {
        requested_secs.map_or(self.config.default_ttl, |secs| {
            Duration::from_secs(secs.clamp(MIN_TTL_SECS, self.config.max_ttl.as_secs()))
        })
    }

    /// Issue a fresh token for the inbox.
    pub async fn issue(
        &self,
        inbox_id: &str,
        ttl: Duration,
        issuer_ip: &str,
    ) -> Result<IssuedToken> {
        let raw = random_hex(32);
        let expires_at = expiry_after(ttl);
        self.store
            .create_token(inbox_id, &hash_token(&raw), expires_at, issuer_ip)
            .await?;
        Ok(IssuedToken { raw, expires_at })
    }

    /// Rotate: revoke every active token for the inbox, then issue
    /// the replacement. The old bearer is dead the moment this
    /// returns.
    pub async fn rotate(
        &self,
        inbox_id: &str,
        ttl: Duration,
        issuer_ip: &str,
    ) -> Result<IssuedToken> {
        let raw = random_hex(32);
        let expires_at = expiry_after(ttl);
        self.store
            .rotate_token(inbox_id, &hash_token(&raw), expires_at, issuer_ip)
            .await?;
        Ok(IssuedToken { raw, expires_at })
    }

    /// Request-path authentication state machine.
    ///
    /// Each rejection maps to the documented error kind and leaves no
    /// side effects on the store.
    pub async fn authenticate(&self, bearer: Option<&str>) -> Result<AuthContext> {
        let Some(raw) = bearer else {
            return Err(Error::Authentication("missing bearer token".into()));
        };

        let Some(row) = self.store.token_auth_by_hash(&hash_token(raw)).await? else {
            return Err(Error::Authentication("unknown token".into()));
        };

        if row.status != TOKEN_ACTIVE {
            return Err(Error::Authentication(format!("token {}", row.status)));
        }

        if row.expires_at < now_micros() {
            return Err(Error::Authentication("token expired".into()));
        }

        if row.inbox_status != INBOX_ACTIVE {
            return Err(Error::Authorization("inbox inactive".into()));
        }

        Ok(AuthContext {
            token_id: row.id,
            inbox_id: row.inbox_id,
        })
    }

    /// Fire-and-forget periodic sweep of expired tokens. Failures are
    /// logged, never escalated.
    #[must_use]
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let store = self.store.clone();
        let interval = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match store.sweep_expired_tokens(now_micros()).await {
                    Ok(0) => {}
                    Ok(swept) => debug!(swept, "expired tokens swept"),
                    Err(e) => warn!("token sweep failed: {e}"),
                }
            }
        })
    }
}

fn expiry_after(ttl: Duration) -> i64 {
    now_micros() + i64::try_from(ttl.as_micros()).unwrap_or(i64::MAX)
}

/// `n_bytes` of OS randomness as lowercase hex.
#[must_use]
pub fn random_hex(n_bytes: usize) -> String {
    let mut buf = vec![0u8; n_bytes];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}
