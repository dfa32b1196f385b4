//! Pooled POP3 execution
//!
//! Callers hand the pool an account and an operation; the pool owns
//! connection lifecycle, the concurrency cap, retries with
//! exponential backoff, and per-host throttling. The semaphore is
//! fair, so over-cap callers wake in submission order.

use crate::config::Pop3PoolConfig;
use crate::error::{Error, Result};
use crate::pop3::client::{Pop3Account, Pop3Client};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Provider responses that signal connection-rate throttling. Matching
/// any of these sets the host throttle and aborts remaining retries.
const THROTTLE_SIGNALS: &[&str] = &[
    "too many connections",
    "login rate",
    "try again later",
    "throttle",
];

/// Bounded POP3 connection pool with retry and per-host throttling.
pub struct Pop3Pool {
    config: Pop3PoolConfig,
    slots: Arc<Semaphore>,
    throttled: Mutex<HashMap<String, Instant>>,
}

impl Pop3Pool {
    #[must_use]
    pub fn new(config: Pop3PoolConfig) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_concurrent));
        Self {
            config,
            slots,
            throttled: Mutex::new(HashMap::new()),
        }
    }

    /// Run `op` against an authenticated session for `account`.
    ///
    /// Fast-fails without consuming a slot while the host is inside
    /// its throttle window. Otherwise takes a slot (waiting FIFO when
    /// over cap) and makes up to `max_retries` attempts, each on a
    /// fresh connection, sleeping `base × 2^(attempt-1)` between
    /// attempts. A throttle signal in any error sets the host
    /// throttle and aborts the remaining attempts.
    pub async fn execute<T, F>(&self, account: &Pop3Account, mut op: F) -> Result<T>
    where
        F: for<'c> FnMut(&'c mut Pop3Client) -> BoxFuture<'c, Result<T>> + Send,
    {
        self.check_throttle(&account.host)?;

        let _slot = self
            .slots
            .acquire()
            .await
            .map_err(|_| Error::Internal("POP3 pool is shut down".into()))?;

        let mut last_error = None;
        for attempt in 1..=self.config.max_retries {
            if attempt > 1 {
                let backoff = self.config.backoff_base * 2u32.pow(attempt - 2);
                debug!(
                    host = %account.host,
                    attempt,
                    "retrying POP3 operation after {backoff:?}"
                );
                tokio::time::sleep(backoff).await;
            }

            match self.attempt(account, &mut op).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if is_throttle_signal(&e.to_string()) {
                        self.set_throttle(&account.host);
                        warn!(
                            host = %account.host,
                            "provider throttled POP3 access for {:?}: {e}",
                            self.config.throttle_window
                        );
                        return Err(e);
                    }
                    warn!(host = %account.host, attempt, "POP3 attempt failed: {e}");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| Error::pop3("connect", "no attempts were made".to_string())))
    }

    async fn attempt<T, F>(&self, account: &Pop3Account, op: &mut F) -> Result<T>
    where
        F: for<'c> FnMut(&'c mut Pop3Client) -> BoxFuture<'c, Result<T>> + Send,
    {
        let mut client = Pop3Client::connect(
            &account.host,
            account.port,
            account.tls,
            self.config.connect_timeout,
            self.config.command_timeout,
        )
        .await?;

        client.login(&account.username, &account.password).await?;
        let value = op(&mut client).await?;
        client.quit().await.ok();
        Ok(value)
    }

    /// Error out while the host is inside its throttle window. Does
    /// not touch the semaphore; expired entries are pruned on check.
    fn check_throttle(&self, host: &str) -> Result<()> {
        let mut throttled = self.throttled.lock().expect("throttle map poisoned");
        if let Some(&until) = throttled.get(host) {
            let now = Instant::now();
            if now < until {
                let remaining = until - now;
                return Err(Error::pop3(
                    "connect",
                    format!("host {host} throttled for another {remaining:?}"),
                ));
            }
            throttled.remove(host);
        }
        Ok(())
    }

    fn set_throttle(&self, host: &str) {
        let until = Instant::now() + self.config.throttle_window;
        self.throttled
            .lock()
            .expect("throttle map poisoned")
            .insert(host.to_string(), until);
    }

    /// Remaining free slots; used by health reporting.
    #[must_use]
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }
}

fn is_throttle_signal(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    THROTTLE_SIGNALS.iter().any(|sig| lowered.contains(sig))
}
