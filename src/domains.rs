//! Local-domain cache
//!
//! The SMTP receiver gates RCPT TO against the set of active
//! locally-hosted domains. The set is read on every recipient, so it
//! lives in memory and is replaced wholesale (an `Arc` pointer swap
//! under a short lock) by a periodic refresh from the store.

use crate::error::Result;
use crate::store::Store;
use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Default)]
pub struct LocalDomains {
    inner: RwLock<Arc<HashSet<String>>>,
}

impl LocalDomains {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Case-insensitive membership test.
    #[must_use]
    pub fn contains(&self, domain: &str) -> bool {
        let snapshot = Arc::clone(&self.inner.read().expect("domain cache poisoned"));
        snapshot.contains(&domain.to_ascii_lowercase())
    }

    /// Replace the whole set atomically.
    pub fn replace(&self, domains: impl IntoIterator<Item = String>) {
        let set: HashSet<String> = domains
            .into_iter()
            .map(|d| d.to_ascii_lowercase())
            .collect();
        *self.inner.write().expect("domain cache poisoned") = Arc::new(set);
    }

    /// One refresh from the store.
    pub async fn refresh(&self, store: &Store) -> Result<()> {
        let names = store.active_local_domain_names().await?;
        debug!(domains = names.len(), "local-domain cache refreshed");
        self.replace(names);
        Ok(())
    }

    /// Periodic refresh task. Failures keep the previous snapshot.
    #[must_use]
    pub fn spawn_refresher(self: Arc<Self>, store: Store, interval: Duration) -> JoinHandle<()> {
        let cache = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = cache.refresh(&store).await {
                    warn!("local-domain refresh failed: {e}");
                }
            }
        })
    }
}
