//! Per-IP rate limiting for unauthenticated inbox creation
//!
//! A fixed-window counter per caller address. Windows reset lazily;
//! stale entries are pruned whenever the map grows past a threshold.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const PRUNE_THRESHOLD: usize = 4096;

pub struct RateLimiter {
    max: u32,
    window: Duration,
    hits: Mutex<HashMap<IpAddr, (Instant, u32)>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(max: u32, window: Duration) -> Self {
        Self {
            max,
            window,
            hits: Mutex::new(HashMap::new()),
        }
    }

    /// Count one hit for `ip`, failing once the window is full.
    pub fn check(&self, ip: IpAddr) -> Result<()> {
        let now = Instant::now();
        let mut hits = self.hits.lock().expect("rate limiter poisoned");

        if hits.len() > PRUNE_THRESHOLD {
            let window = self.window;
            hits.retain(|_, (start, _)| now.duration_since(*start) < window);
        }

        let entry = hits.entry(ip).or_insert((now, 0));
        if now.duration_since(entry.0) >= self.window {
            *entry = (now, 0);
        }

        if entry.1 >= self.max {
            return Err(Error::RateLimit(format!(
                "inbox creation limit of {} per {:?} reached",
                self.max, self.window
            )));
        }
        entry.1 += 1;
        Ok(())
    }
}
