//! POP3 ingestion: protocol client and pooled execution
//!
//! `client` speaks RFC 1939 over TLS or plaintext, one command at a
//! time. `pool` wraps it with a concurrency cap, retry with
//! exponential backoff, and per-host throttling.

mod client;
mod pool;

pub use client::{Pop3Account, Pop3Client, UidlEntry};
pub use pool::Pop3Pool;
