//! Test data model for the fake POP3 server
//!
//! Builder-style API for constructing maildrop state and failure
//! injection:
//!
//! ```ignore
//! let maildrop = MaildropBuilder::new()
//!     .message("u1", raw_rfc5322_bytes)
//!     .message("u2", raw_rfc5322_bytes)
//!     .fail_logins(2, "-ERR busy, try again")
//!     .build();
//! ```
//!
//! The `Maildrop` is shared with the server via `Arc<Mutex<_>>` so
//! tests can seed additional messages after startup.

use std::collections::HashSet;
use std::time::Duration;

/// A message stored in the maildrop. The message number presented on
/// the wire is its 1-based position in the list.
#[derive(Debug, Clone)]
pub struct TestMessage {
    pub uid: String,
    pub raw: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct Maildrop {
    pub messages: Vec<TestMessage>,
    /// When set, sent instead of the `+OK` greeting and the
    /// connection is closed.
    pub greeting_error: Option<String>,
    /// Reject this many PASS commands with `login_error` before
    /// letting logins through.
    pub login_failures_remaining: usize,
    /// Reject every PASS command with `login_error`.
    pub always_fail_login: bool,
    pub login_error: String,
    /// Message numbers whose RETR fails with `-ERR`.
    pub retr_failures: HashSet<u32>,
    /// Sleep this long before answering STAT; exercises the command
    /// timeout.
    pub stall_on_stat: Option<Duration>,
}

impl Maildrop {
    /// Seed another message after the server has started.
    pub fn push_message(&mut self, uid: &str, raw: &[u8]) {
        self.messages.push(TestMessage {
            uid: uid.to_string(),
            raw: raw.to_vec(),
        });
    }

    pub fn total_size(&self) -> usize {
        self.messages.iter().map(|m| m.raw.len()).sum()
    }
}

/// Builder for constructing a `Maildrop` step by step.
pub struct MaildropBuilder {
    maildrop: Maildrop,
}

impl MaildropBuilder {
    pub fn new() -> Self {
        Self {
            maildrop: Maildrop::default(),
        }
    }

    /// Append a message; wire numbering follows insertion order.
    pub fn message(mut self, uid: &str, raw: &[u8]) -> Self {
        self.maildrop.push_message(uid, raw);
        self
    }

    /// Reject the greeting with the given status line.
    pub fn greeting_error(mut self, line: &str) -> Self {
        self.maildrop.greeting_error = Some(line.to_string());
        self
    }

    /// Fail the next `n` logins with `error` before succeeding.
    pub fn fail_logins(mut self, n: usize, error: &str) -> Self {
        self.maildrop.login_failures_remaining = n;
        self.maildrop.login_error = error.to_string();
        self
    }

    /// Fail every login with `error`.
    pub fn always_fail_login(mut self, error: &str) -> Self {
        self.maildrop.always_fail_login = true;
        self.maildrop.login_error = error.to_string();
        self
    }

    /// Make RETR of message number `num` fail.
    pub fn fail_retr(mut self, num: u32) -> Self {
        self.maildrop.retr_failures.insert(num);
        self
    }

    /// Stall STAT replies to trip the command timeout.
    pub fn stall_on_stat(mut self, delay: Duration) -> Self {
        self.maildrop.stall_on_stat = Some(delay);
        self
    }

    pub fn build(self) -> Maildrop {
        self.maildrop
    }
}
