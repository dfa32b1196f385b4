#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

//! tempbox — temporary-email gateway
//!
//! Issues short-lived, token-guarded access to mailboxes and serves
//! their contents over HTTP. Mail arrives either by pulling a
//! provider POP3 mailbox (external or generated inboxes) or through
//! the built-in inbound SMTP receiver for locally-hosted domains.
//! Mailbox credentials are AES-256-GCM encrypted at rest; callers
//! only ever hold a rotatable bearer token stored as a hash.

pub mod auth;
pub mod config;
pub mod crypto;
pub mod domains;
mod error;
pub mod fetch;
pub mod http;
pub mod mime;
pub mod pop3;
pub mod smtp;
pub mod store;

pub use error::{Error, Result};
