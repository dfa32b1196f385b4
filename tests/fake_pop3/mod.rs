//! Fake POP3 server for integration testing
//!
//! An in-process server that speaks enough of RFC 1939 to exercise
//! the client, the pool, and the fetch worker end-to-end:
//!
//! TCP (or TLS) -> greeting -> USER/PASS -> STAT/LIST/UIDL/RETR -> QUIT
//!
//! ## Module layout
//!
//! - `server` -- TCP/TLS listener and the per-connection command loop
//! - `maildrop` -- test data model (messages, failure injection,
//!   builder)
//! - `io` -- shared write helpers

#![allow(dead_code)]

mod io;
pub mod maildrop;
mod server;

pub use maildrop::MaildropBuilder;
pub use server::FakePop3Server;
