//! In-process fake POP3 server for integration testing
//!
//! # How POP3 works (educational overview)
//!
//! POP3 (Post Office Protocol v3, RFC 1939) is a line-oriented
//! protocol for downloading mail from a maildrop. Unlike IMAP there
//! are no folders or flags; the client lists what is there, retrieves
//! messages, and optionally deletes them.
//!
//! ## Session lifecycle
//!
//! ```text
//!   Client connects via TCP (TLS on 995, plaintext otherwise)
//!       |
//!   Server greets: "+OK POP3 server ready\r\n"
//!       |
//!   Client authenticates: USER <name>, PASS <secret>
//!       |
//!   Client issues transaction commands: STAT, LIST, UIDL, RETR, DELE
//!       |
//!   Client sends QUIT
//! ```
//!
//! ## Reply format
//!
//! Every reply starts with `+OK` or `-ERR`. Multi-line replies
//! (LIST, UIDL, RETR) follow the status line with body lines and end
//! with a lone `.`; body lines that start with a dot are transmitted
//! **dot-stuffed** with an extra leading dot:
//!
//! ```text
//!   C: RETR 1
//!   S: +OK 120 octets
//!   S: <raw message, "." lines sent as "..">
//!   S: .
//! ```
//!
//! The server here implements exactly that, plus failure injection
//! (greeting rejects, login failures, RETR errors, stalled STAT)
//! driven by the shared [`Maildrop`] state.

use super::io::{write_bytes, write_line};
use super::maildrop::Maildrop;
use rcgen::generate_simple_self_signed;
use rustls::pki_types::PrivatePkcs8KeyDer;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

/// A fake POP3 server on localhost with an OS-assigned port.
pub struct FakePop3Server {
    port: u16,
    maildrop: Arc<Mutex<Maildrop>>,
    connections: Arc<AtomicUsize>,
    /// Handle to the accept loop so it lives as long as the server.
    _handle: tokio::task::JoinHandle<()>,
}

impl FakePop3Server {
    /// Start a plaintext server with the given maildrop state.
    pub async fn start(maildrop: Maildrop) -> Self {
        Self::start_inner(maildrop, false).await
    }

    /// Start an implicit-TLS server with a fresh self-signed
    /// certificate, as a provider on port 995 would present.
    pub async fn start_tls(maildrop: Maildrop) -> Self {
        Self::start_inner(maildrop, true).await
    }

    async fn start_inner(maildrop: Maildrop, tls: bool) -> Self {
        // Multiple tests may race to install the provider; the error
        // for an already-installed provider is ignored.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind to ephemeral port");
        let port = listener.local_addr().unwrap().port();

        let acceptor = if tls {
            let cert = generate_simple_self_signed(vec!["127.0.0.1".to_string()])
                .expect("generate self-signed cert");
            let cert_der = cert.cert.der().clone();
            let key_der = PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());
            let tls_config = rustls::ServerConfig::builder()
                .with_no_client_auth()
                .with_single_cert(vec![cert_der], key_der.into())
                .expect("build server TLS config");
            Some(TlsAcceptor::from(Arc::new(tls_config)))
        } else {
            None
        };

        let maildrop = Arc::new(Mutex::new(maildrop));
        let connections = Arc::new(AtomicUsize::new(0));

        let drop_ref = Arc::clone(&maildrop);
        let conn_ref = Arc::clone(&connections);
        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _addr)) = listener.accept().await else {
                    break;
                };
                conn_ref.fetch_add(1, Ordering::SeqCst);
                let maildrop = Arc::clone(&drop_ref);
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    match acceptor {
                        Some(acceptor) => {
                            let Ok(tls_stream) = acceptor.accept(stream).await else {
                                return;
                            };
                            handle_session(tls_stream, &maildrop).await;
                        }
                        None => handle_session(stream, &maildrop).await,
                    }
                });
            }
        });

        Self {
            port,
            maildrop,
            connections,
            _handle: handle,
        }
    }

    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Connections accepted so far; throttle tests assert this does
    /// not move during a fast-fail.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Shared maildrop state, for seeding messages mid-test.
    pub fn maildrop(&self) -> Arc<Mutex<Maildrop>> {
        Arc::clone(&self.maildrop)
    }
}

/// Run one POP3 session over an established stream.
async fn handle_session<S: AsyncRead + AsyncWrite + Unpin>(stream: S, maildrop: &Mutex<Maildrop>) {
    let mut reader = BufReader::new(stream);

    let greeting_error = maildrop.lock().unwrap().greeting_error.clone();
    if let Some(error) = greeting_error {
        let _ = write_line(&mut reader, &format!("{error}\r\n")).await;
        return;
    }
    if write_line(&mut reader, "+OK fake POP3 server ready\r\n")
        .await
        .is_err()
    {
        return;
    }

    let mut authenticated = false;

    loop {
        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let trimmed = line.trim();
        let (verb, arg) = match trimmed.split_once(' ') {
            Some((v, a)) => (v.to_ascii_uppercase(), a.trim()),
            None => (trimmed.to_ascii_uppercase(), ""),
        };

        let reply_err = match verb.as_str() {
            "USER" => write_line(&mut reader, "+OK send PASS\r\n").await.is_err(),
            "PASS" => {
                let error = {
                    let mut drop = maildrop.lock().unwrap();
                    if drop.always_fail_login {
                        Some(drop.login_error.clone())
                    } else if drop.login_failures_remaining > 0 {
                        drop.login_failures_remaining -= 1;
                        Some(drop.login_error.clone())
                    } else {
                        None
                    }
                };
                match error {
                    Some(e) => write_line(&mut reader, &format!("{e}\r\n")).await.is_err(),
                    None => {
                        authenticated = true;
                        write_line(&mut reader, "+OK maildrop locked and ready\r\n")
                            .await
                            .is_err()
                    }
                }
            }
            _ if !authenticated => write_line(&mut reader, "-ERR not authenticated\r\n")
                .await
                .is_err(),
            "STAT" => {
                let (count, size, stall) = {
                    let drop = maildrop.lock().unwrap();
                    (drop.messages.len(), drop.total_size(), drop.stall_on_stat)
                };
                if let Some(delay) = stall {
                    tokio::time::sleep(delay).await;
                }
                write_line(&mut reader, &format!("+OK {count} {size}\r\n"))
                    .await
                    .is_err()
            }
            "LIST" => {
                let snapshot = maildrop.lock().unwrap().clone();
                let mut out = format!("+OK {} messages\r\n", snapshot.messages.len());
                for (i, m) in snapshot.messages.iter().enumerate() {
                    out.push_str(&format!("{} {}\r\n", i + 1, m.raw.len()));
                }
                out.push_str(".\r\n");
                write_line(&mut reader, &out).await.is_err()
            }
            "UIDL" => {
                let snapshot = maildrop.lock().unwrap().clone();
                let mut out = String::from("+OK\r\n");
                for (i, m) in snapshot.messages.iter().enumerate() {
                    out.push_str(&format!("{} {}\r\n", i + 1, m.uid));
                }
                out.push_str(".\r\n");
                write_line(&mut reader, &out).await.is_err()
            }
            "RETR" => {
                let num: u32 = arg.parse().unwrap_or(0);
                let snapshot = maildrop.lock().unwrap().clone();
                if snapshot.retr_failures.contains(&num) {
                    write_line(&mut reader, "-ERR message unavailable\r\n")
                        .await
                        .is_err()
                } else if let Some(m) = snapshot.messages.get(num.saturating_sub(1) as usize) {
                    let header = format!("+OK {} octets\r\n", m.raw.len());
                    if write_line(&mut reader, &header).await.is_err() {
                        true
                    } else {
                        write_stuffed_body(&mut reader, &m.raw).await.is_err()
                    }
                } else {
                    write_line(&mut reader, "-ERR no such message\r\n")
                        .await
                        .is_err()
                }
            }
            "DELE" | "RSET" | "NOOP" => write_line(&mut reader, "+OK\r\n").await.is_err(),
            "QUIT" => {
                let _ = write_line(&mut reader, "+OK bye\r\n").await;
                return;
            }
            _ => write_line(&mut reader, "-ERR unknown command\r\n")
                .await
                .is_err(),
        };

        if reply_err {
            return;
        }
    }
}

/// Transmit a message body dot-stuffed and dot-terminated.
async fn write_stuffed_body<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut BufReader<S>,
    raw: &[u8],
) -> std::io::Result<()> {
    let mut wire = Vec::with_capacity(raw.len() + 16);
    for line in split_lines(raw) {
        if line.first() == Some(&b'.') {
            wire.push(b'.');
        }
        wire.extend_from_slice(line);
        wire.extend_from_slice(b"\r\n");
    }
    wire.extend_from_slice(b".\r\n");
    write_bytes(stream, &wire).await
}

/// Split raw bytes on CRLF (tolerating bare LF), without terminators.
fn split_lines(raw: &[u8]) -> Vec<&[u8]> {
    let mut lines = Vec::new();
    let mut start = 0;
    for (i, b) in raw.iter().enumerate() {
        if *b == b'\n' {
            let mut end = i;
            if end > start && raw[end - 1] == b'\r' {
                end -= 1;
            }
            lines.push(&raw[start..end]);
            start = i + 1;
        }
    }
    if start < raw.len() {
        lines.push(&raw[start..]);
    }
    lines
}
