//! Inbound SMTP receiver
//!
//! Alternate ingestion source for locally-hosted domains: messages
//! accepted here land in the same store as POP3-fetched mail, parsed
//! through the same adapter with a synthetic `smtp-<uuid>` uid.
//!
//! The receiver is intended to sit behind a trusted network boundary
//! or an MTA; AUTH and STARTTLS are refused. RCPT TO is gated twice:
//! the domain must be in the local-domain cache, and the mailbox must
//! resolve to an active inbox (case-insensitive).

use crate::config::SmtpConfig;
use crate::domains::LocalDomains;
use crate::error::Result;
use crate::mime::parse_message;
use crate::store::{InboxRow, Store};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Timeout for reading a command line.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

/// Timeout for accumulating DATA content.
const DATA_TIMEOUT: Duration = Duration::from_secs(600);

/// RFC 5321 maximum command line length.
const MAX_LINE_LENGTH: usize = 1000;

/// Errors tolerated before the connection is dropped.
const MAX_ERRORS: usize = 10;

pub struct SmtpReceiver {
    config: SmtpConfig,
    store: Store,
    domains: Arc<LocalDomains>,
    max_attachment_bytes: usize,
}

/// A running receiver: the bound address and the accept-loop task.
pub struct SmtpServerHandle {
    pub addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl SmtpServerHandle {
    pub fn shutdown(&self) {
        self.handle.abort();
    }
}

impl SmtpReceiver {
    #[must_use]
    pub const fn new(
        config: SmtpConfig,
        store: Store,
        domains: Arc<LocalDomains>,
        max_attachment_bytes: usize,
    ) -> Self {
        Self {
            config,
            store,
            domains,
            max_attachment_bytes,
        }
    }

    /// Bind and start accepting connections. Each connection runs
    /// independently; a session failure never affects its siblings.
    pub async fn start(self: Arc<Self>) -> Result<SmtpServerHandle> {
        let listener = TcpListener::bind(self.config.addr).await?;
        let addr = listener.local_addr()?;
        info!(%addr, "SMTP receiver listening");

        let receiver = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, peer)) = listener.accept().await else {
                    break;
                };
                let receiver = Arc::clone(&receiver);
                tokio::spawn(async move {
                    if let Err(e) = receiver.handle_connection(stream, peer).await {
                        debug!(%peer, "SMTP session ended with error: {e}");
                    }
                });
            }
        });

        Ok(SmtpServerHandle { addr, handle })
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> std::io::Result<()> {
        let mut reader = BufReader::new(stream);
        write_reply(&mut reader, &format!("220 {}\r\n", self.config.banner)).await?;

        let mut mail_from: Option<String> = None;
        // Matched inboxes for this transaction, keyed by lower-cased
        // recipient address.
        let mut recipients: HashMap<String, InboxRow> = HashMap::new();
        let mut errors = 0usize;

        loop {
            let Some(line) = read_command_line(&mut reader).await? else {
                return Ok(());
            };

            let (verb, arg) = split_verb(&line);

            match verb.as_str() {
                "HELO" => {
                    mail_from = None;
                    recipients.clear();
                    write_reply(&mut reader, "250 tempbox\r\n").await?;
                }
                "EHLO" => {
                    mail_from = None;
                    recipients.clear();
                    let reply = format!(
                        "250-tempbox greets you\r\n250 SIZE {}\r\n",
                        self.config.max_message_size
                    );
                    write_reply(&mut reader, &reply).await?;
                }
                "AUTH" => {
                    write_reply(&mut reader, "502 5.5.1 AUTH not supported\r\n").await?;
                }
                "STARTTLS" => {
                    write_reply(&mut reader, "502 5.5.1 STARTTLS not supported\r\n").await?;
                }
                "MAIL" => {
                    // Accepted permissively; the RCPT gate does the
                    // real filtering.
                    mail_from = Some(parse_path(arg).unwrap_or_default());
                    recipients.clear();
                    write_reply(&mut reader, "250 OK\r\n").await?;
                }
                "RCPT" => {
                    if mail_from.is_none() {
                        errors += 1;
                        write_reply(&mut reader, "503 5.5.1 MAIL first\r\n").await?;
                    } else {
                        let reply = self.gate_recipient(arg, &mut recipients).await;
                        write_reply(&mut reader, reply).await?;
                    }
                }
                "DATA" => {
                    if recipients.is_empty() {
                        errors += 1;
                        write_reply(&mut reader, "503 5.5.1 RCPT first\r\n").await?;
                        continue;
                    }
                    write_reply(&mut reader, "354 End data with <CR><LF>.<CR><LF>\r\n").await?;

                    let (body, oversize) =
                        read_data(&mut reader, self.config.max_message_size).await?;

                    let reply = if oversize {
                        "552 5.3.4 Message size exceeds limit\r\n".to_string()
                    } else {
                        self.deliver(&body, mail_from.as_deref().unwrap_or(""), &recipients, peer)
                            .await
                    };
                    write_reply(&mut reader, &reply).await?;

                    mail_from = None;
                    recipients.clear();
                }
                "RSET" => {
                    mail_from = None;
                    recipients.clear();
                    write_reply(&mut reader, "250 OK\r\n").await?;
                }
                "NOOP" => {
                    write_reply(&mut reader, "250 OK\r\n").await?;
                }
                "QUIT" => {
                    write_reply(&mut reader, "221 2.0.0 Bye\r\n").await?;
                    return Ok(());
                }
                _ => {
                    errors += 1;
                    write_reply(&mut reader, "500 5.5.2 Command not recognized\r\n").await?;
                }
            }

            if errors >= MAX_ERRORS {
                write_reply(&mut reader, "421 4.7.0 Too many errors\r\n").await?;
                return Ok(());
            }
        }
    }

    /// RCPT TO gate: known local domain, then an active inbox with a
    /// case-insensitive address match.
    async fn gate_recipient(
        &self,
        arg: &str,
        recipients: &mut HashMap<String, InboxRow>,
    ) -> &'static str {
        let Some(address) = parse_path(arg) else {
            return "501 5.1.3 Bad recipient syntax\r\n";
        };

        let Some((_, domain)) = address.rsplit_once('@') else {
            return "501 5.1.3 Bad recipient syntax\r\n";
        };

        if !self.domains.contains(domain) {
            return "554 5.7.1 Relay access denied\r\n";
        }

        match self.store.active_inbox_by_email(&address).await {
            Ok(Some(inbox)) => {
                recipients.insert(address.to_ascii_lowercase(), inbox);
                "250 OK\r\n"
            }
            Ok(None) => "550 5.1.1 Unknown recipient\r\n",
            Err(e) => {
                warn!("RCPT lookup failed: {e}");
                "451 4.3.0 Temporary lookup failure\r\n"
            }
        }
    }

    /// Parse once, persist per matched recipient. Best effort: a
    /// per-recipient failure is logged, and the batch succeeds as
    /// long as at least one delivery did.
    async fn deliver(
        &self,
        body: &[u8],
        mail_from: &str,
        recipients: &HashMap<String, InboxRow>,
        peer: SocketAddr,
    ) -> String {
        let uid = format!("smtp-{}", Uuid::new_v4());
        let parsed = parse_message(&uid, body, self.max_attachment_bytes);

        let mut delivered = 0usize;
        for (address, inbox) in recipients {
            match self
                .store
                .insert_messages(&inbox.id, std::slice::from_ref(&parsed))
                .await
            {
                Ok(_) => {
                    delivered += 1;
                    self.store
                        .audit(
                            "smtp_delivery",
                            Some(&inbox.id),
                            &peer.ip().to_string(),
                            serde_json::json!({ "uid": uid, "from": mail_from, "to": address }),
                        )
                        .await;
                }
                Err(e) => {
                    warn!(%address, "SMTP delivery failed for recipient: {e}");
                }
            }
        }

        if delivered == 0 {
            "451 4.3.0 Delivery failed\r\n".to_string()
        } else {
            info!(uid, delivered, "inbound message accepted");
            "250 2.0.0 OK accepted for delivery\r\n".to_string()
        }
    }
}

fn split_verb(line: &str) -> (String, &str) {
    match line.split_once(|c: char| c.is_ascii_whitespace()) {
        Some((verb, rest)) => (verb.to_ascii_uppercase(), rest.trim()),
        None => (line.trim().to_ascii_uppercase(), ""),
    }
}

/// Extract the address from a `FROM:<addr>` / `TO:<addr>` argument,
/// tolerating missing angle brackets and trailing parameters.
fn parse_path(arg: &str) -> Option<String> {
    let after_colon = arg.split_once(':').map_or(arg, |(_, rest)| rest).trim();
    let address = if let Some(start) = after_colon.find('<') {
        let end = after_colon[start..].find('>')? + start;
        &after_colon[start + 1..end]
    } else {
        after_colon.split_ascii_whitespace().next().unwrap_or("")
    };
    let address = address.trim();
    if address.is_empty() {
        None
    } else {
        Some(address.to_string())
    }
}

async fn write_reply(
    stream: &mut BufReader<TcpStream>,
    reply: &str,
) -> std::io::Result<()> {
    stream.get_mut().write_all(reply.as_bytes()).await?;
    stream.get_mut().flush().await
}

/// Read one command line. Returns `None` on a clean disconnect;
/// oversize lines and timeouts surface as IO errors.
async fn read_command_line(stream: &mut BufReader<TcpStream>) -> std::io::Result<Option<String>> {
    let mut buf = Vec::new();
    let n = tokio::time::timeout(COMMAND_TIMEOUT, stream.read_until(b'\n', &mut buf))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "command timeout"))??;
    if n == 0 {
        return Ok(None);
    }
    if buf.len() > MAX_LINE_LENGTH {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "command line too long",
        ));
    }
    while matches!(buf.last(), Some(b'\r' | b'\n')) {
        buf.pop();
    }
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}

/// Accumulate a dot-stuffed DATA body up to the lone-dot terminator.
///
/// Once the size cap is crossed the rest of the body is consumed but
/// discarded, so the 552 reply lands on a clean protocol boundary.
async fn read_data(
    stream: &mut BufReader<TcpStream>,
    max_message_size: usize,
) -> std::io::Result<(Vec<u8>, bool)> {
    let collect = async {
        let mut body = Vec::new();
        let mut oversize = false;
        loop {
            let mut line = Vec::new();
            let n = stream.read_until(b'\n', &mut line).await?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed during DATA",
                ));
            }
            while matches!(line.last(), Some(b'\r' | b'\n')) {
                line.pop();
            }
            if line == b"." {
                return Ok((body, oversize));
            }
            let content: &[u8] = if line.starts_with(b"..") {
                &line[1..]
            } else {
                &line
            };
            if body.len() + content.len() + 2 > max_message_size {
                oversize = true;
            }
            if !oversize {
                body.extend_from_slice(content);
                body.extend_from_slice(b"\r\n");
            }
        }
    };

    tokio::time::timeout(DATA_TIMEOUT, collect)
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "DATA timeout"))?
}
