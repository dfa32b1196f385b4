//! POP3 protocol client
//!
//! A line-oriented RFC 1939 client over implicit TLS or plaintext
//! TCP. The connection is a small state machine: connected after the
//! `+OK` greeting, authenticated after USER/PASS, closed after QUIT
//! or any fatal transport error. Exactly one command is in flight at
//! a time; the client never pipelines.
//!
//! Multi-line replies are terminated by a `CRLF . CRLF` sequence and
//! dot-stuffed: a body line starting with `..` is surfaced with the
//! first dot removed, and a lone `.` ends the body without being part
//! of it.

use crate::error::{Error, Result};
use rustls::pki_types::ServerName;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::debug;

/// Coordinates and credentials for one POP3 mailbox.
#[derive(Clone)]
pub struct Pop3Account {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Pop3Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pop3Account")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("tls", &self.tls)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// One `UIDL` listing entry: the session-scoped message number and
/// the provider-stable unique id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UidlEntry {
    pub num: u32,
    pub uid: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Connected,
    Authenticated,
    Closed,
}

#[derive(Debug)]
enum Pop3Stream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for Pop3Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Pop3Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_flush(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// A single POP3 connection.
#[derive(Debug)]
pub struct Pop3Client {
    stream: BufReader<Pop3Stream>,
    command_timeout: Duration,
    state: State,
}

impl Pop3Client {
    /// Open a connection and consume the server greeting.
    ///
    /// Connection establishment (TCP dial plus TLS handshake) is
    /// bounded by `connect_timeout`; a non-`+OK` greeting rejects the
    /// connection immediately.
    pub async fn connect(
        host: &str,
        port: u16,
        tls: bool,
        connect_timeout: Duration,
        command_timeout: Duration,
    ) -> Result<Self> {
        debug!("Connecting to POP3 server at {host}:{port} (tls={tls})");

        let stream = tokio::time::timeout(connect_timeout, async {
            let tcp = TcpStream::connect((host, port))
                .await
                .map_err(|e| Error::pop3("connect", e.to_string()))?;

            if tls {
                let server_name = ServerName::try_from(host.to_string())
                    .map_err(|e| Error::pop3("connect", format!("invalid server name: {e}")))?;
                let tls_stream = tls_connector()
                    .connect(server_name, tcp)
                    .await
                    .map_err(|e| Error::pop3("connect", format!("TLS handshake: {e}")))?;
                Ok::<Pop3Stream, Error>(Pop3Stream::Tls(Box::new(tls_stream)))
            } else {
                Ok(Pop3Stream::Plain(tcp))
            }
        })
        .await
        .map_err(|_| Error::pop3("connect", format!("timed out after {connect_timeout:?}")))??;

        let mut client = Self {
            stream: BufReader::new(stream),
            command_timeout,
            state: State::Connected,
        };

        let greeting = client.read_status_line("greeting").await?;
        if let Some(rest) = greeting.strip_prefix("+OK") {
            debug!("POP3 greeting: {}", rest.trim());
            Ok(client)
        } else {
            client.state = State::Closed;
            Err(Error::pop3("greeting", greeting))
        }
    }

    /// Authenticate with USER then PASS.
    ///
    /// Any non-`+OK` reply to either command fails with an
    /// authentication error.
    pub async fn login(&mut self, username: &str, password: &str) -> Result<()> {
        self.require(State::Connected, "USER")?;

        for (command, arg) in [("USER", username), ("PASS", password)] {
            let line = format!("{command} {arg}\r\n");
            self.write_all(command, line.as_bytes()).await?;
            let reply = self.read_status_line(command).await?;
            if !reply.starts_with("+OK") {
                self.state = State::Closed;
                return Err(Error::Authentication(format!(
                    "POP3 {command} rejected: {}",
                    reply.trim()
                )));
            }
        }

        self.state = State::Authenticated;
        Ok(())
    }

    /// STAT: maildrop message count and total size in octets.
    pub async fn stat(&mut self) -> Result<(u64, u64)> {
        let reply = self.command("STAT", "STAT\r\n").await?;
        let mut fields = reply.split_whitespace();
        let count = fields
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::pop3("STAT", format!("malformed reply: {reply}")))?;
        let size = fields
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::pop3("STAT", format!("malformed reply: {reply}")))?;
        Ok((count, size))
    }

    /// LIST: scan listing of `(message-number, size)` pairs.
    pub async fn list(&mut self) -> Result<Vec<(u32, u64)>> {
        self.command("LIST", "LIST\r\n").await?;
        let lines = self.read_multiline_lines("LIST").await?;

        let mut listing = Vec::with_capacity(lines.len());
        for line in lines {
            let mut fields = line.split_whitespace();
            let (Some(num), Some(size)) = (
                fields.next().and_then(|s| s.parse().ok()),
                fields.next().and_then(|s| s.parse().ok()),
            ) else {
                return Err(Error::pop3("LIST", format!("malformed line: {line}")));
            };
            listing.push((num, size));
        }
        Ok(listing)
    }

    /// UIDL: `(message-number, unique-id)` listing in server order.
    ///
    /// The uid is everything after the first space, so opaque tokens
    /// survive untouched.
    pub async fn uidl(&mut self) -> Result<Vec<UidlEntry>> {
        self.command("UIDL", "UIDL\r\n").await?;
        let lines = self.read_multiline_lines("UIDL").await?;

        let mut listing = Vec::with_capacity(lines.len());
        for line in lines {
            let Some((num, uid)) = line.split_once(' ') else {
                return Err(Error::pop3("UIDL", format!("malformed line: {line}")));
            };
            let num = num
                .parse()
                .map_err(|_| Error::pop3("UIDL", format!("malformed line: {line}")))?;
            listing.push(UidlEntry {
                num,
                uid: uid.to_string(),
            });
        }
        Ok(listing)
    }

    /// RETR: the exact raw RFC 5322 message, dot-unstuffed.
    pub async fn retr(&mut self, num: u32) -> Result<Vec<u8>> {
        self.command("RETR", &format!("RETR {num}\r\n")).await?;
        self.read_multiline_bytes("RETR").await
    }

    /// DELE: mark a message for deletion at QUIT.
    pub async fn dele(&mut self, num: u32) -> Result<()> {
        self.command("DELE", &format!("DELE {num}\r\n")).await?;
        Ok(())
    }

    /// RSET: unmark all messages marked for deletion.
    pub async fn rset(&mut self) -> Result<()> {
        self.command("RSET", "RSET\r\n").await?;
        Ok(())
    }

    /// NOOP: keepalive.
    pub async fn noop(&mut self) -> Result<()> {
        self.command("NOOP", "NOOP\r\n").await?;
        Ok(())
    }

    /// QUIT and close the connection.
    pub async fn quit(mut self) -> Result<()> {
        if self.state == State::Closed {
            return Ok(());
        }
        self.write_all("QUIT", b"QUIT\r\n").await?;
        let reply = self.read_status_line("QUIT").await?;
        self.state = State::Closed;
        if reply.starts_with("+OK") {
            Ok(())
        } else {
            Err(Error::pop3("QUIT", reply))
        }
    }

    // -- private helpers --

    fn require(&self, expected: State, command: &'static str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(Error::pop3(
                command,
                format!("invalid connection state {:?}", self.state),
            ))
        }
    }

    /// Send a transaction-state command and return the `+OK` status
    /// line. A `-ERR` reply is a recoverable protocol error; anything
    /// else poisons the connection.
    async fn command(&mut self, name: &'static str, line: &str) -> Result<String> {
        self.require(State::Authenticated, name)?;
        self.write_all(name, line.as_bytes()).await?;
        let reply = self.read_status_line(name).await?;

        if let Some(rest) = reply.strip_prefix("+OK") {
            Ok(rest.trim().to_string())
        } else if let Some(rest) = reply.strip_prefix("-ERR") {
            Err(Error::pop3(name, rest.trim().to_string()))
        } else {
            self.state = State::Closed;
            Err(Error::pop3(name, format!("unexpected reply: {reply}")))
        }
    }

    async fn write_all(&mut self, command: &'static str, bytes: &[u8]) -> Result<()> {
        let io = async {
            self.stream.get_mut().write_all(bytes).await?;
            self.stream.get_mut().flush().await
        };
        match tokio::time::timeout(self.command_timeout, io).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.state = State::Closed;
                Err(Error::pop3(command, format!("write failed: {e}")))
            }
            Err(_) => {
                self.state = State::Closed;
                Err(Error::pop3(command, "write timed out"))
            }
        }
    }

    /// Read one CRLF-terminated line, without the terminator. The
    /// command timeout applies; expiry poisons the connection.
    async fn read_line_bytes(&mut self, command: &'static str) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        let read = tokio::time::timeout(self.command_timeout, self.stream.read_until(b'\n', &mut buf));
        match read.await {
            Ok(Ok(0)) => {
                self.state = State::Closed;
                Err(Error::pop3(command, "connection closed by server"))
            }
            Ok(Ok(_)) => {
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                }
                if buf.last() == Some(&b'\r') {
                    buf.pop();
                }
                Ok(buf)
            }
            Ok(Err(e)) => {
                self.state = State::Closed;
                Err(Error::pop3(command, format!("read failed: {e}")))
            }
            Err(_) => {
                self.state = State::Closed;
                Err(Error::pop3(
                    command,
                    format!("timed out after {:?}", self.command_timeout),
                ))
            }
        }
    }

    async fn read_status_line(&mut self, command: &'static str) -> Result<String> {
        let line = self.read_line_bytes(command).await?;
        Ok(String::from_utf8_lossy(&line).into_owned())
    }

    /// Read a multi-line body up to the lone-dot terminator,
    /// un-stuffing leading double dots and rejoining with CRLF.
    async fn read_multiline_bytes(&mut self, command: &'static str) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        loop {
            let line = self.read_line_bytes(command).await?;
            if line == b"." {
                return Ok(body);
            }
            let content: &[u8] = if line.starts_with(b"..") {
                &line[1..]
            } else {
                &line
            };
            body.extend_from_slice(content);
            body.extend_from_slice(b"\r\n");
        }
    }

    async fn read_multiline_lines(&mut self, command: &'static str) -> Result<Vec<String>> {
        let mut lines = Vec::new();
        loop {
            let line = self.read_line_bytes(command).await?;
            if line == b"." {
                return Ok(lines);
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
    }
}

/// Build a TLS connector that accepts all certificates.
///
/// Many mail providers present self-signed or mismatched
/// certificates on their POP3 endpoints, so verification is skipped.
fn tls_connector() -> TlsConnector {
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

/// Certificate verifier that accepts all certificates.
#[derive(Debug)]
struct AcceptAnyCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}
