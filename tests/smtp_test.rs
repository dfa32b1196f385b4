//! Integration tests for the inbound SMTP receiver: RCPT gating
//! against the local-domain cache, delivery into the store, refusal
//! of AUTH/STARTTLS, and the message size cap.

use std::sync::Arc;
use std::time::Duration;
use tempbox::crypto::BlobCipher;
use tempbox::config::SmtpConfig;
use tempbox::domains::LocalDomains;
use tempbox::smtp::{SmtpReceiver, SmtpServerHandle};
use tempbox::store::{InboxType, NewDomain, NewInbox, Store};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

struct Fixture {
    store: Store,
    handle: SmtpServerHandle,
    alice_id: String,
}

async fn fixture(max_message_size: usize) -> Fixture {
    let store = Store::connect_in_memory().await.unwrap();
    let cipher = BlobCipher::new("smtp-test-key");

    let domain = store
        .create_domain(NewDomain {
            domain: "local.test".to_string(),
            pop3_host: None,
            pop3_port: None,
            pop3_tls: true,
            is_local: true,
        })
        .await
        .unwrap();

    let alice = store
        .create_inbox(NewInbox {
            email: "alice@local.test".to_string(),
            inbox_type: InboxType::Generated.as_str().to_string(),
            pop3_host: None,
            pop3_port: None,
            pop3_tls: true,
            username_enc: cipher.encrypt(b"alice@local.test").unwrap(),
            password_enc: cipher.encrypt(b"secret").unwrap(),
            domain_id: Some(domain.id.clone()),
            created_by_ip: "127.0.0.1".to_string(),
            ttl_seconds: 600,
        })
        .await
        .unwrap();

    let domains = Arc::new(LocalDomains::new());
    domains.refresh(&store).await.unwrap();

    let receiver = Arc::new(SmtpReceiver::new(
        SmtpConfig {
            enabled: true,
            addr: "127.0.0.1:0".parse().unwrap(),
            banner: "tempbox test ESMTP".to_string(),
            max_message_size,
            domain_refresh: Duration::from_secs(60),
        },
        store.clone(),
        domains,
        1024 * 1024,
    ));
    let handle = receiver.start().await.unwrap();

    Fixture {
        store,
        handle,
        alice_id: alice.id,
    }
}

struct SmtpSession {
    stream: BufReader<TcpStream>,
}

impl SmtpSession {
    async fn connect(fx: &Fixture) -> Self {
        let stream = TcpStream::connect(fx.handle.addr).await.unwrap();
        let mut session = Self {
            stream: BufReader::new(stream),
        };
        let greeting = session.read_reply().await;
        assert!(greeting.starts_with("220"), "greeting: {greeting}");
        session
    }

    async fn send(&mut self, line: &str) -> String {
        self.stream
            .get_mut()
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .unwrap();
        self.read_reply().await
    }

    /// Read one reply, following multi-line continuations (`250-`).
    async fn read_reply(&mut self) -> String {
        let mut full = String::new();
        loop {
            let mut line = String::new();
            self.stream.read_line(&mut line).await.unwrap();
            full.push_str(&line);
            if line.len() < 4 || line.as_bytes()[3] != b'-' {
                return full;
            }
        }
    }

    async fn send_raw(&mut self, data: &str) {
        self.stream
            .get_mut()
            .write_all(data.as_bytes())
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_unknown_domain_is_relay_denied() {
    let fx = fixture(1024 * 1024).await;
    let mut session = SmtpSession::connect(&fx).await;

    session.send("EHLO client.test").await;
    session.send("MAIL FROM:<sender@example.com>").await;
    let reply = session.send("RCPT TO:<a@not-local.example>").await;
    assert!(reply.starts_with("554"), "reply: {reply}");
    assert!(reply.contains("Relay access denied"));
}

#[tokio::test]
async fn test_unknown_mailbox_on_local_domain_is_rejected() {
    let fx = fixture(1024 * 1024).await;
    let mut session = SmtpSession::connect(&fx).await;

    session.send("EHLO client.test").await;
    session.send("MAIL FROM:<sender@example.com>").await;
    let reply = session.send("RCPT TO:<nobody@local.test>").await;
    assert!(reply.starts_with("550"), "reply: {reply}");
    assert!(reply.contains("Unknown recipient"));
}

#[tokio::test]
async fn test_delivery_to_matched_recipient_lands_in_the_store() {
    let fx = fixture(1024 * 1024).await;
    let mut session = SmtpSession::connect(&fx).await;

    let ehlo = session.send("EHLO client.test").await;
    assert!(ehlo.contains("SIZE"), "EHLO should advertise SIZE: {ehlo}");

    session.send("MAIL FROM:<sender@example.com>").await;
    // Addressing is case-insensitive.
    let reply = session.send("RCPT TO:<Alice@LOCAL.test>").await;
    assert!(reply.starts_with("250"), "reply: {reply}");

    let reply = session.send("DATA").await;
    assert!(reply.starts_with("354"), "reply: {reply}");

    session
        .send_raw(
            "From: sender@example.com\r\n\
             To: alice@local.test\r\n\
             Subject: inbound hello\r\n\
             \r\n\
             ..keep this leading dot\r\n\
             plain line\r\n",
        )
        .await;
    let reply = session.send(".").await;
    assert!(reply.starts_with("250"), "reply: {reply}");

    let messages = fx.store.messages_after(&fx.alice_id, None, 50).await.unwrap();
    assert_eq!(messages.len(), 1);
    let message = &messages[0].message;
    assert!(message.uid.starts_with("smtp-"));
    assert_eq!(message.subject, "inbound hello");
    // Dot-stuffing is undone before parsing.
    assert!(message.body_text.contains(".keep this leading dot"));

    session.send("QUIT").await;
}

#[tokio::test]
async fn test_second_delivery_gets_a_distinct_uid() {
    let fx = fixture(1024 * 1024).await;
    let mut session = SmtpSession::connect(&fx).await;

    session.send("EHLO client.test").await;
    for _ in 0..2 {
        session.send("MAIL FROM:<sender@example.com>").await;
        session.send("RCPT TO:<alice@local.test>").await;
        session.send("DATA").await;
        session
            .send_raw("Subject: again\r\n\r\nbody\r\n")
            .await;
        let reply = session.send(".").await;
        assert!(reply.starts_with("250"), "reply: {reply}");
    }

    assert_eq!(fx.store.message_count(&fx.alice_id).await.unwrap(), 2);
}

#[tokio::test]
async fn test_auth_and_starttls_are_refused() {
    let fx = fixture(1024 * 1024).await;
    let mut session = SmtpSession::connect(&fx).await;

    session.send("EHLO client.test").await;
    let reply = session.send("AUTH LOGIN").await;
    assert!(reply.starts_with("502"), "reply: {reply}");
    let reply = session.send("STARTTLS").await;
    assert!(reply.starts_with("502"), "reply: {reply}");
}

#[tokio::test]
async fn test_oversize_data_is_rejected_and_not_stored() {
    let fx = fixture(256).await;
    let mut session = SmtpSession::connect(&fx).await;

    session.send("EHLO client.test").await;
    session.send("MAIL FROM:<sender@example.com>").await;
    session.send("RCPT TO:<alice@local.test>").await;
    session.send("DATA").await;

    let big_body = "x".repeat(1024);
    session
        .send_raw(&format!("Subject: big\r\n\r\n{big_body}\r\n"))
        .await;
    let reply = session.send(".").await;
    assert!(reply.starts_with("552"), "reply: {reply}");

    assert_eq!(fx.store.message_count(&fx.alice_id).await.unwrap(), 0);
}

#[tokio::test]
async fn test_rcpt_before_mail_and_data_before_rcpt_are_bad_sequence() {
    let fx = fixture(1024 * 1024).await;
    let mut session = SmtpSession::connect(&fx).await;

    session.send("EHLO client.test").await;
    let reply = session.send("RCPT TO:<alice@local.test>").await;
    assert!(reply.starts_with("503"), "reply: {reply}");

    session.send("MAIL FROM:<sender@example.com>").await;
    let reply = session.send("DATA").await;
    assert!(reply.starts_with("503"), "reply: {reply}");
}
