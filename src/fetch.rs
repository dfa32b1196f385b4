//! Fetch worker
//!
//! A bounded job queue over a fixed worker pool. Each job pulls new
//! mail for one inbox: UIDL diff against the cursor, RETR the new
//! slice, parse, persist idempotently, then advance the cursor.
//! Jobs for the same inbox are not coalesced; the cursor advance is
//! conditional so concurrent jobs cannot regress it.

use crate::config::LimitsConfig;
use crate::crypto::BlobCipher;
use crate::error::{Error, Result};
use crate::mime::parse_message;
use crate::pop3::{Pop3Account, Pop3Pool, UidlEntry};
use crate::store::Store;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// One fetch request.
#[derive(Debug, Clone)]
pub struct FetchJob {
    pub inbox_id: String,
    /// Cursor override; falls back to the inbox's stored cursor.
    pub since_uid: Option<String>,
    pub limit: Option<usize>,
}

/// What a completed job accomplished.
#[derive(Debug, Clone)]
pub struct FetchSummary {
    /// Raw messages retrieved this run.
    pub fetched: usize,
    /// Messages newly persisted (conflicts excluded).
    pub inserted: u64,
    pub last_seen_uid: Option<String>,
}

/// The fetch pipeline: credentials, pooled POP3 session, parse,
/// persist. Cheap to clone; one instance is shared by all workers.
#[derive(Clone)]
pub struct Fetcher {
    store: Store,
    pool: Arc<Pop3Pool>,
    cipher: Arc<BlobCipher>,
    limits: LimitsConfig,
}

impl Fetcher {
    #[must_use]
    pub const fn new(
        store: Store,
        pool: Arc<Pop3Pool>,
        cipher: Arc<BlobCipher>,
        limits: LimitsConfig,
    ) -> Self {
        Self {
            store,
            pool,
            cipher,
            limits,
        }
    }

    /// Run one job to completion.
    ///
    /// Per-message retrieval failures are logged and skipped; a
    /// credential-level failure aborts the whole job.
    pub async fn run(&self, job: &FetchJob) -> Result<FetchSummary> {
        let inbox = self
            .store
            .inbox_by_id(&job.inbox_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("inbox {}", job.inbox_id)))?;

        if !inbox.is_active() {
            return Err(Error::Authorization(format!(
                "inbox {} is not active",
                inbox.id
            )));
        }

        // Locally-hosted generated inboxes receive mail via SMTP;
        // there is no POP3 backend to pull from.
        let Some(host) = inbox.pop3_host.clone() else {
            debug!(inbox = %inbox.id, "no POP3 backend; nothing to fetch");
            return Ok(FetchSummary {
                fetched: 0,
                inserted: 0,
                last_seen_uid: inbox.last_seen_uid,
            });
        };

        let account = Pop3Account {
            host,
            port: u16::try_from(inbox.pop3_port.unwrap_or(995)).unwrap_or(995),
            tls: inbox.uses_tls(),
            username: self.cipher.decrypt_string(&inbox.username_enc)?,
            password: self.cipher.decrypt_string(&inbox.password_enc)?,
        };

        let observed_cursor = inbox.last_seen_uid.clone();
        let since = job.since_uid.clone().or_else(|| observed_cursor.clone());
        let take = job
            .limit
            .unwrap_or(self.limits.max_fetch)
            .min(self.limits.max_fetch);

        let fetched: Vec<(String, Vec<u8>)> = self
            .pool
            .execute(&account, |client| {
                let since = since.clone();
                Box::pin(async move {
                    let listing = client.uidl().await?;
                    let start = candidate_start(&listing, since.as_deref());
                    let mut out = Vec::new();
                    for entry in listing[start..].iter().take(take) {
                        match client.retr(entry.num).await {
                            Ok(raw) => out.push((entry.uid.clone(), raw)),
                            Err(e) => {
                                warn!(uid = %entry.uid, "RETR failed; skipping message: {e}");
                            }
                        }
                    }
                    Ok(out)
                })
            })
            .await?;

        if fetched.is_empty() {
            return Ok(FetchSummary {
                fetched: 0,
                inserted: 0,
                last_seen_uid: observed_cursor,
            });
        }

        let parsed: Vec<_> = fetched
            .iter()
            .map(|(uid, raw)| parse_message(uid, raw, self.limits.max_attachment_bytes))
            .collect();

        let inserted = self.store.insert_messages(&inbox.id, &parsed).await?;

        // The provider's UIDL ordering is the authority for the
        // cursor; advance to the last uid actually retrieved.
        let new_cursor = fetched
            .last()
            .map(|(uid, _)| uid.clone())
            .unwrap_or_default();
        let advanced = self
            .store
            .advance_last_seen_uid(&inbox.id, observed_cursor.as_deref(), &new_cursor)
            .await?;
        if !advanced {
            warn!(
                inbox = %inbox.id,
                "cursor moved under a concurrent fetch; leaving it alone"
            );
        }

        info!(
            inbox = %inbox.id,
            fetched = fetched.len(),
            inserted,
            cursor = %new_cursor,
            "fetch complete"
        );

        Ok(FetchSummary {
            fetched: fetched.len(),
            inserted,
            last_seen_uid: Some(new_cursor),
        })
    }
}

/// Index of the first UIDL entry after the cursor. An absent or
/// unknown cursor (initial fetch, provider UID reset) selects the
/// whole list.
fn candidate_start(listing: &[UidlEntry], since_uid: Option<&str>) -> usize {
    since_uid
        .and_then(|uid| listing.iter().position(|e| e.uid == uid))
        .map_or(0, |i| i + 1)
}

struct Queued {
    job: FetchJob,
    reply: oneshot::Sender<Result<FetchSummary>>,
}

/// Handle for enqueueing fetch jobs. FIFO across jobs, interleaved
/// by the worker pool.
#[derive(Clone)]
pub struct FetchQueue {
    tx: mpsc::Sender<Queued>,
}

impl FetchQueue {
    /// Spawn `workers` consumers over a queue of `depth` slots.
    #[must_use]
    pub fn start(fetcher: Fetcher, workers: usize, depth: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Queued>(depth.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        for _ in 0..workers.max(1) {
            let rx = Arc::clone(&rx);
            let fetcher = fetcher.clone();
            tokio::spawn(async move {
                loop {
                    let queued = rx.lock().await.recv().await;
                    let Some(Queued { job, reply }) = queued else {
                        break;
                    };
                    let result = fetcher.run(&job).await;
                    // The caller may have stopped waiting; late
                    // results are droppable by design of the queue.
                    let _ = reply.send(result);
                }
            });
        }

        Self { tx }
    }

    /// Enqueue a job and wait for its outcome.
    pub async fn fetch(&self, job: FetchJob) -> Result<FetchSummary> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Queued {
                job,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::Internal("fetch queue is shut down".into()))?;
        reply_rx
            .await
            .map_err(|_| Error::Internal("fetch worker dropped the job".into()))?
    }
}
