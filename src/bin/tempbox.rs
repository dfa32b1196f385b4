#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

//! tempbox server
//!
//! Startup wires the services in dependency order (store, cipher,
//! POP3 pool, fetch queue, auth, domain cache, SMTP receiver, HTTP)
//! and tears them down in reverse on the shutdown signal.

use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tempbox::auth::AuthService;
use tempbox::config::Config;
use tempbox::crypto::BlobCipher;
use tempbox::domains::LocalDomains;
use tempbox::fetch::{FetchQueue, Fetcher};
use tempbox::http::{self, AppState, RateLimiter};
use tempbox::pop3::Pop3Pool;
use tempbox::smtp::SmtpReceiver;
use tempbox::store::Store;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Depth of the fetch job queue; enqueuers park when it is full.
const FETCH_QUEUE_DEPTH: usize = 256;

#[derive(Parser)]
#[command(name = "tempbox")]
#[command(about = "Temporary-email gateway: POP3 pull + inbound SMTP over an HTTP API")]
struct Args {
    /// Validate configuration and exit without starting services
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = Config::from_env()?;

    if args.check_config {
        println!(
            "environment={:?} http={} smtp_enabled={} smtp={} database={}",
            config.environment,
            config.http.addr,
            config.smtp.enabled,
            config.smtp.addr,
            config.database_url,
        );
        return Ok(());
    }

    let store = Store::connect(&config.database_url).await?;
    let cipher = Arc::new(BlobCipher::new(&config.encryption_key));
    let pool = Arc::new(Pop3Pool::new(config.pop3.clone()));

    let fetcher = Fetcher::new(
        store.clone(),
        Arc::clone(&pool),
        Arc::clone(&cipher),
        config.limits.clone(),
    );
    let fetch_queue = FetchQueue::start(fetcher, config.pop3.max_concurrent, FETCH_QUEUE_DEPTH);

    let auth = AuthService::new(store.clone(), config.tokens.clone());
    let sweeper = auth.spawn_sweeper();

    let domains = Arc::new(LocalDomains::new());
    domains.refresh(&store).await?;
    let refresher =
        Arc::clone(&domains).spawn_refresher(store.clone(), config.smtp.domain_refresh);

    let smtp_handle = if config.smtp.enabled {
        let receiver = Arc::new(SmtpReceiver::new(
            config.smtp.clone(),
            store.clone(),
            Arc::clone(&domains),
            config.limits.max_attachment_bytes,
        ));
        Some(receiver.start().await?)
    } else {
        info!("SMTP receiver disabled by configuration");
        None
    };

    let state = AppState {
        store: store.clone(),
        auth,
        cipher,
        fetch: fetch_queue,
        domains,
        rate_limiter: Arc::new(RateLimiter::new(
            config.limits.inbox_rate_limit,
            config.limits.inbox_rate_window,
        )),
        environment: config.environment,
        admin_key: config.admin_key.clone(),
    };

    let app = http::router(state);
    let listener = TcpListener::bind(config.http.addr).await?;
    info!("HTTP API listening on {}", listener.local_addr()?);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Dispose in reverse init order: receiver first, then background
    // tasks, then the database pool.
    if let Some(smtp) = &smtp_handle {
        smtp.shutdown();
    }
    refresher.abort();
    sweeper.abort();
    store.close().await;
    info!("shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.ok();
    info!("shutdown signal received");
}
