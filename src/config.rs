//! Process configuration
//!
//! Loaded once from environment variables at startup (reading `.env`
//! if present), then handed to components as immutable typed
//! substructures. Nothing reads process env after init.

use crate::error::{Error, Result};
use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// Deployment environment. Production tightens validation (SSRF
/// guard on external POP3 hosts) and masks internal error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    #[must_use]
    pub const fn is_production(self) -> bool {
        matches!(self, Self::Production)
    }
}

impl FromStr for Environment {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            other => Err(Error::Validation(format!("Invalid ENVIRONMENT: {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub addr: SocketAddr,
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub enabled: bool,
    pub addr: SocketAddr,
    pub banner: String,
    pub max_message_size: usize,
    /// How often the local-domain cache is refreshed from the store.
    pub domain_refresh: Duration,
}

#[derive(Debug, Clone)]
pub struct Pop3PoolConfig {
    pub max_concurrent: usize,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub throttle_window: Duration,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct TokenConfig {
    pub default_ttl: Duration,
    pub max_ttl: Duration,
    pub sweep_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct LimitsConfig {
    /// Hard cap on messages retrieved per fetch job.
    pub max_fetch: usize,
    /// Per-attachment size cap; larger parts are dropped at parse time.
    pub max_attachment_bytes: usize,
    /// Inbox creations allowed per caller IP per window.
    pub inbox_rate_limit: u32,
    pub inbox_rate_window: Duration,
}

/// Immutable process-wide configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub environment: Environment,
    pub http: HttpConfig,
    pub smtp: SmtpConfig,
    pub pop3: Pop3PoolConfig,
    pub tokens: TokenConfig,
    pub limits: LimitsConfig,
    pub database_url: String,
    /// Raw key material for the credential cipher. Never logged.
    pub encryption_key: String,
    pub admin_key: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Reads from `.env` file if present. Required variables:
    /// - `ENCRYPTION_KEY`
    /// - `ADMIN_KEY`
    ///
    /// Everything else has a default; see the `var_or` calls below.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            environment: var_or("ENVIRONMENT", "development").parse()?,
            http: HttpConfig {
                addr: parse_var("HTTP_ADDR", "0.0.0.0:8080")?,
            },
            smtp: SmtpConfig {
                enabled: parse_var("SMTP_ENABLED", "true")?,
                addr: parse_var("SMTP_ADDR", "0.0.0.0:2525")?,
                banner: var_or("SMTP_BANNER", "tempbox ESMTP"),
                max_message_size: parse_var("SMTP_MAX_MESSAGE_SIZE", "26214400")?,
                domain_refresh: secs_var("DOMAIN_REFRESH_SECS", "60")?,
            },
            pop3: Pop3PoolConfig {
                max_concurrent: parse_var("POP3_MAX_CONCURRENT", "8")?,
                max_retries: parse_var("POP3_MAX_RETRIES", "3")?,
                backoff_base: millis_var("POP3_BACKOFF_MS", "500")?,
                throttle_window: secs_var("POP3_THROTTLE_SECS", "30")?,
                connect_timeout: secs_var("POP3_CONNECT_TIMEOUT_SECS", "10")?,
                command_timeout: secs_var("POP3_COMMAND_TIMEOUT_SECS", "30")?,
            },
            tokens: TokenConfig {
                default_ttl: secs_var("TOKEN_TTL_SECS", "600")?,
                max_ttl: secs_var("TOKEN_MAX_TTL_SECS", "604800")?,
                sweep_interval: secs_var("TOKEN_SWEEP_SECS", "300")?,
            },
            limits: LimitsConfig {
                max_fetch: parse_var("MAX_FETCH", "50")?,
                max_attachment_bytes: parse_var("MAX_ATTACHMENT_BYTES", "5242880")?,
                inbox_rate_limit: parse_var("INBOX_RATE_LIMIT", "10")?,
                inbox_rate_window: secs_var("INBOX_RATE_WINDOW_SECS", "3600")?,
            },
            database_url: var_or("DATABASE_URL", "sqlite://tempbox.db"),
            encryption_key: env::var("ENCRYPTION_KEY")
                .map_err(|_| Error::Validation("ENCRYPTION_KEY not set".into()))?,
            admin_key: env::var("ADMIN_KEY")
                .map_err(|_| Error::Validation("ADMIN_KEY not set".into()))?,
        })
    }
}

fn var_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T: FromStr>(name: &str, default: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    var_or(name, default)
        .parse()
        .map_err(|e| Error::Validation(format!("Invalid {name}: {e}")))
}

fn secs_var(name: &str, default: &str) -> Result<Duration> {
    parse_var::<u64>(name, default).map(Duration::from_secs)
}

fn millis_var(name: &str, default: &str) -> Result<Duration> {
    parse_var::<u64>(name, default).map(Duration::from_millis)
}
