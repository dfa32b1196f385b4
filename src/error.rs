//! Error types for tempbox
//!
//! One variant per error kind the HTTP boundary knows how to map.
//! Ingestion-side failures (transport, protocol `-ERR`, timeout,
//! throttle) all fold into [`Error::Pop3`] tagged with the command
//! that failed.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("authentication error: {0}")]
    Authentication(String),

    #[error("authorization error: {0}")]
    Authorization(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("POP3 {command} failed: {message}")]
    Pop3 {
        command: &'static str,
        message: String,
    },

    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a POP3 error labeled with the command that produced it.
    pub fn pop3(command: &'static str, message: impl Into<String>) -> Self {
        Self::Pop3 {
            command,
            message: message.into(),
        }
    }

    /// The stable machine-readable code for the HTTP error envelope.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Authentication(_) => "AUTHENTICATION_ERROR",
            Self::Authorization(_) => "AUTHORIZATION_ERROR",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::RateLimit(_) => "RATE_LIMIT_EXCEEDED",
            Self::Pop3 { .. } => "POP3_ERROR",
            Self::Encryption(_) => "ENCRYPTION_ERROR",
            Self::Database(_) | Self::Io(_) | Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal(format!("JSON serialization: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pop3_errors_carry_the_command_name() {
        let e = Error::pop3("UIDL", "-ERR busy");
        assert_eq!(e.code(), "POP3_ERROR");
        assert!(e.to_string().contains("UIDL"));
    }

    #[test]
    fn infrastructure_errors_map_to_internal() {
        let e = Error::from(std::io::Error::other("boom"));
        assert_eq!(e.code(), "INTERNAL_ERROR");
    }
}
