//! Failure taxonomy for message processing.
//!
//! Every stage reports failures as a [`ProcessError`], whose class decides
//! what the state store records and whether the message is retried.
//! Infrastructure errors (database, filesystem) travel as `anyhow::Error`
//! and are treated as transient when they interrupt a message.

use thiserror::Error;

use crate::models::ErrorClass;

/// A failed processing stage.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// Upstream unavailable, rate limited, or interrupted I/O.
    #[error("transient: {0}")]
    Transient(String),
    /// Unsupported format or malformed data. Never retried automatically.
    #[error("permanent: {0}")]
    Permanent(String),
    /// Denied by the security gate.
    #[error("security: {0}")]
    SecurityRejected(String),
}

impl ProcessError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ProcessError::Transient(_) => ErrorClass::Transient,
            ProcessError::Permanent(_) => ErrorClass::Permanent,
            ProcessError::SecurityRejected(_) => ErrorClass::Security,
        }
    }

    /// The reason without the class prefix, as stored in `last_error`.
    pub fn reason(&self) -> &str {
        match self {
            ProcessError::Transient(r)
            | ProcessError::Permanent(r)
            | ProcessError::SecurityRejected(r) => r,
        }
    }
}

impl From<anyhow::Error> for ProcessError {
    fn from(err: anyhow::Error) -> Self {
        ProcessError::Transient(format!("{:#}", err))
    }
}

impl From<std::io::Error> for ProcessError {
    fn from(err: std::io::Error) -> Self {
        ProcessError::Transient(err.to_string())
    }
}

impl From<sqlx::Error> for ProcessError {
    fn from(err: sqlx::Error) -> Self {
        ProcessError::Transient(format!("database: {}", err))
    }
}

/// Extraction adapter failure. No adapter panics; every failure maps here.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported codec: {0}")]
    UnsupportedCodec(String),
    #[error("unsupported content: {0}")]
    Unsupported(String),
    #[error("empty payload")]
    EmptyPayload,
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("blocked url: {0}")]
    BlockedUrl(String),
    #[error("payload unavailable: {0}")]
    Payload(String),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("OOXML extraction failed: {0}")]
    Ooxml(String),
}

impl ExtractError {
    /// Whether re-running the same extraction later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExtractError::ServiceUnavailable(_) | ExtractError::Fetch(_) | ExtractError::Payload(_)
        )
    }
}

impl From<ExtractError> for ProcessError {
    fn from(err: ExtractError) -> Self {
        if err.is_transient() {
            ProcessError::Transient(err.to_string())
        } else {
            ProcessError::Permanent(err.to_string())
        }
    }
}
