//! Error types for the trading core

use std::time::Duration;

/// Errors raised by exchange and price-venue calls
#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("rate limited (retry after {retry_after:?}s)")]
    RateLimited { retry_after: Option<u64> },

    /// Exchange-side validation failure, surfaced verbatim
    #[error("exchange rejected request: code {code}: {message}")]
    Rejected { code: i64, message: String },

    #[error("invalid order: {0}")]
    InvalidOrder(String),

    #[error("invalid response: {0}")]
    Decode(String),

    #[error("authentication unavailable: {0}")]
    Auth(String),

    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),
}

impl ExchangeError {
    /// Transient I/O failures are retried at the transport layer only
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExchangeError::Transport(_) | ExchangeError::Timeout(_) | ExchangeError::RateLimited { .. }
        )
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(e: reqwest::Error) -> Self {
        ExchangeError::Transport(e.to_string())
    }
}

/// Errors raised by the durable stores
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("corrupt store {path}: {reason}")]
    Corrupt { path: String, reason: String },

    #[error("unsupported snapshot version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },
}

/// Errors raised by the text-completion client
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("completion request failed: {0}")]
    Transport(String),

    #[error("completion timed out after {0:?}")]
    Timeout(Duration),

    #[error("completion service returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("completion service returned an empty reply")]
    EmptyReply,
}
