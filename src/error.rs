//! Error types for the trading engine

use thiserror::Error;

/// Result type alias using our custom Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the trading engine
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    // Market data errors (transient)
    #[error("Market data unavailable: {0}")]
    DataUnavailable(String),

    #[error("Rate limited by {service}, retry after {retry_after_ms}ms")]
    RateLimited {
        service: String,
        retry_after_ms: u64,
    },

    #[error("Port call timed out after {0}ms")]
    Timeout(u64),

    #[error("Stale quote for {ticker}: {age_secs}s old")]
    StaleQuote { ticker: String, age_secs: i64 },

    // Broker-domain errors
    #[error("Order rejected: {0}")]
    Rejected(String),

    #[error("Insufficient buying power: {required:.2} required, {available:.2} available")]
    InsufficientBuyingPower { required: f64, available: f64 },

    #[error("Market is closed")]
    MarketClosed,

    // Validation errors
    #[error("Invalid ticker symbol: {0}")]
    InvalidTicker(String),

    #[error("Invalid bar: {0}")]
    InvalidBar(String),

    #[error("Invalid quote: {0}")]
    InvalidQuote(String),

    // Position management errors
    #[error("Position not found: {0}")]
    PositionNotFound(String),

    // Confirmation errors
    #[error("Confirmation not found: {0}")]
    ConfirmationNotFound(String),

    // Journal errors
    #[error("Journal append failed: {0}")]
    JournalAppend(String),

    #[error("Journal record not found: {family}/{id}")]
    JournalRecordNotFound { family: String, id: String },

    // Notifier errors
    #[error("Notifier send failed: {0}")]
    NotifierSend(String),

    // Safety limit errors
    #[error("Daily loss limit reached: lost {lost_pct:.1}%, limit is {limit_pct:.1}%")]
    DailyLossLimitReached { lost_pct: f64, limit_pct: f64 },

    #[error("Daily trade limit reached: {0} trades")]
    DailyTradeLimitReached(u32),

    // Invariant violations - programmer errors, never silently recovered
    #[error("Invariant violated: {0}")]
    Invariant(String),

    // Fatal errors - trigger graceful shutdown
    #[error("Fatal: {0}")]
    Fatal(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is transient (recoverable by retry or
    /// neutral-contribution fallback)
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::DataUnavailable(_)
                | Error::RateLimited { .. }
                | Error::Timeout(_)
                | Error::StaleQuote { .. }
        )
    }

    /// Check if this error belongs to the broker domain (recoverable by
    /// skipping or waiting)
    pub fn is_broker_domain(&self) -> bool {
        matches!(
            self,
            Error::Rejected(_) | Error::InsufficientBuyingPower { .. } | Error::MarketClosed
        )
    }

    /// Check if this error is an invariant violation
    pub fn is_invariant(&self) -> bool {
        matches!(self, Error::Invariant(_))
    }

    /// Check if this error is unrecoverable and must trigger shutdown
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal(_) | Error::JournalAppend(_))
    }

    /// Check if this error is a safety violation
    pub fn is_safety_violation(&self) -> bool {
        matches!(
            self,
            Error::DailyLossLimitReached { .. } | Error::DailyTradeLimitReached(_)
        )
    }
}

// Conversion from reqwest errors
impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout(0)
        } else {
            Error::DataUnavailable(e.to_string())
        }
    }
}

// Conversion from serde_json errors
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

// Conversion from I/O errors
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}
