use std::time::Duration;
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),

    /// Timeouts, connection resets, 5xx responses
    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    /// Malformed exchange payload
    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Unsupported timeframe: {0}")]
    UnsupportedTimeframe(String),

    /// Historical fetch gave up mid-range
    #[error("Partial range: {0}")]
    PartialRange(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("{0}")]
    Other(String),
}

impl AppError {
    /// True for errors worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, AppError::Network(_) | AppError::RateLimit(_))
    }

    /// Base delay before retry attempt `attempt` (1-based). Rate limits back off longer.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let base = 2.0_f64.powi(attempt.saturating_sub(1) as i32);
        let secs = match self {
            AppError::RateLimit(_) => base * 5.0,
            _ => base,
        };
        Duration::from_secs_f64(secs.min(60.0))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Io(err.to_string())
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Database(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            AppError::Decode(err.to_string())
        } else {
            AppError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Decode(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for AppError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        AppError::Network(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

// Alias for convenience
pub type Error = AppError;
