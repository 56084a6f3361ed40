use crate::ingest::types::{ScreenerRange, ScreenerRow};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum AdapterError {
    #[error("screener request timed out")]
    Timeout,

    #[error("screener transport error: {0}")]
    Transport(String),

    #[error("screener rate limited the request")]
    RateLimited,

    #[error("screener HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("malformed screener response: {0}")]
    Malformed(String),
}

impl AdapterError {
    /// Transient failures are retried within a cycle; permanent ones abandon it immediately.
    pub fn is_transient(&self) -> bool {
        match self {
            AdapterError::Timeout | AdapterError::Transport(_) | AdapterError::RateLimited => true,
            AdapterError::Http { status, .. } => *status >= 500,
            AdapterError::Malformed(_) => false,
        }
    }
}

#[async_trait::async_trait]
pub trait DataSource: Send + Sync {
    fn source_name(&self) -> &'static str;

    async fn fetch(&self, range: ScreenerRange) -> Result<Vec<ScreenerRow>, AdapterError>;
}
