use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("snapshot already exists for {symbol} at {retrieved_at}")]
    DuplicateKey {
        symbol: String,
        retrieved_at: DateTime<Utc>,
    },

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("raw payload could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}
