use crate::ingest::types::ScreenerRow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One observation of one symbol at one retrieval instant, as committed to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: i64,
    pub symbol: String,
    pub retrieved_at: DateTime<Utc>,
    pub analyst_rating: Option<String>,
    pub price: Option<f64>,
    pub raw: Value,
}

/// A snapshot that has not been written yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSnapshot {
    pub symbol: String,
    pub retrieved_at: DateTime<Utc>,
    pub analyst_rating: Option<String>,
    pub price: Option<f64>,
    pub raw: Value,
}

impl NewSnapshot {
    /// Returns `None` for rows without a usable symbol.
    pub fn from_row(row: &ScreenerRow, retrieved_at: DateTime<Utc>) -> Option<Self> {
        let symbol = row.symbol.trim();
        if symbol.is_empty() {
            return None;
        }

        Some(Self {
            symbol: symbol.to_string(),
            retrieved_at,
            analyst_rating: normalise_rating(row.analyst_rating.as_deref()),
            price: normalise_price(row.price),
            raw: Value::Object(row.fields.clone()),
        })
    }
}

/// Trimmed rating text; blank ratings are treated as unknown.
pub fn normalise_rating(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

pub fn normalise_price(value: Option<f64>) -> Option<f64> {
    value.filter(|p| p.is_finite())
}
