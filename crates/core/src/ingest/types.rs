use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Half-open row range `[start, end)` requested from the screener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenerRange {
    pub start: u32,
    pub end: u32,
}

impl ScreenerRange {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One record returned by the data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreenerRow {
    pub symbol: String,
    pub analyst_rating: Option<String>,
    pub price: Option<f64>,
    /// Every field of the record keyed by display label; stored verbatim as the raw payload.
    pub fields: Map<String, Value>,
}
