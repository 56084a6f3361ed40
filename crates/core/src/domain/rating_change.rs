use crate::domain::snapshot::Snapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A recorded transition of a symbol's analyst rating.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatingChange {
    pub id: i64,
    pub symbol: String,
    pub changed_at: DateTime<Utc>,
    pub old_rating: Option<String>,
    pub new_rating: Option<String>,
    pub price_before: Option<f64>,
    pub price_after: Option<f64>,
    pub snapshot_id: i64,
}

/// A detected but not yet recorded rating change.
#[derive(Debug, Clone, PartialEq)]
pub struct RatingTransition {
    pub symbol: String,
    pub changed_at: DateTime<Utc>,
    pub old_rating: Option<String>,
    pub new_rating: Option<String>,
    pub price_before: Option<f64>,
    pub price_after: Option<f64>,
    pub snapshot_id: i64,
}

impl RatingTransition {
    /// Compares only `analyst_rating`. A symbol seen for the first time has no transition.
    pub fn detect(previous: Option<&Snapshot>, current: &Snapshot) -> Option<Self> {
        let previous = previous?;
        if previous.analyst_rating == current.analyst_rating {
            return None;
        }

        Some(Self {
            symbol: current.symbol.clone(),
            changed_at: current.retrieved_at,
            old_rating: previous.analyst_rating.clone(),
            new_rating: current.analyst_rating.clone(),
            price_before: previous.price,
            price_after: current.price,
            snapshot_id: current.id,
        })
    }

    pub fn into_change(self, id: i64) -> RatingChange {
        RatingChange {
            id,
            symbol: self.symbol,
            changed_at: self.changed_at,
            old_rating: self.old_rating,
            new_rating: self.new_rating,
            price_before: self.price_before,
            price_after: self.price_after,
            snapshot_id: self.snapshot_id,
        }
    }
}
