use crate::analytics::{
    build_symbol_profile, compute_history_metrics, HistoryMetrics, HistoryPoint, SymbolProfile,
};
use crate::domain::rating_change::RatingChange;
use crate::storage::snapshots::{self, TimeWindow};
use crate::storage::rating_changes;
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;

pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 500;
pub const DEFAULT_HISTORY_LIMIT: u32 = 200;
pub const MAX_HISTORY_LIMIT: u32 = 2000;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RatingChangePage {
    pub items: Vec<RatingChange>,
    pub total: i64,
    pub page: u32,
    pub page_size: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatestSnapshot {
    pub retrieved_at: DateTime<Utc>,
    pub price: Option<f64>,
    pub analyst_rating: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SymbolHistory {
    pub symbol: String,
    pub items: Vec<HistoryPoint>,
    pub limit: u32,
    pub metrics: HistoryMetrics,
    pub profile: SymbolProfile,
    pub latest: LatestSnapshot,
}

/// Read-only projections over the snapshot store and the change ledger.
#[derive(Debug, Clone)]
pub struct QueryService {
    pool: SqlitePool,
}

impl QueryService {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// `page` is 1-based; newest changes first.
    pub async fn list_rating_changes(
        &self,
        page: u32,
        page_size: u32,
    ) -> anyhow::Result<RatingChangePage> {
        let page = page.max(1);
        let page_size = page_size.clamp(1, MAX_PAGE_SIZE);
        let offset = u64::from(page - 1) * u64::from(page_size);

        // One read transaction so the total and the page come from the same committed state.
        let mut tx = self.pool.begin().await.context("begin read transaction failed")?;
        let total = rating_changes::count(&mut *tx)
            .await
            .context("count rating_changes failed")?;
        let items = rating_changes::list(&mut *tx, page_size, offset)
            .await
            .context("list rating_changes failed")?;
        tx.commit().await.context("end read transaction failed")?;

        Ok(RatingChangePage {
            items,
            total,
            page,
            page_size,
        })
    }

    /// `None` when the symbol has never been observed.
    pub async fn symbol_history(
        &self,
        symbol: &str,
        window: TimeWindow,
        limit: u32,
    ) -> anyhow::Result<Option<SymbolHistory>> {
        let limit = limit.clamp(1, MAX_HISTORY_LIMIT);

        let mut tx = self.pool.begin().await.context("begin read transaction failed")?;
        let Some(latest) = snapshots::latest(&mut *tx, symbol)
            .await
            .context("fetch latest snapshot failed")?
        else {
            return Ok(None);
        };
        let history = snapshots::history(&mut *tx, symbol, window, limit)
            .await
            .context("fetch symbol history failed")?;
        tx.commit().await.context("end read transaction failed")?;

        Ok(Some(SymbolHistory {
            symbol: symbol.to_string(),
            items: history.iter().map(HistoryPoint::from).collect(),
            limit,
            metrics: compute_history_metrics(&history),
            profile: build_symbol_profile(&latest),
            latest: LatestSnapshot {
                retrieved_at: latest.retrieved_at,
                price: latest.price,
                analyst_rating: latest.analyst_rating,
            },
        }))
    }

    pub async fn latest_snapshot_time(&self) -> anyhow::Result<Option<DateTime<Utc>>> {
        snapshots::most_recent_retrieved_at(&self.pool)
            .await
            .context("fetch most recent snapshot time failed")
    }
}
