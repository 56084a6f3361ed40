use crate::domain::rating_change::RatingChange;
use crate::domain::snapshot::NewSnapshot;
use crate::storage::error::StoreError;
use crate::storage::{rating_changes, snapshots};
use sqlx::SqlitePool;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommittedCycle {
    pub snapshots: usize,
    pub changes: Vec<RatingChange>,
}

/// Writes one cycle's snapshots and the rating changes they trigger as a single transaction.
///
/// Any failure drops the transaction, which rolls back every row of the batch; readers see
/// either the state before the cycle or all of it.
pub async fn commit_cycle(
    pool: &SqlitePool,
    batch: &[NewSnapshot],
) -> Result<CommittedCycle, StoreError> {
    let mut tx = pool.begin().await?;
    let mut changes = Vec::new();

    for new in batch {
        let previous = snapshots::latest_before(&mut *tx, &new.symbol, new.retrieved_at).await?;
        let current = snapshots::append(&mut tx, new).await?;
        if let Some(change) =
            rating_changes::detect_and_record(&mut tx, previous.as_ref(), &current).await?
        {
            changes.push(change);
        }
    }

    tx.commit().await?;

    Ok(CommittedCycle {
        snapshots: batch.len(),
        changes,
    })
}
