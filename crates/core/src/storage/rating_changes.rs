use crate::domain::rating_change::{RatingChange, RatingTransition};
use crate::domain::snapshot::Snapshot;
use crate::storage::error::StoreError;
use chrono::{DateTime, Utc};
use sqlx::{Sqlite, SqliteConnection};

type RatingChangeRow = (
    i64,
    String,
    DateTime<Utc>,
    Option<String>,
    Option<String>,
    Option<f64>,
    Option<f64>,
    i64,
);

/// Compares `current` against the symbol's previous snapshot and records a change if the
/// analyst rating moved. Must run inside the same transaction that appended `current`.
pub async fn detect_and_record(
    conn: &mut SqliteConnection,
    previous: Option<&Snapshot>,
    current: &Snapshot,
) -> Result<Option<RatingChange>, StoreError> {
    let Some(transition) = RatingTransition::detect(previous, current) else {
        return Ok(None);
    };

    let res = sqlx::query(
        "INSERT INTO rating_changes \
         (symbol, changed_at, old_rating, new_rating, price_before, price_after, snapshot_id) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )
    .bind(&transition.symbol)
    .bind(transition.changed_at)
    .bind(&transition.old_rating)
    .bind(&transition.new_rating)
    .bind(transition.price_before)
    .bind(transition.price_after)
    .bind(transition.snapshot_id)
    .execute(&mut *conn)
    .await?;

    Ok(Some(transition.into_change(res.last_insert_rowid())))
}

/// Newest first; ties on `changed_at` (one cycle) fall back to insertion order, newest first.
pub async fn list<'e, E>(executor: E, limit: u32, offset: u64) -> Result<Vec<RatingChange>, StoreError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query_as::<_, RatingChangeRow>(
        "SELECT id, symbol, changed_at, old_rating, new_rating, price_before, price_after, snapshot_id \
         FROM rating_changes \
         ORDER BY changed_at DESC, id DESC \
         LIMIT ?1 OFFSET ?2",
    )
    .bind(i64::from(limit))
    .bind(i64::try_from(offset).unwrap_or(i64::MAX))
    .fetch_all(executor)
    .await?;

    Ok(rows.into_iter().map(into_change).collect())
}

pub async fn count<'e, E>(executor: E) -> Result<i64, StoreError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM rating_changes")
        .fetch_one(executor)
        .await?;
    Ok(n)
}

fn into_change(row: RatingChangeRow) -> RatingChange {
    let (id, symbol, changed_at, old_rating, new_rating, price_before, price_after, snapshot_id) =
        row;
    RatingChange {
        id,
        symbol,
        changed_at,
        old_rating,
        new_rating,
        price_before,
        price_after,
        snapshot_id,
    }
}
