use crate::domain::snapshot::{NewSnapshot, Snapshot};
use crate::storage::error::StoreError;
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

type SnapshotRow = (
    i64,
    String,
    DateTime<Utc>,
    Option<String>,
    Option<f64>,
    String,
);

const SNAPSHOT_COLUMNS: &str = "id, symbol, retrieved_at, analyst_rating, price, raw_json";

/// Inclusive time bounds; `None` leaves that side open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

/// Inserts a snapshot. Must run inside the cycle's transaction.
///
/// The UNIQUE (symbol, retrieved_at) constraint is what rejects duplicates, so a caller
/// reusing a timestamp gets `DuplicateKey` rather than an overwrite.
pub async fn append(
    conn: &mut SqliteConnection,
    snapshot: &NewSnapshot,
) -> Result<Snapshot, StoreError> {
    if snapshot.symbol.trim().is_empty() {
        return Err(StoreError::InvalidSnapshot(
            "symbol must be non-empty".to_string(),
        ));
    }

    let raw_json = serde_json::to_string(&snapshot.raw)?;

    let res = sqlx::query(
        "INSERT INTO snapshots (symbol, retrieved_at, analyst_rating, price, raw_json) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )
    .bind(&snapshot.symbol)
    .bind(snapshot.retrieved_at)
    .bind(&snapshot.analyst_rating)
    .bind(snapshot.price)
    .bind(raw_json)
    .execute(&mut *conn)
    .await;

    let res = match res {
        Ok(res) => res,
        Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
            return Err(StoreError::DuplicateKey {
                symbol: snapshot.symbol.clone(),
                retrieved_at: snapshot.retrieved_at,
            });
        }
        Err(e) => return Err(e.into()),
    };

    Ok(Snapshot {
        id: res.last_insert_rowid(),
        symbol: snapshot.symbol.clone(),
        retrieved_at: snapshot.retrieved_at,
        analyst_rating: snapshot.analyst_rating.clone(),
        price: snapshot.price,
        raw: snapshot.raw.clone(),
    })
}

pub async fn latest<'e, E>(executor: E, symbol: &str) -> Result<Option<Snapshot>, StoreError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query_as::<_, SnapshotRow>(&format!(
        "SELECT {SNAPSHOT_COLUMNS} FROM snapshots \
         WHERE symbol = ?1 \
         ORDER BY retrieved_at DESC \
         LIMIT 1"
    ))
    .bind(symbol)
    .fetch_optional(executor)
    .await?;

    row.map(into_snapshot).transpose()
}

/// The symbol's last known state strictly before `before`, however many cycles ago that was.
pub async fn latest_before<'e, E>(
    executor: E,
    symbol: &str,
    before: DateTime<Utc>,
) -> Result<Option<Snapshot>, StoreError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query_as::<_, SnapshotRow>(&format!(
        "SELECT {SNAPSHOT_COLUMNS} FROM snapshots \
         WHERE symbol = ?1 AND retrieved_at < ?2 \
         ORDER BY retrieved_at DESC \
         LIMIT 1"
    ))
    .bind(symbol)
    .bind(before)
    .fetch_optional(executor)
    .await?;

    row.map(into_snapshot).transpose()
}

/// Snapshots inside `window`, ascending by time. When more than `limit` match, the most
/// recent `limit` are returned.
pub async fn history<'e, E>(
    executor: E,
    symbol: &str,
    window: TimeWindow,
    limit: u32,
) -> Result<Vec<Snapshot>, StoreError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let mut qb = QueryBuilder::<Sqlite>::new(format!(
        "SELECT {SNAPSHOT_COLUMNS} FROM snapshots WHERE symbol = "
    ));
    qb.push_bind(symbol.to_string());
    if let Some(start) = window.start {
        qb.push(" AND retrieved_at >= ").push_bind(start);
    }
    if let Some(end) = window.end {
        qb.push(" AND retrieved_at <= ").push_bind(end);
    }
    qb.push(" ORDER BY retrieved_at DESC LIMIT ")
        .push_bind(i64::from(limit));

    let rows = qb
        .build_query_as::<SnapshotRow>()
        .fetch_all(executor)
        .await?;

    let mut out = rows
        .into_iter()
        .map(into_snapshot)
        .collect::<Result<Vec<_>, _>>()?;
    out.reverse();
    Ok(out)
}

pub async fn most_recent_retrieved_at<'e, E>(
    executor: E,
) -> Result<Option<DateTime<Utc>>, StoreError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let ts: Option<DateTime<Utc>> =
        sqlx::query_scalar("SELECT retrieved_at FROM snapshots ORDER BY retrieved_at DESC LIMIT 1")
            .fetch_optional(executor)
            .await?;
    Ok(ts)
}

pub async fn count<'e, E>(executor: E) -> Result<i64, StoreError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM snapshots")
        .fetch_one(executor)
        .await?;
    Ok(n)
}

fn into_snapshot(row: SnapshotRow) -> Result<Snapshot, StoreError> {
    let (id, symbol, retrieved_at, analyst_rating, price, raw_json) = row;
    Ok(Snapshot {
        id,
        symbol,
        retrieved_at,
        analyst_rating,
        price,
        raw: serde_json::from_str(&raw_json)?,
    })
}
