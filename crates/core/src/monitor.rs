use crate::domain::rating_change::RatingChange;
use crate::domain::snapshot::NewSnapshot;
use crate::ingest::source::{AdapterError, DataSource};
use crate::ingest::types::{ScreenerRange, ScreenerRow};
use crate::status::{CycleSummary, MonitorPhase, RunOutcome, StatusPublisher, StatusReader};
use crate::storage::cycle::commit_cycle;
use crate::storage::error::StoreError;
use crate::storage::snapshots;
use chrono::{DateTime, SubsecRound, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Pause between the end of one cycle and the start of the next.
    pub interval: Duration,
    pub range: ScreenerRange,
    pub max_attempts: u32,
    pub retry_backoff: Duration,
}

impl MonitorConfig {
    /// Linear backoff: the wait after the n-th failed attempt is `n * retry_backoff`.
    pub fn backoff_after(&self, failed_attempts: u32) -> Duration {
        self.retry_backoff.saturating_mul(failed_attempts)
    }
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("fetch failed after {attempts} attempt(s): {source}")]
    Fetch {
        attempts: u32,
        #[source]
        source: AdapterError,
    },

    #[error("persisting cycle failed: {0}")]
    Store(#[from] StoreError),

    #[error("cycle interrupted by shutdown")]
    Interrupted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub retrieved_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    pub processed: usize,
    pub skipped: usize,
    pub attempts: u32,
    pub changes: Vec<RatingChange>,
}

/// Cooperative stop request for the monitor loop.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

pub fn shutdown_channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, ShutdownSignal { rx })
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

impl ShutdownSignal {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is requested. Never resolves if the trigger was dropped unused.
    pub async fn triggered(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Single writer for the snapshot store and the change ledger.
pub struct Monitor {
    pool: SqlitePool,
    source: Arc<dyn DataSource>,
    config: MonitorConfig,
    status: StatusPublisher,
    last_retrieved_at: Option<DateTime<Utc>>,
}

impl Monitor {
    pub fn new(
        pool: SqlitePool,
        source: Arc<dyn DataSource>,
        config: MonitorConfig,
        status: StatusPublisher,
    ) -> Self {
        Self {
            pool,
            source,
            config,
            status,
            last_retrieved_at: None,
        }
    }

    pub fn status(&self) -> StatusReader {
        self.status.reader()
    }

    /// Runs cycles until `shutdown` fires. The interval is measured from the end of the
    /// previous cycle, so cycles never overlap.
    pub async fn run(mut self, mut shutdown: ShutdownSignal) {
        self.status.set_phase(MonitorPhase::Idle);
        tracing::info!(
            source = self.source.source_name(),
            interval_secs = self.config.interval.as_secs(),
            range_start = self.config.range.start,
            range_end = self.config.range.end,
            max_attempts = self.config.max_attempts,
            "monitor started"
        );

        while !shutdown.is_triggered() {
            match self.cycle(&mut shutdown).await {
                Ok(_) | Err(CycleError::Interrupted) => {}
                Err(_) => self.status.set_phase(MonitorPhase::Idle),
            }

            if shutdown.is_triggered() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {}
                _ = shutdown.triggered() => break,
            }
        }

        self.status.set_phase(MonitorPhase::Stopped);
        tracing::info!("monitor stopped");
    }

    /// One fetch-compare-persist cycle, outside the scheduled loop.
    pub async fn run_cycle(&mut self) -> Result<CycleReport, CycleError> {
        let (_trigger, mut shutdown) = shutdown_channel();
        self.cycle(&mut shutdown).await
    }

    async fn cycle(&mut self, shutdown: &mut ShutdownSignal) -> Result<CycleReport, CycleError> {
        let started_at = Utc::now();
        self.status.record_started(started_at);

        let result = self.fetch_compare_persist(shutdown).await;
        let finished_at = Utc::now();

        match &result {
            Ok(report) => {
                for change in &report.changes {
                    tracing::info!(
                        symbol = %change.symbol,
                        old_rating = change.old_rating.as_deref().unwrap_or("-"),
                        new_rating = change.new_rating.as_deref().unwrap_or("-"),
                        price_before = ?change.price_before,
                        price_after = ?change.price_after,
                        "analyst rating changed"
                    );
                }
                tracing::info!(
                    retrieved_at = %report.retrieved_at,
                    processed = report.processed,
                    skipped = report.skipped,
                    changes = report.changes.len(),
                    attempts = report.attempts,
                    elapsed_ms = (finished_at - started_at).num_milliseconds(),
                    "monitor cycle committed"
                );
                self.status.record_committed(CycleSummary {
                    finished_at,
                    processed: report.processed,
                    skipped: report.skipped,
                    attempts: report.attempts,
                    changes: report.changes.clone(),
                });
            }
            Err(CycleError::Interrupted) => {
                tracing::info!("monitor cycle abandoned for shutdown; nothing written");
                self.status.set_phase(MonitorPhase::Idle);
            }
            Err(err) => {
                let attempts = match err {
                    CycleError::Fetch { attempts, .. } => *attempts,
                    _ => 0,
                };
                tracing::error!(error = %err, attempts, "monitor cycle failed");
                self.status
                    .record_failure(finished_at, attempts, err.to_string());
            }
        }

        result
    }

    async fn fetch_compare_persist(
        &mut self,
        shutdown: &mut ShutdownSignal,
    ) -> Result<CycleReport, CycleError> {
        let (rows, attempts) = self.fetch_with_retries(shutdown).await?;

        self.status.set_phase(MonitorPhase::Comparing);
        let retrieved_at = self.next_retrieved_at().await?;
        let (batch, skipped) = build_batch(&rows, retrieved_at);
        if skipped > 0 {
            tracing::warn!(skipped, "screener rows without a symbol were skipped");
        }

        // Not raced against shutdown: an in-flight commit always completes.
        self.status.set_phase(MonitorPhase::Persisting);
        let committed = commit_cycle(&self.pool, &batch).await?;
        self.last_retrieved_at = Some(retrieved_at);

        Ok(CycleReport {
            retrieved_at,
            outcome: if skipped > 0 {
                RunOutcome::Partial
            } else {
                RunOutcome::Success
            },
            processed: committed.snapshots,
            skipped,
            attempts,
            changes: committed.changes,
        })
    }

    async fn fetch_with_retries(
        &self,
        shutdown: &mut ShutdownSignal,
    ) -> Result<(Vec<ScreenerRow>, u32), CycleError> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            self.status.set_phase(MonitorPhase::Fetching);

            let res = tokio::select! {
                res = self.source.fetch(self.config.range) => res,
                _ = shutdown.triggered() => return Err(CycleError::Interrupted),
            };

            let err = match res {
                Ok(rows) => return Ok((rows, attempt)),
                Err(err) => err,
            };

            if !err.is_transient() {
                tracing::warn!(attempt, error = %err, "screener fetch failed permanently; not retrying");
                return Err(CycleError::Fetch {
                    attempts: attempt,
                    source: err,
                });
            }
            if attempt >= max_attempts {
                return Err(CycleError::Fetch {
                    attempts: attempt,
                    source: err,
                });
            }
            if shutdown.is_triggered() {
                return Err(CycleError::Interrupted);
            }

            let backoff = self.config.backoff_after(attempt);
            tracing::warn!(attempt, max_attempts, ?backoff, error = %err, "screener fetch failed; retrying");
            self.status.set_phase(MonitorPhase::RetryWait);
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown.triggered() => return Err(CycleError::Interrupted),
            }
        }
    }

    /// One timestamp per cycle, strictly after every timestamp already in the store.
    async fn next_retrieved_at(&mut self) -> Result<DateTime<Utc>, StoreError> {
        if self.last_retrieved_at.is_none() {
            self.last_retrieved_at = snapshots::most_recent_retrieved_at(&self.pool).await?;
        }

        let now = Utc::now().trunc_subsecs(3);
        Ok(match self.last_retrieved_at {
            Some(last) if now <= last => last + chrono::Duration::milliseconds(1),
            _ => now,
        })
    }
}

fn build_batch(rows: &[ScreenerRow], retrieved_at: DateTime<Utc>) -> (Vec<NewSnapshot>, usize) {
    let mut batch = Vec::with_capacity(rows.len());
    let mut skipped = 0;
    for row in rows {
        match NewSnapshot::from_row(row, retrieved_at) {
            Some(snapshot) => batch.push(snapshot),
            None => skipped += 1,
        }
    }
    (batch, skipped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::status_channel;
    use crate::storage::{rating_changes, test_pool};
    use serde_json::{json, Map};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays scripted responses; once the script runs out, repeats the last one.
    struct ScriptedSource {
        script: Mutex<VecDeque<Result<Vec<ScreenerRow>, AdapterError>>>,
        calls: Mutex<u32>,
    }

    impl ScriptedSource {
        fn new(script: Vec<Result<Vec<ScreenerRow>, AdapterError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait::async_trait]
    impl DataSource for ScriptedSource {
        fn source_name(&self) -> &'static str {
            "scripted"
        }

        async fn fetch(&self, _range: ScreenerRange) -> Result<Vec<ScreenerRow>, AdapterError> {
            *self.calls.lock().unwrap() += 1;
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                script.pop_front().unwrap()
            } else {
                script.front().cloned().unwrap()
            }
        }
    }

    fn row(symbol: &str, rating: &str, price: f64) -> ScreenerRow {
        let mut fields = Map::new();
        fields.insert("Symbol".to_string(), json!(symbol));
        fields.insert("Analyst Rating".to_string(), json!(rating));
        fields.insert("Price".to_string(), json!(price));
        ScreenerRow {
            symbol: symbol.to_string(),
            analyst_rating: Some(rating.to_string()),
            price: Some(price),
            fields,
        }
    }

    fn config(max_attempts: u32) -> MonitorConfig {
        MonitorConfig {
            interval: Duration::from_secs(600),
            range: ScreenerRange::new(0, 150),
            max_attempts,
            retry_backoff: Duration::ZERO,
        }
    }

    async fn monitor(source: Arc<ScriptedSource>, max_attempts: u32) -> (Monitor, StatusReader, SqlitePool) {
        let pool = test_pool().await;
        let (publisher, reader) = status_channel();
        let monitor = Monitor::new(pool.clone(), source, config(max_attempts), publisher);
        (monitor, reader, pool)
    }

    #[tokio::test]
    async fn detects_buy_to_hold_across_cycles() {
        let source = ScriptedSource::new(vec![
            Ok(vec![row("XYZ", "Buy", 100.0), row("ABC", "Neutral", 10.0)]),
            Ok(vec![row("XYZ", "Hold", 95.0), row("ABC", "Neutral", 11.0)]),
        ]);
        let (mut monitor, reader, pool) = monitor(source, 3).await;

        let first = monitor.run_cycle().await.unwrap();
        assert_eq!(first.processed, 2);
        assert!(first.changes.is_empty());

        let second = monitor.run_cycle().await.unwrap();
        assert!(second.retrieved_at > first.retrieved_at);
        assert_eq!(second.changes.len(), 1);
        let change = &second.changes[0];
        assert_eq!(change.symbol, "XYZ");
        assert_eq!(change.old_rating.as_deref(), Some("Buy"));
        assert_eq!(change.new_rating.as_deref(), Some("Hold"));
        assert_eq!(change.price_before, Some(100.0));
        assert_eq!(change.price_after, Some(95.0));

        assert_eq!(rating_changes::count(&pool).await.unwrap(), 1);
        let status = reader.current();
        assert_eq!(status.outcome, RunOutcome::Success);
        assert_eq!(status.changes_detected, 1);
        assert_eq!(status.total_snapshots, 4);
        assert_eq!(status.total_rating_changes, 1);
    }

    #[tokio::test]
    async fn transient_failures_below_limit_still_commit_once() {
        let max_attempts = 3;
        let mut script: Vec<_> = (0..max_attempts - 1)
            .map(|_| Err(AdapterError::Timeout))
            .collect();
        script.push(Ok(vec![row("XYZ", "Buy", 1.0)]));
        let source = ScriptedSource::new(script);
        let (mut monitor, reader, pool) = monitor(source.clone(), max_attempts).await;

        let report = monitor.run_cycle().await.unwrap();
        assert_eq!(report.attempts, max_attempts);
        assert_eq!(source.calls(), max_attempts);
        assert_eq!(snapshots::count(&pool).await.unwrap(), 1);

        let status = reader.current();
        assert_eq!(status.outcome, RunOutcome::Success);
        assert_eq!(status.last_error, None);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_without_writing() {
        let max_attempts = 3;
        let source = ScriptedSource::new(vec![Err(AdapterError::Transport("reset".into()))]);
        let (mut monitor, reader, pool) = monitor(source.clone(), max_attempts).await;

        let err = monitor.run_cycle().await.unwrap_err();
        assert!(matches!(err, CycleError::Fetch { attempts: 3, .. }));
        assert_eq!(source.calls(), max_attempts);
        assert_eq!(snapshots::count(&pool).await.unwrap(), 0);

        let status = reader.current();
        assert_eq!(status.outcome, RunOutcome::Failure);
        assert_eq!(status.phase, MonitorPhase::Failed);
        assert!(status.last_error.unwrap().contains("reset"));
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let source = ScriptedSource::new(vec![Err(AdapterError::Malformed("no data".into()))]);
        let (mut monitor, reader, _pool) = monitor(source.clone(), 5).await;

        let err = monitor.run_cycle().await.unwrap_err();
        assert!(matches!(err, CycleError::Fetch { attempts: 1, .. }));
        assert_eq!(source.calls(), 1);
        assert_eq!(reader.current().attempts, 1);
    }

    #[tokio::test]
    async fn rows_without_symbol_make_the_cycle_partial() {
        let source = ScriptedSource::new(vec![Ok(vec![row("XYZ", "Buy", 1.0), row("", "Buy", 2.0)])]);
        let (mut monitor, reader, _pool) = monitor(source, 1).await;

        let report = monitor.run_cycle().await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Partial);
        assert_eq!(report.processed, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(reader.current().outcome, RunOutcome::Partial);
    }

    #[tokio::test]
    async fn duplicate_symbol_in_one_batch_fails_the_cycle_atomically() {
        let source = ScriptedSource::new(vec![Ok(vec![
            row("XYZ", "Buy", 1.0),
            row("ABC", "Buy", 1.0),
            row("XYZ", "Sell", 1.0),
        ])]);
        let (mut monitor, reader, pool) = monitor(source, 1).await;

        let err = monitor.run_cycle().await.unwrap_err();
        assert!(matches!(err, CycleError::Store(StoreError::DuplicateKey { .. })));
        assert_eq!(snapshots::count(&pool).await.unwrap(), 0);
        assert_eq!(reader.current().outcome, RunOutcome::Failure);
    }

    #[tokio::test]
    async fn timestamps_continue_after_existing_rows() {
        let source = ScriptedSource::new(vec![Ok(vec![row("XYZ", "Buy", 1.0)])]);
        let (mut first, _reader, pool) = monitor(source.clone(), 1).await;
        let a = first.run_cycle().await.unwrap();

        // A fresh monitor over the same store, as after a restart.
        let (publisher, _reader) = status_channel();
        let mut restarted = Monitor::new(pool.clone(), source, config(1), publisher);
        let b = restarted.run_cycle().await.unwrap();
        assert!(b.retrieved_at > a.retrieved_at);
        assert_eq!(snapshots::count(&pool).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown_after_first_cycle() {
        let source = ScriptedSource::new(vec![Ok(vec![row("XYZ", "Buy", 1.0)])]);
        let (monitor, reader, pool) = monitor(source.clone(), 1).await;
        let (trigger, shutdown) = shutdown_channel();

        let handle = tokio::spawn(monitor.run(shutdown));
        while reader.current().outcome == RunOutcome::NotYetRun {
            tokio::task::yield_now().await;
        }
        trigger.trigger();
        handle.await.unwrap();

        assert_eq!(source.calls(), 1);
        assert_eq!(snapshots::count(&pool).await.unwrap(), 1);
        assert!(!reader.is_running());
    }

    #[tokio::test]
    async fn shutdown_during_retry_wait_abandons_cycle() {
        let source = ScriptedSource::new(vec![Err(AdapterError::Timeout)]);
        let pool = test_pool().await;
        let (publisher, reader) = status_channel();
        let mut cfg = config(5);
        cfg.retry_backoff = Duration::from_secs(3600);
        let monitor = Monitor::new(pool.clone(), source.clone(), cfg, publisher);
        let (trigger, shutdown) = shutdown_channel();

        let handle = tokio::spawn(monitor.run(shutdown));
        while reader.current().phase != MonitorPhase::RetryWait {
            tokio::task::yield_now().await;
        }
        trigger.trigger();
        handle.await.unwrap();

        assert_eq!(source.calls(), 1);
        let status = reader.current();
        assert_eq!(status.phase, MonitorPhase::Stopped);
        assert_eq!(status.outcome, RunOutcome::NotYetRun);
        assert_eq!(snapshots::count(&pool).await.unwrap(), 0);
    }

    /// A source whose request never completes.
    struct HangingSource {
        calls: Mutex<u32>,
    }

    #[async_trait::async_trait]
    impl DataSource for HangingSource {
        fn source_name(&self) -> &'static str {
            "hanging"
        }

        async fn fetch(&self, _range: ScreenerRange) -> Result<Vec<ScreenerRow>, AdapterError> {
            *self.calls.lock().unwrap() += 1;
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn run_retries_on_the_next_interval_after_a_failed_cycle() {
        let source = ScriptedSource::new(vec![
            Err(AdapterError::Malformed("no data".into())),
            Ok(vec![row("XYZ", "Buy", 1.0)]),
        ]);
        let (monitor, reader, pool) = monitor(source.clone(), 3).await;
        tokio::time::pause();
        let (trigger, shutdown) = shutdown_channel();

        let handle = tokio::spawn(monitor.run(shutdown));
        while reader.current().outcome != RunOutcome::Failure {
            tokio::task::yield_now().await;
        }
        let status = reader.current();
        assert!(reader.is_running());
        assert_eq!(status.phase, MonitorPhase::Idle);
        assert_eq!(status.health_label(), "degraded");

        // Nothing happens before the interval has elapsed.
        tokio::time::advance(Duration::from_secs(599)).await;
        assert_eq!(source.calls(), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        while reader.current().outcome != RunOutcome::Success {
            tokio::task::yield_now().await;
        }
        trigger.trigger();
        handle.await.unwrap();
        tokio::time::resume();

        assert_eq!(source.calls(), 2);
        assert_eq!(snapshots::count(&pool).await.unwrap(), 1);
        let status = reader.current();
        assert_eq!(status.last_error, None);
        assert_eq!(status.phase, MonitorPhase::Stopped);
    }

    #[tokio::test]
    async fn shutdown_during_fetch_abandons_cycle() {
        let source = Arc::new(HangingSource {
            calls: Mutex::new(0),
        });
        let pool = test_pool().await;
        let (publisher, reader) = status_channel();
        let monitor = Monitor::new(pool.clone(), source.clone(), config(3), publisher);
        let (trigger, shutdown) = shutdown_channel();

        let handle = tokio::spawn(monitor.run(shutdown));
        while *source.calls.lock().unwrap() == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(reader.current().phase, MonitorPhase::Fetching);
        trigger.trigger();
        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("monitor did not stop")
            .unwrap();

        let status = reader.current();
        assert_eq!(status.outcome, RunOutcome::NotYetRun);
        assert_eq!(status.phase, MonitorPhase::Stopped);
        assert!(!reader.is_running());
        assert_eq!(snapshots::count(&pool).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn shutdown_during_persist_lets_the_commit_finish() {
        let source = ScriptedSource::new(vec![Ok(vec![
            row("XYZ", "Buy", 1.0),
            row("ABC", "Hold", 2.0),
            row("DEF", "Sell", 3.0),
        ])]);
        let (monitor, reader, pool) = monitor(source.clone(), 1).await;
        let (trigger, shutdown) = shutdown_channel();

        let watcher = {
            let reader = reader.clone();
            tokio::spawn(async move {
                while reader.current().phase != MonitorPhase::Persisting {
                    tokio::task::yield_now().await;
                }
                trigger.trigger();
            })
        };

        let handle = tokio::spawn(monitor.run(shutdown));
        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("monitor did not stop")
            .unwrap();
        watcher.await.unwrap();

        assert_eq!(source.calls(), 1);
        assert_eq!(snapshots::count(&pool).await.unwrap(), 3);
        let status = reader.current();
        assert_eq!(status.outcome, RunOutcome::Success);
        assert_eq!(status.total_snapshots, 3);
        assert_eq!(status.phase, MonitorPhase::Stopped);
    }

    #[test]
    fn backoff_grows_linearly() {
        let mut cfg = config(4);
        cfg.retry_backoff = Duration::from_secs(30);
        assert_eq!(cfg.backoff_after(1), Duration::from_secs(30));
        assert_eq!(cfg.backoff_after(2), Duration::from_secs(60));
        assert_eq!(cfg.backoff_after(3), Duration::from_secs(90));
    }
}
