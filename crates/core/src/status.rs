use crate::domain::rating_change::RatingChange;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

/// Where the monitor loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorPhase {
    Stopped,
    Idle,
    Fetching,
    RetryWait,
    Comparing,
    Persisting,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    NotYetRun,
    Success,
    /// Committed, but some upstream rows were skipped.
    Partial,
    Failure,
}

/// Outcome of the most recent poll cycle plus counters since process start.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunStatus {
    pub outcome: RunOutcome,
    pub phase: MonitorPhase,
    pub last_started_at: Option<DateTime<Utc>>,
    pub last_finished_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub symbols_processed: usize,
    pub symbols_skipped: usize,
    pub changes_detected: usize,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub total_snapshots: u64,
    pub total_rating_changes: u64,
    pub last_changes: Vec<RatingChange>,
}

impl Default for RunStatus {
    fn default() -> Self {
        Self {
            outcome: RunOutcome::NotYetRun,
            phase: MonitorPhase::Stopped,
            last_started_at: None,
            last_finished_at: None,
            last_success_at: None,
            symbols_processed: 0,
            symbols_skipped: 0,
            changes_detected: 0,
            attempts: 0,
            last_error: None,
            total_snapshots: 0,
            total_rating_changes: 0,
            last_changes: Vec::new(),
        }
    }
}

impl RunStatus {
    /// `starting` before the first cycle, `degraded` while the last cycle failed.
    pub fn health_label(&self) -> &'static str {
        match self.outcome {
            RunOutcome::NotYetRun => "starting",
            RunOutcome::Failure => "degraded",
            RunOutcome::Success | RunOutcome::Partial => "ok",
        }
    }
}

/// What a committed cycle reports back to the status.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleSummary {
    pub finished_at: DateTime<Utc>,
    pub processed: usize,
    pub skipped: usize,
    pub attempts: u32,
    pub changes: Vec<RatingChange>,
}

/// Write side of the status; owned by the monitor loop only.
#[derive(Debug)]
pub struct StatusPublisher {
    tx: watch::Sender<RunStatus>,
}

/// Read side; hands out copies, never a live reference.
#[derive(Debug, Clone)]
pub struct StatusReader {
    rx: watch::Receiver<RunStatus>,
}

pub fn status_channel() -> (StatusPublisher, StatusReader) {
    let (tx, rx) = watch::channel(RunStatus::default());
    (StatusPublisher { tx }, StatusReader { rx })
}

impl StatusPublisher {
    pub fn reader(&self) -> StatusReader {
        StatusReader {
            rx: self.tx.subscribe(),
        }
    }

    pub fn set_phase(&self, phase: MonitorPhase) {
        self.tx.send_modify(|s| s.phase = phase);
    }

    pub fn record_started(&self, started_at: DateTime<Utc>) {
        self.tx.send_modify(|s| {
            s.last_started_at = Some(started_at);
            s.phase = MonitorPhase::Fetching;
        });
    }

    pub fn record_committed(&self, summary: CycleSummary) {
        self.tx.send_modify(|s| {
            s.outcome = if summary.skipped > 0 {
                RunOutcome::Partial
            } else {
                RunOutcome::Success
            };
            s.phase = MonitorPhase::Idle;
            s.last_finished_at = Some(summary.finished_at);
            s.last_success_at = Some(summary.finished_at);
            s.symbols_processed = summary.processed;
            s.symbols_skipped = summary.skipped;
            s.changes_detected = summary.changes.len();
            s.attempts = summary.attempts;
            s.last_error = None;
            s.total_snapshots += summary.processed as u64;
            s.total_rating_changes += summary.changes.len() as u64;
            s.last_changes = summary.changes;
        });
    }

    /// The cycle was abandoned; nothing was written, counters stay as they were.
    pub fn record_failure(&self, finished_at: DateTime<Utc>, attempts: u32, error: String) {
        self.tx.send_modify(|s| {
            s.outcome = RunOutcome::Failure;
            s.phase = MonitorPhase::Failed;
            s.last_finished_at = Some(finished_at);
            s.symbols_processed = 0;
            s.symbols_skipped = 0;
            s.changes_detected = 0;
            s.attempts = attempts;
            s.last_error = Some(error);
            s.last_changes.clear();
        });
    }
}

impl StatusReader {
    pub fn current(&self) -> RunStatus {
        self.rx.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        self.rx.borrow().phase != MonitorPhase::Stopped
    }
}
