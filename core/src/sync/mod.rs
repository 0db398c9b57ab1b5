//! Background Sync Worker
//!
//! A full run reconciles the cache with the server in fixed phases. Each
//! phase is isolated: a failure is logged and recorded in the report, and the
//! remaining phases still run.

use chrono::{DateTime, Utc};
use std::time::Duration;

mod orphans;
mod pull;
pub mod state;
pub mod worker;

pub use orphans::{OrphanCleanup, OrphanOutcome};
pub use state::{RunGuard, SyncState};
pub use worker::SyncWorker;

/// Outcome of one full run
#[derive(Debug, Clone)]
pub struct SyncReport {
    /// When the run started
    pub started_at: DateTime<Utc>,
    /// Run duration
    pub duration: Duration,
    /// True when another run was in progress and nothing was done
    pub skipped: bool,
    /// Failed follow-ups that succeeded on retry
    pub followups_recovered: usize,
    /// Inbox summaries upserted
    pub inbox_pulled: usize,
    /// Cache rows deleted because the server no longer has them
    pub orphans_deleted: usize,
    /// Cache rows marked archived because the server holds them in the archive
    pub archives_reconciled: usize,
    /// Sent summaries upserted
    pub sent_pulled: usize,
    /// Buckets whose members were pulled
    pub buckets_refreshed: usize,
    /// Local bucket assignments the server no longer carries
    pub assignments_cleared: usize,
    /// Rows given a thread key
    pub thread_keys_assigned: usize,
    /// Rows pulled back into the inbox by consolidation
    pub consolidated: usize,
    /// `phase: error` for every failed phase
    pub errors: Vec<String>,
}

impl SyncReport {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            duration: Duration::ZERO,
            skipped: false,
            followups_recovered: 0,
            inbox_pulled: 0,
            orphans_deleted: 0,
            archives_reconciled: 0,
            sent_pulled: 0,
            buckets_refreshed: 0,
            assignments_cleared: 0,
            thread_keys_assigned: 0,
            consolidated: 0,
            errors: Vec::new(),
        }
    }

    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::new(Utc::now())
        }
    }

    /// Check if every phase succeeded
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    pub(crate) fn phase_failed(&mut self, phase: &str, error: impl std::fmt::Display) {
        tracing::error!("Sync phase {} failed: {}", phase, error);
        self.errors.push(format!("{}: {}", phase, error));
    }
}

/// Aggregate statistics over all runs
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Completed runs
    pub total_runs: u64,
    /// Runs where every phase succeeded
    pub clean_runs: u64,
    /// Runs with at least one failed phase
    pub failed_runs: u64,
    /// Runs or ticks skipped because a run was in progress
    pub skipped_runs: u64,
    /// Total summaries pulled from the server
    pub total_messages_pulled: u64,
    /// Last completed run
    pub last_sync: Option<DateTime<Utc>>,
    /// Average run duration
    pub average_duration: Duration,
}

impl SyncStats {
    /// Fold a report into the totals
    pub fn record(&mut self, report: &SyncReport) {
        if report.skipped {
            self.skipped_runs += 1;
            return;
        }

        let previous = self.total_runs as u32;
        self.total_runs += 1;
        if report.is_clean() {
            self.clean_runs += 1;
        } else {
            self.failed_runs += 1;
        }
        self.total_messages_pulled += (report.inbox_pulled + report.sent_pulled) as u64;
        self.last_sync = Some(report.started_at);
        self.average_duration = (self.average_duration * previous + report.duration) / (previous + 1);
    }
}
