use chrono::{NaiveTime, TimeZone, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::orphans::OrphanCleanup;
use super::pull::{self, BucketRefresh};
use super::{SyncReport, SyncStats};
use crate::config::SyncConfig;
use crate::engine::ThreadEngine;
use crate::error::{SortaError, SortaResult};

struct Shared {
    engine: Arc<ThreadEngine>,
    config: SyncConfig,
    stats: RwLock<SyncStats>,
}

/// Periodic reconciliation of the cache with the server
pub struct SyncWorker {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncWorker {
    pub fn new(engine: Arc<ThreadEngine>, config: SyncConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                engine,
                config,
                stats: RwLock::new(SyncStats::default()),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn engine(&self) -> &Arc<ThreadEngine> {
        &self.shared.engine
    }

    /// Run every phase once. Returns a skipped report when a run is already
    /// in progress.
    pub async fn run_once(&self) -> SyncReport {
        self.shared.run_once().await
    }

    /// Start the background loop at the configured interval
    pub fn start(&self) -> SortaResult<()> {
        self.start_every(self.shared.config.interval())
    }

    /// Start the background loop with an explicit period
    pub fn start_every(&self, period: Duration) -> SortaResult<()> {
        let mut task = self.task.lock();
        if task.is_some() {
            return Err(SortaError::invalid_state("Background sync already running"));
        }
        if period.is_zero() {
            return Err(SortaError::config("Sync interval must be greater than zero"));
        }

        let shared = self.shared.clone();
        *task = Some(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;

                if shared.engine.state().is_running() {
                    debug!("Sync still in progress, skipping tick");
                    shared.stats.write().await.record(&SyncReport::skipped());
                    continue;
                }

                // a slow run must not hold up the ticker
                let run = shared.clone();
                tokio::spawn(async move {
                    run.run_once().await;
                });
            }
        }));

        info!("Started background sync with interval: {:?}", period);
        Ok(())
    }

    /// Stop the background loop. A run already in progress finishes.
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
            info!("Stopped background sync");
        }
    }

    pub fn is_started(&self) -> bool {
        self.task.lock().is_some()
    }

    pub async fn stats(&self) -> SyncStats {
        self.shared.stats.read().await.clone()
    }

    /// Pull one bucket unless it was refreshed within the configured window.
    /// Returns true when a refresh happened.
    pub async fn refresh_bucket_if_stale(&self, bucket_id: &str) -> SortaResult<bool> {
        let state = self.shared.engine.state();
        if !state.claim_bucket_refresh(bucket_id, self.shared.config.refresh_window()) {
            debug!("Bucket {} refreshed recently", bucket_id);
            return Ok(false);
        }

        match pull::pull_bucket(&self.shared.engine, bucket_id).await {
            Ok(_) => Ok(true),
            Err(e) => {
                // let the next read retry
                state.forget_bucket(bucket_id);
                Err(e)
            }
        }
    }
}

impl Drop for SyncWorker {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

impl Shared {
    async fn run_once(&self) -> SyncReport {
        let Some(_guard) = self.engine.state().try_begin_run() else {
            debug!("Sync already in progress");
            let report = SyncReport::skipped();
            self.stats.write().await.record(&report);
            return report;
        };

        let started = Instant::now();
        let mut report = SyncReport::new(Utc::now());
        info!("Starting sync run");

        self.retry_followups(&mut report).await;

        let seen_before = Utc::now();
        let inbox_ok = match pull::pull_inbox(&self.engine, self.config.start_date, self.config.include_starred).await {
            Ok(pulled) => {
                report.inbox_pulled = pulled;
                true
            }
            Err(e) => {
                report.phase_failed("inbox_pull", e);
                false
            }
        };

        // absent rows are only trustworthy after a complete inbox listing
        if inbox_ok {
            let cleanup = OrphanCleanup {
                seen_before,
                window_start: Utc.from_utc_datetime(&self.config.start_date.and_time(NaiveTime::default())),
                sample_limit: self.config.orphan_sample_limit,
            };
            match cleanup.run(&self.engine).await {
                Ok(outcome) => {
                    report.orphans_deleted = outcome.deleted;
                    report.archives_reconciled = outcome.archived;
                }
                Err(e) => report.phase_failed("orphan_cleanup", e),
            }
        }

        if let Some(sent) = self.engine.gateway().folders().sent.clone() {
            match pull::pull_sent(&self.engine, &sent, self.config.start_date).await {
                Ok(pulled) => report.sent_pulled = pulled,
                Err(e) => report.phase_failed("sent_pull", e),
            }
        }

        self.refresh_buckets(&mut report).await;

        match self.engine.backfill_thread_keys(self.config.backfill_batch) {
            Ok(assigned) => report.thread_keys_assigned = assigned,
            Err(e) => report.phase_failed("thread_backfill", e),
        }

        match self.engine.auto_consolidate_threads().await {
            Ok(moved) => report.consolidated = moved,
            Err(e) => report.phase_failed("consolidate", e),
        }

        report.duration = started.elapsed();
        info!(
            "Sync run finished in {:?}: {} inbox, {} sent, {} buckets, {} orphans, {} errors",
            report.duration,
            report.inbox_pulled,
            report.sent_pulled,
            report.buckets_refreshed,
            report.orphans_deleted,
            report.errors.len()
        );

        self.stats.write().await.record(&report);
        report
    }

    async fn retry_followups(&self, report: &mut SyncReport) {
        let failures = self.engine.followups().drain();
        if failures.is_empty() {
            return;
        }

        let attempted = failures.len();
        let recovered = self.engine.followups().retry(failures).await;
        if recovered < attempted {
            warn!("{} of {} follow-ups failed again", attempted - recovered, attempted);
        }
        report.followups_recovered = recovered;
    }

    async fn refresh_buckets(&self, report: &mut SyncReport) {
        let buckets = match self.engine.database().get_buckets() {
            Ok(buckets) => buckets,
            Err(e) => {
                report.phase_failed("bucket_refresh", e);
                return;
            }
        };

        for bucket in buckets {
            match pull::pull_bucket(&self.engine, &bucket.id).await {
                Ok(BucketRefresh { cleared, .. }) => {
                    report.buckets_refreshed += 1;
                    report.assignments_cleared += cleared;
                }
                Err(e) => report.phase_failed(&format!("bucket_refresh[{}]", bucket.id), e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::Bucket;
    use crate::config::FolderConfig;
    use crate::gateway::{InMemoryGateway, MailboxGateway, RemoteMessage};
    use crate::markers;
    use crate::message::{ConflictPolicy, Location, MessageUpsert};
    use crate::storage::Database;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<InMemoryGateway>, SyncWorker) {
        let dir = TempDir::new().unwrap();
        let db = Database::open(&dir.path().join("test.db")).unwrap();
        let folders = FolderConfig {
            sent: Some("Sent".to_string()),
            ..FolderConfig::default()
        };
        let gateway = Arc::new(InMemoryGateway::new(folders));
        let engine = Arc::new(ThreadEngine::new(db, gateway.clone()));
        (dir, gateway, SyncWorker::new(engine, SyncConfig::default()))
    }

    fn dated(identity: &str, subject: &str, day: u32) -> RemoteMessage {
        RemoteMessage::new(identity, subject)
            .from_sender("alice@example.com")
            .dated(Utc.with_ymd_and_hms(2024, 3, day, 9, 0, 0).unwrap())
    }

    #[tokio::test]
    async fn test_full_run() {
        let (_dir, gateway, worker) = setup();
        let db = worker.engine().database();
        db.upsert_bucket(&Bucket::new("work")).unwrap();

        gateway.add_message("INBOX", dated("<a@x>", "Budget Review", 1));
        gateway.add_message(
            "INBOX",
            dated("<b@x>", "Standup", 2)
                .with_flag(markers::marker_for_bucket("work"))
                .with_flag(markers::CATEGORIZED),
        );
        gateway.add_message(
            "Sent",
            dated("<s@x>", "Re: Budget Review", 3)
                .from_sender("me@example.com")
                .replying_to("<a@x>"),
        );

        // assigned locally, but the server has no marker for it
        let mut stale = MessageUpsert::new("<c@x>").with_bucket("work");
        stale.folder = Some("INBOX".to_string());
        stale.subject = "Old".to_string();
        db.upsert_message(&stale, ConflictPolicy::BucketAssignment).unwrap();

        let report = worker.run_once().await;
        assert!(report.is_clean(), "{:?}", report.errors);
        assert!(!report.skipped);
        assert_eq!(report.inbox_pulled, 1);
        assert_eq!(report.sent_pulled, 1);
        assert_eq!(report.buckets_refreshed, 1);
        assert_eq!(report.assignments_cleared, 1);

        let b = db.get_message("<b@x>").unwrap().unwrap();
        assert_eq!(b.location("Drafts"), Location::Bucket("work".to_string()));
        assert!(db.get_message("<c@x>").unwrap().unwrap().bucket_id.is_none());
        assert_eq!(db.get_bucket("work").unwrap().unwrap().count, 1);

        let a = db.get_message("<a@x>").unwrap().unwrap();
        let s = db.get_message("<s@x>").unwrap().unwrap();
        assert!(a.thread_key.is_some());
        assert_eq!(a.thread_key, s.thread_key);

        let stats = worker.stats().await;
        assert_eq!(stats.total_runs, 1);
        assert_eq!(stats.clean_runs, 1);
        assert_eq!(stats.total_messages_pulled, 2);
    }

    #[tokio::test]
    async fn test_failed_phase_does_not_stop_the_run() {
        let (_dir, gateway, worker) = setup();
        gateway.add_message("INBOX", dated("<a@x>", "Hello", 1));
        gateway.fail_listing("Sent");

        let report = worker.run_once().await;
        assert_eq!(report.inbox_pulled, 1);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].starts_with("sent_pull"));
        assert_eq!(report.thread_keys_assigned, 1);
        assert_eq!(worker.stats().await.failed_runs, 1);
    }

    #[tokio::test]
    async fn test_orphans_untouched_when_inbox_pull_fails() {
        let (_dir, gateway, worker) = setup();
        gateway.fail_listing("INBOX");

        let report = worker.run_once().await;
        assert!(report.errors.iter().any(|e| e.starts_with("inbox_pull")));
        assert_eq!(gateway.call_count("existing_identities"), 0);
    }

    #[tokio::test]
    async fn test_run_skipped_while_another_is_running() {
        let (_dir, gateway, worker) = setup();

        let guard = worker.engine().state().try_begin_run();
        assert!(guard.is_some());
        let report = worker.run_once().await;
        assert!(report.skipped);
        assert_eq!(gateway.call_count("list_inbox_summaries"), 0);
        drop(guard);

        assert!(!worker.run_once().await.skipped);
        let stats = worker.stats().await;
        assert_eq!(stats.skipped_runs, 1);
        assert_eq!(stats.total_runs, 1);
    }

    #[tokio::test]
    async fn test_ticks_skip_while_running() {
        let (_dir, gateway, worker) = setup();

        let guard = worker.engine().state().try_begin_run();
        worker.start_every(Duration::from_millis(10)).unwrap();
        assert!(worker.is_started());
        assert!(worker.start_every(Duration::from_millis(10)).is_err());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(gateway.call_count("list_inbox_summaries"), 0);
        assert!(worker.stats().await.skipped_runs >= 1);

        drop(guard);
        for _ in 0..50 {
            if worker.stats().await.total_runs > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        worker.stop();
        assert!(!worker.is_started());
        assert!(worker.stats().await.total_runs >= 1);
    }

    #[tokio::test]
    async fn test_bucket_refresh_is_throttled() {
        let (_dir, gateway, worker) = setup();
        worker.engine().database().upsert_bucket(&Bucket::new("work")).unwrap();
        gateway.add_message(
            "INBOX",
            dated("<b@x>", "Standup", 2)
                .with_flag(markers::marker_for_bucket("work"))
                .with_flag(markers::CATEGORIZED),
        );

        assert!(worker.refresh_bucket_if_stale("work").await.unwrap());
        assert!(!worker.refresh_bucket_if_stale("work").await.unwrap());
        assert_eq!(gateway.call_count("list_marker_summaries"), 1);
        assert!(worker.engine().database().get_message("<b@x>").unwrap().is_some());

        // a failed refresh does not count against the window
        assert!(worker.refresh_bucket_if_stale("missing").await.is_err());
        assert!(worker.refresh_bucket_if_stale("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_archive_move_without_local_commit_is_reconciled() {
        let (_dir, gateway, worker) = setup();
        gateway.add_message("INBOX", dated("<a@x>", "Trip", 4));
        assert!(worker.run_once().await.is_clean());

        // server moved, local commit never happened
        gateway.move_to_archive_folder("<a@x>").await.unwrap();

        let report = worker.run_once().await;
        assert!(report.is_clean(), "{:?}", report.errors);
        assert_eq!(report.archives_reconciled, 1);
        assert_eq!(report.orphans_deleted, 0);

        let row = worker.engine().database().get_message("<a@x>").unwrap().unwrap();
        assert_eq!(row.location("Drafts"), Location::Archived);
        assert_eq!(row.folder.as_deref(), Some("Archive"));
    }

    #[tokio::test]
    async fn test_unarchive_move_without_local_commit_is_reconciled() {
        let (_dir, gateway, worker) = setup();
        gateway.add_message("INBOX", dated("<a@x>", "Trip", 4));
        assert!(worker.run_once().await.is_clean());
        worker.engine().archive_thread("<a@x>").await.unwrap();

        // server moved back, local row still archived
        gateway.move_from_archive_to_folder("<a@x>", "INBOX").await.unwrap();

        let report = worker.run_once().await;
        assert!(report.is_clean(), "{:?}", report.errors);

        let row = worker.engine().database().get_message("<a@x>").unwrap().unwrap();
        assert!(row.archived_at.is_none());
        assert_eq!(row.location("Drafts"), Location::Inbox);
        assert_eq!(row.folder.as_deref(), Some("INBOX"));
    }
}
