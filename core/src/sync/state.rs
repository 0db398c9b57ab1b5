//! In-memory sync bookkeeping; reset on restart

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared state of the background worker and the read path
#[derive(Debug, Default)]
pub struct SyncState {
    /// Set while a full run is in progress
    running: AtomicBool,
    /// Last remote refresh per bucket id
    bucket_refreshed: Mutex<HashMap<String, Instant>>,
    /// Identities with a body fetch in flight
    body_fetches: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// Clears the running flag when dropped
#[derive(Debug)]
pub struct RunGuard<'a> {
    state: &'a SyncState,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.state.running.store(false, Ordering::Release);
    }
}

impl SyncState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter the running state; `None` when a run is already in progress
    pub fn try_begin_run(&self) -> Option<RunGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunGuard { state: self })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Claim a bucket refresh unless one happened within `window`.
    /// Returns true when the caller should refresh.
    pub fn claim_bucket_refresh(&self, bucket_id: &str, window: Duration) -> bool {
        let mut refreshed = self.bucket_refreshed.lock();
        let now = Instant::now();
        match refreshed.get(bucket_id) {
            Some(last) if now.duration_since(*last) < window => false,
            _ => {
                refreshed.insert(bucket_id.to_string(), now);
                true
            }
        }
    }

    /// Record a refresh done outside the throttled path
    pub fn mark_bucket_refreshed(&self, bucket_id: &str) {
        self.bucket_refreshed
            .lock()
            .insert(bucket_id.to_string(), Instant::now());
    }

    pub fn forget_bucket(&self, bucket_id: &str) {
        self.bucket_refreshed.lock().remove(bucket_id);
    }

    /// Lock serializing body fetches of one identity
    pub fn body_fetch_lock(&self, identity: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.body_fetches
            .lock()
            .entry(identity.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Drop the entry once no other caller holds it. Call while still
    /// holding the lock returned by `body_fetch_lock`.
    pub fn finish_body_fetch(&self, identity: &str) {
        let mut fetches = self.body_fetches.lock();
        if let Some(lock) = fetches.get(identity) {
            // the map's own reference plus the finishing caller's
            if Arc::strong_count(lock) <= 2 {
                fetches.remove(identity);
            }
        }
    }

    pub fn body_fetch_in_flight(&self, identity: &str) -> bool {
        self.body_fetches.lock().contains_key(identity)
    }
}
