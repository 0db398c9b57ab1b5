//! Pull phases: server summaries into the cache

use chrono::NaiveDate;
use std::collections::HashSet;
use tracing::debug;

use crate::engine::ThreadEngine;
use crate::error::{SortaError, SortaResult};
use crate::markers;
use crate::message::{ConflictPolicy, MessageUpsert};

/// Upsert inbox summaries. Existing rows only get their position and
/// last-seen stamp refreshed.
pub(crate) async fn pull_inbox(engine: &ThreadEngine, cutoff: NaiveDate, include_flagged: bool) -> SortaResult<usize> {
    let summaries = engine
        .gateway()
        .list_inbox_summaries(cutoff, include_flagged)
        .await?;

    let db = engine.database();
    for summary in &summaries {
        db.upsert_message(&MessageUpsert::from_summary(summary), ConflictPolicy::InboxPull)?;
    }
    debug!("Pulled {} inbox summaries", summaries.len());
    Ok(summaries.len())
}

/// Upsert sent-folder summaries; rows first seen in the inbox are left alone
pub(crate) async fn pull_sent(engine: &ThreadEngine, sent_folder: &str, cutoff: NaiveDate) -> SortaResult<usize> {
    let summaries = engine
        .gateway()
        .list_folder_summaries(sent_folder, cutoff)
        .await?;

    let db = engine.database();
    for summary in &summaries {
        db.upsert_message(&MessageUpsert::from_summary(summary), ConflictPolicy::SentPull)?;
    }
    debug!("Pulled {} sent summaries", summaries.len());
    Ok(summaries.len())
}

/// Result of pulling one bucket
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BucketRefresh {
    pub pulled: usize,
    pub cleared: usize,
}

/// Pull the members of one bucket. The server wins: local assignments
/// without a remote marker are cleared.
pub(crate) async fn pull_bucket(engine: &ThreadEngine, bucket_id: &str) -> SortaResult<BucketRefresh> {
    let db = engine.database();
    if db.get_bucket(bucket_id)?.is_none() {
        return Err(SortaError::not_found(format!("Bucket {}", bucket_id)));
    }

    let marker = markers::marker_for_bucket(bucket_id);
    let summaries = engine.gateway().list_marker_summaries(&marker).await?;

    let mut members = HashSet::with_capacity(summaries.len());
    for summary in &summaries {
        let upsert = MessageUpsert::from_summary(summary).with_bucket(bucket_id);
        db.upsert_message(&upsert, ConflictPolicy::BucketAssignment)?;
        members.insert(summary.identity.clone());
    }

    let cleared = db.prune_bucket(bucket_id, &members)?;
    if !cleared.is_empty() {
        debug!("Cleared {} stale assignments from bucket {}", cleared.len(), bucket_id);
    }
    db.set_bucket_count(bucket_id, db.count_bucket_members(bucket_id)?)?;
    engine.state().mark_bucket_refreshed(bucket_id);

    Ok(BucketRefresh {
        pulled: summaries.len(),
        cleared: cleared.len(),
    })
}
