//! Thread-wide state transitions

use std::future::Future;
use tracing::{debug, error, info};

use super::ThreadEngine;
use crate::error::{SortaError, SortaResult};
use crate::markers;
use crate::message::{CachedMessage, LocationUpdate};
use crate::storage::MessageQuery;
use crate::threading;

/// Rows fetched for an on-demand thread key backfill
const BACKFILL_ON_DEMAND: usize = 500;

/// Which thread members a transition applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Members<'a> {
    /// Inbox or any bucket
    NotArchived,
    Archived,
    InBucket(&'a str),
}

impl Members<'_> {
    fn admits(&self, row: &CachedMessage) -> bool {
        match self {
            Members::NotArchived => !row.is_archived(),
            Members::Archived => row.is_archived(),
            Members::InBucket(id) => !row.is_archived() && row.bucket_id.as_deref() == Some(*id),
        }
    }
}

impl ThreadEngine {
    /// Thread key of `identity`, computing and storing it when missing
    pub fn thread_key_of(&self, identity: &str) -> SortaResult<String> {
        let message = self
            .db
            .get_message(identity)?
            .ok_or_else(|| SortaError::not_found(format!("Message {}", identity)))?;

        if let Some(key) = message.thread_key.filter(|k| !k.is_empty()) {
            return Ok(key);
        }

        // ancestors first, so the chain resolves to a shared key
        self.backfill_thread_keys(BACKFILL_ON_DEMAND)?;
        if let Some(key) = self
            .db
            .get_message(identity)?
            .and_then(|m| m.thread_key)
            .filter(|k| !k.is_empty())
        {
            return Ok(key);
        }

        let message = self
            .db
            .get_message(identity)?
            .ok_or_else(|| SortaError::not_found(format!("Message {}", identity)))?;
        let key = threading::resolve_thread_key(&self.db, &message, &self.folders().drafts)?;
        self.db.set_thread_key(identity, &key)?;
        Ok(key)
    }

    /// Give rows without a thread key one, oldest first
    pub fn backfill_thread_keys(&self, limit: usize) -> SortaResult<usize> {
        let pending = self
            .db
            .query(&MessageQuery::new().missing_thread_key().limit(limit))?;
        let drafts = self.folders().drafts.clone();

        let mut assigned = 0;
        for message in pending {
            let key = threading::resolve_thread_key(&self.db, &message, &drafts)?;
            self.db.set_thread_key(&message.identity, &key)?;
            assigned += 1;
        }

        if assigned > 0 {
            debug!("Assigned thread keys to {} messages", assigned);
        }
        Ok(assigned)
    }

    async fn thread_members(&self, identity: &str, members: Members<'_>) -> SortaResult<Vec<CachedMessage>> {
        let key = self.thread_key_of(identity)?;
        let query = MessageQuery::new()
            .thread_key(key)
            .exclude_outgoing()
            .exclude_folder(self.folders().drafts.clone());
        let rows = self.db.query(&query)?;
        Ok(rows.into_iter().filter(|row| members.admits(row)).collect())
    }

    /// Apply `mutate` to every member; any failure aborts with the failed count
    async fn remote_phase<'a, F, Fut>(
        &self,
        operation: &str,
        members: &'a [CachedMessage],
        mutate: F,
    ) -> SortaResult<()>
    where
        F: Fn(&'a CachedMessage) -> Fut,
        Fut: Future<Output = SortaResult<()>>,
    {
        let mut failed = 0;
        for member in members {
            if let Err(e) = mutate(member).await {
                error!("{} failed for {}: {}", operation, member.identity, e);
                failed += 1;
            }
        }

        if failed > 0 {
            return Err(SortaError::partial(operation, failed, members.len()));
        }
        Ok(())
    }

    fn local_phase(&self, members: &[CachedMessage], update: &LocationUpdate) -> SortaResult<usize> {
        let identities: Vec<String> = members.iter().map(|m| m.identity.clone()).collect();
        self.db.apply_location_batch(&identities, update)
    }

    /// File every non-archived member of the thread into `bucket_id`
    pub async fn move_thread_to_bucket(&self, identity: &str, bucket_id: &str) -> SortaResult<usize> {
        if self.db.get_bucket(bucket_id)?.is_none() {
            return Err(SortaError::not_found(format!("Bucket {}", bucket_id)));
        }

        let members = self.thread_members(identity, Members::NotArchived).await?;
        let marker = vec![markers::marker_for_bucket(bucket_id)];

        self.remote_phase("move_thread_to_bucket", &members, |m| {
            self.gateway.set_category_markers(&m.identity, &marker)
        })
        .await?;

        let moved = self.local_phase(&members, &LocationUpdate::bucket(bucket_id))?;
        info!("Moved {} messages of {} to bucket {}", moved, identity, bucket_id);
        Ok(moved)
    }

    /// Archive every non-archived member of the thread. Bucket ids are kept
    /// so the thread can be restored later.
    pub async fn archive_thread(&self, identity: &str) -> SortaResult<usize> {
        let members = self.thread_members(identity, Members::NotArchived).await?;

        self.remote_phase("archive_thread", &members, |m| {
            self.gateway.move_to_archive_folder(&m.identity)
        })
        .await?;

        let archived = self.local_phase(&members, &LocationUpdate::archive(self.folders().archive.clone()))?;
        info!("Archived {} messages of {}", archived, identity);
        Ok(archived)
    }

    /// Move every archived member back to the inbox folder, optionally filing
    /// the thread into `target_bucket`
    pub async fn unarchive_thread(&self, identity: &str, target_bucket: Option<&str>) -> SortaResult<usize> {
        if let Some(bucket_id) = target_bucket {
            if self.db.get_bucket(bucket_id)?.is_none() {
                return Err(SortaError::not_found(format!("Bucket {}", bucket_id)));
            }
        }

        let members = self.thread_members(identity, Members::Archived).await?;
        let inbox = self.folders().inbox.clone();
        let marker: Option<Vec<String>> = target_bucket.map(|id| vec![markers::marker_for_bucket(id)]);

        self.remote_phase("unarchive_thread", &members, |m| {
            let inbox = inbox.clone();
            let marker = marker.clone();
            async move {
                self.gateway.move_from_archive_to_folder(&m.identity, &inbox).await?;
                if let Some(marker) = marker {
                    self.gateway.set_category_markers(&m.identity, &marker).await?;
                }
                Ok(())
            }
        })
        .await?;

        let update = LocationUpdate::unarchive(inbox, target_bucket.map(str::to_string));
        let restored = self.local_phase(&members, &update)?;
        info!("Unarchived {} messages of {}", restored, identity);
        Ok(restored)
    }

    /// Take the thread out of the bucket the triggering message is in
    pub async fn unbucket_thread(&self, identity: &str) -> SortaResult<usize> {
        let bucket_id = self
            .db
            .get_message(identity)?
            .ok_or_else(|| SortaError::not_found(format!("Message {}", identity)))?
            .bucket_id
            .ok_or_else(|| SortaError::invalid_state(format!("{} is not in a bucket", identity)))?;

        let members = self.thread_members(identity, Members::InBucket(&bucket_id)).await?;

        self.remote_phase("unbucket_thread", &members, |m| {
            self.gateway.set_category_markers(&m.identity, &[])
        })
        .await?;

        let cleared = self.local_phase(&members, &LocationUpdate::unbucket())?;
        info!("Removed {} messages of {} from bucket {}", cleared, identity, bucket_id);
        Ok(cleared)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::Fixture;
    use crate::error::SortaError;
    use crate::markers;
    use crate::message::Location;
    use crate::storage::{MessageQuery, QueryScope};

    /// "Budget Review": root and first reply in finance, latest reply in the inbox
    fn budget_review() -> Fixture {
        let fx = Fixture::new();
        fx.bucket("finance");
        fx.seed("<r1@x>", "Budget Review", 1, None, Some("finance"));
        fx.seed("<r2@x>", "Re: Budget Review", 2, Some("<r1@x>"), Some("finance"));
        fx.seed("<r3@x>", "Re: Budget Review", 3, Some("<r2@x>"), None);
        fx
    }

    fn location(fx: &Fixture, identity: &str) -> Location {
        fx.db().get_message(identity).unwrap().unwrap().location("Drafts")
    }

    #[tokio::test]
    async fn test_archive_whole_thread() {
        let fx = budget_review();

        let archived = fx.engine.archive_thread("<r3@x>").await.unwrap();
        assert_eq!(archived, 3);

        for id in ["<r1@x>", "<r2@x>", "<r3@x>"] {
            assert_eq!(location(&fx, id), Location::Archived);
            assert_eq!(fx.gateway.folder_of(id).as_deref(), Some("Archive"));
        }

        let threads = fx.engine.archive_threads().unwrap();
        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0].count(), 3);
        assert_eq!(threads[0].subject, "Budget Review");
    }

    #[tokio::test]
    async fn test_partial_failure_leaves_cache_untouched() {
        let fx = Fixture::new();
        fx.bucket("travel");
        fx.bucket("finance");
        fx.seed("<t1@x>", "Trip", 1, None, Some("travel"));
        fx.seed("<t2@x>", "Re: Trip", 2, Some("<t1@x>"), Some("travel"));
        fx.seed("<t3@x>", "Re: Trip", 3, Some("<t2@x>"), Some("travel"));
        fx.gateway.fail_mutations_for("<t2@x>");

        let err = fx.engine.move_thread_to_bucket("<t1@x>", "finance").await.unwrap_err();
        assert!(matches!(err, SortaError::PartialFailure { failed: 1, total: 3, .. }));
        assert!(err.to_string().contains("1/3 failed"));

        let rows = fx
            .db()
            .query(&MessageQuery::new().scope(QueryScope::Bucket("travel".to_string())))
            .unwrap();
        assert_eq!(rows.len(), 3);
        assert!(fx
            .db()
            .query(&MessageQuery::new().scope(QueryScope::Bucket("finance".to_string())))
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_archive_unarchive_round_trip() {
        let fx = budget_review();
        fx.engine.move_thread_to_bucket("<r3@x>", "finance").await.unwrap();

        let before: Vec<_> = ["<r1@x>", "<r2@x>", "<r3@x>"]
            .iter()
            .map(|id| fx.db().get_message(id).unwrap().unwrap())
            .collect();

        fx.engine.archive_thread("<r1@x>").await.unwrap();
        let restored = fx.engine.unarchive_thread("<r1@x>", Some("finance")).await.unwrap();
        assert_eq!(restored, 3);

        for old in &before {
            let now = fx.db().get_message(&old.identity).unwrap().unwrap();
            assert_eq!(now.bucket_id, old.bucket_id);
            assert_eq!(now.archived_at, None);
            assert_eq!(now.folder, old.folder);
            assert_eq!(now.thread_key, old.thread_key);

            let flags = fx.gateway.flags_of(&old.identity).unwrap();
            assert!(flags.contains("$Bucket_finance"));
            assert!(!flags.contains(markers::ARCHIVED));
            assert_eq!(fx.gateway.folder_of(&old.identity).as_deref(), Some("INBOX"));
        }
    }

    #[tokio::test]
    async fn test_unarchive_keeps_bucket_without_target() {
        let fx = budget_review();
        fx.engine.archive_thread("<r1@x>").await.unwrap();
        fx.engine.unarchive_thread("<r2@x>", None).await.unwrap();

        assert_eq!(location(&fx, "<r1@x>"), Location::Bucket("finance".to_string()));
        assert_eq!(location(&fx, "<r3@x>"), Location::Inbox);
    }

    #[tokio::test]
    async fn test_unbucket_only_touches_same_bucket() {
        let fx = budget_review();

        let cleared = fx.engine.unbucket_thread("<r1@x>").await.unwrap();
        assert_eq!(cleared, 2);
        assert_eq!(location(&fx, "<r1@x>"), Location::Inbox);
        assert_eq!(location(&fx, "<r2@x>"), Location::Inbox);

        let flags = fx.gateway.flags_of("<r1@x>").unwrap();
        assert!(!flags.contains(markers::CATEGORIZED));

        let err = fx.engine.unbucket_thread("<r3@x>").await.unwrap_err();
        assert!(matches!(err, SortaError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_unarchive_partial_failure_keeps_rows_archived() {
        let fx = budget_review();
        fx.engine.archive_thread("<r1@x>").await.unwrap();
        let before: Vec<_> = ["<r1@x>", "<r2@x>", "<r3@x>"]
            .iter()
            .map(|id| fx.db().get_message(id).unwrap().unwrap())
            .collect();
        fx.gateway.fail_mutations_for("<r2@x>");

        let err = fx.engine.unarchive_thread("<r1@x>", None).await.unwrap_err();
        assert!(matches!(err, SortaError::PartialFailure { failed: 1, total: 3, .. }));

        for old in &before {
            let now = fx.db().get_message(&old.identity).unwrap().unwrap();
            assert_eq!(now.archived_at, old.archived_at);
            assert_eq!(now.bucket_id, old.bucket_id);
            assert_eq!(now.folder, old.folder);
            assert_eq!(now.location("Drafts"), Location::Archived);
        }
    }

    #[tokio::test]
    async fn test_unbucket_partial_failure_keeps_bucket() {
        let fx = budget_review();
        fx.gateway.fail_mutations_for("<r1@x>");

        let err = fx.engine.unbucket_thread("<r2@x>").await.unwrap_err();
        assert!(matches!(err, SortaError::PartialFailure { failed: 1, total: 2, .. }));

        assert_eq!(location(&fx, "<r1@x>"), Location::Bucket("finance".to_string()));
        assert_eq!(location(&fx, "<r2@x>"), Location::Bucket("finance".to_string()));
        assert_eq!(location(&fx, "<r3@x>"), Location::Inbox);
    }

    #[tokio::test]
    async fn test_verification_failure_aborts() {
        let fx = budget_review();
        fx.gateway.drop_moves(true);

        let err = fx.engine.archive_thread("<r3@x>").await.unwrap_err();
        assert!(matches!(err, SortaError::PartialFailure { failed: 3, total: 3, .. }));
        assert_eq!(location(&fx, "<r3@x>"), Location::Inbox);
    }

    #[tokio::test]
    async fn test_unknown_bucket_rejected() {
        let fx = budget_review();
        let err = fx.engine.move_thread_to_bucket("<r3@x>", "nope").await.unwrap_err();
        assert!(matches!(err, SortaError::NotFound(_)));
        assert_eq!(fx.gateway.call_count("set_category_markers"), 0);
    }
}
