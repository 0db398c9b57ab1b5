//! Orphan cleanup: reconcile cached inbox rows the inbox listing no longer
//! returns. Rows the server lost are deleted; rows found in the archive folder
//! are marked archived.

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::engine::ThreadEngine;
use crate::error::SortaResult;
use crate::message::LocationUpdate;

/// One bounded cleanup pass
#[derive(Debug, Clone)]
pub struct OrphanCleanup {
    /// Rows stamped later than this instant were seen by the current run
    pub seen_before: DateTime<Utc>,
    /// Start of the sync window; older rows are out of window, not orphaned
    pub window_start: DateTime<Utc>,
    /// Maximum rows checked
    pub sample_limit: usize,
}

/// What a cleanup pass changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrphanOutcome {
    /// Rows deleted because the server no longer has them
    pub deleted: usize,
    /// Rows marked archived because the server holds them in the archive
    pub archived: usize,
}

impl OrphanCleanup {
    /// Check a sample of unseen inbox rows against the server
    pub async fn run(&self, engine: &ThreadEngine) -> SortaResult<OrphanOutcome> {
        let mut outcome = OrphanOutcome::default();
        if self.sample_limit == 0 {
            return Ok(outcome);
        }

        let folders = engine.gateway().folders().clone();
        let candidates = engine.database().orphan_candidates(
            self.seen_before,
            self.window_start,
            &folders.inbox,
            self.sample_limit,
        )?;
        if candidates.is_empty() {
            return Ok(outcome);
        }

        let identities: Vec<String> = candidates.into_iter().map(|m| m.identity).collect();
        let present = engine.gateway().existing_identities(&identities).await?;
        debug!("{} of the sampled rows still exist remotely", present.len());

        let mut archived = Vec::new();
        let mut orphans = Vec::new();
        for identity in identities {
            match present.get(&identity) {
                None => orphans.push(identity),
                Some(folder) if *folder == folders.archive => archived.push(identity),
                Some(_) => {}
            }
        }

        if !archived.is_empty() {
            outcome.archived = engine
                .database()
                .apply_location_batch(&archived, &LocationUpdate::archive(folders.archive.clone()))?;
            info!("Marked {} messages archived to match the server", outcome.archived);
        }

        if !orphans.is_empty() {
            outcome.deleted = engine.database().delete_messages(&orphans)?;
            info!("Deleted {} orphaned messages from the cache", outcome.deleted);
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::Fixture;
    use crate::gateway::MailboxGateway;
    use crate::message::{ConflictPolicy, Location, MessageUpsert};
    use chrono::{Duration, TimeZone};

    fn cached(fx: &Fixture, identity: &str, date: DateTime<Utc>) {
        let mut upsert = MessageUpsert::new(identity);
        upsert.folder = Some("INBOX".to_string());
        upsert.subject = "Hello".to_string();
        upsert.sender = "alice@example.com".to_string();
        upsert.date = Some(date);
        fx.db().upsert_message(&upsert, ConflictPolicy::InboxPull).unwrap();
    }

    fn cleanup(window_start: DateTime<Utc>, sample_limit: usize) -> OrphanCleanup {
        OrphanCleanup {
            seen_before: Utc::now() + Duration::minutes(1),
            window_start,
            sample_limit,
        }
    }

    #[tokio::test]
    async fn test_only_in_window_rows_are_deleted() {
        let fx = Fixture::new();
        let window_start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        cached(&fx, "<inside@x>", Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap());
        cached(&fx, "<before@x>", Utc.with_ymd_and_hms(2023, 12, 1, 0, 0, 0).unwrap());
        fx.seed("<alive@x>", "Still here", 3, None, None);

        let outcome = cleanup(window_start, 50).run(&fx.engine).await.unwrap();
        assert_eq!(outcome.deleted, 1);
        assert_eq!(outcome.archived, 0);

        assert!(fx.db().get_message("<inside@x>").unwrap().is_none());
        assert!(fx.db().get_message("<before@x>").unwrap().is_some());
        assert!(fx.db().get_message("<alive@x>").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_recently_seen_rows_are_not_sampled() {
        let fx = Fixture::new();
        let window_start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        cached(&fx, "<inside@x>", Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap());

        let pass = OrphanCleanup {
            seen_before: Utc::now() - Duration::minutes(1),
            window_start,
            sample_limit: 50,
        };
        assert_eq!(pass.run(&fx.engine).await.unwrap(), OrphanOutcome::default());
        assert_eq!(cleanup(window_start, 0).run(&fx.engine).await.unwrap(), OrphanOutcome::default());
        assert!(fx.db().get_message("<inside@x>").unwrap().is_some());
        assert_eq!(fx.gateway.call_count("existing_identities"), 0);
    }

    #[tokio::test]
    async fn test_rows_found_in_archive_are_marked_archived() {
        let fx = Fixture::new();
        let window_start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        fx.seed("<moved@x>", "Trip", 3, None, None);
        fx.gateway.move_to_archive_folder("<moved@x>").await.unwrap();

        let outcome = cleanup(window_start, 50).run(&fx.engine).await.unwrap();
        assert_eq!(outcome, OrphanOutcome { deleted: 0, archived: 1 });

        let row = fx.db().get_message("<moved@x>").unwrap().unwrap();
        assert_eq!(row.location("Drafts"), Location::Archived);
        assert_eq!(row.folder.as_deref(), Some("Archive"));
    }
}
