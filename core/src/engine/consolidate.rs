//! Reuniting conversations after a reply lands in the inbox

use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info, warn};

use super::ThreadEngine;
use crate::error::SortaResult;
use crate::message::{CachedMessage, LocationUpdate};
use crate::storage::{MessageQuery, QueryScope};

impl ThreadEngine {
    /// Pull archived or bucketed rows that share a thread with the inbox back
    /// into the inbox. Best effort: a message that cannot be moved is logged
    /// and left where it is.
    pub async fn auto_consolidate_threads(&self) -> SortaResult<usize> {
        let folders = self.folders().clone();
        let keys = self.db.inbox_thread_keys(&folders.drafts)?;

        let mut moved = 0;
        for key in keys {
            let strays = self.strays_for(&key)?;
            for stray in strays {
                match self.pull_back(&stray).await {
                    Ok(()) => {
                        self.db
                            .apply_location_batch(&[stray.identity.clone()], &LocationUpdate::to_inbox(folders.inbox.clone()))?;
                        self.db.set_thread_key(&stray.identity, &key)?;
                        moved += 1;
                    }
                    Err(e) => warn!("Could not consolidate {} into {}: {}", stray.identity, key, e),
                }
            }
        }

        if moved > 0 {
            info!("Consolidated {} messages back into the inbox", moved);
        }
        Ok(moved)
    }

    /// Archived or bucketed rows matching an inbox thread by key or subject
    fn strays_for(&self, key: &str) -> SortaResult<Vec<CachedMessage>> {
        let inbox_rows = self.db.query(
            &MessageQuery::new()
                .scope(QueryScope::Inbox)
                .thread_key(key)
                .exclude_folder(self.folders().drafts.clone()),
        )?;
        let subjects: HashSet<String> = inbox_rows
            .iter()
            .map(|m| m.subject_key.clone())
            .filter(|s| !s.is_empty())
            .collect();

        let mut strays: BTreeMap<String, CachedMessage> = BTreeMap::new();
        for scope in [QueryScope::Archived, QueryScope::AnyBucket] {
            let by_key = MessageQuery::new().scope(scope.clone()).thread_key(key).exclude_outgoing();
            for row in self.db.query(&by_key)? {
                strays.insert(row.identity.clone(), row);
            }
            for subject in &subjects {
                let by_subject = MessageQuery::new()
                    .scope(scope.clone())
                    .subject_key(subject.clone())
                    .exclude_outgoing();
                for row in self.db.query(&by_subject)? {
                    strays.insert(row.identity.clone(), row);
                }
            }
        }

        if !strays.is_empty() {
            debug!("Thread {} has {} messages outside the inbox", key, strays.len());
        }
        Ok(strays.into_values().collect())
    }

    async fn pull_back(&self, stray: &CachedMessage) -> SortaResult<()> {
        if stray.is_archived() {
            self.gateway
                .move_from_archive_to_folder(&stray.identity, &self.folders().inbox)
                .await?;
        }
        if stray.bucket_id.is_some() {
            self.gateway.set_category_markers(&stray.identity, &[]).await?;
        }
        Ok(())
    }
}
