//! Thread Consistency Engine
//!
//! Multi-message transitions are two-phase: every member is mutated remotely
//! first, and only when all of them succeeded is the cache updated, in one
//! batch. A failed remote phase leaves the cache untouched.

use std::sync::Arc;

use crate::config::FolderConfig;
use crate::gateway::MailboxGateway;
use crate::storage::Database;
use crate::sync::SyncState;

mod consolidate;
pub mod followup;
mod listing;
mod messages;
mod transitions;

pub use followup::{FollowUpAction, FollowUpFailure, FollowUpQueue};

/// Coordinates the cache and the remote mailbox for user-facing operations
pub struct ThreadEngine {
    db: Database,
    gateway: Arc<dyn MailboxGateway>,
    followups: FollowUpQueue,
    state: Arc<SyncState>,
}

impl ThreadEngine {
    pub fn new(db: Database, gateway: Arc<dyn MailboxGateway>) -> Self {
        Self {
            followups: FollowUpQueue::new(gateway.clone()),
            db,
            gateway,
            state: Arc::new(SyncState::new()),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn gateway(&self) -> &Arc<dyn MailboxGateway> {
        &self.gateway
    }

    pub fn followups(&self) -> &FollowUpQueue {
        &self.followups
    }

    pub fn state(&self) -> &Arc<SyncState> {
        &self.state
    }

    fn folders(&self) -> &FolderConfig {
        self.gateway.folders()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::bucket::Bucket;
    use crate::gateway::{InMemoryGateway, RemoteMessage};
    use crate::markers;
    use crate::message::{ConflictPolicy, MessageUpsert};
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    pub struct Fixture {
        pub _dir: TempDir,
        pub gateway: Arc<InMemoryGateway>,
        pub engine: ThreadEngine,
    }

    impl Fixture {
        pub fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let db = Database::open(&dir.path().join("test.db")).unwrap();
            let folders = FolderConfig {
                sent: Some("Sent".to_string()),
                ..FolderConfig::default()
            };
            let gateway = Arc::new(InMemoryGateway::new(folders));
            let engine = ThreadEngine::new(db, gateway.clone());
            Self {
                _dir: dir,
                gateway,
                engine,
            }
        }

        pub fn db(&self) -> &Database {
            self.engine.database()
        }

        pub fn bucket(&self, id: &str) {
            self.db().upsert_bucket(&Bucket::new(id)).unwrap();
        }

        /// Seed a message on both sides, consistent with `bucket`
        pub fn seed(&self, identity: &str, subject: &str, day: u32, parent: Option<&str>, bucket: Option<&str>) {
            let mut remote = RemoteMessage::new(identity, subject)
                .from_sender("alice@example.com")
                .dated(Utc.with_ymd_and_hms(2024, 3, day, 9, 0, 0).unwrap())
                .with_text(format!("Body of {}", identity));
            if let Some(parent) = parent {
                remote = remote.replying_to(parent);
            }
            if let Some(bucket) = bucket {
                remote = remote
                    .with_flag(markers::marker_for_bucket(bucket))
                    .with_flag(markers::CATEGORIZED);
            }
            let uid = self.gateway.add_message("INBOX", remote.clone());

            let summary = {
                let mut s = crate::types::MessageSummary::new(identity, "INBOX", uid);
                s.subject = remote.subject.clone();
                s.sender = remote.sender.clone();
                s.date = remote.date;
                s.in_reply_to = remote.in_reply_to.clone();
                s.references = remote.references.clone();
                s
            };
            let upsert = MessageUpsert::from_summary(&summary);
            match bucket {
                Some(bucket) => self
                    .db()
                    .upsert_message(&upsert.with_bucket(bucket), ConflictPolicy::BucketAssignment)
                    .unwrap(),
                None => self.db().upsert_message(&upsert, ConflictPolicy::InboxPull).unwrap(),
            }
        }
    }
}
