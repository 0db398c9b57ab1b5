//! Single-message operations

use chrono::NaiveDate;
use tracing::{debug, info};

use super::{FollowUpAction, ThreadEngine};
use crate::error::{SortaError, SortaResult};
use crate::gateway::parse;
use crate::markers;
use crate::message::{CachedMessage, ConflictPolicy, MessageUpsert};
use crate::threading;
use crate::types::MessageBody;

impl ThreadEngine {
    fn require(&self, identity: &str) -> SortaResult<CachedMessage> {
        self.db
            .get_message(identity)?
            .ok_or_else(|| SortaError::not_found(format!("Message {}", identity)))
    }

    /// File one message into a bucket: remote marker first, then the cache
    pub async fn assign_bucket(&self, identity: &str, bucket_id: &str) -> SortaResult<()> {
        if self.db.get_bucket(bucket_id)?.is_none() {
            return Err(SortaError::not_found(format!("Bucket {}", bucket_id)));
        }
        let message = self.require(identity)?;

        self.gateway
            .set_category_markers(identity, &[markers::marker_for_bucket(bucket_id)])
            .await?;

        let mut upsert = MessageUpsert::new(identity).with_bucket(bucket_id);
        upsert.folder = message.folder;
        upsert.uid = message.uid;
        self.db.upsert_message(&upsert, ConflictPolicy::BucketAssignment)?;

        debug!("Assigned {} to bucket {}", identity, bucket_id);
        Ok(())
    }

    /// Body of a message, from the cache when present. Concurrent loads of
    /// one message share a single remote fetch.
    pub async fn load_body(&self, identity: &str) -> SortaResult<MessageBody> {
        if let Some(body) = self.db.get_body(identity)? {
            return Ok(body);
        }

        let lock = self.state.body_fetch_lock(identity);
        let result = {
            let _guard = lock.lock().await;
            self.fetch_and_store_body(identity).await
        };
        self.state.finish_body_fetch(identity);
        drop(lock);
        result
    }

    async fn fetch_and_store_body(&self, identity: &str) -> SortaResult<MessageBody> {
        // another caller may have stored it while we waited
        if let Some(body) = self.db.get_body(identity)? {
            return Ok(body);
        }

        let message = self.require(identity)?;
        let body = self.gateway.fetch_body(identity, message.hint().as_ref()).await?;
        if body.found {
            self.db.set_body(identity, &body)?;
        } else {
            debug!("Body of {} not found remotely", identity);
        }
        Ok(body)
    }

    /// Update the read state locally and push it to the server in the background
    pub fn mark_read(&self, identity: &str, read: bool) -> SortaResult<()> {
        let message = self.require(identity)?;
        self.db.set_read(identity, read)?;

        self.followups.submit(FollowUpAction::SetSeen {
            identity: identity.to_string(),
            hint: message.hint(),
            seen: read,
        });
        Ok(())
    }

    /// Set the local note and due date; never sent to the server
    pub fn set_annotations(
        &self,
        identity: &str,
        note: Option<&str>,
        due_date: Option<NaiveDate>,
    ) -> SortaResult<()> {
        self.db.set_annotations(identity, note, due_date)
    }

    /// Append a draft; a previous version, when given, is deleted afterwards
    pub async fn save_draft(&self, raw: &[u8], replaces: Option<&str>) -> SortaResult<String> {
        let drafts = self.folders().drafts.clone();
        let flags = vec![markers::DRAFT.to_string(), markers::SEEN.to_string()];
        let identity = self.append_copy(&drafts, raw, &flags, ConflictPolicy::InboxPull).await?;

        if let Some(old) = replaces.filter(|old| *old != identity) {
            self.db.delete_messages(&[old.to_string()])?;
            self.followups.submit(FollowUpAction::DeleteMessage {
                identity: old.to_string(),
                folder: drafts,
            });
        }

        info!("Saved draft {}", identity);
        Ok(identity)
    }

    /// Delete a draft remotely, then from the cache
    pub async fn delete_draft(&self, identity: &str) -> SortaResult<()> {
        let drafts = self.folders().drafts.clone();
        self.gateway.delete_message(identity, &drafts).await?;
        self.db.delete_messages(&[identity.to_string()])?;
        info!("Deleted draft {}", identity);
        Ok(())
    }

    /// Record a message sent by this client. A copy is appended to the sent
    /// folder when one is configured.
    pub async fn record_sent_copy(&self, raw: &[u8]) -> SortaResult<String> {
        let identity = match self.folders().sent.clone() {
            Some(sent) => {
                self.append_copy(&sent, raw, &[markers::SEEN.to_string()], ConflictPolicy::ManualSend)
                    .await?
            }
            None => self.record_local(None, raw, ConflictPolicy::ManualSend)?,
        };
        info!("Recorded sent message {}", identity);
        Ok(identity)
    }

    async fn append_copy(
        &self,
        folder: &str,
        raw: &[u8],
        flags: &[String],
        policy: ConflictPolicy,
    ) -> SortaResult<String> {
        // reject before touching the server
        parse::identity_of(raw)
            .ok_or_else(|| SortaError::validation("Message has no Message-ID header"))?;
        self.gateway.append_message(folder, raw, flags).await?;
        self.record_local(Some(folder), raw, policy)
    }

    fn record_local(&self, folder: Option<&str>, raw: &[u8], policy: ConflictPolicy) -> SortaResult<String> {
        let summary = parse::parse_summary(folder.unwrap_or_default(), 0, raw, b"", vec![markers::SEEN.to_string()], None)?;
        let body = parse::parse_body(raw)?;

        let mut upsert = MessageUpsert::from_summary(&summary);
        upsert.folder = folder.map(str::to_string);
        upsert.uid = None;
        upsert.preview = body.preview(crate::PREVIEW_LENGTH);
        upsert.has_attachments = !body.attachments.is_empty();
        self.db.upsert_message(&upsert, policy)?;
        self.db.set_body(&summary.identity, &body)?;

        let row = self.require(&summary.identity)?;
        if row.thread_key.is_none() {
            let key = threading::resolve_thread_key(&self.db, &row, &self.folders().drafts)?;
            self.db.set_thread_key(&row.identity, &key)?;
        }
        Ok(summary.identity)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::Fixture;
    use crate::error::SortaError;
    use crate::markers;
    use crate::message::{Location, Provenance};
    use chrono::NaiveDate;

    const SENT: &[u8] = b"Message-ID: <sent1@x>\r\nFrom: me@example.com\r\nTo: bob@example.com\r\n\
Subject: Re: Budget Review\r\nIn-Reply-To: <r1@x>\r\nReferences: <r1@x>\r\n\r\nLooks good.\r\n";

    #[tokio::test]
    async fn test_assign_bucket_single_message() {
        let fx = Fixture::new();
        fx.bucket("finance");
        fx.seed("<m1@x>", "Invoice", 1, None, None);

        fx.engine.assign_bucket("<m1@x>", "finance").await.unwrap();

        let row = fx.db().get_message("<m1@x>").unwrap().unwrap();
        assert_eq!(row.location("Drafts"), Location::Bucket("finance".to_string()));
        assert_eq!(row.subject, "Invoice");
        assert_eq!(row.sender, "alice@example.com");
        assert!(fx.gateway.flags_of("<m1@x>").unwrap().contains("$Bucket_finance"));
    }

    #[tokio::test]
    async fn test_load_body_caches_found_bodies_only() {
        let fx = Fixture::new();
        fx.seed("<m1@x>", "Hello", 1, None, None);
        fx.seed("<m2@x>", "Gone", 1, None, None);
        fx.gateway.remove_message("<m2@x>");

        let body = fx.engine.load_body("<m1@x>").await.unwrap();
        assert_eq!(body.text.as_deref(), Some("Body of <m1@x>"));
        fx.engine.load_body("<m1@x>").await.unwrap();
        assert_eq!(fx.gateway.call_count("fetch_body"), 1);
        assert!(!fx.engine.state().body_fetch_in_flight("<m1@x>"));

        let missing = fx.engine.load_body("<m2@x>").await.unwrap();
        assert!(!missing.found);
        assert!(fx.db().get_body("<m2@x>").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mark_read_follows_up_remotely() {
        let fx = Fixture::new();
        fx.seed("<m1@x>", "Hello", 1, None, None);

        fx.engine.mark_read("<m1@x>", true).unwrap();
        assert!(fx.db().get_message("<m1@x>").unwrap().unwrap().is_read);

        // let the detached task finish
        for _ in 0..50 {
            if fx.gateway.flags_of("<m1@x>").unwrap().contains(markers::SEEN) {
                break;
            }
            tokio::task::yield_now().await;
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(fx.gateway.flags_of("<m1@x>").unwrap().contains(markers::SEEN));
    }

    #[tokio::test]
    async fn test_annotations_stay_local() {
        let fx = Fixture::new();
        fx.seed("<m1@x>", "Hello", 1, None, None);
        let due = NaiveDate::from_ymd_opt(2024, 4, 1).unwrap();

        fx.engine.set_annotations("<m1@x>", Some("call back"), Some(due)).unwrap();
        let row = fx.db().get_message("<m1@x>").unwrap().unwrap();
        assert_eq!(row.note.as_deref(), Some("call back"));
        assert_eq!(row.due_date, Some(due));
        assert_eq!(fx.gateway.call_count("set_seen"), 0);

        let err = fx.engine.set_annotations("<nope@x>", None, None).unwrap_err();
        assert!(matches!(err, SortaError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_drafts_lifecycle() {
        let fx = Fixture::new();
        let v1 = b"Message-ID: <d1@x>\r\nFrom: me@example.com\r\nSubject: Plan\r\n\r\nfirst\r\n";
        let v2 = b"Message-ID: <d2@x>\r\nFrom: me@example.com\r\nSubject: Plan\r\n\r\nsecond\r\n";

        let id = fx.engine.save_draft(v1, None).await.unwrap();
        assert_eq!(id, "<d1@x>");
        let row = fx.db().get_message("<d1@x>").unwrap().unwrap();
        assert_eq!(row.location("Drafts"), Location::Drafts);
        assert!(fx.engine.inbox_threads().unwrap().is_empty());

        fx.engine.save_draft(v2, Some("<d1@x>")).await.unwrap();
        assert!(fx.db().get_message("<d1@x>").unwrap().is_none());
        assert_eq!(fx.engine.drafts().unwrap().len(), 1);

        fx.engine.delete_draft("<d2@x>").await.unwrap();
        assert!(fx.db().get_message("<d2@x>").unwrap().is_none());
        assert!(fx.gateway.identities_in("Drafts").iter().all(|id| id != "<d2@x>"));

        let err = fx.engine.save_draft(b"Subject: nothing\r\n\r\n", None).await.unwrap_err();
        assert!(matches!(err, SortaError::Validation(_)));
    }

    #[tokio::test]
    async fn test_record_sent_copy_joins_thread() {
        let fx = Fixture::new();
        fx.seed("<r1@x>", "Budget Review", 1, None, None);
        fx.engine.backfill_thread_keys(10).unwrap();

        let id = fx.engine.record_sent_copy(SENT).await.unwrap();
        let row = fx.db().get_message(&id).unwrap().unwrap();
        assert_eq!(row.provenance, Provenance::ManualSend);
        assert_eq!(row.folder.as_deref(), Some("Sent"));
        assert_eq!(row.thread_key.as_deref(), Some("<r1@x>"));
        assert_eq!(fx.gateway.folder_of(&id).as_deref(), Some("Sent"));

        // outgoing copies stay put when the thread moves
        fx.engine.archive_thread("<r1@x>").await.unwrap();
        assert_eq!(fx.gateway.folder_of(&id).as_deref(), Some("Sent"));
    }
}
