//! Thread listings per location

use super::ThreadEngine;
use crate::error::SortaResult;
use crate::storage::{MessageQuery, QueryScope};
use crate::threading::group_by_thread_key;
use crate::types::ThreadGroup;

impl ThreadEngine {
    fn threads_in(&self, scope: QueryScope) -> SortaResult<Vec<ThreadGroup>> {
        let query = MessageQuery::new()
            .scope(scope)
            .exclude_folder(self.folders().drafts.clone());
        Ok(group_by_thread_key(self.db.query(&query)?))
    }

    pub fn inbox_threads(&self) -> SortaResult<Vec<ThreadGroup>> {
        self.threads_in(QueryScope::Inbox)
    }

    pub fn bucket_threads(&self, bucket_id: &str) -> SortaResult<Vec<ThreadGroup>> {
        self.threads_in(QueryScope::Bucket(bucket_id.to_string()))
    }

    pub fn archive_threads(&self) -> SortaResult<Vec<ThreadGroup>> {
        self.threads_in(QueryScope::Archived)
    }

    pub fn sent_threads(&self) -> SortaResult<Vec<ThreadGroup>> {
        self.threads_in(QueryScope::Sent)
    }

    /// Drafts, one group per draft
    pub fn drafts(&self) -> SortaResult<Vec<ThreadGroup>> {
        let query = MessageQuery::new().scope(QueryScope::Folder(self.folders().drafts.clone()));
        let rows = self.db.query(&query)?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let subject = row.subject.clone();
                ThreadGroup::new(row.identity.clone(), subject, vec![row])
            })
            .rev()
            .collect())
    }

    /// Every cached member of the conversation `identity` belongs to,
    /// whatever its location
    pub fn conversation(&self, identity: &str) -> SortaResult<Option<ThreadGroup>> {
        let key = self.thread_key_of(identity)?;
        let rows = self.db.query(&MessageQuery::new().thread_key(key))?;
        Ok(group_by_thread_key(rows).into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::Fixture;

    #[tokio::test]
    async fn test_listings_split_by_location() {
        let fx = Fixture::new();
        fx.bucket("finance");
        fx.seed("<a1@x>", "Budget Review", 1, None, Some("finance"));
        fx.seed("<a2@x>", "Re: Budget Review", 2, Some("<a1@x>"), Some("finance"));
        fx.seed("<b1@x>", "Lunch", 3, None, None);
        fx.seed("<c1@x>", "Release plan", 4, None, None);
        fx.engine.backfill_thread_keys(100).unwrap();

        let inbox = fx.engine.inbox_threads().unwrap();
        assert_eq!(inbox.len(), 2);
        assert_eq!(inbox[0].messages[0].identity, "<c1@x>");

        let finance = fx.engine.bucket_threads("finance").unwrap();
        assert_eq!(finance.len(), 1);
        assert_eq!(finance[0].count(), 2);

        assert!(fx.engine.archive_threads().unwrap().is_empty());
        assert!(fx.engine.sent_threads().unwrap().is_empty());

        let conversation = fx.engine.conversation("<a2@x>").unwrap().unwrap();
        assert_eq!(conversation.count(), 2);
    }
}
