//! Read-only predicate queries over the message cache

use chrono::{DateTime, Utc};
use rusqlite::types::Value;

/// Which location a query is restricted to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryScope {
    /// Incoming, not bucketed, not archived
    Inbox,
    /// Non-archived members of one bucket
    Bucket(String),
    /// Non-archived members of any bucket
    AnyBucket,
    /// Archived rows
    Archived,
    /// Outgoing rows
    Sent,
    /// Rows whose folder of record is the given folder
    Folder(String),
}

/// Predicate over cached message rows; every field narrows the result
#[derive(Debug, Clone, Default)]
pub struct MessageQuery {
    pub scope: Option<QueryScope>,
    pub thread_key: Option<String>,
    pub subject_key: Option<String>,
    pub identities: Option<Vec<String>>,
    /// Drop rows with sent or manual-send provenance
    pub exclude_outgoing: bool,
    /// Drop rows whose folder of record is this folder
    pub exclude_folder: Option<String>,
    pub missing_thread_key: bool,
    pub since: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl MessageQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scope(mut self, scope: QueryScope) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn thread_key(mut self, thread_key: impl Into<String>) -> Self {
        self.thread_key = Some(thread_key.into());
        self
    }

    pub fn subject_key(mut self, subject_key: impl Into<String>) -> Self {
        self.subject_key = Some(subject_key.into());
        self
    }

    pub fn identities(mut self, identities: Vec<String>) -> Self {
        self.identities = Some(identities);
        self
    }

    pub fn exclude_outgoing(mut self) -> Self {
        self.exclude_outgoing = true;
        self
    }

    pub fn exclude_folder(mut self, folder: impl Into<String>) -> Self {
        self.exclude_folder = Some(folder.into());
        self
    }

    pub fn missing_thread_key(mut self) -> Self {
        self.missing_thread_key = true;
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn before(mut self, before: DateTime<Utc>) -> Self {
        self.before = Some(before);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Render the WHERE / ORDER BY / LIMIT tail and its bound values
    pub(crate) fn to_sql(&self) -> (String, Vec<Value>) {
        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        match &self.scope {
            Some(QueryScope::Inbox) => clauses.push(
                "bucket_id IS NULL AND archived_at IS NULL AND provenance = 'inbox'".to_string(),
            ),
            Some(QueryScope::Bucket(id)) => {
                clauses.push(
                    "bucket_id = ? AND archived_at IS NULL AND provenance = 'inbox'".to_string(),
                );
                values.push(Value::Text(id.clone()));
            }
            Some(QueryScope::AnyBucket) => clauses.push(
                "bucket_id IS NOT NULL AND archived_at IS NULL AND provenance = 'inbox'"
                    .to_string(),
            ),
            Some(QueryScope::Archived) => clauses.push("archived_at IS NOT NULL".to_string()),
            Some(QueryScope::Sent) => {
                clauses.push("provenance <> 'inbox' AND archived_at IS NULL".to_string())
            }
            Some(QueryScope::Folder(folder)) => {
                clauses.push("folder = ?".to_string());
                values.push(Value::Text(folder.clone()));
            }
            None => {}
        }

        if let Some(key) = &self.thread_key {
            clauses.push("thread_key = ?".to_string());
            values.push(Value::Text(key.clone()));
        }

        if let Some(key) = &self.subject_key {
            clauses.push("subject_key = ?".to_string());
            values.push(Value::Text(key.clone()));
        }

        if let Some(identities) = &self.identities {
            if identities.is_empty() {
                clauses.push("0".to_string());
            } else {
                let marks = vec!["?"; identities.len()].join(", ");
                clauses.push(format!("identity IN ({})", marks));
                values.extend(identities.iter().cloned().map(Value::Text));
            }
        }

        if self.exclude_outgoing {
            clauses.push("provenance = 'inbox'".to_string());
        }

        if let Some(folder) = &self.exclude_folder {
            clauses.push("(folder IS NULL OR folder <> ?)".to_string());
            values.push(Value::Text(folder.clone()));
        }

        if self.missing_thread_key {
            clauses.push("(thread_key IS NULL OR thread_key = '')".to_string());
        }

        if let Some(since) = self.since {
            clauses.push("date >= ?".to_string());
            values.push(Value::Integer(since.timestamp()));
        }

        if let Some(before) = self.before {
            clauses.push("date < ?".to_string());
            values.push(Value::Integer(before.timestamp()));
        }

        let mut sql = String::new();
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY date IS NULL, date ASC, identity ASC");
        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        (sql, values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_rendering() {
        let (sql, values) = MessageQuery::new()
            .scope(QueryScope::Bucket("finance".to_string()))
            .thread_key("t1")
            .limit(5)
            .to_sql();

        assert!(sql.starts_with(" WHERE bucket_id = ?"));
        assert!(sql.contains("thread_key = ?"));
        assert!(sql.ends_with("LIMIT 5"));
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn test_empty_identity_list_matches_nothing() {
        let (sql, values) = MessageQuery::new().identities(vec![]).to_sql();
        assert!(sql.contains("WHERE 0"));
        assert!(values.is_empty());
    }
}
