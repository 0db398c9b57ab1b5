//! Database layer for the message cache

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, OptionalExtension, Result as SqliteResult, Row};
use std::collections::HashSet;
use std::path::Path;

use crate::bucket::Bucket;
use crate::error::{SortaError, SortaResult};
use crate::message::{CachedMessage, Change, ConflictPolicy, LocationUpdate, MessageUpsert, Provenance};
use crate::storage::migrations::MigrationManager;
use crate::storage::query::{MessageQuery, QueryScope};
use crate::types::{AttachmentMeta, MessageBody};

pub type DbPool = Pool<SqliteConnectionManager>;

const MESSAGE_COLUMNS: &str = "identity, folder, uid, subject, sender, date, preview, \
    has_attachments, is_read, is_flagged, subject_key, in_reply_to, refs, thread_key, \
    bucket_id, archived_at, provenance, note, due_date, body_html, body_text, attachments, \
    last_seen_at";

const INSERT_MESSAGE: &str = "INSERT INTO messages (identity, folder, uid, subject, sender, \
    date, preview, has_attachments, is_read, is_flagged, subject_key, in_reply_to, refs, \
    thread_key, bucket_id, provenance, last_seen_at) \
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, NULLIF(?14, ''), ?15, ?16, ?17)";

/// Authority rank of a provenance column, as SQL
fn rank_sql(column: &str) -> String {
    format!(
        "(CASE {} WHEN 'manual_send' THEN 3 WHEN 'sent' THEN 2 ELSE 1 END)",
        column
    )
}

/// ON CONFLICT clause for an upsert policy
fn conflict_clause(policy: ConflictPolicy) -> String {
    let provenance = format!(
        "provenance = CASE WHEN {} > {} THEN excluded.provenance ELSE messages.provenance END",
        rank_sql("excluded.provenance"),
        rank_sql("messages.provenance")
    );
    let thread_key = "thread_key = COALESCE(excluded.thread_key, messages.thread_key)";

    match policy {
        ConflictPolicy::InboxPull => "ON CONFLICT(identity) DO UPDATE SET \
            folder = CASE WHEN messages.provenance = 'inbox' THEN excluded.folder ELSE messages.folder END, \
            uid = CASE WHEN messages.provenance = 'inbox' THEN excluded.uid ELSE messages.uid END, \
            archived_at = CASE WHEN messages.provenance = 'inbox' THEN NULL ELSE messages.archived_at END, \
            last_seen_at = excluded.last_seen_at"
            .to_string(),
        ConflictPolicy::SentPull => format!(
            "ON CONFLICT(identity) DO UPDATE SET \
             folder = excluded.folder, \
             uid = excluded.uid, \
             subject = COALESCE(NULLIF(messages.subject, ''), excluded.subject), \
             sender = COALESCE(NULLIF(messages.sender, ''), excluded.sender), \
             subject_key = CASE WHEN messages.subject = '' THEN excluded.subject_key ELSE messages.subject_key END, \
             date = COALESCE(messages.date, excluded.date), \
             {}, {}, \
             last_seen_at = excluded.last_seen_at \
             WHERE messages.provenance <> 'inbox'",
            provenance, thread_key
        ),
        ConflictPolicy::BucketAssignment => format!(
            "ON CONFLICT(identity) DO UPDATE SET \
             bucket_id = excluded.bucket_id, \
             archived_at = NULL, \
             folder = CASE WHEN messages.provenance <> 'inbox' THEN messages.folder \
                 ELSE COALESCE(excluded.folder, messages.folder) END, \
             uid = CASE WHEN messages.provenance <> 'inbox' THEN messages.uid \
                 ELSE COALESCE(excluded.uid, messages.uid) END, \
             subject = CASE WHEN messages.provenance <> 'inbox' THEN messages.subject \
                 ELSE COALESCE(NULLIF(excluded.subject, ''), messages.subject) END, \
             sender = CASE WHEN messages.provenance <> 'inbox' THEN messages.sender \
                 ELSE COALESCE(NULLIF(excluded.sender, ''), messages.sender) END, \
             subject_key = CASE WHEN messages.provenance = 'inbox' AND excluded.subject <> '' \
                 THEN excluded.subject_key ELSE messages.subject_key END, \
             date = COALESCE(excluded.date, messages.date), \
             preview = COALESCE(NULLIF(excluded.preview, ''), messages.preview), \
             in_reply_to = COALESCE(excluded.in_reply_to, messages.in_reply_to), \
             refs = CASE WHEN excluded.refs <> '[]' THEN excluded.refs ELSE messages.refs END, \
             {}, {}, \
             last_seen_at = excluded.last_seen_at",
            provenance, thread_key
        ),
        ConflictPolicy::ManualSend => format!(
            "ON CONFLICT(identity) DO UPDATE SET \
             folder = COALESCE(excluded.folder, messages.folder), \
             uid = COALESCE(excluded.uid, messages.uid), \
             subject = COALESCE(NULLIF(excluded.subject, ''), messages.subject), \
             sender = COALESCE(NULLIF(excluded.sender, ''), messages.sender), \
             subject_key = CASE WHEN excluded.subject <> '' THEN excluded.subject_key ELSE messages.subject_key END, \
             date = COALESCE(excluded.date, messages.date), \
             {}, {}, \
             last_seen_at = excluded.last_seen_at",
            provenance, thread_key
        ),
    }
}

fn to_timestamp(dt: Option<DateTime<Utc>>) -> Option<i64> {
    dt.map(|d| d.timestamp())
}

fn from_timestamp(ts: Option<i64>) -> Option<DateTime<Utc>> {
    ts.and_then(|ts| Utc.timestamp_opt(ts, 0).single())
}

/// Database connection pool wrapper
#[derive(Clone)]
pub struct Database {
    pool: DbPool,
}

impl Database {
    /// Open (creating if needed) the cache database and run migrations
    pub fn open(database_path: &Path) -> SortaResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = database_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let manager = SqliteConnectionManager::file(database_path).with_init(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA busy_timeout = 5000;
                 PRAGMA temp_store = MEMORY;",
            )
        });
        let pool = Pool::builder().max_size(8).build(manager)?;

        let database = Self { pool };
        database.initialize()?;
        Ok(database)
    }

    /// Run migrations
    fn initialize(&self) -> SortaResult<()> {
        let mut conn = self.pool.get()?;
        MigrationManager::new(&mut conn).run_migrations()
    }

    // Message operations

    /// Insert or merge a message row according to `policy`
    pub fn upsert_message(&self, msg: &MessageUpsert, policy: ConflictPolicy) -> SortaResult<()> {
        msg.validate()?;

        let bucket_id = match policy {
            ConflictPolicy::BucketAssignment => msg.bucket_id.clone(),
            _ => None,
        };
        let sql = format!("{} {}", INSERT_MESSAGE, conflict_clause(policy));

        let conn = self.pool.get()?;
        conn.execute(
            &sql,
            params![
                msg.identity,
                msg.folder,
                msg.uid,
                msg.subject,
                msg.sender,
                to_timestamp(msg.date),
                msg.preview,
                msg.has_attachments,
                msg.is_read,
                msg.is_flagged,
                msg.subject_key(),
                msg.in_reply_to,
                serde_json::to_string(&msg.references)?,
                msg.thread_key.clone().unwrap_or_default(),
                bucket_id,
                policy.provenance().as_str(),
                Utc::now().timestamp(),
            ],
        )?;

        Ok(())
    }

    /// Run a read-only predicate query
    pub fn query(&self, query: &MessageQuery) -> SortaResult<Vec<CachedMessage>> {
        let (tail, values) = query.to_sql();
        let sql = format!("SELECT {} FROM messages{}", MESSAGE_COLUMNS, tail);

        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values), row_to_message)?
            .collect::<SqliteResult<Vec<_>>>()?;
        Ok(rows)
    }

    /// Get a message by identity
    pub fn get_message(&self, identity: &str) -> SortaResult<Option<CachedMessage>> {
        let conn = self.pool.get()?;
        let sql = format!("SELECT {} FROM messages WHERE identity = ?", MESSAGE_COLUMNS);
        let message = conn
            .query_row(&sql, [identity], row_to_message)
            .optional()?;
        Ok(message)
    }

    /// Thread key of the first listed identity that has one
    pub fn thread_key_for_identities(&self, identities: &[String]) -> SortaResult<Option<String>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT thread_key FROM messages WHERE identity = ? AND thread_key IS NOT NULL AND thread_key <> ''",
        )?;

        for identity in identities {
            let key: Option<String> = stmt
                .query_row([identity], |row| row.get(0))
                .optional()?;
            if key.is_some() {
                return Ok(key);
            }
        }
        Ok(None)
    }

    /// Thread key of the newest row in `scope` sharing `subject_key`
    pub fn thread_key_for_subject(
        &self,
        subject_key: &str,
        scope: &QueryScope,
        exclude_identity: &str,
    ) -> SortaResult<Option<String>> {
        if subject_key.is_empty() {
            return Ok(None);
        }

        let query = MessageQuery::new()
            .scope(scope.clone())
            .subject_key(subject_key);
        let key = self
            .query(&query)?
            .into_iter()
            .rev()
            .filter(|m| m.identity != exclude_identity)
            .find_map(|m| m.thread_key.filter(|k| !k.is_empty()));
        Ok(key)
    }

    /// Assign a thread key; empty keys are rejected
    pub fn set_thread_key(&self, identity: &str, thread_key: &str) -> SortaResult<()> {
        if thread_key.trim().is_empty() {
            return Err(SortaError::validation("Thread key cannot be empty"));
        }

        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE messages SET thread_key = ? WHERE identity = ?",
            params![thread_key, identity],
        )?;
        Ok(())
    }

    /// Apply one location change to every identity in a single transaction
    pub fn apply_location_batch(
        &self,
        identities: &[String],
        update: &LocationUpdate,
    ) -> SortaResult<usize> {
        let mut sets: Vec<&str> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        match &update.bucket_id {
            Change::Keep => {}
            Change::Set(id) => {
                sets.push("bucket_id = ?");
                values.push(Value::Text(id.clone()));
            }
            Change::Clear => sets.push("bucket_id = NULL"),
        }

        match &update.archived_at {
            Change::Keep => {}
            Change::Set(at) => {
                sets.push("archived_at = ?");
                values.push(Value::Integer(at.timestamp()));
            }
            Change::Clear => sets.push("archived_at = NULL"),
        }

        if let Some(folder) = &update.folder {
            sets.push("folder = ?");
            sets.push("uid = NULL");
            values.push(Value::Text(folder.clone()));
        }

        if sets.is_empty() || identities.is_empty() {
            return Ok(0);
        }

        let sql = format!("UPDATE messages SET {} WHERE identity = ?", sets.join(", "));

        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let mut changed = 0;
        {
            let mut stmt = tx.prepare(&sql)?;
            for identity in identities {
                let mut bound = values.clone();
                bound.push(Value::Text(identity.clone()));
                changed += stmt.execute(params_from_iter(bound))?;
            }
        }
        tx.commit()?;

        Ok(changed)
    }

    /// Delete rows by identity
    pub fn delete_messages(&self, identities: &[String]) -> SortaResult<usize> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let mut deleted = 0;
        {
            let mut stmt = tx.prepare("DELETE FROM messages WHERE identity = ?")?;
            for identity in identities {
                deleted += stmt.execute([identity])?;
            }
        }
        tx.commit()?;
        Ok(deleted)
    }

    /// Inbox-scope rows last observed no later than `seen_before`, dated inside the window
    pub fn orphan_candidates(
        &self,
        seen_before: DateTime<Utc>,
        window_start: DateTime<Utc>,
        inbox_folder: &str,
        limit: usize,
    ) -> SortaResult<Vec<CachedMessage>> {
        let conn = self.pool.get()?;
        let sql = format!(
            "SELECT {} FROM messages \
             WHERE bucket_id IS NULL AND archived_at IS NULL AND provenance = 'inbox' \
             AND (folder IS NULL OR folder = ?1) \
             AND (last_seen_at IS NULL OR last_seen_at <= ?2) \
             AND date IS NOT NULL AND date >= ?3 \
             ORDER BY last_seen_at IS NOT NULL, last_seen_at ASC LIMIT ?4",
            MESSAGE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                params![inbox_folder, seen_before.timestamp(), window_start.timestamp(), limit as i64],
                row_to_message,
            )?
            .collect::<SqliteResult<Vec<_>>>()?;
        Ok(rows)
    }

    /// Distinct thread keys present in the inbox scope
    pub fn inbox_thread_keys(&self, exclude_folder: &str) -> SortaResult<Vec<String>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT thread_key FROM messages \
             WHERE bucket_id IS NULL AND archived_at IS NULL AND provenance = 'inbox' \
             AND (folder IS NULL OR folder <> ?) \
             AND thread_key IS NOT NULL AND thread_key <> '' \
             ORDER BY thread_key",
        )?;
        let keys = stmt
            .query_map([exclude_folder], |row| row.get(0))?
            .collect::<SqliteResult<Vec<String>>>()?;
        Ok(keys)
    }

    /// Cache a fetched body
    pub fn set_body(&self, identity: &str, body: &MessageBody) -> SortaResult<()> {
        let preview = body.preview(crate::PREVIEW_LENGTH);
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE messages SET body_html = ?, body_text = ?, attachments = ?, \
             has_attachments = ?, preview = CASE WHEN preview = '' THEN ? ELSE preview END \
             WHERE identity = ?",
            params![
                body.html,
                body.text,
                serde_json::to_string(&body.attachments)?,
                !body.attachments.is_empty(),
                preview,
                identity,
            ],
        )?;
        Ok(())
    }

    /// Cached body, if one has been stored
    pub fn get_body(&self, identity: &str) -> SortaResult<Option<MessageBody>> {
        let conn = self.pool.get()?;
        let body = conn
            .query_row(
                "SELECT body_html, body_text, attachments FROM messages \
                 WHERE identity = ? AND (body_html IS NOT NULL OR body_text IS NOT NULL)",
                [identity],
                |row| {
                    let attachments: String = row.get(2)?;
                    Ok(MessageBody {
                        html: row.get(0)?,
                        text: row.get(1)?,
                        attachments: serde_json::from_str(&attachments).unwrap_or_default(),
                        found: true,
                    })
                },
            )
            .optional()?;
        Ok(body)
    }

    /// Set the local note and due date
    pub fn set_annotations(
        &self,
        identity: &str,
        note: Option<&str>,
        due_date: Option<NaiveDate>,
    ) -> SortaResult<()> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE messages SET note = ?, due_date = ? WHERE identity = ?",
            params![
                note.filter(|n| !n.trim().is_empty()),
                due_date.map(|d| d.format("%Y-%m-%d").to_string()),
                identity
            ],
        )?;
        if changed == 0 {
            return Err(SortaError::not_found(format!("Message {}", identity)));
        }
        Ok(())
    }

    /// Set the local read state
    pub fn set_read(&self, identity: &str, is_read: bool) -> SortaResult<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE messages SET is_read = ? WHERE identity = ?",
            params![is_read, identity],
        )?;
        Ok(())
    }

    /// Clear bucket assignments the remote no longer carries
    pub fn prune_bucket(&self, bucket_id: &str, keep: &HashSet<String>) -> SortaResult<Vec<String>> {
        let members = self.query(&MessageQuery::new().scope(QueryScope::Bucket(bucket_id.to_string())))?;
        let stale: Vec<String> = members
            .into_iter()
            .map(|m| m.identity)
            .filter(|identity| !keep.contains(identity))
            .collect();

        if !stale.is_empty() {
            self.apply_location_batch(&stale, &LocationUpdate::unbucket())?;
        }
        Ok(stale)
    }

    /// Total number of cached rows
    pub fn message_count(&self) -> SortaResult<usize> {
        let conn = self.pool.get()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    // Bucket operations

    /// Create or update a bucket
    pub fn upsert_bucket(&self, bucket: &Bucket) -> SortaResult<()> {
        bucket.validate()?;

        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO buckets (id, label, color, sort_order, count) VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET label = excluded.label, color = excluded.color, \
             sort_order = excluded.sort_order",
            params![bucket.id, bucket.label, bucket.color, bucket.sort_order, bucket.count],
        )?;
        Ok(())
    }

    /// Get all buckets
    pub fn get_buckets(&self) -> SortaResult<Vec<Bucket>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, label, color, sort_order, count FROM buckets ORDER BY sort_order, label",
        )?;
        let buckets = stmt
            .query_map([], row_to_bucket)?
            .collect::<SqliteResult<Vec<_>>>()?;
        Ok(buckets)
    }

    /// Get a bucket by id
    pub fn get_bucket(&self, bucket_id: &str) -> SortaResult<Option<Bucket>> {
        let conn = self.pool.get()?;
        let bucket = conn
            .query_row(
                "SELECT id, label, color, sort_order, count FROM buckets WHERE id = ?",
                [bucket_id],
                row_to_bucket,
            )
            .optional()?;
        Ok(bucket)
    }

    /// Delete a bucket and clear local assignments to it
    pub fn delete_bucket(&self, bucket_id: &str) -> SortaResult<bool> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        tx.execute("UPDATE messages SET bucket_id = NULL WHERE bucket_id = ?", [bucket_id])?;
        let deleted = tx.execute("DELETE FROM buckets WHERE id = ?", [bucket_id])?;
        tx.commit()?;
        Ok(deleted > 0)
    }

    /// Store a bucket's cached count
    pub fn set_bucket_count(&self, bucket_id: &str, count: i64) -> SortaResult<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE buckets SET count = ? WHERE id = ?",
            params![count, bucket_id],
        )?;
        Ok(())
    }

    /// Count non-archived members of a bucket
    pub fn count_bucket_members(&self, bucket_id: &str) -> SortaResult<i64> {
        let conn = self.pool.get()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE bucket_id = ? AND archived_at IS NULL AND provenance = 'inbox'",
            [bucket_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

fn row_to_message(row: &Row) -> SqliteResult<CachedMessage> {
    let refs: String = row.get("refs")?;
    let attachments: String = row.get("attachments")?;
    let provenance: String = row.get("provenance")?;
    let due_date: Option<String> = row.get("due_date")?;

    Ok(CachedMessage {
        identity: row.get("identity")?,
        folder: row.get("folder")?,
        uid: row.get("uid")?,
        subject: row.get("subject")?,
        sender: row.get("sender")?,
        date: from_timestamp(row.get("date")?),
        preview: row.get("preview")?,
        has_attachments: row.get("has_attachments")?,
        is_read: row.get("is_read")?,
        is_flagged: row.get("is_flagged")?,
        subject_key: row.get("subject_key")?,
        in_reply_to: row.get("in_reply_to")?,
        references: serde_json::from_str(&refs).unwrap_or_default(),
        thread_key: row.get("thread_key")?,
        bucket_id: row.get("bucket_id")?,
        archived_at: from_timestamp(row.get("archived_at")?),
        provenance: provenance.parse().unwrap_or(Provenance::Inbox),
        note: row.get("note")?,
        due_date: due_date.and_then(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d").ok()),
        body_html: row.get("body_html")?,
        body_text: row.get("body_text")?,
        attachments: serde_json::from_str::<Vec<AttachmentMeta>>(&attachments).unwrap_or_default(),
        last_seen_at: from_timestamp(row.get("last_seen_at")?),
    })
}

fn row_to_bucket(row: &Row) -> SqliteResult<Bucket> {
    Ok(Bucket {
        id: row.get(0)?,
        label: row.get(1)?,
        color: row.get(2)?,
        sort_order: row.get(3)?,
        count: row.get(4)?,
    })
}
