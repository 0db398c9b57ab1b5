//! Database migrations for the message cache

use rusqlite::{Connection, Result as SqliteResult};

use crate::error::{SortaError, SortaResult};

/// Migration manager for database schema updates
pub struct MigrationManager<'a> {
    connection: &'a mut Connection,
}

impl<'a> MigrationManager<'a> {
    /// Create a new migration manager
    pub fn new(connection: &'a mut Connection) -> Self {
        Self { connection }
    }

    /// Run all pending migrations
    pub fn run_migrations(&mut self) -> SortaResult<()> {
        self.create_migrations_table()?;

        for migration in self.get_migrations() {
            if !self.is_migration_applied(migration.name())? {
                tracing::info!("Applying migration: {}", migration.name());
                let tx = self.connection.transaction()?;
                migration
                    .apply(&tx)
                    .map_err(|e| SortaError::DatabaseMigration(format!("{}: {}", migration.name(), e)))?;
                tx.execute("INSERT INTO migrations (name) VALUES (?)", [migration.name()])?;
                tx.commit()?;
                tracing::info!("Migration applied successfully: {}", migration.name());
            }
        }

        Ok(())
    }

    /// Names of applied migrations, oldest first
    pub fn applied_migrations(&self) -> SortaResult<Vec<String>> {
        let mut stmt = self
            .connection
            .prepare("SELECT name FROM migrations ORDER BY id")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<SqliteResult<Vec<String>>>()?;
        Ok(names)
    }

    /// Create the migrations tracking table
    fn create_migrations_table(&mut self) -> SqliteResult<()> {
        self.connection.execute(
            "CREATE TABLE IF NOT EXISTS migrations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                applied_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;
        Ok(())
    }

    /// Check if a migration has been applied
    fn is_migration_applied(&self, migration_name: &str) -> SqliteResult<bool> {
        let mut stmt = self
            .connection
            .prepare("SELECT COUNT(*) FROM migrations WHERE name = ?")?;
        let count: i64 = stmt.query_row([migration_name], |row| row.get(0))?;
        Ok(count > 0)
    }

    /// Get all available migrations
    fn get_migrations(&self) -> Vec<Box<dyn Migration>> {
        vec![
            Box::new(CreateMessagesTable),
            Box::new(CreateBucketsTable),
            Box::new(AddIndexes),
        ]
    }
}

/// Trait for database migrations
trait Migration {
    fn name(&self) -> &str;
    fn apply(&self, connection: &Connection) -> SqliteResult<()>;
}

/// Migration: Create messages table
struct CreateMessagesTable;

impl Migration for CreateMessagesTable {
    fn name(&self) -> &str {
        "create_messages_table"
    }

    fn apply(&self, connection: &Connection) -> SqliteResult<()> {
        connection.execute(
            "CREATE TABLE messages (
                identity TEXT PRIMARY KEY,
                folder TEXT,
                uid INTEGER,
                subject TEXT NOT NULL DEFAULT '',
                sender TEXT NOT NULL DEFAULT '',
                date DATETIME,
                preview TEXT NOT NULL DEFAULT '',
                has_attachments INTEGER NOT NULL DEFAULT 0,
                is_read INTEGER NOT NULL DEFAULT 0,
                is_flagged INTEGER NOT NULL DEFAULT 0,
                subject_key TEXT NOT NULL DEFAULT '',
                in_reply_to TEXT,
                refs TEXT NOT NULL DEFAULT '[]',
                thread_key TEXT,
                bucket_id TEXT,
                archived_at DATETIME,
                provenance TEXT NOT NULL DEFAULT 'inbox',
                note TEXT,
                due_date TEXT,
                body_html TEXT,
                body_text TEXT,
                attachments TEXT NOT NULL DEFAULT '[]',
                last_seen_at DATETIME
            )",
            [],
        )?;
        Ok(())
    }
}

/// Migration: Create buckets table
struct CreateBucketsTable;

impl Migration for CreateBucketsTable {
    fn name(&self) -> &str {
        "create_buckets_table"
    }

    fn apply(&self, connection: &Connection) -> SqliteResult<()> {
        connection.execute(
            "CREATE TABLE buckets (
                id TEXT PRIMARY KEY,
                label TEXT NOT NULL,
                color TEXT NOT NULL,
                sort_order INTEGER NOT NULL DEFAULT 0,
                count INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;
        Ok(())
    }
}

/// Migration: Add indexes
struct AddIndexes;

impl Migration for AddIndexes {
    fn name(&self) -> &str {
        "add_indexes"
    }

    fn apply(&self, connection: &Connection) -> SqliteResult<()> {
        connection.execute_batch(
            "CREATE INDEX idx_messages_thread_key ON messages (thread_key);
             CREATE INDEX idx_messages_subject_key ON messages (subject_key);
             CREATE INDEX idx_messages_bucket_id ON messages (bucket_id);
             CREATE INDEX idx_messages_archived_at ON messages (archived_at);
             CREATE INDEX idx_messages_date ON messages (date);",
        )?;
        Ok(())
    }
}
