//! Storage layer: SQLite message and bucket cache

pub mod database;
pub mod migrations;
pub mod query;

pub use database::{Database, DbPool};
pub use migrations::MigrationManager;
pub use query::{MessageQuery, QueryScope};
