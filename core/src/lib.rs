//! Sorta Mail Core Library
//!
//! Keeps a local SQLite cache of one IMAP mailbox in sync with the server,
//! layering buckets, archiving and conversation threading on top of folders
//! and keywords:
//! - Remote Mailbox Gateway (`gateway`)
//! - Local Cache Store (`storage`)
//! - Thread Consistency Engine (`threading`, `engine`)
//! - Background Sync Worker (`sync`)

pub mod bucket;
pub mod buckets;
pub mod config;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod markers;
pub mod message;
pub mod storage;
pub mod sync;
pub mod threading;
pub mod types;

// Re-export commonly used types
pub use bucket::Bucket;
pub use buckets::{BucketCatalog, BucketUpdate};
pub use config::Config;
pub use engine::{FollowUpAction, FollowUpFailure, FollowUpQueue, ThreadEngine};
pub use error::{SortaError, SortaResult};
pub use gateway::{ImapGateway, InMemoryGateway, MailboxGateway};
pub use message::{CachedMessage, ConflictPolicy, Location, MessageUpsert, Provenance};
pub use storage::{Database, MessageQuery};
pub use sync::{SyncReport, SyncState, SyncStats, SyncWorker};
pub use threading::{group_by_thread_key, normalize_subject};
pub use types::{LocationHint, MessageBody, MessageSummary, ThreadGroup};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "Sorta Mail";

/// Default configuration directory name
pub const CONFIG_DIR_NAME: &str = "sorta-mail";

/// Default database filename
pub const DB_FILENAME: &str = "sorta-mail.db";

/// Maximum characters kept in a message preview
pub const PREVIEW_LENGTH: usize = 160;

/// Initialize the core library
pub fn init() -> SortaResult<()> {
    tracing::info!("Initializing {} Core v{}", APP_NAME, VERSION);
    Ok(())
}

/// Get the default configuration directory
pub fn get_config_dir() -> SortaResult<std::path::PathBuf> {
    let config_dir = std::env::var("SORTA_MAIL_CONFIG_DIR")
        .map(std::path::PathBuf::from)
        .or_else(|_| {
            directories::ProjectDirs::from("", "", CONFIG_DIR_NAME)
                .map(|dirs| dirs.config_dir().to_path_buf())
                .ok_or(std::env::VarError::NotPresent)
        })
        .unwrap_or_else(|_| std::path::PathBuf::from("~/.config/sorta-mail"));

    std::fs::create_dir_all(&config_dir)
        .map_err(|_| SortaError::DirCreateFailed(config_dir.clone()))?;

    Ok(config_dir)
}

/// Get the default data directory
pub fn get_data_dir() -> SortaResult<std::path::PathBuf> {
    let data_dir = std::env::var("SORTA_MAIL_DATA_DIR")
        .map(std::path::PathBuf::from)
        .or_else(|_| {
            directories::ProjectDirs::from("", "", CONFIG_DIR_NAME)
                .map(|dirs| dirs.data_dir().to_path_buf())
                .ok_or(std::env::VarError::NotPresent)
        })
        .unwrap_or_else(|_| std::path::PathBuf::from("~/.local/share/sorta-mail"));

    std::fs::create_dir_all(&data_dir)
        .map_err(|_| SortaError::DirCreateFailed(data_dir.clone()))?;

    Ok(data_dir)
}
