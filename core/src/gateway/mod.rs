//! Remote Mailbox Gateway
//!
//! Every remote operation goes through a `MailboxGateway`. Operations on one
//! folder serialize behind that folder's lock, and all of them share a single
//! session, so at most one command is in flight at a time.

use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{FolderConfig, GatewayConfig};
use crate::error::SortaResult;
use crate::types::{LocationHint, MessageBody, MessageSummary};

pub mod imap;
pub mod memory;
pub mod parse;

pub use imap::{ImapGateway, SessionState};
pub use memory::{InMemoryGateway, RemoteMessage};

/// Operations against the remote mailbox
#[async_trait]
pub trait MailboxGateway: Send + Sync {
    /// Folder names this gateway works with
    fn folders(&self) -> &FolderConfig;

    /// Inbox messages without the categorized or archived markers, dated on or
    /// after `cutoff` (or flagged, when `include_flagged`)
    async fn list_inbox_summaries(
        &self,
        cutoff: NaiveDate,
        include_flagged: bool,
    ) -> SortaResult<Vec<MessageSummary>>;

    /// Messages of any folder dated on or after `cutoff`
    async fn list_folder_summaries(
        &self,
        folder: &str,
        cutoff: NaiveDate,
    ) -> SortaResult<Vec<MessageSummary>>;

    /// Inbox messages carrying `marker`, excluding archived ones
    async fn list_marker_summaries(&self, marker: &str) -> SortaResult<Vec<MessageSummary>>;

    /// Fetch a decoded body; a miss yields `MessageBody::not_found()`
    async fn fetch_body(
        &self,
        identity: &str,
        hint: Option<&LocationHint>,
    ) -> SortaResult<MessageBody>;

    /// Replace the category markers of a message; empty uncategorizes
    async fn set_category_markers(&self, identity: &str, markers: &[String]) -> SortaResult<()>;

    /// Mark archived and move into the archive folder, verifying the move
    async fn move_to_archive_folder(&self, identity: &str) -> SortaResult<()>;

    /// Clear the archive marker and move back to `target`, verifying the move
    async fn move_from_archive_to_folder(&self, identity: &str, target: &str) -> SortaResult<()>;

    /// Number of messages carrying `marker` (full scan)
    async fn count_matching_marker(&self, marker: &str) -> SortaResult<usize>;

    /// Every category marker in use (full scan)
    async fn discover_category_markers(&self) -> SortaResult<BTreeSet<String>>;

    /// Which of `candidates` still exist in the inbox, archive or sent folder,
    /// mapped to the folder holding each
    async fn existing_identities(&self, candidates: &[String]) -> SortaResult<HashMap<String, String>>;

    /// Add or remove the seen flag
    async fn set_seen(
        &self,
        identity: &str,
        hint: Option<&LocationHint>,
        seen: bool,
    ) -> SortaResult<()>;

    /// Append a raw message to `folder`
    async fn append_message(&self, folder: &str, raw: &[u8], flags: &[String]) -> SortaResult<()>;

    /// Delete a message from `folder`; a missing message is not an error
    async fn delete_message(&self, identity: &str, folder: &str) -> SortaResult<()>;

    /// Release any server session
    async fn close(&self) {}
}

/// Per-call timeouts
#[derive(Debug, Clone, Copy)]
pub struct GatewayTimeouts {
    /// Flag and position commands
    pub command: Duration,
    /// Body fetches, listings and searches
    pub fetch: Duration,
}

impl From<&GatewayConfig> for GatewayTimeouts {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            command: config.command_timeout(),
            fetch: config.fetch_timeout(),
        }
    }
}

impl Default for GatewayTimeouts {
    fn default() -> Self {
        Self::from(&GatewayConfig::default())
    }
}

/// Registry of per-folder locks
#[derive(Default)]
pub struct FolderLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl FolderLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock guarding `folder`, created on first use
    pub fn lock_for(&self, folder: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(folder.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}
