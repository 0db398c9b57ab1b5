//! Cached message rows and the write payloads that feed them

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{SortaError, SortaResult};
use crate::threading::normalize_subject;
use crate::types::{AttachmentMeta, MessageSummary};

/// Which synchronization source last authoritatively wrote a row
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Inbox pull
    Inbox,
    /// Sent folder pull
    Sent,
    /// Recorded by the local send path
    ManualSend,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provenance::Inbox => "inbox",
            Provenance::Sent => "sent",
            Provenance::ManualSend => "manual_send",
        }
    }

    /// Authority rank; a row only ever moves to a higher rank
    pub fn rank(&self) -> u8 {
        match self {
            Provenance::Inbox => 1,
            Provenance::Sent => 2,
            Provenance::ManualSend => 3,
        }
    }

    /// Check if the row is an outgoing message
    pub fn is_outgoing(&self) -> bool {
        !matches!(self, Provenance::Inbox)
    }
}

impl std::fmt::Display for Provenance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Provenance {
    type Err = SortaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inbox" => Ok(Provenance::Inbox),
            "sent" => Ok(Provenance::Sent),
            "manual_send" => Ok(Provenance::ManualSend),
            other => Err(SortaError::validation(format!("Unknown provenance: {}", other))),
        }
    }
}

/// Where a message appears to the user
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "bucket")]
pub enum Location {
    Inbox,
    Bucket(String),
    Archived,
    Sent,
    Drafts,
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Location::Inbox => write!(f, "Inbox"),
            Location::Bucket(id) => write!(f, "Bucket({})", id),
            Location::Archived => write!(f, "Archived"),
            Location::Sent => write!(f, "Sent"),
            Location::Drafts => write!(f, "Drafts"),
        }
    }
}

/// A row of the local message cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedMessage {
    /// Message-ID header
    pub identity: String,
    /// Remote folder of record
    pub folder: Option<String>,
    /// UID inside `folder`
    pub uid: Option<u32>,
    pub subject: String,
    pub sender: String,
    pub date: Option<DateTime<Utc>>,
    pub preview: String,
    pub has_attachments: bool,
    pub is_read: bool,
    pub is_flagged: bool,
    /// Normalized subject
    pub subject_key: String,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    /// Conversation grouping key
    pub thread_key: Option<String>,
    /// Assigned bucket
    pub bucket_id: Option<String>,
    /// Set while the message lives in the archive folder
    pub archived_at: Option<DateTime<Utc>>,
    pub provenance: Provenance,

    // Local annotations, never sent to the server
    pub note: Option<String>,
    pub due_date: Option<NaiveDate>,

    // Lazily cached content
    pub body_html: Option<String>,
    pub body_text: Option<String>,
    pub attachments: Vec<AttachmentMeta>,

    /// Last sync pass that observed this row
    pub last_seen_at: Option<DateTime<Utc>>,
}

impl CachedMessage {
    /// Derive the user-facing location of this row
    pub fn location(&self, drafts_folder: &str) -> Location {
        if self.archived_at.is_some() {
            return Location::Archived;
        }
        if self.provenance.is_outgoing() {
            return Location::Sent;
        }
        if self.folder.as_deref() == Some(drafts_folder) {
            return Location::Drafts;
        }
        match &self.bucket_id {
            Some(id) => Location::Bucket(id.clone()),
            None => Location::Inbox,
        }
    }

    /// Check if the row is archived
    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }

    /// Check if the body has been cached
    pub fn has_body(&self) -> bool {
        self.body_html.is_some() || self.body_text.is_some()
    }

    /// Location hint for remote lookups, when the position is known
    pub fn hint(&self) -> Option<crate::types::LocationHint> {
        match (&self.folder, self.uid) {
            (Some(folder), Some(uid)) => Some(crate::types::LocationHint::new(folder.clone(), uid)),
            _ => None,
        }
    }
}

/// How an upsert treats an existing row with the same identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Background inbox pull: position and last-seen change, and a row listed
    /// in the inbox is no longer archived
    InboxPull,
    /// Sent folder pull: never touches inbox-provenance rows
    SentPull,
    /// User bucket assignment: sets bucket, clears archive, keeps known fields
    BucketAssignment,
    /// Local send path: records the copy with the highest authority
    ManualSend,
}

impl ConflictPolicy {
    /// Provenance written for a fresh row
    pub fn provenance(&self) -> Provenance {
        match self {
            ConflictPolicy::InboxPull | ConflictPolicy::BucketAssignment => Provenance::Inbox,
            ConflictPolicy::SentPull => Provenance::Sent,
            ConflictPolicy::ManualSend => Provenance::ManualSend,
        }
    }
}

/// Write payload for `Database::upsert_message`
#[derive(Debug, Clone, Default)]
pub struct MessageUpsert {
    pub identity: String,
    pub folder: Option<String>,
    pub uid: Option<u32>,
    pub subject: String,
    pub sender: String,
    pub date: Option<DateTime<Utc>>,
    pub preview: String,
    pub has_attachments: bool,
    pub is_read: bool,
    pub is_flagged: bool,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    pub thread_key: Option<String>,
    pub bucket_id: Option<String>,
}

impl MessageUpsert {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            ..Default::default()
        }
    }

    /// Build a payload from a remote summary
    pub fn from_summary(summary: &MessageSummary) -> Self {
        Self {
            identity: summary.identity.clone(),
            folder: Some(summary.folder.clone()),
            uid: Some(summary.uid),
            subject: summary.subject.clone(),
            sender: summary.sender.clone(),
            date: summary.date,
            preview: summary.preview.clone(),
            has_attachments: summary.has_attachments,
            is_read: summary.is_read,
            is_flagged: summary.is_flagged,
            in_reply_to: summary.in_reply_to.clone(),
            references: summary.references.clone(),
            thread_key: None,
            bucket_id: None,
        }
    }

    pub fn with_bucket(mut self, bucket_id: impl Into<String>) -> Self {
        self.bucket_id = Some(bucket_id.into());
        self
    }

    pub fn with_thread_key(mut self, thread_key: impl Into<String>) -> Self {
        self.thread_key = Some(thread_key.into());
        self
    }

    /// Normalized subject for this payload
    pub fn subject_key(&self) -> String {
        normalize_subject(&self.subject)
    }

    /// Validate the payload
    pub fn validate(&self) -> SortaResult<()> {
        if self.identity.trim().is_empty() {
            return Err(SortaError::validation("Message identity cannot be empty"));
        }
        Ok(())
    }
}

/// A single field change inside a `LocationUpdate`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change<T> {
    Keep,
    Set(T),
    Clear,
}

impl<T> Default for Change<T> {
    fn default() -> Self {
        Change::Keep
    }
}

/// Local location change applied to every member of a thread at once
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocationUpdate {
    pub bucket_id: Change<String>,
    pub archived_at: Change<DateTime<Utc>>,
    /// New folder of record; the UID is cleared whenever the folder changes
    pub folder: Option<String>,
}

impl LocationUpdate {
    /// File into a bucket, leaving archive state untouched
    pub fn bucket(bucket_id: impl Into<String>) -> Self {
        Self {
            bucket_id: Change::Set(bucket_id.into()),
            ..Default::default()
        }
    }

    /// Drop the bucket assignment
    pub fn unbucket() -> Self {
        Self {
            bucket_id: Change::Clear,
            ..Default::default()
        }
    }

    /// Archive; the bucket id is kept so unarchive can restore it
    pub fn archive(archive_folder: impl Into<String>) -> Self {
        Self {
            archived_at: Change::Set(Utc::now()),
            folder: Some(archive_folder.into()),
            ..Default::default()
        }
    }

    /// Unarchive into `folder`, optionally into a new bucket
    pub fn unarchive(folder: impl Into<String>, bucket_id: Option<String>) -> Self {
        Self {
            bucket_id: match bucket_id {
                Some(id) => Change::Set(id),
                None => Change::Keep,
            },
            archived_at: Change::Clear,
            folder: Some(folder.into()),
        }
    }

    /// Back to the plain inbox: no bucket, not archived
    pub fn to_inbox(inbox_folder: impl Into<String>) -> Self {
        Self {
            bucket_id: Change::Clear,
            archived_at: Change::Clear,
            folder: Some(inbox_folder.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> CachedMessage {
        CachedMessage {
            identity: "<m1@example.com>".to_string(),
            folder: Some("INBOX".to_string()),
            uid: Some(7),
            subject: "Hello".to_string(),
            sender: "alice@example.com".to_string(),
            date: None,
            preview: String::new(),
            has_attachments: false,
            is_read: false,
            is_flagged: false,
            subject_key: "hello".to_string(),
            in_reply_to: None,
            references: vec![],
            thread_key: None,
            bucket_id: None,
            archived_at: None,
            provenance: Provenance::Inbox,
            note: None,
            due_date: None,
            body_html: None,
            body_text: None,
            attachments: vec![],
            last_seen_at: None,
        }
    }

    #[test]
    fn test_location_derivation_order() {
        let mut msg = row();
        assert_eq!(msg.location("Drafts"), Location::Inbox);

        msg.bucket_id = Some("finance".to_string());
        assert_eq!(msg.location("Drafts"), Location::Bucket("finance".to_string()));

        msg.folder = Some("Drafts".to_string());
        assert_eq!(msg.location("Drafts"), Location::Drafts);

        msg.provenance = Provenance::Sent;
        assert_eq!(msg.location("Drafts"), Location::Sent);

        msg.archived_at = Some(Utc::now());
        assert_eq!(msg.location("Drafts"), Location::Archived);
    }

    #[test]
    fn test_provenance_rank() {
        assert!(Provenance::Inbox.rank() < Provenance::Sent.rank());
        assert!(Provenance::Sent.rank() < Provenance::ManualSend.rank());
        assert_eq!("manual_send".parse::<Provenance>().unwrap(), Provenance::ManualSend);
        assert!("outbox".parse::<Provenance>().is_err());
    }

    #[test]
    fn test_upsert_from_summary() {
        let mut summary = MessageSummary::new("<m2@example.com>", "INBOX", 12);
        summary.subject = "Re: Budget Review".to_string();
        summary.sender = "bob@example.com".to_string();

        let upsert = MessageUpsert::from_summary(&summary).with_bucket("finance");
        assert_eq!(upsert.uid, Some(12));
        assert_eq!(upsert.subject_key(), "budget review");
        assert_eq!(upsert.bucket_id.as_deref(), Some("finance"));
        assert!(upsert.validate().is_ok());
        assert!(MessageUpsert::new(" ").validate().is_err());
    }

    #[test]
    fn test_location_updates() {
        let update = LocationUpdate::unarchive("INBOX", None);
        assert_eq!(update.bucket_id, Change::Keep);
        assert_eq!(update.archived_at, Change::Clear);

        let update = LocationUpdate::archive("Archive");
        assert_eq!(update.bucket_id, Change::Keep);
        assert!(matches!(update.archived_at, Change::Set(_)));
    }
}
