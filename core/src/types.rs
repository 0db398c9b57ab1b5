//! Wire-level types exchanged between the gateway, the cache and callers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::CachedMessage;

/// Envelope-level view of a remote message
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageSummary {
    pub identity: String,             // Message-ID, stable across folders
    pub folder: String,
    pub uid: u32,                     // ephemeral, per folder
    pub subject: String,
    pub sender: String,
    pub date: Option<DateTime<Utc>>,
    pub preview: String,
    pub has_attachments: bool,
    pub is_read: bool,
    pub is_flagged: bool,
    pub markers: Vec<String>,

    // Headers for threading:
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
}

impl MessageSummary {
    pub fn new(identity: impl Into<String>, folder: impl Into<String>, uid: u32) -> Self {
        Self {
            identity: identity.into(),
            folder: folder.into(),
            uid,
            subject: String::new(),
            sender: String::new(),
            date: None,
            preview: String::new(),
            has_attachments: false,
            is_read: false,
            is_flagged: false,
            markers: Vec::new(),
            in_reply_to: None,
            references: Vec::new(),
        }
    }

    pub fn has_marker(&self, marker: &str) -> bool {
        self.markers.iter().any(|m| m.eq_ignore_ascii_case(marker))
    }
}

/// Last known position of a message, used as a fast path before searching
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationHint {
    pub folder: String,
    pub uid: u32,
}

impl LocationHint {
    pub fn new(folder: impl Into<String>, uid: u32) -> Self {
        Self {
            folder: folder.into(),
            uid,
        }
    }
}

/// Attachment metadata kept with a cached body
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentMeta {
    pub filename: String,
    pub mime_type: String,
    pub size: usize,
}

/// Decoded message body
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageBody {
    pub html: Option<String>,
    pub text: Option<String>,
    pub attachments: Vec<AttachmentMeta>,
    /// False when the message could not be located remotely
    pub found: bool,
}

impl MessageBody {
    /// Placeholder returned for a transient miss
    pub fn not_found() -> Self {
        Self {
            html: None,
            text: Some("(message not found on server)".to_string()),
            attachments: Vec::new(),
            found: false,
        }
    }

    /// Short plain-text preview
    pub fn preview(&self, max_chars: usize) -> String {
        let source = self.text.as_deref().unwrap_or_default();
        source
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .chars()
            .take(max_chars)
            .collect()
    }
}

/// Computed conversation: rows sharing a thread key within one scope
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ThreadGroup {
    pub thread_key: String,
    pub subject: String,                // canonical subject
    pub messages: Vec<CachedMessage>,   // sorted oldest→newest
    pub last_date: Option<DateTime<Utc>>,
    pub any_unread: bool,
}

impl ThreadGroup {
    pub fn new(thread_key: String, subject: String, messages: Vec<CachedMessage>) -> Self {
        let any_unread = messages.iter().any(|m| !m.is_read);
        let last_date = messages.iter().filter_map(|m| m.date).max();

        Self {
            thread_key,
            subject,
            messages,
            last_date,
            any_unread,
        }
    }

    /// Get the number of messages in the thread
    pub fn count(&self) -> usize {
        self.messages.len()
    }

    /// Get the newest message in the thread
    pub fn last(&self) -> Option<&CachedMessage> {
        self.messages.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_body_preview_collapses_whitespace() {
        let body = MessageBody {
            text: Some("Hello\n\n  there,   this is\ta test".to_string()),
            found: true,
            ..Default::default()
        };
        assert_eq!(body.preview(14), "Hello there, t");
    }

    #[test]
    fn test_not_found_placeholder() {
        let body = MessageBody::not_found();
        assert!(!body.found);
        assert!(body.text.is_some());
    }

    #[test]
    fn test_summary_marker_lookup() {
        let mut summary = MessageSummary::new("<a@x>", "INBOX", 4);
        summary.markers.push("$Bucketed".to_string());
        assert!(summary.has_marker("$bucketed"));
        assert!(!summary.has_marker("$Archived"));
    }
}
