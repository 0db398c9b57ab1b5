//! In-process mailbox used by tests and the demo mode of the daemon.
//!
//! Folders hold messages keyed by UID the way a server does: a move assigns a
//! fresh UID in the target folder. Failures can be injected per identity or
//! per folder to exercise the partial-failure paths of the engine.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use super::parse;
use super::MailboxGateway;
use crate::config::FolderConfig;
use crate::error::{SortaError, SortaResult};
use crate::markers;
use crate::types::{AttachmentMeta, LocationHint, MessageBody, MessageSummary};

/// A message as stored by the in-memory server
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteMessage {
    pub identity: String,
    pub subject: String,
    pub sender: String,
    pub date: Option<DateTime<Utc>>,
    pub flags: BTreeSet<String>,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    pub text: String,
    pub html: Option<String>,
    pub attachments: Vec<AttachmentMeta>,
}

impl RemoteMessage {
    pub fn new(identity: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            subject: subject.into(),
            sender: "someone@example.com".to_string(),
            date: Some(Utc::now()),
            flags: BTreeSet::new(),
            in_reply_to: None,
            references: Vec::new(),
            text: String::new(),
            html: None,
            attachments: Vec::new(),
        }
    }

    pub fn from_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = sender.into();
        self
    }

    pub fn dated(mut self, date: DateTime<Utc>) -> Self {
        self.date = Some(date);
        self
    }

    pub fn replying_to(mut self, parent: impl Into<String>) -> Self {
        let parent = parent.into();
        if !self.references.contains(&parent) {
            self.references.push(parent.clone());
        }
        self.in_reply_to = Some(parent);
        self
    }

    pub fn with_references(mut self, references: Vec<String>) -> Self {
        self.references = references;
        self
    }

    pub fn with_flag(mut self, flag: impl Into<String>) -> Self {
        self.flags.insert(flag.into());
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn with_attachment(mut self, filename: impl Into<String>, mime_type: impl Into<String>) -> Self {
        self.attachments.push(AttachmentMeta {
            filename: filename.into(),
            mime_type: mime_type.into(),
            size: 0,
        });
        self
    }

    fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f.eq_ignore_ascii_case(flag))
    }

    fn on_or_after(&self, cutoff: NaiveDate) -> bool {
        self.date.map(|d| d.date_naive() >= cutoff).unwrap_or(true)
    }

    fn summary(&self, folder: &str, uid: u32) -> MessageSummary {
        let mut summary = MessageSummary::new(self.identity.clone(), folder, uid);
        summary.subject = self.subject.clone();
        summary.sender = self.sender.clone();
        summary.date = self.date;
        summary.preview = self.text.split_whitespace().collect::<Vec<_>>().join(" ");
        summary.preview = summary.preview.chars().take(crate::PREVIEW_LENGTH).collect();
        summary.has_attachments = !self.attachments.is_empty();
        summary.is_read = self.has_flag(markers::SEEN);
        summary.is_flagged = self.has_flag(markers::FLAGGED);
        summary.markers = self.flags.iter().cloned().collect();
        summary.in_reply_to = self.in_reply_to.clone();
        summary.references = self.references.clone();
        summary
    }

    fn body(&self) -> MessageBody {
        MessageBody {
            html: self.html.clone(),
            text: Some(self.text.clone()),
            attachments: self.attachments.clone(),
            found: true,
        }
    }
}

#[derive(Debug, Default)]
struct Folder {
    next_uid: u32,
    messages: BTreeMap<u32, RemoteMessage>,
}

impl Folder {
    fn insert(&mut self, message: RemoteMessage) -> u32 {
        self.next_uid += 1;
        self.messages.insert(self.next_uid, message);
        self.next_uid
    }

    fn uid_of(&self, identity: &str) -> Option<u32> {
        self.messages
            .iter()
            .find(|(_, m)| m.identity == identity)
            .map(|(uid, _)| *uid)
    }
}

#[derive(Debug, Default)]
struct ServerState {
    folders: HashMap<String, Folder>,
    failing_identities: HashSet<String>,
    failing_listings: HashSet<String>,
    drop_moves: bool,
    calls: HashMap<&'static str, usize>,
}

impl ServerState {
    fn folder_mut(&mut self, name: &str) -> &mut Folder {
        self.folders.entry(name.to_string()).or_default()
    }

    fn record(&mut self, op: &'static str) {
        *self.calls.entry(op).or_insert(0) += 1;
    }

    fn check_mutation(&self, identity: &str) -> SortaResult<()> {
        if self.failing_identities.contains(identity) {
            return Err(SortaError::network(format!("injected failure for {}", identity)));
        }
        Ok(())
    }

    fn check_listing(&self, folder: &str) -> SortaResult<()> {
        if self.failing_listings.contains(folder) {
            return Err(SortaError::network(format!("injected listing failure for {}", folder)));
        }
        Ok(())
    }

    fn locate(&self, identity: &str, folders: &[&str]) -> Option<(String, u32)> {
        folders.iter().find_map(|name| {
            self.folders
                .get(*name)
                .and_then(|f| f.uid_of(identity))
                .map(|uid| (name.to_string(), uid))
        })
    }

    fn message_mut(&mut self, folder: &str, uid: u32) -> Option<&mut RemoteMessage> {
        self.folders.get_mut(folder).and_then(|f| f.messages.get_mut(&uid))
    }

    /// Move between folders; with `drop_moves` the message vanishes in transit
    fn move_message(&mut self, from: &str, uid: u32, to: &str) {
        let message = self.folders.get_mut(from).and_then(|f| f.messages.remove(&uid));
        if let Some(message) = message {
            if !self.drop_moves {
                self.folder_mut(to).insert(message);
            }
        }
    }
}

/// Mailbox gateway backed by process memory
pub struct InMemoryGateway {
    folders: FolderConfig,
    state: Mutex<ServerState>,
}

impl InMemoryGateway {
    pub fn new(folders: FolderConfig) -> Self {
        let mut state = ServerState::default();
        state.folder_mut(&folders.inbox);
        state.folder_mut(&folders.archive);
        state.folder_mut(&folders.drafts);
        if let Some(sent) = &folders.sent {
            state.folder_mut(sent);
        }

        Self {
            folders,
            state: Mutex::new(state),
        }
    }

    /// Store a message, returning its UID
    pub fn add_message(&self, folder: &str, message: RemoteMessage) -> u32 {
        self.state.lock().folder_mut(folder).insert(message)
    }

    /// Remove a message from whichever folder holds it
    pub fn remove_message(&self, identity: &str) -> bool {
        let mut state = self.state.lock();
        for folder in state.folders.values_mut() {
            if let Some(uid) = folder.uid_of(identity) {
                folder.messages.remove(&uid);
                return true;
            }
        }
        false
    }

    /// Add a flag directly, bypassing the gateway operations
    pub fn add_flag(&self, identity: &str, flag: &str) {
        let mut state = self.state.lock();
        for folder in state.folders.values_mut() {
            for message in folder.messages.values_mut() {
                if message.identity == identity {
                    message.flags.insert(flag.to_string());
                }
            }
        }
    }

    /// Flags of a message, from whichever folder holds it
    pub fn flags_of(&self, identity: &str) -> Option<BTreeSet<String>> {
        let state = self.state.lock();
        state
            .folders
            .values()
            .flat_map(|f| f.messages.values())
            .find(|m| m.identity == identity)
            .map(|m| m.flags.clone())
    }

    /// Folder currently holding a message
    pub fn folder_of(&self, identity: &str) -> Option<String> {
        let state = self.state.lock();
        state
            .folders
            .iter()
            .find(|(_, f)| f.uid_of(identity).is_some())
            .map(|(name, _)| name.clone())
    }

    /// UID of a message inside `folder`
    pub fn uid_of(&self, folder: &str, identity: &str) -> Option<u32> {
        self.state.lock().folders.get(folder).and_then(|f| f.uid_of(identity))
    }

    /// Identities stored in `folder`
    pub fn identities_in(&self, folder: &str) -> Vec<String> {
        self.state
            .lock()
            .folders
            .get(folder)
            .map(|f| f.messages.values().map(|m| m.identity.clone()).collect())
            .unwrap_or_default()
    }

    /// Make every mutation on `identity` fail
    pub fn fail_mutations_for(&self, identity: &str) {
        self.state.lock().failing_identities.insert(identity.to_string());
    }

    /// Make listings of `folder` fail
    pub fn fail_listing(&self, folder: &str) {
        self.state.lock().failing_listings.insert(folder.to_string());
    }

    /// Lose messages during moves, so post-move verification fails
    pub fn drop_moves(&self, enabled: bool) {
        self.state.lock().drop_moves = enabled;
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.failing_identities.clear();
        state.failing_listings.clear();
        state.drop_moves = false;
    }

    /// Number of times a gateway operation was invoked
    pub fn call_count(&self, op: &str) -> usize {
        self.state.lock().calls.get(op).copied().unwrap_or(0)
    }

    fn search_folders(&self, hint: Option<&LocationHint>) -> Vec<String> {
        let mut folders = vec![hint
            .map(|h| h.folder.clone())
            .unwrap_or_else(|| self.folders.inbox.clone())];
        folders.push(self.folders.archive.clone());
        if let Some(sent) = &self.folders.sent {
            folders.push(sent.clone());
        }
        folders.dedup();
        folders
    }

    fn move_verified(&self, identity: &str, from: &str, to: &str, flag: &str, add_flag: bool) -> SortaResult<()> {
        let mut state = self.state.lock();
        state.check_mutation(identity)?;

        if let Some(uid) = state.folders.get(from).and_then(|f| f.uid_of(identity)) {
            if let Some(message) = state.message_mut(from, uid) {
                if add_flag {
                    message.flags.insert(flag.to_string());
                } else {
                    message.flags.retain(|f| !f.eq_ignore_ascii_case(flag));
                }
            }
            state.move_message(from, uid, to);
        }

        let arrived = state.folders.get(to).and_then(|f| f.uid_of(identity)).is_some();
        if !arrived {
            return Err(SortaError::verification(format!(
                "{} missing from {} after move",
                identity, to
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl MailboxGateway for InMemoryGateway {
    fn folders(&self) -> &FolderConfig {
        &self.folders
    }

    async fn list_inbox_summaries(
        &self,
        cutoff: NaiveDate,
        include_flagged: bool,
    ) -> SortaResult<Vec<MessageSummary>> {
        let mut state = self.state.lock();
        state.record("list_inbox_summaries");
        state.check_listing(&self.folders.inbox)?;

        let Some(inbox) = state.folders.get(&self.folders.inbox) else {
            return Ok(Vec::new());
        };
        Ok(inbox
            .messages
            .iter()
            .filter(|(_, m)| !m.flags.iter().any(|f| markers::hides_from_inbox(f)))
            .filter(|(_, m)| m.on_or_after(cutoff) || (include_flagged && m.has_flag(markers::FLAGGED)))
            .map(|(uid, m)| m.summary(&self.folders.inbox, *uid))
            .collect())
    }

    async fn list_folder_summaries(
        &self,
        folder: &str,
        cutoff: NaiveDate,
    ) -> SortaResult<Vec<MessageSummary>> {
        let mut state = self.state.lock();
        state.record("list_folder_summaries");
        state.check_listing(folder)?;

        let Some(stored) = state.folders.get(folder) else {
            return Err(SortaError::not_found(format!("No folder {}", folder)));
        };
        Ok(stored
            .messages
            .iter()
            .filter(|(_, m)| m.on_or_after(cutoff))
            .map(|(uid, m)| m.summary(folder, *uid))
            .collect())
    }

    async fn list_marker_summaries(&self, marker: &str) -> SortaResult<Vec<MessageSummary>> {
        if !markers::is_valid_keyword(marker) {
            return Err(SortaError::validation(format!("Invalid marker: {}", marker)));
        }
        let mut state = self.state.lock();
        state.record("list_marker_summaries");
        state.check_listing(&self.folders.inbox)?;

        let Some(inbox) = state.folders.get(&self.folders.inbox) else {
            return Ok(Vec::new());
        };
        Ok(inbox
            .messages
            .iter()
            .filter(|(_, m)| m.has_flag(marker) && !m.has_flag(markers::ARCHIVED))
            .map(|(uid, m)| m.summary(&self.folders.inbox, *uid))
            .collect())
    }

    async fn fetch_body(
        &self,
        identity: &str,
        hint: Option<&LocationHint>,
    ) -> SortaResult<MessageBody> {
        let mut state = self.state.lock();
        state.record("fetch_body");

        if let Some(hint) = hint {
            let hinted = state
                .folders
                .get(&hint.folder)
                .and_then(|f| f.messages.get(&hint.uid))
                .filter(|m| m.identity == identity);
            if let Some(message) = hinted {
                return Ok(message.body());
            }
        }

        let folders = self.search_folders(hint);
        let names: Vec<&str> = folders.iter().map(String::as_str).collect();
        Ok(match state.locate(identity, &names) {
            Some((folder, uid)) => state
                .folders
                .get(&folder)
                .and_then(|f| f.messages.get(&uid))
                .map(RemoteMessage::body)
                .unwrap_or_else(MessageBody::not_found),
            None => MessageBody::not_found(),
        })
    }

    async fn set_category_markers(&self, identity: &str, requested: &[String]) -> SortaResult<()> {
        if let Some(bad) = requested.iter().find(|m| !markers::is_category_marker(m)) {
            return Err(SortaError::validation(format!("Not a category marker: {}", bad)));
        }

        let mut state = self.state.lock();
        state.record("set_category_markers");
        state.check_mutation(identity)?;

        let (folder, uid) = state
            .locate(identity, &[self.folders.inbox.as_str(), self.folders.archive.as_str()])
            .ok_or_else(|| SortaError::not_found(format!("{} not found remotely", identity)))?;

        if let Some(message) = state.message_mut(&folder, uid) {
            let existing = markers::category_markers_in(message.flags.iter());
            message.flags.retain(|f| !existing.contains(f));
            message.flags.extend(requested.iter().cloned());
            if !requested.is_empty() {
                message.flags.insert(markers::CATEGORIZED.to_string());
            }
        }
        Ok(())
    }

    async fn move_to_archive_folder(&self, identity: &str) -> SortaResult<()> {
        self.state.lock().record("move_to_archive_folder");
        self.move_verified(identity, &self.folders.inbox, &self.folders.archive, markers::ARCHIVED, true)
    }

    async fn move_from_archive_to_folder(&self, identity: &str, target: &str) -> SortaResult<()> {
        self.state.lock().record("move_from_archive_to_folder");
        self.move_verified(identity, &self.folders.archive, target, markers::ARCHIVED, false)
    }

    async fn count_matching_marker(&self, marker: &str) -> SortaResult<usize> {
        let mut state = self.state.lock();
        state.record("count_matching_marker");
        state.check_listing(&self.folders.inbox)?;

        Ok(state
            .folders
            .get(&self.folders.inbox)
            .map(|f| {
                f.messages
                    .values()
                    .filter(|m| m.has_flag(marker) && !m.has_flag(markers::ARCHIVED))
                    .count()
            })
            .unwrap_or(0))
    }

    async fn discover_category_markers(&self) -> SortaResult<BTreeSet<String>> {
        let mut state = self.state.lock();
        state.record("discover_category_markers");

        let mut found = BTreeSet::new();
        for name in [&self.folders.inbox, &self.folders.archive] {
            state.check_listing(name)?;
            if let Some(folder) = state.folders.get(name.as_str()) {
                found.extend(
                    folder
                        .messages
                        .values()
                        .filter(|m| m.has_flag(markers::CATEGORIZED))
                        .flat_map(|m| m.flags.iter())
                        .filter(|f| markers::is_category_marker(f))
                        .cloned(),
                );
            }
        }
        Ok(found)
    }

    async fn existing_identities(&self, candidates: &[String]) -> SortaResult<HashMap<String, String>> {
        let mut state = self.state.lock();
        state.record("existing_identities");

        let mut folders = vec![self.folders.inbox.as_str(), self.folders.archive.as_str()];
        if let Some(sent) = &self.folders.sent {
            folders.push(sent.as_str());
        }
        for folder in &folders {
            state.check_listing(folder)?;
        }

        Ok(candidates
            .iter()
            .filter_map(|id| state.locate(id, &folders).map(|(folder, _)| (id.clone(), folder)))
            .collect())
    }

    async fn set_seen(
        &self,
        identity: &str,
        hint: Option<&LocationHint>,
        seen: bool,
    ) -> SortaResult<()> {
        let mut state = self.state.lock();
        state.record("set_seen");
        state.check_mutation(identity)?;

        let mut folders = vec![hint
            .map(|h| h.folder.clone())
            .unwrap_or_else(|| self.folders.inbox.clone())];
        folders.push(self.folders.archive.clone());
        let names: Vec<&str> = folders.iter().map(String::as_str).collect();

        let (folder, uid) = state
            .locate(identity, &names)
            .ok_or_else(|| SortaError::not_found(format!("{} not found remotely", identity)))?;
        if let Some(message) = state.message_mut(&folder, uid) {
            if seen {
                message.flags.insert(markers::SEEN.to_string());
            } else {
                message.flags.remove(markers::SEEN);
            }
        }
        Ok(())
    }

    async fn append_message(&self, folder: &str, raw: &[u8], flags: &[String]) -> SortaResult<()> {
        let summary = parse::parse_summary(folder, 0, raw, b"", flags.to_vec(), None)?;
        let body = parse::parse_body(raw)?;

        let message = RemoteMessage {
            identity: summary.identity,
            subject: summary.subject,
            sender: summary.sender,
            date: summary.date.or_else(|| Some(Utc::now())),
            flags: flags.iter().cloned().collect(),
            in_reply_to: summary.in_reply_to,
            references: summary.references,
            text: body.text.unwrap_or_default(),
            html: body.html,
            attachments: body.attachments,
        };

        let mut state = self.state.lock();
        state.record("append_message");
        state.check_mutation(&message.identity)?;
        state.folder_mut(folder).insert(message);
        Ok(())
    }

    async fn delete_message(&self, identity: &str, folder: &str) -> SortaResult<()> {
        let mut state = self.state.lock();
        state.record("delete_message");
        state.check_mutation(identity)?;

        if let Some(stored) = state.folders.get_mut(folder) {
            if let Some(uid) = stored.uid_of(identity) {
                stored.messages.remove(&uid);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn gateway() -> InMemoryGateway {
        let folders = FolderConfig {
            sent: Some("Sent".to_string()),
            ..FolderConfig::default()
        };
        InMemoryGateway::new(folders)
    }

    fn cutoff() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
    }

    fn march(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, 9, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_inbox_listing_hides_sorted_messages() {
        let gw = gateway();
        gw.add_message("INBOX", RemoteMessage::new("<a@x>", "Plain").dated(march(1)));
        gw.add_message(
            "INBOX",
            RemoteMessage::new("<b@x>", "Sorted")
                .dated(march(2))
                .with_flag("$Bucket_work")
                .with_flag(markers::CATEGORIZED),
        );
        gw.add_message(
            "INBOX",
            RemoteMessage::new("<c@x>", "Old starred")
                .dated(Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap())
                .with_flag(markers::FLAGGED),
        );

        let listed = gw.list_inbox_summaries(cutoff(), false).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].identity, "<a@x>");

        let listed = gw.list_inbox_summaries(cutoff(), true).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().any(|s| s.identity == "<c@x>" && s.is_flagged));
    }

    #[tokio::test]
    async fn test_set_category_markers_is_idempotent() {
        let gw = gateway();
        gw.add_message("INBOX", RemoteMessage::new("<a@x>", "Hi").with_flag("$Bucket_old"));

        let marker = vec!["$Bucket_work".to_string()];
        gw.set_category_markers("<a@x>", &marker).await.unwrap();
        let first = gw.flags_of("<a@x>").unwrap();
        gw.set_category_markers("<a@x>", &marker).await.unwrap();
        let second = gw.flags_of("<a@x>").unwrap();

        assert_eq!(first, second);
        assert!(second.contains("$Bucket_work"));
        assert!(second.contains(markers::CATEGORIZED));
        assert!(!second.contains("$Bucket_old"));

        gw.set_category_markers("<a@x>", &[]).await.unwrap();
        let cleared = gw.flags_of("<a@x>").unwrap();
        assert!(cleared.iter().all(|f| !f.starts_with("$Bucket")));
    }

    #[tokio::test]
    async fn test_archive_round_trip_and_verification() {
        let gw = gateway();
        gw.add_message("INBOX", RemoteMessage::new("<a@x>", "Hi"));

        gw.move_to_archive_folder("<a@x>").await.unwrap();
        assert_eq!(gw.folder_of("<a@x>").as_deref(), Some("Archive"));
        assert!(gw.flags_of("<a@x>").unwrap().contains(markers::ARCHIVED));

        // already archived is not an error
        gw.move_to_archive_folder("<a@x>").await.unwrap();

        gw.move_from_archive_to_folder("<a@x>", "INBOX").await.unwrap();
        assert_eq!(gw.folder_of("<a@x>").as_deref(), Some("INBOX"));
        assert!(!gw.flags_of("<a@x>").unwrap().contains(markers::ARCHIVED));

        gw.drop_moves(true);
        let err = gw.move_to_archive_folder("<a@x>").await.unwrap_err();
        assert!(err.is_verification_failure());
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let gw = gateway();
        gw.add_message("INBOX", RemoteMessage::new("<a@x>", "Hi"));
        gw.fail_mutations_for("<a@x>");

        assert!(gw.move_to_archive_folder("<a@x>").await.is_err());
        assert_eq!(gw.folder_of("<a@x>").as_deref(), Some("INBOX"));

        gw.fail_listing("INBOX");
        assert!(gw.list_inbox_summaries(cutoff(), false).await.is_err());

        gw.clear_failures();
        assert!(gw.move_to_archive_folder("<a@x>").await.is_ok());
    }

    #[tokio::test]
    async fn test_fetch_body_with_stale_hint() {
        let gw = gateway();
        let uid = gw.add_message("INBOX", RemoteMessage::new("<a@x>", "Hi").with_text("Body text"));
        gw.move_to_archive_folder("<a@x>").await.unwrap();

        let stale = LocationHint::new("INBOX", uid);
        let body = gw.fetch_body("<a@x>", Some(&stale)).await.unwrap();
        assert!(body.found);
        assert_eq!(body.text.as_deref(), Some("Body text"));

        let missing = gw.fetch_body("<nope@x>", None).await.unwrap();
        assert!(!missing.found);
    }

    #[tokio::test]
    async fn test_existing_identities_and_discovery() {
        let gw = gateway();
        gw.add_message("INBOX", RemoteMessage::new("<a@x>", "A").with_flag("$Bucket_work").with_flag(markers::CATEGORIZED));
        gw.add_message("Sent", RemoteMessage::new("<s@x>", "S"));
        gw.add_message("Archive", RemoteMessage::new("<r@x>", "R").with_flag("$Bucket_home").with_flag(markers::CATEGORIZED));

        let candidates = vec!["<a@x>".to_string(), "<s@x>".to_string(), "<gone@x>".to_string()];
        let found = gw.existing_identities(&candidates).await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found.get("<s@x>").map(String::as_str), Some("Sent"));
        assert!(!found.contains_key("<gone@x>"));

        let discovered = gw.discover_category_markers().await.unwrap();
        assert_eq!(
            discovered.into_iter().collect::<Vec<_>>(),
            vec!["$Bucket_home".to_string(), "$Bucket_work".to_string()]
        );
        assert_eq!(gw.count_matching_marker("$Bucket_work").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_append_and_delete() {
        let gw = gateway();
        let raw = b"Message-ID: <d@x>\r\nFrom: me@x\r\nSubject: Draft\r\n\r\nHello\r\n";
        gw.append_message("Drafts", raw, &[markers::DRAFT.to_string()]).await.unwrap();
        assert_eq!(gw.folder_of("<d@x>").as_deref(), Some("Drafts"));

        gw.delete_message("<d@x>", "Drafts").await.unwrap();
        assert!(gw.folder_of("<d@x>").is_none());
        // deleting again is fine
        gw.delete_message("<d@x>", "Drafts").await.unwrap();
    }
}
