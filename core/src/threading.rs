//! Conversation threading
//!
//! Thread keys are resolved with four priority levels, first match wins:
//! 1. References chain, nearest ancestor first, using a key already cached
//! 2. In-Reply-To, same lookup
//! 3. Normalized subject shared with a row in the same location scope
//! 4. The message's own identity (singleton thread)

use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

use crate::error::SortaResult;
use crate::message::{CachedMessage, Location};
use crate::storage::{Database, QueryScope};
use crate::types::ThreadGroup;

fn list_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*\[[^\]]+\]\s*").expect("valid list tag pattern"))
}

fn reply_prefix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^((?i:re|fw|fwd|sv|aw|antw|rv)\s*(\[\d+\])?\s*:\s*)+").expect("valid reply prefix pattern")
    })
}

fn message_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<[^<>\s]+>").expect("valid message id pattern"))
}

/// Strip list tags and reply/forward tokens, keeping case
pub fn strip_subject(raw: &str) -> String {
    let mut s = raw.trim().to_string();
    // tags and prefixes can interleave: "[list] Re: [list] Fwd: x"
    loop {
        let before = s.len();
        s = list_tag_re().replace(&s, "").into_owned();
        s = reply_prefix_re().replace(&s, "").into_owned();
        if s.len() == before {
            break;
        }
    }
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Normalize subject for threading
pub fn normalize_subject(raw: &str) -> String {
    strip_subject(raw).to_lowercase()
}

/// Extract message ids from a References or In-Reply-To header value
pub fn parse_message_ids(header: &str) -> Vec<String> {
    let bracketed: Vec<String> = message_id_re()
        .find_iter(header)
        .map(|m| m.as_str().to_string())
        .collect();
    if !bracketed.is_empty() {
        return bracketed;
    }

    header
        .split_whitespace()
        .filter(|token| token.contains('@'))
        .map(|token| format!("<{}>", token.trim_matches(|c| c == '<' || c == '>' || c == ',')))
        .collect()
}

/// Query scope matching a row's current location
pub fn scope_for(message: &CachedMessage, drafts_folder: &str) -> QueryScope {
    match message.location(drafts_folder) {
        Location::Inbox => QueryScope::Inbox,
        Location::Bucket(id) => QueryScope::Bucket(id),
        Location::Archived => QueryScope::Archived,
        Location::Sent => QueryScope::Sent,
        Location::Drafts => QueryScope::Folder(drafts_folder.to_string()),
    }
}

/// Resolve the thread key for a row against the rest of the cache
pub fn resolve_thread_key(
    db: &Database,
    message: &CachedMessage,
    drafts_folder: &str,
) -> SortaResult<String> {
    // 1) references, nearest ancestor first
    let ancestors: Vec<String> = message
        .references
        .iter()
        .rev()
        .filter(|r| **r != message.identity)
        .cloned()
        .collect();
    if let Some(key) = db.thread_key_for_identities(&ancestors)? {
        return Ok(key);
    }

    // 2) in-reply-to
    if let Some(parent) = message.in_reply_to.as_ref().filter(|p| **p != message.identity) {
        if let Some(key) = db.thread_key_for_identities(std::slice::from_ref(parent))? {
            return Ok(key);
        }
    }

    // 3) subject within the same location
    let scope = scope_for(message, drafts_folder);
    if let Some(key) = db.thread_key_for_subject(&message.subject_key, &scope, &message.identity)? {
        return Ok(key);
    }

    // 4) singleton
    Ok(message.identity.clone())
}

/// Group rows into threads by thread key, newest thread first
pub fn group_by_thread_key(rows: Vec<CachedMessage>) -> Vec<ThreadGroup> {
    let mut groups: HashMap<String, Vec<CachedMessage>> = HashMap::new();
    for row in rows {
        let key = row
            .thread_key
            .clone()
            .filter(|k| !k.is_empty())
            .unwrap_or_else(|| row.identity.clone());
        groups.entry(key).or_default().push(row);
    }

    let mut threads: Vec<ThreadGroup> = groups
        .into_iter()
        .map(|(key, mut members)| {
            members.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.identity.cmp(&b.identity)));
            let subject = members
                .first()
                .map(|m| strip_subject(&m.subject))
                .unwrap_or_default();
            ThreadGroup::new(key, subject, members)
        })
        .collect();

    threads.sort_by(|a, b| {
        b.last_date
            .cmp(&a.last_date)
            .then_with(|| a.thread_key.cmp(&b.thread_key))
    });
    threads
}
