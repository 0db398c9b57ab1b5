//! IMAP implementation of the mailbox gateway

use async_imap::types::Fetch;
use async_imap::Session;
use async_native_tls::TlsStream;
use async_trait::async_trait;
use chrono::NaiveDate;
use futures::future::BoxFuture;
use futures::{FutureExt, Stream, StreamExt};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
use tracing::{debug, info, warn};

use super::parse;
use super::{FolderLocks, GatewayTimeouts, MailboxGateway};
use crate::config::{AccountConfig, Config, FolderConfig};
use crate::error::{SortaError, SortaResult};
use crate::markers;
use crate::types::{LocationHint, MessageBody, MessageSummary};

pub type ImapSession = Session<TlsStream<Compat<TcpStream>>>;

/// UIDs per FETCH command
const FETCH_CHUNK: usize = 100;

const SUMMARY_QUERY: &str = "(UID FLAGS INTERNALDATE BODY.PEEK[HEADER] BODY.PEEK[TEXT]<0.512>)";

/// Lifecycle of the shared session
pub enum SessionState {
    Disconnected,
    Connected(Box<Connection>),
}

impl SessionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Connected(_))
    }
}

#[derive(Debug, Clone, Copy)]
enum CallKind {
    Command,
    Fetch,
}

/// Whether a call may be issued again after the session failed under it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Retry {
    Once,
    /// The server may have applied the command before the session failed
    Never,
}

/// Somewhere a call can get a live connection from
#[async_trait]
trait SessionSlot: Send {
    type Conn: Send;

    /// The current connection, opening one if needed
    async fn acquire(&mut self) -> SortaResult<&mut Self::Conn>;

    /// Forget the current connection
    fn teardown(&mut self);
}

/// Attempt `op` on the slot's connection. Session-level failures tear the
/// connection down; with `Retry::Once` the call is issued once more.
async fn call_with_retry<S, T, F>(slot: &mut S, limit: Duration, name: &str, retry: Retry, op: &F) -> SortaResult<T>
where
    S: SessionSlot,
    T: Send,
    F: for<'c> Fn(&'c mut S::Conn) -> BoxFuture<'c, SortaResult<T>> + Sync,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = match slot.acquire().await {
            Ok(conn) => match tokio::time::timeout(limit, op(conn)).await {
                Ok(result) => result,
                Err(_) => Err(SortaError::timeout(format!("{} after {:?}", name, limit))),
            },
            Err(e) => Err(e),
        };

        match result {
            Err(e) if e.is_session_lost() => {
                slot.teardown();
                if attempt >= 2 || retry == Retry::Never {
                    return Err(e);
                }
                warn!("{} failed ({}), reconnecting", name, e);
            }
            other => return other,
        }
    }
}

/// A logged-in session and the folder it has selected
pub struct Connection {
    session: ImapSession,
    selected: Option<String>,
}

impl Connection {
    async fn select(&mut self, folder: &str) -> SortaResult<()> {
        if self.selected.as_deref() != Some(folder) {
            self.selected = None;
            self.session.select(folder).await?;
            self.selected = Some(folder.to_string());
        }
        Ok(())
    }

    async fn search(&mut self, criteria: &str) -> SortaResult<Vec<u32>> {
        let found = self.session.uid_search(criteria).await?;
        let mut uids: Vec<u32> = found.into_iter().collect();
        uids.sort_unstable();
        Ok(uids)
    }

    async fn find_uid(&mut self, identity: &str) -> SortaResult<Option<u32>> {
        let uids = self.search(&parse::identity_criterion(identity)).await?;
        Ok(uids.last().copied())
    }

    async fn fetch(&mut self, uids: &str, query: &str) -> SortaResult<Vec<Fetch>> {
        let stream = self.session.uid_fetch(uids, query).await?;
        collect_fetches(stream).await
    }

    async fn fetch_summaries(&mut self, folder: &str, uids: &[u32]) -> SortaResult<Vec<MessageSummary>> {
        let mut summaries = Vec::with_capacity(uids.len());
        for chunk in uids.chunks(FETCH_CHUNK) {
            for fetch in self.fetch(&parse::uid_set(chunk), SUMMARY_QUERY).await? {
                match parse::summary_from_fetch(folder, &fetch) {
                    Ok(summary) => summaries.push(summary),
                    Err(e) => warn!("Skipping malformed message in {}: {}", folder, e),
                }
            }
        }
        Ok(summaries)
    }

    async fn flags_of(&mut self, uid: u32) -> SortaResult<Vec<String>> {
        let fetches = self.fetch(&uid.to_string(), "(UID FLAGS)").await?;
        Ok(fetches
            .iter()
            .find(|f| f.uid == Some(uid))
            .map(parse::fetch_flags)
            .unwrap_or_default())
    }

    async fn store(&mut self, uid: u32, command: String) -> SortaResult<()> {
        let stream = self.session.uid_store(uid.to_string(), command).await?;
        collect_fetches(stream).await?;
        Ok(())
    }

    async fn move_uid(&mut self, uid: u32, target: &str) -> SortaResult<()> {
        match self.session.uid_mv(uid.to_string(), target).await {
            Ok(()) => Ok(()),
            Err(async_imap::error::Error::No(_)) | Err(async_imap::error::Error::Bad(_)) => {
                // server without MOVE
                self.session.uid_copy(uid.to_string(), target).await?;
                self.store(uid, "+FLAGS (\\Deleted)".to_string()).await?;
                self.expunge().await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn expunge(&mut self) -> SortaResult<()> {
        let stream = self.session.expunge().await?;
        futures::pin_mut!(stream);
        while let Some(result) = stream.next().await {
            result?;
        }
        Ok(())
    }

    async fn fetch_raw(&mut self, uid: u32) -> SortaResult<Option<Vec<u8>>> {
        let fetches = self.fetch(&uid.to_string(), "(UID BODY.PEEK[])").await?;
        Ok(fetches
            .iter()
            .find(|f| f.uid == Some(uid))
            .and_then(|f| f.body())
            .map(|b| b.to_vec()))
    }
}

/// Pin a mutation closure to the signature `mutate_in` expects
fn mutation<F>(f: F) -> F
where
    F: for<'c> Fn(&'c mut Connection, u32) -> BoxFuture<'c, SortaResult<()>>
        + Clone
        + Send
        + Sync
        + 'static,
{
    f
}

/// Drain a response stream; transport errors abort, anything else is skipped
async fn collect_fetches<E>(stream: impl Stream<Item = Result<Fetch, E>>) -> SortaResult<Vec<Fetch>>
where
    SortaError: From<E>,
{
    futures::pin_mut!(stream);
    let mut items = Vec::new();
    while let Some(result) = stream.next().await {
        match result {
            Ok(fetch) => items.push(fetch),
            Err(e) => {
                let err = SortaError::from(e);
                if err.is_session_lost() {
                    return Err(err);
                }
                warn!("Skipping unparseable IMAP response: {}", err);
            }
        }
    }
    Ok(items)
}

/// The gateway's session, borrowed for one call
struct SharedSession<'a> {
    gateway: &'a ImapGateway,
    state: &'a mut SessionState,
}

#[async_trait]
impl<'a> SessionSlot for SharedSession<'a> {
    type Conn = Connection;

    async fn acquire(&mut self) -> SortaResult<&mut Connection> {
        self.gateway.connection(self.state).await
    }

    fn teardown(&mut self) {
        *self.state = SessionState::Disconnected;
    }
}

/// Gateway over a single shared IMAP session
pub struct ImapGateway {
    account: AccountConfig,
    folders: FolderConfig,
    timeouts: GatewayTimeouts,
    search_batch: usize,
    state: Mutex<SessionState>,
    locks: FolderLocks,
}

impl ImapGateway {
    /// Create a gateway; the session is opened lazily
    pub fn new(config: &Config) -> SortaResult<Self> {
        config.validate_account()?;

        Ok(Self {
            account: config.account.clone(),
            folders: config.folders.clone(),
            timeouts: GatewayTimeouts::from(&config.gateway),
            search_batch: config.gateway.search_batch.max(1),
            state: Mutex::new(SessionState::Disconnected),
            locks: FolderLocks::new(),
        })
    }

    /// Check if a session is currently open
    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.is_connected()
    }

    /// Drop the current session and open a new one
    pub async fn reconnect(&self) -> SortaResult<()> {
        let mut state = self.state.lock().await;
        *state = SessionState::Disconnected;
        let connection = self.open_session().await?;
        *state = SessionState::Connected(Box::new(connection));
        Ok(())
    }

    /// Log out and drop the session
    pub async fn disconnect(&self) {
        let mut state = self.state.lock().await;
        if let SessionState::Connected(mut connection) =
            std::mem::replace(&mut *state, SessionState::Disconnected)
        {
            if let Err(e) = connection.session.logout().await {
                debug!("Logout failed: {}", e);
            }
            info!("Disconnected from {}", self.account.host);
        }
    }

    async fn open_session(&self) -> SortaResult<Connection> {
        let host = self.account.host.as_str();
        let password = self
            .account
            .password
            .as_deref()
            .ok_or_else(|| SortaError::config("IMAP password missing"))?;

        let connect = async {
            let tcp = TcpStream::connect((host, self.account.port))
                .await
                .map_err(|e| SortaError::network(format!("TCP connection failed: {}", e)))?;

            let tls = async_native_tls::TlsConnector::new();
            let tls_stream = tls
                .connect(host, tcp.compat())
                .await
                .map_err(|e| SortaError::network(format!("TLS handshake failed: {}", e)))?;

            let client = async_imap::Client::new(tls_stream);
            client
                .login(&self.account.username, password)
                .await
                .map_err(|(e, _)| SortaError::auth(format!("Login failed: {}", e)))
        };

        let session = tokio::time::timeout(self.timeouts.fetch, connect)
            .await
            .map_err(|_| SortaError::timeout(format!("connecting to {}", host)))??;

        info!("Connected to IMAP server {}", host);
        Ok(Connection {
            session,
            selected: None,
        })
    }

    async fn connection<'s>(&self, state: &'s mut SessionState) -> SortaResult<&'s mut Connection> {
        if !state.is_connected() {
            let connection = self.open_session().await?;
            *state = SessionState::Connected(Box::new(connection));
        }
        match state {
            SessionState::Connected(connection) => Ok(connection.as_mut()),
            SessionState::Disconnected => Err(SortaError::session_lost("no session")),
        }
    }

    /// Run `op` under the folder lock and the session lock.
    ///
    /// A lost session or a timeout tears the session down and the call is
    /// retried exactly once on a fresh session.
    async fn run<T, F>(&self, folder: &str, kind: CallKind, name: &str, op: F) -> SortaResult<T>
    where
        T: Send,
        F: for<'c> Fn(&'c mut Connection) -> BoxFuture<'c, SortaResult<T>> + Send + Sync,
    {
        self.run_with(folder, kind, name, Retry::Once, op).await
    }

    async fn run_with<T, F>(&self, folder: &str, kind: CallKind, name: &str, retry: Retry, op: F) -> SortaResult<T>
    where
        T: Send,
        F: for<'c> Fn(&'c mut Connection) -> BoxFuture<'c, SortaResult<T>> + Send + Sync,
    {
        let folder_lock = self.locks.lock_for(folder);
        let _folder_guard = folder_lock.lock().await;
        let mut state = self.state.lock().await;

        let limit = match kind {
            CallKind::Command => self.timeouts.command,
            CallKind::Fetch => self.timeouts.fetch,
        };

        let mut slot = SharedSession {
            gateway: self,
            state: &mut *state,
        };
        call_with_retry(&mut slot, limit, name, retry, &op).await
    }

    /// Find `identity` in `folder` and apply `mutate` to its UID.
    /// Returns false when the message is not in that folder.
    async fn mutate_in<F>(&self, folder: &str, identity: &str, name: &str, mutate: F) -> SortaResult<bool>
    where
        F: for<'c> Fn(&'c mut Connection, u32) -> BoxFuture<'c, SortaResult<()>>
            + Clone
            + Send
            + Sync
            + 'static,
    {
        let folder_owned = folder.to_string();
        let identity_owned = identity.to_string();

        self.run(folder, CallKind::Command, name, move |conn| {
            let folder = folder_owned.clone();
            let identity = identity_owned.clone();
            let mutate = mutate.clone();
            async move {
                conn.select(&folder).await?;
                match conn.find_uid(&identity).await? {
                    Some(uid) => {
                        mutate(conn, uid).await?;
                        Ok(true)
                    }
                    None => Ok(false),
                }
            }
            .boxed()
        })
        .await
    }

    async fn contains(&self, folder: &str, identity: &str) -> SortaResult<bool> {
        let folder_owned = folder.to_string();
        let identity_owned = identity.to_string();

        self.run(folder, CallKind::Command, "verify", move |conn| {
            let folder = folder_owned.clone();
            let identity = identity_owned.clone();
            async move {
                conn.select(&folder).await?;
                Ok(conn.find_uid(&identity).await?.is_some())
            }
            .boxed()
        })
        .await
    }

    async fn search_summaries(&self, folder: &str, criteria: String, name: &str) -> SortaResult<Vec<MessageSummary>> {
        let folder_owned = folder.to_string();

        self.run(folder, CallKind::Fetch, name, move |conn| {
            let folder = folder_owned.clone();
            let criteria = criteria.clone();
            async move {
                conn.select(&folder).await?;
                let uids = conn.search(&criteria).await?;
                conn.fetch_summaries(&folder, &uids).await
            }
            .boxed()
        })
        .await
    }

    async fn body_in(&self, folder: &str, identity: &str, uid: Option<u32>) -> SortaResult<Option<MessageBody>> {
        let folder_owned = folder.to_string();
        let identity_owned = identity.to_string();

        self.run(folder, CallKind::Fetch, "fetch_body", move |conn| {
            let folder = folder_owned.clone();
            let identity = identity_owned.clone();
            async move {
                conn.select(&folder).await?;
                let uid = match uid {
                    Some(uid) => uid,
                    None => match conn.find_uid(&identity).await? {
                        Some(uid) => uid,
                        None => return Ok(None),
                    },
                };
                let raw = match conn.fetch_raw(uid).await? {
                    Some(raw) => raw,
                    None => return Ok(None),
                };
                // a hinted UID may now belong to another message
                if parse::identity_of(&raw).as_deref() != Some(identity.as_str()) {
                    return Ok(None);
                }
                parse::parse_body(&raw).map(Some)
            }
            .boxed()
        })
        .await
    }

    async fn category_markers_in_folder(&self, folder: &str) -> SortaResult<BTreeSet<String>> {
        let folder_owned = folder.to_string();

        self.run(folder, CallKind::Fetch, "discover_category_markers", move |conn| {
            let folder = folder_owned.clone();
            async move {
                conn.select(&folder).await?;
                let uids = conn
                    .search(&format!("KEYWORD {}", markers::CATEGORIZED))
                    .await?;
                let mut found = BTreeSet::new();
                for chunk in uids.chunks(FETCH_CHUNK) {
                    for fetch in conn.fetch(&parse::uid_set(chunk), "(UID FLAGS)").await? {
                        found.extend(
                            parse::fetch_flags(&fetch)
                                .into_iter()
                                .filter(|f| markers::is_category_marker(f)),
                        );
                    }
                }
                Ok(found)
            }
            .boxed()
        })
        .await
    }

    async fn identities_in_folder(&self, folder: &str, candidates: Vec<String>) -> SortaResult<HashSet<String>> {
        let folder_owned = folder.to_string();
        let batch = self.search_batch;

        self.run(folder, CallKind::Fetch, "existing_identities", move |conn| {
            let folder = folder_owned.clone();
            let candidates = candidates.clone();
            async move {
                conn.select(&folder).await?;
                let mut found = HashSet::new();
                for chunk in candidates.chunks(batch) {
                    let criteria: Vec<String> =
                        chunk.iter().map(|id| parse::identity_criterion(id)).collect();
                    let uids = conn.search(&parse::or_criteria(&criteria)).await?;
                    if uids.is_empty() {
                        continue;
                    }
                    let fetches = conn
                        .fetch(&parse::uid_set(&uids), "(UID BODY.PEEK[HEADER.FIELDS (MESSAGE-ID)])")
                        .await?;
                    found.extend(
                        fetches
                            .iter()
                            .filter_map(|f| f.header().and_then(parse::identity_of))
                            .filter(|id| chunk.contains(id)),
                    );
                }
                Ok(found)
            }
            .boxed()
        })
        .await
    }
}

#[async_trait]
impl MailboxGateway for ImapGateway {
    fn folders(&self) -> &FolderConfig {
        &self.folders
    }

    async fn close(&self) {
        self.disconnect().await;
    }

    async fn list_inbox_summaries(
        &self,
        cutoff: NaiveDate,
        include_flagged: bool,
    ) -> SortaResult<Vec<MessageSummary>> {
        let since = format!("SINCE {}", parse::imap_date(cutoff));
        let window = if include_flagged {
            format!("OR {} FLAGGED", since)
        } else {
            since
        };
        let criteria = format!(
            "{} NOT KEYWORD {} NOT KEYWORD {}",
            window,
            markers::CATEGORIZED,
            markers::ARCHIVED
        );

        let inbox = self.folders.inbox.clone();
        let summaries = self
            .search_summaries(&inbox, criteria, "list_inbox_summaries")
            .await?;

        Ok(summaries
            .into_iter()
            .filter(|s| !s.markers.iter().any(|m| markers::hides_from_inbox(m)))
            .collect())
    }

    async fn list_folder_summaries(
        &self,
        folder: &str,
        cutoff: NaiveDate,
    ) -> SortaResult<Vec<MessageSummary>> {
        let criteria = format!("SINCE {}", parse::imap_date(cutoff));
        self.search_summaries(folder, criteria, "list_folder_summaries").await
    }

    async fn list_marker_summaries(&self, marker: &str) -> SortaResult<Vec<MessageSummary>> {
        if !markers::is_valid_keyword(marker) {
            return Err(SortaError::validation(format!("Invalid marker: {}", marker)));
        }
        let criteria = format!("KEYWORD {} NOT KEYWORD {}", marker, markers::ARCHIVED);
        let inbox = self.folders.inbox.clone();
        self.search_summaries(&inbox, criteria, "list_marker_summaries").await
    }

    async fn fetch_body(
        &self,
        identity: &str,
        hint: Option<&LocationHint>,
    ) -> SortaResult<MessageBody> {
        if let Some(hint) = hint {
            if let Some(body) = self.body_in(&hint.folder, identity, Some(hint.uid)).await? {
                return Ok(body);
            }
            debug!("Location hint for {} is stale", identity);
        }

        let mut folders: Vec<String> = Vec::new();
        folders.push(
            hint.map(|h| h.folder.clone())
                .unwrap_or_else(|| self.folders.inbox.clone()),
        );
        folders.push(self.folders.archive.clone());
        if let Some(sent) = &self.folders.sent {
            folders.push(sent.clone());
        }
        folders.dedup();

        for folder in &folders {
            if let Some(body) = self.body_in(folder, identity, None).await? {
                return Ok(body);
            }
        }

        debug!("{} not found in {:?}", identity, folders);
        Ok(MessageBody::not_found())
    }

    async fn set_category_markers(&self, identity: &str, requested: &[String]) -> SortaResult<()> {
        if let Some(bad) = requested.iter().find(|m| !markers::is_category_marker(m) || !markers::is_valid_keyword(m)) {
            return Err(SortaError::validation(format!("Not a category marker: {}", bad)));
        }

        let requested: Vec<String> = requested.to_vec();
        let apply = mutation(move |conn, uid| {
            let requested = requested.clone();
            async move {
                let existing = markers::category_markers_in(&conn.flags_of(uid).await?);
                if !existing.is_empty() {
                    let list = markers::flag_list(existing.iter().map(String::as_str));
                    conn.store(uid, format!("-FLAGS {}", list)).await?;
                }
                for marker in &requested {
                    conn.store(uid, format!("+FLAGS ({})", marker)).await?;
                }
                if !requested.is_empty() {
                    conn.store(uid, format!("+FLAGS ({})", markers::CATEGORIZED)).await?;
                }
                Ok(())
            }
            .boxed()
        });

        for folder in [self.folders.inbox.clone(), self.folders.archive.clone()] {
            if self.mutate_in(&folder, identity, "set_category_markers", apply.clone()).await? {
                return Ok(());
            }
        }
        Err(SortaError::not_found(format!("{} not found remotely", identity)))
    }

    async fn move_to_archive_folder(&self, identity: &str) -> SortaResult<()> {
        let archive = self.folders.archive.clone();
        let target = archive.clone();
        let moved = self
            .mutate_in(&self.folders.inbox, identity, "move_to_archive_folder", move |conn, uid| {
                let target = target.clone();
                async move {
                    conn.store(uid, format!("+FLAGS ({})", markers::ARCHIVED)).await?;
                    conn.move_uid(uid, &target).await
                }
                .boxed()
            })
            .await?;

        if !moved {
            debug!("{} not in {}, checking {}", identity, self.folders.inbox, archive);
        }

        if !self.contains(&archive, identity).await? {
            return Err(SortaError::verification(format!(
                "{} missing from {} after move",
                identity, archive
            )));
        }
        Ok(())
    }

    async fn move_from_archive_to_folder(&self, identity: &str, target: &str) -> SortaResult<()> {
        let destination = target.to_string();
        let moved = self
            .mutate_in(&self.folders.archive, identity, "move_from_archive_to_folder", move |conn, uid| {
                let destination = destination.clone();
                async move {
                    conn.store(uid, format!("-FLAGS ({})", markers::ARCHIVED)).await?;
                    conn.move_uid(uid, &destination).await
                }
                .boxed()
            })
            .await?;

        if !moved {
            debug!("{} not in {}, checking {}", identity, self.folders.archive, target);
        }

        if !self.contains(target, identity).await? {
            return Err(SortaError::verification(format!(
                "{} missing from {} after move",
                identity, target
            )));
        }
        Ok(())
    }

    async fn count_matching_marker(&self, marker: &str) -> SortaResult<usize> {
        if !markers::is_valid_keyword(marker) {
            return Err(SortaError::validation(format!("Invalid marker: {}", marker)));
        }
        let inbox = self.folders.inbox.clone();
        let criteria = format!("KEYWORD {} NOT KEYWORD {}", marker, markers::ARCHIVED);

        self.run(&self.folders.inbox, CallKind::Fetch, "count_matching_marker", move |conn| {
            let inbox = inbox.clone();
            let criteria = criteria.clone();
            async move {
                conn.select(&inbox).await?;
                Ok(conn.search(&criteria).await?.len())
            }
            .boxed()
        })
        .await
    }

    async fn discover_category_markers(&self) -> SortaResult<BTreeSet<String>> {
        let mut found = self.category_markers_in_folder(&self.folders.inbox).await?;
        found.extend(self.category_markers_in_folder(&self.folders.archive).await?);
        Ok(found)
    }

    async fn existing_identities(&self, candidates: &[String]) -> SortaResult<HashMap<String, String>> {
        let mut folders = vec![self.folders.inbox.clone(), self.folders.archive.clone()];
        if let Some(sent) = &self.folders.sent {
            folders.push(sent.clone());
        }

        let mut found = HashMap::new();
        for folder in folders {
            let remaining: Vec<String> = candidates
                .iter()
                .filter(|c| !found.contains_key(*c))
                .cloned()
                .collect();
            if remaining.is_empty() {
                break;
            }
            for identity in self.identities_in_folder(&folder, remaining).await? {
                found.insert(identity, folder.clone());
            }
        }
        Ok(found)
    }

    async fn set_seen(
        &self,
        identity: &str,
        hint: Option<&LocationHint>,
        seen: bool,
    ) -> SortaResult<()> {
        let command = format!("{}FLAGS ({})", if seen { "+" } else { "-" }, markers::SEEN);
        let apply = mutation(move |conn, uid| {
            let command = command.clone();
            async move { conn.store(uid, command).await }.boxed()
        });

        let mut folders = vec![hint
            .map(|h| h.folder.clone())
            .unwrap_or_else(|| self.folders.inbox.clone())];
        folders.push(self.folders.archive.clone());
        folders.dedup();

        for folder in folders {
            if self.mutate_in(&folder, identity, "set_seen", apply.clone()).await? {
                return Ok(());
            }
        }
        Err(SortaError::not_found(format!("{} not found remotely", identity)))
    }

    async fn append_message(&self, folder: &str, raw: &[u8], flags: &[String]) -> SortaResult<()> {
        let folder_owned = folder.to_string();
        let content = raw.to_vec();
        let flag_list = markers::flag_list(flags.iter().map(String::as_str));

        // a retried APPEND could store the message twice
        self.run_with(folder, CallKind::Fetch, "append_message", Retry::Never, move |conn| {
            let folder = folder_owned.clone();
            let content = content.clone();
            let flag_list = flag_list.clone();
            async move {
                conn.session
                    .append(&folder, Some(flag_list.as_str()), None, &content)
                    .await?;
                Ok(())
            }
            .boxed()
        })
        .await
    }

    async fn delete_message(&self, identity: &str, folder: &str) -> SortaResult<()> {
        let deleted = self
            .mutate_in(folder, identity, "delete_message", |conn, uid| {
                async move {
                    conn.store(uid, "+FLAGS (\\Deleted)".to_string()).await?;
                    conn.expunge().await
                }
                .boxed()
            })
            .await?;

        if !deleted {
            debug!("{} already absent from {}", identity, folder);
        }
        Ok(())
    }
}
