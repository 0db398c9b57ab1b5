//! Detached remote mutations.
//!
//! The caller gets its answer as soon as the local write lands; the remote
//! half runs in its own task. A failure (or a panic) never reaches the caller.
//! It is reported on a channel that the next worker run drains and retries.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::SortaResult;
use crate::gateway::MailboxGateway;
use crate::types::LocationHint;

/// A remote mutation that may run detached from its caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FollowUpAction {
    SetSeen {
        identity: String,
        hint: Option<LocationHint>,
        seen: bool,
    },
    DeleteMessage {
        identity: String,
        folder: String,
    },
}

impl FollowUpAction {
    pub fn identity(&self) -> &str {
        match self {
            FollowUpAction::SetSeen { identity, .. } => identity,
            FollowUpAction::DeleteMessage { identity, .. } => identity,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FollowUpAction::SetSeen { .. } => "set_seen",
            FollowUpAction::DeleteMessage { .. } => "delete_message",
        }
    }

    async fn execute(&self, gateway: &dyn MailboxGateway) -> SortaResult<()> {
        match self {
            FollowUpAction::SetSeen { identity, hint, seen } => {
                gateway.set_seen(identity, hint.as_ref(), *seen).await
            }
            FollowUpAction::DeleteMessage { identity, folder } => {
                gateway.delete_message(identity, folder).await
            }
        }
    }
}

/// A follow-up that did not complete
#[derive(Debug, Clone)]
pub struct FollowUpFailure {
    pub action: FollowUpAction,
    pub error: String,
    pub panicked: bool,
}

/// Spawner and failure channel for detached mutations
pub struct FollowUpQueue {
    gateway: Arc<dyn MailboxGateway>,
    failures_tx: UnboundedSender<FollowUpFailure>,
    failures_rx: Mutex<UnboundedReceiver<FollowUpFailure>>,
}

impl FollowUpQueue {
    pub fn new(gateway: Arc<dyn MailboxGateway>) -> Self {
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        Self {
            gateway,
            failures_tx,
            failures_rx: Mutex::new(failures_rx),
        }
    }

    /// Run `action` in its own task. The returned handle resolves once the
    /// action finished or its failure was recorded.
    pub fn submit(&self, action: FollowUpAction) -> JoinHandle<()> {
        let gateway = self.gateway.clone();
        let failures = self.failures_tx.clone();

        tokio::spawn(async move {
            let task_action = action.clone();
            let inner = tokio::spawn(async move { task_action.execute(gateway.as_ref()).await });

            let failure = match inner.await {
                Ok(Ok(())) => {
                    debug!("Follow-up {} for {} done", action.name(), action.identity());
                    None
                }
                Ok(Err(e)) => Some(FollowUpFailure {
                    action,
                    error: e.to_string(),
                    panicked: false,
                }),
                Err(join_error) => Some(FollowUpFailure {
                    action,
                    error: join_error.to_string(),
                    panicked: join_error.is_panic(),
                }),
            };

            if let Some(failure) = failure {
                warn!(
                    "Follow-up {} for {} failed: {}",
                    failure.action.name(),
                    failure.action.identity(),
                    failure.error
                );
                // receiver lives as long as the queue
                let _ = failures.send(failure);
            }
        })
    }

    /// Take every failure reported so far
    pub fn drain(&self) -> Vec<FollowUpFailure> {
        let mut rx = self.failures_rx.lock();
        let mut drained = Vec::new();
        while let Ok(failure) = rx.try_recv() {
            drained.push(failure);
        }
        drained
    }

    /// Retry each failure once, inline. Returns how many succeeded.
    pub async fn retry(&self, failures: Vec<FollowUpFailure>) -> usize {
        let mut recovered = 0;
        for failure in failures {
            match failure.action.execute(self.gateway.as_ref()).await {
                Ok(()) => {
                    info!(
                        "Retried follow-up {} for {}",
                        failure.action.name(),
                        failure.action.identity()
                    );
                    recovered += 1;
                }
                Err(e) => warn!(
                    "Dropping follow-up {} for {} after retry: {}",
                    failure.action.name(),
                    failure.action.identity(),
                    e
                ),
            }
        }
        recovered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FolderConfig;
    use crate::gateway::{InMemoryGateway, RemoteMessage};
    use crate::markers;

    fn setup() -> (Arc<InMemoryGateway>, FollowUpQueue) {
        let gateway = Arc::new(InMemoryGateway::new(FolderConfig::default()));
        gateway.add_message("INBOX", RemoteMessage::new("<a@x>", "Hello"));
        let queue = FollowUpQueue::new(gateway.clone());
        (gateway, queue)
    }

    fn seen(identity: &str) -> FollowUpAction {
        FollowUpAction::SetSeen {
            identity: identity.to_string(),
            hint: None,
            seen: true,
        }
    }

    #[tokio::test]
    async fn test_successful_follow_up() {
        let (gateway, queue) = setup();
        queue.submit(seen("<a@x>")).await.unwrap();

        assert!(gateway.flags_of("<a@x>").unwrap().contains(markers::SEEN));
        assert!(queue.drain().is_empty());
    }

    #[tokio::test]
    async fn test_failure_is_reported_and_retried() {
        let (gateway, queue) = setup();
        gateway.fail_mutations_for("<a@x>");

        queue.submit(seen("<a@x>")).await.unwrap();
        let failures = queue.drain();
        assert_eq!(failures.len(), 1);
        assert!(!failures[0].panicked);
        assert_eq!(failures[0].action.identity(), "<a@x>");
        assert!(queue.drain().is_empty());

        gateway.clear_failures();
        assert_eq!(queue.retry(failures).await, 1);
        assert!(gateway.flags_of("<a@x>").unwrap().contains(markers::SEEN));
    }

    #[tokio::test]
    async fn test_missing_message_is_a_failure() {
        let (_gateway, queue) = setup();
        queue.submit(seen("<gone@x>")).await.unwrap();
        assert_eq!(queue.drain().len(), 1);
    }
}
