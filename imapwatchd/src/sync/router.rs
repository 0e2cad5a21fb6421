use std::sync::Arc;

use imapwatch_core::{Account, MailboxEvent};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::engine::ResyncEngine;
use crate::connection::{AccountEvent, WATCHED_MAILBOX};

/// Folders a change event affects.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Scope {
    Watched,
    AllFolders,
}

/// Forwards mailbox events from every pooled connection to the resync engine.
#[derive(Clone)]
pub struct EventRouter {
    engine: ResyncEngine,
    batches: TaskTracker,
}

impl EventRouter {
    pub fn new(engine: ResyncEngine) -> Self {
        Self {
            engine,
            batches: TaskTracker::new(),
        }
    }

    pub fn engine(&self) -> &ResyncEngine {
        &self.engine
    }

    /// Consumes events until the channel closes or `stop` fires.
    pub async fn run(
        &self,
        mut events: mpsc::UnboundedReceiver<AccountEvent>,
        stop: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = stop.cancelled() => None,
            };
            let Some(event) = event else {
                break;
            };
            self.dispatch(event);
        }
        tracing::debug!("event router stopped");
    }

    /// Routes one event. Returns true when a resync batch was started for it.
    pub fn dispatch(&self, event: AccountEvent) -> bool {
        let AccountEvent {
            account,
            ready,
            event,
        } = event;
        let email = account.email.as_str();
        let scope = match &event {
            MailboxEvent::Mail { count } => {
                if !ready {
                    tracing::debug!(
                        email,
                        count,
                        "mail on a connection that is not ready, ignored"
                    );
                    return false;
                }
                tracing::info!(email, count, "new mail");
                Scope::Watched
            }
            MailboxEvent::Update { seqno, flags } => {
                tracing::info!(email, seqno, flags = ?flags, "message updated");
                Scope::AllFolders
            }
            MailboxEvent::Expunge { seqno } => {
                tracing::info!(email, seqno, "message expunged");
                Scope::AllFolders
            }
            MailboxEvent::Ready => {
                tracing::info!(email, "mailbox ready");
                return false;
            }
            MailboxEvent::Alert { message } => {
                tracing::info!(email, alert = %message, "server alert");
                return false;
            }
            MailboxEvent::UidValidity { value } => {
                tracing::debug!(email, uid_validity = value, "uid validity");
                return false;
            }
            MailboxEvent::Error { message } => {
                tracing::error!(email, error = %message, "mailbox connection error");
                return false;
            }
            MailboxEvent::Close { had_error } => {
                tracing::info!(email, had_error, "mailbox connection closed");
                return false;
            }
            MailboxEvent::End => {
                tracing::info!(email, "mailbox connection ended");
                return false;
            }
        };

        let engine = self.engine.clone();
        self.batches.spawn(run_batch(engine, account, scope));
        true
    }

    /// Waits for every running resync batch to finish.
    pub async fn wait_idle(&self) {
        self.batches.close();
        self.batches.wait().await;
        self.batches.reopen();
    }
}

async fn run_batch(engine: ResyncEngine, account: Arc<Account>, scope: Scope) {
    let folders = match scope {
        Scope::Watched => vec![WATCHED_MAILBOX.to_string()],
        Scope::AllFolders => match engine.store().list_folder_names(account.id).await {
            Ok(folders) => folders,
            Err(err) => {
                tracing::error!(email = %account.email, error = %err, "failed to list folders");
                return;
            }
        },
    };
    match engine.handle_change(&account, &folders).await {
        Ok(report) => {
            for failure in &report.failures {
                tracing::error!(
                    email = %account.email,
                    folder = %failure.folder,
                    error = %failure.error,
                    "resync decision failed"
                );
            }
        }
        Err(err) => {
            tracing::error!(email = %account.email, error = %err, "resync decision failed");
        }
    }
}

#[cfg(test)]
#[path = "router_tests.rs"]
mod tests;
