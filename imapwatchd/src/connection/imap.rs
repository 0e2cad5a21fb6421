use std::sync::Arc;

use async_trait::async_trait;
use imapwatch_core::{Account, ImapError, ImapSession, ImapSettings, MailboxEvent};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::supervisor::{ConnectionLink, Resource};

pub const WATCHED_MAILBOX: &str = "INBOX";

/// A mailbox event tagged with the account it came from.
#[derive(Debug, Clone)]
pub struct AccountEvent {
    pub account: Arc<Account>,
    /// Whether the emitting connection was ready when the event was produced.
    pub ready: bool,
    pub event: MailboxEvent,
}

pub struct ImapHandle {
    session: Mutex<Option<ImapSession>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    stop: CancellationToken,
}

/// IMAP endpoint of one account. Each open logs in; activation selects `INBOX`
/// and then watches it with IDLE on a dedicated task.
pub struct ImapResource {
    account: Arc<Account>,
    settings: ImapSettings,
    label: String,
    events: mpsc::UnboundedSender<AccountEvent>,
}

impl ImapResource {
    pub fn new(
        account: Arc<Account>,
        settings: ImapSettings,
        events: mpsc::UnboundedSender<AccountEvent>,
    ) -> Self {
        let label = account.endpoint_label();
        Self {
            account,
            settings,
            label,
            events,
        }
    }

    pub fn account(&self) -> &Arc<Account> {
        &self.account
    }
}

#[async_trait]
impl Resource for ImapResource {
    type Handle = ImapHandle;
    type Error = ImapError;

    fn label(&self) -> &str {
        &self.label
    }

    async fn open(&self) -> Result<ImapHandle, ImapError> {
        let session = imapwatch_core::connect(&self.account, &self.settings).await?;
        Ok(ImapHandle {
            session: Mutex::new(Some(session)),
            listener: Mutex::new(None),
            stop: CancellationToken::new(),
        })
    }

    async fn on_connected(
        &self,
        handle: &ImapHandle,
        link: ConnectionLink,
    ) -> Result<(), ImapError> {
        let Some(session) = handle.session.lock().await.take() else {
            return Err(ImapError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "session already consumed",
            )));
        };
        let opened =
            imapwatch_core::open_mailbox(session, WATCHED_MAILBOX, self.settings.auth_timeout)
                .await?;
        tracing::debug!(
            connection = %self.label,
            mailbox = WATCHED_MAILBOX,
            exists = opened.exists(),
            "mailbox selected"
        );
        let account = Arc::clone(&self.account);
        let events = self.events.clone();
        let idle_timeout = self.settings.idle_timeout;
        let stop = handle.stop.clone();
        let label = self.label.clone();

        let listener = tokio::spawn(async move {
            let emit_link = link.clone();
            let emit = move |event: MailboxEvent| {
                if matches!(event, MailboxEvent::Close { .. }) {
                    emit_link.mark_closed();
                }
                let _ = events.send(AccountEvent {
                    account: Arc::clone(&account),
                    ready: emit_link.is_ready(),
                    event,
                });
            };
            let watched = imapwatch_core::watch_mailbox(opened, idle_timeout, stop, emit).await;
            if let Err(err) = watched {
                tracing::debug!(connection = %label, error = %err, "IMAP listener stopped");
                link.report_fault(err.to_string());
            }
        });
        *handle.listener.lock().await = Some(listener);
        Ok(())
    }

    async fn close(&self, handle: &ImapHandle) -> Result<(), ImapError> {
        handle.stop.cancel();
        if let Some(mut listener) = handle.listener.lock().await.take() {
            // Logout can hang on a dead socket; give it the auth budget.
            if tokio::time::timeout(self.settings.auth_timeout, &mut listener)
                .await
                .is_err()
            {
                listener.abort();
                return Err(ImapError::Timeout("logout"));
            }
        }
        // Opened but never activated.
        handle.session.lock().await.take();
        Ok(())
    }
}

#[cfg(test)]
#[path = "imap_tests.rs"]
mod tests;
