use std::fmt;
use std::time::Duration;

use async_imap::extensions::idle::IdleResponse;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::account::Account;
use crate::events::{MailboxEvent, MailboxTracker};

#[derive(Debug, Error)]
pub enum ImapError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TLS error: {0}")]
    Tls(#[from] async_native_tls::Error),
    #[error("IMAP error: {0}")]
    Imap(#[from] async_imap::error::Error),
    #[error("timed out during {0}")]
    Timeout(&'static str),
    #[error("server does not support {0}")]
    Unsupported(&'static str),
}

/// Transport underneath an IMAP session, either plain TCP or TLS.
pub trait SessionStream: AsyncRead + AsyncWrite + Unpin + Send + fmt::Debug {}

impl<T> SessionStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + fmt::Debug {}

pub type ImapSession = async_imap::Session<Box<dyn SessionStream>>;

#[derive(Debug, Clone)]
pub struct ImapSettings {
    pub tls: bool,
    pub accept_invalid_certs: bool,
    pub conn_timeout: Duration,
    pub auth_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for ImapSettings {
    fn default() -> Self {
        Self {
            tls: true,
            accept_invalid_certs: false,
            conn_timeout: Duration::from_secs(30),
            auth_timeout: Duration::from_secs(30),
            // Re-issue IDLE well before the 29 minute server cutoff.
            idle_timeout: Duration::from_secs(25 * 60),
        }
    }
}

/// Opens a connection to the account's IMAP endpoint and logs in.
pub async fn connect(
    account: &Account,
    settings: &ImapSettings,
) -> Result<ImapSession, ImapError> {
    let stream = tokio::time::timeout(settings.conn_timeout, open_stream(account, settings))
        .await
        .map_err(|_| ImapError::Timeout("connect"))??;
    let client = async_imap::Client::new(stream);
    let session = tokio::time::timeout(
        settings.auth_timeout,
        client.login(&account.email, &account.password),
    )
    .await
    .map_err(|_| ImapError::Timeout("login"))?
    .map_err(|(err, _client)| err)?;
    tracing::debug!(account = %account.endpoint_label(), "IMAP login complete");
    Ok(session)
}

async fn open_stream(
    account: &Account,
    settings: &ImapSettings,
) -> Result<Box<dyn SessionStream>, ImapError> {
    let tcp = TcpStream::connect((account.imap_host.as_str(), account.imap_port)).await?;
    if !settings.tls {
        return Ok(Box::new(tcp));
    }
    let connector = async_native_tls::TlsConnector::new()
        .danger_accept_invalid_certs(settings.accept_invalid_certs);
    let tls = connector.connect(account.imap_host.as_str(), tcp).await?;
    Ok(Box::new(tls))
}

/// A session with its mailbox selected, ready to be watched.
pub struct OpenedMailbox {
    session: ImapSession,
    tracker: MailboxTracker,
    uid_validity: Option<u32>,
}

impl OpenedMailbox {
    pub fn exists(&self) -> u32 {
        self.tracker.exists()
    }

    pub fn uid_validity(&self) -> Option<u32> {
        self.uid_validity
    }
}

/// Checks for IDLE support and selects `mailbox`. Both steps must finish
/// within `timeout`.
pub async fn open_mailbox(
    session: ImapSession,
    mailbox: &str,
    timeout: Duration,
) -> Result<OpenedMailbox, ImapError> {
    tokio::time::timeout(timeout, select_for_idle(session, mailbox))
        .await
        .map_err(|_| ImapError::Timeout("select"))?
}

async fn select_for_idle(
    mut session: ImapSession,
    mailbox: &str,
) -> Result<OpenedMailbox, ImapError> {
    let capabilities = session.capabilities().await?;
    if !capabilities.has_str("IDLE") {
        return Err(ImapError::Unsupported("IDLE"));
    }
    let selected = session.select(mailbox).await?;
    // Responses queued while selecting describe the initial state, not changes.
    while session.unsolicited_responses.try_recv().is_ok() {}
    Ok(OpenedMailbox {
        session,
        tracker: MailboxTracker::new(selected.exists),
        uid_validity: selected.uid_validity,
    })
}

/// Reports changes of an opened mailbox through `emit` until `cancel` fires
/// or the session fails.
///
/// A clean stop logs out and emits `End` followed by `Close { had_error: false }`.
/// On failure the caller receives the error; `Error` and `Close { had_error: true }`
/// are emitted first so listeners see the same sequence either way.
pub async fn watch_mailbox<F>(
    opened: OpenedMailbox,
    idle_timeout: Duration,
    cancel: CancellationToken,
    mut emit: F,
) -> Result<(), ImapError>
where
    F: FnMut(MailboxEvent) + Send,
{
    match idle_loop(opened, idle_timeout, &cancel, &mut emit).await {
        Ok(()) => {
            emit(MailboxEvent::End);
            emit(MailboxEvent::Close { had_error: false });
            Ok(())
        }
        Err(err) => {
            emit(MailboxEvent::Error {
                message: err.to_string(),
            });
            emit(MailboxEvent::Close { had_error: true });
            Err(err)
        }
    }
}

async fn idle_loop<F>(
    opened: OpenedMailbox,
    idle_timeout: Duration,
    cancel: &CancellationToken,
    emit: &mut F,
) -> Result<(), ImapError>
where
    F: FnMut(MailboxEvent) + Send,
{
    let OpenedMailbox {
        mut session,
        mut tracker,
        uid_validity,
    } = opened;
    if let Some(value) = uid_validity {
        emit(MailboxEvent::UidValidity { value });
    }
    emit(MailboxEvent::Ready);

    while !cancel.is_cancelled() {
        let mut idle = session.idle();
        idle.init().await?;
        let response = {
            let (idle_wait, interrupt) = idle.wait_with_timeout(idle_timeout);
            let stop = cancel.clone();
            let interrupter = tokio::spawn(async move {
                stop.cancelled().await;
                drop(interrupt);
            });
            let response = idle_wait.await;
            interrupter.abort();
            response?
        };
        session = idle.done().await?;

        if let IdleResponse::NewData(data) = &response {
            for event in tracker.observe(data.parsed()) {
                let ended = event == MailboxEvent::End;
                emit(event);
                if ended {
                    return Err(ImapError::Io(std::io::Error::new(
                        std::io::ErrorKind::ConnectionAborted,
                        "server closed the session",
                    )));
                }
            }
        }
        while let Ok(unsolicited) = session.unsolicited_responses.try_recv() {
            for event in tracker.observe_unsolicited(&unsolicited) {
                emit(event);
            }
        }
    }

    session.logout().await?;
    Ok(())
}
