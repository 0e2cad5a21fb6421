use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use imapwatch_core::{Account, ImapSettings};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::connection::{
    AggregateError, ConnectError, ConnectionPool, DEFAULT_ATTEMPT_TIMEOUT, DEFAULT_MAX_ATTEMPTS,
    DatabaseResource, ImapResource, ReconnectPolicy, SupervisedConnection,
};
use crate::logging::LogConfig;
use crate::sync::{
    EventRouter, ProcessSyncRunner, ResyncEngine, SqliteStatusStore, StatusStore, SyncInvoker,
};

const DATA_DIR_NAME: &str = "imap-watcher";
const DEFAULT_DATABASE_FILE: &str = "watcher.db";
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 25 * 60;
const DEFAULT_MAIL_TIMEOUT_MS: u64 = 30_000;

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub database_url: String,
    pub sync_path: PathBuf,
    pub policy: ReconnectPolicy,
    pub imap: ImapSettings,
    pub log: LogConfig,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("WATCHER_DATABASE_URL")
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(default_database_url);
        let sync_path = lookup("WATCHER_SYNC_PATH")
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from)
            .context("WATCHER_SYNC_PATH is not set")?;
        let max_attempts = parse_u64(
            lookup("WATCHER_MAX_ATTEMPTS_COUNT").as_deref(),
            u64::from(DEFAULT_MAX_ATTEMPTS),
        );
        let attempt_timeout = parse_u64(
            lookup("WATCHER_ATTEMPTS_TIMEOUT").as_deref(),
            DEFAULT_ATTEMPT_TIMEOUT.as_millis() as u64,
        );
        let policy = ReconnectPolicy::new(
            Duration::from_millis(attempt_timeout),
            u32::try_from(max_attempts).unwrap_or(u32::MAX),
        );
        let imap = ImapSettings {
            tls: parse_bool(lookup("MAIL_TLS").as_deref(), true),
            accept_invalid_certs: parse_bool(
                lookup("MAIL_TLS_ACCEPT_INVALID_CERTS").as_deref(),
                false,
            ),
            conn_timeout: Duration::from_millis(parse_u64(
                lookup("MAIL_CONN_TIMEOUT").as_deref(),
                DEFAULT_MAIL_TIMEOUT_MS,
            )),
            auth_timeout: Duration::from_millis(parse_u64(
                lookup("MAIL_AUTH_TIMEOUT").as_deref(),
                DEFAULT_MAIL_TIMEOUT_MS,
            )),
            idle_timeout: Duration::from_secs(parse_u64(
                lookup("WATCHER_IDLE_TIMEOUT_SECS").as_deref(),
                DEFAULT_IDLE_TIMEOUT_SECS,
            )),
        };
        let log = LogConfig {
            error_log_dir: lookup("WATCHER_ERROR_LOG_PATH")
                .filter(|value| !value.trim().is_empty())
                .map(PathBuf::from),
        };

        Ok(Self {
            database_url,
            sync_path,
            policy,
            imap,
            log,
        })
    }
}

/// How the daemon stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Clean,
    /// Stopped by a failure rather than a shutdown request.
    Forced,
}

impl RunOutcome {
    pub fn exit_code(self) -> ExitCode {
        match self {
            RunOutcome::Clean => ExitCode::SUCCESS,
            RunOutcome::Forced => ExitCode::FAILURE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShutdownReason {
    Signal(&'static str),
    Requested,
    SignalHandlerFailed,
    RouterStopped,
    ConnectFailed,
}

impl ShutdownReason {
    fn outcome(self) -> RunOutcome {
        match self {
            ShutdownReason::Signal(_) | ShutdownReason::Requested => RunOutcome::Clean,
            ShutdownReason::SignalHandlerFailed
            | ShutdownReason::RouterStopped
            | ShutdownReason::ConnectFailed => RunOutcome::Forced,
        }
    }
}

/// Lets exactly one caller start draining.
#[derive(Debug, Default)]
struct ShutdownTrigger {
    started: AtomicBool,
}

impl ShutdownTrigger {
    fn begin(&self, reason: ShutdownReason) -> bool {
        if self.started.swap(true, Ordering::SeqCst) {
            tracing::info!(reason = ?reason, "shutdown already in progress");
            return false;
        }
        tracing::info!(reason = ?reason, "shutting down");
        true
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    database: Arc<SupervisedConnection<DatabaseResource>>,
    store: Arc<SqliteStatusStore>,
    accounts: Vec<Arc<Account>>,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        tokio::fs::metadata(&config.sync_path)
            .await
            .with_context(|| format!("sync executable not found at {:?}", config.sync_path))?;
        if let Some(parent) = sqlite_file_path(&config.database_url)
            .as_deref()
            .and_then(|path| path.parent())
            .filter(|parent| !parent.as_os_str().is_empty())
        {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create database directory at {parent:?}"))?;
        }

        let database = Arc::new(SupervisedConnection::new(
            DatabaseResource::new(config.database_url.clone()),
            config.policy,
        ));
        let store = database
            .connect()
            .await
            .context("failed to open status database")?;
        let accounts = match store.list_active_accounts().await {
            Ok(accounts) => accounts.into_iter().map(Arc::new).collect(),
            Err(err) => {
                let _ = database.close().await;
                return Err(err).context("failed to load accounts");
            }
        };

        Ok(Self {
            config,
            database,
            store,
            accounts,
        })
    }

    pub fn accounts(&self) -> &[Arc<Account>] {
        &self.accounts
    }

    /// Runs until SIGINT or SIGTERM, or until a failure stops the watcher.
    pub async fn run(self) -> anyhow::Result<RunOutcome> {
        self.run_until(CancellationToken::new()).await
    }

    /// Like [`run`](Self::run), but `stop` also requests a clean shutdown.
    pub async fn run_until(self, stop: CancellationToken) -> anyhow::Result<RunOutcome> {
        tracing::info!(
            accounts = self.accounts.len(),
            sync_path = %self.config.sync_path.display(),
            "imap watcher started"
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let invoker = SyncInvoker::new(Arc::new(ProcessSyncRunner::new(&self.config.sync_path)));
        let store: Arc<dyn StatusStore> = self.store.clone();
        let router = EventRouter::new(ResyncEngine::new(store, invoker));
        let stop_router = CancellationToken::new();
        let mut router_task = tokio::spawn({
            let router = router.clone();
            let stop = stop_router.clone();
            async move { router.run(events_rx, stop).await }
        });

        let shutdown = shutdown_requested(stop);
        tokio::pin!(shutdown);
        let mut pool = ConnectionPool::new(self.config.policy);
        let imap = self.config.imap.clone();
        let connected = tokio::select! {
            connected = pool.connect_all(
                &self.accounts,
                |account| ImapResource::new(account, imap.clone(), events_tx.clone()),
                account_connection_failed,
            ) => Ok(connected),
            reason = &mut shutdown => Err(reason),
        };

        let mut router_finished = false;
        let reason = match connected {
            Err(reason) => reason,
            Ok(Err(err)) => {
                tracing::error!(error = %err, "failed to connect all accounts");
                for failure in &err.failures {
                    tracing::error!(error = %failure, "account connection failed");
                }
                ShutdownReason::ConnectFailed
            }
            Ok(Ok(())) => {
                tracing::info!(connections = pool.len(), "watching mailboxes");
                tokio::select! {
                    reason = &mut shutdown => reason,
                    _ = &mut router_task => {
                        router_finished = true;
                        ShutdownReason::RouterStopped
                    }
                }
            }
        };

        let trigger = Arc::new(ShutdownTrigger::default());
        trigger.begin(reason);
        let late_signals = tokio::spawn({
            let trigger = Arc::clone(&trigger);
            async move {
                while let Ok(signal) = wait_for_signal().await {
                    trigger.begin(ShutdownReason::Signal(signal));
                }
            }
        });

        if let Err(err) = pool.disconnect_all().await {
            log_aggregate(&err);
        }
        drop(events_tx);
        stop_router.cancel();
        if !router_finished && let Err(err) = router_task.await {
            tracing::warn!(error = %err, "event router task failed");
        }
        router.wait_idle().await;
        if let Err(err) = self.database.close().await {
            tracing::warn!(error = %err, "failed to close status database");
        }
        late_signals.abort();

        let outcome = reason.outcome();
        tracing::info!(outcome = ?outcome, "imap watcher stopped");
        Ok(outcome)
    }
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
