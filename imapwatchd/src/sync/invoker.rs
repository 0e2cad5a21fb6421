use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tokio_util::task::TaskTracker;

#[derive(Debug, Error)]
pub enum InvokerError {
    #[error("failed to start {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to wait for sync worker: {0}")]
    Wait(#[source] std::io::Error),
    #[error("sync worker exited unsuccessfully (code {code:?})")]
    Exit { code: Option<i32> },
}

/// One request for the external sync worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    pub email: Option<String>,
    pub folder: Option<String>,
}

impl SyncRequest {
    pub fn folder(email: &str, folder: &str) -> Self {
        Self {
            email: Some(email.to_string()),
            folder: Some(folder.to_string()),
        }
    }

    /// Worker argv, without the program itself.
    pub fn command_args(&self) -> Vec<String> {
        let mut args = vec!["--once".to_string()];
        if let Some(email) = &self.email {
            args.push("--email".to_string());
            args.push(email.clone());
        }
        if let Some(folder) = &self.folder {
            args.push("--folder".to_string());
            args.push(folder.clone());
        }
        args
    }
}

#[async_trait]
pub trait SyncRunner: Send + Sync + 'static {
    async fn run(&self, request: &SyncRequest) -> Result<(), InvokerError>;
}

/// Runs the sync worker as a child process and waits for it to exit.
#[derive(Debug, Clone)]
pub struct ProcessSyncRunner {
    path: PathBuf,
}

impl ProcessSyncRunner {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SyncRunner for ProcessSyncRunner {
    async fn run(&self, request: &SyncRequest) -> Result<(), InvokerError> {
        let mut child = Command::new(&self.path)
            .args(request.command_args())
            .spawn()
            .map_err(|source| InvokerError::Spawn {
                path: self.path.clone(),
                source,
            })?;
        tracing::info!(
            pid = child.id(),
            email = request.email.as_deref(),
            folder = request.folder.as_deref(),
            "sync worker started"
        );
        let status = child.wait().await.map_err(InvokerError::Wait)?;
        if status.success() {
            Ok(())
        } else {
            Err(InvokerError::Exit {
                code: status.code(),
            })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvokeOutcome {
    Started,
    /// A sync for the folder is already running; it will run once more after
    /// it finishes.
    Coalesced,
}

type FolderKey = (i64, String);

/// Launches sync runs with at most one in flight per folder.
#[derive(Clone)]
pub struct SyncInvoker {
    runner: Arc<dyn SyncRunner>,
    // Value is the pending re-run flag.
    in_flight: Arc<Mutex<HashMap<FolderKey, bool>>>,
    tasks: TaskTracker,
}

impl SyncInvoker {
    pub fn new(runner: Arc<dyn SyncRunner>) -> Self {
        Self {
            runner,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            tasks: TaskTracker::new(),
        }
    }

    pub fn invoke(&self, account_id: i64, email: &str, folder: &str) -> InvokeOutcome {
        let key = (account_id, folder.to_string());
        {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(pending) = in_flight.get_mut(&key) {
                *pending = true;
                tracing::debug!(email, folder, "sync already running, re-run queued");
                return InvokeOutcome::Coalesced;
            }
            in_flight.insert(key.clone(), false);
        }

        let runner = Arc::clone(&self.runner);
        let in_flight = Arc::clone(&self.in_flight);
        let request = SyncRequest::folder(email, folder);
        self.tasks.spawn(async move {
            loop {
                match runner.run(&request).await {
                    Ok(()) => tracing::info!(
                        email = request.email.as_deref(),
                        folder = request.folder.as_deref(),
                        "sync finished"
                    ),
                    Err(err) => tracing::error!(
                        email = request.email.as_deref(),
                        folder = request.folder.as_deref(),
                        error = %err,
                        "sync failed"
                    ),
                }
                let mut registry = in_flight.lock().unwrap_or_else(PoisonError::into_inner);
                let rerun = match registry.get_mut(&key) {
                    Some(pending) if *pending => {
                        *pending = false;
                        true
                    }
                    _ => false,
                };
                if !rerun {
                    registry.remove(&key);
                    break;
                }
            }
        });
        InvokeOutcome::Started
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Waits until every started sync, including queued re-runs, has ended.
    pub async fn wait_idle(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }
}

#[cfg(test)]
#[path = "invoker_tests.rs"]
mod tests;
