use std::sync::Arc;

use futures_util::future::join_all;
use imapwatch_core::Account;
use thiserror::Error;

use super::invoker::{InvokeOutcome, SyncInvoker};
use super::status::FolderSyncStatus;
use super::store::{StatusStore, StoreError};

/// Re-reads allowed after a lost compare-and-set before giving up on a folder.
const MAX_MARK_RETRIES: usize = 3;

#[derive(Debug, Error)]
pub enum ResyncError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("status of {folder} kept changing, gave up after {attempts} attempts")]
    Contended { folder: String, attempts: usize },
}

/// What happened to one folder of a change batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FolderOutcome {
    SyncStarted,
    /// A sync of the folder was already running; a re-run is queued.
    Coalesced,
    Marked(FolderSyncStatus),
    Unchanged,
}

#[derive(Debug)]
pub struct FolderFailure {
    pub folder: String,
    pub error: ResyncError,
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub outcomes: Vec<(String, FolderOutcome)>,
    pub failures: Vec<FolderFailure>,
}

impl BatchReport {
    pub fn outcome(&self, folder: &str) -> Option<FolderOutcome> {
        self.outcomes
            .iter()
            .find(|(name, _)| name == folder)
            .map(|(_, outcome)| *outcome)
    }
}

/// Decides, per changed folder, between starting a sync and leaving a resync
/// marker for the worker that is already running.
#[derive(Clone)]
pub struct ResyncEngine {
    store: Arc<dyn StatusStore>,
    invoker: SyncInvoker,
}

impl ResyncEngine {
    pub fn new(store: Arc<dyn StatusStore>, invoker: SyncInvoker) -> Self {
        Self { store, invoker }
    }

    pub fn store(&self) -> &Arc<dyn StatusStore> {
        &self.store
    }

    pub fn invoker(&self) -> &SyncInvoker {
        &self.invoker
    }

    pub async fn handle_change(
        &self,
        account: &Account,
        folders: &[String],
    ) -> Result<BatchReport, ResyncError> {
        let syncing = self.store.is_account_syncing(account.id).await?;
        let mut report = BatchReport::default();

        if !syncing {
            for folder in folders {
                let outcome = match self.invoker.invoke(account.id, &account.email, folder) {
                    InvokeOutcome::Started => FolderOutcome::SyncStarted,
                    InvokeOutcome::Coalesced => FolderOutcome::Coalesced,
                };
                report.outcomes.push((folder.clone(), outcome));
            }
            return Ok(report);
        }

        let results = join_all(
            folders
                .iter()
                .map(|folder| self.mark_for_resync(account.id, folder)),
        )
        .await;
        for (folder, result) in folders.iter().zip(results) {
            match result {
                Ok(outcome) => {
                    if let FolderOutcome::Marked(status) = outcome {
                        tracing::info!(
                            email = %account.email,
                            folder = %folder,
                            status = %status,
                            "folder marked for resync"
                        );
                    }
                    report.outcomes.push((folder.clone(), outcome));
                }
                Err(error) => report.failures.push(FolderFailure {
                    folder: folder.clone(),
                    error,
                }),
            }
        }
        Ok(report)
    }

    async fn mark_for_resync(
        &self,
        account_id: i64,
        folder: &str,
    ) -> Result<FolderOutcome, ResyncError> {
        for _ in 0..MAX_MARK_RETRIES {
            let Some(info) = self.store.folder_sync_info(account_id, folder).await? else {
                return Ok(FolderOutcome::Unchanged);
            };
            let Some(marker) = info.status.resync_marker() else {
                return Ok(FolderOutcome::Unchanged);
            };
            if self
                .store
                .compare_and_set_status(account_id, folder, info.status, marker)
                .await?
            {
                return Ok(FolderOutcome::Marked(marker));
            }
            tracing::debug!(folder, expected = %info.status, "folder status moved, re-reading");
        }
        Err(ResyncError::Contended {
            folder: folder.to_string(),
            attempts: MAX_MARK_RETRIES,
        })
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
