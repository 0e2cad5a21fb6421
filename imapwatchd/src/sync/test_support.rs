use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use imapwatch_core::Account;
use tokio::sync::Semaphore;

use super::invoker::{InvokerError, SyncRequest, SyncRunner};
use super::status::{FolderSyncStatus, SyncingInfo};
use super::store::{StatusStore, StoreError};

type Folders = HashMap<(i64, String), FolderSyncStatus>;
type Interference = Box<dyn FnOnce(&mut Folders) + Send>;

pub fn account(id: i64, email: &str) -> Account {
    Account {
        id,
        service: "imap".into(),
        name: format!("Account {id}"),
        email: email.into(),
        password: "secret".into(),
        imap_host: "imap.example.com".into(),
        imap_port: 993,
        imap_flags: None,
        smtp_host: None,
        smtp_port: None,
        is_active: true,
        created_at: None,
    }
}

/// In-memory store whose compare-and-set can be raced on purpose.
#[derive(Default)]
pub struct FakeStatusStore {
    accounts: Vec<Account>,
    folders: Mutex<Folders>,
    broken: Mutex<HashSet<String>>,
    interference: Mutex<Option<Interference>>,
    cas_calls: AtomicUsize,
    syncing_checks: AtomicUsize,
}

impl FakeStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_accounts(accounts: Vec<Account>) -> Self {
        Self {
            accounts,
            ..Self::default()
        }
    }

    pub fn set(&self, account_id: i64, folder: &str, status: FolderSyncStatus) {
        self.folders
            .lock()
            .unwrap()
            .insert((account_id, folder.to_string()), status);
    }

    pub fn get(&self, account_id: i64, folder: &str) -> Option<FolderSyncStatus> {
        self.folders
            .lock()
            .unwrap()
            .get(&(account_id, folder.to_string()))
            .copied()
    }

    /// Reads of `folder` fail from now on.
    pub fn break_folder(&self, folder: &str) {
        self.broken.lock().unwrap().insert(folder.to_string());
    }

    /// Runs `change` right before the next compare-and-set, as if another
    /// writer got there first.
    pub fn interfere_once(&self, change: impl FnOnce(&mut Folders) + Send + 'static) {
        *self.interference.lock().unwrap() = Some(Box::new(change));
    }

    pub fn cas_calls(&self) -> usize {
        self.cas_calls.load(Ordering::SeqCst)
    }

    pub fn syncing_checks(&self) -> usize {
        self.syncing_checks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StatusStore for FakeStatusStore {
    async fn list_active_accounts(&self) -> Result<Vec<Account>, StoreError> {
        let mut accounts: Vec<Account> = self
            .accounts
            .iter()
            .filter(|account| account.is_active)
            .cloned()
            .collect();
        accounts.sort_by_key(|account| account.id);
        Ok(accounts)
    }

    async fn folder_sync_info(
        &self,
        account_id: i64,
        folder: &str,
    ) -> Result<Option<SyncingInfo>, StoreError> {
        if self.broken.lock().unwrap().contains(folder) {
            return Err(StoreError::InvalidStatus(format!("unreadable {folder}")));
        }
        Ok(self.get(account_id, folder).map(|status| SyncingInfo {
            status,
            sync_host: None,
            sync_pid: None,
        }))
    }

    async fn is_account_syncing(&self, account_id: i64) -> Result<bool, StoreError> {
        self.syncing_checks.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .folders
            .lock()
            .unwrap()
            .iter()
            .any(|((id, _), status)| *id == account_id && status.is_syncing()))
    }

    async fn update_folder_status(
        &self,
        account_id: i64,
        folder: &str,
        status: FolderSyncStatus,
    ) -> Result<(), StoreError> {
        self.set(account_id, folder, status);
        Ok(())
    }

    async fn compare_and_set_status(
        &self,
        account_id: i64,
        folder: &str,
        expected: FolderSyncStatus,
        new: FolderSyncStatus,
    ) -> Result<bool, StoreError> {
        self.cas_calls.fetch_add(1, Ordering::SeqCst);
        let interference = self.interference.lock().unwrap().take();
        let mut folders = self.folders.lock().unwrap();
        if let Some(change) = interference {
            change(&mut folders);
        }
        match folders.get_mut(&(account_id, folder.to_string())) {
            Some(current) if *current == expected => {
                *current = new;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_folder_names(&self, account_id: i64) -> Result<Vec<String>, StoreError> {
        let mut names: Vec<String> = self
            .folders
            .lock()
            .unwrap()
            .keys()
            .filter(|(id, _)| *id == account_id)
            .map(|(_, name)| name.clone())
            .collect();
        names.sort();
        Ok(names)
    }
}

/// Records every request; runs block until released when gated.
#[derive(Default)]
pub struct RecordingRunner {
    requests: Mutex<Vec<SyncRequest>>,
    gate: Option<Semaphore>,
    fail: bool,
}

impl RecordingRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn gated() -> Arc<Self> {
        Arc::new(Self {
            gate: Some(Semaphore::new(0)),
            ..Self::default()
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Self::default()
        })
    }

    pub fn release(&self, runs: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(runs);
        }
    }

    pub fn requests(&self) -> Vec<SyncRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn runs(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub async fn wait_for_runs(&self, runs: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while self.runs() < runs {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }
}

#[async_trait]
impl SyncRunner for RecordingRunner {
    async fn run(&self, request: &SyncRequest) -> Result<(), InvokerError> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        if self.fail {
            return Err(InvokerError::Exit { code: Some(2) });
        }
        Ok(())
    }
}
