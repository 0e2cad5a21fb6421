use super::store::StoreError;

/// Persisted synchronization state of one folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FolderSyncStatus {
    NotSynced,
    Syncing,
    SyncingNeedResync,
    SyncedNeedResync,
    Synced,
    Error,
}

impl FolderSyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FolderSyncStatus::NotSynced => "not_synced",
            FolderSyncStatus::Syncing => "syncing",
            FolderSyncStatus::SyncingNeedResync => "syncing_need_resync",
            FolderSyncStatus::SyncedNeedResync => "synced_need_resync",
            FolderSyncStatus::Synced => "synced",
            FolderSyncStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "not_synced" => Ok(FolderSyncStatus::NotSynced),
            "syncing" => Ok(FolderSyncStatus::Syncing),
            "syncing_need_resync" => Ok(FolderSyncStatus::SyncingNeedResync),
            "synced_need_resync" => Ok(FolderSyncStatus::SyncedNeedResync),
            "synced" => Ok(FolderSyncStatus::Synced),
            "error" => Ok(FolderSyncStatus::Error),
            other => Err(StoreError::InvalidStatus(other.to_string())),
        }
    }

    /// A worker currently owns the folder.
    pub fn is_syncing(&self) -> bool {
        matches!(
            self,
            FolderSyncStatus::Syncing | FolderSyncStatus::SyncingNeedResync
        )
    }

    /// The marker to record when a change arrives while the account is busy.
    /// `None` means the status is left as it is.
    pub fn resync_marker(&self) -> Option<FolderSyncStatus> {
        match self {
            FolderSyncStatus::Synced => Some(FolderSyncStatus::SyncedNeedResync),
            FolderSyncStatus::Syncing => Some(FolderSyncStatus::SyncingNeedResync),
            _ => None,
        }
    }
}

impl std::fmt::Display for FolderSyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncingInfo {
    pub status: FolderSyncStatus,
    pub sync_host: Option<String>,
    pub sync_pid: Option<i64>,
}
