use async_trait::async_trait;
use imapwatch_core::Account;
use sqlx::{Row, SqlitePool, migrate::Migrator, sqlite::SqliteRow};
use thiserror::Error;

use super::status::{FolderSyncStatus, SyncingInfo};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("invalid sync status: {0}")]
    InvalidStatus(String),
    #[error("invalid account {id}: {reason}")]
    InvalidAccount { id: i64, reason: String },
}

/// Persisted per-folder sync state shared with the sync worker.
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Active accounts ordered by id.
    async fn list_active_accounts(&self) -> Result<Vec<Account>, StoreError>;

    async fn folder_sync_info(
        &self,
        account_id: i64,
        folder: &str,
    ) -> Result<Option<SyncingInfo>, StoreError>;

    /// True when any folder of the account is owned by a worker.
    async fn is_account_syncing(&self, account_id: i64) -> Result<bool, StoreError>;

    async fn update_folder_status(
        &self,
        account_id: i64,
        folder: &str,
        status: FolderSyncStatus,
    ) -> Result<(), StoreError>;

    /// Writes `new` only if the folder still holds `expected`. Returns whether
    /// the write was applied.
    async fn compare_and_set_status(
        &self,
        account_id: i64,
        folder: &str,
        expected: FolderSyncStatus,
        new: FolderSyncStatus,
    ) -> Result<bool, StoreError>;

    async fn list_folder_names(&self, account_id: i64) -> Result<Vec<String>, StoreError>;
}

#[derive(Debug, Clone)]
pub struct SqliteStatusStore {
    pool: SqlitePool,
}

impl SqliteStatusStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn account_from_row(row: &SqliteRow) -> Result<Account, StoreError> {
    let id: i64 = row.try_get("id")?;
    let imap_port: i64 = row.try_get("imap_port")?;
    let smtp_port: Option<i64> = row.try_get("smtp_port")?;
    let is_active: i64 = row.try_get("is_active")?;
    let port = |value: i64, field: &str| {
        u16::try_from(value).map_err(|_| StoreError::InvalidAccount {
            id,
            reason: format!("{field} {value} is out of range"),
        })
    };
    Ok(Account {
        id,
        service: row.try_get("service")?,
        name: row.try_get("name")?,
        email: row.try_get("email")?,
        password: row.try_get("password")?,
        imap_host: row.try_get("imap_host")?,
        imap_port: port(imap_port, "imap_port")?,
        imap_flags: row.try_get("imap_flags")?,
        smtp_host: row.try_get("smtp_host")?,
        smtp_port: smtp_port.map(|value| port(value, "smtp_port")).transpose()?,
        is_active: is_active != 0,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl StatusStore for SqliteStatusStore {
    async fn list_active_accounts(&self) -> Result<Vec<Account>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, service, name, email, password, imap_host, imap_port, imap_flags,
                    smtp_host, smtp_port, is_active, created_at
             FROM accounts WHERE is_active = 1 ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(account_from_row).collect()
    }

    async fn folder_sync_info(
        &self,
        account_id: i64,
        folder: &str,
    ) -> Result<Option<SyncingInfo>, StoreError> {
        let row = sqlx::query(
            "SELECT sync_status, sync_host, sync_pid FROM folders
             WHERE account_id = ? AND name = ?",
        )
        .bind(account_id)
        .bind(folder)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let status: String = row.try_get("sync_status")?;
        Ok(Some(SyncingInfo {
            status: FolderSyncStatus::parse(&status)?,
            sync_host: row.try_get("sync_host")?,
            sync_pid: row.try_get("sync_pid")?,
        }))
    }

    async fn is_account_syncing(&self, account_id: i64) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT EXISTS(
                SELECT 1 FROM folders WHERE account_id = ? AND sync_status IN (?, ?)
             ) AS syncing",
        )
        .bind(account_id)
        .bind(FolderSyncStatus::Syncing.as_str())
        .bind(FolderSyncStatus::SyncingNeedResync.as_str())
        .fetch_one(&self.pool)
        .await?;
        let syncing: i64 = row.try_get("syncing")?;
        Ok(syncing != 0)
    }

    async fn update_folder_status(
        &self,
        account_id: i64,
        folder: &str,
        status: FolderSyncStatus,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE folders SET sync_status = ?, updated_at = CURRENT_TIMESTAMP
             WHERE account_id = ? AND name = ?",
        )
        .bind(status.as_str())
        .bind(account_id)
        .bind(folder)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn compare_and_set_status(
        &self,
        account_id: i64,
        folder: &str,
        expected: FolderSyncStatus,
        new: FolderSyncStatus,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE folders SET sync_status = ?, updated_at = CURRENT_TIMESTAMP
             WHERE account_id = ? AND name = ? AND sync_status = ?",
        )
        .bind(new.as_str())
        .bind(account_id)
        .bind(folder)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_folder_names(&self, account_id: i64) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query("SELECT name FROM folders WHERE account_id = ? ORDER BY name")
            .bind(account_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get("name").map_err(StoreError::from))
            .collect()
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
