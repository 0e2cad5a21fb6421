use std::str::FromStr;

use async_trait::async_trait;
use sqlx::SqlitePool;
use sqlx::sqlite::SqliteConnectOptions;

use super::supervisor::{ConnectionLink, Resource};
use crate::sync::{SqliteStatusStore, StoreError};

/// The shared status database, opened through the supervised lifecycle so
/// that startup gets the same bounded retry as the IMAP connections.
pub struct DatabaseResource {
    url: String,
}

impl DatabaseResource {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Resource for DatabaseResource {
    type Handle = SqliteStatusStore;
    type Error = StoreError;

    fn label(&self) -> &str {
        "database"
    }

    async fn open(&self) -> Result<SqliteStatusStore, StoreError> {
        let options = SqliteConnectOptions::from_str(&self.url)?.create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        Ok(SqliteStatusStore::from_pool(pool))
    }

    async fn on_connected(
        &self,
        store: &SqliteStatusStore,
        _link: ConnectionLink,
    ) -> Result<(), StoreError> {
        store.init().await
    }

    async fn close(&self, store: &SqliteStatusStore) -> Result<(), StoreError> {
        store.close().await;
        Ok(())
    }
}
