mod engine;
mod invoker;
mod router;
mod status;
mod store;
#[cfg(test)]
mod test_support;

pub use engine::{BatchReport, FolderFailure, FolderOutcome, ResyncEngine, ResyncError};
pub use invoker::{
    InvokeOutcome, InvokerError, ProcessSyncRunner, SyncInvoker, SyncRequest, SyncRunner,
};
pub use router::EventRouter;
pub use status::{FolderSyncStatus, SyncingInfo};
pub use store::{SqliteStatusStore, StatusStore, StoreError};
