mod database;
#[cfg(test)]
pub(crate) mod fake_imap;
mod imap;
mod policy;
mod pool;
mod supervisor;

pub use database::DatabaseResource;
pub use imap::{AccountEvent, ImapHandle, ImapResource, WATCHED_MAILBOX};
pub use policy::{DEFAULT_ATTEMPT_TIMEOUT, DEFAULT_MAX_ATTEMPTS, ReconnectPolicy};
pub use pool::{AggregateError, ConnectionPool};
pub use supervisor::{
    AsyncFault, BoxError, CloseError, ConnectError, ConnectionLink, ConnectionState, Resource,
    SupervisedConnection,
};
