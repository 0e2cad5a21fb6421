use std::sync::Arc;

use futures_util::future::join_all;
use imapwatch_core::Account;
use thiserror::Error;
use tokio::task::JoinHandle;

use super::policy::ReconnectPolicy;
use super::supervisor::{BoxError, ConnectError, Resource, SupervisedConnection};

#[derive(Debug, Error)]
#[error("{operation}: {} of {total} connection(s) failed", .failures.len())]
pub struct AggregateError {
    pub operation: &'static str,
    pub total: usize,
    pub failures: Vec<BoxError>,
}

/// One supervised connection per active account.
pub struct ConnectionPool<R: Resource> {
    policy: ReconnectPolicy,
    connections: Vec<Arc<SupervisedConnection<R>>>,
    supervisors: Vec<JoinHandle<()>>,
}

impl<R: Resource> ConnectionPool<R> {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            connections: Vec::new(),
            supervisors: Vec::new(),
        }
    }

    pub fn connections(&self) -> &[Arc<SupervisedConnection<R>>] {
        &self.connections
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Connects every active account concurrently and waits for all of them.
    /// Any failure fails the whole call; every connection stays in the pool so
    /// `disconnect_all` can release them, also when this future is dropped.
    pub async fn connect_all<M, E>(
        &mut self,
        accounts: &[Arc<Account>],
        make_resource: M,
        on_error: E,
    ) -> Result<(), AggregateError>
    where
        M: Fn(Arc<Account>) -> R,
        E: Fn(ConnectError) + Clone + Send + Sync + 'static,
    {
        let added: Vec<_> = accounts
            .iter()
            .filter(|account| account.is_active)
            .map(|account| {
                Arc::new(SupervisedConnection::new(
                    make_resource(Arc::clone(account)),
                    self.policy,
                ))
            })
            .collect();
        tracing::info!(
            accounts = accounts.len(),
            active = added.len(),
            "connecting accounts"
        );

        // Pooled before connecting so a cancelled call still leaves them to
        // `disconnect_all`.
        self.connections.extend(added.iter().cloned());
        let results = join_all(added.iter().map(|connection| connection.connect())).await;
        for connection in &added {
            self.supervisors.push(connection.supervise(on_error.clone()));
        }

        let total = results.len();
        let failures: Vec<BoxError> = results
            .into_iter()
            .filter_map(|result| result.err())
            .map(|err| Box::new(err) as BoxError)
            .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(AggregateError {
                operation: "connect",
                total,
                failures,
            })
        }
    }

    /// Closes every connection concurrently. Errors are collected rather than
    /// stopping at the first one, and a second call is harmless.
    pub async fn disconnect_all(&mut self) -> Result<(), AggregateError> {
        for supervisor in self.supervisors.drain(..) {
            supervisor.abort();
        }
        let results = join_all(self.connections.iter().map(|connection| connection.close())).await;
        let total = results.len();
        let failures: Vec<BoxError> = results
            .into_iter()
            .filter_map(|result| result.err())
            .map(|err| Box::new(err) as BoxError)
            .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(AggregateError {
                operation: "disconnect",
                total,
                failures,
            })
        }
    }
}
