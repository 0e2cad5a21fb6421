use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::policy::ReconnectPolicy;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("{label}: giving up after {attempts} attempt(s): {source}")]
    Exhausted {
        label: String,
        attempts: u32,
        #[source]
        source: BoxError,
    },
    #[error("{label}: connection is closed")]
    Closed { label: String },
}

#[derive(Debug, Error)]
#[error("{label}: close failed: {source}")]
pub struct CloseError {
    pub label: String,
    #[source]
    pub source: BoxError,
}

/// A fault reported by a resource after its connection was established.
#[derive(Debug, Clone)]
pub struct AsyncFault {
    generation: u64,
    message: String,
}

impl AsyncFault {
    pub fn message(&self) -> &str {
        &self.message
    }
}

#[derive(Debug, Default)]
struct Liveness {
    generation: AtomicU64,
    ready: AtomicBool,
}

/// Back-channel from one established connection to its supervisor.
///
/// Every successful open gets a new generation; calls made through a link of an
/// older generation are ignored.
#[derive(Debug, Clone)]
pub struct ConnectionLink {
    generation: u64,
    liveness: Arc<Liveness>,
    faults: mpsc::UnboundedSender<AsyncFault>,
}

impl ConnectionLink {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn is_current(&self) -> bool {
        self.liveness.generation.load(Ordering::SeqCst) == self.generation
    }

    /// The supervisor's `connected` flag, as seen by this generation.
    pub fn is_ready(&self) -> bool {
        self.is_current() && self.liveness.ready.load(Ordering::SeqCst)
    }

    pub fn mark_closed(&self) {
        if self.is_current() {
            self.liveness.ready.store(false, Ordering::SeqCst);
        }
    }

    /// Asks the supervisor to run a full reconnect cycle.
    pub fn report_fault(&self, message: impl Into<String>) {
        self.mark_closed();
        let _ = self.faults.send(AsyncFault {
            generation: self.generation,
            message: message.into(),
        });
    }
}

/// Something a [`SupervisedConnection`] can open, activate and close.
#[async_trait]
pub trait Resource: Send + Sync + 'static {
    type Handle: Send + Sync + 'static;
    type Error: std::error::Error + Send + Sync + 'static;

    fn label(&self) -> &str;

    async fn open(&self) -> Result<Self::Handle, Self::Error>;

    /// Attaches listeners to a freshly opened handle. Failing here counts as a
    /// failed connect attempt.
    async fn on_connected(
        &self,
        handle: &Self::Handle,
        link: ConnectionLink,
    ) -> Result<(), Self::Error>;

    async fn close(&self, handle: &Self::Handle) -> Result<(), Self::Error>;
}

pub struct SupervisedConnection<R: Resource> {
    resource: R,
    policy: ReconnectPolicy,
    connect_lock: tokio::sync::Mutex<()>,
    handle: Mutex<Option<Arc<R::Handle>>>,
    state: watch::Sender<ConnectionState>,
    liveness: Arc<Liveness>,
    faults_tx: mpsc::UnboundedSender<AsyncFault>,
    faults_rx: Mutex<Option<mpsc::UnboundedReceiver<AsyncFault>>>,
    closed: CancellationToken,
    connected_at: Mutex<Option<Instant>>,
    // Consecutive connections that faulted inside the stable window.
    short_lived: AtomicU32,
}

impl<R: Resource> SupervisedConnection<R> {
    pub fn new(resource: R, policy: ReconnectPolicy) -> Self {
        let (faults_tx, faults_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            resource,
            policy,
            connect_lock: tokio::sync::Mutex::new(()),
            handle: Mutex::new(None),
            state,
            liveness: Arc::new(Liveness::default()),
            faults_tx,
            faults_rx: Mutex::new(Some(faults_rx)),
            closed: CancellationToken::new(),
            connected_at: Mutex::new(None),
            short_lived: AtomicU32::new(0),
        }
    }

    pub fn resource(&self) -> &R {
        &self.resource
    }

    pub fn label(&self) -> &str {
        self.resource.label()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// True while a handle is held, including the window in which listeners are
    /// still being attached.
    pub fn is_connected(&self) -> bool {
        self.handle_slot().is_some()
    }

    /// True once listeners are attached and events may be trusted.
    pub fn is_ready(&self) -> bool {
        self.liveness.ready.load(Ordering::SeqCst)
    }

    pub fn handle(&self) -> Option<Arc<R::Handle>> {
        self.handle_slot().clone()
    }

    /// Opens the resource, retrying per the policy. Returns the live handle
    /// when the connection is already up.
    pub async fn connect(&self) -> Result<Arc<R::Handle>, ConnectError> {
        let _guard = self.connect_lock.lock().await;
        if self.is_ready()
            && let Some(handle) = self.handle()
        {
            return Ok(handle);
        }
        self.short_lived.store(0, Ordering::SeqCst);
        self.establish(ConnectionState::Connecting).await
    }

    /// Releases the resource and stops any pending or future reconnect.
    /// Closing a connection that holds no handle is a no-op.
    pub async fn close(&self) -> Result<(), CloseError> {
        self.closed.cancel();
        let _guard = self.connect_lock.lock().await;
        self.liveness.ready.store(false, Ordering::SeqCst);
        let handle = self.take_handle();
        self.set_state(ConnectionState::Disconnected);
        let Some(handle) = handle else {
            return Ok(());
        };
        self.resource
            .close(&handle)
            .await
            .map_err(|err| CloseError {
                label: self.label().to_string(),
                source: Box::new(err),
            })?;
        tracing::info!(connection = %self.label(), "disconnected");
        Ok(())
    }

    /// Spawns the task that turns async faults into reconnect cycles. A failed
    /// cycle is handed to `on_error`; the connection is then left `Failed`.
    pub fn supervise<F>(self: &Arc<Self>, on_error: F) -> JoinHandle<()>
    where
        F: Fn(ConnectError) + Send + Sync + 'static,
    {
        let connection = Arc::clone(self);
        tokio::spawn(async move {
            let receiver = connection
                .faults_rx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            let Some(mut faults) = receiver else {
                tracing::warn!(
                    connection = %connection.label(),
                    "connection is already supervised"
                );
                return;
            };
            loop {
                let fault = tokio::select! {
                    fault = faults.recv() => fault,
                    _ = connection.closed.cancelled() => None,
                };
                let Some(fault) = fault else {
                    break;
                };
                match connection.reconnect(fault).await {
                    Ok(()) => {}
                    Err(ConnectError::Closed { .. }) => break,
                    Err(err) => on_error(err),
                }
            }
        })
    }

    async fn reconnect(&self, fault: AsyncFault) -> Result<(), ConnectError> {
        let _guard = self.connect_lock.lock().await;
        if self.closed.is_cancelled() {
            return Err(self.closed_error());
        }
        if fault.generation != self.liveness.generation.load(Ordering::SeqCst) {
            tracing::debug!(
                connection = %self.label(),
                generation = fault.generation,
                "ignoring fault from a replaced connection"
            );
            return Ok(());
        }
        if self.state() == ConnectionState::Failed {
            return Ok(());
        }
        let short_lived = self
            .connected_since()
            .is_some_and(|since| since.elapsed() < self.policy.stable_after());
        let cycles = if short_lived {
            self.short_lived.fetch_add(1, Ordering::SeqCst) + 1
        } else {
            self.short_lived.store(0, Ordering::SeqCst);
            0
        };
        tracing::warn!(
            connection = %self.label(),
            error = %fault.message,
            short_lived = cycles,
            "connection fault, reconnecting"
        );
        self.liveness.ready.store(false, Ordering::SeqCst);
        if let Some(stale) = self.take_handle()
            && let Err(err) = self.resource.close(&stale).await
        {
            tracing::debug!(
                connection = %self.label(),
                error = %err,
                "closing stale handle failed"
            );
        }
        if cycles >= self.policy.max_attempts() {
            self.set_state(ConnectionState::Failed);
            return Err(ConnectError::Exhausted {
                label: self.label().to_string(),
                attempts: cycles,
                source: fault.message.into(),
            });
        }
        if cycles > 0 {
            self.set_state(ConnectionState::Reconnecting);
            tokio::select! {
                _ = tokio::time::sleep(self.policy.delay(cycles)) => {}
                _ = self.closed.cancelled() => {
                    self.set_state(ConnectionState::Disconnected);
                    return Err(self.closed_error());
                }
            }
        }
        self.establish(ConnectionState::Reconnecting).await.map(|_| ())
    }

    async fn establish(&self, initial: ConnectionState) -> Result<Arc<R::Handle>, ConnectError> {
        self.set_state(initial);
        let mut attempts = 0u32;
        loop {
            if self.closed.is_cancelled() {
                self.set_state(ConnectionState::Disconnected);
                return Err(self.closed_error());
            }
            attempts += 1;
            let opened = tokio::select! {
                opened = self.try_open() => opened,
                _ = self.closed.cancelled() => {
                    self.set_state(ConnectionState::Disconnected);
                    return Err(self.closed_error());
                }
            };
            let err = match opened {
                Ok(handle) => {
                    tracing::info!(connection = %self.label(), attempts, "connected");
                    return Ok(handle);
                }
                Err(err) => err,
            };
            tracing::warn!(
                connection = %self.label(),
                attempt = attempts,
                error = %err,
                "connect attempt failed"
            );
            if !self.policy.should_retry(attempts) {
                self.set_state(ConnectionState::Failed);
                return Err(ConnectError::Exhausted {
                    label: self.label().to_string(),
                    attempts,
                    source: Box::new(err),
                });
            }
            tokio::select! {
                _ = tokio::time::sleep(self.policy.delay(attempts)) => {}
                _ = self.closed.cancelled() => {
                    self.set_state(ConnectionState::Disconnected);
                    return Err(self.closed_error());
                }
            }
        }
    }

    async fn try_open(&self) -> Result<Arc<R::Handle>, R::Error> {
        let handle = Arc::new(self.resource.open().await?);
        let generation = self.liveness.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let link = ConnectionLink {
            generation,
            liveness: Arc::clone(&self.liveness),
            faults: self.faults_tx.clone(),
        };
        *self.handle_slot() = Some(Arc::clone(&handle));
        if let Err(err) = self.resource.on_connected(&handle, link).await {
            self.take_handle();
            let _ = self.resource.close(&handle).await;
            return Err(err);
        }
        *self.connected_at_slot() = Some(Instant::now());
        self.liveness.ready.store(true, Ordering::SeqCst);
        self.set_state(ConnectionState::Connected);
        Ok(handle)
    }

    fn connected_since(&self) -> Option<Instant> {
        *self.connected_at_slot()
    }

    fn connected_at_slot(&self) -> MutexGuard<'_, Option<Instant>> {
        self.connected_at.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle_slot(&self) -> MutexGuard<'_, Option<Arc<R::Handle>>> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_handle(&self) -> Option<Arc<R::Handle>> {
        self.handle_slot().take()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn closed_error(&self) -> ConnectError {
        ConnectError::Closed {
            label: self.label().to_string(),
        }
    }
}

#[cfg(test)]
#[path = "supervisor_tests.rs"]
mod tests;
