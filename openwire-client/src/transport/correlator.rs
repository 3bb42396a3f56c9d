//! Matches responses to the requests that caused them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use openwire_core::{Command, OpenWireError, Result};
use tokio::sync::oneshot;
use tracing::instrument;

use super::{Listeners, Transport, TransportListener};

type Waiter = oneshot::Sender<Result<Command>>;

/// Top of the transport chain: assigns command ids and turns request/response
/// pairs into a single awaited call.
///
/// Non-response commands read from the layer below are passed on to this
/// correlator's own listeners. Once the layer below reports an exception, or
/// the correlator is closed, every outstanding request fails and later calls
/// fail immediately with the same error.
#[derive(Debug)]
pub struct ResponseCorrelator {
    inner: Arc<CorrelatorInner>,
}

#[derive(Debug)]
struct CorrelatorInner {
    next: Arc<dyn Transport>,
    next_command_id: AtomicI32,
    pending: Mutex<HashMap<i32, Waiter>>,
    failure: Mutex<Option<OpenWireError>>,
    listeners: Listeners,
}

/// Removes a request's entry when its caller stops waiting.
struct PendingGuard<'a> {
    inner: &'a CorrelatorInner,
    command_id: i32,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.inner.pending().remove(&self.command_id);
    }
}

impl ResponseCorrelator {
    /// Wraps `next` and registers for its inbound traffic.
    pub fn new(next: Arc<dyn Transport>) -> Self {
        let inner = Arc::new(CorrelatorInner {
            next: Arc::clone(&next),
            next_command_id: AtomicI32::new(1),
            pending: Mutex::new(HashMap::new()),
            failure: Mutex::new(None),
            listeners: Listeners::default(),
        });
        next.add_transport_listener(Arc::new(CorrelatorListener {
            inner: Arc::downgrade(&inner),
        }));
        Self { inner }
    }

    /// The transport this correlator sends through.
    pub fn next(&self) -> &Arc<dyn Transport> {
        &self.inner.next
    }

    /// Number of requests still waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.inner.pending().len()
    }

    /// Sends `command` as a request and waits for its response.
    ///
    /// An `ExceptionResponse` is returned as [`OpenWireError::Broker`].
    #[instrument(
        name = "correlator.request",
        skip(self, command),
        fields(command = command.type_name())
    )]
    pub async fn request(&self, mut command: Command) -> Result<Command> {
        let inner = &self.inner;
        inner.check_failure()?;

        let command_id = inner.next_id();
        command.set_command_id(command_id);
        command.set_response_required(true);

        let (tx, rx) = oneshot::channel();
        inner.pending().insert(command_id, tx);
        let _guard = PendingGuard {
            inner,
            command_id,
        };
        inner.check_failure()?;

        tracing::trace!(command_id, "sending request");
        inner.next.oneway(command).await?;

        match rx.await {
            Ok(Ok(Command::ExceptionResponse(response))) => Err(response.to_error()),
            Ok(result) => result,
            Err(_) => Err(OpenWireError::Closed(
                "response correlator dropped the request".to_string(),
            )),
        }
    }

    /// Like [`request`](Self::request), failing with
    /// [`OpenWireError::Timeout`] if no response arrives within `timeout`.
    pub async fn request_timeout(&self, command: Command, timeout: Duration) -> Result<Command> {
        tokio::time::timeout(timeout, self.request(command))
            .await
            .map_err(|_| OpenWireError::Timeout(format!("no response within {:?}", timeout)))?
    }
}

#[async_trait]
impl Transport for ResponseCorrelator {
    async fn start(&self) -> Result<()> {
        self.inner.next.start().await
    }

    async fn oneway(&self, mut command: Command) -> Result<()> {
        self.inner.check_failure()?;
        command.set_command_id(self.inner.next_id());
        command.set_response_required(false);
        self.inner.next.oneway(command).await
    }

    #[instrument(name = "correlator.close", skip(self))]
    async fn close(&self) -> Result<()> {
        self.inner
            .fail_all(OpenWireError::Closed("response correlator closed".to_string()));
        self.inner.next.close().await
    }

    fn add_transport_listener(&self, listener: Arc<dyn TransportListener>) {
        self.inner.listeners.add(listener);
    }

    fn remote_address(&self) -> Option<String> {
        self.inner.next.remote_address()
    }

    fn is_connected(&self) -> bool {
        self.inner.next.is_connected()
    }
}

impl CorrelatorInner {
    fn pending(&self) -> MutexGuard<'_, HashMap<i32, Waiter>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> i32 {
        self.next_command_id.fetch_add(1, Ordering::Relaxed)
    }

    fn check_failure(&self) -> Result<()> {
        match &*self.failure.lock().unwrap_or_else(PoisonError::into_inner) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    /// Records the first failure and fails every outstanding request with it.
    fn fail_all(&self, error: OpenWireError) {
        let error = self
            .failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert(error)
            .clone();

        let waiters: Vec<Waiter> = self.pending().drain().map(|(_, tx)| tx).collect();
        if !waiters.is_empty() {
            tracing::debug!(count = waiters.len(), error = %error, "failing pending requests");
        }
        for waiter in waiters {
            let _ = waiter.send(Err(error.clone()));
        }
    }
}

struct CorrelatorListener {
    inner: Weak<CorrelatorInner>,
}

impl TransportListener for CorrelatorListener {
    fn on_command(&self, command: Command) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };

        let Some(correlation_id) = command.correlation_id() else {
            inner.listeners.on_command(command);
            return;
        };

        let waiter = inner.pending().remove(&correlation_id);
        match waiter {
            Some(waiter) => {
                if waiter.send(Ok(command)).is_err() {
                    tracing::trace!(correlation_id, "requester gave up before the response");
                }
            }
            None => tracing::warn!(
                correlation_id,
                response = command.type_name(),
                "dropping response with no pending request"
            ),
        }
    }

    fn on_exception(&self, error: OpenWireError) {
        if let Some(inner) = self.inner.upgrade() {
            inner.fail_all(error.clone());
            inner.listeners.on_exception(error);
        }
    }

    fn transport_interrupted(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.listeners.transport_interrupted();
        }
    }

    fn transport_resumed(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.listeners.transport_resumed();
        }
    }
}
