//! Failover across a list of candidate brokers.
//!
//! [`FailoverTransport`] keeps at most one live transport, reconnects in a
//! background task when it is lost, and rebuilds the connection's broker-side
//! state on the new transport before any new traffic is let through.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use openwire_core::commands::{ConnectionControl, MessageDispatch, Response};
use openwire_core::{Command, OpenWireError, Result};
use rand::seq::SliceRandom;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::instrument;
use url::Url;

use super::{Listeners, TcpTransportFactory, Transport, TransportFactory, TransportListener};
use crate::config::FailoverConfig;
use crate::state::ConnectionStateTracker;

const EVENT_CHANNEL_CAPACITY: usize = 64;
/// Upper bound on how often the backup pool is topped up.
const MAX_BACKUP_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// Lifecycle of a [`FailoverTransport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverState {
    /// Created but not started.
    Disconnected,
    /// Looking for a broker.
    Connecting,
    /// A transport is published and carrying traffic.
    Connected,
    /// The transport was lost; a reconnect is pending.
    Interrupted,
    /// Reconnect attempts are exhausted. Terminal.
    Failed,
    /// Closed by the owner. Terminal.
    Closed,
}

/// Events emitted as the failover transport connects and reconnects.
#[derive(Debug, Clone)]
pub enum FailoverEvent {
    /// The first connection was established.
    Connected {
        /// The broker connected to.
        uri: Url,
    },
    /// The connected transport failed.
    Interrupted {
        /// The broker that was lost.
        uri: Url,
        /// Why it was lost.
        error: String,
    },
    /// A connect attempt is about to be made.
    ReconnectAttempt {
        /// The broker being tried.
        uri: Url,
        /// The connect pass this attempt belongs to, starting at 1.
        attempt: u32,
    },
    /// Reconnect attempts are exhausted.
    ReconnectFailed {
        /// Number of failed connect passes.
        attempts: u32,
        /// The error from the last attempt.
        error: String,
    },
    /// A connection was re-established and state restored.
    Resumed {
        /// The broker connected to.
        uri: Url,
    },
}

/// Returns the delay before reconnect pass `attempt` (1-based).
///
/// With exponential backoff this is
/// `min(initial * multiplier^(attempt - 1), max)`, otherwise the initial delay.
pub fn reconnect_delay(config: &FailoverConfig, attempt: u32) -> Duration {
    let initial = config.initial_reconnect_delay();
    let max = config.max_reconnect_delay();
    if !config.use_exponential_back_off() {
        return initial.min(max);
    }
    let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
    let millis = initial.as_millis() as f64 * config.back_off_multiplier().powi(exponent);
    if !millis.is_finite() || millis >= max.as_millis() as f64 {
        max
    } else {
        Duration::from_millis(millis as u64)
    }
}

/// A transport that hides broker failures from the layers above.
///
/// Sends while connected go straight to the live transport. Commands that
/// create broker-side state are recorded in a [`ConnectionStateTracker`];
/// other commands that need a response are kept until the response arrives.
/// After a reconnect the new transport first receives a fault tolerant
/// `ConnectionControl`, then the tracked state in its original order, then the
/// unanswered requests in command id order, and only then is it published.
/// A send rejected by a transport that is still connected is returned to the
/// caller as is.
///
/// Delivery is at least once: a request that reached the old broker may be
/// sent again to the new one.
pub struct FailoverTransport {
    inner: Arc<FailoverInner>,
}

struct FailoverInner {
    config: FailoverConfig,
    factory: Arc<dyn TransportFactory>,
    shared: Mutex<FailoverShared>,
    state_tx: watch::Sender<FailoverState>,
    events: broadcast::Sender<FailoverEvent>,
    listeners: Listeners,
    wake: Notify,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct ActiveTransport {
    transport: Arc<dyn Transport>,
    uri: Url,
    id: u64,
    priority: bool,
}

/// A response-required command sent on the current connection.
///
/// Removals already applied to the tracked state have nothing left to
/// restore, so they are answered locally when the connection drops instead
/// of being resent.
struct InFlight {
    command: Command,
    replay: bool,
}

struct FailoverShared {
    state: FailoverState,
    connected: Option<ActiveTransport>,
    activating: Option<u64>,
    backups: Vec<ActiveTransport>,
    updated_uris: Vec<Url>,
    tracker: ConnectionStateTracker,
    in_flight: BTreeMap<i32, InFlight>,
    failure: Option<OpenWireError>,
    failures: u32,
    ever_connected: bool,
    rebalance: bool,
    next_transport_id: u64,
}

impl fmt::Debug for FailoverTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.inner.lock();
        f.debug_struct("FailoverTransport")
            .field("state", &shared.state)
            .field("connected", &shared.connected.as_ref().map(|a| a.uri.as_str()))
            .field("backups", &shared.backups.len())
            .field("in_flight", &shared.in_flight.len())
            .finish()
    }
}

impl FailoverTransport {
    /// Creates a failover transport that opens connections through `factory`.
    pub fn new(config: FailoverConfig, factory: Arc<dyn TransportFactory>) -> Self {
        let (state_tx, _) = watch::channel(FailoverState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(FailoverInner {
                config,
                factory,
                shared: Mutex::new(FailoverShared {
                    state: FailoverState::Disconnected,
                    connected: None,
                    activating: None,
                    backups: Vec::new(),
                    updated_uris: Vec::new(),
                    tracker: ConnectionStateTracker::new(),
                    in_flight: BTreeMap::new(),
                    failure: None,
                    failures: 0,
                    ever_connected: false,
                    rebalance: false,
                    next_transport_id: 0,
                }),
                state_tx,
                events,
                listeners: Listeners::default(),
                wake: Notify::new(),
                task: Mutex::new(None),
            }),
        }
    }

    /// Creates a failover transport over TCP connections.
    pub fn tcp(config: FailoverConfig) -> Self {
        Self::new(config, Arc::new(TcpTransportFactory::new()))
    }

    /// The configuration this transport was created with.
    pub fn config(&self) -> &FailoverConfig {
        &self.inner.config
    }

    /// The current state.
    pub fn state(&self) -> FailoverState {
        self.inner.lock().state
    }

    /// Watches state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<FailoverState> {
        self.inner.state_tx.subscribe()
    }

    /// Subscribes to connection events.
    pub fn subscribe(&self) -> broadcast::Receiver<FailoverEvent> {
        self.inner.events.subscribe()
    }

    /// The broker currently connected to.
    pub fn connected_uri(&self) -> Option<Url> {
        self.inner.lock().connected.as_ref().map(|a| a.uri.clone())
    }

    /// Number of pre-connected backup transports.
    pub fn backup_count(&self) -> usize {
        self.inner.lock().backups.len()
    }

    /// Number of sent requests still waiting for their response.
    pub fn in_flight_count(&self) -> usize {
        self.inner.lock().in_flight.len()
    }

    /// Waits until the transport reaches `state` or `timeout` elapses.
    /// Returns true if the state was reached.
    pub async fn wait_for_state(&self, state: FailoverState, timeout: Duration) -> bool {
        let mut rx = self.subscribe_state();
        tokio::time::timeout(timeout, rx.wait_for(|s| *s == state))
            .await
            .is_ok_and(|r| r.is_ok())
    }
}

impl Drop for FailoverTransport {
    fn drop(&mut self) {
        if let Some(task) = self.inner.task().take() {
            task.abort();
        }
    }
}

#[async_trait]
impl Transport for FailoverTransport {
    async fn start(&self) -> Result<()> {
        {
            let mut shared = self.inner.lock();
            match shared.state {
                FailoverState::Closed => return Err(closed_error()),
                FailoverState::Disconnected => self.inner.set_state(&mut shared, FailoverState::Connecting),
                _ => return Ok(()),
            }
        }

        tracing::debug!(uris = self.inner.config.uris().len(), "starting failover transport");
        let task = tokio::spawn(reconnect_loop(Arc::clone(&self.inner)));
        *self.inner.task() = Some(task);
        Ok(())
    }

    async fn oneway(&self, command: Command) -> Result<()> {
        let inner = &self.inner;
        let deadline = inner.config.timeout().map(|t| Instant::now() + t);

        loop {
            let active = {
                let mut shared = inner.lock();
                match shared.state {
                    FailoverState::Closed => return Err(closed_error()),
                    FailoverState::Failed => return Err(shared.failure_error()),
                    _ => {}
                }

                let connected = shared
                    .connected
                    .as_ref()
                    .map(|a| (Arc::clone(&a.transport), a.id));
                match connected {
                    Some(active) => {
                        let tracked = shared.tracker.track(&command);
                        let removal =
                            matches!(command, Command::RemoveInfo(_) | Command::ShutdownInfo(_));
                        if command.is_response_required() && (!tracked || removal) {
                            shared.in_flight.insert(
                                command.command_id(),
                                InFlight {
                                    command: command.clone(),
                                    replay: !tracked,
                                },
                            );
                        }
                        Some((active, tracked))
                    }
                    None => {
                        if let Some(local) = inner.answer_locally(&mut shared, &command) {
                            drop(shared);
                            if let Some(reply) = local {
                                inner.listeners.on_command(reply);
                            }
                            return Ok(());
                        }
                        if shared.state == FailoverState::Disconnected {
                            return Err(OpenWireError::Connection(
                                "failover transport has not been started".to_string(),
                            ));
                        }
                        None
                    }
                }
            };

            match active {
                Some(((transport, id), tracked)) => {
                    let command_id = command.command_id();
                    match transport.oneway(command.clone()).await {
                        Ok(()) => return Ok(()),
                        Err(e) if transport.is_connected() => {
                            tracing::debug!(command_id, error = %e, "command rejected by the transport");
                            inner.lock().in_flight.remove(&command_id);
                            return Err(e);
                        }
                        Err(e) => {
                            tracing::debug!(command_id, error = %e, "send failed, waiting for reconnect");
                            inner.handle_transport_failure(id, e);
                            if tracked || inner.lock().in_flight.contains_key(&command_id) {
                                return Ok(());
                            }
                        }
                    }
                }
                None => inner.wait_for_connection(deadline).await?,
            }
        }
    }

    #[instrument(name = "failover.close", skip(self))]
    async fn close(&self) -> Result<()> {
        let (active, backups) = {
            let mut shared = self.inner.lock();
            if shared.state == FailoverState::Closed {
                return Ok(());
            }
            self.inner.set_state(&mut shared, FailoverState::Closed);
            shared.activating = None;
            (shared.connected.take(), std::mem::take(&mut shared.backups))
        };

        if let Some(task) = self.inner.task().take() {
            task.abort();
        }
        for transport in active.into_iter().chain(backups) {
            close_quietly(transport.transport).await;
        }
        tracing::debug!("failover transport closed");
        Ok(())
    }

    fn add_transport_listener(&self, listener: Arc<dyn TransportListener>) {
        self.inner.listeners.add(listener);
    }

    fn remote_address(&self) -> Option<String> {
        self.connected_uri().map(String::from)
    }

    fn is_connected(&self) -> bool {
        self.state() == FailoverState::Connected
    }
}

fn closed_error() -> OpenWireError {
    OpenWireError::Closed("failover transport is closed".to_string())
}

async fn close_quietly(transport: Arc<dyn Transport>) {
    if let Err(e) = transport.close().await {
        tracing::debug!(error = %e, "error closing transport");
    }
}

impl FailoverShared {
    fn failure_error(&self) -> OpenWireError {
        self.failure.clone().unwrap_or_else(|| {
            OpenWireError::Connection("failover transport has failed".to_string())
        })
    }
}

impl FailoverInner {
    fn lock(&self) -> MutexGuard<'_, FailoverShared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, shared: &mut FailoverShared, state: FailoverState) {
        if shared.state != state {
            tracing::trace!(from = ?shared.state, to = ?state, "failover state change");
            shared.state = state;
            self.state_tx.send_replace(state);
        }
    }

    fn emit(&self, event: FailoverEvent) {
        // Nobody may be subscribed.
        let _ = self.events.send(event);
    }

    fn backups_enabled(&self) -> bool {
        self.config.backup() || self.config.priority_backup()
    }

    fn backup_refresh_interval(&self) -> Duration {
        self.config
            .max_reconnect_delay()
            .min(MAX_BACKUP_REFRESH_INTERVAL)
    }

    /// Handles a command that can be completed without a transport.
    ///
    /// Returns `None` if the command has to wait for a connection, otherwise
    /// the reply to deliver to the listeners, if any.
    fn answer_locally(
        &self,
        shared: &mut FailoverShared,
        command: &Command,
    ) -> Option<Option<Command>> {
        match command {
            Command::ShutdownInfo(_) => {
                tracing::debug!("dropping shutdown info while disconnected");
                Some(None)
            }
            Command::RemoveInfo(_) | Command::MessageAck(_) => {
                shared.tracker.track(command);
                Some(
                    command
                        .is_response_required()
                        .then(|| Response::for_request(command.command_id()).into()),
                )
            }
            Command::MessagePull(pull) if pull.timeout != 0 => Some(Some(
                MessageDispatch::empty(pull.consumer_id.clone(), pull.destination.clone()).into(),
            )),
            _ => None,
        }
    }

    async fn wait_for_connection(&self, deadline: Option<Instant>) -> Result<()> {
        let mut rx = self.state_tx.subscribe();
        let wait = async {
            loop {
                let state = *rx.borrow_and_update();
                match state {
                    FailoverState::Connected => return Ok(()),
                    FailoverState::Failed => return Err(self.lock().failure_error()),
                    FailoverState::Closed => return Err(closed_error()),
                    _ => {}
                }
                if rx.changed().await.is_err() {
                    return Err(closed_error());
                }
            }
        };

        match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, wait).await.map_err(|_| {
                OpenWireError::Timeout(format!(
                    "no broker connection within {:?}",
                    self.config.timeout().unwrap_or_default()
                ))
            })?,
            None => wait.await,
        }
    }

    /// The brokers to try, in order: broker-supplied URIs first, then the
    /// configured ones, shuffled if requested, with priority brokers moved to
    /// the front when priority backup is on.
    fn candidates(&self, shared: &FailoverShared, shuffle: bool) -> Vec<Url> {
        let mut candidates = shared.updated_uris.clone();
        for uri in self.config.uris() {
            if !candidates.contains(uri) {
                candidates.push(uri.clone());
            }
        }
        if shuffle && self.config.randomize() {
            candidates.shuffle(&mut rand::thread_rng());
        }
        if self.config.priority_backup() {
            candidates.sort_by_key(|uri| !self.config.is_priority(uri));
        }
        candidates
    }

    fn register(self: &Arc<Self>, transport: &Arc<dyn Transport>) -> u64 {
        let id = {
            let mut shared = self.lock();
            shared.next_transport_id += 1;
            shared.next_transport_id
        };
        transport.add_transport_listener(Arc::new(FailoverListener {
            inner: Arc::downgrade(self),
            transport_id: id,
        }));
        id
    }

    /// Routes a command read from transport `transport_id`. Returns the
    /// command if it should reach the listeners.
    fn handle_inbound(&self, transport_id: u64, command: Command) -> Option<Command> {
        let mut shared = self.lock();
        let current = shared.connected.as_ref().map(|a| a.id);
        if current != Some(transport_id) && shared.activating != Some(transport_id) {
            tracing::trace!(
                transport_id,
                command = command.type_name(),
                "ignoring command from inactive transport"
            );
            return None;
        }

        if let Some(correlation_id) = command.correlation_id() {
            shared.in_flight.remove(&correlation_id);
        }

        if let Command::ConnectionControl(control) = &command {
            if self.apply_connection_control(&mut shared, control) {
                self.wake.notify_one();
            }
        }
        Some(command)
    }

    /// Applies broker instructions. Returns true if the reconnect task has
    /// work to do.
    fn apply_connection_control(
        &self,
        shared: &mut FailoverShared,
        control: &ConnectionControl,
    ) -> bool {
        let mut wake = false;

        if let Some(target) = control.reconnect_to.as_deref().map(str::trim) {
            if !target.is_empty() && self.config.reconnect_supported() {
                match Url::parse(target) {
                    Ok(uri) => {
                        tracing::info!(uri = %uri, "broker requested reconnect");
                        shared.updated_uris.retain(|u| *u != uri);
                        shared.updated_uris.insert(0, uri);
                        shared.rebalance = true;
                        wake = true;
                    }
                    Err(e) => tracing::warn!(uri = target, error = %e, "ignoring invalid reconnect URI"),
                }
            }
        }

        let brokers = control.connected_broker_uris();
        if !brokers.is_empty() && self.config.update_uris_supported() {
            let uris: Vec<Url> = brokers
                .iter()
                .filter_map(|uri| match Url::parse(uri) {
                    Ok(uri) => Some(uri),
                    Err(e) => {
                        tracing::warn!(uri = %uri, error = %e, "ignoring invalid broker URI");
                        None
                    }
                })
                .collect();
            tracing::debug!(count = uris.len(), "broker updated the candidate list");
            shared.updated_uris = uris;
            if control.rebalance_connection {
                shared.rebalance = true;
            }
            wake = true;
        }

        wake
    }

    /// Reacts to the loss of transport `transport_id`.
    fn handle_transport_failure(self: &Arc<Self>, transport_id: u64, error: OpenWireError) {
        let (lost, dead_backup, answered) = {
            let mut shared = self.lock();
            if let Some(pos) = shared.backups.iter().position(|b| b.id == transport_id) {
                (None, Some(shared.backups.remove(pos)), Vec::new())
            } else if shared.connected.as_ref().map(|a| a.id) == Some(transport_id)
                && !matches!(shared.state, FailoverState::Closed | FailoverState::Failed)
            {
                let lost = shared.connected.take();
                self.set_state(&mut shared, FailoverState::Interrupted);
                let mut answered = Vec::new();
                shared.in_flight.retain(|command_id, pending| {
                    if !pending.replay {
                        answered.push(*command_id);
                    }
                    pending.replay
                });
                (lost, None, answered)
            } else {
                (None, None, Vec::new())
            }
        };

        if let Some(backup) = dead_backup {
            tracing::debug!(uri = %backup.uri, error = %error, "backup transport failed");
            tokio::spawn(close_quietly(backup.transport));
            self.wake.notify_one();
            return;
        }

        let Some(lost) = lost else {
            return;
        };
        tracing::warn!(uri = %lost.uri, error = %error, "transport interrupted");
        self.emit(FailoverEvent::Interrupted {
            uri: lost.uri.clone(),
            error: error.to_string(),
        });
        self.listeners.transport_interrupted();
        for command_id in answered {
            tracing::debug!(command_id, "answering tracked request locally");
            self.listeners.on_command(Response::for_request(command_id).into());
        }
        tokio::spawn(close_quietly(lost.transport));
        self.wake.notify_one();
    }

    /// One reconnect cycle: use a backup if there is one, otherwise wait out
    /// the backoff and try every candidate once.
    #[instrument(name = "failover.reconnect", skip(self))]
    async fn reconnect(self: &Arc<Self>) {
        let failures = {
            let mut shared = self.lock();
            if matches!(
                shared.state,
                FailoverState::Closed | FailoverState::Failed | FailoverState::Connected
            ) {
                return;
            }
            self.set_state(&mut shared, FailoverState::Connecting);
            shared.failures
        };

        if self.try_backup().await {
            return;
        }

        if failures > 0 {
            let delay = reconnect_delay(&self.config, failures);
            tracing::debug!(attempt = failures + 1, delay = ?delay, "waiting before reconnect");
            tokio::time::sleep(delay).await;
        }

        let candidates = {
            let shared = self.lock();
            self.candidates(&shared, true)
        };
        let mut last_error = None;
        for uri in candidates {
            if self.lock().state != FailoverState::Connecting {
                return;
            }
            self.emit(FailoverEvent::ReconnectAttempt {
                uri: uri.clone(),
                attempt: failures + 1,
            });
            match self.connect_to(&uri).await {
                Ok(()) => return,
                Err(e) => {
                    tracing::warn!(uri = %uri, attempt = failures + 1, error = %e, "connection attempt failed");
                    last_error = Some(e);
                }
            }
        }

        let error = last_error
            .unwrap_or_else(|| OpenWireError::Connection("no broker URIs to try".to_string()));
        let exhausted = {
            let mut shared = self.lock();
            if shared.state != FailoverState::Connecting {
                return;
            }
            shared.failures += 1;
            let limit = self.config.reconnect_attempt_limit(!shared.ever_connected);
            let exhausted = limit >= 0 && i64::from(shared.failures) >= i64::from(limit);
            if exhausted {
                let failure = OpenWireError::Connection(format!(
                    "failed to connect after {} attempts: {}",
                    shared.failures, error
                ));
                shared.failure = Some(failure.clone());
                self.set_state(&mut shared, FailoverState::Failed);
                Some((shared.failures, failure))
            } else {
                None
            }
        };

        if let Some((attempts, failure)) = exhausted {
            tracing::error!(attempts, error = %failure, "giving up on reconnecting");
            self.emit(FailoverEvent::ReconnectFailed {
                attempts,
                error: failure.to_string(),
            });
            self.listeners.on_exception(failure);
        }
    }

    /// Connects to `uri` and, on success, makes it the published transport.
    #[instrument(name = "failover.connect", skip_all, fields(uri = %uri))]
    async fn connect_to(self: &Arc<Self>, uri: &Url) -> Result<()> {
        let transport = self.factory.connect(uri).await?;
        let id = self.register(&transport);
        if let Err(e) = transport.start().await {
            close_quietly(transport).await;
            return Err(e);
        }
        self.activate(transport, uri.clone(), id).await
    }

    /// Restores state on a started transport and publishes it.
    async fn activate(
        self: &Arc<Self>,
        transport: Arc<dyn Transport>,
        uri: Url,
        id: u64,
    ) -> Result<()> {
        let replay = {
            let mut shared = self.lock();
            if shared.state == FailoverState::Closed {
                None
            } else {
                shared.activating = Some(id);
                Some(shared.ever_connected.then(|| {
                    (
                        shared.tracker.restore_commands(),
                        shared
                            .in_flight
                            .values()
                            .filter(|pending| pending.replay)
                            .map(|pending| pending.command.clone())
                            .collect::<Vec<_>>(),
                    )
                }))
            }
        };
        let Some(replay) = replay else {
            close_quietly(transport).await;
            return Err(closed_error());
        };

        if let Some((state, in_flight)) = replay {
            if let Err(e) = restore(&transport, &uri, state, in_flight).await {
                self.lock().activating = None;
                close_quietly(transport).await;
                return Err(e);
            }
        }

        let resumed = {
            let mut shared = self.lock();
            shared.activating = None;
            if shared.state == FailoverState::Closed {
                None
            } else if !transport.is_connected() {
                Some(Err(OpenWireError::Connection(format!(
                    "{} was lost while restoring state",
                    uri
                ))))
            } else {
                shared.connected = Some(ActiveTransport {
                    transport: Arc::clone(&transport),
                    uri: uri.clone(),
                    id,
                    priority: self.config.is_priority(&uri),
                });
                shared.failures = 0;
                let resumed = std::mem::replace(&mut shared.ever_connected, true);
                self.set_state(&mut shared, FailoverState::Connected);
                Some(Ok(resumed))
            }
        };

        match resumed {
            None => {
                close_quietly(transport).await;
                Err(closed_error())
            }
            Some(Err(e)) => {
                close_quietly(transport).await;
                Err(e)
            }
            Some(Ok(resumed)) => {
                if resumed {
                    tracing::info!(uri = %uri, "connection resumed");
                    self.emit(FailoverEvent::Resumed { uri });
                } else {
                    tracing::info!(uri = %uri, "connected");
                    self.emit(FailoverEvent::Connected { uri });
                }
                self.listeners.transport_resumed();
                self.wake.notify_one();
                Ok(())
            }
        }
    }

    /// Publishes a pooled backup in place of the lost transport.
    async fn try_backup(self: &Arc<Self>) -> bool {
        loop {
            let backup = {
                let mut shared = self.lock();
                let position = if self.config.priority_backup() {
                    shared
                        .backups
                        .iter()
                        .position(|b| b.priority)
                        .or_else(|| (!shared.backups.is_empty()).then_some(0))
                } else {
                    (!shared.backups.is_empty()).then_some(0)
                };
                position.map(|p| shared.backups.remove(p))
            };
            let Some(backup) = backup else {
                return false;
            };

            if !backup.transport.is_connected() {
                close_quietly(backup.transport).await;
                continue;
            }
            tracing::debug!(uri = %backup.uri, "using backup transport");
            match self
                .activate(Arc::clone(&backup.transport), backup.uri.clone(), backup.id)
                .await
            {
                Ok(()) => return true,
                Err(e) => {
                    tracing::warn!(uri = %backup.uri, error = %e, "backup transport unusable")
                }
            }
        }
    }

    /// Opens backups until the pool is full or no candidate is left.
    async fn refresh_backups(self: &Arc<Self>) {
        let mut tried: Vec<Url> = Vec::new();
        loop {
            let next = {
                let shared = self.lock();
                if shared.state != FailoverState::Connected
                    || shared.backups.len() >= self.config.backup_pool_size()
                {
                    return;
                }
                let connected = shared.connected.as_ref().map(|a| &a.uri);
                let next = self.candidates(&shared, false).into_iter().find(|uri| {
                    Some(uri) != connected
                        && !shared.backups.iter().any(|b| b.uri == *uri)
                        && !tried.contains(uri)
                });
                next
            };
            let Some(uri) = next else {
                return;
            };
            tried.push(uri.clone());

            let transport = match self.factory.connect(&uri).await {
                Ok(transport) => transport,
                Err(e) => {
                    tracing::debug!(uri = %uri, error = %e, "backup connection failed");
                    continue;
                }
            };
            let id = self.register(&transport);
            if let Err(e) = transport.start().await {
                tracing::debug!(uri = %uri, error = %e, "backup transport failed to start");
                close_quietly(transport).await;
                continue;
            }

            let rejected = {
                let mut shared = self.lock();
                if shared.state == FailoverState::Closed {
                    Some(transport)
                } else {
                    tracing::debug!(uri = %uri, "backup transport ready");
                    let priority = self.config.is_priority(&uri);
                    shared.backups.push(ActiveTransport {
                        transport,
                        uri,
                        id,
                        priority,
                    });
                    None
                }
            };
            if let Some(transport) = rejected {
                close_quietly(transport).await;
                return;
            }
        }
    }

    /// Moves from a non-priority broker to a pooled priority backup.
    async fn switch_to_priority_backup(self: &Arc<Self>) -> bool {
        if !self.config.priority_backup() {
            return false;
        }
        let switch = {
            let mut shared = self.lock();
            let on_priority = shared.connected.as_ref().map_or(true, |a| a.priority);
            let priority_backup = shared.backups.iter().position(|b| b.priority);
            match priority_backup {
                Some(position) if !on_priority && shared.state == FailoverState::Connected => {
                    let backup = shared.backups.remove(position);
                    let old = shared.connected.take();
                    self.set_state(&mut shared, FailoverState::Connecting);
                    Some((backup, old))
                }
                _ => None,
            }
        };
        let Some((backup, old)) = switch else {
            return false;
        };

        tracing::info!(uri = %backup.uri, "switching to priority backup");
        if let Some(old) = old {
            close_quietly(old.transport).await;
        }
        if let Err(e) = self
            .activate(Arc::clone(&backup.transport), backup.uri.clone(), backup.id)
            .await
        {
            tracing::warn!(uri = %backup.uri, error = %e, "priority backup unusable");
        }
        true
    }

    /// Moves to the first candidate if connected elsewhere.
    async fn rebalance(self: &Arc<Self>) {
        let moved = {
            let mut shared = self.lock();
            let target = self.candidates(&shared, false).into_iter().next();
            let current = shared.connected.as_ref().map(|a| a.uri.clone());
            match (current, target) {
                (Some(current), Some(target)) if current != target => {
                    let old = shared.connected.take();
                    self.set_state(&mut shared, FailoverState::Connecting);
                    old.map(|old| (old, target))
                }
                _ => None,
            }
        };
        let Some((old, target)) = moved else {
            return;
        };

        tracing::info!(from = %old.uri, to = %target, "rebalancing connection");
        close_quietly(old.transport).await;
        if let Err(e) = self.connect_to(&target).await {
            tracing::warn!(uri = %target, error = %e, "rebalance target unavailable");
        }
    }
}

/// Replays connection state and unanswered requests on `transport`.
#[instrument(
    name = "failover.restore",
    skip_all,
    fields(uri = %uri, tracked = state.len(), in_flight = in_flight.len())
)]
async fn restore(
    transport: &Arc<dyn Transport>,
    uri: &Url,
    state: Vec<Command>,
    in_flight: Vec<Command>,
) -> Result<()> {
    transport
        .oneway(ConnectionControl::fault_tolerant().into())
        .await?;
    for command in state.into_iter().chain(in_flight) {
        let type_name = command.type_name();
        match transport.oneway(command).await {
            Ok(()) => {}
            Err(e) if transport.is_connected() => {
                tracing::warn!(command = type_name, error = %e, "skipping command that cannot be replayed");
            }
            Err(e) => return Err(e),
        }
    }
    tracing::debug!("state restored");
    Ok(())
}

async fn reconnect_loop(inner: Arc<FailoverInner>) {
    loop {
        let (state, rebalance) = {
            let mut shared = inner.lock();
            (shared.state, std::mem::take(&mut shared.rebalance))
        };

        match state {
            FailoverState::Closed | FailoverState::Failed => return,
            FailoverState::Connected => {
                if rebalance {
                    inner.rebalance().await;
                    continue;
                }
                if inner.backups_enabled() {
                    inner.refresh_backups().await;
                    if inner.switch_to_priority_backup().await {
                        continue;
                    }
                    tokio::select! {
                        _ = inner.wake.notified() => {}
                        _ = tokio::time::sleep(inner.backup_refresh_interval()) => {}
                    }
                } else {
                    inner.wake.notified().await;
                }
            }
            FailoverState::Disconnected | FailoverState::Connecting | FailoverState::Interrupted => {
                inner.reconnect().await;
            }
        }
    }
}

struct FailoverListener {
    inner: Weak<FailoverInner>,
    transport_id: u64,
}

impl TransportListener for FailoverListener {
    fn on_command(&self, command: Command) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        if let Some(command) = inner.handle_inbound(self.transport_id, command) {
            inner.listeners.on_command(command);
        }
    }

    fn on_exception(&self, error: OpenWireError) {
        if let Some(inner) = self.inner.upgrade() {
            inner.handle_transport_failure(self.transport_id, error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FailoverConfigBuilder;
    use crate::transport::mock::MockTransportFactory;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn backoff_config() -> FailoverConfig {
        FailoverConfig::builder()
            .add_uri(url("tcp://a:1"))
            .initial_reconnect_delay(Duration::from_millis(10))
            .back_off_multiplier(2.0)
            .max_reconnect_delay(Duration::from_millis(1000))
            .build()
            .unwrap()
    }

    #[test]
    fn test_reconnect_delay_grows_and_caps() {
        let config = backoff_config();
        let delays: Vec<u64> = (1..=9)
            .map(|k| reconnect_delay(&config, k).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![10, 20, 40, 80, 160, 320, 640, 1000, 1000]);
        assert_eq!(reconnect_delay(&config, 500), Duration::from_millis(1000));
        assert_eq!(reconnect_delay(&config, 0), Duration::from_millis(10));
    }

    #[test]
    fn test_reconnect_delay_without_backoff() {
        let config = FailoverConfigBuilder::from(backoff_config())
            .use_exponential_back_off(false)
            .build()
            .unwrap();
        assert_eq!(reconnect_delay(&config, 1), Duration::from_millis(10));
        assert_eq!(reconnect_delay(&config, 7), Duration::from_millis(10));
    }

    fn transport(config: FailoverConfig) -> FailoverTransport {
        FailoverTransport::new(config, Arc::new(MockTransportFactory::new()))
    }

    #[test]
    fn test_candidates_put_updates_first_without_duplicates() {
        let config = FailoverConfig::from_uri("failover:(tcp://a:1,tcp://b:1)?randomize=false")
            .unwrap();
        let failover = transport(config);
        let mut shared = failover.inner.lock();
        shared.updated_uris = vec![url("tcp://c:1"), url("tcp://b:1")];
        assert_eq!(
            failover.inner.candidates(&shared, true),
            vec![url("tcp://c:1"), url("tcp://b:1"), url("tcp://a:1")]
        );
    }

    #[test]
    fn test_candidates_put_priority_first() {
        let config = FailoverConfig::from_uri(
            "failover:(tcp://a:1,tcp://b:1,tcp://c:1)?priorityBackup=true&priorityURIs=tcp://c:1",
        )
        .unwrap();
        let failover = transport(config);
        let shared = failover.inner.lock();
        for _ in 0..10 {
            let candidates = failover.inner.candidates(&shared, true);
            assert_eq!(candidates[0], url("tcp://c:1"));
            assert_eq!(candidates.len(), 3);
        }
    }

    #[test]
    fn test_connection_control_updates_candidates() {
        let config = FailoverConfig::from_uri("failover:(tcp://a:1)?randomize=false").unwrap();
        let failover = transport(config);
        let inner = &failover.inner;
        let mut shared = inner.lock();

        let control = ConnectionControl {
            connected_brokers: Some("tcp://b:1,tcp://c:1".to_string()),
            ..ConnectionControl::default()
        };
        assert!(inner.apply_connection_control(&mut shared, &control));
        assert!(!shared.rebalance);

        let control = ConnectionControl {
            reconnect_to: Some("tcp://d:1".to_string()),
            ..ConnectionControl::default()
        };
        assert!(inner.apply_connection_control(&mut shared, &control));
        assert!(shared.rebalance);
        assert_eq!(
            inner.candidates(&shared, false),
            vec![url("tcp://d:1"), url("tcp://b:1"), url("tcp://c:1"), url("tcp://a:1")]
        );
    }

    #[test]
    fn test_connection_control_respects_flags() {
        let config = FailoverConfig::from_uri(
            "failover:(tcp://a:1)?updateURIsSupported=false&reconnectSupported=false",
        )
        .unwrap();
        let failover = transport(config);
        let inner = &failover.inner;
        let mut shared = inner.lock();

        let control = ConnectionControl {
            connected_brokers: Some("tcp://b:1".to_string()),
            reconnect_to: Some("tcp://d:1".to_string()),
            rebalance_connection: true,
            ..ConnectionControl::default()
        };
        assert!(!inner.apply_connection_control(&mut shared, &control));
        assert!(shared.updated_uris.is_empty());
        assert!(!shared.rebalance);
    }

    #[tokio::test]
    async fn test_unstarted_transport_rejects_sends() {
        let failover = transport(backoff_config());
        let err = failover
            .oneway(openwire_core::commands::KeepAliveInfo::default().into())
            .await
            .unwrap_err();
        assert!(matches!(err, OpenWireError::Connection(_)));
        assert_eq!(failover.state(), FailoverState::Disconnected);
    }
}
