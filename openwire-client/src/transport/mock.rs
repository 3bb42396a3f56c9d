//! In-memory transports for exercising the transport chain without a broker.
//!
//! [`MockTransportFactory`] hands out [`MockTransport`]s and can mark URIs as
//! unreachable, which is enough to drive the failover state machine through
//! connect, interruption, replay and exhaustion.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use openwire_core::commands::Response;
use openwire_core::{Command, OpenWireError, Result};
use tokio::sync::mpsc;
use url::Url;

use super::{Listeners, Transport, TransportFactory, TransportListener};

/// A transport that records what it is sent.
///
/// With auto-respond on (the default), every command that requires a
/// response is answered with a plain `Response` before `oneway` returns.
#[derive(Debug)]
pub struct MockTransport {
    uri: Url,
    sent: Mutex<Vec<Command>>,
    listeners: Listeners,
    connected: AtomicBool,
    closed: AtomicBool,
    auto_respond: AtomicBool,
}

impl MockTransport {
    /// Creates an unstarted transport for `uri`.
    pub fn new(uri: Url) -> Self {
        Self {
            uri,
            sent: Mutex::new(Vec::new()),
            listeners: Listeners::default(),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            auto_respond: AtomicBool::new(true),
        }
    }

    /// The URI this transport was created for.
    pub fn uri(&self) -> &Url {
        &self.uri
    }

    /// Everything sent so far, in order.
    pub fn sent(&self) -> Vec<Command> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Turns automatic responses on or off.
    pub fn set_auto_respond(&self, enabled: bool) {
        self.auto_respond.store(enabled, Ordering::SeqCst);
    }

    /// Delivers `command` to the listeners as if it had been read.
    pub fn inject(&self, command: Command) {
        self.listeners.on_command(command);
    }

    /// Breaks the transport and reports `error` to the listeners.
    pub fn fail(&self, error: OpenWireError) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.listeners.on_exception(error);
        }
    }

    /// Returns true once `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn start(&self) -> Result<()> {
        if self.is_closed() {
            return Err(OpenWireError::Closed(format!(
                "mock transport to {} is closed",
                self.uri
            )));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn oneway(&self, command: Command) -> Result<()> {
        if !self.is_connected() {
            return Err(OpenWireError::Connection(format!(
                "mock transport to {} is not connected",
                self.uri
            )));
        }

        let respond_to = (self.auto_respond.load(Ordering::SeqCst)
            && command.is_response_required())
        .then(|| command.command_id());
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(command);

        if let Some(id) = respond_to {
            self.listeners.on_command(Response::for_request(id).into());
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn add_transport_listener(&self, listener: Arc<dyn TransportListener>) {
        self.listeners.add(listener);
    }

    fn remote_address(&self) -> Option<String> {
        self.is_connected().then(|| self.uri.to_string())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Creates [`MockTransport`]s and records every connect attempt.
#[derive(Debug, Default)]
pub struct MockTransportFactory {
    unavailable: Mutex<HashSet<String>>,
    attempts: Mutex<Vec<Url>>,
    transports: Mutex<Vec<Arc<MockTransport>>>,
    manual_responses: AtomicBool,
}

impl MockTransportFactory {
    /// Creates a factory for which every URI is reachable.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes connects to `uri` succeed or fail.
    pub fn set_available(&self, uri: &str, available: bool) {
        let mut unavailable = self
            .unavailable
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if available {
            unavailable.remove(uri);
        } else {
            unavailable.insert(uri.to_string());
        }
    }

    /// Controls auto-respond on transports created from now on.
    pub fn set_auto_respond(&self, enabled: bool) {
        self.manual_responses.store(!enabled, Ordering::SeqCst);
    }

    /// Every URI a connect was attempted for, in order.
    pub fn attempts(&self) -> Vec<Url> {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Every transport created, in order.
    pub fn transports(&self) -> Vec<Arc<MockTransport>> {
        self.transports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The transports created for `uri`.
    pub fn transports_for(&self, uri: &str) -> Vec<Arc<MockTransport>> {
        self.transports()
            .into_iter()
            .filter(|t| t.uri().as_str() == uri)
            .collect()
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn connect(&self, uri: &Url) -> Result<Arc<dyn Transport>> {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(uri.clone());

        let reachable = !self
            .unavailable
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(uri.as_str());
        if !reachable {
            return Err(OpenWireError::Connection(format!(
                "connection refused: {}",
                uri
            )));
        }

        let transport = Arc::new(MockTransport::new(uri.clone()));
        transport.set_auto_respond(!self.manual_responses.load(Ordering::SeqCst));
        self.transports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&transport));
        Ok(transport as Arc<dyn Transport>)
    }
}

/// What a [`RecordingListener`] observed.
#[derive(Debug, Clone)]
pub enum ListenerEvent {
    /// `on_command`.
    Command(Command),
    /// `on_exception`.
    Exception(OpenWireError),
    /// `transport_interrupted`.
    Interrupted,
    /// `transport_resumed`.
    Resumed,
}

/// A listener that forwards every callback into a channel.
#[derive(Debug)]
pub struct RecordingListener {
    events: mpsc::UnboundedSender<ListenerEvent>,
}

impl RecordingListener {
    /// Creates a listener and the receiving end of its events.
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<ListenerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { events }), rx)
    }

    fn record(&self, event: ListenerEvent) {
        // The receiver may already be gone at teardown.
        let _ = self.events.send(event);
    }
}

impl TransportListener for RecordingListener {
    fn on_command(&self, command: Command) {
        self.record(ListenerEvent::Command(command));
    }

    fn on_exception(&self, error: OpenWireError) {
        self.record(ListenerEvent::Exception(error));
    }

    fn transport_interrupted(&self) {
        self.record(ListenerEvent::Interrupted);
    }

    fn transport_resumed(&self) {
        self.record(ListenerEvent::Resumed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openwire_core::commands::{SessionId, SessionInfo};

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_mock_transport_records_and_responds() {
        let transport = MockTransport::new(url("tcp://a:1"));
        let (listener, mut events) = RecordingListener::channel();
        transport.add_transport_listener(listener);

        let mut info: Command = SessionInfo::new(SessionId::new("ID:c", 1)).into();
        assert!(transport.oneway(info.clone()).await.is_err());

        transport.start().await.unwrap();
        info.set_command_id(4);
        info.set_response_required(true);
        transport.oneway(info.clone()).await.unwrap();

        assert_eq!(transport.sent(), vec![info]);
        match events.try_recv().unwrap() {
            ListenerEvent::Command(c) => assert_eq!(c.correlation_id(), Some(4)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fail_reports_once() {
        let transport = MockTransport::new(url("tcp://a:1"));
        let (listener, mut events) = RecordingListener::channel();
        transport.add_transport_listener(listener);
        transport.start().await.unwrap();

        transport.fail(OpenWireError::Connection("reset".into()));
        transport.fail(OpenWireError::Connection("reset".into()));
        assert!(matches!(events.try_recv(), Ok(ListenerEvent::Exception(_))));
        assert!(events.try_recv().is_err());
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_factory_availability() {
        let factory = MockTransportFactory::new();
        factory.set_available("tcp://a:1", false);

        assert!(factory.connect(&url("tcp://a:1")).await.is_err());
        assert!(factory.connect(&url("tcp://b:1")).await.is_ok());

        factory.set_available("tcp://a:1", true);
        assert!(factory.connect(&url("tcp://a:1")).await.is_ok());

        assert_eq!(factory.attempts().len(), 3);
        assert_eq!(factory.transports().len(), 2);
        assert_eq!(factory.transports_for("tcp://a:1").len(), 1);
    }
}
