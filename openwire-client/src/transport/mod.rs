//! The transport chain: a TCP transport at the bottom, optionally wrapped by
//! the failover transport, with the response correlator on top.
//!
//! Every layer implements [`Transport`] and reports inbound traffic to the
//! layer above through a [`TransportListener`].

mod correlator;
mod failover;
pub mod mock;
mod tcp;

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use openwire_core::{Command, OpenWireError, Result};
use url::Url;

pub use correlator::ResponseCorrelator;
pub use failover::{reconnect_delay, FailoverEvent, FailoverState, FailoverTransport};
pub use tcp::{TcpTransport, TcpTransportFactory};

/// One link in the transport chain.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Starts the transport. Commands may only be sent once this returns.
    async fn start(&self) -> Result<()>;

    /// Sends a command without waiting for a response.
    async fn oneway(&self, command: Command) -> Result<()>;

    /// Stops the transport and releases its connection.
    async fn close(&self) -> Result<()>;

    /// Registers a listener for inbound commands and transport events.
    fn add_transport_listener(&self, listener: Arc<dyn TransportListener>);

    /// The address of the peer, if connected.
    fn remote_address(&self) -> Option<String>;

    /// Returns true while the transport can carry commands.
    fn is_connected(&self) -> bool;
}

/// Receives what a [`Transport`] reads from the wire.
///
/// Callbacks run on the transport's reader task and must not block.
pub trait TransportListener: Send + Sync {
    /// A command arrived.
    fn on_command(&self, command: Command);

    /// The transport failed and will not deliver further commands.
    fn on_exception(&self, error: OpenWireError);

    /// The connection was lost and a reconnect is under way.
    fn transport_interrupted(&self) {}

    /// A reconnect completed and state has been restored.
    fn transport_resumed(&self) {}
}

/// Creates unstarted transports for a URI.
#[async_trait]
pub trait TransportFactory: Send + Sync + fmt::Debug {
    /// Connects to `uri`. The returned transport has not been started.
    async fn connect(&self, uri: &Url) -> Result<Arc<dyn Transport>>;
}

/// The set of listeners registered on one transport.
#[derive(Default)]
pub(crate) struct Listeners {
    inner: RwLock<Vec<Arc<dyn TransportListener>>>,
}

impl fmt::Debug for Listeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners")
            .field("count", &self.snapshot().len())
            .finish()
    }
}

impl Listeners {
    pub(crate) fn add(&self, listener: Arc<dyn TransportListener>) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    fn snapshot(&self) -> Vec<Arc<dyn TransportListener>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn on_command(&self, command: Command) {
        let listeners = self.snapshot();
        let Some((last, rest)) = listeners.split_last() else {
            tracing::trace!(command = command.type_name(), "no listener for inbound command");
            return;
        };
        for listener in rest {
            listener.on_command(command.clone());
        }
        last.on_command(command);
    }

    pub(crate) fn on_exception(&self, error: OpenWireError) {
        for listener in self.snapshot() {
            listener.on_exception(error.clone());
        }
    }

    pub(crate) fn transport_interrupted(&self) {
        for listener in self.snapshot() {
            listener.transport_interrupted();
        }
    }

    pub(crate) fn transport_resumed(&self) {
        for listener in self.snapshot() {
            listener.transport_resumed();
        }
    }
}
