//! A thin client over the transport chain.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use openwire_core::commands::{
    ConnectionId, ConnectionInfo, ConsumerId, ConsumerInfo, Destination, Message, MessageAck,
    MessageDispatch, MessageId, ProducerId, ProducerInfo, RemoveInfo, SessionId, SessionInfo,
    ShutdownInfo,
};
use openwire_core::{Command, OpenWireError, Result};
use tokio::sync::broadcast;
use url::Url;
use uuid::Uuid;

use crate::config::{ClientConfig, TransportConfig};
use crate::transport::{
    FailoverEvent, FailoverTransport, ResponseCorrelator, TcpTransport, Transport,
    TransportFactory, TransportListener,
};

const EVENT_CHANNEL_CAPACITY: usize = 256;
/// How long `close` waits for the broker to acknowledge the connection removal.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Something that happened on the client's connection.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// A command that is not a response, such as a `MessageDispatch` or a
    /// `ConnectionControl`.
    Command(Command),
    /// The connection was lost; failover is reconnecting.
    Interrupted,
    /// The connection was re-established and its state restored.
    Resumed,
    /// The connection failed for good.
    Failed {
        /// Description of the error.
        error: String,
    },
}

/// A connection to a broker with the transport chain assembled from a
/// [`ClientConfig`].
///
/// The chain is a [`ResponseCorrelator`] over either a [`TcpTransport`] or a
/// [`FailoverTransport`]. Connect registers a `ConnectionInfo`; sessions,
/// producers and consumers are registered with their own info commands, and
/// with failover they are restored after every reconnect.
///
/// # Example
///
/// ```no_run
/// use openwire_client::{ClientConfig, OpenWireClient};
/// use openwire_core::commands::{Destination, Message};
///
/// # async fn example() -> openwire_core::Result<()> {
/// let config = ClientConfig::builder()
///     .broker_uri("failover:(tcp://localhost:61616)")
///     .build()?;
/// let client = OpenWireClient::connect(config).await?;
/// let session = client.create_session().await?;
/// let producer = client.create_producer(&session, None).await?;
/// client.send(&producer, Destination::queue("orders"), Message::text("hello")).await?;
/// client.close().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct OpenWireClient {
    config: ClientConfig,
    correlator: ResponseCorrelator,
    failover: Option<Arc<FailoverTransport>>,
    connection_id: ConnectionId,
    next_session_id: AtomicI64,
    next_producer_id: AtomicI64,
    next_consumer_id: AtomicI64,
    next_message_sequence: AtomicI64,
    events: broadcast::Sender<ClientEvent>,
}

impl OpenWireClient {
    /// Connects over TCP as described by `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport cannot be started or the broker
    /// rejects the connection.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let (transport, failover) = match config.transport() {
            TransportConfig::Tcp(tcp) => {
                let tcp = TcpTransport::connect(tcp.clone()).await?;
                (Arc::new(tcp) as Arc<dyn Transport>, None)
            }
            TransportConfig::Failover(failover) => {
                let failover = Arc::new(FailoverTransport::tcp(failover.clone()));
                (failover.clone() as Arc<dyn Transport>, Some(failover))
            }
        };
        Self::start(config, transport, failover).await
    }

    /// Connects using `factory` to open every broker connection.
    pub async fn connect_with_factory(
        config: ClientConfig,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<Self> {
        let (transport, failover) = match config.transport() {
            TransportConfig::Tcp(tcp) => {
                let uri = Url::parse(&tcp.uri())
                    .map_err(|e| OpenWireError::Configuration(e.to_string()))?;
                (factory.connect(&uri).await?, None)
            }
            TransportConfig::Failover(failover) => {
                let failover = Arc::new(FailoverTransport::new(failover.clone(), factory));
                (failover.clone() as Arc<dyn Transport>, Some(failover))
            }
        };
        Self::start(config, transport, failover).await
    }

    async fn start(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        failover: Option<Arc<FailoverTransport>>,
    ) -> Result<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let correlator = ResponseCorrelator::new(transport);
        correlator.add_transport_listener(Arc::new(ClientListener {
            events: events.clone(),
        }));

        let connection_id = ConnectionId::new(format!("ID:{}", Uuid::new_v4()));
        let client = Self {
            config,
            correlator,
            failover,
            connection_id,
            next_session_id: AtomicI64::new(1),
            next_producer_id: AtomicI64::new(1),
            next_consumer_id: AtomicI64::new(1),
            next_message_sequence: AtomicI64::new(1),
            events,
        };

        client.correlator.start().await?;
        let mut info = ConnectionInfo::new(client.connection_id.clone());
        info.client_id = Some(
            client
                .config
                .client_id()
                .map_or_else(|| client.connection_id.to_string(), str::to_string),
        );
        info.user_name = client.config.user_name().map(str::to_string);
        info.password = client.config.password().map(str::to_string);
        if let Err(e) = client.request(info.into()).await {
            let _ = client.correlator.close().await;
            return Err(e);
        }

        tracing::info!(
            connection_id = %client.connection_id,
            broker = ?client.correlator.remote_address(),
            "connected to broker"
        );
        Ok(client)
    }

    /// Returns the client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The id this client registered its connection under.
    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    /// Returns true while a broker connection is up.
    pub fn is_connected(&self) -> bool {
        self.correlator.is_connected()
    }

    /// The broker currently connected to.
    pub fn remote_address(&self) -> Option<String> {
        self.correlator.remote_address()
    }

    /// Subscribes to inbound commands and connection events.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Subscribes to reconnect events. `None` without failover.
    pub fn subscribe_failover(&self) -> Option<broadcast::Receiver<FailoverEvent>> {
        self.failover.as_ref().map(|f| f.subscribe())
    }

    /// Sends `command` and waits up to the configured request timeout for its
    /// response.
    pub async fn request(&self, command: Command) -> Result<Command> {
        self.correlator
            .request_timeout(command, self.config.request_timeout())
            .await
    }

    /// Sends `command` without waiting for a response.
    pub async fn oneway(&self, command: Command) -> Result<()> {
        self.correlator.oneway(command).await
    }

    /// Opens a session.
    pub async fn create_session(&self) -> Result<SessionId> {
        let id = SessionId::new(
            self.connection_id.to_string(),
            self.next_session_id.fetch_add(1, Ordering::Relaxed),
        );
        self.request(SessionInfo::new(id.clone()).into()).await?;
        Ok(id)
    }

    /// Registers a producer in `session`, optionally bound to `destination`.
    pub async fn create_producer(
        &self,
        session: &SessionId,
        destination: Option<Destination>,
    ) -> Result<ProducerId> {
        let id = ProducerId::new(
            self.connection_id.to_string(),
            self.next_producer_id.fetch_add(1, Ordering::Relaxed),
            session.value,
        );
        self.request(ProducerInfo::new(id.clone(), destination).into())
            .await?;
        Ok(id)
    }

    /// Registers a consumer on `destination`. Dispatched messages arrive as
    /// [`ClientEvent::Command`].
    pub async fn create_consumer(
        &self,
        session: &SessionId,
        destination: Destination,
        prefetch_size: Option<i32>,
    ) -> Result<ConsumerId> {
        let id = ConsumerId::new(
            self.connection_id.to_string(),
            session.value,
            self.next_consumer_id.fetch_add(1, Ordering::Relaxed),
        );
        let mut info = ConsumerInfo::new(id.clone(), destination);
        if let Some(prefetch) = prefetch_size {
            info.prefetch_size = prefetch;
        }
        self.request(info.into()).await?;
        Ok(id)
    }

    /// Unregisters a session, producer or consumer.
    pub async fn remove(&self, id: impl Into<Command>) -> Result<()> {
        self.request(RemoveInfo::new(id).into()).await.map(drop)
    }

    /// Sends `message` to `destination` as `producer` and waits for the
    /// broker to accept it.
    pub async fn send(
        &self,
        producer: &ProducerId,
        destination: Destination,
        mut message: Message,
    ) -> Result<()> {
        let sequence = self.next_message_sequence.fetch_add(1, Ordering::Relaxed);
        message.producer_id = Some(producer.clone());
        message.message_id = Some(MessageId::new(producer.clone(), sequence));
        message.destination = Some(destination);
        if message.timestamp == 0 {
            message.timestamp = now_millis();
        }
        self.request(message.into()).await.map(drop)
    }

    /// Acknowledges a dispatched message.
    pub async fn acknowledge(&self, dispatch: &MessageDispatch) -> Result<()> {
        let message_id = dispatch.message.as_ref().and_then(|m| m.message_id.clone());
        let ack = MessageAck {
            destination: dispatch.destination.clone(),
            consumer_id: dispatch.consumer_id.clone(),
            ack_type: MessageAck::STANDARD_ACK_TYPE,
            first_message_id: message_id.clone(),
            last_message_id: message_id,
            message_count: 1,
            ..MessageAck::default()
        };
        self.oneway(ack.into()).await
    }

    /// Removes the connection from the broker and closes the transport.
    ///
    /// Failures while telling the broker are logged and ignored.
    pub async fn close(&self) -> Result<()> {
        tracing::info!(connection_id = %self.connection_id, "closing connection");
        if self.correlator.is_connected() {
            let remove = RemoveInfo::new(self.connection_id.clone()).into();
            if let Err(e) = self.correlator.request_timeout(remove, CLOSE_TIMEOUT).await {
                tracing::debug!(error = %e, "broker did not acknowledge connection removal");
            }
            if let Err(e) = self.correlator.oneway(ShutdownInfo::default().into()).await {
                tracing::debug!(error = %e, "failed to send shutdown");
            }
        }
        self.correlator.close().await
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}

struct ClientListener {
    events: broadcast::Sender<ClientEvent>,
}

impl ClientListener {
    fn emit(&self, event: ClientEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

impl TransportListener for ClientListener {
    fn on_command(&self, command: Command) {
        self.emit(ClientEvent::Command(command));
    }

    fn on_exception(&self, error: OpenWireError) {
        tracing::error!(error = %error, "connection failed");
        self.emit(ClientEvent::Failed {
            error: error.to_string(),
        });
    }

    fn transport_interrupted(&self) {
        self.emit(ClientEvent::Interrupted);
    }

    fn transport_resumed(&self) {
        self.emit(ClientEvent::Resumed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<OpenWireClient>();
    }

    #[test]
    fn test_now_millis_is_positive() {
        assert!(now_millis() > 0);
    }
}
