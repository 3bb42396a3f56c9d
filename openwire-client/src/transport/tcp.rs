//! A single broker connection over TCP.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use openwire_core::commands::KeepAliveInfo;
use openwire_core::{Command, OpenWireCodec, OpenWireError, OpenWireFormat, Result, WireFormatSettings};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::{Decoder, Encoder};
use tracing::instrument;
use url::Url;

use super::{Listeners, Transport, TransportFactory, TransportListener};
use crate::config::TcpTransportConfig;

/// Smallest interval between inactivity checks.
const MIN_CHECK_INTERVAL: Duration = Duration::from_millis(1);

/// One TCP connection carrying OpenWire frames.
///
/// [`start`](Transport::start) exchanges WireFormatInfo with the broker and
/// applies the negotiated settings before any other command is sent. After
/// that a reader task delivers inbound commands to the listeners and, when
/// the negotiated inactivity duration is non-zero, a monitor task writes
/// KeepAliveInfo on an idle connection and fails the transport when the
/// broker goes quiet.
#[derive(Debug)]
pub struct TcpTransport {
    shared: Arc<TcpShared>,
}

#[derive(Debug)]
struct TcpShared {
    config: TcpTransportConfig,
    uri: String,
    peer: Option<SocketAddr>,
    format: Arc<Mutex<OpenWireFormat>>,
    writer: tokio::sync::Mutex<Option<FrameWriter>>,
    reader: Mutex<Option<FrameReader>>,
    listeners: Listeners,
    started: AtomicBool,
    connected: AtomicBool,
    closed: AtomicBool,
    last_read: Mutex<Instant>,
    last_write: Mutex<Instant>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Debug)]
struct FrameWriter {
    stream: OwnedWriteHalf,
    codec: OpenWireCodec,
    buffer: BytesMut,
}

#[derive(Debug)]
struct FrameReader {
    stream: OwnedReadHalf,
    codec: OpenWireCodec,
    buffer: BytesMut,
}

impl FrameReader {
    /// Reads the next command. Returns `None` on a clean end of stream.
    async fn next_command(&mut self, uri: &str) -> Result<Option<Command>> {
        loop {
            if let Some(command) = self.codec.decode(&mut self.buffer)? {
                return Ok(Some(command));
            }

            let bytes_read = self.stream.read_buf(&mut self.buffer).await.map_err(|e| {
                OpenWireError::Connection(format!("failed to read from {}: {}", uri, e))
            })?;

            if bytes_read == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(OpenWireError::Connection(format!(
                    "connection to {} closed in the middle of a frame",
                    uri
                )));
            }
        }
    }
}

impl TcpTransport {
    /// Opens the TCP connection. The transport still has to be started.
    #[instrument(name = "tcp_transport.connect", skip(config), fields(uri = %config.uri()))]
    pub async fn connect(config: TcpTransportConfig) -> Result<Self> {
        let uri = config.uri();
        let stream = tokio::time::timeout(
            config.connection_timeout(),
            TcpStream::connect((config.host(), config.port())),
        )
        .await
        .map_err(|_| {
            OpenWireError::Timeout(format!(
                "connecting to {} timed out after {:?}",
                uri,
                config.connection_timeout()
            ))
        })?
        .map_err(|e| OpenWireError::Connection(format!("failed to connect to {}: {}", uri, e)))?;

        stream.set_nodelay(config.tcp_no_delay()).map_err(|e| {
            OpenWireError::Connection(format!("failed to set TCP_NODELAY: {}", e))
        })?;

        let peer = stream.peer_addr().ok();
        let (read_half, write_half) = stream.into_split();
        let format = Arc::new(Mutex::new(OpenWireFormat::for_negotiation(
            config.wire_format().clone(),
        )));
        let now = Instant::now();

        tracing::debug!(uri = %uri, peer = ?peer, "established tcp connection");

        Ok(Self {
            shared: Arc::new(TcpShared {
                uri,
                peer,
                writer: tokio::sync::Mutex::new(Some(FrameWriter {
                    stream: write_half,
                    codec: OpenWireCodec::with_shared_format(Arc::clone(&format)),
                    buffer: BytesMut::with_capacity(8192),
                })),
                reader: Mutex::new(Some(FrameReader {
                    stream: read_half,
                    codec: OpenWireCodec::with_shared_format(Arc::clone(&format)),
                    buffer: BytesMut::with_capacity(8192),
                })),
                format,
                config,
                listeners: Listeners::default(),
                started: AtomicBool::new(false),
                connected: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                last_read: Mutex::new(now),
                last_write: Mutex::new(now),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    /// The wire format settings currently in force. Before `start` these are
    /// the loose negotiation settings.
    pub fn wire_format(&self) -> WireFormatSettings {
        self.shared.format().settings().clone()
    }

    /// The socket address of the broker.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.peer
    }

    async fn negotiate(&self, reader: &mut FrameReader) -> Result<()> {
        let shared = &self.shared;
        let preferred = shared.format().preferred_wire_format_info()?;
        shared.write(preferred.into()).await?;

        let timeout = shared.config.negotiate_timeout();
        let first = tokio::time::timeout(timeout, reader.next_command(&shared.uri))
            .await
            .map_err(|_| {
                OpenWireError::Timeout(format!(
                    "no wire format info from {} within {:?}",
                    shared.uri, timeout
                ))
            })??;

        match first {
            Some(Command::WireFormatInfo(info)) => shared.format().renegotiate(&info),
            Some(other) => Err(OpenWireError::Protocol(format!(
                "expected WireFormatInfo from {}, got {}",
                shared.uri,
                other.type_name()
            ))),
            None => Err(OpenWireError::Connection(format!(
                "{} closed the connection during negotiation",
                shared.uri
            ))),
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.shared.abort_tasks();
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn start(&self) -> Result<()> {
        let shared = &self.shared;
        if shared.closed.load(Ordering::SeqCst) {
            return Err(shared.closed_error());
        }
        if shared.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut reader = shared
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| shared.closed_error())?;

        if let Err(e) = self.negotiate(&mut reader).await {
            tracing::warn!(uri = %shared.uri, error = %e, "wire format negotiation failed");
            shared.closed.store(true, Ordering::SeqCst);
            shared.shutdown_writer().await;
            return Err(e);
        }

        let settings = shared.format().settings().clone();
        shared.touch_read();
        shared.touch_write();
        shared.connected.store(true, Ordering::SeqCst);

        let mut tasks = vec![tokio::spawn(read_loop(Arc::clone(shared), reader))];
        if !settings.max_inactivity_duration().is_zero() {
            tasks.push(tokio::spawn(monitor_inactivity(
                Arc::clone(shared),
                settings.max_inactivity_duration(),
                settings.max_inactivity_initial_delay(),
            )));
        }
        shared
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(tasks);

        tracing::debug!(
            uri = %shared.uri,
            version = settings.version(),
            tight = settings.tight_encoding_enabled(),
            max_inactivity = ?settings.max_inactivity_duration(),
            "tcp transport started"
        );
        Ok(())
    }

    async fn oneway(&self, command: Command) -> Result<()> {
        let shared = &self.shared;
        if shared.closed.load(Ordering::SeqCst) {
            return Err(shared.closed_error());
        }
        if !shared.connected.load(Ordering::SeqCst) {
            return Err(OpenWireError::Connection(format!(
                "transport to {} is not connected",
                shared.uri
            )));
        }
        shared.write(command).await
    }

    #[instrument(name = "tcp_transport.close", skip(self), fields(uri = %self.shared.uri))]
    async fn close(&self) -> Result<()> {
        let shared = &self.shared;
        if shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        shared.connected.store(false, Ordering::SeqCst);
        shared.abort_tasks();
        shared
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        shared.shutdown_writer().await;
        tracing::debug!("tcp transport closed");
        Ok(())
    }

    fn add_transport_listener(&self, listener: Arc<dyn TransportListener>) {
        self.shared.listeners.add(listener);
    }

    fn remote_address(&self) -> Option<String> {
        self.is_connected().then(|| self.shared.uri.clone())
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }
}

impl TcpShared {
    fn format(&self) -> MutexGuard<'_, OpenWireFormat> {
        self.format.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn closed_error(&self) -> OpenWireError {
        OpenWireError::Closed(format!("transport to {} is closed", self.uri))
    }

    fn touch_read(&self) {
        *self.last_read.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn touch_write(&self) {
        *self.last_write.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn read_idle(&self) -> Duration {
        self.last_read
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    fn write_idle(&self) -> Duration {
        self.last_write
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    /// Encodes and writes one command. Writes are serialized by the writer lock.
    async fn write(&self, command: Command) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| self.closed_error())?;

        writer.buffer.clear();
        writer.codec.encode(command, &mut writer.buffer)?;

        let written = writer.stream.write_all(&writer.buffer).await;
        drop(guard);

        match written {
            Ok(()) => {
                self.touch_write();
                Ok(())
            }
            Err(e) => {
                let error =
                    OpenWireError::Connection(format!("failed to write to {}: {}", self.uri, e));
                self.fail(error.clone());
                Err(error)
            }
        }
    }

    async fn shutdown_writer(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.stream.shutdown().await {
                tracing::debug!(uri = %self.uri, error = %e, "socket shutdown failed");
            }
        }
    }

    /// Marks a started transport as failed and reports it once.
    fn fail(&self, error: OpenWireError) {
        if !self.connected.swap(false, Ordering::SeqCst) || self.closed.load(Ordering::SeqCst) {
            return;
        }
        tracing::warn!(uri = %self.uri, error = %error, "tcp transport failed");
        self.listeners.on_exception(error);
        self.abort_tasks();
    }

    fn abort_tasks(&self) {
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
    }

    async fn dispatch(&self, command: Command) {
        match command {
            Command::KeepAliveInfo(info) => {
                if info.response_required {
                    let reply = KeepAliveInfo {
                        command_id: 0,
                        response_required: false,
                    };
                    if let Err(e) = self.write(reply.into()).await {
                        tracing::debug!(uri = %self.uri, error = %e, "keep alive reply failed");
                    }
                }
            }
            Command::WireFormatInfo(_) => {
                tracing::debug!(uri = %self.uri, "ignoring repeated wire format info");
            }
            command => self.listeners.on_command(command),
        }
    }
}

async fn read_loop(shared: Arc<TcpShared>, mut reader: FrameReader) {
    loop {
        match reader.next_command(&shared.uri).await {
            Ok(Some(command)) => {
                shared.touch_read();
                shared.dispatch(command).await;
            }
            Ok(None) => {
                shared.fail(OpenWireError::Connection(format!(
                    "{} closed the connection",
                    shared.uri
                )));
                return;
            }
            Err(e) => {
                shared.fail(e);
                return;
            }
        }
    }
}

async fn monitor_inactivity(
    shared: Arc<TcpShared>,
    max_inactivity: Duration,
    initial_delay: Duration,
) {
    tokio::time::sleep(initial_delay).await;

    let check_interval = (max_inactivity / 3).max(MIN_CHECK_INTERVAL);
    let mut ticker = tokio::time::interval(check_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if !shared.connected.load(Ordering::SeqCst) {
            return;
        }

        if shared.read_idle() >= max_inactivity {
            shared.fail(OpenWireError::Connection(format!(
                "no data received from {} for {:?}",
                shared.uri, max_inactivity
            )));
            return;
        }

        if shared.write_idle() >= check_interval {
            tracing::trace!(uri = %shared.uri, "sending keep alive");
            if shared.write(KeepAliveInfo::default().into()).await.is_err() {
                return;
            }
        }
    }
}

/// Opens [`TcpTransport`]s for `tcp://` URIs, applying the URI's options.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTransportFactory;

impl TcpTransportFactory {
    /// Creates a factory.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TransportFactory for TcpTransportFactory {
    async fn connect(&self, uri: &Url) -> Result<Arc<dyn Transport>> {
        let config = TcpTransportConfig::from_url(uri)?;
        Ok(Arc::new(TcpTransport::connect(config).await?))
    }
}
