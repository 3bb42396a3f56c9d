//! Common test utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use openwire_client::transport::mock::{ListenerEvent, MockTransportFactory};
use openwire_client::{FailoverEvent, FailoverTransport};
use openwire_core::commands::Response;
use openwire_core::{Command, OpenWireCodec, OpenWireFormat, WireFormatSettings};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, Encoder};

/// Upper bound on any single wait in these tests.
pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A broker on 127.0.0.1 that negotiates the wire format, records every
/// command it reads and answers the ones that require a response.
pub struct MockBroker {
    addr: SocketAddr,
    received: Arc<Mutex<Vec<Command>>>,
    kill: broadcast::Sender<()>,
    push: broadcast::Sender<Command>,
    accept_task: JoinHandle<()>,
}

impl MockBroker {
    pub async fn start() -> Self {
        Self::start_with(true).await
    }

    /// A broker that never sends responses.
    pub async fn start_unresponsive() -> Self {
        Self::start_with(false).await
    }

    async fn start_with(respond: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let (kill, _) = broadcast::channel(4);
        let (push, _) = broadcast::channel(16);

        let accept_task = {
            let received = Arc::clone(&received);
            let kill = kill.clone();
            let push = push.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    tokio::spawn(serve(
                        stream,
                        respond,
                        Arc::clone(&received),
                        kill.subscribe(),
                        push.subscribe(),
                    ));
                }
            })
        };

        Self {
            addr,
            received,
            kill,
            push,
            accept_task,
        }
    }

    /// A `tcp://` URI for this broker with the inactivity monitor off.
    pub fn uri(&self) -> String {
        format!(
            "tcp://127.0.0.1:{}?wireFormat.maxInactivityDuration=0",
            self.addr.port()
        )
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn received(&self) -> Vec<Command> {
        self.received.lock().unwrap().clone()
    }

    /// Waits until a received command satisfies `pred`.
    pub async fn wait_for(&self, what: &str, pred: impl Fn(&Command) -> bool) -> Command {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            if let Some(command) = self.received().into_iter().find(|c| pred(c)) {
                return command;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("broker never received {what}; got {:?}", self.received());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Writes `command` to every open connection.
    pub fn push(&self, command: Command) {
        let _ = self.push.send(command);
    }

    /// Drops every open connection but keeps accepting new ones.
    pub fn drop_connections(&self) {
        let _ = self.kill.send(());
    }

    /// Stops accepting and drops every open connection.
    pub fn stop(&self) {
        self.accept_task.abort();
        self.drop_connections();
    }
}

impl Drop for MockBroker {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn serve(
    mut stream: TcpStream,
    respond: bool,
    received: Arc<Mutex<Vec<Command>>>,
    mut kill: broadcast::Receiver<()>,
    mut push: broadcast::Receiver<Command>,
) {
    let settings = WireFormatSettings::builder()
        .max_inactivity_duration(Duration::ZERO)
        .build()
        .unwrap();
    let mut codec = OpenWireCodec::new(OpenWireFormat::for_negotiation(settings));
    let mut buffer = BytesMut::new();

    let info = codec.format().lock().unwrap().preferred_wire_format_info().unwrap();
    if write(&mut stream, &mut codec, info.into()).await.is_err() {
        return;
    }

    loop {
        let command = loop {
            match codec.decode(&mut buffer) {
                Ok(Some(command)) => break command,
                Ok(None) => {}
                Err(_) => return,
            }
            tokio::select! {
                read = stream.read_buf(&mut buffer) => match read {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {}
                },
                _ = kill.recv() => return,
                pushed = push.recv() => match pushed {
                    Ok(command) => {
                        if write(&mut stream, &mut codec, command).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return,
                },
            }
        };

        if let Command::WireFormatInfo(info) = &command {
            if codec.format().lock().unwrap().renegotiate(info).is_err() {
                return;
            }
            continue;
        }

        let reply = (respond && command.is_response_required())
            .then(|| Response::for_request(command.command_id()));
        received.lock().unwrap().push(command);
        if let Some(reply) = reply {
            if write(&mut stream, &mut codec, reply.into()).await.is_err() {
                return;
            }
        }
    }
}

async fn write(
    stream: &mut TcpStream,
    codec: &mut OpenWireCodec,
    command: Command,
) -> std::io::Result<()> {
    let mut buf = BytesMut::new();
    codec
        .encode(command, &mut buf)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
    stream.write_all(&buf).await
}

/// Waits for the next failover event matching `pred`.
pub async fn wait_for_event(
    events: &mut broadcast::Receiver<FailoverEvent>,
    pred: impl Fn(&FailoverEvent) -> bool,
) -> FailoverEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for failover event")
}

/// Waits for the next listener event matching `pred`.
pub async fn wait_for_listener(
    events: &mut mpsc::UnboundedReceiver<ListenerEvent>,
    pred: impl Fn(&ListenerEvent) -> bool,
) -> ListenerEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("listener dropped");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for listener event")
}

/// Polls `cond` until it holds.
pub async fn eventually(what: &str, cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !cond() {
        if tokio::time::Instant::now() >= deadline {
            panic!("condition never held: {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// A failover transport over mock transports.
pub fn mock_failover(uri: &str) -> (FailoverTransport, Arc<MockTransportFactory>) {
    let factory = Arc::new(MockTransportFactory::new());
    let config = openwire_client::FailoverConfig::from_uri(uri).unwrap();
    (FailoverTransport::new(config, factory.clone()), factory)
}
