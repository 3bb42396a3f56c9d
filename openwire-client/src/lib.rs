//! Async client transport chain for OpenWire brokers.
//!
//! The chain is built bottom up:
//!
//! - [`TcpTransport`] frames commands with [`openwire_core::OpenWireCodec`],
//!   negotiates the wire format and watches for inactivity.
//! - [`FailoverTransport`] optionally sits above it, reconnecting across a
//!   list of brokers and restoring connection state recorded by the
//!   [`ConnectionStateTracker`].
//! - [`ResponseCorrelator`] on top assigns command ids and pairs responses
//!   with requests.
//!
//! [`OpenWireClient`] assembles the chain from a [`ClientConfig`].
//!
//! ```rust,no_run
//! use openwire_client::{ClientConfig, OpenWireClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::builder()
//!         .broker_uri("failover:(tcp://mq1:61616,tcp://mq2:61616)?maxReconnectAttempts=10")
//!         .client_id("order-service")
//!         .build()?;
//!     let client = OpenWireClient::connect(config).await?;
//!     let session = client.create_session().await?;
//!     client.remove(session).await?;
//!     client.close().await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]

mod client;
pub mod config;
pub mod config_file;
pub mod state;
pub mod transport;

pub use client::{ClientEvent, OpenWireClient};
pub use config::{
    ClientConfig, ClientConfigBuilder, ConfigError, FailoverConfig, FailoverConfigBuilder,
    TcpTransportConfig, TcpTransportConfigBuilder, TransportConfig,
};
pub use config_file::FileConfig;
pub use openwire_core as core;
pub use state::ConnectionStateTracker;
pub use transport::{
    FailoverEvent, FailoverState, FailoverTransport, ResponseCorrelator, TcpTransport,
    TcpTransportFactory, Transport, TransportFactory, TransportListener,
};
