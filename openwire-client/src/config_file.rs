//! Declarative configuration loading from YAML, TOML, and environment variables.
//!
//! [`FileConfig`] mirrors [`ClientConfig`] with serde-friendly fields and is
//! converted through the same URI and builder code the programmatic API uses.
//! TCP settings are merged into every broker URI as query options, so they
//! apply to a single broker and to each member of a failover list alike.
//!
//! # Example YAML
//!
//! ```yaml
//! broker-uri: "failover:(tcp://mq1:61616,tcp://mq2:61616)"
//! client-id: order-service
//! user-name: orders
//! password: secret
//! request-timeout-ms: 10000
//! tcp:
//!   connection-timeout-ms: 5000
//!   wire-format:
//!     max-inactivity-duration-ms: 30000
//!     cache-size: 512
//! failover:
//!   max-reconnect-attempts: 20
//!   randomize: false
//!   backup: true
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::{
    ClientConfig, ClientConfigBuilder, ConfigError, FailoverConfig, FailoverConfigBuilder,
    TcpTransportConfig, TransportConfig, DEFAULT_BROKER_URI,
};

/// Top-level file-based configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct FileConfig {
    /// Broker URI, either `tcp://` or `failover:`.
    pub broker_uri: Option<String>,
    /// Client id announced to the broker.
    pub client_id: Option<String>,
    /// User name for authentication.
    pub user_name: Option<String>,
    /// Password for authentication.
    pub password: Option<String>,
    /// How long a request waits for its response, in milliseconds.
    pub request_timeout_ms: Option<u64>,
    /// Settings for every TCP connection.
    pub tcp: Option<FileTcpConfig>,
    /// Reconnect settings. Present means the client uses failover even for
    /// a single `tcp://` broker URI.
    pub failover: Option<FileFailoverConfig>,
}

/// File-based TCP settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct FileTcpConfig {
    /// Connect timeout in milliseconds.
    pub connection_timeout_ms: Option<u64>,
    /// Enable TCP_NODELAY.
    pub tcp_no_delay: Option<bool>,
    /// How long to wait for the broker's WireFormatInfo, in milliseconds.
    pub negotiate_timeout_ms: Option<u64>,
    /// Wire format preferences.
    pub wire_format: Option<FileWireFormatConfig>,
}

/// File-based wire format preferences.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct FileWireFormatConfig {
    /// Protocol version to offer.
    pub version: Option<i32>,
    /// Offer tight encoding.
    pub tight_encoding_enabled: Option<bool>,
    /// Offer the marshal cache.
    pub cache_enabled: Option<bool>,
    /// Marshal cache slots.
    pub cache_size: Option<i32>,
    /// Omit the frame length prefix.
    pub size_prefix_disabled: Option<bool>,
    /// Marshal exception stack traces.
    pub stack_trace_enabled: Option<bool>,
    /// Ask the broker for TCP_NODELAY.
    pub tcp_no_delay_enabled: Option<bool>,
    /// Zero disables the inactivity monitor.
    pub max_inactivity_duration_ms: Option<u64>,
    /// Delay before inactivity monitoring starts, in milliseconds.
    pub max_inactivity_initial_delay_ms: Option<u64>,
    /// Largest accepted frame in bytes.
    pub max_frame_size: Option<u64>,
}

/// File-based failover settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct FileFailoverConfig {
    /// Broker URIs. Overrides the list in `broker-uri`.
    pub uris: Option<Vec<String>>,
    /// Delay before the second reconnect pass, in milliseconds.
    pub initial_reconnect_delay_ms: Option<u64>,
    /// Cap on the reconnect delay, in milliseconds.
    pub max_reconnect_delay_ms: Option<u64>,
    /// Grow the delay between passes.
    pub use_exponential_back_off: Option<bool>,
    /// Growth factor of the delay.
    pub back_off_multiplier: Option<f64>,
    /// -1 retries forever.
    pub max_reconnect_attempts: Option<i32>,
    /// Attempt limit before the first connection.
    pub startup_max_reconnect_attempts: Option<i32>,
    /// Shuffle the broker list on every pass.
    pub randomize: Option<bool>,
    /// Prefer the priority brokers.
    pub priority_backup: Option<bool>,
    /// The priority brokers; defaults to the first URI.
    pub priority_uris: Option<Vec<String>>,
    /// Keep pre-connected backup transports.
    pub backup: Option<bool>,
    /// Number of backups to keep.
    pub backup_pool_size: Option<usize>,
    /// Send timeout while disconnected in milliseconds; -1 waits forever.
    pub timeout_ms: Option<i64>,
    /// Accept broker-supplied URI lists.
    pub update_uris_supported: Option<bool>,
    /// Follow broker reconnect requests.
    pub reconnect_supported: Option<bool>,
}

impl FileTcpConfig {
    /// The settings as broker URI query options.
    fn uri_options(&self) -> Vec<(&'static str, String)> {
        let mut options = Vec::new();
        push_option(&mut options, "connectionTimeout", self.connection_timeout_ms);
        push_option(&mut options, "tcpNoDelay", self.tcp_no_delay);
        push_option(&mut options, "negotiateTimeout", self.negotiate_timeout_ms);
        if let Some(wf) = &self.wire_format {
            push_option(&mut options, "wireFormat.version", wf.version);
            push_option(&mut options, "wireFormat.tightEncodingEnabled", wf.tight_encoding_enabled);
            push_option(&mut options, "wireFormat.cacheEnabled", wf.cache_enabled);
            push_option(&mut options, "wireFormat.cacheSize", wf.cache_size);
            push_option(&mut options, "wireFormat.sizePrefixDisabled", wf.size_prefix_disabled);
            push_option(&mut options, "wireFormat.stackTraceEnabled", wf.stack_trace_enabled);
            push_option(&mut options, "wireFormat.tcpNoDelayEnabled", wf.tcp_no_delay_enabled);
            push_option(
                &mut options,
                "wireFormat.maxInactivityDuration",
                wf.max_inactivity_duration_ms,
            );
            push_option(
                &mut options,
                "wireFormat.maxInactivityDurationInitalDelay",
                wf.max_inactivity_initial_delay_ms,
            );
            push_option(&mut options, "wireFormat.maxFrameSize", wf.max_frame_size);
        }
        options
    }
}

fn push_option<T: ToString>(
    options: &mut Vec<(&'static str, String)>,
    key: &'static str,
    value: Option<T>,
) {
    if let Some(value) = value {
        options.push((key, value.to_string()));
    }
}

/// Parses a TCP broker URI and appends `options` to its query.
fn tcp_uri(uri: &str, options: &[(&'static str, String)]) -> Result<Url, ConfigError> {
    let mut url = Url::parse(uri.trim())
        .map_err(|e| ConfigError::new(format!("invalid broker URI '{uri}': {e}")))?;
    if !options.is_empty() {
        url.query_pairs_mut().extend_pairs(options);
    }
    TcpTransportConfig::from_url(&url)?;
    Ok(url)
}

fn apply_failover(
    mut builder: FailoverConfigBuilder,
    file: FileFailoverConfig,
) -> Result<FailoverConfigBuilder, ConfigError> {
    if let Some(ms) = file.initial_reconnect_delay_ms {
        builder = builder.initial_reconnect_delay(Duration::from_millis(ms));
    }
    if let Some(ms) = file.max_reconnect_delay_ms {
        builder = builder.max_reconnect_delay(Duration::from_millis(ms));
    }
    if let Some(v) = file.use_exponential_back_off {
        builder = builder.use_exponential_back_off(v);
    }
    if let Some(v) = file.back_off_multiplier {
        builder = builder.back_off_multiplier(v);
    }
    if let Some(v) = file.max_reconnect_attempts {
        builder = builder.max_reconnect_attempts(v);
    }
    if let Some(v) = file.startup_max_reconnect_attempts {
        builder = builder.startup_max_reconnect_attempts(v);
    }
    if let Some(v) = file.randomize {
        builder = builder.randomize(v);
    }
    if let Some(v) = file.priority_backup {
        builder = builder.priority_backup(v);
    }
    if let Some(uris) = file.priority_uris {
        let uris = uris
            .iter()
            .map(|uri| {
                Url::parse(uri.trim())
                    .map_err(|e| ConfigError::new(format!("invalid priority URI '{uri}': {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        builder = builder.priority_uris(uris);
    }
    if let Some(v) = file.backup {
        builder = builder.backup(v);
    }
    if let Some(v) = file.backup_pool_size {
        builder = builder.backup_pool_size(v);
    }
    if let Some(ms) = file.timeout_ms {
        builder = builder.timeout(u64::try_from(ms).ok().map(Duration::from_millis));
    }
    if let Some(v) = file.update_uris_supported {
        builder = builder.update_uris_supported(v);
    }
    if let Some(v) = file.reconnect_supported {
        builder = builder.reconnect_supported(v);
    }
    Ok(builder)
}

impl TryFrom<FileConfig> for ClientConfig {
    type Error = ConfigError;

    fn try_from(file: FileConfig) -> Result<Self, Self::Error> {
        let broker = file.broker_uri.as_deref().unwrap_or(DEFAULT_BROKER_URI).trim();
        let tcp_options = file
            .tcp
            .as_ref()
            .map(FileTcpConfig::uri_options)
            .unwrap_or_default();

        let failover_uri = broker.starts_with("failover:");
        let transport = if failover_uri || file.failover.is_some() {
            let base = if failover_uri {
                Some(FailoverConfig::from_uri(broker)?)
            } else {
                None
            };
            let section = file.failover.unwrap_or_default();
            let uris: Vec<String> = match section.uris.clone() {
                Some(uris) => uris,
                None => match &base {
                    Some(config) => config.uris().iter().map(Url::to_string).collect(),
                    None => vec![broker.to_string()],
                },
            };
            let uris = uris
                .iter()
                .map(|uri| tcp_uri(uri, &tcp_options))
                .collect::<Result<Vec<_>, _>>()?;

            let builder = base.map(FailoverConfigBuilder::from).unwrap_or_default();
            TransportConfig::Failover(apply_failover(builder.uris(uris), section)?.build()?)
        } else {
            TransportConfig::Tcp(TcpTransportConfig::from_url(&tcp_uri(broker, &tcp_options)?)?)
        };

        let mut builder = ClientConfigBuilder::new().transport(transport);
        if let Some(id) = file.client_id {
            builder = builder.client_id(id);
        }
        match (file.user_name, file.password) {
            (Some(user), password) => builder = builder.credentials(user, password.unwrap_or_default()),
            (None, Some(_)) => return Err(ConfigError::new("password given without user-name")),
            (None, None) => {}
        }
        if let Some(ms) = file.request_timeout_ms {
            builder = builder.request_timeout(Duration::from_millis(ms));
        }
        builder.build()
    }
}

fn env_value<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| ConfigError::new(format!("invalid value '{value}' for {name}: {e}"))),
        Err(_) => Ok(None),
    }
}

impl ClientConfig {
    /// Loads configuration from a YAML file.
    ///
    /// Requires the `config-file` feature.
    #[cfg(feature = "config-file")]
    pub fn from_yaml<P: AsRef<std::path::Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::new(format!("failed to read YAML config file: {e}")))?;
        let file_config: FileConfig = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::new(format!("failed to parse YAML config: {e}")))?;
        file_config.try_into()
    }

    /// Loads configuration from a TOML file.
    ///
    /// Requires the `config-file` feature.
    #[cfg(feature = "config-file")]
    pub fn from_toml<P: AsRef<std::path::Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::new(format!("failed to read TOML config file: {e}")))?;
        let file_config: FileConfig = toml::from_str(&content)
            .map_err(|e| ConfigError::new(format!("failed to parse TOML config: {e}")))?;
        file_config.try_into()
    }

    /// Loads configuration from environment variables.
    ///
    /// This method is always available (no feature flag required).
    ///
    /// | Variable | Maps to |
    /// |----------|---------|
    /// | `OPENWIRE_BROKER_URI` | `broker-uri` |
    /// | `OPENWIRE_CLIENT_ID` | `client-id` |
    /// | `OPENWIRE_USER_NAME` | `user-name` |
    /// | `OPENWIRE_PASSWORD` | `password` |
    /// | `OPENWIRE_REQUEST_TIMEOUT_MS` | `request-timeout-ms` |
    /// | `OPENWIRE_CONNECTION_TIMEOUT_MS` | `tcp.connection-timeout-ms` |
    /// | `OPENWIRE_MAX_INACTIVITY_DURATION_MS` | `tcp.wire-format.max-inactivity-duration-ms` |
    /// | `OPENWIRE_MAX_RECONNECT_ATTEMPTS` | `failover.max-reconnect-attempts` |
    ///
    /// Setting `OPENWIRE_MAX_RECONNECT_ATTEMPTS` turns on failover.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut file_config = FileConfig {
            broker_uri: env_value("OPENWIRE_BROKER_URI")?,
            client_id: env_value("OPENWIRE_CLIENT_ID")?,
            user_name: env_value("OPENWIRE_USER_NAME")?,
            password: env_value("OPENWIRE_PASSWORD")?,
            request_timeout_ms: env_value("OPENWIRE_REQUEST_TIMEOUT_MS")?,
            ..FileConfig::default()
        };

        if let Some(ms) = env_value("OPENWIRE_CONNECTION_TIMEOUT_MS")? {
            file_config.tcp.get_or_insert_with(Default::default).connection_timeout_ms = Some(ms);
        }
        if let Some(ms) = env_value("OPENWIRE_MAX_INACTIVITY_DURATION_MS")? {
            file_config
                .tcp
                .get_or_insert_with(Default::default)
                .wire_format
                .get_or_insert_with(Default::default)
                .max_inactivity_duration_ms = Some(ms);
        }
        if let Some(attempts) = env_value("OPENWIRE_MAX_RECONNECT_ATTEMPTS")? {
            file_config
                .failover
                .get_or_insert_with(Default::default)
                .max_reconnect_attempts = Some(attempts);
        }

        file_config.try_into()
    }
}

/// Loads a configuration file, picking the format by extension.
///
/// Supports `.yaml`, `.yml`, and `.toml`. Requires the `config-file` feature.
#[cfg(feature = "config-file")]
pub fn load_config<P: AsRef<std::path::Path>>(path: P) -> Result<ClientConfig, ConfigError> {
    let path = path.as_ref();
    match path.extension().and_then(|e| e.to_str()) {
        Some("yaml" | "yml") => ClientConfig::from_yaml(path),
        Some("toml") => ClientConfig::from_toml(path),
        Some(ext) => Err(ConfigError::new(format!(
            "unsupported config file extension: .{ext} (expected .yaml, .yml, or .toml)"
        ))),
        None => Err(ConfigError::new(
            "config file has no extension; expected .yaml, .yml, or .toml",
        )),
    }
}
