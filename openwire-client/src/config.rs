//! Transport and client configuration types, builders and URI parsing.

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use openwire_core::{OpenWireError, WireFormatSettings, WireFormatSettingsBuilder};
use url::{Host, Url};

/// Default broker port.
pub const DEFAULT_PORT: u16 = 61616;
/// Broker URI used when none is configured.
pub const DEFAULT_BROKER_URI: &str = "tcp://localhost:61616";
/// Reconnect attempt limit meaning "retry forever".
pub const UNLIMITED_RECONNECT_ATTEMPTS: i32 = -1;

/// Default TCP connect timeout.
const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);
/// Default time allowed for the peer's WireFormatInfo to arrive.
const DEFAULT_NEGOTIATE_TIMEOUT: Duration = Duration::from_secs(15);
/// Default delay before the first reconnect attempt.
const DEFAULT_INITIAL_RECONNECT_DELAY: Duration = Duration::from_millis(10);
/// Default ceiling on the reconnect delay.
const DEFAULT_MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);
/// Default reconnect backoff multiplier.
const DEFAULT_BACK_OFF_MULTIPLIER: f64 = 2.0;
/// Default number of pre-connected backup transports.
const DEFAULT_BACKUP_POOL_SIZE: usize = 1;
/// Default request timeout used by the client facade.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration error returned when validation fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    message: String,
}

impl ConfigError {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "configuration error: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for OpenWireError {
    fn from(error: ConfigError) -> Self {
        OpenWireError::Configuration(error.message)
    }
}

fn parse_value<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| ConfigError::new(format!("invalid value {:?} for {}: {}", value, key, e)))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(ConfigError::new(format!(
            "invalid value {:?} for {}: expected true or false",
            value, key
        ))),
    }
}

fn parse_millis(key: &str, value: &str) -> Result<Duration, ConfigError> {
    parse_value::<u64>(key, value).map(Duration::from_millis)
}

fn parse_uri(value: &str) -> Result<Url, ConfigError> {
    Url::parse(value.trim())
        .map_err(|e| ConfigError::new(format!("invalid URI {:?}: {}", value, e)))
}

fn parse_uri_list(value: &str) -> Result<Vec<Url>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|uri| !uri.is_empty())
        .map(parse_uri)
        .collect()
}

/// Settings for one TCP connection to a broker.
#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    host: String,
    port: u16,
    connection_timeout: Duration,
    tcp_no_delay: bool,
    negotiate_timeout: Duration,
    wire_format: WireFormatSettings,
}

impl TcpTransportConfig {
    /// Creates a builder.
    pub fn builder() -> TcpTransportConfigBuilder {
        TcpTransportConfigBuilder::new()
    }

    /// Returns the broker host.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the broker port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns the TCP connect timeout.
    pub fn connection_timeout(&self) -> Duration {
        self.connection_timeout
    }

    /// Returns whether Nagle's algorithm is disabled on the socket.
    pub fn tcp_no_delay(&self) -> bool {
        self.tcp_no_delay
    }

    /// Returns how long to wait for the broker's WireFormatInfo.
    pub fn negotiate_timeout(&self) -> Duration {
        self.negotiate_timeout
    }

    /// Returns the wire format offered during negotiation.
    pub fn wire_format(&self) -> &WireFormatSettings {
        &self.wire_format
    }

    /// Returns the `tcp://host:port` form of the address.
    pub fn uri(&self) -> String {
        if self.host.contains(':') {
            format!("tcp://[{}]:{}", self.host, self.port)
        } else {
            format!("tcp://{}:{}", self.host, self.port)
        }
    }

    /// Parses `tcp://host:port?option=value&...`.
    pub fn from_uri(uri: &str) -> Result<Self, ConfigError> {
        Self::from_url(&parse_uri(uri)?)
    }

    /// Builds the configuration from a parsed `tcp://` URL.
    ///
    /// Recognised options are `connectionTimeout`, `tcpNoDelay`,
    /// `negotiateTimeout` and the `wireFormat.*` settings. Any other option
    /// is rejected.
    pub fn from_url(url: &Url) -> Result<Self, ConfigError> {
        if url.scheme() != "tcp" {
            return Err(ConfigError::new(format!(
                "unsupported transport scheme {:?} in {}",
                url.scheme(),
                url
            )));
        }
        let host = match url.host() {
            Some(Host::Ipv6(addr)) => addr.to_string(),
            Some(host) => host.to_string(),
            None => return Err(ConfigError::new(format!("missing host in {}", url))),
        };

        let mut builder = TcpTransportConfigBuilder::new()
            .host(host)
            .port(url.port().unwrap_or(DEFAULT_PORT));
        let mut wire_format = WireFormatSettings::builder();

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "connectionTimeout" => {
                    builder = builder.connection_timeout(parse_millis(&key, &value)?)
                }
                "tcpNoDelay" => builder = builder.tcp_no_delay(parse_bool(&key, &value)?),
                "negotiateTimeout" => {
                    builder = builder.negotiate_timeout(parse_millis(&key, &value)?)
                }
                option => match option.strip_prefix("wireFormat.") {
                    Some(name) => wire_format = apply_wire_format_option(wire_format, name, &value)?,
                    None => {
                        return Err(ConfigError::new(format!(
                            "unknown tcp transport option {:?}",
                            option
                        )))
                    }
                },
            }
        }

        let wire_format = wire_format
            .build()
            .map_err(|e| ConfigError::new(e.to_string()))?;
        builder.wire_format(wire_format).build()
    }
}

fn apply_wire_format_option(
    builder: WireFormatSettingsBuilder,
    name: &str,
    value: &str,
) -> Result<WireFormatSettingsBuilder, ConfigError> {
    let key = format!("wireFormat.{}", name);
    Ok(match name {
        "version" => builder.version(parse_value(&key, value)?),
        "tightEncodingEnabled" => builder.tight_encoding_enabled(parse_bool(&key, value)?),
        "cacheEnabled" => builder.cache_enabled(parse_bool(&key, value)?),
        "cacheSize" => builder.cache_size(parse_value(&key, value)?),
        "sizePrefixDisabled" => builder.size_prefix_disabled(parse_bool(&key, value)?),
        "stackTraceEnabled" => builder.stack_trace_enabled(parse_bool(&key, value)?),
        "tcpNoDelayEnabled" => builder.tcp_no_delay_enabled(parse_bool(&key, value)?),
        "maxInactivityDuration" => builder.max_inactivity_duration(parse_millis(&key, value)?),
        "maxInactivityDurationInitalDelay" => {
            builder.max_inactivity_initial_delay(parse_millis(&key, value)?)
        }
        "maxFrameSize" => builder.max_frame_size(parse_value(&key, value)?),
        _ => {
            return Err(ConfigError::new(format!(
                "unknown wire format option {:?}",
                key
            )))
        }
    })
}

/// Builder for `TcpTransportConfig`.
#[derive(Debug, Clone, Default)]
pub struct TcpTransportConfigBuilder {
    host: Option<String>,
    port: Option<u16>,
    connection_timeout: Option<Duration>,
    tcp_no_delay: Option<bool>,
    negotiate_timeout: Option<Duration>,
    wire_format: Option<WireFormatSettings>,
}

impl TcpTransportConfigBuilder {
    /// Creates a new TCP transport configuration builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the broker host.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Sets the broker port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Sets the TCP connect timeout.
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = Some(timeout);
        self
    }

    /// Enables or disables `TCP_NODELAY`.
    pub fn tcp_no_delay(mut self, enabled: bool) -> Self {
        self.tcp_no_delay = Some(enabled);
        self
    }

    /// Sets how long to wait for the broker's WireFormatInfo.
    pub fn negotiate_timeout(mut self, timeout: Duration) -> Self {
        self.negotiate_timeout = Some(timeout);
        self
    }

    /// Sets the wire format offered during negotiation.
    pub fn wire_format(mut self, settings: WireFormatSettings) -> Self {
        self.wire_format = Some(settings);
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the host is empty or a timeout is zero.
    pub fn build(self) -> Result<TcpTransportConfig, ConfigError> {
        let host = self.host.unwrap_or_else(|| "localhost".to_string());
        if host.is_empty() {
            return Err(ConfigError::new("host must not be empty"));
        }
        let connection_timeout = self.connection_timeout.unwrap_or(DEFAULT_CONNECTION_TIMEOUT);
        if connection_timeout.is_zero() {
            return Err(ConfigError::new("connection_timeout must be positive"));
        }
        let negotiate_timeout = self.negotiate_timeout.unwrap_or(DEFAULT_NEGOTIATE_TIMEOUT);
        if negotiate_timeout.is_zero() {
            return Err(ConfigError::new("negotiate_timeout must be positive"));
        }

        Ok(TcpTransportConfig {
            host,
            port: self.port.unwrap_or(DEFAULT_PORT),
            connection_timeout,
            tcp_no_delay: self.tcp_no_delay.unwrap_or(true),
            negotiate_timeout,
            wire_format: self.wire_format.unwrap_or_default(),
        })
    }
}

/// Reconnect policy and candidate brokers of a failover transport.
#[derive(Debug, Clone, PartialEq)]
pub struct FailoverConfig {
    uris: Vec<Url>,
    initial_reconnect_delay: Duration,
    max_reconnect_delay: Duration,
    use_exponential_back_off: bool,
    back_off_multiplier: f64,
    max_reconnect_attempts: i32,
    startup_max_reconnect_attempts: i32,
    randomize: bool,
    priority_backup: bool,
    priority_uris: Vec<Url>,
    backup: bool,
    backup_pool_size: usize,
    timeout: Option<Duration>,
    update_uris_supported: bool,
    reconnect_supported: bool,
}

impl FailoverConfig {
    /// Creates a builder.
    pub fn builder() -> FailoverConfigBuilder {
        FailoverConfigBuilder::new()
    }

    /// The configured candidate brokers, in order.
    pub fn uris(&self) -> &[Url] {
        &self.uris
    }

    /// Delay before the first reconnect attempt.
    pub fn initial_reconnect_delay(&self) -> Duration {
        self.initial_reconnect_delay
    }

    /// Upper bound of the reconnect delay.
    pub fn max_reconnect_delay(&self) -> Duration {
        self.max_reconnect_delay
    }

    /// Whether the delay grows between attempts.
    pub fn use_exponential_back_off(&self) -> bool {
        self.use_exponential_back_off
    }

    /// Factor applied to the delay after each failed attempt.
    pub fn back_off_multiplier(&self) -> f64 {
        self.back_off_multiplier
    }

    /// Attempts allowed after a connection has been established, or
    /// [`UNLIMITED_RECONNECT_ATTEMPTS`].
    pub fn max_reconnect_attempts(&self) -> i32 {
        self.max_reconnect_attempts
    }

    /// Attempts allowed before the first connection, or
    /// [`UNLIMITED_RECONNECT_ATTEMPTS`] to fall back on `max_reconnect_attempts`.
    pub fn startup_max_reconnect_attempts(&self) -> i32 {
        self.startup_max_reconnect_attempts
    }

    /// The attempt limit in force, depending on whether a connection has
    /// ever been established.
    pub fn reconnect_attempt_limit(&self, first_connection: bool) -> i32 {
        if first_connection && self.startup_max_reconnect_attempts != UNLIMITED_RECONNECT_ATTEMPTS
        {
            self.startup_max_reconnect_attempts
        } else {
            self.max_reconnect_attempts
        }
    }

    /// Whether candidates are shuffled before each pass.
    pub fn randomize(&self) -> bool {
        self.randomize
    }

    /// Whether priority brokers are preferred, even over a live connection.
    pub fn priority_backup(&self) -> bool {
        self.priority_backup
    }

    /// Explicit priority brokers. When empty the first configured URI is the
    /// priority broker.
    pub fn priority_uris(&self) -> &[Url] {
        &self.priority_uris
    }

    /// Whether the backup pool is maintained.
    pub fn backup(&self) -> bool {
        self.backup
    }

    /// Maximum number of pre-connected backups.
    pub fn backup_pool_size(&self) -> usize {
        self.backup_pool_size
    }

    /// How long a send waits for a connection. `None` waits indefinitely.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Whether the broker may replace the candidate list.
    pub fn update_uris_supported(&self) -> bool {
        self.update_uris_supported
    }

    /// Whether the broker may ask the client to reconnect elsewhere.
    pub fn reconnect_supported(&self) -> bool {
        self.reconnect_supported
    }

    /// Returns true if `uri` is a priority broker.
    pub fn is_priority(&self, uri: &Url) -> bool {
        if self.priority_uris.is_empty() {
            self.uris.first() == Some(uri)
        } else {
            self.priority_uris.contains(uri)
        }
    }

    /// Parses `failover:(uri1,uri2,...)?option=value&...` or the bare
    /// `failover:uri1,uri2` form.
    pub fn from_uri(uri: &str) -> Result<Self, ConfigError> {
        let rest = uri
            .trim()
            .strip_prefix("failover:")
            .ok_or_else(|| ConfigError::new(format!("not a failover URI: {:?}", uri)))?;
        let rest = rest.strip_prefix("//").unwrap_or(rest);

        let (list, query) = match rest.strip_prefix('(') {
            Some(inner) => {
                let end = inner.rfind(')').ok_or_else(|| {
                    ConfigError::new(format!("unbalanced parentheses in {:?}", uri))
                })?;
                let tail = &inner[end + 1..];
                let query = if tail.is_empty() {
                    None
                } else {
                    Some(tail.strip_prefix('?').ok_or_else(|| {
                        ConfigError::new(format!("unexpected text after ')' in {:?}", uri))
                    })?)
                };
                (&inner[..end], query)
            }
            None => (rest, None),
        };

        let mut builder = FailoverConfigBuilder::new().uris(parse_uri_list(list)?);
        if let Some(query) = query {
            for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
                builder = apply_failover_option(builder, &key, &value)?;
            }
        }
        builder.build()
    }
}

fn apply_failover_option(
    builder: FailoverConfigBuilder,
    key: &str,
    value: &str,
) -> Result<FailoverConfigBuilder, ConfigError> {
    Ok(match key {
        "initialReconnectDelay" => builder.initial_reconnect_delay(parse_millis(key, value)?),
        "maxReconnectDelay" => builder.max_reconnect_delay(parse_millis(key, value)?),
        "useExponentialBackOff" => builder.use_exponential_back_off(parse_bool(key, value)?),
        "backOffMultiplier" => builder.back_off_multiplier(parse_value(key, value)?),
        "maxReconnectAttempts" => builder.max_reconnect_attempts(parse_value(key, value)?),
        "startupMaxReconnectAttempts" => {
            builder.startup_max_reconnect_attempts(parse_value(key, value)?)
        }
        "randomize" => builder.randomize(parse_bool(key, value)?),
        "priorityBackup" => builder.priority_backup(parse_bool(key, value)?),
        "priorityURIs" => builder.priority_uris(parse_uri_list(value)?),
        "backup" => builder.backup(parse_bool(key, value)?),
        "backupPoolSize" => builder.backup_pool_size(parse_value(key, value)?),
        "timeout" => {
            let millis: i64 = parse_value(key, value)?;
            builder.timeout((millis >= 0).then(|| Duration::from_millis(millis as u64)))
        }
        "updateURIsSupported" => builder.update_uris_supported(parse_bool(key, value)?),
        "reconnectSupported" => builder.reconnect_supported(parse_bool(key, value)?),
        _ => {
            return Err(ConfigError::new(format!(
                "unknown failover option {:?}",
                key
            )))
        }
    })
}

impl From<FailoverConfig> for FailoverConfigBuilder {
    fn from(config: FailoverConfig) -> Self {
        Self {
            uris: config.uris,
            initial_reconnect_delay: Some(config.initial_reconnect_delay),
            max_reconnect_delay: Some(config.max_reconnect_delay),
            use_exponential_back_off: Some(config.use_exponential_back_off),
            back_off_multiplier: Some(config.back_off_multiplier),
            max_reconnect_attempts: Some(config.max_reconnect_attempts),
            startup_max_reconnect_attempts: Some(config.startup_max_reconnect_attempts),
            randomize: Some(config.randomize),
            priority_backup: Some(config.priority_backup),
            priority_uris: config.priority_uris,
            backup: Some(config.backup),
            backup_pool_size: Some(config.backup_pool_size),
            timeout: Some(config.timeout),
            update_uris_supported: Some(config.update_uris_supported),
            reconnect_supported: Some(config.reconnect_supported),
        }
    }
}

/// Builder for `FailoverConfig`.
#[derive(Debug, Clone, Default)]
pub struct FailoverConfigBuilder {
    uris: Vec<Url>,
    initial_reconnect_delay: Option<Duration>,
    max_reconnect_delay: Option<Duration>,
    use_exponential_back_off: Option<bool>,
    back_off_multiplier: Option<f64>,
    max_reconnect_attempts: Option<i32>,
    startup_max_reconnect_attempts: Option<i32>,
    randomize: Option<bool>,
    priority_backup: Option<bool>,
    priority_uris: Vec<Url>,
    backup: Option<bool>,
    backup_pool_size: Option<usize>,
    timeout: Option<Option<Duration>>,
    update_uris_supported: Option<bool>,
    reconnect_supported: Option<bool>,
}

impl FailoverConfigBuilder {
    /// Creates a new failover configuration builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a candidate broker.
    pub fn add_uri(mut self, uri: Url) -> Self {
        self.uris.push(uri);
        self
    }

    /// Replaces the candidate brokers.
    pub fn uris(mut self, uris: Vec<Url>) -> Self {
        self.uris = uris;
        self
    }

    /// Sets the delay before the first reconnect attempt.
    pub fn initial_reconnect_delay(mut self, delay: Duration) -> Self {
        self.initial_reconnect_delay = Some(delay);
        self
    }

    /// Sets the ceiling of the reconnect delay.
    pub fn max_reconnect_delay(mut self, delay: Duration) -> Self {
        self.max_reconnect_delay = Some(delay);
        self
    }

    /// Enables or disables exponential backoff.
    pub fn use_exponential_back_off(mut self, enabled: bool) -> Self {
        self.use_exponential_back_off = Some(enabled);
        self
    }

    /// Sets the backoff multiplier.
    pub fn back_off_multiplier(mut self, multiplier: f64) -> Self {
        self.back_off_multiplier = Some(multiplier);
        self
    }

    /// Sets the attempt limit after a connection has been established.
    pub fn max_reconnect_attempts(mut self, attempts: i32) -> Self {
        self.max_reconnect_attempts = Some(attempts);
        self
    }

    /// Sets the attempt limit before the first connection.
    pub fn startup_max_reconnect_attempts(mut self, attempts: i32) -> Self {
        self.startup_max_reconnect_attempts = Some(attempts);
        self
    }

    /// Enables or disables shuffling of the candidates.
    pub fn randomize(mut self, enabled: bool) -> Self {
        self.randomize = Some(enabled);
        self
    }

    /// Enables or disables priority backup.
    pub fn priority_backup(mut self, enabled: bool) -> Self {
        self.priority_backup = Some(enabled);
        self
    }

    /// Sets the explicit priority brokers.
    pub fn priority_uris(mut self, uris: Vec<Url>) -> Self {
        self.priority_uris = uris;
        self
    }

    /// Enables or disables the backup pool.
    pub fn backup(mut self, enabled: bool) -> Self {
        self.backup = Some(enabled);
        self
    }

    /// Sets the size of the backup pool.
    pub fn backup_pool_size(mut self, size: usize) -> Self {
        self.backup_pool_size = Some(size);
        self
    }

    /// Sets how long a send waits for a connection.
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Allows or forbids broker-driven updates of the candidate list.
    pub fn update_uris_supported(mut self, enabled: bool) -> Self {
        self.update_uris_supported = Some(enabled);
        self
    }

    /// Allows or forbids broker-driven reconnects.
    pub fn reconnect_supported(mut self, enabled: bool) -> Self {
        self.reconnect_supported = Some(enabled);
        self
    }

    /// Builds the failover configuration, returning an error if validation fails.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - no candidate URI is configured
    /// - `initial_reconnect_delay` exceeds `max_reconnect_delay`
    /// - `back_off_multiplier` is less than 1.0
    /// - an attempt limit is below -1
    /// - `backup_pool_size` is zero
    pub fn build(self) -> Result<FailoverConfig, ConfigError> {
        if self.uris.is_empty() {
            return Err(ConfigError::new(
                "failover requires at least one broker URI",
            ));
        }

        let initial_reconnect_delay = self
            .initial_reconnect_delay
            .unwrap_or(DEFAULT_INITIAL_RECONNECT_DELAY);
        let max_reconnect_delay = self.max_reconnect_delay.unwrap_or(DEFAULT_MAX_RECONNECT_DELAY);
        if initial_reconnect_delay > max_reconnect_delay {
            return Err(ConfigError::new(
                "initial_reconnect_delay must not exceed max_reconnect_delay",
            ));
        }

        let back_off_multiplier = self.back_off_multiplier.unwrap_or(DEFAULT_BACK_OFF_MULTIPLIER);
        if !(back_off_multiplier >= 1.0) {
            return Err(ConfigError::new("back_off_multiplier must be at least 1.0"));
        }

        let max_reconnect_attempts = self
            .max_reconnect_attempts
            .unwrap_or(UNLIMITED_RECONNECT_ATTEMPTS);
        let startup_max_reconnect_attempts = self
            .startup_max_reconnect_attempts
            .unwrap_or(UNLIMITED_RECONNECT_ATTEMPTS);
        if max_reconnect_attempts < UNLIMITED_RECONNECT_ATTEMPTS
            || startup_max_reconnect_attempts < UNLIMITED_RECONNECT_ATTEMPTS
        {
            return Err(ConfigError::new(
                "reconnect attempt limits must be -1 (unlimited) or non-negative",
            ));
        }

        let backup_pool_size = self.backup_pool_size.unwrap_or(DEFAULT_BACKUP_POOL_SIZE);
        if backup_pool_size == 0 {
            return Err(ConfigError::new("backup_pool_size must be at least 1"));
        }

        Ok(FailoverConfig {
            uris: self.uris,
            initial_reconnect_delay,
            max_reconnect_delay,
            use_exponential_back_off: self.use_exponential_back_off.unwrap_or(true),
            back_off_multiplier,
            max_reconnect_attempts,
            startup_max_reconnect_attempts,
            randomize: self.randomize.unwrap_or(true),
            priority_backup: self.priority_backup.unwrap_or(false),
            priority_uris: self.priority_uris,
            backup: self.backup.unwrap_or(false),
            backup_pool_size,
            timeout: self.timeout.unwrap_or(None),
            update_uris_supported: self.update_uris_supported.unwrap_or(true),
            reconnect_supported: self.reconnect_supported.unwrap_or(true),
        })
    }
}

/// How the client reaches its broker.
#[derive(Debug, Clone)]
pub enum TransportConfig {
    /// A single TCP connection without reconnect.
    Tcp(TcpTransportConfig),
    /// A failover transport over TCP connections.
    Failover(FailoverConfig),
}

impl TransportConfig {
    /// Parses a `tcp://` or `failover:` broker URI.
    pub fn from_uri(uri: &str) -> Result<Self, ConfigError> {
        if uri.trim_start().starts_with("failover:") {
            FailoverConfig::from_uri(uri).map(TransportConfig::Failover)
        } else {
            TcpTransportConfig::from_uri(uri).map(TransportConfig::Tcp)
        }
    }
}

/// Configuration of an [`OpenWireClient`](crate::OpenWireClient).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    transport: TransportConfig,
    client_id: Option<String>,
    user_name: Option<String>,
    password: Option<String>,
    request_timeout: Duration,
}

impl ClientConfig {
    /// Creates a new client configuration builder.
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::new()
    }

    /// Returns the transport configuration.
    pub fn transport(&self) -> &TransportConfig {
        &self.transport
    }

    /// Returns the JMS client id announced in the ConnectionInfo.
    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    /// Returns the user name.
    pub fn user_name(&self) -> Option<&str> {
        self.user_name.as_deref()
    }

    /// Returns the password.
    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    /// Returns how long a request waits for its response.
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }
}

/// Builder for `ClientConfig`.
#[derive(Debug, Clone, Default)]
pub struct ClientConfigBuilder {
    broker_uri: Option<String>,
    transport: Option<TransportConfig>,
    client_id: Option<String>,
    user_name: Option<String>,
    password: Option<String>,
    request_timeout: Option<Duration>,
}

impl ClientConfigBuilder {
    /// Creates a new client configuration builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the broker URI, parsed when the configuration is built.
    pub fn broker_uri(mut self, uri: impl Into<String>) -> Self {
        self.broker_uri = Some(uri.into());
        self
    }

    /// Sets an already parsed transport configuration. Takes precedence
    /// over `broker_uri`.
    pub fn transport(mut self, transport: TransportConfig) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Sets the client id.
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Sets the credentials.
    pub fn credentials(mut self, user_name: impl Into<String>, password: impl Into<String>) -> Self {
        self.user_name = Some(user_name.into());
        self.password = Some(password.into());
        self
    }

    /// Sets how long a request waits for its response.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Builds the client configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the broker URI does not parse or the request
    /// timeout is zero.
    pub fn build(self) -> Result<ClientConfig, ConfigError> {
        let transport = match self.transport {
            Some(transport) => transport,
            None => TransportConfig::from_uri(
                self.broker_uri.as_deref().unwrap_or(DEFAULT_BROKER_URI),
            )?,
        };
        let request_timeout = self.request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT);
        if request_timeout.is_zero() {
            return Err(ConfigError::new("request_timeout must be positive"));
        }
        Ok(ClientConfig {
            transport,
            client_id: self.client_id,
            user_name: self.user_name,
            password: self.password,
            request_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_tcp_defaults() {
        let config = TcpTransportConfig::from_uri("tcp://broker.example.com").unwrap();
        assert_eq!(config.host(), "broker.example.com");
        assert_eq!(config.port(), DEFAULT_PORT);
        assert_eq!(config.connection_timeout(), DEFAULT_CONNECTION_TIMEOUT);
        assert!(config.tcp_no_delay());
        assert_eq!(config.wire_format().version(), 9);
        assert_eq!(config.uri(), "tcp://broker.example.com:61616");
    }

    #[test]
    fn test_tcp_options() {
        let config = TcpTransportConfig::from_uri(
            "tcp://127.0.0.1:5000?connectionTimeout=2500&tcpNoDelay=false\
             &wireFormat.tightEncodingEnabled=false&wireFormat.cacheSize=64\
             &wireFormat.maxInactivityDuration=0&wireFormat.version=6\
             &wireFormat.maxInactivityDurationInitalDelay=500",
        )
        .unwrap();
        assert_eq!(config.port(), 5000);
        assert_eq!(config.connection_timeout(), Duration::from_millis(2500));
        assert!(!config.tcp_no_delay());
        let wf = config.wire_format();
        assert!(!wf.tight_encoding_enabled());
        assert_eq!(wf.cache_size(), 64);
        assert_eq!(wf.version(), 6);
        assert_eq!(wf.max_inactivity_duration(), Duration::ZERO);
        assert_eq!(wf.max_inactivity_initial_delay(), Duration::from_millis(500));
    }

    #[test]
    fn test_tcp_ipv6_host() {
        let config = TcpTransportConfig::from_uri("tcp://[::1]:61617").unwrap();
        assert_eq!(config.host(), "::1");
        assert_eq!(config.uri(), "tcp://[::1]:61617");
    }

    #[test]
    fn test_tcp_rejects_unknown_option_and_scheme() {
        let err = TcpTransportConfig::from_uri("tcp://localhost?soLinger=1").unwrap_err();
        assert!(err.to_string().contains("soLinger"));
        assert!(TcpTransportConfig::from_uri("tcp://localhost?wireFormat.bogus=1").is_err());
        assert!(TcpTransportConfig::from_uri("udp://localhost").is_err());
        assert!(TcpTransportConfig::from_uri("tcp://localhost?tcpNoDelay=maybe").is_err());
        assert!(TcpTransportConfig::from_uri("tcp://localhost?wireFormat.version=12").is_err());
    }

    #[test]
    fn test_failover_uri_with_options() {
        let config = FailoverConfig::from_uri(
            "failover:(tcp://a:61616,tcp://b:61616)?initialReconnectDelay=100\
             &maxReconnectDelay=5000&useExponentialBackOff=false&backOffMultiplier=1.5\
             &maxReconnectAttempts=7&startupMaxReconnectAttempts=2&randomize=false\
             &priorityBackup=true&priorityURIs=tcp://b:61616&backup=true&backupPoolSize=2\
             &timeout=3000&updateURIsSupported=false&reconnectSupported=false",
        )
        .unwrap();
        assert_eq!(config.uris(), &[url("tcp://a:61616"), url("tcp://b:61616")]);
        assert_eq!(config.initial_reconnect_delay(), Duration::from_millis(100));
        assert_eq!(config.max_reconnect_delay(), Duration::from_secs(5));
        assert!(!config.use_exponential_back_off());
        assert_eq!(config.back_off_multiplier(), 1.5);
        assert_eq!(config.max_reconnect_attempts(), 7);
        assert_eq!(config.startup_max_reconnect_attempts(), 2);
        assert!(!config.randomize());
        assert!(config.priority_backup());
        assert_eq!(config.priority_uris(), &[url("tcp://b:61616")]);
        assert!(config.is_priority(&url("tcp://b:61616")));
        assert!(!config.is_priority(&url("tcp://a:61616")));
        assert!(config.backup());
        assert_eq!(config.backup_pool_size(), 2);
        assert_eq!(config.timeout(), Some(Duration::from_secs(3)));
        assert!(!config.update_uris_supported());
        assert!(!config.reconnect_supported());
    }

    #[test]
    fn test_failover_bare_form_and_defaults() {
        let config = FailoverConfig::from_uri("failover:tcp://a:1,tcp://b:2").unwrap();
        assert_eq!(config.uris().len(), 2);
        assert_eq!(config.initial_reconnect_delay(), Duration::from_millis(10));
        assert_eq!(config.max_reconnect_delay(), Duration::from_secs(30));
        assert!(config.use_exponential_back_off());
        assert_eq!(config.max_reconnect_attempts(), UNLIMITED_RECONNECT_ATTEMPTS);
        assert!(config.randomize());
        assert_eq!(config.timeout(), None);
        assert!(config.is_priority(&url("tcp://a:1")));

        let config = FailoverConfig::from_uri("failover://(tcp://a:1)").unwrap();
        assert_eq!(config.uris(), &[url("tcp://a:1")]);
    }

    #[test]
    fn test_failover_timeout_minus_one_is_unbounded() {
        let config = FailoverConfig::from_uri("failover:(tcp://a:1)?timeout=-1").unwrap();
        assert_eq!(config.timeout(), None);
    }

    #[test]
    fn test_failover_uri_errors() {
        assert!(FailoverConfig::from_uri("tcp://a:1").is_err());
        assert!(FailoverConfig::from_uri("failover:()").is_err());
        assert!(FailoverConfig::from_uri("failover:(tcp://a:1").is_err());
        assert!(FailoverConfig::from_uri("failover:(tcp://a:1)x").is_err());
        let err = FailoverConfig::from_uri("failover:(tcp://a:1)?jitter=2").unwrap_err();
        assert!(err.to_string().contains("unknown failover option"));
        assert!(FailoverConfig::from_uri("failover:(tcp://a:1)?maxReconnectAttempts=-2").is_err());
    }

    #[test]
    fn test_attempt_limit_selection() {
        let config = FailoverConfig::builder()
            .add_uri(url("tcp://a:1"))
            .max_reconnect_attempts(5)
            .startup_max_reconnect_attempts(2)
            .build()
            .unwrap();
        assert_eq!(config.reconnect_attempt_limit(true), 2);
        assert_eq!(config.reconnect_attempt_limit(false), 5);

        let config = FailoverConfig::builder()
            .add_uri(url("tcp://a:1"))
            .max_reconnect_attempts(5)
            .build()
            .unwrap();
        assert_eq!(config.reconnect_attempt_limit(true), 5);
    }

    #[test]
    fn test_failover_builder_validation() {
        assert!(FailoverConfig::builder().build().is_err());
        assert!(FailoverConfig::builder()
            .add_uri(url("tcp://a:1"))
            .initial_reconnect_delay(Duration::from_secs(60))
            .max_reconnect_delay(Duration::from_secs(1))
            .build()
            .is_err());
        assert!(FailoverConfig::builder()
            .add_uri(url("tcp://a:1"))
            .back_off_multiplier(0.5)
            .build()
            .is_err());
        assert!(FailoverConfig::builder()
            .add_uri(url("tcp://a:1"))
            .backup_pool_size(0)
            .build()
            .is_err());
    }

    #[test]
    fn test_builder_from_config_keeps_values() {
        let config = FailoverConfig::from_uri("failover:(tcp://a:1)?randomize=false&timeout=50")
            .unwrap();
        let rebuilt = FailoverConfigBuilder::from(config.clone()).build().unwrap();
        assert_eq!(rebuilt, config);
    }

    #[test]
    fn test_client_config_builder() {
        let config = ClientConfigBuilder::new()
            .broker_uri("failover:(tcp://a:1,tcp://b:1)")
            .client_id("client-1")
            .credentials("guest", "secret")
            .build()
            .unwrap();
        assert!(matches!(config.transport(), TransportConfig::Failover(_)));
        assert_eq!(config.client_id(), Some("client-1"));
        assert_eq!(config.user_name(), Some("guest"));
        assert_eq!(config.password(), Some("secret"));
        assert_eq!(config.request_timeout(), DEFAULT_REQUEST_TIMEOUT);

        let config = ClientConfigBuilder::new().build().unwrap();
        match config.transport() {
            TransportConfig::Tcp(tcp) => assert_eq!(tcp.host(), "localhost"),
            other => panic!("unexpected transport {:?}", other),
        }
    }

    #[test]
    fn test_config_error_converts() {
        let err: OpenWireError = ConfigError::new("bad").into();
        assert!(matches!(err, OpenWireError::Configuration(ref m) if m == "bad"));
        assert_eq!(ConfigError::new("bad").to_string(), "configuration error: bad");
    }
}
