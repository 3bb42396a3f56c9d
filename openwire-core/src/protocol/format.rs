//! The OpenWire wire format: encoding mode, marshal caches and negotiation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::commands::{Command, WireFormatInfo};
use crate::error::{OpenWireError, Result};
use crate::protocol::constants::{self, MAX_SUPPORTED_VERSION, MIN_SUPPORTED_VERSION};
use crate::protocol::marshal::{DataStructure, MarshalFields};
use crate::protocol::registry::{DataStreamMarshaller, MarshallerRegistry};
use crate::serialization::{BooleanStream, ByteInput, ByteOutput, DataInput, DataOutput};

/// Default protocol version offered during negotiation.
pub const DEFAULT_VERSION: i32 = MAX_SUPPORTED_VERSION;
/// Default number of marshal cache slots.
pub const DEFAULT_CACHE_SIZE: i32 = 1024;
/// Default inactivity timeout.
pub const DEFAULT_MAX_INACTIVITY_DURATION: Duration = Duration::from_secs(30);
/// Default delay before inactivity monitoring starts.
pub const DEFAULT_MAX_INACTIVITY_INITIAL_DELAY: Duration = Duration::from_secs(10);
/// Default upper bound on a single frame.
pub const DEFAULT_MAX_FRAME_SIZE: u64 = 100 * 1024 * 1024;
/// Fewest cache slots a builder accepts. A dispatched message references at
/// most eight cacheable structures, and one marshal must never reuse a slot
/// it filled itself.
pub const MIN_CACHE_SIZE: i32 = 16;

/// Cache slots kept free ahead of each top-level marshal.
const MARSHAL_CACHE_FREE_SPACE: usize = 100;
const MAX_NESTING_DEPTH: usize = 64;

/// Capabilities a peer offers, or the result of negotiating them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireFormatSettings {
    version: i32,
    tight_encoding_enabled: bool,
    size_prefix_disabled: bool,
    cache_enabled: bool,
    cache_size: i32,
    stack_trace_enabled: bool,
    tcp_no_delay_enabled: bool,
    max_inactivity_duration: Duration,
    max_inactivity_initial_delay: Duration,
    max_frame_size: u64,
}

impl WireFormatSettings {
    /// Creates a new settings builder.
    pub fn builder() -> WireFormatSettingsBuilder {
        WireFormatSettingsBuilder::new()
    }

    /// Returns the protocol version.
    pub fn version(&self) -> i32 {
        self.version
    }

    /// Returns whether tight encoding is enabled.
    pub fn tight_encoding_enabled(&self) -> bool {
        self.tight_encoding_enabled
    }

    /// Returns whether the 4-byte frame length prefix is omitted.
    pub fn size_prefix_disabled(&self) -> bool {
        self.size_prefix_disabled
    }

    /// Returns whether the marshal cache is enabled.
    pub fn cache_enabled(&self) -> bool {
        self.cache_enabled
    }

    /// Returns the number of marshal cache slots.
    pub fn cache_size(&self) -> i32 {
        self.cache_size
    }

    /// Returns whether exception stack traces are marshalled.
    pub fn stack_trace_enabled(&self) -> bool {
        self.stack_trace_enabled
    }

    /// Returns whether Nagle's algorithm should be disabled on the socket.
    pub fn tcp_no_delay_enabled(&self) -> bool {
        self.tcp_no_delay_enabled
    }

    /// Returns the inactivity timeout; zero disables monitoring.
    pub fn max_inactivity_duration(&self) -> Duration {
        self.max_inactivity_duration
    }

    /// Returns the delay before inactivity monitoring starts.
    pub fn max_inactivity_initial_delay(&self) -> Duration {
        self.max_inactivity_initial_delay
    }

    /// Returns the largest accepted frame in bytes.
    pub fn max_frame_size(&self) -> u64 {
        self.max_frame_size
    }

    /// Builds the capability record announcing these settings.
    pub fn to_wire_format_info(&self) -> Result<WireFormatInfo> {
        let mut info = WireFormatInfo::new(self.version);
        info.update_properties(|props| {
            props.insert(WireFormatInfo::TIGHT_ENCODING_ENABLED, self.tight_encoding_enabled);
            props.insert(WireFormatInfo::SIZE_PREFIX_DISABLED, self.size_prefix_disabled);
            props.insert(WireFormatInfo::CACHE_ENABLED, self.cache_enabled);
            props.insert(WireFormatInfo::CACHE_SIZE, self.cache_size);
            props.insert(WireFormatInfo::STACK_TRACE_ENABLED, self.stack_trace_enabled);
            props.insert(WireFormatInfo::TCP_NO_DELAY_ENABLED, self.tcp_no_delay_enabled);
            props.insert(
                WireFormatInfo::MAX_INACTIVITY_DURATION,
                self.max_inactivity_duration.as_millis() as i64,
            );
            props.insert(
                WireFormatInfo::MAX_INACTIVITY_INITIAL_DELAY,
                self.max_inactivity_initial_delay.as_millis() as i64,
            );
            props.insert(WireFormatInfo::MAX_FRAME_SIZE, self.max_frame_size as i64);
        })?;
        Ok(info)
    }

    /// Combines these (preferred) settings with a peer's offer: the minimum of
    /// each numeric limit and the conjunction of each flag.
    pub fn negotiate(&self, peer: &WireFormatInfo) -> Result<WireFormatSettings> {
        let props = peer.properties()?;
        let flag = |key: &str| props.get_bool(key).unwrap_or(false);
        let millis = |key: &str| Duration::from_millis(props.get_long(key).unwrap_or(0).max(0) as u64);

        let version = self.version.min(peer.version);
        if version < MIN_SUPPORTED_VERSION {
            return Err(OpenWireError::Protocol(format!(
                "peer offered unsupported protocol version {}",
                peer.version
            )));
        }

        let cache_enabled = self.cache_enabled && flag(WireFormatInfo::CACHE_ENABLED);
        let mut cache_size = self
            .cache_size
            .min(props.get_int(WireFormatInfo::CACHE_SIZE).unwrap_or(0));
        if cache_size <= 0 {
            cache_size = DEFAULT_CACHE_SIZE;
        }

        let max_frame_size = match props.get_long(WireFormatInfo::MAX_FRAME_SIZE) {
            Some(peer_max) if peer_max > 0 => self.max_frame_size.min(peer_max as u64),
            _ => self.max_frame_size,
        };

        Ok(WireFormatSettings {
            version,
            tight_encoding_enabled: self.tight_encoding_enabled
                && flag(WireFormatInfo::TIGHT_ENCODING_ENABLED),
            size_prefix_disabled: self.size_prefix_disabled
                && flag(WireFormatInfo::SIZE_PREFIX_DISABLED),
            cache_enabled,
            cache_size,
            stack_trace_enabled: self.stack_trace_enabled
                && flag(WireFormatInfo::STACK_TRACE_ENABLED),
            tcp_no_delay_enabled: self.tcp_no_delay_enabled
                && flag(WireFormatInfo::TCP_NO_DELAY_ENABLED),
            max_inactivity_duration: self
                .max_inactivity_duration
                .min(millis(WireFormatInfo::MAX_INACTIVITY_DURATION)),
            max_inactivity_initial_delay: self
                .max_inactivity_initial_delay
                .min(millis(WireFormatInfo::MAX_INACTIVITY_INITIAL_DELAY)),
            max_frame_size,
        })
    }
}

impl Default for WireFormatSettings {
    fn default() -> Self {
        WireFormatSettings {
            version: DEFAULT_VERSION,
            tight_encoding_enabled: true,
            size_prefix_disabled: false,
            cache_enabled: true,
            cache_size: DEFAULT_CACHE_SIZE,
            stack_trace_enabled: true,
            tcp_no_delay_enabled: true,
            max_inactivity_duration: DEFAULT_MAX_INACTIVITY_DURATION,
            max_inactivity_initial_delay: DEFAULT_MAX_INACTIVITY_INITIAL_DELAY,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// Builder for `WireFormatSettings`.
#[derive(Debug, Clone, Default)]
pub struct WireFormatSettingsBuilder {
    version: Option<i32>,
    tight_encoding_enabled: Option<bool>,
    size_prefix_disabled: Option<bool>,
    cache_enabled: Option<bool>,
    cache_size: Option<i32>,
    stack_trace_enabled: Option<bool>,
    tcp_no_delay_enabled: Option<bool>,
    max_inactivity_duration: Option<Duration>,
    max_inactivity_initial_delay: Option<Duration>,
    max_frame_size: Option<u64>,
}

impl WireFormatSettingsBuilder {
    /// Creates a new builder with every option unset.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the protocol version to offer.
    pub fn version(mut self, version: i32) -> Self {
        self.version = Some(version);
        self
    }

    /// Enables or disables tight encoding.
    pub fn tight_encoding_enabled(mut self, enabled: bool) -> Self {
        self.tight_encoding_enabled = Some(enabled);
        self
    }

    /// Omits the frame length prefix when set.
    pub fn size_prefix_disabled(mut self, disabled: bool) -> Self {
        self.size_prefix_disabled = Some(disabled);
        self
    }

    /// Enables or disables the marshal cache.
    pub fn cache_enabled(mut self, enabled: bool) -> Self {
        self.cache_enabled = Some(enabled);
        self
    }

    /// Sets the number of marshal cache slots.
    pub fn cache_size(mut self, size: i32) -> Self {
        self.cache_size = Some(size);
        self
    }

    /// Enables or disables marshalling of exception stack traces.
    pub fn stack_trace_enabled(mut self, enabled: bool) -> Self {
        self.stack_trace_enabled = Some(enabled);
        self
    }

    /// Enables or disables TCP_NODELAY.
    pub fn tcp_no_delay_enabled(mut self, enabled: bool) -> Self {
        self.tcp_no_delay_enabled = Some(enabled);
        self
    }

    /// Sets the inactivity timeout; zero disables monitoring.
    pub fn max_inactivity_duration(mut self, duration: Duration) -> Self {
        self.max_inactivity_duration = Some(duration);
        self
    }

    /// Sets the delay before inactivity monitoring starts.
    pub fn max_inactivity_initial_delay(mut self, delay: Duration) -> Self {
        self.max_inactivity_initial_delay = Some(delay);
        self
    }

    /// Sets the largest accepted frame in bytes.
    pub fn max_frame_size(mut self, size: u64) -> Self {
        self.max_frame_size = Some(size);
        self
    }

    /// Builds the settings, returning an error if validation fails.
    ///
    /// # Errors
    ///
    /// Returns `OpenWireError::Configuration` if:
    /// - `version` is outside 1..=9
    /// - `cache_size` is not between `MIN_CACHE_SIZE` and `i16::MAX`
    /// - `max_frame_size` is zero
    pub fn build(self) -> Result<WireFormatSettings> {
        let defaults = WireFormatSettings::default();
        let settings = WireFormatSettings {
            version: self.version.unwrap_or(defaults.version),
            tight_encoding_enabled: self
                .tight_encoding_enabled
                .unwrap_or(defaults.tight_encoding_enabled),
            size_prefix_disabled: self
                .size_prefix_disabled
                .unwrap_or(defaults.size_prefix_disabled),
            cache_enabled: self.cache_enabled.unwrap_or(defaults.cache_enabled),
            cache_size: self.cache_size.unwrap_or(defaults.cache_size),
            stack_trace_enabled: self
                .stack_trace_enabled
                .unwrap_or(defaults.stack_trace_enabled),
            tcp_no_delay_enabled: self
                .tcp_no_delay_enabled
                .unwrap_or(defaults.tcp_no_delay_enabled),
            max_inactivity_duration: self
                .max_inactivity_duration
                .unwrap_or(defaults.max_inactivity_duration),
            max_inactivity_initial_delay: self
                .max_inactivity_initial_delay
                .unwrap_or(defaults.max_inactivity_initial_delay),
            max_frame_size: self.max_frame_size.unwrap_or(defaults.max_frame_size),
        };

        check_version(settings.version)?;
        if settings.cache_size < MIN_CACHE_SIZE || settings.cache_size > i16::MAX as i32 {
            return Err(OpenWireError::Configuration(format!(
                "cache_size must be between {} and {}, got {}",
                MIN_CACHE_SIZE,
                i16::MAX,
                settings.cache_size
            )));
        }
        if settings.max_frame_size == 0 {
            return Err(OpenWireError::Configuration(
                "max_frame_size must be greater than zero".to_string(),
            ));
        }
        Ok(settings)
    }
}

fn check_version(version: i32) -> Result<()> {
    if !(MIN_SUPPORTED_VERSION..=MAX_SUPPORTED_VERSION).contains(&version) {
        return Err(OpenWireError::Configuration(format!(
            "protocol version {} is not supported (expected {}..={})",
            version, MIN_SUPPORTED_VERSION, MAX_SUPPORTED_VERSION
        )));
    }
    Ok(())
}

/// Value-to-index side of the cache, filled round-robin.
///
/// Slots written by the marshal in progress are journaled with their previous
/// contents so that a failed marshal can be undone before the peer sees it.
#[derive(Debug, Default)]
struct MarshalCache {
    slots: Vec<Option<Option<Command>>>,
    index: HashMap<Option<Command>, i16>,
    next_index: usize,
    next_eviction: usize,
    journal: Vec<(usize, Option<Option<Command>>)>,
    journal_start: usize,
}

impl MarshalCache {
    fn with_size(size: usize) -> Self {
        Self {
            slots: vec![None; size],
            ..Self::default()
        }
    }

    fn lookup(&self, key: &Option<Command>) -> Option<i16> {
        self.index.get(key).copied()
    }

    fn begin(&mut self) {
        self.journal.clear();
        self.journal_start = self.next_index;
    }

    fn add(&mut self, key: Option<Command>) -> Result<i16> {
        if self.slots.is_empty() {
            return Ok(-1);
        }
        if self.journal.len() >= self.slots.len() {
            return Err(OpenWireError::Protocol(format!(
                "command references more cacheable structures than the {} cache slots",
                self.slots.len()
            )));
        }
        let slot = self.next_index;
        self.next_index = (slot + 1) % self.slots.len();
        let stale = self.slots[slot].take();
        if let Some(stale) = &stale {
            self.index.remove(stale);
        }
        self.journal.push((slot, stale));
        self.slots[slot] = Some(key.clone());
        self.index.insert(key, slot as i16);
        Ok(slot as i16)
    }

    /// Restores every slot written since [`begin`](Self::begin).
    fn rollback(&mut self) {
        while let Some((slot, previous)) = self.journal.pop() {
            if let Some(added) = self.slots[slot].take() {
                self.index.remove(&added);
            }
            if let Some(previous) = &previous {
                self.index.insert(previous.clone(), slot as i16);
            }
            self.slots[slot] = previous;
        }
        self.next_index = self.journal_start;
    }

    fn evict_to_free_space(&mut self) {
        let size = self.slots.len();
        let limit = size - MARSHAL_CACHE_FREE_SPACE.min(size);
        while self.index.len() > limit {
            if let Some(evicted) = self.slots[self.next_eviction].take() {
                self.index.remove(&evicted);
            }
            self.next_eviction = (self.next_eviction + 1) % size;
        }
    }
}

/// Marshals and unmarshals commands under one peer's negotiated settings.
///
/// Each connection owns one instance. Its caches mirror the peer's and are
/// only valid for the lifetime of that connection.
pub struct OpenWireFormat {
    preferred: WireFormatSettings,
    active: WireFormatSettings,
    registry: Arc<MarshallerRegistry>,
    marshal_cache: MarshalCache,
    unmarshal_cache: Vec<Option<Option<Command>>>,
    depth: usize,
}

impl std::fmt::Debug for OpenWireFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenWireFormat")
            .field("active", &self.active)
            .field("cached_entries", &self.marshal_cache.index.len())
            .finish()
    }
}

impl OpenWireFormat {
    /// Creates a format whose settings take effect immediately.
    pub fn new(settings: WireFormatSettings) -> Self {
        let mut format = OpenWireFormat {
            preferred: settings.clone(),
            active: settings,
            registry: MarshallerRegistry::standard(),
            marshal_cache: MarshalCache::default(),
            unmarshal_cache: Vec::new(),
            depth: 0,
        };
        format.reset_caches();
        format
    }

    /// Creates a format for the start of a connection: loose encoding with no
    /// cache until [`renegotiate`](Self::renegotiate) applies the agreed settings.
    pub fn for_negotiation(preferred: WireFormatSettings) -> Self {
        let mut active = preferred.clone();
        active.tight_encoding_enabled = false;
        active.cache_enabled = false;
        active.size_prefix_disabled = false;
        let mut format = Self::new(active);
        format.preferred = preferred;
        format
    }

    /// The settings currently in force.
    pub fn settings(&self) -> &WireFormatSettings {
        &self.active
    }

    /// The settings this side offers during negotiation.
    pub fn preferred(&self) -> &WireFormatSettings {
        &self.preferred
    }

    /// Returns the active protocol version.
    pub fn version(&self) -> i32 {
        self.active.version
    }

    /// Changes the active protocol version.
    pub fn set_version(&mut self, version: i32) -> Result<()> {
        check_version(version)?;
        self.active.version = version;
        Ok(())
    }

    /// Returns whether tight encoding is in force.
    pub fn is_tight_encoding_enabled(&self) -> bool {
        self.active.tight_encoding_enabled
    }

    /// Returns whether the marshal cache is in force.
    pub fn is_cache_enabled(&self) -> bool {
        self.active.cache_enabled && !self.unmarshal_cache.is_empty()
    }

    /// Returns whether exception stack traces are marshalled.
    pub fn is_stack_trace_enabled(&self) -> bool {
        self.active.stack_trace_enabled
    }

    /// Returns whether frames omit the length prefix.
    pub fn is_size_prefix_disabled(&self) -> bool {
        self.active.size_prefix_disabled
    }

    /// Returns the largest accepted frame in bytes.
    pub fn max_frame_size(&self) -> u64 {
        self.active.max_frame_size
    }

    /// The capability record to send to the peer.
    pub fn preferred_wire_format_info(&self) -> Result<WireFormatInfo> {
        self.preferred.to_wire_format_info()
    }

    /// Applies the outcome of negotiating with the peer's capability record
    /// and resets both caches.
    pub fn renegotiate(&mut self, peer: &WireFormatInfo) -> Result<()> {
        if !peer.is_valid() {
            return Err(OpenWireError::Protocol(
                "peer sent a wire format info without the ActiveMQ magic".to_string(),
            ));
        }
        self.active = self.preferred.negotiate(peer)?;
        self.reset_caches();
        tracing::debug!(
            version = self.active.version,
            tight = self.active.tight_encoding_enabled,
            cache = self.active.cache_enabled,
            cache_size = self.active.cache_size,
            "wire format renegotiated"
        );
        Ok(())
    }

    fn reset_caches(&mut self) {
        if self.active.cache_enabled {
            let size = self.active.cache_size.max(1) as usize;
            self.marshal_cache = MarshalCache::with_size(size);
            self.unmarshal_cache = vec![None; size];
        } else {
            self.marshal_cache = MarshalCache::default();
            self.unmarshal_cache = Vec::new();
        }
    }

    /// Looks up the marshaller for a type code.
    pub fn marshaller(&self, data_type: u8) -> Result<Arc<dyn DataStreamMarshaller>> {
        self.registry
            .get(data_type)
            .ok_or(OpenWireError::UnknownDataType(data_type))
    }

    pub(crate) fn marshal_cache_index(&self, key: &Option<Command>) -> Option<i16> {
        self.marshal_cache.lookup(key)
    }

    pub(crate) fn add_to_marshal_cache(&mut self, key: Option<Command>) -> Result<i16> {
        self.marshal_cache.add(key)
    }

    pub(crate) fn set_in_unmarshal_cache(
        &mut self,
        index: i16,
        value: Option<Command>,
    ) -> Result<()> {
        let slot = usize::try_from(index)
            .ok()
            .and_then(|i| self.unmarshal_cache.get_mut(i))
            .ok_or(OpenWireError::CacheDesync(index))?;
        *slot = Some(value);
        Ok(())
    }

    pub(crate) fn get_from_unmarshal_cache(&self, index: i16) -> Result<Option<Command>> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.unmarshal_cache.get(i))
            .and_then(|slot| slot.clone())
            .ok_or(OpenWireError::CacheDesync(index))
    }

    pub(crate) fn enter_nested(&mut self) -> Result<()> {
        if self.depth >= MAX_NESTING_DEPTH {
            return Err(OpenWireError::Serialization(format!(
                "structures nested deeper than {}",
                MAX_NESTING_DEPTH
            )));
        }
        self.depth += 1;
        Ok(())
    }

    pub(crate) fn exit_nested(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    fn check_frame_size(&self, size: usize) -> Result<()> {
        if size as u64 > self.active.max_frame_size {
            return Err(OpenWireError::Protocol(format!(
                "frame size of {} bytes exceeds maximum of {}",
                size, self.active.max_frame_size
            )));
        }
        Ok(())
    }

    /// Appends one framed command to `out`.
    ///
    /// On error nothing is appended and the marshal cache is left as it was,
    /// so the connection stays usable.
    pub fn marshal(&mut self, command: &Command, out: &mut ByteOutput) -> Result<()> {
        let start = out.len();
        if self.is_cache_enabled() {
            self.marshal_cache.evict_to_free_space();
        }
        self.marshal_cache.begin();
        let result = self.marshal_frame(command, out);
        if let Err(e) = &result {
            tracing::debug!(command = command.type_name(), error = %e, "marshal failed, undoing cache updates");
            self.marshal_cache.rollback();
            out.truncate(start);
        }
        result
    }

    fn marshal_frame(&mut self, command: &Command, out: &mut ByteOutput) -> Result<()> {
        let data_type = command.data_structure_type();
        self.marshaller(data_type)?;
        let prefixed = !self.active.size_prefix_disabled;

        if self.active.tight_encoding_enabled {
            let mut bs = BooleanStream::new();
            let body = command.tight_marshal1(self, &mut bs)?;
            let size = 1 + body + bs.marshalled_size();
            if prefixed {
                self.check_frame_size(size)?;
                out.write_int(size as i32)?;
            }
            out.write_byte(data_type)?;
            bs.marshal(out)?;
            command.tight_marshal2(self, out, &mut bs)?;
        } else {
            let start = out.len();
            if prefixed {
                out.write_int(0)?;
            }
            out.write_byte(data_type)?;
            command.loose_marshal(self, out)?;
            if prefixed {
                let size = out.len() - start - 4;
                self.check_frame_size(size)?;
                out.patch_int(start, size as i32)?;
            }
        }
        Ok(())
    }

    /// Appends the null command: a single type byte of zero.
    pub fn marshal_null(&mut self, out: &mut ByteOutput) -> Result<()> {
        if !self.active.size_prefix_disabled {
            out.write_int(1)?;
        }
        out.write_byte(constants::NULL)
    }

    /// Marshals one command into a fresh buffer.
    pub fn marshal_to_vec(&mut self, command: &Command) -> Result<Vec<u8>> {
        let mut out = ByteOutput::new();
        self.marshal(command, &mut out)?;
        Ok(out.into_bytes())
    }

    /// Reads one framed command. The null command yields `None`.
    pub fn unmarshal(&mut self, input: &mut ByteInput<'_>) -> Result<Option<Command>> {
        if !self.active.size_prefix_disabled {
            let size = input.read_int()?;
            let size = usize::try_from(size).map_err(|_| {
                OpenWireError::Protocol(format!("negative frame size: {}", size))
            })?;
            self.check_frame_size(size)?;
            if input.remaining() < size {
                return Err(OpenWireError::UnexpectedEof {
                    needed: size,
                    remaining: input.remaining(),
                });
            }
        }
        let data_type = input.read_byte()?;
        if data_type == constants::NULL {
            return Ok(None);
        }
        self.depth = 0;
        let mut command = Command::create(self, data_type)?;
        if self.active.tight_encoding_enabled {
            let mut bs = BooleanStream::unmarshal(input)?;
            command.tight_unmarshal(self, input, &mut bs)?;
        } else {
            command.loose_unmarshal(self, input)?;
        }
        Ok(Some(command))
    }

    /// Unmarshals one command from a complete frame.
    pub fn unmarshal_from_slice(&mut self, bytes: &[u8]) -> Result<Option<Command>> {
        let mut input = ByteInput::new(bytes);
        self.unmarshal(&mut input)
    }
}

impl Default for OpenWireFormat {
    fn default() -> Self {
        Self::new(WireFormatSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{
        ConsumerId, Destination, DestinationKind, KeepAliveInfo, Message, MessageKind, ProducerId,
        SessionId, SessionInfo,
    };

    fn settings(tight: bool, cache: bool) -> WireFormatSettings {
        WireFormatSettings::builder()
            .tight_encoding_enabled(tight)
            .cache_enabled(cache)
            .build()
            .unwrap()
    }

    fn message_to(queue: &str) -> Command {
        let mut message = Message::with_kind(MessageKind::Text);
        message.command_id = 5;
        message.destination = Some(Destination::new(DestinationKind::Queue, queue));
        message.producer_id = Some(ProducerId::new("ID:conn-1", 1, 1));
        message.into()
    }

    #[test]
    fn test_default_settings() {
        let s = WireFormatSettings::default();
        assert_eq!(s.version(), 9);
        assert!(s.tight_encoding_enabled());
        assert!(s.cache_enabled());
        assert_eq!(s.cache_size(), 1024);
        assert!(!s.size_prefix_disabled());
        assert_eq!(s.max_inactivity_duration(), Duration::from_secs(30));
        assert_eq!(s.max_frame_size(), 100 * 1024 * 1024);
    }

    #[test]
    fn test_builder_rejects_bad_values() {
        assert!(WireFormatSettings::builder().version(10).build().is_err());
        assert!(WireFormatSettings::builder().version(0).build().is_err());
        assert!(WireFormatSettings::builder().cache_size(0).build().is_err());
        assert!(WireFormatSettings::builder().cache_size(1).build().is_err());
        assert!(WireFormatSettings::builder()
            .cache_size(MIN_CACHE_SIZE)
            .build()
            .is_ok());
        assert!(WireFormatSettings::builder().max_frame_size(0).build().is_err());
    }

    #[test]
    fn test_set_version_rejects_unsupported() {
        let mut wf = OpenWireFormat::default();
        assert!(wf.set_version(10).is_err());
        wf.set_version(3).unwrap();
        assert_eq!(wf.version(), 3);
    }

    #[test]
    fn test_null_command_frame() {
        let mut wf = OpenWireFormat::default();
        let mut out = ByteOutput::new();
        wf.marshal_null(&mut out).unwrap();
        assert_eq!(out.as_bytes(), &[0, 0, 0, 1, 0]);
        assert!(wf.unmarshal_from_slice(out.as_bytes()).unwrap().is_none());
    }

    #[test]
    fn test_frame_length_matches_body() {
        for tight in [true, false] {
            let mut wf = OpenWireFormat::new(settings(tight, false));
            let bytes = wf.marshal_to_vec(&message_to("orders")).unwrap();
            let declared = i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            assert_eq!(declared as usize, bytes.len() - 4, "tight={}", tight);
        }
    }

    #[test]
    fn test_repeated_destination_is_cached() {
        let mut writer = OpenWireFormat::new(settings(true, true));
        let mut reader = OpenWireFormat::new(settings(true, true));

        let first = writer.marshal_to_vec(&message_to("orders")).unwrap();
        let second = writer.marshal_to_vec(&message_to("orders")).unwrap();
        assert!(second.len() < first.len());

        assert_eq!(
            reader.unmarshal_from_slice(&first).unwrap(),
            Some(message_to("orders"))
        );
        assert_eq!(
            reader.unmarshal_from_slice(&second).unwrap(),
            Some(message_to("orders"))
        );
    }

    #[test]
    fn test_loose_encoding_uses_cache() {
        let mut writer = OpenWireFormat::new(settings(false, true));
        let mut reader = OpenWireFormat::new(settings(false, true));

        let first = writer.marshal_to_vec(&message_to("orders")).unwrap();
        let second = writer.marshal_to_vec(&message_to("orders")).unwrap();
        assert!(second.len() < first.len());
        reader.unmarshal_from_slice(&first).unwrap();
        assert_eq!(
            reader.unmarshal_from_slice(&second).unwrap(),
            Some(message_to("orders"))
        );
    }

    #[test]
    fn test_unpopulated_cache_slot_is_desync() {
        let mut writer = OpenWireFormat::new(settings(true, true));
        let mut reader = OpenWireFormat::new(settings(true, true));
        writer.marshal_to_vec(&message_to("orders")).unwrap();
        let second = writer.marshal_to_vec(&message_to("orders")).unwrap();
        assert!(matches!(
            reader.unmarshal_from_slice(&second),
            Err(OpenWireError::CacheDesync(_))
        ));
    }

    #[test]
    fn test_cache_wraps_without_desync() {
        let small = WireFormatSettings::builder().cache_size(150).build().unwrap();
        let mut writer = OpenWireFormat::new(small.clone());
        let mut reader = OpenWireFormat::new(small);
        for round in 0..3 {
            for i in 0..120 {
                let command = message_to(&format!("queue.{}", i));
                let bytes = writer.marshal_to_vec(&command).unwrap();
                assert_eq!(
                    reader.unmarshal_from_slice(&bytes).unwrap(),
                    Some(command),
                    "round {} queue {}",
                    round,
                    i
                );
            }
        }
    }

    #[test]
    fn test_unknown_type_code() {
        let mut wf = OpenWireFormat::default();
        let frame = [0, 0, 0, 2, 200, 0];
        assert!(matches!(
            wf.unmarshal_from_slice(&frame),
            Err(OpenWireError::UnknownDataType(200))
        ));
    }

    #[test]
    fn test_frame_larger_than_max_is_rejected() {
        let small = WireFormatSettings::builder().max_frame_size(16).build().unwrap();
        let mut wf = OpenWireFormat::new(small);
        let frame = [0, 0, 1, 0, 10];
        assert!(matches!(
            wf.unmarshal_from_slice(&frame),
            Err(OpenWireError::Protocol(_))
        ));
        assert!(wf.marshal_to_vec(&message_to("a-long-queue-name")).is_err());
    }

    #[test]
    fn test_rejected_frame_leaves_cache_untouched() {
        for tight in [true, false] {
            let small = WireFormatSettings::builder()
                .tight_encoding_enabled(tight)
                .max_frame_size(256)
                .build()
                .unwrap();
            let mut writer = OpenWireFormat::new(small.clone());
            let mut reader = OpenWireFormat::new(small);

            let mut oversized = message_to("orders");
            if let Command::Message(message) = &mut oversized {
                message.set_text(Some(&"x".repeat(1000)));
            }
            let mut out = ByteOutput::new();
            assert!(matches!(
                writer.marshal(&oversized, &mut out),
                Err(OpenWireError::Protocol(_))
            ));
            assert_eq!(out.len(), 0, "tight={}", tight);

            let next = message_to("orders");
            let bytes = writer.marshal_to_vec(&next).unwrap();
            assert_eq!(
                reader.unmarshal_from_slice(&bytes).unwrap(),
                Some(next),
                "tight={}",
                tight
            );
        }
    }

    #[test]
    fn test_tiny_negotiated_cache_fails_cleanly() {
        let mut peer = WireFormatSettings::default().to_wire_format_info().unwrap();
        peer.update_properties(|props| {
            props.insert(WireFormatInfo::CACHE_SIZE, 1i32);
        })
        .unwrap();
        let agreed = WireFormatSettings::default().negotiate(&peer).unwrap();
        assert_eq!(agreed.cache_size(), 1);

        let mut writer = OpenWireFormat::new(agreed.clone());
        let mut reader = OpenWireFormat::new(agreed);
        let err = writer.marshal_to_vec(&message_to("orders")).unwrap_err();
        assert!(matches!(err, OpenWireError::Protocol(_)), "{err:?}");
        assert!(!err.to_string().contains("out of step"), "{err}");

        let single: Command = SessionInfo::new(SessionId::new("ID:conn-1", 1)).into();
        for _ in 0..2 {
            let bytes = writer.marshal_to_vec(&single).unwrap();
            assert_eq!(reader.unmarshal_from_slice(&bytes).unwrap(), Some(single.clone()));
        }
    }

    #[test]
    fn test_size_prefix_disabled() {
        let s = WireFormatSettings::builder()
            .size_prefix_disabled(true)
            .build()
            .unwrap();
        let mut writer = OpenWireFormat::new(s.clone());
        let mut reader = OpenWireFormat::new(s);
        let keep_alive: Command = KeepAliveInfo::default().into();
        let bytes = writer.marshal_to_vec(&keep_alive).unwrap();
        assert_eq!(bytes[0], KeepAliveInfo::DATA_STRUCTURE_TYPE);
        assert_eq!(reader.unmarshal_from_slice(&bytes).unwrap(), Some(keep_alive));
    }

    #[test]
    fn test_negotiation_takes_minimum_and_conjunction() {
        let ours = WireFormatSettings::default();
        let theirs = WireFormatSettings::builder()
            .version(6)
            .cache_size(512)
            .tight_encoding_enabled(false)
            .max_inactivity_duration(Duration::from_secs(60))
            .max_inactivity_initial_delay(Duration::from_secs(1))
            .build()
            .unwrap();
        let agreed = ours
            .negotiate(&theirs.to_wire_format_info().unwrap())
            .unwrap();
        assert_eq!(agreed.version(), 6);
        assert_eq!(agreed.cache_size(), 512);
        assert!(!agreed.tight_encoding_enabled());
        assert!(agreed.cache_enabled());
        assert_eq!(agreed.max_inactivity_duration(), Duration::from_secs(30));
        assert_eq!(agreed.max_inactivity_initial_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_renegotiate_switches_encoding() {
        let mut wf = OpenWireFormat::for_negotiation(WireFormatSettings::default());
        assert!(!wf.is_tight_encoding_enabled());
        assert!(!wf.is_cache_enabled());

        let peer = WireFormatSettings::default().to_wire_format_info().unwrap();
        wf.renegotiate(&peer).unwrap();
        assert!(wf.is_tight_encoding_enabled());
        assert!(wf.is_cache_enabled());
        assert_eq!(wf.version(), 9);
    }

    #[test]
    fn test_renegotiate_rejects_bad_magic() {
        let mut wf = OpenWireFormat::for_negotiation(WireFormatSettings::default());
        let mut peer = WireFormatSettings::default().to_wire_format_info().unwrap();
        peer.magic = *b"NotAMQ!!";
        assert!(wf.renegotiate(&peer).is_err());
    }

    #[test]
    fn test_consumer_id_nested_in_cached_slot_roundtrip() {
        let mut writer = OpenWireFormat::default();
        let mut reader = OpenWireFormat::default();
        let mut message = Message::with_kind(MessageKind::Bytes);
        message.target_consumer_id = Some(ConsumerId::new("ID:c", 1, 2));
        let command: Command = message.into();
        for _ in 0..2 {
            let bytes = writer.marshal_to_vec(&command).unwrap();
            assert_eq!(reader.unmarshal_from_slice(&bytes).unwrap(), Some(command.clone()));
        }
    }
}
