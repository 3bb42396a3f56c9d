//! OpenWire protocol implementation.
//!
//! This module holds the marshaling engine: the per-field codecs and the
//! declarative structure macro, the type-code registry, the wire format with
//! its caches and negotiation, and the framing codec used by transports.

mod codec;
pub mod constants;
mod format;
pub mod marshal;
mod registry;

pub use codec::OpenWireCodec;
pub use format::{
    OpenWireFormat, WireFormatSettings, WireFormatSettingsBuilder, DEFAULT_CACHE_SIZE,
    DEFAULT_MAX_FRAME_SIZE, DEFAULT_MAX_INACTIVITY_DURATION, DEFAULT_MAX_INACTIVITY_INITIAL_DELAY,
    DEFAULT_VERSION,
};
pub use marshal::{Cacheable, DataStructure, MarshalFields};
pub use registry::{DataStreamMarshaller, MarshallerRegistry, TypedMarshaller};
