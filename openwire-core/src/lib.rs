//! Core types and marshaling for the OpenWire broker protocol.
//!
//! The crate is organised leaf first:
//!
//! - [`serialization`]: big-endian data input/output, the boolean bitmap used
//!   by tight encoding, and the tagged primitive values used for properties
//!   and map bodies.
//! - [`commands`]: every wire structure as one variant of [`Command`].
//! - [`protocol`]: the field codecs, the type-code registry, the
//!   [`OpenWireFormat`] with its marshal caches and negotiation, and the
//!   [`OpenWireCodec`] that frames commands for tokio transports.
//!
//! ```
//! use openwire_core::commands::Message;
//! use openwire_core::{Command, OpenWireFormat};
//!
//! let mut writer = OpenWireFormat::default();
//! let mut reader = OpenWireFormat::default();
//!
//! let command: Command = Message::text("hello").into();
//! let frame = writer.marshal_to_vec(&command).unwrap();
//! assert_eq!(reader.unmarshal_from_slice(&frame).unwrap(), Some(command));
//! ```

#![warn(missing_docs)]

pub mod commands;
pub mod error;
pub mod protocol;
pub mod serialization;

pub use commands::{BaseCommand, Command, CommandVariant};
pub use error::{OpenWireError, Result};
pub use protocol::{
    DataStructure, OpenWireCodec, OpenWireFormat, WireFormatSettings, WireFormatSettingsBuilder,
};
pub use serialization::{PrimitiveMap, PrimitiveValue};
