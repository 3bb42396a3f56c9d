//! Error types for OpenWire operations.

use std::io;
use thiserror::Error;

/// The main error type for OpenWire operations.
#[derive(Debug, Error)]
pub enum OpenWireError {
    /// Connection-related errors (network failures, disconnections).
    #[error("connection error: {0}")]
    Connection(String),

    /// Protocol-related errors (malformed frames, unsupported versions).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The input ended before a complete value could be read.
    #[error("insufficient data: need {needed} bytes, have {remaining}")]
    UnexpectedEof {
        /// Bytes required by the read.
        needed: usize,
        /// Bytes that were left in the input.
        remaining: usize,
    },

    /// A data structure type code with no registered marshaller.
    #[error("unknown data structure type: {0}")]
    UnknownDataType(u8),

    /// A primitive value carried a tag outside the protocol's table.
    #[error("unknown primitive type tag: {0}")]
    UnknownPrimitiveType(u8),

    /// A cache reference pointed at a slot the peer never populated.
    #[error("marshal cache out of sync: no entry at index {0}")]
    CacheDesync(i16),

    /// Operation timeout errors.
    #[error("timeout error: {0}")]
    Timeout(String),

    /// Configuration errors (invalid settings or URIs).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The broker answered a request with an exception response.
    #[error("broker error: {exception_class}: {message}")]
    Broker {
        /// Broker-side exception class name.
        exception_class: String,
        /// Broker-side exception message.
        message: String,
    },

    /// The transport has been closed.
    #[error("transport closed: {0}")]
    Closed(String),

    /// I/O errors from the standard library.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl OpenWireError {
    /// Returns true if this error leaves the byte stream or socket unusable,
    /// so the owning transport has to be torn down.
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(
            self,
            OpenWireError::Connection(_)
                | OpenWireError::Protocol(_)
                | OpenWireError::Serialization(_)
                | OpenWireError::UnexpectedEof { .. }
                | OpenWireError::UnknownDataType(_)
                | OpenWireError::UnknownPrimitiveType(_)
                | OpenWireError::CacheDesync(_)
                | OpenWireError::Io(_)
        )
    }
}

impl Clone for OpenWireError {
    /// `io::Error` is not `Clone`; an I/O error is copied as its kind and message.
    fn clone(&self) -> Self {
        match self {
            OpenWireError::Connection(m) => OpenWireError::Connection(m.clone()),
            OpenWireError::Protocol(m) => OpenWireError::Protocol(m.clone()),
            OpenWireError::Serialization(m) => OpenWireError::Serialization(m.clone()),
            OpenWireError::UnexpectedEof { needed, remaining } => OpenWireError::UnexpectedEof {
                needed: *needed,
                remaining: *remaining,
            },
            OpenWireError::UnknownDataType(t) => OpenWireError::UnknownDataType(*t),
            OpenWireError::UnknownPrimitiveType(t) => OpenWireError::UnknownPrimitiveType(*t),
            OpenWireError::CacheDesync(i) => OpenWireError::CacheDesync(*i),
            OpenWireError::Timeout(m) => OpenWireError::Timeout(m.clone()),
            OpenWireError::Configuration(m) => OpenWireError::Configuration(m.clone()),
            OpenWireError::Broker {
                exception_class,
                message,
            } => OpenWireError::Broker {
                exception_class: exception_class.clone(),
                message: message.clone(),
            },
            OpenWireError::Closed(m) => OpenWireError::Closed(m.clone()),
            OpenWireError::Io(e) => OpenWireError::Io(io::Error::new(e.kind(), e.to_string())),
        }
    }
}

/// A specialized `Result` type for OpenWire operations.
pub type Result<T> = std::result::Result<T, OpenWireError>;
