//! Codec implementation for framing OpenWire commands on a byte stream.

use std::sync::{Arc, Mutex, MutexGuard};

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::format::OpenWireFormat;
use crate::commands::Command;
use crate::error::{OpenWireError, Result};
use crate::serialization::{ByteInput, ByteOutput};

const SIZE_PREFIX_LEN: usize = 4;

/// Codec for encoding and decoding OpenWire commands.
///
/// Implements the `tokio_util::codec::{Encoder, Decoder}` traits for use
/// with tokio's framed I/O. The wire format is shared so the read and write
/// halves of a connection see the same negotiated settings.
#[derive(Debug, Clone)]
pub struct OpenWireCodec {
    format: Arc<Mutex<OpenWireFormat>>,
}

impl OpenWireCodec {
    /// Creates a codec owning `format`.
    pub fn new(format: OpenWireFormat) -> Self {
        Self {
            format: Arc::new(Mutex::new(format)),
        }
    }

    /// Creates a codec over an already shared format.
    pub fn with_shared_format(format: Arc<Mutex<OpenWireFormat>>) -> Self {
        Self { format }
    }

    /// Returns the shared wire format.
    pub fn format(&self) -> Arc<Mutex<OpenWireFormat>> {
        Arc::clone(&self.format)
    }

    fn lock(&self) -> Result<MutexGuard<'_, OpenWireFormat>> {
        self.format
            .lock()
            .map_err(|_| OpenWireError::Protocol("wire format lock poisoned".to_string()))
    }
}

impl Encoder<Command> for OpenWireCodec {
    type Error = OpenWireError;

    fn encode(&mut self, item: Command, dst: &mut BytesMut) -> Result<()> {
        let mut format = self.lock()?;
        let start = dst.len();
        let mut out = ByteOutput::from_buffer(std::mem::take(dst));
        let result = format.marshal(&item, &mut out);
        *dst = out.into_inner();
        if result.is_err() {
            dst.truncate(start);
        }
        result
    }
}

impl Decoder for OpenWireCodec {
    type Item = Command;
    type Error = OpenWireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        let mut format = self.lock()?;
        loop {
            let decoded = if format.is_size_prefix_disabled() {
                let mut input = ByteInput::new(&src[..]);
                match format.unmarshal(&mut input) {
                    Ok(command) => {
                        let consumed = input.position() as usize;
                        src.advance(consumed);
                        command
                    }
                    Err(OpenWireError::UnexpectedEof { .. }) => return Ok(None),
                    Err(e) => return Err(e),
                }
            } else {
                if src.len() < SIZE_PREFIX_LEN {
                    return Ok(None);
                }
                let size = i32::from_be_bytes([src[0], src[1], src[2], src[3]]);
                let size = usize::try_from(size).map_err(|_| {
                    OpenWireError::Protocol(format!("negative frame size: {}", size))
                })?;
                if size as u64 > format.max_frame_size() {
                    return Err(OpenWireError::Protocol(format!(
                        "frame size of {} bytes exceeds maximum of {}",
                        size,
                        format.max_frame_size()
                    )));
                }
                let total = SIZE_PREFIX_LEN + size;
                if src.len() < total {
                    src.reserve(total - src.len());
                    return Ok(None);
                }
                let frame = src.split_to(total);
                format.unmarshal_from_slice(&frame)?
            };

            match decoded {
                Some(command) => return Ok(Some(command)),
                None => tracing::trace!("skipping null command frame"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{KeepAliveInfo, Response};
    use crate::protocol::WireFormatSettings;

    fn keep_alive(id: i32) -> Command {
        let mut info = KeepAliveInfo::default();
        info.command_id = id;
        info.response_required = true;
        info.into()
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut encoder = OpenWireCodec::new(OpenWireFormat::default());
        let mut decoder = OpenWireCodec::new(OpenWireFormat::default());

        let mut buf = BytesMut::new();
        encoder.encode(keep_alive(7), &mut buf).unwrap();
        assert!(!buf.is_empty());

        let decoded = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, keep_alive(7));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_incomplete_length() {
        let mut codec = OpenWireCodec::new(OpenWireFormat::default());
        let mut buf = BytesMut::from(&[0x00, 0x00][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn test_decode_incomplete_frame() {
        let mut encoder = OpenWireCodec::new(OpenWireFormat::default());
        let mut decoder = OpenWireCodec::new(OpenWireFormat::default());

        let mut full = BytesMut::new();
        encoder.encode(keep_alive(1), &mut full).unwrap();

        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert!(decoder.decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&full[full.len() - 1..]);
        assert_eq!(decoder.decode(&mut partial).unwrap(), Some(keep_alive(1)));
    }

    #[test]
    fn test_decode_multiple_commands() {
        let mut encoder = OpenWireCodec::new(OpenWireFormat::default());
        let mut decoder = OpenWireCodec::new(OpenWireFormat::default());

        let mut response = Response::default();
        response.correlation_id = 3;

        let mut buf = BytesMut::new();
        encoder.encode(keep_alive(1), &mut buf).unwrap();
        encoder.encode(response.clone().into(), &mut buf).unwrap();

        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(keep_alive(1)));
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(response.into()));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_null_frames_are_skipped() {
        let mut codec = OpenWireCodec::new(OpenWireFormat::default());
        let mut buf = BytesMut::from(&[0, 0, 0, 1, 0][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let settings = WireFormatSettings::builder()
            .max_frame_size(1024)
            .build()
            .unwrap();
        let mut codec = OpenWireCodec::new(OpenWireFormat::new(settings));
        let mut buf = BytesMut::from(&[0x00, 0x01, 0x00, 0x00, 0x0A][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(OpenWireError::Protocol(_))
        ));
    }

    #[test]
    fn test_negative_frame_size_rejected() {
        let mut codec = OpenWireCodec::new(OpenWireFormat::default());
        let mut buf = BytesMut::from(&[0xFF, 0xFF, 0xFF, 0xFF, 0x0A][..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_size_prefix_disabled_streaming() {
        let settings = WireFormatSettings::builder()
            .size_prefix_disabled(true)
            .build()
            .unwrap();
        let mut encoder = OpenWireCodec::new(OpenWireFormat::new(settings.clone()));
        let mut decoder = OpenWireCodec::new(OpenWireFormat::new(settings));

        let mut full = BytesMut::new();
        encoder.encode(keep_alive(1), &mut full).unwrap();
        encoder.encode(keep_alive(2), &mut full).unwrap();

        let mut buf = BytesMut::from(&full[..3]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&full[3..]);
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(keep_alive(1)));
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(keep_alive(2)));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_failed_encode_leaves_buffer_untouched() {
        let settings = WireFormatSettings::builder()
            .max_frame_size(8)
            .build()
            .unwrap();
        let mut codec = OpenWireCodec::new(OpenWireFormat::new(settings));
        let mut buf = BytesMut::from(&b"xy"[..]);
        let mut response = crate::commands::ExceptionResponse::default();
        response.exception = Some(crate::commands::BrokerError::new(
            "java.lang.IllegalStateException",
            "a message long enough to exceed the frame limit",
        ));
        assert!(codec.encode(response.into(), &mut buf).is_err());
        assert_eq!(&buf[..], b"xy");
    }
}
