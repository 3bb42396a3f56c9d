//! Data input traits and implementations for the OpenWire binary format.

use crate::error::{OpenWireError, Result};
use bytes::Buf;
use std::io::Cursor;

/// Trait for reading primitive values from OpenWire's binary format.
///
/// All multi-byte values are read in big-endian byte order.
pub trait DataInput {
    /// Reads a single unsigned byte.
    fn read_byte(&mut self) -> Result<u8>;

    /// Reads a boolean from a single byte.
    fn read_bool(&mut self) -> Result<bool>;

    /// Reads a 16-bit signed integer in big-endian order.
    fn read_short(&mut self) -> Result<i16>;

    /// Reads a 16-bit unsigned integer in big-endian order.
    fn read_unsigned_short(&mut self) -> Result<u16>;

    /// Reads a UTF-16 code unit in big-endian order.
    fn read_char(&mut self) -> Result<u16>;

    /// Reads a 32-bit signed integer in big-endian order.
    fn read_int(&mut self) -> Result<i32>;

    /// Reads a 64-bit signed integer in big-endian order.
    fn read_long(&mut self) -> Result<i64>;

    /// Reads a 32-bit floating point in big-endian order.
    fn read_float(&mut self) -> Result<f32>;

    /// Reads a 64-bit floating point in big-endian order.
    fn read_double(&mut self) -> Result<f64>;

    /// Reads the specified number of raw bytes.
    fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>>;

    /// Reads a modified UTF-8 string with an unsigned 16-bit length prefix.
    fn read_utf(&mut self) -> Result<String>;
}

/// A slice-backed implementation of `DataInput`.
#[derive(Debug)]
pub struct ByteInput<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> ByteInput<'a> {
    /// Creates a new `ByteInput` from the given byte slice.
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(data),
        }
    }

    /// Returns the number of bytes remaining to be read.
    pub fn remaining(&self) -> usize {
        self.cursor.remaining()
    }

    /// Returns the current position in the buffer.
    pub fn position(&self) -> u64 {
        self.cursor.position()
    }

    fn ensure_remaining(&self, n: usize) -> Result<()> {
        if self.cursor.remaining() < n {
            Err(OpenWireError::UnexpectedEof {
                needed: n,
                remaining: self.cursor.remaining(),
            })
        } else {
            Ok(())
        }
    }
}

impl DataInput for ByteInput<'_> {
    fn read_byte(&mut self) -> Result<u8> {
        self.ensure_remaining(1)?;
        Ok(self.cursor.get_u8())
    }

    fn read_bool(&mut self) -> Result<bool> {
        self.ensure_remaining(1)?;
        Ok(self.cursor.get_u8() != 0)
    }

    fn read_short(&mut self) -> Result<i16> {
        self.ensure_remaining(2)?;
        Ok(self.cursor.get_i16())
    }

    fn read_unsigned_short(&mut self) -> Result<u16> {
        self.ensure_remaining(2)?;
        Ok(self.cursor.get_u16())
    }

    fn read_char(&mut self) -> Result<u16> {
        self.read_unsigned_short()
    }

    fn read_int(&mut self) -> Result<i32> {
        self.ensure_remaining(4)?;
        Ok(self.cursor.get_i32())
    }

    fn read_long(&mut self) -> Result<i64> {
        self.ensure_remaining(8)?;
        Ok(self.cursor.get_i64())
    }

    fn read_float(&mut self) -> Result<f32> {
        self.ensure_remaining(4)?;
        Ok(self.cursor.get_f32())
    }

    fn read_double(&mut self) -> Result<f64> {
        self.ensure_remaining(8)?;
        Ok(self.cursor.get_f64())
    }

    fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        self.ensure_remaining(len)?;
        let mut buf = vec![0u8; len];
        self.cursor.copy_to_slice(&mut buf);
        Ok(buf)
    }

    fn read_utf(&mut self) -> Result<String> {
        let len = self.read_unsigned_short()? as usize;
        let bytes = self.read_bytes(len)?;
        decode_modified_utf8(&bytes)
    }
}

/// Decodes a modified UTF-8 byte sequence into a string.
pub fn decode_modified_utf8(bytes: &[u8]) -> Result<String> {
    let malformed = |at: usize| {
        OpenWireError::Serialization(format!("malformed modified UTF-8 at byte {}", at))
    };
    let continuation = |at: usize| -> Result<u16> {
        match bytes.get(at) {
            Some(b) if b & 0xC0 == 0x80 => Ok((b & 0x3F) as u16),
            _ => Err(malformed(at)),
        }
    };

    let mut units = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match b >> 4 {
            0x0..=0x7 => {
                units.push(b as u16);
                i += 1;
            }
            0xC | 0xD => {
                let b2 = continuation(i + 1)?;
                units.push(((b & 0x1F) as u16) << 6 | b2);
                i += 2;
            }
            0xE => {
                let b2 = continuation(i + 1)?;
                let b3 = continuation(i + 2)?;
                units.push(((b & 0x0F) as u16) << 12 | b2 << 6 | b3);
                i += 3;
            }
            _ => return Err(malformed(i)),
        }
    }

    String::from_utf16(&units)
        .map_err(|e| OpenWireError::Serialization(format!("invalid UTF-16 string: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialization::{ByteOutput, DataOutput};

    #[test]
    fn test_new_input() {
        let data = [1, 2, 3, 4];
        let input = ByteInput::new(&data);
        assert_eq!(input.remaining(), 4);
        assert_eq!(input.position(), 0);
    }

    #[test]
    fn test_read_byte() {
        let data = [200u8];
        let mut input = ByteInput::new(&data);
        assert_eq!(input.read_byte().unwrap(), 200);
    }

    #[test]
    fn test_read_short_big_endian() {
        let data = [0xFF, 0xFE];
        let mut input = ByteInput::new(&data);
        assert_eq!(input.read_short().unwrap(), -2);
    }

    #[test]
    fn test_read_unsigned_short() {
        let data = [0xFF, 0xFE];
        let mut input = ByteInput::new(&data);
        assert_eq!(input.read_unsigned_short().unwrap(), 0xFFFE);
    }

    #[test]
    fn test_read_int_big_endian() {
        let data = [0x12, 0x34, 0x56, 0x78];
        let mut input = ByteInput::new(&data);
        assert_eq!(input.read_int().unwrap(), 0x12345678);
    }

    #[test]
    fn test_read_int_insufficient_data() {
        let data = [1, 2];
        let mut input = ByteInput::new(&data);
        let err = input.read_int().unwrap_err();
        assert!(matches!(
            err,
            OpenWireError::UnexpectedEof {
                needed: 4,
                remaining: 2
            }
        ));
    }

    #[test]
    fn test_read_bytes_advances_position() {
        let data = [1, 2, 3, 4, 5];
        let mut input = ByteInput::new(&data);
        assert_eq!(input.read_bytes(3).unwrap(), vec![1, 2, 3]);
        assert_eq!(input.position(), 3);
        assert_eq!(input.remaining(), 2);
    }

    #[test]
    fn test_read_utf_roundtrip() {
        let samples = ["", "plain", "caf\u{e9}", "\0nul", "\u{20AC}100", "smile \u{1F600}"];
        let mut output = ByteOutput::new();
        for s in samples {
            output.write_utf(s).unwrap();
        }
        let bytes = output.into_bytes();
        let mut input = ByteInput::new(&bytes);
        for s in samples {
            assert_eq!(input.read_utf().unwrap(), s);
        }
        assert_eq!(input.remaining(), 0);
    }

    #[test]
    fn test_read_utf_truncated_sequence() {
        let data = [0, 2, 0xE2, 0x82];
        let mut input = ByteInput::new(&data);
        assert!(matches!(
            input.read_utf(),
            Err(OpenWireError::Serialization(_))
        ));
    }

    #[test]
    fn test_read_utf_invalid_lead_byte() {
        let data = [0, 1, 0xF0];
        let mut input = ByteInput::new(&data);
        assert!(input.read_utf().is_err());
    }

    #[test]
    fn test_read_utf_unpaired_surrogate() {
        let data = [0, 3, 0xED, 0xA0, 0xBD];
        let mut input = ByteInput::new(&data);
        assert!(input.read_utf().is_err());
    }
}
