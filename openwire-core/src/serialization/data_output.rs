//! Data output traits and implementations for the OpenWire binary format.

use crate::error::{OpenWireError, Result};
use bytes::{BufMut, BytesMut};

/// Trait for writing primitive values in OpenWire's binary format.
///
/// All multi-byte values are written in big-endian byte order.
pub trait DataOutput {
    /// Writes a single unsigned byte.
    fn write_byte(&mut self, v: u8) -> Result<()>;

    /// Writes a boolean as a single byte (0 for false, 1 for true).
    fn write_bool(&mut self, v: bool) -> Result<()>;

    /// Writes a 16-bit signed integer in big-endian order.
    fn write_short(&mut self, v: i16) -> Result<()>;

    /// Writes a UTF-16 code unit in big-endian order.
    fn write_char(&mut self, v: u16) -> Result<()>;

    /// Writes a 32-bit signed integer in big-endian order.
    fn write_int(&mut self, v: i32) -> Result<()>;

    /// Writes a 64-bit signed integer in big-endian order.
    fn write_long(&mut self, v: i64) -> Result<()>;

    /// Writes a 32-bit floating point in big-endian order.
    fn write_float(&mut self, v: f32) -> Result<()>;

    /// Writes a 64-bit floating point in big-endian order.
    fn write_double(&mut self, v: f64) -> Result<()>;

    /// Writes raw bytes without length prefix.
    fn write_bytes(&mut self, v: &[u8]) -> Result<()>;

    /// Writes a string as modified UTF-8 with an unsigned 16-bit length prefix.
    ///
    /// Fails when the encoded form is longer than 65535 bytes.
    fn write_utf(&mut self, v: &str) -> Result<()>;
}

/// A buffer-based implementation of `DataOutput`.
#[derive(Debug)]
pub struct ByteOutput {
    buffer: BytesMut,
}

impl ByteOutput {
    /// Creates a new `ByteOutput` with default capacity.
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(256),
        }
    }

    /// Creates a new `ByteOutput` with the specified capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
        }
    }

    /// Wraps an existing buffer; writes are appended after its contents.
    pub fn from_buffer(buffer: BytesMut) -> Self {
        Self { buffer }
    }

    /// Returns the written bytes as a slice.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Consumes the output and returns the underlying buffer.
    pub fn into_inner(self) -> BytesMut {
        self.buffer
    }

    /// Consumes the output and returns the written bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer.to_vec()
    }

    /// Returns the number of bytes written.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Returns true if no bytes have been written.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Discards everything written after the first `len` bytes.
    pub fn truncate(&mut self, len: usize) {
        self.buffer.truncate(len);
    }

    /// Overwrites four already-written bytes at `position` with `v`.
    ///
    /// Used to back-fill a length prefix once the body size is known.
    pub fn patch_int(&mut self, position: usize, v: i32) -> Result<()> {
        let end = position + 4;
        if end > self.buffer.len() {
            return Err(OpenWireError::Serialization(format!(
                "cannot patch int at {} in buffer of {} bytes",
                position,
                self.buffer.len()
            )));
        }
        self.buffer[position..end].copy_from_slice(&v.to_be_bytes());
        Ok(())
    }
}

impl Default for ByteOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl DataOutput for ByteOutput {
    fn write_byte(&mut self, v: u8) -> Result<()> {
        self.buffer.put_u8(v);
        Ok(())
    }

    fn write_bool(&mut self, v: bool) -> Result<()> {
        self.buffer.put_u8(if v { 1 } else { 0 });
        Ok(())
    }

    fn write_short(&mut self, v: i16) -> Result<()> {
        self.buffer.put_i16(v);
        Ok(())
    }

    fn write_char(&mut self, v: u16) -> Result<()> {
        self.buffer.put_u16(v);
        Ok(())
    }

    fn write_int(&mut self, v: i32) -> Result<()> {
        self.buffer.put_i32(v);
        Ok(())
    }

    fn write_long(&mut self, v: i64) -> Result<()> {
        self.buffer.put_i64(v);
        Ok(())
    }

    fn write_float(&mut self, v: f32) -> Result<()> {
        self.buffer.put_f32(v);
        Ok(())
    }

    fn write_double(&mut self, v: f64) -> Result<()> {
        self.buffer.put_f64(v);
        Ok(())
    }

    fn write_bytes(&mut self, v: &[u8]) -> Result<()> {
        self.buffer.put_slice(v);
        Ok(())
    }

    fn write_utf(&mut self, v: &str) -> Result<()> {
        let len = modified_utf8_len(v);
        if len > u16::MAX as usize {
            return Err(OpenWireError::Serialization(format!(
                "encoded string too long: {} bytes",
                len
            )));
        }
        self.buffer.put_u16(len as u16);
        self.buffer.reserve(len);
        encode_modified_utf8(v, &mut self.buffer);
        Ok(())
    }
}

/// Returns the number of bytes `s` occupies in modified UTF-8.
///
/// U+0000 takes two bytes and supplementary characters are encoded as a
/// surrogate pair of three bytes each.
pub fn modified_utf8_len(s: &str) -> usize {
    s.encode_utf16()
        .map(|unit| match unit {
            0x0001..=0x007F => 1,
            0x0000 | 0x0080..=0x07FF => 2,
            _ => 3,
        })
        .sum()
}

/// Appends the modified UTF-8 form of `s` to `buf`.
pub fn encode_modified_utf8<B: BufMut>(s: &str, buf: &mut B) {
    for unit in s.encode_utf16() {
        match unit {
            0x0001..=0x007F => buf.put_u8(unit as u8),
            0x0000 | 0x0080..=0x07FF => {
                buf.put_u8(0xC0 | ((unit >> 6) & 0x1F) as u8);
                buf.put_u8(0x80 | (unit & 0x3F) as u8);
            }
            _ => {
                buf.put_u8(0xE0 | ((unit >> 12) & 0x0F) as u8);
                buf.put_u8(0x80 | ((unit >> 6) & 0x3F) as u8);
                buf.put_u8(0x80 | (unit & 0x3F) as u8);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_output() {
        let output = ByteOutput::new();
        assert!(output.is_empty());
        assert_eq!(output.len(), 0);
    }

    #[test]
    fn test_write_short_big_endian() {
        let mut output = ByteOutput::new();
        output.write_short(0x1234).unwrap();
        assert_eq!(output.as_bytes(), &[0x12, 0x34]);
    }

    #[test]
    fn test_write_int_big_endian() {
        let mut output = ByteOutput::new();
        output.write_int(0x12345678).unwrap();
        assert_eq!(output.as_bytes(), &[0x12, 0x34, 0x56, 0x78]);
    }

    #[test]
    fn test_write_long_negative() {
        let mut output = ByteOutput::new();
        output.write_long(-1).unwrap();
        assert_eq!(output.as_bytes(), &[0xFF; 8]);
    }

    #[test]
    fn test_write_double() {
        let mut output = ByteOutput::new();
        output.write_double(1.5).unwrap();
        assert_eq!(output.as_bytes(), &1.5f64.to_be_bytes());
    }

    #[test]
    fn test_write_utf_ascii() {
        let mut output = ByteOutput::new();
        output.write_utf("abc").unwrap();
        assert_eq!(output.as_bytes(), &[0, 3, b'a', b'b', b'c']);
    }

    #[test]
    fn test_write_utf_nul_uses_two_bytes() {
        let mut output = ByteOutput::new();
        output.write_utf("\0").unwrap();
        assert_eq!(output.as_bytes(), &[0, 2, 0xC0, 0x80]);
    }

    #[test]
    fn test_write_utf_supplementary_character() {
        let mut output = ByteOutput::new();
        output.write_utf("\u{1F600}").unwrap();
        // Surrogate pair, three bytes per unit.
        assert_eq!(
            output.as_bytes(),
            &[0, 6, 0xED, 0xA0, 0xBD, 0xED, 0xB8, 0x80]
        );
    }

    #[test]
    fn test_write_utf_too_long() {
        let mut output = ByteOutput::new();
        let s = "x".repeat(70_000);
        assert!(output.write_utf(&s).is_err());
        assert!(output.is_empty());
    }

    #[test]
    fn test_modified_utf8_len() {
        assert_eq!(modified_utf8_len(""), 0);
        assert_eq!(modified_utf8_len("hello"), 5);
        assert_eq!(modified_utf8_len("\u{e9}"), 2);
        assert_eq!(modified_utf8_len("\u{20AC}"), 3);
        assert_eq!(modified_utf8_len("\u{1F600}"), 6);
    }

    #[test]
    fn test_patch_int() {
        let mut output = ByteOutput::new();
        output.write_int(0).unwrap();
        output.write_byte(7).unwrap();
        output.patch_int(0, 1).unwrap();
        assert_eq!(output.as_bytes(), &[0, 0, 0, 1, 7]);
        assert!(output.patch_int(3, 1).is_err());
    }

    #[test]
    fn test_from_buffer_appends() {
        let mut buffer = BytesMut::new();
        buffer.put_u8(9);
        let mut output = ByteOutput::from_buffer(buffer);
        output.write_byte(10).unwrap();
        assert_eq!(output.into_bytes(), vec![9, 10]);
    }
}
