//! The bit-packed flag stream that prefixes every tight-encoded body.
//!
//! Tight marshaling runs in two passes. Pass one records one bit per
//! nullable, optional or compacted field while sizing the body; pass two
//! writes the bitmap and then the fields, re-reading the same bits in the
//! same order to decide what to emit.

use crate::error::{OpenWireError, Result};
use crate::serialization::{DataInput, DataOutput};

/// A growable bitmap written least-significant bit first within each byte.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BooleanStream {
    data: Vec<u8>,
    write_bit: u8,
    read_pos: usize,
    read_bit: u8,
}

impl BooleanStream {
    /// Creates an empty stream.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one bit.
    pub fn write_boolean(&mut self, value: bool) {
        if self.write_bit == 0 {
            self.data.push(0);
        }
        if value {
            if let Some(last) = self.data.last_mut() {
                *last |= 1 << self.write_bit;
            }
        }
        self.write_bit = (self.write_bit + 1) % 8;
    }

    /// Returns the next bit, failing once every recorded byte has been consumed.
    pub fn read_boolean(&mut self) -> Result<bool> {
        let byte = *self.data.get(self.read_pos).ok_or_else(|| {
            OpenWireError::Protocol(format!(
                "boolean stream exhausted after {} bytes",
                self.data.len()
            ))
        })?;
        let value = (byte >> self.read_bit) & 1 != 0;
        self.read_bit += 1;
        if self.read_bit == 8 {
            self.read_bit = 0;
            self.read_pos += 1;
        }
        Ok(value)
    }

    /// Number of bitmap bytes, excluding the length header.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if no bit has been written.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Size of the marshalled form: the length header plus the bitmap bytes.
    pub fn marshalled_size(&self) -> usize {
        let limit = self.data.len();
        let header = if limit < 64 {
            1
        } else if limit < 256 {
            2
        } else {
            3
        };
        header + limit
    }

    /// Writes the length header and bitmap, then rewinds the read cursor.
    pub fn marshal<O: DataOutput>(&mut self, out: &mut O) -> Result<()> {
        let limit = self.data.len();
        if limit < 64 {
            out.write_byte(limit as u8)?;
        } else if limit < 256 {
            out.write_byte(0xC0)?;
            out.write_byte(limit as u8)?;
        } else if limit <= u16::MAX as usize {
            out.write_byte(0x80)?;
            out.write_short(limit as u16 as i16)?;
        } else {
            return Err(OpenWireError::Protocol(format!(
                "boolean stream of {} bytes exceeds the encodable limit",
                limit
            )));
        }
        out.write_bytes(&self.data)?;
        self.rewind();
        Ok(())
    }

    /// Reads a marshalled bitmap positioned for `read_boolean`.
    pub fn unmarshal<I: DataInput>(input: &mut I) -> Result<Self> {
        let limit = match input.read_byte()? {
            0xC0 => input.read_byte()? as usize,
            0x80 => input.read_unsigned_short()? as usize,
            n => n as usize,
        };
        let data = input.read_bytes(limit)?;
        Ok(Self {
            data,
            write_bit: 0,
            read_pos: 0,
            read_bit: 0,
        })
    }

    /// Moves the read cursor back to the first bit.
    pub fn rewind(&mut self) {
        self.read_pos = 0;
        self.read_bit = 0;
    }

    /// Discards every bit.
    pub fn clear(&mut self) {
        self.data.clear();
        self.write_bit = 0;
        self.rewind();
    }
}
