//! Tagged primitive values, maps and lists.
//!
//! Message properties, map message bodies and the wire format's capability
//! record are all carried as a marshalled [`PrimitiveMap`]. Each value is
//! prefixed by a one-byte type tag; maps and lists nest recursively.

use std::collections::HashMap;

use crate::error::{OpenWireError, Result};
use crate::serialization::data_output::{encode_modified_utf8, modified_utf8_len};
use crate::serialization::{decode_modified_utf8, ByteInput, ByteOutput, DataInput, DataOutput};

/// Tag for an absent value.
pub const NULL_TYPE: u8 = 0;
/// Tag for a boolean.
pub const BOOLEAN_TYPE: u8 = 1;
/// Tag for a signed byte.
pub const BYTE_TYPE: u8 = 2;
/// Tag for a UTF-16 code unit.
pub const CHAR_TYPE: u8 = 3;
/// Tag for a 16-bit integer.
pub const SHORT_TYPE: u8 = 4;
/// Tag for a 32-bit integer.
pub const INTEGER_TYPE: u8 = 5;
/// Tag for a 64-bit integer.
pub const LONG_TYPE: u8 = 6;
/// Tag for a 64-bit float.
pub const DOUBLE_TYPE: u8 = 7;
/// Tag for a 32-bit float.
pub const FLOAT_TYPE: u8 = 8;
/// Tag for a string with a 16-bit length prefix.
pub const STRING_TYPE: u8 = 9;
/// Tag for a byte array.
pub const BYTE_ARRAY_TYPE: u8 = 10;
/// Tag for a nested map.
pub const MAP_TYPE: u8 = 11;
/// Tag for a nested list.
pub const LIST_TYPE: u8 = 12;
/// Tag for a string with a 32-bit length prefix.
pub const BIG_STRING_TYPE: u8 = 13;

/// Strings whose encoded form is longer than this use [`BIG_STRING_TYPE`].
pub const MAX_SHORT_STRING_LEN: usize = (i16::MAX / 4) as usize;

const MAX_NESTING_DEPTH: usize = 64;

/// A single tagged value.
#[derive(Debug, Clone, PartialEq)]
pub enum PrimitiveValue {
    /// No value.
    Null,
    /// A boolean.
    Boolean(bool),
    /// A signed byte.
    Byte(i8),
    /// A UTF-16 code unit.
    Char(u16),
    /// A 16-bit integer.
    Short(i16),
    /// A 32-bit integer.
    Integer(i32),
    /// A 64-bit integer.
    Long(i64),
    /// A 32-bit float.
    Float(f32),
    /// A 64-bit float.
    Double(f64),
    /// A string.
    String(String),
    /// Raw bytes.
    ByteArray(Vec<u8>),
    /// A nested map.
    Map(PrimitiveMap),
    /// A nested list.
    List(Vec<PrimitiveValue>),
}

impl PrimitiveValue {
    /// Returns the boolean payload, if this is a boolean.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PrimitiveValue::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns an integer payload, widening narrower integers.
    pub fn as_int(&self) -> Option<i32> {
        match self {
            PrimitiveValue::Byte(v) => Some(*v as i32),
            PrimitiveValue::Short(v) => Some(*v as i32),
            PrimitiveValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns a long payload, widening narrower integers.
    pub fn as_long(&self) -> Option<i64> {
        match self {
            PrimitiveValue::Long(v) => Some(*v),
            other => other.as_int().map(i64::from),
        }
    }

    /// Returns the string payload, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PrimitiveValue::String(v) => Some(v),
            _ => None,
        }
    }
}

impl From<bool> for PrimitiveValue {
    fn from(v: bool) -> Self {
        PrimitiveValue::Boolean(v)
    }
}

impl From<i32> for PrimitiveValue {
    fn from(v: i32) -> Self {
        PrimitiveValue::Integer(v)
    }
}

impl From<i64> for PrimitiveValue {
    fn from(v: i64) -> Self {
        PrimitiveValue::Long(v)
    }
}

impl From<&str> for PrimitiveValue {
    fn from(v: &str) -> Self {
        PrimitiveValue::String(v.to_string())
    }
}

impl From<String> for PrimitiveValue {
    fn from(v: String) -> Self {
        PrimitiveValue::String(v)
    }
}

impl From<Vec<u8>> for PrimitiveValue {
    fn from(v: Vec<u8>) -> Self {
        PrimitiveValue::ByteArray(v)
    }
}

/// String-keyed map of primitive values. Iteration order is unspecified.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrimitiveMap {
    entries: HashMap<String, PrimitiveValue>,
}

impl PrimitiveMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a value, returning the previous one for the key.
    pub fn insert(
        &mut self,
        key: impl Into<String>,
        value: impl Into<PrimitiveValue>,
    ) -> Option<PrimitiveValue> {
        self.entries.insert(key.into(), value.into())
    }

    /// Returns the value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&PrimitiveValue> {
        self.entries.get(key)
    }

    /// Removes and returns the value stored under `key`.
    pub fn remove(&mut self, key: &str) -> Option<PrimitiveValue> {
        self.entries.remove(key)
    }

    /// Returns true if `key` is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the map has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over the entries in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &PrimitiveValue)> {
        self.entries.iter()
    }

    /// Returns the boolean stored under `key`.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(PrimitiveValue::as_bool)
    }

    /// Returns the integer stored under `key`.
    pub fn get_int(&self, key: &str) -> Option<i32> {
        self.get(key).and_then(PrimitiveValue::as_int)
    }

    /// Returns the long stored under `key`.
    pub fn get_long(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(PrimitiveValue::as_long)
    }

    /// Returns the string stored under `key`.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(PrimitiveValue::as_str)
    }
}

impl FromIterator<(String, PrimitiveValue)> for PrimitiveMap {
    fn from_iter<T: IntoIterator<Item = (String, PrimitiveValue)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Writes `map` as an entry count followed by key/value pairs. `None` is
/// written as a count of -1.
pub fn marshal_primitive_map<O: DataOutput>(map: Option<&PrimitiveMap>, out: &mut O) -> Result<()> {
    match map {
        None => out.write_int(-1),
        Some(map) => write_map(map, out),
    }
}

/// Reads a map written by [`marshal_primitive_map`].
pub fn unmarshal_primitive_map<I: DataInput>(input: &mut I) -> Result<Option<PrimitiveMap>> {
    read_map(input, 0)
}

/// Marshals a map into a standalone byte buffer, as stored in a message's
/// property field or a map message body.
pub fn map_to_bytes(map: &PrimitiveMap) -> Result<Vec<u8>> {
    let mut out = ByteOutput::new();
    write_map(map, &mut out)?;
    Ok(out.into_bytes())
}

/// Inverse of [`map_to_bytes`]. An empty buffer yields an empty map.
pub fn map_from_bytes(bytes: &[u8]) -> Result<PrimitiveMap> {
    if bytes.is_empty() {
        return Ok(PrimitiveMap::new());
    }
    let mut input = ByteInput::new(bytes);
    Ok(unmarshal_primitive_map(&mut input)?.unwrap_or_default())
}

/// Writes one tagged value.
pub fn marshal_primitive<O: DataOutput>(value: &PrimitiveValue, out: &mut O) -> Result<()> {
    match value {
        PrimitiveValue::Null => out.write_byte(NULL_TYPE),
        PrimitiveValue::Boolean(v) => {
            out.write_byte(BOOLEAN_TYPE)?;
            out.write_bool(*v)
        }
        PrimitiveValue::Byte(v) => {
            out.write_byte(BYTE_TYPE)?;
            out.write_byte(*v as u8)
        }
        PrimitiveValue::Char(v) => {
            out.write_byte(CHAR_TYPE)?;
            out.write_char(*v)
        }
        PrimitiveValue::Short(v) => {
            out.write_byte(SHORT_TYPE)?;
            out.write_short(*v)
        }
        PrimitiveValue::Integer(v) => {
            out.write_byte(INTEGER_TYPE)?;
            out.write_int(*v)
        }
        PrimitiveValue::Long(v) => {
            out.write_byte(LONG_TYPE)?;
            out.write_long(*v)
        }
        PrimitiveValue::Float(v) => {
            out.write_byte(FLOAT_TYPE)?;
            out.write_float(*v)
        }
        PrimitiveValue::Double(v) => {
            out.write_byte(DOUBLE_TYPE)?;
            out.write_double(*v)
        }
        PrimitiveValue::String(v) => {
            let encoded_len = modified_utf8_len(v);
            if encoded_len > MAX_SHORT_STRING_LEN {
                let len = i32::try_from(encoded_len).map_err(|_| {
                    OpenWireError::Serialization(format!(
                        "string of {} bytes is too long",
                        encoded_len
                    ))
                })?;
                out.write_byte(BIG_STRING_TYPE)?;
                out.write_int(len)?;
                let mut buf = Vec::with_capacity(encoded_len);
                encode_modified_utf8(v, &mut buf);
                out.write_bytes(&buf)
            } else {
                out.write_byte(STRING_TYPE)?;
                out.write_utf(v)
            }
        }
        PrimitiveValue::ByteArray(v) => {
            out.write_byte(BYTE_ARRAY_TYPE)?;
            out.write_int(v.len() as i32)?;
            out.write_bytes(v)
        }
        PrimitiveValue::Map(map) => {
            out.write_byte(MAP_TYPE)?;
            write_map(map, out)
        }
        PrimitiveValue::List(list) => {
            out.write_byte(LIST_TYPE)?;
            out.write_int(list.len() as i32)?;
            for item in list {
                marshal_primitive(item, out)?;
            }
            Ok(())
        }
    }
}

/// Reads one tagged value.
pub fn unmarshal_primitive<I: DataInput>(input: &mut I) -> Result<PrimitiveValue> {
    read_value(input, 0)
}

fn write_map<O: DataOutput>(map: &PrimitiveMap, out: &mut O) -> Result<()> {
    out.write_int(map.len() as i32)?;
    for (key, value) in map.iter() {
        out.write_utf(key)?;
        marshal_primitive(value, out)?;
    }
    Ok(())
}

fn check_depth(depth: usize) -> Result<()> {
    if depth > MAX_NESTING_DEPTH {
        return Err(OpenWireError::Serialization(format!(
            "primitive values nested deeper than {}",
            MAX_NESTING_DEPTH
        )));
    }
    Ok(())
}

fn read_map<I: DataInput>(input: &mut I, depth: usize) -> Result<Option<PrimitiveMap>> {
    check_depth(depth)?;
    let size = input.read_int()?;
    if size < 0 {
        return Ok(None);
    }
    let mut map = PrimitiveMap::new();
    for _ in 0..size {
        let key = input.read_utf()?;
        let value = read_value(input, depth + 1)?;
        map.entries.insert(key, value);
    }
    Ok(Some(map))
}

fn read_length<I: DataInput>(input: &mut I, what: &str) -> Result<usize> {
    let len = input.read_int()?;
    usize::try_from(len).map_err(|_| {
        OpenWireError::Serialization(format!("invalid {} length: {}", what, len))
    })
}

fn read_value<I: DataInput>(input: &mut I, depth: usize) -> Result<PrimitiveValue> {
    let tag = input.read_byte()?;
    let value = match tag {
        NULL_TYPE => PrimitiveValue::Null,
        BOOLEAN_TYPE => PrimitiveValue::Boolean(input.read_bool()?),
        BYTE_TYPE => PrimitiveValue::Byte(input.read_byte()? as i8),
        CHAR_TYPE => PrimitiveValue::Char(input.read_char()?),
        SHORT_TYPE => PrimitiveValue::Short(input.read_short()?),
        INTEGER_TYPE => PrimitiveValue::Integer(input.read_int()?),
        LONG_TYPE => PrimitiveValue::Long(input.read_long()?),
        FLOAT_TYPE => PrimitiveValue::Float(input.read_float()?),
        DOUBLE_TYPE => PrimitiveValue::Double(input.read_double()?),
        STRING_TYPE => PrimitiveValue::String(input.read_utf()?),
        BIG_STRING_TYPE => {
            let len = read_length(input, "string")?;
            let bytes = input.read_bytes(len)?;
            PrimitiveValue::String(decode_modified_utf8(&bytes)?)
        }
        BYTE_ARRAY_TYPE => {
            let len = read_length(input, "byte array")?;
            PrimitiveValue::ByteArray(input.read_bytes(len)?)
        }
        MAP_TYPE => PrimitiveValue::Map(read_map(input, depth + 1)?.unwrap_or_default()),
        LIST_TYPE => {
            check_depth(depth + 1)?;
            let count = input.read_int()?;
            let mut list = Vec::new();
            for _ in 0..count.max(0) {
                list.push(read_value(input, depth + 1)?);
            }
            PrimitiveValue::List(list)
        }
        other => return Err(OpenWireError::UnknownPrimitiveType(other)),
    };
    Ok(value)
}
