//! Field-level marshaling and the declarative structure macro.
//!
//! Every wire structure is described once, as an ordered field list passed to
//! `openwire_struct!`. The macro expands that list into all five marshal
//! operations, so the two tight passes and both unmarshal paths always visit
//! the same fields in the same order with the same version gates.
//!
//! Each field kind maps to a [`FieldCodec`]: a zero-sized type carrying the
//! tight and loose encodings of one value shape (compacted longs, ASCII
//! strings, cached references, nested structures, arrays and so on).

use std::marker::PhantomData;

use crate::commands::{BrokerError, Command, StackTraceElement};
use crate::error::{OpenWireError, Result};
use crate::protocol::format::OpenWireFormat;
use crate::serialization::{
    modified_utf8_len, BooleanStream, ByteInput, ByteOutput, DataInput, DataOutput,
};

/// The five marshal operations of a wire structure's field list.
///
/// `tight_marshal1` records the bitmap bits and returns the number of body
/// bytes `tight_marshal2` will write, excluding the bitmap itself.
pub trait MarshalFields {
    /// Tight pass one: records flags into `bs` and sizes the body.
    fn tight_marshal1(&self, wf: &mut OpenWireFormat, bs: &mut BooleanStream) -> Result<usize>;

    /// Tight pass two: writes the body, re-reading the flags recorded in pass one.
    fn tight_marshal2(
        &self,
        wf: &mut OpenWireFormat,
        out: &mut ByteOutput,
        bs: &mut BooleanStream,
    ) -> Result<()>;

    /// Reads a tight-encoded body into `self`.
    fn tight_unmarshal(
        &mut self,
        wf: &mut OpenWireFormat,
        input: &mut ByteInput<'_>,
        bs: &mut BooleanStream,
    ) -> Result<()>;

    /// Writes every field unconditionally.
    fn loose_marshal(&self, wf: &mut OpenWireFormat, out: &mut ByteOutput) -> Result<()>;

    /// Reads a loose-encoded body into `self`.
    fn loose_unmarshal(&mut self, wf: &mut OpenWireFormat, input: &mut ByteInput<'_>)
        -> Result<()>;
}

/// A marshalable structure identified on the wire by a type byte.
pub trait DataStructure: MarshalFields + Sized {
    /// The type byte written before this structure's body.
    fn data_structure_type(&self) -> u8;

    /// Whether nested occurrences carry an extra bit for a pre-marshalled form.
    fn is_marshall_aware(&self) -> bool {
        false
    }

    /// Creates an empty instance for an incoming type byte, rejecting codes
    /// this type cannot represent.
    fn create(wf: &OpenWireFormat, data_type: u8) -> Result<Self>;
}

/// A structure that may be replaced by a marshal cache index.
pub trait Cacheable: DataStructure + Clone {
    /// Converts the value into the key stored in the marshal cache.
    fn to_cache_entry(self) -> Command;

    /// Recovers the value from an unmarshal cache slot.
    fn from_cache_entry(entry: Command) -> Result<Self>;
}

/// Tight and loose encodings for one shape of field value.
pub trait FieldCodec {
    /// The Rust type stored in the structure.
    type Value;

    /// Records flags and returns the body size of `value`.
    fn tight_marshal1(
        wf: &mut OpenWireFormat,
        value: &Self::Value,
        bs: &mut BooleanStream,
    ) -> Result<usize>;

    /// Writes `value`, consuming the flags recorded in pass one.
    fn tight_marshal2(
        wf: &mut OpenWireFormat,
        value: &Self::Value,
        out: &mut ByteOutput,
        bs: &mut BooleanStream,
    ) -> Result<()>;

    /// Reads a tight-encoded value into `slot`.
    fn tight_unmarshal(
        wf: &mut OpenWireFormat,
        slot: &mut Self::Value,
        input: &mut ByteInput<'_>,
        bs: &mut BooleanStream,
    ) -> Result<()>;

    /// Writes `value` in loose form.
    fn loose_marshal(wf: &mut OpenWireFormat, value: &Self::Value, out: &mut ByteOutput)
        -> Result<()>;

    /// Reads a loose-encoded value into `slot`.
    fn loose_unmarshal(
        wf: &mut OpenWireFormat,
        slot: &mut Self::Value,
        input: &mut ByteInput<'_>,
    ) -> Result<()>;
}

fn out_of_step() -> OpenWireError {
    OpenWireError::Protocol("marshal passes out of step".to_string())
}

fn read_count(input: &mut ByteInput<'_>, what: &str) -> Result<usize> {
    let count = input.read_short()?;
    usize::try_from(count)
        .map_err(|_| OpenWireError::Serialization(format!("negative {} count: {}", what, count)))
}

fn check_count(len: usize, what: &str) -> Result<i16> {
    i16::try_from(len)
        .map_err(|_| OpenWireError::Serialization(format!("too many {}: {}", what, len)))
}

macro_rules! fixed_field {
    ($(#[$meta:meta])* $name:ident, $ty:ty, $size:expr, $write:ident, $read:ident) => {
        $(#[$meta])*
        pub struct $name;

        impl FieldCodec for $name {
            type Value = $ty;

            fn tight_marshal1(_: &mut OpenWireFormat, _: &$ty, _: &mut BooleanStream) -> Result<usize> {
                Ok($size)
            }

            fn tight_marshal2(
                _: &mut OpenWireFormat,
                value: &$ty,
                out: &mut ByteOutput,
                _: &mut BooleanStream,
            ) -> Result<()> {
                out.$write(*value)
            }

            fn tight_unmarshal(
                _: &mut OpenWireFormat,
                slot: &mut $ty,
                input: &mut ByteInput<'_>,
                _: &mut BooleanStream,
            ) -> Result<()> {
                *slot = input.$read()?;
                Ok(())
            }

            fn loose_marshal(_: &mut OpenWireFormat, value: &$ty, out: &mut ByteOutput) -> Result<()> {
                out.$write(*value)
            }

            fn loose_unmarshal(
                _: &mut OpenWireFormat,
                slot: &mut $ty,
                input: &mut ByteInput<'_>,
            ) -> Result<()> {
                *slot = input.$read()?;
                Ok(())
            }
        }
    };
}

fixed_field!(
    /// A 32-bit integer, always four bytes.
    IntField, i32, 4, write_int, read_int
);
fixed_field!(
    /// A 16-bit integer, always two bytes.
    ShortField, i16, 2, write_short, read_short
);
fixed_field!(
    /// A single byte.
    ByteField, u8, 1, write_byte, read_byte
);

/// A boolean: one bitmap bit in tight mode, one byte in loose mode.
pub struct BoolField;

impl FieldCodec for BoolField {
    type Value = bool;

    fn tight_marshal1(_: &mut OpenWireFormat, value: &bool, bs: &mut BooleanStream) -> Result<usize> {
        bs.write_boolean(*value);
        Ok(0)
    }

    fn tight_marshal2(
        _: &mut OpenWireFormat,
        _: &bool,
        _: &mut ByteOutput,
        bs: &mut BooleanStream,
    ) -> Result<()> {
        bs.read_boolean()?;
        Ok(())
    }

    fn tight_unmarshal(
        _: &mut OpenWireFormat,
        slot: &mut bool,
        _: &mut ByteInput<'_>,
        bs: &mut BooleanStream,
    ) -> Result<()> {
        *slot = bs.read_boolean()?;
        Ok(())
    }

    fn loose_marshal(_: &mut OpenWireFormat, value: &bool, out: &mut ByteOutput) -> Result<()> {
        out.write_bool(*value)
    }

    fn loose_unmarshal(
        _: &mut OpenWireFormat,
        slot: &mut bool,
        input: &mut ByteInput<'_>,
    ) -> Result<()> {
        *slot = input.read_bool()?;
        Ok(())
    }
}

/// A 64-bit integer compacted to 0, 2, 4 or 8 bytes in tight mode.
///
/// Two bitmap bits select the width: `(false, false)` is zero,
/// `(false, true)` an unsigned short, `(true, false)` an unsigned int and
/// `(true, true)` the full long.
pub struct LongField;

impl FieldCodec for LongField {
    type Value = i64;

    fn tight_marshal1(_: &mut OpenWireFormat, value: &i64, bs: &mut BooleanStream) -> Result<usize> {
        let v = *value as u64;
        let (wide, low, size) = if v == 0 {
            (false, false, 0)
        } else if v & 0xFFFF_FFFF_FFFF_0000 == 0 {
            (false, true, 2)
        } else if v & 0xFFFF_FFFF_0000_0000 == 0 {
            (true, false, 4)
        } else {
            (true, true, 8)
        };
        bs.write_boolean(wide);
        bs.write_boolean(low);
        Ok(size)
    }

    fn tight_marshal2(
        _: &mut OpenWireFormat,
        value: &i64,
        out: &mut ByteOutput,
        bs: &mut BooleanStream,
    ) -> Result<()> {
        let wide = bs.read_boolean()?;
        let low = bs.read_boolean()?;
        match (wide, low) {
            (true, true) => out.write_long(*value),
            (true, false) => out.write_int(*value as i32),
            (false, true) => out.write_short(*value as i16),
            (false, false) => Ok(()),
        }
    }

    fn tight_unmarshal(
        _: &mut OpenWireFormat,
        slot: &mut i64,
        input: &mut ByteInput<'_>,
        bs: &mut BooleanStream,
    ) -> Result<()> {
        let wide = bs.read_boolean()?;
        let low = bs.read_boolean()?;
        *slot = match (wide, low) {
            (true, true) => input.read_long()?,
            (true, false) => input.read_int()? as u32 as i64,
            (false, true) => input.read_unsigned_short()? as i64,
            (false, false) => 0,
        };
        Ok(())
    }

    fn loose_marshal(_: &mut OpenWireFormat, value: &i64, out: &mut ByteOutput) -> Result<()> {
        out.write_long(*value)
    }

    fn loose_unmarshal(
        _: &mut OpenWireFormat,
        slot: &mut i64,
        input: &mut ByteInput<'_>,
    ) -> Result<()> {
        *slot = input.read_long()?;
        Ok(())
    }
}

pub(crate) fn tight_marshal_string1(value: Option<&str>, bs: &mut BooleanStream) -> Result<usize> {
    bs.write_boolean(value.is_some());
    let Some(value) = value else {
        return Ok(0);
    };
    let ascii = value.bytes().all(|b| (1..=0x7F).contains(&b));
    bs.write_boolean(ascii);
    let len = if ascii {
        value.len()
    } else {
        modified_utf8_len(value)
    };
    if len >= i16::MAX as usize {
        return Err(OpenWireError::Serialization(format!(
            "encoded string of {} bytes is too long",
            len
        )));
    }
    Ok(len + 2)
}

pub(crate) fn tight_marshal_string2(
    value: Option<&str>,
    out: &mut ByteOutput,
    bs: &mut BooleanStream,
) -> Result<()> {
    if !bs.read_boolean()? {
        return Ok(());
    }
    let value = value.ok_or_else(out_of_step)?;
    if bs.read_boolean()? {
        out.write_short(value.len() as i16)?;
        out.write_bytes(value.as_bytes())
    } else {
        out.write_utf(value)
    }
}

pub(crate) fn tight_unmarshal_string(
    input: &mut ByteInput<'_>,
    bs: &mut BooleanStream,
) -> Result<Option<String>> {
    if !bs.read_boolean()? {
        return Ok(None);
    }
    if bs.read_boolean()? {
        let len = read_count(input, "string byte")?;
        let bytes = input.read_bytes(len)?;
        Ok(Some(bytes.iter().map(|&b| b as char).collect()))
    } else {
        Ok(Some(input.read_utf()?))
    }
}

pub(crate) fn loose_marshal_string(value: Option<&str>, out: &mut ByteOutput) -> Result<()> {
    out.write_bool(value.is_some())?;
    match value {
        Some(value) => out.write_utf(value),
        None => Ok(()),
    }
}

pub(crate) fn loose_unmarshal_string(input: &mut ByteInput<'_>) -> Result<Option<String>> {
    if input.read_bool()? {
        Ok(Some(input.read_utf()?))
    } else {
        Ok(None)
    }
}

/// An optional string with an ASCII fast path in tight mode.
pub struct StringField;

impl FieldCodec for StringField {
    type Value = Option<String>;

    fn tight_marshal1(
        _: &mut OpenWireFormat,
        value: &Option<String>,
        bs: &mut BooleanStream,
    ) -> Result<usize> {
        tight_marshal_string1(value.as_deref(), bs)
    }

    fn tight_marshal2(
        _: &mut OpenWireFormat,
        value: &Option<String>,
        out: &mut ByteOutput,
        bs: &mut BooleanStream,
    ) -> Result<()> {
        tight_marshal_string2(value.as_deref(), out, bs)
    }

    fn tight_unmarshal(
        _: &mut OpenWireFormat,
        slot: &mut Option<String>,
        input: &mut ByteInput<'_>,
        bs: &mut BooleanStream,
    ) -> Result<()> {
        *slot = tight_unmarshal_string(input, bs)?;
        Ok(())
    }

    fn loose_marshal(
        _: &mut OpenWireFormat,
        value: &Option<String>,
        out: &mut ByteOutput,
    ) -> Result<()> {
        loose_marshal_string(value.as_deref(), out)
    }

    fn loose_unmarshal(
        _: &mut OpenWireFormat,
        slot: &mut Option<String>,
        input: &mut ByteInput<'_>,
    ) -> Result<()> {
        *slot = loose_unmarshal_string(input)?;
        Ok(())
    }
}

fn read_byte_array(input: &mut ByteInput<'_>) -> Result<Vec<u8>> {
    let len = input.read_int()?;
    let len = usize::try_from(len)
        .map_err(|_| OpenWireError::Serialization(format!("invalid byte array length: {}", len)))?;
    input.read_bytes(len)
}

fn write_byte_array(value: &[u8], out: &mut ByteOutput) -> Result<()> {
    let len = i32::try_from(value.len()).map_err(|_| {
        OpenWireError::Serialization(format!("byte array of {} bytes is too long", value.len()))
    })?;
    out.write_int(len)?;
    out.write_bytes(value)
}

/// An optional byte array with a 32-bit length prefix.
pub struct BytesField;

impl FieldCodec for BytesField {
    type Value = Option<Vec<u8>>;

    fn tight_marshal1(
        _: &mut OpenWireFormat,
        value: &Option<Vec<u8>>,
        bs: &mut BooleanStream,
    ) -> Result<usize> {
        bs.write_boolean(value.is_some());
        Ok(value.as_ref().map_or(0, |v| v.len() + 4))
    }

    fn tight_marshal2(
        _: &mut OpenWireFormat,
        value: &Option<Vec<u8>>,
        out: &mut ByteOutput,
        bs: &mut BooleanStream,
    ) -> Result<()> {
        if bs.read_boolean()? {
            write_byte_array(value.as_deref().ok_or_else(out_of_step)?, out)?;
        }
        Ok(())
    }

    fn tight_unmarshal(
        _: &mut OpenWireFormat,
        slot: &mut Option<Vec<u8>>,
        input: &mut ByteInput<'_>,
        bs: &mut BooleanStream,
    ) -> Result<()> {
        *slot = if bs.read_boolean()? {
            Some(read_byte_array(input)?)
        } else {
            None
        };
        Ok(())
    }

    fn loose_marshal(
        _: &mut OpenWireFormat,
        value: &Option<Vec<u8>>,
        out: &mut ByteOutput,
    ) -> Result<()> {
        out.write_bool(value.is_some())?;
        match value {
            Some(v) => write_byte_array(v, out),
            None => Ok(()),
        }
    }

    fn loose_unmarshal(
        _: &mut OpenWireFormat,
        slot: &mut Option<Vec<u8>>,
        input: &mut ByteInput<'_>,
    ) -> Result<()> {
        *slot = if input.read_bool()? {
            Some(read_byte_array(input)?)
        } else {
            None
        };
        Ok(())
    }
}

fn tight_marshal_nested1<T: DataStructure>(
    wf: &mut OpenWireFormat,
    value: Option<&T>,
    bs: &mut BooleanStream,
) -> Result<usize> {
    bs.write_boolean(value.is_some());
    let Some(value) = value else {
        return Ok(0);
    };
    if value.is_marshall_aware() {
        // No pre-marshalled form is ever kept on this side.
        bs.write_boolean(false);
    }
    Ok(1 + value.tight_marshal1(wf, bs)?)
}

fn tight_marshal_nested2<T: DataStructure>(
    wf: &mut OpenWireFormat,
    value: Option<&T>,
    out: &mut ByteOutput,
    bs: &mut BooleanStream,
) -> Result<()> {
    if !bs.read_boolean()? {
        return Ok(());
    }
    let value = value.ok_or_else(out_of_step)?;
    out.write_byte(value.data_structure_type())?;
    if value.is_marshall_aware() && bs.read_boolean()? {
        return Err(out_of_step());
    }
    value.tight_marshal2(wf, out, bs)
}

fn tight_unmarshal_nested<T: DataStructure>(
    wf: &mut OpenWireFormat,
    input: &mut ByteInput<'_>,
    bs: &mut BooleanStream,
) -> Result<Option<T>> {
    if !bs.read_boolean()? {
        return Ok(None);
    }
    let data_type = input.read_byte()?;
    wf.enter_nested()?;
    let result = tight_unmarshal_nested_body(wf, data_type, input, bs);
    wf.exit_nested();
    result.map(Some)
}

fn tight_unmarshal_nested_body<T: DataStructure>(
    wf: &mut OpenWireFormat,
    data_type: u8,
    input: &mut ByteInput<'_>,
    bs: &mut BooleanStream,
) -> Result<T> {
    let mut value = T::create(wf, data_type)?;
    if value.is_marshall_aware() && bs.read_boolean()? {
        // A pre-marshalled body: size and type, then its own bitmap.
        input.read_int()?;
        input.read_byte()?;
        let mut inner = BooleanStream::unmarshal(input)?;
        value.tight_unmarshal(wf, input, &mut inner)?;
    } else {
        value.tight_unmarshal(wf, input, bs)?;
    }
    Ok(value)
}

fn loose_marshal_nested<T: DataStructure>(
    wf: &mut OpenWireFormat,
    value: Option<&T>,
    out: &mut ByteOutput,
) -> Result<()> {
    out.write_bool(value.is_some())?;
    if let Some(value) = value {
        out.write_byte(value.data_structure_type())?;
        value.loose_marshal(wf, out)?;
    }
    Ok(())
}

fn loose_unmarshal_nested<T: DataStructure>(
    wf: &mut OpenWireFormat,
    input: &mut ByteInput<'_>,
) -> Result<Option<T>> {
    if !input.read_bool()? {
        return Ok(None);
    }
    let data_type = input.read_byte()?;
    wf.enter_nested()?;
    let result = T::create(wf, data_type).and_then(|mut value| {
        value.loose_unmarshal(wf, input)?;
        Ok(value)
    });
    wf.exit_nested();
    result.map(Some)
}

/// An optional nested structure: a presence flag, its type byte, then its body.
pub struct NestedField<T>(PhantomData<T>);

impl<T: DataStructure> FieldCodec for NestedField<T> {
    type Value = Option<T>;

    fn tight_marshal1(
        wf: &mut OpenWireFormat,
        value: &Option<T>,
        bs: &mut BooleanStream,
    ) -> Result<usize> {
        tight_marshal_nested1(wf, value.as_ref(), bs)
    }

    fn tight_marshal2(
        wf: &mut OpenWireFormat,
        value: &Option<T>,
        out: &mut ByteOutput,
        bs: &mut BooleanStream,
    ) -> Result<()> {
        tight_marshal_nested2(wf, value.as_ref(), out, bs)
    }

    fn tight_unmarshal(
        wf: &mut OpenWireFormat,
        slot: &mut Option<T>,
        input: &mut ByteInput<'_>,
        bs: &mut BooleanStream,
    ) -> Result<()> {
        *slot = tight_unmarshal_nested(wf, input, bs)?;
        Ok(())
    }

    fn loose_marshal(wf: &mut OpenWireFormat, value: &Option<T>, out: &mut ByteOutput) -> Result<()> {
        loose_marshal_nested(wf, value.as_ref(), out)
    }

    fn loose_unmarshal(
        wf: &mut OpenWireFormat,
        slot: &mut Option<T>,
        input: &mut ByteInput<'_>,
    ) -> Result<()> {
        *slot = loose_unmarshal_nested(wf, input)?;
        Ok(())
    }
}

fn cache_key<T: Cacheable>(value: &Option<T>) -> Option<Command> {
    value.clone().map(Cacheable::to_cache_entry)
}

fn from_cache_slot<T: Cacheable>(entry: Option<Command>) -> Result<Option<T>> {
    entry.map(T::from_cache_entry).transpose()
}

/// A nested structure that is replaced by a 16-bit cache index once the peer
/// has seen it. Behaves like [`NestedField`] when caching is disabled.
pub struct CachedField<T>(PhantomData<T>);

impl<T: Cacheable> FieldCodec for CachedField<T> {
    type Value = Option<T>;

    fn tight_marshal1(
        wf: &mut OpenWireFormat,
        value: &Option<T>,
        bs: &mut BooleanStream,
    ) -> Result<usize> {
        if !wf.is_cache_enabled() {
            return tight_marshal_nested1(wf, value.as_ref(), bs);
        }
        let key = cache_key(value);
        if wf.marshal_cache_index(&key).is_some() {
            bs.write_boolean(false);
            return Ok(2);
        }
        bs.write_boolean(true);
        let rc = tight_marshal_nested1(wf, value.as_ref(), bs)?;
        wf.add_to_marshal_cache(key)?;
        Ok(2 + rc)
    }

    fn tight_marshal2(
        wf: &mut OpenWireFormat,
        value: &Option<T>,
        out: &mut ByteOutput,
        bs: &mut BooleanStream,
    ) -> Result<()> {
        if !wf.is_cache_enabled() {
            return tight_marshal_nested2(wf, value.as_ref(), out, bs);
        }
        let index = wf
            .marshal_cache_index(&cache_key(value))
            .ok_or_else(out_of_step)?;
        out.write_short(index)?;
        if bs.read_boolean()? {
            tight_marshal_nested2(wf, value.as_ref(), out, bs)?;
        }
        Ok(())
    }

    fn tight_unmarshal(
        wf: &mut OpenWireFormat,
        slot: &mut Option<T>,
        input: &mut ByteInput<'_>,
        bs: &mut BooleanStream,
    ) -> Result<()> {
        if !wf.is_cache_enabled() {
            *slot = tight_unmarshal_nested(wf, input, bs)?;
            return Ok(());
        }
        if bs.read_boolean()? {
            let index = input.read_short()?;
            let value: Option<T> = tight_unmarshal_nested(wf, input, bs)?;
            wf.set_in_unmarshal_cache(index, cache_key(&value))?;
            *slot = value;
        } else {
            let index = input.read_short()?;
            *slot = from_cache_slot(wf.get_from_unmarshal_cache(index)?)?;
        }
        Ok(())
    }

    fn loose_marshal(wf: &mut OpenWireFormat, value: &Option<T>, out: &mut ByteOutput) -> Result<()> {
        if !wf.is_cache_enabled() {
            return loose_marshal_nested(wf, value.as_ref(), out);
        }
        let key = cache_key(value);
        match wf.marshal_cache_index(&key) {
            Some(index) => {
                out.write_bool(false)?;
                out.write_short(index)
            }
            None => {
                let index = wf.add_to_marshal_cache(key)?;
                out.write_bool(true)?;
                out.write_short(index)?;
                loose_marshal_nested(wf, value.as_ref(), out)
            }
        }
    }

    fn loose_unmarshal(
        wf: &mut OpenWireFormat,
        slot: &mut Option<T>,
        input: &mut ByteInput<'_>,
    ) -> Result<()> {
        if !wf.is_cache_enabled() {
            *slot = loose_unmarshal_nested(wf, input)?;
            return Ok(());
        }
        if input.read_bool()? {
            let index = input.read_short()?;
            let value: Option<T> = loose_unmarshal_nested(wf, input)?;
            wf.set_in_unmarshal_cache(index, cache_key(&value))?;
            *slot = value;
        } else {
            let index = input.read_short()?;
            *slot = from_cache_slot(wf.get_from_unmarshal_cache(index)?)?;
        }
        Ok(())
    }
}

fn null_element() -> OpenWireError {
    OpenWireError::Serialization("null element in structure array".to_string())
}

/// An optional array of nested structures with a 16-bit element count.
pub struct ArrayField<T>(PhantomData<T>);

impl<T: DataStructure> FieldCodec for ArrayField<T> {
    type Value = Option<Vec<T>>;

    fn tight_marshal1(
        wf: &mut OpenWireFormat,
        value: &Option<Vec<T>>,
        bs: &mut BooleanStream,
    ) -> Result<usize> {
        bs.write_boolean(value.is_some());
        let Some(items) = value else {
            return Ok(0);
        };
        check_count(items.len(), "array elements")?;
        let mut rc = 2;
        for item in items {
            rc += tight_marshal_nested1(wf, Some(item), bs)?;
        }
        Ok(rc)
    }

    fn tight_marshal2(
        wf: &mut OpenWireFormat,
        value: &Option<Vec<T>>,
        out: &mut ByteOutput,
        bs: &mut BooleanStream,
    ) -> Result<()> {
        if !bs.read_boolean()? {
            return Ok(());
        }
        let items = value.as_ref().ok_or_else(out_of_step)?;
        out.write_short(check_count(items.len(), "array elements")?)?;
        for item in items {
            tight_marshal_nested2(wf, Some(item), out, bs)?;
        }
        Ok(())
    }

    fn tight_unmarshal(
        wf: &mut OpenWireFormat,
        slot: &mut Option<Vec<T>>,
        input: &mut ByteInput<'_>,
        bs: &mut BooleanStream,
    ) -> Result<()> {
        if !bs.read_boolean()? {
            *slot = None;
            return Ok(());
        }
        let count = read_count(input, "array element")?;
        let mut items = Vec::new();
        for _ in 0..count {
            items.push(tight_unmarshal_nested(wf, input, bs)?.ok_or_else(null_element)?);
        }
        *slot = Some(items);
        Ok(())
    }

    fn loose_marshal(
        wf: &mut OpenWireFormat,
        value: &Option<Vec<T>>,
        out: &mut ByteOutput,
    ) -> Result<()> {
        out.write_bool(value.is_some())?;
        if let Some(items) = value {
            out.write_short(check_count(items.len(), "array elements")?)?;
            for item in items {
                loose_marshal_nested(wf, Some(item), out)?;
            }
        }
        Ok(())
    }

    fn loose_unmarshal(
        wf: &mut OpenWireFormat,
        slot: &mut Option<Vec<T>>,
        input: &mut ByteInput<'_>,
    ) -> Result<()> {
        if !input.read_bool()? {
            *slot = None;
            return Ok(());
        }
        let count = read_count(input, "array element")?;
        let mut items = Vec::new();
        for _ in 0..count {
            items.push(loose_unmarshal_nested(wf, input)?.ok_or_else(null_element)?);
        }
        *slot = Some(items);
        Ok(())
    }
}

fn tight_marshal_throwable1(
    wf: &mut OpenWireFormat,
    value: Option<&BrokerError>,
    bs: &mut BooleanStream,
) -> Result<usize> {
    bs.write_boolean(value.is_some());
    let Some(error) = value else {
        return Ok(0);
    };
    let mut rc = tight_marshal_string1(Some(&error.exception_class), bs)?;
    rc += tight_marshal_string1(error.message.as_deref(), bs)?;
    if wf.is_stack_trace_enabled() {
        check_count(error.stack_trace.len(), "stack frames")?;
        rc += 2;
        for frame in &error.stack_trace {
            rc += tight_marshal_string1(Some(&frame.class_name), bs)?;
            rc += tight_marshal_string1(Some(&frame.method_name), bs)?;
            rc += tight_marshal_string1(frame.file_name.as_deref(), bs)?;
            rc += 4;
        }
        rc += tight_marshal_throwable1(wf, error.cause.as_deref(), bs)?;
    }
    Ok(rc)
}

fn tight_marshal_throwable2(
    wf: &mut OpenWireFormat,
    value: Option<&BrokerError>,
    out: &mut ByteOutput,
    bs: &mut BooleanStream,
) -> Result<()> {
    if !bs.read_boolean()? {
        return Ok(());
    }
    let error = value.ok_or_else(out_of_step)?;
    tight_marshal_string2(Some(&error.exception_class), out, bs)?;
    tight_marshal_string2(error.message.as_deref(), out, bs)?;
    if wf.is_stack_trace_enabled() {
        out.write_short(check_count(error.stack_trace.len(), "stack frames")?)?;
        for frame in &error.stack_trace {
            tight_marshal_string2(Some(&frame.class_name), out, bs)?;
            tight_marshal_string2(Some(&frame.method_name), out, bs)?;
            tight_marshal_string2(frame.file_name.as_deref(), out, bs)?;
            out.write_int(frame.line_number)?;
        }
        tight_marshal_throwable2(wf, error.cause.as_deref(), out, bs)?;
    }
    Ok(())
}

fn tight_unmarshal_throwable(
    wf: &mut OpenWireFormat,
    input: &mut ByteInput<'_>,
    bs: &mut BooleanStream,
) -> Result<Option<BrokerError>> {
    if !bs.read_boolean()? {
        return Ok(None);
    }
    let mut error = BrokerError {
        exception_class: tight_unmarshal_string(input, bs)?.unwrap_or_default(),
        message: tight_unmarshal_string(input, bs)?,
        ..BrokerError::default()
    };
    if wf.is_stack_trace_enabled() {
        let count = read_count(input, "stack frame")?;
        for _ in 0..count {
            error.stack_trace.push(StackTraceElement {
                class_name: tight_unmarshal_string(input, bs)?.unwrap_or_default(),
                method_name: tight_unmarshal_string(input, bs)?.unwrap_or_default(),
                file_name: tight_unmarshal_string(input, bs)?,
                line_number: input.read_int()?,
            });
        }
        wf.enter_nested()?;
        let cause = tight_unmarshal_throwable(wf, input, bs);
        wf.exit_nested();
        error.cause = cause?.map(Box::new);
    }
    Ok(Some(error))
}

fn loose_marshal_throwable(
    wf: &mut OpenWireFormat,
    value: Option<&BrokerError>,
    out: &mut ByteOutput,
) -> Result<()> {
    out.write_bool(value.is_some())?;
    let Some(error) = value else {
        return Ok(());
    };
    loose_marshal_string(Some(&error.exception_class), out)?;
    loose_marshal_string(error.message.as_deref(), out)?;
    if wf.is_stack_trace_enabled() {
        out.write_short(check_count(error.stack_trace.len(), "stack frames")?)?;
        for frame in &error.stack_trace {
            loose_marshal_string(Some(&frame.class_name), out)?;
            loose_marshal_string(Some(&frame.method_name), out)?;
            loose_marshal_string(frame.file_name.as_deref(), out)?;
            out.write_int(frame.line_number)?;
        }
        loose_marshal_throwable(wf, error.cause.as_deref(), out)?;
    }
    Ok(())
}

fn loose_unmarshal_throwable(
    wf: &mut OpenWireFormat,
    input: &mut ByteInput<'_>,
) -> Result<Option<BrokerError>> {
    if !input.read_bool()? {
        return Ok(None);
    }
    let mut error = BrokerError {
        exception_class: loose_unmarshal_string(input)?.unwrap_or_default(),
        message: loose_unmarshal_string(input)?,
        ..BrokerError::default()
    };
    if wf.is_stack_trace_enabled() {
        let count = read_count(input, "stack frame")?;
        for _ in 0..count {
            error.stack_trace.push(StackTraceElement {
                class_name: loose_unmarshal_string(input)?.unwrap_or_default(),
                method_name: loose_unmarshal_string(input)?.unwrap_or_default(),
                file_name: loose_unmarshal_string(input)?,
                line_number: input.read_int()?,
            });
        }
        wf.enter_nested()?;
        let cause = loose_unmarshal_throwable(wf, input);
        wf.exit_nested();
        error.cause = cause?.map(Box::new);
    }
    Ok(Some(error))
}

/// A broker-side exception: class, message and, when stack traces are
/// enabled, the frames and a recursive cause.
pub struct ThrowableField;

impl FieldCodec for ThrowableField {
    type Value = Option<BrokerError>;

    fn tight_marshal1(
        wf: &mut OpenWireFormat,
        value: &Option<BrokerError>,
        bs: &mut BooleanStream,
    ) -> Result<usize> {
        tight_marshal_throwable1(wf, value.as_ref(), bs)
    }

    fn tight_marshal2(
        wf: &mut OpenWireFormat,
        value: &Option<BrokerError>,
        out: &mut ByteOutput,
        bs: &mut BooleanStream,
    ) -> Result<()> {
        tight_marshal_throwable2(wf, value.as_ref(), out, bs)
    }

    fn tight_unmarshal(
        wf: &mut OpenWireFormat,
        slot: &mut Option<BrokerError>,
        input: &mut ByteInput<'_>,
        bs: &mut BooleanStream,
    ) -> Result<()> {
        *slot = tight_unmarshal_throwable(wf, input, bs)?;
        Ok(())
    }

    fn loose_marshal(
        wf: &mut OpenWireFormat,
        value: &Option<BrokerError>,
        out: &mut ByteOutput,
    ) -> Result<()> {
        loose_marshal_throwable(wf, value.as_ref(), out)
    }

    fn loose_unmarshal(
        wf: &mut OpenWireFormat,
        slot: &mut Option<BrokerError>,
        input: &mut ByteInput<'_>,
    ) -> Result<()> {
        *slot = loose_unmarshal_throwable(wf, input)?;
        Ok(())
    }
}

/// The fields of another structure written in place, without a presence
/// flag or type byte.
pub struct InlineField<T>(PhantomData<T>);

impl<T: MarshalFields> FieldCodec for InlineField<T> {
    type Value = T;

    fn tight_marshal1(wf: &mut OpenWireFormat, value: &T, bs: &mut BooleanStream) -> Result<usize> {
        value.tight_marshal1(wf, bs)
    }

    fn tight_marshal2(
        wf: &mut OpenWireFormat,
        value: &T,
        out: &mut ByteOutput,
        bs: &mut BooleanStream,
    ) -> Result<()> {
        value.tight_marshal2(wf, out, bs)
    }

    fn tight_unmarshal(
        wf: &mut OpenWireFormat,
        slot: &mut T,
        input: &mut ByteInput<'_>,
        bs: &mut BooleanStream,
    ) -> Result<()> {
        slot.tight_unmarshal(wf, input, bs)
    }

    fn loose_marshal(wf: &mut OpenWireFormat, value: &T, out: &mut ByteOutput) -> Result<()> {
        value.loose_marshal(wf, out)
    }

    fn loose_unmarshal(wf: &mut OpenWireFormat, slot: &mut T, input: &mut ByteInput<'_>) -> Result<()> {
        slot.loose_unmarshal(wf, input)
    }
}

/// A field kept only in memory. It is never written or read.
pub struct LocalField<T>(PhantomData<T>);

impl<T> FieldCodec for LocalField<T> {
    type Value = T;

    fn tight_marshal1(_: &mut OpenWireFormat, _: &T, _: &mut BooleanStream) -> Result<usize> {
        Ok(0)
    }

    fn tight_marshal2(
        _: &mut OpenWireFormat,
        _: &T,
        _: &mut ByteOutput,
        _: &mut BooleanStream,
    ) -> Result<()> {
        Ok(())
    }

    fn tight_unmarshal(
        _: &mut OpenWireFormat,
        _: &mut T,
        _: &mut ByteInput<'_>,
        _: &mut BooleanStream,
    ) -> Result<()> {
        Ok(())
    }

    fn loose_marshal(_: &mut OpenWireFormat, _: &T, _: &mut ByteOutput) -> Result<()> {
        Ok(())
    }

    fn loose_unmarshal(_: &mut OpenWireFormat, _: &mut T, _: &mut ByteInput<'_>) -> Result<()> {
        Ok(())
    }
}

/// Maps a field kind to the Rust type stored in the structure.
macro_rules! wire_type {
    (int) => { i32 };
    (short) => { i16 };
    (byte) => { u8 };
    (bool) => { bool };
    (long) => { i64 };
    (string) => { Option<String> };
    (bytes) => { Option<Vec<u8>> };
    (throwable) => { Option<$crate::commands::BrokerError> };
    (nested<$t:ty>) => { Option<$t> };
    (cached<$t:ty>) => { Option<$t> };
    (array<$t:ty>) => { Option<Vec<$t>> };
    (inline<$t:ty>) => { $t };
    (local<$t:ty>) => { $t };
}

/// Maps a field kind to its [`FieldCodec`].
macro_rules! codec {
    (int) => { $crate::protocol::marshal::IntField };
    (short) => { $crate::protocol::marshal::ShortField };
    (byte) => { $crate::protocol::marshal::ByteField };
    (bool) => { $crate::protocol::marshal::BoolField };
    (long) => { $crate::protocol::marshal::LongField };
    (string) => { $crate::protocol::marshal::StringField };
    (bytes) => { $crate::protocol::marshal::BytesField };
    (throwable) => { $crate::protocol::marshal::ThrowableField };
    (nested<$t:ty>) => { $crate::protocol::marshal::NestedField<$t> };
    (cached<$t:ty>) => { $crate::protocol::marshal::CachedField<$t> };
    (array<$t:ty>) => { $crate::protocol::marshal::ArrayField<$t> };
    (inline<$t:ty>) => { $crate::protocol::marshal::InlineField<$t> };
    (local<$t:ty>) => { $crate::protocol::marshal::LocalField<$t> };
}

/// First protocol version carrying a field; version 1 when unspecified.
macro_rules! version_gate {
    () => {
        1
    };
    ($ver:literal) => {
        $ver
    };
}

/// Declares a wire structure from its ordered field list.
///
/// ```ignore
/// openwire_struct! {
///     /// Doc comment.
///     pub struct ProducerInfo : constants::PRODUCER_INFO {
///         command_id: int,
///         response_required: bool,
///         producer_id: cached<ProducerId>,
///         window_size: int if version >= 3,
///     }
/// }
/// ```
///
/// With a type code the macro also implements [`DataStructure`]; without one
/// the caller supplies that impl.
macro_rules! openwire_struct {
    (
        $(#[$meta:meta])*
        pub struct $name:ident $(: $code:path)? {
            $(
                $(#[$fmeta:meta])*
                $field:ident : $kind:ident $(<$inner:ty>)? $(if version >= $ver:literal)?
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
        #[allow(missing_docs)]
        pub struct $name {
            $(
                $(#[$fmeta])*
                pub $field: $crate::protocol::marshal::wire_type!($kind $(<$inner>)?),
            )*
        }

        impl $crate::protocol::marshal::MarshalFields for $name {
            fn tight_marshal1(
                &self,
                wf: &mut $crate::protocol::OpenWireFormat,
                bs: &mut $crate::serialization::BooleanStream,
            ) -> $crate::error::Result<usize> {
                let mut rc = 0usize;
                $(
                    if wf.version() >= $crate::protocol::marshal::version_gate!($($ver)?) {
                        rc += <$crate::protocol::marshal::codec!($kind $(<$inner>)?)
                            as $crate::protocol::marshal::FieldCodec>::tight_marshal1(wf, &self.$field, bs)?;
                    }
                )*
                Ok(rc)
            }

            fn tight_marshal2(
                &self,
                wf: &mut $crate::protocol::OpenWireFormat,
                out: &mut $crate::serialization::ByteOutput,
                bs: &mut $crate::serialization::BooleanStream,
            ) -> $crate::error::Result<()> {
                $(
                    if wf.version() >= $crate::protocol::marshal::version_gate!($($ver)?) {
                        <$crate::protocol::marshal::codec!($kind $(<$inner>)?)
                            as $crate::protocol::marshal::FieldCodec>::tight_marshal2(wf, &self.$field, out, bs)?;
                    }
                )*
                Ok(())
            }

            fn tight_unmarshal(
                &mut self,
                wf: &mut $crate::protocol::OpenWireFormat,
                input: &mut $crate::serialization::ByteInput<'_>,
                bs: &mut $crate::serialization::BooleanStream,
            ) -> $crate::error::Result<()> {
                $(
                    if wf.version() >= $crate::protocol::marshal::version_gate!($($ver)?) {
                        <$crate::protocol::marshal::codec!($kind $(<$inner>)?)
                            as $crate::protocol::marshal::FieldCodec>::tight_unmarshal(wf, &mut self.$field, input, bs)?;
                    }
                )*
                Ok(())
            }

            fn loose_marshal(
                &self,
                wf: &mut $crate::protocol::OpenWireFormat,
                out: &mut $crate::serialization::ByteOutput,
            ) -> $crate::error::Result<()> {
                $(
                    if wf.version() >= $crate::protocol::marshal::version_gate!($($ver)?) {
                        <$crate::protocol::marshal::codec!($kind $(<$inner>)?)
                            as $crate::protocol::marshal::FieldCodec>::loose_marshal(wf, &self.$field, out)?;
                    }
                )*
                Ok(())
            }

            fn loose_unmarshal(
                &mut self,
                wf: &mut $crate::protocol::OpenWireFormat,
                input: &mut $crate::serialization::ByteInput<'_>,
            ) -> $crate::error::Result<()> {
                $(
                    if wf.version() >= $crate::protocol::marshal::version_gate!($($ver)?) {
                        <$crate::protocol::marshal::codec!($kind $(<$inner>)?)
                            as $crate::protocol::marshal::FieldCodec>::loose_unmarshal(wf, &mut self.$field, input)?;
                    }
                )*
                Ok(())
            }
        }

        $(
            impl $name {
                /// Wire type code of this structure.
                pub const DATA_STRUCTURE_TYPE: u8 = $code;
            }

            impl $crate::protocol::marshal::DataStructure for $name {
                fn data_structure_type(&self) -> u8 {
                    $code
                }

                fn create(
                    _: &$crate::protocol::OpenWireFormat,
                    data_type: u8,
                ) -> $crate::error::Result<Self> {
                    if data_type == $code {
                        Ok(Self::default())
                    } else {
                        Err($crate::error::OpenWireError::Protocol(format!(
                            "expected {} (type {}) but found type {}",
                            stringify!($name),
                            $code,
                            data_type
                        )))
                    }
                }
            }
        )?
    };
}

pub(crate) use {codec, openwire_struct, version_gate, wire_type};
