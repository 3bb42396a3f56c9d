//! Byte-level building blocks of the OpenWire format.

mod boolean_stream;
mod data_input;
mod data_output;
pub mod primitive;

pub use boolean_stream::BooleanStream;
pub use data_input::{decode_modified_utf8, ByteInput, DataInput};
pub use data_output::{encode_modified_utf8, modified_utf8_len, ByteOutput, DataOutput};
pub use primitive::{
    map_from_bytes, map_to_bytes, marshal_primitive, marshal_primitive_map, unmarshal_primitive,
    unmarshal_primitive_map, PrimitiveMap, PrimitiveValue,
};
