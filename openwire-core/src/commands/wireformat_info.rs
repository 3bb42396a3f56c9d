//! The capability record exchanged when a connection starts.

use crate::error::{OpenWireError, Result};
use crate::protocol::constants;
use crate::protocol::marshal::{BytesField, DataStructure, FieldCodec, MarshalFields};
use crate::protocol::OpenWireFormat;
use crate::serialization::{
    map_from_bytes, map_to_bytes, BooleanStream, ByteInput, ByteOutput, DataInput, DataOutput,
    PrimitiveMap,
};

/// Announces a peer's protocol version and wire format options.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WireFormatInfo {
    /// Always `ActiveMQ` for a valid record.
    pub magic: [u8; 8],
    /// Highest protocol version the sender speaks.
    pub version: i32,
    /// The options, as a marshalled primitive map.
    pub marshalled_properties: Option<Vec<u8>>,
}

impl WireFormatInfo {
    /// Wire type code of this structure.
    pub const DATA_STRUCTURE_TYPE: u8 = constants::WIREFORMAT_INFO;
}

/// Property names in the option map.
#[allow(missing_docs)]
impl WireFormatInfo {
    pub const TIGHT_ENCODING_ENABLED: &'static str = "TightEncodingEnabled";
    pub const SIZE_PREFIX_DISABLED: &'static str = "SizePrefixDisabled";
    pub const CACHE_ENABLED: &'static str = "CacheEnabled";
    pub const CACHE_SIZE: &'static str = "CacheSize";
    pub const STACK_TRACE_ENABLED: &'static str = "StackTraceEnabled";
    pub const TCP_NO_DELAY_ENABLED: &'static str = "TcpNoDelayEnabled";
    pub const MAX_INACTIVITY_DURATION: &'static str = "MaxInactivityDuration";
    /// The property name keeps the broker's historical spelling.
    pub const MAX_INACTIVITY_INITIAL_DELAY: &'static str = "MaxInactivityDurationInitalDelay";
    pub const MAX_FRAME_SIZE: &'static str = "MaxFrameSize";
}

impl WireFormatInfo {
    /// Creates a record for `version` with no properties.
    pub fn new(version: i32) -> Self {
        Self {
            magic: constants::MAGIC,
            version,
            marshalled_properties: None,
        }
    }

    /// Returns true if the magic bytes are correct.
    pub fn is_valid(&self) -> bool {
        self.magic == constants::MAGIC
    }

    /// Decodes the option map.
    pub fn properties(&self) -> Result<PrimitiveMap> {
        match self.marshalled_properties.as_deref() {
            Some(bytes) => map_from_bytes(bytes),
            None => Ok(PrimitiveMap::new()),
        }
    }

    /// Edits the option map in place and re-marshals it.
    pub fn update_properties(&mut self, edit: impl FnOnce(&mut PrimitiveMap)) -> Result<()> {
        let mut props = self.properties()?;
        edit(&mut props);
        self.marshalled_properties = Some(map_to_bytes(&props)?);
        Ok(())
    }
}

impl Default for WireFormatInfo {
    fn default() -> Self {
        Self::new(constants::MAX_SUPPORTED_VERSION)
    }
}

fn read_magic(input: &mut ByteInput<'_>) -> Result<[u8; 8]> {
    let bytes = input.read_bytes(8)?;
    let mut magic = [0u8; 8];
    magic.copy_from_slice(&bytes);
    Ok(magic)
}

impl MarshalFields for WireFormatInfo {
    fn tight_marshal1(&self, wf: &mut OpenWireFormat, bs: &mut BooleanStream) -> Result<usize> {
        Ok(8 + 4 + BytesField::tight_marshal1(wf, &self.marshalled_properties, bs)?)
    }

    fn tight_marshal2(
        &self,
        wf: &mut OpenWireFormat,
        out: &mut ByteOutput,
        bs: &mut BooleanStream,
    ) -> Result<()> {
        out.write_bytes(&self.magic)?;
        out.write_int(self.version)?;
        BytesField::tight_marshal2(wf, &self.marshalled_properties, out, bs)
    }

    fn tight_unmarshal(
        &mut self,
        wf: &mut OpenWireFormat,
        input: &mut ByteInput<'_>,
        bs: &mut BooleanStream,
    ) -> Result<()> {
        self.magic = read_magic(input)?;
        self.version = input.read_int()?;
        BytesField::tight_unmarshal(wf, &mut self.marshalled_properties, input, bs)
    }

    fn loose_marshal(&self, wf: &mut OpenWireFormat, out: &mut ByteOutput) -> Result<()> {
        out.write_bytes(&self.magic)?;
        out.write_int(self.version)?;
        BytesField::loose_marshal(wf, &self.marshalled_properties, out)
    }

    fn loose_unmarshal(&mut self, wf: &mut OpenWireFormat, input: &mut ByteInput<'_>) -> Result<()> {
        self.magic = read_magic(input)?;
        self.version = input.read_int()?;
        BytesField::loose_unmarshal(wf, &mut self.marshalled_properties, input)
    }
}

impl DataStructure for WireFormatInfo {
    fn data_structure_type(&self) -> u8 {
        constants::WIREFORMAT_INFO
    }

    fn create(_: &OpenWireFormat, data_type: u8) -> Result<Self> {
        if data_type == constants::WIREFORMAT_INFO {
            Ok(Self::default())
        } else {
            Err(OpenWireError::Protocol(format!(
                "expected WireFormatInfo but found type {}",
                data_type
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::WireFormatSettings;

    #[test]
    fn test_new_is_valid() {
        let info = WireFormatInfo::new(5);
        assert!(info.is_valid());
        assert_eq!(info.version, 5);
        assert!(info.properties().unwrap().is_empty());
    }

    #[test]
    fn test_update_properties() {
        let mut info = WireFormatInfo::new(9);
        info.update_properties(|p| {
            p.insert(WireFormatInfo::CACHE_SIZE, 512);
        })
        .unwrap();
        info.update_properties(|p| {
            p.insert(WireFormatInfo::CACHE_ENABLED, true);
        })
        .unwrap();
        let props = info.properties().unwrap();
        assert_eq!(props.get_int(WireFormatInfo::CACHE_SIZE), Some(512));
        assert_eq!(props.get_bool(WireFormatInfo::CACHE_ENABLED), Some(true));
    }

    #[test]
    fn test_loose_layout_starts_with_magic() {
        let mut wf = OpenWireFormat::for_negotiation(WireFormatSettings::default());
        let info = WireFormatInfo::new(9);
        let bytes = wf.marshal_to_vec(&info.clone().into()).unwrap();
        assert_eq!(bytes[4], constants::WIREFORMAT_INFO);
        assert_eq!(&bytes[5..13], b"ActiveMQ");
        assert_eq!(&bytes[13..17], &[0, 0, 0, 9]);
        assert_eq!(
            wf.unmarshal_from_slice(&bytes).unwrap(),
            Some(info.into())
        );
    }
}
