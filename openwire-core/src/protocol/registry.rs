//! Per-type-code marshaller dispatch.

use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, OnceLock};

use crate::commands::{self, Command, CommandVariant};
use crate::error::{OpenWireError, Result};
use crate::protocol::format::OpenWireFormat;
use crate::protocol::marshal::DataStructure;
use crate::serialization::{BooleanStream, ByteInput, ByteOutput};

/// Marshals the body of one command type.
///
/// The format looks a marshaller up by the type byte, creates an empty
/// command with it, and hands it the rest of the frame.
pub trait DataStreamMarshaller: Send + Sync {
    /// The type code this marshaller handles.
    fn data_structure_type(&self) -> u8;

    /// Creates an empty command of this type.
    fn create_object(&self, wf: &OpenWireFormat) -> Result<Command>;

    /// Tight pass one over `command`'s fields.
    fn tight_marshal1(
        &self,
        wf: &mut OpenWireFormat,
        command: &Command,
        bs: &mut BooleanStream,
    ) -> Result<usize>;

    /// Tight pass two over `command`'s fields.
    fn tight_marshal2(
        &self,
        wf: &mut OpenWireFormat,
        command: &Command,
        out: &mut ByteOutput,
        bs: &mut BooleanStream,
    ) -> Result<()>;

    /// Reads a tight-encoded body into `command`.
    fn tight_unmarshal(
        &self,
        wf: &mut OpenWireFormat,
        command: &mut Command,
        input: &mut ByteInput<'_>,
        bs: &mut BooleanStream,
    ) -> Result<()>;

    /// Writes `command`'s fields in loose form.
    fn loose_marshal(
        &self,
        wf: &mut OpenWireFormat,
        command: &Command,
        out: &mut ByteOutput,
    ) -> Result<()>;

    /// Reads a loose-encoded body into `command`.
    fn loose_unmarshal(
        &self,
        wf: &mut OpenWireFormat,
        command: &mut Command,
        input: &mut ByteInput<'_>,
    ) -> Result<()>;
}

/// Marshaller for a single `Command` variant, generated from its field list.
pub struct TypedMarshaller<T> {
    data_type: u8,
    _marker: PhantomData<fn() -> T>,
}

impl<T> TypedMarshaller<T> {
    /// Creates a marshaller registered under `data_type`.
    pub fn new(data_type: u8) -> Self {
        Self {
            data_type,
            _marker: PhantomData,
        }
    }

    fn mismatch(&self, found: &'static str) -> OpenWireError {
        OpenWireError::Protocol(format!(
            "marshaller for type {} received {}",
            self.data_type, found
        ))
    }
}

impl<T> DataStreamMarshaller for TypedMarshaller<T>
where
    T: CommandVariant + DataStructure,
{
    fn data_structure_type(&self) -> u8 {
        self.data_type
    }

    fn create_object(&self, wf: &OpenWireFormat) -> Result<Command> {
        T::create(wf, self.data_type).map(CommandVariant::into_command)
    }

    fn tight_marshal1(
        &self,
        wf: &mut OpenWireFormat,
        command: &Command,
        bs: &mut BooleanStream,
    ) -> Result<usize> {
        T::from_command(command)
            .ok_or_else(|| self.mismatch(command.type_name()))?
            .tight_marshal1(wf, bs)
    }

    fn tight_marshal2(
        &self,
        wf: &mut OpenWireFormat,
        command: &Command,
        out: &mut ByteOutput,
        bs: &mut BooleanStream,
    ) -> Result<()> {
        T::from_command(command)
            .ok_or_else(|| self.mismatch(command.type_name()))?
            .tight_marshal2(wf, out, bs)
    }

    fn tight_unmarshal(
        &self,
        wf: &mut OpenWireFormat,
        command: &mut Command,
        input: &mut ByteInput<'_>,
        bs: &mut BooleanStream,
    ) -> Result<()> {
        let found = command.type_name();
        T::from_command_mut(command)
            .ok_or_else(|| self.mismatch(found))?
            .tight_unmarshal(wf, input, bs)
    }

    fn loose_marshal(
        &self,
        wf: &mut OpenWireFormat,
        command: &Command,
        out: &mut ByteOutput,
    ) -> Result<()> {
        T::from_command(command)
            .ok_or_else(|| self.mismatch(command.type_name()))?
            .loose_marshal(wf, out)
    }

    fn loose_unmarshal(
        &self,
        wf: &mut OpenWireFormat,
        command: &mut Command,
        input: &mut ByteInput<'_>,
    ) -> Result<()> {
        let found = command.type_name();
        T::from_command_mut(command)
            .ok_or_else(|| self.mismatch(found))?
            .loose_unmarshal(wf, input)
    }
}

/// Lookup table from type code to marshaller.
pub struct MarshallerRegistry {
    marshallers: Vec<Option<Arc<dyn DataStreamMarshaller>>>,
}

impl MarshallerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            marshallers: vec![None; 256],
        }
    }

    /// The registry holding every structure of protocol versions 1 through 9,
    /// built once and shared.
    pub fn standard() -> Arc<MarshallerRegistry> {
        static STANDARD: OnceLock<Arc<MarshallerRegistry>> = OnceLock::new();
        STANDARD
            .get_or_init(|| {
                let mut registry = MarshallerRegistry::new();
                commands::register_marshallers(&mut registry);
                Arc::new(registry)
            })
            .clone()
    }

    /// Registers `marshaller` under its type code, replacing any previous one.
    pub fn register(&mut self, marshaller: Arc<dyn DataStreamMarshaller>) {
        let slot = marshaller.data_structure_type() as usize;
        self.marshallers[slot] = Some(marshaller);
    }

    /// Returns the marshaller for `data_type`.
    pub fn get(&self, data_type: u8) -> Option<Arc<dyn DataStreamMarshaller>> {
        self.marshallers[data_type as usize].clone()
    }

    /// Returns true if a marshaller is registered for `data_type`.
    pub fn contains(&self, data_type: u8) -> bool {
        self.marshallers[data_type as usize].is_some()
    }

    /// Number of registered type codes.
    pub fn len(&self) -> usize {
        self.marshallers.iter().filter(|m| m.is_some()).count()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MarshallerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MarshallerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MarshallerRegistry")
            .field("registered", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants;

    #[test]
    fn test_standard_registry_covers_all_codes() {
        let registry = MarshallerRegistry::standard();
        let expected: &[u8] = &[
            1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24,
            25, 26, 27, 28, 29, 30, 31, 32, 33, 34, 40, 50, 52, 53, 54, 55, 60, 61, 65, 90, 91,
            100, 101, 102, 103, 110, 111, 112, 120, 121, 122, 123, 124,
        ];
        assert_eq!(expected.len(), 56);
        for code in expected {
            assert!(registry.contains(*code), "missing marshaller for {}", code);
        }
        assert_eq!(registry.len(), 56);
        assert!(!registry.contains(0));
        assert!(!registry.contains(13));
    }

    #[test]
    fn test_registered_code_matches_created_object() {
        let registry = MarshallerRegistry::standard();
        let wf = OpenWireFormat::default();
        for code in [
            constants::TEXT_MESSAGE,
            constants::TEMP_TOPIC,
            constants::CONSUMER_INFO,
            constants::XA_TRANSACTION_ID,
        ] {
            let marshaller = registry.get(code).unwrap();
            assert_eq!(marshaller.data_structure_type(), code);
            let created = marshaller.create_object(&wf).unwrap();
            assert_eq!(created.data_structure_type(), code);
        }
    }

    #[test]
    fn test_empty_registry() {
        let registry = MarshallerRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.get(constants::RESPONSE).is_none());
    }

    #[test]
    fn test_registry_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<MarshallerRegistry>();
    }
}
