//! The OpenWire command set.
//!
//! Every structure that can travel on the wire is one variant of [`Command`].
//! The per-type structs are declared with `openwire_struct!`, which derives
//! their marshal code from the field list; the `commands!` table below ties
//! each struct to its variant and type codes and builds the marshaller
//! registry from the same table.

use std::sync::Arc;

use crate::error::{OpenWireError, Result};
use crate::protocol::constants::*;
use crate::protocol::marshal::{Cacheable, DataStructure, MarshalFields};
use crate::protocol::{MarshallerRegistry, OpenWireFormat, TypedMarshaller};
use crate::serialization::{BooleanStream, ByteInput, ByteOutput};

mod control;
mod destination;
mod ids;
mod info;
mod journal;
mod message;
mod response;
mod wireformat_info;

pub use control::{
    ConnectionControl, ConnectionError, ConsumerControl, ControlCommand, DiscoveryEvent,
    FlushCommand, LastPartialCommand, MessageAck, MessageDispatch, MessageDispatchNotification,
    MessagePull, NetworkBridgeFilter, PartialCommand, ProducerAck, ReplayCommand,
};
pub use destination::{Destination, DestinationKind};
pub use ids::{
    BrokerId, ConnectionId, ConsumerId, LocalTransactionId, MessageId, ProducerId, SessionId,
    TransactionId, XaTransactionId,
};
pub use info::{
    BrokerInfo, ConnectionInfo, ConsumerInfo, DestinationInfo, KeepAliveInfo, ProducerInfo,
    RemoveInfo, RemoveSubscriptionInfo, SessionInfo, ShutdownInfo, SubscriptionInfo,
    TransactionInfo,
};
pub use journal::{JournalQueueAck, JournalTopicAck, JournalTrace, JournalTransaction};
pub use message::{BlobMessage, Message, MessageKind};
pub use response::{
    BrokerError, DataArrayResponse, DataResponse, ExceptionResponse, IntegerResponse, Response,
    StackTraceElement,
};
pub use wireformat_info::WireFormatInfo;

/// Header fields shared by every command that can be sent as a request.
pub trait BaseCommand {
    /// Sender-assigned id, echoed back as a response's correlation id.
    fn command_id(&self) -> i32;

    /// Sets the command id.
    fn set_command_id(&mut self, id: i32);

    /// Whether the sender expects a response.
    fn is_response_required(&self) -> bool;

    /// Sets whether a response is expected.
    fn set_response_required(&mut self, required: bool);
}

macro_rules! base_command {
    ($($ty:ty),* $(,)?) => {$(
        impl BaseCommand for $ty {
            fn command_id(&self) -> i32 {
                self.command_id
            }

            fn set_command_id(&mut self, id: i32) {
                self.command_id = id;
            }

            fn is_response_required(&self) -> bool {
                self.response_required
            }

            fn set_response_required(&mut self, required: bool) {
                self.response_required = required;
            }
        }
    )*};
}

base_command!(
    BrokerInfo,
    ConnectionInfo,
    SessionInfo,
    ConsumerInfo,
    ProducerInfo,
    TransactionInfo,
    DestinationInfo,
    RemoveSubscriptionInfo,
    KeepAliveInfo,
    ShutdownInfo,
    RemoveInfo,
    ControlCommand,
    FlushCommand,
    ConnectionError,
    ConsumerControl,
    ConnectionControl,
    ProducerAck,
    MessagePull,
    MessageDispatch,
    MessageAck,
    Message,
    Response,
    ExceptionResponse,
    DataResponse,
    DataArrayResponse,
    IntegerResponse,
    ReplayCommand,
    MessageDispatchNotification,
);

impl BaseCommand for BlobMessage {
    fn command_id(&self) -> i32 {
        self.message.command_id
    }

    fn set_command_id(&mut self, id: i32) {
        self.message.command_id = id;
    }

    fn is_response_required(&self) -> bool {
        self.message.response_required
    }

    fn set_response_required(&mut self, required: bool) {
        self.message.response_required = required;
    }
}

/// Conversion between a concrete structure and its [`Command`] variant.
pub trait CommandVariant: Sized {
    /// Borrows the structure if `command` is this variant.
    fn from_command(command: &Command) -> Option<&Self>;

    /// Mutably borrows the structure if `command` is this variant.
    fn from_command_mut(command: &mut Command) -> Option<&mut Self>;

    /// Wraps the structure in its variant.
    fn into_command(self) -> Command;

    /// Unwraps the structure, handing the command back if it is another variant.
    fn try_from_command(command: Command) -> std::result::Result<Self, Command>;
}

/// Treats `structure` entries as having no command header.
macro_rules! header {
    (structure, $inner:expr) => {
        None
    };
    ($kind:ident, $inner:expr) => {
        Some($inner)
    };
}

macro_rules! commands {
    ($($kind:ident $variant:ident($ty:ty) = [$($code:ident),+]),* $(,)?) => {
        /// Any structure that can appear on the wire.
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        #[allow(missing_docs)]
        pub enum Command {
            $($variant(Box<$ty>),)*
        }

        impl Command {
            /// Name of the variant, for diagnostics.
            pub fn type_name(&self) -> &'static str {
                match self {
                    $(Command::$variant(_) => stringify!($variant),)*
                }
            }

            /// The request header, for variants that have one.
            #[allow(unused_variables)]
            pub fn as_base_command(&self) -> Option<&dyn BaseCommand> {
                match self {
                    $(Command::$variant(inner) => header!($kind, &**inner as &dyn BaseCommand),)*
                }
            }

            /// The mutable request header, for variants that have one.
            #[allow(unused_variables)]
            pub fn as_base_command_mut(&mut self) -> Option<&mut dyn BaseCommand> {
                match self {
                    $(Command::$variant(inner) => header!($kind, &mut **inner as &mut dyn BaseCommand),)*
                }
            }
        }

        impl DataStructure for Command {
            fn data_structure_type(&self) -> u8 {
                match self {
                    $(Command::$variant(inner) => inner.data_structure_type(),)*
                }
            }

            fn is_marshall_aware(&self) -> bool {
                match self {
                    $(Command::$variant(inner) => inner.is_marshall_aware(),)*
                }
            }

            fn create(wf: &OpenWireFormat, data_type: u8) -> Result<Self> {
                wf.marshaller(data_type)?.create_object(wf)
            }
        }

        $(
            impl CommandVariant for $ty {
                fn from_command(command: &Command) -> Option<&Self> {
                    match command {
                        Command::$variant(inner) => Some(&**inner),
                        _ => None,
                    }
                }

                fn from_command_mut(command: &mut Command) -> Option<&mut Self> {
                    match command {
                        Command::$variant(inner) => Some(&mut **inner),
                        _ => None,
                    }
                }

                fn into_command(self) -> Command {
                    Command::$variant(Box::new(self))
                }

                fn try_from_command(command: Command) -> std::result::Result<Self, Command> {
                    match command {
                        Command::$variant(inner) => Ok(*inner),
                        other => Err(other),
                    }
                }
            }

            impl From<$ty> for Command {
                fn from(value: $ty) -> Self {
                    Command::$variant(Box::new(value))
                }
            }
        )*

        /// Registers a marshaller for every type code of the command set.
        pub fn register_marshallers(registry: &mut MarshallerRegistry) {
            $($(
                registry.register(Arc::new(TypedMarshaller::<$ty>::new($code)));
            )+)*
        }
    };
}

commands! {
    structure WireFormatInfo(WireFormatInfo) = [WIREFORMAT_INFO],
    command BrokerInfo(BrokerInfo) = [BROKER_INFO],
    command ConnectionInfo(ConnectionInfo) = [CONNECTION_INFO],
    command SessionInfo(SessionInfo) = [SESSION_INFO],
    command ConsumerInfo(ConsumerInfo) = [CONSUMER_INFO],
    command ProducerInfo(ProducerInfo) = [PRODUCER_INFO],
    command TransactionInfo(TransactionInfo) = [TRANSACTION_INFO],
    command DestinationInfo(DestinationInfo) = [DESTINATION_INFO],
    command RemoveSubscriptionInfo(RemoveSubscriptionInfo) = [REMOVE_SUBSCRIPTION_INFO],
    command KeepAliveInfo(KeepAliveInfo) = [KEEP_ALIVE_INFO],
    command ShutdownInfo(ShutdownInfo) = [SHUTDOWN_INFO],
    command RemoveInfo(RemoveInfo) = [REMOVE_INFO],
    command ControlCommand(ControlCommand) = [CONTROL_COMMAND],
    command FlushCommand(FlushCommand) = [FLUSH_COMMAND],
    command ConnectionError(ConnectionError) = [CONNECTION_ERROR],
    command ConsumerControl(ConsumerControl) = [CONSUMER_CONTROL],
    command ConnectionControl(ConnectionControl) = [CONNECTION_CONTROL],
    command ProducerAck(ProducerAck) = [PRODUCER_ACK],
    command MessagePull(MessagePull) = [MESSAGE_PULL],
    command MessageDispatch(MessageDispatch) = [MESSAGE_DISPATCH],
    command MessageAck(MessageAck) = [MESSAGE_ACK],
    command Message(Message) = [
        MESSAGE,
        BYTES_MESSAGE,
        MAP_MESSAGE,
        OBJECT_MESSAGE,
        STREAM_MESSAGE,
        TEXT_MESSAGE
    ],
    command BlobMessage(BlobMessage) = [BLOB_MESSAGE],
    response Response(Response) = [RESPONSE],
    response ExceptionResponse(ExceptionResponse) = [EXCEPTION_RESPONSE],
    response DataResponse(DataResponse) = [DATA_RESPONSE],
    response DataArrayResponse(DataArrayResponse) = [DATA_ARRAY_RESPONSE],
    response IntegerResponse(IntegerResponse) = [INTEGER_RESPONSE],
    structure DiscoveryEvent(DiscoveryEvent) = [DISCOVERY_EVENT],
    structure JournalTopicAck(JournalTopicAck) = [JOURNAL_ACK],
    structure JournalQueueAck(JournalQueueAck) = [JOURNAL_REMOVE],
    structure JournalTrace(JournalTrace) = [JOURNAL_TRACE],
    structure JournalTransaction(JournalTransaction) = [JOURNAL_TRANSACTION],
    structure SubscriptionInfo(SubscriptionInfo) = [DURABLE_SUBSCRIPTION_INFO],
    structure PartialCommand(PartialCommand) = [PARTIAL_COMMAND],
    structure LastPartialCommand(LastPartialCommand) = [PARTIAL_LAST_COMMAND],
    command ReplayCommand(ReplayCommand) = [REPLAY],
    command MessageDispatchNotification(MessageDispatchNotification) = [MESSAGE_DISPATCH_NOTIFICATION],
    structure NetworkBridgeFilter(NetworkBridgeFilter) = [NETWORK_BRIDGE_FILTER],
    structure Destination(Destination) = [QUEUE, TOPIC, TEMP_QUEUE, TEMP_TOPIC],
    structure MessageId(MessageId) = [MESSAGE_ID],
    structure LocalTransactionId(LocalTransactionId) = [LOCAL_TRANSACTION_ID],
    structure XaTransactionId(XaTransactionId) = [XA_TRANSACTION_ID],
    structure ConnectionId(ConnectionId) = [CONNECTION_ID],
    structure SessionId(SessionId) = [SESSION_ID],
    structure ConsumerId(ConsumerId) = [CONSUMER_ID],
    structure ProducerId(ProducerId) = [PRODUCER_ID],
    structure BrokerId(BrokerId) = [BROKER_ID],
}

impl Command {
    /// The command id, or zero for structures without a request header.
    pub fn command_id(&self) -> i32 {
        self.as_base_command().map_or(0, |c| c.command_id())
    }

    /// Sets the command id. Ignored for structures without a request header.
    pub fn set_command_id(&mut self, id: i32) {
        if let Some(c) = self.as_base_command_mut() {
            c.set_command_id(id);
        }
    }

    /// Whether the sender expects a response.
    pub fn is_response_required(&self) -> bool {
        self.as_base_command()
            .is_some_and(|c| c.is_response_required())
    }

    /// Sets whether a response is expected. Ignored for structures without a
    /// request header.
    pub fn set_response_required(&mut self, required: bool) {
        if let Some(c) = self.as_base_command_mut() {
            c.set_response_required(required);
        }
    }

    /// The id of the request this answers, for the response variants.
    pub fn correlation_id(&self) -> Option<i32> {
        match self {
            Command::Response(r) => Some(r.correlation_id),
            Command::ExceptionResponse(r) => Some(r.correlation_id),
            Command::DataResponse(r) => Some(r.correlation_id),
            Command::DataArrayResponse(r) => Some(r.correlation_id),
            Command::IntegerResponse(r) => Some(r.correlation_id),
            _ => None,
        }
    }

    /// Returns true for the response variants.
    pub fn is_response(&self) -> bool {
        self.correlation_id().is_some()
    }

    /// Returns true for any message variant.
    pub fn is_message(&self) -> bool {
        matches!(self, Command::Message(_) | Command::BlobMessage(_))
    }
}

impl MarshalFields for Command {
    fn tight_marshal1(&self, wf: &mut OpenWireFormat, bs: &mut BooleanStream) -> Result<usize> {
        wf.marshaller(self.data_structure_type())?
            .tight_marshal1(wf, self, bs)
    }

    fn tight_marshal2(
        &self,
        wf: &mut OpenWireFormat,
        out: &mut ByteOutput,
        bs: &mut BooleanStream,
    ) -> Result<()> {
        wf.marshaller(self.data_structure_type())?
            .tight_marshal2(wf, self, out, bs)
    }

    fn tight_unmarshal(
        &mut self,
        wf: &mut OpenWireFormat,
        input: &mut ByteInput<'_>,
        bs: &mut BooleanStream,
    ) -> Result<()> {
        wf.marshaller(self.data_structure_type())?
            .tight_unmarshal(wf, self, input, bs)
    }

    fn loose_marshal(&self, wf: &mut OpenWireFormat, out: &mut ByteOutput) -> Result<()> {
        wf.marshaller(self.data_structure_type())?
            .loose_marshal(wf, self, out)
    }

    fn loose_unmarshal(&mut self, wf: &mut OpenWireFormat, input: &mut ByteInput<'_>) -> Result<()> {
        wf.marshaller(self.data_structure_type())?
            .loose_unmarshal(wf, self, input)
    }
}

impl Cacheable for Command {
    fn to_cache_entry(self) -> Command {
        self
    }

    fn from_cache_entry(entry: Command) -> Result<Self> {
        Ok(entry)
    }
}

macro_rules! cacheable {
    ($($ty:ty),* $(,)?) => {$(
        impl Cacheable for $ty {
            fn to_cache_entry(self) -> Command {
                self.into_command()
            }

            fn from_cache_entry(entry: Command) -> Result<Self> {
                <$ty>::try_from_command(entry).map_err(|other| cache_mismatch(stringify!($ty), &other))
            }
        }
    )*};
}

fn cache_mismatch(expected: &str, found: &Command) -> OpenWireError {
    OpenWireError::Protocol(format!(
        "cache slot holds {} where {} was expected",
        found.type_name(),
        expected
    ))
}

cacheable!(ConnectionId, SessionId, ConsumerId, ProducerId, BrokerId, Destination);

impl Cacheable for TransactionId {
    fn to_cache_entry(self) -> Command {
        match self {
            TransactionId::Local(id) => id.into(),
            TransactionId::Xa(id) => id.into(),
        }
    }

    fn from_cache_entry(entry: Command) -> Result<Self> {
        match entry {
            Command::LocalTransactionId(id) => Ok(TransactionId::Local(*id)),
            Command::XaTransactionId(id) => Ok(TransactionId::Xa(*id)),
            other => Err(cache_mismatch("TransactionId", &other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_accessors() {
        let mut command: Command = KeepAliveInfo::default().into();
        command.set_command_id(12);
        command.set_response_required(true);
        assert_eq!(command.command_id(), 12);
        assert!(command.is_response_required());
        assert!(!command.is_response());

        let mut id: Command = ConnectionId::new("ID:c").into();
        id.set_command_id(3);
        assert_eq!(id.command_id(), 0);
        assert!(id.as_base_command().is_none());
    }

    #[test]
    fn test_blob_message_header_lives_in_message() {
        let mut command: Command = BlobMessage::default().into();
        command.set_command_id(8);
        match &command {
            Command::BlobMessage(blob) => assert_eq!(blob.message.command_id, 8),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_correlation_id() {
        let response: Command = Response::for_request(41).into();
        assert_eq!(response.correlation_id(), Some(41));
        assert!(response.is_response());
        let exception: Command =
            ExceptionResponse::for_request(42, BrokerError::io("gone")).into();
        assert_eq!(exception.correlation_id(), Some(42));
        assert_eq!(Command::from(ShutdownInfo::default()).correlation_id(), None);
    }

    #[test]
    fn test_variant_conversions() {
        let command: Command = Message::text("hi").into();
        assert!(command.is_message());
        assert_eq!(command.type_name(), "Message");
        assert!(Message::from_command(&command).is_some());
        assert!(Response::from_command(&command).is_none());
        let back = Message::try_from_command(command).unwrap();
        assert_eq!(back.text_body().unwrap().as_deref(), Some("hi"));
        let not_response = Response::try_from_command(back.into_command());
        assert!(not_response.is_err());
    }

    #[test]
    fn test_cache_entries() {
        let dest = Destination::queue("orders");
        let entry = dest.clone().to_cache_entry();
        assert_eq!(Destination::from_cache_entry(entry.clone()).unwrap(), dest);
        assert!(ConnectionId::from_cache_entry(entry).is_err());

        let tx = TransactionId::Xa(XaTransactionId {
            format_id: 1,
            ..Default::default()
        });
        let entry = tx.clone().to_cache_entry();
        assert_eq!(entry.data_structure_type(), XA_TRANSACTION_ID);
        assert_eq!(TransactionId::from_cache_entry(entry).unwrap(), tx);
    }

    #[test]
    fn test_data_structure_type_follows_kind() {
        let queue: Command = Destination::new(DestinationKind::TempQueue, "t").into();
        assert_eq!(queue.data_structure_type(), TEMP_QUEUE);
        let bytes: Command = Message::with_kind(MessageKind::Bytes).into();
        assert_eq!(bytes.data_structure_type(), BYTES_MESSAGE);
        assert!(bytes.is_marshall_aware());
        assert!(!queue.is_marshall_aware());
    }
}
