//! Identifiers for connections, sessions, producers, consumers, brokers,
//! messages and transactions.

use std::cmp::Ordering;
use std::fmt;

use crate::error::{OpenWireError, Result};
use crate::protocol::constants;
use crate::protocol::marshal::{openwire_struct, DataStructure, MarshalFields};
use crate::protocol::OpenWireFormat;
use crate::serialization::{BooleanStream, ByteInput, ByteOutput};

openwire_struct! {
    /// Identifies one client connection.
    #[derive(PartialOrd, Ord)]
    pub struct ConnectionId : constants::CONNECTION_ID {
        value: string,
    }
}

openwire_struct! {
    /// Identifies a session within a connection.
    #[derive(PartialOrd, Ord)]
    pub struct SessionId : constants::SESSION_ID {
        connection_id: string,
        value: long,
    }
}

openwire_struct! {
    /// Identifies a consumer within a session.
    #[derive(PartialOrd, Ord)]
    pub struct ConsumerId : constants::CONSUMER_ID {
        connection_id: string,
        session_id: long,
        value: long,
    }
}

openwire_struct! {
    /// Identifies a producer within a session.
    pub struct ProducerId : constants::PRODUCER_ID {
        connection_id: string,
        value: long,
        session_id: long,
    }
}

openwire_struct! {
    /// Identifies a broker.
    #[derive(PartialOrd, Ord)]
    pub struct BrokerId : constants::BROKER_ID {
        value: string,
    }
}

openwire_struct! {
    /// Identifies a message by its producer and sequence numbers.
    pub struct MessageId : constants::MESSAGE_ID {
        producer_id: cached<ProducerId>,
        producer_sequence_id: long,
        broker_sequence_id: long,
    }
}

openwire_struct! {
    /// A transaction local to one connection.
    pub struct LocalTransactionId : constants::LOCAL_TRANSACTION_ID {
        value: long,
        connection_id: cached<ConnectionId>,
    }
}

openwire_struct! {
    /// A distributed (XA) transaction branch.
    pub struct XaTransactionId : constants::XA_TRANSACTION_ID {
        format_id: int,
        global_transaction_id: bytes,
        branch_qualifier: bytes,
    }
}

impl ConnectionId {
    /// Creates a connection id.
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: Some(value.into()),
        }
    }
}

impl SessionId {
    /// Creates a session id.
    pub fn new(connection_id: impl Into<String>, value: i64) -> Self {
        Self {
            connection_id: Some(connection_id.into()),
            value,
        }
    }

    /// The owning connection.
    pub fn parent_id(&self) -> ConnectionId {
        ConnectionId {
            value: self.connection_id.clone(),
        }
    }
}

impl ConsumerId {
    /// Creates a consumer id.
    pub fn new(connection_id: impl Into<String>, session_id: i64, value: i64) -> Self {
        Self {
            connection_id: Some(connection_id.into()),
            session_id,
            value,
        }
    }

    /// The owning session.
    pub fn parent_id(&self) -> SessionId {
        SessionId {
            connection_id: self.connection_id.clone(),
            value: self.session_id,
        }
    }
}

impl ProducerId {
    /// Creates a producer id.
    pub fn new(connection_id: impl Into<String>, value: i64, session_id: i64) -> Self {
        Self {
            connection_id: Some(connection_id.into()),
            value,
            session_id,
        }
    }

    /// The owning session.
    pub fn parent_id(&self) -> SessionId {
        SessionId {
            connection_id: self.connection_id.clone(),
            value: self.session_id,
        }
    }
}

// Field order on the wire differs from the (connection, session, value) ordering.
impl Ord for ProducerId {
    fn cmp(&self, other: &Self) -> Ordering {
        (&self.connection_id, self.session_id, self.value).cmp(&(
            &other.connection_id,
            other.session_id,
            other.value,
        ))
    }
}

impl PartialOrd for ProducerId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl BrokerId {
    /// Creates a broker id.
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: Some(value.into()),
        }
    }
}

impl MessageId {
    /// Creates the id of the `sequence`th message sent by `producer_id`.
    pub fn new(producer_id: ProducerId, sequence: i64) -> Self {
        Self {
            producer_id: Some(producer_id),
            producer_sequence_id: sequence,
            broker_sequence_id: 0,
        }
    }
}

impl LocalTransactionId {
    /// Creates a local transaction id.
    pub fn new(connection_id: ConnectionId, value: i64) -> Self {
        Self {
            value,
            connection_id: Some(connection_id),
        }
    }
}

fn opt(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or("")
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(opt(&self.value))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", opt(&self.connection_id), self.value)
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            opt(&self.connection_id),
            self.session_id,
            self.value
        )
    }
}

impl fmt::Display for ProducerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            opt(&self.connection_id),
            self.session_id,
            self.value
        )
    }
}

impl fmt::Display for BrokerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(opt(&self.value))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.producer_id {
            Some(producer) => write!(f, "{}:{}", producer, self.producer_sequence_id),
            None => write!(f, ":{}", self.producer_sequence_id),
        }
    }
}

/// Either kind of transaction id. Fields typed as a transaction id accept both.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TransactionId {
    /// A connection-local transaction.
    Local(LocalTransactionId),
    /// An XA transaction branch.
    Xa(XaTransactionId),
}

impl Default for TransactionId {
    fn default() -> Self {
        TransactionId::Local(LocalTransactionId::default())
    }
}

impl TransactionId {
    /// Returns true for XA transactions.
    pub fn is_xa(&self) -> bool {
        matches!(self, TransactionId::Xa(_))
    }
}

impl From<LocalTransactionId> for TransactionId {
    fn from(id: LocalTransactionId) -> Self {
        TransactionId::Local(id)
    }
}

impl From<XaTransactionId> for TransactionId {
    fn from(id: XaTransactionId) -> Self {
        TransactionId::Xa(id)
    }
}

impl MarshalFields for TransactionId {
    fn tight_marshal1(&self, wf: &mut OpenWireFormat, bs: &mut BooleanStream) -> Result<usize> {
        match self {
            TransactionId::Local(id) => id.tight_marshal1(wf, bs),
            TransactionId::Xa(id) => id.tight_marshal1(wf, bs),
        }
    }

    fn tight_marshal2(
        &self,
        wf: &mut OpenWireFormat,
        out: &mut ByteOutput,
        bs: &mut BooleanStream,
    ) -> Result<()> {
        match self {
            TransactionId::Local(id) => id.tight_marshal2(wf, out, bs),
            TransactionId::Xa(id) => id.tight_marshal2(wf, out, bs),
        }
    }

    fn tight_unmarshal(
        &mut self,
        wf: &mut OpenWireFormat,
        input: &mut ByteInput<'_>,
        bs: &mut BooleanStream,
    ) -> Result<()> {
        match self {
            TransactionId::Local(id) => id.tight_unmarshal(wf, input, bs),
            TransactionId::Xa(id) => id.tight_unmarshal(wf, input, bs),
        }
    }

    fn loose_marshal(&self, wf: &mut OpenWireFormat, out: &mut ByteOutput) -> Result<()> {
        match self {
            TransactionId::Local(id) => id.loose_marshal(wf, out),
            TransactionId::Xa(id) => id.loose_marshal(wf, out),
        }
    }

    fn loose_unmarshal(&mut self, wf: &mut OpenWireFormat, input: &mut ByteInput<'_>) -> Result<()> {
        match self {
            TransactionId::Local(id) => id.loose_unmarshal(wf, input),
            TransactionId::Xa(id) => id.loose_unmarshal(wf, input),
        }
    }
}

impl DataStructure for TransactionId {
    fn data_structure_type(&self) -> u8 {
        match self {
            TransactionId::Local(_) => constants::LOCAL_TRANSACTION_ID,
            TransactionId::Xa(_) => constants::XA_TRANSACTION_ID,
        }
    }

    fn create(_: &OpenWireFormat, data_type: u8) -> Result<Self> {
        match data_type {
            constants::LOCAL_TRANSACTION_ID => Ok(TransactionId::Local(Default::default())),
            constants::XA_TRANSACTION_ID => Ok(TransactionId::Xa(Default::default())),
            other => Err(OpenWireError::Protocol(format!(
                "expected a transaction id but found type {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_ids() {
        let consumer = ConsumerId::new("ID:host-1", 2, 7);
        assert_eq!(consumer.parent_id(), SessionId::new("ID:host-1", 2));
        assert_eq!(
            consumer.parent_id().parent_id(),
            ConnectionId::new("ID:host-1")
        );

        let producer = ProducerId::new("ID:host-1", 9, 2);
        assert_eq!(producer.parent_id(), SessionId::new("ID:host-1", 2));
    }

    #[test]
    fn test_ordering_is_connection_session_value() {
        let a = ProducerId::new("ID:a", 5, 1);
        let b = ProducerId::new("ID:a", 1, 2);
        let c = ProducerId::new("ID:b", 0, 0);
        assert!(a < b);
        assert!(b < c);

        let mut consumers = vec![
            ConsumerId::new("ID:a", 2, 1),
            ConsumerId::new("ID:a", 1, 9),
            ConsumerId::new("ID:a", 1, 3),
        ];
        consumers.sort();
        assert_eq!(consumers[0], ConsumerId::new("ID:a", 1, 3));
        assert_eq!(consumers[2], ConsumerId::new("ID:a", 2, 1));
    }

    #[test]
    fn test_display() {
        assert_eq!(ConsumerId::new("ID:c", 1, 2).to_string(), "ID:c:1:2");
        assert_eq!(ProducerId::new("ID:c", 3, 1).to_string(), "ID:c:1:3");
        let id = MessageId::new(ProducerId::new("ID:c", 3, 1), 42);
        assert_eq!(id.to_string(), "ID:c:1:3:42");
    }

    #[test]
    fn test_transaction_id_create() {
        let wf = OpenWireFormat::default();
        assert!(TransactionId::create(&wf, constants::XA_TRANSACTION_ID)
            .unwrap()
            .is_xa());
        assert!(!TransactionId::create(&wf, constants::LOCAL_TRANSACTION_ID)
            .unwrap()
            .is_xa());
        assert!(TransactionId::create(&wf, constants::QUEUE).is_err());
    }
}
