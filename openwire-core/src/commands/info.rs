//! Commands that create, describe and remove client-side state in the broker.

use crate::protocol::constants;
use crate::protocol::marshal::openwire_struct;

use super::{
    BrokerId, Command, ConnectionId, ConsumerId, Destination, ProducerId, SessionId,
    TransactionId,
};

openwire_struct! {
    /// Describes the broker at the other end of the connection.
    pub struct BrokerInfo : constants::BROKER_INFO {
        command_id: int,
        response_required: bool,
        broker_id: cached<BrokerId>,
        broker_url: string,
        peer_broker_infos: array<BrokerInfo>,
        broker_name: string,
        slave_broker: bool,
        master_broker: bool,
        fault_tolerant_configuration: bool,
        duplex_connection: bool if version >= 2,
        network_connection: bool if version >= 2,
        connection_id: long if version >= 2,
        broker_upload_url: string if version >= 3,
        network_properties: string if version >= 3,
    }
}

openwire_struct! {
    /// Opens a connection.
    pub struct ConnectionInfo : constants::CONNECTION_INFO {
        command_id: int,
        response_required: bool,
        connection_id: cached<ConnectionId>,
        client_id: string,
        password: string,
        user_name: string,
        broker_path: array<BrokerId>,
        broker_master_connector: bool,
        manageable: bool,
        client_master: bool if version >= 2,
        fault_tolerant: bool if version >= 6,
        failover_reconnect: bool if version >= 6,
        client_ip: string if version >= 8,
    }
}

openwire_struct! {
    /// Opens a session.
    pub struct SessionInfo : constants::SESSION_INFO {
        command_id: int,
        response_required: bool,
        session_id: cached<SessionId>,
    }
}

openwire_struct! {
    /// Registers a consumer.
    pub struct ConsumerInfo : constants::CONSUMER_INFO {
        command_id: int,
        response_required: bool,
        consumer_id: cached<ConsumerId>,
        browser: bool,
        destination: cached<Destination>,
        prefetch_size: int,
        maximum_pending_message_limit: int,
        dispatch_async: bool,
        selector: string,
        subscription_name: string,
        no_local: bool,
        exclusive: bool,
        retroactive: bool,
        priority: byte,
        broker_path: array<BrokerId>,
        additional_predicate: nested<Command>,
        network_subscription: bool,
        optimized_acknowledge: bool,
        no_range_acks: bool,
        network_consumer_path: array<ConsumerId> if version >= 4,
    }
}

openwire_struct! {
    /// Registers a producer.
    pub struct ProducerInfo : constants::PRODUCER_INFO {
        command_id: int,
        response_required: bool,
        producer_id: cached<ProducerId>,
        destination: cached<Destination>,
        broker_path: array<BrokerId>,
        dispatch_async: bool if version >= 2,
        window_size: int if version >= 3,
    }
}

openwire_struct! {
    /// Begins, prepares, commits or rolls back a transaction.
    pub struct TransactionInfo : constants::TRANSACTION_INFO {
        command_id: int,
        response_required: bool,
        connection_id: cached<ConnectionId>,
        transaction_id: cached<TransactionId>,
        transaction_type: byte,
    }
}

openwire_struct! {
    /// Creates or removes a destination, usually a temporary one.
    pub struct DestinationInfo : constants::DESTINATION_INFO {
        command_id: int,
        response_required: bool,
        connection_id: cached<ConnectionId>,
        destination: cached<Destination>,
        operation_type: byte,
        timeout: long,
        broker_path: array<BrokerId>,
    }
}

openwire_struct! {
    /// Deletes a durable subscription.
    pub struct RemoveSubscriptionInfo : constants::REMOVE_SUBSCRIPTION_INFO {
        command_id: int,
        response_required: bool,
        connection_id: cached<ConnectionId>,
        subscription_name: string,
        client_id: string,
    }
}

openwire_struct! {
    /// Heartbeat exchanged by the inactivity monitors.
    pub struct KeepAliveInfo : constants::KEEP_ALIVE_INFO {
        command_id: int,
        response_required: bool,
    }
}

openwire_struct! {
    /// Announces that the sender is going away.
    pub struct ShutdownInfo : constants::SHUTDOWN_INFO {
        command_id: int,
        response_required: bool,
    }
}

openwire_struct! {
    /// Removes a connection, session, producer or consumer.
    pub struct RemoveInfo : constants::REMOVE_INFO {
        command_id: int,
        response_required: bool,
        object_id: cached<Command>,
        last_delivered_sequence_id: long if version >= 5,
    }
}

openwire_struct! {
    /// Describes a durable subscription.
    pub struct SubscriptionInfo : constants::DURABLE_SUBSCRIPTION_INFO {
        client_id: string,
        destination: cached<Destination>,
        selector: string,
        subscription_name: string,
        subscribed_destination: nested<Destination> if version >= 3,
    }
}

impl DestinationInfo {
    /// `operation_type` value that creates the destination.
    pub const ADD_OPERATION_TYPE: u8 = 0;
    /// `operation_type` value that removes the destination.
    pub const REMOVE_OPERATION_TYPE: u8 = 1;

    /// Returns true if this adds a destination.
    pub fn is_add_operation(&self) -> bool {
        self.operation_type == Self::ADD_OPERATION_TYPE
    }
}

/// `transaction_type` values.
#[allow(missing_docs)]
impl TransactionInfo {
    pub const BEGIN: u8 = 0;
    pub const PREPARE: u8 = 1;
    pub const COMMIT_ONE_PHASE: u8 = 2;
    pub const COMMIT_TWO_PHASE: u8 = 3;
    pub const ROLLBACK: u8 = 4;
    pub const RECOVER: u8 = 5;
    pub const FORGET: u8 = 6;
    pub const END: u8 = 7;
}

impl RemoveInfo {
    /// Creates a removal of the structure identified by `object_id`.
    pub fn new(object_id: impl Into<Command>) -> Self {
        Self {
            object_id: Some(object_id.into()),
            ..Self::default()
        }
    }
}

impl ConnectionInfo {
    /// Creates a connection request for `connection_id`.
    pub fn new(connection_id: ConnectionId) -> Self {
        Self {
            connection_id: Some(connection_id),
            manageable: true,
            ..Self::default()
        }
    }
}

impl SessionInfo {
    /// Creates a session request for `session_id`.
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id: Some(session_id),
            ..Self::default()
        }
    }
}

impl ConsumerInfo {
    /// Default number of messages dispatched ahead of acknowledgement.
    pub const DEFAULT_PREFETCH_SIZE: i32 = 1000;

    /// Creates a consumer on `destination`.
    pub fn new(consumer_id: ConsumerId, destination: Destination) -> Self {
        Self {
            consumer_id: Some(consumer_id),
            destination: Some(destination),
            prefetch_size: Self::DEFAULT_PREFETCH_SIZE,
            ..Self::default()
        }
    }
}

impl ProducerInfo {
    /// Creates a producer, optionally bound to `destination`.
    pub fn new(producer_id: ProducerId, destination: Option<Destination>) -> Self {
        Self {
            producer_id: Some(producer_id),
            destination,
            ..Self::default()
        }
    }
}
