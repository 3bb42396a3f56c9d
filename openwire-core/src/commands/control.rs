//! Flow control, dispatch, acknowledgement and connection management commands.

use crate::protocol::constants;
use crate::protocol::marshal::openwire_struct;

use super::{BrokerId, ConnectionId, ConsumerId, Destination, Message, MessageId, ProducerId, TransactionId};

openwire_struct! {
    /// A free-form control string.
    pub struct ControlCommand : constants::CONTROL_COMMAND {
        command_id: int,
        response_required: bool,
        command: string,
    }
}

openwire_struct! {
    /// Asks the peer to flush pending work.
    pub struct FlushCommand : constants::FLUSH_COMMAND {
        command_id: int,
        response_required: bool,
    }
}

openwire_struct! {
    /// An asynchronous, connection-level failure reported by the broker.
    pub struct ConnectionError : constants::CONNECTION_ERROR {
        command_id: int,
        response_required: bool,
        exception: throwable,
        connection_id: nested<ConnectionId>,
    }
}

openwire_struct! {
    /// Adjusts or stops a consumer.
    pub struct ConsumerControl : constants::CONSUMER_CONTROL {
        command_id: int,
        response_required: bool,
        destination: nested<Destination> if version >= 6,
        close: bool,
        consumer_id: nested<ConsumerId>,
        prefetch: int,
        flush: bool if version >= 2,
        start: bool if version >= 2,
        stop: bool if version >= 2,
    }
}

openwire_struct! {
    /// Broker instructions about the connection itself, including cluster
    /// membership updates and rebalancing.
    pub struct ConnectionControl : constants::CONNECTION_CONTROL {
        command_id: int,
        response_required: bool,
        close: bool,
        exit: bool,
        fault_tolerant: bool,
        resume: bool,
        suspend: bool,
        connected_brokers: string if version >= 6,
        reconnect_to: string if version >= 6,
        rebalance_connection: bool if version >= 6,
        token: bytes if version >= 8,
    }
}

openwire_struct! {
    /// Grants a producer more send window.
    pub struct ProducerAck : constants::PRODUCER_ACK {
        command_id: int,
        response_required: bool,
        producer_id: nested<ProducerId>,
        size: int,
    }
}

openwire_struct! {
    /// Asks the broker to dispatch a message to a zero-prefetch consumer.
    pub struct MessagePull : constants::MESSAGE_PULL {
        command_id: int,
        response_required: bool,
        consumer_id: cached<ConsumerId>,
        destination: cached<Destination>,
        timeout: long,
        correlation_id: string if version >= 3,
        message_id: nested<MessageId> if version >= 3,
    }
}

openwire_struct! {
    /// Delivers a message to a consumer. A dispatch without a message marks
    /// the end of a browse or an expired pull.
    pub struct MessageDispatch : constants::MESSAGE_DISPATCH {
        command_id: int,
        response_required: bool,
        consumer_id: cached<ConsumerId>,
        destination: cached<Destination>,
        message: nested<Message>,
        redelivery_counter: int,
    }
}

openwire_struct! {
    /// Acknowledges a range of dispatched messages.
    pub struct MessageAck : constants::MESSAGE_ACK {
        command_id: int,
        response_required: bool,
        destination: cached<Destination>,
        transaction_id: cached<TransactionId>,
        consumer_id: cached<ConsumerId>,
        ack_type: byte,
        first_message_id: nested<MessageId>,
        last_message_id: nested<MessageId>,
        message_count: int,
        poison_cause: throwable if version >= 7,
    }
}

openwire_struct! {
    /// Tells a slave broker which message was dispatched.
    pub struct MessageDispatchNotification : constants::MESSAGE_DISPATCH_NOTIFICATION {
        command_id: int,
        response_required: bool,
        consumer_id: cached<ConsumerId>,
        destination: cached<Destination>,
        delivery_sequence_id: long,
        message_id: nested<MessageId>,
    }
}

openwire_struct! {
    /// Requests redelivery of a range of commands on unreliable transports.
    pub struct ReplayCommand : constants::REPLAY {
        command_id: int,
        response_required: bool,
        first_nak_number: int,
        last_nak_number: int,
    }
}

openwire_struct! {
    /// A fragment of a command split across datagrams.
    pub struct PartialCommand : constants::PARTIAL_COMMAND {
        command_id: int,
        data: bytes,
    }
}

openwire_struct! {
    /// The final fragment of a split command.
    pub struct LastPartialCommand : constants::PARTIAL_LAST_COMMAND {
        command_id: int,
        data: bytes,
    }
}

openwire_struct! {
    /// A broker appearing or disappearing from discovery.
    pub struct DiscoveryEvent : constants::DISCOVERY_EVENT {
        service_name: string,
        broker_name: string,
    }
}

openwire_struct! {
    /// Filter applied by a network bridge to avoid message loops.
    pub struct NetworkBridgeFilter : constants::NETWORK_BRIDGE_FILTER {
        network_ttl: int,
        network_broker_id: cached<BrokerId>,
    }
}

/// `ack_type` values.
#[allow(missing_docs)]
impl MessageAck {
    pub const DELIVERED_ACK_TYPE: u8 = 0;
    pub const POISON_ACK_TYPE: u8 = 1;
    pub const STANDARD_ACK_TYPE: u8 = 2;
    pub const REDELIVERED_ACK_TYPE: u8 = 3;
    pub const INDIVIDUAL_ACK_TYPE: u8 = 4;
    pub const UNMATCHED_ACK_TYPE: u8 = 5;
}

impl ConnectionControl {
    /// Splits `connected_brokers` into individual broker URIs.
    pub fn connected_broker_uris(&self) -> Vec<String> {
        self.connected_brokers
            .as_deref()
            .unwrap_or("")
            .split(',')
            .map(str::trim)
            .filter(|uri| !uri.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Creates the command that marks a connection as fault tolerant.
    pub fn fault_tolerant() -> Self {
        Self {
            fault_tolerant: true,
            ..Self::default()
        }
    }
}

impl MessageDispatch {
    /// A dispatch with no message for `consumer_id`.
    pub fn empty(consumer_id: Option<ConsumerId>, destination: Option<Destination>) -> Self {
        Self {
            consumer_id,
            destination,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connected_broker_uris() {
        let mut control = ConnectionControl::default();
        assert!(control.connected_broker_uris().is_empty());
        control.connected_brokers = Some("tcp://a:61616, tcp://b:61616,".to_string());
        assert_eq!(
            control.connected_broker_uris(),
            vec!["tcp://a:61616".to_string(), "tcp://b:61616".to_string()]
        );
    }

    #[test]
    fn test_empty_dispatch() {
        let dispatch = MessageDispatch::empty(Some(ConsumerId::new("ID:c", 1, 1)), None);
        assert!(dispatch.message.is_none());
        assert!(dispatch.consumer_id.is_some());
    }
}
