//! Broker journal records. A client only ever relays these.

use crate::protocol::constants;
use crate::protocol::marshal::openwire_struct;

use super::{Destination, MessageAck, MessageId, TransactionId};

openwire_struct! {
    pub struct JournalTopicAck : constants::JOURNAL_ACK {
        destination: nested<Destination>,
        message_id: nested<MessageId>,
        message_sequence_id: long,
        subscription_name: string,
        client_id: string,
        transaction_id: nested<TransactionId>,
    }
}

openwire_struct! {
    pub struct JournalQueueAck : constants::JOURNAL_REMOVE {
        destination: nested<Destination>,
        message_ack: nested<MessageAck>,
    }
}

openwire_struct! {
    pub struct JournalTrace : constants::JOURNAL_TRACE {
        message: string,
    }
}

openwire_struct! {
    pub struct JournalTransaction : constants::JOURNAL_TRANSACTION {
        transaction_id: nested<TransactionId>,
        transaction_type: byte,
        was_prepared: bool,
    }
}
