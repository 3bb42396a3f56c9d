//! Messages and their bodies.
//!
//! The six JMS message types share one [`Message`] structure; a local
//! [`MessageKind`] selects the wire type code and how `content` is read.
//! Text bodies are an `i32` byte length followed by UTF-8, map bodies and
//! properties are marshalled primitive maps.

use crate::error::{OpenWireError, Result};
use crate::protocol::constants;
use crate::protocol::marshal::{openwire_struct, DataStructure};
use crate::protocol::OpenWireFormat;
use crate::serialization::{map_from_bytes, map_to_bytes, ByteInput, DataInput, PrimitiveMap};

use super::{BrokerId, Command, ConsumerId, Destination, MessageId, ProducerId, TransactionId};

/// The JMS message type, which selects the wire type code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// A message without a typed body.
    #[default]
    Message,
    /// Opaque bytes.
    Bytes,
    /// A primitive map.
    Map,
    /// A serialized Java object.
    Object,
    /// A sequence of primitives.
    Stream,
    /// A string.
    Text,
}

impl MessageKind {
    /// The wire type code of this kind.
    pub fn type_code(self) -> u8 {
        match self {
            MessageKind::Message => constants::MESSAGE,
            MessageKind::Bytes => constants::BYTES_MESSAGE,
            MessageKind::Map => constants::MAP_MESSAGE,
            MessageKind::Object => constants::OBJECT_MESSAGE,
            MessageKind::Stream => constants::STREAM_MESSAGE,
            MessageKind::Text => constants::TEXT_MESSAGE,
        }
    }

    /// Maps a wire type code back to a kind.
    pub fn from_type_code(code: u8) -> Option<Self> {
        match code {
            constants::MESSAGE => Some(MessageKind::Message),
            constants::BYTES_MESSAGE => Some(MessageKind::Bytes),
            constants::MAP_MESSAGE => Some(MessageKind::Map),
            constants::OBJECT_MESSAGE => Some(MessageKind::Object),
            constants::STREAM_MESSAGE => Some(MessageKind::Stream),
            constants::TEXT_MESSAGE => Some(MessageKind::Text),
            _ => None,
        }
    }
}

openwire_struct! {
    /// A message sent to or dispatched from a destination.
    pub struct Message {
        kind: local<MessageKind>,
        command_id: int,
        response_required: bool,
        producer_id: cached<ProducerId>,
        destination: cached<Destination>,
        transaction_id: cached<TransactionId>,
        original_destination: cached<Destination>,
        message_id: nested<MessageId>,
        original_transaction_id: cached<TransactionId>,
        group_id: string,
        group_sequence: int,
        correlation_id: string,
        persistent: bool,
        expiration: long,
        priority: byte,
        reply_to: nested<Destination>,
        timestamp: long,
        message_type: string,
        content: bytes,
        marshalled_properties: bytes,
        data_structure: nested<Command>,
        target_consumer_id: cached<ConsumerId>,
        compressed: bool,
        redelivery_counter: int,
        broker_path: array<BrokerId>,
        arrival: long,
        user_id: string,
        received_by_df_bridge: bool,
        droppable: bool if version >= 2,
        cluster: array<BrokerId> if version >= 3,
        broker_in_time: long if version >= 3,
        broker_out_time: long if version >= 3,
    }
}

fn compressed_body() -> OpenWireError {
    OpenWireError::Serialization("compressed message bodies are not supported".to_string())
}

impl Message {
    /// Creates an empty message of the given kind.
    pub fn with_kind(kind: MessageKind) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }

    /// Creates a text message with `text` as its body.
    pub fn text(text: &str) -> Self {
        let mut message = Self::with_kind(MessageKind::Text);
        message.set_text(Some(text));
        message
    }

    /// Replaces the body with `text`, or clears it.
    pub fn set_text(&mut self, text: Option<&str>) {
        self.content = text.map(|text| {
            let mut content = Vec::with_capacity(4 + text.len());
            content.extend_from_slice(&(text.len() as i32).to_be_bytes());
            content.extend_from_slice(text.as_bytes());
            content
        });
    }

    /// Reads the body as text.
    pub fn text_body(&self) -> Result<Option<String>> {
        if self.compressed {
            return Err(compressed_body());
        }
        let Some(content) = self.content.as_deref() else {
            return Ok(None);
        };
        let mut input = ByteInput::new(content);
        let len = input.read_int()?;
        if len < 0 {
            return Ok(None);
        }
        let bytes = input.read_bytes(len as usize)?;
        String::from_utf8(bytes)
            .map(Some)
            .map_err(|e| OpenWireError::Serialization(format!("invalid UTF-8 text body: {}", e)))
    }

    /// Replaces the body with a marshalled map.
    pub fn set_map_body(&mut self, map: &PrimitiveMap) -> Result<()> {
        self.content = Some(map_to_bytes(map)?);
        Ok(())
    }

    /// Reads the body as a map. An absent body is an empty map.
    pub fn map_body(&self) -> Result<PrimitiveMap> {
        if self.compressed {
            return Err(compressed_body());
        }
        match self.content.as_deref() {
            Some(content) => map_from_bytes(content),
            None => Ok(PrimitiveMap::new()),
        }
    }

    /// Decodes the message properties.
    pub fn properties(&self) -> Result<PrimitiveMap> {
        match self.marshalled_properties.as_deref() {
            Some(bytes) => map_from_bytes(bytes),
            None => Ok(PrimitiveMap::new()),
        }
    }

    /// Replaces the message properties. An empty map clears them.
    pub fn set_properties(&mut self, properties: &PrimitiveMap) -> Result<()> {
        self.marshalled_properties = if properties.is_empty() {
            None
        } else {
            Some(map_to_bytes(properties)?)
        };
        Ok(())
    }

    /// Returns true once the message has expired relative to `now_millis`.
    pub fn is_expired(&self, now_millis: i64) -> bool {
        self.expiration > 0 && self.expiration < now_millis
    }
}

impl DataStructure for Message {
    fn data_structure_type(&self) -> u8 {
        self.kind.type_code()
    }

    fn is_marshall_aware(&self) -> bool {
        true
    }

    fn create(_: &OpenWireFormat, data_type: u8) -> Result<Self> {
        let kind = MessageKind::from_type_code(data_type).ok_or_else(|| {
            OpenWireError::Protocol(format!("expected a message but found type {}", data_type))
        })?;
        Ok(Self::with_kind(kind))
    }
}

openwire_struct! {
    /// A message whose body is stored out of band and fetched by URL.
    pub struct BlobMessage {
        message: inline<Message>,
        remote_blob_url: string,
        mime_type: string,
        deleted_by_broker: bool,
    }
}

impl BlobMessage {
    /// Wire type code of this structure.
    pub const DATA_STRUCTURE_TYPE: u8 = constants::BLOB_MESSAGE;
}

impl DataStructure for BlobMessage {
    fn data_structure_type(&self) -> u8 {
        constants::BLOB_MESSAGE
    }

    fn is_marshall_aware(&self) -> bool {
        true
    }

    fn create(_: &OpenWireFormat, data_type: u8) -> Result<Self> {
        if data_type == constants::BLOB_MESSAGE {
            Ok(Self::default())
        } else {
            Err(OpenWireError::Protocol(format!(
                "expected BlobMessage (type {}) but found type {}",
                constants::BLOB_MESSAGE,
                data_type
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialization::PrimitiveValue;

    #[test]
    fn test_text_body() {
        let message = Message::text("hello");
        assert_eq!(message.data_structure_type(), constants::TEXT_MESSAGE);
        assert_eq!(
            message.content.as_deref(),
            Some(&[0, 0, 0, 5, b'h', b'e', b'l', b'l', b'o'][..])
        );
        assert_eq!(message.text_body().unwrap().as_deref(), Some("hello"));
    }

    #[test]
    fn test_text_body_multibyte() {
        let message = Message::text("grüße");
        assert_eq!(message.text_body().unwrap().as_deref(), Some("grüße"));
    }

    #[test]
    fn test_empty_text_body() {
        let mut message = Message::with_kind(MessageKind::Text);
        assert_eq!(message.text_body().unwrap(), None);
        message.set_text(None);
        assert!(message.content.is_none());
    }

    #[test]
    fn test_truncated_text_body() {
        let mut message = Message::with_kind(MessageKind::Text);
        message.content = Some(vec![0, 0, 0, 9, b'x']);
        assert!(message.text_body().is_err());
    }

    #[test]
    fn test_map_body() {
        let mut map = PrimitiveMap::new();
        map.insert("count", 3);
        map.insert("name", "widget");
        let mut message = Message::with_kind(MessageKind::Map);
        message.set_map_body(&map).unwrap();

        let decoded = message.map_body().unwrap();
        assert_eq!(decoded.get_int("count"), Some(3));
        assert_eq!(decoded.get_str("name"), Some("widget"));
    }

    #[test]
    fn test_properties() {
        let mut message = Message::default();
        assert!(message.properties().unwrap().is_empty());

        let mut props = PrimitiveMap::new();
        props.insert("JMSXGroupSeq", 1);
        props.insert("flag", true);
        message.set_properties(&props).unwrap();
        let decoded = message.properties().unwrap();
        assert_eq!(decoded.get("flag"), Some(&PrimitiveValue::Boolean(true)));

        message.set_properties(&PrimitiveMap::new()).unwrap();
        assert!(message.marshalled_properties.is_none());
    }

    #[test]
    fn test_compressed_body_rejected() {
        let mut message = Message::text("zip");
        message.compressed = true;
        assert!(message.text_body().is_err());
    }

    #[test]
    fn test_create_message_kinds() {
        let wf = OpenWireFormat::default();
        for code in constants::MESSAGE..=constants::TEXT_MESSAGE {
            let message = Message::create(&wf, code).unwrap();
            assert_eq!(message.data_structure_type(), code);
        }
        assert!(Message::create(&wf, constants::BLOB_MESSAGE).is_err());
    }

    #[test]
    fn test_expiration() {
        let mut message = Message::default();
        assert!(!message.is_expired(1_000));
        message.expiration = 500;
        assert!(message.is_expired(1_000));
        assert!(!message.is_expired(100));
    }
}
