//! Queue and topic destinations.

use std::fmt;

use crate::error::{OpenWireError, Result};
use crate::protocol::constants;
use crate::protocol::marshal::{openwire_struct, DataStructure};
use crate::protocol::OpenWireFormat;

/// The four destination types, each with its own wire code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DestinationKind {
    /// A point-to-point queue.
    #[default]
    Queue,
    /// A publish/subscribe topic.
    Topic,
    /// A queue that lives as long as the connection that created it.
    TempQueue,
    /// A topic that lives as long as the connection that created it.
    TempTopic,
}

impl DestinationKind {
    /// The wire type code of this kind.
    pub fn type_code(self) -> u8 {
        match self {
            DestinationKind::Queue => constants::QUEUE,
            DestinationKind::Topic => constants::TOPIC,
            DestinationKind::TempQueue => constants::TEMP_QUEUE,
            DestinationKind::TempTopic => constants::TEMP_TOPIC,
        }
    }

    /// Maps a wire type code back to a kind.
    pub fn from_type_code(code: u8) -> Option<Self> {
        match code {
            constants::QUEUE => Some(DestinationKind::Queue),
            constants::TOPIC => Some(DestinationKind::Topic),
            constants::TEMP_QUEUE => Some(DestinationKind::TempQueue),
            constants::TEMP_TOPIC => Some(DestinationKind::TempTopic),
            _ => None,
        }
    }

    fn prefix(self) -> &'static str {
        match self {
            DestinationKind::Queue => "queue://",
            DestinationKind::Topic => "topic://",
            DestinationKind::TempQueue => "temp-queue://",
            DestinationKind::TempTopic => "temp-topic://",
        }
    }
}

openwire_struct! {
    /// A named queue or topic. The kind selects the type code.
    pub struct Destination {
        kind: local<DestinationKind>,
        physical_name: string,
    }
}

impl Destination {
    /// Creates a destination.
    pub fn new(kind: DestinationKind, physical_name: impl Into<String>) -> Self {
        Self {
            kind,
            physical_name: Some(physical_name.into()),
        }
    }

    /// Creates a queue.
    pub fn queue(name: impl Into<String>) -> Self {
        Self::new(DestinationKind::Queue, name)
    }

    /// Creates a topic.
    pub fn topic(name: impl Into<String>) -> Self {
        Self::new(DestinationKind::Topic, name)
    }

    /// Returns the physical name, or an empty string when unset.
    pub fn name(&self) -> &str {
        self.physical_name.as_deref().unwrap_or("")
    }

    /// Returns true for temporary queues and topics.
    pub fn is_temporary(&self) -> bool {
        matches!(
            self.kind,
            DestinationKind::TempQueue | DestinationKind::TempTopic
        )
    }

    /// Returns true for topics, temporary or not.
    pub fn is_topic(&self) -> bool {
        matches!(self.kind, DestinationKind::Topic | DestinationKind::TempTopic)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.kind.prefix(), self.name())
    }
}

impl DataStructure for Destination {
    fn data_structure_type(&self) -> u8 {
        self.kind.type_code()
    }

    fn create(_: &OpenWireFormat, data_type: u8) -> Result<Self> {
        let kind = DestinationKind::from_type_code(data_type).ok_or_else(|| {
            OpenWireError::Protocol(format!("expected a destination but found type {}", data_type))
        })?;
        Ok(Self {
            kind,
            ..Self::default()
        })
    }
}
