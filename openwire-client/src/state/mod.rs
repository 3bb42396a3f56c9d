//! Connection state tracking for replay after a reconnect.
//!
//! The tracker remembers the commands that created broker-side state
//! (connections, sessions, producers, consumers and temporary destinations)
//! and forgets them again when the matching `RemoveInfo` or a `ShutdownInfo`
//! passes through. [`ConnectionStateTracker::restore_commands`] yields the
//! commands that rebuild that state on a fresh transport.

use openwire_core::commands::{
    ConnectionId, ConnectionInfo, ConsumerId, ConsumerInfo, DestinationInfo, ProducerId,
    ProducerInfo, SessionId, SessionInfo,
};
use openwire_core::Command;

#[derive(Debug, Clone)]
struct ConnectionState {
    info: ConnectionInfo,
    temp_destinations: Vec<DestinationInfo>,
    sessions: Vec<SessionState>,
}

#[derive(Debug, Clone)]
struct SessionState {
    info: SessionInfo,
    producers: Vec<ProducerInfo>,
    consumers: Vec<ConsumerInfo>,
}

/// Records state-establishing commands in the order they were sent.
#[derive(Debug, Default)]
pub struct ConnectionStateTracker {
    connections: Vec<ConnectionState>,
}

impl ConnectionStateTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if no state is tracked.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Forgets all tracked state.
    pub fn clear(&mut self) {
        self.connections.clear();
    }

    /// Number of tracked connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Updates the tracked state with an outbound command.
    ///
    /// Returns true if the command was absorbed into the tracked state, in
    /// which case a reconnect restores it without further bookkeeping.
    pub fn track(&mut self, command: &Command) -> bool {
        match command {
            Command::ConnectionInfo(info) => self.add_connection(info),
            Command::SessionInfo(info) => self.add_session(info),
            Command::ProducerInfo(info) => self.add_producer(info),
            Command::ConsumerInfo(info) => self.add_consumer(info),
            Command::DestinationInfo(info) => self.track_destination(info),
            Command::RemoveInfo(info) => match info.object_id.as_ref() {
                Some(Command::ConnectionId(id)) => self.remove_connection(id),
                Some(Command::SessionId(id)) => self.remove_session(id),
                Some(Command::ProducerId(id)) => self.remove_producer(id),
                Some(Command::ConsumerId(id)) => self.remove_consumer(id),
                _ => false,
            },
            Command::ShutdownInfo(_) => {
                self.clear();
                true
            }
            _ => false,
        }
    }

    /// The commands that recreate the tracked state, connection by
    /// connection: the ConnectionInfo marked as a failover reconnect, its
    /// temporary destinations, then each session followed by its producers
    /// and consumers.
    pub fn restore_commands(&self) -> Vec<Command> {
        let mut commands = Vec::new();
        for connection in &self.connections {
            let mut info = connection.info.clone();
            info.failover_reconnect = true;
            commands.push(info.into());

            commands.extend(connection.temp_destinations.iter().cloned().map(Command::from));

            for session in &connection.sessions {
                commands.push(session.info.clone().into());
                commands.extend(session.producers.iter().cloned().map(Command::from));
                commands.extend(session.consumers.iter().cloned().map(Command::from));
            }
        }
        commands
    }

    fn connection_mut(&mut self, id: &ConnectionId) -> Option<&mut ConnectionState> {
        self.connections
            .iter_mut()
            .find(|c| c.info.connection_id.as_ref() == Some(id))
    }

    fn session_mut(&mut self, id: &SessionId) -> Option<&mut SessionState> {
        self.connection_mut(&id.parent_id())?
            .sessions
            .iter_mut()
            .find(|s| s.info.session_id.as_ref() == Some(id))
    }

    fn add_connection(&mut self, info: &ConnectionInfo) -> bool {
        let Some(id) = info.connection_id.as_ref() else {
            return false;
        };
        match self.connection_mut(id) {
            Some(existing) => existing.info = info.clone(),
            None => self.connections.push(ConnectionState {
                info: info.clone(),
                temp_destinations: Vec::new(),
                sessions: Vec::new(),
            }),
        }
        true
    }

    fn add_session(&mut self, info: &SessionInfo) -> bool {
        let Some(id) = info.session_id.as_ref() else {
            return false;
        };
        let Some(connection) = self.connection_mut(&id.parent_id()) else {
            return false;
        };
        match connection
            .sessions
            .iter_mut()
            .find(|s| s.info.session_id.as_ref() == Some(id))
        {
            Some(existing) => existing.info = info.clone(),
            None => connection.sessions.push(SessionState {
                info: info.clone(),
                producers: Vec::new(),
                consumers: Vec::new(),
            }),
        }
        true
    }

    fn add_producer(&mut self, info: &ProducerInfo) -> bool {
        let Some(id) = info.producer_id.as_ref() else {
            return false;
        };
        let Some(session) = self.session_mut(&id.parent_id()) else {
            return false;
        };
        upsert(&mut session.producers, info, |p| p.producer_id.as_ref() == Some(id));
        true
    }

    fn add_consumer(&mut self, info: &ConsumerInfo) -> bool {
        let Some(id) = info.consumer_id.as_ref() else {
            return false;
        };
        let Some(session) = self.session_mut(&id.parent_id()) else {
            return false;
        };
        upsert(&mut session.consumers, info, |c| c.consumer_id.as_ref() == Some(id));
        true
    }

    fn track_destination(&mut self, info: &DestinationInfo) -> bool {
        let Some(destination) = info.destination.as_ref() else {
            return false;
        };
        if !destination.is_temporary() {
            return false;
        }
        let Some(connection) = info
            .connection_id
            .as_ref()
            .and_then(|id| self.connection_mut(id))
        else {
            return false;
        };

        connection
            .temp_destinations
            .retain(|d| d.destination.as_ref() != Some(destination));
        if info.is_add_operation() {
            connection.temp_destinations.push(info.clone());
        }
        true
    }

    fn remove_connection(&mut self, id: &ConnectionId) -> bool {
        let before = self.connections.len();
        self.connections
            .retain(|c| c.info.connection_id.as_ref() != Some(id));
        before != self.connections.len()
    }

    fn remove_session(&mut self, id: &SessionId) -> bool {
        let Some(connection) = self.connection_mut(&id.parent_id()) else {
            return false;
        };
        let before = connection.sessions.len();
        connection
            .sessions
            .retain(|s| s.info.session_id.as_ref() != Some(id));
        before != connection.sessions.len()
    }

    fn remove_producer(&mut self, id: &ProducerId) -> bool {
        let Some(session) = self.session_mut(&id.parent_id()) else {
            return false;
        };
        let before = session.producers.len();
        session
            .producers
            .retain(|p| p.producer_id.as_ref() != Some(id));
        before != session.producers.len()
    }

    fn remove_consumer(&mut self, id: &ConsumerId) -> bool {
        let Some(session) = self.session_mut(&id.parent_id()) else {
            return false;
        };
        let before = session.consumers.len();
        session
            .consumers
            .retain(|c| c.consumer_id.as_ref() != Some(id));
        before != session.consumers.len()
    }
}

fn upsert<T: Clone>(items: &mut Vec<T>, item: &T, matches: impl Fn(&T) -> bool) {
    match items.iter_mut().find(|existing| matches(existing)) {
        Some(existing) => *existing = item.clone(),
        None => items.push(item.clone()),
    }
}
