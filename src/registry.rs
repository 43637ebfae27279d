//! Connection registry
//!
//! Leaf data structure owned by the hub actor. Keeps every live connection
//! plus an index from conversation to the connections bound to it, so fan-out
//! touches only the recipients.

use std::collections::{HashMap, HashSet};

use crate::connection::Connection;
use crate::types::{ConnectionId, ConversationId};

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    /// All live connections: ConnectionId -> Connection
    connections: HashMap<ConnectionId, Connection>,
    /// Conversation to bound connections mapping: ConversationId -> {ConnectionId}
    by_conversation: HashMap<ConversationId, HashSet<ConnectionId>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection
    ///
    /// Returns false (and drops nothing) if the id is already registered.
    pub fn insert(&mut self, connection: Connection) -> bool {
        let id = connection.id();
        if self.connections.contains_key(&id) {
            return false;
        }
        self.by_conversation
            .entry(connection.conversation_id())
            .or_default()
            .insert(id);
        self.connections.insert(id, connection);
        true
    }

    /// Remove a connection, returning it so the caller controls when it drops
    pub fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        let connection = self.connections.remove(&id)?;
        let conversation_id = connection.conversation_id();
        if let Some(ids) = self.by_conversation.get_mut(&conversation_id) {
            ids.remove(&id);
            if ids.is_empty() {
                self.by_conversation.remove(&conversation_id);
            }
        }
        Some(connection)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    /// Connections currently bound to a conversation
    pub fn bound_to(&self, conversation_id: ConversationId) -> impl Iterator<Item = &Connection> {
        self.by_conversation
            .get(&conversation_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.connections.get(id))
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Number of conversations with at least one live connection
    pub fn conversation_count(&self) -> usize {
        self.by_conversation.len()
    }
}
