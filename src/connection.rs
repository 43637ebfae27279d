//! Connection struct definition
//!
//! Represents one accepted WebSocket bound to a user and a conversation.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::error::SendError;
use crate::types::{ConnectionId, ConversationId, UserId};

/// Encoded frame shared between all recipients of one broadcast
pub type Frame = Arc<str>;

/// Live connection owned by the hub
///
/// The bound conversation is fixed at creation; there is no way to rebind it.
/// Dropping the connection drops the outbound sender, which ends the writer task.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    user_id: UserId,
    conversation_id: ConversationId,
    sender: mpsc::Sender<Frame>,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        user_id: UserId,
        conversation_id: ConversationId,
        sender: mpsc::Sender<Frame>,
    ) -> Self {
        Self {
            id,
            user_id,
            conversation_id,
            sender,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    /// Queue a frame without waiting
    ///
    /// A full buffer is reported like a dead peer; the hub evicts in both cases.
    pub fn try_deliver(&self, frame: Frame) -> Result<(), SendError> {
        self.sender.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => SendError::BufferFull,
            TrySendError::Closed(_) => SendError::ChannelClosed,
        })
    }
}
