//! Broadcast Hub actor implementation
//!
//! The single dispatch worker that owns the connection registry. Connection
//! handlers and application actions talk to it only through `HubCommand`s, so
//! the registry needs no locking.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::connection::{Connection, Frame};
use crate::error::{AppError, SendError};
use crate::event::BroadcastEvent;
use crate::registry::ConnectionRegistry;
use crate::types::ConnectionId;

/// Commands sent to the Hub actor
#[derive(Debug)]
pub enum HubCommand {
    /// Connection upgraded and validated
    Register(Connection),
    /// Connection's reader or writer ended
    Unregister(ConnectionId),
    /// Fan an event out to its conversation
    Broadcast(BroadcastEvent),
    /// Introspection: number of live connections
    ConnectionCount(oneshot::Sender<usize>),
}

/// The Hub actor
///
/// Processes one command at a time, which serializes event order within a
/// conversation.
pub struct Hub {
    registry: ConnectionRegistry,
    receiver: mpsc::Receiver<HubCommand>,
}

impl Hub {
    /// Create a new Hub with the given command receiver
    pub fn new(receiver: mpsc::Receiver<HubCommand>) -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            receiver,
        }
    }

    /// Create the command channel, spawn the actor, and return its handle
    pub fn spawn(buffer: usize) -> HubHandle {
        let (tx, rx) = mpsc::channel(buffer);
        tokio::spawn(Hub::new(rx).run());
        HubHandle::new(tx)
    }

    /// Run the Hub event loop
    ///
    /// Continuously receives and processes commands until all handles are dropped.
    pub async fn run(mut self) {
        info!("Hub started");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        info!(
            "Hub shutting down with {} connections",
            self.registry.len()
        );
    }

    fn handle_command(&mut self, cmd: HubCommand) {
        match cmd {
            HubCommand::Register(connection) => self.handle_register(connection),
            HubCommand::Unregister(id) => self.handle_unregister(id),
            HubCommand::Broadcast(event) => self.handle_broadcast(event),
            HubCommand::ConnectionCount(reply) => {
                let _ = reply.send(self.registry.len());
            }
        }
    }

    fn handle_register(&mut self, connection: Connection) {
        let id = connection.id();
        let user_id = connection.user_id();
        let conversation_id = connection.conversation_id();

        if !self.registry.insert(connection) {
            warn!("Connection {} registered twice, ignoring", id);
            return;
        }

        info!(
            "User {} connected to conversation {} ({})",
            user_id, conversation_id, id
        );
        debug!(
            "Total connections: {}, active conversations: {}",
            self.registry.len(),
            self.registry.conversation_count()
        );
    }

    /// Removing drops the outbound sender, which closes the writer's channel.
    /// Unknown ids are ignored, so late or repeated unregisters are harmless.
    fn handle_unregister(&mut self, id: ConnectionId) {
        if let Some(connection) = self.registry.remove(id) {
            info!(
                "User {} disconnected from conversation {} ({})",
                connection.user_id(),
                connection.conversation_id(),
                id
            );
        }
    }

    fn handle_broadcast(&mut self, event: BroadcastEvent) {
        let frame: Frame = match event.to_frame() {
            Ok(json) => Arc::from(json),
            Err(e) => {
                error!("Failed to encode {:?} event: {}", event.event_type, e);
                return;
            }
        };

        let mut evicted = Vec::new();
        let mut delivered = 0usize;

        for connection in self.registry.bound_to(event.conversation_id) {
            match connection.try_deliver(Arc::clone(&frame)) {
                Ok(()) => delivered += 1,
                Err(SendError::BufferFull) => {
                    warn!(
                        "Outbound buffer full for user {} ({}), dropping connection",
                        connection.user_id(),
                        connection.id()
                    );
                    evicted.push(connection.id());
                }
                Err(SendError::ChannelClosed) => {
                    debug!("Writer gone for {}, dropping connection", connection.id());
                    evicted.push(connection.id());
                }
            }
        }

        for id in evicted {
            self.registry.remove(id);
        }

        debug!(
            "{:?} for conversation {} delivered to {} connections",
            event.event_type, event.conversation_id, delivered
        );
    }
}

/// Cloneable handle to the Hub actor
#[derive(Debug, Clone)]
pub struct HubHandle {
    sender: mpsc::Sender<HubCommand>,
}

impl HubHandle {
    pub fn new(sender: mpsc::Sender<HubCommand>) -> Self {
        Self { sender }
    }

    pub async fn register(&self, connection: Connection) -> Result<(), AppError> {
        self.send(HubCommand::Register(connection)).await
    }

    pub async fn unregister(&self, id: ConnectionId) -> Result<(), AppError> {
        self.send(HubCommand::Unregister(id)).await
    }

    /// Submit an event for fan-out
    ///
    /// Delivery failures to individual connections are never reported here.
    pub async fn broadcast(&self, event: BroadcastEvent) -> Result<(), AppError> {
        self.send(HubCommand::Broadcast(event)).await
    }

    pub async fn connection_count(&self) -> Result<usize, AppError> {
        let (tx, rx) = oneshot::channel();
        self.send(HubCommand::ConnectionCount(tx)).await?;
        rx.await.map_err(|_| AppError::ChannelSend)
    }

    async fn send(&self, cmd: HubCommand) -> Result<(), AppError> {
        self.sender.send(cmd).await.map_err(|_| AppError::ChannelSend)
    }
}
