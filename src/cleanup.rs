//! Delayed conversation cleanup
//!
//! One actor holds every pending deletion check in a `DelayQueue`, keyed by
//! conversation. Scheduling a conversation that already has a pending check
//! resets that check's deadline instead of adding a second one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio_util::time::delay_queue::{DelayQueue, Key};
use tracing::{debug, info, warn};

use crate::error::{AppError, StoreError};
use crate::store::ConversationStore;
use crate::types::{ConversationId, ConversationKind};

/// Default grace period between a participant leaving and the deletion check
pub const DEFAULT_GRACE: Duration = Duration::from_secs(5 * 60);

#[derive(Debug)]
pub enum CleanupCommand {
    Schedule(ConversationId),
    Pending(oneshot::Sender<usize>),
}

pub struct CleanupScheduler {
    store: Arc<dyn ConversationStore>,
    grace: Duration,
    receiver: mpsc::Receiver<CleanupCommand>,
    delays: DelayQueue<ConversationId>,
    keys: HashMap<ConversationId, Key>,
}

impl CleanupScheduler {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        grace: Duration,
        receiver: mpsc::Receiver<CleanupCommand>,
    ) -> Self {
        Self {
            store,
            grace,
            receiver,
            delays: DelayQueue::new(),
            keys: HashMap::new(),
        }
    }

    /// Create the command channel, spawn the actor, and return its handle
    pub fn spawn(
        buffer: usize,
        store: Arc<dyn ConversationStore>,
        grace: Duration,
    ) -> CleanupHandle {
        let (tx, rx) = mpsc::channel(buffer);
        tokio::spawn(CleanupScheduler::new(store, grace, rx).run());
        CleanupHandle::new(tx)
    }

    pub async fn run(mut self) {
        info!("Cleanup scheduler started (grace {:?})", self.grace);

        loop {
            tokio::select! {
                cmd = self.receiver.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                // Disabled while the queue is empty (`next` yields None)
                Some(expired) = self.delays.next() => {
                    let conversation_id = expired.into_inner();
                    self.keys.remove(&conversation_id);
                    self.check(conversation_id).await;
                }
            }
        }

        if !self.keys.is_empty() {
            warn!(
                "Cleanup scheduler stopped with {} pending checks",
                self.keys.len()
            );
        }
    }

    fn handle_command(&mut self, cmd: CleanupCommand) {
        match cmd {
            CleanupCommand::Schedule(conversation_id) => {
                if let Some(key) = self.keys.get(&conversation_id) {
                    self.delays.reset(key, self.grace);
                    debug!("Deletion check for {} pushed back", conversation_id);
                } else {
                    let key = self.delays.insert(conversation_id, self.grace);
                    self.keys.insert(conversation_id, key);
                    debug!("Deletion check for {} scheduled", conversation_id);
                }
            }
            CleanupCommand::Pending(reply) => {
                let _ = reply.send(self.keys.len());
            }
        }
    }

    /// Delete the conversation if it is still ephemeral and nobody is active
    async fn check(&self, conversation_id: ConversationId) {
        if let Err(e) = self.try_delete(conversation_id).await {
            warn!("Deletion check for {} failed: {}", conversation_id, e);
        }
    }

    async fn try_delete(&self, conversation_id: ConversationId) -> Result<(), StoreError> {
        let conversation = match self.store.conversation(conversation_id).await {
            Ok(conversation) => conversation,
            Err(StoreError::NotFound(_)) => {
                debug!("Conversation {} already gone", conversation_id);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if conversation.kind != ConversationKind::Ephemeral {
            debug!("Conversation {} was saved, keeping it", conversation_id);
            return Ok(());
        }

        let active = self.store.count_active_participants(conversation_id).await?;
        if active > 0 {
            debug!(
                "Conversation {} still has {} active participants",
                conversation_id, active
            );
            return Ok(());
        }

        self.store.delete_conversation(conversation_id).await?;
        info!("Deleted inactive conversation {}", conversation_id);
        Ok(())
    }
}

/// Cloneable handle to the cleanup scheduler
#[derive(Debug, Clone)]
pub struct CleanupHandle {
    sender: mpsc::Sender<CleanupCommand>,
}

impl CleanupHandle {
    pub fn new(sender: mpsc::Sender<CleanupCommand>) -> Self {
        Self { sender }
    }

    pub async fn schedule(&self, conversation_id: ConversationId) -> Result<(), AppError> {
        self.sender
            .send(CleanupCommand::Schedule(conversation_id))
            .await
            .map_err(|_| AppError::ChannelSend)
    }

    /// Number of conversations with a pending check
    pub async fn pending(&self) -> Result<usize, AppError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(CleanupCommand::Pending(tx))
            .await
            .map_err(|_| AppError::ChannelSend)?;
        rx.await.map_err(|_| AppError::ChannelSend)
    }
}
