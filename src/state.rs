//! Application state
//!
//! Spawns the hub, queue and cleanup actors and bundles their handles with
//! the services built on top of them. Cloning is cheap: every field is a
//! channel handle or an `Arc`.

use std::sync::Arc;

use tracing::info;

use crate::auth::TokenValidator;
use crate::chat::MessageService;
use crate::cleanup::{CleanupHandle, CleanupScheduler};
use crate::clock::SystemClock;
use crate::config::Config;
use crate::hub::{Hub, HubHandle};
use crate::pairing::PairingEngine;
use crate::queue::{QueueActor, QueueHandle};
use crate::store::{ConversationStore, MessageStore, UserDirectory};

/// Channel buffer size for actor commands
pub const CHANNEL_BUFFER_SIZE: usize = 256;

#[derive(Clone)]
pub struct AppState {
    pub hub: HubHandle,
    pub queue: QueueHandle,
    pub cleanup: CleanupHandle,
    pub pairing: PairingEngine,
    pub messages: MessageService,
    pub conversations: Arc<dyn ConversationStore>,
    pub validator: Arc<dyn TokenValidator>,
    pub outbound_buffer: usize,
}

impl AppState {
    /// Spawn the actors; must be called inside a tokio runtime
    pub fn new<S>(config: &Config, store: Arc<S>, validator: Arc<dyn TokenValidator>) -> Self
    where
        S: ConversationStore + MessageStore + UserDirectory + 'static,
    {
        let conversations: Arc<dyn ConversationStore> = store.clone();
        let messages: Arc<dyn MessageStore> = store.clone();
        let users: Arc<dyn UserDirectory> = store;

        let hub = Hub::spawn(CHANNEL_BUFFER_SIZE);
        let queue = QueueActor::spawn(CHANNEL_BUFFER_SIZE, Arc::new(SystemClock), config.queue);
        let cleanup =
            CleanupScheduler::spawn(CHANNEL_BUFFER_SIZE, conversations.clone(), config.cleanup_grace);
        info!("Hub, queue and cleanup actors started");

        let pairing = PairingEngine::new(
            queue.clone(),
            conversations.clone(),
            users,
            cleanup.clone(),
        );
        let messages = MessageService::new(conversations.clone(), messages, hub.clone());

        Self {
            hub,
            queue,
            cleanup,
            pairing,
            messages,
            conversations,
            validator,
            outbound_buffer: config.outbound_buffer,
        }
    }
}
