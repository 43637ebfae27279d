//! Roulette Chat Library
//!
//! A real-time chat core built with tokio-tungstenite: conversation-scoped
//! WebSocket broadcast plus random pairing of waiting users into ephemeral
//! conversations.
//!
//! # Features
//! - Token-authenticated WebSocket connections bound to one conversation
//! - Fan-out of message events to every connection of a conversation
//! - Matchmaking queue with staleness eviction
//! - Random pairing that never re-pairs users sharing a saved conversation
//! - Saving a random conversation, skipping it, delayed cleanup
//! - Message actions: send, edit, delete, like, unlike, read receipts
//!
//! # Architecture
//! Uses the Actor pattern with `mpsc` channels:
//! - `Hub` owns the connection registry and fans events out
//! - `QueueActor` owns the matchmaking queue and runs the staleness sweep
//! - `CleanupScheduler` owns all pending deletion checks
//! - Each connection has a `handler` reader/writer task pair
//! - Stores and token validation sit behind traits
//!
//! # Example
//! ```ignore
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//! use roulette_chat::{serve, AppState, Config, InMemoryStore, JwtValidator};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::try_parse_from(["roulette_chat", "127.0.0.1:8080"]).unwrap();
//!     let validator = Arc::new(JwtValidator::new(config.jwt_secret.as_bytes()));
//!     let state = AppState::new(&config, Arc::new(InMemoryStore::new()), validator);
//!
//!     let listener = TcpListener::bind(&config.addr).await.unwrap();
//!     serve(listener, state).await;
//! }
//! ```

pub mod auth;
pub mod chat;
pub mod cleanup;
pub mod clock;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod handler;
pub mod hub;
pub mod pairing;
pub mod queue;
pub mod registry;
pub mod state;
pub mod store;
pub mod types;

// Re-export main types for convenience
pub use auth::{JwtValidator, TokenValidator};
pub use chat::{ChatMessage, MessageService, NewMessage};
pub use cleanup::{CleanupHandle, CleanupScheduler};
pub use config::Config;
pub use error::{AppError, SendError, StoreError};
pub use event::{BroadcastEvent, ErrorBody, ErrorCode, EventType};
pub use handler::{handle_connection, serve};
pub use hub::{Hub, HubHandle};
pub use pairing::{PairingEngine, PairingResult};
pub use queue::{MatchQueue, QueueActor, QueueHandle};
pub use state::AppState;
pub use store::{ConversationStore, InMemoryStore, MessageStore, UserDirectory};
pub use types::{ConnectionId, ConversationId, ConversationKind, MessageId, UserId};
