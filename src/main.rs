//! Roulette Chat Server - Entry Point
//!
//! Starts the TCP listener and the hub, queue and cleanup actors, accepting
//! connections.

use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use roulette_chat::config::Args;
use roulette_chat::{serve, AppState, Config, InMemoryStore, JwtValidator};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=roulette_chat=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("roulette_chat=info")),
        )
        .init();

    // Flags override their environment variables
    let config = Config::from(Args::parse());

    let store = Arc::new(InMemoryStore::new());
    let validator = Arc::new(JwtValidator::new(config.jwt_secret.as_bytes()));
    let state = AppState::new(&config, store, validator);

    let listener = TcpListener::bind(&config.addr).await?;
    info!("Roulette chat server listening on {}", config.addr);

    serve(listener, state).await;

    Ok(())
}
