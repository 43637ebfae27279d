//! Runtime configuration from command line flags and the environment

use std::ffi::OsString;
use std::time::Duration;

use clap::Parser;
use tracing::warn;

use crate::cleanup::DEFAULT_GRACE;
use crate::error::AppError;
use crate::queue::{QueueConfig, DEFAULT_MAX_AGE, DEFAULT_SWEEP_INTERVAL};

/// Default server address
pub const DEFAULT_ADDR: &str = "127.0.0.1:8080";

/// Per-connection outbound buffer; a full buffer gets the connection evicted
pub const DEFAULT_OUTBOUND_BUFFER: usize = 256;

/// Upper bound for `--outbound-buffer`, well below tokio's channel limit
pub const MAX_OUTBOUND_BUFFER: u64 = 65_536;

const DEV_SECRET: &str = "roulette-chat-dev-secret";

/// Command line flags; every flag also reads an environment variable
#[derive(Parser, Debug, Clone)]
#[command(name = "roulette_chat")]
#[command(about = "Real-time chat server with random pairing", long_about = None)]
pub struct Args {
    /// Address to bind the server to
    #[arg(env = "CHAT_ADDR", default_value = DEFAULT_ADDR)]
    pub addr: String,

    /// HS256 secret used to validate connection tokens
    #[arg(long, env = "JWT_SECRET", hide_env_values = true)]
    pub jwt_secret: Option<String>,

    /// Seconds of inactivity before a queue entry is stale
    #[arg(
        long,
        env = "QUEUE_MAX_AGE_SECS",
        default_value_t = DEFAULT_MAX_AGE.as_secs(),
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub queue_max_age_secs: u64,

    /// Seconds between stale-entry sweeps
    #[arg(
        long,
        env = "QUEUE_SWEEP_SECS",
        default_value_t = DEFAULT_SWEEP_INTERVAL.as_secs(),
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub queue_sweep_secs: u64,

    /// Grace period before an idle ephemeral conversation is deleted
    #[arg(
        long,
        env = "CLEANUP_GRACE_SECS",
        default_value_t = DEFAULT_GRACE.as_secs(),
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub cleanup_grace_secs: u64,

    /// Frames buffered per connection before it is evicted
    #[arg(
        long,
        env = "OUTBOUND_BUFFER",
        default_value_t = DEFAULT_OUTBOUND_BUFFER as u64,
        value_parser = clap::value_parser!(u64).range(1..=MAX_OUTBOUND_BUFFER)
    )]
    pub outbound_buffer: u64,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub addr: String,
    pub jwt_secret: String,
    pub queue: QueueConfig,
    pub cleanup_grace: Duration,
    pub outbound_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            jwt_secret: DEV_SECRET.to_string(),
            queue: QueueConfig::default(),
            cleanup_grace: DEFAULT_GRACE,
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
        }
    }
}

impl From<Args> for Config {
    fn from(args: Args) -> Self {
        let jwt_secret = match args.jwt_secret {
            Some(secret) if !secret.is_empty() => secret,
            _ => {
                warn!("JWT_SECRET not set, using the development secret");
                DEV_SECRET.to_string()
            }
        };

        Self {
            addr: args.addr,
            jwt_secret,
            queue: QueueConfig {
                max_age: Duration::from_secs(args.queue_max_age_secs),
                sweep_interval: Duration::from_secs(args.queue_sweep_secs),
            },
            cleanup_grace: Duration::from_secs(args.cleanup_grace_secs),
            // Bounded by MAX_OUTBOUND_BUFFER
            outbound_buffer: args.outbound_buffer as usize,
        }
    }
}

impl Config {
    /// Parse an argument list (program name first), reporting bad values as
    /// `InvalidInput` instead of exiting
    pub fn try_parse_from<I, T>(args: I) -> Result<Self, AppError>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        Args::try_parse_from(args)
            .map(Config::from)
            .map_err(|e| AppError::InvalidInput(e.to_string()))
    }
}
