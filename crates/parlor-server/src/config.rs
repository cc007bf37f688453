//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use parlor_shared::constants::{
    self, DEFAULT_HTTP_PORT, MAX_FRAME_SIZE, OUTBOUND_QUEUE_CAPACITY, PING_PERIOD, PONG_WAIT,
    WRITE_WAIT,
};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP/WebSocket server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// Path of the chat client page served at `/` and `/client.html`.
    /// Env: `CLIENT_PAGE`
    /// Default: `client.html` (relative to the working directory)
    pub client_page: PathBuf,

    /// Largest inbound frame accepted from a peer, in bytes.
    /// Env: `MAX_FRAME_SIZE`
    pub max_frame_size: usize,

    /// Envelopes buffered per connection before it counts as a slow receiver.
    /// Env: `OUTBOUND_QUEUE_CAPACITY`
    pub outbound_queue_capacity: usize,

    pub timing: Timing,
}

/// Per-connection deadlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// Deadline for a single frame write.
    /// Env: `WRITE_WAIT_SECS`
    pub write_wait: Duration,

    /// Read inactivity timeout, reset by any inbound frame.
    /// Env: `PONG_WAIT_SECS`
    pub pong_wait: Duration,

    /// Keepalive ping interval, always 90% of `pong_wait`.
    pub ping_period: Duration,
}

impl Timing {
    pub fn new(write_wait: Duration, pong_wait: Duration) -> Self {
        Self {
            write_wait,
            pong_wait,
            ping_period: constants::ping_period_for(pong_wait),
        }
    }
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            write_wait: WRITE_WAIT,
            pong_wait: PONG_WAIT,
            ping_period: PING_PERIOD,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            client_page: PathBuf::from("client.html"),
            max_frame_size: MAX_FRAME_SIZE,
            outbound_queue_capacity: OUTBOUND_QUEUE_CAPACITY,
            timing: Timing::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = parse_var(&lookup, "HTTP_ADDR") {
            config.http_addr = addr;
        }

        if let Some(path) = lookup("CLIENT_PAGE") {
            config.client_page = PathBuf::from(path);
        }

        if let Some(size) = parse_var::<usize>(&lookup, "MAX_FRAME_SIZE") {
            config.max_frame_size = size;
        }

        if let Some(capacity) = parse_var::<usize>(&lookup, "OUTBOUND_QUEUE_CAPACITY") {
            if capacity > 0 {
                config.outbound_queue_capacity = capacity;
            } else {
                tracing::warn!("OUTBOUND_QUEUE_CAPACITY must be positive, using default");
            }
        }

        let write_wait = parse_var::<u64>(&lookup, "WRITE_WAIT_SECS")
            .map(Duration::from_secs)
            .unwrap_or(WRITE_WAIT);
        let pong_wait = parse_var::<u64>(&lookup, "PONG_WAIT_SECS")
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(PONG_WAIT);
        config.timing = Timing::new(write_wait, pong_wait);

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Invalid value, using default");
            None
        }
    }
}
