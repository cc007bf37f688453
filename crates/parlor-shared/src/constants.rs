use std::time::Duration;

/// Application name
pub const APP_NAME: &str = "Parlor";

/// Maximum inbound WebSocket frame size in bytes (5 KiB)
pub const MAX_FRAME_SIZE: usize = 5120;

/// Capacity of each connection's outbound queue, in envelopes
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Capacity of the hub's request queue
pub const HUB_QUEUE_CAPACITY: usize = 64;

/// Timestamps above this value are taken to be milliseconds
pub const MILLIS_THRESHOLD: i64 = 9_999_999_999;

/// Time allowed to write a single frame to the peer
pub const WRITE_WAIT: Duration = Duration::from_secs(10);

/// Time allowed between two reads (any frame, pongs included)
pub const PONG_WAIT: Duration = Duration::from_secs(60);

/// Ping period; must stay below `PONG_WAIT`
pub const PING_PERIOD: Duration = Duration::from_secs(54);

/// Longest accepted client-supplied user id, in bytes
pub const MAX_USER_ID_LEN: usize = 64;

/// Default HTTP port (server)
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Ping period derived from an inactivity timeout (90% of it).
pub fn ping_period_for(pong_wait: Duration) -> Duration {
    pong_wait * 9 / 10
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_period_below_pong_wait() {
        assert_eq!(ping_period_for(PONG_WAIT), PING_PERIOD);
        assert!(PING_PERIOD < PONG_WAIT);
    }
}
