//! Protocol timing tunables, kept as a struct rather than hardcoded so
//! tests can shrink the timers.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Delay before attempting to reconnect after the transport closes.
    pub reconnect_delay: Duration,
    /// Delay before re-subscribing an entry that is retained only by direct
    /// listeners and has lost its subscription.
    pub stale_resubscribe_delay: Duration,
    /// Event-bus namespace used for client-level and pass-through events.
    pub namespace: String,
    /// Timeout applied to the transport's `open` call.
    pub ws_connect_timeout: Duration,
    /// Bound on the transport's inbound message channel.
    pub max_event_backlog: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_millis(3000),
            stale_resubscribe_delay: Duration::from_millis(2000),
            namespace: "resclient".to_string(),
            ws_connect_timeout: Duration::from_secs(10),
            max_event_backlog: 1024,
        }
    }
}
