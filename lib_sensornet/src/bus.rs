//! # Message Bus Addressing
//!
//! The broker is an external collaborator. Both the long-lived subscription and
//! the liveness prober only need to know where it lives and how topic filters
//! match, so those two concerns live here.

use std::fmt;

/// Default MQTT port for unencrypted connections.
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// # Bus Endpoint
///
/// Host and port of the MQTT broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusEndpoint {
    /// Broker host name or IP address.
    pub host: String,
    /// Broker TCP port.
    pub port: u16,
}

impl BusEndpoint {
    /// Creates an endpoint from a host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for BusEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Returns `true` when `topic` is matched by the subscription `filter`.
///
/// Supports the MQTT wildcards `+` (exactly one level) and `#` (all remaining
/// levels, must be last).
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
