//! # Liveness Prober
//!
//! Answers "can a fresh client reach the bus right now?". A probe is a full
//! MQTT handshake (TCP connect, CONNECT, CONNACK) within a timeout, followed
//! by a best-effort DISCONNECT. The connection is dropped whatever the outcome.
//!
//! The result of a tick replaces the previous one. Nothing is cached beyond
//! one tick.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use rumqttc::{AsyncClient, ConnectReturnCode, ConnectionError, Event, MqttOptions, Packet};
use serde::Serialize;
use thiserror::Error;

use crate::bus::BusEndpoint;

/// Minimum keep-alive accepted by `rumqttc`.
const PROBE_KEEP_ALIVE: Duration = Duration::from_secs(5);

/// Up/down signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
    /// The last probe completed a handshake.
    Up,
    /// The last probe failed.
    Down,
}

impl std::fmt::Display for Liveness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Liveness::Up => f.write_str("UP"),
            Liveness::Down => f.write_str("DOWN"),
        }
    }
}

/// # Connect Failure
///
/// Why a probe could not reach the bus.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectFailure {
    /// No CONNACK within the probe timeout.
    #[error("no answer within {0:?}")]
    Timeout(Duration),
    /// TCP-level failure (refused, unreachable, reset).
    #[error("connection failed: {0}")]
    Connection(String),
    /// The peer did not speak MQTT as expected.
    #[error("handshake failed: {0}")]
    Handshake(String),
    /// The broker answered and refused the connection.
    #[error("broker refused connection: {0}")]
    Rejected(String),
}

impl From<ConnectionError> for ConnectFailure {
    fn from(e: ConnectionError) -> Self {
        match e {
            ConnectionError::Io(io) => ConnectFailure::Connection(io.to_string()),
            ConnectionError::ConnectionRefused(code) => ConnectFailure::Rejected(format!("{:?}", code)),
            other => ConnectFailure::Handshake(other.to_string()),
        }
    }
}

/// # Probe Config
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Broker address.
    pub endpoint: BusEndpoint,
    /// Probe client ids are `<prefix>-probe-<n>`.
    pub client_id_prefix: String,
    /// Budget for one probe, connect to CONNACK.
    pub timeout: Duration,
}

impl ProbeConfig {
    /// Config with the 2 s timeout the dashboard uses.
    pub fn new(endpoint: BusEndpoint, client_id_prefix: impl Into<String>) -> Self {
        Self {
            endpoint,
            client_id_prefix: client_id_prefix.into(),
            timeout: Duration::from_secs(2),
        }
    }
}

/// What the presentation layer sees.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LivenessReport {
    /// Result of the last tick, `None` before the first one.
    pub status: Option<Liveness>,
    /// Probes attempted, by `tick` or directly through `probe_once`.
    pub probes: u64,
    /// Consecutive failed ticks.
    pub consecutive_failures: u32,
    /// Failure of the last tick, if it failed.
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct ProbeState {
    current: Option<Liveness>,
    down_since: Option<Instant>,
    consecutive_failures: u32,
    last_error: Option<String>,
}

/// # Liveness Prober
#[derive(Debug)]
pub struct LivenessProber {
    config: ProbeConfig,
    probes: AtomicU64,
    state: Mutex<ProbeState>,
}

impl LivenessProber {
    /// Creates a prober. No probe runs until `tick`.
    pub fn new(config: ProbeConfig) -> Self {
        Self {
            config,
            probes: AtomicU64::new(0),
            state: Mutex::new(ProbeState::default()),
        }
    }

    /// Probed endpoint.
    pub fn endpoint(&self) -> &BusEndpoint {
        &self.config.endpoint
    }

    /// One probe: connect, wait for CONNACK, disconnect.
    pub async fn probe_once(&self) -> Result<(), ConnectFailure> {
        let n = self.probes.fetch_add(1, Ordering::Relaxed) + 1;
        let client_id = format!("{}-probe-{}", self.config.client_id_prefix, n);

        let mut options = MqttOptions::new(client_id, self.config.endpoint.host.clone(), self.config.endpoint.port);
        options.set_keep_alive(PROBE_KEEP_ALIVE.max(self.config.timeout));
        options.set_clean_session(true);

        let (client, mut eventloop) = AsyncClient::new(options, 1);

        let handshake = async {
            loop {
                match eventloop.poll().await? {
                    Event::Incoming(Packet::ConnAck(ack)) => return Ok::<_, ConnectionError>(ack.code),
                    _ => continue,
                }
            }
        };

        let outcome = match tokio::time::timeout(self.config.timeout, handshake).await {
            Err(_) => Err(ConnectFailure::Timeout(self.config.timeout)),
            Ok(Err(e)) => Err(ConnectFailure::from(e)),
            Ok(Ok(ConnectReturnCode::Success)) => Ok(()),
            Ok(Ok(code)) => Err(ConnectFailure::Rejected(format!("{:?}", code))),
        };

        if outcome.is_ok() {
            // Flush the DISCONNECT so the broker does not log an abrupt close.
            let _ = client.try_disconnect();
            let _ = tokio::time::timeout(Duration::from_millis(100), eventloop.poll()).await;
        }
        drop(eventloop);

        outcome
    }

    /// Runs one probe and records the result, logging transitions.
    pub async fn tick(&self) -> Liveness {
        let result = self.probe_once().await;
        let endpoint = &self.config.endpoint;

        let mut state = self.lock_state();
        let previous = state.current;

        let now = match result {
            Ok(()) => {
                match (previous, state.down_since.take()) {
                    (Some(Liveness::Down), Some(since)) => {
                        log::info!("Bus {} restored after {:?}", endpoint, since.elapsed());
                    }
                    (None, _) => log::info!("Bus {} is UP", endpoint),
                    _ => log::debug!("Bus {} still UP", endpoint),
                }
                state.consecutive_failures = 0;
                state.last_error = None;
                Liveness::Up
            }
            Err(e) => {
                if previous != Some(Liveness::Down) {
                    log::warn!("Bus {} is DOWN: {}", endpoint, e);
                    state.down_since = Some(Instant::now());
                } else {
                    log::debug!("Bus {} still DOWN: {}", endpoint, e);
                }
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                state.last_error = Some(e.to_string());
                Liveness::Down
            }
        };

        state.current = Some(now);
        now
    }

    /// Result of the last tick.
    pub fn current(&self) -> Option<Liveness> {
        self.lock_state().current
    }

    /// Result of the last tick plus counters.
    pub fn report(&self) -> LivenessReport {
        let state = self.lock_state();
        LivenessReport {
            status: state.current,
            probes: self.probes.load(Ordering::Relaxed),
            consecutive_failures: state.consecutive_failures,
            last_error: state.last_error.clone(),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ProbeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
