//! # MQTT Subscription
//!
//! The long-lived connection to the message bus. It owns the `rumqttc` client
//! and event loop, subscribes to one topic at QoS 0 (at-most-once), and hands
//! every matching publish to the `IngestionGateway`.
//!
//! ## Workflow
//! 1. Poll the event loop. `rumqttc` (re)connects lazily on poll.
//! 2. On every `ConnAck`, mark the subscription connected, reset the back-off
//!    and (re)issue the subscribe. Clean sessions do not keep subscriptions.
//! 3. On a publish whose topic matches, call the gateway synchronously.
//! 4. On a connection error, mark disconnected, record the error and sleep a
//!    capped, doubling delay before polling again.
//! 5. On shutdown, send a best-effort DISCONNECT and drop the connection.
//!    Deliveries still in flight are dropped.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Serialize;
use tokio::sync::broadcast;

use super::gateway::IngestionGateway;
use crate::bus::{topic_matches, BusEndpoint};

/// # Subscription Config
#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    /// Broker address.
    pub endpoint: BusEndpoint,
    /// Topic (or filter) to subscribe to.
    pub topic: String,
    /// MQTT client identifier. Must be non-empty.
    pub client_id: String,
    /// Transport keep-alive.
    pub keep_alive: Duration,
    /// First reconnect delay.
    pub reconnect_base: Duration,
    /// Upper bound for the reconnect delay.
    pub reconnect_max: Duration,
    /// Capacity of the client request channel.
    pub request_capacity: usize,
}

impl SubscriptionConfig {
    /// Config with the usual dashboard defaults: 60 s keep-alive, back-off
    /// from 1 s up to 60 s.
    pub fn new(endpoint: BusEndpoint, topic: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            endpoint,
            topic: topic.into(),
            client_id: client_id.into(),
            keep_alive: Duration::from_secs(60),
            reconnect_base: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(60),
            request_capacity: 16,
        }
    }
}

/// # Backoff
///
/// Capped exponential delay: `base`, `2*base`, `4*base`, ... up to `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Option<Duration>,
}

impl Backoff {
    /// Creates a back-off starting at `base`. `max` below `base` is raised to it.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            current: None,
        }
    }

    /// The next delay to wait.
    pub fn next_delay(&mut self) -> Duration {
        let next = match self.current {
            None => self.base,
            Some(previous) => previous.saturating_mul(2).min(self.max),
        };
        self.current = Some(next);
        next
    }

    /// Starts over from `base`.
    pub fn reset(&mut self) {
        self.current = None;
    }
}

/// Serializable view of a `SubscriptionStatus`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionState {
    /// Whether the subscription connection is currently up.
    pub connected: bool,
    /// Successful connections so far.
    pub connects: u64,
    /// Most recent connection error.
    pub last_error: Option<String>,
}

/// # Subscription Status
///
/// Connectivity of the long-lived subscription, shared with the
/// presentation layer. Independent from the liveness probe.
#[derive(Debug, Default)]
pub struct SubscriptionStatus {
    connected: AtomicBool,
    connects: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl SubscriptionStatus {
    /// `true` while the subscription connection is up.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Snapshot of the status.
    pub fn state(&self) -> SubscriptionState {
        SubscriptionState {
            connected: self.is_connected(),
            connects: self.connects.load(Ordering::Relaxed),
            last_error: self.last_error_slot().clone(),
        }
    }

    fn mark_connected(&self) {
        self.connected.store(true, Ordering::Relaxed);
        self.connects.fetch_add(1, Ordering::Relaxed);
    }

    fn mark_disconnected(&self, error: Option<String>) {
        self.connected.store(false, Ordering::Relaxed);
        if error.is_some() {
            *self.last_error_slot() = error;
        }
    }

    fn last_error_slot(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.last_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// # MQTT Subscription
pub struct MqttSubscription {
    config: SubscriptionConfig,
    status: Arc<SubscriptionStatus>,
}

impl MqttSubscription {
    /// Creates the subscription. Nothing connects until `run`.
    pub fn new(config: SubscriptionConfig) -> Self {
        Self {
            config,
            status: Arc::new(SubscriptionStatus::default()),
        }
    }

    /// Shared connectivity status.
    pub fn status(&self) -> Arc<SubscriptionStatus> {
        Arc::clone(&self.status)
    }

    fn options(&self) -> MqttOptions {
        let endpoint = &self.config.endpoint;
        let mut options = MqttOptions::new(self.config.client_id.clone(), endpoint.host.clone(), endpoint.port);
        options.set_keep_alive(self.config.keep_alive);
        options.set_clean_session(true);
        options
    }

    /// Runs until `shutdown` fires. Connection failures never end the loop.
    pub async fn run(self, gateway: Arc<IngestionGateway>, mut shutdown: broadcast::Receiver<()>) {
        let (client, mut eventloop) = AsyncClient::new(self.options(), self.config.request_capacity);
        let mut backoff = Backoff::new(self.config.reconnect_base, self.config.reconnect_max);
        let topic = self.config.topic.clone();

        log::info!(
            "Connecting to MQTT broker {} as '{}' for topic '{}'",
            self.config.endpoint,
            self.config.client_id,
            topic
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    log::info!("Subscription shutting down...");
                    let _ = client.try_disconnect();
                    self.status.mark_disconnected(None);
                    return;
                }
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        log::info!("Connected to MQTT broker {} ({:?})", self.config.endpoint, ack.code);
                        self.status.mark_connected();
                        backoff.reset();
                        if let Err(e) = client.try_subscribe(topic.as_str(), QoS::AtMostOnce) {
                            log::error!("Failed to queue subscribe for '{}': {}", topic, e);
                        }
                    }
                    Ok(Event::Incoming(Packet::SubAck(ack))) => {
                        log::info!("Subscribed to '{}' (return codes {:?})", topic, ack.return_codes);
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        if topic_matches(&topic, &publish.topic) {
                            gateway.handle_delivery(&publish.payload);
                        } else {
                            log::trace!("Ignoring publish on unrelated topic '{}'", publish.topic);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let delay = backoff.next_delay();
                        if self.status.is_connected() {
                            log::warn!("MQTT connection lost: {}. Reconnecting in {:?}", e, delay);
                        } else {
                            log::warn!("MQTT connect to {} failed: {}. Retrying in {:?}", self.config.endpoint, e, delay);
                        }
                        self.status.mark_disconnected(Some(e.to_string()));

                        tokio::select! {
                            _ = shutdown.recv() => {
                                log::info!("Subscription shutting down...");
                                return;
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(10));
        let delays: Vec<u64> = (0..6).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 10, 10]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn backoff_max_never_below_base() {
        let mut backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));
    }

    #[test]
    fn status_tracks_connects_and_last_error() {
        let status = SubscriptionStatus::default();
        assert!(!status.is_connected());

        status.mark_connected();
        status.mark_disconnected(Some("connection reset".into()));
        status.mark_connected();

        let state = status.state();
        assert!(state.connected);
        assert_eq!(state.connects, 2);
        assert_eq!(state.last_error.as_deref(), Some("connection reset"));
    }

    #[test]
    fn defaults_match_the_dashboard() {
        let config = SubscriptionConfig::new(
            BusEndpoint::new("localhost", 1883),
            "Enviromental Sensors Network",
            "dashboard",
        );
        assert_eq!(config.keep_alive, Duration::from_secs(60));
        assert_eq!(config.reconnect_base, Duration::from_secs(1));
        assert_eq!(config.reconnect_max, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn shutdown_stops_a_subscription_that_cannot_connect() {
        let mut config = SubscriptionConfig::new(BusEndpoint::new("127.0.0.1", 1), "t", "test-sub");
        config.reconnect_base = Duration::from_millis(10);
        let subscription = MqttSubscription::new(config);
        let status = subscription.status();
        let gateway = Arc::new(IngestionGateway::new(Vec::new()));
        let (tx, rx) = broadcast::channel(1);

        let task = tokio::spawn(subscription.run(gateway, rx));
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("subscription did not stop")
            .unwrap();
        let state = status.state();
        assert!(!state.connected);
        assert!(state.last_error.is_some());
    }
}
