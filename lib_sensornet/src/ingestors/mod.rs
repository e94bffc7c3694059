//! # Data Ingestors Module
//!
//! Everything between the message bus and the retention buffers.
//!
//! ## Contained Modules:
//! - **`gateway`**: the `IngestionGateway`. Decodes each delivery once, runs
//!   every buffer's admission policy, stamps arrival time and appends the same
//!   shared record to each buffer that accepted it.
//! - **`mqtt_bus`**: the long-lived MQTT subscription. Owns the bus
//!   connection, re-subscribes after every reconnect, backs off on failure and
//!   hands payloads to the gateway.

/// Decode, admit, stamp, append.
pub mod gateway;
/// The long-lived MQTT subscription feeding the gateway.
pub mod mqtt_bus;

// --- Public API Re-exports ---
pub use gateway::{BufferRoute, DeliveryOutcome, GatewayStats, IngestionGateway};
pub use mqtt_bus::{Backoff, MqttSubscription, SubscriptionConfig, SubscriptionState, SubscriptionStatus};
