//! # Monitors Module
//!
//! Health checks for external collaborators. Currently only the message bus.
//!
//! ## Contained Modules:
//! - **`liveness`**: the two-state (`Up`/`Down`) bus liveness prober. Each tick
//!   opens its own short-lived MQTT connection, independent from the
//!   long-lived subscription, and always closes it afterwards.

/// Bus liveness probing.
pub mod liveness;

// --- Public API Re-exports ---
pub use liveness::{ConnectFailure, Liveness, LivenessProber, LivenessReport, ProbeConfig};
