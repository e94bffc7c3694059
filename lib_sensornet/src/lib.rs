//! # lib_sensornet
//!
//! Shared engine for the environmental sensor network dashboard. Sensor nodes
//! publish JSON telemetry onto a single MQTT topic; this crate turns that stream
//! into bounded, consistently readable history for the presentation layer.
//!
//! Data flow:
//!
//! ```text
//! bus ─► ingestors::MqttSubscription ─► ingestors::IngestionGateway
//!          (delivery task)                 decode ─► admit ─► stamp ─► append
//!                                                                   │
//!                     core::RetentionBuffer (graph, log, ...) ◄─────┘
//!                                   │ snapshot (pointer copy)
//!                                   ▼
//!                     core::SnapshotReader ─► tables / CSV export
//! ```
//!
//! `monitors::LivenessProber` checks the bus with its own short-lived
//! connections and never touches the subscription.
//!
//! Every module sits behind a cargo feature of the same name so binaries can
//! depend on only the slice they need.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Message bus addressing shared by the subscription and the liveness prober.
#[cfg(any(feature = "ingestors", feature = "monitors"))]
pub mod bus;
/// Record model, decoder, admission, retention buffers and snapshots.
#[cfg(feature = "core")]
pub mod core;
/// The ingestion gateway and the MQTT subscription feeding it.
#[cfg(feature = "ingestors")]
pub mod ingestors;
/// Console and file logging setup.
#[cfg(feature = "loggers")]
pub mod loggers;
/// Liveness probing of the message bus.
#[cfg(feature = "monitors")]
pub mod monitors;
/// Small time formatting helpers.
#[cfg(feature = "utils")]
pub mod utils;
