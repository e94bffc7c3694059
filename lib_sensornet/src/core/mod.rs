//! # Core Engine Module
//!
//! The bounded telemetry store and everything that shapes data going into it
//! or coming out of it.
//!
//! ## Core Components:
//!
//! - **`record`**: the fixed-shape `TelemetryRecord` with explicitly optional
//!   metric fields, plus the field catalogue used for projections.
//! - **`decoder`**: raw payload bytes to `RawTelemetry`, or a `DecodeError`.
//! - **`admission`**: per-buffer admission policies (unconditional, origin
//!   scoped, plausibility scoped).
//! - **`retention`**: the fixed-capacity, oldest-evicting `RetentionBuffer`
//!   that publishes an immutable snapshot after every append.
//! - **`snapshot`**: the read side. Origin selection, field projection into
//!   tables, and CSV export.

/// Per-buffer admission policies.
pub mod admission;
/// Payload decoding.
pub mod decoder;
/// Telemetry record model and field catalogue.
pub mod record;
/// Fixed-capacity retention buffer.
pub mod retention;
/// Immutable snapshots, projections and export.
pub mod snapshot;

// --- Public API Re-exports ---
pub use admission::{AdmissionPolicy, AdmissionReject, Bounds, PlausibilityBounds};
pub use decoder::{decode, DecodeError};
pub use record::{Field, FieldValue, Metric, RawTelemetry, Readings, TelemetryRecord};
pub use retention::{AppendOutcome, BufferStats, RetentionBuffer};
pub use snapshot::{ExportError, Row, Snapshot, SnapshotReader, Table};
