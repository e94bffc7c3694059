//! # Ingestion Gateway
//!
//! The single consumer of bus deliveries. For each payload:
//!
//! 1. Decode. A malformed payload is logged at `warn` and dropped.
//! 2. Run each route's admission policy against the decoded message.
//!    Rejections are expected traffic and only logged at `trace`.
//! 3. If any route accepted, stamp `received_at` and `sequence` once.
//! 4. Append the same `Arc<TelemetryRecord>` to every accepting buffer.
//!
//! The handler does no I/O and takes no lock other than each buffer's short
//! append critical section, so it is safe to call from the bus client's
//! delivery task.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::{decode, AdmissionPolicy, DecodeError, RetentionBuffer};

/// # Buffer Route
///
/// One destination buffer and the policy guarding it.
#[derive(Debug, Clone)]
pub struct BufferRoute {
    /// Admission policy for this buffer.
    pub policy: AdmissionPolicy,
    /// Destination.
    pub buffer: Arc<RetentionBuffer>,
}

impl BufferRoute {
    /// Pairs a policy with a buffer.
    pub fn new(policy: AdmissionPolicy, buffer: Arc<RetentionBuffer>) -> Self {
        Self { policy, buffer }
    }
}

/// What the gateway did with one delivery.
#[derive(Debug)]
pub enum DeliveryOutcome {
    /// The payload did not decode; nothing was stored.
    Malformed(DecodeError),
    /// Decoded, but every route rejected it.
    Rejected,
    /// Stored in the named buffers.
    Stored {
        /// Sequence number assigned to the record.
        sequence: u64,
        /// Names of the buffers that accepted it, in route order.
        buffers: Vec<String>,
    },
}

impl DeliveryOutcome {
    /// `true` when the record landed in at least one buffer.
    pub fn is_stored(&self) -> bool {
        matches!(self, DeliveryOutcome::Stored { .. })
    }
}

/// Gateway counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStats {
    /// Payloads handed to the gateway.
    pub received: u64,
    /// Payloads that failed to decode.
    pub decode_failures: u64,
    /// Per-route rejections (one message can count several times).
    pub rejections: u64,
    /// Records stored in at least one buffer.
    pub stored: u64,
}

/// # Ingestion Gateway
#[derive(Debug)]
pub struct IngestionGateway {
    routes: Vec<BufferRoute>,
    sequence: AtomicU64,
    received: AtomicU64,
    decode_failures: AtomicU64,
    rejections: AtomicU64,
    stored: AtomicU64,
}

impl IngestionGateway {
    /// Builds a gateway over a fixed set of routes.
    pub fn new(routes: Vec<BufferRoute>) -> Self {
        for route in &routes {
            log::info!(
                "Gateway route: buffer '{}' (capacity {}) policy {}",
                route.buffer.name(),
                route.buffer.capacity(),
                route.policy
            );
        }
        Self {
            routes,
            sequence: AtomicU64::new(0),
            received: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
            stored: AtomicU64::new(0),
        }
    }

    /// Configured routes.
    pub fn routes(&self) -> &[BufferRoute] {
        &self.routes
    }

    /// Looks up a destination buffer by name.
    pub fn buffer(&self, name: &str) -> Option<&Arc<RetentionBuffer>> {
        self.routes
            .iter()
            .map(|r| &r.buffer)
            .find(|b| b.name() == name)
    }

    /// Handles one delivery, stamped with the current time.
    pub fn handle_delivery(&self, payload: &[u8]) -> DeliveryOutcome {
        self.handle_delivery_at(payload, Utc::now())
    }

    /// Handles one delivery with an explicit arrival time.
    pub fn handle_delivery_at(&self, payload: &[u8], received_at: DateTime<Utc>) -> DeliveryOutcome {
        self.received.fetch_add(1, Ordering::Relaxed);

        // --- Step 1: decode ---
        let raw = match decode(payload) {
            Ok(raw) => raw,
            Err(e) => {
                self.decode_failures.fetch_add(1, Ordering::Relaxed);
                log::warn!("Dropping malformed payload ({} bytes): {}", payload.len(), e);
                return DeliveryOutcome::Malformed(e);
            }
        };

        // --- Step 2: admission ---
        let accepting: Vec<&BufferRoute> = self
            .routes
            .iter()
            .filter(|route| match route.policy.admit(&raw) {
                Ok(()) => true,
                Err(reject) => {
                    self.rejections.fetch_add(1, Ordering::Relaxed);
                    log::trace!("Buffer '{}' rejected record: {}", route.buffer.name(), reject);
                    false
                }
            })
            .collect();

        if accepting.is_empty() {
            return DeliveryOutcome::Rejected;
        }

        // --- Step 3: stamp ---
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let record = Arc::new(raw.stamp(received_at, sequence));

        // --- Step 4: append ---
        let buffers = accepting
            .into_iter()
            .map(|route| {
                route.buffer.append(Arc::clone(&record));
                route.buffer.name().to_string()
            })
            .collect();

        self.stored.fetch_add(1, Ordering::Relaxed);
        log::debug!("Stored record #{} from '{}'", sequence, record.origin_id);

        DeliveryOutcome::Stored { sequence, buffers }
    }

    /// Current counters.
    pub fn stats(&self) -> GatewayStats {
        GatewayStats {
            received: self.received.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
            stored: self.stored.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Bounds, Metric, PlausibilityBounds};

    fn log_and_home(target: &str, home_capacity: usize) -> (IngestionGateway, Arc<RetentionBuffer>, Arc<RetentionBuffer>) {
        let home = Arc::new(RetentionBuffer::new("graph", home_capacity));
        let log = Arc::new(RetentionBuffer::new("log", 50));
        let gateway = IngestionGateway::new(vec![
            BufferRoute::new(
                AdmissionPolicy::PlausibilityScoped {
                    target: Some(target.to_string()),
                    bounds: PlausibilityBounds::new().with(Metric::TempC, Bounds::below(150.0)),
                },
                Arc::clone(&home),
            ),
            BufferRoute::new(AdmissionPolicy::Unconditional, Arc::clone(&log)),
        ]);
        (gateway, home, log)
    }

    fn payload(origin: &str, temp: f64) -> Vec<u8> {
        serde_json::json!({ "ID": origin, "Temp_C": temp }).to_string().into_bytes()
    }

    #[test]
    fn origin_scoped_buffer_keeps_only_target_records() {
        let (gateway, home, log) = log_and_home("A1", 5);
        let origins = ["A1", "A1", "B2", "A1", "B2", "A1", "A1"];
        for (i, origin) in origins.iter().enumerate() {
            gateway.handle_delivery(&payload(origin, i as f64));
        }

        let home = home.snapshot();
        assert_eq!(home.len(), 5);
        assert!(home.iter().all(|r| r.origin_id == "A1"));
        let temps: Vec<f64> = home.iter().filter_map(|r| r.readings.get(Metric::TempC)).collect();
        assert_eq!(temps, vec![0.0, 1.0, 3.0, 5.0, 6.0]);

        assert_eq!(log.snapshot().len(), 7);
    }

    #[test]
    fn implausible_reading_reaches_the_log_only() {
        let (gateway, home, log) = log_and_home("A1", 100);

        assert!(gateway.handle_delivery(&payload("A1", 23.5)).is_stored());
        match gateway.handle_delivery(&payload("A1", 999.0)) {
            DeliveryOutcome::Stored { buffers, .. } => assert_eq!(buffers, vec!["log".to_string()]),
            other => panic!("unexpected outcome: {:?}", other),
        }

        let home: Vec<f64> = home.snapshot().iter().filter_map(|r| r.readings.get(Metric::TempC)).collect();
        assert_eq!(home, vec![23.5]);
        let logged = log.snapshot();
        assert_eq!(logged.latest().and_then(|r| r.readings.get(Metric::TempC)), Some(999.0));
    }

    #[test]
    fn malformed_payloads_never_reach_a_buffer() {
        let (gateway, home, log) = log_and_home("A1", 5);
        let malformed: [&[u8]; 4] = [b"\xff\xfe", b"{not json", b"[1,2]", b"{\"Temp_C\":1}"];
        for bad in malformed {
            assert!(matches!(gateway.handle_delivery(bad), DeliveryOutcome::Malformed(_)));
        }
        assert!(home.is_empty());
        assert!(log.is_empty());
        let stats = gateway.stats();
        assert_eq!((stats.received, stats.decode_failures, stats.stored), (4, 4, 0));
    }

    #[test]
    fn one_record_is_shared_between_buffers() {
        let (gateway, home, log) = log_and_home("A1", 5);
        let at = Utc::now();
        gateway.handle_delivery_at(&payload("A1", 20.0), at);

        let a = home.snapshot();
        let b = log.snapshot();
        let (a, b) = (a.latest().unwrap(), b.latest().unwrap());
        assert!(Arc::ptr_eq(a, b));
        assert_eq!(a.received_at, at);
        assert_eq!(a.sequence, 1);
    }

    #[test]
    fn rejected_everywhere_consumes_no_sequence() {
        let home = Arc::new(RetentionBuffer::new("graph", 5));
        let gateway = IngestionGateway::new(vec![BufferRoute::new(
            AdmissionPolicy::OriginScoped { target: "A1".into() },
            Arc::clone(&home),
        )]);

        assert!(matches!(gateway.handle_delivery(&payload("B2", 1.0)), DeliveryOutcome::Rejected));
        match gateway.handle_delivery(&payload("A1", 1.0)) {
            DeliveryOutcome::Stored { sequence, .. } => assert_eq!(sequence, 1),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(gateway.stats().rejections, 1);
        assert!(gateway.buffer("graph").is_some());
        assert!(gateway.buffer("missing").is_none());
    }
}
