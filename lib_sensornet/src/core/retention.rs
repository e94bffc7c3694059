//! # Retention Buffer
//!
//! A fixed-capacity, insertion-ordered store of telemetry records with strict
//! FIFO eviction.
//!
//! ## Concurrency model
//!
//! - **Writer side**: `append` takes a short `Mutex` around the writer-owned
//!   `VecDeque`, evicts the head if full, pushes the new record, and publishes
//!   an immutable copy of the contents through an `ArcSwap`. Records are
//!   `Arc`s, so an append costs O(capacity) pointer clones, not O(1).
//! - **Reader side**: `snapshot` is a single atomic pointer load. Readers never
//!   touch the writer mutex, never wait for a write, and can never observe a
//!   half-built record because records are fully constructed before they are
//!   appended and are immutable afterwards.
//! - **Change notification**: a `tokio::sync::watch` channel carries the
//!   buffer generation, bumped once per append.
//!
//! One gateway task is the only writer of a given buffer. The mutex keeps the
//! invariant even if that assumption is broken.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use arc_swap::ArcSwap;
use serde::Serialize;
use tokio::sync::watch;

use super::record::TelemetryRecord;
use super::snapshot::Snapshot;

/// # Append Outcome
///
/// What happened to the buffer on one `append`.
#[derive(Debug, Clone)]
pub struct AppendOutcome {
    /// Generation published by this append.
    pub generation: u64,
    /// The record pushed out of the head, when the buffer was full.
    pub evicted: Option<Arc<TelemetryRecord>>,
}

/// # Buffer Stats
///
/// Counters for dashboards and logs.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferStats {
    /// Buffer name.
    pub name: String,
    /// Fixed capacity.
    pub capacity: usize,
    /// Records currently held.
    pub len: usize,
    /// Records ever appended.
    pub appended: u64,
    /// Records evicted to make room.
    pub evicted: u64,
    /// Current generation.
    pub generation: u64,
}

/// # Retention Buffer
///
/// Created once at start-up and shared as `Arc<RetentionBuffer>` between the
/// gateway (writes) and the presentation layer (snapshots).
pub struct RetentionBuffer {
    name: String,
    capacity: usize,
    /// Writer-owned storage, oldest first.
    storage: Mutex<VecDeque<Arc<TelemetryRecord>>>,
    /// Last published immutable view.
    published: ArcSwap<Snapshot>,
    changes: watch::Sender<u64>,
    appended: AtomicU64,
    evicted: AtomicU64,
}

impl RetentionBuffer {
    /// Creates an empty buffer. A capacity of zero is raised to one.
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let name = name.into();
        let capacity = if capacity == 0 {
            log::warn!("Retention buffer '{}' configured with capacity 0; using 1.", name);
            1
        } else {
            capacity
        };
        let (changes, _) = watch::channel(0);

        Self {
            name,
            capacity,
            storage: Mutex::new(VecDeque::with_capacity(capacity)),
            published: ArcSwap::from_pointee(Snapshot::empty()),
            changes,
            appended: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    /// Buffer name, used in logs and notifications.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fixed capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// # Append
    ///
    /// Inserts `record` at the tail, evicting the oldest record first when the
    /// buffer is full, then publishes the new contents.
    pub fn append(&self, record: Arc<TelemetryRecord>) -> AppendOutcome {
        let mut storage = self.lock_storage();

        let evicted = if storage.len() >= self.capacity {
            storage.pop_front()
        } else {
            None
        };
        storage.push_back(record);

        let generation = self.appended.fetch_add(1, Ordering::Relaxed) + 1;
        if evicted.is_some() {
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }

        let view: Arc<[Arc<TelemetryRecord>]> = storage.iter().cloned().collect();
        self.published.store(Arc::new(Snapshot::new(generation, view)));
        drop(storage);

        self.changes.send_replace(generation);

        AppendOutcome { generation, evicted }
    }

    /// # Snapshot
    ///
    /// The contents as of the last completed append, oldest first. Costs one
    /// atomic load and a reference-count increment.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot::clone(&self.published.load())
    }

    /// Number of records currently held.
    pub fn len(&self) -> usize {
        self.published.load().len()
    }

    /// `true` before the first append.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A receiver that observes the generation after each append.
    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    /// Live receivers handed out by `subscribe_changes`.
    pub fn change_subscribers(&self) -> usize {
        self.changes.receiver_count()
    }

    /// Current counters.
    pub fn stats(&self) -> BufferStats {
        let snapshot = self.snapshot();
        BufferStats {
            name: self.name.clone(),
            capacity: self.capacity,
            len: snapshot.len(),
            appended: self.appended.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            generation: snapshot.generation(),
        }
    }

    fn lock_storage(&self) -> MutexGuard<'_, VecDeque<Arc<TelemetryRecord>>> {
        // A panic while holding the lock cannot leave the deque half-updated,
        // so a poisoned lock is still usable.
        self.storage
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for RetentionBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetentionBuffer")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::record::{Metric, RawTelemetry};
    use chrono::{Duration, TimeZone, Utc};

    fn record(seq: u64, origin: &str) -> Arc<TelemetryRecord> {
        let base = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        Arc::new(
            RawTelemetry::new(origin)
                .with_metric(Metric::TempC, seq as f64)
                .stamp(base + Duration::seconds(seq as i64), seq),
        )
    }

    fn sequences(snapshot: &Snapshot) -> Vec<u64> {
        snapshot.iter().map(|r| r.sequence).collect()
    }

    #[test]
    fn empty_snapshot_is_empty() {
        let buffer = RetentionBuffer::new("graph", 3);
        let snapshot = buffer.snapshot();
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.generation(), 0);
        assert!(buffer.is_empty());
    }

    #[test]
    fn keeps_exactly_the_most_recent_capacity_records() {
        let buffer = RetentionBuffer::new("graph", 3);
        for total in 1..=10u64 {
            buffer.append(record(total, "A1"));
            let expected: Vec<u64> = (total.saturating_sub(3) + 1..=total).collect();
            assert_eq!(sequences(&buffer.snapshot()), expected);
        }
        let stats = buffer.stats();
        assert_eq!((stats.len, stats.appended, stats.evicted), (3, 10, 7));
        assert_eq!(stats.generation, 10);
    }

    #[test]
    fn overflow_advances_oldest_to_second_oldest() {
        let buffer = RetentionBuffer::new("graph", 4);
        for seq in 1..=4 {
            buffer.append(record(seq, "A1"));
        }
        let before = buffer.snapshot();
        let second_oldest = before.iter().nth(1).map(|r| r.received_at);

        let outcome = buffer.append(record(5, "A1"));
        assert_eq!(outcome.evicted.map(|r| r.sequence), Some(1));
        assert_eq!(buffer.snapshot().oldest().map(|r| r.received_at), second_oldest);
    }

    #[test]
    fn snapshots_are_isolated_from_later_appends() {
        let buffer = RetentionBuffer::new("log", 2);
        buffer.append(record(1, "A1"));
        let held = buffer.snapshot();
        buffer.append(record(2, "B2"));
        buffer.append(record(3, "A1"));

        assert_eq!(sequences(&held), vec![1]);
        assert_eq!(sequences(&buffer.snapshot()), vec![2, 3]);
    }

    #[test]
    fn heartbeat_records_are_accepted() {
        let buffer = RetentionBuffer::new("log", 2);
        let heartbeat = Arc::new(RawTelemetry::new("A1").stamp(Utc::now(), 1));
        buffer.append(heartbeat);
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn zero_capacity_is_raised_to_one() {
        let buffer = RetentionBuffer::new("tiny", 0);
        assert_eq!(buffer.capacity(), 1);
        buffer.append(record(1, "A1"));
        buffer.append(record(2, "A1"));
        assert_eq!(sequences(&buffer.snapshot()), vec![2]);
    }

    #[test]
    fn appends_are_announced_on_the_change_channel() {
        let buffer = RetentionBuffer::new("graph", 2);
        let mut changes = buffer.subscribe_changes();
        assert_eq!(*changes.borrow_and_update(), 0);

        buffer.append(record(1, "A1"));
        buffer.append(record(2, "A1"));
        assert!(changes.has_changed().unwrap());
        assert_eq!(*changes.borrow_and_update(), 2);
    }

    #[test]
    fn dropped_receivers_are_no_longer_counted() {
        let buffer = RetentionBuffer::new("graph", 2);
        assert_eq!(buffer.change_subscribers(), 0);
        let first = buffer.subscribe_changes();
        let second = buffer.subscribe_changes();
        assert_eq!(buffer.change_subscribers(), 2);
        drop(first);
        assert_eq!(buffer.change_subscribers(), 1);
        drop(second);
        assert_eq!(buffer.change_subscribers(), 0);
    }

    #[test]
    fn concurrent_readers_never_see_torn_state() {
        let buffer = Arc::new(RetentionBuffer::new("graph", 8));
        let writer = {
            let buffer = Arc::clone(&buffer);
            std::thread::spawn(move || {
                for seq in 1..=5_000u64 {
                    buffer.append(record(seq, "A1"));
                }
            })
        };

        let readers: Vec<_> = (0..3)
            .map(|_| {
                let buffer = Arc::clone(&buffer);
                std::thread::spawn(move || {
                    let mut last_generation = 0;
                    for _ in 0..2_000 {
                        let snapshot = buffer.snapshot();
                        assert!(snapshot.generation() >= last_generation);
                        last_generation = snapshot.generation();
                        assert!(snapshot.len() <= 8);
                        let seqs = sequences(&snapshot);
                        assert!(seqs.windows(2).all(|w| w[1] == w[0] + 1));
                        if let Some(last) = seqs.last() {
                            assert_eq!(*last, snapshot.generation());
                        }
                        for r in snapshot.iter() {
                            assert_eq!(r.readings.get(Metric::TempC), Some(r.sequence as f64));
                        }
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(buffer.stats().appended, 5_000);
    }
}
