//! Metrics for state transfer and topology handling.
//!
//! Plain atomics, read through [`StateTransferMetrics::snapshot`].

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// A monotonically increasing counter.
#[derive(Debug)]
pub struct Counter {
    name: &'static str,
    value: AtomicU64,
}

impl Counter {
    /// Create a new counter.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            value: AtomicU64::new(0),
        }
    }

    /// Get the counter name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Increment the counter by 1.
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the counter by a specific amount.
    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Get the current value.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A value that can go up and down.
#[derive(Debug)]
pub struct Gauge {
    name: &'static str,
    value: AtomicI64,
}

impl Gauge {
    /// Create a new gauge.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            value: AtomicI64::new(0),
        }
    }

    /// Get the gauge name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Increment by 1.
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement by 1.
    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    /// Set to a value.
    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    /// Get the current value.
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Counters shared by the provider, consumer and command handler of one cache.
#[derive(Debug)]
pub struct StateTransferMetrics {
    /// Outbound transfers started.
    pub outbound_started: Counter,
    /// Outbound transfers cancelled before finishing.
    pub outbound_cancelled: Counter,
    /// Outbound transfers that sent every last chunk.
    pub outbound_completed: Counter,
    /// Outbound transfers currently running.
    pub outbound_active: Gauge,
    /// Chunks sent.
    pub chunks_sent: Counter,
    /// Chunks received and applied.
    pub chunks_applied: Counter,
    /// Chunks discarded (stale topology or unrequested segment).
    pub chunks_discarded: Counter,
    /// Entries written into the local store.
    pub entries_applied: Counter,
    /// Inbound transfers currently waiting for chunks.
    pub inbound_active: Gauge,
    /// Commands dropped because they carried an older topology id.
    pub stale_commands: Counter,
}

impl StateTransferMetrics {
    /// Create zeroed metrics.
    pub fn new() -> Self {
        Self {
            outbound_started: Counter::new("outbound_transfers_started"),
            outbound_cancelled: Counter::new("outbound_transfers_cancelled"),
            outbound_completed: Counter::new("outbound_transfers_completed"),
            outbound_active: Gauge::new("outbound_transfers_active"),
            chunks_sent: Counter::new("state_chunks_sent"),
            chunks_applied: Counter::new("state_chunks_applied"),
            chunks_discarded: Counter::new("state_chunks_discarded"),
            entries_applied: Counter::new("state_entries_applied"),
            inbound_active: Gauge::new("inbound_transfers_active"),
            stale_commands: Counter::new("stale_commands_dropped"),
        }
    }

    /// Take a point-in-time copy.
    pub fn snapshot(&self) -> StateTransferMetricsSnapshot {
        StateTransferMetricsSnapshot {
            outbound_started: self.outbound_started.get(),
            outbound_cancelled: self.outbound_cancelled.get(),
            outbound_completed: self.outbound_completed.get(),
            outbound_active: self.outbound_active.get(),
            chunks_sent: self.chunks_sent.get(),
            chunks_applied: self.chunks_applied.get(),
            chunks_discarded: self.chunks_discarded.get(),
            entries_applied: self.entries_applied.get(),
            inbound_active: self.inbound_active.get(),
            stale_commands: self.stale_commands.get(),
        }
    }
}

impl Default for StateTransferMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of [`StateTransferMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateTransferMetricsSnapshot {
    pub outbound_started: u64,
    pub outbound_cancelled: u64,
    pub outbound_completed: u64,
    pub outbound_active: i64,
    pub chunks_sent: u64,
    pub chunks_applied: u64,
    pub chunks_discarded: u64,
    pub entries_applied: u64,
    pub inbound_active: i64,
    pub stale_commands: u64,
}
