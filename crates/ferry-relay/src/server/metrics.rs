//! Relay server counters.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Live relay counters
#[derive(Debug, Default)]
pub struct RelayMetrics {
    reservations_accepted: AtomicU64,
    reservations_refused: AtomicU64,
    circuits_opened: AtomicU64,
    circuits_failed: AtomicU64,
    circuits_active: AtomicU64,
    data_limit_closures: AtomicU64,
    duration_limit_closures: AtomicU64,
    bytes_forwarded: AtomicU64,
}

/// Point-in-time copy of [`RelayMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Reservations granted (including renewals)
    pub reservations_accepted: u64,
    /// Reservations refused
    pub reservations_refused: u64,
    /// Circuits that reached the bridging stage
    pub circuits_opened: u64,
    /// CONNECT requests that did not produce a circuit
    pub circuits_failed: u64,
    /// Circuits currently bridging
    pub circuits_active: u64,
    /// Circuits closed by the data limit
    pub data_limit_closures: u64,
    /// Circuits closed by the duration limit
    pub duration_limit_closures: u64,
    /// Bytes forwarded in both directions
    pub bytes_forwarded: u64,
}

impl RelayMetrics {
    /// Create zeroed counters
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn reservation_accepted(&self) {
        self.reservations_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn reservation_refused(&self) {
        self.reservations_refused.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn circuit_failed(&self) {
        self.circuits_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn circuit_opened(&self) {
        self.circuits_opened.fetch_add(1, Ordering::Relaxed);
        self.circuits_active.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn circuit_closed(&self) {
        self.circuits_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn data_limit_hit(&self) {
        self.data_limit_closures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn duration_limit_hit(&self) {
        self.duration_limit_closures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_bytes(&self, bytes: u64) {
        self.bytes_forwarded.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Copy the current values
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            reservations_accepted: self.reservations_accepted.load(Ordering::Relaxed),
            reservations_refused: self.reservations_refused.load(Ordering::Relaxed),
            circuits_opened: self.circuits_opened.load(Ordering::Relaxed),
            circuits_failed: self.circuits_failed.load(Ordering::Relaxed),
            circuits_active: self.circuits_active.load(Ordering::Relaxed),
            data_limit_closures: self.data_limit_closures.load(Ordering::Relaxed),
            duration_limit_closures: self.duration_limit_closures.load(Ordering::Relaxed),
            bytes_forwarded: self.bytes_forwarded.load(Ordering::Relaxed),
        }
    }
}
