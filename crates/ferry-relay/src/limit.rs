//! Circuit resource limits and their accounting.

use crate::protocol::WireLimit;
use ferry_core::ConnectionLimits;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Byte and duration budget for a relayed circuit
///
/// An unset field means no bound.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Limit {
    /// Maximum bytes forwarded, counted across both directions
    pub data: Option<u64>,
    /// Maximum circuit lifetime
    pub duration: Option<Duration>,
}

impl Limit {
    /// No bounds
    #[must_use]
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// Whether neither bound is set
    #[must_use]
    pub fn is_unlimited(&self) -> bool {
        self.data.is_none() && self.duration.is_none()
    }

    /// Wire form; durations saturate at `u32::MAX` milliseconds
    #[must_use]
    pub fn to_wire(&self) -> Option<WireLimit> {
        if self.is_unlimited() {
            return None;
        }
        Some(WireLimit {
            duration: self
                .duration
                .map(|d| u32::try_from(d.as_millis()).unwrap_or(u32::MAX)),
            data: self.data,
        })
    }

    /// Parse the wire form
    #[must_use]
    pub fn from_wire(wire: WireLimit) -> Self {
        Self {
            data: wire.data,
            duration: wire.duration.map(|ms| Duration::from_millis(u64::from(ms))),
        }
    }

    /// Limits as attached to a transient connection
    #[must_use]
    pub fn to_connection_limits(&self) -> ConnectionLimits {
        ConnectionLimits {
            data: self.data,
            duration: self.duration,
        }
    }
}

/// Outcome of offering a chunk to the tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admit {
    /// Forward the chunk; budget remains
    Forward,
    /// Forward the chunk, then tear the circuit down
    Final,
    /// Budget already spent; do not forward
    Refused,
}

/// Shared byte counter and clock for one relayed circuit
///
/// Both copy directions call [`LimitTracker::admit`] for every chunk. A chunk
/// that crosses the byte limit is still forwarded, so at most one chunk
/// overshoots the limit in total.
#[derive(Debug)]
pub struct LimitTracker {
    limit: Limit,
    transferred: AtomicU64,
    started_at: Instant,
}

impl LimitTracker {
    /// Start tracking `limit` now
    #[must_use]
    pub fn new(limit: Limit) -> Self {
        Self {
            limit,
            transferred: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    /// The limit being enforced
    #[must_use]
    pub fn limit(&self) -> Limit {
        self.limit
    }

    /// Account for a chunk of `bytes` and decide whether it may go through
    pub fn admit(&self, bytes: u64) -> Admit {
        let before = self.transferred.fetch_add(bytes, Ordering::AcqRel);
        match self.limit.data {
            None => Admit::Forward,
            Some(max) if before >= max => Admit::Refused,
            Some(max) if before.saturating_add(bytes) >= max => Admit::Final,
            Some(_) => Admit::Forward,
        }
    }

    /// Bytes offered so far, including any refused chunk
    #[must_use]
    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::Acquire)
    }

    /// Whether the byte budget is spent
    #[must_use]
    pub fn data_exceeded(&self) -> bool {
        self.limit
            .data
            .is_some_and(|max| self.transferred() >= max)
    }

    /// Instant at which the duration limit expires
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.limit.duration.map(|d| self.started_at + d)
    }

    /// Time since tracking began
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}
