//! Relay configuration.
//!
//! Durations are kept as integer seconds or milliseconds so the structs map
//! cleanly onto TOML; accessor methods return [`Duration`]s.

use crate::error::{RelayError, Result};
use crate::limit::Limit;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Reservation policy of a relay server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationConfig {
    /// Maximum concurrent reservations
    #[serde(default = "default_max_reservations")]
    pub max_reservations: usize,

    /// Reservation lifetime in seconds
    #[serde(default = "default_reservation_ttl_secs")]
    pub reservation_ttl_secs: u64,

    /// Interval between expired-reservation sweeps, in milliseconds
    #[serde(default = "default_clear_interval_ms")]
    pub clear_interval_ms: u64,

    /// Default byte limit per circuit (unset = unlimited)
    #[serde(default = "default_data_limit")]
    pub default_data_limit: Option<u64>,

    /// Default circuit duration limit in milliseconds (unset = unlimited)
    #[serde(default = "default_duration_limit_ms")]
    pub default_duration_limit_ms: Option<u64>,

    /// Apply the default limits to circuits that negotiated none
    #[serde(default = "default_true")]
    pub apply_default_limit: bool,
}

impl Default for ReservationConfig {
    fn default() -> Self {
        Self {
            max_reservations: default_max_reservations(),
            reservation_ttl_secs: default_reservation_ttl_secs(),
            clear_interval_ms: default_clear_interval_ms(),
            default_data_limit: default_data_limit(),
            default_duration_limit_ms: default_duration_limit_ms(),
            apply_default_limit: true,
        }
    }
}

impl ReservationConfig {
    /// Reservation lifetime
    #[must_use]
    pub fn reservation_ttl(&self) -> Duration {
        Duration::from_secs(self.reservation_ttl_secs)
    }

    /// Sweep interval
    #[must_use]
    pub fn clear_interval(&self) -> Duration {
        Duration::from_millis(self.clear_interval_ms)
    }

    /// The relay's default limit
    #[must_use]
    pub fn default_limit(&self) -> Limit {
        Limit {
            data: self.default_data_limit,
            duration: self.default_duration_limit_ms.map(Duration::from_millis),
        }
    }
}

/// Relay server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayServerConfig {
    /// Reservation policy
    #[serde(default)]
    pub reservations: ReservationConfig,

    /// Deadline for HOP and STOP handshakes, in milliseconds
    #[serde(default = "default_hop_timeout_ms")]
    pub hop_timeout_ms: u64,

    /// Maximum circuits bridged at once
    #[serde(default = "default_max_circuits")]
    pub max_circuits: usize,

    /// Let peers without a reservation open circuits
    #[serde(default = "default_true")]
    pub allow_connect_without_reservation: bool,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            reservations: ReservationConfig::default(),
            hop_timeout_ms: default_hop_timeout_ms(),
            max_circuits: default_max_circuits(),
            allow_connect_without_reservation: true,
        }
    }
}

impl RelayServerConfig {
    /// Handshake deadline
    #[must_use]
    pub fn hop_timeout(&self) -> Duration {
        Duration::from_millis(self.hop_timeout_ms)
    }

    /// Check that the configuration is usable
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Config`] naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.reservations.max_reservations == 0 {
            return Err(RelayError::Config(
                "reservations.max_reservations must be at least 1".into(),
            ));
        }
        if self.reservations.reservation_ttl_secs == 0 {
            return Err(RelayError::Config(
                "reservations.reservation_ttl_secs must be positive".into(),
            ));
        }
        if self.reservations.clear_interval_ms == 0 {
            return Err(RelayError::Config(
                "reservations.clear_interval_ms must be positive".into(),
            ));
        }
        if self.reservations.default_data_limit == Some(0) {
            return Err(RelayError::Config(
                "reservations.default_data_limit must be positive when set".into(),
            ));
        }
        if self.reservations.default_duration_limit_ms == Some(0) {
            return Err(RelayError::Config(
                "reservations.default_duration_limit_ms must be positive when set".into(),
            ));
        }
        if self.hop_timeout_ms == 0 {
            return Err(RelayError::Config("hop_timeout_ms must be positive".into()));
        }
        if self.max_circuits == 0 {
            return Err(RelayError::Config("max_circuits must be at least 1".into()));
        }
        Ok(())
    }
}

/// Relay client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayClientConfig {
    /// Number of relays to discover and reserve automatically
    #[serde(default)]
    pub discover_relays: usize,

    /// Refresh a reservation this many seconds before it expires
    #[serde(default = "default_refresh_margin_secs")]
    pub reservation_refresh_margin_secs: u64,

    /// Deadline for RESERVE, CONNECT and STOP exchanges, in milliseconds
    #[serde(default = "default_hop_timeout_ms")]
    pub stop_timeout_ms: u64,
}

impl Default for RelayClientConfig {
    fn default() -> Self {
        Self {
            discover_relays: 0,
            reservation_refresh_margin_secs: default_refresh_margin_secs(),
            stop_timeout_ms: default_hop_timeout_ms(),
        }
    }
}

impl RelayClientConfig {
    /// Client configuration discovering `count` relays
    #[must_use]
    pub fn discover(count: usize) -> Self {
        Self {
            discover_relays: count,
            ..Self::default()
        }
    }

    /// Refresh margin
    #[must_use]
    pub fn refresh_margin(&self) -> Duration {
        Duration::from_secs(self.reservation_refresh_margin_secs)
    }

    /// Exchange deadline
    #[must_use]
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    /// Check that the configuration is usable
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Config`] naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.stop_timeout_ms == 0 {
            return Err(RelayError::Config("stop_timeout_ms must be positive".into()));
        }
        Ok(())
    }
}

fn default_max_reservations() -> usize {
    15
}

fn default_reservation_ttl_secs() -> u64 {
    2 * 60 * 60
}

fn default_clear_interval_ms() -> u64 {
    300_000
}

#[allow(clippy::unnecessary_wraps)]
fn default_data_limit() -> Option<u64> {
    Some(1 << 17)
}

#[allow(clippy::unnecessary_wraps)]
fn default_duration_limit_ms() -> Option<u64> {
    Some(120_000)
}

fn default_hop_timeout_ms() -> u64 {
    30_000
}

fn default_max_circuits() -> usize {
    64
}

fn default_refresh_margin_secs() -> u64 {
    5 * 60
}

fn default_true() -> bool {
    true
}
