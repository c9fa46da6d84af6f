//! Queue and admin configuration types.

use std::time::Duration;

use serde::Deserialize;

/// Receive wait used when none (or zero) is configured.
pub const DEFAULT_RECEIVE_TIMEOUT_SECS: u64 = 30;

/// Reliable queue configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// How long a transactional claim stays invisible to other consumers.
    pub lease_timeout_secs: u64,
    /// Upper bound on a blocking receive.
    pub receive_timeout_secs: u64,
    /// Lease sweep cadence.
    pub sweep_interval_secs: u64,
    /// Start a lease sweeper for the receive address on `init`.
    pub schedule_lease_sweep: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease_timeout_secs: 60,
            receive_timeout_secs: DEFAULT_RECEIVE_TIMEOUT_SECS,
            sweep_interval_secs: 30,
            schedule_lease_sweep: true,
        }
    }
}

impl QueueConfig {
    pub fn lease_timeout(&self) -> Duration {
        Duration::from_secs(self.lease_timeout_secs)
    }

    pub fn receive_timeout(&self) -> Duration {
        match self.receive_timeout_secs {
            0 => Duration::from_secs(DEFAULT_RECEIVE_TIMEOUT_SECS),
            secs => Duration::from_secs(secs),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Queue admin configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Lifetime of the bulk-requeue lock.
    pub lock_ttl_secs: u64,
    /// How long to keep trying for the lock before giving up.
    pub lock_wait_secs: u64,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            lock_ttl_secs: 60,
            lock_wait_secs: 60,
        }
    }
}

impl AdminConfig {
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_secs(self.lock_wait_secs)
    }
}
