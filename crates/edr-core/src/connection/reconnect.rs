//! Reconnection policy and the supervisor loop that applies it.

use super::{ConnectionManager, Transport};
use crate::logging::{event_names, Stage};
use crate::signal::Shutdown;
use edr_config::CollectorSettings;
use std::time::Duration;
use tracing::{debug, warn};

/// Fixed-interval bursts separated by a cooldown, retried forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub interval: Duration,
    /// Attempts per burst.
    pub max_retries: u32,
    pub cooldown: Duration,
}

impl ReconnectPolicy {
    pub fn from_settings(settings: &CollectorSettings) -> Self {
        Self {
            interval: settings.reconnect_interval(),
            max_retries: settings.max_retries.max(1),
            cooldown: settings.retry_cooldown(),
        }
    }

    /// Whether `failures` consecutive failures complete a burst.
    pub fn burst_exhausted(&self, failures: u32) -> bool {
        failures > 0 && failures % self.max_retries.max(1) == 0
    }

    /// Wait before the next attempt after `failures` consecutive failures.
    pub fn delay_after(&self, failures: u32) -> Duration {
        if self.burst_exhausted(failures) {
            self.cooldown
        } else {
            self.interval
        }
    }
}

/// Keep `manager` connected until `shutdown` fires.
///
/// The first attempt is immediate. While connected the loop re-checks once
/// per interval so a connection lost by the sender is noticed.
pub fn run_reconnect_loop<T: Transport>(
    manager: &ConnectionManager<T>,
    policy: &ReconnectPolicy,
    shutdown: &Shutdown,
) {
    let mut failures: u32 = 0;
    while !shutdown.is_triggered() {
        if manager.is_connected() {
            shutdown.wait_timeout(policy.interval);
            continue;
        }
        if manager.connect() {
            failures = 0;
            continue;
        }

        failures = failures.saturating_add(1);
        let delay = policy.delay_after(failures);
        if policy.burst_exhausted(failures) {
            warn!(
                event = event_names::CONN_COOLDOWN,
                stage = %Stage::Connect,
                failures,
                cooldown_secs = delay.as_secs(),
                "collector unreachable, cooling down"
            );
        } else {
            debug!(failures, retry_in_ms = delay.as_millis() as u64, "reconnect scheduled");
        }
        shutdown.wait_timeout(delay);
    }
}
