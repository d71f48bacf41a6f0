//! Per-platform circuit breaker
//!
//! Connection-level health is the supervisor's job. The breaker tracks
//! something narrower: consecutive request failures on a platform whose
//! connection still looks fine.
//!
//! ```text
//! +--------+   N consecutive errors   +------+   cooldown elapsed   +-----------+
//! | Closed | -----------------------> | Open | -------------------> | Half-Open |
//! +--------+                          +------+                      +-----------+
//!     ^                                   ^       probe fails             |
//!     |                                   +-------------------------------+
//!     |                  probe succeeds                                   |
//!     +-------------------------------------------------------------------+
//! ```
//!
//! Half-Open admits exactly one probe request at a time.

use std::collections::BTreeSet;
use std::fmt;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::PlatformId;

/// Breaker parameters
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive errors that open the circuit
    pub failure_threshold: u32,

    /// Time an open circuit waits before admitting a probe
    pub cooldown_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_ms: 30_000,
        }
    }
}

impl CircuitBreakerConfig {
    /// Cooldown as a Duration
    #[must_use]
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// Circuit breaker state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Requests flow normally
    #[default]
    Closed,
    /// Requests are refused until the cooldown elapses
    Open,
    /// One probe request decides whether to close or reopen
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Point-in-time view of one breaker
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    /// Current state
    pub state: CircuitState,
    /// Consecutive errors since the last success
    pub consecutive_failures: u32,
    /// Times the circuit has opened
    pub times_opened: u64,
}

#[derive(Debug, Default)]
struct Breaker {
    state: CircuitState,
    consecutive_failures: u32,
    times_opened: u64,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl Breaker {
    fn cooled_down(&self, cooldown: Duration) -> bool {
        self.opened_at.map_or(true, |at| at.elapsed() >= cooldown)
    }

    fn refuses(&self, cooldown: Duration) -> bool {
        match self.state {
            CircuitState::Closed => false,
            CircuitState::Open => !self.cooled_down(cooldown),
            CircuitState::HalfOpen => self.probe_in_flight,
        }
    }

    fn snapshot(&self) -> CircuitSnapshot {
        CircuitSnapshot {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            times_opened: self.times_opened,
        }
    }
}

/// Breakers for every platform
#[derive(Debug)]
pub struct CircuitBreakers {
    config: CircuitBreakerConfig,
    breakers: DashMap<PlatformId, Mutex<Breaker>>,
}

impl CircuitBreakers {
    /// Create an empty registry
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    /// Platforms that would refuse a request right now
    #[must_use]
    pub fn open_circuits(&self) -> BTreeSet<PlatformId> {
        let cooldown = self.config.cooldown();
        self.breakers
            .iter()
            .filter(|entry| entry.value().lock().refuses(cooldown))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Ask to send a request to `platform`
    ///
    /// Returns false while the circuit is open, or while a half-open probe is
    /// already in flight. An open circuit whose cooldown has elapsed moves to
    /// Half-Open and the caller's request becomes the probe.
    pub fn try_acquire(&self, platform: &PlatformId) -> bool {
        let cooldown = self.config.cooldown();
        let entry = self.breakers.entry(platform.clone()).or_default();
        let mut breaker = entry.lock();

        match breaker.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if !breaker.cooled_down(cooldown) {
                    return false;
                }
                breaker.state = CircuitState::HalfOpen;
                breaker.probe_in_flight = true;
                info!(platform = %platform, "Circuit half-open, sending probe");
                true
            }
            CircuitState::HalfOpen => {
                if breaker.probe_in_flight {
                    false
                } else {
                    breaker.probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Record a successful request
    pub fn record_success(&self, platform: &PlatformId) {
        let entry = self.breakers.entry(platform.clone()).or_default();
        let mut breaker = entry.lock();
        breaker.consecutive_failures = 0;
        breaker.probe_in_flight = false;
        if breaker.state != CircuitState::Closed {
            breaker.state = CircuitState::Closed;
            breaker.opened_at = None;
            info!(platform = %platform, "Circuit closed");
        }
    }

    /// Record a failed request
    pub fn record_failure(&self, platform: &PlatformId) {
        let entry = self.breakers.entry(platform.clone()).or_default();
        let mut breaker = entry.lock();
        breaker.consecutive_failures = breaker.consecutive_failures.saturating_add(1);
        breaker.probe_in_flight = false;

        let trip = match breaker.state {
            CircuitState::Closed => {
                breaker.consecutive_failures >= self.config.failure_threshold.max(1)
            }
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };
        if trip {
            breaker.state = CircuitState::Open;
            breaker.opened_at = Some(Instant::now());
            breaker.times_opened += 1;
            warn!(
                platform = %platform,
                consecutive_failures = breaker.consecutive_failures,
                cooldown_ms = self.config.cooldown_ms,
                "Circuit opened"
            );
        }
    }

    /// Give back a probe whose request ended without a verdict
    pub fn release(&self, platform: &PlatformId) {
        if let Some(entry) = self.breakers.get(platform) {
            entry.lock().probe_in_flight = false;
        }
    }

    /// Current state of `platform`'s breaker
    #[must_use]
    pub fn state(&self, platform: &PlatformId) -> CircuitState {
        self.breakers
            .get(platform)
            .map_or(CircuitState::Closed, |entry| entry.lock().state)
    }

    /// Snapshot of every breaker that has seen traffic
    #[must_use]
    pub fn snapshot(&self) -> Vec<(PlatformId, CircuitSnapshot)> {
        let mut all: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().lock().snapshot()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breakers(threshold: u32, cooldown_ms: u64) -> CircuitBreakers {
        CircuitBreakers::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            cooldown_ms,
        })
    }

    #[test]
    fn test_opens_after_threshold() {
        let cb = breakers(3, 60_000);
        let alpha = PlatformId::from("alpha");

        cb.record_failure(&alpha);
        cb.record_failure(&alpha);
        assert_eq!(cb.state(&alpha), CircuitState::Closed);
        assert!(cb.try_acquire(&alpha));

        cb.record_failure(&alpha);
        assert_eq!(cb.state(&alpha), CircuitState::Open);
        assert!(!cb.try_acquire(&alpha));
        assert!(cb.open_circuits().contains(&alpha));
    }

    #[test]
    fn test_success_resets_count() {
        let cb = breakers(2, 60_000);
        let alpha = PlatformId::from("alpha");

        cb.record_failure(&alpha);
        cb.record_success(&alpha);
        cb.record_failure(&alpha);
        assert_eq!(cb.state(&alpha), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_admits_single_probe() {
        let cb = breakers(1, 0);
        let alpha = PlatformId::from("alpha");

        cb.record_failure(&alpha);
        assert_eq!(cb.state(&alpha), CircuitState::Open);
        // Cooldown of zero: eligible again immediately
        assert!(cb.open_circuits().is_empty());

        assert!(cb.try_acquire(&alpha));
        assert_eq!(cb.state(&alpha), CircuitState::HalfOpen);
        assert!(!cb.try_acquire(&alpha));
        assert!(cb.open_circuits().contains(&alpha));

        cb.record_success(&alpha);
        assert_eq!(cb.state(&alpha), CircuitState::Closed);
        assert!(cb.try_acquire(&alpha));
    }

    #[test]
    fn test_failed_probe_reopens() {
        let cb = breakers(1, 0);
        let alpha = PlatformId::from("alpha");

        cb.record_failure(&alpha);
        assert!(cb.try_acquire(&alpha));
        cb.record_failure(&alpha);

        assert_eq!(cb.state(&alpha), CircuitState::Open);
        let snapshot = cb.snapshot();
        assert_eq!(snapshot[0].1.times_opened, 2);
    }

    #[test]
    fn test_release_returns_probe() {
        let cb = breakers(1, 0);
        let alpha = PlatformId::from("alpha");

        cb.record_failure(&alpha);
        assert!(cb.try_acquire(&alpha));
        cb.release(&alpha);
        assert_eq!(cb.state(&alpha), CircuitState::HalfOpen);
        assert!(cb.try_acquire(&alpha));
    }

    #[test]
    fn test_unknown_platform_is_closed() {
        let cb = breakers(5, 30_000);
        assert_eq!(cb.state(&PlatformId::from("nobody")), CircuitState::Closed);
        assert!(cb.open_circuits().is_empty());
    }
}
