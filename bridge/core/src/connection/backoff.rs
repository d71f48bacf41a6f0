//! Reconnection backoff

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential backoff parameters for reconnecting a degraded platform
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay before the first reconnection attempt
    pub base_ms: u64,

    /// Multiplier applied per attempt
    pub factor: f64,

    /// Upper bound on the delay (before jitter)
    pub max_ms: u64,

    /// Symmetric jitter fraction (0.2 = ±20%)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 1_000,  // 1s
            factor: 2.0,
            max_ms: 30_000, // 30s
            jitter: 0.2,
        }
    }
}

impl BackoffConfig {
    /// Backoff without jitter, for deterministic tests
    #[must_use]
    pub fn fixed(base_ms: u64) -> Self {
        Self {
            base_ms,
            factor: 1.0,
            max_ms: base_ms,
            jitter: 0.0,
        }
    }

    /// Delay before attempt N (0-indexed), capped, before jitter
    #[must_use]
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = self.base_ms as f64 * self.factor.powi(exponent);
        Duration::from_millis(raw.min(self.max_ms as f64) as u64)
    }

    /// Delay before attempt N with jitter applied
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.apply_jitter(self.nominal_delay(attempt), rand::random::<f64>())
    }

    /// Scale `nominal` by a factor in `[1 - jitter, 1 + jitter]`
    ///
    /// `sample` is a uniform value in `[0, 1)`.
    #[must_use]
    pub fn apply_jitter(&self, nominal: Duration, sample: f64) -> Duration {
        if self.jitter <= 0.0 {
            return nominal;
        }
        let scale = 1.0 + self.jitter * (sample * 2.0 - 1.0);
        Duration::from_millis((nominal.as_millis() as f64 * scale).max(0.0) as u64)
    }
}
