//! Quota state
//!
//! A platform's quota is the fraction of its rolling-window token budget that
//! remains. Two thresholds split it into levels:
//!
//! ```text
//!  1.0 ─────────────── warning ─────────── critical ──── 0.0
//!        Normal                Warning           Critical
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::PlatformId;

/// Global quota parameters
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Remaining fraction below which a platform is in Warning
    pub warning_threshold: f64,

    /// Remaining fraction below which a platform is Critical
    pub critical_threshold: f64,

    /// Length of the rolling usage window
    pub window_secs: u64,

    /// Usage records retained per platform
    pub max_records_per_platform: usize,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            warning_threshold: 0.2,
            critical_threshold: 0.05,
            window_secs: 3_600, // 1h
            max_records_per_platform: 10_000,
        }
    }
}

/// Quota level derived from the remaining fraction
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaLevel {
    /// Plenty of budget left
    #[default]
    Normal,
    /// Below the warning threshold
    Warning,
    /// Below the critical threshold
    Critical,
}

impl fmt::Display for QuotaLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Warning => write!(f, "warning"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Quota state of one platform
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuotaStatus {
    /// Platform this status belongs to
    pub platform: PlatformId,
    /// Remaining fraction of the window budget, in [0, 1]
    pub remaining_fraction: f64,
    /// Warning threshold for this platform
    pub warning_threshold: f64,
    /// Critical threshold for this platform
    pub critical_threshold: f64,
}

impl QuotaStatus {
    /// Full quota with the given thresholds
    #[must_use]
    pub fn full(platform: PlatformId, warning_threshold: f64, critical_threshold: f64) -> Self {
        Self {
            platform,
            remaining_fraction: 1.0,
            warning_threshold,
            critical_threshold,
        }
    }

    /// Level for the current remaining fraction
    #[must_use]
    pub fn level(&self) -> QuotaLevel {
        if self.remaining_fraction < self.critical_threshold {
            QuotaLevel::Critical
        } else if self.remaining_fraction < self.warning_threshold {
            QuotaLevel::Warning
        } else {
            QuotaLevel::Normal
        }
    }

    /// Whether the platform must not be selected alone
    #[must_use]
    pub fn is_critical(&self) -> bool {
        self.level() == QuotaLevel::Critical
    }
}

/// A quota level change
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QuotaEvent {
    /// Platform whose level changed
    pub platform: PlatformId,
    /// Level before the change
    pub previous: QuotaLevel,
    /// Level after the change
    pub level: QuotaLevel,
    /// Remaining fraction after the change
    pub remaining_fraction: f64,
}

/// Snapshot of every platform's quota, as read by the router
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct QuotaBoard {
    statuses: BTreeMap<PlatformId, QuotaStatus>,
}

impl QuotaBoard {
    /// Empty board; every platform reads as full
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a platform's status
    pub fn insert(&mut self, status: QuotaStatus) {
        self.statuses.insert(status.platform.clone(), status);
    }

    /// Builder-style [`insert`](Self::insert)
    #[must_use]
    pub fn with(mut self, status: QuotaStatus) -> Self {
        self.insert(status);
        self
    }

    /// Status of `platform`, if tracked
    #[must_use]
    pub fn get(&self, platform: &PlatformId) -> Option<&QuotaStatus> {
        self.statuses.get(platform)
    }

    /// Remaining fraction of `platform` (1.0 when untracked)
    #[must_use]
    pub fn remaining(&self, platform: &PlatformId) -> f64 {
        self.get(platform).map_or(1.0, |s| s.remaining_fraction)
    }

    /// Level of `platform` (Normal when untracked)
    #[must_use]
    pub fn level(&self, platform: &PlatformId) -> QuotaLevel {
        self.get(platform).map_or(QuotaLevel::Normal, QuotaStatus::level)
    }

    /// Iterate over tracked statuses in platform order
    pub fn iter(&self) -> impl Iterator<Item = &QuotaStatus> {
        self.statuses.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(remaining: f64) -> QuotaStatus {
        QuotaStatus {
            platform: PlatformId::from("alpha"),
            remaining_fraction: remaining,
            warning_threshold: 0.2,
            critical_threshold: 0.05,
        }
    }

    #[test]
    fn test_levels() {
        assert_eq!(status(1.0).level(), QuotaLevel::Normal);
        assert_eq!(status(0.2).level(), QuotaLevel::Normal);
        assert_eq!(status(0.19).level(), QuotaLevel::Warning);
        assert_eq!(status(0.05).level(), QuotaLevel::Warning);
        assert_eq!(status(0.049).level(), QuotaLevel::Critical);
        assert!(status(0.0).is_critical());
    }

    #[test]
    fn test_board_defaults_to_full() {
        let board = QuotaBoard::new().with(status(0.5));
        assert!((board.remaining(&PlatformId::from("alpha")) - 0.5).abs() < f64::EPSILON);
        assert!((board.remaining(&PlatformId::from("beta")) - 1.0).abs() < f64::EPSILON);
        assert_eq!(board.level(&PlatformId::from("beta")), QuotaLevel::Normal);
    }
}
