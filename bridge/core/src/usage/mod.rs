//! Token/Usage Optimizer
//!
//! Estimates what a request will cost, keeps an append-only ledger of what
//! each platform actually consumed, and derives rolling-window quota state.
//!
//! ```text
//!   estimate_cost(request) ──▶ TokenEstimate
//!
//!   record_usage(platform, sample)
//!        │
//!        ├─▶ ledger.push(UsageRecord)            (append-only)
//!        ├─▶ recompute window fraction
//!        ├─▶ watch<QuotaBoard>  ──▶ router       (latest state, push)
//!        └─▶ broadcast<QuotaEvent>               (only on level change)
//! ```
//!
//! The board is republished on every insertion, so a decision made after a
//! request's usage was recorded always sees that usage.

mod estimator;
mod quota;

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

pub use estimator::{CostCategory, CostEstimator, EstimatorConfig, TokenEstimate};
pub use quota::{QuotaBoard, QuotaConfig, QuotaEvent, QuotaLevel, QuotaStatus};

use crate::types::{AgentRequest, PlatformId, RequestId, SessionId};

/// Capacity of the quota event broadcast channel
const EVENT_CAPACITY: usize = 64;

// ============================================================================
// Records
// ============================================================================

/// One platform's consumption for one request
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct UsageRecord {
    /// Platform that did the work
    pub platform: PlatformId,
    /// Request the usage belongs to
    pub request_id: RequestId,
    /// Session the request belongs to
    pub session_id: SessionId,
    /// Tokens estimated before dispatch
    pub tokens_estimated: u64,
    /// Tokens the platform reported, if any
    pub tokens_actual: Option<u64>,
    /// Estimated cost in configured currency units
    pub cost_estimate: f64,
    /// When the usage was recorded
    pub timestamp: DateTime<Utc>,
}

impl UsageRecord {
    /// Best known token count
    #[must_use]
    pub fn tokens(&self) -> u64 {
        self.tokens_actual.unwrap_or(self.tokens_estimated)
    }
}

/// Usage reported by the facade after a platform answered
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UsageSample {
    /// Request the usage belongs to
    pub request_id: RequestId,
    /// Session the request belongs to
    pub session_id: SessionId,
    /// Tokens estimated before dispatch
    pub tokens_estimated: u64,
    /// Tokens the platform reported, if any
    pub tokens_actual: Option<u64>,
}

/// Budget and pricing of one platform
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PlatformBudget {
    /// Tokens allowed per rolling window (`None` = unlimited)
    pub quota_tokens: Option<u64>,
    /// Price per 1000 tokens
    pub cost_per_1k_tokens: f64,
    /// Platform-specific warning threshold
    pub warning_threshold: Option<f64>,
    /// Platform-specific critical threshold
    pub critical_threshold: Option<f64>,
}

/// Aggregated usage
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct UsageTotals {
    /// Number of records
    pub records: u64,
    /// Sum of tokens
    pub tokens: u64,
    /// Sum of cost estimates
    pub cost: f64,
}

impl UsageTotals {
    fn add(&mut self, record: &UsageRecord) {
        self.records += 1;
        self.tokens = self.tokens.saturating_add(record.tokens());
        self.cost += record.cost_estimate;
    }
}

/// Lifetime and window usage of one platform
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct PlatformUsage {
    /// Everything ever recorded (monotonic)
    pub lifetime: UsageTotals,
    /// Usage inside the current rolling window
    pub window: UsageTotals,
}

// ============================================================================
// Optimizer
// ============================================================================

struct PlatformLedger {
    budget: PlatformBudget,
    records: VecDeque<UsageRecord>,
    lifetime: UsageTotals,
    level: QuotaLevel,
}

impl PlatformLedger {
    fn new(budget: PlatformBudget) -> Self {
        Self {
            budget,
            records: VecDeque::new(),
            lifetime: UsageTotals::default(),
            level: QuotaLevel::Normal,
        }
    }

    fn window_totals(&self, since: DateTime<Utc>) -> UsageTotals {
        let mut totals = UsageTotals::default();
        for record in self.records.iter().rev() {
            if record.timestamp < since {
                break;
            }
            totals.add(record);
        }
        totals
    }
}

/// Owner of the usage ledger and quota state
pub struct UsageOptimizer {
    estimator: CostEstimator,
    config: QuotaConfig,
    ledgers: RwLock<BTreeMap<PlatformId, PlatformLedger>>,
    board_tx: watch::Sender<QuotaBoard>,
    events_tx: broadcast::Sender<QuotaEvent>,
}

impl UsageOptimizer {
    /// Create an optimizer with no platforms
    #[must_use]
    pub fn new(estimator: EstimatorConfig, config: QuotaConfig) -> Self {
        let (board_tx, _) = watch::channel(QuotaBoard::new());
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            estimator: CostEstimator::new(estimator),
            config,
            ledgers: RwLock::new(BTreeMap::new()),
            board_tx,
            events_tx,
        }
    }

    /// Start tracking `platform` with the given budget
    pub fn register_platform(&self, platform: PlatformId, budget: PlatformBudget) {
        {
            let mut ledgers = self.ledgers.write();
            match ledgers.get_mut(&platform) {
                Some(ledger) => ledger.budget = budget,
                None => {
                    ledgers.insert(platform.clone(), PlatformLedger::new(budget));
                }
            }
        }
        debug!(platform = %platform, "Registered platform budget");
        self.recompute(Utc::now());
    }

    /// Estimate tokens for a request
    #[must_use]
    pub fn estimate_cost(&self, request: &AgentRequest) -> TokenEstimate {
        self.estimator.estimate(request)
    }

    /// Append a usage record and recompute quota state
    pub fn record_usage(&self, platform: &PlatformId, sample: UsageSample) -> UsageRecord {
        self.record_usage_at(platform, sample, Utc::now())
    }

    fn record_usage_at(
        &self,
        platform: &PlatformId,
        sample: UsageSample,
        timestamp: DateTime<Utc>,
    ) -> UsageRecord {
        let record = {
            let mut ledgers = self.ledgers.write();
            let ledger = ledgers
                .entry(platform.clone())
                .or_insert_with(|| PlatformLedger::new(PlatformBudget::default()));

            let tokens = sample.tokens_actual.unwrap_or(sample.tokens_estimated);
            let record = UsageRecord {
                platform: platform.clone(),
                request_id: sample.request_id,
                session_id: sample.session_id,
                tokens_estimated: sample.tokens_estimated,
                tokens_actual: sample.tokens_actual,
                cost_estimate: tokens as f64 / 1000.0 * ledger.budget.cost_per_1k_tokens,
                timestamp,
            };

            ledger.lifetime.add(&record);
            ledger.records.push_back(record.clone());
            while ledger.records.len() > self.config.max_records_per_platform.max(1) {
                ledger.records.pop_front();
            }
            record
        };

        debug!(
            platform = %platform,
            tokens = record.tokens(),
            cost = record.cost_estimate,
            "Recorded usage"
        );
        self.recompute(timestamp);
        record
    }

    /// Re-evaluate window expiry for every platform
    pub fn refresh(&self) {
        self.recompute(Utc::now());
    }

    /// Quota state of `platform` (full if untracked)
    #[must_use]
    pub fn quota_status(&self, platform: &PlatformId) -> QuotaStatus {
        self.board_tx.borrow().get(platform).cloned().unwrap_or_else(|| {
            QuotaStatus::full(
                platform.clone(),
                self.config.warning_threshold,
                self.config.critical_threshold,
            )
        })
    }

    /// Current quota board
    #[must_use]
    pub fn quota_board(&self) -> QuotaBoard {
        self.board_tx.borrow().clone()
    }

    /// Receive every republished quota board
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<QuotaBoard> {
        self.board_tx.subscribe()
    }

    /// Receive quota level changes
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<QuotaEvent> {
        self.events_tx.subscribe()
    }

    /// Retained records for `platform`, oldest first
    #[must_use]
    pub fn records(&self, platform: &PlatformId) -> Vec<UsageRecord> {
        self.ledgers
            .read()
            .get(platform)
            .map(|l| l.records.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Lifetime and window usage of `platform`
    #[must_use]
    pub fn platform_usage(&self, platform: &PlatformId) -> Option<PlatformUsage> {
        let since = Utc::now() - self.window();
        self.ledgers.read().get(platform).map(|ledger| PlatformUsage {
            lifetime: ledger.lifetime,
            window: ledger.window_totals(since),
        })
    }

    /// Usage of one session across all platforms (retained records only)
    #[must_use]
    pub fn session_usage(&self, session: &SessionId) -> UsageTotals {
        let mut totals = UsageTotals::default();
        for ledger in self.ledgers.read().values() {
            for record in ledger.records.iter().filter(|r| &r.session_id == session) {
                totals.add(record);
            }
        }
        totals
    }

    fn window(&self) -> ChronoDuration {
        // Capped at ten years
        let secs = self.config.window_secs.min(315_360_000);
        ChronoDuration::seconds(i64::try_from(secs).unwrap_or(315_360_000))
    }

    fn recompute(&self, now: DateTime<Utc>) {
        let since = now - self.window();
        let mut board = QuotaBoard::new();
        let mut events = Vec::new();

        {
            let mut ledgers = self.ledgers.write();
            for (platform, ledger) in ledgers.iter_mut() {
                let warning = ledger
                    .budget
                    .warning_threshold
                    .unwrap_or(self.config.warning_threshold);
                let critical = ledger
                    .budget
                    .critical_threshold
                    .unwrap_or(self.config.critical_threshold);

                let remaining = match ledger.budget.quota_tokens {
                    Some(budget) if budget > 0 => {
                        let used = ledger.window_totals(since).tokens;
                        (1.0 - used as f64 / budget as f64).clamp(0.0, 1.0)
                    }
                    Some(_) => 0.0,
                    None => 1.0,
                };

                let status = QuotaStatus {
                    platform: platform.clone(),
                    remaining_fraction: remaining,
                    warning_threshold: warning,
                    critical_threshold: critical,
                };
                let level = status.level();
                if level != ledger.level {
                    events.push(QuotaEvent {
                        platform: platform.clone(),
                        previous: ledger.level,
                        level,
                        remaining_fraction: remaining,
                    });
                    ledger.level = level;
                }
                board.insert(status);
            }

            // Published under the ledger lock so boards go out in ledger order
            self.board_tx.send_replace(board);
        }

        for event in events {
            match event.level {
                QuotaLevel::Critical => warn!(
                    platform = %event.platform,
                    remaining = event.remaining_fraction,
                    "Quota critical"
                ),
                QuotaLevel::Warning => warn!(
                    platform = %event.platform,
                    remaining = event.remaining_fraction,
                    "Quota warning"
                ),
                QuotaLevel::Normal => info!(
                    platform = %event.platform,
                    remaining = event.remaining_fraction,
                    "Quota recovered"
                ),
            }
            // No subscribers is fine
            let _ = self.events_tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample(tokens: u64) -> UsageSample {
        UsageSample {
            request_id: RequestId::new("r"),
            session_id: SessionId::new("s"),
            tokens_estimated: tokens,
            tokens_actual: None,
        }
    }

    fn optimizer_with(platform: &str, quota_tokens: u64) -> UsageOptimizer {
        let optimizer = UsageOptimizer::new(EstimatorConfig::default(), QuotaConfig::default());
        optimizer.register_platform(
            PlatformId::from(platform),
            PlatformBudget {
                quota_tokens: Some(quota_tokens),
                cost_per_1k_tokens: 2.0,
                ..PlatformBudget::default()
            },
        );
        optimizer
    }

    #[test]
    fn test_record_usage_appends_and_prices() {
        let optimizer = optimizer_with("alpha", 10_000);
        let alpha = PlatformId::from("alpha");

        let record = optimizer.record_usage(&alpha, sample(500));
        assert_eq!(record.tokens(), 500);
        assert!((record.cost_estimate - 1.0).abs() < 1e-9);

        let actual = optimizer.record_usage(
            &alpha,
            UsageSample {
                tokens_actual: Some(1_000),
                ..sample(10)
            },
        );
        assert_eq!(actual.tokens(), 1_000);

        assert_eq!(optimizer.records(&alpha).len(), 2);
        let usage = optimizer.platform_usage(&alpha).unwrap();
        assert_eq!(usage.lifetime.records, 2);
        assert_eq!(usage.lifetime.tokens, 1_500);
        assert_eq!(usage.window.tokens, 1_500);
    }

    #[test]
    fn test_quota_fraction_recomputed_on_insert() {
        let optimizer = optimizer_with("alpha", 1_000);
        let alpha = PlatformId::from("alpha");
        assert!((optimizer.quota_status(&alpha).remaining_fraction - 1.0).abs() < 1e-9);

        optimizer.record_usage(&alpha, sample(250));
        assert!((optimizer.quota_status(&alpha).remaining_fraction - 0.75).abs() < 1e-9);

        optimizer.record_usage(&alpha, sample(2_000));
        assert!(optimizer.quota_status(&alpha).remaining_fraction.abs() < 1e-9);
        assert!(optimizer.quota_status(&alpha).is_critical());
    }

    #[test]
    fn test_unlimited_platform_stays_full() {
        let optimizer = UsageOptimizer::new(EstimatorConfig::default(), QuotaConfig::default());
        let beta = PlatformId::from("beta");
        optimizer.record_usage(&beta, sample(1_000_000));
        assert!((optimizer.quota_status(&beta).remaining_fraction - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_threshold_crossings_emit_events() {
        let optimizer = optimizer_with("alpha", 1_000);
        let alpha = PlatformId::from("alpha");
        let mut events = optimizer.events();

        optimizer.record_usage(&alpha, sample(100));
        assert!(events.try_recv().is_err());

        optimizer.record_usage(&alpha, sample(750));
        let warning = events.try_recv().unwrap();
        assert_eq!(warning.previous, QuotaLevel::Normal);
        assert_eq!(warning.level, QuotaLevel::Warning);

        optimizer.record_usage(&alpha, sample(120));
        let critical = events.try_recv().unwrap();
        assert_eq!(critical.level, QuotaLevel::Critical);
    }

    #[test]
    fn test_board_is_pushed_to_subscribers() {
        let optimizer = optimizer_with("alpha", 1_000);
        let alpha = PlatformId::from("alpha");
        let mut board = optimizer.subscribe();
        board.mark_unchanged();

        optimizer.record_usage(&alpha, sample(500));
        assert!(board.has_changed().unwrap());
        assert!((board.borrow_and_update().remaining(&alpha) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_window_expiry() {
        let optimizer = optimizer_with("alpha", 1_000);
        let alpha = PlatformId::from("alpha");
        let old = Utc::now() - ChronoDuration::hours(2);
        optimizer.record_usage_at(&alpha, sample(900), old);

        optimizer.refresh();
        assert!((optimizer.quota_status(&alpha).remaining_fraction - 1.0).abs() < 1e-9);
        // Lifetime totals keep the expired record
        assert_eq!(optimizer.platform_usage(&alpha).unwrap().lifetime.tokens, 900);
    }

    #[test]
    fn test_lifetime_counters_survive_retention_cap() {
        let optimizer = UsageOptimizer::new(
            EstimatorConfig::default(),
            QuotaConfig {
                max_records_per_platform: 3,
                ..QuotaConfig::default()
            },
        );
        let alpha = PlatformId::from("alpha");
        let mut last_cost = 0.0;
        for i in 1..=10 {
            optimizer.record_usage(&alpha, sample(i * 10));
            let lifetime = optimizer.platform_usage(&alpha).unwrap().lifetime;
            assert_eq!(lifetime.records, i);
            assert!(lifetime.cost >= last_cost);
            last_cost = lifetime.cost;
        }
        assert_eq!(optimizer.records(&alpha).len(), 3);
    }

    #[test]
    fn test_session_usage() {
        let optimizer = UsageOptimizer::new(EstimatorConfig::default(), QuotaConfig::default());
        let alpha = PlatformId::from("alpha");
        let beta = PlatformId::from("beta");
        optimizer.record_usage(&alpha, sample(10));
        optimizer.record_usage(&beta, sample(20));
        optimizer.record_usage(
            &beta,
            UsageSample {
                session_id: SessionId::new("other"),
                ..sample(40)
            },
        );

        let totals = optimizer.session_usage(&SessionId::new("s"));
        assert_eq!(totals.records, 2);
        assert_eq!(totals.tokens, 30);
    }
}
