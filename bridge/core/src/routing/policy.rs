//! Routing Policy
//!
//! The decision function of the bridge. Given a request, its profile, quota
//! state and connection state, pick a target. No I/O, no clocks, no
//! randomness: the same inputs always produce the same decision.
//!
//! # Decision Flow
//!
//! ```text
//! 1. eligible = Connected platforms whose circuit is closed
//! 2. none eligible                        → Fallback
//! 3. score each eligible platform:
//!      w1·tokenCost + w2·complexity + w3·agentPref + w4·typePref + w5·quotaPenalty
//! 4. rank by score, ties by configured priority order
//! 5. top = best platform that is not quota-critical   (none → Fallback)
//! 6. |top − runner-up| < closeness and complexity > redundancy
//!                                         → Hybrid(top, runner-up)
//!    otherwise                            → Single(top)
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use super::profile::{RequestProfile, RequestType};
use crate::connection::ConnectionStatus;
use crate::types::{Agent, AgentRequest, PlatformId};
use crate::usage::{QuotaBoard, QuotaLevel};

/// Tolerance for score comparisons
const EPSILON: f64 = 1e-9;

// ============================================================================
// Configuration
// ============================================================================

/// Weights of the five scoring terms
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    /// w1: token cost factor
    pub token_cost: f64,
    /// w2: complexity factor
    pub complexity: f64,
    /// w3: agent preference
    pub agent_preference: f64,
    /// w4: request type preference
    pub request_type: f64,
    /// w5: quota penalty (multiplies a non-positive term)
    pub quota_penalty: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            token_cost: 1.0,
            complexity: 1.0,
            agent_preference: 1.0,
            request_type: 0.5,
            quota_penalty: 10.0,
        }
    }
}

/// Static processing characteristics of a platform
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformProfile {
    /// Largest context the platform handles comfortably, in tokens
    pub capacity_tokens: u64,
    /// Relative reasoning capability in [0, 1]
    pub capability: f64,
}

impl Default for PlatformProfile {
    fn default() -> Self {
        Self {
            capacity_tokens: 100_000,
            capability: 0.5,
        }
    }
}

/// Router configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Scoring weights
    pub weights: ScoringWeights,

    /// Estimated tokens above which token cost is considered high
    pub token_threshold: u64,

    /// Complexity above which complexity is considered high
    pub complexity_threshold: f64,

    /// Complexity above which a request benefits from redundancy
    pub redundancy_threshold: f64,

    /// Score gap below which the top two platforms count as equivalent
    pub closeness_threshold: f64,

    /// Tie-break order, most preferred first
    pub platform_priority: Vec<PlatformId>,

    /// Per-agent platform preference, typically in [0, 1]
    pub agent_preference: BTreeMap<Agent, BTreeMap<PlatformId, f64>>,

    /// Per-request-type platform preference, typically in [0, 1]
    pub request_type_preference: BTreeMap<RequestType, BTreeMap<PlatformId, f64>>,

    /// Static platform characteristics
    pub platforms: BTreeMap<PlatformId, PlatformProfile>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            weights: ScoringWeights::default(),
            token_threshold: 1_000,
            complexity_threshold: 0.7,
            redundancy_threshold: 0.7,
            closeness_threshold: 0.05,
            platform_priority: Vec::new(),
            agent_preference: BTreeMap::new(),
            request_type_preference: BTreeMap::new(),
            platforms: BTreeMap::new(),
        }
    }
}

impl RouterConfig {
    /// Set an agent preference
    #[must_use]
    pub fn with_agent_preference(mut self, agent: Agent, platform: &str, weight: f64) -> Self {
        self.agent_preference
            .entry(agent)
            .or_default()
            .insert(PlatformId::from(platform), weight);
        self
    }

    /// Set a request type preference
    #[must_use]
    pub fn with_request_type_preference(
        mut self,
        request_type: RequestType,
        platform: &str,
        weight: f64,
    ) -> Self {
        self.request_type_preference
            .entry(request_type)
            .or_default()
            .insert(PlatformId::from(platform), weight);
        self
    }

    /// Set a platform profile
    #[must_use]
    pub fn with_platform(mut self, platform: &str, profile: PlatformProfile) -> Self {
        self.platforms.insert(PlatformId::from(platform), profile);
        self
    }

    /// Set the tie-break order
    #[must_use]
    pub fn with_priority(mut self, order: &[&str]) -> Self {
        self.platform_priority = order.iter().map(|p| PlatformId::from(*p)).collect();
        self
    }

    fn profile(&self, platform: &PlatformId) -> PlatformProfile {
        self.platforms.get(platform).cloned().unwrap_or_default()
    }

    fn priority_rank(&self, platform: &PlatformId) -> usize {
        self.platform_priority
            .iter()
            .position(|p| p == platform)
            .unwrap_or(usize::MAX)
    }
}

// ============================================================================
// Decision
// ============================================================================

/// Where a request goes
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "platforms", rename_all = "snake_case")]
pub enum RoutingTarget {
    /// One platform
    Single(PlatformId),
    /// Two platforms, results merged
    Hybrid([PlatformId; 2]),
    /// No platform can take the request
    Fallback,
}

impl RoutingTarget {
    /// Platforms the target names
    #[must_use]
    pub fn platforms(&self) -> Vec<&PlatformId> {
        match self {
            Self::Single(p) => vec![p],
            Self::Hybrid([a, b]) => vec![a, b],
            Self::Fallback => Vec::new(),
        }
    }
}

impl fmt::Display for RoutingTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single(p) => write!(f, "{p}"),
            Self::Hybrid([a, b]) => write!(f, "hybrid({a}+{b})"),
            Self::Fallback => write!(f, "fallback"),
        }
    }
}

/// A factor that shaped a decision
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "factor", rename_all = "snake_case")]
pub enum RoutingFactor {
    /// Estimate above the token threshold
    HighTokenCost {
        /// Estimated tokens
        estimated: u64,
        /// Configured threshold
        threshold: u64,
    },
    /// Complexity above the complexity threshold
    HighComplexity {
        /// Request complexity
        complexity: f64,
        /// Configured threshold
        threshold: f64,
    },
    /// The agent prefers the chosen platform
    AgentPreference {
        /// Requesting agent
        agent: Agent,
        /// Preferred platform
        platform: PlatformId,
        /// Preference weight
        weight: f64,
    },
    /// The request type prefers the chosen platform
    RequestTypePreference {
        /// Derived request type
        request_type: RequestType,
        /// Preferred platform
        platform: PlatformId,
        /// Preference weight
        weight: f64,
    },
    /// A platform is low on quota
    QuotaPressure {
        /// Affected platform
        platform: PlatformId,
        /// Quota level
        level: QuotaLevel,
    },
    /// A connected platform was skipped because its circuit is open
    CircuitOpen {
        /// Affected platform
        platform: PlatformId,
    },
    /// Top two scores within the closeness threshold
    CloseScores {
        /// Absolute score gap
        gap: f64,
    },
    /// Equal scores resolved by priority order
    PriorityTieBreak,
    /// No platform is connected with a closed circuit
    NoEligiblePlatform,
    /// Every eligible platform is quota-critical
    QuotaExhausted,
}

impl fmt::Display for RoutingFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HighTokenCost {
                estimated,
                threshold,
            } => write!(f, "high token cost ({estimated} > {threshold} tokens)"),
            Self::HighComplexity {
                complexity,
                threshold,
            } => write!(f, "high complexity ({complexity:.2} > {threshold:.2})"),
            Self::AgentPreference {
                agent,
                platform,
                weight,
            } => write!(f, "agent preference {agent}→{platform} ({weight:.2})"),
            Self::RequestTypePreference {
                request_type,
                platform,
                weight,
            } => write!(f, "request type preference {request_type}→{platform} ({weight:.2})"),
            Self::QuotaPressure { platform, level } => write!(f, "quota {level} on {platform}"),
            Self::CircuitOpen { platform } => write!(f, "circuit open on {platform}"),
            Self::CloseScores { gap } => write!(f, "top scores within {gap:.3}"),
            Self::PriorityTieBreak => write!(f, "tie broken by priority order"),
            Self::NoEligiblePlatform => write!(f, "no connected platform"),
            Self::QuotaExhausted => write!(f, "every connected platform is quota-critical"),
        }
    }
}

/// Outcome of [`Router::decide`]
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RoutingDecision {
    /// Chosen target
    pub target: RoutingTarget,

    /// Score of every eligible platform
    pub score_per_platform: BTreeMap<PlatformId, f64>,

    /// Platforms that may be selected alone, best first
    pub ranked: Vec<PlatformId>,

    /// Confidence in [0, 1]
    pub confidence: f64,

    /// Human-readable trace
    pub reason: String,

    /// Structured dominant factors
    pub factors: Vec<RoutingFactor>,
}

impl RoutingDecision {
    /// Next single-platform candidate not in `exclude`
    #[must_use]
    pub fn next_candidate(&self, exclude: &[PlatformId]) -> Option<&PlatformId> {
        self.ranked.iter().find(|p| !exclude.contains(p))
    }

    /// Whether a factor of the given kind is present
    #[must_use]
    pub fn has_factor(&self, predicate: impl Fn(&RoutingFactor) -> bool) -> bool {
        self.factors.iter().any(predicate)
    }
}

/// Everything [`Router::decide`] looks at
#[derive(Clone, Copy, Debug)]
pub struct RoutingInputs<'a> {
    /// The request
    pub request: &'a AgentRequest,
    /// Profile derived from the request
    pub profile: &'a RequestProfile,
    /// Quota state
    pub quota: &'a QuotaBoard,
    /// Connection status per platform
    pub connections: &'a BTreeMap<PlatformId, ConnectionStatus>,
    /// Platforms whose circuit breaker is open
    pub open_circuits: &'a BTreeSet<PlatformId>,
}

// ============================================================================
// Router
// ============================================================================

/// Pure routing decision engine
#[derive(Clone, Debug)]
pub struct Router {
    config: RouterConfig,
}

struct Candidate {
    platform: PlatformId,
    score: f64,
    critical: bool,
    agent_pref: f64,
    type_pref: f64,
}

impl Router {
    /// Create a router
    #[must_use]
    pub fn new(config: RouterConfig) -> Self {
        Self { config }
    }

    /// Router configuration
    #[must_use]
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Decide where a request goes
    #[must_use]
    pub fn decide(&self, inputs: &RoutingInputs<'_>) -> RoutingDecision {
        let mut factors = Vec::new();

        for (platform, status) in inputs.connections {
            if *status == ConnectionStatus::Connected && inputs.open_circuits.contains(platform) {
                factors.push(RoutingFactor::CircuitOpen {
                    platform: platform.clone(),
                });
            }
        }

        let eligible: Vec<&PlatformId> = inputs
            .connections
            .iter()
            .filter(|(p, s)| **s == ConnectionStatus::Connected && !inputs.open_circuits.contains(*p))
            .map(|(p, _)| p)
            .collect();

        if eligible.is_empty() {
            factors.push(RoutingFactor::NoEligiblePlatform);
            return Self::finish(RoutingTarget::Fallback, BTreeMap::new(), Vec::new(), 0.0, factors);
        }

        let profile = inputs.profile;
        let high_cost = profile.estimated_tokens > self.config.token_threshold;
        let high_complexity = profile.complexity > self.config.complexity_threshold;
        if high_cost {
            factors.push(RoutingFactor::HighTokenCost {
                estimated: profile.estimated_tokens,
                threshold: self.config.token_threshold,
            });
        }
        if high_complexity {
            factors.push(RoutingFactor::HighComplexity {
                complexity: profile.complexity,
                threshold: self.config.complexity_threshold,
            });
        }

        let mut candidates = self.score(&eligible, inputs, high_cost, high_complexity);
        self.rank(&mut candidates);

        for candidate in &candidates {
            let level = inputs.quota.level(&candidate.platform);
            if level != QuotaLevel::Normal {
                factors.push(RoutingFactor::QuotaPressure {
                    platform: candidate.platform.clone(),
                    level,
                });
            }
        }

        let scores: BTreeMap<PlatformId, f64> = candidates
            .iter()
            .map(|c| (c.platform.clone(), c.score))
            .collect();
        let ranked: Vec<PlatformId> = candidates
            .iter()
            .filter(|c| !c.critical)
            .map(|c| c.platform.clone())
            .collect();

        let Some(top_index) = candidates.iter().position(|c| !c.critical) else {
            factors.push(RoutingFactor::QuotaExhausted);
            return Self::finish(RoutingTarget::Fallback, scores, ranked, 0.0, factors);
        };
        let top = &candidates[top_index];
        let runner_up = candidates
            .iter()
            .enumerate()
            .find(|(i, _)| *i != top_index)
            .map(|(_, c)| c);

        if top.agent_pref > 0.0 {
            factors.push(RoutingFactor::AgentPreference {
                agent: inputs.request.agent,
                platform: top.platform.clone(),
                weight: top.agent_pref,
            });
        }
        if top.type_pref > 0.0 {
            factors.push(RoutingFactor::RequestTypePreference {
                request_type: profile.request_type,
                platform: top.platform.clone(),
                weight: top.type_pref,
            });
        }

        let Some(second) = runner_up else {
            let target = RoutingTarget::Single(top.platform.clone());
            return Self::finish(target, scores, ranked, 1.0, factors);
        };

        let gap = (top.score - second.score).abs();
        let closeness = self.config.closeness_threshold;

        if gap < closeness && profile.complexity > self.config.redundancy_threshold {
            factors.push(RoutingFactor::CloseScores { gap });
            let confidence = 0.5 + 0.5 * (1.0 - gap / closeness.max(EPSILON));
            let target = RoutingTarget::Hybrid([top.platform.clone(), second.platform.clone()]);
            return Self::finish(target, scores, ranked, confidence.clamp(0.0, 1.0), factors);
        }

        if gap < EPSILON {
            factors.push(RoutingFactor::PriorityTieBreak);
        }
        let confidence = 0.5 + 0.5 * (gap / (gap + closeness.max(EPSILON)));
        let target = RoutingTarget::Single(top.platform.clone());
        Self::finish(target, scores, ranked, confidence.clamp(0.0, 1.0), factors)
    }

    fn score(
        &self,
        eligible: &[&PlatformId],
        inputs: &RoutingInputs<'_>,
        high_cost: bool,
        high_complexity: bool,
    ) -> Vec<Candidate> {
        let weights = &self.config.weights;
        let headroom = |p: &PlatformId| {
            self.config.profile(p).capacity_tokens as f64 * inputs.quota.remaining(p)
        };
        let max_headroom = eligible
            .iter()
            .map(|p| headroom(p))
            .fold(0.0_f64, f64::max);

        let agent_prefs = self.config.agent_preference.get(&inputs.request.agent);
        let type_prefs = self
            .config
            .request_type_preference
            .get(&inputs.profile.request_type);

        eligible
            .iter()
            .map(|&platform| {
                let token_cost = if high_cost && max_headroom > 0.0 {
                    headroom(platform) / max_headroom
                } else {
                    0.0
                };
                let complexity = if high_complexity {
                    inputs.profile.complexity * self.config.profile(platform).capability
                } else {
                    0.0
                };
                let agent_pref = agent_prefs
                    .and_then(|m| m.get(platform))
                    .copied()
                    .unwrap_or(0.0);
                let type_pref = type_prefs
                    .and_then(|m| m.get(platform))
                    .copied()
                    .unwrap_or(0.0);
                let (penalty, critical) = quota_penalty(inputs.quota, platform);

                let score = weights.token_cost * token_cost
                    + weights.complexity * complexity
                    + weights.agent_preference * agent_pref
                    + weights.request_type * type_pref
                    + weights.quota_penalty * penalty;

                Candidate {
                    platform: platform.clone(),
                    score,
                    critical,
                    agent_pref,
                    type_pref,
                }
            })
            .collect()
    }

    fn rank(&self, candidates: &mut [Candidate]) {
        candidates.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| {
                    self.config
                        .priority_rank(&a.platform)
                        .cmp(&self.config.priority_rank(&b.platform))
                })
                .then_with(|| a.platform.cmp(&b.platform))
        });
    }

    fn finish(
        target: RoutingTarget,
        score_per_platform: BTreeMap<PlatformId, f64>,
        ranked: Vec<PlatformId>,
        confidence: f64,
        factors: Vec<RoutingFactor>,
    ) -> RoutingDecision {
        let head = match &target {
            RoutingTarget::Single(p) => format!("selected {p}"),
            RoutingTarget::Hybrid([a, b]) => format!("hybrid over {a} and {b}"),
            RoutingTarget::Fallback => "fallback".to_string(),
        };
        let reason = if factors.is_empty() {
            format!("{head}: highest score")
        } else {
            let parts: Vec<String> = factors.iter().map(ToString::to_string).collect();
            format!("{head}: {}", parts.join("; "))
        };

        RoutingDecision {
            target,
            score_per_platform,
            ranked,
            confidence,
            reason,
            factors,
        }
    }
}

/// Non-positive quota term and whether the platform is critical
///
/// Critical platforms get -1; Warning platforms get up to -0.5 depending on
/// how deep into the warning band they are.
fn quota_penalty(quota: &QuotaBoard, platform: &PlatformId) -> (f64, bool) {
    let Some(status) = quota.get(platform) else {
        return (0.0, false);
    };
    match status.level() {
        QuotaLevel::Normal => (0.0, false),
        QuotaLevel::Warning => {
            let band = (status.warning_threshold - status.critical_threshold).max(EPSILON);
            let depth = ((status.warning_threshold - status.remaining_fraction) / band).clamp(0.0, 1.0);
            (-0.5 * depth, false)
        }
        QuotaLevel::Critical => (-1.0, true),
    }
}
