//! Hybrid Execution Engine
//!
//! Fans one request out to two platforms, waits for both under a single
//! deadline, and merges what came back.
//!
//! ```text
//!                    ┌──▶ send_cancellable(a) ──┐
//!  execute(req,[a,b])┤                          ├──▶ MergePolicy::merge ──▶ MergedResult
//!                    └──▶ send_cancellable(b) ──┘
//!                         ▲            ▲
//!                   deadline     caller cancel
//!            (cancels whatever is still outstanding)
//! ```
//!
//! One success is enough: the result is returned marked `partial`. Only when
//! nothing succeeds does `execute` fail.

use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::connection::{ConnectionManager, PlatformReply, PlatformRequest, SendError};
use crate::types::PlatformId;

/// Hybrid execution settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HybridConfig {
    /// Overall deadline for both sub-requests
    pub timeout_ms: u64,
    /// How sub-results are combined
    pub merge: MergeStrategy,
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            merge: MergeStrategy::default(),
        }
    }
}

/// Built-in merge policies selectable from configuration
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// [`AttributedConcat`]
    #[default]
    AttributedConcat,
    /// [`PreferPrimary`]
    PreferPrimary,
}

impl MergeStrategy {
    /// Policy implementing this strategy
    #[must_use]
    pub fn policy(self) -> Arc<dyn MergePolicy> {
        match self {
            Self::AttributedConcat => Arc::new(AttributedConcat),
            Self::PreferPrimary => Arc::new(PreferPrimary),
        }
    }
}

impl FromStr for MergeStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "attributed_concat" => Ok(Self::AttributedConcat),
            "prefer_primary" => Ok(Self::PreferPrimary),
            other => Err(format!("unknown merge strategy '{other}'")),
        }
    }
}

impl HybridConfig {
    /// Deadline as a Duration
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// A sub-request that succeeded
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SubResult {
    /// Platform that answered
    pub platform: PlatformId,
    /// Its reply
    pub reply: PlatformReply,
    /// Wall time until the reply arrived
    pub elapsed_ms: u64,
}

/// Merged outcome of a hybrid execution
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MergedResult {
    /// Merged content
    pub content: String,
    /// Name of the policy that produced `content`
    pub policy: String,
    /// Successful sub-results in the order the platforms were given
    pub results: Vec<SubResult>,
    /// Sub-requests that failed or missed the deadline
    #[serde(skip)]
    pub failures: Vec<SendError>,
    /// Whether only one platform contributed
    pub partial: bool,
}

impl MergedResult {
    /// Platforms that contributed
    #[must_use]
    pub fn platforms(&self) -> Vec<&PlatformId> {
        self.results.iter().map(|r| &r.platform).collect()
    }
}

/// Hybrid execution failures
#[derive(Debug, Clone, PartialEq, Error)]
pub enum HybridError {
    /// Both sub-requests failed
    #[error("all hybrid sub-requests failed: {}", describe(.failures))]
    AllFailed {
        /// One failure per platform
        failures: Vec<SendError>,
    },

    /// Deadline passed with no successful sub-request
    #[error("hybrid execution timed out after {timeout_ms}ms")]
    TimedOut {
        /// Deadline that was exceeded
        timeout_ms: u64,
        /// Failures observed before or at the deadline
        failures: Vec<SendError>,
    },

    /// Caller cancelled
    #[error("hybrid execution cancelled")]
    Cancelled,
}

impl HybridError {
    /// Per-platform failures carried by the error
    #[must_use]
    pub fn failures(&self) -> &[SendError] {
        match self {
            Self::AllFailed { failures } | Self::TimedOut { failures, .. } => failures,
            Self::Cancelled => &[],
        }
    }
}

fn describe(failures: &[SendError]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

// ============================================================================
// Merge policies
// ============================================================================

/// Combines successful sub-results into one answer
pub trait MergePolicy: Send + Sync {
    /// Policy name, reported in results and logs
    fn name(&self) -> &str;

    /// Merge one or two sub-results (never called with none)
    fn merge(&self, results: &[SubResult]) -> String;
}

/// Default policy: every result in its own section labeled by platform
#[derive(Clone, Copy, Debug, Default)]
pub struct AttributedConcat;

impl MergePolicy for AttributedConcat {
    fn name(&self) -> &str {
        "attributed_concat"
    }

    fn merge(&self, results: &[SubResult]) -> String {
        results
            .iter()
            .map(|r| format!("### {}\n{}", r.platform, r.reply.content))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Answer with the router's first choice; the second result only fills in
/// when the first platform failed
#[derive(Clone, Copy, Debug, Default)]
pub struct PreferPrimary;

impl MergePolicy for PreferPrimary {
    fn name(&self) -> &str {
        "prefer_primary"
    }

    fn merge(&self, results: &[SubResult]) -> String {
        results
            .first()
            .map(|r| r.reply.content.clone())
            .unwrap_or_default()
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Runs requests on two platforms at once
pub struct HybridEngine {
    connections: Arc<ConnectionManager>,
    config: HybridConfig,
    policy: Arc<dyn MergePolicy>,
}

impl HybridEngine {
    /// Create an engine using the configured merge strategy
    #[must_use]
    pub fn new(connections: Arc<ConnectionManager>, config: HybridConfig) -> Self {
        let policy = config.merge.policy();
        Self {
            connections,
            config,
            policy,
        }
    }

    /// Replace the merge policy
    #[must_use]
    pub fn with_policy(mut self, policy: Arc<dyn MergePolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Engine configuration
    #[must_use]
    pub fn config(&self) -> &HybridConfig {
        &self.config
    }

    /// Send `request` to both platforms and merge the results
    ///
    /// # Errors
    ///
    /// Returns [`HybridError::Cancelled`] when `cancel` fires, and
    /// [`HybridError::AllFailed`] or [`HybridError::TimedOut`] when neither
    /// platform produced a result.
    pub async fn execute(
        &self,
        request: &PlatformRequest,
        platforms: [PlatformId; 2],
        cancel: &CancellationToken,
    ) -> Result<MergedResult, HybridError> {
        let timeout = self.config.timeout();
        let timeout_ms = self.config.timeout_ms;

        // Cancelled on any exit path, taking outstanding sub-requests with it
        let scope = cancel.child_token();
        let _guard = scope.clone().drop_guard();

        let mut pending: FuturesUnordered<_> = platforms
            .iter()
            .cloned()
            .enumerate()
            .map(|(slot, platform)| {
                let connections = Arc::clone(&self.connections);
                let request = request.clone();
                let scope = scope.clone();
                async move {
                    let started = Instant::now();
                    let result = connections
                        .send_cancellable(&platform, request, &scope)
                        .await;
                    (slot, platform, started.elapsed(), result)
                }
            })
            .collect();

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let mut successes: Vec<(usize, SubResult)> = Vec::with_capacity(2);
        let mut failures = Vec::new();

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    debug!(request_id = %request.request_id, "Hybrid execution cancelled");
                    return Err(HybridError::Cancelled);
                }
                () = &mut deadline => {
                    for platform in &platforms {
                        let answered = successes.iter().any(|(_, r)| &r.platform == platform)
                            || failures.iter().any(|f: &SendError| f.platform() == platform);
                        if !answered {
                            failures.push(SendError::Timeout { platform: platform.clone(), timeout_ms });
                        }
                    }
                    warn!(
                        request_id = %request.request_id,
                        timeout_ms,
                        completed = successes.len(),
                        "Hybrid deadline reached"
                    );
                    break;
                }
                next = pending.next() => match next {
                    Some((slot, platform, elapsed, Ok(reply))) => {
                        successes.push((slot, SubResult {
                            platform,
                            reply,
                            elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                        }));
                    }
                    Some((_, platform, _, Err(error))) => {
                        warn!(
                            request_id = %request.request_id,
                            platform = %platform,
                            error = %error,
                            "Hybrid sub-request failed"
                        );
                        failures.push(error);
                    }
                    None => break,
                },
            }
        }

        if successes.is_empty() {
            let timed_out = failures
                .iter()
                .any(|f| matches!(f, SendError::Timeout { .. }));
            return Err(if timed_out {
                HybridError::TimedOut {
                    timeout_ms,
                    failures,
                }
            } else {
                HybridError::AllFailed { failures }
            });
        }

        successes.sort_by_key(|(slot, _)| *slot);
        let results: Vec<SubResult> = successes.into_iter().map(|(_, r)| r).collect();
        let content = self.policy.merge(&results);
        let partial = results.len() < platforms.len();

        debug!(
            request_id = %request.request_id,
            policy = self.policy.name(),
            contributors = results.len(),
            partial,
            "Hybrid results merged"
        );

        Ok(MergedResult {
            content,
            policy: self.policy.name().to_string(),
            results,
            failures,
            partial,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{BackoffConfig, ConnectionConfig, ConnectionStatus, LoopbackTransport};
    use crate::types::{Agent, AgentRequest};

    const WAIT: Duration = Duration::from_secs(3);

    fn request() -> PlatformRequest {
        PlatformRequest::from_agent_request(&AgentRequest::new(Agent::Architect, "design", "s"))
    }

    async fn manager_with(
        transports: &[(&str, Arc<LoopbackTransport>)],
    ) -> Arc<ConnectionManager> {
        let manager = Arc::new(ConnectionManager::new(ConnectionConfig {
            heartbeat_interval_ms: 50,
            backoff: BackoffConfig::fixed(20),
            ..ConnectionConfig::default()
        }));
        for (name, transport) in transports {
            let platform = PlatformId::from(*name);
            manager.open(platform.clone(), Arc::clone(transport) as _);
            assert!(manager.wait_for_status(&platform, ConnectionStatus::Connected, WAIT).await);
        }
        manager
    }

    fn pair() -> [PlatformId; 2] {
        [PlatformId::from("alpha"), PlatformId::from("beta")]
    }

    #[tokio::test]
    async fn test_both_results_kept() {
        let alpha = Arc::new(LoopbackTransport::new("alpha"));
        let beta = Arc::new(LoopbackTransport::new("beta").with_latency(Duration::from_millis(30)));
        let manager = manager_with(&[("alpha", alpha), ("beta", beta)]).await;
        let engine = HybridEngine::new(manager, HybridConfig::default());

        let merged = engine
            .execute(&request(), pair(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(!merged.partial);
        assert_eq!(merged.policy, "attributed_concat");
        assert_eq!(merged.results.len(), 2);
        assert!(merged.content.contains("### alpha\n[alpha] design"));
        assert!(merged.content.contains("### beta\n[beta] design"));
        // Order follows the platform pair, not completion
        assert!(merged.content.find("alpha").unwrap() < merged.content.find("beta").unwrap());
    }

    #[tokio::test]
    async fn test_slow_platform_gives_partial() {
        let alpha = Arc::new(LoopbackTransport::new("alpha"));
        let beta = Arc::new(LoopbackTransport::new("beta"));
        let manager = manager_with(&[("alpha", alpha), ("beta", Arc::clone(&beta))]).await;
        beta.set_latency(Duration::from_secs(10));
        let engine = HybridEngine::new(manager, HybridConfig { timeout_ms: 200, ..HybridConfig::default() });

        let merged = engine
            .execute(&request(), pair(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(merged.partial);
        assert_eq!(merged.platforms(), vec![&PlatformId::from("alpha")]);
        assert!(matches!(merged.failures[0], SendError::Timeout { .. }));
        // The outstanding sub-request was cancelled, not completed
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(beta.send_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_platform_gives_partial() {
        let alpha = Arc::new(LoopbackTransport::new("alpha"));
        let beta = Arc::new(LoopbackTransport::new("beta"));
        let manager = manager_with(&[("alpha", Arc::clone(&alpha)), ("beta", beta)]).await;
        alpha.fail_next_sends(1);
        let engine = HybridEngine::new(manager, HybridConfig::default());

        let merged = engine
            .execute(&request(), pair(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(merged.partial);
        assert_eq!(merged.platforms(), vec![&PlatformId::from("beta")]);
        assert!(merged.failures[0].is_connection_error());
    }

    #[tokio::test]
    async fn test_nothing_completes_times_out() {
        let alpha = Arc::new(LoopbackTransport::new("alpha"));
        let beta = Arc::new(LoopbackTransport::new("beta"));
        let manager = manager_with(&[("alpha", Arc::clone(&alpha)), ("beta", Arc::clone(&beta))]).await;
        alpha.set_latency(Duration::from_secs(10));
        beta.set_latency(Duration::from_secs(10));
        let engine = HybridEngine::new(manager, HybridConfig { timeout_ms: 100, ..HybridConfig::default() });

        let err = engine
            .execute(&request(), pair(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HybridError::TimedOut { timeout_ms: 100, .. }));
        assert_eq!(err.failures().len(), 2);
    }

    #[tokio::test]
    async fn test_both_fail() {
        let alpha = Arc::new(LoopbackTransport::new("alpha"));
        let beta = Arc::new(LoopbackTransport::new("beta"));
        let manager = manager_with(&[("alpha", Arc::clone(&alpha)), ("beta", Arc::clone(&beta))]).await;
        alpha.fail_next_sends(1);
        beta.fail_next_sends(1);
        let engine = HybridEngine::new(manager, HybridConfig::default());

        let err = engine
            .execute(&request(), pair(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HybridError::AllFailed { .. }));
        assert!(err.to_string().contains("alpha"));
    }

    #[tokio::test]
    async fn test_caller_cancel_propagates() {
        let alpha = Arc::new(LoopbackTransport::new("alpha"));
        let beta = Arc::new(LoopbackTransport::new("beta"));
        let manager = manager_with(&[("alpha", Arc::clone(&alpha)), ("beta", Arc::clone(&beta))]).await;
        alpha.set_latency(Duration::from_secs(10));
        beta.set_latency(Duration::from_secs(10));
        let engine = HybridEngine::new(Arc::clone(&manager), HybridConfig::default());

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = engine.execute(&request(), pair(), &cancel).await.unwrap_err();
        assert_eq!(err, HybridError::Cancelled);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.in_flight(&PlatformId::from("alpha")), 0);
        assert_eq!(manager.in_flight(&PlatformId::from("beta")), 0);
    }

    struct FirstOnly;

    impl MergePolicy for FirstOnly {
        fn name(&self) -> &str {
            "first_only"
        }

        fn merge(&self, results: &[SubResult]) -> String {
            results[0].reply.content.clone()
        }
    }

    #[tokio::test]
    async fn test_custom_policy() {
        let alpha = Arc::new(LoopbackTransport::new("alpha"));
        let beta = Arc::new(LoopbackTransport::new("beta"));
        let manager = manager_with(&[("alpha", alpha), ("beta", beta)]).await;
        let engine =
            HybridEngine::new(manager, HybridConfig::default()).with_policy(Arc::new(FirstOnly));

        let merged = engine
            .execute(&request(), pair(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(merged.policy, "first_only");
        assert_eq!(merged.content, "[alpha] design");
        // Token usage stays per platform regardless of policy
        assert_eq!(merged.results.len(), 2);
    }

    #[tokio::test]
    async fn test_configured_strategy_selects_policy() {
        let alpha = Arc::new(LoopbackTransport::new("alpha").with_latency(Duration::from_millis(30)));
        let beta = Arc::new(LoopbackTransport::new("beta"));
        let manager = manager_with(&[("alpha", alpha), ("beta", beta)]).await;
        let config = HybridConfig {
            merge: MergeStrategy::PreferPrimary,
            ..HybridConfig::default()
        };
        let engine = HybridEngine::new(manager, config);

        let merged = engine
            .execute(&request(), pair(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(merged.policy, "prefer_primary");
        // Alpha answers last but is still the primary
        assert_eq!(merged.content, "[alpha] design");
        assert!(!merged.partial);
    }

    #[test]
    fn test_merge_strategy_names() {
        assert_eq!("prefer_primary".parse(), Ok(MergeStrategy::PreferPrimary));
        assert_eq!("attributed_concat".parse(), Ok(MergeStrategy::AttributedConcat));
        assert!("longest".parse::<MergeStrategy>().is_err());
        for strategy in [MergeStrategy::AttributedConcat, MergeStrategy::PreferPrimary] {
            let name = serde_json::to_string(&strategy).unwrap();
            assert_eq!(name.trim_matches('"'), strategy.policy().name());
        }
    }
}
