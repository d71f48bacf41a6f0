//! Bridge Facade
//!
//! The single entry point external collaborators call. Wires the connection
//! manager, usage optimizer, router, session synchronizer and hybrid engine
//! together and owns failover and circuit breaking.
//!
//! ```text
//!  route(request)
//!     │ validate (empty / zero-cost ─▶ Validation)
//!     │ worker permit (queue timeout ─▶ Backpressure)
//!     │ seed session, render transcript
//!     ▼
//!  Router::decide(request, profile, quota board, statuses, open circuits)
//!     │
//!     ├─ Single(p) ──▶ breaker ──▶ ConnectionManager::send ──┐
//!     │                  └─ connection error: one failover ──┤
//!     ├─ Hybrid(a,b) ──▶ HybridEngine::execute ──────────────┤
//!     └─ Fallback ──▶ NoPlatformAvailable                    ▼
//!                                          record usage, update session,
//!                                          metrics ─▶ AgentResponse
//! ```
//!
//! # Error Policy
//!
//! - Validation failures are returned immediately and never retried
//! - Connection errors count against the platform's circuit breaker and are
//!   retried once on the next-ranked eligible platform
//! - Timeouts and backpressure are surfaced without failover
//! - Every error that reached a platform lists the platforms attempted

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{BridgeConfig, ConfigError};
use crate::connection::{
    ConnectionManager, ConnectionStatus, HttpTransport, PlatformReply, PlatformRequest,
    PlatformTransport, SendError, TransportError,
};
use crate::hybrid::{HybridEngine, HybridError, MergedResult};
use crate::metrics::{BridgeMetrics, Gauge};
use crate::routing::{
    CircuitBreakers, CircuitState, RequestProfile, Router, RoutingDecision, RoutingInputs,
    RoutingTarget,
};
use crate::session::{Session, SessionSynchronizer};
use crate::usage::{QuotaBoard, QuotaStatus, TokenEstimate, UsageOptimizer, UsageSample};
use crate::types::{
    AgentRequest, AgentResponse, AttemptSummary, HistoryEntry, MessageRole, PlatformId,
    RequestId, ResponseStatus, TokenUsage,
};

// ============================================================================
// Configuration
// ============================================================================

/// Route worker pool settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Routes processed concurrently
    pub max_concurrent_routes: usize,

    /// How long a route may wait for a worker before Backpressure
    pub queue_timeout_ms: u64,

    /// Interval of the maintenance tick (quota window refresh)
    pub maintenance_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_routes: 64,
            queue_timeout_ms: 5_000,
            maintenance_interval_ms: 10_000,
        }
    }
}

impl WorkerConfig {
    /// Queue timeout as Duration
    #[must_use]
    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }

    /// Maintenance interval as Duration
    #[must_use]
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms.max(1))
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Failures surfaced by the facade
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Malformed or zero-cost request
    #[error("invalid request: {0}")]
    Validation(String),

    /// No capacity to take the request
    #[error("{}", backpressure_message(.platform.as_ref()))]
    Backpressure {
        /// Platform whose in-flight bound was reached, if any
        platform: Option<PlatformId>,
    },

    /// Router found no platform to send the request to
    #[error("no platform available: {reason}")]
    NoPlatformAvailable {
        /// Routing trace
        reason: String,
    },

    /// Every platform tried failed
    #[error("all attempted platforms failed: {}", describe_attempts(.attempted))]
    AllPlatformsFailed {
        /// Platforms tried and why each failed
        attempted: Vec<AttemptSummary>,
        /// Routing trace
        reason: String,
    },

    /// Deadline passed without any result
    #[error("request timed out after {timeout_ms}ms")]
    Timeout {
        /// Deadline that was exceeded
        timeout_ms: u64,
        /// Platforms tried and why each failed
        attempted: Vec<AttemptSummary>,
    },

    /// Caller cancelled the request
    #[error("request cancelled")]
    Cancelled,

    /// The bridge is shutting down
    #[error("bridge is shut down")]
    Shutdown,

    /// Configuration rejected at startup
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A platform transport could not be constructed
    #[error("failed to start platform {platform}: {source}")]
    Startup {
        /// Platform being opened
        platform: PlatformId,
        /// Underlying failure
        source: TransportError,
    },
}

fn backpressure_message(platform: Option<&PlatformId>) -> String {
    match platform {
        Some(platform) => format!("{platform} has too many requests in flight"),
        None => "bridge is at capacity".to_string(),
    }
}

fn describe_attempts(attempted: &[AttemptSummary]) -> String {
    attempted
        .iter()
        .map(|a| format!("{} ({})", a.platform, a.reason))
        .collect::<Vec<_>>()
        .join(", ")
}

impl BridgeError {
    /// Platforms tried before the error surfaced
    #[must_use]
    pub fn attempted(&self) -> &[AttemptSummary] {
        match self {
            Self::AllPlatformsFailed { attempted, .. } | Self::Timeout { attempted, .. } => {
                attempted
            }
            _ => &[],
        }
    }

    /// Whether the caller may reasonably retry later
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Backpressure { .. }
                | Self::NoPlatformAvailable { .. }
                | Self::AllPlatformsFailed { .. }
                | Self::Timeout { .. }
        )
    }

    /// Error-shaped response for request `id`
    #[must_use]
    pub fn into_response(self, id: RequestId) -> AgentResponse {
        let reason = match &self {
            Self::NoPlatformAvailable { reason } | Self::AllPlatformsFailed { reason, .. } => {
                Some(reason.clone())
            }
            _ => None,
        };
        let attempted = self.attempted().to_vec();
        AgentResponse {
            reason,
            attempted,
            ..AgentResponse::error(id, self.to_string())
        }
    }
}

fn attempt(platform: &PlatformId, reason: impl Into<String>) -> AttemptSummary {
    AttemptSummary {
        platform: platform.to_string(),
        reason: reason.into(),
    }
}

// ============================================================================
// Health
// ============================================================================

/// Health of one platform as the facade sees it
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PlatformHealth {
    /// Platform
    pub platform: PlatformId,
    /// Connection status reported by its supervisor
    pub connection: ConnectionStatus,
    /// Circuit breaker state
    pub circuit: CircuitState,
    /// Quota status
    pub quota: QuotaStatus,
    /// Requests queued or running
    pub in_flight: usize,
}

struct ActiveRoute<'a>(&'a Gauge);

impl<'a> ActiveRoute<'a> {
    fn enter(gauge: &'a Gauge) -> Self {
        gauge.inc();
        Self(gauge)
    }
}

impl Drop for ActiveRoute<'_> {
    fn drop(&mut self) {
        self.0.dec();
    }
}

// ============================================================================
// Bridge
// ============================================================================

/// The Intelligent Bridge
pub struct Bridge {
    config: BridgeConfig,
    connections: Arc<ConnectionManager>,
    usage: Arc<UsageOptimizer>,
    quota: watch::Receiver<QuotaBoard>,
    router: Router,
    breakers: CircuitBreakers,
    sessions: SessionSynchronizer,
    hybrid: HybridEngine,
    metrics: Arc<BridgeMetrics>,
    workers: Arc<Semaphore>,
    shutdown: CancellationToken,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl Bridge {
    /// Validate `config`, open every platform and start maintenance
    ///
    /// Platforms with an entry in `transports` use it; the others get an
    /// [`HttpTransport`] for their configured endpoint. Must be called from
    /// within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Config`] for an invalid configuration and
    /// [`BridgeError::Startup`] when an HTTP transport cannot be built.
    pub fn start(
        config: BridgeConfig,
        mut transports: BTreeMap<PlatformId, Arc<dyn PlatformTransport>>,
    ) -> Result<Self, BridgeError> {
        config.validate()?;

        let connections = Arc::new(ConnectionManager::new(config.connection.clone()));
        let usage = Arc::new(UsageOptimizer::new(
            config.estimator.clone(),
            config.quota.clone(),
        ));

        for platform in &config.platforms {
            let transport = match transports.remove(&platform.id) {
                Some(transport) => transport,
                None => {
                    let http = HttpTransport::new(
                        platform.endpoint.clone(),
                        config.connection.request_timeout(),
                        config.connection.heartbeat_timeout(),
                    )
                    .map_err(|source| BridgeError::Startup {
                        platform: platform.id.clone(),
                        source,
                    })?;
                    Arc::new(http) as Arc<dyn PlatformTransport>
                }
            };
            info!(
                platform = %platform.id,
                transport = transport.kind(),
                priority = platform.priority,
                "Opening platform"
            );
            usage.register_platform(platform.id.clone(), platform.budget());
            connections.open(platform.id.clone(), transport);
        }
        for unused in transports.keys() {
            warn!(platform = %unused, "Transport supplied for unconfigured platform, ignoring");
        }

        let quota = usage.subscribe();
        let sessions = SessionSynchronizer::new(
            config.session.clone(),
            Arc::clone(&connections) as Arc<dyn crate::session::ContextPropagator>,
        );
        let hybrid = HybridEngine::new(Arc::clone(&connections), config.hybrid.clone());
        let shutdown = CancellationToken::new();

        let maintenance = tokio::spawn(maintenance_loop(
            Arc::clone(&usage),
            config.workers.maintenance_interval(),
            shutdown.child_token(),
        ));

        info!(
            platforms = config.platforms.len(),
            max_concurrent_routes = config.workers.max_concurrent_routes,
            source = %config.source(),
            "Bridge started"
        );

        Ok(Self {
            router: Router::new(config.router_config()),
            breakers: CircuitBreakers::new(config.circuit_breaker.clone()),
            workers: Arc::new(Semaphore::new(config.workers.max_concurrent_routes)),
            metrics: Arc::new(BridgeMetrics::new()),
            maintenance: Mutex::new(Some(maintenance)),
            config,
            connections,
            usage,
            quota,
            sessions,
            hybrid,
            shutdown,
        })
    }

    /// Configuration the bridge was started with
    #[must_use]
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Shared metrics
    #[must_use]
    pub fn metrics(&self) -> Arc<BridgeMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Usage optimizer
    #[must_use]
    pub fn usage(&self) -> &UsageOptimizer {
        &self.usage
    }

    /// Connection manager
    #[must_use]
    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    /// Session synchronizer
    #[must_use]
    pub fn sessions(&self) -> &SessionSynchronizer {
        &self.sessions
    }

    /// Circuit breakers
    #[must_use]
    pub fn breakers(&self) -> &CircuitBreakers {
        &self.breakers
    }

    /// Merged context of a live session
    pub async fn session(&self, session: &crate::types::SessionId) -> Option<Session> {
        self.sessions.get_context(session).await
    }

    /// Remove `platform` from every live session
    pub async fn retire_platform(&self, platform: &PlatformId) -> usize {
        self.sessions.retire_platform(platform).await
    }

    /// Health of every configured platform
    #[must_use]
    pub fn health(&self) -> Vec<PlatformHealth> {
        let statuses = self.connections.statuses();
        self.config
            .platforms
            .iter()
            .map(|p| PlatformHealth {
                platform: p.id.clone(),
                connection: statuses.get(&p.id).copied().unwrap_or_default(),
                circuit: self.breakers.state(&p.id),
                quota: self.usage.quota_status(&p.id),
                in_flight: self.connections.in_flight(&p.id),
            })
            .collect()
    }

    /// Wait until every configured platform is Connected
    pub async fn wait_until_connected(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        for platform in &self.config.platforms {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !self
                .connections
                .wait_for_status(&platform.id, ConnectionStatus::Connected, remaining)
                .await
            {
                return false;
            }
        }
        true
    }

    /// Route a request
    ///
    /// # Errors
    ///
    /// See [`route_with_cancel`](Self::route_with_cancel).
    pub async fn route(&self, request: AgentRequest) -> Result<AgentResponse, BridgeError> {
        self.route_with_cancel(request, &CancellationToken::new())
            .await
    }

    /// Route a request, aborting every sub-request when `cancel` fires
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError`] when the request is invalid, when the bridge is
    /// out of capacity, or when no platform produced a result.
    pub async fn route_with_cancel(
        &self,
        request: AgentRequest,
        cancel: &CancellationToken,
    ) -> Result<AgentResponse, BridgeError> {
        if self.shutdown.is_cancelled() {
            return Err(BridgeError::Shutdown);
        }
        self.metrics.requests.inc();
        let started = Instant::now();

        let estimate = match self.validate(&request) {
            Ok(estimate) => estimate,
            Err(error) => {
                self.metrics.validation_rejections.inc();
                debug!(request_id = %request.id, error = %error, "Request rejected");
                return Err(error);
            }
        };

        let _permit = self.acquire_worker(cancel).await.inspect_err(|error| {
            if matches!(error, BridgeError::Backpressure { .. }) {
                self.metrics.backpressure.inc();
            }
        })?;
        let _active = ActiveRoute::enter(&self.metrics.active_routes);

        let result = self.dispatch(&request, &estimate, cancel).await;
        let elapsed = started.elapsed();
        self.metrics.route_latency.record_duration(elapsed);

        match &result {
            Ok(response) => info!(
                request_id = %request.id,
                session = %request.session_id(),
                platform = %response.platform,
                tokens = response.token_usage.tokens,
                partial = response.partial,
                elapsed_ms = elapsed.as_millis(),
                "Request routed"
            ),
            Err(error) => {
                self.metrics.errors.inc();
                if matches!(error, BridgeError::Backpressure { .. }) {
                    self.metrics.backpressure.inc();
                }
                warn!(
                    request_id = %request.id,
                    session = %request.session_id(),
                    error = %error,
                    elapsed_ms = elapsed.as_millis(),
                    "Request failed"
                );
            }
        }
        result
    }

    /// Stop maintenance, sessions and every connection loop
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        self.workers.close();
        self.sessions.shutdown();

        let maintenance = self.maintenance.lock().take();
        if let Some(task) = maintenance {
            let _ = task.await;
        }
        self.connections.shutdown().await;
        info!("Bridge stopped");
    }

    // ========================================================================
    // Flow
    // ========================================================================

    fn validate(&self, request: &AgentRequest) -> Result<TokenEstimate, BridgeError> {
        if request.id.as_str().is_empty() {
            return Err(BridgeError::Validation("request id is empty".to_string()));
        }
        if request.session_id().as_str().is_empty() {
            return Err(BridgeError::Validation("session id is empty".to_string()));
        }
        if request.content.trim().is_empty() {
            return Err(BridgeError::Validation("request content is empty".to_string()));
        }
        let estimate = self.usage.estimate_cost(request);
        if estimate.tokens == 0 {
            return Err(BridgeError::Validation(
                "estimated cost is zero".to_string(),
            ));
        }
        Ok(estimate)
    }

    async fn acquire_worker(
        &self,
        cancel: &CancellationToken,
    ) -> Result<tokio::sync::OwnedSemaphorePermit, BridgeError> {
        let timeout = self.config.workers.queue_timeout();
        let acquire = Arc::clone(&self.workers).acquire_owned();
        tokio::select! {
            () = cancel.cancelled() => Err(BridgeError::Cancelled),
            acquired = tokio::time::timeout(timeout, acquire) => match acquired {
                Ok(Ok(permit)) => Ok(permit),
                Ok(Err(_)) => Err(BridgeError::Shutdown),
                Err(_) => Err(BridgeError::Backpressure { platform: None }),
            },
        }
    }

    async fn dispatch(
        &self,
        request: &AgentRequest,
        estimate: &TokenEstimate,
        cancel: &CancellationToken,
    ) -> Result<AgentResponse, BridgeError> {
        let session_id = request.session_id();

        if !request.context.history.is_empty() {
            match self
                .sessions
                .seed(session_id, request.context.history.clone())
                .await
            {
                Ok(true) => debug!(session = %session_id, "Session seeded from caller history"),
                Ok(false) => {}
                Err(error) => warn!(session = %session_id, error = %error, "Session seed failed"),
            }
        }
        let transcript = self
            .sessions
            .get_context(session_id)
            .await
            .map(|s| s.transcript())
            .unwrap_or_default();
        let platform_request = PlatformRequest::from_agent_request(request).with_context(transcript);

        let decision = self.decide(request, estimate);
        debug!(
            request_id = %request.id,
            target = %decision.target,
            confidence = decision.confidence,
            reason = %decision.reason,
            "Routing decision"
        );

        match decision.target.clone() {
            RoutingTarget::Fallback => {
                self.metrics.fallbacks.inc();
                Err(BridgeError::NoPlatformAvailable {
                    reason: decision.reason,
                })
            }
            RoutingTarget::Single(platform) => {
                self.run_chain(
                    request,
                    &platform_request,
                    estimate,
                    &decision,
                    platform,
                    Attempts::default(),
                    cancel,
                )
                .await
            }
            RoutingTarget::Hybrid(pair) => {
                self.run_hybrid(request, &platform_request, estimate, &decision, pair, cancel)
                    .await
            }
        }
    }

    fn decide(&self, request: &AgentRequest, estimate: &TokenEstimate) -> RoutingDecision {
        let profile = RequestProfile::analyze(request, estimate.tokens);
        let quota = self.quota.borrow().clone();
        let connections = self.connections.statuses();
        let open_circuits = self.breakers.open_circuits();

        let started = Instant::now();
        let decision = self.router.decide(&RoutingInputs {
            request,
            profile: &profile,
            quota: &quota,
            connections: &connections,
            open_circuits: &open_circuits,
        });
        self.metrics.decision_time.record_duration(started.elapsed());
        decision
    }

    /// Try `first`, then at most one further ranked platform
    #[allow(clippy::too_many_arguments)]
    async fn run_chain(
        &self,
        request: &AgentRequest,
        platform_request: &PlatformRequest,
        estimate: &TokenEstimate,
        decision: &RoutingDecision,
        first: PlatformId,
        mut attempts: Attempts,
        cancel: &CancellationToken,
    ) -> Result<AgentResponse, BridgeError> {
        let mut candidate = Some(first);

        while let Some(platform) = candidate.take() {
            attempts.tried.push(platform.clone());

            if self.breakers.try_acquire(&platform) {
                self.metrics.record_dispatch(&platform);
                let sent = Instant::now();
                match self
                    .connections
                    .send_cancellable(&platform, platform_request.clone(), cancel)
                    .await
                {
                    Ok(reply) => {
                        self.breakers.record_success(&platform);
                        return Ok(self
                            .complete_single(request, estimate, decision, &platform, reply, sent, &attempts)
                            .await);
                    }
                    Err(error) => {
                        self.metrics.record_failure(&platform);
                        if error.is_connection_error() {
                            self.breakers.record_failure(&platform);
                        } else {
                            self.breakers.release(&platform);
                        }
                        match error {
                            SendError::Cancelled { .. } => return Err(BridgeError::Cancelled),
                            SendError::Backpressure { platform } => {
                                return Err(BridgeError::Backpressure {
                                    platform: Some(platform),
                                });
                            }
                            SendError::Timeout { timeout_ms, .. } => {
                                attempts.failed.push(attempt(&platform, error.to_string()));
                                return Err(BridgeError::Timeout {
                                    timeout_ms,
                                    attempted: attempts.failed,
                                });
                            }
                            other => {
                                warn!(
                                    request_id = %request.id,
                                    platform = %platform,
                                    error = %other,
                                    "Platform send failed"
                                );
                                attempts.failed.push(attempt(&platform, other.to_string()));
                            }
                        }
                    }
                }
            } else {
                debug!(request_id = %request.id, platform = %platform, "Circuit open, skipping platform");
                attempts.failed.push(attempt(&platform, "circuit breaker open"));
            }

            if !attempts.failover_used {
                if let Some(next) = decision.next_candidate(&attempts.tried) {
                    attempts.failover_used = true;
                    self.metrics.failovers.inc();
                    warn!(
                        request_id = %request.id,
                        from = %platform,
                        to = %next,
                        "Failing over to next platform"
                    );
                    candidate = Some(next.clone());
                }
            }
        }

        Err(BridgeError::AllPlatformsFailed {
            attempted: attempts.failed,
            reason: decision.reason.clone(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn complete_single(
        &self,
        request: &AgentRequest,
        estimate: &TokenEstimate,
        decision: &RoutingDecision,
        platform: &PlatformId,
        reply: PlatformReply,
        sent: Instant,
        attempts: &Attempts,
    ) -> AgentResponse {
        self.metrics.routed_single.inc();
        let token_usage = self.record_usage(request, estimate, platform, &reply);
        self.metrics
            .record_success(platform, sent.elapsed(), token_usage.tokens);

        self.update_session(
            request,
            platform,
            vec![
                HistoryEntry {
                    role: MessageRole::User,
                    content: request.content.clone(),
                },
                HistoryEntry {
                    role: MessageRole::Assistant,
                    content: reply.content.clone(),
                },
            ],
        )
        .await;

        let reason = if attempts.failed.is_empty() {
            decision.reason.clone()
        } else {
            format!(
                "{}; failed over after {}",
                decision.reason,
                describe_attempts(&attempts.failed)
            )
        };

        AgentResponse {
            id: request.id.clone(),
            status: ResponseStatus::Success,
            result: reply.content,
            platform: platform.to_string(),
            token_usage,
            reason: Some(reason),
            partial: false,
            attempted: Vec::new(),
        }
    }

    async fn run_hybrid(
        &self,
        request: &AgentRequest,
        platform_request: &PlatformRequest,
        estimate: &TokenEstimate,
        decision: &RoutingDecision,
        pair: [PlatformId; 2],
        cancel: &CancellationToken,
    ) -> Result<AgentResponse, BridgeError> {
        let acquired: Vec<bool> = pair.iter().map(|p| self.breakers.try_acquire(p)).collect();
        if acquired.iter().any(|ok| !ok) {
            // A half-open probe is already out for one of the pair
            for (platform, ok) in pair.iter().zip(&acquired) {
                if *ok {
                    self.breakers.release(platform);
                }
            }
            let Some(first) = decision.ranked.first().cloned() else {
                self.metrics.fallbacks.inc();
                return Err(BridgeError::NoPlatformAvailable {
                    reason: decision.reason.clone(),
                });
            };
            debug!(request_id = %request.id, "Hybrid pair unavailable, routing to a single platform");
            return self
                .run_chain(
                    request,
                    platform_request,
                    estimate,
                    decision,
                    first,
                    Attempts::default(),
                    cancel,
                )
                .await;
        }

        for platform in &pair {
            self.metrics.record_dispatch(platform);
        }
        let outcome = self
            .hybrid
            .execute(platform_request, pair.clone(), cancel)
            .await;

        match outcome {
            Ok(merged) => Ok(self.complete_hybrid(request, estimate, decision, &pair, merged).await),
            Err(error) => {
                for platform in &pair {
                    self.metrics.record_failure(platform);
                }
                for failure in error.failures() {
                    if failure.is_connection_error() {
                        self.breakers.record_failure(failure.platform());
                    } else {
                        self.breakers.release(failure.platform());
                    }
                }
                let failed: Vec<AttemptSummary> = error
                    .failures()
                    .iter()
                    .map(|f| attempt(f.platform(), f.to_string()))
                    .collect();

                match error {
                    HybridError::Cancelled => {
                        for platform in &pair {
                            self.breakers.release(platform);
                        }
                        Err(BridgeError::Cancelled)
                    }
                    HybridError::TimedOut { timeout_ms, .. } => Err(BridgeError::Timeout {
                        timeout_ms,
                        attempted: failed,
                    }),
                    HybridError::AllFailed { failures } => {
                        let attempts = Attempts {
                            tried: pair.to_vec(),
                            failed,
                            failover_used: true,
                        };
                        let retry = failures.iter().all(SendError::is_connection_error);
                        match decision.next_candidate(&attempts.tried) {
                            Some(next) if retry => {
                                self.metrics.failovers.inc();
                                warn!(
                                    request_id = %request.id,
                                    to = %next,
                                    "Hybrid pair failed, failing over to next platform"
                                );
                                self.run_chain(
                                    request,
                                    platform_request,
                                    estimate,
                                    decision,
                                    next.clone(),
                                    attempts,
                                    cancel,
                                )
                                .await
                            }
                            _ => Err(BridgeError::AllPlatformsFailed {
                                attempted: attempts.failed,
                                reason: decision.reason.clone(),
                            }),
                        }
                    }
                }
            }
        }
    }

    async fn complete_hybrid(
        &self,
        request: &AgentRequest,
        estimate: &TokenEstimate,
        decision: &RoutingDecision,
        pair: &[PlatformId; 2],
        merged: MergedResult,
    ) -> AgentResponse {
        self.metrics.routed_hybrid.inc();
        if merged.partial {
            self.metrics.partial_results.inc();
        }

        for failure in &merged.failures {
            if failure.is_connection_error() {
                self.breakers.record_failure(failure.platform());
            } else {
                self.breakers.release(failure.platform());
            }
            warn!(
                request_id = %request.id,
                platform = %failure.platform(),
                error = %failure,
                "Hybrid sub-request failed"
            );
        }
        for platform in pair {
            if !merged.results.iter().any(|r| &r.platform == platform) {
                self.metrics.record_failure(platform);
            }
        }

        let mut token_usage = TokenUsage::default();
        for (index, result) in merged.results.iter().enumerate() {
            self.breakers.record_success(&result.platform);
            let usage = self.record_usage(request, estimate, &result.platform, &result.reply);
            self.metrics.record_success(
                &result.platform,
                Duration::from_millis(result.elapsed_ms),
                usage.tokens,
            );
            token_usage = token_usage.combine(usage);

            let mut messages = Vec::with_capacity(2);
            if index == 0 {
                messages.push(HistoryEntry {
                    role: MessageRole::User,
                    content: request.content.clone(),
                });
            }
            messages.push(HistoryEntry {
                role: MessageRole::Assistant,
                content: result.reply.content.clone(),
            });
            self.update_session(request, &result.platform, messages).await;
        }

        let platform = merged
            .platforms()
            .iter()
            .map(|p| p.as_str())
            .collect::<Vec<_>>()
            .join("+");
        let reason = if merged.partial {
            format!("{}; partial hybrid result", decision.reason)
        } else {
            decision.reason.clone()
        };

        AgentResponse {
            id: request.id.clone(),
            status: ResponseStatus::Success,
            result: merged.content,
            platform,
            token_usage,
            reason: Some(reason),
            partial: merged.partial,
            attempted: Vec::new(),
        }
    }

    fn record_usage(
        &self,
        request: &AgentRequest,
        estimate: &TokenEstimate,
        platform: &PlatformId,
        reply: &PlatformReply,
    ) -> TokenUsage {
        let record = self.usage.record_usage(
            platform,
            UsageSample {
                request_id: request.id.clone(),
                session_id: request.session_id().clone(),
                tokens_estimated: estimate.tokens,
                tokens_actual: reply.tokens_used,
            },
        );
        TokenUsage {
            tokens: record.tokens(),
            cost: record.cost_estimate,
        }
    }

    async fn update_session(
        &self,
        request: &AgentRequest,
        platform: &PlatformId,
        messages: Vec<HistoryEntry>,
    ) {
        if let Err(error) = self
            .sessions
            .update(request.session_id(), platform, messages)
            .await
        {
            warn!(
                request_id = %request.id,
                session = %request.session_id(),
                error = %error,
                "Session update failed"
            );
        }
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Bookkeeping of one request's platform attempts
#[derive(Debug, Default)]
struct Attempts {
    tried: Vec<PlatformId>,
    failed: Vec<AttemptSummary>,
    failover_used: bool,
}

async fn maintenance_loop(usage: Arc<UsageOptimizer>, every: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => usage.refresh(),
        }
    }
    debug!("Maintenance loop stopped");
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlatformConfig;
    use crate::connection::LoopbackTransport;
    use crate::types::Agent;
    use pretty_assertions::assert_eq;

    fn loopback_bridge(names: &[&str]) -> (Bridge, Vec<Arc<LoopbackTransport>>) {
        let config = BridgeConfig::with_platforms(
            names
                .iter()
                .enumerate()
                .map(|(i, name)| {
                    PlatformConfig::new(*name, "").with_priority(u32::try_from(i).unwrap())
                })
                .collect(),
        );
        let loopbacks: Vec<Arc<LoopbackTransport>> = names
            .iter()
            .map(|name| Arc::new(LoopbackTransport::new(*name)))
            .collect();
        let transports = names
            .iter()
            .zip(&loopbacks)
            .map(|(name, t)| {
                (
                    PlatformId::from(*name),
                    Arc::clone(t) as Arc<dyn PlatformTransport>,
                )
            })
            .collect();
        (Bridge::start(config, transports).unwrap(), loopbacks)
    }

    #[test]
    fn test_worker_config_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.max_concurrent_routes, 64);
        assert_eq!(config.queue_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_error_response_lists_attempts() {
        let error = BridgeError::AllPlatformsFailed {
            attempted: vec![
                attempt(&PlatformId::from("alpha"), "alpha is degraded"),
                attempt(&PlatformId::from("beta"), "circuit breaker open"),
            ],
            reason: "selected alpha: priority".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "all attempted platforms failed: alpha (alpha is degraded), beta (circuit breaker open)"
        );

        let response = error.into_response(RequestId::new("req-1"));
        assert_eq!(response.status, ResponseStatus::Error);
        assert_eq!(response.platform, "none");
        assert_eq!(response.attempted.len(), 2);
        assert_eq!(response.reason.as_deref(), Some("selected alpha: priority"));
    }

    #[test]
    fn test_backpressure_message() {
        assert_eq!(
            BridgeError::Backpressure { platform: None }.to_string(),
            "bridge is at capacity"
        );
        let error = BridgeError::Backpressure {
            platform: Some(PlatformId::from("alpha")),
        };
        assert_eq!(error.to_string(), "alpha has too many requests in flight");
        assert!(error.is_retryable());
        assert!(!BridgeError::Validation("x".to_string()).is_retryable());
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let result = Bridge::start(BridgeConfig::default(), BTreeMap::new());
        assert!(matches!(result, Err(BridgeError::Config(_))));
    }

    #[tokio::test]
    async fn test_empty_content_is_validation_error() {
        let (bridge, loopbacks) = loopback_bridge(&["alpha"]);
        assert!(bridge.wait_until_connected(Duration::from_secs(1)).await);

        let error = bridge
            .route(AgentRequest::new(Agent::Developer, "   ", "s-1"))
            .await
            .unwrap_err();
        assert!(matches!(error, BridgeError::Validation(_)));
        assert_eq!(loopbacks[0].send_count(), 0);
        assert_eq!(bridge.metrics().validation_rejections.get(), 1);
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_single_route_updates_usage_and_session() {
        let (bridge, _loopbacks) = loopback_bridge(&["alpha"]);
        assert!(bridge.wait_until_connected(Duration::from_secs(1)).await);

        let response = bridge
            .route(AgentRequest::new(Agent::Developer, "write a parser", "s-1"))
            .await
            .unwrap();
        assert!(response.is_success());
        assert_eq!(response.platform, "alpha");
        assert_eq!(response.result, "[alpha] write a parser");
        assert!(response.token_usage.tokens > 0);

        let session = bridge.session(&"s-1".into()).await.unwrap();
        assert_eq!(session.context.len(), 2);
        assert!(session.participating_platforms.contains(&PlatformId::from("alpha")));
        assert_eq!(bridge.usage().records(&PlatformId::from("alpha")).len(), 1);
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_routes() {
        let (bridge, _loopbacks) = loopback_bridge(&["alpha"]);
        bridge.shutdown().await;
        let error = bridge
            .route(AgentRequest::new(Agent::Developer, "hello", "s-1"))
            .await
            .unwrap_err();
        assert!(matches!(error, BridgeError::Shutdown));
    }

    #[tokio::test]
    async fn test_worker_pool_backpressure() {
        let mut config = BridgeConfig::with_platforms(vec![PlatformConfig::new("alpha", "")]);
        config.workers.max_concurrent_routes = 1;
        config.workers.queue_timeout_ms = 20;
        let slow = Arc::new(LoopbackTransport::new("alpha").with_latency(Duration::from_millis(300)));
        let transports = BTreeMap::from([(
            PlatformId::from("alpha"),
            Arc::clone(&slow) as Arc<dyn PlatformTransport>,
        )]);
        let bridge = Arc::new(Bridge::start(config, transports).unwrap());
        assert!(bridge.wait_until_connected(Duration::from_secs(1)).await);

        let first = {
            let bridge = Arc::clone(&bridge);
            tokio::spawn(async move {
                bridge
                    .route(AgentRequest::new(Agent::Developer, "first", "s-1"))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let error = bridge
            .route(AgentRequest::new(Agent::Developer, "second", "s-2"))
            .await
            .unwrap_err();
        assert!(matches!(error, BridgeError::Backpressure { platform: None }));
        assert!(first.await.unwrap().is_ok());
        assert_eq!(bridge.metrics().backpressure.get(), 1);
        bridge.shutdown().await;
    }
}
