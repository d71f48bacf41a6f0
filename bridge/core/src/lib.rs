//! agent-bridge core
//!
//! Routes agent requests across several backend AI platforms. Each request is
//! sent to the platform best suited to it, or to two platforms at once when
//! their scores are close and the request is complex. Conversation state is
//! kept in sync across every platform that has taken part in a session.
//!
//! # Architecture
//!
//! ```text
//!   caller ──▶ Bridge::route
//!                 │
//!                 ├──▶ UsageOptimizer::estimate_cost ──▶ RequestProfile
//!                 ├──▶ Router::decide (pure) ◀── QuotaBoard (watch)
//!                 │                          ◀── ConnectionManager::statuses
//!                 │                          ◀── CircuitBreakers::open_circuits
//!                 ├──▶ ConnectionManager::send        (single platform)
//!                 ├──▶ HybridEngine::execute          (two platforms)
//!                 ├──▶ UsageOptimizer::record_usage
//!                 └──▶ SessionSynchronizer::update ──▶ propagate to participants
//! ```
//!
//! # Modules
//!
//! - [`types`]: request/response wire types and identifiers
//! - [`connection`]: supervised per-platform connections and transports
//! - [`usage`]: token estimation, usage records and quota tracking
//! - [`routing`]: request profiling, the pure router and circuit breakers
//! - [`session`]: per-session actors with a bounded merged context
//! - [`hybrid`]: two-platform fan-out with pluggable merging
//! - [`bridge`]: the facade tying everything together
//! - [`metrics`]: counters and latency histograms
//! - [`config`]: TOML, environment and CLI configuration

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod bridge;
pub mod config;
pub mod connection;
pub mod hybrid;
pub mod metrics;
pub mod routing;
pub mod session;
pub mod types;
pub mod usage;

pub use bridge::{Bridge, BridgeError, PlatformHealth, WorkerConfig};
pub use config::{BridgeConfig, ConfigError, ConfigOverrides, ConfigSource, PlatformConfig};
pub use connection::{
    ConnectionConfig, ConnectionManager, ConnectionStatus, HttpTransport, LoopbackTransport,
    PlatformTransport, SendError,
};
pub use hybrid::{
    AttributedConcat, HybridEngine, HybridError, MergePolicy, MergeStrategy, MergedResult,
    PreferPrimary,
};
pub use metrics::{BridgeMetrics, MetricsSummary};
pub use routing::{Router, RouterConfig, RoutingDecision, RoutingTarget};
pub use session::{Session, SessionConfig, SessionSynchronizer};
pub use types::{
    Agent, AgentRequest, AgentResponse, MessageRole, PlatformId, Priority, RequestId,
    ResponseStatus, SessionId, TokenUsage,
};
pub use usage::{QuotaLevel, QuotaStatus, UsageOptimizer, UsageRecord};
