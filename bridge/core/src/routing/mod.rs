//! Intelligent Router
//!
//! Turns a request plus the bridge's current view of the world into a
//! [`RoutingDecision`]. The decision itself is a pure function; the facade
//! gathers the inputs (quota board, connection statuses, open circuits) and
//! hands them over in a [`RoutingInputs`].
//!
//! ```text
//!   AgentRequest ──▶ CostEstimator ──▶ RequestProfile ─┐
//!   QuotaBoard ────────────────────────────────────────┤
//!   ConnectionStatus per platform ─────────────────────┼──▶ Router::decide ──▶ RoutingDecision
//!   CircuitBreakers::open_circuits ────────────────────┘
//! ```

mod circuit;
mod policy;
mod profile;

pub use circuit::{CircuitBreakerConfig, CircuitBreakers, CircuitSnapshot, CircuitState};
pub use policy::{
    PlatformProfile, Router, RouterConfig, RoutingDecision, RoutingFactor, RoutingInputs,
    RoutingTarget, ScoringWeights,
};
pub use profile::{classify, complexity_of, RequestProfile, RequestType};
