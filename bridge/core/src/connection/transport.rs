//! Platform Transport Trait
//!
//! The seam between the connection manager and a concrete backend platform.
//! The manager owns lifecycle (connect, heartbeat, backoff, in-flight bound);
//! a transport only knows how to talk to its platform.
//!
//! Implementations:
//! - [`HttpTransport`](super::HttpTransport): JSON over HTTP
//! - [`LoopbackTransport`](super::LoopbackTransport): in-process echo platform

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::Session;
use crate::types::{Agent, AgentRequest, Priority, ProjectFile, RequestId, SessionId};

/// Request forwarded to a single platform
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformRequest {
    /// Originating request id
    pub request_id: RequestId,
    /// Session the request belongs to
    pub session_id: SessionId,
    /// Agent role the request is addressed to
    pub agent: Agent,
    /// Request priority
    pub priority: Priority,
    /// Request text
    pub content: String,
    /// Rendered cross-platform session transcript
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Project files attached by the caller
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub project_files: Vec<ProjectFile>,
}

impl PlatformRequest {
    /// Build a platform request from an agent request
    #[must_use]
    pub fn from_agent_request(request: &AgentRequest) -> Self {
        Self {
            request_id: request.id.clone(),
            session_id: request.context.session_id.clone(),
            agent: request.agent,
            priority: request.priority,
            content: request.content.clone(),
            context: None,
            project_files: request.context.project_files.clone(),
        }
    }

    /// Attach a rendered session transcript
    #[must_use]
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        let context = context.into();
        self.context = (!context.is_empty()).then_some(context);
        self
    }
}

/// Reply from a platform
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformReply {
    /// Reply text
    pub content: String,
    /// Tokens the platform reports having used
    #[serde(default)]
    pub tokens_used: Option<u64>,
    /// Platform-side processing time in milliseconds
    #[serde(default)]
    pub duration_ms: Option<u64>,
}

impl PlatformReply {
    /// Reply with content only
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tokens_used: None,
            duration_ms: None,
        }
    }
}

/// Transport-level failure
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Platform could not be reached
    #[error("platform unreachable: {0}")]
    Unreachable(String),

    /// Platform answered with a non-success status
    #[error("platform returned status {code}: {body}")]
    Status {
        /// HTTP-style status code
        code: u16,
        /// Response body (truncated)
        body: String,
    },

    /// Reply could not be decoded
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Operation did not finish in time
    #[error("timed out")]
    Timeout,
}

/// A connection to one backend platform
#[async_trait]
pub trait PlatformTransport: Send + Sync {
    /// Transport kind for logs (e.g. "http", "loopback")
    fn kind(&self) -> &str;

    /// Establish (or re-establish) the connection
    async fn connect(&self) -> Result<(), TransportError>;

    /// Liveness probe, called on every heartbeat tick
    async fn heartbeat(&self) -> Result<(), TransportError>;

    /// Send a request and wait for the reply
    async fn send(&self, request: &PlatformRequest) -> Result<PlatformReply, TransportError>;

    /// Push the merged session context to the platform
    async fn sync_context(&self, session: &Session) -> Result<(), TransportError>;
}
