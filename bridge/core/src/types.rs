//! Bridge Request and Response Types
//!
//! The wire-level vocabulary shared by the bridge and its external
//! collaborators. Requests come in as [`AgentRequest`], results go out as
//! [`AgentResponse`]; both are JSON-shaped and transport-agnostic.
//!
//! ```text
//! {                                        {
//!   "id": "req-1",                           "id": "req-1",
//!   "agent": "architect",                    "status": "success",
//!   "content": "...",          Route()       "result": "...",
//!   "context": {             ───────────▶    "platform": "claude",
//!     "sessionId": "s-1",                    "tokenUsage": { "tokens": 812, "cost": 0.012 },
//!     "history": [...],                      "reason": "selected claude: ..."
//!     "projectFiles": [...]                }
//!   },
//!   "priority": "normal"
//! }
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

// ============================================================================
// Identifiers
// ============================================================================

/// Identifier of a backend execution platform (e.g. `"claude"`)
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlatformId(String);

impl PlatformId {
    /// Create a platform identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the identifier as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlatformId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PlatformId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Identifier of a continuity session shared across platforms
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Create a session identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random session identifier
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("session_{}", uuid::Uuid::new_v4().simple()))
    }

    /// Get the identifier as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Opaque, caller-assigned request identifier
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Create a request identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random request identifier
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("req_{}", uuid::Uuid::new_v4().simple()))
    }

    /// Get the identifier as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Agents and priorities
// ============================================================================

/// Named agent roles a request can be addressed to
///
/// The agent is only a routing-preference input; the bridge attaches no
/// behavior to it beyond looking up `agent_preference` weights.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Agent {
    /// Product management
    Pm,
    /// System architecture
    Architect,
    /// Implementation
    Developer,
    /// Testing and quality review
    QualityAnalyst,
    /// User experience
    UxExpert,
    /// Process facilitation
    ScrumMaster,
    /// Requirements and business analysis
    Analyst,
}

impl Agent {
    /// Configuration key for this agent
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pm => "pm",
            Self::Architect => "architect",
            Self::Developer => "developer",
            Self::QualityAnalyst => "quality_analyst",
            Self::UxExpert => "ux_expert",
            Self::ScrumMaster => "scrum_master",
            Self::Analyst => "analyst",
        }
    }
}

impl fmt::Display for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request priority, forwarded to platforms
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Background work
    Low,
    /// Default priority
    #[default]
    Normal,
    /// User is waiting
    High,
    /// Must not be delayed
    Critical,
}

// ============================================================================
// Request
// ============================================================================

/// Who produced a piece of conversation history
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    /// The human (or upstream tool) driving the session
    User,
    /// A platform's reply
    Assistant,
    /// Instructions or bridge-generated notes
    System,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::System => write!(f, "system"),
        }
    }
}

/// One entry of caller-supplied conversation history
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Author of the entry
    pub role: MessageRole,
    /// Entry text
    pub content: String,
}

/// A project file attached to the request
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectFile {
    /// Path relative to the project root
    pub path: String,
    /// File contents, if the caller chose to inline them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// Context attached to a request
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    /// Session this request belongs to
    pub session_id: SessionId,
    /// Conversation history as the caller sees it
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    /// Project files relevant to the request
    #[serde(default)]
    pub project_files: Vec<ProjectFile>,
}

impl RequestContext {
    /// Create an empty context for a session
    pub fn new(session_id: impl Into<SessionId>) -> Self {
        Self {
            session_id: session_id.into(),
            history: Vec::new(),
            project_files: Vec::new(),
        }
    }

    /// Total characters of history and inlined file content
    #[must_use]
    pub fn payload_chars(&self) -> usize {
        let history: usize = self.history.iter().map(|h| h.content.chars().count()).sum();
        let files: usize = self
            .project_files
            .iter()
            .map(|f| f.path.chars().count() + f.content.as_deref().map_or(0, |c| c.chars().count()))
            .sum();
        history + files
    }
}

/// A request addressed to one of the known agents
///
/// Requests are never mutated after creation; the bridge shares them by
/// reference for the whole routing flow.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRequest {
    /// Unique request identifier
    pub id: RequestId,
    /// Target agent role
    pub agent: Agent,
    /// Request text
    pub content: String,
    /// Session and supporting context
    pub context: RequestContext,
    /// Request priority
    #[serde(default)]
    pub priority: Priority,
}

impl AgentRequest {
    /// Create a request with a generated id, empty context and normal priority
    pub fn new(agent: Agent, content: impl Into<String>, session_id: impl Into<SessionId>) -> Self {
        Self {
            id: RequestId::generate(),
            agent,
            content: content.into(),
            context: RequestContext::new(session_id),
            priority: Priority::Normal,
        }
    }

    /// Set an explicit request id
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = RequestId::new(id);
        self
    }

    /// Set priority
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Append a history entry
    #[must_use]
    pub fn with_history(mut self, role: MessageRole, content: impl Into<String>) -> Self {
        self.context.history.push(HistoryEntry {
            role,
            content: content.into(),
        });
        self
    }

    /// Attach a project file
    #[must_use]
    pub fn with_file(mut self, path: impl Into<String>, content: Option<String>) -> Self {
        self.context.project_files.push(ProjectFile {
            path: path.into(),
            content,
        });
        self
    }

    /// Session this request belongs to
    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        &self.context.session_id
    }
}

// ============================================================================
// Response
// ============================================================================

/// Outcome of a routed request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    /// A result was produced (possibly partial)
    Success,
    /// No result could be produced
    Error,
}

/// Token usage attributed to a response
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens consumed across all platforms that contributed
    pub tokens: u64,
    /// Estimated cost in configured currency units
    pub cost: f64,
}

impl TokenUsage {
    /// Sum two usages
    #[must_use]
    pub fn combine(self, other: Self) -> Self {
        Self {
            tokens: self.tokens + other.tokens,
            cost: self.cost + other.cost,
        }
    }
}

/// A platform that was tried and why it failed
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptSummary {
    /// Platform that was tried
    pub platform: String,
    /// Why it failed
    pub reason: String,
}

/// Unified response returned to external collaborators
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentResponse {
    /// Identifier of the request this answers
    pub id: RequestId,
    /// Success or error
    pub status: ResponseStatus,
    /// Result text, or the error message
    pub result: String,
    /// Platform (or `a+b` for hybrid) that produced the result
    pub platform: String,
    /// Combined token usage
    pub token_usage: TokenUsage,
    /// Routing trace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Set when a hybrid execution returned only one of its two results
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub partial: bool,
    /// Platforms tried before giving up (errors only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attempted: Vec<AttemptSummary>,
}

impl AgentResponse {
    /// Build an error response without any routing information
    pub fn error(id: RequestId, message: impl Into<String>) -> Self {
        Self {
            id,
            status: ResponseStatus::Error,
            result: message.into(),
            platform: "none".to_string(),
            token_usage: TokenUsage::default(),
            reason: None,
            partial: false,
            attempted: Vec::new(),
        }
    }

    /// Whether this response carries a result
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_request_wire_shape() {
        let json = r#"{
            "id": "req-1",
            "agent": "quality_analyst",
            "content": "review this",
            "context": {
                "sessionId": "s-1",
                "history": [{"role": "user", "content": "hi"}],
                "projectFiles": [{"path": "src/lib.rs"}]
            },
            "priority": "high"
        }"#;

        let request: AgentRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.id.as_str(), "req-1");
        assert_eq!(request.agent, Agent::QualityAnalyst);
        assert_eq!(request.session_id().as_str(), "s-1");
        assert_eq!(request.context.history.len(), 1);
        assert_eq!(request.context.project_files[0].path, "src/lib.rs");
        assert_eq!(request.priority, Priority::High);
    }

    #[test]
    fn test_request_defaults() {
        let json = r#"{"id":"r","agent":"pm","content":"x","context":{"sessionId":"s"}}"#;
        let request: AgentRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.priority, Priority::Normal);
        assert!(request.context.history.is_empty());
        assert!(request.context.project_files.is_empty());
    }

    #[test]
    fn test_response_wire_shape() {
        let response = AgentResponse {
            id: RequestId::new("req-1"),
            status: ResponseStatus::Success,
            result: "done".to_string(),
            platform: "claude".to_string(),
            token_usage: TokenUsage {
                tokens: 10,
                cost: 0.5,
            },
            reason: None,
            partial: false,
            attempted: Vec::new(),
        };

        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["status"], "success");
        assert_eq!(value["tokenUsage"]["tokens"], 10);
        assert!(value.get("reason").is_none());
        assert!(value.get("partial").is_none());
        assert!(value.get("attempted").is_none());
    }

    #[test]
    fn test_payload_chars() {
        let request = AgentRequest::new(Agent::Developer, "x", "s")
            .with_history(MessageRole::User, "abcd")
            .with_file("a.rs", Some("12345".to_string()));
        assert_eq!(request.context.payload_chars(), 4 + 4 + 5);
    }

    #[test]
    fn test_token_usage_combine() {
        let total = TokenUsage { tokens: 3, cost: 1.0 }.combine(TokenUsage { tokens: 4, cost: 0.5 });
        assert_eq!(total.tokens, 7);
        assert!((total.cost - 1.5).abs() < f64::EPSILON);
    }
}
