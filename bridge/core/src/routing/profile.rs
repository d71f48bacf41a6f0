//! Request profiling
//!
//! Derives the router's `context` input from a request: what kind of work it
//! is and how complex it looks. Everything here is a pure function of the
//! request text and attachments.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::AgentRequest;

/// Kind of work a request asks for
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    /// Writing or changing code
    CodeGeneration,
    /// Reviewing existing work
    Review,
    /// Investigation, comparison, design reasoning
    Analysis,
    /// Prose for humans
    Documentation,
    /// Roadmaps, estimates, backlog work
    Planning,
    /// Anything else
    #[default]
    General,
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CodeGeneration => "code_generation",
            Self::Review => "review",
            Self::Analysis => "analysis",
            Self::Documentation => "documentation",
            Self::Planning => "planning",
            Self::General => "general",
        };
        f.write_str(name)
    }
}

/// Keywords that suggest a request is hard
const COMPLEXITY_KEYWORDS: &[&str] = &[
    "architecture",
    "distributed",
    "concurren",
    "security",
    "performance",
    "migrat",
    "trade-off",
    "tradeoff",
    "scalab",
    "refactor",
    "step by step",
    "multi-step",
    "design",
];

/// Router input derived from a request
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct RequestProfile {
    /// Estimated tokens for the request
    pub estimated_tokens: u64,

    /// Complexity score in [0, 1]
    pub complexity: f64,

    /// Kind of work
    pub request_type: RequestType,
}

impl RequestProfile {
    /// Build a profile from explicit values
    #[must_use]
    pub fn new(estimated_tokens: u64, complexity: f64, request_type: RequestType) -> Self {
        Self {
            estimated_tokens,
            complexity: complexity.clamp(0.0, 1.0),
            request_type,
        }
    }

    /// Profile a request given its token estimate
    #[must_use]
    pub fn analyze(request: &AgentRequest, estimated_tokens: u64) -> Self {
        Self::new(
            estimated_tokens,
            complexity_of(request),
            classify(&request.content),
        )
    }
}

/// Classify request text
#[must_use]
pub fn classify(content: &str) -> RequestType {
    let text = content.to_lowercase();

    if text.contains("review")
        || text.contains("audit")
        || text.contains("test plan")
        || text.contains("critique")
    {
        return RequestType::Review;
    }

    if text.contains("implement")
        || text.contains("function")
        || text.contains("refactor")
        || text.contains("```")
        || text.contains("bug")
        || text.contains("fix")
        || text.contains("code")
    {
        return RequestType::CodeGeneration;
    }

    if text.contains("analyze")
        || text.contains("analyse")
        || text.contains("investigate")
        || text.contains("compare")
        || text.contains("evaluate")
        || text.contains("architecture")
    {
        return RequestType::Analysis;
    }

    if text.contains("document")
        || text.contains("readme")
        || text.contains("explain")
        || text.contains("write up")
    {
        return RequestType::Documentation;
    }

    if text.contains("plan")
        || text.contains("roadmap")
        || text.contains("sprint")
        || text.contains("estimate")
        || text.contains("prioriti")
        || text.contains("user stor")
    {
        return RequestType::Planning;
    }

    RequestType::General
}

/// Complexity score in [0, 1]
///
/// Sum of four capped signals: length (0.4), keywords (0.45),
/// history depth (0.05) and attached files (0.1).
#[must_use]
pub fn complexity_of(request: &AgentRequest) -> f64 {
    let text = request.content.to_lowercase();

    let words = request.content.split_whitespace().count() as f64;
    let length = (words / 400.0).min(0.4);

    let hits = COMPLEXITY_KEYWORDS
        .iter()
        .filter(|k| text.contains(*k))
        .count() as f64;
    let keywords = (hits * 0.15).min(0.45);

    let history = (request.context.history.len() as f64 / 40.0).min(0.05);
    let files = (request.context.project_files.len() as f64 / 20.0).min(0.1);

    (length + keywords + history + files).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Agent;

    #[test]
    fn test_classify() {
        assert_eq!(classify("Please review my PR"), RequestType::Review);
        assert_eq!(classify("implement a parser"), RequestType::CodeGeneration);
        assert_eq!(classify("compare these databases"), RequestType::Analysis);
        assert_eq!(classify("write a README"), RequestType::Documentation);
        assert_eq!(classify("plan the next sprint"), RequestType::Planning);
        assert_eq!(classify("good morning"), RequestType::General);
    }

    #[test]
    fn test_complexity_grows_with_signals() {
        let simple = AgentRequest::new(Agent::Developer, "rename this variable", "s");
        let hard = AgentRequest::new(
            Agent::Architect,
            "design a distributed architecture with security and performance trade-off analysis",
            "s",
        );
        let simple_score = complexity_of(&simple);
        let hard_score = complexity_of(&hard);
        assert!(simple_score < 0.1);
        assert!(hard_score >= 0.45);
        assert!(hard_score <= 1.0);
    }

    #[test]
    fn test_profile_clamps_complexity() {
        let profile = RequestProfile::new(10, 1.7, RequestType::General);
        assert!((profile.complexity - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_analyze_is_deterministic() {
        let request = AgentRequest::new(Agent::Analyst, "evaluate the migration plan", "s");
        assert_eq!(
            RequestProfile::analyze(&request, 42),
            RequestProfile::analyze(&request, 42)
        );
    }
}
