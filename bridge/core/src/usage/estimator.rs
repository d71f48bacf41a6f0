//! Token cost estimation
//!
//! Estimates are a deterministic function of the request: payload size
//! divided by a fixed characters-per-token ratio, plus an additive weight for
//! every configured "high cost" keyword category found in the request text.

use serde::{Deserialize, Serialize};

use crate::types::AgentRequest;

/// A keyword category that makes requests more expensive
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostCategory {
    /// Category name reported in estimates
    pub name: String,

    /// Case-insensitive keywords; any match applies the weight once
    pub keywords: Vec<String>,

    /// Tokens added when the category matches
    pub weight: u64,
}

impl CostCategory {
    /// Create a category
    pub fn new(name: impl Into<String>, keywords: &[&str], weight: u64) -> Self {
        Self {
            name: name.into(),
            keywords: keywords.iter().map(|k| (*k).to_string()).collect(),
            weight,
        }
    }
}

/// Estimator parameters
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    /// Characters per token
    pub chars_per_token: f64,

    /// Keyword categories with additive weight
    pub high_cost: Vec<CostCategory>,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            chars_per_token: 4.0,
            high_cost: vec![
                CostCategory::new(
                    "code_generation",
                    &["implement", "refactor", "generate code", "write a function", "scaffold"],
                    400,
                ),
                CostCategory::new(
                    "deep_analysis",
                    &["analyze", "analyse", "architecture", "trade-off", "security audit", "performance"],
                    300,
                ),
                CostCategory::new(
                    "long_form",
                    &["document", "specification", "report", "comprehensive"],
                    250,
                ),
            ],
        }
    }
}

/// Result of estimating a request
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TokenEstimate {
    /// Total estimated tokens
    pub tokens: u64,

    /// Tokens attributable to payload size alone
    pub payload_tokens: u64,

    /// Names of matched high-cost categories, in configuration order
    pub categories: Vec<String>,
}

/// Deterministic token estimator
#[derive(Clone, Debug)]
pub struct CostEstimator {
    config: EstimatorConfig,
    /// Lowercased keywords per category
    keywords: Vec<Vec<String>>,
}

impl CostEstimator {
    /// Create an estimator
    #[must_use]
    pub fn new(config: EstimatorConfig) -> Self {
        let keywords = config
            .high_cost
            .iter()
            .map(|c| c.keywords.iter().map(|k| k.to_lowercase()).collect())
            .collect();
        Self { config, keywords }
    }

    /// Estimate the tokens a request will consume
    #[must_use]
    pub fn estimate(&self, request: &AgentRequest) -> TokenEstimate {
        let chars = request.content.chars().count() + request.context.payload_chars();
        let ratio = if self.config.chars_per_token > 0.0 {
            self.config.chars_per_token
        } else {
            4.0
        };
        let payload_tokens = (chars as f64 / ratio).ceil() as u64;

        let text = request.content.to_lowercase();
        let mut tokens = payload_tokens;
        let mut categories = Vec::new();
        for (category, keywords) in self.config.high_cost.iter().zip(&self.keywords) {
            if keywords.iter().any(|k| !k.is_empty() && text.contains(k.as_str())) {
                tokens = tokens.saturating_add(category.weight);
                categories.push(category.name.clone());
            }
        }

        TokenEstimate {
            tokens,
            payload_tokens,
            categories,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Agent, MessageRole};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_payload_ratio() {
        let estimator = CostEstimator::new(EstimatorConfig {
            chars_per_token: 4.0,
            high_cost: Vec::new(),
        });
        let request = AgentRequest::new(Agent::Pm, "x".repeat(10), "s");
        let estimate = estimator.estimate(&request);
        assert_eq!(estimate.payload_tokens, 3);
        assert_eq!(estimate.tokens, 3);
        assert!(estimate.categories.is_empty());
    }

    #[test]
    fn test_context_counts_towards_payload() {
        let estimator = CostEstimator::new(EstimatorConfig {
            chars_per_token: 1.0,
            high_cost: Vec::new(),
        });
        let request = AgentRequest::new(Agent::Pm, "abc", "s").with_history(MessageRole::User, "de");
        assert_eq!(estimator.estimate(&request).tokens, 5);
    }

    #[test]
    fn test_keyword_categories_add_weight_once() {
        let estimator = CostEstimator::new(EstimatorConfig {
            chars_per_token: 1000.0,
            high_cost: vec![
                CostCategory::new("code", &["Implement", "refactor"], 100),
                CostCategory::new("docs", &["document"], 50),
            ],
        });
        let request = AgentRequest::new(Agent::Developer, "implement and REFACTOR the parser", "s");
        let estimate = estimator.estimate(&request);
        assert_eq!(estimate.categories, vec!["code".to_string()]);
        assert_eq!(estimate.tokens, 1 + 100);
    }

    #[test]
    fn test_empty_request_estimates_zero() {
        let estimator = CostEstimator::new(EstimatorConfig::default());
        let request = AgentRequest::new(Agent::Pm, "", "s");
        assert_eq!(estimator.estimate(&request).tokens, 0);
    }

    #[test]
    fn test_deterministic() {
        let estimator = CostEstimator::new(EstimatorConfig::default());
        let request = AgentRequest::new(Agent::Architect, "analyze the architecture", "s");
        assert_eq!(estimator.estimate(&request), estimator.estimate(&request));
    }
}
