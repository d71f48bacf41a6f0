//! TOML Configuration File Support
//!
//! Centralized configuration loading for the bridge, from a TOML file at
//! `~/.config/agent-bridge/bridge.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments ([`ConfigOverrides`])
//! 2. Environment variables (`BRIDGE_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [[platforms]]
//! id = "alpha"
//! endpoint = "http://127.0.0.1:7001"
//! priority = 0
//! capacity_tokens = 200000
//! capability = 0.8
//! cost_per_1k_tokens = 0.5
//! quota_tokens = 2000000
//!
//! [[platforms]]
//! id = "beta"
//! endpoint = "http://127.0.0.1:7002"
//! priority = 1
//!
//! [connection]
//! heartbeat_interval_ms = 5000
//! failure_threshold = 3
//!
//! [connection.backoff]
//! base_ms = 1000
//! factor = 2.0
//! max_ms = 30000
//! jitter = 0.2
//!
//! [quota]
//! warning_threshold = 0.2
//! critical_threshold = 0.05
//!
//! [router]
//! token_threshold = 1000
//! complexity_threshold = 0.7
//!
//! [router.agent_preference.architect]
//! alpha = 0.9
//! beta = 0.4
//!
//! [session]
//! window_size = 50
//!
//! [hybrid]
//! timeout_ms = 30000
//! merge = "attributed_concat"   # or "prefer_primary"
//! ```

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bridge::WorkerConfig;
use crate::connection::ConnectionConfig;
use crate::hybrid::HybridConfig;
use crate::routing::{CircuitBreakerConfig, PlatformProfile, RouterConfig};
use crate::session::SessionConfig;
use crate::types::PlatformId;
use crate::usage::{EstimatorConfig, PlatformBudget, QuotaConfig};

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where the configuration came from
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    #[default]
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// Configuration Structures
// =============================================================================

/// One backend platform
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlatformConfig {
    /// Platform id used in decisions, logs and responses
    pub id: PlatformId,

    /// Base URL of the platform's HTTP API
    #[serde(default)]
    pub endpoint: String,

    /// Tie-break rank, lower is preferred
    #[serde(default = "default_priority")]
    pub priority: u32,

    /// Largest context the platform handles comfortably, in tokens
    #[serde(default = "default_capacity")]
    pub capacity_tokens: u64,

    /// Relative reasoning capability in [0, 1]
    #[serde(default = "default_capability")]
    pub capability: f64,

    /// Price per 1000 tokens
    #[serde(default)]
    pub cost_per_1k_tokens: f64,

    /// Tokens allowed per quota window (absent = unlimited)
    #[serde(default)]
    pub quota_tokens: Option<u64>,

    /// Platform-specific warning threshold
    #[serde(default)]
    pub warning_threshold: Option<f64>,

    /// Platform-specific critical threshold
    #[serde(default)]
    pub critical_threshold: Option<f64>,
}

fn default_priority() -> u32 {
    100
}

fn default_capacity() -> u64 {
    PlatformProfile::default().capacity_tokens
}

fn default_capability() -> f64 {
    PlatformProfile::default().capability
}

impl PlatformConfig {
    /// Platform with default characteristics
    pub fn new(id: impl Into<PlatformId>, endpoint: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            endpoint: endpoint.into(),
            priority: default_priority(),
            capacity_tokens: default_capacity(),
            capability: default_capability(),
            cost_per_1k_tokens: 0.0,
            quota_tokens: None,
            warning_threshold: None,
            critical_threshold: None,
        }
    }

    /// Set the tie-break rank
    #[must_use]
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the quota window budget
    #[must_use]
    pub fn with_quota(mut self, quota_tokens: u64) -> Self {
        self.quota_tokens = Some(quota_tokens);
        self
    }

    /// Router profile for this platform
    #[must_use]
    pub fn profile(&self) -> PlatformProfile {
        PlatformProfile {
            capacity_tokens: self.capacity_tokens,
            capability: self.capability,
        }
    }

    /// Optimizer budget for this platform
    #[must_use]
    pub fn budget(&self) -> PlatformBudget {
        PlatformBudget {
            quota_tokens: self.quota_tokens,
            cost_per_1k_tokens: self.cost_per_1k_tokens,
            warning_threshold: self.warning_threshold,
            critical_threshold: self.critical_threshold,
        }
    }
}

/// Complete bridge configuration
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Backend platforms
    pub platforms: Vec<PlatformConfig>,
    /// Connection manager settings
    pub connection: ConnectionConfig,
    /// Quota thresholds and window
    pub quota: QuotaConfig,
    /// Token estimator settings
    pub estimator: EstimatorConfig,
    /// Router weights, thresholds and preferences
    pub router: RouterConfig,
    /// Session synchronizer settings
    pub session: SessionConfig,
    /// Hybrid execution settings
    pub hybrid: HybridConfig,
    /// Circuit breaker settings
    pub circuit_breaker: CircuitBreakerConfig,
    /// Route worker pool settings
    pub workers: WorkerConfig,

    /// Path to the config file that was loaded (if any)
    #[serde(skip)]
    config_file_path: Option<PathBuf>,

    /// Highest-priority source that contributed
    #[serde(skip)]
    source: ConfigSource,
}

impl BridgeConfig {
    /// Defaults with the given platforms
    #[must_use]
    pub fn with_platforms(platforms: Vec<PlatformConfig>) -> Self {
        Self {
            platforms,
            ..Self::default()
        }
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Config file that was loaded, if any
    #[must_use]
    pub fn config_file_path(&self) -> Option<&Path> {
        self.config_file_path.as_deref()
    }

    /// Configured platform ids in declaration order
    #[must_use]
    pub fn platform_ids(&self) -> Vec<PlatformId> {
        self.platforms.iter().map(|p| p.id.clone()).collect()
    }

    /// Router configuration with platform profiles and priority order filled in
    ///
    /// Platforms listed in `router.platform_priority` come first, in that
    /// order; the rest follow by their own `priority`.
    #[must_use]
    pub fn router_config(&self) -> RouterConfig {
        let explicit = &self.router.platform_priority;
        let mut ordered: Vec<(usize, &PlatformConfig)> = self
            .platforms
            .iter()
            .filter(|p| !explicit.contains(&p.id))
            .enumerate()
            .collect();
        ordered.sort_by_key(|(index, p)| (p.priority, *index));

        let mut router = self.router.clone();
        router.platform_priority = explicit
            .iter()
            .filter(|id| self.platforms.iter().any(|p| &p.id == *id))
            .cloned()
            .chain(ordered.iter().map(|(_, p)| p.id.clone()))
            .collect();
        for platform in &self.platforms {
            router.platforms.insert(platform.id.clone(), platform.profile());
        }
        router
    }

    /// Check the configuration for values the bridge cannot run with
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] naming the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::ValidationError(msg));

        if self.platforms.is_empty() {
            return invalid("at least one platform must be configured".to_string());
        }

        let mut seen = BTreeSet::new();
        for platform in &self.platforms {
            if platform.id.as_str().is_empty() {
                return invalid("platform id must not be empty".to_string());
            }
            if !seen.insert(&platform.id) {
                return invalid(format!("duplicate platform id '{}'", platform.id));
            }
            if !(0.0..=1.0).contains(&platform.capability) {
                return invalid(format!(
                    "platform '{}': capability {} is outside [0, 1]",
                    platform.id, platform.capability
                ));
            }
            let warning = platform.warning_threshold.unwrap_or(self.quota.warning_threshold);
            let critical = platform.critical_threshold.unwrap_or(self.quota.critical_threshold);
            check_thresholds(&format!("platform '{}'", platform.id), warning, critical)?;
        }

        let mut listed = BTreeSet::new();
        for id in &self.router.platform_priority {
            if !seen.contains(id) {
                return invalid(format!("router.platform_priority names unknown platform '{id}'"));
            }
            if !listed.insert(id) {
                return invalid(format!("router.platform_priority lists '{id}' twice"));
            }
        }

        check_thresholds(
            "quota",
            self.quota.warning_threshold,
            self.quota.critical_threshold,
        )?;

        if self.session.window_size == 0 {
            return invalid("session.window_size must be at least 1".to_string());
        }
        if self.connection.max_in_flight == 0 {
            return invalid("connection.max_in_flight must be at least 1".to_string());
        }
        if self.connection.failure_threshold == 0 {
            return invalid("connection.failure_threshold must be at least 1".to_string());
        }
        if self.estimator.chars_per_token <= 0.0 || !self.estimator.chars_per_token.is_finite() {
            return invalid(format!(
                "estimator.chars_per_token must be positive, got {}",
                self.estimator.chars_per_token
            ));
        }
        let jitter = self.connection.backoff.jitter;
        if !(0.0..1.0).contains(&jitter) {
            return invalid(format!("connection.backoff.jitter {jitter} is outside [0, 1)"));
        }
        if self.connection.backoff.factor < 1.0 {
            return invalid(format!(
                "connection.backoff.factor must be at least 1, got {}",
                self.connection.backoff.factor
            ));
        }
        if self.workers.max_concurrent_routes == 0 {
            return invalid("workers.max_concurrent_routes must be at least 1".to_string());
        }
        if self.hybrid.timeout_ms == 0 {
            return invalid("hybrid.timeout_ms must be at least 1".to_string());
        }
        Ok(())
    }
}

fn check_thresholds(scope: &str, warning: f64, critical: f64) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&warning) || !(0.0..=1.0).contains(&critical) {
        return Err(ConfigError::ValidationError(format!(
            "{scope}: thresholds must be within [0, 1] (warning {warning}, critical {critical})"
        )));
    }
    if critical >= warning {
        return Err(ConfigError::ValidationError(format!(
            "{scope}: critical threshold {critical} must be below warning threshold {warning}"
        )));
    }
    Ok(())
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/agent-bridge/bridge.toml` or
/// `~/.config/agent-bridge/bridge.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("agent-bridge").join("bridge.toml"))
}

/// Load configuration from all sources with proper priority
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed.
/// A missing config file is not an error (defaults are used).
pub fn load_config() -> Result<BridgeConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<BridgeConfig, ConfigError> {
    load_config_with_env(path, |key| std::env::var(key).ok())
}

/// Load configuration, reading environment variables through `env`
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
pub fn load_config_with_env(
    path: Option<PathBuf>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<BridgeConfig, ConfigError> {
    let mut config = BridgeConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            config = toml::from_str(&toml_content)?;
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                platforms = config.platforms.len(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, env);
    Ok(config)
}

/// Parse `key` through `env`, ignoring unparsable values
fn env_value<T: std::str::FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = env(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparsable environment variable");
            None
        }
    }
}

/// Apply environment variable overrides to the config
fn apply_env_config(config: &mut BridgeConfig, env: impl Fn(&str) -> Option<String>) {
    let mut touched = false;

    if let Some(ms) = env_value(&env, "BRIDGE_HEARTBEAT_INTERVAL_MS") {
        config.connection.heartbeat_interval_ms = ms;
        touched = true;
    }
    if let Some(ms) = env_value(&env, "BRIDGE_REQUEST_TIMEOUT_MS") {
        config.connection.request_timeout_ms = ms;
        touched = true;
    }
    if let Some(n) = env_value(&env, "BRIDGE_MAX_IN_FLIGHT") {
        config.connection.max_in_flight = n;
        touched = true;
    }
    if let Some(threshold) = env_value(&env, "BRIDGE_QUOTA_WARNING") {
        config.quota.warning_threshold = threshold;
        touched = true;
    }
    if let Some(threshold) = env_value(&env, "BRIDGE_QUOTA_CRITICAL") {
        config.quota.critical_threshold = threshold;
        touched = true;
    }
    if let Some(size) = env_value(&env, "BRIDGE_SESSION_WINDOW") {
        config.session.window_size = size;
        touched = true;
    }
    if let Some(secs) = env_value(&env, "BRIDGE_SESSION_IDLE_TTL_SECS") {
        config.session.idle_ttl_secs = secs;
        touched = true;
    }
    if let Some(ms) = env_value(&env, "BRIDGE_HYBRID_TIMEOUT_MS") {
        config.hybrid.timeout_ms = ms;
        touched = true;
    }
    if let Some(strategy) = env_value(&env, "BRIDGE_HYBRID_MERGE") {
        config.hybrid.merge = strategy;
        touched = true;
    }
    if let Some(n) = env_value(&env, "BRIDGE_MAX_CONCURRENT_ROUTES") {
        config.workers.max_concurrent_routes = n;
        touched = true;
    }

    if touched {
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Session window size override
    pub session_window: Option<usize>,

    /// Hybrid timeout override (milliseconds)
    pub hybrid_timeout_ms: Option<u64>,

    /// Heartbeat interval override (milliseconds)
    pub heartbeat_interval_ms: Option<u64>,

    /// Route concurrency override
    pub max_concurrent_routes: Option<usize>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set session window override
    #[must_use]
    pub fn with_session_window(mut self, size: usize) -> Self {
        self.session_window = Some(size);
        self
    }

    /// Set hybrid timeout override
    #[must_use]
    pub fn with_hybrid_timeout_ms(mut self, ms: u64) -> Self {
        self.hybrid_timeout_ms = Some(ms);
        self
    }

    /// Set heartbeat interval override
    #[must_use]
    pub fn with_heartbeat_interval_ms(mut self, ms: u64) -> Self {
        self.heartbeat_interval_ms = Some(ms);
        self
    }

    /// Set route concurrency override
    #[must_use]
    pub fn with_max_concurrent_routes(mut self, n: usize) -> Self {
        self.max_concurrent_routes = Some(n);
        self
    }

    /// Whether any override is set
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.session_window.is_none()
            && self.hybrid_timeout_ms.is_none()
            && self.heartbeat_interval_ms.is_none()
            && self.max_concurrent_routes.is_none()
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut BridgeConfig) {
        if self.is_empty() {
            return;
        }
        config.source = ConfigSource::Cli;

        if let Some(size) = self.session_window {
            config.session.window_size = size;
        }
        if let Some(ms) = self.hybrid_timeout_ms {
            config.hybrid.timeout_ms = ms;
        }
        if let Some(ms) = self.heartbeat_interval_ms {
            config.connection.heartbeat_interval_ms = ms;
        }
        if let Some(n) = self.max_concurrent_routes {
            config.workers.max_concurrent_routes = n;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
