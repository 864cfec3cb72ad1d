//! Pipeline configuration
//!
//! Loaded from TOML. Credentials never live in the file: each provider names
//! the environment variable holding its API key, resolved when the registry
//! is built.

use crate::budget::BudgetLimits;
use crate::llm::provider::LlmProvider;
use crate::llm::providers::{AnthropicConfig, AnthropicProvider, OpenAiConfig, OpenAiProvider};
use crate::pipeline::{Stage, DEFAULT_MAX_RETRIES};
use crate::registry::{FailoverError, ProviderRegistry, ProviderSpec};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Paths searched when no config file is given
pub const DEFAULT_CONFIG_PATHS: &[&str] = &["tripflow.toml", "config/tripflow.toml"];

/// Top-level configuration file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PipelineConfig {
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub budget: BudgetLimits,
    #[serde(default)]
    pub failover: FailoverSection,
    #[serde(default)]
    pub agents: AgentsSection,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

/// Scheduler settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineSection {
    /// Consecutive stage failures tolerated before a session fails
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Timeout for one agent call
    #[serde(default = "default_stage_timeout_ms")]
    pub stage_timeout_ms: u64,
    /// Per-stage overrides keyed by stage name
    #[serde(default)]
    pub stage_timeouts: HashMap<String, u64>,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_stage_timeout_ms() -> u64 {
    120_000
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            stage_timeout_ms: default_stage_timeout_ms(),
            stage_timeouts: HashMap::new(),
        }
    }
}

/// Provider failover settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailoverSection {
    /// Walk the whole fallback chain instead of only the best provider
    #[serde(default = "default_true")]
    pub fallback_to_all: bool,
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_health_check_interval() -> u64 {
    60
}

impl Default for FailoverSection {
    fn default() -> Self {
        Self {
            fallback_to_all: true,
            health_check_interval_secs: default_health_check_interval(),
        }
    }
}

impl FailoverSection {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }
}

/// Settings for the built-in prompt agents
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AgentsSection {
    #[serde(default)]
    pub system_prompt: String,
    /// Optional temperature (0.0 to 2.0)
    pub temperature: Option<f32>,
    /// Only ever call the best provider, never fall back
    #[serde(default)]
    pub single_provider_only: bool,
    /// Per-stage instruction overrides keyed by stage name
    #[serde(default)]
    pub instructions: HashMap<String, String>,
}

/// Backend kind
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Openai,
    Anthropic,
}

/// One `[[providers]]` entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderConfig {
    /// Provider name (must match [a-zA-Z0-9._-]+)
    pub name: String,
    pub kind: ProviderKind,
    pub model: String,
    /// Environment variable containing the API key
    pub api_key_env: String,
    pub base_url: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default = "default_provider_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub cost_per_token: f64,
    #[serde(default = "default_provider_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_priority() -> u32 {
    1
}

fn default_provider_max_tokens() -> u32 {
    8192
}

fn default_provider_timeout_ms() -> u64 {
    60_000
}

impl ProviderConfig {
    pub fn spec(&self) -> ProviderSpec {
        ProviderSpec {
            name: self.name.clone(),
            model: self.model.clone(),
            priority: self.priority,
            max_tokens: self.max_tokens,
            cost_per_token: self.cost_per_token,
            timeout_ms: self.timeout_ms,
        }
    }

    fn backend(&self, api_key: String) -> Result<Arc<dyn LlmProvider>, ConfigError> {
        let timeout = Duration::from_millis(self.timeout_ms);
        let backend: Arc<dyn LlmProvider> = match self.kind {
            ProviderKind::Openai => {
                let mut config = OpenAiConfig {
                    api_key,
                    timeout,
                    ..Default::default()
                };
                if let Some(url) = &self.base_url {
                    config.base_url = url.clone();
                }
                Arc::new(OpenAiProvider::new(config).map_err(|e| {
                    ConfigError::InvalidConfig(format!("provider '{}': {e}", self.name))
                })?)
            }
            ProviderKind::Anthropic => {
                let mut config = AnthropicConfig {
                    api_key,
                    timeout,
                    ..Default::default()
                };
                if let Some(url) = &self.base_url {
                    config.base_url = url.clone();
                }
                Arc::new(AnthropicProvider::new(config).map_err(|e| {
                    ConfigError::InvalidConfig(format!("provider '{}': {e}", self.name))
                })?)
            }
        };
        Ok(backend)
    }
}

/// Per-session settings, fixed once the session starts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub budget: BudgetLimits,
    pub max_retries: u32,
    pub stage_timeout_ms: u64,
    #[serde(default)]
    pub stage_timeouts: BTreeMap<Stage, u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            budget: BudgetLimits::default(),
            max_retries: DEFAULT_MAX_RETRIES,
            stage_timeout_ms: default_stage_timeout_ms(),
            stage_timeouts: BTreeMap::new(),
        }
    }
}

impl SessionConfig {
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_millis(self.stage_timeout_ms)
    }

    /// Timeout for one call of `stage`'s agent
    pub fn timeout_for(&self, stage: Stage) -> Duration {
        Duration::from_millis(
            self.stage_timeouts
                .get(&stage)
                .copied()
                .unwrap_or(self.stage_timeout_ms),
        )
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_budget(&self.budget)?;
        if self.stage_timeout_ms == 0 || self.stage_timeouts.values().any(|t| *t == 0) {
            return Err(ConfigError::InvalidConfig(
                "stage timeouts must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("No config file found (searched: {0})")]
    NotFound(String),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid provider name: {0}")]
    InvalidProviderName(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("No usable provider: {0}")]
    NoProviders(String),
}

impl From<FailoverError> for ConfigError {
    fn from(e: FailoverError) -> Self {
        ConfigError::InvalidConfig(e.to_string())
    }
}

impl PipelineConfig {
    /// Load and validate a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&content)?;
        info!(path = %path.display(), providers = config.providers.len(), "Loaded configuration");
        Ok(config)
    }

    /// Load from `path`, or from the first default path that exists
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::load_from_file(path);
        }
        let found = DEFAULT_CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|candidate| candidate.is_file());
        match found {
            Some(path) => Self::load_from_file(&path),
            None => Err(ConfigError::NotFound(DEFAULT_CONFIG_PATHS.join(", "))),
        }
    }

    /// Parse and validate TOML text
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.providers.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "at least one [[providers]] entry is required".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for provider in &self.providers {
            validate_provider_name(&provider.name)?;
            if !names.insert(provider.name.as_str()) {
                return Err(ConfigError::InvalidConfig(format!(
                    "duplicate provider name '{}'",
                    provider.name
                )));
            }
            if provider.timeout_ms == 0 {
                return Err(ConfigError::InvalidConfig(format!(
                    "provider '{}' timeout_ms must be greater than zero",
                    provider.name
                )));
            }
        }

        for stage in self.agents.instructions.keys() {
            parse_stage(stage)?;
        }
        if self.failover.health_check_interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "health_check_interval_secs must be greater than zero".to_string(),
            ));
        }

        self.session_config()?.validate()
    }

    /// Per-session settings derived from the file
    pub fn session_config(&self) -> Result<SessionConfig, ConfigError> {
        let stage_timeouts = self
            .pipeline
            .stage_timeouts
            .iter()
            .map(|(name, ms)| Ok((parse_stage(name)?, *ms)))
            .collect::<Result<BTreeMap<_, _>, ConfigError>>()?;

        Ok(SessionConfig {
            budget: self.budget.clone(),
            max_retries: self.pipeline.max_retries,
            stage_timeout_ms: self.pipeline.stage_timeout_ms,
            stage_timeouts,
        })
    }

    /// Build the provider registry, reading API keys from the environment
    pub fn build_registry(&self) -> Result<ProviderRegistry, ConfigError> {
        self.build_registry_with(|name| std::env::var(name).ok())
    }

    /// Build the provider registry with a custom credential lookup.
    ///
    /// Providers whose key cannot be found are skipped with a warning; it is
    /// an error only if none remain.
    pub fn build_registry_with(
        &self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<ProviderRegistry, ConfigError> {
        let mut registry = ProviderRegistry::new(self.failover.fallback_to_all);
        let mut skipped = Vec::new();

        for provider in &self.providers {
            let Some(api_key) = lookup(&provider.api_key_env).filter(|k| !k.is_empty()) else {
                warn!(
                    provider = %provider.name,
                    env = %provider.api_key_env,
                    "API key not set, skipping provider"
                );
                skipped.push(provider.api_key_env.clone());
                continue;
            };
            registry.register(provider.spec(), provider.backend(api_key)?)?;
        }

        if registry.is_empty() {
            return Err(ConfigError::NoProviders(format!(
                "set one of: {}",
                skipped.join(", ")
            )));
        }
        Ok(registry)
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[pipeline]
max_retries = 2
stage_timeout_ms = 5000

[budget]
max_cost = 1.0

[agents]
system_prompt = "You are one stage of a travel-planning pipeline."

[[providers]]
name = "primary"
kind = "openai"
model = "gpt-4o-mini"
api_key_env = "TRIPFLOW_TEST_OPENAI_KEY"
priority = 1

[[providers]]
name = "backup"
kind = "anthropic"
model = "claude-3-5-haiku-latest"
api_key_env = "TRIPFLOW_TEST_ANTHROPIC_KEY"
priority = 2
"#;
        match Self::from_toml(toml_content) {
            Ok(config) => config,
            Err(e) => panic!("test config should parse: {e}"),
        }
    }
}

fn validate_budget(budget: &BudgetLimits) -> Result<(), ConfigError> {
    if budget.max_cost.is_nan() || budget.max_cost <= 0.0 {
        return Err(ConfigError::InvalidConfig(
            "budget.max_cost must be greater than zero".to_string(),
        ));
    }
    if budget.max_execution_time_ms == 0 {
        return Err(ConfigError::InvalidConfig(
            "budget.max_execution_time_ms must be greater than zero".to_string(),
        ));
    }
    if budget.max_tokens_per_agent == 0 {
        return Err(ConfigError::InvalidConfig(
            "budget.max_tokens_per_agent must be at least 1".to_string(),
        ));
    }
    if budget.max_concurrent_workflows == 0 {
        return Err(ConfigError::InvalidConfig(
            "budget.max_concurrent_workflows must be at least 1".to_string(),
        ));
    }
    Ok(())
}

/// Provider names must match [a-zA-Z0-9._-]+
pub fn validate_provider_name(name: &str) -> Result<(), ConfigError> {
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if name.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidProviderName(format!(
            "'{name}' must match pattern [a-zA-Z0-9._-]+"
        )));
    }
    Ok(())
}

fn parse_stage(name: &str) -> Result<Stage, ConfigError> {
    Stage::ALL
        .into_iter()
        .find(|stage| stage.as_str() == name)
        .ok_or_else(|| ConfigError::InvalidConfig(format!("unknown stage '{name}'")))
}
