//! Configuration loading and validation tests
//!
//! Tests focus on BEHAVIOR of configuration loading, validation, and error handling.
//! We test observable outcomes, not implementation details of TOML parsing.

use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;
use tripflow::config::{ConfigError, PipelineConfig, ProviderKind};
use tripflow::pipeline::Stage;

const MINIMAL_PROVIDER: &str = r#"
[[providers]]
name = "primary"
kind = "openai"
model = "gpt-4o-mini"
api_key_env = "OPENAI_API_KEY"
"#;

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    write!(temp_file, "{content}").unwrap();
    temp_file
}

#[test]
fn test_config_loads_successfully_from_valid_toml() {
    let temp_file = write_config(
        r#"
[pipeline]
max_retries = 5
stage_timeout_ms = 30000

[pipeline.stage_timeouts]
compile = 90000

[budget]
max_execution_time_ms = 300000
max_cost = 0.75
max_tokens_per_agent = 2048
max_concurrent_workflows = 3

[failover]
fallback_to_all = false
health_check_interval_secs = 15

[agents]
system_prompt = "You plan trips."
temperature = 0.2

[agents.instructions]
plan = "Outline only."

[[providers]]
name = "primary"
kind = "openai"
model = "gpt-4o-mini"
api_key_env = "OPENAI_API_KEY"
priority = 1
cost_per_token = 0.000002

[[providers]]
name = "backup"
kind = "anthropic"
model = "claude-3-5-haiku-latest"
api_key_env = "ANTHROPIC_API_KEY"
base_url = "http://localhost:9999/v1"
priority = 2
timeout_ms = 20000
"#,
    );

    let config = PipelineConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.pipeline.max_retries, 5);
    assert_eq!(config.budget.max_cost, 0.75);
    assert_eq!(config.budget.max_concurrent_workflows, 3);
    assert!(!config.failover.fallback_to_all);
    assert_eq!(config.failover.health_check_interval(), Duration::from_secs(15));
    assert_eq!(config.agents.temperature, Some(0.2));
    assert_eq!(config.providers.len(), 2);
    assert_eq!(config.providers[1].kind, ProviderKind::Anthropic);
    assert_eq!(config.providers[1].base_url.as_deref(), Some("http://localhost:9999/v1"));

    let session = config.session_config().unwrap();
    assert_eq!(session.max_retries, 5);
    assert_eq!(session.timeout_for(Stage::Compile), Duration::from_millis(90_000));
    assert_eq!(session.timeout_for(Stage::Plan), Duration::from_millis(30_000));
    assert_eq!(session.budget.max_tokens_per_agent, 2048);
}

#[test]
fn test_config_defaults_apply_to_omitted_sections() {
    let temp_file = write_config(MINIMAL_PROVIDER);

    let config = PipelineConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.pipeline.max_retries, 3);
    assert_eq!(config.pipeline.stage_timeout_ms, 120_000);
    assert_eq!(config.budget.max_execution_time_ms, 600_000);
    assert!(config.failover.fallback_to_all);
    assert_eq!(config.providers[0].priority, 1);
    assert_eq!(config.providers[0].max_tokens, 8192);
    assert_eq!(config.providers[0].timeout_ms, 60_000);
    assert_eq!(config.providers[0].cost_per_token, 0.0);
}

#[test]
fn test_missing_file_is_a_read_error() {
    let result = PipelineConfig::load_from_file(std::path::Path::new("/nonexistent/tripflow.toml"));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_malformed_toml_is_a_parse_error() {
    let temp_file = write_config("[pipeline\nmax_retries = ");
    let result = PipelineConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_config_without_providers_is_rejected() {
    let temp_file = write_config("[pipeline]\nmax_retries = 2\n");
    let result = PipelineConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
}

#[test]
fn test_unknown_provider_kind_is_rejected() {
    let temp_file = write_config(
        r#"
[[providers]]
name = "x"
kind = "mystery"
model = "m"
api_key_env = "K"
"#,
    );
    assert!(matches!(
        PipelineConfig::load_from_file(temp_file.path()),
        Err(ConfigError::TomlParse(_))
    ));
}

#[test]
fn test_invalid_provider_name_is_rejected() {
    let content = MINIMAL_PROVIDER.replace("\"primary\"", "\"has space\"");
    let temp_file = write_config(&content);
    assert!(matches!(
        PipelineConfig::load_from_file(temp_file.path()),
        Err(ConfigError::InvalidProviderName(_))
    ));
}

#[test]
fn test_zero_budget_is_rejected() {
    let content = format!("[budget]\nmax_cost = 0.0\n{MINIMAL_PROVIDER}");
    let temp_file = write_config(&content);
    assert!(matches!(
        PipelineConfig::load_from_file(temp_file.path()),
        Err(ConfigError::InvalidConfig(_))
    ));
}

#[test]
fn test_unknown_stage_override_is_rejected() {
    let content = format!("[pipeline.stage_timeouts]\nbook = 1000\n{MINIMAL_PROVIDER}");
    let temp_file = write_config(&content);
    assert!(PipelineConfig::load_from_file(temp_file.path()).is_err());
}

#[test]
fn test_registry_built_from_env_lookup() {
    let config = PipelineConfig::from_toml(MINIMAL_PROVIDER).unwrap();

    let registry = config
        .build_registry_with(|name| (name == "OPENAI_API_KEY").then(|| "sk-test".to_string()))
        .unwrap();

    assert_eq!(registry.len(), 1);
    assert_eq!(registry.snapshots()[0].name(), "primary");
}

#[test]
fn test_registry_without_credentials_fails() {
    let config = PipelineConfig::from_toml(MINIMAL_PROVIDER).unwrap();

    let result = config.build_registry_with(|_| None);

    match result {
        Err(ConfigError::NoProviders(message)) => assert!(message.contains("OPENAI_API_KEY")),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("registry should not build without keys"),
    }
}

#[test]
fn test_config_round_trips_through_toml() {
    let config = PipelineConfig::from_toml(MINIMAL_PROVIDER).unwrap();
    let rendered = toml::to_string_pretty(&config).unwrap();
    assert_eq!(PipelineConfig::from_toml(&rendered).unwrap(), config);
}
