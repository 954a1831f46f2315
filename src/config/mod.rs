// QuectoFlow — Declarative workflow executor in Rust
// License: Apache-2.0

use crate::workflow::FailurePolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadFile(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("home directory not found")]
    NoHomeDir,
    #[error("no API key configured for the LLM provider")]
    MissingApiKey,
    #[error("invalid setting `{field}`: {reason}")]
    InvalidSetting { field: &'static str, reason: String },
}

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Upper bound on `while_loop` iterations before the step fails.
    #[serde(default = "default_max_while_iterations")]
    pub max_while_iterations: usize,
    #[serde(default = "default_api_timeout_secs")]
    pub api_timeout_secs: u64,
    #[serde(default = "default_llm_timeout_secs")]
    pub llm_timeout_secs: u64,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    /// JSON Schema used to validate workflow documents. The bundled schema
    /// is used when unset.
    #[serde(default)]
    pub schema_path: Option<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_while_iterations: default_max_while_iterations(),
            api_timeout_secs: default_api_timeout_secs(),
            llm_timeout_secs: default_llm_timeout_secs(),
            failure_policy: FailurePolicy::default(),
            schema_path: None,
        }
    }
}

impl ExecutorConfig {
    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm_timeout_secs)
    }
}

fn default_max_while_iterations() -> usize {
    1000
}
fn default_api_timeout_secs() -> u64 {
    30
}
fn default_llm_timeout_secs() -> u64 {
    120
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_base: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub proxy: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_base: String::new(),
            model: default_model(),
            proxy: String::new(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_max_retries() -> usize {
    3
}
fn default_retry_delay_ms() -> u64 {
    1000
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a JSON file, falling back to defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            serde_json::from_str(&contents)?
        } else {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            Config::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides (prefix: QUECTOFLOW_)
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("QUECTOFLOW_PROVIDER_API_KEY") {
            self.provider.api_key = v;
        }
        if let Ok(v) = std::env::var("QUECTOFLOW_PROVIDER_API_BASE") {
            self.provider.api_base = v;
        }
        if let Ok(v) = std::env::var("QUECTOFLOW_PROVIDER_MODEL") {
            self.provider.model = v;
        }
        if let Ok(v) = std::env::var("QUECTOFLOW_EXECUTOR_MAX_WHILE_ITERATIONS") {
            if let Ok(n) = v.parse() {
                self.executor.max_while_iterations = n;
            }
        }
        if let Ok(v) = std::env::var("QUECTOFLOW_EXECUTOR_API_TIMEOUT_SECS") {
            if let Ok(n) = v.parse() {
                self.executor.api_timeout_secs = n;
            }
        }
        if let Ok(v) = std::env::var("QUECTOFLOW_EXECUTOR_LLM_TIMEOUT_SECS") {
            if let Ok(n) = v.parse() {
                self.executor.llm_timeout_secs = n;
            }
        }
        if let Ok(v) = std::env::var("QUECTOFLOW_EXECUTOR_FAILURE_POLICY") {
            match v.parse() {
                Ok(policy) => self.executor.failure_policy = policy,
                Err(e) => tracing::warn!("Ignoring QUECTOFLOW_EXECUTOR_FAILURE_POLICY: {}", e),
            }
        }
        if let Ok(v) = std::env::var("QUECTOFLOW_EXECUTOR_SCHEMA_PATH") {
            self.executor.schema_path = Some(v);
        }
    }

    /// Get the default config file path: ~/.quectoflow/config.json
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let home = dirs::home_dir().ok_or(ConfigError::NoHomeDir)?;
        Ok(home.join(".quectoflow").join("config.json"))
    }

    /// Validate configuration for basic correctness.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.executor.max_while_iterations == 0 {
            return Err(ConfigError::InvalidSetting {
                field: "executor.max_while_iterations",
                reason: "must be greater than zero".into(),
            });
        }
        if self.executor.api_timeout_secs == 0 {
            return Err(ConfigError::InvalidSetting {
                field: "executor.api_timeout_secs",
                reason: "must be greater than zero".into(),
            });
        }
        if self.executor.llm_timeout_secs == 0 {
            return Err(ConfigError::InvalidSetting {
                field: "executor.llm_timeout_secs",
                reason: "must be greater than zero".into(),
            });
        }
        if self.provider.api_key.is_empty() {
            tracing::warn!("No LLM API key configured; llm_call steps will fail");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.executor.max_while_iterations, 1000);
        assert_eq!(cfg.executor.failure_policy, FailurePolicy::BestEffort);
        assert_eq!(cfg.provider.model, "gpt-4o-mini");
        assert!(cfg.executor.schema_path.is_none());
    }

    #[test]
    fn test_parse_minimal_json() {
        let json = r#"{"executor": {"max_while_iterations": 5}}"#;
        let cfg: Config = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.executor.max_while_iterations, 5);
        assert_eq!(cfg.executor.api_timeout_secs, 30);
        assert_eq!(cfg.provider.max_retries, 3);
    }

    #[test]
    fn test_parse_full_config() {
        let json = r#"{
            "executor": {"failure_policy": "fail_fast", "llm_timeout_secs": 10, "schema_path": "/tmp/s.json"},
            "provider": {"api_key": "sk-test", "model": "gpt-4o"}
        }"#;
        let cfg: Config = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.executor.failure_policy, FailurePolicy::FailFast);
        assert_eq!(cfg.executor.llm_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.executor.schema_path.as_deref(), Some("/tmp/s.json"));
        assert_eq!(cfg.provider.api_key, "sk-test");
    }

    #[test]
    fn test_validate_rejects_zero_cap() {
        let mut cfg = Config::default();
        cfg.executor.max_while_iterations = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("max_while_iterations"));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::load(&dir.path().join("nope.json")).unwrap();
        assert_eq!(cfg.executor.api_timeout_secs, 30);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"executor": {"api_timeout_secs": 7}}"#).unwrap();
        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.executor.api_timeout_secs, 7);
    }
}
