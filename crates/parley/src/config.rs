//! Server configuration.
//!
//! Loaded from an optional TOML file plus `PARLEY_`-prefixed environment
//! overrides (e.g. `PARLEY_EXECUTOR__MAX_CONCURRENCY=2`). Every tunable has
//! a default so a bare `parley serve` works against a local SQLite file.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use config::{Config as ConfigLoader, Environment, File, FileFormat};
use serde::Deserialize;

/// Hard ceiling on concurrent executions regardless of configuration.
pub const MAX_CONCURRENCY_CAP: usize = 8;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the HTTP server binds to.
    pub listen_addr: String,
    /// Path to the SQLite database file.
    pub database_path: PathBuf,
    /// Static bearer tokens accepted by the API, mapped to user ids.
    pub auth: AuthConfig,
    pub executor: ExecutorConfig,
    pub provider: ProviderConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// token -> user id
    pub tokens: std::collections::HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Maximum concurrently running executions. Clamped to [1, 8].
    pub max_concurrency: usize,
    pub truncation: TruncationConfig,
}

/// Per-event payload size discipline.
///
/// Tool events carry third-party output and get a smaller ceiling than text
/// events. Oversized payloads are shrunk (strings cut, arrays capped, depth
/// capped) before being dropped to a `{type, truncated: true}` marker.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TruncationConfig {
    /// Character budget for text-shaped events.
    pub max_event_chars: usize,
    /// Character budget for `tool-*` events.
    pub tool_event_max_chars: usize,
    /// Cap applied to each string value while shrinking.
    pub max_string_chars: usize,
    /// Cap applied to each array while shrinking.
    pub max_array_length: usize,
    /// Nesting depth beyond which values are left as-is.
    pub max_depth: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Base URL of the OpenAI-compatible streaming endpoint.
    pub base_url: String,
    /// API key; models without a key fail admission validation.
    pub api_key: Option<String>,
    /// Model ids that accept image attachments.
    pub vision_models: Vec<String>,
    /// System prompt prepended to every request.
    pub system_prompt: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8460".to_string(),
            database_path: PathBuf::from("parley.db"),
            auth: AuthConfig::default(),
            executor: ExecutorConfig::default(),
            provider: ProviderConfig::default(),
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 5,
            truncation: TruncationConfig::default(),
        }
    }
}

impl Default for TruncationConfig {
    fn default() -> Self {
        Self {
            max_event_chars: 60_000,
            tool_event_max_chars: 20_000,
            max_string_chars: 4_000,
            max_array_length: 30,
            max_depth: 6,
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://openrouter.ai/api/v1".to_string(),
            api_key: None,
            vision_models: Vec::new(),
            system_prompt: "You are a helpful assistant.".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from an optional file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ConfigLoader::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                File::from(path.to_path_buf())
                    .format(FileFormat::Toml)
                    .required(true),
            );
        }
        let loaded = builder
            .add_source(Environment::with_prefix("PARLEY").separator("__"))
            .build()
            .context("building configuration")?;

        let mut config: Config = loaded
            .try_deserialize()
            .context("deserializing configuration")?;
        config.executor.max_concurrency = clamp_concurrency(config.executor.max_concurrency);
        Ok(config)
    }
}

/// Clamp a configured concurrency to [1, MAX_CONCURRENCY_CAP], defaulting
/// to 5 for zero (the "unset" value serde gives a bad override).
pub fn clamp_concurrency(raw: usize) -> usize {
    if raw == 0 {
        5
    } else {
        raw.min(MAX_CONCURRENCY_CAP)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.executor.max_concurrency, 5);
        assert_eq!(config.executor.truncation.max_event_chars, 60_000);
        assert_eq!(config.executor.truncation.tool_event_max_chars, 20_000);
    }

    #[test]
    fn concurrency_is_clamped() {
        assert_eq!(clamp_concurrency(0), 5);
        assert_eq!(clamp_concurrency(3), 3);
        assert_eq!(clamp_concurrency(50), MAX_CONCURRENCY_CAP);
    }

    #[test]
    fn loads_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parley.toml");
        std::fs::write(
            &path,
            r#"
listen_addr = "0.0.0.0:9000"

[executor]
max_concurrency = 2

[auth.tokens]
secret-token = "user-1"
"#,
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:9000");
        assert_eq!(config.executor.max_concurrency, 2);
        assert_eq!(config.auth.tokens.get("secret-token").unwrap(), "user-1");
    }
}
