//! Configuration system (layered: code > env > config file).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use bon::Builder;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TurnstileError};
use crate::parser::WireFormat;
use crate::strategy::{StrategyConfig, StrategyFactory};

/// Name of the config file looked up by [`TurnstileConfig::load`].
pub const CONFIG_FILE_NAME: &str = "turnstile.toml";

/// Settings for a chat session.
///
/// Resolution order, highest first:
/// 1. Values set in code after loading (field assignment on the result of
///    [`load`](Self::load) or [`from_env`](Self::from_env))
/// 2. `TURNSTILE_*` environment variables (and `.env`)
/// 3. `turnstile.toml` in the platform config directory
///
/// [`merge_env`](Self::merge_env) overwrites whatever it is given, so a
/// builder-made config passed through it loses fields the environment sets.
#[derive(Debug, Clone, Builder, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TurnstileConfig {
    /// Endpoint for [`crate::connection::HttpConnection`].
    pub api_url: Option<String>,
    /// Extra request headers.
    #[builder(default)]
    pub headers: HashMap<String, String>,
    #[builder(default)]
    pub wire_format: WireFormat,
    #[builder(default)]
    pub chunk_strategy: StrategyConfig,
    /// Upper bound on connect cycles per user turn.
    #[builder(default = 5)]
    pub max_iterations: usize,
    /// Idle limit between chunks; `0` disables it.
    #[builder(default = 120_000)]
    pub stream_idle_timeout_ms: u64,
}

impl Default for TurnstileConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl TurnstileConfig {
    /// Defaults overlaid with environment variables.
    ///
    /// Reads `TURNSTILE_API_URL`, `TURNSTILE_WIRE_FORMAT`,
    /// `TURNSTILE_CHUNK_STRATEGY`, `TURNSTILE_MAX_ITERATIONS` and
    /// `TURNSTILE_IDLE_TIMEOUT_MS`, after loading `.env` if present.
    pub fn from_env() -> Result<Self> {
        Self::default().merge_env()
    }

    /// Parse a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| TurnstileError::Configuration(e.to_string()))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// `turnstile.toml` in the platform config directory.
    pub fn default_path() -> PathBuf {
        directories::ProjectDirs::from("", "", "turnstile")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
            .unwrap_or_else(|| PathBuf::from(".turnstile").join(CONFIG_FILE_NAME))
    }

    /// Config file (if present) overlaid with environment variables.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let base = if path.exists() {
            tracing::debug!(path = %path.display(), "loading config file");
            Self::from_file(path)?
        } else {
            Self::default()
        };
        base.merge_env()
    }

    /// Overlay environment variables onto `self`. Every variable that is set
    /// replaces the matching field.
    pub fn merge_env(mut self) -> Result<Self> {
        let _ = dotenvy::dotenv();

        if let Some(url) = env_var("TURNSTILE_API_URL") {
            self.api_url = Some(url);
        }
        if let Some(format) = env_parse::<WireFormat>("TURNSTILE_WIRE_FORMAT")? {
            self.wire_format = format;
        }
        if let Some(strategy) = env_parse::<StrategyConfig>("TURNSTILE_CHUNK_STRATEGY")? {
            self.chunk_strategy = strategy;
        }
        if let Some(max) = env_parse::<usize>("TURNSTILE_MAX_ITERATIONS")? {
            self.max_iterations = max;
        }
        if let Some(ms) = env_parse::<u64>("TURNSTILE_IDLE_TIMEOUT_MS")? {
            self.stream_idle_timeout_ms = ms;
        }
        Ok(self)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.stream_idle_timeout_ms > 0).then(|| Duration::from_millis(self.stream_idle_timeout_ms))
    }

    pub fn strategy_factory(&self) -> StrategyFactory {
        self.chunk_strategy.factory()
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    env_var(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| TurnstileError::Configuration(format!("{key}={raw}: {e}")))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_builder_defaults() {
        let config = TurnstileConfig::default();
        assert_eq!(config.max_iterations, 5);
        assert_eq!(config.stream_idle_timeout_ms, 120_000);
        assert_eq!(config.wire_format, WireFormat::Sse);
        assert_eq!(config.chunk_strategy, StrategyConfig::Immediate);
        assert_eq!(config.idle_timeout(), Some(Duration::from_secs(120)));
    }

    #[test]
    fn toml_fills_missing_keys_with_defaults() {
        let config = TurnstileConfig::from_toml_str(
            r#"
            api_url = "http://localhost:3000/api/chat"
            wire_format = "ndjson"
            stream_idle_timeout_ms = 0

            [chunk_strategy]
            type = "batch"
            size = 3

            [headers]
            authorization = "Bearer t"
            "#,
        )
        .unwrap();
        assert_eq!(config.wire_format, WireFormat::Ndjson);
        assert_eq!(config.chunk_strategy, StrategyConfig::Batch { size: 3 });
        assert_eq!(config.max_iterations, 5);
        assert_eq!(config.idle_timeout(), None);
        assert_eq!(config.headers["authorization"], "Bearer t");
    }

    #[test]
    fn malformed_toml_is_a_configuration_error() {
        assert!(matches!(
            TurnstileConfig::from_toml_str("max_iterations = \"many\""),
            Err(TurnstileError::Configuration(_))
        ));
    }

    #[test]
    fn default_path_ends_with_file_name() {
        assert!(TurnstileConfig::default_path().ends_with(CONFIG_FILE_NAME));
    }
}
