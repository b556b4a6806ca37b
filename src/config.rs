//! Run configuration.
//!
//! Settings come from three layers, later ones winning:
//! 1. Built-in defaults
//! 2. An optional YAML file (`--config`)
//! 3. Environment variables:
//!    - `OPENROUTER_API_KEY` - backend API key (required for real runs)
//!    - `OPENROUTER_BASE_URL` - backend API root
//!    - `SEARXNG_URL` - search endpoint
//!    - `FANOUT_STATE_PATH` - checkpoint file
//!    - `FANOUT_VERDICT_DIR` - result directory
//!    - `FANOUT_BLOCKLIST` - domain blocklist YAML
//!    - `FANOUT_PROMPT_PATH` - system prompt file
//!    - `FANOUT_CONCURRENCY` - pairs in flight at once

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::budget::{default_backends, BackendDescriptor};
use crate::llm::{RetryConfig, OPENROUTER_BASE_URL};
use crate::orchestrator::OrchestratorConfig;
use crate::tools::{web::DEFAULT_SEARXNG_URL, ToolLimits};
use crate::worker::{WorkerConfig, DEFAULT_SYSTEM_PROMPT};

/// Longest duration any setting may ask for: one week.
const MAX_DURATION_SECS: f64 = 7.0 * 24.0 * 3600.0;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid value for {name}: {reason}")]
    InvalidValue { name: &'static str, reason: String },
}

/// Backoff for transient backend errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub base_delay_secs: f64,
    pub multiplier: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_secs: 5.0,
            multiplier: 2,
        }
    }
}

impl RetrySettings {
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            base_delay: Duration::from_secs_f64(self.base_delay_secs),
            multiplier: self.multiplier,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(skip_serializing)]
    pub openrouter_api_key: Option<String>,
    pub openrouter_base_url: String,
    pub searxng_url: String,

    pub state_path: PathBuf,
    pub verdict_dir: PathBuf,
    pub blocklist_path: PathBuf,
    /// System prompt file. The built-in prompt is used when unset.
    pub prompt_path: Option<PathBuf>,

    pub concurrency: usize,
    pub max_turns: u32,
    pub pair_timeout_secs: f64,
    pub fetch_min_interval_secs: f64,
    pub fetch_timeout_secs: f64,
    pub search_timeout_secs: f64,
    /// Wait before asking for a generation's billed usage.
    pub usage_lookup_delay_secs: f64,
    pub max_fetch_chars: usize,
    pub max_search_results: usize,
    pub context_warning_ratio: f64,
    pub retry: RetrySettings,

    pub backends: Vec<BackendDescriptor>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            openrouter_api_key: None,
            openrouter_base_url: OPENROUTER_BASE_URL.to_string(),
            searxng_url: DEFAULT_SEARXNG_URL.to_string(),
            state_path: PathBuf::from("data/verdict_fanout_state.jsonl"),
            verdict_dir: PathBuf::from("data/verdicts"),
            blocklist_path: PathBuf::from("config/blocked_domains.yaml"),
            prompt_path: None,
            concurrency: 1,
            max_turns: 15,
            pair_timeout_secs: 180.0,
            fetch_min_interval_secs: 0.5,
            fetch_timeout_secs: 15.0,
            search_timeout_secs: 10.0,
            usage_lookup_delay_secs: 0.5,
            max_fetch_chars: 15_000,
            max_search_results: 10,
            context_warning_ratio: 0.8,
            retry: RetrySettings::default(),
            backends: default_backends(),
        }
    }
}

impl Config {
    /// Defaults, then `path` if given, then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_yaml(&contents).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        tracing::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, serde_yaml::Error> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(contents)
    }

    /// Override fields from environment variables, read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(key) = get("OPENROUTER_API_KEY") {
            self.openrouter_api_key = Some(key);
        }
        if let Some(url) = get("OPENROUTER_BASE_URL") {
            self.openrouter_base_url = url;
        }
        if let Some(url) = get("SEARXNG_URL") {
            self.searxng_url = url;
        }
        if let Some(path) = get("FANOUT_STATE_PATH") {
            self.state_path = PathBuf::from(path);
        }
        if let Some(path) = get("FANOUT_VERDICT_DIR") {
            self.verdict_dir = PathBuf::from(path);
        }
        if let Some(path) = get("FANOUT_BLOCKLIST") {
            self.blocklist_path = PathBuf::from(path);
        }
        if let Some(path) = get("FANOUT_PROMPT_PATH") {
            self.prompt_path = Some(PathBuf::from(path));
        }
        if let Some(raw) = get("FANOUT_CONCURRENCY") {
            self.concurrency = raw.trim().parse().map_err(|e| ConfigError::InvalidValue {
                name: "FANOUT_CONCURRENCY",
                reason: format!("{:?}: {}", raw, e),
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |name: &'static str, reason: &str| {
            Err(ConfigError::InvalidValue {
                name,
                reason: reason.to_string(),
            })
        };

        if self.concurrency == 0 {
            return invalid("concurrency", "must be at least 1");
        }
        if self.max_turns == 0 {
            return invalid("max_turns", "must be at least 1");
        }
        for (name, secs) in [
            ("pair_timeout_secs", self.pair_timeout_secs),
            ("fetch_timeout_secs", self.fetch_timeout_secs),
            ("search_timeout_secs", self.search_timeout_secs),
        ] {
            if !(secs.is_finite() && secs > 0.0) {
                return invalid(name, "must be a positive number of seconds");
            }
            if secs > MAX_DURATION_SECS {
                return invalid(name, "must not exceed one week");
            }
        }
        for (name, secs) in [
            ("fetch_min_interval_secs", self.fetch_min_interval_secs),
            ("usage_lookup_delay_secs", self.usage_lookup_delay_secs),
            ("retry.base_delay_secs", self.retry.base_delay_secs),
        ] {
            if !(secs.is_finite() && secs >= 0.0) {
                return invalid(name, "must not be negative");
            }
            if secs > MAX_DURATION_SECS {
                return invalid(name, "must not exceed one week");
            }
        }
        if !(self.context_warning_ratio > 0.0 && self.context_warning_ratio <= 1.0) {
            return invalid("context_warning_ratio", "must be in (0, 1]");
        }
        if self.backends.is_empty() {
            return invalid("backends", "at least one backend is required");
        }
        Ok(())
    }

    pub fn pair_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.pair_timeout_secs)
    }

    pub fn fetch_min_interval(&self) -> Duration {
        Duration::from_secs_f64(self.fetch_min_interval_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.fetch_timeout_secs)
    }

    pub fn search_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.search_timeout_secs)
    }

    pub fn usage_lookup_delay(&self) -> Duration {
        Duration::from_secs_f64(self.usage_lookup_delay_secs)
    }

    pub fn tool_limits(&self) -> ToolLimits {
        ToolLimits {
            max_fetch_chars: self.max_fetch_chars,
            max_search_results: self.max_search_results,
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            pair_timeout: self.pair_timeout(),
            concurrency: self.concurrency,
        }
    }

    /// Worker settings, reading the prompt file if one is configured.
    pub fn worker_config(&self) -> Result<WorkerConfig, ConfigError> {
        Ok(WorkerConfig {
            max_turns: self.max_turns,
            retry: self.retry.to_retry_config(),
            context_warning_ratio: self.context_warning_ratio,
            system_prompt: self.system_prompt()?,
        })
    }

    pub fn system_prompt(&self) -> Result<String, ConfigError> {
        match &self.prompt_path {
            Some(path) => {
                let prompt = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.display().to_string(),
                    source,
                })?;
                if prompt.trim().is_empty() {
                    return Err(ConfigError::InvalidValue {
                        name: "prompt_path",
                        reason: format!("{} is empty", path.display()),
                    });
                }
                Ok(prompt)
            }
            None => Ok(DEFAULT_SYSTEM_PROMPT.to_string()),
        }
    }

    /// Descriptors for the requested ids, or every configured backend.
    pub fn resolve_backends(&self, ids: &[String]) -> Vec<BackendDescriptor> {
        if ids.is_empty() {
            return self.backends.clone();
        }
        ids.iter()
            .map(|id| BackendDescriptor::lookup(id, &self.backends))
            .collect()
    }
}
