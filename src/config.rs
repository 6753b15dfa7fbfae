use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::agent_engine::loop_control::{LoopConfig, RetryPolicy, StageRetries};
use crate::agent_engine::state::Factors;
use crate::errors::{PilotError, PilotResult};
use crate::perception::preprocess::DEFAULT_MAX_PIXELS;

const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub model: ModelConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Full chat-completions URL.
    pub api_base: String,
    pub model: String,
    /// Optional API key stored in config.toml (env `SCREENPILOT_API_KEY` wins).
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub stream: bool,
    /// Pixel budget per image; depends on the model variant.
    #[serde(default = "default_max_pixels")]
    pub max_pixels: u64,
}

fn default_max_tokens() -> u32 {
    1000
}

fn default_max_pixels() -> u64 {
    DEFAULT_MAX_PIXELS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_max_loop_count")]
    pub max_loop_count: u32,
    #[serde(default)]
    pub loop_interval_ms: u64,
    #[serde(default = "default_max_image_length")]
    pub max_image_length: usize,
    #[serde(default = "default_factors")]
    pub factors: [f64; 2],
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_invalid_screenshot_backoff_ms")]
    pub invalid_screenshot_backoff_ms: u64,
    /// Replaces the prompt derived from the operator's action space.
    #[serde(default)]
    pub system_prompt: Option<String>,
}

fn default_max_loop_count() -> u32 {
    25
}

fn default_max_image_length() -> usize {
    5
}

fn default_factors() -> [f64; 2] {
    [1000.0, 1000.0]
}

fn default_language() -> String {
    "English".into()
}

fn default_invalid_screenshot_backoff_ms() -> u64 {
    500
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_loop_count: default_max_loop_count(),
            loop_interval_ms: 0,
            max_image_length: default_max_image_length(),
            factors: default_factors(),
            language: default_language(),
            invalid_screenshot_backoff_ms: default_invalid_screenshot_backoff_ms(),
            system_prompt: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StageRetryConfig {
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub backoff_ms: u64,
}

impl StageRetryConfig {
    fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries).with_backoff(Duration::from_millis(self.backoff_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_screenshot_retry")]
    pub screenshot: StageRetryConfig,
    #[serde(default = "default_model_retry")]
    pub model: StageRetryConfig,
    #[serde(default = "default_execute_retry")]
    pub execute: StageRetryConfig,
}

fn default_screenshot_retry() -> StageRetryConfig {
    StageRetryConfig { max_retries: 5, backoff_ms: 200 }
}

fn default_model_retry() -> StageRetryConfig {
    StageRetryConfig { max_retries: 5, backoff_ms: 1000 }
}

fn default_execute_retry() -> StageRetryConfig {
    StageRetryConfig { max_retries: 1, backoff_ms: 200 }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            screenshot: default_screenshot_retry(),
            model: default_model_retry(),
            execute: default_execute_retry(),
        }
    }
}

impl AppConfig {
    pub fn factors(&self) -> Factors {
        Factors(self.agent.factors[0], self.agent.factors[1])
    }

    /// Loop settings for [`GuiAgent`](crate::agent_engine::engine::GuiAgent).
    pub fn loop_config(&self) -> LoopConfig {
        LoopConfig {
            max_loop_count: self.agent.max_loop_count,
            loop_interval: Duration::from_millis(self.agent.loop_interval_ms),
            max_image_length: self.agent.max_image_length,
            factors: self.factors(),
            invalid_screenshot_backoff: Duration::from_millis(self.agent.invalid_screenshot_backoff_ms),
            retry: StageRetries {
                screenshot: self.retry.screenshot.policy(),
                model: self.retry.model.policy(),
                execute: self.retry.execute.policy(),
            },
        }
    }

    fn validate(self) -> PilotResult<Self> {
        if self.agent.factors.iter().any(|f| !f.is_finite() || *f <= 0.0) {
            return Err(PilotError::Config(format!(
                "factors must be positive, got {:?}",
                self.agent.factors
            )));
        }
        if self.model.api_base.trim().is_empty() {
            return Err(PilotError::Config("model.api_base is empty".into()));
        }
        Ok(self)
    }
}

pub fn parse_config(content: &str) -> PilotResult<AppConfig> {
    let config: AppConfig = toml::from_str(content)?;
    config.validate()
}

fn resolve_config_path() -> PilotResult<PathBuf> {
    if let Ok(exe) = std::env::current_exe() {
        if let Some(parent) = exe.parent() {
            let candidate = parent.join(CONFIG_FILE);
            if candidate.exists() {
                tracing::debug!(path = %candidate.display(), "config found next to executable");
                return Ok(candidate);
            }
        }
    }

    let cwd = std::env::current_dir()?;
    let candidate = cwd.join(CONFIG_FILE);
    if candidate.exists() {
        tracing::debug!(path = %candidate.display(), "config found in working directory");
        return Ok(candidate);
    }

    if let Some(dir) = dirs::config_dir() {
        let candidate = dir.join("screenpilot").join(CONFIG_FILE);
        if candidate.exists() {
            tracing::debug!(path = %candidate.display(), "config found in user config dir");
            return Ok(candidate);
        }
    }

    Err(PilotError::Config(
        "config.toml not found next to executable, in working directory or user config dir".into(),
    ))
}

pub fn load_config() -> PilotResult<AppConfig> {
    let path = resolve_config_path()?;
    load_config_from(&path)
}

pub fn load_config_from(path: &Path) -> PilotResult<AppConfig> {
    let content = std::fs::read_to_string(path)?;
    let config = parse_config(&content)?;
    tracing::info!(path = %path.display(), model = %config.model.model, "config loaded");
    Ok(config)
}

pub fn save_config_to(config: &AppConfig, path: &Path) -> PilotResult<()> {
    let content = toml::to_string_pretty(config)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)?;
    tracing::info!(path = %path.display(), "config saved");
    Ok(())
}
