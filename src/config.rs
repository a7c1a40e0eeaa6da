//! Configuration loader and validator for the repost agent.
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub source: Source,
    pub enhance: Enhance,
    pub rewrite: Rewrite,
    pub publish: Publish,
    pub limits: Limits,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub video_timeout_seconds: u64,
}

/// Read API of the source platform.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Source {
    pub base_url: String,
    /// Read-side bearer token. Empty disables ingestion.
    pub bearer_token: String,
}

/// Remote upscale service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Enhance {
    pub base_url: String,
    /// Empty disables upscaling; perturbation still runs.
    pub api_key: String,
    pub timeout_seconds: u64,
}

/// Chat-completion service used for persona rewrites.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Rewrite {
    pub endpoint: String,
    pub deployment: String,
    pub api_version: String,
    /// Empty disables rewriting; the original text is kept.
    pub api_key: String,
}

/// Write API of the publish platform.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Publish {
    pub base_url: String,
    /// Write-side access token. Empty disables publishing.
    pub access_token: String,
}

/// Posting rate limits and pacing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Limits {
    pub max_posts_per_day: u32,
    /// Posting window, local wall clock, `[start, end)`.
    pub allowed_hours_start: u32,
    pub allowed_hours_end: u32,
    pub min_delay_seconds: u64,
    pub max_delay_seconds: u64,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// Path of the single JSON state document.
    pub fn state_file(&self) -> PathBuf {
        Path::new(&self.app.data_dir).join("agent_state.json")
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
/// - Secrets can be injected or overridden via environment variables
///   (`SOURCE_BEARER_TOKEN`, `ENHANCE_API_KEY`, `REWRITE_API_KEY`,
///   `PUBLISH_ACCESS_TOKEN`), so the YAML file can stay secret-free.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let mut cfg: Config = serde_yaml::from_str(&content)?;
    overlay_env(&mut cfg);
    validate(&cfg)?;
    Ok(cfg)
}

fn overlay_env(cfg: &mut Config) {
    if let Ok(v) = std::env::var("SOURCE_BEARER_TOKEN") {
        cfg.source.bearer_token = v;
    }
    if let Ok(v) = std::env::var("ENHANCE_API_KEY") {
        cfg.enhance.api_key = v;
    }
    if let Ok(v) = std::env::var("REWRITE_API_KEY") {
        cfg.rewrite.api_key = v;
    }
    if let Ok(v) = std::env::var("PUBLISH_ACCESS_TOKEN") {
        cfg.publish.access_token = v;
    }
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.video_timeout_seconds == 0 {
        return Err(ConfigError::Invalid("app.video_timeout_seconds must be > 0"));
    }

    if Url::parse(&cfg.source.base_url).is_err() {
        return Err(ConfigError::Invalid("source.base_url must be a valid URL"));
    }
    if Url::parse(&cfg.enhance.base_url).is_err() {
        return Err(ConfigError::Invalid("enhance.base_url must be a valid URL"));
    }
    if cfg.enhance.timeout_seconds == 0 {
        return Err(ConfigError::Invalid("enhance.timeout_seconds must be > 0"));
    }
    if Url::parse(&cfg.rewrite.endpoint).is_err() {
        return Err(ConfigError::Invalid("rewrite.endpoint must be a valid URL"));
    }
    if cfg.rewrite.deployment.trim().is_empty() {
        return Err(ConfigError::Invalid("rewrite.deployment must be non-empty"));
    }
    if cfg.rewrite.api_version.trim().is_empty() {
        return Err(ConfigError::Invalid("rewrite.api_version must be non-empty"));
    }
    if Url::parse(&cfg.publish.base_url).is_err() {
        return Err(ConfigError::Invalid("publish.base_url must be a valid URL"));
    }

    let limits = &cfg.limits;
    if limits.max_posts_per_day == 0 {
        return Err(ConfigError::Invalid("limits.max_posts_per_day must be > 0"));
    }
    if limits.allowed_hours_start > 23 {
        return Err(ConfigError::Invalid("limits.allowed_hours_start must be 0..=23"));
    }
    if limits.allowed_hours_end > 24 {
        return Err(ConfigError::Invalid("limits.allowed_hours_end must be 0..=24"));
    }
    if limits.allowed_hours_start >= limits.allowed_hours_end {
        return Err(ConfigError::Invalid(
            "limits.allowed_hours_start must be before limits.allowed_hours_end",
        ));
    }
    if limits.min_delay_seconds > limits.max_delay_seconds {
        return Err(ConfigError::Invalid(
            "limits.min_delay_seconds must be <= limits.max_delay_seconds",
        ));
    }

    Ok(())
}

/// Example YAML with every supported key.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  video_timeout_seconds: 300

source:
  base_url: "https://api.x.com/"
  bearer_token: "YOUR_READ_BEARER_TOKEN"

enhance:
  base_url: "https://api.wavespeed.ai/api/v3/"
  api_key: "YOUR_UPSCALE_API_KEY"
  timeout_seconds: 120

rewrite:
  endpoint: "https://YOUR-RESOURCE.openai.azure.com/"
  deployment: "gpt-4o-mini"
  api_version: "2024-12-01-preview"
  api_key: "YOUR_REWRITE_API_KEY"

publish:
  base_url: "https://api.x.com/"
  access_token: "YOUR_WRITE_ACCESS_TOKEN"

limits:
  max_posts_per_day: 5
  allowed_hours_start: 8
  allowed_hours_end: 22
  min_delay_seconds: 3600
  max_delay_seconds: 10800
"#
}
