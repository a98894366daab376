//! Configuration loader and validator for the collection pipeline.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::collector::CollectOptions;
use crate::fetch::FetchConfig;
use crate::model::Source;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    #[serde(default)]
    pub jira: Option<SourceConfig>,
    #[serde(default)]
    pub gitlab: Option<SourceConfig>,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub page_size: u32,
    pub fan_out_concurrency: usize,
}

/// Connection settings for one remote API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceConfig {
    pub host: String,
    /// Pre-formatted `Authorization` header value, e.g. `Basic ...` or `Bearer ...`.
    pub auth: String,
    #[serde(default)]
    pub proxy: Option<String>,
    pub timeout_ms: u64,
    pub max_retry: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_retry_delay_ms() -> u64 {
    200
}

impl SourceConfig {
    pub fn fetch_config(&self) -> FetchConfig {
        FetchConfig {
            host: self.host.clone(),
            auth: self.auth.clone(),
            proxy: self.proxy.clone().filter(|p| !p.trim().is_empty()),
            timeout: Duration::from_millis(self.timeout_ms),
            max_retry: self.max_retry,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
        }
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    pub fn source(&self, source: Source) -> Option<&SourceConfig> {
        match source {
            Source::Jira => self.jira.as_ref(),
            Source::Gitlab => self.gitlab.as_ref(),
        }
    }

    pub fn collect_options(&self) -> CollectOptions {
        CollectOptions {
            page_size: self.app.page_size,
            fan_out_concurrency: self.app.fan_out_concurrency,
        }
    }

    /// `DATABASE_URL` wins over the default file under `app.data_dir`.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL").unwrap_or_else(|_| {
            format!(
                "sqlite://{}/lakesync.db",
                self.app.data_dir.trim_end_matches('/')
            )
        })
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty".into()));
    }
    if cfg.app.page_size == 0 {
        return Err(ConfigError::Invalid("app.page_size must be > 0".into()));
    }
    if cfg.app.fan_out_concurrency == 0 {
        return Err(ConfigError::Invalid("app.fan_out_concurrency must be > 0".into()));
    }
    if cfg.jira.is_none() && cfg.gitlab.is_none() {
        return Err(ConfigError::Invalid(
            "at least one of jira or gitlab must be configured".into(),
        ));
    }

    if let Some(jira) = &cfg.jira {
        validate_source(jira, "jira")?;
    }
    if let Some(gitlab) = &cfg.gitlab {
        validate_source(gitlab, "gitlab")?;
    }

    Ok(())
}

fn validate_source(src: &SourceConfig, section: &str) -> Result<(), ConfigError> {
    let problem = if src.host.trim().is_empty() {
        "host must be non-empty"
    } else if src.auth.trim().is_empty() {
        "auth must be non-empty"
    } else if src.timeout_ms == 0 {
        "timeout_ms must be > 0"
    } else if src.max_retry == 0 {
        "max_retry must be >= 1"
    } else {
        return Ok(());
    };
    Err(ConfigError::Invalid(format!("{section}.{problem}")))
}

/// Returns the documented example configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  page_size: 100
  fan_out_concurrency: 8

jira:
  host: "https://your-domain.atlassian.net/rest/"
  auth: "Basic BASE64_EMAIL_AND_API_TOKEN"
  proxy: null
  timeout_ms: 10000
  max_retry: 3
  retry_delay_ms: 200

gitlab:
  host: "https://gitlab.com/api/v4/"
  auth: "Bearer YOUR_GITLAB_TOKEN"
  timeout_ms: 10000
  max_retry: 3
"#
}
