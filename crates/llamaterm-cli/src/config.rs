use anyhow::{Context, Result};
use llamaterm_ollama::DEFAULT_REQUEST_TIMEOUT;
use llamaterm_topics::ResolverConfig;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct LlamatermConfig {
    pub url: Option<String>,
    pub database_path: Option<PathBuf>,
    pub request_timeout_secs: u64,
    pub topic_threshold: f64,
    pub category_threshold: f64,
    pub log_file: Option<PathBuf>,
}

impl Default for LlamatermConfig {
    fn default() -> Self {
        let resolver = ResolverConfig::default();
        Self {
            url: None,
            database_path: None,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT.as_secs(),
            topic_threshold: resolver.topic_threshold,
            category_threshold: resolver.category_threshold,
            log_file: None,
        }
    }
}

impl LlamatermConfig {
    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| config_dir().join("llamaterm/llamaterm.db"))
    }

    pub fn log_path(&self) -> PathBuf {
        self.log_file
            .clone()
            .unwrap_or_else(|| state_dir().join("llamaterm/llamaterm.log"))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn resolver_config(&self) -> ResolverConfig {
        ResolverConfig {
            topic_threshold: self.topic_threshold,
            category_threshold: self.category_threshold,
        }
    }
}

pub fn load_config(path: &Path) -> Result<LlamatermConfig> {
    if !path.exists() {
        return Ok(LlamatermConfig::default());
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("failed to parse config {}", path.display()))
}

pub fn save_config(path: &Path, config: &LlamatermConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    fs::write(path, contents).with_context(|| format!("failed to write config {}", path.display()))
}

pub fn config_path() -> PathBuf {
    if let Ok(path) = env::var("LLAMATERM_CONFIG_PATH") {
        return PathBuf::from(path);
    }
    config_dir().join("llamaterm/config.toml")
}

fn config_dir() -> PathBuf {
    if let Ok(path) = env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(path);
    }
    home_dir().join(".config")
}

fn state_dir() -> PathBuf {
    if let Ok(path) = env::var("XDG_STATE_HOME") {
        return PathBuf::from(path);
    }
    home_dir().join(".local/state")
}

pub fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}
