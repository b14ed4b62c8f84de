use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputConfig {
    /// Newline-delimited JSON track-log file.
    #[serde(default)]
    pub log_file: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputConfig {
    /// Directory receiving one row file per destination table.
    #[serde(default = "default_output_dir")]
    pub dir: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TranslateConfig {
    /// Quiet-period threshold between events from one IP before a
    /// downtime tag is recorded.
    #[serde(default = "default_heartbeat_threshold_seconds")]
    pub heartbeat_threshold_seconds: u64,
    #[serde(default = "default_flush_every_rows")]
    pub flush_every_rows: usize,
    /// Optional JSON object file mapping IP address -> 3-letter country code.
    #[serde(default)]
    pub ip_country_file: String,
    /// Optional JSON object file mapping 32-hex module hash -> display name.
    #[serde(default)]
    pub module_names_file: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default)]
    pub input: InputConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub translate: TranslateConfig,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            log_file: String::new(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
        }
    }
}

impl Default for TranslateConfig {
    fn default() -> Self {
        Self {
            heartbeat_threshold_seconds: default_heartbeat_threshold_seconds(),
            flush_every_rows: default_flush_every_rows(),
            ip_country_file: String::new(),
            module_names_file: String::new(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            input: InputConfig::default(),
            output: OutputConfig::default(),
            translate: TranslateConfig::default(),
        }
    }
}

fn default_output_dir() -> String {
    "moocdb".to_string()
}

fn default_heartbeat_threshold_seconds() -> u64 {
    360
}

fn default_flush_every_rows() -> usize {
    4000
}

pub fn expand_path(path: &str) -> String {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return format!("{}/{}", home.to_string_lossy(), stripped);
        }
    }
    path.to_string()
}

fn home_config_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".talus").join("config.toml"))
}

fn repo_default_config_path() -> PathBuf {
    PathBuf::from("config/talus.toml")
}

fn resolve_config_path_with_overrides(
    raw_path: Option<PathBuf>,
    env_keys: &[&str],
    home_path: Option<PathBuf>,
    repo_default: PathBuf,
) -> PathBuf {
    if let Some(path) = raw_path {
        return path;
    }

    for key in env_keys {
        if let Ok(value) = std::env::var(key) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return PathBuf::from(trimmed);
            }
        }
    }

    if let Some(path) = home_path {
        if path.exists() {
            return path;
        }
    }

    if repo_default.exists() {
        return repo_default;
    }

    home_config_path().unwrap_or(repo_default)
}

pub fn resolve_config_path(raw_path: Option<PathBuf>) -> PathBuf {
    resolve_config_path_with_overrides(
        raw_path,
        &["TALUS_CONFIG"],
        home_config_path(),
        repo_default_config_path(),
    )
}

fn normalize_config(mut cfg: AppConfig) -> AppConfig {
    cfg.input.log_file = expand_path(&cfg.input.log_file);
    cfg.output.dir = expand_path(&cfg.output.dir);
    cfg.translate.ip_country_file = expand_path(&cfg.translate.ip_country_file);
    cfg.translate.module_names_file = expand_path(&cfg.translate.module_names_file);
    cfg
}

pub fn load_config(path: impl AsRef<Path>) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("failed to read config {}", path.as_ref().display()))?;
    let cfg: AppConfig = toml::from_str(&content).context("failed to parse TOML config")?;
    Ok(normalize_config(cfg))
}
