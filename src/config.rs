use anyhow::{Context, Result, anyhow, bail};
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_DIR: &str = ".checkboard";
const CONFIG_FILE: &str = "config.json";
const CATALOG_FILE: &str = "catalog.json";
const DEFAULT_REFRESH_SECONDS: u64 = 60;
const DEFAULT_TREND_WEEKS: u32 = 4;
const DEFAULT_TREND_TIMEOUT_SECONDS: u64 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub db_path: PathBuf,
    pub catalog_path: PathBuf,
    pub api_port: u16,
    pub refresh_seconds: u64,
    pub trend_weeks: u32,
    pub trend_timeout_seconds: u64,
    pub missed_task_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        let root = default_root_dir();

        Self {
            db_path: root.join("db").join("submissions.db"),
            catalog_path: root.join(CATALOG_FILE),
            api_port: 7891,
            refresh_seconds: DEFAULT_REFRESH_SECONDS,
            trend_weeks: DEFAULT_TREND_WEEKS,
            trend_timeout_seconds: DEFAULT_TREND_TIMEOUT_SECONDS,
            missed_task_limit: crate::trends::DEFAULT_MISSED_TASK_LIMIT,
        }
    }
}

impl Config {
    pub fn root_dir() -> PathBuf {
        default_root_dir()
    }

    pub fn config_path() -> PathBuf {
        default_root_dir().join(CONFIG_FILE)
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Strict load: a missing or unparseable file is an error, never silently
    /// replaced with defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let content = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&config_path, content)
            .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;

        Ok(())
    }

    pub fn ensure_bootstrap_files(&self) -> Result<()> {
        let root = Self::root_dir();
        fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create root directory: {}", root.display()))?;

        if let Some(parent) = self.db_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create DB directory: {}", parent.display()))?;
        }

        if !self.catalog_path.exists() {
            fs::write(&self.catalog_path, include_str!("../assets/catalog.json")).with_context(
                || {
                    format!(
                        "Failed to create default catalog file: {}",
                        self.catalog_path.display()
                    )
                },
            )?;
        }

        Ok(())
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_seconds.max(1))
    }

    pub fn trend_timeout(&self) -> Duration {
        Duration::from_secs(self.trend_timeout_seconds.max(1))
    }

    pub fn set_value(&mut self, key: &str, value: &str) -> Result<()> {
        match normalize_config_key(key) {
            "db_path" => {
                self.db_path = expand_home(value);
            }
            "catalog_path" => {
                self.catalog_path = expand_home(value);
            }
            "api_port" => {
                self.api_port = value
                    .parse::<u16>()
                    .map_err(|_| anyhow!("api_port must be a number"))?;
            }
            "refresh_seconds" => {
                let parsed = value
                    .parse::<u64>()
                    .map_err(|_| anyhow!("refresh_seconds must be a number"))?;
                if parsed == 0 {
                    bail!("refresh_seconds must be at least 1");
                }
                self.refresh_seconds = parsed;
            }
            "trend_weeks" => {
                let parsed = value
                    .parse::<u32>()
                    .map_err(|_| anyhow!("trend_weeks must be a number"))?;
                if parsed == 0 {
                    bail!("trend_weeks must be at least 1");
                }
                self.trend_weeks = parsed;
            }
            "trend_timeout_seconds" => {
                self.trend_timeout_seconds = value
                    .parse::<u64>()
                    .map_err(|_| anyhow!("trend_timeout_seconds must be a number"))?
                    .max(1);
            }
            "missed_task_limit" => {
                self.missed_task_limit = value
                    .parse::<usize>()
                    .map_err(|_| anyhow!("missed_task_limit must be a number"))?
                    .max(1);
            }
            _ => {
                bail!(
                    "Unsupported config key: {key}. Supported keys: db_path|db.path, catalog_path|catalog.path, api_port|api.port, refresh_seconds|coordinator.refresh_seconds, trend_weeks|trends.weeks, trend_timeout_seconds|trends.timeout_seconds, missed_task_limit|trends.missed_task_limit"
                );
            }
        }

        Ok(())
    }

    pub fn get_value(&self, key: &str) -> Option<String> {
        match normalize_config_key(key) {
            "db_path" => Some(self.db_path.display().to_string()),
            "catalog_path" => Some(self.catalog_path.display().to_string()),
            "api_port" => Some(self.api_port.to_string()),
            "refresh_seconds" => Some(self.refresh_seconds.to_string()),
            "trend_weeks" => Some(self.trend_weeks.to_string()),
            "trend_timeout_seconds" => Some(self.trend_timeout_seconds.to_string()),
            "missed_task_limit" => Some(self.missed_task_limit.to_string()),
            _ => None,
        }
    }
}

fn normalize_config_key(key: &str) -> &str {
    match key {
        "db_path" | "db.path" => "db_path",
        "catalog_path" | "catalog.path" => "catalog_path",
        "api_port" | "api.port" => "api_port",
        "refresh_seconds" | "coordinator.refresh_seconds" => "refresh_seconds",
        "trend_weeks" | "trends.weeks" => "trend_weeks",
        "trend_timeout_seconds" | "trends.timeout_seconds" => "trend_timeout_seconds",
        "missed_task_limit" | "trends.missed_task_limit" => "missed_task_limit",
        _ => key,
    }
}

pub fn expand_home(raw: &str) -> PathBuf {
    raw.strip_prefix("~/")
        .and_then(|stripped| home_dir().map(|home| home.join(stripped)))
        .unwrap_or_else(|| PathBuf::from(raw))
}

fn default_root_dir() -> PathBuf {
    home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.refresh_seconds, 60);
        assert_eq!(config.trend_weeks, 4);
        assert!(config.db_path.ends_with("db/submissions.db"));
    }

    #[test]
    fn set_value_accepts_dotted_aliases() {
        let mut config = Config::default();
        config.set_value("trends.weeks", "6").expect("set");
        assert_eq!(config.trend_weeks, 6);

        config.set_value("api.port", "9000").expect("set");
        assert_eq!(config.api_port, 9000);
    }

    #[test]
    fn rejects_zero_refresh() {
        let mut config = Config::default();
        assert!(config.set_value("refresh_seconds", "0").is_err());
    }

    #[test]
    fn rejects_unknown_key() {
        let mut config = Config::default();
        assert!(config.set_value("polling_seconds", "300").is_err());
        assert!(config.get_value("polling_seconds").is_none());
    }

    #[test]
    fn corrupt_config_file_is_an_error() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("config.json");
        fs::write(&path, "{not json").expect("write");

        let error = Config::load_from(&path).expect_err("parse must fail");
        assert!(error.to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn valid_config_file_loads() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("config.json");
        let content = serde_json::to_string(&Config::default()).expect("serialize");
        fs::write(&path, content).expect("write");

        let loaded = Config::load_from(&path).expect("load");
        assert_eq!(loaded.api_port, Config::default().api_port);
    }

    #[test]
    fn get_value_round_trips() {
        let config = Config::default();
        assert_eq!(config.get_value("trend_weeks").as_deref(), Some("4"));
        assert_eq!(config.get_value("missed_task_limit").as_deref(), Some("5"));
    }
}
