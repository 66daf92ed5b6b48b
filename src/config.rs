use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default file looked up when no `--config` is given.
pub const DEFAULT_CONFIG_FILE: &str = "portwatch.toml";

/// Per-run scan parameters. Every field is optional in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub targets: Vec<String>,
    /// Literal spec (`22,80-90`) or a keyword: `auto` (or empty), `top`.
    pub ports: String,
    pub rate: u32,
    /// Zero lets the decision engine recommend a value.
    pub wait_seconds: u64,
    pub interface: Option<String>,
    /// Derive a /24 from the local source address when `targets` is empty.
    pub auto_targets: bool,
    pub banner_max_bytes: usize,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            ports: "auto".into(),
            rate: 1000,
            wait_seconds: 0,
            interface: None,
            auto_targets: true,
            banner_max_bytes: 1024,
            connect_timeout_secs: 3,
            read_timeout_secs: 3,
        }
    }
}

impl ScanConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub fast_path: String,
    pub verify_path: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fast_path: "masscan".into(),
            verify_path: "nmap".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Embedded,
    Postgres,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Database file of the embedded backend.
    pub path: PathBuf,
    /// Connection string of the postgres backend.
    pub database_url: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Embedded,
            path: PathBuf::from("data/portwatch.db"),
            database_url: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebUiConfig {
    pub listen: String,
    /// Bearer token required on `/api/*`; empty disables the check.
    pub auth_token: String,
    pub assets_dir: PathBuf,
}

impl Default for WebUiConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".into(),
            auth_token: String::new(),
            assets_dir: PathBuf::from("ui"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub enabled: bool,
    pub poll_interval_secs: u64,
    pub batch_size: u32,
    /// Deliver to a Telegram chat instead of the log.
    pub telegram: Option<TelegramConfig>,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            poll_interval_secs: 5,
            batch_size: 20,
            telegram: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: String,
    #[serde(default = "TelegramConfig::default_api_base")]
    pub api_base: String,
}

impl TelegramConfig {
    fn default_api_base() -> String {
        "https://api.telegram.org".into()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub scan: ScanConfig,
    pub engines: EngineConfig,
    pub storage: StorageConfig,
    pub webui: WebUiConfig,
    pub notify: NotifyConfig,
}

impl AppConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).context("invalid configuration")
    }

    /// Load from `path`, or from [`DEFAULT_CONFIG_FILE`] if present, or defaults.
    ///
    /// An explicitly given path must exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => {
                let default = PathBuf::from(DEFAULT_CONFIG_FILE);
                if !default.exists() {
                    return Ok(Self::default());
                }
                default
            }
        };
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("in {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let cfg = AppConfig::from_toml_str("").unwrap();
        assert_eq!(cfg, AppConfig::default());
        assert_eq!(cfg.scan.rate, 1000);
        assert_eq!(cfg.scan.banner_max_bytes, 1024);
        assert_eq!(cfg.engines.verify_path, "nmap");
        assert_eq!(cfg.storage.backend, StorageBackend::Embedded);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let cfg = AppConfig::from_toml_str(
            r#"
            [scan]
            targets = ["192.168.1.0/24"]
            ports = "top"

            [storage]
            backend = "postgres"
            database_url = "postgres://scanner@localhost/ports"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.scan.targets, vec!["192.168.1.0/24".to_string()]);
        assert_eq!(cfg.scan.ports, "top");
        assert_eq!(cfg.scan.rate, 1000);
        assert_eq!(cfg.storage.backend, StorageBackend::Postgres);
        assert_eq!(cfg.webui.listen, "127.0.0.1:8080");
    }

    #[test]
    fn telegram_section_is_optional() {
        assert_eq!(AppConfig::default().notify.telegram, None);

        let cfg = AppConfig::from_toml_str(
            r#"
            [notify]
            enabled = true

            [notify.telegram]
            bot_token = "123:abc"
            chat_id = "-100200"
            "#,
        )
        .unwrap();
        let tg = cfg.notify.telegram.unwrap();
        assert_eq!(tg.bot_token, "123:abc");
        assert_eq!(tg.chat_id, "-100200");
        assert_eq!(tg.api_base, "https://api.telegram.org");
        assert_eq!(cfg.notify.batch_size, 20);
    }

    #[test]
    fn telegram_section_needs_token_and_chat() {
        assert!(AppConfig::from_toml_str("[notify.telegram]\nchat_id = \"1\"").is_err());
    }

    #[test]
    fn unknown_backend_is_rejected() {
        assert!(AppConfig::from_toml_str("[storage]\nbackend = \"bolt\"").is_err());
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(AppConfig::load(Some(&missing)).is_err());
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("portwatch.toml");
        std::fs::write(&path, "[webui]\nauth_token = \"s3cret\"\n").unwrap();
        let cfg = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.webui.auth_token, "s3cret");
    }
}
