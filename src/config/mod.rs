//! Layered configuration loading.
//!
//! There is no standalone config service to port from — the original
//! apps imported a `core.config` module that doesn't exist in the
//! reference tree — so this loader follows the host platform's own
//! conventions instead: a YAML file with sane built-in defaults so tests
//! and CLI tools never require a config directory to exist.

pub mod reload;

use std::path::Path;

use serde::{Deserialize, Serialize};

pub use reload::ConfigReloader;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindConfig {
    #[serde(default = "default_bind_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_bind_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for BindConfig {
    fn default() -> Self {
        Self {
            host: default_bind_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub scraper: BindConfig,
    #[serde(default)]
    pub log_dir: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            scraper: BindConfig::default(),
            log_dir: None,
        }
    }
}

/// Loads `<config_root>/base.yaml` if present, falling back to defaults
/// for any missing top-level key (and for the whole file if it's absent
/// or fails to parse — a missing config directory is not a fatal error
/// for tools like the backtest runner).
pub fn load_config(config_root: &Path) -> AppConfig {
    let path = config_root.join("base.yaml");
    match std::fs::read_to_string(&path) {
        Ok(contents) => serde_yaml::from_str(&contents).unwrap_or_default(),
        Err(_) => AppConfig::default(),
    }
}

pub fn setup_logging(default_filter: &str) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_config_falls_back_to_defaults_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(dir.path());
        assert_eq!(config.scraper.port, 8080);
    }

    #[test]
    fn load_config_reads_partial_override() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("base.yaml"), "scraper:\n  port: 9191\n").unwrap();
        let config = load_config(dir.path());
        assert_eq!(config.scraper.port, 9191);
        assert_eq!(config.scraper.host, "127.0.0.1");
    }
}
