use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = "config/client.json";

/// Client configuration: backend endpoints plus reconnect knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub api_base_url: String,
    pub channel_url: String,
    pub database_path: String,
    /// Reconnect backoff base delay (milliseconds).
    pub backoff_base_ms: u64,
    /// Reconnect backoff cap (milliseconds).
    pub backoff_cap_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:8000".to_string(),
            channel_url: "ws://127.0.0.1:8000/ws".to_string(),
            database_path: "data/client.db".to_string(),
            backoff_base_ms: 500,
            backoff_cap_ms: 30_000,
        }
    }
}

pub fn load_config(path: &str) -> AppConfig {
    let path = Path::new(path);
    match fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str::<AppConfig>(&content) {
            Ok(config) => config,
            Err(err) => {
                log::warn!("Failed to parse config file {}: {err}", path.display());
                AppConfig::default()
            }
        },
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            let config = AppConfig::default();
            match save_config(&path.to_string_lossy(), &config) {
                Ok(()) => log::info!(
                    "Config file {} not found; wrote defaults",
                    path.display()
                ),
                Err(save_err) => log::warn!(
                    "Config file {} not found and defaults could not be written: {save_err}",
                    path.display()
                ),
            }
            config
        }
        Err(err) => {
            log::warn!(
                "Failed to read config file {}: {err}; using defaults",
                path.display()
            );
            AppConfig::default()
        }
    }
}

pub fn save_config(path: &str, config: &AppConfig) -> std::io::Result<()> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let json = serde_json::to_string_pretty(config)?;
    fs::write(path, json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_writes_defaults_for_the_next_run() {
        let path = std::env::temp_dir().join(format!(
            "rust-chat-sync-config-{}.json",
            std::process::id()
        ));
        let _ = fs::remove_file(&path);

        let config = load_config(&path.to_string_lossy());
        assert_eq!(config.backoff_base_ms, 500);
        assert_eq!(config.backoff_cap_ms, 30_000);

        let written = fs::read_to_string(&path).expect("defaults written to disk");
        let reloaded: AppConfig = serde_json::from_str(&written).expect("written file parses");
        assert_eq!(reloaded.channel_url, config.channel_url);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{"channel_url": "ws://example.test/ws"}"#).expect("parse");
        assert_eq!(config.channel_url, "ws://example.test/ws");
        assert_eq!(config.database_path, "data/client.db");
    }
}
