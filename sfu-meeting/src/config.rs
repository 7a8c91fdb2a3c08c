use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use sfu_engine::EngineSettings;
use std::path::Path;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub engine: EngineSettings,
    pub meeting: MeetingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeetingConfig {
    /// Maximum number of rooms (0 = unlimited)
    pub max_rooms: usize,
    /// Maximum number of peers per room (0 = unlimited)
    pub max_peers_per_room: usize,
    /// Seconds between empty room sweeps (0 = disabled)
    pub cleanup_interval_secs: u64,
    /// Sources a peer may produce when the caller does not restrict them
    pub default_sources: Vec<String>,
}

impl Default for MeetingConfig {
    fn default() -> Self {
        Self {
            max_rooms: 0,
            max_peers_per_room: 0,
            cleanup_interval_secs: 60,
            default_sources: vec![
                "mic".to_string(),
                "webcam".to_string(),
                "screen".to_string(),
            ],
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // SFU_MEETING__MAX_ROOMS, SFU_ENGINE__WORKER__LOG_LEVEL, ...
        builder = builder.add_source(
            Environment::with_prefix("SFU")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }
}
