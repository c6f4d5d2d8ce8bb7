//! Configuration system for the Tachyon CLI.

use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tachyon_core::{EngineConfig, RateLimitConfig, ReaperConfig};

/// Tachyon configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// HTTP server configuration
    pub server: ServerConfig,
    /// Artifact storage configuration
    pub storage: StorageConfig,
    /// Rate limiting configuration
    pub limits: LimitsConfig,
    /// Reaper configuration
    pub reaper: ReaperSettings,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Where a loaded configuration came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    /// Read from the given file
    File,
    /// File absent, built-in defaults used
    Defaults,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Use the first `X-Forwarded-For` entry as the client identity
    #[serde(default = "default_true")]
    pub trust_forwarded_for: bool,
}

/// Artifact storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding session artifacts
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: PathBuf,
    /// Chunk size in bytes
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Minimum seconds between session initiations per client
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Cooldown windows a client entry is kept before eviction
    #[serde(default = "default_retention_windows")]
    pub retention_windows: u32,
}

/// Reaper configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaperSettings {
    /// Seconds between sweeps
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Session age in seconds after which it is reclaimed
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_true() -> bool {
    true
}

fn default_artifact_dir() -> PathBuf {
    PathBuf::from(tachyon_core::config::DEFAULT_ARTIFACT_DIR)
}

fn default_chunk_size() -> usize {
    tachyon_core::DEFAULT_CHUNK_SIZE
}

fn default_cooldown_secs() -> u64 {
    10
}

fn default_retention_windows() -> u32 {
    6
}

fn default_interval_secs() -> u64 {
    60
}

fn default_max_age_secs() -> u64 {
    3600
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            trust_forwarded_for: true,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            artifact_dir: default_artifact_dir(),
            chunk_size: default_chunk_size(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: default_cooldown_secs(),
            retention_windows: default_retention_windows(),
        }
    }
}

impl Default for ReaperSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            max_age_secs: default_max_age_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from `path`, or use defaults if it doesn't exist
    ///
    /// Runs before logging is configured, so the caller reports the source.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> anyhow::Result<(Self, ConfigSource)> {
        let path = path.as_ref();
        if path.exists() {
            Ok((Self::load(path)?, ConfigSource::File))
        } else {
            Ok((Self::default(), ConfigSource::Defaults))
        }
    }

    /// Parse listen address as `SocketAddr`
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn parse_listen_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.server.listen_addr.parse()?)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.parse_listen_addr().map_err(|e| {
            anyhow::anyhow!("Invalid listen address '{}': {}", self.server.listen_addr, e)
        })?;

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        if self.storage.chunk_size < 1024 || self.storage.chunk_size > 16 * 1024 * 1024 {
            anyhow::bail!("Chunk size must be between 1KB and 16MB");
        }

        if self.storage.artifact_dir.as_os_str().is_empty() {
            anyhow::bail!("Artifact directory must not be empty");
        }

        if self.reaper.interval_secs == 0 {
            anyhow::bail!("Reaper interval must be at least 1 second");
        }

        if self.reaper.max_age_secs == 0 {
            anyhow::bail!("Maximum session age must be at least 1 second");
        }

        if self.limits.retention_windows == 0 {
            anyhow::bail!("Rate limit retention must be at least 1 window");
        }

        Ok(())
    }

    /// Engine configuration derived from this file
    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            artifact_dir: self.storage.artifact_dir.clone(),
            chunk_size: self.storage.chunk_size,
            rate_limit: RateLimitConfig {
                cooldown: Duration::from_secs(self.limits.cooldown_secs),
                retention_windows: self.limits.retention_windows,
            },
            reaper: ReaperConfig {
                interval: Duration::from_secs(self.reaper.interval_secs),
                max_age: Duration::from_secs(self.reaper.max_age_secs),
            },
        }
    }
}
