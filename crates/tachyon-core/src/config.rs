//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::artifact::DEFAULT_CHUNK_SIZE;
use crate::rate_limiter::RateLimitConfig;
use crate::reaper::ReaperConfig;

/// Default artifact directory, relative to the working directory
pub const DEFAULT_ARTIFACT_DIR: &str = "tmpdata";

/// Lifecycle engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory holding one artifact per active session
    pub artifact_dir: PathBuf,

    /// Chunk size used to write and stream artifacts
    pub chunk_size: usize,

    /// Admission control
    pub rate_limit: RateLimitConfig,

    /// Background reclamation
    pub reaper: ReaperConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            artifact_dir: PathBuf::from(DEFAULT_ARTIFACT_DIR),
            chunk_size: DEFAULT_CHUNK_SIZE,
            rate_limit: RateLimitConfig::default(),
            reaper: ReaperConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Configuration rooted at `artifact_dir` with default limits
    #[must_use]
    pub fn with_artifact_dir(artifact_dir: impl Into<PathBuf>) -> Self {
        Self {
            artifact_dir: artifact_dir.into(),
            ..Self::default()
        }
    }

    /// Override the rate limiting cooldown
    #[must_use]
    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.rate_limit.cooldown = cooldown;
        self
    }

    /// Override the maximum session age
    #[must_use]
    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.reaper.max_age = max_age;
        self
    }

    /// Override the sweep interval
    #[must_use]
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.reaper.interval = interval;
        self
    }
}
