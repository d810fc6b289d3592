//! Render configuration.
//!
//! Loaded once per process from JSON; every field has a default so a
//! partial document is valid.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Which scheduling strategy drives the frame loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleKind {
    /// Every rank traces a slice of the image and may process any instance.
    Image,
    /// Every instance is pinned to one rank; rays travel to their owner.
    Domain,
}

/// Render configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Scheduling strategy
    pub schedule: ScheduleKind,
    /// Adapter registry tag used to build geometry adapters
    pub adapter: String,
    /// Worker threads for chunked routing (0 = one per core)
    pub threads: usize,
    /// Film width in pixels
    pub width: u32,
    /// Film height in pixels
    pub height: u32,
    /// Capacity left in a queue after it is drained
    pub queue_reserve: usize,
    /// Upper bound on a single blocking receive, in milliseconds
    pub comm_timeout_ms: u64,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            schedule: ScheduleKind::Domain,
            adapter: "bounds".to_string(),
            threads: 0,
            width: 512,
            height: 512,
            queue_reserve: 4096,
            comm_timeout_ms: 30_000,
        }
    }
}

impl RenderConfig {
    /// Parse a configuration from a JSON document.
    pub fn from_json_str(json: &str) -> ConfigResult<Self> {
        let config: RenderConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&json)?;
        log::info!("Loaded render config from {}", path.display());
        Ok(config)
    }

    /// Bound on a single blocking receive between ranks.
    pub fn comm_timeout(&self) -> Duration {
        Duration::from_millis(self.comm_timeout_ms)
    }

    /// Number of pixels on the film.
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.adapter.is_empty() {
            return Err(ConfigError::Invalid("adapter tag is empty".into()));
        }
        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::Invalid(format!(
                "film size {}x{} is empty",
                self.width, self.height
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = RenderConfig::from_json_str(r#"{ "schedule": "image", "threads": 4 }"#)
            .unwrap();

        assert_eq!(config.schedule, ScheduleKind::Image);
        assert_eq!(config.threads, 4);
        assert_eq!(config.adapter, "bounds");
        assert_eq!(config.queue_reserve, 4096);
        assert_eq!(config.comm_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_unknown_schedule_is_rejected() {
        let err = RenderConfig::from_json_str(r#"{ "schedule": "hybrid" }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Json(_)));
    }

    #[test]
    fn test_empty_film_is_rejected() {
        let err = RenderConfig::from_json_str(r#"{ "width": 0 }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = RenderConfig::load("/nonexistent/render.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn test_json_roundtrip() {
        let config = RenderConfig {
            width: 64,
            height: 32,
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(RenderConfig::from_json_str(&json).unwrap(), config);
        assert_eq!(config.pixel_count(), 64 * 32);
    }
}
