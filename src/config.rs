//! Runtime configuration.
//!
//! Values can come from defaults, a JSON document, or the environment. The
//! environment variables play the role of load-time module parameters and
//! override whatever the defaults say.

use crate::mapping::MapAttr;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const ENV_GLOBAL_BUFFERS: &str = "ZCACHE_GLOBAL_BUFFERS";
pub const ENV_RESERVED_PAGES: &str = "ZCACHE_RESERVED_PAGES";
pub const ENV_SHRINK_INTERVAL_MS: &str = "ZCACHE_SHRINK_INTERVAL_MS";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZcacheConfig {
    /// Number of scratch buffer shards, clamped to the CPU count. 0 = one per CPU.
    pub global_buffers: usize,
    /// Capacity of the reserved page pool. 0 disables it.
    pub reserved_pages: usize,
    /// Pages each scratch shard is grown to at init. 0 = start empty.
    pub initial_buffer_pages: usize,
    pub map_attr: MapAttr,
    pub shrinker: ShrinkerConfig,
}

impl Default for ZcacheConfig {
    fn default() -> Self {
        Self {
            global_buffers: 0,
            reserved_pages: 0,
            initial_buffer_pages: 0,
            map_attr: MapAttr::default(),
            shrinker: ShrinkerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShrinkerConfig {
    /// Start the background pressure monitor with the context
    pub monitor_enabled: bool,
    pub interval_ms: u64,
    /// Evictable workgroups tolerated before the monitor starts scanning
    pub high_watermark: usize,
    /// Upper bound on objects requested per scan
    pub scan_batch: usize,
}

impl Default for ShrinkerConfig {
    fn default() -> Self {
        Self {
            monitor_enabled: false,
            interval_ms: 100,
            high_watermark: 4096,
            scan_batch: 128,
        }
    }
}

impl ShrinkerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl ZcacheConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("invalid config document: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&contents)
    }

    /// Defaults overridden by any `ZCACHE_*` variables that are set.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(v) = env_number(ENV_GLOBAL_BUFFERS)? {
            self.global_buffers = v as usize;
        }
        if let Some(v) = env_number(ENV_RESERVED_PAGES)? {
            self.reserved_pages = v as usize;
        }
        if let Some(v) = env_number(ENV_SHRINK_INTERVAL_MS)? {
            self.shrinker.interval_ms = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.shrinker.interval_ms == 0 {
            return Err(Error::Config("shrinker interval must be non-zero".into()));
        }
        if self.shrinker.monitor_enabled && self.shrinker.scan_batch == 0 {
            return Err(Error::Config(
                "scan batch must be non-zero when the pressure monitor is enabled".into(),
            ));
        }
        Ok(())
    }
}

fn env_number(name: &str) -> Result<Option<u64>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| Error::Config(format!("{}={:?}: {}", name, raw, e))),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(Error::Config(format!("{}: {}", name, e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = ZcacheConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.global_buffers, 0);
        assert_eq!(config.shrinker.interval(), Duration::from_millis(100));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = ZcacheConfig::from_json_str(r#"{"reserved_pages": 32}"#).unwrap();
        assert_eq!(config.reserved_pages, 32);
        assert_eq!(config.shrinker, ShrinkerConfig::default());
    }

    #[test]
    fn test_invalid_json_is_config_error() {
        let err = ZcacheConfig::from_json_str("{not json").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let err = ZcacheConfig::from_json_str(r#"{"shrinker": {"interval_ms": 0}}"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_monitor_requires_scan_batch() {
        let mut config = ZcacheConfig::default();
        config.shrinker.monitor_enabled = true;
        config.shrinker.scan_batch = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"global_buffers": 2, "map_attr": "write_combine"}}"#
        )
        .unwrap();

        let config = ZcacheConfig::from_file(file.path()).unwrap();
        assert_eq!(config.global_buffers, 2);
        assert_eq!(config.map_attr, MapAttr::WriteCombine);
    }

    #[test]
    fn test_round_trip_through_json() {
        let mut config = ZcacheConfig::default();
        config.reserved_pages = 8;
        config.shrinker.high_watermark = 10;
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(ZcacheConfig::from_json_str(&json).unwrap(), config);
    }
}
