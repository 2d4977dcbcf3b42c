//! Cache configuration options

use crate::storage::StorageLevel;
use query_core::{QueryError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Configuration for the cache manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Whether queries are served from cached data
    pub enabled: bool,
    /// Storage level used when a cache request does not name one
    pub default_storage_level: StorageLevel,
    /// Partition count used when both sides of a join must be reshuffled
    pub default_shuffle_partitions: usize,
    /// Directory for disk-backed blocks; a temporary directory when unset
    pub spill_dir: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_storage_level: StorageLevel::MemoryAndDisk,
            default_shuffle_partitions: 8,
            spill_dir: None,
        }
    }
}

impl CacheConfig {
    /// Create a configuration that never serves cached data
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Load a configuration from a JSON file; missing fields take defaults
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: CacheConfig = serde_json::from_str(&contents)
            .map_err(|e| QueryError::ConfigError(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_shuffle_partitions == 0 {
            return Err(QueryError::ConfigError(
                "default_shuffle_partitions must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Set the default storage level
    pub fn with_storage_level(mut self, level: StorageLevel) -> Self {
        self.default_storage_level = level;
        self
    }

    /// Set the shuffle partition count
    pub fn with_shuffle_partitions(mut self, partitions: usize) -> Self {
        self.default_shuffle_partitions = partitions;
        self
    }

    /// Set the directory for disk-backed blocks
    pub fn with_spill_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spill_dir = Some(dir.into());
        self
    }

    /// Enable or disable the cache
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert!(config.enabled);
        assert_eq!(config.default_storage_level, StorageLevel::MemoryAndDisk);
        assert_eq!(config.default_shuffle_partitions, 8);
        assert!(config.spill_dir.is_none());
    }

    #[test]
    fn test_disabled_config() {
        let config = CacheConfig::disabled();
        assert!(!config.enabled);
    }

    #[test]
    fn test_builder_pattern() {
        let config = CacheConfig::default()
            .with_storage_level(StorageLevel::DiskOnly)
            .with_shuffle_partitions(16)
            .with_spill_dir("/tmp/blocks")
            .with_enabled(true);

        assert_eq!(config.default_storage_level, StorageLevel::DiskOnly);
        assert_eq!(config.default_shuffle_partitions, 16);
        assert_eq!(config.spill_dir, Some(PathBuf::from("/tmp/blocks")));
    }

    #[test]
    fn test_from_json_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"default_shuffle_partitions": 4, "default_storage_level": "MemoryOnly"}}"#)
            .unwrap();

        let config = CacheConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.default_shuffle_partitions, 4);
        assert_eq!(config.default_storage_level, StorageLevel::MemoryOnly);
        assert!(config.enabled);
    }

    #[test]
    fn test_from_json_file_rejects_zero_partitions() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"default_shuffle_partitions": 0}}"#).unwrap();
        assert!(matches!(
            CacheConfig::from_json_file(file.path()),
            Err(QueryError::ConfigError(_))
        ));
    }
}
