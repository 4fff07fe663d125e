//! Engine configuration.
//!
//! Every section deserialises with defaults, so a TOML table containing only
//! the keys an operator cares about is a complete configuration:
//!
//! ```rust
//! use mneme_memory::MemoryConfig;
//!
//! let json = r#"{ "storage": { "max_size_mb": 64 } }"#;
//! let config: MemoryConfig = serde_json::from_str(json).unwrap();
//! assert_eq!(config.storage.max_size_mb, 64);
//! assert_eq!(config.storage.dimension, 384);
//! assert_eq!(config.cache.capacity, 1000);
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retention::RetentionPolicy;
use crate::retry::RetryConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// `false` builds a manager whose writes are no-ops.
    pub enabled: bool,
    pub storage: StorageConfig,
    pub cache: CacheConfig,
    pub embedding: EmbeddingConfig,
    pub search: SearchDefaults,
    pub retention: RetentionPolicy,
    pub retry: RetryConfig,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            storage: StorageConfig::default(),
            cache: CacheConfig::default(),
            embedding: EmbeddingConfig::default(),
            search: SearchDefaults::default(),
            retention: RetentionPolicy::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl MemoryConfig {
    /// Ephemeral configuration backed by an in-memory database.
    pub fn in_memory(dimension: usize) -> Self {
        let mut config = Self::default();
        config.storage.path = None;
        config.storage.dimension = dimension;
        config
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file. `None` keeps everything in memory.
    pub path: Option<PathBuf>,
    /// Embedding dimension, fixed for the lifetime of a database.
    pub dimension: usize,
    pub max_size_mb: u64,
    /// Usage at which `store()` starts warning.
    pub warning_percent: f64,
    /// Usage the size-cap sweep reduces to once the quota is exceeded.
    pub cleanup_target_percent: f64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: None,
            dimension: 384,
            max_size_mb: 500,
            warning_percent: 90.0,
            cleanup_target_percent: 80.0,
        }
    }
}

impl StorageConfig {
    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_mb.saturating_mul(1024 * 1024)
    }

    pub fn cleanup_target_bytes(&self) -> u64 {
        self.percent_of_max(self.cleanup_target_percent)
    }

    pub fn warning_bytes(&self) -> u64 {
        self.percent_of_max(self.warning_percent)
    }

    fn percent_of_max(&self, percent: f64) -> u64 {
        (self.max_size_bytes() as f64 * percent / 100.0) as u64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { capacity: 1000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub timeout_ms: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self { timeout_ms: 10_000 }
    }
}

impl EmbeddingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchDefaults {
    pub default_limit: usize,
    pub default_min_score: f32,
}

impl Default for SearchDefaults {
    fn default() -> Self {
        Self {
            default_limit: 10,
            default_min_score: 0.0,
        }
    }
}
