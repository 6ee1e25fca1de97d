use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite database file, created if missing.
    pub path: PathBuf,
}
impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: crate::data_dir().join("cirrus.db") }
    }
}

/// Where chunk blobs live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    Local {
        root: PathBuf,
    },
    S3 {
        bucket: String,
        #[serde(default)]
        prefix: Option<String>,
        #[serde(default)]
        region: Option<String>,
        /// Custom endpoint for S3-compatible services.
        #[serde(default)]
        endpoint: Option<String>,
        #[serde(default)]
        key_id: Option<String>,
        #[serde(default)]
        key_secret: Option<String>,
    },
}
impl Default for StorageConfig {
    fn default() -> Self {
        Self::Local { root: crate::data_dir().join("blobs") }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkConfig {
    /// Chunk size in bytes.
    pub size: usize,
    /// Format for newly written chunks: `none`, `gzip`, `bzip2` or `zstd`.
    pub compression: String,
}
impl Default for ChunkConfig {
    fn default() -> Self {
        Self { size: 512 * 1024, compression: "gzip".to_string() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VersionConfig {
    pub checkpoint_interval: u64,
    pub max_delta_size: u64,
    pub delta_savings_ratio: f64,
}
impl Default for VersionConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: 10,
            max_delta_size: 1024 * 1024,
            delta_savings_ratio: 0.7,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    pub grace_period_secs: u64,
    pub interval_secs: u64,
}
impl Default for GcConfig {
    fn default() -> Self {
        Self { grace_period_secs: 60 * 60, interval_secs: 60 * 60 }
    }
}
impl GcConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Limits on individual storage backend calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub read_ms: u64,
    pub write_ms: u64,
}
impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { read_ms: 30_000, write_ms: 60_000 }
    }
}
impl TimeoutConfig {
    pub fn read(&self) -> Duration {
        Duration::from_millis(self.read_ms)
    }

    pub fn write(&self) -> Duration {
        Duration::from_millis(self.write_ms)
    }
}
