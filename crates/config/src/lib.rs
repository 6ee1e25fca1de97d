//! Layered configuration for cirrus.
//!
//! Values are resolved in order, later sources winning:
//!
//! 1. Built-in defaults.
//! 2. A configuration file: the path given explicitly, or `config.toml` in
//!    the platform configuration directory. TOML, YAML (`.yaml`/`.yml`) and
//!    JSON (`.json`) are recognised by extension.
//! 3. `CIRRUS_` environment variables, with `__` separating nested keys
//!    (`CIRRUS_CHUNKS__COMPRESSION=zstd`, `CIRRUS_STORAGE__BACKEND=s3`).

pub mod error;
mod sections;

pub use crate::sections::{ChunkConfig, DatabaseConfig, GcConfig, StorageConfig, TimeoutConfig, VersionConfig};
use crate::error::{ErrorKind, Result};
use cirrus_compress::Compression;
use directories::ProjectDirs;
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const ENV_PREFIX: &str = "CIRRUS_";

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "cirrus")
}

/// Platform data directory, falling back to the working directory.
pub(crate) fn data_dir() -> PathBuf {
    project_dirs().map(|dirs| dirs.data_dir().to_path_buf()).unwrap_or_else(|| PathBuf::from("."))
}

/// Default location of the configuration file, if the platform has one.
pub fn default_config_file() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().join("config.toml"))
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub chunks: ChunkConfig,
    pub versions: VersionConfig,
    pub gc: GcConfig,
    pub timeouts: TimeoutConfig,
}

impl Config {
    /// The unresolved provider stack. A missing default file is skipped.
    pub fn figment(path: Option<&Path>) -> Figment {
        let figment = Figment::from(Serialized::defaults(Config::default()));
        let figment = match path.map(Path::to_path_buf).or_else(default_config_file) {
            Some(file) => match file.extension().and_then(|ext| ext.to_str()) {
                Some("yaml" | "yml") => figment.merge(Yaml::file(file)),
                Some("json") => figment.merge(Json::file(file)),
                _ => figment.merge(Toml::file(file)),
            },
            None => figment,
        };
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load and validate configuration.
    ///
    /// An explicit `path` must exist; the default file is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path
            && !path.is_file()
        {
            exn::bail!(ErrorKind::NotFound(path.to_path_buf()));
        }
        let config: Config = Self::figment(path).extract().or_raise(|| ErrorKind::Load)?;
        config.validate()?;
        tracing::debug!(?config.storage, chunk_size = config.chunks.size, "Loaded configuration");
        Ok(config)
    }

    /// Check ranges and cross-field consistency.
    pub fn validate(&self) -> Result<()> {
        if self.chunks.size == 0 {
            exn::bail!(ErrorKind::Invalid("chunks.size must be greater than zero"));
        }
        self.compression()?;
        if self.versions.checkpoint_interval == 0 {
            exn::bail!(ErrorKind::Invalid("versions.checkpoint_interval must be greater than zero"));
        }
        let ratio = self.versions.delta_savings_ratio;
        if !(ratio > 0.0 && ratio <= 1.0) {
            exn::bail!(ErrorKind::Invalid("versions.delta_savings_ratio must be in (0, 1]"));
        }
        if self.gc.interval_secs == 0 {
            exn::bail!(ErrorKind::Invalid("gc.interval_secs must be greater than zero"));
        }
        if self.timeouts.read_ms == 0 || self.timeouts.write_ms == 0 {
            exn::bail!(ErrorKind::Invalid("timeouts must be greater than zero"));
        }
        match &self.storage {
            StorageConfig::Local { root } if root.as_os_str().is_empty() => {
                exn::bail!(ErrorKind::Invalid("storage.root must not be empty"))
            },
            StorageConfig::S3 { bucket, .. } if bucket.is_empty() => {
                exn::bail!(ErrorKind::Invalid("storage.bucket must not be empty"))
            },
            StorageConfig::S3 { key_id: None, .. } | StorageConfig::S3 { key_secret: None, .. } => {
                exn::bail!(ErrorKind::Invalid("storage.key_id and storage.key_secret are required for s3"))
            },
            _ => {},
        }
        Ok(())
    }

    /// Parsed compression format for new chunks.
    pub fn compression(&self) -> Result<Compression> {
        self.chunks
            .compression
            .parse::<Compression>()
            .or_raise(|| ErrorKind::Invalid("chunks.compression is not a known format"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use rstest::rstest;
    use std::time::Duration;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.chunks.size, 512 * 1024);
        assert_eq!(config.compression().unwrap(), Compression::Gzip);
        assert_eq!(config.versions.checkpoint_interval, 10);
        assert_eq!(config.gc.grace_period(), Duration::from_secs(3600));
        assert!(matches!(config.storage, StorageConfig::Local { .. }));
    }

    #[rstest]
    #[case::zero_chunk_size(|c: &mut Config| c.chunks.size = 0)]
    #[case::unknown_compression(|c: &mut Config| c.chunks.compression = "lz4".to_string())]
    #[case::zero_checkpoint(|c: &mut Config| c.versions.checkpoint_interval = 0)]
    #[case::zero_ratio(|c: &mut Config| c.versions.delta_savings_ratio = 0.0)]
    #[case::ratio_above_one(|c: &mut Config| c.versions.delta_savings_ratio = 1.5)]
    #[case::nan_ratio(|c: &mut Config| c.versions.delta_savings_ratio = f64::NAN)]
    #[case::zero_gc_interval(|c: &mut Config| c.gc.interval_secs = 0)]
    #[case::zero_timeout(|c: &mut Config| c.timeouts.read_ms = 0)]
    #[case::empty_bucket(|c: &mut Config| c.storage = StorageConfig::S3 {
        bucket: String::new(),
        prefix: None,
        region: None,
        endpoint: None,
        key_id: Some("AKIA".to_string()),
        key_secret: Some("secret".to_string()),
    })]
    #[case::half_credentials(|c: &mut Config| c.storage = StorageConfig::S3 {
        bucket: "media".to_string(),
        prefix: None,
        region: None,
        endpoint: None,
        key_id: Some("AKIA".to_string()),
        key_secret: None,
    })]
    fn test_validate_rejects(#[case] mutate: fn(&mut Config)) {
        let mut config = Config::default();
        mutate(&mut config);
        let err = config.validate().unwrap_err();
        assert!(matches!(&*err, ErrorKind::Invalid(_)));
    }

    #[test]
    fn test_missing_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.toml");
        let err = Config::load(Some(&path)).unwrap_err();
        assert_eq!(*err, ErrorKind::NotFound(path));
    }

    #[test]
    fn test_toml_file_then_env() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "cirrus.toml",
                r#"
                [chunks]
                size = 65536
                compression = "bzip2"

                [versions]
                checkpoint_interval = 5
                "#,
            )?;
            jail.set_env("CIRRUS_VERSIONS__CHECKPOINT_INTERVAL", "20");
            jail.set_env("CIRRUS_GC__GRACE_PERIOD_SECS", "0");

            let config = Config::load(Some(Path::new("cirrus.toml"))).unwrap();
            assert_eq!(config.chunks.size, 65536);
            assert_eq!(config.compression().unwrap(), Compression::Bzip2);
            assert_eq!(config.versions.checkpoint_interval, 20);
            assert_eq!(config.versions.delta_savings_ratio, 0.7);
            assert_eq!(config.gc.grace_period(), Duration::ZERO);
            Ok(())
        });
    }

    #[test]
    fn test_yaml_s3_storage() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "cirrus.yaml",
                r#"
storage:
  backend: s3
  bucket: media
  prefix: vault
  endpoint: http://localhost:9000
timeouts:
  read_ms: 500
"#,
            )?;
            jail.set_env("CIRRUS_STORAGE__REGION", "eu-west-1");
            jail.set_env("CIRRUS_STORAGE__KEY_ID", "AKIA");
            jail.set_env("CIRRUS_STORAGE__KEY_SECRET", "secret");

            let config = Config::load(Some(Path::new("cirrus.yaml"))).unwrap();
            assert_eq!(
                config.storage,
                StorageConfig::S3 {
                    bucket: "media".to_string(),
                    prefix: Some("vault".to_string()),
                    region: Some("eu-west-1".to_string()),
                    endpoint: Some("http://localhost:9000".to_string()),
                    key_id: Some("AKIA".to_string()),
                    key_secret: Some("secret".to_string()),
                }
            );
            assert_eq!(config.timeouts.read(), Duration::from_millis(500));
            assert_eq!(config.timeouts.write(), Duration::from_secs(60));
            Ok(())
        });
    }

    #[test]
    fn test_invalid_json_value_fails_to_load() {
        Jail::expect_with(|jail| {
            jail.create_file("cirrus.json", r#"{ "chunks": { "size": "large" } }"#)?;
            let err = Config::load(Some(Path::new("cirrus.json"))).unwrap_err();
            assert_eq!(*err, ErrorKind::Load);
            Ok(())
        });
    }
}
