//! 🔧 App Configuration: the sacred TOML-to-struct pipeline.
//!
//! 📡 Env vars first, then an optional TOML file on top. Figment does the merging,
//! serde does the shaping, `validate` does the yelling. 🦆

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::Deserialize;
use tracing::info;

use crate::backends::{FileStoreConfig, S3StoreConfig};
use crate::relay::RelayConfig;

/// S3 refuses multipart parts smaller than this (except the last one).
pub const S3_MIN_PART_SIZE_BYTES: usize = 5 * 1024 * 1024;

/// 📦 One struct to rule them all, and in the Figment bind them.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// 🎭 Which object store to talk to. Externally tagged and snake_cased:
/// `[store.s3]`, `[store.file]`, `store = "in_memory"`, or `S3ZIP_STORE__FILE__ROOT=...`.
///
/// ⚠️ Figment lowercases env keys, so the tags must be lowercase too or the env route
/// can never pick a store.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StoreConfig {
    S3(S3StoreConfig),
    File(FileStoreConfig),
    /// Nothing persists. Handy for dry runs and tests, useless for everything else.
    InMemory,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::S3(S3StoreConfig::default())
    }
}

/// 🚰 Knobs for the relay, the uploader and the per-item deadlines.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Most archive bytes allowed in flight between producer and consumer.
    pub relay_capacity_bytes: usize,
    /// Size of one relay slot.
    pub relay_chunk_bytes: usize,
    /// Multipart part size for the destination upload.
    pub part_size_bytes: usize,
    pub probe_timeout_secs: u64,
    pub fetch_timeout_secs: u64,
    /// Deadline for each upload request (create, part, complete).
    pub upload_timeout_secs: u64,
    /// When false, absence is detected by the fetch itself coming back NotFound.
    pub probe_before_fetch: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            relay_capacity_bytes: 1024 * 1024,
            relay_chunk_bytes: 64 * 1024,
            part_size_bytes: 8 * 1024 * 1024,
            probe_timeout_secs: 30,
            fetch_timeout_secs: 300,
            upload_timeout_secs: 300,
            probe_before_fetch: true,
        }
    }
}

impl PipelineConfig {
    pub fn relay(&self) -> RelayConfig {
        RelayConfig::new(self.relay_capacity_bytes, self.relay_chunk_bytes)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }

    /// 🚦 Refuse settings that would deadlock, spin, or get rejected by S3 at part two.
    pub fn validate(&self, store: &StoreConfig) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.relay_capacity_bytes > 0 && self.relay_chunk_bytes > 0,
            "💀 relay_capacity_bytes and relay_chunk_bytes must both be above zero. \
             A relay with no room relays nothing."
        );
        anyhow::ensure!(
            self.relay_chunk_bytes <= self.relay_capacity_bytes,
            "💀 relay_chunk_bytes ({}) is larger than relay_capacity_bytes ({}). \
             The slot does not fit in the building.",
            self.relay_chunk_bytes,
            self.relay_capacity_bytes
        );
        anyhow::ensure!(self.part_size_bytes > 0, "💀 part_size_bytes must be above zero");
        anyhow::ensure!(
            self.probe_timeout_secs > 0
                && self.fetch_timeout_secs > 0
                && self.upload_timeout_secs > 0,
            "💀 timeouts must be at least one second. Zero seconds is not a deadline, it's a verdict."
        );
        if matches!(store, StoreConfig::S3(_)) {
            anyhow::ensure!(
                self.part_size_bytes >= S3_MIN_PART_SIZE_BYTES,
                "💀 part_size_bytes ({}) is below the S3 minimum of {} bytes",
                self.part_size_bytes,
                S3_MIN_PART_SIZE_BYTES
            );
        }
        Ok(())
    }
}

impl AppConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        self.pipeline.validate(&self.store)
    }
}

/// 🚀 Load the config from env vars (`S3ZIP_*`, `__` nests) and an optional TOML file.
///
/// 📐 No file → env vars only. A file → env vars + TOML merged, TOML wins on conflicts.
pub fn load_config(config_file_name: Option<&Path>) -> anyhow::Result<AppConfig> {
    info!(
        "🔧 Loading configuration: {:#?}",
        config_file_name.unwrap_or(Path::new(""))
    );

    let config = Figment::new().merge(Env::prefixed("S3ZIP_").split("__"));
    let config = match config_file_name {
        Some(file_name) => config.merge(Toml::file(file_name)),
        None => config,
    };

    let context_msg = match config_file_name {
        Some(path) => format!(
            "💀 Failed to parse configuration from file '{}' and environment variables (S3ZIP_*). \
             The file exists in our hearts, but apparently not on disk.",
            path.display()
        ),
        None => "💀 Failed to parse configuration from environment variables (S3ZIP_*). \
                 No file was provided, this one's all on the environment. Classic."
            .to_string(),
    };

    let app_config: AppConfig = config.extract().context(context_msg)?;
    app_config
        .validate()
        .context("💀 The configuration parsed, then failed its sanity check")?;
    Ok(app_config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn write_test_config(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("s3zip.toml");
        std::fs::write(&path, contents)
            .expect("💀 Failed to write test config. The filesystem said 'new phone who dis'.");
        path
    }

    #[test]
    fn the_one_where_nothing_is_configured_and_defaults_carry_the_day() {
        let config = AppConfig::default();
        assert_eq!(config.store, StoreConfig::S3(S3StoreConfig::default()));
        assert_eq!(config.pipeline.relay_capacity_bytes, 1024 * 1024);
        assert_eq!(config.pipeline.part_size_bytes, 8 * 1024 * 1024);
        assert!(config.pipeline.probe_before_fetch);
        config.validate().expect("defaults are valid");
    }

    #[test]
    fn the_one_where_the_toml_picks_a_file_store_and_small_parts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_test_config(
            &dir,
            r#"
            [store.file]
            root = "/srv/buckets"

            [pipeline]
            part_size_bytes = 1024
            relay_capacity_bytes = 4096
            relay_chunk_bytes = 512
            probe_before_fetch = false
            "#,
        );

        let config = load_config(Some(path.as_path())).expect("config should parse");
        assert_eq!(
            config.store,
            StoreConfig::File(FileStoreConfig {
                root: PathBuf::from("/srv/buckets")
            })
        );
        assert_eq!(config.pipeline.part_size_bytes, 1024);
        assert_eq!(config.pipeline.relay().slots(), 8);
        assert!(!config.pipeline.probe_before_fetch);
        // -- untouched knobs keep their defaults
        assert_eq!(config.pipeline.fetch_timeout_secs, 300);
    }

    #[test]
    fn the_one_where_s3_settings_come_through_the_toml() {
        let parsed: AppConfig = toml::from_str(
            r#"
            [store.s3]
            region = "eu-west-1"
            endpoint_url = "http://localhost:9000"
            force_path_style = true
            "#,
        )
        .expect("parse");
        match parsed.store {
            StoreConfig::S3(s3) => {
                assert_eq!(s3.region, "eu-west-1");
                assert_eq!(s3.endpoint_url.as_deref(), Some("http://localhost:9000"));
                assert!(s3.force_path_style);
            }
            honestly_who_knows => panic!(
                "💀 Expected S3 store config, but serde took us to {:?}. Plot twist energy.",
                honestly_who_knows
            ),
        }
    }

    #[test]
    fn the_one_where_the_environment_alone_picks_the_store() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("S3ZIP_STORE__FILE__ROOT", "/srv/buckets");
            jail.set_env("S3ZIP_PIPELINE__PART_SIZE_BYTES", "2048");
            let config = load_config(None).map_err(|err| format!("{err:#}"))?;
            assert_eq!(
                config.store,
                StoreConfig::File(FileStoreConfig {
                    root: PathBuf::from("/srv/buckets")
                })
            );
            assert_eq!(config.pipeline.part_size_bytes, 2048);
            Ok(())
        });

        figment::Jail::expect_with(|jail| {
            jail.set_env("S3ZIP_STORE__S3__REGION", "eu-central-1");
            jail.set_env("S3ZIP_STORE__S3__FORCE_PATH_STYLE", "true");
            let config = load_config(None).map_err(|err| format!("{err:#}"))?;
            let StoreConfig::S3(s3) = config.store else {
                return Err(format!("💀 env picked {:?} instead of S3", config.store).into());
            };
            assert_eq!(s3.region, "eu-central-1");
            assert!(s3.force_path_style);
            Ok(())
        });

        figment::Jail::expect_with(|jail| {
            jail.set_env("S3ZIP_STORE", "in_memory");
            let config = load_config(None).map_err(|err| format!("{err:#}"))?;
            assert_eq!(config.store, StoreConfig::InMemory);
            Ok(())
        });
    }

    #[test]
    fn the_one_where_s3_refuses_tiny_parts() {
        let pipeline = PipelineConfig {
            part_size_bytes: 1024,
            ..PipelineConfig::default()
        };
        assert!(pipeline.validate(&StoreConfig::default()).is_err());
        assert!(pipeline.validate(&StoreConfig::InMemory).is_ok());
    }

    #[test]
    fn the_one_where_the_slot_is_bigger_than_the_building() {
        let pipeline = PipelineConfig {
            relay_capacity_bytes: 100,
            relay_chunk_bytes: 200,
            ..PipelineConfig::default()
        };
        assert!(pipeline.validate(&StoreConfig::InMemory).is_err());

        let zero_timeout = PipelineConfig {
            probe_timeout_secs: 0,
            ..PipelineConfig::default()
        };
        assert!(zero_timeout.validate(&StoreConfig::InMemory).is_err());
    }

    #[test]
    fn the_one_where_a_broken_file_gets_a_helpful_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_test_config(&dir, "[pipeline]\npart_size_bytes = \"lots\"\n");
        let err = load_config(Some(path.as_path())).expect_err("bad type");
        assert!(format!("{err:#}").contains("Failed to parse configuration"));
    }
}
