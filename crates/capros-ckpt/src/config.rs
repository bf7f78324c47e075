use std::path::Path;

use capros_cache::{CacheConfig, PmemInfo};
use capros_types::Oid;
use serde::{Deserialize, Serialize};

use crate::error::{PersistError, PersistResult};

/// Sizing and policy for the persistence core.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub cache: CacheConfig,
    /// Physical memory map; page frames come from its RAM regions.
    pub memory: Vec<PmemInfo>,
    /// Maximum number of objects the log directory tracks.
    pub directory_capacity: usize,
    /// Maximum number of generations the log directory tracks.
    pub max_generations: usize,
    /// Log usage (percent) at which a checkpoint is requested.
    pub log_limit_percent: u8,
    /// Frames ordinary cleaning leaves free for the next checkpoint.
    pub checkpoint_reserve_frames: u32,
    /// Objects the checkpoint writes per step.
    pub checkpoint_batch: usize,
    /// Objects migration copies per step.
    pub migration_batch: usize,
    /// Object directory pages written per checkpoint step.
    pub dir_page_batch: usize,
    /// Format a fresh log instead of restarting from an anchor.
    pub big_bang: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            memory: vec![PmemInfo::ram(0, 1024)],
            directory_capacity: 64 * 1024,
            max_generations: 15,
            log_limit_percent: 70,
            checkpoint_reserve_frames: 8,
            checkpoint_batch: 64,
            migration_batch: 64,
            dir_page_batch: 4,
            big_bang: false,
        }
    }
}

impl CoreConfig {
    /// A small configuration for tests: checksums on, tiny batches.
    pub fn small(ram_frames: u64, node_frames: u32) -> Self {
        Self {
            cache: CacheConfig::small(node_frames),
            memory: vec![PmemInfo::ram(0, ram_frames)],
            directory_capacity: 4096,
            checkpoint_batch: 4,
            migration_batch: 4,
            dir_page_batch: 1,
            ..Self::default()
        }
    }

    pub fn with_big_bang(mut self, big_bang: bool) -> Self {
        self.big_bang = big_bang;
        self
    }

    pub fn from_toml_str(s: &str) -> PersistResult<Self> {
        let config: Self = toml::from_str(s).map_err(|e| PersistError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> PersistResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> PersistResult<String> {
        toml::to_string(self).map_err(|e| PersistError::Config(e.to_string()))
    }

    pub fn validate(&self) -> PersistResult<()> {
        if self.log_limit_percent == 0 || self.log_limit_percent > 100 {
            return Err(PersistError::Config(format!(
                "log_limit_percent must be in 1..=100, got {}",
                self.log_limit_percent
            )));
        }
        if self.max_generations < 2 {
            return Err(PersistError::Config(
                "max_generations must be at least 2".into(),
            ));
        }
        if self.checkpoint_batch == 0 || self.migration_batch == 0 || self.dir_page_batch == 0 {
            return Err(PersistError::Config("batch sizes must be non-zero".into()));
        }
        if self.cache.hash_buckets == 0 {
            return Err(PersistError::Config("hash_buckets must be non-zero".into()));
        }
        Ok(())
    }
}

/// Options passed on the boot command line, e.g. `ipl=0x1000 drive=hd0 debug`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BootParams {
    /// Initial program to start when there is no checkpoint to resume.
    pub ipl: Option<Oid>,
    pub drive: Option<String>,
    pub debug: bool,
}

impl BootParams {
    pub fn parse(cmdline: &str) -> PersistResult<Self> {
        let mut params = Self::default();
        for word in cmdline.split_whitespace() {
            match word.split_once('=') {
                Some(("ipl", value)) => params.ipl = Some(Oid::parse(value)?),
                Some(("drive", value)) => params.drive = Some(value.to_string()),
                None if word == "debug" => params.debug = true,
                _ => {
                    return Err(PersistError::Config(format!(
                        "unknown boot option `{word}`"
                    )))
                }
            }
        }
        Ok(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let c = CoreConfig::default();
        assert_eq!(c.max_generations, 15);
        assert_eq!(c.log_limit_percent, 70);
        assert!(!c.big_bang);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let c = CoreConfig::from_toml_str(
            r#"
            big_bang = true
            log_limit_percent = 50

            [cache]
            node_frames = 32
            "#,
        )
        .unwrap();
        assert!(c.big_bang);
        assert_eq!(c.log_limit_percent, 50);
        assert_eq!(c.cache.node_frames, 32);
        assert_eq!(c.cache.hash_buckets, 1024);
        assert_eq!(c.migration_batch, 64);
    }

    #[test]
    fn toml_round_trip_and_file_load() {
        let c = CoreConfig::small(16, 8).with_big_bang(true);
        let text = c.to_toml_string().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("core.toml");
        std::fs::write(&path, text).unwrap();
        assert_eq!(CoreConfig::load(&path).unwrap(), c);
    }

    #[test]
    fn rejects_bad_limits() {
        assert!(matches!(
            CoreConfig::from_toml_str("log_limit_percent = 0"),
            Err(PersistError::Config(_))
        ));
        assert!(CoreConfig::from_toml_str("max_generations = 1").is_err());
        assert!(CoreConfig::from_toml_str("big_bang = \"yes\"").is_err());
    }

    #[test]
    fn boot_params() {
        let p = BootParams::parse("ipl=0x1000 drive=hd0 debug").unwrap();
        assert_eq!(p.ipl, Some(Oid(0x1000)));
        assert_eq!(p.drive.as_deref(), Some("hd0"));
        assert!(p.debug);

        assert_eq!(BootParams::parse("").unwrap(), BootParams::default());
        assert!(BootParams::parse("ipl=zz").is_err());
        assert!(BootParams::parse("verbose").is_err());
    }
}
