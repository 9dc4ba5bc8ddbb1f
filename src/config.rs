//! Configuration file handling.
//!
//! A JSON document describing drives, pools and local directories. Looked up
//! at `--config`, then `<config dir>/tapestream/config.json`; built-in
//! defaults apply when neither exists.

use crate::error::{Result, TapeStreamError};
use crate::flow::{FlowConfig, Watermarks};
use crate::volume::Pool;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

pub const DEFAULT_BLOCK_SIZE: u32 = 512 * 1024;
const GIB: f64 = (1u64 << 30) as f64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriveConfig {
    pub name: String,
    pub device_path: PathBuf,
    #[serde(default = "default_block_size")]
    pub block_size: u32,
    /// Media changer device (`/dev/sgN`) driven through `mtx`.
    #[serde(default)]
    pub changer: Option<PathBuf>,
    #[serde(default)]
    pub drive_index: u32,
    /// Pool the changer picks volumes from; the first pool when unset.
    #[serde(default)]
    pub pool: Option<String>,
}

fn default_block_size() -> u32 {
    DEFAULT_BLOCK_SIZE
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub memory_buffer_gb: f64,
    pub high_watermark_pct: u32,
    pub low_watermark_pct: u32,
    pub safe_memory_fraction: f64,
    pub max_stall_secs: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            memory_buffer_gb: 16.0,
            high_watermark_pct: 90,
            low_watermark_pct: 20,
            safe_memory_fraction: 0.6,
            max_stall_secs: 120,
        }
    }
}

impl BufferConfig {
    pub fn capacity_bytes(&self) -> u64 {
        (self.memory_buffer_gb * GIB) as u64
    }

    pub fn watermarks(&self) -> Result<Watermarks> {
        Watermarks::from_percent(self.high_watermark_pct, self.low_watermark_pct)
    }

    pub fn flow_config(&self, block_size: u32) -> Result<FlowConfig> {
        let flow = FlowConfig {
            capacity: usize::try_from(self.capacity_bytes()).map_err(|_| {
                TapeStreamError::config("Buffer size does not fit this platform's address space")
            })?,
            watermarks: self.watermarks()?,
            block_size: block_size as usize,
            max_stall: Duration::from_secs(self.max_stall_secs),
        };
        flow.validate()?;
        Ok(flow)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub drives: Vec<DriveConfig>,
    pub pools: Vec<Pool>,
    pub staging_dir: PathBuf,
    pub snapshot_dir: PathBuf,
    pub lock_dir: PathBuf,
    pub buffer: BufferConfig,
    pub device_retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("tapestream");
        Self {
            drives: vec![DriveConfig {
                name: "tape0".to_string(),
                device_path: PathBuf::from("/dev/nst0"),
                block_size: DEFAULT_BLOCK_SIZE,
                changer: None,
                drive_index: 0,
                pool: None,
            }],
            pools: Vec::new(),
            staging_dir: std::env::temp_dir().join("tapestream-staging"),
            snapshot_dir: data_dir.join("snapshots"),
            lock_dir: std::env::temp_dir().join("tapestream-locks"),
            buffer: BufferConfig::default(),
            device_retries: 3,
        }
    }
}

impl Config {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("tapestream").join("config.json"))
    }

    /// Load from `path`, or from the default location, or fall back to
    /// defaults. An explicit path that cannot be read is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match Self::default_path().filter(|p| p.exists()) {
                Some(p) => p,
                None => {
                    debug!("No configuration file, using defaults");
                    return Ok(Self::default());
                }
            },
        };

        let content = fs::read_to_string(&path).map_err(|e| {
            TapeStreamError::config(format!("Cannot read config {:?}: {}", path, e))
        })?;
        let config: Config = serde_json::from_str(&content).map_err(|e| {
            TapeStreamError::config(format!("Cannot parse config {:?}: {}", path, e))
        })?;

        info!("Loaded configuration from {:?}", path);
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.drives.is_empty() {
            return Err(TapeStreamError::config("No drives configured"));
        }

        let mut names = HashSet::new();
        for drive in &self.drives {
            if !names.insert(drive.name.as_str()) {
                return Err(TapeStreamError::config(format!(
                    "Duplicate drive name '{}'",
                    drive.name
                )));
            }
            if drive.block_size == 0 || drive.block_size % 512 != 0 {
                return Err(TapeStreamError::config(format!(
                    "Drive '{}': block size {} is not a positive multiple of 512",
                    drive.name, drive.block_size
                )));
            }
            if let Some(pool) = &drive.pool {
                if !self.pools.iter().any(|p| &p.name == pool) {
                    return Err(TapeStreamError::config(format!(
                        "Drive '{}' refers to unknown pool '{}'",
                        drive.name, pool
                    )));
                }
            }
        }

        let mut labels = HashSet::new();
        for pool in &self.pools {
            for volume in &pool.volumes {
                if !labels.insert(volume.label.as_str()) {
                    return Err(TapeStreamError::config(format!(
                        "Volume '{}' is listed in more than one place",
                        volume.label
                    )));
                }
            }
        }

        if self.buffer.memory_buffer_gb <= 0.0 {
            return Err(TapeStreamError::config("memory_buffer_gb must be positive"));
        }
        if !(self.buffer.safe_memory_fraction > 0.0 && self.buffer.safe_memory_fraction <= 1.0) {
            return Err(TapeStreamError::config(
                "safe_memory_fraction must be in (0, 1]",
            ));
        }
        if self.buffer.max_stall_secs == 0 {
            return Err(TapeStreamError::config("max_stall_secs must be positive"));
        }
        self.buffer.watermarks()?;
        Ok(())
    }

    /// Drive by name, or the first configured drive.
    pub fn drive(&self, name: Option<&str>) -> Result<&DriveConfig> {
        match name {
            Some(name) => self
                .drives
                .iter()
                .find(|d| d.name == name)
                .ok_or_else(|| TapeStreamError::config(format!("Unknown drive '{}'", name))),
            None => self
                .drives
                .first()
                .ok_or_else(|| TapeStreamError::config("No drives configured")),
        }
    }

    pub fn pool_for(&self, drive: &DriveConfig) -> Option<Pool> {
        match &drive.pool {
            Some(name) => self.pools.iter().find(|p| &p.name == name).cloned(),
            None => self.pools.first().cloned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.drive(None).unwrap().device_path, PathBuf::from("/dev/nst0"));
        assert_eq!(config.buffer.capacity_bytes(), 16 << 30);
    }

    #[test]
    fn test_load_partial_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{
                "drives": [{"name": "lto9", "device_path": "/dev/nst1", "changer": "/dev/sg3", "pool": "weekly"}],
                "pools": [{"name": "weekly", "retention_days": 28, "volumes": [{"label": "W001", "slot": 1}]}],
                "buffer": {"memory_buffer_gb": 2},
                "device_retries": 5
            }"#,
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        let drive = config.drive(Some("lto9")).unwrap();
        assert_eq!(drive.block_size, DEFAULT_BLOCK_SIZE);
        assert_eq!(config.pool_for(drive).unwrap().volumes.len(), 1);
        assert_eq!(config.buffer.high_watermark_pct, 90);
        assert_eq!(config.device_retries, 5);
        assert!(config.drive(Some("missing")).is_err());
    }

    #[test]
    fn test_invalid_documents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        fs::write(&path, r#"{"buffer": {"high_watermark_pct": 10, "low_watermark_pct": 50}}"#).unwrap();
        assert!(matches!(Config::load(Some(&path)), Err(TapeStreamError::Config(_))));

        fs::write(&path, "not json").unwrap();
        assert!(matches!(Config::load(Some(&path)), Err(TapeStreamError::Config(_))));

        assert!(Config::load(Some(&dir.path().join("absent.json"))).is_err());

        let mut config = Config::default();
        config.drives[0].block_size = 1000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_flow_config_from_buffer_settings() {
        let buffer = BufferConfig {
            memory_buffer_gb: 0.0625,
            ..Default::default()
        };
        let flow = buffer.flow_config(DEFAULT_BLOCK_SIZE).unwrap();
        assert_eq!(flow.capacity, 64 << 20);
        assert!(flow.high_mark() > flow.low_mark());
        assert_eq!(flow.low_mark(), (64usize << 20) / 5);
    }
}
