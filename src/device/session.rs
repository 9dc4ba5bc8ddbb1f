//! Exclusive device sessions.
//!
//! A session owns the drive handle and an on-disk lock file for the device.
//! The lock is taken before the drive is opened and removed when the session
//! drops, whichever way the job ends.

use super::{PositionInfo, TapeDriver, TapeHandle, WriteFault};
use crate::error::{Result, TapeStreamError};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Serialize, Deserialize)]
struct LockEntry {
    hostname: String,
    pid: u32,
    time: String,
}

fn hostname() -> String {
    fs::read_to_string("/proc/sys/kernel/hostname")
        .or_else(|_| fs::read_to_string("/etc/hostname"))
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "localhost".to_string())
}

fn lock_file_name(device: &Path) -> String {
    let flat: String = device
        .to_string_lossy()
        .trim_start_matches('/')
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("{}.lock", flat)
}

/// Advisory per-device lock file.
#[derive(Debug)]
pub struct DeviceLock {
    path: PathBuf,
}

impl DeviceLock {
    pub fn acquire(lock_dir: &Path, device: &Path) -> Result<Self> {
        fs::create_dir_all(lock_dir)?;
        let path = lock_dir.join(lock_file_name(device));

        match Self::try_create(&path) {
            Ok(lock) => Ok(lock),
            Err(TapeStreamError::DeviceBusy(holder)) => {
                if Self::is_stale(&path) {
                    warn!("Removing stale device lock {:?} ({})", path, holder);
                    fs::remove_file(&path)?;
                    Self::try_create(&path)
                } else {
                    Err(TapeStreamError::DeviceBusy(format!(
                        "{:?} is locked by {}",
                        device, holder
                    )))
                }
            }
            Err(e) => Err(e),
        }
    }

    fn try_create(path: &Path) -> Result<Self> {
        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = fs::read_to_string(path).unwrap_or_default();
                return Err(TapeStreamError::DeviceBusy(holder.trim().to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let entry = LockEntry {
            hostname: hostname(),
            pid: std::process::id(),
            time: chrono::Utc::now().to_rfc3339(),
        };
        file.write_all(serde_json::to_string(&entry)?.as_bytes())?;
        file.sync_all()?;

        debug!("Acquired device lock {:?}", path);
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    /// A lock is stale when it was written on this host by a process that no
    /// longer exists.
    fn is_stale(path: &Path) -> bool {
        let Ok(content) = fs::read_to_string(path) else {
            return false;
        };
        let Ok(entry) = serde_json::from_str::<LockEntry>(&content) else {
            return false;
        };
        entry.hostname == hostname()
            && entry.pid != std::process::id()
            && !Path::new(&format!("/proc/{}", entry.pid)).exists()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DeviceLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Failed to release device lock {:?}: {}", self.path, e);
        } else {
            debug!("Released device lock {:?}", self.path);
        }
    }
}

/// Stand-in handle while the cartridge is being changed.
struct Released;

impl Released {
    fn error() -> TapeStreamError {
        TapeStreamError::tape_device("drive released for media change")
    }
}

impl TapeHandle for Released {
    fn write(&mut self, _buf: &[u8]) -> std::result::Result<usize, WriteFault> {
        Err(WriteFault::Io(std::io::Error::new(
            std::io::ErrorKind::NotConnected,
            "drive released for media change",
        )))
    }

    fn read(&mut self, _buf: &mut [u8]) -> Result<usize> {
        Err(Self::error())
    }

    fn position_info(&mut self) -> Result<PositionInfo> {
        Err(Self::error())
    }

    fn set_fixed_block_mode(&mut self, _block_size: u32) -> Result<()> {
        Err(Self::error())
    }

    fn rewind(&mut self) -> Result<()> {
        Err(Self::error())
    }
}

/// An open, exclusively locked drive.
pub struct DeviceSession {
    device_path: PathBuf,
    block_size: u32,
    driver: Arc<dyn TapeDriver>,
    handle: Box<dyn TapeHandle>,
    // dropped last so the handle is closed before the lock goes away
    _lock: DeviceLock,
}

impl DeviceSession {
    pub fn open(
        driver: Arc<dyn TapeDriver>,
        device_path: &Path,
        block_size: u32,
        lock_dir: &Path,
    ) -> Result<Self> {
        let lock = DeviceLock::acquire(lock_dir, device_path)?;
        let mut handle = driver.open(device_path, block_size)?;
        handle.set_fixed_block_mode(block_size)?;

        info!("Device session opened on {:?}", device_path);
        Ok(Self {
            device_path: device_path.to_path_buf(),
            block_size,
            driver,
            handle,
            _lock: lock,
        })
    }

    /// Close the drive handle ahead of a media change. The lock stays held.
    pub fn release(&mut self) {
        debug!("Releasing {:?} for media change", self.device_path);
        self.handle = Box::new(Released);
    }

    /// Reopen the drive after a media change, keeping the lock.
    pub fn reopen(&mut self) -> Result<()> {
        debug!("Reopening {:?} after media change", self.device_path);
        let mut handle = self.driver.open(&self.device_path, self.block_size)?;
        handle.set_fixed_block_mode(self.block_size)?;
        self.handle = handle;
        Ok(())
    }

    pub fn handle(&mut self) -> &mut dyn TapeHandle {
        self.handle.as_mut()
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn device_path(&self) -> &Path {
        &self.device_path
    }
}
