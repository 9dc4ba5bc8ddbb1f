//! Linux SCSI tape (`st`) adapter.
//!
//! Data moves through the non-rewinding device node; status, block mode and
//! rewind go through `mt`.

use super::{run_tool, PositionInfo, TapeDriver, TapeHandle, WriteFault};
use crate::error::{Result, TapeStreamError};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Driver for `/dev/nst*` style device nodes.
#[derive(Debug, Default, Clone)]
pub struct StDriver;

impl TapeDriver for StDriver {
    fn open(&self, device: &Path, block_size: u32) -> Result<Box<dyn TapeHandle>> {
        info!("Opening tape device {:?} (block size {})", device, block_size);

        let file = match OpenOptions::new().read(true).write(true).open(device) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied || e.raw_os_error() == Some(30) => {
                // write-protected cartridge: still usable for restore
                warn!("{:?} is not writable ({}), opening read-only", device, e);
                File::open(device)?
            }
            Err(e) => {
                return Err(TapeStreamError::tape_device(format!(
                    "Cannot open {:?}: {}",
                    device, e
                )))
            }
        };

        Ok(Box::new(StHandle {
            file,
            path: device.to_path_buf(),
            block_size,
        }))
    }
}

pub struct StHandle {
    file: File,
    path: PathBuf,
    block_size: u32,
}

impl StHandle {
    fn mt(&self, args: &[&str]) -> Result<String> {
        let dev = self.path.to_string_lossy();
        let mut full = vec!["-f", &*dev];
        full.extend_from_slice(args);
        run_tool("mt", &full)
    }
}

impl TapeHandle for StHandle {
    fn write(&mut self, buf: &[u8]) -> std::result::Result<usize, WriteFault> {
        match self.file.write(buf) {
            // st returns a short zero-length write once the early-warning zone is hit
            Ok(0) if !buf.is_empty() => Err(WriteFault::Eot),
            Ok(n) => Ok(n),
            Err(e) => Err(WriteFault::Io(e)),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.file.read(buf)?)
    }

    fn position_info(&mut self) -> Result<PositionInfo> {
        let status = self.mt(&["status"])?;
        let mut info = parse_mt_status(&status);
        if info.block_size == 0 {
            info.block_size = self.block_size;
        }
        Ok(info)
    }

    fn set_fixed_block_mode(&mut self, block_size: u32) -> Result<()> {
        debug!("Setting fixed block mode {} on {:?}", block_size, self.path);
        self.mt(&["setblk", &block_size.to_string()])?;
        self.block_size = block_size;
        Ok(())
    }

    fn rewind(&mut self) -> Result<()> {
        self.mt(&["rewind"])?;
        Ok(())
    }
}

/// Parse the position lines of `mt status`:
///
/// ```text
/// File number=3, block number=120, partition=0.
/// Tape block size 524288 bytes. Density code 0x60 (LTO-9).
/// ```
pub fn parse_mt_status(output: &str) -> PositionInfo {
    let mut info = PositionInfo::default();

    for line in output.lines() {
        let line = line.trim();
        if line.starts_with("File number=") {
            for part in line.trim_end_matches('.').split(',') {
                let mut kv = part.trim().splitn(2, '=');
                let key = kv.next().unwrap_or("").trim().to_lowercase();
                let value = kv.next().and_then(|v| v.trim().parse::<u64>().ok());
                match (key.as_str(), value) {
                    ("file number", Some(v)) => info.file_number = v,
                    ("block number", Some(v)) => info.block_number = v,
                    _ => {}
                }
            }
        } else if let Some(rest) = line.strip_prefix("Tape block size ") {
            if let Some(size) = rest.split_whitespace().next().and_then(|s| s.parse().ok()) {
                info.block_size = size;
            }
        }
    }

    info
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mt_status() {
        let output = "SCSI 2 tape drive:\n\
                      File number=3, block number=120, partition=0.\n\
                      Tape block size 524288 bytes. Density code 0x60 (LTO-9).\n\
                      Soft error count since last status=0\n\
                      General status bits on (81010000):\n EOF ONLINE IM_REP_EN\n";
        let info = parse_mt_status(output);
        assert_eq!(info.file_number, 3);
        assert_eq!(info.block_number, 120);
        assert_eq!(info.block_size, 524288);
    }

    #[test]
    fn test_parse_mt_status_variable_block_mode() {
        let output = "File number=0, block number=0, partition=0.\nTape block size 0 bytes.\n";
        let info = parse_mt_status(output);
        assert_eq!(info, PositionInfo::default());
    }
}
