//! Tape-Control Interface
//!
//! The narrow contract the streaming core consumes from the tape-control
//! layer: open a drive, write/read fixed-size blocks, report position, and
//! drive an autoloader. Positioning beyond rewind is not used by the core.

pub mod changer;
pub mod session;
pub mod st;

#[cfg(test)]
pub(crate) mod memory;

use crate::classify::{ErrorClassifier, FailureSignal};
use crate::error::Result;
use std::io;
use std::path::Path;
use std::process::Command;
use tracing::debug;

pub use changer::MtxChanger;
pub use session::{DeviceLock, DeviceSession};
pub use st::StDriver;

/// Why a block write did not go through.
#[derive(Debug)]
pub enum WriteFault {
    /// Device reported end of tape (zero-length write or EOM sense).
    Eot,
    /// Device reported no space left.
    Enospc,
    Io(io::Error),
}

impl std::fmt::Display for WriteFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteFault::Eot => write!(f, "end of tape"),
            WriteFault::Enospc => write!(f, "no space left on device"),
            WriteFault::Io(e) => write!(f, "{}", e),
        }
    }
}

/// Tape position as reported by the drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PositionInfo {
    pub file_number: u64,
    pub block_number: u64,
    pub block_size: u32,
}

/// An open drive. Exactly one owner at a time; moved into the writer thread
/// for the lifetime of a pipeline run.
pub trait TapeHandle: Send {
    fn write(&mut self, buf: &[u8]) -> std::result::Result<usize, WriteFault>;

    /// Read one block. `Ok(0)` means filemark or end of data.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    fn position_info(&mut self) -> Result<PositionInfo>;

    fn set_fixed_block_mode(&mut self, block_size: u32) -> Result<()>;

    fn rewind(&mut self) -> Result<()>;
}

/// Opens drives by device path.
pub trait TapeDriver: Send + Sync {
    fn open(&self, device: &Path, block_size: u32) -> Result<Box<dyn TapeHandle>>;
}

/// Media changer operations used for volume swaps.
pub trait Autoloader: Send {
    fn load_volume(&mut self, slot: u32) -> Result<()>;

    fn unload_volume(&mut self, slot: u32) -> Result<()>;

    /// Slot whose cartridge is currently in the drive.
    fn current_slot(&mut self) -> Result<Option<u32>>;

    /// Slot holding the cartridge with this barcode, if the changer can tell.
    fn slot_of(&mut self, _volume_label: &str) -> Result<Option<u32>> {
        Ok(None)
    }
}

/// Run an external tape tool and return its stdout.
///
/// A non-zero exit is classified from its stderr so callers get the taxonomy
/// error (EOT, device I/O, ...) rather than a bare exit status.
pub(crate) fn run_tool(tool: &str, args: &[&str]) -> Result<String> {
    debug!("Running {} {}", tool, args.join(" "));

    let output = Command::new(tool).args(args).output().map_err(|e| {
        crate::error::TapeStreamError::tape_device(format!("Cannot run {}: {}", tool, e))
    })?;

    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
    }

    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    let signal = FailureSignal::Exit {
        tool,
        code: output.status.code(),
        stderr: &stderr,
    };
    let kind = ErrorClassifier::new().kind_of(&signal);
    Err(kind.into_error(format!(
        "{} {} failed ({:?}): {}",
        tool,
        args.join(" "),
        output.status.code(),
        stderr.trim()
    )))
}
