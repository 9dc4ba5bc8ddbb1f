//! Restore: read archive segments back from tape and extract selected
//! entries.
//!
//! A reader thread pulls blocks from the drive into the elastic buffer while
//! the calling thread walks the tar stream and unpacks the wanted entries.
//! Extraction stops as soon as every wanted entry has been found.

use super::hash::CheckSumBlockwiseCalculator;
use super::JobEvent;
use crate::device::DeviceSession;
use crate::error::{Result, TapeStreamError};
use crate::flow::{BufferReader, ElasticBuffer, FlowConfig};
use crate::snapshot::{EntryKind, ManifestEntry};
use crossbeam::channel::Sender;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

/// Makes a volume available in the drive for reading.
pub trait VolumeMount {
    /// Load `volume_id` if it is not already loaded and return the session.
    fn mount(&mut self, volume_id: &str) -> Result<&mut DeviceSession>;
}

/// A contiguous piece of archive on one volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub volume_id: String,
    pub tape_file: u64,
    /// Archive bytes in the segment; `None` reads to the next filemark.
    pub bytes: Option<u64>,
}

#[derive(Debug, Default)]
pub struct RestoreReport {
    pub restored: Vec<String>,
    pub bytes: u64,
    pub missing: Vec<String>,
    pub checksum_mismatches: Vec<String>,
}

impl RestoreReport {
    /// Turn mismatches and entries that never showed up into an error.
    pub fn into_result(self) -> Result<Self> {
        if !self.checksum_mismatches.is_empty() {
            return Err(TapeStreamError::tape_device(format!(
                "checksum mismatch on {} restored entries, first {}",
                self.checksum_mismatches.len(),
                self.checksum_mismatches[0]
            )));
        }
        if !self.missing.is_empty() {
            return Err(TapeStreamError::Generic(anyhow::anyhow!(
                "{} entries were not found on tape, first {}",
                self.missing.len(),
                self.missing[0]
            )));
        }
        Ok(self)
    }
}

fn skip_tape_file(session: &mut DeviceSession) -> Result<()> {
    let mut block = vec![0u8; session.block_size() as usize];
    let handle = session.handle();
    while handle.read(&mut block)? > 0 {}
    Ok(())
}

fn read_segments(
    mount: &mut (dyn VolumeMount + Send),
    segments: &[Segment],
    buffer: &ElasticBuffer,
) -> Result<()> {
    for segment in segments {
        let session = mount.mount(&segment.volume_id)?;
        debug!(
            "Reading segment on {} at tape file {}",
            segment.volume_id, segment.tape_file
        );

        session.handle().rewind()?;
        for _ in 0..segment.tape_file {
            skip_tape_file(session)?;
        }

        let mut block = vec![0u8; session.block_size() as usize];
        let mut remaining = segment.bytes;
        let handle = session.handle();
        loop {
            if remaining == Some(0) {
                break;
            }
            let n = handle.read(&mut block)?;
            if n == 0 {
                if remaining.is_some() {
                    warn!(
                        "Filemark on {} with {:?} archive bytes still expected",
                        segment.volume_id, remaining
                    );
                }
                break;
            }
            let take = remaining.map_or(n, |r| r.min(n as u64) as usize);
            if buffer.push(&block[..take]).is_err() {
                // extraction finished early
                return Ok(());
            }
            if let Some(r) = remaining.as_mut() {
                *r -= take as u64;
            }
        }
    }

    buffer.close();
    Ok(())
}

fn verify_checksum(path: &Path, expected: &str) -> Result<bool> {
    let Some(mut calc) =
        CheckSumBlockwiseCalculator::new(CheckSumBlockwiseCalculator::type_of(expected))
    else {
        return Ok(true);
    };
    let mut file = File::open(path)?;
    let mut chunk = vec![0u8; 1 << 20];
    loop {
        let n = file.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        calc.propagate(&chunk[..n]);
    }
    Ok(calc.value() == expected)
}

fn extract(
    buffer: &Arc<ElasticBuffer>,
    wanted: &BTreeMap<String, ManifestEntry>,
    target: &Path,
    events: Option<&Sender<JobEvent>>,
) -> Result<RestoreReport> {
    let mut report = RestoreReport::default();
    let mut outstanding: BTreeSet<&str> = wanted.keys().map(String::as_str).collect();
    let mut archive = tar::Archive::new(BufferReader::new(buffer.clone()));
    archive.set_preserve_mtime(true);

    for entry in archive.entries()? {
        if outstanding.is_empty() {
            break;
        }
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().into_owned();
        let Some(expected) = wanted.get(&name) else {
            continue;
        };
        if !outstanding.remove(name.as_str()) {
            continue;
        }

        if !entry.unpack_in(target)? {
            warn!("Refusing to restore {} outside {:?}", name, target);
            report.missing.push(name);
            continue;
        }
        let size = entry.header().size().unwrap_or(0);
        debug!("Restored {} ({} bytes)", name, size);

        if let (EntryKind::File, Some(checksum)) = (&expected.kind, &expected.checksum) {
            if !verify_checksum(&target.join(&name), checksum)? {
                warn!("Checksum mismatch on restored {}", name);
                report.checksum_mismatches.push(name.clone());
            }
        }

        if let Some(tx) = events {
            let _ = tx.send(JobEvent::FileRestored {
                path: name.clone(),
                size,
            });
        }
        report.bytes += size;
        report.restored.push(name);
    }

    report.missing.extend(outstanding.into_iter().map(str::to_string));
    Ok(report)
}

/// Extract `wanted` from the archive formed by `segments`, in order.
pub fn restore_segments(
    mount: &mut (dyn VolumeMount + Send),
    segments: &[Segment],
    wanted: &BTreeMap<String, ManifestEntry>,
    target: &Path,
    flow: &FlowConfig,
    events: Option<&Sender<JobEvent>>,
) -> Result<RestoreReport> {
    if wanted.is_empty() || segments.is_empty() {
        return Ok(RestoreReport::default());
    }
    info!(
        "Restoring {} entries from {} segment(s) into {:?}",
        wanted.len(),
        segments.len(),
        target
    );

    let buffer = ElasticBuffer::new(flow)?;

    thread::scope(|scope| {
        let reader = {
            let buffer = buffer.clone();
            scope.spawn(move || {
                let result = read_segments(mount, segments, &buffer);
                if let Err(e) = &result {
                    buffer.abort(e.to_string());
                }
                result
            })
        };

        let extracted = extract(&buffer, wanted, target, events);
        buffer.abort("restore finished");

        let read = reader
            .join()
            .map_err(|_| TapeStreamError::Generic(anyhow::anyhow!("tape reader thread panicked")))?;

        match (extracted, read) {
            (Ok(report), _) => Ok(report),
            // the reader's error explains a broken stream better than tar does
            (Err(_), Err(read_err)) => Err(read_err),
            (Err(e), Ok(())) => Err(e),
        }
    })
}
