//! Tape writer side of a pipeline run.
//!
//! Pulls blocks from a source, writes them to the drive one fixed-size block
//! at a time and turns acknowledged byte counts into committed file records.

use super::{FileTransferRecord, JobEvent};
use crate::classify::{ClassifyContext, ErrorClassifier, ErrorKind, FailureSignal};
use crate::device::{DeviceSession, TapeHandle, WriteFault};
use crate::error::{Result, TapeStreamError};
use crate::flow::ElasticBuffer;
use crossbeam::channel::{Receiver, Sender};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// An archive entry's extent in the run's stream, as reported by the
/// producer.
#[derive(Debug, Clone)]
pub(crate) struct Boundary {
    pub index: usize,
    pub name: String,
    pub header_offset: u64,
    pub end_offset: u64,
    pub size: u64,
    pub checksum: Option<String>,
    /// Producer dropped this entry; it resolves without a record.
    pub skipped: bool,
}

/// Where the writer gets its blocks from.
pub(crate) trait BlockSource: Send {
    fn next_block(&mut self) -> Result<Option<Vec<u8>>>;

    /// Stop the other side after the writer gave up.
    fn abort(&self, reason: &str);

    /// The other side stopped first.
    fn aborted_by_peer(&self) -> bool;
}

pub(crate) struct BufferSource(pub Arc<ElasticBuffer>);

impl BlockSource for BufferSource {
    fn next_block(&mut self) -> Result<Option<Vec<u8>>> {
        self.0.pop_block()
    }

    fn abort(&self, reason: &str) {
        self.0.abort(reason);
    }

    fn aborted_by_peer(&self) -> bool {
        self.0.is_aborted()
    }
}

/// Reads a staged archive straight off disk for the single-thread strategy.
pub(crate) struct FileSource {
    file: File,
    block_size: usize,
    cancel: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
}

impl FileSource {
    pub fn open(
        path: &Path,
        offset: u64,
        block_size: usize,
        cancel: Arc<AtomicBool>,
        stopped: Arc<AtomicBool>,
    ) -> Result<Self> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        Ok(Self {
            file,
            block_size,
            cancel,
            stopped,
        })
    }
}

impl BlockSource for FileSource {
    fn next_block(&mut self) -> Result<Option<Vec<u8>>> {
        if self.cancel.load(Ordering::SeqCst) {
            self.stopped.store(true, Ordering::SeqCst);
            return Ok(None);
        }

        let mut block = vec![0u8; self.block_size];
        let mut filled = 0;
        while filled < block.len() {
            let n = self.file.read(&mut block[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            return Ok(None);
        }
        block.truncate(filled);
        Ok(Some(block))
    }

    fn abort(&self, _reason: &str) {}

    fn aborted_by_peer(&self) -> bool {
        false
    }
}

/// Turns acknowledged stream positions into file records.
pub(crate) struct Committer {
    run_id: String,
    pending: VecDeque<Boundary>,
    incoming: Option<Receiver<Boundary>>,
    /// `(volume_id, archive offset where it starts)`, in write order.
    spans: Vec<(String, u64)>,
    records: Vec<FileTransferRecord>,
    skipped: Vec<String>,
    next_file: usize,
    events: Option<Sender<JobEvent>>,
}

impl Committer {
    pub fn new(
        run_id: &str,
        pending: Vec<Boundary>,
        incoming: Option<Receiver<Boundary>>,
        spans: Vec<(String, u64)>,
        next_file: usize,
        events: Option<Sender<JobEvent>>,
    ) -> Self {
        Self {
            run_id: run_id.to_string(),
            pending: pending.into(),
            incoming,
            spans,
            records: Vec::new(),
            skipped: Vec::new(),
            next_file,
            events,
        }
    }

    fn volume_at(&self, offset: u64) -> (String, u64) {
        self.spans
            .iter()
            .rev()
            .find(|(_, base)| *base <= offset)
            .or_else(|| self.spans.first())
            .cloned()
            .unwrap_or_default()
    }

    /// Resolve every entry that ends at or before `acked`.
    pub fn advance(&mut self, acked: u64) {
        if let Some(rx) = &self.incoming {
            self.pending.extend(rx.try_iter());
        }

        while self.pending.front().map_or(false, |b| b.end_offset <= acked) {
            let Some(b) = self.pending.pop_front() else {
                break;
            };
            self.next_file = b.index + 1;

            if b.skipped {
                self.skipped.push(b.name);
                continue;
            }

            let (volume_id, base) = self.volume_at(b.header_offset);
            debug!("Committed {} ({} bytes) on {}", b.name, b.size, volume_id);
            if let Some(tx) = &self.events {
                let _ = tx.send(JobEvent::FileCommitted {
                    path: b.name.clone(),
                    size: b.size,
                });
            }
            self.records.push(FileTransferRecord {
                index: b.index,
                path: b.name,
                volume_id,
                offset: b.header_offset - base,
                archive_offset: b.header_offset,
                size: b.size,
                checksum: b.checksum,
                run_id: self.run_id.clone(),
            });
        }
    }
}

/// How the writer loop ended.
#[derive(Debug)]
pub(crate) enum WriterEnd {
    Drained,
    EndOfVolume(ErrorKind, TapeStreamError),
    Failed(TapeStreamError),
    /// The producer aborted the buffer; its own result carries the reason.
    PeerAborted,
}

pub(crate) struct WriterReport {
    pub session: DeviceSession,
    pub end: WriterEnd,
    pub bytes_written: u64,
    pub records: Vec<FileTransferRecord>,
    pub skipped: Vec<String>,
    pub next_file: usize,
    pub archive_position: u64,
}

pub(crate) struct WriterSettings {
    pub device_retries: u32,
    pub retry_delay: Duration,
    pub classifier: Arc<ErrorClassifier>,
    pub ctx: ClassifyContext,
    pub events: Option<Sender<JobEvent>>,
}

enum BlockFault {
    EndOfVolume(ErrorKind, TapeStreamError),
    Fatal(TapeStreamError),
}

fn write_block(
    handle: &mut dyn TapeHandle,
    block: &[u8],
    settings: &WriterSettings,
) -> std::result::Result<(), BlockFault> {
    let mut attempt = 0;
    loop {
        match handle.write(block) {
            Ok(n) if n == block.len() => return Ok(()),
            Ok(n) => {
                return Err(BlockFault::EndOfVolume(
                    ErrorKind::DeviceEot,
                    TapeStreamError::DeviceEot(format!("short write: {} of {} bytes", n, block.len())),
                ))
            }
            Err(WriteFault::Eot) => {
                return Err(BlockFault::EndOfVolume(
                    ErrorKind::DeviceEot,
                    TapeStreamError::DeviceEot("drive reported end of medium".to_string()),
                ))
            }
            Err(WriteFault::Enospc) => {
                return Err(BlockFault::EndOfVolume(
                    ErrorKind::DeviceEnospc,
                    TapeStreamError::DeviceEnospc("drive reported no space left".to_string()),
                ))
            }
            Err(WriteFault::Io(e)) => {
                let c = settings
                    .classifier
                    .classify(&FailureSignal::Io(&e), settings.ctx);
                if c.kind.is_end_of_volume() {
                    return Err(BlockFault::EndOfVolume(c.kind, c.kind.into_error(e.to_string())));
                }
                if c.action == crate::classify::Action::Retry && attempt < settings.device_retries {
                    attempt += 1;
                    warn!(
                        "Block write failed ({}: {}), retry {}/{}",
                        c.kind, e, attempt, settings.device_retries
                    );
                    std::thread::sleep(settings.retry_delay * attempt);
                    continue;
                }
                return Err(BlockFault::Fatal(
                    c.kind.into_error(format!("block write failed after {} retries: {}", attempt, e)),
                ));
            }
        }
    }
}

/// Writer thread body.
///
/// `base` is the archive offset of the first byte this run writes.
pub(crate) fn run_writer(
    mut session: DeviceSession,
    mut source: Box<dyn BlockSource>,
    mut committer: Committer,
    base: u64,
    settings: WriterSettings,
) -> WriterReport {
    let block_size = session.block_size() as usize;
    let mut acked: u64 = 0;

    let end = loop {
        match source.next_block() {
            Ok(Some(mut block)) => {
                let len = block.len();
                if len < block_size {
                    block.resize(block_size, 0);
                }

                match write_block(session.handle(), &block, &settings) {
                    Ok(()) => {
                        acked += len as u64;
                        committer.advance(base + acked);
                        if let Some(tx) = &settings.events {
                            let _ = tx.send(JobEvent::BytesWritten(len as u64));
                        }
                    }
                    Err(BlockFault::EndOfVolume(kind, err)) => {
                        info!("{} after {} bytes on this volume", kind, acked);
                        // boundaries sent before the refused block are final
                        committer.advance(base + acked);
                        source.abort("end of volume");
                        break WriterEnd::EndOfVolume(kind, err);
                    }
                    Err(BlockFault::Fatal(err)) => {
                        error!("Tape write failed: {}", err);
                        source.abort("tape write failed");
                        break WriterEnd::Failed(err);
                    }
                }
            }
            Ok(None) => {
                committer.advance(base + acked);
                break WriterEnd::Drained;
            }
            Err(e) => {
                if source.aborted_by_peer() {
                    break WriterEnd::PeerAborted;
                }
                warn!("Writer stopped: {}", e);
                source.abort("writer stopped");
                break WriterEnd::Failed(e);
            }
        }
    };

    WriterReport {
        session,
        end,
        bytes_written: acked,
        records: committer.records,
        skipped: committer.skipped,
        next_file: committer.next_file,
        archive_position: base + acked,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boundary(index: usize, start: u64, end: u64) -> Boundary {
        Boundary {
            index,
            name: format!("f{}", index),
            header_offset: start,
            end_offset: end,
            size: end - start - 512,
            checksum: None,
            skipped: false,
        }
    }

    #[test]
    fn test_committer_only_commits_fully_acknowledged_entries() {
        let mut committer = Committer::new(
            "r1",
            vec![boundary(0, 0, 1536), boundary(1, 1536, 4096)],
            None,
            vec![("VOL001".into(), 0)],
            0,
            None,
        );

        committer.advance(1024);
        assert!(committer.records.is_empty());
        committer.advance(2048);
        assert_eq!(committer.records.len(), 1);
        assert_eq!(committer.next_file, 1);
        committer.advance(4096);
        assert_eq!(committer.records.len(), 2);
        assert_eq!(committer.next_file, 2);
    }

    #[test]
    fn test_committer_attributes_straddling_entry_to_header_volume() {
        let mut committer = Committer::new(
            "r1",
            vec![boundary(3, 900, 5000), boundary(4, 5000, 6000)],
            None,
            vec![("VOL001".into(), 0), ("VOL002".into(), 4096)],
            3,
            None,
        );
        committer.advance(6000);

        assert_eq!(committer.records[0].volume_id, "VOL001");
        assert_eq!(committer.records[0].offset, 900);
        assert_eq!(committer.records[1].volume_id, "VOL002");
        assert_eq!(committer.records[1].offset, 904);
        assert_eq!(committer.records[1].archive_offset, 5000);
    }

    #[test]
    fn test_late_boundary_commits_at_end_of_volume() {
        let dir = tempfile::tempdir().unwrap();
        let library = crate::device::memory::MemoryLibrary::new(1, 1024);
        library.insert(1);
        let session = DeviceSession::open(
            library.driver(),
            Path::new("/dev/nst0"),
            512,
            dir.path(),
        )
        .unwrap();

        let (tx, rx) = crossbeam::channel::unbounded();
        struct Scripted {
            blocks: VecDeque<Vec<u8>>,
            tx: Option<crossbeam::channel::Sender<Boundary>>,
        }
        impl BlockSource for Scripted {
            fn next_block(&mut self) -> Result<Option<Vec<u8>>> {
                // the entry's boundary shows up only after its data went out
                if self.blocks.len() == 1 {
                    if let Some(tx) = self.tx.take() {
                        tx.send(boundary(0, 0, 1024)).unwrap();
                    }
                }
                Ok(self.blocks.pop_front())
            }
            fn abort(&self, _: &str) {}
            fn aborted_by_peer(&self) -> bool {
                false
            }
        }
        let source = Scripted {
            blocks: vec![vec![1u8; 512], vec![2u8; 512], vec![0u8; 512]].into(),
            tx: Some(tx),
        };
        let committer = Committer::new("r1", Vec::new(), Some(rx), vec![("VOL001".into(), 0)], 0, None);
        let settings = WriterSettings {
            device_retries: 0,
            retry_delay: Duration::from_millis(1),
            classifier: Arc::new(ErrorClassifier::new()),
            ctx: ClassifyContext::default(),
            events: None,
        };

        let report = run_writer(session, Box::new(source), committer, 0, settings);
        assert!(matches!(report.end, WriterEnd::EndOfVolume(ErrorKind::DeviceEot, _)));
        assert_eq!(report.bytes_written, 1024);
        assert_eq!(report.records.len(), 1);
        assert_eq!(report.next_file, 1);
    }

    #[test]
    fn test_skipped_entries_advance_resume_point() {
        let (tx, rx) = crossbeam::channel::unbounded();
        let mut committer =
            Committer::new("r1", Vec::new(), Some(rx), vec![("VOL001".into(), 0)], 0, None);

        let mut skipped = boundary(0, 0, 512);
        skipped.end_offset = 0;
        skipped.skipped = true;
        tx.send(skipped).unwrap();
        tx.send(boundary(1, 0, 1024)).unwrap();

        committer.advance(0);
        assert_eq!(committer.skipped, vec!["f0".to_string()]);
        assert_eq!(committer.next_file, 1);
        committer.advance(1024);
        assert_eq!(committer.records.len(), 1);
    }
}
