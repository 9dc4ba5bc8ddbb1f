//! Staged strategies: build the archive in the staging directory, then move
//! it to tape.
//!
//! The staged archive is one stream for the whole job. When a volume fills
//! up the next run continues at the first unacknowledged byte, so an entry
//! may straddle volumes and a restore reads the volumes back as one chain.

use super::archive::{append_entry, EntryError, StagingWriter, CountingWriter};
use super::writer::{run_writer, BlockSource, Boundary, BufferSource, Committer, FileSource};
use super::{
    JobEvent, PipelineHandle, PipelineOutcome, ProducerReport, ResumePoint, Strategy, Transfer,
    TransferSettings,
};
use crate::classify::FailureSignal;
use crate::device::DeviceSession;
use crate::error::{Result, TapeStreamError};
use crate::flow::ElasticBuffer;
use crate::snapshot::SourceEntry;
use crate::utils::format_bytes;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

const STAGE_CHUNK_BLOCKS: usize = 16;

/// A finished archive in the staging directory.
#[derive(Debug)]
pub struct StagedArchive {
    pub path: PathBuf,
    pub len: u64,
    boundaries: Vec<Boundary>,
}

impl StagedArchive {
    /// Write every entry into `<staging_dir>/<label>-<run_id>.tar`.
    ///
    /// Any unreadable source aborts staging: the archive is not file-level
    /// resumable, so there is no way to leave a file out later.
    pub fn build(entries: &[SourceEntry], settings: &TransferSettings, strategy: Strategy) -> Result<Self> {
        fs::create_dir_all(&settings.staging_dir)?;
        let path = settings
            .staging_dir
            .join(format!("{}-{}.tar", settings.label, settings.run_id));
        info!("Staging {} entries into {:?}", entries.len(), path);
        settings.emit(JobEvent::Staging {
            files: entries.len(),
            bytes: entries.iter().map(|e| e.size).sum(),
        });

        let result = Self::write(&path, entries, settings, strategy);
        if result.is_err() {
            let _ = fs::remove_file(&path);
        }
        result
    }

    fn write(
        path: &Path,
        entries: &[SourceEntry],
        settings: &TransferSettings,
        strategy: Strategy,
    ) -> Result<Self> {
        let writer: StagingWriter = CountingWriter::new(BufWriter::new(File::create(path)?));
        let mut builder = tar::Builder::new(writer);
        let ctx = settings.classify_context(strategy);
        let mut boundaries = Vec::with_capacity(entries.len());

        for (index, entry) in entries.iter().enumerate() {
            if settings.cancelled() {
                return Err(TapeStreamError::cancelled("staging interrupted"));
            }

            match append_entry(&mut builder, entry, settings.checksum) {
                Ok(appended) => boundaries.push(Boundary {
                    index,
                    name: entry.name.clone(),
                    header_offset: appended.header_offset,
                    end_offset: appended.end_offset,
                    size: appended.size,
                    checksum: appended.checksum,
                    skipped: false,
                }),
                Err(EntryError::Source(e)) => {
                    let c = settings.classifier.classify(&FailureSignal::Io(&e), ctx);
                    return Err(c.kind.into_error(format!("{}: {}", entry.path.display(), e)));
                }
                Err(EntryError::Stream(e)) => {
                    return Err(TapeStreamError::producer(format!(
                        "Cannot write staged archive {:?}: {}",
                        path, e
                    )))
                }
            }
        }

        builder.finish()?;
        let mut file = builder
            .into_inner()?
            .into_inner()
            .into_inner()
            .map_err(|e| TapeStreamError::Io(e.into_error()))?;
        file.flush()?;
        file.sync_all()?;
        let len = file.metadata()?.len();

        info!("Staged archive ready: {}", format_bytes(len));
        Ok(Self {
            path: path.to_path_buf(),
            len,
            boundaries,
        })
    }
}

/// Reader thread feeding a staged archive into the elastic buffer.
fn feed(
    path: &Path,
    offset: u64,
    buffer: &Arc<ElasticBuffer>,
    chunk: usize,
    settings: &TransferSettings,
    stopped: &AtomicBool,
) -> Result<ProducerReport> {
    let mut report = ProducerReport::default();
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut data = vec![0u8; chunk];

    loop {
        if settings.cancelled() {
            info!("Cancellation requested, stopping staged stream");
            stopped.store(true, Ordering::SeqCst);
            report.stopped_for_cancel = true;
            break;
        }

        let n = match file.read(&mut data) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                let err = TapeStreamError::producer(format!("Cannot read {:?}: {}", path, e));
                buffer.abort(err.to_string());
                return Err(err);
            }
        };
        if buffer.push(&data[..n]).is_err() {
            // writer stopped first
            return Ok(report);
        }
    }

    buffer.close();
    Ok(report)
}

pub struct StagedTransfer {
    strategy: Strategy,
    entries: Vec<SourceEntry>,
    settings: TransferSettings,
    archive: Option<StagedArchive>,
    spans: Vec<(String, u64)>,
}

impl StagedTransfer {
    pub fn new(strategy: Strategy, entries: Vec<SourceEntry>, settings: TransferSettings) -> Self {
        Self {
            strategy,
            entries,
            settings,
            archive: None,
            spans: Vec::new(),
        }
    }

    fn prepare(&mut self) -> Result<&StagedArchive> {
        if self.archive.is_none() {
            self.archive = Some(StagedArchive::build(&self.entries, &self.settings, self.strategy)?);
        }
        self.archive
            .as_ref()
            .ok_or_else(|| TapeStreamError::state_transition("staged archive missing"))
    }
}

impl Transfer for StagedTransfer {
    fn strategy(&self) -> Strategy {
        self.strategy
    }

    fn start(
        &mut self,
        session: DeviceSession,
        volume_id: &str,
        from: ResumePoint,
    ) -> Result<PipelineHandle> {
        let offset = match from {
            ResumePoint::Start => 0,
            ResumePoint::ByteOffset(offset) => offset,
            ResumePoint::File(_) => {
                return Err(TapeStreamError::state_transition(format!(
                    "{} transfers resume at byte offsets only",
                    self.strategy
                )))
            }
        };

        let strategy = self.strategy;
        let settings = self.settings.clone();
        let archive = self.prepare()?;
        let path = archive.path.clone();
        let pending: Vec<Boundary> = archive
            .boundaries
            .iter()
            .filter(|b| b.end_offset > offset)
            .cloned()
            .collect();
        let next_file = pending.first().map_or(archive.boundaries.len(), |b| b.index);
        let remaining = archive.len.saturating_sub(offset);

        self.spans.push((volume_id.to_string(), offset));
        info!(
            "{} transfer to {}: {} remaining from offset {}",
            strategy,
            volume_id,
            format_bytes(remaining),
            offset
        );
        settings.emit(JobEvent::VolumeStarted {
            volume_id: volume_id.to_string(),
        });

        let committer = Committer::new(
            &settings.run_id,
            pending,
            None,
            self.spans.clone(),
            next_file,
            settings.events.clone(),
        );
        let writer_settings = settings.writer_settings(strategy);
        let block_size = session.block_size() as usize;
        let stopped = Arc::new(AtomicBool::new(false));

        match strategy {
            Strategy::Raw => {
                let source: Box<dyn BlockSource> = Box::new(FileSource::open(
                    &path,
                    offset,
                    block_size,
                    settings.cancel.clone(),
                    stopped.clone(),
                )?);
                let writer = thread::Builder::new()
                    .name("tape-writer".into())
                    .spawn(move || run_writer(session, source, committer, offset, writer_settings))?;
                Ok(PipelineHandle::new(volume_id, offset, None, writer, None, stopped))
            }
            _ => {
                let mut flow = settings.flow.clone();
                flow.block_size = block_size;
                let buffer = ElasticBuffer::new(&flow)?;

                let producer = {
                    let buffer = buffer.clone();
                    let stopped = stopped.clone();
                    let path = path.clone();
                    thread::Builder::new()
                        .name("stage-reader".into())
                        .spawn(move || {
                            feed(
                                &path,
                                offset,
                                &buffer,
                                block_size * STAGE_CHUNK_BLOCKS,
                                &settings,
                                &stopped,
                            )
                        })?
                };
                let writer = {
                    let source = Box::new(BufferSource(buffer.clone()));
                    thread::Builder::new()
                        .name("tape-writer".into())
                        .spawn(move || run_writer(session, source, committer, offset, writer_settings))?
                };
                Ok(PipelineHandle::new(
                    volume_id,
                    offset,
                    Some(producer),
                    writer,
                    Some(buffer),
                    stopped,
                ))
            }
        }
    }

    fn resume_at(&self, outcome: &PipelineOutcome) -> ResumePoint {
        ResumePoint::ByteOffset(outcome.archive_position)
    }

    fn finish(&mut self, success: bool) -> Result<()> {
        let Some(archive) = self.archive.take() else {
            return Ok(());
        };
        if success {
            debug!("Removing staged archive {:?}", archive.path);
            fs::remove_file(&archive.path)?;
        } else {
            warn!("Keeping staged archive {:?} after an unsuccessful run", archive.path);
        }
        Ok(())
    }
}
