//! Streaming Pipeline
//!
//! Moves archive bytes from the source tree to the drive. Every strategy
//! runs the tape writer on its own thread behind the [`Transfer`] trait:
//!
//! - `Direct` builds the tar stream on the fly into the elastic buffer.
//! - `Prestaged` builds the archive in the staging directory first, then
//!   streams it through the buffer.
//! - `Raw` streams a staged archive with a single writer thread and no
//!   buffer.
//!
//! A file is committed only once the drive acknowledged its last byte.

pub mod archive;
pub mod direct;
pub mod hash;
pub mod restore;
pub mod staged;
pub(crate) mod writer;

use crate::classify::{ClassifyContext, ErrorClassifier, ErrorKind};
use crate::device::DeviceSession;
use crate::error::{Result, TapeStreamError};
use crate::flow::{BufferState, FlowConfig};
use crate::snapshot::SourceEntry;
use clap::ValueEnum;
use crossbeam::channel::Sender;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::debug;

pub use direct::DirectTransfer;
pub use hash::ChecksumType;
pub use staged::StagedTransfer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
pub enum Strategy {
    /// Stream files straight to tape.
    #[serde(rename = "direct")]
    #[value(name = "direct")]
    Direct,
    /// Stage a tar archive on disk, then stream it through the buffer.
    #[serde(rename = "tar")]
    #[value(name = "tar")]
    Prestaged,
    /// Stage a tar archive on disk, then copy it block by block.
    #[serde(rename = "dd")]
    #[value(name = "dd")]
    Raw,
}

impl Strategy {
    /// Whether resume and skip work per file.
    pub fn is_file_level(self) -> bool {
        matches!(self, Strategy::Direct)
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Strategy::Direct => "direct",
            Strategy::Prestaged => "tar",
            Strategy::Raw => "dd",
        };
        f.write_str(name)
    }
}

/// Where the next pipeline run picks up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumePoint {
    Start,
    /// Index into the job's entry list.
    File(usize),
    /// Offset into the staged archive.
    ByteOffset(u64),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTransferRecord {
    pub index: usize,
    pub path: String,
    pub volume_id: String,
    /// Header offset within the volume's archive segment.
    pub offset: u64,
    /// Header offset within the run's archive stream.
    pub archive_offset: u64,
    pub size: u64,
    pub checksum: Option<String>,
    pub run_id: String,
}

/// Progress notifications for the front end.
#[derive(Debug, Clone)]
pub enum JobEvent {
    Staging { files: usize, bytes: u64 },
    VolumeStarted { volume_id: String },
    BytesWritten(u64),
    FileCommitted { path: String, size: u64 },
    FileSkipped { path: String, reason: String },
    VolumeFull { volume_id: String },
    FileRestored { path: String, size: u64 },
}

/// Everything a run needs besides the entry list and the drive.
#[derive(Clone)]
pub struct TransferSettings {
    pub run_id: String,
    pub label: String,
    pub flow: FlowConfig,
    pub checksum: ChecksumType,
    pub skip_unreadable: bool,
    pub device_retries: u32,
    pub retry_delay: Duration,
    pub staging_dir: PathBuf,
    pub cancel: Arc<AtomicBool>,
    pub events: Option<Sender<JobEvent>>,
    pub classifier: Arc<ErrorClassifier>,
}

impl TransferSettings {
    pub(crate) fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub(crate) fn emit(&self, event: JobEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    pub(crate) fn classify_context(&self, strategy: Strategy) -> ClassifyContext {
        ClassifyContext {
            file_level: strategy.is_file_level(),
            skip_unreadable: self.skip_unreadable,
        }
    }

    pub(crate) fn writer_settings(&self, strategy: Strategy) -> writer::WriterSettings {
        writer::WriterSettings {
            device_retries: self.device_retries,
            retry_delay: self.retry_delay,
            classifier: self.classifier.clone(),
            ctx: self.classify_context(strategy),
            events: self.events.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeStatus {
    Completed,
    /// The volume filled up; swap and resume.
    EndOfVolume(ErrorKind),
    Failed(ErrorKind),
    Cancelled,
}

#[derive(Debug)]
pub struct PipelineOutcome {
    pub status: OutcomeStatus,
    pub volume_id: String,
    /// Archive bytes the drive acknowledged during this run, padding excluded.
    pub bytes_written: u64,
    pub files_committed: usize,
    pub records: Vec<FileTransferRecord>,
    pub skipped: Vec<String>,
    pub last_error: Option<TapeStreamError>,
    /// First entry index not yet resolved (file-level strategies).
    pub next_file: usize,
    /// Archive offset just past the last acknowledged byte.
    pub archive_position: u64,
    /// Archive offset this run started at.
    pub span_start: u64,
    pub buffer: Option<BufferState>,
}

/// Producer side result.
#[derive(Debug, Default)]
pub(crate) struct ProducerReport {
    pub stopped_for_cancel: bool,
}

/// A running pipeline.
pub struct PipelineHandle {
    volume_id: String,
    span_start: u64,
    producer: Option<JoinHandle<Result<ProducerReport>>>,
    writer: JoinHandle<writer::WriterReport>,
    buffer: Option<Arc<crate::flow::ElasticBuffer>>,
    stopped: Arc<AtomicBool>,
}

impl PipelineHandle {
    pub(crate) fn new(
        volume_id: &str,
        span_start: u64,
        producer: Option<JoinHandle<Result<ProducerReport>>>,
        writer: JoinHandle<writer::WriterReport>,
        buffer: Option<Arc<crate::flow::ElasticBuffer>>,
        stopped: Arc<AtomicBool>,
    ) -> Self {
        Self {
            volume_id: volume_id.to_string(),
            span_start,
            producer,
            writer,
            buffer,
            stopped,
        }
    }

    /// Join both threads and merge their results. The device session comes
    /// back to the caller for the next run.
    pub fn wait(self) -> Result<(PipelineOutcome, DeviceSession)> {
        let report = self
            .writer
            .join()
            .map_err(|_| TapeStreamError::Generic(anyhow::anyhow!("tape writer thread panicked")))?;

        let producer = match self.producer {
            Some(handle) => Some(handle.join().map_err(|_| {
                TapeStreamError::Generic(anyhow::anyhow!("archive producer thread panicked"))
            })?),
            None => None,
        };

        let (status, last_error) = match report.end {
            writer::WriterEnd::EndOfVolume(kind, err) => {
                (OutcomeStatus::EndOfVolume(kind), Some(err))
            }
            writer::WriterEnd::Failed(err) => {
                let kind = crate::classify::ErrorClassifier::new()
                    .kind_of(&crate::classify::FailureSignal::Error(&err));
                (OutcomeStatus::Failed(kind), Some(err))
            }
            writer::WriterEnd::PeerAborted | writer::WriterEnd::Drained => match producer {
                Some(Err(err)) => {
                    let kind = crate::classify::ErrorClassifier::new()
                        .kind_of(&crate::classify::FailureSignal::Error(&err));
                    (OutcomeStatus::Failed(kind), Some(err))
                }
                Some(Ok(p)) if p.stopped_for_cancel => (OutcomeStatus::Cancelled, None),
                _ if self.stopped.load(Ordering::SeqCst) => (OutcomeStatus::Cancelled, None),
                _ => (OutcomeStatus::Completed, None),
            },
        };

        debug!(
            "Pipeline run on {} ended {:?}: {} bytes, {} files",
            self.volume_id,
            status,
            report.bytes_written,
            report.records.len()
        );

        let outcome = PipelineOutcome {
            status,
            volume_id: self.volume_id,
            bytes_written: report.bytes_written,
            files_committed: report.records.len(),
            records: report.records,
            skipped: report.skipped,
            last_error,
            next_file: report.next_file,
            archive_position: report.archive_position,
            span_start: self.span_start,
            buffer: self.buffer.as_ref().map(|b| b.snapshot()),
        };
        Ok((outcome, report.session))
    }
}

/// One strategy's way of moving the job's entries to tape.
pub trait Transfer: Send {
    fn strategy(&self) -> Strategy;

    /// Start a run on the volume in `session`, beginning at `from`.
    fn start(
        &mut self,
        session: DeviceSession,
        volume_id: &str,
        from: ResumePoint,
    ) -> Result<PipelineHandle>;

    /// Where the run after `outcome` must begin.
    fn resume_at(&self, outcome: &PipelineOutcome) -> ResumePoint;

    /// Release per-job resources once no more runs will start.
    fn finish(&mut self, _success: bool) -> Result<()> {
        Ok(())
    }
}

/// Build the transfer for `strategy`.
pub fn new_transfer(
    strategy: Strategy,
    entries: Vec<SourceEntry>,
    settings: TransferSettings,
) -> Box<dyn Transfer> {
    match strategy {
        Strategy::Direct => Box::new(DirectTransfer::new(entries, settings)),
        Strategy::Prestaged | Strategy::Raw => {
            Box::new(StagedTransfer::new(strategy, entries, settings))
        }
    }
}
