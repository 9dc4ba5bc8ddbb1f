//! Direct strategy: tar stream built on the fly into the elastic buffer.
//!
//! Every volume receives its own complete tar stream, so a volume can be
//! read on its own. After an end of volume the next run starts at the first
//! file that was not committed.

use super::archive::{append_entry, EntryError};
use super::writer::{run_writer, Boundary, BufferSource, Committer};
use super::{
    JobEvent, PipelineHandle, PipelineOutcome, ProducerReport, ResumePoint, Strategy, Transfer,
    TransferSettings,
};
use crate::classify::{Action, FailureSignal};
use crate::device::DeviceSession;
use crate::error::{Result, TapeStreamError};
use crate::flow::{BufferWriter, ElasticBuffer};
use crate::snapshot::SourceEntry;
use crossbeam::channel::{unbounded, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{info, warn};

pub struct DirectTransfer {
    entries: Arc<Vec<SourceEntry>>,
    settings: TransferSettings,
}

impl DirectTransfer {
    pub fn new(entries: Vec<SourceEntry>, settings: TransferSettings) -> Self {
        Self {
            entries: Arc::new(entries),
            settings,
        }
    }
}

fn produce(
    entries: &[SourceEntry],
    start: usize,
    buffer: &Arc<ElasticBuffer>,
    boundaries: &Sender<Boundary>,
    settings: &TransferSettings,
    stopped: &AtomicBool,
) -> Result<ProducerReport> {
    let mut builder = tar::Builder::new(BufferWriter::new(buffer.clone()));
    let mut report = ProducerReport::default();
    let ctx = settings.classify_context(Strategy::Direct);

    for (index, entry) in entries.iter().enumerate().skip(start) {
        if settings.cancelled() {
            info!("Cancellation requested, closing the archive before {}", entry.name);
            stopped.store(true, Ordering::SeqCst);
            report.stopped_for_cancel = true;
            break;
        }

        match append_entry(&mut builder, entry, settings.checksum) {
            Ok(appended) => {
                let _ = boundaries.send(Boundary {
                    index,
                    name: entry.name.clone(),
                    header_offset: appended.header_offset,
                    end_offset: appended.end_offset,
                    size: appended.size,
                    checksum: appended.checksum,
                    skipped: false,
                });
            }
            Err(EntryError::Source(e)) => {
                let c = settings.classifier.classify(&FailureSignal::Io(&e), ctx);
                if c.action != Action::SkipFile {
                    let err = TapeStreamError::producer(format!("{}: {}", entry.path.display(), e));
                    buffer.abort(err.to_string());
                    return Err(err);
                }

                warn!("Skipping {}: {}", entry.path.display(), e);
                settings.emit(JobEvent::FileSkipped {
                    path: entry.name.clone(),
                    reason: e.to_string(),
                });
                let at = builder.get_ref().position();
                let _ = boundaries.send(Boundary {
                    index,
                    name: entry.name.clone(),
                    header_offset: at,
                    end_offset: at,
                    size: 0,
                    checksum: None,
                    skipped: true,
                });
            }
            Err(EntryError::Stream(e)) => {
                if buffer.is_aborted() {
                    // the writer stopped first and owns the outcome
                    return Ok(report);
                }
                let err = TapeStreamError::producer(format!("{}: {}", entry.path.display(), e));
                buffer.abort(err.to_string());
                return Err(err);
            }
        }
    }

    if let Err(e) = builder.finish() {
        if buffer.is_aborted() {
            return Ok(report);
        }
        let err = TapeStreamError::producer(format!("Cannot finish archive: {}", e));
        buffer.abort(err.to_string());
        return Err(err);
    }
    buffer.close();
    Ok(report)
}

impl Transfer for DirectTransfer {
    fn strategy(&self) -> Strategy {
        Strategy::Direct
    }

    fn start(
        &mut self,
        session: DeviceSession,
        volume_id: &str,
        from: ResumePoint,
    ) -> Result<PipelineHandle> {
        let start = match from {
            ResumePoint::Start => 0,
            ResumePoint::File(index) => index,
            ResumePoint::ByteOffset(_) => {
                return Err(TapeStreamError::state_transition(
                    "direct transfers resume at file boundaries only",
                ))
            }
        };

        let mut flow = self.settings.flow.clone();
        flow.block_size = session.block_size() as usize;
        let buffer = ElasticBuffer::new(&flow)?;
        let (tx, rx) = unbounded();
        let stopped = Arc::new(AtomicBool::new(false));

        info!(
            "Direct transfer of {} entries to {} starting at entry {}",
            self.entries.len() - start.min(self.entries.len()),
            volume_id,
            start
        );
        self.settings.emit(JobEvent::VolumeStarted {
            volume_id: volume_id.to_string(),
        });

        let producer = {
            let entries = self.entries.clone();
            let buffer = buffer.clone();
            let settings = self.settings.clone();
            let stopped = stopped.clone();
            thread::Builder::new()
                .name("archive-producer".into())
                .spawn(move || produce(&entries, start, &buffer, &tx, &settings, &stopped))?
        };

        let committer = Committer::new(
            &self.settings.run_id,
            Vec::new(),
            Some(rx),
            vec![(volume_id.to_string(), 0)],
            start,
            self.settings.events.clone(),
        );
        let writer = {
            let source = Box::new(BufferSource(buffer.clone()));
            let writer_settings = self.settings.writer_settings(Strategy::Direct);
            thread::Builder::new()
                .name("tape-writer".into())
                .spawn(move || run_writer(session, source, committer, 0, writer_settings))?
        };

        Ok(PipelineHandle::new(
            volume_id,
            0,
            Some(producer),
            writer,
            Some(buffer),
            stopped,
        ))
    }

    fn resume_at(&self, outcome: &PipelineOutcome) -> ResumePoint {
        ResumePoint::File(outcome.next_file)
    }
}
