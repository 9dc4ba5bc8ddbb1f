//! Job driver.
//!
//! Runs a backup as a sequence of pipeline runs, one per volume, with a
//! volume swap between them, and commits the manifest once the job ends
//! whichever way it ends. Restores read the manifest back and extract from
//! the volume spans that hold the wanted entries.

use crate::classify::{ErrorClassifier, ErrorKind};
use crate::device::{DeviceSession, TapeDriver};
use crate::error::{Result, TapeStreamError};
use crate::flow::{check_capacity, BufferState, FlowConfig, MemorySource};
use crate::pipeline::restore::{restore_segments, RestoreReport, Segment, VolumeMount};
use crate::pipeline::{
    new_transfer, ChecksumType, FileTransferRecord, JobEvent, OutcomeStatus, PipelineOutcome,
    ResumePoint, Strategy, TransferSettings,
};
use crate::snapshot::{diff, scan, Manifest, ManifestEntry, ManifestStore, VolumeSpan};
use crate::utils::format_bytes;
use crate::volume::SpanningManager;
use crossbeam::channel::Sender;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Host-side resources shared by backup and restore.
pub struct JobEnvironment {
    pub device_path: PathBuf,
    pub block_size: u32,
    pub driver: Arc<dyn TapeDriver>,
    pub lock_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub store: Arc<ManifestStore>,
    pub flow: FlowConfig,
    pub safe_memory_fraction: f64,
    pub memory: Box<dyn MemorySource + Send>,
    pub device_retries: u32,
    pub retry_delay: Duration,
    pub cancel: Arc<AtomicBool>,
    pub events: Option<Sender<JobEvent>>,
}

impl JobEnvironment {
    fn emit(&self, event: JobEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn open_session(&self) -> Result<DeviceSession> {
        DeviceSession::open(
            self.driver.clone(),
            &self.device_path,
            self.block_size,
            &self.lock_dir,
        )
    }
}

#[derive(Debug, Clone)]
pub struct BackupRequest {
    pub label: String,
    pub job: Option<String>,
    pub sources: Vec<PathBuf>,
    pub strategy: Strategy,
    pub incremental: bool,
    /// Treat a corrupt prior manifest as absent instead of failing.
    pub fallback_full: bool,
    pub checksum: ChecksumType,
    pub skip_unreadable: bool,
}

#[derive(Debug)]
pub struct BackupSummary {
    pub run_id: String,
    pub files_committed: usize,
    pub files_unchanged: usize,
    pub bytes_written: u64,
    pub volumes: Vec<String>,
    pub skipped: Vec<String>,
    pub manifest_path: Option<PathBuf>,
    pub buffer: Option<BufferState>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct RestoreRequest {
    pub label: String,
    pub job: Option<String>,
    pub target: PathBuf,
    /// Restore only entries whose manifest key starts with this prefix.
    pub only: Option<String>,
}

enum JobEnd {
    Completed,
    Failed(TapeStreamError),
}

pub struct Orchestrator {
    env: JobEnvironment,
    spanning: SpanningManager,
}

impl Orchestrator {
    pub fn new(env: JobEnvironment, spanning: SpanningManager) -> Self {
        Self { env, spanning }
    }

    pub fn spanning(&self) -> &SpanningManager {
        &self.spanning
    }

    fn load_prior(&self, request: &BackupRequest) -> Result<Option<Manifest>> {
        if !request.incremental {
            return Ok(None);
        }
        match self.env.store.load(&request.label, request.job.as_deref()) {
            Ok(Some(m)) => Ok(Some(m)),
            Ok(None) => {
                info!("No prior manifest for '{}', running a full backup", request.label);
                Ok(None)
            }
            Err(TapeStreamError::SnapshotCorrupt(msg)) if request.fallback_full => {
                warn!("Prior manifest is corrupt ({}), falling back to a full backup", msg);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn tape_file(session: &mut DeviceSession) -> u64 {
        match session.handle().position_info() {
            Ok(info) => info.file_number,
            Err(e) => {
                warn!("Cannot read tape position, assuming file 0: {}", e);
                0
            }
        }
    }

    fn span_of(
        run_id: &str,
        strategy: Strategy,
        sequence: u32,
        tape_file: u64,
        outcome: &PipelineOutcome,
    ) -> VolumeSpan {
        let on_volume: Vec<&FileTransferRecord> = outcome
            .records
            .iter()
            .filter(|r| r.volume_id == outcome.volume_id)
            .collect();
        VolumeSpan {
            run_id: run_id.to_string(),
            strategy,
            sequence,
            volume_id: outcome.volume_id.clone(),
            tape_file,
            first_path: on_volume.first().map(|r| r.path.clone()),
            last_path: on_volume.last().map(|r| r.path.clone()),
            files: on_volume.len() as u64,
            archive_offset: outcome.span_start,
            bytes: outcome.bytes_written,
        }
    }

    /// Run a backup job.
    ///
    /// On any failure after the source scan the manifest is still committed
    /// with whatever reached tape, then the error is returned.
    pub fn backup(&mut self, request: &BackupRequest) -> Result<BackupSummary> {
        let started = Instant::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        info!(
            "Backup '{}' ({}, {}) run {}",
            request.label,
            request.strategy,
            if request.incremental { "incremental" } else { "full" },
            run_id
        );

        let prior = self.load_prior(request)?;
        let tree = scan(&request.sources)?;
        let changes = diff(&tree, prior.as_ref());
        info!(
            "{} entries ({}) to transfer, {} unchanged",
            changes.to_transfer.len(),
            format_bytes(changes.transfer_bytes()),
            changes.unchanged.len()
        );

        if request.strategy != Strategy::Raw {
            check_capacity(
                self.env.flow.capacity as u64,
                self.env.safe_memory_fraction,
                self.env.memory.as_ref(),
            )?;
        }

        // cartridges holding other backups are never handed out as fresh media
        let in_use = self.env.store.volumes_in_use()?;
        self.spanning.protect_written(&in_use);

        let names: Vec<String> = changes.to_transfer.iter().map(|e| e.name.clone()).collect();
        let settings = TransferSettings {
            run_id: run_id.clone(),
            label: request.label.clone(),
            flow: self.env.flow.clone(),
            checksum: request.checksum,
            skip_unreadable: request.skip_unreadable,
            device_retries: self.env.device_retries,
            retry_delay: self.env.retry_delay,
            staging_dir: self.env.staging_dir.clone(),
            cancel: self.env.cancel.clone(),
            events: self.env.events.clone(),
            classifier: Arc::new(ErrorClassifier::new()),
        };

        let mut session = self.env.open_session()?;
        let first = self.spanning.identify_loaded()?;
        self.spanning.begin(&first)?;
        let mut volume_id = first;
        let mut tape_file = Self::tape_file(&mut session);

        let mut transfer = new_transfer(request.strategy, changes.to_transfer, settings);
        let mut records: Vec<FileTransferRecord> = Vec::new();
        let mut spans: Vec<VolumeSpan> = Vec::new();
        let mut skipped: Vec<String> = Vec::new();
        let mut bytes_written = 0u64;
        let mut buffer = None;
        let mut resume = ResumePoint::Start;

        let end = loop {
            let handle = match transfer.start(session, &volume_id, resume) {
                Ok(h) => h,
                Err(e) => {
                    self.spanning.fail(false);
                    break JobEnd::Failed(e);
                }
            };
            let (outcome, returned) = match handle.wait() {
                Ok(r) => r,
                Err(e) => {
                    self.spanning.fail(false);
                    break JobEnd::Failed(e);
                }
            };
            session = returned;

            let sequence = spans.len() as u32;
            spans.push(Self::span_of(&run_id, request.strategy, sequence, tape_file, &outcome));
            self.spanning.record_usage(outcome.bytes_written);
            bytes_written += outcome.bytes_written;
            records.extend(outcome.records.iter().cloned());
            skipped.extend(outcome.skipped.iter().cloned());
            buffer = outcome.buffer.clone();

            match outcome.status {
                OutcomeStatus::Completed => {
                    if let Err(e) = self.spanning.complete() {
                        break JobEnd::Failed(e);
                    }
                    break JobEnd::Completed;
                }
                OutcomeStatus::Cancelled => {
                    self.spanning.fail(false);
                    break JobEnd::Failed(TapeStreamError::cancelled(format!(
                        "backup '{}' stopped after {} files",
                        request.label,
                        records.len()
                    )));
                }
                OutcomeStatus::Failed(kind) => {
                    self.spanning.fail(kind == ErrorKind::DeviceIo);
                    let err = outcome
                        .last_error
                        .unwrap_or_else(|| kind.into_error("pipeline failed"));
                    break JobEnd::Failed(err);
                }
                OutcomeStatus::EndOfVolume(kind) if outcome.next_file >= names.len() => {
                    // only the archive trailer was left; every entry is on tape
                    info!(
                        "Volume {} filled after the last entry was committed",
                        volume_id
                    );
                    self.env.emit(JobEvent::VolumeFull {
                        volume_id: volume_id.clone(),
                    });
                    let finished = self
                        .spanning
                        .end_of_volume(kind)
                        .and_then(|()| self.spanning.complete());
                    match finished {
                        Ok(()) => break JobEnd::Completed,
                        Err(e) => {
                            self.spanning.fail(false);
                            break JobEnd::Failed(e);
                        }
                    }
                }
                OutcomeStatus::EndOfVolume(kind) => {
                    if outcome.bytes_written == 0 {
                        self.spanning.fail(true);
                        break JobEnd::Failed(TapeStreamError::tape_device(format!(
                            "volume {} accepted no data",
                            volume_id
                        )));
                    }
                    if request.strategy.is_file_level()
                        && sequence > 0
                        && outcome.files_committed == 0
                        && outcome.skipped.is_empty()
                    {
                        self.spanning.fail(false);
                        let name = names.get(outcome.next_file).cloned().unwrap_or_default();
                        break JobEnd::Failed(TapeStreamError::producer(format!(
                            "{} does not fit on a single volume; use the tar or dd strategy",
                            name
                        )));
                    }

                    self.env.emit(JobEvent::VolumeFull {
                        volume_id: volume_id.clone(),
                    });
                    if let Err(e) = self.spanning.end_of_volume(kind) {
                        self.spanning.fail(false);
                        break JobEnd::Failed(e);
                    }
                    match self.spanning.swap(&mut session) {
                        Ok(next) => {
                            volume_id = next;
                            tape_file = Self::tape_file(&mut session);
                            resume = transfer.resume_at(&outcome);
                            debug!("Resuming at {:?} on {}", resume, volume_id);
                        }
                        Err(e) => {
                            self.spanning.fail(false);
                            break JobEnd::Failed(e);
                        }
                    }
                }
            }
        };

        let success = matches!(end, JobEnd::Completed);
        if let Err(e) = transfer.finish(success) {
            warn!("Cleanup after backup failed: {}", e);
        }

        // nothing reached tape on a failed run: keep the previous manifest
        let manifest_path = if success || !records.is_empty() {
            let manifest = Manifest::new(&request.label, request.job.as_deref(), request.strategy)
                .assemble(&tree, prior.as_ref(), &records, spans);
            Some(self.env.store.save(&manifest)?)
        } else {
            None
        };

        match end {
            JobEnd::Completed => {
                let summary = BackupSummary {
                    run_id,
                    files_committed: records.len(),
                    files_unchanged: changes.unchanged.len(),
                    bytes_written,
                    volumes: self.spanning.used_volumes().to_vec(),
                    skipped,
                    manifest_path,
                    buffer,
                    elapsed: started.elapsed(),
                };
                info!(
                    "Backup '{}' complete: {} files, {} bytes on {} volume(s)",
                    request.label,
                    summary.files_committed,
                    summary.bytes_written,
                    summary.volumes.len()
                );
                Ok(summary)
            }
            JobEnd::Failed(e) => {
                error!(
                    "Backup '{}' ended early after {} committed files: {}",
                    request.label,
                    records.len(),
                    e
                );
                Err(e)
            }
        }
    }

    /// Restore entries of a label's manifest into `request.target`.
    pub fn restore(&mut self, request: &RestoreRequest) -> Result<RestoreReport> {
        let manifest = self
            .env
            .store
            .load(&request.label, request.job.as_deref())?
            .ok_or_else(|| {
                TapeStreamError::config(format!("No manifest for label '{}'", request.label))
            })?;

        let prefix = request
            .only
            .as_deref()
            .map(|p| p.trim_start_matches('/').to_string());
        let wanted: BTreeMap<String, ManifestEntry> = manifest
            .files
            .iter()
            .filter(|(name, _)| prefix.as_deref().map_or(true, |p| name.starts_with(p)))
            .map(|(name, entry)| (name.clone(), entry.clone()))
            .collect();
        info!(
            "Restoring {} of {} entries of '{}' into {:?}",
            wanted.len(),
            manifest.files.len(),
            request.label,
            request.target
        );

        let mut flow = self.env.flow.clone();
        flow.block_size = self.env.block_size as usize;
        // the reader may wait on a media change for as long as the operator needs
        flow.max_stall = Duration::MAX;
        check_capacity(
            flow.capacity as u64,
            self.env.safe_memory_fraction,
            self.env.memory.as_ref(),
        )?;

        std::fs::create_dir_all(&request.target)?;
        let mut session = self.env.open_session()?;
        let mut report = RestoreReport::default();

        // group by run, oldest run first as listed in the manifest
        let mut runs: Vec<&str> = Vec::new();
        for span in &manifest.volumes {
            if !runs.contains(&span.run_id.as_str()) {
                runs.push(span.run_id.as_str());
            }
        }

        let mut batches: Vec<(Vec<Segment>, BTreeMap<String, ManifestEntry>)> = Vec::new();
        for run in runs {
            let spans = manifest.spans_of(run);
            let in_run: BTreeMap<String, ManifestEntry> = wanted
                .iter()
                .filter(|(_, e)| e.run_id == run)
                .map(|(n, e)| (n.clone(), e.clone()))
                .collect();
            if in_run.is_empty() || spans.is_empty() {
                continue;
            }

            if spans[0].strategy.is_file_level() {
                for span in spans {
                    let on_span: BTreeMap<String, ManifestEntry> = in_run
                        .iter()
                        .filter(|(_, e)| e.volume_id == span.volume_id)
                        .map(|(n, e)| (n.clone(), e.clone()))
                        .collect();
                    if !on_span.is_empty() {
                        batches.push((vec![segment_of(span)], on_span));
                    }
                }
            } else {
                batches.push((spans.into_iter().map(segment_of).collect(), in_run));
            }
        }

        if let Some((segments, _)) = batches.first() {
            if !self.spanning.has_autoloader() {
                self.spanning.assume_loaded(&segments[0].volume_id);
            }
        }

        for (segments, entries) in &batches {
            if self.env.cancel.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(TapeStreamError::cancelled("restore interrupted"));
            }
            let mut mount = RestoreMount {
                session: &mut session,
                spanning: &mut self.spanning,
            };
            let part = restore_segments(
                &mut mount,
                segments,
                entries,
                &request.target,
                &flow,
                self.env.events.as_ref(),
            )?;
            report.restored.extend(part.restored);
            report.bytes += part.bytes;
            report.missing.extend(part.missing);
            report.checksum_mismatches.extend(part.checksum_mismatches);
        }

        info!(
            "Restored {} entries ({} bytes), {} missing",
            report.restored.len(),
            report.bytes,
            report.missing.len()
        );
        Ok(report)
    }
}

fn segment_of(span: &VolumeSpan) -> Segment {
    Segment {
        volume_id: span.volume_id.clone(),
        tape_file: span.tape_file,
        bytes: Some(span.bytes),
    }
}

struct RestoreMount<'a> {
    session: &'a mut DeviceSession,
    spanning: &'a mut SpanningManager,
}

impl VolumeMount for RestoreMount<'_> {
    fn mount(&mut self, volume_id: &str) -> Result<&mut DeviceSession> {
        self.spanning.load_for_read(volume_id, &mut *self.session)?;
        Ok(&mut *self.session)
    }
}
