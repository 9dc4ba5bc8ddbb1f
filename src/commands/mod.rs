//! Command Handlers Module
//!
//! This module contains handlers for all CLI subcommands plus the pieces
//! they share: configuration overrides, the stdin operator and progress
//! display.

pub mod backup;
pub mod restore;

use crate::cli::JobArgs;
use crate::config::{Config, DriveConfig};
use crate::device::{Autoloader, MtxChanger, StDriver};
use crate::error::{Result, TapeStreamError};
use crate::flow::SystemMemory;
use crate::orchestrator::{JobEnvironment, Orchestrator};
use crate::pipeline::JobEvent;
use crate::snapshot::ManifestStore;
use crate::utils::{format_bytes, truncate_string};
use crate::volume::{Operator, OperatorReply, SpanningManager};
use crossbeam::channel::{unbounded, Receiver};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info};

/// Options that apply to every subcommand.
#[derive(Debug, Clone, Default)]
pub struct GlobalOpts {
    pub config: Option<PathBuf>,
    pub drive: Option<String>,
    pub device: Option<PathBuf>,
}

/// Configuration with the command line applied on top.
pub(crate) struct JobSetup {
    pub config: Config,
    pub drive: DriveConfig,
}

impl JobSetup {
    pub fn load(globals: &GlobalOpts, job: &JobArgs) -> Result<Self> {
        let mut config = Config::load(globals.config.as_deref())?;

        if let Some(gb) = job.memory_buffer {
            config.buffer.memory_buffer_gb = gb;
        }
        if let Some(pct) = job.memory_buffer_percent {
            config.buffer.low_watermark_pct = pct;
        }
        if let Some(pct) = job.high_watermark {
            config.buffer.high_watermark_pct = pct;
        }
        config.validate()?;

        let mut drive = config.drive(globals.drive.as_deref())?.clone();
        if let Some(device) = &globals.device {
            drive.device_path = device.clone();
        }
        debug!("Using drive {} at {:?}", drive.name, drive.device_path);

        Ok(Self { config, drive })
    }

    /// Assemble the orchestrator. Job events go to the returned receiver.
    pub fn orchestrator(
        &self,
        label: &str,
        cancel: Arc<AtomicBool>,
        operator: Box<dyn Operator>,
    ) -> Result<(Orchestrator, Receiver<JobEvent>)> {
        let flow = self.config.buffer.flow_config(self.drive.block_size)?;
        let (tx, rx) = unbounded();

        let env = JobEnvironment {
            device_path: self.drive.device_path.clone(),
            block_size: self.drive.block_size,
            driver: Arc::new(StDriver),
            lock_dir: self.config.lock_dir.clone(),
            staging_dir: self.config.staging_dir.clone(),
            store: Arc::new(ManifestStore::new(&self.config.snapshot_dir)),
            flow,
            safe_memory_fraction: self.config.buffer.safe_memory_fraction,
            memory: Box::new(SystemMemory),
            device_retries: self.config.device_retries,
            retry_delay: Duration::from_secs(2),
            cancel,
            events: Some(tx),
        };

        let autoloader: Option<Box<dyn Autoloader>> = self.drive.changer.as_ref().map(|c| {
            info!("Using media changer {:?}", c);
            Box::new(MtxChanger::new(c.clone(), self.drive.drive_index)) as Box<dyn Autoloader>
        });
        let spanning = SpanningManager::new(
            label,
            self.config.pool_for(&self.drive),
            autoloader,
            operator,
        );

        Ok((Orchestrator::new(env, spanning), rx))
    }
}

/// Asks for cartridges on the terminal.
pub struct StdinOperator {
    progress: Option<ProgressBar>,
}

impl StdinOperator {
    pub fn new(progress: Option<ProgressBar>) -> Self {
        Self { progress }
    }

    fn prompt(&self, message: &str) -> Result<OperatorReply> {
        let ask = || -> Result<OperatorReply> {
            println!("{}", message);
            print!("> ");
            io::stdout().flush()?;

            let mut line = String::new();
            if io::stdin().lock().read_line(&mut line)? == 0 {
                // stdin closed, nobody is there to change tapes
                return Ok(OperatorReply::Abort);
            }
            let line = line.trim();
            if line.eq_ignore_ascii_case("abort") {
                Ok(OperatorReply::Abort)
            } else {
                Ok(OperatorReply::Inserted(line.to_string()))
            }
        };

        match &self.progress {
            Some(bar) => bar.suspend(ask),
            None => ask(),
        }
    }
}

impl Operator for StdinOperator {
    fn request_volume(&mut self, job: &str, reason: &str, suggested: &str) -> Result<OperatorReply> {
        self.prompt(&format!(
            "📼 Job {}: {}.\n💡 Insert a fresh cartridge and enter its label (empty for {}), or 'abort'",
            job, reason, suggested
        ))
    }

    fn request_existing(&mut self, volume_id: &str) -> Result<OperatorReply> {
        self.prompt(&format!(
            "📼 Insert volume {} and press Enter, or type 'abort'",
            volume_id
        ))
    }
}

pub(crate) fn progress_bar() -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {bytes} ({binary_bytes_per_sec}) {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    bar.enable_steady_tick(Duration::from_millis(200));
    bar
}

/// Drain job events into the progress bar until every sender is gone.
pub(crate) fn spawn_progress(rx: Receiver<JobEvent>, bar: ProgressBar) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("progress".to_string())
        .spawn(move || {
            for event in rx {
                match event {
                    JobEvent::Staging { files, bytes } => {
                        bar.set_message(format!("staging {} files ({})", files, format_bytes(bytes)));
                    }
                    JobEvent::VolumeStarted { volume_id } => {
                        bar.println(format!("📼 Writing volume {}", volume_id));
                    }
                    JobEvent::BytesWritten(n) => bar.inc(n),
                    JobEvent::FileCommitted { path, .. } => bar.set_message(truncate_string(&path, 60)),
                    JobEvent::FileSkipped { path, reason } => {
                        bar.println(format!("⚠️  Skipped {}: {}", path, reason));
                    }
                    JobEvent::VolumeFull { volume_id } => {
                        bar.println(format!("📼 Volume {} is full", volume_id));
                    }
                    JobEvent::FileRestored { path, size } => {
                        bar.inc(size);
                        bar.set_message(truncate_string(&path, 60));
                    }
                }
            }
            bar.finish_and_clear();
        })
        .map_err(TapeStreamError::from)
}
