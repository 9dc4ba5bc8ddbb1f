//! Restore Command Handler
//!
//! Handles the `restore` subcommand.

use super::{progress_bar, spawn_progress, GlobalOpts, JobSetup, StdinOperator};
use crate::cli::JobArgs;
use crate::error::Result;
use crate::orchestrator::RestoreRequest;
use crate::utils::{format_bytes, format_duration, format_speed};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

pub fn execute(
    globals: &GlobalOpts,
    target: PathBuf,
    job: JobArgs,
    only: Option<String>,
    cancel: Arc<AtomicBool>,
) -> Result<()> {
    info!("Starting restore of '{}' into {:?}", job.label, target);
    let started = Instant::now();

    let setup = JobSetup::load(globals, &job)?;
    println!(
        "🔧 Restore '{}' from {:?} into {:?}",
        job.label, setup.drive.device_path, target
    );
    if let Some(prefix) = &only {
        println!("   Only entries under {}", prefix);
    }

    let bar = progress_bar();
    let (mut orchestrator, events) = setup.orchestrator(
        &job.label,
        cancel,
        Box::new(StdinOperator::new(Some(bar.clone()))),
    )?;
    let progress = spawn_progress(events, bar)?;

    let request = RestoreRequest {
        label: job.label.clone(),
        job: job.job.clone(),
        target,
        only,
    };
    let result = orchestrator.restore(&request);

    drop(orchestrator);
    let _ = progress.join();

    let report = match result.and_then(|r| r.into_result()) {
        Ok(report) => report,
        Err(e) => {
            println!("❌ Restore failed: {}", e);
            return Err(e);
        }
    };

    let elapsed = started.elapsed().as_secs_f64();
    println!("✅ Restore complete");
    println!("   Entries restored: {}", report.restored.len());
    println!("   Bytes restored:   {}", format_bytes(report.bytes));
    println!(
        "   Duration:         {} ({})",
        format_duration(elapsed),
        format_speed(report.bytes, elapsed)
    );

    Ok(())
}
