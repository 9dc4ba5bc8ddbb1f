//! Backup Command Handler
//!
//! Handles the `backup` subcommand.

use super::{progress_bar, spawn_progress, GlobalOpts, JobSetup, StdinOperator};
use crate::cli::JobArgs;
use crate::error::Result;
use crate::orchestrator::BackupRequest;
use crate::pipeline::{ChecksumType, Strategy};
use crate::utils::{format_bytes, format_duration, format_speed};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::{info, warn};

#[allow(clippy::too_many_arguments)]
pub fn execute(
    globals: &GlobalOpts,
    sources: Vec<PathBuf>,
    job: JobArgs,
    strategy: Strategy,
    incremental: bool,
    fallback_full: bool,
    checksum: ChecksumType,
    skip_unreadable: bool,
    cancel: Arc<AtomicBool>,
) -> Result<()> {
    info!("Starting backup '{}' of {} source(s)", job.label, sources.len());

    let setup = JobSetup::load(globals, &job)?;
    if skip_unreadable && !strategy.is_file_level() {
        warn!("--skip-unreadable only applies to the direct strategy; unreadable files abort a {} backup", strategy);
    }

    println!(
        "🔧 Backup '{}' to {:?} ({} strategy, {})",
        job.label,
        setup.drive.device_path,
        strategy,
        if incremental { "incremental" } else { "full" }
    );

    let bar = progress_bar();
    let (mut orchestrator, events) = setup.orchestrator(
        &job.label,
        cancel,
        Box::new(StdinOperator::new(Some(bar.clone()))),
    )?;
    let progress = spawn_progress(events, bar)?;

    let request = BackupRequest {
        label: job.label.clone(),
        job: job.job.clone(),
        sources,
        strategy,
        incremental,
        fallback_full,
        checksum,
        skip_unreadable,
    };
    let result = orchestrator.backup(&request);

    drop(orchestrator);
    let _ = progress.join();

    let summary = match result {
        Ok(summary) => summary,
        Err(e) => {
            println!("❌ Backup failed: {}", e);
            if let Some(path) = manifest_hint(&setup, &job) {
                println!("💡 Files that reached tape are recorded in {:?}", path);
            }
            return Err(e);
        }
    };

    println!("✅ Backup complete");
    println!("   Files written:   {}", summary.files_committed);
    println!("   Files unchanged: {}", summary.files_unchanged);
    println!("   Bytes written:   {}", format_bytes(summary.bytes_written));
    println!("   Volumes:         {}", summary.volumes.join(", "));
    println!(
        "   Duration:        {} ({})",
        format_duration(summary.elapsed.as_secs_f64()),
        format_speed(summary.bytes_written, summary.elapsed.as_secs_f64())
    );
    if let Some(buffer) = &summary.buffer {
        println!(
            "   Buffer:          peak {} of {}, {} pauses, {} starvations",
            format_bytes(buffer.peak_occupancy as u64),
            format_bytes(buffer.capacity as u64),
            buffer.pause_events,
            buffer.starvation_events
        );
    }
    if !summary.skipped.is_empty() {
        println!("⚠️  {} files skipped:", summary.skipped.len());
        for path in &summary.skipped {
            println!("   {}", path);
        }
    }
    if let Some(path) = &summary.manifest_path {
        println!("📄 Manifest: {:?}", path);
    }

    Ok(())
}

fn manifest_hint(setup: &JobSetup, job: &JobArgs) -> Option<PathBuf> {
    let path = crate::snapshot::ManifestStore::new(&setup.config.snapshot_dir)
        .path_for(&job.label, job.job.as_deref());
    path.exists().then_some(path)
}
