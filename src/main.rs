use rust_tapestream::cli::{Cli, Commands};
use rust_tapestream::commands::{self, GlobalOpts};
use rust_tapestream::error::{Result, TapeStreamError};
use rust_tapestream::logger;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse_args();

    // Initialize logging system
    logger::init(args.verbose, args.log_json)?;

    debug!("tapestream starting");

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, stopping at the next safe point");
                cancel.store(true, Ordering::SeqCst);
            }
        });
    }

    match run(args, cancel).await {
        Ok(_) => {
            info!("Operation completed successfully");
            Ok(())
        }
        Err(e) => {
            error!("Operation failed: {}", e);
            std::process::exit(e.exit_code());
        }
    }
}

async fn run(args: Cli, cancel: Arc<AtomicBool>) -> Result<()> {
    let globals = GlobalOpts {
        config: args.config,
        drive: args.drive,
        device: args.device,
    };

    let job = tokio::task::spawn_blocking(move || match args.command {
        Commands::Backup {
            sources,
            job,
            strategy,
            incremental,
            fallback_full,
            checksum,
            skip_unreadable,
        } => commands::backup::execute(
            &globals,
            sources,
            job,
            strategy,
            incremental,
            fallback_full,
            checksum,
            skip_unreadable,
            cancel,
        ),

        Commands::Restore { target, job, only } => {
            commands::restore::execute(&globals, target, job, only, cancel)
        }
    });

    job.await
        .map_err(|e| TapeStreamError::Generic(anyhow::anyhow!("job task failed: {}", e)))?
}
