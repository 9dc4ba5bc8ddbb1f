use crate::pipeline::{ChecksumType, Strategy};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "tapestream")]
#[command(about = "Streaming tape backup with incremental manifests and volume spanning")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit log records as JSON
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Specify configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Configured drive to use (defaults to the first one)
    #[arg(long, global = true)]
    pub drive: Option<String>,

    /// Tape device node, overriding the drive's configured path
    #[arg(long, global = true)]
    pub device: Option<PathBuf>,
}

/// Options shared by backup and restore.
#[derive(Args, Debug, Clone)]
pub struct JobArgs {
    /// Backup set label
    #[arg(short, long)]
    pub label: String,

    /// Job name, keeps manifests of different jobs with one label apart
    #[arg(short, long)]
    pub job: Option<String>,

    /// Elastic buffer size in GB
    #[arg(long = "memory_buffer", value_name = "GB")]
    pub memory_buffer: Option<f64>,

    /// Low watermark: the writer resumes once the buffer holds more than this
    #[arg(long = "memory_buffer_percent", value_name = "PCT")]
    pub memory_buffer_percent: Option<u32>,

    /// High watermark: the producer pauses at this fill level
    #[arg(long = "high_watermark", value_name = "PCT")]
    pub high_watermark: Option<u32>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Back up files and folders to tape
    Backup {
        /// Source files or folders
        #[arg(value_name = "SOURCE", required = true)]
        sources: Vec<PathBuf>,

        #[command(flatten)]
        job: JobArgs,

        /// How the archive reaches the drive
        #[arg(short, long, value_enum, default_value_t = Strategy::Direct)]
        strategy: Strategy,

        /// Only transfer entries changed since the label's last manifest
        #[arg(short, long)]
        incremental: bool,

        /// Run a full backup when the prior manifest cannot be read
        #[arg(long)]
        fallback_full: bool,

        /// Checksum recorded for each file
        #[arg(long, value_enum, default_value_t = ChecksumType::None)]
        checksum: ChecksumType,

        /// Skip files that cannot be read instead of failing (direct only)
        #[arg(long)]
        skip_unreadable: bool,
    },

    /// Restore entries of a backup set into a directory
    Restore {
        /// Target directory
        #[arg(value_name = "TARGET")]
        target: PathBuf,

        #[command(flatten)]
        job: JobArgs,

        /// Restore only entries under this path prefix
        #[arg(long, value_name = "PREFIX")]
        only: Option<String>,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
