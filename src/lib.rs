//! tapestream library
//!
//! Streams file trees to tape through a watermark-controlled memory buffer,
//! spans jobs across cartridges and keeps per-label manifests for
//! incremental runs and restores.

pub mod classify;
pub mod cli;
pub mod commands;
pub mod config;
pub mod device;
pub mod error;
pub mod flow;
pub mod logger;
pub mod orchestrator;
pub mod pipeline;
pub mod snapshot;
pub mod utils;
pub mod volume;


// Re-export key types for easier use
pub use classify::{Action, Classification, ErrorClassifier, ErrorKind, FailureSignal};
pub use config::Config;
pub use error::{Result, TapeStreamError};
pub use flow::{ElasticBuffer, FlowConfig, Watermarks};
pub use orchestrator::{BackupRequest, BackupSummary, JobEnvironment, Orchestrator, RestoreRequest};
pub use pipeline::{ChecksumType, Strategy, Transfer};
pub use snapshot::{Manifest, ManifestStore};
pub use volume::{Pool, SpanningManager, Volume};
