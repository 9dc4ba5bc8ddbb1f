//! Failure Classification
//!
//! Maps raw failure signals (subprocess exit status and stderr, OS error
//! codes, internal errors) to a taxonomy kind and a recommended action. The
//! pipeline and the spanning manager classify before they change state, so
//! an end-of-tape condition routes to a volume swap no matter which layer
//! reported it.

use crate::error::TapeStreamError;
use std::fmt;
use std::io;
use tracing::debug;

/// Linux errno values the classifier cares about.
const EPERM: i32 = 1;
const ENOENT: i32 = 2;
const EIO: i32 = 5;
const ENOMEM: i32 = 12;
const EACCES: i32 = 13;
const EBUSY: i32 = 16;
const ENOSPC: i32 = 28;
const ENOMEDIUM: i32 = 123;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Producer,
    BufferUnderrun,
    BufferOverrun,
    DeviceEot,
    DeviceEnospc,
    DeviceIo,
    SnapshotCorrupt,
}

impl ErrorKind {
    /// EOT and ENOSPC both mean the current volume is exhausted.
    pub fn is_end_of_volume(self) -> bool {
        matches!(self, ErrorKind::DeviceEot | ErrorKind::DeviceEnospc)
    }

    /// Build the crate error that carries this kind.
    pub fn into_error<T: Into<String>>(self, msg: T) -> TapeStreamError {
        let msg = msg.into();
        match self {
            ErrorKind::Config => TapeStreamError::Config(msg),
            ErrorKind::Producer => TapeStreamError::Producer(msg),
            ErrorKind::BufferUnderrun | ErrorKind::BufferOverrun => TapeStreamError::Buffer(msg),
            ErrorKind::DeviceEot => TapeStreamError::DeviceEot(msg),
            ErrorKind::DeviceEnospc => TapeStreamError::DeviceEnospc(msg),
            ErrorKind::DeviceIo => TapeStreamError::TapeDevice(msg),
            ErrorKind::SnapshotCorrupt => TapeStreamError::SnapshotCorrupt(msg),
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Config => "ConfigError",
            ErrorKind::Producer => "ProducerError",
            ErrorKind::BufferUnderrun => "BufferUnderrun",
            ErrorKind::BufferOverrun => "BufferOverrun",
            ErrorKind::DeviceEot => "DeviceEOT",
            ErrorKind::DeviceEnospc => "DeviceENOSPC",
            ErrorKind::DeviceIo => "DeviceIOError",
            ErrorKind::SnapshotCorrupt => "SnapshotCorrupt",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Retry,
    PromptOperator,
    AbortJob,
    /// Drop the current file and keep the job going (file-level strategies only).
    SkipFile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub kind: ErrorKind,
    pub action: Action,
}

/// What the caller knows about the job when it asks for a classification.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClassifyContext {
    /// The pipeline keeps per-file boundaries (Direct strategy).
    pub file_level: bool,
    /// Policy allows skipping unreadable sources.
    pub skip_unreadable: bool,
}

/// A raw failure as observed by a pipeline stage.
#[derive(Debug)]
pub enum FailureSignal<'a> {
    Exit {
        tool: &'a str,
        code: Option<i32>,
        stderr: &'a str,
    },
    Io(&'a io::Error),
    Stderr(&'a str),
    Error(&'a TapeStreamError),
}

struct Pattern {
    needle: String,
    kind: ErrorKind,
}

/// Ordered signature table; the first matching needle wins.
pub struct ErrorClassifier {
    patterns: Vec<Pattern>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorClassifier {
    pub fn new() -> Self {
        let table: &[(&str, ErrorKind)] = &[
            // end of volume first, generic I/O text often follows it
            ("no space left on device", ErrorKind::DeviceEnospc),
            ("end of medium", ErrorKind::DeviceEot),
            ("end of tape", ErrorKind::DeviceEot),
            ("eom detected", ErrorKind::DeviceEot),
            ("early warning", ErrorKind::DeviceEot),
            ("volume overflow", ErrorKind::DeviceEot),
            ("input/output error", ErrorKind::DeviceIo),
            ("medium error", ErrorKind::DeviceIo),
            ("hardware error", ErrorKind::DeviceIo),
            ("broken pipe", ErrorKind::DeviceIo),
            ("device or resource busy", ErrorKind::DeviceIo),
            ("no medium found", ErrorKind::DeviceIo),
            ("dr_open", ErrorKind::DeviceIo),
            ("permission denied", ErrorKind::Producer),
            ("cannot open", ErrorKind::Producer),
            ("no such file or directory", ErrorKind::Producer),
            ("file changed as we read it", ErrorKind::Producer),
            ("file shrank", ErrorKind::Producer),
            ("cannot allocate memory", ErrorKind::Config),
            ("out of memory", ErrorKind::Config),
            ("invalid strategy", ErrorKind::Config),
            ("buffer stalled", ErrorKind::DeviceIo),
            ("buffer overrun", ErrorKind::BufferOverrun),
        ];

        Self {
            patterns: table
                .iter()
                .map(|(needle, kind)| Pattern {
                    needle: (*needle).to_string(),
                    kind: *kind,
                })
                .collect(),
        }
    }

    /// Register an extra signature. It is checked before the built-in table.
    pub fn with_pattern<T: Into<String>>(mut self, needle: T, kind: ErrorKind) -> Self {
        self.patterns.insert(
            0,
            Pattern {
                needle: needle.into().to_lowercase(),
                kind,
            },
        );
        self
    }

    fn match_text(&self, text: &str) -> Option<ErrorKind> {
        let lower = text.to_lowercase();
        self.patterns
            .iter()
            .find(|p| lower.contains(&p.needle))
            .map(|p| p.kind)
    }

    fn kind_of_io(&self, err: &io::Error) -> ErrorKind {
        if let Some(code) = err.raw_os_error() {
            match code {
                ENOSPC => return ErrorKind::DeviceEnospc,
                EIO | EBUSY | ENOMEDIUM => return ErrorKind::DeviceIo,
                EACCES | EPERM | ENOENT => return ErrorKind::Producer,
                ENOMEM => return ErrorKind::Config,
                _ => {}
            }
        }

        match err.kind() {
            io::ErrorKind::PermissionDenied | io::ErrorKind::NotFound => ErrorKind::Producer,
            io::ErrorKind::BrokenPipe => ErrorKind::DeviceIo,
            io::ErrorKind::TimedOut => ErrorKind::BufferUnderrun,
            _ => self
                .match_text(&err.to_string())
                .unwrap_or(ErrorKind::DeviceIo),
        }
    }

    /// Taxonomy kind for a failure signal.
    pub fn kind_of(&self, signal: &FailureSignal<'_>) -> ErrorKind {
        match signal {
            FailureSignal::Exit { tool, code, stderr } => {
                let kind = self.match_text(stderr).unwrap_or(ErrorKind::DeviceIo);
                debug!("{} exited with {:?}, classified as {}", tool, code, kind);
                kind
            }
            FailureSignal::Io(err) => self.kind_of_io(err),
            FailureSignal::Stderr(text) => self.match_text(text).unwrap_or(ErrorKind::DeviceIo),
            FailureSignal::Error(err) => match err {
                TapeStreamError::Config(_) => ErrorKind::Config,
                TapeStreamError::Producer(_) => ErrorKind::Producer,
                TapeStreamError::Buffer(msg) => {
                    self.match_text(msg).unwrap_or(ErrorKind::BufferUnderrun)
                }
                TapeStreamError::DeviceEot(_) => ErrorKind::DeviceEot,
                TapeStreamError::DeviceEnospc(_) => ErrorKind::DeviceEnospc,
                TapeStreamError::TapeDevice(_) | TapeStreamError::DeviceBusy(_) => {
                    ErrorKind::DeviceIo
                }
                TapeStreamError::SnapshotCorrupt(_) | TapeStreamError::Serialization(_) => {
                    ErrorKind::SnapshotCorrupt
                }
                TapeStreamError::Io(io_err) => self.kind_of_io(io_err),
                other => self
                    .match_text(&other.to_string())
                    .unwrap_or(ErrorKind::DeviceIo),
            },
        }
    }

    pub fn classify(&self, signal: &FailureSignal<'_>, ctx: ClassifyContext) -> Classification {
        let kind = self.kind_of(signal);
        Classification {
            kind,
            action: action_for(kind, ctx),
        }
    }
}

/// Recommended action for a kind.
pub fn action_for(kind: ErrorKind, ctx: ClassifyContext) -> Action {
    match kind {
        ErrorKind::Config => Action::AbortJob,
        ErrorKind::Producer => {
            if ctx.file_level && ctx.skip_unreadable {
                Action::SkipFile
            } else {
                Action::AbortJob
            }
        }
        ErrorKind::BufferUnderrun | ErrorKind::BufferOverrun => Action::Retry,
        ErrorKind::DeviceEot | ErrorKind::DeviceEnospc => Action::PromptOperator,
        ErrorKind::DeviceIo => Action::Retry,
        ErrorKind::SnapshotCorrupt => Action::PromptOperator,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enospc_errno_routes_to_end_of_volume() {
        let classifier = ErrorClassifier::new();
        let err = io::Error::from_raw_os_error(ENOSPC);
        let c = classifier.classify(&FailureSignal::Io(&err), ClassifyContext::default());
        assert_eq!(c.kind, ErrorKind::DeviceEnospc);
        assert_eq!(c.action, Action::PromptOperator);
        assert!(c.kind.is_end_of_volume());
    }

    #[test]
    fn test_stderr_patterns() {
        let classifier = ErrorClassifier::new();
        let ctx = ClassifyContext::default();

        let eot = classifier.classify(
            &FailureSignal::Exit {
                tool: "mbuffer",
                code: Some(1),
                stderr: "mbuffer: error: outputThread: End of tape reached",
            },
            ctx,
        );
        assert_eq!(eot.kind, ErrorKind::DeviceEot);

        let pipe = classifier.classify(&FailureSignal::Stderr("write: Broken pipe"), ctx);
        assert_eq!(pipe.kind, ErrorKind::DeviceIo);
        assert_eq!(pipe.action, Action::Retry);

        let perm = classifier.classify(
            &FailureSignal::Stderr("tar: /data/x: Cannot open: Permission denied"),
            ctx,
        );
        assert_eq!(perm.kind, ErrorKind::Producer);
        assert_eq!(perm.action, Action::AbortJob);
    }

    #[test]
    fn test_producer_skip_only_for_file_level_strategies() {
        let classifier = ErrorClassifier::new();
        let err = io::Error::from_raw_os_error(EACCES);

        let direct = ClassifyContext {
            file_level: true,
            skip_unreadable: true,
        };
        assert_eq!(
            classifier.classify(&FailureSignal::Io(&err), direct).action,
            Action::SkipFile
        );

        let staged = ClassifyContext {
            file_level: false,
            skip_unreadable: true,
        };
        assert_eq!(
            classifier.classify(&FailureSignal::Io(&err), staged).action,
            Action::AbortJob
        );
    }

    #[test]
    fn test_custom_pattern_takes_precedence() {
        let classifier =
            ErrorClassifier::new().with_pattern("Broken pipe", ErrorKind::Producer);
        assert_eq!(
            classifier.kind_of(&FailureSignal::Stderr("Broken pipe")),
            ErrorKind::Producer
        );
    }

    #[test]
    fn test_internal_errors_keep_their_kind() {
        let classifier = ErrorClassifier::new();
        let err = TapeStreamError::snapshot_corrupt("bad json");
        assert_eq!(
            classifier.kind_of(&FailureSignal::Error(&err)),
            ErrorKind::SnapshotCorrupt
        );

        let underrun = TapeStreamError::buffer("consumer starved");
        assert_eq!(
            classifier.kind_of(&FailureSignal::Error(&underrun)),
            ErrorKind::BufferUnderrun
        );

        // a stall past the timeout counts against the device
        let stall = TapeStreamError::buffer("buffer stalled for 30s");
        assert_eq!(
            classifier.kind_of(&FailureSignal::Error(&stall)),
            ErrorKind::DeviceIo
        );
    }
}
