use thiserror::Error;

pub type Result<T> = std::result::Result<T, TapeStreamError>;

#[derive(Error, Debug)]
pub enum TapeStreamError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Producer error: {0}")]
    Producer(String),

    #[error("Buffer error: {0}")]
    Buffer(String),

    #[error("End of tape reached: {0}")]
    DeviceEot(String),

    #[error("No space left on volume: {0}")]
    DeviceEnospc(String),

    #[error("Tape device error: {0}")]
    TapeDevice(String),

    #[error("Device busy: {0}")]
    DeviceBusy(String),

    #[error("Snapshot manifest corrupt: {0}")]
    SnapshotCorrupt(String),

    #[error("Invalid state transition: {0}")]
    StateTransition(String),

    #[error("Spanning aborted: {0}")]
    SpanningAborted(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Generic error: {0}")]
    Generic(#[from] anyhow::Error),
}

impl TapeStreamError {
    pub fn config<T: Into<String>>(msg: T) -> Self {
        Self::Config(msg.into())
    }

    pub fn producer<T: Into<String>>(msg: T) -> Self {
        Self::Producer(msg.into())
    }

    pub fn buffer<T: Into<String>>(msg: T) -> Self {
        Self::Buffer(msg.into())
    }

    pub fn tape_device<T: Into<String>>(msg: T) -> Self {
        Self::TapeDevice(msg.into())
    }

    pub fn snapshot_corrupt<T: Into<String>>(msg: T) -> Self {
        Self::SnapshotCorrupt(msg.into())
    }

    pub fn state_transition<T: Into<String>>(msg: T) -> Self {
        Self::StateTransition(msg.into())
    }

    pub fn cancelled<T: Into<String>>(msg: T) -> Self {
        Self::Cancelled(msg.into())
    }

    /// Process exit code for the CLI.
    ///
    /// `2` configuration, `3` device, `4` partial completion, `5` corrupt
    /// snapshot, `1` everything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 2,
            Self::TapeDevice(_)
            | Self::DeviceBusy(_)
            | Self::DeviceEot(_)
            | Self::DeviceEnospc(_)
            | Self::Buffer(_) => 3,
            Self::SpanningAborted(_) | Self::Cancelled(_) => 4,
            Self::SnapshotCorrupt(_) => 5,
            _ => 1,
        }
    }
}
