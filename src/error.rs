use thiserror::Error;

#[cfg(target_family = "unix")]
use crate::capture::CaptureError;
use crate::stamp::CorrectorError;
#[cfg(target_family = "unix")]
use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum DiagLogcatError {
    #[error("Usage: {0}")]
    Usage(String),
    #[error("Config file parsing error: {0}")]
    ConfigFileParsingError(#[from] toml::de::Error),
    #[error("Failed to read commands from {path} ({source})")]
    CommandFileUnreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("No commands in {0}")]
    EmptyCommandFile(String),
    #[cfg(target_family = "unix")]
    #[error("Diag initialization error: {0}")]
    DiagInitError(TransportError),
    #[cfg(target_family = "unix")]
    #[error("Failed to send commands: {0}")]
    CommandWriteError(TransportError),
    #[cfg(target_family = "unix")]
    #[error("Capture stopped: {0}")]
    CaptureError(#[from] CaptureError),
    #[error("Stamp correction failed: {0}")]
    CorrectorError(#[from] CorrectorError),
}

impl DiagLogcatError {
    /// The process exit status for this error. Each cause gets its own so
    /// scripts driving the tools can tell them apart.
    pub fn exit_code(&self) -> i32 {
        match self {
            DiagLogcatError::Usage(_) => 2,
            DiagLogcatError::ConfigFileParsingError(_) => 3,
            DiagLogcatError::CommandFileUnreadable { .. } | DiagLogcatError::EmptyCommandFile(_) => 4,
            #[cfg(target_family = "unix")]
            DiagLogcatError::DiagInitError(_) => 5,
            #[cfg(target_family = "unix")]
            DiagLogcatError::CommandWriteError(_) => 6,
            #[cfg(target_family = "unix")]
            DiagLogcatError::CaptureError(CaptureError::Transport(_) | CaptureError::EmptyMessage(_)) => 7,
            #[cfg(target_family = "unix")]
            DiagLogcatError::CaptureError(_) => 8,
            DiagLogcatError::CorrectorError(CorrectorError::FileIo { .. }) => 9,
            DiagLogcatError::CorrectorError(CorrectorError::AllocationFailed) => 10,
            DiagLogcatError::CorrectorError(CorrectorError::EmptyDataLog | CorrectorError::NoAnchors) => 11,
        }
    }
}
