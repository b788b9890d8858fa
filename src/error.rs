//! Error types for the acquisition pipeline

use std::path::PathBuf;

use thiserror::Error;

/// Outcome of a failed `FrameSource::grab`.
#[derive(Debug, Error)]
pub enum GrabError {
    /// No frame arrived within the grab timeout. Expected between trials.
    #[error("no frame within grab timeout")]
    Timeout,

    /// The device delivered a partial frame; treated like a timeout.
    #[error("incomplete frame (status {status})")]
    Incomplete { status: i32 },

    /// Any other device error. Logged and retried.
    #[error("device error: {0}")]
    Device(String),

    /// The camera handle is gone. Ends the session.
    #[error("camera lost: {0}")]
    Lost(String),
}

impl GrabError {
    /// Timeout-shaped failures drive the trial segmenter instead of being errors.
    pub fn is_timeout(&self) -> bool {
        matches!(self, GrabError::Timeout | GrabError::Incomplete { .. })
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, GrabError::Lost(_))
    }
}

impl From<std::io::Error> for GrabError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => GrabError::Timeout,
            std::io::ErrorKind::NotFound | std::io::ErrorKind::BrokenPipe => {
                GrabError::Lost(err.to_string())
            }
            _ => GrabError::Device(err.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("failed to create output folder {path}: {source}")]
    Folder {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn encoder `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("encoder pipe error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoder session already closed")]
    Closed,

    #[error("encoder exited with {0}")]
    Exited(std::process::ExitStatus),

    #[error("frame of {got} bytes does not match session frame size {expected}")]
    FrameSize { expected: usize, got: usize },

    #[error("encoder rejected session: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("metadata io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("metadata csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("malformed frametimes table: {0}")]
    Format(String),
}

#[derive(Debug, Error)]
pub enum DisplayError {
    #[error("display backend error: {0}")]
    Backend(String),

    #[error("failed to decode preview frame: {0}")]
    Decode(String),

    #[error("preview of {0:?} frames is not supported")]
    Unsupported(crate::capture::PixelFormat),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Grab(#[from] GrabError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Display(#[from] DisplayError),

    #[error("failed to spawn {name} thread: {source}")]
    Thread {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} thread panicked")]
    Panicked(&'static str),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_timeouts_map_to_grab_timeout() {
        let err: GrabError = std::io::Error::from(std::io::ErrorKind::TimedOut).into();
        assert!(err.is_timeout());
        assert!(!err.is_fatal());
    }

    #[test]
    fn missing_device_is_fatal() {
        let err: GrabError = std::io::Error::from(std::io::ErrorKind::NotFound).into();
        assert!(err.is_fatal());
    }

    #[test]
    fn incomplete_frames_count_as_timeouts() {
        assert!(GrabError::Incomplete { status: 3 }.is_timeout());
        assert!(!GrabError::Device("bus reset".into()).is_timeout());
    }
}
