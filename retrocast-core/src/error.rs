use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        source: toml::de::Error,
        path: PathBuf,
    },
    #[error("invalid config value for {field}: {value}")]
    Invalid { field: &'static str, value: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Failures of the transcode engine.
///
/// Setup failures are stored on the owning session and handed to every waiter,
/// so the type is `Clone` and carries rendered messages instead of sources.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StreamError {
    #[error("unknown profile {0:?}")]
    UnknownProfile(String),
    #[error("profile {0} cannot be published over rtsp")]
    RtspUnsupported(&'static str),
    #[error("invalid stream path {0:?}")]
    InvalidPath(String),
    #[error("resolve stream: {0}")]
    ResolveFailed(String),
    #[error("encoder start failed: {0}")]
    EncoderStartFailed(String),
    #[error("encoder failed: {0}")]
    EncoderRuntimeFailure(String),
    #[error("publisher must connect from loopback, got {0}")]
    PublisherRejected(String),
    #[error("stream already has a publisher")]
    PublisherConflict,
    #[error("invalid media description: {0}")]
    InvalidDescription(String),
    #[error("invalid range {0:?}")]
    InvalidRange(String),
    #[error("no stream for {0}")]
    UnknownStream(String),
    #[error("timed out waiting for publisher")]
    Timeout,
    #[error("stream closed")]
    Closed,
}

impl StreamError {
    pub fn http_status(&self) -> u16 {
        match self {
            StreamError::UnknownProfile(_)
            | StreamError::InvalidPath(_)
            | StreamError::InvalidRange(_)
            | StreamError::InvalidDescription(_) => 400,
            StreamError::PublisherRejected(_) => 403,
            StreamError::UnknownStream(_) => 404,
            StreamError::PublisherConflict => 409,
            StreamError::Timeout => 504,
            StreamError::RtspUnsupported(_)
            | StreamError::ResolveFailed(_)
            | StreamError::EncoderStartFailed(_)
            | StreamError::EncoderRuntimeFailure(_)
            | StreamError::Closed => 500,
        }
    }

    /// RTSP status for a failed request. Anything that prevents a stream from
    /// becoming ready is reported to players as 404.
    pub fn rtsp_status(&self) -> u16 {
        match self {
            StreamError::PublisherRejected(_) => 403,
            StreamError::PublisherConflict => 455,
            StreamError::InvalidRange(_) => 457,
            StreamError::InvalidDescription(_) => 400,
            StreamError::InvalidPath(_)
            | StreamError::UnknownProfile(_)
            | StreamError::RtspUnsupported(_)
            | StreamError::UnknownStream(_)
            | StreamError::ResolveFailed(_)
            | StreamError::EncoderStartFailed(_)
            | StreamError::EncoderRuntimeFailure(_)
            | StreamError::Timeout
            | StreamError::Closed => 404,
        }
    }
}

pub type StreamResult<T> = std::result::Result<T, StreamError>;
