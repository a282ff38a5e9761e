use std::time::Duration;
use thiserror::Error;

/// Errors reported by the browser debugging protocol.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Failed to create capture session: {0}")]
    SessionCreationFailed(String),
    #[error("Failed to acknowledge screencast frame {session_id}: {message}")]
    AcknowledgmentFailed { session_id: i64, message: String },
    #[error("Failed to toggle screencast: {0}")]
    ScreencastFailed(String),
    #[error("Failed to detach capture session: {0}")]
    DetachFailed(String),
}

/// Errors raised while validating the sink destination, before any encoder
/// process exists.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DestinationError {
    #[error("File format is not supported: {0}")]
    UnsupportedFormat(String),
    #[error("Output should be a writable stream")]
    InvalidDestination,
}

/// Errors from the ffmpeg encoding pipeline.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EncodingError {
    #[error("FFmpeg not found at '{0}'. Install ffmpeg or set FFMPEG_PATH.")]
    FfmpegNotFound(String),
    #[error("A frame rate is required to expand frames into a constant-rate stream")]
    MissingFrameRate,
    #[error("Failed to spawn FFmpeg: {0}")]
    SpawnFailed(String),
    #[error("FFmpeg process failed with exit code {exit_code}: {stderr}")]
    ProcessFailed { exit_code: i32, stderr: String },
    #[error("Writer thread stalled (frame send timeout after {0:?})")]
    WriterStalled(Duration),
    #[error("Writer thread disconnected unexpectedly")]
    WriterDisconnected,
}

/// Top-level error type for recorder operations.
#[derive(Error, Debug)]
pub enum RecorderError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Destination(#[from] DestinationError),
    #[error(transparent)]
    Encoding(#[from] EncodingError),
}

/// Error event emitted by the encoder sink while the encode is running.
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderError {
    pub message: String,
    /// The encoder's input pipe closed while nothing was being written.
    /// This happens naturally on shutdown and is not reported to the operator.
    pub expected_shutdown: bool,
}

impl std::fmt::Display for EncoderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Error unable to capture video stream: {}", self.message)
    }
}
