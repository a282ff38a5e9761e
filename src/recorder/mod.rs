//! Browser tab recording: screencast frames in, constant-rate video out.
//!
//! Pipeline:
//! - `collector` attaches to the tab (and popups it opens) and forwards
//!   acknowledged frames
//! - `scheduler` reorders frames and expands each into `fps × duration` copies
//! - `writer` pipes the expanded stream into ffmpeg
//! - `coordinator` owns the pipeline for one recording

pub mod collector;
pub mod coordinator;
pub mod errors;
pub mod ffmpeg;
pub mod protocol;
pub mod scheduler;
pub mod state;
pub mod types;
pub mod writer;

pub use collector::{CollectorOutputs, ScreencastCollector};
pub use coordinator::{RecorderEvent, ScreenRecorder};
pub use errors::{DestinationError, EncoderError, EncodingError, ProtocolError, RecorderError};
pub use protocol::{CaptureSession, PageEvent, PageTarget, ScreencastFrameEvent};
pub use scheduler::{FrameScheduler, FrameSink};
pub use types::{RecorderOptions, ScreenFrame, Timemark, VideoFormat, VideoOptions};
pub use writer::{Destination, EncoderSink, OutputStream};
