use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

pub const DEFAULT_FPS: u32 = 25;
pub const DEFAULT_VIDEO_CODEC: &str = "libx264";
pub const DEFAULT_VIDEO_BITRATE: u32 = 1000;
pub const DEFAULT_VIDEO_CRF: u32 = 23;
pub const DEFAULT_VIDEO_PRESET: &str = "ultrafast";
pub const DEFAULT_PIXEL_FORMAT: &str = "yuv420p";

/// One captured screencast image.
///
/// `duration` is only ever filled in by the frame scheduler, never by the
/// collector that produced the frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ScreenFrame {
    pub blob: Bytes,
    /// Capture time in seconds, as reported by the protocol metadata.
    pub timestamp: f64,
    pub duration: Option<f64>,
}

impl ScreenFrame {
    pub fn new(blob: impl Into<Bytes>, timestamp: f64) -> Self {
        Self {
            blob: blob.into(),
            timestamp,
            duration: None,
        }
    }

    /// Returns a copy carrying the computed display duration.
    pub fn with_duration(&self, duration: f64) -> Self {
        Self {
            blob: self.blob.clone(),
            timestamp: self.timestamp,
            duration: Some(duration),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AspectRatio {
    #[serde(rename = "3:2")]
    ThreeTwo,
    #[default]
    #[serde(rename = "4:3")]
    FourThree,
    #[serde(rename = "16:9")]
    SixteenNine,
}

impl AspectRatio {
    pub fn as_str(&self) -> &'static str {
        match self {
            AspectRatio::ThreeTwo => "3:2",
            AspectRatio::FourThree => "4:3",
            AspectRatio::SixteenNine => "16:9",
        }
    }
}

/// Output geometry. Both dimensions must be set for an explicit size,
/// otherwise the source size is kept.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct VideoFrameSize {
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl VideoFrameSize {
    pub fn explicit(width: u32, height: u32) -> Self {
        Self {
            width: Some(width),
            height: Some(height),
        }
    }

    /// `WxH` for an explicit size, `None` for "match source".
    pub fn size_arg(&self) -> Option<String> {
        match (self.width, self.height) {
            (Some(width), Some(height)) => Some(format!("{}x{}", width, height)),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Autopad {
    pub color: String,
}

impl Default for Autopad {
    fn default() -> Self {
        Self {
            color: "black".to_string(),
        }
    }
}

/// Container formats accepted for file destinations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VideoFormat {
    Mp4,
    Mov,
    Avi,
    Webm,
}

impl VideoFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "mp4" => Some(VideoFormat::Mp4),
            "mov" => Some(VideoFormat::Mov),
            "avi" => Some(VideoFormat::Avi),
            "webm" => Some(VideoFormat::Webm),
            _ => None,
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(Self::from_extension)
    }
}

/// Encoder configuration. Resolved once before the sink starts and never
/// mutated afterwards.
#[derive(Clone, Debug, PartialEq)]
pub struct VideoOptions {
    /// Output frames per second. Required by the sink.
    pub fps: Option<u32>,
    pub video_frame: VideoFrameSize,
    pub aspect_ratio: AspectRatio,
    pub video_codec: String,
    /// Bitrate in kbit/s.
    pub video_bitrate: u32,
    pub video_crf: u32,
    pub video_preset: String,
    pub video_pixel_format: String,
    pub autopad: Option<Autopad>,
    /// Hard cap on the encoded length, in seconds.
    pub record_duration_limit: Option<f64>,
    pub ffmpeg_path: Option<String>,
}

impl Default for VideoOptions {
    fn default() -> Self {
        Self {
            fps: Some(DEFAULT_FPS),
            video_frame: VideoFrameSize::default(),
            aspect_ratio: AspectRatio::default(),
            video_codec: DEFAULT_VIDEO_CODEC.to_string(),
            video_bitrate: DEFAULT_VIDEO_BITRATE,
            video_crf: DEFAULT_VIDEO_CRF,
            video_preset: DEFAULT_VIDEO_PRESET.to_string(),
            video_pixel_format: DEFAULT_PIXEL_FORMAT.to_string(),
            autopad: None,
            record_duration_limit: None,
            ffmpeg_path: None,
        }
    }
}

/// Full recorder configuration: encoder options plus tab-following behavior.
#[derive(Clone, Debug, PartialEq)]
pub struct RecorderOptions {
    pub video: VideoOptions,
    pub follow_new_tab: bool,
}

impl Default for RecorderOptions {
    fn default() -> Self {
        Self {
            video: VideoOptions::default(),
            follow_new_tab: true,
        }
    }
}

/// Encoder progress, rendered as `HH:MM:SS:FF`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Timemark {
    millis: u64,
    fps: u32,
}

impl Timemark {
    pub fn from_millis(millis: u64, fps: u32) -> Self {
        Self { millis, fps }
    }

    pub fn zero(fps: u32) -> Self {
        Self::from_millis(0, fps)
    }
}

impl fmt::Display for Timemark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total_secs = self.millis / 1000;
        let hours = total_secs / 3600;
        let minutes = (total_secs % 3600) / 60;
        let seconds = total_secs % 60;
        let frames = if self.fps == 0 {
            0
        } else {
            ((self.millis % 1000) * u64::from(self.fps) / 1000).min(u64::from(self.fps) - 1)
        };
        write!(
            f,
            "{:02}:{:02}:{:02}:{:02}",
            hours, minutes, seconds, frames
        )
    }
}
