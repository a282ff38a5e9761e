use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::recorder::types::{
    AspectRatio, Autopad, RecorderOptions, VideoFrameSize, VideoOptions,
};
use crate::shared::paths::{ensure_dir, get_settings_path, get_storage_dir};

/// Recorder settings as stored on disk. Every field is an optional override;
/// missing fields keep the built-in defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecorderSettings {
    pub fps: Option<u32>,
    pub video_frame: Option<VideoFrameSize>,
    pub aspect_ratio: Option<AspectRatio>,
    pub video_codec: Option<String>,
    pub video_bitrate: Option<u32>,
    pub video_crf: Option<u32>,
    pub video_preset: Option<String>,
    pub video_pixel_format: Option<String>,
    /// `true` pads with black, a string pads with that color.
    pub autopad: Option<AutopadSetting>,
    pub record_duration_limit: Option<f64>,
    pub ffmpeg_path: Option<String>,
    pub follow_new_tab: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AutopadSetting {
    Enabled(bool),
    Color(String),
}

impl AutopadSetting {
    fn resolve(&self) -> Option<Autopad> {
        match self {
            AutopadSetting::Enabled(true) => Some(Autopad::default()),
            AutopadSetting::Enabled(false) => None,
            AutopadSetting::Color(color) => Some(Autopad {
                color: color.clone(),
            }),
        }
    }
}

impl RecorderSettings {
    /// Layers the overrides onto the defaults.
    pub fn resolve(&self) -> RecorderOptions {
        let defaults = VideoOptions::default();
        let video = VideoOptions {
            fps: self.fps.or(defaults.fps),
            video_frame: self.video_frame.unwrap_or(defaults.video_frame),
            aspect_ratio: self.aspect_ratio.unwrap_or(defaults.aspect_ratio),
            video_codec: self.video_codec.clone().unwrap_or(defaults.video_codec),
            video_bitrate: self.video_bitrate.unwrap_or(defaults.video_bitrate),
            video_crf: self.video_crf.unwrap_or(defaults.video_crf),
            video_preset: self.video_preset.clone().unwrap_or(defaults.video_preset),
            video_pixel_format: self
                .video_pixel_format
                .clone()
                .unwrap_or(defaults.video_pixel_format),
            autopad: match &self.autopad {
                Some(setting) => setting.resolve(),
                None => defaults.autopad,
            },
            record_duration_limit: self.record_duration_limit.or(defaults.record_duration_limit),
            ffmpeg_path: self.ffmpeg_path.clone().or(defaults.ffmpeg_path),
        };

        RecorderOptions {
            video,
            follow_new_tab: self
                .follow_new_tab
                .unwrap_or(RecorderOptions::default().follow_new_tab),
        }
    }
}

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to read settings file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to parse settings: {0}")]
    ParseError(#[from] serde_json::Error),
}

/// Load settings from disk, returning default if file doesn't exist or is invalid
pub fn load_settings() -> RecorderSettings {
    let path = get_settings_path();

    if !path.exists() {
        tracing::info!(target: "system", "Settings file not found, using defaults");
        return RecorderSettings::default();
    }

    match load_settings_from_file(&path) {
        Ok(settings) => {
            tracing::info!(target: "system", "Settings loaded from {:?}", path);
            settings
        }
        Err(e) => {
            tracing::warn!(target: "system", "Failed to load settings: {}, using defaults", e);
            RecorderSettings::default()
        }
    }
}

pub fn load_settings_from_file(path: &Path) -> Result<RecorderSettings, SettingsError> {
    let contents = std::fs::read_to_string(path)?;
    let settings = serde_json::from_str(&contents)?;
    Ok(settings)
}

pub fn save_settings(settings: &RecorderSettings) -> Result<(), SettingsError> {
    ensure_dir(&get_storage_dir())?;
    save_settings_to_file(settings, &get_settings_path())
}

pub fn save_settings_to_file(settings: &RecorderSettings, path: &Path) -> Result<(), SettingsError> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let contents = serde_json::to_string_pretty(settings)?;
    std::fs::write(path, contents)?;

    tracing::info!(target: "system", "Settings saved to {:?}", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_settings_resolve_to_defaults() {
        let options = RecorderSettings::default().resolve();
        assert_eq!(options, RecorderOptions::default());
        assert_eq!(options.video.fps, Some(25));
        assert!(options.follow_new_tab);
    }

    #[test]
    fn test_overrides_are_layered() {
        let json = r#"{
            "fps": 30,
            "videoFrame": { "width": 1280, "height": 720 },
            "aspectRatio": "16:9",
            "videoCrf": 28,
            "autopad": "white",
            "recordDurationLimit": 60.0,
            "followNewTab": false
        }"#;
        let settings: RecorderSettings = serde_json::from_str(json).unwrap();
        let options = settings.resolve();

        assert_eq!(options.video.fps, Some(30));
        assert_eq!(options.video.video_frame, VideoFrameSize::explicit(1280, 720));
        assert_eq!(options.video.aspect_ratio, AspectRatio::SixteenNine);
        assert_eq!(options.video.video_crf, 28);
        assert_eq!(options.video.video_codec, "libx264");
        assert_eq!(options.video.autopad.map(|p| p.color), Some("white".to_string()));
        assert_eq!(options.video.record_duration_limit, Some(60.0));
        assert!(!options.follow_new_tab);
    }

    #[test]
    fn test_autopad_flag() {
        let enabled: RecorderSettings = serde_json::from_str(r#"{ "autopad": true }"#).unwrap();
        assert_eq!(enabled.resolve().video.autopad, Some(Autopad::default()));

        let disabled: RecorderSettings = serde_json::from_str(r#"{ "autopad": false }"#).unwrap();
        assert_eq!(disabled.resolve().video.autopad, None);
    }

    #[test]
    fn test_save_and_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let settings = RecorderSettings {
            fps: Some(15),
            ffmpeg_path: Some("/usr/local/bin/ffmpeg".to_string()),
            ..RecorderSettings::default()
        };

        save_settings_to_file(&settings, &path).unwrap();
        let loaded = load_settings_from_file(&path).unwrap();
        assert_eq!(loaded, settings);

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"ffmpegPath\""));
    }

    #[test]
    fn test_invalid_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert!(matches!(
            load_settings_from_file(&path),
            Err(SettingsError::ParseError(_))
        ));
        assert!(matches!(
            load_settings_from_file(&dir.path().join("missing.json")),
            Err(SettingsError::ReadError(_))
        ));
    }
}
