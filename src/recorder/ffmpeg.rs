use std::path::Path;
use std::process::{Command, Stdio};

use super::errors::EncodingError;
use super::types::{VideoFormat, VideoOptions};

/// Message ffmpeg reports when its stdin closes. Expected on shutdown.
pub const INPUT_PIPE_CLOSED: &str = "pipe:0: End of file";

/// Lets a non-seekable consumer read the MP4 incrementally.
pub const FRAGMENTED_MP4_FLAGS: &str = "+frag_keyframe+separate_moof+omit_tfhd_offset+empty_moov";

const PROGRESS_KEYS: &[&str] = &[
    "frame",
    "fps",
    "bitrate",
    "total_size",
    "out_time_us",
    "out_time_ms",
    "out_time",
    "dup_frames",
    "drop_frames",
    "speed",
    "progress",
];

/// Where ffmpeg writes the encoded video.
#[derive(Debug, Clone, Copy)]
pub enum OutputTarget<'a> {
    File { path: &'a Path, format: VideoFormat },
    /// Fragmented MP4 on stdout.
    Pipe,
}

/// `options.ffmpeg_path`, then `FFMPEG_PATH`, then `ffmpeg` from `PATH`.
pub fn resolve_ffmpeg_path(options: &VideoOptions) -> String {
    options
        .ffmpeg_path
        .clone()
        .or_else(|| std::env::var("FFMPEG_PATH").ok().filter(|p| !p.trim().is_empty()))
        .unwrap_or_else(|| "ffmpeg".to_string())
}

pub fn check_ffmpeg(ffmpeg_path: &str) -> Result<(), EncodingError> {
    Command::new(ffmpeg_path)
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map_err(|_| EncodingError::FfmpegNotFound(ffmpeg_path.to_string()))?;
    Ok(())
}

/// Leaves one core for the capture side.
pub fn encoder_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .saturating_sub(1)
        .max(1)
}

fn video_filter(options: &VideoOptions) -> Option<String> {
    let aspect = options.aspect_ratio.as_str().replace(':', "/");
    let size = options
        .video_frame
        .width
        .zip(options.video_frame.height);

    match (size, &options.autopad) {
        (Some((w, h)), Some(pad)) => Some(format!(
            "scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2:{color}",
            w = w,
            h = h,
            color = pad.color
        )),
        (Some((w, h)), None) => Some(format!("scale={}:{}", w, h)),
        (None, Some(pad)) => Some(format!(
            "pad=w='max(iw,ih*{a})':h='max(ih,iw/({a}))':x=(ow-iw)/2:y=(oh-ih)/2:color={color}",
            a = aspect,
            color = pad.color
        )),
        (None, None) => None,
    }
}

/// Builds the ffmpeg command line for an `image2pipe` input on stdin.
pub fn build_args(options: &VideoOptions, fps: u32, target: OutputTarget<'_>) -> Vec<String> {
    let bitrate = format!("{}k", options.video_bitrate);
    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-nostats".into(),
        "-progress".into(),
        "pipe:2".into(),
    ];

    args.extend([
        "-f".into(),
        "image2pipe".into(),
        "-framerate".into(),
        fps.to_string(),
        "-i".into(),
        "pipe:0".into(),
    ]);

    let is_webm = matches!(
        target,
        OutputTarget::File {
            format: VideoFormat::Webm,
            ..
        }
    );

    if is_webm {
        args.extend([
            "-c:v".into(),
            "libvpx".into(),
            "-b:v".into(),
            bitrate.clone(),
            "-flags".into(),
            "+global_header".into(),
            "-psnr".into(),
        ]);
    } else {
        args.extend(["-c:v".into(), options.video_codec.clone()]);
    }

    if let Some(filter) = video_filter(options) {
        args.extend(["-vf".into(), filter]);
    }

    args.extend([
        "-aspect".into(),
        options.aspect_ratio.as_str().into(),
        "-crf".into(),
        options.video_crf.to_string(),
        "-preset".into(),
        options.video_preset.clone(),
        "-pix_fmt".into(),
        options.video_pixel_format.clone(),
        "-minrate".into(),
        bitrate.clone(),
        "-maxrate".into(),
        bitrate,
        "-bufsize".into(),
        format!("{}k", options.video_bitrate.saturating_mul(2)),
        "-threads".into(),
        encoder_threads().to_string(),
    ]);

    if let Some(limit) = options.record_duration_limit {
        args.extend(["-t".into(), format!("{:.3}", limit)]);
    }

    match target {
        OutputTarget::File { path, .. } => {
            args.extend(["-y".into(), path.to_string_lossy().to_string()]);
        }
        OutputTarget::Pipe => {
            args.extend([
                "-f".into(),
                "mp4".into(),
                "-movflags".into(),
                FRAGMENTED_MP4_FLAGS.into(),
                "pipe:1".into(),
            ]);
        }
    }

    args
}

/// True for `key=value` lines written by `-progress`.
pub fn is_progress_line(line: &str) -> bool {
    line.split_once('=')
        .map(|(key, _)| PROGRESS_KEYS.contains(&key.trim()) || key.starts_with("stream_"))
        .unwrap_or(false)
}

/// Parses `out_time=HH:MM:SS.ffffff` into milliseconds.
pub fn parse_progress_millis(line: &str) -> Option<u64> {
    let value = line.trim().strip_prefix("out_time=")?;
    let mut parts = value.split(':');
    let hours: u64 = parts.next()?.parse().ok()?;
    let minutes: u64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || seconds < 0.0 {
        return None;
    }
    Some((hours * 3600 + minutes * 60) * 1000 + (seconds * 1000.0).round() as u64)
}

pub fn is_input_pipe_closed(message: &str) -> bool {
    message.contains(INPUT_PIPE_CLOSED)
}
