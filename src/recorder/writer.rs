use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use super::errors::{DestinationError, EncoderError, EncodingError, RecorderError};
use super::ffmpeg::{
    build_args, check_ffmpeg, is_input_pipe_closed, is_progress_line, parse_progress_millis,
    resolve_ffmpeg_path, OutputTarget,
};
use super::scheduler::FrameSink;
use super::state::{SharedWriterState, WriterState};
use super::types::{ScreenFrame, Timemark, VideoFormat, VideoOptions};

/// Pending frame messages between the scheduler and the writer thread.
pub const FEED_CAPACITY: usize = 64;
/// How long a frame send may wait on a full feed before the writer is
/// considered stalled.
pub const FEED_TIMEOUT: Duration = Duration::from_secs(5);

const STDERR_TAIL_LINES: usize = 32;

/// Caller-owned byte sink that receives a fragmented MP4 stream.
pub trait OutputStream: Write + Send + 'static {
    /// Whether the sink can still accept bytes. Checked once at construction.
    fn is_writable(&self) -> bool {
        true
    }

    /// Called when the encode fails. The sink is not flushed in that case.
    fn on_error(&mut self, _error: &EncoderError) {}
}

impl OutputStream for std::fs::File {}

pub enum Destination {
    File(PathBuf),
    Stream(Box<dyn OutputStream>),
}

impl Destination {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Destination::File(path.into())
    }

    pub fn stream(stream: impl OutputStream) -> Self {
        Destination::Stream(Box::new(stream))
    }
}

/// Checks the destination without touching ffmpeg.
pub fn validate_destination(destination: &Destination) -> Result<(), DestinationError> {
    match destination {
        Destination::File(path) => {
            if VideoFormat::from_path(path).is_none() {
                let ext = path
                    .extension()
                    .map(|e| e.to_string_lossy().to_string())
                    .unwrap_or_default();
                return Err(DestinationError::UnsupportedFormat(ext));
            }
            Ok(())
        }
        Destination::Stream(stream) => {
            if !stream.is_writable() {
                return Err(DestinationError::InvalidDestination);
            }
            Ok(())
        }
    }
}

enum FeedMessage {
    Frame { image: Bytes, repeat: u32 },
    EndOfStream,
}

/// RAII guard killing the ffmpeg process if the writer thread exits without
/// reaping it.
struct WriterGuard {
    child: Option<Child>,
}

impl WriterGuard {
    fn new(child: Child) -> Self {
        Self { child: Some(child) }
    }

    /// Waits for ffmpeg to exit. Drop will not kill after this.
    fn wait(&mut self) -> Option<std::io::Result<ExitStatus>> {
        let mut child = self.child.take()?;
        Some(child.wait())
    }
}

impl Drop for WriterGuard {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            tracing::warn!(target: "screencast", "[WRITER] WriterGuard dropping with FFmpeg still running, killing");
            if let Err(e) = child.kill() {
                tracing::warn!(target: "screencast", "[WRITER] Failed to kill FFmpeg: {}", e);
            }
            let _ = child.wait();
        }
    }
}

/// Feeds the expanded image stream into an ffmpeg subprocess.
pub struct EncoderSink {
    feed_tx: Option<mpsc::Sender<FeedMessage>>,
    completion_rx: Option<oneshot::Receiver<bool>>,
    completion: Option<bool>,
    error_rx: Option<mpsc::UnboundedReceiver<EncoderError>>,
    progress_millis: Arc<AtomicU64>,
    status: SharedWriterState,
    fps: u32,
}

impl EncoderSink {
    /// Validates the destination and options, then starts ffmpeg.
    ///
    /// Validation errors are returned before any process is spawned.
    pub fn create(destination: Destination, options: &VideoOptions) -> Result<Self, RecorderError> {
        validate_destination(&destination)?;
        let fps = options
            .fps
            .filter(|fps| *fps > 0)
            .ok_or(EncodingError::MissingFrameRate)?;

        let ffmpeg_path = resolve_ffmpeg_path(options);
        check_ffmpeg(&ffmpeg_path)?;

        let (args, stream) = match destination {
            Destination::File(path) => {
                let format = VideoFormat::from_path(&path)
                    .ok_or_else(|| DestinationError::UnsupportedFormat(path.display().to_string()))?;
                (build_args(options, fps, OutputTarget::File { path: &path, format }), None)
            }
            Destination::Stream(stream) => (build_args(options, fps, OutputTarget::Pipe), Some(stream)),
        };

        tracing::info!(target: "screencast",
            "[WRITER] Starting FFmpeg: {} @ {}fps, size={}, codec={}, preset={}, crf={}, streaming={}",
            ffmpeg_path,
            fps,
            options.video_frame.size_arg().unwrap_or_else(|| "source".to_string()),
            options.video_codec,
            options.video_preset,
            options.video_crf,
            stream.is_some());
        tracing::debug!(target: "screencast", "[WRITER] FFmpeg args: {:?}", args);

        let mut child = Command::new(&ffmpeg_path)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(if stream.is_some() { Stdio::piped() } else { Stdio::null() })
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => EncodingError::FfmpegNotFound(ffmpeg_path.clone()),
                _ => EncodingError::SpawnFailed(e.to_string()),
            })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let guard = WriterGuard::new(child);

        let stdin = stdin
            .ok_or_else(|| EncodingError::SpawnFailed("Failed to capture FFmpeg stdin".to_string()))?;

        let progress_millis = Arc::new(AtomicU64::new(0));
        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let stderr_handle = stderr.map(|stderr| {
            spawn_stderr_reader(stderr, Arc::clone(&progress_millis), Arc::clone(&stderr_tail))
        });

        let stdout_handle = match (stdout, stream) {
            (Some(mut stdout), Some(mut stream)) => Some(std::thread::spawn(move || {
                let copied = std::io::copy(&mut stdout, &mut stream);
                (stream, copied)
            })),
            _ => None,
        };

        let (feed_tx, feed_rx) = mpsc::channel(FEED_CAPACITY);
        let (completion_tx, completion_rx) = oneshot::channel();
        let (error_tx, error_rx) = mpsc::unbounded_channel();
        let status = SharedWriterState::default();

        let worker = WriterWorker {
            guard,
            stdin: Some(stdin),
            feed_rx,
            status: status.clone(),
            stderr_tail,
            stderr_handle,
            stdout_handle,
            error_tx,
            frames_received: 0,
            frames_written: 0,
            reported: false,
        };
        std::thread::spawn(move || {
            let result = worker.run();
            let _ = completion_tx.send(result);
        });

        Ok(Self {
            feed_tx: Some(feed_tx),
            completion_rx: Some(completion_rx),
            completion: None,
            error_rx: Some(error_rx),
            progress_millis,
            status,
            fps,
        })
    }

    pub fn state(&self) -> WriterState {
        self.status.get()
    }
}

#[async_trait]
impl FrameSink for EncoderSink {
    async fn write_frame(&mut self, frame: &ScreenFrame, repeat: u32) -> Result<(), EncodingError> {
        let feed_tx = self.feed_tx.as_ref().ok_or(EncodingError::WriterDisconnected)?;
        self.status.set(WriterState::InProgress);

        let message = FeedMessage::Frame {
            image: frame.blob.clone(),
            repeat,
        };
        match tokio::time::timeout(FEED_TIMEOUT, feed_tx.send(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(EncodingError::WriterDisconnected),
            Err(_) => Err(EncodingError::WriterStalled(FEED_TIMEOUT)),
        }
    }

    async fn finish(&mut self) -> bool {
        if let Some(result) = self.completion {
            return result;
        }

        self.status.set(WriterState::Completed);
        if let Some(feed_tx) = self.feed_tx.take() {
            let _ = feed_tx.send(FeedMessage::EndOfStream).await;
        }

        let result = match self.completion_rx.take() {
            Some(rx) => rx.await.unwrap_or(false),
            None => false,
        };
        self.completion = Some(result);
        result
    }

    fn progress(&self) -> Timemark {
        Timemark::from_millis(self.progress_millis.load(Ordering::SeqCst), self.fps)
    }

    fn take_error_events(&mut self) -> Option<mpsc::UnboundedReceiver<EncoderError>> {
        self.error_rx.take()
    }
}

fn spawn_stderr_reader(
    stderr: std::process::ChildStderr,
    progress_millis: Arc<AtomicU64>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        for line in BufReader::new(stderr).lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    tracing::warn!(target: "screencast", "[WRITER] Failed to read FFmpeg stderr: {}", e);
                    break;
                }
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            if is_progress_line(trimmed) {
                if let Some(millis) = parse_progress_millis(trimmed) {
                    progress_millis.store(millis, Ordering::SeqCst);
                }
                continue;
            }

            tracing::debug!(target: "screencast", "[WRITER] ffmpeg: {}", trimmed);
            if let Ok(mut tail) = stderr_tail.lock() {
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(trimmed.to_string());
            }
        }
    })
}

type StdoutHandle = JoinHandle<(Box<dyn OutputStream>, std::io::Result<u64>)>;

/// State owned by the writer thread.
struct WriterWorker {
    guard: WriterGuard,
    stdin: Option<ChildStdin>,
    feed_rx: mpsc::Receiver<FeedMessage>,
    status: SharedWriterState,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    stderr_handle: Option<JoinHandle<()>>,
    stdout_handle: Option<StdoutHandle>,
    error_tx: mpsc::UnboundedSender<EncoderError>,
    /// Frame messages taken off the feed, written or not.
    frames_received: u64,
    frames_written: u64,
    reported: bool,
}

impl WriterWorker {
    fn run(mut self) -> bool {
        let mut exit_status = None;

        while let Some(message) = self.feed_rx.blocking_recv() {
            match message {
                FeedMessage::Frame { image, repeat } => {
                    self.frames_received += 1;
                    if self.write_repeated(&image, repeat).is_err() && exit_status.is_none() {
                        // ffmpeg stopped reading: either the duration cap was
                        // reached or it died. Reap it now so a failure is
                        // reported while the recording is still running.
                        self.stdin = None;
                        let status = self.reap();
                        if let Some(error) = self.failure(&status) {
                            self.report(error);
                        }
                        exit_status = Some(status);
                    }
                }
                FeedMessage::EndOfStream => break,
            }
        }

        tracing::debug!(target: "screencast",
            "[WRITER] End of input after {} frames, waiting for FFmpeg to finish...", self.frames_written);
        self.stdin = None;
        let status = match exit_status {
            Some(status) => status,
            None => self.reap(),
        };

        let stream = self.join_stdout();

        if self.frames_received == 0 {
            tracing::info!(target: "screencast", "[WRITER] No frames were recorded");
            return true;
        }

        match self.failure(&status) {
            None => {
                if let Some(mut stream) = stream {
                    if let Err(e) = stream.flush() {
                        tracing::warn!(target: "screencast", "[WRITER] Failed to flush output stream: {}", e);
                    }
                }
                tracing::info!(target: "screencast", "[WRITER] FFmpeg complete, {} frames written", self.frames_written);
                true
            }
            Some(error) => {
                if let Some(mut stream) = stream {
                    stream.on_error(&error);
                }
                self.report(error);
                false
            }
        }
    }

    fn write_repeated(&mut self, image: &[u8], repeat: u32) -> std::io::Result<()> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Ok(());
        };
        for _ in 0..repeat {
            if let Err(e) = stdin.write_all(image) {
                tracing::debug!(target: "screencast", "[WRITER] FFmpeg input closed: {}", e);
                return Err(e);
            }
            self.frames_written += 1;
        }
        Ok(())
    }

    /// Waits for ffmpeg and its stderr reader.
    fn reap(&mut self) -> std::io::Result<ExitStatus> {
        let status = self
            .guard
            .wait()
            .unwrap_or_else(|| Err(std::io::Error::other("FFmpeg child already reaped")));
        if let Some(handle) = self.stderr_handle.take() {
            let _ = handle.join();
        }
        status
    }

    fn join_stdout(&mut self) -> Option<Box<dyn OutputStream>> {
        let handle = self.stdout_handle.take()?;
        match handle.join() {
            Ok((stream, Ok(bytes))) => {
                tracing::debug!(target: "screencast", "[WRITER] Streamed {} bytes to output", bytes);
                Some(stream)
            }
            Ok((stream, Err(e))) => {
                tracing::warn!(target: "screencast", "[WRITER] Failed to stream output: {}", e);
                Some(stream)
            }
            Err(_) => None,
        }
    }

    fn failure(&self, status: &std::io::Result<ExitStatus>) -> Option<EncoderError> {
        let message = match status {
            Ok(status) if status.success() => return None,
            Ok(status) => {
                let tail = self
                    .stderr_tail
                    .lock()
                    .map(|tail| tail.iter().map(String::as_str).collect::<Vec<_>>().join("\n"))
                    .unwrap_or_default();
                let exit_code = status.code().unwrap_or(-1);
                EncodingError::ProcessFailed {
                    exit_code,
                    stderr: tail,
                }
                .to_string()
            }
            Err(e) => format!("FFmpeg wait failed: {}", e),
        };

        Some(EncoderError {
            expected_shutdown: self.status.get() != WriterState::InProgress
                && is_input_pipe_closed(&message),
            message,
        })
    }

    fn report(&mut self, error: EncoderError) {
        if self.reported {
            return;
        }
        self.reported = true;

        if error.expected_shutdown {
            tracing::debug!(target: "screencast", "[WRITER] Input pipe closed on shutdown: {}", error.message);
        } else {
            tracing::error!(target: "screencast", "[WRITER] {}", error);
        }
        let _ = self.error_tx.send(error);
    }
}
