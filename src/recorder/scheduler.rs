use async_trait::async_trait;
use tokio::sync::mpsc;

use super::errors::{EncoderError, EncodingError};
use super::state::{transition, WriterEffect, WriterEvent, WriterState};
use super::types::{ScreenFrame, Timemark};

/// Maximum number of frames held for reordering.
pub const FRAME_BUFFER_CAPACITY: usize = 40;

/// Destination of the rate-expanded frame stream.
#[async_trait]
pub trait FrameSink: Send {
    /// Writes `frame` into the output stream `repeat` times.
    async fn write_frame(&mut self, frame: &ScreenFrame, repeat: u32) -> Result<(), EncodingError>;

    /// Ends the input stream and resolves to the completion result.
    async fn finish(&mut self) -> bool;

    /// Last progress reported by the encoder.
    fn progress(&self) -> Timemark;

    /// Errors the sink raises on its own while running. Can be taken once.
    fn take_error_events(&mut self) -> Option<mpsc::UnboundedReceiver<EncoderError>> {
        None
    }
}

/// Number of output frames a frame of `duration` seconds occupies at `fps`.
/// Always at least one.
pub fn replay_count(duration: f64, fps: u32) -> u32 {
    let count = (duration * f64::from(fps)).floor();
    if count.is_nan() || count < 1.0 {
        1
    } else {
        count as u32
    }
}

/// Reorders incoming frames by timestamp and expands them into a
/// constant-rate stream.
///
/// Frames are written one step behind: the newest processed frame (the
/// anchor) is held back until its successor is known, because its display
/// duration is the gap to that successor. On stop the anchor is held until
/// the stop time.
pub struct FrameScheduler<S: FrameSink> {
    sink: S,
    fps: u32,
    buffer: Vec<ScreenFrame>,
    anchor: Option<ScreenFrame>,
    state: WriterState,
    completion: Option<bool>,
}

impl<S: FrameSink> FrameScheduler<S> {
    pub fn new(sink: S, fps: u32) -> Self {
        Self {
            sink,
            fps,
            buffer: Vec::with_capacity(FRAME_BUFFER_CAPACITY),
            anchor: None,
            state: WriterState::NotStarted,
            completion: None,
        }
    }

    pub fn state(&self) -> WriterState {
        self.state
    }

    pub fn buffered(&self) -> impl Iterator<Item = &ScreenFrame> {
        self.buffer.iter()
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Encoder progress as `HH:MM:SS:FF`, `00:00:00:00` before any progress.
    pub fn duration(&self) -> String {
        self.sink.progress().to_string()
    }

    /// Places `frame` in timestamp order. A full buffer first flushes its
    /// oldest half to the sink.
    pub async fn insert(&mut self, frame: ScreenFrame) -> Result<(), EncodingError> {
        if self.state == WriterState::Completed {
            tracing::debug!(target: "screencast", "[SCHEDULER] Frame after stop dropped");
            return Ok(());
        }

        if self.buffer.len() >= FRAME_BUFFER_CAPACITY {
            let oldest: Vec<ScreenFrame> = self.buffer.drain(..FRAME_BUFFER_CAPACITY / 2).collect();
            self.flush(oldest).await?;
        }

        // Compared after the flush, which moves the anchor forward
        if let Some(anchor) = &self.anchor {
            if frame.timestamp < anchor.timestamp {
                tracing::debug!(target: "screencast",
                    "[SCHEDULER] Frame at {:.3} arrived after {:.3} was flushed, dropping",
                    frame.timestamp, anchor.timestamp);
                return Ok(());
            }
        }

        let index = self.find_slot(frame.timestamp);
        self.buffer.insert(index, frame);
        Ok(())
    }

    /// Scans from the tail; frames usually arrive nearly in order.
    fn find_slot(&self, timestamp: f64) -> usize {
        let mut index = self.buffer.len();
        while index > 0 && timestamp <= self.buffer[index - 1].timestamp {
            index -= 1;
        }
        index
    }

    async fn flush(&mut self, frames: Vec<ScreenFrame>) -> Result<(), EncodingError> {
        for frame in frames {
            if let Some(previous) = self.anchor.take() {
                let duration = frame.timestamp - previous.timestamp;
                self.write(previous.with_duration(duration)).await?;
            }
            self.anchor = Some(frame);
        }
        Ok(())
    }

    async fn write(&mut self, frame: ScreenFrame) -> Result<(), EncodingError> {
        let repeat = replay_count(frame.duration.unwrap_or(0.0), self.fps);
        self.sink.write_frame(&frame, repeat).await?;
        let (state, _) = transition(self.state, WriterEvent::FrameWritten);
        self.state = state;
        Ok(())
    }

    async fn drain(&mut self, stopped_at: f64) -> Result<(), EncodingError> {
        let remaining = std::mem::take(&mut self.buffer);
        self.flush(remaining).await?;

        if let Some(last) = self.anchor.take() {
            let duration = stopped_at - last.timestamp;
            self.write(last.with_duration(duration)).await?;
        }
        Ok(())
    }

    /// Flushes everything, holds the last frame until `stopped_at` (seconds,
    /// same clock as the frame timestamps) and finishes the sink.
    ///
    /// Idempotent: later calls return the cached completion result.
    pub async fn stop(&mut self, stopped_at: f64) -> bool {
        let (state, effects) = transition(self.state, WriterEvent::StopRequested);
        self.state = state;

        let mut drained = true;
        for effect in effects {
            match effect {
                WriterEffect::DrainBuffer => {
                    if let Err(e) = self.drain(stopped_at).await {
                        tracing::error!(target: "screencast", "[SCHEDULER] Failed to drain frames: {}", e);
                        drained = false;
                    }
                }
                WriterEffect::FinishEncoder => {
                    let finished = self.sink.finish().await;
                    self.completion = Some(finished && drained);
                    tracing::info!(target: "screencast",
                        "[SCHEDULER] Stopped, success={}, duration={}",
                        finished && drained, self.duration());
                }
                WriterEffect::ReturnCachedResult => {}
            }
        }

        self.completion.unwrap_or(false)
    }
}
