//! ScreenRecorder - single owner actor for a recording.
//!
//! The coordinator task owns the collector handle and the frame scheduler.
//! Frames, encoder errors and primary-tab close all arrive as messages, so
//! the frame buffer is never shared.
//!
//! A recording ends on an explicit `stop()`, when the primary tab closes, or
//! when the encoder reports an unexpected error. Every path runs the same
//! shutdown: collector first, then the scheduler at the current wall-clock
//! time.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, oneshot};

use super::collector::{CollectorOutputs, ScreencastCollector};
use super::errors::{EncoderError, EncodingError, RecorderError};
use super::protocol::PageTarget;
use super::scheduler::{FrameScheduler, FrameSink};
use super::types::{RecorderOptions, ScreenFrame};
use super::writer::{Destination, EncoderSink};

/// Commands sent from the handle to the coordinator task.
#[derive(Debug)]
enum Command {
    Stop {
        response_tx: oneshot::Sender<bool>,
    },
    Duration {
        response_tx: oneshot::Sender<String>,
    },
}

/// Signals a recording reports while it runs.
#[derive(Debug, Clone, PartialEq)]
pub enum RecorderEvent {
    EncoderError(EncoderError),
    PrimaryTabClosed,
    /// The recording finished, on request or on its own.
    Stopped { success: bool, duration: String },
}

pub struct ScreenRecorder {
    command_tx: mpsc::Sender<Command>,
    events_rx: Option<mpsc::UnboundedReceiver<RecorderEvent>>,
    stopped: Option<bool>,
    final_duration: Option<String>,
}

impl ScreenRecorder {
    /// Starts recording `page` into `sink`.
    pub async fn start<S>(
        page: Arc<dyn PageTarget>,
        mut sink: S,
        options: &RecorderOptions,
    ) -> Result<Self, RecorderError>
    where
        S: FrameSink + 'static,
    {
        let fps = options
            .video
            .fps
            .filter(|fps| *fps > 0)
            .ok_or(EncodingError::MissingFrameRate)?;

        let encoder_errors = sink.take_error_events();
        let (collector, outputs) = ScreencastCollector::start(page, options.follow_new_tab).await;
        let (command_tx, command_rx) = mpsc::channel(8);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        tracing::info!(target: "screencast",
            "[COORDINATOR] Recording started @ {}fps, follow_new_tab={}", fps, options.follow_new_tab);

        let coordinator = Coordinator {
            collector,
            scheduler: FrameScheduler::new(sink, fps),
            outputs,
            encoder_errors,
            command_rx,
            events_tx,
            result: None,
        };
        tokio::spawn(coordinator.run());

        Ok(Self {
            command_tx,
            events_rx: Some(events_rx),
            stopped: None,
            final_duration: None,
        })
    }

    /// Starts recording `page` into ffmpeg, writing to `destination`.
    pub async fn record_to(
        page: Arc<dyn PageTarget>,
        destination: Destination,
        options: &RecorderOptions,
    ) -> Result<Self, RecorderError> {
        let sink = EncoderSink::create(destination, &options.video)?;
        Self::start(page, sink, options).await
    }

    /// Receiver for recording events. Can be taken once.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<RecorderEvent>> {
        self.events_rx.take()
    }

    /// Stops the recording and resolves to whether the output is complete.
    ///
    /// Idempotent. A recording that already ended on its own returns that
    /// result.
    pub async fn stop(&mut self) -> bool {
        if let Some(stopped) = self.stopped {
            return stopped;
        }

        let (response_tx, response_rx) = oneshot::channel();
        let result = if self.command_tx.send(Command::Stop { response_tx }).await.is_err() {
            tracing::warn!(target: "screencast", "[COORDINATOR] Coordinator gone before stop");
            false
        } else {
            response_rx.await.unwrap_or(false)
        };

        self.final_duration = Some(self.query_duration().await);
        self.stopped = Some(result);
        result
    }

    /// Encoded duration as `HH:MM:SS:FF`.
    pub async fn duration(&self) -> String {
        match &self.final_duration {
            Some(duration) => duration.clone(),
            None => self.query_duration().await,
        }
    }

    async fn query_duration(&self) -> String {
        let (response_tx, response_rx) = oneshot::channel();
        if self.command_tx.send(Command::Duration { response_tx }).await.is_err() {
            return "00:00:00:00".to_string();
        }
        response_rx.await.unwrap_or_else(|_| "00:00:00:00".to_string())
    }
}

impl Drop for ScreenRecorder {
    fn drop(&mut self) {
        if self.stopped.is_none() {
            tracing::warn!(target: "screencast", "[COORDINATOR] Recorder dropped without stop");
        }
    }
}

struct Coordinator<S: FrameSink> {
    collector: ScreencastCollector,
    scheduler: FrameScheduler<S>,
    outputs: CollectorOutputs,
    encoder_errors: Option<mpsc::UnboundedReceiver<EncoderError>>,
    command_rx: mpsc::Receiver<Command>,
    events_tx: mpsc::UnboundedSender<RecorderEvent>,
    result: Option<bool>,
}

impl<S: FrameSink + 'static> Coordinator<S> {
    async fn run(mut self) {
        let mut primary_open = true;

        loop {
            let running = self.result.is_none();

            tokio::select! {
                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(Command::Stop { response_tx }) => {
                            let result = self.shutdown().await;
                            let _ = response_tx.send(result);
                        }
                        Some(Command::Duration { response_tx }) => {
                            let _ = response_tx.send(self.scheduler.duration());
                        }
                        None => {
                            // Handle dropped; finish what was recorded
                            self.shutdown().await;
                            break;
                        }
                    }
                }

                Some(frame) = self.outputs.frames.recv(), if running => {
                    self.handle_frame(frame).await;
                }

                Some(error) = recv_error(&mut self.encoder_errors), if running => {
                    self.handle_encoder_error(error).await;
                }

                closed = &mut self.outputs.primary_closed, if running && primary_open => {
                    primary_open = false;
                    if closed.is_ok() {
                        tracing::info!(target: "screencast", "[COORDINATOR] Primary tab closed, stopping");
                        let _ = self.events_tx.send(RecorderEvent::PrimaryTabClosed);
                        self.shutdown().await;
                    }
                }
            }
        }

        tracing::debug!(target: "screencast", "[COORDINATOR] Shutting down");
    }

    async fn handle_frame(&mut self, frame: ScreenFrame) {
        if let Err(e) = self.scheduler.insert(frame).await {
            tracing::error!(target: "screencast", "[COORDINATOR] Failed to feed encoder: {}", e);
            let error = EncoderError {
                message: e.to_string(),
                expected_shutdown: false,
            };
            let _ = self.events_tx.send(RecorderEvent::EncoderError(error));
            self.shutdown().await;
        }
    }

    async fn handle_encoder_error(&mut self, error: EncoderError) {
        let expected = error.expected_shutdown;
        let _ = self.events_tx.send(RecorderEvent::EncoderError(error));
        if !expected {
            tracing::warn!(target: "screencast", "[COORDINATOR] Encoder failed, stopping recording");
            self.shutdown().await;
        }
    }

    /// Runs once; later calls return the first result.
    async fn shutdown(&mut self) -> bool {
        if let Some(result) = self.result {
            return result;
        }

        let collector_stopped = self.collector.stop().await;
        if !collector_stopped {
            tracing::warn!(target: "screencast", "[COORDINATOR] Collector did not stop cleanly");
        }

        // Frames the collector forwarded before it stopped still belong to
        // the recording
        while let Ok(frame) = self.outputs.frames.try_recv() {
            if let Err(e) = self.scheduler.insert(frame).await {
                tracing::error!(target: "screencast", "[COORDINATOR] Failed to feed encoder: {}", e);
                break;
            }
        }

        let result = self.scheduler.stop(wall_clock_secs()).await;
        self.result = Some(result);

        let duration = self.scheduler.duration();
        tracing::info!(target: "screencast",
            "[COORDINATOR] Recording stopped, success={}, duration={}", result, duration);
        let _ = self.events_tx.send(RecorderEvent::Stopped {
            success: result,
            duration,
        });
        result
    }
}

async fn recv_error(
    errors: &mut Option<mpsc::UnboundedReceiver<EncoderError>>,
) -> Option<EncoderError> {
    match errors {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Seconds since the Unix epoch, the clock protocol frame timestamps use.
pub fn wall_clock_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}
