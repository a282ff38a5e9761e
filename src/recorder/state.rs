//! Pure state machine for the writer lifecycle.
//!
//! `(WriterState, WriterEvent) -> (WriterState, Vec<WriterEffect>)`
//!
//! Invalid transitions return the current state with empty effects. Encoder
//! failures do not get their own state: they collapse into `Completed` with a
//! failed completion result.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriterState {
    #[default]
    NotStarted,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterEvent {
    /// Frames were written to the sink.
    FrameWritten,
    StopRequested,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterEffect {
    /// Flush the buffer and hold the last frame until the stop time.
    DrainBuffer,
    /// Close the encoder input and wait for its completion result.
    FinishEncoder,
    /// Stop already ran; hand back the cached completion result.
    ReturnCachedResult,
}

pub fn transition(state: WriterState, event: WriterEvent) -> (WriterState, Vec<WriterEffect>) {
    match (state, event) {
        (WriterState::NotStarted | WriterState::InProgress, WriterEvent::FrameWritten) => {
            (WriterState::InProgress, vec![])
        }

        (WriterState::NotStarted | WriterState::InProgress, WriterEvent::StopRequested) => (
            WriterState::Completed,
            vec![WriterEffect::DrainBuffer, WriterEffect::FinishEncoder],
        ),

        (WriterState::Completed, WriterEvent::StopRequested) => {
            (WriterState::Completed, vec![WriterEffect::ReturnCachedResult])
        }

        // Writes after stop are dropped
        (WriterState::Completed, WriterEvent::FrameWritten) => (state, vec![]),
    }
}

/// Writer state shared between the sink handle and its worker threads.
#[derive(Debug, Clone, Default)]
pub struct SharedWriterState(Arc<AtomicU8>);

impl SharedWriterState {
    pub fn get(&self) -> WriterState {
        match self.0.load(Ordering::SeqCst) {
            0 => WriterState::NotStarted,
            1 => WriterState::InProgress,
            _ => WriterState::Completed,
        }
    }

    pub fn set(&self, state: WriterState) {
        let raw = match state {
            WriterState::NotStarted => 0,
            WriterState::InProgress => 1,
            WriterState::Completed => 2,
        };
        self.0.store(raw, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_write_starts_progress() {
        let (state, effects) = transition(WriterState::NotStarted, WriterEvent::FrameWritten);
        assert_eq!(state, WriterState::InProgress);
        assert!(effects.is_empty());
    }

    #[test]
    fn test_stop_drains_then_finishes() {
        let (state, effects) = transition(WriterState::InProgress, WriterEvent::StopRequested);
        assert_eq!(state, WriterState::Completed);
        assert_eq!(
            effects,
            vec![WriterEffect::DrainBuffer, WriterEffect::FinishEncoder]
        );
    }

    #[test]
    fn test_stop_without_frames_still_finishes() {
        let (state, effects) = transition(WriterState::NotStarted, WriterEvent::StopRequested);
        assert_eq!(state, WriterState::Completed);
        assert!(effects.contains(&WriterEffect::FinishEncoder));
    }

    #[test]
    fn test_second_stop_returns_cached_result() {
        let (state, effects) = transition(WriterState::Completed, WriterEvent::StopRequested);
        assert_eq!(state, WriterState::Completed);
        assert_eq!(effects, vec![WriterEffect::ReturnCachedResult]);
    }

    #[test]
    fn test_write_after_stop_is_noop() {
        let (state, effects) = transition(WriterState::Completed, WriterEvent::FrameWritten);
        assert_eq!(state, WriterState::Completed);
        assert!(effects.is_empty());
    }

    #[test]
    fn test_shared_state_round_trips() {
        let shared = SharedWriterState::default();
        assert_eq!(shared.get(), WriterState::NotStarted);
        let clone = shared.clone();
        clone.set(WriterState::InProgress);
        assert_eq!(shared.get(), WriterState::InProgress);
    }
}
