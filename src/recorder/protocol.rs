//! Contract with the browser-automation driver.
//!
//! The recorder never talks to a browser directly. A driver implements
//! [`PageTarget`] for each tab and [`CaptureSession`] for each debugging
//! channel it opens, and pushes events into the receivers handed out by the
//! `subscribe*` methods.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::errors::ProtocolError;

/// Raw `Page.screencastFrame` event payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ScreencastFrameEvent {
    /// Base64-encoded image data.
    pub data: String,
    /// Capture timestamp in seconds. Frames without one are dropped.
    pub timestamp: Option<f64>,
    /// Sequence id that must be acknowledged before the next frame is sent.
    pub session_id: i64,
}

/// Tab lifecycle events.
pub enum PageEvent {
    /// The tab opened a new tab or window.
    Popup(Arc<dyn PageTarget>),
    Close,
}

impl std::fmt::Debug for PageEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PageEvent::Popup(_) => f.write_str("Popup"),
            PageEvent::Close => f.write_str("Close"),
        }
    }
}

/// A browser tab.
#[async_trait]
pub trait PageTarget: Send + Sync {
    /// Opens a new debugging session bound to this tab.
    async fn create_session(&self) -> Result<Arc<dyn CaptureSession>, ProtocolError>;

    /// Returns a receiver for this tab's lifecycle events.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<PageEvent>;
}

/// One debugging channel bound to one tab.
#[async_trait]
pub trait CaptureSession: Send + Sync {
    /// `Page.startScreencast` with `everyNthFrame: 1`.
    async fn start_screencast(&self) -> Result<(), ProtocolError>;

    /// `Page.stopScreencast`.
    async fn stop_screencast(&self) -> Result<(), ProtocolError>;

    /// `Page.screencastFrameAck`.
    async fn ack_frame(&self, session_id: i64) -> Result<(), ProtocolError>;

    async fn detach(&self) -> Result<(), ProtocolError>;

    /// Returns a receiver for `Page.screencastFrame` events on this session.
    fn subscribe_frames(&self) -> mpsc::UnboundedReceiver<ScreencastFrameEvent>;
}
