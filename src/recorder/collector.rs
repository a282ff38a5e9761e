//! ScreencastCollector - single owner actor for capture sessions.
//!
//! The collector attaches to the primary tab, follows popup tabs with a stack
//! of sessions (only the top one streams), acknowledges every frame and
//! forwards decoded frames to its subscriber.
//!
//! Architecture:
//! - `ScreencastCollector` is the handle; `stop` sends a Command to the actor
//! - Forwarder tasks pump driver receivers (page events, frame events) into
//!   the actor's event channel, tagged with the page or session they came from
//! - The actor task is the only place the session stack is touched

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::protocol::{CaptureSession, PageEvent, PageTarget, ScreencastFrameEvent};
use super::types::ScreenFrame;

/// Upper bound on how long `stop` waits for the last frame acknowledgment.
pub const ACK_SETTLE_TIMEOUT: Duration = Duration::from_secs(1);

const PRIMARY_PAGE: PageId = PageId(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PageId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SessionId(u64);

/// Commands sent from the handle to the actor.
#[derive(Debug)]
enum Command {
    Stop { response_tx: oneshot::Sender<bool> },
}

/// Events pumped into the actor by forwarder tasks.
#[derive(Debug)]
enum InternalEvent {
    Frame {
        session: SessionId,
        event: ScreencastFrameEvent,
    },
    Page {
        page: PageId,
        event: PageEvent,
    },
}

struct StackEntry {
    id: SessionId,
    page: PageId,
    session: Arc<dyn CaptureSession>,
}

/// Stack of capture sessions. The top entry is the only one streaming.
#[derive(Default)]
struct SessionStack {
    entries: Vec<StackEntry>,
}

impl SessionStack {
    fn push(&mut self, entry: StackEntry) {
        self.entries.push(entry);
    }

    fn top(&self) -> Option<&StackEntry> {
        self.entries.last()
    }

    fn get(&self, id: SessionId) -> Option<&StackEntry> {
        self.entries.iter().find(|entry| entry.id == id)
    }

    /// Removes the entry with `id`. Returns it and whether it was the top.
    fn remove(&mut self, id: SessionId) -> Option<(StackEntry, bool)> {
        let index = self.entries.iter().position(|entry| entry.id == id)?;
        let was_top = index + 1 == self.entries.len();
        Some((self.entries.remove(index), was_top))
    }

    fn sessions_for_page(&self, page: PageId) -> Vec<SessionId> {
        self.entries
            .iter()
            .filter(|entry| entry.page == page)
            .map(|entry| entry.id)
            .collect()
    }

    fn drain(&mut self) -> Vec<StackEntry> {
        std::mem::take(&mut self.entries)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Receivers handed to whoever consumes the collector's output.
pub struct CollectorOutputs {
    pub frames: mpsc::UnboundedReceiver<ScreenFrame>,
    /// Resolves when the primary tab closes.
    pub primary_closed: oneshot::Receiver<()>,
}

/// Handle to a running collector.
pub struct ScreencastCollector {
    command_tx: mpsc::Sender<Command>,
    stopped: Option<bool>,
}

impl ScreencastCollector {
    /// Attaches to `page` and starts streaming its frames.
    ///
    /// A page that refuses a debugging session is not fatal: the failure is
    /// logged and the collector simply produces no frames.
    pub async fn start(
        page: Arc<dyn PageTarget>,
        follow_new_tab: bool,
    ) -> (Self, CollectorOutputs) {
        let (command_tx, command_rx) = mpsc::channel(4);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (frame_tx, frames) = mpsc::unbounded_channel();
        let (closed_tx, primary_closed) = oneshot::channel();

        let mut actor = CollectorActor {
            page,
            follow_new_tab,
            stack: SessionStack::default(),
            next_page: 1,
            next_session: 0,
            pending_ack: None,
            streaming_ended: false,
            frame_tx,
            primary_closed_tx: Some(closed_tx),
            command_rx,
            event_rx,
            event_tx,
        };

        actor.attach_primary().await;
        tokio::spawn(actor.run());

        (
            Self {
                command_tx,
                stopped: None,
            },
            CollectorOutputs {
                frames,
                primary_closed,
            },
        )
    }

    /// Stops following tabs and detaches every session.
    ///
    /// Idempotent: later calls return the first call's result without
    /// touching the sessions again.
    pub async fn stop(&mut self) -> bool {
        if let Some(stopped) = self.stopped {
            return stopped;
        }

        let (response_tx, response_rx) = oneshot::channel();
        let result = if self.command_tx.send(Command::Stop { response_tx }).await.is_err() {
            tracing::warn!(target: "screencast", "[COLLECTOR] Actor gone before stop");
            false
        } else {
            response_rx.await.unwrap_or(false)
        };

        self.stopped = Some(result);
        result
    }
}

struct CollectorActor {
    page: Arc<dyn PageTarget>,
    follow_new_tab: bool,
    stack: SessionStack,
    next_page: u64,
    next_session: u64,
    pending_ack: Option<JoinHandle<()>>,
    streaming_ended: bool,
    frame_tx: mpsc::UnboundedSender<ScreenFrame>,
    primary_closed_tx: Option<oneshot::Sender<()>>,
    command_rx: mpsc::Receiver<Command>,
    event_rx: mpsc::UnboundedReceiver<InternalEvent>,
    event_tx: mpsc::UnboundedSender<InternalEvent>,
}

impl CollectorActor {
    async fn attach_primary(&mut self) {
        let page = Arc::clone(&self.page);
        self.start_session(page.as_ref(), PRIMARY_PAGE).await;
        self.forward_page_events(page.as_ref(), PRIMARY_PAGE);

        tracing::info!(target: "screencast",
            "[COLLECTOR] Started, sessions={}, follow_new_tab={}",
            self.stack.len(), self.follow_new_tab);
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(Command::Stop { response_tx }) => {
                            let result = self.stop().await;
                            let _ = response_tx.send(result);
                        }
                        None => {
                            tracing::debug!(target: "screencast", "[COLLECTOR] Handle dropped, releasing sessions");
                            self.stop().await;
                        }
                    }
                    break;
                }
                Some(event) = self.event_rx.recv() => {
                    self.handle_event(event).await;
                }
                else => {
                    tracing::info!(target: "screencast", "[COLLECTOR] All channels closed, shutting down");
                    break;
                }
            }
        }
    }

    async fn handle_event(&mut self, event: InternalEvent) {
        match event {
            InternalEvent::Frame { session, event } => self.handle_frame(session, event),
            InternalEvent::Page { page, event } => match event {
                PageEvent::Popup(popup) if page == PRIMARY_PAGE => {
                    if self.follow_new_tab && !self.streaming_ended {
                        self.attach_popup(popup).await;
                    }
                }
                PageEvent::Popup(_) => {}
                PageEvent::Close => self.handle_page_close(page).await,
            },
        }
    }

    async fn attach_popup(&mut self, popup: Arc<dyn PageTarget>) {
        let page_id = PageId(self.next_page);
        self.next_page += 1;

        tracing::info!(target: "screencast", "[COLLECTOR] Following popup tab {:?}", page_id);

        if self.start_session(popup.as_ref(), page_id).await {
            self.forward_page_events(popup.as_ref(), page_id);
        }
    }

    async fn handle_page_close(&mut self, page: PageId) {
        tracing::debug!(target: "screencast", "[COLLECTOR] Tab {:?} closed", page);

        for id in self.stack.sessions_for_page(page) {
            self.end_session(id).await;
        }

        if page == PRIMARY_PAGE {
            if let Some(tx) = self.primary_closed_tx.take() {
                let _ = tx.send(());
            }
        }
    }

    /// Opens a session on `page`, suspends the current top and makes the new
    /// session the streaming one. Returns false if no session could be created.
    async fn start_session(&mut self, page: &dyn PageTarget, page_id: PageId) -> bool {
        let session = match page.create_session().await {
            Ok(session) => session,
            Err(e) => {
                tracing::error!(target: "screencast", "[COLLECTOR] Failed to create CDP session: {}", e);
                return false;
            }
        };

        self.stop_current_screencast().await;

        let id = SessionId(self.next_session);
        self.next_session += 1;

        self.forward_frames(session.as_ref(), id);
        self.stack.push(StackEntry {
            id,
            page: page_id,
            session: Arc::clone(&session),
        });

        if let Err(e) = session.start_screencast().await {
            tracing::warn!(target: "screencast",
                "[COLLECTOR] Failed to start screencast on {:?}, dropping session: {}", id, e);
            self.end_session(id).await;
        }

        true
    }

    /// Removes a session from the stack and, if it was streaming, resumes the
    /// screencast on the new top.
    async fn end_session(&mut self, id: SessionId) {
        let Some((_, was_top)) = self.stack.remove(id) else {
            return;
        };

        if !was_top || self.streaming_ended {
            return;
        }

        if let Some(top) = self.stack.top() {
            if let Err(e) = top.session.start_screencast().await {
                tracing::warn!(target: "screencast",
                    "[COLLECTOR] Failed to resume screencast on {:?}: {}", top.id, e);
            }
        }
    }

    async fn stop_current_screencast(&self) {
        if let Some(top) = self.stack.top() {
            if let Err(e) = top.session.stop_screencast().await {
                tracing::warn!(target: "screencast",
                    "[COLLECTOR] Failed to stop screencast on {:?}: {}", top.id, e);
            }
        }
    }

    fn handle_frame(&mut self, id: SessionId, event: ScreencastFrameEvent) {
        if self.streaming_ended {
            return;
        }
        let Some(timestamp) = event.timestamp else {
            return;
        };
        let Some(entry) = self.stack.get(id) else {
            return;
        };

        let session = Arc::clone(&entry.session);
        let sequence = event.session_id;
        self.pending_ack = Some(tokio::spawn(async move {
            if let Err(e) = session.ack_frame(sequence).await {
                tracing::error!(target: "screencast",
                    "[COLLECTOR] Error in sending acknowledgment for screencast: {}", e);
            }
        }));

        match base64::engine::general_purpose::STANDARD.decode(event.data.as_bytes()) {
            Ok(blob) => {
                let _ = self.frame_tx.send(ScreenFrame::new(blob, timestamp));
            }
            Err(e) => {
                tracing::warn!(target: "screencast", "[COLLECTOR] Skipping undecodable frame: {}", e);
            }
        }
    }

    async fn stop(&mut self) -> bool {
        self.follow_new_tab = false;

        if let Some(ack) = self.pending_ack.take() {
            if tokio::time::timeout(ACK_SETTLE_TIMEOUT, ack).await.is_err() {
                tracing::warn!(target: "screencast",
                    "[COLLECTOR] Last frame acknowledgment still pending after {:?}", ACK_SETTLE_TIMEOUT);
            }
        }

        self.streaming_ended = true;

        for entry in self.stack.drain() {
            if let Err(e) = entry.session.detach().await {
                tracing::warn!(target: "screencast", "[COLLECTOR] Error detaching session: {}", e);
            }
        }

        tracing::info!(target: "screencast", "[COLLECTOR] Stopped");
        true
    }

    fn forward_frames(&self, session: &dyn CaptureSession, id: SessionId) {
        let mut frames = session.subscribe_frames();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = frames.recv().await {
                if event_tx
                    .send(InternalEvent::Frame { session: id, event })
                    .is_err()
                {
                    break;
                }
            }
        });
    }

    fn forward_page_events(&self, page: &dyn PageTarget, id: PageId) {
        let mut events = page.subscribe();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if event_tx.send(InternalEvent::Page { page: id, event }).is_err() {
                    break;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::errors::ProtocolError;
    use async_trait::async_trait;
    use base64::Engine;
    use std::sync::Mutex;

    type CallLog = Arc<Mutex<Vec<String>>>;

    struct FakeSession {
        name: String,
        calls: CallLog,
        fail_start: bool,
        stall_ack: bool,
        frame_tx: Mutex<Option<mpsc::UnboundedSender<ScreencastFrameEvent>>>,
    }

    impl FakeSession {
        fn new(name: &str, calls: &CallLog) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                calls: Arc::clone(calls),
                fail_start: false,
                stall_ack: false,
                frame_tx: Mutex::new(None),
            })
        }

        fn log(&self, call: &str) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("{}:{}", call, self.name));
        }

        fn emit(&self, timestamp: Option<f64>, sequence: i64) {
            let tx = self.frame_tx.lock().unwrap();
            tx.as_ref()
                .expect("session not subscribed")
                .send(ScreencastFrameEvent {
                    data: base64::engine::general_purpose::STANDARD.encode([1u8, 2, 3]),
                    timestamp,
                    session_id: sequence,
                })
                .unwrap();
        }
    }

    #[async_trait]
    impl CaptureSession for FakeSession {
        async fn start_screencast(&self) -> Result<(), ProtocolError> {
            self.log("start");
            if self.fail_start {
                return Err(ProtocolError::ScreencastFailed("boom".to_string()));
            }
            Ok(())
        }

        async fn stop_screencast(&self) -> Result<(), ProtocolError> {
            self.log("stop");
            Ok(())
        }

        async fn ack_frame(&self, session_id: i64) -> Result<(), ProtocolError> {
            self.log(&format!("ack{}", session_id));
            if self.stall_ack {
                std::future::pending::<()>().await;
            }
            Ok(())
        }

        async fn detach(&self) -> Result<(), ProtocolError> {
            self.log("detach");
            Ok(())
        }

        fn subscribe_frames(&self) -> mpsc::UnboundedReceiver<ScreencastFrameEvent> {
            let (tx, rx) = mpsc::unbounded_channel();
            *self.frame_tx.lock().unwrap() = Some(tx);
            rx
        }
    }

    struct FakePage {
        session: Option<Arc<FakeSession>>,
        event_tx: Mutex<Option<mpsc::UnboundedSender<PageEvent>>>,
    }

    impl FakePage {
        fn new(session: Option<Arc<FakeSession>>) -> Arc<Self> {
            Arc::new(Self {
                session,
                event_tx: Mutex::new(None),
            })
        }

        fn emit(&self, event: PageEvent) {
            let tx = self.event_tx.lock().unwrap();
            tx.as_ref().expect("page not subscribed").send(event).unwrap();
        }
    }

    #[async_trait]
    impl PageTarget for FakePage {
        async fn create_session(&self) -> Result<Arc<dyn CaptureSession>, ProtocolError> {
            match &self.session {
                Some(session) => Ok(Arc::clone(session) as Arc<dyn CaptureSession>),
                None => Err(ProtocolError::SessionCreationFailed("no target".to_string())),
            }
        }

        fn subscribe(&self) -> mpsc::UnboundedReceiver<PageEvent> {
            let (tx, rx) = mpsc::unbounded_channel();
            *self.event_tx.lock().unwrap() = Some(tx);
            rx
        }
    }

    async fn wait_until(calls: &CallLog, entry: &str) {
        for _ in 0..100 {
            if calls.lock().unwrap().iter().any(|c| c == entry) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {}", entry);
    }

    #[tokio::test]
    async fn test_forwards_frames_and_acknowledges_them() {
        let calls = CallLog::default();
        let session = FakeSession::new("main", &calls);
        let page = FakePage::new(Some(Arc::clone(&session)));

        let (mut collector, mut outputs) = ScreencastCollector::start(page, false).await;
        session.emit(Some(1.5), 7);

        let frame = tokio::time::timeout(Duration::from_secs(1), outputs.frames.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.timestamp, 1.5);
        assert_eq!(&frame.blob[..], &[1u8, 2, 3][..]);
        assert_eq!(frame.duration, None);

        assert!(collector.stop().await);
        assert!(calls.lock().unwrap().contains(&"ack7:main".to_string()));
    }

    #[tokio::test]
    async fn test_frames_without_timestamp_are_dropped() {
        let calls = CallLog::default();
        let session = FakeSession::new("main", &calls);
        let page = FakePage::new(Some(Arc::clone(&session)));

        let (mut collector, mut outputs) = ScreencastCollector::start(page, false).await;
        session.emit(None, 1);
        session.emit(Some(2.0), 2);

        let frame = outputs.frames.recv().await.unwrap();
        assert_eq!(frame.timestamp, 2.0);
        collector.stop().await;
        assert!(!calls.lock().unwrap().contains(&"ack1:main".to_string()));
    }

    #[tokio::test]
    async fn test_session_creation_failure_is_not_fatal() {
        let page = FakePage::new(None);
        let (mut collector, _outputs) = ScreencastCollector::start(page, true).await;
        assert!(collector.stop().await);
    }

    #[tokio::test]
    async fn test_popup_suspends_previous_top_and_close_resumes_it() {
        let calls = CallLog::default();
        let main_session = FakeSession::new("main", &calls);
        let popup_session = FakeSession::new("popup", &calls);
        let page = FakePage::new(Some(Arc::clone(&main_session)));
        let popup = FakePage::new(Some(Arc::clone(&popup_session)));

        let (mut collector, _outputs) =
            ScreencastCollector::start(Arc::clone(&page) as Arc<dyn PageTarget>, true).await;

        page.emit(PageEvent::Popup(Arc::clone(&popup) as Arc<dyn PageTarget>));
        wait_until(&calls, "start:popup").await;

        {
            let log = calls.lock().unwrap();
            let stop_main = log.iter().position(|c| c == "stop:main").unwrap();
            let start_popup = log.iter().position(|c| c == "start:popup").unwrap();
            assert!(stop_main < start_popup);
        }

        calls.lock().unwrap().clear();
        popup.emit(PageEvent::Close);
        wait_until(&calls, "start:main").await;

        collector.stop().await;
        let log = calls.lock().unwrap();
        assert_eq!(log.iter().filter(|c| *c == "detach:main").count(), 1);
        assert!(!log.contains(&"detach:popup".to_string()));
    }

    #[tokio::test]
    async fn test_popups_ignored_when_not_following() {
        let calls = CallLog::default();
        let main_session = FakeSession::new("main", &calls);
        let popup_session = FakeSession::new("popup", &calls);
        let page = FakePage::new(Some(Arc::clone(&main_session)));
        let popup = FakePage::new(Some(popup_session));

        let (mut collector, _outputs) =
            ScreencastCollector::start(Arc::clone(&page) as Arc<dyn PageTarget>, false).await;
        page.emit(PageEvent::Popup(popup as Arc<dyn PageTarget>));

        collector.stop().await;
        let log = calls.lock().unwrap();
        assert!(!log.iter().any(|c| c.ends_with(":popup")));
    }

    #[tokio::test]
    async fn test_primary_close_is_reported() {
        let calls = CallLog::default();
        let session = FakeSession::new("main", &calls);
        let page = FakePage::new(Some(session));

        let (_collector, outputs) =
            ScreencastCollector::start(Arc::clone(&page) as Arc<dyn PageTarget>, true).await;
        page.emit(PageEvent::Close);

        tokio::time::timeout(Duration::from_secs(1), outputs.primary_closed)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let calls = CallLog::default();
        let session = FakeSession::new("main", &calls);
        let page = FakePage::new(Some(session));

        let (mut collector, _outputs) = ScreencastCollector::start(page, false).await;
        let first = collector.stop().await;
        let second = collector.stop().await;

        assert_eq!(first, second);
        let log = calls.lock().unwrap();
        assert_eq!(log.iter().filter(|c| *c == "detach:main").count(), 1);
    }

    #[tokio::test]
    async fn test_failed_screencast_start_drops_session() {
        let calls = CallLog::default();
        let session = Arc::new(FakeSession {
            name: "main".to_string(),
            calls: Arc::clone(&calls),
            fail_start: true,
            stall_ack: false,
            frame_tx: Mutex::new(None),
        });
        let page = FakePage::new(Some(session));

        let (mut collector, _outputs) = ScreencastCollector::start(page, false).await;
        collector.stop().await;

        assert!(!calls.lock().unwrap().contains(&"detach:main".to_string()));
    }

    #[tokio::test]
    async fn test_stop_gives_up_on_unanswered_ack() {
        let calls = CallLog::default();
        let session = Arc::new(FakeSession {
            name: "main".to_string(),
            calls: Arc::clone(&calls),
            fail_start: false,
            stall_ack: true,
            frame_tx: Mutex::new(None),
        });
        let page = FakePage::new(Some(Arc::clone(&session)));

        let (mut collector, mut outputs) = ScreencastCollector::start(page, false).await;
        session.emit(Some(1.0), 3);
        outputs.frames.recv().await.unwrap();
        wait_until(&calls, "ack3:main").await;

        let started = std::time::Instant::now();
        let stopped = tokio::time::timeout(ACK_SETTLE_TIMEOUT * 3, collector.stop())
            .await
            .unwrap();
        let elapsed = started.elapsed();

        assert!(stopped);
        assert!(elapsed >= ACK_SETTLE_TIMEOUT - Duration::from_millis(50));
        assert!(elapsed < ACK_SETTLE_TIMEOUT * 2);
        assert!(calls.lock().unwrap().contains(&"detach:main".to_string()));
    }

    #[test]
    fn test_stack_remove_reports_top() {
        let calls = CallLog::default();
        let mut stack = SessionStack::default();
        for i in 0..3 {
            stack.push(StackEntry {
                id: SessionId(i),
                page: PageId(i),
                session: FakeSession::new("s", &calls),
            });
        }

        let (_, was_top) = stack.remove(SessionId(1)).unwrap();
        assert!(!was_top);
        let (_, was_top) = stack.remove(SessionId(2)).unwrap();
        assert!(was_top);
        assert_eq!(stack.top().map(|e| e.id), Some(SessionId(0)));
        assert!(stack.remove(SessionId(9)).is_none());
        assert_eq!(stack.len(), 1);
    }
}
