use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use super::*;
use crate::audio::codec::OUTBOUND_RATE_TAG;
use crate::audio::{encode_frame, BlockSink, InboundFrame, OutboundFrame};
use crate::status::StatusSnapshot;

type SinkSlot = Arc<Mutex<Option<BlockSink>>>;

// ── Fakes ───────────────────────────────────────────────────────────

struct FakeInput {
    sink: SinkSlot,
    held: Arc<AtomicUsize>,
    released: bool,
}

impl InputDevice for FakeInput {
    fn sample_rate(&self) -> u32 {
        16_000
    }

    fn attach(&mut self, sink: BlockSink) -> Result<(), SessionError> {
        *self.sink.lock().unwrap() = Some(sink);
        Ok(())
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.sink.lock().unwrap().take();
            self.held.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for FakeInput {
    fn drop(&mut self) {
        self.release();
    }
}

struct FakeOutput {
    open: Arc<AtomicUsize>,
    closed: bool,
}

impl OutputDevice for FakeOutput {
    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.open.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for FakeOutput {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Default)]
struct FakeBackend {
    mic_held: Arc<AtomicUsize>,
    outputs_open: Arc<AtomicUsize>,
    sinks: Mutex<Vec<SinkSlot>>,
    timelines: Mutex<Vec<Arc<PlaybackTimeline>>>,
    acquire_error: Mutex<Option<SessionError>>,
}

impl FakeBackend {
    fn mic_held(&self) -> usize {
        self.mic_held.load(Ordering::SeqCst)
    }

    fn outputs_open(&self) -> usize {
        self.outputs_open.load(Ordering::SeqCst)
    }

    fn last_sink(&self) -> SinkSlot {
        Arc::clone(self.sinks.lock().unwrap().last().unwrap())
    }

    fn last_timeline(&self) -> Arc<PlaybackTimeline> {
        Arc::clone(self.timelines.lock().unwrap().last().unwrap())
    }
}

impl AudioBackend for FakeBackend {
    fn acquire_input(
        &self,
        _constraints: CaptureConstraints,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn InputDevice>, SessionError>> + Send + '_>> {
        let result = match self.acquire_error.lock().unwrap().clone() {
            Some(e) => Err(e),
            None => {
                let sink: SinkSlot = Arc::new(Mutex::new(None));
                self.sinks.lock().unwrap().push(Arc::clone(&sink));
                self.mic_held.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(FakeInput {
                    sink,
                    held: Arc::clone(&self.mic_held),
                    released: false,
                }) as Box<dyn InputDevice>)
            }
        };
        Box::pin(async move { result })
    }

    fn open_output(
        &self,
        timeline: Arc<PlaybackTimeline>,
    ) -> Result<Box<dyn OutputDevice>, SessionError> {
        self.timelines.lock().unwrap().push(timeline);
        self.outputs_open.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeOutput {
            open: Arc::clone(&self.outputs_open),
            closed: false,
        }))
    }
}

struct FakeSession {
    events: EventSender,
    outbound: Option<mpsc::Receiver<OutboundFrame>>,
    closed: Arc<AtomicBool>,
}

#[derive(Default)]
struct FakeTransport {
    connects: AtomicUsize,
    sessions: Mutex<Vec<FakeSession>>,
    connect_error: Mutex<Option<SessionError>>,
    /// Never finish connecting.
    hang: AtomicBool,
    /// Report `Opened` as soon as the channel exists.
    auto_open: AtomicBool,
}

impl FakeTransport {
    fn opening() -> Self {
        let transport = Self::default();
        transport.auto_open.store(true, Ordering::SeqCst);
        transport
    }

    fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    fn events(&self, index: usize) -> EventSender {
        self.sessions.lock().unwrap()[index].events.clone()
    }

    fn take_outbound(&self, index: usize) -> mpsc::Receiver<OutboundFrame> {
        self.sessions.lock().unwrap()[index].outbound.take().unwrap()
    }

    fn is_closed(&self, index: usize) -> bool {
        self.sessions.lock().unwrap()[index].closed.load(Ordering::SeqCst)
    }

    fn fail_connects_with(&self, error: SessionError) {
        *self.connect_error.lock().unwrap() = Some(error);
    }
}

impl Transport for FakeTransport {
    fn connect(
        &self,
        _setup: SessionSetup,
        outbound_capacity: usize,
        events: EventSender,
    ) -> Pin<Box<dyn Future<Output = Result<SessionHandle, SessionError>> + Send + '_>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            if self.hang.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if let Some(e) = self.connect_error.lock().unwrap().clone() {
                return Err(e);
            }

            let (tx, rx) = mpsc::channel(outbound_capacity);
            let closed = Arc::new(AtomicBool::new(false));
            if self.auto_open.load(Ordering::SeqCst) {
                let _ = events.send(TransportEvent::Opened);
            }
            self.sessions.lock().unwrap().push(FakeSession {
                events,
                outbound: Some(rx),
                closed: Arc::clone(&closed),
            });
            Ok(SessionHandle::new(tx, move || closed.store(true, Ordering::SeqCst)))
        })
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

const WAIT: Duration = Duration::from_secs(2);

fn config(max_retries: u32) -> SessionConfig {
    SessionConfig {
        setup: SessionSetup {
            model: "test-model".into(),
            voice_name: "Kore".into(),
            system_instruction: None,
            enable_search: false,
        },
        constraints: CaptureConstraints::default(),
        max_retries,
        retry_base_delay: Duration::from_millis(10),
        open_timeout: Duration::from_secs(5),
        initial_silence_ms: None,
        outbound_queue_frames: 8,
    }
}

fn start(
    config: SessionConfig,
) -> (SessionManager, Arc<FakeBackend>, Arc<FakeTransport>) {
    start_with(config, FakeBackend::default(), FakeTransport::opening())
}

fn start_with(
    config: SessionConfig,
    backend: FakeBackend,
    transport: FakeTransport,
) -> (SessionManager, Arc<FakeBackend>, Arc<FakeTransport>) {
    let backend = Arc::new(backend);
    let transport = Arc::new(transport);
    let manager = SessionManager::spawn(
        config,
        Arc::clone(&backend) as Arc<dyn AudioBackend>,
        Arc::clone(&transport) as Arc<dyn Transport>,
    );
    (manager, backend, transport)
}

async fn wait_status(
    manager: &SessionManager,
    pred: impl FnMut(&StatusSnapshot) -> bool,
) -> StatusSnapshot {
    let mut rx = manager.status().subscribe();
    let snapshot = timeout(WAIT, rx.wait_for(pred))
        .await
        .expect("timed out waiting for status")
        .expect("status channel closed")
        .clone();
    snapshot
}

async fn wait_state(manager: &SessionManager, state: ConnectionState) -> StatusSnapshot {
    wait_status(manager, |s| s.state == state).await
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !cond() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}

fn closed(code: u16) -> TransportEvent {
    TransportEvent::Closed {
        code: Some(code),
        reason: String::new(),
    }
}

fn speech_frame(samples: usize) -> InboundFrame {
    InboundFrame::new(encode_frame(&vec![0.25; samples]).payload)
}

fn deliver(sink: &SinkSlot, samples: &[f32]) {
    if let Some(cb) = sink.lock().unwrap().as_mut() {
        cb(samples);
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_connect_stream_and_deactivate_releases_everything() {
    let (manager, backend, transport) = start(config(3));
    manager.activate();

    let snap = wait_state(&manager, ConnectionState::Connected).await;
    assert_eq!(snap.message, STATUS_LISTENING);
    assert_eq!(backend.mic_held(), 1);
    assert_eq!(backend.outputs_open(), 1);

    let mut outbound = transport.take_outbound(0);
    deliver(&backend.last_sink(), &vec![0.1; crate::audio::CAPTURE_BLOCK_SAMPLES]);
    let frame = timeout(WAIT, outbound.recv()).await.unwrap().unwrap();
    assert_eq!(frame.rate_tag, OUTBOUND_RATE_TAG);
    assert_eq!(BASE64.decode(&frame.payload).unwrap().len(), crate::audio::CAPTURE_BLOCK_SAMPLES * 2);

    manager.deactivate();
    let snap = wait_state(&manager, ConnectionState::Idle).await;
    assert_eq!(snap.message, STATUS_DISCONNECTED);
    wait_until(|| backend.mic_held() == 0 && backend.outputs_open() == 0).await;
    assert!(transport.is_closed(0));
}

#[tokio::test]
async fn test_speaking_follows_playback() {
    let (manager, backend, transport) = start(config(3));
    manager.activate();
    wait_state(&manager, ConnectionState::Connected).await;

    transport
        .events(0)
        .send(TransportEvent::Message(ServerEvent {
            audio: vec![speech_frame(2400), InboundFrame::new("%%% not base64")],
            interrupted: false,
            turn_complete: false,
        }))
        .unwrap();

    let snap = wait_status(&manager, |s| s.speaking).await;
    assert_eq!(snap.message, STATUS_SPEAKING);
    let timeline = backend.last_timeline();
    assert_eq!(timeline.live_count(), 1);

    let mut out = vec![0.0; 4800];
    timeline.render(&mut out);
    assert_eq!(timeline.live_count(), 0);

    let snap = wait_status(&manager, |s| !s.speaking).await;
    assert_eq!(snap.message, STATUS_WAITING);
    assert_eq!(snap.state, ConnectionState::Connected);
}

#[tokio::test]
async fn test_interrupt_flushes_playback() {
    let (manager, backend, transport) = start(config(3));
    manager.activate();
    wait_state(&manager, ConnectionState::Connected).await;

    let events = transport.events(0);
    events
        .send(TransportEvent::Message(ServerEvent {
            audio: vec![speech_frame(4800), speech_frame(2400)],
            ..Default::default()
        }))
        .unwrap();
    wait_status(&manager, |s| s.speaking).await;
    assert_eq!(backend.last_timeline().live_count(), 2);

    events
        .send(TransportEvent::Message(ServerEvent {
            interrupted: true,
            ..Default::default()
        }))
        .unwrap();
    let snap = wait_status(&manager, |s| !s.speaking).await;
    assert_eq!(snap.message, STATUS_LISTENING);
    assert_eq!(backend.last_timeline().live_count(), 0);
}

#[tokio::test]
async fn test_transient_closes_exhaust_retry_budget() {
    let (manager, backend, transport) = start(config(2));
    manager.activate();
    wait_state(&manager, ConnectionState::Connected).await;

    // Every reconnection attempt fails the same way the first session ended.
    transport.fail_connects_with(SessionError::Transient("network unreachable".into()));
    transport.events(0).send(closed(1006)).unwrap();

    let snap = wait_state(&manager, ConnectionState::Error).await;
    assert!(snap.error.unwrap().contains("gave up after 2"));
    assert_eq!(transport.connects(), 3);
    wait_until(|| backend.mic_held() == 0 && backend.outputs_open() == 0).await;

    sleep(Duration::from_millis(100)).await;
    assert_eq!(transport.connects(), 3);
    assert_eq!(manager.status().snapshot().state, ConnectionState::Error);
}

#[tokio::test]
async fn test_reconnect_after_drop_resets_budget() {
    let (manager, _backend, transport) = start(config(1));
    manager.activate();
    wait_state(&manager, ConnectionState::Connected).await;

    transport.events(0).send(closed(1011)).unwrap();
    wait_until(|| transport.connects() == 2).await;
    let snap = wait_state(&manager, ConnectionState::Connected).await;
    assert_eq!(snap.retry_attempt, 0);
    assert!(transport.is_closed(0));

    // Budget was restored by the successful open, so one more drop is survivable.
    transport.events(1).send(closed(1011)).unwrap();
    wait_until(|| transport.connects() == 3).await;
    wait_state(&manager, ConnectionState::Connected).await;
}

#[tokio::test]
async fn test_policy_close_goes_straight_to_error() {
    let (manager, backend, transport) = start(config(5));
    manager.activate();
    wait_state(&manager, ConnectionState::Connected).await;

    transport
        .events(0)
        .send(TransportEvent::Closed {
            code: Some(1008),
            reason: "API key not valid".into(),
        })
        .unwrap();

    let snap = wait_state(&manager, ConnectionState::Error).await;
    assert!(snap.error.unwrap().contains("API key not valid"));
    assert_eq!(snap.message, STATUS_ERROR);
    wait_until(|| backend.mic_held() == 0).await;
    sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.connects(), 1);
}

#[tokio::test]
async fn test_deactivate_while_connecting_releases_mic() {
    let transport = FakeTransport::opening();
    transport.hang.store(true, Ordering::SeqCst);
    let (manager, backend, transport) = start_with(config(3), FakeBackend::default(), transport);

    manager.activate();
    wait_until(|| transport.connects() == 1).await;
    assert_eq!(backend.mic_held(), 1);
    assert_eq!(manager.status().snapshot().state, ConnectionState::Connecting);

    manager.deactivate();
    wait_state(&manager, ConnectionState::Idle).await;
    wait_until(|| backend.mic_held() == 0 && backend.outputs_open() == 0).await;
}

#[tokio::test]
async fn test_permission_denied_then_manual_retry() {
    let backend = FakeBackend::default();
    *backend.acquire_error.lock().unwrap() = Some(SessionError::PermissionDenied("blocked".into()));
    let (manager, backend, transport) = start_with(config(3), backend, FakeTransport::opening());

    manager.activate();
    let snap = wait_state(&manager, ConnectionState::Error).await;
    assert!(snap.error.unwrap().contains("permission denied"));
    assert_eq!(transport.connects(), 0);

    backend.acquire_error.lock().unwrap().take();
    manager.retry();
    wait_state(&manager, ConnectionState::Connected).await;
    assert_eq!(backend.mic_held(), 1);
}

#[tokio::test]
async fn test_first_attempt_open_failure_is_terminal() {
    let transport = FakeTransport::opening();
    transport.fail_connects_with(SessionError::Transient("connection refused".into()));
    let (manager, backend, transport) = start_with(config(3), FakeBackend::default(), transport);

    manager.activate();
    let snap = wait_state(&manager, ConnectionState::Error).await;
    assert!(snap.error.unwrap().contains("connection refused"));
    assert_eq!(transport.connects(), 1);
    assert_eq!(backend.mic_held(), 0);
    assert_eq!(backend.outputs_open(), 0);
}

#[tokio::test]
async fn test_deactivate_cancels_pending_retry() {
    let mut cfg = config(3);
    cfg.retry_base_delay = Duration::from_secs(5);
    let (manager, backend, transport) = start(cfg);
    manager.activate();
    wait_state(&manager, ConnectionState::Connected).await;

    transport.events(0).send(closed(1006)).unwrap();
    let snap = wait_state(&manager, ConnectionState::Connecting).await;
    assert_eq!(snap.retry_attempt, 1);
    assert_eq!(snap.message, "Reconnecting (1/3)...");
    wait_until(|| backend.mic_held() == 0).await;

    manager.deactivate();
    wait_state(&manager, ConnectionState::Idle).await;
    sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.connects(), 1);
}

#[tokio::test]
async fn test_normal_close_returns_to_idle() {
    let (manager, backend, transport) = start(config(3));
    manager.activate();
    wait_state(&manager, ConnectionState::Connected).await;

    transport.events(0).send(closed(1000)).unwrap();
    let snap = wait_state(&manager, ConnectionState::Idle).await;
    assert!(snap.error.is_none());
    wait_until(|| backend.mic_held() == 0).await;
    sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.connects(), 1);
}

#[tokio::test]
async fn test_initial_silence_frame_is_sent() {
    let mut cfg = config(3);
    cfg.initial_silence_ms = Some(100);
    let (manager, _backend, transport) = start(cfg);
    manager.activate();
    wait_state(&manager, ConnectionState::Connected).await;

    let mut outbound = transport.take_outbound(0);
    let frame = timeout(WAIT, outbound.recv()).await.unwrap().unwrap();
    let bytes = BASE64.decode(&frame.payload).unwrap();
    assert_eq!(bytes.len(), 1600 * 2);
    assert!(bytes.iter().all(|b| *b == 0));
}

#[tokio::test]
async fn test_events_from_superseded_session_are_ignored() {
    let (manager, _backend, transport) = start(config(3));
    manager.activate();
    wait_state(&manager, ConnectionState::Connected).await;

    let stale = transport.events(0);
    stale.send(closed(1006)).unwrap();
    wait_until(|| transport.connects() == 2).await;
    wait_state(&manager, ConnectionState::Connected).await;

    // The first attempt's channel is gone; nothing it says reaches the manager.
    let _ = stale.send(closed(1008));
    sleep(Duration::from_millis(50)).await;
    assert_eq!(manager.status().snapshot().state, ConnectionState::Connected);
}

#[tokio::test]
async fn test_activate_while_connected_is_ignored() {
    let (manager, _backend, transport) = start(config(3));
    manager.activate();
    wait_state(&manager, ConnectionState::Connected).await;

    manager.activate();
    manager.retry();
    sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.connects(), 1);
    assert_eq!(manager.status().snapshot().state, ConnectionState::Connected);
}

#[tokio::test]
async fn test_shutdown_tears_down() {
    let (manager, backend, _transport) = start(config(3));
    manager.activate();
    wait_state(&manager, ConnectionState::Connected).await;

    manager.shutdown().await;
    assert_eq!(backend.mic_held(), 0);
    assert_eq!(backend.outputs_open(), 0);
}

#[tokio::test]
async fn test_turn_complete_with_nothing_queued_waits() {
    let (manager, _backend, transport) = start(config(3));
    manager.activate();
    let snap = wait_state(&manager, ConnectionState::Connected).await;
    assert_eq!(snap.message, STATUS_LISTENING);

    transport
        .events(0)
        .send(TransportEvent::Message(ServerEvent {
            turn_complete: true,
            ..Default::default()
        }))
        .unwrap();
    let snap = wait_status(&manager, |s| s.message == STATUS_WAITING).await;
    assert!(!snap.speaking);
    assert_eq!(snap.state, ConnectionState::Connected);
}

#[tokio::test]
async fn test_open_timeout_without_setup_complete() {
    let mut cfg = config(3);
    cfg.open_timeout = Duration::from_millis(100);
    let (manager, backend, transport) = start_with(cfg, FakeBackend::default(), FakeTransport::default());

    manager.activate();
    wait_until(|| transport.session_count() == 1).await;
    assert_eq!(manager.status().snapshot().state, ConnectionState::Connecting);

    let snap = wait_state(&manager, ConnectionState::Error).await;
    assert!(snap.error.unwrap().contains("open timed out"));
    assert_eq!(transport.connects(), 1);
    wait_until(|| backend.mic_held() == 0 && backend.outputs_open() == 0).await;
    assert!(transport.is_closed(0));
}

#[tokio::test]
async fn test_policy_close_before_open_is_terminal() {
    let (manager, backend, transport) =
        start_with(config(3), FakeBackend::default(), FakeTransport::default());

    manager.activate();
    wait_until(|| transport.session_count() == 1).await;
    transport.events(0).send(closed(1008)).unwrap();

    let snap = wait_state(&manager, ConnectionState::Error).await;
    assert!(snap.error.unwrap().contains("1008"));
    wait_until(|| backend.mic_held() == 0 && backend.outputs_open() == 0).await;
    sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.connects(), 1);
}

#[tokio::test]
async fn test_drop_after_reconnect_starts_from_fresh_budget() {
    let mut cfg = config(2);
    cfg.open_timeout = Duration::from_millis(100);
    let (manager, backend, transport) = start(cfg);
    manager.activate();
    wait_state(&manager, ConnectionState::Connected).await;

    // First drop: the retry opens and restores the budget.
    transport.events(0).send(closed(1006)).unwrap();
    wait_until(|| transport.connects() == 2).await;
    let snap = wait_state(&manager, ConnectionState::Connected).await;
    assert_eq!(snap.retry_attempt, 0);

    // Second drop: reconnection attempts reach the service but never open.
    transport.auto_open.store(false, Ordering::SeqCst);
    transport.events(1).send(closed(1006)).unwrap();
    let snap = wait_status(&manager, |s| s.retry_attempt == 1).await;
    assert_eq!(snap.message, "Reconnecting (1/2)...");
    assert_eq!(snap.state, ConnectionState::Connecting);

    let snap = wait_state(&manager, ConnectionState::Error).await;
    assert!(snap.error.unwrap().contains("gave up after 2"));
    assert_eq!(transport.connects(), 4);
    wait_until(|| backend.mic_held() == 0 && backend.outputs_open() == 0).await;
}
