//! Voice session lifecycle.
//!
//! `SessionManager` owns the connection state machine. All state lives in one
//! actor task; host commands, transport events, playback notifications, the
//! in-flight acquisition and the retry deadline are all fed into a single
//! `select!` loop, so no two of them ever touch the state at the same time.
//!
//! Each connection attempt owns its hardware handles, its session handle and
//! its event channels. Tearing an attempt down drops all of them together,
//! which is what keeps a late callback from a superseded attempt from
//! reaching the state machine.

pub mod live;
pub mod protocol;
pub mod state;
pub mod transport;

#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::audio::codec::INBOUND_SAMPLE_RATE;
use crate::audio::{
    decode_frame, AudioBackend, CaptureConstraints, CapturePipeline, InputDevice, OutputDevice,
    PlaybackScheduler, PlaybackTimeline,
};
use crate::error::SessionError;
use crate::status::{
    status_channel, StatusPublisher, StatusSurface, STATUS_CONNECTING, STATUS_DISCONNECTED,
    STATUS_ERROR, STATUS_LISTENING, STATUS_SPEAKING, STATUS_STARTING, STATUS_WAITING,
};

pub use live::{LiveTransport, DEFAULT_ENDPOINT};
pub use state::{classify_close, retry_delay, CloseClass, ConnectionState, RetryBudget};
pub use transport::{
    EventSender, ServerEvent, SessionHandle, SessionSetup, Transport, TransportEvent,
};

/// Everything the manager needs to run sessions.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub setup: SessionSetup,
    pub constraints: CaptureConstraints,
    /// Automatic reconnection attempts per activation.
    pub max_retries: u32,
    /// Attempt `n` waits `n * retry_base_delay`.
    pub retry_base_delay: Duration,
    /// Silence sent once capture starts, if set.
    pub initial_silence_ms: Option<u32>,
    /// Capacity of the capture -> transport frame queue.
    pub outbound_queue_frames: usize,
    /// How long an acquired attempt may wait for the service to accept the
    /// session before it counts as a transient failure.
    pub open_timeout: Duration,
}

enum Command {
    Activate,
    Deactivate,
    Retry,
    Shutdown(oneshot::Sender<()>),
}

/// Handle to the session actor. Dropping it deactivates and stops the actor.
pub struct SessionManager {
    commands: mpsc::UnboundedSender<Command>,
    status: StatusSurface,
    task: Option<JoinHandle<()>>,
}

impl SessionManager {
    /// Spawn the actor on the current tokio runtime. Starts `Idle`.
    pub fn spawn(
        config: SessionConfig,
        backend: Arc<dyn AudioBackend>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let (publisher, status) = status_channel();
        let retry = RetryBudget::new(config.max_retries);
        let actor = SessionActor {
            config,
            backend,
            transport,
            status: publisher,
            state: ConnectionState::Idle,
            active: false,
            retry,
            epoch: 0,
            pending: None,
            attempt: None,
            transport_events: None,
            playback_events: None,
            retry_at: None,
            open_deadline: None,
        };
        let task = tokio::spawn(actor.run(rx));
        Self {
            commands,
            status,
            task: Some(task),
        }
    }

    /// User enabled the widget. From `Error` this behaves like `retry`.
    pub fn activate(&self) {
        self.send(Command::Activate);
    }

    /// User disabled the widget: full teardown, back to `Idle`.
    pub fn deactivate(&self) {
        self.send(Command::Deactivate);
    }

    /// Manual retry from `Error`.
    pub fn retry(&self) {
        self.send(Command::Retry);
    }

    pub fn status(&self) -> &StatusSurface {
        &self.status
    }

    /// Deactivate and wait for the actor to exit.
    pub async fn shutdown(mut self) {
        let (done_tx, done_rx) = oneshot::channel();
        self.send(Command::Shutdown(done_tx));
        let _ = done_rx.await;
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    fn send(&self, cmd: Command) {
        if self.commands.send(cmd).is_err() {
            warn!("Session actor is gone, command dropped");
        }
    }
}

// ── Actor ───────────────────────────────────────────────────────────

/// Hardware and session acquired by one attempt.
struct PreparedAttempt {
    input: Box<dyn InputDevice>,
    output: Box<dyn OutputDevice>,
    timeline: Arc<PlaybackTimeline>,
    session: SessionHandle,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    playback_events: mpsc::UnboundedReceiver<()>,
}

type PrepareResult = (u64, Result<PreparedAttempt, SessionError>);

/// Resources of the live attempt. Torn down as one unit.
struct Attempt {
    /// Held from acquisition until the session opens, then moved into `capture`.
    input: Option<Box<dyn InputDevice>>,
    capture: Option<CapturePipeline>,
    output: Box<dyn OutputDevice>,
    scheduler: PlaybackScheduler,
    session: SessionHandle,
}

impl Attempt {
    fn teardown(mut self) {
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }
        if let Some(mut input) = self.input.take() {
            input.release();
        }
        self.session.close();
        self.scheduler.interrupt();
        self.output.close();
    }
}

struct SessionActor {
    config: SessionConfig,
    backend: Arc<dyn AudioBackend>,
    transport: Arc<dyn Transport>,
    status: StatusPublisher,
    state: ConnectionState,
    /// User wants the assistant on. Cleared by deactivate and normal close.
    active: bool,
    retry: RetryBudget,
    /// Bumped per attempt; acquisition results from older attempts are discarded.
    epoch: u64,
    pending: Option<JoinHandle<PrepareResult>>,
    attempt: Option<Attempt>,
    transport_events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    playback_events: Option<mpsc::UnboundedReceiver<()>>,
    retry_at: Option<Instant>,
    /// Armed once hardware is held, cleared when the session opens.
    open_deadline: Option<Instant>,
}

impl SessionActor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::Activate) => self.activate(),
                    Some(Command::Deactivate) => self.deactivate(),
                    Some(Command::Retry) => self.manual_retry(),
                    Some(Command::Shutdown(done)) => {
                        self.deactivate();
                        let _ = done.send(());
                        break;
                    }
                    None => {
                        self.deactivate();
                        break;
                    }
                },
                joined = join_pending(&mut self.pending) => match joined {
                    Ok((epoch, result)) => self.on_prepared(epoch, result),
                    Err(e) => {
                        let epoch = self.epoch;
                        let error = SessionError::CapabilityMissing(format!("Acquisition task failed: {}", e));
                        self.on_prepared(epoch, Err(error));
                    }
                },
                event = recv_or_pending(&mut self.transport_events) => match event {
                    Some(event) => self.on_transport_event(event),
                    None => {
                        self.transport_events = None;
                        self.on_session_lost(None, "event channel closed".into());
                    }
                },
                drained = recv_or_pending(&mut self.playback_events) => match drained {
                    Some(()) => self.on_playback_drained(),
                    None => self.playback_events = None,
                },
                _ = sleep_until_deadline(self.retry_at) => {
                    self.retry_at = None;
                    self.begin_attempt();
                }
                _ = sleep_until_deadline(self.open_deadline) => {
                    self.open_deadline = None;
                    warn!(timeout_ms = self.config.open_timeout.as_millis() as u64, "Session did not open in time");
                    self.on_session_error(SessionError::Transient("open timed out".into()));
                }
            }
        }
        debug!("Session actor exiting");
    }

    // ── Commands ────────────────────────────────────────────────────

    fn activate(&mut self) {
        match self.state {
            ConnectionState::Idle => {
                info!("Voice session activated");
                self.active = true;
                self.retry.reset();
                self.begin_attempt();
            }
            ConnectionState::Error => self.manual_retry(),
            state => debug!(%state, "Activate ignored"),
        }
    }

    fn deactivate(&mut self) {
        self.active = false;
        self.retry_at = None;
        self.retry.reset();
        if self.state == ConnectionState::Idle && self.attempt.is_none() && self.pending.is_none() {
            return;
        }
        info!(from = %self.state, "Voice session deactivated");
        self.teardown();
        self.set_idle();
    }

    fn manual_retry(&mut self) {
        if self.state != ConnectionState::Error {
            debug!(state = %self.state, "Retry ignored outside error state");
            return;
        }
        info!("Manual retry");
        self.active = true;
        self.retry.reset();
        self.begin_attempt();
    }

    // ── Attempts ────────────────────────────────────────────────────

    fn begin_attempt(&mut self) {
        if !self.active {
            return;
        }
        self.teardown();
        self.epoch += 1;
        let epoch = self.epoch;

        let message = if self.retry.count == 0 {
            STATUS_STARTING.to_string()
        } else {
            format!("Reconnecting ({}/{})...", self.retry.count, self.retry.max)
        };
        self.state = ConnectionState::Connecting;
        let retry_attempt = self.retry.count;
        self.status.update(|s| {
            s.state = ConnectionState::Connecting;
            s.message = message;
            s.speaking = false;
            s.error = None;
            s.retry_attempt = retry_attempt;
        });
        debug!(epoch, retry = retry_attempt, "Starting connection attempt");

        let backend = Arc::clone(&self.backend);
        let transport = Arc::clone(&self.transport);
        let setup = self.config.setup.clone();
        let constraints = self.config.constraints.clone();
        let capacity = self.config.outbound_queue_frames;
        self.pending = Some(tokio::spawn(async move {
            let result = prepare_attempt(backend, transport, setup, constraints, capacity).await;
            (epoch, result)
        }));
    }

    fn on_prepared(&mut self, epoch: u64, result: Result<PreparedAttempt, SessionError>) {
        if epoch != self.epoch || !self.active || self.state != ConnectionState::Connecting {
            debug!(epoch, current = self.epoch, "Discarding stale attempt");
            if let Ok(prepared) = result {
                release_prepared(prepared);
            }
            return;
        }

        let prepared = match result {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!("Connection attempt failed: {}", e);
                self.on_session_error(e);
                return;
            }
        };

        self.transport_events = Some(prepared.transport_events);
        self.playback_events = Some(prepared.playback_events);
        self.attempt = Some(Attempt {
            input: Some(prepared.input),
            capture: None,
            output: prepared.output,
            scheduler: PlaybackScheduler::new(prepared.timeline),
            session: prepared.session,
        });
        self.open_deadline = Some(Instant::now() + self.config.open_timeout);
        if self.retry.count == 0 {
            self.status.update(|s| s.message = STATUS_CONNECTING.to_string());
        }
    }

    // ── Transport events ────────────────────────────────────────────

    fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened => self.on_opened(),
            TransportEvent::Message(event) => self.on_server_event(event),
            TransportEvent::Closed { code, reason } => self.on_session_lost(code, reason),
            TransportEvent::Failed(e) => {
                warn!("Session failed: {}", e);
                self.on_session_error(e);
            }
        }
    }

    fn on_opened(&mut self) {
        if self.state != ConnectionState::Connecting {
            return;
        }
        let Some(attempt) = self.attempt.as_mut() else {
            return;
        };
        let Some(input) = attempt.input.take() else {
            return;
        };

        match CapturePipeline::start(input, attempt.session.outbound()) {
            Ok(capture) => {
                if let Some(ms) = self.config.initial_silence_ms {
                    capture.send_initial_silence(ms);
                }
                attempt.capture = Some(capture);
            }
            Err(e) => {
                warn!("Failed to start capture: {}", e);
                self.on_session_error(e);
                return;
            }
        }

        self.open_deadline = None;
        self.retry.reset();
        self.state = ConnectionState::Connected;
        self.status.update(|s| {
            s.state = ConnectionState::Connected;
            s.message = STATUS_LISTENING.to_string();
            s.speaking = false;
            s.error = None;
            s.retry_attempt = 0;
        });
        info!(epoch = self.epoch, "Voice session connected");
    }

    fn on_server_event(&mut self, event: ServerEvent) {
        let Some(attempt) = self.attempt.as_mut() else {
            return;
        };

        if event.interrupted {
            let stopped = attempt.scheduler.interrupt();
            debug!(stopped, "Playback interrupted");
            if self.status.current().speaking {
                self.status.update(|s| {
                    s.speaking = false;
                    s.message = STATUS_LISTENING.to_string();
                });
            }
        }

        let mut scheduled = 0usize;
        for frame in &event.audio {
            match decode_frame(frame) {
                Ok(buffer) => {
                    attempt.scheduler.schedule(buffer);
                    scheduled += 1;
                }
                Err(e) => warn!("Dropping undecodable audio frame: {}", e),
            }
        }

        if scheduled > 0 && self.state == ConnectionState::Connected && !self.status.current().speaking {
            self.status.update(|s| {
                s.speaking = true;
                s.message = STATUS_SPEAKING.to_string();
            });
        }

        // A turn that left nothing to play never triggers the drained hook.
        if event.turn_complete
            && self.state == ConnectionState::Connected
            && !attempt.scheduler.is_playing()
        {
            debug!("Turn complete with nothing queued");
            self.status.update(|s| {
                s.speaking = false;
                s.message = STATUS_WAITING.to_string();
            });
        }
    }

    fn on_playback_drained(&mut self) {
        if self.state == ConnectionState::Connected && self.status.current().speaking {
            self.status.update(|s| {
                s.speaking = false;
                s.message = STATUS_WAITING.to_string();
            });
        }
    }

    fn on_session_lost(&mut self, code: Option<u16>, reason: String) {
        match classify_close(code) {
            CloseClass::Normal => {
                info!(reason = %reason, "Session closed normally");
                self.active = false;
                self.retry_at = None;
                self.retry.reset();
                self.teardown();
                self.set_idle();
            }
            CloseClass::Policy => {
                let detail = if reason.is_empty() {
                    format!("closed with code {}", code.unwrap_or_default())
                } else {
                    reason
                };
                self.fail(SessionError::Policy(detail));
            }
            CloseClass::Transient => {
                let detail = match code {
                    Some(code) if reason.is_empty() => format!("closed with code {}", code),
                    Some(code) => format!("closed with code {}: {}", code, reason),
                    None => reason,
                };
                warn!("Session lost: {}", detail);
                self.on_session_error(SessionError::Transient(detail));
            }
        }
    }

    // ── Failure handling ────────────────────────────────────────────

    /// Route a failure to retry or `Error`.
    fn on_session_error(&mut self, error: SessionError) {
        if !error.is_retriable() {
            self.fail(error);
            return;
        }
        // A first attempt that never opened is a setup problem, not a drop.
        if self.state == ConnectionState::Connected || self.retry.count > 0 {
            self.schedule_retry(error);
        } else {
            self.fail(error);
        }
    }

    fn schedule_retry(&mut self, error: SessionError) {
        self.teardown();
        let Some(attempt) = self.retry.try_consume() else {
            let max = self.retry.max;
            self.fail_with_message(format!("{}; gave up after {} reconnection attempts", error, max));
            return;
        };

        let delay = retry_delay(self.config.retry_base_delay, attempt);
        info!(attempt, max = self.retry.max, delay_ms = delay.as_millis() as u64, "Scheduling reconnect");
        self.retry_at = Some(Instant::now() + delay);
        self.state = ConnectionState::Connecting;
        let message = format!("Reconnecting ({}/{})...", attempt, self.retry.max);
        self.status.update(|s| {
            s.state = ConnectionState::Connecting;
            s.message = message;
            s.speaking = false;
            s.error = None;
            s.retry_attempt = attempt;
        });
    }

    fn fail(&mut self, error: SessionError) {
        self.fail_with_message(error.to_string());
    }

    fn fail_with_message(&mut self, message: String) {
        warn!(error = %message, "Voice session entered error state");
        self.retry_at = None;
        self.teardown();
        self.state = ConnectionState::Error;
        self.status.update(|s| {
            s.state = ConnectionState::Error;
            s.message = STATUS_ERROR.to_string();
            s.speaking = false;
            s.error = Some(message);
        });
    }

    fn set_idle(&mut self) {
        self.state = ConnectionState::Idle;
        self.status.update(|s| {
            s.state = ConnectionState::Idle;
            s.message = STATUS_DISCONNECTED.to_string();
            s.speaking = false;
            s.error = None;
            s.retry_attempt = 0;
        });
    }

    /// Release everything the current attempt holds.
    fn teardown(&mut self) {
        self.open_deadline = None;
        if let Some(pending) = self.pending.take() {
            pending.abort();
        }
        self.transport_events = None;
        self.playback_events = None;
        if let Some(attempt) = self.attempt.take() {
            attempt.teardown();
            debug!(epoch = self.epoch, "Attempt torn down");
        }
    }
}

/// Acquire the microphone and output, then open the session.
///
/// Anything acquired before a failure is released before returning. If the
/// task is aborted, dropping the handles releases them.
async fn prepare_attempt(
    backend: Arc<dyn AudioBackend>,
    transport: Arc<dyn Transport>,
    setup: SessionSetup,
    constraints: CaptureConstraints,
    outbound_capacity: usize,
) -> Result<PreparedAttempt, SessionError> {
    let mut input = backend.acquire_input(constraints).await?;

    let timeline = PlaybackTimeline::new(INBOUND_SAMPLE_RATE);
    let (drained_tx, playback_events) = mpsc::unbounded_channel();
    timeline.set_drained_hook(move || {
        let _ = drained_tx.send(());
    });

    let mut output = match backend.open_output(Arc::clone(&timeline)) {
        Ok(output) => output,
        Err(e) => {
            input.release();
            return Err(e);
        }
    };

    let (events_tx, transport_events) = mpsc::unbounded_channel();
    let session = match transport.connect(setup, outbound_capacity, events_tx).await {
        Ok(session) => session,
        Err(e) => {
            output.close();
            input.release();
            return Err(e);
        }
    };

    Ok(PreparedAttempt {
        input,
        output,
        timeline,
        session,
        transport_events,
        playback_events,
    })
}

fn release_prepared(prepared: PreparedAttempt) {
    let PreparedAttempt {
        mut input,
        mut output,
        mut session,
        ..
    } = prepared;
    session.close();
    output.close();
    input.release();
}

/// Aborted tasks are taken out of `pending` first, so a join error here is a panic.
async fn join_pending(
    pending: &mut Option<JoinHandle<PrepareResult>>,
) -> Result<PrepareResult, tokio::task::JoinError> {
    let Some(handle) = pending.as_mut() else {
        return std::future::pending().await;
    };
    let result = handle.await;
    *pending = None;
    result
}

async fn recv_or_pending<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx.as_mut() {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
