//! Duplex session transport abstraction.
//!
//! A transport opens one channel to the remote service, reports lifecycle
//! and inbound messages as `TransportEvent`s, and accepts outbound frames
//! through a bounded queue owned by the returned `SessionHandle`.

use std::future::Future;
use std::pin::Pin;

use tokio::sync::mpsc;

use crate::audio::{InboundFrame, OutboundFrame};
use crate::error::SessionError;

/// Everything the service needs to start a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSetup {
    pub model: String,
    /// Prebuilt voice / persona name.
    pub voice_name: String,
    pub system_instruction: Option<String>,
    /// Let the service ground answers with web search.
    pub enable_search: bool,
}

/// Audio-relevant content of one server message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerEvent {
    /// Inline audio frames, in message order.
    pub audio: Vec<InboundFrame>,
    /// Barge-in: current output must be cut off.
    pub interrupted: bool,
    pub turn_complete: bool,
}

/// Lifecycle and data events from an open transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The service accepted the session; audio may flow.
    Opened,
    Message(ServerEvent),
    Closed { code: Option<u16>, reason: String },
    Failed(SessionError),
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

type CloseHook = Box<dyn FnOnce() + Send>;

/// Owner of one open channel. Closing (or dropping) it shuts the channel.
pub struct SessionHandle {
    outbound: mpsc::Sender<OutboundFrame>,
    on_close: Option<CloseHook>,
}

impl SessionHandle {
    pub fn new(outbound: mpsc::Sender<OutboundFrame>, on_close: impl FnOnce() + Send + 'static) -> Self {
        Self {
            outbound,
            on_close: Some(Box::new(on_close)),
        }
    }

    /// Queue feeding the transport's sender task.
    pub fn outbound(&self) -> mpsc::Sender<OutboundFrame> {
        self.outbound.clone()
    }

    pub fn close(&mut self) {
        if let Some(hook) = self.on_close.take() {
            hook();
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Opens sessions with the remote service (dyn-compatible).
pub trait Transport: Send + Sync {
    /// Open a channel. Events for this channel go to `events` until the
    /// returned handle is closed.
    fn connect(
        &self,
        setup: SessionSetup,
        outbound_capacity: usize,
        events: EventSender,
    ) -> Pin<Box<dyn Future<Output = Result<SessionHandle, SessionError>> + Send + '_>>;
}
