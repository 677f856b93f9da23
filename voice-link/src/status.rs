//! Read-only projection of the session state for the surrounding UI.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use crate::session::ConnectionState;

pub const STATUS_DISCONNECTED: &str = "Disconnected";
pub const STATUS_STARTING: &str = "Starting systems...";
pub const STATUS_CONNECTING: &str = "Connecting...";
pub const STATUS_LISTENING: &str = "Online. Listening...";
pub const STATUS_SPEAKING: &str = "Speaking...";
pub const STATUS_WAITING: &str = "Waiting for instructions...";
pub const STATUS_ERROR: &str = "Error";

/// Everything the UI shows about the assistant.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub state: ConnectionState,
    /// Human-readable phase, always in sync with `state`.
    pub message: String,
    /// Synthesized speech is currently playing.
    pub speaking: bool,
    /// Set only in `ConnectionState::Error`.
    pub error: Option<String>,
    /// Automatic reconnection attempts used in this activation.
    pub retry_attempt: u32,
    pub updated_at: DateTime<Utc>,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            state: ConnectionState::Idle,
            message: STATUS_DISCONNECTED.to_string(),
            speaking: false,
            error: None,
            retry_attempt: 0,
            updated_at: Utc::now(),
        }
    }
}

/// Writer half, owned by the session manager.
pub(crate) struct StatusPublisher {
    tx: watch::Sender<StatusSnapshot>,
}

impl StatusPublisher {
    /// Apply `f` and notify readers.
    pub(crate) fn update(&self, f: impl FnOnce(&mut StatusSnapshot)) {
        self.tx.send_modify(|snapshot| {
            f(snapshot);
            snapshot.updated_at = Utc::now();
        });
    }

    pub(crate) fn current(&self) -> StatusSnapshot {
        self.tx.borrow().clone()
    }
}

/// Reader half handed to the UI layer.
#[derive(Clone)]
pub struct StatusSurface {
    rx: watch::Receiver<StatusSnapshot>,
}

impl StatusSurface {
    /// Latest snapshot.
    pub fn snapshot(&self) -> StatusSnapshot {
        self.rx.borrow().clone()
    }

    /// A receiver notified on every change.
    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.rx.clone()
    }
}

pub(crate) fn status_channel() -> (StatusPublisher, StatusSurface) {
    let (tx, rx) = watch::channel(StatusSnapshot::default());
    (StatusPublisher { tx }, StatusSurface { rx })
}
