//! Connection state, retry budget and close-code classification.

use std::time::Duration;

use serde::Serialize;

/// Lifecycle of the voice session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Not activated. No hardware held, no session open.
    Idle,
    /// Acquiring hardware, opening the session, or waiting to reconnect.
    Connecting,
    /// Session open and audio flowing both ways.
    Connected,
    /// Terminal until the user retries or deactivates.
    Error,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Automatic reconnection attempts left in the current activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetryBudget {
    pub count: u32,
    pub max: u32,
}

impl RetryBudget {
    pub fn new(max: u32) -> Self {
        Self { count: 0, max }
    }

    /// Consume one attempt. Returns the attempt number, or `None` if exhausted.
    pub fn try_consume(&mut self) -> Option<u32> {
        if self.count < self.max {
            self.count += 1;
            Some(self.count)
        } else {
            None
        }
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }
}

/// Delay before reconnect attempt `attempt` (1-based): linear backoff.
pub fn retry_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(attempt.max(1))
}

/// How a session close should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseClass {
    /// Orderly close requested by the service.
    Normal,
    /// Rejected for configuration, authorization or policy. Never retried.
    Policy,
    /// Anything else: network drop, server restart, internal error.
    Transient,
}

/// Close code used when the channel died without a close frame.
pub const ABNORMAL_CLOSE: u16 = 1006;

/// Classify a websocket close code.
pub fn classify_close(code: Option<u16>) -> CloseClass {
    match code {
        Some(1000) => CloseClass::Normal,
        // Unsupported data, invalid payload (bad key / bad setup), policy violation.
        Some(1003) | Some(1007) | Some(1008) => CloseClass::Policy,
        _ => CloseClass::Transient,
    }
}
