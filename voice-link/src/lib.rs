//! voice-link: real-time voice streaming session for the assistant widget.
//!
//! Captures the microphone, streams 16 kHz PCM frames to a live audio
//! service over a websocket, plays the 24 kHz speech it sends back without
//! gaps, and keeps the connection alive with bounded, policy-aware
//! reconnection. The binary drives a `SessionManager` from JSON-line
//! commands on stdin.

pub mod audio;
pub mod config;
pub mod error;
pub mod ipc;
pub mod logging;
pub mod session;
pub mod status;

pub use config::AssistantConfig;
pub use error::{FailureKind, SessionError};
pub use session::{ConnectionState, LiveTransport, SessionConfig, SessionManager};
pub use status::{StatusSnapshot, StatusSurface};
