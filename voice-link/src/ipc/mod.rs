//! IPC protocol types for communication with the host application.
//!
//! Events use `{"event": "<name>", "data": {...}}` format (Rust -> host).
//! Commands use `{"command": "<name>", ...}` format (host -> Rust).

pub mod bridge;

use serde::{Deserialize, Serialize};

use crate::status::StatusSnapshot;

// ---------------------------------------------------------------------------
// Events: Rust -> host (stdout)
// ---------------------------------------------------------------------------

/// All events emitted to the host via stdout as JSON lines.
///
/// Serialized as `{"event": "<variant>", "data": {...}}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum VoiceEvent {
    Starting {},
    Ready {},
    /// Every change of the status surface.
    Status(StatusSnapshot),
    AudioDevices {
        input: Vec<AudioDeviceInfo>,
        output: Vec<AudioDeviceInfo>,
    },
    Pong {},
    Error { message: String },
    Stopping {},
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioDeviceInfo {
    pub id: i32,
    pub name: String,
}

impl AudioDeviceInfo {
    /// Number device names in enumeration order.
    pub fn from_names(names: Vec<String>) -> Vec<Self> {
        names
            .into_iter()
            .enumerate()
            .map(|(i, name)| Self { id: i as i32, name })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Commands: host -> Rust (stdin)
// ---------------------------------------------------------------------------

/// All commands received from the host via stdin as JSON lines.
///
/// Deserialized from `{"command": "<variant>", ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "command")]
#[serde(rename_all = "snake_case")]
pub enum VoiceCommand {
    /// Widget switched on.
    Activate {},
    /// Widget switched off.
    Deactivate {},
    /// Manual retry from the error state.
    Retry {},
    GetStatus {},
    ListAudioDevices {},
    Ping {},
    Stop {},
}
