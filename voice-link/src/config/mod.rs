//! Configuration reading and data directory paths.

pub mod paths;

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::audio::CaptureConstraints;
use crate::session::{SessionConfig, SessionSetup, DEFAULT_ENDPOINT};

use paths::get_data_dir;

/// Environment variable carrying the service credential.
pub const API_KEY_ENV: &str = "VOICE_LINK_API_KEY";

const DEFAULT_MODEL: &str = "gemini-2.5-flash-native-audio-preview-12-2025";
const DEFAULT_VOICE: &str = "Kore";

/// voice_link.json shape (written by the host application).
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AssistantConfig {
    pub endpoint: String,
    pub model: String,
    /// Prebuilt voice / persona.
    pub voice_name: String,
    pub system_instruction: Option<String>,
    pub enable_search: bool,
    /// Prefer `VOICE_LINK_API_KEY`; never logged.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    /// Bound on the websocket handshake and setup send.
    pub connect_timeout_ms: u64,
    /// Bound on waiting for the service to accept the session once the
    /// audio hardware is held.
    pub open_timeout_ms: u64,
    /// Silence streamed ahead of the microphone so the assistant greets first.
    /// `0` disables it.
    pub initial_silence_ms: Option<u32>,
    pub input_device: Option<String>,
    pub outbound_queue_frames: usize,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            voice_name: DEFAULT_VOICE.to_string(),
            system_instruction: None,
            enable_search: true,
            api_key: None,
            max_retries: 3,
            retry_base_delay_ms: 1000,
            connect_timeout_ms: 10_000,
            open_timeout_ms: 15_000,
            initial_silence_ms: Some(1000),
            input_device: None,
            outbound_queue_frames: 32,
        }
    }
}

impl fmt::Debug for AssistantConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssistantConfig")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("voice_name", &self.voice_name)
            .field("system_instruction", &self.system_instruction)
            .field("enable_search", &self.enable_search)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("max_retries", &self.max_retries)
            .field("retry_base_delay_ms", &self.retry_base_delay_ms)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("open_timeout_ms", &self.open_timeout_ms)
            .field("initial_silence_ms", &self.initial_silence_ms)
            .field("input_device", &self.input_device)
            .field("outbound_queue_frames", &self.outbound_queue_frames)
            .finish()
    }
}

impl AssistantConfig {
    /// Read voice_link.json from the data directory and apply the
    /// environment. Missing or unreadable files fall back to defaults.
    pub fn load() -> Self {
        let path = get_config_path();
        let mut config = Self::load_from(&path);
        config.apply_env(|key| std::env::var(key).ok());
        info!(
            path = %path.display(),
            model = %config.model,
            voice = %config.voice_name,
            has_credential = config.api_key.is_some(),
            "Loaded assistant config"
        );
        config
    }

    /// Read a config file without touching the environment.
    pub fn load_from(path: &Path) -> Self {
        read_json_file(path).unwrap_or_default()
    }

    /// Let the environment supply the credential. Blank values are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup(API_KEY_ENV).filter(|k| !k.trim().is_empty()) {
            self.api_key = Some(key);
        }
        if self.api_key.as_deref().is_some_and(|k| k.trim().is_empty()) {
            self.api_key = None;
        }
    }

    pub fn session_setup(&self) -> SessionSetup {
        SessionSetup {
            model: self.model.clone(),
            voice_name: self.voice_name.clone(),
            system_instruction: self.system_instruction.clone(),
            enable_search: self.enable_search,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.max(1))
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            setup: self.session_setup(),
            constraints: CaptureConstraints {
                device_name: self.input_device.clone(),
                ..CaptureConstraints::default()
            },
            max_retries: self.max_retries,
            retry_base_delay: Duration::from_millis(self.retry_base_delay_ms),
            open_timeout: Duration::from_millis(self.open_timeout_ms.max(1)),
            initial_silence_ms: self.initial_silence_ms.filter(|ms| *ms > 0),
            outbound_queue_frames: self.outbound_queue_frames.max(1),
        }
    }
}

/// Path to voice_link.json.
pub fn get_config_path() -> PathBuf {
    get_data_dir().join("voice_link.json")
}

/// Generic helper: read a JSON file and deserialize it.
fn read_json_file<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str(&contents) {
            Ok(val) => Some(val),
            Err(e) => {
                warn!("Failed to parse {}: {}", path.display(), e);
                None
            }
        },
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to read {}: {}", path.display(), e);
            }
            None
        }
    }
}
