//! JSON wire messages for the live audio websocket.
//!
//! Client -> service: `{"setup": {...}}` once, then
//! `{"realtimeInput": {"mediaChunks": [{"mimeType": ..., "data": ...}]}}`.
//! Service -> client: `setupComplete`, `serverContent` (model turn parts with
//! inline audio, `interrupted`, `turnComplete`) and `goAway`.

use serde::{Deserialize, Serialize};

use crate::audio::{InboundFrame, OutboundFrame};

use super::transport::{ServerEvent, SessionSetup};

// ---------------------------------------------------------------------------
// Client -> service
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
enum ClientMessage<'a> {
    Setup(SetupPayload),
    RealtimeInput(RealtimeInput<'a>),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SetupPayload {
    model: String,
    generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Tool>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_modalities: Vec<&'static str>,
    speech_config: SpeechConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechConfig {
    voice_config: VoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceConfig {
    prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PrebuiltVoiceConfig {
    voice_name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Tool {
    google_search: serde_json::Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInput<'a> {
    media_chunks: &'a [OutboundFrame],
}

/// Shared by both directions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    #[serde(default)]
    pub mime_type: String,
    pub data: String,
}

/// Serialize the opening `setup` message.
pub fn setup_message(setup: &SessionSetup) -> Result<String, serde_json::Error> {
    let model = if setup.model.starts_with("models/") {
        setup.model.clone()
    } else {
        format!("models/{}", setup.model)
    };

    let system_instruction = setup
        .system_instruction
        .as_ref()
        .filter(|s| !s.trim().is_empty())
        .map(|text| Content {
            parts: vec![Part {
                text: Some(text.clone()),
                inline_data: None,
            }],
        });

    let tools = if setup.enable_search {
        vec![Tool {
            google_search: serde_json::json!({}),
        }]
    } else {
        Vec::new()
    };

    serde_json::to_string(&ClientMessage::Setup(SetupPayload {
        model,
        generation_config: GenerationConfig {
            response_modalities: vec!["AUDIO"],
            speech_config: SpeechConfig {
                voice_config: VoiceConfig {
                    prebuilt_voice_config: PrebuiltVoiceConfig {
                        voice_name: setup.voice_name.clone(),
                    },
                },
            },
        },
        system_instruction,
        tools,
    }))
}

/// Serialize one capture frame as a realtime input message.
pub fn realtime_input(frame: &OutboundFrame) -> Result<String, serde_json::Error> {
    serde_json::to_string(&ClientMessage::RealtimeInput(RealtimeInput {
        media_chunks: std::slice::from_ref(frame),
    }))
}

// ---------------------------------------------------------------------------
// Service -> client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub go_away: Option<GoAway>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<Content>,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub turn_complete: bool,
}

/// Notice that the service will close the connection soon.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    #[serde(default)]
    pub time_left: Option<String>,
}

pub fn parse_server_message(text: &str) -> Result<ServerMessage, serde_json::Error> {
    serde_json::from_str(text)
}

impl ServerMessage {
    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }

    /// Audio frames and turn flags, if this message carries server content.
    pub fn server_event(&self) -> Option<ServerEvent> {
        let content = self.server_content.as_ref()?;
        let audio = content
            .model_turn
            .iter()
            .flat_map(|turn| turn.parts.iter())
            .filter_map(|part| part.inline_data.as_ref())
            .filter(|blob| blob.mime_type.is_empty() || blob.mime_type.starts_with("audio/"))
            .map(|blob| InboundFrame::new(blob.data.clone()))
            .collect();

        Some(ServerEvent {
            audio,
            interrupted: content.interrupted,
            turn_complete: content.turn_complete,
        })
    }
}
