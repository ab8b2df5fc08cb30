//! Gemini Live API protocol types
//!
//! This module defines the JSON message types for the `BidiGenerateContent`
//! WebSocket endpoint.
//!
//! # Protocol Overview
//!
//! 1. Connect to `wss://generativelanguage.googleapis.com/ws/...BidiGenerateContent?key=...`
//! 2. Send `setup` (model, voice, system instruction, transcription on)
//! 3. Receive `setupComplete`
//! 4. Stream microphone audio via `realtimeInput.mediaChunks`
//! 5. Receive `serverContent`: model audio, transcription fragments,
//!    `turnComplete` and `interrupted`

use serde::{Deserialize, Serialize};

use super::{InboundAudio, ServerEvent};
use crate::codec::PcmBlob;

/// Gemini Live endpoint (the API key goes in the `key` query parameter)
pub const LIVE_API_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Native-audio model used when settings do not override it
pub const DEFAULT_LIVE_MODEL: &str = "models/gemini-2.5-flash-native-audio-preview-09-2025";

// ============================================================================
// Client Messages (sent TO Gemini)
// ============================================================================

/// Messages sent from client to the Live API
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    /// First message on every connection
    Setup(Setup),
    /// Streamed microphone audio
    RealtimeInput(RealtimeInput),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: Content,
    pub input_audio_transcription: TranscriptionConfig,
    pub output_audio_transcription: TranscriptionConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Content {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextPart {
    pub text: String,
}

/// Empty object: presence enables transcription
#[derive(Debug, Clone, Default, Serialize)]
pub struct TranscriptionConfig {}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<Blob>,
}

/// Inline media, in either direction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    pub data: String,
}

impl ClientMessage {
    /// Build the setup message
    pub fn setup(model: &str, system_instruction: &str, voice_name: &str) -> Self {
        ClientMessage::Setup(Setup {
            model: model.to_string(),
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: voice_name.to_string(),
                        },
                    },
                },
            },
            system_instruction: Content {
                parts: vec![TextPart {
                    text: system_instruction.to_string(),
                }],
            },
            input_audio_transcription: TranscriptionConfig::default(),
            output_audio_transcription: TranscriptionConfig::default(),
        })
    }

    /// Wrap an encoded microphone frame
    pub fn audio(blob: PcmBlob) -> Self {
        ClientMessage::RealtimeInput(RealtimeInput {
            media_chunks: vec![Blob {
                mime_type: blob.mime_type,
                data: blob.data,
            }],
        })
    }
}

// ============================================================================
// Server Messages (received FROM Gemini)
// ============================================================================

/// Messages received from the Live API
///
/// Exactly one field is normally set; unknown fields (tool calls, usage
/// metadata) are ignored.
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
    pub model_turn: Option<ModelTurn>,
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub input_transcription: Option<Transcription>,
    #[serde(default)]
    pub output_transcription: Option<Transcription>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<ModelPart>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelPart {
    #[serde(default)]
    pub inline_data: Option<Blob>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Transcription {
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    #[serde(default)]
    pub time_left: Option<String>,
}

impl ServerMessage {
    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }

    /// Flatten `serverContent` into the engine's event shape
    pub fn into_server_event(self) -> Option<ServerEvent> {
        let content = self.server_content?;

        let audio = content
            .model_turn
            .map(|turn| {
                turn.parts
                    .into_iter()
                    .filter_map(|part| part.inline_data)
                    .filter(|blob| blob.mime_type.starts_with("audio/"))
                    .map(|blob| InboundAudio {
                        data: blob.data,
                        mime_type: blob.mime_type,
                    })
                    .collect()
            })
            .unwrap_or_default();

        let fragment = |t: Option<Transcription>| t.and_then(|t| t.text).filter(|s| !s.is_empty());

        let event = ServerEvent {
            audio,
            input_transcript: fragment(content.input_transcription),
            output_transcript: fragment(content.output_transcription),
            turn_complete: content.turn_complete,
            interrupted: content.interrupted,
        };

        (!event.is_empty()).then_some(event)
    }
}
