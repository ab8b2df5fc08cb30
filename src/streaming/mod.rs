//! Realtime speech session
//!
//! A bidirectional session with a remote speech model: microphone frames go
//! up, synthesized speech, transcription fragments and turn signals come
//! down. The engine only sees the [`RealtimeConnector`] / [`RealtimeSession`]
//! traits; [`GeminiLiveConnector`] implements them over the Gemini Live
//! WebSocket API.
//!
//! # Architecture
//!
//! ```text
//! CaptureControls ──PcmBlob──▶ run_outbound() ──▶ RealtimeSession::send_audio
//!                                                        │
//!                                                    (WebSocket)
//!                                                        │
//! session pump ◀──RemoteEvent── receiver task ◀──────────┘
//! ```
//!
//! # Retry Strategy
//!
//! The initial connection retries 3 times with exponential backoff, except
//! when the server rejects the credential. Mid-session disconnects end the
//! session; there is no reconnection.

mod audio_streamer;
mod protocol;
mod realtime_client;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::codec::PcmBlob;
use crate::error::SessionError;

pub use audio_streamer::run_outbound;
pub use protocol::{ClientMessage, ServerMessage, DEFAULT_LIVE_MODEL, LIVE_API_URL};
pub use realtime_client::{GeminiLiveConnector, GeminiLiveSession};

/// Everything needed to open a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub api_key: String,
    pub model: String,
    pub system_instruction: String,
    /// Provider prebuilt voice name (e.g. `Kore`)
    pub voice_name: String,
}

/// One base64 PCM payload from the remote
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundAudio {
    pub data: String,
    pub mime_type: String,
}

/// Content of one server message, in the order it must be applied:
/// audio, transcripts, turn completion, interruption
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerEvent {
    pub audio: Vec<InboundAudio>,
    /// Transcription of the user's speech
    pub input_transcript: Option<String>,
    /// Transcription of the agent's speech
    pub output_transcript: Option<String>,
    pub turn_complete: bool,
    pub interrupted: bool,
}

impl ServerEvent {
    pub fn is_empty(&self) -> bool {
        self.audio.is_empty()
            && self.input_transcript.is_none()
            && self.output_transcript.is_none()
            && !self.turn_complete
            && !self.interrupted
    }
}

/// Lifecycle and content events delivered by a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteEvent {
    /// Session accepted the setup and is ready for audio
    Open,
    Message(ServerEvent),
    Closed { code: Option<u16>, reason: String },
    Error(SessionError),
}

/// Opens realtime sessions
#[async_trait]
pub trait RealtimeConnector: Send + Sync {
    /// Connect and send the setup; `Open` and everything after it arrive on `events`
    async fn connect(
        &self,
        request: ConnectRequest,
        events: mpsc::Sender<RemoteEvent>,
    ) -> Result<Box<dyn RealtimeSession>, SessionError>;
}

/// The sending half of an open session
#[async_trait]
pub trait RealtimeSession: Send {
    async fn send_audio(&mut self, blob: PcmBlob) -> Result<(), SessionError>;

    /// Close the session; calling it twice is harmless
    async fn close(&mut self);
}
