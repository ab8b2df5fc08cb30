//! Gemini Live WebSocket client
//!
//! # Connection Flow
//!
//! 1. `connect()` - Establish WebSocket (with retries), send `setup`, spawn
//!    the receiver task
//! 2. Receiver task emits `RemoteEvent::Open` on `setupComplete`, then one
//!    `RemoteEvent::Message` per server content message
//! 3. `send_audio()` - Stream microphone frames
//! 4. `close()` - Close frame, receiver task aborted
//!
//! # Retry Strategy
//!
//! Initial connection retries 3 times with exponential backoff (1s, 2s, 4s).
//! A rejected credential (HTTP 401/403) is not retried.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{client::IntoClientRequest, Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};

use super::protocol::{ClientMessage, ServerMessage, LIVE_API_URL};
use super::{ConnectRequest, RealtimeConnector, RealtimeSession, RemoteEvent};
use crate::codec::PcmBlob;
use crate::error::SessionError;

/// Connection timeout for initial WebSocket handshake
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum retry attempts for initial connection
const MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff (doubles each retry)
const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connector for the Gemini Live API
#[derive(Debug, Clone)]
pub struct GeminiLiveConnector {
    endpoint: String,
}

impl Default for GeminiLiveConnector {
    fn default() -> Self {
        Self {
            endpoint: LIVE_API_URL.to_string(),
        }
    }
}

impl GeminiLiveConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Point at a different endpoint (proxies, local test servers)
    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }

    fn url(&self, api_key: &str) -> String {
        format!("{}?key={}", self.endpoint, api_key)
    }

    /// Single connection attempt (no retries)
    async fn try_connect(&self, api_key: &str) -> Result<WsStream, SessionError> {
        let request = self
            .url(api_key)
            .into_client_request()
            .map_err(|e| SessionError::Remote(e.to_string()))?;

        log::info!("GeminiLive: connecting...");

        let (ws_stream, _response) = timeout(
            CONNECTION_TIMEOUT,
            connect_async_with_config(
                request, None, true, // disable_nagle (we want low latency)
            ),
        )
        .await
        .map_err(|_| SessionError::Remote("Connection timeout".to_string()))?
        .map_err(map_handshake_error)?;

        Ok(ws_stream)
    }
}

/// HTTP 401/403 during the upgrade means the key was rejected
fn map_handshake_error(e: WsError) -> SessionError {
    match &e {
        WsError::Http(response) if matches!(response.status().as_u16(), 401 | 403) => {
            SessionError::AuthenticationFailed(format!("HTTP {}", response.status()))
        }
        _ => SessionError::Remote(e.to_string()),
    }
}

/// Whether a close before `setupComplete` is a credential rejection
fn is_credential_rejection(reason: &str) -> bool {
    let reason = reason.to_ascii_lowercase();
    reason.contains("api key")
        || reason.contains("permission denied")
        || reason.contains("unauthenticated")
}

#[async_trait]
impl RealtimeConnector for GeminiLiveConnector {
    async fn connect(
        &self,
        request: ConnectRequest,
        events: mpsc::Sender<RemoteEvent>,
    ) -> Result<Box<dyn RealtimeSession>, SessionError> {
        if request.api_key.is_empty() {
            return Err(SessionError::CredentialMissing);
        }

        // Retry connection with exponential backoff
        let mut last_error = None;
        let mut ws_stream = None;

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                let delay = RETRY_BASE_DELAY * 2u32.pow(attempt - 1);
                log::info!(
                    "GeminiLive: retrying connection in {:?} (attempt {}/{})",
                    delay,
                    attempt + 1,
                    MAX_RETRIES
                );
                tokio::time::sleep(delay).await;
            }

            match self.try_connect(&request.api_key).await {
                Ok(stream) => {
                    ws_stream = Some(stream);
                    break;
                }
                Err(e) if e.needs_credential() => return Err(e),
                Err(e) => {
                    log::warn!("GeminiLive: connection attempt {} failed: {}", attempt + 1, e);
                    last_error = Some(e);
                }
            }
        }

        let ws_stream = ws_stream.ok_or_else(|| {
            last_error
                .unwrap_or_else(|| SessionError::Remote("Max retries exceeded".to_string()))
        })?;

        log::info!("GeminiLive: WebSocket connected, sending setup...");

        let (write, read) = ws_stream.split();
        let mut session = GeminiLiveSession {
            write,
            receiver_task: tokio::spawn(receive_loop(read, events)),
            closed: false,
        };

        let setup = ClientMessage::setup(
            &request.model,
            &request.system_instruction,
            &request.voice_name,
        );
        session.send_message(&setup).await?;

        Ok(Box::new(session))
    }
}

/// Read frames until the socket ends, translating them to `RemoteEvent`s
async fn receive_loop(mut read: SplitStream<WsStream>, events: mpsc::Sender<RemoteEvent>) {
    let mut opened = false;
    let mut messages = 0u64;

    let final_event = loop {
        let Some(msg_result) = read.next().await else {
            break RemoteEvent::Closed {
                code: None,
                reason: "Stream ended".to_string(),
            };
        };

        let parsed = match msg_result {
            Ok(Message::Text(text)) => serde_json::from_str::<ServerMessage>(&text),
            // The Live API sends JSON in binary frames too
            Ok(Message::Binary(bytes)) => serde_json::from_slice::<ServerMessage>(&bytes),
            Ok(Message::Close(frame)) => {
                let (code, reason) = frame
                    .map(|f| (Some(u16::from(f.code)), f.reason.to_string()))
                    .unwrap_or((None, String::new()));
                log::info!("GeminiLive: closed by server ({:?}): {}", code, reason);

                if !opened && is_credential_rejection(&reason) {
                    break RemoteEvent::Error(SessionError::AuthenticationFailed(reason));
                }
                break RemoteEvent::Closed { code, reason };
            }
            Err(e) => {
                log::warn!("GeminiLive: WebSocket error: {}", e);
                break RemoteEvent::Error(SessionError::Remote(e.to_string()));
            }
            Ok(_) => continue, // Ignore ping/pong/raw frames
        };

        let msg = match parsed {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("GeminiLive: failed to parse message: {}", e);
                continue;
            }
        };

        if let Some(go_away) = &msg.go_away {
            log::warn!(
                "GeminiLive: server going away (time left: {:?})",
                go_away.time_left
            );
        }

        let event = if msg.is_setup_complete() {
            if opened {
                continue;
            }
            opened = true;
            log::info!("GeminiLive: setup complete");
            RemoteEvent::Open
        } else {
            match msg.into_server_event() {
                Some(event) => RemoteEvent::Message(event),
                None => continue,
            }
        };

        messages += 1;
        if events.send(event).await.is_err() {
            log::debug!("GeminiLive: event channel closed");
            return;
        }
    };

    log::debug!("GeminiLive: receiver task exiting after {} messages", messages);
    let _ = events.send(final_event).await;
}

/// Sending half of an open Gemini Live session
pub struct GeminiLiveSession {
    write: SplitSink<WsStream, Message>,
    receiver_task: tokio::task::JoinHandle<()>,
    closed: bool,
}

impl GeminiLiveSession {
    async fn send_message(&mut self, msg: &ClientMessage) -> Result<(), SessionError> {
        let json =
            serde_json::to_string(msg).map_err(|e| SessionError::Remote(e.to_string()))?;

        self.write
            .send(Message::Text(json))
            .await
            .map_err(|e| SessionError::Remote(format!("Failed to send: {}", e)))
    }
}

#[async_trait]
impl RealtimeSession for GeminiLiveSession {
    async fn send_audio(&mut self, blob: PcmBlob) -> Result<(), SessionError> {
        if self.closed {
            return Err(SessionError::Remote("Session closed".to_string()));
        }
        self.send_message(&ClientMessage::audio(blob)).await
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        log::info!("GeminiLive: disconnecting...");

        // Our own close should not surface as a remote event
        self.receiver_task.abort();

        if let Err(e) = self.write.close().await {
            log::warn!("GeminiLive: error closing WebSocket: {}", e);
        }
    }
}

impl Drop for GeminiLiveSession {
    fn drop(&mut self) {
        // Ensure receiver task is aborted if session is dropped without close()
        self.receiver_task.abort();
    }
}
