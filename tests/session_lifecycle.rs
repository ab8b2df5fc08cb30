//! Integration tests for the session engine
//!
//! The engine runs for real (state loop, effect runner, capture, playback,
//! recorder, teardown); only the edges are faked: the realtime connector,
//! the audio devices, the text classifier and the call record sink.
//!
//! ```bash
//! cargo test --test session_lifecycle
//! ```

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Notify};

use live_agent::audio::{AudioDevices, AudioError, DeviceStream, Mixer};
use live_agent::classification::TextClassifier;
use live_agent::codec::{self, PcmBlob};
use live_agent::effects::SessionDeps;
use live_agent::error::SessionError;
use live_agent::record::{CallRecord, Sentiment};
use live_agent::settings::LiveSettings;
use live_agent::store::{CallRecordSink, StoreError};
use live_agent::streaming::{
    ConnectRequest, InboundAudio, RealtimeConnector, RealtimeSession, RemoteEvent, ServerEvent,
};
use live_agent::{LiveAgent, UiState, UiStatus};

const WAIT: Duration = Duration::from_secs(5);

// ============================================================================
// Fakes
// ============================================================================

#[derive(Default)]
struct FakeConnector {
    connects: AtomicUsize,
    closes: Arc<AtomicUsize>,
    frames: Arc<AtomicUsize>,
    requests: Mutex<Vec<ConnectRequest>>,
    events: Mutex<Option<mpsc::Sender<RemoteEvent>>>,
}

impl FakeConnector {
    /// Deliver an event on the most recent session
    async fn emit(&self, event: RemoteEvent) {
        let events = self.events.lock().unwrap().clone().expect("no session");
        events.send(event).await.expect("event pump gone");
    }
}

struct FakeSession {
    closes: Arc<AtomicUsize>,
    frames: Arc<AtomicUsize>,
    closed: bool,
}

#[async_trait]
impl RealtimeSession for FakeSession {
    async fn send_audio(&mut self, _blob: PcmBlob) -> Result<(), SessionError> {
        self.frames.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl RealtimeConnector for FakeConnector {
    async fn connect(
        &self,
        request: ConnectRequest,
        events: mpsc::Sender<RemoteEvent>,
    ) -> Result<Box<dyn RealtimeSession>, SessionError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);
        events
            .send(RemoteEvent::Open)
            .await
            .map_err(|e| SessionError::Remote(e.to_string()))?;
        *self.events.lock().unwrap() = Some(events);

        Ok(Box::new(FakeSession {
            closes: self.closes.clone(),
            frames: self.frames.clone(),
            closed: false,
        }))
    }
}

#[derive(Default)]
struct FakeDevices {
    deny_input: AtomicBool,
    input_opens: AtomicUsize,
    input_releases: Arc<AtomicUsize>,
    output_releases: Arc<AtomicUsize>,
    mic: Mutex<Option<mpsc::Sender<Vec<f32>>>>,
    mixer: Mutex<Option<Arc<Mixer>>>,
}

impl FakeDevices {
    /// Push one block of microphone samples (16 kHz)
    async fn speak(&self, block: Vec<f32>) {
        let mic = self.mic.lock().unwrap().clone().expect("mic not open");
        mic.send(block).await.expect("capture task gone");
    }
}

impl AudioDevices for FakeDevices {
    fn open_input(&self, tx: mpsc::Sender<Vec<f32>>) -> Result<DeviceStream, AudioError> {
        if self.deny_input.load(Ordering::SeqCst) {
            return Err(AudioError::StreamCreationFailed("permission denied".into()));
        }
        self.input_opens.fetch_add(1, Ordering::SeqCst);
        *self.mic.lock().unwrap() = Some(tx);

        let releases = self.input_releases.clone();
        Ok(DeviceStream::new("input", 16_000, move || {
            releases.fetch_add(1, Ordering::SeqCst);
        }))
    }

    fn output_sample_rate(&self) -> Result<u32, AudioError> {
        Ok(24_000)
    }

    fn open_output(&self, mixer: Arc<Mixer>) -> Result<DeviceStream, AudioError> {
        *self.mixer.lock().unwrap() = Some(mixer);
        let releases = self.output_releases.clone();
        Ok(DeviceStream::new("output", 24_000, move || {
            releases.fetch_add(1, Ordering::SeqCst);
        }))
    }
}

#[derive(Default)]
struct MemorySink {
    records: Mutex<Vec<CallRecord>>,
}

impl CallRecordSink for MemorySink {
    fn append(&self, record: CallRecord) -> Result<(), StoreError> {
        self.records.lock().unwrap().insert(0, record);
        Ok(())
    }
}

struct FixedClassifier(&'static str);

#[async_trait]
impl TextClassifier for FixedClassifier {
    async fn classify(&self, _prompt: &str) -> Result<String, SessionError> {
        Ok(self.0.to_string())
    }
}

/// Holds classification open until the test releases it
#[derive(Default)]
struct GatedClassifier {
    started: AtomicBool,
    release: Notify,
}

#[async_trait]
impl TextClassifier for GatedClassifier {
    async fn classify(&self, _prompt: &str) -> Result<String, SessionError> {
        self.started.store(true, Ordering::SeqCst);
        self.release.notified().await;
        Ok("Neutral".to_string())
    }
}

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    engine: LiveAgent,
    ui: watch::Receiver<UiState>,
    connector: Arc<FakeConnector>,
    devices: Arc<FakeDevices>,
    sink: Arc<MemorySink>,
    dir: tempfile::TempDir,
}

fn harness(credential: Option<&'static str>) -> Harness {
    harness_with(credential, Arc::new(FixedClassifier("Positive")))
}

fn harness_with(
    credential: Option<&'static str>,
    classifier: Arc<dyn TextClassifier>,
) -> Harness {
    let connector = Arc::new(FakeConnector::default());
    let devices = Arc::new(FakeDevices::default());
    let sink = Arc::new(MemorySink::default());
    let dir = tempfile::tempdir().unwrap();

    let engine = LiveAgent::start(SessionDeps {
        connector: connector.clone(),
        devices: devices.clone(),
        classifier: Some(classifier),
        sink: sink.clone(),
        credential: Arc::new(move || credential.map(str::to_string)),
        settings: LiveSettings::default(),
        agent: None,
        recordings_dir: dir.path().join("recordings"),
    });
    let ui = engine.ui();

    Harness {
        engine,
        ui,
        connector,
        devices,
        sink,
        dir,
    }
}

impl Harness {
    async fn wait_ui(&mut self, f: impl FnMut(&UiState) -> bool) -> UiState {
        tokio::time::timeout(WAIT, self.ui.wait_for(f))
            .await
            .expect("timed out waiting for UI state")
            .expect("state loop stopped")
            .clone()
    }

    async fn go_live(&mut self) -> UiState {
        self.engine.connect().await.unwrap();
        self.wait_ui(UiState::is_live).await
    }

    async fn wait_released(&self, times: usize) {
        eventually(|| {
            self.devices.input_releases.load(Ordering::SeqCst) == times
                && self.devices.output_releases.load(Ordering::SeqCst) == times
        })
        .await;
    }

    fn records(&self) -> Vec<CallRecord> {
        self.sink.records.lock().unwrap().clone()
    }
}

async fn eventually(mut f: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !f() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in {:?}",
            WAIT
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn has_log(state: &UiState, line: &str) -> bool {
    state.logs.iter().any(|l| l == line)
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn connect_goes_live_after_open() {
    let mut h = harness(Some("test-key"));

    let state = h.go_live().await;
    assert!(has_log(&state, "Connection Established."));
    assert!(!state.muted);
    assert_eq!(h.devices.input_opens.load(Ordering::SeqCst), 1);

    let requests = h.connector.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].api_key, "test-key");
    assert_eq!(requests[0].voice_name, "Kore");
}

#[tokio::test]
async fn double_disconnect_releases_once() {
    let mut h = harness(Some("test-key"));
    h.go_live().await;

    h.engine.disconnect().await.unwrap();
    h.wait_ui(|s| s.status == UiStatus::Disconnected).await;
    h.wait_released(1).await;

    h.engine.disconnect().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(h.devices.input_releases.load(Ordering::SeqCst), 1);
    assert_eq!(h.devices.output_releases.load(Ordering::SeqCst), 1);
    assert_eq!(h.connector.closes.load(Ordering::SeqCst), 1);
    assert_eq!(h.snapshot_status(), UiStatus::Disconnected);
}

impl Harness {
    fn snapshot_status(&self) -> UiStatus {
        self.engine.snapshot().status
    }
}

#[tokio::test]
async fn reconnect_after_disconnect_opens_devices_again() {
    let mut h = harness(Some("test-key"));
    h.go_live().await;
    h.engine.disconnect().await.unwrap();
    h.wait_ui(|s| s.status == UiStatus::Disconnected).await;

    h.go_live().await;
    // The previous session was fully released before the new one opened
    h.wait_released(1).await;
    assert_eq!(h.devices.input_opens.load(Ordering::SeqCst), 2);
    assert_eq!(h.connector.connects.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn shutdown_tears_down_live_session() {
    let mut h = harness(Some("test-key"));
    h.go_live().await;

    let Harness {
        engine,
        devices,
        connector,
        ..
    } = h;
    engine.shutdown().await;

    assert_eq!(devices.input_releases.load(Ordering::SeqCst), 1);
    assert_eq!(devices.output_releases.load(Ordering::SeqCst), 1);
    assert_eq!(connector.closes.load(Ordering::SeqCst), 1);
}

// ============================================================================
// Mute
// ============================================================================

#[tokio::test]
async fn muted_microphone_sends_nothing() {
    let mut h = harness(Some("test-key"));
    h.go_live().await;

    h.engine.toggle_mute().await.unwrap();
    h.wait_ui(|s| s.muted).await;

    h.devices.speak(vec![0.25; 8192]).await;
    eventually(|| h.engine.volume() > 0.0).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.connector.frames.load(Ordering::SeqCst), 0);

    h.engine.toggle_mute().await.unwrap();
    h.wait_ui(|s| !s.muted).await;

    h.devices.speak(vec![0.25; 8192]).await;
    eventually(|| h.connector.frames.load(Ordering::SeqCst) == 2).await;
}

// ============================================================================
// Call records
// ============================================================================

#[tokio::test]
async fn short_silent_session_leaves_no_record() {
    let mut h = harness(Some("test-key"));
    h.go_live().await;

    h.engine.disconnect().await.unwrap();
    h.wait_released(1).await;

    assert!(h.records().is_empty());
}

#[tokio::test]
async fn long_silent_session_leaves_one_record() {
    let mut h = harness(Some("test-key"));
    h.go_live().await;

    // Durations are whole seconds and must exceed two
    tokio::time::sleep(Duration::from_millis(3_100)).await;

    h.engine.disconnect().await.unwrap();
    h.wait_ui(|s| has_log(s, "Call saved to Dashboard.")).await;
    h.wait_released(1).await;

    let records = h.records();
    assert_eq!(records.len(), 1);
    assert!(records[0].duration_seconds >= 3);
    assert!(records[0].transcript.is_empty());
    assert_eq!(records[0].sentiment, Sentiment::Neutral);
}

#[tokio::test]
async fn conversation_is_saved_once() {
    let mut h = harness(Some("test-key"));
    h.go_live().await;

    // One second of speech so the recording has content
    h.devices.speak(vec![0.25; 16_000]).await;
    eventually(|| h.engine.volume() > 0.0).await;

    h.connector
        .emit(RemoteEvent::Message(ServerEvent {
            input_transcript: Some("Na".into()),
            ..Default::default()
        }))
        .await;
    h.connector
        .emit(RemoteEvent::Message(ServerEvent {
            input_transcript: Some("maste".into()),
            output_transcript: Some("Hi".into()),
            turn_complete: true,
            ..Default::default()
        }))
        .await;

    h.engine.disconnect().await.unwrap();
    let state = h
        .wait_ui(|s| has_log(s, "Call saved to Dashboard."))
        .await;
    assert_eq!(state.status, UiStatus::Disconnected);

    let records = h.records();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.transcript, "User: Namaste\nAgent: Hi");
    assert_eq!(record.sentiment, Sentiment::Positive);
    assert_eq!(record.participant_label, "Demo User");
    assert_eq!(record.agent_reference, "demo_agent");
    assert_eq!(record.channel_label, "Web Client");

    let wav = record.recording_handle.as_ref().expect("recording saved");
    assert!(wav.starts_with(h.dir.path()));
    assert!(wav.exists());
}

#[tokio::test]
async fn pending_fragments_are_flushed_on_disconnect() {
    let mut h = harness(Some("test-key"));
    h.go_live().await;

    h.connector
        .emit(RemoteEvent::Message(ServerEvent {
            output_transcript: Some("Kaise madad".into()),
            ..Default::default()
        }))
        .await;

    h.engine.disconnect().await.unwrap();
    h.wait_ui(|s| has_log(s, "Call saved to Dashboard.")).await;

    assert_eq!(h.records()[0].transcript, "Agent: Kaise madad");
}

#[tokio::test]
async fn audio_stops_while_record_is_saved() {
    let classifier = Arc::new(GatedClassifier::default());
    let mut h = harness_with(Some("test-key"), classifier.clone());
    h.go_live().await;

    h.connector
        .emit(RemoteEvent::Message(ServerEvent {
            input_transcript: Some("Hello".into()),
            ..Default::default()
        }))
        .await;

    h.engine.disconnect().await.unwrap();
    h.wait_ui(|s| s.status == UiStatus::Disconnected).await;
    eventually(|| classifier.started.load(Ordering::SeqCst)).await;

    // Teardown is parked in classification; devices are still open
    h.devices.speak(vec![0.25; 8192]).await;
    h.connector
        .emit(RemoteEvent::Message(ServerEvent {
            audio: vec![InboundAudio {
                data: codec::encode(&[0.25; 2400]).data,
                mime_type: "audio/pcm;rate=24000".into(),
            }],
            ..Default::default()
        }))
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(h.connector.frames.load(Ordering::SeqCst), 0);
    let mixer = h.devices.mixer.lock().unwrap().clone().expect("output open");
    assert_eq!(mixer.active_sources(), 0);

    classifier.release.notify_one();
    h.wait_ui(|s| has_log(s, "Call saved to Dashboard.")).await;
    h.wait_released(1).await;
    assert_eq!(h.records().len(), 1);
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn missing_credential_asks_for_key() {
    let mut h = harness(None);

    h.engine.connect().await.unwrap();
    let state = h
        .wait_ui(|s| matches!(s.status, UiStatus::Error { .. }))
        .await;

    assert!(matches!(
        state.status,
        UiStatus::Error {
            needs_credential: true,
            ..
        }
    ));
    assert_eq!(h.devices.input_opens.load(Ordering::SeqCst), 0);
    assert_eq!(h.connector.connects.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn denied_microphone_is_retryable() {
    let mut h = harness(Some("test-key"));
    h.devices.deny_input.store(true, Ordering::SeqCst);

    h.engine.connect().await.unwrap();
    let state = h
        .wait_ui(|s| matches!(s.status, UiStatus::Error { .. }))
        .await;
    match state.status {
        UiStatus::Error {
            message,
            needs_credential,
        } => {
            assert!(message.starts_with("Microphone access denied"));
            assert!(!needs_credential);
        }
        other => panic!("expected Error, got {:?}", other),
    }
    assert_eq!(h.connector.connects.load(Ordering::SeqCst), 0);

    h.devices.deny_input.store(false, Ordering::SeqCst);
    h.go_live().await;
}

#[tokio::test]
async fn remote_error_tears_down() {
    let mut h = harness(Some("test-key"));
    h.go_live().await;

    h.connector
        .emit(RemoteEvent::Error(SessionError::Remote("socket reset".into())))
        .await;

    let state = h
        .wait_ui(|s| matches!(s.status, UiStatus::Error { .. }))
        .await;
    assert!(state.logs.iter().any(|l| l.contains("socket reset")));
    h.wait_released(1).await;
}

#[tokio::test]
async fn remote_close_disconnects() {
    let mut h = harness(Some("test-key"));
    h.go_live().await;

    h.connector
        .emit(RemoteEvent::Closed {
            code: Some(1000),
            reason: "bye".into(),
        })
        .await;

    let state = h.wait_ui(|s| s.status == UiStatus::Disconnected).await;
    assert!(has_log(&state, "Session closed."));
    h.wait_released(1).await;
}

#[tokio::test]
async fn interruption_is_logged() {
    let mut h = harness(Some("test-key"));
    h.go_live().await;

    h.connector
        .emit(RemoteEvent::Message(ServerEvent {
            interrupted: true,
            ..Default::default()
        }))
        .await;

    let state = h
        .wait_ui(|s| has_log(s, "Model interrupted by user."))
        .await;
    assert!(state.is_live());
}
