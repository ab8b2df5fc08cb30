pub mod agent;
pub mod audio;
pub mod classification;
pub mod codec;
pub mod effects;
pub mod error;
pub mod playback;
pub mod record;
pub mod settings;
pub mod state_machine;
pub mod store;
pub mod streaming;
pub mod transcript;

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use audio::VolumeLevel;
use effects::{EffectRunner, LiveEffectRunner, SessionDeps};
use state_machine::{reduce, Effect, Event, State};

/// Lines kept in the on-screen session log
pub const SESSION_LOG_LINES: usize = 5;

const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Session status for the UI.
/// Uses tagged union format: { "status": "disconnected" } or { "status": "live", "elapsedSecs": 5 }
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum UiStatus {
    Disconnected,
    Connecting,
    Live {
        #[serde(rename = "elapsedSecs")]
        elapsed_secs: u64,
    },
    Error {
        message: String,
        #[serde(rename = "needsCredential")]
        needs_credential: bool,
    },
}

/// Everything the UI renders, published on every state change
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UiState {
    #[serde(flatten)]
    pub status: UiStatus,
    pub muted: bool,
    /// Microphone level, 0-100
    pub volume: f32,
    /// Most recent session log lines, oldest first
    pub logs: Vec<String>,
}

impl Default for UiState {
    fn default() -> Self {
        Self {
            status: UiStatus::Disconnected,
            muted: false,
            volume: 0.0,
            logs: Vec::new(),
        }
    }
}

impl UiState {
    pub fn is_live(&self) -> bool {
        matches!(self.status, UiStatus::Live { .. })
    }
}

/// Convert internal State to UiStatus
fn state_to_ui(state: &State) -> UiStatus {
    match state {
        State::Disconnected => UiStatus::Disconnected,
        State::Connecting { .. } => UiStatus::Connecting,
        State::Live { started_at, .. } => UiStatus::Live {
            elapsed_secs: started_at.elapsed().as_secs(),
        },
        State::Error {
            message,
            needs_credential,
        } => UiStatus::Error {
            message: message.clone(),
            needs_credential: *needs_credential,
        },
    }
}

struct UiPublisher {
    ui: watch::Sender<UiState>,
    volume: Arc<VolumeLevel>,
    logs: VecDeque<String>,
}

impl UiPublisher {
    fn append_log(&mut self, line: String) {
        log::info!("Session log: {}", line);
        if self.logs.len() == SESSION_LOG_LINES {
            self.logs.pop_front();
        }
        self.logs.push_back(line);
    }

    /// Emit a UI state update to watchers
    fn emit(&self, state: &State) {
        let ui_state = UiState {
            status: state_to_ui(state),
            muted: state.is_muted(),
            volume: self.volume.get(),
            logs: self.logs.iter().cloned().collect(),
        };
        log::debug!("Emitting UI state: {:?}", serde_json::to_string(&ui_state));
        // No watchers is fine
        let _ = self.ui.send(ui_state);
    }
}

/// Run the main state loop
async fn run_state_loop(
    mut rx: mpsc::Receiver<Event>,
    tx: mpsc::Sender<Event>,
    effect_runner: Arc<dyn EffectRunner>,
    mut publisher: UiPublisher,
) {
    let mut state = State::default();

    // Emit initial state
    publisher.emit(&state);
    log::info!("State loop started");

    while let Some(event) = rx.recv().await {
        log::debug!("Received event: {:?}", event);

        let exiting = matches!(event, Event::Exit);

        let old_discriminant = std::mem::discriminant(&state);
        let (next, effects) = reduce(&state, event);
        let new_discriminant = std::mem::discriminant(&next);

        // Log state transitions
        if old_discriminant != new_discriminant {
            log::info!("State transition: {:?} -> {:?}", state, next);
        }

        state = next;

        // Execute effects
        for eff in effects {
            match eff {
                Effect::EmitUi => publisher.emit(&state),
                Effect::AppendLog(line) => publisher.append_log(line),
                other => effect_runner.spawn(other, tx.clone()),
            }
        }

        // Exit still runs the teardown the reducer asked for
        if exiting {
            log::info!("Exit requested, waiting for teardown");
            drain_on_exit(&mut rx, &mut state, effect_runner.as_ref(), &mut publisher).await;
            break;
        }
    }

    log::info!("State loop ended");
}

/// Wait for the runner to finish while still reading events, so session tasks
/// never block on a full channel. Only UI effects are applied.
async fn drain_on_exit(
    rx: &mut mpsc::Receiver<Event>,
    state: &mut State,
    effect_runner: &dyn EffectRunner,
    publisher: &mut UiPublisher,
) {
    let drain = effect_runner.drain();
    tokio::pin!(drain);

    loop {
        tokio::select! {
            _ = &mut drain => break,
            Some(event) = rx.recv() => {
                let (next, effects) = reduce(state, event);
                *state = next;
                for eff in effects {
                    match eff {
                        Effect::EmitUi => publisher.emit(state),
                        Effect::AppendLog(line) => publisher.append_log(line),
                        other => log::debug!("Exit: skipping {:?}", other),
                    }
                }
            }
        }
    }
}

/// Handle to a running session engine
///
/// Dropping the handle ends any active session the same way a disconnect does.
pub struct LiveAgent {
    tx: mpsc::Sender<Event>,
    ui: watch::Receiver<UiState>,
    volume: Arc<VolumeLevel>,
    task: Option<JoinHandle<()>>,
}

impl LiveAgent {
    /// Start the engine with the real effect runner. Must be called within a Tokio runtime.
    pub fn start(deps: SessionDeps) -> Self {
        let runner = LiveEffectRunner::new(deps);
        let volume = runner.volume();
        Self::with_runner(runner, volume)
    }

    /// Start the state loop around any effect runner
    pub fn with_runner(effect_runner: Arc<dyn EffectRunner>, volume: Arc<VolumeLevel>) -> Self {
        let (tx, rx) = mpsc::channel::<Event>(EVENT_CHANNEL_CAPACITY);
        let (ui_tx, ui) = watch::channel(UiState::default());

        let publisher = UiPublisher {
            ui: ui_tx,
            volume: Arc::clone(&volume),
            logs: VecDeque::with_capacity(SESSION_LOG_LINES),
        };
        let task = tokio::spawn(run_state_loop(rx, tx.clone(), effect_runner, publisher));

        Self {
            tx,
            ui,
            volume,
            task: Some(task),
        }
    }

    /// Send an event to the state machine
    pub async fn send(&self, event: Event) -> Result<(), mpsc::error::SendError<Event>> {
        self.tx.send(event).await
    }

    pub async fn connect(&self) -> Result<(), mpsc::error::SendError<Event>> {
        self.send(Event::Connect).await
    }

    pub async fn disconnect(&self) -> Result<(), mpsc::error::SendError<Event>> {
        self.send(Event::Disconnect).await
    }

    pub async fn toggle_mute(&self) -> Result<(), mpsc::error::SendError<Event>> {
        self.send(Event::ToggleMute).await
    }

    /// Watch UI state changes
    pub fn ui(&self) -> watch::Receiver<UiState> {
        self.ui.clone()
    }

    pub fn snapshot(&self) -> UiState {
        self.ui.borrow().clone()
    }

    /// Current microphone level (0-100), independent of UI emits
    pub fn volume(&self) -> f32 {
        self.volume.get()
    }

    /// End any active session, wait for its teardown and stop the state loop
    pub async fn shutdown(mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        if self.tx.send(Event::Exit).await.is_err() {
            log::debug!("LiveAgent: state loop already stopped");
        }
        if let Err(e) = task.await {
            log::warn!("LiveAgent: state loop panicked: {}", e);
        }
    }
}

impl Drop for LiveAgent {
    fn drop(&mut self) {
        if self.task.is_some() {
            if let Err(e) = self.tx.try_send(Event::Exit) {
                log::warn!("LiveAgent: failed to send exit on drop: {}", e);
            }
        }
    }
}
