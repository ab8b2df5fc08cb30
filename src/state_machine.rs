//! State machine for live sessions
//!
//! This module implements the core state machine using a single-writer pattern.
//! All state transitions go through the `reduce()` function, which returns
//! a new state and a list of effects to execute. Nothing else may move a
//! session into `Error` or start a teardown.

use std::time::Instant;
use uuid::Uuid;

use crate::error::SessionError;

/// Status line shown while the remote is being reached
pub const LOG_CONNECTING: &str = "Connecting...";
pub const LOG_CONNECTED: &str = "Connection Established.";
pub const LOG_INTERRUPTED: &str = "Model interrupted by user.";
pub const LOG_CLOSED: &str = "Session closed.";
pub const LOG_SAVED: &str = "Call saved to Dashboard.";

/// Internal state of the session workflow.
/// This is the authoritative state - all transitions go through the reducer.
#[derive(Debug, Clone, Default)]
pub enum State {
    #[default]
    Disconnected,
    Connecting {
        session_id: Uuid,
        muted: bool,
    },
    Live {
        session_id: Uuid,
        started_at: Instant,
        muted: bool,
    },
    Error {
        message: String,
        needs_credential: bool,
    },
}

/// Coarse status, as shown to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum SessionStatus {
    Disconnected,
    Connecting,
    Live,
    Error,
}

impl State {
    pub fn status(&self) -> SessionStatus {
        match self {
            State::Disconnected => SessionStatus::Disconnected,
            State::Connecting { .. } => SessionStatus::Connecting,
            State::Live { .. } => SessionStatus::Live,
            State::Error { .. } => SessionStatus::Error,
        }
    }

    pub fn session_id(&self) -> Option<Uuid> {
        match self {
            State::Connecting { session_id, .. } | State::Live { session_id, .. } => {
                Some(*session_id)
            }
            State::Disconnected | State::Error { .. } => None,
        }
    }

    pub fn is_muted(&self) -> bool {
        match self {
            State::Connecting { muted, .. } | State::Live { muted, .. } => *muted,
            _ => false,
        }
    }
}

/// Why a session is being torn down (for logs)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownReason {
    UserDisconnect,
    RemoteClosed,
    Failed,
    Exit,
}

/// Events that can trigger state transitions.
/// These come from the user, the realtime session pump and the effect runner.
#[derive(Debug, Clone)]
pub enum Event {
    /// User asked to start a session
    Connect,
    /// User asked to end the session
    Disconnect,
    /// Engine handle dropped / application exit
    Exit,
    ToggleMute,

    // Realtime session events
    RemoteOpen {
        id: Uuid,
    },
    RemoteClosed {
        id: Uuid,
        reason: String,
    },
    RemoteError {
        id: Uuid,
        err: SessionError,
    },
    /// Agent speech was cut off by the user
    Interrupted {
        id: Uuid,
    },

    // Effect runner events
    SetupFailed {
        id: Uuid,
        err: SessionError,
    },
    /// Tick while live (includes id to prevent stale ticks)
    ElapsedTick {
        id: Uuid,
    },
    TeardownDone {
        id: Uuid,
        record_saved: bool,
    },
}

/// Effects to be executed after a state transition.
/// The effect runner handles these asynchronously; `AppendLog` and `EmitUi`
/// are handled by the state loop itself.
#[derive(Debug, Clone)]
pub enum Effect {
    /// Acquire credential, microphone, speaker and recorder, then connect
    StartSession {
        id: Uuid,
    },
    /// Remote is open: wire capture to the network
    GoLive {
        id: Uuid,
        muted: bool,
    },
    /// Start sending ElapsedTick events every second while live
    StartElapsedTick {
        id: Uuid,
    },
    SetMuted {
        id: Uuid,
        muted: bool,
    },
    /// The single teardown routine
    Teardown {
        id: Uuid,
        reason: TeardownReason,
    },
    AppendLog(String),
    /// Signal to publish UI state
    EmitUi,
}

fn fail(id: Uuid, err: SessionError) -> (State, Vec<Effect>) {
    let message = err.to_string();
    (
        State::Error {
            message: message.clone(),
            needs_credential: err.needs_credential(),
        },
        vec![
            Effect::Teardown {
                id,
                reason: TeardownReason::Failed,
            },
            Effect::AppendLog(message),
            Effect::EmitUi,
        ],
    )
}

fn close(id: Uuid, reason: TeardownReason) -> (State, Vec<Effect>) {
    (
        State::Disconnected,
        vec![
            Effect::Teardown { id, reason },
            Effect::AppendLog(LOG_CLOSED.to_string()),
            Effect::EmitUi,
        ],
    )
}

/// Reducer function: (state, event) -> (next_state, effects)
///
/// Key rules:
/// - Never mutate state directly
/// - Ignore events with stale session IDs
/// - Every exit from Connecting/Live emits exactly one Teardown
pub fn reduce(state: &State, event: Event) -> (State, Vec<Effect>) {
    use Effect::*;
    use Event::*;
    use State::*;

    let current_id = state.session_id();

    // Teardown completes after the state has already moved on
    if let TeardownDone { id, record_saved } = event {
        log::debug!("Teardown of {} finished (record saved: {})", id, record_saved);
        // Teardown cleared the volume meter; republish either way
        return if record_saved {
            (state.clone(), vec![AppendLog(LOG_SAVED.to_string()), EmitUi])
        } else {
            (state.clone(), vec![EmitUi])
        };
    }

    // Helper: check if event's ID is stale (doesn't match current session)
    let event_id = match &event {
        RemoteOpen { id }
        | RemoteClosed { id, .. }
        | RemoteError { id, .. }
        | Interrupted { id }
        | SetupFailed { id, .. }
        | ElapsedTick { id } => Some(*id),
        _ => None,
    };
    if let Some(eid) = event_id {
        if current_id != Some(eid) {
            log::debug!("Ignoring stale event {:?} (current: {:?})", event, current_id);
            return (state.clone(), vec![]);
        }
    }

    match (state, event) {
        // -----------------
        // Disconnected / Error
        // -----------------
        (Disconnected | Error { .. }, Connect) => {
            let id = Uuid::new_v4();
            (
                Connecting {
                    session_id: id,
                    muted: false,
                },
                vec![
                    StartSession { id },
                    AppendLog(LOG_CONNECTING.to_string()),
                    EmitUi,
                ],
            )
        }
        // Re-entrant disconnects are no-ops
        (Disconnected | Error { .. }, Disconnect | Exit | ToggleMute) => (state.clone(), vec![]),

        // -----------------
        // Connecting
        // -----------------
        (Connecting { .. }, Connect) => (state.clone(), vec![]),
        (Connecting { session_id, muted }, RemoteOpen { .. }) => (
            Live {
                session_id: *session_id,
                started_at: Instant::now(),
                muted: *muted,
            },
            vec![
                GoLive {
                    id: *session_id,
                    muted: *muted,
                },
                StartElapsedTick { id: *session_id },
                AppendLog(LOG_CONNECTED.to_string()),
                EmitUi,
            ],
        ),
        (Connecting { session_id, muted }, ToggleMute) => (
            Connecting {
                session_id: *session_id,
                muted: !*muted,
            },
            vec![
                SetMuted {
                    id: *session_id,
                    muted: !*muted,
                },
                EmitUi,
            ],
        ),
        (Connecting { session_id, .. }, Disconnect) => {
            close(*session_id, TeardownReason::UserDisconnect)
        }

        // -----------------
        // Live
        // -----------------
        (Live { .. }, Connect) => (state.clone(), vec![]),
        (
            Live {
                session_id,
                started_at,
                muted,
            },
            ToggleMute,
        ) => (
            Live {
                session_id: *session_id,
                started_at: *started_at,
                muted: !*muted,
            },
            vec![
                SetMuted {
                    id: *session_id,
                    muted: !*muted,
                },
                EmitUi,
            ],
        ),
        (Live { session_id, .. }, Disconnect) => close(*session_id, TeardownReason::UserDisconnect),
        // Tick while live - just update UI
        (Live { .. }, ElapsedTick { .. }) => (state.clone(), vec![EmitUi]),
        (Live { .. }, Interrupted { .. }) => (
            state.clone(),
            vec![AppendLog(LOG_INTERRUPTED.to_string()), EmitUi],
        ),

        // -----------------
        // Connecting or Live
        // -----------------
        (Connecting { session_id, .. } | Live { session_id, .. }, RemoteClosed { reason, .. }) => {
            log::info!("Session {} closed by remote: {}", session_id, reason);
            close(*session_id, TeardownReason::RemoteClosed)
        }
        (
            Connecting { session_id, .. } | Live { session_id, .. },
            RemoteError { err, .. } | SetupFailed { err, .. },
        ) => fail(*session_id, err),
        (Connecting { session_id, .. } | Live { session_id, .. }, Exit) => (
            Disconnected,
            vec![
                Teardown {
                    id: *session_id,
                    reason: TeardownReason::Exit,
                },
                EmitUi,
            ],
        ),

        // -----------------
        // Fallback: ignore
        // -----------------
        (s, e) => {
            log::debug!("Ignoring event {:?} in state {:?}", e, s);
            (state.clone(), vec![])
        }
    }
}
