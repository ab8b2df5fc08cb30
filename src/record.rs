//! Call records
//!
//! A [`CallRecord`] is assembled once, at teardown, from what the session
//! accumulated. Sessions that are both short and silent leave no record.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::SessionProfile;

/// Channel label for calls placed from this client
pub const CHANNEL_LABEL: &str = "Web Client";

/// Sessions must last strictly longer than this to be kept without a transcript
pub const MIN_RECORDED_DURATION_SECS: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Sentiment {
    Positive,
    #[default]
    Neutral,
    Negative,
}

impl Sentiment {
    /// Map a classifier's free-text answer to a label
    ///
    /// Anything that is not clearly positive or negative is Neutral.
    pub fn from_classification(text: &str) -> Self {
        let answer = text.trim().to_ascii_lowercase();
        if answer.starts_with("positive") {
            Sentiment::Positive
        } else if answer.starts_with("negative") {
            Sentiment::Negative
        } else {
            Sentiment::Neutral
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CallStatus {
    #[default]
    Connected,
    Failed,
    #[serde(rename = "No Answer")]
    NoAnswer,
    Busy,
}

/// Durable summary of one finished session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub id: String,
    pub participant_label: String,
    pub channel_label: String,
    pub status: CallStatus,
    pub duration_seconds: u64,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub sentiment: Sentiment,
    pub agent_reference: String,
    /// Path of the mixed conversation WAV
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recording_handle: Option<PathBuf>,
    #[serde(default)]
    pub transcript: String,
}

impl CallRecord {
    /// Duration as shown in call logs, e.g. `1m 5s`
    pub fn duration_display(&self) -> String {
        format!(
            "{}m {}s",
            self.duration_seconds / 60,
            self.duration_seconds % 60
        )
    }
}

/// Whether a session is worth a record
pub fn is_nontrivial(duration_seconds: u64, transcript: &str) -> bool {
    duration_seconds > MIN_RECORDED_DURATION_SECS || !transcript.trim().is_empty()
}

/// Inputs gathered by teardown
#[derive(Debug, Clone)]
pub struct RecordDraft<'a> {
    pub session_id: Uuid,
    pub profile: &'a SessionProfile,
    pub started_at: DateTime<Utc>,
    pub duration_seconds: u64,
    pub transcript: String,
    pub recording_handle: Option<PathBuf>,
}

/// Build the record, or `None` when the session was trivial
pub fn assemble(draft: RecordDraft<'_>) -> Option<CallRecord> {
    if !is_nontrivial(draft.duration_seconds, &draft.transcript) {
        log::info!(
            "Record: session {} too short ({}s, empty transcript), not saved",
            draft.session_id,
            draft.duration_seconds
        );
        return None;
    }

    Some(CallRecord {
        id: draft.session_id.to_string(),
        participant_label: draft.profile.participant_label.clone(),
        channel_label: CHANNEL_LABEL.to_string(),
        status: CallStatus::Connected,
        duration_seconds: draft.duration_seconds,
        started_at: draft.started_at,
        sentiment: Sentiment::Neutral,
        agent_reference: draft.profile.agent_reference.clone(),
        recording_handle: draft.recording_handle,
        transcript: draft.transcript,
    })
}

/// Prompt sent to the text classifier
pub fn sentiment_prompt(transcript: &str) -> String {
    format!(
        "Analyze the sentiment of the following customer conversation. \
         Answer with exactly one word: Positive, Neutral or Negative.\n\n{}",
        transcript
    )
}
