//! Session-level error taxonomy
//!
//! Chunk-scoped failures (`MalformedAudio`) are logged and dropped where they
//! happen. Everything else is turned into a state machine event, which is the
//! only place allowed to move the session into `Error`.

use thiserror::Error;

/// Errors that can end (or prevent) a live session
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// Microphone could not be opened (denied, missing or busy)
    #[error("Microphone access denied: {0}")]
    PermissionDenied(String),

    /// No credential for the realtime speech service
    #[error("API key not configured. Set GEMINI_API_KEY (or API_KEY) and retry.")]
    CredentialMissing,

    /// The remote rejected the credential
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Audio payload does not match the PCM16 framing contract
    #[error("Malformed audio: {0}")]
    MalformedAudio(String),

    /// Network or protocol failure reported by the realtime session
    #[error("Realtime session error: {0}")]
    Remote(String),

    /// Output device or recorder could not be set up
    #[error("Audio device error: {0}")]
    Device(String),

    /// Call record could not be persisted
    #[error("Storage error: {0}")]
    Storage(String),

    /// Text classification failed (never fatal)
    #[error("Classification failed: {0}")]
    Classification(String),
}

impl SessionError {
    /// Whether the user should be asked for a credential before retrying
    pub fn needs_credential(&self) -> bool {
        matches!(
            self,
            SessionError::CredentialMissing | SessionError::AuthenticationFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_errors_request_a_key() {
        assert!(SessionError::CredentialMissing.needs_credential());
        assert!(SessionError::AuthenticationFailed("401".into()).needs_credential());
        assert!(!SessionError::PermissionDenied("denied".into()).needs_credential());
        assert!(!SessionError::Remote("reset".into()).needs_credential());
    }

    #[test]
    fn display_mentions_env_var() {
        let err = SessionError::CredentialMissing;
        assert!(err.to_string().contains("GEMINI_API_KEY"));

        let err = SessionError::MalformedAudio("odd length".into());
        assert!(err.to_string().contains("odd length"));
    }
}
