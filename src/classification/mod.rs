//! Post-call sentiment classification
//!
//! Classification runs once per saved call, at teardown. It is strictly
//! best-effort: any failure or a slow classifier leaves the record Neutral.

mod gemini;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::SessionError;
use crate::record::{sentiment_prompt, Sentiment};

pub use gemini::{GeminiClassifier, DEFAULT_CLASSIFIER_MODEL};

/// A text-in, text-out model used to label transcripts
#[async_trait]
pub trait TextClassifier: Send + Sync {
    async fn classify(&self, prompt: &str) -> Result<String, SessionError>;
}

/// Classify a transcript, falling back to Neutral on error, timeout or empty input
pub async fn classify_sentiment(
    classifier: &dyn TextClassifier,
    transcript: &str,
    timeout: Duration,
) -> Sentiment {
    if transcript.trim().is_empty() {
        return Sentiment::Neutral;
    }

    let prompt = sentiment_prompt(transcript);
    match tokio::time::timeout(timeout, classifier.classify(&prompt)).await {
        Ok(Ok(answer)) => {
            let sentiment = Sentiment::from_classification(&answer);
            log::info!("Classification: {:?} (answer: {:?})", sentiment, answer.trim());
            sentiment
        }
        Ok(Err(e)) => {
            log::warn!("Classification: failed, using Neutral: {}", e);
            Sentiment::Neutral
        }
        Err(_) => {
            log::warn!(
                "Classification: timed out after {:?}, using Neutral",
                timeout
            );
            Sentiment::Neutral
        }
    }
}
