//! Gemini `generateContent` client for transcript classification

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::TextClassifier;
use crate::error::SessionError;

const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// Default text model for sentiment
pub const DEFAULT_CLASSIFIER_MODEL: &str = "gemini-2.5-flash";

/// Global HTTP client for reuse across requests (avoids TLS handshake overhead)
static HTTP_CLIENT: OnceLock<Client> = OnceLock::new();

fn get_http_client() -> &'static Client {
    HTTP_CLIENT.get_or_init(|| {
        Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|e| {
                log::warn!("Classification: custom HTTP client failed ({}), using default", e);
                Client::new()
            })
    })
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    parts: Vec<TextPart<'a>>,
}

#[derive(Debug, Serialize)]
struct TextPart<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
}

/// Google API error response
#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

impl GenerateResponse {
    /// Concatenated text of the first candidate
    fn text(&self) -> Option<String> {
        let parts = &self.candidates.first()?.content.as_ref()?.parts;
        let text: String = parts.iter().filter_map(|p| p.text.as_deref()).collect();
        (!text.is_empty()).then_some(text)
    }
}

pub struct GeminiClassifier {
    api_key: String,
    model: String,
}

impl GeminiClassifier {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/{}:generateContent", API_BASE, self.model)
    }
}

#[async_trait]
impl TextClassifier for GeminiClassifier {
    async fn classify(&self, prompt: &str) -> Result<String, SessionError> {
        let request = GenerateRequest {
            contents: vec![Content {
                parts: vec![TextPart { text: prompt }],
            }],
        };

        log::info!(
            "Classification: requesting {} ({} chars)",
            self.model,
            prompt.len()
        );

        let response = get_http_client()
            .post(self.endpoint())
            .query(&[("key", self.api_key.as_str())])
            .json(&request)
            .send()
            .await
            .map_err(|e| SessionError::Classification(format!("network error: {}", e)))?;

        let status = response.status();

        if status.is_success() {
            let body: GenerateResponse = response
                .json()
                .await
                .map_err(|e| SessionError::Classification(format!("parse error: {}", e)))?;

            body.text()
                .ok_or_else(|| SessionError::Classification("empty response".to_string()))
        } else {
            let error_text = response.text().await.unwrap_or_default();

            let message =
                if let Ok(error_response) = serde_json::from_str::<ApiErrorResponse>(&error_text) {
                    error_response.error.message
                } else {
                    error_text
                };

            log::error!(
                "Classification: API error ({}): {}",
                status.as_u16(),
                message
            );

            Err(SessionError::Classification(format!(
                "API error ({}): {}",
                status.as_u16(),
                message
            )))
        }
    }
}
