use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum TranscriptionError {
    #[error("Speech recognition is not configured.")]
    NotConfigured,
    #[error("Sorry, I could not understand the audio.")]
    Unrecognized,
    #[error("Error with speech service: {status}")]
    Service { status: u16 },
    #[error("Error processing the audio: {0}")]
    Http(#[from] reqwest::Error),
}

/// Speech-to-text for one recorded utterance.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: Vec<u8>, content_type: &str)
        -> Result<String, TranscriptionError>;
}

/// What `/voice/transcribe` answers: the recognised text, or a message
/// explaining why there is none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscriptOutcome {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl From<Result<String, TranscriptionError>> for TranscriptOutcome {
    fn from(result: Result<String, TranscriptionError>) -> Self {
        match result {
            Ok(text) => Self {
                text: Some(text),
                message: None,
            },
            Err(err) => Self {
                text: None,
                message: Some(err.to_string()),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct ServiceReply {
    #[serde(default)]
    text: String,
}

/// Posts raw audio to an HTTP speech service answering `{"text": "..."}`.
#[derive(Debug, Clone)]
pub struct HttpTranscriber {
    client: reqwest::Client,
    endpoint: Option<String>,
}

impl HttpTranscriber {
    pub fn new(endpoint: Option<String>, timeout: Duration) -> Result<Self, TranscriptionError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.filter(|e| !e.trim().is_empty()),
        })
    }
}

#[async_trait]
impl Transcriber for HttpTranscriber {
    async fn transcribe(
        &self,
        audio: Vec<u8>,
        content_type: &str,
    ) -> Result<String, TranscriptionError> {
        let endpoint = self
            .endpoint
            .as_deref()
            .ok_or(TranscriptionError::NotConfigured)?;
        let bytes = audio.len();
        let response = self
            .client
            .post(endpoint)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(audio)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(status = status.as_u16(), bytes, "speech service rejected audio");
            return Err(TranscriptionError::Service {
                status: status.as_u16(),
            });
        }

        let reply: ServiceReply = response.json().await?;
        let text = reply.text.trim();
        if text.is_empty() {
            return Err(TranscriptionError::Unrecognized);
        }
        tracing::debug!(bytes, chars = text.len(), "audio transcribed");
        Ok(text.to_string())
    }
}
