//! [`OllamaEmbedder`] – HTTP embedding client.
//!
//! Talks to the `POST {base}/api/embeddings` endpoint of a local
//! [Ollama](https://ollama.com) server and implements the memory engine's
//! [`Embedder`] trait. Every failure (connection refused, timeout, bad JSON,
//! wrong vector length) surfaces as [`MemoryError::EmbeddingUnavailable`],
//! which is what sends the retrieval engine into its keyword fallback.
//!
//! When no server is available, use
//! [`HashingEmbedder`][mneme_memory::HashingEmbedder] instead.

use std::time::Duration;

use async_trait::async_trait;
use mneme_memory::{Embedder, MemoryError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";
pub const DEFAULT_MODEL: &str = "all-minilm";

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum EmbedderError {
    /// The HTTP request to the model server failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("embedding request timed out after {0:?}")]
    Timeout(Duration),
    #[error("unexpected response format: {0}")]
    BadResponse(String),
    #[error("model returned {actual} dimensions, expected {expected}")]
    Dimension { expected: usize, actual: usize },
}

impl From<EmbedderError> for MemoryError {
    fn from(err: EmbedderError) -> Self {
        MemoryError::EmbeddingUnavailable(err.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Wire shapes
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

// ─────────────────────────────────────────────────────────────────────────────
// OllamaEmbedder
// ─────────────────────────────────────────────────────────────────────────────

pub struct OllamaEmbedder {
    base_url: String,
    model: String,
    dimension: usize,
    timeout: Duration,
    client: reqwest::Client,
}

impl OllamaEmbedder {
    /// `dimension` must match what `model` produces; mismatching vectors are
    /// rejected rather than stored.
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, dimension: usize) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            dimension,
            timeout: Duration::from_secs(10),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> String {
        format!("{}/api/embeddings", self.base_url)
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Fetch one embedding.
    ///
    /// # Errors
    ///
    /// [`EmbedderError::Timeout`] when the server does not answer within the
    /// configured timeout, [`EmbedderError::Http`] on transport or status
    /// failures, [`EmbedderError::Dimension`] when the vector length is wrong.
    pub async fn fetch(&self, text: &str) -> Result<Vec<f32>, EmbedderError> {
        let body = EmbeddingRequest {
            model: &self.model,
            prompt: text,
        };
        let request = self.client.post(self.endpoint()).json(&body).send();

        let response: EmbeddingResponse = tokio::time::timeout(self.timeout, async {
            request.await?.error_for_status()?.json().await
        })
        .await
        .map_err(|_| EmbedderError::Timeout(self.timeout))??;

        if response.embedding.is_empty() {
            return Err(EmbedderError::BadResponse("empty embedding".into()));
        }
        if response.embedding.len() != self.dimension {
            return Err(EmbedderError::Dimension {
                expected: self.dimension,
                actual: response.embedding.len(),
            });
        }
        debug!(model = %self.model, chars = text.len(), "embedding fetched");
        Ok(response.embedding)
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError> {
        Ok(self.fetch(text).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_strips_trailing_slash() {
        let embedder = OllamaEmbedder::new("http://localhost:11434/", DEFAULT_MODEL, 384);
        assert_eq!(embedder.endpoint(), "http://localhost:11434/api/embeddings");
        assert_eq!(embedder.model(), "all-minilm");
        assert_eq!(Embedder::dimension(&embedder), 384);
    }

    #[test]
    fn request_serializes_model_and_prompt() {
        let body = EmbeddingRequest {
            model: "all-minilm",
            prompt: "login form",
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["model"], "all-minilm");
        assert_eq!(json["prompt"], "login form");
    }

    #[test]
    fn errors_map_to_embedding_unavailable() {
        let err: MemoryError = EmbedderError::Dimension { expected: 384, actual: 768 }.into();
        assert!(matches!(err, MemoryError::EmbeddingUnavailable(msg) if msg.contains("768")));
    }

    #[tokio::test]
    async fn unreachable_server_is_embedding_unavailable() {
        // Port 9 (discard) is closed on any sane test host.
        let embedder = OllamaEmbedder::new("http://127.0.0.1:9", DEFAULT_MODEL, 384)
            .with_timeout(Duration::from_secs(2));
        let result = embedder.embed("anything").await;
        assert!(matches!(result, Err(MemoryError::EmbeddingUnavailable(_))));
    }
}
