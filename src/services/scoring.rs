//! Scoring engine collaborators.
//!
//! Models are loaded once per process (behind the inference endpoint) and
//! only read afterwards, so sequential reuse across jobs needs no locking and
//! each worker process holds its own independent client.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use crate::services::artifacts::Artifact;

/// One face embedding vector.
pub type Embedding = Vec<f32>;

/// Document-validity classifier. Lower scores are more document-like.
#[async_trait]
pub trait DocumentScorer: Send + Sync {
    async fn score(&self, image: &Artifact) -> Result<f64, ScoringError>;
}

/// Face embedding extractor. Returns one embedding per detected face, most
/// prominent first; empty when no face was found.
#[async_trait]
pub trait FaceEmbedder: Send + Sync {
    async fn embed(&self, image: &Artifact) -> Result<Vec<Embedding>, ScoringError>;
}

/// Cosine similarity of two embeddings.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f64, ScoringError> {
    if a.len() != b.len() || a.is_empty() {
        return Err(ScoringError::Invalid(format!(
            "embedding dimensions differ ({} vs {})",
            a.len(),
            b.len()
        )));
    }

    let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return Err(ScoringError::Invalid("zero-norm embedding".to_string()));
    }

    Ok(dot / (norm_a.sqrt() * norm_b.sqrt()))
}

/// Client for an HTTP model server exposing classification and face embedding.
pub struct InferenceClient {
    http: Client,
    base_url: String,
    api_token: Option<String>,
}

#[derive(Deserialize)]
struct ClassifyResponse {
    score: f64,
}

#[derive(Deserialize)]
struct EmbedResponse {
    faces: Vec<DetectedFace>,
}

#[derive(Deserialize)]
struct DetectedFace {
    embedding: Embedding,
}

impl InferenceClient {
    pub fn new(base_url: &str, api_token: Option<String>) -> Result<Self, ScoringError> {
        let http = Client::builder().timeout(Duration::from_secs(60)).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token,
        })
    }

    /// Readiness check against the model server.
    pub async fn health_check(&self) -> Result<(), ScoringError> {
        self.authorized(self.http.get(format!("{}/health", self.base_url)))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn post_image<T: serde::de::DeserializeOwned>(
        &self,
        route: &str,
        image: &Artifact,
    ) -> Result<T, ScoringError> {
        let mime = image::guess_format(image.bytes())
            .map(|format| format.to_mime_type())
            .unwrap_or("application/octet-stream");
        let part = Part::bytes(image.bytes().to_vec())
            .file_name(image.file_name())
            .mime_str(mime)?;
        let form = Form::new().part("image", part);

        let response = self
            .authorized(self.http.post(format!("{}{}", self.base_url, route)))
            .multipart(form)
            .send()
            .await?
            .error_for_status()?;

        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(ScoringError::Parse)
    }
}

#[async_trait]
impl DocumentScorer for InferenceClient {
    async fn score(&self, image: &Artifact) -> Result<f64, ScoringError> {
        let response: ClassifyResponse = self.post_image("/v1/classify", image).await?;
        if !response.score.is_finite() {
            return Err(ScoringError::Invalid(format!("non-finite score {}", response.score)));
        }
        Ok(response.score)
    }
}

#[async_trait]
impl FaceEmbedder for InferenceClient {
    async fn embed(&self, image: &Artifact) -> Result<Vec<Embedding>, ScoringError> {
        let response: EmbedResponse = self.post_image("/v1/embed", image).await?;
        Ok(response.faces.into_iter().map(|face| face.embedding).collect())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ScoringError {
    #[error("Inference request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Failed to parse inference response: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid scoring output: {0}")]
    Invalid(String),
}
