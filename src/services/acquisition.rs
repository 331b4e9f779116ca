use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, StatusCode};
use std::path::Path;
use std::time::Duration;

use crate::models::job::ImageRef;

/// Bounded wait for any single image acquisition.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolves an [`ImageRef`] into raw, decodable image bytes.
#[async_trait]
pub trait ImageSource: Send + Sync {
    async fn fetch(&self, image: &ImageRef) -> Result<Vec<u8>, FetchError>;
}

/// Acquires images from URLs, inline base64 payloads and local files.
pub struct ImageFetcher {
    http: Client,
    timeout: Duration,
}

impl ImageFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let http = Client::builder()
            .user_agent(concat!("idcheck-pipeline/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        Ok(Self { http, timeout })
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self.http.get(url).send().await.map_err(|e| self.map_http(e))?;

        match response.status() {
            status if status.is_success() => {}
            StatusCode::NOT_FOUND | StatusCode::GONE => {
                return Err(FetchError::NotFound(url.to_string()))
            }
            status => return Err(FetchError::Transport(format!("{url} returned {status}"))),
        }

        let body = response.bytes().await.map_err(|e| self.map_http(e))?;
        Ok(body.to_vec())
    }

    async fn read_file(&self, path: &Path) -> Result<Vec<u8>, FetchError> {
        match tokio::time::timeout(self.timeout, tokio::fs::read(path)).await {
            Err(_) => Err(FetchError::Timeout(self.timeout)),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(FetchError::NotFound(path.display().to_string()))
            }
            Ok(Err(e)) => Err(FetchError::Transport(format!("{}: {e}", path.display()))),
            Ok(Ok(bytes)) => Ok(bytes),
        }
    }

    fn map_http(&self, e: reqwest::Error) -> FetchError {
        if e.is_timeout() {
            FetchError::Timeout(self.timeout)
        } else {
            FetchError::Transport(e.to_string())
        }
    }
}

#[async_trait]
impl ImageSource for ImageFetcher {
    async fn fetch(&self, image: &ImageRef) -> Result<Vec<u8>, FetchError> {
        let bytes = match image {
            ImageRef::Url { url, .. } => self.download(url).await?,
            ImageRef::Inline { payload, .. } => decode_inline(payload)?,
            ImageRef::File { path, .. } => self.read_file(path).await?,
            ImageRef::Unresolvable { reason, .. } => return Err(FetchError::Decode(reason.clone())),
        };

        ensure_image(&bytes)?;
        Ok(bytes)
    }
}

/// Decode a base64 payload, tolerating embedded whitespace and line breaks.
pub fn decode_inline(payload: &str) -> Result<Vec<u8>, FetchError> {
    let compact: String = payload.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    base64::engine::general_purpose::STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| FetchError::Decode(format!("invalid base64 payload: {e}")))
}

/// Reject bytes that are not a recognisable image container.
pub fn ensure_image(bytes: &[u8]) -> Result<image::ImageFormat, FetchError> {
    if bytes.is_empty() {
        return Err(FetchError::Decode("image is empty".to_string()));
    }
    image::guess_format(bytes).map_err(|e| FetchError::Decode(e.to_string()))
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FetchError {
    #[error("image not found: {0}")]
    NotFound(String),

    #[error("image acquisition timed out after {0:?}")]
    Timeout(Duration),

    #[error("image could not be decoded: {0}")]
    Decode(String),

    #[error("image transfer failed: {0}")]
    Transport(String),
}
