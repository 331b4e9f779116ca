use garde::Validate;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::models::decision::{Decision, Stage};

/// Shortest bare base64 string treated as an inline image when it starts
/// with `/` (JPEG payloads begin with `/9j/`). Anything shorter is a path.
const MIN_BARE_INLINE_LEN: usize = 64;

/// Where an image comes from.
///
/// Resolved once when the message is decoded: each variant carries the
/// normalized location it is fetched from, plus the raw string that is
/// written back unchanged when the job is forwarded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ImageRef {
    /// `http://` or `https://` location.
    Url { raw: String, url: String },
    /// Base64 payload, from a `data:<mime>;base64,` URI or bare.
    Inline { raw: String, payload: String },
    /// Local file, either `file://...` or a plain path.
    File { raw: String, path: PathBuf },
    /// Present but unusable. Fails at acquisition, so the job is rejected
    /// rather than dropped.
    Unresolvable { raw: String, reason: String },
}

impl ImageRef {
    /// Encoded payload without any data URI prefix.
    pub fn inline_payload(&self) -> Option<&str> {
        match self {
            ImageRef::Inline { payload, .. } => Some(payload),
            _ => None,
        }
    }

    pub fn file_path(&self) -> Option<&Path> {
        match self {
            ImageRef::File { path, .. } => Some(path),
            _ => None,
        }
    }

    /// The string as it arrived on the wire.
    pub fn as_str(&self) -> &str {
        match self {
            ImageRef::Url { raw, .. }
            | ImageRef::Inline { raw, .. }
            | ImageRef::File { raw, .. }
            | ImageRef::Unresolvable { raw, .. } => raw,
        }
    }

    fn resolve(raw: String) -> Self {
        let trimmed = raw.trim();
        let scheme = trimmed.get(..8).unwrap_or(trimmed).to_ascii_lowercase();

        if scheme.starts_with("http://") || scheme.starts_with("https://") {
            let url = trimmed.to_string();
            return ImageRef::Url { raw, url };
        }

        if scheme.starts_with("data:") {
            return match trimmed.split_once(',') {
                Some((_, payload)) if !payload.trim().is_empty() => {
                    let payload = payload.to_string();
                    ImageRef::Inline { raw, payload }
                }
                _ => ImageRef::Unresolvable {
                    raw,
                    reason: "data URI has no payload".to_string(),
                },
            };
        }

        if scheme.starts_with("file://") {
            let path = PathBuf::from(&trimmed["file://".len()..]);
            return ImageRef::File { raw, path };
        }

        let is_path = trimmed.starts_with("./")
            || trimmed.starts_with("../")
            // base64 never contains '.'
            || trimmed.contains('.')
            || (trimmed.starts_with('/') && !looks_like_base64(trimmed));

        if is_path {
            let path = PathBuf::from(trimmed);
            ImageRef::File { raw, path }
        } else {
            let payload = trimmed.to_string();
            ImageRef::Inline { raw, payload }
        }
    }
}

fn looks_like_base64(s: &str) -> bool {
    let compact: Vec<u8> = s.bytes().filter(|b| !b.is_ascii_whitespace()).collect();
    compact.len() >= MIN_BARE_INLINE_LEN
        && compact.len() % 4 == 0
        && compact
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'='))
}

impl TryFrom<String> for ImageRef {
    type Error = String;

    /// Only an empty reference is an error; everything else resolves.
    fn try_from(raw: String) -> Result<Self, Self::Error> {
        if raw.trim().is_empty() {
            return Err("image reference is empty".to_string());
        }
        Ok(Self::resolve(raw))
    }
}

impl From<ImageRef> for String {
    fn from(image: ImageRef) -> Self {
        match image {
            ImageRef::Url { raw, .. }
            | ImageRef::Inline { raw, .. }
            | ImageRef::File { raw, .. }
            | ImageRef::Unresolvable { raw, .. } => raw,
        }
    }
}

/// One identity-verification request as carried on the input queues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    #[garde(length(min = 1, max = 256))]
    pub correlation_id: String,

    #[garde(skip)]
    pub document_image_ref: ImageRef,

    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub face_image_ref: Option<ImageRef>,

    /// Fields this pipeline does not interpret; forwarded untouched.
    #[garde(skip)]
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Job {
    /// Decode and validate a delivery body for the given stage.
    pub fn parse(stage: Stage, body: &[u8]) -> Result<Self, MalformedMessage> {
        let job: Job = serde_json::from_slice(body)?;
        job.validate()?;

        if stage == Stage::Biometric && job.face_image_ref.is_none() {
            return Err(MalformedMessage::MissingFaceImage);
        }

        Ok(job)
    }
}

/// Terminal outcome delivered to the external caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMessage {
    pub correlation_id: String,
    pub approved: bool,
    pub reason: Option<String>,
}

impl ResponseMessage {
    pub fn from_decision(correlation_id: &str, decision: &Decision) -> Self {
        Self {
            correlation_id: correlation_id.to_string(),
            approved: decision.approved,
            reason: if decision.approved {
                None
            } else {
                decision.reason.clone()
            },
        }
    }
}

/// Wire envelope published by a stage.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Stage hand-off carrying the original job.
    Forward(Job),
    Response(ResponseMessage),
}

impl Message {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            Message::Forward(job) => serde_json::to_vec(job),
            Message::Response(response) => serde_json::to_vec(response),
        }
    }
}

/// Reasons an input message is dropped without a response.
#[derive(Debug, thiserror::Error)]
pub enum MalformedMessage {
    #[error("Invalid message body: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid message fields: {0}")]
    Invalid(#[from] garde::Report),

    #[error("Biometric stage message has no faceImageRef")]
    MissingFaceImage,
}
