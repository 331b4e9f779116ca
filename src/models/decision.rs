use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Document classifier threshold. Lower scores are more document-like.
pub const DOCUMENT_THRESHOLD: f64 = 0.45;

/// Minimum cosine similarity between the two face embeddings.
pub const FACE_MATCH_THRESHOLD: f64 = 0.40;

pub const REASON_DOCUMENT_INVALID: &str =
    "The submitted image does not appear to be a valid identity document.";
pub const REASON_FACE_MISMATCH: &str = "The face does not match the document photo.";
pub const REASON_INTERNAL_ERROR: &str =
    "Verification could not be completed due to an internal error.";

/// One step of the verification pipeline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Stage {
    Document,
    Biometric,
}

impl Stage {
    /// Document stage: strictly below the threshold is approved.
    pub fn document_approves(score: f64) -> bool {
        score < DOCUMENT_THRESHOLD
    }

    /// Biometric stage: at or above the threshold is approved.
    pub fn face_match_approves(similarity: f64) -> bool {
        similarity >= FACE_MATCH_THRESHOLD
    }
}

/// Outcome of one stage for one job. Never mutated once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub approved: bool,
    /// Scorer-specific units; `None` when the scorer was never reached.
    pub score: Option<f64>,
    pub reason: Option<String>,
}

impl Decision {
    pub fn approve(score: f64) -> Self {
        Self {
            approved: true,
            score: Some(score),
            reason: None,
        }
    }

    pub fn reject(score: Option<f64>, reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            score,
            reason: Some(reason.into()),
        }
    }

    pub fn from_document_score(score: f64) -> Self {
        if Stage::document_approves(score) {
            Self::approve(score)
        } else {
            Self::reject(Some(score), REASON_DOCUMENT_INVALID)
        }
    }

    pub fn from_face_similarity(similarity: f64) -> Self {
        if Stage::face_match_approves(similarity) {
            Self::approve(similarity)
        } else {
            Self::reject(Some(similarity), REASON_FACE_MISMATCH)
        }
    }

    pub fn internal_error() -> Self {
        Self::reject(None, REASON_INTERNAL_ERROR)
    }

    /// Short label used for metrics and logs.
    pub fn outcome(&self) -> &'static str {
        if self.approved {
            "approved"
        } else {
            "rejected"
        }
    }
}
