use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use crate::models::decision::{Decision, Stage};
use crate::models::job::{ImageRef, Job};
use crate::services::acquisition::{FetchError, ImageSource};
use crate::services::artifacts::{Artifact, ArtifactError, ArtifactStore};
use crate::services::scoring::{cosine_similarity, DocumentScorer, FaceEmbedder, ScoringError};

const ROLE_DOCUMENT: &str = "document";
const ROLE_FACE: &str = "face";

/// One pipeline stage: acquire images, score them, decide.
///
/// `process` never fails; every error inside the stage becomes a rejection.
/// Routing the decision is someone else's job.
#[async_trait]
pub trait StageProcessor: Send + Sync {
    fn stage(&self) -> Stage;

    async fn process(&self, job: &Job) -> Decision;
}

#[derive(Debug, thiserror::Error)]
enum StageError {
    #[error("Failed to acquire the {role} image: {source}")]
    Acquisition {
        role: &'static str,
        #[source]
        source: FetchError,
    },

    #[error("No face detected in the {0} image.")]
    NoFace(&'static str),

    #[error(transparent)]
    Scoring(#[from] ScoringError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),
}

impl StageError {
    fn into_decision(self, stage: Stage, correlation_id: &str) -> Decision {
        match self {
            StageError::Acquisition { .. } | StageError::NoFace(_) => {
                info!(%stage, correlation_id, reason = %self, "Rejected before scoring");
                Decision::reject(None, self.to_string())
            }
            StageError::Scoring(_) | StageError::Artifact(_) => {
                warn!(%stage, correlation_id, error = %self, "Stage failed, rejecting job");
                Decision::internal_error()
            }
        }
    }
}

/// Shared acquisition step: fetch the image and materialize it for the scorer.
async fn acquire(
    images: &dyn ImageSource,
    artifacts: &ArtifactStore,
    job: &Job,
    image: &ImageRef,
    role: &'static str,
) -> Result<Artifact, StageError> {
    if let ImageRef::Unresolvable { reason, .. } = image {
        return Err(StageError::Acquisition {
            role,
            source: FetchError::Decode(reason.clone()),
        });
    }

    let bytes = images
        .fetch(image)
        .await
        .map_err(|source| StageError::Acquisition { role, source })?;
    Ok(artifacts.materialize(&job.correlation_id, role, bytes).await?)
}

/// Document validity stage.
pub struct DocumentStage {
    images: Arc<dyn ImageSource>,
    scorer: Arc<dyn DocumentScorer>,
    artifacts: ArtifactStore,
}

impl DocumentStage {
    pub fn new(
        images: Arc<dyn ImageSource>,
        scorer: Arc<dyn DocumentScorer>,
        artifacts: ArtifactStore,
    ) -> Self {
        Self {
            images,
            scorer,
            artifacts,
        }
    }

    async fn evaluate(&self, job: &Job) -> Result<Decision, StageError> {
        let document = acquire(
            self.images.as_ref(),
            &self.artifacts,
            job,
            &job.document_image_ref,
            ROLE_DOCUMENT,
        )
        .await?;

        let score = self.scorer.score(&document).await?;
        info!(correlation_id = %job.correlation_id, score, "Document scored");
        Ok(Decision::from_document_score(score))
    }
}

#[async_trait]
impl StageProcessor for DocumentStage {
    fn stage(&self) -> Stage {
        Stage::Document
    }

    async fn process(&self, job: &Job) -> Decision {
        self.evaluate(job)
            .await
            .unwrap_or_else(|e| e.into_decision(Stage::Document, &job.correlation_id))
    }
}

/// Biometric face-match stage.
pub struct BiometricStage {
    images: Arc<dyn ImageSource>,
    embedder: Arc<dyn FaceEmbedder>,
    artifacts: ArtifactStore,
}

impl BiometricStage {
    pub fn new(
        images: Arc<dyn ImageSource>,
        embedder: Arc<dyn FaceEmbedder>,
        artifacts: ArtifactStore,
    ) -> Self {
        Self {
            images,
            embedder,
            artifacts,
        }
    }

    async fn evaluate(&self, job: &Job) -> Result<Decision, StageError> {
        let face_ref = job.face_image_ref.as_ref().ok_or(StageError::Acquisition {
            role: ROLE_FACE,
            source: FetchError::NotFound("faceImageRef".to_string()),
        })?;

        // both images must be in hand before the embedder is called
        let face = acquire(self.images.as_ref(), &self.artifacts, job, face_ref, ROLE_FACE).await?;
        let document = acquire(
            self.images.as_ref(),
            &self.artifacts,
            job,
            &job.document_image_ref,
            ROLE_DOCUMENT,
        )
        .await?;

        let face_embeddings = self.embedder.embed(&face).await?;
        let document_embeddings = self.embedder.embed(&document).await?;

        let face_embedding = face_embeddings.first().ok_or(StageError::NoFace(ROLE_FACE))?;
        let document_embedding = document_embeddings
            .first()
            .ok_or(StageError::NoFace(ROLE_DOCUMENT))?;

        let similarity = cosine_similarity(face_embedding, document_embedding)?;
        info!(
            correlation_id = %job.correlation_id,
            similarity,
            faces_in_face_image = face_embeddings.len(),
            faces_in_document = document_embeddings.len(),
            "Faces compared"
        );
        Ok(Decision::from_face_similarity(similarity))
    }
}

#[async_trait]
impl StageProcessor for BiometricStage {
    fn stage(&self) -> Stage {
        Stage::Biometric
    }

    async fn process(&self, job: &Job) -> Decision {
        self.evaluate(job)
            .await
            .unwrap_or_else(|e| e.into_decision(Stage::Biometric, &job.correlation_id))
    }
}
