use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Job-scoped temporary image files.
///
/// Every [`Artifact`] handed out is removed when it goes out of scope, so a
/// stage invocation cannot leak files on any exit path, panics included.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Create the store, making sure `root` exists.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, ArtifactError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|source| ArtifactError::Io {
            path: root.clone(),
            source,
        })?;
        Ok(Self { root })
    }

    /// Write `bytes` to a fresh path unique to this job, role and call.
    pub async fn materialize(
        &self,
        job_id: &str,
        role: &str,
        bytes: Vec<u8>,
    ) -> Result<Artifact, ArtifactError> {
        let extension = image::guess_format(&bytes)
            .ok()
            .and_then(|format| format.extensions_str().first().copied())
            .unwrap_or("bin");
        let file_name = format!(
            "{}-{}-{}.{}",
            sanitize(job_id),
            sanitize(role),
            Uuid::new_v4(),
            extension
        );
        let path = self.root.join(file_name);

        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|source| ArtifactError::Io {
                path: path.clone(),
                source,
            })?;

        tracing::debug!(path = %path.display(), job_id, role, "Materialized artifact");
        Ok(Artifact {
            path,
            role: role.to_string(),
            bytes,
        })
    }
}

/// Delete an artifact file. Failures are logged and swallowed.
pub fn release(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "Released artifact"),
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to release artifact"),
    }
}

fn sanitize(part: &str) -> String {
    let cleaned: String = part
        .chars()
        .take(64)
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "job".to_string()
    } else {
        cleaned
    }
}

/// A materialized image. The file is released on drop.
#[derive(Debug)]
pub struct Artifact {
    path: PathBuf,
    role: String,
    bytes: Vec<u8>,
}

impl Artifact {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image".to_string())
    }
}

impl Drop for Artifact {
    fn drop(&mut self) {
        release(&self.path);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("Artifact I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
