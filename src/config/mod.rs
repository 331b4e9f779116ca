use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::models::decision::Stage;
use crate::services::router::{
    Topology, DEFAULT_BIOMETRIC_QUEUE, DEFAULT_DOCUMENT_QUEUE, DEFAULT_RESPONSE_QUEUE,
};

#[derive(Debug, Deserialize)]
pub struct WorkerConfig {
    /// Which pipeline stage this process runs (`document` or `biometric`).
    pub stage: Stage,

    /// Redis connection string for the queues
    pub redis_url: String,

    /// Identity of this worker's processing list and lease. A fresh id per
    /// process is fine: lists of expired leases are reclaimed on connect.
    #[serde(default = "default_worker_id")]
    pub worker_id: String,

    #[serde(default = "default_document_queue")]
    pub document_queue: String,

    #[serde(default = "default_biometric_queue")]
    pub biometric_queue: String,

    #[serde(default = "default_response_queue")]
    pub response_queue: String,

    /// Maximum unacknowledged deliveries per consumer
    #[serde(default = "default_prefetch")]
    pub prefetch: usize,

    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,

    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,

    /// Longest single wait for a message before checking for shutdown
    #[serde(default = "default_poll_wait_secs")]
    pub poll_wait_secs: u64,

    /// How long a silent consumer keeps its unacknowledged deliveries before
    /// another worker may reclaim them. Must outlast the slowest job.
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,

    /// Directory for job-scoped temporary images
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: PathBuf,

    /// Document classifier endpoint (document stage)
    pub document_scorer_url: Option<String>,

    /// Face embedding endpoint (biometric stage)
    pub face_embedder_url: Option<String>,

    /// Bearer token for the inference endpoints
    pub scorer_api_token: Option<String>,

    /// Health and metrics listener
    #[serde(default = "default_health_addr")]
    pub health_addr: String,
}

fn default_worker_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_document_queue() -> String {
    DEFAULT_DOCUMENT_QUEUE.to_string()
}

fn default_biometric_queue() -> String {
    DEFAULT_BIOMETRIC_QUEUE.to_string()
}

fn default_response_queue() -> String {
    DEFAULT_RESPONSE_QUEUE.to_string()
}

fn default_prefetch() -> usize {
    1
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

fn default_fetch_timeout_secs() -> u64 {
    10
}

fn default_poll_wait_secs() -> u64 {
    1
}

fn default_lease_ttl_secs() -> u64 {
    300
}

fn default_artifact_dir() -> PathBuf {
    std::env::temp_dir().join("idcheck-artifacts")
}

fn default_health_addr() -> String {
    "0.0.0.0:9090".to_string()
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config: Self = envy::from_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.prefetch == 0 {
            return Err(ConfigError::Invalid("PREFETCH must be at least 1".to_string()));
        }
        if self.worker_id.trim().is_empty() {
            return Err(ConfigError::Invalid("WORKER_ID must not be empty".to_string()));
        }
        if self.lease_ttl() <= self.poll_wait() {
            return Err(ConfigError::Invalid(
                "LEASE_TTL_SECS must be longer than POLL_WAIT_SECS".to_string(),
            ));
        }
        self.scorer_url()?;
        Ok(())
    }

    /// Inference endpoint required by the configured stage.
    pub fn scorer_url(&self) -> Result<&str, ConfigError> {
        let (url, variable) = match self.stage {
            Stage::Document => (&self.document_scorer_url, "DOCUMENT_SCORER_URL"),
            Stage::Biometric => (&self.face_embedder_url, "FACE_EMBEDDER_URL"),
        };
        url.as_deref()
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| ConfigError::Missing(variable, self.stage))
    }

    pub fn topology(&self) -> Topology {
        Topology {
            document_input: self.document_queue.clone(),
            biometric_input: self.biometric_queue.clone(),
            response: self.response_queue.clone(),
        }
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn poll_wait(&self) -> Duration {
        Duration::from_secs(self.poll_wait_secs.max(1))
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration from environment: {0}")]
    Env(#[from] envy::Error),

    #[error("{0} is required for the {1} stage")]
    Missing(&'static str, Stage),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
