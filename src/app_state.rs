use tokio::sync::watch;

use crate::models::decision::Stage;
use crate::services::supervisor::ConnectionState;

/// Shared state passed to the worker's health route.
#[derive(Clone)]
pub struct AppState {
    pub stage: Stage,
    pub worker_id: String,
    pub connection: watch::Receiver<ConnectionState>,
}

impl AppState {
    pub fn new(stage: Stage, worker_id: &str, connection: watch::Receiver<ConnectionState>) -> Self {
        Self {
            stage,
            worker_id: worker_id.to_string(),
            connection,
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.connection.borrow()
    }
}
