use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;
use crate::services::supervisor::ConnectionState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub stage: String,
    pub worker_id: String,
    pub broker: String,
}

/// GET /health: reports the broker connection as seen by the supervisor.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let connection = state.connection_state();
    let healthy = connection == ConnectionState::Connected;

    let status_code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if healthy { "ok" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        stage: state.stage.to_string(),
        worker_id: state.worker_id.clone(),
        broker: connection.to_string(),
    };

    (status_code, Json(response))
}
