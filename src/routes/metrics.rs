use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

/// Prometheus metrics scrape endpoint.
pub async fn prometheus_metrics(
    axum::extract::State(handle): axum::extract::State<Arc<PrometheusHandle>>,
) -> impl IntoResponse {
    handle.render()
}

/// Register descriptions for every pipeline metric.
pub fn describe_metrics() {
    metrics::describe_counter!(
        "pipeline_messages_total",
        "Messages processed and routed, by stage and outcome"
    );
    metrics::describe_counter!(
        "pipeline_malformed_messages_total",
        "Input messages dropped because they could not be parsed"
    );
    metrics::describe_histogram!(
        "pipeline_stage_seconds",
        "Time spent deciding one job in a stage"
    );
    metrics::describe_counter!(
        "pipeline_reconnects_total",
        "Broker connections lost while consuming"
    );
    metrics::describe_gauge!(
        "pipeline_connection_state",
        "Broker connection: 0 disconnected, 1 connecting, 2 connected"
    );
}
