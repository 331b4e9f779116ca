//! Per-message handling for one stage worker.

use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::models::decision::{Decision, Stage};
use crate::models::job::Job;
use crate::services::queue::{Delivery, Disposition, QueueClient, QueueError};
use crate::services::router::{self, Topology};
use crate::services::stage::StageProcessor;
use crate::services::supervisor::{MessageHandler, Subscription};

/// Consumes one stage's input queue and routes every decision.
///
/// Every well-formed message yields exactly one publish followed by an ack.
/// Malformed messages are acked and dropped. Only broker failures escape,
/// leaving the delivery unacknowledged for redelivery after reconnect.
pub struct StageWorker {
    processor: Arc<dyn StageProcessor>,
    topology: Topology,
}

impl StageWorker {
    pub fn new(processor: Arc<dyn StageProcessor>, topology: Topology) -> Self {
        Self {
            processor,
            topology,
        }
    }

    pub fn stage(&self) -> Stage {
        self.processor.stage()
    }

    pub fn subscription(&self, poll_wait: Duration, reclaim_every: Duration) -> Subscription {
        let stage = self.stage();
        Subscription {
            input: self.topology.input_for(stage).to_string(),
            declare: self.topology.queues_for(stage),
            poll_wait,
            reclaim_every,
        }
    }

    /// Run the stage processor, turning a panic into a rejection.
    async fn decide(&self, job: &Job) -> Decision {
        match AssertUnwindSafe(self.processor.process(job)).catch_unwind().await {
            Ok(decision) => decision,
            Err(_) => {
                error!(
                    stage = %self.stage(),
                    correlation_id = %job.correlation_id,
                    "Stage processor panicked, rejecting job"
                );
                Decision::internal_error()
            }
        }
    }
}

#[async_trait]
impl MessageHandler for StageWorker {
    async fn handle(
        &self,
        client: &dyn QueueClient,
        delivery: &Delivery,
    ) -> Result<Disposition, QueueError> {
        let stage = self.stage();

        let job = match Job::parse(stage, delivery.body.as_bytes()) {
            Ok(job) => job,
            Err(e) => {
                warn!(%stage, queue = %delivery.queue, error = %e, "Dropping malformed message");
                metrics::counter!("pipeline_malformed_messages_total", "stage" => stage.to_string())
                    .increment(1);
                return Ok(Disposition::Ack);
            }
        };

        info!(%stage, correlation_id = %job.correlation_id, "Processing job");
        let start = Instant::now();
        let decision = self.decide(&job).await;
        metrics::histogram!("pipeline_stage_seconds", "stage" => stage.to_string())
            .record(start.elapsed().as_secs_f64());

        let route = router::route(&self.topology, stage, &job, &decision);
        let body = route.message.to_bytes()?;
        client.publish(&route.queue, &body).await?;

        metrics::counter!(
            "pipeline_messages_total",
            "stage" => stage.to_string(),
            "outcome" => decision.outcome()
        )
        .increment(1);
        info!(
            %stage,
            correlation_id = %job.correlation_id,
            approved = decision.approved,
            score = ?decision.score,
            destination = %route.queue,
            "Job routed"
        );

        Ok(Disposition::Ack)
    }
}
