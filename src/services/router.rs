use crate::models::decision::{Decision, Stage};
use crate::models::job::{Job, Message, ResponseMessage};

pub const DEFAULT_DOCUMENT_QUEUE: &str = "verification.document.request";
pub const DEFAULT_BIOMETRIC_QUEUE: &str = "verification.biometric.request";
pub const DEFAULT_RESPONSE_QUEUE: &str = "verification.response";

/// The fixed queue graph: document -> biometric -> response, with document
/// rejections going straight to response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub document_input: String,
    pub biometric_input: String,
    pub response: String,
}

impl Default for Topology {
    fn default() -> Self {
        Self {
            document_input: DEFAULT_DOCUMENT_QUEUE.to_string(),
            biometric_input: DEFAULT_BIOMETRIC_QUEUE.to_string(),
            response: DEFAULT_RESPONSE_QUEUE.to_string(),
        }
    }
}

impl Topology {
    pub fn input_for(&self, stage: Stage) -> &str {
        match stage {
            Stage::Document => &self.document_input,
            Stage::Biometric => &self.biometric_input,
        }
    }

    /// Every queue a stage reads from or writes to.
    pub fn queues_for(&self, stage: Stage) -> Vec<String> {
        match stage {
            Stage::Document => vec![
                self.document_input.clone(),
                self.biometric_input.clone(),
                self.response.clone(),
            ],
            Stage::Biometric => vec![self.biometric_input.clone(), self.response.clone()],
        }
    }
}

/// A message and the queue it goes to.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub queue: String,
    pub message: Message,
}

/// Pick the single destination for a stage decision.
pub fn route(topology: &Topology, stage: Stage, job: &Job, decision: &Decision) -> Route {
    match (stage, decision.approved) {
        (Stage::Document, true) => Route {
            queue: topology.biometric_input.clone(),
            message: Message::Forward(job.clone()),
        },
        (Stage::Document, false) | (Stage::Biometric, _) => Route {
            queue: topology.response.clone(),
            message: Message::Response(ResponseMessage::from_decision(
                &job.correlation_id,
                decision,
            )),
        },
    }
}
