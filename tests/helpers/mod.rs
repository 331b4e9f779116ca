//! Test doubles for the broker and the external collaborators

#![allow(dead_code)]

use async_trait::async_trait;
use idcheck_pipeline::models::job::ImageRef;
use idcheck_pipeline::services::acquisition::{FetchError, ImageSource};
use idcheck_pipeline::services::artifacts::Artifact;
use idcheck_pipeline::services::queue::{Delivery, QueueClient, QueueError};
use idcheck_pipeline::services::scoring::{DocumentScorer, Embedding, FaceEmbedder, ScoringError};
use idcheck_pipeline::services::supervisor::{Connector, MessageHandler};
use idcheck_pipeline::services::queue::Disposition;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Worker id used by clients that do not name one.
pub const DEFAULT_WORKER: &str = "worker-a";

/// Broker state shared by every client "connection".
///
/// Queues pop from the front. Each worker has its own processing list per
/// queue holding deliveries received but not acknowledged, and a lease that
/// expires `lease_ttl` after its last receive, like the Redis binding.
pub struct InMemoryBroker {
    queues: Mutex<HashMap<String, VecDeque<String>>>,
    processing: Mutex<HashMap<(String, String), Vec<String>>>,
    leases: Mutex<HashMap<String, Instant>>,
    declared: Mutex<HashSet<String>>,
    lease_ttl: Duration,
}

impl InMemoryBroker {
    pub fn new() -> Arc<Self> {
        Self::with_lease_ttl(Duration::from_secs(60))
    }

    pub fn with_lease_ttl(lease_ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            queues: Mutex::default(),
            processing: Mutex::default(),
            leases: Mutex::default(),
            declared: Mutex::default(),
            lease_ttl,
        })
    }

    pub fn push(&self, queue: &str, body: impl Into<String>) {
        self.queues
            .lock()
            .unwrap()
            .entry(queue.to_string())
            .or_default()
            .push_back(body.into());
    }

    pub fn messages(&self, queue: &str) -> Vec<String> {
        self.queues
            .lock()
            .unwrap()
            .get(queue)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn json_messages(&self, queue: &str) -> Vec<serde_json::Value> {
        self.messages(queue)
            .iter()
            .map(|body| serde_json::from_str(body).unwrap())
            .collect()
    }

    /// Unacknowledged deliveries of `queue`, across all workers.
    pub fn unacked(&self, queue: &str) -> Vec<String> {
        self.processing
            .lock()
            .unwrap()
            .iter()
            .filter(|((q, _), _)| q == queue)
            .flat_map(|(_, list)| list.iter().cloned())
            .collect()
    }

    pub fn unacked_by(&self, queue: &str, worker_id: &str) -> Vec<String> {
        self.processing
            .lock()
            .unwrap()
            .get(&(queue.to_string(), worker_id.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn is_declared(&self, queue: &str) -> bool {
        self.declared.lock().unwrap().contains(queue)
    }

    pub fn client(self: &Arc<Self>) -> InMemoryClient {
        self.client_as(DEFAULT_WORKER)
    }

    pub fn client_as(self: &Arc<Self>, worker_id: &str) -> InMemoryClient {
        InMemoryClient::new(self.clone(), worker_id, Faults::default())
    }

    fn renew_lease(&self, worker_id: &str) {
        self.leases
            .lock()
            .unwrap()
            .insert(worker_id.to_string(), Instant::now() + self.lease_ttl);
    }

    fn lease_alive(&self, worker_id: &str) -> bool {
        self.leases
            .lock()
            .unwrap()
            .get(worker_id)
            .is_some_and(|expires| *expires > Instant::now())
    }

    /// Blocking move as the broker performs it: runs to the end on its own,
    /// whether or not the client is still waiting for the reply.
    async fn blocking_move(&self, queue: &str, worker_id: &str, wait: Duration) -> Option<String> {
        let deadline = Instant::now() + wait;
        loop {
            let next = self
                .queues
                .lock()
                .unwrap()
                .get_mut(queue)
                .and_then(|q| q.pop_front());
            if let Some(body) = next {
                self.processing
                    .lock()
                    .unwrap()
                    .entry((queue.to_string(), worker_id.to_string()))
                    .or_default()
                    .push(body.clone());
                return Some(body);
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    fn remove_unacked(&self, queue: &str, worker_id: &str, body: &str) {
        let mut processing = self.processing.lock().unwrap();
        if let Some(list) = processing.get_mut(&(queue.to_string(), worker_id.to_string())) {
            if let Some(pos) = list.iter().position(|b| b == body) {
                list.remove(pos);
            }
        }
    }
}

/// Failures a client connection injects.
#[derive(Debug, Default, Clone, Copy)]
pub struct Faults {
    /// Fail every receive once this many receives succeeded.
    pub drop_after_receives: Option<usize>,
    /// Fail every ack.
    pub fail_ack: bool,
}

pub struct InMemoryClient {
    broker: Arc<InMemoryBroker>,
    worker_id: String,
    faults: Faults,
    receives: AtomicUsize,
    in_flight: AtomicUsize,
    prefetch: usize,
}

impl InMemoryClient {
    pub fn new(broker: Arc<InMemoryBroker>, worker_id: &str, faults: Faults) -> Self {
        Self {
            broker,
            worker_id: worker_id.to_string(),
            faults,
            receives: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            prefetch: 1,
        }
    }

    fn release_slot(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }
}

#[async_trait]
impl QueueClient for InMemoryClient {
    async fn declare(&self, queue: &str) -> Result<(), QueueError> {
        self.broker.declared.lock().unwrap().insert(queue.to_string());
        Ok(())
    }

    async fn receive(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        if self.in_flight.load(Ordering::SeqCst) >= self.prefetch {
            return Err(QueueError::PrefetchExhausted(self.prefetch));
        }
        if let Some(limit) = self.faults.drop_after_receives {
            if self.receives.load(Ordering::SeqCst) >= limit {
                return Err(QueueError::Closed);
            }
        }

        self.broker.renew_lease(&self.worker_id);

        let broker = self.broker.clone();
        let worker_id = self.worker_id.clone();
        let queue_name = queue.to_string();
        let server =
            tokio::spawn(async move { broker.blocking_move(&queue_name, &worker_id, wait).await });

        match server.await.expect("broker task") {
            Some(body) => {
                self.receives.fetch_add(1, Ordering::SeqCst);
                self.in_flight.fetch_add(1, Ordering::SeqCst);
                Ok(Some(Delivery {
                    queue: queue.to_string(),
                    body,
                }))
            }
            None => Ok(None),
        }
    }

    async fn publish(&self, queue: &str, body: &[u8]) -> Result<(), QueueError> {
        self.broker
            .push(queue, String::from_utf8(body.to_vec()).expect("utf-8 body"));
        Ok(())
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        if self.faults.fail_ack {
            return Err(QueueError::Closed);
        }
        self.broker
            .remove_unacked(&delivery.queue, &self.worker_id, &delivery.body);
        self.release_slot();
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), QueueError> {
        self.broker
            .remove_unacked(&delivery.queue, &self.worker_id, &delivery.body);
        if requeue {
            self.broker
                .queues
                .lock()
                .unwrap()
                .entry(delivery.queue.clone())
                .or_default()
                .push_front(delivery.body.clone());
        }
        self.release_slot();
        Ok(())
    }

    async fn recover(&self, queue: &str) -> Result<u64, QueueError> {
        self.broker.renew_lease(&self.worker_id);

        let reclaimable: Vec<Vec<String>> = {
            let mut processing = self.broker.processing.lock().unwrap();
            let keys: Vec<(String, String)> = processing
                .keys()
                .filter(|(q, owner)| {
                    q == queue && (owner == &self.worker_id || !self.broker.lease_alive(owner))
                })
                .cloned()
                .collect();
            keys.iter().filter_map(|key| processing.remove(key)).collect()
        };

        let mut moved = 0;
        let mut queues = self.broker.queues.lock().unwrap();
        let target = queues.entry(queue.to_string()).or_default();
        for left in reclaimable {
            moved += left.len() as u64;
            for body in left.into_iter().rev() {
                target.push_front(body);
            }
        }
        self.in_flight.store(0, Ordering::SeqCst);
        Ok(moved)
    }
}

/// Connector whose first connections fail or carry faults.
pub struct FlakyConnector {
    pub broker: Arc<InMemoryBroker>,
    pub worker_id: String,
    /// Number of initial connect attempts that fail outright.
    pub refuse_first: usize,
    /// Faults applied per successful connection, in order; later ones are clean.
    pub faults: Mutex<VecDeque<Faults>>,
    pub attempts: AtomicUsize,
}

impl FlakyConnector {
    pub fn new(broker: Arc<InMemoryBroker>, refuse_first: usize, faults: Vec<Faults>) -> Self {
        Self {
            broker,
            worker_id: DEFAULT_WORKER.to_string(),
            refuse_first,
            faults: Mutex::new(faults.into()),
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn with_worker_id(mut self, worker_id: &str) -> Self {
        self.worker_id = worker_id.to_string();
        self
    }
}

#[async_trait]
impl Connector for FlakyConnector {
    type Client = InMemoryClient;

    async fn connect(&self) -> Result<InMemoryClient, QueueError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.refuse_first {
            return Err(QueueError::Closed);
        }
        let faults = self.faults.lock().unwrap().pop_front().unwrap_or_default();
        Ok(InMemoryClient::new(self.broker.clone(), &self.worker_id, faults))
    }
}

/// Handler recording every body it sees; stops the worker after `stop_after`.
pub struct RecordingHandler {
    pub seen: Mutex<Vec<String>>,
    pub stop_after: usize,
    pub shutdown: tokio_util::sync::CancellationToken,
    pub stopped: AtomicBool,
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(
        &self,
        _client: &dyn QueueClient,
        delivery: &Delivery,
    ) -> Result<Disposition, QueueError> {
        let mut seen = self.seen.lock().unwrap();
        seen.push(delivery.body.clone());
        if seen.len() >= self.stop_after && !self.stopped.swap(true, Ordering::SeqCst) {
            self.shutdown.cancel();
        }
        Ok(Disposition::Ack)
    }
}

/// Image source echoing the reference string as the image bytes.
/// References containing `corrupt` fail to decode, `missing` are not found.
pub struct EchoImages {
    pub fetches: AtomicUsize,
}

impl EchoImages {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            fetches: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ImageSource for EchoImages {
    async fn fetch(&self, image: &ImageRef) -> Result<Vec<u8>, FetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let raw = image.as_str();
        if raw.contains("corrupt") {
            Err(FetchError::Decode("unsupported image format".to_string()))
        } else if raw.contains("missing") {
            Err(FetchError::NotFound(raw.to_string()))
        } else {
            Ok(raw.as_bytes().to_vec())
        }
    }
}

fn artifact_key(image: &Artifact) -> String {
    String::from_utf8_lossy(image.bytes()).into_owned()
}

/// Document scores keyed by image reference.
pub struct ScriptedScorer {
    pub scores: HashMap<String, f64>,
    pub calls: AtomicUsize,
}

#[async_trait]
impl DocumentScorer for ScriptedScorer {
    async fn score(&self, image: &Artifact) -> Result<f64, ScoringError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.scores
            .get(&artifact_key(image))
            .copied()
            .ok_or_else(|| ScoringError::Invalid("no scripted score".to_string()))
    }
}

/// Face embeddings keyed by image reference.
pub struct ScriptedEmbedder {
    pub faces: HashMap<String, Vec<Embedding>>,
    pub calls: AtomicUsize,
}

#[async_trait]
impl FaceEmbedder for ScriptedEmbedder {
    async fn embed(&self, image: &Artifact) -> Result<Vec<Embedding>, ScoringError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.faces.get(&artifact_key(image)).cloned().unwrap_or_default())
    }
}

/// Reference face embedding; `embedding_at` measures against it.
pub fn reference_face() -> Embedding {
    vec![1.0, 0.0, 0.0, 0.0]
}

/// Unit vector at `similarity` cosine from [`reference_face`].
pub fn embedding_at(similarity: f32) -> Embedding {
    vec![similarity, (1.0 - similarity * similarity).sqrt(), 0.0, 0.0]
}
