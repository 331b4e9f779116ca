use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Registry of queues declared by any worker.
const DECLARED_QUEUES_KEY: &str = "idcheck:queues";

const LEASE_KEY_PREFIX: &str = "idcheck:lease:";

/// A message taken from a queue and not yet acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub queue: String,
    pub body: String,
}

/// What the consumer does with a delivery once its handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Requeue,
}

/// Durable queue primitive with manual acknowledgment.
///
/// One client is one logical flow on the broker; it is never shared between
/// concurrently running tasks.
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Ensure a durable queue exists. Idempotent.
    async fn declare(&self, queue: &str) -> Result<(), QueueError>;

    /// Wait up to `wait` for the next delivery on `queue`.
    ///
    /// Fails with [`QueueError::PrefetchExhausted`] while the in-flight limit
    /// is reached, so nothing new is taken before the current delivery is
    /// acknowledged.
    async fn receive(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>, QueueError>;

    /// Best-effort send with no publisher confirmation.
    async fn publish(&self, queue: &str, body: &[u8]) -> Result<(), QueueError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), QueueError>;

    /// Return deliveries left unacknowledged by a previous connection to the
    /// head of `queue`. Returns how many were moved.
    async fn recover(&self, queue: &str) -> Result<u64, QueueError>;
}

/// Redis list-backed queue client.
///
/// Publishers `LPUSH`, consumers `BLMOVE` from the right into a per-worker
/// processing list, which holds the delivered-but-unacknowledged messages.
/// Each consumer keeps a lease key alive while it receives; processing lists
/// whose owner's lease has expired are reclaimed by whoever recovers next.
pub struct RedisQueue {
    conn: MultiplexedConnection,
    worker_id: String,
    prefetch: usize,
    lease_ttl: Duration,
    in_flight: AtomicUsize,
}

impl RedisQueue {
    pub fn new(
        conn: MultiplexedConnection,
        worker_id: &str,
        prefetch: usize,
        lease_ttl: Duration,
    ) -> Self {
        Self {
            conn,
            worker_id: worker_id.to_string(),
            prefetch: prefetch.max(1),
            lease_ttl,
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Open a connection, bounded by `timeout`.
    pub async fn connect(
        client: &redis::Client,
        worker_id: &str,
        prefetch: usize,
        lease_ttl: Duration,
        timeout: Duration,
    ) -> Result<Self, QueueError> {
        let conn = tokio::time::timeout(timeout, client.get_multiplexed_async_connection())
            .await
            .map_err(|_| QueueError::ConnectTimeout(timeout))??;
        Ok(Self::new(conn, worker_id, prefetch, lease_ttl))
    }

    fn processing_key(&self, queue: &str) -> String {
        processing_key(queue, &self.worker_id)
    }

    fn release_slot(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    /// Mark this worker alive for another `lease_ttl`.
    async fn renew_lease(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(lease_key(&self.worker_id))
            .arg(1)
            .arg("PX")
            .arg(self.lease_ttl.as_millis().max(1) as u64)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    /// Move every entry of `processing` back to the head of `queue`, oldest
    /// nearest the head.
    async fn drain_into(&self, processing: &str, queue: &str) -> Result<u64, QueueError> {
        let mut conn = self.conn.clone();
        let mut moved = 0;
        loop {
            let body: Option<String> = redis::cmd("LMOVE")
                .arg(processing)
                .arg(queue)
                .arg("LEFT")
                .arg("RIGHT")
                .query_async(&mut conn)
                .await?;
            if body.is_none() {
                break;
            }
            moved += 1;
        }
        Ok(moved)
    }

    /// Processing lists of `queue` owned by workers without a live lease.
    async fn orphaned_lists(&self, queue: &str) -> Result<Vec<String>, QueueError> {
        let mut conn = self.conn.clone();
        let prefix = processing_key(queue, "");
        let pattern = format!("{}*", escape_glob(&prefix));

        let mut orphans = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;

            for key in keys {
                let Some(owner) = key.strip_prefix(&prefix) else {
                    continue;
                };
                if owner == self.worker_id {
                    continue;
                }
                let alive: bool = conn.exists(lease_key(owner)).await?;
                if !alive {
                    orphans.push(key);
                }
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(orphans)
    }
}

/// Per-worker list holding deliveries taken from `queue` but not yet acked.
pub fn processing_key(queue: &str, worker_id: &str) -> String {
    format!("{queue}:processing:{worker_id}")
}

/// Key whose presence means `worker_id` is still consuming.
pub fn lease_key(worker_id: &str) -> String {
    format!("{LEASE_KEY_PREFIX}{worker_id}")
}

fn escape_glob(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[async_trait]
impl QueueClient for RedisQueue {
    async fn declare(&self, queue: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        conn.sadd::<_, _, ()>(DECLARED_QUEUES_KEY, queue).await?;
        Ok(())
    }

    async fn receive(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let taken = self.in_flight.load(Ordering::SeqCst);
        if taken >= self.prefetch {
            return Err(QueueError::PrefetchExhausted(self.prefetch));
        }

        self.renew_lease().await?;

        let mut conn = self.conn.clone();
        let body: Option<String> = redis::cmd("BLMOVE")
            .arg(queue)
            .arg(self.processing_key(queue))
            .arg("RIGHT")
            .arg("LEFT")
            .arg(wait.as_secs_f64())
            .query_async(&mut conn)
            .await?;

        Ok(body.map(|body| {
            self.in_flight.fetch_add(1, Ordering::SeqCst);
            Delivery {
                queue: queue.to_string(),
                body,
            }
        }))
    }

    async fn publish(&self, queue: &str, body: &[u8]) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(queue, body).await?;
        Ok(())
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        conn.lrem::<_, _, ()>(self.processing_key(&delivery.queue), 1, &delivery.body)
            .await?;
        self.release_slot();
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .lrem(self.processing_key(&delivery.queue), 1, &delivery.body)
            .ignore();
        if requeue {
            // head of the queue is the right end
            pipe.rpush(&delivery.queue, &delivery.body).ignore();
        }
        pipe.query_async::<()>(&mut conn).await?;
        self.release_slot();
        Ok(())
    }

    async fn recover(&self, queue: &str) -> Result<u64, QueueError> {
        // claim liveness first so nobody reclaims this worker's list meanwhile
        self.renew_lease().await?;

        let mut moved = self.drain_into(&self.processing_key(queue), queue).await?;
        for orphan in self.orphaned_lists(queue).await? {
            let reclaimed = self.drain_into(&orphan, queue).await?;
            if reclaimed > 0 {
                tracing::warn!(list = %orphan, reclaimed, "Reclaimed deliveries from expired consumer");
            }
            moved += reclaimed;
        }

        self.in_flight.store(0, Ordering::SeqCst);
        Ok(moved)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Timed out connecting to broker after {0:?}")]
    ConnectTimeout(Duration),

    #[error("Prefetch limit of {0} unacknowledged deliveries reached")]
    PrefetchExhausted(usize),

    #[error("Broker connection closed")]
    Closed,
}
