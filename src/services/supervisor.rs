//! Broker connection lifecycle.
//!
//! `Disconnected -> Connecting -> Connected -> (on failure) Disconnected`, driven
//! as a loop so an outage of any length keeps stack and handle usage flat.
//! Consumption state (queue declarations, recovery of unacknowledged
//! deliveries, the consumer itself) is rebuilt from scratch on every connect.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::services::queue::{Delivery, Disposition, QueueClient, QueueError, RedisQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    fn gauge_value(self) -> f64 {
        match self {
            ConnectionState::Disconnected => 0.0,
            ConnectionState::Connecting => 1.0,
            ConnectionState::Connected => 2.0,
        }
    }
}

/// Opens broker connections.
#[async_trait]
pub trait Connector: Send + Sync {
    type Client: QueueClient + 'static;

    async fn connect(&self) -> Result<Self::Client, QueueError>;
}

/// Connector for [`RedisQueue`].
pub struct RedisConnector {
    client: redis::Client,
    worker_id: String,
    prefetch: usize,
    lease_ttl: Duration,
    connect_timeout: Duration,
}

impl RedisConnector {
    pub fn new(
        redis_url: &str,
        worker_id: &str,
        prefetch: usize,
        lease_ttl: Duration,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            worker_id: worker_id.to_string(),
            prefetch,
            lease_ttl,
            connect_timeout: Duration::from_secs(10),
        })
    }
}

#[async_trait]
impl Connector for RedisConnector {
    type Client = RedisQueue;

    async fn connect(&self) -> Result<RedisQueue, QueueError> {
        RedisQueue::connect(
            &self.client,
            &self.worker_id,
            self.prefetch,
            self.lease_ttl,
            self.connect_timeout,
        )
        .await
    }
}

/// Processes one delivery. Publishing happens through the given client; the
/// returned disposition is applied by the consume loop.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(
        &self,
        client: &dyn QueueClient,
        delivery: &Delivery,
    ) -> Result<Disposition, QueueError>;
}

/// Queues a consumer needs: the one it reads and every one it declares.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub input: String,
    pub declare: Vec<String>,
    /// Upper bound on a single receive wait, so shutdown is noticed.
    pub poll_wait: Duration,
    /// How often the consumer sweeps up deliveries stranded by consumers
    /// whose lease expired.
    pub reclaim_every: Duration,
}

pub struct ConnectionSupervisor<C: Connector> {
    connector: C,
    reconnect_delay: Duration,
    state: watch::Sender<ConnectionState>,
}

impl<C: Connector> ConnectionSupervisor<C> {
    pub fn new(connector: C, reconnect_delay: Duration) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector,
            reconnect_delay,
            state,
        }
    }

    /// Observe state transitions (health endpoint).
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn transition(&self, next: ConnectionState) {
        self.state.send_replace(next);
        metrics::gauge!("pipeline_connection_state").set(next.gauge_value());
    }

    /// Run until `shutdown` is cancelled. Connectivity errors never end the loop.
    pub async fn run<H: MessageHandler>(
        &self,
        subscription: &Subscription,
        handler: &H,
        shutdown: CancellationToken,
    ) {
        let mut attempt: u64 = 0;

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            self.transition(ConnectionState::Connecting);
            attempt += 1;
            debug!(attempt, "Connecting to broker");

            let client = match self.establish(subscription).await {
                Ok(client) => client,
                Err(e) => {
                    self.transition(ConnectionState::Disconnected);
                    warn!(
                        error = %e,
                        attempt,
                        delay_secs = self.reconnect_delay.as_secs_f64(),
                        "Broker connection failed, retrying"
                    );
                    if self.wait_before_retry(&shutdown).await {
                        continue;
                    }
                    break;
                }
            };

            self.transition(ConnectionState::Connected);
            info!(queue = %subscription.input, attempt, "Connected, consuming");
            attempt = 0;

            match consume(&client, subscription, handler, &shutdown).await {
                Ok(()) => break,
                Err(e) => {
                    self.transition(ConnectionState::Disconnected);
                    metrics::counter!("pipeline_reconnects_total").increment(1);
                    error!(error = %e, "Broker connection lost, reconnecting");
                    if !self.wait_before_retry(&shutdown).await {
                        break;
                    }
                }
            }
        }

        self.transition(ConnectionState::Disconnected);
        info!("Consumer stopped");
    }

    async fn establish(&self, subscription: &Subscription) -> Result<C::Client, QueueError> {
        let client = self.connector.connect().await?;
        for queue in &subscription.declare {
            client.declare(queue).await?;
        }
        let recovered = client.recover(&subscription.input).await?;
        if recovered > 0 {
            warn!(
                queue = %subscription.input,
                recovered,
                "Requeued deliveries left unacknowledged before the last disconnect"
            );
        }
        Ok(client)
    }

    /// Returns false when shutdown arrived during the wait.
    async fn wait_before_retry(&self, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            _ = shutdown.cancelled() => false,
            _ = tokio::time::sleep(self.reconnect_delay) => true,
        }
    }
}

/// Strictly sequential consume loop. Returns `Ok` only on shutdown, which is
/// only observed between messages.
///
/// A receive is never abandoned midway: the broker may already have moved the
/// message into this worker's processing list, so a started receive runs to
/// completion (at most `poll_wait`) and anything it yields is handled.
pub async fn consume<H: MessageHandler + ?Sized>(
    client: &dyn QueueClient,
    subscription: &Subscription,
    handler: &H,
    shutdown: &CancellationToken,
) -> Result<(), QueueError> {
    let mut next_reclaim = Instant::now() + subscription.reclaim_every;

    loop {
        if shutdown.is_cancelled() {
            return Ok(());
        }

        // between messages this consumer holds nothing, so recovering is safe
        if Instant::now() >= next_reclaim {
            let reclaimed = client.recover(&subscription.input).await?;
            if reclaimed > 0 {
                warn!(
                    queue = %subscription.input,
                    reclaimed,
                    "Requeued deliveries of a departed consumer"
                );
            }
            next_reclaim = Instant::now() + subscription.reclaim_every;
        }

        let delivery = client
            .receive(&subscription.input, subscription.poll_wait)
            .await?;

        let Some(delivery) = delivery else {
            continue;
        };

        match handler.handle(client, &delivery).await? {
            Disposition::Ack => client.ack(&delivery).await?,
            Disposition::Requeue => client.nack(&delivery, true).await?,
        }
    }
}
