//! Async metric publisher.
//!
//! Decouples metric production from delivery: producers hand a snapshot to
//! [`PublisherHandle::publish`], which enqueues a sequenced [`PublishEvent`]
//! into a bounded queue and returns immediately. A background worker batches
//! events by size or linger and delivers them through a [`MetricSink`],
//! retrying with exponential backoff and jitter. The queue never applies
//! backpressure to producers beyond the configured policy: `DropOldest`
//! evicts the oldest event, `Block` waits a bounded time for space and then
//! drops the new event. Both paths count `publish_dropped_total`.

use crate::errors::ControllerError;
use crate::models::PublishEvent;
use crate::registry::{MetricKind, MetricRegistry, SeriesSnapshot};
use async_trait::async_trait;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Events dropped after exhausting delivery attempts.
pub const PUBLISH_FAILED_TOTAL: &str = "publish_failed_total";

/// Events evicted or rejected by the queue-full policy.
pub const PUBLISH_DROPPED_TOTAL: &str = "publish_dropped_total";

/// Initial delivery retry backoff in milliseconds.
const INITIAL_BACKOFF_MS: u64 = 100;

/// Maximum delivery retry backoff in milliseconds.
const MAX_BACKOFF_MS: u64 = 10_000;

/// Jitter applied to each backoff, as a fraction of the delay.
const BACKOFF_JITTER: f64 = 0.2;

/// Per-request timeout for the HTTP sink; prevents a hung broker from
/// stalling the worker.
const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Behavior when the publish queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueFullPolicy {
    /// Wait a bounded time for space, then drop the new event.
    Block,
    /// Evict the oldest queued event to make room.
    DropOldest,
}

/// Publisher tuning knobs.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub queue_capacity: usize,
    /// Deliver once this many events are queued.
    pub batch_size: usize,
    /// Deliver a partial batch after this long.
    pub linger: Duration,
    /// Delivery attempts per batch before it is discarded.
    pub max_attempts: u32,
    pub policy: QueueFullPolicy,
    /// How long `Block` waits for space before dropping.
    pub block_timeout: Duration,
    /// Upper bound on a single delivery attempt, including the shutdown
    /// flush. A sink that exceeds it counts as a failed attempt.
    pub delivery_timeout: Duration,
}

/// Delivery seam for batched publish events.
#[async_trait]
pub trait MetricSink: Send + Sync {
    /// Deliver a batch. An `Err` triggers a retry of the whole batch.
    async fn deliver(&self, batch: &[PublishEvent]) -> Result<(), ControllerError>;
}

/// HTTP sink posting JSON batches to a broker endpoint.
pub struct HttpSink {
    client: reqwest::Client,
    endpoint: String,
    topic: String,
}

impl HttpSink {
    #[must_use]
    pub fn new(endpoint: String, topic: String) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(HTTP_REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            endpoint,
            topic,
        }
    }
}

#[async_trait]
impl MetricSink for HttpSink {
    async fn deliver(&self, batch: &[PublishEvent]) -> Result<(), ControllerError> {
        let url = format!("{}/topics/{}", self.endpoint, self.topic);
        let response = self
            .client
            .post(&url)
            .json(batch)
            .send()
            .await
            .map_err(|e| ControllerError::PublishFailure(format!("request to {url}: {e}")))?;

        if !response.status().is_success() {
            return Err(ControllerError::PublishFailure(format!(
                "broker returned {} for {url}",
                response.status()
            )));
        }
        Ok(())
    }
}

struct Queue {
    events: Mutex<VecDeque<PublishEvent>>,
    /// Signalled when an event is enqueued.
    item_available: Notify,
    /// Signalled when the worker drains, for `Block` producers.
    space_available: Notify,
}

/// Producer-side handle. Cheap to clone.
#[derive(Clone)]
pub struct PublisherHandle {
    queue: Arc<Queue>,
    registry: Arc<MetricRegistry>,
    capacity: usize,
    policy: QueueFullPolicy,
    block_timeout: Duration,
    sequence: Arc<AtomicU64>,
}

impl PublisherHandle {
    /// Enqueue a snapshot for delivery. Never blocks beyond the configured
    /// `Block` timeout.
    ///
    /// # Errors
    ///
    /// Returns `PublishDropped` if the event could not be queued. Callers
    /// treat this as a warning; metric delivery is best effort.
    pub async fn publish(&self, series: Vec<SeriesSnapshot>) -> Result<(), ControllerError> {
        let mut event = PublishEvent::new(series);
        event.sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;

        loop {
            let space = self.queue.space_available.notified();
            {
                let mut events = self.queue.events.lock().await;
                if events.len() < self.capacity {
                    events.push_back(event);
                    self.queue.item_available.notify_one();
                    return Ok(());
                }
                match self.policy {
                    QueueFullPolicy::DropOldest => {
                        if let Some(evicted) = events.pop_front() {
                            debug!(
                                target: "controller.publisher",
                                sequence = evicted.sequence,
                                "Publish queue full, evicting oldest event"
                            );
                            self.registry.inc_counter(PUBLISH_DROPPED_TOTAL, &[], 1.0);
                        }
                        events.push_back(event);
                        self.queue.item_available.notify_one();
                        return Ok(());
                    }
                    QueueFullPolicy::Block => {}
                }
            }

            // Block policy: wait for the worker to drain, bounded.
            if tokio::time::timeout(self.block_timeout, space).await.is_err() {
                self.registry.inc_counter(PUBLISH_DROPPED_TOTAL, &[], 1.0);
                return Err(ControllerError::PublishDropped);
            }
        }
    }

    /// Number of events currently queued.
    pub async fn queue_depth(&self) -> usize {
        self.queue.events.lock().await.len()
    }
}

/// Spawn the publisher worker.
///
/// Returns the producer handle and the worker task. On cancellation the
/// worker makes one final delivery pass over whatever is queued, then
/// discards the rest.
pub fn spawn_publisher(
    config: PublisherConfig,
    sink: Arc<dyn MetricSink>,
    registry: Arc<MetricRegistry>,
    cancel: CancellationToken,
) -> (JoinHandle<()>, PublisherHandle) {
    let _ = registry.register(PUBLISH_FAILED_TOTAL, MetricKind::Counter, &[]);
    let _ = registry.register(PUBLISH_DROPPED_TOTAL, MetricKind::Counter, &[]);

    let queue = Arc::new(Queue {
        events: Mutex::new(VecDeque::with_capacity(config.queue_capacity)),
        item_available: Notify::new(),
        space_available: Notify::new(),
    });

    let handle = PublisherHandle {
        queue: Arc::clone(&queue),
        registry: Arc::clone(&registry),
        capacity: config.queue_capacity,
        policy: config.policy,
        block_timeout: config.block_timeout,
        sequence: Arc::new(AtomicU64::new(0)),
    };

    let task = tokio::spawn(worker_loop(config, queue, sink, registry, cancel));

    (task, handle)
}

async fn worker_loop(
    config: PublisherConfig,
    queue: Arc<Queue>,
    sink: Arc<dyn MetricSink>,
    registry: Arc<MetricRegistry>,
    cancel: CancellationToken,
) {
    loop {
        let batch = tokio::select! {
            batch = collect_batch(&queue, &config) => batch,
            () = cancel.cancelled() => break,
        };
        if batch.is_empty() {
            continue;
        }
        deliver_with_retry(&config, sink.as_ref(), &registry, batch, &cancel).await;
    }

    // Final pass: one bounded delivery attempt for whatever is still
    // queued, then discard.
    let remaining: Vec<PublishEvent> = {
        let mut events = queue.events.lock().await;
        events.drain(..).collect()
    };
    if !remaining.is_empty() {
        let count = remaining.len();
        if let Err(e) = deliver_once(sink.as_ref(), &remaining, config.delivery_timeout).await {
            registry.inc_counter(PUBLISH_FAILED_TOTAL, &[], count as f64);
            warn!(
                target: "controller.publisher",
                error = %e,
                discarded = count,
                "Discarding undelivered events at shutdown"
            );
        } else {
            info!(
                target: "controller.publisher",
                delivered = count,
                "Flushed remaining events at shutdown"
            );
        }
    }
    info!(target: "controller.publisher", "Publisher worker exiting");
}

/// Wait for at least one event, then gather up to `batch_size`, holding a
/// partial batch open for at most `linger`.
async fn collect_batch(queue: &Queue, config: &PublisherConfig) -> Vec<PublishEvent> {
    loop {
        let notified = queue.item_available.notified();
        {
            let events = queue.events.lock().await;
            if !events.is_empty() {
                break;
            }
        }
        notified.await;
    }

    tokio::time::sleep(config.linger).await;

    let mut events = queue.events.lock().await;
    let take = events.len().min(config.batch_size);
    let batch: Vec<PublishEvent> = events.drain(..take).collect();
    drop(events);
    queue.space_available.notify_waiters();
    batch
}

async fn deliver_with_retry(
    config: &PublisherConfig,
    sink: &dyn MetricSink,
    registry: &MetricRegistry,
    mut batch: Vec<PublishEvent>,
    cancel: &CancellationToken,
) {
    let mut backoff_ms = INITIAL_BACKOFF_MS;
    loop {
        for event in &mut batch {
            event.attempts += 1;
        }
        match deliver_once(sink, &batch, config.delivery_timeout).await {
            Ok(()) => {
                debug!(
                    target: "controller.publisher",
                    batch_size = batch.len(),
                    "Delivered batch"
                );
                return;
            }
            Err(e) => {
                let attempts = batch.first().map_or(0, |event| event.attempts);
                if attempts >= config.max_attempts {
                    registry.inc_counter(PUBLISH_FAILED_TOTAL, &[], batch.len() as f64);
                    warn!(
                        target: "controller.publisher",
                        error = %e,
                        attempts,
                        discarded = batch.len(),
                        "Delivery attempts exhausted, discarding batch"
                    );
                    return;
                }
                warn!(
                    target: "controller.publisher",
                    error = %e,
                    attempts,
                    backoff_ms,
                    "Delivery failed, backing off"
                );
            }
        }

        let delay = with_jitter(backoff_ms);
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = cancel.cancelled() => {
                // Shutdown mid-retry: count the in-flight batch as failed.
                registry.inc_counter(PUBLISH_FAILED_TOTAL, &[], batch.len() as f64);
                return;
            }
        }
        backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
    }
}

/// One delivery attempt, bounded so a hung sink can never stall the worker
/// past its timeout.
async fn deliver_once(
    sink: &dyn MetricSink,
    batch: &[PublishEvent],
    timeout: Duration,
) -> Result<(), ControllerError> {
    match tokio::time::timeout(timeout, sink.deliver(batch)).await {
        Ok(result) => result,
        Err(_) => Err(ControllerError::PublishFailure(format!(
            "delivery attempt timed out after {timeout:?}"
        ))),
    }
}

/// Spread a delay by +/- `BACKOFF_JITTER` so retries from multiple
/// controllers do not synchronize.
fn with_jitter(delay_ms: u64) -> Duration {
    let factor = rand::thread_rng().gen_range(1.0 - BACKOFF_JITTER..=1.0 + BACKOFF_JITTER);
    Duration::from_millis((delay_ms as f64 * factor) as u64)
}
