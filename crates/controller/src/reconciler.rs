//! Reconciler for `Simple` resources.
//!
//! The loop is an explicit state machine. Each reconcile starts in
//! `Fetched`, decides whether a reply is needed, and moves through
//! `Updating` to a terminal state:
//!
//! ```text
//! Fetched  -> Skipped  (record gone, or already replied)
//! Fetched  -> Updating (reply emitted, status write staged)
//! Updating -> Updated  (conditional write landed)
//! Updating -> Fetched  (version conflict, refetch with backoff)
//! Updating -> Skipped  (record deleted mid-reconcile)
//! Updating -> Errored  (attempt cap reached, or non-retryable failure)
//! ```
//!
//! Reconciles are idempotent: a record whose status is already replied
//! produces no write and no reply.
//!
//! Every terminal outcome counts `simple_reconcile_total{result}` and
//! observes `simple_reconcile_duration_seconds`; a successful update also
//! hands a registry snapshot to the async publisher.

use crate::errors::ControllerError;
use crate::models::SimpleResource;
use crate::publisher::PublisherHandle;
use crate::queue::WorkQueue;
use crate::registry::{MetricKind, MetricRegistry};
use crate::store::ResourceStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Reconcile outcome counter, labelled by `result`.
pub const RECONCILE_TOTAL: &str = "simple_reconcile_total";

/// Reconcile latency histogram.
pub const RECONCILE_DURATION_SECONDS: &str = "simple_reconcile_duration_seconds";

/// Backoff before refetching after a version conflict.
const INITIAL_CONFLICT_BACKOFF_MS: u64 = 50;
const MAX_CONFLICT_BACKOFF_MS: u64 = 2_000;

/// Terminal result of a single reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Replied and persisted `status.replied = true`.
    Updated,
    /// Status already replied; nothing to do.
    Skipped,
    /// The record is gone; nothing to clean up.
    NotFound,
}

impl ReconcileOutcome {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ReconcileOutcome::Updated => "updated",
            ReconcileOutcome::Skipped => "skipped",
            ReconcileOutcome::NotFound => "not_found",
        }
    }
}

/// State of an in-flight reconcile. See the module docs for the full
/// transition set.
#[derive(Debug)]
enum ReconcileState {
    /// The record (or its absence) is in hand; the next step decides.
    Fetched {
        resource: Option<SimpleResource>,
        attempt: u32,
    },
    /// Terminal, no write. `found` distinguishes an already-replied record
    /// from a deleted one.
    Skipped { found: bool },
    /// Reply emitted; persisting `status.replied`.
    Updating {
        resource: SimpleResource,
        attempt: u32,
    },
    /// Terminal: the conditional status write landed.
    Updated,
    /// Terminal: persistence gave up.
    Errored(ControllerError),
}

pub struct Reconciler {
    store: Arc<dyn ResourceStore>,
    registry: Arc<MetricRegistry>,
    publisher: Option<PublisherHandle>,
    max_attempts: u32,
}

impl Reconciler {
    #[must_use]
    pub fn new(
        store: Arc<dyn ResourceStore>,
        registry: Arc<MetricRegistry>,
        publisher: Option<PublisherHandle>,
        max_attempts: u32,
    ) -> Self {
        let _ = registry.register(RECONCILE_TOTAL, MetricKind::Counter, &["result"]);
        let _ = registry.register(RECONCILE_DURATION_SECONDS, MetricKind::Histogram, &[]);
        Self {
            store,
            registry,
            publisher,
            max_attempts,
        }
    }

    /// Reconcile one `namespace/name` key to completion.
    ///
    /// # Errors
    ///
    /// Returns `PersistenceFailure` once the attempt cap is reached without
    /// a successful status write. Transient conflicts inside the cap are
    /// absorbed by refetching.
    pub async fn reconcile(&self, key: &str) -> Result<ReconcileOutcome, ControllerError> {
        let started = std::time::Instant::now();
        let result = self.run_to_terminal(key).await;

        let label = match &result {
            Ok(outcome) => outcome.as_str(),
            Err(_) => "error",
        };
        self.registry
            .inc_counter(RECONCILE_TOTAL, &[("result", label)], 1.0);
        self.registry.observe(
            RECONCILE_DURATION_SECONDS,
            &[],
            started.elapsed().as_secs_f64(),
        );

        // Snapshots ship only after a successful update; skips, misses and
        // errors produce no publish traffic.
        if matches!(result, Ok(ReconcileOutcome::Updated)) {
            if let Some(publisher) = &self.publisher {
                if let Err(e) = publisher.publish(self.registry.snapshot().series).await {
                    warn!(
                        target: "controller.reconciler",
                        key,
                        error = %e,
                        "Metric publish dropped, continuing"
                    );
                }
            }
        }

        result
    }

    /// Drive the state machine until a terminal state.
    async fn run_to_terminal(&self, key: &str) -> Result<ReconcileOutcome, ControllerError> {
        let mut state = self.fetch(key, 1).await;
        loop {
            state = match state {
                ReconcileState::Fetched { resource, attempt } => {
                    self.decide(key, resource, attempt)
                }
                ReconcileState::Updating { resource, attempt } => {
                    self.persist(key, resource, attempt).await
                }
                ReconcileState::Skipped { found: true } => return Ok(ReconcileOutcome::Skipped),
                ReconcileState::Skipped { found: false } => {
                    return Ok(ReconcileOutcome::NotFound)
                }
                ReconcileState::Updated => return Ok(ReconcileOutcome::Updated),
                ReconcileState::Errored(e) => return Err(e),
            };
        }
    }

    async fn fetch(&self, key: &str, attempt: u32) -> ReconcileState {
        ReconcileState::Fetched {
            resource: self.store.get(key).await,
            attempt,
        }
    }

    /// `Fetched -> Skipped | Updating`.
    fn decide(&self, key: &str, resource: Option<SimpleResource>, attempt: u32) -> ReconcileState {
        let Some(mut resource) = resource else {
            debug!(target: "controller.reconciler", key, "Resource gone, nothing to do");
            return ReconcileState::Skipped { found: false };
        };

        if resource.status.replied {
            debug!(target: "controller.reconciler", key, "Already replied, skipping");
            return ReconcileState::Skipped { found: true };
        }

        // The controller's one observable side effect.
        info!(
            target: "controller.reconciler",
            key,
            message = %resource.spec.message,
            "Replying to resource message"
        );
        resource.status.replied = true;
        ReconcileState::Updating { resource, attempt }
    }

    /// `Updating -> Updated | Fetched | Skipped | Errored`.
    async fn persist(&self, key: &str, resource: SimpleResource, attempt: u32) -> ReconcileState {
        match self.store.update_status(&resource).await {
            Ok(_) => ReconcileState::Updated,
            Err(ControllerError::NotFound(_)) => {
                debug!(target: "controller.reconciler", key, "Deleted mid-reconcile");
                ReconcileState::Skipped { found: false }
            }
            Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                debug!(
                    target: "controller.reconciler",
                    key,
                    attempt,
                    error = %e,
                    "Status write conflicted, refetching"
                );
                tokio::time::sleep(conflict_backoff(attempt)).await;
                self.fetch(key, attempt + 1).await
            }
            Err(e) if e.is_retryable() => {
                ReconcileState::Errored(ControllerError::PersistenceFailure {
                    key: key.to_string(),
                    attempts: self.max_attempts,
                })
            }
            Err(e) => ReconcileState::Errored(e),
        }
    }
}

fn conflict_backoff(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let delay = INITIAL_CONFLICT_BACKOFF_MS << exponent;
    Duration::from_millis(delay.min(MAX_CONFLICT_BACKOFF_MS))
}

/// Spawn `worker_count` reconcile workers draining the queue until it shuts
/// down or the token cancels.
pub fn spawn_workers(
    worker_count: usize,
    queue: Arc<WorkQueue>,
    reconciler: Arc<Reconciler>,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    (0..worker_count)
        .map(|worker_id| {
            let queue = Arc::clone(&queue);
            let reconciler = Arc::clone(&reconciler);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    let key = tokio::select! {
                        key = queue.next() => key,
                        () = cancel.cancelled() => None,
                    };
                    let Some(key) = key else {
                        debug!(
                            target: "controller.reconciler",
                            worker_id,
                            "Worker exiting"
                        );
                        break;
                    };

                    match reconciler.reconcile(&key).await {
                        Ok(outcome) => {
                            debug!(
                                target: "controller.reconciler",
                                worker_id,
                                key = %key,
                                result = outcome.as_str(),
                                "Reconcile finished"
                            );
                            queue.done(&key, false).await;
                        }
                        Err(e) if e.is_retryable() => {
                            warn!(
                                target: "controller.reconciler",
                                worker_id,
                                key = %key,
                                error = %e,
                                "Reconcile failed, requeueing"
                            );
                            queue.done(&key, true).await;
                        }
                        Err(e) => {
                            warn!(
                                target: "controller.reconciler",
                                worker_id,
                                key = %key,
                                error = %e,
                                "Reconcile failed terminally"
                            );
                            queue.done(&key, false).await;
                        }
                    }
                }
            })
        })
        .collect()
}
