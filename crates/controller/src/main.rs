//! Simple Operator controller binary.
//!
//! Startup flow:
//! 1. Initialize tracing from `RUST_LOG`.
//! 2. Load configuration from environment variables.
//! 3. Build the metric registry with static identity labels.
//! 4. In secured mode, start the certificate watcher and wait for a first
//!    valid bundle.
//! 5. Start the metrics exporter (plain or TLS).
//! 6. Start the async publisher if a broker endpoint is configured.
//! 7. Seed the in-memory store with the sample resource and start the
//!    reconcile workers.
//! 8. On SIGTERM/ctrl-c, cancel everything and drain within the grace
//!    period.

use simple_controller::certwatcher::{spawn_cert_watcher, CertWatcherConfig};
use simple_controller::config::Config;
use simple_controller::errors::ControllerError;
use simple_controller::exporter::{build_router, serve_plain, serve_tls};
use simple_controller::models::SimpleResource;
use simple_controller::publisher::{spawn_publisher, HttpSink, MetricSink, PublisherConfig};
use simple_controller::queue::WorkQueue;
use simple_controller::reconciler::{spawn_workers, Reconciler};
use simple_controller::registry::MetricRegistry;
use simple_controller::store::{InMemoryStore, ResourceStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// How long a blocked publish waits for queue space.
const PUBLISH_BLOCK_TIMEOUT: Duration = Duration::from_secs(1);

/// Upper bound on a single broker delivery attempt.
const PUBLISH_DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run().await {
        error!(target: "controller.main", error = %e, "Controller failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ControllerError> {
    let config = Config::from_env().map_err(|e| ControllerError::Config(e.to_string()))?;
    info!(
        target: "controller.main",
        version = env!("CARGO_PKG_VERSION"),
        secure = config.metrics_secure,
        "Starting simple-controller"
    );

    let registry = Arc::new(MetricRegistry::new(
        config.max_cardinality,
        config.static_labels(),
    ));
    let cancel = CancellationToken::new();
    let mut background: Vec<JoinHandle<()>> = Vec::new();

    if config.metrics_enabled() {
        let router = build_router(Arc::clone(&registry));
        let listener = TcpListener::bind(&config.metrics_bind_address)
            .await
            .map_err(|e| {
                ControllerError::Config(format!(
                    "cannot bind {}: {e}",
                    config.metrics_bind_address
                ))
            })?;
        info!(
            target: "controller.main",
            address = %config.metrics_bind_address,
            "Metrics exporter listening"
        );

        if config.metrics_secure {
            // Config validation guarantees both paths in secured mode.
            let (Some(cert_path), Some(key_path)) =
                (config.tls_cert_path.clone(), config.tls_key_path.clone())
            else {
                return Err(ControllerError::Config(
                    "secured metrics without certificate paths".to_string(),
                ));
            };
            let (watcher_task, bundles) = spawn_cert_watcher(
                CertWatcherConfig {
                    cert_path,
                    key_path,
                    poll_interval: config.tls_poll_interval,
                    startup_timeout: config.tls_startup_timeout,
                },
                Arc::clone(&registry),
                cancel.clone(),
            )
            .await?;
            background.push(watcher_task);

            let tls_registry = Arc::clone(&registry);
            let tls_router = router;
            let tls_cancel = cancel.clone();
            background.push(tokio::spawn(async move {
                if let Err(e) =
                    serve_tls(listener, tls_router, bundles, tls_registry, tls_cancel).await
                {
                    error!(target: "controller.main", error = %e, "TLS metrics listener failed");
                }
            }));
        } else {
            let plain_cancel = cancel.clone();
            background.push(tokio::spawn(async move {
                if let Err(e) = serve_plain(listener, router, plain_cancel).await {
                    error!(target: "controller.main", error = %e, "Metrics listener failed");
                }
            }));
        }
    } else {
        info!(target: "controller.main", "Metrics exporter disabled by configuration");
    }

    let publisher = match &config.broker_endpoint {
        Some(endpoint) => {
            let sink: Arc<dyn MetricSink> = Arc::new(HttpSink::new(
                endpoint.clone(),
                config.broker_topic.clone(),
            ));
            let (task, handle) = spawn_publisher(
                PublisherConfig {
                    queue_capacity: config.publish_queue_capacity,
                    batch_size: config.publish_batch_size,
                    linger: config.publish_linger,
                    max_attempts: config.publish_max_attempts,
                    policy: config.publish_queue_policy,
                    block_timeout: PUBLISH_BLOCK_TIMEOUT,
                    delivery_timeout: PUBLISH_DELIVERY_TIMEOUT,
                },
                sink,
                Arc::clone(&registry),
                cancel.clone(),
            );
            background.push(task);
            info!(
                target: "controller.main",
                endpoint = %endpoint,
                topic = %config.broker_topic,
                "Metric publisher started"
            );
            Some(handle)
        }
        None => {
            info!(target: "controller.main", "No broker endpoint, metric publishing disabled");
            None
        }
    };

    let store = Arc::new(InMemoryStore::new());
    let queue = Arc::new(WorkQueue::new());
    let reconciler = Arc::new(Reconciler::new(
        Arc::clone(&store) as Arc<dyn ResourceStore>,
        Arc::clone(&registry),
        publisher,
        config.reconcile_max_attempts,
    ));
    let workers = spawn_workers(
        config.worker_count,
        Arc::clone(&queue),
        reconciler,
        cancel.clone(),
    );

    // Sample workload; the store is in-process, so the binary seeds its own
    // resource the way the packaged sample manifest would.
    let seeded = store
        .apply(SimpleResource::new("demo", "foo", "Hallo Welt!"))
        .await;
    queue.add(&seeded.key()).await;

    wait_for_shutdown().await;
    info!(target: "controller.main", "Shutdown signal received, draining");

    queue.shutdown().await;
    cancel.cancel();

    let grace = config.shutdown_grace;
    let drain = async {
        for worker in workers {
            let _ = worker.await;
        }
        for task in background {
            let _ = task.await;
        }
    };
    if tokio::time::timeout(grace, drain).await.is_err() {
        warn!(
            target: "controller.main",
            grace_seconds = grace.as_secs(),
            "Grace period elapsed before all tasks drained"
        );
    }

    info!(target: "controller.main", "Controller stopped");
    Ok(())
}

async fn wait_for_shutdown() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(signal) => signal,
            Err(e) => {
                warn!(target: "controller.main", error = %e, "Cannot install SIGTERM handler");
                let _ = ctrl_c.await;
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
