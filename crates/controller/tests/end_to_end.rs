//! Full control-loop scenario: seed a resource, reconcile it through the
//! worker pool, verify idempotence, metrics, and publisher delivery.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use controller_test_utils::{seed_simple, RecordingSink};
use simple_controller::exposition::render;
use simple_controller::publisher::{spawn_publisher, MetricSink, PublisherConfig, QueueFullPolicy};
use simple_controller::queue::WorkQueue;
use simple_controller::reconciler::{spawn_workers, Reconciler, RECONCILE_TOTAL};
use simple_controller::registry::{MetricRegistry, SeriesValue};
use simple_controller::store::{InMemoryStore, ResourceStore};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn reconcile_count(registry: &MetricRegistry, result: &str) -> u64 {
    registry
        .snapshot()
        .series
        .into_iter()
        .find(|series| {
            series.name == RECONCILE_TOTAL
                && series
                    .labels
                    .iter()
                    .any(|(k, v)| k == "result" && v == result)
        })
        .and_then(|series| match series.value {
            SeriesValue::Counter(v) => Some(v as u64),
            _ => None,
        })
        .unwrap_or(0)
}

async fn wait_for<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached within 2s");
}

#[tokio::test]
async fn reconciles_sample_resource_exactly_once() {
    let store = Arc::new(InMemoryStore::new());
    let registry = Arc::new(MetricRegistry::new(
        128,
        vec![("cluster".to_string(), "test".to_string())],
    ));
    let cancel = CancellationToken::new();

    let sink = Arc::new(RecordingSink::new());
    let (publisher_task, publisher) = spawn_publisher(
        PublisherConfig {
            queue_capacity: 64,
            batch_size: 8,
            linger: Duration::from_millis(10),
            max_attempts: 3,
            policy: QueueFullPolicy::Block,
            block_timeout: Duration::from_millis(100),
            delivery_timeout: Duration::from_secs(5),
        },
        Arc::clone(&sink) as Arc<dyn MetricSink>,
        Arc::clone(&registry),
        cancel.clone(),
    );

    let reconciler = Arc::new(Reconciler::new(
        Arc::clone(&store) as Arc<dyn ResourceStore>,
        Arc::clone(&registry),
        Some(publisher),
        5,
    ));
    let queue = Arc::new(WorkQueue::new());
    let workers = spawn_workers(2, Arc::clone(&queue), reconciler, cancel.clone());

    let seeded = seed_simple(&store, "demo", "foo", "Hallo Welt!").await;
    assert!(!seeded.status.replied);

    // First event: the controller replies and persists the status.
    queue.add("demo/foo").await;
    {
        let registry = Arc::clone(&registry);
        wait_for(move || reconcile_count(&registry, "updated") == 1).await;
    }
    assert!(store.get("demo/foo").await.unwrap().status.replied);
    assert_eq!(store.status_writes(), 1);

    // Second event for the same resource: idempotent, no further write.
    queue.add("demo/foo").await;
    {
        let registry = Arc::clone(&registry);
        wait_for(move || reconcile_count(&registry, "skipped") == 1).await;
    }
    assert!(store.get("demo/foo").await.unwrap().status.replied);
    assert_eq!(store.status_writes(), 1);
    assert_eq!(reconcile_count(&registry, "updated"), 1);

    // Only the update handed a snapshot to the publisher; the idempotent
    // skip produced no publish traffic.
    wait_for_delivery(&sink, 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(sink.delivered_events().await, 1);

    // The exporter output carries the static identity labels.
    let text = render(&registry.snapshot()).unwrap();
    assert!(text.contains(r#"simple_reconcile_total{cluster="test",result="updated"} 1"#));
    assert!(text.contains(r#"simple_reconcile_total{cluster="test",result="skipped"} 1"#));
    assert!(text.contains("simple_reconcile_duration_seconds_count 2"));

    queue.shutdown().await;
    cancel.cancel();
    for worker in workers {
        worker.await.unwrap();
    }
    publisher_task.await.unwrap();
}

async fn wait_for_delivery(sink: &RecordingSink, at_least: usize) {
    for _ in 0..100 {
        if sink.delivered_events().await >= at_least {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("publisher did not deliver {at_least} events within 2s");
}

#[tokio::test]
async fn deleted_resource_reconciles_to_not_found() {
    let store = Arc::new(InMemoryStore::new());
    let registry = Arc::new(MetricRegistry::new(128, Vec::new()));
    let cancel = CancellationToken::new();

    let reconciler = Arc::new(Reconciler::new(
        Arc::clone(&store) as Arc<dyn ResourceStore>,
        Arc::clone(&registry),
        None,
        5,
    ));
    let queue = Arc::new(WorkQueue::new());
    let workers = spawn_workers(1, Arc::clone(&queue), reconciler, cancel.clone());

    seed_simple(&store, "demo", "foo", "Hallo Welt!").await;
    store.delete("demo/foo").await;
    queue.add("demo/foo").await;

    {
        let registry = Arc::clone(&registry);
        wait_for(move || reconcile_count(&registry, "not_found") == 1).await;
    }
    assert_eq!(store.status_writes(), 0);

    queue.shutdown().await;
    cancel.cancel();
    for worker in workers {
        worker.await.unwrap();
    }
}
