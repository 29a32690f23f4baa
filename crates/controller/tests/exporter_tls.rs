//! Secured metrics endpoint, end to end over a real TLS socket.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use controller_test_utils::CertFixture;
use simple_controller::certwatcher::{spawn_cert_watcher, CertWatcherConfig};
use simple_controller::exporter::{build_router, serve_tls};
use simple_controller::registry::MetricRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn serves_metrics_over_tls_and_survives_rotation() {
    let fixture = CertFixture::new().unwrap();
    let registry = Arc::new(MetricRegistry::new(128, Vec::new()));
    registry.inc_counter("simple_reconcile_total", &[("result", "updated")], 1.0);
    let cancel = CancellationToken::new();

    let (watcher_task, mut bundles) = spawn_cert_watcher(
        CertWatcherConfig {
            cert_path: fixture.cert_path.to_string_lossy().into_owned(),
            key_path: fixture.key_path.to_string_lossy().into_owned(),
            poll_interval: Duration::from_millis(25),
            startup_timeout: Duration::from_secs(5),
        },
        Arc::clone(&registry),
        cancel.clone(),
    )
    .await
    .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = build_router(Arc::clone(&registry));
    let server_task = {
        let registry = Arc::clone(&registry);
        let bundles = bundles.clone();
        let cancel = cancel.clone();
        tokio::spawn(
            async move { serve_tls(listener, router, bundles, registry, cancel).await },
        )
    };

    // Self-signed pair: skip verification, the handshake itself is the test.
    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .build()
        .unwrap();
    let url = format!("https://{addr}/metrics");

    let response = client.get(&url).send().await.unwrap();
    assert_eq!(response.status(), 200);
    let body = response.text().await.unwrap();
    assert!(body.contains(r#"simple_reconcile_total{result="updated"} 1"#));
    assert!(body.contains("certwatcher_read_certificate_total 1"));

    // Rotate and confirm new connections still handshake.
    fixture.rotate_valid().unwrap();
    tokio::time::timeout(Duration::from_secs(2), bundles.changed())
        .await
        .unwrap()
        .unwrap();

    let response = client.get(&url).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert!(response
        .text()
        .await
        .unwrap()
        .contains("certwatcher_read_certificate_total 2"));

    cancel.cancel();
    watcher_task.await.unwrap();
    server_task.await.unwrap().unwrap();
}
