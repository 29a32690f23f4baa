//! Metrics exporter HTTP surface.
//!
//! A small axum router exposing `GET /metrics` (Prometheus text format) and
//! `GET /health`. The router can be served plain or behind TLS; in secured
//! mode every accepted connection builds its acceptor from the certificate
//! watcher's current bundle, so a rotation applies to new connections
//! without restarting the listener.

use crate::certwatcher::BundleReceiver;
use crate::errors::ControllerError;
use crate::exposition::render;
use crate::registry::{MetricKind, MetricRegistry};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// Exposition render failures, also incremented when no TLS bundle is
/// available for an accepted connection.
pub const EXPORT_ERRORS_TOTAL: &str = "export_errors_total";

/// Content type of the Prometheus text exposition format.
const TEXT_FORMAT: &str = "text/plain; version=0.0.4";

/// Upper bound on request handling; scrapes are expected in milliseconds.
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Build the exporter router.
pub fn build_router(registry: Arc<MetricRegistry>) -> Router {
    let _ = registry.register(EXPORT_ERRORS_TOTAL, MetricKind::Counter, &[]);
    Router::new()
        .route("/metrics", get(get_metrics))
        .route("/health", get(get_health))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .with_state(registry)
}

async fn get_metrics(State(registry): State<Arc<MetricRegistry>>) -> Response {
    match render(&registry.snapshot()) {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, TEXT_FORMAT)],
            body,
        )
            .into_response(),
        Err(e) => {
            registry.inc_counter(EXPORT_ERRORS_TOTAL, &[], 1.0);
            error!(target: "controller.exporter", error = %e, "Failed to render metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "render failure").into_response()
        }
    }
}

async fn get_health() -> StatusCode {
    StatusCode::OK
}

/// Serve the router over plain HTTP until the token cancels.
///
/// # Errors
///
/// Returns `ControllerError::Internal` if the listener fails.
pub async fn serve_plain(
    listener: TcpListener,
    router: Router,
    cancel: CancellationToken,
) -> Result<(), ControllerError> {
    info!(target: "controller.exporter", "Metrics endpoint serving plain HTTP");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| ControllerError::Internal(format!("metrics listener: {e}")))
}

/// Serve the router over TLS until the token cancels.
///
/// Each accepted connection is handshaken with the bundle that is current
/// at accept time. Handshake failures affect only that connection.
///
/// # Errors
///
/// Returns `ControllerError::Internal` if accepting from the listener
/// fails irrecoverably.
pub async fn serve_tls(
    listener: TcpListener,
    router: Router,
    bundles: BundleReceiver,
    registry: Arc<MetricRegistry>,
    cancel: CancellationToken,
) -> Result<(), ControllerError> {
    info!(target: "controller.exporter", "Metrics endpoint serving TLS");
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            () = cancel.cancelled() => {
                info!(target: "controller.exporter", "Metrics listener shutting down");
                return Ok(());
            }
        };

        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!(target: "controller.exporter", error = %e, "Accept failed");
                continue;
            }
        };

        // Bundle lookup at accept time is what makes rotation take effect.
        let Some(bundle) = bundles.current() else {
            registry.inc_counter(EXPORT_ERRORS_TOTAL, &[], 1.0);
            warn!(
                target: "controller.exporter",
                peer = %peer,
                "No certificate bundle available, dropping connection"
            );
            continue;
        };

        let acceptor = TlsAcceptor::from(Arc::clone(&bundle.server_config));
        let service = TowerToHyperService::new(router.clone());
        tokio::spawn(async move {
            match acceptor.accept(stream).await {
                Ok(tls_stream) => {
                    let result = auto::Builder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(tls_stream), service)
                        .await;
                    if let Err(e) = result {
                        debug!(
                            target: "controller.exporter",
                            peer = %peer,
                            error = %e,
                            "Connection closed with error"
                        );
                    }
                }
                Err(e) => {
                    debug!(
                        target: "controller.exporter",
                        peer = %peer,
                        error = %e,
                        "TLS handshake failed"
                    );
                }
            }
        });
    }
}
