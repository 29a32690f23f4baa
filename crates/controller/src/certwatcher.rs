//! Certificate watcher.
//!
//! Monitors a certificate/key pair on disk and publishes validated reloads
//! over a `tokio::sync::watch` channel as immutable [`CertificateBundle`]
//! values. Replacement is a single atomic value swap: a reader either sees
//! the old bundle or the new one, never a half-updated pair. Validation
//! failures keep the last known-good bundle in effect and count
//! `certwatcher_read_certificate_errors_total`.
//!
//! `spawn_cert_watcher` returns only after a first valid bundle has loaded,
//! which is what gates secured-mode exporter startup.

use crate::errors::ControllerError;
use crate::registry::{MetricKind, MetricRegistry};
use chrono::{DateTime, Utc};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Successful reload counter.
pub const READ_CERTIFICATE_TOTAL: &str = "certwatcher_read_certificate_total";

/// Failed reload counter.
pub const READ_CERTIFICATE_ERRORS_TOTAL: &str = "certwatcher_read_certificate_errors_total";

/// Watcher configuration.
#[derive(Debug, Clone)]
pub struct CertWatcherConfig {
    pub cert_path: String,
    pub key_path: String,
    /// Interval between change checks.
    pub poll_interval: Duration,
    /// How long `spawn_cert_watcher` waits for the first valid bundle.
    pub startup_timeout: Duration,
}

/// A validated, atomically-swappable certificate/key pair.
pub struct CertificateBundle {
    /// PEM bytes as read from disk.
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
    /// Parsed certificate chain, leaf first.
    pub chain: Vec<CertificateDer<'static>>,
    /// Ready-to-serve TLS configuration built from this pair.
    pub server_config: Arc<ServerConfig>,
    pub loaded_at: DateTime<Utc>,
    /// Incremented on every successful reload.
    pub generation: u64,
}

impl CertificateBundle {
    /// DER bytes of the leaf certificate, if the chain is non-empty.
    #[must_use]
    pub fn leaf_der(&self) -> Option<&[u8]> {
        self.chain.first().map(|c| c.as_ref())
    }
}

impl std::fmt::Debug for CertificateBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateBundle")
            .field("generation", &self.generation)
            .field("loaded_at", &self.loaded_at)
            .field("chain_len", &self.chain.len())
            .finish()
    }
}

/// Read access to the currently active bundle.
#[derive(Clone)]
pub struct BundleReceiver(watch::Receiver<Option<Arc<CertificateBundle>>>);

impl BundleReceiver {
    /// The active bundle. Always `Some` after `spawn_cert_watcher` returns;
    /// the clone keeps the borrow window short so the watcher never blocks
    /// on readers.
    #[must_use]
    pub fn current(&self) -> Option<Arc<CertificateBundle>> {
        self.0.borrow().clone()
    }

    /// Wait for the next reload. Test hook for rotation assertions.
    ///
    /// # Errors
    ///
    /// Returns `ControllerError::Internal` if the watcher task is gone.
    pub async fn changed(&mut self) -> Result<(), ControllerError> {
        self.0
            .changed()
            .await
            .map_err(|_| ControllerError::Internal("certificate watcher stopped".to_string()))
    }
}

/// Spawn the certificate watcher background task.
///
/// Blocks until the first valid bundle loads, then returns the task handle
/// and a receiver whose `current()` always yields a complete bundle.
///
/// # Errors
///
/// Returns `InvalidCertificate` if no valid bundle loads within
/// `startup_timeout`; secured mode cannot start without one.
pub async fn spawn_cert_watcher(
    config: CertWatcherConfig,
    registry: Arc<MetricRegistry>,
    cancel: CancellationToken,
) -> Result<(JoinHandle<()>, BundleReceiver), ControllerError> {
    // Counters exist from the start so the exporter shows them at zero.
    let _ = registry.register(READ_CERTIFICATE_TOTAL, MetricKind::Counter, &[]);
    let _ = registry.register(READ_CERTIFICATE_ERRORS_TOTAL, MetricKind::Counter, &[]);

    let (sender, mut receiver) = watch::channel(None);
    let startup_timeout = config.startup_timeout;

    let task = tokio::spawn(watch_loop(config, registry, sender, cancel));

    match tokio::time::timeout(startup_timeout, receiver.changed()).await {
        Ok(Ok(())) => {}
        Ok(Err(_)) => {
            return Err(ControllerError::Internal(
                "certificate watcher stopped before first load".to_string(),
            ));
        }
        Err(_) => {
            task.abort();
            return Err(ControllerError::InvalidCertificate(format!(
                "no valid certificate bundle within {startup_timeout:?}"
            )));
        }
    }

    Ok((task, BundleReceiver(receiver)))
}

async fn watch_loop(
    config: CertWatcherConfig,
    registry: Arc<MetricRegistry>,
    sender: watch::Sender<Option<Arc<CertificateBundle>>>,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(config.poll_interval);
    let mut last_raw: Option<(Vec<u8>, Vec<u8>)> = None;
    let mut read_failed = false;
    let mut generation: u64 = 0;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                check_once(
                    &config,
                    &registry,
                    &sender,
                    &mut last_raw,
                    &mut read_failed,
                    &mut generation,
                )
                .await;
            }
            () = cancel.cancelled() => {
                info!(
                    target: "controller.certwatcher",
                    "Certificate watcher received shutdown signal, exiting"
                );
                break;
            }
        }
    }
}

async fn check_once(
    config: &CertWatcherConfig,
    registry: &MetricRegistry,
    sender: &watch::Sender<Option<Arc<CertificateBundle>>>,
    last_raw: &mut Option<(Vec<u8>, Vec<u8>)>,
    read_failed: &mut bool,
    generation: &mut u64,
) {
    let raw = match read_pair(config).await {
        Ok(raw) => raw,
        Err(e) => {
            // Count the transition into the unreadable state once, whether
            // it happens at startup or after a good load. `last_raw` stays
            // put so a recovery with identical content is not re-counted as
            // a reload.
            if !*read_failed {
                *read_failed = true;
                registry.inc_counter(READ_CERTIFICATE_ERRORS_TOTAL, &[], 1.0);
                warn!(
                    target: "controller.certwatcher",
                    error = %e,
                    "Certificate pair unreadable, keeping last known-good bundle"
                );
            }
            return;
        }
    };
    *read_failed = false;

    if last_raw.as_ref() == Some(&raw) {
        return;
    }
    *last_raw = Some(raw.clone());

    let (cert_pem, key_pem) = raw;
    match build_bundle(cert_pem, key_pem, *generation + 1) {
        Ok(bundle) => {
            *generation += 1;
            registry.inc_counter(READ_CERTIFICATE_TOTAL, &[], 1.0);
            info!(
                target: "controller.certwatcher",
                generation = bundle.generation,
                "Loaded certificate bundle"
            );
            sender.send_replace(Some(Arc::new(bundle)));
        }
        Err(e) => {
            registry.inc_counter(READ_CERTIFICATE_ERRORS_TOTAL, &[], 1.0);
            warn!(
                target: "controller.certwatcher",
                error = %e,
                "Certificate validation failed, keeping last known-good bundle"
            );
        }
    }
}

async fn read_pair(config: &CertWatcherConfig) -> Result<(Vec<u8>, Vec<u8>), std::io::Error> {
    let cert = tokio::fs::read(&config.cert_path).await?;
    let key = tokio::fs::read(&config.key_path).await?;
    Ok((cert, key))
}

/// Parse and validate a PEM pair into a servable bundle.
///
/// Checks: well-formed PEM, non-empty chain, leaf within its validity
/// window, and key/certificate consistency (via rustls server-config
/// construction).
fn build_bundle(
    cert_pem: Vec<u8>,
    key_pem: Vec<u8>,
    generation: u64,
) -> Result<CertificateBundle, ControllerError> {
    let chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<Result<_, _>>()
        .map_err(|e| ControllerError::InvalidCertificate(format!("certificate PEM: {e}")))?;
    if chain.is_empty() {
        return Err(ControllerError::InvalidCertificate(
            "certificate file contains no certificates".to_string(),
        ));
    }

    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .map_err(|e| ControllerError::InvalidCertificate(format!("key PEM: {e}")))?
        .ok_or_else(|| {
            ControllerError::InvalidCertificate("key file contains no private key".to_string())
        })?;

    validate_leaf(&chain)?;

    let server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain.clone(), key)
        .map_err(|e| ControllerError::InvalidCertificate(format!("key/certificate pair: {e}")))?;

    debug!(target: "controller.certwatcher", generation, "Built server config");

    Ok(CertificateBundle {
        cert_pem,
        key_pem,
        chain,
        server_config: Arc::new(server_config),
        loaded_at: Utc::now(),
        generation,
    })
}

/// Check the leaf certificate is inside its validity window.
fn validate_leaf(chain: &[CertificateDer<'static>]) -> Result<(), ControllerError> {
    let Some(leaf) = chain.first() else {
        return Err(ControllerError::InvalidCertificate(
            "empty certificate chain".to_string(),
        ));
    };
    let (_, parsed) = x509_parser::parse_x509_certificate(leaf.as_ref())
        .map_err(|e| ControllerError::InvalidCertificate(format!("X.509 parse: {e}")))?;
    if !parsed.validity().is_valid() {
        return Err(ControllerError::InvalidCertificate(format!(
            "certificate outside its validity window (not_before {}, not_after {})",
            parsed.validity().not_before,
            parsed.validity().not_after
        )));
    }
    Ok(())
}
