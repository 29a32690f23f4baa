//! Shared test fixtures for the simple-controller crates.
//!
//! Certificate pairs are written to real files so tests exercise the same
//! PEM-loading path as production, and the sink doubles record exactly what
//! the publisher handed them.

use async_trait::async_trait;
use simple_controller::errors::ControllerError;
use simple_controller::models::{PublishEvent, SimpleResource};
use simple_controller::publisher::MetricSink;
use simple_controller::store::InMemoryStore;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum FixtureError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("certificate generation failed: {0}")]
    Generation(#[from] rcgen::Error),
}

/// A certificate/key pair on disk that can be rotated mid-test.
pub struct CertFixture {
    // Held for its Drop; the directory outlives the paths handed out.
    _dir: TempDir,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl CertFixture {
    /// Create a fresh directory holding a valid self-signed pair.
    ///
    /// # Errors
    ///
    /// Returns `FixtureError` if generation or writing fails.
    pub fn new() -> Result<Self, FixtureError> {
        let dir = TempDir::new()?;
        let cert_path = dir.path().join("tls.crt");
        let key_path = dir.path().join("tls.key");
        let fixture = Self {
            _dir: dir,
            cert_path,
            key_path,
        };
        fixture.rotate_valid()?;
        Ok(fixture)
    }

    /// Overwrite the pair with a newly generated valid one.
    ///
    /// # Errors
    ///
    /// Returns `FixtureError` if generation or writing fails.
    pub fn rotate_valid(&self) -> Result<(), FixtureError> {
        let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])?;
        // Key first so a watcher polling mid-write never pairs a new cert
        // with the old key.
        std::fs::write(&self.key_path, generated.key_pair.serialize_pem())?;
        std::fs::write(&self.cert_path, generated.cert.pem())?;
        Ok(())
    }

    /// Overwrite the certificate file with bytes that do not parse.
    ///
    /// # Errors
    ///
    /// Returns `FixtureError` if writing fails.
    pub fn rotate_garbage(&self) -> Result<(), FixtureError> {
        std::fs::write(&self.cert_path, b"-----BEGIN NONSENSE-----\n")?;
        Ok(())
    }

    /// The current certificate PEM on disk.
    ///
    /// # Errors
    ///
    /// Returns `FixtureError` if reading fails.
    pub fn cert_pem(&self) -> Result<Vec<u8>, FixtureError> {
        Ok(std::fs::read(&self.cert_path)?)
    }
}

/// Sink double that records every delivered batch.
#[derive(Default)]
pub struct RecordingSink {
    batches: Mutex<Vec<Vec<PublishEvent>>>,
}

impl RecordingSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All batches delivered so far.
    pub async fn batches(&self) -> Vec<Vec<PublishEvent>> {
        self.batches.lock().await.clone()
    }

    /// Total events across all batches.
    pub async fn delivered_events(&self) -> usize {
        self.batches.lock().await.iter().map(Vec::len).sum()
    }
}

#[async_trait]
impl MetricSink for RecordingSink {
    async fn deliver(&self, batch: &[PublishEvent]) -> Result<(), ControllerError> {
        self.batches.lock().await.push(batch.to_vec());
        Ok(())
    }
}

/// Sink double that fails the first `n` deliveries, then records.
pub struct FlakySink {
    failures_left: AtomicU32,
    inner: RecordingSink,
}

impl FlakySink {
    #[must_use]
    pub fn failing(n: u32) -> Self {
        Self {
            failures_left: AtomicU32::new(n),
            inner: RecordingSink::new(),
        }
    }

    pub async fn delivered_events(&self) -> usize {
        self.inner.delivered_events().await
    }
}

#[async_trait]
impl MetricSink for FlakySink {
    async fn deliver(&self, batch: &[PublishEvent]) -> Result<(), ControllerError> {
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ControllerError::PublishFailure(
                "injected delivery failure".to_string(),
            ));
        }
        self.inner.deliver(batch).await
    }
}

/// Seed a `Simple` resource and return the stored record.
pub async fn seed_simple(
    store: &InMemoryStore,
    namespace: &str,
    name: &str,
    message: &str,
) -> SimpleResource {
    store
        .apply(SimpleResource::new(namespace, name, message))
        .await
}
