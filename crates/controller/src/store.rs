//! Resource store seam.
//!
//! The real store lives in the external runtime; the reconciler only needs
//! `get` and a conditional status write. [`InMemoryStore`] backs the binary
//! and the tests, with the same optimistic-concurrency semantics: a status
//! write carries the `resource_version` it read, and loses if the record
//! moved underneath it.

use crate::errors::ControllerError;
use crate::models::SimpleResource;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

/// Read/conditional-write access to `Simple` resource records.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Fetch a record by `namespace/name` key. `None` means deleted.
    async fn get(&self, key: &str) -> Option<SimpleResource>;

    /// Conditionally persist `resource.status`, keyed on the
    /// `resource_version` the caller read.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the record was deleted in the meantime.
    /// - `VersionConflict` if the stored version no longer matches.
    async fn update_status(
        &self,
        resource: &SimpleResource,
    ) -> Result<SimpleResource, ControllerError>;
}

/// In-process resource store with monotonic resource versions.
#[derive(Default)]
pub struct InMemoryStore {
    records: RwLock<HashMap<String, SimpleResource>>,
    next_version: AtomicU64,
    status_writes: AtomicU64,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record, assigning a fresh resource version.
    /// A spec change on an existing record bumps the generation.
    pub async fn apply(&self, mut resource: SimpleResource) -> SimpleResource {
        let mut records = self.records.write().await;
        let key = resource.key();
        if let Some(existing) = records.get(&key) {
            resource.generation = if existing.spec == resource.spec {
                existing.generation
            } else {
                existing.generation + 1
            };
        }
        resource.resource_version = self.bump_version();
        records.insert(key, resource.clone());
        resource
    }

    /// Remove a record; subsequent `get` returns `None`.
    pub async fn delete(&self, key: &str) {
        self.records.write().await.remove(key);
    }

    /// Number of status writes that actually landed. Lets tests assert the
    /// zero-write idempotence guarantee.
    #[must_use]
    pub fn status_writes(&self) -> u64 {
        self.status_writes.load(Ordering::Relaxed)
    }

    fn bump_version(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[async_trait]
impl ResourceStore for InMemoryStore {
    async fn get(&self, key: &str) -> Option<SimpleResource> {
        self.records.read().await.get(key).cloned()
    }

    async fn update_status(
        &self,
        resource: &SimpleResource,
    ) -> Result<SimpleResource, ControllerError> {
        let mut records = self.records.write().await;
        let key = resource.key();
        let Some(stored) = records.get_mut(&key) else {
            return Err(ControllerError::NotFound(key));
        };
        if stored.resource_version != resource.resource_version {
            return Err(ControllerError::VersionConflict {
                key,
                expected: stored.resource_version,
            });
        }
        stored.status = resource.status.clone();
        stored.resource_version = self.bump_version();
        self.status_writes.fetch_add(1, Ordering::Relaxed);
        Ok(stored.clone())
    }
}
