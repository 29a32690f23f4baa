//! Simple Operator controller.
//!
//! A reconciliation control loop for `Simple` resources with an embedded
//! observability subsystem: a thread-safe metric registry, a deterministic
//! Prometheus exporter with optional hot-reload TLS, a certificate watcher,
//! and a backpressure-aware async publisher.

pub mod certwatcher;
pub mod config;
pub mod errors;
pub mod exporter;
pub mod exposition;
pub mod models;
pub mod publisher;
pub mod queue;
pub mod reconciler;
pub mod registry;
pub mod store;
