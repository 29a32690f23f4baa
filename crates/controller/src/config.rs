//! Controller configuration.
//!
//! All options load from environment variables via [`Config::from_env`],
//! which delegates to [`Config::from_vars`] so tests can inject a plain
//! `HashMap` without touching process state.

use crate::publisher::QueueFullPolicy;
use std::collections::HashMap;
use std::env;
use std::time::Duration;
use thiserror::Error;

/// Sentinel bind address values meaning "exporter disabled".
const DISABLED_SENTINELS: [&str; 2] = ["", "0"];

/// Default metrics bind address.
const DEFAULT_METRICS_BIND_ADDRESS: &str = "0.0.0.0:8080";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {var}: {reason}")]
    InvalidValue { var: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Bind address for the metrics exporter. Empty or `"0"` disables it.
    pub metrics_bind_address: String,

    /// Terminate TLS on the metrics endpoint using the certificate watcher.
    pub metrics_secure: bool,

    /// Certificate/key file paths (required when `metrics_secure`).
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,

    /// Interval between certificate change checks.
    pub tls_poll_interval: Duration,

    /// How long secured-mode startup waits for a first valid bundle.
    pub tls_startup_timeout: Duration,

    /// Broker endpoint; `None` disables forwarding (no-op publisher).
    pub broker_endpoint: Option<String>,

    /// Broker topic for published batches.
    pub broker_topic: String,

    /// Static labels stamped onto every emitted series.
    pub cluster_name: String,
    pub controller_name: String,
    pub controller_version: String,
    pub resource_kind: String,

    /// Reconcile worker pool size.
    pub worker_count: usize,

    /// Bounded fetch-modify-write attempts per reconcile.
    pub reconcile_max_attempts: u32,

    /// Maximum distinct label combinations per metric name.
    pub max_cardinality: usize,

    /// Async publisher tuning.
    pub publish_queue_capacity: usize,
    pub publish_batch_size: usize,
    pub publish_linger: Duration,
    pub publish_max_attempts: u32,
    pub publish_queue_policy: QueueFullPolicy,

    /// Grace period for the publisher drain on shutdown.
    pub shutdown_grace: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for malformed numeric values or a secured
    /// exporter without certificate paths.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    ///
    /// # Errors
    ///
    /// See [`Config::from_env`].
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let metrics_bind_address = vars
            .get("METRICS_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_METRICS_BIND_ADDRESS.to_string());

        let metrics_secure = parse_bool(vars, "METRICS_SECURE", false)?;

        let tls_cert_path = vars.get("TLS_CERT_PATH").cloned();
        let tls_key_path = vars.get("TLS_KEY_PATH").cloned();

        if metrics_secure {
            if tls_cert_path.is_none() {
                return Err(ConfigError::MissingEnvVar("TLS_CERT_PATH".to_string()));
            }
            if tls_key_path.is_none() {
                return Err(ConfigError::MissingEnvVar("TLS_KEY_PATH".to_string()));
            }
        }

        let queue_policy_raw = vars
            .get("PUBLISH_QUEUE_POLICY")
            .map_or("block", String::as_str);
        let publish_queue_policy = match queue_policy_raw {
            "block" => QueueFullPolicy::Block,
            "drop_oldest" => QueueFullPolicy::DropOldest,
            other => {
                return Err(ConfigError::InvalidValue {
                    var: "PUBLISH_QUEUE_POLICY".to_string(),
                    reason: format!("expected 'block' or 'drop_oldest', got '{other}'"),
                })
            }
        };

        Ok(Config {
            metrics_bind_address,
            metrics_secure,
            tls_cert_path,
            tls_key_path,
            tls_poll_interval: Duration::from_secs(parse_u64(
                vars,
                "TLS_POLL_INTERVAL_SECONDS",
                10,
            )?),
            tls_startup_timeout: Duration::from_secs(parse_u64(
                vars,
                "TLS_STARTUP_TIMEOUT_SECONDS",
                30,
            )?),
            broker_endpoint: vars.get("BROKER_ENDPOINT").cloned(),
            broker_topic: vars
                .get("BROKER_TOPIC")
                .cloned()
                .unwrap_or_else(|| "controller-metrics".to_string()),
            cluster_name: vars
                .get("CLUSTER_NAME")
                .cloned()
                .unwrap_or_else(|| "default".to_string()),
            controller_name: vars
                .get("CONTROLLER_NAME")
                .cloned()
                .unwrap_or_else(|| "simple-controller".to_string()),
            controller_version: vars
                .get("CONTROLLER_VERSION")
                .cloned()
                .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string()),
            resource_kind: vars
                .get("RESOURCE_KIND")
                .cloned()
                .unwrap_or_else(|| "Simple".to_string()),
            worker_count: parse_u64(vars, "RECONCILE_WORKERS", 2)? as usize,
            reconcile_max_attempts: parse_u32(vars, "RECONCILE_MAX_ATTEMPTS", 5)?,
            max_cardinality: parse_u64(vars, "METRICS_MAX_CARDINALITY", 128)? as usize,
            publish_queue_capacity: parse_u64(vars, "PUBLISH_QUEUE_CAPACITY", 1024)? as usize,
            publish_batch_size: parse_u64(vars, "PUBLISH_BATCH_SIZE", 64)? as usize,
            publish_linger: Duration::from_millis(parse_u64(vars, "PUBLISH_LINGER_MS", 250)?),
            publish_max_attempts: parse_u32(vars, "PUBLISH_MAX_ATTEMPTS", 5)?,
            publish_queue_policy,
            shutdown_grace: Duration::from_secs(parse_u64(vars, "SHUTDOWN_GRACE_SECONDS", 5)?),
        })
    }

    /// Whether the metrics exporter should run at all.
    #[must_use]
    pub fn metrics_enabled(&self) -> bool {
        !DISABLED_SENTINELS.contains(&self.metrics_bind_address.as_str())
    }

    /// Static labels stamped onto every emitted series.
    #[must_use]
    pub fn static_labels(&self) -> Vec<(String, String)> {
        vec![
            ("cluster".to_string(), self.cluster_name.clone()),
            ("controller".to_string(), self.controller_name.clone()),
            ("version".to_string(), self.controller_version.clone()),
            ("kind".to_string(), self.resource_kind.clone()),
        ]
    }
}

fn parse_bool(
    vars: &HashMap<String, String>,
    var: &str,
    default: bool,
) -> Result<bool, ConfigError> {
    match vars.get(var) {
        None => Ok(default),
        Some(raw) => match raw.as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            other => Err(ConfigError::InvalidValue {
                var: var.to_string(),
                reason: format!("expected boolean, got '{other}'"),
            }),
        },
    }
}

fn parse_u64(vars: &HashMap<String, String>, var: &str, default: u64) -> Result<u64, ConfigError> {
    match vars.get(var) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|e| ConfigError::InvalidValue {
            var: var.to_string(),
            reason: format!("{e}"),
        }),
    }
}

fn parse_u32(vars: &HashMap<String, String>, var: &str, default: u32) -> Result<u32, ConfigError> {
    match vars.get(var) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|e| ConfigError::InvalidValue {
            var: var.to_string(),
            reason: format!("{e}"),
        }),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vars_defaults() {
        let config = Config::from_vars(&HashMap::new()).expect("defaults should load");

        assert_eq!(config.metrics_bind_address, "0.0.0.0:8080");
        assert!(!config.metrics_secure);
        assert!(config.metrics_enabled());
        assert!(config.broker_endpoint.is_none());
        assert_eq!(config.broker_topic, "controller-metrics");
        assert_eq!(config.reconcile_max_attempts, 5);
        assert_eq!(config.max_cardinality, 128);
        assert_eq!(config.publish_queue_capacity, 1024);
        assert_eq!(config.publish_batch_size, 64);
        assert_eq!(config.publish_linger, Duration::from_millis(250));
        assert_eq!(config.publish_queue_policy, QueueFullPolicy::Block);
        assert_eq!(config.tls_poll_interval, Duration::from_secs(10));
        assert_eq!(config.shutdown_grace, Duration::from_secs(5));
        assert_eq!(config.worker_count, 2);
    }

    #[test]
    fn test_disabled_sentinels() {
        for sentinel in ["", "0"] {
            let vars = HashMap::from([(
                "METRICS_BIND_ADDRESS".to_string(),
                sentinel.to_string(),
            )]);
            let config = Config::from_vars(&vars).unwrap();
            assert!(!config.metrics_enabled(), "sentinel {sentinel:?}");
        }
    }

    #[test]
    fn test_secure_requires_cert_paths() {
        let vars = HashMap::from([("METRICS_SECURE".to_string(), "true".to_string())]);
        let result = Config::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::MissingEnvVar(v)) if v == "TLS_CERT_PATH"));

        let vars = HashMap::from([
            ("METRICS_SECURE".to_string(), "true".to_string()),
            ("TLS_CERT_PATH".to_string(), "/certs/tls.crt".to_string()),
        ]);
        let result = Config::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::MissingEnvVar(v)) if v == "TLS_KEY_PATH"));

        let vars = HashMap::from([
            ("METRICS_SECURE".to_string(), "true".to_string()),
            ("TLS_CERT_PATH".to_string(), "/certs/tls.crt".to_string()),
            ("TLS_KEY_PATH".to_string(), "/certs/tls.key".to_string()),
        ]);
        let config = Config::from_vars(&vars).unwrap();
        assert!(config.metrics_secure);
        assert_eq!(config.tls_cert_path.as_deref(), Some("/certs/tls.crt"));
    }

    #[test]
    fn test_queue_policy_parsing() {
        let vars = HashMap::from([(
            "PUBLISH_QUEUE_POLICY".to_string(),
            "drop_oldest".to_string(),
        )]);
        let config = Config::from_vars(&vars).unwrap();
        assert_eq!(config.publish_queue_policy, QueueFullPolicy::DropOldest);

        let vars = HashMap::from([("PUBLISH_QUEUE_POLICY".to_string(), "newest".to_string())]);
        let result = Config::from_vars(&vars);
        assert!(
            matches!(result, Err(ConfigError::InvalidValue { var, .. }) if var == "PUBLISH_QUEUE_POLICY")
        );
    }

    #[test]
    fn test_invalid_numeric_value() {
        let vars = HashMap::from([(
            "PUBLISH_QUEUE_CAPACITY".to_string(),
            "not-a-number".to_string(),
        )]);
        let result = Config::from_vars(&vars);
        assert!(
            matches!(result, Err(ConfigError::InvalidValue { var, .. }) if var == "PUBLISH_QUEUE_CAPACITY")
        );
    }

    #[test]
    fn test_invalid_bool_value() {
        let vars = HashMap::from([("METRICS_SECURE".to_string(), "yes".to_string())]);
        let result = Config::from_vars(&vars);
        assert!(
            matches!(result, Err(ConfigError::InvalidValue { var, .. }) if var == "METRICS_SECURE")
        );
    }

    #[test]
    fn test_static_labels() {
        let vars = HashMap::from([
            ("CLUSTER_NAME".to_string(), "us-west".to_string()),
            ("CONTROLLER_NAME".to_string(), "simple".to_string()),
            ("CONTROLLER_VERSION".to_string(), "1.2.3".to_string()),
        ]);
        let config = Config::from_vars(&vars).unwrap();
        let labels = config.static_labels();

        assert!(labels.contains(&("cluster".to_string(), "us-west".to_string())));
        assert!(labels.contains(&("controller".to_string(), "simple".to_string())));
        assert!(labels.contains(&("version".to_string(), "1.2.3".to_string())));
        assert!(labels.contains(&("kind".to_string(), "Simple".to_string())));
    }
}
