//! Controller manager runtime for the ironcore-metal extension
//!
//! # Modules
//!
//! - [`scheme`] - Registry of kinds a cluster's clients recognize
//! - [`cache`] - Lazily created, shared informers per cluster
//! - [`client`] - Reads through the cache, with per-kind bypass
//! - [`cluster`] - Client, cache and scheme for one cluster
//! - [`runnable`] - Units of work started by the manager
//! - [`health`] - Liveness and readiness checks and the probe server
//! - [`webhook_server`] - TLS server hosting admission handlers
//! - [`metrics`] - Prometheus metrics and the metrics server
//! - [`manager`] - Owns all of the above and drives their lifecycle

#![deny(missing_docs)]

pub mod cache;
pub mod client;
pub mod cluster;
pub mod health;
pub mod manager;
pub mod metrics;
pub mod runnable;
pub mod scheme;
pub mod webhook_server;

pub use cache::ClusterCache;
pub use client::{ClientError, DelegatingClient};
pub use cluster::{Cluster, ClusterError};
pub use health::{HealthCheck, HealthError, HealthRegistry, ProbeKind};
pub use manager::{Manager, ManagerError, ManagerOptions, StopReason};
pub use metrics::ManagerMetrics;
pub use runnable::{runnable_fn, until_cancelled, Runnable, RunnableError, RunnableGroup};
pub use scheme::{SchemeBuilder, SchemeError, SchemeRegistry, TypeInfo};
pub use webhook_server::{WebhookServer, WebhookServerError};

#[cfg(test)]
pub(crate) fn install_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}
