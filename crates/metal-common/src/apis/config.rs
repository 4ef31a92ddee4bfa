//! Controller manager configuration file
//!
//! The file is a versioned `ControllerConfiguration`
//! (`metal.provider.extensions.config.gardener.cloud/v1alpha1`). It is decoded
//! into the [`v1alpha1`] form and then converted field by field into the
//! internal [`ControllerConfiguration`] that the rest of the process uses.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde_json::Value;
use tracing::debug;

use crate::{Error, Result};

/// Group/version of the configuration file
pub const API_VERSION: &str = "metal.provider.extensions.config.gardener.cloud/v1alpha1";

/// Kind of the configuration file
pub const KIND: &str = "ControllerConfiguration";

/// Health check sync period used when the file sets none
pub const DEFAULT_HEALTH_CHECK_SYNC_PERIOD: Duration = Duration::from_secs(30);

/// Connection settings for the seed API client
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClientConnection {
    /// Kubeconfig path
    pub kubeconfig: String,
    /// Accept header sent to the API server
    pub accept_content_types: String,
    /// Content type of request bodies
    pub content_type: String,
    /// Sustained queries per second
    pub qps: f32,
    /// Burst above `qps`
    pub burst: i32,
}

/// Storage of the shoot etcd
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EtcdStorage {
    /// Storage class for etcd volumes
    pub class_name: Option<String>,
    /// Volume capacity
    pub capacity: Option<Quantity>,
}

/// Backup settings of the shoot etcd
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EtcdBackup {
    /// Cron schedule of full snapshots
    pub schedule: Option<String>,
}

/// Etcd settings
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Etcd {
    /// Storage settings
    pub storage: EtcdStorage,
    /// Backup settings
    pub backup: EtcdBackup,
}

/// Health check controller settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HealthCheckConfig {
    /// Interval between health checks of one resource
    pub sync_period: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            sync_period: DEFAULT_HEALTH_CHECK_SYNC_PERIOD,
        }
    }
}

/// Internal controller manager configuration
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ControllerConfiguration {
    /// Client connection overrides
    pub client_connection: Option<ClientConnection>,
    /// Etcd settings
    pub etcd: Etcd,
    /// Health check settings
    pub health_check_config: Option<HealthCheckConfig>,
    /// Feature gates
    pub feature_gates: BTreeMap<String, bool>,
}

impl ControllerConfiguration {
    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if let Some(conn) = &self.client_connection {
            if !conn.qps.is_finite() || conn.qps < 0.0 {
                return Err(Error::validation_for_field(
                    KIND,
                    "clientConnection.qps",
                    "must be a non-negative number",
                ));
            }
            if conn.burst < 0 {
                return Err(Error::validation_for_field(
                    KIND,
                    "clientConnection.burst",
                    "must not be negative",
                ));
            }
        }
        if let Some(hc) = &self.health_check_config {
            if hc.sync_period.is_zero() {
                return Err(Error::validation_for_field(
                    KIND,
                    "healthCheckConfig.syncPeriod",
                    "must be positive",
                ));
            }
        }
        Ok(())
    }

    /// Whether a feature gate is enabled (unset gates are off)
    pub fn feature_enabled(&self, gate: &str) -> bool {
        self.feature_gates.get(gate).copied().unwrap_or(false)
    }
}

/// Versioned wire form of the configuration file
pub mod v1alpha1 {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use serde::{Deserialize, Serialize};

    /// Client connection settings
    #[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
    #[serde(rename_all = "camelCase")]
    pub struct ClientConnectionConfiguration {
        /// Kubeconfig path
        #[serde(default)]
        pub kubeconfig: String,
        /// Accept header
        #[serde(default)]
        pub accept_content_types: String,
        /// Request content type
        #[serde(default)]
        pub content_type: String,
        /// Queries per second
        #[serde(default)]
        pub qps: f32,
        /// Burst
        #[serde(default)]
        pub burst: i32,
    }

    /// Etcd storage settings
    #[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
    #[serde(rename_all = "camelCase")]
    pub struct EtcdStorage {
        /// Storage class
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub class_name: Option<String>,
        /// Capacity
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub capacity: Option<Quantity>,
    }

    /// Etcd backup settings
    #[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
    #[serde(rename_all = "camelCase")]
    pub struct EtcdBackup {
        /// Snapshot schedule
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub schedule: Option<String>,
    }

    /// Etcd settings
    #[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
    #[serde(rename_all = "camelCase")]
    pub struct Etcd {
        /// Storage
        #[serde(default)]
        pub storage: EtcdStorage,
        /// Backup
        #[serde(default)]
        pub backup: EtcdBackup,
    }

    /// Health check settings
    #[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
    #[serde(rename_all = "camelCase")]
    pub struct HealthCheckConfig {
        /// Sync period, e.g. `30s`
        #[serde(with = "humantime_serde")]
        pub sync_period: Duration,
    }

    /// `ControllerConfiguration` as written in the file
    #[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
    #[serde(rename_all = "camelCase")]
    pub struct ControllerConfiguration {
        /// Must equal [`super::API_VERSION`]
        #[serde(default)]
        pub api_version: String,
        /// Must equal [`super::KIND`]
        #[serde(default)]
        pub kind: String,
        /// Client connection overrides
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub client_connection: Option<ClientConnectionConfiguration>,
        /// Etcd settings
        #[serde(default)]
        pub etcd: Etcd,
        /// Health check settings
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub health_check_config: Option<HealthCheckConfig>,
        /// Feature gates
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        pub feature_gates: BTreeMap<String, bool>,
    }
}

impl From<v1alpha1::ClientConnectionConfiguration> for ClientConnection {
    fn from(v: v1alpha1::ClientConnectionConfiguration) -> Self {
        Self {
            kubeconfig: v.kubeconfig,
            accept_content_types: v.accept_content_types,
            content_type: v.content_type,
            qps: v.qps,
            burst: v.burst,
        }
    }
}

impl From<ClientConnection> for v1alpha1::ClientConnectionConfiguration {
    fn from(c: ClientConnection) -> Self {
        Self {
            kubeconfig: c.kubeconfig,
            accept_content_types: c.accept_content_types,
            content_type: c.content_type,
            qps: c.qps,
            burst: c.burst,
        }
    }
}

impl From<v1alpha1::Etcd> for Etcd {
    fn from(v: v1alpha1::Etcd) -> Self {
        Self {
            storage: EtcdStorage {
                class_name: v.storage.class_name,
                capacity: v.storage.capacity,
            },
            backup: EtcdBackup {
                schedule: v.backup.schedule,
            },
        }
    }
}

impl From<Etcd> for v1alpha1::Etcd {
    fn from(e: Etcd) -> Self {
        Self {
            storage: v1alpha1::EtcdStorage {
                class_name: e.storage.class_name,
                capacity: e.storage.capacity,
            },
            backup: v1alpha1::EtcdBackup {
                schedule: e.backup.schedule,
            },
        }
    }
}

impl From<v1alpha1::HealthCheckConfig> for HealthCheckConfig {
    fn from(v: v1alpha1::HealthCheckConfig) -> Self {
        Self {
            sync_period: v.sync_period,
        }
    }
}

impl From<HealthCheckConfig> for v1alpha1::HealthCheckConfig {
    fn from(h: HealthCheckConfig) -> Self {
        Self {
            sync_period: h.sync_period,
        }
    }
}

impl From<v1alpha1::ControllerConfiguration> for ControllerConfiguration {
    fn from(v: v1alpha1::ControllerConfiguration) -> Self {
        Self {
            client_connection: v.client_connection.map(Into::into),
            etcd: v.etcd.into(),
            health_check_config: v.health_check_config.map(Into::into),
            feature_gates: v.feature_gates,
        }
    }
}

impl From<ControllerConfiguration> for v1alpha1::ControllerConfiguration {
    fn from(c: ControllerConfiguration) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            client_connection: c.client_connection.map(Into::into),
            etcd: c.etcd.into(),
            health_check_config: c.health_check_config.map(Into::into),
            feature_gates: c.feature_gates,
        }
    }
}

/// Decode configuration file content
pub fn decode(content: &str) -> Result<ControllerConfiguration> {
    let raw: Value = serde_yaml::from_str(content)?;
    let api_version = raw.get("apiVersion").and_then(Value::as_str).unwrap_or_default();
    let kind = raw.get("kind").and_then(Value::as_str).unwrap_or_default();
    if api_version != API_VERSION || kind != KIND {
        return Err(Error::serialization_for(
            KIND,
            format!("unsupported object {api_version}/{kind}, expected {API_VERSION}/{KIND}"),
        ));
    }

    let versioned: v1alpha1::ControllerConfiguration =
        serde_json::from_value(raw).map_err(|e| Error::serialization_for(KIND, e.to_string()))?;
    let config = ControllerConfiguration::from(versioned);
    config.validate()?;
    Ok(config)
}

/// Read and decode a configuration file
pub fn load(path: &Path) -> Result<ControllerConfiguration> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::validation_for(
            path.display().to_string(),
            format!("failed to read configuration file: {e}"),
        )
    })?;
    let config = decode(&content)?;
    debug!(path = %path.display(), feature_gates = config.feature_gates.len(), "Loaded controller configuration");
    Ok(config)
}
