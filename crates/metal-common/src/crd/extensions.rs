//! Extension resources (`extensions.gardener.cloud/v1alpha1`)
//!
//! Gardener creates one Infrastructure, Worker and ControlPlane per shoot in
//! the shoot's control-plane namespace on the seed. Each carries a `type`
//! selecting the provider extension and an opaque `providerConfig` decoded by
//! that extension. Only the fields this extension reads are modelled; unknown
//! fields are ignored on decode.

use std::fmt::Debug;

use kube::core::NamespaceResourceScope;
use kube::{CustomResource, Resource};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reference to a secret in a specific namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecretReference {
    /// Secret name
    pub name: String,
    /// Secret namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Infrastructure of a shoot (networks, routing, security groups)
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "extensions.gardener.cloud",
    version = "v1alpha1",
    kind = "Infrastructure",
    namespaced,
    status = "ExtensionStatus",
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"Region","type":"string","jsonPath":".spec.region"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.lastOperation.state"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct InfrastructureSpec {
    /// Provider type, e.g. `ironcore-metal`
    #[serde(rename = "type")]
    pub extension_type: String,
    /// Provider-specific configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_config: Option<Value>,
    /// Region of the shoot
    #[serde(default)]
    pub region: String,
    /// Cloud provider credentials
    #[serde(default)]
    pub secret_ref: SecretReference,
    /// Public SSH key for worker nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_public_key: Option<String>,
}

/// Machine image requested for a worker pool
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MachineImageRef {
    /// Logical image name, e.g. `gardenlinux`
    pub name: String,
    /// Image version
    pub version: String,
}

/// One pool of worker machines
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerPool {
    /// Pool name
    pub name: String,
    /// Machine type (server class)
    #[serde(default)]
    pub machine_type: String,
    /// Requested machine image
    pub machine_image: MachineImageRef,
    /// Minimum number of machines
    #[serde(default)]
    pub minimum: i32,
    /// Maximum number of machines
    #[serde(default)]
    pub maximum: i32,
    /// CPU architecture, defaults to amd64 when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    /// Pool specific provider configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_config: Option<Value>,
}

/// Worker machines of a shoot
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "extensions.gardener.cloud",
    version = "v1alpha1",
    kind = "Worker",
    namespaced,
    status = "ExtensionStatus",
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"Region","type":"string","jsonPath":".spec.region"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.lastOperation.state"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSpec {
    /// Provider type
    #[serde(rename = "type")]
    pub extension_type: String,
    /// Provider-specific configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_config: Option<Value>,
    /// Region of the shoot
    #[serde(default)]
    pub region: String,
    /// Cloud provider credentials
    #[serde(default)]
    pub secret_ref: SecretReference,
    /// Provider status of the Infrastructure resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infrastructure_provider_status: Option<Value>,
    /// Worker pools
    #[serde(default)]
    pub pools: Vec<WorkerPool>,
}

/// Control plane components of a shoot hosted in the seed
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "extensions.gardener.cloud",
    version = "v1alpha1",
    kind = "ControlPlane",
    namespaced,
    status = "ExtensionStatus",
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"Purpose","type":"string","jsonPath":".spec.purpose"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.lastOperation.state"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneSpec {
    /// Provider type
    #[serde(rename = "type")]
    pub extension_type: String,
    /// Provider-specific configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_config: Option<Value>,
    /// Region of the shoot
    #[serde(default)]
    pub region: String,
    /// Cloud provider credentials
    #[serde(default)]
    pub secret_ref: SecretReference,
    /// `normal` or `exposure`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
    /// Provider status of the Infrastructure resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infrastructure_provider_status: Option<Value>,
}

/// Shoot, seed and cloud profile snapshot for one shoot namespace
///
/// Cluster-scoped; the name equals the shoot's control-plane namespace.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "extensions.gardener.cloud",
    version = "v1alpha1",
    kind = "Cluster"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Embedded CloudProfile
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_profile: Option<Value>,
    /// Embedded Seed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<Value>,
    /// Embedded Shoot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shoot: Option<Value>,
}

impl ClusterSpec {
    /// Name of the CloudProfile the shoot references
    ///
    /// Newer shoots use `spec.cloudProfile.name`, older ones `spec.cloudProfileName`.
    pub fn shoot_cloud_profile_name(&self) -> Option<&str> {
        let spec = self.shoot.as_ref()?.get("spec")?;
        spec.get("cloudProfile")
            .and_then(|p| p.get("name"))
            .or_else(|| spec.get("cloudProfileName"))
            .and_then(Value::as_str)
    }

    /// Name of the shoot
    pub fn shoot_name(&self) -> Option<&str> {
        self.shoot
            .as_ref()?
            .get("metadata")?
            .get("name")?
            .as_str()
    }
}

/// Kind of the last operation
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum LastOperationType {
    /// First reconciliation
    Create,
    /// Subsequent reconciliation
    Reconcile,
    /// Deletion
    Delete,
    /// Control plane migration (source side)
    Migrate,
    /// Control plane migration (target side)
    Restore,
}

/// Outcome of the last operation
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum LastOperationState {
    /// Still running
    Processing,
    /// Finished successfully
    Succeeded,
    /// Failed and will be retried
    Error,
    /// Failed permanently
    Failed,
    /// Not started yet
    Pending,
    /// Aborted by the user
    Aborted,
}

/// Last operation performed on an extension resource
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LastOperation {
    /// Operation kind
    #[serde(rename = "type")]
    pub operation_type: LastOperationType,
    /// Operation outcome
    pub state: LastOperationState,
    /// Progress in percent
    #[serde(default)]
    pub progress: i32,
    /// Human readable description
    #[serde(default)]
    pub description: String,
    /// RFC 3339 timestamp of the last update
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<String>,
}

/// Last error observed while processing an extension resource
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LastError {
    /// Error description
    pub description: String,
    /// Operation task that failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    /// RFC 3339 timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<String>,
}

/// Condition status value
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition holds
    True,
    /// Condition does not hold
    False,
    /// Not determined
    Unknown,
    /// Transitioning
    Progressing,
}

/// Status condition
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type, e.g. `ExtensionHealthy`
    #[serde(rename = "type")]
    pub condition_type: String,
    /// Condition status
    pub status: ConditionStatus,
    /// Machine readable reason
    #[serde(default)]
    pub reason: String,
    /// Human readable message
    #[serde(default)]
    pub message: String,
    /// RFC 3339 timestamp of the last status change
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
    /// RFC 3339 timestamp of the last update
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<String>,
}

/// Status shared by all extension resources
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionStatus {
    /// Last operation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_operation: Option<LastOperation>,
    /// Last error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<LastError>,
    /// Generation observed by the last reconciliation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    /// Provider specific status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_status: Option<Value>,
    /// Conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl ExtensionStatus {
    /// Whether the last operation finished successfully
    pub fn last_operation_succeeded(&self) -> bool {
        self.last_operation
            .as_ref()
            .is_some_and(|op| op.state == LastOperationState::Succeeded)
    }

    /// Find a condition by type
    pub fn condition(&self, condition_type: &str) -> Option<&Condition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }
}

/// Uniform access to namespaced extension resources
pub trait Extension:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + DeserializeOwned
    + Serialize
    + Send
    + Sync
    + 'static
{
    /// Provider type from `spec.type`
    fn extension_type(&self) -> &str;

    /// Opaque provider configuration
    fn provider_config(&self) -> Option<&Value>;

    /// Current status, if any
    fn extension_status(&self) -> Option<&ExtensionStatus>;
}

macro_rules! impl_extension {
    ($($kind:ty),+ $(,)?) => {
        $(
            impl Extension for $kind {
                fn extension_type(&self) -> &str {
                    &self.spec.extension_type
                }

                fn provider_config(&self) -> Option<&Value> {
                    self.spec.provider_config.as_ref()
                }

                fn extension_status(&self) -> Option<&ExtensionStatus> {
                    self.status.as_ref()
                }
            }
        )+
    };
}

impl_extension!(Infrastructure, Worker, ControlPlane);

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn worker_decodes_pools_and_ignores_unknown_fields() {
        let worker: Worker = serde_json::from_value(json!({
            "apiVersion": "extensions.gardener.cloud/v1alpha1",
            "kind": "Worker",
            "metadata": {"name": "worker", "namespace": "shoot--foo--bar"},
            "spec": {
                "type": "ironcore-metal",
                "region": "rack-1",
                "secretRef": {"name": "cloudprovider", "namespace": "shoot--foo--bar"},
                "sshPublicKeySecretRef": {"name": "ignored"},
                "pools": [{
                    "name": "pool-a",
                    "machineType": "large",
                    "machineImage": {"name": "gardenlinux", "version": "1443.3.0"},
                    "minimum": 1,
                    "maximum": 3
                }]
            }
        }))
        .unwrap();

        assert_eq!(worker.extension_type(), "ironcore-metal");
        assert_eq!(worker.spec.pools[0].machine_image.version, "1443.3.0");
        assert!(worker.extension_status().is_none());
    }

    #[test]
    fn cluster_resolves_cloud_profile_name() {
        let spec = ClusterSpec {
            shoot: Some(json!({"spec": {"cloudProfile": {"kind": "CloudProfile", "name": "metal"}}})),
            ..Default::default()
        };
        assert_eq!(spec.shoot_cloud_profile_name(), Some("metal"));

        let legacy = ClusterSpec {
            shoot: Some(json!({"spec": {"cloudProfileName": "metal-legacy"}})),
            ..Default::default()
        };
        assert_eq!(legacy.shoot_cloud_profile_name(), Some("metal-legacy"));

        assert_eq!(ClusterSpec::default().shoot_cloud_profile_name(), None);
    }

    #[test]
    fn status_reports_success_and_conditions() {
        let status: ExtensionStatus = serde_json::from_value(json!({
            "lastOperation": {"type": "Reconcile", "state": "Succeeded", "progress": 100},
            "conditions": [{"type": "ExtensionHealthy", "status": "True"}]
        }))
        .unwrap();

        assert!(status.last_operation_succeeded());
        assert_eq!(
            status.condition("ExtensionHealthy").map(|c| c.status),
            Some(ConditionStatus::True)
        );
        assert!(!ExtensionStatus::default().last_operation_succeeded());
    }
}
