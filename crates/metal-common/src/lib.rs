//! Common types for the ironcore-metal provider extension: CRDs, provider APIs, errors, and utilities

#![deny(missing_docs)]

pub mod apis;
pub mod crd;
pub mod error;
pub mod kubeconfig;
pub mod leader_election;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Name of this extension, used for leader election IDs, heartbeats, and field managers
pub const PROVIDER_NAME: &str = "provider-ironcore-metal";

/// Provider type matched against `spec.type` of extension resources
pub const PROVIDER_TYPE: &str = "ironcore-metal";

/// Env var naming the namespace the leader election lease lives in
pub const LEADER_ELECTION_NAMESPACE_ENV: &str = "LEADER_ELECTION_NAMESPACE";

/// Env var naming the namespace webhook configuration is placed in
pub const WEBHOOK_CONFIG_NAMESPACE_ENV: &str = "WEBHOOK_CONFIG_NAMESPACE";

/// Env var holding the path of the garden cluster kubeconfig
pub const GARDEN_KUBECONFIG_ENV: &str = "GARDEN_KUBECONFIG";

/// Annotation requesting an operation on an extension resource
pub const OPERATION_ANNOTATION: &str = "gardener.cloud/operation";

/// Operation annotation value requesting a reconcile
pub const OPERATION_RECONCILE: &str = "reconcile";

/// Operation annotation value requesting a restore
pub const OPERATION_RESTORE: &str = "restore";

/// Operation annotation value requesting a migration
pub const OPERATION_MIGRATE: &str = "migrate";

/// Label carrying the provider type on shoot namespaces in the seed
pub const SHOOT_PROVIDER_LABEL: &str = "shoot.gardener.cloud/provider";

/// Label marking the purpose of a secret
pub const PURPOSE_LABEL: &str = "gardener.cloud/purpose";

/// Purpose label value of cloud provider credential secrets
pub const PURPOSE_CLOUDPROVIDER: &str = "cloudprovider";

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "provider-ironcore-metal";
