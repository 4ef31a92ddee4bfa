//! Custom resource types the extension reads and writes
//!
//! - [`extensions`]: `extensions.gardener.cloud/v1alpha1` resources reconciled
//!   in the seed (Infrastructure, Worker, ControlPlane) and the Cluster
//!   resource describing the owning shoot
//! - [`garden`]: `core.gardener.cloud/v1beta1` resources read from the garden

pub mod extensions;
pub mod garden;

pub use extensions::{
    Cluster, ClusterSpec, Condition, ConditionStatus, ControlPlane, ControlPlaneSpec, Extension,
    ExtensionStatus, Infrastructure, InfrastructureSpec, LastError, LastOperation,
    LastOperationState, LastOperationType, MachineImageRef, SecretReference, Worker, WorkerPool,
    WorkerSpec,
};
pub use garden::{CloudProfile, CloudProfileSpec};
