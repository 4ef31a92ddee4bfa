//! Worker controller
//!
//! Resolves the machine image of every worker pool against the shoot's
//! CloudProfile and records the result as `WorkerStatus`. The seed holds a
//! `Cluster` resource per shoot naming its CloudProfile; the profile itself
//! lives in the garden cluster.

use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
use metal_common::apis::metal::{CloudProfileConfig, ProviderObject, WorkerStatus};
use metal_common::crd::{CloudProfile, Cluster as ShootCluster, Extension, Worker};
use metal_runtime::{Cluster, DelegatingClient, Manager};
use serde_json::Value;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use super::extension::{add_extension_controller, Actuator};
use super::{ControllerAdder, ControllerConfig, ControllerEntry};
use crate::error::{ReconcileError, RegistrationError};

/// Controller name
pub const NAME: &str = "worker";

/// Configuration surface of the worker controller
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AddOptions {
    /// Runtime settings
    pub controller: ControllerConfig,
    /// Reconcile on every change instead of on request
    pub ignore_operation_annotation: bool,
}

/// Source of a shoot's provider-specific CloudProfile configuration
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CloudProfileSource: Send + Sync {
    /// Configuration for the shoot whose control plane lives in `namespace`
    async fn cloud_profile_config(&self, namespace: &str) -> Result<CloudProfileConfig, ReconcileError>;
}

/// Reads the `Cluster` from the seed and the `CloudProfile` from the garden
pub struct GardenCloudProfiles {
    seed: DelegatingClient,
    garden: DelegatingClient,
}

impl GardenCloudProfiles {
    /// Source backed by the seed and garden clients
    pub fn new(seed: DelegatingClient, garden: DelegatingClient) -> Self {
        Self { seed, garden }
    }
}

#[async_trait]
impl CloudProfileSource for GardenCloudProfiles {
    async fn cloud_profile_config(&self, namespace: &str) -> Result<CloudProfileConfig, ReconcileError> {
        let cluster = self
            .seed
            .get_cluster::<ShootCluster>(namespace)
            .await?
            .ok_or_else(|| ReconcileError::not_found("Cluster", namespace))?;

        let profile_name = cluster
            .spec
            .shoot_cloud_profile_name()
            .ok_or(ReconcileError::MissingMetadata("shoot cloud profile name"))?
            .to_string();

        let profile = self
            .garden
            .get_cluster::<CloudProfile>(&profile_name)
            .await?
            .ok_or_else(|| ReconcileError::not_found("CloudProfile", &profile_name))?;

        debug!(cloud_profile = %profile_name, "CloudProfile read from garden");
        match profile.spec.provider_config.as_ref() {
            Some(raw) => Ok(CloudProfileConfig::decode(raw)?),
            None => Ok(CloudProfileConfig::default()),
        }
    }
}

/// Actuator resolving worker pool machine images
pub struct WorkerActuator {
    profiles: Arc<dyn CloudProfileSource>,
}

impl WorkerActuator {
    /// Actuator reading profiles from `profiles`
    pub fn new(profiles: Arc<dyn CloudProfileSource>) -> Self {
        Self { profiles }
    }
}

/// Resolve every pool's image, falling back to images recorded earlier
///
/// The fallback keeps machines running whose image version was removed from
/// the CloudProfile after they were created.
pub fn resolve_machine_images(
    worker: &Worker,
    profile: &CloudProfileConfig,
) -> Result<WorkerStatus, ReconcileError> {
    let previous = match worker.extension_status().and_then(|s| s.provider_status.as_ref()) {
        Some(raw) => WorkerStatus::decode(raw)?,
        None => WorkerStatus::default(),
    };

    let mut status = WorkerStatus::default();
    for pool in &worker.spec.pools {
        let image = &pool.machine_image;
        let arch = pool.architecture.as_deref();
        let resolved = profile
            .find_machine_image(&image.name, &image.version, arch)
            .or_else(|| previous.find_machine_image(&image.name, &image.version, arch).cloned())
            .ok_or_else(|| {
                ReconcileError::not_found(
                    "machine image",
                    format!("{}/{} ({}) for pool {}", image.name, image.version, arch.unwrap_or("amd64"), pool.name),
                )
            })?;
        status.add_machine_image(resolved);
    }
    Ok(status)
}

#[async_trait]
impl Actuator<Worker> for WorkerActuator {
    async fn reconcile(&self, worker: &Worker) -> Result<Option<Value>, ReconcileError> {
        let namespace = worker
            .namespace()
            .ok_or(ReconcileError::MissingMetadata("namespace"))?;
        let profile = self.profiles.cloud_profile_config(&namespace).await?;
        let status = resolve_machine_images(worker, &profile)?;
        debug!(
            %namespace,
            images = status.machine_images.len(),
            "Worker machine images resolved"
        );
        Ok(Some(status.encode()?))
    }

    async fn delete(&self, _worker: &Worker) -> Result<(), ReconcileError> {
        Ok(())
    }
}

/// Adds the worker controller; needs the garden cluster
pub struct WorkerAdder {
    options: AddOptions,
    garden: Cluster,
}

impl WorkerAdder {
    /// Adder with the given options reading profiles from `garden`
    pub fn new(options: AddOptions, garden: Cluster) -> Self {
        Self { options, garden }
    }
}

impl ControllerAdder for WorkerAdder {
    fn name(&self) -> &'static str {
        NAME
    }

    fn entry(&self) -> ControllerEntry {
        ControllerEntry {
            name: NAME.to_string(),
            enabled: true,
            max_concurrent_reconciles: self.options.controller.max_concurrent_reconciles,
            ignore_operation_annotation: self.options.ignore_operation_annotation,
        }
    }

    fn add_to_manager(&self, mgr: &mut Manager) -> Result<(), RegistrationError> {
        let profiles = GardenCloudProfiles::new(mgr.client().clone(), self.garden.client().clone());
        add_extension_controller::<Worker>(
            mgr,
            NAME,
            Arc::new(WorkerActuator::new(Arc::new(profiles))),
            self.options.controller,
            self.options.ignore_operation_annotation,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metal_common::apis::metal::{MachineImage, MachineImageVersion, MachineImages};
    use metal_common::crd::{ExtensionStatus, MachineImageRef, WorkerPool, WorkerSpec};
    use metal_common::PROVIDER_TYPE;

    fn pool(name: &str, image: &str, version: &str, arch: Option<&str>) -> WorkerPool {
        WorkerPool {
            name: name.to_string(),
            machine_type: "m5.metal".to_string(),
            machine_image: MachineImageRef {
                name: image.to_string(),
                version: version.to_string(),
            },
            minimum: 1,
            maximum: 3,
            architecture: arch.map(str::to_string),
            provider_config: None,
        }
    }

    fn worker(pools: Vec<WorkerPool>) -> Worker {
        let mut worker = Worker::new(
            "worker",
            WorkerSpec {
                extension_type: PROVIDER_TYPE.to_string(),
                provider_config: None,
                region: "eu-west".to_string(),
                secret_ref: Default::default(),
                infrastructure_provider_status: None,
                pools,
            },
        );
        worker.metadata.namespace = Some("shoot--dev--a".to_string());
        worker
    }

    fn profile() -> CloudProfileConfig {
        CloudProfileConfig {
            machine_images: vec![MachineImages {
                name: "gardenlinux".to_string(),
                versions: vec![
                    MachineImageVersion {
                        version: "1443.3".to_string(),
                        image: "registry/gardenlinux:1443.3".to_string(),
                        architecture: None,
                    },
                    MachineImageVersion {
                        version: "1443.3".to_string(),
                        image: "registry/gardenlinux-arm:1443.3".to_string(),
                        architecture: Some("arm64".to_string()),
                    },
                ],
            }],
        }
    }

    #[test]
    fn pools_resolve_per_architecture() {
        let worker = worker(vec![
            pool("amd", "gardenlinux", "1443.3", None),
            pool("arm", "gardenlinux", "1443.3", Some("arm64")),
        ]);
        let status = resolve_machine_images(&worker, &profile()).unwrap();
        assert_eq!(status.machine_images.len(), 2);
        assert_eq!(status.machine_images[1].image, "registry/gardenlinux-arm:1443.3");
    }

    #[test]
    fn removed_versions_fall_back_to_recorded_status() {
        let mut worker = worker(vec![pool("old", "gardenlinux", "934.8", None)]);
        let recorded = WorkerStatus {
            machine_images: vec![MachineImage {
                name: "gardenlinux".to_string(),
                version: "934.8".to_string(),
                image: "registry/gardenlinux:934.8".to_string(),
                architecture: Some("amd64".to_string()),
            }],
        };
        worker.status = Some(ExtensionStatus {
            provider_status: Some(recorded.encode().unwrap()),
            ..Default::default()
        });

        let status = resolve_machine_images(&worker, &profile()).unwrap();
        assert_eq!(status, recorded);
    }

    #[test]
    fn unknown_image_is_an_error() {
        let worker = worker(vec![pool("p", "ubuntu", "22.04", None)]);
        let err = resolve_machine_images(&worker, &profile()).unwrap_err();
        assert!(err.to_string().contains("ubuntu/22.04"));
    }

    #[tokio::test]
    async fn actuator_reads_profile_for_the_worker_namespace() {
        let mut profiles = MockCloudProfileSource::new();
        profiles
            .expect_cloud_profile_config()
            .withf(|namespace| namespace == "shoot--dev--a")
            .times(1)
            .returning(|_| Ok(profile()));
        let actuator = WorkerActuator::new(Arc::new(profiles));

        let raw = actuator
            .reconcile(&worker(vec![pool("amd", "gardenlinux", "1443.3", None)]))
            .await
            .unwrap()
            .unwrap();

        let status = WorkerStatus::decode(&raw).unwrap();
        assert_eq!(status.machine_images[0].image, "registry/gardenlinux:1443.3");
    }

    #[tokio::test]
    async fn missing_profile_fails_reconcile() {
        let mut profiles = MockCloudProfileSource::new();
        profiles
            .expect_cloud_profile_config()
            .returning(|_| Err(ReconcileError::not_found("CloudProfile", "metal")));
        let actuator = WorkerActuator::new(Arc::new(profiles));

        let err = actuator.reconcile(&worker(vec![])).await.unwrap_err();
        assert!(matches!(err, ReconcileError::NotFound { kind: "CloudProfile", .. }));
    }
}
