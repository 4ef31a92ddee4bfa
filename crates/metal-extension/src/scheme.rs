//! Scheme builders for every API group the extension reads or writes
//!
//! Composition is an explicit, ordered sequence of builder calls; each
//! builder is independent and registering twice is harmless.

use kube::api::GroupVersionKind;
use metal_runtime::scheme::CORE;
use metal_runtime::{SchemeBuilder, SchemeError, SchemeRegistry, TypeInfo};

use metal_common::apis::metal;
use metal_common::crd::{CloudProfile, Cluster, ControlPlane, Infrastructure, Worker};

/// `extensions.gardener.cloud/v1alpha1`
pub const EXTENSIONS: SchemeBuilder = SchemeBuilder::new("extensions.gardener.cloud", register_extensions);

/// `metal.provider.extensions.gardener.cloud/v1alpha1`
pub const PROVIDER: SchemeBuilder = SchemeBuilder::new(metal::GROUP, register_provider);

/// etcd-druid (`druid.gardener.cloud/v1alpha1`)
pub const DRUID: SchemeBuilder = SchemeBuilder::new("druid.gardener.cloud", register_druid);

/// Vertical pod autoscaler (`autoscaling.k8s.io/v1`)
pub const VPA: SchemeBuilder = SchemeBuilder::new("autoscaling.k8s.io", register_vpa);

/// machine-controller-manager (`machine.sapcloud.io/v1alpha1`)
pub const MACHINE: SchemeBuilder = SchemeBuilder::new("machine.sapcloud.io", register_machine);

/// Garden resources (`core.gardener.cloud/v1beta1`)
pub const GARDEN_CORE: SchemeBuilder = SchemeBuilder::new("core.gardener.cloud", register_garden_core);

/// Builders composing the seed scheme, in registration order
pub const SEED_BUILDERS: &[SchemeBuilder] = &[CORE, EXTENSIONS, PROVIDER, DRUID, VPA, MACHINE];

/// Builders composing the garden scheme, in registration order
pub const GARDEN_BUILDERS: &[SchemeBuilder] = &[CORE, GARDEN_CORE];

/// Apply `builders` in order, stopping at the first failure
pub fn compose(builders: &[SchemeBuilder]) -> Result<SchemeRegistry, SchemeError> {
    let scheme = SchemeRegistry::new();
    for builder in builders {
        builder.add_to_scheme(&scheme)?;
    }
    Ok(scheme)
}

/// Scheme of the seed cluster
pub fn seed_scheme() -> Result<SchemeRegistry, SchemeError> {
    compose(SEED_BUILDERS)
}

/// Scheme of the garden cluster
pub fn garden_scheme() -> Result<SchemeRegistry, SchemeError> {
    compose(GARDEN_BUILDERS)
}

fn untyped(group: &str, version: &str, kind: &str, plural: &str, namespaced: bool) -> TypeInfo {
    TypeInfo::untyped(GroupVersionKind::gvk(group, version, kind), plural, namespaced)
}

fn register_extensions(scheme: &SchemeRegistry) -> Result<(), SchemeError> {
    scheme.add_namespaced::<Infrastructure>()?;
    scheme.add_namespaced::<Worker>()?;
    scheme.add_namespaced::<ControlPlane>()?;
    scheme.add_cluster::<Cluster>()?;
    Ok(())
}

fn register_provider(scheme: &SchemeRegistry) -> Result<(), SchemeError> {
    // Embedded objects only; never served by the API server
    for kind in metal::KINDS {
        let plural = format!("{}s", kind.to_lowercase());
        scheme.add(untyped(metal::GROUP, "v1alpha1", kind, &plural, true))?;
    }
    Ok(())
}

fn register_druid(scheme: &SchemeRegistry) -> Result<(), SchemeError> {
    scheme.add(untyped("druid.gardener.cloud", "v1alpha1", "Etcd", "etcds", true))?;
    scheme.add(untyped(
        "druid.gardener.cloud",
        "v1alpha1",
        "EtcdCopyBackupsTask",
        "etcdcopybackupstasks",
        true,
    ))?;
    Ok(())
}

fn register_vpa(scheme: &SchemeRegistry) -> Result<(), SchemeError> {
    scheme.add(untyped(
        "autoscaling.k8s.io",
        "v1",
        "VerticalPodAutoscaler",
        "verticalpodautoscalers",
        true,
    ))
}

fn register_machine(scheme: &SchemeRegistry) -> Result<(), SchemeError> {
    const GROUP: &str = "machine.sapcloud.io";
    scheme.add(untyped(GROUP, "v1alpha1", "MachineClass", "machineclasses", true))?;
    scheme.add(untyped(GROUP, "v1alpha1", "MachineDeployment", "machinedeployments", true))?;
    scheme.add(untyped(GROUP, "v1alpha1", "MachineSet", "machinesets", true))?;
    scheme.add(untyped(GROUP, "v1alpha1", "Machine", "machines", true))?;
    Ok(())
}

fn register_garden_core(scheme: &SchemeRegistry) -> Result<(), SchemeError> {
    const GROUP: &str = "core.gardener.cloud";
    scheme.add_cluster::<CloudProfile>()?;
    scheme.add(untyped(GROUP, "v1beta1", "Shoot", "shoots", true))?;
    scheme.add(untyped(GROUP, "v1beta1", "Seed", "seeds", false))?;
    scheme.add(untyped(GROUP, "v1beta1", "SecretBinding", "secretbindings", true))?;
    Ok(())
}
