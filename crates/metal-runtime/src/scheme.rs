//! Registry of the kinds a cluster client may read and write
//!
//! Scheme builders register related kinds as a group. Registration is
//! idempotent and commutative: registering the same Rust type for a GVK twice
//! is a no-op, registering a different type for a known GVK is a conflict.
//! The registry is sealed when the manager starts running; later
//! registrations fail.

use std::collections::HashMap;
use std::sync::Arc;

use kube::api::{ApiResource, GroupVersionKind};
use kube::core::{ClusterResourceScope, NamespaceResourceScope};
use kube::Resource;
use parking_lot::RwLock;
use thiserror::Error;

/// Scheme registration errors
#[derive(Debug, Error)]
pub enum SchemeError {
    /// A different type is already registered for the GVK
    #[error("conflicting registration for {gvk}: {existing} already registered, got {attempted}")]
    Conflict {
        /// The contested GVK (`group/version, Kind=kind`)
        gvk: String,
        /// Type registered first
        existing: &'static str,
        /// Type registered second
        attempted: &'static str,
    },

    /// Registration after the manager started
    #[error("scheme is sealed, cannot register {gvk}")]
    Sealed {
        /// GVK that was rejected
        gvk: String,
    },

    /// A builder failed
    #[error("scheme builder {builder} failed: {source}")]
    Builder {
        /// Builder name
        builder: &'static str,
        /// Underlying error
        #[source]
        source: Box<SchemeError>,
    },
}

/// Render a GVK the way the API machinery prints it
pub fn gvk_string(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        format!("{}, Kind={}", gvk.version, gvk.kind)
    } else {
        format!("{}/{}, Kind={}", gvk.group, gvk.version, gvk.kind)
    }
}

/// Everything known about one registered kind
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TypeInfo {
    /// Group, version and kind
    pub gvk: GroupVersionKind,
    /// Plural resource name used in URLs
    pub plural: String,
    /// Whether objects live in namespaces
    pub namespaced: bool,
    /// Rust type backing the kind
    pub type_name: &'static str,
}

impl TypeInfo {
    /// Describe a namespaced kind
    pub fn namespaced<K>() -> Self
    where
        K: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
    {
        Self::describe::<K>(true)
    }

    /// Describe a cluster-scoped kind
    pub fn cluster<K>() -> Self
    where
        K: Resource<DynamicType = (), Scope = ClusterResourceScope>,
    {
        Self::describe::<K>(false)
    }

    /// Describe a kind that has no Rust type beyond its raw form
    pub fn untyped(gvk: GroupVersionKind, plural: &str, namespaced: bool) -> Self {
        Self {
            gvk,
            plural: plural.to_string(),
            namespaced,
            type_name: "DynamicObject",
        }
    }

    fn describe<K: Resource<DynamicType = ()>>(namespaced: bool) -> Self {
        Self {
            gvk: GroupVersionKind::gvk(&K::group(&()), &K::version(&()), &K::kind(&())),
            plural: K::plural(&()).to_string(),
            namespaced,
            type_name: std::any::type_name::<K>(),
        }
    }

    /// API resource for dynamic clients
    pub fn api_resource(&self) -> ApiResource {
        ApiResource::from_gvk_with_plural(&self.gvk, &self.plural)
    }
}

#[derive(Default)]
struct SchemeState {
    types: HashMap<GroupVersionKind, TypeInfo>,
    sealed: bool,
}

/// Shared, append-only kind registry
///
/// Cloning yields another handle to the same registry.
#[derive(Clone, Default)]
pub struct SchemeRegistry {
    state: Arc<RwLock<SchemeState>>,
}

impl SchemeRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a kind
    pub fn add(&self, info: TypeInfo) -> Result<(), SchemeError> {
        let mut state = self.state.write();
        if let Some(existing) = state.types.get(&info.gvk) {
            if existing.type_name == info.type_name {
                return Ok(());
            }
            return Err(SchemeError::Conflict {
                gvk: gvk_string(&info.gvk),
                existing: existing.type_name,
                attempted: info.type_name,
            });
        }
        if state.sealed {
            return Err(SchemeError::Sealed {
                gvk: gvk_string(&info.gvk),
            });
        }
        state.types.insert(info.gvk.clone(), info);
        Ok(())
    }

    /// Register a namespaced kind by type
    pub fn add_namespaced<K>(&self) -> Result<(), SchemeError>
    where
        K: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
    {
        self.add(TypeInfo::namespaced::<K>())
    }

    /// Register a cluster-scoped kind by type
    pub fn add_cluster<K>(&self) -> Result<(), SchemeError>
    where
        K: Resource<DynamicType = (), Scope = ClusterResourceScope>,
    {
        self.add(TypeInfo::cluster::<K>())
    }

    /// Look up a kind
    pub fn lookup(&self, gvk: &GroupVersionKind) -> Option<TypeInfo> {
        self.state.read().types.get(gvk).cloned()
    }

    /// Whether a kind is registered
    pub fn recognizes(&self, gvk: &GroupVersionKind) -> bool {
        self.state.read().types.contains_key(gvk)
    }

    /// Whether the Rust type's kind is registered
    pub fn recognizes_type<K: Resource<DynamicType = ()>>(&self) -> bool {
        self.recognizes(&gvk_of::<K>())
    }

    /// Forbid further registrations
    pub fn seal(&self) {
        self.state.write().sealed = true;
    }

    /// Whether the registry is sealed
    pub fn is_sealed(&self) -> bool {
        self.state.read().sealed
    }

    /// Number of registered kinds
    pub fn len(&self) -> usize {
        self.state.read().types.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered GVKs, sorted for stable output
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.state.read().types.keys().map(gvk_string).collect();
        kinds.sort();
        kinds
    }
}

/// GVK of a Rust resource type
pub fn gvk_of<K: Resource<DynamicType = ()>>() -> GroupVersionKind {
    GroupVersionKind::gvk(&K::group(&()), &K::version(&()), &K::kind(&()))
}

/// A named group of registrations applied in one call
#[derive(Clone, Copy)]
pub struct SchemeBuilder {
    name: &'static str,
    register: fn(&SchemeRegistry) -> Result<(), SchemeError>,
}

impl SchemeBuilder {
    /// Create a builder
    pub const fn new(
        name: &'static str,
        register: fn(&SchemeRegistry) -> Result<(), SchemeError>,
    ) -> Self {
        Self { name, register }
    }

    /// Builder name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Apply all registrations of this builder
    pub fn add_to_scheme(&self, scheme: &SchemeRegistry) -> Result<(), SchemeError> {
        (self.register)(scheme).map_err(|e| SchemeError::Builder {
            builder: self.name,
            source: Box::new(e),
        })
    }
}

/// Kubernetes built-in kinds used by every extension
pub const CORE: SchemeBuilder = SchemeBuilder::new("kubernetes", register_core);

fn register_core(scheme: &SchemeRegistry) -> Result<(), SchemeError> {
    use k8s_openapi::api::admissionregistration::v1::MutatingWebhookConfiguration;
    use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
    use k8s_openapi::api::coordination::v1::Lease;
    use k8s_openapi::api::core::v1::{ConfigMap, Event, Namespace, Secret, Service, ServiceAccount};

    scheme.add_namespaced::<Secret>()?;
    scheme.add_namespaced::<ConfigMap>()?;
    scheme.add_namespaced::<Service>()?;
    scheme.add_namespaced::<ServiceAccount>()?;
    scheme.add_namespaced::<Event>()?;
    scheme.add_namespaced::<Lease>()?;
    scheme.add_namespaced::<Deployment>()?;
    scheme.add_namespaced::<StatefulSet>()?;
    scheme.add_cluster::<Namespace>()?;
    scheme.add_cluster::<MutatingWebhookConfiguration>()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret};

    fn fake_secret_type() -> TypeInfo {
        TypeInfo {
            type_name: "other::Secret",
            ..TypeInfo::namespaced::<Secret>()
        }
    }

    #[test]
    fn registration_is_idempotent() {
        let scheme = SchemeRegistry::new();
        CORE.add_to_scheme(&scheme).unwrap();
        let count = scheme.len();
        CORE.add_to_scheme(&scheme).unwrap();
        assert_eq!(scheme.len(), count);
        assert!(scheme.recognizes_type::<Secret>());
    }

    #[test]
    fn registration_order_does_not_matter() {
        let a = SchemeRegistry::new();
        a.add_namespaced::<Secret>().unwrap();
        a.add_cluster::<Namespace>().unwrap();

        let b = SchemeRegistry::new();
        b.add_cluster::<Namespace>().unwrap();
        b.add_namespaced::<Secret>().unwrap();

        assert_eq!(a.kinds(), b.kinds());
    }

    #[test]
    fn conflicting_type_is_rejected() {
        let scheme = SchemeRegistry::new();
        scheme.add_namespaced::<Secret>().unwrap();
        let err = scheme.add(fake_secret_type()).unwrap_err();
        assert!(matches!(err, SchemeError::Conflict { .. }));
    }

    #[test]
    fn sealed_scheme_rejects_new_kinds_but_accepts_known_ones() {
        let scheme = SchemeRegistry::new();
        scheme.add_namespaced::<Secret>().unwrap();
        scheme.seal();

        assert!(scheme.add_namespaced::<Secret>().is_ok());
        assert!(matches!(
            scheme.add_namespaced::<ConfigMap>(),
            Err(SchemeError::Sealed { .. })
        ));
    }

    #[test]
    fn builder_errors_name_the_builder() {
        fn register_broken(scheme: &SchemeRegistry) -> Result<(), SchemeError> {
            scheme.add_namespaced::<Secret>()?;
            scheme.add(fake_secret_type())
        }
        let broken = SchemeBuilder::new("broken", register_broken);

        let err = broken.add_to_scheme(&SchemeRegistry::new()).unwrap_err();
        assert!(err.to_string().starts_with("scheme builder broken failed"));
    }

    #[test]
    fn type_info_carries_plural_and_scope() {
        let info = TypeInfo::cluster::<Namespace>();
        assert_eq!(info.plural, "namespaces");
        assert!(!info.namespaced);
        assert_eq!(gvk_string(&info.gvk), "v1, Kind=Namespace");
        assert_eq!(info.api_resource().plural, "namespaces");
    }
}
