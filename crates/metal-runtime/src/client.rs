//! Client that reads from the cache except for bypassed kinds
//!
//! Reads of kinds in the bypass set go straight to the API server, so a read
//! following a write always observes it. All other reads are served from the
//! cluster cache, starting an informer on first use. Writes always go to the
//! API server through [`DelegatingClient::kube_client`].

use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use kube::api::{Api, GroupVersionKind};
use kube::core::{ClusterResourceScope, NamespaceResourceScope};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::trace;

use crate::cache::ClusterCache;
use crate::scheme::{gvk_of, gvk_string, SchemeRegistry};

/// How long a first cached read waits for its informer to sync
pub const CACHE_SYNC_TIMEOUT: Duration = Duration::from_secs(30);

/// Read errors
#[derive(Debug, Error)]
pub enum ClientError {
    /// The kind is not part of the cluster's scheme
    #[error("no kind is registered for {gvk}")]
    NotRegistered {
        /// Requested GVK
        gvk: String,
    },

    /// A cached read was attempted before the cache started
    #[error("cache for {gvk} is not started")]
    CacheNotStarted {
        /// Requested GVK
        gvk: String,
    },

    /// The informer did not finish its initial list in time
    #[error("timed out waiting for cache of {gvk} to sync")]
    SyncTimeout {
        /// Requested GVK
        gvk: String,
    },

    /// API error on a live read
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),
}

/// Cache-backed reader with a per-kind bypass
#[derive(Clone)]
pub struct DelegatingClient {
    client: Client,
    cache: ClusterCache,
    scheme: SchemeRegistry,
    uncached: Arc<HashSet<GroupVersionKind>>,
}

impl DelegatingClient {
    /// Create a client; reads of `uncached` kinds always hit the API server
    pub fn new(
        client: Client,
        cache: ClusterCache,
        scheme: SchemeRegistry,
        uncached: impl IntoIterator<Item = GroupVersionKind>,
    ) -> Self {
        Self {
            client,
            cache,
            scheme,
            uncached: Arc::new(uncached.into_iter().collect()),
        }
    }

    /// Raw client for writes and watches
    pub fn kube_client(&self) -> Client {
        self.client.clone()
    }

    /// Cache backing this client
    pub fn cache(&self) -> &ClusterCache {
        &self.cache
    }

    /// Scheme this client resolves kinds against
    pub fn scheme(&self) -> &SchemeRegistry {
        &self.scheme
    }

    /// Whether reads of `K` are served from the cache
    pub fn is_cached<K: Resource<DynamicType = ()>>(&self) -> bool {
        !self.uncached.contains(&gvk_of::<K>())
    }

    fn check_registered<K: Resource<DynamicType = ()>>(&self) -> Result<GroupVersionKind, ClientError> {
        let gvk = gvk_of::<K>();
        if self.scheme.recognizes(&gvk) {
            Ok(gvk)
        } else {
            Err(ClientError::NotRegistered {
                gvk: gvk_string(&gvk),
            })
        }
    }

    async fn synced_store<K>(&self, gvk: &GroupVersionKind) -> Result<Store<K>, ClientError>
    where
        K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    {
        if !self.cache.is_started() {
            return Err(ClientError::CacheNotStarted {
                gvk: gvk_string(gvk),
            });
        }
        let store = self.cache.informer::<K>();
        if ClusterCache::wait_for_store(&store, CACHE_SYNC_TIMEOUT).await {
            Ok(store)
        } else {
            Err(ClientError::SyncTimeout {
                gvk: gvk_string(gvk),
            })
        }
    }

    /// Read a namespaced object
    pub async fn get<K>(&self, namespace: &str, name: &str) -> Result<Option<K>, ClientError>
    where
        K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + Debug
            + Send
            + Sync
            + 'static,
    {
        let gvk = self.check_registered::<K>()?;
        if self.uncached.contains(&gvk) {
            trace!(kind = %gvk.kind, namespace, name, "Live read");
            let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
            return Ok(api.get_opt(name).await?);
        }

        let store = self.synced_store::<K>(&gvk).await?;
        Ok(store
            .get(&ObjectRef::new(name).within(namespace))
            .map(|obj| (*obj).clone()))
    }

    /// Read a cluster-scoped object
    pub async fn get_cluster<K>(&self, name: &str) -> Result<Option<K>, ClientError>
    where
        K: Resource<DynamicType = (), Scope = ClusterResourceScope>
            + Clone
            + DeserializeOwned
            + Debug
            + Send
            + Sync
            + 'static,
    {
        let gvk = self.check_registered::<K>()?;
        if self.uncached.contains(&gvk) {
            trace!(kind = %gvk.kind, name, "Live read");
            let api: Api<K> = Api::all(self.client.clone());
            return Ok(api.get_opt(name).await?);
        }

        let store = self.synced_store::<K>(&gvk).await?;
        Ok(store.get(&ObjectRef::new(name)).map(|obj| (*obj).clone()))
    }

    /// List namespaced objects
    pub async fn list<K>(&self, namespace: &str) -> Result<Vec<K>, ClientError>
    where
        K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + Debug
            + Send
            + Sync
            + 'static,
    {
        let gvk = self.check_registered::<K>()?;
        if self.uncached.contains(&gvk) {
            let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
            return Ok(api.list(&Default::default()).await?.items);
        }

        let store = self.synced_store::<K>(&gvk).await?;
        Ok(store
            .state()
            .into_iter()
            .filter(|obj| obj.namespace().as_deref() == Some(namespace))
            .map(|obj| (*obj).clone())
            .collect())
    }
}
