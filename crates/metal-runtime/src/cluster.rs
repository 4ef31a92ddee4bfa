//! Connection bundle for one cluster: client, cache and scheme

use kube::api::GroupVersionKind;
use kube::{Client, Config};
use thiserror::Error;
use tracing::info;

use crate::cache::ClusterCache;
use crate::client::DelegatingClient;
use crate::runnable::Runnable;
use crate::scheme::SchemeRegistry;

/// Cluster construction errors
#[derive(Debug, Error)]
#[error("failed to create client for cluster {name}: {source}")]
pub struct ClusterError {
    /// Cluster name
    pub name: String,
    /// Underlying error
    #[source]
    pub source: kube::Error,
}

/// A cluster the manager talks to besides (or as) its primary one
///
/// The cache is not running until [`Cluster::cache_runnable`] is added to a
/// manager and the manager starts.
#[derive(Clone)]
pub struct Cluster {
    name: String,
    client: DelegatingClient,
}

impl Cluster {
    /// Connect using a client config
    pub fn new(
        name: impl Into<String>,
        config: Config,
        scheme: SchemeRegistry,
        uncached: impl IntoIterator<Item = GroupVersionKind>,
    ) -> Result<Self, ClusterError> {
        let name = name.into();
        let url = config.cluster_url.to_string();
        let client = Client::try_from(config).map_err(|source| ClusterError {
            name: name.clone(),
            source,
        })?;
        info!(cluster = %name, url = %url, "Cluster client created");
        Ok(Self::from_client(name, client, scheme, uncached))
    }

    /// Wrap an existing client
    pub fn from_client(
        name: impl Into<String>,
        client: Client,
        scheme: SchemeRegistry,
        uncached: impl IntoIterator<Item = GroupVersionKind>,
    ) -> Self {
        let name = name.into();
        let cache = ClusterCache::new(name.clone(), client.clone());
        Self {
            client: DelegatingClient::new(client, cache, scheme, uncached),
            name,
        }
    }

    /// Cluster name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reader/writer for this cluster
    pub fn client(&self) -> &DelegatingClient {
        &self.client
    }

    /// Informer cache of this cluster
    pub fn cache(&self) -> &ClusterCache {
        self.client.cache()
    }

    /// Scheme of this cluster
    pub fn scheme(&self) -> &SchemeRegistry {
        self.client.scheme()
    }

    /// Runnable that drives the cache; runs on every replica
    pub fn cache_runnable(&self) -> Box<dyn Runnable> {
        self.cache().runnable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runnable::RunnableGroup;

    #[tokio::test]
    async fn cache_runnable_runs_without_leadership() {
        crate::install_crypto_provider();
        let config = Config::new("https://127.0.0.1:6443".parse().unwrap());
        let cluster = Cluster::new("garden", config, SchemeRegistry::new(), []).unwrap();
        let runnable = cluster.cache_runnable();
        assert_eq!(runnable.group(), RunnableGroup::Caches);
        assert!(!runnable.needs_leader_election());
        assert_eq!(runnable.name(), "cache/garden");
    }
}
