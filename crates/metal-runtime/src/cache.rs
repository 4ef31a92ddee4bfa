//! Shared informer caches
//!
//! A [`ClusterCache`] owns one reflector per kind and serves reads from
//! memory. Informers requested before the cache starts are queued and spawned
//! on start; informers requested afterwards start immediately. Each informer
//! (and each tracked controller store) contributes a sync flag that latches
//! once the initial list completed, so transient watch errors after that never
//! flip readiness back.

use std::any::Any;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use kube::api::{Api, DynamicObject};
use kube::runtime::reflector::store::Writer;
use kube::runtime::reflector::{self, Store};
use kube::runtime::watcher::{self, watcher, Event};
use kube::runtime::WatchStreamExt;
use kube::{Client, Resource};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::runnable::{Runnable, RunnableError, RunnableGroup};
use crate::scheme::{gvk_string, TypeInfo};

/// Server-side watch timeout; must stay below the client read timeout
pub const WATCH_TIMEOUT_SECS: u32 = 25;

type InformerTask = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, ()> + Send>;

enum Lifecycle {
    Pending(Vec<InformerTask>),
    Started {
        token: CancellationToken,
        tasks: Vec<JoinHandle<()>>,
    },
    Stopped,
}

struct CacheInner {
    name: String,
    client: Client,
    stores: RwLock<HashMap<String, Box<dyn Any + Send + Sync>>>,
    sync_flags: RwLock<Vec<(String, Arc<AtomicBool>)>>,
    lifecycle: Mutex<Lifecycle>,
}

/// Informer cache of one cluster
///
/// Cloning yields another handle to the same cache.
#[derive(Clone)]
pub struct ClusterCache {
    inner: Arc<CacheInner>,
}

impl ClusterCache {
    /// Create an empty cache reading through `client`
    pub fn new(name: impl Into<String>, client: Client) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                name: name.into(),
                client,
                stores: RwLock::new(HashMap::new()),
                sync_flags: RwLock::new(Vec::new()),
                lifecycle: Mutex::new(Lifecycle::Pending(Vec::new())),
            }),
        }
    }

    /// Cache name (cluster name)
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Store for `K`, creating a cluster-wide informer on first use
    pub fn informer<K>(&self) -> Store<K>
    where
        K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    {
        let key = typed_key::<K>();
        let mut stores = self.inner.stores.write();
        if let Some(store) = stores.get(&key).and_then(|s| s.downcast_ref::<Store<K>>()) {
            return store.clone();
        }

        let (reader, writer) = reflector::store::<K>();
        let api: Api<K> = Api::all(self.inner.client.clone());
        stores.insert(key.clone(), Box::new(reader.clone()));
        drop(stores);

        self.schedule_informer(key, api, writer);
        reader
    }

    /// Store for a kind known only at runtime
    pub fn dynamic_informer(&self, info: &TypeInfo) -> Store<DynamicObject> {
        let key = format!("dynamic:{}", gvk_string(&info.gvk));
        let mut stores = self.inner.stores.write();
        if let Some(store) = stores
            .get(&key)
            .and_then(|s| s.downcast_ref::<Store<DynamicObject>>())
        {
            return store.clone();
        }

        let resource = info.api_resource();
        let writer = Writer::new(resource.clone());
        let reader = writer.as_reader();
        let api: Api<DynamicObject> = Api::all_with(self.inner.client.clone(), &resource);
        stores.insert(key.clone(), Box::new(reader.clone()));
        drop(stores);

        self.schedule_informer(key, api, writer);
        reader
    }

    /// Existing store for `K`, without creating an informer
    pub fn store<K>(&self) -> Option<Store<K>>
    where
        K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
    {
        self.inner
            .stores
            .read()
            .get(&typed_key::<K>())
            .and_then(|s| s.downcast_ref::<Store<K>>())
            .cloned()
    }

    /// Count a store owned elsewhere (e.g. by a controller) towards sync readiness
    pub fn track_store<K>(&self, name: &str, store: Store<K>)
    where
        K: Resource + Clone + Send + Sync + 'static,
        K::DynamicType: Eq + std::hash::Hash + Clone + Send + Sync,
    {
        let flag = self.register_sync_flag(name);
        let name = name.to_string();
        self.schedule(Box::new(move |token: CancellationToken| {
            async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    ready = store.wait_until_ready() => {
                        if ready.is_ok() {
                            flag.store(true, Ordering::SeqCst);
                            debug!(store = %name, "Controller store synced");
                        }
                    }
                }
            }
            .boxed()
        }));
    }

    fn register_sync_flag(&self, name: &str) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(false));
        self.inner
            .sync_flags
            .write()
            .push((name.to_string(), Arc::clone(&flag)));
        flag
    }

    fn schedule_informer<K>(&self, key: String, api: Api<K>, writer: Writer<K>)
    where
        K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
        K::DynamicType: Eq + std::hash::Hash + Clone + Send + Sync,
    {
        let flag = self.register_sync_flag(&key);
        let cache = self.inner.name.clone();
        self.schedule(Box::new(move |token: CancellationToken| {
            async move {
                let config = watcher::Config::default().timeout(WATCH_TIMEOUT_SECS);
                let stream = watcher(api, config).default_backoff().reflect(writer);
                futures::pin_mut!(stream);
                debug!(cache = %cache, informer = %key, "Informer started");
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        event = stream.next() => match event {
                            Some(Ok(Event::InitDone)) => {
                                if !flag.swap(true, Ordering::SeqCst) {
                                    info!(cache = %cache, informer = %key, "Informer synced");
                                }
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                warn!(cache = %cache, informer = %key, error = %e, "Watch error, backing off");
                            }
                            None => break,
                        }
                    }
                }
                debug!(cache = %cache, informer = %key, "Informer stopped");
            }
            .boxed()
        }));
    }

    fn schedule(&self, task: InformerTask) {
        let mut lifecycle = self.inner.lifecycle.lock();
        match &mut *lifecycle {
            Lifecycle::Pending(pending) => pending.push(task),
            Lifecycle::Started { token, tasks } => {
                tasks.push(tokio::spawn(task(token.child_token())));
            }
            Lifecycle::Stopped => {
                debug!(cache = %self.inner.name, "Cache stopped, informer not started");
            }
        }
    }

    /// Spawn all queued informers; later informers start on creation
    ///
    /// Returns `false` if the cache was already started or stopped.
    pub fn start(&self, token: CancellationToken) -> bool {
        let mut lifecycle = self.inner.lifecycle.lock();
        let Lifecycle::Pending(pending) = &mut *lifecycle else {
            return false;
        };
        let pending = std::mem::take(pending);
        info!(cache = %self.inner.name, informers = pending.len(), "Starting cache");
        let tasks = pending
            .into_iter()
            .map(|task| tokio::spawn(task(token.child_token())))
            .collect();
        *lifecycle = Lifecycle::Started { token, tasks };
        true
    }

    /// Whether [`ClusterCache::start`] ran
    pub fn is_started(&self) -> bool {
        matches!(*self.inner.lifecycle.lock(), Lifecycle::Started { .. })
    }

    /// Cancel all informers and wait for them to exit
    pub async fn stop(&self) {
        let tasks = {
            let mut lifecycle = self.inner.lifecycle.lock();
            match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
                Lifecycle::Started { token, tasks } => {
                    token.cancel();
                    tasks
                }
                _ => Vec::new(),
            }
        };
        for task in tasks {
            let _ = task.await;
        }
        debug!(cache = %self.inner.name, "Cache stopped");
    }

    /// Whether the cache started and every informer finished its initial list
    pub fn has_synced(&self) -> bool {
        self.is_started() && self.unsynced().is_empty()
    }

    /// Names of informers and stores still waiting for their initial list
    pub fn unsynced(&self) -> Vec<String> {
        self.inner
            .sync_flags
            .read()
            .iter()
            .filter(|(_, flag)| !flag.load(Ordering::SeqCst))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Number of informers and tracked stores
    pub fn informer_count(&self) -> usize {
        self.inner.sync_flags.read().len()
    }

    /// Wait until a store finished its initial list
    pub async fn wait_for_store<K>(store: &Store<K>, timeout: Duration) -> bool
    where
        K: Resource + Clone + 'static,
        K::DynamicType: Eq + std::hash::Hash + Clone,
    {
        matches!(
            tokio::time::timeout(timeout, store.wait_until_ready()).await,
            Ok(Ok(()))
        )
    }

    /// Runnable driving this cache inside a manager
    pub fn runnable(&self) -> Box<dyn Runnable> {
        Box::new(CacheRunnable {
            name: format!("cache/{}", self.inner.name),
            cache: self.clone(),
        })
    }
}

fn typed_key<K: Resource<DynamicType = ()>>() -> String {
    format!(
        "{}/{}/{}",
        K::group(&()),
        K::version(&()),
        K::kind(&())
    )
}

struct CacheRunnable {
    name: String,
    cache: ClusterCache,
}

#[async_trait]
impl Runnable for CacheRunnable {
    fn name(&self) -> &str {
        &self.name
    }

    fn group(&self) -> RunnableGroup {
        RunnableGroup::Caches
    }

    async fn start(self: Box<Self>, shutdown: CancellationToken) -> Result<(), RunnableError> {
        if !self.cache.start(shutdown.child_token()) {
            return Err(RunnableError::new(self.name, "cache started twice"));
        }
        shutdown.cancelled().await;
        self.cache.stop().await;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ConfigMap, Secret};
    use kube::runtime::reflector::ObjectRef;

    /// Client whose every request fails; informers retry in the background
    pub(crate) fn offline_client() -> Client {
        let service = tower::service_fn(|_req: http::Request<kube::client::Body>| async {
            Err::<http::Response<kube::client::Body>, std::io::Error>(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "offline",
            ))
        });
        Client::new(service, "default")
    }

    #[tokio::test]
    async fn informer_is_created_once_per_kind() {
        let cache = ClusterCache::new("seed", offline_client());
        let _a = cache.informer::<Secret>();
        let _b = cache.informer::<Secret>();
        let _c = cache.informer::<ConfigMap>();
        assert_eq!(cache.informer_count(), 2);
        assert!(cache.store::<Secret>().is_some());
    }

    #[tokio::test]
    async fn unstarted_cache_is_not_synced() {
        let cache = ClusterCache::new("seed", offline_client());
        assert!(!cache.has_synced());
        assert!(cache.start(CancellationToken::new()));
        // No informers: started is enough
        assert!(cache.has_synced());
        cache.stop().await;
    }

    #[tokio::test]
    async fn informer_without_initial_list_stays_unsynced() {
        let cache = ClusterCache::new("seed", offline_client());
        let store = cache.informer::<Secret>();
        let token = CancellationToken::new();
        cache.start(token.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!cache.has_synced());
        assert_eq!(cache.unsynced(), vec!["/v1/Secret".to_string()]);
        assert!(store.get(&ObjectRef::new("missing").within("default")).is_none());

        token.cancel();
        cache.stop().await;
    }

    #[tokio::test]
    async fn tracked_store_latches_once_ready() {
        let cache = ClusterCache::new("seed", offline_client());
        let (reader, mut writer) = reflector::store::<ConfigMap>();
        cache.track_store("controller/configmaps", reader);
        cache.start(CancellationToken::new());
        assert!(!cache.has_synced());

        writer.apply_watcher_event(&Event::Init);
        writer.apply_watcher_event(&Event::InitDone);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cache.has_synced());

        // A later restart of the watch does not flip readiness
        writer.apply_watcher_event(&Event::Init);
        assert!(cache.has_synced());
        cache.stop().await;
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let cache = ClusterCache::new("seed", offline_client());
        assert!(cache.start(CancellationToken::new()));
        assert!(!cache.start(CancellationToken::new()));
        cache.stop().await;
        assert!(!cache.is_started());
    }
}
