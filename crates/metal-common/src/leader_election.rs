//! Leader election using Kubernetes Leases
//!
//! Replicas of the controller manager compete for a coordination.k8s.io/v1
//! Lease. Only the holder registers and runs controllers; the others keep
//! their caches and probe servers warm and retry until the lease frees up.
//!
//! # Atomicity
//!
//! Every write carries the resourceVersion that was read. If the lease changed
//! in between, the write fails with 409 Conflict and the attempt counts as
//! "not acquired". Two replicas can therefore never both believe they won the
//! same lease generation.
//!
//! Lease access goes through [`LeaseStore`] so the election logic can run
//! against the API server ([`KubeLeaseStore`]) or an in-process store
//! ([`MemoryLeaseStore`]).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default time a lease stays valid without renewal
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(15);
/// Default time the leader keeps retrying a failed renewal before giving up
pub const DEFAULT_RENEW_DEADLINE: Duration = Duration::from_secs(10);
/// Default interval between renewals while leading
pub const DEFAULT_RENEW_INTERVAL: Duration = Duration::from_secs(2);
/// Default interval between acquisition attempts while standing by
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Build the conventional lease name for a provider (`<provider>-leader-election`)
pub fn leader_election_id(provider_name: &str) -> String {
    format!("{provider_name}-leader-election")
}

/// Leader election errors
#[derive(Debug, Error)]
pub enum LeaderElectionError {
    /// Kubernetes API error
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// The stored lease cannot be written back safely
    #[error("invalid lease {name}: {message}")]
    InvalidLease {
        /// Lease name
        name: String,
        /// What is wrong with it
        message: String,
    },
}

/// Storage seam for the lease object
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Read the lease, `None` if it does not exist
    async fn get(&self, name: &str) -> Result<Option<Lease>, LeaderElectionError>;

    /// Create the lease; `false` if it already exists
    async fn create(&self, lease: &Lease) -> Result<bool, LeaderElectionError>;

    /// Replace the lease guarded by its resourceVersion; `false` on conflict
    async fn replace(&self, lease: &Lease) -> Result<bool, LeaderElectionError>;
}

/// [`LeaseStore`] backed by the Kubernetes API
pub struct KubeLeaseStore {
    api: Api<Lease>,
}

impl KubeLeaseStore {
    /// Store leases in `namespace` of the cluster behind `client`
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl LeaseStore for KubeLeaseStore {
    async fn get(&self, name: &str) -> Result<Option<Lease>, LeaderElectionError> {
        Ok(self.api.get_opt(name).await?)
    }

    async fn create(&self, lease: &Lease) -> Result<bool, LeaderElectionError> {
        match self.api.create(&PostParams::default(), lease).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn replace(&self, lease: &Lease) -> Result<bool, LeaderElectionError> {
        let name = lease_name(lease)?;
        match self.api.replace(name, &PostParams::default(), lease).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-process [`LeaseStore`] with the same compare-and-swap rules as the API server
#[derive(Default)]
pub struct MemoryLeaseStore {
    inner: Mutex<MemoryLeases>,
}

#[derive(Default)]
struct MemoryLeases {
    leases: HashMap<String, Lease>,
    next_version: u64,
}

impl MemoryLeaseStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Current holder of the named lease
    pub fn holder(&self, name: &str) -> Option<String> {
        self.inner
            .lock()
            .leases
            .get(name)
            .and_then(|l| l.spec.as_ref())
            .and_then(|s| s.holder_identity.clone())
    }
}

impl MemoryLeases {
    fn stamp(&mut self, lease: &Lease) -> Lease {
        self.next_version += 1;
        let mut stored = lease.clone();
        stored.metadata.resource_version = Some(self.next_version.to_string());
        stored
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn get(&self, name: &str) -> Result<Option<Lease>, LeaderElectionError> {
        Ok(self.inner.lock().leases.get(name).cloned())
    }

    async fn create(&self, lease: &Lease) -> Result<bool, LeaderElectionError> {
        let name = lease_name(lease)?.to_string();
        let mut inner = self.inner.lock();
        if inner.leases.contains_key(&name) {
            return Ok(false);
        }
        let stored = inner.stamp(lease);
        inner.leases.insert(name, stored);
        Ok(true)
    }

    async fn replace(&self, lease: &Lease) -> Result<bool, LeaderElectionError> {
        let name = lease_name(lease)?.to_string();
        let mut inner = self.inner.lock();
        let current = inner
            .leases
            .get(&name)
            .and_then(|l| l.metadata.resource_version.clone());
        if current.is_none() || current != lease.metadata.resource_version {
            return Ok(false);
        }
        let stored = inner.stamp(lease);
        inner.leases.insert(name, stored);
        Ok(true)
    }
}

fn lease_name(lease: &Lease) -> Result<&str, LeaderElectionError> {
    lease
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| LeaderElectionError::InvalidLease {
            name: String::new(),
            message: "lease has no name".to_string(),
        })
}

/// What an elector should do with the lease it just read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseDecision {
    /// No lease exists yet
    Create,
    /// We hold it; bump the renew time
    Renew,
    /// Held by someone whose lease expired (or nobody); take it over
    TakeOver {
        /// Transition count to record
        transitions: i32,
    },
    /// Another live holder owns it
    HeldByOther {
        /// The current holder
        holder: String,
    },
}

/// Decide how `identity` may act on `lease` at time `now`
pub fn evaluate(lease: Option<&Lease>, identity: &str, now: DateTime<Utc>) -> LeaseDecision {
    let Some(lease) = lease else {
        return LeaseDecision::Create;
    };
    let spec = lease.spec.as_ref();
    let holder = spec.and_then(|s| s.holder_identity.as_deref());
    let transitions = spec.and_then(|s| s.lease_transitions).unwrap_or(0);

    match holder {
        Some(h) if h == identity => LeaseDecision::Renew,
        None | Some("") => LeaseDecision::TakeOver {
            transitions: transitions + 1,
        },
        Some(h) => {
            let renew_time = spec.and_then(|s| s.renew_time.as_ref());
            let duration_secs = spec.and_then(|s| s.lease_duration_seconds);
            let expired = match (renew_time, duration_secs) {
                (Some(rt), Some(duration)) => {
                    now > rt.0 + chrono::Duration::seconds(i64::from(duration))
                }
                _ => true,
            };
            if expired {
                LeaseDecision::TakeOver {
                    transitions: transitions + 1,
                }
            } else {
                LeaseDecision::HeldByOther {
                    holder: h.to_string(),
                }
            }
        }
    }
}

/// Timing of the election loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElectionTiming {
    /// How long a lease is valid without renewal
    pub lease_duration: Duration,
    /// How long the leader keeps retrying failed renewals
    pub renew_deadline: Duration,
    /// Interval between renewals while leading
    pub renew_interval: Duration,
    /// Interval between acquisition attempts while standing by
    pub retry_interval: Duration,
}

impl Default for ElectionTiming {
    fn default() -> Self {
        Self {
            lease_duration: DEFAULT_LEASE_DURATION,
            renew_deadline: DEFAULT_RENEW_DEADLINE,
            renew_interval: DEFAULT_RENEW_INTERVAL,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }
}

/// Leader elector competing for one Lease
pub struct LeaderElector {
    store: Arc<dyn LeaseStore>,
    lease_name: String,
    identity: String,
    timing: ElectionTiming,
    is_leader: Arc<AtomicBool>,
}

impl LeaderElector {
    /// Create an elector over an arbitrary lease store
    pub fn new(
        store: Arc<dyn LeaseStore>,
        lease_name: &str,
        identity: &str,
        timing: ElectionTiming,
    ) -> Self {
        Self {
            store,
            lease_name: lease_name.to_string(),
            identity: identity.to_string(),
            timing,
            is_leader: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Create an elector storing its lease in `namespace` of the given cluster
    pub fn for_cluster(
        client: Client,
        namespace: &str,
        lease_name: &str,
        identity: &str,
        timing: ElectionTiming,
    ) -> Self {
        Self::new(
            Arc::new(KubeLeaseStore::new(client, namespace)),
            lease_name,
            identity,
            timing,
        )
    }

    /// Identity this elector writes into the lease
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Whether this elector currently holds the lease
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// Block until leadership is acquired, then return a guard
    ///
    /// Errors while standing by are logged and retried; callers cancel the
    /// wait by dropping the future.
    pub async fn acquire(self: Arc<Self>) -> LeaderGuard {
        info!(
            identity = %self.identity,
            lease = %self.lease_name,
            "Waiting for leadership..."
        );

        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!(identity = %self.identity, lease = %self.lease_name, "Leadership acquired");
                    self.is_leader.store(true, Ordering::SeqCst);
                    return self.create_guard();
                }
                Ok(false) => {
                    debug!(
                        identity = %self.identity,
                        retry_ms = self.timing.retry_interval.as_millis() as u64,
                        "Lease held by another, waiting..."
                    );
                }
                Err(e) => {
                    warn!(
                        identity = %self.identity,
                        error = %e,
                        retry_ms = self.timing.retry_interval.as_millis() as u64,
                        "Failed to acquire lease, retrying..."
                    );
                }
            }
            tokio::time::sleep(self.timing.retry_interval).await;
        }
    }

    fn create_guard(self: &Arc<Self>) -> LeaderGuard {
        let (lost_tx, lost_rx) = oneshot::channel();
        let elector = Arc::clone(self);
        let renewal_task = tokio::spawn(async move {
            elector.renewal_loop(lost_tx).await;
        });

        LeaderGuard {
            elector: Arc::clone(self),
            renewal_task,
            lost_rx: Some(lost_rx),
        }
    }

    /// One compare-and-swap round against the lease
    pub async fn try_acquire_or_renew(&self) -> Result<bool, LeaderElectionError> {
        let now = Utc::now();
        let existing = self.store.get(&self.lease_name).await?;

        match evaluate(existing.as_ref(), &self.identity, now) {
            LeaseDecision::Create => {
                let created = self.store.create(&self.new_lease(None, now, 0)).await?;
                if created {
                    info!(identity = %self.identity, "Created new lease");
                } else {
                    debug!(identity = %self.identity, "Lease creation conflict, will retry");
                }
                Ok(created)
            }
            LeaseDecision::Renew => {
                let Some(mut lease) = existing else {
                    return Ok(false);
                };
                self.require_version(&lease)?;
                if let Some(spec) = lease.spec.as_mut() {
                    spec.renew_time = Some(MicroTime(now));
                }
                let renewed = self.store.replace(&lease).await?;
                if renewed {
                    debug!(identity = %self.identity, "Lease renewed");
                } else {
                    warn!(identity = %self.identity, "Lease renewal conflict");
                }
                Ok(renewed)
            }
            LeaseDecision::TakeOver { transitions } => {
                let rv = existing
                    .as_ref()
                    .map(|l| self.require_version(l).map(str::to_string))
                    .transpose()?;
                let taken = self
                    .store
                    .replace(&self.new_lease(rv, now, transitions))
                    .await?;
                if taken {
                    info!(identity = %self.identity, transitions, "Took over expired lease");
                } else {
                    debug!(identity = %self.identity, "Lease takeover conflict, will retry");
                }
                Ok(taken)
            }
            LeaseDecision::HeldByOther { holder } => {
                debug!(identity = %self.identity, holder = %holder, "Lease held by another replica");
                Ok(false)
            }
        }
    }

    fn require_version<'a>(&self, lease: &'a Lease) -> Result<&'a str, LeaderElectionError> {
        lease
            .metadata
            .resource_version
            .as_deref()
            .ok_or_else(|| LeaderElectionError::InvalidLease {
                name: self.lease_name.clone(),
                message: "missing resourceVersion".to_string(),
            })
    }

    fn new_lease(&self, resource_version: Option<String>, now: DateTime<Utc>, transitions: i32) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                resource_version,
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(self.timing.lease_duration.as_secs().max(1) as i32),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(transitions),
                ..Default::default()
            }),
        }
    }

    /// Renew until a conflict shows someone else owns the lease, or until
    /// renewals keep failing past the renew deadline
    async fn renewal_loop(&self, lost_tx: oneshot::Sender<()>) {
        let mut last_renewed = Instant::now();
        loop {
            tokio::time::sleep(self.timing.renew_interval).await;

            match self.try_acquire_or_renew().await {
                Ok(true) => last_renewed = Instant::now(),
                Ok(false) => {
                    warn!(identity = %self.identity, "Leadership lost to another replica");
                    break;
                }
                Err(e) if last_renewed.elapsed() < self.timing.renew_deadline => {
                    warn!(identity = %self.identity, error = %e, "Lease renewal failed, retrying");
                }
                Err(e) => {
                    warn!(identity = %self.identity, error = %e, "Lease renewal deadline exceeded");
                    break;
                }
            }
        }
        self.is_leader.store(false, Ordering::SeqCst);
        let _ = lost_tx.send(());
    }

    /// Clear the holder so a standby can take over without waiting for expiry
    async fn release_lease(&self) -> Result<(), LeaderElectionError> {
        let Some(mut lease) = self.store.get(&self.lease_name).await? else {
            debug!(identity = %self.identity, "Lease not found, nothing to release");
            return Ok(());
        };

        let holder = lease.spec.as_ref().and_then(|s| s.holder_identity.as_deref());
        if holder != Some(self.identity.as_str()) {
            debug!(identity = %self.identity, "Not the lease holder, nothing to release");
            return Ok(());
        }

        self.require_version(&lease)?;
        let past = Utc::now() - chrono::Duration::seconds(60);
        if let Some(spec) = lease.spec.as_mut() {
            spec.holder_identity = None;
            spec.renew_time = Some(MicroTime(past));
        }

        if self.store.replace(&lease).await? {
            info!(identity = %self.identity, "Lease released for fast failover");
        } else {
            debug!(identity = %self.identity, "Lease changed before release, skipping");
        }
        Ok(())
    }
}

/// Guard that maintains leadership
///
/// While the guard exists the lease is renewed in the background. Dropping it
/// stops renewal without releasing the lease; call
/// [`LeaderGuard::release_leadership`] first on graceful shutdown.
pub struct LeaderGuard {
    elector: Arc<LeaderElector>,
    renewal_task: JoinHandle<()>,
    lost_rx: Option<oneshot::Receiver<()>>,
}

impl LeaderGuard {
    /// Wait until leadership is lost
    ///
    /// Returns immediately on every call after the first completed wait.
    pub async fn lost(&mut self) {
        if let Some(rx) = self.lost_rx.take() {
            let _ = rx.await;
        }
    }

    /// Identity holding the lease
    pub fn identity(&self) -> &str {
        self.elector.identity()
    }

    /// Stop renewing and clear the lease holder
    pub async fn release_leadership(&self) -> Result<(), LeaderElectionError> {
        self.renewal_task.abort();
        self.elector.is_leader.store(false, Ordering::SeqCst);
        self.elector.release_lease().await
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.elector.is_leader.store(false, Ordering::SeqCst);
        self.renewal_task.abort();
        debug!(identity = %self.elector.identity, "Leader guard dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const LEASE: &str = "provider-ironcore-metal-leader-election";

    fn fast_timing() -> ElectionTiming {
        ElectionTiming {
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_millis(200),
            renew_interval: Duration::from_millis(20),
            retry_interval: Duration::from_millis(10),
        }
    }

    fn lease_held_by(holder: Option<&str>, renewed_secs_ago: i64, duration: i32) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(LEASE.to_string()),
                resource_version: Some("7".to_string()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: holder.map(str::to_string),
                lease_duration_seconds: Some(duration),
                renew_time: Some(MicroTime(Utc::now() - chrono::Duration::seconds(renewed_secs_ago))),
                lease_transitions: Some(3),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn missing_lease_is_created() {
        assert_eq!(evaluate(None, "a", Utc::now()), LeaseDecision::Create);
    }

    #[rstest]
    #[case::own_lease(Some("a"), 1, LeaseDecision::Renew)]
    #[case::live_other(Some("b"), 1, LeaseDecision::HeldByOther { holder: "b".to_string() })]
    #[case::expired_other(Some("b"), 60, LeaseDecision::TakeOver { transitions: 4 })]
    #[case::released(None, 1, LeaseDecision::TakeOver { transitions: 4 })]
    fn lease_decisions(
        #[case] holder: Option<&str>,
        #[case] renewed_secs_ago: i64,
        #[case] expected: LeaseDecision,
    ) {
        let lease = lease_held_by(holder, renewed_secs_ago, 15);
        assert_eq!(evaluate(Some(&lease), "a", Utc::now()), expected);
    }

    #[test]
    fn leader_election_id_appends_suffix() {
        assert_eq!(leader_election_id("provider-ironcore-metal"), LEASE);
    }

    #[tokio::test]
    async fn memory_store_rejects_stale_writes() {
        let store = MemoryLeaseStore::new();
        let lease = lease_held_by(Some("a"), 0, 15);
        assert!(store.create(&lease).await.unwrap());
        assert!(!store.create(&lease).await.unwrap());

        let current = store.get(LEASE).await.unwrap().unwrap();
        assert!(store.replace(&current).await.unwrap());
        // Same resourceVersion again is now stale
        assert!(!store.replace(&current).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lease_is_taken_over() {
        let store = Arc::new(MemoryLeaseStore::new());
        store
            .create(&lease_held_by(Some("crashed"), 120, 15))
            .await
            .unwrap();

        let elector = LeaderElector::new(store.clone(), LEASE, "fresh", fast_timing());
        assert!(elector.try_acquire_or_renew().await.unwrap());
        assert_eq!(store.holder(LEASE).as_deref(), Some("fresh"));

        let lease = store.get(LEASE).await.unwrap().unwrap();
        assert_eq!(lease.spec.unwrap().lease_transitions, Some(4));
    }

    #[tokio::test]
    async fn at_most_one_of_many_replicas_leads() {
        let store: Arc<MemoryLeaseStore> = Arc::new(MemoryLeaseStore::new());
        let electors: Vec<Arc<LeaderElector>> = (0..5)
            .map(|i| {
                Arc::new(LeaderElector::new(
                    store.clone(),
                    LEASE,
                    &format!("replica-{i}"),
                    fast_timing(),
                ))
            })
            .collect();

        let (guard_tx, mut guard_rx) = tokio::sync::mpsc::unbounded_channel();
        let tasks: Vec<_> = electors
            .iter()
            .cloned()
            .map(|e| {
                let tx = guard_tx.clone();
                tokio::spawn(async move {
                    let guard = e.acquire().await;
                    let _ = tx.send(guard);
                })
            })
            .collect();

        let first = guard_rx.recv().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(electors.iter().filter(|e| e.is_leader()).count(), 1);
        assert!(guard_rx.try_recv().is_err());
        assert_eq!(store.holder(LEASE).as_deref(), Some(first.identity()));

        // Releasing hands the lease to exactly one standby
        let previous = first.identity().to_string();
        first.release_leadership().await.unwrap();
        drop(first);

        let second = guard_rx.recv().await.unwrap();
        assert_ne!(second.identity(), previous);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(electors.iter().filter(|e| e.is_leader()).count(), 1);

        for task in tasks {
            task.abort();
        }
    }

    #[tokio::test]
    async fn losing_the_lease_signals_the_guard() {
        let store = Arc::new(MemoryLeaseStore::new());
        let elector = Arc::new(LeaderElector::new(store.clone(), LEASE, "a", fast_timing()));
        let mut guard = elector.clone().acquire().await;

        // Another replica forcibly takes the lease
        let mut lease = store.get(LEASE).await.unwrap().unwrap();
        lease.spec.as_mut().unwrap().holder_identity = Some("intruder".to_string());
        lease.spec.as_mut().unwrap().renew_time = Some(MicroTime(Utc::now()));
        assert!(store.replace(&lease).await.unwrap());

        tokio::time::timeout(Duration::from_secs(2), guard.lost())
            .await
            .expect("leadership loss should be signalled");
        assert!(!elector.is_leader());
    }
}
