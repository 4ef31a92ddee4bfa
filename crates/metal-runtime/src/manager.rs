//! The manager: owns the primary cluster, servers and runnables
//!
//! Lifecycle:
//! 1. construction binds nothing; collaborators register runnables, health
//!    checks and webhook handlers
//! 2. [`Manager::start_standby`] starts caches, the metrics server and the
//!    health server so a standby replica stays warm and probe-able
//! 3. [`Manager::run`] seals the scheme, starts the webhook server and every
//!    leader-elected runnable, and blocks until shutdown, leadership loss or a
//!    runnable failure
//! 4. shutdown drains leader runnables, then servers, then caches, all within
//!    the graceful shutdown timeout; the lease is released on graceful stop.
//!    [`Manager::draining`] flips to `true` when the drain begins, whatever
//!    caused it

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use kube::api::GroupVersionKind;
use kube::{Client, Config};
use metal_common::leader_election::LeaderGuard;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::ClusterCache;
use crate::client::DelegatingClient;
use crate::cluster::{Cluster, ClusterError};
use crate::health::{HealthCheck, HealthError, HealthRegistry, HealthServer, ProbeKind};
use crate::metrics::{ManagerMetrics, MetricsServer};
use crate::runnable::{Runnable, RunnableError, RunnableGroup};
use crate::scheme::SchemeRegistry;
use crate::webhook_server::WebhookServer;

/// Name of the primary cluster
pub const PRIMARY_CLUSTER: &str = "seed";

/// Manager errors
#[derive(Debug, Error)]
pub enum ManagerError {
    /// Primary client could not be created
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// Metrics registry could not be built
    #[error("failed to create metrics: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Health check registration failed
    #[error(transparent)]
    Health(#[from] HealthError),

    /// A runnable failed
    #[error(transparent)]
    Runnable(#[from] RunnableError),

    /// Runnables did not stop within the graceful shutdown timeout
    #[error("runnables did not stop within {timeout:?}: {pending:?}")]
    ShutdownTimeout {
        /// Configured timeout
        timeout: Duration,
        /// Runnables that were aborted
        pending: Vec<String>,
    },
}

/// Fixed settings of a manager
#[derive(Clone, Debug)]
pub struct ManagerOptions {
    /// Metrics endpoint address; `None` disables it
    pub metrics_addr: Option<SocketAddr>,
    /// Health probe address; `None` disables it
    pub health_addr: Option<SocketAddr>,
    /// Webhook server port
    pub webhook_port: u16,
    /// Directory holding `tls.crt`, `tls.key` and `ca.crt`
    pub webhook_cert_dir: PathBuf,
    /// Upper bound for stopping all runnables
    pub graceful_shutdown_timeout: Duration,
    /// Kinds whose reads always go to the API server
    pub uncached: Vec<GroupVersionKind>,
}

/// Why [`Manager::run`] returned
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// Shutdown was requested
    Shutdown,
    /// Another replica took the lease
    LeadershipLost,
}

struct RunnableExit {
    name: String,
    error: Option<RunnableError>,
}

struct RunningTask {
    name: String,
    group: RunnableGroup,
    handle: JoinHandle<()>,
}

struct GroupTokens {
    caches: CancellationToken,
    servers: CancellationToken,
    leader: CancellationToken,
}

impl GroupTokens {
    fn new() -> Self {
        Self {
            caches: CancellationToken::new(),
            servers: CancellationToken::new(),
            leader: CancellationToken::new(),
        }
    }

    fn get(&self, group: RunnableGroup) -> &CancellationToken {
        match group {
            RunnableGroup::Caches => &self.caches,
            RunnableGroup::Servers => &self.servers,
            RunnableGroup::LeaderElected => &self.leader,
        }
    }
}

/// Controller manager runtime
pub struct Manager {
    cluster: Cluster,
    options: ManagerOptions,
    health: HealthRegistry,
    metrics: ManagerMetrics,
    webhook_server: Option<WebhookServer>,
    pending: Vec<Box<dyn Runnable>>,
    running: Vec<RunningTask>,
    tokens: GroupTokens,
    exit_tx: mpsc::UnboundedSender<RunnableExit>,
    exit_rx: mpsc::UnboundedReceiver<RunnableExit>,
    draining: watch::Sender<bool>,
    standby_started: bool,
}

impl Manager {
    /// Create a manager for the cluster behind `config`
    pub fn new(
        config: Config,
        scheme: SchemeRegistry,
        options: ManagerOptions,
    ) -> Result<Self, ManagerError> {
        let cluster = Cluster::new(PRIMARY_CLUSTER, config, scheme, options.uncached.clone())?;
        Self::from_cluster(cluster, options)
    }

    /// Create a manager around an existing client
    pub fn with_client(
        client: Client,
        scheme: SchemeRegistry,
        options: ManagerOptions,
    ) -> Result<Self, ManagerError> {
        let cluster = Cluster::from_client(PRIMARY_CLUSTER, client, scheme, options.uncached.clone());
        Self::from_cluster(cluster, options)
    }

    fn from_cluster(cluster: Cluster, options: ManagerOptions) -> Result<Self, ManagerError> {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let (draining, _) = watch::channel(false);
        let webhook_server = WebhookServer::new(options.webhook_port, options.webhook_cert_dir.clone());
        let mut manager = Self {
            metrics: ManagerMetrics::new()?,
            health: HealthRegistry::new(),
            webhook_server: Some(webhook_server),
            pending: Vec::new(),
            running: Vec::new(),
            tokens: GroupTokens::new(),
            exit_tx,
            exit_rx,
            draining,
            standby_started: false,
            cluster,
            options,
        };
        let cache = manager.cluster.cache_runnable();
        manager.add(cache);
        Ok(manager)
    }

    /// Primary cluster
    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    /// Primary cluster client
    pub fn client(&self) -> &DelegatingClient {
        self.cluster.client()
    }

    /// Raw primary client for writes
    pub fn kube_client(&self) -> Client {
        self.cluster.client().kube_client()
    }

    /// Primary cluster cache
    pub fn cache(&self) -> &ClusterCache {
        self.cluster.cache()
    }

    /// Primary scheme
    pub fn scheme(&self) -> &SchemeRegistry {
        self.cluster.scheme()
    }

    /// Health registry
    pub fn health(&self) -> &HealthRegistry {
        &self.health
    }

    /// Metrics
    pub fn metrics(&self) -> &ManagerMetrics {
        &self.metrics
    }

    /// Settings this manager was built with
    pub fn options(&self) -> &ManagerOptions {
        &self.options
    }

    /// Webhook server for handler registration
    ///
    /// `None` once the server has been handed to the runnables.
    pub fn webhook_server(&mut self) -> Option<&mut WebhookServer> {
        self.webhook_server.as_mut()
    }

    /// Receiver that turns `true` when runnables start draining
    pub fn draining(&self) -> watch::Receiver<bool> {
        self.draining.subscribe()
    }

    /// Add a runnable
    ///
    /// Non-leader runnables added after standby start are started right away;
    /// leader-elected runnables wait for [`Manager::run`].
    pub fn add(&mut self, runnable: Box<dyn Runnable>) {
        debug!(runnable = runnable.name(), group = ?runnable.group(), "Adding runnable");
        if self.standby_started && !runnable.needs_leader_election() {
            self.spawn(runnable);
        } else {
            self.pending.push(runnable);
        }
    }

    /// Register a liveness check
    pub fn add_healthz_check(
        &self,
        name: &str,
        check: impl HealthCheck + 'static,
    ) -> Result<(), HealthError> {
        self.health.add(ProbeKind::Liveness, name, check)
    }

    /// Register a readiness check
    pub fn add_readyz_check(
        &self,
        name: &str,
        check: impl HealthCheck + 'static,
    ) -> Result<(), HealthError> {
        self.health.add(ProbeKind::Readiness, name, check)
    }

    /// Names of all runnables, queued or running
    pub fn runnable_names(&self) -> Vec<String> {
        self.running
            .iter()
            .map(|t| t.name.clone())
            .chain(self.pending.iter().map(|r| r.name().to_string()))
            .collect()
    }

    fn spawn(&mut self, runnable: Box<dyn Runnable>) {
        let name = runnable.name().to_string();
        let group = runnable.group();
        let token = self.tokens.get(group).clone();
        let exits = self.exit_tx.clone();
        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            let result = runnable.start(token).await;
            match &result {
                Ok(()) => debug!(runnable = %task_name, "Runnable finished"),
                Err(e) => error!(runnable = %task_name, error = %e, "Runnable failed"),
            }
            let _ = exits.send(RunnableExit {
                name: task_name,
                error: result.err(),
            });
        });
        self.running.push(RunningTask {
            name,
            group,
            handle,
        });
    }

    /// Start caches and the metrics and health servers
    ///
    /// Idempotent. Leader-elected runnables stay queued.
    pub fn start_standby(&mut self) {
        if self.standby_started {
            return;
        }
        self.standby_started = true;

        if let Some(addr) = self.options.metrics_addr {
            self.pending
                .push(Box::new(MetricsServer::new(addr, self.metrics.clone())));
        }
        if let Some(addr) = self.options.health_addr {
            self.pending
                .push(Box::new(HealthServer::new(addr, self.health.clone())));
        }

        let (standby, leader): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|r| !r.needs_leader_election());
        self.pending = leader;

        info!(count = standby.len(), "Starting standby runnables");
        for runnable in standby {
            self.spawn(runnable);
        }
    }

    /// Wait for the next failing runnable
    ///
    /// Runnables that finish without error are skipped.
    pub async fn next_failure(&mut self) -> RunnableError {
        loop {
            if let Some(exit) = self.exit_rx.recv().await {
                if let Some(error) = exit.error {
                    return error;
                }
                debug!(runnable = %exit.name, "Runnable exited");
            }
        }
    }

    /// Run until shutdown, leadership loss or a runnable failure
    ///
    /// `leader` is the held lease when leader election is enabled.
    pub async fn run(
        mut self,
        shutdown: CancellationToken,
        mut leader: Option<LeaderGuard>,
    ) -> Result<StopReason, ManagerError> {
        self.cluster.scheme().seal();
        self.health.seal();
        self.start_standby();

        if let Some(server) = self.webhook_server.take() {
            if server.paths().is_empty() {
                server.latch_idle();
                debug!("No webhook handlers registered, webhook server not started");
            } else {
                self.spawn(Box::new(server));
            }
        }

        let leader_runnables = std::mem::take(&mut self.pending);
        info!(count = leader_runnables.len(), "Starting leader election runnables");
        for runnable in leader_runnables {
            self.spawn(runnable);
        }
        if leader.is_some() {
            self.metrics.leader.set(1);
        }

        let outcome: Result<StopReason, RunnableError> = {
            let leadership_lost = async {
                match leader.as_mut() {
                    Some(guard) => guard.lost().await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::pin!(leadership_lost);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Shutdown requested");
                        break Ok(StopReason::Shutdown);
                    }
                    _ = &mut leadership_lost => {
                        warn!("Leadership lost, stopping");
                        break Ok(StopReason::LeadershipLost);
                    }
                    Some(exit) = self.exit_rx.recv() => {
                        match exit.error {
                            Some(e) => break Err(e),
                            None => debug!(runnable = %exit.name, "Runnable exited"),
                        }
                    }
                }
            }
        };

        self.metrics.leader.set(0);
        let drained = self.drain().await;

        if let (Some(guard), Ok(StopReason::Shutdown)) = (leader.as_ref(), &outcome) {
            if let Err(e) = guard.release_leadership().await {
                warn!(error = %e, "Failed to release leader lease");
            }
        }

        let reason = outcome?;
        drained?;
        info!(reason = ?reason, "Manager stopped");
        Ok(reason)
    }

    /// Stop everything started so far, in drain order
    pub async fn shutdown(mut self) -> Result<(), ManagerError> {
        self.drain().await
    }

    async fn drain(&mut self) -> Result<(), ManagerError> {
        self.draining.send_replace(true);
        let timeout = self.options.graceful_shutdown_timeout;
        let deadline = Instant::now() + timeout;
        let mut aborted = Vec::new();

        for group in [
            RunnableGroup::LeaderElected,
            RunnableGroup::Servers,
            RunnableGroup::Caches,
        ] {
            self.tokens.get(group).cancel();
            let (stopping, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.running)
                .into_iter()
                .partition(|t| t.group == group);
            self.running = rest;

            debug!(group = ?group, count = stopping.len(), "Stopping runnables");
            for mut task in stopping {
                if tokio::time::timeout_at(deadline, &mut task.handle).await.is_err() {
                    warn!(runnable = %task.name, "Runnable did not stop in time, aborting");
                    task.handle.abort();
                    aborted.push(task.name);
                }
            }
        }

        if aborted.is_empty() {
            Ok(())
        } else {
            Err(ManagerError::ShutdownTimeout {
                timeout,
                pending: aborted,
            })
        }
    }
}
