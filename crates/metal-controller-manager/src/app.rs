//! Lifecycle of the controller manager process
//!
//! [`LifecycleRunner::run`] walks a fixed sequence of states, each of which
//! either succeeds or aborts startup with a [`StartupError`] naming the step:
//!
//! 1. `Configuring` - complete every option group, validate heartbeat options
//! 2. `Bootstrapping` - seed client config, scheme and manager
//! 3. `AttachingRemote` - garden cluster behind the restricted kubeconfig
//! 4. `AwaitingLeadership` - standby runnables live, lease contended
//! 5. `RegisteringControllers`, `RegisteringWebhooks`, `RegisteringHealth`
//! 6. `Running` until shutdown, leadership loss or a runnable failure
//! 7. `Stopping` while runnables drain, whatever ended `Running`, then `Stopped`
//!
//! The current state is published on a watch channel.

use std::path::Path;
use std::sync::Arc;

use kube::api::GroupVersionKind;
use kube::Config;
use metal_common::apis::config::{ClientConnection, ControllerConfiguration, HealthCheckConfig};
use metal_common::kubeconfig::{self, AuthAllowList};
use metal_common::leader_election::{ElectionTiming, LeaderElector, LeaderGuard};
use metal_extension::controller::{controlplane, healthcheck, heartbeat, infrastructure, worker};
use metal_extension::controller::controlplane::ControlPlaneAdder;
use metal_extension::controller::healthcheck::HealthCheckAdder;
use metal_extension::controller::heartbeat::HeartbeatAdder;
use metal_extension::controller::infrastructure::InfrastructureAdder;
use metal_extension::controller::worker::WorkerAdder;
use metal_extension::scheme::{garden_scheme, seed_scheme};
use metal_extension::webhook::cloudprovider::CloudProviderAdder;
use metal_extension::{ControllerConfig, ControllerSwitches, RegistrationError, WebhookNamespace, WebhookSwitches};
use metal_runtime::health::{self, CacheSyncCheck};
use metal_runtime::{
    Cluster, ClusterError, HealthError, Manager, ManagerError, RunnableError, SchemeError, StopReason,
};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::options::controller::CompletedHeartbeatOptions;
use crate::options::manager::{CompletedManagerOptions, CompletedRestOptions};
use crate::options::{ExtensionOptions, OptionsError};

/// Name of the garden cluster
pub const GARDEN_CLUSTER: &str = "garden";

/// Where the process is in its lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    /// Completing and validating options
    Configuring,
    /// Building the seed client and manager
    Bootstrapping,
    /// Connecting to the garden cluster
    AttachingRemote,
    /// Standing by for the leader lease
    AwaitingLeadership,
    /// Adding enabled controllers
    RegisteringControllers,
    /// Adding enabled webhooks
    RegisteringWebhooks,
    /// Adding and sealing health checks
    RegisteringHealth,
    /// Leading and serving
    Running,
    /// Draining runnables
    Stopping,
    /// Everything stopped
    Stopped,
}

/// Failure inside one startup step
#[derive(Debug, Error)]
pub enum StepError {
    /// Completed options were missing
    #[error(transparent)]
    Options(#[from] OptionsError),

    /// Kubeconfig or configuration problem
    #[error(transparent)]
    Config(#[from] metal_common::Error),

    /// Scheme composition failed
    #[error(transparent)]
    Scheme(#[from] SchemeError),

    /// A cluster client could not be created
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// The manager could not be created
    #[error(transparent)]
    Manager(#[from] ManagerError),

    /// A controller or webhook could not be registered
    #[error(transparent)]
    Registration(#[from] RegistrationError),

    /// A health check could not be registered
    #[error(transparent)]
    Health(#[from] HealthError),

    /// A standby runnable failed before leadership was acquired
    #[error(transparent)]
    Runnable(#[from] RunnableError),
}

/// Why the process could not start or keep running
#[derive(Debug, Error)]
pub enum StartupError {
    /// Options did not complete or validate
    #[error("configuration failed: {0}")]
    Configuration(#[source] OptionsError),

    /// Seed client or manager could not be built
    #[error("bootstrap failed: {0}")]
    Bootstrap(#[source] StepError),

    /// Garden cluster could not be attached
    #[error("garden cluster attachment failed: {0}")]
    RemoteAttachment(#[source] StepError),

    /// Leader election, controllers, webhooks or health checks failed
    #[error("registration failed: {0}")]
    Registration(#[source] StepError),

    /// The running manager failed
    #[error("manager failed: {0}")]
    Run(#[source] ManagerError),
}

/// Identity written into the leader lease: `<hostname>_<uuid>`
pub fn identity() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown".to_string());
    format!("{host}_{}", Uuid::new_v4())
}

fn secret_gvk() -> GroupVersionKind {
    GroupVersionKind::gvk("", "v1", "Secret")
}

/// Log the client connection settings of the configuration file
///
/// kube-rs has no client-side rate limiter or content negotiation knobs, so
/// these values are validated by the configuration loader and reported only.
fn report_client_connection(config: &Config, connection: Option<&ClientConnection>) {
    let Some(connection) = connection else {
        return;
    };
    info!(
        cluster_url = %config.cluster_url,
        qps = connection.qps,
        burst = connection.burst,
        content_type = %connection.content_type,
        accept_content_types = %connection.accept_content_types,
        "Client connection settings are not enforced by the kube client"
    );
    if !connection.kubeconfig.is_empty() {
        warn!(kubeconfig = %connection.kubeconfig, "clientConnection.kubeconfig is ignored, use --kubeconfig");
    }
}

async fn bootstrap(
    rest: &CompletedRestOptions,
    manager: &CompletedManagerOptions,
    config: &ControllerConfiguration,
) -> Result<Manager, StepError> {
    let mut client_config = kubeconfig::load_primary(rest.kubeconfig.as_deref()).await?;
    if let Some(master) = &rest.master {
        debug!(master = %master, "Overriding API server URL");
        client_config.cluster_url = master.clone();
    }
    report_client_connection(&client_config, config.client_connection.as_ref());

    let scheme = seed_scheme()?;
    let mgr = Manager::new(client_config, scheme, manager.manager_options(vec![secret_gvk()]))?;
    info!(
        metrics = ?manager.metrics_addr,
        health = ?manager.health_addr,
        webhook_port = manager.webhook_port,
        "Manager created"
    );
    Ok(mgr)
}

async fn attach_garden(mgr: &mut Manager, garden_kubeconfig: &Path) -> Result<Cluster, StepError> {
    let config = kubeconfig::load_restricted(garden_kubeconfig, AuthAllowList::with_token_file()).await?;
    let garden = Cluster::new(GARDEN_CLUSTER, config, garden_scheme()?, [])?;
    mgr.add(garden.cache_runnable());
    info!(kubeconfig = %garden_kubeconfig.display(), "Garden cluster attached");
    Ok(garden)
}

fn controller_config(options: &crate::options::ControllerOptions) -> Result<ControllerConfig, OptionsError> {
    let mut config = ControllerConfig::default();
    options.completed()?.apply(&mut config);
    Ok(config)
}

fn controller_switches(
    options: &ExtensionOptions,
    heartbeat_options: &CompletedHeartbeatOptions,
    garden: Cluster,
    webhook_namespace: WebhookNamespace,
) -> Result<ControllerSwitches, OptionsError> {
    let reconciler = options.reconciler.completed()?;

    let mut infrastructure = infrastructure::AddOptions {
        controller: controller_config(&options.infrastructure)?,
        ..Default::default()
    };
    reconciler.apply(&mut infrastructure.ignore_operation_annotation);

    let mut worker = worker::AddOptions {
        controller: controller_config(&options.worker)?,
        ..Default::default()
    };
    reconciler.apply(&mut worker.ignore_operation_annotation);

    let controlplane = controlplane::AddOptions {
        controller: controller_config(&options.controlplane)?,
    };

    let mut health_check_config = HealthCheckConfig::default();
    options
        .config
        .completed()?
        .apply_health_check_config(&mut health_check_config);
    let healthcheck = healthcheck::AddOptions {
        controller: controller_config(&options.healthcheck)?,
        health_check_config,
    };

    let mut heartbeat = heartbeat::AddOptions::default();
    heartbeat_options.apply(&mut heartbeat);

    Ok(ControllerSwitches::new()
        .with(InfrastructureAdder::new(infrastructure))
        .with(WorkerAdder::new(worker, garden))
        .with(ControlPlaneAdder::new(controlplane, webhook_namespace))
        .with(HealthCheckAdder::new(healthcheck))
        .with(HeartbeatAdder::new(heartbeat)))
}

fn register_health(mgr: &mut Manager, garden: &Cluster) -> Result<(), HealthError> {
    mgr.add_healthz_check("ping", health::ping())?;
    let caches = vec![mgr.cache().clone(), garden.cache().clone()];
    mgr.add_readyz_check("informer-sync", CacheSyncCheck::new(caches))?;
    if let Some(webhook_started) = mgr.webhook_server().map(|server| server.started_checker()) {
        mgr.add_readyz_check("webhook-server", webhook_started)?;
    }
    mgr.health().seal();
    Ok(())
}

enum LeadershipWait {
    Acquired(LeaderGuard),
    Shutdown,
    Failed(RunnableError),
}

/// Drives the process through its lifecycle states
pub struct LifecycleRunner {
    state: watch::Sender<LifecycleState>,
}

impl LifecycleRunner {
    /// Runner in `Configuring` and a receiver observing its state
    pub fn new() -> (Self, watch::Receiver<LifecycleState>) {
        let (state, rx) = watch::channel(LifecycleState::Configuring);
        (Self { state }, rx)
    }

    /// Current state
    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    fn enter(&self, state: LifecycleState) {
        info!(state = ?state, "Entering lifecycle state");
        self.state.send_replace(state);
    }

    async fn abort<T>(&self, mgr: Manager, err: StartupError) -> Result<T, StartupError> {
        error!(state = ?self.state(), error = %err, "Startup failed");
        if let Err(e) = mgr.shutdown().await {
            warn!(error = %e, "Manager did not stop cleanly after startup failure");
        }
        Err(err)
    }

    /// Start everything and run until shutdown
    ///
    /// Returns once all runnables are stopped. Errors before `Running` leave
    /// the published state at the failing step.
    pub async fn run(
        &self,
        mut options: ExtensionOptions,
        shutdown: CancellationToken,
    ) -> Result<StopReason, StartupError> {
        self.enter(LifecycleState::Configuring);
        options.complete().map_err(StartupError::Configuration)?;
        let heartbeat = options
            .heartbeat
            .completed()
            .map_err(StartupError::Configuration)?
            .clone();
        heartbeat
            .validate()
            .map_err(|e| StartupError::Configuration(OptionsError::group("heartbeat", e)))?;
        let general = options.general.completed().map_err(StartupError::Configuration)?.clone();
        let rest = options.rest.completed().map_err(StartupError::Configuration)?.clone();
        let manager = options.manager.completed().map_err(StartupError::Configuration)?.clone();
        let config = options.config.completed().map_err(StartupError::Configuration)?.clone();
        if let Some(version) = &general.gardener_version {
            info!(gardener_version = %version, "Gardener version");
        }

        self.enter(LifecycleState::Bootstrapping);
        let mut mgr = bootstrap(&rest, &manager, &config.config)
            .await
            .map_err(StartupError::Bootstrap)?;

        self.enter(LifecycleState::AttachingRemote);
        let garden = match attach_garden(&mut mgr, &general.garden_kubeconfig).await {
            Ok(garden) => garden,
            Err(e) => return self.abort(mgr, StartupError::RemoteAttachment(e)).await,
        };

        mgr.start_standby();
        let leader = if manager.leader_election {
            self.enter(LifecycleState::AwaitingLeadership);
            let elector = Arc::new(LeaderElector::for_cluster(
                mgr.kube_client(),
                &manager.leader_election_namespace,
                &manager.leader_election_id,
                &identity(),
                ElectionTiming::default(),
            ));
            let wait = tokio::select! {
                guard = Arc::clone(&elector).acquire() => LeadershipWait::Acquired(guard),
                _ = shutdown.cancelled() => LeadershipWait::Shutdown,
                failure = mgr.next_failure() => LeadershipWait::Failed(failure),
            };
            match wait {
                LeadershipWait::Acquired(guard) => Some(guard),
                LeadershipWait::Shutdown => {
                    info!("Shutdown requested while awaiting leadership");
                    self.enter(LifecycleState::Stopping);
                    mgr.shutdown().await.map_err(StartupError::Run)?;
                    self.enter(LifecycleState::Stopped);
                    return Ok(StopReason::Shutdown);
                }
                LeadershipWait::Failed(e) => {
                    return self.abort(mgr, StartupError::Registration(e.into())).await;
                }
            }
        } else {
            None
        };

        self.enter(LifecycleState::RegisteringControllers);
        let webhook_namespace = WebhookNamespace::default();
        let registered = controller_switches(&options, &heartbeat, garden.clone(), webhook_namespace.clone())
            .map_err(StepError::from)
            .and_then(|switches| {
                let disabled = &options.controller_switches.completed()?.disabled;
                Ok(switches.add_to_manager(&mut mgr, disabled)?)
            });
        match registered {
            Ok(entries) => {
                let enabled: Vec<_> = entries.iter().filter(|e| e.enabled).map(|e| e.name.as_str()).collect();
                info!(controllers = ?enabled, "Controllers registered");
            }
            Err(e) => return self.abort(mgr, StartupError::Registration(e)).await,
        }

        self.enter(LifecycleState::RegisteringWebhooks);
        let switches = WebhookSwitches::new().with(CloudProviderAdder::default());
        let registered = options
            .webhook
            .completed()
            .map_err(StepError::from)
            .and_then(|webhook| Ok(webhook.add_to_manager(&mut mgr, &switches, &webhook_namespace)?));
        match registered {
            Ok(webhooks) => {
                let names: Vec<_> = webhooks.iter().map(|w| w.name).collect();
                info!(webhooks = ?names, "Webhooks registered");
            }
            Err(e) => return self.abort(mgr, StartupError::Registration(e)).await,
        }

        self.enter(LifecycleState::RegisteringHealth);
        if let Err(e) = register_health(&mut mgr, &garden) {
            return self.abort(mgr, StartupError::Registration(e.into())).await;
        }

        self.run_manager(mgr, shutdown, leader).await
    }

    /// `Running` until the manager drains, then `Stopping` and `Stopped`
    ///
    /// The drain starts on shutdown, leadership loss or a runnable failure.
    async fn run_manager(
        &self,
        mgr: Manager,
        shutdown: CancellationToken,
        leader: Option<LeaderGuard>,
    ) -> Result<StopReason, StartupError> {
        self.enter(LifecycleState::Running);
        let mut draining = mgr.draining();
        let run = mgr.run(shutdown, leader);
        tokio::pin!(run);
        let result = tokio::select! {
            result = &mut run => {
                self.enter(LifecycleState::Stopping);
                result
            }
            _ = async { draining.wait_for(|draining| *draining).await.is_ok() } => {
                self.enter(LifecycleState::Stopping);
                run.await
            }
        };
        self.enter(LifecycleState::Stopped);
        result.map_err(StartupError::Run)
    }
}
