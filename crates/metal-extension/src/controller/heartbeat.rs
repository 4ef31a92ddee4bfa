//! Heartbeat controller
//!
//! Renews a Lease named `gardener-extension-heartbeat` so Gardener can tell
//! that the extension is alive. Runs on the leader only.

use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use metal_common::{FIELD_MANAGER, PROVIDER_NAME};
use metal_runtime::{runnable_fn, Manager, ManagerMetrics, RunnableGroup};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ControllerAdder, ControllerEntry};
use crate::error::RegistrationError;

/// Controller name
pub const NAME: &str = "heartbeat";

/// Name of the heartbeat Lease
pub const LEASE_NAME: &str = "gardener-extension-heartbeat";

/// Default seconds between renewals
pub const DEFAULT_RENEW_INTERVAL_SECONDS: i32 = 30;

/// Configuration surface of the heartbeat controller
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddOptions {
    /// Extension name written as the lease holder
    pub extension_name: String,
    /// Namespace of the lease
    pub namespace: String,
    /// Seconds between renewals
    pub renew_interval_seconds: i32,
}

impl Default for AddOptions {
    fn default() -> Self {
        Self {
            extension_name: PROVIDER_NAME.to_string(),
            namespace: String::new(),
            renew_interval_seconds: DEFAULT_RENEW_INTERVAL_SECONDS,
        }
    }
}

impl AddOptions {
    fn renew_interval(&self) -> Duration {
        Duration::from_secs(u64::try_from(self.renew_interval_seconds).unwrap_or(1).max(1))
    }
}

/// Lease as written by one renewal
pub fn heartbeat_lease(options: &AddOptions) -> Lease {
    Lease {
        metadata: ObjectMeta {
            name: Some(LEASE_NAME.to_string()),
            namespace: Some(options.namespace.clone()),
            ..Default::default()
        },
        spec: Some(LeaseSpec {
            holder_identity: Some(options.extension_name.clone()),
            lease_duration_seconds: Some(options.renew_interval_seconds),
            renew_time: Some(MicroTime(Utc::now())),
            ..Default::default()
        }),
    }
}

async fn renew(api: &Api<Lease>, options: &AddOptions) -> Result<(), kube::Error> {
    let lease = heartbeat_lease(options);
    api.patch(
        LEASE_NAME,
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Apply(&lease),
    )
    .await?;
    Ok(())
}

/// Renew the heartbeat lease until `shutdown` fires
///
/// Failed renewals are logged and retried on the next tick.
pub async fn run_heartbeat(
    client: Client,
    options: AddOptions,
    metrics: ManagerMetrics,
    shutdown: CancellationToken,
) {
    let api: Api<Lease> = Api::namespaced(client, &options.namespace);
    let mut ticker = tokio::time::interval(options.renew_interval());
    info!(
        namespace = %options.namespace,
        interval_seconds = options.renew_interval_seconds,
        "Heartbeat started"
    );

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => match renew(&api, &options).await {
                Ok(()) => {
                    metrics.heartbeat_renewals_total.inc();
                    debug!(namespace = %options.namespace, "Heartbeat renewed");
                }
                Err(e) => warn!(namespace = %options.namespace, error = %e, "Heartbeat renewal failed"),
            },
        }
    }
    debug!("Heartbeat stopped");
}

/// Adds the heartbeat runnable
pub struct HeartbeatAdder {
    options: AddOptions,
}

impl HeartbeatAdder {
    /// Adder with validated options
    pub fn new(options: AddOptions) -> Self {
        Self { options }
    }
}

impl ControllerAdder for HeartbeatAdder {
    fn name(&self) -> &'static str {
        NAME
    }

    fn entry(&self) -> ControllerEntry {
        ControllerEntry {
            name: NAME.to_string(),
            enabled: true,
            max_concurrent_reconciles: 1,
            ignore_operation_annotation: false,
        }
    }

    fn add_to_manager(&self, mgr: &mut Manager) -> Result<(), RegistrationError> {
        if self.options.namespace.is_empty() {
            return Err(RegistrationError::Controller {
                controller: NAME.to_string(),
                message: "heartbeat namespace must not be empty".to_string(),
            });
        }
        let client = mgr.kube_client();
        let metrics = mgr.metrics().clone();
        let options = self.options.clone();
        mgr.add(runnable_fn(NAME, RunnableGroup::LeaderElected, move |shutdown| async move {
            run_heartbeat(client, options, metrics, shutdown).await;
            Ok(())
        }));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::extension::tests::echo_client;
    use crate::controller::tests::test_manager;

    fn options() -> AddOptions {
        AddOptions {
            namespace: "garden".to_string(),
            renew_interval_seconds: 1,
            ..Default::default()
        }
    }

    #[test]
    fn lease_names_extension_as_holder() {
        let lease = heartbeat_lease(&options());
        let spec = lease.spec.unwrap();
        assert_eq!(lease.metadata.name.as_deref(), Some(LEASE_NAME));
        assert_eq!(spec.holder_identity.as_deref(), Some(PROVIDER_NAME));
        assert_eq!(spec.lease_duration_seconds, Some(1));
        assert!(spec.renew_time.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn renews_on_every_tick_until_cancelled() {
        let (client, requests) = echo_client(&heartbeat_lease(&options()));
        let metrics = ManagerMetrics::new().unwrap();
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(run_heartbeat(client, options(), metrics.clone(), shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        shutdown.cancel();
        task.await.unwrap();

        // Immediate first tick plus one after a second
        assert_eq!(metrics.heartbeat_renewals_total.get(), 2);
        assert!(requests
            .lock()
            .iter()
            .all(|r| r == "PATCH /apis/coordination.k8s.io/v1/namespaces/garden/leases/gardener-extension-heartbeat"));
    }

    #[tokio::test]
    async fn empty_namespace_is_rejected_at_registration() {
        let mut mgr = test_manager();
        let adder = HeartbeatAdder::new(AddOptions::default());
        assert!(matches!(
            adder.add_to_manager(&mut mgr),
            Err(RegistrationError::Controller { .. })
        ));
    }
}
