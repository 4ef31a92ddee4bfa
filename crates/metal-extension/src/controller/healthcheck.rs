//! Health check controller
//!
//! Periodically derives an `ExtensionHealthy` condition for every Worker of
//! this provider from its last operation and writes it to the Worker status.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::StreamExt;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Client, ResourceExt};
use metal_common::apis::config::HealthCheckConfig;
use metal_common::crd::{
    Condition, ConditionStatus, Extension, ExtensionStatus, LastOperationState, Worker,
};
use metal_common::PROVIDER_TYPE;
use metal_runtime::{runnable_fn, until_cancelled, Manager, ManagerMetrics, RunnableGroup};
use serde_json::json;
use tracing::{debug, warn};

use super::{log_reconcile_result, ControllerAdder, ControllerConfig, ControllerEntry, WATCH_TIMEOUT_SECS};
use crate::error::{ReconcileError, RegistrationError};

/// Controller name
pub const NAME: &str = "healthcheck";

/// Condition type written by this controller
pub const CONDITION_TYPE: &str = "ExtensionHealthy";

/// Configuration surface of the health check controller
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AddOptions {
    /// Runtime settings
    pub controller: ControllerConfig,
    /// Check interval
    pub health_check_config: HealthCheckConfig,
}

struct HealthContext {
    client: Client,
    sync_period: Duration,
    metrics: ManagerMetrics,
}

/// Condition describing the health of an extension resource
///
/// The transition time is kept from `previous` while the status is unchanged.
pub fn health_condition(status: Option<&ExtensionStatus>, previous: Option<&Condition>) -> Condition {
    let now = Utc::now().to_rfc3339();
    let (state, reason, message) = match status.and_then(|s| s.last_operation.as_ref()) {
        None => (
            ConditionStatus::Unknown,
            "NotReconciled",
            "resource has not been reconciled yet".to_string(),
        ),
        Some(op) => match op.state {
            LastOperationState::Succeeded => (
                ConditionStatus::True,
                "LastOperationSucceeded",
                "last operation succeeded".to_string(),
            ),
            LastOperationState::Processing | LastOperationState::Pending => (
                ConditionStatus::Progressing,
                "LastOperationProcessing",
                op.description.clone(),
            ),
            _ => (
                ConditionStatus::False,
                "LastOperationFailed",
                op.description.clone(),
            ),
        },
    };

    let last_transition_time = match previous {
        Some(prev) if prev.status == state => prev.last_transition_time.clone(),
        _ => Some(now.clone()),
    };

    Condition {
        condition_type: CONDITION_TYPE.to_string(),
        status: state,
        reason: reason.to_string(),
        message,
        last_transition_time,
        last_update_time: Some(now),
    }
}

/// Replace the condition of the same type, keeping all others
pub fn merge_condition(existing: &[Condition], condition: Condition) -> Vec<Condition> {
    let mut merged: Vec<Condition> = existing
        .iter()
        .filter(|c| c.condition_type != condition.condition_type)
        .cloned()
        .collect();
    merged.push(condition);
    merged
}

async fn reconcile(worker: Arc<Worker>, ctx: Arc<HealthContext>) -> Result<Action, ReconcileError> {
    if worker.extension_type() != PROVIDER_TYPE || worker.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }
    let started = Instant::now();
    let namespace = worker
        .namespace()
        .ok_or(ReconcileError::MissingMetadata("namespace"))?;
    let name = worker.name_any();

    let status = worker.extension_status();
    let existing = status.map(|s| s.conditions.as_slice()).unwrap_or_default();
    let previous = status.and_then(|s| s.condition(CONDITION_TYPE));
    let condition = health_condition(status, previous);
    debug!(%namespace, %name, status = ?condition.status, "Health checked");

    let patch = json!({ "status": { "conditions": merge_condition(existing, condition) } });
    let api: Api<Worker> = Api::namespaced(ctx.client.clone(), &namespace);
    let result = api
        .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await;
    ctx.metrics
        .observe_reconcile(NAME, result.is_ok(), started.elapsed());
    result?;

    Ok(Action::requeue(ctx.sync_period))
}

fn error_policy(worker: Arc<Worker>, error: &ReconcileError, ctx: Arc<HealthContext>) -> Action {
    warn!(name = %worker.name_any(), error = %error, "Health check failed, will retry");
    Action::requeue(ctx.sync_period)
}

/// Adds the health check controller
pub struct HealthCheckAdder {
    options: AddOptions,
}

impl HealthCheckAdder {
    /// Adder with the given options
    pub fn new(options: AddOptions) -> Self {
        Self { options }
    }
}

impl ControllerAdder for HealthCheckAdder {
    fn name(&self) -> &'static str {
        NAME
    }

    fn entry(&self) -> ControllerEntry {
        ControllerEntry {
            name: NAME.to_string(),
            enabled: true,
            max_concurrent_reconciles: self.options.controller.max_concurrent_reconciles,
            ignore_operation_annotation: true,
        }
    }

    fn add_to_manager(&self, mgr: &mut Manager) -> Result<(), RegistrationError> {
        let client = mgr.kube_client();
        let controller = Controller::new(
            Api::<Worker>::all(client.clone()),
            WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
        )
        .with_config(self.options.controller.runtime_config());
        mgr.cache().track_store(NAME, controller.store());

        let ctx = Arc::new(HealthContext {
            client,
            sync_period: self.options.health_check_config.sync_period,
            metrics: mgr.metrics().clone(),
        });
        mgr.add(runnable_fn(NAME, RunnableGroup::LeaderElected, move |shutdown| async move {
            let run = controller
                .run(reconcile, error_policy, ctx)
                .for_each(log_reconcile_result(NAME));
            until_cancelled(NAME, shutdown, run).await?;
            debug!(controller = NAME, "Controller stopped");
            Ok(())
        }));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::extension::tests::echo_client;
    use metal_common::crd::{LastOperation, LastOperationType, WorkerSpec};

    fn status(state: LastOperationState) -> ExtensionStatus {
        ExtensionStatus {
            last_operation: Some(LastOperation {
                operation_type: LastOperationType::Reconcile,
                state,
                progress: 100,
                description: "reconcile failed: quota".to_string(),
                last_update_time: None,
            }),
            ..Default::default()
        }
    }

    #[test]
    fn condition_reflects_last_operation() {
        assert_eq!(health_condition(None, None).status, ConditionStatus::Unknown);
        assert_eq!(
            health_condition(Some(&status(LastOperationState::Succeeded)), None).status,
            ConditionStatus::True
        );
        let failed = health_condition(Some(&status(LastOperationState::Error)), None);
        assert_eq!(failed.status, ConditionStatus::False);
        assert!(failed.message.contains("quota"));
    }

    #[test]
    fn transition_time_kept_while_status_unchanged() {
        let mut previous = health_condition(Some(&status(LastOperationState::Succeeded)), None);
        previous.last_transition_time = Some("2024-01-01T00:00:00+00:00".to_string());

        let same = health_condition(Some(&status(LastOperationState::Succeeded)), Some(&previous));
        assert_eq!(same.last_transition_time, previous.last_transition_time);

        let changed = health_condition(Some(&status(LastOperationState::Error)), Some(&previous));
        assert_ne!(changed.last_transition_time, previous.last_transition_time);
    }

    #[test]
    fn merge_replaces_only_own_condition() {
        let other = Condition {
            condition_type: "EveryNodeReady".to_string(),
            ..health_condition(None, None)
        };
        let old = health_condition(None, None);
        let new = health_condition(Some(&status(LastOperationState::Succeeded)), None);

        let merged = merge_condition(&[other.clone(), old], new.clone());
        assert_eq!(merged, vec![other, new]);
    }

    #[tokio::test]
    async fn reconcile_requeues_after_sync_period() {
        let mut worker = Worker::new(
            "worker",
            WorkerSpec {
                extension_type: PROVIDER_TYPE.to_string(),
                provider_config: None,
                region: "eu-west".to_string(),
                secret_ref: Default::default(),
                infrastructure_provider_status: None,
                pools: vec![],
            },
        );
        worker.metadata.namespace = Some("shoot--dev--a".to_string());
        let (client, requests) = echo_client(&worker);
        let ctx = Arc::new(HealthContext {
            client,
            sync_period: Duration::from_secs(30),
            metrics: ManagerMetrics::new().unwrap(),
        });

        let action = reconcile(Arc::new(worker), ctx).await.unwrap();

        assert_eq!(action, Action::requeue(Duration::from_secs(30)));
        assert_eq!(requests.lock().len(), 1);
    }
}
