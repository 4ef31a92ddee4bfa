//! Reconciler shared by the Infrastructure, Worker and ControlPlane controllers
//!
//! The reconciler owns everything generic about an extension resource: type
//! filtering, operation-annotation gating, the finalizer, `lastOperation` /
//! `lastError` bookkeeping and annotation cleanup. Provider-specific work is
//! delegated to an [`Actuator`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Client, Resource, ResourceExt};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use metal_common::crd::{Extension, LastOperation, LastOperationState, LastOperationType};
use metal_common::{OPERATION_ANNOTATION, OPERATION_MIGRATE, OPERATION_RESTORE, PROVIDER_TYPE};
use metal_runtime::{runnable_fn, until_cancelled, Manager, ManagerMetrics, RunnableGroup};

use super::{log_reconcile_result, ControllerConfig, WATCH_TIMEOUT_SECS};
use crate::error::ReconcileError;

/// Delay before a failed reconciliation is retried
pub const RETRY_INTERVAL: Duration = Duration::from_secs(15);

/// Provider-specific behaviour behind an extension controller
#[async_trait]
pub trait Actuator<K>: Send + Sync {
    /// Bring the provider side in line with `obj`; returns the provider status
    async fn reconcile(&self, obj: &K) -> Result<Option<Value>, ReconcileError>;

    /// Remove everything created for `obj`
    async fn delete(&self, obj: &K) -> Result<(), ReconcileError>;

    /// Hand `obj` over to another seed without deleting provider resources
    async fn migrate(&self, _obj: &K) -> Result<(), ReconcileError> {
        Ok(())
    }
}

/// Shared state of one extension controller
pub struct ExtensionContext<K> {
    controller: &'static str,
    client: Client,
    actuator: Arc<dyn Actuator<K>>,
    ignore_operation_annotation: bool,
    metrics: ManagerMetrics,
}

impl<K> ExtensionContext<K> {
    /// Create a context
    pub fn new(
        controller: &'static str,
        client: Client,
        actuator: Arc<dyn Actuator<K>>,
        ignore_operation_annotation: bool,
        metrics: ManagerMetrics,
    ) -> Self {
        Self {
            controller,
            client,
            actuator,
            ignore_operation_annotation,
            metrics,
        }
    }
}

/// Finalizer guarding provider resources of kind `K`
pub fn finalizer_name<K: Resource<DynamicType = ()>>() -> String {
    format!("extensions.gardener.cloud/{}", K::kind(&()).to_lowercase())
}

fn operation_annotation<K: Extension>(obj: &K) -> Option<&str> {
    obj.annotations().get(OPERATION_ANNOTATION).map(String::as_str)
}

/// Whether `obj` needs work from this extension
///
/// Objects of other providers are never handled. Deletions always are. With
/// `ignore_operation_annotation` every change is handled; otherwise only
/// objects carrying the operation annotation or whose last operation did not
/// succeed.
pub fn should_reconcile<K: Extension>(obj: &K, ignore_operation_annotation: bool) -> bool {
    if obj.extension_type() != PROVIDER_TYPE {
        return false;
    }
    if obj.meta().deletion_timestamp.is_some() || ignore_operation_annotation {
        return true;
    }
    let succeeded = obj
        .extension_status()
        .is_some_and(|s| s.last_operation_succeeded());
    operation_annotation(obj).is_some() || !succeeded
}

/// Operation the next reconciliation performs
pub fn operation_type<K: Extension>(obj: &K) -> LastOperationType {
    if obj.meta().deletion_timestamp.is_some() {
        return LastOperationType::Delete;
    }
    match operation_annotation(obj) {
        Some(OPERATION_MIGRATE) => return LastOperationType::Migrate,
        Some(OPERATION_RESTORE) => return LastOperationType::Restore,
        _ => {}
    }
    match obj.extension_status().and_then(|s| s.last_operation.as_ref()) {
        None => LastOperationType::Create,
        Some(op)
            if op.operation_type == LastOperationType::Create
                && op.state != LastOperationState::Succeeded =>
        {
            LastOperationType::Create
        }
        Some(_) => LastOperationType::Reconcile,
    }
}

fn last_operation(
    operation_type: LastOperationType,
    state: LastOperationState,
    description: String,
) -> LastOperation {
    let progress = match state {
        LastOperationState::Succeeded => 100,
        LastOperationState::Processing => 1,
        _ => 50,
    };
    LastOperation {
        operation_type,
        state,
        progress,
        description,
        last_update_time: Some(Utc::now().to_rfc3339()),
    }
}

/// Status patch marking the start of an operation
pub(crate) fn processing_status(kind: &str, op: LastOperationType) -> Value {
    let description = format!("{op:?} of the {kind} in progress");
    json!({
        "status": {
            "lastOperation": last_operation(op, LastOperationState::Processing, description),
        }
    })
}

/// Status patch recording a successful operation
pub(crate) fn succeeded_status(
    kind: &str,
    op: LastOperationType,
    generation: Option<i64>,
    provider_status: Option<Value>,
) -> Value {
    let description = format!("{op:?} of the {kind} succeeded");
    let mut status = json!({
        "lastOperation": last_operation(op, LastOperationState::Succeeded, description),
        "lastError": null,
        "observedGeneration": generation,
    });
    if let Some(provider_status) = provider_status {
        status["providerStatus"] = provider_status;
    }
    json!({ "status": status })
}

/// Status patch recording a failed operation
pub(crate) fn error_status(kind: &str, op: LastOperationType, error: &ReconcileError) -> Value {
    let description = format!("{op:?} of the {kind} failed: {error}");
    json!({
        "status": {
            "lastOperation": last_operation(op, LastOperationState::Error, description.clone()),
            "lastError": {
                "description": description,
                "lastUpdateTime": Utc::now().to_rfc3339(),
            },
        }
    })
}

async fn patch_status<K: Extension>(api: &Api<K>, name: &str, status: Value) -> Result<(), ReconcileError> {
    api.patch_status(name, &PatchParams::default(), &Patch::Merge(&status))
        .await?;
    Ok(())
}

async fn set_finalizers<K: Extension>(
    api: &Api<K>,
    name: &str,
    finalizers: Vec<String>,
) -> Result<(), ReconcileError> {
    let patch = json!({ "metadata": { "finalizers": finalizers } });
    api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

async fn remove_operation_annotation<K: Extension>(api: &Api<K>, name: &str) -> Result<(), ReconcileError> {
    let patch = json!({ "metadata": { "annotations": { OPERATION_ANNOTATION: null } } });
    api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Reconcile one extension resource
pub async fn reconcile<K: Extension>(
    obj: Arc<K>,
    ctx: Arc<ExtensionContext<K>>,
) -> Result<Action, ReconcileError> {
    let started = Instant::now();
    let result = reconcile_extension(obj.as_ref(), ctx.as_ref()).await;
    ctx.metrics
        .observe_reconcile(ctx.controller, result.is_ok(), started.elapsed());
    result
}

async fn reconcile_extension<K: Extension>(
    obj: &K,
    ctx: &ExtensionContext<K>,
) -> Result<Action, ReconcileError> {
    let name = obj.name_any();
    let namespace = obj
        .namespace()
        .ok_or(ReconcileError::MissingMetadata("namespace"))?;

    if !should_reconcile(obj, ctx.ignore_operation_annotation) {
        debug!(controller = ctx.controller, %namespace, %name, "Nothing to do");
        return Ok(Action::await_change());
    }

    let kind = K::kind(&()).to_string();
    let finalizer = finalizer_name::<K>();
    let api: Api<K> = Api::namespaced(ctx.client.clone(), &namespace);
    let op = operation_type(obj);

    if op == LastOperationType::Delete && !obj.finalizers().contains(&finalizer) {
        debug!(controller = ctx.controller, %namespace, %name, "Deleted before finalizer was added");
        return Ok(Action::await_change());
    }
    if op != LastOperationType::Delete && !obj.finalizers().contains(&finalizer) {
        let mut finalizers = obj.finalizers().to_vec();
        finalizers.push(finalizer.clone());
        set_finalizers(&api, &name, finalizers).await?;
    }

    info!(controller = ctx.controller, %namespace, %name, operation = ?op, "Reconciling");
    patch_status(&api, &name, processing_status(&kind, op)).await?;

    let outcome = match op {
        LastOperationType::Delete => ctx.actuator.delete(obj).await.map(|_| None),
        LastOperationType::Migrate => ctx.actuator.migrate(obj).await.map(|_| None),
        _ => ctx.actuator.reconcile(obj).await,
    };

    let provider_status = match outcome {
        Ok(provider_status) => provider_status,
        Err(e) => {
            patch_status(&api, &name, error_status(&kind, op, &e)).await?;
            return Err(e);
        }
    };

    patch_status(
        &api,
        &name,
        succeeded_status(&kind, op, obj.meta().generation, provider_status),
    )
    .await?;

    match op {
        LastOperationType::Delete | LastOperationType::Migrate => {
            let remaining = obj
                .finalizers()
                .iter()
                .filter(|f| **f != finalizer)
                .cloned()
                .collect();
            set_finalizers(&api, &name, remaining).await?;
        }
        _ => {}
    }
    if op != LastOperationType::Delete && operation_annotation(obj).is_some() {
        remove_operation_annotation(&api, &name).await?;
    }

    info!(controller = ctx.controller, %namespace, %name, operation = ?op, "Reconciled");
    Ok(Action::await_change())
}

/// Requeue failed reconciliations after [`RETRY_INTERVAL`]
pub fn error_policy<K: Extension>(
    obj: Arc<K>,
    error: &ReconcileError,
    ctx: Arc<ExtensionContext<K>>,
) -> Action {
    warn!(
        controller = ctx.controller,
        namespace = obj.namespace().unwrap_or_default(),
        name = %obj.name_any(),
        error = %error,
        "Reconciliation failed, will retry"
    );
    Action::requeue(RETRY_INTERVAL)
}

/// Add a leader-elected controller for extension kind `K`
///
/// The controller's store counts towards informer-sync readiness.
pub fn add_extension_controller<K: Extension>(
    mgr: &mut Manager,
    name: &'static str,
    actuator: Arc<dyn Actuator<K>>,
    config: ControllerConfig,
    ignore_operation_annotation: bool,
) {
    let client = mgr.kube_client();
    let api: Api<K> = Api::all(client.clone());
    let controller = Controller::new(api, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
        .with_config(config.runtime_config());
    mgr.cache().track_store(name, controller.store());

    let ctx = Arc::new(ExtensionContext::new(
        name,
        client,
        actuator,
        ignore_operation_annotation,
        mgr.metrics().clone(),
    ));

    mgr.add(runnable_fn(name, RunnableGroup::LeaderElected, move |shutdown| async move {
        let run = controller
            .run(reconcile, error_policy, ctx)
            .for_each(log_reconcile_result(name));
        until_cancelled(name, shutdown, run).await?;
        debug!(controller = name, "Controller stopped");
        Ok(())
    }));
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use metal_common::crd::{ExtensionStatus, Infrastructure, InfrastructureSpec};
    use parking_lot::Mutex;
    use rstest::rstest;

    pub(crate) fn infrastructure(annotation: Option<&str>, last: Option<(LastOperationType, LastOperationState)>) -> Infrastructure {
        let mut infra = Infrastructure::new(
            "infra",
            InfrastructureSpec {
                extension_type: PROVIDER_TYPE.to_string(),
                provider_config: None,
                region: "eu-west".to_string(),
                secret_ref: Default::default(),
                ssh_public_key: None,
            },
        );
        infra.metadata.namespace = Some("shoot--dev--a".to_string());
        infra.metadata.generation = Some(2);
        if let Some(value) = annotation {
            infra
                .annotations_mut()
                .insert(OPERATION_ANNOTATION.to_string(), value.to_string());
        }
        infra.status = last.map(|(operation_type, state)| ExtensionStatus {
            last_operation: Some(LastOperation {
                operation_type,
                state,
                progress: 100,
                description: String::new(),
                last_update_time: None,
            }),
            ..Default::default()
        });
        infra
    }

    /// Client answering every request with `obj`, recording method and path
    pub(crate) fn echo_client<T: serde::Serialize>(obj: &T) -> (Client, Arc<Mutex<Vec<String>>>) {
        let body = serde_json::to_vec(obj).unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let recorded = requests.clone();
        let service = tower::service_fn(move |req: http::Request<kube::client::Body>| {
            recorded
                .lock()
                .push(format!("{} {}", req.method(), req.uri().path()));
            let body = body.clone();
            async move {
                Ok::<_, std::convert::Infallible>(
                    http::Response::builder()
                        .status(200)
                        .header("content-type", "application/json")
                        .body(kube::client::Body::from(body))
                        .unwrap(),
                )
            }
        });
        (Client::new(service, "default"), requests)
    }

    struct CountingActuator {
        reconciles: AtomicUsize,
        deletes: AtomicUsize,
        fail: bool,
    }

    impl CountingActuator {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                reconciles: AtomicUsize::new(0),
                deletes: AtomicUsize::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl Actuator<Infrastructure> for CountingActuator {
        async fn reconcile(&self, _obj: &Infrastructure) -> Result<Option<Value>, ReconcileError> {
            self.reconciles.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ReconcileError::not_found("Secret", "shoot--dev--a/cloudprovider"));
            }
            Ok(Some(json!({"networkRef": {"name": "n1"}})))
        }

        async fn delete(&self, _obj: &Infrastructure) -> Result<(), ReconcileError> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn context(client: Client, actuator: Arc<CountingActuator>) -> Arc<ExtensionContext<Infrastructure>> {
        Arc::new(ExtensionContext::new(
            "infrastructure",
            client,
            actuator,
            false,
            ManagerMetrics::new().unwrap(),
        ))
    }

    const OBJECT_PATH: &str =
        "/apis/extensions.gardener.cloud/v1alpha1/namespaces/shoot--dev--a/infrastructures/infra";

    #[rstest]
    #[case::annotated(Some("reconcile"), Some((LastOperationType::Reconcile, LastOperationState::Succeeded)), true)]
    #[case::never_reconciled(None, None, true)]
    #[case::last_failed(None, Some((LastOperationType::Reconcile, LastOperationState::Error)), true)]
    #[case::settled(None, Some((LastOperationType::Reconcile, LastOperationState::Succeeded)), false)]
    fn operation_annotation_gates_reconciliation(
        #[case] annotation: Option<&str>,
        #[case] last: Option<(LastOperationType, LastOperationState)>,
        #[case] expected: bool,
    ) {
        let infra = infrastructure(annotation, last);
        assert_eq!(should_reconcile(&infra, false), expected);
        assert!(should_reconcile(&infra, true));
    }

    #[test]
    fn other_providers_are_ignored() {
        let mut infra = infrastructure(Some("reconcile"), None);
        infra.spec.extension_type = "aws".to_string();
        assert!(!should_reconcile(&infra, true));
    }

    #[test]
    fn deletion_is_always_reconciled() {
        let mut infra = infrastructure(None, Some((LastOperationType::Reconcile, LastOperationState::Succeeded)));
        infra.metadata.deletion_timestamp = Some(Time(Utc::now()));
        assert!(should_reconcile(&infra, false));
        assert_eq!(operation_type(&infra), LastOperationType::Delete);
    }

    #[rstest]
    #[case(None, None, LastOperationType::Create)]
    #[case(None, Some((LastOperationType::Create, LastOperationState::Error)), LastOperationType::Create)]
    #[case(None, Some((LastOperationType::Create, LastOperationState::Succeeded)), LastOperationType::Reconcile)]
    #[case(Some("restore"), None, LastOperationType::Restore)]
    #[case(Some("migrate"), Some((LastOperationType::Reconcile, LastOperationState::Succeeded)), LastOperationType::Migrate)]
    fn operation_type_follows_history_and_annotation(
        #[case] annotation: Option<&str>,
        #[case] last: Option<(LastOperationType, LastOperationState)>,
        #[case] expected: LastOperationType,
    ) {
        assert_eq!(operation_type(&infrastructure(annotation, last)), expected);
    }

    #[test]
    fn finalizer_is_named_after_the_kind() {
        assert_eq!(finalizer_name::<Infrastructure>(), "extensions.gardener.cloud/infrastructure");
    }

    #[test]
    fn succeeded_status_clears_last_error() {
        let status = succeeded_status("Infrastructure", LastOperationType::Reconcile, Some(3), Some(json!({"a": 1})));
        assert!(status["status"]["lastError"].is_null());
        assert_eq!(status["status"]["observedGeneration"], 3);
        assert_eq!(status["status"]["lastOperation"]["state"], "Succeeded");
        assert_eq!(status["status"]["lastOperation"]["progress"], 100);
        assert_eq!(status["status"]["providerStatus"]["a"], 1);
    }

    #[tokio::test]
    async fn successful_reconcile_records_status_and_drops_annotation() {
        let infra = infrastructure(Some("reconcile"), None);
        let (client, requests) = echo_client(&infra);
        let actuator = CountingActuator::new(false);
        let ctx = context(client, actuator.clone());

        let action = reconcile(Arc::new(infra), ctx).await.unwrap();

        assert_eq!(action, Action::await_change());
        assert_eq!(actuator.reconciles.load(Ordering::SeqCst), 1);
        let status_path = format!("PATCH {OBJECT_PATH}/status");
        let object_path = format!("PATCH {OBJECT_PATH}");
        assert_eq!(
            *requests.lock(),
            vec![object_path.clone(), status_path.clone(), status_path, object_path]
        );
    }

    #[tokio::test]
    async fn failed_reconcile_records_error_and_returns_it() {
        let infra = infrastructure(None, None);
        let (client, requests) = echo_client(&infra);
        let ctx = context(client, CountingActuator::new(true));

        let err = reconcile(Arc::new(infra), ctx).await.unwrap_err();

        assert!(matches!(err, ReconcileError::NotFound { kind: "Secret", .. }));
        // finalizer, processing, error
        assert_eq!(requests.lock().len(), 3);
    }

    #[tokio::test]
    async fn other_provider_makes_no_api_calls() {
        let mut infra = infrastructure(Some("reconcile"), None);
        infra.spec.extension_type = "gcp".to_string();
        let (client, requests) = echo_client(&infra);
        let actuator = CountingActuator::new(false);

        reconcile(Arc::new(infra), context(client, actuator.clone()))
            .await
            .unwrap();

        assert!(requests.lock().is_empty());
        assert_eq!(actuator.reconciles.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn deletion_runs_delete_and_removes_finalizer() {
        let mut infra = infrastructure(None, Some((LastOperationType::Reconcile, LastOperationState::Succeeded)));
        infra.metadata.deletion_timestamp = Some(Time(Utc::now()));
        infra.metadata.finalizers = Some(vec![finalizer_name::<Infrastructure>()]);
        let (client, requests) = echo_client(&infra);
        let actuator = CountingActuator::new(false);

        reconcile(Arc::new(infra), context(client, actuator.clone()))
            .await
            .unwrap();

        assert_eq!(actuator.deletes.load(Ordering::SeqCst), 1);
        assert_eq!(actuator.reconciles.load(Ordering::SeqCst), 0);
        let last = requests.lock().last().cloned().unwrap();
        assert_eq!(last, format!("PATCH {OBJECT_PATH}"));
    }

    #[tokio::test]
    async fn error_policy_requeues() {
        let infra = Arc::new(infrastructure(None, None));
        let (client, _) = echo_client(infra.as_ref());
        let action = error_policy(
            infra,
            &ReconcileError::MissingMetadata("namespace"),
            context(client, CountingActuator::new(false)),
        );
        assert_eq!(action, Action::requeue(RETRY_INTERVAL));
    }
}
