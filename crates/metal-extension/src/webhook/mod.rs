//! Mutating admission webhooks of the extension
//!
//! A [`Webhook`] pairs a [`Mutator`] with the selectors the API server uses to
//! route objects to it. [`WebhookSwitches`] registers the enabled webhooks on
//! the manager's webhook server, installs the `MutatingWebhookConfiguration`
//! from the leader and publishes the namespace the server runs in.

pub mod cloudprovider;

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use axum::extract::State;
use axum::routing::post;
use axum::Json;
use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhook, MutatingWebhookConfiguration, RuleWithOperations, ServiceReference,
    WebhookClientConfig,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::ByteString;
use kube::api::{Api, DynamicObject, Patch, PatchParams};
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use kube::Client;
use metal_common::{FIELD_MANAGER, PROVIDER_NAME};
use metal_runtime::webhook_server::CA_FILE;
use metal_runtime::{runnable_fn, Manager, ManagerMetrics, RunnableError, RunnableGroup};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::error::RegistrationError;

/// Every webhook name, in registration order
pub const WEBHOOK_NAMES: &[&str] = &[cloudprovider::NAME];

/// Prefix of every webhook path on the server
pub const WEBHOOK_PATH_PREFIX: &str = "/webhooks/";

/// Name of the installed `MutatingWebhookConfiguration` and of the Service in
/// front of the webhook server
pub const WEBHOOK_CONFIGURATION_NAME: &str = "gardener-extension-provider-ironcore-metal";

/// Namespace the webhook server runs in, known once webhooks are registered
///
/// Cloned handles share the value. The first published namespace wins.
#[derive(Clone, Debug, Default)]
pub struct WebhookNamespace(Arc<OnceLock<String>>);

impl WebhookNamespace {
    /// Publish the namespace
    pub fn publish(&self, namespace: &str) {
        if self.0.set(namespace.to_string()).is_err() && self.get() != Some(namespace) {
            warn!(namespace, published = ?self.get(), "Webhook namespace already published");
        }
    }

    /// Published namespace, if any
    pub fn get(&self) -> Option<&str> {
        self.0.get().map(String::as_str)
    }
}

/// Errors returned by a mutator
#[derive(Debug, Error)]
pub enum WebhookError {
    /// Object could not be converted to or from its typed form
    #[error("failed to decode object: {0}")]
    Decode(#[from] serde_json::Error),

    /// Kubernetes API call failed
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// The mutator refuses the object
    #[error("{0}")]
    Rejected(String),
}

/// Changes an object on its way into the API server
#[async_trait]
pub trait Mutator: Send + Sync {
    /// Mutate `new` in place; `old` is set on updates
    async fn mutate(&self, new: &mut DynamicObject, old: Option<&DynamicObject>) -> Result<(), WebhookError>;
}

/// Cluster whose API server calls the webhook
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Target {
    /// The seed; installed by this extension
    Seed,
    /// Shoot clusters; installed by Gardener on each shoot
    Shoot,
}

/// A resource the webhook is registered for
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WebhookKind {
    /// API group, empty for the core group
    pub group: &'static str,
    /// API version
    pub version: &'static str,
    /// Plural resource name
    pub resource: &'static str,
}

/// One mutating admission webhook
#[derive(Clone)]
pub struct Webhook {
    /// Webhook name
    pub name: &'static str,
    /// Provider type the webhook belongs to
    pub provider: &'static str,
    /// Path below [`WEBHOOK_PATH_PREFIX`]
    pub path: String,
    /// Cluster that calls the webhook
    pub target: Target,
    /// Resources routed to the webhook
    pub kinds: Vec<WebhookKind>,
    /// Namespaces whose objects are routed to the webhook
    pub namespace_selector: Option<LabelSelector>,
    /// Objects routed to the webhook
    pub object_selector: Option<LabelSelector>,
    /// Mutation applied to admitted objects
    pub mutator: Arc<dyn Mutator>,
}

impl Webhook {
    /// Full path served for this webhook
    pub fn server_path(&self) -> String {
        format!("{WEBHOOK_PATH_PREFIX}{}", self.path.trim_start_matches('/'))
    }

    /// Name of the webhook inside the `MutatingWebhookConfiguration`
    pub fn qualified_name(&self) -> String {
        format!("{}.{}.extensions.gardener.cloud", self.name, self.provider)
    }

    fn rules(&self) -> Vec<RuleWithOperations> {
        self.kinds
            .iter()
            .map(|kind| RuleWithOperations {
                api_groups: Some(vec![kind.group.to_string()]),
                api_versions: Some(vec![kind.version.to_string()]),
                resources: Some(vec![kind.resource.to_string()]),
                operations: Some(vec!["CREATE".to_string(), "UPDATE".to_string()]),
                ..Default::default()
            })
            .collect()
    }
}

#[derive(Clone)]
struct AdmissionState {
    webhook: &'static str,
    mutator: Arc<dyn Mutator>,
    metrics: ManagerMetrics,
}

/// Run the mutator and answer with a JSON patch, or deny with its error
async fn admit(state: &AdmissionState, request: &AdmissionRequest<DynamicObject>) -> (AdmissionResponse, bool) {
    let uid = request.uid.clone();
    let Some(object) = request.object.as_ref() else {
        debug!(webhook = state.webhook, %uid, "No object in request, allowing unchanged");
        return (AdmissionResponse::from(request), true);
    };

    let deny = |message: String| {
        warn!(webhook = state.webhook, %uid, %message, "Admission denied");
        (AdmissionResponse::from(request).deny(message), false)
    };

    let original = match serde_json::to_value(object) {
        Ok(value) => value,
        Err(e) => return deny(format!("failed to encode object: {e}")),
    };
    let mut mutated = object.clone();
    if let Err(e) = state.mutator.mutate(&mut mutated, request.old_object.as_ref()).await {
        return deny(e.to_string());
    }
    let mutated = match serde_json::to_value(&mutated) {
        Ok(value) => value,
        Err(e) => return deny(format!("failed to encode mutated object: {e}")),
    };

    let patch = json_patch::diff(&original, &mutated);
    if patch.0.is_empty() {
        debug!(webhook = state.webhook, %uid, "Object unchanged");
        return (AdmissionResponse::from(request), true);
    }
    info!(webhook = state.webhook, %uid, operations = patch.0.len(), "Patching object");
    match AdmissionResponse::from(request).with_patch(patch) {
        Ok(response) => (response, true),
        Err(e) => deny(format!("patch serialization error: {e}")),
    }
}

async fn admission_handler(
    State(state): State<AdmissionState>,
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let request: AdmissionRequest<DynamicObject> = match body.try_into() {
        Ok(request) => request,
        Err(e) => {
            error!(webhook = state.webhook, error = %e, "Failed to parse admission request");
            state.metrics.observe_admission(state.webhook, false);
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };
    let (response, allowed) = admit(&state, &request).await;
    state.metrics.observe_admission(state.webhook, allowed);
    Json(response.into_review())
}

/// Where the API server reaches the webhook server
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WebhookServerConfig {
    /// Namespace of the webhook server and its Service
    pub namespace: String,
    /// Service port
    pub port: u16,
}

/// `MutatingWebhookConfiguration` for the seed-targeted `webhooks`
pub fn mutating_webhook_configuration(
    webhooks: &[Webhook],
    server: &WebhookServerConfig,
    ca_bundle: Vec<u8>,
) -> MutatingWebhookConfiguration {
    let entries = webhooks
        .iter()
        .filter(|w| w.target == Target::Seed)
        .map(|webhook| MutatingWebhook {
            name: webhook.qualified_name(),
            admission_review_versions: vec!["v1".to_string()],
            client_config: WebhookClientConfig {
                ca_bundle: Some(ByteString(ca_bundle.clone())),
                service: Some(ServiceReference {
                    name: WEBHOOK_CONFIGURATION_NAME.to_string(),
                    namespace: server.namespace.clone(),
                    path: Some(webhook.server_path()),
                    port: Some(i32::from(server.port)),
                }),
                url: None,
            },
            failure_policy: Some("Fail".to_string()),
            match_policy: Some("Exact".to_string()),
            namespace_selector: webhook.namespace_selector.clone(),
            object_selector: webhook.object_selector.clone(),
            rules: Some(webhook.rules()),
            side_effects: "None".to_string(),
            timeout_seconds: Some(10),
            ..Default::default()
        })
        .collect();

    MutatingWebhookConfiguration {
        metadata: ObjectMeta {
            name: Some(WEBHOOK_CONFIGURATION_NAME.to_string()),
            labels: Some(
                [("app.kubernetes.io/managed-by".to_string(), PROVIDER_NAME.to_string())].into(),
            ),
            ..Default::default()
        },
        webhooks: Some(entries),
    }
}

async fn install_configuration(
    client: Client,
    webhooks: Vec<Webhook>,
    server: WebhookServerConfig,
    ca_file: &Path,
) -> Result<(), RunnableError> {
    const NAME: &str = "webhook-configuration";
    let ca_bundle = tokio::fs::read(ca_file).await.map_err(|e| {
        RunnableError::new(NAME, format!("failed to read CA bundle {}: {e}", ca_file.display()))
    })?;
    let config = mutating_webhook_configuration(&webhooks, &server, ca_bundle);

    let api: Api<MutatingWebhookConfiguration> = Api::all(client);
    api.patch(
        WEBHOOK_CONFIGURATION_NAME,
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Apply(&config),
    )
    .await
    .map_err(|e| RunnableError::new(NAME, format!("failed to apply webhook configuration: {e}")))?;
    info!(
        name = WEBHOOK_CONFIGURATION_NAME,
        webhooks = webhooks.len(),
        "Webhook configuration applied"
    );
    Ok(())
}

/// Builds one webhook
pub trait WebhookAdder: Send + Sync {
    /// Webhook name
    fn name(&self) -> &'static str;

    /// Construct the webhook using the manager's clients
    fn build(&self, mgr: &Manager) -> Result<Webhook, RegistrationError>;
}

/// Named, individually toggleable webhooks
#[derive(Default)]
pub struct WebhookSwitches {
    switches: Vec<Box<dyn WebhookAdder>>,
}

impl WebhookSwitches {
    /// Empty switch set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a switch
    pub fn with(mut self, adder: impl WebhookAdder + 'static) -> Self {
        self.switches.push(Box::new(adder));
        self
    }

    /// Names of all switches, in registration order
    pub fn names(&self) -> Vec<&'static str> {
        self.switches.iter().map(|s| s.name()).collect()
    }

    /// Register every webhook not named in `disabled`
    ///
    /// Handlers go onto the manager's webhook server and the configuration
    /// install is queued as a leader runnable. `published` receives the server
    /// namespace whenever it is set, even with every webhook disabled.
    /// Returns the registered webhooks.
    pub fn add_to_manager(
        &self,
        mgr: &mut Manager,
        disabled: &BTreeSet<String>,
        server: &WebhookServerConfig,
        published: &WebhookNamespace,
    ) -> Result<Vec<Webhook>, RegistrationError> {
        if !server.namespace.is_empty() {
            published.publish(&server.namespace);
        }

        let mut webhooks = Vec::new();
        for switch in &self.switches {
            if disabled.contains(switch.name()) {
                info!(webhook = switch.name(), "Webhook disabled");
                continue;
            }
            let webhook = switch.build(mgr)?;
            let state = AdmissionState {
                webhook: webhook.name,
                mutator: Arc::clone(&webhook.mutator),
                metrics: mgr.metrics().clone(),
            };
            mgr.webhook_server()
                .ok_or_else(|| RegistrationError::Webhook {
                    webhook: webhook.name.to_string(),
                    message: "webhook server already started".to_string(),
                })?
                .register(&webhook.server_path(), post(admission_handler).with_state(state))?;
            info!(webhook = webhook.name, path = %webhook.server_path(), "Webhook registered");
            webhooks.push(webhook);
        }

        if webhooks.is_empty() {
            return Ok(webhooks);
        }
        if server.namespace.is_empty() {
            return Err(RegistrationError::Webhook {
                webhook: webhooks[0].name.to_string(),
                message: "webhook server namespace must not be empty".to_string(),
            });
        }

        let client = mgr.kube_client();
        let ca_file = mgr.options().webhook_cert_dir.join(CA_FILE);
        let installed = webhooks.clone();
        let config = server.clone();
        mgr.add(runnable_fn(
            "webhook-configuration",
            RunnableGroup::LeaderElected,
            move |_shutdown| async move { install_configuration(client, installed, config, &ca_file).await },
        ));
        Ok(webhooks)
    }
}
