//! ControlPlane controller
//!
//! Renders the cloud provider configuration for the shoot's cloud controller
//! manager into a ConfigMap in the control-plane namespace. The ConfigMap
//! also carries the namespace the webhook server runs in, which is learned
//! from the webhook pipeline after controllers are registered.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
use metal_common::apis::metal::{ControlPlaneConfig, InfrastructureStatus, ProviderObject};
use metal_common::crd::{ControlPlane, Extension};
use metal_common::FIELD_MANAGER;
use metal_runtime::Manager;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::extension::{add_extension_controller, Actuator};
use super::{ControllerAdder, ControllerConfig, ControllerEntry};
use crate::error::{ReconcileError, RegistrationError};
use crate::webhook::WebhookNamespace;

/// Controller name
pub const NAME: &str = "controlplane";

/// ConfigMap holding the cloud provider configuration
pub const CLOUD_PROVIDER_CONFIG_NAME: &str = "cloud-provider-config";

/// Key of the rendered configuration in the ConfigMap
pub const CLOUD_PROVIDER_CONFIG_KEY: &str = "cloudprovider.conf";

/// Key of the webhook server namespace in the ConfigMap
pub const WEBHOOK_NAMESPACE_KEY: &str = "webhookNamespace";

/// ControlPlane purpose handled by this controller
const PURPOSE_NORMAL: &str = "normal";

/// Configuration surface of the control-plane controller
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AddOptions {
    /// Runtime settings
    pub controller: ControllerConfig,
}

/// Render the cloud provider ConfigMap for `cp`
pub fn cloud_provider_config_map(
    cp: &ControlPlane,
    webhook_namespace: Option<&str>,
) -> Result<ConfigMap, ReconcileError> {
    let namespace = cp
        .namespace()
        .ok_or(ReconcileError::MissingMetadata("namespace"))?;
    let config = match cp.provider_config() {
        Some(raw) => ControlPlaneConfig::decode(raw)?,
        None => ControlPlaneConfig::default(),
    };
    let infra = match cp.spec.infrastructure_provider_status.as_ref() {
        Some(raw) => InfrastructureStatus::decode(raw)?,
        None => InfrastructureStatus::default(),
    };

    let feature_gates = config
        .cloud_controller_manager
        .map(|ccm| ccm.feature_gates)
        .unwrap_or_default();
    let rendered = json!({
        "networkName": infra.network_ref.map(|n| n.name),
        "featureGates": feature_gates,
    });

    let mut data = BTreeMap::from([(CLOUD_PROVIDER_CONFIG_KEY.to_string(), rendered.to_string())]);
    if let Some(ns) = webhook_namespace {
        data.insert(WEBHOOK_NAMESPACE_KEY.to_string(), ns.to_string());
    }

    Ok(ConfigMap {
        metadata: ObjectMeta {
            name: Some(CLOUD_PROVIDER_CONFIG_NAME.to_string()),
            namespace: Some(namespace),
            labels: Some(BTreeMap::from([(
                "app.kubernetes.io/managed-by".to_string(),
                FIELD_MANAGER.to_string(),
            )])),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    })
}

/// Actuator maintaining the cloud provider ConfigMap
pub struct ControlPlaneActuator {
    client: Client,
    webhook_namespace: WebhookNamespace,
}

impl ControlPlaneActuator {
    /// Actuator writing through `client`
    pub fn new(client: Client, webhook_namespace: WebhookNamespace) -> Self {
        Self {
            client,
            webhook_namespace,
        }
    }
}

fn handles_purpose(cp: &ControlPlane) -> bool {
    cp.spec.purpose.as_deref().unwrap_or(PURPOSE_NORMAL) == PURPOSE_NORMAL
}

#[async_trait]
impl Actuator<ControlPlane> for ControlPlaneActuator {
    async fn reconcile(&self, cp: &ControlPlane) -> Result<Option<Value>, ReconcileError> {
        if !handles_purpose(cp) {
            debug!(purpose = ?cp.spec.purpose, "Control plane purpose not handled");
            return Ok(None);
        }
        let config_map = cloud_provider_config_map(cp, self.webhook_namespace.get())?;
        let namespace = config_map.namespace().unwrap_or_default();

        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &namespace);
        api.patch(
            CLOUD_PROVIDER_CONFIG_NAME,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&config_map),
        )
        .await?;
        info!(%namespace, "Cloud provider config applied");
        Ok(None)
    }

    async fn delete(&self, cp: &ControlPlane) -> Result<(), ReconcileError> {
        if !handles_purpose(cp) {
            return Ok(());
        }
        let namespace = cp
            .namespace()
            .ok_or(ReconcileError::MissingMetadata("namespace"))?;
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &namespace);
        match api.delete(CLOUD_PROVIDER_CONFIG_NAME, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Adds the control-plane controller
pub struct ControlPlaneAdder {
    options: AddOptions,
    webhook_namespace: WebhookNamespace,
}

impl ControlPlaneAdder {
    /// Adder sharing `webhook_namespace` with the webhook pipeline
    pub fn new(options: AddOptions, webhook_namespace: WebhookNamespace) -> Self {
        Self {
            options,
            webhook_namespace,
        }
    }
}

impl ControllerAdder for ControlPlaneAdder {
    fn name(&self) -> &'static str {
        NAME
    }

    fn entry(&self) -> ControllerEntry {
        ControllerEntry {
            name: NAME.to_string(),
            enabled: true,
            max_concurrent_reconciles: self.options.controller.max_concurrent_reconciles,
            ignore_operation_annotation: false,
        }
    }

    fn add_to_manager(&self, mgr: &mut Manager) -> Result<(), RegistrationError> {
        let actuator = ControlPlaneActuator::new(mgr.kube_client(), self.webhook_namespace.clone());
        add_extension_controller::<ControlPlane>(
            mgr,
            NAME,
            Arc::new(actuator),
            self.options.controller,
            false,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::extension::tests::echo_client;
    use metal_common::crd::ControlPlaneSpec;
    use metal_common::PROVIDER_TYPE;

    fn control_plane(purpose: Option<&str>) -> ControlPlane {
        let mut cp = ControlPlane::new(
            "control-plane",
            ControlPlaneSpec {
                extension_type: PROVIDER_TYPE.to_string(),
                provider_config: Some(json!({
                    "apiVersion": "metal.provider.extensions.gardener.cloud/v1alpha1",
                    "kind": "ControlPlaneConfig",
                    "cloudControllerManager": {"featureGates": {"CustomResourceValidation": true}}
                })),
                region: "eu-west".to_string(),
                secret_ref: Default::default(),
                purpose: purpose.map(str::to_string),
                infrastructure_provider_status: Some(json!({
                    "apiVersion": "metal.provider.extensions.gardener.cloud/v1alpha1",
                    "kind": "InfrastructureStatus",
                    "networkRef": {"name": "shoot-net"}
                })),
            },
        );
        cp.metadata.namespace = Some("shoot--dev--a".to_string());
        cp
    }

    #[test]
    fn config_map_renders_network_and_feature_gates() {
        let cm = cloud_provider_config_map(&control_plane(None), Some("garden")).unwrap();
        let data = cm.data.unwrap();
        let rendered: Value = serde_json::from_str(&data[CLOUD_PROVIDER_CONFIG_KEY]).unwrap();
        assert_eq!(rendered["networkName"], "shoot-net");
        assert_eq!(rendered["featureGates"]["CustomResourceValidation"], true);
        assert_eq!(data[WEBHOOK_NAMESPACE_KEY], "garden");
        assert_eq!(cm.metadata.namespace.as_deref(), Some("shoot--dev--a"));
    }

    #[test]
    fn webhook_namespace_is_omitted_until_known() {
        let cm = cloud_provider_config_map(&control_plane(None), None).unwrap();
        assert!(!cm.data.unwrap().contains_key(WEBHOOK_NAMESPACE_KEY));
    }

    #[tokio::test]
    async fn reconcile_applies_config_map_with_published_namespace() {
        let cp = control_plane(Some("normal"));
        let (client, requests) = echo_client(&cloud_provider_config_map(&cp, None).unwrap());
        let namespace = WebhookNamespace::default();
        namespace.publish("garden");
        let actuator = ControlPlaneActuator::new(client, namespace);

        assert!(actuator.reconcile(&cp).await.unwrap().is_none());
        assert_eq!(
            *requests.lock(),
            vec!["PATCH /api/v1/namespaces/shoot--dev--a/configmaps/cloud-provider-config".to_string()]
        );
    }

    #[tokio::test]
    async fn exposure_control_planes_are_skipped() {
        let cp = control_plane(Some("exposure"));
        let (client, requests) = echo_client(&cp);
        let actuator = ControlPlaneActuator::new(client, WebhookNamespace::default());

        actuator.reconcile(&cp).await.unwrap();
        actuator.delete(&cp).await.unwrap();
        assert!(requests.lock().is_empty());
    }
}
