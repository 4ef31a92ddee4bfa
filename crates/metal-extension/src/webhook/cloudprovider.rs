//! Cloudprovider secret webhook
//!
//! Routes the `cloudprovider` Secret of every ironcore-metal shoot namespace
//! through a [`CloudProviderEnsurer`] before it is persisted.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::DynamicObject;
use metal_common::{PROVIDER_TYPE, PURPOSE_CLOUDPROVIDER, PURPOSE_LABEL, SHOOT_PROVIDER_LABEL};
use metal_runtime::Manager;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use super::{Mutator, Target, Webhook, WebhookAdder, WebhookError, WebhookKind};
use crate::error::RegistrationError;

/// Webhook name
pub const NAME: &str = "cloudprovider";

/// Provider-specific changes to a shoot's cloudprovider Secret
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CloudProviderEnsurer: Send + Sync {
    /// Adjust `new` in place; `old` is set on updates
    async fn ensure_cloud_provider_secret(&self, new: &mut Secret, old: Option<Secret>) -> Result<(), WebhookError>;
}

/// Ensurer leaving the Secret as submitted
pub struct PassthroughEnsurer;

#[async_trait]
impl CloudProviderEnsurer for PassthroughEnsurer {
    async fn ensure_cloud_provider_secret(&self, new: &mut Secret, _old: Option<Secret>) -> Result<(), WebhookError> {
        debug!(name = ?new.metadata.name, "Cloudprovider secret admitted unchanged");
        Ok(())
    }
}

/// Mutator converting admitted objects to Secrets for the ensurer
pub struct CloudProviderMutator {
    ensurer: Arc<dyn CloudProviderEnsurer>,
}

impl CloudProviderMutator {
    /// Mutator delegating to `ensurer`
    pub fn new(ensurer: Arc<dyn CloudProviderEnsurer>) -> Self {
        Self { ensurer }
    }
}

fn to_secret(obj: &DynamicObject) -> Result<Secret, WebhookError> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

#[async_trait]
impl Mutator for CloudProviderMutator {
    async fn mutate(&self, new: &mut DynamicObject, old: Option<&DynamicObject>) -> Result<(), WebhookError> {
        let mut secret = to_secret(new)?;
        let old = old.map(to_secret).transpose()?;
        self.ensurer
            .ensure_cloud_provider_secret(&mut secret, old)
            .await?;
        *new = serde_json::from_value(serde_json::to_value(&secret)?)?;
        Ok(())
    }
}

fn label_selector(key: &str, value: &str) -> LabelSelector {
    LabelSelector {
        match_labels: Some(BTreeMap::from([(key.to_string(), value.to_string())])),
        ..Default::default()
    }
}

/// The cloudprovider webhook around `ensurer`
pub fn cloudprovider_webhook(ensurer: Arc<dyn CloudProviderEnsurer>) -> Webhook {
    Webhook {
        name: NAME,
        provider: PROVIDER_TYPE,
        path: NAME.to_string(),
        target: Target::Seed,
        kinds: vec![WebhookKind {
            group: "",
            version: "v1",
            resource: "secrets",
        }],
        namespace_selector: Some(label_selector(SHOOT_PROVIDER_LABEL, PROVIDER_TYPE)),
        object_selector: Some(label_selector(PURPOSE_LABEL, PURPOSE_CLOUDPROVIDER)),
        mutator: Arc::new(CloudProviderMutator::new(ensurer)),
    }
}

/// Builds the cloudprovider webhook
pub struct CloudProviderAdder {
    ensurer: Arc<dyn CloudProviderEnsurer>,
}

impl CloudProviderAdder {
    /// Adder using `ensurer` for admitted Secrets
    pub fn new(ensurer: Arc<dyn CloudProviderEnsurer>) -> Self {
        Self { ensurer }
    }
}

impl Default for CloudProviderAdder {
    fn default() -> Self {
        Self::new(Arc::new(PassthroughEnsurer))
    }
}

impl WebhookAdder for CloudProviderAdder {
    fn name(&self) -> &'static str {
        NAME
    }

    fn build(&self, _mgr: &Manager) -> Result<Webhook, RegistrationError> {
        Ok(cloudprovider_webhook(Arc::clone(&self.ensurer)))
    }
}
