//! Infrastructure controller
//!
//! Bare-metal shoots reuse a pre-provisioned network, so the actuator only
//! validates the provider configuration and reports the network in use.

use std::sync::Arc;

use async_trait::async_trait;
use metal_common::apis::metal::{InfrastructureConfig, InfrastructureStatus, ProviderObject};
use metal_common::crd::{Extension, Infrastructure};
use metal_runtime::Manager;
use serde_json::Value;
use tracing::debug;

use super::extension::{add_extension_controller, Actuator};
use super::{ControllerAdder, ControllerConfig, ControllerEntry};
use crate::error::{ReconcileError, RegistrationError};

/// Controller name
pub const NAME: &str = "infrastructure";

/// Configuration surface of the infrastructure controller
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AddOptions {
    /// Runtime settings
    pub controller: ControllerConfig,
    /// Reconcile on every change instead of on request
    pub ignore_operation_annotation: bool,
}

/// Actuator translating `InfrastructureConfig` into `InfrastructureStatus`
pub struct InfrastructureActuator;

/// Provider status for an infrastructure's configuration
pub fn infrastructure_status(infra: &Infrastructure) -> Result<InfrastructureStatus, ReconcileError> {
    let config = match infra.provider_config() {
        Some(raw) => InfrastructureConfig::decode(raw)?,
        None => InfrastructureConfig::default(),
    };
    Ok(InfrastructureStatus {
        network_ref: config.network_ref,
    })
}

#[async_trait]
impl Actuator<Infrastructure> for InfrastructureActuator {
    async fn reconcile(&self, infra: &Infrastructure) -> Result<Option<Value>, ReconcileError> {
        let status = infrastructure_status(infra)?;
        debug!(network = ?status.network_ref, "Infrastructure network resolved");
        Ok(Some(status.encode()?))
    }

    async fn delete(&self, _infra: &Infrastructure) -> Result<(), ReconcileError> {
        Ok(())
    }
}

/// Adds the infrastructure controller
pub struct InfrastructureAdder {
    options: AddOptions,
}

impl InfrastructureAdder {
    /// Adder with the given options
    pub fn new(options: AddOptions) -> Self {
        Self { options }
    }
}

impl ControllerAdder for InfrastructureAdder {
    fn name(&self) -> &'static str {
        NAME
    }

    fn entry(&self) -> ControllerEntry {
        ControllerEntry {
            name: NAME.to_string(),
            enabled: true,
            max_concurrent_reconciles: self.options.controller.max_concurrent_reconciles,
            ignore_operation_annotation: self.options.ignore_operation_annotation,
        }
    }

    fn add_to_manager(&self, mgr: &mut Manager) -> Result<(), RegistrationError> {
        add_extension_controller::<Infrastructure>(
            mgr,
            NAME,
            Arc::new(InfrastructureActuator),
            self.options.controller,
            self.options.ignore_operation_annotation,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::extension::tests::infrastructure;
    use crate::controller::tests::test_manager;
    use serde_json::json;

    #[tokio::test]
    async fn status_carries_the_configured_network() {
        let mut infra = infrastructure(None, None);
        infra.spec.provider_config = Some(json!({
            "apiVersion": "metal.provider.extensions.gardener.cloud/v1alpha1",
            "kind": "InfrastructureConfig",
            "networkRef": {"name": "shoot-net"}
        }));

        let status = InfrastructureActuator.reconcile(&infra).await.unwrap().unwrap();

        assert_eq!(status["kind"], "InfrastructureStatus");
        assert_eq!(status["networkRef"]["name"], "shoot-net");
    }

    #[test]
    fn missing_provider_config_yields_empty_status() {
        let infra = infrastructure(None, None);
        assert_eq!(infrastructure_status(&infra).unwrap(), InfrastructureStatus::default());
    }

    #[test]
    fn foreign_provider_config_is_rejected() {
        let mut infra = infrastructure(None, None);
        infra.spec.provider_config = Some(json!({
            "apiVersion": "aws.provider.extensions.gardener.cloud/v1alpha1",
            "kind": "InfrastructureConfig"
        }));
        assert!(matches!(
            infrastructure_status(&infra),
            Err(ReconcileError::Provider(_))
        ));
    }

    #[tokio::test]
    async fn adder_registers_a_leader_runnable() {
        let mut mgr = test_manager();
        let adder = InfrastructureAdder::new(AddOptions::default());
        adder.add_to_manager(&mut mgr).unwrap();
        assert!(mgr.runnable_names().contains(&NAME.to_string()));
        assert_eq!(adder.entry().max_concurrent_reconciles, 5);
    }
}
