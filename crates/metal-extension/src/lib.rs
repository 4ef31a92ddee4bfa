//! Controllers and admission webhooks of the ironcore-metal provider extension
//!
//! # Modules
//!
//! - [`controller`] - Extension controllers, their actuators and switches
//! - [`webhook`] - Mutating admission webhooks and their installation
//! - [`scheme`] - Scheme builders for the seed and garden clusters
//! - [`error`] - Reconcile and registration errors

#![deny(missing_docs)]

pub mod controller;
pub mod error;
pub mod scheme;
pub mod webhook;

pub use controller::{ControllerAdder, ControllerConfig, ControllerEntry, ControllerSwitches, CONTROLLER_NAMES};
pub use error::{ReconcileError, RegistrationError};
pub use webhook::{
    Mutator, Webhook, WebhookAdder, WebhookError, WebhookNamespace, WebhookServerConfig, WebhookSwitches,
    WEBHOOK_NAMES,
};
