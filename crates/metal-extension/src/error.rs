//! Error types for controllers and webhooks

use metal_runtime::{ClientError, HealthError, SchemeError, WebhookServerError};
use thiserror::Error;

/// Errors returned by a single reconciliation
///
/// Never fatal: the error policy logs them and requeues the object.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Kubernetes API call failed
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Cached or live read failed
    #[error(transparent)]
    Client(#[from] ClientError),

    /// Provider configuration or status could not be handled
    #[error(transparent)]
    Provider(#[from] metal_common::Error),

    /// A referenced object does not exist
    #[error("{kind} {name} not found")]
    NotFound {
        /// Kind of the missing object
        kind: &'static str,
        /// Name (or namespace/name) of the missing object
        name: String,
    },

    /// The object is missing metadata the controller relies on
    #[error("object has no {0}")]
    MissingMetadata(&'static str),
}

impl ReconcileError {
    /// Missing object of the given kind
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }
}

/// Errors while attaching controllers or webhooks to the manager
#[derive(Debug, Error)]
pub enum RegistrationError {
    /// Webhook handler could not be registered
    #[error(transparent)]
    WebhookServer(#[from] WebhookServerError),

    /// Health check could not be registered
    #[error(transparent)]
    Health(#[from] HealthError),

    /// Scheme registration failed
    #[error(transparent)]
    Scheme(#[from] SchemeError),

    /// Controller could not be set up
    #[error("controller {controller}: {message}")]
    Controller {
        /// Controller name
        controller: String,
        /// Failure description
        message: String,
    },

    /// Webhook could not be set up
    #[error("webhook {webhook}: {message}")]
    Webhook {
        /// Webhook name
        webhook: String,
        /// Failure description
        message: String,
    },
}
