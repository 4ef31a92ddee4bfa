//! Error types shared by the metal extension crates
//!
//! Errors carry structured context (resource names, field paths, file paths)
//! so that log lines emitted from reconcilers and startup code are actionable.

use std::path::PathBuf;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for metal extension operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Invalid configuration or resource content
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Resource (or configuration section) that failed validation
        resource: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.providerConfig.networkRef")
        field: Option<String>,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The kind being decoded (if known)
        kind: Option<String>,
    },

    /// A kubeconfig could not be read, parsed, or used
    #[error("kubeconfig error [{path}]: {message}")]
    Kubeconfig {
        /// Path of the offending kubeconfig
        path: PathBuf,
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "actuator", "heartbeat")
        context: String,
    },
}

impl Error {
    /// Create a validation error without resource context
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error for a named resource
    pub fn validation_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error for a named resource and field path
    pub fn validation_for_field(
        resource: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error for a specific kind
    pub fn serialization_for(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a kubeconfig error
    pub fn kubeconfig(path: impl Into<PathBuf>, msg: impl Into<String>) -> Self {
        Self::Kubeconfig {
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(msg: impl Into<String>, context: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Whether retrying the failed operation can succeed without user action
    ///
    /// Validation and decoding failures need a spec change; API errors other
    /// than 4xx client errors are considered transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(resp) => resp.code >= 500 || resp.code == 409 || resp.code == 429,
                _ => true,
            },
            Error::Validation { .. } | Error::Serialization { .. } => false,
            Error::Kubeconfig { .. } => false,
            Error::Internal { .. } => true,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> Error {
        Error::from(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: "Test".to_string(),
            code,
        }))
    }

    #[test]
    fn validation_error_names_resource_and_field() {
        let err = Error::validation_for_field("shoot--foo--bar/infra", "spec.providerConfig", "bad");
        assert_eq!(err.to_string(), "validation error for shoot--foo--bar/infra: bad");
        match err {
            Error::Validation { field, .. } => assert_eq!(field.as_deref(), Some("spec.providerConfig")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn server_side_errors_are_retryable() {
        assert!(api_error(500).is_retryable());
        assert!(api_error(409).is_retryable());
        assert!(api_error(429).is_retryable());
    }

    #[test]
    fn client_errors_are_not_retryable() {
        assert!(!api_error(404).is_retryable());
        assert!(!api_error(422).is_retryable());
        assert!(!Error::validation("nope").is_retryable());
    }

    #[test]
    fn kubeconfig_error_includes_path() {
        let err = Error::kubeconfig("/etc/garden/kubeconfig", "exec auth is not allowed");
        let msg = err.to_string();
        assert!(msg.contains("/etc/garden/kubeconfig"));
        assert!(msg.contains("exec auth is not allowed"));
    }

    #[test]
    fn json_errors_convert_to_serialization() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(matches!(Error::from(json_err), Error::Serialization { .. }));
    }
}
