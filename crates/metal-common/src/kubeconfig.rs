//! Kubeconfig loading with restricted authentication
//!
//! The garden kubeconfig is mounted from a secret and must not be able to run
//! arbitrary binaries or read arbitrary files on the seed. Only inline
//! credentials are accepted, plus `tokenFile` when explicitly allowed.

use std::path::Path;

use kube::config::{AuthInfo, KubeConfigOptions, Kubeconfig};
use kube::Config;
use tracing::debug;

use crate::{Error, Result};

/// Authentication fields permitted in addition to inline credentials
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuthAllowList {
    /// Allow `tokenFile` (projected service account tokens)
    pub token_file: bool,
}

impl AuthAllowList {
    /// Allow-list used for the garden cluster
    pub fn with_token_file() -> Self {
        Self { token_file: true }
    }
}

/// Reject auth info fields outside the allow-list
pub fn validate_auth_infos(kubeconfig: &Kubeconfig, allow: AuthAllowList) -> std::result::Result<(), String> {
    for named in &kubeconfig.auth_infos {
        let Some(auth) = named.auth_info.as_ref() else {
            continue;
        };
        if let Some(field) = forbidden_field(auth, allow) {
            return Err(format!(
                "user {:?} uses forbidden field {field:?}",
                named.name
            ));
        }
    }
    Ok(())
}

fn forbidden_field(auth: &AuthInfo, allow: AuthAllowList) -> Option<&'static str> {
    if auth.exec.is_some() {
        return Some("exec");
    }
    if auth.auth_provider.is_some() {
        return Some("auth-provider");
    }
    if auth.client_certificate.is_some() {
        return Some("client-certificate");
    }
    if auth.client_key.is_some() {
        return Some("client-key");
    }
    if auth.impersonate.is_some() || auth.impersonate_groups.is_some() {
        return Some("act-as");
    }
    if auth.token_file.is_some() && !allow.token_file {
        return Some("tokenFile");
    }
    None
}

/// Read a kubeconfig file, enforce the allow-list and build a client config
pub async fn load_restricted(path: &Path, allow: AuthAllowList) -> Result<Config> {
    let kubeconfig =
        Kubeconfig::read_from(path).map_err(|e| Error::kubeconfig(path, e.to_string()))?;
    validate_auth_infos(&kubeconfig, allow).map_err(|msg| Error::kubeconfig(path, msg))?;

    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::kubeconfig(path, e.to_string()))?;
    debug!(path = %path.display(), cluster_url = %config.cluster_url, "Loaded restricted kubeconfig");
    Ok(config)
}

/// Load the primary cluster config from an explicit file or by inference
///
/// Without a path this follows the usual order: `KUBECONFIG`, `~/.kube/config`,
/// then the in-cluster service account.
pub async fn load_primary(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => {
            let kubeconfig =
                Kubeconfig::read_from(path).map_err(|e| Error::kubeconfig(path, e.to_string()))?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| Error::kubeconfig(path, e.to_string()))
        }
        None => Config::infer()
            .await
            .map_err(|e| Error::kubeconfig("<inferred>", e.to_string())),
    }
}
