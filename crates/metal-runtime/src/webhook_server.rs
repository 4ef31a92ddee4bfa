//! TLS server hosting admission webhook handlers
//!
//! Handlers are registered by path before the manager runs; the server is
//! consumed when it starts, so the set of paths is fixed from then on. The
//! serving certificate is read from `tls.crt`/`tls.key` in the certificate
//! directory.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::routing::MethodRouter;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::health::{flag_check, HealthCheck};
use crate::runnable::{Runnable, RunnableError, RunnableGroup};

/// Serving certificate file name inside the certificate directory
pub const CERT_FILE: &str = "tls.crt";
/// Serving key file name inside the certificate directory
pub const KEY_FILE: &str = "tls.key";
/// CA bundle file name inside the certificate directory
pub const CA_FILE: &str = "ca.crt";

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Handler registration errors
#[derive(Debug, Error)]
pub enum WebhookServerError {
    /// Path already has a handler
    #[error("webhook path {0} is already registered")]
    DuplicatePath(String),

    /// Path is not absolute
    #[error("webhook path {0} must start with '/'")]
    InvalidPath(String),
}

/// Admission webhook server
pub struct WebhookServer {
    port: u16,
    cert_dir: PathBuf,
    routes: Vec<(String, MethodRouter)>,
    started: Arc<AtomicBool>,
}

impl WebhookServer {
    /// Server on all interfaces at `port`, certificates from `cert_dir`
    pub fn new(port: u16, cert_dir: impl Into<PathBuf>) -> Self {
        Self {
            port,
            cert_dir: cert_dir.into(),
            routes: Vec::new(),
            started: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Listening port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Certificate directory
    pub fn cert_dir(&self) -> &Path {
        &self.cert_dir
    }

    /// Attach a handler at `path`
    pub fn register(&mut self, path: &str, handler: MethodRouter) -> Result<(), WebhookServerError> {
        if !path.starts_with('/') {
            return Err(WebhookServerError::InvalidPath(path.to_string()));
        }
        if self.routes.iter().any(|(p, _)| p == path) {
            return Err(WebhookServerError::DuplicatePath(path.to_string()));
        }
        info!(path, "Registering webhook handler");
        self.routes.push((path.to_string(), handler));
        Ok(())
    }

    /// Registered paths in registration order
    pub fn paths(&self) -> Vec<String> {
        self.routes.iter().map(|(p, _)| p.clone()).collect()
    }

    /// Readiness check passing once the TLS listener is bound
    pub fn started_checker(&self) -> impl HealthCheck {
        flag_check(Arc::clone(&self.started), "webhook server not listening")
    }

    /// Mark the server ready without serving; used when no handler is registered
    pub(crate) fn latch_idle(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    /// Router with every registered handler
    pub fn router(&self) -> Router {
        self.routes
            .iter()
            .fold(Router::new(), |router, (path, handler)| {
                router.route(path, handler.clone())
            })
    }
}

#[async_trait]
impl Runnable for WebhookServer {
    fn name(&self) -> &str {
        "webhook-server"
    }

    fn group(&self) -> RunnableGroup {
        RunnableGroup::Servers
    }

    async fn start(self: Box<Self>, shutdown: CancellationToken) -> Result<(), RunnableError> {
        let name = self.name().to_string();
        let cert = self.cert_dir.join(CERT_FILE);
        let key = self.cert_dir.join(KEY_FILE);
        let tls = RustlsConfig::from_pem_file(&cert, &key).await.map_err(|e| {
            RunnableError::new(
                &name,
                format!("failed to load serving certificate from {}: {e}", self.cert_dir.display()),
            )
        })?;

        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port));
        let handle = Handle::new();

        let listening = handle.clone();
        let started = Arc::clone(&self.started);
        tokio::spawn(async move {
            if let Some(bound) = listening.listening().await {
                started.store(true, Ordering::SeqCst);
                info!(addr = %bound, "Webhook server listening");
            }
        });

        let stopping = handle.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            token.cancelled().await;
            stopping.graceful_shutdown(Some(SHUTDOWN_GRACE));
        });

        let router = self.router();
        let result = axum_server::bind_rustls(addr, tls)
            .handle(handle)
            .serve(router.into_make_service())
            .await;

        if let Err(e) = result {
            warn!(error = %e, "Webhook server failed");
            return Err(RunnableError::new(name, e.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::post;

    #[test]
    fn duplicate_paths_are_rejected() {
        let mut server = WebhookServer::new(9443, "/tmp/certs");
        server
            .register("/webhooks/cloudprovider", post(|| async { "ok" }))
            .unwrap();
        assert!(matches!(
            server.register("/webhooks/cloudprovider", post(|| async { "ok" })),
            Err(WebhookServerError::DuplicatePath(_))
        ));
        assert!(matches!(
            server.register("relative", post(|| async { "ok" })),
            Err(WebhookServerError::InvalidPath(_))
        ));
        assert_eq!(server.paths(), vec!["/webhooks/cloudprovider".to_string()]);
    }

    #[test]
    fn not_ready_before_listening() {
        let server = WebhookServer::new(9443, "/tmp/certs");
        assert!(server.started_checker().check().is_err());
    }

    #[tokio::test]
    async fn missing_certificates_fail_start() {
        let dir = tempfile::tempdir().unwrap();
        let server = Box::new(WebhookServer::new(0, dir.path()));
        let err = server.start(CancellationToken::new()).await.unwrap_err();
        assert!(err.message.contains("serving certificate"));
    }
}
