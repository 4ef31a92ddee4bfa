//! Liveness and readiness probes
//!
//! Checks are registered by name under a probe kind. A kind is healthy only
//! when every check of that kind passes. The set is sealed once registration
//! finishes; until then readiness reports unhealthy while liveness evaluates
//! whatever is registered so far.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use parking_lot::RwLock;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cache::ClusterCache;
use crate::runnable::{Runnable, RunnableError, RunnableGroup};

/// Probe registration errors
#[derive(Debug, Error)]
pub enum HealthError {
    /// A check with the same name and kind exists
    #[error("{kind} check {name} already registered")]
    Duplicate {
        /// Probe kind
        kind: ProbeKind,
        /// Check name
        name: String,
    },

    /// Registration after sealing
    #[error("health checks are sealed, cannot add {kind} check {name}")]
    Sealed {
        /// Probe kind
        kind: ProbeKind,
        /// Check name
        name: String,
    },
}

/// Which endpoint a check belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeKind {
    /// `/healthz`
    Liveness,
    /// `/readyz`
    Readiness,
}

impl std::fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeKind::Liveness => f.write_str("healthz"),
            ProbeKind::Readiness => f.write_str("readyz"),
        }
    }
}

/// A single health check
pub trait HealthCheck: Send + Sync {
    /// `Ok` when healthy, otherwise the reason
    fn check(&self) -> Result<(), String>;
}

impl<F> HealthCheck for F
where
    F: Fn() -> Result<(), String> + Send + Sync,
{
    fn check(&self) -> Result<(), String> {
        self()
    }
}

/// Always healthy
pub fn ping() -> impl HealthCheck {
    || -> Result<(), String> { Ok(()) }
}

/// Healthy once every cache finished its initial sync; stays healthy afterwards
pub struct CacheSyncCheck {
    caches: Vec<ClusterCache>,
    synced: AtomicBool,
}

impl CacheSyncCheck {
    /// Check over the given caches
    pub fn new(caches: Vec<ClusterCache>) -> Self {
        Self {
            caches,
            synced: AtomicBool::new(false),
        }
    }
}

impl HealthCheck for CacheSyncCheck {
    fn check(&self) -> Result<(), String> {
        if self.synced.load(Ordering::SeqCst) {
            return Ok(());
        }
        for cache in &self.caches {
            if !cache.is_started() {
                return Err(format!("cache {} not started", cache.name()));
            }
            let pending = cache.unsynced();
            if !pending.is_empty() {
                return Err(format!(
                    "cache {} waiting for {}",
                    cache.name(),
                    pending.join(", ")
                ));
            }
        }
        self.synced.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Check backed by a latched flag
pub fn flag_check(flag: Arc<AtomicBool>, reason: &'static str) -> impl HealthCheck {
    move || -> Result<(), String> {
        if flag.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(reason.to_string())
        }
    }
}

struct HealthProbe {
    name: String,
    kind: ProbeKind,
    check: Box<dyn HealthCheck>,
}

#[derive(Default)]
struct RegistryState {
    probes: Vec<HealthProbe>,
    sealed: bool,
}

/// Outcome of evaluating one probe kind
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbeReport {
    /// Whether every check passed
    pub healthy: bool,
    /// Per check results in registration order
    pub checks: Vec<(String, Result<(), String>)>,
}

impl ProbeReport {
    fn render(&self) -> String {
        let mut out = String::new();
        for (name, result) in &self.checks {
            match result {
                Ok(()) => out.push_str(&format!("[+]{name} ok\n")),
                Err(reason) => out.push_str(&format!("[-]{name} failed: {reason}\n")),
            }
        }
        out.push_str(if self.healthy { "ok\n" } else { "unhealthy\n" });
        out
    }
}

/// Shared registry of health checks
#[derive(Clone, Default)]
pub struct HealthRegistry {
    state: Arc<RwLock<RegistryState>>,
}

impl HealthRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a check
    pub fn add(
        &self,
        kind: ProbeKind,
        name: &str,
        check: impl HealthCheck + 'static,
    ) -> Result<(), HealthError> {
        let mut state = self.state.write();
        if state.sealed {
            return Err(HealthError::Sealed {
                kind,
                name: name.to_string(),
            });
        }
        if state.probes.iter().any(|p| p.kind == kind && p.name == name) {
            return Err(HealthError::Duplicate {
                kind,
                name: name.to_string(),
            });
        }
        state.probes.push(HealthProbe {
            name: name.to_string(),
            kind,
            check: Box::new(check),
        });
        Ok(())
    }

    /// Freeze the set of checks
    pub fn seal(&self) {
        self.state.write().sealed = true;
    }

    /// Whether the set is frozen
    pub fn is_sealed(&self) -> bool {
        self.state.read().sealed
    }

    /// Evaluate every check of a kind
    pub fn evaluate(&self, kind: ProbeKind) -> ProbeReport {
        let state = self.state.read();
        let checks: Vec<(String, Result<(), String>)> = state
            .probes
            .iter()
            .filter(|p| p.kind == kind)
            .map(|p| (p.name.clone(), p.check.check()))
            .collect();

        let mut healthy = checks.iter().all(|(_, r)| r.is_ok());
        if kind == ProbeKind::Readiness && !state.sealed {
            healthy = false;
        }
        ProbeReport { healthy, checks }
    }

    /// Evaluate a single named check, `None` if unknown
    pub fn evaluate_one(&self, kind: ProbeKind, name: &str) -> Option<Result<(), String>> {
        self.state
            .read()
            .probes
            .iter()
            .find(|p| p.kind == kind && p.name == name)
            .map(|p| p.check.check())
    }

    /// Names of registered checks of a kind
    pub fn names(&self, kind: ProbeKind) -> Vec<String> {
        self.state
            .read()
            .probes
            .iter()
            .filter(|p| p.kind == kind)
            .map(|p| p.name.clone())
            .collect()
    }
}

/// Routes serving the probes
pub fn health_router(registry: HealthRegistry) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/healthz/{name}", get(healthz_one))
        .route("/readyz/{name}", get(readyz_one))
        .with_state(registry)
}

fn report_response(report: ProbeReport) -> Response {
    let status = if report.healthy {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, report.render()).into_response()
}

fn single_response(result: Option<Result<(), String>>) -> Response {
    match result {
        Some(Ok(())) => (StatusCode::OK, "ok\n").into_response(),
        Some(Err(reason)) => {
            (StatusCode::INTERNAL_SERVER_ERROR, format!("{reason}\n")).into_response()
        }
        None => (StatusCode::NOT_FOUND, "no such check\n").into_response(),
    }
}

async fn healthz(State(registry): State<HealthRegistry>) -> Response {
    report_response(registry.evaluate(ProbeKind::Liveness))
}

async fn readyz(State(registry): State<HealthRegistry>) -> Response {
    if !registry.is_sealed() {
        let mut report = registry.evaluate(ProbeKind::Readiness);
        report
            .checks
            .push(("registration".to_string(), Err("still in progress".to_string())));
        return report_response(report);
    }
    report_response(registry.evaluate(ProbeKind::Readiness))
}

async fn healthz_one(
    State(registry): State<HealthRegistry>,
    Path(name): Path<String>,
) -> Response {
    single_response(registry.evaluate_one(ProbeKind::Liveness, &name))
}

async fn readyz_one(
    State(registry): State<HealthRegistry>,
    Path(name): Path<String>,
) -> Response {
    single_response(registry.evaluate_one(ProbeKind::Readiness, &name))
}

/// Plain HTTP server for the probes; runs on every replica
pub struct HealthServer {
    addr: SocketAddr,
    registry: HealthRegistry,
}

impl HealthServer {
    /// Serve `registry` on `addr`
    pub fn new(addr: SocketAddr, registry: HealthRegistry) -> Self {
        Self { addr, registry }
    }
}

#[async_trait]
impl Runnable for HealthServer {
    fn name(&self) -> &str {
        "health-probes"
    }

    fn group(&self) -> RunnableGroup {
        RunnableGroup::Servers
    }

    async fn start(self: Box<Self>, shutdown: CancellationToken) -> Result<(), RunnableError> {
        serve_plain(self.name(), self.addr, health_router(self.registry.clone()), shutdown).await
    }
}

/// Serve a router over plain HTTP until `shutdown` is cancelled
pub(crate) async fn serve_plain(
    name: &str,
    addr: SocketAddr,
    router: Router,
    shutdown: CancellationToken,
) -> Result<(), RunnableError> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| RunnableError::new(name, format!("failed to bind {addr}: {e}")))?;
    let local = listener.local_addr().unwrap_or(addr);
    info!(server = name, addr = %local, "Server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(|e| RunnableError::new(name, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::cache::tests::offline_client;

    async fn get_status(router: Router, uri: &str) -> (StatusCode, String) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[test]
    fn duplicate_and_late_registrations_fail() {
        let registry = HealthRegistry::new();
        registry.add(ProbeKind::Liveness, "ping", ping()).unwrap();
        // Same name under another kind is fine
        registry.add(ProbeKind::Readiness, "ping", ping()).unwrap();
        assert!(matches!(
            registry.add(ProbeKind::Liveness, "ping", ping()),
            Err(HealthError::Duplicate { .. })
        ));

        registry.seal();
        assert!(matches!(
            registry.add(ProbeKind::Readiness, "late", ping()),
            Err(HealthError::Sealed { .. })
        ));
    }

    #[test]
    fn readiness_requires_sealing_and_all_checks() {
        let registry = HealthRegistry::new();
        let flag = Arc::new(AtomicBool::new(false));
        registry
            .add(ProbeKind::Readiness, "webhook-server", flag_check(flag.clone(), "not listening"))
            .unwrap();
        registry.add(ProbeKind::Readiness, "ping", ping()).unwrap();

        flag.store(true, Ordering::SeqCst);
        assert!(!registry.evaluate(ProbeKind::Readiness).healthy);

        registry.seal();
        assert!(registry.evaluate(ProbeKind::Readiness).healthy);

        flag.store(false, Ordering::SeqCst);
        let report = registry.evaluate(ProbeKind::Readiness);
        assert!(!report.healthy);
        assert_eq!(report.checks[0].1, Err("not listening".to_string()));
    }

    #[test]
    fn empty_liveness_is_healthy_before_sealing() {
        assert!(HealthRegistry::new().evaluate(ProbeKind::Liveness).healthy);
    }

    #[tokio::test]
    async fn cache_sync_check_latches() {
        let cache = ClusterCache::new("seed", offline_client());
        let (reader, mut writer) = kube::runtime::reflector::store::<k8s_openapi::api::core::v1::Secret>();
        cache.track_store("secrets", reader);
        let check = CacheSyncCheck::new(vec![cache.clone()]);

        assert!(check.check().unwrap_err().contains("not started"));
        cache.start(CancellationToken::new());
        assert!(check.check().unwrap_err().contains("secrets"));

        writer.apply_watcher_event(&kube::runtime::watcher::Event::InitDone);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(check.check().is_ok());

        // Stopping the cache afterwards does not flip the latched result
        cache.stop().await;
        assert!(check.check().is_ok());
    }

    #[tokio::test]
    async fn endpoints_report_status() {
        let registry = HealthRegistry::new();
        registry.add(ProbeKind::Liveness, "ping", ping()).unwrap();
        registry
            .add(ProbeKind::Readiness, "informer-sync", || -> Result<(), String> {
                Err("waiting".to_string())
            })
            .unwrap();

        let (status, body) = get_status(health_router(registry.clone()), "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("[+]ping ok"));

        let (status, body) = get_status(health_router(registry.clone()), "/readyz").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.contains("[-]registration failed"));

        registry.seal();
        let (status, body) = get_status(health_router(registry.clone()), "/readyz").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.contains("[-]informer-sync failed: waiting"));

        let (status, _) = get_status(health_router(registry.clone()), "/healthz/ping").await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = get_status(health_router(registry), "/readyz/unknown").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
