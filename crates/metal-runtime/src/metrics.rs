//! Prometheus metrics owned by the manager

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use tokio_util::sync::CancellationToken;

use crate::health::serve_plain;
use crate::runnable::{Runnable, RunnableError, RunnableGroup};

const NAMESPACE: &str = "metal_extension";

/// Metrics shared by controllers, webhooks and the lifecycle runner
#[derive(Clone)]
pub struct ManagerMetrics {
    registry: Arc<Registry>,
    /// Reconciliations by controller and result
    pub reconcile_total: IntCounterVec,
    /// Reconciliation duration by controller
    pub reconcile_duration_seconds: HistogramVec,
    /// Admission reviews by webhook and outcome
    pub admission_total: IntCounterVec,
    /// 1 while this replica holds the leader lease
    pub leader: IntGauge,
    /// Successful heartbeat lease renewals
    pub heartbeat_renewals_total: IntCounter,
}

impl ManagerMetrics {
    /// Create and register all metrics in a fresh registry
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let reconcile_total = IntCounterVec::new(
            Opts::new("reconcile_total", "Total reconciliations").namespace(NAMESPACE),
            &["controller", "result"],
        )?;
        registry.register(Box::new(reconcile_total.clone()))?;

        let reconcile_duration_seconds = HistogramVec::new(
            HistogramOpts::new("reconcile_duration_seconds", "Reconciliation duration")
                .namespace(NAMESPACE)
                .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
            &["controller"],
        )?;
        registry.register(Box::new(reconcile_duration_seconds.clone()))?;

        let admission_total = IntCounterVec::new(
            Opts::new("admission_total", "Total admission reviews").namespace(NAMESPACE),
            &["webhook", "allowed"],
        )?;
        registry.register(Box::new(admission_total.clone()))?;

        let leader = IntGauge::with_opts(
            Opts::new("leader", "Whether this replica is the leader").namespace(NAMESPACE),
        )?;
        registry.register(Box::new(leader.clone()))?;

        let heartbeat_renewals_total = IntCounter::with_opts(
            Opts::new("heartbeat_renewals_total", "Heartbeat lease renewals").namespace(NAMESPACE),
        )?;
        registry.register(Box::new(heartbeat_renewals_total.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            reconcile_total,
            reconcile_duration_seconds,
            admission_total,
            leader,
            heartbeat_renewals_total,
        })
    }

    /// Record one reconciliation
    pub fn observe_reconcile(&self, controller: &str, success: bool, elapsed: Duration) {
        let result = if success { "success" } else { "error" };
        self.reconcile_total
            .with_label_values(&[controller, result])
            .inc();
        self.reconcile_duration_seconds
            .with_label_values(&[controller])
            .observe(elapsed.as_secs_f64());
    }

    /// Record one admission review
    pub fn observe_admission(&self, webhook: &str, allowed: bool) {
        let allowed = if allowed { "true" } else { "false" };
        self.admission_total
            .with_label_values(&[webhook, allowed])
            .inc();
    }

    /// Render the text exposition format
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

async fn metrics_handler(State(metrics): State<ManagerMetrics>) -> Response {
    match metrics.render() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// Router serving `/metrics`
pub fn metrics_router(metrics: ManagerMetrics) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics)
}

/// Plain HTTP metrics endpoint; runs on every replica
pub struct MetricsServer {
    addr: SocketAddr,
    metrics: ManagerMetrics,
}

impl MetricsServer {
    /// Serve `metrics` on `addr`
    pub fn new(addr: SocketAddr, metrics: ManagerMetrics) -> Self {
        Self { addr, metrics }
    }
}

#[async_trait]
impl Runnable for MetricsServer {
    fn name(&self) -> &str {
        "metrics"
    }

    fn group(&self) -> RunnableGroup {
        RunnableGroup::Servers
    }

    async fn start(self: Box<Self>, shutdown: CancellationToken) -> Result<(), RunnableError> {
        serve_plain(self.name(), self.addr, metrics_router(self.metrics.clone()), shutdown).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_recorded_values() {
        let metrics = ManagerMetrics::new().unwrap();
        metrics.observe_reconcile("worker", true, Duration::from_millis(20));
        metrics.observe_reconcile("worker", false, Duration::from_millis(5));
        metrics.observe_admission("cloudprovider", true);
        metrics.leader.set(1);

        let text = metrics.render().unwrap();
        assert!(text.contains(r#"metal_extension_reconcile_total{controller="worker",result="success"} 1"#));
        assert!(text.contains(r#"metal_extension_reconcile_total{controller="worker",result="error"} 1"#));
        assert!(text.contains("metal_extension_leader 1"));
        assert!(text.contains(r#"metal_extension_admission_total{allowed="true",webhook="cloudprovider"} 1"#));
    }

    #[test]
    fn registries_are_independent() {
        let a = ManagerMetrics::new().unwrap();
        let b = ManagerMetrics::new().unwrap();
        a.leader.set(1);
        assert!(b.render().unwrap().contains("metal_extension_leader 0"));
    }
}
