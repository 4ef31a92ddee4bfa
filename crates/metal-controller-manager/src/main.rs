//! ironcore-metal provider extension controller manager

use anyhow::Context;
use metal_common::telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig};
use metal_controller_manager::{ExtensionOptions, LifecycleRunner};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const BINARY_NAME: &str = "gardener-extension-provider-ironcore-metal";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // The webhook server and every kube client use rustls with aws-lc-rs
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: failed to install the aws-lc-rs crypto provider: {e:?}");
        std::process::exit(1);
    }

    let mut options = ExtensionOptions::default();
    let matches = options.command(BINARY_NAME).get_matches();
    options.update_from_matches(&matches);

    init_telemetry(TelemetryConfig::default()).context("failed to initialize telemetry")?;
    info!(version = env!("CARGO_PKG_VERSION"), "Starting {BINARY_NAME}");

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    let (runner, _state) = LifecycleRunner::new();
    let result = runner.run(options, shutdown).await;
    match &result {
        Ok(reason) => info!(reason = ?reason, "Controller manager stopped"),
        Err(e) => error!(error = %e, "Controller manager failed"),
    }
    shutdown_telemetry();

    result.map(|_| ()).context("controller manager exited with an error")
}

/// Cancel `shutdown` on SIGINT or SIGTERM
async fn cancel_on_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("SIGINT received, shutting down"),
        _ = terminate => info!("SIGTERM received, shutting down"),
    }
    shutdown.cancel();
}
