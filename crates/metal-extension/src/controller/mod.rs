//! Controllers of the extension and the switches that enable them
//!
//! Every controller has a static name, an `AddOptions` value carrying its
//! configuration, and an adder implementing [`ControllerAdder`]. The
//! [`ControllerSwitches`] hold all adders and attach only the enabled ones
//! to the manager.

pub mod controlplane;
pub mod extension;
pub mod healthcheck;
pub mod heartbeat;
pub mod infrastructure;
pub mod worker;

use std::collections::BTreeSet;

use metal_runtime::Manager;
use tracing::info;

use crate::error::RegistrationError;

/// Watcher timeout (seconds); must stay below the client read timeout
pub const WATCH_TIMEOUT_SECS: u32 = 25;

/// Default reconcile concurrency per controller
pub const DEFAULT_MAX_CONCURRENT_RECONCILES: u16 = 5;

/// Every controller name, in registration order
pub const CONTROLLER_NAMES: &[&str] = &[
    infrastructure::NAME,
    worker::NAME,
    controlplane::NAME,
    healthcheck::NAME,
    heartbeat::NAME,
];

/// Per-controller runtime settings
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Upper bound of reconciliations running at once for this controller
    pub max_concurrent_reconciles: u16,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_reconciles: DEFAULT_MAX_CONCURRENT_RECONCILES,
        }
    }
}

impl ControllerConfig {
    /// kube-runtime controller settings
    pub fn runtime_config(&self) -> kube::runtime::controller::Config {
        kube::runtime::controller::Config::default().concurrency(self.max_concurrent_reconciles)
    }
}

/// What a switch registered, or would have registered
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerEntry {
    /// Controller name
    pub name: String,
    /// Whether it was added to the manager
    pub enabled: bool,
    /// Concurrency bound
    pub max_concurrent_reconciles: u16,
    /// Whether the operation annotation is ignored
    pub ignore_operation_annotation: bool,
}

/// Attaches one controller to a manager
pub trait ControllerAdder: Send + Sync {
    /// Controller name
    fn name(&self) -> &'static str;

    /// Settings the controller runs with
    fn entry(&self) -> ControllerEntry;

    /// Register the controller's runnables and stores
    fn add_to_manager(&self, mgr: &mut Manager) -> Result<(), RegistrationError>;
}

/// Named, individually toggleable controllers
#[derive(Default)]
pub struct ControllerSwitches {
    switches: Vec<Box<dyn ControllerAdder>>,
}

impl ControllerSwitches {
    /// Empty switch set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a switch
    pub fn with(mut self, adder: impl ControllerAdder + 'static) -> Self {
        self.switches.push(Box::new(adder));
        self
    }

    /// Names of all switches, in registration order
    pub fn names(&self) -> Vec<&'static str> {
        self.switches.iter().map(|s| s.name()).collect()
    }

    /// Add every controller not named in `disabled`
    ///
    /// Returns one entry per switch; disabled ones are reported with
    /// `enabled: false` and never touch the manager.
    pub fn add_to_manager(
        &self,
        mgr: &mut Manager,
        disabled: &BTreeSet<String>,
    ) -> Result<Vec<ControllerEntry>, RegistrationError> {
        let mut entries = Vec::with_capacity(self.switches.len());
        for switch in &self.switches {
            let mut entry = switch.entry();
            if disabled.contains(switch.name()) {
                info!(controller = switch.name(), "Controller disabled");
                entry.enabled = false;
            } else {
                switch.add_to_manager(mgr)?;
                info!(
                    controller = switch.name(),
                    max_concurrent_reconciles = entry.max_concurrent_reconciles,
                    "Controller registered"
                );
                entry.enabled = true;
            }
            entries.push(entry);
        }
        Ok(entries)
    }
}

/// Log the outcome of each reconciliation emitted by a controller stream
pub(crate) fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    use kube::Client;
    use metal_runtime::ManagerOptions;

    /// Client whose every request fails
    pub(crate) fn offline_client() -> Client {
        let service = tower::service_fn(|_req: http::Request<kube::client::Body>| async {
            Err::<http::Response<kube::client::Body>, std::io::Error>(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "offline",
            ))
        });
        Client::new(service, "default")
    }

    pub(crate) fn test_manager() -> Manager {
        Manager::with_client(
            offline_client(),
            crate::scheme::seed_scheme().unwrap(),
            ManagerOptions {
                metrics_addr: None,
                health_addr: None,
                webhook_port: 0,
                webhook_cert_dir: PathBuf::from("/nonexistent"),
                graceful_shutdown_timeout: Duration::from_secs(1),
                uncached: Vec::new(),
            },
        )
        .unwrap()
    }

    struct Recording {
        name: &'static str,
    }

    impl ControllerAdder for Recording {
        fn name(&self) -> &'static str {
            self.name
        }

        fn entry(&self) -> ControllerEntry {
            ControllerEntry {
                name: self.name.to_string(),
                enabled: false,
                max_concurrent_reconciles: 3,
                ignore_operation_annotation: false,
            }
        }

        fn add_to_manager(&self, mgr: &mut Manager) -> Result<(), RegistrationError> {
            mgr.add(metal_runtime::runnable_fn(
                self.name,
                metal_runtime::RunnableGroup::LeaderElected,
                |_| async { Ok(()) },
            ));
            Ok(())
        }
    }

    #[tokio::test]
    async fn disabled_controllers_are_never_registered() {
        let mut mgr = test_manager();
        let switches = ControllerSwitches::new()
            .with(Recording { name: "worker" })
            .with(Recording { name: "infrastructure" });
        let disabled = BTreeSet::from(["worker".to_string()]);

        let entries = switches.add_to_manager(&mut mgr, &disabled).unwrap();

        assert_eq!(entries.len(), 2);
        assert!(!entries[0].enabled);
        assert!(entries[1].enabled);
        let names = mgr.runnable_names();
        assert!(names.contains(&"infrastructure".to_string()));
        assert!(!names.contains(&"worker".to_string()));
    }

    #[test]
    fn default_concurrency_is_five() {
        assert_eq!(ControllerConfig::default().max_concurrent_reconciles, 5);
    }
}
