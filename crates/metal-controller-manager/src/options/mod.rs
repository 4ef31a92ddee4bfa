//! Command line option groups
//!
//! Every group binds its flags into a shared [`clap::Command`], copies parsed
//! values into its raw form and turns that into an immutable completed form.
//! Groups can be registered under a flag prefix with [`Prefixed`], which is
//! how the per-controller options share one definition.

pub mod controller;
pub mod manager;
pub mod webhook;

use clap::{ArgMatches, Command};
use metal_extension::{CONTROLLER_NAMES, WEBHOOK_NAMES};
use thiserror::Error;

pub use controller::{
    ConfigOptions, ControllerOptions, ControllerSwitchOptions, HeartbeatOptions, ReconcilerOptions,
    HEARTBEAT_PREFIX,
};
pub use manager::{GeneralOptions, ManagerOptions, RestOptions};
pub use webhook::WebhookOptions;

/// Option errors
#[derive(Debug, Error)]
pub enum OptionsError {
    /// A group failed to complete
    #[error("{group} options: {source}")]
    Group {
        /// Name of the failing group, including its prefix
        group: String,
        /// Why completion failed
        #[source]
        source: metal_common::Error,
    },

    /// A completed form was read before completion
    #[error("{0} options were not completed")]
    NotCompleted(String),
}

impl OptionsError {
    /// Completion failure of `group`
    pub fn group(group: impl Into<String>, source: metal_common::Error) -> Self {
        Self::Group {
            group: group.into(),
            source,
        }
    }
}

/// A set of related command line flags
pub trait OptionGroup {
    /// Group name used in errors
    fn name(&self) -> String;

    /// Add this group's flags, each long name prefixed with `prefix`
    fn augment_args(&self, cmd: Command, prefix: &str) -> Command;

    /// Copy parsed values into the raw form
    fn update_from_matches(&mut self, matches: &ArgMatches, prefix: &str);

    /// Derive the completed form from the raw form
    ///
    /// Calling it again with an unchanged raw form yields the same result.
    fn complete(&mut self) -> Result<(), metal_common::Error>;
}

impl<G: OptionGroup + ?Sized> OptionGroup for &mut G {
    fn name(&self) -> String {
        (**self).name()
    }

    fn augment_args(&self, cmd: Command, prefix: &str) -> Command {
        (**self).augment_args(cmd, prefix)
    }

    fn update_from_matches(&mut self, matches: &ArgMatches, prefix: &str) {
        (**self).update_from_matches(matches, prefix)
    }

    fn complete(&mut self) -> Result<(), metal_common::Error> {
        (**self).complete()
    }
}

/// A group whose flags carry an extra prefix, e.g. `worker-`
pub struct Prefixed<G> {
    prefix: &'static str,
    inner: G,
}

impl<G: OptionGroup> Prefixed<G> {
    /// Wrap `inner` under `prefix`
    pub fn new(prefix: &'static str, inner: G) -> Self {
        Self { prefix, inner }
    }
}

impl<G: OptionGroup> OptionGroup for Prefixed<G> {
    fn name(&self) -> String {
        format!("{}{}", self.prefix, self.inner.name())
    }

    fn augment_args(&self, cmd: Command, prefix: &str) -> Command {
        self.inner.augment_args(cmd, &format!("{prefix}{}", self.prefix))
    }

    fn update_from_matches(&mut self, matches: &ArgMatches, prefix: &str) {
        let prefix = format!("{prefix}{}", self.prefix);
        self.inner.update_from_matches(matches, &prefix)
    }

    fn complete(&mut self) -> Result<(), metal_common::Error> {
        self.inner.complete()
    }
}

/// Ordered collection of option groups acting as one
#[derive(Default)]
pub struct OptionAggregator<'a> {
    groups: Vec<Box<dyn OptionGroup + 'a>>,
}

impl<'a> OptionAggregator<'a> {
    /// Empty aggregator
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a group
    pub fn with(mut self, group: impl OptionGroup + 'a) -> Self {
        self.groups.push(Box::new(group));
        self
    }

    /// Bind every group's flags into `cmd`
    pub fn augment_args(&self, cmd: Command) -> Command {
        self.groups
            .iter()
            .fold(cmd, |cmd, group| group.augment_args(cmd, ""))
    }

    /// Copy parsed values into every group
    pub fn update_from_matches(&mut self, matches: &ArgMatches) {
        for group in &mut self.groups {
            group.update_from_matches(matches, "");
        }
    }

    /// Complete every group in order, stopping at the first failure
    pub fn complete(&mut self) -> Result<(), OptionsError> {
        for group in &mut self.groups {
            group
                .complete()
                .map_err(|source| OptionsError::group(group.name(), source))?;
        }
        Ok(())
    }
}

/// Every option group of the controller manager
#[derive(Clone, Debug)]
pub struct ExtensionOptions {
    /// Gardener version and garden kubeconfig
    pub general: GeneralOptions,
    /// Seed API server access
    pub rest: RestOptions,
    /// Manager settings
    pub manager: ManagerOptions,
    /// Control-plane controller concurrency
    pub controlplane: ControllerOptions,
    /// Infrastructure controller concurrency
    pub infrastructure: ControllerOptions,
    /// Worker controller concurrency
    pub worker: ControllerOptions,
    /// Health check controller concurrency
    pub healthcheck: ControllerOptions,
    /// Heartbeat lease settings
    pub heartbeat: HeartbeatOptions,
    /// Controller configuration file
    pub config: ConfigOptions,
    /// Disabled controllers
    pub controller_switches: ControllerSwitchOptions,
    /// Operation annotation handling
    pub reconciler: ReconcilerOptions,
    /// Webhook namespace and disabled webhooks
    pub webhook: WebhookOptions,
}

impl Default for ExtensionOptions {
    fn default() -> Self {
        Self {
            general: GeneralOptions::default(),
            rest: RestOptions::default(),
            manager: ManagerOptions::default(),
            controlplane: ControllerOptions::default(),
            infrastructure: ControllerOptions::default(),
            worker: ControllerOptions::default(),
            healthcheck: ControllerOptions::default(),
            heartbeat: HeartbeatOptions::default(),
            config: ConfigOptions::default(),
            controller_switches: ControllerSwitchOptions::new(CONTROLLER_NAMES),
            reconciler: ReconcilerOptions::default(),
            webhook: WebhookOptions::new(WEBHOOK_NAMES),
        }
    }
}

impl ExtensionOptions {
    /// All groups, controller options under their controller's prefix
    pub fn aggregator(&mut self) -> OptionAggregator<'_> {
        OptionAggregator::new()
            .with(&mut self.general)
            .with(&mut self.rest)
            .with(&mut self.manager)
            .with(Prefixed::new("controlplane-", &mut self.controlplane))
            .with(Prefixed::new("infrastructure-", &mut self.infrastructure))
            .with(Prefixed::new("worker-", &mut self.worker))
            .with(Prefixed::new("healthcheck-", &mut self.healthcheck))
            .with(Prefixed::new(HEARTBEAT_PREFIX, &mut self.heartbeat))
            .with(&mut self.config)
            .with(&mut self.controller_switches)
            .with(&mut self.reconciler)
            .with(&mut self.webhook)
    }

    /// Command line of the binary `name`
    pub fn command(&mut self, name: &'static str) -> Command {
        let cmd = Command::new(name)
            .version(clap::crate_version!())
            .about("Gardener extension controller manager for the ironcore-metal provider");
        self.aggregator().augment_args(cmd)
    }

    /// Copy parsed values into every group
    pub fn update_from_matches(&mut self, matches: &ArgMatches) {
        self.aggregator().update_from_matches(matches)
    }

    /// Complete every group in registration order
    pub fn complete(&mut self) -> Result<(), OptionsError> {
        self.aggregator().complete()
    }
}

/// Id and long name of a prefixed flag
pub(crate) fn flag(prefix: &str, name: &str) -> String {
    format!("{prefix}{name}")
}

/// Completed form, or [`OptionsError::NotCompleted`]
pub(crate) fn completed<'a, T>(value: &'a Option<T>, group: &str) -> Result<&'a T, OptionsError> {
    value
        .as_ref()
        .ok_or_else(|| OptionsError::NotCompleted(group.to_string()))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use clap::Arg;
    use metal_common::Error;

    /// Parse `args` (without the binary name) against `cmd`
    pub(crate) fn matches(cmd: Command, args: &[&str]) -> ArgMatches {
        let argv = std::iter::once("test").chain(args.iter().copied());
        cmd.try_get_matches_from(argv).unwrap()
    }

    #[derive(Default)]
    struct Limit {
        raw: i64,
        completed: Option<u16>,
    }

    impl OptionGroup for Limit {
        fn name(&self) -> String {
            "limit".to_string()
        }

        fn augment_args(&self, cmd: Command, prefix: &str) -> Command {
            cmd.arg(
                Arg::new(flag(prefix, "limit"))
                    .long(flag(prefix, "limit"))
                    .value_parser(clap::value_parser!(i64))
                    .default_value("1"),
            )
        }

        fn update_from_matches(&mut self, matches: &ArgMatches, prefix: &str) {
            if let Some(v) = matches.get_one::<i64>(&flag(prefix, "limit")) {
                self.raw = *v;
            }
        }

        fn complete(&mut self) -> Result<(), Error> {
            let value = u16::try_from(self.raw)
                .ok()
                .filter(|v| *v > 0)
                .ok_or_else(|| Error::validation("limit must be positive"))?;
            self.completed = Some(value);
            Ok(())
        }
    }

    #[test]
    fn prefixes_namespace_flags_and_error_names() {
        let mut worker = Limit::default();
        let mut infra = Limit::default();
        let mut agg = OptionAggregator::new()
            .with(Prefixed::new("worker-", &mut worker))
            .with(Prefixed::new("infrastructure-", &mut infra));
        let cmd = agg.augment_args(Command::new("test"));
        agg.update_from_matches(&matches(cmd, &["--worker-limit", "4", "--infrastructure-limit", "0"]));

        let err = agg.complete().unwrap_err();
        assert!(matches!(&err, OptionsError::Group { group, .. } if group == "infrastructure-limit"));
        drop(agg);
        assert_eq!(worker.completed, Some(4));
        assert_eq!(infra.completed, None);
    }

    #[test]
    fn completion_is_repeatable() {
        let mut limit = Limit { raw: 3, completed: None };
        limit.complete().unwrap();
        let first = limit.completed;
        limit.complete().unwrap();
        assert_eq!(limit.completed, first);
    }

    fn config_file() -> tempfile::NamedTempFile {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "apiVersion: {}\nkind: {}\n",
            metal_common::apis::config::API_VERSION,
            metal_common::apis::config::KIND
        )
        .unwrap();
        file
    }

    fn extension_args(config: &std::path::Path) -> Vec<String> {
        [
            "--garden-kubeconfig",
            "/var/run/garden/kubeconfig",
            "--leader-election-namespace",
            "garden",
            "--heartbeat-namespace",
            "garden",
            "--webhook-config-namespace",
            "garden",
            "--worker-max-concurrent-reconciles",
            "9",
            "--disable-controllers",
            "healthcheck",
            "--config-file",
        ]
        .iter()
        .map(|s| s.to_string())
        .chain(std::iter::once(config.display().to_string()))
        .collect()
    }

    #[test]
    fn completion_is_independent_of_registration_order() {
        let config = config_file();
        let args = extension_args(config.path());
        let args: Vec<&str> = args.iter().map(String::as_str).collect();

        let mut forward = ExtensionOptions::default();
        let cmd = forward.command("test");
        let parsed = matches(cmd, &args);
        forward.update_from_matches(&parsed);
        forward.complete().unwrap();

        let mut reverse = ExtensionOptions::default();
        {
            let r = &mut reverse;
            let mut agg = OptionAggregator::new()
                .with(&mut r.webhook)
                .with(&mut r.reconciler)
                .with(&mut r.controller_switches)
                .with(&mut r.config)
                .with(Prefixed::new(HEARTBEAT_PREFIX, &mut r.heartbeat))
                .with(Prefixed::new("healthcheck-", &mut r.healthcheck))
                .with(Prefixed::new("worker-", &mut r.worker))
                .with(Prefixed::new("infrastructure-", &mut r.infrastructure))
                .with(Prefixed::new("controlplane-", &mut r.controlplane))
                .with(&mut r.manager)
                .with(&mut r.rest)
                .with(&mut r.general);
            let cmd = agg.augment_args(Command::new("test"));
            agg.update_from_matches(&matches(cmd, &args));
            agg.complete().unwrap();
        }

        assert_eq!(forward.general.completed().unwrap(), reverse.general.completed().unwrap());
        assert_eq!(forward.rest.completed().unwrap(), reverse.rest.completed().unwrap());
        assert_eq!(forward.manager.completed().unwrap(), reverse.manager.completed().unwrap());
        assert_eq!(forward.worker.completed().unwrap(), reverse.worker.completed().unwrap());
        assert_eq!(forward.controlplane.completed().unwrap(), reverse.controlplane.completed().unwrap());
        assert_eq!(forward.heartbeat.completed().unwrap(), reverse.heartbeat.completed().unwrap());
        assert_eq!(forward.config.completed().unwrap(), reverse.config.completed().unwrap());
        assert_eq!(
            forward.controller_switches.completed().unwrap(),
            reverse.controller_switches.completed().unwrap()
        );
        assert_eq!(forward.reconciler.completed().unwrap(), reverse.reconciler.completed().unwrap());
        assert_eq!(forward.webhook.completed().unwrap(), reverse.webhook.completed().unwrap());
        assert_eq!(forward.worker.completed().unwrap().max_concurrent_reconciles, 9);
        assert_eq!(forward.infrastructure.completed().unwrap().max_concurrent_reconciles, 5);
    }

    #[test]
    fn heartbeat_flags_come_from_the_prefix_wrapper() {
        let config = config_file();
        let mut args = extension_args(config.path());
        args.extend(["--heartbeat-renew-interval-seconds".to_string(), "7".to_string()]);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();

        let mut options = ExtensionOptions::default();
        let cmd = options.command("test");
        assert!(cmd.get_arguments().any(|a| a.get_long() == Some("heartbeat-namespace")));
        assert!(!cmd.get_arguments().any(|a| a.get_long() == Some("namespace")));
        options.update_from_matches(&matches(cmd, &args));
        options.complete().unwrap();

        assert_eq!(options.heartbeat.completed().unwrap().renew_interval_seconds, 7);
        assert_eq!(Prefixed::new(HEARTBEAT_PREFIX, HeartbeatOptions::default()).name(), "heartbeat-lease");
    }

    #[test]
    fn version_flag_short_circuits() {
        let mut options = ExtensionOptions::default();
        let err = options
            .command("test")
            .try_get_matches_from(["test", "--version"])
            .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayVersion);
    }

    #[test]
    fn reading_before_completion_fails() {
        let value: Option<u16> = None;
        assert!(matches!(completed(&value, "limit"), Err(OptionsError::NotCompleted(g)) if g == "limit"));
    }
}
