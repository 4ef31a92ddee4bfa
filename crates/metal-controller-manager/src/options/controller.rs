//! Controller-facing option groups

use std::collections::BTreeSet;
use std::path::PathBuf;

use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use metal_common::apis::config::{self, ControllerConfiguration, HealthCheckConfig};
use metal_common::{Error, LEADER_ELECTION_NAMESPACE_ENV, PROVIDER_NAME};
use metal_extension::controller::heartbeat;
use metal_extension::controller::DEFAULT_MAX_CONCURRENT_RECONCILES;
use metal_extension::ControllerConfig;

use super::{completed, flag, OptionGroup, OptionsError};

/// Flag prefix of the heartbeat options
pub const HEARTBEAT_PREFIX: &str = "heartbeat-";

/// Concurrency of one controller; registered under that controller's prefix
#[derive(Clone, Debug)]
pub struct ControllerOptions {
    /// Upper bound of concurrent reconciliations
    pub max_concurrent_reconciles: i64,
    completed: Option<CompletedControllerOptions>,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            max_concurrent_reconciles: i64::from(DEFAULT_MAX_CONCURRENT_RECONCILES),
            completed: None,
        }
    }
}

/// Completed controller options
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompletedControllerOptions {
    /// Upper bound of concurrent reconciliations
    pub max_concurrent_reconciles: u16,
}

impl CompletedControllerOptions {
    /// Write the settings into a controller's runtime config
    pub fn apply(&self, config: &mut ControllerConfig) {
        config.max_concurrent_reconciles = self.max_concurrent_reconciles;
    }
}

impl ControllerOptions {
    /// Completed form
    pub fn completed(&self) -> Result<&CompletedControllerOptions, OptionsError> {
        completed(&self.completed, "controller")
    }
}

impl OptionGroup for ControllerOptions {
    fn name(&self) -> String {
        "controller".to_string()
    }

    fn augment_args(&self, cmd: Command, prefix: &str) -> Command {
        cmd.arg(
            Arg::new(flag(prefix, "max-concurrent-reconciles"))
                .long(flag(prefix, "max-concurrent-reconciles"))
                .value_parser(value_parser!(i64))
                .default_value(self.max_concurrent_reconciles.to_string())
                .help("Maximum number of concurrent reconciliations"),
        )
    }

    fn update_from_matches(&mut self, matches: &ArgMatches, prefix: &str) {
        if let Some(v) = matches.get_one::<i64>(&flag(prefix, "max-concurrent-reconciles")) {
            self.max_concurrent_reconciles = *v;
        }
    }

    fn complete(&mut self) -> Result<(), Error> {
        let max_concurrent_reconciles = u16::try_from(self.max_concurrent_reconciles)
            .ok()
            .filter(|v| *v > 0)
            .ok_or_else(|| {
                Error::validation_for_field(
                    "controller",
                    "max-concurrent-reconciles",
                    format!("must be between 1 and {}, got {}", u16::MAX, self.max_concurrent_reconciles),
                )
            })?;
        self.completed = Some(CompletedControllerOptions {
            max_concurrent_reconciles,
        });
        Ok(())
    }
}

/// Whether reconciliation waits for the operation annotation
#[derive(Clone, Debug, Default)]
pub struct ReconcilerOptions {
    /// Reconcile on every change
    pub ignore_operation_annotation: bool,
    completed: Option<CompletedReconcilerOptions>,
}

/// Completed reconciler options
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompletedReconcilerOptions {
    /// Reconcile on every change
    pub ignore_operation_annotation: bool,
}

impl CompletedReconcilerOptions {
    /// Write the setting into a controller's add options
    pub fn apply(&self, ignore_operation_annotation: &mut bool) {
        *ignore_operation_annotation = self.ignore_operation_annotation;
    }
}

impl ReconcilerOptions {
    /// Completed form
    pub fn completed(&self) -> Result<&CompletedReconcilerOptions, OptionsError> {
        completed(&self.completed, "reconciler")
    }
}

impl OptionGroup for ReconcilerOptions {
    fn name(&self) -> String {
        "reconciler".to_string()
    }

    fn augment_args(&self, cmd: Command, prefix: &str) -> Command {
        cmd.arg(
            Arg::new(flag(prefix, "ignore-operation-annotation"))
                .long(flag(prefix, "ignore-operation-annotation"))
                .value_parser(value_parser!(bool))
                .num_args(0..=1)
                .default_value(self.ignore_operation_annotation.to_string())
                .default_missing_value("true")
                .action(ArgAction::Set)
                .help("Reconcile on every change instead of waiting for the operation annotation"),
        )
    }

    fn update_from_matches(&mut self, matches: &ArgMatches, prefix: &str) {
        if let Some(v) = matches.get_one::<bool>(&flag(prefix, "ignore-operation-annotation")) {
            self.ignore_operation_annotation = *v;
        }
    }

    fn complete(&mut self) -> Result<(), Error> {
        self.completed = Some(CompletedReconcilerOptions {
            ignore_operation_annotation: self.ignore_operation_annotation,
        });
        Ok(())
    }
}

/// Heartbeat lease settings, registered under [`HEARTBEAT_PREFIX`]
#[derive(Clone, Debug)]
pub struct HeartbeatOptions {
    /// Holder written into the lease
    pub extension_name: String,
    /// Seconds between renewals
    pub renew_interval_seconds: i32,
    /// Lease namespace
    pub namespace: String,
    completed: Option<CompletedHeartbeatOptions>,
}

impl Default for HeartbeatOptions {
    fn default() -> Self {
        Self {
            extension_name: PROVIDER_NAME.to_string(),
            renew_interval_seconds: heartbeat::DEFAULT_RENEW_INTERVAL_SECONDS,
            namespace: String::new(),
            completed: None,
        }
    }
}

/// Completed heartbeat options
///
/// Completion only copies; [`CompletedHeartbeatOptions::validate`] checks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletedHeartbeatOptions {
    /// Holder written into the lease
    pub extension_name: String,
    /// Seconds between renewals
    pub renew_interval_seconds: i32,
    /// Lease namespace
    pub namespace: String,
}

impl CompletedHeartbeatOptions {
    /// Reject settings the heartbeat controller cannot run with
    pub fn validate(&self) -> Result<(), Error> {
        if self.renew_interval_seconds <= 0 {
            return Err(Error::validation_for_field(
                "heartbeat",
                "renew-interval-seconds",
                format!("must be positive, got {}", self.renew_interval_seconds),
            ));
        }
        if self.extension_name.is_empty() {
            return Err(Error::validation_for_field(
                "heartbeat",
                "extension-name",
                "must not be empty",
            ));
        }
        if self.namespace.is_empty() {
            return Err(Error::validation_for_field(
                "heartbeat",
                "namespace",
                format!("must not be empty (--heartbeat-namespace or {LEADER_ELECTION_NAMESPACE_ENV})"),
            ));
        }
        Ok(())
    }

    /// Write the settings into the heartbeat controller's add options
    pub fn apply(&self, options: &mut heartbeat::AddOptions) {
        options.extension_name = self.extension_name.clone();
        options.renew_interval_seconds = self.renew_interval_seconds;
        options.namespace = self.namespace.clone();
    }
}

impl HeartbeatOptions {
    /// Completed form
    pub fn completed(&self) -> Result<&CompletedHeartbeatOptions, OptionsError> {
        completed(&self.completed, "heartbeat")
    }
}

impl OptionGroup for HeartbeatOptions {
    fn name(&self) -> String {
        "lease".to_string()
    }

    fn augment_args(&self, cmd: Command, prefix: &str) -> Command {
        cmd.arg(
            Arg::new(flag(prefix, "extension-name"))
                .long(flag(prefix, "extension-name"))
                .default_value(self.extension_name.clone())
                .help("Extension name written as the heartbeat lease holder"),
        )
        .arg(
            Arg::new(flag(prefix, "renew-interval-seconds"))
                .long(flag(prefix, "renew-interval-seconds"))
                .value_parser(value_parser!(i32))
                .allow_negative_numbers(true)
                .default_value(self.renew_interval_seconds.to_string())
                .help("Seconds between heartbeat lease renewals"),
        )
        .arg(
            Arg::new(flag(prefix, "namespace"))
                .long(flag(prefix, "namespace"))
                .env(LEADER_ELECTION_NAMESPACE_ENV)
                .help("Namespace of the heartbeat lease"),
        )
    }

    fn update_from_matches(&mut self, matches: &ArgMatches, prefix: &str) {
        if let Some(v) = matches.get_one::<String>(&flag(prefix, "extension-name")) {
            self.extension_name = v.clone();
        }
        if let Some(v) = matches.get_one::<i32>(&flag(prefix, "renew-interval-seconds")) {
            self.renew_interval_seconds = *v;
        }
        if let Some(v) = matches.get_one::<String>(&flag(prefix, "namespace")) {
            self.namespace = v.clone();
        }
    }

    fn complete(&mut self) -> Result<(), Error> {
        self.completed = Some(CompletedHeartbeatOptions {
            extension_name: self.extension_name.clone(),
            renew_interval_seconds: self.renew_interval_seconds,
            namespace: self.namespace.clone(),
        });
        Ok(())
    }
}

/// Controller configuration file
#[derive(Clone, Debug, Default)]
pub struct ConfigOptions {
    /// Path of the `ControllerConfiguration` file
    pub config_file: Option<PathBuf>,
    completed: Option<CompletedConfigOptions>,
}

/// Completed config options
#[derive(Clone, Debug, PartialEq)]
pub struct CompletedConfigOptions {
    /// Path the configuration was read from
    pub config_file: PathBuf,
    /// Decoded configuration
    pub config: ControllerConfiguration,
}

impl CompletedConfigOptions {
    /// Overwrite `health_check_config` when the file sets one
    pub fn apply_health_check_config(&self, health_check_config: &mut HealthCheckConfig) {
        if let Some(configured) = &self.config.health_check_config {
            *health_check_config = configured.clone();
        }
    }
}

impl ConfigOptions {
    /// Completed form
    pub fn completed(&self) -> Result<&CompletedConfigOptions, OptionsError> {
        completed(&self.completed, "config")
    }
}

impl OptionGroup for ConfigOptions {
    fn name(&self) -> String {
        "config".to_string()
    }

    fn augment_args(&self, cmd: Command, prefix: &str) -> Command {
        cmd.arg(
            Arg::new(flag(prefix, "config-file"))
                .long(flag(prefix, "config-file"))
                .value_parser(value_parser!(PathBuf))
                .help("Path of the controller configuration file"),
        )
    }

    fn update_from_matches(&mut self, matches: &ArgMatches, prefix: &str) {
        self.config_file = matches
            .get_one::<PathBuf>(&flag(prefix, "config-file"))
            .cloned();
    }

    fn complete(&mut self) -> Result<(), Error> {
        let config_file = self
            .config_file
            .clone()
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or_else(|| Error::validation_for_field("config", "config-file", "must be set"))?;
        let config = config::load(&config_file)?;
        self.completed = Some(CompletedConfigOptions { config_file, config });
        Ok(())
    }
}

/// Controllers to leave out
#[derive(Clone, Debug)]
pub struct ControllerSwitchOptions {
    known: Vec<&'static str>,
    /// Raw disabled names
    pub disabled: Vec<String>,
    completed: Option<CompletedSwitchOptions>,
}

/// Completed switch options
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompletedSwitchOptions {
    /// Names of disabled switches
    pub disabled: BTreeSet<String>,
}

impl ControllerSwitchOptions {
    /// Options over the switches named `known`
    pub fn new(known: &[&'static str]) -> Self {
        Self {
            known: known.to_vec(),
            disabled: Vec::new(),
            completed: None,
        }
    }

    /// Completed form
    pub fn completed(&self) -> Result<&CompletedSwitchOptions, OptionsError> {
        completed(&self.completed, "controller-switches")
    }
}

/// Trimmed, non-empty names from a comma separated flag, all of which must be known
pub(crate) fn disabled_set(
    group: &str,
    field: &str,
    raw: &[String],
    known: &[&'static str],
) -> Result<BTreeSet<String>, Error> {
    let mut disabled = BTreeSet::new();
    for name in raw.iter().map(|n| n.trim()).filter(|n| !n.is_empty()) {
        if !known.contains(&name) {
            return Err(Error::validation_for_field(
                group,
                field,
                format!("unknown name {name:?}, known: {}", known.join(", ")),
            ));
        }
        disabled.insert(name.to_string());
    }
    Ok(disabled)
}

impl OptionGroup for ControllerSwitchOptions {
    fn name(&self) -> String {
        "controller-switches".to_string()
    }

    fn augment_args(&self, cmd: Command, prefix: &str) -> Command {
        cmd.arg(
            Arg::new(flag(prefix, "disable-controllers"))
                .long(flag(prefix, "disable-controllers"))
                .value_delimiter(',')
                .action(ArgAction::Append)
                .help(format!("Controllers to disable, any of: {}", self.known.join(", "))),
        )
    }

    fn update_from_matches(&mut self, matches: &ArgMatches, prefix: &str) {
        self.disabled = matches
            .get_many::<String>(&flag(prefix, "disable-controllers"))
            .map(|values| values.cloned().collect())
            .unwrap_or_default();
    }

    fn complete(&mut self) -> Result<(), Error> {
        let disabled = disabled_set("controller-switches", "disable-controllers", &self.disabled, &self.known)?;
        self.completed = Some(CompletedSwitchOptions { disabled });
        Ok(())
    }
}
