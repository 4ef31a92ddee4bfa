//! General, REST and manager options

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use kube::api::GroupVersionKind;
use metal_common::leader_election::leader_election_id;
use metal_common::{Error, GARDEN_KUBECONFIG_ENV, LEADER_ELECTION_NAMESPACE_ENV, PROVIDER_NAME};

use super::{completed, flag, OptionGroup, OptionsError};

/// Default metrics endpoint
pub const DEFAULT_METRICS_BIND_ADDRESS: &str = ":8080";
/// Default health probe endpoint
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = ":8081";
/// Default webhook server port
pub const DEFAULT_WEBHOOK_SERVER_PORT: u16 = 443;
/// Default webhook certificate directory
pub const DEFAULT_WEBHOOK_CERT_DIR: &str = "/tmp/gardener-extensions-cert";
/// Default graceful shutdown timeout
pub const DEFAULT_GRACEFUL_SHUTDOWN_TIMEOUT: &str = "30s";

/// Gardener version and garden access
#[derive(Clone, Debug, Default)]
pub struct GeneralOptions {
    /// Version of the Gardener installation
    pub gardener_version: Option<String>,
    /// Garden kubeconfig path
    pub garden_kubeconfig: Option<PathBuf>,
    completed: Option<CompletedGeneralOptions>,
}

/// Completed general options
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletedGeneralOptions {
    /// Version of the Gardener installation, if known
    pub gardener_version: Option<String>,
    /// Garden kubeconfig path
    pub garden_kubeconfig: PathBuf,
}

impl GeneralOptions {
    /// Completed form
    pub fn completed(&self) -> Result<&CompletedGeneralOptions, OptionsError> {
        completed(&self.completed, "general")
    }
}

impl OptionGroup for GeneralOptions {
    fn name(&self) -> String {
        "general".to_string()
    }

    fn augment_args(&self, cmd: Command, prefix: &str) -> Command {
        cmd.arg(
            Arg::new(flag(prefix, "gardener-version"))
                .long(flag(prefix, "gardener-version"))
                .help("Version of the Gardener installation"),
        )
        .arg(
            Arg::new(flag(prefix, "garden-kubeconfig"))
                .long(flag(prefix, "garden-kubeconfig"))
                .env(GARDEN_KUBECONFIG_ENV)
                .value_parser(value_parser!(PathBuf))
                .help("Kubeconfig of the garden cluster"),
        )
    }

    fn update_from_matches(&mut self, matches: &ArgMatches, prefix: &str) {
        self.gardener_version = matches
            .get_one::<String>(&flag(prefix, "gardener-version"))
            .cloned();
        self.garden_kubeconfig = matches
            .get_one::<PathBuf>(&flag(prefix, "garden-kubeconfig"))
            .cloned();
    }

    fn complete(&mut self) -> Result<(), Error> {
        let garden_kubeconfig = self
            .garden_kubeconfig
            .clone()
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or_else(|| {
                Error::validation(format!(
                    "garden kubeconfig is required (--garden-kubeconfig or {GARDEN_KUBECONFIG_ENV})"
                ))
            })?;
        self.completed = Some(CompletedGeneralOptions {
            gardener_version: self.gardener_version.clone(),
            garden_kubeconfig,
        });
        Ok(())
    }
}

/// Connection to the seed API server
#[derive(Clone, Debug, Default)]
pub struct RestOptions {
    /// Kubeconfig path; inferred when unset
    pub kubeconfig: Option<PathBuf>,
    /// API server URL overriding the kubeconfig
    pub master: Option<String>,
    completed: Option<CompletedRestOptions>,
}

/// Completed REST options
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletedRestOptions {
    /// Kubeconfig path; inferred when unset
    pub kubeconfig: Option<PathBuf>,
    /// API server URL overriding the kubeconfig
    pub master: Option<http::Uri>,
}

impl RestOptions {
    /// Completed form
    pub fn completed(&self) -> Result<&CompletedRestOptions, OptionsError> {
        completed(&self.completed, "rest")
    }
}

impl OptionGroup for RestOptions {
    fn name(&self) -> String {
        "rest".to_string()
    }

    fn augment_args(&self, cmd: Command, prefix: &str) -> Command {
        cmd.arg(
            Arg::new(flag(prefix, "kubeconfig"))
                .long(flag(prefix, "kubeconfig"))
                .env("KUBECONFIG")
                .value_parser(value_parser!(PathBuf))
                .help("Kubeconfig of the seed cluster; in-cluster config when unset"),
        )
        .arg(
            Arg::new(flag(prefix, "master"))
                .long(flag(prefix, "master"))
                .help("Seed API server URL, overrides the kubeconfig"),
        )
    }

    fn update_from_matches(&mut self, matches: &ArgMatches, prefix: &str) {
        self.kubeconfig = matches
            .get_one::<PathBuf>(&flag(prefix, "kubeconfig"))
            .cloned();
        self.master = matches.get_one::<String>(&flag(prefix, "master")).cloned();
    }

    fn complete(&mut self) -> Result<(), Error> {
        let master = match self.master.as_deref().filter(|m| !m.is_empty()) {
            None => None,
            Some(raw) => {
                let uri: http::Uri = raw
                    .parse()
                    .map_err(|e| Error::validation_for_field("rest", "master", format!("{raw}: {e}")))?;
                if uri.scheme().is_none() || uri.authority().is_none() {
                    return Err(Error::validation_for_field(
                        "rest",
                        "master",
                        format!("{raw} is not an absolute URL"),
                    ));
                }
                Some(uri)
            }
        };
        self.completed = Some(CompletedRestOptions {
            kubeconfig: self.kubeconfig.clone().filter(|p| !p.as_os_str().is_empty()),
            master,
        });
        Ok(())
    }
}

/// Leader election, servers and shutdown
#[derive(Clone, Debug)]
pub struct ManagerOptions {
    /// Compete for the leader lease
    pub leader_election: bool,
    /// Lease name
    pub leader_election_id: String,
    /// Lease namespace
    pub leader_election_namespace: String,
    /// Metrics endpoint, `0` disables it
    pub metrics_bind_address: String,
    /// Health endpoint, `0` disables it
    pub health_bind_address: String,
    /// Webhook server port
    pub webhook_server_port: u16,
    /// Webhook certificate directory
    pub webhook_cert_dir: PathBuf,
    /// Graceful shutdown timeout, humantime syntax
    pub graceful_shutdown_timeout: String,
    completed: Option<CompletedManagerOptions>,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            leader_election: true,
            leader_election_id: leader_election_id(PROVIDER_NAME),
            leader_election_namespace: String::new(),
            metrics_bind_address: DEFAULT_METRICS_BIND_ADDRESS.to_string(),
            health_bind_address: DEFAULT_HEALTH_BIND_ADDRESS.to_string(),
            webhook_server_port: DEFAULT_WEBHOOK_SERVER_PORT,
            webhook_cert_dir: PathBuf::from(DEFAULT_WEBHOOK_CERT_DIR),
            graceful_shutdown_timeout: DEFAULT_GRACEFUL_SHUTDOWN_TIMEOUT.to_string(),
            completed: None,
        }
    }
}

/// Completed manager options
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletedManagerOptions {
    /// Compete for the leader lease
    pub leader_election: bool,
    /// Lease name
    pub leader_election_id: String,
    /// Lease namespace
    pub leader_election_namespace: String,
    /// Metrics endpoint
    pub metrics_addr: Option<SocketAddr>,
    /// Health endpoint
    pub health_addr: Option<SocketAddr>,
    /// Webhook server port
    pub webhook_port: u16,
    /// Webhook certificate directory
    pub webhook_cert_dir: PathBuf,
    /// Graceful shutdown timeout
    pub graceful_shutdown_timeout: Duration,
}

impl CompletedManagerOptions {
    /// Runtime settings for the manager; reads of `uncached` kinds bypass the cache
    pub fn manager_options(&self, uncached: Vec<GroupVersionKind>) -> metal_runtime::ManagerOptions {
        metal_runtime::ManagerOptions {
            metrics_addr: self.metrics_addr,
            health_addr: self.health_addr,
            webhook_port: self.webhook_port,
            webhook_cert_dir: self.webhook_cert_dir.clone(),
            graceful_shutdown_timeout: self.graceful_shutdown_timeout,
            uncached,
        }
    }
}

impl ManagerOptions {
    /// Completed form
    pub fn completed(&self) -> Result<&CompletedManagerOptions, OptionsError> {
        completed(&self.completed, "manager")
    }
}

/// Parse a bind address; `:port` binds all interfaces, `0` or empty disables
pub fn parse_bind_address(raw: &str) -> Result<Option<SocketAddr>, String> {
    let raw = raw.trim();
    if raw.is_empty() || raw == "0" {
        return Ok(None);
    }
    if let Some(port) = raw.strip_prefix(':') {
        let port: u16 = port.parse().map_err(|e| format!("invalid port in {raw:?}: {e}"))?;
        return Ok(Some(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))));
    }
    raw.parse()
        .map(Some)
        .map_err(|e| format!("invalid address {raw:?}: {e}"))
}

impl OptionGroup for ManagerOptions {
    fn name(&self) -> String {
        "manager".to_string()
    }

    fn augment_args(&self, cmd: Command, prefix: &str) -> Command {
        cmd.arg(
            Arg::new(flag(prefix, "leader-election"))
                .long(flag(prefix, "leader-election"))
                .value_parser(value_parser!(bool))
                .num_args(0..=1)
                .default_value(self.leader_election.to_string())
                .default_missing_value("true")
                .action(ArgAction::Set)
                .help("Compete for the leader lease before running controllers"),
        )
        .arg(
            Arg::new(flag(prefix, "leader-election-id"))
                .long(flag(prefix, "leader-election-id"))
                .default_value(self.leader_election_id.clone())
                .help("Name of the leader lease"),
        )
        .arg(
            Arg::new(flag(prefix, "leader-election-namespace"))
                .long(flag(prefix, "leader-election-namespace"))
                .env(LEADER_ELECTION_NAMESPACE_ENV)
                .help("Namespace of the leader lease"),
        )
        .arg(
            Arg::new(flag(prefix, "metrics-bind-address"))
                .long(flag(prefix, "metrics-bind-address"))
                .default_value(self.metrics_bind_address.clone())
                .help("Metrics endpoint address; 0 disables it"),
        )
        .arg(
            Arg::new(flag(prefix, "health-bind-address"))
                .long(flag(prefix, "health-bind-address"))
                .default_value(self.health_bind_address.clone())
                .help("Health probe address; 0 disables it"),
        )
        .arg(
            Arg::new(flag(prefix, "webhook-server-port"))
                .long(flag(prefix, "webhook-server-port"))
                .value_parser(value_parser!(u16))
                .default_value(self.webhook_server_port.to_string())
                .help("Port of the admission webhook server"),
        )
        .arg(
            Arg::new(flag(prefix, "webhook-cert-dir"))
                .long(flag(prefix, "webhook-cert-dir"))
                .value_parser(value_parser!(PathBuf))
                .default_value(self.webhook_cert_dir.display().to_string())
                .help("Directory holding tls.crt, tls.key and ca.crt"),
        )
        .arg(
            Arg::new(flag(prefix, "graceful-shutdown-timeout"))
                .long(flag(prefix, "graceful-shutdown-timeout"))
                .default_value(self.graceful_shutdown_timeout.clone())
                .help("Time allowed for stopping all runnables"),
        )
    }

    fn update_from_matches(&mut self, matches: &ArgMatches, prefix: &str) {
        let string = |name: &str| matches.get_one::<String>(&flag(prefix, name)).cloned();

        if let Some(v) = matches.get_one::<bool>(&flag(prefix, "leader-election")) {
            self.leader_election = *v;
        }
        if let Some(v) = string("leader-election-id") {
            self.leader_election_id = v;
        }
        if let Some(v) = string("leader-election-namespace") {
            self.leader_election_namespace = v;
        }
        if let Some(v) = string("metrics-bind-address") {
            self.metrics_bind_address = v;
        }
        if let Some(v) = string("health-bind-address") {
            self.health_bind_address = v;
        }
        if let Some(v) = matches.get_one::<u16>(&flag(prefix, "webhook-server-port")) {
            self.webhook_server_port = *v;
        }
        if let Some(v) = matches.get_one::<PathBuf>(&flag(prefix, "webhook-cert-dir")) {
            self.webhook_cert_dir = v.clone();
        }
        if let Some(v) = string("graceful-shutdown-timeout") {
            self.graceful_shutdown_timeout = v;
        }
    }

    fn complete(&mut self) -> Result<(), Error> {
        let field = |name: &str, msg: String| Error::validation_for_field("manager", name, msg);

        let metrics_addr = parse_bind_address(&self.metrics_bind_address)
            .map_err(|e| field("metrics-bind-address", e))?;
        let health_addr = parse_bind_address(&self.health_bind_address)
            .map_err(|e| field("health-bind-address", e))?;
        if self.webhook_server_port == 0 {
            return Err(field("webhook-server-port", "must not be 0".to_string()));
        }
        let graceful_shutdown_timeout = humantime::parse_duration(&self.graceful_shutdown_timeout)
            .map_err(|e| field("graceful-shutdown-timeout", format!("{:?}: {e}", self.graceful_shutdown_timeout)))?;
        if self.leader_election {
            if self.leader_election_id.is_empty() {
                return Err(field("leader-election-id", "must not be empty".to_string()));
            }
            if self.leader_election_namespace.is_empty() {
                return Err(field(
                    "leader-election-namespace",
                    format!("required with leader election (or {LEADER_ELECTION_NAMESPACE_ENV})"),
                ));
            }
        }

        self.completed = Some(CompletedManagerOptions {
            leader_election: self.leader_election,
            leader_election_id: self.leader_election_id.clone(),
            leader_election_namespace: self.leader_election_namespace.clone(),
            metrics_addr,
            health_addr,
            webhook_port: self.webhook_server_port,
            webhook_cert_dir: self.webhook_cert_dir.clone(),
            graceful_shutdown_timeout,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::tests::matches;
    use crate::options::OptionAggregator;
    use rstest::rstest;

    fn parse_manager(args: &[&str]) -> ManagerOptions {
        let mut options = ManagerOptions::default();
        let cmd = options.augment_args(Command::new("test"), "");
        options.update_from_matches(&matches(cmd, args), "");
        options
    }

    #[rstest]
    #[case(":8080", Some("0.0.0.0:8080"))]
    #[case("127.0.0.1:9090", Some("127.0.0.1:9090"))]
    #[case("0", None)]
    #[case("", None)]
    fn bind_addresses(#[case] raw: &str, #[case] expected: Option<&str>) {
        let expected = expected.map(|e| e.parse::<SocketAddr>().unwrap());
        assert_eq!(parse_bind_address(raw).unwrap(), expected);
    }

    #[test]
    fn bad_bind_address_is_rejected() {
        assert!(parse_bind_address(":http").is_err());
        assert!(parse_bind_address("localhost").is_err());
    }

    #[test]
    fn defaults_complete_with_lease_namespace() {
        let mut options = parse_manager(&["--leader-election-namespace", "garden"]);
        options.complete().unwrap();
        let c = options.completed().unwrap();

        assert!(c.leader_election);
        assert_eq!(c.leader_election_id, "provider-ironcore-metal-leader-election");
        assert_eq!(c.metrics_addr, Some("0.0.0.0:8080".parse().unwrap()));
        assert_eq!(c.health_addr, Some("0.0.0.0:8081".parse().unwrap()));
        assert_eq!(c.webhook_port, 443);
        assert_eq!(c.webhook_cert_dir, PathBuf::from("/tmp/gardener-extensions-cert"));
        assert_eq!(c.graceful_shutdown_timeout, Duration::from_secs(30));
    }

    #[test]
    fn leader_election_can_be_switched_off() {
        let mut options = parse_manager(&["--leader-election=false", "--graceful-shutdown-timeout", "1m30s"]);
        options.complete().unwrap();
        let c = options.completed().unwrap();
        assert!(!c.leader_election);
        assert_eq!(c.graceful_shutdown_timeout, Duration::from_secs(90));
    }

    #[rstest]
    #[case::lease_namespace_missing(&["--leader-election-namespace", ""])]
    #[case::zero_port(&["--leader-election=false", "--webhook-server-port", "0"])]
    #[case::bad_timeout(&["--leader-election=false", "--graceful-shutdown-timeout", "soon"])]
    #[case::bad_metrics(&["--leader-election=false", "--metrics-bind-address", "nowhere"])]
    fn invalid_manager_options(#[case] args: &[&str]) {
        let mut options = parse_manager(args);
        assert!(options.complete().is_err());
        assert!(matches!(options.completed(), Err(OptionsError::NotCompleted(_))));
    }

    #[test]
    fn master_must_be_absolute() {
        let mut rest = RestOptions {
            master: Some("api.seed.local".to_string()),
            ..Default::default()
        };
        assert!(rest.complete().is_err());

        rest.master = Some("https://api.seed.local:6443".to_string());
        rest.complete().unwrap();
        let master = rest.completed().unwrap().master.clone().unwrap();
        assert_eq!(master.host(), Some("api.seed.local"));
    }

    #[test]
    fn garden_kubeconfig_is_required() {
        let mut agg_general = GeneralOptions::default();
        let mut agg = OptionAggregator::new().with(&mut agg_general);
        let err = agg.complete().unwrap_err();
        assert!(matches!(err, OptionsError::Group { ref group, .. } if group == "general"));
        assert!(err.to_string().contains("garden kubeconfig"));
    }
}
