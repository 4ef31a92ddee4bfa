//! Webhook server namespace and switches

use std::collections::BTreeSet;

use clap::{Arg, ArgAction, ArgMatches, Command};
use metal_common::{Error, WEBHOOK_CONFIG_NAMESPACE_ENV};
use metal_extension::{RegistrationError, Webhook, WebhookNamespace, WebhookServerConfig, WebhookSwitches};
use metal_runtime::Manager;

use super::controller::disabled_set;
use super::{completed, flag, OptionGroup, OptionsError};

/// Webhook options
#[derive(Clone, Debug)]
pub struct WebhookOptions {
    known: Vec<&'static str>,
    /// Namespace of the webhook server and its Service
    pub namespace: String,
    /// Raw disabled webhook names
    pub disabled: Vec<String>,
    completed: Option<CompletedWebhookOptions>,
}

/// Completed webhook options
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletedWebhookOptions {
    /// Namespace of the webhook server and its Service
    pub namespace: String,
    /// Names of disabled webhooks
    pub disabled: BTreeSet<String>,
}

impl CompletedWebhookOptions {
    /// Register the enabled webhooks of `switches` on `mgr`
    ///
    /// The Service port is the webhook server port; the namespace is
    /// published into `published` once a webhook is registered.
    pub fn add_to_manager(
        &self,
        mgr: &mut Manager,
        switches: &WebhookSwitches,
        published: &WebhookNamespace,
    ) -> Result<Vec<Webhook>, RegistrationError> {
        let server = WebhookServerConfig {
            namespace: self.namespace.clone(),
            port: mgr.options().webhook_port,
        };
        switches.add_to_manager(mgr, &self.disabled, &server, published)
    }
}

impl WebhookOptions {
    /// Options over the webhooks named `known`
    pub fn new(known: &[&'static str]) -> Self {
        Self {
            known: known.to_vec(),
            namespace: String::new(),
            disabled: Vec::new(),
            completed: None,
        }
    }

    /// Completed form
    pub fn completed(&self) -> Result<&CompletedWebhookOptions, OptionsError> {
        completed(&self.completed, "webhook")
    }
}

impl OptionGroup for WebhookOptions {
    fn name(&self) -> String {
        "webhook".to_string()
    }

    fn augment_args(&self, cmd: Command, prefix: &str) -> Command {
        cmd.arg(
            Arg::new(flag(prefix, "webhook-config-namespace"))
                .long(flag(prefix, "webhook-config-namespace"))
                .env(WEBHOOK_CONFIG_NAMESPACE_ENV)
                .help("Namespace of the webhook server Service"),
        )
        .arg(
            Arg::new(flag(prefix, "disable-webhooks"))
                .long(flag(prefix, "disable-webhooks"))
                .value_delimiter(',')
                .action(ArgAction::Append)
                .help(format!("Webhooks to disable, any of: {}", self.known.join(", "))),
        )
    }

    fn update_from_matches(&mut self, matches: &ArgMatches, prefix: &str) {
        self.namespace = matches
            .get_one::<String>(&flag(prefix, "webhook-config-namespace"))
            .cloned()
            .unwrap_or_default();
        self.disabled = matches
            .get_many::<String>(&flag(prefix, "disable-webhooks"))
            .map(|values| values.cloned().collect())
            .unwrap_or_default();
    }

    fn complete(&mut self) -> Result<(), Error> {
        let disabled = disabled_set("webhook", "disable-webhooks", &self.disabled, &self.known)?;
        let any_enabled = self.known.iter().any(|name| !disabled.contains(*name));
        if any_enabled && self.namespace.is_empty() {
            return Err(Error::validation_for_field(
                "webhook",
                "webhook-config-namespace",
                format!("required while webhooks are enabled (or {WEBHOOK_CONFIG_NAMESPACE_ENV})"),
            ));
        }
        self.completed = Some(CompletedWebhookOptions {
            namespace: self.namespace.clone(),
            disabled,
        });
        Ok(())
    }
}
