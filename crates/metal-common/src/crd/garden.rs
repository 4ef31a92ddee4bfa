//! Garden resources (`core.gardener.cloud/v1beta1`) read by the extension

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Provider offering of a landscape: regions, machine types and images
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "core.gardener.cloud",
    version = "v1beta1",
    kind = "CloudProfile",
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.type"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CloudProfileSpec {
    /// Provider type
    #[serde(rename = "type")]
    pub profile_type: String,
    /// Provider specific profile configuration (`CloudProfileConfig`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_config: Option<Value>,
}
