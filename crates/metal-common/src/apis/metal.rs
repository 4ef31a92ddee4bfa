//! Provider API (`metal.provider.extensions.gardener.cloud/v1alpha1`)
//!
//! These objects travel inside the `providerConfig` and `providerStatus`
//! fields of extension resources and inside the CloudProfile.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{decode_embedded, encode_embedded};
use crate::Result;

/// API group of the provider types
pub const GROUP: &str = "metal.provider.extensions.gardener.cloud";

/// Group/version of the provider types
pub const API_VERSION: &str = "metal.provider.extensions.gardener.cloud/v1alpha1";

/// Architecture assumed when a pool or image does not name one
pub const DEFAULT_ARCHITECTURE: &str = "amd64";

/// Kinds defined by the provider API
pub const KINDS: &[&str] = &[
    InfrastructureConfig::KIND,
    InfrastructureStatus::KIND,
    ControlPlaneConfig::KIND,
    CloudProfileConfig::KIND,
    WorkerStatus::KIND,
];

/// Kinds that can be embedded in extension resources
pub trait ProviderObject: Serialize + for<'de> Deserialize<'de> {
    /// Object kind
    const KIND: &'static str;

    /// Decode from an embedded raw object
    fn decode(value: &Value) -> Result<Self> {
        decode_embedded(value, API_VERSION, Self::KIND)
    }

    /// Encode for embedding, stamping `apiVersion`/`kind`
    fn encode(&self) -> Result<Value> {
        encode_embedded(self, API_VERSION, Self::KIND)
    }
}

/// Reference to a network in the metal fabric
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRef {
    /// Network name
    pub name: String,
}

/// Provider configuration of an Infrastructure
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InfrastructureConfig {
    /// Network the shoot's machines are attached to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_ref: Option<NetworkRef>,
}

impl ProviderObject for InfrastructureConfig {
    const KIND: &'static str = "InfrastructureConfig";
}

/// Provider status of an Infrastructure
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InfrastructureStatus {
    /// Network in use
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_ref: Option<NetworkRef>,
}

impl ProviderObject for InfrastructureStatus {
    const KIND: &'static str = "InfrastructureStatus";
}

/// Cloud controller manager settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CloudControllerManagerConfig {
    /// Feature gates passed to the cloud controller manager
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub feature_gates: BTreeMap<String, bool>,
}

/// Provider configuration of a ControlPlane
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneConfig {
    /// Cloud controller manager settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_controller_manager: Option<CloudControllerManagerConfig>,
}

impl ProviderObject for ControlPlaneConfig {
    const KIND: &'static str = "ControlPlaneConfig";
}

/// One version of a machine image offered by the profile
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MachineImageVersion {
    /// Logical version
    pub version: String,
    /// Image reference (OCI path)
    pub image: String,
    /// CPU architecture of the image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
}

/// A machine image with its provider-specific versions
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MachineImages {
    /// Logical image name
    pub name: String,
    /// Available versions
    #[serde(default)]
    pub versions: Vec<MachineImageVersion>,
}

/// Provider configuration of a CloudProfile
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CloudProfileConfig {
    /// Mapping of logical images to provider images
    #[serde(default)]
    pub machine_images: Vec<MachineImages>,
}

impl ProviderObject for CloudProfileConfig {
    const KIND: &'static str = "CloudProfileConfig";
}

impl CloudProfileConfig {
    /// Resolve a logical image name/version/architecture to a provider image
    pub fn find_machine_image(
        &self,
        name: &str,
        version: &str,
        architecture: Option<&str>,
    ) -> Option<MachineImage> {
        let arch = architecture.unwrap_or(DEFAULT_ARCHITECTURE);
        self.machine_images
            .iter()
            .filter(|image| image.name == name)
            .flat_map(|image| image.versions.iter())
            .find(|v| {
                v.version == version
                    && v.architecture.as_deref().unwrap_or(DEFAULT_ARCHITECTURE) == arch
            })
            .map(|v| MachineImage {
                name: name.to_string(),
                version: version.to_string(),
                image: v.image.clone(),
                architecture: Some(arch.to_string()),
            })
    }
}

/// Machine images used by a Worker
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatus {
    /// Images in use; kept so versions removed from the profile still resolve
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub machine_images: Vec<MachineImage>,
}

impl ProviderObject for WorkerStatus {
    const KIND: &'static str = "WorkerStatus";
}

impl WorkerStatus {
    /// Find a previously recorded image
    pub fn find_machine_image(
        &self,
        name: &str,
        version: &str,
        architecture: Option<&str>,
    ) -> Option<&MachineImage> {
        let arch = architecture.unwrap_or(DEFAULT_ARCHITECTURE);
        self.machine_images.iter().find(|image| {
            image.name == name
                && image.version == version
                && image.architecture.as_deref().unwrap_or(DEFAULT_ARCHITECTURE) == arch
        })
    }

    /// Record an image unless an identical entry exists
    pub fn add_machine_image(&mut self, image: MachineImage) {
        if !self.machine_images.contains(&image) {
            self.machine_images.push(image);
        }
    }
}

/// Mapping from a logical image name/version to a metal image
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MachineImage {
    /// Logical image name
    pub name: String,
    /// Logical image version
    pub version: String,
    /// Image path
    pub image: String,
    /// CPU architecture
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn profile() -> CloudProfileConfig {
        CloudProfileConfig::decode(&json!({
            "apiVersion": API_VERSION,
            "kind": "CloudProfileConfig",
            "machineImages": [{
                "name": "gardenlinux",
                "versions": [
                    {"version": "1443.3.0", "image": "ghcr.io/gardenlinux:1443.3.0-amd64"},
                    {"version": "1443.3.0", "image": "ghcr.io/gardenlinux:1443.3.0-arm64", "architecture": "arm64"}
                ]
            }]
        }))
        .unwrap()
    }

    #[test]
    fn image_lookup_defaults_to_amd64() {
        let image = profile()
            .find_machine_image("gardenlinux", "1443.3.0", None)
            .unwrap();
        assert_eq!(image.image, "ghcr.io/gardenlinux:1443.3.0-amd64");
        assert_eq!(image.architecture.as_deref(), Some("amd64"));
    }

    #[test]
    fn image_lookup_honours_architecture() {
        let image = profile()
            .find_machine_image("gardenlinux", "1443.3.0", Some("arm64"))
            .unwrap();
        assert!(image.image.ends_with("arm64"));
        assert!(profile().find_machine_image("gardenlinux", "1.0.0", None).is_none());
        assert!(profile().find_machine_image("ubuntu", "1443.3.0", None).is_none());
    }

    #[test]
    fn wrong_kind_is_rejected() {
        let err = InfrastructureConfig::decode(&json!({
            "apiVersion": API_VERSION,
            "kind": "ControlPlaneConfig"
        }))
        .unwrap_err();
        assert!(err.to_string().contains("unexpected kind"));
    }

    #[test]
    fn foreign_api_version_is_rejected() {
        let err = InfrastructureConfig::decode(&json!({
            "apiVersion": "aws.provider.extensions.gardener.cloud/v1alpha1",
            "kind": "InfrastructureConfig"
        }))
        .unwrap_err();
        assert!(err.to_string().contains("unsupported apiVersion"));
    }

    #[test]
    fn empty_network_ref_is_not_defaulted() {
        let config = InfrastructureConfig::decode(&json!({
            "apiVersion": API_VERSION,
            "kind": "InfrastructureConfig",
            "networkRef": {"name": ""}
        }))
        .unwrap();
        assert_eq!(config.network_ref, Some(NetworkRef { name: String::new() }));
    }

    #[test]
    fn encoded_status_carries_type_meta() {
        let status = WorkerStatus {
            machine_images: vec![MachineImage {
                name: "gardenlinux".to_string(),
                version: "1443.3.0".to_string(),
                image: "img".to_string(),
                architecture: None,
            }],
        };
        let value = status.encode().unwrap();
        assert_eq!(value["kind"], "WorkerStatus");
        assert_eq!(value["apiVersion"], API_VERSION);
        assert_eq!(WorkerStatus::decode(&value).unwrap(), status);
    }

    #[test]
    fn recorded_images_are_deduplicated() {
        let image = MachineImage {
            name: "gardenlinux".to_string(),
            version: "1".to_string(),
            image: "img".to_string(),
            architecture: Some("amd64".to_string()),
        };
        let mut status = WorkerStatus::default();
        status.add_machine_image(image.clone());
        status.add_machine_image(image);
        assert_eq!(status.machine_images.len(), 1);
        assert!(status.find_machine_image("gardenlinux", "1", None).is_some());
    }
}
