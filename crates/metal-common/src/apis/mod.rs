//! Versioned API types owned by the extension
//!
//! - [`metal`]: provider configuration and status embedded in extension
//!   resources (`metal.provider.extensions.gardener.cloud/v1alpha1`)
//! - [`config`]: the controller manager's own configuration file

pub mod config;
pub mod metal;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::{Error, Result};

/// Decode an embedded object, checking its `apiVersion` and `kind` when present
pub fn decode_embedded<T: DeserializeOwned>(
    value: &Value,
    api_version: &str,
    kind: &str,
) -> Result<T> {
    let found_version = value.get("apiVersion").and_then(Value::as_str);
    let found_kind = value.get("kind").and_then(Value::as_str);

    if let Some(found) = found_version {
        if found != api_version {
            return Err(Error::serialization_for(
                kind,
                format!("unsupported apiVersion {found:?}, expected {api_version:?}"),
            ));
        }
    }
    if let Some(found) = found_kind {
        if found != kind {
            return Err(Error::serialization_for(
                kind,
                format!("unexpected kind {found:?}"),
            ));
        }
    }

    T::deserialize(value).map_err(|e| Error::serialization_for(kind, e.to_string()))
}

/// Encode an object for embedding, stamping `apiVersion` and `kind`
pub fn encode_embedded<T: Serialize>(obj: &T, api_version: &str, kind: &str) -> Result<Value> {
    let mut value = serde_json::to_value(obj)?;
    match value.as_object_mut() {
        Some(map) => {
            map.insert("apiVersion".to_string(), Value::String(api_version.to_string()));
            map.insert("kind".to_string(), Value::String(kind.to_string()));
            Ok(value)
        }
        None => Err(Error::serialization_for(kind, "object expected")),
    }
}
