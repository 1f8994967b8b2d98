use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value, value::TaggedValue};

/// A pod manifest as written by the scheduler under a node's intent path.
///
/// The same document is recorded under the reality path once the preparer has
/// applied it, and hook bindings carry one as well.
///
/// ```yaml
/// id: web
/// image: registry.local/web:1.4
/// command: ["/bin/web", "--port", "8080"]
/// env:
///   RUST_LOG: info
/// config:
///   replicas: 1
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(alias = "name")]
    pub id: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("manifest for {slot} is empty")]
    Empty { slot: String },
    #[error("manifest for {slot} is not valid YAML: {source}")]
    Yaml {
        slot: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("manifest for {slot} has an empty {field}")]
    MissingField { slot: String, field: &'static str },
    #[error("manifest id {manifest_id:?} does not match its key {slot:?}")]
    IdMismatch { slot: String, manifest_id: String },
    #[error("manifest id {0:?} may not contain '/'")]
    InvalidId(String),
}

impl DecodeError {
    pub fn slot(&self) -> &str {
        match self {
            DecodeError::Empty { slot }
            | DecodeError::Yaml { slot, .. }
            | DecodeError::MissingField { slot, .. }
            | DecodeError::IdMismatch { slot, .. } => slot,
            DecodeError::InvalidId(id) => id,
        }
    }
}

impl Manifest {
    pub fn new(id: impl Into<String>, image: impl Into<String>) -> Self {
        Manifest {
            id: id.into(),
            image: image.into(),
            command: Vec::new(),
            env: BTreeMap::new(),
            config: BTreeMap::new(),
        }
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    /// SHA-256 of the manifest's YAML form with every mapping's keys sorted.
    /// Two manifests with the same fingerprint describe the same deployment,
    /// whatever order their keys were written in.
    pub fn fingerprint(&self) -> String {
        let mut sorted = self.clone();
        for value in sorted.config.values_mut() {
            *value = sort_mappings(value);
        }
        let canonical = sorted.to_yaml().unwrap_or_else(|_| format!("{sorted:?}"));
        sha256::digest(canonical)
    }
}

// Top-level env and config are BTreeMaps already; nested YAML mappings keep
// the order they were parsed in.
fn sort_mappings(value: &Value) -> Value {
    match value {
        Value::Mapping(mapping) => {
            let mut entries: Vec<(String, Value, Value)> = mapping
                .iter()
                .map(|(k, v)| {
                    let order = serde_yaml::to_string(k).unwrap_or_else(|_| format!("{k:?}"));
                    (order, k.clone(), sort_mappings(v))
                })
                .collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Mapping(entries.into_iter().map(|(_, k, v)| (k, v)).collect::<Mapping>())
        }
        Value::Sequence(items) => Value::Sequence(items.iter().map(sort_mappings).collect()),
        Value::Tagged(tagged) => Value::Tagged(Box::new(TaggedValue {
            tag: tagged.tag.clone(),
            value: sort_mappings(&tagged.value),
        })),
        other => other.clone(),
    }
}

/// Parse and validate the raw value stored for `slot`.
///
/// `slot` is the last segment of the key the value was read from; the
/// manifest's id must match it so one key cannot describe another slot's pod.
pub fn decode_manifest(slot: &str, raw: &[u8]) -> Result<Manifest, DecodeError> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Err(DecodeError::Empty {
            slot: slot.to_string(),
        });
    }
    let manifest: Manifest = serde_yaml::from_slice(raw).map_err(|source| DecodeError::Yaml {
        slot: slot.to_string(),
        source,
    })?;

    if manifest.id.trim().is_empty() {
        return Err(DecodeError::MissingField {
            slot: slot.to_string(),
            field: "id",
        });
    }
    if manifest.id.contains('/') {
        return Err(DecodeError::InvalidId(manifest.id));
    }
    if manifest.image.trim().is_empty() {
        return Err(DecodeError::MissingField {
            slot: slot.to_string(),
            field: "image",
        });
    }
    if manifest.id != slot {
        return Err(DecodeError::IdMismatch {
            slot: slot.to_string(),
            manifest_id: manifest.id,
        });
    }
    Ok(manifest)
}
