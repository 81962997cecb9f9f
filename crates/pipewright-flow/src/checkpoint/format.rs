use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use pipewright_core::error::{FlowError, Result};

/// Format version written by this crate.
pub const FORMAT_VERSION: &str = "1.0";

/// Identifies a checkpoint and the component that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub checkpoint_name: String,
    pub flow_name: String,
    pub timestamp: DateTime<Utc>,
    /// The step (or component) that wrote the checkpoint.
    pub node_class: String,
    pub format_version: String,
    /// Companion output file, relative to the checkpoint root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_file: Option<String>,
}

/// What a resume needs to know.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryInfo {
    /// False when a declared key was missing from the store at save time.
    pub can_resume: bool,
    pub required_state_keys: Vec<String>,
    /// Label of the action the resumed graph should route with.
    pub next_action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction: Option<String>,
}

/// A persisted snapshot of the declared subset of a store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub metadata: CheckpointMetadata,
    pub shared_state: BTreeMap<String, Value>,
    pub recovery_info: RecoveryInfo,
}

impl Checkpoint {
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml_ng::to_string(self)?)
    }

    /// Parse checkpoint YAML read from `path`.
    ///
    /// The version gate runs before the rest of the document is validated,
    /// so a newer format reports `IncompatibleVersion` rather than a shape
    /// error.
    pub fn parse(path: &Path, text: &str, supported_major: u64) -> Result<Self> {
        let invalid = |message: String| FlowError::InvalidCheckpoint {
            path: path.display().to_string(),
            message,
        };

        let mut doc: Value = serde_yaml_ng::from_str(text).map_err(|e| invalid(e.to_string()))?;

        let version = doc
            .get("metadata")
            .and_then(|m| m.get("format_version"))
            .and_then(version_text)
            .ok_or_else(|| invalid("missing metadata.format_version".to_string()))?;
        check_version(&version, supported_major)?;

        // Hand-edited files may carry an unquoted `1.0`
        if let Some(meta) = doc.get_mut("metadata").and_then(Value::as_object_mut) {
            meta.insert("format_version".into(), Value::String(version));
        }

        serde_json::from_value(doc).map_err(|e| invalid(e.to_string()))
    }

    /// Time elapsed between the checkpoint's timestamp and `now`.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.metadata.timestamp)
    }
}

fn version_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Major component of a `MAJOR.MINOR` version string.
pub fn major_version(version: &str) -> Option<u64> {
    version.trim().split('.').next()?.parse().ok()
}

/// Accept `found` only if its major component equals `supported_major`.
pub fn check_version(found: &str, supported_major: u64) -> Result<()> {
    match major_version(found) {
        Some(major) if major == supported_major => Ok(()),
        _ => Err(FlowError::IncompatibleVersion {
            found: found.to_string(),
            supported_major,
        }),
    }
}
