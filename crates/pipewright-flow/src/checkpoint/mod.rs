//! Durable checkpoints and human-in-the-loop resume.
//!
//! Layout below the configured root:
//!
//! ```text
//! checkpoints/<flow>/<name>_<YYYYmmdd_HHMMSS>.yaml   snapshot
//! checkpoints/<flow>/<name>_<...>.yaml.bak           previous copy, if overwritten
//! checkpoints/<flow>/latest                          newest snapshot
//! outputs/<flow>_<name>.yaml                         editable companion
//! ```
//!
//! On resume the checkpoint's `shared_state` is the base and every top-level
//! key of the output file replaces the matching key wholesale.

pub mod diff;
pub mod format;
pub mod reader;
pub mod steps;
pub mod writer;

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

use pipewright_core::error::{FlowError, Result};

pub use diff::{diff_states, Modification, ModificationKind};
pub use format::{Checkpoint, CheckpointMetadata, RecoveryInfo, FORMAT_VERSION};
pub use reader::{CheckpointReader, CheckpointSelector, CheckpointSummary, LoadedCheckpoint};
pub use steps::{LoadCheckpoint, SaveCheckpoint};
pub use writer::{CheckpointAction, CheckpointRequest, CheckpointWriter, SavedCheckpoint};

pub(crate) const LATEST_POINTER: &str = "latest";
pub(crate) const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

pub(crate) fn checkpoint_dir(root: &Path, flow: &str) -> PathBuf {
    root.join("checkpoints").join(flow)
}

pub(crate) fn output_relative_path(flow: &str, name: &str) -> String {
    format!("outputs/{flow}_{name}.yaml")
}

/// Reject flow and checkpoint names that would escape their directory.
pub(crate) fn validate_segment(kind: &str, value: &str) -> Result<()> {
    let bad = value.is_empty()
        || value == "."
        || value == ".."
        || value.contains(['/', '\\', '\0']);
    if bad {
        return Err(FlowError::Config(format!(
            "{kind} name '{value}' must be a single non-empty path segment"
        )));
    }
    Ok(())
}

/// Split `<name>_<YYYYmmdd_HHMMSS>.yaml` into its name and stamp.
pub(crate) fn checkpoint_file_name(file_name: &str) -> Option<(String, String)> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(r"^(?P<name>.+)_(?P<stamp>\d{8}_\d{6})\.yaml$").expect("valid checkpoint file pattern")
    });
    let caps = pattern.captures(file_name)?;
    Some((caps["name"].to_string(), caps["stamp"].to_string()))
}
