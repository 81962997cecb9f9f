use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use pipewright_core::config::CheckpointConfig;
use pipewright_core::error::Result;

use super::format::{Checkpoint, CheckpointMetadata, RecoveryInfo, FORMAT_VERSION};
use super::{
    checkpoint_dir, output_relative_path, validate_segment, LATEST_POINTER, TIMESTAMP_FORMAT,
};
use crate::store::SharedStore;

/// Key holding the reviewer instruction in the output file.
pub const INSTRUCTIONS_KEY: &str = "# instructions";

/// Whether the pipeline should keep going after a save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointAction {
    Continue,
    Pause,
}

/// Everything a save needs besides the store.
#[derive(Debug, Clone)]
pub struct CheckpointRequest {
    pub flow: String,
    pub name: String,
    /// Store keys to persist.
    pub keys: Vec<String>,
    /// Shown to the reviewer at the top of the output file.
    pub instruction: Option<String>,
    /// Label of the action to route with on resume.
    pub next_action: String,
    pub node_class: String,
}

impl CheckpointRequest {
    pub fn new(flow: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            flow: flow.into(),
            name: name.into(),
            keys: Vec::new(),
            instruction: None,
            next_action: "continue".to_string(),
            node_class: "CheckpointWriter".to_string(),
        }
    }

    pub fn keys<I, K>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        self.keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = Some(instruction.into());
        self
    }

    pub fn next_action(mut self, label: impl Into<String>) -> Self {
        self.next_action = label.into();
        self
    }

    pub fn node_class(mut self, node_class: impl Into<String>) -> Self {
        self.node_class = node_class.into();
        self
    }

    /// Check that `flow` and `name` are usable as file-name segments.
    pub fn validate(&self) -> Result<()> {
        validate_segment("flow", &self.flow)?;
        validate_segment("checkpoint", &self.name)
    }
}

/// Outcome of a save.
#[derive(Debug, Clone)]
pub struct SavedCheckpoint {
    pub checkpoint_path: PathBuf,
    pub output_path: PathBuf,
    /// Backups made of files that were about to be overwritten.
    pub backups: Vec<PathBuf>,
    pub can_resume: bool,
    /// Declared keys that were absent from the store.
    pub missing_keys: Vec<String>,
    pub action: CheckpointAction,
}

/// Writes checkpoints, their output files and the `latest` pointer.
#[derive(Debug, Clone)]
pub struct CheckpointWriter {
    root: PathBuf,
    pause: bool,
}

impl CheckpointWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            pause: false,
        }
    }

    pub fn from_config(config: &CheckpointConfig) -> Self {
        Self {
            root: config.root_path(),
            pause: config.pause_after_save,
        }
    }

    /// Ask callers to pause after every save.
    pub fn pause_after_save(mut self, pause: bool) -> Self {
        self.pause = pause;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Persist the declared subset of `store`.
    pub fn save(&self, store: &SharedStore, request: &CheckpointRequest) -> Result<SavedCheckpoint> {
        self.save_at(store, request, Utc::now())
    }

    /// Persist the declared subset of `store`, stamped with `now`.
    pub fn save_at(
        &self,
        store: &SharedStore,
        request: &CheckpointRequest,
        now: DateTime<Utc>,
    ) -> Result<SavedCheckpoint> {
        self.save_projection(store.project(&request.keys), request, now)
    }

    /// Persist an already-projected state.
    ///
    /// Writes happen in a fixed order: backups, checkpoint, output file,
    /// then the `latest` pointer. Each file is written to a temporary name
    /// and renamed into place.
    pub fn save_projection(
        &self,
        state: BTreeMap<String, Value>,
        request: &CheckpointRequest,
        now: DateTime<Utc>,
    ) -> Result<SavedCheckpoint> {
        request.validate()?;
        let missing_keys: Vec<String> = request
            .keys
            .iter()
            .filter(|k| !state.contains_key(*k))
            .cloned()
            .collect();
        for key in &missing_keys {
            warn!(
                flow = %request.flow,
                checkpoint = %request.name,
                key = %key,
                "Declared key missing from store, checkpoint will not be resumable"
            );
        }

        let dir = checkpoint_dir(&self.root, &request.flow);
        fs::create_dir_all(&dir)?;
        let file_name = format!("{}_{}.yaml", request.name, now.format(TIMESTAMP_FORMAT));
        let checkpoint_path = dir.join(&file_name);

        let output_rel = output_relative_path(&request.flow, &request.name);
        let output_path = self.root.join(&output_rel);
        if let Some(parent) = output_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let checkpoint = Checkpoint {
            metadata: CheckpointMetadata {
                checkpoint_name: request.name.clone(),
                flow_name: request.flow.clone(),
                timestamp: now,
                node_class: request.node_class.clone(),
                format_version: FORMAT_VERSION.to_string(),
                output_file: Some(output_rel),
            },
            shared_state: state,
            recovery_info: RecoveryInfo {
                can_resume: missing_keys.is_empty(),
                required_state_keys: request.keys.clone(),
                next_action: request.next_action.clone(),
                instruction: request.instruction.clone(),
            },
        };

        let mut backups = Vec::new();
        backups.extend(backup_existing(&checkpoint_path)?);
        write_atomic(&checkpoint_path, &checkpoint.to_yaml()?)?;

        backups.extend(backup_existing(&output_path)?);
        write_atomic(&output_path, &render_output(&checkpoint)?)?;

        update_latest(&dir, &file_name)?;

        let action = if self.pause {
            CheckpointAction::Pause
        } else {
            CheckpointAction::Continue
        };
        info!(
            flow = %request.flow,
            checkpoint = %request.name,
            path = %checkpoint_path.display(),
            keys = checkpoint.shared_state.len(),
            can_resume = checkpoint.recovery_info.can_resume,
            action = ?action,
            "Checkpoint saved"
        );

        Ok(SavedCheckpoint {
            checkpoint_path,
            output_path,
            backups,
            can_resume: checkpoint.recovery_info.can_resume,
            missing_keys,
            action,
        })
    }
}

/// Copy `path` to `<path>.bak` if it exists.
fn backup_existing(path: &Path) -> Result<Option<PathBuf>> {
    if !path.exists() {
        return Ok(None);
    }
    let backup = with_suffix(path, ".bak");
    fs::copy(path, &backup)?;
    debug!(path = %path.display(), backup = %backup.display(), "Backed up existing file");
    Ok(Some(backup))
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let tmp = with_suffix(path, ".tmp");
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Point `<dir>/latest` at `file_name`, replacing any previous pointer.
#[cfg(unix)]
fn update_latest(dir: &Path, file_name: &str) -> Result<()> {
    let tmp = dir.join(format!("{LATEST_POINTER}.tmp"));
    if tmp.symlink_metadata().is_ok() {
        fs::remove_file(&tmp)?;
    }
    std::os::unix::fs::symlink(file_name, &tmp)?;
    fs::rename(&tmp, dir.join(LATEST_POINTER))?;
    Ok(())
}

#[cfg(not(unix))]
fn update_latest(dir: &Path, file_name: &str) -> Result<()> {
    write_atomic(&dir.join(LATEST_POINTER), file_name)
}

/// The human-editable companion: instructions as leading comments, then
/// the declared state as plain YAML.
fn render_output(checkpoint: &Checkpoint) -> Result<String> {
    let meta = &checkpoint.metadata;
    let mut out = String::new();
    out.push_str(&format!(
        "# Output of '{}' in flow '{}' ({})\n",
        meta.checkpoint_name,
        meta.flow_name,
        meta.timestamp.to_rfc3339()
    ));
    out.push_str("# Edit values below and save. On resume, each top-level key here\n");
    out.push_str("# replaces the checkpointed value wholesale. Keys starting with '#' are ignored.\n");
    if let Some(ref instruction) = checkpoint.recovery_info.instruction {
        for line in instruction.lines() {
            out.push_str(&format!("# {}\n", line));
        }
    }
    out.push('\n');

    let mut body = serde_json::Map::new();
    if let Some(ref instruction) = checkpoint.recovery_info.instruction {
        body.insert(INSTRUCTIONS_KEY.to_string(), Value::String(instruction.clone()));
    }
    for (key, value) in &checkpoint.shared_state {
        body.insert(key.clone(), value.clone());
    }
    if !body.is_empty() {
        out.push_str(&serde_yaml_ng::to_string(&body)?);
    }
    Ok(out)
}
