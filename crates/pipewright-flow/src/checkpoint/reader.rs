use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use pipewright_core::config::CheckpointConfig;
use pipewright_core::error::{FlowError, Result};

use super::diff::{diff_states, Modification};
use super::format::Checkpoint;
use super::{
    checkpoint_dir, checkpoint_file_name, output_relative_path, validate_segment, LATEST_POINTER,
};
use crate::store::SharedStore;

/// Which checkpoint of a flow to load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointSelector {
    /// Newest checkpoint saved under this name.
    Named(String),
    /// Whatever `latest` points at, else the most recently modified file.
    AutoDetect,
}

impl fmt::Display for CheckpointSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointSelector::Named(name) => write!(f, "named '{}'", name),
            CheckpointSelector::AutoDetect => write!(f, "auto_detect"),
        }
    }
}

/// A checkpoint merged with the reviewer's edits, ready to resume from.
#[derive(Debug, Clone)]
pub struct LoadedCheckpoint {
    pub path: PathBuf,
    pub checkpoint: Checkpoint,
    /// Checkpoint state with edits applied.
    pub state: BTreeMap<String, Value>,
    pub modifications: Vec<Modification>,
    pub warnings: Vec<String>,
    /// Output file the edits came from, if it existed.
    pub output_path: Option<PathBuf>,
}

impl LoadedCheckpoint {
    pub fn next_action(&self) -> &str {
        &self.checkpoint.recovery_info.next_action
    }

    /// Splice the merged state into `store`, optionally clearing it first.
    pub fn apply_to(&self, store: &mut SharedStore, clear_first: bool) {
        if clear_first {
            store.clear();
        }
        store.extend(self.state.clone());
    }
}

/// One line of `list` output.
#[derive(Debug, Clone)]
pub struct CheckpointSummary {
    pub name: String,
    pub path: PathBuf,
    pub timestamp: DateTime<Utc>,
    pub next_action: String,
    pub can_resume: bool,
    pub keys: usize,
}

/// Locates, validates and merges checkpoints below a root directory.
#[derive(Debug, Clone)]
pub struct CheckpointReader {
    root: PathBuf,
    max_age: Duration,
    supported_major: u64,
}

impl CheckpointReader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let defaults = CheckpointConfig::default();
        Self {
            root: root.into(),
            max_age: defaults.max_age(),
            supported_major: defaults.supported_major,
        }
    }

    pub fn from_config(config: &CheckpointConfig) -> Self {
        Self {
            root: config.root_path(),
            max_age: config.max_age(),
            supported_major: config.supported_major,
        }
    }

    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Load a checkpoint and merge the edits from its output file.
    pub fn load(&self, flow: &str, selector: &CheckpointSelector) -> Result<LoadedCheckpoint> {
        self.load_at(flow, selector, Utc::now())
    }

    /// As [`load`](Self::load), judging staleness against `now`.
    pub fn load_at(
        &self,
        flow: &str,
        selector: &CheckpointSelector,
        now: DateTime<Utc>,
    ) -> Result<LoadedCheckpoint> {
        let path = self.resolve(flow, selector)?;
        let checkpoint = self.read_file(&path)?;
        let mut warnings = Vec::new();

        let age = checkpoint.age(now);
        if age.to_std().is_ok_and(|a| a > self.max_age) {
            let message = format!(
                "checkpoint {} is {} days old (limit {} days)",
                path.display(),
                age.num_days(),
                self.max_age.as_secs() / 86_400
            );
            warn!(flow, path = %path.display(), age_days = age.num_days(), "Loading stale checkpoint");
            warnings.push(message);
        }

        let output_rel = checkpoint.metadata.output_file.clone().unwrap_or_else(|| {
            output_relative_path(&checkpoint.metadata.flow_name, &checkpoint.metadata.checkpoint_name)
        });
        let output_path = self.root.join(output_rel);

        let (state, output_path) = if output_path.is_file() {
            let edits = read_edits(&output_path)?;
            let mut merged = checkpoint.shared_state.clone();
            merged.extend(edits);
            (merged, Some(output_path))
        } else {
            debug!(flow, path = %output_path.display(), "No output file, using checkpoint state as is");
            (checkpoint.shared_state.clone(), None)
        };

        let recovery = &checkpoint.recovery_info;
        if let Some(key) = recovery
            .required_state_keys
            .iter()
            .find(|k| !state.contains_key(*k))
        {
            warn!(flow, path = %path.display(), key = %key, "Checkpoint lacks a required state key");
            return Err(FlowError::MissingStateKey {
                step: checkpoint.metadata.node_class.clone(),
                key: key.clone(),
            });
        }
        if !recovery.can_resume {
            let message = format!(
                "checkpoint {} was saved incomplete; missing keys were supplied by {}",
                path.display(),
                output_path
                    .as_ref()
                    .map_or_else(|| "the output file".to_string(), |p| p.display().to_string())
            );
            warn!(flow, path = %path.display(), "Resuming checkpoint that was saved incomplete");
            warnings.push(message);
        }

        let modifications = diff_states(&checkpoint.shared_state, &state);
        for m in &modifications {
            info!(flow, path = %m.path, action = ?m.action, "Reviewer edit");
        }
        info!(
            flow,
            checkpoint = %checkpoint.metadata.checkpoint_name,
            path = %path.display(),
            modifications = modifications.len(),
            next_action = %checkpoint.recovery_info.next_action,
            "Checkpoint loaded"
        );

        Ok(LoadedCheckpoint {
            path,
            checkpoint,
            state,
            modifications,
            warnings,
            output_path,
        })
    }

    /// Read and validate a single checkpoint file.
    pub fn read_file(&self, path: &Path) -> Result<Checkpoint> {
        let text = fs::read_to_string(path)?;
        Checkpoint::parse(path, &text, self.supported_major)
    }

    /// Find the file a selector refers to.
    pub fn resolve(&self, flow: &str, selector: &CheckpointSelector) -> Result<PathBuf> {
        validate_segment("flow", flow)?;
        if let CheckpointSelector::Named(name) = selector {
            validate_segment("checkpoint", name)?;
        }
        let dir = checkpoint_dir(&self.root, flow);
        let not_found = || FlowError::CheckpointNotFound {
            flow: flow.to_string(),
            selector: selector.to_string(),
        };
        if !dir.is_dir() {
            return Err(not_found());
        }

        let found = match selector {
            CheckpointSelector::Named(name) => self
                .files(&dir)?
                .into_iter()
                .filter(|f| f.name == *name)
                .max_by(|a, b| a.stamp.cmp(&b.stamp))
                .map(|f| f.path),
            CheckpointSelector::AutoDetect => match read_latest(&dir) {
                Some(path) => Some(path),
                None => self
                    .files(&dir)?
                    .into_iter()
                    .max_by_key(|f| f.modified)
                    .map(|f| f.path),
            },
        };
        found.ok_or_else(not_found)
    }

    /// Summaries of every checkpoint of `flow`, newest first.
    pub fn list(&self, flow: &str) -> Result<Vec<CheckpointSummary>> {
        let dir = checkpoint_dir(&self.root, flow);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut summaries = Vec::new();
        for file in self.files(&dir)? {
            match self.read_file(&file.path) {
                Ok(cp) => summaries.push(CheckpointSummary {
                    name: cp.metadata.checkpoint_name,
                    path: file.path,
                    timestamp: cp.metadata.timestamp,
                    next_action: cp.recovery_info.next_action,
                    can_resume: cp.recovery_info.can_resume,
                    keys: cp.shared_state.len(),
                }),
                Err(e) => warn!(path = %file.path.display(), error = %e, "Skipping unreadable checkpoint"),
            }
        }
        summaries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(summaries)
    }

    /// Delete all but the newest `keep` checkpoint files of `flow`, with their backups.
    pub fn prune(&self, flow: &str, keep: usize) -> Result<Vec<PathBuf>> {
        let dir = checkpoint_dir(&self.root, flow);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut files = self.files(&dir)?;
        files.sort_by(|a, b| b.stamp.cmp(&a.stamp).then(b.modified.cmp(&a.modified)));

        let mut removed = Vec::new();
        for file in files.into_iter().skip(keep) {
            let backup = PathBuf::from(format!("{}.bak", file.path.display()));
            fs::remove_file(&file.path)?;
            removed.push(file.path);
            if backup.is_file() {
                fs::remove_file(&backup)?;
                removed.push(backup);
            }
        }

        // A pointer to a pruned file is worse than none
        let latest = dir.join(LATEST_POINTER);
        if latest.symlink_metadata().is_ok() && read_latest(&dir).is_none() {
            fs::remove_file(&latest)?;
        }

        info!(flow, keep, removed = removed.len(), "Pruned checkpoints");
        Ok(removed)
    }

    fn files(&self, dir: &Path) -> Result<Vec<CheckpointFile>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some((name, stamp)) = checkpoint_file_name(file_name) else {
                continue;
            };
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            files.push(CheckpointFile {
                name,
                stamp,
                modified,
                path,
            });
        }
        Ok(files)
    }
}

struct CheckpointFile {
    name: String,
    stamp: String,
    modified: SystemTime,
    path: PathBuf,
}

/// Resolve `<dir>/latest` (symlink or pointer file) to an existing file.
fn read_latest(dir: &Path) -> Option<PathBuf> {
    let pointer = dir.join(LATEST_POINTER);
    let target = match fs::read_link(&pointer) {
        Ok(target) => target,
        Err(_) => PathBuf::from(fs::read_to_string(&pointer).ok()?.trim()),
    };
    let path = if target.is_absolute() {
        target
    } else {
        dir.join(target)
    };
    path.is_file().then_some(path)
}

/// Top-level entries of an output file, minus comment keys.
fn read_edits(path: &Path) -> Result<BTreeMap<String, Value>> {
    let text = fs::read_to_string(path)?;
    let doc: Value = serde_yaml_ng::from_str(&text).map_err(|e| FlowError::InvalidCheckpoint {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    match doc {
        Value::Null => Ok(BTreeMap::new()),
        Value::Object(map) => Ok(map
            .into_iter()
            .filter(|(k, _)| !k.starts_with('#'))
            .collect()),
        other => Err(FlowError::InvalidCheckpoint {
            path: path.display().to_string(),
            message: format!("expected a mapping of state keys, found {}", type_name(&other)),
        }),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "a mapping",
    }
}
