//! Mocks and fixtures shared by the Pipewright test suites.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use futures::future::BoxFuture;
use tempfile::TempDir;

use pipewright_core::config::{CheckpointConfig, PipewrightConfig};
use pipewright_core::error::{FlowError, Result};
use pipewright_core::traits::Collaborator;
use pipewright_core::types::{InvokeOptions, Reply};

/// A collaborator that plays back scripted replies in order.
///
/// Once the script runs out, the last reply repeats. Every prompt is
/// recorded so tests can assert on what a step sent.
pub struct MockCollaborator {
    script: Mutex<VecDeque<Result<Reply>>>,
    last: Mutex<Option<Reply>>,
    prompts: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl MockCollaborator {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            last: Mutex::new(None),
            prompts: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Queue a text reply.
    pub fn reply(self, text: impl Into<String>) -> Self {
        self.push(Ok(Reply::Text(text.into())))
    }

    /// Queue a structured reply.
    pub fn reply_structured(self, value: serde_json::Value) -> Self {
        self.push(Ok(Reply::Structured(value)))
    }

    /// Queue a transport failure.
    pub fn fail(self, message: impl Into<String>) -> Self {
        self.push(Err(FlowError::Collaborator(message.into())))
    }

    fn push(self, item: Result<Reply>) -> Self {
        self.script
            .lock()
            .expect("mock script lock poisoned")
            .push_back(item);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("mock prompts lock poisoned").clone()
    }

    fn next_reply(&self) -> Result<Reply> {
        let mut script = self.script.lock().expect("mock script lock poisoned");
        let mut last = self.last.lock().expect("mock last lock poisoned");
        match script.pop_front() {
            Some(Ok(reply)) => {
                *last = Some(reply.clone());
                Ok(reply)
            }
            Some(Err(e)) => Err(e),
            None => last
                .clone()
                .ok_or_else(|| FlowError::Collaborator("mock script exhausted".into())),
        }
    }
}

impl Default for MockCollaborator {
    fn default() -> Self {
        Self::new()
    }
}

impl Collaborator for MockCollaborator {
    fn name(&self) -> &str {
        "mock"
    }

    fn invoke<'a>(
        &'a self,
        prompt: &'a str,
        _options: &'a InvokeOptions,
    ) -> BoxFuture<'a, Result<Reply>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.prompts
                .lock()
                .expect("mock prompts lock poisoned")
                .push(prompt.to_string());
            self.next_reply()
        })
    }
}

/// A collaborator that always fails with the same message.
pub struct FailingCollaborator {
    message: String,
    calls: AtomicUsize,
}

impl FailingCollaborator {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Collaborator for FailingCollaborator {
    fn invoke<'a>(
        &'a self,
        _prompt: &'a str,
        _options: &'a InvokeOptions,
    ) -> BoxFuture<'a, Result<Reply>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(FlowError::Collaborator(self.message.clone()))
        })
    }
}

/// A temporary root directory for checkpoint and output files.
pub struct TestWorkspace {
    dir: TempDir,
}

impl TestWorkspace {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("failed to create temp dir"),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn checkpoint_dir(&self, flow: &str) -> PathBuf {
        self.root().join("checkpoints").join(flow)
    }

    pub fn output_file(&self, flow: &str, name: &str) -> PathBuf {
        self.root()
            .join("outputs")
            .join(format!("{flow}_{name}.yaml"))
    }

    /// Checkpoint settings rooted in this workspace.
    pub fn checkpoint_config(&self) -> CheckpointConfig {
        CheckpointConfig {
            root_dir: self.root().to_string_lossy().into_owned(),
            ..CheckpointConfig::default()
        }
    }

    /// A full config whose checkpoint root is this workspace.
    pub fn config(&self) -> PipewrightConfig {
        PipewrightConfig {
            checkpoint: self.checkpoint_config(),
            ..PipewrightConfig::default()
        }
    }

    /// Write a file below the root, creating parent directories.
    pub fn write(&self, relative: &str, contents: &str) -> PathBuf {
        let path = self.root().join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("failed to create parent dir");
        }
        std::fs::write(&path, contents).expect("failed to write fixture");
        path
    }
}

impl Default for TestWorkspace {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a TOML snippet into a config, for config-driven tests.
pub fn config_from_toml(toml_str: &str) -> PipewrightConfig {
    toml::from_str(toml_str).expect("invalid test config")
}
