use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};
use crate::types::{default_max_output_size, ExpectedFormat, InvokeOptions};

/// Top-level Pipewright configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipewrightConfig {
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub collaborator: CollaboratorConfig,
}

/// Checkpoint / resume configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Directory holding `checkpoints/` and `outputs/`. Default: current directory.
    #[serde(default = "default_root_dir")]
    pub root_dir: String,
    /// Checkpoints older than this still load, with a warning.
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u64,
    /// Major format version this reader accepts.
    #[serde(default = "default_supported_major")]
    pub supported_major: u64,
    /// Route save-checkpoint steps to their pause action instead of continuing.
    #[serde(default)]
    pub pause_after_save: bool,
    /// Clear the store before splicing in resumed state.
    #[serde(default)]
    pub clear_store_on_resume: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            max_age_days: default_max_age_days(),
            supported_major: default_supported_major(),
            pause_after_save: false,
            clear_store_on_resume: false,
        }
    }
}

impl CheckpointConfig {
    /// Resolve the root directory (expand ~).
    pub fn root_path(&self) -> PathBuf {
        if let Some(rest) = self.root_dir.strip_prefix("~/") {
            if let Some(home) = dirs_home() {
                return home.join(rest);
            }
        }
        PathBuf::from(&self.root_dir)
    }

    /// Age beyond which a checkpoint is reported as stale.
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_days * 24 * 60 * 60)
    }
}

fn default_root_dir() -> String {
    ".".to_string()
}
fn default_max_age_days() -> u64 {
    30
}
fn default_supported_major() -> u64 {
    1
}

/// Default step retry policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Extra attempts after the first failure.
    #[serde(default)]
    pub max_retries: u32,
    /// Fixed delay between attempts.
    #[serde(default)]
    pub wait_ms: u64,
}

impl RetryConfig {
    pub fn wait(&self) -> Duration {
        Duration::from_millis(self.wait_ms)
    }
}

/// Agentic sub-loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
        }
    }
}

fn default_max_iterations() -> usize {
    10
}

/// Default options for collaborator calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaboratorConfig {
    #[serde(default)]
    pub expected_format: ExpectedFormat,
    #[serde(default = "default_max_output_size")]
    pub max_output_size: u32,
    #[serde(default)]
    pub temperature: f32,
}

impl Default for CollaboratorConfig {
    fn default() -> Self {
        Self {
            expected_format: ExpectedFormat::default(),
            max_output_size: default_max_output_size(),
            temperature: 0.0,
        }
    }
}

impl CollaboratorConfig {
    pub fn invoke_options(&self) -> InvokeOptions {
        InvokeOptions {
            expected_format: self.expected_format,
            max_output_size: self.max_output_size,
            temperature: self.temperature,
        }
    }
}

impl PipewrightConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| FlowError::ConfigNotFound(path.display().to_string()))?;

        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| FlowError::Config(e.to_string()))
    }

    /// Load from `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep the reference when the variable is unset
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_when_sections_absent() {
        let config: PipewrightConfig = toml::from_str("").unwrap();
        assert_eq!(config.checkpoint.max_age_days, 30);
        assert_eq!(config.checkpoint.supported_major, 1);
        assert!(!config.checkpoint.pause_after_save);
        assert_eq!(config.retry.max_retries, 0);
        assert_eq!(config.agent.max_iterations, 10);
        assert_eq!(config.collaborator.max_output_size, 4096);
    }

    #[test]
    fn test_partial_sections() {
        let config: PipewrightConfig = toml::from_str(
            r#"
[checkpoint]
root_dir = "/srv/pipelines"
pause_after_save = true

[retry]
max_retries = 2
wait_ms = 250

[collaborator]
expected_format = "yaml"
"#,
        )
        .unwrap();
        assert_eq!(config.checkpoint.root_path(), PathBuf::from("/srv/pipelines"));
        assert!(config.checkpoint.pause_after_save);
        assert_eq!(config.checkpoint.max_age_days, 30);
        assert_eq!(config.retry.wait(), Duration::from_millis(250));
        assert_eq!(
            config.collaborator.invoke_options().expected_format,
            ExpectedFormat::Yaml
        );
    }

    #[test]
    fn test_env_expansion() {
        std::env::set_var("PIPEWRIGHT_TEST_ROOT", "/tmp/pw-root");
        let expanded = expand_env_vars(r#"root_dir = "${PIPEWRIGHT_TEST_ROOT}""#);
        assert_eq!(expanded, r#"root_dir = "/tmp/pw-root""#);

        let untouched = expand_env_vars("${PIPEWRIGHT_DEFINITELY_UNSET_VAR}");
        assert_eq!(untouched, "${PIPEWRIGHT_DEFINITELY_UNSET_VAR}");
    }

    #[test]
    fn test_load_missing_file() {
        let err = PipewrightConfig::load(Path::new("/nonexistent/pipewright.toml")).unwrap_err();
        assert!(matches!(err, FlowError::ConfigNotFound(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"[agent]\nmax_iterations = 4\n").unwrap();
        let config = PipewrightConfig::load(tmp.path()).unwrap();
        assert_eq!(config.agent.max_iterations, 4);
    }

    #[test]
    fn test_invalid_toml() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"[agent\nmax_iterations = ").unwrap();
        let err = PipewrightConfig::load(tmp.path()).unwrap_err();
        assert!(matches!(err, FlowError::Config(_)));
    }
}
