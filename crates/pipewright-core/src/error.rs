use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowError {
    // Collaborator errors
    #[error("Collaborator call failed: {0}")]
    Collaborator(String),

    #[error("Collaborator reply could not be parsed: {0}")]
    CollaboratorParse(String),

    // Step errors
    #[error("Step '{step}' failed after {attempts} attempt(s): {message}")]
    StepFailed {
        step: String,
        attempts: u32,
        message: String,
    },

    #[error("Step '{step}' requires state key '{key}', which is missing")]
    MissingStateKey { step: String, key: String },

    #[error("State key '{key}' has an unexpected shape: {message}")]
    InvalidStateValue { key: String, message: String },

    #[error("Unknown action '{action}' returned by step '{step}'")]
    UnknownAction { step: String, action: String },

    // Graph errors
    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    // Checkpoint errors
    #[error("Malformed checkpoint {path}: {message}")]
    InvalidCheckpoint { path: String, message: String },

    #[error("Checkpoint format {found} is incompatible (reader supports {supported_major}.x)")]
    IncompatibleVersion { found: String, supported_major: u64 },

    #[error("No checkpoint found for flow '{flow}' ({selector})")]
    CheckpointNotFound { flow: String, selector: String },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),
}

impl FlowError {
    /// Contract and validation failures: bad inputs that retrying cannot fix.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            FlowError::MissingStateKey { .. }
                | FlowError::InvalidStateValue { .. }
                | FlowError::UnknownAction { .. }
                | FlowError::InvalidGraph(_)
                | FlowError::InvalidCheckpoint { .. }
                | FlowError::IncompatibleVersion { .. }
        )
    }

    /// Missing-resource failures, where a caller may offer a fresh start.
    pub fn is_not_found(&self) -> bool {
        matches!(self, FlowError::CheckpointNotFound { .. })
    }

    /// Failures worth retrying at the step boundary.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FlowError::Collaborator(_) | FlowError::CollaboratorParse(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;
