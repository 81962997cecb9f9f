pub mod action;
pub mod agentic;
pub mod checkpoint;
pub mod graph;
pub mod step;
pub mod store;

pub use action::{action_label, parse_action, Action};
pub use agentic::{AgentLoop, CollaboratorDecide, Decision, LoopOutcome, LoopResult};
pub use checkpoint::{
    Checkpoint, CheckpointAction, CheckpointReader, CheckpointRequest, CheckpointSelector,
    CheckpointSummary, CheckpointWriter, LoadCheckpoint, LoadedCheckpoint, Modification,
    ModificationKind, SaveCheckpoint, SavedCheckpoint,
};
pub use graph::{
    Edge, EdgeCondition, ExecutionResult, Graph, GraphBuilder, StepResult, RUN_ERROR_KEY,
};
pub use step::{run_step, RetryPolicy, Step};
pub use store::{SharedStore, StoreKey};
