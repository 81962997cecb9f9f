use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::{InvokeOptions, Reply};

/// The external text-generation service steps call from `exec`.
///
/// Implementations report transport and quota problems as
/// `FlowError::Collaborator` and never retry on their own; the calling
/// step's retry policy owns backoff.
pub trait Collaborator: Send + Sync + 'static {
    /// Short identifier used in logs.
    fn name(&self) -> &str {
        "collaborator"
    }

    /// Send a prompt and receive text or a structured value.
    fn invoke<'a>(
        &'a self,
        prompt: &'a str,
        options: &'a InvokeOptions,
    ) -> BoxFuture<'a, Result<Reply>>;
}
