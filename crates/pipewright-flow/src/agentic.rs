//! Agentic sub-loop: a decide step routing to tool steps until it finishes.
//!
//! Unlike a [`Graph`](crate::graph::Graph), the loop may revisit steps, so it
//! is driven here rather than by the DAG scheduler. `max_iterations` bounds
//! the number of decide → tool transitions.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use pipewright_core::config::AgentConfig;
use pipewright_core::error::{FlowError, Result};
use pipewright_core::traits::Collaborator;
use pipewright_core::types::{ExpectedFormat, InvokeOptions};

use crate::action::{action_label, parse_action, Action};
use crate::graph::executor::record_run_error;
use crate::step::{DynStep, Erased, RetryPolicy, Step};
use crate::store::SharedStore;

/// Store key holding the number of transitions the last loop took.
pub const AGENT_ITERATIONS_KEY: &str = "agent_iterations";
/// Store key holding the list of `{action, reason}` decisions.
pub const DECISION_HISTORY_KEY: &str = "decision_history";

/// How a loop run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopOutcome {
    /// The decide step (or a routed step) returned the finish action.
    Finished,
    /// The iteration bound was reached first.
    IterationLimit,
}

/// Summary of one loop run.
#[derive(Debug, Clone)]
pub struct LoopResult<A> {
    pub outcome: LoopOutcome,
    /// Number of decide → step transitions taken.
    pub iterations: usize,
    /// `(action, routed step)` for each transition, in order.
    pub transitions: Vec<(A, String)>,
    /// The last action any step returned.
    pub last_action: Option<A>,
}

/// A decide step plus a route table from actions to steps.
pub struct AgentLoop<A: Action> {
    name: String,
    decide: Box<dyn DynStep<A>>,
    routes: HashMap<A, Box<dyn DynStep<A>>>,
    finish: A,
    max_iterations: usize,
    default_retry: RetryPolicy,
}

impl<A: Action> AgentLoop<A> {
    pub fn new<S: Step<A>>(name: impl Into<String>, decide: S, finish: A) -> Self {
        Self {
            name: name.into(),
            decide: Box::new(Erased(decide)),
            routes: HashMap::new(),
            finish,
            max_iterations: AgentConfig::default().max_iterations,
            default_retry: RetryPolicy::none(),
        }
    }

    /// Run `step` whenever the decide step returns `action`.
    pub fn route<S: Step<A>>(mut self, action: A, step: S) -> Self {
        self.routes.insert(action, Box::new(Erased(step)));
        self
    }

    pub fn max_iterations(mut self, max: usize) -> Self {
        self.max_iterations = max;
        self
    }

    /// Retry policy for steps that do not set their own.
    pub fn default_retry(mut self, policy: RetryPolicy) -> Self {
        self.default_retry = policy;
        self
    }

    pub fn with_config(self, config: &AgentConfig) -> Self {
        self.max_iterations(config.max_iterations)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Drive the loop against `store` until it finishes or hits the bound.
    ///
    /// A failing step or an unrouted action aborts the loop and is recorded
    /// under [`RUN_ERROR_KEY`](crate::graph::RUN_ERROR_KEY).
    pub async fn run(&self, store: &mut SharedStore) -> Result<LoopResult<A>> {
        info!(
            agent = %self.name,
            max_iterations = self.max_iterations,
            routes = self.routes.len(),
            "Starting agent loop"
        );

        let mut transitions: Vec<(A, String)> = Vec::new();
        let mut last_action = None;

        let outcome = loop {
            if transitions.len() >= self.max_iterations {
                warn!(
                    agent = %self.name,
                    iterations = transitions.len(),
                    "Agent loop reached iteration limit"
                );
                break LoopOutcome::IterationLimit;
            }

            let decide = self.decide.name();
            let action = match run_erased(self.decide.as_ref(), store, self.default_retry).await {
                Ok(action) => action,
                Err(e) => return Err(record_run_error(&self.name, decide, e, store)),
            };
            last_action = Some(action.clone());
            if action == self.finish {
                break LoopOutcome::Finished;
            }

            let Some(target) = self.routes.get(&action) else {
                let e = FlowError::UnknownAction {
                    step: decide.to_string(),
                    action: action_label(&action).unwrap_or_else(|_| format!("{:?}", action)),
                };
                return Err(record_run_error(&self.name, decide, e, store));
            };

            transitions.push((action.clone(), target.name().to_string()));
            store.set(AGENT_ITERATIONS_KEY, serde_json::json!(transitions.len()));
            debug!(
                agent = %self.name,
                iteration = transitions.len(),
                action = ?action,
                step = target.name(),
                "Agent transition"
            );

            let routed = match run_erased(target.as_ref(), store, self.default_retry).await {
                Ok(action) => action,
                Err(e) => return Err(record_run_error(&self.name, target.name(), e, store)),
            };
            last_action = Some(routed.clone());
            if routed == self.finish {
                break LoopOutcome::Finished;
            }
        };

        store.set(AGENT_ITERATIONS_KEY, serde_json::json!(transitions.len()));
        info!(
            agent = %self.name,
            iterations = transitions.len(),
            outcome = ?outcome,
            "Agent loop complete"
        );

        Ok(LoopResult {
            outcome,
            iterations: transitions.len(),
            transitions,
            last_action,
        })
    }
}

async fn run_erased<A: Action>(
    step: &dyn DynStep<A>,
    store: &mut SharedStore,
    default_retry: RetryPolicy,
) -> Result<A> {
    let prepared = step.prepare(store, default_retry)?;
    let executed = prepared.execute().await?;
    executed.post(store)
}

/// One decision taken by a [`CollaboratorDecide`] step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub action: String,
    #[serde(default)]
    pub reason: String,
}

/// A decide step that asks the collaborator to pick the next action.
///
/// The prompt lists the goal, the allowed actions with their descriptions,
/// the context keys from the store and the decisions taken so far. The reply
/// must be YAML or JSON of the form `{action, reason}`. Replies naming an
/// action outside the vocabulary count as failures and are retried; once
/// retries are exhausted the step falls back to `finish`.
pub struct CollaboratorDecide<A: Action> {
    name: String,
    collaborator: Arc<dyn Collaborator>,
    goal: String,
    vocabulary: Vec<(A, String)>,
    finish: A,
    context_keys: Vec<String>,
    options: InvokeOptions,
    retry: Option<RetryPolicy>,
}

impl<A: Action> CollaboratorDecide<A> {
    pub fn new(
        name: impl Into<String>,
        collaborator: Arc<dyn Collaborator>,
        goal: impl Into<String>,
        finish: A,
    ) -> Self {
        Self {
            name: name.into(),
            collaborator,
            goal: goal.into(),
            vocabulary: Vec::new(),
            finish,
            context_keys: Vec::new(),
            options: InvokeOptions::default().with_format(ExpectedFormat::Yaml),
            retry: None,
        }
    }

    /// Offer `action` to the collaborator, described by `description`.
    pub fn action(mut self, action: A, description: impl Into<String>) -> Self {
        self.vocabulary.push((action, description.into()));
        self
    }

    /// Include this store key in the prompt.
    pub fn context_key(mut self, key: impl Into<String>) -> Self {
        self.context_keys.push(key.into());
        self
    }

    pub fn options(mut self, options: InvokeOptions) -> Self {
        self.options = options.with_format(ExpectedFormat::Yaml);
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    fn render_prompt(&self, store: &SharedStore) -> Result<String> {
        let mut prompt = format!("## Goal\n{}\n\n## Available actions\n", self.goal);

        let finish_label = action_label(&self.finish)?;
        let mut offered = false;
        for (action, description) in &self.vocabulary {
            let label = action_label(action)?;
            offered |= label == finish_label;
            prompt.push_str(&format!("- {}: {}\n", label, description));
        }
        if !offered {
            prompt.push_str(&format!("- {}: stop, the goal is met\n", finish_label));
        }

        let context = store.project(&self.context_keys);
        if !context.is_empty() {
            prompt.push_str("\n## Context\n");
            prompt.push_str(&serde_yaml_ng::to_string(&context)?);
        }

        if let Some(history) = store.get(DECISION_HISTORY_KEY) {
            prompt.push_str("\n## Decisions so far\n");
            prompt.push_str(&serde_yaml_ng::to_string(history)?);
        }

        prompt.push_str(
            "\nReply with YAML only:\n```yaml\naction: <one action name>\nreason: <one sentence>\n```\n",
        );
        Ok(prompt)
    }

    /// Parse a reply into an action from the vocabulary.
    fn parse_decision(&self, reply: serde_json::Value) -> Result<(A, Decision)> {
        let decision: Decision = serde_json::from_value(reply)
            .map_err(|e| FlowError::CollaboratorParse(format!("expected {{action, reason}}: {e}")))?;

        let action = parse_action::<A>(decision.action.trim())
            .filter(|a| *a == self.finish || self.vocabulary.iter().any(|(v, _)| v == a))
            .ok_or_else(|| {
                FlowError::CollaboratorParse(format!(
                    "action '{}' is not one of the offered actions",
                    decision.action
                ))
            })?;
        Ok((action, decision))
    }
}

impl<A: Action> Step<A> for CollaboratorDecide<A> {
    type Prep = String;
    type Exec = (A, Decision);

    fn name(&self) -> &str {
        &self.name
    }

    fn retry(&self) -> Option<RetryPolicy> {
        self.retry
    }

    fn prep(&self, store: &SharedStore) -> Result<String> {
        self.render_prompt(store)
    }

    fn exec<'a>(
        &'a self,
        prompt: &'a String,
    ) -> futures::future::BoxFuture<'a, Result<(A, Decision)>> {
        Box::pin(async move {
            let reply = self.collaborator.invoke(prompt, &self.options).await?;
            self.parse_decision(reply.into_structured()?)
        })
    }

    fn exec_fallback(&self, _prompt: &String, error: &FlowError) -> Option<(A, Decision)> {
        let label = action_label(&self.finish).ok()?;
        Some((
            self.finish.clone(),
            Decision {
                action: label,
                reason: format!("no usable decision: {error}"),
            },
        ))
    }

    fn post(
        &self,
        store: &mut SharedStore,
        _prompt: String,
        (action, decision): (A, Decision),
    ) -> Result<A> {
        let mut history = match store.remove(DECISION_HISTORY_KEY) {
            Some(serde_json::Value::Array(items)) => items,
            _ => Vec::new(),
        };
        history.push(serde_json::to_value(&decision)?);
        store.set(DECISION_HISTORY_KEY, serde_json::Value::Array(history));
        debug!(step = %self.name, action = %decision.action, reason = %decision.reason, "Decision recorded");
        Ok(action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use pipewright_test_utils::{FailingCollaborator, MockCollaborator};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    enum Tool {
        Search,
        Summarize,
        Finish,
    }

    /// Always returns the same action; counts calls.
    struct Fixed {
        name: &'static str,
        action: Tool,
        calls: Arc<AtomicU32>,
    }

    impl Fixed {
        fn new(name: &'static str, action: Tool) -> Self {
            Self {
                name,
                action,
                calls: Arc::new(AtomicU32::new(0)),
            }
        }
    }

    impl Step<Tool> for Fixed {
        type Prep = ();
        type Exec = ();

        fn name(&self) -> &str {
            self.name
        }

        fn prep(&self, _store: &SharedStore) -> Result<()> {
            Ok(())
        }

        fn exec<'a>(&'a self, _prep: &'a ()) -> BoxFuture<'a, Result<()>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }

        fn post(&self, store: &mut SharedStore, _prep: (), _exec: ()) -> Result<Tool> {
            let seen = store.get("visits").and_then(|v| v.as_u64()).unwrap_or(0);
            store.set("visits", json!(seen + 1));
            Ok(self.action.clone())
        }
    }

    #[tokio::test]
    async fn test_stops_at_iteration_limit() {
        let decide = Fixed::new("decide", Tool::Search);
        let decide_calls = Arc::clone(&decide.calls);
        let search = Fixed::new("search", Tool::Search);
        let search_calls = Arc::clone(&search.calls);

        let agent = AgentLoop::new("research", decide, Tool::Finish)
            .route(Tool::Search, search)
            .max_iterations(3);
        let mut store = SharedStore::new();

        let result = agent.run(&mut store).await.unwrap();

        assert_eq!(result.outcome, LoopOutcome::IterationLimit);
        assert_eq!(result.iterations, 3);
        assert_eq!(search_calls.load(Ordering::SeqCst), 3);
        assert_eq!(decide_calls.load(Ordering::SeqCst), 3);
        assert_eq!(store.get(AGENT_ITERATIONS_KEY), Some(&json!(3)));
    }

    #[tokio::test]
    async fn test_routed_step_can_finish() {
        let agent = AgentLoop::new("research", Fixed::new("decide", Tool::Summarize), Tool::Finish)
            .route(Tool::Summarize, Fixed::new("synthesize", Tool::Finish))
            .max_iterations(5);
        let mut store = SharedStore::new();

        let result = agent.run(&mut store).await.unwrap();
        assert_eq!(result.outcome, LoopOutcome::Finished);
        assert_eq!(result.iterations, 1);
        assert_eq!(result.transitions, vec![(Tool::Summarize, "synthesize".to_string())]);
        assert_eq!(result.last_action, Some(Tool::Finish));
    }

    #[tokio::test]
    async fn test_unrouted_action_is_contract_error() {
        let agent: AgentLoop<Tool> =
            AgentLoop::new("research", Fixed::new("decide", Tool::Search), Tool::Finish);
        let mut store = SharedStore::new();

        let err = agent.run(&mut store).await.unwrap_err();
        assert!(matches!(err, FlowError::UnknownAction { ref step, ref action } if step == "decide" && action == "search"));

        let marker = store.get(crate::graph::RUN_ERROR_KEY).unwrap();
        assert_eq!(marker["graph"], "research");
        assert_eq!(marker["step"], "decide");
    }

    /// Asks the collaborator for a summary; no fallback.
    struct Summarize {
        collaborator: Arc<dyn Collaborator>,
    }

    impl Step<Tool> for Summarize {
        type Prep = ();
        type Exec = String;

        fn name(&self) -> &str {
            "summarize"
        }

        fn prep(&self, _store: &SharedStore) -> Result<()> {
            Ok(())
        }

        fn exec<'a>(&'a self, _prep: &'a ()) -> BoxFuture<'a, Result<String>> {
            Box::pin(async move {
                let reply = self
                    .collaborator
                    .invoke("Summarize the findings", &InvokeOptions::default())
                    .await?;
                Ok(reply.text())
            })
        }

        fn post(&self, store: &mut SharedStore, _prep: (), summary: String) -> Result<Tool> {
            store.set_str("summary", summary);
            Ok(Tool::Finish)
        }
    }

    #[tokio::test]
    async fn test_failing_routed_step_records_run_error() {
        let failing = Arc::new(FailingCollaborator::new("connection reset"));
        let agent = AgentLoop::new("research", Fixed::new("decide", Tool::Summarize), Tool::Finish)
            .route(
                Tool::Summarize,
                Summarize {
                    collaborator: failing.clone(),
                },
            )
            .default_retry(RetryPolicy::new(1, std::time::Duration::ZERO));
        let mut store = SharedStore::new();

        let err = agent.run(&mut store).await.unwrap_err();

        assert!(matches!(err, FlowError::StepFailed { attempts: 2, .. }));
        assert_eq!(failing.calls(), 2);
        assert!(!store.contains("summary"));
        let marker = store.get(crate::graph::RUN_ERROR_KEY).unwrap();
        assert_eq!(marker["graph"], "research");
        assert_eq!(marker["step"], "summarize");
        assert!(marker["error"].as_str().unwrap().contains("connection reset"));
        assert_eq!(store.get(AGENT_ITERATIONS_KEY), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_structured_reply_is_accepted() {
        let mock = Arc::new(
            MockCollaborator::new().reply_structured(json!({"action": "finish", "reason": "nothing to add"})),
        );
        let decide = CollaboratorDecide::new("decide", mock.clone(), "goal", Tool::Finish)
            .action(Tool::Search, "search");
        let mut store = SharedStore::new();

        let action = crate::step::run_step::<Tool, _>(&decide, &mut store).await.unwrap();

        assert_eq!(action, Tool::Finish);
        assert_eq!(store.get(DECISION_HISTORY_KEY).unwrap()[0]["reason"], "nothing to add");
    }

    #[tokio::test]
    async fn test_collaborator_decides_until_finish() {
        let mock = Arc::new(
            MockCollaborator::new()
                .reply("action: search\nreason: need sources")
                .reply("```json\n{\"action\": \"finish\", \"reason\": \"enough\"}\n```"),
        );
        let decide = CollaboratorDecide::new("decide", mock.clone(), "Summarize the role", Tool::Finish)
            .action(Tool::Search, "look up more material")
            .context_key("role");

        let agent = AgentLoop::new("research", decide, Tool::Finish)
            .route(Tool::Search, Fixed::new("search", Tool::Search));
        let mut store = SharedStore::new();
        store.set_str("role", "Platform engineer");

        let result = agent.run(&mut store).await.unwrap();

        assert_eq!(result.outcome, LoopOutcome::Finished);
        assert_eq!(result.iterations, 1);
        assert_eq!(mock.calls(), 2);

        let history = store.get(DECISION_HISTORY_KEY).unwrap().as_array().unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0]["action"], "search");
        assert_eq!(history[1]["reason"], "enough");

        let prompts = mock.prompts();
        assert!(prompts[0].contains("- search: look up more material"));
        assert!(prompts[0].contains("- finish:"));
        assert!(prompts[0].contains("Platform engineer"));
        assert!(prompts[1].contains("need sources"));
    }

    #[tokio::test]
    async fn test_unknown_reply_action_is_retried() {
        let mock = Arc::new(
            MockCollaborator::new()
                .reply("action: dance\nreason: why not")
                .reply("action: finish\nreason: done"),
        );
        let decide = CollaboratorDecide::new("decide", mock.clone(), "goal", Tool::Finish)
            .action(Tool::Search, "search")
            .retry_policy(RetryPolicy::new(1, std::time::Duration::ZERO));
        let mut store = SharedStore::new();

        let action = crate::step::run_step::<Tool, _>(&decide, &mut store).await.unwrap();
        assert_eq!(action, Tool::Finish);
        assert_eq!(mock.calls(), 2);
    }

    #[tokio::test]
    async fn test_falls_back_to_finish_when_collaborator_fails() {
        let failing = Arc::new(FailingCollaborator::new("503 Service Unavailable"));
        let decide = CollaboratorDecide::new("decide", failing.clone(), "goal", Tool::Finish)
            .action(Tool::Search, "search")
            .retry_policy(RetryPolicy::new(2, std::time::Duration::ZERO));
        let agent = AgentLoop::new("research", decide, Tool::Finish)
            .route(Tool::Search, Fixed::new("search", Tool::Search));
        let mut store = SharedStore::new();

        let result = agent.run(&mut store).await.unwrap();

        assert_eq!(result.outcome, LoopOutcome::Finished);
        assert_eq!(result.iterations, 0);
        assert_eq!(failing.calls(), 3);
        let history = store.get(DECISION_HISTORY_KEY).unwrap();
        assert_eq!(history[0]["action"], "finish");
        assert!(history[0]["reason"].as_str().unwrap().contains("503"));
    }

    #[test]
    fn test_max_iterations_from_config() {
        let config = AgentConfig { max_iterations: 4 };
        let agent = AgentLoop::new("a", Fixed::new("decide", Tool::Finish), Tool::Finish)
            .with_config(&config);
        assert_eq!(agent.max_iterations, 4);
    }
}
