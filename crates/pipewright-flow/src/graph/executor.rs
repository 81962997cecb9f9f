use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use futures::future::join_all;
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use tracing::{debug, error, info};
use uuid::Uuid;

use pipewright_core::error::{FlowError, Result};

use super::edge::Edge;
use crate::action::Action;
use crate::step::{DynStep, Erased, Executed, RetryPolicy, Step};
use crate::store::SharedStore;

/// Store key under which an aborted run records its failure.
pub const RUN_ERROR_KEY: &str = "_run_error";

/// Result of executing a single step.
#[derive(Debug, Clone)]
pub struct StepResult<A> {
    /// Which step was executed.
    pub step: String,
    /// The action its `post` returned.
    pub action: A,
    /// Scheduling round the step ran in (steps sharing a round ran concurrently).
    pub round: usize,
    /// Execution time in milliseconds (prep to end of exec).
    pub elapsed_ms: u64,
}

/// Result of executing an entire graph.
#[derive(Debug, Clone)]
pub struct ExecutionResult<A> {
    /// Unique id of this run.
    pub run_id: Uuid,
    /// Per-step results in completion order.
    pub steps: Vec<StepResult<A>>,
    /// Steps that were in scope but never selected by any edge.
    pub skipped: Vec<String>,
    /// Steps none of whose outgoing edges fired, with their actions.
    pub terminal_actions: Vec<(String, A)>,
    /// Action of the last step to complete.
    pub last_action: Option<A>,
    /// Total execution time in milliseconds.
    pub total_elapsed_ms: u64,
}

impl<A> ExecutionResult<A> {
    /// Names of executed steps in completion order.
    pub fn executed(&self) -> Vec<&str> {
        self.steps.iter().map(|r| r.step.as_str()).collect()
    }
}

/// Builder collecting steps and edges before validation.
pub struct GraphBuilder<A: Action> {
    name: String,
    steps: Vec<Box<dyn DynStep<A>>>,
    edges: Vec<Edge<A>>,
    start: Option<String>,
    default_retry: RetryPolicy,
}

impl<A: Action> GraphBuilder<A> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            edges: Vec::new(),
            start: None,
            default_retry: RetryPolicy::none(),
        }
    }

    /// Add a step.
    pub fn step<S: Step<A>>(mut self, step: S) -> Self {
        self.steps.push(Box::new(Erased(step)));
        self
    }

    /// Add an edge.
    pub fn edge(mut self, edge: Edge<A>) -> Self {
        self.edges.push(edge);
        self
    }

    /// Unconditional edge `from -> to`.
    pub fn then(self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edge(Edge::always(from, to))
    }

    /// Edge `from -> to` taken when `from` returns `action`.
    pub fn on(self, from: impl Into<String>, action: A, to: impl Into<String>) -> Self {
        self.edge(Edge::on_action(from, action, to))
    }

    /// Start every run at this step instead of at the entry steps.
    pub fn start(mut self, name: impl Into<String>) -> Self {
        self.start = Some(name.into());
        self
    }

    /// Retry policy for steps that do not set their own.
    pub fn default_retry(mut self, policy: RetryPolicy) -> Self {
        self.default_retry = policy;
        self
    }

    /// Validate and build the graph.
    ///
    /// Rejects duplicate step names, edges naming unknown steps, an unknown
    /// start step, and cycles.
    pub fn build(self) -> Result<Graph<A>> {
        let mut steps: HashMap<String, Box<dyn DynStep<A>>> = HashMap::new();
        for step in self.steps {
            let name = step.name().to_string();
            if steps.insert(name.clone(), step).is_some() {
                return Err(FlowError::InvalidGraph(format!(
                    "duplicate step name '{}' in graph '{}'",
                    name, self.name
                )));
            }
        }

        for edge in &self.edges {
            for endpoint in [&edge.from, &edge.to] {
                if !steps.contains_key(endpoint) {
                    return Err(FlowError::InvalidGraph(format!(
                        "edge {} -> {} references unknown step '{}'",
                        edge.from, edge.to, endpoint
                    )));
                }
            }
        }

        if let Some(ref start) = self.start {
            if !steps.contains_key(start) {
                return Err(FlowError::InvalidGraph(format!(
                    "start step '{}' not found in graph '{}'",
                    start, self.name
                )));
            }
        }

        let mut order: Vec<String> = steps.keys().cloned().collect();
        order.sort();

        reject_cycles(&order, &self.edges)?;

        let mut preds: HashMap<String, Vec<String>> =
            order.iter().map(|n| (n.clone(), Vec::new())).collect();
        for edge in &self.edges {
            let list = preds.entry(edge.to.clone()).or_default();
            if !list.contains(&edge.from) {
                list.push(edge.from.clone());
            }
        }

        Ok(Graph {
            name: self.name,
            steps,
            edges: self.edges,
            order,
            preds,
            start: self.start,
            default_retry: self.default_retry,
        })
    }
}

/// Topological sort over the step/edge graph; any cycle is an error.
fn reject_cycles<A>(order: &[String], edges: &[Edge<A>]) -> Result<()> {
    let mut graph = DiGraph::<&str, ()>::new();
    let indices: HashMap<&str, _> = order
        .iter()
        .map(|name| (name.as_str(), graph.add_node(name.as_str())))
        .collect();

    for edge in edges {
        graph.add_edge(
            indices[edge.from.as_str()],
            indices[edge.to.as_str()],
            (),
        );
    }

    toposort(&graph, None).map_err(|cycle| {
        FlowError::InvalidGraph(format!(
            "cycle detected involving step '{}'",
            graph[cycle.node_id()]
        ))
    })?;
    Ok(())
}

/// A validated step graph.
///
/// Runs are driven by an explicit ready queue: each round collects every step
/// whose in-scope predecessors have settled and that some fired edge (or the
/// start) selected, runs their `prep` in turn, their `exec` concurrently, and
/// their `post` in name order.
pub struct Graph<A: Action> {
    name: String,
    steps: HashMap<String, Box<dyn DynStep<A>>>,
    edges: Vec<Edge<A>>,
    /// Step names, sorted. Fixes the order of prep/post within a round.
    order: Vec<String>,
    preds: HashMap<String, Vec<String>>,
    start: Option<String>,
    default_retry: RetryPolicy,
}

/// Per-run scheduling state. Names borrow from the graph.
struct RunState<'g> {
    scope: HashSet<&'g str>,
    activated: HashSet<&'g str>,
    settled: HashSet<&'g str>,
    skipped: Vec<String>,
}

impl<A: Action> Graph<A> {
    pub fn builder(name: impl Into<String>) -> GraphBuilder<A> {
        GraphBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn step_names(&self) -> &[String] {
        &self.order
    }

    pub fn edges(&self) -> &[Edge<A>] {
        &self.edges
    }

    /// Steps with no incoming edge.
    pub fn entry_steps(&self) -> Vec<&str> {
        self.order
            .iter()
            .filter(|n| self.preds.get(*n).map_or(true, |p| p.is_empty()))
            .map(String::as_str)
            .collect()
    }

    /// Execute the graph from its configured start (or its entry steps).
    pub async fn execute(&self, store: &mut SharedStore) -> Result<ExecutionResult<A>> {
        self.run(self.start.as_deref(), store).await
    }

    /// Execute the graph starting at `start`, ignoring steps it cannot reach.
    pub async fn execute_from(
        &self,
        start: &str,
        store: &mut SharedStore,
    ) -> Result<ExecutionResult<A>> {
        if !self.steps.contains_key(start) {
            return Err(FlowError::InvalidGraph(format!(
                "start step '{}' not found in graph '{}'",
                start, self.name
            )));
        }
        self.run(Some(start), store).await
    }

    async fn run(&self, start: Option<&str>, store: &mut SharedStore) -> Result<ExecutionResult<A>> {
        let run_id = Uuid::new_v4();
        let started = Instant::now();

        let mut state = match start {
            Some(name) => {
                let name = self.canonical(name);
                RunState {
                    scope: self.reachable_from(name),
                    activated: HashSet::from([name]),
                    settled: HashSet::new(),
                    skipped: Vec::new(),
                }
            }
            None => RunState {
                scope: self.order.iter().map(String::as_str).collect(),
                activated: self.entry_steps().into_iter().collect(),
                settled: HashSet::new(),
                skipped: Vec::new(),
            },
        };

        info!(
            graph = %self.name,
            run_id = %run_id,
            start = start.unwrap_or("<entry>"),
            steps = state.scope.len(),
            "Starting graph run"
        );

        let mut results: Vec<StepResult<A>> = Vec::new();
        let mut terminal_actions = Vec::new();
        let mut round = 0usize;

        loop {
            self.skip_unselected(&mut state);

            let ready: Vec<&str> = self
                .order
                .iter()
                .map(String::as_str)
                .filter(|n| {
                    state.scope.contains(n)
                        && !state.settled.contains(n)
                        && state.activated.contains(n)
                        && self.preds_settled(n, &state)
                })
                .collect();

            if ready.is_empty() {
                break;
            }
            round += 1;
            debug!(graph = %self.name, round, ready = ?ready, "Scheduling round");

            // prep: sequential, read-only access to the store
            let mut prepared = Vec::with_capacity(ready.len());
            for &name in &ready {
                match self.steps[name].prepare(store, self.default_retry) {
                    Ok(p) => prepared.push(p),
                    Err(e) => return Err(self.abort(name, e, store)),
                }
            }

            // exec: concurrent, no store access
            let outcomes = join_all(prepared.into_iter().map(|p| async move {
                let t = Instant::now();
                let outcome = p.execute().await;
                (outcome, t.elapsed())
            }))
            .await;

            let mut executed: Vec<(&str, Box<dyn Executed<A> + '_>, Duration)> =
                Vec::with_capacity(outcomes.len());
            for (&name, (outcome, elapsed)) in ready.iter().zip(outcomes) {
                match outcome {
                    Ok(done) => executed.push((name, done, elapsed)),
                    Err(e) => return Err(self.abort(name, e, store)),
                }
            }

            // post: sequential, in name order; edges evaluated right after each post
            for (name, done, elapsed) in executed {
                let action = match done.post(store) {
                    Ok(a) => a,
                    Err(e) => return Err(self.abort(name, e, store)),
                };
                state.settled.insert(name);

                let fired = self.fire_edges(name, &action, store, &mut state);
                debug!(
                    graph = %self.name,
                    step = name,
                    action = ?action,
                    fired,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Step complete"
                );
                if fired == 0 {
                    terminal_actions.push((name.to_string(), action.clone()));
                }
                results.push(StepResult {
                    step: name.to_string(),
                    action,
                    round,
                    elapsed_ms: elapsed.as_millis() as u64,
                });
            }
        }

        let total_elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            graph = %self.name,
            run_id = %run_id,
            executed = results.len(),
            skipped = state.skipped.len(),
            total_elapsed_ms,
            "Graph run complete"
        );

        Ok(ExecutionResult {
            run_id,
            last_action: results.last().map(|r| r.action.clone()),
            steps: results,
            skipped: state.skipped,
            terminal_actions,
            total_elapsed_ms,
        })
    }

    /// The graph-owned copy of a step name.
    fn canonical(&self, name: &str) -> &str {
        self.order
            .iter()
            .find(|n| n.as_str() == name)
            .map(String::as_str)
            .unwrap_or_default()
    }

    fn reachable_from<'g>(&'g self, start: &'g str) -> HashSet<&'g str> {
        let mut seen = HashSet::from([start]);
        let mut queue = VecDeque::from([start]);
        while let Some(current) = queue.pop_front() {
            for edge in self.edges.iter().filter(|e| e.from == current) {
                if seen.insert(edge.to.as_str()) {
                    queue.push_back(edge.to.as_str());
                }
            }
        }
        seen
    }

    fn preds_settled(&self, name: &str, state: &RunState<'_>) -> bool {
        self.preds.get(name).map_or(true, |preds| {
            preds
                .iter()
                .all(|p| !state.scope.contains(p.as_str()) || state.settled.contains(p.as_str()))
        })
    }

    /// Settle, transitively, every in-scope step that can no longer be selected.
    fn skip_unselected<'g>(&'g self, state: &mut RunState<'g>) {
        loop {
            let newly: Vec<&'g str> = self
                .order
                .iter()
                .map(String::as_str)
                .filter(|n| {
                    state.scope.contains(n)
                        && !state.settled.contains(n)
                        && !state.activated.contains(n)
                        && self.preds_settled(n, &*state)
                })
                .collect();
            if newly.is_empty() {
                return;
            }
            for name in newly {
                debug!(graph = %self.name, step = name, "Step not selected, skipping");
                state.settled.insert(name);
                state.skipped.push(name.to_string());
            }
        }
    }

    /// Activate the targets of every outgoing edge whose condition holds.
    fn fire_edges<'g>(
        &'g self,
        from: &str,
        action: &A,
        store: &SharedStore,
        state: &mut RunState<'g>,
    ) -> usize {
        let mut fired = 0;
        for edge in self.edges.iter().filter(|e| e.from == from) {
            if edge.condition.fires(action, store) {
                debug!(graph = %self.name, from, to = %edge.to, "Edge fired");
                state.activated.insert(edge.to.as_str());
                fired += 1;
            }
        }
        fired
    }

    fn abort(&self, step: &str, error: FlowError, store: &mut SharedStore) -> FlowError {
        record_run_error(&self.name, step, error, store)
    }
}

/// Record a failed run under [`RUN_ERROR_KEY`] and hand the error back.
pub(crate) fn record_run_error(
    graph: &str,
    step: &str,
    error: FlowError,
    store: &mut SharedStore,
) -> FlowError {
    error!(graph, step, error = %error, "Run aborted");
    store.set(
        RUN_ERROR_KEY,
        serde_json::json!({
            "graph": graph,
            "step": step,
            "error": error.to_string(),
        }),
    );
    error
}
