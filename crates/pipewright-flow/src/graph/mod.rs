//! Step graphs: validated DAGs of steps routed by typed actions.
//!
//! A graph is a set of named `Step`s connected by `Edge`s. Each edge fires on
//! an action (`OnAction`), unconditionally (`Always`), on a store expression
//! (`Conditional`) or on a closure over the store (`Predicate`).
//!
//! `Graph::execute` schedules steps in rounds. Every step whose predecessors
//! have settled and that a fired edge selected runs in the round; their
//! `exec` phases run concurrently, so fan-out branches overlap and a join
//! step waits for all of them.

pub mod edge;
pub mod executor;

pub use edge::{evaluate_condition, Edge, EdgeCondition, StorePredicate};
pub use executor::{ExecutionResult, Graph, GraphBuilder, StepResult, RUN_ERROR_KEY};
