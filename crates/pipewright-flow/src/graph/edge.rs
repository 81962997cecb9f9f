use std::fmt;
use std::sync::Arc;

use crate::action::Action;
use crate::store::SharedStore;

/// Store predicate attached to an edge.
pub type StorePredicate = Arc<dyn Fn(&SharedStore) -> bool + Send + Sync>;

/// An edge connecting two steps in the graph.
#[derive(Clone)]
pub struct Edge<A> {
    /// Source step name.
    pub from: String,
    /// Target step name.
    pub to: String,
    /// Condition that must hold, when the source completes, for the edge to fire.
    pub condition: EdgeCondition<A>,
}

/// Condition for traversing an edge.
#[derive(Clone)]
pub enum EdgeCondition<A> {
    /// Always traverse this edge.
    Always,
    /// Traverse when the source step's `post` returned this action.
    OnAction(A),
    /// Traverse if a simple expression over the store matches.
    /// Supported: `key == "value"`, `key != "value"`, `key contains "substr"`.
    Conditional { expr: String },
    /// Traverse if the closure returns true for the store.
    Predicate {
        label: String,
        check: StorePredicate,
    },
}

impl<A: fmt::Debug> fmt::Debug for EdgeCondition<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EdgeCondition::Always => write!(f, "Always"),
            EdgeCondition::OnAction(a) => write!(f, "OnAction({:?})", a),
            EdgeCondition::Conditional { expr } => write!(f, "Conditional({})", expr),
            EdgeCondition::Predicate { label, .. } => write!(f, "Predicate({})", label),
        }
    }
}

impl<A: fmt::Debug> fmt::Debug for Edge<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Edge")
            .field("from", &self.from)
            .field("to", &self.to)
            .field("condition", &self.condition)
            .finish()
    }
}

impl<A: Action> EdgeCondition<A> {
    /// Whether the edge fires given the source's action and the updated store.
    pub fn fires(&self, action: &A, store: &SharedStore) -> bool {
        match self {
            EdgeCondition::Always => true,
            EdgeCondition::OnAction(expected) => expected == action,
            EdgeCondition::Conditional { expr } => evaluate_condition(expr, store),
            EdgeCondition::Predicate { check, .. } => check(store),
        }
    }
}

impl<A> Edge<A> {
    /// Create an unconditional edge.
    pub fn always(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: EdgeCondition::Always,
        }
    }

    /// Create an edge selected by the source's returned action.
    pub fn on_action(from: impl Into<String>, action: A, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: EdgeCondition::OnAction(action),
        }
    }

    /// Create a conditional edge.
    pub fn conditional(
        from: impl Into<String>,
        to: impl Into<String>,
        expr: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: EdgeCondition::Conditional { expr: expr.into() },
        }
    }

    /// Create an edge guarded by a store predicate.
    pub fn when<F>(
        from: impl Into<String>,
        to: impl Into<String>,
        label: impl Into<String>,
        check: F,
    ) -> Self
    where
        F: Fn(&SharedStore) -> bool + Send + Sync + 'static,
    {
        Self {
            from: from.into(),
            to: to.into(),
            condition: EdgeCondition::Predicate {
                label: label.into(),
                check: Arc::new(check),
            },
        }
    }
}

/// Evaluate a simple conditional expression against the store.
///
/// Supported expressions:
/// - `key == "value"`: exact match
/// - `key != "value"`: not equal
/// - `key contains "substr"`: substring match
///
/// Scalars that aren't strings (numbers, booleans) compare by their JSON
/// rendering, so `fit_score == "7"` matches the number 7. Returns `false`
/// for unparseable expressions and missing keys.
pub fn evaluate_condition(expr: &str, store: &SharedStore) -> bool {
    let expr = expr.trim();

    // key contains "value"
    if let Some((key, substr)) = parse_operator(expr, "contains") {
        return scalar_text(store, key).is_some_and(|s| s.contains(substr));
    }

    // key != "value"
    if let Some((key, value)) = parse_operator(expr, "!=") {
        return scalar_text(store, key).is_some_and(|s| s != value);
    }

    // key == "value"
    if let Some((key, value)) = parse_operator(expr, "==") {
        return scalar_text(store, key).is_some_and(|s| s == value);
    }

    false
}

fn scalar_text(store: &SharedStore, key: &str) -> Option<String> {
    match store.get(key)? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Parse `key OP "value"` expressions, returning (key, value).
fn parse_operator<'a>(expr: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    let parts: Vec<&str> = expr.splitn(2, op).collect();
    if parts.len() != 2 {
        return None;
    }
    let key = parts[0].trim();
    if key.is_empty() || key.contains(' ') {
        return None;
    }
    let val = parts[1].trim().trim_matches('"');
    Some((key, val))
}
