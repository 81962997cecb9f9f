//! Typed routing actions.
//!
//! Each graph routes on its own closed enum. The enum's serde representation
//! doubles as its persisted label, so a checkpoint's `next_action` can be
//! turned back into a variant on resume.

use std::fmt::Debug;
use std::hash::Hash;

use serde::de::DeserializeOwned;
use serde::Serialize;

use pipewright_core::error::{FlowError, Result};

/// A routing label returned by a step's `post`.
///
/// Implemented for any unit-variant enum deriving the listed traits, e.g.
///
/// ```
/// #[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
/// #[serde(rename_all = "snake_case")]
/// enum Route { Continue, Pause, Retry }
/// ```
pub trait Action:
    Clone + Eq + Hash + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> Action for T where
    T: Clone + Eq + Hash + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// The string label of an action (its serde representation).
pub fn action_label<A: Action>(action: &A) -> Result<String> {
    match serde_json::to_value(action)? {
        serde_json::Value::String(s) => Ok(s),
        other => Err(FlowError::InvalidGraph(format!(
            "action {:?} does not serialize to a plain label (got {})",
            action, other
        ))),
    }
}

/// Turn a persisted label back into an action.
pub fn parse_action<A: Action>(label: &str) -> Option<A> {
    serde_json::from_value(serde_json::Value::String(label.to_string())).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    enum Route {
        Continue,
        NeedsReview,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
    enum Carrying {
        Jump(u32),
    }

    #[test]
    fn test_label_roundtrip() {
        assert_eq!(action_label(&Route::NeedsReview).unwrap(), "needs_review");
        assert_eq!(parse_action::<Route>("continue"), Some(Route::Continue));
        assert_eq!(parse_action::<Route>("contnue"), None);
    }

    #[test]
    fn test_non_unit_action_has_no_label() {
        let err = action_label(&Carrying::Jump(3)).unwrap_err();
        assert!(err.to_string().contains("plain label"));
    }
}
