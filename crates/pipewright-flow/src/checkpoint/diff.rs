use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What happened to a leaf between the checkpoint and the edited state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModificationKind {
    Added,
    Modified,
    Deleted,
    TypeChanged,
    ListSizeChanged,
}

/// One changed leaf. `path` uses `a.b[2]` notation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Modification {
    pub path: String,
    pub action: ModificationKind,
    pub original: Option<Value>,
    pub modified: Option<Value>,
}

impl std::fmt::Display for Modification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let render = |v: &Option<Value>| v.as_ref().map_or("-".to_string(), Value::to_string);
        write!(
            f,
            "{} {:?}: {} -> {}",
            self.path,
            self.action,
            render(&self.original),
            render(&self.modified)
        )
    }
}

/// Compare two top-level states, descending into mappings and equal-length lists.
pub fn diff_states(
    base: &BTreeMap<String, Value>,
    merged: &BTreeMap<String, Value>,
) -> Vec<Modification> {
    let mut out = Vec::new();
    let keys: BTreeSet<&String> = base.keys().chain(merged.keys()).collect();
    for key in keys {
        diff_entry(key.clone(), base.get(key), merged.get(key), &mut out);
    }
    out
}

fn diff_entry(path: String, original: Option<&Value>, modified: Option<&Value>, out: &mut Vec<Modification>) {
    match (original, modified) {
        (None, None) => {}
        (None, Some(m)) => out.push(change(path, ModificationKind::Added, None, Some(m))),
        (Some(o), None) => out.push(change(path, ModificationKind::Deleted, Some(o), None)),
        (Some(o), Some(m)) => diff_value(path, o, m, out),
    }
}

fn diff_value(path: String, original: &Value, modified: &Value, out: &mut Vec<Modification>) {
    match (original, modified) {
        (Value::Object(a), Value::Object(b)) => {
            let keys: BTreeSet<&String> = a.keys().chain(b.keys()).collect();
            for key in keys {
                diff_entry(format!("{path}.{key}"), a.get(key), b.get(key), out);
            }
        }
        (Value::Array(a), Value::Array(b)) if a.len() != b.len() => {
            out.push(change(path, ModificationKind::ListSizeChanged, Some(original), Some(modified)));
        }
        (Value::Array(a), Value::Array(b)) => {
            for (i, (x, y)) in a.iter().zip(b).enumerate() {
                diff_value(format!("{path}[{i}]"), x, y, out);
            }
        }
        (a, b) if std::mem::discriminant(a) != std::mem::discriminant(b) => {
            out.push(change(path, ModificationKind::TypeChanged, Some(a), Some(b)));
        }
        (a, b) if a != b => {
            out.push(change(path, ModificationKind::Modified, Some(a), Some(b)));
        }
        _ => {}
    }
}

fn change(
    path: String,
    action: ModificationKind,
    original: Option<&Value>,
    modified: Option<&Value>,
) -> Modification {
    Modification {
        path,
        action,
        original: original.cloned(),
        modified: modified.cloned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state(value: Value) -> BTreeMap<String, Value> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_no_changes() {
        let s = state(json!({"a": 1, "b": {"c": [1, 2]}}));
        assert!(diff_states(&s, &s).is_empty());
    }

    #[test]
    fn test_scalar_edit_is_single_modified() {
        let base = state(json!({"a": 1, "b": 2}));
        let merged = state(json!({"a": 9, "b": 2}));
        let mods = diff_states(&base, &merged);
        assert_eq!(mods.len(), 1);
        assert_eq!(mods[0].path, "a");
        assert_eq!(mods[0].action, ModificationKind::Modified);
        assert_eq!(mods[0].original, Some(json!(1)));
        assert_eq!(mods[0].modified, Some(json!(9)));
    }

    #[test]
    fn test_nested_leaves() {
        let base = state(json!({"mapping": {"rust": "5y", "k8s": "2y"}, "skills": ["a", "b"]}));
        let merged = state(json!({
            "mapping": {"rust": "6y", "go": "1y"},
            "skills": ["a", "c"],
            "notes": "added by reviewer",
        }));
        let mods = diff_states(&base, &merged);
        let summary: Vec<(&str, ModificationKind)> =
            mods.iter().map(|m| (m.path.as_str(), m.action)).collect();
        assert_eq!(
            summary,
            vec![
                ("mapping.go", ModificationKind::Added),
                ("mapping.k8s", ModificationKind::Deleted),
                ("mapping.rust", ModificationKind::Modified),
                ("notes", ModificationKind::Added),
                ("skills[1]", ModificationKind::Modified),
            ]
        );
    }

    #[test]
    fn test_type_and_list_size_changes() {
        let base = state(json!({"score": 7, "items": [1, 2, 3]}));
        let merged = state(json!({"score": "seven", "items": [1]}));
        let mods = diff_states(&base, &merged);
        assert_eq!(mods[0].path, "items");
        assert_eq!(mods[0].action, ModificationKind::ListSizeChanged);
        assert_eq!(mods[1].path, "score");
        assert_eq!(mods[1].action, ModificationKind::TypeChanged);
    }

    #[test]
    fn test_serialized_kind_labels() {
        assert_eq!(
            serde_json::to_value(ModificationKind::ListSizeChanged).unwrap(),
            json!("list_size_changed")
        );
    }
}
