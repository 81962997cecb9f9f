use std::collections::BTreeMap;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use pipewright_core::error::{FlowError, Result};

/// A typed handle to one entry of the [`SharedStore`].
///
/// Declaring keys as constants gives compile-time-checked reads and writes:
///
/// ```
/// use pipewright_flow::StoreKey;
/// const SCORE: StoreKey<f64> = StoreKey::new("fit_score");
/// ```
pub struct StoreKey<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> StoreKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for StoreKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for StoreKey<T> {}

impl<T> std::fmt::Debug for StoreKey<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StoreKey({})", self.name)
    }
}

/// Mutable state threaded through every step of a run.
///
/// Only `prep` (read) and `post` (write) see the store. Keys are strings,
/// values are JSON; ordering is stable so snapshots serialize identically.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SharedStore {
    data: BTreeMap<String, serde_json::Value>,
}

impl SharedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store from initial data.
    pub fn from_map(data: BTreeMap<String, serde_json::Value>) -> Self {
        Self { data }
    }

    /// Get a value by key.
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    /// Get a value as a string, if it's a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// Get a value that `step` cannot run without.
    pub fn require(&self, step: &str, key: &str) -> Result<&serde_json::Value> {
        self.data.get(key).ok_or_else(|| FlowError::MissingStateKey {
            step: step.to_string(),
            key: key.to_string(),
        })
    }

    /// Get a required value and deserialize it.
    pub fn require_as<T: DeserializeOwned>(&self, step: &str, key: &str) -> Result<T> {
        let value = self.require(step, key)?;
        serde_json::from_value(value.clone()).map_err(|e| FlowError::InvalidStateValue {
            key: key.to_string(),
            message: e.to_string(),
        })
    }

    /// Read a typed key. `Ok(None)` when absent.
    pub fn read<T: DeserializeOwned>(&self, key: StoreKey<T>) -> Result<Option<T>> {
        match self.data.get(key.name) {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone()).map(Some).map_err(|e| {
                FlowError::InvalidStateValue {
                    key: key.name.to_string(),
                    message: e.to_string(),
                }
            }),
        }
    }

    /// Read a typed key that `step` cannot run without.
    pub fn read_required<T: DeserializeOwned>(&self, step: &str, key: StoreKey<T>) -> Result<T> {
        self.require_as(step, key.name)
    }

    /// Write a typed key.
    pub fn write<T: Serialize>(&mut self, key: StoreKey<T>, value: &T) -> Result<()> {
        self.data
            .insert(key.name.to_string(), serde_json::to_value(value)?);
        Ok(())
    }

    /// Set a value.
    pub fn set(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.data.insert(key.into(), value);
    }

    /// Set a string value.
    pub fn set_str(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.data
            .insert(key.into(), serde_json::Value::String(value.into()));
    }

    pub fn remove(&mut self, key: &str) -> Option<serde_json::Value> {
        self.data.remove(key)
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Merge another store into this one (overwrites on conflict).
    pub fn merge(&mut self, other: &SharedStore) {
        self.extend(other.data.clone());
    }

    /// Insert every entry of `entries`, replacing existing keys wholesale.
    pub fn extend(&mut self, entries: BTreeMap<String, serde_json::Value>) {
        self.data.extend(entries);
    }

    /// The subset of the store named by `keys`. Absent keys are left out.
    pub fn project(&self, keys: &[String]) -> BTreeMap<String, serde_json::Value> {
        keys.iter()
            .filter_map(|k| self.data.get(k).map(|v| (k.clone(), v.clone())))
            .collect()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.data.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Get the underlying data map.
    pub fn data(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.data
    }
}
