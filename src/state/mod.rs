//! Shared graph state and partial updates
//!
//! A `State` is created per invocation from the schema, handed to nodes as a
//! read-only snapshot, and only changed by the executor when it merges the
//! `StateUpdate`s of a completed step.

use crate::error::OrchestrationError;
use crate::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

mod schema;

pub use schema::{FieldSpec, FieldType, Reducer, StateSchema, StateSchemaBuilder};

/// Field name → value mapping for one invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct State {
    values: BTreeMap<String, Value>,
}

impl State {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(Value::as_str)
    }

    pub fn get_i64(&self, field: &str) -> Option<i64> {
        self.get(field).and_then(Value::as_i64)
    }

    pub fn get_f64(&self, field: &str) -> Option<f64> {
        self.get(field).and_then(Value::as_f64)
    }

    pub fn get_bool(&self, field: &str) -> Option<bool> {
        self.get(field).and_then(Value::as_bool)
    }

    pub fn get_list(&self, field: &str) -> Option<&[Value]> {
        self.get(field).and_then(Value::as_array).map(Vec::as_slice)
    }

    /// Deserialize a field into a concrete type (e.g. a list of messages).
    pub fn get_as<T: DeserializeOwned>(&self, field: &str) -> Result<T> {
        let value = self
            .get(field)
            .ok_or_else(|| OrchestrationError::UnknownField(field.to_string()))?;
        Ok(serde_json::from_value(value.clone())?)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    pub fn to_json(&self) -> Value {
        Value::Object(self.values.clone().into_iter().collect())
    }

    pub(crate) fn insert(&mut self, field: String, value: Value) {
        self.values.insert(field, value);
    }

    pub(crate) fn extend_list(&mut self, field: &str, items: Vec<Value>) {
        let slot = self
            .values
            .entry(field.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));

        match slot {
            Value::Array(existing) => existing.extend(items),
            other => *other = Value::Array(items),
        }
    }
}

/// Partial update: a subset of declared fields and their new values.
///
/// For append fields the value is the list of items to add.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateUpdate {
    values: BTreeMap<String, Value>,
}

impl StateUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(field, value);
        self
    }

    /// Add one item to a list-valued write, creating the list if needed.
    pub fn push(mut self, field: impl Into<String>, item: impl Into<Value>) -> Self {
        let slot = self
            .values
            .entry(field.into())
            .or_insert_with(|| Value::Array(Vec::new()));

        match slot {
            Value::Array(items) => items.push(item.into()),
            other => {
                let previous = other.take();
                *other = Value::Array(vec![previous, item.into()]);
            }
        }
        self
    }

    /// Serialize `value` into `field`.
    pub fn set_serialized<T: Serialize>(self, field: impl Into<String>, value: &T) -> Result<Self> {
        Ok(self.set(field, serde_json::to_value(value)?))
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(field.into(), value.into());
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }
}

impl From<Map<String, Value>> for StateUpdate {
    fn from(map: Map<String, Value>) -> Self {
        Self {
            values: map.into_iter().collect(),
        }
    }
}

impl TryFrom<Value> for StateUpdate {
    type Error = OrchestrationError;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(map.into()),
            other => Err(OrchestrationError::InvalidUpdate {
                field: "<root>".to_string(),
                reason: format!("expected a JSON object, got {}", other),
            }),
        }
    }
}
