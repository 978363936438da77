//! State schema: declared fields, their semantic types and reduce policies

use super::{State, StateUpdate};
use crate::error::OrchestrationError;
use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

//
// ================= Enums =================
//

/// How concurrent and sequential writes to a field are combined.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Reducer {
    /// Last write wins. Two writers in one step is a merge conflict.
    Replace,
    /// Writes are concatenated in declared branch order.
    Append,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Text,
    Integer,
    Number,
    Boolean,
    Record,
    List,
    Any,
}

impl FieldType {
    /// `null` is accepted by every type and means "unset".
    pub fn accepts(&self, value: &Value) -> bool {
        if value.is_null() {
            return true;
        }

        match self {
            FieldType::Text => value.is_string(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Number => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Record => value.is_object(),
            FieldType::List => value.is_array(),
            FieldType::Any => true,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FieldType::Text => "text",
            FieldType::Integer => "integer",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::Record => "record",
            FieldType::List => "list",
            FieldType::Any => "any",
        };
        write!(f, "{}", s)
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "text",
        Value::Array(_) => "list",
        Value::Object(_) => "record",
    }
}

//
// ================= Field =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub field_type: FieldType,
    pub reducer: Reducer,
    pub default: Value,
}

impl FieldSpec {
    /// A last-write-wins field, `null` until written.
    pub fn replace(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            reducer: Reducer::Replace,
            default: Value::Null,
        }
    }

    /// An ordered log; starts empty.
    pub fn append(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field_type: FieldType::List,
            reducer: Reducer::Append,
            default: Value::Array(Vec::new()),
        }
    }

    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = default.into();
        self
    }

    fn check(&self, value: &Value) -> Result<()> {
        match self.reducer {
            // Single values are promoted to one-element lists.
            Reducer::Append => Ok(()),
            Reducer::Replace if self.field_type.accepts(value) => Ok(()),
            Reducer::Replace => Err(OrchestrationError::InvalidUpdate {
                field: self.name.clone(),
                reason: format!("expected {}, got {}", self.field_type, kind_of(value)),
            }),
        }
    }
}

fn into_items(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items.clone(),
        other => vec![other.clone()],
    }
}

//
// ================= Schema =================
//

/// Immutable set of declared state fields.
#[derive(Debug, Clone)]
pub struct StateSchema {
    fields: Vec<FieldSpec>,
    index: HashMap<String, usize>,
}

impl StateSchema {
    pub fn builder() -> StateSchemaBuilder {
        StateSchemaBuilder { fields: Vec::new() }
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.index.get(name).map(|i| &self.fields[*i])
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    /// Fresh state: declared defaults overlaid with caller input.
    ///
    /// Input to an append field replaces its default rather than extending it.
    pub fn initial_state(&self, input: &StateUpdate) -> Result<State> {
        let mut state = State::default();
        for spec in &self.fields {
            state.insert(spec.name.clone(), spec.default.clone());
        }

        for (field, value) in input.iter() {
            let spec = self
                .field(field)
                .ok_or_else(|| OrchestrationError::UnknownField(field.clone()))?;
            spec.check(value)?;

            let seeded = match spec.reducer {
                Reducer::Replace => value.clone(),
                Reducer::Append => Value::Array(into_items(value)),
            };
            state.insert(field.clone(), seeded);
        }

        Ok(state)
    }

    /// Merge the updates of one step into `state`.
    ///
    /// `writes` must be in declared branch order; append fields are extended in
    /// exactly that order. The merge is all-or-nothing: every update is
    /// validated before any field changes.
    pub fn merge(&self, state: &mut State, writes: &[(String, StateUpdate)]) -> Result<()> {
        let mut replaced: HashMap<&str, &str> = HashMap::new();

        for (node, update) in writes {
            for (field, value) in update.iter() {
                let spec = self
                    .field(field)
                    .ok_or_else(|| OrchestrationError::UnknownField(field.clone()).in_node(node))?;
                spec.check(value).map_err(|e| e.in_node(node))?;

                if spec.reducer == Reducer::Replace {
                    if let Some(first) = replaced.insert(field.as_str(), node.as_str()) {
                        return Err(OrchestrationError::MergeConflict {
                            field: field.clone(),
                            first: first.to_string(),
                            second: node.clone(),
                        });
                    }
                }
            }
        }

        for (_, update) in writes {
            for (field, value) in update.iter() {
                let Some(spec) = self.field(field) else {
                    continue;
                };

                match spec.reducer {
                    Reducer::Replace => state.insert(field.clone(), value.clone()),
                    Reducer::Append => state.extend_list(field, into_items(value)),
                }
            }
        }

        Ok(())
    }
}

pub struct StateSchemaBuilder {
    fields: Vec<FieldSpec>,
}

impl StateSchemaBuilder {
    pub fn field(mut self, spec: FieldSpec) -> Self {
        self.fields.push(spec);
        self
    }

    pub fn build(self) -> Result<StateSchema> {
        let mut index = HashMap::with_capacity(self.fields.len());

        for (i, spec) in self.fields.iter().enumerate() {
            if spec.name.trim().is_empty() {
                return Err(OrchestrationError::Schema(
                    "field names must not be empty".to_string(),
                ));
            }
            if index.insert(spec.name.clone(), i).is_some() {
                return Err(OrchestrationError::Schema(format!(
                    "duplicate field '{}'",
                    spec.name
                )));
            }
            if spec.reducer == Reducer::Append && !spec.default.is_array() {
                return Err(OrchestrationError::Schema(format!(
                    "append field '{}' needs a list default",
                    spec.name
                )));
            }
            if !spec.field_type.accepts(&spec.default) {
                return Err(OrchestrationError::Schema(format!(
                    "default for '{}' is not {}",
                    spec.name, spec.field_type
                )));
            }
        }

        Ok(StateSchema {
            fields: self.fields,
            index,
        })
    }
}
