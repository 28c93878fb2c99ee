//! Per-model metadata the sink needs to compile mutations, loaded once from
//! a schema document.

use crate::errors::{Result, SinkError};
use crate::values;
use rustworkx_core::petgraph::algo::toposort;
use rustworkx_core::petgraph::graph::{DiGraph, NodeIndex};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// Backend id column every synchronized table exposes.
pub const ID_COLUMN: &str = "id";
/// Server-stamped freshness column, refreshed on every root upsert.
pub const REFRESHED_AT_COLUMN: &str = "refreshedAt";
/// Lineage column naming the source a row was synced from.
pub const ORIGIN_COLUMN: &str = "origin";
/// Source identity column; a present-but-null value marks a broken record.
pub const UID_COLUMN: &str = "uid";

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ModelReference {
    /// Target model name.
    pub model: String,
    /// Column on this table carrying the target's id.
    pub column: String,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ModelSchema {
    pub table: String,
    /// Column names forming the source identity of a row.
    pub primary_keys: Vec<String>,
    /// Column name to backend type, `id` excluded.
    pub scalars: BTreeMap<String, String>,
    /// Nested-object field name to reference target.
    #[serde(default)]
    pub references: BTreeMap<String, ModelReference>,
    /// Relationship fields other tables point at this one through.
    #[serde(default)]
    pub back_references: Vec<String>,
    /// Overrides the `<table>_pkey` conflict constraint.
    #[serde(default)]
    pub conflict_constraint: Option<String>,
}

impl ModelSchema {
    /// Name of the unique constraint targeted by upserts.
    pub fn conflict_constraint(&self) -> String {
        match &self.conflict_constraint {
            Some(name) => name.clone(),
            None => format!("{}_pkey", self.table),
        }
    }

    pub fn scalar_type(&self, column: &str) -> Option<&str> {
        self.scalars.get(column).map(String::as_str)
    }

    /// Columns eligible for conflict updates: every scalar except the key
    /// parts.
    pub fn updatable_columns(&self) -> Vec<String> {
        self.scalars
            .keys()
            .filter(|column| !self.primary_keys.contains(column))
            .cloned()
            .collect()
    }

    /// FK columns whose reference targets `own_model` itself.
    pub fn self_reference_columns(&self, own_model: &str) -> Vec<&str> {
        self.references
            .values()
            .filter(|reference| reference.model == own_model)
            .map(|reference| reference.column.as_str())
            .collect()
    }

    /// Serializes the primary key of `object` into a stable lookup string.
    ///
    /// Missing parts are encoded with a sentinel so an absent key and an
    /// explicit null never collide.
    pub fn key_signature(&self, object: &Map<String, Value>) -> String {
        let parts: Vec<Value> = self
            .primary_keys
            .iter()
            .map(|key| match object.get(key) {
                Some(value) => {
                    let field_type = self.scalar_type(key).unwrap_or("");
                    values::normalize_key_part(field_type, value)
                }
                None => Value::String(values::MISSING_KEY_PART.to_string()),
            })
            .collect();
        Value::Array(parts).to_string()
    }
}

#[derive(Deserialize, Debug)]
struct SchemaDocument {
    models: BTreeMap<String, ModelSchema>,
}

/// Immutable view over every model the sink can write.
#[derive(Debug, Clone)]
pub struct SchemaView {
    models: BTreeMap<String, ModelSchema>,
    order: Vec<String>,
}

impl SchemaView {
    /// Parses a schema document, validates it, and derives the model write
    /// order.
    pub fn from_json(document: &str) -> Result<Self> {
        let document: SchemaDocument = serde_json::from_str(document)?;
        Self::from_models(document.models)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_models(models: BTreeMap<String, ModelSchema>) -> Result<Self> {
        for (name, model) in &models {
            if model.primary_keys.is_empty() {
                return Err(SinkError::Schema(format!(
                    "model '{}' declares no primary keys",
                    name
                )));
            }
            for key in &model.primary_keys {
                if !model.scalars.contains_key(key) {
                    return Err(SinkError::Schema(format!(
                        "model '{}' lists primary key '{}' without a scalar type",
                        name, key
                    )));
                }
            }
            for required in [ORIGIN_COLUMN, REFRESHED_AT_COLUMN] {
                if !model.scalars.contains_key(required) {
                    return Err(SinkError::Schema(format!(
                        "model '{}' is missing required lineage column '{}'",
                        name, required
                    )));
                }
            }
            for (field, reference) in &model.references {
                if !models.contains_key(&reference.model) {
                    return Err(SinkError::Schema(format!(
                        "model '{}' reference '{}' targets unknown model '{}'",
                        name, field, reference.model
                    )));
                }
                if !model.scalars.contains_key(&reference.column) {
                    return Err(SinkError::Schema(format!(
                        "model '{}' reference '{}' uses undeclared column '{}'",
                        name, field, reference.column
                    )));
                }
            }
        }
        let order = derive_order(&models)?;
        Ok(Self { models, order })
    }

    pub fn model(&self, name: &str) -> Result<&ModelSchema> {
        self.models
            .get(name)
            .ok_or_else(|| SinkError::Schema(format!("unknown model '{}'", name)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }

    /// Model names with every referenced model ahead of its dependents.
    pub fn dependency_order(&self) -> &[String] {
        &self.order
    }

    pub fn models(&self) -> impl Iterator<Item = (&String, &ModelSchema)> {
        self.models.iter()
    }
}

/// Topological order over cross-model references. Self references are
/// handled by per-flush leveling, so they do not appear in the graph.
fn derive_order(models: &BTreeMap<String, ModelSchema>) -> Result<Vec<String>> {
    let mut graph = DiGraph::<&str, ()>::new();
    let mut indices: HashMap<&str, NodeIndex> = HashMap::new();
    for name in models.keys() {
        indices.insert(name.as_str(), graph.add_node(name.as_str()));
    }
    for (name, model) in models {
        for reference in model.references.values() {
            if reference.model == *name {
                continue;
            }
            graph.add_edge(
                indices[reference.model.as_str()],
                indices[name.as_str()],
                (),
            );
        }
    }
    match toposort(&graph, None) {
        Ok(sorted) => Ok(sorted
            .into_iter()
            .map(|index| graph[index].to_string())
            .collect()),
        Err(cycle) => Err(SinkError::Schema(format!(
            "reference cycle involving model '{}'",
            graph[cycle.node_id()]
        ))),
    }
}
