//! Buffered upsert trees.
//!
//! Each incoming record becomes a tree of nodes held in an arena: nested
//! reference objects become parent nodes linked through foreign key slots
//! that are filled in once the parent's batch returns ids.

use crate::errors::{Result, SinkError};
use crate::schema::{ORIGIN_COLUMN, SchemaView, UID_COLUMN};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Index of a node in an [`UpsertBuffer`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UpsertId(pub usize);

/// One buffered row for one model.
#[derive(Debug, Clone)]
pub struct Upsert {
    pub model: String,
    /// Scalar columns collected from the record.
    pub object: Map<String, Value>,
    /// FK column name to the buffered node that will supply the id.
    pub foreign_keys: BTreeMap<String, UpsertId>,
    /// Backend id, filled in when this node's batch returns.
    pub id: Option<Value>,
    /// Lineage origin, stamped on roots only.
    pub origin: Option<String>,
    /// Whether this node entered through the ingestion surface.
    pub is_root: bool,
}

/// Arena of buffered nodes with per-model insertion-ordered lists.
#[derive(Debug, Default)]
pub struct UpsertBuffer {
    nodes: Vec<Upsert>,
    by_model: BTreeMap<String, Vec<UpsertId>>,
}

impl UpsertBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the node tree for one record and buffers it, returning the
    /// root node. Nothing is buffered when validation rejects the record.
    ///
    /// Nested reference objects recurse first, so referenced nodes always
    /// sit in the arena before the nodes that point at them.
    pub fn write(
        &mut self,
        schema: &SchemaView,
        model: &str,
        record: &Map<String, Value>,
        origin: Option<&str>,
    ) -> Result<UpsertId> {
        validate_record(schema, model, record)?;
        let root = self.write_node(schema, model, record)?;
        let node = self.node_mut(root);
        node.is_root = true;
        if let Some(origin) = origin {
            node.origin = Some(origin.to_string());
            node.object
                .insert(ORIGIN_COLUMN.to_string(), Value::String(origin.to_string()));
        }
        Ok(root)
    }

    fn write_node(
        &mut self,
        schema: &SchemaView,
        model: &str,
        record: &Map<String, Value>,
    ) -> Result<UpsertId> {
        let model_schema = schema.model(model)?;
        let mut object = Map::new();
        let mut foreign_keys = BTreeMap::new();

        for (field, value) in record {
            if let Some(reference) = model_schema.references.get(field) {
                match value {
                    // an explicit null detaches the reference
                    Value::Null => {
                        object.insert(reference.column.clone(), Value::Null);
                    }
                    Value::Object(nested) => {
                        let target = reference.model.clone();
                        let column = reference.column.clone();
                        let parent = self.write_node(schema, &target, nested)?;
                        foreign_keys.insert(column, parent);
                    }
                    other => {
                        return Err(SinkError::InvalidRecord(format!(
                            "model '{}': reference field '{}' must be an object or null, got {}",
                            model, field, other
                        )));
                    }
                }
            } else if model_schema.scalars.contains_key(field) {
                object.insert(field.clone(), value.clone());
            } else {
                log::debug!("model '{}': dropping unmapped field '{}'", model, field);
            }
        }

        Ok(self.push(Upsert {
            model: model.to_string(),
            object,
            foreign_keys,
            id: None,
            origin: None,
            is_root: false,
        }))
    }

    fn push(&mut self, node: Upsert) -> UpsertId {
        let id = UpsertId(self.nodes.len());
        self.by_model
            .entry(node.model.clone())
            .or_default()
            .push(id);
        self.nodes.push(node);
        id
    }

    pub fn node(&self, id: UpsertId) -> &Upsert {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: UpsertId) -> &mut Upsert {
        &mut self.nodes[id.0]
    }

    /// Buffer pressure: the length of the longest per-model list.
    pub fn pressure(&self) -> usize {
        self.by_model.values().map(Vec::len).max().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes still waiting in per-model lists.
    pub fn queued(&self) -> usize {
        self.by_model.values().map(Vec::len).sum()
    }

    /// Removes and returns the buffered list for one model.
    pub fn take_model(&mut self, model: &str) -> Vec<UpsertId> {
        self.by_model.remove(model).unwrap_or_default()
    }

    /// Drops everything, including nodes whose lists were already taken.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.by_model.clear();
    }
}

/// Walks the record tree before anything is buffered, so a rejected record
/// leaves the buffer exactly as it was.
fn validate_record(schema: &SchemaView, model: &str, record: &Map<String, Value>) -> Result<()> {
    if matches!(record.get(UID_COLUMN), Some(Value::Null)) {
        return Err(SinkError::InvalidRecord(format!(
            "model '{}': '{}' is null",
            model, UID_COLUMN
        )));
    }
    let model_schema = schema.model(model)?;
    for (field, reference) in &model_schema.references {
        match record.get(field) {
            Some(Value::Object(nested)) => validate_record(schema, &reference.model, nested)?,
            Some(Value::Null) | None => {}
            Some(other) => {
                return Err(SinkError::InvalidRecord(format!(
                    "model '{}': reference field '{}' must be an object or null, got {}",
                    model, field, other
                )));
            }
        }
    }
    Ok(())
}
