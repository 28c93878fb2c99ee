//! Compiles buffered nodes into executable bulk upsert mutations.

use crate::errors::{Result, SinkError};
use crate::graphql;
use crate::schema::{ID_COLUMN, ModelSchema, REFRESHED_AT_COLUMN};
use crate::upsert::{UpsertBuffer, UpsertId};
use serde_json::{Map, Value};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};

/// One executable upsert plus the index needed to scatter returned ids.
#[derive(Debug)]
pub struct UpsertOp {
    pub model: String,
    pub mutation: String,
    /// Primary key signature to the buffered nodes merged into that row.
    pub by_key: HashMap<String, Vec<UpsertId>>,
    /// Whether this group carries ingestion roots.
    pub is_root: bool,
}

struct MergedRow {
    object: Map<String, Value>,
    nodes: Vec<UpsertId>,
    is_root: bool,
}

/// Splits one model's nodes into levels when the model references itself:
/// every node lands one level below the deepest ancestor it points at, so
/// referenced rows always flush first.
///
/// The recursion assumes same-model reference chains are acyclic; the tree
/// builder cannot produce a cycle from nested records.
pub fn to_levels(
    model_schema: &ModelSchema,
    model: &str,
    buffer: &UpsertBuffer,
    nodes: Vec<UpsertId>,
) -> Vec<Vec<UpsertId>> {
    let self_columns: HashSet<&str> = model_schema
        .self_reference_columns(model)
        .into_iter()
        .collect();
    if self_columns.is_empty() {
        return vec![nodes];
    }

    let mut memo: HashMap<UpsertId, usize> = HashMap::new();
    let mut levels: Vec<Vec<UpsertId>> = Vec::new();
    for id in nodes {
        let depth = node_depth(buffer, &self_columns, &mut memo, id);
        while levels.len() <= depth {
            levels.push(Vec::new());
        }
        levels[depth].push(id);
    }
    levels
}

fn node_depth(
    buffer: &UpsertBuffer,
    self_columns: &HashSet<&str>,
    memo: &mut HashMap<UpsertId, usize>,
    id: UpsertId,
) -> usize {
    if let Some(depth) = memo.get(&id) {
        return *depth;
    }
    let mut depth = 0;
    for (column, parent) in &buffer.node(id).foreign_keys {
        if self_columns.contains(column.as_str()) {
            depth = depth.max(node_depth(buffer, self_columns, memo, *parent) + 1);
        }
    }
    memo.insert(id, depth);
    depth
}

/// Compiles one level into mutations: resolves foreign keys, merges rows
/// that share a primary key, then groups by column shape so every mutation
/// inserts homogeneous objects.
pub fn compile_level(
    model_schema: &ModelSchema,
    model: &str,
    buffer: &UpsertBuffer,
    level: &[UpsertId],
) -> Result<Vec<UpsertOp>> {
    let mut merged: BTreeMap<String, MergedRow> = BTreeMap::new();
    for &id in level {
        let node = buffer.node(id);
        let mut object = node.object.clone();
        for (column, parent) in &node.foreign_keys {
            let parent_node = buffer.node(*parent);
            let parent_id = parent_node.id.clone().ok_or_else(|| {
                SinkError::Invariant(format!(
                    "model '{}': foreign key '{}' points at a '{}' row with no id yet",
                    node.model, column, parent_node.model
                ))
            })?;
            object.insert(column.clone(), parent_id);
        }
        let signature = model_schema.key_signature(&object);
        match merged.entry(signature) {
            // later writes win field by field
            Entry::Occupied(mut entry) => {
                let row = entry.get_mut();
                for (column, value) in object {
                    row.object.insert(column, value);
                }
                row.is_root = row.is_root || node.is_root;
                row.nodes.push(id);
            }
            Entry::Vacant(entry) => {
                entry.insert(MergedRow {
                    object,
                    nodes: vec![id],
                    is_root: node.is_root,
                });
            }
        }
    }

    // rows are grouped by exact column set; root and non-root groups stay
    // apart because their conflict clauses differ
    let mut groups: BTreeMap<(Vec<String>, bool), Vec<(String, MergedRow)>> = BTreeMap::new();
    for (signature, row) in merged {
        let mut shape: Vec<String> = row.object.keys().cloned().collect();
        shape.sort();
        groups
            .entry((shape, row.is_root))
            .or_default()
            .push((signature, row));
    }

    let mut ops = Vec::with_capacity(groups.len());
    for ((shape, is_root), rows) in groups {
        let mut update_columns: Vec<String> = model_schema
            .updatable_columns()
            .into_iter()
            .filter(|column| shape.contains(column))
            .collect();
        // refreshedAt rides the column default; forcing it into the update
        // set makes the backend restamp it on conflict
        if is_root && !update_columns.iter().any(|column| column == REFRESHED_AT_COLUMN) {
            update_columns.push(REFRESHED_AT_COLUMN.to_string());
        }
        // an empty update set is DO NOTHING and conflicting rows drop out of
        // returning, losing the ids this batch exists to collect
        if update_columns.is_empty() {
            update_columns = model_schema.primary_keys.clone();
        }

        let mut by_key = HashMap::with_capacity(rows.len());
        let mut objects = Vec::with_capacity(rows.len());
        for (signature, row) in rows {
            objects.push(graphql::object_literal(model_schema, &row.object));
            by_key.insert(signature, row.nodes);
        }

        let field = graphql::insert_field(
            &model_schema.table,
            objects,
            graphql::on_conflict(&model_schema.conflict_constraint(), &update_columns),
            returning_columns(model_schema),
        );
        ops.push(UpsertOp {
            model: model.to_string(),
            mutation: graphql::mutation(&[field]),
            by_key,
            is_root,
        });
    }
    Ok(ops)
}

/// Selection the scatter pass needs: the backend id, the freshness stamp,
/// and the key parts used to match rows back to nodes.
pub fn returning_columns(model_schema: &ModelSchema) -> Vec<String> {
    let mut columns = vec![ID_COLUMN.to_string(), REFRESHED_AT_COLUMN.to_string()];
    for key in &model_schema.primary_keys {
        if !columns.contains(key) {
            columns.push(key.clone());
        }
    }
    columns
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaView;
    use serde_json::json;

    fn view() -> SchemaView {
        SchemaView::from_json(
            &json!({
                "models": {
                    "organization": {
                        "table": "organization",
                        "primaryKeys": ["uid"],
                        "scalars": {
                            "uid": "text", "name": "text", "description": "text",
                            "origin": "text", "refreshedAt": "timestamptz"
                        }
                    },
                    "team": {
                        "table": "team",
                        "primaryKeys": ["uid"],
                        "scalars": {
                            "uid": "text", "name": "text", "parentTeamId": "uuid",
                            "mentorTeamId": "uuid",
                            "origin": "text", "refreshedAt": "timestamptz"
                        },
                        "references": {
                            "parentTeam": { "model": "team", "column": "parentTeamId" },
                            "mentorTeam": { "model": "team", "column": "mentorTeamId" }
                        }
                    }
                }
            })
            .to_string(),
        )
        .unwrap()
    }

    fn record(value: serde_json::Value) -> serde_json::Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn rows_sharing_a_key_merge_with_later_fields_winning() {
        let view = view();
        let mut buffer = UpsertBuffer::new();
        buffer
            .write(
                &view,
                "organization",
                &record(json!({"uid": "o-1", "name": "first", "description": "kept"})),
                None,
            )
            .unwrap();
        buffer
            .write(
                &view,
                "organization",
                &record(json!({"uid": "o-1", "name": "second"})),
                Some("gh"),
            )
            .unwrap();

        let model = view.model("organization").unwrap();
        let level = buffer.take_model("organization");
        let ops = compile_level(model, "organization", &buffer, &level).unwrap();

        assert_eq!(ops.len(), 1);
        let op = &ops[0];
        assert!(op.is_root);
        assert_eq!(op.by_key.len(), 1);
        assert_eq!(op.by_key[r#"["o-1"]"#].len(), 2);
        assert!(op.mutation.contains(r#"name: "second""#));
        assert!(op.mutation.contains(r#"description: "kept""#));
    }

    #[test]
    fn shapes_and_rootness_split_groups() {
        let view = view();
        let mut buffer = UpsertBuffer::new();
        // same shape, different rootness
        buffer
            .write(&view, "organization", &record(json!({"uid": "o-1"})), None)
            .unwrap();
        buffer
            .write(&view, "organization", &record(json!({"uid": "o-2"})), None)
            .unwrap();
        // wider shape
        buffer
            .write(
                &view,
                "organization",
                &record(json!({"uid": "o-3", "name": "acme"})),
                None,
            )
            .unwrap();
        // unmark one to model a buffered parent
        buffer.node_mut(UpsertId(0)).is_root = false;

        let model = view.model("organization").unwrap();
        let level = buffer.take_model("organization");
        let ops = compile_level(model, "organization", &buffer, &level).unwrap();
        assert_eq!(ops.len(), 3);
    }

    #[test]
    fn minimal_non_root_shapes_fall_back_to_key_columns() {
        let view = view();
        let mut buffer = UpsertBuffer::new();
        buffer
            .write(&view, "organization", &record(json!({"uid": "o-1"})), None)
            .unwrap();
        buffer.node_mut(UpsertId(0)).is_root = false;

        let model = view.model("organization").unwrap();
        let level = buffer.take_model("organization");
        let ops = compile_level(model, "organization", &buffer, &level).unwrap();

        assert_eq!(ops.len(), 1);
        assert!(ops[0].mutation.contains("update_columns: [uid]"));
    }

    #[test]
    fn root_groups_force_the_freshness_stamp() {
        let view = view();
        let mut buffer = UpsertBuffer::new();
        buffer
            .write(
                &view,
                "organization",
                &record(json!({"uid": "o-1", "name": "acme"})),
                Some("gh"),
            )
            .unwrap();

        let model = view.model("organization").unwrap();
        let level = buffer.take_model("organization");
        let ops = compile_level(model, "organization", &buffer, &level).unwrap();

        assert_eq!(ops.len(), 1);
        assert!(
            ops[0]
                .mutation
                .contains("update_columns: [name, origin, refreshedAt]"),
            "unexpected mutation: {}",
            ops[0].mutation
        );
    }

    #[test]
    fn objects_are_ordered_by_key_signature() {
        let view = view();
        let mut buffer = UpsertBuffer::new();
        buffer
            .write(&view, "organization", &record(json!({"uid": "o-b"})), None)
            .unwrap();
        buffer
            .write(&view, "organization", &record(json!({"uid": "o-a"})), None)
            .unwrap();

        let model = view.model("organization").unwrap();
        let level = buffer.take_model("organization");
        let ops = compile_level(model, "organization", &buffer, &level).unwrap();

        assert_eq!(ops.len(), 1);
        let first = ops[0].mutation.find(r#"uid: "o-a""#).unwrap();
        let second = ops[0].mutation.find(r#"uid: "o-b""#).unwrap();
        assert!(first < second);
    }

    #[test]
    fn unresolved_foreign_keys_are_an_invariant_error() {
        let view = view();
        let mut buffer = UpsertBuffer::new();
        buffer
            .write(
                &view,
                "team",
                &record(json!({"uid": "t-1", "parentTeam": {"uid": "t-0"}})),
                None,
            )
            .unwrap();

        let model = view.model("team").unwrap();
        let level = buffer.take_model("team");
        // compile the whole list in one level: the parent has no id yet
        let child: Vec<UpsertId> = level
            .iter()
            .copied()
            .filter(|id| !buffer.node(*id).foreign_keys.is_empty())
            .collect();
        let error = compile_level(model, "team", &buffer, &child).unwrap_err();
        assert!(matches!(error, SinkError::Invariant(_)));
    }

    #[test]
    fn self_reference_chains_level_bottom_up() {
        let view = view();
        let mut buffer = UpsertBuffer::new();
        // chain t2 -> t1 -> t0 plus a standalone t3
        buffer
            .write(
                &view,
                "team",
                &record(json!({
                    "uid": "t-2",
                    "parentTeam": {"uid": "t-1", "parentTeam": {"uid": "t-0"}}
                })),
                None,
            )
            .unwrap();
        buffer
            .write(&view, "team", &record(json!({"uid": "t-3"})), None)
            .unwrap();

        let model = view.model("team").unwrap();
        let level = buffer.take_model("team");
        let levels = to_levels(model, "team", &buffer, level);

        let names: Vec<Vec<&str>> = levels
            .iter()
            .map(|level| {
                level
                    .iter()
                    .map(|id| buffer.node(*id).object["uid"].as_str().unwrap())
                    .collect()
            })
            .collect();
        assert_eq!(names, vec![vec!["t-0", "t-3"], vec!["t-1"], vec!["t-2"]]);
    }

    #[test]
    fn nodes_with_two_parents_level_below_the_deeper_one() {
        let view = view();
        let mut buffer = UpsertBuffer::new();
        // t2 points at t0 and t1 through different columns; t1 -> t3
        buffer
            .write(
                &view,
                "team",
                &record(json!({
                    "uid": "t-2",
                    "parentTeam": {"uid": "t-0"},
                    "mentorTeam": {"uid": "t-1", "parentTeam": {"uid": "t-3"}}
                })),
                None,
            )
            .unwrap();

        let model = view.model("team").unwrap();
        let level = buffer.take_model("team");
        let levels = to_levels(model, "team", &buffer, level);

        let names: Vec<Vec<&str>> = levels
            .iter()
            .map(|level| {
                level
                    .iter()
                    .map(|id| buffer.node(*id).object["uid"].as_str().unwrap())
                    .collect()
            })
            .collect();
        assert_eq!(names, vec![vec!["t-3", "t-0"], vec!["t-1"], vec!["t-2"]]);
    }

    #[test]
    fn models_without_self_references_stay_in_one_level() {
        let view = view();
        let mut buffer = UpsertBuffer::new();
        buffer
            .write(&view, "organization", &record(json!({"uid": "o-1"})), None)
            .unwrap();
        buffer
            .write(&view, "organization", &record(json!({"uid": "o-2"})), None)
            .unwrap();

        let model = view.model("organization").unwrap();
        let level = buffer.take_model("organization");
        let levels = to_levels(model, "organization", &buffer, level);
        assert_eq!(levels.len(), 1);
        assert_eq!(levels[0].len(), 2);
    }

    #[test]
    fn returning_includes_id_stamp_and_keys_once() {
        let view = view();
        let model = view.model("organization").unwrap();
        assert_eq!(returning_columns(model), vec!["id", "refreshedAt", "uid"]);
    }
}
