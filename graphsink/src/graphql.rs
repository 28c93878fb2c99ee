//! Structured construction of GraphQL documents.
//!
//! Documents are assembled as small value trees and serialized once, so
//! quoting and escaping live in exactly one place.

use crate::schema::ModelSchema;
use crate::values;
use serde_json::{Map, Value};
use std::fmt::Write as _;

/// An argument value inside a GraphQL document.
#[derive(Debug, Clone, PartialEq)]
pub enum Gql {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    /// Bare identifier rendered without quotes: column lists, `asc`,
    /// constraint names.
    Enum(String),
    List(Vec<Gql>),
    Object(Vec<(String, Gql)>),
}

impl Gql {
    /// Wraps a JSON value; strings stay quoted, numbers and bools pass
    /// through.
    pub fn from_json(value: &Value) -> Gql {
        match value {
            Value::Null => Gql::Null,
            Value::Bool(flag) => Gql::Bool(*flag),
            Value::Number(number) => Gql::Number(number.clone()),
            Value::String(text) => Gql::String(text.clone()),
            Value::Array(items) => Gql::List(items.iter().map(Gql::from_json).collect()),
            Value::Object(map) => Gql::Object(
                map.iter()
                    .map(|(key, nested)| (key.clone(), Gql::from_json(nested)))
                    .collect(),
            ),
        }
    }

    fn render(&self, out: &mut String) {
        match self {
            Gql::Null => out.push_str("null"),
            Gql::Bool(flag) => {
                let _ = write!(out, "{}", flag);
            }
            Gql::Number(number) => {
                let _ = write!(out, "{}", number);
            }
            Gql::String(text) => {
                let _ = write!(out, "{}", Value::String(text.clone()));
            }
            Gql::Enum(name) => out.push_str(name),
            Gql::List(items) => {
                out.push('[');
                for (index, item) in items.iter().enumerate() {
                    if index > 0 {
                        out.push_str(", ");
                    }
                    item.render(out);
                }
                out.push(']');
            }
            Gql::Object(entries) => {
                out.push('{');
                for (index, (key, value)) in entries.iter().enumerate() {
                    if index > 0 {
                        out.push_str(", ");
                    }
                    out.push_str(key);
                    out.push_str(": ");
                    value.render(out);
                }
                out.push('}');
            }
        }
    }
}

/// One field inside a selection set, with optional alias and arguments.
#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    pub alias: Option<String>,
    pub args: Vec<(String, Gql)>,
    pub selection: Vec<Field>,
}

impl Field {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alias: None,
            args: Vec::new(),
            selection: Vec::new(),
        }
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn arg(mut self, name: impl Into<String>, value: Gql) -> Self {
        self.args.push((name.into(), value));
        self
    }

    pub fn select(mut self, field: Field) -> Self {
        self.selection.push(field);
        self
    }

    pub fn select_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for name in names {
            self.selection.push(Field::new(name));
        }
        self
    }

    fn render(&self, out: &mut String) {
        if let Some(alias) = &self.alias {
            out.push_str(alias);
            out.push_str(": ");
        }
        out.push_str(&self.name);
        if !self.args.is_empty() {
            out.push('(');
            for (index, (name, value)) in self.args.iter().enumerate() {
                if index > 0 {
                    out.push_str(", ");
                }
                out.push_str(name);
                out.push_str(": ");
                value.render(out);
            }
            out.push(')');
        }
        if !self.selection.is_empty() {
            out.push_str(" { ");
            for (index, field) in self.selection.iter().enumerate() {
                if index > 0 {
                    out.push(' ');
                }
                field.render(out);
            }
            out.push_str(" }");
        }
    }
}

pub fn mutation(fields: &[Field]) -> String {
    document("mutation", fields)
}

pub fn query(fields: &[Field]) -> String {
    document("query", fields)
}

fn document(kind: &str, fields: &[Field]) -> String {
    let mut out = String::from(kind);
    out.push_str(" { ");
    for (index, field) in fields.iter().enumerate() {
        if index > 0 {
            out.push(' ');
        }
        field.render(&mut out);
    }
    out.push_str(" }");
    out
}

/// Aliases each field `m0`, `m1`, ... so a combined mutation has
/// addressable results.
pub fn combined_mutation(fields: Vec<Field>) -> String {
    let aliased: Vec<Field> = fields
        .into_iter()
        .enumerate()
        .map(|(index, field)| field.alias(format!("m{}", index)))
        .collect();
    mutation(&aliased)
}

/// Renders a row as an argument object, applying the per-column formatting
/// rules of the model.
pub fn object_literal(schema: &ModelSchema, object: &Map<String, Value>) -> Gql {
    Gql::Object(
        object
            .iter()
            .map(|(column, value)| {
                let field_type = schema.scalar_type(column).unwrap_or("");
                (
                    column.clone(),
                    Gql::from_json(&values::format_column_value(field_type, value)),
                )
            })
            .collect(),
    )
}

/// Boolean expression matching rows where every pair is equal, with column
/// formatting applied to the compared values.
pub fn where_eq(schema: &ModelSchema, pairs: &Map<String, Value>) -> Gql {
    Gql::Object(
        pairs
            .iter()
            .map(|(column, value)| {
                let field_type = schema.scalar_type(column).unwrap_or("");
                (
                    column.clone(),
                    Gql::Object(vec![(
                        "_eq".to_string(),
                        Gql::from_json(&values::format_column_value(field_type, value)),
                    )]),
                )
            })
            .collect(),
    )
}

/// `on_conflict` clause naming the constraint and the update column set.
pub fn on_conflict(constraint: &str, update_columns: &[String]) -> Gql {
    Gql::Object(vec![
        ("constraint".to_string(), Gql::Enum(constraint.to_string())),
        (
            "update_columns".to_string(),
            Gql::List(
                update_columns
                    .iter()
                    .map(|column| Gql::Enum(column.clone()))
                    .collect(),
            ),
        ),
    ])
}

pub fn insert_field(
    table: &str,
    objects: Vec<Gql>,
    conflict: Gql,
    returning: Vec<String>,
) -> Field {
    Field::new(format!("insert_{}", table))
        .arg("objects", Gql::List(objects))
        .arg("on_conflict", conflict)
        .select(Field::new("returning").select_names(returning))
}

pub fn insert_one_field(table: &str, object: Gql, returning: Vec<String>) -> Field {
    Field::new(format!("insert_{}_one", table))
        .arg("object", object)
        .select_names(returning)
}

pub fn update_field(table: &str, filter: Gql, set: Gql, returning: Vec<String>) -> Field {
    Field::new(format!("update_{}", table))
        .arg("where", filter)
        .arg("_set", set)
        .select(Field::new("returning").select_names(returning))
}

pub fn delete_field(table: &str, filter: Gql) -> Field {
    Field::new(format!("delete_{}", table))
        .arg("where", filter)
        .select(Field::new("affected_rows"))
}

/// Cursor page over a table, ascending by id.
pub fn page_query_field(table: &str, filter: Gql, limit: usize) -> Field {
    Field::new(table)
        .arg("where", filter)
        .arg(
            "order_by",
            Gql::Object(vec![("id".to_string(), Gql::Enum("asc".to_string()))]),
        )
        .arg("limit", Gql::Number(limit.into()))
        .select(Field::new("id"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fields_render_with_args_and_selection() {
        let field = Field::new("insert_branch")
            .arg(
                "objects",
                Gql::List(vec![Gql::Object(vec![(
                    "uid".to_string(),
                    Gql::String("b-1".to_string()),
                )])]),
            )
            .select(Field::new("returning").select_names(["id", "uid"]));
        assert_eq!(
            mutation(&[field]),
            r#"mutation { insert_branch(objects: [{uid: "b-1"}]) { returning { id uid } } }"#
        );
    }

    #[test]
    fn enums_render_without_quotes() {
        let clause = on_conflict("branch_pkey", &["name".to_string(), "refreshedAt".to_string()]);
        let field = Field::new("insert_branch").arg("on_conflict", clause);
        assert_eq!(
            mutation(&[field]),
            "mutation { insert_branch(on_conflict: {constraint: branch_pkey, update_columns: [name, refreshedAt]}) }"
        );
    }

    #[test]
    fn strings_are_json_escaped() {
        let field = Field::new("insert_note").arg(
            "object",
            Gql::Object(vec![(
                "body".to_string(),
                Gql::String("line\nwith \"quotes\"".to_string()),
            )]),
        );
        assert_eq!(
            mutation(&[field]),
            r#"mutation { insert_note(object: {body: "line\nwith \"quotes\""}) }"#
        );
    }

    #[test]
    fn combined_mutations_alias_each_entry() {
        let document = combined_mutation(vec![
            Field::new("delete_branch").select(Field::new("affected_rows")),
            Field::new("delete_commit").select(Field::new("affected_rows")),
        ]);
        assert_eq!(
            document,
            "mutation { m0: delete_branch { affected_rows } m1: delete_commit { affected_rows } }"
        );
    }

    #[test]
    fn page_queries_carry_order_and_limit() {
        let filter = Gql::Object(vec![(
            "origin".to_string(),
            Gql::Object(vec![("_eq".to_string(), Gql::String("gh".to_string()))]),
        )]);
        assert_eq!(
            query(&[page_query_field("branch", filter, 3)]),
            r#"query { branch(where: {origin: {_eq: "gh"}}, order_by: {id: asc}, limit: 3) { id } }"#
        );
    }

    #[test]
    fn from_json_keeps_numbers_and_nulls() {
        let value = Gql::from_json(&json!({"stars": 42, "language": null}));
        let field = Field::new("insert_repository").arg("object", value);
        assert_eq!(
            mutation(&[field]),
            "mutation { insert_repository(object: {language: null, stars: 42}) }"
        );
    }
}
