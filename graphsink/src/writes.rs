//! Ordered buffer for point writes: single-row inserts, filtered updates,
//! and deletions that ride alongside the upsert path.

use crate::client::{GraphClient, GraphResponse};
use crate::errors::{Result, SinkError};
use crate::graphql::{self, Field};
use crate::schema::{ID_COLUMN, ModelSchema, REFRESHED_AT_COLUMN};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

struct WriteOp {
    field: Field,
    label: String,
}

/// Queued point writes, flushed as one combined mutation with an in-order
/// replay fallback when the backend rejects the combination.
#[derive(Default)]
pub struct WriteBuffer {
    queue: Vec<WriteOp>,
}

impl WriteBuffer {
    pub fn new() -> Self {
        Self { queue: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn push_insert_one(&mut self, schema: &ModelSchema, object: &Map<String, Value>) {
        let field = graphql::insert_one_field(
            &schema.table,
            graphql::object_literal(schema, object),
            returning_columns(),
        );
        self.queue.push(WriteOp {
            field,
            label: format!("insert_{}_one", schema.table),
        });
    }

    pub fn push_update(
        &mut self,
        schema: &ModelSchema,
        where_pairs: &Map<String, Value>,
        patch: &Map<String, Value>,
    ) {
        let field = graphql::update_field(
            &schema.table,
            graphql::where_eq(schema, where_pairs),
            graphql::object_literal(schema, patch),
            returning_columns(),
        );
        self.queue.push(WriteOp {
            field,
            label: format!("update_{}", schema.table),
        });
    }

    pub fn push_delete(&mut self, schema: &ModelSchema, where_pairs: &Map<String, Value>) {
        let field = graphql::delete_field(&schema.table, graphql::where_eq(schema, where_pairs));
        self.queue.push(WriteOp {
            field,
            label: format!("delete_{}", schema.table),
        });
    }

    /// Sends every queued op and returns the oldest `refreshedAt` the
    /// backend reported for touched rows.
    ///
    /// The queue is taken up front: after the first failed replay the
    /// remaining ops are abandoned rather than retried out of order.
    pub async fn flush(&mut self, client: &dyn GraphClient) -> Result<Option<DateTime<Utc>>> {
        if self.queue.is_empty() {
            return Ok(None);
        }
        let ops = std::mem::take(&mut self.queue);
        let combined =
            graphql::combined_mutation(ops.iter().map(|op| op.field.clone()).collect());
        let response = client.post_query(&combined).await?;
        let Some(message) = response.error_message() else {
            return Ok(min_refreshed_at(&response));
        };
        log::warn!(
            "combined write of {} op(s) rejected, replaying individually: {}",
            ops.len(),
            message
        );
        let mut oldest = None;
        for op in &ops {
            let query = graphql::mutation(std::slice::from_ref(&op.field));
            let response = client.post_query(&query).await?;
            if let Some(detail) = response.error_message() {
                return Err(SinkError::WriteFailed {
                    label: op.label.clone(),
                    query,
                    detail,
                });
            }
            oldest = min_option(oldest, min_refreshed_at(&response));
        }
        Ok(oldest)
    }
}

fn returning_columns() -> Vec<String> {
    vec![ID_COLUMN.to_string(), REFRESHED_AT_COLUMN.to_string()]
}

/// Oldest `refreshedAt` anywhere in the response data.
fn min_refreshed_at(response: &GraphResponse) -> Option<DateTime<Utc>> {
    response
        .data
        .as_ref()
        .and_then(|data| scan_refreshed_at(data))
}

fn scan_refreshed_at(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Object(map) => {
            let mut oldest = None;
            for (key, nested) in map {
                if key == REFRESHED_AT_COLUMN {
                    if let Some(text) = nested.as_str() {
                        if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
                            oldest = min_option(oldest, Some(parsed.with_timezone(&Utc)));
                        }
                    }
                } else {
                    oldest = min_option(oldest, scan_refreshed_at(nested));
                }
            }
            oldest
        }
        Value::Array(items) => items
            .iter()
            .filter_map(scan_refreshed_at)
            .min(),
        _ => None,
    }
}

fn min_option(
    left: Option<DateTime<Utc>>,
    right: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    match (left, right) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, b) => b,
    }
}
