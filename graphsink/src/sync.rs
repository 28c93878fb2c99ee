//! The writer that drives buffering, flushing, and stale-row sweeps
//! against one backend.

use crate::batch::{self, UpsertOp};
use crate::client::GraphClient;
use crate::config::SinkConfig;
use crate::errors::{Result, SinkError};
use crate::graphql::{self, Gql};
use crate::models::{ResetSummary, TimestampedRecord};
use crate::schema::{ID_COLUMN, ModelSchema, ORIGIN_COLUMN, REFRESHED_AT_COLUMN, SchemaView};
use crate::upsert::{UpsertBuffer, UpsertId};
use crate::writes::WriteBuffer;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use std::sync::Arc;
use uuid::Uuid;

/// Buffered graph writer.
///
/// Records accumulate in an upsert buffer and a point-write queue until a
/// batch threshold trips, then everything drains in dependency order:
/// upserted parents land before the rows that hold foreign keys to them,
/// and point writes land after the upserts they may target. The writer
/// tracks the oldest `refreshedAt` the backend has confirmed, which bounds
/// how far back [`GraphWriter::reset`] may delete.
///
/// One writer assumes one driving task; callers that share it across tasks
/// must serialize access themselves.
pub struct GraphWriter {
    schema: Arc<SchemaView>,
    client: Arc<dyn GraphClient>,
    config: SinkConfig,
    upserts: UpsertBuffer,
    writes: WriteBuffer,
    watermark: Option<DateTime<Utc>>,
}

impl GraphWriter {
    pub fn new(schema: Arc<SchemaView>, client: Arc<dyn GraphClient>, config: SinkConfig) -> Self {
        Self {
            schema,
            client,
            config,
            upserts: UpsertBuffer::new(),
            writes: WriteBuffer::new(),
            watermark: None,
        }
    }

    /// Oldest confirmed `refreshedAt` across everything flushed so far.
    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        self.watermark
    }

    fn observe_watermark(&mut self, stamp: DateTime<Utc>) {
        self.watermark = Some(match self.watermark {
            Some(current) => current.min(stamp),
            None => stamp,
        });
    }

    /// Buffers one record tree for upsert, flushing when the buffer is full.
    pub async fn write_record(
        &mut self,
        model: &str,
        record: &Map<String, Value>,
        origin: Option<&str>,
    ) -> Result<()> {
        self.upserts.write(&self.schema, model, record, origin)?;
        if self.upserts.pressure() >= self.config.upsert_batch_size {
            self.flush().await?;
        }
        Ok(())
    }

    /// Applies one timestamp-ordered change.
    pub async fn write_timestamped_record(&mut self, record: &TimestampedRecord) -> Result<()> {
        match record {
            TimestampedRecord::Upsert {
                model,
                record,
                origin,
                ..
            } => self.write_record(model, record, origin.as_deref()).await,
            TimestampedRecord::Update {
                model,
                where_clause,
                patch,
                ..
            } => self.update_where(model, where_clause, patch).await,
            TimestampedRecord::Deletion {
                model,
                where_clause,
                ..
            } => self.delete_where(model, where_clause).await,
        }
    }

    pub async fn insert_one(&mut self, model: &str, object: &Map<String, Value>) -> Result<()> {
        let model_schema = self.schema.model(model)?;
        self.writes.push_insert_one(model_schema, object);
        self.flush_writes_if_full().await
    }

    pub async fn update_where(
        &mut self,
        model: &str,
        where_pairs: &Map<String, Value>,
        patch: &Map<String, Value>,
    ) -> Result<()> {
        let model_schema = self.schema.model(model)?;
        self.writes.push_update(model_schema, where_pairs, patch);
        self.flush_writes_if_full().await
    }

    pub async fn delete_where(
        &mut self,
        model: &str,
        where_pairs: &Map<String, Value>,
    ) -> Result<()> {
        let model_schema = self.schema.model(model)?;
        self.writes.push_delete(model_schema, where_pairs);
        self.flush_writes_if_full().await
    }

    async fn flush_writes_if_full(&mut self) -> Result<()> {
        if self.writes.len() >= self.config.write_batch_size {
            // upserts the queued ops may depend on must land first
            self.flush().await?;
        }
        Ok(())
    }

    /// Drains both buffers: upserts in dependency order, then point writes.
    pub async fn flush(&mut self) -> Result<()> {
        self.flush_upserts().await?;
        let client = Arc::clone(&self.client);
        if let Some(stamp) = self.writes.flush(client.as_ref()).await? {
            self.observe_watermark(stamp);
        }
        Ok(())
    }

    async fn flush_upserts(&mut self) -> Result<()> {
        if self.upserts.is_empty() {
            return Ok(());
        }
        let schema = Arc::clone(&self.schema);
        for model in schema.dependency_order() {
            let nodes = self.upserts.take_model(model);
            if nodes.is_empty() {
                continue;
            }
            let model_schema = schema.model(model)?;
            let levels = batch::to_levels(model_schema, model, &self.upserts, nodes);
            log::debug!(
                "flushing {} node(s) for model '{}' across {} level(s)",
                levels.iter().map(Vec::len).sum::<usize>(),
                model,
                levels.len()
            );
            for level in &levels {
                if let Err(error) = self.execute_level(model_schema, model, level).await {
                    let discarded = levels
                        .iter()
                        .flatten()
                        .filter(|&&id| self.upserts.node(id).id.is_none())
                        .count()
                        + self.upserts.queued();
                    self.upserts.clear();
                    return Err(SinkError::FlushFailed {
                        discarded,
                        source: Box::new(error),
                    });
                }
            }
        }
        self.upserts.clear();
        Ok(())
    }

    /// Compiles one level and runs its ops sequentially, scattering ids as
    /// each response lands so the next level can compile against them.
    async fn execute_level(
        &mut self,
        model_schema: &ModelSchema,
        model: &str,
        level: &[UpsertId],
    ) -> Result<()> {
        let ops = batch::compile_level(model_schema, model, &self.upserts, level)?;
        for op in ops {
            let response = self.client.post_query(&op.mutation).await?;
            if let Some(message) = response.error_message() {
                return Err(SinkError::Backend {
                    message,
                    query: op.mutation,
                });
            }
            self.scatter_returning(model_schema, &op, response.data.as_ref())?;
        }
        Ok(())
    }

    /// Matches returned rows back to buffered nodes by key signature and
    /// stamps their ids. Every row must resolve; a silent mismatch would
    /// corrupt every foreign key built on top of it.
    fn scatter_returning(
        &mut self,
        model_schema: &ModelSchema,
        op: &UpsertOp,
        data: Option<&Value>,
    ) -> Result<()> {
        let fields = data.and_then(Value::as_object).ok_or_else(|| {
            SinkError::Invariant(format!("upsert into '{}' returned no data", op.model))
        })?;
        if fields.len() != 1 {
            return Err(SinkError::Invariant(format!(
                "upsert into '{}' returned {} result fields, expected exactly one",
                op.model,
                fields.len()
            )));
        }
        let rows = fields
            .values()
            .next()
            .and_then(|payload| payload.get("returning"))
            .and_then(Value::as_array)
            .ok_or_else(|| {
                SinkError::Invariant(format!(
                    "upsert into '{}' returned no returning array",
                    op.model
                ))
            })?;
        if rows.len() != op.by_key.len() {
            return Err(SinkError::Invariant(format!(
                "upsert into '{}' returned {} row(s) for {} object(s)",
                op.model,
                rows.len(),
                op.by_key.len()
            )));
        }

        let mut oldest: Option<DateTime<Utc>> = None;
        for row in rows {
            let row = row.as_object().ok_or_else(|| {
                SinkError::Invariant(format!("upsert into '{}' returned a non-object row", op.model))
            })?;
            let signature = model_schema.key_signature(row);
            let nodes = op.by_key.get(&signature).ok_or_else(|| {
                SinkError::Invariant(format!(
                    "upsert into '{}' returned a row matching no buffered node (key {})",
                    op.model, signature
                ))
            })?;
            let id = row
                .get(ID_COLUMN)
                .filter(|value| !value.is_null())
                .cloned()
                .ok_or_else(|| {
                    SinkError::Invariant(format!(
                        "upsert into '{}' returned a row without an id (key {})",
                        op.model, signature
                    ))
                })?;
            for &node in nodes {
                self.upserts.node_mut(node).id = Some(id.clone());
            }
            if let Some(stamp) = row
                .get(REFRESHED_AT_COLUMN)
                .and_then(Value::as_str)
                .and_then(|text| DateTime::parse_from_rfc3339(text).ok())
            {
                let stamp = stamp.with_timezone(&Utc);
                oldest = Some(match oldest {
                    Some(current) => current.min(stamp),
                    None => stamp,
                });
            }
        }
        // only root rows vouch for source freshness
        if op.is_root {
            if let Some(stamp) = oldest {
                self.observe_watermark(stamp);
            }
        }
        Ok(())
    }

    /// Deletes rows of `origin` older than the watermark, model by model in
    /// dependency order, with cursor-paginated fetches and batched deletes.
    ///
    /// Both buffers flush first so the sweep never races a pending create
    /// for the same origin.
    pub async fn reset(
        &mut self,
        origin: &str,
        models: &[String],
        preserve_referenced: bool,
    ) -> Result<ResetSummary> {
        self.flush().await?;
        let Some(watermark) = self.watermark else {
            log::warn!(
                "reset for origin '{}' skipped, no watermark recorded yet",
                origin
            );
            return Ok(ResetSummary::default());
        };
        let session = self
            .client
            .supports_write_sessions()
            .then(|| Uuid::new_v4().to_string());
        let schema = Arc::clone(&self.schema);
        let mut summary = ResetSummary::default();
        for model in schema.dependency_order() {
            if !models.iter().any(|name| name == model) {
                continue;
            }
            let model_schema = schema.model(model)?;
            let deleted = self
                .sweep_model(
                    model_schema,
                    origin,
                    watermark,
                    preserve_referenced,
                    session.as_deref(),
                )
                .await?;
            summary.deleted.insert(model.clone(), deleted);
        }
        log::info!(
            "reset for origin '{}' deleted {} row(s) across {} model(s)",
            origin,
            summary.total(),
            summary.deleted.len()
        );
        Ok(summary)
    }

    async fn sweep_model(
        &mut self,
        model_schema: &ModelSchema,
        origin: &str,
        watermark: DateTime<Utc>,
        preserve_referenced: bool,
        session: Option<&str>,
    ) -> Result<usize> {
        let page_size = self.config.reset_page_size;
        let mut cursor: Option<Value> = None;
        let mut pending: Vec<Value> = Vec::new();
        let mut deleted = 0;
        loop {
            let filter = stale_filter(
                model_schema,
                origin,
                watermark,
                cursor.as_ref(),
                preserve_referenced,
            );
            let query = graphql::query(&[graphql::page_query_field(
                &model_schema.table,
                filter,
                page_size,
            )]);
            let response = self.client.post_query(&query).await?;
            if let Some(message) = response.error_message() {
                return Err(SinkError::Backend { message, query });
            }
            let rows = page_rows(&model_schema.table, response.data.as_ref())?;
            let page_len = rows.len();
            for row in rows {
                let id = row.get(ID_COLUMN).filter(|value| !value.is_null()).cloned();
                let Some(id) = id else {
                    return Err(SinkError::Invariant(format!(
                        "sweep of '{}' fetched a row without an id",
                        model_schema.table
                    )));
                };
                cursor = Some(id.clone());
                pending.push(id);
                if pending.len() >= page_size {
                    deleted += self.delete_ids(model_schema, &pending, session).await?;
                    pending.clear();
                }
            }
            if page_len < page_size {
                break;
            }
        }
        if !pending.is_empty() {
            deleted += self.delete_ids(model_schema, &pending, session).await?;
        }
        log::debug!(
            "sweep of '{}' deleted {} stale row(s)",
            model_schema.table,
            deleted
        );
        Ok(deleted)
    }

    async fn delete_ids(
        &mut self,
        model_schema: &ModelSchema,
        ids: &[Value],
        session: Option<&str>,
    ) -> Result<usize> {
        let filter = Gql::Object(vec![(
            ID_COLUMN.to_string(),
            Gql::Object(vec![(
                "_in".to_string(),
                Gql::List(ids.iter().map(Gql::from_json).collect()),
            )]),
        )]);
        let query = graphql::mutation(&[graphql::delete_field(&model_schema.table, filter)]);
        let response = self.client.post_mutation(&query, session).await?;
        if let Some(message) = response.error_message() {
            return Err(SinkError::Backend { message, query });
        }
        let field = format!("delete_{}", model_schema.table);
        let affected = response
            .data
            .as_ref()
            .and_then(|data| data.get(field.as_str()))
            .and_then(|payload| payload.get("affected_rows"))
            .and_then(Value::as_u64)
            .map(|count| count as usize)
            .unwrap_or(ids.len());
        Ok(affected)
    }
}

/// Boolean expression selecting the next page of stale rows.
fn stale_filter(
    model_schema: &ModelSchema,
    origin: &str,
    watermark: DateTime<Utc>,
    cursor: Option<&Value>,
    preserve_referenced: bool,
) -> Gql {
    let mut clauses = vec![
        Gql::Object(vec![(
            ORIGIN_COLUMN.to_string(),
            Gql::Object(vec![("_eq".to_string(), Gql::String(origin.to_string()))]),
        )]),
        Gql::Object(vec![(
            REFRESHED_AT_COLUMN.to_string(),
            Gql::Object(vec![(
                "_lt".to_string(),
                Gql::String(watermark.to_rfc3339_opts(SecondsFormat::Millis, true)),
            )]),
        )]),
    ];
    if let Some(cursor) = cursor {
        clauses.push(Gql::Object(vec![(
            ID_COLUMN.to_string(),
            Gql::Object(vec![("_gt".to_string(), Gql::from_json(cursor))]),
        )]));
    }
    if preserve_referenced && !model_schema.back_references.is_empty() {
        let alive: Vec<Gql> = model_schema
            .back_references
            .iter()
            .map(|relation| Gql::Object(vec![(relation.clone(), Gql::Object(Vec::new()))]))
            .collect();
        clauses.push(Gql::Object(vec![(
            "_not".to_string(),
            Gql::Object(vec![("_or".to_string(), Gql::List(alive))]),
        )]));
    }
    Gql::Object(vec![("_and".to_string(), Gql::List(clauses))])
}

fn page_rows<'a>(table: &str, data: Option<&'a Value>) -> Result<&'a [Value]> {
    data.and_then(|data| data.get(table))
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .ok_or_else(|| {
            SinkError::Invariant(format!(
                "page query for '{}' returned no rows array",
                table
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn team_schema() -> ModelSchema {
        ModelSchema {
            table: "team".to_string(),
            primary_keys: vec!["uid".to_string()],
            scalars: BTreeMap::from([
                ("uid".to_string(), "text".to_string()),
                ("origin".to_string(), "text".to_string()),
                ("refreshedAt".to_string(), "timestamptz".to_string()),
            ]),
            references: BTreeMap::new(),
            back_references: vec!["members".to_string(), "childTeams".to_string()],
            conflict_constraint: None,
        }
    }

    fn mid_march() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-03-15T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn stale_filter_is_bounded_by_origin_and_watermark() {
        let filter = stale_filter(&team_schema(), "gitlab", mid_march(), None, false);
        let mut rendered = String::new();
        let field = graphql::page_query_field("team", filter, 10);
        let query = graphql::query(std::slice::from_ref(&field));
        rendered.push_str(&query);
        assert_eq!(
            rendered,
            "query { team(where: {_and: [{origin: {_eq: \"gitlab\"}}, \
             {refreshedAt: {_lt: \"2024-03-15T00:00:00.000Z\"}}]}, \
             order_by: {id: asc}, limit: 10) { id } }"
        );
    }

    #[test]
    fn stale_filter_advances_past_the_cursor() {
        let cursor = json!("row-17");
        let filter = stale_filter(&team_schema(), "gitlab", mid_march(), Some(&cursor), false);
        let query = graphql::query(&[graphql::page_query_field("team", filter, 10)]);
        assert!(query.contains("{id: {_gt: \"row-17\"}}"), "query: {query}");
    }

    #[test]
    fn stale_filter_can_preserve_referenced_rows() {
        let filter = stale_filter(&team_schema(), "gitlab", mid_march(), None, true);
        let query = graphql::query(&[graphql::page_query_field("team", filter, 10)]);
        assert!(
            query.contains("{_not: {_or: [{members: {}}, {childTeams: {}}]}}"),
            "query: {query}"
        );
    }

    #[test]
    fn page_rows_requires_the_table_field() {
        let data = json!({ "team": [{ "id": 1 }] });
        let rows = page_rows("team", Some(&data)).unwrap();
        assert_eq!(rows.len(), 1);
        assert!(page_rows("person", Some(&data)).is_err());
    }
}
