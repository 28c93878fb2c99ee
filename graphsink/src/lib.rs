pub mod batch;
pub mod client;
pub mod config;
pub mod convert;
pub mod errors;
pub mod graphql;
pub mod models;
pub mod schema;
pub mod sync;
pub mod upsert;
pub mod values;
pub mod writes;

use crate::client::{GraphClient, HttpGraphClient};
use crate::config::SinkConfig;
use crate::convert::{Converter, SourceEntry};
use crate::errors::{Result, SinkError};
use crate::models::{ResetSummary, SyncSummary, TimestampedRecord};
use crate::schema::SchemaView;
use crate::sync::GraphWriter;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// The main entry point for the `graphsink` library.
///
/// `GraphSink` bundles everything needed to mirror source records into a
/// graph backend:
/// - An immutable schema view (`SchemaView`) describing models, keys, and
///   the references between them.
/// - A GraphQL transport (`GraphClient`) carrying queries and mutations.
/// - A buffered writer (`GraphWriter`) that compiles record trees into
///   bulk upserts and keeps foreign keys consistent across batches.
/// - A registry of `Converter`s that turn raw source payloads into records.
///
/// # Example
///
/// ```rust,no_run
/// use graphsink::{GraphSink, config::SinkConfig, schema::SchemaView};
///
/// #[tokio::main]
/// async fn main() {
///     let schema = SchemaView::from_path("schema/models.json").unwrap();
///     let config = SinkConfig::new("http://localhost:8080/v1/graphql")
///         .with_admin_secret("dev-secret");
///     let mut sink = GraphSink::new(config, schema).unwrap();
///
///     sink.health_check().await.unwrap();
///     // Register converters, then feed payloads through `process`.
/// }
/// ```
pub struct GraphSink {
    pub config: SinkConfig,
    pub schema: Arc<SchemaView>,
    pub client: Arc<dyn GraphClient>,
    pub writer: GraphWriter,
    converters: HashMap<&'static str, Arc<dyn Converter>>,
}

impl GraphSink {
    /// Creates a sink talking to the configured endpoint over HTTP.
    pub fn new(config: SinkConfig, schema: SchemaView) -> Result<Self> {
        let client: Arc<dyn GraphClient> = Arc::new(HttpGraphClient::new(&config)?);
        Ok(Self::with_client(config, schema, client))
    }

    /// Creates a sink over an existing client, mainly for tests and
    /// alternative transports.
    pub fn with_client(
        config: SinkConfig,
        schema: SchemaView,
        client: Arc<dyn GraphClient>,
    ) -> Self {
        let schema = Arc::new(schema);
        let writer = GraphWriter::new(Arc::clone(&schema), Arc::clone(&client), config.clone());
        Self {
            config,
            schema,
            client,
            writer,
            converters: HashMap::new(),
        }
    }

    pub fn register_converter(&mut self, converter: Arc<dyn Converter>) {
        self.converters.insert(converter.name(), converter);
    }

    pub async fn health_check(&self) -> Result<()> {
        self.client.health_check().await
    }

    /// Converts raw payloads with the named converter and buffers the
    /// results: plain records go to the upsert buffer, timestamped changes
    /// replay in `at` order.
    pub async fn process(
        &mut self,
        converter: &str,
        raw: &[Value],
        origin: Option<&str>,
    ) -> Result<SyncSummary> {
        let converter = self
            .converters
            .get(converter)
            .cloned()
            .ok_or_else(|| SinkError::Config(format!("converter '{}' not registered", converter)))?;

        let mut records = Vec::new();
        let mut timestamped = Vec::new();
        for payload in raw {
            for entry in converter.convert(payload)? {
                match entry {
                    SourceEntry::Record { model, record } => records.push((model, record)),
                    SourceEntry::Timestamped(record) => timestamped.push(record),
                }
            }
        }
        timestamped.sort_by_key(TimestampedRecord::at);

        let mut summary = SyncSummary::default();
        for (model, record) in &records {
            self.writer.write_record(model, record, origin).await?;
            summary.records_buffered += 1;
        }
        for record in &timestamped {
            self.writer.write_timestamped_record(record).await?;
            summary.writes_queued += 1;
        }
        Ok(summary)
    }

    /// Drains every buffer to the backend.
    pub async fn flush(&mut self) -> Result<()> {
        self.writer.flush().await
    }

    /// Deletes rows of `origin` that predate the current watermark.
    pub async fn reset(
        &mut self,
        origin: &str,
        models: &[String],
        preserve_referenced: bool,
    ) -> Result<ResetSummary> {
        self.writer.reset(origin, models, preserve_referenced).await
    }
}
