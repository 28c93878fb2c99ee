//! Converter seam: sources hand the sink raw JSON, converters turn it
//! into graph entries.

use crate::errors::Result;
use crate::models::TimestampedRecord;
use serde_json::{Map, Value};

/// One entry produced from a raw source payload.
#[derive(Debug, Clone)]
pub enum SourceEntry {
    /// A record tree to upsert under the model's schema.
    Record {
        model: String,
        record: Map<String, Value>,
    },
    /// A change that must be applied in timestamp order.
    Timestamped(TimestampedRecord),
}

/// Turns source-shaped JSON into graph entries.
pub trait Converter: Send + Sync {
    /// Registry name, used to route `process` calls.
    fn name(&self) -> &'static str;

    fn convert(&self, raw: &Value) -> Result<Vec<SourceEntry>>;
}
