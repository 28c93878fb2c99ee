//! Record envelopes exchanged between converters and the writer, plus
//! the summaries reported back to callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// A time-ordered change captured from a source.
///
/// Upserts carry a full record tree; updates and deletions carry a
/// filter over already-synced rows. The writer replays these in `at`
/// order so later changes win.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TimestampedRecord {
    Upsert {
        at: DateTime<Utc>,
        model: String,
        record: Map<String, Value>,
        #[serde(default)]
        origin: Option<String>,
    },
    Update {
        at: DateTime<Utc>,
        model: String,
        #[serde(rename = "where")]
        where_clause: Map<String, Value>,
        patch: Map<String, Value>,
    },
    Deletion {
        at: DateTime<Utc>,
        model: String,
        #[serde(rename = "where")]
        where_clause: Map<String, Value>,
    },
}

impl TimestampedRecord {
    pub fn at(&self) -> DateTime<Utc> {
        match self {
            TimestampedRecord::Upsert { at, .. }
            | TimestampedRecord::Update { at, .. }
            | TimestampedRecord::Deletion { at, .. } => *at,
        }
    }

    pub fn model(&self) -> &str {
        match self {
            TimestampedRecord::Upsert { model, .. }
            | TimestampedRecord::Update { model, .. }
            | TimestampedRecord::Deletion { model, .. } => model,
        }
    }
}

/// Counts reported after a `process` call.
#[derive(Serialize, Debug, Clone, Default)]
pub struct SyncSummary {
    pub records_buffered: usize,
    pub writes_queued: usize,
}

/// Per-model deletion counts reported after a reset sweep.
#[derive(Serialize, Debug, Clone, Default)]
pub struct ResetSummary {
    pub deleted: BTreeMap<String, usize>,
}

impl ResetSummary {
    pub fn total(&self) -> usize {
        self.deleted.values().sum()
    }
}
