use thiserror::Error;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization/deserialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Schema precondition failed: {0}")]
    Schema(String),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Backend rejected request: {message} (query: {query})")]
    Backend { message: String, query: String },

    #[error("Flush failed, {discarded} buffered record(s) discarded: {source}")]
    FlushFailed {
        discarded: usize,
        #[source]
        source: Box<SinkError>,
    },

    #[error("Write '{label}' failed: {detail} (query: {query})")]
    WriteFailed {
        label: String,
        query: String,
        detail: String,
    },

    #[error("Sync invariant violated: {0}")]
    Invariant(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, SinkError>;
