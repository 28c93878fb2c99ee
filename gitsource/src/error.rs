use thiserror::Error;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Sink(#[from] graphsink::errors::SinkError),
}

pub type Result<T> = std::result::Result<T, SourceError>;
