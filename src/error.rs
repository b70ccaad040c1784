//! Typed error taxonomy at the bus/repository boundary. Internal code paths
//! mostly propagate `anyhow::Error`, matching the teacher's convention
//! (`ingestor.rs`/`pipeline.rs`); this enum exists for callers that need to
//! match on failure *kind* rather than just log a message.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("parse error on field {field}: {message}")]
    Parse { field: &'static str, message: String },

    #[error("event bus backpressure: buffer full ({queue_depth}/{capacity})")]
    Backpressure { queue_depth: usize, capacity: usize },

    #[error("repository error: {0}")]
    Repository(#[from] sqlx::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, IngestError>;
