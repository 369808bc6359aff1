//! Engine error taxonomy (design §7), one variant per `Kind`.

use uuid::Uuid;

/// Result alias used throughout the engine-facing (not store-facing) API.
pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("bad definition: {message}")]
    BadDefinition { message: String },

    #[error("not found: {what} {id}")]
    NotFound { what: &'static str, id: String },

    #[error("precondition failed: {message}")]
    PreconditionFailed { message: String },

    #[error("dead end at node {node_id} in instance {instance_id}")]
    DeadEnd { instance_id: Uuid, node_id: String },

    #[error("handler config error for topic {topic}: {message}")]
    HandlerConfig { topic: String, message: String },

    #[error("transient handler failure for topic {topic}: {message}")]
    HandlerTransient { topic: String, message: String },

    #[error("fatal handler failure for topic {topic}: {message}")]
    HandlerFatal { topic: String, message: String },

    #[error("script error: {message}")]
    ScriptError { message: String },

    #[error("unsupported feature: {feature}")]
    Unsupported { feature: String },

    #[error("graph store error: {0}")]
    StoreError(String),
}

impl EngineError {
    pub fn store(err: impl std::fmt::Display) -> Self {
        EngineError::StoreError(err.to_string())
    }

    /// True if a caller should retry the same operation without advancing
    /// the instance (§7: `HandlerTransient` is "retried per handler policy").
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::HandlerTransient { .. })
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::StoreError(err.to_string())
    }
}
