use thiserror::Error;

/// Failures surfaced to the caller of the generation path.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GenerationError {
    #[error("no generation backend available: set OPENAI_API_KEY or start a local daemon at OLLAMA_BASE_URL")]
    NoBackendAvailable,
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),
    #[error("invalid generation request: {0}")]
    InvalidRequest(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ValidatorError(pub String);

impl ValidatorError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Failures of a remote versioned document store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("version token is stale")]
    Conflict,
    #[error("remote store rejected credentials ({0})")]
    Unauthorized(u16),
    #[error("remote store returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("remote store transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("could not decode remote document: {0}")]
    Decode(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict)
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("remote log still conflicting after {attempts} attempts")]
    ConflictRetriesExhausted { attempts: u32 },
    #[error("remote log unavailable: {0}")]
    Unavailable(#[from] StoreError),
    #[error("local log I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not serialize event: {0}")]
    Serialize(#[from] serde_json::Error),
}
