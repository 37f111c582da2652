//! Controlled text generation over interchangeable backends, plus a durable
//! multi-writer event log for experiment sessions.

pub mod analytics;
pub mod dispatch;
pub mod error;
pub mod generation;
pub mod models;
pub mod session;
pub mod settings;
pub mod storage;
pub mod tracker;
pub mod validators;

pub use dispatch::{BackendKind, Dispatcher, normalize_model_id};
pub use error::{GenerationError, SinkError, StoreError, ValidatorError};
pub use generation::{GenerationMetadata, GenerationRequest, GenerationResult, Generator};
pub use session::{SessionContext, SessionEvent};
pub use settings::Settings;
pub use storage::EventLog;
pub use tracker::{SessionEndArgs, SessionStartArgs, SessionTracker};
pub use validators::{ValidationOutcome, Validator};
