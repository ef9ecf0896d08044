//! Error types for the controller and agent runtime.

use thiserror::Error;
use uuid::Uuid;

/// Errors raised by the persistence store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite error.
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A JSON column failed to serialize or deserialize.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem error while opening the database.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A referenced row does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
}

impl StoreError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

/// Errors raised by the task scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A result was reported for a task id the store has never seen.
    #[error("unknown task: {0}")]
    UnknownTask(Uuid),
}

/// Errors raised by the experiment state machine.
#[derive(Debug, Error)]
pub enum ExperimentError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("experiment not found: {0}")]
    NotFound(Uuid),

    /// The requested operation is not valid in the experiment's phase.
    #[error("experiment {id} is {phase}; {operation} is not allowed")]
    InvalidPhase {
        id: Uuid,
        phase: &'static str,
        operation: &'static str,
    },

    /// The creation request failed validation.
    #[error("invalid experiment: {0}")]
    Invalid(String),
}

impl From<SchedulerError> for ExperimentError {
    fn from(e: SchedulerError) -> Self {
        match e {
            SchedulerError::Store(s) => Self::Store(s),
            SchedulerError::UnknownTask(id) => {
                Self::Store(StoreError::not_found("task", id))
            }
        }
    }
}

/// Errors raised by the fleet-side agent runtime.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The controller answered with a non-success status.
    #[error("controller rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("task execution failed: {0}")]
    Execution(String),
}
