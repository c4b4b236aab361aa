// 🚨 Errors - One enum for the whole matching engine
//
// Setup problems (missing base, table or column) are recoverable: the step is
// skipped and the job goes on. Key resolution and batch write failures abort
// the run.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReconcileError {
    /// Missing base, table or column while preparing a step
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A key or key pair could not be found, or does not fit the bases
    #[error("Key resolution error: {0}")]
    KeyResolution(String),

    /// A result batch failed and was rolled back
    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Unknown column '{column}' in table '{table}'")]
    UnknownColumn { table: String, column: String },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ReconcileError {
    /// True for errors that only skip the current step instead of failing the job
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ReconcileError::Configuration(_) | ReconcileError::UnknownColumn { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ReconcileError>;

/// Result of a matching step that may be skipped on bad setup
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome<T> {
    Completed(T),
    Skipped { reason: String },
}

impl<T> RunOutcome<T> {
    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed(_))
    }

    pub fn completed(self) -> Option<T> {
        match self {
            RunOutcome::Completed(report) => Some(report),
            RunOutcome::Skipped { .. } => None,
        }
    }
}
