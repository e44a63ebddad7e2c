//! Error types for index population and index lifecycle

use std::fmt;

use thiserror::Error;

use crate::types::{EntityId, IndexId, IndexState};

/// Indexing errors
#[derive(Error, Debug)]
pub enum IndexError {
    /// I/O error from an index engine or the store
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A lifecycle call that is not allowed in the current state
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// Population of one index failed
    #[error("Population of index [{index}] failed: {failure}")]
    PopulationFailed {
        index: String,
        failure: IndexPopulationFailure,
    },

    /// Population of one index was cancelled before it could flip
    #[error("Population of index [{0}] was cancelled")]
    PopulationCancelled(String),

    /// Two entities map to the same value in a unique index
    #[error("Both entity {existing} and entity {added} share the value {value} in unique index {index}")]
    EntryConflict {
        index: IndexId,
        existing: EntityId,
        added: EntityId,
        value: String,
    },

    /// The store scan itself failed
    #[error("Store scan failed: {0}")]
    StoreScan(String),

    /// Index not registered
    #[error("No index with id {0}")]
    IndexNotFound(IndexId),

    /// Index exists but can't serve the request in its current state
    #[error("Index {index} is not online, state is {state:?}")]
    NotOnline { index: IndexId, state: IndexState },

    /// A tentative constraint index could not be activated
    #[error("Activation of index {index} failed: {reason}")]
    ActivationFailed { index: IndexId, reason: String },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Failure reported by an index engine
    #[error("Index engine error: {0}")]
    Backend(String),
}

impl IndexError {
    pub fn illegal_state(message: impl Into<String>) -> Self {
        IndexError::IllegalState(message.into())
    }

    pub fn is_illegal_state(&self) -> bool {
        matches!(self, IndexError::IllegalState(_))
    }
}

/// Result type for indexing operations
pub type Result<T> = std::result::Result<T, IndexError>;

/// Captured description of why an index population failed.
///
/// Failures cross index boundaries as data, never as live error values:
/// the message of the top-level error plus the messages of its sources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexPopulationFailure {
    message: String,
    causes: Vec<String>,
}

impl IndexPopulationFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            causes: Vec::new(),
        }
    }

    /// Capture an error and its whole source chain.
    pub fn from_error(error: &(dyn std::error::Error + 'static)) -> Self {
        // A population failure wrapped in another population failure keeps the inner record
        if let Some(IndexError::PopulationFailed { failure, .. }) = error.downcast_ref::<IndexError>() {
            return failure.clone();
        }
        let mut causes = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            causes.push(cause.to_string());
            source = cause.source();
        }
        Self {
            message: error.to_string(),
            causes,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn causes(&self) -> &[String] {
        &self.causes
    }

    /// Full textual form, as handed to `IndexPopulator::mark_as_failed`.
    pub fn as_string(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for IndexPopulationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)?;
        for cause in &self.causes {
            write!(f, "\n  caused by: {cause}")?;
        }
        Ok(())
    }
}

impl From<&IndexError> for IndexPopulationFailure {
    fn from(error: &IndexError) -> Self {
        IndexPopulationFailure::from_error(error)
    }
}
