//! Dead-letter records for work that exhausted its retries.

use crate::error::{Classify, ErrorKind};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Where a dead letter came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterSource {
    /// An outbox row that could not be published.
    Outbox,
    /// A saga that ended FAILED.
    Saga,
}

impl DeadLetterSource {
    /// Storage name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Outbox => "outbox",
            Self::Saga => "saga",
        }
    }

    /// Parse a storage name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "outbox" => Some(Self::Outbox),
            "saga" => Some(Self::Saga),
            _ => None,
        }
    }
}

/// A dead letter awaiting insertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewDeadLetter {
    /// Origin.
    pub source: DeadLetterSource,
    /// Outbox row id or saga id.
    pub reference_id: String,
    /// Event type (outbox) or failing step name (saga).
    pub subject: String,
    /// Original payload or saga context.
    pub payload: serde_json::Value,
    /// Last error.
    pub error: String,
    /// Attempts made.
    pub retry_count: i32,
}

/// Error recording a dead letter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Dead-letter database error: {0}")]
pub struct DeadLetterError(pub String);

impl Classify for DeadLetterError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Transient
    }
}

/// Somewhere to park dead letters for operators.
pub trait DeadLetterSink: Send + Sync {
    /// Record a dead letter. Returns its id.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError`] on storage failure.
    fn record<'a>(
        &'a self,
        letter: &'a NewDeadLetter,
    ) -> Pin<Box<dyn Future<Output = Result<i64, DeadLetterError>> + Send + 'a>>;
}
