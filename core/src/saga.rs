//! Persistent saga instance records.
//!
//! The orchestrator saves a [`SagaRecord`] after every status or step transition so
//! that a crashed process can resume from `current_step`.

use crate::error::{Classify, ErrorKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use uuid::Uuid;

/// Saga lifecycle: `PENDING → RUNNING → (COMPLETED | COMPENSATING → (COMPENSATED | FAILED))`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaStatus {
    /// Created, not started.
    Pending,
    /// Executing forward steps.
    Running,
    /// Every step completed.
    Completed,
    /// Rolling back completed steps.
    Compensating,
    /// Rolled back cleanly.
    Compensated,
    /// Rolled back with compensation errors, or a forward-only saga failed.
    Failed,
}

impl SagaStatus {
    /// True for `COMPLETED`, `COMPENSATED` and `FAILED`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Compensated | Self::Failed)
    }

    /// True for sagas a process crash could have interrupted.
    #[must_use]
    pub const fn is_in_flight(self) -> bool {
        matches!(self, Self::Running | Self::Compensating)
    }

    /// Storage name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Compensating => "compensating",
            Self::Compensated => "compensated",
            Self::Failed => "failed",
        }
    }

    /// Parse a storage name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "compensating" => Some(Self::Compensating),
            "compensated" => Some(Self::Compensated),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    /// Not yet run.
    Pending,
    /// Executing.
    Running,
    /// Executed successfully.
    Completed,
    /// Execution failed.
    Failed,
    /// Being rolled back.
    Compensating,
    /// Rolled back.
    Compensated,
}

/// Persistent state of one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Step name, unique within the saga.
    pub name: String,
    /// Current status.
    pub status: StepStatus,
    /// Execution error, if the step failed.
    pub error: Option<String>,
    /// True once the compensation ran successfully.
    pub compensated: bool,
    /// Compensation error, if rollback of this step failed.
    pub compensation_error: Option<String>,
    /// When execution started.
    pub started_at: Option<DateTime<Utc>>,
    /// When execution finished.
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepRecord {
    /// A pending step.
    #[must_use]
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: StepStatus::Pending,
            error: None,
            compensated: false,
            compensation_error: None,
            started_at: None,
            completed_at: None,
        }
    }
}

/// The full persisted state of a saga instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaRecord {
    /// Instance id.
    pub saga_id: Uuid,
    /// Definition name, used to re-attach step code after a restart.
    pub name: String,
    /// Lifecycle status.
    pub status: SagaStatus,
    /// Index of the step being (or last) executed.
    pub current_step: usize,
    /// Per-step state, in definition order.
    pub steps: Vec<StepRecord>,
    /// Values threaded between steps.
    pub context: serde_json::Map<String, serde_json::Value>,
    /// When execution first started.
    pub started_at: Option<DateTime<Utc>>,
    /// When a terminal status was reached.
    pub completed_at: Option<DateTime<Utc>>,
    /// Why the saga left the happy path.
    pub failure_reason: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last persisted transition.
    pub updated_at: DateTime<Utc>,
}

/// Errors from a saga store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SagaStoreError {
    /// The store failed.
    #[error("Saga store error: {0}")]
    Database(String),

    /// A persisted record could not be decoded.
    #[error("Corrupt saga record {saga_id}: {reason}")]
    Corrupt {
        /// The saga.
        saga_id: Uuid,
        /// What was wrong.
        reason: String,
    },
}

impl Classify for SagaStoreError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Database(_) => ErrorKind::Transient,
            Self::Corrupt { .. } => ErrorKind::Invariant,
        }
    }
}

/// Boxed future returned by [`SagaStore`] operations.
pub type SagaStoreFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, SagaStoreError>> + Send + 'a>>;

/// Durable home of saga records.
pub trait SagaStore: Send + Sync {
    /// Insert or overwrite a record.
    ///
    /// # Errors
    ///
    /// Returns [`SagaStoreError`] on failure.
    fn save<'a>(&'a self, record: &'a SagaRecord) -> SagaStoreFuture<'a, ()>;

    /// Load a record.
    ///
    /// # Errors
    ///
    /// Returns [`SagaStoreError`] on failure.
    fn load(&self, saga_id: Uuid) -> SagaStoreFuture<'_, Option<SagaRecord>>;

    /// Records whose status is one of `statuses`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`SagaStoreError`] on failure.
    fn list_by_status<'a>(
        &'a self,
        statuses: &'a [SagaStatus],
    ) -> SagaStoreFuture<'a, Vec<SagaRecord>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(SagaStatus::Completed.is_terminal());
        assert!(SagaStatus::Compensated.is_terminal());
        assert!(SagaStatus::Failed.is_terminal());
        assert!(!SagaStatus::Running.is_terminal());
        assert!(!SagaStatus::Compensating.is_terminal());
        assert!(!SagaStatus::Pending.is_terminal());
    }

    #[test]
    fn test_status_parse_roundtrip() {
        for status in [
            SagaStatus::Pending,
            SagaStatus::Running,
            SagaStatus::Completed,
            SagaStatus::Compensating,
            SagaStatus::Compensated,
            SagaStatus::Failed,
        ] {
            assert_eq!(SagaStatus::parse(status.as_str()), Some(status));
        }
    }
}
