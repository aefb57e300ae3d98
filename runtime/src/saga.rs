//! Saga orchestrator: ordered steps with reverse-order compensation.
//!
//! A saga is a named, ordered list of steps. Each step has an `execute` closure
//! and an optional `compensate` closure. Steps share a [`SagaContext`], a keyed
//! bag of JSON values used to pass ids (hold, payment, booking) forward and into
//! compensations.
//!
//! ```text
//! PENDING ──► RUNNING ──► COMPLETED
//!                │
//!                └─step fails──► COMPENSATING ──► COMPENSATED
//!                                      │
//!                                      └─compensation errs──► FAILED
//! ```
//!
//! # Execution rules
//!
//! - Steps run strictly in order; a step starts only after the previous completed.
//! - On failure the saga records `step '<name>' failed: <error>`, moves to
//!   COMPENSATING and runs every compensation of previously COMPLETED steps in
//!   reverse order. Steps without compensation are skipped.
//! - Compensation errors are collected and do not stop further compensations.
//!   Any error makes the final status FAILED, otherwise COMPENSATED.
//! - A forward-only saga skips compensation and ends FAILED on the first error.
//! - An expired [`Deadline`] fails the current step with a `cancelled` reason.
//!   Compensations then run on their own budget.
//!
//! # Durability
//!
//! The full [`SagaRecord`] (status, step states, context) is saved to the
//! [`SagaStore`] after every transition. Definitions are registered by name so a
//! restarted process can re-attach step code to a persisted record and resume.
//!
//! # Example
//!
//! ```rust,ignore
//! let orchestrator = SagaOrchestrator::new(store, clock, SagaOrchestratorConfig::default());
//! orchestrator.register(
//!     SagaDefinition::new("booking")
//!         .step(StepDefinition::new("hold_seats", hold).with_compensation(release))
//!         .step(StepDefinition::new("notify", notify)),
//! );
//!
//! let saga_id = orchestrator.create("booking", initial_context).await?;
//! let record = orchestrator.execute(saga_id, Deadline::after(timeout)).await?;
//! ```

use crate::metrics::SagaMetrics;
use crate::retry::{RetryPolicy, retry_transient};
use chrono::{DateTime, Utc};
use seatline_core::dead_letter::{DeadLetterSink, DeadLetterSource, NewDeadLetter};
use seatline_core::deadline::Deadline;
use seatline_core::environment::Clock;
use seatline_core::error::{Classify, ErrorKind};
use seatline_core::saga::{
    SagaRecord, SagaStatus, SagaStore, SagaStoreError, StepRecord, StepStatus,
};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, broadcast};
use uuid::Uuid;

/// Failure of a step's execute or compensate closure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct StepError {
    /// How the failure should travel.
    pub kind: ErrorKind,
    /// Human-readable detail.
    pub message: String,
}

impl StepError {
    /// A step error of the given kind.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Wraps a classified component error.
    #[must_use]
    pub fn from_err<E: Classify + fmt::Display>(err: &E) -> Self {
        Self::new(err.kind(), err.to_string())
    }

    /// The step's deadline elapsed.
    #[must_use]
    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Transient, "cancelled: deadline exceeded")
    }

    /// A value a step relies on is missing from the context.
    #[must_use]
    pub fn missing(key: &str) -> Self {
        Self::new(
            ErrorKind::Invariant,
            format!("missing context value '{key}'"),
        )
    }
}

impl Classify for StepError {
    fn kind(&self) -> ErrorKind {
        self.kind
    }
}

/// Boxed future returned by step closures.
pub type StepFuture = Pin<Box<dyn Future<Output = Result<(), StepError>> + Send>>;

/// A step closure.
pub type StepFn = Arc<dyn Fn(SagaContext) -> StepFuture + Send + Sync>;

/// Thread-safe keyed bag shared by the steps of one saga instance.
#[derive(Clone)]
pub struct SagaContext {
    saga_id: Uuid,
    values: Arc<Mutex<Map<String, Value>>>,
}

impl fmt::Debug for SagaContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SagaContext")
            .field("saga_id", &self.saga_id)
            .field("values", &self.snapshot())
            .finish()
    }
}

impl SagaContext {
    /// A context seeded with `values`.
    #[must_use]
    pub fn new(saga_id: Uuid, values: Map<String, Value>) -> Self {
        Self {
            saga_id,
            values: Arc::new(Mutex::new(values)),
        }
    }

    /// The owning saga.
    #[must_use]
    pub const fn saga_id(&self) -> Uuid {
        self.saga_id
    }

    /// Store a value under `key`, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns an invariant [`StepError`] if `value` cannot be encoded as JSON.
    pub fn insert<T: Serialize>(&self, key: &str, value: T) -> Result<(), StepError> {
        let value = serde_json::to_value(value)
            .map_err(|e| StepError::new(ErrorKind::Invariant, e.to_string()))?;
        self.lock().insert(key.to_string(), value);
        Ok(())
    }

    /// Decode the value under `key`; `None` if absent, null or mistyped.
    #[must_use]
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.lock().get(key).cloned()?;
        if value.is_null() {
            return None;
        }
        serde_json::from_value(value).ok()
    }

    /// Decode the value under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StepError::missing`] if the value is absent or mistyped.
    pub fn require<T: DeserializeOwned>(&self, key: &str) -> Result<T, StepError> {
        self.get(key).ok_or_else(|| StepError::missing(key))
    }

    /// True if `key` holds a non-null value.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.lock().get(key).is_some_and(|v| !v.is_null())
    }

    /// A copy of every value.
    #[must_use]
    pub fn snapshot(&self) -> Map<String, Value> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Map<String, Value>> {
        self.values.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One named step.
#[derive(Clone)]
pub struct StepDefinition {
    name: String,
    execute: StepFn,
    compensate: Option<StepFn>,
}

impl fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDefinition")
            .field("name", &self.name)
            .field("compensable", &self.compensate.is_some())
            .finish()
    }
}

impl StepDefinition {
    /// A step with no compensation.
    pub fn new<F, Fut>(name: impl Into<String>, execute: F) -> Self
    where
        F: Fn(SagaContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), StepError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            execute: Arc::new(move |ctx| Box::pin(execute(ctx))),
            compensate: None,
        }
    }

    /// Attach a compensation.
    #[must_use]
    pub fn with_compensation<F, Fut>(mut self, compensate: F) -> Self
    where
        F: Fn(SagaContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), StepError>> + Send + 'static,
    {
        self.compensate = Some(Arc::new(move |ctx| Box::pin(compensate(ctx))));
        self
    }

    /// Step name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True if the step has a compensation.
    #[must_use]
    pub const fn is_compensable(&self) -> bool {
        self.compensate.is_some()
    }
}

/// A named, ordered list of steps.
#[derive(Debug, Clone)]
pub struct SagaDefinition {
    name: String,
    steps: Vec<StepDefinition>,
    forward_only: bool,
}

impl SagaDefinition {
    /// An empty definition.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            forward_only: false,
        }
    }

    /// Append a step.
    #[must_use]
    pub fn step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    /// Never compensate; the first step error ends the saga FAILED.
    #[must_use]
    pub const fn forward_only(mut self) -> Self {
        self.forward_only = true;
        self
    }

    /// Definition name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Steps in execution order.
    #[must_use]
    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }
}

/// What happened, as reported to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SagaEventKind {
    /// Forward execution began.
    SagaStarted,
    /// A step began.
    StepStarted,
    /// A step completed.
    StepCompleted,
    /// A step failed.
    StepFailed,
    /// Compensation began.
    CompensationStarted,
    /// A step's compensation began.
    CompensatingStep,
    /// A step's compensation succeeded.
    StepCompensated,
    /// A step's compensation failed.
    CompensationFailed,
    /// Every step completed.
    SagaCompleted,
    /// Rolled back cleanly.
    SagaCompensated,
    /// Ended FAILED.
    SagaFailed,
}

impl SagaEventKind {
    /// Wire name, e.g. `step_started`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SagaStarted => "saga_started",
            Self::StepStarted => "step_started",
            Self::StepCompleted => "step_completed",
            Self::StepFailed => "step_failed",
            Self::CompensationStarted => "compensation_started",
            Self::CompensatingStep => "compensating_step",
            Self::StepCompensated => "step_compensated",
            Self::CompensationFailed => "compensation_failed",
            Self::SagaCompleted => "saga_completed",
            Self::SagaCompensated => "saga_compensated",
            Self::SagaFailed => "saga_failed",
        }
    }
}

/// Lifecycle notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SagaEvent {
    /// Saga instance.
    pub saga_id: Uuid,
    /// Definition name.
    pub saga_name: String,
    /// What happened.
    pub kind: SagaEventKind,
    /// Step concerned, if any.
    pub step: Option<String>,
    /// Error detail, if any.
    pub error: Option<String>,
    /// When.
    pub at: DateTime<Utc>,
}

/// Orchestration failures. Step failures are not errors here: they end in a
/// terminal record returned as `Ok`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SagaError {
    /// No such saga.
    #[error("Saga not found: {0}")]
    NotFound(Uuid),

    /// Retry requested from a status that does not allow it.
    #[error("Saga {saga_id} is not retryable from status {status}")]
    NotRetryable {
        /// The saga.
        saga_id: Uuid,
        /// Its status.
        status: SagaStatus,
    },

    /// The saga is executing in this process.
    #[error("Saga {0} is already running")]
    AlreadyRunning(Uuid),

    /// No definition registered under this name.
    #[error("Unknown saga definition: {0}")]
    UnknownDefinition(String),

    /// The saga store failed.
    #[error(transparent)]
    Store(#[from] SagaStoreError),
}

impl Classify for SagaError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::NotRetryable { .. } | Self::AlreadyRunning(_) => ErrorKind::Conflict,
            Self::UnknownDefinition(_) => ErrorKind::Invariant,
            Self::Store(e) => e.kind(),
        }
    }
}

/// Orchestrator tuning.
#[derive(Debug, Clone)]
pub struct SagaOrchestratorConfig {
    /// Hard bound on one step's execute closure.
    pub step_timeout: Duration,
    /// Hard bound on one compensation closure.
    pub compensation_timeout: Duration,
    /// Retry policy for persisting records.
    pub persist_retry: RetryPolicy,
    /// Listener channel capacity; lagging listeners lose events.
    pub event_capacity: usize,
}

impl Default for SagaOrchestratorConfig {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(30),
            compensation_timeout: Duration::from_secs(30),
            persist_retry: RetryPolicy::default(),
            event_capacity: 256,
        }
    }
}

struct SagaInstance {
    definition: Arc<SagaDefinition>,
    record: AsyncMutex<SagaRecord>,
    context: SagaContext,
    running: AtomicBool,
}

/// Releases the running flag on every exit path.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Executes, compensates, persists and recovers sagas.
pub struct SagaOrchestrator {
    store: Arc<dyn SagaStore>,
    clock: Arc<dyn Clock>,
    config: SagaOrchestratorConfig,
    definitions: RwLock<HashMap<String, Arc<SagaDefinition>>>,
    instances: RwLock<HashMap<Uuid, Arc<SagaInstance>>>,
    events: broadcast::Sender<SagaEvent>,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
}

impl SagaOrchestrator {
    /// A new orchestrator with no registered definitions.
    #[must_use]
    pub fn new(
        store: Arc<dyn SagaStore>,
        clock: Arc<dyn Clock>,
        config: SagaOrchestratorConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            store,
            clock,
            config,
            definitions: RwLock::new(HashMap::new()),
            instances: RwLock::new(HashMap::new()),
            events,
            dead_letters: None,
        }
    }

    /// Park sagas that end FAILED in `sink` for operator review.
    #[must_use]
    pub fn with_dead_letter_sink(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = Some(sink);
        self
    }

    /// Register a definition under its name, replacing any previous one.
    pub fn register(&self, definition: SagaDefinition) -> Arc<SagaDefinition> {
        let definition = Arc::new(definition);
        self.definitions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(definition.name.clone(), Arc::clone(&definition));
        definition
    }

    /// Listen to lifecycle events. Sending never blocks execution; a listener
    /// that falls behind by more than the channel capacity loses events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SagaEvent> {
        self.events.subscribe()
    }

    /// Create and persist a PENDING saga.
    ///
    /// # Errors
    ///
    /// Returns [`SagaError::UnknownDefinition`] or a store error.
    pub async fn create(&self, name: &str, context: Map<String, Value>) -> Result<Uuid, SagaError> {
        let definition = self.definition(name)?;
        let now = self.clock.now();
        let saga_id = Uuid::new_v4();

        let record = SagaRecord {
            saga_id,
            name: definition.name.clone(),
            status: SagaStatus::Pending,
            current_step: 0,
            steps: definition
                .steps
                .iter()
                .map(|s| StepRecord::pending(&s.name))
                .collect(),
            context: context.clone(),
            started_at: None,
            completed_at: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        };

        retry_transient(&self.config.persist_retry, Deadline::none(), || {
            self.store.save(&record)
        })
        .await?;

        let instance = Arc::new(SagaInstance {
            definition,
            context: SagaContext::new(saga_id, context),
            record: AsyncMutex::new(record),
            running: AtomicBool::new(false),
        });
        self.instances
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(saga_id, instance);

        tracing::debug!(saga_id = %saga_id, saga = name, "Saga created");
        Ok(saga_id)
    }

    /// Run a PENDING saga to a terminal status.
    ///
    /// Returns the terminal record; inspect `status` to tell success from
    /// compensation.
    ///
    /// # Errors
    ///
    /// Returns [`SagaError`] if the saga is unknown, not PENDING, already running,
    /// or its record cannot be loaded.
    pub async fn execute(&self, saga_id: Uuid, deadline: Deadline) -> Result<SagaRecord, SagaError> {
        let instance = self.instance(saga_id).await?;
        let _guard = Self::claim(&instance, saga_id)?;

        let status = instance.record.lock().await.status;
        if status != SagaStatus::Pending {
            return Err(SagaError::NotRetryable { saga_id, status });
        }

        self.run_forward(&instance, 0, deadline).await;
        Ok(self.finish(saga_id, &instance).await)
    }

    /// Retry a FAILED or COMPENSATED saga, or resume one interrupted by a crash.
    ///
    /// Steps from the failed step onward are reset to PENDING and re-executed.
    /// Earlier steps whose effects were compensated are re-executed as well.
    ///
    /// # Errors
    ///
    /// Returns [`SagaError::NotRetryable`] for PENDING or COMPLETED sagas,
    /// [`SagaError::AlreadyRunning`] if it is executing here, or a load error.
    pub async fn retry(&self, saga_id: Uuid, deadline: Deadline) -> Result<SagaRecord, SagaError> {
        let instance = self.instance(saga_id).await?;
        let _guard = Self::claim(&instance, saga_id)?;

        let status = instance.record.lock().await.status;
        match status {
            SagaStatus::Failed | SagaStatus::Compensated => {
                let from = self.reset_for_retry(&instance).await;
                tracing::info!(saga_id = %saga_id, from_step = from, "Retrying saga");
                self.run_forward(&instance, from, deadline).await;
            }
            SagaStatus::Running | SagaStatus::Compensating => {
                self.resume_interrupted(&instance, deadline).await;
            }
            SagaStatus::Pending | SagaStatus::Completed => {
                return Err(SagaError::NotRetryable { saga_id, status });
            }
        }

        Ok(self.finish(saga_id, &instance).await)
    }

    /// Close a saga that never started.
    ///
    /// A PENDING saga becomes COMPENSATED with `reason` recorded; there is no
    /// step to roll back. Returns false, leaving the saga untouched, for any
    /// other status.
    ///
    /// # Errors
    ///
    /// Returns [`SagaError::AlreadyRunning`] if it is executing here, or a
    /// load error.
    pub async fn abandon(&self, saga_id: Uuid, reason: &str) -> Result<bool, SagaError> {
        let instance = self.instance(saga_id).await?;
        let _guard = Self::claim(&instance, saga_id)?;

        {
            let mut record = instance.record.lock().await;
            if record.status != SagaStatus::Pending {
                return Ok(false);
            }
            record.status = SagaStatus::Compensated;
            record.failure_reason = Some(reason.to_string());
            record.completed_at = Some(self.clock.now());
            self.persist(&mut record).await;
        }
        self.emit(&instance, SagaEventKind::SagaCompensated, None, Some(reason.to_string()));
        tracing::info!(saga_id = %saga_id, reason, "Pending saga abandoned");

        self.finish(saga_id, &instance).await;
        Ok(true)
    }

    /// Find sagas a crash left RUNNING or COMPENSATING.
    ///
    /// With `auto_resume` each is resumed in turn: RUNNING sagas continue from
    /// `current_step`, COMPENSATING sagas finish their rollback. Otherwise they
    /// are logged and left for an operator to [`retry`](Self::retry).
    ///
    /// # Errors
    ///
    /// Returns a store error if the in-flight sagas cannot be listed.
    pub async fn recover(&self, auto_resume: bool, deadline: Deadline) -> Result<Vec<Uuid>, SagaError> {
        let in_flight = self
            .store
            .list_by_status(&[SagaStatus::Running, SagaStatus::Compensating])
            .await?;

        let mut ids = Vec::with_capacity(in_flight.len());
        for record in in_flight {
            let saga_id = record.saga_id;
            ids.push(saga_id);

            if !auto_resume {
                tracing::warn!(
                    saga_id = %saga_id,
                    saga = %record.name,
                    status = %record.status,
                    current_step = record.current_step,
                    "Interrupted saga awaiting operator retry"
                );
                continue;
            }

            match self.retry(saga_id, deadline).await {
                Ok(done) => tracing::info!(
                    saga_id = %saga_id,
                    status = %done.status,
                    "Interrupted saga resumed"
                ),
                Err(e) => tracing::error!(saga_id = %saga_id, error = %e, "Failed to resume saga"),
            }
        }

        Ok(ids)
    }

    /// Current record of a saga.
    ///
    /// # Errors
    ///
    /// Returns [`SagaError::NotFound`] or a store error.
    pub async fn get(&self, saga_id: Uuid) -> Result<SagaRecord, SagaError> {
        let live = self
            .instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&saga_id)
            .cloned();
        if let Some(instance) = live {
            return Ok(instance.record.lock().await.clone());
        }
        self.store
            .load(saga_id)
            .await?
            .ok_or(SagaError::NotFound(saga_id))
    }

    fn definition(&self, name: &str) -> Result<Arc<SagaDefinition>, SagaError> {
        self.definitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| SagaError::UnknownDefinition(name.to_string()))
    }

    async fn instance(&self, saga_id: Uuid) -> Result<Arc<SagaInstance>, SagaError> {
        let live = self
            .instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&saga_id)
            .cloned();
        if let Some(instance) = live {
            return Ok(instance);
        }

        let record = self
            .store
            .load(saga_id)
            .await?
            .ok_or(SagaError::NotFound(saga_id))?;
        let definition = self.definition(&record.name)?;
        if definition.steps.len() != record.steps.len() {
            return Err(SagaError::Store(SagaStoreError::Corrupt {
                saga_id,
                reason: format!(
                    "record has {} steps, definition '{}' has {}",
                    record.steps.len(),
                    definition.name,
                    definition.steps.len()
                ),
            }));
        }

        let instance = Arc::new(SagaInstance {
            definition,
            context: SagaContext::new(saga_id, record.context.clone()),
            record: AsyncMutex::new(record),
            running: AtomicBool::new(false),
        });

        let mut instances = self
            .instances
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(Arc::clone(instances.entry(saga_id).or_insert(instance)))
    }

    fn claim(instance: &SagaInstance, saga_id: Uuid) -> Result<RunGuard<'_>, SagaError> {
        instance
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| SagaError::AlreadyRunning(saga_id))?;
        Ok(RunGuard(&instance.running))
    }

    async fn finish(&self, saga_id: Uuid, instance: &SagaInstance) -> SagaRecord {
        let record = instance.record.lock().await.clone();
        if record.status.is_terminal() {
            SagaMetrics::record_terminal(&record.name, record.status.as_str());
            if record.status == SagaStatus::Failed {
                self.park(&record).await;
            }
            self.instances
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&saga_id);
        }
        record
    }

    async fn park(&self, record: &SagaRecord) {
        let Some(sink) = &self.dead_letters else {
            return;
        };
        let failed_step = record
            .steps
            .iter()
            .find(|s| s.status == StepStatus::Failed)
            .map_or_else(|| record.name.clone(), |s| s.name.clone());
        let letter = NewDeadLetter {
            source: DeadLetterSource::Saga,
            reference_id: record.saga_id.to_string(),
            subject: failed_step,
            payload: Value::Object(record.context.clone()),
            error: record.failure_reason.clone().unwrap_or_default(),
            retry_count: 0,
        };
        if let Err(e) = sink.record(&letter).await {
            tracing::error!(saga_id = %record.saga_id, error = %e, "Failed to dead-letter saga");
        }
    }

    async fn reset_for_retry(&self, instance: &SagaInstance) -> usize {
        let mut record = instance.record.lock().await;
        let first_undone = record
            .steps
            .iter()
            .position(|s| s.compensated)
            .unwrap_or(record.current_step);
        let from = first_undone.min(record.current_step);

        for step in record.steps.iter_mut().skip(from) {
            *step = StepRecord::pending(step.name.clone());
        }
        record.status = SagaStatus::Pending;
        record.current_step = from;
        record.failure_reason = None;
        record.completed_at = None;
        self.persist(&mut record).await;
        from
    }

    async fn resume_interrupted(&self, instance: &SagaInstance, deadline: Deadline) {
        let (status, current) = {
            let record = instance.record.lock().await;
            (record.status, record.current_step)
        };

        if status == SagaStatus::Compensating {
            tracing::info!(saga_id = %instance.context.saga_id(), "Resuming interrupted compensation");
            self.compensate(instance, current).await;
            return;
        }

        tracing::info!(
            saga_id = %instance.context.saga_id(),
            from_step = current,
            "Resuming interrupted saga"
        );
        self.run_forward(instance, current, deadline).await;
    }

    async fn run_forward(&self, instance: &SagaInstance, from: usize, deadline: Deadline) {
        let definition = &instance.definition;
        {
            let mut record = instance.record.lock().await;
            record.status = SagaStatus::Running;
            record.started_at.get_or_insert(self.clock.now());
            self.persist(&mut record).await;
        }
        self.emit(instance, SagaEventKind::SagaStarted, None, None);

        for (index, step) in definition.steps.iter().enumerate().skip(from) {
            {
                let mut record = instance.record.lock().await;
                record.current_step = index;
                let now = self.clock.now();
                if let Some(state) = record.steps.get_mut(index) {
                    state.status = StepStatus::Running;
                    state.error = None;
                    state.started_at = Some(now);
                }
                self.persist(&mut record).await;
            }
            self.emit(instance, SagaEventKind::StepStarted, Some(&step.name), None);

            let outcome = if deadline.is_expired() {
                Err(StepError::cancelled())
            } else {
                let bounded = deadline.tighten(self.config.step_timeout);
                bounded
                    .run((step.execute)(instance.context.clone()))
                    .await
                    .unwrap_or_else(|_| Err(StepError::cancelled()))
            };

            match outcome {
                Ok(()) => {
                    {
                        let mut record = instance.record.lock().await;
                        let now = self.clock.now();
                        if let Some(state) = record.steps.get_mut(index) {
                            state.status = StepStatus::Completed;
                            state.completed_at = Some(now);
                        }
                        record.context = instance.context.snapshot();
                        self.persist(&mut record).await;
                    }
                    self.emit(instance, SagaEventKind::StepCompleted, Some(&step.name), None);
                }
                Err(err) => {
                    let reason = format!("step '{}' failed: {err}", step.name);
                    tracing::warn!(
                        saga_id = %instance.context.saga_id(),
                        saga = %definition.name,
                        step = %step.name,
                        kind = %err.kind,
                        error = %err,
                        "Saga step failed"
                    );
                    {
                        let mut record = instance.record.lock().await;
                        let now = self.clock.now();
                        if let Some(state) = record.steps.get_mut(index) {
                            state.status = StepStatus::Failed;
                            state.error = Some(err.message.clone());
                            state.completed_at = Some(now);
                        }
                        record.failure_reason = Some(reason);
                        record.context = instance.context.snapshot();
                        if definition.forward_only {
                            record.status = SagaStatus::Failed;
                            record.completed_at = Some(now);
                        }
                        self.persist(&mut record).await;
                    }
                    self.emit(
                        instance,
                        SagaEventKind::StepFailed,
                        Some(&step.name),
                        Some(err.message),
                    );

                    if definition.forward_only {
                        self.emit(instance, SagaEventKind::SagaFailed, None, None);
                    } else {
                        self.compensate(instance, index).await;
                    }
                    return;
                }
            }
        }

        {
            let mut record = instance.record.lock().await;
            record.status = SagaStatus::Completed;
            record.completed_at = Some(self.clock.now());
            self.persist(&mut record).await;
        }
        tracing::info!(
            saga_id = %instance.context.saga_id(),
            saga = %definition.name,
            "Saga completed"
        );
        self.emit(instance, SagaEventKind::SagaCompleted, None, None);
    }

    async fn compensate(&self, instance: &SagaInstance, failed_index: usize) {
        {
            let mut record = instance.record.lock().await;
            record.status = SagaStatus::Compensating;
            self.persist(&mut record).await;
        }
        self.emit(instance, SagaEventKind::CompensationStarted, None, None);

        let mut errors = Vec::new();
        for index in (0..failed_index).rev() {
            let Some(step) = instance.definition.steps.get(index) else {
                continue;
            };
            let Some(compensate) = &step.compensate else {
                continue;
            };

            {
                let mut record = instance.record.lock().await;
                let Some(state) = record.steps.get_mut(index) else {
                    continue;
                };
                // Resumed compensations skip steps that never ran or were already undone.
                let undone = matches!(state.status, StepStatus::Completed | StepStatus::Compensating);
                if !undone || state.compensated {
                    continue;
                }
                state.status = StepStatus::Compensating;
                self.persist(&mut record).await;
            }
            self.emit(instance, SagaEventKind::CompensatingStep, Some(&step.name), None);

            let outcome = Deadline::after(self.config.compensation_timeout)
                .run(compensate(instance.context.clone()))
                .await
                .unwrap_or_else(|_| Err(StepError::cancelled()));

            let mut record = instance.record.lock().await;
            match outcome {
                Ok(()) => {
                    if let Some(state) = record.steps.get_mut(index) {
                        state.status = StepStatus::Compensated;
                        state.compensated = true;
                    }
                    record.context = instance.context.snapshot();
                    self.persist(&mut record).await;
                    drop(record);
                    self.emit(instance, SagaEventKind::StepCompensated, Some(&step.name), None);
                }
                Err(err) => {
                    tracing::error!(
                        saga_id = %instance.context.saga_id(),
                        step = %step.name,
                        error = %err,
                        "Compensation failed"
                    );
                    if let Some(state) = record.steps.get_mut(index) {
                        state.status = StepStatus::Completed;
                        state.compensation_error = Some(err.message.clone());
                    }
                    self.persist(&mut record).await;
                    drop(record);
                    errors.push(format!("compensation for '{}' failed: {err}", step.name));
                    self.emit(
                        instance,
                        SagaEventKind::CompensationFailed,
                        Some(&step.name),
                        Some(err.message),
                    );
                }
            }
        }

        let failed = !errors.is_empty();
        {
            let mut record = instance.record.lock().await;
            record.completed_at = Some(self.clock.now());
            if failed {
                record.status = SagaStatus::Failed;
                let base = record.failure_reason.take().unwrap_or_default();
                record.failure_reason = Some(format!("{base}; {}", errors.join("; ")));
            } else {
                record.status = SagaStatus::Compensated;
            }
            self.persist(&mut record).await;
        }

        if failed {
            self.emit(instance, SagaEventKind::SagaFailed, None, Some(errors.join("; ")));
        } else {
            self.emit(instance, SagaEventKind::SagaCompensated, None, None);
        }
    }

    async fn persist(&self, record: &mut SagaRecord) {
        record.updated_at = self.clock.now();
        let snapshot = &*record;
        if let Err(e) = retry_transient(&self.config.persist_retry, Deadline::none(), || {
            self.store.save(snapshot)
        })
        .await
        {
            tracing::error!(
                saga_id = %record.saga_id,
                status = %record.status,
                error = %e,
                "Failed to persist saga record"
            );
        }
    }

    fn emit(
        &self,
        instance: &SagaInstance,
        kind: SagaEventKind,
        step: Option<&str>,
        error: Option<String>,
    ) {
        // No receivers is fine: listeners are optional.
        let _ = self.events.send(SagaEvent {
            saga_id: instance.context.saga_id(),
            saga_name: instance.definition.name.clone(),
            kind,
            step: step.map(str::to_string),
            error,
            at: self.clock.now(),
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use seatline_testing::InMemorySagaStore;
    use seatline_testing::mocks::test_clock;
    use std::sync::atomic::AtomicUsize;

    fn orchestrator(store: Arc<InMemorySagaStore>) -> SagaOrchestrator {
        SagaOrchestrator::new(store, Arc::new(test_clock()), SagaOrchestratorConfig::default())
    }

    fn recording_step(name: &'static str, log: Arc<Mutex<Vec<String>>>) -> StepDefinition {
        let exec_log = Arc::clone(&log);
        StepDefinition::new(name, move |_ctx| {
            let log = Arc::clone(&exec_log);
            async move {
                log.lock().unwrap().push(format!("exec:{name}"));
                Ok(())
            }
        })
        .with_compensation(move |_ctx| {
            let log = Arc::clone(&log);
            async move {
                log.lock().unwrap().push(format!("comp:{name}"));
                Ok(())
            }
        })
    }

    fn failing_step(name: &'static str) -> StepDefinition {
        StepDefinition::new(name, |_ctx| async {
            Err(StepError::new(ErrorKind::Permanent, "card declined"))
        })
    }

    #[tokio::test]
    async fn test_completes_all_steps_in_order() {
        let store = Arc::new(InMemorySagaStore::new());
        let orch = orchestrator(Arc::clone(&store));
        let log = Arc::new(Mutex::new(Vec::new()));

        orch.register(
            SagaDefinition::new("demo")
                .step(recording_step("a", Arc::clone(&log)))
                .step(recording_step("b", Arc::clone(&log))),
        );

        let id = orch.create("demo", Map::new()).await.unwrap();
        let record = orch.execute(id, Deadline::none()).await.unwrap();

        assert_eq!(record.status, SagaStatus::Completed);
        assert_eq!(*log.lock().unwrap(), vec!["exec:a", "exec:b"]);
        assert!(record.steps.iter().all(|s| s.status == StepStatus::Completed));
        assert_eq!(store.load(id).await.unwrap().unwrap().status, SagaStatus::Completed);
    }

    #[tokio::test]
    async fn test_abandon_closes_only_pending_sagas() {
        let store = Arc::new(InMemorySagaStore::new());
        let orch = orchestrator(Arc::clone(&store));
        let log = Arc::new(Mutex::new(Vec::new()));
        orch.register(SagaDefinition::new("demo").step(recording_step("a", Arc::clone(&log))));

        let idle = orch.create("demo", Map::new()).await.unwrap();
        assert!(orch.abandon(idle, "order expired").await.unwrap());
        let record = store.load(idle).await.unwrap().unwrap();
        assert_eq!(record.status, SagaStatus::Compensated);
        assert_eq!(record.failure_reason.as_deref(), Some("order expired"));
        assert_eq!(record.steps[0].status, StepStatus::Pending);
        assert!(matches!(
            orch.execute(idle, Deadline::none()).await,
            Err(SagaError::NotRetryable { .. })
        ));
        assert!(log.lock().unwrap().is_empty());

        let done = orch.create("demo", Map::new()).await.unwrap();
        orch.execute(done, Deadline::none()).await.unwrap();
        assert!(!orch.abandon(done, "order expired").await.unwrap());
        assert_eq!(orch.get(done).await.unwrap().status, SagaStatus::Completed);
    }

    #[tokio::test]
    async fn test_compensates_in_reverse_and_skips_uncompensable() {
        let store = Arc::new(InMemorySagaStore::new());
        let orch = orchestrator(store);
        let log = Arc::new(Mutex::new(Vec::new()));

        let plain = {
            let log = Arc::clone(&log);
            StepDefinition::new("plain", move |_ctx| {
                let log = Arc::clone(&log);
                async move {
                    log.lock().unwrap().push("exec:plain".into());
                    Ok(())
                }
            })
        };

        orch.register(
            SagaDefinition::new("demo")
                .step(recording_step("a", Arc::clone(&log)))
                .step(plain)
                .step(recording_step("b", Arc::clone(&log)))
                .step(failing_step("c")),
        );

        let id = orch.create("demo", Map::new()).await.unwrap();
        let record = orch.execute(id, Deadline::none()).await.unwrap();

        assert_eq!(record.status, SagaStatus::Compensated);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["exec:a", "exec:plain", "exec:b", "comp:b", "comp:a"]
        );
        assert_eq!(
            record.failure_reason.as_deref(),
            Some("step 'c' failed: card declined")
        );
        assert!(record.steps[0].compensated);
        assert!(!record.steps[1].compensated);
        assert_eq!(record.steps[1].status, StepStatus::Completed);
        assert_eq!(record.steps[3].status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn test_compensation_errors_are_collected_and_fail_the_saga() {
        let store = Arc::new(InMemorySagaStore::new());
        let orch = orchestrator(store);
        let log = Arc::new(Mutex::new(Vec::new()));

        let broken = StepDefinition::new("broken", |_ctx| async { Ok(()) })
            .with_compensation(|_ctx| async {
                Err(StepError::new(ErrorKind::Transient, "provider timeout"))
            });

        orch.register(
            SagaDefinition::new("demo")
                .step(recording_step("a", Arc::clone(&log)))
                .step(broken)
                .step(failing_step("c")),
        );

        let id = orch.create("demo", Map::new()).await.unwrap();
        let record = orch.execute(id, Deadline::none()).await.unwrap();

        assert_eq!(record.status, SagaStatus::Failed);
        // The failing compensation did not stop the earlier one.
        assert_eq!(*log.lock().unwrap(), vec!["exec:a", "comp:a"]);
        let reason = record.failure_reason.unwrap();
        assert!(reason.contains("compensation for 'broken' failed: provider timeout"));
        assert_eq!(record.steps[1].compensation_error.as_deref(), Some("provider timeout"));
    }

    #[tokio::test]
    async fn test_forward_only_saga_fails_without_compensating() {
        let store = Arc::new(InMemorySagaStore::new());
        let orch = orchestrator(store);
        let log = Arc::new(Mutex::new(Vec::new()));

        orch.register(
            SagaDefinition::new("cancel")
                .step(recording_step("a", Arc::clone(&log)))
                .step(failing_step("refund"))
                .forward_only(),
        );

        let id = orch.create("cancel", Map::new()).await.unwrap();
        let record = orch.execute(id, Deadline::none()).await.unwrap();

        assert_eq!(record.status, SagaStatus::Failed);
        assert_eq!(*log.lock().unwrap(), vec!["exec:a"]);
    }

    #[tokio::test]
    async fn test_context_values_flow_to_later_steps_and_are_persisted() {
        let store = Arc::new(InMemorySagaStore::new());
        let orch = orchestrator(Arc::clone(&store));

        orch.register(
            SagaDefinition::new("ctx")
                .step(StepDefinition::new("produce", |ctx: SagaContext| async move {
                    ctx.insert("payment_id", "pay-1")
                }))
                .step(StepDefinition::new("consume", |ctx: SagaContext| async move {
                    let id: String = ctx.require("payment_id")?;
                    ctx.insert("seen", id)
                })),
        );

        let id = orch.create("ctx", Map::new()).await.unwrap();
        let record = orch.execute(id, Deadline::none()).await.unwrap();

        assert_eq!(record.context.get("seen"), Some(&Value::from("pay-1")));
        let persisted = store.load(id).await.unwrap().unwrap();
        assert_eq!(persisted.context.get("payment_id"), Some(&Value::from("pay-1")));
    }

    #[tokio::test]
    async fn test_expired_deadline_fails_current_step_as_cancelled() {
        let store = Arc::new(InMemorySagaStore::new());
        let orch = orchestrator(store);
        let log = Arc::new(Mutex::new(Vec::new()));

        let slow = StepDefinition::new("slow", |_ctx| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        });

        orch.register(
            SagaDefinition::new("demo")
                .step(recording_step("a", Arc::clone(&log)))
                .step(slow),
        );

        let id = orch.create("demo", Map::new()).await.unwrap();
        let record = orch
            .execute(id, Deadline::after(Duration::from_millis(50)))
            .await
            .unwrap();

        assert_eq!(record.status, SagaStatus::Compensated);
        assert!(record.failure_reason.unwrap().contains("cancelled"));
        assert_eq!(*log.lock().unwrap(), vec!["exec:a", "comp:a"]);
    }

    #[tokio::test]
    async fn test_retry_reruns_from_failed_step() {
        let store = Arc::new(InMemorySagaStore::new());
        let orch = orchestrator(store);
        let attempts = Arc::new(AtomicUsize::new(0));

        let flaky = {
            let attempts = Arc::clone(&attempts);
            StepDefinition::new("flaky", move |_ctx| {
                let attempts = Arc::clone(&attempts);
                async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(StepError::new(ErrorKind::Transient, "timeout"))
                    } else {
                        Ok(())
                    }
                }
            })
        };

        orch.register(
            SagaDefinition::new("demo")
                .step(StepDefinition::new("verify", |_ctx| async { Ok(()) }))
                .step(flaky),
        );

        let id = orch.create("demo", Map::new()).await.unwrap();
        let first = orch.execute(id, Deadline::none()).await.unwrap();
        assert_eq!(first.status, SagaStatus::Compensated);

        let second = orch.retry(id, Deadline::none()).await.unwrap();
        assert_eq!(second.status, SagaStatus::Completed);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_rejects_completed_and_unknown_sagas() {
        let store = Arc::new(InMemorySagaStore::new());
        let orch = orchestrator(store);
        orch.register(
            SagaDefinition::new("demo").step(StepDefinition::new("ok", |_ctx| async { Ok(()) })),
        );

        let id = orch.create("demo", Map::new()).await.unwrap();
        orch.execute(id, Deadline::none()).await.unwrap();

        assert!(matches!(
            orch.retry(id, Deadline::none()).await,
            Err(SagaError::NotRetryable {
                status: SagaStatus::Completed,
                ..
            })
        ));
        assert!(matches!(
            orch.retry(Uuid::new_v4(), Deadline::none()).await,
            Err(SagaError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_listeners_observe_lifecycle_in_order() {
        let store = Arc::new(InMemorySagaStore::new());
        let orch = orchestrator(store);
        let mut events = orch.subscribe();
        let log = Arc::new(Mutex::new(Vec::new()));

        orch.register(
            SagaDefinition::new("demo")
                .step(recording_step("a", Arc::clone(&log)))
                .step(failing_step("b")),
        );
        let id = orch.create("demo", Map::new()).await.unwrap();
        orch.execute(id, Deadline::none()).await.unwrap();

        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            kinds.push(event.kind.as_str());
        }
        assert_eq!(
            kinds,
            vec![
                "saga_started",
                "step_started",
                "step_completed",
                "step_started",
                "step_failed",
                "compensation_started",
                "compensating_step",
                "step_compensated",
                "saga_compensated",
            ]
        );
    }

    #[tokio::test]
    async fn test_recovery_resumes_interrupted_saga_from_current_step() {
        let store = Arc::new(InMemorySagaStore::new());
        let orch = orchestrator(Arc::clone(&store));
        let log = Arc::new(Mutex::new(Vec::new()));

        orch.register(
            SagaDefinition::new("demo")
                .step(recording_step("a", Arc::clone(&log)))
                .step(recording_step("b", Arc::clone(&log))),
        );

        // Simulate a crash after step "a" completed and "b" started.
        let id = Uuid::new_v4();
        let now = Utc::now();
        let mut steps = vec![StepRecord::pending("a"), StepRecord::pending("b")];
        steps[0].status = StepStatus::Completed;
        steps[1].status = StepStatus::Running;
        store
            .save(&SagaRecord {
                saga_id: id,
                name: "demo".into(),
                status: SagaStatus::Running,
                current_step: 1,
                steps,
                context: Map::new(),
                started_at: Some(now),
                completed_at: None,
                failure_reason: None,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();

        let parked = orch.recover(false, Deadline::none()).await.unwrap();
        assert_eq!(parked, vec![id]);
        assert!(log.lock().unwrap().is_empty());

        let resumed = orch.recover(true, Deadline::none()).await.unwrap();
        assert_eq!(resumed, vec![id]);
        assert_eq!(*log.lock().unwrap(), vec!["exec:b"]);
        assert_eq!(orch.get(id).await.unwrap().status, SagaStatus::Completed);
    }
}
