/// Trait contracts for all Warden seams.
///
/// Every external collaborator the pipeline touches is specified here as a
/// trait: subsystem crates code against these interfaces, not against each
/// other's concrete types. All traits live in `warden-types` so that every
/// crate can depend on them without circular dependencies.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::admission::WindowProbe;
use crate::audit::{Alert, AuditRecord, SecurityEvent};
use crate::errors::WardenError;
use crate::execution::{CompletionRequest, CompletionResponse, ToolDefinition, ToolOutcome};
use crate::screening::ExternalFlag;
use crate::tasks::Task;

// ============================================================
// LLM and Tool Seams
// ============================================================

/// Provider-agnostic LLM interface.
///
/// The provider is responsible for its own transport retries; a returned
/// error means retries are exhausted.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Completion with no tool definitions attached.
    ///
    /// The response structurally cannot contain tool calls — this is what the
    /// Solve phase relies on.
    async fn complete(&self, request: CompletionRequest)
        -> Result<CompletionResponse, WardenError>;

    /// Completion with tool definitions attached and tool choice left to the
    /// model. Used exactly once per turn, in the Planning phase.
    async fn complete_with_tools(
        &self,
        request: CompletionRequest,
        tools: &[ToolDefinition],
    ) -> Result<CompletionResponse, WardenError>;
}

/// Executes concrete tool implementations on behalf of the engine.
///
/// Must never fail at the call boundary — tool errors and timeouts are
/// reported as a structured [`ToolOutcome`] with `success = false`.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Invoke a tool by name with JSON arguments.
    async fn invoke(&self, name: &str, args: &serde_json::Value) -> ToolOutcome;
}

// ============================================================
// Store Seams
// ============================================================

/// Distributed key-value primitives consumed by the admission controller,
/// threat-history tracking, and alert aggregation.
///
/// Implementations must make [`window_probe`](Self::window_probe) atomic:
/// two concurrent probes for the same key must never both observe
/// "under limit" when only one slot remains.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Atomic sliding-window probe: evict entries older than `window_ms`,
    /// count the rest, and — when `record` is true and the count is under
    /// `cap` — insert an entry at `now_ms` and refresh the key TTL.
    async fn window_probe(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: i64,
        cap: u32,
        record: bool,
    ) -> Result<WindowProbe, WardenError>;

    /// Atomically increment a counter and refresh its TTL.
    /// Returns the counter value after the increment.
    async fn incr_with_expiry(
        &self,
        key: &str,
        delta: i64,
        ttl_ms: i64,
    ) -> Result<i64, WardenError>;

    /// Read a counter. Missing keys read as zero.
    async fn get_counter(&self, key: &str) -> Result<i64, WardenError>;

    /// Delete a key (windows and counters alike).
    async fn remove(&self, key: &str) -> Result<(), WardenError>;
}

/// Durable task storage with exclusive claim semantics.
///
/// Claims must be exclusive: two workers must never both claim the same task.
/// The Postgres implementation uses row-level locking with skip-locked reads;
/// the in-memory implementation serializes claims behind a mutex.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist a new pending task.
    async fn insert(&self, task: Task) -> Result<(), WardenError>;

    /// Exclusively claim the highest-priority due pending task, marking it
    /// running and incrementing its attempt counter. Returns `None` when no
    /// task is due.
    async fn claim_due(&self, now: DateTime<Utc>) -> Result<Option<Task>, WardenError>;

    /// Mark a running task completed with its result.
    async fn complete(&self, id: Uuid, result: serde_json::Value) -> Result<(), WardenError>;

    /// Mark a task permanently failed with its last error.
    async fn fail(&self, id: Uuid, error: &str) -> Result<(), WardenError>;

    /// Return a running task to pending, scheduled at `at`, recording the
    /// error that triggered the retry.
    async fn reschedule(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), WardenError>;

    /// Cancel a task iff it is still pending. Returns whether it was cancelled.
    async fn cancel_pending(&self, id: Uuid) -> Result<bool, WardenError>;

    /// Fetch a task by id.
    async fn get(&self, id: Uuid) -> Result<Option<Task>, WardenError>;
}

/// Append-only audit storage.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Append a batch of records. All-or-nothing: on error the caller
    /// requeues the batch.
    async fn append(&self, records: Vec<AuditRecord>) -> Result<(), WardenError>;

    /// Write a security event synchronously.
    async fn append_event(&self, event: SecurityEvent) -> Result<(), WardenError>;

    /// Resolve a security event exactly once, recording the mitigation.
    /// Returns false if the event was already resolved or does not exist.
    async fn resolve_event(&self, id: Uuid, mitigation: &str) -> Result<bool, WardenError>;
}

// ============================================================
// Moderation and Alerting Seams
// ============================================================

/// Optional external moderation capability.
///
/// Absence of a provider yields an empty contribution, never an error.
#[async_trait]
pub trait ModerationProvider: Send + Sync {
    /// Classify text into provider-defined categories with scores.
    async fn classify(&self, text: &str) -> Result<Vec<ExternalFlag>, WardenError>;
}

/// Push-only alert channel. Fire-and-forget: callers log failures and move on.
#[async_trait]
pub trait AlertChannel: Send + Sync {
    /// Channel name for logging.
    fn name(&self) -> &str;

    /// Send an alert payload.
    async fn send(&self, alert: &Alert) -> Result<(), WardenError>;
}

// ============================================================
// Task Handler Seam
// ============================================================

/// Handler for one registered background task type.
///
/// The error string is recorded on the task envelope; returning an error
/// consumes one attempt from the retry budget.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Execute the task, returning a JSON result on success.
    async fn handle(&self, task: &Task) -> Result<serde_json::Value, String>;
}
