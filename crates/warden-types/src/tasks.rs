/// Types for the background task queue.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a background task.
///
/// Created `Pending`, promoted to `Running` by a worker, then terminal
/// `Completed`/`Failed`, or rescheduled `Pending` on a retryable failure.
/// Cancellation is only valid while pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Stable string form used in the durable store.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse the durable-store string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Whether this status is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// A background task envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier.
    pub id: Uuid,
    /// Registered handler type this task is dispatched to.
    pub task_type: String,
    /// Handler payload.
    pub payload: serde_json::Value,
    /// Priority, 0 (lowest) to 10 (highest).
    pub priority: u8,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Attempts made so far (incremented when a worker claims the task).
    pub attempts: u32,
    /// Total attempt budget.
    pub max_attempts: u32,
    /// Earliest time a worker may claim this task.
    pub scheduled_at: DateTime<Utc>,
    /// When the current or last attempt started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Last error, on failure or between retries.
    pub error: Option<String>,
    /// Handler result, on success.
    pub result: Option<serde_json::Value>,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
}

/// Options for enqueueing a task.
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    /// Priority, clamped to 0..=10.
    pub priority: u8,
    /// Initial delay before the task becomes claimable.
    pub delay_ms: i64,
    /// Total attempt budget.
    pub max_attempts: u32,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            priority: 5,
            delay_ms: 0,
            max_attempts: 3,
        }
    }
}
