//! Task queue scheduler and worker dispatch.
//!
//! One claim per task per attempt: the store's `claim_due` marks the task
//! running and charges the attempt counter atomically, so two workers can
//! never run the same attempt. Handler failures consume the attempt and
//! reschedule the task with exponential backoff until the budget is spent.
//!
//! Handlers run inside their own spawned tasks, so a panicking handler
//! surfaces as a failed attempt instead of taking the scheduler down.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use warden_types::config::QueueSettings;
use warden_types::errors::WardenError;
use warden_types::traits::{TaskHandler, TaskStore};
use warden_types::{EnqueueOptions, Task, TaskStatus};

/// Exponent ceiling for retry backoff, to keep the shift well-defined.
const MAX_BACKOFF_EXP: u32 = 16;

/// Scheduler tuning.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Fixed number of worker slots.
    pub workers: usize,
    /// Scheduler poll interval.
    pub poll_interval: Duration,
    /// Base interval for exponential retry backoff (milliseconds).
    pub base_retry_ms: i64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::from_settings(&QueueSettings::default())
    }
}

impl QueueConfig {
    /// Build from the config-file section.
    pub fn from_settings(settings: &QueueSettings) -> Self {
        Self {
            workers: settings.workers,
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
            base_retry_ms: settings.base_retry_ms,
        }
    }
}

/// The task queue: enqueue/cancel/status API plus the polling scheduler.
pub struct TaskQueue {
    config: QueueConfig,
    store: Arc<dyn TaskStore>,
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
    /// Workers currently executing a task.
    busy: AtomicUsize,
}

impl TaskQueue {
    /// Create a queue over the given store.
    pub fn new(config: QueueConfig, store: Arc<dyn TaskStore>) -> Self {
        Self {
            config,
            store,
            handlers: RwLock::new(HashMap::new()),
            busy: AtomicUsize::new(0),
        }
    }

    /// Register the handler for a task type, replacing any previous one.
    pub fn register_handler(&self, task_type: &str, handler: Arc<dyn TaskHandler>) {
        self.handlers
            .write()
            .insert(task_type.to_string(), handler);
    }

    /// Enqueue a new task. Returns its id.
    pub async fn enqueue(
        &self,
        task_type: &str,
        payload: serde_json::Value,
        opts: EnqueueOptions,
    ) -> Result<Uuid, WardenError> {
        let now = Utc::now();
        let task = Task {
            id: Uuid::new_v4(),
            task_type: task_type.to_string(),
            payload,
            priority: opts.priority.min(10),
            status: TaskStatus::Pending,
            attempts: 0,
            max_attempts: opts.max_attempts.max(1),
            scheduled_at: now + ChronoDuration::milliseconds(opts.delay_ms.max(0)),
            started_at: None,
            completed_at: None,
            error: None,
            result: None,
            created_at: now,
        };
        let id = task.id;
        self.store.insert(task).await?;
        debug!(task_id = %id, task_type, "task enqueued");
        Ok(id)
    }

    /// Cancel a task iff it is still pending.
    pub async fn cancel(&self, id: Uuid) -> Result<bool, WardenError> {
        let cancelled = self.store.cancel_pending(id).await?;
        if cancelled {
            info!(task_id = %id, "task cancelled");
        }
        Ok(cancelled)
    }

    /// Fetch the current task envelope.
    pub async fn status(&self, id: Uuid) -> Result<Option<Task>, WardenError> {
        self.store.get(id).await
    }

    /// Run the polling scheduler until the returned handle is aborted.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(queue.config.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!(workers = queue.config.workers, "task queue started");
            loop {
                ticker.tick().await;
                if let Err(e) = queue.poll_once().await {
                    warn!(error = %e, "scheduler poll failed");
                }
            }
        })
    }

    /// One scheduler round: claim up to the number of free worker slots and
    /// spawn a worker for each claimed task. Returns how many were spawned.
    pub async fn poll_once(self: &Arc<Self>) -> Result<usize, WardenError> {
        let mut spawned = 0;
        loop {
            let free = self
                .config
                .workers
                .saturating_sub(self.busy.load(Ordering::SeqCst));
            if free == 0 {
                break;
            }
            let Some(task) = self.store.claim_due(Utc::now()).await? else {
                break;
            };
            self.busy.fetch_add(1, Ordering::SeqCst);
            let queue = Arc::clone(self);
            tokio::spawn(async move {
                queue.run_task(task).await;
                queue.busy.fetch_sub(1, Ordering::SeqCst);
            });
            spawned += 1;
        }
        Ok(spawned)
    }

    /// Execute one claimed task and settle its outcome in the store.
    async fn run_task(&self, task: Task) {
        let handler = self.handlers.read().get(&task.task_type).cloned();
        let Some(handler) = handler else {
            // Unknown types are permanent failures: retrying cannot help.
            warn!(task_id = %task.id, task_type = %task.task_type, "no handler registered");
            if let Err(e) = self
                .store
                .fail(task.id, &format!("no handler registered for '{}'", task.task_type))
                .await
            {
                error!(task_id = %task.id, error = %e, "failed to mark task failed");
            }
            return;
        };

        debug!(
            task_id = %task.id,
            task_type = %task.task_type,
            attempt = task.attempts,
            "worker picked up task"
        );

        // The handler runs in its own spawned task so a panic is contained
        // and charged as a failed attempt.
        let inner = {
            let handler = Arc::clone(&handler);
            let task = task.clone();
            tokio::spawn(async move { handler.handle(&task).await })
        };
        let outcome = match inner.await {
            Ok(outcome) => outcome,
            Err(join_err) => Err(format!("handler panicked: {join_err}")),
        };

        let settle = match outcome {
            Ok(result) => {
                debug!(task_id = %task.id, "task completed");
                self.store.complete(task.id, result).await
            }
            Err(task_err) if task.attempts >= task.max_attempts => {
                warn!(
                    task_id = %task.id,
                    attempts = task.attempts,
                    error = %task_err,
                    "task failed, retry budget exhausted"
                );
                self.store.fail(task.id, &task_err).await
            }
            Err(task_err) => {
                let backoff_ms = self
                    .config
                    .base_retry_ms
                    .saturating_mul(1_i64 << task.attempts.min(MAX_BACKOFF_EXP));
                let at = Utc::now() + ChronoDuration::milliseconds(backoff_ms);
                warn!(
                    task_id = %task.id,
                    attempt = task.attempts,
                    backoff_ms,
                    error = %task_err,
                    "task attempt failed, rescheduling"
                );
                self.store.reschedule(task.id, at, &task_err).await
            }
        };
        if let Err(e) = settle {
            error!(task_id = %task.id, error = %e, "failed to settle task outcome");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use tokio::sync::Notify;
    use warden_store::MemoryTaskStore;

    fn make_queue(workers: usize, base_retry_ms: i64) -> Arc<TaskQueue> {
        let config = QueueConfig {
            workers,
            poll_interval: Duration::from_millis(10),
            base_retry_ms,
        };
        Arc::new(TaskQueue::new(config, Arc::new(MemoryTaskStore::new())))
    }

    /// Wait (paused-clock friendly) until the task reaches a terminal status.
    async fn wait_terminal(queue: &Arc<TaskQueue>, id: Uuid) -> Task {
        for _ in 0..1_000 {
            let task = queue.status(id).await.unwrap().expect("task exists");
            if task.status.is_terminal() {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("task {id} never reached a terminal status");
    }

    /// Handler double that succeeds and records the payloads it saw.
    struct RecordingHandler {
        seen: Mutex<Vec<serde_json::Value>>,
    }

    impl RecordingHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl TaskHandler for RecordingHandler {
        async fn handle(&self, task: &Task) -> Result<serde_json::Value, String> {
            self.seen.lock().push(task.payload.clone());
            Ok(json!({"ok": true}))
        }
    }

    /// Handler double that always fails.
    struct FailingHandler;

    #[async_trait]
    impl TaskHandler for FailingHandler {
        async fn handle(&self, _task: &Task) -> Result<serde_json::Value, String> {
            Err("downstream unavailable".to_string())
        }
    }

    /// Handler double that panics.
    struct PanickingHandler;

    #[async_trait]
    impl TaskHandler for PanickingHandler {
        async fn handle(&self, _task: &Task) -> Result<serde_json::Value, String> {
            panic!("handler bug");
        }
    }

    /// Keep releasing the parked handler until the task settles; a single
    /// notify can race the handler reaching its wait point.
    async fn release_until_terminal(queue: &Arc<TaskQueue>, release: &Arc<Notify>, id: Uuid) {
        for _ in 0..1_000 {
            release.notify_waiters();
            let task = queue.status(id).await.unwrap().expect("task exists");
            if task.status.is_terminal() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("task {id} never settled after release");
    }

    /// Handler double that parks until released.
    struct ParkedHandler {
        release: Arc<Notify>,
    }

    #[async_trait]
    impl TaskHandler for ParkedHandler {
        async fn handle(&self, _task: &Task) -> Result<serde_json::Value, String> {
            self.release.notified().await;
            Ok(json!(null))
        }
    }

    // ========================================================================
    // Enqueue / Cancel / Status
    // ========================================================================

    #[tokio::test]
    async fn test_enqueue_creates_pending_task() {
        let queue = make_queue(2, 1_000);
        let id = queue
            .enqueue("memory.rescore", json!({"conversation": "c-1"}), EnqueueOptions::default())
            .await
            .unwrap();
        let task = queue.status(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempts, 0);
        assert_eq!(task.max_attempts, 3);
        assert_eq!(task.priority, 5);
    }

    #[tokio::test]
    async fn test_enqueue_clamps_priority() {
        let queue = make_queue(2, 1_000);
        let id = queue
            .enqueue(
                "noop",
                json!(null),
                EnqueueOptions {
                    priority: 99,
                    ..EnqueueOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(queue.status(id).await.unwrap().unwrap().priority, 10);
    }

    #[tokio::test]
    async fn test_cancel_pending_only() {
        let queue = make_queue(1, 1_000);
        queue.register_handler("noop", RecordingHandler::new());
        let id = queue
            .enqueue("noop", json!(null), EnqueueOptions::default())
            .await
            .unwrap();
        assert!(queue.cancel(id).await.unwrap());
        // Second cancel is a no-op.
        assert!(!queue.cancel(id).await.unwrap());
        assert_eq!(
            queue.status(id).await.unwrap().unwrap().status,
            TaskStatus::Cancelled
        );
        // A cancelled task is never claimed.
        assert_eq!(queue.poll_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cannot_cancel_completed_task() {
        let queue = make_queue(1, 1_000);
        queue.register_handler("noop", RecordingHandler::new());
        let id = queue
            .enqueue("noop", json!(null), EnqueueOptions::default())
            .await
            .unwrap();
        queue.poll_once().await.unwrap();
        wait_terminal(&queue, id).await;
        assert!(!queue.cancel(id).await.unwrap());
    }

    // ========================================================================
    // Execution & Retry
    // ========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_successful_task_records_result() {
        let queue = make_queue(2, 1_000);
        queue.register_handler("noop", RecordingHandler::new());
        let id = queue
            .enqueue("noop", json!({"n": 1}), EnqueueOptions::default())
            .await
            .unwrap();
        assert_eq!(queue.poll_once().await.unwrap(), 1);
        let task = wait_terminal(&queue, id).await;
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result, Some(json!({"ok": true})));
        assert!(task.completed_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_attempt_reschedules_with_error() {
        let queue = make_queue(1, 1_000);
        queue.register_handler("flaky", Arc::new(FailingHandler));
        let id = queue
            .enqueue("flaky", json!(null), EnqueueOptions::default())
            .await
            .unwrap();
        queue.poll_once().await.unwrap();

        // Wait until the worker settles the attempt back to pending.
        let mut task = queue.status(id).await.unwrap().unwrap();
        for _ in 0..1_000 {
            if task.status == TaskStatus::Pending && task.attempts == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
            task = queue.status(id).await.unwrap().unwrap();
        }
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempts, 1);
        assert_eq!(task.error.as_deref(), Some("downstream unavailable"));
        assert!(task.scheduled_at > Utc::now());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_exhaustion_fails_task() {
        // Zero backoff keeps every retry immediately claimable.
        let queue = make_queue(1, 0);
        queue.register_handler("flaky", Arc::new(FailingHandler));
        let id = queue
            .enqueue(
                "flaky",
                json!(null),
                EnqueueOptions {
                    max_attempts: 2,
                    ..EnqueueOptions::default()
                },
            )
            .await
            .unwrap();

        for _ in 0..100 {
            queue.poll_once().await.unwrap();
            let task = queue.status(id).await.unwrap().unwrap();
            if task.status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let task = queue.status(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempts, 2);
        assert_eq!(task.error.as_deref(), Some("downstream unavailable"));
    }

    #[tokio::test]
    async fn test_three_attempts_with_growing_backoff() {
        let queue = make_queue(1, 20);
        queue.register_handler("flaky", Arc::new(FailingHandler));
        let id = queue
            .enqueue(
                "flaky",
                json!(null),
                EnqueueOptions {
                    max_attempts: 3,
                    ..EnqueueOptions::default()
                },
            )
            .await
            .unwrap();

        // Capture the delay charged after each failed attempt.
        let mut delays: Vec<ChronoDuration> = Vec::new();
        for _ in 0..2_000 {
            queue.poll_once().await.unwrap();
            let task = queue.status(id).await.unwrap().unwrap();
            if task.status == TaskStatus::Pending && task.attempts as usize > delays.len() {
                delays.push(task.scheduled_at - task.started_at.unwrap());
            }
            if task.status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let task = queue.status(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempts, 3);
        assert_eq!(task.error.as_deref(), Some("downstream unavailable"));

        // Two reschedules before the terminal failure, with 2^attempts growth.
        assert_eq!(delays.len(), 2);
        assert!(delays[0] >= ChronoDuration::milliseconds(40));
        assert!(delays[1] >= ChronoDuration::milliseconds(80));
        assert!(delays[1] > delays[0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_handler_fails_without_retry() {
        let queue = make_queue(1, 0);
        let id = queue
            .enqueue("unregistered", json!(null), EnqueueOptions::default())
            .await
            .unwrap();
        queue.poll_once().await.unwrap();
        let task = wait_terminal(&queue, id).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.unwrap().contains("no handler registered"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_handler_does_not_kill_the_queue() {
        let queue = make_queue(1, 0);
        queue.register_handler("boom", Arc::new(PanickingHandler));
        queue.register_handler("noop", RecordingHandler::new());

        let boom = queue
            .enqueue(
                "boom",
                json!(null),
                EnqueueOptions {
                    max_attempts: 1,
                    ..EnqueueOptions::default()
                },
            )
            .await
            .unwrap();
        queue.poll_once().await.unwrap();
        let task = wait_terminal(&queue, boom).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.unwrap().contains("panicked"));

        // The queue still runs subsequent work.
        let ok = queue
            .enqueue("noop", json!(null), EnqueueOptions::default())
            .await
            .unwrap();
        queue.poll_once().await.unwrap();
        assert_eq!(wait_terminal(&queue, ok).await.status, TaskStatus::Completed);
    }

    // ========================================================================
    // Scheduling
    // ========================================================================

    #[tokio::test]
    async fn test_delayed_task_is_not_claimed_early() {
        let queue = make_queue(2, 1_000);
        queue.register_handler("noop", RecordingHandler::new());
        queue
            .enqueue(
                "noop",
                json!(null),
                EnqueueOptions {
                    delay_ms: 60_000,
                    ..EnqueueOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(queue.poll_once().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_higher_priority_runs_first() {
        let queue = make_queue(1, 1_000);
        let handler = RecordingHandler::new();
        queue.register_handler("noop", Arc::clone(&handler) as Arc<dyn TaskHandler>);

        queue
            .enqueue(
                "noop",
                json!("low"),
                EnqueueOptions {
                    priority: 1,
                    ..EnqueueOptions::default()
                },
            )
            .await
            .unwrap();
        let high = queue
            .enqueue(
                "noop",
                json!("high"),
                EnqueueOptions {
                    priority: 9,
                    ..EnqueueOptions::default()
                },
            )
            .await
            .unwrap();

        queue.poll_once().await.unwrap();
        wait_terminal(&queue, high).await;
        queue.poll_once().await.unwrap();
        for _ in 0..1_000 {
            if handler.seen.lock().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(*handler.seen.lock(), vec![json!("high"), json!("low")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_slots_are_respected() {
        let queue = make_queue(1, 1_000);
        let release = Arc::new(Notify::new());
        queue.register_handler(
            "parked",
            Arc::new(ParkedHandler {
                release: Arc::clone(&release),
            }),
        );

        let first = queue
            .enqueue("parked", json!(1), EnqueueOptions::default())
            .await
            .unwrap();
        let second = queue
            .enqueue("parked", json!(2), EnqueueOptions::default())
            .await
            .unwrap();

        assert_eq!(queue.poll_once().await.unwrap(), 1);
        // The single slot is occupied; nothing more is claimed.
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(queue.poll_once().await.unwrap(), 0);

        release_until_terminal(&queue, &release, first).await;
        assert_eq!(queue.poll_once().await.unwrap(), 1);
        release_until_terminal(&queue, &release, second).await;
    }
}
