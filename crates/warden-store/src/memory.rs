//! In-process store implementations.
//!
//! These back two distinct roles:
//! - The degraded-availability fallback when the distributed store is
//!   unreachable (admission windows, threat history, alert counters). State
//!   is per-process and intentionally not shared across instances.
//! - The default backend for tests and store-less deployments.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use warden_types::errors::WardenError;
use warden_types::tasks::{Task, TaskStatus};
use warden_types::traits::{AuditStore, KvStore, TaskStore};
use warden_types::{AuditRecord, SecurityEvent, WindowProbe};

// ============================================================
// MemoryKvStore
// ============================================================

/// In-process sliding windows and TTL counters.
///
/// All operations take a short `parking_lot` lock, which also provides the
/// atomicity [`KvStore::window_probe`] requires within one process.
#[derive(Default)]
pub struct MemoryKvStore {
    /// Window key → event timestamps (epoch ms), oldest first.
    windows: Mutex<HashMap<String, Vec<i64>>>,
    /// Counter key → (value, expires-at epoch ms).
    counters: Mutex<HashMap<String, (i64, i64)>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Purge window entries older than `retention_ms` and expired counters.
    ///
    /// Called by the admission controller's background sweep to bound memory.
    /// Returns the number of keys removed entirely.
    pub fn purge_expired(&self, now_ms: i64, retention_ms: i64) -> usize {
        let mut removed = 0;

        let mut windows = self.windows.lock();
        windows.retain(|_, entries| {
            entries.retain(|&ts| ts > now_ms - retention_ms);
            if entries.is_empty() {
                removed += 1;
                false
            } else {
                true
            }
        });
        drop(windows);

        let mut counters = self.counters.lock();
        counters.retain(|_, &mut (_, expires_at)| {
            if expires_at <= now_ms {
                removed += 1;
                false
            } else {
                true
            }
        });

        removed
    }

    /// Number of live window keys. Used by the sweep tests.
    pub fn window_key_count(&self) -> usize {
        self.windows.lock().len()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn window_probe(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: i64,
        cap: u32,
        record: bool,
    ) -> Result<WindowProbe, WardenError> {
        let mut windows = self.windows.lock();
        let entries = windows.entry(key.to_string()).or_default();
        entries.retain(|&ts| ts > now_ms - window_ms);

        let allowed = (entries.len() as u32) < cap;
        if allowed && record {
            entries.push(now_ms);
        }

        Ok(WindowProbe {
            allowed,
            count: entries.len() as u32,
            oldest_ms: entries.first().copied(),
        })
    }

    async fn incr_with_expiry(
        &self,
        key: &str,
        delta: i64,
        ttl_ms: i64,
    ) -> Result<i64, WardenError> {
        let now_ms = Utc::now().timestamp_millis();
        let mut counters = self.counters.lock();
        let entry = counters.entry(key.to_string()).or_insert((0, 0));
        if entry.1 <= now_ms {
            entry.0 = 0;
        }
        entry.0 += delta;
        entry.1 = now_ms + ttl_ms;
        Ok(entry.0)
    }

    async fn get_counter(&self, key: &str) -> Result<i64, WardenError> {
        let now_ms = Utc::now().timestamp_millis();
        let counters = self.counters.lock();
        Ok(match counters.get(key) {
            Some(&(value, expires_at)) if expires_at > now_ms => value,
            _ => 0,
        })
    }

    async fn remove(&self, key: &str) -> Result<(), WardenError> {
        self.windows.lock().remove(key);
        self.counters.lock().remove(key);
        Ok(())
    }
}

// ============================================================
// MemoryTaskStore
// ============================================================

/// Book-keeping state behind one mutex, so claims are exclusive.
#[derive(Default)]
struct TaskState {
    /// All task envelopes by id.
    tasks: HashMap<Uuid, Task>,
    /// Ids claimable right now.
    ready: Vec<Uuid>,
    /// Ids waiting for their scheduled time.
    delayed: Vec<Uuid>,
}

/// In-process task store with the same claim semantics as the durable path.
#[derive(Default)]
pub struct MemoryTaskStore {
    state: Mutex<TaskState>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn insert(&self, task: Task) -> Result<(), WardenError> {
        let mut state = self.state.lock();
        let id = task.id;
        let due = task.scheduled_at <= Utc::now();
        state.tasks.insert(id, task);
        if due {
            state.ready.push(id);
        } else {
            state.delayed.push(id);
        }
        Ok(())
    }

    async fn claim_due(&self, now: DateTime<Utc>) -> Result<Option<Task>, WardenError> {
        let mut state = self.state.lock();
        let state = &mut *state;

        // Promote due delayed tasks into the ready queue first.
        let mut still_delayed = Vec::new();
        for id in std::mem::take(&mut state.delayed) {
            match state.tasks.get(&id) {
                Some(task) if task.scheduled_at <= now => state.ready.push(id),
                Some(_) => still_delayed.push(id),
                None => {}
            }
        }
        state.delayed = still_delayed;

        // Pick the highest-priority ready task, earliest scheduled first.
        let best = state
            .ready
            .iter()
            .enumerate()
            .filter_map(|(idx, id)| state.tasks.get(id).map(|t| (idx, t)))
            .filter(|(_, t)| t.status == TaskStatus::Pending)
            .max_by(|(_, a), (_, b)| {
                a.priority
                    .cmp(&b.priority)
                    .then(b.scheduled_at.cmp(&a.scheduled_at))
            })
            .map(|(idx, _)| idx);

        let Some(idx) = best else {
            // Drop ids whose tasks are no longer pending (cancelled, etc.).
            let tasks = std::mem::take(&mut state.tasks);
            state
                .ready
                .retain(|id| matches!(tasks.get(id), Some(t) if t.status == TaskStatus::Pending));
            state.tasks = tasks;
            return Ok(None);
        };

        let id = state.ready.swap_remove(idx);
        let task = state
            .tasks
            .get_mut(&id)
            .ok_or_else(|| WardenError::Internal("ready id without envelope".to_string()))?;
        task.status = TaskStatus::Running;
        task.attempts += 1;
        task.started_at = Some(now);
        Ok(Some(task.clone()))
    }

    async fn complete(&self, id: Uuid, result: serde_json::Value) -> Result<(), WardenError> {
        let mut state = self.state.lock();
        let task = state
            .tasks
            .get_mut(&id)
            .ok_or_else(|| WardenError::Task(format!("unknown task {id}")))?;
        task.status = TaskStatus::Completed;
        task.result = Some(result);
        task.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn fail(&self, id: Uuid, error: &str) -> Result<(), WardenError> {
        let mut state = self.state.lock();
        let task = state
            .tasks
            .get_mut(&id)
            .ok_or_else(|| WardenError::Task(format!("unknown task {id}")))?;
        task.status = TaskStatus::Failed;
        task.error = Some(error.to_string());
        task.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn reschedule(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), WardenError> {
        let mut state = self.state.lock();
        let task = state
            .tasks
            .get_mut(&id)
            .ok_or_else(|| WardenError::Task(format!("unknown task {id}")))?;
        task.status = TaskStatus::Pending;
        task.scheduled_at = at;
        task.error = Some(error.to_string());
        state.delayed.push(id);
        Ok(())
    }

    async fn cancel_pending(&self, id: Uuid) -> Result<bool, WardenError> {
        let mut state = self.state.lock();
        let Some(task) = state.tasks.get_mut(&id) else {
            return Ok(false);
        };
        if task.status != TaskStatus::Pending {
            return Ok(false);
        }
        task.status = TaskStatus::Cancelled;
        task.completed_at = Some(Utc::now());
        state.ready.retain(|&other| other != id);
        state.delayed.retain(|&other| other != id);
        Ok(true)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Task>, WardenError> {
        Ok(self.state.lock().tasks.get(&id).cloned())
    }
}

// ============================================================
// MemoryAuditStore
// ============================================================

/// In-process audit sink. Append-only, like the durable path.
#[derive(Default)]
pub struct MemoryAuditStore {
    records: Mutex<Vec<AuditRecord>>,
    events: Mutex<Vec<SecurityEvent>>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all appended records.
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().clone()
    }

    /// Snapshot of all recorded security events.
    pub fn events(&self) -> Vec<SecurityEvent> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn append(&self, records: Vec<AuditRecord>) -> Result<(), WardenError> {
        self.records.lock().extend(records);
        Ok(())
    }

    async fn append_event(&self, event: SecurityEvent) -> Result<(), WardenError> {
        self.events.lock().push(event);
        Ok(())
    }

    async fn resolve_event(&self, id: Uuid, mitigation: &str) -> Result<bool, WardenError> {
        let mut events = self.events.lock();
        match events.iter_mut().find(|e| e.id == id && !e.resolved) {
            Some(event) => {
                event.resolved = true;
                event.mitigation_action = Some(mitigation.to_string());
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_types::{AuditStatus, SecuritySeverity};

    fn make_task(priority: u8, delay_ms: i64) -> Task {
        Task {
            id: Uuid::new_v4(),
            task_type: "test".to_string(),
            payload: serde_json::Value::Null,
            priority,
            status: TaskStatus::Pending,
            attempts: 0,
            max_attempts: 3,
            scheduled_at: Utc::now() + chrono::Duration::milliseconds(delay_ms),
            started_at: None,
            completed_at: None,
            error: None,
            result: None,
            created_at: Utc::now(),
        }
    }

    // ========================================================================
    // KvStore window semantics
    // ========================================================================

    #[tokio::test]
    async fn test_window_admits_until_cap() {
        let store = MemoryKvStore::new();
        for i in 0..3 {
            let probe = store.window_probe("k", 1_000 + i, 60_000, 3, true).await.unwrap();
            assert!(probe.allowed, "probe {i} should be allowed");
        }
        let probe = store.window_probe("k", 1_010, 60_000, 3, true).await.unwrap();
        assert!(!probe.allowed);
        assert_eq!(probe.count, 3);
    }

    #[tokio::test]
    async fn test_window_frees_after_expiry() {
        let store = MemoryKvStore::new();
        store.window_probe("k", 1_000, 100, 1, true).await.unwrap();
        let denied = store.window_probe("k", 1_050, 100, 1, true).await.unwrap();
        assert!(!denied.allowed);
        // 1_000 is outside the window at t=1_101
        let allowed = store.window_probe("k", 1_101, 100, 1, true).await.unwrap();
        assert!(allowed.allowed);
    }

    #[tokio::test]
    async fn test_read_only_probe_does_not_record() {
        let store = MemoryKvStore::new();
        for _ in 0..5 {
            let probe = store.window_probe("k", 1_000, 60_000, 2, false).await.unwrap();
            assert!(probe.allowed);
            assert_eq!(probe.count, 0);
        }
    }

    #[tokio::test]
    async fn test_purge_expired_bounds_memory() {
        let store = MemoryKvStore::new();
        store.window_probe("a", 1_000, 500, 5, true).await.unwrap();
        store.window_probe("b", 1_000, 500, 5, true).await.unwrap();
        assert_eq!(store.window_key_count(), 2);
        let removed = store.purge_expired(10_000, 500);
        assert_eq!(removed, 2);
        assert_eq!(store.window_key_count(), 0);
    }

    #[tokio::test]
    async fn test_counter_increment_and_read() {
        let store = MemoryKvStore::new();
        assert_eq!(store.get_counter("c").await.unwrap(), 0);
        assert_eq!(store.incr_with_expiry("c", 3, 60_000).await.unwrap(), 3);
        assert_eq!(store.incr_with_expiry("c", 2, 60_000).await.unwrap(), 5);
        assert_eq!(store.get_counter("c").await.unwrap(), 5);
    }

    // ========================================================================
    // TaskStore claim semantics
    // ========================================================================

    #[tokio::test]
    async fn test_claim_prefers_higher_priority() {
        let store = MemoryTaskStore::new();
        let low = make_task(2, 0);
        let high = make_task(9, 0);
        let high_id = high.id;
        store.insert(low).await.unwrap();
        store.insert(high).await.unwrap();

        let claimed = store.claim_due(Utc::now()).await.unwrap().unwrap();
        assert_eq!(claimed.id, high_id);
        assert_eq!(claimed.status, TaskStatus::Running);
        assert_eq!(claimed.attempts, 1);
    }

    #[tokio::test]
    async fn test_delayed_task_not_claimable_until_due() {
        let store = MemoryTaskStore::new();
        let task = make_task(5, 60_000);
        let id = task.id;
        store.insert(task).await.unwrap();

        assert!(store.claim_due(Utc::now()).await.unwrap().is_none());
        let later = Utc::now() + chrono::Duration::milliseconds(61_000);
        let claimed = store.claim_due(later).await.unwrap().unwrap();
        assert_eq!(claimed.id, id);
    }

    #[tokio::test]
    async fn test_cancel_only_while_pending() {
        let store = MemoryTaskStore::new();
        let task = make_task(5, 0);
        let id = task.id;
        store.insert(task).await.unwrap();

        let _claimed = store.claim_due(Utc::now()).await.unwrap().unwrap();
        assert!(!store.cancel_pending(id).await.unwrap());

        let pending = make_task(5, 60_000);
        let pending_id = pending.id;
        store.insert(pending).await.unwrap();
        assert!(store.cancel_pending(pending_id).await.unwrap());
        let task = store.get(pending_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        // Cancelled task is never claimed
        let later = Utc::now() + chrono::Duration::milliseconds(120_000);
        assert!(store.claim_due(later).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reschedule_returns_task_to_pending() {
        let store = MemoryTaskStore::new();
        let task = make_task(5, 0);
        let id = task.id;
        store.insert(task).await.unwrap();

        store.claim_due(Utc::now()).await.unwrap().unwrap();
        let at = Utc::now() + chrono::Duration::milliseconds(2_000);
        store.reschedule(id, at, "boom").await.unwrap();

        let task = store.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.error.as_deref(), Some("boom"));
        assert!(store.claim_due(Utc::now()).await.unwrap().is_none());
    }

    // ========================================================================
    // AuditStore
    // ========================================================================

    #[tokio::test]
    async fn test_audit_append_and_snapshot() {
        let store = MemoryAuditStore::new();
        let record = AuditRecord::new("chat.turn", "conversation", "reply", AuditStatus::Success);
        store.append(vec![record]).await.unwrap();
        assert_eq!(store.records().len(), 1);
    }

    #[tokio::test]
    async fn test_security_event_resolved_exactly_once() {
        let store = MemoryAuditStore::new();
        let event = SecurityEvent::new("threat.blocked", SecuritySeverity::High, "blocked");
        let id = event.id;
        store.append_event(event).await.unwrap();

        assert!(store.resolve_event(id, "subject throttled").await.unwrap());
        assert!(!store.resolve_event(id, "again").await.unwrap());
        let events = store.events();
        assert!(events[0].resolved);
        assert_eq!(events[0].mitigation_action.as_deref(), Some("subject throttled"));
    }
}
