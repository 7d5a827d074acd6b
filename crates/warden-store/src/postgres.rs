//! PostgreSQL-backed durable stores.
//!
//! - `PgTaskStore`: task envelopes with exclusive claim dispatch. The claim
//!   uses `FOR UPDATE SKIP LOCKED` so two workers never claim the same row
//!   when the fast in-process queue path is unavailable.
//! - `PgAuditStore`: append-only audit records and security events. Records
//!   are never updated or deleted; security events are updated exactly once,
//!   on resolution.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::info;
use uuid::Uuid;

use warden_types::errors::WardenError;
use warden_types::tasks::{Task, TaskStatus};
use warden_types::traits::{AuditStore, TaskStore};
use warden_types::{AuditRecord, SecurityEvent};

// ============================================================
// SQL Migrations (run in constructor, not via sqlx::migrate!)
// ============================================================

const MIGRATION_TASKS_TABLE: &str = "\
CREATE TABLE IF NOT EXISTS warden_tasks (\
    id UUID PRIMARY KEY, \
    task_type TEXT NOT NULL, \
    payload JSONB NOT NULL DEFAULT 'null'::jsonb, \
    priority INT NOT NULL DEFAULT 5, \
    status TEXT NOT NULL DEFAULT 'pending', \
    attempts INT NOT NULL DEFAULT 0, \
    max_attempts INT NOT NULL DEFAULT 3, \
    scheduled_at TIMESTAMPTZ NOT NULL, \
    started_at TIMESTAMPTZ, \
    completed_at TIMESTAMPTZ, \
    error TEXT, \
    result JSONB, \
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()\
)";

const MIGRATION_TASKS_CLAIM_INDEX: &str = "\
CREATE INDEX IF NOT EXISTS idx_warden_tasks_claim \
ON warden_tasks (status, scheduled_at, priority)";

const MIGRATION_AUDIT_TABLE: &str = "\
CREATE TABLE IF NOT EXISTS warden_audit_records (\
    id BIGSERIAL PRIMARY KEY, \
    action TEXT NOT NULL, \
    resource TEXT NOT NULL, \
    operation TEXT NOT NULL, \
    status TEXT NOT NULL, \
    subject TEXT, \
    session_id TEXT, \
    trace_id TEXT, \
    details JSONB NOT NULL DEFAULT 'null'::jsonb, \
    duration_ms BIGINT, \
    created_at TIMESTAMPTZ NOT NULL\
)";

const MIGRATION_AUDIT_CREATED_INDEX: &str = "\
CREATE INDEX IF NOT EXISTS idx_warden_audit_created_at \
ON warden_audit_records (created_at)";

const MIGRATION_EVENTS_TABLE: &str = "\
CREATE TABLE IF NOT EXISTS warden_security_events (\
    id UUID PRIMARY KEY, \
    event_type TEXT NOT NULL, \
    severity TEXT NOT NULL, \
    description TEXT NOT NULL, \
    payload JSONB NOT NULL DEFAULT 'null'::jsonb, \
    mitigation_action TEXT, \
    resolved BOOLEAN NOT NULL DEFAULT FALSE, \
    created_at TIMESTAMPTZ NOT NULL\
)";

// ============================================================
// PgTaskStore
// ============================================================

/// Durable task store with row-level exclusive claim semantics.
pub struct PgTaskStore {
    pool: PgPool,
}

impl PgTaskStore {
    /// Create a task store, connecting to PostgreSQL at the given URL.
    ///
    /// Runs schema migrations on construction.
    pub async fn new(database_url: &str) -> Result<Self, WardenError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| WardenError::Store(format!("connection failed: {e}")))?;
        Self::from_pool(pool).await
    }

    /// Create a task store from an existing connection pool.
    pub async fn from_pool(pool: PgPool) -> Result<Self, WardenError> {
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), WardenError> {
        for sql in [MIGRATION_TASKS_TABLE, MIGRATION_TASKS_CLAIM_INDEX] {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| WardenError::Store(format!("migration failed: {e}")))?;
        }
        info!("task store migrations applied");
        Ok(())
    }
}

const TASK_COLUMNS: &str = "id, task_type, payload, priority, status, attempts, max_attempts, \
     scheduled_at, started_at, completed_at, error, result, created_at";

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn insert(&self, task: Task) -> Result<(), WardenError> {
        sqlx::query(
            "INSERT INTO warden_tasks \
             (id, task_type, payload, priority, status, attempts, max_attempts, \
              scheduled_at, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(task.id)
        .bind(&task.task_type)
        .bind(&task.payload)
        .bind(task.priority as i32)
        .bind(task.status.as_str())
        .bind(task.attempts as i32)
        .bind(task.max_attempts as i32)
        .bind(task.scheduled_at)
        .bind(task.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| WardenError::Store(format!("task insert failed: {e}")))?;
        Ok(())
    }

    async fn claim_due(&self, now: DateTime<Utc>) -> Result<Option<Task>, WardenError> {
        // Skip-locked subquery: concurrent claimers see different rows.
        let sql = format!(
            "UPDATE warden_tasks \
             SET status = 'running', attempts = attempts + 1, started_at = $1 \
             WHERE id = (\
                 SELECT id FROM warden_tasks \
                 WHERE status = 'pending' AND scheduled_at <= $1 \
                 ORDER BY priority DESC, scheduled_at ASC \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED\
             ) \
             RETURNING {TASK_COLUMNS}"
        );

        let row = sqlx::query(&sql)
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| WardenError::Store(format!("claim failed: {e}")))?;

        row.map(row_to_task).transpose()
    }

    async fn complete(&self, id: Uuid, result: serde_json::Value) -> Result<(), WardenError> {
        sqlx::query(
            "UPDATE warden_tasks \
             SET status = 'completed', result = $1, completed_at = NOW() \
             WHERE id = $2",
        )
        .bind(&result)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| WardenError::Store(format!("complete failed: {e}")))?;
        Ok(())
    }

    async fn fail(&self, id: Uuid, error: &str) -> Result<(), WardenError> {
        sqlx::query(
            "UPDATE warden_tasks \
             SET status = 'failed', error = $1, completed_at = NOW() \
             WHERE id = $2",
        )
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| WardenError::Store(format!("fail failed: {e}")))?;
        Ok(())
    }

    async fn reschedule(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), WardenError> {
        sqlx::query(
            "UPDATE warden_tasks \
             SET status = 'pending', scheduled_at = $1, error = $2 \
             WHERE id = $3",
        )
        .bind(at)
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| WardenError::Store(format!("reschedule failed: {e}")))?;
        Ok(())
    }

    async fn cancel_pending(&self, id: Uuid) -> Result<bool, WardenError> {
        let result = sqlx::query(
            "UPDATE warden_tasks \
             SET status = 'cancelled', completed_at = NOW() \
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| WardenError::Store(format!("cancel failed: {e}")))?;
        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Task>, WardenError> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM warden_tasks WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| WardenError::Store(format!("get failed: {e}")))?;
        row.map(row_to_task).transpose()
    }
}

// ============================================================
// PgAuditStore
// ============================================================

/// Durable append-only audit store.
pub struct PgAuditStore {
    pool: PgPool,
}

impl PgAuditStore {
    /// Create an audit store, connecting to PostgreSQL at the given URL.
    pub async fn new(database_url: &str) -> Result<Self, WardenError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| WardenError::Store(format!("connection failed: {e}")))?;
        Self::from_pool(pool).await
    }

    /// Create an audit store from an existing connection pool.
    pub async fn from_pool(pool: PgPool) -> Result<Self, WardenError> {
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), WardenError> {
        for sql in [
            MIGRATION_AUDIT_TABLE,
            MIGRATION_AUDIT_CREATED_INDEX,
            MIGRATION_EVENTS_TABLE,
        ] {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| WardenError::Store(format!("migration failed: {e}")))?;
        }
        info!("audit store migrations applied");
        Ok(())
    }
}

#[async_trait]
impl AuditStore for PgAuditStore {
    async fn append(&self, records: Vec<AuditRecord>) -> Result<(), WardenError> {
        // All-or-nothing: the caller requeues the whole batch on error.
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| WardenError::Store(format!("begin failed: {e}")))?;

        for record in &records {
            sqlx::query(
                "INSERT INTO warden_audit_records \
                 (action, resource, operation, status, subject, session_id, trace_id, \
                  details, duration_ms, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            )
            .bind(&record.action)
            .bind(&record.resource)
            .bind(&record.operation)
            .bind(record.status.as_str())
            .bind(&record.subject)
            .bind(&record.session_id)
            .bind(&record.trace_id)
            .bind(&record.details)
            .bind(record.duration_ms.map(|d| d as i64))
            .bind(record.created_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| WardenError::Store(format!("audit insert failed: {e}")))?;
        }

        tx.commit()
            .await
            .map_err(|e| WardenError::Store(format!("commit failed: {e}")))?;
        Ok(())
    }

    async fn append_event(&self, event: SecurityEvent) -> Result<(), WardenError> {
        sqlx::query(
            "INSERT INTO warden_security_events \
             (id, event_type, severity, description, payload, mitigation_action, \
              resolved, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(event.id)
        .bind(&event.event_type)
        .bind(event.severity.as_str())
        .bind(&event.description)
        .bind(&event.payload)
        .bind(&event.mitigation_action)
        .bind(event.resolved)
        .bind(event.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| WardenError::Store(format!("event insert failed: {e}")))?;
        Ok(())
    }

    async fn resolve_event(&self, id: Uuid, mitigation: &str) -> Result<bool, WardenError> {
        let result = sqlx::query(
            "UPDATE warden_security_events \
             SET resolved = TRUE, mitigation_action = $1 \
             WHERE id = $2 AND resolved = FALSE",
        )
        .bind(mitigation)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| WardenError::Store(format!("resolve failed: {e}")))?;
        Ok(result.rows_affected() > 0)
    }
}

// ============================================================
// Helpers
// ============================================================

/// Convert a PostgreSQL row into a [`Task`].
fn row_to_task(row: PgRow) -> Result<Task, WardenError> {
    let map_err = |e: sqlx::Error| WardenError::Store(e.to_string());

    let status_str: String = row.try_get("status").map_err(map_err)?;
    let status = TaskStatus::parse(&status_str)
        .ok_or_else(|| WardenError::Store(format!("unknown task status: {status_str}")))?;

    Ok(Task {
        id: row.try_get("id").map_err(map_err)?,
        task_type: row.try_get("task_type").map_err(map_err)?,
        payload: row.try_get("payload").map_err(map_err)?,
        priority: row.try_get::<i32, _>("priority").map_err(map_err)?.clamp(0, 10) as u8,
        status,
        attempts: row.try_get::<i32, _>("attempts").map_err(map_err)?.max(0) as u32,
        max_attempts: row.try_get::<i32, _>("max_attempts").map_err(map_err)?.max(0) as u32,
        scheduled_at: row.try_get("scheduled_at").map_err(map_err)?,
        started_at: row.try_get("started_at").map_err(map_err)?,
        completed_at: row.try_get("completed_at").map_err(map_err)?,
        error: row.try_get("error").map_err(map_err)?,
        result: row.try_get("result").map_err(map_err)?,
        created_at: row.try_get("created_at").map_err(map_err)?,
    })
}
