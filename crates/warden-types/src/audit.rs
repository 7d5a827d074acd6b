/// Types for the append-only audit trail and security alerting.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Outcome recorded on an audit record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    Success,
    Failure,
    Denied,
}

impl AuditStatus {
    /// Stable string form used in the durable store.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Denied => "denied",
        }
    }
}

/// One entry in the append-only audit trail. Never mutated after write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Action identifier (e.g., "chat.turn", "security.block").
    pub action: String,
    /// Resource the action touched.
    pub resource: String,
    /// Operation performed on the resource.
    pub operation: String,
    /// Outcome of the action.
    pub status: AuditStatus,
    /// Subject on whose behalf the action ran.
    pub subject: Option<String>,
    /// Session the action belongs to.
    pub session_id: Option<String>,
    /// Trace id for correlating with request logs.
    pub trace_id: Option<String>,
    /// Free-form structured details.
    pub details: serde_json::Value,
    /// Wall-clock duration, when the action is timed.
    pub duration_ms: Option<u64>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
}

impl AuditRecord {
    /// Convenience constructor stamping `created_at` with the current time.
    pub fn new(action: &str, resource: &str, operation: &str, status: AuditStatus) -> Self {
        Self {
            action: action.to_string(),
            resource: resource.to_string(),
            operation: operation.to_string(),
            status,
            subject: None,
            session_id: None,
            trace_id: None,
            details: serde_json::Value::Null,
            duration_ms: None,
            created_at: Utc::now(),
        }
    }
}

/// Severity of a security event, driving the alert fan-out.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum SecuritySeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl SecuritySeverity {
    /// Stable string form used in the durable store.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// A security event written synchronously on the critical path.
///
/// Mutated exactly once, when resolved by an operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    /// Unique event identifier.
    pub id: Uuid,
    /// Event type (e.g., "threat.blocked", "moderation.blocked").
    pub event_type: String,
    /// Severity, driving the alert fan-out.
    pub severity: SecuritySeverity,
    /// Human-readable description.
    pub description: String,
    /// Structured payload (aggregated findings, scores).
    pub payload: serde_json::Value,
    /// Mitigation recorded when the event is resolved.
    pub mitigation_action: Option<String>,
    /// Whether an operator has resolved the event.
    pub resolved: bool,
    /// When the event was recorded.
    pub created_at: DateTime<Utc>,
}

impl SecurityEvent {
    /// Convenience constructor for an unresolved event with a fresh id.
    pub fn new(event_type: &str, severity: SecuritySeverity, description: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            severity,
            description: description.to_string(),
            payload: serde_json::Value::Null,
            mitigation_action: None,
            resolved: false,
            created_at: Utc::now(),
        }
    }
}

/// Payload pushed to alert channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    /// Component that raised the alert (dedup key part).
    pub source: String,
    /// Short alert title (dedup key part).
    pub title: String,
    /// Alert body.
    pub body: String,
    /// Severity of the underlying security event.
    pub severity: SecuritySeverity,
    /// How many deduplicated occurrences this alert represents.
    pub count: u32,
    /// When the alert was first raised.
    pub created_at: DateTime<Utc>,
}

impl Alert {
    /// Dedup key: alerts with the same source and title aggregate together.
    pub fn dedup_key(&self) -> String {
        format!("{}:{}", self.source, self.title)
    }
}
