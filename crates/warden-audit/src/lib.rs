/// Audit trail and alerting for the Warden pipeline.
///
/// Two write paths with different guarantees:
/// - **Audit records** (`trail`) are buffered and flushed in batches; losing
///   a batch across a crash is acceptable, blocking the request path is not.
/// - **Security events** (`trail`) are written synchronously and, at high
///   severities, fanned out to alert channels (`alerts`).
pub mod alerts;
pub mod trail;

pub use alerts::{AlertConfig, AlertManager};
pub use trail::{AuditConfig, AuditTrail};
