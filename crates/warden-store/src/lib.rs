/// Storage adapters for the Warden pipeline.
///
/// Three backends behind the trait seams defined in `warden-types`:
/// - **memory**: in-process implementations of `KvStore`, `TaskStore`, and
///   `AuditStore`. The degraded-mode fallback for the admission controller
///   and the default backend for tests and store-less deployments.
/// - **redis**: distributed `KvStore` with an atomic Lua sliding-window probe.
/// - **postgres**: durable `TaskStore` (skip-locked claims) and `AuditStore`.
pub mod memory;
pub mod postgres;
pub mod redis;

pub use memory::{MemoryAuditStore, MemoryKvStore, MemoryTaskStore};
pub use postgres::{PgAuditStore, PgTaskStore};
pub use redis::RedisKvStore;
