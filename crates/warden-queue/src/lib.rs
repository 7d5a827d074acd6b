/// Background task queue for the Warden pipeline.
///
/// Durable, prioritized, retryable task execution over a pluggable
/// [`warden_types::traits::TaskStore`]. The scheduler polls for due work and
/// dispatches to registered handlers on a fixed pool of worker slots.
pub mod queue;

pub use queue::{QueueConfig, TaskQueue};
