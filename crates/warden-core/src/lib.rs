/// Warden's execution engine and the governed chat pipeline.
///
/// - **Engine** (`engine`): one Plan → Execute → Solve turn against an LLM
///   provider and a tool executor.
/// - **Pipeline** (`pipeline`): the full governed path — admission control,
///   threat screening, the engine turn, output moderation, and audit.
pub mod engine;
pub mod pipeline;

pub use engine::{EngineConfig, ExecutionEngine, DELEGATE_TOOL};
pub use pipeline::{ChatPipeline, TurnRequest};
