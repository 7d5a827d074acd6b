/// Shared types, traits, and errors for the Warden request-governance pipeline.
///
/// This crate is the foundation that all other Warden crates depend on.
/// It contains:
/// - **Trait contracts** (`traits`) that define the seams to every external
///   collaborator (LLM, tools, stores, moderation, alert channels)
/// - **Shared data types** (`screening`, `admission`, `execution`, `tasks`,
///   `audit`) used across all subsystems
/// - **Error types** (`errors`) for unified error handling
/// - **Config types** (`config`) for configuration file parsing
pub mod admission;
pub mod audit;
pub mod config;
pub mod errors;
pub mod execution;
pub mod screening;
pub mod tasks;
pub mod traits;

// Re-export commonly used types at the crate root for convenience.
pub use admission::*;
pub use audit::*;
pub use errors::{AdmissionDenied, WardenError};
pub use execution::*;
pub use screening::*;
pub use tasks::*;
pub use traits::*;
