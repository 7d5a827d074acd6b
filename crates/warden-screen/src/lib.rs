/// Screening layers for the Warden pipeline.
///
/// Two guards with parallel structure and distinct taxonomies:
/// - **Threat screen** (`threat`): prompt-attack detection on inbound text —
///   pattern rules, heuristics, risk scoring, per-subject history, sanitization.
/// - **Content screen** (`moderation`): content safety on generated output —
///   PII and credential patterns, harmful-content tiers, system-prompt leak
///   detection, and an optional external moderation capability (`external`).
pub mod external;
pub mod moderation;
pub mod threat;

pub use external::HttpModerationProvider;
pub use moderation::{ContentScreen, ContentScreenConfig, ModerateOptions};
pub use threat::{AnalyzeOptions, ThreatScreen, ThreatScreenConfig};
