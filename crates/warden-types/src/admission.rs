/// Types for the admission controller (sliding-window rate limiter).
use serde::{Deserialize, Serialize};

/// The dimension a rate limit is keyed on.
///
/// Each class is checked independently against its own window and cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitClass {
    /// Per end-user subject.
    Subject,
    /// Per conversation.
    Conversation,
    /// Per source network address.
    SourceAddress,
    /// Per agent identity.
    Agent,
    /// Per tool name.
    Tool,
}

impl LimitClass {
    /// Stable key prefix used to build store keys.
    pub fn key_prefix(self) -> &'static str {
        match self {
            Self::Subject => "subject",
            Self::Conversation => "conversation",
            Self::SourceAddress => "source",
            Self::Agent => "agent",
            Self::Tool => "tool",
        }
    }
}

impl std::fmt::Display for LimitClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key_prefix())
    }
}

/// Subject tier, selecting which cap applies within a limit class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SubjectTier {
    #[default]
    Standard,
    Privileged,
}

/// Window and caps for one limit class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitRule {
    /// Sliding window length in milliseconds.
    pub window_ms: i64,
    /// Cap for standard-tier subjects.
    pub cap: u32,
    /// Cap for privileged-tier subjects.
    pub privileged_cap: u32,
}

impl LimitRule {
    /// The cap that applies to the given tier.
    pub fn cap_for(&self, tier: SubjectTier) -> u32 {
        match tier {
            SubjectTier::Standard => self.cap,
            SubjectTier::Privileged => self.privileged_cap,
        }
    }
}

/// Outcome of one admission check, derived from the windowed counter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitDecision {
    /// Whether the request is admitted.
    pub allowed: bool,
    /// Slots remaining in the current window.
    pub remaining: u32,
    /// Milliseconds until the oldest window entry expires.
    pub reset_in_ms: i64,
    /// The cap this decision was made against.
    pub limit: u32,
}

/// State of a windowed counter after one atomic probe of the store.
///
/// Returned by [`crate::traits::KvStore::window_probe`]; the limiter turns it
/// into a [`RateLimitDecision`].
#[derive(Debug, Clone, Copy)]
pub struct WindowProbe {
    /// Whether the probe admitted the event (and recorded it, when asked to).
    pub allowed: bool,
    /// Entries in the window after the probe.
    pub count: u32,
    /// Timestamp (epoch ms) of the oldest entry, when the window is non-empty.
    pub oldest_ms: Option<i64>,
}
