/// Types produced by the input threat screen and the output content screen.
///
/// The two screens share structure but keep distinct taxonomies: threat
/// findings describe prompt-attack detection on inbound text, moderation
/// findings describe content safety on generated output.
use serde::{Deserialize, Serialize};

// ============================================================
// Threat Screen Types
// ============================================================

/// Category of a detected prompt-attack pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ThreatCategory {
    /// Attempts to override or cancel governing instructions.
    InstructionOverride,
    /// Role-play and persona-switch attacks.
    RoleManipulation,
    /// Known jailbreak phrasings (DAN, developer mode, etc.).
    Jailbreak,
    /// Attempts to extract the system prompt or hidden context.
    ContextLeak,
    /// Delimiter and boundary-token manipulation.
    DelimiterAttack,
    /// Encoded or obfuscated payloads (base64 blocks, direction overrides).
    EncodingAttack,
    /// Instructions embedded in content addressed to "the AI".
    IndirectInjection,
    /// Input exceeds the size ceiling; analysis short-circuits.
    Oversize,
}

impl std::fmt::Display for ThreatCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::InstructionOverride => "instruction-override",
            Self::RoleManipulation => "role-manipulation",
            Self::Jailbreak => "jailbreak",
            Self::ContextLeak => "context-leak",
            Self::DelimiterAttack => "delimiter-attack",
            Self::EncodingAttack => "encoding-attack",
            Self::IndirectInjection => "indirect-injection",
            Self::Oversize => "oversize",
        };
        f.write_str(s)
    }
}

/// Severity of a threat finding. Determines its weight in the risk score.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum ThreatSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ThreatSeverity {
    /// Weight contributed to the risk score, before the confidence multiplier.
    pub fn weight(self) -> f64 {
        match self {
            Self::Low => 0.05,
            Self::Medium => 0.15,
            Self::High => 0.3,
            Self::Critical => 0.5,
        }
    }
}

/// A single match produced by one analysis call. Immutable; never persisted
/// individually, only aggregated into an audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatFinding {
    /// Attack category this finding belongs to.
    pub category: ThreatCategory,
    /// Fixed severity of the matched rule or heuristic.
    pub severity: ThreatSeverity,
    /// Snippet of the matched text (truncated for audit friendliness).
    pub matched: String,
    /// Byte span of the match in the analyzed text, when positional.
    pub span: Option<(usize, usize)>,
    /// Confidence in the match, 0.0 to 1.0.
    pub confidence: f64,
}

/// Result of a full threat analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatVerdict {
    /// True when no findings were produced.
    pub safe: bool,
    /// Capped weighted sum over findings plus the per-subject history term.
    pub risk_score: f64,
    /// All findings, in rule-table order.
    pub findings: Vec<ThreatFinding>,
    /// Redacted copy of the input, present only when not blocked.
    pub sanitized_text: Option<String>,
    /// True iff `risk_score` reached the decision threshold.
    pub blocked: bool,
    /// Human-readable reason, present when blocked.
    pub reason: Option<String>,
}

/// Result of the low-latency critical-rules-only pre-filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuickVerdict {
    /// False when a critical-severity rule matched.
    pub safe: bool,
    /// Category of the first critical match, when unsafe.
    pub category: Option<ThreatCategory>,
}

// ============================================================
// Content Screen Types
// ============================================================

/// Severity of a moderation verdict. Distinct scale from threat severity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum ModerationSeverity {
    None,
    Low,
    Medium,
    High,
}

/// Action the caller should take on moderated content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModerationAction {
    /// Content is clean; deliver as-is.
    Allow,
    /// Suspicious but deliverable; flag in the audit log.
    Warn,
    /// Deliver the sanitized copy instead of the original.
    Sanitize,
    /// Do not deliver.
    Block,
}

/// Category of a moderation finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModerationCategory {
    /// Structured identifiers, contact info, financial numbers, credentials.
    Pii,
    /// Harmful-content keyword match.
    HarmfulContent,
    /// System prompt leakage detected in generated output.
    PromptLeak,
    /// Flag contributed by the external moderation capability.
    External,
}

/// A single moderation finding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModerationFinding {
    /// What kind of content triggered this finding.
    pub category: ModerationCategory,
    /// Name of the matched pattern or keyword tier.
    pub detail: String,
    /// Severity of this finding.
    pub severity: ModerationSeverity,
    /// Byte span of the match, when sanitize-eligible.
    pub span: Option<(usize, usize)>,
    /// Replacement token to substitute for the span, when sanitize-eligible.
    pub replacement: Option<String>,
}

/// Result of a content moderation pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModerationVerdict {
    /// True when no findings were produced.
    pub safe: bool,
    /// True when at least one finding or external flag was produced.
    pub flagged: bool,
    /// Aggregated severity across local and external findings.
    pub severity: ModerationSeverity,
    /// Action policy decision derived from the severity and categories.
    pub action: ModerationAction,
    /// Redacted copy, present when sanitization was requested and applicable.
    pub sanitized_text: Option<String>,
    /// All findings, local first, then external.
    pub findings: Vec<ModerationFinding>,
}

/// A category flag returned by the external moderation capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalFlag {
    /// Provider-defined category name.
    pub category: String,
    /// Provider score, 0.0 to 1.0.
    pub score: f64,
}
