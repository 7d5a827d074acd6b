//! Output content screen.
//!
//! Scans generated text before it leaves the system:
//! - Sensitive-pattern table (PII, credentials, financial numbers) with
//!   replacement tokens for sanitization
//! - Harmful-content keyword tiers (high/medium/low)
//! - System-prompt leak detection for generated output
//! - Optional external moderation capability; absence contributes nothing
//!
//! Distinct taxonomy from the threat screen: this is content safety, not
//! prompt-attack detection.

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tokio::time::timeout;
use tracing::{debug, warn};

use warden_types::config::ModerationSettings;
use warden_types::errors::WardenError;
use warden_types::traits::ModerationProvider;
use warden_types::{
    ExternalFlag, ModerationAction, ModerationCategory, ModerationFinding, ModerationSeverity,
    ModerationVerdict,
};

/// Budget for one external moderation round trip.
const EXTERNAL_TIMEOUT: Duration = Duration::from_millis(800);

/// Configuration for the content screen.
#[derive(Debug, Clone)]
pub struct ContentScreenConfig {
    /// External flag score above which severity escalates to high.
    pub external_score_threshold: f64,
    /// Minimum system-prompt segment length checked for leakage.
    pub min_leak_segment_chars: usize,
}

impl Default for ContentScreenConfig {
    fn default() -> Self {
        Self {
            external_score_threshold: 0.8,
            min_leak_segment_chars: 24,
        }
    }
}

impl ContentScreenConfig {
    /// Build from the config-file section.
    pub fn from_settings(settings: &ModerationSettings) -> Self {
        Self {
            external_score_threshold: settings.external_score_threshold,
            min_leak_segment_chars: settings.min_leak_segment_chars,
        }
    }
}

/// Options for one moderation call.
#[derive(Debug, Clone, Copy)]
pub struct ModerateOptions {
    /// Consult the external moderation capability, when configured.
    pub use_external: bool,
    /// Produce a sanitized copy when findings permit it.
    pub sanitize: bool,
}

impl Default for ModerateOptions {
    fn default() -> Self {
        Self {
            use_external: true,
            sanitize: true,
        }
    }
}

/// A compiled sensitive-content pattern with its replacement token.
struct SensitivePattern {
    name: &'static str,
    severity: ModerationSeverity,
    replacement: &'static str,
    regex: Regex,
}

/// A harmful-content keyword tier.
struct HarmfulTier {
    severity: ModerationSeverity,
    regex: Regex,
}

/// The output content screen.
pub struct ContentScreen {
    config: ContentScreenConfig,
    patterns: Vec<SensitivePattern>,
    harmful: Vec<HarmfulTier>,
    leak_phrases: Regex,
    external: Option<Arc<dyn ModerationProvider>>,
}

impl ContentScreen {
    /// Create a content screen with no external provider attached.
    pub fn new(config: ContentScreenConfig) -> Self {
        Self {
            config,
            patterns: Self::compile_patterns(),
            harmful: Self::compile_harmful_tiers(),
            leak_phrases: Regex::new(
                r"(?i)(my\s+(system\s+)?prompt\s+(is|says|reads)|my\s+instructions\s+(are|say)|i\s+was\s+(told|instructed)\s+to\s+(never|always)|here\s+(is|are)\s+my\s+(system\s+prompt|instructions))",
            )
            .expect("leak phrase regex"),
            external: None,
        }
    }

    /// Attach an external moderation capability.
    pub fn with_external(mut self, provider: Arc<dyn ModerationProvider>) -> Self {
        self.external = Some(provider);
        self
    }

    /// Compile the sensitive-pattern table.
    fn compile_patterns() -> Vec<SensitivePattern> {
        let pattern = |name, severity, replacement, re: &str| SensitivePattern {
            name,
            severity,
            replacement,
            regex: Regex::new(re).expect(name),
        };

        vec![
            pattern(
                "email_address",
                ModerationSeverity::Medium,
                "[EMAIL]",
                r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}",
            ),
            pattern(
                "phone_number",
                ModerationSeverity::Medium,
                "[PHONE]",
                r"\+?\d{1,2}[\s.-]?\(?\d{3}\)?[\s.-]?\d{3}[\s.-]?\d{4}\b",
            ),
            pattern(
                "ssn",
                ModerationSeverity::High,
                "[SSN]",
                r"\b\d{3}-\d{2}-\d{4}\b",
            ),
            pattern(
                "card_number",
                ModerationSeverity::High,
                "[CARD]",
                r"\b\d{4}[ -]?\d{4}[ -]?\d{4}[ -]?\d{4}\b",
            ),
            pattern(
                "api_key",
                ModerationSeverity::High,
                "[API_KEY]",
                r"\b(sk-[A-Za-z0-9]{16,}|AKIA[0-9A-Z]{16}|ghp_[A-Za-z0-9]{36})\b",
            ),
            pattern(
                "credential_in_url",
                ModerationSeverity::High,
                "://[CREDENTIAL]@",
                r"://[^/\s:@]+:[^@\s]+@",
            ),
        ]
    }

    /// Compile the harmful-content keyword tiers.
    ///
    /// These carry no replacement: harmful content is blocked or warned about,
    /// never rewritten.
    fn compile_harmful_tiers() -> Vec<HarmfulTier> {
        let tier = |severity, re: &str| HarmfulTier {
            severity,
            regex: Regex::new(re).expect("harmful tier regex"),
        };

        vec![
            tier(
                ModerationSeverity::High,
                r"(?i)(how\s+to\s+(build|make|assemble)\s+(a\s+)?(bomb|weapon|explosive)|synthesi[sz]e\s+(a\s+)?(nerve\s+agent|toxin)|instructions\s+for\s+(poisoning|harming))",
            ),
            tier(
                ModerationSeverity::Medium,
                r"(?i)(how\s+to\s+(hack\s+into|break\s+into)|steal\s+(an?\s+)?identity|bypass\s+(the\s+)?(security|authentication))",
            ),
            tier(
                ModerationSeverity::Low,
                r"(?i)\b(violent\s+retaliation|revenge\s+plan)\b",
            ),
        ]
    }

    /// Moderate arbitrary text.
    pub async fn moderate(
        &self,
        text: &str,
        opts: &ModerateOptions,
    ) -> Result<ModerationVerdict, WardenError> {
        let findings = self.scan_local(text);

        let external_flags = if opts.use_external {
            self.classify_external(text).await
        } else {
            Vec::new()
        };

        self.build_verdict(text, findings, external_flags, opts)
    }

    /// Moderate generated output, additionally checking for system-prompt
    /// leakage. A leak force-escalates the verdict to Block.
    pub async fn moderate_output(
        &self,
        text: &str,
        system_prompt: Option<&str>,
    ) -> Result<ModerationVerdict, WardenError> {
        let opts = ModerateOptions::default();
        let mut findings = self.scan_local(text);
        findings.extend(self.scan_prompt_leak(text, system_prompt));

        let external_flags = self.classify_external(text).await;
        let mut verdict = self.build_verdict(text, findings, external_flags, &opts)?;

        if verdict
            .findings
            .iter()
            .any(|f| f.category == ModerationCategory::PromptLeak)
        {
            verdict.severity = ModerationSeverity::High;
            verdict.action = ModerationAction::Block;
            warn!("system prompt leakage detected in output, blocking");
        }

        Ok(verdict)
    }

    /// Run the sensitive-pattern table and the harmful-content tiers.
    fn scan_local(&self, text: &str) -> Vec<ModerationFinding> {
        let mut findings = Vec::new();

        for pattern in &self.patterns {
            for m in pattern.regex.find_iter(text) {
                findings.push(ModerationFinding {
                    category: ModerationCategory::Pii,
                    detail: pattern.name.to_string(),
                    severity: pattern.severity,
                    span: Some((m.start(), m.end())),
                    replacement: Some(pattern.replacement.to_string()),
                });
            }
        }

        for tier in &self.harmful {
            if let Some(m) = tier.regex.find(text) {
                findings.push(ModerationFinding {
                    category: ModerationCategory::HarmfulContent,
                    detail: format!("harmful_{}", severity_label(tier.severity)),
                    severity: tier.severity,
                    span: Some((m.start(), m.end())),
                    replacement: None,
                });
            }
        }

        findings
    }

    /// Check output against leak phrases and verbatim system-prompt segments.
    fn scan_prompt_leak(
        &self,
        text: &str,
        system_prompt: Option<&str>,
    ) -> Vec<ModerationFinding> {
        let mut findings = Vec::new();

        if let Some(m) = self.leak_phrases.find(text) {
            findings.push(ModerationFinding {
                category: ModerationCategory::PromptLeak,
                detail: "leak_phrase".to_string(),
                severity: ModerationSeverity::High,
                span: Some((m.start(), m.end())),
                replacement: None,
            });
        }

        if let Some(prompt) = system_prompt {
            let haystack = text.to_lowercase();
            for segment in prompt.split(['\n', '.']) {
                let segment = segment.trim();
                if segment.chars().count() < self.config.min_leak_segment_chars {
                    continue;
                }
                if haystack.contains(&segment.to_lowercase()) {
                    findings.push(ModerationFinding {
                        category: ModerationCategory::PromptLeak,
                        detail: "verbatim_segment".to_string(),
                        severity: ModerationSeverity::High,
                        // Informational only; never used for substitution.
                        span: None,
                        replacement: None,
                    });
                    break;
                }
            }
        }

        findings
    }

    /// Call the external capability; absence or failure contributes nothing.
    async fn classify_external(&self, text: &str) -> Vec<ExternalFlag> {
        let Some(provider) = &self.external else {
            return Vec::new();
        };
        match timeout(EXTERNAL_TIMEOUT, provider.classify(text)).await {
            Ok(Ok(flags)) => flags,
            Ok(Err(e)) => {
                warn!(error = %e, "external moderation unavailable, continuing without it");
                Vec::new()
            }
            Err(_) => {
                warn!("external moderation timed out, continuing without it");
                Vec::new()
            }
        }
    }

    /// Aggregate severity, decide the action, and sanitize if requested.
    fn build_verdict(
        &self,
        text: &str,
        mut findings: Vec<ModerationFinding>,
        external_flags: Vec<ExternalFlag>,
        opts: &ModerateOptions,
    ) -> Result<ModerationVerdict, WardenError> {
        let mut severity = findings
            .iter()
            .map(|f| f.severity)
            .max()
            .unwrap_or(ModerationSeverity::None);

        for flag in &external_flags {
            let flag_severity = if flag.score > self.config.external_score_threshold {
                ModerationSeverity::High
            } else if flag.score > 0.5 {
                ModerationSeverity::Medium
            } else {
                ModerationSeverity::Low
            };
            severity = severity.max(flag_severity);
            findings.push(ModerationFinding {
                category: ModerationCategory::External,
                detail: flag.category.clone(),
                severity: flag_severity,
                span: None,
                replacement: None,
            });
        }

        let harmful_high = findings.iter().any(|f| {
            f.category == ModerationCategory::HarmfulContent
                && f.severity == ModerationSeverity::High
        });
        let sanitizable = findings
            .iter()
            .any(|f| f.span.is_some() && f.replacement.is_some());

        // Sanitize is only a valid action when a substitution can actually be
        // made; a high-severity verdict with nothing substitutable blocks,
        // and a medium one downgrades to a warning.
        let action = match severity {
            ModerationSeverity::High if harmful_high => ModerationAction::Block,
            ModerationSeverity::High | ModerationSeverity::Medium if sanitizable => {
                ModerationAction::Sanitize
            }
            ModerationSeverity::High => ModerationAction::Block,
            ModerationSeverity::Medium | ModerationSeverity::Low => ModerationAction::Warn,
            ModerationSeverity::None => ModerationAction::Allow,
        };

        let sanitized_text = if opts.sanitize && sanitizable {
            Some(self.sanitize(text, &findings))
        } else {
            None
        };

        if action != ModerationAction::Allow {
            debug!(
                ?action,
                findings = findings.len(),
                "content screen flagged output"
            );
        }

        Ok(ModerationVerdict {
            safe: findings.is_empty(),
            flagged: !findings.is_empty(),
            severity,
            action,
            sanitized_text,
            findings,
        })
    }

    /// Substitute sanitize-eligible findings, then run a global redaction pass.
    ///
    /// Substitutions run in descending-position order so earlier replacements
    /// never shift later offsets.
    fn sanitize(&self, text: &str, findings: &[ModerationFinding]) -> String {
        let mut eligible: Vec<(usize, usize, &str)> = findings
            .iter()
            .filter_map(|f| match (f.span, f.replacement.as_deref()) {
                (Some((start, end)), Some(replacement)) => Some((start, end, replacement)),
                _ => None,
            })
            .collect();
        eligible.sort_by(|a, b| b.0.cmp(&a.0));

        let mut result = text.to_string();
        let mut last_start = result.len() + 1;
        for (start, end, replacement) in eligible {
            if end > last_start {
                continue;
            }
            result.replace_range(start..end, replacement);
            last_start = start;
        }

        // Global pass catches occurrences introduced by overlapping spans or
        // repeated sensitive values.
        for pattern in &self.patterns {
            result = pattern
                .regex
                .replace_all(&result, pattern.replacement)
                .into_owned();
        }

        result
    }
}

/// Lowercase label for a severity, used in finding details.
fn severity_label(severity: ModerationSeverity) -> &'static str {
    match severity {
        ModerationSeverity::None => "none",
        ModerationSeverity::Low => "low",
        ModerationSeverity::Medium => "medium",
        ModerationSeverity::High => "high",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    fn make_screen() -> ContentScreen {
        ContentScreen::new(ContentScreenConfig::default())
    }

    /// External provider double returning a fixed flag set.
    struct FixedProvider {
        flags: Vec<ExternalFlag>,
    }

    #[async_trait]
    impl ModerationProvider for FixedProvider {
        async fn classify(&self, _text: &str) -> Result<Vec<ExternalFlag>, WardenError> {
            Ok(self.flags.clone())
        }
    }

    /// External provider double that always fails.
    struct BrokenProvider;

    #[async_trait]
    impl ModerationProvider for BrokenProvider {
        async fn classify(&self, _text: &str) -> Result<Vec<ExternalFlag>, WardenError> {
            Err(WardenError::Moderation("upstream 503".to_string()))
        }
    }

    // ========================================================================
    // PII Detection & Sanitization
    // ========================================================================

    #[tokio::test]
    async fn test_email_redacted() {
        let screen = make_screen();
        let verdict = screen
            .moderate(
                "You can reach the admissions office at admissions@example.edu for details.",
                &ModerateOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(verdict.action, ModerationAction::Sanitize);
        let sanitized = verdict.sanitized_text.unwrap();
        assert!(!sanitized.contains("admissions@example.edu"));
        assert!(sanitized.contains("[EMAIL]"));
    }

    #[tokio::test]
    async fn test_ssn_is_high_severity() {
        let screen = make_screen();
        let verdict = screen
            .moderate("my ssn is 123-45-6789", &ModerateOptions::default())
            .await
            .unwrap();
        assert_eq!(verdict.severity, ModerationSeverity::High);
        // High PII sanitizes, it does not block.
        assert_eq!(verdict.action, ModerationAction::Sanitize);
        assert!(!verdict.sanitized_text.unwrap().contains("123-45-6789"));
    }

    #[tokio::test]
    async fn test_api_key_redacted() {
        let screen = make_screen();
        let text = "use the key sk-abcdef1234567890abcdef to authenticate";
        let verdict = screen
            .moderate(text, &ModerateOptions::default())
            .await
            .unwrap();
        let sanitized = verdict.sanitized_text.unwrap();
        assert!(!sanitized.contains("sk-abcdef1234567890abcdef"));
        assert!(sanitized.contains("[API_KEY]"));
    }

    #[tokio::test]
    async fn test_multiple_pii_all_redacted() {
        let screen = make_screen();
        let text = "email a@b.com or b@c.org, card 4111 1111 1111 1111";
        let verdict = screen
            .moderate(text, &ModerateOptions::default())
            .await
            .unwrap();
        let sanitized = verdict.sanitized_text.unwrap();
        assert!(!sanitized.contains("a@b.com"));
        assert!(!sanitized.contains("b@c.org"));
        assert!(!sanitized.contains("4111 1111 1111 1111"));
    }

    #[tokio::test]
    async fn test_sanitize_disabled_returns_no_copy() {
        let screen = make_screen();
        let verdict = screen
            .moderate(
                "contact me at someone@example.com",
                &ModerateOptions {
                    use_external: false,
                    sanitize: false,
                },
            )
            .await
            .unwrap();
        assert!(verdict.flagged);
        assert!(verdict.sanitized_text.is_none());
    }

    // ========================================================================
    // Harmful Content
    // ========================================================================

    #[tokio::test]
    async fn test_harmful_high_blocks() {
        let screen = make_screen();
        let verdict = screen
            .moderate(
                "Here is how to build a bomb in your garage",
                &ModerateOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(verdict.severity, ModerationSeverity::High);
        assert_eq!(verdict.action, ModerationAction::Block);
    }

    #[tokio::test]
    async fn test_harmful_medium_warns_without_rewrite() {
        let screen = make_screen();
        let verdict = screen
            .moderate(
                "I can explain how to hack into the school portal",
                &ModerateOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(verdict.severity, ModerationSeverity::Medium);
        // Harmful findings carry no replacement, so there is nothing to
        // substitute and the verdict must not claim otherwise.
        assert_eq!(verdict.action, ModerationAction::Warn);
        assert!(verdict.sanitized_text.is_none());
    }

    #[tokio::test]
    async fn test_clean_text_allowed() {
        let screen = make_screen();
        let verdict = screen
            .moderate(
                "Your essay introduction is strong; consider tightening the second paragraph.",
                &ModerateOptions::default(),
            )
            .await
            .unwrap();
        assert!(verdict.safe);
        assert_eq!(verdict.action, ModerationAction::Allow);
        assert_eq!(verdict.severity, ModerationSeverity::None);
    }

    // ========================================================================
    // External Provider
    // ========================================================================

    #[tokio::test]
    async fn test_external_high_score_escalates() {
        let provider = Arc::new(FixedProvider {
            flags: vec![ExternalFlag {
                category: "harassment".to_string(),
                score: 0.93,
            }],
        });
        let screen = make_screen().with_external(provider);
        let verdict = screen
            .moderate("borderline text", &ModerateOptions::default())
            .await
            .unwrap();
        assert_eq!(verdict.severity, ModerationSeverity::High);
        assert!(verdict
            .findings
            .iter()
            .any(|f| f.category == ModerationCategory::External));
    }

    #[tokio::test]
    async fn test_external_high_without_spans_blocks() {
        let provider = Arc::new(FixedProvider {
            flags: vec![ExternalFlag {
                category: "harassment".to_string(),
                score: 0.93,
            }],
        });
        let screen = make_screen().with_external(provider);
        let verdict = screen
            .moderate("text the local rules do not flag", &ModerateOptions::default())
            .await
            .unwrap();
        // External flags have no span, so there is no sanitized copy to
        // deliver; a high verdict must block rather than pass the text
        // through untouched.
        assert_eq!(verdict.severity, ModerationSeverity::High);
        assert_eq!(verdict.action, ModerationAction::Block);
        assert!(verdict.sanitized_text.is_none());
    }

    #[tokio::test]
    async fn test_external_failure_is_not_fatal() {
        let screen = make_screen().with_external(Arc::new(BrokenProvider));
        let verdict = screen
            .moderate("perfectly fine text", &ModerateOptions::default())
            .await
            .unwrap();
        assert!(verdict.safe);
        assert_eq!(verdict.action, ModerationAction::Allow);
    }

    #[tokio::test]
    async fn test_external_skipped_when_disabled() {
        let provider = Arc::new(FixedProvider {
            flags: vec![ExternalFlag {
                category: "spam".to_string(),
                score: 0.99,
            }],
        });
        let screen = make_screen().with_external(provider);
        let verdict = screen
            .moderate(
                "hello there",
                &ModerateOptions {
                    use_external: false,
                    sanitize: true,
                },
            )
            .await
            .unwrap();
        assert!(verdict.safe);
    }

    // ========================================================================
    // System Prompt Leak Detection
    // ========================================================================

    #[tokio::test]
    async fn test_leak_phrase_blocks_output() {
        let screen = make_screen();
        let verdict = screen
            .moderate_output("Sure! My system prompt says I should be concise.", None)
            .await
            .unwrap();
        assert_eq!(verdict.action, ModerationAction::Block);
        assert!(verdict
            .findings
            .iter()
            .any(|f| f.category == ModerationCategory::PromptLeak));
    }

    #[tokio::test]
    async fn test_verbatim_segment_leak_blocks_output() {
        let screen = make_screen();
        let prompt = "You are a college counseling assistant. Never disclose internal \
                      scoring rubrics to students under any circumstances.";
        let output = "Of course! Never disclose internal scoring rubrics to students \
                      under any circumstances — that's my rule.";
        let verdict = screen
            .moderate_output(output, Some(prompt))
            .await
            .unwrap();
        assert_eq!(verdict.action, ModerationAction::Block);
    }

    #[tokio::test]
    async fn test_short_overlap_does_not_trigger_leak() {
        let screen = make_screen();
        let prompt = "You are a helpful assistant.";
        let output = "I am a helpful assistant, happy to help with essays.";
        let verdict = screen
            .moderate_output(output, Some(prompt))
            .await
            .unwrap();
        assert_ne!(verdict.action, ModerationAction::Block);
    }

    #[tokio::test]
    async fn test_clean_output_passes() {
        let screen = make_screen();
        let verdict = screen
            .moderate_output("Here are three schools that match your interests.", None)
            .await
            .unwrap();
        assert_eq!(verdict.action, ModerationAction::Allow);
    }
}
