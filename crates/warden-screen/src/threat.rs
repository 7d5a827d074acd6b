//! Input threat screen.
//!
//! Scores inbound text for prompt-attack patterns before it reaches the LLM:
//! - Ordered rule table (regex + category + fixed severity), compiled once
//! - Heuristics: special-character ratio, long repeats, mixed scripts, length
//! - Capped weighted risk score with a per-subject history term
//! - Oversize short-circuit that bounds worst-case cost
//! - Sanitized copy for non-blocked input
//! - `quick_check` pre-filter running only the critical rules

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tokio::time::timeout;
use tracing::{debug, warn};

use warden_types::config::ScreeningSettings;
use warden_types::errors::WardenError;
use warden_types::traits::KvStore;
use warden_types::{QuickVerdict, ThreatCategory, ThreatFinding, ThreatSeverity, ThreatVerdict};

/// Budget for a single history-store round trip.
const HISTORY_TIMEOUT: Duration = Duration::from_millis(150);

/// Maximum characters of matched text kept in a finding snippet.
const SNIPPET_MAX: usize = 80;

/// Configuration for the threat screen.
#[derive(Debug, Clone)]
pub struct ThreatScreenConfig {
    /// Character ceiling; larger inputs short-circuit without pattern work.
    pub max_input_chars: usize,
    /// Risk score at or above which input is blocked.
    pub block_threshold: f64,
    /// Stricter threshold used when `strict` is requested.
    pub strict_block_threshold: f64,
    /// TTL for the per-subject history counter.
    pub history_ttl_secs: u64,
    /// Risk added per history counter unit.
    pub history_weight: f64,
    /// Cap on the total history contribution.
    pub history_cap: f64,
    /// Special-character ratio above which a heuristic finding is raised.
    pub special_char_ratio: f64,
}

impl Default for ThreatScreenConfig {
    fn default() -> Self {
        Self {
            max_input_chars: 20_000,
            block_threshold: 0.5,
            strict_block_threshold: 0.3,
            history_ttl_secs: 3_600,
            history_weight: 0.02,
            history_cap: 0.2,
            special_char_ratio: 0.3,
        }
    }
}

impl ThreatScreenConfig {
    /// Build from the config-file section, keeping internal defaults for the
    /// fields the file does not expose.
    pub fn from_settings(settings: &ScreeningSettings) -> Self {
        Self {
            max_input_chars: settings.max_input_chars,
            block_threshold: settings.block_threshold,
            strict_block_threshold: settings.strict_block_threshold,
            history_ttl_secs: settings.history_ttl_secs,
            ..Default::default()
        }
    }
}

/// Options for one analysis call.
#[derive(Debug, Clone, Default)]
pub struct AnalyzeOptions {
    /// Subject whose threat history should contribute to the score.
    pub subject_id: Option<String>,
    /// Apply the stricter decision threshold.
    pub strict: bool,
}

/// A compiled attack-pattern rule with metadata.
struct ThreatRule {
    /// Human-readable name for this rule.
    name: &'static str,
    /// Attack category.
    category: ThreatCategory,
    /// Fixed severity; determines the score weight.
    severity: ThreatSeverity,
    /// Base confidence when this rule matches.
    confidence: f64,
    /// Compiled regex.
    regex: Regex,
}

/// The input threat screen.
///
/// All regexes are compiled once at construction. The per-subject history
/// counter lives behind the [`KvStore`] seam; when the store is unreachable
/// the history term degrades to zero with a warning.
pub struct ThreatScreen {
    config: ThreatScreenConfig,
    rules: Vec<ThreatRule>,
    delimiter_strip: Regex,
    history: Option<Arc<dyn KvStore>>,
}

impl ThreatScreen {
    /// Create a threat screen with the given configuration and no history store.
    pub fn new(config: ThreatScreenConfig) -> Self {
        Self {
            config,
            rules: Self::compile_rules(),
            delimiter_strip: Regex::new(
                r"(?i)(\[/?(system|instructions?|admin|prompt|context|assistant|user)\]|</?(system|instructions?|admin|prompt|context|assistant|user)>)",
            )
            .expect("delimiter strip regex"),
            history: None,
        }
    }

    /// Attach a distributed store for per-subject threat history.
    pub fn with_history(mut self, store: Arc<dyn KvStore>) -> Self {
        self.history = Some(store);
        self
    }

    /// Compile the attack-pattern rule table.
    ///
    /// Critical rules carry confidence 1.0: a single critical match must land
    /// at or above the default decision threshold on its own.
    fn compile_rules() -> Vec<ThreatRule> {
        let rule = |name, category, severity, confidence, pattern: &str| ThreatRule {
            name,
            category,
            severity,
            confidence,
            regex: Regex::new(pattern).expect(name),
        };

        vec![
            rule(
                "instruction_override",
                ThreatCategory::InstructionOverride,
                ThreatSeverity::Critical,
                1.0,
                r"(?i)(ignore\s+(all\s+)?(previous|prior|above|earlier|preceding)\s+(instructions|directives|rules|prompts|guidelines)|disregard\s+(all\s+)?(above|previous|prior|earlier)|forget\s+(all\s+)?(previous|prior|your)\s+(instructions|rules|guidelines|training)|(new|updated)\s+instructions?\s*:|override\s+(all\s+)?instructions)",
            ),
            rule(
                "jailbreak_phrase",
                ThreatCategory::Jailbreak,
                ThreatSeverity::Critical,
                1.0,
                r"(?i)(\bdan\s+mode\b|do\s+anything\s+now|developer\s+mode|\bjailbreak\b|without\s+(any\s+)?(restrictions|limitations|filters|safety)|no\s+longer\s+(have|has)\s+(any\s+)?restrictions)",
            ),
            rule(
                "role_manipulation",
                ThreatCategory::RoleManipulation,
                ThreatSeverity::High,
                0.85,
                r"(?i)(you\s+are\s+now\s+[a-z]|act\s+as\s+if\s+you\s+(are|were)|pretend\s+(to\s+be|you\s+are)|roleplay\s+as|assume\s+the\s+(role|identity)\s+of|from\s+now\s+on\s+you\s+are)",
            ),
            rule(
                "context_leak",
                ThreatCategory::ContextLeak,
                ThreatSeverity::High,
                0.85,
                r"(?i)((reveal|show|print|repeat|display)\s+(me\s+)?(your|the)\s+(system\s+prompt|initial\s+prompt|instructions|hidden\s+(rules|context))|what\s+(is|are)\s+your\s+(system\s+prompt|instructions))",
            ),
            rule(
                "delimiter_attack",
                ThreatCategory::DelimiterAttack,
                ThreatSeverity::High,
                0.9,
                r#"(\[/?(SYSTEM|INSTRUCTIONS?|ADMIN|PROMPT|CONTEXT|ASSISTANT|USER)\]|</?(system|instructions?|admin|prompt|context|assistant|user)>|```\s*(system|prompt|instructions?))"#,
            ),
            rule(
                "encoded_payload",
                ThreatCategory::EncodingAttack,
                ThreatSeverity::Medium,
                0.6,
                r"[A-Za-z0-9+/]{80,}={0,2}",
            ),
            rule(
                "direction_override",
                ThreatCategory::EncodingAttack,
                ThreatSeverity::High,
                0.95,
                r"[\u{200E}\u{200F}\u{202A}\u{202B}\u{202C}\u{202D}\u{202E}\u{2066}\u{2067}\u{2068}\u{2069}]",
            ),
            rule(
                "addressed_to_model",
                ThreatCategory::IndirectInjection,
                ThreatSeverity::Medium,
                0.7,
                r"(?i)(to\s+(the|any)\s+(ai|assistant|model)\s+(reading|processing)|if\s+you\s+are\s+an?\s+(ai|llm|language\s+model)|attention\s+(ai|assistant)\s*:)",
            ),
            rule(
                "script_injection",
                ThreatCategory::IndirectInjection,
                ThreatSeverity::High,
                0.9,
                r"(?i)(<\s*script[\s>]|javascript\s*:|data\s*:\s*text/html)",
            ),
        ]
    }

    /// Full analysis: rules, heuristics, history, decision, sanitization.
    pub async fn analyze(
        &self,
        text: &str,
        opts: &AnalyzeOptions,
    ) -> Result<ThreatVerdict, WardenError> {
        let char_count = text.chars().count();

        // Oversize input short-circuits before any regex work so worst-case
        // cost stays bounded regardless of content.
        if char_count > self.config.max_input_chars {
            let finding = ThreatFinding {
                category: ThreatCategory::Oversize,
                severity: ThreatSeverity::Critical,
                matched: format!("{char_count} chars (ceiling {})", self.config.max_input_chars),
                span: None,
                confidence: 1.0,
            };
            let risk_score = finding.severity.weight();
            return Ok(ThreatVerdict {
                safe: false,
                risk_score,
                findings: vec![finding],
                sanitized_text: None,
                blocked: true,
                reason: Some("input exceeds the size ceiling".to_string()),
            });
        }

        let mut findings = self.match_rules(text);
        findings.extend(self.run_heuristics(text, char_count));

        let mut risk_score: f64 = findings
            .iter()
            .map(|f| f.severity.weight() * f.confidence)
            .sum();

        // The history term applies only when the current text already matched
        // something: clean input from a previously noisy subject stays at zero.
        if !findings.is_empty() {
            if let Some(subject) = opts.subject_id.as_deref() {
                risk_score += self.history_term(subject, &findings).await;
            }
        }
        let risk_score = risk_score.min(1.0);

        let threshold = if opts.strict {
            self.config.strict_block_threshold
        } else {
            self.config.block_threshold
        };
        let blocked = risk_score >= threshold && !findings.is_empty();

        let reason = blocked.then(|| {
            let top = findings
                .iter()
                .max_by(|a, b| {
                    a.severity
                        .cmp(&b.severity)
                        .then(a.confidence.total_cmp(&b.confidence))
                })
                .map(|f| f.category.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            format!("threat patterns detected ({top}), risk {risk_score:.2}")
        });

        let sanitized_text = if !blocked && !findings.is_empty() {
            Some(self.sanitize(text, &findings))
        } else {
            None
        };

        if blocked {
            warn!(
                risk = risk_score,
                findings = findings.len(),
                strict = opts.strict,
                "input blocked by threat screen"
            );
        } else if !findings.is_empty() {
            debug!(
                risk = risk_score,
                findings = findings.len(),
                "threat findings below block threshold"
            );
        }

        Ok(ThreatVerdict {
            safe: findings.is_empty(),
            risk_score,
            findings,
            sanitized_text,
            blocked,
            reason,
        })
    }

    /// Low-latency pre-filter: critical-severity rules only, first match wins.
    ///
    /// Strictly cheaper than `analyze` — no heuristics, no history, no
    /// collection of every match.
    pub fn quick_check(&self, text: &str) -> QuickVerdict {
        if text.chars().count() > self.config.max_input_chars {
            return QuickVerdict {
                safe: false,
                category: Some(ThreatCategory::Oversize),
            };
        }
        for rule in &self.rules {
            if rule.severity == ThreatSeverity::Critical && rule.regex.is_match(text) {
                return QuickVerdict {
                    safe: false,
                    category: Some(rule.category),
                };
            }
        }
        QuickVerdict {
            safe: true,
            category: None,
        }
    }

    /// Run every rule, collecting all matches with spans.
    fn match_rules(&self, text: &str) -> Vec<ThreatFinding> {
        let mut findings = Vec::new();
        for rule in &self.rules {
            for m in rule.regex.find_iter(text) {
                findings.push(ThreatFinding {
                    category: rule.category,
                    severity: rule.severity,
                    matched: snippet(m.as_str()),
                    span: Some((m.start(), m.end())),
                    confidence: rule.confidence,
                });
                debug!(rule = rule.name, offset = m.start(), "threat rule matched");
            }
        }
        findings
    }

    /// Cheap structural heuristics, each contributing a low/medium finding.
    fn run_heuristics(&self, text: &str, char_count: usize) -> Vec<ThreatFinding> {
        let mut findings = Vec::new();

        if char_count >= 40 {
            let special = text
                .chars()
                .filter(|c| !c.is_alphanumeric() && !c.is_whitespace())
                .count();
            let ratio = special as f64 / char_count as f64;
            if ratio > self.config.special_char_ratio {
                findings.push(ThreatFinding {
                    category: ThreatCategory::EncodingAttack,
                    severity: ThreatSeverity::Medium,
                    matched: format!("special-character ratio {ratio:.2}"),
                    span: None,
                    confidence: 0.6,
                });
            }
        }

        if has_long_repeat(text) {
            findings.push(ThreatFinding {
                category: ThreatCategory::EncodingAttack,
                severity: ThreatSeverity::Medium,
                matched: "long repeated substring".to_string(),
                span: None,
                confidence: 0.6,
            });
        }

        if has_mixed_script(text) {
            findings.push(ThreatFinding {
                category: ThreatCategory::EncodingAttack,
                severity: ThreatSeverity::Medium,
                matched: "mixed-script payload".to_string(),
                span: None,
                confidence: 0.55,
            });
        }

        if char_count > self.config.max_input_chars * 3 / 4 {
            findings.push(ThreatFinding {
                category: ThreatCategory::Oversize,
                severity: ThreatSeverity::Low,
                matched: format!("{char_count} chars"),
                span: None,
                confidence: 0.8,
            });
        }

        findings
    }

    /// Read the capped history term and push the new increment.
    ///
    /// Store failures degrade to a zero term with a warning; they never fail
    /// the analysis.
    async fn history_term(&self, subject: &str, findings: &[ThreatFinding]) -> f64 {
        let Some(store) = &self.history else {
            return 0.0;
        };
        let key = format!("threat:history:{subject}");
        let ttl_ms = (self.config.history_ttl_secs * 1_000) as i64;

        let term = match timeout(HISTORY_TIMEOUT, store.get_counter(&key)).await {
            Ok(Ok(count)) if count > 0 => {
                (count as f64 * self.config.history_weight).min(self.config.history_cap)
            }
            Ok(Ok(_)) => 0.0,
            Ok(Err(e)) => {
                warn!(error = %e, "threat history unavailable, degrading to zero term");
                0.0
            }
            Err(_) => {
                warn!("threat history read timed out, degrading to zero term");
                0.0
            }
        };

        // Increment proportionally to what this analysis found.
        let delta: i64 = findings
            .iter()
            .map(|f| match f.severity {
                ThreatSeverity::Critical => 3,
                ThreatSeverity::High => 2,
                ThreatSeverity::Medium => 1,
                ThreatSeverity::Low => 0,
            })
            .sum();
        if delta > 0 {
            match timeout(HISTORY_TIMEOUT, store.incr_with_expiry(&key, delta, ttl_ms)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(error = %e, "threat history increment failed"),
                Err(_) => warn!("threat history increment timed out"),
            }
        }

        term
    }

    /// Redact high/critical spans and strip known delimiter tokens.
    fn sanitize(&self, text: &str, findings: &[ThreatFinding]) -> String {
        let mut spans: Vec<(usize, usize)> = findings
            .iter()
            .filter(|f| f.severity >= ThreatSeverity::High)
            .filter_map(|f| f.span)
            .collect();
        // Descending order so earlier replacements don't shift later offsets;
        // overlapping spans are skipped.
        spans.sort_by(|a, b| b.0.cmp(&a.0));

        let mut result = text.to_string();
        let mut last_start = result.len() + 1;
        for (start, end) in spans {
            if end > last_start {
                continue;
            }
            result.replace_range(start..end, "[REDACTED]");
            last_start = start;
        }

        self.delimiter_strip.replace_all(&result, "").into_owned()
    }
}

/// Truncate matched text for the finding snippet.
fn snippet(matched: &str) -> String {
    if matched.len() > SNIPPET_MAX {
        let mut end = SNIPPET_MAX;
        while end > 0 && !matched.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &matched[..end])
    } else {
        matched.to_string()
    }
}

/// Detect a periodic byte pattern sustained for ~100 bytes or more.
fn has_long_repeat(text: &str) -> bool {
    let bytes = text.as_bytes();
    for period in [4usize, 8, 12, 16, 24, 32] {
        if bytes.len() < period * 4 {
            continue;
        }
        let mut run = 0usize;
        for i in period..bytes.len() {
            if bytes[i] == bytes[i - period] {
                run += 1;
                if run + period >= 96 {
                    return true;
                }
            } else {
                run = 0;
            }
        }
    }
    false
}

/// Detect Latin text salted with confusable non-Latin letters.
fn has_mixed_script(text: &str) -> bool {
    let mut latin = 0usize;
    let mut other = 0usize;
    for c in text.chars() {
        if c.is_ascii_alphabetic() {
            latin += 1;
        } else if ('\u{0370}'..='\u{03FF}').contains(&c) || ('\u{0400}'..='\u{04FF}').contains(&c) {
            other += 1;
        }
    }
    latin > 20 && other > 5
}
