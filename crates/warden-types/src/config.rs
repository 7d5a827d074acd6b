/// Configuration file schema for the Warden pipeline.
///
/// Parsed from a single YAML file. Every section has defaults, so an empty
/// file is a valid configuration; `validate` rejects values that would make
/// the pipeline misbehave. Numeric defaults here are tuning defaults, not
/// load-bearing constants.
use serde::{Deserialize, Serialize};

use crate::errors::WardenError;

/// Top-level configuration, one section per subsystem.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WardenConfig {
    #[serde(default)]
    pub screening: ScreeningSettings,
    #[serde(default)]
    pub moderation: ModerationSettings,
    #[serde(default)]
    pub admission: AdmissionSettings,
    #[serde(default)]
    pub queue: QueueSettings,
    #[serde(default)]
    pub audit: AuditSettings,
    #[serde(default)]
    pub alerts: AlertSettings,
    #[serde(default)]
    pub engine: EngineSettings,
}

impl WardenConfig {
    /// Load and validate configuration from a YAML file.
    pub fn load(path: &std::path::Path) -> Result<Self, WardenError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| WardenError::Config(format!("cannot read {}: {e}", path.display())))?;
        let config: Self = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), WardenError> {
        if !(0.0..=1.0).contains(&self.screening.block_threshold)
            || !(0.0..=1.0).contains(&self.screening.strict_block_threshold)
        {
            return Err(WardenError::Config(
                "screening thresholds must be within [0, 1]".to_string(),
            ));
        }
        if self.screening.strict_block_threshold > self.screening.block_threshold {
            return Err(WardenError::Config(
                "strict threshold must not exceed the standard threshold".to_string(),
            ));
        }
        if self.queue.workers == 0 {
            return Err(WardenError::Config(
                "queue.workers must be at least 1".to_string(),
            ));
        }
        if self.audit.flush_threshold == 0 || self.audit.hard_cap < self.audit.flush_threshold {
            return Err(WardenError::Config(
                "audit.hard_cap must be >= audit.flush_threshold >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Threat screen tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreeningSettings {
    /// Character ceiling; larger inputs short-circuit to a high-risk verdict.
    pub max_input_chars: usize,
    /// Risk score at or above which input is blocked.
    pub block_threshold: f64,
    /// Stricter threshold applied under strict mode.
    pub strict_block_threshold: f64,
    /// TTL for the per-subject threat history counter (seconds).
    pub history_ttl_secs: u64,
}

impl Default for ScreeningSettings {
    fn default() -> Self {
        Self {
            max_input_chars: 20_000,
            block_threshold: 0.5,
            strict_block_threshold: 0.3,
            history_ttl_secs: 3_600,
        }
    }
}

/// Content screen tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModerationSettings {
    /// External flag score above which the verdict escalates to high severity.
    pub external_score_threshold: f64,
    /// Minimum system-prompt segment length checked for leakage.
    pub min_leak_segment_chars: usize,
}

impl Default for ModerationSettings {
    fn default() -> Self {
        Self {
            external_score_threshold: 0.8,
            min_leak_segment_chars: 24,
        }
    }
}

/// One rate-limit rule as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitRuleSettings {
    pub window_ms: i64,
    pub cap: u32,
    pub privileged_cap: u32,
}

/// Admission controller tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionSettings {
    pub subject: LimitRuleSettings,
    pub conversation: LimitRuleSettings,
    pub source_address: LimitRuleSettings,
    pub agent: LimitRuleSettings,
    pub tool: LimitRuleSettings,
    /// Interval between purges of expired in-process windows (seconds).
    pub sweep_interval_secs: u64,
}

impl Default for AdmissionSettings {
    fn default() -> Self {
        let minute = 60_000;
        Self {
            subject: LimitRuleSettings {
                window_ms: minute,
                cap: 60,
                privileged_cap: 240,
            },
            conversation: LimitRuleSettings {
                window_ms: minute,
                cap: 30,
                privileged_cap: 120,
            },
            source_address: LimitRuleSettings {
                window_ms: minute,
                cap: 120,
                privileged_cap: 120,
            },
            agent: LimitRuleSettings {
                window_ms: minute,
                cap: 600,
                privileged_cap: 600,
            },
            tool: LimitRuleSettings {
                window_ms: minute,
                cap: 30,
                privileged_cap: 60,
            },
            sweep_interval_secs: 60,
        }
    }
}

/// Task queue tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Fixed number of worker slots.
    pub workers: usize,
    /// Scheduler poll interval (milliseconds).
    pub poll_interval_ms: u64,
    /// Base interval for exponential retry backoff (milliseconds).
    pub base_retry_ms: i64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval_ms: 500,
            base_retry_ms: 1_000,
        }
    }
}

/// Audit trail tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditSettings {
    /// Buffer size at which a flush is triggered.
    pub flush_threshold: usize,
    /// Hard upper bound on buffered records; oldest are dropped beyond this.
    pub hard_cap: usize,
    /// Timer-driven flush interval (milliseconds).
    pub flush_interval_ms: u64,
    /// Bounded grace period for the shutdown drain (milliseconds).
    pub shutdown_grace_ms: u64,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            flush_threshold: 50,
            hard_cap: 1_000,
            flush_interval_ms: 5_000,
            shutdown_grace_ms: 2_000,
        }
    }
}

/// Alert fan-out tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertSettings {
    /// Window within which alerts with the same dedup key aggregate (ms).
    pub aggregation_window_ms: i64,
    /// Maximum alerts sent per minute across all keys.
    pub max_per_minute: u32,
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            aggregation_window_ms: 60_000,
            max_per_minute: 10,
        }
    }
}

/// Execution engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Model identifier for both the planning and solving calls.
    pub model: String,
    /// Maximum tokens per LLM response.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: Option<f64>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-5-20250929".to_string(),
            max_tokens: 4096,
            temperature: Some(0.7),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(WardenConfig::default().validate().is_ok());
    }

    #[test]
    fn test_empty_yaml_parses_with_defaults() {
        let config: WardenConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.queue.workers, 4);
        assert_eq!(config.admission.subject.cap, 60);
    }

    #[test]
    fn test_partial_yaml_overrides_one_section() {
        let config: WardenConfig = serde_yaml::from_str(
            "queue:\n  workers: 8\n  poll_interval_ms: 250\n  base_retry_ms: 500\n",
        )
        .unwrap();
        assert_eq!(config.queue.workers, 8);
        // Untouched sections keep their defaults
        assert_eq!(config.audit.flush_threshold, 50);
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        let mut config = WardenConfig::default();
        config.screening.block_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_strict_threshold_must_be_stricter() {
        let mut config = WardenConfig::default();
        config.screening.strict_block_threshold = 0.9;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut config = WardenConfig::default();
        config.queue.workers = 0;
        assert!(config.validate().is_err());
    }
}
