//! Sliding-window rate limiter.
//!
//! Every check is one atomic [`KvStore::window_probe`]: evict expired
//! entries, count the rest, and record the new event only when the count is
//! under the cap. Denied requests are never recorded, so a denial does not
//! extend the caller's own lockout.
//!
//! When a distributed store is attached it is tried first with a short
//! budget; on error or timeout the limiter falls back to its in-process
//! windows so that admission keeps working (per-process) through a store
//! outage.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::timeout;
use tracing::{debug, warn};

use warden_store::MemoryKvStore;
use warden_types::config::AdmissionSettings;
use warden_types::errors::{AdmissionDenied, WardenError};
use warden_types::traits::KvStore;
use warden_types::{LimitClass, LimitRule, RateLimitDecision, SubjectTier, WindowProbe};

/// Budget for one distributed-store probe before falling back locally.
const STORE_TIMEOUT: Duration = Duration::from_millis(150);

/// Per-class rules for the limiter.
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    pub subject: LimitRule,
    pub conversation: LimitRule,
    pub source_address: LimitRule,
    pub agent: LimitRule,
    pub tool: LimitRule,
    /// Interval between purges of expired in-process windows.
    pub sweep_interval: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self::from_settings(&AdmissionSettings::default())
    }
}

impl AdmissionConfig {
    /// Build from the config-file section.
    pub fn from_settings(settings: &AdmissionSettings) -> Self {
        let rule = |s: &warden_types::config::LimitRuleSettings| LimitRule {
            window_ms: s.window_ms,
            cap: s.cap,
            privileged_cap: s.privileged_cap,
        };
        Self {
            subject: rule(&settings.subject),
            conversation: rule(&settings.conversation),
            source_address: rule(&settings.source_address),
            agent: rule(&settings.agent),
            tool: rule(&settings.tool),
            sweep_interval: Duration::from_secs(settings.sweep_interval_secs),
        }
    }

    /// The rule for a limit class.
    pub fn rule(&self, class: LimitClass) -> &LimitRule {
        match class {
            LimitClass::Subject => &self.subject,
            LimitClass::Conversation => &self.conversation,
            LimitClass::SourceAddress => &self.source_address,
            LimitClass::Agent => &self.agent,
            LimitClass::Tool => &self.tool,
        }
    }

    /// The longest configured window, used as the local purge retention.
    fn max_window_ms(&self) -> i64 {
        [
            self.subject.window_ms,
            self.conversation.window_ms,
            self.source_address.window_ms,
            self.agent.window_ms,
            self.tool.window_ms,
        ]
        .into_iter()
        .max()
        .unwrap_or(60_000)
    }
}

/// The admission controller.
pub struct RateLimiter {
    config: AdmissionConfig,
    /// Distributed store, tried first when present.
    store: Option<Arc<dyn KvStore>>,
    /// In-process windows: the fallback path, and the only path when no
    /// distributed store is attached.
    local: Arc<MemoryKvStore>,
}

impl RateLimiter {
    /// Create a limiter using in-process windows only.
    pub fn new(config: AdmissionConfig) -> Self {
        Self {
            config,
            store: None,
            local: Arc::new(MemoryKvStore::new()),
        }
    }

    /// Attach a distributed store.
    pub fn with_store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Check one limit class, consuming a slot when admitted.
    pub async fn check_limit(
        &self,
        class: LimitClass,
        id: &str,
        tier: SubjectTier,
    ) -> Result<RateLimitDecision, WardenError> {
        self.probe(class, id, tier, true).await
    }

    /// Read the current window state without consuming a slot.
    pub async fn get_status(
        &self,
        class: LimitClass,
        id: &str,
        tier: SubjectTier,
    ) -> Result<RateLimitDecision, WardenError> {
        self.probe(class, id, tier, false).await
    }

    /// Clear the window for one class and id on both paths.
    pub async fn reset(&self, class: LimitClass, id: &str) -> Result<(), WardenError> {
        let key = window_key(class, id);
        if let Some(store) = &self.store {
            if let Err(e) = store.remove(&key).await {
                warn!(key = %key, error = %e, "store reset failed");
            }
        }
        self.local.remove(&key).await
    }

    /// Check several classes in order, stopping at the first denial.
    ///
    /// Classes after a denied one are not probed and consume nothing, so a
    /// denial on one dimension never burns budget on the others.
    pub async fn check_all(
        &self,
        checks: &[(LimitClass, &str)],
        tier: SubjectTier,
    ) -> Result<(), WardenError> {
        for &(class, id) in checks {
            let decision = self.check_limit(class, id, tier).await?;
            if !decision.allowed {
                return Err(WardenError::Admission(AdmissionDenied {
                    limit_class: class.key_prefix().to_string(),
                    limit: decision.limit,
                    retry_after_ms: decision.reset_in_ms,
                }));
            }
        }
        Ok(())
    }

    /// Periodically purge expired in-process windows.
    pub fn spawn_sweep(&self) -> tokio::task::JoinHandle<()> {
        let local = Arc::clone(&self.local);
        let interval = self.config.sweep_interval;
        let retention = self.config.max_window_ms();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let purged = local.purge_expired(Utc::now().timestamp_millis(), retention);
                if purged > 0 {
                    debug!(purged, "purged expired admission windows");
                }
            }
        })
    }

    /// Probe one window, preferring the distributed store.
    async fn probe(
        &self,
        class: LimitClass,
        id: &str,
        tier: SubjectTier,
        record: bool,
    ) -> Result<RateLimitDecision, WardenError> {
        let rule = self.config.rule(class);
        let cap = rule.cap_for(tier);
        let key = window_key(class, id);
        let now_ms = Utc::now().timestamp_millis();

        let probe = match &self.store {
            Some(store) => {
                match timeout(
                    STORE_TIMEOUT,
                    store.window_probe(&key, now_ms, rule.window_ms, cap, record),
                )
                .await
                {
                    Ok(Ok(probe)) => probe,
                    Ok(Err(e)) => {
                        warn!(key = %key, error = %e, "store probe failed, using local window");
                        self.local
                            .window_probe(&key, now_ms, rule.window_ms, cap, record)
                            .await?
                    }
                    Err(_) => {
                        warn!(key = %key, "store probe timed out, using local window");
                        self.local
                            .window_probe(&key, now_ms, rule.window_ms, cap, record)
                            .await?
                    }
                }
            }
            None => {
                self.local
                    .window_probe(&key, now_ms, rule.window_ms, cap, record)
                    .await?
            }
        };

        let decision = decide(&probe, cap, rule.window_ms, now_ms);
        if !decision.allowed {
            debug!(
                class = %class,
                id,
                limit = decision.limit,
                retry_after_ms = decision.reset_in_ms,
                "admission denied"
            );
        }
        Ok(decision)
    }
}

/// Store key for one window.
fn window_key(class: LimitClass, id: &str) -> String {
    format!("rl:{}:{}", class.key_prefix(), id)
}

/// Turn a window probe into a decision.
fn decide(probe: &WindowProbe, cap: u32, window_ms: i64, now_ms: i64) -> RateLimitDecision {
    let reset_in_ms = match probe.oldest_ms {
        Some(oldest) => (oldest + window_ms - now_ms).max(0),
        None => window_ms,
    };
    RateLimitDecision {
        allowed: probe.allowed,
        remaining: cap.saturating_sub(probe.count),
        reset_in_ms,
        limit: cap,
    }
}
