//! Security alert fan-out.
//!
//! Deduplicates alerts by `source:title` within an aggregation window and
//! enforces a global per-minute send cap, so an attack burst produces a
//! handful of aggregated alerts instead of a channel flood. Critical alerts
//! bypass both dedup and the cap.
//!
//! Channel sends are fire-and-forget: a broken channel is logged and skipped,
//! never propagated to the caller.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use warden_types::config::AlertSettings;
use warden_types::traits::{AlertChannel, KvStore};
use warden_types::{Alert, SecuritySeverity};

/// Alert fan-out tuning.
#[derive(Debug, Clone)]
pub struct AlertConfig {
    /// Window within which alerts with the same dedup key aggregate (ms).
    pub aggregation_window_ms: i64,
    /// Maximum non-critical alerts sent per minute across all keys.
    pub max_per_minute: u32,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self::from_settings(&AlertSettings::default())
    }
}

impl AlertConfig {
    /// Build from the config-file section.
    pub fn from_settings(settings: &AlertSettings) -> Self {
        Self {
            aggregation_window_ms: settings.aggregation_window_ms,
            max_per_minute: settings.max_per_minute,
        }
    }
}

/// Aggregation state for one dedup key.
struct KeyState {
    /// Window start (epoch ms).
    first_ms: i64,
    /// Occurrences suppressed since the window started.
    suppressed: u32,
    /// Most recent occurrence, delivered with the aggregate count when the
    /// window is flushed.
    last: Alert,
}

/// In-process alert state behind one lock.
struct AlertState {
    keys: HashMap<String, KeyState>,
    /// Send timestamps (epoch ms) within the last minute.
    sent: Vec<i64>,
}

/// The alert manager.
pub struct AlertManager {
    config: AlertConfig,
    channels: Vec<Arc<dyn AlertChannel>>,
    state: Mutex<AlertState>,
    /// Optional distributed dedup counter, so replicas aggregate together.
    kv: Option<Arc<dyn KvStore>>,
}

impl AlertManager {
    /// Create a manager fanning out to the given channels.
    pub fn new(config: AlertConfig, channels: Vec<Arc<dyn AlertChannel>>) -> Self {
        Self {
            config,
            channels,
            state: Mutex::new(AlertState {
                keys: HashMap::new(),
                sent: Vec::new(),
            }),
            kv: None,
        }
    }

    /// Attach a distributed store for cross-replica dedup.
    pub fn with_store(mut self, kv: Arc<dyn KvStore>) -> Self {
        self.kv = Some(kv);
        self
    }

    /// Raise an alert, applying dedup and the per-minute cap.
    pub async fn raise(&self, mut alert: Alert) {
        let now_ms = Utc::now().timestamp_millis();
        let key = alert.dedup_key();

        if alert.severity == SecuritySeverity::Critical {
            // Critical alerts always go out, and immediately. They are exempt
            // from the per-minute cap and must not consume its slots either.
            self.send_to_channels(&alert).await;
            return;
        }

        if let Some(kv) = &self.kv {
            let counter_key = format!("alert:dedup:{key}");
            match kv
                .incr_with_expiry(&counter_key, 1, self.config.aggregation_window_ms)
                .await
            {
                Ok(count) if count > 1 => {
                    debug!(key = %key, count, "alert suppressed by distributed dedup");
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(key = %key, error = %e, "distributed dedup unavailable, using local state");
                }
            }
        }

        let suppressed = {
            let mut state = self.state.lock();

            match state.keys.get_mut(&key) {
                Some(entry) if now_ms - entry.first_ms < self.config.aggregation_window_ms => {
                    entry.suppressed += 1;
                    entry.last = alert;
                    debug!(key = %key, suppressed = entry.suppressed, "alert aggregated");
                    return;
                }
                Some(entry) => {
                    // Window expired: this occurrence opens a new window and
                    // carries the count the old one accumulated.
                    let carried = entry.suppressed;
                    entry.first_ms = now_ms;
                    entry.suppressed = 0;
                    entry.last = alert.clone();
                    carried
                }
                None => {
                    state.keys.insert(
                        key.clone(),
                        KeyState {
                            first_ms: now_ms,
                            suppressed: 0,
                            last: alert.clone(),
                        },
                    );
                    0
                }
            }
        };

        if !self.try_reserve_send_slot(now_ms) {
            warn!(key = %key, "alert rate cap reached, dropping");
            return;
        }

        alert.count = alert.count.max(1) + suppressed;
        if suppressed > 0 {
            info!(key = %key, count = alert.count, "sending aggregated alert");
        }
        self.send_to_channels(&alert).await;
    }

    /// Deliver the aggregate for every expired window.
    ///
    /// Without this, a burst that simply stops would leave its suppressed
    /// count stranded until the same key fired again.
    pub async fn flush_expired(&self) {
        let now_ms = Utc::now().timestamp_millis();
        let due: Vec<Alert> = {
            let mut state = self.state.lock();
            let window = self.config.aggregation_window_ms;
            let mut due = Vec::new();
            state.keys.retain(|_, entry| {
                if now_ms - entry.first_ms < window {
                    return true;
                }
                if entry.suppressed > 0 {
                    let mut alert = entry.last.clone();
                    alert.count = entry.suppressed;
                    due.push(alert);
                }
                false
            });
            due
        };

        for alert in due {
            if !self.try_reserve_send_slot(now_ms) {
                warn!(source = %alert.source, "alert rate cap reached, dropping aggregate");
                continue;
            }
            info!(source = %alert.source, count = alert.count, "sending aggregated alert");
            self.send_to_channels(&alert).await;
        }
    }

    /// Periodically flush expired aggregation windows.
    pub fn spawn_flush_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let period = Duration::from_millis(manager.config.aggregation_window_ms.max(1) as u64);
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                manager.flush_expired().await;
            }
        })
    }

    /// Reserve one send slot under the per-minute cap.
    fn try_reserve_send_slot(&self, now_ms: i64) -> bool {
        let mut state = self.state.lock();
        state.sent.retain(|&t| now_ms - t < 60_000);
        if state.sent.len() >= self.config.max_per_minute as usize {
            return false;
        }
        state.sent.push(now_ms);
        true
    }

    /// Push to every channel; failures are logged and skipped.
    async fn send_to_channels(&self, alert: &Alert) {
        for channel in &self.channels {
            if let Err(e) = channel.send(alert).await {
                error!(channel = channel.name(), error = %e, "alert channel send failed");
            }
        }
    }
}
