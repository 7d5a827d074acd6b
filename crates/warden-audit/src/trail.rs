//! Buffered audit trail.
//!
//! Audit records accumulate in a bounded in-memory buffer and are flushed to
//! the store in batches, so the request path never waits on audit I/O. A
//! failed flush puts the batch back at the front of the buffer; the hard cap
//! bounds memory during a store outage by dropping the oldest records.
//!
//! Security events skip the buffer entirely: they are written synchronously
//! and fanned out to alert channels at high severities.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use warden_types::config::AuditSettings;
use warden_types::errors::WardenError;
use warden_types::traits::AuditStore;
use warden_types::{Alert, AuditRecord, SecurityEvent, SecuritySeverity};

use crate::alerts::AlertManager;

/// Actions flushed immediately instead of waiting for the batch threshold.
const CRITICAL_ACTIONS: &[&str] = &["security.block", "config.change", "data.delete"];

/// Audit trail tuning.
#[derive(Debug, Clone)]
pub struct AuditConfig {
    /// Buffer size at which a flush is triggered.
    pub flush_threshold: usize,
    /// Hard upper bound on buffered records.
    pub hard_cap: usize,
    /// Timer-driven flush interval.
    pub flush_interval: Duration,
    /// Bounded grace period for the shutdown drain.
    pub shutdown_grace: Duration,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self::from_settings(&AuditSettings::default())
    }
}

impl AuditConfig {
    /// Build from the config-file section.
    pub fn from_settings(settings: &AuditSettings) -> Self {
        Self {
            flush_threshold: settings.flush_threshold,
            hard_cap: settings.hard_cap,
            flush_interval: Duration::from_millis(settings.flush_interval_ms),
            shutdown_grace: Duration::from_millis(settings.shutdown_grace_ms),
        }
    }
}

/// The audit trail.
pub struct AuditTrail {
    config: AuditConfig,
    store: Arc<dyn AuditStore>,
    buffer: Mutex<VecDeque<AuditRecord>>,
    /// Guards against concurrent flushes of the same buffer.
    flushing: AtomicBool,
    alerts: Option<Arc<AlertManager>>,
}

impl AuditTrail {
    /// Create a trail over the given store.
    pub fn new(config: AuditConfig, store: Arc<dyn AuditStore>) -> Self {
        Self {
            config,
            store,
            buffer: Mutex::new(VecDeque::new()),
            flushing: AtomicBool::new(false),
            alerts: None,
        }
    }

    /// Attach an alert manager for high-severity security events.
    pub fn with_alerts(mut self, alerts: Arc<AlertManager>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    /// Buffer one audit record, flushing when policy requires it.
    pub async fn record(&self, record: AuditRecord) {
        let critical = CRITICAL_ACTIONS.contains(&record.action.as_str());
        let over_threshold = {
            let mut buffer = self.buffer.lock();
            buffer.push_back(record);
            if buffer.len() > self.config.hard_cap {
                let dropped = buffer.len() - self.config.hard_cap;
                buffer.drain(..dropped);
                warn!(dropped, "audit buffer over hard cap, dropped oldest records");
            }
            buffer.len() >= self.config.flush_threshold
        };

        if critical || over_threshold {
            self.flush().await;
        }
    }

    /// Flush the buffer to the store.
    ///
    /// At most one flush runs at a time; a failed batch goes back to the
    /// front of the buffer so record order is preserved.
    pub async fn flush(&self) {
        if self
            .flushing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let batch: Vec<AuditRecord> = self.buffer.lock().drain(..).collect();
        if !batch.is_empty() {
            let batch_len = batch.len();
            match self.store.append(batch.clone()).await {
                Ok(()) => debug!(records = batch_len, "audit batch flushed"),
                Err(e) => {
                    warn!(records = batch_len, error = %e, "audit flush failed, requeueing batch");
                    let mut buffer = self.buffer.lock();
                    for record in batch.into_iter().rev() {
                        buffer.push_front(record);
                    }
                    if buffer.len() > self.config.hard_cap {
                        let dropped = buffer.len() - self.config.hard_cap;
                        buffer.drain(..dropped);
                        warn!(dropped, "audit buffer over hard cap, dropped oldest records");
                    }
                }
            }
        }

        self.flushing.store(false, Ordering::Release);
    }

    /// Write a security event synchronously, raising an alert at high
    /// severities. The write is on the critical path and errors propagate.
    pub async fn record_security_event(&self, event: SecurityEvent) -> Result<(), WardenError> {
        info!(
            event_id = %event.id,
            event_type = %event.event_type,
            severity = event.severity.as_str(),
            "security event recorded"
        );
        self.store.append_event(event.clone()).await?;

        if event.severity >= SecuritySeverity::High {
            if let Some(alerts) = &self.alerts {
                alerts
                    .raise(Alert {
                        source: event.event_type.clone(),
                        title: event.description.clone(),
                        body: event.payload.to_string(),
                        severity: event.severity,
                        count: 1,
                        created_at: event.created_at,
                    })
                    .await;
            }
        }
        Ok(())
    }

    /// Resolve a security event exactly once.
    pub async fn resolve_event(&self, id: Uuid, mitigation: &str) -> Result<bool, WardenError> {
        let resolved = self.store.resolve_event(id, mitigation).await?;
        if resolved {
            info!(event_id = %id, mitigation, "security event resolved");
        }
        Ok(resolved)
    }

    /// Records currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Periodically flush on a timer.
    pub fn spawn_flush_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let trail = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(trail.config.flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                trail.flush().await;
            }
        })
    }

    /// Drain the buffer within the shutdown grace period.
    ///
    /// Best effort: whatever cannot be flushed in time is reported and lost.
    pub async fn shutdown(&self) {
        let drain = async {
            while self.buffered() > 0 {
                self.flush().await;
                if self.buffered() > 0 {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        };
        if timeout(self.config.shutdown_grace, drain).await.is_err() {
            error!(
                remaining = self.buffered(),
                "audit shutdown grace expired with records unflushed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertConfig;
    use async_trait::async_trait;
    use warden_store::MemoryAuditStore;
    use warden_types::traits::AlertChannel;
    use warden_types::AuditStatus;

    fn record(action: &str) -> AuditRecord {
        AuditRecord::new(action, "conversation", "turn", AuditStatus::Success)
    }

    fn small_config() -> AuditConfig {
        AuditConfig {
            flush_threshold: 3,
            hard_cap: 5,
            flush_interval: Duration::from_millis(100),
            shutdown_grace: Duration::from_millis(500),
        }
    }

    /// Store double whose batch appends fail while the flag is set.
    struct FlakyStore {
        inner: MemoryAuditStore,
        failing: AtomicBool,
    }

    impl FlakyStore {
        fn new(failing: bool) -> Self {
            Self {
                inner: MemoryAuditStore::new(),
                failing: AtomicBool::new(failing),
            }
        }
    }

    #[async_trait]
    impl AuditStore for FlakyStore {
        async fn append(&self, records: Vec<AuditRecord>) -> Result<(), WardenError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(WardenError::Store("connection refused".to_string()));
            }
            self.inner.append(records).await
        }

        async fn append_event(&self, event: SecurityEvent) -> Result<(), WardenError> {
            self.inner.append_event(event).await
        }

        async fn resolve_event(&self, id: Uuid, mitigation: &str) -> Result<bool, WardenError> {
            self.inner.resolve_event(id, mitigation).await
        }
    }

    /// Channel double counting sends.
    struct CountingChannel {
        sent: Mutex<Vec<Alert>>,
    }

    #[async_trait]
    impl AlertChannel for CountingChannel {
        fn name(&self) -> &str {
            "counter"
        }

        async fn send(&self, alert: &Alert) -> Result<(), WardenError> {
            self.sent.lock().push(alert.clone());
            Ok(())
        }
    }

    // ========================================================================
    // Buffering & Flushing
    // ========================================================================

    #[tokio::test]
    async fn test_records_buffer_below_threshold() {
        let store = Arc::new(MemoryAuditStore::new());
        let trail = AuditTrail::new(small_config(), store.clone());
        trail.record(record("chat.turn")).await;
        trail.record(record("chat.turn")).await;
        assert_eq!(trail.buffered(), 2);
        assert!(store.records().is_empty());
    }

    #[tokio::test]
    async fn test_threshold_triggers_flush() {
        let store = Arc::new(MemoryAuditStore::new());
        let trail = AuditTrail::new(small_config(), store.clone());
        for _ in 0..3 {
            trail.record(record("chat.turn")).await;
        }
        assert_eq!(trail.buffered(), 0);
        assert_eq!(store.records().len(), 3);
    }

    #[tokio::test]
    async fn test_critical_action_flushes_immediately() {
        let store = Arc::new(MemoryAuditStore::new());
        let trail = AuditTrail::new(small_config(), store.clone());
        trail.record(record("chat.turn")).await;
        trail.record(record("security.block")).await;
        assert_eq!(trail.buffered(), 0);
        assert_eq!(store.records().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_flush_requeues_in_order() {
        let store = Arc::new(FlakyStore::new(true));
        let trail = AuditTrail::new(small_config(), store.clone());
        trail.record(record("first")).await;
        trail.record(record("second")).await;
        trail.flush().await;
        // Batch is back, order preserved.
        assert_eq!(trail.buffered(), 2);

        store.failing.store(false, Ordering::SeqCst);
        trail.flush().await;
        let written = store.inner.records();
        assert_eq!(written.len(), 2);
        assert_eq!(written[0].action, "first");
        assert_eq!(written[1].action, "second");
    }

    #[tokio::test]
    async fn test_hard_cap_drops_oldest() {
        let store = Arc::new(FlakyStore::new(true));
        let trail = AuditTrail::new(small_config(), store.clone());
        for i in 0..10 {
            trail.record(record(&format!("action-{i}"))).await;
        }
        assert_eq!(trail.buffered(), 5);
        store.failing.store(false, Ordering::SeqCst);
        trail.flush().await;
        let written = store.inner.records();
        // The newest five survived.
        assert_eq!(written.first().unwrap().action, "action-5");
        assert_eq!(written.last().unwrap().action, "action-9");
    }

    #[tokio::test]
    async fn test_shutdown_drains_buffer() {
        let store = Arc::new(MemoryAuditStore::new());
        let trail = AuditTrail::new(small_config(), store.clone());
        trail.record(record("chat.turn")).await;
        trail.shutdown().await;
        assert_eq!(trail.buffered(), 0);
        assert_eq!(store.records().len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_grace_bounds_a_dead_store() {
        let store = Arc::new(FlakyStore::new(true));
        let config = AuditConfig {
            shutdown_grace: Duration::from_millis(100),
            ..small_config()
        };
        let trail = AuditTrail::new(config, store);
        trail.record(record("chat.turn")).await;
        let started = std::time::Instant::now();
        trail.shutdown().await;
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    // ========================================================================
    // Security Events
    // ========================================================================

    #[tokio::test]
    async fn test_security_event_written_synchronously() {
        let store = Arc::new(MemoryAuditStore::new());
        let trail = AuditTrail::new(small_config(), store.clone());
        let event = SecurityEvent::new("threat.blocked", SecuritySeverity::High, "injection");
        trail.record_security_event(event).await.unwrap();
        assert_eq!(store.events().len(), 1);
    }

    #[tokio::test]
    async fn test_high_severity_event_raises_alert() {
        let channel = Arc::new(CountingChannel {
            sent: Mutex::new(Vec::new()),
        });
        let alerts = Arc::new(AlertManager::new(
            AlertConfig::default(),
            vec![channel.clone()],
        ));
        let store = Arc::new(MemoryAuditStore::new());
        let trail = AuditTrail::new(small_config(), store).with_alerts(alerts);

        let event = SecurityEvent::new("threat.blocked", SecuritySeverity::High, "injection");
        trail.record_security_event(event).await.unwrap();
        assert_eq!(channel.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_low_severity_event_raises_no_alert() {
        let channel = Arc::new(CountingChannel {
            sent: Mutex::new(Vec::new()),
        });
        let alerts = Arc::new(AlertManager::new(
            AlertConfig::default(),
            vec![channel.clone()],
        ));
        let store = Arc::new(MemoryAuditStore::new());
        let trail = AuditTrail::new(small_config(), store).with_alerts(alerts);

        let event = SecurityEvent::new("screen.warned", SecuritySeverity::Low, "pii warning");
        trail.record_security_event(event).await.unwrap();
        assert!(channel.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_resolve_event_is_exactly_once() {
        let store = Arc::new(MemoryAuditStore::new());
        let trail = AuditTrail::new(small_config(), store.clone());
        let event = SecurityEvent::new("threat.blocked", SecuritySeverity::High, "injection");
        let id = event.id;
        trail.record_security_event(event).await.unwrap();

        assert!(trail.resolve_event(id, "subject suspended").await.unwrap());
        assert!(!trail.resolve_event(id, "again").await.unwrap());
    }
}
