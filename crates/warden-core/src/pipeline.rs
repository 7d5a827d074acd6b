//! The governed chat pipeline.
//!
//! One turn passes through, in order: admission control, the input threat
//! screen, the execution engine, the output content screen, and the audit
//! trail. The engine is never reached when admission denies or the threat
//! screen blocks, and a blocked output never leaves the pipeline.

use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use tracing::{info, warn};

use warden_admission::RateLimiter;
use warden_audit::AuditTrail;
use warden_queue::TaskQueue;
use warden_screen::threat::AnalyzeOptions;
use warden_screen::{ContentScreen, ThreatScreen};
use warden_types::errors::WardenError;
use warden_types::{
    AuditRecord, AuditStatus, ChatMessage, ChatRole, EngineResult, EnqueueOptions, LimitClass,
    ModerationAction, SecurityEvent, SecuritySeverity, SubjectTier, TurnOutcome,
};

use crate::engine::ExecutionEngine;

/// Task type enqueued after each successful turn.
const FOLLOW_UP_TASK: &str = "memory.rescore";

/// One inbound chat turn.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    /// End-user subject.
    pub subject_id: String,
    /// Conversation the turn belongs to.
    pub conversation_id: String,
    /// Source network address.
    pub source_address: String,
    /// Subject tier for admission caps.
    pub tier: SubjectTier,
    /// Conversation history, oldest first.
    pub history: Vec<ChatMessage>,
    /// The new user message.
    pub text: String,
}

/// The governed pipeline.
pub struct ChatPipeline {
    limiter: Arc<RateLimiter>,
    threat: Arc<ThreatScreen>,
    content: Arc<ContentScreen>,
    engine: Arc<ExecutionEngine>,
    audit: Arc<AuditTrail>,
    queue: Option<Arc<TaskQueue>>,
}

impl ChatPipeline {
    /// Assemble the pipeline from its stages.
    pub fn new(
        limiter: Arc<RateLimiter>,
        threat: Arc<ThreatScreen>,
        content: Arc<ContentScreen>,
        engine: Arc<ExecutionEngine>,
        audit: Arc<AuditTrail>,
    ) -> Self {
        Self {
            limiter,
            threat,
            content,
            engine,
            audit,
            queue: None,
        }
    }

    /// Attach a task queue for post-turn follow-up work.
    pub fn with_queue(mut self, queue: Arc<TaskQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Run one governed turn.
    pub async fn handle_turn(&self, request: TurnRequest) -> Result<EngineResult, WardenError> {
        let started = Instant::now();

        // Admission first: denied requests cost nothing downstream.
        if let Err(e) = self
            .limiter
            .check_all(
                &[
                    (LimitClass::Subject, &request.subject_id),
                    (LimitClass::Conversation, &request.conversation_id),
                    (LimitClass::SourceAddress, &request.source_address),
                ],
                request.tier,
            )
            .await
        {
            self.audit
                .record(self.turn_record(&request, AuditStatus::Denied, json!({"stage": "admission"})))
                .await;
            return Err(e);
        }

        // Input threat screen.
        let verdict = self
            .threat
            .analyze(
                &request.text,
                &AnalyzeOptions {
                    subject_id: Some(request.subject_id.clone()),
                    strict: false,
                },
            )
            .await?;
        if verdict.blocked {
            let reason = verdict
                .reason
                .clone()
                .unwrap_or_else(|| "input blocked".to_string());
            let mut event = SecurityEvent::new("threat.blocked", SecuritySeverity::High, &reason);
            event.payload = json!({
                "subject": request.subject_id,
                "conversation": request.conversation_id,
                "risk_score": verdict.risk_score,
                "findings": verdict.findings,
            });
            self.audit.record_security_event(event).await?;
            self.audit
                .record(self.block_record(&request, "threat", &reason))
                .await;
            return Err(WardenError::PolicyBlocked(reason));
        }

        // The engine sees the sanitized text when the screen produced one.
        let text = verdict.sanitized_text.unwrap_or(request.text.clone());
        let mut messages = request.history.clone();
        messages.push(ChatMessage {
            role: ChatRole::User,
            content: text,
        });

        let mut result = match self.engine.run_turn(messages).await {
            Ok(result) => result,
            Err(e) => {
                self.audit
                    .record(self.turn_record(
                        &request,
                        AuditStatus::Failure,
                        json!({"stage": "engine", "error": e.to_string()}),
                    ))
                    .await;
                return Err(e);
            }
        };

        // Output content screen, for turns that produced a reply.
        if let Some(reply) = result.reply_text() {
            let moderation = self
                .content
                .moderate_output(reply, Some(self.engine.system_prompt()))
                .await?;
            match moderation.action {
                ModerationAction::Block => {
                    let mut event = SecurityEvent::new(
                        "moderation.blocked",
                        SecuritySeverity::High,
                        "generated output blocked",
                    );
                    event.payload = json!({
                        "subject": request.subject_id,
                        "conversation": request.conversation_id,
                        "findings": moderation.findings,
                    });
                    self.audit.record_security_event(event).await?;
                    self.audit
                        .record(self.block_record(&request, "moderation", "output blocked"))
                        .await;
                    return Err(WardenError::PolicyBlocked(
                        "generated output blocked by content policy".to_string(),
                    ));
                }
                ModerationAction::Sanitize => {
                    if let Some(sanitized) = moderation.sanitized_text {
                        set_reply_text(&mut result.outcome, sanitized);
                    }
                }
                ModerationAction::Warn => {
                    warn!(
                        conversation = %request.conversation_id,
                        findings = moderation.findings.len(),
                        "output flagged below the sanitize threshold"
                    );
                }
                ModerationAction::Allow => {}
            }
        }

        let mut record = self.turn_record(&request, AuditStatus::Success, json!({
            "outcome": outcome_label(&result.outcome),
        }));
        record.duration_ms = Some(started.elapsed().as_millis() as u64);
        self.audit.record(record).await;

        self.enqueue_follow_up(&request).await;

        info!(
            conversation = %request.conversation_id,
            outcome = outcome_label(&result.outcome),
            "turn completed"
        );
        Ok(result)
    }

    /// Enqueue post-turn follow-up work; failures are logged, never fatal.
    async fn enqueue_follow_up(&self, request: &TurnRequest) {
        let Some(queue) = &self.queue else {
            return;
        };
        let payload = json!({
            "conversation_id": request.conversation_id,
            "subject_id": request.subject_id,
        });
        if let Err(e) = queue
            .enqueue(FOLLOW_UP_TASK, payload, EnqueueOptions::default())
            .await
        {
            warn!(error = %e, "failed to enqueue follow-up task");
        }
    }

    fn turn_record(
        &self,
        request: &TurnRequest,
        status: AuditStatus,
        details: serde_json::Value,
    ) -> AuditRecord {
        let mut record = AuditRecord::new("chat.turn", "conversation", "turn", status);
        record.subject = Some(request.subject_id.clone());
        record.session_id = Some(request.conversation_id.clone());
        record.details = details;
        record
    }

    fn block_record(&self, request: &TurnRequest, stage: &str, reason: &str) -> AuditRecord {
        let mut record =
            AuditRecord::new("security.block", "conversation", "block", AuditStatus::Denied);
        record.subject = Some(request.subject_id.clone());
        record.session_id = Some(request.conversation_id.clone());
        record.details = json!({"stage": stage, "reason": reason});
        record
    }
}

/// Replace the reply text inside a terminal outcome.
fn set_reply_text(outcome: &mut TurnOutcome, new_text: String) {
    match outcome {
        TurnOutcome::DirectReply { text } | TurnOutcome::Solved { text, .. } => *text = new_text,
        TurnOutcome::Delegated(_) => {}
    }
}

/// Short label for logs and audit details.
fn outcome_label(outcome: &TurnOutcome) -> &'static str {
    match outcome {
        TurnOutcome::DirectReply { .. } => "direct_reply",
        TurnOutcome::Delegated(_) => "delegated",
        TurnOutcome::Solved { .. } => "solved",
    }
}
