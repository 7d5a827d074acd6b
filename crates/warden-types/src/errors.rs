/// Unified error type for the Warden pipeline.
///
/// All crates use this error type for propagation across crate boundaries.
/// Internal module errors should be converted into the appropriate variant.
///
/// The taxonomy follows the pipeline's failure semantics: policy rejections
/// and admission denials are user-visible, dependency failures are recovered
/// locally and logged, planning failures are fatal for the turn, and task
/// failures are retried by the queue.
#[derive(Debug, thiserror::Error)]
pub enum WardenError {
    /// Input or output was rejected by a screening policy. User-visible.
    #[error("blocked by policy: {0}")]
    PolicyBlocked(String),

    /// A rate limit was exceeded. User-visible with retry-after information.
    #[error(transparent)]
    Admission(#[from] AdmissionDenied),

    /// Error inside the threat screen (pattern compilation, history lookup).
    #[error("screening error: {0}")]
    Screening(String),

    /// Error inside the content screen (moderation pipeline failure).
    #[error("moderation error: {0}")]
    Moderation(String),

    /// The planning-phase LLM call failed after the provider exhausted its
    /// retries. Fatal for the turn — never silently produces an empty reply.
    #[error("planning failed: {0}")]
    Planning(String),

    /// Error in the execution engine outside of individual tool steps.
    #[error("execution error: {0}")]
    Execution(String),

    /// Error from the background task queue (enqueue, claim, bookkeeping).
    #[error("task error: {0}")]
    Task(String),

    /// Error from the audit trail (flush or security-event write failures).
    #[error("audit error: {0}")]
    Audit(String),

    /// Error from an LLM provider (API call failures, deserialization).
    #[error("LLM provider error: {0}")]
    LlmProvider(String),

    /// Distributed or durable store error (connection, query, script).
    #[error("store error: {0}")]
    Store(String),

    /// Error from configuration loading or validation.
    #[error("config error: {0}")]
    Config(String),

    /// Serialization or deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Timeout waiting on an external dependency.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Generic internal error for unexpected conditions.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Admission denied by the rate limiter.
///
/// Carries everything the caller needs to build a retry-after response.
#[derive(Debug, Clone)]
pub struct AdmissionDenied {
    /// The limit class that was exceeded (e.g., "subject", "tool").
    pub limit_class: String,
    /// The configured cap that was hit.
    pub limit: u32,
    /// Milliseconds until the window frees a slot.
    pub retry_after_ms: i64,
}

impl std::fmt::Display for AdmissionDenied {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "rate limit exceeded for '{}': limit {} (retry after {}ms)",
            self.limit_class, self.limit, self.retry_after_ms
        )
    }
}

impl std::error::Error for AdmissionDenied {}

impl From<serde_json::Error> for WardenError {
    fn from(err: serde_json::Error) -> Self {
        WardenError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for WardenError {
    fn from(err: serde_yaml::Error) -> Self {
        WardenError::Serialization(err.to_string())
    }
}
