/// Types for the Plan/Execute/Solve execution engine and its LLM/tool seams.
use serde::{Deserialize, Serialize};

// ============================================================
// LLM Interface Types
// ============================================================

/// Role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

/// A single message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

/// Request sent to an LLM provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// System prompt for the call.
    pub system: String,
    /// Conversation messages.
    pub messages: Vec<ChatMessage>,
    /// Model identifier.
    pub model: String,
    /// Maximum tokens for the response.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: Option<f64>,
}

/// A tool call requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Name of the tool to invoke.
    pub tool_name: String,
    /// Arguments as a JSON value.
    pub arguments: serde_json::Value,
}

/// Response from an LLM provider.
///
/// When a request is made without tool definitions attached, `tool_calls` is
/// structurally empty — the provider has nothing to call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    /// Text content of the response.
    pub text: String,
    /// Tool calls the model wants to make, in model order.
    pub tool_calls: Vec<ToolCallRequest>,
}

/// Definition of a tool exposed to the model during planning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name.
    pub name: String,
    /// Human-readable description shown to the model.
    pub description: String,
    /// JSON schema for the tool's arguments.
    pub input_schema: serde_json::Value,
}

/// Structured outcome of one tool invocation.
///
/// Tool executors never throw — failures are reported through this struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    /// Whether the invocation succeeded.
    pub success: bool,
    /// Tool output on success.
    pub result: Option<serde_json::Value>,
    /// Error description on failure.
    pub error: Option<String>,
    /// Wall-clock duration of the invocation.
    pub duration_ms: u64,
}

// ============================================================
// Plan / Execute / Solve Types
// ============================================================

/// One step of an execution plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    /// Tool to invoke.
    pub tool_name: String,
    /// First-occurrence arguments for the tool.
    pub arguments: serde_json::Value,
}

/// Delegation signalled by the planning call via the reserved tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delegation {
    /// Target agent or subsystem to delegate to.
    pub target: String,
    /// The task to delegate.
    pub task: String,
    /// Context to carry along.
    pub context: String,
}

/// Output of the planning phase.
///
/// Step tool names are unique — first occurrence wins, later duplicates are
/// dropped with a logged notice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// Deduplicated steps in plan order.
    pub steps: Vec<PlanStep>,
    /// Free text accompanying the plan, if any.
    pub planning_text: Option<String>,
    /// Delegation request, if the model invoked the reserved tool.
    pub delegation: Option<Delegation>,
}

/// Status of one executed plan step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    Success,
    Failed,
}

/// Result of one plan step, produced only during the Execute phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    /// Tool that was invoked.
    pub tool_name: String,
    /// Success or failure.
    pub status: StepStatus,
    /// Tool output on success.
    pub output: Option<serde_json::Value>,
    /// Error description on failure.
    pub error: Option<String>,
    /// Wall-clock duration of the step.
    pub duration_ms: u64,
}

/// Per-phase wall-clock timings for observability.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PhaseTimings {
    pub planning_ms: u64,
    pub executing_ms: u64,
    pub solving_ms: u64,
}

/// Terminal state of one engine turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TurnOutcome {
    /// Planning produced no tool calls; the planning text is the reply.
    DirectReply { text: String },
    /// Planning invoked the reserved delegation tool.
    Delegated(Delegation),
    /// Execute and Solve ran; the synthesized reply and step results.
    Solved {
        text: String,
        steps: Vec<StepResult>,
    },
}

/// Result of one full engine turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineResult {
    /// Which terminal state the turn reached, with its payload.
    pub outcome: TurnOutcome,
    /// Phase timings for the turn.
    pub timings: PhaseTimings,
}

impl EngineResult {
    /// The user-facing reply text, when the turn produced one.
    pub fn reply_text(&self) -> Option<&str> {
        match &self.outcome {
            TurnOutcome::DirectReply { text } | TurnOutcome::Solved { text, .. } => {
                Some(text.as_str())
            }
            TurnOutcome::Delegated(_) => None,
        }
    }
}
