//! Run, run-step, and run-error types.
//!
//! A run is one execution of the plan/act loop over a conversation. Its
//! status moves through a fixed transition table:
//!
//! ```text
//! queued → in_progress ⇄ requires_action
//!              ↓
//!   completed | failed | cancelled | expired   (absorbing)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use crate::provider::ToolDefinition;
use crate::tool::{ToolCall, ToolResult};

/// Externally visible status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    RequiresAction,
    Completed,
    Failed,
    Cancelled,
    Expired,
}

impl RunStatus {
    /// Terminal statuses are absorbing.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Expired
        )
    }

    /// Whether `self → next` is a legal transition.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        use RunStatus::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (Queued, InProgress) => true,
            (InProgress, RequiresAction) | (RequiresAction, InProgress) => true,
            // A queued or paused run may still be cancelled, expired or failed
            // before the loop picks it up again.
            (_, Completed) => self == InProgress,
            (_, Failed | Cancelled | Expired) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::RequiresAction => "requires_action",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error taxonomy recorded on a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunErrorCode {
    /// Model/provider failure
    LlmError,
    /// A tool handler failed
    ToolExecutionError,
    /// The model referenced an undeclared or malformed tool call
    InvalidTool,
    /// Unexpected internal fault
    ServerError,
    ExceededMaxSteps,
    /// Nothing to send to the model
    BadRequest,
    /// Referenced run or conversation is missing
    NotFound,
}

impl RunErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LlmError => "llm_error",
            Self::ToolExecutionError => "tool_execution_error",
            Self::InvalidTool => "invalid_tool",
            Self::ServerError => "server_error",
            Self::ExceededMaxSteps => "exceeded_max_steps",
            Self::BadRequest => "bad_request",
            Self::NotFound => "not_found",
        }
    }
}

impl fmt::Display for RunErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The last error of a run: a code plus a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub code: RunErrorCode,
    pub message: String,
}

impl RunError {
    pub fn new(code: RunErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// A persisted run record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub conversation_id: String,
    pub assistant_id: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    pub status: RunStatus,

    /// Run-level system instructions, prepended when the history has none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,

    /// Tools declared for this run (sent to the model)
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,

    /// Tool name → file ids bound to that tool
    #[serde(default)]
    pub tool_resources: HashMap<String, Vec<String>>,

    /// Per-run step cap; falls back to the engine default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<u32>,

    /// Per-run truncation switch; falls back to the engine default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub truncation: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<RunError>,

    /// Tool calls the caller must resolve (status `requires_action`)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_action: Vec<ToolCall>,

    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Parameters for creating a run.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub conversation_id: String,
    pub assistant_id: String,
    pub model: String,
    pub user: Option<String>,
    pub instructions: Option<String>,
    pub tools: Vec<ToolDefinition>,
    pub tool_resources: HashMap<String, Vec<String>>,
    pub max_steps: Option<u32>,
    pub truncation: Option<bool>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl NewRun {
    pub fn new(conversation_id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            assistant_id: "default".into(),
            model: model.into(),
            user: None,
            instructions: None,
            tools: Vec::new(),
            tool_resources: HashMap::new(),
            max_steps: None,
            truncation: None,
            expires_at: None,
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_tool_resources(mut self, tool: impl Into<String>, files: Vec<String>) -> Self {
        self.tool_resources.insert(tool.into(), files);
        self
    }

    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = Some(max_steps);
        self
    }

    pub fn with_truncation(mut self, enabled: bool) -> Self {
        self.truncation = Some(enabled);
        self
    }

    pub fn with_expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Materialize the queued run record.
    pub fn into_run(self) -> Run {
        Run {
            id: format!("run_{}", Uuid::new_v4().simple()),
            conversation_id: self.conversation_id,
            assistant_id: self.assistant_id,
            model: self.model,
            user: self.user,
            status: RunStatus::Queued,
            instructions: self.instructions,
            tools: self.tools,
            tool_resources: self.tool_resources,
            max_steps: self.max_steps,
            truncation: self.truncation,
            last_error: None,
            required_action: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            expires_at: self.expires_at,
            finished_at: None,
        }
    }
}

/// What a run step records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    MessageCreation,
    ToolCalls,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    InProgress,
    Completed,
    Failed,
    Cancelled,
    Expired,
}

/// A durable unit of run progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStep {
    pub id: String,
    pub run_id: String,
    pub kind: StepKind,
    pub status: StepStatus,

    /// The assistant message this step created or that requested the calls
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,

    /// Results recorded so far, keyed by tool call id
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub results: HashMap<String, ToolResult>,

    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunStep {
    pub fn new(run_id: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: format!("step_{}", Uuid::new_v4().simple()),
            run_id: run_id.into(),
            kind,
            status: StepStatus::InProgress,
            message_id: None,
            tool_calls: Vec::new(),
            results: HashMap::new(),
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Whether every tool call in this step has a recorded result.
    pub fn all_results_recorded(&self) -> bool {
        self.tool_calls
            .iter()
            .all(|tc| self.results.contains_key(&tc.id))
    }

    pub fn complete(&mut self) {
        self.status = StepStatus::Completed;
        self.completed_at = Some(Utc::now());
    }
}
