//! Persistence traits consumed by the run engine.
//!
//! [`RunStore`] durably records run, step, and message transitions. Each call
//! either succeeds or returns an error; the engine never retries them.
//! [`HistoryProvider`] supplies what a context needs to be rebuilt.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::message::Message;
use crate::run::{Run, RunError, RunStep};
use crate::tool::{ToolCall, ToolResult};

#[async_trait]
pub trait RunStore: Send + Sync {
    /// Load a run record.
    async fn get_run(&self, run_id: &str) -> Result<Run, StoreError>;

    async fn to_in_progress(&self, run_id: &str) -> Result<Run, StoreError>;

    async fn to_completed(&self, run_id: &str) -> Result<Run, StoreError>;

    async fn to_failed(&self, run_id: &str, error: &RunError) -> Result<Run, StoreError>;

    async fn to_cancelled(&self, run_id: &str) -> Result<Run, StoreError>;

    async fn to_expired(&self, run_id: &str, error: Option<&RunError>)
    -> Result<Run, StoreError>;

    /// Pause the run until the caller submits outputs for `calls`.
    async fn to_requires_action(
        &self,
        run_id: &str,
        calls: &[ToolCall],
    ) -> Result<Run, StoreError>;

    /// Persist a finished assistant message and its message-creation step.
    ///
    /// A message already stored under the same id is replaced.
    async fn finish_message_creation(
        &self,
        run_id: &str,
        message: &Message,
    ) -> Result<RunStep, StoreError>;

    /// Persist an assistant message requesting tool calls and open its step.
    async fn start_tool_calls(
        &self,
        run_id: &str,
        message: &Message,
        calls: &[ToolCall],
    ) -> Result<RunStep, StoreError>;

    /// Record one tool result. Returns the step once every call in it has a result.
    async fn finish_tool_call(
        &self,
        run_id: &str,
        result: &ToolResult,
    ) -> Result<Option<RunStep>, StoreError>;

    /// Append a streamed content block to an assistant message, creating it if needed.
    async fn add_content(
        &self,
        run_id: &str,
        message_id: &str,
        content: &str,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait HistoryProvider: Send + Sync {
    /// Prior messages of a conversation, oldest first.
    async fn messages(&self, conversation_id: &str) -> Result<Vec<Message>, StoreError>;

    /// Prior steps of every run on a conversation, oldest first.
    async fn steps(&self, conversation_id: &str) -> Result<Vec<RunStep>, StoreError>;
}
