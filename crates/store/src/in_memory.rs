//! In-memory store: useful for testing and ephemeral sessions.
//!
//! Holds conversations, runs, and run steps behind one lock and enforces the
//! run-status transition table on every write.

use async_trait::async_trait;
use chrono::Utc;
use runloop_core::error::StoreError;
use runloop_core::message::{Conversation, Message, Role};
use runloop_core::run::{NewRun, Run, RunError, RunStatus, RunStep, StepKind, StepStatus};
use runloop_core::store::{HistoryProvider, RunStore};
use runloop_core::tool::{ToolCall, ToolResult};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
struct StoreState {
    conversations: HashMap<String, Conversation>,
    runs: HashMap<String, Run>,
    /// Insertion order doubles as creation order
    steps: Vec<RunStep>,
}

/// A store that keeps everything in process memory.
#[derive(Clone, Default)]
pub struct InMemoryRunStore {
    state: Arc<RwLock<StoreState>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a conversation, returning its id.
    pub async fn create_conversation(&self, conversation: Conversation) -> String {
        let id = conversation.id.clone();
        self.state
            .write()
            .await
            .conversations
            .insert(id.clone(), conversation);
        id
    }

    pub async fn conversation(&self, conversation_id: &str) -> Option<Conversation> {
        self.state
            .read()
            .await
            .conversations
            .get(conversation_id)
            .cloned()
    }

    pub async fn append_message(
        &self,
        conversation_id: &str,
        message: Message,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let conversation = state
            .conversations
            .get_mut(conversation_id)
            .ok_or_else(|| StoreError::conversation_not_found(conversation_id))?;
        conversation.push(message);
        Ok(())
    }

    /// Create a queued run on an existing conversation.
    pub async fn create_run(&self, new_run: NewRun) -> Result<Run, StoreError> {
        let mut state = self.state.write().await;
        if !state.conversations.contains_key(&new_run.conversation_id) {
            return Err(StoreError::conversation_not_found(&new_run.conversation_id));
        }
        let run = new_run.into_run();
        state.runs.insert(run.id.clone(), run.clone());
        tracing::debug!(run_id = %run.id, "Run created");
        Ok(run)
    }

    /// Steps recorded for one run, oldest first.
    pub async fn run_steps(&self, run_id: &str) -> Vec<RunStep> {
        self.state
            .read()
            .await
            .steps
            .iter()
            .filter(|s| s.run_id == run_id)
            .cloned()
            .collect()
    }

    async fn transition<F>(&self, run_id: &str, to: RunStatus, apply: F) -> Result<Run, StoreError>
    where
        F: FnOnce(&mut Run) + Send,
    {
        let mut state = self.state.write().await;
        let run = state
            .runs
            .get_mut(run_id)
            .ok_or_else(|| StoreError::run_not_found(run_id))?;

        if !run.status.can_transition_to(to) {
            return Err(StoreError::IllegalTransition {
                from: run.status,
                to,
            });
        }

        let from = run.status;
        run.status = to;
        apply(run);
        if to.is_terminal() {
            run.finished_at = Some(Utc::now());
        }
        let snapshot = run.clone();

        let closed = match to {
            RunStatus::Failed => Some(StepStatus::Failed),
            RunStatus::Cancelled => Some(StepStatus::Cancelled),
            RunStatus::Expired => Some(StepStatus::Expired),
            _ => None,
        };
        if let Some(status) = closed {
            for step in state
                .steps
                .iter_mut()
                .filter(|s| s.run_id == run_id && s.status == StepStatus::InProgress)
            {
                step.status = status;
                step.completed_at = Some(Utc::now());
            }
        }

        tracing::debug!(run_id, %from, %to, "Run status changed");
        Ok(snapshot)
    }

    fn conversation_of<'a>(
        state: &'a mut StoreState,
        run_id: &str,
    ) -> Result<&'a mut Conversation, StoreError> {
        let conversation_id = state
            .runs
            .get(run_id)
            .map(|r| r.conversation_id.clone())
            .ok_or_else(|| StoreError::run_not_found(run_id))?;
        state
            .conversations
            .get_mut(&conversation_id)
            .ok_or_else(|| StoreError::conversation_not_found(conversation_id))
    }

    fn upsert_message(conversation: &mut Conversation, message: &Message) {
        match conversation.messages.iter_mut().find(|m| m.id == message.id) {
            Some(existing) => *existing = message.clone(),
            None => conversation.messages.push(message.clone()),
        }
        conversation.updated_at = Utc::now();
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn get_run(&self, run_id: &str) -> Result<Run, StoreError> {
        self.state
            .read()
            .await
            .runs
            .get(run_id)
            .cloned()
            .ok_or_else(|| StoreError::run_not_found(run_id))
    }

    async fn to_in_progress(&self, run_id: &str) -> Result<Run, StoreError> {
        self.transition(run_id, RunStatus::InProgress, |run| {
            run.started_at.get_or_insert_with(Utc::now);
            run.required_action.clear();
        })
        .await
    }

    async fn to_completed(&self, run_id: &str) -> Result<Run, StoreError> {
        self.transition(run_id, RunStatus::Completed, |_| {}).await
    }

    async fn to_failed(&self, run_id: &str, error: &RunError) -> Result<Run, StoreError> {
        let error = error.clone();
        self.transition(run_id, RunStatus::Failed, move |run| {
            run.last_error = Some(error);
        })
        .await
    }

    async fn to_cancelled(&self, run_id: &str) -> Result<Run, StoreError> {
        self.transition(run_id, RunStatus::Cancelled, |_| {}).await
    }

    async fn to_expired(
        &self,
        run_id: &str,
        error: Option<&RunError>,
    ) -> Result<Run, StoreError> {
        let error = error.cloned();
        self.transition(run_id, RunStatus::Expired, move |run| {
            if error.is_some() {
                run.last_error = error;
            }
        })
        .await
    }

    async fn to_requires_action(
        &self,
        run_id: &str,
        calls: &[ToolCall],
    ) -> Result<Run, StoreError> {
        let calls = calls.to_vec();
        self.transition(run_id, RunStatus::RequiresAction, move |run| {
            run.required_action = calls;
        })
        .await
    }

    async fn finish_message_creation(
        &self,
        run_id: &str,
        message: &Message,
    ) -> Result<RunStep, StoreError> {
        let mut state = self.state.write().await;
        let conversation = Self::conversation_of(&mut state, run_id)?;
        Self::upsert_message(conversation, message);

        let mut step = RunStep::new(run_id, StepKind::MessageCreation);
        step.message_id = Some(message.id.clone());
        step.complete();
        state.steps.push(step.clone());
        Ok(step)
    }

    async fn start_tool_calls(
        &self,
        run_id: &str,
        message: &Message,
        calls: &[ToolCall],
    ) -> Result<RunStep, StoreError> {
        let mut state = self.state.write().await;
        let conversation = Self::conversation_of(&mut state, run_id)?;
        Self::upsert_message(conversation, message);

        let mut step = RunStep::new(run_id, StepKind::ToolCalls);
        step.message_id = Some(message.id.clone());
        step.tool_calls = calls.to_vec();
        state.steps.push(step.clone());
        Ok(step)
    }

    async fn finish_tool_call(
        &self,
        run_id: &str,
        result: &ToolResult,
    ) -> Result<Option<RunStep>, StoreError> {
        let mut state = self.state.write().await;
        let step = state
            .steps
            .iter_mut()
            .rev()
            .find(|s| {
                s.run_id == run_id
                    && s.kind == StepKind::ToolCalls
                    && s.tool_calls.iter().any(|tc| tc.id == result.call_id)
            })
            .ok_or_else(|| StoreError::NotFound {
                kind: "tool call",
                id: result.call_id.clone(),
            })?;

        step.results.insert(result.call_id.clone(), result.clone());
        if step.status == StepStatus::InProgress && step.all_results_recorded() {
            step.complete();
            return Ok(Some(step.clone()));
        }
        Ok(None)
    }

    async fn add_content(
        &self,
        run_id: &str,
        message_id: &str,
        content: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let conversation = Self::conversation_of(&mut state, run_id)?;
        match conversation.messages.iter_mut().find(|m| m.id == message_id) {
            Some(message) => message.content.push_str(content),
            None => {
                let mut message = Message::assistant(content);
                message.id = message_id.to_string();
                conversation.messages.push(message);
            }
        }
        conversation.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl HistoryProvider for InMemoryRunStore {
    async fn messages(&self, conversation_id: &str) -> Result<Vec<Message>, StoreError> {
        let state = self.state.read().await;
        let conversation = state
            .conversations
            .get(conversation_id)
            .ok_or_else(|| StoreError::conversation_not_found(conversation_id))?;
        Ok(conversation.messages.clone())
    }

    async fn steps(&self, conversation_id: &str) -> Result<Vec<RunStep>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .steps
            .iter()
            .filter(|s| {
                state
                    .runs
                    .get(&s.run_id)
                    .is_some_and(|r| r.conversation_id == conversation_id)
            })
            .cloned()
            .collect())
    }
}

impl std::fmt::Debug for InMemoryRunStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryRunStore").finish_non_exhaustive()
    }
}

/// Messages of a conversation with the given role, in order.
pub fn messages_with_role(conversation: &Conversation, role: Role) -> Vec<&Message> {
    conversation
        .messages
        .iter()
        .filter(|m| m.role == role)
        .collect()
}
