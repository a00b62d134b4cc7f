//! Rebuilds an [`ExecutionContext`] from persisted state.
//!
//! Used both when a run starts and when it resumes after a required action:
//! the context never outlives one pass of the loop, so everything the planner
//! needs is reloaded from the store and the history provider.

use runloop_core::error::{Error, StoreError};
use runloop_core::run::{RunStatus, StepKind, StepStatus};
use runloop_core::store::{HistoryProvider, RunStore};
use runloop_core::tool::{ToolRegistry, ToolResult};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::context::ExecutionContext;
use crate::settings::EngineSettings;

pub struct ContextBuilder {
    store: Arc<dyn RunStore>,
    history: Arc<dyn HistoryProvider>,
    registry: Arc<ToolRegistry>,
    settings: EngineSettings,
}

impl ContextBuilder {
    pub fn new(
        store: Arc<dyn RunStore>,
        history: Arc<dyn HistoryProvider>,
        registry: Arc<ToolRegistry>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            history,
            registry,
            settings,
        }
    }

    pub async fn build(&self, run_id: &str) -> Result<ExecutionContext, Error> {
        let run = self.store.get_run(run_id).await?;
        if run.status.is_terminal() {
            return Err(StoreError::IllegalTransition {
                from: run.status,
                to: RunStatus::InProgress,
            }
            .into());
        }
        let ctx = ExecutionContext::new(&run, &self.settings);

        let messages = self.history.messages(&run.conversation_id).await?;
        let steps = self.history.steps(&run.conversation_id).await?;

        let results: HashMap<String, ToolResult> = steps
            .iter()
            .filter(|step| step.kind == StepKind::ToolCalls)
            .flat_map(|step| step.results.clone())
            .collect();

        let answered = steps
            .iter()
            .filter(|step| step.run_id == run.id)
            .next_back()
            .is_some_and(|step| {
                step.kind == StepKind::MessageCreation && step.status == StepStatus::Completed
            });
        if answered {
            ctx.mark_message_created();
        }

        if run.tools.is_empty() {
            ctx.set_tools(self.registry.definitions());
        }

        debug!(
            run_id,
            messages = messages.len(),
            results = results.len(),
            answered,
            "Execution context built"
        );
        ctx.record_results(results);
        ctx.set_history(messages);
        Ok(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{EchoTool, definition};
    use runloop_core::message::{Conversation, Message, MessageToolCall};
    use runloop_core::run::NewRun;
    use runloop_core::tool::ToolCall;
    use runloop_store::InMemoryRunStore;

    fn builder(store: &InMemoryRunStore) -> ContextBuilder {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        ContextBuilder::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(registry),
            EngineSettings::default(),
        )
    }

    async fn seeded(store: &InMemoryRunStore, new_run: impl FnOnce(String) -> NewRun) -> String {
        let mut conversation = Conversation::new();
        conversation.push(Message::user("hello"));
        let conversation_id = store.create_conversation(conversation).await;
        store.create_run(new_run(conversation_id)).await.unwrap().id
    }

    #[tokio::test]
    async fn missing_run_is_not_found() {
        let store = InMemoryRunStore::new();
        let err = builder(&store).build("run_missing").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Store(StoreError::NotFound { kind: "run", .. })
        ));
    }

    #[tokio::test]
    async fn terminal_run_cannot_be_rebuilt() {
        let store = InMemoryRunStore::new();
        let run_id = seeded(&store, |c| NewRun::new(c, "m")).await;
        store.to_in_progress(&run_id).await.unwrap();
        store.to_completed(&run_id).await.unwrap();

        let err = builder(&store).build(&run_id).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Store(StoreError::IllegalTransition {
                from: RunStatus::Completed,
                to: RunStatus::InProgress,
            })
        ));
    }

    #[tokio::test]
    async fn tools_default_to_registry() {
        let store = InMemoryRunStore::new();
        let run_id = seeded(&store, |c| NewRun::new(c, "m")).await;
        let ctx = builder(&store).build(&run_id).await.unwrap();
        assert!(ctx.is_tool_declared("echo"));
        assert_eq!(ctx.history().len(), 1);
        assert!(!ctx.is_message_created());
    }

    #[tokio::test]
    async fn declared_tools_are_kept() {
        let store = InMemoryRunStore::new();
        let run_id = seeded(&store, |c| {
            NewRun::new(c, "m").with_tools(vec![definition("lookup")])
        })
        .await;
        let ctx = builder(&store).build(&run_id).await.unwrap();
        assert!(ctx.is_tool_declared("lookup"));
        assert!(!ctx.is_tool_declared("echo"));
    }

    #[tokio::test]
    async fn recorded_results_are_restored() {
        let store = InMemoryRunStore::new();
        let run_id = seeded(&store, |c| NewRun::new(c, "m")).await;
        store.to_in_progress(&run_id).await.unwrap();

        let message = Message::assistant_with_tool_calls(
            "",
            vec![MessageToolCall {
                id: "c1".into(),
                name: "echo".into(),
                arguments: "{}".into(),
            }],
        );
        let calls = vec![ToolCall::new("c1", "echo", serde_json::json!({}))];
        store.start_tool_calls(&run_id, &message, &calls).await.unwrap();
        store
            .finish_tool_call(&run_id, &ToolResult::success("c1", "done"))
            .await
            .unwrap();

        let ctx = builder(&store).build(&run_id).await.unwrap();
        assert_eq!(ctx.tool_result("c1").unwrap().output, "done");
        assert_eq!(ctx.history().len(), 2);
    }

    #[tokio::test]
    async fn finished_message_marks_run_answered() {
        let store = InMemoryRunStore::new();
        let run_id = seeded(&store, |c| NewRun::new(c, "m")).await;
        store.to_in_progress(&run_id).await.unwrap();
        store
            .finish_message_creation(&run_id, &Message::assistant("hi"))
            .await
            .unwrap();

        let ctx = builder(&store).build(&run_id).await.unwrap();
        assert!(ctx.is_message_created());
    }
}
