//! Tool dispatcher: runs released tool-call batches.
//!
//! Each batch is split three ways. Calls the run did not declare, or whose
//! arguments are not a JSON object, resolve immediately to an `invalid_tool`
//! error result. Declared calls without a server-side handler are surfaced to
//! the caller as a required action. Everything else runs concurrently on a
//! bounded pool; a handler failure becomes that call's error result.

use futures::future::join_all;
use runloop_core::error::StoreError;
use runloop_core::event::StreamEvent;
use runloop_core::run::{RunError, RunErrorCode};
use runloop_core::store::RunStore;
use runloop_core::tool::{Tool, ToolCall, ToolContext, ToolOutput, ToolRegistry, ToolResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use super::output::ToolOutputChannel;
use crate::context::{ExecutionContext, StepSignal};
use crate::event::RunEvent;

/// How one call of a batch is handled.
enum Disposition {
    Invalid(ToolResult),
    ClientSide(ToolCall),
    Server(ToolCall, Arc<dyn Tool>),
}

pub struct ToolExecutor {
    ctx: Arc<ExecutionContext>,
    store: Arc<dyn RunStore>,
    registry: Arc<ToolRegistry>,
    pool: Arc<Semaphore>,
    poll_interval: Duration,
}

impl ToolExecutor {
    pub fn new(
        ctx: Arc<ExecutionContext>,
        store: Arc<dyn RunStore>,
        registry: Arc<ToolRegistry>,
        pool: Arc<Semaphore>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            ctx,
            store,
            registry,
            pool,
            poll_interval,
        }
    }

    /// Handle batches until the context ends.
    pub async fn run(self) {
        while self.ctx.tool_call_await().await {
            let batch = self.ctx.take_ready_tool_calls();
            if batch.is_empty() {
                continue;
            }
            if let Err(e) = self.run_batch(batch).await {
                error!(run_id = self.ctx.run_id(), error = %e, "Tool batch failed");
                self.ctx
                    .set_error(RunError::new(RunErrorCode::ServerError, e.to_string()));
                self.ctx.signal(StepSignal::Failed);
            }
        }
        debug!(run_id = self.ctx.run_id(), "Tool dispatcher stopped");
    }

    fn classify(&self, call: ToolCall) -> Disposition {
        if !self.ctx.is_tool_declared(&call.name) {
            warn!(run_id = self.ctx.run_id(), tool = %call.name, "Model called an undeclared tool");
            return Disposition::Invalid(ToolResult::failure(
                &call.id,
                format!("invalid_tool: tool '{}' is not available", call.name),
            ));
        }
        if !call.arguments.is_object() {
            warn!(run_id = self.ctx.run_id(), tool = %call.name, "Malformed tool arguments");
            return Disposition::Invalid(ToolResult::failure(
                &call.id,
                format!("invalid_tool: arguments for '{}' are not a JSON object", call.name),
            ));
        }
        match self.registry.get(&call.name) {
            Some(tool) => Disposition::Server(call, tool),
            None => Disposition::ClientSide(call),
        }
    }

    async fn run_batch(&self, batch: Vec<ToolCall>) -> Result<(), StoreError> {
        let mut results = Vec::new();
        let mut client_side = Vec::new();
        let mut server = Vec::new();
        for call in batch {
            match self.classify(call) {
                Disposition::Invalid(result) => results.push(result),
                Disposition::ClientSide(call) => client_side.push(call),
                Disposition::Server(call, tool) => server.push((call, tool)),
            }
        }

        let answers_directly = results.is_empty()
            && client_side.is_empty()
            && !server.is_empty()
            && server.iter().all(|(_, tool)| tool.is_final());

        info!(
            run_id = self.ctx.run_id(),
            server = server.len(),
            client_side = client_side.len(),
            invalid = results.len(),
            "Dispatching tool batch"
        );

        let channel = server
            .iter()
            .any(|(_, tool)| tool.is_final())
            .then(|| Arc::new(ToolOutputChannel::start(self.ctx.clone(), self.poll_interval)));

        let handles: Vec<_> = server
            .into_iter()
            .map(|(call, tool)| {
                let label = (call.id.clone(), tool.is_final());
                let handle = tokio::spawn(execute_one(
                    self.ctx.clone(),
                    self.pool.clone(),
                    channel.clone(),
                    call,
                    tool,
                ));
                (label, handle)
            })
            .collect();
        let (labels, handles): (Vec<(String, bool)>, Vec<_>) = handles.into_iter().unzip();
        for ((call_id, is_final), joined) in labels.into_iter().zip(join_all(handles).await) {
            let result = match joined {
                Ok(result) => result,
                Err(e) => {
                    error!(run_id = self.ctx.run_id(), tool_call_id = %call_id, error = %e, "Tool task aborted");
                    // An aborted producer never reported its end to the channel.
                    if is_final && let Some(channel) = &channel {
                        channel.finish(&call_id);
                    }
                    ToolResult::failure(&call_id, format!("tool_execution_error: {e}"))
                }
            };
            results.push(result);
        }

        if let Some(channel) = channel {
            channel.end().await;
        }

        let run_id = self.ctx.run_id().to_string();
        for result in results {
            self.ctx.resolve_tool_call(result.clone());
            if let Some(step) = self.store.finish_tool_call(&run_id, &result).await? {
                self.ctx
                    .publish(RunEvent::Lifecycle(StreamEvent::RunStepStatusChanged { step }));
            }
        }

        if !client_side.is_empty() {
            info!(%run_id, calls = client_side.len(), "Tool batch requires caller action");
            self.ctx.set_requires_action(client_side);
            self.ctx.signal(StepSignal::ToolsDone);
        } else if answers_directly {
            // The assembler persists the streamed answer and signals.
            self.ctx.publish(RunEvent::ToolAnswerFinished);
        } else {
            self.ctx.append_tool_results();
            self.ctx.signal(StepSignal::ToolsDone);
        }
        Ok(())
    }
}

async fn execute_one(
    ctx: Arc<ExecutionContext>,
    pool: Arc<Semaphore>,
    channel: Option<Arc<ToolOutputChannel>>,
    call: ToolCall,
    tool: Arc<dyn Tool>,
) -> ToolResult {
    let streams = tool.is_final() && channel.is_some();
    let output = match &channel {
        Some(channel) if streams => channel.output_for(&call.id),
        _ => ToolOutput::detached(&call.id),
    };

    let result = match pool.acquire_owned().await {
        Ok(_permit) => {
            let context = ToolContext {
                run_id: ctx.run_id().to_string(),
                conversation_id: ctx.conversation_id().to_string(),
                user: ctx.user().map(str::to_string),
                files: ctx.tool_resources(&call.name),
            };
            let start = std::time::Instant::now();
            let outcome = tool.execute(&call, &context, output).await;
            let duration_ms = start.elapsed().as_millis() as u64;
            match outcome {
                Ok(mut result) => {
                    debug!(tool = %call.name, tool_call_id = %call.id, duration_ms, "Tool finished");
                    result.call_id.clone_from(&call.id);
                    result
                }
                Err(e) => {
                    warn!(tool = %call.name, tool_call_id = %call.id, error = %e, "Tool execution failed");
                    ToolResult::failure(&call.id, format!("tool_execution_error: {e}"))
                }
            }
        }
        Err(e) => ToolResult::failure(&call.id, format!("tool_execution_error: {e}")),
    };

    if streams && let Some(channel) = &channel {
        channel.finish(&call.id);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::EngineSettings;
    use crate::test_helpers::{EchoTool, FailingTool, FinalTool, PanickingTool, definition};
    use runloop_core::message::{Conversation, Message, MessageToolCall};
    use runloop_core::run::NewRun;
    use runloop_store::InMemoryRunStore;

    struct Fixture {
        ctx: Arc<ExecutionContext>,
        store: InMemoryRunStore,
    }

    async fn fixture(declared: &[&str], calls: &[(&str, &str, &str)]) -> Fixture {
        let store = InMemoryRunStore::new();
        let mut conversation = Conversation::new();
        conversation.push(Message::user("go"));
        let conversation_id = store.create_conversation(conversation).await;
        let run = store
            .create_run(
                NewRun::new(conversation_id, "m")
                    .with_tools(declared.iter().map(|n| definition(n)).collect()),
            )
            .await
            .unwrap();
        store.to_in_progress(&run.id).await.unwrap();

        let ctx = Arc::new(ExecutionContext::new(&run, &EngineSettings::default()));
        let message = Message::assistant_with_tool_calls(
            "",
            calls
                .iter()
                .map(|(id, name, args)| MessageToolCall {
                    id: id.to_string(),
                    name: name.to_string(),
                    arguments: args.to_string(),
                })
                .collect(),
        );
        let tool_calls: Vec<ToolCall> = message
            .tool_calls
            .iter()
            .map(ToolCall::from_message_call)
            .collect();
        store
            .start_tool_calls(&run.id, &message, &tool_calls)
            .await
            .unwrap();
        ctx.set_messages(vec![Message::user("go"), message]);
        ctx.add_tool_calls(tool_calls);
        Fixture { ctx, store }
    }

    fn registry() -> Arc<ToolRegistry> {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        registry.register(Arc::new(FailingTool));
        registry.register(Arc::new(FinalTool::new("answer", &["Hello", " world"])));
        registry.register(Arc::new(FinalTool::new("chart", &["[chart]"])));
        registry.register(Arc::new(PanickingTool));
        Arc::new(registry)
    }

    async fn dispatch(fixture: &Fixture) -> StepSignal {
        let executor = ToolExecutor::new(
            fixture.ctx.clone(),
            Arc::new(fixture.store.clone()),
            registry(),
            Arc::new(Semaphore::new(2)),
            Duration::from_millis(5),
        );
        let worker = tokio::spawn(executor.run());
        let rx = fixture.ctx.arm_runner();
        assert!(fixture.ctx.release_tool_calls() > 0);
        let signal = fixture.ctx.runner_await(rx).await;
        fixture.ctx.end();
        worker.await.unwrap();
        signal
    }

    #[tokio::test]
    async fn results_are_appended_in_call_order() {
        let fixture = fixture(
            &["echo"],
            &[("c1", "echo", r#"{"text":"one"}"#), ("c2", "echo", r#"{"text":"two"}"#)],
        )
        .await;
        assert_eq!(dispatch(&fixture).await, StepSignal::ToolsDone);

        let messages = fixture.ctx.messages();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[2].content, "echo: one");
        assert_eq!(messages[3].content, "echo: two");
        assert!(!fixture.ctx.has_pending_tool_calls());

        let steps = fixture.store.run_steps(fixture.ctx.run_id()).await;
        assert!(steps[0].all_results_recorded());
    }

    #[tokio::test]
    async fn failures_are_fed_back_not_fatal() {
        let fixture = fixture(&["echo", "fail"], &[("c1", "fail", "{}"), ("c2", "echo", "{}")]).await;
        assert_eq!(dispatch(&fixture).await, StepSignal::ToolsDone);

        let failed = fixture.ctx.tool_result("c1").unwrap();
        assert!(failed.error.unwrap().starts_with("tool_execution_error"));
        assert!(fixture.ctx.tool_result("c2").unwrap().error.is_none());
        assert!(!fixture.ctx.has_error());
    }

    #[tokio::test]
    async fn undeclared_and_malformed_calls_are_invalid() {
        let fixture = fixture(
            &["echo"],
            &[("c1", "fail", "{}"), ("c2", "echo", "not json"), ("c3", "echo", "{}")],
        )
        .await;
        assert_eq!(dispatch(&fixture).await, StepSignal::ToolsDone);

        for id in ["c1", "c2"] {
            let result = fixture.ctx.tool_result(id).unwrap();
            assert!(result.error.unwrap().starts_with("invalid_tool"), "{id}");
        }
        assert!(!fixture.ctx.tool_result("c3").unwrap().is_error());
    }

    #[tokio::test]
    async fn unregistered_tool_requires_action() {
        let fixture = fixture(
            &["echo", "lookup_order"],
            &[
                ("c1", "echo", "{}"),
                ("c2", "lookup_order", r#"{"id":7}"#),
                ("c3", "echo", "{}"),
            ],
        )
        .await;
        assert_eq!(dispatch(&fixture).await, StepSignal::ToolsDone);

        let required: Vec<String> = fixture
            .ctx
            .requires_action()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(required, vec!["c2".to_string()]);
        assert!(fixture.ctx.has_tool_result("c1"));
        assert!(fixture.ctx.has_tool_result("c3"));
        assert!(!fixture.ctx.has_tool_result("c2"));
    }

    #[tokio::test]
    async fn all_final_batch_streams_the_answer() {
        let fixture = fixture(&["answer", "chart"], &[("c1", "answer", "{}"), ("c2", "chart", "{}")]).await;
        let mut events = fixture.ctx.take_event_receiver().unwrap();

        let executor = ToolExecutor::new(
            fixture.ctx.clone(),
            Arc::new(fixture.store.clone()),
            registry(),
            Arc::new(Semaphore::new(2)),
            Duration::from_millis(5),
        );
        let worker = tokio::spawn(executor.run());
        fixture.ctx.release_tool_calls();

        let mut outputs = Vec::new();
        loop {
            match events.recv().await.unwrap() {
                RunEvent::ToolOutput { tool_call_id, .. } => outputs.push(tool_call_id),
                RunEvent::ToolTurnFinished { tool_call_id } => {
                    outputs.push(format!("{tool_call_id}:end"))
                }
                RunEvent::ToolAnswerFinished => break,
                _ => {}
            }
        }
        fixture.ctx.end();
        worker.await.unwrap();

        assert_eq!(outputs.len(), 5);
        let first = outputs[0].clone();
        let split = if first == "c1" { 3 } else { 2 };
        assert!(outputs[..split].iter().take(split - 1).all(|o| o == &first));
        assert_eq!(outputs[split - 1], format!("{first}:end"));
        assert!(outputs[4].ends_with(":end"));
    }

    #[tokio::test]
    async fn panicking_final_tool_does_not_stall_the_batch() {
        let fixture = fixture(
            &["boom", "answer", "echo"],
            &[("c1", "boom", "{}"), ("c2", "answer", "{}"), ("c3", "echo", "{}")],
        )
        .await;
        let mut events = fixture.ctx.take_event_receiver().unwrap();

        let signal = tokio::time::timeout(Duration::from_secs(5), dispatch(&fixture))
            .await
            .expect("dispatcher stalled on a panicked tool");
        assert_eq!(signal, StepSignal::ToolsDone);

        let failed = fixture.ctx.tool_result("c1").unwrap();
        assert!(failed.error.unwrap().starts_with("tool_execution_error"));
        assert_eq!(fixture.ctx.tool_result("c2").unwrap().output, "Hello world");
        assert!(!fixture.ctx.has_error());

        let mut finished = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let RunEvent::ToolTurnFinished { tool_call_id } = event {
                finished.push(tool_call_id);
            }
        }
        finished.sort();
        assert_eq!(finished, vec!["c1".to_string(), "c2".to_string()]);
    }
}
