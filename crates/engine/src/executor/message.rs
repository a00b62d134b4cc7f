//! Output assembler: the single consumer of a run's event queue.
//!
//! Every visible byte of a run passes through here. LLM deltas and final-tool
//! output are accumulated into the in-progress assistant message and
//! re-emitted as indexed [`StreamEvent::MessageDelta`]s; turn markers persist
//! the finished message and wake the driver.

use runloop_core::event::{ContentDelta, MessageStatus, StreamEvent};
use runloop_core::message::{Message, MessageToolCall};
use runloop_core::provider::StreamChunk;
use runloop_core::run::{RunError, RunErrorCode, RunStep};
use runloop_core::store::RunStore;
use runloop_core::tool::ToolCall;
use runloop_core::StoreError;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use crate::context::{ExecutionContext, StepSignal};
use crate::event::RunEvent;

/// Tool-call fragments sharing one stream index.
#[derive(Debug, Default)]
struct PartialCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

/// The assistant message currently being assembled.
#[derive(Debug, Default)]
struct Assembly {
    message_id: Option<String>,
    /// Content blocks already flushed to the store
    blocks: Vec<String>,
    text: String,
    reasoning: String,
    tool_text: String,
    calls: BTreeMap<usize, PartialCall>,
    index: usize,
}

impl Assembly {
    fn content(&self) -> String {
        let mut content = self.blocks.concat();
        content.push_str(&self.text);
        content
    }

    fn tool_calls(&self) -> Vec<MessageToolCall> {
        self.calls
            .values()
            .filter_map(|partial| {
                let name = partial.name.clone()?;
                Some(MessageToolCall {
                    id: partial
                        .id
                        .clone()
                        .unwrap_or_else(|| format!("call_{}", Uuid::new_v4().simple())),
                    name,
                    arguments: partial.arguments.clone(),
                })
            })
            .collect()
    }
}

pub struct MessageExecutor {
    ctx: Arc<ExecutionContext>,
    store: Arc<dyn RunStore>,
    out: mpsc::Sender<StreamEvent>,
    flush_timeout: Duration,
    assembly: Assembly,
    detached: bool,
}

impl MessageExecutor {
    pub fn new(
        ctx: Arc<ExecutionContext>,
        store: Arc<dyn RunStore>,
        out: mpsc::Sender<StreamEvent>,
        flush_timeout: Duration,
    ) -> Self {
        Self {
            ctx,
            store,
            out,
            flush_timeout,
            assembly: Assembly::default(),
            detached: false,
        }
    }

    /// Consume events until the done marker, or until the context has ended
    /// and no done marker arrives within the flush timeout.
    pub async fn run(mut self) {
        let Some(mut rx) = self.ctx.take_event_receiver() else {
            warn!(run_id = self.ctx.run_id(), "Event queue already taken");
            return;
        };

        let mut ending = false;
        loop {
            let event = if ending {
                match tokio::time::timeout(self.flush_timeout, rx.recv()).await {
                    Ok(event) => event,
                    Err(_) => {
                        warn!(run_id = self.ctx.run_id(), "No done marker after end");
                        break;
                    }
                }
            } else {
                tokio::select! {
                    biased;
                    event = rx.recv() => event,
                    _ = self.ctx.ended() => {
                        ending = true;
                        continue;
                    }
                }
            };

            let Some(event) = event else {
                break;
            };
            trace!(run_id = self.ctx.run_id(), kind = event.kind(), "Assembling event");
            if !self.handle(event).await {
                break;
            }
        }
        debug!(run_id = self.ctx.run_id(), "Output assembler stopped");
    }

    /// Returns false once the stream is complete.
    async fn handle(&mut self, event: RunEvent) -> bool {
        match event {
            RunEvent::Lifecycle(event) => self.emit(event).await,
            RunEvent::LlmDelta(chunk) => self.on_llm_delta(chunk).await,
            RunEvent::LlmTurnFinished => {
                let signal = match self.finish_llm_turn().await {
                    Ok(()) => StepSignal::LlmDone,
                    Err(e) => self.fail(e),
                };
                self.ctx.signal(signal);
            }
            RunEvent::LlmTurnFailed => self.abandon_turn().await,
            RunEvent::ToolOutput {
                tool_call_id,
                delta,
            } => self.on_tool_output(&tool_call_id, delta).await,
            RunEvent::ToolTurnFinished { tool_call_id } => {
                if let Err(e) = self.finish_tool_turn(&tool_call_id).await {
                    self.fail(e);
                }
            }
            RunEvent::ToolAnswerFinished => {
                let signal = match self.finish_tool_answer().await {
                    Ok(()) => StepSignal::ToolsDone,
                    Err(e) => self.fail(e),
                };
                self.ctx.signal(signal);
            }
            RunEvent::Error(error) => self.emit(StreamEvent::Error { error }).await,
            RunEvent::Done { ack } => {
                self.emit(StreamEvent::Done).await;
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
                return false;
            }
        }
        true
    }

    async fn emit(&mut self, event: StreamEvent) {
        if self.detached {
            return;
        }
        if self.out.send(event).await.is_err() {
            debug!(run_id = self.ctx.run_id(), "Event receiver dropped; discarding output");
            self.detached = true;
        }
    }

    fn fail(&self, e: StoreError) -> StepSignal {
        error!(run_id = self.ctx.run_id(), error = %e, "Failed to persist assistant output");
        self.ctx
            .set_error(RunError::new(RunErrorCode::ServerError, e.to_string()));
        StepSignal::Failed
    }

    /// The id of the message being assembled, opening it if needed.
    async fn message_id(&mut self) -> String {
        if let Some(id) = &self.assembly.message_id {
            return id.clone();
        }
        let id = Uuid::new_v4().to_string();
        self.assembly.message_id = Some(id.clone());
        self.emit(StreamEvent::MessageStatusChanged {
            message_id: id.clone(),
            status: MessageStatus::InProgress,
        })
        .await;
        id
    }

    async fn delta(&mut self, delta: ContentDelta) {
        let message_id = self.message_id().await;
        let index = self.assembly.index;
        self.emit(StreamEvent::MessageDelta {
            message_id,
            index,
            delta,
        })
        .await;
    }

    async fn step_changed(&mut self, step: RunStep) {
        self.emit(StreamEvent::RunStepStatusChanged { step }).await;
    }

    async fn close_message(&mut self, status: MessageStatus) {
        if let Some(message_id) = self.assembly.message_id.take() {
            self.emit(StreamEvent::MessageStatusChanged { message_id, status })
                .await;
        }
        self.assembly = Assembly::default();
    }

    // ── LLM turns ──

    async fn on_llm_delta(&mut self, chunk: StreamChunk) {
        if let Some(reasoning) = chunk.reasoning.filter(|r| !r.is_empty()) {
            self.assembly.reasoning.push_str(&reasoning);
            self.delta(ContentDelta::Reasoning { text: reasoning }).await;
        }
        if let Some(text) = chunk.content.filter(|c| !c.is_empty()) {
            self.assembly.text.push_str(&text);
            self.delta(ContentDelta::Text { text }).await;
        }
        for fragment in chunk.tool_calls {
            let partial = self.assembly.calls.entry(fragment.index).or_default();
            if fragment.id.is_some() {
                partial.id.clone_from(&fragment.id);
            }
            if fragment.name.is_some() {
                partial.name.clone_from(&fragment.name);
            }
            partial.arguments.push_str(&fragment.arguments);
            self.delta(ContentDelta::ToolCall {
                index: fragment.index,
                id: fragment.id,
                name: fragment.name,
                arguments: fragment.arguments,
            })
            .await;
        }
    }

    async fn finish_llm_turn(&mut self) -> Result<(), StoreError> {
        let message_id = self.message_id().await;
        let calls = self.assembly.tool_calls();
        let content = self.assembly.content();

        let mut message = if calls.is_empty() {
            Message::assistant(content)
        } else {
            Message::assistant_with_tool_calls(content, calls)
        };
        message.id = message_id;
        if !self.assembly.reasoning.is_empty() {
            message.reasoning = Some(self.assembly.reasoning.clone());
        }

        let run_id = self.ctx.run_id().to_string();
        if message.has_tool_calls() {
            let calls: Vec<ToolCall> = message
                .tool_calls
                .iter()
                .map(ToolCall::from_message_call)
                .collect();
            debug!(%run_id, tool_calls = calls.len(), "Model requested tool calls");
            let step = self.store.start_tool_calls(&run_id, &message, &calls).await?;
            self.ctx.push_message(message);
            self.ctx.add_tool_calls(calls);
            self.step_changed(step).await;
        } else {
            let step = self.store.finish_message_creation(&run_id, &message).await?;
            self.ctx.push_message(message);
            self.ctx.mark_message_created();
            self.step_changed(step).await;
        }

        self.close_message(MessageStatus::Completed).await;
        Ok(())
    }

    /// Close a message whose LLM call broke off. Streamed content is kept.
    async fn abandon_turn(&mut self) {
        if let Some(message_id) = self.assembly.message_id.clone() {
            let content = self.assembly.content();
            if !self.assembly.text.is_empty()
                && let Err(e) = self
                    .store
                    .add_content(self.ctx.run_id(), &message_id, &self.assembly.text)
                    .await
            {
                warn!(run_id = self.ctx.run_id(), error = %e, "Failed to keep partial content");
            }
            debug!(
                run_id = self.ctx.run_id(),
                chars = content.len(),
                "Closing incomplete message"
            );
        }
        self.close_message(MessageStatus::Incomplete).await;
    }

    // ── Final-tool output ──

    async fn on_tool_output(&mut self, tool_call_id: &str, delta: ContentDelta) {
        trace!(run_id = self.ctx.run_id(), tool_call_id, "Relaying tool output");
        match &delta {
            ContentDelta::ImageRef { file_id } => {
                self.assembly.tool_text.push_str(&format!("![image]({file_id})"));
            }
            other => {
                if let Some(text) = other.text() {
                    self.assembly.tool_text.push_str(text);
                }
            }
        }
        self.delta(delta).await;
    }

    async fn finish_tool_turn(&mut self, tool_call_id: &str) -> Result<(), StoreError> {
        let message_id = self.message_id().await;
        let block = std::mem::take(&mut self.assembly.tool_text);
        debug!(
            run_id = self.ctx.run_id(),
            tool_call_id,
            index = self.assembly.index,
            "Tool output block finished"
        );
        self.store
            .add_content(self.ctx.run_id(), &message_id, &block)
            .await?;
        self.assembly.blocks.push(block);
        self.assembly.index += 1;
        Ok(())
    }

    async fn finish_tool_answer(&mut self) -> Result<(), StoreError> {
        let message_id = self.message_id().await;
        let mut message = Message::assistant(self.assembly.content());
        message.id = message_id;

        let step = self
            .store
            .finish_message_creation(self.ctx.run_id(), &message)
            .await?;
        self.ctx.push_message(message);
        self.ctx.mark_message_created();
        self.step_changed(step).await;
        self.close_message(MessageStatus::Completed).await;
        Ok(())
    }
}
