//! Shared fixtures for engine scenario tests.

#![allow(dead_code)]

#[path = "../../src/test_helpers.rs"]
mod scripted;

pub use scripted::*;

use async_trait::async_trait;
use runloop_core::error::ToolError;
use runloop_core::message::{Conversation, Message};
use runloop_core::run::NewRun;
use runloop_core::tool::{Tool, ToolCall, ToolContext, ToolOutput, ToolRegistry, ToolResult};
use runloop_core::StreamEvent;
use runloop_engine::{EngineSettings, RunExecutor};
use runloop_store::InMemoryRunStore;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// Records the files bound to it and answers with their count.
#[derive(Default)]
pub struct FilesTool {
    pub seen: Mutex<Vec<String>>,
}

#[async_trait]
impl Tool for FilesTool {
    fn name(&self) -> &str {
        "files"
    }

    fn description(&self) -> &str {
        "Search bound files"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object" })
    }

    async fn execute(
        &self,
        call: &ToolCall,
        context: &ToolContext,
        _output: ToolOutput,
    ) -> Result<ToolResult, ToolError> {
        self.seen.lock().unwrap().extend(context.files.iter().cloned());
        Ok(ToolResult::success(
            &call.id,
            format!("{} file(s)", context.files.len()),
        ))
    }
}

/// Counts calls; used to prove a batch ran.
#[derive(Default)]
pub struct CountingTool {
    pub calls: AtomicU32,
}

#[async_trait]
impl Tool for CountingTool {
    fn name(&self) -> &str {
        "count"
    }

    fn description(&self) -> &str {
        "Counts invocations"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object" })
    }

    async fn execute(
        &self,
        call: &ToolCall,
        _context: &ToolContext,
        _output: ToolOutput,
    ) -> Result<ToolResult, ToolError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ToolResult::success(&call.id, n.to_string()))
    }
}

pub fn registry(tools: Vec<Arc<dyn Tool>>) -> Arc<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    for tool in tools {
        registry.register(tool);
    }
    Arc::new(registry)
}

pub fn default_registry() -> Arc<ToolRegistry> {
    registry(vec![
        Arc::new(EchoTool),
        Arc::new(FailingTool),
        Arc::new(FinalTool::new("answer", &["Hello", " from", " answer"])),
        Arc::new(FinalTool::new("chart", &["[chart]"])),
    ])
}

/// Seed a conversation holding `messages` and create a run on it.
pub async fn seed_run(
    store: &InMemoryRunStore,
    messages: Vec<Message>,
    configure: impl FnOnce(NewRun) -> NewRun,
) -> String {
    let mut conversation = Conversation::new();
    for message in messages {
        conversation.push(message);
    }
    let conversation_id = store.create_conversation(conversation).await;
    store
        .create_run(configure(NewRun::new(conversation_id, "test-model")))
        .await
        .unwrap()
        .id
}

pub fn executor(
    store: &InMemoryRunStore,
    provider: Arc<dyn runloop_core::provider::Provider>,
    tools: Arc<ToolRegistry>,
    settings: EngineSettings,
) -> RunExecutor {
    RunExecutor::new(
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        provider,
        tools,
        settings,
    )
}

pub fn event_types(events: &[StreamEvent]) -> Vec<&'static str> {
    events.iter().map(StreamEvent::event_type).collect()
}

/// Concatenated text deltas, in emission order.
pub fn streamed_text(events: &[StreamEvent]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::MessageDelta { delta, .. } => delta.text().map(str::to_string),
            _ => None,
        })
        .collect()
}
