//! A deterministic model and a pair of demo tools, so a run can be driven
//! end to end without network access.
//!
//! The model answers the latest user message word by word. A message of the
//! form `/<tool> <text>` naming a declared tool becomes a call to that tool;
//! once tool results come back, the model summarizes them.

use async_trait::async_trait;
use runloop_core::error::{ProviderError, ToolError};
use runloop_core::message::{Message, Role};
use runloop_core::provider::{
    ChunkReceiver, Provider, ProviderRequest, StreamChunk, ToolCallDelta,
};
use runloop_core::tool::{Tool, ToolCall, ToolContext, ToolOutput, ToolRegistry, ToolResult};
use std::sync::Arc;
use tokio::sync::mpsc;

pub struct OfflineProvider;

#[async_trait]
impl Provider for OfflineProvider {
    fn name(&self) -> &str {
        "offline"
    }

    async fn stream(&self, request: ProviderRequest) -> Result<ChunkReceiver, ProviderError> {
        let chunks = respond(&request);
        let (tx, rx) = mpsc::channel(chunks.len() + 1);
        for chunk in chunks {
            let _ = tx.try_send(Ok(chunk));
        }
        Ok(rx)
    }
}

fn respond(request: &ProviderRequest) -> Vec<StreamChunk> {
    let Some(last) = request.messages.last() else {
        return words("Nothing to answer yet.");
    };

    match last.role {
        Role::Tool => {
            let outputs: Vec<&str> = request
                .messages
                .iter()
                .rev()
                .take_while(|m| m.role == Role::Tool)
                .map(|m| m.content.as_str())
                .collect();
            let joined = outputs.into_iter().rev().collect::<Vec<_>>().join("; ");
            words(&format!("Tool results: {joined}"))
        }
        Role::User => match command(last) {
            Some((name, text)) if request.tools.iter().any(|t| t.name == name) => {
                tool_call(request.messages.len(), name, text)
            }
            _ => words(&format!("You said: {}", last.content)),
        },
        _ => words("Nothing to answer yet."),
    }
}

/// `/name rest` → `(name, rest)`.
fn command(message: &Message) -> Option<(&str, &str)> {
    let body = message.content.trim().strip_prefix('/')?;
    let (name, text) = body.split_once(' ').unwrap_or((body, ""));
    (!name.is_empty()).then_some((name, text.trim()))
}

fn words(text: &str) -> Vec<StreamChunk> {
    let mut chunks: Vec<StreamChunk> = text.split_inclusive(' ').map(StreamChunk::text).collect();
    chunks.push(StreamChunk::done());
    chunks
}

fn tool_call(turn: usize, name: &str, text: &str) -> Vec<StreamChunk> {
    vec![
        StreamChunk {
            tool_calls: vec![ToolCallDelta {
                index: 0,
                id: Some(format!("call_{turn}")),
                name: Some(name.to_string()),
                arguments: serde_json::json!({ "text": text }).to_string(),
            }],
            ..Default::default()
        },
        StreamChunk::done(),
    ]
}

/// Reports the current UTC time; its result goes back to the model.
pub struct ClockTool;

#[async_trait]
impl Tool for ClockTool {
    fn name(&self) -> &str {
        "clock"
    }

    fn description(&self) -> &str {
        "Report the current UTC time"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object", "properties": {} })
    }

    async fn execute(
        &self,
        call: &ToolCall,
        _context: &ToolContext,
        _output: ToolOutput,
    ) -> Result<ToolResult, ToolError> {
        Ok(ToolResult::success(
            &call.id,
            chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        ))
    }
}

/// Upper-cases its input and streams it straight to the user.
pub struct ShoutTool;

#[async_trait]
impl Tool for ShoutTool {
    fn name(&self) -> &str {
        "shout"
    }

    fn description(&self) -> &str {
        "Answer with the given text in capitals"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": { "text": { "type": "string" } },
            "required": ["text"]
        })
    }

    fn is_final(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        call: &ToolCall,
        _context: &ToolContext,
        output: ToolOutput,
    ) -> Result<ToolResult, ToolError> {
        let text = call.arguments["text"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("missing 'text'".into()))?
            .to_uppercase();
        for word in text.split_inclusive(' ') {
            output.write(word);
            tokio::task::yield_now().await;
        }
        Ok(ToolResult::success(&call.id, text))
    }
}

pub fn registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(ClockTool));
    registry.register(Arc::new(ShoutTool));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use runloop_core::message::Conversation;
    use runloop_core::run::{NewRun, RunStatus};
    use runloop_core::StreamEvent;
    use runloop_engine::{EngineSettings, RunExecutor};
    use runloop_store::InMemoryRunStore;

    fn request(messages: Vec<Message>) -> ProviderRequest {
        ProviderRequest {
            model: "offline".into(),
            messages,
            temperature: 0.0,
            max_tokens: None,
            tools: registry().definitions(),
            user: None,
        }
    }

    fn text_of(chunks: &[StreamChunk]) -> String {
        chunks.iter().filter_map(|c| c.content.clone()).collect()
    }

    #[test]
    fn echoes_plain_messages() {
        let chunks = respond(&request(vec![Message::user("hi there")]));
        assert_eq!(text_of(&chunks), "You said: hi there");
        assert!(chunks.last().unwrap().done);
    }

    #[test]
    fn slash_command_calls_declared_tool() {
        let chunks = respond(&request(vec![Message::user("/shout hello")]));
        let call = &chunks[0].tool_calls[0];
        assert_eq!(call.name.as_deref(), Some("shout"));
        assert_eq!(call.arguments, r#"{"text":"hello"}"#);
    }

    #[test]
    fn unknown_command_is_echoed() {
        let chunks = respond(&request(vec![Message::user("/nope x")]));
        assert_eq!(text_of(&chunks), "You said: /nope x");
    }

    #[test]
    fn tool_results_are_summarized() {
        let chunks = respond(&request(vec![
            Message::user("/clock"),
            Message::tool_result("call_1", "12:00"),
        ]));
        assert_eq!(text_of(&chunks), "Tool results: 12:00");
    }

    async fn run_to_end(message: &str) -> (Vec<StreamEvent>, RunStatus) {
        let store = InMemoryRunStore::new();
        let mut conversation = Conversation::new();
        conversation.push(Message::user(message));
        let conversation_id = store.create_conversation(conversation).await;
        let run = store
            .create_run(NewRun::new(conversation_id, "offline"))
            .await
            .unwrap();
        let executor = RunExecutor::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(OfflineProvider),
            Arc::new(registry()),
            EngineSettings::default(),
        );
        let (events, outcome) = executor.start(&run.id).await.unwrap().finish().await.unwrap();
        (events, outcome.status)
    }

    fn streamed(events: &[StreamEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::MessageDelta { delta, .. } => delta.text().map(str::to_string),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn clock_round_trip_completes() {
        let (events, status) = run_to_end("/clock").await;
        assert_eq!(status, RunStatus::Completed);
        assert!(streamed(&events).starts_with("Tool results: "));
        assert_eq!(events.last().unwrap().event_type(), "done");
    }

    #[tokio::test]
    async fn shout_answers_directly() {
        let (events, status) = run_to_end("/shout make it loud").await;
        assert_eq!(status, RunStatus::Completed);
        assert_eq!(streamed(&events), "MAKE IT LOUD");
    }
}
