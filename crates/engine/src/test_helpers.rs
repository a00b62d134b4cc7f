//! Shared test helpers for engine unit and scenario tests.
//!
//! Scripted providers and tool handlers that produce deterministic output.
//! The scenario tests under `tests/` include this file as a module, so it
//! only depends on `runloop-core`.

#![allow(dead_code)]

use async_trait::async_trait;
use runloop_core::error::{ProviderError, ToolError};
use runloop_core::provider::{
    ChunkReceiver, Provider, ProviderRequest, StreamChunk, ToolCallDelta, ToolDefinition,
};
use runloop_core::tool::{Tool, ToolCall, ToolContext, ToolOutput, ToolResult};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, mpsc};

/// A text-only model turn.
pub fn text_turn(text: &str) -> Vec<StreamChunk> {
    let mut chunks: Vec<StreamChunk> = text
        .split_inclusive(' ')
        .map(StreamChunk::text)
        .collect();
    chunks.push(StreamChunk::done());
    chunks
}

/// A model turn issuing `(id, name, arguments)` tool calls.
pub fn tool_call_turn(calls: &[(&str, &str, &str)]) -> Vec<StreamChunk> {
    let mut chunks = Vec::new();
    for (index, (id, name, arguments)) in calls.iter().enumerate() {
        chunks.push(StreamChunk {
            tool_calls: vec![ToolCallDelta {
                index,
                id: Some(id.to_string()),
                name: Some(name.to_string()),
                arguments: String::new(),
            }],
            ..Default::default()
        });
        chunks.push(StreamChunk {
            tool_calls: vec![ToolCallDelta {
                index,
                arguments: arguments.to_string(),
                ..Default::default()
            }],
            ..Default::default()
        });
    }
    chunks.push(StreamChunk::done());
    chunks
}

pub fn definition(name: &str) -> ToolDefinition {
    ToolDefinition {
        name: name.to_string(),
        description: format!("{name} tool"),
        parameters: serde_json::json!({ "type": "object" }),
    }
}

fn channel_for(chunks: Vec<StreamChunk>, error: Option<ProviderError>) -> ChunkReceiver {
    let (tx, rx) = mpsc::channel(chunks.len() + 2);
    match error {
        Some(err) => {
            if let Some(first) = chunks.into_iter().next() {
                let _ = tx.try_send(Ok(first));
            }
            let _ = tx.try_send(Err(err));
        }
        None => {
            for chunk in chunks {
                let _ = tx.try_send(Ok(chunk));
            }
        }
    }
    rx
}

/// Replays scripted turns, one per call, and records every request.
pub struct ScriptedProvider {
    turns: Mutex<VecDeque<Vec<StreamChunk>>>,
    requests: Mutex<Vec<ProviderRequest>>,
    failures: Mutex<VecDeque<ProviderError>>,
    mid_stream_error: Option<ProviderError>,
    gate: Option<Arc<Notify>>,
}

impl ScriptedProvider {
    pub fn new(turns: Vec<Vec<StreamChunk>>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            requests: Mutex::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
            mid_stream_error: None,
            gate: None,
        }
    }

    /// Fail the first calls with these errors before replaying turns.
    pub fn failing_first(self, errors: Vec<ProviderError>) -> Self {
        *self.failures.lock().unwrap() = errors.into();
        self
    }

    /// Break every stream off after its first chunk.
    pub fn with_mid_stream_error(mut self, error: ProviderError) -> Self {
        self.mid_stream_error = Some(error);
        self
    }

    /// Hold every call until `gate` is notified.
    pub fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn stream(&self, request: ProviderRequest) -> Result<ChunkReceiver, ProviderError> {
        self.requests.lock().unwrap().push(request);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        let turn = self.turns.lock().unwrap().pop_front();
        match turn {
            Some(chunks) => Ok(channel_for(chunks, self.mid_stream_error.clone())),
            None => Err(ProviderError::ApiError {
                status_code: 400,
                message: "script exhausted".into(),
            }),
        }
    }
}

/// Panics inside `stream`.
pub struct PanickingProvider;

#[async_trait]
impl Provider for PanickingProvider {
    fn name(&self) -> &str {
        "panicking"
    }

    async fn stream(&self, _request: ProviderRequest) -> Result<ChunkReceiver, ProviderError> {
        panic!("provider blew up");
    }
}

/// Echoes its `text` argument.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo the input back"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": { "text": { "type": "string" } }
        })
    }

    async fn execute(
        &self,
        call: &ToolCall,
        _context: &ToolContext,
        _output: ToolOutput,
    ) -> Result<ToolResult, ToolError> {
        let text = call.arguments["text"].as_str().unwrap_or_default();
        Ok(ToolResult::success(&call.id, format!("echo: {text}")))
    }
}

/// Streams fixed chunks into the visible answer.
pub struct FinalTool {
    pub name: String,
    pub chunks: Vec<String>,
}

impl FinalTool {
    pub fn new(name: &str, chunks: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            chunks: chunks.iter().map(|c| c.to_string()).collect(),
        }
    }
}

#[async_trait]
impl Tool for FinalTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Writes the answer directly"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object" })
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
        for chunk in &self.chunks {
            output.write(chunk.clone());
            tokio::task::yield_now().await;
        }
        Ok(ToolResult::success(&call.id, self.chunks.concat()))
    }
}

/// Always fails.
pub struct FailingTool;

#[async_trait]
impl Tool for FailingTool {
    fn name(&self) -> &str {
        "fail"
    }

    fn description(&self) -> &str {
        "Always fails"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object" })
    }

    async fn execute(
        &self,
        _call: &ToolCall,
        _context: &ToolContext,
        _output: ToolOutput,
    ) -> Result<ToolResult, ToolError> {
        Err(ToolError::ExecutionFailed {
            tool_name: "fail".into(),
            reason: "disk on fire".into(),
        })
    }
}

/// A final tool that writes a little output, then panics.
pub struct PanickingTool;

#[async_trait]
impl Tool for PanickingTool {
    fn name(&self) -> &str {
        "boom"
    }

    fn description(&self) -> &str {
        "Writes, then panics"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object" })
    }

    fn is_final(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        _call: &ToolCall,
        _context: &ToolContext,
        output: ToolOutput,
    ) -> Result<ToolResult, ToolError> {
        output.write("partial");
        tokio::task::yield_now().await;
        panic!("tool blew up");
    }
}
