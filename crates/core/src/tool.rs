//! Tool trait: the abstraction over server-side tool handlers.
//!
//! A handler exposes its schema (sent to the LLM), an `execute` entry point,
//! and an `is_final` flag. Final tools stream their output straight into the
//! assistant's visible answer through a [`ToolOutput`] handle instead of
//! feeding it back to the model.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::ToolError;
use crate::event::ContentDelta;
use crate::message::MessageToolCall;
use crate::provider::ToolDefinition;

/// A request to execute a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique call ID (matches the LLM's tool_call.id)
    pub id: String,

    /// Name of the tool to execute
    pub name: String,

    /// Arguments as a JSON value
    pub arguments: serde_json::Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }

    /// Build from the model's wire form, where arguments are a JSON string.
    ///
    /// Unparseable arguments are kept as a JSON string value so the
    /// dispatcher can reject the call as malformed.
    pub fn from_message_call(call: &MessageToolCall) -> Self {
        let arguments = if call.arguments.trim().is_empty() {
            serde_json::Value::Object(serde_json::Map::new())
        } else {
            serde_json::from_str(&call.arguments)
                .unwrap_or_else(|_| serde_json::Value::String(call.arguments.clone()))
        };
        Self::new(call.id.clone(), call.name.clone(), arguments)
    }
}

/// The result of a tool execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// The call ID this result is for
    pub call_id: String,

    /// The output content
    #[serde(default)]
    pub output: String,

    /// Set when the tool failed; fed back to the model instead of `output`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Optional structured data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ToolResult {
    pub fn success(call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            output: output.into(),
            error: None,
            data: None,
        }
    }

    pub fn failure(call_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            output: String::new(),
            error: Some(error.into()),
            data: None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// The text placed in the tool-result message handed back to the model.
    pub fn message_content(&self) -> String {
        match &self.error {
            Some(err) => format!("Error: {err}"),
            None => self.output.clone(),
        }
    }
}

/// Per-call information a handler may need besides its arguments.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub run_id: String,
    pub conversation_id: String,
    pub user: Option<String>,
    /// Files bound to this tool for the run
    pub files: Vec<String>,
}

/// Receives streamed output chunks keyed by tool call id.
///
/// Implementations must not block the producer.
pub trait ToolOutputSink: Send + Sync {
    fn push(&self, tool_call_id: &str, delta: ContentDelta);
}

/// A handler's handle onto the visible output stream.
///
/// For non-final tools the handle is detached and writes are dropped.
#[derive(Clone)]
pub struct ToolOutput {
    tool_call_id: String,
    sink: Option<Arc<dyn ToolOutputSink>>,
}

impl ToolOutput {
    pub fn streaming(tool_call_id: impl Into<String>, sink: Arc<dyn ToolOutputSink>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            sink: Some(sink),
        }
    }

    pub fn detached(tool_call_id: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            sink: None,
        }
    }

    pub fn tool_call_id(&self) -> &str {
        &self.tool_call_id
    }

    pub fn is_streaming(&self) -> bool {
        self.sink.is_some()
    }

    pub fn write(&self, text: impl Into<String>) {
        self.send(ContentDelta::Text { text: text.into() });
    }

    pub fn write_image(&self, file_id: impl Into<String>) {
        self.send(ContentDelta::ImageRef {
            file_id: file_id.into(),
        });
    }

    fn send(&self, delta: ContentDelta) {
        if let Some(sink) = &self.sink {
            sink.push(&self.tool_call_id, delta);
        }
    }
}

impl std::fmt::Debug for ToolOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolOutput")
            .field("tool_call_id", &self.tool_call_id)
            .field("streaming", &self.is_streaming())
            .finish()
    }
}

/// The core Tool trait.
///
/// Each server-side tool implements this trait and is registered in the
/// [`ToolRegistry`]. Tools a run declares but the registry cannot resolve
/// are surfaced to the caller as required actions.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g., "web_search").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the LLM).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Whether this tool's output is the assistant's visible answer.
    fn is_final(&self) -> bool {
        false
    }

    /// Execute the tool call.
    async fn execute(
        &self,
        call: &ToolCall,
        context: &ToolContext,
        output: ToolOutput,
    ) -> std::result::Result<ToolResult, ToolError>;

    /// Convert this tool into a ToolDefinition for sending to the LLM.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// A registry of server-side tool handlers, resolved by name.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Get all tool definitions (for sending to the LLM).
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<_> = self.tools.values().map(|t| t.to_definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// List all registered tool names.
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
