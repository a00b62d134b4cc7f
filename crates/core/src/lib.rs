//! # runloop Core
//!
//! Domain types, collaborator traits, and error definitions for the runloop
//! run engine. This crate has **no engine logic**; it defines the model that
//! the engine, the stores, and the CLI all implement against.
//!
//! ## Design Philosophy
//!
//! Every external collaborator of the run engine is a trait here:
//! - [`Provider`]: streaming chat completion
//! - [`Tool`]: a server-side tool handler, resolved through a [`ToolRegistry`]
//! - [`RunStore`]: durable run/step/message transitions
//! - [`HistoryProvider`]: prior messages and tool-call steps of a conversation
//!
//! Implementations live in their respective crates, so the engine can be
//! exercised against in-memory stores and scripted providers.

pub mod error;
pub mod event;
pub mod message;
pub mod provider;
pub mod run;
pub mod store;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use error::{Error, ProviderError, Result, StoreError, ToolError};
pub use event::{ContentDelta, MessageStatus, StreamEvent};
pub use message::{Conversation, Message, MessageToolCall, Role};
pub use provider::{
    ChunkReceiver, Provider, ProviderRequest, StreamChunk, ToolCallDelta, ToolDefinition, Usage,
};
pub use run::{NewRun, Run, RunError, RunErrorCode, RunStatus, RunStep, StepKind, StepStatus};
pub use store::{HistoryProvider, RunStore};
pub use tool::{Tool, ToolCall, ToolContext, ToolOutput, ToolOutputSink, ToolRegistry, ToolResult};
