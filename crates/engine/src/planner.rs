//! The planning state machine.
//!
//! [`Planner::next_step`] is evaluated fresh on every loop iteration. The
//! stop checks run first and in a fixed order (cancel, error, completion,
//! requires-action, deadline, step budget), so cancellation and errors always
//! pre-empt further planning.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use runloop_core::message::{Message, Role};
use runloop_core::run::{RunError, RunErrorCode};
use runloop_core::tool::ToolCall;
use tracing::debug;

use crate::context::ExecutionContext;
use crate::token::{HeuristicTokenCounter, TokenCounter};
use crate::truncator::{ContextTruncator, repair};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Init,
    LlmCall,
    WaitForInput,
    WaitForTool,
    Complete,
    Canceled,
    Error,
    Expired,
}

impl Action {
    /// Whether the loop keeps going after this action.
    pub fn needs_execution(self) -> bool {
        matches!(self, Self::Init | Self::LlmCall | Self::WaitForTool)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::LlmCall => "llm_call",
            Self::WaitForInput => "wait_for_input",
            Self::WaitForTool => "wait_for_tool",
            Self::Complete => "complete",
            Self::Canceled => "canceled",
            Self::Error => "error",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the planner decided, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub action: Action,
    pub reason: String,
}

impl Decision {
    pub fn new(action: Action, reason: impl Into<String>) -> Self {
        Self {
            action,
            reason: reason.into(),
        }
    }

    pub fn init() -> Self {
        Self::new(Action::Init, "Run starting")
    }

    pub fn needs_execution(&self) -> bool {
        self.action.needs_execution()
    }
}

pub struct Planner {
    counter: Arc<dyn TokenCounter>,
}

impl Planner {
    pub fn new(counter: Arc<dyn TokenCounter>) -> Self {
        Self { counter }
    }

    pub fn next_step(&self, ctx: &ExecutionContext) -> Decision {
        if ctx.is_canceled() {
            return Decision::new(Action::Canceled, "Run was cancelled");
        }
        if let Some(error) = ctx.last_error() {
            return Decision::new(Action::Error, error.to_string());
        }
        if ctx.is_message_created() {
            return Decision::new(Action::Complete, "Assistant message created");
        }
        let required = ctx.requires_action();
        if !required.is_empty() {
            return Decision::new(
                Action::WaitForInput,
                format!("Waiting for {} tool output(s) from the caller", required.len()),
            );
        }
        if ctx.is_past_deadline() {
            return Decision::new(Action::Expired, "Run deadline passed");
        }
        if ctx.step() >= ctx.max_steps() {
            let reason = format!("Exceeded maximum steps: {}", ctx.max_steps());
            ctx.set_error(RunError::new(RunErrorCode::ExceededMaxSteps, reason.clone()));
            return Decision::new(Action::Expired, reason);
        }
        if ctx.has_pending_tool_calls() {
            return wait_for_tools(ctx);
        }

        if !ctx.is_prepared() {
            self.prepare(ctx);
            if ctx.has_pending_tool_calls() {
                return wait_for_tools(ctx);
            }
        }

        let Some(last) = ctx.last_message() else {
            let reason = "no messages to process";
            ctx.set_error(RunError::new(RunErrorCode::BadRequest, reason));
            return Decision::new(Action::Error, reason);
        };

        if last.role == Role::Assistant {
            if last.tool_calls.iter().any(|tc| !ctx.has_tool_result(&tc.id)) {
                return wait_for_tools(ctx);
            }
            return Decision::new(Action::Complete, "Last message is from the assistant");
        }

        Decision::new(Action::LlmCall, "Awaiting assistant response")
    }

    /// Assemble the chat message list from history and recorded results.
    fn prepare(&self, ctx: &ExecutionContext) {
        let history = ctx.history();
        let mut messages = Vec::with_capacity(history.len() + 1);

        if let Some(instructions) = ctx.instructions()
            && !history.iter().any(|m| m.role == Role::System)
        {
            messages.push(Message::system(instructions));
        }

        let answered: HashSet<String> = history
            .iter()
            .filter(|m| m.role == Role::Tool)
            .filter_map(|m| m.tool_call_id.clone())
            .collect();
        let tail = history.iter().rposition(|m| m.role != Role::Tool);
        let mut unresolved = Vec::new();

        for (index, message) in history.into_iter().enumerate() {
            let calls = if message.has_tool_calls() {
                message.tool_calls.clone()
            } else {
                Vec::new()
            };
            messages.push(message);

            for call in calls.iter().filter(|c| !answered.contains(&c.id)) {
                match ctx.tool_result(&call.id) {
                    Some(result) => messages.push(Message::tool_result(
                        call.id.clone(),
                        result.message_content(),
                    )),
                    None if Some(index) == tail => {
                        unresolved.push(ToolCall::from_message_call(call));
                    }
                    None => {}
                }
            }
        }

        let before = messages.len();
        messages = match ctx.truncation() {
            Some(limits) => {
                ContextTruncator::new(self.counter.as_ref(), ctx.model(), limits.max_input_tokens)
                    .with_shorten_attempts(limits.shorten_attempts)
                    .truncate(messages)
            }
            None => repair(messages),
        };
        debug!(
            run_id = ctx.run_id(),
            assembled = before,
            kept = messages.len(),
            unresolved = unresolved.len(),
            "Context prepared"
        );

        ctx.add_tool_calls(unresolved);
        ctx.set_messages(messages);
    }
}

impl Default for Planner {
    fn default() -> Self {
        Self::new(Arc::new(HeuristicTokenCounter))
    }
}

fn wait_for_tools(ctx: &ExecutionContext) -> Decision {
    let pending = ctx.pending_tool_calls().len();
    Decision::new(
        Action::WaitForTool,
        format!("{pending} tool call(s) in progress"),
    )
}
