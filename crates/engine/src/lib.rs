//! The run execution engine: the heart of runloop.
//!
//! A run follows a **Plan → Act** cycle over one shared [`ExecutionContext`]:
//!
//! 1. **Plan**: the [`Planner`] inspects the context and picks the next action
//! 2. **Call the model**: stream a completion, assembling the assistant message
//! 3. **Dispatch tools**: run the requested handlers concurrently, feed results back
//! 4. **Stop** on completion, cancellation, error, expiry, or a client-side tool
//!
//! [`RunExecutor`] owns the loop. Two long-lived workers share the context
//! with it: the [`MessageExecutor`] (sole writer of visible output) and the
//! [`ToolExecutor`] (tool batches, with a [`ToolOutputChannel`] serializing
//! streamed output of final tools).

pub mod builder;
pub mod context;
pub mod event;
pub mod executor;
pub mod llm;
pub mod planner;
pub mod settings;
pub mod token;
pub mod truncator;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use builder::ContextBuilder;
pub use context::{ExecutionContext, StepSignal};
pub use event::RunEvent;
pub use executor::{
    MessageExecutor, RunExecutor, RunHandle, RunOutcome, ToolExecutor, ToolOutputChannel,
};
pub use llm::RetryPolicy;
pub use planner::{Action, Decision, Planner};
pub use settings::{EngineSettings, TruncationSettings};
pub use token::{HeuristicTokenCounter, TokenCounter};
pub use truncator::ContextTruncator;
