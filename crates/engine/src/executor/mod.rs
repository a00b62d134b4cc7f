//! The actors that execute a run.
//!
//! - [`RunExecutor`] drives the plan/act loop
//! - [`MessageExecutor`] assembles the visible assistant output
//! - [`ToolExecutor`] dispatches tool-call batches
//! - [`ToolOutputChannel`] serializes final-tool output within a batch

mod message;
mod output;
mod run;
mod tool;

pub use message::MessageExecutor;
pub use output::ToolOutputChannel;
pub use run::{RunExecutor, RunHandle, RunOutcome};
pub use tool::ToolExecutor;
