//! Events flowing through a run's internal queue.
//!
//! Every actor publishes into the context's queue; the
//! [`MessageExecutor`](crate::MessageExecutor) is the single consumer and the
//! only component that turns them into outward [`StreamEvent`]s.

use runloop_core::event::{ContentDelta, StreamEvent};
use runloop_core::provider::StreamChunk;
use runloop_core::run::RunError;
use tokio::sync::oneshot;

#[derive(Debug)]
pub enum RunEvent {
    /// Conversation, run, or step lifecycle; forwarded unchanged
    Lifecycle(StreamEvent),

    /// A streamed fragment of the model's response
    LlmDelta(StreamChunk),

    /// The model's response is complete
    LlmTurnFinished,

    /// The model call failed; the partial message is closed as incomplete
    LlmTurnFailed,

    /// A chunk of a final tool's output
    ToolOutput {
        tool_call_id: String,
        delta: ContentDelta,
    },

    /// A final tool's output stream is drained
    ToolTurnFinished { tool_call_id: String },

    /// Every call of the batch was final; the streamed output is the answer
    ToolAnswerFinished,

    /// The run ended with an error
    Error(RunError),

    /// Last event of the run; `ack` fires once everything before it is flushed
    Done { ack: Option<oneshot::Sender<()>> },
}

impl RunEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Lifecycle(_) => "lifecycle",
            Self::LlmDelta(_) => "llm_delta",
            Self::LlmTurnFinished => "llm_turn_finished",
            Self::LlmTurnFailed => "llm_turn_failed",
            Self::ToolOutput { .. } => "tool_output",
            Self::ToolTurnFinished { .. } => "tool_turn_finished",
            Self::ToolAnswerFinished => "tool_answer_finished",
            Self::Error(_) => "error",
            Self::Done { .. } => "done",
        }
    }
}
