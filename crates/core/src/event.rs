//! Stream events produced by a run.
//!
//! `StreamEvent` is the ordered, typed sequence the engine hands to the
//! transport layer. Wire framing (SSE, WebSocket) is the transport's concern;
//! this module only fixes the sequence and its content.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::run::{RunError, RunStatus, RunStep};

/// An indexed fragment of assistant-visible content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentDelta {
    Text {
        text: String,
    },
    Reasoning {
        text: String,
    },
    ImageRef {
        file_id: String,
    },
    ToolCall {
        index: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        arguments: String,
    },
}

impl ContentDelta {
    /// Plain text carried by this fragment, if any.
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    InProgress,
    Completed,
    Incomplete,
}

/// Events emitted to the caller while a run executes.
///
/// - `conversation_created`    : a conversation was created for the run
/// - `run_status_changed`      : the run moved to a new status
/// - `run_step_status_changed` : a run step was opened or finished
/// - `message_delta`           : an indexed content fragment
/// - `message_status_changed`  : an assistant message started or finished
/// - `error`                   : the run ended with an error
/// - `done`                    : the stream is complete
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    ConversationCreated {
        conversation_id: String,
        created_at: DateTime<Utc>,
    },

    RunStatusChanged {
        run_id: String,
        status: RunStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_error: Option<RunError>,
    },

    RunStepStatusChanged {
        step: RunStep,
    },

    MessageDelta {
        message_id: String,
        index: usize,
        delta: ContentDelta,
    },

    MessageStatusChanged {
        message_id: String,
        status: MessageStatus,
    },

    Error {
        error: RunError,
    },

    Done,
}

impl StreamEvent {
    /// Event name for this event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ConversationCreated { .. } => "conversation_created",
            Self::RunStatusChanged { .. } => "run_status_changed",
            Self::RunStepStatusChanged { .. } => "run_step_status_changed",
            Self::MessageDelta { .. } => "message_delta",
            Self::MessageStatusChanged { .. } => "message_status_changed",
            Self::Error { .. } => "error",
            Self::Done => "done",
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::RunErrorCode;

    #[test]
    fn delta_serialization() {
        let event = StreamEvent::MessageDelta {
            message_id: "msg_1".into(),
            index: 0,
            delta: ContentDelta::Text {
                text: "Hello".into(),
            },
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""event":"message_delta""#));
        assert!(json.contains(r#""type":"text""#));
        assert!(json.contains(r#""text":"Hello""#));
    }

    #[test]
    fn status_serialization() {
        let event = StreamEvent::RunStatusChanged {
            run_id: "run_1".into(),
            status: RunStatus::RequiresAction,
            last_error: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""status":"requires_action""#));
        assert!(!json.contains("last_error"));
    }

    #[test]
    fn error_serialization() {
        let event = StreamEvent::Error {
            error: RunError::new(RunErrorCode::LlmError, "upstream down"),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""event":"error""#));
        assert!(json.contains(r#""code":"llm_error""#));
    }

    #[test]
    fn event_type_names() {
        assert_eq!(StreamEvent::Done.event_type(), "done");
        assert!(StreamEvent::Done.is_done());
        assert_eq!(
            StreamEvent::MessageStatusChanged {
                message_id: "m".into(),
                status: MessageStatus::Completed
            }
            .event_type(),
            "message_status_changed"
        );
    }

    #[test]
    fn event_deserialization() {
        let json = r#"{"event":"message_delta","message_id":"m","index":2,"delta":{"type":"image_ref","file_id":"file_9"}}"#;
        let event: StreamEvent = serde_json::from_str(json).unwrap();
        match event {
            StreamEvent::MessageDelta { index, delta, .. } => {
                assert_eq!(index, 2);
                assert_eq!(
                    delta,
                    ContentDelta::ImageRef {
                        file_id: "file_9".into()
                    }
                );
            }
            _ => panic!("Wrong variant"),
        }
    }
}
