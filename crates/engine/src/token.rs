//! Token estimation for context truncation.
//!
//! Counting is pluggable through [`TokenCounter`]; the default
//! [`HeuristicTokenCounter`] uses ~4 characters per token, which is close
//! enough for BPE tokenizers on English text.

use runloop_core::message::Message;

/// Per-message overhead for role name, delimiters, and formatting markers.
pub const MESSAGE_OVERHEAD: usize = 4;

/// Counts tokens for a message list as a given model would see it.
pub trait TokenCounter: Send + Sync {
    fn count_message(&self, message: &Message, model: &str) -> usize;

    fn count(&self, messages: &[Message], model: &str) -> usize {
        messages.iter().map(|m| self.count_message(m, model)).sum()
    }

    /// Approximate number of characters that make up `tokens` tokens.
    fn chars_for_tokens(&self, tokens: usize) -> usize {
        tokens * 4
    }
}

/// Character-based estimate, independent of the model.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicTokenCounter;

impl TokenCounter for HeuristicTokenCounter {
    fn count_message(&self, message: &Message, _model: &str) -> usize {
        let calls: usize = message
            .tool_calls
            .iter()
            .map(|tc| estimate_tokens(&tc.name) + estimate_tokens(&tc.arguments))
            .sum();
        let reasoning = message.reasoning.as_deref().map_or(0, estimate_tokens);
        MESSAGE_OVERHEAD + estimate_tokens(&message.content) + reasoning + calls
    }
}

/// Estimate the token count for a string.
///
/// Heuristic: 1 token ≈ 4 characters. Rounds up.
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use runloop_core::message::MessageToolCall;

    #[test]
    fn empty_string_is_zero() {
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn five_chars_rounds_up() {
        assert_eq!(estimate_tokens("hello"), 2);
    }

    #[test]
    fn message_includes_overhead() {
        let msg = Message::user("test"); // 1 token + 4 overhead
        assert_eq!(HeuristicTokenCounter.count_message(&msg, "m"), 5);
    }

    #[test]
    fn tool_calls_are_counted() {
        let msg = Message::assistant_with_tool_calls(
            "",
            vec![MessageToolCall {
                id: "c1".into(),
                name: "math".into(),                 // 1 token
                arguments: r#"{"x":1}"#.into(),      // 7 chars → 2 tokens
            }],
        );
        assert_eq!(HeuristicTokenCounter.count_message(&msg, "m"), 7);
    }

    #[test]
    fn list_is_summed() {
        let msgs = vec![Message::user("hello"), Message::assistant("hi")];
        // (4 + 2) + (4 + 1)
        assert_eq!(HeuristicTokenCounter.count(&msgs, "m"), 11);
    }
}
