//! Context-window truncation.
//!
//! Fits a message list into a model's input budget without breaking the
//! tool protocol: every assistant tool-call turn handed to the model is
//! immediately followed by one result per call, in call order.
//!
//! The algorithm:
//! 1. A list that already fits only goes through the repair pass, unless
//!    the repaired list no longer fits.
//! 2. A *protected set* is kept no matter what: the first system message,
//!    the last user message, and the trailing tool turn (if the list ends
//!    on one).
//! 3. If the protected set alone is over budget, the longest tool result is
//!    shortened (bounded attempts) and only the protected set is returned.
//! 4. Otherwise older messages are added newest-first while they fit.
//! 5. A repair pass restores conversational validity.

use std::collections::{BTreeSet, HashMap};

use runloop_core::message::{Message, Role};
use tracing::{debug, warn};

use crate::token::TokenCounter;

const TRUNCATION_MARKER: &str = "[truncated]";
const INTERRUPTED_RESULT: &str = "Tool call was interrupted before a result was recorded.";
const INTERRUPTED_REPLY: &str = "The tool call could not be completed.";

/// Default number of shortening passes over the protected set.
pub const DEFAULT_SHORTEN_ATTEMPTS: u32 = 5;

pub struct ContextTruncator<'a> {
    counter: &'a dyn TokenCounter,
    model: &'a str,
    max_input_tokens: usize,
    shorten_attempts: u32,
}

impl<'a> ContextTruncator<'a> {
    pub fn new(counter: &'a dyn TokenCounter, model: &'a str, max_input_tokens: usize) -> Self {
        Self {
            counter,
            model,
            max_input_tokens,
            shorten_attempts: DEFAULT_SHORTEN_ATTEMPTS,
        }
    }

    pub fn with_shorten_attempts(mut self, attempts: u32) -> Self {
        self.shorten_attempts = attempts;
        self
    }

    /// Reduce `messages` to the input budget.
    pub fn truncate(&self, messages: Vec<Message>) -> Vec<Message> {
        if messages.is_empty() {
            return messages;
        }
        if self.counter.count(&messages, self.model) <= self.max_input_tokens {
            let repaired = repair(messages.clone());
            if self.counter.count(&repaired, self.model) <= self.max_input_tokens {
                return repaired;
            }
        }

        let mut messages = messages;
        let protected = protected_indices(&messages);
        let protected_tokens = self.cost(&messages, &protected);

        if protected_tokens > self.max_input_tokens {
            let remaining = self.shorten(&mut messages, &protected);
            if remaining > self.max_input_tokens {
                warn!(
                    model = self.model,
                    tokens = remaining,
                    max_input_tokens = self.max_input_tokens,
                    "Protected context still exceeds the input budget"
                );
            }
            let kept = protected.iter().map(|&i| messages[i].clone()).collect();
            return repair(kept);
        }

        // Newest first, stopping at the first message that does not fit.
        let mut budget = self.max_input_tokens - protected_tokens;
        let mut included = Vec::new();
        for i in (0..messages.len()).rev().filter(|i| !protected.contains(i)) {
            let cost = self.counter.count_message(&messages[i], self.model);
            if cost > budget {
                break;
            }
            budget -= cost;
            included.push(i);
        }

        // Placeholders synthesized by the repair pass cost tokens too; give
        // back the oldest included message until the result fits.
        loop {
            let keep: BTreeSet<usize> = protected.iter().chain(included.iter()).copied().collect();
            let selected = keep.iter().map(|&i| messages[i].clone()).collect();
            let repaired = repair(selected);
            let tokens = self.counter.count(&repaired, self.model);
            if tokens <= self.max_input_tokens || included.pop().is_none() {
                debug!(
                    model = self.model,
                    kept = repaired.len(),
                    dropped = messages.len().saturating_sub(repaired.len()),
                    tokens,
                    "Context truncated"
                );
                return repaired;
            }
        }
    }

    fn cost(&self, messages: &[Message], indices: &BTreeSet<usize>) -> usize {
        indices
            .iter()
            .map(|&i| self.counter.count_message(&messages[i], self.model))
            .sum()
    }

    /// Shorten protected content until it fits or attempts run out.
    /// Returns the resulting token count of the protected set.
    fn shorten(&self, messages: &mut [Message], protected: &BTreeSet<usize>) -> usize {
        let mut tokens = self.cost(messages, protected);
        for _ in 0..self.shorten_attempts {
            if tokens <= self.max_input_tokens {
                break;
            }
            let Some(target) = shorten_target(messages, protected) else {
                break;
            };

            let overage = tokens - self.max_input_tokens;
            let content = &messages[target].content;
            let cut = self.counter.chars_for_tokens(overage) + TRUNCATION_MARKER.len();
            let keep = floor_char_boundary(content, content.len().saturating_sub(cut));
            let mut shortened = content[..keep].to_string();
            shortened.push_str(TRUNCATION_MARKER);
            messages[target].content = shortened;

            tokens = self.cost(messages, protected);
        }
        tokens
    }
}

/// The longest protected tool result, else the longest protected message.
fn shorten_target(messages: &[Message], protected: &BTreeSet<usize>) -> Option<usize> {
    let shrinkable = |i: &usize| messages[*i].content.len() > TRUNCATION_MARKER.len();
    let longest = |role: Option<Role>| {
        protected
            .iter()
            .copied()
            .filter(|i| shrinkable(i))
            .filter(|&i| role.is_none_or(|r| messages[i].role == r))
            .max_by_key(|&i| messages[i].content.len())
    };
    longest(Some(Role::Tool)).or_else(|| longest(None))
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn protected_indices(messages: &[Message]) -> BTreeSet<usize> {
    let mut protected = BTreeSet::new();
    if let Some(i) = messages.iter().position(|m| m.role == Role::System) {
        protected.insert(i);
    }
    if let Some(i) = messages.iter().rposition(|m| m.role == Role::User) {
        protected.insert(i);
    }
    if let Some(start) = tail_turn_start(messages) {
        protected.extend(start..messages.len());
    }
    protected
}

/// Index of the assistant message opening the trailing tool turn, if the
/// list ends on one (the assistant's calls, optionally followed by results).
fn tail_turn_start(messages: &[Message]) -> Option<usize> {
    let mut i = messages.len();
    while i > 0 && messages[i - 1].role == Role::Tool {
        i -= 1;
    }
    (i > 0 && messages[i - 1].has_tool_calls()).then(|| i - 1)
}

/// Restore validity of a selected message list.
pub(crate) fn repair(messages: Vec<Message>) -> Vec<Message> {
    merge_user_runs(fix_leading(repair_pairing(messages)))
}

fn repair_pairing(messages: Vec<Message>) -> Vec<Message> {
    let mut out = Vec::with_capacity(messages.len());
    let mut iter = messages.into_iter().peekable();

    while let Some(message) = iter.next() {
        if message.role == Role::Tool {
            debug!(tool_call_id = ?message.tool_call_id, "Dropping orphan tool result");
            continue;
        }
        if !message.has_tool_calls() {
            out.push(message);
            continue;
        }

        let ids: Vec<String> = message.tool_calls.iter().map(|tc| tc.id.clone()).collect();
        let mut results: HashMap<String, Message> = HashMap::new();
        while let Some(result) = iter.next_if(|m| m.role == Role::Tool) {
            match result.tool_call_id.clone() {
                Some(id) if ids.contains(&id) => {
                    results.insert(id, result);
                }
                _ => debug!(tool_call_id = ?result.tool_call_id, "Dropping orphan tool result"),
            }
        }

        let complete = ids.iter().all(|id| results.contains_key(id));
        let at_end = iter.peek().is_none();
        let followed_by_user = iter.peek().is_some_and(|m| m.role == Role::User);

        if complete || at_end {
            // A trailing turn may still be in flight; keep what it has.
            out.push(message);
            out.extend(ids.iter().filter_map(|id| results.remove(id)));
        } else if results.is_empty() && followed_by_user {
            out.push(message);
            out.extend(
                ids.into_iter()
                    .map(|id| Message::tool_result(id, INTERRUPTED_RESULT)),
            );
            out.push(Message::assistant(INTERRUPTED_REPLY));
        } else {
            debug!(message_id = %message.id, "Dropping incomplete tool turn");
        }
    }
    out
}

/// Drop non-system messages ahead of the first user message.
fn fix_leading(messages: Vec<Message>) -> Vec<Message> {
    let first_other = messages.iter().position(|m| m.role != Role::System);
    let first_user = messages.iter().position(|m| m.role == Role::User);
    match (first_other, first_user) {
        (Some(other), Some(user)) if other < user => messages
            .into_iter()
            .enumerate()
            .filter(|(i, m)| m.role == Role::System || *i >= user)
            .map(|(_, m)| m)
            .collect(),
        _ => messages,
    }
}

fn merge_user_runs(messages: Vec<Message>) -> Vec<Message> {
    let mut out: Vec<Message> = Vec::with_capacity(messages.len());
    for message in messages {
        match out.last_mut() {
            Some(last) if last.role == Role::User && message.role == Role::User => {
                last.content.push_str("\n\n");
                last.content.push_str(&message.content);
            }
            _ => out.push(message),
        }
    }
    out
}
