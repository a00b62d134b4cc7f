//! Per-run shared state and synchronization hub.
//!
//! One [`ExecutionContext`] exists per run (or per resume). The driver, the
//! output assembler, the tool dispatcher and the output channel all hold an
//! `Arc` to it. It carries no business logic: thread-safe accessors, an event
//! queue that never blocks the publisher, a single-slot rendezvous for the
//! driver, a wake-up for the dispatcher, and an idempotent end flag.
//!
//! Locks are plain `std` mutexes and are never held across an `.await`.

use chrono::{DateTime, Utc};
use runloop_core::message::{Message, Role};
use runloop_core::provider::ToolDefinition;
use runloop_core::run::{Run, RunError};
use runloop_core::tool::{ToolCall, ToolResult};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::{Notify, mpsc, oneshot, watch};
use tracing::{debug, trace};

use crate::event::RunEvent;
use crate::settings::EngineSettings;

/// What woke the driver out of [`ExecutionContext::runner_await`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepSignal {
    LlmDone,
    ToolsDone,
    Failed,
    Ended,
}

/// Truncation limits for this run; absent when truncation is off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TruncationLimits {
    pub max_input_tokens: usize,
    pub shorten_attempts: u32,
}

#[derive(Default)]
struct ConversationState {
    history: Vec<Message>,
    messages: Vec<Message>,
    prepared: bool,
    tools: Vec<ToolDefinition>,
    tool_resources: HashMap<String, Vec<String>>,
}

#[derive(Default)]
struct ToolState {
    /// Issued by the model, not yet resolved
    pending: HashMap<String, ToolCall>,
    pending_order: Vec<String>,
    /// Registered but not yet released to the dispatcher
    queued: Vec<ToolCall>,
    /// Released; the dispatcher takes these on wake-up
    ready: VecDeque<ToolCall>,
    results: HashMap<String, ToolResult>,
    streaming: HashSet<String>,
    current_output: Option<String>,
}

pub struct ExecutionContext {
    run_id: String,
    conversation_id: String,
    assistant_id: String,
    model: String,
    user: Option<String>,
    instructions: Option<String>,
    temperature: f32,

    started_at: DateTime<Utc>,
    deadline: Option<DateTime<Utc>>,
    max_steps: u32,
    step: AtomicU32,
    truncation: Option<TruncationLimits>,

    conversation: Mutex<ConversationState>,
    tools: Mutex<ToolState>,

    last_error: Mutex<Option<RunError>>,
    requires_action: Mutex<Vec<ToolCall>>,
    canceled: AtomicBool,
    message_created: AtomicBool,

    runner: Mutex<Option<oneshot::Sender<StepSignal>>>,
    tool_calls_ready: Notify,
    events: mpsc::UnboundedSender<RunEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<RunEvent>>>,
    ended: watch::Sender<bool>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ExecutionContext {
    /// Create a context for `run`, resolving per-run limits against `settings`.
    pub fn new(run: &Run, settings: &EngineSettings) -> Self {
        let started_at = Utc::now();
        let deadline = run.expires_at.or_else(|| {
            settings
                .run_timeout
                .and_then(|timeout| chrono::Duration::from_std(timeout).ok())
                .map(|timeout| started_at + timeout)
        });
        let truncation = run
            .truncation
            .unwrap_or(settings.truncation.enabled)
            .then(|| TruncationLimits {
                max_input_tokens: settings.truncation.max_input_tokens_for(&run.model),
                shorten_attempts: settings.truncation.shorten_attempts,
            });
        let (events, event_rx) = mpsc::unbounded_channel();
        let (ended, _) = watch::channel(false);

        Self {
            run_id: run.id.clone(),
            conversation_id: run.conversation_id.clone(),
            assistant_id: run.assistant_id.clone(),
            model: run.model.clone(),
            user: run.user.clone(),
            instructions: run.instructions.clone(),
            temperature: settings.temperature,
            started_at,
            deadline,
            max_steps: run.max_steps.unwrap_or(settings.max_steps),
            step: AtomicU32::new(0),
            truncation,
            conversation: Mutex::new(ConversationState {
                tools: run.tools.clone(),
                tool_resources: run.tool_resources.clone(),
                ..Default::default()
            }),
            tools: Mutex::new(ToolState::default()),
            last_error: Mutex::new(None),
            requires_action: Mutex::new(Vec::new()),
            canceled: AtomicBool::new(false),
            message_created: AtomicBool::new(false),
            runner: Mutex::new(None),
            tool_calls_ready: Notify::new(),
            events,
            event_rx: Mutex::new(Some(event_rx)),
            ended,
        }
    }

    // --- Identity ---

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn assistant_id(&self) -> &str {
        &self.assistant_id
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn instructions(&self) -> Option<&str> {
        self.instructions.as_deref()
    }

    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    // --- Budget and timing ---

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.deadline
    }

    pub fn is_past_deadline(&self) -> bool {
        self.deadline.is_some_and(|deadline| Utc::now() >= deadline)
    }

    pub fn max_steps(&self) -> u32 {
        self.max_steps
    }

    pub fn step(&self) -> u32 {
        self.step.load(Ordering::SeqCst)
    }

    /// Advance the step counter, returning the new value.
    pub fn increment_step(&self) -> u32 {
        self.step.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn truncation(&self) -> Option<TruncationLimits> {
        self.truncation
    }

    // --- Conversation state ---

    pub fn set_history(&self, history: Vec<Message>) {
        lock(&self.conversation).history = history;
    }

    pub fn history(&self) -> Vec<Message> {
        lock(&self.conversation).history.clone()
    }

    pub fn messages(&self) -> Vec<Message> {
        lock(&self.conversation).messages.clone()
    }

    pub fn last_message(&self) -> Option<Message> {
        lock(&self.conversation).messages.last().cloned()
    }

    /// Install the assembled message list and mark the context prepared.
    pub fn set_messages(&self, messages: Vec<Message>) {
        let mut state = lock(&self.conversation);
        state.messages = messages;
        state.prepared = true;
    }

    pub fn push_message(&self, message: Message) {
        lock(&self.conversation).messages.push(message);
    }

    pub fn is_prepared(&self) -> bool {
        lock(&self.conversation).prepared
    }

    pub fn set_tools(&self, tools: Vec<ToolDefinition>) {
        lock(&self.conversation).tools = tools;
    }

    pub fn tools(&self) -> Vec<ToolDefinition> {
        lock(&self.conversation).tools.clone()
    }

    pub fn is_tool_declared(&self, name: &str) -> bool {
        lock(&self.conversation).tools.iter().any(|t| t.name == name)
    }

    /// Files bound to `tool` for this run.
    pub fn tool_resources(&self, tool: &str) -> Vec<String> {
        lock(&self.conversation)
            .tool_resources
            .get(tool)
            .cloned()
            .unwrap_or_default()
    }

    /// Replace the results after the last tool-call turn with every recorded
    /// result for it, in call order.
    pub fn append_tool_results(&self) {
        let results = lock(&self.tools).results.clone();
        let mut state = lock(&self.conversation);
        let Some(turn) = state.messages.iter().rposition(|m| m.has_tool_calls()) else {
            return;
        };
        let ids: Vec<String> = state.messages[turn]
            .tool_calls
            .iter()
            .map(|tc| tc.id.clone())
            .collect();

        let trailing_tools = state.messages[turn + 1..]
            .iter()
            .take_while(|m| m.role == Role::Tool)
            .count();
        state.messages.drain(turn + 1..turn + 1 + trailing_tools);

        let tool_messages: Vec<Message> = ids
            .iter()
            .filter_map(|id| {
                results
                    .get(id)
                    .map(|r| Message::tool_result(id.clone(), r.message_content()))
            })
            .collect();
        let rest = state.messages.split_off(turn + 1);
        state.messages.extend(tool_messages);
        state.messages.extend(rest);
    }

    // --- Tool bookkeeping ---

    /// Register calls the model issued. They reach the dispatcher only once
    /// [`release_tool_calls`](Self::release_tool_calls) is called.
    pub fn add_tool_calls(&self, calls: Vec<ToolCall>) {
        let mut state = lock(&self.tools);
        for call in calls {
            if state.pending.contains_key(&call.id) || state.results.contains_key(&call.id) {
                continue;
            }
            state.pending_order.push(call.id.clone());
            state.pending.insert(call.id.clone(), call.clone());
            state.queued.push(call);
        }
    }

    /// Hand queued calls to the dispatcher and wake it. Returns how many.
    pub fn release_tool_calls(&self) -> usize {
        let released = {
            let mut state = lock(&self.tools);
            let queued = std::mem::take(&mut state.queued);
            let count = queued.len();
            state.ready.extend(queued);
            count
        };
        if released > 0 {
            self.tool_calls_ready.notify_one();
        }
        released
    }

    pub fn take_ready_tool_calls(&self) -> Vec<ToolCall> {
        lock(&self.tools).ready.drain(..).collect()
    }

    pub fn has_ready_tool_calls(&self) -> bool {
        !lock(&self.tools).ready.is_empty()
    }

    pub fn has_pending_tool_calls(&self) -> bool {
        !lock(&self.tools).pending.is_empty()
    }

    /// Unresolved calls, in the order they were issued.
    pub fn pending_tool_calls(&self) -> Vec<ToolCall> {
        let state = lock(&self.tools);
        state
            .pending_order
            .iter()
            .filter_map(|id| state.pending.get(id).cloned())
            .collect()
    }

    /// Attach a result to its call.
    pub fn resolve_tool_call(&self, result: ToolResult) {
        let mut state = lock(&self.tools);
        state.pending.remove(&result.call_id);
        state.pending_order.retain(|id| id != &result.call_id);
        state.results.insert(result.call_id.clone(), result);
    }

    /// Seed results recorded before this context was built.
    pub fn record_results(&self, results: HashMap<String, ToolResult>) {
        lock(&self.tools).results.extend(results);
    }

    pub fn tool_result(&self, call_id: &str) -> Option<ToolResult> {
        lock(&self.tools).results.get(call_id).cloned()
    }

    pub fn has_tool_result(&self, call_id: &str) -> bool {
        lock(&self.tools).results.contains_key(call_id)
    }

    pub fn mark_streaming(&self, call_id: &str) {
        lock(&self.tools).streaming.insert(call_id.to_string());
    }

    pub fn finish_streaming(&self, call_id: &str) {
        let mut state = lock(&self.tools);
        state.streaming.remove(call_id);
        if state.current_output.as_deref() == Some(call_id) {
            state.current_output = None;
        }
    }

    pub fn streaming_calls(&self) -> HashSet<String> {
        lock(&self.tools).streaming.clone()
    }

    /// The tool call currently allowed to write to the visible stream.
    pub fn current_output(&self) -> Option<String> {
        lock(&self.tools).current_output.clone()
    }

    pub fn set_current_output(&self, call_id: Option<String>) {
        lock(&self.tools).current_output = call_id;
    }

    // --- Terminal and error flags ---

    /// Record a run-level error. The first error wins.
    pub fn set_error(&self, error: RunError) -> bool {
        let mut slot = lock(&self.last_error);
        if slot.is_some() {
            debug!(run_id = %self.run_id, dropped = %error, "Run already has an error");
            return false;
        }
        *slot = Some(error);
        true
    }

    pub fn last_error(&self) -> Option<RunError> {
        lock(&self.last_error).clone()
    }

    pub fn has_error(&self) -> bool {
        lock(&self.last_error).is_some()
    }

    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    pub fn set_requires_action(&self, calls: Vec<ToolCall>) {
        *lock(&self.requires_action) = calls;
    }

    pub fn requires_action(&self) -> Vec<ToolCall> {
        lock(&self.requires_action).clone()
    }

    pub fn is_requires_action(&self) -> bool {
        !lock(&self.requires_action).is_empty()
    }

    pub fn mark_message_created(&self) {
        self.message_created.store(true, Ordering::SeqCst);
    }

    pub fn is_message_created(&self) -> bool {
        self.message_created.load(Ordering::SeqCst)
    }

    // --- Coordination ---

    /// Open the single-use slot the next completion signal lands in.
    ///
    /// Must be called before starting the action that will signal, so the
    /// signal cannot arrive before anyone is waiting for it.
    pub fn arm_runner(&self) -> oneshot::Receiver<StepSignal> {
        let (tx, rx) = oneshot::channel();
        if lock(&self.runner).replace(tx).is_some() {
            debug!(run_id = %self.run_id, "Replacing an unused runner slot");
        }
        rx
    }

    /// Complete the armed slot. Returns false when nobody is waiting.
    pub fn signal(&self, signal: StepSignal) -> bool {
        match lock(&self.runner).take() {
            Some(tx) => tx.send(signal).is_ok(),
            None => {
                debug!(run_id = %self.run_id, ?signal, "No runner waiting for signal");
                false
            }
        }
    }

    /// Wait for the armed slot to complete, or for the context to end.
    pub async fn runner_await(&self, rx: oneshot::Receiver<StepSignal>) -> StepSignal {
        tokio::select! {
            signal = rx => signal.unwrap_or(StepSignal::Ended),
            _ = self.ended() => StepSignal::Ended,
        }
    }

    /// Wait until released tool calls exist. Returns false once the context ends.
    pub async fn tool_call_await(&self) -> bool {
        loop {
            let notified = self.tool_calls_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_ended() {
                return false;
            }
            if self.has_ready_tool_calls() {
                return true;
            }
            notified.await;
        }
    }

    /// Enqueue an event for the output assembler. Never blocks.
    pub fn publish(&self, event: RunEvent) {
        let kind = event.kind();
        if self.events.send(event).is_err() {
            trace!(run_id = %self.run_id, kind, "Event queue closed, dropping event");
        }
    }

    /// The receiving half of the event queue; available once.
    pub fn take_event_receiver(&self) -> Option<mpsc::UnboundedReceiver<RunEvent>> {
        lock(&self.event_rx).take()
    }

    /// Mark the run ended and wake every blocked worker.
    ///
    /// Idempotent: only the first call has any effect. Returns whether this
    /// call was the one that ended the context.
    pub fn end(&self) -> bool {
        let already = self.ended.send_replace(true);
        if !already {
            self.tool_calls_ready.notify_waiters();
            debug!(run_id = %self.run_id, "Execution context ended");
        }
        !already
    }

    pub fn is_ended(&self) -> bool {
        *self.ended.borrow()
    }

    /// Resolves once [`end`](Self::end) has been called.
    pub async fn ended(&self) {
        let mut rx = self.ended.subscribe();
        let _ = rx.wait_for(|ended| *ended).await;
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("run_id", &self.run_id)
            .field("model", &self.model)
            .field("step", &self.step())
            .field("max_steps", &self.max_steps)
            .field("ended", &self.is_ended())
            .finish_non_exhaustive()
    }
}
