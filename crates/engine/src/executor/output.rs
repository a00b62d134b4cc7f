//! Single-writer multiplexer over concurrently produced tool output.
//!
//! Final tools push chunks keyed by tool call id without blocking. A drain
//! task relays them to the event queue one id at a time: the id the context
//! names as current drains exclusively until its producer finishes and its
//! queue is empty; only then may another id become current.

use runloop_core::event::ContentDelta;
use runloop_core::tool::{ToolOutput, ToolOutputSink};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::context::ExecutionContext;
use crate::event::RunEvent;

#[derive(Default)]
struct ChannelState {
    queues: HashMap<String, VecDeque<ContentDelta>>,
    /// Registration order, used to pick the next current id
    order: Vec<String>,
    finished: HashSet<String>,
    closed: bool,
}

struct ChannelInner {
    ctx: Arc<ExecutionContext>,
    state: Mutex<ChannelState>,
    wake: Notify,
    poll_interval: Duration,
}

fn lock(state: &Mutex<ChannelState>) -> MutexGuard<'_, ChannelState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ToolOutputSink for ChannelInner {
    fn push(&self, tool_call_id: &str, delta: ContentDelta) {
        {
            let mut state = lock(&self.state);
            if state.finished.contains(tool_call_id) {
                warn!(tool_call_id, "Dropping output written after the tool finished");
                return;
            }
            if !state.queues.contains_key(tool_call_id) {
                state.order.push(tool_call_id.to_string());
            }
            state
                .queues
                .entry(tool_call_id.to_string())
                .or_default()
                .push_back(delta);
        }
        self.wake.notify_one();
    }
}

/// What one drain pass did.
enum Drained {
    Progress,
    Idle,
    Exhausted,
}

impl ChannelInner {
    fn drain_once(&self) -> Drained {
        let mut state = lock(&self.state);

        // Finished producers that never wrote anything have nothing to relay.
        let silent: Vec<String> = state
            .finished
            .iter()
            .filter(|id| state.queues.get(*id).is_none_or(VecDeque::is_empty))
            .filter(|id| self.ctx.current_output().as_deref() != Some(id.as_str()))
            .filter(|id| !state.order.contains(id))
            .cloned()
            .collect();
        for id in &silent {
            state.finished.remove(id);
            self.ctx.finish_streaming(id);
        }

        let current = self
            .ctx
            .current_output()
            .filter(|id| state.queues.contains_key(id))
            .or_else(|| {
                state
                    .order
                    .iter()
                    .find(|id| state.queues.get(*id).is_some_and(|q| !q.is_empty()))
                    .cloned()
            });

        let Some(id) = current else {
            return if state.closed && state.queues.is_empty() && state.finished.is_empty() {
                Drained::Exhausted
            } else if silent.is_empty() {
                Drained::Idle
            } else {
                Drained::Progress
            };
        };

        if self.ctx.current_output().as_deref() != Some(id.as_str()) {
            trace!(run_id = self.ctx.run_id(), tool_call_id = %id, "Switching output stream");
            self.ctx.set_current_output(Some(id.clone()));
        }

        let batch: Vec<ContentDelta> = state
            .queues
            .get_mut(&id)
            .map(|q| q.drain(..).collect())
            .unwrap_or_default();
        let finished = state.finished.remove(&id);
        if finished {
            state.queues.remove(&id);
            state.order.retain(|o| o != &id);
        }
        drop(state);

        let progressed = finished || !batch.is_empty();
        for delta in batch {
            self.ctx.publish(RunEvent::ToolOutput {
                tool_call_id: id.clone(),
                delta,
            });
        }
        if finished {
            self.ctx.publish(RunEvent::ToolTurnFinished {
                tool_call_id: id.clone(),
            });
            self.ctx.finish_streaming(&id);
        }

        if progressed {
            Drained::Progress
        } else {
            Drained::Idle
        }
    }

    async fn run(self: Arc<Self>) {
        loop {
            let notified = self.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.drain_once() {
                Drained::Progress => continue,
                Drained::Exhausted => break,
                Drained::Idle => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
            }
        }
        debug!(run_id = self.ctx.run_id(), "Tool output channel drained");
    }
}

/// Serializes the output of one tool batch's final tools.
pub struct ToolOutputChannel {
    inner: Arc<ChannelInner>,
    drain: Mutex<Option<JoinHandle<()>>>,
}

impl ToolOutputChannel {
    /// Start the drain task for one batch.
    pub fn start(ctx: Arc<ExecutionContext>, poll_interval: Duration) -> Self {
        let inner = Arc::new(ChannelInner {
            ctx,
            state: Mutex::new(ChannelState::default()),
            wake: Notify::new(),
            poll_interval,
        });
        let drain = tokio::spawn(inner.clone().run());
        Self {
            inner,
            drain: Mutex::new(Some(drain)),
        }
    }

    /// The output handle a final tool writes through.
    pub fn output_for(&self, tool_call_id: &str) -> ToolOutput {
        self.inner.ctx.mark_streaming(tool_call_id);
        let sink: Arc<dyn ToolOutputSink> = self.inner.clone();
        ToolOutput::streaming(tool_call_id, sink)
    }

    /// The producer for `tool_call_id` will write nothing more.
    pub fn finish(&self, tool_call_id: &str) {
        lock(&self.inner.state)
            .finished
            .insert(tool_call_id.to_string());
        self.inner.wake.notify_one();
    }

    /// Close the channel and wait until everything pushed has been relayed.
    pub async fn end(&self) {
        lock(&self.inner.state).closed = true;
        self.inner.wake.notify_one();
        let drain = self
            .drain
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(drain) = drain else {
            return;
        };
        if let Err(e) = drain.await {
            warn!(run_id = self.inner.ctx.run_id(), error = %e, "Tool output drain task failed");
        }
    }
}
