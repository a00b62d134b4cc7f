//! The asynchronous chat-completion call and its retry policy.
//!
//! Retries are an explicit bounded loop: a failed attempt is retried only
//! while attempts remain, the error classifies as retryable, and nothing of
//! that attempt has been streamed out yet.

use std::sync::Arc;
use std::time::Duration;

use runloop_core::error::ProviderError;
use runloop_core::provider::{Provider, ProviderRequest, StreamChunk};
use runloop_core::run::{RunError, RunErrorCode};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::context::{ExecutionContext, StepSignal};
use crate::event::RunEvent;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before the attempt following failed attempt number `attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    pub fn should_retry(&self, error: &ProviderError, attempt: u32) -> bool {
        attempt < self.max_attempts && error.is_retryable()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

/// Build the request for the context's current message list.
pub(crate) fn build_request(ctx: &ExecutionContext) -> ProviderRequest {
    ProviderRequest {
        model: ctx.model().to_string(),
        messages: ctx.messages(),
        temperature: ctx.temperature(),
        max_tokens: None,
        tools: ctx.tools(),
        user: ctx.user().map(str::to_string),
    }
}

/// Stream one completion into the context's event queue, retrying per `retry`.
pub(crate) async fn stream_completion(
    ctx: &ExecutionContext,
    provider: &dyn Provider,
    retry: &RetryPolicy,
) -> Result<(), ProviderError> {
    let request = build_request(ctx);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let mut emitted = false;
        match stream_once(ctx, provider, request.clone(), &mut emitted).await {
            Ok(()) => {
                debug!(run_id = ctx.run_id(), attempt, "LLM call finished");
                return Ok(());
            }
            Err(e) if !emitted && retry.should_retry(&e, attempt) => {
                let delay = retry.backoff(attempt);
                warn!(
                    run_id = ctx.run_id(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "LLM call failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn stream_once(
    ctx: &ExecutionContext,
    provider: &dyn Provider,
    request: ProviderRequest,
    emitted: &mut bool,
) -> Result<(), ProviderError> {
    let mut rx = provider.stream(request).await?;
    while let Some(item) = rx.recv().await {
        let chunk = item?;
        let done = chunk.done;
        if carries_output(&chunk) {
            *emitted = true;
            ctx.publish(RunEvent::LlmDelta(chunk));
        }
        if done {
            break;
        }
    }
    Ok(())
}

fn carries_output(chunk: &StreamChunk) -> bool {
    chunk.content.as_deref().is_some_and(|c| !c.is_empty())
        || chunk.reasoning.as_deref().is_some_and(|r| !r.is_empty())
        || !chunk.tool_calls.is_empty()
}

/// Run one LLM turn in the background.
///
/// On success the output assembler signals the driver once the message is
/// persisted; on failure this task records `llm_error` and signals directly.
pub(crate) fn spawn_llm_call(
    ctx: Arc<ExecutionContext>,
    provider: Arc<dyn Provider>,
    pool: Arc<Semaphore>,
    retry: RetryPolicy,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let Ok(_permit) = pool.acquire_owned().await else {
            ctx.set_error(RunError::new(
                RunErrorCode::ServerError,
                "LLM worker pool is closed",
            ));
            ctx.signal(StepSignal::Failed);
            return;
        };

        match stream_completion(&ctx, provider.as_ref(), &retry).await {
            Ok(()) => ctx.publish(RunEvent::LlmTurnFinished),
            Err(e) => {
                error!(run_id = ctx.run_id(), provider = provider.name(), error = %e, "LLM call failed");
                ctx.set_error(RunError::new(RunErrorCode::LlmError, e.to_string()));
                ctx.publish(RunEvent::LlmTurnFailed);
                ctx.signal(StepSignal::Failed);
            }
        }
    })
}
