//! Run driver: owns the plan/act loop of one run.
//!
//! The driver starts the output assembler and the tool dispatcher, then asks
//! the planner for the next action until a terminal one comes back. Every
//! asynchronous action is issued only after the driver has armed the
//! rendezvous it will wait on, so its completion signal cannot be missed.

use runloop_core::error::{Error, StoreError};
use runloop_core::event::StreamEvent;
use runloop_core::provider::Provider;
use runloop_core::run::{Run, RunError, RunErrorCode, RunStatus};
use runloop_core::store::{HistoryProvider, RunStore};
use runloop_core::tool::{ToolRegistry, ToolResult};
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

use super::message::MessageExecutor;
use super::tool::ToolExecutor;
use crate::builder::ContextBuilder;
use crate::context::{ExecutionContext, StepSignal};
use crate::event::RunEvent;
use crate::llm::spawn_llm_call;
use crate::planner::{Action, Decision, Planner};
use crate::settings::EngineSettings;
use crate::token::TokenCounter;

/// How a run's loop ended.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub status: RunStatus,
    /// The terminal decision
    pub decision: Decision,
    /// Planner iterations taken
    pub steps: u32,
    pub error: Option<RunError>,
}

/// Starts runs and resumes paused ones.
pub struct RunExecutor {
    store: Arc<dyn RunStore>,
    history: Arc<dyn HistoryProvider>,
    provider: Arc<dyn Provider>,
    tools: Arc<ToolRegistry>,
    settings: EngineSettings,
    planner: Arc<Planner>,
    llm_pool: Arc<Semaphore>,
    tool_pool: Arc<Semaphore>,
}

impl RunExecutor {
    pub fn new(
        store: Arc<dyn RunStore>,
        history: Arc<dyn HistoryProvider>,
        provider: Arc<dyn Provider>,
        tools: Arc<ToolRegistry>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            llm_pool: Arc::new(Semaphore::new(settings.llm_concurrency.max(1))),
            tool_pool: Arc::new(Semaphore::new(settings.tool_concurrency.max(1))),
            planner: Arc::new(Planner::default()),
            store,
            history,
            provider,
            tools,
            settings,
        }
    }

    /// Count tokens with `counter` when truncating.
    pub fn with_token_counter(mut self, counter: Arc<dyn TokenCounter>) -> Self {
        self.planner = Arc::new(Planner::new(counter));
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Start (or resume) the loop for `run_id`.
    ///
    /// Fails only if the context cannot be built; everything after that is
    /// reported through the returned handle.
    pub async fn start(&self, run_id: &str) -> Result<RunHandle, Error> {
        let builder = ContextBuilder::new(
            self.store.clone(),
            self.history.clone(),
            self.tools.clone(),
            self.settings.clone(),
        );
        let ctx = match builder.build(run_id).await {
            Ok(ctx) => Arc::new(ctx),
            Err(e) => {
                self.fail_unbuildable(run_id, &e).await;
                return Err(e);
            }
        };

        let (tx, rx) = mpsc::channel(self.settings.event_buffer.max(1));
        let assembler = tokio::spawn(
            MessageExecutor::new(
                ctx.clone(),
                self.store.clone(),
                tx,
                self.settings.flush_timeout,
            )
            .run(),
        );
        let dispatcher = tokio::spawn(
            ToolExecutor::new(
                ctx.clone(),
                self.store.clone(),
                self.tools.clone(),
                self.tool_pool.clone(),
                self.settings.output_poll_interval,
            )
            .run(),
        );

        let driver = RunDriver {
            ctx: ctx.clone(),
            store: self.store.clone(),
            provider: self.provider.clone(),
            planner: self.planner.clone(),
            llm_pool: self.llm_pool.clone(),
            settings: self.settings.clone(),
        };
        let driver = tokio::spawn(driver.drive(assembler, dispatcher));

        Ok(RunHandle {
            run_id: run_id.to_string(),
            ctx,
            events: rx,
            driver,
        })
    }

    /// Record caller-supplied outputs for a paused run and resume it.
    pub async fn submit_tool_outputs(
        &self,
        run_id: &str,
        outputs: Vec<ToolResult>,
    ) -> Result<RunHandle, Error> {
        let run = self.store.get_run(run_id).await?;
        if run.status != RunStatus::RequiresAction {
            return Err(StoreError::IllegalTransition {
                from: run.status,
                to: RunStatus::InProgress,
            }
            .into());
        }
        for output in &outputs {
            self.store.finish_tool_call(run_id, output).await?;
        }
        info!(run_id, outputs = outputs.len(), "Tool outputs submitted, resuming run");
        self.start(run_id).await
    }

    /// A run whose conversation can no longer be loaded is failed as `not_found`.
    async fn fail_unbuildable(&self, run_id: &str, error: &Error) {
        let Error::Store(StoreError::NotFound { kind, .. }) = error else {
            return;
        };
        if *kind == "run" {
            return;
        }
        let run_error = RunError::new(RunErrorCode::NotFound, error.to_string());
        if let Err(e) = self.store.to_failed(run_id, &run_error).await {
            warn!(run_id, error = %e, "Could not fail unbuildable run");
        }
    }
}

struct RunDriver {
    ctx: Arc<ExecutionContext>,
    store: Arc<dyn RunStore>,
    provider: Arc<dyn Provider>,
    planner: Arc<Planner>,
    llm_pool: Arc<Semaphore>,
    settings: EngineSettings,
}

/// Background tasks the driver depends on. A slot is emptied once its task
/// has been joined.
struct Workers {
    assembler: Option<JoinHandle<()>>,
    dispatcher: Option<JoinHandle<()>>,
    llm: Option<JoinHandle<()>>,
}

/// Join `task` if it is still held; never resolves otherwise.
async fn join_worker(task: &mut Option<JoinHandle<()>>) -> Result<(), JoinError> {
    match task {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

fn worker_exited(name: &str, joined: Result<(), JoinError>) -> Error {
    match joined {
        Ok(()) => Error::Internal(format!("{name} stopped while an action was in flight")),
        Err(e) => Error::Internal(format!("{name} failed: {e}")),
    }
}

impl RunDriver {
    async fn drive(self, assembler: JoinHandle<()>, dispatcher: JoinHandle<()>) -> RunOutcome {
        let run_id = self.ctx.run_id().to_string();
        let mut decision = Decision::init();
        let mut status = RunStatus::Queued;
        let mut workers = Workers {
            assembler: Some(assembler),
            dispatcher: Some(dispatcher),
            llm: None,
        };

        if let Err(e) = self.run_loop(&mut decision, &mut status, &mut workers).await {
            error!(%run_id, error = %e, "Run loop failed");
            self.ctx
                .set_error(RunError::new(RunErrorCode::ServerError, e.to_string()));
            decision = Decision::new(Action::Error, e.to_string());
            if let Some(error) = self.ctx.last_error() {
                match self.store.to_failed(&run_id, &error).await {
                    Ok(run) => {
                        status = run.status;
                        self.publish_status(&run);
                    }
                    Err(e) => {
                        warn!(%run_id, error = %e, "Could not mark run failed");
                        if let Ok(run) = self.store.get_run(&run_id).await {
                            status = run.status;
                        }
                    }
                }
            }
        }

        self.ctx.end();
        if let Some(llm) = workers.llm.take() {
            llm.abort();
        }
        if let Some(dispatcher) = workers.dispatcher.take()
            && let Err(e) = dispatcher.await
        {
            warn!(%run_id, error = %e, "Tool dispatcher panicked");
        }

        let error = self.ctx.last_error();
        if let Some(error) = &error {
            self.ctx.publish(RunEvent::Error(error.clone()));
        }
        if let Some(assembler) = workers.assembler.take() {
            let (ack, acked) = oneshot::channel();
            self.ctx.publish(RunEvent::Done { ack: Some(ack) });
            match tokio::time::timeout(self.settings.flush_timeout, acked).await {
                Ok(Ok(())) => {}
                _ => warn!(%run_id, "Output assembler did not acknowledge the done marker"),
            }
            if assembler.is_finished()
                && let Err(e) = assembler.await
            {
                warn!(%run_id, error = %e, "Output assembler panicked");
            }
        }

        info!(
            %run_id,
            %status,
            action = %decision.action,
            steps = self.ctx.step(),
            "Run finished"
        );
        RunOutcome {
            status,
            decision,
            steps: self.ctx.step(),
            error,
        }
    }

    async fn run_loop(
        &self,
        decision: &mut Decision,
        status: &mut RunStatus,
        workers: &mut Workers,
    ) -> Result<(), Error> {
        let run = self.store.to_in_progress(self.ctx.run_id()).await?;
        *status = run.status;
        self.publish_status(&run);

        while decision.needs_execution() {
            let step = self.ctx.increment_step();
            *decision = self.planner.next_step(&self.ctx);
            debug!(
                run_id = self.ctx.run_id(),
                step,
                action = %decision.action,
                reason = %decision.reason,
                "Planner decision"
            );

            match decision.action {
                Action::Init => {}
                Action::LlmCall => {
                    let rx = self.ctx.arm_runner();
                    workers.llm = Some(spawn_llm_call(
                        self.ctx.clone(),
                        self.provider.clone(),
                        self.llm_pool.clone(),
                        self.settings.retry.clone(),
                    ));
                    self.wait(rx, workers).await?;
                }
                Action::WaitForTool => {
                    let rx = self.ctx.arm_runner();
                    if self.ctx.release_tool_calls() == 0 {
                        return Err(Error::Internal("no tool calls to dispatch".into()));
                    }
                    self.wait(rx, workers).await?;
                }
                Action::WaitForInput
                | Action::Complete
                | Action::Canceled
                | Action::Error
                | Action::Expired => {
                    let run = self.transition(decision).await?;
                    *status = run.status;
                    self.publish_status(&run);
                }
            }
        }
        Ok(())
    }

    /// Wait for the armed signal. A worker that dies first would never
    /// send it, so its exit fails the wait instead.
    async fn wait(
        &self,
        rx: oneshot::Receiver<StepSignal>,
        workers: &mut Workers,
    ) -> Result<(), Error> {
        let signalled = self.ctx.runner_await(rx);
        tokio::pin!(signalled);
        loop {
            tokio::select! {
                biased;
                signal = &mut signalled => {
                    return match signal {
                        StepSignal::Ended => Err(Error::Internal(
                            "execution context ended while an action was in flight".into(),
                        )),
                        signal => {
                            debug!(run_id = self.ctx.run_id(), ?signal, "Action finished");
                            Ok(())
                        }
                    };
                }
                joined = join_worker(&mut workers.llm) => {
                    workers.llm = None;
                    if let Err(e) = joined {
                        error!(run_id = self.ctx.run_id(), error = %e, "Model call task panicked");
                        return Err(Error::Internal(format!("model call task failed: {e}")));
                    }
                }
                joined = join_worker(&mut workers.assembler) => {
                    workers.assembler = None;
                    return Err(worker_exited("output assembler", joined));
                }
                joined = join_worker(&mut workers.dispatcher) => {
                    workers.dispatcher = None;
                    return Err(worker_exited("tool dispatcher", joined));
                }
            }
        }
    }

    async fn transition(&self, decision: &Decision) -> Result<Run, StoreError> {
        let run_id = self.ctx.run_id();
        match decision.action {
            Action::Complete => self.store.to_completed(run_id).await,
            Action::Canceled => self.store.to_cancelled(run_id).await,
            Action::Expired => {
                self.store
                    .to_expired(run_id, self.ctx.last_error().as_ref())
                    .await
            }
            Action::WaitForInput => {
                self.store
                    .to_requires_action(run_id, &self.ctx.requires_action())
                    .await
            }
            _ => {
                let error = self.ctx.last_error().unwrap_or_else(|| {
                    RunError::new(RunErrorCode::ServerError, decision.reason.clone())
                });
                self.store.to_failed(run_id, &error).await
            }
        }
    }

    fn publish_status(&self, run: &Run) {
        self.ctx
            .publish(RunEvent::Lifecycle(StreamEvent::RunStatusChanged {
                run_id: run.id.clone(),
                status: run.status,
                last_error: run.last_error.clone(),
            }));
    }
}

/// A started run: its event stream, cancellation, and completion.
pub struct RunHandle {
    run_id: String,
    ctx: Arc<ExecutionContext>,
    events: mpsc::Receiver<StreamEvent>,
    driver: JoinHandle<RunOutcome>,
}

impl RunHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Request cancellation. Takes effect at the next planner iteration; an
    /// action already in flight is allowed to finish.
    pub fn cancel(&self) {
        info!(run_id = %self.run_id, "Run cancellation requested");
        self.ctx.cancel();
    }

    /// The next event, or `None` once the stream is done.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    /// The event stream. The run keeps going in the background.
    pub fn into_stream(self) -> ReceiverStream<StreamEvent> {
        ReceiverStream::new(self.events)
    }

    /// Wait for the loop to end, discarding any unread events.
    pub async fn join(self) -> Result<RunOutcome, Error> {
        drop(self.events);
        self.driver
            .await
            .map_err(|e| Error::Internal(format!("run driver failed: {e}")))
    }

    /// Collect every event and the outcome.
    pub async fn finish(mut self) -> Result<(Vec<StreamEvent>, RunOutcome), Error> {
        let mut events = Vec::new();
        while let Some(event) = self.events.recv().await {
            events.push(event);
        }
        let outcome = self
            .driver
            .await
            .map_err(|e| Error::Internal(format!("run driver failed: {e}")))?;
        Ok((events, outcome))
    }
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle")
            .field("run_id", &self.run_id)
            .finish_non_exhaustive()
    }
}
