//! Queue controller: owns the run, sequences dispatches, applies retry,
//! pause and timeout policy.
//!
//! The controller runs as a single task. Everything that can change run
//! state (user commands, agent messages, timer firings) arrives through one
//! inbox and is handled to completion before the next input, so no locking
//! is needed. The agent is reached only through [`AgentCommand`]s; nothing
//! it sends is trusted to arrive exactly once.

mod handle;
pub mod policy;
pub mod run;
pub mod timer;

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use eoka_chat_agent::{AgentCommand, AgentMessage, DispatchEnvelope, OutcomeEnvelope};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::events::{AutomationEvent, ProgressStatus};
use crate::{Error, Result};

pub use handle::ControllerHandle;
pub use policy::{classify, Decision, FailureClass, QueuePolicy};
pub use run::{next_run_id, AutomationRun, Prompt, PromptResult, RunId, RunSummary, Target};
pub use timer::{Scheduler, TimerFired, TimerKind};

const EVENT_CAPACITY: usize = 256;

/// Everything the controller reacts to.
#[derive(Debug)]
pub enum ControllerInput {
    Start {
        prompts: Vec<Prompt>,
        target: Target,
        reply: oneshot::Sender<Result<RunId>>,
    },
    Stop {
        reply: oneshot::Sender<Result<()>>,
    },
    Pause {
        reply: oneshot::Sender<Result<()>>,
    },
    Resume {
        reply: oneshot::Sender<Result<()>>,
    },
    Restore {
        target: Target,
        reply: oneshot::Sender<Result<bool>>,
    },
    Status {
        reply: oneshot::Sender<Result<Option<AutomationRun>>>,
    },
    Agent(AgentMessage),
    TargetInvalidated {
        target: String,
        reason: String,
    },
    Timer(TimerFired),
}

pub struct QueueController {
    policy: QueuePolicy,
    target_match: Option<String>,
    agent: mpsc::UnboundedSender<AgentCommand>,
    store: Arc<dyn CheckpointStore>,
    events: broadcast::Sender<AutomationEvent>,
    scheduler: Scheduler,
    timers: mpsc::UnboundedReceiver<TimerFired>,
    run: Option<AutomationRun>,
}

impl QueueController {
    pub fn new(
        policy: QueuePolicy,
        agent: mpsc::UnboundedSender<AgentCommand>,
        store: Arc<dyn CheckpointStore>,
    ) -> Self {
        let (fired, timers) = mpsc::unbounded_channel();
        Self {
            policy,
            target_match: None,
            agent,
            store,
            events: broadcast::channel(EVENT_CAPACITY).0,
            scheduler: Scheduler::new(fired),
            timers,
            run: None,
        }
    }

    /// Require target URLs to contain `pattern`.
    pub fn with_target_match(mut self, pattern: Option<String>) -> Self {
        self.target_match = pattern;
        self
    }

    pub fn policy(&self) -> &QueuePolicy {
        &self.policy
    }

    /// Move the controller onto its own task.
    pub fn spawn(self) -> (ControllerHandle, JoinHandle<()>) {
        let (inbox, rx) = mpsc::unbounded_channel();
        let handle = ControllerHandle::new(inbox, self.events.clone());
        let task = tokio::spawn(self.serve(rx));
        (handle, task)
    }

    /// Handle inputs until every handle is dropped.
    async fn serve(mut self, mut inbox: mpsc::UnboundedReceiver<ControllerInput>) {
        loop {
            let input = tokio::select! {
                biased;
                input = inbox.recv() => match input {
                    Some(input) => input,
                    None => break,
                },
                Some(fired) = self.timers.recv() => ControllerInput::Timer(fired),
            };
            self.handle(input).await;
        }
        self.scheduler.cancel_all();
        debug!("Controller inbox closed");
    }

    pub async fn handle(&mut self, input: ControllerInput) {
        match input {
            ControllerInput::Start {
                prompts,
                target,
                reply,
            } => {
                let _ = reply.send(self.start(prompts, target).await);
            }
            ControllerInput::Stop { reply } => {
                self.stop("stopped by user").await;
                let _ = reply.send(Ok(()));
            }
            ControllerInput::Pause { reply } => {
                let _ = reply.send(self.pause().await);
            }
            ControllerInput::Resume { reply } => {
                let _ = reply.send(self.resume().await);
            }
            ControllerInput::Restore { target, reply } => {
                let _ = reply.send(self.restore(target).await);
            }
            ControllerInput::Status { reply } => {
                let _ = reply.send(Ok(self.run.clone()));
            }
            ControllerInput::Agent(AgentMessage::ContentScriptReady { target }) => {
                self.on_agent_ready(&target).await;
            }
            ControllerInput::Agent(AgentMessage::PromptOutcome(outcome)) => {
                self.on_outcome(outcome).await;
            }
            ControllerInput::TargetInvalidated { target, reason } => {
                self.on_target_invalidated(&target, &reason).await;
            }
            ControllerInput::Timer(fired) => self.on_timer(fired).await,
        }
    }

    fn validate_target(&self, target: &Target) -> Result<()> {
        if target.id.trim().is_empty() {
            return Err(Error::InvalidTarget("empty target id".into()));
        }
        if !(target.url.starts_with("https://") || target.url.starts_with("http://")) {
            return Err(Error::InvalidTarget(format!("not a web page: {}", target.url)));
        }
        if let Some(ref pattern) = self.target_match {
            if !target.url.contains(pattern.as_str()) {
                return Err(Error::InvalidTarget(format!(
                    "{} does not match {}",
                    target.url, pattern
                )));
            }
        }
        Ok(())
    }

    pub async fn start(&mut self, prompts: Vec<Prompt>, target: Target) -> Result<RunId> {
        if self.run.is_some() {
            return Err(Error::AlreadyRunning);
        }
        if prompts.is_empty() {
            return Err(Error::EmptyQueue);
        }
        self.validate_target(&target)?;

        let id = next_run_id();
        let total = prompts.len();
        info!("Starting run {} with {} prompts on {}", id, total, target.url);
        self.run = Some(AutomationRun::new(id, target, prompts));
        self.checkpoint().await;
        self.emit(AutomationEvent::Started { total });
        self.dispatch_current().await;
        Ok(id)
    }

    /// End the run early. Partial results are kept and reported.
    pub async fn stop(&mut self, reason: &str) {
        let Some(run) = self.run.take() else {
            debug!("stop: no active run");
            return;
        };
        self.scheduler.cancel_all();
        if run.in_flight.is_some() {
            self.send_abort();
        }
        info!(
            "Run {} stopped after {}/{} prompts: {}",
            run.id,
            run.completed_indices.len(),
            run.total(),
            reason
        );
        self.finalize(&run).await;
        self.emit(AutomationEvent::Stopped {
            completed: run.completed_indices.len(),
            total: run.total(),
            results: run.results,
            reason: reason.to_string(),
        });
    }

    pub async fn pause(&mut self) -> Result<()> {
        let run = match self.run.as_mut() {
            Some(run) if run.is_running && !run.is_paused => run,
            _ => return Err(Error::NotRunning),
        };
        run.is_paused = true;
        let (current, total) = (run.current_index, run.total());
        self.scheduler.cancel(TimerKind::Dispatch);
        info!("Paused at prompt {}/{}", current + 1, total);
        self.checkpoint().await;
        self.emit(AutomationEvent::Paused { current, total });
        Ok(())
    }

    pub async fn resume(&mut self) -> Result<()> {
        let run = match self.run.as_mut() {
            Some(run) if run.is_paused => run,
            _ => return Err(Error::NotPaused),
        };
        run.is_paused = false;
        let (current, total) = (run.current_index, run.total());
        info!("Resumed at prompt {}/{}", current + 1, total);
        self.emit(AutomationEvent::Resumed { current, total });
        self.dispatch_current().await;
        Ok(())
    }

    /// Rebuild the run for `target` from its checkpoint.
    pub async fn restore(&mut self, target: Target) -> Result<bool> {
        if self.run.is_some() {
            return Err(Error::AlreadyRunning);
        }
        self.validate_target(&target)?;
        let Some(checkpoint) = self.store.load(&target.id).await? else {
            return Ok(false);
        };
        let mut run = checkpoint.run;
        run.reset_transient();
        run.target = target;
        run.is_running = true;
        run.is_paused = true;
        info!(
            "Restored run {} at prompt {}/{} (saved {})",
            run.id,
            run.current_index + 1,
            run.total(),
            checkpoint.saved_at
        );
        let (current, total) = (run.current_index, run.total());
        self.run = Some(run);
        self.emit(AutomationEvent::Paused { current, total });
        Ok(true)
    }

    async fn on_agent_ready(&mut self, target: &str) {
        let Some(ref run) = self.run else {
            return;
        };
        if run.target.id != target {
            debug!("agent ready on {}, run is on {}", target, run.target.id);
            return;
        }
        if run.in_flight.is_none() && !self.scheduler.is_pending(TimerKind::Dispatch) {
            debug!("agent ready, dispatching");
            self.dispatch_current().await;
        }
    }

    async fn on_target_invalidated(&mut self, target: &str, reason: &str) {
        let matches = self.run.as_ref().is_some_and(|run| run.target.id == target);
        if matches {
            warn!("Target invalidated: {}", reason);
            self.stop(&format!("target invalidated: {}", reason)).await;
        }
    }

    async fn on_timer(&mut self, fired: TimerFired) {
        if !self.scheduler.accept(fired) {
            debug!("stale timer {:?}", fired);
            return;
        }
        match fired.kind {
            TimerKind::Dispatch => self.dispatch_current().await,
            TimerKind::Watchdog => self.on_dispatch_timeout().await,
        }
    }

    /// Send the prompt at `current_index`, unless paused, busy or done.
    async fn dispatch_current(&mut self) {
        let Some(run) = self.run.as_mut() else {
            return;
        };
        if !run.is_running || run.is_paused || run.in_flight.is_some() {
            debug!("dispatch skipped");
            return;
        }
        if run.is_done() {
            self.complete().await;
            return;
        }

        let index = run.current_index;
        let envelope = DispatchEnvelope {
            prompt_text: run.prompts[index].text.clone(),
            index,
            per_attempt_timeout_ms: self.policy.prompt_timeout_ms,
            automation_id: run.id,
        };
        run.begin(index);
        let attempt = run.attempts(index) + 1;
        let (current, total) = (run.completed_indices.len(), run.total());

        debug!("Dispatching prompt {} (attempt {})", index, attempt);
        if self
            .agent
            .send(AgentCommand::ExecutePrompt(envelope))
            .is_err()
        {
            warn!("Agent unreachable; waiting for the dispatch to time out");
        }
        self.scheduler
            .schedule(TimerKind::Watchdog, self.policy.watchdog());
        self.emit(AutomationEvent::Progress {
            current,
            total,
            index,
            status: ProgressStatus::Dispatched,
            attempt,
            max_retries: self.policy.max_retries,
            message: None,
        });
        self.checkpoint().await;
    }

    /// The agent never answered: abandon the attempt and fail it.
    pub async fn on_dispatch_timeout(&mut self) {
        let Some(index) = self.run.as_ref().and_then(|r| r.in_flight_index()) else {
            return;
        };
        self.send_abort();
        let secs = self.policy.watchdog().as_secs();
        warn!("Prompt {} got no outcome within {}s", index, secs);
        let started = self.run.as_mut().and_then(|r| r.settle());
        self.fail(index, format!("timeout: no outcome within {}s", secs), started)
            .await;
    }

    pub async fn on_outcome(&mut self, outcome: OutcomeEnvelope) {
        let Some(run) = self.run.as_mut() else {
            debug!("outcome for prompt {} with no active run", outcome.index);
            return;
        };
        if outcome.automation_id != run.id {
            debug!(
                "outcome for run {} dropped (current run {})",
                outcome.automation_id, run.id
            );
            return;
        }
        if run.completed_indices.contains(&outcome.index) {
            info!("Duplicate outcome for prompt {} ignored", outcome.index);
            return;
        }
        if run.in_flight_index() != Some(outcome.index) {
            // A real answer that lost the race with the watchdog still counts,
            // as long as nothing else is in flight.
            let late_answer = outcome.success
                && run.in_flight.is_none()
                && outcome.index == run.current_index;
            if !late_answer {
                debug!("late outcome for prompt {} ignored", outcome.index);
                return;
            }
            info!("Late answer for prompt {} accepted", outcome.index);
            self.scheduler.cancel(TimerKind::Dispatch);
            let started = Utc.timestamp_millis_opt(outcome.start_time).single();
            self.succeed(outcome, started).await;
            return;
        }

        self.scheduler.cancel(TimerKind::Watchdog);
        let dispatched = run.settle();
        let started = Utc
            .timestamp_millis_opt(outcome.start_time)
            .single()
            .or(dispatched);

        if outcome.success {
            self.succeed(outcome, started).await;
        } else {
            let message = outcome
                .error_message
                .unwrap_or_else(|| "unknown error".to_string());
            self.fail(outcome.index, message, started).await;
        }
    }

    async fn succeed(&mut self, outcome: OutcomeEnvelope, started: Option<DateTime<Utc>>) {
        let Some(run) = self.run.as_mut() else {
            return;
        };
        let index = outcome.index;
        let result = PromptResult {
            index,
            prompt_text: run.prompts[index].text.clone(),
            response_text: outcome.response_text.unwrap_or_default(),
            success: true,
            error: None,
            retry_count: run.attempts(index),
            started_at: started.unwrap_or_else(Utc::now),
            finished_at: Utc::now(),
        };
        let attempt = result.retry_count + 1;
        run.record(result);
        let pause_after = run.prompts[index].pause_after;
        let (current, total) = (run.completed_indices.len(), run.total());
        info!("Prompt {}/{} completed", index + 1, total);

        self.emit(AutomationEvent::Progress {
            current,
            total,
            index,
            status: ProgressStatus::Completed,
            attempt,
            max_retries: self.policy.max_retries,
            message: None,
        });
        self.checkpoint().await;
        self.advance(pause_after).await;
    }

    async fn fail(&mut self, index: usize, message: String, started: Option<DateTime<Utc>>) {
        let Some(run) = self.run.as_mut() else {
            return;
        };
        let attempts = run.attempts(index);
        let (current, total) = (run.completed_indices.len(), run.total());
        let max_retries = self.policy.max_retries;

        match self.policy.decide(&message, attempts) {
            Decision::Stop => {
                warn!("Prompt {} failed fatally: {}", index, message);
                self.stop(&message).await;
            }
            Decision::Retry { attempt } => {
                run.retry_attempts.insert(index, attempt);
                let paused = run.is_paused;
                warn!(
                    "Prompt {} failed ({}), retry {}/{}",
                    index, message, attempt, max_retries
                );
                self.emit(AutomationEvent::Progress {
                    current,
                    total,
                    index,
                    status: ProgressStatus::Retrying,
                    attempt: attempt + 1,
                    max_retries,
                    message: Some(message),
                });
                self.checkpoint().await;
                if !paused {
                    self.scheduler
                        .schedule(TimerKind::Dispatch, self.policy.retry_delay());
                }
            }
            Decision::Pause => {
                run.retry_attempts.remove(&index);
                run.is_paused = true;
                let position = run.current_index;
                warn!("Prompt {} failed ({}), pausing", index, message);
                self.scheduler.cancel(TimerKind::Dispatch);
                self.checkpoint().await;
                self.emit(AutomationEvent::Error { index, message });
                self.emit(AutomationEvent::Paused {
                    current: position,
                    total,
                });
            }
            Decision::Skip { pause } => {
                let result = PromptResult {
                    index,
                    prompt_text: run.prompts[index].text.clone(),
                    response_text: String::new(),
                    success: false,
                    error: Some(message.clone()),
                    retry_count: attempts,
                    started_at: started.unwrap_or_else(Utc::now),
                    finished_at: Utc::now(),
                };
                run.record(result);
                warn!("Prompt {} failed ({}), skipping", index, message);
                self.emit(AutomationEvent::Progress {
                    current: current + 1,
                    total,
                    index,
                    status: ProgressStatus::Failed,
                    attempt: attempts + 1,
                    max_retries,
                    message: Some(message.clone()),
                });
                if pause {
                    self.emit(AutomationEvent::Error { index, message });
                }
                self.checkpoint().await;
                self.advance(pause).await;
            }
        }
    }

    /// After a recorded result: finish, pause (for `pause_after` or a failure
    /// under `pause_on_error`), or schedule the next prompt.
    async fn advance(&mut self, pause_after: bool) {
        let Some(run) = self.run.as_mut() else {
            return;
        };
        if run.is_done() {
            self.complete().await;
            return;
        }
        if pause_after && !run.is_paused {
            run.is_paused = true;
            let (current, total) = (run.current_index, run.total());
            info!("Paused before prompt {}/{}", current + 1, total);
            self.checkpoint().await;
            self.emit(AutomationEvent::Paused { current, total });
            return;
        }
        if !run.is_paused {
            self.scheduler
                .schedule(TimerKind::Dispatch, self.policy.inter_prompt_delay());
        }
    }

    async fn complete(&mut self) {
        let Some(run) = self.run.take() else {
            return;
        };
        self.scheduler.cancel_all();
        let summary = run.summary(Utc::now());
        info!(
            "Run {} complete: {}/{} succeeded, {} retries",
            run.id, summary.succeeded, summary.total, summary.total_retries
        );
        self.finalize(&run).await;
        self.emit(AutomationEvent::Complete {
            results: run.results,
            summary,
        });
    }

    /// Persist final results and drop the checkpoint.
    async fn finalize(&self, run: &AutomationRun) {
        if let Err(e) = self.store.save_results(&run.target.id, &run.results).await {
            warn!("Failed to save results: {}", e);
        }
        if let Err(e) = self.store.clear(&run.target.id).await {
            warn!("Failed to clear checkpoint: {}", e);
        }
    }

    async fn checkpoint(&self) {
        let Some(ref run) = self.run else {
            return;
        };
        if let Err(e) = self.store.save(&run.target.id, &Checkpoint::of(run)).await {
            warn!("Failed to save checkpoint: {}", e);
        }
    }

    fn send_abort(&self) {
        if self.agent.send(AgentCommand::Abort).is_err() {
            debug!("abort not delivered: agent gone");
        }
    }

    fn emit(&self, event: AutomationEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
