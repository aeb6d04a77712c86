//! Cloneable front door to a running controller.

use async_trait::async_trait;
use eoka_chat_agent::{AgentMessage, OutcomeSink};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::debug;

use super::{AutomationRun, ControllerInput, Prompt, RunId, Target};
use crate::events::AutomationEvent;
use crate::{Error, Result};

#[derive(Clone)]
pub struct ControllerHandle {
    inbox: mpsc::UnboundedSender<ControllerInput>,
    events: broadcast::Sender<AutomationEvent>,
}

impl ControllerHandle {
    pub(super) fn new(
        inbox: mpsc::UnboundedSender<ControllerInput>,
        events: broadcast::Sender<AutomationEvent>,
    ) -> Self {
        Self { inbox, events }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> ControllerInput,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.inbox
            .send(make(tx))
            .map_err(|_| Error::ControllerGone)?;
        rx.await.map_err(|_| Error::ControllerGone)?
    }

    /// Start a run and dispatch its first prompt.
    pub async fn start(&self, prompts: Vec<Prompt>, target: Target) -> Result<RunId> {
        self.request(|reply| ControllerInput::Start {
            prompts,
            target,
            reply,
        })
        .await
    }

    /// Stop the run. A no-op without one.
    pub async fn stop(&self) -> Result<()> {
        self.request(|reply| ControllerInput::Stop { reply }).await
    }

    pub async fn pause(&self) -> Result<()> {
        self.request(|reply| ControllerInput::Pause { reply }).await
    }

    pub async fn resume(&self) -> Result<()> {
        self.request(|reply| ControllerInput::Resume { reply }).await
    }

    /// Reload the checkpoint for `target`. The restored run comes back paused.
    /// Returns whether there was one.
    pub async fn restore(&self, target: Target) -> Result<bool> {
        self.request(|reply| ControllerInput::Restore { target, reply })
            .await
    }

    /// Snapshot of the current run, if any.
    pub async fn status(&self) -> Result<Option<AutomationRun>> {
        self.request(|reply| ControllerInput::Status { reply }).await
    }

    /// Forward a message from the agent.
    pub fn agent_message(&self, message: AgentMessage) -> Result<()> {
        self.inbox
            .send(ControllerInput::Agent(message))
            .map_err(|_| Error::ControllerGone)
    }

    /// Report that the page behind `target` is gone.
    pub fn target_invalidated(&self, target: impl Into<String>, reason: impl Into<String>) -> Result<()> {
        self.inbox
            .send(ControllerInput::TargetInvalidated {
                target: target.into(),
                reason: reason.into(),
            })
            .map_err(|_| Error::ControllerGone)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AutomationEvent> {
        self.events.subscribe()
    }
}

#[async_trait]
impl OutcomeSink for ControllerHandle {
    async fn deliver(&self, message: AgentMessage) {
        if self.agent_message(message).is_err() {
            debug!("agent message dropped: controller gone");
        }
    }
}
