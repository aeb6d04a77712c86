//! Long-running agent task that consumes controller commands.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::agent::PageAgent;
use crate::driver::PageDriver;
use crate::protocol::{AgentCommand, AgentMessage};

/// Where the agent's messages go. Delivery is best-effort.
#[async_trait]
pub trait OutcomeSink: Send + Sync + 'static {
    async fn deliver(&self, message: AgentMessage);
}

#[async_trait]
impl OutcomeSink for mpsc::UnboundedSender<AgentMessage> {
    async fn deliver(&self, message: AgentMessage) {
        if self.send(message).is_err() {
            debug!("outcome dropped: receiver gone");
        }
    }
}

/// Owns a [`PageAgent`] and runs each `execute-prompt` in its own task.
pub struct AgentWorker<D, S> {
    agent: Arc<PageAgent<D>>,
    sink: Arc<S>,
    target: String,
}

impl<D, S> AgentWorker<D, S>
where
    D: PageDriver + 'static,
    S: OutcomeSink,
{
    /// `target` identifies the page in the readiness announcement.
    pub fn new(agent: PageAgent<D>, sink: S, target: impl Into<String>) -> Self {
        Self {
            agent: Arc::new(agent),
            sink: Arc::new(sink),
            target: target.into(),
        }
    }

    pub fn agent(&self) -> &Arc<PageAgent<D>> {
        &self.agent
    }

    /// Announce readiness, then serve commands until the channel closes.
    ///
    /// `Abort` cancels whatever is in flight; the aborted execution reports
    /// nothing. Duplicate dispatches are dropped by the agent itself.
    pub async fn run(self, mut commands: mpsc::UnboundedReceiver<AgentCommand>) {
        self.sink
            .deliver(AgentMessage::ContentScriptReady {
                target: self.target.clone(),
            })
            .await;
        info!("Agent ready on {}", self.target);

        let mut inflight = CancellationToken::new();
        while let Some(command) = commands.recv().await {
            match command {
                AgentCommand::ExecutePrompt(envelope) => {
                    debug!("execute-prompt {} (run {})", envelope.index, envelope.automation_id);
                    let agent = self.agent.clone();
                    let sink = self.sink.clone();
                    let cancel = inflight.child_token();
                    tokio::spawn(async move {
                        if let Some(outcome) = agent.execute(&envelope, &cancel).await {
                            sink.deliver(AgentMessage::PromptOutcome(outcome)).await;
                        }
                    });
                }
                AgentCommand::Abort => {
                    debug!("abort");
                    inflight.cancel();
                    inflight = CancellationToken::new();
                }
            }
        }
        inflight.cancel();
        info!("Agent on {} shut down", self.target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::fixture::{el, FakePage, Lengths, Reply};
    use crate::protocol::DispatchEnvelope;
    use crate::AgentConfig;

    fn dispatch(index: usize) -> AgentCommand {
        AgentCommand::ExecutePrompt(DispatchEnvelope {
            prompt_text: format!("prompt {}", index),
            index,
            per_attempt_timeout_ms: 60_000,
            automation_id: 9,
        })
    }

    fn reply(handle: &str, lengths: Lengths) -> Reply {
        let mut info = el("div", handle);
        info.text_len = 10;
        Reply::new(
            info,
            &["[data-message-author-role=\"assistant\"]"],
            lengths,
            "<p>reply</p>",
        )
    }

    fn spawn_worker(page: FakePage) -> (
        mpsc::UnboundedSender<AgentCommand>,
        mpsc::UnboundedReceiver<AgentMessage>,
    ) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let worker = AgentWorker::new(PageAgent::new(page, AgentConfig::default()), msg_tx, "tab-1");
        tokio::spawn(worker.run(cmd_rx));
        (cmd_tx, msg_rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_then_outcome() {
        let page = FakePage::chat();
        page.push_reply(reply("r1", Lengths::Fixed(vec![10])));
        let (commands, mut messages) = spawn_worker(page);

        assert_eq!(
            messages.recv().await,
            Some(AgentMessage::ContentScriptReady {
                target: "tab-1".into()
            })
        );

        commands.send(dispatch(0)).unwrap();
        match messages.recv().await {
            Some(AgentMessage::PromptOutcome(outcome)) => {
                assert!(outcome.success);
                assert_eq!(outcome.automation_id, 9);
                assert_eq!(outcome.response_text.as_deref(), Some("<p>reply</p>"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_silences_inflight_execution() {
        let page = FakePage::chat();
        page.push_reply(reply("r1", Lengths::Growing(10)));
        let (commands, mut messages) = spawn_worker(page);
        messages.recv().await;

        commands.send(dispatch(0)).unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        commands.send(AgentCommand::Abort).unwrap();

        let next = tokio::time::timeout(Duration::from_secs(120), messages.recv()).await;
        assert!(next.is_err(), "aborted execution must not report");
    }
}
