use crate::checkpoint::{CheckpointStore, JsonFileStore, MemoryStore};
use crate::config::{BrowserConfig, Config};
use crate::controller::{ControllerHandle, PromptResult, QueueController, RunSummary};
use crate::events::AutomationEvent;
use crate::{Error, Result};
use eoka::{Browser, Page};
use eoka_chat_agent::{target_problem, AgentWorker, EokaDriver, PageAgent};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

/// How often the page is sampled for DOM changes.
const CHANGE_FEED_INTERVAL: Duration = Duration::from_millis(250);
/// How often the tab URL is checked against the target.
const TARGET_WATCH_INTERVAL: Duration = Duration::from_secs(2);

/// Outcome of a whole run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub results: Vec<PromptResult>,
    /// Present when the queue ran to the end.
    pub summary: Option<RunSummary>,
    /// Why the run ended early, if it did.
    pub stopped: Option<String>,
    pub duration_ms: u64,
}

impl RunReport {
    fn from_event(event: AutomationEvent, started: Instant) -> Option<Self> {
        let duration_ms = started.elapsed().as_millis() as u64;
        match event {
            AutomationEvent::Complete { results, summary } => Some(Self {
                results,
                summary: Some(summary),
                stopped: None,
                duration_ms,
            }),
            AutomationEvent::Stopped {
                results, reason, ..
            } => Some(Self {
                results,
                summary: None,
                stopped: Some(reason),
                duration_ms,
            }),
            _ => None,
        }
    }

    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }

    /// Ran to the end with every prompt answered.
    pub fn is_success(&self) -> bool {
        self.stopped.is_none() && self.results.iter().all(|r| r.success)
    }
}

/// A run in progress: the controller, the agent worker and the target watch.
pub struct ChatSession {
    handle: ControllerHandle,
    events: broadcast::Receiver<AutomationEvent>,
    tasks: Vec<JoinHandle<()>>,
    started: Instant,
    _watch: DropGuard,
}

impl ChatSession {
    pub fn handle(&self) -> &ControllerHandle {
        &self.handle
    }

    /// Wait for the run to finish. Cancelling `shutdown` stops it early; the
    /// partial results still come back in the report.
    pub async fn wait(mut self, shutdown: CancellationToken) -> Result<RunReport> {
        let report = self.next_report(shutdown).await;
        self.abort_tasks();
        report
    }

    async fn next_report(&mut self, shutdown: CancellationToken) -> Result<RunReport> {
        let mut stopping = false;
        loop {
            tokio::select! {
                _ = shutdown.cancelled(), if !stopping => {
                    info!("Stopping run");
                    stopping = true;
                    self.handle.stop().await?;
                }
                event = self.events.recv() => match event {
                    Ok(event) => {
                        if let Some(report) = RunReport::from_event(event, self.started) {
                            return Ok(report);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Missed {} run events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(Error::ControllerGone);
                    }
                },
            }
        }
    }

    fn abort_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

/// Drives a chat page in a stealth browser.
pub struct ChatRunner {
    browser: Browser,
    page: Arc<Page>,
}

impl ChatRunner {
    /// Launch a browser with `config`.
    pub async fn new(config: &BrowserConfig) -> Result<Self> {
        let stealth = eoka::StealthConfig {
            headless: config.headless,
            proxy: config.proxy.clone(),
            user_agent: config.user_agent.clone(),
            viewport_width: config.viewport.as_ref().map(|v| v.width).unwrap_or(1280),
            viewport_height: config.viewport.as_ref().map(|v| v.height).unwrap_or(720),
            ..Default::default()
        };

        debug!(
            "Launching browser (headless: {}, proxy: {:?})",
            config.headless, config.proxy
        );
        let browser = Browser::launch_with_config(stealth).await?;
        let page = browser.new_page("about:blank").await?;

        Ok(Self {
            browser,
            page: Arc::new(page),
        })
    }

    pub fn page(&self) -> &Arc<Page> {
        &self.page
    }

    /// Open the target and start the queue. With `resume`, a checkpoint for
    /// the target picks up where it left off; otherwise a fresh run starts.
    pub async fn start(&mut self, config: &Config, resume: bool) -> Result<ChatSession> {
        info!("Navigating to: {}", config.target.url);
        self.page.goto(&config.target.url).await?;

        let target = config.target();
        let agent_config = config.agent_config();
        let store: Arc<dyn CheckpointStore> = match config.checkpoint.dir {
            Some(ref dir) => Arc::new(JsonFileStore::new(dir)),
            None => Arc::new(MemoryStore::new()),
        };

        let (agent_tx, agent_rx) = mpsc::unbounded_channel();
        let controller = QueueController::new(config.queue_policy(), agent_tx, store)
            .with_target_match(config.target.match_pattern.clone());
        let (handle, controller_task) = controller.spawn();
        let events = handle.subscribe();

        let driver = EokaDriver::new(self.page.clone()).with_change_feed(CHANGE_FEED_INTERVAL);
        let agent = PageAgent::new(driver, agent_config.clone());
        let worker = AgentWorker::new(agent, handle.clone(), target.id.clone());
        let worker_task = tokio::spawn(worker.run(agent_rx));

        let watch = CancellationToken::new();
        spawn_target_watch(
            self.page.clone(),
            handle.clone(),
            target.id.clone(),
            agent_config.target_match,
            watch.clone(),
        );

        let restored = resume && handle.restore(target.clone()).await?;
        if restored {
            handle.resume().await?;
        } else {
            if resume {
                info!("No checkpoint for {}, starting fresh", target.id);
            }
            handle.start(config.prompt_queue(), target).await?;
        }

        Ok(ChatSession {
            handle,
            events,
            tasks: vec![controller_task, worker_task],
            started: Instant::now(),
            _watch: watch.drop_guard(),
        })
    }

    /// Run the whole queue.
    pub async fn run(
        &mut self,
        config: &Config,
        resume: bool,
        shutdown: CancellationToken,
    ) -> Result<RunReport> {
        self.start(config, resume).await?.wait(shutdown).await
    }

    /// Close the browser.
    pub async fn close(self) -> Result<()> {
        drop(self.page);
        self.browser.close().await?;
        Ok(())
    }
}

/// Report the target as gone once the tab leaves it.
fn spawn_target_watch(
    page: Arc<Page>,
    handle: ControllerHandle,
    target: String,
    target_match: Option<String>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(TARGET_WATCH_INTERVAL) => {}
            }
            let url = match page.url().await {
                Ok(url) => url,
                Err(e) => {
                    debug!("target watch: {}", e);
                    continue;
                }
            };
            if let Some(reason) = target_problem(&url, target_match.as_deref()) {
                if handle.target_invalidated(target.clone(), reason).is_err() {
                    debug!("target watch: controller gone");
                }
                break;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::QueuePolicy;
    use chrono::Utc;
    use tokio::sync::oneshot;

    fn result(index: usize, success: bool) -> PromptResult {
        PromptResult {
            index,
            prompt_text: format!("p{}", index),
            response_text: if success { "ok".into() } else { String::new() },
            success,
            error: (!success).then(|| "permission denied".to_string()),
            retry_count: 0,
            started_at: Utc::now(),
            finished_at: Utc::now(),
        }
    }

    #[test]
    fn test_report_from_terminal_events() {
        let stopped = AutomationEvent::Stopped {
            results: vec![result(0, true)],
            completed: 1,
            total: 3,
            reason: "stopped by user".into(),
        };
        let report = RunReport::from_event(stopped, Instant::now()).unwrap();
        assert_eq!(report.stopped.as_deref(), Some("stopped by user"));
        assert_eq!(report.succeeded(), 1);
        assert!(!report.is_success());

        let paused = AutomationEvent::Paused {
            current: 1,
            total: 3,
        };
        assert!(RunReport::from_event(paused, Instant::now()).is_none());
    }

    #[test]
    fn test_report_success_requires_every_prompt() {
        let summary = RunSummary {
            total: 2,
            succeeded: 1,
            failed: 1,
            with_content: 1,
            total_retries: 0,
            success_rate: 50.0,
            duration_ms: 10,
        };
        let complete = AutomationEvent::Complete {
            results: vec![result(0, true), result(1, false)],
            summary,
        };
        let report = RunReport::from_event(complete, Instant::now()).unwrap();
        assert!(report.summary.is_some());
        assert!(!report.is_success());
    }

    #[tokio::test]
    async fn test_wait_aborts_tasks_when_controller_is_gone() {
        let (agent_tx, _agent_rx) = mpsc::unbounded_channel();
        let controller =
            QueueController::new(QueuePolicy::default(), agent_tx, Arc::new(MemoryStore::new()));
        let (handle, controller_task) = controller.spawn();
        controller_task.abort();
        let _ = controller_task.await;

        let (alive_tx, alive_rx) = oneshot::channel::<()>();
        let worker = tokio::spawn(async move {
            let _alive = alive_tx;
            std::future::pending::<()>().await;
        });
        let watch = CancellationToken::new();
        let session = ChatSession {
            events: handle.subscribe(),
            handle,
            tasks: vec![worker],
            started: Instant::now(),
            _watch: watch.clone().drop_guard(),
        };

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let result = session.wait(shutdown).await;
        assert!(matches!(result, Err(Error::ControllerGone)));
        assert!(alive_rx.await.is_err());
        assert!(watch.is_cancelled());
    }
}
