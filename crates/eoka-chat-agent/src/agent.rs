//! Executes one prompt end-to-end against a page.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::completion::{CompletionConfig, CompletionDetector};
use crate::driver::{ElementInfo, PageDriver};
use crate::locator::{ElementKind, Locator, LocatorStrategy};
use crate::protocol::{DispatchEnvelope, OutcomeEnvelope};
use crate::wait::{self, WaitOptions, WaitOutcome};
use crate::{AgentError, Result};

/// URLs a tab shows once the chat page is gone.
const DEAD_SCHEMES: &[&str] = &["about:", "chrome-error:", "chrome:"];

/// Why `url` no longer counts as the automation target, if it doesn't.
pub fn target_problem(url: &str, target_match: Option<&str>) -> Option<String> {
    if url.is_empty() || DEAD_SCHEMES.iter().any(|s| url.starts_with(s)) {
        return Some(format!("page is at {:?}", url));
    }
    match target_match {
        Some(pattern) if !url.contains(pattern) => {
            Some(format!("{} does not match {}", url, pattern))
        }
        _ => None,
    }
}

/// Waiting for loading indicators before touching the page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettleConfig {
    /// How many times to check for loading indicators.
    pub max_checks: u32,
    pub check_interval_ms: u64,
    /// Fixed delay after the checks, whatever they found.
    pub delay_ms: u64,
}

impl Default for SettleConfig {
    fn default() -> Self {
        Self {
            max_checks: 10,
            check_interval_ms: 500,
            delay_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubmitConfig {
    /// Pause between scrolling the control into view and clicking it.
    pub pre_click_delay_ms: u64,
    /// How long to look for an effect after each click.
    pub effect_timeout_ms: u64,
    pub effect_poll_ms: u64,
}

impl Default for SubmitConfig {
    fn default() -> Self {
        Self {
            pre_click_delay_ms: 300,
            effect_timeout_ms: 2000,
            effect_poll_ms: 100,
        }
    }
}

/// Agent tuning. Everything here is replaceable from config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Substring the page URL must contain for the page to still count as
    /// the automation target.
    pub target_match: Option<String>,
    pub settle: SettleConfig,
    /// Bound on finding the input and the submit control.
    pub locate_timeout_ms: u64,
    pub locate_poll_ms: u64,
    pub submit: SubmitConfig,
    pub completion: CompletionConfig,
    pub locators: LocatorStrategy,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            target_match: None,
            settle: SettleConfig::default(),
            locate_timeout_ms: 10_000,
            locate_poll_ms: 250,
            submit: SubmitConfig::default(),
            completion: CompletionConfig::default(),
            locators: LocatorStrategy::default(),
        }
    }
}

impl AgentConfig {
    /// Upper bound on the time spent before the response wait starts:
    /// settling, locating both controls and both submit attempts.
    pub fn setup_budget(&self) -> Duration {
        let settle = u64::from(self.settle.max_checks) * self.settle.check_interval_ms
            + self.settle.delay_ms;
        let locate = 2 * self.locate_timeout_ms;
        let submit = self.submit.pre_click_delay_ms + 2 * self.submit.effect_timeout_ms;
        Duration::from_millis(settle + locate + submit)
    }
}

/// Holds the single-flight flag for the duration of one execution.
struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| BusyGuard(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// What the submit step needs to judge whether a click landed.
struct Clicked<'a> {
    input: &'a ElementInfo,
    submit: &'a ElementInfo,
    before: &'a HashSet<String>,
    /// Text was verified in the input, so an empty input means it was sent.
    inserted: bool,
}

/// Drives one page. Holds no state between prompts beyond the busy flag.
pub struct PageAgent<D> {
    driver: D,
    config: AgentConfig,
    detector: CompletionDetector,
    busy: AtomicBool,
}

impl<D: PageDriver> PageAgent<D> {
    pub fn new(driver: D, config: AgentConfig) -> Self {
        let detector = CompletionDetector::new(config.completion.clone());
        Self {
            driver,
            config,
            detector,
            busy: AtomicBool::new(false),
        }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Execute one prompt.
    ///
    /// Returns `None` when nothing should be reported: the agent was already
    /// busy (the duplicate is dropped), or the execution was cancelled.
    /// Every other failure becomes a failed outcome.
    pub async fn execute(
        &self,
        envelope: &DispatchEnvelope,
        cancel: &CancellationToken,
    ) -> Option<OutcomeEnvelope> {
        let Some(_guard) = BusyGuard::acquire(&self.busy) else {
            warn!(
                "Dropping prompt {} for run {}: already executing",
                envelope.index, envelope.automation_id
            );
            return None;
        };
        let start_time = chrono::Utc::now().timestamp_millis();
        info!("Executing prompt {}", envelope.index);

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(AgentError::Aborted),
            r = self.run(envelope, cancel) => r,
        };

        match result {
            Ok(text) => {
                info!("Prompt {} completed ({} chars)", envelope.index, text.len());
                Some(OutcomeEnvelope::completed(envelope, text, start_time))
            }
            Err(AgentError::Aborted) => {
                info!("Prompt {} aborted", envelope.index);
                None
            }
            Err(e) => {
                warn!("Prompt {} failed: {}", envelope.index, e);
                Some(OutcomeEnvelope::failed(envelope, e.to_string(), start_time))
            }
        }
    }

    async fn run(&self, envelope: &DispatchEnvelope, cancel: &CancellationToken) -> Result<String> {
        let locator = Locator::new(&self.driver, &self.config.locators);

        self.check_target().await?;
        self.settle(&locator).await?;

        let locate_timeout = Duration::from_millis(self.config.locate_timeout_ms);
        let locate_poll = Duration::from_millis(self.config.locate_poll_ms);

        let input = locator
            .locate(ElementKind::Input, locate_timeout, locate_poll, cancel)
            .await?;
        let report = self
            .driver
            .insert_text(&input.handle, &envelope.prompt_text)
            .await?;
        if report.verified {
            debug!("Inserted prompt via {:?}", report.method);
        } else {
            warn!("Could not verify prompt text in {}", input.handle);
        }

        let before = locator.response_snapshot().await?;
        debug!("{} response containers before submit", before.len());

        let submit = locator
            .locate(ElementKind::Submit, locate_timeout, locate_poll, cancel)
            .await?;
        let clicked = Clicked {
            input: &input,
            submit: &submit,
            before: &before,
            inserted: report.verified,
        };
        self.submit(&locator, &clicked, cancel).await?;

        self.detector
            .await_response(
                &self.driver,
                &self.config.locators,
                &before,
                Duration::from_millis(envelope.per_attempt_timeout_ms),
                cancel,
            )
            .await
    }

    /// Fails with `TargetInvalidated` once the page has left the chat surface.
    async fn check_target(&self) -> Result<()> {
        let url = self.driver.url().await?;
        match target_problem(&url, self.config.target_match.as_deref()) {
            Some(reason) => Err(AgentError::TargetInvalidated(reason)),
            None => Ok(()),
        }
    }

    async fn settle(&self, locator: &Locator<'_, D>) -> Result<()> {
        let cfg = &self.config.settle;
        for check in 0..cfg.max_checks {
            if !locator.is_loading().await? {
                break;
            }
            debug!("Page busy (check {}/{})", check + 1, cfg.max_checks);
            tokio::time::sleep(Duration::from_millis(cfg.check_interval_ms)).await;
        }
        tokio::time::sleep(Duration::from_millis(cfg.delay_ms)).await;
        Ok(())
    }

    /// Click, then pointer-click if the click changed nothing.
    async fn submit(
        &self,
        locator: &Locator<'_, D>,
        clicked: &Clicked<'_>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let handle = clicked.submit.handle.as_str();
        self.driver.scroll_into_view(handle).await?;
        tokio::time::sleep(Duration::from_millis(self.config.submit.pre_click_delay_ms)).await;

        self.driver.click(handle).await?;
        if self.submitted(locator, clicked, cancel).await? {
            return Ok(());
        }

        debug!("Click on {} had no effect, trying pointer click", handle);
        self.driver.pointer_click(handle).await?;
        if self.submitted(locator, clicked, cancel).await? {
            return Ok(());
        }

        Err(AgentError::SubmissionFailed(format!(
            "no effect after clicking {}",
            handle
        )))
    }

    /// Watch for any sign the prompt went out: the input emptied, a new
    /// response appeared, or the control got disabled or removed.
    async fn submitted(
        &self,
        locator: &Locator<'_, D>,
        clicked: &Clicked<'_>,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let cfg = &self.config.submit;
        let outcome = wait::wait_until(
            WaitOptions::new(
                Duration::from_millis(cfg.effect_poll_ms),
                Duration::from_millis(cfg.effect_timeout_ms),
            ),
            self.driver.changes(),
            cancel,
            |_| async move {
                if clicked.inserted {
                    let value = self.driver.read_input(&clicked.input.handle).await?;
                    if value.map_or(true, |v| v.trim().is_empty()) {
                        return Ok(Some("input cleared"));
                    }
                }
                if locator.find_new_response(clicked.before).await?.is_some() {
                    return Ok(Some("response appeared"));
                }
                let control = self.driver.query(&clicked.submit.handle).await?;
                if control.first().map_or(true, |el| !el.enabled) {
                    return Ok(Some("control disabled"));
                }
                Ok::<_, AgentError>(None)
            },
        )
        .await?;

        match outcome {
            WaitOutcome::Ready(effect) => {
                debug!("Submitted ({})", effect);
                Ok(true)
            }
            WaitOutcome::TimedOut { .. } => Ok(false),
            WaitOutcome::Cancelled => Err(AgentError::Aborted),
        }
    }
}
