//! Completion detection for streamed responses.
//!
//! Chat pages never say "done". The detector tracks the response container
//! that appeared after submission and measures its rendered text length on
//! every polling tick. The reply counts as finished once the length has held
//! still for enough consecutive samples *and* enough time has passed since
//! submission. Both thresholds grow past a length threshold, because long
//! answers tend to stall mid-stream.
//!
//! Page change notifications wake the detector early so that a growing reply
//! resets the count immediately, but only polling ticks count as samples.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::content;
use crate::driver::{ElementInfo, PageDriver};
use crate::locator::{Locator, LocatorStrategy};
use crate::wait::{Tick, Ticker, Wake, WaitOptions};
use crate::{AgentError, Result};

/// Stability thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionConfig {
    /// Sampling interval in milliseconds.
    pub poll_ms: u64,
    /// Consecutive unchanged samples required.
    pub stable_samples: u32,
    /// Minimum time since submission, in milliseconds.
    pub min_wait_ms: u64,
    /// Length (characters) past which the long-response thresholds apply.
    pub long_threshold: usize,
    pub long_stable_samples: u32,
    pub long_min_wait_ms: u64,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            poll_ms: 1000,
            stable_samples: 3,
            min_wait_ms: 3000,
            long_threshold: 1500,
            long_stable_samples: 5,
            long_min_wait_ms: 6000,
        }
    }
}

impl CompletionConfig {
    /// Samples and minimum wait required for a response of `len` characters.
    pub fn requirements(&self, len: usize) -> (u32, Duration) {
        if len >= self.long_threshold {
            (
                self.long_stable_samples,
                Duration::from_millis(self.long_min_wait_ms),
            )
        } else {
            (self.stable_samples, Duration::from_millis(self.min_wait_ms))
        }
    }

    pub fn poll(&self) -> Duration {
        Duration::from_millis(self.poll_ms)
    }
}

/// Pure stability bookkeeping, fed one length sample at a time.
#[derive(Debug, Clone)]
pub struct StabilityTracker {
    config: CompletionConfig,
    last_len: Option<usize>,
    stable: u32,
}

impl StabilityTracker {
    pub fn new(config: CompletionConfig) -> Self {
        Self {
            config,
            last_len: None,
            stable: 0,
        }
    }

    /// Record a sample. `counted` is false for samples taken outside the
    /// polling cadence; those can reset the count but never advance it.
    /// Returns true once the response is considered complete.
    pub fn observe(&mut self, len: usize, elapsed: Duration, counted: bool) -> bool {
        if self.last_len != Some(len) {
            self.last_len = Some(len);
            self.stable = 0;
            return false;
        }
        if len == 0 {
            return false;
        }
        if counted {
            self.stable += 1;
        }
        let (samples, min_wait) = self.config.requirements(len);
        self.stable >= samples && elapsed >= min_wait
    }

    /// Forget everything (the tracked node went away).
    pub fn reset(&mut self) {
        self.last_len = None;
        self.stable = 0;
    }

    pub fn stable_samples(&self) -> u32 {
        self.stable
    }
}

/// Waits for the new response to stop growing and extracts it.
#[derive(Debug, Clone, Default)]
pub struct CompletionDetector {
    config: CompletionConfig,
}

impl CompletionDetector {
    pub fn new(config: CompletionConfig) -> Self {
        Self { config }
    }

    /// Wait for a response container not in `before` to appear and settle.
    ///
    /// Returns the cleaned content, `ResponseTimeout` if `timeout` passes
    /// first, or `Aborted` on cancellation.
    pub async fn await_response<D: PageDriver + ?Sized>(
        &self,
        driver: &D,
        strategy: &LocatorStrategy,
        before: &HashSet<String>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let locator = Locator::new(driver, strategy);
        let mut ticker = Ticker::new(
            WaitOptions::new(self.config.poll(), timeout),
            driver.changes(),
            cancel,
        );
        let mut tracker = StabilityTracker::new(self.config.clone());
        let mut tracked: Option<ElementInfo> = None;

        loop {
            let wake = match ticker.next().await {
                Tick::Wake(wake) => wake,
                Tick::TimedOut(elapsed) => return Err(AgentError::ResponseTimeout { elapsed }),
                Tick::Cancelled => return Err(AgentError::Aborted),
            };

            if tracked.is_none() {
                tracked = locator.find_new_response(before).await?;
                match tracked {
                    Some(ref el) => debug!("tracking response {}", el.handle),
                    None => continue,
                }
            }
            let Some(ref el) = tracked else {
                continue;
            };

            let Some(len) = driver.measure(&el.handle).await? else {
                debug!("response {} detached, re-locating", el.handle);
                tracked = None;
                tracker.reset();
                continue;
            };

            if tracker.observe(len, ticker.elapsed(), wake == Wake::Poll) {
                debug!(
                    "response {} stable at {} chars after {:.1}s",
                    el.handle,
                    len,
                    ticker.elapsed().as_secs_f64()
                );
                let extracted = driver.extract(&el.handle).await?;
                return Ok(content::clean_response(&extracted));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::{el, FakePage, Lengths, Reply};

    const ASSISTANT: &str = "[data-message-author-role=\"assistant\"]";

    fn reply(handle: &str, lengths: Lengths) -> Reply {
        let mut info = el("div", handle);
        info.text_len = 10;
        Reply::new(info, &[ASSISTANT], lengths, "<p>Hello world</p>").text("Hello world")
    }

    fn track(observations: &[(usize, u64, bool)], config: CompletionConfig) -> Vec<bool> {
        let mut tracker = StabilityTracker::new(config);
        observations
            .iter()
            .map(|&(len, secs, counted)| tracker.observe(len, Duration::from_secs(secs), counted))
            .collect()
    }

    #[test]
    fn test_tracker_requires_samples_and_min_wait() {
        let done = track(
            &[(10, 0, true), (10, 1, true), (10, 2, true), (10, 3, true)],
            CompletionConfig::default(),
        );
        assert_eq!(done, vec![false, false, false, true]);

        // enough samples, not enough time
        let fast = CompletionConfig {
            min_wait_ms: 10_000,
            ..CompletionConfig::default()
        };
        let done = track(&[(10, 0, true), (10, 1, true), (10, 2, true), (10, 3, true)], fast);
        assert!(done.iter().all(|d| !d));
    }

    #[test]
    fn test_tracker_growth_resets() {
        let done = track(
            &[(10, 0, true), (10, 1, true), (10, 2, true), (20, 3, true), (20, 4, true), (20, 5, true)],
            CompletionConfig::default(),
        );
        assert!(done.iter().all(|d| !d));
    }

    #[test]
    fn test_tracker_zero_never_completes() {
        let samples: Vec<_> = (0..20).map(|i| (0, i, true)).collect();
        assert!(track(&samples, CompletionConfig::default()).iter().all(|d| !d));
    }

    #[test]
    fn test_tracker_uncounted_samples_do_not_advance() {
        let mut tracker = StabilityTracker::new(CompletionConfig::default());
        assert!(!tracker.observe(10, Duration::ZERO, true));
        for _ in 0..10 {
            assert!(!tracker.observe(10, Duration::from_secs(30), false));
        }
        assert_eq!(tracker.stable_samples(), 0);
    }

    #[test]
    fn test_tracker_scales_for_long_responses() {
        let config = CompletionConfig::default();
        let long = config.long_threshold + 1;
        let mut tracker = StabilityTracker::new(config);
        let done: Vec<bool> = (0..7)
            .map(|i| tracker.observe(long, Duration::from_secs(i), true))
            .collect();
        // five stable samples after the first, and six seconds
        assert_eq!(done, vec![false, false, false, false, false, false, true]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_detector_resolves_stable_response() {
        let page = FakePage::new();
        page.add_response(reply("r1", Lengths::Fixed(vec![10; 8])));

        let content = CompletionDetector::default()
            .await_response(
                &page,
                &LocatorStrategy::default(),
                &HashSet::new(),
                Duration::from_secs(60),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(content, "<p>Hello world</p>");
    }

    #[tokio::test(start_paused = true)]
    async fn test_detector_times_out_on_endless_growth() {
        let page = FakePage::new();
        page.add_response(reply("r1", Lengths::Growing(25)));

        let err = CompletionDetector::default()
            .await_response(
                &page,
                &LocatorStrategy::default(),
                &HashSet::new(),
                Duration::from_secs(10),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::ResponseTimeout { .. }));
        assert_eq!(err.to_string(), "response timeout after 10.0s");
    }

    #[tokio::test(start_paused = true)]
    async fn test_detector_ignores_snapshot_members() {
        let page = FakePage::new();
        page.add_response(reply("old", Lengths::Fixed(vec![40])));
        let before: HashSet<String> = ["old".to_string()].into();

        let err = CompletionDetector::default()
            .await_response(
                &page,
                &LocatorStrategy::default(),
                &before,
                Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::ResponseTimeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_detector_relocates_detached_node() {
        let page = std::sync::Arc::new(FakePage::new());
        page.add_response(reply("first", Lengths::Growing(5)));

        let swap = page.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            swap.detach("first");
            swap.add_response(reply("second", Lengths::Fixed(vec![10])).text("re-rendered"));
        });

        let content = CompletionDetector::default()
            .await_response(
                page.as_ref(),
                &LocatorStrategy::default(),
                &HashSet::new(),
                Duration::from_secs(30),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(content, "<p>Hello world</p>");
        assert!(page.value("second").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_detector_cancelled() {
        let page = FakePage::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = CompletionDetector::default()
            .await_response(
                &page,
                &LocatorStrategy::default(),
                &HashSet::new(),
                Duration::from_secs(5),
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Aborted));
    }
}
