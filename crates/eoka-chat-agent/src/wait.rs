//! One cancellable "wait until the predicate holds" primitive.
//!
//! A [`Ticker`] multiplexes a fixed polling cadence with optional page-change
//! notifications and hands the caller a [`Wake`] each time it should look at
//! the page again. Whichever trigger fires first wins; the other is simply
//! re-armed. The wait ends exactly once: on a ready probe, on the deadline,
//! or on cancellation.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::Result;

/// Polling cadence and overall deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOptions {
    pub poll: Duration,
    pub timeout: Duration,
}

impl WaitOptions {
    pub fn new(poll: Duration, timeout: Duration) -> Self {
        Self { poll, timeout }
    }
}

/// Why the probe is being run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// First look, right away.
    Initial,
    /// Regular polling tick.
    Poll,
    /// The page reported a change between ticks.
    Change,
}

/// How a wait ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome<T> {
    Ready(T),
    TimedOut { elapsed: Duration },
    Cancelled,
}

/// One step of a [`Ticker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Wake(Wake),
    TimedOut(Duration),
    Cancelled,
}

/// Drives the wake schedule for a single wait.
pub struct Ticker {
    start: Instant,
    deadline: Instant,
    poll: Duration,
    next_poll: Instant,
    changes: Option<watch::Receiver<u64>>,
    cancel: CancellationToken,
    started: bool,
}

impl Ticker {
    pub fn new(
        opts: WaitOptions,
        changes: Option<watch::Receiver<u64>>,
        cancel: &CancellationToken,
    ) -> Self {
        let start = Instant::now();
        // a zero poll would spin
        let poll = opts.poll.max(Duration::from_millis(1));
        Self {
            start,
            deadline: start + opts.timeout,
            poll,
            next_poll: start + poll,
            changes,
            cancel: cancel.clone(),
            started: false,
        }
    }

    /// Time since the wait began.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Wait for the next reason to probe.
    ///
    /// Change notifications never push the polling schedule back, so a page
    /// that mutates constantly still gets its regular ticks. The tick that
    /// lands on the deadline is delivered; the call after it reports
    /// `TimedOut`.
    pub async fn next(&mut self) -> Tick {
        if self.cancel.is_cancelled() {
            return Tick::Cancelled;
        }
        if !self.started {
            self.started = true;
            return Tick::Wake(Wake::Initial);
        }
        let now = Instant::now();
        if now >= self.deadline {
            return Tick::TimedOut(now - self.start);
        }

        let wake_at = self.next_poll.min(self.deadline);
        loop {
            let changed = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Tick::Cancelled,
                _ = sleep_until(wake_at) => None,
                ok = next_change(&mut self.changes) => Some(ok),
            };
            match changed {
                None => {
                    while self.next_poll <= wake_at {
                        self.next_poll += self.poll;
                    }
                    return Tick::Wake(Wake::Poll);
                }
                Some(true) => return Tick::Wake(Wake::Change),
                // sender gone: fall back to polling only
                Some(false) => self.changes = None,
            }
        }
    }
}

async fn next_change(changes: &mut Option<watch::Receiver<u64>>) -> bool {
    match changes {
        Some(rx) => rx.changed().await.is_ok(),
        None => std::future::pending().await,
    }
}

/// Run `probe` on every wake until it yields a value, the deadline passes,
/// or `cancel` fires. Probe errors end the wait immediately.
pub async fn wait_until<T, F, Fut>(
    opts: WaitOptions,
    changes: Option<watch::Receiver<u64>>,
    cancel: &CancellationToken,
    mut probe: F,
) -> Result<WaitOutcome<T>>
where
    F: FnMut(Wake) -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let mut ticker = Ticker::new(opts, changes, cancel);
    loop {
        match ticker.next().await {
            Tick::Wake(wake) => {
                if let Some(value) = probe(wake).await? {
                    return Ok(WaitOutcome::Ready(value));
                }
            }
            Tick::TimedOut(elapsed) => return Ok(WaitOutcome::TimedOut { elapsed }),
            Tick::Cancelled => return Ok(WaitOutcome::Cancelled),
        }
    }
}
