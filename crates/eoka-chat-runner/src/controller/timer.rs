//! Cancellable one-shot timers owned by the controller.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Next dispatch (inter-prompt or retry delay).
    Dispatch,
    /// Gives up on an unanswered dispatch.
    Watchdog,
}

/// Posted to the controller inbox when a timer elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub kind: TimerKind,
    pub seq: u64,
}

/// A sleeping task; dropping it cancels the sleep.
struct ScheduledTask {
    seq: u64,
    _guard: DropGuard,
}

/// Two slots, at most one pending task each. Replacing or cancelling a slot
/// cancels its task, and a firing that raced with the cancel is recognised
/// as stale by its sequence number.
pub struct Scheduler {
    fired: mpsc::UnboundedSender<TimerFired>,
    next_seq: u64,
    dispatch: Option<ScheduledTask>,
    watchdog: Option<ScheduledTask>,
}

impl Scheduler {
    pub fn new(fired: mpsc::UnboundedSender<TimerFired>) -> Self {
        Self {
            fired,
            next_seq: 0,
            dispatch: None,
            watchdog: None,
        }
    }

    fn slot(&mut self, kind: TimerKind) -> &mut Option<ScheduledTask> {
        match kind {
            TimerKind::Dispatch => &mut self.dispatch,
            TimerKind::Watchdog => &mut self.watchdog,
        }
    }

    /// Arm `kind` to fire after `delay`, replacing whatever it held.
    pub fn schedule(&mut self, kind: TimerKind, delay: Duration) -> u64 {
        self.next_seq += 1;
        let seq = self.next_seq;
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let fired = self.fired.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = fired.send(TimerFired { kind, seq });
                }
            }
        });
        *self.slot(kind) = Some(ScheduledTask {
            seq,
            _guard: token.drop_guard(),
        });
        seq
    }

    /// Returns whether something was pending.
    pub fn cancel(&mut self, kind: TimerKind) -> bool {
        self.slot(kind).take().is_some()
    }

    pub fn cancel_all(&mut self) {
        self.dispatch = None;
        self.watchdog = None;
    }

    pub fn is_pending(&self, kind: TimerKind) -> bool {
        match kind {
            TimerKind::Dispatch => self.dispatch.is_some(),
            TimerKind::Watchdog => self.watchdog.is_some(),
        }
    }

    /// Whether `fired` is the current task of its slot. Consumes the slot if so.
    pub fn accept(&mut self, fired: TimerFired) -> bool {
        let slot = self.slot(fired.kind);
        if slot.as_ref().map(|task| task.seq) != Some(fired.seq) {
            return false;
        }
        *slot = None;
        true
    }
}
