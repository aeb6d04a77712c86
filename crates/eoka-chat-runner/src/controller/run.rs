//! State of one automation run.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type RunId = u64;

/// Clock-derived run id, strictly increasing within the process even when
/// two runs start in the same millisecond.
pub fn next_run_id() -> RunId {
    static LAST: AtomicU64 = AtomicU64::new(0);
    let now = Utc::now().timestamp_millis().max(0) as u64;
    let mut last = LAST.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(seen) => last = seen,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prompt {
    pub text: String,
    /// Pause the run once this prompt has succeeded.
    #[serde(default)]
    pub pause_after: bool,
}

impl Prompt {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            pause_after: false,
        }
    }
}

impl From<&str> for Prompt {
    fn from(text: &str) -> Self {
        Prompt::new(text)
    }
}

/// The page a run drives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    /// Checkpoint key; also how the agent names its page when it announces itself.
    pub id: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptResult {
    pub index: usize,
    pub prompt_text: String,
    pub response_text: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub retry_count: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Totals reported with `automation-complete`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Successful results that carried a non-blank response.
    pub with_content: usize,
    pub total_retries: u32,
    /// Percentage of `total`, 0-100.
    pub success_rate: f64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationRun {
    pub id: RunId,
    pub target: Target,
    pub prompts: Vec<Prompt>,
    pub current_index: usize,
    pub is_running: bool,
    pub is_paused: bool,
    pub is_processing_prompt: bool,
    pub retry_attempts: BTreeMap<usize, u32>,
    pub completed_indices: BTreeSet<usize>,
    pub results: Vec<PromptResult>,
    pub started_at: DateTime<Utc>,
    /// Index dispatched and not yet answered, with the dispatch time.
    #[serde(skip)]
    pub in_flight: Option<(usize, DateTime<Utc>)>,
}

impl AutomationRun {
    pub fn new(id: RunId, target: Target, prompts: Vec<Prompt>) -> Self {
        Self {
            id,
            target,
            prompts,
            current_index: 0,
            is_running: true,
            is_paused: false,
            is_processing_prompt: false,
            retry_attempts: BTreeMap::new(),
            completed_indices: BTreeSet::new(),
            results: Vec::new(),
            started_at: Utc::now(),
            in_flight: None,
        }
    }

    pub fn total(&self) -> usize {
        self.prompts.len()
    }

    pub fn is_done(&self) -> bool {
        self.current_index >= self.prompts.len()
    }

    pub fn attempts(&self, index: usize) -> u32 {
        self.retry_attempts.get(&index).copied().unwrap_or(0)
    }

    pub fn in_flight_index(&self) -> Option<usize> {
        self.in_flight.map(|(index, _)| index)
    }

    pub fn begin(&mut self, index: usize) {
        self.in_flight = Some((index, Utc::now()));
        self.is_processing_prompt = true;
    }

    /// Clear the in-flight marker, returning when the attempt was dispatched.
    pub fn settle(&mut self) -> Option<DateTime<Utc>> {
        self.is_processing_prompt = false;
        self.in_flight.take().map(|(_, at)| at)
    }

    /// Append `result` unless its index already has one. Advances
    /// `current_index` only when the result is for the current index.
    pub fn record(&mut self, result: PromptResult) -> bool {
        let index = result.index;
        if !self.completed_indices.insert(index) {
            return false;
        }
        self.retry_attempts.remove(&index);
        self.results.push(result);
        if index == self.current_index {
            self.current_index += 1;
        }
        true
    }

    /// Put the run back in a dispatchable shape after a controller restart.
    /// The agent that held the in-flight prompt is gone, so that attempt is
    /// simply repeated.
    pub fn reset_transient(&mut self) {
        self.in_flight = None;
        self.is_processing_prompt = false;
    }

    pub fn summary(&self, now: DateTime<Utc>) -> RunSummary {
        let total = self.results.len();
        let succeeded = self.results.iter().filter(|r| r.success).count();
        let with_content = self
            .results
            .iter()
            .filter(|r| r.success && !r.response_text.trim().is_empty())
            .count();
        let total_retries = self.results.iter().map(|r| r.retry_count).sum();
        let success_rate = if total == 0 {
            0.0
        } else {
            succeeded as f64 * 100.0 / total as f64
        };
        RunSummary {
            total,
            succeeded,
            failed: total - succeeded,
            with_content,
            total_retries,
            success_rate,
            duration_ms: (now - self.started_at).num_milliseconds().max(0) as u64,
        }
    }
}
