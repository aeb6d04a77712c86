//! Progress events broadcast to observers.

use serde::{Deserialize, Serialize};

use crate::controller::{PromptResult, RunSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProgressStatus {
    Dispatched,
    Completed,
    Retrying,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AutomationEvent {
    #[serde(rename = "automation-started")]
    Started { total: usize },

    #[serde(rename = "automation-progress", rename_all = "camelCase")]
    Progress {
        /// Prompts finished so far.
        current: usize,
        total: usize,
        index: usize,
        status: ProgressStatus,
        /// 1-based attempt number.
        attempt: u32,
        max_retries: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    #[serde(rename = "automation-complete")]
    Complete {
        results: Vec<PromptResult>,
        summary: RunSummary,
    },

    #[serde(rename = "automation-stopped")]
    Stopped {
        results: Vec<PromptResult>,
        completed: usize,
        total: usize,
        reason: String,
    },

    #[serde(rename = "automation-paused")]
    Paused { current: usize, total: usize },

    #[serde(rename = "automation-resumed")]
    Resumed { current: usize, total: usize },

    #[serde(rename = "automation-error")]
    Error { index: usize, message: String },
}

impl AutomationEvent {
    /// Whether the run is over after this event.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AutomationEvent::Complete { .. } | AutomationEvent::Stopped { .. }
        )
    }
}
