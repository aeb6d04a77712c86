//! Messages exchanged between the queue controller and the page agent.
//!
//! The two sides share no memory. Delivery is best-effort: the page can vanish
//! at any time, so every handler on either side must tolerate duplicates and
//! late arrivals.

use serde::{Deserialize, Serialize};

/// One prompt dispatched to the agent (`execute-prompt`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchEnvelope {
    pub prompt_text: String,
    pub index: usize,
    pub per_attempt_timeout_ms: u64,
    pub automation_id: u64,
}

/// Result of one execution (`prompt-completed` / `prompt-failed`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeEnvelope {
    pub index: usize,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Unix epoch milliseconds when the agent picked up the dispatch.
    pub start_time: i64,
    /// Run the dispatch belonged to.
    pub automation_id: u64,
}

impl OutcomeEnvelope {
    pub fn completed(env: &DispatchEnvelope, response_text: String, start_time: i64) -> Self {
        Self {
            index: env.index,
            success: true,
            response_text: Some(response_text),
            error_message: None,
            start_time,
            automation_id: env.automation_id,
        }
    }

    pub fn failed(env: &DispatchEnvelope, error_message: impl Into<String>, start_time: i64) -> Self {
        Self {
            index: env.index,
            success: false,
            response_text: None,
            error_message: Some(error_message.into()),
            start_time,
            automation_id: env.automation_id,
        }
    }
}

/// Controller → agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AgentCommand {
    ExecutePrompt(DispatchEnvelope),
    /// Abandon the in-flight execution, if any.
    Abort,
}

/// Agent → controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AgentMessage {
    /// The agent (re)attached to a page and can take dispatches.
    ContentScriptReady { target: String },
    PromptOutcome(OutcomeEnvelope),
}
