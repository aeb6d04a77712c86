//! Retry and escalation policy.

use std::time::Duration;

use eoka_chat_agent::AgentConfig;
use serde::{Deserialize, Serialize};

/// Failure messages worth another attempt.
const RETRYABLE: &[&str] = &[
    "timeout",
    "network",
    "connection",
    "element not found",
    "rate limit",
    "transient",
    "loading",
];

/// Failure messages that end the run.
const FATAL: &[&str] = &["target invalidated"];

/// Sequencing and retry knobs, read from the `queue:` config section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueuePolicy {
    /// Pause between a finished prompt and the next dispatch.
    pub inter_prompt_delay_ms: u64,
    /// Pause before re-dispatching a failed prompt.
    pub retry_delay_ms: u64,
    pub max_retries: u32,
    pub retries_enabled: bool,
    /// Pause the run instead of skipping a prompt that failed for good.
    pub pause_on_error: bool,
    /// Sent to the agent as the per-attempt response timeout.
    pub prompt_timeout_ms: u64,
    /// Extra time the controller waits past the agent's own timeout before
    /// declaring the attempt lost.
    pub dispatch_grace_ms: u64,
    /// Longest the agent may spend before it starts waiting for the
    /// response. Comes from the agent settings, see [`QueuePolicy::with_agent`].
    #[serde(skip, default = "default_agent_setup_ms")]
    pub agent_setup_ms: u64,
}

fn default_agent_setup_ms() -> u64 {
    AgentConfig::default().setup_budget().as_millis() as u64
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            inter_prompt_delay_ms: 2000,
            retry_delay_ms: 5000,
            max_retries: 3,
            retries_enabled: true,
            pause_on_error: false,
            prompt_timeout_ms: 180_000,
            dispatch_grace_ms: 20_000,
            agent_setup_ms: default_agent_setup_ms(),
        }
    }
}

impl QueuePolicy {
    pub fn inter_prompt_delay(&self) -> Duration {
        Duration::from_millis(self.inter_prompt_delay_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Size the watchdog for an agent running with `agent`.
    pub fn with_agent(mut self, agent: &AgentConfig) -> Self {
        self.agent_setup_ms = agent.setup_budget().as_millis() as u64;
        self
    }

    /// How long a dispatch may go unanswered: the agent's own setup and
    /// response bounds plus the grace period.
    pub fn watchdog(&self) -> Duration {
        Duration::from_millis(
            self.agent_setup_ms
                .saturating_add(self.prompt_timeout_ms)
                .saturating_add(self.dispatch_grace_ms),
        )
    }

    /// What to do about a failure of a prompt that already failed
    /// `attempts` times.
    pub fn decide(&self, message: &str, attempts: u32) -> Decision {
        match classify(message) {
            FailureClass::Fatal => Decision::Stop,
            FailureClass::Retryable if self.retries_enabled && attempts < self.max_retries => {
                Decision::Retry {
                    attempt: attempts + 1,
                }
            }
            FailureClass::Retryable => Decision::Skip {
                pause: self.pause_on_error,
            },
            FailureClass::Permanent if self.pause_on_error => Decision::Pause,
            FailureClass::Permanent => Decision::Skip { pause: false },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Retryable,
    Permanent,
    Fatal,
}

/// Classify an agent failure message by keyword, case-insensitively.
pub fn classify(message: &str) -> FailureClass {
    let message = message.to_lowercase();
    if FATAL.iter().any(|k| message.contains(k)) {
        FailureClass::Fatal
    } else if RETRYABLE.iter().any(|k| message.contains(k)) {
        FailureClass::Retryable
    } else {
        FailureClass::Permanent
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Re-dispatch the same index; `attempt` is the new retry count.
    Retry { attempt: u32 },
    /// Keep the index, drop its retry count and pause the run. Only for
    /// failures a retry would not fix.
    Pause,
    /// Record the failure and move on, pausing first when `pause` is set.
    Skip { pause: bool },
    /// Stop the whole run.
    Stop,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(classify("response timeout after 12.0s"), FailureClass::Retryable);
        assert_eq!(classify("element not found: submit"), FailureClass::Retryable);
        assert_eq!(classify("Network changed"), FailureClass::Retryable);
        assert_eq!(classify("Rate limit exceeded"), FailureClass::Retryable);
        assert_eq!(classify("permission denied"), FailureClass::Permanent);
        assert_eq!(
            classify("submission failed: no effect after clicking send"),
            FailureClass::Permanent
        );
        assert_eq!(
            classify("target invalidated: page is at \"about:blank\""),
            FailureClass::Fatal
        );
    }

    #[test]
    fn test_fatal_beats_retryable_keywords() {
        assert_eq!(
            classify("target invalidated: connection lost"),
            FailureClass::Fatal
        );
    }

    #[test]
    fn test_decide_retries_until_exhausted() {
        let policy = QueuePolicy::default();
        assert_eq!(policy.decide("timeout", 0), Decision::Retry { attempt: 1 });
        assert_eq!(policy.decide("timeout", 2), Decision::Retry { attempt: 3 });
        assert_eq!(policy.decide("timeout", 3), Decision::Skip { pause: false });
        assert_eq!(
            policy.decide("permission denied", 0),
            Decision::Skip { pause: false }
        );
        assert_eq!(policy.decide("target invalidated: gone", 0), Decision::Stop);
    }

    #[test]
    fn test_decide_pause_on_error() {
        let policy = QueuePolicy {
            pause_on_error: true,
            ..QueuePolicy::default()
        };
        assert_eq!(policy.decide("permission denied", 0), Decision::Pause);
        // exhausted retries still record a result
        assert_eq!(policy.decide("timeout", 3), Decision::Skip { pause: true });
        assert_eq!(policy.decide("timeout", 1), Decision::Retry { attempt: 2 });
    }

    #[test]
    fn test_decide_retries_disabled() {
        let policy = QueuePolicy {
            retries_enabled: false,
            ..QueuePolicy::default()
        };
        assert_eq!(policy.decide("timeout", 0), Decision::Skip { pause: false });
    }

    #[test]
    fn test_watchdog_covers_agent_setup() {
        let policy = QueuePolicy::default();
        // 30.3s setup + 180s response + 20s grace
        assert_eq!(policy.watchdog(), Duration::from_millis(230_300));

        let slow = AgentConfig {
            locate_timeout_ms: 60_000,
            ..AgentConfig::default()
        };
        let policy = QueuePolicy::default().with_agent(&slow);
        assert_eq!(policy.watchdog(), Duration::from_millis(330_300));
    }

    #[test]
    fn test_agent_setup_is_not_read_from_config() {
        let policy: QueuePolicy = serde_yaml::from_str("agent_setup_ms: 1\nmax_retries: 1").unwrap();
        assert_eq!(policy.max_retries, 1);
        assert_eq!(policy.agent_setup_ms, QueuePolicy::default().agent_setup_ms);
    }
}
