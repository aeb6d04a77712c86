//! # eoka-chat-agent
//!
//! Page automation agent for chat web apps. Given a prompt, it finds the input
//! box, types, submits, and waits until the streamed reply stops growing.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use eoka_chat_agent::{AgentConfig, DispatchEnvelope, EokaDriver, PageAgent};
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main]
//! # async fn main() -> eoka::Result<()> {
//! let browser = eoka::Browser::launch().await?;
//! let page = Arc::new(browser.new_page("https://chat.example.com").await?);
//!
//! let agent = PageAgent::new(EokaDriver::new(page), AgentConfig::default());
//! let envelope = DispatchEnvelope {
//!     prompt_text: "Hello there".into(),
//!     index: 0,
//!     per_attempt_timeout_ms: 120_000,
//!     automation_id: 1,
//! };
//! if let Some(outcome) = agent.execute(&envelope, &CancellationToken::new()).await {
//!     println!("{:?}", outcome.response_text);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! The agent never decides about retries. Every failure becomes a
//! [`OutcomeEnvelope`] with `success: false`; the queue controller on the
//! other side of the channel owns the policy.

pub mod agent;
pub mod completion;
pub mod content;
pub mod driver;
pub mod locator;
pub mod page;
pub mod protocol;
pub mod wait;
pub mod worker;

#[cfg(test)]
mod fixture;

use std::time::Duration;

pub use agent::{target_problem, AgentConfig, PageAgent, SettleConfig, SubmitConfig};
pub use completion::{CompletionConfig, CompletionDetector, StabilityTracker};
pub use driver::{BBox, ElementInfo, Extracted, InsertMethod, InsertReport, PageDriver, Viewport};
pub use locator::{ElementKind, Locator, LocatorRule, LocatorStrategy};
pub use page::EokaDriver;
pub use protocol::{AgentCommand, AgentMessage, DispatchEnvelope, OutcomeEnvelope};
pub use worker::{AgentWorker, OutcomeSink};

/// Result type for agent operations.
pub type Result<T> = std::result::Result<T, AgentError>;

/// Errors raised while executing a prompt inside the page.
///
/// The `Display` strings are part of the contract: the controller classifies
/// failures by substring (`element not found`, `timeout`, `target invalidated`).
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("element not found: {0}")]
    ElementNotFound(ElementKind),

    #[error("submission failed: {0}")]
    SubmissionFailed(String),

    #[error("response timeout after {:.1}s", .elapsed.as_secs_f64())]
    ResponseTimeout { elapsed: Duration },

    #[error("target invalidated: {0}")]
    TargetInvalidated(String),

    #[error("execution aborted")]
    Aborted,

    #[error("browser error: {0}")]
    Browser(#[from] eoka::Error),
}
