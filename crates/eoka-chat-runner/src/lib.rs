//! # eoka-chat-runner
//!
//! Prompt queue automation for chat web apps. Define prompts in YAML; the
//! queue controller feeds them to a page agent one at a time, with retries,
//! pausing and checkpoints.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use eoka_chat_runner::{ChatRunner, Config};
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main]
//! # async fn main() -> eoka_chat_runner::Result<()> {
//! let config = Config::load("prompts.yaml")?;
//! let mut runner = ChatRunner::new(&config.browser).await?;
//! let report = runner.run(&config, false, CancellationToken::new()).await?;
//! println!("{} of {} prompts succeeded", report.succeeded(), report.results.len());
//! runner.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! The controller can also be driven directly, against any agent that speaks
//! [`AgentCommand`](eoka_chat_agent::AgentCommand) and
//! [`AgentMessage`](eoka_chat_agent::AgentMessage):
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use eoka_chat_runner::{MemoryStore, Prompt, QueueController, QueuePolicy, Target};
//! use tokio::sync::mpsc;
//!
//! # #[tokio::main]
//! # async fn main() -> eoka_chat_runner::Result<()> {
//! let (agent_tx, _agent_rx) = mpsc::unbounded_channel();
//! let controller = QueueController::new(QueuePolicy::default(), agent_tx, Arc::new(MemoryStore::new()));
//! let (handle, _task) = controller.spawn();
//! let target = Target { id: "chat".into(), url: "https://chat.example.com".into() };
//! handle.start(vec![Prompt::new("Hello")], target).await?;
//! # Ok(())
//! # }
//! ```

pub mod checkpoint;
mod config;
pub mod controller;
pub mod events;
mod runner;

pub use checkpoint::{Checkpoint, CheckpointStore, JsonFileStore, MemoryStore};
pub use config::{
    BrowserConfig, CheckpointConfig, Config, LocatorOverrides, ParamDef, Params, PromptEntry,
    TargetConfig, Viewport,
};
pub use controller::{
    AutomationRun, ControllerHandle, Prompt, PromptResult, QueueController, QueuePolicy, RunId,
    RunSummary, Target,
};
pub use events::{AutomationEvent, ProgressStatus};
pub use runner::{ChatRunner, RunReport};

/// Result type for eoka-chat-runner operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors from config loading, the controller, or the browser.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("a run is already active")]
    AlreadyRunning,

    #[error("no active run")]
    NotRunning,

    #[error("run is not paused")]
    NotPaused,

    #[error("prompt queue is empty")]
    EmptyQueue,

    #[error("invalid target: {0}")]
    InvalidTarget(String),

    #[error("target invalidated: {0}")]
    TargetInvalidated(String),

    #[error("controller has shut down")]
    ControllerGone,

    #[error("config error: {0}")]
    Config(String),

    #[error("yaml parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("browser error: {0}")]
    Browser(#[from] eoka::Error),

    #[error("agent error: {0}")]
    Agent(#[from] eoka_chat_agent::AgentError),
}
