use anyhow::Context;
use clap::Parser;
use eoka_chat_runner::{AutomationEvent, ControllerHandle, ProgressStatus};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "eoka-chat")]
#[command(about = "Run a queue of prompts against a chat web app")]
#[command(version)]
struct Cli {
    /// Config file to run
    config: PathBuf,

    /// Run in headless mode (overrides config)
    #[arg(long)]
    headless: bool,

    /// Set a parameter (can be used multiple times)
    #[arg(short = 'P', long = "param", value_name = "KEY=VALUE")]
    params: Vec<String>,

    /// Verbose output (-v for info, -vv for debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Validate config without running
    #[arg(long)]
    check: bool,

    /// Continue from the saved checkpoint, if there is one
    #[arg(long)]
    resume: bool,

    /// Quiet mode (only errors)
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.quiet {
        Level::ERROR
    } else {
        match cli.verbose {
            0 => Level::WARN,
            1 => Level::INFO,
            _ => Level::DEBUG,
        }
    };

    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();

    let params = eoka_chat_runner::Params::from_args(&cli.params)?;
    let mut config = eoka_chat_runner::Config::load_with_params(&cli.config, &params)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    if cli.check {
        print_plan(&config);
        return Ok(());
    }

    if cli.headless {
        config.browser.headless = true;
    }

    println!("Running: {}", config.name);

    let shutdown = CancellationToken::new();
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\nStopping...");
            ctrl_c.cancel();
        }
    });

    let mut runner = eoka_chat_runner::ChatRunner::new(&config.browser)
        .await
        .context("launching browser")?;
    let session = runner.start(&config, cli.resume).await?;
    if !cli.quiet {
        tokio::spawn(print_progress(session.handle().subscribe()));
    }
    tokio::spawn(console(session.handle().clone()));
    let report = session.wait(shutdown).await?;

    println!();
    if report.is_success() {
        println!("✓ Success");
    } else {
        println!("✗ Failed");
        if let Some(ref reason) = report.stopped {
            println!("  Stopped: {}", reason);
        }
        for r in report.results.iter().filter(|r| !r.success) {
            println!(
                "  Prompt {}: {}",
                r.index + 1,
                r.error.as_deref().unwrap_or("unknown error")
            );
        }
    }
    println!(
        "  Prompts: {}/{} succeeded",
        report.succeeded(),
        report.results.len()
    );
    if let Some(ref summary) = report.summary {
        println!("  With content: {}", summary.with_content);
        if summary.total_retries > 0 {
            println!("  Retries: {}", summary.total_retries);
        }
        println!("  Success rate: {:.0}%", summary.success_rate);
    }
    println!("  Duration: {}ms", report.duration_ms);
    if let Some(ref dir) = config.checkpoint.dir {
        println!("  Results: {}", dir.display());
    }

    runner.close().await?;

    // Exit explicitly: the console task may still be blocked on stdin.
    std::process::exit(if report.is_success() { 0 } else { 1 });
}

fn print_plan(config: &eoka_chat_runner::Config) {
    println!("Config valid: {}", config.name);
    println!("  Target: {}", config.target.url);
    if let Some(ref pattern) = config.target.match_pattern {
        println!("  Match: {}", pattern);
    }
    let prompts = config.prompt_queue();
    println!("  Prompts: {}", prompts.len());
    for (i, prompt) in prompts.iter().enumerate() {
        let pause = if prompt.pause_after { " (pause after)" } else { "" };
        println!("    {}. {}{}", i + 1, preview(&prompt.text), pause);
    }
    if !config.params.is_empty() {
        println!("  Parameters: {}", config.params.len());
        for (name, def) in &config.params {
            let req = if def.required { " (required)" } else { "" };
            let desc = def.description.as_deref().unwrap_or("");
            println!("    - {}{}: {}", name, req, desc);
        }
    }
    let q = &config.queue;
    if q.retries_enabled {
        println!("  Retries: {} (delay {}ms)", q.max_retries, q.retry_delay_ms);
    }
    if q.pause_on_error {
        println!("  Pause on error: yes");
    }
    println!("  Prompt timeout: {}ms", q.prompt_timeout_ms);
    println!(
        "  Watchdog: {}s",
        config.queue_policy().watchdog().as_secs()
    );
    if !config.locators.is_empty() {
        let mode = if config.locators.replace { "replace" } else { "prepend" };
        println!("  Locator overrides: {}", mode);
    }
}

fn preview(text: &str) -> String {
    let line = text.lines().next().unwrap_or("");
    if line.chars().count() > 60 {
        format!("{}...", line.chars().take(60).collect::<String>())
    } else {
        line.to_string()
    }
}

async fn print_progress(mut events: tokio::sync::broadcast::Receiver<AutomationEvent>) {
    while let Ok(event) = events.recv().await {
        match event {
            AutomationEvent::Started { total } => println!("Queued {} prompts", total),
            AutomationEvent::Progress {
                index,
                total,
                status,
                attempt,
                max_retries,
                message,
                ..
            } => match status {
                ProgressStatus::Dispatched => println!("→ [{}/{}] sending", index + 1, total),
                ProgressStatus::Completed => println!("✓ [{}/{}] done", index + 1, total),
                ProgressStatus::Retrying => println!(
                    "↻ [{}/{}] retry {}/{}: {}",
                    index + 1,
                    total,
                    attempt - 1,
                    max_retries,
                    message.unwrap_or_default()
                ),
                ProgressStatus::Failed => println!(
                    "✗ [{}/{}] {}",
                    index + 1,
                    total,
                    message.unwrap_or_default()
                ),
            },
            AutomationEvent::Paused { current, total } => println!(
                "Paused before prompt {}/{} (type 'r' + Enter to resume)",
                current + 1,
                total
            ),
            AutomationEvent::Resumed { current, total } => {
                println!("Resumed at prompt {}/{}", current + 1, total)
            }
            AutomationEvent::Error { index, message } => {
                println!("Error on prompt {}: {}", index + 1, message)
            }
            AutomationEvent::Complete { .. } | AutomationEvent::Stopped { .. } => break,
        }
    }
}

/// Line commands on stdin: p(ause), r(esume), s(top), status.
async fn console(handle: ControllerHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let result = match line.trim() {
            "p" | "pause" => handle.pause().await,
            "r" | "resume" => handle.resume().await,
            "s" | "stop" => handle.stop().await,
            "status" => match handle.status().await {
                Ok(Some(run)) => {
                    println!(
                        "Run {}: prompt {}/{}, {} done{}",
                        run.id,
                        (run.current_index + 1).min(run.total()),
                        run.total(),
                        run.results.len(),
                        if run.is_paused { ", paused" } else { "" }
                    );
                    Ok(())
                }
                Ok(None) => {
                    println!("No active run");
                    Ok(())
                }
                Err(e) => Err(e),
            },
            "" => Ok(()),
            other => {
                println!("Unknown command '{}' (pause, resume, stop, status)", other);
                Ok(())
            }
        };
        if let Err(e) = result {
            println!("{}", e);
        }
    }
}
