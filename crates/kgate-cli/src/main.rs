//! # kgate
//!
//! Command line front end: lists what a Jupyter gateway offers, runs a
//! snippet on a throwaway kernel, or drives an interactive session.

#![deny(unsafe_code)]

mod output;

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use kgate_core::ExecutionState;
use kgate_core::logging::{init_subscriber, init_subscriber_json};
use kgate_core::messages::ReplyStatus;
use kgate_gateway::{KernelManager, KernelSnapshot};
use kgate_settings::{KgateSettings, load_settings_from_path, settings_path};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing::{info, warn};

/// Run code on kernels behind a Jupyter gateway.
#[derive(Parser, Debug)]
#[command(name = "kgate", version, about)]
struct Cli {
    /// Settings file (defaults to `~/.kgate/settings.json`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Gateway base URL (overrides settings and `KGATE_GATEWAY_URL`).
    #[arg(long, global = true)]
    gateway_url: Option<String>,

    /// Log filter when `RUST_LOG` is unset.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List kernel specs installed on the gateway.
    Specs,
    /// List kernels running on the gateway.
    Kernels,
    /// Start a kernel, run one snippet, print its output and stop the kernel.
    Run {
        /// Kernel spec (defaults to `kernel.defaultSpec`).
        #[arg(long)]
        spec: Option<String>,
        /// Reply timeout in milliseconds.
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Code to execute.
        code: String,
    },
    /// Interactive session on a fresh kernel. Ctrl-C interrupts, Ctrl-D quits.
    Repl {
        /// Kernel spec (defaults to `kernel.defaultSpec`).
        #[arg(long)]
        spec: Option<String>,
    },
}

fn load(cli: &Cli) -> Result<KgateSettings> {
    let path = cli.config.clone().unwrap_or_else(settings_path);
    let mut settings = load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    if let Some(url) = &cli.gateway_url {
        settings.gateway.base_url.clone_from(url);
    }
    if let Some(level) = &cli.log_level {
        settings.logging.level.clone_from(level);
    }
    settings.validate().context("Invalid settings")?;
    Ok(settings)
}

/// Owner recorded for kernels started here.
fn current_user() -> String {
    std::env::var("USER").unwrap_or_default()
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let settings = load(&cli)?;
    if settings.logging.json {
        init_subscriber_json(&settings.logging.level);
    } else {
        init_subscriber(&settings.logging.level);
    }

    let manager =
        KernelManager::from_settings(&settings).context("Failed to build gateway client")?;
    info!(gateway = manager.client().base_url(), "kgate starting");

    let result = match cli.command {
        Command::Specs => specs(&manager).await,
        Command::Kernels => kernels(&manager).await,
        Command::Run {
            spec,
            timeout_ms,
            code,
        } => run(&manager, spec.as_deref(), &code, timeout_ms.map(Duration::from_millis)).await,
        Command::Repl { spec } => repl(&manager, spec.as_deref()).await,
    };

    manager.shutdown_all().await;
    result
}

async fn specs(manager: &KernelManager) -> Result<ExitCode> {
    let specs = manager
        .list_kernel_specs()
        .await
        .context("Failed to list kernel specs")?;
    for (name, spec) in &specs.kernelspecs {
        let marker = if *name == specs.default { "*" } else { " " };
        println!(
            "{marker} {name:<20} {:<12} {}",
            spec.spec.language, spec.spec.display_name
        );
    }
    Ok(ExitCode::SUCCESS)
}

async fn kernels(manager: &KernelManager) -> Result<ExitCode> {
    let kernels = manager
        .list_remote_kernels()
        .await
        .context("Failed to list kernels")?;
    for kernel in kernels {
        let activity = kernel
            .last_activity
            .map(|t| t.to_rfc3339())
            .unwrap_or_default();
        println!(
            "{:<38} {:<12} {:<10} {activity}",
            kernel.id, kernel.name, kernel.execution_state
        );
    }
    Ok(ExitCode::SUCCESS)
}

async fn start(manager: &KernelManager, spec: Option<&str>) -> Result<KernelSnapshot> {
    manager
        .start_kernel(spec, &current_user())
        .await
        .context("Failed to start kernel")
}

async fn run(
    manager: &KernelManager,
    spec: Option<&str>,
    code: &str,
    timeout: Option<Duration>,
) -> Result<ExitCode> {
    let kernel = start(manager, spec).await?;
    let outcome = manager.execute_sync(&kernel.id, code, timeout).await;
    if let Err(e) = manager.stop_kernel(&kernel.id).await {
        warn!(kernel_id = %kernel.id, error = %e, "failed to stop kernel");
    }

    let outcome = outcome.context("Execution failed")?;
    for envelope in &outcome.outputs {
        output::print(envelope);
    }
    Ok(match outcome.status() {
        Some(ReplyStatus::Ok) => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    })
}

fn prompt(text: &str) -> Result<()> {
    print!("{text}");
    std::io::stdout().flush().context("Failed to write prompt")
}

async fn repl(manager: &KernelManager, spec: Option<&str>) -> Result<ExitCode> {
    let kernel = start(manager, spec).await?;
    let mut output = manager.open_output_channel(&kernel.id, "repl")?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    eprintln!("kernel {} ({}) ready", kernel.id, kernel.name);

    loop {
        prompt(">>> ")?;
        let Some(line) = lines.next_line().await? else {
            println!();
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let msg_id = manager.execute_code(&kernel.id, &line).await?;
        loop {
            tokio::select! {
                envelope = output.recv() => {
                    let Some(envelope) = envelope else {
                        bail!("kernel {} connection lost", kernel.id);
                    };
                    if !envelope.is_child_of(msg_id.as_str()) {
                        continue;
                    }
                    if envelope.execution_state() == Some(ExecutionState::Idle) {
                        break;
                    }
                    if envelope.msg_type == "input_request" {
                        let answer = read_input(&mut lines, &envelope.content).await?;
                        let _ = manager.input_reply(&kernel.id, &answer).await?;
                    } else {
                        output::print(&envelope);
                    }
                }
                signal = tokio::signal::ctrl_c() => {
                    signal.context("Failed to listen for Ctrl-C")?;
                    manager.interrupt_kernel(&kernel.id).await?;
                }
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn read_input(
    lines: &mut Lines<BufReader<Stdin>>,
    request: &serde_json::Value,
) -> Result<String> {
    prompt(request["prompt"].as_str().unwrap_or_default())?;
    Ok(lines.next_line().await?.unwrap_or_default())
}
