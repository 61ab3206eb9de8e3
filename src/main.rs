// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! agentdesk operator CLI - workspace leases, provider probing, one-shot turns.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};

use agentdesk::agents::{probe_all, AgentClientEvent, ConnectOptions, ProviderKind, StatusPhase};
use agentdesk::config::{
    self, CliOptions, HistoryConfig, LockConfig, LockSettings, ResolvedConfig, RetryConfig,
    SessionSettings, TimeoutConfig, WorkspaceConfig,
};
use agentdesk::lock::{LockEvent, LockStatus, LockToken, WorkspaceLockManager};
use agentdesk::session::SessionRegistry;
use agentdesk::telemetry::{init_telemetry, TelemetryConfig};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Workspace leases and supervised AI agent sessions.
#[derive(Parser)]
#[command(name = "agentdesk")]
#[command(author, version, about = "Workspace leases and supervised AI agent sessions", long_about = None)]
struct Cli {
    /// Application id written into lock tokens
    #[arg(long, env = "AGENTDESK_APP_ID", global = true)]
    app_id: Option<String>,

    /// Heartbeat interval in milliseconds
    #[arg(long, global = true)]
    heartbeat_ms: Option<u64>,

    /// Stale threshold in milliseconds
    #[arg(long, global = true)]
    stale_ms: Option<u64>,

    /// Show debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect and manage workspace leases
    Lock {
        #[command(subcommand)]
        action: LockAction,
    },

    /// Show which agent providers are installed
    Probe {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Run a single agent turn and stream the reply
    Ask {
        /// Provider (codex, claude, gemini, qwen, openai-compatible)
        #[arg(short, long, env = "AGENTDESK_PROVIDER")]
        provider: Option<ProviderKind>,

        /// Model id; defaults to the provider's default model
        #[arg(short, long, env = "AGENTDESK_MODEL")]
        model: Option<String>,

        /// Working directory for the agent
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Image to attach
        #[arg(long = "image")]
        images: Vec<PathBuf>,

        /// Prompt text
        prompt: String,
    },

    /// Write a workspace config file with the default settings
    Init {
        /// Workspace root; defaults to the current directory
        root: Option<PathBuf>,
    },

    /// Show version information
    Version,
}

#[derive(Subcommand)]
enum LockAction {
    /// Acquire the lease and hold it until Ctrl-C
    Acquire { root: PathBuf },
    /// Remove a stale lease left behind by a dead instance
    Release { root: PathBuf },
    /// Take the lease over regardless of its holder and hold it until Ctrl-C
    Force { root: PathBuf },
    /// Show who holds the lease
    Status {
        root: PathBuf,
        /// Print the raw token as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let telemetry = if cli.verbose {
        TelemetryConfig::development()
    } else {
        TelemetryConfig::quiet()
    };
    init_telemetry(&telemetry)?;

    let cli_options = CliOptions {
        app_id: cli.app_id,
        heartbeat_interval_ms: cli.heartbeat_ms,
        stale_threshold_ms: cli.stale_ms,
        ..Default::default()
    };

    match cli.command {
        Commands::Lock { action } => handle_lock(action, cli_options).await,
        Commands::Probe { json } => {
            let config = config::load_config(&std::env::current_dir()?, cli_options)?;
            handle_probe(&config, json).await
        }
        Commands::Ask {
            provider,
            model,
            cwd,
            images,
            prompt,
        } => {
            let cwd = match cwd {
                Some(dir) => dir,
                None => std::env::current_dir()?,
            };
            let cli_options = CliOptions {
                provider: provider.map(|p| p.key().to_string()),
                model,
                ..cli_options
            };
            let config = config::load_config(&cwd, cli_options)?;
            handle_ask(config, cwd, prompt, images).await
        }
        Commands::Init { root } => {
            let root = match root {
                Some(dir) => dir,
                None => std::env::current_dir()?,
            };
            let path = config::save_workspace_config(&root, &default_workspace_config())?;
            println!("Created config file: {}", path.display());
            Ok(())
        }
        Commands::Version => {
            println!("agentdesk {}", VERSION);
            Ok(())
        }
    }
}

fn default_workspace_config() -> WorkspaceConfig {
    let lock = LockSettings::default();
    let session = SessionSettings::default();
    WorkspaceConfig {
        app_id: Some(lock.app_id.clone()),
        lock: Some(LockConfig {
            heartbeat_interval_ms: Some(lock.heartbeat_interval.as_millis() as u64),
            stale_threshold_ms: Some(lock.stale_threshold.as_millis() as u64),
            grace_ms: Some(lock.grace.as_millis() as u64),
        }),
        retry: Some(RetryConfig {
            max_attempts: Some(session.max_attempts),
            delay_ms: Some(session.retry_delay.as_millis() as u64),
        }),
        timeouts: Some(TimeoutConfig {
            connect_ms: Some(session.connect_timeout.as_millis() as u64),
            turn_start_ms: Some(session.turn_start_timeout.as_millis() as u64),
        }),
        history: Some(HistoryConfig {
            max_entries: Some(session.history_max_entries),
            max_entry_chars: Some(session.history_max_entry_chars),
        }),
        ..Default::default()
    }
}

fn describe_token(token: &LockToken) -> String {
    let now = chrono::Utc::now().timestamp_millis();
    format!(
        "pid {} on {} ({}), heartbeat {}s ago",
        token.pid,
        token.hostname,
        token.app_id,
        token.heartbeat_age_ms(now) / 1000
    )
}

async fn handle_lock(action: LockAction, cli_options: CliOptions) -> anyhow::Result<()> {
    let root = match &action {
        LockAction::Acquire { root }
        | LockAction::Release { root }
        | LockAction::Force { root }
        | LockAction::Status { root, .. } => root.clone(),
    };
    let config = config::load_config(&root, cli_options)?;
    let locks = WorkspaceLockManager::new(config.lock.clone());

    match action {
        LockAction::Acquire { root } => {
            let held = locks.acquire(&root).await?;
            println!("{} {}", "Locked".green().bold(), held.lock_file_path.display());
            hold_until_interrupted(&locks, &root).await
        }
        LockAction::Force { root } => {
            let held = locks.force_claim(&root).await?;
            println!("{} {}", "Claimed".yellow().bold(), held.lock_file_path.display());
            hold_until_interrupted(&locks, &root).await
        }
        LockAction::Release { root } => match locks.status(&root).await? {
            LockStatus::Free => {
                println!("{}", "Workspace is not locked".dimmed());
                Ok(())
            }
            LockStatus::Held { token, stale: true } => {
                locks.force_claim(&root).await?;
                locks.release(&root).await;
                println!("{} stale lease of {}", "Removed".green(), describe_token(&token));
                Ok(())
            }
            LockStatus::Held { token, stale: false } => {
                bail!(
                    "lease is held by a live instance: {} (use `lock force` to take it over)",
                    describe_token(&token)
                )
            }
            LockStatus::OwnedByUs(_) => {
                locks.release(&root).await;
                Ok(())
            }
        },
        LockAction::Status { root, json } => {
            let status = locks.status(&root).await?;
            if json {
                let token = match &status {
                    LockStatus::Free => None,
                    LockStatus::OwnedByUs(token) | LockStatus::Held { token, .. } => Some(token),
                };
                println!("{}", serde_json::to_string_pretty(&token)?);
                return Ok(());
            }
            match status {
                LockStatus::Free => println!("{}", "free".green()),
                LockStatus::OwnedByUs(token) => {
                    println!("{} {}", "owned by this process:".cyan(), describe_token(&token))
                }
                LockStatus::Held { token, stale } => {
                    let label = if stale { "stale".yellow() } else { "held".red() };
                    println!("{} {}", label.bold(), describe_token(&token));
                }
            }
            Ok(())
        }
    }
}

/// Keep the lease alive until Ctrl-C, reporting lease events as they happen.
async fn hold_until_interrupted(locks: &WorkspaceLockManager, root: &Path) -> anyhow::Result<()> {
    let mut events = locks.subscribe();
    println!("{}", "Holding lease, press Ctrl-C to release".dimmed());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(LockEvent::Superseded { root }) => {
                    bail!("lease on {} was taken over by another instance", root.display());
                }
                Ok(LockEvent::HeartbeatFailed { consecutive, error, .. }) => {
                    eprintln!("{} heartbeat failed ({}x): {}", "warning:".yellow(), consecutive, error);
                }
                Ok(LockEvent::LeaseAtRisk { root }) => {
                    eprintln!("{} lease on {} may be reclaimed by others", "warning:".yellow(), root.display());
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    if locks.release(root).await {
        println!("{} {}", "Released".green(), root.display());
    }
    Ok(())
}

async fn handle_probe(config: &ResolvedConfig, json: bool) -> anyhow::Result<()> {
    let probes = probe_all(config).await;
    if json {
        println!("{}", serde_json::to_string_pretty(&probes)?);
        return Ok(());
    }

    println!("{}", "Agent providers".bright_blue().bold());
    for probe in probes {
        let mark = if probe.installed { "✓".green() } else { "✗".red() };
        let location = probe
            .path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "not found".to_string());
        println!(
            "{} {:<18} {:<40} {}",
            mark,
            probe.provider.to_string().bright_white(),
            location,
            probe.version.as_deref().unwrap_or("").dimmed()
        );
    }
    Ok(())
}

async fn handle_ask(
    config: ResolvedConfig,
    cwd: PathBuf,
    prompt: String,
    images: Vec<PathBuf>,
) -> anyhow::Result<()> {
    let provider = match (&config.default_provider, &config.default_model) {
        (Some(name), _) => name
            .parse::<ProviderKind>()
            .with_context(|| format!("invalid provider in configuration: {}", name))?,
        (None, Some(model)) => ProviderKind::for_model(model),
        (None, None) => ProviderKind::Codex,
    };
    let model = config
        .default_model
        .clone()
        .unwrap_or_else(|| provider.default_model().to_string());
    if ProviderKind::for_model(&model) != provider && provider != ProviderKind::OpenAiCompatible {
        bail!("model {} does not belong to provider {}", model, provider);
    }

    let mut options = ConnectOptions::new(provider, &model, &cwd);
    options.permission_mode = config.default_permission_mode.clone();
    options.sandbox_mode = config.default_sandbox_mode.clone();

    let registry = SessionRegistry::new(config);
    let panel = "cli";
    let supervisor = registry.open_panel(panel, &options)?;
    let mut events = supervisor.subscribe();

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}")?);
    spinner.set_message(format!("Connecting to {} ({})", provider, model));
    spinner.enable_steady_tick(Duration::from_millis(100));

    let connected = supervisor.connect(options).await;
    spinner.finish_and_clear();
    if let Err(err) = connected {
        registry.shutdown().await;
        bail!("could not connect: {}", err);
    }

    supervisor.send_message(&prompt, images).await?;

    let mut stdout = std::io::stdout();
    let mut failed = None;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                supervisor.interrupt().await;
            }
            event = events.recv() => match event {
                Some(AgentClientEvent::AssistantDelta { text }) => {
                    write!(stdout, "{}", text)?;
                    stdout.flush()?;
                }
                Some(AgentClientEvent::Status { phase: StatusPhase::Error, message }) => {
                    failed = Some(message);
                }
                Some(AgentClientEvent::AssistantCompleted) | None => break,
                Some(_) => {}
            },
        }
    }
    println!();

    registry.shutdown().await;
    match failed {
        Some(message) => bail!("agent reported an error: {}", message),
        None => Ok(()),
    }
}
