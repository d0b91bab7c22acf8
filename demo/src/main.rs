//! termhub-demo: drive one bridged session from the terminal.
//!
//! Spawns a command under a pseudo-terminal, forwards stdin lines through the
//! command manager, optionally follows a transcript, and prints every event
//! the bus delivers. Process output goes to stdout, other events to stderr
//! as JSON.

use anyhow::Context;
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use termhub_core::{
    BridgeConfig, CommandStatus, Event, EventBus, EventFilter, EventPayload, SessionConfig,
    SessionId,
};
use termhub_engine::{CommandManager, ContextMonitor, TerminalBridge, TranscriptSource};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

/// termhub-demo — bridge a local interactive program
#[derive(Parser, Debug)]
#[command(name = "termhub-demo", version, about = "Bridge a local interactive program")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "~/.termhub/config.toml")]
    config: PathBuf,

    /// Command to spawn (defaults to $SHELL)
    #[arg(short, long)]
    command: Option<String>,

    /// Working directory for the spawned command
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Transcript file to follow
    #[arg(long, conflicts_with = "transcript_dir")]
    transcript: Option<PathBuf>,

    /// Follow the newest *.jsonl transcript under this directory
    #[arg(long)]
    transcript_dir: Option<PathBuf>,

    /// Mark the oldest accepted command completed whenever a prompt appears
    #[arg(long)]
    auto_complete: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting termhub-demo");

    if let Err(e) = run(cli).await {
        error!(error = %format!("{e:#}"), "termhub-demo failed");
        std::process::exit(1);
    }
    info!("termhub-demo stopped");
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = BridgeConfig::load(&cli.config).context("failed to load config")?;

    let bus = Arc::new(EventBus::from_config(&config.bus));
    let (_, mut events) = bus.subscribe_channel(EventFilter::all())?;

    let bridge = TerminalBridge::new(Arc::clone(&bus), config.terminal.clone())?;
    let commands = CommandManager::new(
        Arc::clone(&bus),
        Arc::new(bridge.clone()),
        config.commands.clone(),
    )?;
    let monitor = ContextMonitor::new(Arc::clone(&bus), config.context.clone());

    let session = bridge
        .open_session(SessionConfig {
            shell_command: cli.command.clone(),
            working_directory: cli.cwd.clone(),
            ..Default::default()
        })
        .await
        .context("failed to open session")?;

    let source = match (cli.transcript, cli.transcript_dir) {
        (Some(path), _) => Some(TranscriptSource::File(path)),
        (None, Some(dir)) => Some(TranscriptSource::LatestIn(dir)),
        (None, None) => None,
    };
    if let Some(source) = source {
        monitor.attach(session.clone(), source).await?;
    }

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            line = stdin.next_line(), if stdin_open => match line? {
                Some(line) => {
                    let id = commands.submit(&session, &line).await?;
                    info!(command_id = %id, status = %commands.status(id)?, "submitted");
                }
                None => {
                    info!("stdin closed, closing session");
                    stdin_open = false;
                    bridge.close(&session).await?;
                }
            },
            event = events.recv() => {
                let Some(event) = event else { break };
                print_event(&event)?;
                match &event.payload {
                    EventPayload::Output { prompt_detected: true, .. } if cli.auto_complete => {
                        complete_oldest(&commands, &session).await?;
                    }
                    EventPayload::SessionClosed { .. } if event.session_id == session => break,
                    _ => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("received interrupt");
                break;
            }
        }
    }

    monitor.shutdown().await?;
    bridge.shutdown().await;
    let stats = commands.stats()?;
    info!(
        total = stats.total_commands,
        queued = stats.queued,
        "command summary"
    );
    bus.shutdown().await?;
    Ok(())
}

fn print_event(event: &Event) -> anyhow::Result<()> {
    if let Some(data) = event.output() {
        let mut out = std::io::stdout().lock();
        out.write_all(data)?;
        out.flush()?;
        return Ok(());
    }
    eprintln!("[{}] {}", event.kind().as_str(), serde_json::to_string(event)?);
    Ok(())
}

async fn complete_oldest(commands: &CommandManager, session: &SessionId) -> anyhow::Result<()> {
    let oldest = commands
        .history(session)?
        .into_iter()
        .find(|c| c.status == CommandStatus::Accepted);
    if let Some(command) = oldest {
        if let Err(e) = commands.mark_completed(command.id, true).await {
            warn!(command_id = %command.id, error = %e, "could not complete command");
        }
    }
    Ok(())
}
