//! Gamemon: launches a game executable and monitors its process tree.
//!
//! This is the entry point of the CLI frontend. It resolves a game
//! definition (TOML file and/or command line), launches the game through
//! the wrapper helper and drives the cooperative event loop until the run
//! reaches its terminal state, then exits with the recovered return code.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use gamemon::config::{self, GameConfig};
use gamemon::effects::CommandEffects;
use gamemon::env::{LaunchEnvironment, UserEnv};
use gamemon::events::{Event, RunReport};
use gamemon::filter::ProcessFilter;
use gamemon::launcher::{GameCommand, LaunchSpec};
use gamemon::monitor::{LifecycleMonitor, MonitorOptions};
use gamemon::output::StreamKind;
use gamemon::registry::RunRegistry;
use gamemon::runner::Runner;

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "gamemon",
    version,
    about = "Game launcher and process lifecycle monitor"
)]
struct Cli {
    /// Path to a game definition file (game.toml).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Display name of the game.
    #[arg(long)]
    name: Option<String>,
    /// Working directory for the game.
    #[arg(long)]
    working_dir: Option<String>,
    /// Extra environment entries (KEY=VAL).
    #[arg(long)]
    env: Vec<String>,
    /// Run the game inside a terminal emulator.
    #[arg(long)]
    terminal: bool,
    /// Terminal emulator executable (default: xterm).
    #[arg(long)]
    terminal_app: Option<String>,
    /// Process names to force-monitor, whitespace separated.
    #[arg(long)]
    include_processes: Option<String>,
    /// Process names to ignore, whitespace separated.
    #[arg(long)]
    exclude_processes: Option<String>,
    /// Path whose disappearance force-stops the game.
    #[arg(long)]
    killswitch: Option<String>,
    /// Heartbeat interval in milliseconds.
    #[arg(long)]
    heartbeat_ms: Option<u64>,
    /// Game command: gamemon [options] -- cmd [args...]
    #[arg(trailing_var_arg = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = resolve_config(&cli)?;

    let runner = Runner::from_config(config.runner.as_ref());
    let command = runner.build_launch_command(config.command()?);

    let mut user_env: UserEnv = config
        .env
        .clone()
        .unwrap_or_default()
        .into_iter()
        .map(|(key, value)| (key, Some(value)))
        .collect();
    for (key, value) in runner.launch_env() {
        user_env
            .entry(key)
            .or_insert_with(|| Some(toml::Value::String(value)));
    }
    for entry in &cli.env {
        let Some((key, value)) = entry.split_once('=') else {
            bail!("--env entries must be KEY=VAL, got '{entry}'");
        };
        user_env.insert(
            key.to_string(),
            Some(toml::Value::String(value.to_string())),
        );
    }
    let env = LaunchEnvironment::build(&user_env);

    let filter = ProcessFilter::from_strings(
        config.include_processes.as_deref().unwrap_or(""),
        config.exclude_processes.as_deref().unwrap_or(""),
    )?;

    let terminal = config
        .terminal
        .unwrap_or(false)
        .then(|| config.terminal_app.clone().unwrap_or_else(|| "xterm".to_string()));

    let include = shell_words::split(config.include_processes.as_deref().unwrap_or(""))?;
    let exclude = shell_words::split(config.exclude_processes.as_deref().unwrap_or(""))?;

    let spec = LaunchSpec {
        title: config.name.clone(),
        command,
        env,
        working_dir: config.working_dir.clone(),
        terminal,
        include_processes: include,
        exclude_processes: exclude,
    };
    let launcher = GameCommand::new(spec).context("cannot set up the launch")?;
    let run_token = launcher.env.run_token.clone();

    let effects = Box::new(CommandEffects::new(config.effects.clone().unwrap_or_default()));
    let options = MonitorOptions::from_config(&config);

    let (event_tx, mut event_rx) = mpsc::channel(256);
    let mut registry = RunRegistry::new();
    let mut monitor =
        LifecycleMonitor::new(launcher, runner, filter, effects, options, event_tx);

    info!(game = %config.name, "launching");
    monitor.launch().await?;
    registry.register(&run_token, &config.name);

    let mut heartbeat = tokio::time::interval(monitor.heartbeat_interval());
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut stop_requested = false;
    let mut launch_failed = false;

    let report = loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                monitor.beat();
            }
            _ = tokio::signal::ctrl_c() => {
                if stop_requested {
                    warn!("second interrupt, force quitting the game");
                    monitor.force_stop();
                } else {
                    info!("interrupt received, stopping the game");
                    stop_requested = true;
                    monitor.request_stop();
                }
            }
            event = event_rx.recv() => match event {
                Some(Event::Started { pid }) => info!(pid, "game process started"),
                Some(Event::Output { line, stream }) => print_output(&line, stream),
                Some(Event::Exited) => monitor.handle_exited(),
                Some(Event::Failed { error }) => {
                    launch_failed = true;
                    error!(%error, "launch failed");
                }
                Some(Event::ForceStopDone) => monitor.on_game_quit(),
                Some(Event::Stopped(report)) => break report,
                None => bail!("event channel closed before the run finished"),
            }
        }
    };

    registry.deregister(&run_token);
    report_run(&config.name, &report);
    let fallback = if launch_failed { 1 } else { 0 };
    std::process::exit(report.return_code.unwrap_or(fallback));
}

/// Merges the definition file with command-line overrides. Without a
/// file, the command line must carry the whole definition.
fn resolve_config(cli: &Cli) -> Result<GameConfig> {
    let mut config = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => {
            if cli.command.is_empty() {
                bail!("no game defined; pass --config game.toml or -- cmd [args...]");
            }
            let exec = shell_words::join(&cli.command);
            let name = cli.name.clone().unwrap_or_else(|| {
                PathBuf::from(&cli.command[0])
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| cli.command[0].clone())
            });
            let raw = format!(
                "name = {}\nexec = {}\n",
                toml::Value::String(name),
                toml::Value::String(exec)
            );
            toml::from_str(&raw).context("failed to assemble game definition")?
        }
    };

    if !cli.command.is_empty() && cli.config.is_some() {
        config.exec = shell_words::join(&cli.command);
    }
    if let Some(name) = &cli.name {
        config.name = name.clone();
    }
    if let Some(working_dir) = &cli.working_dir {
        config.working_dir = Some(working_dir.clone());
    }
    if cli.terminal {
        config.terminal = Some(true);
    }
    if let Some(terminal_app) = &cli.terminal_app {
        config.terminal_app = Some(terminal_app.clone());
    }
    if let Some(include) = &cli.include_processes {
        config.include_processes = Some(include.clone());
    }
    if let Some(exclude) = &cli.exclude_processes {
        config.exclude_processes = Some(exclude.clone());
    }
    if let Some(killswitch) = &cli.killswitch {
        config.killswitch = Some(killswitch.clone());
    }
    if let Some(heartbeat_ms) = cli.heartbeat_ms {
        config.heartbeat_ms = Some(heartbeat_ms);
    }
    Ok(config)
}

/// Mirrors game output to the host stdout/stderr.
fn print_output(line: &str, stream: StreamKind) {
    match stream {
        StreamKind::Stdout => println!("{line}"),
        StreamKind::Stderr => eprintln!("{line}"),
    }
}

fn report_run(name: &str, report: &RunReport) {
    let RunReport {
        duration,
        return_code,
        short_session,
        diagnostic,
    } = report;
    match return_code {
        Some(code) => info!(
            game = name,
            seconds = duration.as_secs(),
            code,
            "run finished"
        ),
        None => info!(
            game = name,
            seconds = duration.as_secs(),
            "run finished with unknown exit code"
        ),
    }
    if *short_session {
        warn!(game = name, "session was too short to count as play time");
    }
    if let Some(diagnostic) = diagnostic {
        eprintln!("{diagnostic}");
    }
}
