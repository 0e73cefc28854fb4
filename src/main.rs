//! devrack: runs the watchers of a web project side by side.
//!
//! This is the entry point of the application. It parses command-line
//! arguments, merges them with `devrack.toml`, and dispatches to the
//! development session, the one-shot build, release preparation or init.

mod bootstrap;
mod builders;
mod config;
mod env_file;
mod errors;
mod events;
mod logging;
mod output;
mod process;
mod release;
mod runner;
mod session;
mod supervisor;
#[cfg(test)]
mod testing;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{CommandFactory, Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::{Config, DEFAULT_BROWSER_DELAY_MS, DEFAULT_ENV_FILE, DEFAULT_HOST};
use crate::events::{Event, ProcessSignal};
use crate::logging::LogLevel;
use crate::output::PrefixStyle;
use crate::release::ReleaseSettings;
use crate::runner::OsLauncher;
use crate::session::{Session, SessionSettings, SessionStatus};
use crate::supervisor::{ShutdownConfig, DEFAULT_SHUTDOWN_SIGINT_MS, DEFAULT_SHUTDOWN_SIGTERM_MS};

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "devrack",
    version,
    about = "Runs the backend, stylesheet and type-checker watchers of a web project together",
    styles = help_styles(),
    color = clap::ColorChoice::Always,
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
    /// Path to devrack.toml configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Ignore any devrack.toml in the current directory.
    #[arg(long, global = true)]
    no_config: bool,
    /// KEY=VALUE file holding PORT and GIN_MODE (default: .env).
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,
    /// Log verbosity; overrides DEVRACK_LOG.
    #[arg(long, value_enum, global = true)]
    log_level: Option<LogLevel>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start every watcher and open the browser (default).
    Dev(DevArgs),
    /// Run the type-checker and stylesheet compiler once.
    Build(BuildArgs),
    /// Switch .env to release mode, build, and optionally start the server.
    Release(ReleaseArgs),
    /// Create assets/ and a default .env if they are missing.
    Init,
    /// Show help information.
    Help,
    /// Show version information.
    Version,
}

#[derive(Debug, Default, clap::Args)]
struct DevArgs {
    /// Do not open a browser.
    #[arg(long)]
    no_browser: bool,
    /// Let tools write straight to the terminal, without prefixes.
    #[arg(long)]
    raw: bool,
    /// Prefix template (e.g. "[{name}]").
    #[arg(long)]
    prefix: Option<String>,
    /// Pad or truncate prefix to length.
    #[arg(long)]
    prefix_length: Option<usize>,
    /// Colorize prefixes.
    #[arg(long)]
    prefix_colors: bool,
    /// Prepend elapsed time to each line.
    #[arg(long)]
    timestamp: bool,
    /// Time to wait after sending SIGINT before escalating (ms).
    #[arg(long)]
    shutdown_sigint_ms: Option<u64>,
    /// Time to wait after sending SIGTERM before force-killing (ms).
    #[arg(long)]
    shutdown_sigterm_ms: Option<u64>,
}

#[derive(Debug, Default, clap::Args)]
struct BuildArgs {
    /// Strip ANSI colors from the reported diagnostics.
    #[arg(long)]
    no_color: bool,
}

#[derive(Debug, Default, clap::Args)]
struct ReleaseArgs {
    /// Production port; skips the prompt.
    #[arg(long, value_parser = clap::value_parser!(u16).range(1..))]
    port: Option<u16>,
    /// Start the server without asking.
    #[arg(long, conflicts_with = "no_run")]
    run: bool,
    /// Only prepare; never start the server.
    #[arg(long)]
    no_run: bool,
    /// Start the server even when the build reported errors.
    #[arg(long)]
    ignore_build_errors: bool,
    /// Strip ANSI colors from the reported diagnostics.
    #[arg(long)]
    no_color: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut cli = Cli::parse();
    let command = cli
        .command
        .take()
        .unwrap_or_else(|| Commands::Dev(DevArgs::default()));
    match command {
        Commands::Help => {
            Cli::command().print_help()?;
            println!();
            return Ok(());
        }
        Commands::Version => {
            println!("devrack {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        _ => {}
    }

    logging::init_logging(cli.log_level)?;
    let config = load_tool_config(&cli)?;

    let code = match command {
        Commands::Dev(args) => run_dev(session_settings(&cli, &config, &args)).await?,
        Commands::Build(args) => run_build(&config, &args).await?,
        Commands::Release(args) => run_release(release_settings(&cli, &config, &args)).await?,
        Commands::Init => run_init(&env_file_path(&cli, &config))?,
        Commands::Help | Commands::Version => 0,
    };
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

async fn run_dev(settings: SessionSettings) -> Result<i32> {
    let launcher = Arc::new(OsLauncher::new(!settings.raw));
    let session = Session::new(settings, launcher);
    let status = session
        .run(spawn_signal_listener)
        .await
        .context("failed to start the development session")?;
    report_status(&status);
    Ok(status.exit_code())
}

async fn run_build(config: &Config, args: &BuildArgs) -> Result<i32> {
    let report = builders::run_builders(&config.builders()).await?;
    let mut out = std::io::stdout();
    report.print(&mut out, args.no_color, &config.release_cmd())?;
    Ok(if report.success() { 0 } else { 1 })
}

async fn run_release(settings: ReleaseSettings) -> Result<i32> {
    let stdin = std::io::stdin();
    let mut input = stdin.lock();
    let mut out = std::io::stdout();
    let status = release::run_release(
        &settings,
        &mut input,
        &mut out,
        Arc::new(OsLauncher::new(true)),
        spawn_signal_listener,
    )
    .await
    .context("release preparation failed")?;
    if let release::ReleaseStatus::Launched(session) = &status {
        report_status(session);
    }
    Ok(status.exit_code())
}

fn run_init(env_file: &Path) -> Result<i32> {
    let ok = bootstrap::init(Path::new("."), env_file, &mut std::io::stdout())?;
    Ok(if ok { 0 } else { 1 })
}

fn report_status(status: &SessionStatus) {
    match status {
        SessionStatus::Failed { .. } => eprintln!("devrack: {}", status.message()),
        SessionStatus::Stopped | SessionStatus::Finished => println!("{}", status.message()),
    }
}

fn spawn_signal_listener(tx: mpsc::Sender<Event>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(err) => {
                    warn!(error = %err, "cannot listen for SIGTERM");
                    return;
                }
            };
            loop {
                let signal = tokio::select! {
                    result = tokio::signal::ctrl_c() => match result {
                        Ok(()) => ProcessSignal::SigInt,
                        Err(_) => return,
                    },
                    received = sigterm.recv() => match received {
                        Some(()) => ProcessSignal::SigTerm,
                        None => return,
                    },
                };
                if tx.send(Event::Shutdown { signal }).await.is_err() {
                    return;
                }
            }
        }
        #[cfg(not(unix))]
        {
            while tokio::signal::ctrl_c().await.is_ok() {
                let shutdown = Event::Shutdown {
                    signal: ProcessSignal::SigInt,
                };
                if tx.send(shutdown).await.is_err() {
                    return;
                }
            }
        }
    });
}

fn load_tool_config(cli: &Cli) -> Result<Config> {
    if cli.no_config {
        return Ok(Config::default());
    }
    let Some(path) = cli.config.clone().or_else(config::default_config_path) else {
        return Ok(Config::default());
    };
    let config = config::load_config(&path)?;
    debug!(path = %path.display(), "loaded config");
    Ok(config)
}

fn env_file_path(cli: &Cli, config: &Config) -> PathBuf {
    cli.env_file
        .clone()
        .or_else(|| config.env_file.as_ref().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ENV_FILE))
}

fn session_settings(cli: &Cli, config: &Config, args: &DevArgs) -> SessionSettings {
    let shutdown = ShutdownConfig::new(
        args.shutdown_sigint_ms
            .or(config.shutdown_sigint_ms)
            .unwrap_or(DEFAULT_SHUTDOWN_SIGINT_MS),
        args.shutdown_sigterm_ms
            .or(config.shutdown_sigterm_ms)
            .unwrap_or(DEFAULT_SHUTDOWN_SIGTERM_MS),
    );
    SessionSettings {
        env_file: env_file_path(cli, config),
        host: config
            .host
            .clone()
            .unwrap_or_else(|| DEFAULT_HOST.to_string()),
        open_browser: !args.no_browser && config.open_browser.unwrap_or(true),
        browser_delay: Duration::from_millis(
            config.browser_delay_ms.unwrap_or(DEFAULT_BROWSER_DELAY_MS),
        ),
        browser_cmd: config.browser_cmd.clone(),
        watchers: config.watchers(),
        shutdown,
        raw: args.raw || config.raw.unwrap_or(false),
        prefix: PrefixStyle {
            template: args.prefix.clone().or_else(|| config.prefix.clone()),
            length: args.prefix_length.or(config.prefix_length),
            colors: args.prefix_colors || config.prefix_colors.unwrap_or(false),
            timestamp: args.timestamp || config.timestamp.unwrap_or(false),
        },
    }
}

fn release_settings(cli: &Cli, config: &Config, args: &ReleaseArgs) -> ReleaseSettings {
    let run = if args.run {
        Some(true)
    } else if args.no_run {
        Some(false)
    } else {
        None
    };
    ReleaseSettings {
        env_file: env_file_path(cli, config),
        port: args.port,
        run,
        ignore_build_errors: args.ignore_build_errors || config.ignore_build_errors(),
        builders: config.builders(),
        release_cmd: config.release_cmd(),
        strip_color: args.no_color,
        shutdown: ShutdownConfig::new(
            config
                .shutdown_sigint_ms
                .unwrap_or(DEFAULT_SHUTDOWN_SIGINT_MS),
            config
                .shutdown_sigterm_ms
                .unwrap_or(DEFAULT_SHUTDOWN_SIGTERM_MS),
        ),
        prefix: PrefixStyle {
            template: config.prefix.clone(),
            length: config.prefix_length,
            colors: config.prefix_colors.unwrap_or(false),
            timestamp: config.timestamp.unwrap_or(false),
        },
    }
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
        .valid(Style::new().fg_color(Some(AnsiColor::Green.into())))
        .invalid(
            Style::new()
                .fg_color(Some(AnsiColor::Red.into()))
                .effects(Effects::BOLD),
        )
}
