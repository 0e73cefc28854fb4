//! Release preparation.
//!
//! Asks for the production port, switches the `.env` store to release mode,
//! runs the builders and optionally starts the production server under the
//! supervisor.

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::builders::run_builders;
use crate::config::TaskConfig;
use crate::env_file::{get_port, port_number, EnvEntries, EnvStore, Mode, MODE_KEY, PORT_KEY};
use crate::errors::Result;
use crate::events::Event;
use crate::output::{OutputPrinter, PrefixStyle};
use crate::process::{CommandLine, ProcessSpec};
use crate::runner::Launcher;
use crate::session::SessionStatus;
use crate::supervisor::{ShutdownConfig, Supervisor};

const FALLBACK_PORT: u16 = 3000;

#[derive(Debug, Clone)]
pub struct ReleaseSettings {
    pub env_file: PathBuf,
    /// Skips the port prompt.
    pub port: Option<u16>,
    /// `Some` skips the launch prompt.
    pub run: Option<bool>,
    pub ignore_build_errors: bool,
    pub builders: Vec<TaskConfig>,
    pub release_cmd: String,
    pub strip_color: bool,
    pub shutdown: ShutdownConfig,
    pub prefix: PrefixStyle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseStatus {
    /// Config written and build done; the server was not started.
    Prepared,
    /// Builders reported errors, nothing was launched.
    BuildFailed,
    Launched(SessionStatus),
}

impl ReleaseStatus {
    pub fn exit_code(&self) -> i32 {
        match self {
            ReleaseStatus::Prepared => 0,
            ReleaseStatus::BuildFailed => 1,
            ReleaseStatus::Launched(status) => status.exit_code(),
        }
    }
}

/// Asks for a port until a valid one is entered. Empty input or EOF picks
/// `default`. Returns the value in `:port` form.
pub fn prompt_port<R: BufRead, W: Write>(input: &mut R, out: &mut W, default: u16) -> Result<String> {
    loop {
        write!(out, "Port for the production server [{}]: ", default)?;
        out.flush()?;
        let mut line = String::new();
        if input.read_line(&mut line)? == 0 {
            writeln!(out)?;
            return Ok(format!(":{}", default));
        }
        let answer = line.trim();
        if answer.is_empty() {
            return Ok(format!(":{}", default));
        }
        match port_number(answer) {
            Some(port) => return Ok(format!(":{}", port)),
            None => writeln!(out, "Not a valid port: {}", answer)?,
        }
    }
}

pub fn prompt_yes_no<R: BufRead, W: Write>(
    input: &mut R,
    out: &mut W,
    question: &str,
    default: bool,
) -> Result<bool> {
    let hint = if default { "Y/n" } else { "y/N" };
    loop {
        write!(out, "{} [{}]: ", question, hint)?;
        out.flush()?;
        let mut line = String::new();
        if input.read_line(&mut line)? == 0 {
            writeln!(out)?;
            return Ok(default);
        }
        match line.trim().to_lowercase().as_str() {
            "" => return Ok(default),
            "y" | "yes" => return Ok(true),
            "n" | "no" => return Ok(false),
            _ => writeln!(out, "Please answer y or n.")?,
        }
    }
}

/// Sets `PORT` and release mode, keeps every other key and fills missing defaults.
/// A store that exists but cannot be read is left untouched.
pub fn write_release_config(store: &EnvStore, port: &str) -> Result<EnvEntries> {
    let mut entries = store.read()?;
    entries.set(PORT_KEY, port);
    entries.set(MODE_KEY, Mode::Release.as_str());
    entries.fill_missing(&EnvEntries::defaults());
    store.write(&entries)?;
    info!(path = %store.path().display(), port, "wrote release config");
    Ok(entries)
}

/// The production server: must start, and its failure ends the session.
pub fn release_spec(cmd: &str, port: &str) -> Result<ProcessSpec> {
    let command = CommandLine::parse("server", cmd)?;
    let mut spec = ProcessSpec::watch("server", command)
        .required(true)
        .fatal(true)
        .with_env(PORT_KEY, port)
        .with_env(MODE_KEY, Mode::Release.as_str());
    spec.depends_on_port = true;
    spec.color = Some("green".to_string());
    Ok(spec)
}

/// Runs the release flow. `on_start` receives the shutdown sender if the
/// server gets launched.
pub async fn run_release<R, W, F>(
    settings: &ReleaseSettings,
    input: &mut R,
    out: &mut W,
    launcher: Arc<dyn Launcher>,
    on_start: F,
) -> Result<ReleaseStatus>
where
    R: BufRead,
    W: Write,
    F: FnOnce(mpsc::Sender<Event>),
{
    let store = EnvStore::new(&settings.env_file);
    let port = match settings.port {
        Some(port) => format!(":{}", port),
        None => {
            let current = store
                .read()
                .ok()
                .and_then(|entries| get_port(&entries).and_then(port_number));
            prompt_port(input, out, current.unwrap_or(FALLBACK_PORT))?
        }
    };

    write_release_config(&store, &port)?;
    writeln!(
        out,
        "Updated {}: {}={} {}={}",
        store.path().display(),
        PORT_KEY,
        port,
        MODE_KEY,
        Mode::Release
    )?;

    let report = run_builders(&settings.builders).await?;
    if report.success() {
        writeln!(out, "Build completed without any errors.")?;
    } else {
        report.print_diagnostics(out, settings.strip_color)?;
        if !settings.ignore_build_errors {
            writeln!(
                out,
                "Build failed; not starting the server. Fix the errors or pass --ignore-build-errors."
            )?;
            return Ok(ReleaseStatus::BuildFailed);
        }
        warn!("build reported errors; continuing as requested");
    }

    let run = match settings.run {
        Some(run) => run,
        None => prompt_yes_no(input, out, "Start the production server now?", true)?,
    };
    if !run {
        writeln!(out, "Run `{}` to start the server.", settings.release_cmd)?;
        return Ok(ReleaseStatus::Prepared);
    }

    let specs = vec![release_spec(&settings.release_cmd, &port)?];
    let tasks = specs
        .iter()
        .map(|spec| (spec.id.clone(), spec.color.clone()))
        .collect();
    let mut supervisor = Supervisor::new(launcher, settings.shutdown)
        .with_output(OutputPrinter::new(tasks, settings.prefix.clone()));
    on_start(supervisor.event_sender());
    let report = supervisor.run_all(&specs).await;
    Ok(ReleaseStatus::Launched(SessionStatus::from(report.outcome)))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::time::Duration;

    use super::*;
    use crate::errors::DevrackError;
    use crate::events::ProcessSignal;
    use crate::process::ExitInfo;
    use crate::testing::{Behaviour, FakeLauncher};

    fn settings(env_file: PathBuf) -> ReleaseSettings {
        ReleaseSettings {
            env_file,
            port: Some(8080),
            run: Some(false),
            ignore_build_errors: false,
            builders: Vec::new(),
            release_cmd: "go run main.go".to_string(),
            strip_color: true,
            shutdown: ShutdownConfig::default(),
            prefix: PrefixStyle::default(),
        }
    }

    #[test]
    fn prompt_rejects_invalid_ports_and_asks_again() {
        let mut input = Cursor::new("abc\n70000\n:0\n8080\n");
        let mut out = Vec::new();
        let port = prompt_port(&mut input, &mut out, 3000).unwrap();
        assert_eq!(port, ":8080");
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.matches("Not a valid port").count(), 3);
        assert_eq!(text.matches("Port for the production server [3000]").count(), 4);
    }

    #[test]
    fn prompt_uses_default_on_empty_input_or_eof() {
        let mut out = Vec::new();
        assert_eq!(prompt_port(&mut Cursor::new("\n"), &mut out, 4000).unwrap(), ":4000");
        assert_eq!(prompt_port(&mut Cursor::new(""), &mut out, 4000).unwrap(), ":4000");
        assert_eq!(prompt_port(&mut Cursor::new(" :9000 \n"), &mut out, 4000).unwrap(), ":9000");
    }

    #[test]
    fn yes_no_prompt() {
        let mut out = Vec::new();
        assert!(prompt_yes_no(&mut Cursor::new("y\n"), &mut out, "Go?", false).unwrap());
        assert!(!prompt_yes_no(&mut Cursor::new("No\n"), &mut out, "Go?", true).unwrap());
        assert!(prompt_yes_no(&mut Cursor::new("\n"), &mut out, "Go?", true).unwrap());
        assert!(prompt_yes_no(&mut Cursor::new("maybe\nyes\n"), &mut out, "Go?", false).unwrap());
    }

    #[test]
    fn release_config_keeps_unrelated_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = EnvStore::new(dir.path().join(".env"));
        std::fs::write(store.path(), "GIN_MODE=debug\nPORT=:3000\nSECRET=abc\n").unwrap();

        write_release_config(&store, ":8443").unwrap();

        assert_eq!(
            std::fs::read_to_string(store.path()).unwrap(),
            "GIN_MODE=release\nPORT=:8443\nSECRET=abc\nDB_FILE=database.db\n"
        );
    }

    #[test]
    fn release_config_survives_non_utf8_lines() {
        let dir = tempfile::tempdir().unwrap();
        let store = EnvStore::new(dir.path().join(".env"));
        std::fs::write(store.path(), b"PORT=:8080\nSECRET=keep-me\n# caf\xE9\n").unwrap();

        write_release_config(&store, ":9000").unwrap();

        let entries = store.read().unwrap();
        assert_eq!(entries.get(PORT_KEY), Some(":9000"));
        assert_eq!(entries.get("SECRET"), Some("keep-me"));
    }

    #[test]
    fn unreadable_store_is_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let store = EnvStore::new(dir.path());
        assert!(matches!(
            write_release_config(&store, ":9000"),
            Err(DevrackError::ConfigRead { .. })
        ));
        assert!(dir.path().is_dir());
    }

    #[test]
    fn release_spec_is_required_and_fatal() {
        let spec = release_spec("go run main.go", ":8080").unwrap();
        assert!(spec.required);
        assert!(spec.fatal_on_failure);
        assert_eq!(spec.env.get(PORT_KEY).map(String::as_str), Some(":8080"));
        assert_eq!(spec.env.get(MODE_KEY).map(String::as_str), Some("release"));
    }

    #[tokio::test]
    async fn prepares_without_launching() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path().join(".env"));
        let launcher = FakeLauncher::new();
        let journal = launcher.journal();
        let mut out = Vec::new();

        let status = run_release(&settings, &mut Cursor::new(""), &mut out, Arc::new(launcher), |_| {})
            .await
            .unwrap();

        assert_eq!(status, ReleaseStatus::Prepared);
        assert_eq!(status.exit_code(), 0);
        assert!(journal.launched().is_empty());
        let entries = EnvStore::new(dir.path().join(".env")).read().unwrap();
        assert_eq!(entries.get(PORT_KEY), Some(":8080"));
        assert_eq!(entries.mode().unwrap(), Some(Mode::Release));
        assert!(String::from_utf8(out).unwrap().contains("Run `go run main.go`"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_build_blocks_launch() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(dir.path().join(".env"));
        settings.run = Some(true);
        settings.builders = vec![TaskConfig::new("sass", "sh -c 'echo broken >&2'")];
        let launcher = FakeLauncher::new();
        let journal = launcher.journal();
        let mut out = Vec::new();

        let status = run_release(&settings, &mut Cursor::new(""), &mut out, Arc::new(launcher), |_| {})
            .await
            .unwrap();

        assert_eq!(status, ReleaseStatus::BuildFailed);
        assert_eq!(status.exit_code(), 1);
        assert!(journal.launched().is_empty());
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("sass errors:\nbroken\n"));
    }

    #[tokio::test(start_paused = true)]
    async fn launches_server_after_prompted_confirmation() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(dir.path().join(".env"));
        settings.port = None;
        settings.run = None;
        let launcher = FakeLauncher::new();
        let journal = launcher.journal();
        let mut out = Vec::new();

        let status = run_release(
            &settings,
            &mut Cursor::new("9000\ny\n"),
            &mut out,
            Arc::new(launcher),
            |tx| {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    let _ = tx
                        .send(Event::Shutdown {
                            signal: ProcessSignal::SigInt,
                        })
                        .await;
                });
            },
        )
        .await
        .unwrap();

        assert_eq!(status, ReleaseStatus::Launched(SessionStatus::Stopped));
        assert_eq!(journal.launched(), vec!["server"]);
        let entries = EnvStore::new(dir.path().join(".env")).read().unwrap();
        assert_eq!(entries.get(PORT_KEY), Some(":9000"));
    }

    #[tokio::test(start_paused = true)]
    async fn crashing_server_fails_release() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(dir.path().join(".env"));
        settings.run = Some(true);
        let launcher = FakeLauncher::new().with(
            "server",
            Behaviour::ExitAfter {
                after: Duration::from_millis(10),
                code: 1,
            },
        );
        let mut out = Vec::new();

        let status = run_release(&settings, &mut Cursor::new(""), &mut out, Arc::new(launcher), |_| {})
            .await
            .unwrap();

        assert_eq!(
            status,
            ReleaseStatus::Launched(SessionStatus::Failed {
                id: "server".to_string(),
                exit: ExitInfo::Code(1),
            })
        );
        assert_eq!(status.exit_code(), 1);
    }
}
