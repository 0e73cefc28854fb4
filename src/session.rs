//! The development session.
//!
//! A session finalizes the port from the `.env` store, turns the configured
//! watchers (plus the delayed browser opener) into specs, supervises them and
//! maps the supervision outcome to a user-facing status.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::TaskConfig;
use crate::env_file::{get_port, port_number, EnvEntries, EnvStore, DEFAULT_PORT, PORT_KEY};
use crate::errors::{DevrackError, Result};
use crate::events::Event;
use crate::output::{OutputPrinter, PrefixStyle};
use crate::process::{CommandLine, ExitInfo, ProcessSpec, TaskMode, TaskStatus};
use crate::runner::Launcher;
use crate::supervisor::{ShutdownConfig, SupervisionOutcome, SupervisionReport, Supervisor};

/// Everything a development session needs, after CLI and file settings are merged.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub env_file: PathBuf,
    pub host: String,
    pub open_browser: bool,
    pub browser_delay: Duration,
    pub browser_cmd: Option<String>,
    pub watchers: Vec<TaskConfig>,
    pub shutdown: ShutdownConfig,
    /// Tools inherit the terminal; no prefixed output.
    pub raw: bool,
    pub prefix: PrefixStyle,
}

/// How a session ended, as reported to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Stopped,
    Finished,
    Failed { id: String, exit: ExitInfo },
}

impl SessionStatus {
    pub fn exit_code(&self) -> i32 {
        match self {
            SessionStatus::Stopped | SessionStatus::Finished => 0,
            SessionStatus::Failed { .. } => 1,
        }
    }

    pub fn message(&self) -> String {
        match self {
            SessionStatus::Stopped => "stopped".to_string(),
            SessionStatus::Finished => "all tasks finished".to_string(),
            SessionStatus::Failed { id, exit } => format!("{} failed ({})", id, exit),
        }
    }
}

impl From<SupervisionOutcome> for SessionStatus {
    fn from(outcome: SupervisionOutcome) -> Self {
        match outcome {
            SupervisionOutcome::Interrupted => SessionStatus::Stopped,
            SupervisionOutcome::Completed => SessionStatus::Finished,
            SupervisionOutcome::Failed { id, exit } => SessionStatus::Failed { id, exit },
        }
    }
}

pub struct Session {
    settings: SessionSettings,
    launcher: Arc<dyn Launcher>,
}

impl Session {
    pub fn new(settings: SessionSettings, launcher: Arc<dyn Launcher>) -> Self {
        Self { settings, launcher }
    }

    /// Finalizes the port, then builds every spec of the session.
    pub fn prepare(&self) -> Result<Vec<ProcessSpec>> {
        let port = determine_port(&EnvStore::new(&self.settings.env_file));
        let specs = build_specs(&self.settings, &port)?;
        ensure_unique_ids(&specs)?;
        Ok(specs)
    }

    /// Runs the session until it is interrupted or a fatal task fails.
    /// `on_start` receives the sender that accepts shutdown requests.
    pub async fn run<F>(&self, on_start: F) -> Result<SessionStatus>
    where
        F: FnOnce(mpsc::Sender<Event>),
    {
        let specs = self.prepare()?;
        let mut supervisor = Supervisor::new(self.launcher.clone(), self.settings.shutdown);
        if !self.settings.raw {
            let tasks = specs
                .iter()
                .map(|spec| (spec.id.clone(), spec.color.clone()))
                .collect();
            supervisor = supervisor.with_output(OutputPrinter::new(tasks, self.settings.prefix.clone()));
        }
        on_start(supervisor.event_sender());
        let report = supervisor.run_all(&specs).await;
        for problem in unsuccessful_tasks(&report) {
            warn!("{}", problem);
        }
        Ok(SessionStatus::from(report.outcome))
    }
}

/// One line per task that exited non-zero or could not be started.
pub fn unsuccessful_tasks(report: &SupervisionReport) -> Vec<String> {
    report
        .tasks
        .iter()
        .filter_map(|task| match &task.status {
            TaskStatus::Exited { code: Some(code) } if *code != 0 => {
                Some(format!("{} exited with code {}", task.id, code))
            }
            TaskStatus::SpawnFailed { error } => Some(format!("{} could not start: {}", task.id, error)),
            _ => None,
        })
        .collect()
}

/// Returns the session port, persisting the default configuration when the
/// store has none. A failed write is only a warning. An unreadable store is
/// never overwritten.
pub fn determine_port(store: &EnvStore) -> String {
    let mut entries = match store.read() {
        Ok(entries) => entries,
        Err(err) => {
            warn!(error = %err, "could not read config; using default port without saving it");
            return DEFAULT_PORT.to_string();
        }
    };

    if let Err(err) = entries.mode() {
        warn!(error = %err, "unrecognised mode; the backend may reject it");
    }

    if let Some(port) = get_port(&entries) {
        return port.to_string();
    }

    entries.fill_missing(&EnvEntries::defaults());
    match store.write(&entries) {
        Ok(()) => info!(path = %store.path().display(), "wrote default config"),
        Err(err) => warn!(error = %err, "could not persist default config; continuing"),
    }
    get_port(&entries).unwrap_or(DEFAULT_PORT).to_string()
}

/// Watch specs for every configured watcher, then the delayed browser opener.
pub fn build_specs(settings: &SessionSettings, port: &str) -> Result<Vec<ProcessSpec>> {
    let mut specs = Vec::with_capacity(settings.watchers.len() + 1);
    for watcher in &settings.watchers {
        let mut spec = watcher.to_spec(TaskMode::Watch)?;
        if spec.depends_on_port {
            spec = spec.with_env(PORT_KEY, port);
        }
        specs.push(spec);
    }
    if settings.open_browser {
        if let Some(spec) = browser_spec(settings, port)? {
            specs.push(spec);
        }
    }
    if specs.is_empty() {
        return Err(DevrackError::NoTasks);
    }
    Ok(specs)
}

/// Delayed opener for `http://{host}:{port}`; `None` when the port is not numeric.
pub fn browser_spec(settings: &SessionSettings, port: &str) -> Result<Option<ProcessSpec>> {
    let Some(number) = port_number(port) else {
        warn!(port, "port is not numeric; not opening a browser");
        return Ok(None);
    };
    let url = format!("http://{}:{}", settings.host, number);
    let command = match &settings.browser_cmd {
        Some(cmd) => CommandLine::parse("browser", cmd)?.with_arg(url),
        None => default_opener(&url),
    };
    Ok(Some(ProcessSpec::delayed(
        "browser",
        command,
        settings.browser_delay,
    )))
}

fn default_opener(url: &str) -> CommandLine {
    let argv: Vec<&str> = if cfg!(target_os = "macos") {
        vec!["open", url]
    } else if cfg!(windows) {
        vec!["cmd", "/C", "start", "", url]
    } else {
        vec!["xdg-open", url]
    };
    CommandLine::Argv(argv.into_iter().map(String::from).collect())
}

pub fn ensure_unique_ids(specs: &[ProcessSpec]) -> Result<()> {
    let mut seen = HashSet::new();
    for spec in specs {
        if !seen.insert(spec.id.as_str()) {
            return Err(DevrackError::Command {
                id: spec.id.clone(),
                reason: "duplicate task name".to_string(),
            });
        }
    }
    Ok(())
}
