//! Data structures describing supervised tasks.
//!
//! This module defines the specification of a task (`ProcessSpec`), how it is
//! scheduled (`TaskMode`), its lifecycle status (`TaskStatus`) and how it ended
//! (`ExitInfo`).

use std::collections::HashMap;
use std::fmt;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::errors::{DevrackError, Result};

/// How a task's command is invoked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandLine {
    /// Program followed by its arguments, executed directly.
    Argv(Vec<String>),
    /// A command string handed to the platform shell.
    Shell(String),
}

impl CommandLine {
    /// Splits a command string with shell quoting rules into an argv.
    pub fn parse(id: &str, raw: &str) -> Result<Self> {
        let parts = shell_words::split(raw).map_err(|err| DevrackError::Command {
            id: id.to_string(),
            reason: err.to_string(),
        })?;
        if parts.is_empty() {
            return Err(DevrackError::Command {
                id: id.to_string(),
                reason: "empty command".to_string(),
            });
        }
        Ok(CommandLine::Argv(parts))
    }

    /// A command line run through the platform shell as written.
    pub fn shell(id: &str, raw: &str) -> Result<Self> {
        let line = raw.trim();
        if line.is_empty() {
            return Err(DevrackError::Command {
                id: id.to_string(),
                reason: "empty command".to_string(),
            });
        }
        Ok(CommandLine::Shell(line.to_string()))
    }

    /// Appends one argument; shell lines get it quoted.
    pub fn with_arg(self, arg: impl Into<String>) -> Self {
        let arg = arg.into();
        match self {
            CommandLine::Argv(mut parts) => {
                parts.push(arg);
                CommandLine::Argv(parts)
            }
            CommandLine::Shell(line) => CommandLine::Shell(format!("{} {}", line, shell_words::quote(&arg))),
        }
    }

    /// Builds a tokio command with no stdio configuration applied.
    pub fn to_command(&self) -> Command {
        match self {
            CommandLine::Argv(parts) => match parts.split_first() {
                Some((program, args)) => {
                    let mut cmd = Command::new(program);
                    cmd.args(args);
                    cmd
                }
                // Fails at spawn time with a NotFound error.
                None => Command::new(""),
            },
            CommandLine::Shell(line) => {
                if cfg!(windows) {
                    let mut cmd = Command::new("cmd");
                    cmd.arg("/C").arg(line);
                    cmd
                } else {
                    let mut cmd = Command::new("sh");
                    cmd.arg("-c").arg(line);
                    cmd
                }
            }
        }
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandLine::Argv(parts) => f.write_str(&shell_words::join(parts)),
            CommandLine::Shell(line) => f.write_str(line),
        }
    }
}

/// Scheduling mode of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskMode {
    /// Runs until terminated.
    Watch,
    /// Exits on its own; the exit status matters.
    OneShot,
    /// Starts only once the delay has elapsed since supervision began.
    Delayed(Duration),
}

/// Specification for a task to be supervised.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    /// Unique task id, also used as the output prefix.
    pub id: String,
    pub command: CommandLine,
    pub mode: TaskMode,
    /// Receives the finalized `PORT` in its environment.
    pub depends_on_port: bool,
    /// A failing exit brings the whole group down.
    pub fatal_on_failure: bool,
    /// A spawn failure brings the whole group down.
    pub required: bool,
    pub env: HashMap<String, String>,
    pub cwd: Option<String>,
    /// Color to use for the task name in output prefixes.
    pub color: Option<String>,
}

impl ProcessSpec {
    pub fn new(id: impl Into<String>, command: CommandLine, mode: TaskMode) -> Self {
        Self {
            id: id.into(),
            command,
            mode,
            depends_on_port: false,
            fatal_on_failure: false,
            required: false,
            env: HashMap::new(),
            cwd: None,
            color: None,
        }
    }

    pub fn watch(id: impl Into<String>, command: CommandLine) -> Self {
        Self::new(id, command, TaskMode::Watch)
    }

    pub fn delayed(id: impl Into<String>, command: CommandLine, delay: Duration) -> Self {
        Self::new(id, command, TaskMode::Delayed(delay))
    }

    pub fn fatal(mut self, fatal: bool) -> Self {
        self.fatal_on_failure = fatal;
        self
    }

    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Delay before the task may start; `None` for tasks that start immediately.
    pub fn start_delay(&self) -> Option<Duration> {
        match self.mode {
            TaskMode::Delayed(delay) => Some(delay),
            TaskMode::Watch | TaskMode::OneShot => None,
        }
    }

    /// Builds the OS command, with stdout/stderr piped or inherited.
    pub fn to_command(&self, piped: bool) -> Command {
        let mut command = self.command.to_command();
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        if !self.env.is_empty() {
            command.envs(&self.env);
        }
        command.stdin(Stdio::null());
        if piped {
            command.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            command.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        }
        command
    }
}

/// How a process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitInfo {
    /// Exited with a status code.
    Code(i32),
    /// Terminated by a signal, no status code.
    Signaled,
    /// Never ran, or could not be awaited.
    Error(String),
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        matches!(self, ExitInfo::Code(0))
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            ExitInfo::Code(code) => Some(*code),
            ExitInfo::Signaled | ExitInfo::Error(_) => None,
        }
    }
}

impl From<std::process::ExitStatus> for ExitInfo {
    fn from(status: std::process::ExitStatus) -> Self {
        match status.code() {
            Some(code) => ExitInfo::Code(code),
            None => ExitInfo::Signaled,
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitInfo::Code(code) => write!(f, "exit code {}", code),
            ExitInfo::Signaled => f.write_str("terminated by signal"),
            ExitInfo::Error(err) => write!(f, "error: {}", err),
        }
    }
}

/// The lifecycle status of a supervised task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    /// Not launched yet (delayed tasks, or cancelled before launch).
    NotStarted,
    /// Process is actively running.
    Running { pid: Option<u32> },
    /// Process exited on its own or after a polite signal.
    Exited { code: Option<i32> },
    /// Process had to be force-killed.
    Killed,
    /// Process could not be launched.
    SpawnFailed { error: String },
}

impl TaskStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, TaskStatus::Running { .. })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Exited { .. } | TaskStatus::Killed | TaskStatus::SpawnFailed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_quoted_command() {
        let cmd = CommandLine::parse("backend", r#"nodemon --ext go --exec "go run ." --signal SIGTERM"#)
            .unwrap();
        assert_eq!(
            cmd,
            CommandLine::Argv(vec![
                "nodemon".into(),
                "--ext".into(),
                "go".into(),
                "--exec".into(),
                "go run .".into(),
                "--signal".into(),
                "SIGTERM".into(),
            ])
        );
        assert_eq!(
            cmd.to_string(),
            "nodemon --ext go --exec 'go run .' --signal SIGTERM"
        );
    }

    #[test]
    fn rejects_empty_and_unbalanced_commands() {
        assert!(matches!(
            CommandLine::parse("x", "   "),
            Err(DevrackError::Command { .. })
        ));
        assert!(CommandLine::parse("x", "sass \"unterminated").is_err());
    }

    #[test]
    fn exit_info_success_only_for_zero() {
        assert!(ExitInfo::Code(0).success());
        assert!(!ExitInfo::Code(2).success());
        assert!(!ExitInfo::Signaled.success());
        assert_eq!(ExitInfo::Code(2).to_string(), "exit code 2");
    }

    #[test]
    fn appended_argument_is_quoted_for_the_shell() {
        let argv = CommandLine::Argv(vec!["open".into()]).with_arg("http://localhost:3000");
        assert_eq!(
            argv,
            CommandLine::Argv(vec!["open".into(), "http://localhost:3000".into()])
        );
        let shell = CommandLine::Shell("firefox --new-tab".into()).with_arg("http://a b");
        assert_eq!(shell, CommandLine::Shell("firefox --new-tab 'http://a b'".into()));
    }

    #[test]
    fn delayed_mode_reports_delay() {
        let spec = ProcessSpec::delayed(
            "browser",
            CommandLine::Shell("true".into()),
            Duration::from_secs(2),
        );
        assert_eq!(spec.start_delay(), Some(Duration::from_secs(2)));
        let spec = ProcessSpec::watch("styles", CommandLine::Shell("true".into()));
        assert_eq!(spec.start_delay(), None);
    }
}
