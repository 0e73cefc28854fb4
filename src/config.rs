//! Configuration management for devrack.
//!
//! This module defines the structure of the optional `devrack.toml` file and
//! the built-in tool commands used when the file does not override them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::errors::{DevrackError, Result};
use crate::process::{CommandLine, ProcessSpec, TaskMode};

pub const DEFAULT_CONFIG_FILE: &str = "devrack.toml";
pub const DEFAULT_ENV_FILE: &str = ".env";
pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_BROWSER_DELAY_MS: u64 = 2000;
pub const DEFAULT_RELEASE_CMD: &str = "go run main.go";

/// Top-level configuration structure corresponding to `devrack.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Path of the `KEY=VALUE` file holding `PORT` and `GIN_MODE`.
    pub env_file: Option<String>,
    /// Host used in the browser URL (default: localhost).
    pub host: Option<String>,
    /// Whether to open a browser once the server had time to start.
    pub open_browser: Option<bool>,
    pub browser_delay_ms: Option<u64>,
    /// Opener command; the URL is appended as the last argument.
    pub browser_cmd: Option<String>,
    /// Time to wait after sending SIGINT before escalating (ms).
    pub shutdown_sigint_ms: Option<u64>,
    /// Time to wait after sending SIGTERM before force-killing (ms).
    pub shutdown_sigterm_ms: Option<u64>,
    /// Let tools write straight to the terminal, without prefixes.
    pub raw: Option<bool>,
    /// Template for line prefixes (e.g., "[{name}]").
    pub prefix: Option<String>,
    /// Fixed length for prefixes (padding/truncation).
    pub prefix_length: Option<usize>,
    pub prefix_colors: Option<bool>,
    pub timestamp: Option<bool>,
    /// Watch-mode tools; replaces the built-in set when non-empty.
    #[serde(default, rename = "watch")]
    pub watchers: Vec<TaskConfig>,
    /// One-shot build tools; replaces the built-in set when non-empty.
    #[serde(default, rename = "build")]
    pub builders: Vec<TaskConfig>,
    pub release: Option<ReleaseConfig>,
}

/// Configuration for a single tool.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskConfig {
    /// Task id, also shown as the output prefix.
    pub name: String,
    pub cmd: String,
    /// Hand `cmd` to the platform shell instead of splitting it.
    pub shell: Option<bool>,
    pub cwd: Option<String>,
    pub color: Option<String>,
    pub env: Option<HashMap<String, String>>,
    /// Stop every other task when this one fails.
    pub fatal: Option<bool>,
    /// Abort the session when this one cannot be started.
    pub required: Option<bool>,
    /// Pass the finalized `PORT` in the environment.
    pub depends_on_port: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReleaseConfig {
    /// Command that runs the production server.
    pub cmd: Option<String>,
    pub ignore_build_errors: Option<bool>,
}

impl TaskConfig {
    pub fn new(name: &str, cmd: &str) -> Self {
        Self {
            name: name.to_string(),
            cmd: cmd.to_string(),
            shell: None,
            cwd: None,
            color: None,
            env: None,
            fatal: None,
            required: None,
            depends_on_port: None,
        }
    }

    fn colored(mut self, color: &str) -> Self {
        self.color = Some(color.to_string());
        self
    }

    /// Turns the table into a spec, splitting `cmd` with shell quoting rules
    /// unless `shell` is set.
    pub fn to_spec(&self, mode: TaskMode) -> Result<ProcessSpec> {
        let command = if self.shell.unwrap_or(false) {
            CommandLine::shell(&self.name, &self.cmd)?
        } else {
            CommandLine::parse(&self.name, &self.cmd)?
        };
        let mut spec = ProcessSpec::new(self.name.clone(), command, mode)
            .fatal(self.fatal.unwrap_or(false))
            .required(self.required.unwrap_or(false));
        spec.depends_on_port = self.depends_on_port.unwrap_or(false);
        spec.cwd = self.cwd.clone();
        spec.color = self.color.clone();
        spec.env = self.env.clone().unwrap_or_default();
        Ok(spec)
    }
}

impl Config {
    /// Configured watchers, or the built-in backend/styles/types trio.
    pub fn watchers(&self) -> Vec<TaskConfig> {
        if self.watchers.is_empty() {
            default_watchers()
        } else {
            self.watchers.clone()
        }
    }

    pub fn builders(&self) -> Vec<TaskConfig> {
        if self.builders.is_empty() {
            default_builders()
        } else {
            self.builders.clone()
        }
    }

    pub fn release_cmd(&self) -> String {
        self.release
            .as_ref()
            .and_then(|release| release.cmd.clone())
            .unwrap_or_else(|| DEFAULT_RELEASE_CMD.to_string())
    }

    pub fn ignore_build_errors(&self) -> bool {
        self.release
            .as_ref()
            .and_then(|release| release.ignore_build_errors)
            .unwrap_or(false)
    }
}

pub fn default_watchers() -> Vec<TaskConfig> {
    let mut backend = TaskConfig::new(
        "backend",
        r#"nodemon --ext go --exec "go run ." --signal SIGTERM"#,
    )
    .colored("cyan");
    backend.depends_on_port = Some(true);
    backend.required = Some(true);
    vec![
        backend,
        TaskConfig::new("styles", "sass --watch --no-source-map styles:assets").colored("magenta"),
        TaskConfig::new("types", "nodemon --ext ts --watch client --exec tsc").colored("yellow"),
    ]
}

pub fn default_builders() -> Vec<TaskConfig> {
    vec![
        TaskConfig::new("tsc", "tsc").colored("yellow"),
        TaskConfig::new("sass", "sass --no-source-map styles:assets").colored("magenta"),
    ]
}

/// `devrack.toml` in the current directory, if present.
pub fn default_config_path() -> Option<PathBuf> {
    let path = Path::new(DEFAULT_CONFIG_FILE);
    if path.exists() {
        Some(path.to_path_buf())
    } else {
        None
    }
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path).map_err(|err| DevrackError::ToolConfig {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })?;
    toml::from_str(&raw).map_err(|err| DevrackError::ToolConfig {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })
}
