//! One-shot build of the frontend assets.
//!
//! Every builder (type-checker and stylesheet compiler by default) runs once,
//! concurrently, with its output captured. A builder has errors when it exits
//! non-zero or writes anything to stderr.

use std::io::Write;

use tracing::{debug, info};

use crate::config::TaskConfig;
use crate::errors::Result;
use crate::output::sanitize_text;
use crate::process::{ExitInfo, TaskMode};

/// Captured result of one builder.
#[derive(Debug, Clone)]
pub struct ToolReport {
    pub name: String,
    pub exit: ExitInfo,
    pub stdout: String,
    pub stderr: String,
}

impl ToolReport {
    pub fn has_errors(&self) -> bool {
        !self.exit.success() || !self.stderr.trim().is_empty()
    }

    /// Text shown under the tool's header. Some compilers (tsc) report on
    /// stdout, so stdout is included whenever the exit status is a failure.
    pub fn diagnostics(&self) -> String {
        let mut parts = Vec::new();
        if !self.exit.success() && !self.stdout.trim().is_empty() {
            parts.push(self.stdout.trim_end());
        }
        if !self.stderr.trim().is_empty() {
            parts.push(self.stderr.trim_end());
        }
        if parts.is_empty() {
            return self.exit.to_string();
        }
        parts.join("\n")
    }
}

#[derive(Debug, Clone, Default)]
pub struct BuildReport {
    pub tools: Vec<ToolReport>,
}

impl BuildReport {
    pub fn success(&self) -> bool {
        self.tools.iter().all(|tool| !tool.has_errors())
    }

    /// Writes each failing tool's diagnostics under a labelled header, or the
    /// release instructions when every tool succeeded.
    pub fn print<W: Write>(
        &self,
        out: &mut W,
        strip_color: bool,
        release_cmd: &str,
    ) -> std::io::Result<()> {
        if self.success() {
            return writeln!(out, "{}", success_message(release_cmd));
        }
        self.print_diagnostics(out, strip_color)
    }

    pub fn print_diagnostics<W: Write>(&self, out: &mut W, strip_color: bool) -> std::io::Result<()> {
        for tool in self.tools.iter().filter(|tool| tool.has_errors()) {
            writeln!(out, "{} errors:", tool.name)?;
            writeln!(out, "{}", sanitize_text(&tool.diagnostics(), strip_color))?;
            writeln!(out)?;
        }
        Ok(())
    }
}

fn success_message(release_cmd: &str) -> String {
    format!(
        "Build completed without any errors.\n\
         \n\
         Now you can modify your .env file:\n\
         \n\
         PORT=<actual port, see documentation for HTTP and HTTPS common ports>\n\
         GIN_MODE=release\n\
         \n\
         and after that to run project in production, type:\n\
         \n\
         $ {}\n\
         \n\
         or let `devrack release` do both.",
        release_cmd
    )
}

/// Runs every builder concurrently and waits for all of them.
pub async fn run_builders(builders: &[TaskConfig]) -> Result<BuildReport> {
    let mut pending = Vec::with_capacity(builders.len());
    for builder in builders {
        let spec = builder.to_spec(TaskMode::OneShot)?;
        let mut command = spec.to_command(true);
        command.kill_on_drop(true);
        info!(tool = %spec.id, cmd = %spec.command, "running builder");
        pending.push((spec.id, tokio::spawn(async move { command.output().await })));
    }

    let mut report = BuildReport::default();
    for (name, task) in pending {
        let tool = match task.await {
            Ok(Ok(output)) => ToolReport {
                name,
                exit: ExitInfo::from(output.status),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            },
            Ok(Err(err)) => ToolReport {
                stderr: format!("failed to start {}: {}", name, err),
                name,
                exit: ExitInfo::Error(err.to_string()),
                stdout: String::new(),
            },
            Err(err) => ToolReport {
                stderr: err.to_string(),
                name,
                exit: ExitInfo::Error(err.to_string()),
                stdout: String::new(),
            },
        };
        debug!(tool = %tool.name, exit = %tool.exit, errors = tool.has_errors(), "builder finished");
        report.tools.push(tool);
    }
    Ok(report)
}
