//! Event definitions for the supervisor loop.
//!
//! Everything the supervisor reacts to arrives as an `Event` on one channel:
//! process output and exits reported by the per-process drivers, and shutdown
//! requests coming from the OS signal listener.

use crate::output::StreamKind;
use crate::process::ExitInfo;

/// Represents an event in the supervisor's event loop.
#[derive(Debug, Clone)]
pub enum Event {
    /// A line of output (stdout or stderr) was received from a task.
    TaskOutput {
        id: usize,
        line: String,
        stream: StreamKind,
    },
    /// A task's process is gone.
    TaskExited { id: usize, exit: ExitInfo },
    /// Stop the whole group.
    Shutdown { signal: ProcessSignal },
}

/// Polite termination signals, in escalation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    SigInt,
    SigTerm,
}

impl ProcessSignal {
    pub fn label(&self) -> &'static str {
        match self {
            ProcessSignal::SigInt => "SIGINT",
            ProcessSignal::SigTerm => "SIGTERM",
        }
    }
}
