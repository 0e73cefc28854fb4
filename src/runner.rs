//! Process launching and control.
//!
//! The supervisor never touches `tokio::process` directly. It goes through a
//! [`Launcher`] that turns a [`ProcessSpec`] into a [`ProcessHandle`], so tests
//! can swap in fake processes. [`OsLauncher`] is the production implementation:
//! it spawns each task in its own process group, forwards its output lines to
//! the event channel and delivers signals to the whole group.

use std::future::Future;
use std::pin::Pin;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::errors::{DevrackError, Result};
use crate::events::{Event, ProcessSignal};
use crate::output::StreamKind;
use crate::process::{ExitInfo, ProcessSpec};

/// Command sent from the supervisor to a task's driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Signal(ProcessSignal),
    Kill,
}

/// A running process the supervisor can signal, kill and await.
pub trait ProcessHandle: Send {
    fn pid(&self) -> Option<u32>;

    /// Sends a polite termination signal.
    fn signal(&mut self, signal: ProcessSignal) -> std::io::Result<()>;

    /// Starts a forced kill; completion is observed through [`ProcessHandle::wait`].
    fn kill(&mut self) -> std::io::Result<()>;

    /// Resolves once the process is gone.
    fn wait(&mut self) -> Pin<Box<dyn Future<Output = std::io::Result<ExitInfo>> + Send + '_>>;
}

/// Turns specs into running processes.
pub trait Launcher: Send + Sync {
    /// Starts the process for `spec`. `id` is the task's slot index, used to tag
    /// any events the process emits.
    fn launch(
        &self,
        id: usize,
        spec: &ProcessSpec,
        events: mpsc::Sender<Event>,
    ) -> Result<Box<dyn ProcessHandle>>;
}

/// Owns a handle until its process is gone, applying control commands meanwhile.
pub async fn drive(
    id: usize,
    mut handle: Box<dyn ProcessHandle>,
    mut control: mpsc::UnboundedReceiver<Control>,
    events: mpsc::Sender<Event>,
) {
    let exit = loop {
        tokio::select! {
            result = handle.wait() => {
                break match result {
                    Ok(exit) => exit,
                    Err(err) => ExitInfo::Error(err.to_string()),
                };
            }
            Some(command) = control.recv() => {
                let result = match command {
                    Control::Signal(signal) => handle.signal(signal),
                    Control::Kill => handle.kill(),
                };
                if let Err(err) = result {
                    warn!(task = id, ?command, error = %err, "failed to deliver control command");
                }
            }
        }
    };
    let _ = events.send(Event::TaskExited { id, exit }).await;
}

/// Spawns real OS processes.
#[derive(Debug, Clone, Copy)]
pub struct OsLauncher {
    /// Pipe output through the event channel instead of inheriting the terminal.
    piped: bool,
}

impl OsLauncher {
    pub fn new(piped: bool) -> Self {
        Self { piped }
    }
}

impl Launcher for OsLauncher {
    fn launch(
        &self,
        id: usize,
        spec: &ProcessSpec,
        events: mpsc::Sender<Event>,
    ) -> Result<Box<dyn ProcessHandle>> {
        let mut command = spec.to_command(self.piped);
        command.kill_on_drop(true);

        #[cfg(windows)]
        {
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
            command.creation_flags(CREATE_NEW_PROCESS_GROUP);
        }

        // Own process group: a terminal Ctrl-C reaches only the supervisor,
        // which then relays it to every task.
        #[cfg(unix)]
        unsafe {
            command.pre_exec(|| {
                let _ = libc::setpgid(0, 0);
                Ok(())
            });
        }

        let mut child = command.spawn().map_err(|source| DevrackError::Spawn {
            id: spec.id.clone(),
            source,
        })?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(read_stream(id, StreamKind::Stdout, stdout, events.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(read_stream(id, StreamKind::Stderr, stderr, events));
        }

        let pid = child.id();
        Ok(Box::new(ChildHandle { child, pid }))
    }
}

struct ChildHandle {
    child: tokio::process::Child,
    pid: Option<u32>,
}

impl ProcessHandle for ChildHandle {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn signal(&mut self, signal: ProcessSignal) -> std::io::Result<()> {
        match self.pid {
            Some(pid) => {
                send_os_signal(pid, signal);
                Ok(())
            }
            None => {
                debug!(?signal, "process already reaped; nothing to signal");
                Ok(())
            }
        }
    }

    fn kill(&mut self) -> std::io::Result<()> {
        #[cfg(unix)]
        {
            // Take the whole group down, not only the direct child.
            if let Some(pid) = self.pid {
                unsafe {
                    let _ = libc::kill(-(pid as i32), libc::SIGKILL);
                }
            }
        }
        self.child.start_kill()
    }

    fn wait(&mut self) -> Pin<Box<dyn Future<Output = std::io::Result<ExitInfo>> + Send + '_>> {
        Box::pin(async move {
            let status = self.child.wait().await?;
            Ok(ExitInfo::from(status))
        })
    }
}

#[cfg(unix)]
fn send_os_signal(pid: u32, signal: ProcessSignal) {
    unsafe {
        let sig = match signal {
            ProcessSignal::SigInt => libc::SIGINT,
            ProcessSignal::SigTerm => libc::SIGTERM,
        };
        let pid = pid as i32;
        let _ = libc::kill(-pid, sig);
        let _ = libc::kill(pid, sig);
    }
}

#[cfg(not(unix))]
fn send_os_signal(pid: u32, signal: ProcessSignal) {
    send_ctrl_break(pid, signal);
}

#[cfg(all(not(unix), windows))]
fn send_ctrl_break(pid: u32, signal: ProcessSignal) {
    use windows_sys::Win32::System::Console::GenerateConsoleCtrlEvent;
    use windows_sys::Win32::System::Console::CTRL_BREAK_EVENT;
    // Windows has no SIGTERM/SIGINT; CTRL_BREAK is the closest console signal we can emit.
    let _ = signal;
    unsafe {
        let _ = GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid);
    }
}

#[cfg(all(not(unix), not(windows)))]
fn send_ctrl_break(_pid: u32, _signal: ProcessSignal) {}

async fn read_stream<R>(id: usize, stream: StreamKind, reader: R, tx: mpsc::Sender<Event>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let _ = tx.send(Event::TaskOutput { id, line, stream }).await;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::process::{CommandLine, TaskMode};

    #[tokio::test]
    async fn os_launcher_reports_output_and_exit_code() {
        let (tx, mut rx) = mpsc::channel(16);
        let spec = ProcessSpec::new(
            "echo",
            CommandLine::Shell("echo hello; exit 3".to_string()),
            TaskMode::OneShot,
        );
        let handle = OsLauncher::new(true).launch(0, &spec, tx.clone()).unwrap();
        let (_control_tx, control_rx) = mpsc::unbounded_channel();
        tokio::spawn(drive(0, handle, control_rx, tx));

        let mut saw_output = false;
        let mut exit = None;
        while !(saw_output && exit.is_some()) {
            match rx.recv().await {
                Some(Event::TaskOutput { line, stream, .. }) => {
                    assert_eq!(line, "hello");
                    assert_eq!(stream, StreamKind::Stdout);
                    saw_output = true;
                }
                Some(Event::TaskExited { exit: info, .. }) => exit = Some(info),
                Some(Event::Shutdown { .. }) => unreachable!(),
                None => break,
            }
        }
        assert!(saw_output);
        assert_eq!(exit, Some(ExitInfo::Code(3)));
    }

    #[tokio::test]
    async fn os_launcher_maps_missing_binary_to_spawn_error() {
        let (tx, _rx) = mpsc::channel(1);
        let spec = ProcessSpec::watch(
            "ghost",
            CommandLine::Argv(vec!["devrack-definitely-missing-binary".to_string()]),
        );
        let err = OsLauncher::new(true).launch(0, &spec, tx).err().unwrap();
        assert!(matches!(err, DevrackError::Spawn { ref id, .. } if id == "ghost"));
    }

    #[tokio::test]
    async fn signal_terminates_running_process() {
        let (tx, mut rx) = mpsc::channel(16);
        let spec = ProcessSpec::watch("sleeper", CommandLine::Shell("sleep 30".to_string()));
        let handle = OsLauncher::new(true).launch(0, &spec, tx.clone()).unwrap();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        tokio::spawn(drive(0, handle, control_rx, tx));

        control_tx.send(Control::Signal(ProcessSignal::SigTerm)).unwrap();
        let exit = loop {
            match rx.recv().await {
                Some(Event::TaskExited { exit, .. }) => break exit,
                Some(_) => continue,
                None => panic!("channel closed"),
            }
        };
        assert!(!exit.success());
    }
}
