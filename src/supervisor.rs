//! Supervision of a fixed group of tasks.
//!
//! `Supervisor::run_all` starts every task, waits for them, and brings the
//! whole group down when asked to. Each launched process is owned by a driver
//! task (see [`crate::runner::drive`]); the supervisor itself only keeps a table
//! of slots, one per spec, and reacts to events:
//!
//! - task output and exits reported by the drivers,
//! - `Event::Shutdown` requests from the signal listener,
//! - the next delayed-start deadline,
//! - the next escalation deadline while shutting down.
//!
//! Shutdown is staged per process: SIGINT, then SIGTERM once `sigint_ms`
//! elapsed, then a forced kill once `sigterm_ms` elapsed. A stage with a zero
//! timeout is skipped.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::events::{Event, ProcessSignal};
use crate::output::{OutputPrinter, StreamKind};
use crate::process::{ExitInfo, ProcessSpec, TaskStatus};
use crate::runner::{drive, Control, Launcher};

pub const DEFAULT_SHUTDOWN_SIGINT_MS: u64 = 800;
pub const DEFAULT_SHUTDOWN_SIGTERM_MS: u64 = 800;

/// Grace periods for the staged shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownConfig {
    sigint_ms: u64,
    sigterm_ms: u64,
}

impl ShutdownConfig {
    pub fn new(sigint_ms: u64, sigterm_ms: u64) -> Self {
        Self {
            sigint_ms,
            sigterm_ms,
        }
    }

    fn sigint_timeout(&self) -> Duration {
        Duration::from_millis(self.sigint_ms)
    }

    fn sigterm_timeout(&self) -> Duration {
        Duration::from_millis(self.sigterm_ms)
    }

    fn sigint_enabled(&self) -> bool {
        self.sigint_ms > 0
    }

    fn sigterm_enabled(&self) -> bool {
        self.sigterm_ms > 0
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self::new(DEFAULT_SHUTDOWN_SIGINT_MS, DEFAULT_SHUTDOWN_SIGTERM_MS)
    }
}

/// Why `run_all` returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisionOutcome {
    /// Every task exited on its own.
    Completed,
    /// A shutdown was requested from outside.
    Interrupted,
    /// A fatal task failed, a required task could not be started, or no
    /// task could be started at all.
    Failed { id: String, exit: ExitInfo },
}

/// Final status of one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReport {
    pub id: String,
    pub status: TaskStatus,
}

/// Result of one `run_all` call; tasks are listed in spec order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisionReport {
    pub outcome: SupervisionOutcome,
    pub tasks: Vec<TaskReport>,
}

#[cfg(test)]
impl SupervisionReport {
    pub fn status(&self, id: &str) -> Option<&TaskStatus> {
        self.tasks
            .iter()
            .find(|task| task.id == id)
            .map(|task| &task.status)
    }
}

#[derive(Debug, Clone, Copy)]
enum ShutdownStage {
    SigInt,
    SigTerm,
}

#[derive(Debug, Clone, Copy)]
struct ShutdownState {
    stage: ShutdownStage,
    deadline: Instant,
}

struct TaskSlot<'a> {
    spec: &'a ProcessSpec,
    status: TaskStatus,
    control: Option<mpsc::UnboundedSender<Control>>,
    /// Pending start time of a delayed task.
    start_at: Option<Instant>,
    shutdown: Option<ShutdownState>,
    killed: bool,
}

impl TaskSlot<'_> {
    fn send(&self, command: Control) {
        if let Some(control) = &self.control {
            // The driver may already be gone; its exit event is in flight.
            let _ = control.send(command);
        }
    }
}

/// State owned by a single `run_all` call.
struct SupervisionState<'a> {
    slots: Vec<TaskSlot<'a>>,
    shutting_down: bool,
    /// Set once any task got past its spawn.
    any_started: bool,
    outcome: Option<SupervisionOutcome>,
}

impl<'a> SupervisionState<'a> {
    fn new(specs: &'a [ProcessSpec], started: Instant) -> Self {
        let slots = specs
            .iter()
            .map(|spec| TaskSlot {
                spec,
                status: TaskStatus::NotStarted,
                control: None,
                start_at: spec.start_delay().map(|delay| started + delay),
                shutdown: None,
                killed: false,
            })
            .collect();
        Self {
            slots,
            shutting_down: false,
            any_started: false,
            outcome: None,
        }
    }

    /// The first terminal cause wins.
    fn settle(&mut self, outcome: SupervisionOutcome) {
        if self.outcome.is_none() {
            self.outcome = Some(outcome);
        }
    }

    fn finished(&self) -> bool {
        self.slots.iter().all(|slot| match &slot.status {
            TaskStatus::NotStarted => self.shutting_down || slot.start_at.is_none(),
            status => status.is_terminal(),
        })
    }

    fn next_start(&self) -> Option<Instant> {
        if self.shutting_down {
            return None;
        }
        self.slots.iter().filter_map(|slot| slot.start_at).min()
    }

    fn next_escalation(&self) -> Option<Instant> {
        self.slots
            .iter()
            .filter_map(|slot| slot.shutdown.map(|state| state.deadline))
            .min()
    }

    fn into_report(self) -> SupervisionReport {
        let outcome = match self.outcome {
            Some(outcome) => outcome,
            None if !self.any_started => {
                let attempted = self
                    .slots
                    .iter()
                    .filter(|slot| !matches!(slot.status, TaskStatus::NotStarted));
                all_failed_to_spawn(attempted).unwrap_or(SupervisionOutcome::Completed)
            }
            None => SupervisionOutcome::Completed,
        };
        SupervisionReport {
            outcome,
            tasks: self
                .slots
                .into_iter()
                .map(|slot| TaskReport {
                    id: slot.spec.id.clone(),
                    status: slot.status,
                })
                .collect(),
        }
    }
}

/// Runs a group of tasks and owns their shutdown protocol.
pub struct Supervisor {
    launcher: Arc<dyn Launcher>,
    shutdown: ShutdownConfig,
    events_tx: mpsc::Sender<Event>,
    events_rx: mpsc::Receiver<Event>,
    output: Option<OutputPrinter>,
}

impl Supervisor {
    pub fn new(launcher: Arc<dyn Launcher>, shutdown: ShutdownConfig) -> Self {
        let (events_tx, events_rx) = mpsc::channel(256);
        Self {
            launcher,
            shutdown,
            events_tx,
            events_rx,
            output: None,
        }
    }

    /// Print task output through `printer`; without one, output is logged at debug level.
    pub fn with_output(mut self, printer: OutputPrinter) -> Self {
        self.output = Some(printer);
        self
    }

    /// Sender for injecting `Event::Shutdown` requests.
    pub fn event_sender(&self) -> mpsc::Sender<Event> {
        self.events_tx.clone()
    }

    /// Runs `specs` until they all exit, a shutdown is requested, or a fatal
    /// task fails. Every started process has exited when this returns.
    pub async fn run_all(&mut self, specs: &[ProcessSpec]) -> SupervisionReport {
        let mut state = SupervisionState::new(specs, Instant::now());
        info!(tasks = specs.len(), "starting supervision");

        for id in 0..state.slots.len() {
            if state.shutting_down {
                break;
            }
            if state.slots[id].start_at.is_none() {
                self.launch(&mut state, id);
            }
        }

        if !state.shutting_down {
            let immediate = state.slots.iter().filter(|slot| slot.spec.start_delay().is_none());
            if let Some(outcome) = all_failed_to_spawn(immediate) {
                error!("no task could be started; stopping");
                state.settle(outcome);
                self.begin_shutdown(&mut state, ProcessSignal::SigInt);
            }
        }

        while !state.finished() {
            let next_start = state.next_start();
            let next_escalation = state.next_escalation();
            tokio::select! {
                Some(event) = self.events_rx.recv() => self.handle_event(&mut state, event),
                _ = sleep_until_opt(next_start) => self.launch_due(&mut state),
                _ = sleep_until_opt(next_escalation) => self.escalate_due(&mut state),
            }
        }

        self.flush_output(&state);
        let report = state.into_report();
        info!(outcome = ?report.outcome, "supervision finished");
        report
    }

    fn launch(&self, state: &mut SupervisionState<'_>, id: usize) {
        let spec = state.slots[id].spec;
        match self.launcher.launch(id, spec, self.events_tx.clone()) {
            Ok(handle) => {
                let pid = handle.pid();
                let (control_tx, control_rx) = mpsc::unbounded_channel();
                tokio::spawn(drive(id, handle, control_rx, self.events_tx.clone()));
                state.any_started = true;
                let slot = &mut state.slots[id];
                slot.control = Some(control_tx);
                slot.status = TaskStatus::Running { pid };
                info!(task = %spec.id, pid, cmd = %spec.command, "task started");
            }
            Err(err) => {
                state.slots[id].status = TaskStatus::SpawnFailed {
                    error: err.to_string(),
                };
                if spec.required {
                    error!(task = %spec.id, error = %err, "required task failed to start; stopping all tasks");
                    state.settle(SupervisionOutcome::Failed {
                        id: spec.id.clone(),
                        exit: ExitInfo::Error(err.to_string()),
                    });
                    self.begin_shutdown(state, ProcessSignal::SigInt);
                } else {
                    warn!(task = %spec.id, error = %err, "task failed to start; continuing without it");
                }
            }
        }
    }

    fn launch_due(&self, state: &mut SupervisionState<'_>) {
        let now = Instant::now();
        for id in 0..state.slots.len() {
            if state.shutting_down {
                return;
            }
            let due = state.slots[id].start_at.is_some_and(|at| at <= now);
            if due {
                state.slots[id].start_at = None;
                debug!(task = %state.slots[id].spec.id, "delay elapsed");
                self.launch(state, id);
            }
        }
    }

    fn handle_event(&self, state: &mut SupervisionState<'_>, event: Event) {
        match event {
            Event::TaskOutput { id, line, stream } => self.print(state, id, &line, stream),
            Event::TaskExited { id, exit } => self.on_exit(state, id, exit),
            Event::Shutdown { signal } => {
                if state.shutting_down {
                    warn!(signal = signal.label(), "shutdown requested again; killing remaining tasks");
                    self.kill_remaining(state);
                    return;
                }
                info!(signal = signal.label(), "shutdown requested");
                state.settle(SupervisionOutcome::Interrupted);
                self.begin_shutdown(state, signal);
            }
        }
    }

    fn on_exit(&self, state: &mut SupervisionState<'_>, id: usize, exit: ExitInfo) {
        let Some(slot) = state.slots.get_mut(id) else {
            return;
        };
        let spec = slot.spec;
        slot.control = None;
        slot.shutdown = None;
        slot.status = if slot.killed {
            TaskStatus::Killed
        } else {
            TaskStatus::Exited { code: exit.code() }
        };

        if state.shutting_down {
            info!(task = %spec.id, %exit, "task stopped");
            return;
        }
        if exit.success() {
            info!(task = %spec.id, "task finished");
            return;
        }
        if spec.fatal_on_failure {
            error!(task = %spec.id, %exit, "task failed; stopping all tasks");
            state.settle(SupervisionOutcome::Failed {
                id: spec.id.clone(),
                exit,
            });
            self.begin_shutdown(state, ProcessSignal::SigInt);
        } else {
            warn!(task = %spec.id, %exit, "task failed; other tasks keep running");
        }
    }

    fn begin_shutdown(&self, state: &mut SupervisionState<'_>, signal: ProcessSignal) {
        state.shutting_down = true;
        let now = Instant::now();
        for slot in state.slots.iter_mut() {
            match slot.status {
                TaskStatus::Running { .. } if slot.shutdown.is_none() && !slot.killed => {
                    match initial_shutdown_stage(self.shutdown, signal, now) {
                        Some((stage, signal, deadline)) => {
                            debug!(task = %slot.spec.id, signal = signal.label(), "requesting termination");
                            slot.shutdown = Some(ShutdownState { stage, deadline });
                            slot.send(Control::Signal(signal));
                        }
                        None => force_kill(slot, "no grace period configured"),
                    }
                }
                TaskStatus::NotStarted => {
                    if slot.start_at.take().is_some() {
                        debug!(task = %slot.spec.id, "delayed task cancelled before start");
                    }
                }
                _ => {}
            }
        }
    }

    fn escalate_due(&self, state: &mut SupervisionState<'_>) {
        let now = Instant::now();
        for slot in state.slots.iter_mut() {
            let Some(current) = slot.shutdown else {
                continue;
            };
            if now < current.deadline {
                continue;
            }
            match current.stage {
                ShutdownStage::SigInt if self.shutdown.sigterm_enabled() => {
                    info!(task = %slot.spec.id, "still running after SIGINT; sending SIGTERM");
                    slot.shutdown = Some(ShutdownState {
                        stage: ShutdownStage::SigTerm,
                        deadline: now + self.shutdown.sigterm_timeout(),
                    });
                    slot.send(Control::Signal(ProcessSignal::SigTerm));
                }
                ShutdownStage::SigInt | ShutdownStage::SigTerm => {
                    force_kill(slot, "did not exit within grace period");
                }
            }
        }
    }

    fn kill_remaining(&self, state: &mut SupervisionState<'_>) {
        for slot in state.slots.iter_mut() {
            if slot.status.is_running() && !slot.killed {
                force_kill(slot, "forced by repeated shutdown request");
            }
        }
    }

    fn print(&self, state: &SupervisionState<'_>, id: usize, line: &str, stream: StreamKind) {
        match &self.output {
            Some(printer) => printer.print_line(id, line, stream),
            None => {
                let task = state.slots.get(id).map(|slot| slot.spec.id.as_str()).unwrap_or("?");
                debug!(task, ?stream, "{}", line);
            }
        }
    }

    // Output lines can trail the exit event; print whatever is already queued.
    fn flush_output(&mut self, state: &SupervisionState<'_>) {
        while let Ok(event) = self.events_rx.try_recv() {
            if let Event::TaskOutput { id, line, stream } = event {
                self.print(state, id, &line, stream);
            }
        }
    }
}

/// The first spawn failure among `slots`, when every one of them failed to spawn.
fn all_failed_to_spawn<'s, 'a: 's>(
    slots: impl IntoIterator<Item = &'s TaskSlot<'a>>,
) -> Option<SupervisionOutcome> {
    let mut first = None;
    for slot in slots {
        match &slot.status {
            TaskStatus::SpawnFailed { error } => {
                first.get_or_insert_with(|| SupervisionOutcome::Failed {
                    id: slot.spec.id.clone(),
                    exit: ExitInfo::Error(error.clone()),
                });
            }
            _ => return None,
        }
    }
    first
}

fn force_kill(slot: &mut TaskSlot<'_>, reason: &str) {
    warn!(task = %slot.spec.id, reason, "killing task");
    slot.killed = true;
    slot.shutdown = None;
    slot.send(Control::Kill);
}

fn initial_shutdown_stage(
    shutdown: ShutdownConfig,
    initial: ProcessSignal,
    now: Instant,
) -> Option<(ShutdownStage, ProcessSignal, Instant)> {
    let sigint = (
        ShutdownStage::SigInt,
        ProcessSignal::SigInt,
        now + shutdown.sigint_timeout(),
    );
    let sigterm = (
        ShutdownStage::SigTerm,
        ProcessSignal::SigTerm,
        now + shutdown.sigterm_timeout(),
    );
    match initial {
        ProcessSignal::SigInt if shutdown.sigint_enabled() => Some(sigint),
        ProcessSignal::SigTerm if shutdown.sigterm_enabled() => Some(sigterm),
        _ if shutdown.sigterm_enabled() => Some(sigterm),
        _ if shutdown.sigint_enabled() => Some(sigint),
        _ => None,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
