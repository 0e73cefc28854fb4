//! Fake processes for exercising the supervisor without spawning anything.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::errors::{DevrackError, Result};
use crate::events::{Event, ProcessSignal};
use crate::process::{ExitInfo, ProcessSpec};
use crate::runner::{Launcher, ProcessHandle};

/// How a fake process reacts once launched.
#[derive(Debug, Clone, Copy)]
pub enum Behaviour {
    /// Runs until it receives any signal or a kill.
    RunUntilSignalled,
    /// Only a kill stops it.
    IgnoreSignals,
    /// Exits with `code` after `after`, or earlier when signalled.
    ExitAfter { after: Duration, code: i32 },
    /// The launch itself fails.
    FailToSpawn,
}

/// Something the supervisor did to a fake process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Signal(ProcessSignal),
    Kill,
}

#[derive(Debug, Clone, Default)]
pub struct Journal {
    launches: Arc<Mutex<Vec<(String, Instant)>>>,
    actions: Arc<Mutex<Vec<(String, Action)>>>,
}

impl Journal {
    /// Ids of launched tasks, in launch order.
    pub fn launched(&self) -> Vec<String> {
        self.launches
            .lock()
            .unwrap()
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn launch_time(&self, id: &str) -> Option<Instant> {
        self.launches
            .lock()
            .unwrap()
            .iter()
            .find(|(launched, _)| launched == id)
            .map(|(_, at)| *at)
    }

    pub fn actions_for(&self, id: &str) -> Vec<Action> {
        self.actions
            .lock()
            .unwrap()
            .iter()
            .filter(|(target, _)| target == id)
            .map(|(_, action)| action.clone())
            .collect()
    }

    fn record(&self, id: &str, action: Action) {
        self.actions.lock().unwrap().push((id.to_string(), action));
    }
}

/// Launcher whose processes follow a scripted [`Behaviour`] per task id.
pub struct FakeLauncher {
    behaviours: HashMap<String, Behaviour>,
    journal: Journal,
}

impl FakeLauncher {
    /// Every task runs until signalled unless configured otherwise.
    pub fn new() -> Self {
        Self {
            behaviours: HashMap::new(),
            journal: Journal::default(),
        }
    }

    pub fn with(mut self, id: &str, behaviour: Behaviour) -> Self {
        self.behaviours.insert(id.to_string(), behaviour);
        self
    }

    pub fn journal(&self) -> Journal {
        self.journal.clone()
    }
}

impl Launcher for FakeLauncher {
    fn launch(
        &self,
        _id: usize,
        spec: &ProcessSpec,
        _events: mpsc::Sender<Event>,
    ) -> Result<Box<dyn ProcessHandle>> {
        let behaviour = self
            .behaviours
            .get(&spec.id)
            .copied()
            .unwrap_or(Behaviour::RunUntilSignalled);
        if let Behaviour::FailToSpawn = behaviour {
            return Err(DevrackError::Spawn {
                id: spec.id.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "fake binary missing"),
            });
        }
        self.journal
            .launches
            .lock()
            .unwrap()
            .push((spec.id.clone(), Instant::now()));

        let (exit_tx, exit_rx) = watch::channel(None);
        let exit_tx = Arc::new(exit_tx);
        if let Behaviour::ExitAfter { after, code } = behaviour {
            let exit_tx = exit_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                finish(&exit_tx, ExitInfo::Code(code));
            });
        }
        Ok(Box::new(FakeHandle {
            id: spec.id.clone(),
            behaviour,
            exit_tx,
            exit_rx,
            journal: self.journal.clone(),
        }))
    }
}

struct FakeHandle {
    id: String,
    behaviour: Behaviour,
    exit_tx: Arc<watch::Sender<Option<ExitInfo>>>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    journal: Journal,
}

fn finish(exit_tx: &watch::Sender<Option<ExitInfo>>, exit: ExitInfo) {
    exit_tx.send_if_modified(|current| {
        if current.is_some() {
            return false;
        }
        *current = Some(exit);
        true
    });
}

impl ProcessHandle for FakeHandle {
    fn pid(&self) -> Option<u32> {
        Some(4242)
    }

    fn signal(&mut self, signal: ProcessSignal) -> std::io::Result<()> {
        self.journal.record(&self.id, Action::Signal(signal));
        if !matches!(self.behaviour, Behaviour::IgnoreSignals) {
            finish(&self.exit_tx, ExitInfo::Signaled);
        }
        Ok(())
    }

    fn kill(&mut self) -> std::io::Result<()> {
        self.journal.record(&self.id, Action::Kill);
        finish(&self.exit_tx, ExitInfo::Signaled);
        Ok(())
    }

    fn wait(&mut self) -> Pin<Box<dyn Future<Output = std::io::Result<ExitInfo>> + Send + '_>> {
        Box::pin(async move {
            loop {
                let current = self.exit_rx.borrow_and_update().clone();
                if let Some(exit) = current {
                    return Ok(exit);
                }
                if self.exit_rx.changed().await.is_err() {
                    return Ok(ExitInfo::Signaled);
                }
            }
        })
    }
}
