//! Thread strategy: one named OS thread per worker.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::wait_until;
use crate::signal::ShutdownSignal;
use crate::unit::WorkerUnit;

#[derive(Debug)]
pub struct ThreadHandle {
    join: Option<JoinHandle<()>>,
    shutdown: ShutdownSignal,
}

pub(super) fn spawn(unit: WorkerUnit) -> std::io::Result<ThreadHandle> {
    let shutdown = unit.shutdown_signal().clone();
    let join = thread::Builder::new()
        .name(format!("llm-worker-{}", unit.label()))
        .spawn(move || unit.run())?;

    Ok(ThreadHandle {
        join: Some(join),
        shutdown,
    })
}

impl ThreadHandle {
    pub(super) fn signal_stop(&self) {
        self.shutdown.set();
    }

    pub(super) fn join(&mut self, timeout: Duration) -> bool {
        let Some(join) = self.join.as_ref() else {
            return true;
        };
        if !wait_until(timeout, || join.is_finished()) {
            return false;
        }
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                log::warn!("Worker thread panicked outside of a model call");
            }
        }
        true
    }

    pub(super) fn is_alive(&self) -> bool {
        self.join.as_ref().is_some_and(|join| !join.is_finished())
    }

    pub(super) fn force_stop(&mut self) {
        self.shutdown.set();
        if let Some(join) = self.join.take() {
            if !join.is_finished() {
                log::warn!(
                    "Detaching worker thread {:?}; it exits after its current model call",
                    join.thread().name()
                );
            }
        }
    }
}
