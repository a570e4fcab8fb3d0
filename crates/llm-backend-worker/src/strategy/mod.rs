//! Execution strategies: where a worker unit runs.
//!
//! The pool only ever talks to [`ExecutionStrategy`] and the opaque
//! [`ExecutionHandle`] it returns: spawn, signal stop, join with a timeout,
//! plus a liveness check and a forced stop used after a join timeout.

mod cooperative;
mod process;
mod thread;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::unit::WorkerUnit;

pub use cooperative::{CooperativeHandle, CooperativeScheduler};
pub use process::{ProcessHandle, ProcessOptions};
pub use thread::ThreadHandle;

/// Granularity of join/liveness polling.
pub(crate) const JOIN_POLL_STEP: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("failed to spawn worker: {0}")]
    Io(#[from] std::io::Error),
    #[error("cooperative scheduler is not running")]
    SchedulerStopped,
    #[error("failed to send load command to worker process: {0}")]
    Handshake(String),
}

#[derive(Clone, Debug)]
pub enum ExecutionStrategy {
    /// One OS thread per worker. Cheap, shares memory with the pool.
    Thread,
    /// One child process per worker. Survives crashing model calls.
    Process(ProcessOptions),
    /// All workers interleave on one scheduler thread. Model calls never run
    /// in parallel under this strategy; a long call stalls every other
    /// cooperative worker until it returns.
    Cooperative(Arc<CooperativeScheduler>),
}

impl ExecutionStrategy {
    pub fn thread() -> Self {
        Self::Thread
    }

    pub fn process(options: ProcessOptions) -> Self {
        Self::Process(options)
    }

    /// Start a dedicated cooperative scheduler.
    pub fn cooperative() -> std::io::Result<Self> {
        Ok(Self::Cooperative(Arc::new(CooperativeScheduler::start()?)))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Thread => "thread",
            Self::Process(_) => "process",
            Self::Cooperative(_) => "cooperative",
        }
    }

    pub fn spawn(&self, unit: WorkerUnit) -> Result<ExecutionHandle, SpawnError> {
        match self {
            Self::Thread => Ok(ExecutionHandle::Thread(thread::spawn(unit)?)),
            Self::Process(options) => Ok(ExecutionHandle::Process(process::spawn(unit, options)?)),
            Self::Cooperative(scheduler) => {
                Ok(ExecutionHandle::Cooperative(scheduler.spawn(unit)?))
            }
        }
    }

    /// Ask the worker to stop after its current request.
    pub fn signal_stop(&self, handle: &ExecutionHandle) {
        handle.signal_stop();
    }

    /// Wait up to `timeout` for the worker to terminate. `true` if it did.
    pub fn join(&self, handle: &mut ExecutionHandle, timeout: Duration) -> bool {
        handle.join(timeout)
    }

    pub fn is_alive(&self, handle: &mut ExecutionHandle) -> bool {
        handle.is_alive()
    }

    /// Escalation after a join timeout. Kills worker processes; in-process
    /// workers cannot be preempted and are detached instead.
    pub fn force_stop(&self, handle: &mut ExecutionHandle) {
        handle.force_stop();
    }
}

/// Live execution context of one worker.
#[derive(Debug)]
pub enum ExecutionHandle {
    Thread(ThreadHandle),
    Process(ProcessHandle),
    Cooperative(CooperativeHandle),
}

impl ExecutionHandle {
    /// OS process id; `None` for in-process workers.
    pub fn pid(&self) -> Option<u32> {
        match self {
            Self::Process(h) => h.pid(),
            Self::Thread(_) | Self::Cooperative(_) => None,
        }
    }

    fn signal_stop(&self) {
        match self {
            Self::Thread(h) => h.signal_stop(),
            Self::Process(h) => h.signal_stop(),
            Self::Cooperative(h) => h.signal_stop(),
        }
    }

    fn join(&mut self, timeout: Duration) -> bool {
        match self {
            Self::Thread(h) => h.join(timeout),
            Self::Process(h) => h.join(timeout),
            Self::Cooperative(h) => h.join(timeout),
        }
    }

    fn is_alive(&mut self) -> bool {
        match self {
            Self::Thread(h) => h.is_alive(),
            Self::Process(h) => h.is_alive(),
            Self::Cooperative(h) => h.is_alive(),
        }
    }

    fn force_stop(&mut self) {
        match self {
            Self::Thread(h) => h.force_stop(),
            Self::Process(h) => h.force_stop(),
            Self::Cooperative(h) => h.force_stop(),
        }
    }
}

/// Poll `done` until it reports true or `timeout` elapses.
pub(crate) fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        if done() {
            return true;
        }
        let now = std::time::Instant::now();
        if now >= deadline {
            return false;
        }
        std::thread::sleep(JOIN_POLL_STEP.min(deadline - now));
    }
}
