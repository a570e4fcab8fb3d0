//! Cooperative strategy: every worker is a local task on one scheduler
//! thread running a single-threaded tokio runtime.
//!
//! Only one task runs at a time. Workers interleave between requests, but a
//! model call (and a model load) occupies the whole scheduler until it
//! returns, so two cooperative workers never generate concurrently. This is
//! the low-throughput fallback for hosts where one thread per model is not
//! acceptable.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tokio::sync::mpsc;

use super::{wait_until, SpawnError};
use crate::signal::ShutdownSignal;
use crate::unit::WorkerUnit;

struct Job {
    unit: WorkerUnit,
    finished: Arc<AtomicBool>,
}

/// Marks a cooperative worker finished when its task ends, including when
/// the task is dropped or unwinds.
struct FinishedGuard(Arc<AtomicBool>);

impl Drop for FinishedGuard {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

pub struct CooperativeScheduler {
    jobs: mpsc::UnboundedSender<Job>,
}

impl CooperativeScheduler {
    /// Start the scheduler thread. It runs until the scheduler is dropped.
    pub fn start() -> std::io::Result<Self> {
        let (jobs, rx) = mpsc::unbounded_channel::<Job>();
        thread::Builder::new()
            .name("llm-cooperative".to_string())
            .spawn(move || run_scheduler(rx))?;
        Ok(Self { jobs })
    }

    pub(super) fn spawn(&self, unit: WorkerUnit) -> Result<CooperativeHandle, SpawnError> {
        let finished = Arc::new(AtomicBool::new(false));
        let shutdown = unit.shutdown_signal().clone();
        self.jobs
            .send(Job {
                unit,
                finished: finished.clone(),
            })
            .map_err(|_| SpawnError::SchedulerStopped)?;

        Ok(CooperativeHandle { shutdown, finished })
    }
}

impl std::fmt::Debug for CooperativeScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CooperativeScheduler")
            .field("running", &!self.jobs.is_closed())
            .finish()
    }
}

fn run_scheduler(mut rx: mpsc::UnboundedReceiver<Job>) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("Failed to start cooperative scheduler: {e}");
            return;
        }
    };

    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, async move {
        while let Some(job) = rx.recv().await {
            tokio::task::spawn_local(async move {
                let _finished = FinishedGuard(job.finished);
                job.unit.run_cooperative().await;
            });
        }
    });
    log::debug!("Cooperative scheduler exiting");
}

#[derive(Debug)]
pub struct CooperativeHandle {
    shutdown: ShutdownSignal,
    finished: Arc<AtomicBool>,
}

impl CooperativeHandle {
    pub(super) fn signal_stop(&self) {
        self.shutdown.set();
    }

    pub(super) fn join(&mut self, timeout: Duration) -> bool {
        wait_until(timeout, || self.finished.load(Ordering::SeqCst))
    }

    pub(super) fn is_alive(&self) -> bool {
        !self.finished.load(Ordering::SeqCst)
    }

    pub(super) fn force_stop(&mut self) {
        self.shutdown.set();
        if self.is_alive() {
            log::warn!("Cooperative worker is busy; it exits after its current model call");
        }
    }
}
