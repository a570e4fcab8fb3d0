//! Worker unit: one loaded model, one request at a time.
//!
//! The pool keeps a [`WorkerEndpoint`] (request sender, response receiver);
//! the unit owns the opposite ends and never holds a reference back to the
//! pool. On startup the unit reports `Loaded` or `LoadFailed` (id 0), then
//! serves `Generate` requests until its shutdown signal is observed or the
//! request channel disconnects.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use llm_backend_types::{InstanceConfig, WorkerCommand, WorkerPayload, WorkerRequest, WorkerResponse};

use crate::model::{LanguageModel, ModelLoader};
use crate::signal::ShutdownSignal;

/// Default bound on how long a worker waits for input before re-checking
/// its shutdown signal.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Poll step of cooperative workers. Short, since every idle worker wakes up
/// on the shared scheduler thread.
const COOPERATIVE_TICK: Duration = Duration::from_millis(5);

/// Pool-side ends of a worker's channels.
#[derive(Debug)]
pub struct WorkerEndpoint {
    pub requests: Sender<WorkerRequest>,
    pub responses: Receiver<WorkerResponse>,
}

/// Worker-side ends of a worker's channels.
#[derive(Debug)]
pub struct UnitChannels {
    pub requests: Receiver<WorkerRequest>,
    pub responses: Sender<WorkerResponse>,
}

/// Allocate a fresh, unbounded channel pair for one worker.
pub fn channels() -> (WorkerEndpoint, UnitChannels) {
    let (request_tx, request_rx) = crossbeam_channel::unbounded();
    let (response_tx, response_rx) = crossbeam_channel::unbounded();
    (
        WorkerEndpoint {
            requests: request_tx,
            responses: response_rx,
        },
        UnitChannels {
            requests: request_rx,
            responses: response_tx,
        },
    )
}

pub struct WorkerUnit {
    label: String,
    config: InstanceConfig,
    loader: Arc<dyn ModelLoader>,
    channels: UnitChannels,
    shutdown: ShutdownSignal,
    poll_interval: Duration,
}

impl WorkerUnit {
    pub fn new(
        label: impl Into<String>,
        config: InstanceConfig,
        loader: Arc<dyn ModelLoader>,
        channels: UnitChannels,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            label: label.into(),
            config,
            loader,
            channels,
            shutdown,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn shutdown_signal(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Split into the parts a process worker forwards across the boundary.
    pub(crate) fn into_parts(self) -> (String, InstanceConfig, UnitChannels, ShutdownSignal) {
        (self.label, self.config, self.channels, self.shutdown)
    }

    /// Blocking request loop. Returns when the worker stops.
    pub fn run(self) {
        let Some(mut model) = self.load_model() else {
            return;
        };

        loop {
            if self.shutdown.is_set() {
                break;
            }
            match self.channels.requests.recv_timeout(self.poll_interval) {
                Ok(request) => {
                    if !self.handle(model.as_mut(), request) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        log::debug!("Worker {} stopped", self.label);
    }

    /// Cooperative request loop for the single-threaded scheduler.
    ///
    /// Never blocks on the queue; yields to the other workers between polls.
    /// Loading and every model call still run inline on the scheduler thread.
    pub async fn run_cooperative(self) {
        let Some(mut model) = self.load_model() else {
            return;
        };

        loop {
            if self.shutdown.is_set() {
                break;
            }
            match self.channels.requests.try_recv() {
                Ok(request) => {
                    if !self.handle(model.as_mut(), request) {
                        break;
                    }
                    tokio::task::yield_now().await;
                }
                Err(TryRecvError::Empty) => {
                    tokio::time::sleep(COOPERATIVE_TICK.min(self.poll_interval)).await;
                }
                Err(TryRecvError::Disconnected) => break,
            }
        }

        log::debug!("Cooperative worker {} stopped", self.label);
    }

    fn load_model(&self) -> Option<Box<dyn LanguageModel>> {
        log::info!("Worker {} loading {}", self.label, self.config.describe());

        let result = catch_unwind(AssertUnwindSafe(|| self.loader.load(&self.config)));
        let (model, payload) = match result {
            Ok(Ok(model)) => (Some(model), WorkerPayload::Loaded),
            Ok(Err(e)) => (None, WorkerPayload::LoadFailed { message: e.to_string() }),
            Err(panic) => (
                None,
                WorkerPayload::LoadFailed {
                    message: format!("loader panicked: {}", panic_message(panic.as_ref())),
                },
            ),
        };

        if let WorkerPayload::LoadFailed { message } = &payload {
            log::warn!("Worker {} failed to load: {message}", self.label);
        }
        // Nobody listening means the pool gave up on this worker.
        if self.channels.responses.send(WorkerResponse::ok(0, payload)).is_err() {
            return None;
        }
        model
    }

    /// Handle one request. Returns `false` when the loop should stop.
    fn handle(&self, model: &mut dyn LanguageModel, request: WorkerRequest) -> bool {
        let response = match request.command {
            WorkerCommand::Generate { input } => WorkerResponse::ok(request.id, invoke(model, &input)),
            WorkerCommand::Shutdown => {
                self.shutdown.set();
                return false;
            }
            WorkerCommand::Load { .. } => {
                WorkerResponse::failure(request.id, "worker already has a model loaded")
            }
        };
        self.channels.responses.send(response).is_ok()
    }
}

impl std::fmt::Debug for WorkerUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerUnit")
            .field("label", &self.label)
            .field("config", &self.config)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

/// Run one model call, turning errors and panics into a `Failure` payload.
fn invoke(model: &mut dyn LanguageModel, input: &str) -> WorkerPayload {
    match catch_unwind(AssertUnwindSafe(|| model.infer(input))) {
        Ok(Ok(text)) => WorkerPayload::Output { text },
        Ok(Err(e)) => WorkerPayload::Failure { message: e.to_string() },
        Err(panic) => WorkerPayload::Failure {
            message: format!("model call panicked: {}", panic_message(panic.as_ref())),
        },
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
