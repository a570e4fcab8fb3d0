use std::time::Duration;

use llm_backend_types::WorkerIdentity;
use llm_backend_worker::SpawnError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("unknown instance {0}")]
    UnknownInstance(WorkerIdentity),

    #[error("instance {0} is not running")]
    NotRunning(WorkerIdentity),

    #[error("instance {id} failed: {message}")]
    WorkerFailure { id: WorkerIdentity, message: String },

    #[error("instance {id} failed to load: {message}")]
    LoadError { id: WorkerIdentity, message: String },

    #[error("instance {id} did not stop within {timeout:?}; worker was force-stopped")]
    ShutdownTimeout { id: WorkerIdentity, timeout: Duration },

    #[error("instance {id} did not answer within {timeout:?}")]
    Timeout { id: WorkerIdentity, timeout: Duration },

    #[error("instance {id} could not be started: {source}")]
    Spawn {
        id: WorkerIdentity,
        #[source]
        source: SpawnError,
    },
}

impl PoolError {
    pub(crate) fn worker_failure(id: &WorkerIdentity, message: impl Into<String>) -> Self {
        Self::WorkerFailure {
            id: id.clone(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("record store error: {0}")]
    Store(String),

    #[error("no record for instance {0}")]
    MissingRecord(String),
}
