//! IPC protocol types for pool ↔ worker communication.
//!
//! In-process workers exchange these values over channels directly; the
//! process strategy ships them as JSON Lines (one JSON object per line)
//! over the child's stdin/stdout pipes.

use serde::{Deserialize, Serialize};

use crate::config::InstanceConfig;

/// Request sent from the pool to a worker.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkerRequest {
    /// Monotonic request ID for correlating responses. 0 = control message.
    pub id: u64,
    pub command: WorkerCommand,
}

/// Commands the pool can send to a worker.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum WorkerCommand {
    /// Materialize the model. Only sent to worker processes, in-process
    /// units receive their config at construction.
    Load { config: InstanceConfig },
    /// Run one prompt through the loaded model.
    Generate { input: String },
    /// Graceful shutdown.
    Shutdown,
}

/// Response sent from a worker to the pool.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkerResponse {
    /// Matches the request ID. 0 for the load report.
    pub id: u64,
    pub payload: WorkerPayload,
}

/// Response payloads from a worker.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum WorkerPayload {
    /// Model loaded, worker is accepting requests.
    Loaded,
    /// Model could not be loaded; the worker exits after sending this.
    LoadFailed { message: String },
    /// Generation result.
    Output { text: String },
    /// The model call failed. The worker keeps serving.
    Failure { message: String },
}

impl WorkerRequest {
    pub fn generate(id: u64, input: impl Into<String>) -> Self {
        Self {
            id,
            command: WorkerCommand::Generate {
                input: input.into(),
            },
        }
    }

    pub fn shutdown() -> Self {
        Self {
            id: 0,
            command: WorkerCommand::Shutdown,
        }
    }
}

impl WorkerResponse {
    pub fn ok(id: u64, payload: WorkerPayload) -> Self {
        Self { id, payload }
    }

    pub fn failure(id: u64, message: impl Into<String>) -> Self {
        Self {
            id,
            payload: WorkerPayload::Failure {
                message: message.into(),
            },
        }
    }
}
