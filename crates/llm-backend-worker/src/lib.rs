//! Model workers and the execution strategies that host them.
//!
//! A worker unit owns exactly one loaded model and serves one request at a
//! time. Execution strategies decide where the unit runs:
//! - Thread: a dedicated OS thread per worker, shared memory
//! - Process: a child process per worker, JSON Lines over stdin/stdout
//! - Cooperative: one scheduler thread, workers interleave as local tasks

pub mod model;
pub mod signal;
pub mod strategy;
pub mod unit;
pub mod worker_main;

pub use model::{EchoModel, InferenceError, LanguageModel, LoadError, ModelLoader, ModelRegistry};
pub use signal::ShutdownSignal;
pub use strategy::{
    CooperativeScheduler, ExecutionHandle, ExecutionStrategy, ProcessOptions, SpawnError,
};
pub use unit::{channels, UnitChannels, WorkerEndpoint, WorkerUnit};
