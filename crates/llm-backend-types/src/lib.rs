//! Shared types for the LLM backend workspace.
//!
//! Everything here crosses a crate or process boundary: instance
//! configuration, worker identities and the worker IPC protocol.

pub mod config;
pub mod identity;
pub mod ipc_types;

pub use config::InstanceConfig;
pub use identity::WorkerIdentity;
pub use ipc_types::{WorkerCommand, WorkerPayload, WorkerRequest, WorkerResponse};
