//! LLM backend: a pool of model workers plus the controller that keeps it in
//! step with the persisted instance records.

pub mod controller;
pub mod error;
pub mod logging;
pub mod pool;

pub use controller::{BackendController, CacheEntry};
pub use error::{ControllerError, PoolError};
pub use pool::{Pool, PoolSettings};

use llm_backend_config::{BackendSettings, StrategyKind};
use llm_backend_worker::{ExecutionStrategy, ProcessOptions};

/// Build the execution strategy selected in `settings`. Process workers
/// re-run the current executable with `--worker`.
pub fn build_strategy(settings: &BackendSettings) -> std::io::Result<ExecutionStrategy> {
    match settings.strategy {
        StrategyKind::Thread => Ok(ExecutionStrategy::thread()),
        StrategyKind::Process => Ok(ExecutionStrategy::process(ProcessOptions::current_exe()?)),
        StrategyKind::Cooperative => ExecutionStrategy::cooperative(),
    }
}
