//! Instance worker pool.
//!
//! The registry maps worker identities to slots. It is locked only for
//! lookups and insertions; every slot carries its own lifecycle lock
//! (load/unload/reset/remove) and state, so loading, joining or generating on
//! one worker never blocks another.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, TryLockError,
};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use llm_backend_config::BackendSettings;
use llm_backend_types::{InstanceConfig, WorkerIdentity, WorkerPayload, WorkerRequest, WorkerResponse};
use llm_backend_worker::{
    channels, ExecutionHandle, ExecutionStrategy, ModelLoader, ModelRegistry, ShutdownSignal,
    WorkerUnit,
};

use crate::error::PoolError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolSettings {
    /// Worker input poll bound; also the pool's health-check interval.
    pub poll_interval: Duration,
    /// How long `unload` waits before force-stopping a worker.
    pub join_timeout: Duration,
    /// How long `load` waits for the worker's load report.
    pub load_timeout: Duration,
    /// Default bound for `generate`. `None` waits while the worker lives.
    pub generate_timeout: Option<Duration>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            join_timeout: Duration::from_secs(5),
            load_timeout: Duration::from_secs(120),
            generate_timeout: None,
        }
    }
}

impl From<&BackendSettings> for PoolSettings {
    fn from(settings: &BackendSettings) -> Self {
        Self {
            poll_interval: settings.poll_interval(),
            join_timeout: settings.join_timeout(),
            load_timeout: settings.load_timeout(),
            generate_timeout: settings.generate_timeout(),
        }
    }
}

/// Pool-side state of a started worker.
struct LiveWorker {
    requests: Sender<WorkerRequest>,
    /// Held for the whole request/response exchange; serializes requests to
    /// this worker.
    responses: Mutex<Receiver<WorkerResponse>>,
    shutdown: ShutdownSignal,
    handle: Mutex<ExecutionHandle>,
    /// Id 0 is the load report.
    next_request_id: AtomicU64,
}

impl LiveWorker {
    /// A handle locked by a concurrent unload counts as alive; the unload
    /// decides its fate.
    fn is_alive(&self, strategy: &ExecutionStrategy) -> bool {
        match self.handle.try_lock() {
            Ok(mut handle) => strategy.is_alive(&mut handle),
            Err(TryLockError::Poisoned(poisoned)) => strategy.is_alive(&mut poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => true,
        }
    }

    fn pid(&self) -> Option<u32> {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pid()
    }
}

struct SlotState {
    config: InstanceConfig,
    /// `Some` from a successful load until unload, or until a worker that
    /// died on its own is reaped.
    live: Option<Arc<LiveWorker>>,
    /// Set by `remove`; a retired slot is no longer reachable from the
    /// registry and must not start again.
    retired: bool,
}

struct WorkerSlot {
    lifecycle: Mutex<()>,
    state: RwLock<SlotState>,
}

impl WorkerSlot {
    fn new(config: InstanceConfig) -> Self {
        Self {
            lifecycle: Mutex::new(()),
            state: RwLock::new(SlotState {
                config,
                live: None,
                retired: false,
            }),
        }
    }

    fn lock_lifecycle(&self) -> MutexGuard<'_, ()> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> RwLockReadGuard<'_, SlotState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn state_mut(&self) -> RwLockWriteGuard<'_, SlotState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn live(&self) -> Option<Arc<LiveWorker>> {
        self.state().live.clone()
    }

    fn has_worker(&self) -> bool {
        self.state().live.is_some()
    }
}

pub struct Pool {
    strategy: ExecutionStrategy,
    loader: Arc<dyn ModelLoader>,
    settings: PoolSettings,
    workers: RwLock<HashMap<WorkerIdentity, Arc<WorkerSlot>>>,
}

impl Pool {
    pub fn new(strategy: ExecutionStrategy, loader: Arc<dyn ModelLoader>, settings: PoolSettings) -> Self {
        log::info!("Creating {} worker pool", strategy.name());
        Self {
            strategy,
            loader,
            settings,
            workers: RwLock::new(HashMap::new()),
        }
    }

    /// Pool over the built-in model registry.
    pub fn builtin(strategy: ExecutionStrategy, settings: PoolSettings) -> Self {
        Self::new(strategy, Arc::new(ModelRegistry::builtin()), settings)
    }

    pub fn strategy(&self) -> &ExecutionStrategy {
        &self.strategy
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    fn registry(&self) -> RwLockReadGuard<'_, HashMap<WorkerIdentity, Arc<WorkerSlot>>> {
        self.workers.read().expect("Worker registry lock poisoned")
    }

    fn registry_mut(&self) -> RwLockWriteGuard<'_, HashMap<WorkerIdentity, Arc<WorkerSlot>>> {
        self.workers.write().expect("Worker registry lock poisoned")
    }

    fn slot(&self, id: &WorkerIdentity) -> Result<Arc<WorkerSlot>, PoolError> {
        self.registry()
            .get(id)
            .cloned()
            .ok_or_else(|| PoolError::UnknownInstance(id.clone()))
    }

    /// Register `config` under `id` (or a fresh identity). An existing
    /// identity with a different config is reset; an equal config is a no-op.
    /// Never starts a worker.
    pub fn prepare(
        &self,
        config: InstanceConfig,
        id: Option<WorkerIdentity>,
    ) -> Result<WorkerIdentity, PoolError> {
        let id = id.unwrap_or_else(WorkerIdentity::generate);
        loop {
            let existing = match self.registry_mut().entry(id.clone()) {
                Entry::Occupied(entry) => entry.get().clone(),
                Entry::Vacant(entry) => {
                    entry.insert(Arc::new(WorkerSlot::new(config)));
                    log::info!("Prepared instance {id}");
                    return Ok(id);
                }
            };

            let _lifecycle = existing.lock_lifecycle();
            if existing.state().retired {
                // Removed between lookup and lock; register anew.
                continue;
            }
            self.reset_locked(&id, &existing, config)?;
            return Ok(id);
        }
    }

    /// Start the worker for `id` and wait for its model to load. Returns
    /// `true` when this call started the worker, `false` if it was already
    /// running.
    pub fn load(&self, id: &WorkerIdentity) -> Result<bool, PoolError> {
        let slot = self.slot(id)?;
        let _lifecycle = slot.lock_lifecycle();

        let (config, dead) = {
            let state = slot.state();
            if state.retired {
                return Err(PoolError::UnknownInstance(id.clone()));
            }
            let dead = match &state.live {
                Some(live) if live.is_alive(&self.strategy) => return Ok(false),
                Some(live) => Some(live.clone()),
                None => None,
            };
            (state.config.clone(), dead)
        };
        if let Some(dead) = dead {
            self.reap_locked(id, &slot, &dead);
        }

        log::info!("Loading instance {id} ({})", config.describe());
        let (endpoint, unit_channels) = channels();
        let shutdown = ShutdownSignal::new();
        let unit = WorkerUnit::new(
            id.to_string(),
            config,
            self.loader.clone(),
            unit_channels,
            shutdown.clone(),
        )
        .with_poll_interval(self.settings.poll_interval);

        let mut handle = self.strategy.spawn(unit).map_err(|source| PoolError::Spawn {
            id: id.clone(),
            source,
        })?;

        if let Err(message) = self.await_load_report(id, &endpoint.responses, &mut handle) {
            log::warn!("Instance {id} failed to load: {message}");
            self.strategy.signal_stop(&handle);
            if !self.strategy.join(&mut handle, self.settings.join_timeout) {
                self.strategy.force_stop(&mut handle);
            }
            return Err(PoolError::LoadError {
                id: id.clone(),
                message,
            });
        }

        match handle.pid() {
            Some(pid) => log::info!("Instance {id} is running (pid {pid})"),
            None => log::info!("Instance {id} is running"),
        }
        slot.state_mut().live = Some(Arc::new(LiveWorker {
            requests: endpoint.requests,
            responses: Mutex::new(endpoint.responses),
            shutdown,
            handle: Mutex::new(handle),
            next_request_id: AtomicU64::new(1),
        }));
        Ok(true)
    }

    fn await_load_report(
        &self,
        id: &WorkerIdentity,
        responses: &Receiver<WorkerResponse>,
        handle: &mut ExecutionHandle,
    ) -> Result<(), String> {
        let deadline = Instant::now() + self.settings.load_timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(format!(
                    "no load report within {:?}",
                    self.settings.load_timeout
                ));
            }
            match responses.recv_timeout((deadline - now).min(self.settings.poll_interval)) {
                Ok(WorkerResponse {
                    payload: WorkerPayload::Loaded,
                    ..
                }) => return Ok(()),
                Ok(WorkerResponse {
                    payload: WorkerPayload::LoadFailed { message },
                    ..
                }) => return Err(message),
                Ok(other) => log::warn!("Unexpected response from {id} while loading: {other:?}"),
                Err(RecvTimeoutError::Timeout) => {
                    if !self.strategy.is_alive(handle) {
                        return Err("worker exited before reporting load".to_string());
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err("worker exited before reporting load".to_string());
                }
            }
        }
    }

    /// Clear a worker that terminated on its own (crash, kill). Caller holds
    /// the slot's lifecycle lock. No-op if `dead` was already replaced.
    fn reap_locked(&self, id: &WorkerIdentity, slot: &WorkerSlot, dead: &Arc<LiveWorker>) {
        let current = slot.live();
        if !current.is_some_and(|live| Arc::ptr_eq(&live, dead)) {
            return;
        }

        log::warn!("Worker for instance {id} terminated unexpectedly; reaping it");
        dead.shutdown.set();
        {
            let mut handle = dead.handle.lock().unwrap_or_else(PoisonError::into_inner);
            if !self.strategy.join(&mut handle, self.settings.join_timeout) {
                self.strategy.force_stop(&mut handle);
            }
        }
        slot.state_mut().live = None;
    }

    /// Error for a `generate` whose worker went away after the request was
    /// sent. A worker that was not being stopped is reaped so the next `load`
    /// starts a fresh one.
    fn worker_gone(&self, id: &WorkerIdentity, slot: &WorkerSlot, live: &Arc<LiveWorker>) -> PoolError {
        if live.shutdown.is_set() {
            return PoolError::worker_failure(id, "worker stopped before answering");
        }
        let _lifecycle = slot.lock_lifecycle();
        self.reap_locked(id, slot, live);
        PoolError::worker_failure(id, "worker terminated")
    }

    /// Stop the worker for `id`. No-op when it is not running.
    pub fn unload(&self, id: &WorkerIdentity) -> Result<(), PoolError> {
        let slot = self.slot(id)?;
        let _lifecycle = slot.lock_lifecycle();
        self.stop_locked(id, &slot)
    }

    /// Caller holds the slot's lifecycle lock.
    fn stop_locked(&self, id: &WorkerIdentity, slot: &WorkerSlot) -> Result<(), PoolError> {
        let Some(live) = slot.live() else {
            return Ok(());
        };

        log::info!("Unloading instance {id}");
        // Visible to `generate` before the join starts.
        live.shutdown.set();

        let joined = {
            let mut handle = live.handle.lock().unwrap_or_else(PoisonError::into_inner);
            self.strategy.signal_stop(&handle);
            let joined = self.strategy.join(&mut handle, self.settings.join_timeout);
            if !joined {
                log::warn!(
                    "Instance {id} did not stop within {:?}; forcing",
                    self.settings.join_timeout
                );
                self.strategy.force_stop(&mut handle);
            }
            joined
        };

        slot.state_mut().live = None;

        if joined {
            log::info!("Instance {id} stopped");
            Ok(())
        } else {
            Err(PoolError::ShutdownTimeout {
                id: id.clone(),
                timeout: self.settings.join_timeout,
            })
        }
    }

    /// Replace the config of `id`, stopping the worker on drift. Never
    /// reloads.
    pub fn reset(&self, id: &WorkerIdentity, config: InstanceConfig) -> Result<(), PoolError> {
        let slot = self.slot(id)?;
        let _lifecycle = slot.lock_lifecycle();
        if slot.state().retired {
            return Err(PoolError::UnknownInstance(id.clone()));
        }
        self.reset_locked(id, &slot, config)
    }

    /// The config is replaced even when the old worker had to be forced;
    /// that timeout is still reported.
    fn reset_locked(
        &self,
        id: &WorkerIdentity,
        slot: &WorkerSlot,
        config: InstanceConfig,
    ) -> Result<(), PoolError> {
        if slot.state().config == config {
            return Ok(());
        }
        log::info!("Config of instance {id} changed; resetting");
        let stopped = self.stop_locked(id, slot);
        slot.state_mut().config = config;
        stopped
    }

    /// Unload `id` and drop it from the registry.
    pub fn remove(&self, id: &WorkerIdentity) -> Result<(), PoolError> {
        let slot = self.slot(id)?;
        let _lifecycle = slot.lock_lifecycle();
        if slot.state().retired {
            return Err(PoolError::UnknownInstance(id.clone()));
        }

        let stopped = self.stop_locked(id, &slot);
        slot.state_mut().retired = true;

        let mut workers = self.registry_mut();
        if workers.get(id).is_some_and(|current| Arc::ptr_eq(current, &slot)) {
            workers.remove(id);
        }
        log::info!("Removed instance {id}");
        stopped
    }

    /// Send `input` to the worker and wait for its answer, bounded by the
    /// pool's default generate timeout.
    pub fn generate(&self, id: &WorkerIdentity, input: &str) -> Result<String, PoolError> {
        self.generate_with_timeout(id, input, self.settings.generate_timeout)
    }

    pub fn generate_with_timeout(
        &self,
        id: &WorkerIdentity,
        input: &str,
        timeout: Option<Duration>,
    ) -> Result<String, PoolError> {
        let slot = self.slot(id)?;
        let live = slot
            .live()
            .ok_or_else(|| PoolError::NotRunning(id.clone()))?;

        let responses = live.responses.lock().unwrap_or_else(PoisonError::into_inner);
        if live.shutdown.is_set() {
            return Err(PoolError::NotRunning(id.clone()));
        }

        let request_id = live.next_request_id.fetch_add(1, Ordering::Relaxed);
        log::debug!("Request {request_id} to {id}");
        if live
            .requests
            .send(WorkerRequest::generate(request_id, input))
            .is_err()
        {
            drop(responses);
            return Err(self.worker_gone(id, &slot, &live));
        }

        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(PoolError::Timeout {
                            id: id.clone(),
                            timeout: timeout.unwrap_or_default(),
                        });
                    }
                    (deadline - now).min(self.settings.poll_interval)
                }
                None => self.settings.poll_interval,
            };

            match responses.recv_timeout(wait) {
                Ok(response) if response.id == request_id => {
                    return match response.payload {
                        WorkerPayload::Output { text } => Ok(text),
                        WorkerPayload::Failure { message } => {
                            Err(PoolError::worker_failure(id, message))
                        }
                        other => Err(PoolError::worker_failure(
                            id,
                            format!("unexpected worker response: {other:?}"),
                        )),
                    };
                }
                Ok(stale) => {
                    // Answer to a request whose caller already timed out.
                    log::debug!("Discarding stale response {} from {id}", stale.id);
                }
                Err(RecvTimeoutError::Timeout) => {
                    if !live.is_alive(&self.strategy) {
                        drop(responses);
                        return Err(self.worker_gone(id, &slot, &live));
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    drop(responses);
                    return Err(self.worker_gone(id, &slot, &live));
                }
            }
        }
    }

    /// `false` for unknown identities and for workers that died on their
    /// own; `load` restarts the latter.
    pub fn is_running(&self, id: &WorkerIdentity) -> bool {
        self.slot(id).is_ok_and(|slot| {
            slot.live()
                .is_some_and(|live| live.is_alive(&self.strategy))
        })
    }

    /// OS process id of a running process worker.
    pub fn worker_pid(&self, id: &WorkerIdentity) -> Option<u32> {
        self.slot(id).ok()?.live()?.pid()
    }

    pub fn config(&self, id: &WorkerIdentity) -> Option<InstanceConfig> {
        self.slot(id).ok().map(|slot| slot.state().config.clone())
    }

    pub fn identities(&self) -> Vec<WorkerIdentity> {
        let mut ids: Vec<_> = self.registry().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.registry().len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry().is_empty()
    }

    /// Unload every running worker in parallel. Returns the workers that
    /// had to be forced or failed to stop.
    pub fn stop_all(&self) -> Vec<(WorkerIdentity, PoolError)> {
        let slots: Vec<(WorkerIdentity, Arc<WorkerSlot>)> = self
            .registry()
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect();

        log::info!("Stopping all workers ({} registered)", slots.len());
        std::thread::scope(|scope| {
            let stops: Vec<_> = slots
                .iter()
                .filter(|(_, slot)| slot.has_worker())
                .map(|(id, slot)| {
                    let stop = scope.spawn(move || {
                        let _lifecycle = slot.lock_lifecycle();
                        self.stop_locked(id, slot)
                    });
                    (id, stop)
                })
                .collect();

            stops
                .into_iter()
                .filter_map(|(id, stop)| match stop.join() {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some((id.clone(), e)),
                    Err(_) => Some((id.clone(), PoolError::worker_failure(id, "unload panicked"))),
                })
                .collect()
        })
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("strategy", &self.strategy.name())
            .field("settings", &self.settings)
            .field("workers", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn test_settings() -> PoolSettings {
        PoolSettings {
            poll_interval: Duration::from_millis(20),
            join_timeout: Duration::from_secs(5),
            load_timeout: Duration::from_secs(5),
            generate_timeout: None,
        }
    }

    fn thread_pool() -> Pool {
        Pool::builtin(ExecutionStrategy::thread(), test_settings())
    }

    fn hi(response: &str) -> InstanceConfig {
        InstanceConfig::echo([("hi", response)])
    }

    fn echo_scenario(pool: &Pool) {
        let id = pool.prepare(hi("bonjour"), None).unwrap();
        assert!(!pool.is_running(&id));

        pool.load(&id).unwrap();
        assert!(pool.is_running(&id));
        assert_eq!(pool.worker_pid(&id), None);
        assert_eq!(pool.generate(&id, "hi").unwrap(), "bonjour");

        pool.unload(&id).unwrap();
        assert!(!pool.is_running(&id));
        assert!(matches!(pool.generate(&id, "hi"), Err(PoolError::NotRunning(_))));

        pool.reset(&id, hi("hey")).unwrap();
        assert!(!pool.is_running(&id));
        pool.load(&id).unwrap();
        assert_eq!(pool.generate(&id, "hi").unwrap(), "hey");

        assert!(pool.stop_all().is_empty());
    }

    #[test]
    fn test_echo_scenario_thread() {
        echo_scenario(&thread_pool());
    }

    #[test]
    fn test_echo_scenario_cooperative() {
        let strategy = ExecutionStrategy::cooperative().unwrap();
        echo_scenario(&Pool::builtin(strategy, test_settings()));
    }

    #[test]
    fn test_prepare_is_idempotent() {
        let pool = thread_pool();
        let id = WorkerIdentity::from("instance-a");
        assert_eq!(pool.prepare(hi("bonjour"), Some(id.clone())).unwrap(), id);
        pool.load(&id).unwrap();

        assert_eq!(pool.prepare(hi("bonjour"), Some(id.clone())).unwrap(), id);
        assert_eq!(pool.len(), 1);
        assert!(pool.is_running(&id));
        assert_eq!(pool.generate(&id, "hi").unwrap(), "bonjour");
        pool.stop_all();
    }

    #[test]
    fn test_prepare_with_drift_resets_worker() {
        let pool = thread_pool();
        let id = pool.prepare(hi("bonjour"), None).unwrap();
        pool.load(&id).unwrap();

        pool.prepare(hi("hey"), Some(id.clone())).unwrap();
        assert!(!pool.is_running(&id));
        assert_eq!(pool.config(&id), Some(hi("hey")));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_unknown_instance() {
        let pool = thread_pool();
        let id = WorkerIdentity::from("missing");
        assert!(matches!(pool.load(&id), Err(PoolError::UnknownInstance(_))));
        assert!(matches!(pool.unload(&id), Err(PoolError::UnknownInstance(_))));
        assert!(matches!(
            pool.generate(&id, "hi"),
            Err(PoolError::UnknownInstance(_))
        ));
        assert!(!pool.is_running(&id));
        assert!(pool.config(&id).is_none());
    }

    #[test]
    fn test_load_and_unload_are_idempotent() {
        let pool = thread_pool();
        let id = pool.prepare(hi("bonjour"), None).unwrap();
        pool.unload(&id).unwrap();
        assert!(pool.load(&id).unwrap());
        assert!(!pool.load(&id).unwrap());
        assert_eq!(pool.generate(&id, "hi").unwrap(), "bonjour");
        pool.unload(&id).unwrap();
        pool.unload(&id).unwrap();
        assert!(!pool.is_running(&id));
    }

    #[test]
    fn test_load_failure_leaves_instance_stopped() {
        let pool = thread_pool();
        let id = pool
            .prepare(InstanceConfig::new("llamacpp", "gguf"), None)
            .unwrap();

        match pool.load(&id) {
            Err(PoolError::LoadError { message, .. }) => assert!(message.contains("llamacpp")),
            other => panic!("expected load error, got {other:?}"),
        }
        assert!(!pool.is_running(&id));

        pool.reset(&id, hi("bonjour")).unwrap();
        pool.load(&id).unwrap();
        assert_eq!(pool.generate(&id, "hi").unwrap(), "bonjour");
        pool.stop_all();
    }

    #[test]
    fn test_inference_failure_keeps_worker_serving() {
        let pool = thread_pool();
        let id = pool.prepare(hi("bonjour"), None).unwrap();
        pool.load(&id).unwrap();

        match pool.generate(&id, "bye") {
            Err(PoolError::WorkerFailure { message, .. }) => assert!(message.contains("bye")),
            other => panic!("expected worker failure, got {other:?}"),
        }
        assert!(pool.is_running(&id));
        assert_eq!(pool.generate(&id, "hi").unwrap(), "bonjour");
        pool.stop_all();
    }

    #[test]
    fn test_instances_are_isolated() {
        let pool = thread_pool();
        let slow = pool
            .prepare(hi("slow").with_kwarg("delay_ms", 400), None)
            .unwrap();
        let fast = pool.prepare(hi("fast"), None).unwrap();
        pool.load(&slow).unwrap();
        pool.load(&fast).unwrap();

        thread::scope(|scope| {
            let busy = scope.spawn(|| pool.generate(&slow, "hi"));
            thread::sleep(Duration::from_millis(50));

            let started = Instant::now();
            assert_eq!(pool.generate(&fast, "hi").unwrap(), "fast");
            assert!(started.elapsed() < Duration::from_millis(300));

            assert_eq!(busy.join().unwrap().unwrap(), "slow");
        });
        pool.stop_all();
    }

    #[test]
    fn test_requests_to_one_instance_are_serialized() {
        let pool = thread_pool();
        let config = InstanceConfig::echo([("a", "1"), ("b", "2")]).with_kwarg("delay_ms", 100);
        let id = pool.prepare(config, None).unwrap();
        pool.load(&id).unwrap();

        let started = Instant::now();
        thread::scope(|scope| {
            let a = scope.spawn(|| pool.generate(&id, "a"));
            let b = scope.spawn(|| pool.generate(&id, "b"));
            assert_eq!(a.join().unwrap().unwrap(), "1");
            assert_eq!(b.join().unwrap().unwrap(), "2");
        });
        assert!(started.elapsed() >= Duration::from_millis(200));
        pool.stop_all();
    }

    #[test]
    fn test_generate_timeout_discards_stale_response() {
        let pool = thread_pool();
        let config = InstanceConfig::echo([("a", "1"), ("b", "2")]).with_kwarg("delay_ms", 150);
        let id = pool.prepare(config, None).unwrap();
        pool.load(&id).unwrap();

        assert!(matches!(
            pool.generate_with_timeout(&id, "a", Some(Duration::from_millis(30))),
            Err(PoolError::Timeout { .. })
        ));
        assert_eq!(pool.generate(&id, "b").unwrap(), "2");
        pool.stop_all();
    }

    #[test]
    fn test_unload_timeout_forces_stop() {
        let settings = PoolSettings {
            join_timeout: Duration::from_millis(50),
            ..test_settings()
        };
        let pool = Pool::builtin(ExecutionStrategy::thread(), settings);
        let id = pool
            .prepare(hi("late").with_kwarg("delay_ms", 400), None)
            .unwrap();
        pool.load(&id).unwrap();

        thread::scope(|scope| {
            let in_flight = scope.spawn(|| pool.generate(&id, "hi"));
            thread::sleep(Duration::from_millis(100));

            assert!(matches!(
                pool.unload(&id),
                Err(PoolError::ShutdownTimeout { .. })
            ));
            assert!(!pool.is_running(&id));
            // The detached worker may still deliver its answer.
            let outcome = in_flight.join().unwrap();
            assert!(
                matches!(
                    outcome,
                    Ok(ref text) if text == "late"
                ) || matches!(outcome, Err(PoolError::WorkerFailure { .. })),
                "unexpected outcome: {outcome:?}"
            );
        });
        assert!(matches!(pool.generate(&id, "hi"), Err(PoolError::NotRunning(_))));
    }

    #[test]
    fn test_stop_all_during_in_flight_generate() {
        let pool = thread_pool();
        let id = pool
            .prepare(hi("slow").with_kwarg("delay_ms", 200), None)
            .unwrap();
        pool.load(&id).unwrap();

        thread::scope(|scope| {
            let first = scope.spawn(|| pool.generate(&id, "hi"));
            let queued = scope.spawn(|| pool.generate(&id, "hi"));
            thread::sleep(Duration::from_millis(50));

            assert!(pool.stop_all().is_empty());
            assert!(!pool.is_running(&id));

            for outcome in [first.join().unwrap(), queued.join().unwrap()] {
                assert!(
                    matches!(
                        outcome,
                        Ok(_) | Err(PoolError::WorkerFailure { .. }) | Err(PoolError::NotRunning(_))
                    ),
                    "unexpected outcome: {outcome:?}"
                );
            }
        });

        pool.load(&id).unwrap();
        assert_eq!(pool.generate(&id, "hi").unwrap(), "slow");
        pool.stop_all();
    }

    #[test]
    fn test_stop_all_converges() {
        let pool = thread_pool();
        let ids: Vec<_> = (0..3)
            .map(|n| pool.prepare(hi(&format!("hello {n}")), None).unwrap())
            .collect();
        for id in &ids {
            pool.load(id).unwrap();
        }

        assert!(pool.stop_all().is_empty());
        assert!(ids.iter().all(|id| !pool.is_running(id)));
        assert_eq!(pool.len(), 3);
    }

    #[test]
    fn test_concurrent_prepare_and_load_converge_on_one_worker() {
        let pool = thread_pool();
        let id = WorkerIdentity::from("shared");

        thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    pool.prepare(hi("bonjour"), Some(id.clone())).unwrap();
                    pool.load(&id).unwrap();
                });
            }
        });

        assert_eq!(pool.len(), 1);
        assert!(pool.is_running(&id));
        assert_eq!(pool.generate(&id, "hi").unwrap(), "bonjour");
        pool.stop_all();
    }

    #[test]
    fn test_remove_drops_instance() {
        let pool = thread_pool();
        let id = pool.prepare(hi("bonjour"), None).unwrap();
        pool.load(&id).unwrap();

        pool.remove(&id).unwrap();
        assert!(pool.is_empty());
        assert!(matches!(pool.remove(&id), Err(PoolError::UnknownInstance(_))));
        assert!(matches!(
            pool.generate(&id, "hi"),
            Err(PoolError::UnknownInstance(_))
        ));

        // The identity can be prepared again from scratch.
        pool.prepare(hi("hey"), Some(id.clone())).unwrap();
        pool.load(&id).unwrap();
        assert_eq!(pool.generate(&id, "hi").unwrap(), "hey");
        pool.stop_all();
    }

    #[test]
    fn test_identities_are_sorted() {
        let pool = thread_pool();
        pool.prepare(hi("b"), Some(WorkerIdentity::from("b"))).unwrap();
        pool.prepare(hi("a"), Some(WorkerIdentity::from("a"))).unwrap();
        assert_eq!(
            pool.identities(),
            vec![WorkerIdentity::from("a"), WorkerIdentity::from("b")]
        );
    }

    #[test]
    fn test_settings_from_backend_settings() {
        let backend = BackendSettings {
            poll_interval_ms: 100,
            generate_timeout_ms: Some(2_000),
            ..BackendSettings::default()
        };
        let settings = PoolSettings::from(&backend);
        assert_eq!(settings.poll_interval, Duration::from_millis(100));
        assert_eq!(settings.generate_timeout, Some(Duration::from_secs(2)));
    }
}
