//! Backend controller: keeps the pool in step with the instance records.
//!
//! Each external instance id maps to the worker identity of the same name,
//! so concurrent callers for one instance always reach the same worker. The
//! controller also keeps per-instance bookkeeping (start time, restarts,
//! accesses, last activity) used for reporting and idle eviction.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use llm_backend_db::{InstancePatch, InstanceRecord, RecordStore};
use llm_backend_types::{InstanceConfig, WorkerIdentity};

use crate::error::{ControllerError, PoolError};
use crate::pool::Pool;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheEntry {
    pub started_at: Instant,
    pub restart_count: u32,
    pub access_count: u64,
    pub idle_since: Instant,
}

impl CacheEntry {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            started_at: now,
            restart_count: 0,
            access_count: 0,
            idle_since: now,
        }
    }
}

pub struct BackendController {
    pool: Pool,
    store: Arc<dyn RecordStore>,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl BackendController {
    pub fn new(pool: Pool, store: Arc<dyn RecordStore>) -> Self {
        Self {
            pool,
            store,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fetch(&self, external_id: &str) -> Result<InstanceRecord, ControllerError> {
        self.store
            .get_record(external_id)
            .map_err(ControllerError::Store)?
            .ok_or_else(|| ControllerError::MissingRecord(external_id.to_string()))
    }

    /// Make sure the worker for `external_id` is running and return its
    /// identity.
    pub fn ensure_loaded(&self, external_id: &str) -> Result<WorkerIdentity, ControllerError> {
        let id = WorkerIdentity::from(external_id);

        if self.cache().contains_key(external_id) {
            if self.pool.load(&id)? {
                log::info!("Restarted instance {external_id}");
                if let Some(entry) = self.cache().get_mut(external_id) {
                    entry.restart_count += 1;
                    entry.idle_since = Instant::now();
                }
            }
            return Ok(id);
        }

        let record = self.fetch(external_id)?;
        self.pool.prepare(record.config, Some(id.clone()))?;
        self.pool.load(&id)?;
        self.cache()
            .entry(external_id.to_string())
            .or_insert_with(CacheEntry::new);
        log::info!("Started instance {external_id}");
        Ok(id)
    }

    /// Run `input` through the instance, loading it first if needed.
    pub fn forward_request(&self, external_id: &str, input: &str) -> Result<String, ControllerError> {
        let id = self.ensure_loaded(external_id)?;
        let output = self.pool.generate(&id, input)?;

        if let Some(entry) = self.cache().get_mut(external_id) {
            entry.access_count += 1;
            entry.idle_since = Instant::now();
        }
        Ok(output)
    }

    /// Stop every worker and wait until none of the tracked instances runs.
    pub fn shutdown(&self) {
        log::info!("Shutting down backend controller");
        let tracked: Vec<WorkerIdentity> = self
            .cache()
            .keys()
            .map(|external_id| WorkerIdentity::from(external_id.as_str()))
            .collect();

        loop {
            for (id, e) in self.pool.stop_all() {
                log::warn!("Instance {id} did not stop cleanly: {e}");
            }
            if !tracked.iter().any(|id| self.pool.is_running(id)) {
                break;
            }
            // Restarted by a concurrent request; go around again.
            std::thread::sleep(self.pool.settings().poll_interval);
        }
        log::info!("All instances stopped");
    }

    /// Stop the worker of a tracked instance. `None` if the instance was
    /// never started.
    pub fn unload_instance(&self, external_id: &str) -> Result<Option<WorkerIdentity>, ControllerError> {
        if !self.cache().contains_key(external_id) {
            return Ok(None);
        }
        let id = WorkerIdentity::from(external_id);
        self.pool.unload(&id)?;
        Ok(Some(id))
    }

    pub fn create_instance(&self, config: &InstanceConfig) -> Result<String, ControllerError> {
        let id = self.store.post_record(config).map_err(ControllerError::Store)?;
        log::info!("Created instance {id} ({})", config.describe());
        Ok(id)
    }

    pub fn list_instances(&self) -> Result<Vec<InstanceRecord>, ControllerError> {
        self.store.list_records().map_err(ControllerError::Store)
    }

    /// Patch the stored record, then bring a known worker in line with it.
    pub fn update_instance(&self, external_id: &str, patch: &InstancePatch) -> Result<(), ControllerError> {
        let updated = self
            .store
            .patch_record(external_id, patch)
            .map_err(ControllerError::Store)?;
        if !updated {
            return Err(ControllerError::MissingRecord(external_id.to_string()));
        }

        if self.pool.config(&WorkerIdentity::from(external_id)).is_some() {
            self.sync_instance(external_id)?;
        }
        Ok(())
    }

    /// Re-read the record and prepare it. A running worker whose config
    /// drifted is reloaded with the new config; returns `true` in that case.
    pub fn sync_instance(&self, external_id: &str) -> Result<bool, ControllerError> {
        let record = self.fetch(external_id)?;
        let id = WorkerIdentity::from(external_id);

        let was_running = self.pool.is_running(&id);
        self.pool.prepare(record.config, Some(id.clone()))?;
        if !was_running || self.pool.is_running(&id) {
            return Ok(false);
        }

        self.pool.load(&id)?;
        let now = Instant::now();
        let mut cache = self.cache();
        let entry = cache
            .entry(external_id.to_string())
            .or_insert_with(CacheEntry::new);
        entry.restart_count += 1;
        entry.idle_since = now;
        log::info!("Reloaded instance {external_id} with its updated config");
        Ok(true)
    }

    /// Stop and forget the instance, then delete its record.
    pub fn delete_instance(&self, external_id: &str) -> Result<(), ControllerError> {
        let id = WorkerIdentity::from(external_id);
        match self.pool.remove(&id) {
            Ok(()) | Err(PoolError::UnknownInstance(_)) => {}
            // Removed anyway; the worker was forced.
            Err(e @ PoolError::ShutdownTimeout { .. }) => log::warn!("{e}"),
            Err(e) => return Err(e.into()),
        }
        self.cache().remove(external_id);

        let deleted = self
            .store
            .delete_record(external_id)
            .map_err(ControllerError::Store)?;
        if !deleted {
            return Err(ControllerError::MissingRecord(external_id.to_string()));
        }
        log::info!("Deleted instance {external_id}");
        Ok(())
    }

    pub fn entry(&self, external_id: &str) -> Option<CacheEntry> {
        self.cache().get(external_id).copied()
    }

    /// Unload running instances that have been idle longer than `max_idle`.
    /// Returns the evicted instance ids.
    pub fn evict_idle(&self, max_idle: Duration) -> Vec<String> {
        let candidates: Vec<String> = self
            .cache()
            .iter()
            .filter(|(_, entry)| entry.idle_since.elapsed() > max_idle)
            .map(|(external_id, _)| external_id.clone())
            .collect();

        let mut evicted = Vec::new();
        for external_id in candidates {
            let id = WorkerIdentity::from(external_id.as_str());
            if !self.pool.is_running(&id) {
                continue;
            }
            match self.pool.unload(&id) {
                Ok(()) => {}
                Err(e @ PoolError::ShutdownTimeout { .. }) => log::warn!("{e}"),
                Err(e) => {
                    log::warn!("Failed to evict {external_id}: {e}");
                    continue;
                }
            }
            log::info!("Evicted idle instance {external_id}");
            evicted.push(external_id);
        }
        evicted.sort();
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolSettings;
    use llm_backend_db::Database;
    use llm_backend_worker::ExecutionStrategy;
    use serde_json::{Map, Value};
    use std::thread;

    fn create_test_controller() -> (BackendController, Arc<Database>) {
        let db = Arc::new(Database::new(":memory:").unwrap());
        let settings = PoolSettings {
            poll_interval: Duration::from_millis(20),
            join_timeout: Duration::from_secs(5),
            load_timeout: Duration::from_secs(5),
            generate_timeout: Some(Duration::from_secs(5)),
        };
        let pool = Pool::builtin(ExecutionStrategy::thread(), settings);
        (BackendController::new(pool, db.clone()), db)
    }

    fn kwargs(prompt: &str, response: &str) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert(prompt.to_string(), Value::String(response.to_string()));
        map
    }

    #[test]
    fn test_forward_request_loads_and_counts() {
        let (controller, _db) = create_test_controller();
        let id = controller
            .create_instance(&InstanceConfig::echo([("hi", "bonjour")]))
            .unwrap();

        assert!(controller.entry(&id).is_none());
        assert_eq!(controller.forward_request(&id, "hi").unwrap(), "bonjour");

        let entry = controller.entry(&id).unwrap();
        assert_eq!(entry.access_count, 1);
        assert_eq!(entry.restart_count, 0);
        assert!(controller.pool().is_running(&WorkerIdentity::from(id.as_str())));

        controller.forward_request(&id, "hi").unwrap();
        assert_eq!(controller.entry(&id).unwrap().access_count, 2);
        controller.shutdown();
    }

    #[test]
    fn test_reload_after_unload_counts_restart() {
        let (controller, _db) = create_test_controller();
        let id = controller
            .create_instance(&InstanceConfig::echo([("hi", "bonjour")]))
            .unwrap();
        controller.forward_request(&id, "hi").unwrap();

        let worker = controller.unload_instance(&id).unwrap();
        assert_eq!(worker, Some(WorkerIdentity::from(id.as_str())));
        assert!(!controller.pool().is_running(&WorkerIdentity::from(id.as_str())));

        assert_eq!(controller.forward_request(&id, "hi").unwrap(), "bonjour");
        let entry = controller.entry(&id).unwrap();
        assert_eq!(entry.restart_count, 1);
        assert_eq!(entry.access_count, 2);
        controller.shutdown();
    }

    #[test]
    fn test_unload_unknown_instance_is_none() {
        let (controller, _db) = create_test_controller();
        assert_eq!(controller.unload_instance("never-started").unwrap(), None);
    }

    #[test]
    fn test_missing_record() {
        let (controller, _db) = create_test_controller();
        assert!(matches!(
            controller.forward_request("ghost", "hi"),
            Err(ControllerError::MissingRecord(ref id)) if id == "ghost"
        ));
        assert!(controller.pool().is_empty());
    }

    #[test]
    fn test_update_running_instance_reloads_with_new_config() {
        let (controller, _db) = create_test_controller();
        let id = controller
            .create_instance(&InstanceConfig::echo([("hi", "bonjour")]))
            .unwrap();
        assert_eq!(controller.forward_request(&id, "hi").unwrap(), "bonjour");

        let patch = InstancePatch {
            loader_kwargs: Some(kwargs("hi", "hey")),
            ..InstancePatch::default()
        };
        controller.update_instance(&id, &patch).unwrap();

        assert!(controller.pool().is_running(&WorkerIdentity::from(id.as_str())));
        assert_eq!(controller.entry(&id).unwrap().restart_count, 1);
        assert_eq!(controller.forward_request(&id, "hi").unwrap(), "hey");
        controller.shutdown();
    }

    #[test]
    fn test_update_stopped_instance_does_not_start_it() {
        let (controller, _db) = create_test_controller();
        let id = controller
            .create_instance(&InstanceConfig::echo([("hi", "bonjour")]))
            .unwrap();
        controller.forward_request(&id, "hi").unwrap();
        controller.unload_instance(&id).unwrap();

        let patch = InstancePatch {
            loader_kwargs: Some(kwargs("hi", "hey")),
            ..InstancePatch::default()
        };
        controller.update_instance(&id, &patch).unwrap();

        let worker = WorkerIdentity::from(id.as_str());
        assert!(!controller.pool().is_running(&worker));
        assert_eq!(
            controller.pool().config(&worker),
            Some(InstanceConfig::echo([("hi", "hey")]))
        );
        assert_eq!(controller.entry(&id).unwrap().restart_count, 0);
    }

    #[test]
    fn test_update_missing_record() {
        let (controller, _db) = create_test_controller();
        let patch = InstancePatch {
            gateway: Some(Some("openai".to_string())),
            ..InstancePatch::default()
        };
        assert!(matches!(
            controller.update_instance("ghost", &patch),
            Err(ControllerError::MissingRecord(_))
        ));
    }

    #[test]
    fn test_sync_without_drift_keeps_worker() {
        let (controller, _db) = create_test_controller();
        let id = controller
            .create_instance(&InstanceConfig::echo([("hi", "bonjour")]))
            .unwrap();
        controller.ensure_loaded(&id).unwrap();

        assert!(!controller.sync_instance(&id).unwrap());
        assert!(controller.pool().is_running(&WorkerIdentity::from(id.as_str())));
        assert_eq!(controller.entry(&id).unwrap().restart_count, 0);
        controller.shutdown();
    }

    #[test]
    fn test_delete_instance() {
        let (controller, db) = create_test_controller();
        let id = controller
            .create_instance(&InstanceConfig::echo([("hi", "bonjour")]))
            .unwrap();
        controller.forward_request(&id, "hi").unwrap();

        controller.delete_instance(&id).unwrap();
        assert!(controller.entry(&id).is_none());
        assert!(controller.pool().is_empty());
        assert!(db.get_instance(&id).unwrap().is_none());
        assert!(matches!(
            controller.delete_instance(&id),
            Err(ControllerError::MissingRecord(_))
        ));
    }

    #[test]
    fn test_shutdown_stops_everything() {
        let (controller, _db) = create_test_controller();
        let ids: Vec<String> = (0..3)
            .map(|_| {
                controller
                    .create_instance(&InstanceConfig::echo([("hi", "bonjour")]))
                    .unwrap()
            })
            .collect();
        for id in &ids {
            controller.ensure_loaded(id).unwrap();
        }

        controller.shutdown();
        for id in &ids {
            assert!(!controller.pool().is_running(&WorkerIdentity::from(id.as_str())));
        }
    }

    #[test]
    fn test_concurrent_ensure_loaded_converges() {
        let (controller, _db) = create_test_controller();
        let id = controller
            .create_instance(&InstanceConfig::echo([("hi", "bonjour")]))
            .unwrap();

        thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| controller.ensure_loaded(&id).unwrap());
            }
        });

        assert_eq!(controller.pool().len(), 1);
        assert_eq!(controller.entry(&id).unwrap().restart_count, 0);
        controller.shutdown();
    }

    #[test]
    fn test_evict_idle() {
        let (controller, _db) = create_test_controller();
        let stale = controller
            .create_instance(&InstanceConfig::echo([("hi", "old")]))
            .unwrap();
        let busy = controller
            .create_instance(&InstanceConfig::echo([("hi", "new")]))
            .unwrap();
        controller.forward_request(&stale, "hi").unwrap();
        controller.forward_request(&busy, "hi").unwrap();

        thread::sleep(Duration::from_millis(150));
        controller.forward_request(&busy, "hi").unwrap();

        assert_eq!(controller.evict_idle(Duration::from_millis(100)), vec![stale.clone()]);
        assert!(!controller.pool().is_running(&WorkerIdentity::from(stale.as_str())));
        assert!(controller.pool().is_running(&WorkerIdentity::from(busy.as_str())));

        // Already stopped instances are not evicted twice.
        assert!(controller.evict_idle(Duration::from_millis(100)).is_empty());
        controller.shutdown();
    }
}
