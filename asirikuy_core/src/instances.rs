// asirikuy_core/src/instances.rs

//! Instance Lifecycle Manager.
//! Maps instance ids to their native engine and serializes per-bar calls per instance.

use crate::error::{BridgeError, BridgeResult, ReturnCode};
use crate::native;

struct InstanceSlot {
    engine: std::sync::Arc<dyn native::NativeEngine>,
    initialized: bool,
}

type SlotMap = std::collections::HashMap<i32, std::sync::Arc<std::sync::Mutex<InstanceSlot>>>;

/// Registry of live instances for one run.
/// The outer lock guards membership only; each instance has its own lock held for
/// the duration of a native call, so different instances run concurrently.
pub struct InstanceRegistry {
    slots: std::sync::Mutex<SlotMap>,
    wait_retries: usize,
    wait_delay: std::time::Duration,
}

impl Default for InstanceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self {
            slots: std::sync::Mutex::new(std::collections::HashMap::new()),
            wait_retries: 10,
            wait_delay: std::time::Duration::from_millis(50),
        }
    }

    /// How often and how long to wait while the engine answers `WAIT_FOR_INIT`.
    pub fn with_wait_policy(mut self, retries: usize, delay: std::time::Duration) -> Self {
        self.wait_retries = retries;
        self.wait_delay = delay;
        self
    }

    fn slots(&self) -> std::sync::MutexGuard<'_, SlotMap> {
        self.slots.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Initializes an instance in the engine.
    /// # Arguments
    /// * `engine` - Engine serving this instance.
    /// * `instance_id` - Run-unique id.
    /// * `is_backtesting` - Passed through to the engine.
    /// * `config_path` - Engine configuration file.
    /// * `account_label` - Account name forwarded to the engine.
    /// # Returns
    /// * `DuplicateInstance` if the id is live, `NativeInitFailed` with the engine's code otherwise.
    pub fn init(
        &self,
        engine: std::sync::Arc<dyn native::NativeEngine>,
        instance_id: i32,
        is_backtesting: bool,
        config_path: &str,
        account_label: &str,
    ) -> BridgeResult<()> {
        let slot = std::sync::Arc::new(std::sync::Mutex::new(InstanceSlot {
            engine: engine.clone(),
            initialized: false,
        }));

        {
            let mut slots = self.slots();
            if slots.contains_key(&instance_id) {
                return Err(BridgeError::DuplicateInstance(instance_id));
            }
            slots.insert(instance_id, slot.clone());
        }

        let mut guard = slot.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut code = engine.init_instance(instance_id, is_backtesting, config_path, account_label);
        let mut attempts = 0;
        while code == ReturnCode::WaitForInit as i32 && attempts < self.wait_retries {
            tracing::debug!("Instance {} waiting for init ({}/{})", instance_id, attempts + 1, self.wait_retries);
            std::thread::sleep(self.wait_delay);
            code = engine.init_instance(instance_id, is_backtesting, config_path, account_label);
            attempts += 1;
        }

        if code != ReturnCode::Success as i32 {
            drop(guard);
            self.slots().remove(&instance_id);
            return Err(BridgeError::NativeInitFailed { instance_id, code });
        }

        guard.initialized = true;
        tracing::info!("Instance {} initialized", instance_id);
        Ok(())
    }

    /// Runs one per-bar call. Blocks while another call on the same instance is in flight.
    pub fn invoke(&self, snapshot: &native::BarSnapshot<'_>) -> BridgeResult<native::BarOutcome> {
        let slot = self
            .slots()
            .get(&snapshot.instance_id)
            .cloned()
            .ok_or(BridgeError::UnknownInstance(snapshot.instance_id))?;

        let guard = slot.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if !guard.initialized {
            return Err(BridgeError::UnknownInstance(snapshot.instance_id));
        }
        Ok(guard.engine.run_bar(snapshot))
    }

    /// Idempotent: unknown or already released ids are ignored.
    pub fn deinit(&self, instance_id: i32) {
        let Some(slot) = self.slots().remove(&instance_id) else {
            return;
        };
        let mut guard = slot.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if guard.initialized {
            guard.engine.deinit_instance(instance_id);
            guard.initialized = false;
            tracing::info!("Instance {} deinitialized", instance_id);
        }
    }

    pub fn deinit_all(&self) {
        let ids: Vec<i32> = self.slots().keys().copied().collect();
        for id in ids {
            self.deinit(id);
        }
    }

    pub fn is_registered(&self, instance_id: i32) -> bool {
        self.slots().contains_key(&instance_id)
    }

    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for InstanceRegistry {
    fn drop(&mut self) {
        self.deinit_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::ScriptedEngine;

    #[test]
    fn test_duplicate_init_rejected() {
        let engine = std::sync::Arc::new(ScriptedEngine::new());
        let registry = InstanceRegistry::new();
        registry.init(engine.clone(), 1, true, "", "").unwrap();
        let err = registry.init(engine.clone(), 1, true, "", "").unwrap_err();
        assert!(matches!(err, BridgeError::DuplicateInstance(1)));
        assert_eq!(engine.init_count(1), 1);
    }

    #[test]
    fn test_native_init_failure_releases_id() {
        let engine = std::sync::Arc::new(ScriptedEngine::new().with_init_code(3023));
        let registry = InstanceRegistry::new();
        let err = registry.init(engine, 4, true, "", "").unwrap_err();
        assert_eq!(err.native_code(), Some(3023));
        assert!(!registry.is_registered(4));
    }

    #[test]
    fn test_wait_for_init_is_retried() {
        let engine = std::sync::Arc::new(ScriptedEngine::new().with_wait_for_init_rounds(2));
        let registry = InstanceRegistry::new().with_wait_policy(5, std::time::Duration::from_millis(1));
        registry.init(engine.clone(), 2, true, "", "").unwrap();
        assert_eq!(engine.init_count(2), 3);
    }

    #[test]
    fn test_deinit_is_idempotent() {
        let engine = std::sync::Arc::new(ScriptedEngine::new());
        let registry = InstanceRegistry::new();
        registry.init(engine.clone(), 3, true, "", "").unwrap();
        registry.deinit(3);
        registry.deinit(3);
        registry.deinit(99);
        assert_eq!(engine.deinit_count(3), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_drop_deinitializes_remaining() {
        let engine = std::sync::Arc::new(ScriptedEngine::new());
        {
            let registry = InstanceRegistry::new();
            registry.init(engine.clone(), 5, true, "", "").unwrap();
            registry.init(engine.clone(), 6, true, "", "").unwrap();
        }
        assert_eq!(engine.deinit_count(5), 1);
        assert_eq!(engine.deinit_count(6), 1);
    }
}
