//! Compiled module records and the per-unit module store.

use std::sync::Arc;
use std::time::SystemTime;

use indexmap::IndexMap;
use parking_lot::Mutex;

use crucible_resolve::{ModuleCatalog, UnitRegistry};

use crate::traits::InstanceHandle;

/// Load lifecycle of a unit's module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadState {
    #[default]
    Unloaded,
    Loading,
    Loaded,
}

/// The byte image and metadata resulting from one successful job, after
/// sandbox patching. Immutable once created; load state lives on the
/// owning [`ModuleSlot`].
#[derive(Debug)]
pub struct CompiledModule {
    pub name: String,
    /// Image as returned by the worker.
    pub raw_bytes: Vec<u8>,
    /// Image after sandbox patching; this is what the loader receives.
    pub patched_bytes: Vec<u8>,
    /// Constituent unit names.
    pub units: Vec<String>,
    pub compiled_at: SystemTime,
}

impl CompiledModule {
    /// True when the module batches more than one unit.
    pub fn is_batch(&self) -> bool {
        self.units.len() > 1
    }
}

/// Per-unit module bookkeeping: the active module, its load state, and
/// the last module that loaded successfully (the rollback target).
#[derive(Debug, Default)]
pub struct ModuleSlot {
    pub current: Option<Arc<CompiledModule>>,
    pub last_good: Option<Arc<CompiledModule>>,
    pub state: LoadState,
    pub instance: Option<InstanceHandle>,
}

/// Unit-name keyed module slots, shared between the host's control loop
/// and the resolver (which embeds loaded dependencies as references).
#[derive(Debug)]
pub struct ModuleStore {
    registry: Arc<UnitRegistry>,
    slots: Mutex<IndexMap<String, ModuleSlot>>,
}

impl ModuleStore {
    pub fn new(registry: Arc<UnitRegistry>) -> Self {
        Self {
            registry,
            slots: Mutex::new(IndexMap::new()),
        }
    }

    /// Runs `f` with the unit's slot, creating an empty slot on first use.
    pub fn with_slot<R>(&self, unit: &str, f: impl FnOnce(&mut ModuleSlot) -> R) -> R {
        let mut slots = self.slots.lock();
        f(slots.entry(unit.to_string()).or_default())
    }

    /// Removes a unit's slot, returning the instance to unload, if any.
    pub fn remove(&self, unit: &str) -> Option<InstanceHandle> {
        self.slots
            .lock()
            .shift_remove(unit)
            .and_then(|slot| slot.instance)
    }

    pub fn state(&self, unit: &str) -> LoadState {
        self.slots
            .lock()
            .get(unit)
            .map(|slot| slot.state)
            .unwrap_or_default()
    }

    /// The active module of a unit, if any.
    pub fn current(&self, unit: &str) -> Option<Arc<CompiledModule>> {
        self.slots.lock().get(unit).and_then(|s| s.current.clone())
    }
}

impl ModuleCatalog for ModuleStore {
    /// A dependency is embeddable when its module is loaded and the
    /// unit's source has not changed since the module was compiled.
    fn loaded_module(&self, unit: &str) -> Option<Vec<u8>> {
        let module = {
            let slots = self.slots.lock();
            let slot = slots.get(unit)?;
            if slot.state != LoadState::Loaded {
                return None;
            }
            slot.current.clone()?
        };
        if let Some(handle) = self.registry.get(unit) {
            let stale = handle
                .lock()
                .last_modified
                .is_some_and(|modified| modified > module.compiled_at);
            if stale {
                return None;
            }
        }
        Some(module.patched_bytes.clone())
    }
}
