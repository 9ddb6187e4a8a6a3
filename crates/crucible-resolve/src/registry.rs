//! Concurrently guarded unit registry.
//!
//! The resolver creates units on first reference while other subsystems
//! read them, so the registry is an explicit shared instance handed to
//! collaborators by reference rather than a process-wide table.

use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};

use crate::unit::{ScriptUnit, normalize_name};

/// Shared handle to one registered unit.
pub type UnitHandle = Arc<Mutex<ScriptUnit>>;

/// Name-keyed set of script units.
///
/// Keys are normalized unit names; looking up by a raw script name
/// normalizes first, preserving single-instance-per-name semantics.
#[derive(Debug, Default)]
pub struct UnitRegistry {
    units: RwLock<IndexMap<String, UnitHandle>>,
}

impl UnitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a unit, creating it on first reference.
    pub fn find_or_create(&self, script_name: &str) -> UnitHandle {
        let key = normalize_name(script_name);
        if let Some(existing) = self.units.read().get(&key) {
            return Arc::clone(existing);
        }
        let mut units = self.units.write();
        Arc::clone(
            units
                .entry(key)
                .or_insert_with(|| Arc::new(Mutex::new(ScriptUnit::new(script_name)))),
        )
    }

    /// Looks up an existing unit by name (raw or normalized).
    pub fn get(&self, name: &str) -> Option<UnitHandle> {
        self.units.read().get(&normalize_name(name)).map(Arc::clone)
    }

    /// Retires a unit. Returns the handle if it was registered.
    pub fn remove(&self, name: &str) -> Option<UnitHandle> {
        self.units.write().shift_remove(&normalize_name(name))
    }

    /// Registered unit names in insertion order.
    pub fn names(&self) -> Vec<String> {
        self.units.read().keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.units.read().contains_key(&normalize_name(name))
    }

    pub fn len(&self) -> usize {
        self.units.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.read().is_empty()
    }
}
