//! Named variable store shared between the sessions and the rest of the application
//!
//! Measurement signals are written into the store as DTOs arrive, calibration
//! parameters are read from it and downloaded to the target whenever someone
//! writes a new value.

use std::collections::HashMap;

use crate::codec::{ScalarType, ScalarValue};

/// Handle to an attached variable
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct VariableId(pub u32);

/// Optional descriptive data attached together with a variable
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct VariableMeta {
    /// Physical unit
    pub unit: Option<String>,
    /// Conversion formula, passed through untouched
    pub conversion: Option<String>,
    /// Lower display limit
    pub min: Option<f64>,
    /// Upper display limit
    pub max: Option<f64>,
}

/// Store of named, typed variables.
///
/// Attaching a name that already exists returns the existing handle and bumps its
/// attach count. Releasing it again drops the count, the variable disappears once
/// nobody holds it anymore.
pub trait VariableStore {
    /// Attaches a variable. Returns `None` if the store refuses it
    fn attach(&mut self, name: &str, kind: ScalarType, meta: &VariableMeta) -> Option<VariableId>;

    /// Looks up a variable without attaching it
    fn lookup(&self, name: &str) -> Option<VariableId>;

    /// Releases a handle returned by [VariableStore::attach]
    fn release(&mut self, id: VariableId);

    /// Current value of a variable
    fn read(&self, id: VariableId) -> Option<f64>;

    /// Writes a value from the target side. This does not mark the variable as changed
    fn write(&mut self, id: VariableId, value: f64);

    /// Returns true once per application side write since the last call
    fn take_written(&mut self, id: VariableId) -> bool;

    /// Creates or overwrites a double variable owned by the engine itself,
    /// such as the per connection status values
    fn publish(&mut self, name: &str, value: f64);
}

#[derive(Debug, Clone)]
struct Slot {
    name: String,
    kind: ScalarType,
    meta: VariableMeta,
    value: f64,
    attached: usize,
    written: bool,
}

/// In process [VariableStore]
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    slots: HashMap<VariableId, Slot>,
    names: HashMap<String, VariableId>,
    next_id: u32,
    capacity: Option<usize>,
}

impl MemoryStore {
    /// Creates an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store that refuses attaches beyond `capacity` variables
    pub fn with_capacity_limit(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::default()
        }
    }

    /// Number of variables currently in the store
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True if the store holds no variables
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// How many times a variable is currently attached
    pub fn attach_count(&self, name: &str) -> usize {
        self.names
            .get(name)
            .and_then(|id| self.slots.get(id))
            .map(|s| s.attached)
            .unwrap_or(0)
    }

    /// Type a variable was attached with
    pub fn kind(&self, name: &str) -> Option<ScalarType> {
        self.names.get(name).and_then(|id| self.slots.get(id)).map(|s| s.kind)
    }

    /// Metadata a variable was attached with
    pub fn meta(&self, name: &str) -> Option<&VariableMeta> {
        self.names.get(name).and_then(|id| self.slots.get(id)).map(|s| &s.meta)
    }

    /// Reads a variable by name
    pub fn read_by_name(&self, name: &str) -> Option<f64> {
        self.names.get(name).and_then(|id| self.read(*id))
    }

    /// Application side write. The value is cast to the variable's type and the
    /// variable is marked as changed. Returns false if the variable does not exist
    pub fn write_by_name(&mut self, name: &str, value: f64) -> bool {
        let Some(id) = self.names.get(name).copied() else {
            return false;
        };
        match self.slots.get_mut(&id) {
            Some(slot) => {
                slot.value = ScalarValue::from_f64(slot.kind, value).as_f64();
                slot.written = true;
                true
            }
            None => false,
        }
    }

    /// Creates or overwrites a plain f64 variable that is not owned by any session.
    /// Used for published status values
    pub fn set(&mut self, name: &str, value: f64) {
        let id = match self.names.get(name) {
            Some(id) => *id,
            None => match self.insert(name, ScalarType::F64, &VariableMeta::default()) {
                Some(id) => id,
                None => return,
            },
        };
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.value = value;
        }
    }

    fn insert(&mut self, name: &str, kind: ScalarType, meta: &VariableMeta) -> Option<VariableId> {
        if self.capacity.is_some_and(|c| self.slots.len() >= c) {
            log::warn!("Variable store is full, cannot add {name}");
            return None;
        }
        let id = VariableId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        self.slots.insert(
            id,
            Slot {
                name: name.to_string(),
                kind,
                meta: meta.clone(),
                value: 0.0,
                attached: 0,
                written: false,
            },
        );
        self.names.insert(name.to_string(), id);
        Some(id)
    }
}

impl VariableStore for MemoryStore {
    fn attach(&mut self, name: &str, kind: ScalarType, meta: &VariableMeta) -> Option<VariableId> {
        let id = match self.names.get(name) {
            Some(id) => *id,
            None => self.insert(name, kind, meta)?,
        };
        let slot = self.slots.get_mut(&id)?;
        slot.attached += 1;
        Some(id)
    }

    fn lookup(&self, name: &str) -> Option<VariableId> {
        self.names.get(name).copied()
    }

    fn release(&mut self, id: VariableId) {
        let remove = match self.slots.get_mut(&id) {
            Some(slot) => {
                slot.attached = slot.attached.saturating_sub(1);
                slot.attached == 0
            }
            None => false,
        };
        if remove {
            if let Some(slot) = self.slots.remove(&id) {
                self.names.remove(&slot.name);
            }
        }
    }

    fn read(&self, id: VariableId) -> Option<f64> {
        self.slots.get(&id).map(|s| s.value)
    }

    fn write(&mut self, id: VariableId, value: f64) {
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.value = value;
        }
    }

    fn take_written(&mut self, id: VariableId) -> bool {
        match self.slots.get_mut(&id) {
            Some(slot) => std::mem::take(&mut slot.written),
            None => false,
        }
    }

    fn publish(&mut self, name: &str, value: f64) {
        self.set(name, value)
    }
}
