// amber-vm - Host-side virtual machine for the Amber scripting engine
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! The VM heap: allocations behind ids.
//!
//! Three runtime shapes exist. Objects are insertion-ordered property maps
//! (order is observable and must survive snapshotting). Arrays double as
//! closure scope records: a scope is an array whose slot 0 is the parent
//! scope and whose remaining slots are the captured cells. Closures are flat
//! vectors whose first slot is the captured scope and whose last slot is the
//! function pointer.

use indexmap::IndexMap;

use amber_il::{AllocationId, Value};

/// A heap object.
#[derive(Debug, Clone, PartialEq)]
pub enum Allocation {
    Object(IndexMap<String, Value>),
    Array(Vec<Value>),
    Closure(Vec<Value>),
}

impl Allocation {
    /// The type name used in diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Allocation::Object(_) => "object",
            Allocation::Array(_) => "array",
            Allocation::Closure(_) => "closure",
        }
    }

    /// All values held by this allocation, for reachability walks.
    pub fn slots(&self) -> Box<dyn Iterator<Item = &Value> + '_> {
        match self {
            Allocation::Object(properties) => Box::new(properties.values()),
            Allocation::Array(elements) => Box::new(elements.iter()),
            Allocation::Closure(slots) => Box::new(slots.iter()),
        }
    }
}

/// Allocation store with monotonically increasing ids.
#[derive(Debug, Default)]
pub struct Heap {
    allocations: IndexMap<AllocationId, Allocation>,
    next: u32,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a heap from snapshot contents.
    pub fn from_allocations(allocations: IndexMap<AllocationId, Allocation>) -> Self {
        let next = allocations.keys().map(|id| id.0 + 1).max().unwrap_or(0);
        Self { allocations, next }
    }

    pub fn allocate(&mut self, allocation: Allocation) -> AllocationId {
        let id = AllocationId(self.next);
        self.next += 1;
        self.allocations.insert(id, allocation);
        id
    }

    pub fn get(&self, id: AllocationId) -> Option<&Allocation> {
        self.allocations.get(&id)
    }

    pub fn get_mut(&mut self, id: AllocationId) -> Option<&mut Allocation> {
        self.allocations.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.allocations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (AllocationId, &Allocation)> {
        self.allocations.iter().map(|(id, a)| (*id, a))
    }

    /// Drop every allocation not in the retained set.
    pub fn retain(&mut self, keep: impl Fn(AllocationId) -> bool) {
        self.allocations.retain(|id, _| keep(*id));
    }

    /// Clone the full allocation table, for snapshotting.
    pub fn snapshot(&self) -> IndexMap<AllocationId, Allocation> {
        self.allocations.clone()
    }
}
