// amber-vm - Host-side virtual machine for the Amber scripting engine
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! The VM state handed to the snapshot encoder, and accepted back from the
//! decoder on restore.
//!
//! Function ids here are VM-global (the per-unit ids are remapped away) and
//! every function-literal operand refers to them, so the encoder never needs
//! to know about units. Restored snapshots come back in the same shape with
//! positional global operands and synthesized global names.

use indexmap::IndexMap;

use amber_il::{AllocationId, Function, FunctionId, Value};

use crate::heap::Allocation;

/// Post-initialization VM state, ready for encoding.
#[derive(Debug, Clone)]
pub struct SnapshotInfo {
    /// Global slots in declaration order: host globals first (registration
    /// order), then the module's variables (allocation order).
    pub globals: Vec<(String, Value)>,
    /// The live heap.
    pub allocations: IndexMap<AllocationId, Allocation>,
    /// Every function, keyed by VM-global id, with remapped literal operands.
    pub functions: IndexMap<FunctionId, Function>,
    /// Values published to the host, keyed by export id.
    pub exports: IndexMap<u16, Value>,
}
