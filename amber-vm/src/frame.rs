// amber-vm - Host-side virtual machine for the Amber scripting engine
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! Call frames for the VM.

use std::rc::Rc;

use amber_il::{BlockId, Function, Value};

/// A call frame on the VM's call stack.
#[derive(Debug, Clone)]
pub struct CallFrame {
    /// The function being executed.
    pub function: Rc<Function>,
    /// Index of the unit the function came from, for function-literal
    /// remapping.
    pub unit: usize,
    /// Current block.
    pub block: BlockId,
    /// Next operation within the block.
    pub op_index: usize,
    /// Stack base: absolute index of operand-stack slot 0.
    pub base: usize,
    /// Incoming arguments; index 0 is `this`.
    pub args: Vec<Value>,
    /// Innermost closure scope, or `Undefined` outside any scope.
    pub scope: Value,
}

impl CallFrame {
    pub fn new(function: Rc<Function>, unit: usize, base: usize, args: Vec<Value>, scope: Value) -> Self {
        let block = function.entry_block_id;
        Self {
            function,
            unit,
            block,
            op_index: 0,
            base,
            args,
            scope,
        }
    }
}
