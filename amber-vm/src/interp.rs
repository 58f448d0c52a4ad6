// amber-vm - Host-side virtual machine for the Amber scripting engine
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! The dispatch loop: executes IL operations against the value stack, heap
//! and scope chain.
//!
//! Execution is block-structured rather than offset-structured: a frame
//! tracks `(block, op_index)` and terminators move between blocks. Since the
//! compiler verified stack depths on every edge, underflow here is always an
//! internal error.

use amber_il::{BinOp, BlockId, FunctionId, Opcode, Operand, UnOp, Value};

use crate::error::{Result, RuntimeError};
use crate::frame::CallFrame;
use crate::heap::Allocation;
use crate::machine::Vm;
use crate::ops;

impl Vm {
    /// Run a function to completion and return its result.
    pub(crate) fn run_function(
        &mut self,
        function: FunctionId,
        args: Vec<Value>,
        scope: Value,
    ) -> Result<Value> {
        let entry_frames = self.frames.len();
        let entry_stack = self.stack.len();
        self.push_frame(function, args, scope)?;
        let result = self.run_to_depth(entry_frames);
        if result.is_err() {
            self.frames.truncate(entry_frames);
            self.stack.truncate(entry_stack);
        }
        result
    }

    /// Call any callable value with a full argument vector (`this` first).
    pub(crate) fn run_call(&mut self, callee: Value, args: Vec<Value>) -> Result<Value> {
        match callee {
            Value::HostFunction(id) => {
                let f = self.resolve_host(id)?;
                f(self, &args[1..])
            }
            Value::Function(id) => self.run_function(id, args, Value::Undefined),
            Value::Reference(id) => {
                let (scope, target) = self.closure_parts(id)?;
                self.run_function(target, args, scope)
            }
            other => Err(RuntimeError::NotCallable(other.type_name().to_string())),
        }
    }

    fn run_to_depth(&mut self, entry_frames: usize) -> Result<Value> {
        while self.frames.len() > entry_frames {
            self.step()?;
        }
        self.stack.pop()
    }

    fn push_frame(&mut self, function: FunctionId, args: Vec<Value>, scope: Value) -> Result<()> {
        if self.frames.len() >= self.max_call_depth() {
            return Err(RuntimeError::CallDepthExceeded);
        }
        let (il, unit) = self
            .functions
            .get(function.0 as usize)
            .cloned()
            .ok_or_else(|| RuntimeError::internal(format!("unknown function {}", function)))?;
        let base = self.stack.len();
        self.frames
            .push(CallFrame::new(il, unit, base, args, scope));
        Ok(())
    }

    /// The `(scope, function)` pair of a closure allocation.
    fn closure_parts(&self, id: amber_il::AllocationId) -> Result<(Value, FunctionId)> {
        match self.heap.get(id) {
            Some(Allocation::Closure(slots)) => {
                let scope = slots
                    .first()
                    .cloned()
                    .ok_or_else(|| RuntimeError::internal("closure with no slots"))?;
                match slots.last() {
                    Some(Value::Function(function)) => Ok((scope, *function)),
                    Some(other) => Err(RuntimeError::NotCallable(format!(
                        "closure over {}",
                        other.type_name()
                    ))),
                    None => Err(RuntimeError::internal("closure with no slots")),
                }
            }
            Some(other) => Err(RuntimeError::NotCallable(other.type_name().to_string())),
            None => Err(RuntimeError::internal("call through a dead reference")),
        }
    }

    fn step(&mut self) -> Result<()> {
        let frame = self
            .frames
            .last()
            .ok_or_else(|| RuntimeError::internal("step with no frame"))?;
        let function = frame.function.clone();
        let unit = frame.unit;
        let base = frame.base;
        let block_id = frame.block;
        let op_index = frame.op_index;

        let block = function
            .blocks
            .get(&block_id)
            .ok_or_else(|| RuntimeError::internal(format!("missing {}", block_id)))?;
        let op = block.operations.get(op_index).ok_or_else(|| {
            RuntimeError::internal(format!("fell off the end of {}", block_id))
        })?;
        self.frames
            .last_mut()
            .expect("frame checked above")
            .op_index += 1;

        match op.opcode {
            Opcode::Literal => {
                let mut value = expect_literal(op)?.clone();
                // Function literals carry unit-local ids in compiled units.
                if let Value::Function(local) = value {
                    if let Some(global) = self.unit_remaps[unit].get(&local) {
                        value = Value::Function(*global);
                    }
                }
                self.stack.push(value);
            }
            Opcode::LoadVar => {
                let index = expect_index(op, 0)?;
                let value = self.stack.get(base + index as usize)?;
                self.stack.push(value);
            }
            Opcode::StoreVar => {
                let index = expect_index(op, 0)?;
                let value = self.stack.peek(0)?;
                self.stack.set(base + index as usize, value)?;
            }
            Opcode::LoadArg => {
                let index = expect_index(op, 0)?;
                let value = self
                    .frames
                    .last()
                    .expect("frame checked above")
                    .args
                    .get(index as usize)
                    .cloned()
                    .unwrap_or(Value::Undefined);
                self.stack.push(value);
            }
            Opcode::LoadGlobal => {
                let value = match &op.operands[0] {
                    Operand::Name(name) => self
                        .globals
                        .get(name)
                        .cloned()
                        .ok_or_else(|| RuntimeError::UndefinedGlobal(name.clone()))?,
                    Operand::Index(index) => self
                        .globals
                        .get_index(*index as usize)
                        .map(|(_, v)| v.clone())
                        .ok_or_else(|| {
                            RuntimeError::internal(format!("global slot {} out of range", index))
                        })?,
                    _ => return Err(RuntimeError::internal("bad LoadGlobal operand")),
                };
                self.stack.push(value);
            }
            Opcode::StoreGlobal => {
                let value = self.stack.peek(0)?;
                match &op.operands[0] {
                    Operand::Name(name) => {
                        self.globals.insert(name.clone(), value);
                    }
                    Operand::Index(index) => {
                        let slot = self
                            .globals
                            .get_index_mut(*index as usize)
                            .map(|(_, v)| v)
                            .ok_or_else(|| {
                                RuntimeError::internal(format!(
                                    "global slot {} out of range",
                                    index
                                ))
                            })?;
                        *slot = value;
                    }
                    _ => return Err(RuntimeError::internal("bad StoreGlobal operand")),
                }
            }
            Opcode::LoadScoped => {
                let index = expect_index(op, 0)?;
                let scope = self
                    .frames
                    .last()
                    .expect("frame checked above")
                    .scope
                    .clone();
                let (id, slot) = self.scoped_slot(&scope, index)?;
                let value = match self.heap.get(id) {
                    Some(Allocation::Array(slots)) => slots[slot].clone(),
                    _ => return Err(RuntimeError::internal("scope record vanished")),
                };
                self.stack.push(value);
            }
            Opcode::StoreScoped => {
                let index = expect_index(op, 0)?;
                let value = self.stack.peek(0)?;
                let scope = self
                    .frames
                    .last()
                    .expect("frame checked above")
                    .scope
                    .clone();
                let (id, slot) = self.scoped_slot(&scope, index)?;
                match self.heap.get_mut(id) {
                    Some(Allocation::Array(slots)) => slots[slot] = value,
                    _ => return Err(RuntimeError::internal("scope record vanished")),
                }
            }
            Opcode::ScopePush => {
                let count = expect_count(op)?;
                let parent = self
                    .frames
                    .last()
                    .expect("frame checked above")
                    .scope
                    .clone();
                let mut slots = Vec::with_capacity(count as usize + 1);
                slots.push(parent);
                slots.resize(count as usize + 1, Value::Undefined);
                let id = self.heap.allocate(Allocation::Array(slots));
                self.frames.last_mut().expect("frame checked above").scope =
                    Value::Reference(id);
            }
            Opcode::ClosureNew => {
                let count = expect_count(op)?;
                let captured = self.stack.drain_top(count as usize)?;
                let scope = self
                    .frames
                    .last()
                    .expect("frame checked above")
                    .scope
                    .clone();
                let mut slots = Vec::with_capacity(count as usize + 1);
                slots.push(scope);
                slots.extend(captured);
                let id = self.heap.allocate(Allocation::Closure(slots));
                self.stack.push(Value::Reference(id));
            }
            Opcode::ObjectNew => {
                let id = self
                    .heap
                    .allocate(Allocation::Object(indexmap::IndexMap::new()));
                self.stack.push(Value::Reference(id));
            }
            Opcode::ArrayNew => {
                let id = self.heap.allocate(Allocation::Array(Vec::new()));
                self.stack.push(Value::Reference(id));
            }
            Opcode::ObjectGet => {
                let key = self.stack.pop()?;
                let object = self.stack.pop()?;
                let value = self.object_get(object, key)?;
                self.stack.push(value);
            }
            Opcode::ObjectSet => {
                let value = self.stack.pop()?;
                let key = self.stack.pop()?;
                let object = self.stack.pop()?;
                self.object_set(object, key, value)?;
            }
            Opcode::BinOp => {
                let rhs = self.stack.pop()?;
                let lhs = self.stack.pop()?;
                let result = ops::binary(expect_bin(op)?, &lhs, &rhs)?;
                self.stack.push(result);
            }
            Opcode::UnOp => {
                let operand = self.stack.pop()?;
                let result = ops::unary(expect_un(op)?, &operand)?;
                self.stack.push(result);
            }
            Opcode::Branch => {
                let condition = self.stack.pop()?;
                let target = if ops::is_truthy(&condition) {
                    expect_label(op, 0)?
                } else {
                    expect_label(op, 1)?
                };
                self.jump_to(target);
            }
            Opcode::Jump => {
                let target = expect_label(op, 0)?;
                self.jump_to(target);
            }
            Opcode::Call => {
                let count = expect_count(op)? as usize;
                let args = self.stack.drain_top(count)?;
                let callee = self.stack.pop()?;
                match callee {
                    Value::Function(id) => self.push_frame(id, args, Value::Undefined)?,
                    Value::Reference(id) => {
                        let (scope, target) = self.closure_parts(id)?;
                        self.push_frame(target, args, scope)?;
                    }
                    Value::HostFunction(id) => {
                        let f = self.resolve_host(id)?;
                        let result = f(self, &args[1..])?;
                        self.stack.push(result);
                    }
                    other => {
                        return Err(RuntimeError::NotCallable(other.type_name().to_string()));
                    }
                }
            }
            Opcode::Return => {
                let value = self.stack.pop()?;
                let frame = self
                    .frames
                    .pop()
                    .ok_or_else(|| RuntimeError::internal("return with no frame"))?;
                self.stack.truncate(frame.base);
                self.stack.push(value);
            }
            Opcode::Pop => {
                let count = expect_count(op)?;
                for _ in 0..count {
                    self.stack.pop()?;
                }
            }
            Opcode::Dup => {
                let value = self.stack.peek(0)?;
                self.stack.push(value);
            }
            Opcode::Nop => {}
        }
        Ok(())
    }

    fn jump_to(&mut self, target: BlockId) {
        let frame = self.frames.last_mut().expect("jump with no frame");
        frame.block = target;
        frame.op_index = 0;
    }

    /// Resolve a flattened closure-slot index against the scope chain.
    fn scoped_slot(&self, scope: &Value, index: u16) -> Result<(amber_il::AllocationId, usize)> {
        let mut current = scope.clone();
        let mut remaining = index as usize;
        loop {
            let Value::Reference(id) = current else {
                return Err(RuntimeError::internal(
                    "closure slot index escapes the scope chain",
                ));
            };
            let Some(Allocation::Array(slots)) = self.heap.get(id) else {
                return Err(RuntimeError::internal("scope record is not an array"));
            };
            let cells = slots.len().saturating_sub(1);
            if remaining < cells {
                return Ok((id, remaining + 1));
            }
            remaining -= cells;
            current = slots[0].clone();
        }
    }

    // =========================================================================
    // Property access
    // =========================================================================

    pub(crate) fn object_get(&self, object: Value, key: Value) -> Result<Value> {
        match object {
            Value::Reference(id) => match self.heap.get(id) {
                Some(Allocation::Object(properties)) => {
                    let key = ops::property_key(&key)?;
                    Ok(properties.get(&key).cloned().unwrap_or(Value::Undefined))
                }
                Some(Allocation::Array(elements)) => match key {
                    Value::Number(n) if n.fract() == 0.0 && n >= 0.0 => Ok(elements
                        .get(n as usize)
                        .cloned()
                        .unwrap_or(Value::Undefined)),
                    Value::String(ref s) if &**s == "length" => {
                        Ok(Value::Number(elements.len() as f64))
                    }
                    _ => Ok(Value::Undefined),
                },
                Some(Allocation::Closure(_)) => Ok(Value::Undefined),
                None => Err(RuntimeError::internal("property read on dead reference")),
            },
            Value::String(s) => match key {
                Value::String(ref k) if &**k == "length" => {
                    Ok(Value::Number(s.chars().count() as f64))
                }
                Value::Number(n) if n.fract() == 0.0 && n >= 0.0 => Ok(s
                    .chars()
                    .nth(n as usize)
                    .map(|c| Value::string(c.to_string()))
                    .unwrap_or(Value::Undefined)),
                _ => Ok(Value::Undefined),
            },
            other => Err(RuntimeError::type_error("object", other.type_name())),
        }
    }

    pub(crate) fn object_set(&mut self, object: Value, key: Value, value: Value) -> Result<()> {
        match object {
            Value::Reference(id) => match self.heap.get_mut(id) {
                Some(Allocation::Object(properties)) => {
                    let key = ops::property_key(&key)?;
                    properties.insert(key, value);
                    Ok(())
                }
                Some(Allocation::Array(elements)) => match key {
                    Value::Number(n) if n.fract() == 0.0 && n >= 0.0 => {
                        let index = n as usize;
                        if index >= elements.len() {
                            elements.resize(index + 1, Value::Undefined);
                        }
                        elements[index] = value;
                        Ok(())
                    }
                    Value::String(ref s) if &**s == "length" => {
                        let new_len = match value {
                            Value::Number(n) if n.fract() == 0.0 && n >= 0.0 => n as usize,
                            other => {
                                return Err(RuntimeError::type_error(
                                    "array length",
                                    other.type_name(),
                                ));
                            }
                        };
                        elements.resize(new_len, Value::Undefined);
                        Ok(())
                    }
                    other => Err(RuntimeError::type_error(
                        "array index",
                        other.type_name(),
                    )),
                },
                Some(Allocation::Closure(_)) => Err(RuntimeError::type_error(
                    "object",
                    "closure",
                )),
                None => Err(RuntimeError::internal("property write on dead reference")),
            },
            other => Err(RuntimeError::type_error("object", other.type_name())),
        }
    }
}

// =============================================================================
// Operand accessors
// =============================================================================

fn expect_count(op: &amber_il::Operation) -> Result<u16> {
    match op.operands.first() {
        Some(Operand::Count(n)) => Ok(*n),
        _ => Err(RuntimeError::internal(format!(
            "{} without a count operand",
            op.opcode
        ))),
    }
}

fn expect_index(op: &amber_il::Operation, position: usize) -> Result<u16> {
    match op.operands.get(position) {
        Some(Operand::Index(i)) => Ok(*i),
        _ => Err(RuntimeError::internal(format!(
            "{} without an index operand",
            op.opcode
        ))),
    }
}

fn expect_label(op: &amber_il::Operation, position: usize) -> Result<BlockId> {
    match op.operands.get(position) {
        Some(Operand::Label(id)) => Ok(*id),
        _ => Err(RuntimeError::internal(format!(
            "{} without a label operand",
            op.opcode
        ))),
    }
}

fn expect_literal(op: &amber_il::Operation) -> Result<&Value> {
    match op.operands.first() {
        Some(Operand::Literal(value)) => Ok(value),
        _ => Err(RuntimeError::internal(format!(
            "{} without a literal operand",
            op.opcode
        ))),
    }
}

fn expect_bin(op: &amber_il::Operation) -> Result<BinOp> {
    match op.operands.first() {
        Some(Operand::Bin(b)) => Ok(*b),
        _ => Err(RuntimeError::internal(format!(
            "{} without an operator operand",
            op.opcode
        ))),
    }
}

fn expect_un(op: &amber_il::Operation) -> Result<UnOp> {
    match op.operands.first() {
        Some(Operand::Un(u)) => Ok(*u),
        _ => Err(RuntimeError::internal(format!(
            "{} without an operator operand",
            op.opcode
        ))),
    }
}
