// amber-vm - Host-side virtual machine for the Amber scripting engine
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! The `Vm` type and its host-facing API.
//!
//! A `Vm` loads compiled units, runs each module's entry function so
//! initialization side effects settle, and then hands its live graph to the
//! snapshot encoder. It can equally be rebuilt from a decoded snapshot and
//! continue calling exported functions.
//!
//! # Thread safety
//!
//! `Vm` is NOT thread-safe; it uses `Rc` internally. Use one `Vm` per thread.

use std::rc::Rc;

use indexmap::IndexMap;

use amber_ast::Program;
use amber_il::{Function, FunctionId, HostFunctionId, Operand, Unit, Value};

use crate::error::{Result, RuntimeError};
use crate::frame::CallFrame;
use crate::heap::{Allocation, Heap};
use crate::snapshot_info::SnapshotInfo;
use crate::stack::ValueStack;

/// A host function callable from script.
///
/// Receives the arguments after `this`. May call back into the VM.
pub type HostFn = Rc<dyn Fn(&mut Vm, &[Value]) -> Result<Value>>;

/// Resolver consulted for host function ids with no registered entry.
pub type ImportResolver = Rc<dyn Fn(HostFunctionId) -> Option<HostFn>>;

/// Reserved id of the built-in `vmExport` host function.
pub const VM_EXPORT_HOST_ID: HostFunctionId = HostFunctionId(0xFFFF);

const DEFAULT_MAX_CALL_DEPTH: usize = 1000;

/// The Amber host-side virtual machine.
pub struct Vm {
    pub(crate) heap: Heap,
    pub(crate) globals: IndexMap<String, Value>,
    /// Every loaded function with the unit it came from, indexed by the
    /// VM-global function id.
    pub(crate) functions: Vec<(Rc<Function>, usize)>,
    /// Per-unit map from unit-local to VM-global function ids.
    pub(crate) unit_remaps: Vec<IndexMap<FunctionId, FunctionId>>,
    pub(crate) stack: ValueStack,
    pub(crate) frames: Vec<CallFrame>,
    pub(crate) exports: IndexMap<u16, Value>,
    pub(crate) host_functions: IndexMap<HostFunctionId, HostFn>,
    import_resolver: Option<ImportResolver>,
    /// Namespace objects for resolvable module specifiers.
    modules: IndexMap<String, Value>,
    max_call_depth: usize,
}

impl Vm {
    /// Create a VM with the built-in `vmExport` host global installed.
    pub fn new() -> Self {
        let mut vm = Self {
            heap: Heap::new(),
            globals: IndexMap::new(),
            functions: Vec::new(),
            unit_remaps: Vec::new(),
            stack: ValueStack::new(),
            frames: Vec::new(),
            exports: IndexMap::new(),
            host_functions: IndexMap::new(),
            import_resolver: None,
            modules: IndexMap::new(),
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
        };
        vm.register_host_function(
            "vmExport",
            VM_EXPORT_HOST_ID,
            Rc::new(|vm, args| {
                let id = match args.first() {
                    Some(Value::Number(n))
                        if n.fract() == 0.0 && (0.0..=65535.0).contains(n) =>
                    {
                        *n as u16
                    }
                    other => {
                        return Err(RuntimeError::InvalidOperation(format!(
                            "vmExport requires a 16-bit export id, got {}",
                            other.map(|v| v.type_name()).unwrap_or("nothing")
                        )));
                    }
                };
                let value = args.get(1).cloned().unwrap_or(Value::Undefined);
                vm.export_value(id, value);
                Ok(Value::Undefined)
            }),
        );
        vm
    }

    /// Maximum call depth; returns the previous value.
    pub fn set_max_call_depth(&mut self, depth: usize) -> usize {
        std::mem::replace(&mut self.max_call_depth, depth)
    }

    pub(crate) fn max_call_depth(&self) -> usize {
        self.max_call_depth
    }

    // =========================================================================
    // Host functions and modules
    // =========================================================================

    /// Register a host function under a global name and a stable id.
    pub fn register_host_function(&mut self, name: &str, id: HostFunctionId, f: HostFn) {
        self.host_functions.insert(id, f);
        self.globals
            .insert(name.to_string(), Value::HostFunction(id));
    }

    /// Register a host function by id only, as the import table does on a
    /// restored VM.
    pub fn register_host_function_by_id(&mut self, id: HostFunctionId, f: HostFn) {
        self.host_functions.insert(id, f);
    }

    /// Install a resolver consulted for unregistered host function ids.
    pub fn set_import_resolver(&mut self, resolver: ImportResolver) {
        self.import_resolver = Some(resolver);
    }

    /// Resolve a host function id to a callable value.
    pub fn import_host_function(&mut self, id: HostFunctionId) -> Result<Value> {
        self.resolve_host(id)?;
        Ok(Value::HostFunction(id))
    }

    pub(crate) fn resolve_host(&mut self, id: HostFunctionId) -> Result<HostFn> {
        if let Some(f) = self.host_functions.get(&id) {
            return Ok(f.clone());
        }
        if let Some(resolver) = &self.import_resolver {
            if let Some(f) = resolver(id) {
                self.host_functions.insert(id, f.clone());
                return Ok(f);
            }
        }
        Err(RuntimeError::InvalidOperation(format!(
            "unresolved host function {}",
            id
        )))
    }

    /// Make a module's namespace object importable under a specifier.
    pub fn register_module(&mut self, specifier: &str, namespace: Value) {
        self.modules.insert(specifier.to_string(), namespace);
    }

    // =========================================================================
    // Exports
    // =========================================================================

    /// Publish a value to the host. This is what the `vmExport` builtin
    /// calls.
    pub fn export_value(&mut self, export_id: u16, value: Value) {
        self.exports.insert(export_id, value);
    }

    /// Look up a previously exported value.
    pub fn resolve_export(&self, export_id: u16) -> Result<Value> {
        self.exports.get(&export_id).cloned().ok_or_else(|| {
            RuntimeError::InvalidOperation(format!("no export with id {}", export_id))
        })
    }

    // =========================================================================
    // Module evaluation
    // =========================================================================

    /// Compile a module and run its entry function. Returns the module's
    /// namespace object.
    pub fn evaluate_module(&mut self, program: &Program) -> Result<Value> {
        let unit = amber_compiler::compile(program)
            .map_err(|e| RuntimeError::Compile(e.to_string()))?;
        self.evaluate_unit(&unit)
    }

    /// Load an already-compiled unit and run its entry function.
    pub fn evaluate_unit(&mut self, unit: &Unit) -> Result<Value> {
        let unit_index = self.load_unit(unit)?;
        let namespace = Value::Reference(self.heap.allocate(Allocation::Object(IndexMap::new())));
        let entry = *self.unit_remaps[unit_index]
            .get(&unit.entry_function_id)
            .ok_or_else(|| RuntimeError::internal("entry function missing from remap"))?;
        self.run_function(entry, vec![namespace.clone()], Value::Undefined)?;
        tracing::debug!(
            unit = %unit.source_filename,
            functions = unit.functions.len(),
            heap = self.heap.len(),
            "module initialized"
        );
        Ok(namespace)
    }

    fn load_unit(&mut self, unit: &Unit) -> Result<usize> {
        let unit_index = self.unit_remaps.len();
        let mut remap = IndexMap::new();
        for (local, function) in &unit.functions {
            let global = u16::try_from(self.functions.len())
                .map_err(|_| RuntimeError::internal("too many functions loaded"))?;
            remap.insert(*local, FunctionId(global));
            self.functions
                .push((Rc::new(function.clone()), unit_index));
        }
        self.unit_remaps.push(remap);

        for name in &unit.module_variables {
            self.globals.entry(name.clone()).or_insert(Value::Undefined);
        }
        for import in &unit.module_imports {
            let namespace = self.modules.get(&import.specifier).cloned().ok_or_else(|| {
                RuntimeError::InvalidOperation(format!(
                    "no module registered for specifier '{}'",
                    import.specifier
                ))
            })?;
            self.globals.insert(import.slot.clone(), namespace);
        }
        Ok(unit_index)
    }

    /// Call a callable value with `this = undefined`.
    pub fn call(&mut self, callee: Value, args: &[Value]) -> Result<Value> {
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push(Value::Undefined);
        full.extend_from_slice(args);
        self.run_call(callee, full)
    }

    // =========================================================================
    // Heap helpers
    // =========================================================================

    /// Allocate an empty object and return its reference.
    pub fn new_object(&mut self) -> Value {
        Value::Reference(self.heap.allocate(Allocation::Object(IndexMap::new())))
    }

    /// Number of live heap allocations.
    pub fn heap_len(&self) -> usize {
        self.heap.len()
    }

    /// Read a property of an object value, as `ObjectGet` would.
    pub fn get_property(&self, object: &Value, key: &str) -> Result<Value> {
        self.object_get(object.clone(), Value::string(key))
    }

    /// Write a property of an object value, as `ObjectSet` would.
    pub fn set_property(&mut self, object: &Value, key: &str, value: Value) -> Result<()> {
        self.object_set(object.clone(), Value::string(key), value)
    }

    /// Render a value for host-side printing. Arrays join their elements;
    /// objects render opaquely.
    pub fn to_display_string(&self, value: &Value) -> String {
        match value {
            Value::Reference(id) => match self.heap.get(*id) {
                Some(Allocation::Array(elements)) => elements
                    .iter()
                    .map(|e| self.to_display_string(e))
                    .collect::<Vec<_>>()
                    .join(","),
                Some(Allocation::Object(_)) => "[object Object]".to_string(),
                Some(Allocation::Closure(_)) => "[function]".to_string(),
                None => "[dead reference]".to_string(),
            },
            other => crate::ops::to_string_value(other),
        }
    }

    // =========================================================================
    // Garbage collection
    // =========================================================================

    /// Mark from globals, exports and any live frames; sweep the rest.
    pub fn garbage_collect(&mut self) {
        let mut worklist: Vec<Value> = Vec::new();
        worklist.extend(self.globals.values().cloned());
        worklist.extend(self.exports.values().cloned());
        worklist.extend(self.stack.values().iter().cloned());
        for frame in &self.frames {
            worklist.extend(frame.args.iter().cloned());
            worklist.push(frame.scope.clone());
        }

        let mut reachable = std::collections::HashSet::new();
        while let Some(value) = worklist.pop() {
            if let Value::Reference(id) = value {
                if reachable.insert(id) {
                    if let Some(allocation) = self.heap.get(id) {
                        worklist.extend(allocation.slots().cloned());
                    }
                }
            }
        }

        let before = self.heap.len();
        self.heap.retain(|id| reachable.contains(&id));
        tracing::debug!(
            collected = before - self.heap.len(),
            live = self.heap.len(),
            "garbage collected"
        );
    }

    // =========================================================================
    // Snapshotting
    // =========================================================================

    /// Capture the live graph for the snapshot encoder. Function-literal
    /// operands are remapped to VM-global ids so the encoder never sees
    /// unit-local numbering.
    pub fn create_snapshot_info(&self) -> Result<SnapshotInfo> {
        let mut functions = IndexMap::new();
        for (index, (function, unit)) in self.functions.iter().enumerate() {
            let id = FunctionId(index as u16);
            let mut il = (**function).clone();
            il.id = id;
            for block in il.blocks.values_mut() {
                for op in &mut block.operations {
                    for operand in &mut op.operands {
                        if let Operand::Literal(Value::Function(local)) = operand {
                            let global = self.unit_remaps[*unit].get(local).ok_or_else(|| {
                                RuntimeError::internal("function literal missing from remap")
                            })?;
                            *operand = Operand::Literal(Value::Function(*global));
                        }
                    }
                }
            }
            functions.insert(id, il);
        }
        Ok(SnapshotInfo {
            globals: self
                .globals
                .iter()
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
            allocations: self.heap.snapshot(),
            functions,
            exports: self.exports.clone(),
        })
    }

    /// Rebuild a VM from a decoded snapshot and continue executing.
    ///
    /// Host functions must be re-registered by id (the import table is the
    /// contract between the image and its host).
    pub fn restore(info: SnapshotInfo) -> Result<Self> {
        let mut vm = Vm::new();
        vm.heap = Heap::from_allocations(info.allocations);
        vm.globals = info.globals.into_iter().collect();
        let mut remap = IndexMap::new();
        for (index, (id, function)) in info.functions.into_iter().enumerate() {
            if id.0 as usize != index {
                return Err(RuntimeError::internal(
                    "restored function ids are not dense",
                ));
            }
            remap.insert(id, id);
            vm.functions.push((Rc::new(function), 0));
        }
        vm.unit_remaps.push(remap);
        vm.exports = info.exports;
        Ok(vm)
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}
