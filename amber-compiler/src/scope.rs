// amber-compiler - Scope analysis and IL lowering for the Amber scripting engine
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! The scope model: one record per lexical scope, one binding per declared
//! name, one reference per identifier use, one slot per binding.
//!
//! The model is produced by the two analysis passes in [`crate::analysis`]
//! and consumed read-only by code generation. Scopes and bindings live in
//! arenas indexed by [`ScopeId`]/[`BindingId`]; references are keyed by the
//! AST's `NodeId`s.

use indexmap::IndexMap;

use amber_ast::{NodeId, SourceLoc};

/// Arena index of a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(pub u32);

/// Arena index of a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindingId(pub u32);

/// What kind of declaration produced a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    Var,
    Let,
    Const,
    Param,
    This,
    Import,
}

/// Storage location of a binding, decided in analysis pass 2.
#[derive(Debug, Clone, PartialEq)]
pub enum Slot {
    /// Operand-stack position within the declaring function's frame.
    Local { index: u16 },
    /// Immutable incoming argument; 0 is `this`.
    Argument { arg_index: u16 },
    /// Entry in the declaring function's closure scope.
    Closure { index: u16 },
    /// Module-wide global slot, unique across the unit.
    Global { name: String },
    /// Property of another slot's namespace object (imports and exports).
    ModuleImportExport {
        namespace_slot: String,
        property: String,
    },
}

/// One declared name.
#[derive(Debug, Clone)]
pub struct Binding {
    pub id: BindingId,
    pub name: String,
    pub kind: BindingKind,
    /// The scope the name was declared under (post-hoisting).
    pub scope: ScopeId,
    pub loc: SourceLoc,
    /// Some reference assigns or updates this binding.
    pub is_written_to: bool,
    /// Some reference reaches this binding from a nested function.
    pub is_accessed_by_nested_function: bool,
    pub is_exported: bool,
    /// Assigned by pass 2; exactly one per binding afterwards.
    pub slot: Option<Slot>,
}

impl Binding {
    /// The slot, after pass 2. Panics only on a compiler bug.
    pub fn slot(&self) -> &Slot {
        self.slot
            .as_ref()
            .expect("binding has no slot before pass 2")
    }
}

/// Scope-initialization pseudo-ops, expanded into real IL by the code
/// generator at the owning scope's prologue.
#[derive(Debug, Clone)]
pub enum PrologueStep {
    /// Allocate the function's closure scope.
    ScopePush { slot_count: u16 },
    /// Materialize a hoisted `var` slot (undefined until its statement runs).
    InitVarDeclaration { binding: BindingId },
    /// Materialize a `let`/`const` slot at its block.
    InitLexicalDeclaration { binding: BindingId },
    /// Instantiate a declared function at its block, in textual order.
    InitFunctionDeclaration {
        binding: BindingId,
        function: NodeId,
    },
    /// Copy an incoming argument into its writable or captured slot.
    InitParameter { binding: BindingId, arg_index: u16 },
    /// Copy `this` into its captured slot.
    InitThis { binding: BindingId },
}

/// Lexical scope kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Module,
    Function,
    Block,
}

/// One lexical scope.
#[derive(Debug, Clone)]
pub struct Scope {
    pub id: ScopeId,
    pub kind: ScopeKind,
    pub parent: Option<ScopeId>,
    pub children: Vec<ScopeId>,
    /// Declared names, in declaration order.
    pub bindings: IndexMap<String, BindingId>,
    /// Hoisted `var`s declared under this function/module scope.
    pub var_declarations: Vec<BindingId>,
    /// `let`/`const` declared directly in this scope.
    pub lexical_declarations: Vec<BindingId>,
    /// Function declarations initialized at this scope's prologue.
    pub nested_function_declarations: Vec<BindingId>,
    /// Initialization steps the code generator runs on scope entry.
    pub prologue: Vec<PrologueStep>,
    /// Local stack slots to pop when a block scope closes.
    pub epilogue_pop_count: u16,
    /// Stack slots the construct keeps live while nested blocks run; a
    /// switch holds its discriminant below everything its cases allocate.
    pub child_local_offset: u16,

    // Function-scope fields; meaningless for block scopes.
    /// The `FunctionNode` this scope belongs to (None for the module scope).
    pub function_node: Option<NodeId>,
    /// True for arrows, which introduce no `this` binding.
    pub is_arrow: bool,
    pub parameter_bindings: Vec<BindingId>,
    pub this_binding: Option<BindingId>,
    /// Closure slots allocated for captured bindings of this function.
    pub closure_slot_count: u16,
    /// True when instantiating this function must bind the current scope
    /// chain (it reaches closure slots of an enclosing function).
    pub function_is_closure: bool,
}

impl Scope {
    pub(crate) fn new(id: ScopeId, kind: ScopeKind, parent: Option<ScopeId>) -> Self {
        Self {
            id,
            kind,
            parent,
            children: Vec::new(),
            bindings: IndexMap::new(),
            var_declarations: Vec::new(),
            lexical_declarations: Vec::new(),
            nested_function_declarations: Vec::new(),
            prologue: Vec::new(),
            epilogue_pop_count: 0,
            child_local_offset: 0,
            function_node: None,
            is_arrow: false,
            parameter_bindings: Vec::new(),
            this_binding: None,
            closure_slot_count: 0,
            function_is_closure: false,
        }
    }

    /// True for scopes that hoist `var`s and own local slot numbering.
    pub fn is_function_like(&self) -> bool {
        matches!(self.kind, ScopeKind::Module | ScopeKind::Function)
    }
}

/// What an identifier use resolved to.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Binding(BindingId),
    /// Escaped every scope; satisfied by a host global of this name.
    FreeVariable(String),
}

/// One identifier use.
#[derive(Debug, Clone)]
pub struct Reference {
    pub node: NodeId,
    pub name: String,
    pub loc: SourceLoc,
    pub resolution: Resolution,
    /// True for assignment and update references.
    pub is_write: bool,
    /// The scope the use occurred in.
    pub scope: ScopeId,
}

/// The analysed program: scope tree, bindings, and resolved references.
#[derive(Debug)]
pub struct ScopeModel {
    pub(crate) scopes: Vec<Scope>,
    pub(crate) bindings: Vec<Binding>,
    pub module_scope: ScopeId,
    /// Identifier-use resolutions, keyed by the identifier's node id.
    pub references: IndexMap<NodeId, Reference>,
    /// Declarator identifier node id to the binding it declares, for
    /// initializer stores at declaration sites.
    pub declaration_bindings: IndexMap<NodeId, BindingId>,
    /// Function node id to its function scope.
    pub function_scopes: IndexMap<NodeId, ScopeId>,
    /// Block-like statement node id to its block scope.
    pub block_scopes: IndexMap<NodeId, ScopeId>,
    /// `{slot, specifier}` per imported module, in first-import order.
    pub module_imports: Vec<(String, String)>,
    /// Global slot names owned by the module, in allocation order.
    pub module_variables: Vec<String>,
    /// Names that resolve outside the module.
    pub free_variables: Vec<String>,
    /// The global slot holding this module's namespace object.
    pub this_module_slot: String,
}

impl ScopeModel {
    pub fn scope(&self, id: ScopeId) -> &Scope {
        &self.scopes[id.0 as usize]
    }

    pub fn binding(&self, id: BindingId) -> &Binding {
        &self.bindings[id.0 as usize]
    }

    pub(crate) fn scope_mut(&mut self, id: ScopeId) -> &mut Scope {
        &mut self.scopes[id.0 as usize]
    }

    pub(crate) fn binding_mut(&mut self, id: BindingId) -> &mut Binding {
        &mut self.bindings[id.0 as usize]
    }

    /// The chain of enclosing function/module scopes starting at `scope`,
    /// innermost first. Used for closure-slot index arithmetic.
    pub fn function_chain(&self, scope: ScopeId) -> Vec<ScopeId> {
        let mut chain = Vec::new();
        let mut cursor = Some(scope);
        while let Some(id) = cursor {
            let s = self.scope(id);
            if s.is_function_like() {
                chain.push(id);
            }
            cursor = s.parent;
        }
        chain
    }

    /// The function/module scope a binding belongs to.
    pub fn owning_function(&self, binding: BindingId) -> ScopeId {
        self.function_chain(self.binding(binding).scope)[0]
    }
}
