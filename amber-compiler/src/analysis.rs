// amber-compiler - Scope analysis and IL lowering for the Amber scripting engine
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! Two-pass scope analysis.
//!
//! Pass 1 builds the scope tree, declares every binding under the narrowest
//! scope its kind permits (`var` and function declarations hoist to the
//! enclosing function, `let`/`const` stay in their block), resolves every
//! identifier use lexically outward, and marks bindings that are written to
//! or reached from a nested function.
//!
//! Pass 2 assigns each binding exactly one slot: module-level bindings become
//! namespace properties (imports/exports) or unique global slots (captured),
//! everything else becomes an argument, closure or operand-stack slot, with
//! the initialization pseudo-ops recorded on the owning scope's prologue.

use indexmap::{IndexMap, IndexSet};

use amber_ast::{
    DeclKind, Expr, ExprKind, ForInit, FunctionBody, FunctionNode, Identifier, MemberProperty,
    NodeId, Program, SourceLoc, Stmt, StmtKind,
};

use crate::error::{CompileError, Result};
use crate::scope::{
    Binding, BindingId, BindingKind, PrologueStep, Reference, Resolution, Scope, ScopeId,
    ScopeKind, ScopeModel, Slot,
};

/// Run both passes over a program.
pub fn analyse(program: &Program) -> Result<ScopeModel> {
    let mut analyser = Analyser::new();
    analyser.pass1(program)?;
    analyser.pass2()?;
    let model = analyser.finish();
    tracing::debug!(
        scopes = model.scopes.len(),
        bindings = model.bindings.len(),
        references = model.references.len(),
        free_variables = model.free_variables.len(),
        "scope analysis complete"
    );
    Ok(model)
}

struct Analyser {
    scopes: Vec<Scope>,
    bindings: Vec<Binding>,
    references: IndexMap<NodeId, Reference>,
    function_scopes: IndexMap<NodeId, ScopeId>,
    block_scopes: IndexMap<NodeId, ScopeId>,
    /// Hoisted function-declaration binding to its `FunctionNode` id.
    function_decl_nodes: IndexMap<BindingId, NodeId>,
    /// Declarator identifier node to the binding it declares.
    declaration_bindings: IndexMap<NodeId, BindingId>,
    /// specifier -> [(binding, imported name)], in first-import order.
    imports: IndexMap<String, Vec<(BindingId, String)>>,
    free_variables: IndexSet<String>,
    /// Scopes `this` was used from; `this` has no node id of its own.
    this_uses: Vec<ScopeId>,
    scope_stack: Vec<ScopeId>,

    // Pass 2 results.
    module_imports: Vec<(String, String)>,
    module_variables: Vec<String>,
    this_module_slot: String,
    used_global_names: IndexSet<String>,
}

impl Analyser {
    fn new() -> Self {
        Self {
            scopes: Vec::new(),
            bindings: Vec::new(),
            references: IndexMap::new(),
            function_scopes: IndexMap::new(),
            block_scopes: IndexMap::new(),
            function_decl_nodes: IndexMap::new(),
            declaration_bindings: IndexMap::new(),
            imports: IndexMap::new(),
            free_variables: IndexSet::new(),
            this_uses: Vec::new(),
            scope_stack: Vec::new(),
            module_imports: Vec::new(),
            module_variables: Vec::new(),
            this_module_slot: String::new(),
            used_global_names: IndexSet::new(),
        }
    }

    fn finish(self) -> ScopeModel {
        ScopeModel {
            scopes: self.scopes,
            bindings: self.bindings,
            module_scope: ScopeId(0),
            references: self.references,
            declaration_bindings: self.declaration_bindings,
            function_scopes: self.function_scopes,
            block_scopes: self.block_scopes,
            module_imports: self.module_imports,
            module_variables: self.module_variables,
            free_variables: self.free_variables.into_iter().collect(),
            this_module_slot: self.this_module_slot,
        }
    }

    // =========================================================================
    // Scope and binding plumbing
    // =========================================================================

    fn new_scope(&mut self, kind: ScopeKind, parent: Option<ScopeId>) -> ScopeId {
        let id = ScopeId(self.scopes.len() as u32);
        self.scopes.push(Scope::new(id, kind, parent));
        if let Some(parent) = parent {
            self.scopes[parent.0 as usize].children.push(id);
        }
        id
    }

    fn scope(&self, id: ScopeId) -> &Scope {
        &self.scopes[id.0 as usize]
    }

    fn scope_mut(&mut self, id: ScopeId) -> &mut Scope {
        &mut self.scopes[id.0 as usize]
    }

    fn binding(&self, id: BindingId) -> &Binding {
        &self.bindings[id.0 as usize]
    }

    fn binding_mut(&mut self, id: BindingId) -> &mut Binding {
        &mut self.bindings[id.0 as usize]
    }

    fn current_scope(&self) -> ScopeId {
        *self.scope_stack.last().expect("scope stack is empty")
    }

    fn declare(
        &mut self,
        scope: ScopeId,
        name: &str,
        kind: BindingKind,
        loc: SourceLoc,
    ) -> Result<BindingId> {
        if self.scope(scope).bindings.contains_key(name) {
            return Err(CompileError::DuplicateBinding {
                name: name.to_string(),
                loc,
            });
        }
        let id = BindingId(self.bindings.len() as u32);
        self.bindings.push(Binding {
            id,
            name: name.to_string(),
            kind,
            scope,
            loc,
            is_written_to: false,
            is_accessed_by_nested_function: false,
            is_exported: false,
            slot: None,
        });
        self.scope_mut(scope).bindings.insert(name.to_string(), id);
        Ok(id)
    }

    // =========================================================================
    // Pass 1
    // =========================================================================

    fn pass1(&mut self, program: &Program) -> Result<()> {
        let module = self.new_scope(ScopeKind::Module, None);
        self.scope_stack.push(module);
        self.hoist_into(module, &program.body, false)?;
        self.declare_lexicals(module, &program.body, false)?;
        for stmt in &program.body {
            self.walk_stmt(stmt)?;
        }
        self.scope_stack.pop();
        Ok(())
    }

    /// Hoisting walk: register `var` and function declarations under the
    /// enclosing function/module scope. Descends into nested statements but
    /// never into nested function bodies.
    fn hoist_into(&mut self, target: ScopeId, stmts: &[Stmt], exported: bool) -> Result<()> {
        for stmt in stmts {
            self.hoist_stmt(target, stmt, exported)?;
        }
        Ok(())
    }

    fn hoist_stmt(&mut self, target: ScopeId, stmt: &Stmt, exported: bool) -> Result<()> {
        match &stmt.kind {
            StmtKind::VariableDeclaration {
                kind: DeclKind::Var,
                declarations,
            } => {
                for declarator in declarations {
                    let id = self.declare(
                        target,
                        &declarator.id.name,
                        BindingKind::Var,
                        declarator.loc,
                    )?;
                    self.binding_mut(id).is_exported = exported;
                    self.scope_mut(target).var_declarations.push(id);
                    self.declaration_bindings.insert(declarator.id.id, id);
                }
            }
            StmtKind::FunctionDeclaration(node) => {
                let name = match &node.name {
                    Some(name) => name.name.clone(),
                    None => {
                        return Err(CompileError::internal(
                            "function declaration without a name",
                        ));
                    }
                };
                let id = self.declare(target, &name, BindingKind::Var, node.loc)?;
                self.binding_mut(id).is_exported = exported;
                self.scope_mut(target).var_declarations.push(id);
                self.function_decl_nodes.insert(id, node.id);
            }
            StmtKind::Block(body) => self.hoist_into(target, body, false)?,
            StmtKind::If {
                consequent,
                alternate,
                ..
            } => {
                self.hoist_stmt(target, consequent, false)?;
                if let Some(alternate) = alternate {
                    self.hoist_stmt(target, alternate, false)?;
                }
            }
            StmtKind::While { body, .. } | StmtKind::DoWhile { body, .. } => {
                self.hoist_stmt(target, body, false)?;
            }
            StmtKind::For { init, body, .. } => {
                if let Some(ForInit::Declaration {
                    kind: DeclKind::Var,
                    declarations,
                }) = init
                {
                    for declarator in declarations {
                        let id = self.declare(
                            target,
                            &declarator.id.name,
                            BindingKind::Var,
                            declarator.loc,
                        )?;
                        self.scope_mut(target).var_declarations.push(id);
                        self.declaration_bindings.insert(declarator.id.id, id);
                    }
                }
                self.hoist_stmt(target, body, false)?;
            }
            StmtKind::Switch { cases, .. } => {
                for case in cases {
                    self.hoist_into(target, &case.consequent, false)?;
                }
            }
            StmtKind::ExportNamedDeclaration(inner) => {
                self.hoist_stmt(target, inner, true)?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Register `let`/`const` and imports declared directly in a scope, so
    /// uses earlier in the block still resolve to them.
    fn declare_lexicals(&mut self, scope: ScopeId, stmts: &[Stmt], exported: bool) -> Result<()> {
        for stmt in stmts {
            match &stmt.kind {
                StmtKind::VariableDeclaration {
                    kind: kind @ (DeclKind::Let | DeclKind::Const),
                    declarations,
                } => {
                    let binding_kind = match kind {
                        DeclKind::Let => BindingKind::Let,
                        _ => BindingKind::Const,
                    };
                    for declarator in declarations {
                        let id = self.declare(
                            scope,
                            &declarator.id.name,
                            binding_kind,
                            declarator.loc,
                        )?;
                        self.binding_mut(id).is_exported = exported;
                        self.scope_mut(scope).lexical_declarations.push(id);
                        self.declaration_bindings.insert(declarator.id.id, id);
                    }
                }
                StmtKind::ImportDeclaration { specifiers, source } => {
                    for specifier in specifiers {
                        let id = self.declare(
                            scope,
                            &specifier.local.name,
                            BindingKind::Import,
                            specifier.loc,
                        )?;
                        self.imports
                            .entry(source.clone())
                            .or_default()
                            .push((id, specifier.imported.clone()));
                    }
                }
                StmtKind::ExportNamedDeclaration(inner) => {
                    self.declare_lexicals(scope, std::slice::from_ref(&**inner), true)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn walk_stmt(&mut self, stmt: &Stmt) -> Result<()> {
        match &stmt.kind {
            StmtKind::Expression(expr) => self.walk_expr(expr)?,
            StmtKind::VariableDeclaration { declarations, .. } => {
                for declarator in declarations {
                    if let Some(init) = &declarator.init {
                        self.walk_expr(init)?;
                    }
                }
            }
            StmtKind::FunctionDeclaration(node) => {
                // The binding was hoisted; the initialization site stays in
                // the scope the declaration appears in, in textual order.
                let scope = self.current_scope();
                let name = node.name.as_ref().map(|n| n.name.as_str()).unwrap_or("");
                let binding = self.resolve_declared(name)?;
                self.scope_mut(scope)
                    .nested_function_declarations
                    .push(binding);
                self.walk_function(node)?;
            }
            StmtKind::Block(body) => {
                let scope = self.enter_block(stmt.id);
                self.declare_lexicals(scope, body, false)?;
                for inner in body {
                    self.walk_stmt(inner)?;
                }
                self.scope_stack.pop();
            }
            StmtKind::If {
                test,
                consequent,
                alternate,
            } => {
                self.walk_expr(test)?;
                self.walk_stmt(consequent)?;
                if let Some(alternate) = alternate {
                    self.walk_stmt(alternate)?;
                }
            }
            StmtKind::While { test, body } => {
                self.walk_expr(test)?;
                self.walk_stmt(body)?;
            }
            StmtKind::DoWhile { body, test } => {
                self.walk_stmt(body)?;
                self.walk_expr(test)?;
            }
            StmtKind::For {
                init,
                test,
                update,
                body,
            } => {
                let scope = self.enter_block(stmt.id);
                match init {
                    Some(ForInit::Declaration {
                        kind: kind @ (DeclKind::Let | DeclKind::Const),
                        declarations,
                    }) => {
                        let binding_kind = match kind {
                            DeclKind::Let => BindingKind::Let,
                            _ => BindingKind::Const,
                        };
                        for declarator in declarations {
                            let id = self.declare(
                                scope,
                                &declarator.id.name,
                                binding_kind,
                                declarator.loc,
                            )?;
                            self.scope_mut(scope).lexical_declarations.push(id);
                            self.declaration_bindings.insert(declarator.id.id, id);
                        }
                        for declarator in declarations {
                            if let Some(init_expr) = &declarator.init {
                                self.walk_expr(init_expr)?;
                            }
                        }
                    }
                    Some(ForInit::Declaration { declarations, .. }) => {
                        // `var` init: binding already hoisted.
                        for declarator in declarations {
                            if let Some(init_expr) = &declarator.init {
                                self.walk_expr(init_expr)?;
                            }
                        }
                    }
                    Some(ForInit::Expression(expr)) => self.walk_expr(expr)?,
                    None => {}
                }
                if let Some(test) = test {
                    self.walk_expr(test)?;
                }
                if let Some(update) = update {
                    self.walk_expr(update)?;
                }
                self.walk_stmt(body)?;
                self.scope_stack.pop();
            }
            StmtKind::Switch {
                discriminant,
                cases,
            } => {
                self.walk_expr(discriminant)?;
                let scope = self.enter_block(stmt.id);
                // The discriminant stays on the stack through the cases, so
                // blocks nested in them allocate locals one slot higher.
                self.scope_mut(scope).child_local_offset = 1;
                for case in cases {
                    self.declare_lexicals(scope, &case.consequent, false)?;
                }
                for case in cases {
                    if let Some(test) = &case.test {
                        self.walk_expr(test)?;
                    }
                    for inner in &case.consequent {
                        self.walk_stmt(inner)?;
                    }
                }
                self.scope_stack.pop();
            }
            StmtKind::Break | StmtKind::Empty => {}
            StmtKind::Return(value) => {
                if let Some(value) = value {
                    self.walk_expr(value)?;
                }
            }
            StmtKind::ImportDeclaration { .. } => {}
            StmtKind::ExportNamedDeclaration(inner) => self.walk_stmt(inner)?,
        }
        Ok(())
    }

    fn enter_block(&mut self, node: NodeId) -> ScopeId {
        let parent = self.current_scope();
        let scope = self.new_scope(ScopeKind::Block, Some(parent));
        self.block_scopes.insert(node, scope);
        self.scope_stack.push(scope);
        scope
    }

    fn walk_function(&mut self, node: &FunctionNode) -> Result<()> {
        if node.is_async {
            return Err(CompileError::FeatureNotSupported {
                feature: "async functions".to_string(),
                loc: node.loc,
            });
        }
        let parent = self.current_scope();
        let scope = self.new_scope(ScopeKind::Function, Some(parent));
        self.function_scopes.insert(node.id, scope);
        {
            let s = self.scope_mut(scope);
            s.function_node = Some(node.id);
            s.is_arrow = node.is_arrow;
        }
        self.scope_stack.push(scope);

        if !node.is_arrow {
            let this = self.declare(scope, "this", BindingKind::This, node.loc)?;
            self.scope_mut(scope).this_binding = Some(this);
        }
        for param in &node.params {
            let id = self.declare(scope, &param.name, BindingKind::Param, param.loc)?;
            self.scope_mut(scope).parameter_bindings.push(id);
        }

        match &node.body {
            FunctionBody::Block(body) => {
                self.hoist_into(scope, body, false)?;
                self.declare_lexicals(scope, body, false)?;
                for stmt in body {
                    self.walk_stmt(stmt)?;
                }
            }
            FunctionBody::Expression(expr) => self.walk_expr(expr)?,
        }

        self.scope_stack.pop();
        Ok(())
    }

    fn walk_expr(&mut self, expr: &Expr) -> Result<()> {
        match &expr.kind {
            ExprKind::Identifier(ident) => self.resolve_reference(ident, false),
            ExprKind::Literal(_) => Ok(()),
            ExprKind::TemplateLiteral { expressions, .. } => {
                for e in expressions {
                    self.walk_expr(e)?;
                }
                Ok(())
            }
            ExprKind::This => {
                self.this_uses.push(self.current_scope());
                self.mark_this_capture();
                Ok(())
            }
            ExprKind::Array(elements) => {
                for e in elements {
                    self.walk_expr(e)?;
                }
                Ok(())
            }
            ExprKind::Object(properties) => {
                for p in properties {
                    self.walk_expr(&p.value)?;
                }
                Ok(())
            }
            ExprKind::Function(node) => self.walk_function(node),
            ExprKind::Unary { argument, .. } => self.walk_expr(argument),
            ExprKind::Update { argument, .. } => {
                if let ExprKind::Identifier(ident) = &argument.kind {
                    self.resolve_reference(ident, true)
                } else {
                    self.walk_expr(argument)
                }
            }
            ExprKind::Binary { left, right, .. } | ExprKind::Logical { left, right, .. } => {
                self.walk_expr(left)?;
                self.walk_expr(right)
            }
            ExprKind::Assignment { target, value, .. } => {
                if let ExprKind::Identifier(ident) = &target.kind {
                    self.resolve_reference(ident, true)?;
                } else {
                    self.walk_expr(target)?;
                }
                self.walk_expr(value)
            }
            ExprKind::Conditional {
                test,
                consequent,
                alternate,
            } => {
                self.walk_expr(test)?;
                self.walk_expr(consequent)?;
                self.walk_expr(alternate)
            }
            ExprKind::Call { callee, arguments } => {
                self.walk_expr(callee)?;
                for a in arguments {
                    self.walk_expr(a)?;
                }
                Ok(())
            }
            ExprKind::Member { object, property } => {
                self.walk_expr(object)?;
                if let MemberProperty::Computed(key) = property {
                    self.walk_expr(key)?;
                }
                Ok(())
            }
        }
    }

    /// Resolve one identifier use lexically outward, recording a reference
    /// and flagging captures and writes on the binding it lands on.
    fn resolve_reference(&mut self, ident: &Identifier, is_write: bool) -> Result<()> {
        // `undefined` is a literal, not a binding.
        if ident.name == "undefined" {
            return Ok(());
        }
        let use_scope = self.current_scope();
        let mut crossed_function = false;
        let mut cursor = Some(use_scope);
        let mut found = None;
        while let Some(id) = cursor {
            if let Some(&binding) = self.scope(id).bindings.get(&ident.name) {
                found = Some(binding);
                break;
            }
            let scope = self.scope(id);
            if scope.kind == ScopeKind::Function {
                crossed_function = true;
            }
            cursor = scope.parent;
        }

        let resolution = match found {
            Some(binding) => {
                if crossed_function {
                    self.binding_mut(binding).is_accessed_by_nested_function = true;
                }
                if is_write {
                    self.binding_mut(binding).is_written_to = true;
                }
                Resolution::Binding(binding)
            }
            None => {
                self.free_variables.insert(ident.name.clone());
                Resolution::FreeVariable(ident.name.clone())
            }
        };

        self.references.insert(
            ident.id,
            Reference {
                node: ident.id,
                name: ident.name.clone(),
                loc: ident.loc,
                resolution,
                is_write,
                scope: use_scope,
            },
        );
        Ok(())
    }

    /// Mark the nearest non-arrow `this` binding as captured when the use
    /// crosses at least one function boundary on the way to it.
    fn mark_this_capture(&mut self) {
        let mut crossed_function = false;
        let mut cursor = Some(self.current_scope());
        while let Some(id) = cursor {
            let scope = self.scope(id);
            if scope.kind == ScopeKind::Function && !scope.is_arrow {
                if crossed_function {
                    if let Some(this) = scope.this_binding {
                        self.binding_mut(this).is_accessed_by_nested_function = true;
                    }
                }
                return;
            }
            if scope.kind == ScopeKind::Function {
                crossed_function = true;
            }
            cursor = scope.parent;
        }
        // Escaped to module level: `this` is undefined there, nothing to mark.
    }

    /// Find an already-declared binding by resolving from the current scope.
    fn resolve_declared(&self, name: &str) -> Result<BindingId> {
        let mut cursor = Some(self.current_scope());
        while let Some(id) = cursor {
            if let Some(&binding) = self.scope(id).bindings.get(name) {
                return Ok(binding);
            }
            cursor = self.scope(id).parent;
        }
        Err(CompileError::internal(format!(
            "hoisted binding '{}' not found during walk",
            name
        )))
    }

    // =========================================================================
    // Pass 2
    // =========================================================================

    fn pass2(&mut self) -> Result<()> {
        let free: Vec<String> = self.free_variables.iter().cloned().collect();
        for name in free {
            self.used_global_names.insert(name);
        }

        self.this_module_slot = self.allocate_global("thisModule");

        // One namespace slot per imported module, in first-import order.
        let imports: Vec<(String, Vec<(BindingId, String)>)> = self
            .imports
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (specifier, entries) in imports {
            let slot = self.allocate_global(&namespace_hint(&specifier));
            self.module_imports.push((slot.clone(), specifier));
            for (binding, imported) in entries {
                self.binding_mut(binding).slot = Some(Slot::ModuleImportExport {
                    namespace_slot: slot.clone(),
                    property: imported,
                });
            }
        }

        // Module-level bindings: namespace property, global slot, or fall
        // through to entry-function-local treatment below.
        let module = ScopeId(0);
        let module_bindings: Vec<BindingId> =
            self.scope(module).bindings.values().copied().collect();
        for id in module_bindings {
            let binding = self.binding(id);
            if binding.slot.is_some() {
                continue; // imports, handled above
            }
            if binding.is_exported {
                let slot = Slot::ModuleImportExport {
                    namespace_slot: self.this_module_slot.clone(),
                    property: binding.name.clone(),
                };
                self.binding_mut(id).slot = Some(slot);
            } else if binding.is_accessed_by_nested_function {
                let name = self.binding(id).name.clone();
                let allocated = self.allocate_global(&name);
                self.binding_mut(id).slot = Some(Slot::Global { name: allocated });
            }
        }

        self.assign_function_slots(module)?;
        self.compute_closure_functions();
        Ok(())
    }

    /// Allocate a unique global slot name from a hint, disambiguated against
    /// free variables and previously allocated globals.
    fn allocate_global(&mut self, hint: &str) -> String {
        let mut candidate = hint.to_string();
        let mut counter = 0u32;
        while self.used_global_names.contains(&candidate) {
            counter += 1;
            candidate = format!("{}_{}", hint, counter);
        }
        self.used_global_names.insert(candidate.clone());
        self.module_variables.push(candidate.clone());
        candidate
    }

    /// Assign slots for one function-like scope: `this`, parameters, hoisted
    /// declarations, function-level lexicals, then nested blocks (which may
    /// still add closure slots before the prologue's `ScopePush` count is
    /// fixed).
    fn assign_function_slots(&mut self, fs: ScopeId) -> Result<()> {
        let mut closure_count: u16 = 0;
        let mut next_local: u16 = 0;
        let mut prologue: Vec<PrologueStep> = Vec::new();

        if let Some(this) = self.scope(fs).this_binding {
            let binding = self.binding(this);
            if binding.is_accessed_by_nested_function || binding.is_written_to {
                self.binding_mut(this).slot = Some(Slot::Closure {
                    index: closure_count,
                });
                closure_count += 1;
                prologue.push(PrologueStep::InitThis { binding: this });
            } else {
                self.binding_mut(this).slot = Some(Slot::Argument { arg_index: 0 });
            }
        }

        // Parameters: argument slot when neither written nor captured, a
        // closure slot when captured, a fresh local when merely writable.
        let params = self.scope(fs).parameter_bindings.clone();
        for (i, param) in params.iter().enumerate() {
            let arg_index = (i + 1) as u16;
            let binding = self.binding(*param);
            if binding.is_accessed_by_nested_function {
                self.binding_mut(*param).slot = Some(Slot::Closure {
                    index: closure_count,
                });
                closure_count += 1;
                prologue.push(PrologueStep::InitParameter {
                    binding: *param,
                    arg_index,
                });
            } else if binding.is_written_to {
                self.binding_mut(*param).slot = Some(Slot::Local { index: next_local });
                next_local += 1;
                prologue.push(PrologueStep::InitParameter {
                    binding: *param,
                    arg_index,
                });
            } else {
                self.binding_mut(*param).slot = Some(Slot::Argument { arg_index });
            }
        }

        // Hoisted vars and function declarations.
        let vars = self.scope(fs).var_declarations.clone();
        for var in vars {
            if self.binding(var).slot.is_some() {
                continue; // module-level binding already slotted above
            }
            if self.binding(var).is_accessed_by_nested_function {
                self.binding_mut(var).slot = Some(Slot::Closure {
                    index: closure_count,
                });
                closure_count += 1;
            } else {
                self.binding_mut(var).slot = Some(Slot::Local { index: next_local });
                next_local += 1;
            }
            prologue.push(PrologueStep::InitVarDeclaration { binding: var });
        }

        // Lexicals declared directly at function level behave like a block
        // fused with the function prologue; they are never popped early.
        let mut ignored_pops = 0;
        self.assign_lexicals_into(
            fs,
            &mut closure_count,
            &mut next_local,
            &mut prologue,
            &mut ignored_pops,
        )?;

        // Function declarations initialize after slot creation, before any
        // statement runs (and before `var` statement initializers, which only
        // execute at their statement sites).
        let inits = self.scope(fs).nested_function_declarations.clone();
        for binding in inits {
            let function = self.function_node_of(binding)?;
            prologue.push(PrologueStep::InitFunctionDeclaration { binding, function });
        }

        // Nested blocks may add closure slots of their own; walk them before
        // fixing the ScopePush count.
        let child_base = next_local + self.scope(fs).child_local_offset;
        let children = self.scope(fs).children.clone();
        for child in children {
            match self.scope(child).kind {
                ScopeKind::Block => {
                    self.assign_block_slots(child, &mut closure_count, child_base)?
                }
                ScopeKind::Function => self.assign_function_slots(child)?,
                ScopeKind::Module => {
                    return Err(CompileError::internal("module scope nested in a function"));
                }
            }
        }

        if closure_count > 0 {
            prologue.insert(
                0,
                PrologueStep::ScopePush {
                    slot_count: closure_count,
                },
            );
        }

        let scope = self.scope_mut(fs);
        scope.prologue = prologue;
        scope.closure_slot_count = closure_count;
        Ok(())
    }

    /// Assign slots for a block scope. Local indexes continue from the
    /// enclosing scope's running count; sibling blocks reuse the same range
    /// because the epilogue pops the block's slots.
    fn assign_block_slots(
        &mut self,
        block: ScopeId,
        closure_count: &mut u16,
        base_local: u16,
    ) -> Result<()> {
        let mut next_local = base_local;
        let mut prologue = Vec::new();
        let mut pops: u16 = 0;

        self.assign_lexicals_into(block, closure_count, &mut next_local, &mut prologue, &mut pops)?;

        let inits = self.scope(block).nested_function_declarations.clone();
        for binding in inits {
            let function = self.function_node_of(binding)?;
            prologue.push(PrologueStep::InitFunctionDeclaration { binding, function });
        }

        {
            let scope = self.scope_mut(block);
            scope.prologue = prologue;
            scope.epilogue_pop_count = pops;
        }

        let child_base = next_local + self.scope(block).child_local_offset;
        let children = self.scope(block).children.clone();
        for child in children {
            match self.scope(child).kind {
                ScopeKind::Block => self.assign_block_slots(child, closure_count, child_base)?,
                ScopeKind::Function => self.assign_function_slots(child)?,
                ScopeKind::Module => {
                    return Err(CompileError::internal("module scope nested in a block"));
                }
            }
        }
        Ok(())
    }

    fn assign_lexicals_into(
        &mut self,
        scope: ScopeId,
        closure_count: &mut u16,
        next_local: &mut u16,
        prologue: &mut Vec<PrologueStep>,
        pops: &mut u16,
    ) -> Result<()> {
        let lexicals = self.scope(scope).lexical_declarations.clone();
        for lexical in lexicals {
            if self.binding(lexical).slot.is_some() {
                continue; // module-level export/global, already slotted
            }
            if self.binding(lexical).is_accessed_by_nested_function {
                self.binding_mut(lexical).slot = Some(Slot::Closure {
                    index: *closure_count,
                });
                *closure_count += 1;
            } else {
                self.binding_mut(lexical).slot = Some(Slot::Local { index: *next_local });
                *next_local += 1;
                *pops += 1;
            }
            prologue.push(PrologueStep::InitLexicalDeclaration { binding: lexical });
        }
        Ok(())
    }

    /// The `FunctionNode` a hoisted function-declaration binding refers to.
    fn function_node_of(&self, binding: BindingId) -> Result<NodeId> {
        self.function_decl_nodes.get(&binding).copied().ok_or_else(|| {
            CompileError::internal("function declaration node not recorded for binding")
        })
    }

    /// Propagate `function_is_closure`: every function between a use and the
    /// closure slot it reaches (exclusive of the owner) must bind the scope
    /// chain when instantiated.
    fn compute_closure_functions(&mut self) {
        let mut to_mark: Vec<ScopeId> = Vec::new();

        let refs: Vec<(ScopeId, BindingId)> = self
            .references
            .values()
            .filter_map(|r| match &r.resolution {
                Resolution::Binding(b) => Some((r.scope, *b)),
                Resolution::FreeVariable(_) => None,
            })
            .collect();
        for (use_scope, binding) in refs {
            if matches!(self.binding(binding).slot, Some(Slot::Closure { .. })) {
                let owner = self.owning_function_of(binding);
                self.collect_chain(use_scope, owner, &mut to_mark);
            }
        }

        let this_uses = self.this_uses.clone();
        for use_scope in this_uses {
            if let Some((owner, this)) = self.nearest_this(use_scope) {
                if matches!(self.binding(this).slot, Some(Slot::Closure { .. })) {
                    self.collect_chain(use_scope, owner, &mut to_mark);
                }
            }
        }

        for id in to_mark {
            self.scope_mut(id).function_is_closure = true;
        }
    }

    fn collect_chain(&self, from: ScopeId, owner: ScopeId, out: &mut Vec<ScopeId>) {
        let mut cursor = Some(from);
        while let Some(id) = cursor {
            if id == owner {
                break;
            }
            let scope = self.scope(id);
            if scope.kind == ScopeKind::Function {
                out.push(id);
            }
            cursor = scope.parent;
        }
    }

    fn owning_function_of(&self, binding: BindingId) -> ScopeId {
        let mut cursor = Some(self.binding(binding).scope);
        while let Some(id) = cursor {
            let scope = self.scope(id);
            if scope.is_function_like() {
                return id;
            }
            cursor = scope.parent;
        }
        ScopeId(0)
    }

    fn nearest_this(&self, from: ScopeId) -> Option<(ScopeId, BindingId)> {
        let mut cursor = Some(from);
        while let Some(id) = cursor {
            let scope = self.scope(id);
            if scope.kind == ScopeKind::Function && !scope.is_arrow {
                return scope.this_binding.map(|b| (id, b));
            }
            cursor = scope.parent;
        }
        None
    }
}

/// Derive a readable global-slot hint from a module specifier.
fn namespace_hint(specifier: &str) -> String {
    let cleaned: String = specifier
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .skip_while(|c| *c == '_')
        .collect();
    match cleaned.chars().next() {
        Some(c) if c.is_ascii_alphabetic() => cleaned,
        _ => format!("module_{}", cleaned),
    }
}
