// amber-compiler - Scope analysis and IL lowering for the Amber scripting engine
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! Code generation: lowers the analysed AST to the stack IL.
//!
//! Expressions are stack producers - each leaves exactly one value - and
//! statements are stack-neutral apart from their scope prologue/epilogue
//! bookkeeping. Control flow goes through predeclared blocks; the cursor
//! asserts depth agreement on every edge, so a lowering bug surfaces as an
//! internal compile error here rather than a corrupted frame on the device.
//!
//! The module body compiles into a synthetic `#entry` function that receives
//! the module's namespace object as argument 0 and publishes it through the
//! `thisModule` global slot before any top-level statement runs.

use indexmap::IndexMap;

use amber_ast::{
    AssignOp, BinaryOp, Expr, ExprKind, ForInit, FunctionBody, FunctionNode, Identifier, Lit,
    LogicalOp, MemberProperty, NodeId, Program, SourceLoc, Stmt, StmtKind, UnaryOp, UpdateOp,
};
use amber_il::{BinOp, Function, FunctionId, ModuleImport, Opcode, Operand, UnOp, Unit, Value};

use crate::analysis::analyse;
use crate::cursor::{BreakScope, FunctionBuilder};
use crate::error::{CompileError, Result};
use crate::scope::{BindingId, BindingKind, PrologueStep, Resolution, ScopeId, ScopeModel, Slot};

/// The special form that reserves space in the encoded image.
const NOP_SPECIAL_FORM: &str = "$$InternalNOPInstruction";

/// Compile a module to an IL unit.
pub fn compile(program: &Program) -> Result<Unit> {
    let model = analyse(program)?;
    let compiler = Compiler::new(program, model);
    let unit = compiler.compile_unit()?;
    tracing::debug!(
        unit = %unit.source_filename,
        functions = unit.functions.len(),
        globals = unit.module_variables.len(),
        "unit compiled"
    );
    Ok(unit)
}

struct Compiler<'p> {
    program: &'p Program,
    model: ScopeModel,
    /// Function declarations anywhere in the tree, for prologue inits.
    declarations: IndexMap<NodeId, &'p FunctionNode>,
    functions: IndexMap<FunctionId, Function>,
    next_function: u16,
}

impl<'p> Compiler<'p> {
    fn new(program: &'p Program, model: ScopeModel) -> Self {
        let mut declarations = IndexMap::new();
        collect_declarations(&program.body, &mut declarations);
        Self {
            program,
            model,
            declarations,
            functions: IndexMap::new(),
            next_function: 0,
        }
    }

    fn compile_unit(mut self) -> Result<Unit> {
        let entry = self.allocate_function_id()?;
        let module_scope = self.model.module_scope;
        let mut b = FunctionBuilder::new(entry, Some("#entry".to_string()), vec![module_scope]);

        // Argument 0 is this module's namespace object; publish it before
        // anything else can run.
        let this_module = self.model.this_module_slot.clone();
        b.emit(Opcode::LoadArg, vec![Operand::Index(0)])?;
        b.emit(Opcode::StoreGlobal, vec![Operand::Name(this_module)])?;
        b.emit(Opcode::Pop, vec![Operand::Count(1)])?;

        self.emit_prologue(&mut b, module_scope)?;
        let program = self.program;
        for stmt in &program.body {
            self.compile_stmt(&mut b, stmt)?;
        }
        if b.reachable {
            b.emit(Opcode::Literal, vec![Operand::Literal(Value::Undefined)])?;
            b.emit(Opcode::Return, vec![])?;
        }
        let function = b.seal()?;
        self.functions.insert(entry, function);
        self.functions.sort_keys();

        Ok(Unit {
            source_filename: self.program.source_filename.clone(),
            entry_function_id: entry,
            functions: self.functions,
            module_imports: self
                .model
                .module_imports
                .iter()
                .map(|(slot, specifier)| ModuleImport {
                    slot: slot.clone(),
                    specifier: specifier.clone(),
                })
                .collect(),
            module_variables: self.model.module_variables.clone(),
            free_variables: self.model.free_variables.clone(),
        })
    }

    fn allocate_function_id(&mut self) -> Result<FunctionId> {
        let id = FunctionId(self.next_function);
        self.next_function = self
            .next_function
            .checked_add(1)
            .ok_or_else(|| CompileError::internal("too many functions in unit"))?;
        Ok(id)
    }

    // =========================================================================
    // Functions
    // =========================================================================

    fn compile_function_node(
        &mut self,
        node: &'p FunctionNode,
        parent_chain: &[ScopeId],
    ) -> Result<FunctionId> {
        let scope = *self.model.function_scopes.get(&node.id).ok_or_else(|| {
            CompileError::internal("function node has no analysed scope")
        })?;
        let id = self.allocate_function_id()?;
        let name = node.name.as_ref().map(|n| n.name.clone());

        let mut chain = Vec::with_capacity(parent_chain.len() + 1);
        chain.push(scope);
        chain.extend_from_slice(parent_chain);
        let mut b = FunctionBuilder::new(id, name, chain);
        b.loc = Some(node.loc);

        self.emit_prologue(&mut b, scope)?;
        match &node.body {
            FunctionBody::Block(body) => {
                for stmt in body {
                    self.compile_stmt(&mut b, stmt)?;
                }
            }
            FunctionBody::Expression(expr) => {
                self.compile_expr(&mut b, expr)?;
                b.emit(Opcode::Return, vec![])?;
            }
        }
        if b.reachable {
            b.emit(Opcode::Literal, vec![Operand::Literal(Value::Undefined)])?;
            b.emit(Opcode::Return, vec![])?;
        }
        let function = b.seal()?;
        self.functions.insert(id, function);
        Ok(id)
    }

    /// Instantiate a function value: the function pointer, wrapped in a
    /// closure binding the current scope chain when the function reaches
    /// enclosing closure slots.
    fn emit_function_value(&mut self, b: &mut FunctionBuilder, node: &'p FunctionNode) -> Result<()> {
        let chain = b.chain.clone();
        let id = self.compile_function_node(node, &chain)?;
        b.emit(Opcode::Literal, vec![Operand::Literal(Value::Function(id))])?;
        let scope = self.model.function_scopes[&node.id];
        if self.model.scope(scope).function_is_closure {
            b.emit(Opcode::ClosureNew, vec![Operand::Count(1)])?;
        }
        Ok(())
    }

    // =========================================================================
    // Scope prologues
    // =========================================================================

    fn emit_prologue(&mut self, b: &mut FunctionBuilder, scope: ScopeId) -> Result<()> {
        let steps = self.model.scope(scope).prologue.clone();
        for step in steps {
            match step {
                PrologueStep::ScopePush { slot_count } => {
                    b.emit(Opcode::ScopePush, vec![Operand::Count(slot_count)])?;
                }
                PrologueStep::InitThis { binding } => {
                    b.emit(Opcode::LoadArg, vec![Operand::Index(0)])?;
                    self.store_binding(b, binding, true)?;
                    b.emit(Opcode::Pop, vec![Operand::Count(1)])?;
                }
                PrologueStep::InitParameter { binding, arg_index } => {
                    match self.model.binding(binding).slot() {
                        Slot::Local { index } => {
                            let index = *index;
                            if b.stack_depth != index {
                                return Err(CompileError::internal(format!(
                                    "parameter slot {} materializing at depth {}",
                                    index, b.stack_depth
                                )));
                            }
                            b.emit(Opcode::LoadArg, vec![Operand::Index(arg_index)])?;
                        }
                        Slot::Closure { .. } => {
                            b.emit(Opcode::LoadArg, vec![Operand::Index(arg_index)])?;
                            self.store_binding(b, binding, true)?;
                            b.emit(Opcode::Pop, vec![Operand::Count(1)])?;
                        }
                        other => {
                            return Err(CompileError::internal(format!(
                                "InitParameter against {:?}",
                                other
                            )));
                        }
                    }
                }
                PrologueStep::InitVarDeclaration { binding }
                | PrologueStep::InitLexicalDeclaration { binding } => {
                    if let Slot::Local { index } = self.model.binding(binding).slot() {
                        let index = *index;
                        if b.stack_depth != index {
                            return Err(CompileError::internal(format!(
                                "local slot {} materializing at depth {}",
                                index, b.stack_depth
                            )));
                        }
                        b.emit(Opcode::Literal, vec![Operand::Literal(Value::Undefined)])?;
                    }
                    // Closure, global and namespace slots start undefined on
                    // their own.
                }
                PrologueStep::InitFunctionDeclaration { binding, function } => {
                    let node = *self.declarations.get(&function).ok_or_else(|| {
                        CompileError::internal("declared function node not collected")
                    })?;
                    self.emit_function_value(b, node)?;
                    self.store_binding(b, binding, true)?;
                    b.emit(Opcode::Pop, vec![Operand::Count(1)])?;
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // Variable accessors
    // =========================================================================

    /// Closure slots are addressed relative to the live scope chain, so the
    /// distance from the current function to the owner is the sum of the
    /// scope sizes in between.
    fn effective_closure_index(
        &self,
        b: &FunctionBuilder,
        binding: BindingId,
        index: u16,
    ) -> Result<u16> {
        let owner = self.model.owning_function(binding);
        let mut offset: u16 = 0;
        for scope in &b.chain {
            if *scope == owner {
                return Ok(offset + index);
            }
            offset += self.model.scope(*scope).closure_slot_count;
        }
        Err(CompileError::internal(
            "closure binding's owner is not on the current scope chain",
        ))
    }

    fn load_binding(&mut self, b: &mut FunctionBuilder, binding: BindingId) -> Result<()> {
        match self.model.binding(binding).slot().clone() {
            Slot::Local { index } => b.emit(Opcode::LoadVar, vec![Operand::Index(index)]),
            Slot::Argument { arg_index } => {
                b.emit(Opcode::LoadArg, vec![Operand::Index(arg_index)])
            }
            Slot::Closure { index } => {
                let effective = self.effective_closure_index(b, binding, index)?;
                b.emit(Opcode::LoadScoped, vec![Operand::Index(effective)])
            }
            Slot::Global { name } => b.emit(Opcode::LoadGlobal, vec![Operand::Name(name)]),
            Slot::ModuleImportExport {
                namespace_slot,
                property,
            } => {
                b.emit(Opcode::LoadGlobal, vec![Operand::Name(namespace_slot)])?;
                b.emit(
                    Opcode::Literal,
                    vec![Operand::Literal(Value::string(&property))],
                )?;
                b.emit(Opcode::ObjectGet, vec![])
            }
        }
    }

    /// Store the top of stack into a binding, leaving the value in place.
    /// `is_init` distinguishes declaration-site initialization (always
    /// permitted) from assignment.
    fn store_binding(
        &mut self,
        b: &mut FunctionBuilder,
        binding: BindingId,
        is_init: bool,
    ) -> Result<()> {
        let info = self.model.binding(binding);
        if !is_init {
            match info.kind {
                BindingKind::Const => {
                    return Err(CompileError::AssignToConst {
                        name: info.name.clone(),
                        loc: b.loc.unwrap_or_default(),
                    });
                }
                BindingKind::Import => {
                    return Err(CompileError::AssignToImport {
                        name: info.name.clone(),
                        loc: b.loc.unwrap_or_default(),
                    });
                }
                _ => {}
            }
        }
        match info.slot().clone() {
            Slot::Local { index } => b.emit(Opcode::StoreVar, vec![Operand::Index(index)]),
            Slot::Argument { .. } => Err(CompileError::internal(
                "store against an argument slot; pass 2 should have prevented this",
            )),
            Slot::Closure { index } => {
                let effective = self.effective_closure_index(b, binding, index)?;
                b.emit(Opcode::StoreScoped, vec![Operand::Index(effective)])
            }
            Slot::Global { name } => b.emit(Opcode::StoreGlobal, vec![Operand::Name(name)]),
            Slot::ModuleImportExport {
                namespace_slot,
                property,
            } => {
                // Value stays the expression result: re-load it above the
                // namespace object and key, then let ObjectSet consume the
                // copies.
                let value_slot = b
                    .stack_depth
                    .checked_sub(1)
                    .ok_or_else(|| CompileError::internal("namespace store with empty stack"))?;
                b.emit(Opcode::LoadGlobal, vec![Operand::Name(namespace_slot)])?;
                b.emit(
                    Opcode::Literal,
                    vec![Operand::Literal(Value::string(&property))],
                )?;
                b.emit(Opcode::LoadVar, vec![Operand::Index(value_slot)])?;
                b.emit(Opcode::ObjectSet, vec![])
            }
        }
    }

    fn load_ident(&mut self, b: &mut FunctionBuilder, ident: &Identifier) -> Result<()> {
        if ident.name == "undefined" {
            return b.emit(Opcode::Literal, vec![Operand::Literal(Value::Undefined)]);
        }
        let resolution = self
            .model
            .references
            .get(&ident.id)
            .ok_or_else(|| CompileError::internal("identifier use was never resolved"))?
            .resolution
            .clone();
        match resolution {
            Resolution::Binding(binding) => self.load_binding(b, binding),
            Resolution::FreeVariable(name) => {
                b.emit(Opcode::LoadGlobal, vec![Operand::Name(name)])
            }
        }
    }

    fn store_ident(&mut self, b: &mut FunctionBuilder, ident: &Identifier) -> Result<()> {
        if ident.name == "undefined" {
            return Err(CompileError::unsupported("assignment to undefined", ident.loc));
        }
        let resolution = self
            .model
            .references
            .get(&ident.id)
            .ok_or_else(|| CompileError::internal("identifier use was never resolved"))?
            .resolution
            .clone();
        match resolution {
            Resolution::Binding(binding) => self.store_binding(b, binding, false),
            Resolution::FreeVariable(name) => {
                b.emit(Opcode::StoreGlobal, vec![Operand::Name(name)])
            }
        }
    }

    // =========================================================================
    // Statements
    // =========================================================================

    fn compile_stmt(&mut self, b: &mut FunctionBuilder, stmt: &'p Stmt) -> Result<()> {
        b.loc = Some(stmt.loc);
        match &stmt.kind {
            StmtKind::Expression(expr) => {
                self.compile_expr(b, expr)?;
                b.emit(Opcode::Pop, vec![Operand::Count(1)])
            }
            StmtKind::VariableDeclaration { declarations, .. } => {
                for declarator in declarations {
                    if let Some(init) = &declarator.init {
                        b.loc = Some(declarator.loc);
                        self.compile_expr(b, init)?;
                        let binding = self.declared_binding(declarator.id.id)?;
                        self.store_binding(b, binding, true)?;
                        b.emit(Opcode::Pop, vec![Operand::Count(1)])?;
                    }
                }
                Ok(())
            }
            // Materialized by the owning scope's prologue.
            StmtKind::FunctionDeclaration(_) => Ok(()),
            StmtKind::Block(body) => {
                let scope = self.block_scope(stmt.id)?;
                self.emit_prologue(b, scope)?;
                for inner in body {
                    self.compile_stmt(b, inner)?;
                }
                self.emit_block_epilogue(b, scope)
            }
            StmtKind::If {
                test,
                consequent,
                alternate,
            } => self.compile_if(b, test, consequent, alternate.as_deref()),
            StmtKind::While { test, body } => self.compile_while(b, test, body),
            StmtKind::DoWhile { body, test } => self.compile_do_while(b, body, test),
            StmtKind::For {
                init,
                test,
                update,
                body,
            } => self.compile_for(b, stmt.id, init.as_ref(), test.as_ref(), update.as_ref(), body),
            StmtKind::Switch {
                discriminant,
                cases,
            } => self.compile_switch(b, stmt.id, discriminant, cases),
            StmtKind::Break => self.compile_break(b, stmt.loc),
            StmtKind::Return(value) => {
                match value {
                    Some(value) => self.compile_expr(b, value)?,
                    None => {
                        b.emit(Opcode::Literal, vec![Operand::Literal(Value::Undefined)])?
                    }
                }
                b.emit(Opcode::Return, vec![])
            }
            // Import bindings are namespace slots the VM fills at load time.
            StmtKind::ImportDeclaration { .. } => Ok(()),
            StmtKind::ExportNamedDeclaration(inner) => self.compile_stmt(b, inner),
            StmtKind::Empty => Ok(()),
        }
    }

    fn declared_binding(&self, node: NodeId) -> Result<BindingId> {
        self.model
            .declaration_bindings
            .get(&node)
            .copied()
            .ok_or_else(|| CompileError::internal("declarator has no recorded binding"))
    }

    fn block_scope(&self, node: NodeId) -> Result<ScopeId> {
        self.model
            .block_scopes
            .get(&node)
            .copied()
            .ok_or_else(|| CompileError::internal("block statement has no analysed scope"))
    }

    fn emit_block_epilogue(&mut self, b: &mut FunctionBuilder, scope: ScopeId) -> Result<()> {
        let pops = self.model.scope(scope).epilogue_pop_count;
        if pops > 0 {
            b.emit(Opcode::Pop, vec![Operand::Count(pops)])?;
        }
        Ok(())
    }

    fn compile_if(
        &mut self,
        b: &mut FunctionBuilder,
        test: &'p Expr,
        consequent: &'p Stmt,
        alternate: Option<&'p Stmt>,
    ) -> Result<()> {
        self.compile_expr(b, test)?;
        let consequent_block = b.predeclare_block();
        let after = b.predeclare_block();
        match alternate {
            Some(alternate) => {
                let alternate_block = b.predeclare_block();
                b.emit_branch(consequent_block, alternate_block)?;
                b.begin_block(consequent_block)?;
                self.compile_stmt(b, consequent)?;
                b.emit_jump(after)?;
                b.begin_block(alternate_block)?;
                self.compile_stmt(b, alternate)?;
                b.emit_jump(after)?;
            }
            None => {
                b.emit_branch(consequent_block, after)?;
                b.begin_block(consequent_block)?;
                self.compile_stmt(b, consequent)?;
                b.emit_jump(after)?;
            }
        }
        b.begin_block(after)
    }

    fn compile_while(
        &mut self,
        b: &mut FunctionBuilder,
        test: &'p Expr,
        body: &'p Stmt,
    ) -> Result<()> {
        let test_block = b.predeclare_block();
        let body_block = b.predeclare_block();
        let exit = b.predeclare_block();

        b.emit_jump(test_block)?;
        b.begin_block(test_block)?;
        self.compile_expr(b, test)?;
        b.emit_branch(body_block, exit)?;

        b.begin_block(body_block)?;
        b.break_scopes.push(BreakScope {
            target: exit,
            depth: b.stack_depth,
        });
        self.compile_stmt(b, body)?;
        b.emit_jump(test_block)?;
        b.break_scopes.pop();

        b.begin_block(exit)
    }

    fn compile_do_while(
        &mut self,
        b: &mut FunctionBuilder,
        body: &'p Stmt,
        test: &'p Expr,
    ) -> Result<()> {
        let body_block = b.predeclare_block();
        let test_block = b.predeclare_block();
        let exit = b.predeclare_block();

        b.emit_jump(body_block)?;
        b.begin_block(body_block)?;
        b.break_scopes.push(BreakScope {
            target: exit,
            depth: b.stack_depth,
        });
        self.compile_stmt(b, body)?;
        b.emit_jump(test_block)?;
        b.break_scopes.pop();

        b.begin_block(test_block)?;
        self.compile_expr(b, test)?;
        b.emit_branch(body_block, exit)?;

        b.begin_block(exit)
    }

    fn compile_for(
        &mut self,
        b: &mut FunctionBuilder,
        node: NodeId,
        init: Option<&'p ForInit>,
        test: Option<&'p Expr>,
        update: Option<&'p Expr>,
        body: &'p Stmt,
    ) -> Result<()> {
        let scope = self.block_scope(node)?;
        self.emit_prologue(b, scope)?;

        match init {
            Some(ForInit::Declaration { declarations, .. }) => {
                for declarator in declarations {
                    if let Some(init_expr) = &declarator.init {
                        self.compile_expr(b, init_expr)?;
                        let binding = self.declared_binding(declarator.id.id)?;
                        self.store_binding(b, binding, true)?;
                        b.emit(Opcode::Pop, vec![Operand::Count(1)])?;
                    }
                }
            }
            Some(ForInit::Expression(expr)) => {
                self.compile_expr(b, expr)?;
                b.emit(Opcode::Pop, vec![Operand::Count(1)])?;
            }
            None => {}
        }

        let test_block = b.predeclare_block();
        let body_block = b.predeclare_block();
        let update_block = b.predeclare_block();
        let exit = b.predeclare_block();

        b.emit_jump(test_block)?;
        b.begin_block(test_block)?;
        match test {
            Some(test) => self.compile_expr(b, test)?,
            None => b.emit(Opcode::Literal, vec![Operand::Literal(Value::Boolean(true))])?,
        }
        b.emit_branch(body_block, exit)?;

        b.begin_block(body_block)?;
        b.break_scopes.push(BreakScope {
            target: exit,
            depth: b.stack_depth,
        });
        self.compile_stmt(b, body)?;
        b.emit_jump(update_block)?;
        b.break_scopes.pop();

        b.begin_block(update_block)?;
        if let Some(update) = update {
            self.compile_expr(b, update)?;
            b.emit(Opcode::Pop, vec![Operand::Count(1)])?;
        }
        b.emit_jump(test_block)?;

        b.begin_block(exit)?;
        self.emit_block_epilogue(b, scope)
    }

    fn compile_switch(
        &mut self,
        b: &mut FunctionBuilder,
        node: NodeId,
        discriminant: &'p Expr,
        cases: &'p [amber_ast::SwitchCase],
    ) -> Result<()> {
        let scope = self.block_scope(node)?;
        self.emit_prologue(b, scope)?;

        // The discriminant is evaluated once and stays on the stack through
        // the whole test chain; the join block pops it.
        self.compile_expr(b, discriminant)?;
        let join = b.predeclare_block();
        b.break_scopes.push(BreakScope {
            target: join,
            depth: b.stack_depth,
        });

        let case_blocks: Vec<_> = cases.iter().map(|_| b.predeclare_block()).collect();
        let default_index = cases.iter().position(|c| c.test.is_none());

        for (i, case) in cases.iter().enumerate() {
            let Some(test) = &case.test else { continue };
            b.loc = Some(case.loc);
            b.emit(Opcode::Dup, vec![])?;
            self.compile_expr(b, test)?;
            b.emit(Opcode::BinOp, vec![Operand::Bin(BinOp::Eq)])?;
            let next_test = b.predeclare_block();
            b.emit_branch(case_blocks[i], next_test)?;
            b.begin_block(next_test)?;
        }
        match default_index {
            Some(i) => b.emit_jump(case_blocks[i])?,
            None => b.emit_jump(join)?,
        }

        // Consequents fall through to the next case in source order.
        for (i, case) in cases.iter().enumerate() {
            b.begin_block(case_blocks[i])?;
            for stmt in &case.consequent {
                self.compile_stmt(b, stmt)?;
            }
            let next = case_blocks.get(i + 1).copied().unwrap_or(join);
            b.emit_jump(next)?;
        }

        b.break_scopes.pop();
        b.begin_block(join)?;
        b.emit(Opcode::Pop, vec![Operand::Count(1)])?;
        self.emit_block_epilogue(b, scope)
    }

    fn compile_break(&mut self, b: &mut FunctionBuilder, loc: SourceLoc) -> Result<()> {
        let Some(scope) = b.current_break_scope() else {
            return Err(CompileError::unsupported("break outside a loop or switch", loc));
        };
        if !b.reachable {
            return Ok(());
        }
        let pops = b.stack_depth.checked_sub(scope.depth).ok_or_else(|| {
            CompileError::internal("break target deeper than the current stack")
        })?;
        if pops > 0 {
            b.emit(Opcode::Pop, vec![Operand::Count(pops)])?;
        }
        b.emit_jump(scope.target)
    }

    // =========================================================================
    // Expressions
    // =========================================================================

    fn compile_expr(&mut self, b: &mut FunctionBuilder, expr: &'p Expr) -> Result<()> {
        match &expr.kind {
            ExprKind::Identifier(ident) => self.load_ident(b, ident),
            ExprKind::Literal(lit) => b.emit(
                Opcode::Literal,
                vec![Operand::Literal(literal_value(lit))],
            ),
            ExprKind::TemplateLiteral {
                quasis,
                expressions,
            } => self.compile_template(b, quasis, expressions),
            ExprKind::This => self.compile_this(b),
            ExprKind::Array(elements) => self.compile_array(b, elements),
            ExprKind::Object(properties) => self.compile_object(b, properties),
            ExprKind::Function(node) => self.emit_function_value(b, node),
            ExprKind::Unary { op, argument } => self.compile_unary(b, *op, argument, expr.loc),
            ExprKind::Update {
                op,
                prefix,
                argument,
            } => self.compile_update(b, *op, *prefix, argument, expr.loc),
            ExprKind::Binary { op, left, right } => {
                self.compile_binary(b, *op, left, right, expr.loc)
            }
            ExprKind::Logical { op, left, right } => {
                self.compile_logical(b, *op, left, right, expr.loc)
            }
            ExprKind::Assignment { op, target, value } => {
                self.compile_assignment(b, *op, target, value, expr.loc)
            }
            ExprKind::Conditional {
                test,
                consequent,
                alternate,
            } => self.compile_conditional(b, test, consequent, alternate),
            ExprKind::Call { callee, arguments } => {
                self.compile_call(b, callee, arguments, expr.loc)
            }
            ExprKind::Member { object, property } => {
                self.compile_expr(b, object)?;
                self.compile_member_key(b, property)?;
                b.emit(Opcode::ObjectGet, vec![])
            }
        }
    }

    fn compile_member_key(
        &mut self,
        b: &mut FunctionBuilder,
        property: &'p MemberProperty,
    ) -> Result<()> {
        match property {
            MemberProperty::Static(name) => b.emit(
                Opcode::Literal,
                vec![Operand::Literal(Value::string(name))],
            ),
            MemberProperty::Computed(key) => self.compile_expr(b, key),
        }
    }

    fn compile_template(
        &mut self,
        b: &mut FunctionBuilder,
        quasis: &'p [String],
        expressions: &'p [Expr],
    ) -> Result<()> {
        if quasis.len() != expressions.len() + 1 {
            return Err(CompileError::internal("malformed template literal"));
        }
        b.emit(
            Opcode::Literal,
            vec![Operand::Literal(Value::string(&quasis[0]))],
        )?;
        for (i, expr) in expressions.iter().enumerate() {
            self.compile_expr(b, expr)?;
            b.emit(Opcode::BinOp, vec![Operand::Bin(BinOp::Add)])?;
            b.emit(
                Opcode::Literal,
                vec![Operand::Literal(Value::string(&quasis[i + 1]))],
            )?;
            b.emit(Opcode::BinOp, vec![Operand::Bin(BinOp::Add)])?;
        }
        Ok(())
    }

    fn compile_this(&mut self, b: &mut FunctionBuilder) -> Result<()> {
        let chain = b.chain.clone();
        for scope_id in chain {
            let scope = self.model.scope(scope_id);
            if scope.kind == crate::scope::ScopeKind::Module {
                // Module-level `this` is undefined.
                return b.emit(Opcode::Literal, vec![Operand::Literal(Value::Undefined)]);
            }
            if scope.is_arrow {
                continue;
            }
            let Some(this) = scope.this_binding else {
                return Err(CompileError::internal("function scope without this binding"));
            };
            return self.load_binding(b, this);
        }
        Err(CompileError::internal("empty scope chain"))
    }

    fn compile_array(&mut self, b: &mut FunctionBuilder, elements: &'p [Expr]) -> Result<()> {
        b.emit(Opcode::ArrayNew, vec![])?;
        let array_slot = b.stack_depth - 1;
        for (i, element) in elements.iter().enumerate() {
            b.emit(Opcode::LoadVar, vec![Operand::Index(array_slot)])?;
            b.emit(
                Opcode::Literal,
                vec![Operand::Literal(Value::Number(i as f64))],
            )?;
            self.compile_expr(b, element)?;
            b.emit(Opcode::ObjectSet, vec![])?;
        }
        Ok(())
    }

    fn compile_object(
        &mut self,
        b: &mut FunctionBuilder,
        properties: &'p [amber_ast::ObjectProperty],
    ) -> Result<()> {
        b.emit(Opcode::ObjectNew, vec![])?;
        let object_slot = b.stack_depth - 1;
        for property in properties {
            b.emit(Opcode::LoadVar, vec![Operand::Index(object_slot)])?;
            b.emit(
                Opcode::Literal,
                vec![Operand::Literal(Value::string(&property.key))],
            )?;
            self.compile_expr(b, &property.value)?;
            b.emit(Opcode::ObjectSet, vec![])?;
        }
        Ok(())
    }

    fn compile_unary(
        &mut self,
        b: &mut FunctionBuilder,
        op: UnaryOp,
        argument: &'p Expr,
        loc: SourceLoc,
    ) -> Result<()> {
        // `-<number literal>` folds into a negative literal.
        if op == UnaryOp::Neg {
            if let ExprKind::Literal(Lit::Number(n)) = &argument.kind {
                return b.emit(
                    Opcode::Literal,
                    vec![Operand::Literal(Value::Number(-n))],
                );
            }
        }
        let un_op = match op {
            UnaryOp::Neg => UnOp::Neg,
            UnaryOp::Plus => UnOp::Plus,
            UnaryOp::Not => UnOp::Not,
            UnaryOp::BitNot => UnOp::BitNot,
            UnaryOp::Typeof | UnaryOp::Void | UnaryOp::Delete => {
                return Err(CompileError::unsupported(
                    format!("{} operator", op.symbol()),
                    loc,
                ));
            }
        };
        self.compile_expr(b, argument)?;
        b.emit(Opcode::UnOp, vec![Operand::Un(un_op)])
    }

    fn compile_update(
        &mut self,
        b: &mut FunctionBuilder,
        op: UpdateOp,
        prefix: bool,
        argument: &'p Expr,
        loc: SourceLoc,
    ) -> Result<()> {
        let bin_op = match op {
            UpdateOp::Increment => BinOp::Add,
            UpdateOp::Decrement => BinOp::Sub,
        };
        match &argument.kind {
            ExprKind::Identifier(ident) => {
                self.load_ident(b, ident)?;
                if !prefix {
                    b.emit(Opcode::Dup, vec![])?;
                }
                b.emit(
                    Opcode::Literal,
                    vec![Operand::Literal(Value::Number(1.0))],
                )?;
                b.emit(Opcode::BinOp, vec![Operand::Bin(bin_op)])?;
                self.store_ident(b, ident)?;
                if !prefix {
                    b.emit(Opcode::Pop, vec![Operand::Count(1)])?;
                }
                Ok(())
            }
            ExprKind::Member { object, property } => {
                // Object and key evaluate once; the stack juggling below
                // keeps single copies addressable by frame slot.
                self.compile_expr(b, object)?;
                let object_slot = b.stack_depth - 1;
                self.compile_member_key(b, property)?;
                let key_slot = b.stack_depth - 1;
                b.emit(Opcode::LoadVar, vec![Operand::Index(object_slot)])?;
                b.emit(Opcode::LoadVar, vec![Operand::Index(key_slot)])?;
                b.emit(Opcode::ObjectGet, vec![])?;
                if !prefix {
                    b.emit(Opcode::Dup, vec![])?;
                }
                b.emit(
                    Opcode::Literal,
                    vec![Operand::Literal(Value::Number(1.0))],
                )?;
                b.emit(Opcode::BinOp, vec![Operand::Bin(bin_op)])?;
                let new_slot = b.stack_depth - 1;
                b.emit(Opcode::LoadVar, vec![Operand::Index(object_slot)])?;
                b.emit(Opcode::LoadVar, vec![Operand::Index(key_slot)])?;
                b.emit(Opcode::LoadVar, vec![Operand::Index(new_slot)])?;
                b.emit(Opcode::ObjectSet, vec![])?;
                if !prefix {
                    b.emit(Opcode::Pop, vec![Operand::Count(1)])?;
                }
                // Stack: object, key, result. Collapse to the result.
                b.emit(Opcode::StoreVar, vec![Operand::Index(object_slot)])?;
                b.emit(Opcode::Pop, vec![Operand::Count(2)])?;
                Ok(())
            }
            _ => Err(CompileError::unsupported(
                "update of a non-variable expression",
                loc,
            )),
        }
    }

    fn compile_binary(
        &mut self,
        b: &mut FunctionBuilder,
        op: BinaryOp,
        left: &'p Expr,
        right: &'p Expr,
        loc: SourceLoc,
    ) -> Result<()> {
        // `x / y | 0` is integer division; fold it to one instruction.
        if op == BinaryOp::BitOr {
            if let (
                ExprKind::Binary {
                    op: BinaryOp::Div,
                    left: dividend,
                    right: divisor,
                },
                ExprKind::Literal(Lit::Number(zero)),
            ) = (&left.kind, &right.kind)
            {
                if *zero == 0.0 {
                    self.compile_expr(b, dividend)?;
                    self.compile_expr(b, divisor)?;
                    return b.emit(Opcode::BinOp, vec![Operand::Bin(BinOp::DivTrunc)]);
                }
            }
        }
        let bin_op = binary_op(op)
            .ok_or_else(|| CompileError::unsupported(format!("{} operator", op.symbol()), loc))?;
        self.compile_expr(b, left)?;
        self.compile_expr(b, right)?;
        b.emit(Opcode::BinOp, vec![Operand::Bin(bin_op)])
    }

    fn compile_logical(
        &mut self,
        b: &mut FunctionBuilder,
        op: LogicalOp,
        left: &'p Expr,
        right: &'p Expr,
        loc: SourceLoc,
    ) -> Result<()> {
        if op == LogicalOp::Coalesce {
            // Parsed but lowering is undefined; rejected until pinned down.
            return Err(CompileError::unsupported("?? operator", loc));
        }
        self.compile_expr(b, left)?;
        b.emit(Opcode::Dup, vec![])?;
        let rhs = b.predeclare_block();
        let end = b.predeclare_block();
        match op {
            LogicalOp::And => b.emit_branch(rhs, end)?,
            LogicalOp::Or => b.emit_branch(end, rhs)?,
            LogicalOp::Coalesce => unreachable!(),
        }
        b.begin_block(rhs)?;
        b.emit(Opcode::Pop, vec![Operand::Count(1)])?;
        self.compile_expr(b, right)?;
        b.emit_jump(end)?;
        b.begin_block(end)
    }

    fn compile_assignment(
        &mut self,
        b: &mut FunctionBuilder,
        op: AssignOp,
        target: &'p Expr,
        value: &'p Expr,
        loc: SourceLoc,
    ) -> Result<()> {
        match (&target.kind, op.binary_op()) {
            (ExprKind::Identifier(ident), None) => {
                self.compile_expr(b, value)?;
                self.store_ident(b, ident)
            }
            (ExprKind::Identifier(ident), Some(bin)) => {
                let bin = binary_op(bin).ok_or_else(|| {
                    CompileError::unsupported(format!("{} operator", bin.symbol()), loc)
                })?;
                self.load_ident(b, ident)?;
                self.compile_expr(b, value)?;
                b.emit(Opcode::BinOp, vec![Operand::Bin(bin)])?;
                self.store_ident(b, ident)
            }
            (ExprKind::Member { object, property }, None) => {
                self.compile_expr(b, value)?;
                let value_slot = b.stack_depth - 1;
                self.compile_expr(b, object)?;
                self.compile_member_key(b, property)?;
                b.emit(Opcode::LoadVar, vec![Operand::Index(value_slot)])?;
                b.emit(Opcode::ObjectSet, vec![])
            }
            (ExprKind::Member { object, property }, Some(bin)) => {
                let bin = binary_op(bin).ok_or_else(|| {
                    CompileError::unsupported(format!("{} operator", bin.symbol()), loc)
                })?;
                self.compile_expr(b, object)?;
                let object_slot = b.stack_depth - 1;
                self.compile_member_key(b, property)?;
                let key_slot = b.stack_depth - 1;
                b.emit(Opcode::LoadVar, vec![Operand::Index(object_slot)])?;
                b.emit(Opcode::LoadVar, vec![Operand::Index(key_slot)])?;
                b.emit(Opcode::ObjectGet, vec![])?;
                self.compile_expr(b, value)?;
                b.emit(Opcode::BinOp, vec![Operand::Bin(bin)])?;
                let result_slot = b.stack_depth - 1;
                b.emit(Opcode::LoadVar, vec![Operand::Index(object_slot)])?;
                b.emit(Opcode::LoadVar, vec![Operand::Index(key_slot)])?;
                b.emit(Opcode::LoadVar, vec![Operand::Index(result_slot)])?;
                b.emit(Opcode::ObjectSet, vec![])?;
                // Stack: object, key, result. Collapse to the result.
                b.emit(Opcode::StoreVar, vec![Operand::Index(object_slot)])?;
                b.emit(Opcode::Pop, vec![Operand::Count(2)])?;
                Ok(())
            }
            _ => Err(CompileError::unsupported(
                "assignment to a non-variable expression",
                loc,
            )),
        }
    }

    fn compile_conditional(
        &mut self,
        b: &mut FunctionBuilder,
        test: &'p Expr,
        consequent: &'p Expr,
        alternate: &'p Expr,
    ) -> Result<()> {
        self.compile_expr(b, test)?;
        let consequent_block = b.predeclare_block();
        let alternate_block = b.predeclare_block();
        let end = b.predeclare_block();
        b.emit_branch(consequent_block, alternate_block)?;
        b.begin_block(consequent_block)?;
        self.compile_expr(b, consequent)?;
        b.emit_jump(end)?;
        b.begin_block(alternate_block)?;
        self.compile_expr(b, alternate)?;
        b.emit_jump(end)?;
        b.begin_block(end)
    }

    fn compile_call(
        &mut self,
        b: &mut FunctionBuilder,
        callee: &'p Expr,
        arguments: &'p [Expr],
        loc: SourceLoc,
    ) -> Result<()> {
        // Special form: reserve image space.
        if let ExprKind::Identifier(ident) = &callee.kind {
            if ident.name == NOP_SPECIAL_FORM {
                return self.compile_nop_form(b, arguments, loc);
            }
        }

        let count = arguments.len() + 1;
        if count > u16::MAX as usize {
            return Err(CompileError::unsupported("too many call arguments", loc));
        }

        if let ExprKind::Member { object, property } = &callee.kind {
            // Method call: the object is evaluated once and duplicated to
            // serve as `this`.
            self.compile_expr(b, object)?;
            let object_slot = b.stack_depth - 1;
            b.emit(Opcode::Dup, vec![])?;
            self.compile_member_key(b, property)?;
            b.emit(Opcode::ObjectGet, vec![])?;
            b.emit(Opcode::LoadVar, vec![Operand::Index(object_slot)])?;
            for argument in arguments {
                self.compile_expr(b, argument)?;
            }
            b.emit(Opcode::Call, vec![Operand::Count(count as u16)])?;
            // Stack: object, result. Collapse to the result.
            b.emit(Opcode::StoreVar, vec![Operand::Index(object_slot)])?;
            b.emit(Opcode::Pop, vec![Operand::Count(1)])?;
            Ok(())
        } else {
            self.compile_expr(b, callee)?;
            b.emit(Opcode::Literal, vec![Operand::Literal(Value::Undefined)])?;
            for argument in arguments {
                self.compile_expr(b, argument)?;
            }
            b.emit(Opcode::Call, vec![Operand::Count(count as u16)])
        }
    }

    fn compile_nop_form(
        &mut self,
        b: &mut FunctionBuilder,
        arguments: &'p [Expr],
        loc: SourceLoc,
    ) -> Result<()> {
        let count = match arguments {
            [Expr {
                kind: ExprKind::Literal(Lit::Number(n)),
                ..
            }] if n.fract() == 0.0 && (2.0..=65535.0).contains(n) => *n as u16,
            _ => {
                return Err(CompileError::unsupported(
                    format!("{} requires a literal size between 2 and 65535", NOP_SPECIAL_FORM),
                    loc,
                ));
            }
        };
        b.emit(Opcode::Nop, vec![Operand::Count(count)])?;
        b.emit(Opcode::Literal, vec![Operand::Literal(Value::Undefined)])
    }
}

/// Map a supported AST binary operator to its IL op; `None` means reserved.
fn binary_op(op: BinaryOp) -> Option<BinOp> {
    match op {
        BinaryOp::Add => Some(BinOp::Add),
        BinaryOp::Sub => Some(BinOp::Sub),
        BinaryOp::Mul => Some(BinOp::Mul),
        BinaryOp::Div => Some(BinOp::Div),
        BinaryOp::Rem => Some(BinOp::Rem),
        BinaryOp::StrictEq => Some(BinOp::Eq),
        BinaryOp::StrictNeq => Some(BinOp::Neq),
        BinaryOp::Lt => Some(BinOp::Lt),
        BinaryOp::Gt => Some(BinOp::Gt),
        BinaryOp::Le => Some(BinOp::Le),
        BinaryOp::Ge => Some(BinOp::Ge),
        BinaryOp::BitAnd => Some(BinOp::BitAnd),
        BinaryOp::BitOr => Some(BinOp::BitOr),
        BinaryOp::BitXor => Some(BinOp::BitXor),
        BinaryOp::Shl => Some(BinOp::Shl),
        BinaryOp::Shr => Some(BinOp::Shr),
        BinaryOp::UShr => Some(BinOp::UShr),
        BinaryOp::LooseEq | BinaryOp::LooseNeq | BinaryOp::Instanceof | BinaryOp::In => None,
    }
}

fn literal_value(lit: &Lit) -> Value {
    match lit {
        Lit::Null => Value::Null,
        Lit::Boolean(b) => Value::Boolean(*b),
        Lit::Number(n) => Value::Number(*n),
        Lit::String(s) => Value::string(s),
    }
}

/// Collect every function declaration in the tree, including those inside
/// nested functions, keyed by node id.
fn collect_declarations<'p>(stmts: &'p [Stmt], out: &mut IndexMap<NodeId, &'p FunctionNode>) {
    for stmt in stmts {
        collect_declarations_stmt(stmt, out);
    }
}

fn collect_declarations_stmt<'p>(stmt: &'p Stmt, out: &mut IndexMap<NodeId, &'p FunctionNode>) {
    match &stmt.kind {
        StmtKind::FunctionDeclaration(node) => {
            out.insert(node.id, node);
            collect_declarations_function(node, out);
        }
        StmtKind::VariableDeclaration { declarations, .. } => {
            for declarator in declarations {
                if let Some(init) = &declarator.init {
                    collect_declarations_expr(init, out);
                }
            }
        }
        StmtKind::Expression(expr) => collect_declarations_expr(expr, out),
        StmtKind::Block(body) => collect_declarations(body, out),
        StmtKind::If {
            test,
            consequent,
            alternate,
        } => {
            collect_declarations_expr(test, out);
            collect_declarations_stmt(consequent, out);
            if let Some(alternate) = alternate {
                collect_declarations_stmt(alternate, out);
            }
        }
        StmtKind::While { test, body } => {
            collect_declarations_expr(test, out);
            collect_declarations_stmt(body, out);
        }
        StmtKind::DoWhile { body, test } => {
            collect_declarations_stmt(body, out);
            collect_declarations_expr(test, out);
        }
        StmtKind::For {
            init,
            test,
            update,
            body,
        } => {
            match init {
                Some(ForInit::Declaration { declarations, .. }) => {
                    for declarator in declarations {
                        if let Some(init_expr) = &declarator.init {
                            collect_declarations_expr(init_expr, out);
                        }
                    }
                }
                Some(ForInit::Expression(expr)) => collect_declarations_expr(expr, out),
                None => {}
            }
            if let Some(test) = test {
                collect_declarations_expr(test, out);
            }
            if let Some(update) = update {
                collect_declarations_expr(update, out);
            }
            collect_declarations_stmt(body, out);
        }
        StmtKind::Switch {
            discriminant,
            cases,
        } => {
            collect_declarations_expr(discriminant, out);
            for case in cases {
                if let Some(test) = &case.test {
                    collect_declarations_expr(test, out);
                }
                collect_declarations(&case.consequent, out);
            }
        }
        StmtKind::Return(Some(value)) => collect_declarations_expr(value, out),
        StmtKind::ExportNamedDeclaration(inner) => collect_declarations_stmt(inner, out),
        _ => {}
    }
}

fn collect_declarations_function<'p>(
    node: &'p FunctionNode,
    out: &mut IndexMap<NodeId, &'p FunctionNode>,
) {
    match &node.body {
        FunctionBody::Block(body) => collect_declarations(body, out),
        FunctionBody::Expression(expr) => collect_declarations_expr(expr, out),
    }
}

fn collect_declarations_expr<'p>(expr: &'p Expr, out: &mut IndexMap<NodeId, &'p FunctionNode>) {
    match &expr.kind {
        ExprKind::Function(node) => collect_declarations_function(node, out),
        ExprKind::TemplateLiteral { expressions, .. } => {
            for e in expressions {
                collect_declarations_expr(e, out);
            }
        }
        ExprKind::Array(elements) => {
            for e in elements {
                collect_declarations_expr(e, out);
            }
        }
        ExprKind::Object(properties) => {
            for p in properties {
                collect_declarations_expr(&p.value, out);
            }
        }
        ExprKind::Unary { argument, .. } | ExprKind::Update { argument, .. } => {
            collect_declarations_expr(argument, out);
        }
        ExprKind::Binary { left, right, .. } | ExprKind::Logical { left, right, .. } => {
            collect_declarations_expr(left, out);
            collect_declarations_expr(right, out);
        }
        ExprKind::Assignment { target, value, .. } => {
            collect_declarations_expr(target, out);
            collect_declarations_expr(value, out);
        }
        ExprKind::Conditional {
            test,
            consequent,
            alternate,
        } => {
            collect_declarations_expr(test, out);
            collect_declarations_expr(consequent, out);
            collect_declarations_expr(alternate, out);
        }
        ExprKind::Call { callee, arguments } => {
            collect_declarations_expr(callee, out);
            for a in arguments {
                collect_declarations_expr(a, out);
            }
        }
        ExprKind::Member { object, property } => {
            collect_declarations_expr(object, out);
            if let MemberProperty::Computed(key) = property {
                collect_declarations_expr(key, out);
            }
        }
        _ => {}
    }
}
