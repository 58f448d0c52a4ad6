// amber-compiler - Scope analysis and IL lowering for the Amber scripting engine
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! The emission cursor: one per function being compiled.
//!
//! Blocks are predeclared so branches can reference forward targets; every
//! predeclared block must eventually be created, which `seal` asserts. Every
//! edge carries the stack depth it arrives with, and the first edge into a
//! block fixes the depth every later edge (and the block itself) must agree
//! with. Emitting after a terminator is silently suppressed - that is how
//! unreachable code disappears.

use indexmap::IndexMap;

use amber_ast::SourceLoc;
use amber_il::{Block, BlockId, Function, FunctionId, Opcode, Operand};

use crate::error::{CompileError, Result};
use crate::scope::ScopeId;

/// An enclosing construct `break` can target.
#[derive(Debug, Clone, Copy)]
pub struct BreakScope {
    pub target: BlockId,
    /// Stack depth the target block expects on entry.
    pub depth: u16,
}

/// Per-function emission state.
pub struct FunctionBuilder {
    id: FunctionId,
    name: Option<String>,
    entry: BlockId,
    blocks: IndexMap<BlockId, Block>,
    /// Predeclared, not yet created. The value is the entry depth fixed by
    /// the first edge, when one has arrived.
    pending: IndexMap<BlockId, Option<u16>>,
    /// Blocks at least one edge points to.
    referenced: Vec<BlockId>,
    next_block: u16,
    current: BlockId,
    pub stack_depth: u16,
    pub reachable: bool,
    pub break_scopes: Vec<BreakScope>,
    /// Enclosing function-like scopes, innermost (this function) first.
    pub chain: Vec<ScopeId>,
    /// Source location stamped on subsequently emitted operations.
    pub loc: Option<SourceLoc>,
}

impl FunctionBuilder {
    pub fn new(id: FunctionId, name: Option<String>, chain: Vec<ScopeId>) -> Self {
        let entry = BlockId(0);
        let mut blocks = IndexMap::new();
        blocks.insert(
            entry,
            Block {
                id: entry,
                expected_stack_depth_at_entry: 0,
                operations: Vec::new(),
            },
        );
        Self {
            id,
            name,
            entry,
            blocks,
            pending: IndexMap::new(),
            referenced: Vec::new(),
            next_block: 1,
            current: entry,
            stack_depth: 0,
            reachable: true,
            break_scopes: Vec::new(),
            chain,
            loc: None,
        }
    }

    /// Allocate a block id for a forward reference.
    pub fn predeclare_block(&mut self) -> BlockId {
        let id = BlockId(self.next_block);
        self.next_block += 1;
        self.pending.insert(id, None);
        id
    }

    /// Record an edge into `target` arriving at `depth`, checking agreement
    /// with any depth already fixed for it.
    fn register_edge(&mut self, target: BlockId, depth: u16) -> Result<()> {
        self.referenced.push(target);
        if let Some(block) = self.blocks.get(&target) {
            if block.expected_stack_depth_at_entry != depth {
                return Err(CompileError::internal(format!(
                    "edge into {} arrives at depth {} but the block expects {}",
                    target, depth, block.expected_stack_depth_at_entry
                )));
            }
            return Ok(());
        }
        match self.pending.get_mut(&target) {
            Some(slot) => match slot {
                Some(expected) if *expected != depth => Err(CompileError::internal(format!(
                    "edge into {} arrives at depth {} but an earlier edge fixed {}",
                    target, depth, expected
                ))),
                Some(_) => Ok(()),
                None => {
                    *slot = Some(depth);
                    Ok(())
                }
            },
            None => Err(CompileError::internal(format!(
                "edge into {} which was never predeclared",
                target
            ))),
        }
    }

    /// Start emitting into a predeclared block. A block no edge has reached
    /// is created unreachable and pruned at seal time if it stays empty.
    pub fn begin_block(&mut self, id: BlockId) -> Result<()> {
        let depth = match self.pending.shift_remove(&id) {
            Some(Some(depth)) => {
                self.reachable = true;
                depth
            }
            Some(None) => {
                self.reachable = false;
                self.stack_depth
            }
            None => {
                return Err(CompileError::internal(format!(
                    "{} created twice or never predeclared",
                    id
                )));
            }
        };
        self.stack_depth = depth;
        self.blocks.insert(
            id,
            Block {
                id,
                expected_stack_depth_at_entry: depth,
                operations: Vec::new(),
            },
        );
        self.current = id;
        Ok(())
    }

    /// Append one operation to the current block, updating and stamping the
    /// stack depth. Suppressed while unreachable.
    pub fn emit(&mut self, opcode: Opcode, operands: Vec<Operand>) -> Result<()> {
        if !self.reachable {
            return Ok(());
        }
        opcode
            .verify(&operands)
            .map_err(|e| CompileError::internal(e.to_string()))?;
        let before = self.stack_depth;
        let after = before as i32 + opcode.stack_delta(&operands);
        if after < 0 {
            return Err(CompileError::internal(format!(
                "{} underflows the stack at depth {}",
                opcode, before
            )));
        }
        if after > u16::MAX as i32 {
            return Err(CompileError::internal("operand stack depth overflow"));
        }
        let after = after as u16;
        let terminates = opcode.is_terminator();
        let op = amber_il::Operation {
            opcode,
            operands,
            stack_depth_before: before,
            stack_depth_after: after,
            loc: self.loc,
        };
        self.blocks
            .get_mut(&self.current)
            .ok_or_else(|| CompileError::internal("no current block"))?
            .operations
            .push(op);
        self.stack_depth = after;
        if terminates {
            self.reachable = false;
        }
        Ok(())
    }

    /// `Jump target`, registering the edge at the current depth.
    pub fn emit_jump(&mut self, target: BlockId) -> Result<()> {
        if !self.reachable {
            return Ok(());
        }
        self.register_edge(target, self.stack_depth)?;
        self.emit(Opcode::Jump, vec![Operand::Label(target)])
    }

    /// `Branch consequent alternate`, registering both edges at the depth
    /// after the condition is popped.
    pub fn emit_branch(&mut self, consequent: BlockId, alternate: BlockId) -> Result<()> {
        if !self.reachable {
            return Ok(());
        }
        if self.stack_depth == 0 {
            return Err(CompileError::internal("branch with empty stack"));
        }
        let depth = self.stack_depth - 1;
        self.register_edge(consequent, depth)?;
        self.register_edge(alternate, depth)?;
        self.emit(
            Opcode::Branch,
            vec![Operand::Label(consequent), Operand::Label(alternate)],
        )
    }

    /// Innermost break target, if any.
    pub fn current_break_scope(&self) -> Option<BreakScope> {
        self.break_scopes.last().copied()
    }

    /// Finish the function: every predeclared block must exist, every
    /// reachable block must end in a terminator, and blocks nothing ever
    /// jumped to are pruned.
    pub fn seal(mut self) -> Result<Function> {
        if let Some((&id, _)) = self.pending.first() {
            return Err(CompileError::internal(format!(
                "{} was predeclared but never created",
                id
            )));
        }
        let referenced = std::mem::take(&mut self.referenced);
        let entry = self.entry;
        self.blocks.retain(|id, block| {
            *id == entry || !block.operations.is_empty() || referenced.contains(id)
        });
        let mut max_depth: u16 = 0;
        for block in self.blocks.values() {
            match block.operations.last() {
                Some(op) if op.opcode.is_terminator() => {}
                _ if block.operations.is_empty() && !referenced.contains(&block.id) => {}
                _ => {
                    return Err(CompileError::internal(format!(
                        "{} does not end in a terminator",
                        block.id
                    )));
                }
            }
            for op in &block.operations {
                max_depth = max_depth
                    .max(op.stack_depth_before)
                    .max(op.stack_depth_after);
            }
        }
        Ok(Function {
            id: self.id,
            name: self.name,
            entry_block_id: self.entry,
            max_stack_depth: max_depth,
            blocks: self.blocks,
        })
    }
}
