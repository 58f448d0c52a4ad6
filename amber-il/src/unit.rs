// amber-il - Value model and stack-machine intermediate language for Amber
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! IL containers: units, functions, blocks, operations.

use indexmap::IndexMap;

use amber_ast::SourceLoc;

use crate::opcode::{Opcode, Operand};
use crate::value::FunctionId;

/// Identity of a basic block within one function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u16);

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "block{}", self.0)
    }
}

/// One instruction, with the stack depths stamped on it at emission time.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub opcode: Opcode,
    pub operands: Vec<Operand>,
    pub stack_depth_before: u16,
    pub stack_depth_after: u16,
    /// Source position, when the construct that emitted this has one.
    pub loc: Option<SourceLoc>,
}

/// A basic block: straight-line operations ending in a terminator.
///
/// Every edge into a block must arrive at `expected_stack_depth_at_entry`;
/// the compiler asserts this at each branch and the invariant is what lets
/// the consumer VM preallocate frames.
#[derive(Debug, Clone)]
pub struct Block {
    pub id: BlockId,
    pub expected_stack_depth_at_entry: u16,
    pub operations: Vec<Operation>,
}

impl Block {
    /// The terminator, if the block is complete.
    pub fn terminator(&self) -> Option<&Operation> {
        self.operations.last().filter(|op| op.opcode.is_terminator())
    }
}

/// A compiled function: a block graph with a distinguished entry block.
#[derive(Debug, Clone)]
pub struct Function {
    pub id: FunctionId,
    /// Source-level name, for diagnostics. The entry function is `#entry`.
    pub name: Option<String>,
    pub entry_block_id: BlockId,
    /// Maximum of `stack_depth_after` over all operations, computed when the
    /// function is sealed.
    pub max_stack_depth: u16,
    pub blocks: IndexMap<BlockId, Block>,
}

impl Function {
    /// All operations across all blocks, in block order.
    pub fn operations(&self) -> impl Iterator<Item = &Operation> {
        self.blocks.values().flat_map(|b| b.operations.iter())
    }

    /// The entry block. The compiler never emits a function without one.
    pub fn entry_block(&self) -> &Block {
        &self.blocks[&self.entry_block_id]
    }
}

/// One `import ... from "specifier"` of the module, bound to the global slot
/// holding the source module's namespace object.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleImport {
    pub slot: String,
    pub specifier: String,
}

/// A compiled module, ready for the host-side VM.
#[derive(Debug, Clone)]
pub struct Unit {
    pub source_filename: String,
    pub entry_function_id: FunctionId,
    pub functions: IndexMap<FunctionId, Function>,
    pub module_imports: Vec<ModuleImport>,
    /// Global slot names owned by this module, in declaration order.
    pub module_variables: Vec<String>,
    /// Names that resolve outside the module, satisfied by the host.
    pub free_variables: Vec<String>,
}

impl Unit {
    /// The synthetic `#entry` function.
    pub fn entry_function(&self) -> &Function {
        &self.functions[&self.entry_function_id]
    }
}
