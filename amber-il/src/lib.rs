// amber-il - Value model and stack-machine intermediate language for Amber
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! The intermediate language shared by the compiler, the host-side VM and the
//! snapshot encoder.
//!
//! A compiled module is a [`Unit`]: a set of functions, each a graph of basic
//! blocks of stack operations, plus module-import declarations and the id of
//! the synthetic entry function. Every opcode's operand shape and static
//! stack delta live in one metadata table ([`Opcode::meta`]); emission and
//! verification both read it, so they cannot drift apart.

pub mod opcode;
pub mod stringify;
pub mod unit;
pub mod value;

pub use opcode::{BinOp, Opcode, Operand, OperandError, OperandSchema, UnOp};
pub use stringify::stringify_unit;
pub use unit::{Block, BlockId, Function, ModuleImport, Operation, Unit};
pub use value::{AllocationId, EphemeralId, FunctionId, HostFunctionId, Value};
