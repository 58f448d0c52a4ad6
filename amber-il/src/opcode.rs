// amber-il - Value model and stack-machine intermediate language for Amber
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! IL instruction definitions and the opcode metadata table.
//!
//! Instructions operate on a per-function operand stack. Control flow is
//! expressed with block labels, not byte offsets; the snapshot encoder
//! assigns concrete offsets much later. Each opcode's operand schema and
//! stack delta come from [`Opcode::meta`], and [`Opcode::verify`] checks an
//! operand list against the same table the emitter reads, so the two cannot
//! disagree.

use crate::unit::BlockId;
use crate::value::Value;

/// Arithmetic, comparison and bitwise operators.
///
/// `Eq`/`Neq` are the strict forms; the loose forms never reach the IL.
/// `DivTrunc` is the folded `x / y | 0` integer-division idiom.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    DivTrunc,
    Rem,
    Eq,
    Neq,
    Lt,
    Gt,
    Le,
    Ge,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    UShr,
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
    BitNot,
    Plus,
}

/// Bytecode instructions for the Amber VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Push a new empty array.
    ArrayNew,
    /// Pop two operands, push the result of a binary operator.
    BinOp,
    /// Pop the condition; continue at the first label if truthy, the second
    /// if falsy. Terminator.
    Branch,
    /// Call with `count` values above the callee (`this` plus arguments).
    /// Pops callee and all of them, pushes the result.
    Call,
    /// Capture the top `count` stack values plus the current scope, push a
    /// closure. The last captured value is the function pointer.
    ClosureNew,
    /// Duplicate the top of stack.
    Dup,
    /// Continue at the label. Terminator.
    Jump,
    /// Push a literal value.
    Literal,
    /// Push argument `index` (0 is `this`).
    LoadArg,
    /// Push a global slot. Name form in compiled units, index form in
    /// restored ones.
    LoadGlobal,
    /// Push closure-scope slot `index`.
    LoadScoped,
    /// Push operand-stack slot `index` (frame-relative).
    LoadVar,
    /// Reserved space, `count` bytes in the encoded image. No effect.
    Nop,
    /// Pop key and object, push the property value.
    ObjectGet,
    /// Push a new empty object.
    ObjectNew,
    /// Pop value, key and object; store the property.
    ObjectSet,
    /// Pop `count` values.
    Pop,
    /// Pop the return value and leave the function. Terminator.
    Return,
    /// Allocate a closure scope with `count` slots for this activation.
    ScopePush,
    /// Write the top of stack to a global slot without popping.
    StoreGlobal,
    /// Write the top of stack to closure-scope slot `index` without popping.
    StoreScoped,
    /// Write the top of stack to operand-stack slot `index` without popping.
    StoreVar,
    /// Pop one operand, push the result of a unary operator.
    UnOp,
}

/// One instruction operand.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Label(BlockId),
    Count(u16),
    Index(u16),
    Name(String),
    Literal(Value),
    Bin(BinOp),
    Un(UnOp),
}

impl Operand {
    fn kind(&self) -> &'static str {
        match self {
            Operand::Label(_) => "label",
            Operand::Count(_) => "count",
            Operand::Index(_) => "index",
            Operand::Name(_) => "name",
            Operand::Literal(_) => "literal",
            Operand::Bin(_) => "binop",
            Operand::Un(_) => "unop",
        }
    }
}

/// Expected operand shape, one entry per operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandSchema {
    Label,
    Count,
    Index,
    /// Global slots: named in compiler output, positional after decoding.
    NameOrIndex,
    Literal,
    Bin,
    Un,
}

impl OperandSchema {
    fn admits(self, operand: &Operand) -> bool {
        match (self, operand) {
            (OperandSchema::Label, Operand::Label(_)) => true,
            (OperandSchema::Count, Operand::Count(_)) => true,
            (OperandSchema::Index, Operand::Index(_)) => true,
            (OperandSchema::NameOrIndex, Operand::Name(_) | Operand::Index(_)) => true,
            (OperandSchema::Literal, Operand::Literal(_)) => true,
            (OperandSchema::Bin, Operand::Bin(_)) => true,
            (OperandSchema::Un, Operand::Un(_)) => true,
            _ => false,
        }
    }

    fn name(self) -> &'static str {
        match self {
            OperandSchema::Label => "label",
            OperandSchema::Count => "count",
            OperandSchema::Index => "index",
            OperandSchema::NameOrIndex => "name or index",
            OperandSchema::Literal => "literal",
            OperandSchema::Bin => "binop",
            OperandSchema::Un => "unop",
        }
    }
}

/// How an opcode moves the stack depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackDelta {
    Fixed(i8),
    /// `Pop n` and `Call n`: minus the count operand.
    MinusCount,
    /// `ClosureNew n`: one minus the count operand.
    OneMinusCount,
}

/// Static description of one opcode.
#[derive(Debug, Clone, Copy)]
pub struct OpcodeMeta {
    pub name: &'static str,
    pub operands: &'static [OperandSchema],
    pub stack: StackDelta,
    /// True when control never falls through to the next operation.
    pub terminates: bool,
}

/// Operand list does not match the opcode's schema. Always a compiler bug,
/// surfaced as an internal compile error.
#[derive(Debug, Clone)]
pub struct OperandError {
    pub opcode: &'static str,
    pub message: String,
}

impl std::fmt::Display for OperandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.opcode, self.message)
    }
}

impl std::error::Error for OperandError {}

use OperandSchema as S;
use StackDelta::{Fixed, MinusCount, OneMinusCount};

impl Opcode {
    /// The metadata table. Everything else - emission, verification, stack
    /// accounting, the binary encoder - derives from this.
    pub fn meta(self) -> OpcodeMeta {
        macro_rules! meta {
            ($name:expr, $operands:expr, $stack:expr, $terminates:expr) => {
                OpcodeMeta {
                    name: $name,
                    operands: $operands,
                    stack: $stack,
                    terminates: $terminates,
                }
            };
        }
        match self {
            Opcode::ArrayNew => meta!("ArrayNew", &[], Fixed(1), false),
            Opcode::BinOp => meta!("BinOp", &[S::Bin], Fixed(-1), false),
            Opcode::Branch => meta!("Branch", &[S::Label, S::Label], Fixed(-1), true),
            Opcode::Call => meta!("Call", &[S::Count], MinusCount, false),
            Opcode::ClosureNew => meta!("ClosureNew", &[S::Count], OneMinusCount, false),
            Opcode::Dup => meta!("Dup", &[], Fixed(1), false),
            Opcode::Jump => meta!("Jump", &[S::Label], Fixed(0), true),
            Opcode::Literal => meta!("Literal", &[S::Literal], Fixed(1), false),
            Opcode::LoadArg => meta!("LoadArg", &[S::Index], Fixed(1), false),
            Opcode::LoadGlobal => meta!("LoadGlobal", &[S::NameOrIndex], Fixed(1), false),
            Opcode::LoadScoped => meta!("LoadScoped", &[S::Index], Fixed(1), false),
            Opcode::LoadVar => meta!("LoadVar", &[S::Index], Fixed(1), false),
            Opcode::Nop => meta!("Nop", &[S::Count], Fixed(0), false),
            Opcode::ObjectGet => meta!("ObjectGet", &[], Fixed(-1), false),
            Opcode::ObjectNew => meta!("ObjectNew", &[], Fixed(1), false),
            Opcode::ObjectSet => meta!("ObjectSet", &[], Fixed(-3), false),
            Opcode::Pop => meta!("Pop", &[S::Count], MinusCount, false),
            Opcode::Return => meta!("Return", &[], Fixed(-1), true),
            Opcode::ScopePush => meta!("ScopePush", &[S::Count], Fixed(0), false),
            Opcode::StoreGlobal => meta!("StoreGlobal", &[S::NameOrIndex], Fixed(0), false),
            Opcode::StoreScoped => meta!("StoreScoped", &[S::Index], Fixed(0), false),
            Opcode::StoreVar => meta!("StoreVar", &[S::Index], Fixed(0), false),
            Opcode::UnOp => meta!("UnOp", &[S::Un], Fixed(0), false),
        }
    }

    /// Check an operand list against the schema.
    pub fn verify(self, operands: &[Operand]) -> Result<(), OperandError> {
        let meta = self.meta();
        if operands.len() != meta.operands.len() {
            return Err(OperandError {
                opcode: meta.name,
                message: format!(
                    "expected {} operand(s), got {}",
                    meta.operands.len(),
                    operands.len()
                ),
            });
        }
        for (i, (schema, operand)) in meta.operands.iter().zip(operands).enumerate() {
            if !schema.admits(operand) {
                return Err(OperandError {
                    opcode: meta.name,
                    message: format!(
                        "operand {} must be a {}, got {}",
                        i,
                        schema.name(),
                        operand.kind()
                    ),
                });
            }
        }
        Ok(())
    }

    /// Static stack delta for a verified operand list.
    pub fn stack_delta(self, operands: &[Operand]) -> i32 {
        let count = || match operands.first() {
            Some(Operand::Count(n)) => *n as i32,
            _ => 0,
        };
        match self.meta().stack {
            Fixed(d) => d as i32,
            MinusCount => -count(),
            OneMinusCount => 1 - count(),
        }
    }

    /// True for `Branch`, `Jump` and `Return`.
    pub fn is_terminator(self) -> bool {
        self.meta().terminates
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.meta().name)
    }
}
