// amber-ast - Syntax tree contract for the Amber ahead-of-time compiler
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! Typed syntax tree consumed by the Amber compiler.
//!
//! Parsing is not this project's concern: an external front end produces this
//! tree over a restricted grammar and the compiler consumes it. The types here
//! are therefore a contract, not an implementation detail - every node carries
//! a source location, and identifier/function nodes additionally carry a
//! producer-assigned [`NodeId`] that the scope analyser keys its side tables
//! by.
//!
//! [`AstBuilder`] hands out fresh node ids; tests use it to assemble programs
//! directly.

pub mod builder;
pub mod node;
pub mod ops;

pub use builder::AstBuilder;
pub use node::{
    Declarator, Expr, ExprKind, FunctionBody, FunctionNode, Identifier, ImportSpecifier, Lit,
    MemberProperty, NodeId, ObjectProperty, Program, SourceLoc, Stmt, StmtKind, SwitchCase,
};
pub use node::{DeclKind, ForInit};
pub use ops::{AssignOp, BinaryOp, LogicalOp, UnaryOp, UpdateOp};
