// amber-compiler - Scope analysis and IL lowering for the Amber scripting engine
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! The ahead-of-time compiler: scope analysis plus IL lowering.
//!
//! The pipeline is deliberately small: [`analysis::analyse`] produces the
//! scope model (bindings, references, slots), and [`codegen::compile`] lowers
//! the tree against it into an [`amber_il::Unit`] ready for the host-side VM.
//! Source parsing is an external concern; the input is the typed tree from
//! `amber-ast`.

pub mod analysis;
pub mod codegen;
pub mod cursor;
pub mod error;
pub mod scope;

pub use analysis::analyse;
pub use codegen::compile;
pub use error::{CompileError, Result};
pub use scope::{
    Binding, BindingId, BindingKind, PrologueStep, Reference, Resolution, Scope, ScopeId,
    ScopeKind, ScopeModel, Slot,
};
