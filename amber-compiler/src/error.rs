// amber-compiler - Scope analysis and IL lowering for the Amber scripting engine
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! Compiler error types.
//!
//! Everything user-visible carries a source location. `Internal` means an
//! invariant inside the compiler was violated - a bug, not a property of the
//! input program.

use amber_ast::SourceLoc;

/// Error during compilation.
#[derive(Debug, Clone)]
pub enum CompileError {
    /// Language restriction the program ran into (reserved operator,
    /// unsupported construct, labelled break, ...).
    Unsupported {
        construct: String,
        loc: SourceLoc,
    },
    /// Intentional subset restriction (async functions, ...).
    FeatureNotSupported {
        feature: String,
        loc: SourceLoc,
    },
    /// Two declarations of the same name in one scope.
    DuplicateBinding {
        name: String,
        loc: SourceLoc,
    },
    /// Assignment to a `const` binding.
    AssignToConst {
        name: String,
        loc: SourceLoc,
    },
    /// Assignment to an imported binding.
    AssignToImport {
        name: String,
        loc: SourceLoc,
    },
    /// Compiler invariant violation. Signals a bug, not bad input.
    Internal(String),
}

impl CompileError {
    pub(crate) fn unsupported(construct: impl Into<String>, loc: SourceLoc) -> Self {
        CompileError::Unsupported {
            construct: construct.into(),
            loc,
        }
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        CompileError::Internal(message.into())
    }
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompileError::Unsupported { construct, loc } => {
                write!(f, "Not supported: {} ({})", construct, loc)
            }
            CompileError::FeatureNotSupported { feature, loc } => {
                write!(f, "Feature not supported: {} ({})", feature, loc)
            }
            CompileError::DuplicateBinding { name, loc } => {
                write!(f, "Duplicate declaration of '{}' ({})", name, loc)
            }
            CompileError::AssignToConst { name, loc } => {
                write!(f, "Cannot assign to constant '{}' ({})", name, loc)
            }
            CompileError::AssignToImport { name, loc } => {
                write!(f, "Cannot assign to imported binding '{}' ({})", name, loc)
            }
            CompileError::Internal(message) => {
                write!(f, "Internal compile error: {}", message)
            }
        }
    }
}

impl std::error::Error for CompileError {}

/// Result type for compilation.
pub type Result<T> = std::result::Result<T, CompileError>;
