// amber-vm - Host-side virtual machine for the Amber scripting engine
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! Runtime error types.

/// Error during VM execution or host API use.
#[derive(Debug, Clone)]
pub enum RuntimeError {
    /// Stack underflow. Indicates a compiler bug, since stack depths are
    /// verified at compile time.
    StackUnderflow,
    /// Wrong type for an operation.
    TypeError { expected: String, got: String },
    /// Global slot not present.
    UndefinedGlobal(String),
    /// Attempted to call something that isn't callable.
    NotCallable(String),
    /// Call stack exceeded the configured limit.
    CallDepthExceeded,
    /// Host API misuse (unknown export id, unresolved import, bad module
    /// map shape).
    InvalidOperation(String),
    /// The module failed to compile during `evaluate_module`.
    Compile(String),
    /// Internal error. Signals a bug, not a property of the program.
    Internal(String),
}

impl RuntimeError {
    pub(crate) fn internal(message: impl Into<String>) -> Self {
        RuntimeError::Internal(message.into())
    }

    pub(crate) fn type_error(expected: impl Into<String>, got: impl Into<String>) -> Self {
        RuntimeError::TypeError {
            expected: expected.into(),
            got: got.into(),
        }
    }
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeError::StackUnderflow => write!(f, "Stack underflow"),
            RuntimeError::TypeError { expected, got } => {
                write!(f, "Type error: expected {}, got {}", expected, got)
            }
            RuntimeError::UndefinedGlobal(name) => write!(f, "Undefined global: {}", name),
            RuntimeError::NotCallable(what) => write!(f, "Value is not callable: {}", what),
            RuntimeError::CallDepthExceeded => write!(f, "Maximum call depth exceeded"),
            RuntimeError::InvalidOperation(message) => {
                write!(f, "Invalid operation: {}", message)
            }
            RuntimeError::Compile(message) => write!(f, "Compile error: {}", message),
            RuntimeError::Internal(message) => write!(f, "Internal VM error: {}", message),
        }
    }
}

impl std::error::Error for RuntimeError {}

/// Result type for VM operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;
