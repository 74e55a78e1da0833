//! Error types for the loop-nest compiler

use thiserror::Error;

/// Result type for compilation operations
pub type CompileResult<T> = Result<T, CompileError>;

/// Compilation errors
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("Parser error: {message}")]
    ParseError { message: String },

    #[error("Shape mismatch: inner dimensions {lhs} and {rhs} do not match")]
    ShapeMismatch { lhs: usize, rhs: usize },

    #[error("Unsupported op: {message}")]
    UnsupportedOp { message: String },

    #[error("Unsupported target: {target}")]
    UnsupportedTarget { target: String },

    #[error("Unknown loop variable: {name}")]
    UnknownLoopVariable { name: String },

    #[error("Invalid schedule: {message}")]
    InvalidSchedule { message: String },

    #[error("Duplicate output name: {name}")]
    DuplicateOutputName { name: String },

    #[error("Loop bound `{expr}` of `{var}` is not reducible to an integer constant")]
    NonNumericBound { var: String, expr: String },

    #[error("Hoisted value `{what}` references `{var}` before its loop is opened")]
    HoistOutOfScope { what: String, var: String },

    #[error("Invalid procedure name: {name}")]
    InvalidName { name: String },

    #[error("Execution error: {message}")]
    Execution { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CompileError {
    pub fn parse_error(msg: impl Into<String>) -> Self {
        CompileError::ParseError { message: msg.into() }
    }

    pub fn unsupported_op(msg: impl Into<String>) -> Self {
        CompileError::UnsupportedOp { message: msg.into() }
    }

    pub fn unsupported_target(target: impl Into<String>) -> Self {
        CompileError::UnsupportedTarget { target: target.into() }
    }

    pub fn unknown_loop(name: impl Into<String>) -> Self {
        CompileError::UnknownLoopVariable { name: name.into() }
    }

    pub fn schedule(msg: impl Into<String>) -> Self {
        CompileError::InvalidSchedule { message: msg.into() }
    }

    pub fn execution(msg: impl Into<String>) -> Self {
        CompileError::Execution { message: msg.into() }
    }
}
