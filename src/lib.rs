//! Loop-nest compiler for matrix multiplication
//!
//! This library lowers a matrix-multiply shape description into an explicit
//! loop-nest IR, applies schedule transformations (tiling, reordering,
//! promotion of loop-invariant loads) and emits either a readable IR listing
//! or a flattened C++ procedure.
//!
//! # Example
//!
//! ```rust
//! use loopnest::{compile_description, Dialect};
//!
//! let source = compile_description("[4, 3] @ [3, 5]", Dialect::Debug).unwrap();
//! assert!(source.text.starts_with("@IR.mm"));
//! println!("{}", source);
//! ```

pub mod error;
pub mod lexer;
pub mod parser;
pub mod expr;
pub mod ir;
pub mod lower;
pub mod schedule;
pub mod codegen;
pub mod compile;
pub mod interp;

pub use codegen::{CodeGenerator, CodegenConfig, Dialect, ElementType};
pub use compile::{compile, compile_batch, compile_with, link, CompiledSource, LinkedModule};
pub use error::{CompileError, CompileResult};
pub use expr::IndexExpr;
pub use interp::{execute, trace, Matrix, Trace};
pub use ir::{IndexHoist, Loop, Op, Promotion, Reduction, TensorAccess};
pub use lower::{lower, lower_matmul, lower_str};
pub use parser::{Parser, ShapeDescription};
pub use schedule::Schedule;

use std::io::IsTerminal;
use tracing::subscriber::SetGlobalDefaultError;
use tracing::Level;

/// Lower a shape description and compile it without scheduling
pub fn compile_description(source: &str, target: Dialect) -> CompileResult<CompiledSource> {
    let op = lower_str(source)?;
    compile(&op.into(), target, None)
}

/// Initialize logging with the given level.
///
/// Logs go to stderr so generated code on stdout stays clean.
pub fn init_subscriber(level: Level) -> Result<(), SetGlobalDefaultError> {
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .without_time()
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
}
