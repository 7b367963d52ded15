//! Runs a JSON-wrapped Python snippet and echoes the value of its last
//! statement. Implements lexing, parsing, the program split, a tree-walking
//! evaluator with its builtins, and the error reporter behind `pyecho`.

pub mod ast;
pub mod diagnostics;
pub mod environment;
pub mod exception;
pub mod format;
pub mod lexer;
pub mod methods;
pub mod ops;
pub mod parser;
pub mod runner;
pub mod runtime;
pub mod split;
pub mod stdlib;
pub mod value;

pub use diagnostics::{Diagnostic, DiagnosticKind, PyEchoError, SourceSpan};
pub use exception::{ExcKind, Exception, PyResult};
pub use runner::Status;
pub use runtime::{ExecutionContext, Interpreter};
pub use split::{EchoTarget, Split};
pub use value::Value;
