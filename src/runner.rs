//! One invocation end to end: decode the JSON-wrapped input, run it, and
//! report the outcome on the diagnostic stream.

use std::io::Write;

use serde_json::Value as Json;
use tracing::debug;

use crate::{
    diagnostics::{PyEchoError, Result},
    exception::{ExcKind, Exception},
    runtime::{ExecutionContext, Interpreter},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    Failure,
}

impl Status {
    pub fn code(self) -> u8 {
        match self {
            Status::Success => 0,
            Status::Failure => 1,
        }
    }
}

/// Extracts program text from the JSON input. A JSON string is the program;
/// an object carrying a string `"code"` member is unwrapped.
pub fn decode(raw: &str) -> Result<String> {
    let json: Json = serde_json::from_str(raw)?;
    match json {
        Json::String(code) => Ok(code),
        Json::Object(mut fields) => match fields.remove("code") {
            Some(Json::String(code)) => Ok(code),
            _ => Err(not_source().into()),
        },
        _ => Err(not_source().into()),
    }
}

fn not_source() -> Exception {
    Exception::new(
        ExcKind::TypeError,
        "compile() arg 1 must be a string, bytes or AST object",
    )
}

/// Decodes and runs `raw`, with program output on `stdout`. Whatever fails
/// is reported once on `stderr`.
pub fn run(
    raw: Option<&str>,
    context: ExecutionContext,
    stdout: Box<dyn Write>,
    stderr: &mut dyn Write,
) -> Status {
    match execute(raw, context, stdout) {
        Ok(()) => {
            debug!("run succeeded");
            Status::Success
        }
        Err(err) => {
            debug!(error = %err, "run failed");
            let report = err.report_lines().join("\n");
            stderr.write_all(report.as_bytes()).ok();
            stderr.flush().ok();
            Status::Failure
        }
    }
}

fn execute(raw: Option<&str>, context: ExecutionContext, stdout: Box<dyn Write>) -> Result<()> {
    let raw = raw
        .filter(|raw| !raw.trim().is_empty())
        .ok_or(PyEchoError::MissingInput)?;
    let source = decode(raw)?;
    debug!(bytes = source.len(), "decoded input");
    let mut interpreter = Interpreter::with_context(context, stdout);
    interpreter.run_source(&source)
}
