use std::fmt;

use thiserror::Error;

use crate::exception::Exception;

/// Represents a byte span within a source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceSpan {
    pub start: usize,
    pub end: usize,
}

impl SourceSpan {
    pub const fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub const fn to(self, other: SourceSpan) -> Self {
        Self {
            start: self.start,
            end: other.end,
        }
    }
}

/// Classification of a compile-time diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    Syntax,
    Indentation,
}

impl DiagnosticKind {
    pub fn exception_name(self) -> &'static str {
        match self {
            DiagnosticKind::Syntax => "SyntaxError",
            DiagnosticKind::Indentation => "IndentationError",
        }
    }
}

/// A syntax problem found while lexing or parsing.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub message: String,
    pub span: Option<SourceSpan>,
}

impl Diagnostic {
    pub fn new(kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            span: None,
        }
    }

    pub fn syntax(message: impl Into<String>) -> Self {
        Self::new(DiagnosticKind::Syntax, message)
    }

    pub fn indentation(message: impl Into<String>) -> Self {
        Self::new(DiagnosticKind::Indentation, message)
    }

    pub fn with_span(mut self, span: SourceSpan) -> Self {
        self.span = Some(span);
        self
    }

    /// Lines in the shape `traceback.format_exception_only` produces for a
    /// `SyntaxError`: location, offending line, caret, then the message.
    pub fn render(&self, source: &str, filename: &str) -> Vec<String> {
        let mut lines = Vec::new();
        if let Some(span) = self.span {
            let location = locate(source, span.start);
            lines.push(format!("  File \"{filename}\", line {}\n", location.line));
            let stripped = location.text.trim_start();
            let indent = location.text.chars().count() - stripped.chars().count();
            let stripped = stripped.trim_end();
            if !stripped.is_empty() {
                lines.push(format!("    {stripped}\n"));
                let column = location.column.saturating_sub(indent);
                let remaining = stripped.chars().count().saturating_sub(column);
                let width = source
                    .get(span.start..span.end.max(span.start))
                    .map(|text| text.chars().take_while(|ch| *ch != '\n').count())
                    .unwrap_or(0)
                    .clamp(1, remaining.max(1));
                lines.push(format!("    {}{}\n", " ".repeat(column), "^".repeat(width)));
            }
        }
        lines.push(format!("{}: {}\n", self.kind.exception_name(), self.message));
        lines
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.exception_name(), self.message)?;
        if let Some(span) = self.span {
            write!(f, " ({}..{})", span.start, span.end)?;
        }
        Ok(())
    }
}

impl std::error::Error for Diagnostic {}

struct Location<'a> {
    line: usize,
    column: usize,
    text: &'a str,
}

fn locate(source: &str, offset: usize) -> Location<'_> {
    let offset = offset.min(source.len());
    let mut line_start = source[..offset].rfind('\n').map(|idx| idx + 1).unwrap_or(0);
    let mut line = source[..line_start].matches('\n').count() + 1;
    let mut line_end = source[line_start..]
        .find('\n')
        .map(|idx| line_start + idx)
        .unwrap_or(source.len());
    let mut column = source[line_start..offset].chars().count();

    // A caret past the end of the final (empty) line points at the end of
    // the previous line instead.
    if line_start == line_end && line_start > 0 && offset == source.len() {
        line_end = line_start - 1;
        line_start = source[..line_end].rfind('\n').map(|idx| idx + 1).unwrap_or(0);
        line -= 1;
        column = source[line_start..line_end].chars().count();
    }

    Location {
        line,
        column,
        text: &source[line_start..line_end],
    }
}

/// Unified error type for one pipeline invocation.
#[derive(Debug, Error)]
pub enum PyEchoError {
    #[error("no code to execute")]
    MissingInput,
    #[error("JSON decode failed")]
    Decode(#[from] serde_json::Error),
    #[error("{diagnostic}")]
    Syntax {
        diagnostic: Diagnostic,
        text: String,
        filename: String,
    },
    #[error("{0}")]
    Exception(#[from] Exception),
}

impl PyEchoError {
    /// The pieces of the diagnostic report, to be joined with `"\n"`.
    pub fn report_lines(&self) -> Vec<String> {
        match self {
            PyEchoError::MissingInput => vec!["Error: no code to execute\n".to_string()],
            PyEchoError::Decode(_) => vec!["Error: JSON decode failed\n".to_string()],
            PyEchoError::Syntax {
                diagnostic,
                text,
                filename,
            } => diagnostic.render(text, filename),
            PyEchoError::Exception(exception) => vec![exception.render()],
        }
    }
}

pub type Result<T> = std::result::Result<T, PyEchoError>;
