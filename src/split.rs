//! Separates a parsed program into the statements to execute and the
//! expression whose value is echoed afterwards.

use crate::{
    ast::{Expr, Program, StatementKind, Stmt, StmtKind},
    diagnostics::Diagnostic,
    parser,
};

/// The expression echoed after the body runs.
#[derive(Debug, Clone)]
pub struct EchoTarget {
    pub expr: Expr,
    pub origin: StatementKind,
}

#[derive(Debug, Clone)]
pub struct Split {
    pub body: Vec<Stmt>,
    pub echo: Option<EchoTarget>,
}

impl Split {
    /// A trailing expression statement leaves the body and becomes the echo
    /// target. A trailing assignment stays in the body and its (first)
    /// target is echoed. Anything else echoes nothing.
    pub fn from_program(program: Program) -> Self {
        let mut body = program.body;
        let origin = body
            .last()
            .map(Stmt::statement_kind)
            .unwrap_or(StatementKind::Other);

        let echo = match origin {
            StatementKind::Expression => match body.pop() {
                Some(Stmt {
                    kind: StmtKind::Expr(expr),
                    ..
                }) => Some(EchoTarget { expr, origin }),
                _ => None,
            },
            StatementKind::PlainAssignment
            | StatementKind::AnnotatedAssignment
            | StatementKind::AugmentedAssignment => body
                .last()
                .and_then(assignment_target)
                .map(|expr| EchoTarget {
                    expr: expr.clone(),
                    origin,
                }),
            StatementKind::Other => None,
        };

        Self { body, echo }
    }
}

fn assignment_target(stmt: &Stmt) -> Option<&Expr> {
    match &stmt.kind {
        StmtKind::Assign { targets, .. } => targets.first(),
        StmtKind::AnnAssign { target, .. } | StmtKind::AugAssign { target, .. } => Some(target),
        _ => None,
    }
}

pub fn split_source(source: &str) -> Result<Split, Diagnostic> {
    let program = parser::parse_program(source)?;
    Ok(Split::from_program(program))
}
