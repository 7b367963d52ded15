use pyecho::{
    DiagnosticKind,
    ast::{ExprKind, StatementKind},
    split::split_source,
};

fn origin(source: &str) -> Option<StatementKind> {
    split_source(source)
        .expect("source should parse")
        .echo
        .map(|target| target.origin)
}

#[test]
fn trailing_expression_leaves_the_body() {
    let split = split_source("x = 1\nx").expect("source should parse");
    assert_eq!(split.body.len(), 1);
    let echo = split.echo.expect("expression is echoed");
    assert_eq!(echo.origin, StatementKind::Expression);
    assert!(matches!(echo.expr.kind, ExprKind::Name(ref name) if name == "x"));
}

#[test]
fn assignments_stay_in_the_body() {
    for (source, kind) in [
        ("a = b = 5", StatementKind::PlainAssignment),
        ("x: int = 5", StatementKind::AnnotatedAssignment),
        ("x += 1", StatementKind::AugmentedAssignment),
    ] {
        let split = split_source(source).expect("source should parse");
        assert_eq!(split.body.len(), 1, "{source}");
        assert_eq!(split.echo.map(|target| target.origin), Some(kind), "{source}");
    }
}

#[test]
fn first_assignment_target_is_echoed() {
    let split = split_source("a = b = 5").expect("source should parse");
    let echo = split.echo.expect("assignment is echoed");
    assert!(matches!(echo.expr.kind, ExprKind::Name(ref name) if name == "a"));

    let split = split_source("a, b = 1, 2").expect("source should parse");
    let echo = split.echo.expect("assignment is echoed");
    assert!(matches!(echo.expr.kind, ExprKind::Tuple(ref items) if items.len() == 2));
}

#[test]
fn other_statements_echo_nothing() {
    assert_eq!(origin(""), None);
    assert_eq!(origin("# only a comment\n"), None);
    assert_eq!(origin("for i in range(3):\n    pass"), None);
    assert_eq!(origin("def f():\n    return 1"), None);
    assert_eq!(origin("import math"), None);

    let split = split_source("x = 1\nif x:\n    x").expect("source should parse");
    assert_eq!(split.body.len(), 2);
    assert!(split.echo.is_none(), "nested expressions are not echoed");
}

#[test]
fn syntax_errors_surface_as_diagnostics() {
    let diagnostic = split_source("x = (").expect_err("unclosed paren is rejected");
    assert_eq!(diagnostic.kind, DiagnosticKind::Syntax);

    let diagnostic = split_source("  x = 1").expect_err("leading indent is rejected");
    assert_eq!(diagnostic.kind, DiagnosticKind::Indentation);
}

#[test]
fn malformed_literals_are_rejected() {
    for (source, message) in [
        (
            "07",
            "leading zeros in decimal integer literals are not permitted; use an 0o prefix for octal integers",
        ),
        ("1__0", "invalid decimal literal"),
        (
            r"'\x'",
            r"(unicode error) 'unicodeescape' codec can't decode bytes in position 0-1: truncated \xXX escape",
        ),
        ("0x", "invalid hexadecimal literal"),
        ("0b102", "invalid digit '2' in binary literal"),
    ] {
        let diagnostic = split_source(source).expect_err("literal is rejected");
        assert_eq!(diagnostic.kind, DiagnosticKind::Syntax, "{source}");
        assert_eq!(diagnostic.message, message, "{source}");
    }
    assert!(split_source("0 + 00 + 1_000").is_ok());
}
