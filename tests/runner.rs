use pyecho::{ExecutionContext, PyEchoError, Status, runner};
use std::{cell::RefCell, io, rc::Rc};

#[derive(Clone, Default)]
struct SharedBuffer(Rc<RefCell<Vec<u8>>>);

impl io::Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct Outcome {
    status: Status,
    stdout: String,
    stderr: String,
}

fn invoke(raw: Option<&str>) -> Outcome {
    let stdout = SharedBuffer::default();
    let mut stderr = Vec::new();
    let status = runner::run(
        raw,
        ExecutionContext::default(),
        Box::new(stdout.clone()),
        &mut stderr,
    );
    let stdout = String::from_utf8(stdout.0.borrow().clone()).expect("stdout is utf-8");
    Outcome {
        status,
        stdout,
        stderr: String::from_utf8(stderr).expect("stderr is utf-8"),
    }
}

#[test]
fn decode_accepts_json_strings() {
    let code = runner::decode(r#""x = 1\nx""#).expect("string decodes");
    assert_eq!(code, "x = 1\nx");
}

#[test]
fn decode_unwraps_code_objects() {
    let code = runner::decode(r#"{"code": "print(1)", "lang": "python"}"#)
        .expect("object with code decodes");
    assert_eq!(code, "print(1)");
}

#[test]
fn decode_rejects_invalid_json() {
    let err = runner::decode("print(1)").expect_err("bare code is not json");
    assert!(matches!(err, PyEchoError::Decode(_)));
    assert_eq!(err.report_lines(), vec!["Error: JSON decode failed\n"]);
}

#[test]
fn decode_rejects_non_string_programs() {
    for raw in ["42", "[\"x\"]", r#"{"code": 1}"#, "null"] {
        let err = runner::decode(raw).expect_err("non-string program is rejected");
        assert_eq!(
            err.report_lines().join("\n"),
            "TypeError: compile() arg 1 must be a string, bytes or AST object\n",
            "{raw}"
        );
    }
}

#[test]
fn successful_run_reports_nothing() {
    let outcome = invoke(Some(r#""x = 2\ny = 21\nx*y""#));
    assert_eq!(outcome.status, Status::Success);
    assert_eq!(outcome.status.code(), 0);
    assert_eq!(outcome.stdout, "42\n");
    assert_eq!(outcome.stderr, "");
}

#[test]
fn missing_or_blank_input_fails() {
    for raw in [None, Some(""), Some("   \n\t")] {
        let outcome = invoke(raw);
        assert_eq!(outcome.status, Status::Failure);
        assert_eq!(outcome.status.code(), 1);
        assert_eq!(outcome.stdout, "");
        assert_eq!(outcome.stderr, "Error: no code to execute\n");
    }
}

#[test]
fn empty_program_succeeds_silently() {
    let outcome = invoke(Some(r#""""#));
    assert_eq!(outcome.status, Status::Success);
    assert_eq!(outcome.stdout, "");
}

#[test]
fn runtime_errors_keep_earlier_output() {
    let outcome = invoke(Some(r#""print(\"foo\")\nprint(bar)""#));
    assert_eq!(outcome.status, Status::Failure);
    assert_eq!(outcome.stdout, "foo\n");
    assert_eq!(outcome.stderr, "NameError: name 'bar' is not defined\n");
}

#[test]
fn syntax_errors_name_the_line() {
    let outcome = invoke(Some(r#""x = 1\ny = (""#));
    assert_eq!(outcome.status, Status::Failure);
    assert!(
        outcome.stderr.starts_with("  File \"<unknown>\", line 2\n"),
        "{}",
        outcome.stderr
    );
    assert!(outcome.stderr.contains("SyntaxError: "), "{}", outcome.stderr);
}

#[test]
fn default_context_runs_deep_recursion() {
    let outcome = invoke(Some(
        r#""def f(n):\n    return 0 if n == 0 else 1 + f(n - 1)\nf(500)""#,
    ));
    assert_eq!(outcome.status, Status::Success);
    assert_eq!(outcome.stdout, "500\n");
    assert_eq!(outcome.stderr, "");
}
