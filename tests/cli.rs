use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::tempdir;

fn pyecho(code: &str) -> Command {
    let mut cmd = Command::cargo_bin("pyecho").expect("binary exists");
    cmd.env_remove("PYECHO_LOG");
    cmd.env("USER_CODE", serde_json::to_string(code).expect("encode program"));
    cmd
}

#[test]
fn pyecho_echoes_last_expression() {
    pyecho("x = 2\ny = 21\nx*y")
        .assert()
        .success()
        .stdout("42\n")
        .stderr("");
}

#[test]
fn pyecho_echoes_assignments() {
    pyecho("1 + 1").assert().success().stdout("2\n");
    pyecho("x = 5").assert().success().stdout("5\n");
    pyecho("x: int = 5").assert().success().stdout("5\n");
}

#[test]
fn pyecho_prints_without_echo() {
    pyecho("print(1)").assert().success().stdout("1\n");
    pyecho("for i in range(3):\n    pass")
        .assert()
        .success()
        .stdout("");
}

#[test]
fn pyecho_reports_runtime_errors() {
    pyecho("print(\"foo\")\nprint(bar)")
        .assert()
        .code(1)
        .stdout("foo\n")
        .stderr("NameError: name 'bar' is not defined\n");

    pyecho("1/0")
        .assert()
        .code(1)
        .stderr("ZeroDivisionError: division by zero\n");
}

#[test]
fn pyecho_reports_syntax_errors() {
    pyecho("print(1)\ndef broken(:\n    pass")
        .assert()
        .code(1)
        .stdout("")
        .stderr(predicate::str::starts_with("  File \"<unknown>\", line 2"))
        .stderr(predicate::str::contains("SyntaxError"));
}

#[test]
fn pyecho_limits_recursion() {
    pyecho("def f(n):\n    return f(n + 1)\nf(0)")
        .assert()
        .code(1)
        .stderr(predicate::str::starts_with("RecursionError"));
}

#[test]
fn pyecho_requires_code() {
    let mut cmd = Command::cargo_bin("pyecho").expect("binary exists");
    cmd.env_remove("USER_CODE");
    cmd.assert()
        .code(1)
        .stdout("")
        .stderr("Error: no code to execute\n");

    for raw in ["", "  \n"] {
        let mut cmd = Command::cargo_bin("pyecho").expect("binary exists");
        cmd.env("USER_CODE", raw);
        cmd.assert()
            .code(1)
            .stderr("Error: no code to execute\n");
    }
}

#[test]
fn pyecho_rejects_invalid_json() {
    let mut cmd = Command::cargo_bin("pyecho").expect("binary exists");
    cmd.env("USER_CODE", "print");
    cmd.assert()
        .code(1)
        .stdout("")
        .stderr("Error: JSON decode failed\n");
}

#[test]
fn pyecho_reads_alternate_sources() {
    let mut cmd = Command::cargo_bin("pyecho").expect("binary exists");
    cmd.env_remove("USER_CODE");
    cmd.env("SNIPPET", "\"'from var'\"");
    cmd.arg("--var").arg("SNIPPET");
    cmd.assert().success().stdout("from var\n");

    pyecho("'from env'")
        .arg("--code")
        .arg("\"'from flag'\"")
        .assert()
        .success()
        .stdout("from flag\n");
}

#[test]
fn pyecho_ignores_working_directory() {
    let dir = tempdir().expect("create temp dir");
    fs::write(dir.path().join("math.py"), "def sqrt(x):\n    return -1\n")
        .expect("write shadowing module");

    pyecho("import math\nmath.sqrt(9)")
        .current_dir(dir.path())
        .assert()
        .success()
        .stdout("3.0\n");
}

#[test]
fn pyecho_recurses_to_depth_500() {
    pyecho("def f(n):\n    return 0 if n == 0 else 1 + f(n - 1)\nf(500)")
        .assert()
        .success()
        .stdout("500\n")
        .stderr("");
}

#[test]
fn pyecho_echoes_big_integers() {
    pyecho("2 ** 64")
        .assert()
        .success()
        .stdout("18446744073709551616\n");
}
