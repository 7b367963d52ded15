use pyecho::{
    ExcKind, ExecutionContext, PyEchoError,
    runtime::Interpreter,
    value::{Value, ValueKind},
};
use std::{cell::RefCell, io, rc::Rc};

#[derive(Clone, Default)]
struct SharedBuffer(Rc<RefCell<Vec<u8>>>);

impl SharedBuffer {
    fn contents(&self) -> String {
        String::from_utf8(self.0.borrow().clone()).expect("output is utf-8")
    }
}

impl io::Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn run(source: &str) -> String {
    let buffer = SharedBuffer::default();
    let mut interpreter = Interpreter::with_output(Box::new(buffer.clone()));
    interpreter
        .run_source(source)
        .expect("program should succeed");
    buffer.contents()
}

fn run_error(source: &str) -> (String, PyEchoError) {
    let buffer = SharedBuffer::default();
    let mut interpreter = Interpreter::with_output(Box::new(buffer.clone()));
    match interpreter.run_source(source) {
        Ok(()) => panic!("expected error, program printed {:?}", buffer.contents()),
        Err(err) => (buffer.contents(), err),
    }
}

fn report(source: &str) -> String {
    let (_, err) = run_error(source);
    err.report_lines().join("\n")
}

fn expect_int(value: &Value) -> i64 {
    match value.kind() {
        ValueKind::Int(n) => *n,
        _ => panic!("expected int, found {}", value.type_name()),
    }
}

#[test]
fn echoes_trailing_expression() {
    assert_eq!(run("x = 2\ny = 21\nx*y"), "42\n");
}

#[test]
fn echoes_assignment_targets() {
    assert_eq!(run("x = 5"), "5\n");
    assert_eq!(run("x: int = 5"), "5\n");
    assert_eq!(run("a = b = 7"), "7\n");
    assert_eq!(run("a, b = 1, 2"), "(1, 2)\n");
    assert_eq!(run("x = 1\nx += 41"), "42\n");
}

#[test]
fn none_and_compound_statements_echo_nothing() {
    assert_eq!(run("print(1)"), "1\n");
    assert_eq!(run("None"), "");
    assert_eq!(run("for i in range(3):\n    pass"), "");
    assert_eq!(run("def f():\n    return 1"), "");
    assert_eq!(run(""), "");
}

#[test]
fn echo_strings_use_str_not_repr() {
    assert_eq!(run("'hi'"), "hi\n");
    assert_eq!(run("['hi']"), "['hi']\n");
}

#[test]
fn trailing_expression_runs_once() {
    let buffer = SharedBuffer::default();
    let mut interpreter = Interpreter::with_output(Box::new(buffer.clone()));
    interpreter
        .run_source("calls = []\ndef f():\n    calls.append(1)\n    return 5\nx: int = f()")
        .expect("program should succeed");
    assert_eq!(buffer.contents(), "5\n");

    let calls = interpreter.global("calls").expect("calls is bound");
    match calls.kind() {
        ValueKind::List(items) => assert_eq!(items.borrow().len(), 1),
        _ => panic!("calls should be a list"),
    }
    assert_eq!(expect_int(&interpreter.global("x").expect("x is bound")), 5);
}

#[test]
fn bare_annotation_does_not_bind() {
    let (_, err) = run_error("x: int");
    match err {
        PyEchoError::Exception(exception) => {
            assert!(exception.is_instance_of(ExcKind::NameError));
            assert_eq!(exception.message(), "name 'x' is not defined");
        }
        other => panic!("expected NameError, found {other:?}"),
    }
}

#[test]
fn output_precedes_the_error() {
    let (stdout, err) = run_error("print(\"foo\")\nprint(bar)");
    assert_eq!(stdout, "foo\n");
    assert_eq!(
        err.report_lines().join("\n"),
        "NameError: name 'bar' is not defined\n"
    );
}

#[test]
fn arithmetic_follows_python_semantics() {
    assert_eq!(run("0.1 + 0.2"), "0.30000000000000004\n");
    assert_eq!(run("10 / 4"), "2.5\n");
    assert_eq!(run("7 // -2"), "-4\n");
    assert_eq!(run("-7 % 3"), "2\n");
    assert_eq!(run("1 < 2 < 3 and not (3 < 2)"), "True\n");
    assert_eq!(report("1 / 0"), "ZeroDivisionError: division by zero\n");
}

#[test]
fn closures_update_enclosing_bindings() {
    let source = r#"
def counter():
    count = 0
    def inc():
        nonlocal count
        count += 1
        return count
    return inc
c = counter()
c()
c()
c()
"#;
    assert_eq!(run(source), "3\n");

    let source = r#"
total = 0
def add(v):
    global total
    total += v
add(3)
add(4)
total
"#;
    assert_eq!(run(source), "7\n");
}

#[test]
fn loops_support_break_and_else() {
    let source = r#"
n = 0
while n < 10:
    n += 1
    if n == 4:
        break
else:
    n = -1
n
"#;
    assert_eq!(run(source), "4\n");
}

#[test]
fn classes_dispatch_through_inheritance() {
    let source = r#"
class Animal:
    def __init__(self, name):
        self.name = name
    def speak(self):
        return self.name + " makes a sound"
class Dog(Animal):
    def speak(self):
        return self.name + " barks"
d = Dog("Rex")
d.speak()
"#;
    assert_eq!(run(source), "Rex barks\n");
}

#[test]
fn containers_use_user_repr() {
    let source = r#"
class P:
    def __init__(self, x, y):
        self.x = x
        self.y = y
    def __repr__(self):
        return f"P({self.x}, {self.y})"
[P(1, 2), P(3, 4)]
"#;
    assert_eq!(run(source), "[P(1, 2), P(3, 4)]\n");
}

#[test]
fn finally_runs_after_handler() {
    let source = r#"
log = []
try:
    1 / 0
except ZeroDivisionError as e:
    log.append(str(e))
finally:
    log.append("done")
log
"#;
    assert_eq!(run(source), "['division by zero', 'done']\n");
}

#[test]
fn explicit_cause_is_reported_first() {
    let source = r#"
try:
    {}["k"]
except KeyError as e:
    raise ValueError("bad") from e
"#;
    assert_eq!(
        report(source),
        "KeyError: 'k'\n\nThe above exception was the direct cause of the following exception:\n\nValueError: bad\n"
    );
}

#[test]
fn implicit_context_is_reported_first() {
    let source = r#"
try:
    [][0]
except IndexError:
    undefined_name
"#;
    assert_eq!(
        report(source),
        "IndexError: list index out of range\n\nDuring handling of the above exception, another exception occurred:\n\nNameError: name 'undefined_name' is not defined\n"
    );
}

#[test]
fn raise_from_none_hides_context() {
    let source = r#"
try:
    [][0]
except IndexError:
    raise KeyError("x") from None
"#;
    assert_eq!(report(source), "KeyError: 'x'\n");
}

#[test]
fn user_exceptions_carry_their_class() {
    let source = r#"
class AppError(Exception):
    pass
try:
    raise AppError("boom")
except Exception as e:
    result = f"{type(e).__name__}: {e}"
result
"#;
    assert_eq!(run(source), "AppError: boom\n");
    assert_eq!(
        report("class AppError(Exception):\n    pass\nraise AppError('boom')"),
        "AppError: boom\n"
    );
}

#[test]
fn assert_reports_its_message() {
    assert_eq!(report("assert 1 == 2, 'nope'"), "AssertionError: nope\n");
}

#[test]
fn comprehensions_have_their_own_scope() {
    assert_eq!(
        run("x = 10\nsquares = [x * x for x in range(3)]\n(x, squares)"),
        "(10, [0, 1, 4])\n"
    );
    assert_eq!(
        run("{k: v for k, v in [('a', 1), ('b', 2)] if v > 1}"),
        "{'b': 2}\n"
    );
}

#[test]
fn builtins_cover_common_calls() {
    assert_eq!(run("sorted([3, 1, 2], reverse=True)"), "[3, 2, 1]\n");
    assert_eq!(run("max([1, 5, 3], key=lambda v: -v)"), "1\n");
    assert_eq!(run("list(zip('ab', [1, 2]))"), "[('a', 1), ('b', 2)]\n");
    assert_eq!(run("dict(a=1, b=2)"), "{'a': 1, 'b': 2}\n");
    assert_eq!(run("print('a', 'b', sep='-', end='!\\n')"), "a-b!\n");
}

#[test]
fn slicing_handles_steps_and_assignment() {
    assert_eq!(run("'hello'[::-1]"), "olleh\n");
    assert_eq!(run("list(range(10))[2:8:3]"), "[2, 5]\n");
    assert_eq!(run("range(10)[::-2]"), "range(9, -1, -2)\n");
    assert_eq!(run("xs = [1, 2, 3, 4]\nxs[1:3] = ['x']\nxs"), "[1, 'x', 4]\n");
}

#[test]
fn augmented_list_assignment_mutates_in_place() {
    assert_eq!(run("a = [1]\nb = a\nb += [2]\na"), "[1, 2]\n");
}

#[test]
fn string_methods_and_formatting() {
    assert_eq!(run("'-'.join(['a', 'b', 'c']).upper()"), "A-B-C\n");
    assert_eq!(run("'{} + {} = {:>4}'.format(1, 2, 3)"), "1 + 2 =    3\n");
    assert_eq!(run("f'{3.14159:.2f}'"), "3.14\n");
    assert_eq!(run("s = 'hi'\nf'{s!r:>6}'"), "  'hi'\n");
}

#[test]
fn dict_methods_read_and_write() {
    assert_eq!(run("d = {'a': 1}\nd['b'] = 2\nd.get('c', 0) + len(d)"), "2\n");
    assert_eq!(
        report("d = {}\nd['missing']"),
        "KeyError: 'missing'\n"
    );
}

#[test]
fn math_module_imports() {
    assert_eq!(run("import math\nmath.sqrt(16)"), "4.0\n");
    assert_eq!(run("from math import factorial as fact\nfact(5)"), "120\n");
    assert_eq!(
        report("import numpy"),
        "ModuleNotFoundError: No module named 'numpy'\n"
    );
}

#[test]
fn recursion_limit_raises() {
    let buffer = SharedBuffer::default();
    let context = ExecutionContext {
        recursion_limit: 20,
        ..ExecutionContext::default()
    };
    let mut interpreter = Interpreter::with_context(context, Box::new(buffer.clone()));
    let err = interpreter
        .run_source("def f(n):\n    return f(n + 1)\nf(0)")
        .expect_err("recursion should fail");
    match err {
        PyEchoError::Exception(exception) => {
            assert!(exception.is_instance_of(ExcKind::RecursionError));
        }
        other => panic!("expected RecursionError, found {other:?}"),
    }
}

#[test]
fn syntax_errors_are_reported_with_location() {
    let (stdout, err) = run_error("print(1)\nx = (1,");
    assert_eq!(stdout, "", "nothing runs before a syntax error");
    assert!(matches!(err, PyEchoError::Syntax { .. }));
    let text = err.report_lines().join("\n");
    assert!(text.starts_with("  File \"<unknown>\", line"), "{text}");
    assert!(text.contains("SyntaxError: "), "{text}");
}

#[test]
fn fresh_interpreter_has_empty_namespace() {
    let interpreter = Interpreter::new();
    assert!(interpreter.namespace().is_empty());
}

#[test]
fn default_limit_allows_deep_recursion() {
    let source = "def f(n):\n    return 0 if n == 0 else 1 + f(n - 1)\nf(500)";
    assert_eq!(run(source), "500\n");
}

#[test]
fn default_limit_stops_runaway_recursion() {
    let (_, err) = run_error("def f(n):\n    return f(n + 1)\nf(0)");
    match err {
        PyEchoError::Exception(exception) => {
            assert!(exception.is_instance_of(ExcKind::RecursionError));
        }
        other => panic!("expected RecursionError, found {other:?}"),
    }
}

#[test]
fn exception_subclass_runs_its_initializer() {
    let source = "class E(Exception):\n    def __init__(self, x):\n        super().__init__('bad ' + x)\n        self.v = x\nraise E('x')";
    assert_eq!(report(source), "E: bad x\n");

    let source = "class E(Exception):\n    def __init__(self, v):\n        self.v = v\ntry:\n    raise E(7)\nexcept E as e:\n    r = e.v\nr";
    assert_eq!(run(source), "7\n");
}

#[test]
fn exception_report_uses_user_str() {
    let source = "class E(Exception):\n    def __str__(self):\n        return 'custom'\nraise E(1)";
    assert_eq!(report(source), "E: custom\n");
}

#[test]
fn super_without_arguments_calls_the_parent() {
    let source = "class A:\n    def f(self):\n        return 1\nclass B(A):\n    def f(self):\n        return super().f() + 1\nB().f()";
    assert_eq!(run(source), "2\n");

    let source = "class A:\n    def __init__(self, n):\n        self.n = n\nclass B(A):\n    def __init__(self):\n        super().__init__(5)\nB().n";
    assert_eq!(run(source), "5\n");
}

#[test]
fn super_outside_a_method_fails() {
    assert_eq!(report("super()"), "RuntimeError: super(): no arguments\n");
}

#[test]
fn huge_ranges_index_without_overflow() {
    let source = "r = range(-9000000000000000000, 9000000000000000000, 3)\nr[-1]";
    assert_eq!(run(source), "8999999999999999997\n");
    assert_eq!(
        report("len(range(-9000000000000000000, 9000000000000000000))"),
        "OverflowError: Python int too large to convert to C ssize_t\n"
    );
}

#[test]
fn integers_grow_past_sixty_four_bits() {
    assert_eq!(run("2 ** 64"), "18446744073709551616\n");
    assert_eq!(run("10 ** 20"), "100000000000000000000\n");
    assert_eq!(run("import math\nmath.factorial(25)"), "15511210043330985984000000\n");
    assert_eq!(run("int('9' * 30) + 1"), format!("1{}\n", "0".repeat(30)));
    assert_eq!(run("9223372036854775807 + 1"), "9223372036854775808\n");
    assert_eq!(run("-(2 ** 70) // 3"), "-393530540239137101142\n");
    assert_eq!(run("2 ** 64 == 18446744073709551616"), "True\n");
    assert_eq!(run("hex(2 ** 64)"), "'0x10000000000000000'\n");
    assert_eq!(run("f'{2 ** 64:,}'"), "'18,446,744,073,709,551,616'\n");
}

#[test]
fn sets_keep_unique_members() {
    assert_eq!(run("{3, 1, 3}"), "{3, 1}\n");
    assert_eq!(run("set()"), "set()\n");
    assert_eq!(run("{x % 3 for x in range(10)}"), "{0, 1, 2}\n");
    assert_eq!(run("s = {1, 2}\ns.add(3)\ns.discard(1)\ns"), "{2, 3}\n");
    assert_eq!(run("{1, 2} | {2, 3}"), "{1, 2, 3}\n");
    assert_eq!(run("{1, 2} & {2, 3}"), "{2}\n");
    assert_eq!(run("{1, 2} - {2, 3}"), "{1}\n");
    assert_eq!(run("2 in {1, 2}"), "True\n");
    assert_eq!(run("len(set([1, 1, 2]))"), "2\n");
    assert_eq!(run("{1} < {1, 2}"), "True\n");
    assert_eq!(report("{[1]}"), "TypeError: unhashable type: 'list'\n");
    assert_eq!(report("set().pop()"), "KeyError: 'pop from an empty set'\n");
}
