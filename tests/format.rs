use pyecho::{
    format::{apply_spec, float_repr, printf},
    value::Value,
};

#[test]
fn float_repr_matches_python() {
    assert_eq!(float_repr(1.0), "1.0");
    assert_eq!(float_repr(0.1 + 0.2), "0.30000000000000004");
    assert_eq!(float_repr(1e16), "1e+16");
    assert_eq!(float_repr(1.5e-5), "1.5e-05");
    assert_eq!(float_repr(-0.0), "-0.0");
    assert_eq!(float_repr(123456.789), "123456.789");
    assert_eq!(float_repr(f64::INFINITY), "inf");
}

#[test]
fn format_spec_pads_and_aligns() {
    let pi = Value::float(3.14159);
    assert_eq!(apply_spec(&pi, "3.14159", ">8.2f").expect("valid spec"), "    3.14");
    assert_eq!(
        apply_spec(&Value::int(-42), "-42", "05d").expect("valid spec"),
        "-0042"
    );
    assert_eq!(
        apply_spec(&Value::int(1234567), "1234567", ",").expect("valid spec"),
        "1,234,567"
    );
    assert_eq!(
        apply_spec(&Value::str("ab"), "ab", "*^7").expect("valid spec"),
        "**ab***"
    );
    assert_eq!(apply_spec(&Value::int(255), "255", "#x").expect("valid spec"), "0xff");
}

#[test]
fn format_spec_rejects_mismatched_codes() {
    let err = apply_spec(&Value::str("ab"), "ab", "d").expect_err("d is not a str code");
    assert_eq!(
        err.message(),
        "Unknown format code 'd' for object of type 'str'"
    );
}

#[test]
fn printf_substitutes_in_order() {
    let args = Value::tuple(vec![Value::str("x"), Value::int(3), Value::float(2.5)]);
    assert_eq!(printf("%s=%d (%.1f)", &args).expect("valid format"), "x=3 (2.5)");
    assert_eq!(printf("100%%", &Value::tuple(Vec::new())).expect("valid format"), "100%");

    let err = printf("%s %s", &Value::str("one")).expect_err("too few arguments");
    assert_eq!(err.message(), "not enough arguments for format string");
}
