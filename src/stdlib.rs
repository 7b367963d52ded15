use std::{
    cell::RefCell,
    cmp::Ordering,
    hash::{DefaultHasher, Hash, Hasher},
    rc::Rc,
};

use indexmap::IndexMap;
use num_bigint::BigInt;
use num_traits::{FromPrimitive, One, Signed, ToPrimitive, Zero};

use crate::{
    ast::{BinaryOp, CmpOp},
    environment::EnvironmentRef,
    exception::{ExcClass, ExcKind, Exception, PyResult},
    ops,
    runtime::Interpreter,
    value::{
        BuiltinType, CallArgs, Class, Dict, HashKey, Instance, NativeFn, NativeFunction,
        RangeValue, SetValue, Value, ValueKind,
    },
};

const BUILTINS: &[(&str, NativeFn)] = &[
    ("print", builtin_print),
    ("len", builtin_len),
    ("repr", builtin_repr),
    ("abs", builtin_abs),
    ("min", builtin_min),
    ("max", builtin_max),
    ("sum", builtin_sum),
    ("sorted", builtin_sorted),
    ("reversed", builtin_reversed),
    ("enumerate", builtin_enumerate),
    ("zip", builtin_zip),
    ("map", builtin_map),
    ("filter", builtin_filter),
    ("any", builtin_any),
    ("all", builtin_all),
    ("isinstance", builtin_isinstance),
    ("round", builtin_round),
    ("divmod", builtin_divmod),
    ("pow", builtin_pow),
    ("chr", builtin_chr),
    ("ord", builtin_ord),
    ("hex", builtin_hex),
    ("bin", builtin_bin),
    ("oct", builtin_oct),
    ("hash", builtin_hash),
    ("callable", builtin_callable),
    ("getattr", builtin_getattr),
    ("setattr", builtin_setattr),
    ("hasattr", builtin_hasattr),
    ("id", builtin_id),
    ("format", builtin_format),
    ("super", builtin_super),
];

/// Longest decimal string `int()` converts.
const MAX_STR_DIGITS: usize = 4300;

const TYPES: &[BuiltinType] = &[
    BuiltinType::Object,
    BuiltinType::Bool,
    BuiltinType::Int,
    BuiltinType::Float,
    BuiltinType::Str,
    BuiltinType::List,
    BuiltinType::Tuple,
    BuiltinType::Dict,
    BuiltinType::Set,
    BuiltinType::Range,
    BuiltinType::Type,
];

/// Binds every builtin function, type and exception class into `env`.
pub fn install(env: &EnvironmentRef) {
    let mut scope = env.borrow_mut();
    for &(name, callback) in BUILTINS {
        scope.define(name, native(name, callback));
    }
    for ty in TYPES {
        scope.define(ty.name(), Value::new(ValueKind::Type(*ty)));
    }
    for kind in ExcKind::ALL {
        scope.define(
            kind.name(),
            Value::new(ValueKind::Type(BuiltinType::Exception(kind))),
        );
    }
}

fn native(name: &'static str, callback: NativeFn) -> Value {
    Value::new(ValueKind::NativeFunction(NativeFunction { name, callback }))
}

/// Modules available to `import`.
pub fn import_module(name: &str) -> Option<Value> {
    match name {
        "math" => Some(math_module()),
        _ => None,
    }
}

fn expect_int(value: &Value) -> PyResult<i64> {
    if let ValueKind::BigInt(_) = value.kind() {
        return Err(index_overflow());
    }
    value.as_int().ok_or_else(|| {
        Exception::new(
            ExcKind::TypeError,
            format!("'{}' object cannot be interpreted as an integer", value.type_name()),
        )
    })
}

fn index_overflow() -> Exception {
    Exception::new(
        ExcKind::OverflowError,
        "Python int too large to convert to C ssize_t",
    )
}

/// Any `int` or `bool`, at full precision.
fn expect_bigint(value: &Value) -> PyResult<BigInt> {
    value.as_bigint().ok_or_else(|| {
        Exception::new(
            ExcKind::TypeError,
            format!("'{}' object cannot be interpreted as an integer", value.type_name()),
        )
    })
}

fn expect_number(value: &Value) -> PyResult<f64> {
    match value.kind() {
        ValueKind::Float(f) => Ok(*f),
        ValueKind::BigInt(n) => ops::big_to_float(n),
        _ => match value.as_int() {
            Some(n) => Ok(n as f64),
            None => Err(Exception::new(
                ExcKind::TypeError,
                format!("must be real number, not {}", value.type_name()),
            )),
        },
    }
}

fn expect_str<'a>(value: &'a Value, function: &str) -> PyResult<&'a str> {
    value.as_str().ok_or_else(|| {
        Exception::new(
            ExcKind::TypeError,
            format!("{function}() argument must be str, not {}", value.type_name()),
        )
    })
}

fn is_none_or_missing(value: Option<&Value>) -> bool {
    value.is_none_or(Value::is_none)
}

/// Calls `type(...)` and friends: `int("3")`, `list(range(3))`, `ValueError("x")`.
pub fn construct(interp: &mut Interpreter, ty: BuiltinType, args: CallArgs) -> PyResult<Value> {
    let name = ty.name();
    if !matches!(ty, BuiltinType::Dict | BuiltinType::Int) {
        args.no_keywords(name)?;
    }
    let CallArgs {
        positional,
        mut keywords,
    } = args;
    let single = || positional.first().cloned();
    match ty {
        BuiltinType::Object => {
            CallArgs::positional(positional.clone()).expect_exact("object", 0)?;
            Ok(Value::new(ValueKind::Instance(Instance {
                class: Rc::new(Class {
                    name: "object".to_string(),
                    base: None,
                    attrs: RefCell::new(IndexMap::new()),
                }),
                attrs: RefCell::new(IndexMap::new()),
            })))
        }
        BuiltinType::NoneType => Ok(Value::none()),
        BuiltinType::Bool => {
            CallArgs::positional(positional.clone()).expect_range("bool", 0, 1)?;
            match single() {
                Some(value) => Ok(Value::bool(interp.truthy(&value)?)),
                None => Ok(Value::bool(false)),
            }
        }
        BuiltinType::Int => {
            let base = match keywords.iter().position(|(key, _)| key == "base") {
                Some(idx) => Some(keywords.remove(idx).1),
                None => positional.get(1).cloned(),
            };
            CallArgs {
                positional: positional.clone(),
                keywords,
            }
            .finish("int")?;
            match (single(), base) {
                (None, _) => Ok(Value::int(0)),
                (Some(value), None) => to_int(&value),
                (Some(value), Some(base)) => {
                    let text = value.as_str().ok_or_else(|| {
                        Exception::new(
                            ExcKind::TypeError,
                            "int() can't convert non-string with explicit base",
                        )
                    })?;
                    parse_int(text, expect_int(&base)?)
                }
            }
        }
        BuiltinType::Float => {
            CallArgs::positional(positional.clone()).expect_range("float", 0, 1)?;
            match single() {
                None => Ok(Value::float(0.0)),
                Some(value) => to_float(&value),
            }
        }
        BuiltinType::Str => {
            CallArgs::positional(positional.clone()).expect_range("str", 0, 1)?;
            match single() {
                None => Ok(Value::str("")),
                Some(value) => Ok(Value::str(interp.str_value(&value)?)),
            }
        }
        BuiltinType::List | BuiltinType::Tuple => {
            CallArgs::positional(positional.clone()).expect_range(name, 0, 1)?;
            let items = match single() {
                None => Vec::new(),
                Some(value) => interp.iterate(&value)?,
            };
            Ok(if ty == BuiltinType::List {
                Value::list(items)
            } else {
                Value::tuple(items)
            })
        }
        BuiltinType::Dict => {
            CallArgs::positional(positional.clone()).expect_range("dict", 0, 1)?;
            let mut dict = Dict::new();
            if let Some(source) = single() {
                merge_into(interp, &mut dict, &source)?;
            }
            for (key, value) in keywords {
                dict.insert(Value::str(key), value)?;
            }
            Ok(Value::dict(dict))
        }
        BuiltinType::Set => {
            CallArgs::positional(positional.clone()).expect_range("set", 0, 1)?;
            let items = match single() {
                None => Vec::new(),
                Some(value) => interp.iterate(&value)?,
            };
            Ok(Value::set(SetValue::from_values(items)?))
        }
        BuiltinType::Range => {
            CallArgs::positional(positional.clone()).expect_range("range", 1, 3)?;
            let ints = positional
                .iter()
                .map(expect_int)
                .collect::<PyResult<Vec<_>>>()?;
            let (start, stop, step) = match ints.as_slice() {
                [stop] => (0, *stop, 1),
                [start, stop] => (*start, *stop, 1),
                [start, stop, step] => (*start, *stop, *step),
                _ => (0, 0, 1),
            };
            if step == 0 {
                return Err(Exception::new(
                    ExcKind::ValueError,
                    "range() arg 3 must not be zero",
                ));
            }
            Ok(Value::new(ValueKind::Range(RangeValue { start, stop, step })))
        }
        BuiltinType::Type => {
            CallArgs::positional(positional.clone()).expect_exact("type", 1)?;
            match single() {
                Some(value) => Ok(type_of(&value)),
                None => Ok(Value::none()),
            }
        }
        BuiltinType::Function | BuiltinType::Module => Err(Exception::new(
            ExcKind::TypeError,
            format!("cannot create '{name}' instances"),
        )),
        BuiltinType::Exception(kind) => {
            Ok(Exception::with_args(ExcClass::Builtin(kind), positional).into_value())
        }
    }
}

/// Copies a mapping, or an iterable of key/value pairs, into `dict`.
pub(crate) fn merge_into(interp: &mut Interpreter, dict: &mut Dict, source: &Value) -> PyResult<()> {
    if let ValueKind::Dict(other) = source.kind() {
        for (key, value) in other.borrow().items() {
            dict.insert(key, value)?;
        }
        return Ok(());
    }
    for (idx, pair) in interp.iterate(source)?.into_iter().enumerate() {
        let items = interp.iterate(&pair).map_err(|_| {
            Exception::new(
                ExcKind::TypeError,
                format!("cannot convert dictionary update sequence element #{idx} to a sequence"),
            )
        })?;
        let [key, value] = <[Value; 2]>::try_from(items).map_err(|items| {
            Exception::new(
                ExcKind::ValueError,
                format!(
                    "dictionary update sequence element #{idx} has length {}; 2 is required",
                    items.len()
                ),
            )
        })?;
        dict.insert(key, value)?;
    }
    Ok(())
}

fn type_of(value: &Value) -> Value {
    match value.kind() {
        ValueKind::Instance(instance) => Value::new(ValueKind::Class(Rc::clone(&instance.class))),
        ValueKind::Exception(exception) => match &exception.class {
            ExcClass::User(class) => Value::new(ValueKind::Class(Rc::clone(class))),
            ExcClass::Builtin(kind) => Value::new(ValueKind::Type(BuiltinType::Exception(*kind))),
        },
        _ => Value::new(ValueKind::Type(
            BuiltinType::of(value).unwrap_or(BuiltinType::Object),
        )),
    }
}

fn to_int(value: &Value) -> PyResult<Value> {
    match value.kind() {
        ValueKind::Int(n) => Ok(Value::int(*n)),
        ValueKind::BigInt(n) => Ok(Value::from_bigint(n.clone())),
        ValueKind::Bool(b) => Ok(Value::int(i64::from(*b))),
        ValueKind::Float(f) => float_to_int(*f),
        ValueKind::Str(text) => parse_int(text, 10),
        _ => Err(Exception::new(
            ExcKind::TypeError,
            format!(
                "int() argument must be a string, a bytes-like object or a real number, not '{}'",
                value.type_name()
            ),
        )),
    }
}

fn float_to_int(value: f64) -> PyResult<Value> {
    if value.is_nan() {
        return Err(Exception::new(
            ExcKind::ValueError,
            "cannot convert float NaN to integer",
        ));
    }
    if value.is_infinite() {
        return Err(Exception::new(
            ExcKind::OverflowError,
            "cannot convert float infinity to integer",
        ));
    }
    BigInt::from_f64(value.trunc())
        .map(Value::from_bigint)
        .ok_or_else(|| Exception::new(ExcKind::OverflowError, "cannot convert float to integer"))
}

fn parse_int(text: &str, base: i64) -> PyResult<Value> {
    let invalid = || {
        Exception::new(
            ExcKind::ValueError,
            format!(
                "invalid literal for int() with base {base}: {}",
                crate::value::quote_str(text)
            ),
        )
    };
    if base != 0 && !(2..=36).contains(&base) {
        return Err(Exception::new(
            ExcKind::ValueError,
            "int() base must be >= 2 and <= 36, or 0",
        ));
    }
    let trimmed = text.trim();
    let (negative, digits) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    let lower = digits.to_ascii_lowercase();
    let (radix, body) = match (base, lower.get(..2)) {
        (0 | 16, Some("0x")) => (16, &lower[2..]),
        (0 | 8, Some("0o")) => (8, &lower[2..]),
        (0 | 2, Some("0b")) => (2, &lower[2..]),
        (0, _) => (10, lower.as_str()),
        (base, _) => (base as u32, lower.as_str()),
    };
    if body.is_empty() || body.starts_with('_') || body.ends_with('_') || body.contains("__") {
        return Err(invalid());
    }
    let cleaned: String = body.chars().filter(|ch| *ch != '_').collect();
    if !cleaned.chars().all(|ch| ch.is_ascii_alphanumeric()) {
        return Err(invalid());
    }
    if radix == 10 && cleaned.len() > MAX_STR_DIGITS {
        return Err(Exception::new(
            ExcKind::ValueError,
            format!(
                "Exceeds the limit ({MAX_STR_DIGITS} digits) for integer string conversion: \
                 value has {} digits; use sys.set_int_max_str_digits() to increase the limit",
                cleaned.len()
            ),
        ));
    }
    let magnitude = BigInt::parse_bytes(cleaned.as_bytes(), radix).ok_or_else(invalid)?;
    Ok(Value::from_bigint(if negative { -magnitude } else { magnitude }))
}

fn to_float(value: &Value) -> PyResult<Value> {
    match value.kind() {
        ValueKind::Str(text) => {
            let trimmed = text.trim();
            let cleaned: String = trimmed.chars().filter(|ch| *ch != '_').collect();
            let lowered = cleaned.to_ascii_lowercase();
            let unsigned = lowered.trim_start_matches(['+', '-']);
            let parsed = match unsigned {
                "inf" | "infinity" | "nan" => lowered.replace("infinity", "inf").parse::<f64>().ok(),
                _ if unsigned.starts_with(|ch: char| ch.is_ascii_alphabetic()) => None,
                _ => cleaned.parse::<f64>().ok(),
            };
            parsed.map(Value::float).ok_or_else(|| {
                Exception::new(
                    ExcKind::ValueError,
                    format!(
                        "could not convert string to float: {}",
                        crate::value::quote_str(text)
                    ),
                )
            })
        }
        _ => match expect_number(value) {
            Ok(number) => Ok(Value::float(number)),
            Err(_) => Err(Exception::new(
                ExcKind::TypeError,
                format!(
                    "float() argument must be a string or a real number, not '{}'",
                    value.type_name()
                ),
            )),
        },
    }
}

/// Stable sort with an optional key function; `reverse` keeps equal items
/// in their original order.
pub fn sort_values(
    interp: &mut Interpreter,
    values: Vec<Value>,
    key: Option<&Value>,
    reverse: bool,
) -> PyResult<Vec<Value>> {
    let mut keyed = Vec::with_capacity(values.len());
    for value in values {
        let sort_key = match key {
            Some(key) if !key.is_none() => {
                interp.call_value(key, CallArgs::positional(vec![value.clone()]))?
            }
            _ => value.clone(),
        };
        keyed.push((sort_key, value));
    }
    let mut failure = None;
    keyed.sort_by(|(a, _), (b, _)| {
        if failure.is_some() {
            return Ordering::Equal;
        }
        let (a, b) = if reverse { (b, a) } else { (a, b) };
        match less_than(interp, a, b).and_then(|less| {
            if less {
                Ok(Ordering::Less)
            } else {
                less_than(interp, b, a).map(|greater| {
                    if greater {
                        Ordering::Greater
                    } else {
                        Ordering::Equal
                    }
                })
            }
        }) {
            Ok(ordering) => ordering,
            Err(err) => {
                failure = Some(err);
                Ordering::Equal
            }
        }
    });
    match failure {
        Some(err) => Err(err),
        None => Ok(keyed.into_iter().map(|(_, value)| value).collect()),
    }
}

fn less_than(interp: &mut Interpreter, a: &Value, b: &Value) -> PyResult<bool> {
    interp.compare(CmpOp::Lt, a, b)
}

fn builtin_print(interp: &mut Interpreter, mut args: CallArgs) -> PyResult<Value> {
    let sep = args.take_keyword("sep");
    let end = args.take_keyword("end");
    let flush = args.take_keyword("flush");
    let file = args.take_keyword("file");
    args.finish("print")?;
    if !is_none_or_missing(file.as_ref()) {
        return Err(Exception::new(
            ExcKind::TypeError,
            "print() file argument is not supported",
        ));
    }
    let text_arg = |value: Option<Value>, default: &str, name: &str| -> PyResult<String> {
        match value {
            None => Ok(default.to_string()),
            Some(value) if value.is_none() => Ok(default.to_string()),
            Some(value) => match value.as_str() {
                Some(text) => Ok(text.to_string()),
                None => Err(Exception::new(
                    ExcKind::TypeError,
                    format!("{name} must be None or a string, not {}", value.type_name()),
                )),
            },
        }
    };
    let sep = text_arg(sep, " ", "sep")?;
    let end = text_arg(end, "\n", "end")?;
    let mut line = String::new();
    for (idx, value) in args.positional.iter().enumerate() {
        if idx > 0 {
            line.push_str(&sep);
        }
        line.push_str(&interp.str_value(value)?);
    }
    line.push_str(&end);
    interp.write_output(&line)?;
    if let Some(flush) = flush {
        if flush.is_truthy() {
            interp.flush_output()?;
        }
    }
    Ok(Value::none())
}

fn builtin_len(interp: &mut Interpreter, args: CallArgs) -> PyResult<Value> {
    args.expect_exact("len", 1)?;
    let len = interp.length(&args.positional[0])?;
    Ok(Value::int(len as i64))
}

fn builtin_repr(interp: &mut Interpreter, args: CallArgs) -> PyResult<Value> {
    args.expect_exact("repr", 1)?;
    Ok(Value::str(interp.repr_value(&args.positional[0])?))
}

fn builtin_abs(_: &mut Interpreter, args: CallArgs) -> PyResult<Value> {
    args.expect_exact("abs", 1)?;
    let value = &args.positional[0];
    match value.kind() {
        ValueKind::Float(f) => Ok(Value::float(f.abs())),
        _ => match value.as_bigint() {
            Some(n) => Ok(Value::from_bigint(n.abs())),
            None => Err(Exception::new(
                ExcKind::TypeError,
                format!("bad operand type for abs(): '{}'", value.type_name()),
            )),
        },
    }
}

fn builtin_min(interp: &mut Interpreter, args: CallArgs) -> PyResult<Value> {
    extremum(interp, args, "min", CmpOp::Lt)
}

fn builtin_max(interp: &mut Interpreter, args: CallArgs) -> PyResult<Value> {
    extremum(interp, args, "max", CmpOp::Gt)
}

/// The first item that no later item beats under `op`.
fn extremum(
    interp: &mut Interpreter,
    mut args: CallArgs,
    name: &str,
    op: CmpOp,
) -> PyResult<Value> {
    let key = args.take_keyword("key");
    let default = args.take_keyword("default");
    args.finish(name)?;
    let candidates = match args.positional.as_slice() {
        [] => {
            return Err(Exception::new(
                ExcKind::TypeError,
                format!("{name} expected at least 1 argument, got 0"),
            ));
        }
        [iterable] => interp.iterate(iterable)?,
        _ => {
            if default.is_some() {
                return Err(Exception::new(
                    ExcKind::TypeError,
                    format!(
                        "Cannot specify a default for {name}() with multiple positional arguments"
                    ),
                ));
            }
            args.positional.clone()
        }
    };
    let mut best: Option<(Value, Value)> = None;
    for candidate in candidates {
        let rank = match &key {
            Some(key) if !key.is_none() => {
                interp.call_value(key, CallArgs::positional(vec![candidate.clone()]))?
            }
            _ => candidate.clone(),
        };
        let replace = match &best {
            None => true,
            Some((best_rank, _)) => interp.compare(op, &rank, best_rank)?,
        };
        if replace {
            best = Some((rank, candidate));
        }
    }
    match (best, default) {
        (Some((_, value)), _) => Ok(value),
        (None, Some(default)) => Ok(default),
        (None, None) => Err(Exception::new(
            ExcKind::ValueError,
            format!("{name}() iterable argument is empty"),
        )),
    }
}

fn builtin_sum(interp: &mut Interpreter, mut args: CallArgs) -> PyResult<Value> {
    let start = args.take_keyword("start");
    args.finish("sum")?;
    args.expect_range("sum", 1, 2)?;
    let mut total = start
        .or_else(|| args.positional.get(1).cloned())
        .unwrap_or_else(|| Value::int(0));
    if total.as_str().is_some() {
        return Err(Exception::new(
            ExcKind::TypeError,
            "sum() can't sum strings [use ''.join(seq) instead]",
        ));
    }
    for item in interp.iterate(&args.positional[0])? {
        total = interp.binary_op(BinaryOp::Add, &total, &item)?;
    }
    Ok(total)
}

fn builtin_sorted(interp: &mut Interpreter, mut args: CallArgs) -> PyResult<Value> {
    let key = args.take_keyword("key");
    let reverse = args.take_keyword("reverse");
    args.finish("sorted")?;
    if args.positional.len() != 1 {
        return Err(Exception::new(
            ExcKind::TypeError,
            format!("sorted expected 1 argument, got {}", args.positional.len()),
        ));
    }
    let values = interp.iterate(&args.positional[0])?;
    let reverse = reverse.is_some_and(|flag| flag.is_truthy());
    Ok(Value::list(sort_values(interp, values, key.as_ref(), reverse)?))
}

fn builtin_reversed(interp: &mut Interpreter, args: CallArgs) -> PyResult<Value> {
    args.expect_exact("reversed", 1)?;
    let value = &args.positional[0];
    if matches!(value.kind(), ValueKind::Dict(_)) || !is_sequence(value) {
        return Err(Exception::new(
            ExcKind::TypeError,
            format!("'{}' object is not reversible", value.type_name()),
        ));
    }
    let mut items = interp.iterate(value)?;
    items.reverse();
    Ok(Value::list(items))
}

fn is_sequence(value: &Value) -> bool {
    matches!(
        value.kind(),
        ValueKind::List(_) | ValueKind::Tuple(_) | ValueKind::Str(_) | ValueKind::Range(_)
    )
}

fn builtin_enumerate(interp: &mut Interpreter, mut args: CallArgs) -> PyResult<Value> {
    let start = args.take_keyword("start");
    args.finish("enumerate")?;
    args.expect_range("enumerate", 1, 2)?;
    let start = match start.or_else(|| args.positional.get(1).cloned()) {
        Some(start) => expect_bigint(&start)?,
        None => BigInt::zero(),
    };
    let items = interp.iterate(&args.positional[0])?;
    let pairs = items
        .into_iter()
        .enumerate()
        .map(|(offset, item)| {
            let idx = Value::from_bigint(&start + BigInt::from(offset));
            Value::tuple(vec![idx, item])
        })
        .collect();
    Ok(Value::list(pairs))
}

fn builtin_zip(interp: &mut Interpreter, args: CallArgs) -> PyResult<Value> {
    args.no_keywords("zip")?;
    let columns = args
        .positional
        .iter()
        .map(|value| interp.iterate(value))
        .collect::<PyResult<Vec<_>>>()?;
    let rows = columns.iter().map(Vec::len).min().unwrap_or(0);
    Ok(Value::list(
        (0..rows)
            .map(|row| Value::tuple(columns.iter().map(|column| column[row].clone()).collect()))
            .collect(),
    ))
}

fn builtin_map(interp: &mut Interpreter, args: CallArgs) -> PyResult<Value> {
    args.no_keywords("map")?;
    let Some((function, iterables)) = args.positional.split_first() else {
        return Err(Exception::new(
            ExcKind::TypeError,
            "map() must have at least two arguments.",
        ));
    };
    if iterables.is_empty() {
        return Err(Exception::new(
            ExcKind::TypeError,
            "map() must have at least two arguments.",
        ));
    }
    let columns = iterables
        .iter()
        .map(|value| interp.iterate(value))
        .collect::<PyResult<Vec<_>>>()?;
    let rows = columns.iter().map(Vec::len).min().unwrap_or(0);
    let mut results = Vec::with_capacity(rows);
    for row in 0..rows {
        let call = CallArgs::positional(columns.iter().map(|column| column[row].clone()).collect());
        results.push(interp.call_value(function, call)?);
    }
    Ok(Value::list(results))
}

fn builtin_filter(interp: &mut Interpreter, args: CallArgs) -> PyResult<Value> {
    args.expect_exact("filter", 2)?;
    let predicate = &args.positional[0];
    let mut kept = Vec::new();
    for item in interp.iterate(&args.positional[1])? {
        let verdict = if predicate.is_none() {
            item.clone()
        } else {
            interp.call_value(predicate, CallArgs::positional(vec![item.clone()]))?
        };
        if interp.truthy(&verdict)? {
            kept.push(item);
        }
    }
    Ok(Value::list(kept))
}

fn builtin_any(interp: &mut Interpreter, args: CallArgs) -> PyResult<Value> {
    args.expect_exact("any", 1)?;
    for item in interp.iterate(&args.positional[0])? {
        if interp.truthy(&item)? {
            return Ok(Value::bool(true));
        }
    }
    Ok(Value::bool(false))
}

fn builtin_all(interp: &mut Interpreter, args: CallArgs) -> PyResult<Value> {
    args.expect_exact("all", 1)?;
    for item in interp.iterate(&args.positional[0])? {
        if !interp.truthy(&item)? {
            return Ok(Value::bool(false));
        }
    }
    Ok(Value::bool(true))
}

fn builtin_isinstance(_: &mut Interpreter, args: CallArgs) -> PyResult<Value> {
    args.expect_exact("isinstance", 2)?;
    Ok(Value::bool(is_instance(&args.positional[0], &args.positional[1])?))
}

pub fn is_instance(value: &Value, classinfo: &Value) -> PyResult<bool> {
    match classinfo.kind() {
        ValueKind::Type(ty) => Ok(ty.accepts(value)),
        ValueKind::Class(class) => Ok(match value.kind() {
            ValueKind::Instance(instance) => instance.class.is_subclass_of(class),
            ValueKind::Exception(exception) => match &exception.class {
                ExcClass::User(raised) => raised.is_subclass_of(class),
                ExcClass::Builtin(_) => false,
            },
            _ => false,
        }),
        ValueKind::Tuple(classes) => {
            for class in classes {
                if is_instance(value, class)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        _ => Err(Exception::new(
            ExcKind::TypeError,
            "isinstance() arg 2 must be a type, a tuple of types, or a union",
        )),
    }
}

fn builtin_round(_: &mut Interpreter, mut args: CallArgs) -> PyResult<Value> {
    let ndigits = args.take_keyword("ndigits");
    args.finish("round")?;
    args.expect_range("round", 1, 2)?;
    let ndigits = ndigits.or_else(|| args.positional.get(1).cloned());
    let value = &args.positional[0];
    let ndigits = match ndigits {
        Some(n) if !n.is_none() => Some(expect_int(&n)?),
        _ => None,
    };
    match (value.kind(), ndigits) {
        (ValueKind::Float(f), None) => float_to_int(f.round_ties_even()),
        (ValueKind::Float(f), Some(digits)) => {
            let scale = 10f64.powi(digits.clamp(-308, 308) as i32);
            let rounded = (f * scale).round_ties_even() / scale;
            Ok(Value::float(if rounded.is_finite() { rounded } else { *f }))
        }
        (_, digits) => {
            let n = value.as_bigint().ok_or_else(|| {
                Exception::new(
                    ExcKind::TypeError,
                    format!("type {} doesn't define __round__ method", value.type_name()),
                )
            })?;
            match digits {
                Some(digits) if digits < 0 => {
                    let places = digits.unsigned_abs();
                    if places > n.to_string().len() as u64 {
                        return Ok(Value::int(0));
                    }
                    let scale = BigInt::from(10).pow(places as u32);
                    let (quotient, remainder) = floor_divmod(&n, &scale);
                    let lower = &quotient * &scale;
                    let rounded = match (remainder * 2u32).cmp(&scale) {
                        Ordering::Less => lower,
                        Ordering::Greater => lower + scale,
                        Ordering::Equal if (&quotient % 2u32).is_zero() => lower,
                        Ordering::Equal => lower + scale,
                    };
                    Ok(Value::from_bigint(rounded))
                }
                _ => Ok(Value::from_bigint(n)),
            }
        }
    }
}

/// Quotient rounded toward negative infinity, with the matching remainder.
fn floor_divmod(n: &BigInt, d: &BigInt) -> (BigInt, BigInt) {
    let (quotient, remainder) = (n / d, n % d);
    if !remainder.is_zero() && remainder.is_negative() != d.is_negative() {
        (quotient - 1, remainder + d)
    } else {
        (quotient, remainder)
    }
}

fn builtin_divmod(_: &mut Interpreter, args: CallArgs) -> PyResult<Value> {
    args.expect_exact("divmod", 2)?;
    let (a, b) = (&args.positional[0], &args.positional[1]);
    if a.as_bigint().is_some() && b.as_bigint().is_some_and(|b| b.is_zero()) {
        return Err(Exception::new(
            ExcKind::ZeroDivisionError,
            "integer division or modulo by zero",
        ));
    }
    let quotient = ops::binary(BinaryOp::FloorDiv, a, b)?;
    let remainder = ops::binary(BinaryOp::Mod, a, b)?;
    Ok(Value::tuple(vec![quotient, remainder]))
}

fn builtin_pow(interp: &mut Interpreter, args: CallArgs) -> PyResult<Value> {
    args.expect_range("pow", 2, 3)?;
    let (base, exponent) = (&args.positional[0], &args.positional[1]);
    let Some(modulus) = args.positional.get(2).filter(|m| !m.is_none()) else {
        return interp.binary_op(BinaryOp::Pow, base, exponent);
    };
    let (Some(base), Some(exponent), Some(modulus)) =
        (base.as_bigint(), exponent.as_bigint(), modulus.as_bigint())
    else {
        return Err(Exception::new(
            ExcKind::TypeError,
            "pow() 3rd argument not allowed unless all arguments are integers",
        ));
    };
    if modulus.is_zero() {
        return Err(Exception::new(
            ExcKind::ValueError,
            "pow() 3rd argument cannot be 0",
        ));
    }
    if exponent.is_negative() {
        return Err(Exception::new(
            ExcKind::ValueError,
            "base is not invertible for the given modulus",
        ));
    }
    // The result takes the sign of the modulus.
    Ok(Value::from_bigint(base.modpow(&exponent, &modulus)))
}

fn builtin_chr(_: &mut Interpreter, args: CallArgs) -> PyResult<Value> {
    args.expect_exact("chr", 1)?;
    let code = expect_int(&args.positional[0])?;
    u32::try_from(code)
        .ok()
        .and_then(char::from_u32)
        .map(|ch| Value::str(ch.to_string()))
        .ok_or_else(|| Exception::new(ExcKind::ValueError, "chr() arg not in range(0x110000)"))
}

fn builtin_ord(_: &mut Interpreter, args: CallArgs) -> PyResult<Value> {
    args.expect_exact("ord", 1)?;
    let value = &args.positional[0];
    let Some(text) = value.as_str() else {
        return Err(Exception::new(
            ExcKind::TypeError,
            format!(
                "ord() expected string of length 1, but {} found",
                value.type_name()
            ),
        ));
    };
    let mut chars = text.chars();
    match (chars.next(), chars.next()) {
        (Some(ch), None) => Ok(Value::int(i64::from(u32::from(ch)))),
        _ => Err(Exception::new(
            ExcKind::TypeError,
            format!(
                "ord() expected a character, but string of length {} found",
                text.chars().count()
            ),
        )),
    }
}

fn radix_text(args: &CallArgs, name: &str, prefix: &str) -> PyResult<Value> {
    args.expect_exact(name, 1)?;
    let n = expect_bigint(&args.positional[0])?;
    let radix = match prefix {
        "0x" => 16,
        "0o" => 8,
        _ => 2,
    };
    let digits = n.magnitude().to_str_radix(radix);
    let sign = if n.is_negative() { "-" } else { "" };
    Ok(Value::str(format!("{sign}{prefix}{digits}")))
}

fn builtin_hex(_: &mut Interpreter, args: CallArgs) -> PyResult<Value> {
    radix_text(&args, "hex", "0x")
}

fn builtin_bin(_: &mut Interpreter, args: CallArgs) -> PyResult<Value> {
    radix_text(&args, "bin", "0b")
}

fn builtin_oct(_: &mut Interpreter, args: CallArgs) -> PyResult<Value> {
    radix_text(&args, "oct", "0o")
}

fn builtin_hash(_: &mut Interpreter, args: CallArgs) -> PyResult<Value> {
    args.expect_exact("hash", 1)?;
    let key = HashKey::from_value(&args.positional[0])?;
    let hash = match key {
        HashKey::Int(n) => int_hash(&BigInt::from(n)),
        HashKey::Big(n) => int_hash(&n),
        other => {
            let mut hasher = DefaultHasher::new();
            other.hash(&mut hasher);
            hasher.finish() as i64
        }
    };
    Ok(Value::int(hash))
}

/// `hash()` of an integer: the value reduced modulo the Mersenne prime
/// 2**61 - 1, keeping its sign, with -1 reserved.
fn int_hash(n: &BigInt) -> i64 {
    let modulus = BigInt::from((1u64 << 61) - 1);
    let reduced = (n.abs() % modulus).to_i64().unwrap_or(0);
    match if n.is_negative() { -reduced } else { reduced } {
        -1 => -2,
        hash => hash,
    }
}

fn builtin_callable(_: &mut Interpreter, args: CallArgs) -> PyResult<Value> {
    args.expect_exact("callable", 1)?;
    let value = &args.positional[0];
    let callable = match value.kind() {
        ValueKind::Function(_)
        | ValueKind::NativeFunction(_)
        | ValueKind::BoundMethod(_)
        | ValueKind::BuiltinMethod(_)
        | ValueKind::Class(_)
        | ValueKind::Type(_) => true,
        ValueKind::Instance(instance) => instance.class.lookup("__call__").is_some(),
        _ => false,
    };
    Ok(Value::bool(callable))
}

fn attribute_name<'a>(value: &'a Value, function: &str) -> PyResult<&'a str> {
    value.as_str().ok_or_else(|| {
        Exception::new(
            ExcKind::TypeError,
            format!("{function}(): attribute name must be string, not '{}'", value.type_name()),
        )
    })
}

fn builtin_getattr(interp: &mut Interpreter, args: CallArgs) -> PyResult<Value> {
    args.no_keywords("getattr")?;
    args.expect_range("getattr", 2, 3)?;
    let name = attribute_name(&args.positional[1], "getattr")?;
    match (interp.get_attribute(&args.positional[0], name), args.positional.get(2)) {
        (Err(err), Some(default)) if err.is_instance_of(ExcKind::AttributeError) => Ok(default.clone()),
        (result, _) => result,
    }
}

fn builtin_setattr(interp: &mut Interpreter, args: CallArgs) -> PyResult<Value> {
    args.expect_exact("setattr", 3)?;
    let name = attribute_name(&args.positional[1], "setattr")?;
    interp.set_attribute(&args.positional[0], name, args.positional[2].clone())?;
    Ok(Value::none())
}

fn builtin_hasattr(interp: &mut Interpreter, args: CallArgs) -> PyResult<Value> {
    args.expect_exact("hasattr", 2)?;
    let name = attribute_name(&args.positional[1], "hasattr")?;
    match interp.get_attribute(&args.positional[0], name) {
        Ok(_) => Ok(Value::bool(true)),
        Err(err) if err.is_instance_of(ExcKind::AttributeError) => Ok(Value::bool(false)),
        Err(err) => Err(err),
    }
}

fn builtin_id(_: &mut Interpreter, args: CallArgs) -> PyResult<Value> {
    args.expect_exact("id", 1)?;
    Ok(Value::int(args.positional[0].identity() as i64))
}

fn builtin_format(interp: &mut Interpreter, args: CallArgs) -> PyResult<Value> {
    args.no_keywords("format")?;
    args.expect_range("format", 1, 2)?;
    let spec = match args.positional.get(1) {
        Some(spec) => expect_str(spec, "format")?,
        None => "",
    };
    Ok(Value::str(interp.format_field(&args.positional[0], None, Some(spec))?))
}

fn math_module() -> Value {
    let mut attrs = IndexMap::new();
    attrs.insert("pi".to_string(), Value::float(std::f64::consts::PI));
    attrs.insert("e".to_string(), Value::float(std::f64::consts::E));
    attrs.insert("tau".to_string(), Value::float(std::f64::consts::TAU));
    attrs.insert("inf".to_string(), Value::float(f64::INFINITY));
    attrs.insert("nan".to_string(), Value::float(f64::NAN));
    let functions: &[(&'static str, NativeFn)] = &[
        ("sqrt", math_sqrt),
        ("floor", math_floor),
        ("ceil", math_ceil),
        ("fabs", math_fabs),
        ("pow", math_pow),
        ("exp", math_exp),
        ("log", math_log),
        ("log2", math_log2),
        ("log10", math_log10),
        ("sin", math_sin),
        ("cos", math_cos),
        ("tan", math_tan),
        ("gcd", math_gcd),
        ("factorial", math_factorial),
        ("isqrt", math_isqrt),
        ("hypot", math_hypot),
    ];
    for &(name, callback) in functions {
        attrs.insert(name.to_string(), native(name, callback));
    }
    Value::module("math", attrs)
}

fn math_domain_error() -> Exception {
    Exception::new(ExcKind::ValueError, "math domain error")
}

fn unary_float(args: &CallArgs, name: &str) -> PyResult<f64> {
    args.expect_exact(name, 1)?;
    expect_number(&args.positional[0])
}

fn checked_float(value: f64) -> PyResult<Value> {
    if value.is_infinite() {
        return Err(Exception::new(ExcKind::OverflowError, "math range error"));
    }
    Ok(Value::float(value))
}

fn math_sqrt(_: &mut Interpreter, args: CallArgs) -> PyResult<Value> {
    let x = unary_float(&args, "sqrt")?;
    if x < 0.0 {
        return Err(math_domain_error());
    }
    Ok(Value::float(x.sqrt()))
}

fn math_floor(_: &mut Interpreter, args: CallArgs) -> PyResult<Value> {
    args.expect_exact("floor", 1)?;
    match args.positional[0].as_bigint() {
        Some(n) => Ok(Value::from_bigint(n)),
        None => float_to_int(expect_number(&args.positional[0])?.floor()),
    }
}

fn math_ceil(_: &mut Interpreter, args: CallArgs) -> PyResult<Value> {
    args.expect_exact("ceil", 1)?;
    match args.positional[0].as_bigint() {
        Some(n) => Ok(Value::from_bigint(n)),
        None => float_to_int(expect_number(&args.positional[0])?.ceil()),
    }
}

fn math_fabs(_: &mut Interpreter, args: CallArgs) -> PyResult<Value> {
    Ok(Value::float(unary_float(&args, "fabs")?.abs()))
}

fn math_pow(_: &mut Interpreter, args: CallArgs) -> PyResult<Value> {
    args.expect_exact("pow", 2)?;
    let base = expect_number(&args.positional[0])?;
    let exponent = expect_number(&args.positional[1])?;
    if base == 0.0 && exponent < 0.0 {
        return Err(math_domain_error());
    }
    if base < 0.0 && exponent.fract() != 0.0 && exponent.is_finite() {
        return Err(math_domain_error());
    }
    let result = base.powf(exponent);
    if result.is_infinite() && base.is_finite() && exponent.is_finite() {
        return Err(Exception::new(ExcKind::OverflowError, "math range error"));
    }
    Ok(Value::float(result))
}

fn math_exp(_: &mut Interpreter, args: CallArgs) -> PyResult<Value> {
    let x = unary_float(&args, "exp")?;
    if x.is_infinite() {
        return Ok(Value::float(x.exp()));
    }
    checked_float(x.exp())
}

fn positive_log_arg(value: &Value) -> PyResult<f64> {
    let x = expect_number(value)?;
    if x <= 0.0 {
        return Err(math_domain_error());
    }
    Ok(x)
}

fn math_log(_: &mut Interpreter, args: CallArgs) -> PyResult<Value> {
    args.expect_range("log", 1, 2)?;
    let x = positive_log_arg(&args.positional[0])?;
    match args.positional.get(1) {
        None => Ok(Value::float(x.ln())),
        Some(base) => {
            let base = positive_log_arg(base)?;
            if base == 1.0 {
                return Err(Exception::new(ExcKind::ZeroDivisionError, "float division by zero"));
            }
            Ok(Value::float(x.ln() / base.ln()))
        }
    }
}

fn math_log2(_: &mut Interpreter, args: CallArgs) -> PyResult<Value> {
    args.expect_exact("log2", 1)?;
    Ok(Value::float(positive_log_arg(&args.positional[0])?.log2()))
}

fn math_log10(_: &mut Interpreter, args: CallArgs) -> PyResult<Value> {
    args.expect_exact("log10", 1)?;
    Ok(Value::float(positive_log_arg(&args.positional[0])?.log10()))
}

fn finite_trig(x: f64) -> PyResult<f64> {
    if x.is_infinite() {
        return Err(math_domain_error());
    }
    Ok(x)
}

fn math_sin(_: &mut Interpreter, args: CallArgs) -> PyResult<Value> {
    Ok(Value::float(finite_trig(unary_float(&args, "sin")?)?.sin()))
}

fn math_cos(_: &mut Interpreter, args: CallArgs) -> PyResult<Value> {
    Ok(Value::float(finite_trig(unary_float(&args, "cos")?)?.cos()))
}

fn math_tan(_: &mut Interpreter, args: CallArgs) -> PyResult<Value> {
    Ok(Value::float(finite_trig(unary_float(&args, "tan")?)?.tan()))
}

fn math_gcd(_: &mut Interpreter, args: CallArgs) -> PyResult<Value> {
    args.no_keywords("gcd")?;
    let mut result = BigInt::zero();
    for value in &args.positional {
        let mut a = result;
        let mut b = expect_bigint(value)?.abs();
        while !b.is_zero() {
            let remainder = &a % &b;
            (a, b) = (b, remainder);
        }
        result = a;
    }
    Ok(Value::from_bigint(result))
}

fn math_factorial(_: &mut Interpreter, args: CallArgs) -> PyResult<Value> {
    args.expect_exact("factorial", 1)?;
    let value = &args.positional[0];
    if matches!(value.kind(), ValueKind::Float(_)) {
        return Err(Exception::new(
            ExcKind::TypeError,
            "'float' object cannot be interpreted as an integer",
        ));
    }
    let n = expect_int(value)?;
    if n < 0 {
        return Err(Exception::new(
            ExcKind::ValueError,
            "factorial() not defined for negative values",
        ));
    }
    let product = (2..=n).fold(BigInt::one(), |product, factor| product * factor);
    Ok(Value::from_bigint(product))
}

fn math_isqrt(_: &mut Interpreter, args: CallArgs) -> PyResult<Value> {
    args.expect_exact("isqrt", 1)?;
    let n = expect_bigint(&args.positional[0])?;
    if n.is_negative() {
        return Err(Exception::new(
            ExcKind::ValueError,
            "isqrt() argument must be nonnegative",
        ));
    }
    Ok(Value::from_bigint(n.sqrt()))
}

fn math_hypot(_: &mut Interpreter, args: CallArgs) -> PyResult<Value> {
    args.no_keywords("hypot")?;
    let mut sum = 0.0;
    for value in &args.positional {
        let x = expect_number(value)?;
        sum += x * x;
    }
    Ok(Value::float(sum.sqrt()))
}

fn builtin_super(interp: &mut Interpreter, args: CallArgs) -> PyResult<Value> {
    interp.super_object(args)
}
