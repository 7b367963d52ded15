//! Operator semantics that need no user code: arithmetic, equality,
//! ordering and membership.

use std::{cmp::Ordering, rc::Rc};

use num_bigint::BigInt;
use num_traits::{FromPrimitive, Signed, ToPrimitive, Zero};

use crate::{
    ast::{BinaryOp, CmpOp, UnaryOp},
    exception::{ExcKind, Exception, PyResult},
    format,
    value::{SetValue, Value, ValueKind},
};

/// Largest result, in bits, that `**` will build.
const MAX_POWER_BITS: u64 = 1 << 26;

#[derive(Debug, Clone, Copy)]
enum Number<'a> {
    Int(i64),
    Big(&'a BigInt),
    Float(f64),
}

impl<'a> Number<'a> {
    fn of(value: &'a Value) -> Option<Self> {
        match value.kind() {
            ValueKind::Bool(b) => Some(Number::Int(i64::from(*b))),
            ValueKind::Int(n) => Some(Number::Int(*n)),
            ValueKind::BigInt(n) => Some(Number::Big(n)),
            ValueKind::Float(f) => Some(Number::Float(*f)),
            _ => None,
        }
    }

    fn to_float(self) -> PyResult<f64> {
        match self {
            Number::Int(n) => Ok(n as f64),
            Number::Big(n) => big_to_float(n),
            Number::Float(f) => Ok(f),
        }
    }

    fn to_bigint(self) -> Option<BigInt> {
        match self {
            Number::Int(n) => Some(BigInt::from(n)),
            Number::Big(n) => Some(n.clone()),
            Number::Float(_) => None,
        }
    }
}

pub fn big_to_float(n: &BigInt) -> PyResult<f64> {
    match n.to_f64() {
        Some(f) if f.is_finite() => Ok(f),
        _ => Err(Exception::new(
            ExcKind::OverflowError,
            "int too large to convert to float",
        )),
    }
}

/// Exact ordering between any two numbers. `None` only when a NaN is
/// involved.
fn compare_numbers(a: Number<'_>, b: Number<'_>) -> Option<Ordering> {
    match (a, b) {
        (Number::Int(a), Number::Int(b)) => Some(a.cmp(&b)),
        (Number::Float(a), Number::Float(b)) => a.partial_cmp(&b),
        (Number::Float(f), other) => float_against_int(f, &other.to_bigint()?),
        (other, Number::Float(f)) => float_against_int(f, &other.to_bigint()?).map(Ordering::reverse),
        (a, b) => Some(a.to_bigint()?.cmp(&b.to_bigint()?)),
    }
}

fn float_against_int(f: f64, n: &BigInt) -> Option<Ordering> {
    if f.is_nan() {
        return None;
    }
    if f.is_infinite() {
        return Some(if f > 0.0 { Ordering::Greater } else { Ordering::Less });
    }
    let floor = BigInt::from_f64(f.floor())?;
    match floor.cmp(n) {
        Ordering::Equal if f.fract() != 0.0 => Some(Ordering::Greater),
        Ordering::Equal => Some(Ordering::Equal),
        Ordering::Less => Some(Ordering::Less),
        Ordering::Greater => Some(Ordering::Greater),
    }
}

fn overflow(message: &str) -> Exception {
    Exception::new(ExcKind::OverflowError, message)
}

fn zero_division(message: &str) -> Exception {
    Exception::new(ExcKind::ZeroDivisionError, message)
}

fn negative_shift() -> Exception {
    Exception::new(ExcKind::ValueError, "negative shift count")
}

fn unsupported(op: BinaryOp, left: &Value, right: &Value) -> Exception {
    Exception::new(
        ExcKind::TypeError,
        format!(
            "unsupported operand type(s) for {}: '{}' and '{}'",
            op.symbol(),
            left.type_name(),
            right.type_name()
        ),
    )
}

pub fn binary(op: BinaryOp, left: &Value, right: &Value) -> PyResult<Value> {
    if let (ValueKind::Bool(a), ValueKind::Bool(b)) = (left.kind(), right.kind()) {
        match op {
            BinaryOp::BitAnd => return Ok(Value::bool(*a & *b)),
            BinaryOp::BitOr => return Ok(Value::bool(*a | *b)),
            BinaryOp::BitXor => return Ok(Value::bool(*a ^ *b)),
            _ => {}
        }
    }
    match (Number::of(left), Number::of(right)) {
        (Some(Number::Int(a)), Some(Number::Int(b))) => int_arith(op, a, b),
        (Some(a @ Number::Float(_)), Some(b)) | (Some(a), Some(b @ Number::Float(_))) => {
            match float_arith(op, a.to_float()?, b.to_float()?) {
                Some(result) => result,
                None => Err(unsupported(op, left, right)),
            }
        }
        (Some(a), Some(b)) => match (a.to_bigint(), b.to_bigint()) {
            (Some(a), Some(b)) => big_arith(op, &a, &b),
            _ => Err(unsupported(op, left, right)),
        },
        _ => sequence_arith(op, left, right),
    }
}

fn floor_div(a: i64, b: i64) -> Option<i64> {
    let quotient = a.checked_div(b)?;
    let remainder = a % b;
    if remainder != 0 && ((remainder < 0) != (b < 0)) {
        Some(quotient - 1)
    } else {
        Some(quotient)
    }
}

fn floor_mod(a: i64, b: i64) -> i64 {
    let remainder = a.checked_rem(b).unwrap_or(0);
    if remainder != 0 && ((remainder < 0) != (b < 0)) {
        remainder + b
    } else {
        remainder
    }
}

/// `i64` arithmetic, moving to arbitrary precision when a result does not
/// fit.
fn int_arith(op: BinaryOp, a: i64, b: i64) -> PyResult<Value> {
    let fast = match op {
        BinaryOp::Add => a.checked_add(b),
        BinaryOp::Sub => a.checked_sub(b),
        BinaryOp::Mul => a.checked_mul(b),
        BinaryOp::Div => {
            if b == 0 {
                return Err(zero_division("division by zero"));
            }
            return Ok(Value::float(a as f64 / b as f64));
        }
        BinaryOp::FloorDiv => {
            if b == 0 {
                return Err(zero_division("integer division or modulo by zero"));
            }
            floor_div(a, b)
        }
        BinaryOp::Mod => {
            if b == 0 {
                return Err(zero_division("integer modulo by zero"));
            }
            Some(floor_mod(a, b))
        }
        BinaryOp::Pow => {
            if b < 0 {
                if a == 0 {
                    return Err(zero_division("0.0 cannot be raised to a negative power"));
                }
                return Ok(Value::float((a as f64).powf(b as f64)));
            }
            u32::try_from(b).ok().and_then(|exponent| a.checked_pow(exponent))
        }
        BinaryOp::LShift => {
            if b < 0 {
                return Err(negative_shift());
            }
            if a == 0 {
                Some(0)
            } else {
                u32::try_from(b)
                    .ok()
                    .and_then(|shift| a.checked_shl(shift).filter(|shifted| shifted >> shift == a))
            }
        }
        BinaryOp::RShift => {
            if b < 0 {
                return Err(negative_shift());
            }
            Some(if b >= 64 {
                if a < 0 { -1 } else { 0 }
            } else {
                a >> b
            })
        }
        BinaryOp::BitAnd => Some(a & b),
        BinaryOp::BitOr => Some(a | b),
        BinaryOp::BitXor => Some(a ^ b),
    };
    match fast {
        Some(value) => Ok(Value::int(value)),
        None => big_arith(op, &BigInt::from(a), &BigInt::from(b)),
    }
}

fn big_arith(op: BinaryOp, a: &BigInt, b: &BigInt) -> PyResult<Value> {
    let value = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => {
            if b.is_zero() {
                return Err(zero_division("division by zero"));
            }
            let quotient = big_to_float(a)? / big_to_float(b)?;
            return Ok(Value::float(quotient));
        }
        BinaryOp::FloorDiv => {
            if b.is_zero() {
                return Err(zero_division("integer division or modulo by zero"));
            }
            let (quotient, remainder) = (a / b, a % b);
            if !remainder.is_zero() && remainder.is_negative() != b.is_negative() {
                quotient - 1
            } else {
                quotient
            }
        }
        BinaryOp::Mod => {
            if b.is_zero() {
                return Err(zero_division("integer modulo by zero"));
            }
            let remainder = a % b;
            if !remainder.is_zero() && remainder.is_negative() != b.is_negative() {
                remainder + b
            } else {
                remainder
            }
        }
        BinaryOp::Pow => {
            if b.is_negative() {
                if a.is_zero() {
                    return Err(zero_division("0.0 cannot be raised to a negative power"));
                }
                let base = big_to_float(a)?;
                return Ok(Value::float(base.powf(big_to_float(b)?)));
            }
            // Only 0, 1 and -1 keep a bounded size under any exponent.
            let trivial = a.abs() <= BigInt::from(1);
            let exponent = match b.to_u32() {
                Some(exponent)
                    if trivial || a.bits().saturating_mul(u64::from(exponent)) <= MAX_POWER_BITS =>
                {
                    exponent
                }
                _ if trivial => {
                    if (b % 2u32).is_zero() { 2 } else { 1 }
                }
                _ => return Err(overflow("exponent too large")),
            };
            a.pow(exponent)
        }
        BinaryOp::LShift => {
            if b.is_negative() {
                return Err(negative_shift());
            }
            match b.to_u64().filter(|shift| a.bits().saturating_add(*shift) <= MAX_POWER_BITS) {
                Some(shift) => a << shift,
                None if a.is_zero() => BigInt::zero(),
                None => return Err(overflow("too many digits in integer")),
            }
        }
        BinaryOp::RShift => {
            if b.is_negative() {
                return Err(negative_shift());
            }
            match b.to_u64() {
                Some(shift) => a >> shift,
                None if a.is_negative() => BigInt::from(-1),
                None => BigInt::zero(),
            }
        }
        BinaryOp::BitAnd => a & b,
        BinaryOp::BitOr => a | b,
        BinaryOp::BitXor => a ^ b,
    };
    Ok(Value::from_bigint(value))
}

fn float_arith(op: BinaryOp, a: f64, b: f64) -> Option<PyResult<Value>> {
    let value = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => {
            if b == 0.0 {
                return Some(Err(zero_division("float division by zero")));
            }
            a / b
        }
        BinaryOp::FloorDiv => {
            if b == 0.0 {
                return Some(Err(zero_division("float floor division by zero")));
            }
            (a / b).floor()
        }
        BinaryOp::Mod => {
            if b == 0.0 {
                return Some(Err(zero_division("float modulo by zero")));
            }
            let remainder = a % b;
            if remainder != 0.0 && ((remainder < 0.0) != (b < 0.0)) {
                remainder + b
            } else {
                remainder
            }
        }
        BinaryOp::Pow => {
            if a == 0.0 && b < 0.0 {
                return Some(Err(zero_division("0.0 cannot be raised to a negative power")));
            }
            a.powf(b)
        }
        _ => return None,
    };
    Some(Ok(Value::float(value)))
}

fn repeat(items: &[Value], count: i64) -> Vec<Value> {
    let count = usize::try_from(count).unwrap_or(0);
    let mut out = Vec::with_capacity(items.len() * count);
    for _ in 0..count {
        out.extend(items.iter().cloned());
    }
    out
}

fn sequence_arith(op: BinaryOp, left: &Value, right: &Value) -> PyResult<Value> {
    match (op, left.kind(), right.kind()) {
        (BinaryOp::Add, ValueKind::Str(a), ValueKind::Str(b)) => Ok(Value::str(format!("{a}{b}"))),
        (BinaryOp::Add, ValueKind::List(a), ValueKind::List(b)) => {
            let mut items = a.borrow().clone();
            items.extend(b.borrow().iter().cloned());
            Ok(Value::list(items))
        }
        (BinaryOp::Add, ValueKind::Tuple(a), ValueKind::Tuple(b)) => {
            Ok(Value::tuple(a.iter().chain(b.iter()).cloned().collect()))
        }
        (BinaryOp::Add, ValueKind::Str(_) | ValueKind::List(_) | ValueKind::Tuple(_), _) => {
            Err(Exception::new(
                ExcKind::TypeError,
                format!(
                    "can only concatenate {} (not \"{}\") to {}",
                    left.type_name(),
                    right.type_name(),
                    left.type_name()
                ),
            ))
        }
        (BinaryOp::BitOr, ValueKind::Set(a), ValueKind::Set(b)) => {
            Ok(Value::set(a.borrow().union(&b.borrow())))
        }
        (BinaryOp::BitAnd, ValueKind::Set(a), ValueKind::Set(b)) => {
            Ok(Value::set(a.borrow().intersection(&b.borrow())))
        }
        (BinaryOp::Sub, ValueKind::Set(a), ValueKind::Set(b)) => {
            Ok(Value::set(a.borrow().difference(&b.borrow())))
        }
        (BinaryOp::BitXor, ValueKind::Set(a), ValueKind::Set(b)) => {
            Ok(Value::set(a.borrow().symmetric_difference(&b.borrow())))
        }
        (BinaryOp::Mul, ValueKind::BigInt(_), ValueKind::Str(_) | ValueKind::List(_) | ValueKind::Tuple(_))
        | (BinaryOp::Mul, ValueKind::Str(_) | ValueKind::List(_) | ValueKind::Tuple(_), ValueKind::BigInt(_)) => {
            Err(overflow("cannot fit 'int' into an index-sized integer"))
        }
        (BinaryOp::Mul, _, _) => {
            let (sequence, count) = match (left.as_int(), right.as_int()) {
                (None, Some(count)) => (left, count),
                (Some(count), None) => (right, count),
                _ => return Err(repeat_error(left, right)),
            };
            match sequence.kind() {
                ValueKind::Str(s) => Ok(Value::str(s.repeat(usize::try_from(count).unwrap_or(0)))),
                ValueKind::List(items) => Ok(Value::list(repeat(&items.borrow(), count))),
                ValueKind::Tuple(items) => Ok(Value::tuple(repeat(items, count))),
                _ => Err(unsupported(op, left, right)),
            }
        }
        (BinaryOp::Mod, ValueKind::Str(template), _) => Ok(Value::str(format::printf(template, right)?)),
        _ => Err(unsupported(op, left, right)),
    }
}

fn repeat_error(left: &Value, right: &Value) -> Exception {
    let sequence_like = |value: &Value| {
        matches!(
            value.kind(),
            ValueKind::Str(_) | ValueKind::List(_) | ValueKind::Tuple(_)
        )
    };
    if sequence_like(left) || sequence_like(right) {
        let other = if sequence_like(left) { right } else { left };
        Exception::new(
            ExcKind::TypeError,
            format!("can't multiply sequence by non-int of type '{}'", other.type_name()),
        )
    } else {
        unsupported(BinaryOp::Mul, left, right)
    }
}

pub fn unary(op: UnaryOp, operand: &Value) -> PyResult<Value> {
    if op == UnaryOp::Not {
        return Ok(Value::bool(!operand.is_truthy()));
    }
    let symbol = match op {
        UnaryOp::Neg => "-",
        UnaryOp::Pos => "+",
        _ => "~",
    };
    let bad_operand = || {
        Exception::new(
            ExcKind::TypeError,
            format!("bad operand type for unary {symbol}: '{}'", operand.type_name()),
        )
    };
    match (op, Number::of(operand).ok_or_else(bad_operand)?) {
        (UnaryOp::Neg, Number::Int(n)) => Ok(match n.checked_neg() {
            Some(negated) => Value::int(negated),
            None => Value::from_bigint(-BigInt::from(n)),
        }),
        (UnaryOp::Neg, Number::Big(n)) => Ok(Value::from_bigint(-n)),
        (UnaryOp::Neg, Number::Float(f)) => Ok(Value::float(-f)),
        (UnaryOp::Pos, Number::Int(n)) => Ok(Value::int(n)),
        (UnaryOp::Pos, Number::Big(n)) => Ok(Value::from_bigint(n.clone())),
        (UnaryOp::Pos, Number::Float(f)) => Ok(Value::float(f)),
        (UnaryOp::Invert, Number::Int(n)) => Ok(Value::int(!n)),
        (UnaryOp::Invert, Number::Big(n)) => Ok(Value::from_bigint(!n)),
        _ => Err(bad_operand()),
    }
}

/// `==` for values without user-defined equality.
pub fn equals(left: &Value, right: &Value) -> bool {
    match (left.kind(), right.kind()) {
        (ValueKind::None, ValueKind::None) => true,
        (ValueKind::Str(a), ValueKind::Str(b)) => a == b,
        (ValueKind::List(a), ValueKind::List(b)) => {
            if Rc::ptr_eq(&left.0, &right.0) {
                return true;
            }
            sequences_equal(&a.borrow(), &b.borrow())
        }
        (ValueKind::Tuple(a), ValueKind::Tuple(b)) => sequences_equal(a, b),
        (ValueKind::Dict(a), ValueKind::Dict(b)) => {
            if Rc::ptr_eq(&left.0, &right.0) {
                return true;
            }
            let (a, b) = (a.borrow(), b.borrow());
            a.len() == b.len()
                && a.iter().all(|(key, value)| {
                    matches!(b.get(key), Ok(Some(other)) if equals(value, &other))
                })
        }
        (ValueKind::Set(a), ValueKind::Set(b)) => {
            let (a, b) = (a.borrow(), b.borrow());
            a.len() == b.len() && a.is_subset(&b)
        }
        (ValueKind::Range(a), ValueKind::Range(b)) => {
            let len = a.length();
            len == b.length() && (len == 0 || (a.start == b.start && (len == 1 || a.step == b.step)))
        }
        _ => match (Number::of(left), Number::of(right)) {
            (Some(a), Some(b)) => compare_numbers(a, b) == Some(Ordering::Equal),
            _ => left.is_same(right),
        },
    }
}

fn sequences_equal(a: &[Value], b: &[Value]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| equals(x, y))
}

/// Total order used by `<` and friends on non-numeric values and by
/// `sorted`, `min` and `max`.
pub fn order(left: &Value, right: &Value, symbol: &str) -> PyResult<Ordering> {
    if let (Some(a), Some(b)) = (Number::of(left), Number::of(right)) {
        return Ok(compare_numbers(a, b).unwrap_or(Ordering::Equal));
    }
    match (left.kind(), right.kind()) {
        (ValueKind::Str(a), ValueKind::Str(b)) => Ok(a.cmp(b)),
        (ValueKind::List(a), ValueKind::List(b)) => {
            let (a, b) = (a.borrow().clone(), b.borrow().clone());
            order_sequences(&a, &b, symbol)
        }
        (ValueKind::Tuple(a), ValueKind::Tuple(b)) => order_sequences(a, b, symbol),
        _ => Err(Exception::new(
            ExcKind::TypeError,
            format!(
                "'{symbol}' not supported between instances of '{}' and '{}'",
                left.type_name(),
                right.type_name()
            ),
        )),
    }
}

fn order_sequences(a: &[Value], b: &[Value], symbol: &str) -> PyResult<Ordering> {
    for (x, y) in a.iter().zip(b) {
        if !equals(x, y) {
            return order(x, y, symbol);
        }
    }
    Ok(a.len().cmp(&b.len()))
}

pub fn compare(op: CmpOp, left: &Value, right: &Value) -> PyResult<bool> {
    let ordered = |accept: fn(Ordering) -> bool| -> PyResult<bool> {
        if let (Some(a), Some(b)) = (Number::of(left), Number::of(right)) {
            return Ok(compare_numbers(a, b).is_some_and(accept));
        }
        if let (ValueKind::Set(a), ValueKind::Set(b)) = (left.kind(), right.kind()) {
            return Ok(set_order(&a.borrow(), &b.borrow()).is_some_and(accept));
        }
        order(left, right, op.symbol()).map(accept)
    };
    match op {
        CmpOp::Eq => Ok(equals(left, right)),
        CmpOp::NotEq => Ok(!equals(left, right)),
        CmpOp::Is => Ok(left.is_same(right)),
        CmpOp::IsNot => Ok(!left.is_same(right)),
        CmpOp::In => contains(right, left),
        CmpOp::NotIn => contains(right, left).map(|found| !found),
        CmpOp::Lt => ordered(Ordering::is_lt),
        CmpOp::LtE => ordered(Ordering::is_le),
        CmpOp::Gt => ordered(Ordering::is_gt),
        CmpOp::GtE => ordered(Ordering::is_ge),
    }
}

/// Subset order between sets; `None` when neither contains the other.
fn set_order(a: &SetValue, b: &SetValue) -> Option<Ordering> {
    match (a.is_subset(b), b.is_subset(a)) {
        (true, true) => Some(Ordering::Equal),
        (true, false) => Some(Ordering::Less),
        (false, true) => Some(Ordering::Greater),
        (false, false) => None,
    }
}

/// `item in container`.
pub fn contains(container: &Value, item: &Value) -> PyResult<bool> {
    match container.kind() {
        ValueKind::Str(haystack) => match item.kind() {
            ValueKind::Str(needle) => Ok(haystack.contains(needle.as_str())),
            _ => Err(Exception::new(
                ExcKind::TypeError,
                format!("'in <string>' requires string as left operand, not {}", item.type_name()),
            )),
        },
        ValueKind::List(items) => Ok(items.borrow().iter().any(|value| equals(value, item))),
        ValueKind::Tuple(items) => Ok(items.iter().any(|value| equals(value, item))),
        ValueKind::Dict(dict) => dict.borrow().contains(item),
        ValueKind::Set(set) => set.borrow().contains(item),
        ValueKind::Range(range) => Ok(match item.kind() {
            ValueKind::Float(f) if f.fract() == 0.0 => range.contains(*f as i64),
            _ => item.as_int().is_some_and(|n| range.contains(n)),
        }),
        _ => Err(Exception::new(
            ExcKind::TypeError,
            format!("argument of type '{}' is not iterable", container.type_name()),
        )),
    }
}
