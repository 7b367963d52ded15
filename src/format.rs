//! Number and string formatting: `repr(float)`, the format-spec
//! mini-language used by f-strings, `format()` and `str.format`, and
//! printf-style `%` formatting.

use crate::{
    exception::{ExcKind, Exception, PyResult},
    ops,
    value::{Value, ValueKind},
};
use num_bigint::BigInt;
use num_traits::{FromPrimitive, Signed, ToPrimitive};

/// Shortest round-tripping representation, switching to exponent form
/// outside `1e-4 <= |x| < 1e16`.
pub fn float_repr(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if value == 0.0 {
        return if value.is_sign_negative() { "-0.0" } else { "0.0" }.to_string();
    }

    let sci = format!("{value:e}");
    let (mantissa, exponent) = sci.split_once('e').unwrap_or((sci.as_str(), "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);
    let negative = mantissa.starts_with('-');
    let digits: String = mantissa.chars().filter(|ch| ch.is_ascii_digit()).collect();
    let sign = if negative { "-" } else { "" };

    if (-4..16).contains(&exponent) {
        if exponent >= 0 {
            let int_len = exponent as usize + 1;
            let (int_part, frac_part) = if digits.len() > int_len {
                (digits[..int_len].to_string(), digits[int_len..].to_string())
            } else {
                (format!("{digits:0<int_len$}"), "0".to_string())
            };
            format!("{sign}{int_part}.{frac_part}")
        } else {
            let zeros = "0".repeat((-exponent - 1) as usize);
            format!("{sign}0.{zeros}{digits}")
        }
    } else {
        let (head, tail) = digits.split_at(1);
        let body = if tail.is_empty() {
            head.to_string()
        } else {
            format!("{head}.{tail}")
        };
        format!("{sign}{body}e{}", exponent_suffix(exponent))
    }
}

fn exponent_suffix(exponent: i32) -> String {
    let sign = if exponent < 0 { '-' } else { '+' };
    format!("{sign}{:02}", exponent.unsigned_abs())
}

/// Rewrites Rust's `1.5e3` exponent notation into Python's `1.5e+03`.
fn pythonize_exponent(text: &str) -> String {
    match text.split_once('e') {
        Some((mantissa, exponent)) => {
            let exponent: i32 = exponent.parse().unwrap_or(0);
            format!("{mantissa}e{}", exponent_suffix(exponent))
        }
        None => text.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FormatSpec {
    pub fill: char,
    pub align: Option<char>,
    pub sign: char,
    pub alternate: bool,
    pub zero: bool,
    pub width: usize,
    pub grouping: Option<char>,
    pub precision: Option<usize>,
    pub ty: Option<char>,
}

impl Default for FormatSpec {
    fn default() -> Self {
        Self {
            fill: ' ',
            align: None,
            sign: '-',
            alternate: false,
            zero: false,
            width: 0,
            grouping: None,
            precision: None,
            ty: None,
        }
    }
}

impl FormatSpec {
    /// `[[fill]align][sign][#][0][width][grouping][.precision][type]`
    pub fn parse(spec: &str) -> PyResult<Self> {
        let chars: Vec<char> = spec.chars().collect();
        let mut parsed = FormatSpec::default();
        let mut idx = 0;
        let is_align = |ch: char| matches!(ch, '<' | '>' | '=' | '^');

        if chars.len() >= 2 && is_align(chars[1]) {
            parsed.fill = chars[0];
            parsed.align = Some(chars[1]);
            idx = 2;
        } else if chars.first().copied().is_some_and(is_align) {
            parsed.align = Some(chars[0]);
            idx = 1;
        }
        if let Some(&sign @ ('+' | '-' | ' ')) = chars.get(idx) {
            parsed.sign = sign;
            idx += 1;
        }
        if chars.get(idx) == Some(&'#') {
            parsed.alternate = true;
            idx += 1;
        }
        if chars.get(idx) == Some(&'0') {
            parsed.zero = true;
            idx += 1;
        }
        let width_start = idx;
        while chars.get(idx).is_some_and(|ch| ch.is_ascii_digit()) {
            idx += 1;
        }
        if idx > width_start {
            parsed.width = chars[width_start..idx]
                .iter()
                .collect::<String>()
                .parse()
                .map_err(|_| invalid_spec())?;
        }
        if let Some(&group @ (',' | '_')) = chars.get(idx) {
            parsed.grouping = Some(group);
            idx += 1;
        }
        if chars.get(idx) == Some(&'.') {
            idx += 1;
            let precision_start = idx;
            while chars.get(idx).is_some_and(|ch| ch.is_ascii_digit()) {
                idx += 1;
            }
            if idx == precision_start {
                return Err(Exception::new(ExcKind::ValueError, "Format specifier missing precision"));
            }
            parsed.precision = Some(
                chars[precision_start..idx]
                    .iter()
                    .collect::<String>()
                    .parse()
                    .map_err(|_| invalid_spec())?,
            );
        }
        match &chars[idx..] {
            [] => {}
            [ty] => parsed.ty = Some(*ty),
            _ => return Err(invalid_spec()),
        }
        Ok(parsed)
    }

    fn unknown_code(&self, type_name: &str) -> Exception {
        let code = self.ty.unwrap_or(' ');
        Exception::new(
            ExcKind::ValueError,
            format!("Unknown format code '{code}' for object of type '{type_name}'"),
        )
    }

    pub fn format_int(&self, value: &BigInt) -> PyResult<String> {
        let magnitude = value.magnitude();
        let (body, prefix) = match self.ty {
            None | Some('d') | Some('n') => (magnitude.to_string(), ""),
            Some('x') => (magnitude.to_str_radix(16), "0x"),
            Some('X') => (magnitude.to_str_radix(16).to_uppercase(), "0X"),
            Some('o') => (magnitude.to_str_radix(8), "0o"),
            Some('b') => (magnitude.to_str_radix(2), "0b"),
            Some('c') => {
                let ch = value.to_u32().and_then(char::from_u32).ok_or_else(|| {
                    Exception::new(ExcKind::OverflowError, "%c arg not in range(0x110000)")
                })?;
                return Ok(self.pad("", &ch.to_string(), false));
            }
            Some('e' | 'E' | 'f' | 'F' | 'g' | 'G' | '%') => {
                return self.format_float(ops::big_to_float(value)?);
            }
            Some(_) => return Err(self.unknown_code("int")),
        };
        if self.precision.is_some() {
            return Err(Exception::new(
                ExcKind::ValueError,
                "Precision not allowed in integer format specifier",
            ));
        }
        let body = match self.grouping {
            Some(separator) => group_digits(&body, separator, if prefix.is_empty() { 3 } else { 4 }),
            None => body,
        };
        let prefix = if self.alternate { prefix } else { "" };
        let sign = self.sign_for(value.is_negative());
        Ok(self.pad(&format!("{sign}{prefix}"), &body, true))
    }

    pub fn format_float(&self, value: f64) -> PyResult<String> {
        let upper = matches!(self.ty, Some('E' | 'F' | 'G'));
        let magnitude = value.abs();
        let body = if value.is_nan() {
            "nan".to_string()
        } else if value.is_infinite() {
            "inf".to_string()
        } else {
            match self.ty {
                None => match self.precision {
                    Some(precision) => {
                        let text = general(magnitude, precision, self.alternate);
                        if text.contains(['.', 'e']) {
                            text
                        } else {
                            format!("{text}.0")
                        }
                    }
                    None => float_repr(magnitude),
                },
                Some('f' | 'F') => format!("{:.*}", self.precision.unwrap_or(6), magnitude),
                Some('e' | 'E') => {
                    pythonize_exponent(&format!("{:.*e}", self.precision.unwrap_or(6), magnitude))
                }
                Some('g' | 'G') => general(magnitude, self.precision.unwrap_or(6), self.alternate),
                Some('%') => format!("{:.*}%", self.precision.unwrap_or(6), magnitude * 100.0),
                Some(_) => return Err(self.unknown_code("float")),
            }
        };
        let body = if upper { body.to_uppercase() } else { body };
        let body = match self.grouping {
            Some(separator) => {
                let split = body.find(|ch: char| !ch.is_ascii_digit()).unwrap_or(body.len());
                format!("{}{}", group_digits(&body[..split], separator, 3), &body[split..])
            }
            None => body,
        };
        let sign = self.sign_for(value.is_sign_negative() && !value.is_nan());
        Ok(self.pad(sign, &body, true))
    }

    pub fn format_text(&self, text: &str) -> PyResult<String> {
        match self.ty {
            None | Some('s') => {}
            Some(_) => return Err(self.unknown_code("str")),
        }
        if self.sign != '-' {
            return Err(Exception::new(
                ExcKind::ValueError,
                "Sign not allowed in string format specifier",
            ));
        }
        let text: String = match self.precision {
            Some(precision) => text.chars().take(precision).collect(),
            None => text.to_string(),
        };
        Ok(self.pad("", &text, false))
    }

    fn sign_for(&self, negative: bool) -> &'static str {
        match (negative, self.sign) {
            (true, _) => "-",
            (false, '+') => "+",
            (false, ' ') => " ",
            _ => "",
        }
    }

    fn pad(&self, sign: &str, body: &str, numeric: bool) -> String {
        let length = sign.chars().count() + body.chars().count();
        if self.width <= length {
            return format!("{sign}{body}");
        }
        let count = self.width - length;
        let (fill, align) = match self.align {
            Some(align) => (self.fill, align),
            None if self.zero && numeric => ('0', '='),
            None if numeric => (self.fill, '>'),
            None => (self.fill, '<'),
        };
        let filler = |n: usize| fill.to_string().repeat(n);
        match align {
            '<' => format!("{sign}{body}{}", filler(count)),
            '^' => {
                let left = count / 2;
                format!("{}{sign}{body}{}", filler(left), filler(count - left))
            }
            '=' => format!("{sign}{}{body}", filler(count)),
            _ => format!("{}{sign}{body}", filler(count)),
        }
    }
}

fn invalid_spec() -> Exception {
    Exception::new(ExcKind::ValueError, "Invalid format specifier")
}

fn group_digits(digits: &str, separator: char, every: usize) -> String {
    let chars: Vec<char> = digits.chars().collect();
    let mut out = String::new();
    for (idx, ch) in chars.iter().enumerate() {
        if idx > 0 && (chars.len() - idx) % every == 0 {
            out.push(separator);
        }
        out.push(*ch);
    }
    out
}

/// The `g` presentation type.
fn general(value: f64, precision: usize, alternate: bool) -> String {
    let precision = precision.max(1);
    let exponent = if value == 0.0 {
        0
    } else {
        let sci = format!("{:.*e}", precision - 1, value);
        sci.split_once('e')
            .and_then(|(_, exp)| exp.parse::<i32>().ok())
            .unwrap_or(0)
    };
    if (-4..precision as i32).contains(&exponent) {
        let decimals = (precision as i32 - 1 - exponent).max(0) as usize;
        let text = format!("{value:.decimals$}");
        if alternate {
            text
        } else {
            strip_fraction_zeros(&text)
        }
    } else {
        let text = format!("{:.*e}", precision - 1, value);
        let (mantissa, exp) = text.split_once('e').unwrap_or((text.as_str(), "0"));
        let mantissa = if alternate {
            mantissa.to_string()
        } else {
            strip_fraction_zeros(mantissa)
        };
        pythonize_exponent(&format!("{mantissa}e{exp}"))
    }
}

fn truncate_float(value: f64) -> PyResult<BigInt> {
    BigInt::from_f64(value.trunc()).ok_or_else(|| {
        let message = if value.is_nan() {
            "cannot convert float NaN to integer"
        } else {
            "cannot convert float infinity to integer"
        };
        Exception::new(ExcKind::OverflowError, message)
    })
}

fn strip_fraction_zeros(text: &str) -> String {
    if !text.contains('.') {
        return text.to_string();
    }
    text.trim_end_matches('0').trim_end_matches('.').to_string()
}

/// `format(value, spec)` given the value's already computed `str()`.
pub fn apply_spec(value: &Value, text: &str, spec: &str) -> PyResult<String> {
    if spec.is_empty() {
        return Ok(text.to_string());
    }
    let parsed = FormatSpec::parse(spec)?;
    match value.kind() {
        ValueKind::Bool(flag) if parsed.ty.is_some() => {
            parsed.format_int(&BigInt::from(u8::from(*flag)))
        }
        ValueKind::Int(_) | ValueKind::BigInt(_) => match value.as_bigint() {
            Some(n) => parsed.format_int(&n),
            None => parsed.format_text(text),
        },
        ValueKind::Float(f) => parsed.format_float(*f),
        _ => parsed.format_text(text),
    }
}

/// printf-style `format % args`.
pub fn printf(format: &str, args: &Value) -> PyResult<String> {
    let values: Vec<Value> = match args.kind() {
        ValueKind::Tuple(items) => items.clone(),
        _ => vec![args.clone()],
    };
    let mut remaining = values.into_iter();
    let mut out = String::new();
    let mut chars = format.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '%' {
            out.push(ch);
            continue;
        }
        let mut spec = FormatSpec::default();
        loop {
            match chars.peek() {
                Some('-') => spec.align = Some('<'),
                Some('+') => spec.sign = '+',
                Some(' ') => spec.sign = ' ',
                Some('0') => spec.zero = true,
                Some('#') => spec.alternate = true,
                _ => break,
            }
            chars.next();
        }
        let mut width = String::new();
        while let Some(digit) = chars.next_if(|ch| ch.is_ascii_digit()) {
            width.push(digit);
        }
        spec.width = width.parse().unwrap_or(0);
        if chars.next_if_eq(&'.').is_some() {
            let mut precision = String::new();
            while let Some(digit) = chars.next_if(|ch| ch.is_ascii_digit()) {
                precision.push(digit);
            }
            spec.precision = Some(precision.parse().unwrap_or(0));
        }
        let Some(conversion) = chars.next() else {
            return Err(Exception::new(ExcKind::ValueError, "incomplete format"));
        };
        if conversion == '%' {
            out.push('%');
            continue;
        }
        let value = remaining.next().ok_or_else(|| {
            Exception::new(ExcKind::TypeError, "not enough arguments for format string")
        })?;
        let piece = match conversion {
            's' => spec.format_text(&value.to_string())?,
            'r' => spec.format_text(&value.repr())?,
            'd' | 'i' | 'u' => {
                let number = match value.kind() {
                    ValueKind::Float(f) => truncate_float(*f)?,
                    _ => value.as_bigint().ok_or_else(|| {
                        Exception::new(
                            ExcKind::TypeError,
                            format!("%{conversion} format: a real number is required, not {}", value.type_name()),
                        )
                    })?,
                };
                spec.precision = None;
                spec.format_int(&number)?
            }
            'x' | 'X' | 'o' | 'c' => {
                let number = value.as_bigint().ok_or_else(|| {
                    Exception::new(
                        ExcKind::TypeError,
                        format!("%{conversion} format: an integer is required, not {}", value.type_name()),
                    )
                })?;
                spec.ty = Some(conversion);
                spec.precision = None;
                spec.format_int(&number)?
            }
            'f' | 'F' | 'e' | 'E' | 'g' | 'G' => {
                let number = match value.kind() {
                    ValueKind::Float(f) => *f,
                    _ => match value.as_bigint() {
                        Some(n) => ops::big_to_float(&n)?,
                        None => {
                            return Err(Exception::new(
                                ExcKind::TypeError,
                                format!("must be real number, not {}", value.type_name()),
                            ));
                        }
                    },
                };
                spec.ty = Some(conversion);
                spec.format_float(number)?
            }
            other => {
                return Err(Exception::new(
                    ExcKind::ValueError,
                    format!("unsupported format character '{other}' (0x{:x})", other as u32),
                ));
            }
        };
        out.push_str(&piece);
    }

    if remaining.next().is_some() {
        return Err(Exception::new(
            ExcKind::TypeError,
            "not all arguments converted during string formatting",
        ));
    }
    Ok(out)
}
