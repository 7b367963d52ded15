//! Methods of the built-in `str`, `list`, `dict` and `set` types, plus the
//! `object` and `BaseException` methods reachable through `super()`.

use crate::{
    ast::CmpOp,
    exception::{ExcKind, Exception, PyResult},
    runtime::{Interpreter, no_attribute},
    stdlib,
    value::{CallArgs, Dict, SetValue, Value, ValueKind},
};

const STR_METHODS: &[&str] = &[
    "upper",
    "lower",
    "strip",
    "lstrip",
    "rstrip",
    "split",
    "splitlines",
    "join",
    "replace",
    "startswith",
    "endswith",
    "find",
    "rfind",
    "index",
    "count",
    "title",
    "capitalize",
    "swapcase",
    "isdigit",
    "isalpha",
    "isalnum",
    "isspace",
    "isupper",
    "islower",
    "zfill",
    "center",
    "ljust",
    "rjust",
    "format",
];

const LIST_METHODS: &[&str] = &[
    "append", "extend", "pop", "insert", "remove", "index", "count", "sort", "reverse", "copy",
    "clear",
];

const DICT_METHODS: &[&str] = &[
    "keys",
    "values",
    "items",
    "get",
    "pop",
    "popitem",
    "update",
    "setdefault",
    "copy",
    "clear",
];

const SET_METHODS: &[&str] = &[
    "add",
    "remove",
    "discard",
    "pop",
    "clear",
    "copy",
    "update",
    "union",
    "intersection",
    "difference",
    "symmetric_difference",
    "issubset",
    "issuperset",
    "isdisjoint",
];

const OBJECT_METHODS: &[&str] = &["__init__", "__str__", "__repr__"];

const EXCEPTION_METHODS: &[&str] = &["__init__", "__str__", "__repr__", "with_traceback"];

/// The canonical name of `name` if `receiver`'s type defines such a method.
pub fn lookup(receiver: &Value, name: &str) -> Option<&'static str> {
    let table = match receiver.kind() {
        ValueKind::Str(_) => STR_METHODS,
        ValueKind::List(_) => LIST_METHODS,
        ValueKind::Dict(_) => DICT_METHODS,
        ValueKind::Set(_) => SET_METHODS,
        ValueKind::Instance(_) => OBJECT_METHODS,
        ValueKind::Exception(_) => EXCEPTION_METHODS,
        _ => return None,
    };
    table.iter().find(|method| **method == name).copied()
}

pub fn call_method(
    interp: &mut Interpreter,
    receiver: &Value,
    name: &str,
    args: CallArgs,
) -> PyResult<Value> {
    match receiver.kind() {
        ValueKind::Str(text) => str_method(interp, text, name, args),
        ValueKind::List(_) => list_method(interp, receiver, name, args),
        ValueKind::Dict(_) => dict_method(interp, receiver, name, args),
        ValueKind::Set(_) => set_method(interp, receiver, name, args),
        ValueKind::Instance(_) => object_method(interp, receiver, name, args),
        ValueKind::Exception(_) => exception_method(interp, receiver, name, args),
        _ => Err(no_attribute(receiver, name)),
    }
}

fn str_arg<'a>(value: &'a Value, method: &str) -> PyResult<&'a str> {
    value.as_str().ok_or_else(|| {
        Exception::new(
            ExcKind::TypeError,
            format!("{method}() argument must be str, not {}", value.type_name()),
        )
    })
}

fn optional_str<'a>(args: &'a CallArgs, idx: usize, method: &str) -> PyResult<Option<&'a str>> {
    match args.positional.get(idx) {
        Some(value) if !value.is_none() => str_arg(value, method).map(Some),
        _ => Ok(None),
    }
}

fn int_arg(value: &Value) -> PyResult<i64> {
    value.as_int().ok_or_else(|| {
        Exception::new(
            ExcKind::TypeError,
            format!("'{}' object cannot be interpreted as an integer", value.type_name()),
        )
    })
}

/// Character offsets of `text[start:end]` after Python slice clamping.
fn char_window(text: &str, start: Option<&Value>, end: Option<&Value>) -> PyResult<(usize, usize)> {
    let len = text.chars().count() as i64;
    let clamp = |bound: Option<&Value>, default: i64| -> PyResult<i64> {
        match bound {
            Some(value) if !value.is_none() => {
                let n = int_arg(value)?;
                let n = if n < 0 { n + len } else { n };
                Ok(n.clamp(0, len))
            }
            _ => Ok(default),
        }
    };
    let start = clamp(start, 0)?;
    let end = clamp(end, len)?;
    Ok((start as usize, end.max(start) as usize))
}

fn byte_offset(text: &str, chars: usize) -> usize {
    text.char_indices()
        .nth(chars)
        .map(|(idx, _)| idx)
        .unwrap_or(text.len())
}

fn find_in(text: &str, args: &CallArgs, method: &str, reverse: bool) -> PyResult<Option<usize>> {
    args.no_keywords(method)?;
    args.expect_range(method, 1, 3)?;
    let needle = str_arg(&args.positional[0], method)?;
    let (start, end) = char_window(text, args.positional.get(1), args.positional.get(2))?;
    let window = &text[byte_offset(text, start)..byte_offset(text, end)];
    let found = if reverse {
        window.rfind(needle)
    } else {
        window.find(needle)
    };
    Ok(found.map(|byte| start + window[..byte].chars().count()))
}

fn prefix_test(text: &str, args: &CallArgs, method: &str) -> PyResult<bool> {
    args.no_keywords(method)?;
    args.expect_range(method, 1, 3)?;
    let (start, end) = char_window(text, args.positional.get(1), args.positional.get(2))?;
    let window = &text[byte_offset(text, start)..byte_offset(text, end)];
    let candidates = match args.positional[0].kind() {
        ValueKind::Tuple(items) => items.clone(),
        _ => vec![args.positional[0].clone()],
    };
    for candidate in &candidates {
        let Some(affix) = candidate.as_str() else {
            return Err(Exception::new(
                ExcKind::TypeError,
                format!(
                    "{method} first arg must be str or a tuple of str, not {}",
                    candidate.type_name()
                ),
            ));
        };
        let hit = if method == "startswith" {
            window.starts_with(affix)
        } else {
            window.ends_with(affix)
        };
        if hit {
            return Ok(true);
        }
    }
    Ok(false)
}

fn split_whitespace(text: &str, maxsplit: Option<usize>) -> Vec<Value> {
    let mut parts = Vec::new();
    let mut rest = text.trim_start();
    while !rest.is_empty() {
        if maxsplit.is_some_and(|max| parts.len() == max) {
            parts.push(Value::str(rest));
            return parts;
        }
        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        parts.push(Value::str(&rest[..end]));
        rest = rest[end..].trim_start();
    }
    parts
}

fn padded(text: &str, args: &CallArgs, method: &str) -> PyResult<(usize, char)> {
    args.no_keywords(method)?;
    args.expect_range(method, 1, 2)?;
    let width = int_arg(&args.positional[0])?.max(0) as usize;
    let fill = match optional_str(args, 1, method)? {
        Some(fill) if fill.chars().count() == 1 => fill.chars().next().unwrap_or(' '),
        Some(_) => {
            return Err(Exception::new(
                ExcKind::TypeError,
                "The fill character must be exactly one character long",
            ));
        }
        None => ' ',
    };
    let len = text.chars().count();
    Ok((width.saturating_sub(len), fill))
}

fn str_method(
    interp: &mut Interpreter,
    text: &str,
    name: &str,
    mut args: CallArgs,
) -> PyResult<Value> {
    match name {
        "upper" | "lower" | "title" | "capitalize" | "swapcase" => {
            args.expect_exact(name, 0)?;
            let converted = match name {
                "upper" => text.to_uppercase(),
                "lower" => text.to_lowercase(),
                "title" => title_case(text),
                "capitalize" => {
                    let mut chars = text.chars();
                    match chars.next() {
                        Some(first) => {
                            let rest = chars.as_str().to_lowercase();
                            first.to_uppercase().chain(rest.chars()).collect()
                        }
                        None => String::new(),
                    }
                }
                _ => text
                    .chars()
                    .flat_map(|ch| {
                        if ch.is_uppercase() {
                            ch.to_lowercase().collect::<Vec<_>>()
                        } else {
                            ch.to_uppercase().collect::<Vec<_>>()
                        }
                    })
                    .collect(),
            };
            Ok(Value::str(converted))
        }
        "strip" | "lstrip" | "rstrip" => {
            args.no_keywords(name)?;
            args.expect_range(name, 0, 1)?;
            let chars: Option<Vec<char>> = optional_str(&args, 0, name)?.map(|c| c.chars().collect());
            let strip = |ch: char| match &chars {
                Some(chars) => chars.contains(&ch),
                None => ch.is_whitespace(),
            };
            let stripped = match name {
                "strip" => text.trim_matches(strip),
                "lstrip" => text.trim_start_matches(strip),
                _ => text.trim_end_matches(strip),
            };
            Ok(Value::str(stripped))
        }
        "split" => {
            let sep = args.take_keyword("sep");
            let maxsplit = args.take_keyword("maxsplit");
            args.finish(name)?;
            args.expect_range(name, 0, 2)?;
            let sep = sep.or_else(|| args.positional.first().cloned());
            let maxsplit = match maxsplit.or_else(|| args.positional.get(1).cloned()) {
                Some(value) => usize::try_from(int_arg(&value)?).ok(),
                None => None,
            };
            let parts = match sep.filter(|sep| !sep.is_none()) {
                None => split_whitespace(text, maxsplit),
                Some(sep) => {
                    let sep = str_arg(&sep, name)?;
                    if sep.is_empty() {
                        return Err(Exception::new(ExcKind::ValueError, "empty separator"));
                    }
                    match maxsplit {
                        Some(max) => text.splitn(max + 1, sep).map(Value::str).collect(),
                        None => text.split(sep).map(Value::str).collect(),
                    }
                }
            };
            Ok(Value::list(parts))
        }
        "splitlines" => {
            args.expect_exact(name, 0)?;
            Ok(Value::list(text.lines().map(Value::str).collect()))
        }
        "join" => {
            args.expect_exact(name, 1)?;
            let items = interp.iterate(&args.positional[0])?;
            let mut pieces = Vec::with_capacity(items.len());
            for (idx, item) in items.iter().enumerate() {
                match item.as_str() {
                    Some(piece) => pieces.push(piece),
                    None => {
                        return Err(Exception::new(
                            ExcKind::TypeError,
                            format!(
                                "sequence item {idx}: expected str instance, {} found",
                                item.type_name()
                            ),
                        ));
                    }
                }
            }
            Ok(Value::str(pieces.join(text)))
        }
        "replace" => {
            args.no_keywords(name)?;
            args.expect_range(name, 2, 3)?;
            let old = str_arg(&args.positional[0], name)?;
            let new = str_arg(&args.positional[1], name)?;
            let replaced = match args.positional.get(2).map(int_arg).transpose()? {
                Some(count) if count >= 0 => text.replacen(old, new, count as usize),
                _ => text.replace(old, new),
            };
            Ok(Value::str(replaced))
        }
        "startswith" | "endswith" => Ok(Value::bool(prefix_test(text, &args, name)?)),
        "find" | "rfind" => {
            let found = find_in(text, &args, name, name == "rfind")?;
            Ok(Value::int(found.map_or(-1, |idx| idx as i64)))
        }
        "index" => match find_in(text, &args, name, false)? {
            Some(idx) => Ok(Value::int(idx as i64)),
            None => Err(Exception::new(ExcKind::ValueError, "substring not found")),
        },
        "count" => {
            args.no_keywords(name)?;
            args.expect_range(name, 1, 3)?;
            let needle = str_arg(&args.positional[0], name)?;
            let (start, end) = char_window(text, args.positional.get(1), args.positional.get(2))?;
            let window = &text[byte_offset(text, start)..byte_offset(text, end)];
            let count = if needle.is_empty() {
                window.chars().count() + 1
            } else {
                window.matches(needle).count()
            };
            Ok(Value::int(count as i64))
        }
        "isdigit" | "isalpha" | "isalnum" | "isspace" => {
            args.expect_exact(name, 0)?;
            let test: fn(char) -> bool = match name {
                "isdigit" => |ch| ch.is_ascii_digit(),
                "isalpha" => char::is_alphabetic,
                "isalnum" => char::is_alphanumeric,
                _ => char::is_whitespace,
            };
            Ok(Value::bool(!text.is_empty() && text.chars().all(test)))
        }
        "isupper" | "islower" => {
            args.expect_exact(name, 0)?;
            let mut cased = text.chars().filter(|ch| ch.is_uppercase() || ch.is_lowercase()).peekable();
            let has_cased = cased.peek().is_some();
            let all_match = if name == "isupper" {
                cased.all(char::is_uppercase)
            } else {
                cased.all(char::is_lowercase)
            };
            Ok(Value::bool(has_cased && all_match))
        }
        "zfill" => {
            args.expect_exact(name, 1)?;
            let width = int_arg(&args.positional[0])?.max(0) as usize;
            let len = text.chars().count();
            if len >= width {
                return Ok(Value::str(text));
            }
            let zeros = "0".repeat(width - len);
            let filled = match text.strip_prefix(['-', '+']) {
                Some(rest) => format!("{}{zeros}{rest}", &text[..1]),
                None => format!("{zeros}{text}"),
            };
            Ok(Value::str(filled))
        }
        "center" | "ljust" | "rjust" => {
            let (pad, fill) = padded(text, &args, name)?;
            let repeat = |n: usize| fill.to_string().repeat(n);
            let result = match name {
                "ljust" => format!("{text}{}", repeat(pad)),
                "rjust" => format!("{}{text}", repeat(pad)),
                _ => {
                    // Odd padding goes left when the width is odd.
                    let width = pad + text.chars().count();
                    let left = pad / 2 + (pad & width & 1);
                    format!("{}{text}{}", repeat(left), repeat(pad - left))
                }
            };
            Ok(Value::str(result))
        }
        "format" => Ok(Value::str(format_method(interp, text, &args)?)),
        _ => Err(no_attribute(&Value::str(text), name)),
    }
}

fn title_case(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut previous_cased = false;
    for ch in text.chars() {
        if previous_cased {
            out.extend(ch.to_lowercase());
        } else {
            out.extend(ch.to_uppercase());
        }
        previous_cased = ch.is_alphabetic();
    }
    out
}

/// `str.format` with automatic and explicit field numbering, keyword
/// fields, attribute lookups, conversions and format specs.
fn format_method(interp: &mut Interpreter, template: &str, args: &CallArgs) -> PyResult<String> {
    let mut out = String::new();
    let mut chars = template.chars().peekable();
    let mut next_auto = 0usize;
    let mut numbering: Option<bool> = None;
    while let Some(ch) = chars.next() {
        match ch {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '}' => {
                return Err(Exception::new(
                    ExcKind::ValueError,
                    "Single '}' encountered in format string",
                ));
            }
            '{' => {
                let mut field = String::new();
                let mut depth = 1;
                loop {
                    match chars.next() {
                        Some('{') => {
                            depth += 1;
                            field.push('{');
                        }
                        Some('}') => {
                            depth -= 1;
                            if depth == 0 {
                                break;
                            }
                            field.push('}');
                        }
                        Some(ch) => field.push(ch),
                        None => {
                            return Err(Exception::new(
                                ExcKind::ValueError,
                                "expected '}' before end of string",
                            ));
                        }
                    }
                }
                let (head, spec) = match field.split_once(':') {
                    Some((head, spec)) => (head, Some(spec)),
                    None => (field.as_str(), None),
                };
                let (head, conversion) = match head.split_once('!') {
                    Some((head, conversion)) => {
                        let mut conv = conversion.chars();
                        match (conv.next(), conv.next()) {
                            (Some(c @ ('r' | 's' | 'a')), None) => (head, Some(c)),
                            _ => {
                                return Err(Exception::new(
                                    ExcKind::ValueError,
                                    "Unknown conversion specifier",
                                ));
                            }
                        }
                    }
                    None => (head, None),
                };
                let (base, attrs) = match head.find(['.', '[']) {
                    Some(idx) => head.split_at(idx),
                    None => (head, ""),
                };
                let mut value = if base.is_empty() {
                    if numbering == Some(false) {
                        return Err(Exception::new(
                            ExcKind::ValueError,
                            "cannot switch from manual field specification to automatic field numbering",
                        ));
                    }
                    numbering = Some(true);
                    let idx = next_auto;
                    next_auto += 1;
                    positional_field(args, idx)?
                } else if let Ok(idx) = base.parse::<usize>() {
                    if numbering == Some(true) {
                        return Err(Exception::new(
                            ExcKind::ValueError,
                            "cannot switch from automatic field numbering to manual field specification",
                        ));
                    }
                    numbering = Some(false);
                    positional_field(args, idx)?
                } else {
                    match args.keywords.iter().find(|(key, _)| key == base) {
                        Some((_, value)) => value.clone(),
                        None => return Err(Exception::key_error(Value::str(base))),
                    }
                };
                value = resolve_accessors(interp, value, attrs)?;
                out.push_str(&interp.format_field(&value, conversion, spec)?);
            }
            ch => out.push(ch),
        }
    }
    Ok(out)
}

fn positional_field(args: &CallArgs, idx: usize) -> PyResult<Value> {
    args.positional.get(idx).cloned().ok_or_else(|| {
        Exception::new(
            ExcKind::IndexError,
            format!("Replacement index {idx} out of range for positional args tuple"),
        )
    })
}

/// Applies `.attr` and `[key]` accessors from a replacement field name.
fn resolve_accessors(interp: &mut Interpreter, mut value: Value, mut rest: &str) -> PyResult<Value> {
    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix('.') {
            let end = after.find(['.', '[']).unwrap_or(after.len());
            value = interp.get_attribute(&value, &after[..end])?;
            rest = &after[end..];
        } else if let Some(after) = rest.strip_prefix('[') {
            let Some(end) = after.find(']') else {
                return Err(Exception::new(
                    ExcKind::ValueError,
                    "Missing ']' in format string",
                ));
            };
            let key = &after[..end];
            let key = match key.parse::<i64>() {
                Ok(n) => Value::int(n),
                Err(_) => Value::str(key),
            };
            value = interp.get_item(&value, &key)?;
            rest = &after[end + 1..];
        } else {
            return Err(Exception::new(
                ExcKind::ValueError,
                "Only '.' or '[' may follow ']' in format field specifier",
            ));
        }
    }
    Ok(value)
}

fn list_items(receiver: &Value) -> Vec<Value> {
    match receiver.kind() {
        ValueKind::List(items) => items.borrow().clone(),
        _ => Vec::new(),
    }
}

fn with_list<T>(receiver: &Value, update: impl FnOnce(&mut Vec<Value>) -> T) -> Option<T> {
    match receiver.kind() {
        ValueKind::List(items) => Some(update(&mut items.borrow_mut())),
        _ => None,
    }
}

/// Index of the first item equal to `needle`, by `==`.
fn position_of(interp: &mut Interpreter, items: &[Value], needle: &Value) -> PyResult<Option<usize>> {
    for (idx, item) in items.iter().enumerate() {
        if interp.compare(CmpOp::Eq, item, needle)? {
            return Ok(Some(idx));
        }
    }
    Ok(None)
}

fn list_method(
    interp: &mut Interpreter,
    receiver: &Value,
    name: &str,
    mut args: CallArgs,
) -> PyResult<Value> {
    match name {
        "append" => {
            args.expect_exact(name, 1)?;
            let item = args.positional.remove(0);
            with_list(receiver, |items| items.push(item));
            Ok(Value::none())
        }
        "extend" => {
            args.expect_exact(name, 1)?;
            // Snapshot first: `xs.extend(xs)` reads the list it grows.
            let extra = interp.iterate(&args.positional[0])?;
            with_list(receiver, |items| items.extend(extra));
            Ok(Value::none())
        }
        "pop" => {
            args.no_keywords(name)?;
            args.expect_range(name, 0, 1)?;
            let index = args.positional.first().map(int_arg).transpose()?.unwrap_or(-1);
            let popped = with_list(receiver, |items| {
                if items.is_empty() {
                    return Err(Exception::new(ExcKind::IndexError, "pop from empty list"));
                }
                let len = items.len() as i64;
                let idx = if index < 0 { index + len } else { index };
                if idx < 0 || idx >= len {
                    return Err(Exception::new(ExcKind::IndexError, "pop index out of range"));
                }
                Ok(items.remove(idx as usize))
            });
            popped.unwrap_or_else(|| Ok(Value::none()))
        }
        "insert" => {
            args.expect_exact(name, 2)?;
            let index = int_arg(&args.positional[0])?;
            let item = args.positional.remove(1);
            with_list(receiver, |items| {
                let len = items.len() as i64;
                let idx = if index < 0 { (index + len).max(0) } else { index.min(len) };
                items.insert(idx as usize, item);
            });
            Ok(Value::none())
        }
        "remove" => {
            args.expect_exact(name, 1)?;
            let items = list_items(receiver);
            match position_of(interp, &items, &args.positional[0])? {
                Some(idx) => {
                    with_list(receiver, |items| items.remove(idx));
                    Ok(Value::none())
                }
                None => Err(Exception::new(
                    ExcKind::ValueError,
                    "list.remove(x): x not in list",
                )),
            }
        }
        "index" => {
            args.expect_exact(name, 1)?;
            let items = list_items(receiver);
            let needle = &args.positional[0];
            match position_of(interp, &items, needle)? {
                Some(idx) => Ok(Value::int(idx as i64)),
                None => Err(Exception::new(
                    ExcKind::ValueError,
                    format!("{} is not in list", interp.repr_value(needle)?),
                )),
            }
        }
        "count" => {
            args.expect_exact(name, 1)?;
            let items = list_items(receiver);
            let mut count = 0;
            for item in &items {
                if interp.compare(CmpOp::Eq, item, &args.positional[0])? {
                    count += 1;
                }
            }
            Ok(Value::int(count))
        }
        "sort" => {
            let key = args.take_keyword("key");
            let reverse = args.take_keyword("reverse");
            args.finish(name)?;
            args.expect_exact(name, 0)?;
            let reverse = reverse.is_some_and(|flag| flag.is_truthy());
            let sorted = stdlib::sort_values(interp, list_items(receiver), key.as_ref(), reverse)?;
            with_list(receiver, |items| *items = sorted);
            Ok(Value::none())
        }
        "reverse" => {
            args.expect_exact(name, 0)?;
            with_list(receiver, |items| items.reverse());
            Ok(Value::none())
        }
        "copy" => {
            args.expect_exact(name, 0)?;
            Ok(Value::list(list_items(receiver)))
        }
        "clear" => {
            args.expect_exact(name, 0)?;
            with_list(receiver, Vec::clear);
            Ok(Value::none())
        }
        _ => Err(no_attribute(receiver, name)),
    }
}

fn with_dict<T>(receiver: &Value, update: impl FnOnce(&mut Dict) -> T) -> Option<T> {
    match receiver.kind() {
        ValueKind::Dict(dict) => Some(update(&mut dict.borrow_mut())),
        _ => None,
    }
}

fn dict_snapshot(receiver: &Value) -> Dict {
    match receiver.kind() {
        ValueKind::Dict(dict) => dict.borrow().clone(),
        _ => Dict::new(),
    }
}

fn dict_get(receiver: &Value, key: &Value) -> PyResult<Option<Value>> {
    match receiver.kind() {
        ValueKind::Dict(dict) => dict.borrow().get(key),
        _ => Ok(None),
    }
}

fn dict_method(
    interp: &mut Interpreter,
    receiver: &Value,
    name: &str,
    mut args: CallArgs,
) -> PyResult<Value> {
    match name {
        "keys" => {
            args.expect_exact(name, 0)?;
            Ok(Value::list(dict_snapshot(receiver).keys()))
        }
        "values" => {
            args.expect_exact(name, 0)?;
            Ok(Value::list(dict_snapshot(receiver).values()))
        }
        "items" => {
            args.expect_exact(name, 0)?;
            let items = dict_snapshot(receiver)
                .items()
                .into_iter()
                .map(|(key, value)| Value::tuple(vec![key, value]))
                .collect();
            Ok(Value::list(items))
        }
        "get" => {
            args.no_keywords(name)?;
            args.expect_range(name, 1, 2)?;
            let found = dict_get(receiver, &args.positional[0])?;
            Ok(found
                .or_else(|| args.positional.get(1).cloned())
                .unwrap_or_else(Value::none))
        }
        "pop" => {
            args.no_keywords(name)?;
            args.expect_range(name, 1, 2)?;
            let key = &args.positional[0];
            let removed = with_dict(receiver, |dict| dict.remove(key)).transpose()?.flatten();
            match (removed, args.positional.get(1)) {
                (Some(value), _) => Ok(value),
                (None, Some(default)) => Ok(default.clone()),
                (None, None) => Err(Exception::key_error(key.clone())),
            }
        }
        "popitem" => {
            args.expect_exact(name, 0)?;
            match with_dict(receiver, Dict::pop_last).flatten() {
                Some((key, value)) => Ok(Value::tuple(vec![key, value])),
                None => Err(Exception::new(
                    ExcKind::KeyError,
                    "popitem(): dictionary is empty",
                )),
            }
        }
        "update" => {
            args.expect_range(name, 0, 1)?;
            let mut merged = dict_snapshot(receiver);
            if let Some(source) = args.positional.first() {
                stdlib::merge_into(interp, &mut merged, source)?;
            }
            for (key, value) in std::mem::take(&mut args.keywords) {
                merged.insert(Value::str(key), value)?;
            }
            with_dict(receiver, |dict| *dict = merged);
            Ok(Value::none())
        }
        "setdefault" => {
            args.no_keywords(name)?;
            args.expect_range(name, 1, 2)?;
            let key = args.positional[0].clone();
            let default = args.positional.get(1).cloned().unwrap_or_else(Value::none);
            let existing = dict_get(receiver, &key)?;
            match existing {
                Some(value) => Ok(value),
                None => {
                    with_dict(receiver, |dict| dict.insert(key, default.clone())).transpose()?;
                    Ok(default)
                }
            }
        }
        "copy" => {
            args.expect_exact(name, 0)?;
            Ok(Value::dict(dict_snapshot(receiver)))
        }
        "clear" => {
            args.expect_exact(name, 0)?;
            with_dict(receiver, Dict::clear);
            Ok(Value::none())
        }
        _ => Err(no_attribute(receiver, name)),
    }
}

fn set_snapshot(receiver: &Value) -> SetValue {
    match receiver.kind() {
        ValueKind::Set(set) => set.borrow().clone(),
        _ => SetValue::new(),
    }
}

fn with_set<T>(receiver: &Value, update: impl FnOnce(&mut SetValue) -> T) -> Option<T> {
    match receiver.kind() {
        ValueKind::Set(set) => Some(update(&mut set.borrow_mut())),
        _ => None,
    }
}

/// Every positional argument collected into one set each.
fn set_operands(interp: &mut Interpreter, args: &CallArgs) -> PyResult<Vec<SetValue>> {
    args.positional
        .iter()
        .map(|value| match value.kind() {
            ValueKind::Set(set) => Ok(set.borrow().clone()),
            _ => SetValue::from_values(interp.iterate(value)?),
        })
        .collect()
}

fn set_method(
    interp: &mut Interpreter,
    receiver: &Value,
    name: &str,
    args: CallArgs,
) -> PyResult<Value> {
    args.no_keywords(name)?;
    match name {
        "add" => {
            args.expect_exact(name, 1)?;
            let item = args.positional[0].clone();
            with_set(receiver, |set| set.insert(item)).transpose()?;
            Ok(Value::none())
        }
        "remove" | "discard" => {
            args.expect_exact(name, 1)?;
            let item = &args.positional[0];
            let removed = with_set(receiver, |set| set.remove(item))
                .transpose()?
                .unwrap_or(false);
            if !removed && name == "remove" {
                return Err(Exception::key_error(item.clone()));
            }
            Ok(Value::none())
        }
        "pop" => {
            args.expect_exact(name, 0)?;
            with_set(receiver, SetValue::pop_first)
                .flatten()
                .ok_or_else(|| Exception::new(ExcKind::KeyError, "pop from an empty set"))
        }
        "clear" => {
            args.expect_exact(name, 0)?;
            with_set(receiver, SetValue::clear);
            Ok(Value::none())
        }
        "copy" => {
            args.expect_exact(name, 0)?;
            Ok(Value::set(set_snapshot(receiver)))
        }
        "update" => {
            let merged = set_operands(interp, &args)?
                .iter()
                .fold(set_snapshot(receiver), |acc, other| acc.union(other));
            with_set(receiver, |set| *set = merged);
            Ok(Value::none())
        }
        "union" | "intersection" | "difference" | "symmetric_difference" => {
            let operands = set_operands(interp, &args)?;
            let result = operands.iter().fold(set_snapshot(receiver), |acc, other| match name {
                "union" => acc.union(other),
                "intersection" => acc.intersection(other),
                "difference" => acc.difference(other),
                _ => acc.symmetric_difference(other),
            });
            Ok(Value::set(result))
        }
        "issubset" | "issuperset" | "isdisjoint" => {
            args.expect_exact(name, 1)?;
            let own = set_snapshot(receiver);
            let other = set_operands(interp, &args)?.remove(0);
            let answer = match name {
                "issubset" => own.is_subset(&other),
                "issuperset" => other.is_subset(&own),
                _ => own.intersection(&other).is_empty(),
            };
            Ok(Value::bool(answer))
        }
        _ => Err(no_attribute(receiver, name)),
    }
}

fn object_method(
    interp: &mut Interpreter,
    receiver: &Value,
    name: &str,
    args: CallArgs,
) -> PyResult<Value> {
    match name {
        "__init__" => {
            if !args.is_empty() {
                return Err(Exception::new(
                    ExcKind::TypeError,
                    "object.__init__() takes exactly one argument (the instance to initialize)",
                ));
            }
            Ok(Value::none())
        }
        "__str__" => {
            args.expect_exact(name, 0)?;
            Ok(Value::str(interp.repr_value(receiver)?))
        }
        "__repr__" => {
            args.expect_exact(name, 0)?;
            Ok(Value::str(receiver.repr()))
        }
        _ => Err(no_attribute(receiver, name)),
    }
}

fn exception_method(
    interp: &mut Interpreter,
    receiver: &Value,
    name: &str,
    args: CallArgs,
) -> PyResult<Value> {
    let ValueKind::Exception(exception) = receiver.kind() else {
        return Err(no_attribute(receiver, name));
    };
    match name {
        "__init__" => {
            args.no_keywords(&exception.class_name())?;
            exception.set_args(args.positional);
            Ok(Value::none())
        }
        "__str__" => {
            args.expect_exact(name, 0)?;
            Ok(Value::str(exception.message()))
        }
        "__repr__" => {
            args.expect_exact(name, 0)?;
            let parts = exception
                .args()
                .iter()
                .map(|arg| interp.repr_value(arg))
                .collect::<PyResult<Vec<_>>>()?;
            Ok(Value::str(format!("{}({})", exception.class_name(), parts.join(", "))))
        }
        "with_traceback" => {
            args.expect_exact(name, 1)?;
            Ok(receiver.clone())
        }
        _ => Err(no_attribute(receiver, name)),
    }
}
