use std::{
    cell::RefCell,
    fmt,
    rc::{Rc, Weak},
};

use indexmap::IndexMap;
use num_bigint::BigInt;
use num_traits::{FromPrimitive, ToPrimitive, Zero};

use crate::{
    ast::{Parameters, Stmt},
    environment::EnvironmentRef,
    exception::{ExcKind, Exception, PyResult},
    format::float_repr,
    runtime::Interpreter,
};

#[derive(Clone)]
pub struct Value(pub Rc<ValueKind>);

impl Value {
    pub fn new(kind: ValueKind) -> Self {
        Self(Rc::new(kind))
    }

    pub fn none() -> Self {
        Self::new(ValueKind::None)
    }

    pub fn bool(value: bool) -> Self {
        Self::new(ValueKind::Bool(value))
    }

    pub fn int(value: i64) -> Self {
        Self::new(ValueKind::Int(value))
    }

    /// An `int` of any size. Values that fit `i64` use the small form.
    pub fn from_bigint(value: BigInt) -> Self {
        match value.to_i64() {
            Some(small) => Self::int(small),
            None => Self::new(ValueKind::BigInt(value)),
        }
    }

    pub fn float(value: f64) -> Self {
        Self::new(ValueKind::Float(value))
    }

    pub fn str(value: impl Into<String>) -> Self {
        Self::new(ValueKind::Str(value.into()))
    }

    pub fn list(values: Vec<Value>) -> Self {
        Self::new(ValueKind::List(RefCell::new(values)))
    }

    pub fn tuple(values: Vec<Value>) -> Self {
        Self::new(ValueKind::Tuple(values))
    }

    pub fn dict(dict: Dict) -> Self {
        Self::new(ValueKind::Dict(RefCell::new(dict)))
    }

    pub fn set(set: SetValue) -> Self {
        Self::new(ValueKind::Set(RefCell::new(set)))
    }

    pub fn module(name: impl Into<String>, attrs: IndexMap<String, Value>) -> Self {
        Self::new(ValueKind::Module(ModuleValue {
            name: name.into(),
            attrs,
        }))
    }

    pub fn kind(&self) -> &ValueKind {
        &self.0
    }

    pub fn is_none(&self) -> bool {
        matches!(&*self.0, ValueKind::None)
    }

    pub fn is_truthy(&self) -> bool {
        match &*self.0 {
            ValueKind::None => false,
            ValueKind::Bool(b) => *b,
            ValueKind::Int(n) => *n != 0,
            ValueKind::BigInt(n) => !n.is_zero(),
            ValueKind::Float(f) => *f != 0.0,
            ValueKind::Str(s) => !s.is_empty(),
            ValueKind::List(values) => !values.borrow().is_empty(),
            ValueKind::Tuple(values) => !values.is_empty(),
            ValueKind::Dict(dict) => !dict.borrow().is_empty(),
            ValueKind::Set(set) => !set.borrow().is_empty(),
            ValueKind::Range(range) => !range.is_empty(),
            _ => true,
        }
    }

    /// The Python-visible type name, as used in error messages.
    pub fn type_name(&self) -> String {
        let name = match &*self.0 {
            ValueKind::None => "NoneType",
            ValueKind::Bool(_) => "bool",
            ValueKind::Int(_) | ValueKind::BigInt(_) => "int",
            ValueKind::Float(_) => "float",
            ValueKind::Str(_) => "str",
            ValueKind::List(_) => "list",
            ValueKind::Tuple(_) => "tuple",
            ValueKind::Dict(_) => "dict",
            ValueKind::Set(_) => "set",
            ValueKind::Range(_) => "range",
            ValueKind::Super(_) => "super",
            ValueKind::Function(_) => "function",
            ValueKind::NativeFunction(_) => "builtin_function_or_method",
            ValueKind::BoundMethod(_) => "method",
            ValueKind::BuiltinMethod(_) => "builtin_function_or_method",
            ValueKind::Class(_) | ValueKind::Type(_) => "type",
            ValueKind::Module(_) => "module",
            ValueKind::Instance(instance) => return instance.class.name.clone(),
            ValueKind::Exception(exception) => return exception.class_name(),
        };
        name.to_string()
    }

    /// Integer view of ints and bools.
    pub fn as_int(&self) -> Option<i64> {
        match &*self.0 {
            ValueKind::Int(n) => Some(*n),
            ValueKind::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    /// Integer view of ints of any size and bools.
    pub fn as_bigint(&self) -> Option<BigInt> {
        match &*self.0 {
            ValueKind::BigInt(n) => Some(n.clone()),
            _ => self.as_int().map(BigInt::from),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &*self.0 {
            ValueKind::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn identity(&self) -> usize {
        Rc::as_ptr(&self.0) as usize
    }

    /// The `is` operator.
    pub fn is_same(&self, other: &Value) -> bool {
        match (&*self.0, &*other.0) {
            (ValueKind::None, ValueKind::None) => true,
            (ValueKind::Bool(a), ValueKind::Bool(b)) => a == b,
            (ValueKind::Int(a), ValueKind::Int(b)) => a == b,
            (ValueKind::Type(a), ValueKind::Type(b)) => a == b,
            (ValueKind::Class(a), ValueKind::Class(b)) => Rc::ptr_eq(a, b),
            (ValueKind::Exception(a), ValueKind::Exception(b)) => a.id() == b.id(),
            _ => Rc::ptr_eq(&self.0, &other.0),
        }
    }

    /// `repr()` for values whose representation needs no user code.
    pub fn repr(&self) -> String {
        match &*self.0 {
            ValueKind::None => "None".to_string(),
            ValueKind::Bool(true) => "True".to_string(),
            ValueKind::Bool(false) => "False".to_string(),
            ValueKind::Int(n) => n.to_string(),
            ValueKind::BigInt(n) => n.to_string(),
            ValueKind::Float(f) => float_repr(*f),
            ValueKind::Str(s) => quote_str(s),
            ValueKind::List(values) => {
                let values = values.borrow();
                format!("[{}]", join_reprs(values.iter()))
            }
            ValueKind::Tuple(values) => match values.as_slice() {
                [single] => format!("({},)", single.repr()),
                values => format!("({})", join_reprs(values.iter())),
            },
            ValueKind::Dict(dict) => {
                let dict = dict.borrow();
                let entries: Vec<String> = dict
                    .iter()
                    .map(|(key, value)| format!("{}: {}", key.repr(), value.repr()))
                    .collect();
                format!("{{{}}}", entries.join(", "))
            }
            ValueKind::Set(set) => {
                let set = set.borrow();
                if set.is_empty() {
                    "set()".to_string()
                } else {
                    format!("{{{}}}", join_reprs(set.iter()))
                }
            }
            ValueKind::Range(range) => {
                if range.step == 1 {
                    format!("range({}, {})", range.start, range.stop)
                } else {
                    format!("range({}, {}, {})", range.start, range.stop, range.step)
                }
            }
            ValueKind::Function(fun) => {
                format!("<function {} at {:#x}>", fun.name, self.identity())
            }
            ValueKind::NativeFunction(fun) => format!("<built-in function {}>", fun.name),
            ValueKind::BoundMethod(method) => format!(
                "<bound method {}.{} of {}>",
                method.receiver.type_name(),
                method.function.name,
                method.receiver.repr()
            ),
            ValueKind::BuiltinMethod(method) => format!(
                "<built-in method {} of {} object at {:#x}>",
                method.name,
                method.receiver.type_name(),
                method.receiver.identity()
            ),
            ValueKind::Class(class) => format!("<class '__main__.{}'>", class.name),
            ValueKind::Super(sup) => format!(
                "<super: <class '{}'>, <{} object>>",
                sup.class.name,
                sup.receiver.type_name()
            ),
            ValueKind::Type(ty) => format!("<class '{}'>", ty.name()),
            ValueKind::Module(module) => format!("<module '{}' (built-in)>", module.name),
            ValueKind::Instance(instance) => format!(
                "<__main__.{} object at {:#x}>",
                instance.class.name,
                self.identity()
            ),
            ValueKind::Exception(exception) => {
                format!("{}({})", exception.class_name(), join_reprs(exception.args().iter()))
            }
        }
    }
}

fn join_reprs<'a>(values: impl Iterator<Item = &'a Value>) -> String {
    values.map(Value::repr).collect::<Vec<_>>().join(", ")
}

/// Quote a string the way `repr(str)` does.
pub fn quote_str(text: &str) -> String {
    let quote = if text.contains('\'') && !text.contains('"') {
        '"'
    } else {
        '\''
    };
    let mut out = String::with_capacity(text.len() + 2);
    out.push(quote);
    for ch in text.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            ch if ch == quote => {
                out.push('\\');
                out.push(ch);
            }
            ch if (ch as u32) < 0x20 || ch as u32 == 0x7f => {
                out.push_str(&format!("\\x{:02x}", ch as u32));
            }
            ch => out.push(ch),
        }
    }
    out.push(quote);
    out
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.repr())
    }
}

/// `str()` for values whose text needs no user code.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.0 {
            ValueKind::Str(s) => write!(f, "{s}"),
            ValueKind::Exception(exception) => write!(f, "{}", exception.message()),
            _ => write!(f, "{}", self.repr()),
        }
    }
}

pub enum ValueKind {
    None,
    Bool(bool),
    Int(i64),
    /// An `int` outside the `i64` range.
    BigInt(BigInt),
    Float(f64),
    Str(String),
    List(RefCell<Vec<Value>>),
    Tuple(Vec<Value>),
    Dict(RefCell<Dict>),
    Set(RefCell<SetValue>),
    Range(RangeValue),
    Function(UserFunction),
    NativeFunction(NativeFunction),
    BoundMethod(BoundMethod),
    BuiltinMethod(BuiltinMethod),
    Class(Rc<Class>),
    Super(SuperValue),
    Instance(Instance),
    Type(BuiltinType),
    Module(ModuleValue),
    Exception(Exception),
}

/// Key used to hash dictionary entries. Numbers that compare equal hash
/// equal, so `1`, `1.0` and `True` share a slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HashKey {
    None,
    Int(i64),
    Big(BigInt),
    Float(u64),
    Str(String),
    Tuple(Vec<HashKey>),
    Identity(usize),
}

impl HashKey {
    pub fn from_value(value: &Value) -> PyResult<Self> {
        let key = match &*value.0 {
            ValueKind::None => HashKey::None,
            ValueKind::Bool(b) => HashKey::Int(i64::from(*b)),
            ValueKind::Int(n) => HashKey::Int(*n),
            ValueKind::BigInt(n) => HashKey::Big(n.clone()),
            ValueKind::Float(f) => {
                if f.fract() == 0.0 && f.abs() < 9.2e18 {
                    HashKey::Int(*f as i64)
                } else if f.fract() == 0.0 {
                    match BigInt::from_f64(*f) {
                        Some(n) => HashKey::Big(n),
                        None => HashKey::Float(f.to_bits()),
                    }
                } else {
                    HashKey::Float(f.to_bits())
                }
            }
            ValueKind::Str(s) => HashKey::Str(s.clone()),
            ValueKind::Tuple(values) => HashKey::Tuple(
                values
                    .iter()
                    .map(HashKey::from_value)
                    .collect::<PyResult<Vec<_>>>()?,
            ),
            ValueKind::Type(ty) => HashKey::Str(format!("<type {}>", ty.name())),
            ValueKind::Class(class) => HashKey::Identity(Rc::as_ptr(class) as usize),
            ValueKind::List(_) | ValueKind::Dict(_) | ValueKind::Set(_) => {
                return Err(Exception::new(
                    ExcKind::TypeError,
                    format!("unhashable type: '{}'", value.type_name()),
                ));
            }
            _ => HashKey::Identity(value.identity()),
        };
        Ok(key)
    }
}

/// Insertion-ordered mapping keeping the original key object per entry.
#[derive(Clone, Default)]
pub struct Dict {
    entries: IndexMap<HashKey, (Value, Value)>,
}

impl Dict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &Value) -> PyResult<Option<Value>> {
        let key = HashKey::from_value(key)?;
        Ok(self.entries.get(&key).map(|(_, value)| value.clone()))
    }

    pub fn contains(&self, key: &Value) -> PyResult<bool> {
        Ok(self.entries.contains_key(&HashKey::from_value(key)?))
    }

    pub fn insert(&mut self, key: Value, value: Value) -> PyResult<()> {
        let hashed = HashKey::from_value(&key)?;
        match self.entries.get_mut(&hashed) {
            Some(entry) => entry.1 = value,
            None => {
                self.entries.insert(hashed, (key, value));
            }
        }
        Ok(())
    }

    pub fn remove(&mut self, key: &Value) -> PyResult<Option<Value>> {
        let key = HashKey::from_value(key)?;
        Ok(self.entries.shift_remove(&key).map(|(_, value)| value))
    }

    pub fn pop_last(&mut self) -> Option<(Value, Value)> {
        self.entries.pop().map(|(_, entry)| entry)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Value, &Value)> {
        self.entries.values().map(|(key, value)| (key, value))
    }

    pub fn keys(&self) -> Vec<Value> {
        self.entries.values().map(|(key, _)| key.clone()).collect()
    }

    pub fn values(&self) -> Vec<Value> {
        self.entries.values().map(|(_, value)| value.clone()).collect()
    }

    pub fn items(&self) -> Vec<(Value, Value)> {
        self.entries.values().cloned().collect()
    }
}

/// Insertion-ordered set of hashable values.
#[derive(Clone, Default)]
pub struct SetValue {
    entries: IndexMap<HashKey, Value>,
}

impl SetValue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_values(values: impl IntoIterator<Item = Value>) -> PyResult<Self> {
        let mut set = Self::new();
        for value in values {
            set.insert(value)?;
        }
        Ok(set)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, value: &Value) -> PyResult<bool> {
        Ok(self.entries.contains_key(&HashKey::from_value(value)?))
    }

    /// Adds `value` unless an equal element is present. Returns whether it
    /// was added.
    pub fn insert(&mut self, value: Value) -> PyResult<bool> {
        let key = HashKey::from_value(&value)?;
        if self.entries.contains_key(&key) {
            return Ok(false);
        }
        self.entries.insert(key, value);
        Ok(true)
    }

    pub fn remove(&mut self, value: &Value) -> PyResult<bool> {
        let key = HashKey::from_value(value)?;
        Ok(self.entries.shift_remove(&key).is_some())
    }

    pub fn pop_first(&mut self) -> Option<Value> {
        self.entries.shift_remove_index(0).map(|(_, value)| value)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.entries.values()
    }

    pub fn values(&self) -> Vec<Value> {
        self.entries.values().cloned().collect()
    }

    fn has_key(&self, key: &HashKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn union(&self, other: &SetValue) -> SetValue {
        let mut entries = self.entries.clone();
        for (key, value) in &other.entries {
            entries.entry(key.clone()).or_insert_with(|| value.clone());
        }
        SetValue { entries }
    }

    pub fn intersection(&self, other: &SetValue) -> SetValue {
        self.filtered(|key| other.has_key(key))
    }

    pub fn difference(&self, other: &SetValue) -> SetValue {
        self.filtered(|key| !other.has_key(key))
    }

    pub fn symmetric_difference(&self, other: &SetValue) -> SetValue {
        let mut result = self.difference(other);
        for (key, value) in &other.entries {
            if !self.has_key(key) {
                result.entries.insert(key.clone(), value.clone());
            }
        }
        result
    }

    pub fn is_subset(&self, other: &SetValue) -> bool {
        self.entries.keys().all(|key| other.has_key(key))
    }

    fn filtered(&self, keep: impl Fn(&HashKey) -> bool) -> SetValue {
        let entries = self
            .entries
            .iter()
            .filter(|(key, _)| keep(key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        SetValue { entries }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeValue {
    pub start: i64,
    pub stop: i64,
    pub step: i64,
}

impl RangeValue {
    /// Element count, exact for any `i64` bounds.
    pub fn length(&self) -> i128 {
        let (start, stop, step) = (
            i128::from(self.start),
            i128::from(self.stop),
            i128::from(self.step),
        );
        let span = if step > 0 { stop - start } else { start - stop };
        if span <= 0 {
            return 0;
        }
        let step = step.abs();
        (span + step - 1) / step
    }

    /// `len()` of the range, which must fit a machine-sized integer.
    pub fn len(&self) -> PyResult<usize> {
        let length = self.length();
        match isize::try_from(length) {
            Ok(length) => Ok(length as usize),
            Err(_) => Err(Exception::new(
                ExcKind::OverflowError,
                "Python int too large to convert to C ssize_t",
            )),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.length() == 0
    }

    /// The element at a non-negative index below `length()`.
    pub fn get(&self, index: i128) -> i64 {
        let value = i128::from(self.start) + i128::from(self.step) * index;
        value as i64
    }

    pub fn contains(&self, value: i64) -> bool {
        let in_bounds = if self.step > 0 {
            self.start <= value && value < self.stop
        } else {
            self.stop < value && value <= self.start
        };
        in_bounds && (i128::from(value) - i128::from(self.start)) % i128::from(self.step) == 0
    }

    pub fn values(&self) -> impl Iterator<Item = i64> + '_ {
        (0..self.length()).map(|idx| self.get(idx))
    }
}

pub struct ModuleValue {
    pub name: String,
    pub attrs: IndexMap<String, Value>,
}

/// The class a method body was defined in, filled once the class object
/// exists. Zero-argument `super()` reads it.
pub type ClassCell = Rc<RefCell<Option<Weak<Class>>>>;

#[derive(Clone)]
pub struct UserFunction {
    pub name: String,
    pub params: Rc<Parameters>,
    pub defaults: Vec<Option<Value>>,
    pub body: Rc<Vec<Stmt>>,
    pub env: EnvironmentRef,
    pub class_cell: Option<ClassCell>,
}

pub type NativeFn = fn(&mut Interpreter, CallArgs) -> PyResult<Value>;

#[derive(Clone)]
pub struct NativeFunction {
    pub name: &'static str,
    pub callback: NativeFn,
}

impl NativeFunction {
    pub fn call(&self, interpreter: &mut Interpreter, args: CallArgs) -> PyResult<Value> {
        (self.callback)(interpreter, args)
    }
}

pub struct BoundMethod {
    pub receiver: Value,
    pub function: UserFunction,
}

/// A method of a built-in type, bound to its receiver.
pub struct BuiltinMethod {
    pub receiver: Value,
    pub name: &'static str,
}

pub struct Class {
    pub name: String,
    pub base: Option<ClassBase>,
    pub attrs: RefCell<IndexMap<String, Value>>,
}

#[derive(Clone)]
pub enum ClassBase {
    User(Rc<Class>),
    Exception(ExcKind),
}

impl Class {
    pub fn lookup(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.attrs.borrow().get(name) {
            return Some(value.clone());
        }
        match &self.base {
            Some(ClassBase::User(parent)) => parent.lookup(name),
            _ => None,
        }
    }

    pub fn is_subclass_of(&self, other: &Class) -> bool {
        if std::ptr::eq(self, other) {
            return true;
        }
        match &self.base {
            Some(ClassBase::User(parent)) => parent.is_subclass_of(other),
            _ => false,
        }
    }

    /// The built-in exception this class ultimately derives from, if any.
    pub fn exception_root(&self) -> Option<ExcKind> {
        match &self.base {
            Some(ClassBase::User(parent)) => parent.exception_root(),
            Some(ClassBase::Exception(kind)) => Some(*kind),
            None => None,
        }
    }
}

/// `super()` bound to a class and the instance it was called for. Lookups
/// start at the class's base.
pub struct SuperValue {
    pub class: Rc<Class>,
    pub receiver: Value,
}

pub struct Instance {
    pub class: Rc<Class>,
    pub attrs: RefCell<IndexMap<String, Value>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinType {
    Object,
    NoneType,
    Bool,
    Int,
    Float,
    Str,
    List,
    Tuple,
    Dict,
    Set,
    Range,
    Function,
    Type,
    Module,
    Exception(ExcKind),
}

impl BuiltinType {
    pub fn name(self) -> &'static str {
        match self {
            BuiltinType::Object => "object",
            BuiltinType::NoneType => "NoneType",
            BuiltinType::Bool => "bool",
            BuiltinType::Int => "int",
            BuiltinType::Float => "float",
            BuiltinType::Str => "str",
            BuiltinType::List => "list",
            BuiltinType::Tuple => "tuple",
            BuiltinType::Dict => "dict",
            BuiltinType::Set => "set",
            BuiltinType::Range => "range",
            BuiltinType::Function => "function",
            BuiltinType::Type => "type",
            BuiltinType::Module => "module",
            BuiltinType::Exception(kind) => kind.name(),
        }
    }

    /// The type object `type(value)` returns for a built-in value.
    pub fn of(value: &Value) -> Option<BuiltinType> {
        let ty = match value.kind() {
            ValueKind::None => BuiltinType::NoneType,
            ValueKind::Bool(_) => BuiltinType::Bool,
            ValueKind::Int(_) | ValueKind::BigInt(_) => BuiltinType::Int,
            ValueKind::Float(_) => BuiltinType::Float,
            ValueKind::Str(_) => BuiltinType::Str,
            ValueKind::List(_) => BuiltinType::List,
            ValueKind::Tuple(_) => BuiltinType::Tuple,
            ValueKind::Dict(_) => BuiltinType::Dict,
            ValueKind::Set(_) => BuiltinType::Set,
            ValueKind::Range(_) => BuiltinType::Range,
            ValueKind::Function(_)
            | ValueKind::NativeFunction(_)
            | ValueKind::BoundMethod(_)
            | ValueKind::BuiltinMethod(_) => BuiltinType::Function,
            ValueKind::Class(_) | ValueKind::Type(_) => BuiltinType::Type,
            ValueKind::Module(_) => BuiltinType::Module,
            ValueKind::Exception(exception) => match &exception.class {
                crate::exception::ExcClass::Builtin(kind) => BuiltinType::Exception(*kind),
                crate::exception::ExcClass::User(_) => return None,
            },
            ValueKind::Instance(_) | ValueKind::Super(_) => return None,
        };
        Some(ty)
    }

    /// Whether `value` is an instance of this type, honoring the implicit
    /// `bool <: int` and `* <: object` relations.
    pub fn accepts(self, value: &Value) -> bool {
        match (self, value.kind()) {
            (BuiltinType::Object, _) => true,
            (BuiltinType::Int, ValueKind::Bool(_)) => true,
            (BuiltinType::Exception(kind), ValueKind::Exception(exception)) => {
                exception.is_instance_of(kind)
            }
            _ => BuiltinType::of(value) == Some(self),
        }
    }
}

/// Arguments to a call, after star-expansion at the call site.
#[derive(Clone, Default)]
pub struct CallArgs {
    pub positional: Vec<Value>,
    pub keywords: Vec<(String, Value)>,
}

impl CallArgs {
    pub fn positional(values: Vec<Value>) -> Self {
        Self {
            positional: values,
            keywords: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.positional.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.keywords.is_empty()
    }

    pub fn take_keyword(&mut self, name: &str) -> Option<Value> {
        let idx = self.keywords.iter().position(|(key, _)| key == name)?;
        Some(self.keywords.remove(idx).1)
    }

    /// Fails if any keyword argument was left unconsumed.
    pub fn finish(&self, function: &str) -> PyResult<()> {
        match self.keywords.first() {
            Some((key, _)) => Err(Exception::new(
                ExcKind::TypeError,
                format!("'{key}' is an invalid keyword argument for {function}()"),
            )),
            None => Ok(()),
        }
    }

    pub fn no_keywords(&self, function: &str) -> PyResult<()> {
        if self.keywords.is_empty() {
            Ok(())
        } else {
            Err(Exception::new(
                ExcKind::TypeError,
                format!("{function}() takes no keyword arguments"),
            ))
        }
    }

    pub fn expect_exact(&self, function: &str, count: usize) -> PyResult<()> {
        self.no_keywords(function)?;
        if self.positional.len() == count {
            return Ok(());
        }
        let message = match count {
            0 => format!("{function}() takes no arguments ({} given)", self.positional.len()),
            1 => format!(
                "{function}() takes exactly one argument ({} given)",
                self.positional.len()
            ),
            _ => format!(
                "{function} expected {count} arguments, got {}",
                self.positional.len()
            ),
        };
        Err(Exception::new(ExcKind::TypeError, message))
    }

    pub fn expect_range(&self, function: &str, min: usize, max: usize) -> PyResult<()> {
        let given = self.positional.len();
        if given < min {
            let plural = if min == 1 { "" } else { "s" };
            return Err(Exception::new(
                ExcKind::TypeError,
                format!("{function} expected at least {min} argument{plural}, got {given}"),
            ));
        }
        if given > max {
            let plural = if max == 1 { "" } else { "s" };
            return Err(Exception::new(
                ExcKind::TypeError,
                format!("{function} expected at most {max} argument{plural}, got {given}"),
            ));
        }
        Ok(())
    }
}
