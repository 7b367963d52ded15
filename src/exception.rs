use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;

use crate::value::{Class, Value, ValueKind};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Built-in exception classes and their single-inheritance hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExcKind {
    BaseException,
    Exception,
    ArithmeticError,
    ZeroDivisionError,
    OverflowError,
    LookupError,
    IndexError,
    KeyError,
    NameError,
    UnboundLocalError,
    TypeError,
    ValueError,
    AttributeError,
    RuntimeError,
    NotImplementedError,
    RecursionError,
    AssertionError,
    StopIteration,
    SyntaxError,
    ImportError,
    ModuleNotFoundError,
    OSError,
}

impl ExcKind {
    pub const ALL: [ExcKind; 22] = [
        ExcKind::BaseException,
        ExcKind::Exception,
        ExcKind::ArithmeticError,
        ExcKind::ZeroDivisionError,
        ExcKind::OverflowError,
        ExcKind::LookupError,
        ExcKind::IndexError,
        ExcKind::KeyError,
        ExcKind::NameError,
        ExcKind::UnboundLocalError,
        ExcKind::TypeError,
        ExcKind::ValueError,
        ExcKind::AttributeError,
        ExcKind::RuntimeError,
        ExcKind::NotImplementedError,
        ExcKind::RecursionError,
        ExcKind::AssertionError,
        ExcKind::StopIteration,
        ExcKind::SyntaxError,
        ExcKind::ImportError,
        ExcKind::ModuleNotFoundError,
        ExcKind::OSError,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ExcKind::BaseException => "BaseException",
            ExcKind::Exception => "Exception",
            ExcKind::ArithmeticError => "ArithmeticError",
            ExcKind::ZeroDivisionError => "ZeroDivisionError",
            ExcKind::OverflowError => "OverflowError",
            ExcKind::LookupError => "LookupError",
            ExcKind::IndexError => "IndexError",
            ExcKind::KeyError => "KeyError",
            ExcKind::NameError => "NameError",
            ExcKind::UnboundLocalError => "UnboundLocalError",
            ExcKind::TypeError => "TypeError",
            ExcKind::ValueError => "ValueError",
            ExcKind::AttributeError => "AttributeError",
            ExcKind::RuntimeError => "RuntimeError",
            ExcKind::NotImplementedError => "NotImplementedError",
            ExcKind::RecursionError => "RecursionError",
            ExcKind::AssertionError => "AssertionError",
            ExcKind::StopIteration => "StopIteration",
            ExcKind::SyntaxError => "SyntaxError",
            ExcKind::ImportError => "ImportError",
            ExcKind::ModuleNotFoundError => "ModuleNotFoundError",
            ExcKind::OSError => "OSError",
        }
    }

    pub fn parent(self) -> Option<ExcKind> {
        let parent = match self {
            ExcKind::BaseException => return None,
            ExcKind::Exception => ExcKind::BaseException,
            ExcKind::ZeroDivisionError | ExcKind::OverflowError => ExcKind::ArithmeticError,
            ExcKind::IndexError | ExcKind::KeyError => ExcKind::LookupError,
            ExcKind::UnboundLocalError => ExcKind::NameError,
            ExcKind::NotImplementedError | ExcKind::RecursionError => ExcKind::RuntimeError,
            ExcKind::ModuleNotFoundError => ExcKind::ImportError,
            _ => ExcKind::Exception,
        };
        Some(parent)
    }

    pub fn is_subclass_of(self, other: ExcKind) -> bool {
        let mut current = Some(self);
        while let Some(kind) = current {
            if kind == other {
                return true;
            }
            current = kind.parent();
        }
        false
    }
}

/// The class of a raised exception: built in, or a user class deriving
/// from one.
#[derive(Clone)]
pub enum ExcClass {
    Builtin(ExcKind),
    User(Rc<Class>),
}

impl ExcClass {
    pub fn name(&self) -> String {
        match self {
            ExcClass::Builtin(kind) => kind.name().to_string(),
            ExcClass::User(class) => class.name.clone(),
        }
    }

    /// The nearest built-in ancestor.
    pub fn builtin_root(&self) -> ExcKind {
        match self {
            ExcClass::Builtin(kind) => *kind,
            ExcClass::User(class) => class.exception_root().unwrap_or(ExcKind::Exception),
        }
    }
}

/// Mutable state shared by every clone of one exception object, so
/// attributes set in `__init__` stay visible after the object is raised.
#[derive(Default)]
struct ExceptionState {
    args: RefCell<Vec<Value>>,
    attrs: RefCell<IndexMap<String, Value>>,
    display: RefCell<Option<String>>,
}

#[derive(Clone)]
pub struct Exception {
    id: u64,
    pub class: ExcClass,
    state: Rc<ExceptionState>,
    pub cause: Option<Box<Exception>>,
    pub context: Option<Box<Exception>>,
    pub suppress_context: bool,
}

impl Exception {
    pub fn new(kind: ExcKind, message: impl Into<String>) -> Self {
        Self::with_args(ExcClass::Builtin(kind), vec![Value::str(message)])
    }

    pub fn bare(kind: ExcKind) -> Self {
        Self::with_args(ExcClass::Builtin(kind), Vec::new())
    }

    pub fn with_args(class: ExcClass, args: Vec<Value>) -> Self {
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            class,
            state: Rc::new(ExceptionState {
                args: RefCell::new(args),
                ..ExceptionState::default()
            }),
            cause: None,
            context: None,
            suppress_context: false,
        }
    }

    pub fn key_error(key: Value) -> Self {
        Self::with_args(ExcClass::Builtin(ExcKind::KeyError), vec![key])
    }

    /// Identity shared by every clone of one raised exception object.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn class_name(&self) -> String {
        self.class.name()
    }

    pub fn is_instance_of(&self, kind: ExcKind) -> bool {
        self.class.builtin_root().is_subclass_of(kind)
    }

    pub fn args(&self) -> Vec<Value> {
        self.state.args.borrow().clone()
    }

    pub fn set_args(&self, args: Vec<Value>) {
        *self.state.args.borrow_mut() = args;
    }

    pub fn attribute(&self, name: &str) -> Option<Value> {
        self.state.attrs.borrow().get(name).cloned()
    }

    pub fn set_attribute(&self, name: &str, value: Value) {
        self.state.attrs.borrow_mut().insert(name.to_string(), value);
    }

    /// Text from a user `__str__`, used by the report in place of the args.
    pub fn set_display(&self, text: String) {
        *self.state.display.borrow_mut() = Some(text);
    }

    /// `str(exception)` from its args.
    pub fn message(&self) -> String {
        let args = self.state.args.borrow();
        match args.as_slice() {
            [] => String::new(),
            [single] if self.is_instance_of(ExcKind::KeyError) => single.repr(),
            [single] => single.to_string(),
            many => Value::tuple(many.to_vec()).repr(),
        }
    }

    /// The full report: cause or context chain first, then this exception.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Some(cause) = &self.cause {
            out.push_str(&cause.render());
            out.push_str("\nThe above exception was the direct cause of the following exception:\n\n");
        } else if let Some(context) = self.context.as_ref().filter(|_| !self.suppress_context) {
            out.push_str(&context.render());
            out.push_str("\nDuring handling of the above exception, another exception occurred:\n\n");
        }
        out.push_str(&self.render_line());
        out
    }

    fn render_line(&self) -> String {
        let message = match self.state.display.borrow().as_ref() {
            Some(text) => text.clone(),
            None => self.message(),
        };
        if message.is_empty() {
            format!("{}\n", self.class_name())
        } else {
            format!("{}: {}\n", self.class_name(), message)
        }
    }

    pub fn into_value(self) -> Value {
        Value::new(ValueKind::Exception(self))
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = self.message();
        if message.is_empty() {
            write!(f, "{}", self.class_name())
        } else {
            write!(f, "{}: {}", self.class_name(), message)
        }
    }
}

impl fmt::Debug for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exception")
            .field("id", &self.id)
            .field("class", &self.class_name())
            .field("args", &*self.state.args.borrow())
            .finish()
    }
}

impl std::error::Error for Exception {}

pub type PyResult<T> = std::result::Result<T, Exception>;
