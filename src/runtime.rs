use std::{
    cell::RefCell,
    io::{self, Write},
    rc::Rc,
};

use indexmap::IndexMap;
use num_traits::{Signed, ToPrimitive};
use tracing::{debug, trace};

use crate::{
    ast::{
        Argument, BinaryOp, BoolOp, CmpOp, Comprehension, ExceptHandler, Expr, ExprKind,
        FStringPart, ImportName, Literal, Parameters, Stmt, StmtKind, UnaryOp,
    },
    diagnostics::{PyEchoError, Result},
    environment::{Environment, EnvironmentRef, ScopeKind},
    exception::{ExcClass, ExcKind, Exception, PyResult},
    format, methods, ops,
    split::{self, EchoTarget},
    stdlib,
    value::{
        BoundMethod, BuiltinMethod, BuiltinType, CallArgs, Class, ClassBase, ClassCell, Dict,
        Instance, RangeValue, SetValue, SuperValue, UserFunction, Value, ValueKind,
    },
};

pub const DEFAULT_RECURSION_LIMIT: usize = 1000;
pub const DEFAULT_FILENAME: &str = "<unknown>";

/// Free stack below which evaluation moves onto a fresh segment.
pub(crate) const STACK_RED_ZONE: usize = 256 * 1024;
/// Size of each segment allocated once the red zone is reached.
pub(crate) const STACK_GROW_SIZE: usize = 4 * 1024 * 1024;

/// Knobs for one run.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Shown in syntax error reports.
    pub filename: String,
    /// Maximum depth of nested calls to user functions.
    pub recursion_limit: usize,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self {
            filename: DEFAULT_FILENAME.to_string(),
            recursion_limit: DEFAULT_RECURSION_LIMIT,
        }
    }
}

enum Flow {
    Next,
    Return(Value),
    Break,
    Continue,
}

type SliceArgs = (Option<i64>, Option<i64>, Option<i64>);

enum Collector<'a> {
    List {
        element: &'a Expr,
        items: Vec<Value>,
    },
    Dict {
        key: &'a Expr,
        value: &'a Expr,
        entries: Dict,
    },
    Set {
        element: &'a Expr,
        items: SetValue,
    },
}

/// A running user function, as seen by zero-argument `super()`.
struct Frame {
    class_cell: Option<ClassCell>,
    receiver: Option<Value>,
}

pub struct Interpreter {
    globals: EnvironmentRef,
    env: EnvironmentRef,
    context: ExecutionContext,
    out: Box<dyn Write>,
    depth: usize,
    handling: Vec<Exception>,
    repr_stack: Vec<usize>,
    class_cells: Vec<ClassCell>,
    frames: Vec<Frame>,
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl Interpreter {
    pub fn new() -> Self {
        Self::with_output(Box::new(io::stdout()))
    }

    pub fn with_output(out: Box<dyn Write>) -> Self {
        Self::with_context(ExecutionContext::default(), out)
    }

    pub fn with_context(context: ExecutionContext, out: Box<dyn Write>) -> Self {
        let builtins = Environment::new(ScopeKind::Builtins);
        stdlib::install(&builtins);
        let globals = Environment::with_parent(builtins, ScopeKind::Module);
        Self {
            env: Rc::clone(&globals),
            globals,
            context,
            out,
            depth: 0,
            handling: Vec::new(),
            repr_stack: Vec::new(),
            class_cells: Vec::new(),
            frames: Vec::new(),
        }
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    /// Snapshot of the module namespace.
    pub fn namespace(&self) -> IndexMap<String, Value> {
        self.globals.borrow().bindings().clone()
    }

    pub fn global(&self, name: &str) -> Option<Value> {
        self.globals.borrow().bindings().get(name).cloned()
    }

    /// Split, execute and echo one program. Output is flushed whatever the
    /// outcome.
    pub fn run_source(&mut self, source: &str) -> Result<()> {
        let result = self.run_split(source);
        self.out.flush().ok();
        result
    }

    fn run_split(&mut self, source: &str) -> Result<()> {
        let split = split::split_source(source).map_err(|diagnostic| PyEchoError::Syntax {
            diagnostic,
            text: source.to_string(),
            filename: self.context.filename.clone(),
        })?;
        debug!(
            statements = split.body.len(),
            echo = ?split.echo.as_ref().map(|target| target.origin),
            "split program"
        );
        let outcome = self
            .execute(&split.body)
            .and_then(|()| self.echo(split.echo.as_ref()));
        if let Err(exception) = &outcome {
            self.resolve_displays(exception);
        }
        Ok(outcome?)
    }

    /// Runs user `__str__` methods along the chain so the report shows
    /// their text.
    fn resolve_displays(&mut self, exception: &Exception) {
        let mut pending = vec![exception];
        while let Some(current) = pending.pop() {
            if let ExcClass::User(class) = &current.class {
                if let Some(method) = class.lookup("__str__") {
                    let receiver = current.clone().into_value();
                    let text = self
                        .text_method(method, &receiver, "__str__")
                        .unwrap_or_else(|_| "<exception str() failed>".to_string());
                    current.set_display(text);
                }
            }
            pending.extend(current.cause.as_deref());
            pending.extend(current.context.as_deref());
        }
    }

    pub fn execute(&mut self, body: &[Stmt]) -> PyResult<()> {
        self.execute_block(body).map(|_| ())
    }

    /// Evaluate the echo target and print its `str()` unless it is `None`.
    pub fn echo(&mut self, target: Option<&EchoTarget>) -> PyResult<()> {
        let Some(target) = target else {
            return Ok(());
        };
        let value = self.evaluate(&target.expr)?;
        if value.is_none() {
            return Ok(());
        }
        let text = self.str_value(&value)?;
        self.write_output(&format!("{text}\n"))
    }

    pub fn write_output(&mut self, text: &str) -> PyResult<()> {
        self.out
            .write_all(text.as_bytes())
            .map_err(|err| Exception::new(ExcKind::OSError, err.to_string()))
    }

    pub fn flush_output(&mut self) -> PyResult<()> {
        self.out
            .flush()
            .map_err(|err| Exception::new(ExcKind::OSError, err.to_string()))
    }

    fn in_scope<T>(&mut self, scope: EnvironmentRef, run: impl FnOnce(&mut Self) -> T) -> T {
        let previous = std::mem::replace(&mut self.env, scope);
        let result = run(self);
        self.env = previous;
        result
    }

    fn execute_block(&mut self, body: &[Stmt]) -> PyResult<Flow> {
        for stmt in body {
            let flow = self.execute_statement(stmt)?;
            if !matches!(flow, Flow::Next) {
                return Ok(flow);
            }
        }
        Ok(Flow::Next)
    }

    fn execute_statement(&mut self, stmt: &Stmt) -> PyResult<Flow> {
        stacker::maybe_grow(STACK_RED_ZONE, STACK_GROW_SIZE, || self.run_statement(stmt))
    }

    fn run_statement(&mut self, stmt: &Stmt) -> PyResult<Flow> {
        trace!(kind = ?stmt.statement_kind(), offset = stmt.span.start, "execute");
        match &stmt.kind {
            StmtKind::Expr(expr) => {
                self.evaluate(expr)?;
            }
            StmtKind::Assign { targets, value } => {
                let value = self.evaluate(value)?;
                for target in targets {
                    self.assign_target(target, value.clone())?;
                }
            }
            StmtKind::AnnAssign { target, value, .. } => {
                if let Some(value) = value {
                    let value = self.evaluate(value)?;
                    self.assign_target(target, value)?;
                }
            }
            StmtKind::AugAssign { target, op, value } => self.augmented_assign(target, *op, value)?,
            StmtKind::Pass => {}
            StmtKind::Break => return Ok(Flow::Break),
            StmtKind::Continue => return Ok(Flow::Continue),
            StmtKind::Return(value) => {
                let value = match value {
                    Some(expr) => self.evaluate(expr)?,
                    None => Value::none(),
                };
                return Ok(Flow::Return(value));
            }
            StmtKind::Raise { exception, cause } => {
                return Err(self.raise(exception.as_ref(), cause.as_ref())?);
            }
            StmtKind::Global(names) => {
                let mut env = self.env.borrow_mut();
                for name in names {
                    env.declare_global(name);
                }
            }
            StmtKind::Nonlocal(names) => {
                for name in names {
                    if !Environment::has_enclosing_binding(&self.env, name) {
                        return Err(Exception::new(
                            ExcKind::SyntaxError,
                            format!("no binding for nonlocal '{name}' found"),
                        ));
                    }
                    self.env.borrow_mut().declare_nonlocal(name);
                }
            }
            StmtKind::Delete(targets) => {
                for target in targets {
                    self.delete_target(target)?;
                }
            }
            StmtKind::Assert { test, message } => {
                let condition = self.evaluate(test)?;
                if !self.truthy(&condition)? {
                    let args = match message {
                        Some(message) => vec![self.evaluate(message)?],
                        None => Vec::new(),
                    };
                    return Err(Exception::with_args(
                        ExcClass::Builtin(ExcKind::AssertionError),
                        args,
                    ));
                }
            }
            StmtKind::Import(names) => self.import(names)?,
            StmtKind::ImportFrom { module, names } => self.import_from(module, names.as_deref())?,
            StmtKind::If { test, body, orelse } => {
                let condition = self.evaluate(test)?;
                return if self.truthy(&condition)? {
                    self.execute_block(body)
                } else {
                    self.execute_block(orelse)
                };
            }
            StmtKind::While { test, body, orelse } => {
                loop {
                    let condition = self.evaluate(test)?;
                    if !self.truthy(&condition)? {
                        break;
                    }
                    match self.execute_block(body)? {
                        Flow::Break => return Ok(Flow::Next),
                        Flow::Next | Flow::Continue => {}
                        flow @ Flow::Return(_) => return Ok(flow),
                    }
                }
                return self.execute_block(orelse);
            }
            StmtKind::For {
                target,
                iter,
                body,
                orelse,
            } => {
                let iterable = self.evaluate(iter)?;
                for item in self.iterate(&iterable)? {
                    self.assign_target(target, item)?;
                    match self.execute_block(body)? {
                        Flow::Break => return Ok(Flow::Next),
                        Flow::Next | Flow::Continue => {}
                        flow @ Flow::Return(_) => return Ok(flow),
                    }
                }
                return self.execute_block(orelse);
            }
            StmtKind::FunctionDef { name, params, body } => {
                let function = self.make_function(name.clone(), params, body)?;
                self.bind_name(name, function)?;
            }
            StmtKind::ClassDef { name, bases, body } => {
                let class = self.define_class(name, bases, body)?;
                self.bind_name(name, class)?;
            }
            StmtKind::Try {
                body,
                handlers,
                orelse,
                finalbody,
            } => return self.execute_try(body, handlers, orelse, finalbody),
        }
        Ok(Flow::Next)
    }

    fn execute_try(
        &mut self,
        body: &[Stmt],
        handlers: &[ExceptHandler],
        orelse: &[Stmt],
        finalbody: &[Stmt],
    ) -> PyResult<Flow> {
        let outcome = match self.execute_block(body) {
            Ok(Flow::Next) => self.execute_block(orelse),
            Ok(flow) => Ok(flow),
            Err(exception) => self.handle_exception(exception, handlers),
        };
        if finalbody.is_empty() {
            return outcome;
        }
        match self.execute_block(finalbody) {
            Ok(Flow::Next) => outcome,
            // A jump out of `finally` discards whatever was pending.
            Ok(flow) => Ok(flow),
            Err(mut exception) => {
                if let Err(pending) = outcome {
                    attach_context(&mut exception, pending);
                }
                Err(exception)
            }
        }
    }

    fn handle_exception(
        &mut self,
        exception: Exception,
        handlers: &[ExceptHandler],
    ) -> PyResult<Flow> {
        for handler in handlers {
            let matched = match &handler.class {
                None => true,
                Some(expr) => {
                    let class = self.evaluate(expr).map_err(|mut err| {
                        attach_context(&mut err, exception.clone());
                        err
                    })?;
                    exception_matches(&exception, &class)?
                }
            };
            if !matched {
                continue;
            }
            trace!(exception = %exception.class_name(), "handled");
            if let Some(name) = &handler.name {
                self.bind_name(name, exception.clone().into_value())?;
            }
            self.handling.push(exception.clone());
            let outcome = self.execute_block(&handler.body);
            self.handling.pop();
            if let Some(name) = &handler.name {
                self.unbind_name(name);
            }
            return outcome.map_err(|mut err| {
                attach_context(&mut err, exception);
                err
            });
        }
        Err(exception)
    }

    /// Builds the exception a `raise` statement throws.
    fn raise(&mut self, exception: Option<&Expr>, cause: Option<&Expr>) -> PyResult<Exception> {
        let Some(expr) = exception else {
            return Ok(self.handling.last().cloned().unwrap_or_else(|| {
                Exception::new(ExcKind::RuntimeError, "No active exception to reraise")
            }));
        };
        let value = self.evaluate(expr)?;
        let mut raised = self.exception_from(&value)?;
        if let Some(cause) = cause {
            let cause = self.evaluate(cause)?;
            raised.cause = if cause.is_none() {
                None
            } else {
                Some(Box::new(self.exception_from(&cause)?))
            };
            raised.suppress_context = true;
        }
        Ok(raised)
    }

    fn exception_from(&mut self, value: &Value) -> PyResult<Exception> {
        match value.kind() {
            ValueKind::Exception(exception) => Ok(exception.clone()),
            ValueKind::Type(BuiltinType::Exception(kind)) => Ok(Exception::bare(*kind)),
            ValueKind::Class(class) if class.exception_root().is_some() => {
                let instance = self.instantiate(class, CallArgs::default())?;
                match instance.kind() {
                    ValueKind::Exception(exception) => Ok(exception.clone()),
                    _ => Err(not_an_exception()),
                }
            }
            _ => Err(not_an_exception()),
        }
    }

    fn define_class(&mut self, name: &str, bases: &[Expr], body: &[Stmt]) -> PyResult<Value> {
        let base = match bases {
            [] => None,
            [base] => {
                let base = self.evaluate(base)?;
                class_base(&base)?
            }
            _ => {
                return Err(Exception::new(
                    ExcKind::TypeError,
                    "multiple inheritance is not supported",
                ));
            }
        };
        let scope = Environment::with_parent(self.closure_env(), ScopeKind::Class);
        let cell = ClassCell::default();
        self.class_cells.push(Rc::clone(&cell));
        let outcome = self.in_scope(Rc::clone(&scope), |interp| interp.execute_block(body));
        self.class_cells.pop();
        outcome?;
        let attrs = scope.borrow().bindings().clone();
        let class = Rc::new(Class {
            name: name.to_string(),
            base,
            attrs: RefCell::new(attrs),
        });
        *cell.borrow_mut() = Some(Rc::downgrade(&class));
        Ok(Value::new(ValueKind::Class(class)))
    }

    fn make_function(
        &mut self,
        name: String,
        params: &Rc<Parameters>,
        body: &Rc<Vec<Stmt>>,
    ) -> PyResult<Value> {
        let defaults = params
            .params
            .iter()
            .map(|param| {
                param
                    .default
                    .as_ref()
                    .map(|expr| self.evaluate(expr))
                    .transpose()
            })
            .collect::<PyResult<Vec<_>>>()?;
        let class_cell = if self.env.borrow().kind() == ScopeKind::Class {
            self.class_cells.last().cloned()
        } else {
            None
        };
        Ok(Value::new(ValueKind::Function(UserFunction {
            name,
            params: Rc::clone(params),
            defaults,
            body: Rc::clone(body),
            env: self.closure_env(),
            class_cell,
        })))
    }

    /// Functions and comprehensions defined in a class body close over the
    /// scope around the class, not the class namespace.
    fn closure_env(&self) -> EnvironmentRef {
        let parent = {
            let env = self.env.borrow();
            if env.kind() == ScopeKind::Class {
                env.parent()
            } else {
                None
            }
        };
        parent.unwrap_or_else(|| Rc::clone(&self.env))
    }

    fn import(&mut self, names: &[ImportName]) -> PyResult<()> {
        for ImportName { path, alias } in names {
            let module_name = path.join(".");
            let module = load_module(&module_name)?;
            if let Some(binding) = alias.as_ref().or(path.first()) {
                self.bind_name(binding, module)?;
            }
        }
        Ok(())
    }

    fn import_from(&mut self, path: &[String], names: Option<&[ImportName]>) -> PyResult<()> {
        let module_name = path.join(".");
        let module = load_module(&module_name)?;
        let ValueKind::Module(module) = module.kind() else {
            return Ok(());
        };
        let Some(names) = names else {
            for (name, value) in &module.attrs {
                self.bind_name(name, value.clone())?;
            }
            return Ok(());
        };
        for ImportName { path, alias } in names {
            let name = path.join(".");
            let value = module.attrs.get(&name).cloned().ok_or_else(|| {
                Exception::new(
                    ExcKind::ImportError,
                    format!("cannot import name '{name}' from '{module_name}' (unknown location)"),
                )
            })?;
            self.bind_name(alias.as_deref().unwrap_or(&name), value)?;
        }
        Ok(())
    }

    pub fn lookup_name(&self, name: &str) -> PyResult<Value> {
        let global = self.env.borrow().is_global(name);
        let found = if global {
            Environment::lookup(&self.globals, name)
        } else {
            Environment::lookup(&self.env, name)
        };
        found.ok_or_else(|| {
            Exception::new(ExcKind::NameError, format!("name '{name}' is not defined"))
        })
    }

    pub fn bind_name(&mut self, name: &str, value: Value) -> PyResult<()> {
        let (global, nonlocal) = {
            let env = self.env.borrow();
            (env.is_global(name), env.is_nonlocal(name))
        };
        if global {
            self.globals.borrow_mut().define(name, value);
        } else if nonlocal {
            if !Environment::assign_nonlocal(&self.env, name, value) {
                return Err(Exception::new(
                    ExcKind::SyntaxError,
                    format!("no binding for nonlocal '{name}' found"),
                ));
            }
        } else {
            self.env.borrow_mut().define(name, value);
        }
        Ok(())
    }

    fn unbind_name(&mut self, name: &str) -> Option<Value> {
        let global = self.env.borrow().is_global(name);
        if global {
            self.globals.borrow_mut().remove(name)
        } else {
            self.env.borrow_mut().remove(name)
        }
    }

    pub fn assign_target(&mut self, target: &Expr, value: Value) -> PyResult<()> {
        match &target.kind {
            ExprKind::Name(name) => self.bind_name(name, value),
            ExprKind::Attribute { target, name } => {
                let object = self.evaluate(target)?;
                self.set_attribute(&object, name, value)
            }
            ExprKind::Subscript { target, index } => {
                let object = self.evaluate(target)?;
                if let ExprKind::Slice { lower, upper, step } = &index.kind {
                    let bounds = self.slice_args(lower, upper, step)?;
                    return self.assign_slice(&object, bounds, value);
                }
                let key = self.evaluate(index)?;
                self.set_item(&object, key, value)
            }
            ExprKind::Tuple(targets) | ExprKind::List(targets) => {
                let values = self.iterate(&value)?;
                if values.len() > targets.len() {
                    return Err(Exception::new(
                        ExcKind::ValueError,
                        format!("too many values to unpack (expected {})", targets.len()),
                    ));
                }
                if values.len() < targets.len() {
                    return Err(Exception::new(
                        ExcKind::ValueError,
                        format!(
                            "not enough values to unpack (expected {}, got {})",
                            targets.len(),
                            values.len()
                        ),
                    ));
                }
                for (target, value) in targets.iter().zip(values) {
                    self.assign_target(target, value)?;
                }
                Ok(())
            }
            _ => Err(Exception::new(
                ExcKind::SyntaxError,
                "cannot assign to expression",
            )),
        }
    }

    fn augmented_assign(&mut self, target: &Expr, op: BinaryOp, value: &Expr) -> PyResult<()> {
        match &target.kind {
            ExprKind::Name(name) => {
                let current = self.lookup_name(name)?;
                let rhs = self.evaluate(value)?;
                let result = self.inplace(op, current, &rhs)?;
                self.bind_name(name, result)
            }
            ExprKind::Attribute { target, name } => {
                let object = self.evaluate(target)?;
                let current = self.get_attribute(&object, name)?;
                let rhs = self.evaluate(value)?;
                let result = self.inplace(op, current, &rhs)?;
                self.set_attribute(&object, name, result)
            }
            ExprKind::Subscript { target, index } => {
                let object = self.evaluate(target)?;
                let key = self.evaluate(index)?;
                let current = self.get_item(&object, &key)?;
                let rhs = self.evaluate(value)?;
                let result = self.inplace(op, current, &rhs)?;
                self.set_item(&object, key, result)
            }
            _ => Err(Exception::new(
                ExcKind::SyntaxError,
                "illegal expression for augmented assignment",
            )),
        }
    }

    /// `list += iterable` extends in place so aliases observe the change.
    fn inplace(&mut self, op: BinaryOp, current: Value, rhs: &Value) -> PyResult<Value> {
        if let (BinaryOp::Add, ValueKind::List(items)) = (op, current.kind()) {
            let extra = self.iterate(rhs)?;
            items.borrow_mut().extend(extra);
            return Ok(current);
        }
        self.binary_op(op, &current, rhs)
    }

    fn delete_target(&mut self, target: &Expr) -> PyResult<()> {
        match &target.kind {
            ExprKind::Name(name) => match self.unbind_name(name) {
                Some(_) => Ok(()),
                None => Err(Exception::new(
                    ExcKind::NameError,
                    format!("name '{name}' is not defined"),
                )),
            },
            ExprKind::Attribute { target, name } => {
                let object = self.evaluate(target)?;
                let removed = match object.kind() {
                    ValueKind::Instance(instance) => instance.attrs.borrow_mut().shift_remove(name),
                    ValueKind::Class(class) => class.attrs.borrow_mut().shift_remove(name),
                    _ => None,
                };
                match removed {
                    Some(_) => Ok(()),
                    None => Err(no_attribute(&object, name)),
                }
            }
            ExprKind::Subscript { target, index } => {
                let object = self.evaluate(target)?;
                if let ExprKind::Slice { lower, upper, step } = &index.kind {
                    let (lower, upper, step) = self.slice_args(lower, upper, step)?;
                    let ValueKind::List(items) = object.kind() else {
                        return Err(no_item_deletion(&object));
                    };
                    let mut items = items.borrow_mut();
                    let (start, stop, step) = slice_bounds(items.len() as i64, lower, upper, step)?;
                    let mut positions = slice_positions(start, stop, step);
                    positions.sort_unstable_by(|a, b| b.cmp(a));
                    for position in positions {
                        items.remove(position);
                    }
                    return Ok(());
                }
                let key = self.evaluate(index)?;
                match object.kind() {
                    ValueKind::List(items) => {
                        let len = items.borrow().len();
                        let idx = sequence_index(&key, len, "list assignment")?;
                        items.borrow_mut().remove(idx);
                        Ok(())
                    }
                    ValueKind::Dict(dict) => {
                        let removed = dict.borrow_mut().remove(&key)?;
                        match removed {
                            Some(_) => Ok(()),
                            None => Err(Exception::key_error(key)),
                        }
                    }
                    _ => Err(no_item_deletion(&object)),
                }
            }
            ExprKind::Tuple(targets) | ExprKind::List(targets) => {
                for target in targets {
                    self.delete_target(target)?;
                }
                Ok(())
            }
            _ => Err(Exception::new(
                ExcKind::SyntaxError,
                "cannot delete expression",
            )),
        }
    }

    pub fn evaluate(&mut self, expr: &Expr) -> PyResult<Value> {
        stacker::maybe_grow(STACK_RED_ZONE, STACK_GROW_SIZE, || self.evaluate_expr(expr))
    }

    fn evaluate_expr(&mut self, expr: &Expr) -> PyResult<Value> {
        match &expr.kind {
            ExprKind::Literal(literal) => Ok(match literal {
                Literal::Int(n) => Value::int(*n),
                Literal::BigInt(n) => Value::from_bigint(n.clone()),
                Literal::Float(f) => Value::float(*f),
                Literal::Bool(b) => Value::bool(*b),
                Literal::Str(s) => Value::str(s.clone()),
                Literal::None => Value::none(),
            }),
            ExprKind::Name(name) => self.lookup_name(name),
            ExprKind::FString(parts) => {
                let mut out = String::new();
                for part in parts {
                    match part {
                        FStringPart::Literal(text) => out.push_str(text),
                        FStringPart::Field {
                            expr,
                            conversion,
                            spec,
                        } => {
                            let value = self.evaluate(expr)?;
                            out.push_str(&self.format_field(&value, *conversion, spec.as_deref())?);
                        }
                    }
                }
                Ok(Value::str(out))
            }
            ExprKind::Tuple(items) => Ok(Value::tuple(self.evaluate_all(items)?)),
            ExprKind::List(items) => Ok(Value::list(self.evaluate_all(items)?)),
            ExprKind::Dict(entries) => {
                let mut dict = Dict::new();
                for (key, value) in entries {
                    let key = self.evaluate(key)?;
                    let value = self.evaluate(value)?;
                    dict.insert(key, value)?;
                }
                Ok(Value::dict(dict))
            }
            ExprKind::Set(items) => {
                let items = self.evaluate_all(items)?;
                Ok(Value::set(SetValue::from_values(items)?))
            }
            ExprKind::SetComp {
                element,
                generators,
            } => {
                let collector = Collector::Set {
                    element,
                    items: SetValue::new(),
                };
                self.comprehension(generators, collector)
            }
            ExprKind::ListComp {
                element,
                generators,
            } => {
                let collector = Collector::List {
                    element,
                    items: Vec::new(),
                };
                self.comprehension(generators, collector)
            }
            ExprKind::DictComp {
                key,
                value,
                generators,
            } => {
                let collector = Collector::Dict {
                    key,
                    value,
                    entries: Dict::new(),
                };
                self.comprehension(generators, collector)
            }
            ExprKind::Binary { op, left, right } => {
                let left = self.evaluate(left)?;
                let right = self.evaluate(right)?;
                self.binary_op(*op, &left, &right)
            }
            ExprKind::Unary { op, operand } => {
                let operand = self.evaluate(operand)?;
                match op {
                    UnaryOp::Not => Ok(Value::bool(!self.truthy(&operand)?)),
                    UnaryOp::Neg => match instance_method(&operand, "__neg__") {
                        Some(method) => self.call_bound(method, &operand, CallArgs::default()),
                        None => ops::unary(*op, &operand),
                    },
                    _ => ops::unary(*op, &operand),
                }
            }
            ExprKind::BoolOp { op, values } => {
                let mut result = Value::none();
                for value in values {
                    result = self.evaluate(value)?;
                    let truthy = self.truthy(&result)?;
                    let settled = match op {
                        BoolOp::And => !truthy,
                        BoolOp::Or => truthy,
                    };
                    if settled {
                        break;
                    }
                }
                Ok(result)
            }
            ExprKind::Compare { left, comparisons } => {
                let mut current = self.evaluate(left)?;
                for (op, right) in comparisons {
                    let right = self.evaluate(right)?;
                    if !self.compare(*op, &current, &right)? {
                        return Ok(Value::bool(false));
                    }
                    current = right;
                }
                Ok(Value::bool(true))
            }
            ExprKind::Call { callee, args } => {
                let callee = self.evaluate(callee)?;
                let args = self.evaluate_args(args)?;
                self.call_value(&callee, args)
            }
            ExprKind::Attribute { target, name } => {
                let object = self.evaluate(target)?;
                self.get_attribute(&object, name)
            }
            ExprKind::Subscript { target, index } => {
                let object = self.evaluate(target)?;
                if let ExprKind::Slice { lower, upper, step } = &index.kind {
                    let bounds = self.slice_args(lower, upper, step)?;
                    return get_slice(&object, bounds);
                }
                let key = self.evaluate(index)?;
                self.get_item(&object, &key)
            }
            ExprKind::Slice { .. } => Err(Exception::new(ExcKind::SyntaxError, "invalid syntax")),
            ExprKind::IfExp { test, body, orelse } => {
                let condition = self.evaluate(test)?;
                if self.truthy(&condition)? {
                    self.evaluate(body)
                } else {
                    self.evaluate(orelse)
                }
            }
            ExprKind::Lambda { params, body } => {
                self.make_function("<lambda>".to_string(), params, body)
            }
        }
    }

    fn evaluate_all(&mut self, exprs: &[Expr]) -> PyResult<Vec<Value>> {
        exprs.iter().map(|expr| self.evaluate(expr)).collect()
    }

    fn evaluate_args(&mut self, args: &[Argument]) -> PyResult<CallArgs> {
        let mut call = CallArgs::default();
        for arg in args {
            match arg {
                Argument::Positional(expr) => call.positional.push(self.evaluate(expr)?),
                Argument::Keyword(name, expr) => {
                    let value = self.evaluate(expr)?;
                    call.keywords.push((name.clone(), value));
                }
                Argument::Unpack(expr) => {
                    let value = self.evaluate(expr)?;
                    call.positional.extend(self.iterate(&value)?);
                }
                Argument::UnpackMapping(expr) => {
                    let value = self.evaluate(expr)?;
                    let ValueKind::Dict(dict) = value.kind() else {
                        return Err(Exception::new(
                            ExcKind::TypeError,
                            format!("argument after ** must be a mapping, not {}", value.type_name()),
                        ));
                    };
                    for (key, value) in dict.borrow().items() {
                        let Some(name) = key.as_str() else {
                            return Err(Exception::new(ExcKind::TypeError, "keywords must be strings"));
                        };
                        call.keywords.push((name.to_string(), value));
                    }
                }
            }
        }
        Ok(call)
    }

    fn slice_args(
        &mut self,
        lower: &Option<Box<Expr>>,
        upper: &Option<Box<Expr>>,
        step: &Option<Box<Expr>>,
    ) -> PyResult<SliceArgs> {
        Ok((
            self.slice_bound(lower.as_deref())?,
            self.slice_bound(upper.as_deref())?,
            self.slice_bound(step.as_deref())?,
        ))
    }

    fn slice_bound(&mut self, bound: Option<&Expr>) -> PyResult<Option<i64>> {
        let Some(expr) = bound else {
            return Ok(None);
        };
        let value = self.evaluate(expr)?;
        if value.is_none() {
            return Ok(None);
        }
        if let ValueKind::BigInt(big) = value.kind() {
            return Ok(Some(if big.is_negative() { i64::MIN } else { i64::MAX }));
        }
        value.as_int().map(Some).ok_or_else(|| {
            Exception::new(
                ExcKind::TypeError,
                "slice indices must be integers or None or have an __index__ method",
            )
        })
    }

    fn comprehension(
        &mut self,
        generators: &[Comprehension],
        mut collector: Collector<'_>,
    ) -> PyResult<Value> {
        let Some(first) = generators.first() else {
            return Ok(Value::none());
        };
        // The outermost iterable is evaluated in the enclosing scope.
        let iterable = self.evaluate(&first.iter)?;
        let scope = Environment::with_parent(self.closure_env(), ScopeKind::Comprehension);
        self.in_scope(scope, |interp| {
            interp.run_generators(generators, Some(iterable), &mut collector)
        })?;
        Ok(match collector {
            Collector::List { items, .. } => Value::list(items),
            Collector::Dict { entries, .. } => Value::dict(entries),
            Collector::Set { items, .. } => Value::set(items),
        })
    }

    fn run_generators(
        &mut self,
        generators: &[Comprehension],
        iterable: Option<Value>,
        collector: &mut Collector<'_>,
    ) -> PyResult<()> {
        let Some((generator, rest)) = generators.split_first() else {
            match collector {
                Collector::List { element, items } => items.push(self.evaluate(element)?),
                Collector::Dict {
                    key,
                    value,
                    entries,
                } => {
                    let key = self.evaluate(key)?;
                    let value = self.evaluate(value)?;
                    entries.insert(key, value)?;
                }
                Collector::Set { element, items } => {
                    items.insert(self.evaluate(element)?)?;
                }
            }
            return Ok(());
        };
        let iterable = match iterable {
            Some(iterable) => iterable,
            None => self.evaluate(&generator.iter)?,
        };
        'items: for item in self.iterate(&iterable)? {
            self.assign_target(&generator.target, item)?;
            for condition in &generator.conditions {
                let keep = self.evaluate(condition)?;
                if !self.truthy(&keep)? {
                    continue 'items;
                }
            }
            self.run_generators(rest, None, collector)?;
        }
        Ok(())
    }

    pub fn binary_op(&mut self, op: BinaryOp, left: &Value, right: &Value) -> PyResult<Value> {
        let (method, reflected) = operator_methods(op);
        if let Some(method) = instance_method(left, method) {
            return self.call_bound(method, left, CallArgs::positional(vec![right.clone()]));
        }
        if let Some(method) = instance_method(right, reflected) {
            return self.call_bound(method, right, CallArgs::positional(vec![left.clone()]));
        }
        ops::binary(op, left, right)
    }

    pub fn compare(&mut self, op: CmpOp, left: &Value, right: &Value) -> PyResult<bool> {
        let method = match op {
            CmpOp::Eq => Some("__eq__"),
            CmpOp::NotEq => Some("__ne__"),
            CmpOp::Lt => Some("__lt__"),
            CmpOp::LtE => Some("__le__"),
            CmpOp::Gt => Some("__gt__"),
            CmpOp::GtE => Some("__ge__"),
            _ => None,
        };
        if let Some(method) = method.and_then(|name| instance_method(left, name)) {
            let result = self.call_bound(method, left, CallArgs::positional(vec![right.clone()]))?;
            return self.truthy(&result);
        }
        if op == CmpOp::NotEq {
            if let Some(method) = instance_method(left, "__eq__") {
                let result =
                    self.call_bound(method, left, CallArgs::positional(vec![right.clone()]))?;
                return Ok(!self.truthy(&result)?);
            }
        }
        if matches!(op, CmpOp::In | CmpOp::NotIn) {
            if let Some(method) = instance_method(right, "__contains__") {
                let result =
                    self.call_bound(method, right, CallArgs::positional(vec![left.clone()]))?;
                let found = self.truthy(&result)?;
                return Ok(if op == CmpOp::In { found } else { !found });
            }
        }
        ops::compare(op, left, right)
    }

    /// Truthiness, consulting `__bool__` and `__len__` on instances.
    pub fn truthy(&mut self, value: &Value) -> PyResult<bool> {
        if let Some(method) = instance_method(value, "__bool__") {
            let result = self.call_bound(method, value, CallArgs::default())?;
            return Ok(result.is_truthy());
        }
        if let Some(method) = instance_method(value, "__len__") {
            let result = self.call_bound(method, value, CallArgs::default())?;
            return Ok(result.as_int().unwrap_or(0) != 0);
        }
        Ok(value.is_truthy())
    }

    pub fn length(&mut self, value: &Value) -> PyResult<usize> {
        let len = match value.kind() {
            ValueKind::Str(text) => text.chars().count(),
            ValueKind::List(items) => items.borrow().len(),
            ValueKind::Tuple(items) => items.len(),
            ValueKind::Dict(dict) => dict.borrow().len(),
            ValueKind::Set(set) => set.borrow().len(),
            ValueKind::Range(range) => range.len()?,
            ValueKind::Instance(_) => match instance_method(value, "__len__") {
                Some(method) => {
                    let result = self.call_bound(method, value, CallArgs::default())?;
                    let len = result.as_int().ok_or_else(|| {
                        Exception::new(
                            ExcKind::TypeError,
                            format!("'{}' object cannot be interpreted as an integer", result.type_name()),
                        )
                    })?;
                    usize::try_from(len).map_err(|_| {
                        Exception::new(ExcKind::ValueError, "__len__() should return >= 0")
                    })?
                }
                None => return Err(no_len(value)),
            },
            _ => return Err(no_len(value)),
        };
        Ok(len)
    }

    /// Materializes any iterable into its items.
    pub fn iterate(&mut self, value: &Value) -> PyResult<Vec<Value>> {
        let items = match value.kind() {
            ValueKind::List(items) => items.borrow().clone(),
            ValueKind::Tuple(items) => items.clone(),
            ValueKind::Str(text) => text.chars().map(|ch| Value::str(ch.to_string())).collect(),
            ValueKind::Dict(dict) => dict.borrow().keys(),
            ValueKind::Set(set) => set.borrow().values(),
            ValueKind::Range(range) => range.values().map(Value::int).collect(),
            _ => {
                return Err(Exception::new(
                    ExcKind::TypeError,
                    format!("'{}' object is not iterable", value.type_name()),
                ));
            }
        };
        Ok(items)
    }

    pub fn call_value(&mut self, callee: &Value, args: CallArgs) -> PyResult<Value> {
        match callee.kind() {
            ValueKind::NativeFunction(function) => function.call(self, args),
            ValueKind::Function(function) => self.call_function(function, args),
            ValueKind::BoundMethod(method) => {
                let mut args = args;
                args.positional.insert(0, method.receiver.clone());
                self.call_function(&method.function, args)
            }
            ValueKind::BuiltinMethod(method) => {
                methods::call_method(self, &method.receiver, method.name, args)
            }
            ValueKind::Class(class) => self.instantiate(class, args),
            ValueKind::Type(ty) => stdlib::construct(self, *ty, args),
            ValueKind::Instance(_) => match instance_method(callee, "__call__") {
                Some(method) => self.call_bound(method, callee, args),
                None => Err(not_callable(callee)),
            },
            _ => Err(not_callable(callee)),
        }
    }

    pub fn call_function(&mut self, function: &UserFunction, args: CallArgs) -> PyResult<Value> {
        if self.depth >= self.context.recursion_limit {
            return Err(Exception::new(
                ExcKind::RecursionError,
                "maximum recursion depth exceeded",
            ));
        }
        let frame = Frame {
            class_cell: function.class_cell.clone(),
            receiver: function
                .class_cell
                .as_ref()
                .and_then(|_| args.positional.first().cloned()),
        };
        let scope = bind_arguments(function, args)?;
        trace!(function = %function.name, depth = self.depth, "call");
        self.depth += 1;
        self.frames.push(frame);
        let body = Rc::clone(&function.body);
        let outcome = self.in_scope(scope, |interp| interp.execute_block(&body));
        self.frames.pop();
        self.depth -= 1;
        match outcome? {
            Flow::Return(value) => Ok(value),
            _ => Ok(Value::none()),
        }
    }

    fn call_bound(&mut self, method: Value, receiver: &Value, args: CallArgs) -> PyResult<Value> {
        let bound = bind_method(method, receiver);
        self.call_value(&bound, args)
    }

    /// `super()` with no arguments reads the running method's class and
    /// first argument. `super(Class, obj)` names both.
    pub fn super_object(&self, args: CallArgs) -> PyResult<Value> {
        args.no_keywords("super")?;
        let (class, receiver) = match args.positional.as_slice() {
            [] => {
                let frame = self.frames.last().ok_or_else(|| {
                    Exception::new(ExcKind::RuntimeError, "super(): no arguments")
                })?;
                let class = frame
                    .class_cell
                    .as_ref()
                    .and_then(|cell| {
                        let class = cell.borrow().as_ref().and_then(|class| class.upgrade());
                        class
                    })
                    .ok_or_else(|| {
                        Exception::new(ExcKind::RuntimeError, "super(): __class__ cell not found")
                    })?;
                let receiver = frame.receiver.clone().ok_or_else(|| {
                    Exception::new(ExcKind::RuntimeError, "super(): no arguments")
                })?;
                (class, receiver)
            }
            [class, receiver] => match class.kind() {
                ValueKind::Class(class) => (Rc::clone(class), receiver.clone()),
                _ => {
                    return Err(Exception::new(
                        ExcKind::TypeError,
                        format!("super() argument 1 must be a type, not {}", class.type_name()),
                    ));
                }
            },
            _ => {
                return Err(Exception::new(
                    ExcKind::TypeError,
                    format!("super() takes 0 or 2 arguments ({} given)", args.len()),
                ));
            }
        };
        let related = match receiver.kind() {
            ValueKind::Instance(instance) => instance.class.is_subclass_of(&class),
            ValueKind::Exception(exception) => match &exception.class {
                ExcClass::User(raised) => raised.is_subclass_of(&class),
                ExcClass::Builtin(_) => false,
            },
            ValueKind::Class(subclass) => subclass.is_subclass_of(&class),
            _ => false,
        };
        if !related {
            return Err(Exception::new(
                ExcKind::TypeError,
                "super(type, obj): obj must be an instance or subtype of type",
            ));
        }
        Ok(Value::new(ValueKind::Super(SuperValue { class, receiver })))
    }

    fn instantiate(&mut self, class: &Rc<Class>, args: CallArgs) -> PyResult<Value> {
        if class.exception_root().is_some() {
            let exception =
                Exception::with_args(ExcClass::User(Rc::clone(class)), args.positional.clone())
                    .into_value();
            match class.lookup("__init__") {
                Some(init) => self.call_initializer(init, &exception, args)?,
                None => args.no_keywords(&class.name)?,
            }
            return Ok(exception);
        }
        let instance = Value::new(ValueKind::Instance(Instance {
            class: Rc::clone(class),
            attrs: RefCell::new(IndexMap::new()),
        }));
        match class.lookup("__init__") {
            Some(init) => self.call_initializer(init, &instance, args)?,
            None if !args.is_empty() => {
                return Err(Exception::new(
                    ExcKind::TypeError,
                    format!("{}() takes no arguments", class.name),
                ));
            }
            None => {}
        }
        Ok(instance)
    }

    fn call_initializer(&mut self, init: Value, receiver: &Value, args: CallArgs) -> PyResult<()> {
        let result = self.call_bound(init, receiver, args)?;
        if result.is_none() {
            Ok(())
        } else {
            Err(Exception::new(
                ExcKind::TypeError,
                format!("__init__() should return None, not '{}'", result.type_name()),
            ))
        }
    }

    pub fn get_attribute(&mut self, object: &Value, name: &str) -> PyResult<Value> {
        match object.kind() {
            ValueKind::Instance(instance) => {
                if let Some(value) = instance.attrs.borrow().get(name) {
                    return Ok(value.clone());
                }
                if name == "__class__" {
                    return Ok(Value::new(ValueKind::Class(Rc::clone(&instance.class))));
                }
                match instance.class.lookup(name) {
                    Some(value) => Ok(bind_method(value, object)),
                    None => builtin_method(object, name),
                }
            }
            ValueKind::Super(sup) => {
                if let Some(ClassBase::User(parent)) = &sup.class.base {
                    if let Some(value) = parent.lookup(name) {
                        return Ok(bind_method(value, &sup.receiver));
                    }
                }
                match methods::lookup(&sup.receiver, name) {
                    Some(method) => Ok(Value::new(ValueKind::BuiltinMethod(BuiltinMethod {
                        receiver: sup.receiver.clone(),
                        name: method,
                    }))),
                    None => Err(no_attribute(object, name)),
                }
            }
            ValueKind::Class(class) => {
                if name == "__name__" {
                    return Ok(Value::str(class.name.clone()));
                }
                class.lookup(name).ok_or_else(|| {
                    Exception::new(
                        ExcKind::AttributeError,
                        format!("type object '{}' has no attribute '{name}'", class.name),
                    )
                })
            }
            ValueKind::Module(module) => module.attrs.get(name).cloned().ok_or_else(|| {
                Exception::new(
                    ExcKind::AttributeError,
                    format!("module '{}' has no attribute '{name}'", module.name),
                )
            }),
            ValueKind::Exception(exception) => {
                if let Some(value) = exception.attribute(name) {
                    return Ok(value);
                }
                match name {
                    "args" => Ok(Value::tuple(exception.args())),
                    "__class__" => Ok(match &exception.class {
                        ExcClass::Builtin(kind) => {
                            Value::new(ValueKind::Type(BuiltinType::Exception(*kind)))
                        }
                        ExcClass::User(class) => Value::new(ValueKind::Class(Rc::clone(class))),
                    }),
                    "__cause__" => Ok(linked_exception(exception.cause.as_deref())),
                    "__context__" => Ok(linked_exception(exception.context.as_deref())),
                    _ => {
                        if let ExcClass::User(class) = &exception.class {
                            if let Some(value) = class.lookup(name) {
                                return Ok(bind_method(value, object));
                            }
                        }
                        builtin_method(object, name)
                    }
                }
            }
            ValueKind::Type(ty) if name == "__name__" => Ok(Value::str(ty.name())),
            ValueKind::Function(function) if name == "__name__" => {
                Ok(Value::str(function.name.clone()))
            }
            _ => builtin_method(object, name),
        }
    }

    pub fn set_attribute(&mut self, object: &Value, name: &str, value: Value) -> PyResult<()> {
        match object.kind() {
            ValueKind::Instance(instance) => {
                instance.attrs.borrow_mut().insert(name.to_string(), value);
                Ok(())
            }
            ValueKind::Class(class) => {
                class.attrs.borrow_mut().insert(name.to_string(), value);
                Ok(())
            }
            ValueKind::Exception(exception) => {
                if name == "args" {
                    exception.set_args(self.iterate(&value)?);
                } else {
                    exception.set_attribute(name, value);
                }
                Ok(())
            }
            _ if methods::lookup(object, name).is_some() => Err(Exception::new(
                ExcKind::AttributeError,
                format!("'{}' object attribute '{name}' is read-only", object.type_name()),
            )),
            _ => Err(no_attribute(object, name)),
        }
    }

    pub fn get_item(&mut self, object: &Value, key: &Value) -> PyResult<Value> {
        match object.kind() {
            ValueKind::List(items) => {
                let items = items.borrow();
                let idx = sequence_index(key, items.len(), "list")?;
                Ok(items[idx].clone())
            }
            ValueKind::Tuple(items) => {
                let idx = sequence_index(key, items.len(), "tuple")?;
                Ok(items[idx].clone())
            }
            ValueKind::Str(text) => {
                let chars: Vec<char> = text.chars().collect();
                let idx = sequence_index(key, chars.len(), "string")?;
                Ok(Value::str(chars[idx].to_string()))
            }
            ValueKind::Range(range) => {
                let Some(index) = key.as_bigint() else {
                    return Err(Exception::new(
                        ExcKind::TypeError,
                        format!("range indices must be integers or slices, not {}", key.type_name()),
                    ));
                };
                let length = range.length();
                let idx = index
                    .to_i128()
                    .map(|index| if index < 0 { index + length } else { index })
                    .filter(|idx| (0..length).contains(idx))
                    .ok_or_else(|| {
                        Exception::new(ExcKind::IndexError, "range object index out of range")
                    })?;
                Ok(Value::int(range.get(idx)))
            }
            ValueKind::Dict(dict) => {
                let found = dict.borrow().get(key)?;
                found.ok_or_else(|| Exception::key_error(key.clone()))
            }
            ValueKind::Instance(_) => match instance_method(object, "__getitem__") {
                Some(method) => {
                    self.call_bound(method, object, CallArgs::positional(vec![key.clone()]))
                }
                None => Err(not_subscriptable(object)),
            },
            _ => Err(not_subscriptable(object)),
        }
    }

    pub fn set_item(&mut self, object: &Value, key: Value, value: Value) -> PyResult<()> {
        match object.kind() {
            ValueKind::List(items) => {
                let len = items.borrow().len();
                let idx = sequence_index(&key, len, "list assignment")?;
                items.borrow_mut()[idx] = value;
                Ok(())
            }
            ValueKind::Dict(dict) => dict.borrow_mut().insert(key, value),
            ValueKind::Instance(_) => match instance_method(object, "__setitem__") {
                Some(method) => {
                    self.call_bound(method, object, CallArgs::positional(vec![key, value]))?;
                    Ok(())
                }
                None => Err(no_item_assignment(object)),
            },
            _ => Err(no_item_assignment(object)),
        }
    }

    fn assign_slice(&mut self, object: &Value, bounds: SliceArgs, value: Value) -> PyResult<()> {
        let ValueKind::List(items) = object.kind() else {
            return Err(no_item_assignment(object));
        };
        let replacement = self.iterate(&value)?;
        let mut items = items.borrow_mut();
        let (lower, upper, step) = bounds;
        let (start, stop, step) = slice_bounds(items.len() as i64, lower, upper, step)?;
        if step == 1 {
            let stop = stop.max(start);
            items.splice(start as usize..stop as usize, replacement);
            return Ok(());
        }
        let positions = slice_positions(start, stop, step);
        if positions.len() != replacement.len() {
            return Err(Exception::new(
                ExcKind::ValueError,
                format!(
                    "attempt to assign sequence of size {} to extended slice of size {}",
                    replacement.len(),
                    positions.len()
                ),
            ));
        }
        for (position, value) in positions.into_iter().zip(replacement) {
            items[position] = value;
        }
        Ok(())
    }

    /// `str()`, honoring `__str__` and falling back to `repr()`.
    pub fn str_value(&mut self, value: &Value) -> PyResult<String> {
        match value.kind() {
            ValueKind::Str(text) => Ok(text.clone()),
            ValueKind::Instance(_) => match instance_method(value, "__str__") {
                Some(method) => self.text_method(method, value, "__str__"),
                None => self.repr_value(value),
            },
            ValueKind::Exception(exception) => {
                if let ExcClass::User(class) = &exception.class {
                    if let Some(method) = class.lookup("__str__") {
                        return self.text_method(method, value, "__str__");
                    }
                }
                Ok(exception.message())
            }
            _ => self.repr_value(value),
        }
    }

    /// `repr()`, honoring `__repr__` on instances nested anywhere inside
    /// containers.
    pub fn repr_value(&mut self, value: &Value) -> PyResult<String> {
        stacker::maybe_grow(STACK_RED_ZONE, STACK_GROW_SIZE, || self.nested_repr(value))
    }

    fn nested_repr(&mut self, value: &Value) -> PyResult<String> {
        match value.kind() {
            ValueKind::List(_) | ValueKind::Dict(_) => {
                let id = value.identity();
                if self.repr_stack.contains(&id) {
                    let text = if matches!(value.kind(), ValueKind::List(_)) {
                        "[...]"
                    } else {
                        "{...}"
                    };
                    return Ok(text.to_string());
                }
                self.repr_stack.push(id);
                let text = self.container_repr(value);
                self.repr_stack.pop();
                text
            }
            ValueKind::Tuple(items) => {
                let parts = self.reprs(items)?;
                Ok(match parts.as_slice() {
                    [single] => format!("({single},)"),
                    parts => format!("({})", parts.join(", ")),
                })
            }
            ValueKind::Instance(_) => match instance_method(value, "__repr__") {
                Some(method) => self.text_method(method, value, "__repr__"),
                None => Ok(value.repr()),
            },
            ValueKind::Set(set) => {
                let items = set.borrow().values();
                if items.is_empty() {
                    return Ok("set()".to_string());
                }
                Ok(format!("{{{}}}", self.reprs(&items)?.join(", ")))
            }
            ValueKind::Exception(exception) => {
                let parts = self.reprs(&exception.args())?;
                Ok(format!("{}({})", exception.class_name(), parts.join(", ")))
            }
            _ => Ok(value.repr()),
        }
    }

    fn container_repr(&mut self, value: &Value) -> PyResult<String> {
        match value.kind() {
            ValueKind::List(items) => {
                let items = items.borrow().clone();
                Ok(format!("[{}]", self.reprs(&items)?.join(", ")))
            }
            ValueKind::Dict(dict) => {
                let entries = dict.borrow().items();
                let mut parts = Vec::with_capacity(entries.len());
                for (key, value) in &entries {
                    parts.push(format!("{}: {}", self.repr_value(key)?, self.repr_value(value)?));
                }
                Ok(format!("{{{}}}", parts.join(", ")))
            }
            _ => Ok(value.repr()),
        }
    }

    fn reprs(&mut self, values: &[Value]) -> PyResult<Vec<String>> {
        values.iter().map(|value| self.repr_value(value)).collect()
    }

    fn text_method(&mut self, method: Value, receiver: &Value, name: &str) -> PyResult<String> {
        let result = self.call_bound(method, receiver, CallArgs::default())?;
        match result.as_str() {
            Some(text) => Ok(text.to_string()),
            None => Err(Exception::new(
                ExcKind::TypeError,
                format!("{name} returned non-string (type {})", result.type_name()),
            )),
        }
    }

    /// One replacement field of an f-string or `str.format`.
    pub fn format_field(
        &mut self,
        value: &Value,
        conversion: Option<char>,
        spec: Option<&str>,
    ) -> PyResult<String> {
        let (value, text) = match conversion {
            Some('r') | Some('a') => {
                let text = self.repr_value(value)?;
                (Value::str(text.clone()), text)
            }
            Some(_) => {
                let text = self.str_value(value)?;
                (Value::str(text.clone()), text)
            }
            None => (value.clone(), self.str_value(value)?),
        };
        match spec {
            Some(spec) if !spec.is_empty() => format::apply_spec(&value, &text, spec),
            _ => Ok(text),
        }
    }
}

fn bind_arguments(function: &UserFunction, args: CallArgs) -> PyResult<EnvironmentRef> {
    let params = &function.params;
    let name = &function.name;
    let mut slots: Vec<Option<Value>> = vec![None; params.params.len()];
    let mut extra = Vec::new();
    for (idx, value) in args.positional.into_iter().enumerate() {
        match slots.get_mut(idx) {
            Some(slot) => *slot = Some(value),
            None => extra.push(value),
        }
    }
    if !extra.is_empty() && params.vararg.is_none() {
        let expected = params.params.len();
        let given = expected + extra.len();
        let required = function.defaults.iter().filter(|d| d.is_none()).count();
        let takes = if required == expected {
            format!("{expected} positional argument{}", plural(expected))
        } else {
            format!("from {required} to {expected} positional arguments")
        };
        let verb = if given == 1 { "was" } else { "were" };
        return Err(Exception::new(
            ExcKind::TypeError,
            format!("{name}() takes {takes} but {given} {verb} given"),
        ));
    }

    let mut extra_keywords = Dict::new();
    for (key, value) in args.keywords {
        match params.params.iter().position(|param| param.name == key) {
            Some(idx) => {
                if slots[idx].is_some() {
                    return Err(Exception::new(
                        ExcKind::TypeError,
                        format!("{name}() got multiple values for argument '{key}'"),
                    ));
                }
                slots[idx] = Some(value);
            }
            None if params.kwarg.is_some() => extra_keywords.insert(Value::str(key), value)?,
            None => {
                return Err(Exception::new(
                    ExcKind::TypeError,
                    format!("{name}() got an unexpected keyword argument '{key}'"),
                ));
            }
        }
    }

    let scope = Environment::with_parent(Rc::clone(&function.env), ScopeKind::Function);
    let mut missing = Vec::new();
    {
        let mut bindings = scope.borrow_mut();
        for ((param, slot), default) in params.params.iter().zip(slots).zip(&function.defaults) {
            match slot.or_else(|| default.clone()) {
                Some(value) => bindings.define(param.name.clone(), value),
                None => missing.push(format!("'{}'", param.name)),
            }
        }
        if let Some(vararg) = &params.vararg {
            bindings.define(vararg.clone(), Value::tuple(extra));
        }
        if let Some(kwarg) = &params.kwarg {
            bindings.define(kwarg.clone(), Value::dict(extra_keywords));
        }
    }
    if !missing.is_empty() {
        return Err(Exception::new(
            ExcKind::TypeError,
            format!(
                "{name}() missing {} required positional argument{}: {}",
                missing.len(),
                plural(missing.len()),
                join_names(&missing)
            ),
        ));
    }
    Ok(scope)
}

fn plural(count: usize) -> &'static str {
    if count == 1 { "" } else { "s" }
}

/// `'a'`, `'a' and 'b'`, `'a', 'b', and 'c'`.
fn join_names(names: &[String]) -> String {
    match names {
        [] => String::new(),
        [single] => single.clone(),
        [first, second] => format!("{first} and {second}"),
        [init @ .., last] => format!("{}, and {last}", init.join(", ")),
    }
}

fn bind_method(value: Value, receiver: &Value) -> Value {
    if let ValueKind::Function(function) = value.kind() {
        return Value::new(ValueKind::BoundMethod(BoundMethod {
            receiver: receiver.clone(),
            function: function.clone(),
        }));
    }
    value
}

fn instance_method(value: &Value, name: &str) -> Option<Value> {
    match value.kind() {
        ValueKind::Instance(instance) => instance.class.lookup(name),
        _ => None,
    }
}

fn operator_methods(op: BinaryOp) -> (&'static str, &'static str) {
    match op {
        BinaryOp::Add => ("__add__", "__radd__"),
        BinaryOp::Sub => ("__sub__", "__rsub__"),
        BinaryOp::Mul => ("__mul__", "__rmul__"),
        BinaryOp::Div => ("__truediv__", "__rtruediv__"),
        BinaryOp::FloorDiv => ("__floordiv__", "__rfloordiv__"),
        BinaryOp::Mod => ("__mod__", "__rmod__"),
        BinaryOp::Pow => ("__pow__", "__rpow__"),
        BinaryOp::LShift => ("__lshift__", "__rlshift__"),
        BinaryOp::RShift => ("__rshift__", "__rrshift__"),
        BinaryOp::BitAnd => ("__and__", "__rand__"),
        BinaryOp::BitOr => ("__or__", "__ror__"),
        BinaryOp::BitXor => ("__xor__", "__rxor__"),
    }
}

fn class_base(base: &Value) -> PyResult<Option<ClassBase>> {
    match base.kind() {
        ValueKind::Class(class) => Ok(Some(ClassBase::User(Rc::clone(class)))),
        ValueKind::Type(BuiltinType::Exception(kind)) => Ok(Some(ClassBase::Exception(*kind))),
        ValueKind::Type(BuiltinType::Object) => Ok(None),
        ValueKind::Type(ty) => Err(Exception::new(
            ExcKind::TypeError,
            format!("subclassing built-in type '{}' is not supported", ty.name()),
        )),
        _ => Err(Exception::new(ExcKind::TypeError, "bases must be types")),
    }
}

/// `except` clause matching with `isinstance` semantics.
fn exception_matches(exception: &Exception, class: &Value) -> PyResult<bool> {
    match class.kind() {
        ValueKind::Type(BuiltinType::Exception(kind)) => Ok(exception.is_instance_of(*kind)),
        ValueKind::Class(class) if class.exception_root().is_some() => Ok(match &exception.class {
            ExcClass::User(raised) => raised.is_subclass_of(class),
            ExcClass::Builtin(_) => false,
        }),
        ValueKind::Tuple(classes) => {
            for class in classes {
                if exception_matches(exception, class)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        _ => Err(Exception::new(
            ExcKind::TypeError,
            "catching classes that do not inherit from BaseException is not allowed",
        )),
    }
}

/// Records `handled` as the implicit context of an exception raised while
/// it was being handled. Re-raising the same object adds nothing.
fn attach_context(raised: &mut Exception, handled: Exception) {
    if raised.id() != handled.id() && raised.context.is_none() {
        raised.context = Some(Box::new(handled));
    }
}

fn load_module(name: &str) -> PyResult<Value> {
    stdlib::import_module(name).ok_or_else(|| {
        Exception::new(
            ExcKind::ModuleNotFoundError,
            format!("No module named '{name}'"),
        )
    })
}

fn sequence_index(key: &Value, len: usize, what: &str) -> PyResult<usize> {
    if let ValueKind::BigInt(_) = key.kind() {
        return Err(Exception::new(
            ExcKind::IndexError,
            "cannot fit 'int' into an index-sized integer",
        ));
    }
    let Some(index) = key.as_int() else {
        let subject = if what == "list assignment" { "list" } else { what };
        return Err(Exception::new(
            ExcKind::TypeError,
            format!("{subject} indices must be integers or slices, not {}", key.type_name()),
        ));
    };
    let len = len as i64;
    let idx = if index < 0 { index + len } else { index };
    if idx < 0 || idx >= len {
        return Err(Exception::new(
            ExcKind::IndexError,
            format!("{what} index out of range"),
        ));
    }
    Ok(idx as usize)
}

/// Clamps slice bounds against a sequence of `len` items.
fn slice_bounds(
    len: i64,
    lower: Option<i64>,
    upper: Option<i64>,
    step: Option<i64>,
) -> PyResult<(i64, i64, i64)> {
    let (start, stop, step) = clamp_slice(i128::from(len), lower, upper, step)?;
    // Clamped bounds lie in `-1..=len`.
    Ok((start as i64, stop as i64, step as i64))
}

fn clamp_slice(
    len: i128,
    lower: Option<i64>,
    upper: Option<i64>,
    step: Option<i64>,
) -> PyResult<(i128, i128, i128)> {
    let step = i128::from(step.unwrap_or(1));
    if step == 0 {
        return Err(Exception::new(ExcKind::ValueError, "slice step cannot be zero"));
    }
    let clamp = |bound: Option<i64>, default: i128| match bound.map(i128::from) {
        None => default,
        Some(bound) if bound < 0 => {
            let bound = bound + len;
            if bound < 0 {
                if step < 0 { -1 } else { 0 }
            } else {
                bound
            }
        }
        Some(bound) if bound >= len => {
            if step < 0 {
                len - 1
            } else {
                len
            }
        }
        Some(bound) => bound,
    };
    let start = clamp(lower, if step < 0 { len - 1 } else { 0 });
    let stop = clamp(upper, if step < 0 { -1 } else { len });
    Ok((start, stop, step))
}

fn slice_positions(start: i64, stop: i64, step: i64) -> Vec<usize> {
    let mut positions = Vec::new();
    let mut idx = start;
    while (step > 0 && idx < stop) || (step < 0 && idx > stop) {
        positions.push(idx as usize);
        idx += step;
    }
    positions
}

fn get_slice(object: &Value, (lower, upper, step): SliceArgs) -> PyResult<Value> {
    match object.kind() {
        ValueKind::List(items) => {
            let items = items.borrow();
            let (start, stop, step) = slice_bounds(items.len() as i64, lower, upper, step)?;
            Ok(Value::list(
                slice_positions(start, stop, step)
                    .into_iter()
                    .map(|idx| items[idx].clone())
                    .collect(),
            ))
        }
        ValueKind::Tuple(items) => {
            let (start, stop, step) = slice_bounds(items.len() as i64, lower, upper, step)?;
            Ok(Value::tuple(
                slice_positions(start, stop, step)
                    .into_iter()
                    .map(|idx| items[idx].clone())
                    .collect(),
            ))
        }
        ValueKind::Str(text) => {
            let chars: Vec<char> = text.chars().collect();
            let (start, stop, step) = slice_bounds(chars.len() as i64, lower, upper, step)?;
            Ok(Value::str(
                slice_positions(start, stop, step)
                    .into_iter()
                    .map(|idx| chars[idx])
                    .collect::<String>(),
            ))
        }
        ValueKind::Range(range) => {
            let (start, stop, step) = clamp_slice(range.length(), lower, upper, step)?;
            let origin = i128::from(range.start);
            let stride = i128::from(range.step);
            let bound = |value: i128| {
                i64::try_from(value).map_err(|_| {
                    Exception::new(ExcKind::OverflowError, "Python int too large to convert to C int64_t")
                })
            };
            Ok(Value::new(ValueKind::Range(RangeValue {
                start: bound(origin + start * stride)?,
                stop: bound(origin + stop * stride)?,
                step: bound(stride * step)?,
            })))
        }
        _ => Err(not_subscriptable(object)),
    }
}

fn linked_exception(exception: Option<&Exception>) -> Value {
    match exception {
        Some(exception) => exception.clone().into_value(),
        None => Value::none(),
    }
}

/// A method of a built-in type, or of `object` for instances.
fn builtin_method(object: &Value, name: &str) -> PyResult<Value> {
    match methods::lookup(object, name) {
        Some(method) => Ok(Value::new(ValueKind::BuiltinMethod(BuiltinMethod {
            receiver: object.clone(),
            name: method,
        }))),
        None => Err(no_attribute(object, name)),
    }
}

fn not_an_exception() -> Exception {
    Exception::new(ExcKind::TypeError, "exceptions must derive from BaseException")
}

fn not_callable(value: &Value) -> Exception {
    Exception::new(
        ExcKind::TypeError,
        format!("'{}' object is not callable", value.type_name()),
    )
}

fn not_subscriptable(value: &Value) -> Exception {
    Exception::new(
        ExcKind::TypeError,
        format!("'{}' object is not subscriptable", value.type_name()),
    )
}

fn no_item_assignment(value: &Value) -> Exception {
    Exception::new(
        ExcKind::TypeError,
        format!("'{}' object does not support item assignment", value.type_name()),
    )
}

fn no_item_deletion(value: &Value) -> Exception {
    Exception::new(
        ExcKind::TypeError,
        format!("'{}' object doesn't support item deletion", value.type_name()),
    )
}

fn no_len(value: &Value) -> Exception {
    Exception::new(
        ExcKind::TypeError,
        format!("object of type '{}' has no len()", value.type_name()),
    )
}

pub(crate) fn no_attribute(value: &Value, name: &str) -> Exception {
    Exception::new(
        ExcKind::AttributeError,
        format!("'{}' object has no attribute '{name}'", value.type_name()),
    )
}
