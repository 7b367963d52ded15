use std::{cell::RefCell, collections::HashSet, rc::Rc};

use indexmap::IndexMap;

use crate::value::Value;

pub type EnvironmentRef = Rc<RefCell<Environment>>;

/// What kind of code block a scope belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Builtins,
    Module,
    Function,
    Class,
    Comprehension,
}

/// One namespace in the chain. Lookups walk parents; bindings always land
/// in the innermost scope unless a `global` or `nonlocal` declaration
/// redirects them.
#[derive(Debug)]
pub struct Environment {
    parent: Option<EnvironmentRef>,
    kind: ScopeKind,
    bindings: IndexMap<String, Value>,
    globals: HashSet<String>,
    nonlocals: HashSet<String>,
}

impl Environment {
    pub fn new(kind: ScopeKind) -> EnvironmentRef {
        Rc::new(RefCell::new(Self {
            parent: None,
            kind,
            bindings: IndexMap::new(),
            globals: HashSet::new(),
            nonlocals: HashSet::new(),
        }))
    }

    pub fn with_parent(parent: EnvironmentRef, kind: ScopeKind) -> EnvironmentRef {
        let env = Self::new(kind);
        env.borrow_mut().parent = Some(parent);
        env
    }

    pub fn kind(&self) -> ScopeKind {
        self.kind
    }

    pub fn parent(&self) -> Option<EnvironmentRef> {
        self.parent.clone()
    }

    pub fn bindings(&self) -> &IndexMap<String, Value> {
        &self.bindings
    }

    pub fn define(&mut self, name: impl Into<String>, value: Value) {
        self.bindings.insert(name.into(), value);
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.bindings.shift_remove(name)
    }

    pub fn declare_global(&mut self, name: &str) {
        self.globals.insert(name.to_string());
    }

    pub fn declare_nonlocal(&mut self, name: &str) {
        self.nonlocals.insert(name.to_string());
    }

    pub fn is_global(&self, name: &str) -> bool {
        self.globals.contains(name)
    }

    pub fn is_nonlocal(&self, name: &str) -> bool {
        self.nonlocals.contains(name)
    }

    pub fn lookup(env: &EnvironmentRef, name: &str) -> Option<Value> {
        let mut current = Rc::clone(env);
        loop {
            let next = {
                let scope = current.borrow();
                if let Some(value) = scope.bindings.get(name) {
                    return Some(value.clone());
                }
                scope.parent.clone()
            };
            current = next?;
        }
    }

    /// Rebinds `name` in the nearest enclosing function scope that already
    /// holds it. Class scopes are skipped and the module scope is never
    /// reached.
    pub fn assign_nonlocal(env: &EnvironmentRef, name: &str, value: Value) -> bool {
        let mut current = env.borrow().parent.clone();
        while let Some(scope) = current {
            let next = {
                let mut scope = scope.borrow_mut();
                match scope.kind {
                    ScopeKind::Module | ScopeKind::Builtins => return false,
                    ScopeKind::Class => {}
                    ScopeKind::Function | ScopeKind::Comprehension => {
                        if let Some(slot) = scope.bindings.get_mut(name) {
                            *slot = value;
                            return true;
                        }
                    }
                }
                scope.parent.clone()
            };
            current = next;
        }
        false
    }

    /// Whether an enclosing function scope binds `name`.
    pub fn has_enclosing_binding(env: &EnvironmentRef, name: &str) -> bool {
        let mut current = env.borrow().parent.clone();
        while let Some(scope) = current {
            let next = {
                let scope = scope.borrow();
                match scope.kind {
                    ScopeKind::Module | ScopeKind::Builtins => return false,
                    ScopeKind::Class => {}
                    ScopeKind::Function | ScopeKind::Comprehension => {
                        if scope.bindings.contains_key(name) {
                            return true;
                        }
                    }
                }
                scope.parent.clone()
            };
            current = next;
        }
        false
    }
}
