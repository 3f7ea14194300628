use std::{cell::RefCell, rc::Rc};

use rustc_hash::FxHashMap;
use smol_str::SmolStr;

use super::{error::EvalError, value::Value};

pub type SharedEnv = Rc<RefCell<Env>>;

#[derive(Debug, Clone)]
struct Binding {
    value: Value,
    constant: bool,
}

/// A lexical scope.
///
/// A scope either holds its own bindings or, for implicit locals exposure,
/// reads and writes the properties of a data object.
#[derive(Debug, Default)]
pub struct Env {
    bindings: FxHashMap<SmolStr, Binding>,
    object: Option<Value>,
    parent: Option<SharedEnv>,
    function_scope: bool,
}

impl Env {
    pub fn root() -> SharedEnv {
        Rc::new(RefCell::new(Env {
            function_scope: true,
            ..Default::default()
        }))
    }

    pub fn block(parent: &SharedEnv) -> SharedEnv {
        Rc::new(RefCell::new(Env {
            parent: Some(Rc::clone(parent)),
            ..Default::default()
        }))
    }

    pub fn function(parent: &SharedEnv) -> SharedEnv {
        Rc::new(RefCell::new(Env {
            parent: Some(Rc::clone(parent)),
            function_scope: true,
            ..Default::default()
        }))
    }

    /// A scope exposing the properties of `object` as variables.
    pub fn with_object(parent: &SharedEnv, object: Value) -> SharedEnv {
        Rc::new(RefCell::new(Env {
            object: Some(object),
            parent: Some(Rc::clone(parent)),
            ..Default::default()
        }))
    }

    pub fn define(&mut self, name: impl Into<SmolStr>, value: Value) {
        self.bindings.insert(
            name.into(),
            Binding {
                value,
                constant: false,
            },
        );
    }

    pub fn define_const(&mut self, name: impl Into<SmolStr>, value: Value) {
        self.bindings.insert(
            name.into(),
            Binding {
                value,
                constant: true,
            },
        );
    }

    pub fn has_own(&self, name: &str) -> bool {
        self.bindings.contains_key(name)
    }

    /// Drops every binding, breaking reference cycles between closures and
    /// the scopes they captured.
    pub fn clear(&mut self) {
        self.bindings.clear();
        self.object = None;
    }

    fn object_has(&self, name: &str) -> bool {
        match &self.object {
            Some(Value::Object(object)) => object.borrow().contains_key(name),
            _ => false,
        }
    }
}

/// Looks `name` up through the scope chain.
pub fn lookup(env: &SharedEnv, name: &str) -> Option<Value> {
    let mut current = Rc::clone(env);

    loop {
        let parent = {
            let scope = current.borrow();
            if let Some(binding) = scope.bindings.get(name) {
                return Some(binding.value.clone());
            }
            if scope.object_has(name) {
                return scope.object.as_ref().and_then(|object| object.property(name));
            }
            scope.parent.clone()
        };

        current = parent?;
    }
}

/// Assigns to an existing binding. Returns `Ok(false)` when no scope in the
/// chain declares `name`.
pub fn assign(env: &SharedEnv, name: &str, value: Value) -> Result<bool, EvalError> {
    let mut current = Rc::clone(env);

    loop {
        let parent = {
            let mut scope = current.borrow_mut();
            if let Some(binding) = scope.bindings.get_mut(name) {
                if binding.constant {
                    return Err(EvalError::type_error("Assignment to constant variable."));
                }
                binding.value = value;
                return Ok(true);
            }
            if scope.object_has(name) {
                if let Some(Value::Object(object)) = &scope.object {
                    object.borrow_mut().set(name, value);
                }
                return Ok(true);
            }
            scope.parent.clone()
        };

        match parent {
            Some(parent) => current = parent,
            None => return Ok(false),
        }
    }
}

/// The nearest enclosing function scope, where `var` bindings live.
pub fn function_scope(env: &SharedEnv) -> SharedEnv {
    let mut current = Rc::clone(env);

    loop {
        let parent = {
            let scope = current.borrow();
            if scope.function_scope {
                None
            } else {
                scope.parent.clone()
            }
        };

        match parent {
            Some(parent) => current = parent,
            None => return current,
        }
    }
}

/// The outermost scope, where implicit globals are created.
pub fn global_scope(env: &SharedEnv) -> SharedEnv {
    let mut current = Rc::clone(env);

    loop {
        let parent = current.borrow().parent.clone();
        match parent {
            Some(parent) => current = parent,
            None => return current,
        }
    }
}
