use std::{cell::RefCell, cmp::Ordering, rc::Rc, sync::Arc};

use futures::{FutureExt, future::LocalBoxFuture};
use itertools::Itertools;
use smol_str::SmolStr;

use crate::{options::EscapeFn, render::OutputBuffer};

use super::{
    ast::{
        self, AssignOp, BinaryOp, DeclKind, Expr, ForTarget, FunctionBody, FunctionDef, LogicalOp,
        Property, PropertyKey, Stmt, TemplateSegment, UnaryOp,
    },
    env::{self, Env, SharedEnv},
    error::EvalError,
    method::{at, invalid_string_length, number_method, relative_index, string_method},
    value::{
        Closure, Function, MAX_ARRAY_LENGTH, MAX_STRING_LENGTH, Object, Value, number_to_string,
        settle,
    },
};

pub const MAX_CALL_DEPTH: usize = 128;

const PENDING_AWAIT: &str =
    "await of an unresolved value requires a template compiled with async enabled";

#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Normal,
    Break,
    Continue,
    Return(Value),
}

/// Tree-walking evaluator for a compiled template program.
///
/// Output is written to the shared buffer as statements run; `line` tracks
/// the most recent template line marker for error annotation.
///
/// Evaluation is a future. In async mode an `await` of a pending value
/// suspends the run until the value resolves; otherwise the run completes on
/// its first poll.
pub struct Interpreter {
    output: Rc<RefCell<OutputBuffer>>,
    escape: EscapeFn,
    line: u32,
    depth: usize,
    strict: bool,
    async_mode: bool,
}

impl Interpreter {
    pub fn new(
        output: Rc<RefCell<OutputBuffer>>,
        escape: EscapeFn,
        strict: bool,
        async_mode: bool,
    ) -> Self {
        Self {
            output,
            escape,
            line: 1,
            depth: 0,
            strict,
            async_mode,
        }
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    pub async fn run(&mut self, program: &[Stmt], env: &SharedEnv) -> Result<(), EvalError> {
        self.hoist(program, env, true);

        for stmt in program {
            if let Completion::Return(_) = self.exec(stmt, env).await? {
                break;
            }
        }

        Ok(())
    }

    fn hoist(&self, stmts: &[Stmt], env: &SharedEnv, vars: bool) {
        if vars {
            let mut names = Vec::new();
            ast::var_names(stmts, &mut names);

            let scope = env::function_scope(env);
            let mut scope = scope.borrow_mut();
            for name in names {
                if !scope.has_own(&name) {
                    scope.define(name, Value::Undefined);
                }
            }
        }

        for stmt in stmts {
            if let Stmt::Function(def) = stmt {
                if let Some(name) = &def.name {
                    let function = closure(def, env);
                    env.borrow_mut().define(name.clone(), function);
                }
            }
        }
    }

    fn exec<'a>(
        &'a mut self,
        stmt: &'a Stmt,
        env: &'a SharedEnv,
    ) -> LocalBoxFuture<'a, Result<Completion, EvalError>> {
        async move {
            match stmt {
                Stmt::Expr(expr) => {
                    self.eval(expr, env).await?;
                }
                Stmt::Declare(kind, declarations) => {
                    for (name, init) in declarations {
                        self.declare(*kind, name, init.as_ref(), env).await?;
                    }
                }
                Stmt::Function(_) | Stmt::Empty => {}
                Stmt::If(test, consequent, alternate) => {
                    if self.eval(test, env).await?.is_truthy() {
                        return self.exec(consequent, env).await;
                    } else if let Some(alternate) = alternate {
                        return self.exec(alternate, env).await;
                    }
                }
                Stmt::Block(body) => return self.exec_block(body, env).await,
                Stmt::For {
                    init,
                    test,
                    update,
                    body,
                } => {
                    let scope = Env::block(env);
                    if let Some(init) = init {
                        self.exec(init, &scope).await?;
                    }

                    loop {
                        if let Some(test) = test {
                            if !self.eval(test, &scope).await?.is_truthy() {
                                break;
                            }
                        }
                        match self.exec(body, &scope).await? {
                            Completion::Break => break,
                            Completion::Return(value) => return Ok(Completion::Return(value)),
                            Completion::Normal | Completion::Continue => {}
                        }
                        if let Some(update) = update {
                            self.eval(update, &scope).await?;
                        }
                    }
                }
                Stmt::ForOf {
                    target,
                    iterable,
                    body,
                } => {
                    let items = iterate(self.eval(iterable, env).await?, iterable)?;
                    return self.exec_loop(target, items, body, env).await;
                }
                Stmt::ForIn {
                    target,
                    object,
                    body,
                } => {
                    let keys = self
                        .eval(object, env)
                        .await?
                        .keys()
                        .into_iter()
                        .map(Value::String)
                        .collect();
                    return self.exec_loop(target, keys, body, env).await;
                }
                Stmt::While(test, body) => {
                    while self.eval(test, env).await?.is_truthy() {
                        match self.exec(body, env).await? {
                            Completion::Break => break,
                            Completion::Return(value) => return Ok(Completion::Return(value)),
                            Completion::Normal | Completion::Continue => {}
                        }
                    }
                }
                Stmt::Break => return Ok(Completion::Break),
                Stmt::Continue => return Ok(Completion::Continue),
                Stmt::Return(value) => {
                    let value = match value {
                        Some(value) => self.eval(value, env).await?,
                        None => Value::Undefined,
                    };
                    return Ok(Completion::Return(value));
                }
                Stmt::Throw(value) => return Err(thrown(self.eval(value, env).await?)),
                Stmt::Literal(text) => self.output.borrow_mut().push_str(text),
                Stmt::Emit { expr, escape } => {
                    if let Some(expr) = expr {
                        self.emit(expr, *escape, env).await?;
                    }
                }
                Stmt::Line(line) => self.line = *line,
            }

            Ok(Completion::Normal)
        }
        .boxed_local()
    }

    fn exec_block<'a>(
        &'a mut self,
        body: &'a [Stmt],
        env: &'a SharedEnv,
    ) -> LocalBoxFuture<'a, Result<Completion, EvalError>> {
        async move {
            let scope = Env::block(env);
            self.hoist(body, &scope, false);

            for stmt in body {
                match self.exec(stmt, &scope).await? {
                    Completion::Normal => {}
                    completion => return Ok(completion),
                }
            }

            Ok(Completion::Normal)
        }
        .boxed_local()
    }

    async fn exec_loop(
        &mut self,
        target: &ForTarget,
        items: Vec<Value>,
        body: &Stmt,
        env: &SharedEnv,
    ) -> Result<Completion, EvalError> {
        for item in items {
            let scope = Env::block(env);
            match target {
                ForTarget::Declare(DeclKind::Var, name) | ForTarget::Assign(name) => {
                    self.assign_ident(name, item, &scope)?
                }
                ForTarget::Declare(DeclKind::Let, name) => {
                    scope.borrow_mut().define(name.clone(), item)
                }
                ForTarget::Declare(DeclKind::Const, name) => {
                    scope.borrow_mut().define_const(name.clone(), item)
                }
            }

            match self.exec(body, &scope).await? {
                Completion::Break => break,
                Completion::Return(value) => return Ok(Completion::Return(value)),
                Completion::Normal | Completion::Continue => {}
            }
        }

        Ok(Completion::Normal)
    }

    async fn declare(
        &mut self,
        kind: DeclKind,
        name: &SmolStr,
        init: Option<&Expr>,
        env: &SharedEnv,
    ) -> Result<(), EvalError> {
        match kind {
            DeclKind::Var => {
                if let Some(init) = init {
                    let value = self.eval(init, env).await?;
                    self.assign_ident(name, value, env)?;
                }
            }
            DeclKind::Let => {
                let value = match init {
                    Some(init) => self.eval(init, env).await?,
                    None => Value::Undefined,
                };
                env.borrow_mut().define(name.clone(), value);
            }
            DeclKind::Const => {
                let value = match init {
                    Some(init) => self.eval(init, env).await?,
                    None => Value::Undefined,
                };
                env.borrow_mut().define_const(name.clone(), value);
            }
        }

        Ok(())
    }

    /// Writes the value of an output tag. In async mode a pending value
    /// becomes a pending fragment, with or without `await`.
    async fn emit(&mut self, expr: &Expr, escape: bool, env: &SharedEnv) -> Result<(), EvalError> {
        let value = match (self.async_mode, expr) {
            (true, Expr::Await(operand)) => self.eval(operand, env).await?,
            _ => self.eval(expr, env).await?,
        };

        match value {
            Value::Pending(pending) if self.async_mode => {
                self.output
                    .borrow_mut()
                    .push_pending(pending, escape, self.line);
                Ok(())
            }
            value => self.write(value, escape),
        }
    }

    fn write(&mut self, value: Value, escape: bool) -> Result<(), EvalError> {
        if value.is_nullish() {
            return Ok(());
        }

        let text = value.to_string();
        if escape {
            self.output.borrow_mut().push_str(&(self.escape)(&text));
        } else {
            self.output.borrow_mut().push_str(&text);
        }

        Ok(())
    }

    pub fn eval<'a>(
        &'a mut self,
        expr: &'a Expr,
        env: &'a SharedEnv,
    ) -> LocalBoxFuture<'a, Result<Value, EvalError>> {
        async move {
            match expr {
                Expr::Number(n) => Ok(Value::Number(*n)),
                Expr::String(s) => Ok(Value::String(s.clone())),
                Expr::Bool(b) => Ok(Value::Bool(*b)),
                Expr::Null => Ok(Value::Null),
                Expr::Template(segments) => {
                    let mut text = String::new();
                    for segment in segments {
                        match segment {
                            TemplateSegment::Text(s) => text.push_str(s),
                            TemplateSegment::Expr(expr) => {
                                text.push_str(&self.eval(expr, env).await?.to_string())
                            }
                        }
                    }
                    Ok(Value::from(text))
                }
                Expr::Ident(name) => {
                    env::lookup(env, name).ok_or_else(|| EvalError::Reference(name.clone()))
                }
                Expr::Array(elements) => Ok(Value::array(self.eval_list(elements, env).await?)),
                Expr::Object(properties) => self.eval_object(properties, env).await,
                Expr::Spread(_) => Err(EvalError::runtime("Unexpected spread")),
                Expr::Member { .. } | Expr::Index { .. } | Expr::Call { .. } => {
                    Ok(self.eval_chain(expr, env).await?.unwrap_or_default())
                }
                Expr::New { callee, args } => {
                    let function = self.eval(callee, env).await?;
                    let args = self.eval_list(args, env).await?;
                    self.call_value(&function, args, callee).await
                }
                Expr::Function(def) => Ok(closure(def, env)),
                Expr::Unary(op, operand) => self.eval_unary(*op, operand, env).await,
                Expr::Await(operand) => match self.eval(operand, env).await? {
                    Value::Pending(pending) if self.async_mode => settle(pending).await,
                    Value::Pending(pending) => pending
                        .now_or_never()
                        .unwrap_or_else(|| Err(EvalError::runtime(PENDING_AWAIT))),
                    value => Ok(value),
                },
                Expr::Update {
                    increment,
                    prefix,
                    target,
                } => {
                    let old = self.eval(target, env).await?.to_number();
                    let new = if *increment { old + 1.0 } else { old - 1.0 };
                    self.assign_to(target, Value::Number(new), env).await?;
                    Ok(Value::Number(if *prefix { new } else { old }))
                }
                Expr::Binary(op, lhs, rhs) => {
                    let lhs = self.eval(lhs, env).await?;
                    let rhs = self.eval(rhs, env).await?;
                    binary(*op, lhs, rhs)
                }
                Expr::Logical(op, lhs, rhs) => {
                    let lhs = self.eval(lhs, env).await?;
                    if short_circuits(*op, &lhs) {
                        Ok(lhs)
                    } else {
                        self.eval(rhs, env).await
                    }
                }
                Expr::Conditional(test, consequent, alternate) => {
                    if self.eval(test, env).await?.is_truthy() {
                        self.eval(consequent, env).await
                    } else {
                        self.eval(alternate, env).await
                    }
                }
                Expr::Assign { op, target, value } => match op {
                    AssignOp::Assign => {
                        let value = self.eval(value, env).await?;
                        self.assign_to(target, value.clone(), env).await?;
                        Ok(value)
                    }
                    AssignOp::Compound(op) => {
                        let current = self.eval(target, env).await?;
                        let rhs = self.eval(value, env).await?;
                        let value = binary(*op, current, rhs)?;
                        self.assign_to(target, value.clone(), env).await?;
                        Ok(value)
                    }
                    AssignOp::Logical(op) => {
                        let current = self.eval(target, env).await?;
                        if short_circuits(*op, &current) {
                            return Ok(current);
                        }
                        let value = self.eval(value, env).await?;
                        self.assign_to(target, value.clone(), env).await?;
                        Ok(value)
                    }
                },
            }
        }
        .boxed_local()
    }

    async fn eval_unary(
        &mut self,
        op: UnaryOp,
        operand: &Expr,
        env: &SharedEnv,
    ) -> Result<Value, EvalError> {
        if let (UnaryOp::Typeof, Expr::Ident(name)) = (op, operand) {
            let type_of = env::lookup(env, name).map_or("undefined", |value| value.type_of());
            return Ok(Value::string(type_of));
        }

        let value = self.eval(operand, env).await?;
        Ok(match op {
            UnaryOp::Not => Value::Bool(!value.is_truthy()),
            UnaryOp::Neg => Value::Number(-value.to_number()),
            UnaryOp::Plus => Value::Number(value.to_number()),
            UnaryOp::Typeof => Value::string(value.type_of()),
        })
    }

    async fn eval_list(
        &mut self,
        exprs: &[Expr],
        env: &SharedEnv,
    ) -> Result<Vec<Value>, EvalError> {
        let mut values = Vec::with_capacity(exprs.len());

        for expr in exprs {
            match expr {
                Expr::Spread(inner) => {
                    let value = self.eval(inner, env).await?;
                    values.extend(iterate(value, inner)?);
                }
                expr => values.push(self.eval(expr, env).await?),
            }
        }

        Ok(values)
    }

    async fn eval_object(
        &mut self,
        properties: &[Property],
        env: &SharedEnv,
    ) -> Result<Value, EvalError> {
        let mut object = Object::new();

        for property in properties {
            match property {
                Property::KeyValue(key, value) => {
                    let key = match key {
                        PropertyKey::Static(key) => key.clone(),
                        PropertyKey::Computed(expr) => property_key(&self.eval(expr, env).await?),
                    };
                    let value = self.eval(value, env).await?;
                    object.set(key, value);
                }
                Property::Spread(expr) => {
                    let source = self.eval(expr, env).await?;
                    for key in source.keys() {
                        let value = source.property(&key).unwrap_or_default();
                        object.set(key, value);
                    }
                }
            }
        }

        Ok(Value::object(object))
    }

    /// Evaluates a member/index/call chain. `None` means an optional link
    /// short-circuited the rest of the chain.
    fn eval_chain<'a>(
        &'a mut self,
        expr: &'a Expr,
        env: &'a SharedEnv,
    ) -> LocalBoxFuture<'a, Result<Option<Value>, EvalError>> {
        async move {
            match expr {
                Expr::Member {
                    object,
                    property,
                    optional,
                } => {
                    let Some(target) = self.eval_chain(object, env).await? else {
                        return Ok(None);
                    };
                    if *optional && target.is_nullish() {
                        return Ok(None);
                    }
                    get_property(&target, property).map(Some)
                }
                Expr::Index {
                    object,
                    index,
                    optional,
                } => {
                    let Some(target) = self.eval_chain(object, env).await? else {
                        return Ok(None);
                    };
                    if *optional && target.is_nullish() {
                        return Ok(None);
                    }
                    let key = property_key(&self.eval(index, env).await?);
                    get_property(&target, &key).map(Some)
                }
                Expr::Call {
                    callee,
                    args,
                    optional,
                } => self.eval_call(callee, args, *optional, env).await,
                expr => self.eval(expr, env).await.map(Some),
            }
        }
        .boxed_local()
    }

    async fn eval_call(
        &mut self,
        callee: &Expr,
        args: &[Expr],
        optional: bool,
        env: &SharedEnv,
    ) -> Result<Option<Value>, EvalError> {
        let Expr::Member {
            object,
            property,
            optional: optional_member,
        } = callee
        else {
            let Some(function) = self.eval_chain(callee, env).await? else {
                return Ok(None);
            };
            if optional && function.is_nullish() {
                return Ok(None);
            }
            let args = self.eval_list(args, env).await?;
            return self.call_value(&function, args, callee).await.map(Some);
        };

        let Some(target) = self.eval_chain(object, env).await? else {
            return Ok(None);
        };
        if *optional_member && target.is_nullish() {
            return Ok(None);
        }

        let function = get_property(&target, property)?;
        if let Value::Function(_) = function {
            let args = self.eval_list(args, env).await?;
            return self.call_value(&function, args, callee).await.map(Some);
        }
        if optional && function.is_nullish() {
            return Ok(None);
        }

        let args = self.eval_list(args, env).await?;
        match self.call_method(&target, property, args).await? {
            Some(value) => Ok(Some(value)),
            None => Err(not_a_function(callee)),
        }
    }

    async fn call_value(
        &mut self,
        function: &Value,
        args: Vec<Value>,
        callee: &Expr,
    ) -> Result<Value, EvalError> {
        match function {
            Value::Function(function) => self.call_function(function, args).await,
            _ => Err(not_a_function(callee)),
        }
    }

    pub fn call_function<'a>(
        &'a mut self,
        function: &'a Rc<Function>,
        args: Vec<Value>,
    ) -> LocalBoxFuture<'a, Result<Value, EvalError>> {
        async move {
            match function.as_ref() {
                Function::Native { f, .. } => f(&args),
                Function::Closure(closure) => {
                    if self.depth >= MAX_CALL_DEPTH {
                        return Err(EvalError::Range(
                            "Maximum call stack size exceeded".to_string(),
                        ));
                    }

                    self.depth += 1;
                    let result = self.invoke(function, closure, args).await;
                    self.depth -= 1;
                    result
                }
            }
        }
        .boxed_local()
    }

    async fn invoke(
        &mut self,
        function: &Rc<Function>,
        closure: &Closure,
        args: Vec<Value>,
    ) -> Result<Value, EvalError> {
        let def = &closure.def;
        let scope = Env::function(&closure.env);

        if let (false, Some(name)) = (def.arrow, &def.name) {
            scope
                .borrow_mut()
                .define(name.clone(), Value::Function(Rc::clone(function)));
        }

        for (i, param) in def.params.iter().enumerate() {
            let value = if param.rest {
                Value::array(args.get(i..).map(<[Value]>::to_vec).unwrap_or_default())
            } else {
                match (args.get(i), &param.default) {
                    (Some(Value::Undefined) | None, Some(default)) => {
                        self.eval(default, &scope).await?
                    }
                    (Some(value), _) => value.clone(),
                    (None, None) => Value::Undefined,
                }
            };
            scope.borrow_mut().define(param.name.clone(), value);
        }

        match &def.body {
            FunctionBody::Expr(expr) => self.eval(expr, &scope).await,
            FunctionBody::Block(body) => {
                self.hoist(body, &scope, true);
                for stmt in body {
                    if let Completion::Return(value) = self.exec(stmt, &scope).await? {
                        return Ok(value);
                    }
                }
                Ok(Value::Undefined)
            }
        }
    }

    async fn call_callback(
        &mut self,
        callback: &Value,
        args: Vec<Value>,
    ) -> Result<Value, EvalError> {
        match callback {
            Value::Function(function) => self.call_function(function, args).await,
            value => Err(EvalError::type_error(format!("{value} is not a function"))),
        }
    }

    async fn call_method(
        &mut self,
        target: &Value,
        name: &str,
        args: Vec<Value>,
    ) -> Result<Option<Value>, EvalError> {
        match target {
            Value::String(s) => string_method(s, name, &args),
            Value::Number(n) => number_method(*n, name, &args),
            Value::Array(values) => self.array_method(target, values, name, args).await,
            Value::Object(object) => Ok(match name {
                "hasOwnProperty" => Some(Value::Bool(
                    object
                        .borrow()
                        .contains_key(&property_key(&args.first().cloned().unwrap_or_default())),
                )),
                "toString" => Some(Value::string(target.to_string())),
                _ => None,
            }),
            Value::Function(function) => match name {
                "call" => self
                    .call_function(function, args.into_iter().skip(1).collect())
                    .await
                    .map(Some),
                "apply" => {
                    let args = match args.get(1) {
                        Some(Value::Array(values)) => values.borrow().clone(),
                        _ => Vec::new(),
                    };
                    self.call_function(function, args).await.map(Some)
                }
                _ => Ok(None),
            },
            Value::Bool(_) if name == "toString" => Ok(Some(Value::string(target.to_string()))),
            _ => Ok(None),
        }
    }

    async fn array_method(
        &mut self,
        target: &Value,
        values: &Rc<RefCell<Vec<Value>>>,
        name: &str,
        args: Vec<Value>,
    ) -> Result<Option<Value>, EvalError> {
        let callback = args.first().cloned().unwrap_or_default();
        let snapshot = || values.borrow().clone();

        let value = match name {
            "push" => {
                let mut values = values.borrow_mut();
                values.extend(args);
                Value::Number(values.len() as f64)
            }
            "pop" => values.borrow_mut().pop().unwrap_or_default(),
            "shift" => {
                let mut values = values.borrow_mut();
                if values.is_empty() {
                    Value::Undefined
                } else {
                    values.remove(0)
                }
            }
            "unshift" => {
                let mut values = values.borrow_mut();
                values.splice(0..0, args);
                Value::Number(values.len() as f64)
            }
            "join" => {
                let separator = match args.first() {
                    None | Some(Value::Undefined) => ",".to_string(),
                    Some(separator) => separator.to_string(),
                };
                Value::string(
                    values
                        .borrow()
                        .iter()
                        .map(|value| {
                            if value.is_nullish() {
                                String::new()
                            } else {
                                value.to_string()
                            }
                        })
                        .join(&separator),
                )
            }
            "forEach" => {
                for (i, item) in snapshot().into_iter().enumerate() {
                    let args = vec![item, Value::from(i as f64), target.clone()];
                    self.call_callback(&callback, args).await?;
                }
                Value::Undefined
            }
            "map" => {
                let mut mapped = Vec::new();
                for (i, item) in snapshot().into_iter().enumerate() {
                    let args = vec![item, Value::from(i as f64), target.clone()];
                    mapped.push(self.call_callback(&callback, args).await?);
                }
                Value::array(mapped)
            }
            "filter" => {
                let mut filtered = Vec::new();
                for (i, item) in snapshot().into_iter().enumerate() {
                    let args = vec![item.clone(), Value::from(i as f64), target.clone()];
                    if self.call_callback(&callback, args).await?.is_truthy() {
                        filtered.push(item);
                    }
                }
                Value::array(filtered)
            }
            "find" | "findIndex" | "some" | "every" => {
                let mut found = None;
                for (i, item) in snapshot().into_iter().enumerate() {
                    let args = vec![item.clone(), Value::from(i as f64), target.clone()];
                    let matched = self.call_callback(&callback, args).await?.is_truthy();
                    if matched != (name == "every") {
                        found = Some((i, item));
                        break;
                    }
                }

                match (name, found) {
                    ("find", found) => found.map(|(_, item)| item).unwrap_or_default(),
                    ("findIndex", found) => Value::Number(found.map_or(-1.0, |(i, _)| i as f64)),
                    ("some", found) => Value::Bool(found.is_some()),
                    (_, found) => Value::Bool(found.is_none()),
                }
            }
            "reduce" => {
                let mut items = snapshot().into_iter().enumerate();
                let mut accumulator = match args.get(1) {
                    Some(initial) => initial.clone(),
                    None => match items.next() {
                        Some((_, first)) => first,
                        None => {
                            return Err(EvalError::type_error(
                                "Reduce of empty array with no initial value",
                            ));
                        }
                    },
                };
                for (i, item) in items {
                    accumulator = self
                        .call_callback(
                            &callback,
                            vec![accumulator, item, Value::from(i as f64), target.clone()],
                        )
                        .await?;
                }
                accumulator
            }
            "includes" => {
                let needle = args.first().cloned().unwrap_or_default();
                Value::Bool(values.borrow().iter().any(|value| {
                    strict_equals(value, &needle)
                        || matches!(
                            (value, &needle),
                            (Value::Number(a), Value::Number(b)) if a.is_nan() && b.is_nan()
                        )
                }))
            }
            "indexOf" => {
                let needle = args.first().cloned().unwrap_or_default();
                Value::Number(
                    values
                        .borrow()
                        .iter()
                        .position(|value| strict_equals(value, &needle))
                        .map_or(-1.0, |i| i as f64),
                )
            }
            "slice" => {
                let values = values.borrow();
                let start = relative_index(args.first(), values.len(), 0);
                let end = relative_index(args.get(1), values.len(), values.len());
                Value::array(values[start..end.max(start)].to_vec())
            }
            "at" => at(values.borrow().as_slice(), args.first()).unwrap_or_default(),
            "concat" => {
                let mut joined = snapshot();
                for arg in args {
                    match arg {
                        Value::Array(other) => joined.extend(other.borrow().iter().cloned()),
                        value => joined.push(value),
                    }
                }
                Value::array(joined)
            }
            "reverse" => {
                values.borrow_mut().reverse();
                target.clone()
            }
            "sort" => {
                let sorted = self.sort(snapshot(), &callback).await?;
                *values.borrow_mut() = sorted;
                target.clone()
            }
            "toString" => Value::string(target.to_string()),
            _ => return Ok(None),
        };

        Ok(Some(value))
    }

    /// Stable bottom-up merge sort. The comparator may be template code, so
    /// every comparison can suspend.
    async fn sort(
        &mut self,
        mut items: Vec<Value>,
        compare: &Value,
    ) -> Result<Vec<Value>, EvalError> {
        let len = items.len();
        let mut width = 1;

        while width < len {
            let mut merged = Vec::with_capacity(len);
            for start in (0..len).step_by(2 * width) {
                let mid = (start + width).min(len);
                let end = (start + 2 * width).min(len);
                let (mut left, mut right) = (start, mid);

                while left < mid && right < end {
                    if self.compare_items(&items[left], &items[right], compare).await?
                        == Ordering::Greater
                    {
                        merged.push(items[right].clone());
                        right += 1;
                    } else {
                        merged.push(items[left].clone());
                        left += 1;
                    }
                }
                merged.extend_from_slice(&items[left..mid]);
                merged.extend_from_slice(&items[right..end]);
            }
            items = merged;
            width *= 2;
        }

        Ok(items)
    }

    async fn compare_items(
        &mut self,
        a: &Value,
        b: &Value,
        compare: &Value,
    ) -> Result<Ordering, EvalError> {
        Ok(match (a, b) {
            (Value::Undefined, Value::Undefined) => Ordering::Equal,
            (Value::Undefined, _) => Ordering::Greater,
            (_, Value::Undefined) => Ordering::Less,
            (a, b) if compare.is_nullish() => a.to_string().cmp(&b.to_string()),
            (a, b) => self
                .call_callback(compare, vec![a.clone(), b.clone()])
                .await?
                .to_number()
                .partial_cmp(&0.0)
                .unwrap_or(Ordering::Equal),
        })
    }

    fn assign_ident(
        &mut self,
        name: &SmolStr,
        value: Value,
        env: &SharedEnv,
    ) -> Result<(), EvalError> {
        if env::assign(env, name, value.clone())? {
            return Ok(());
        }
        if self.strict {
            return Err(EvalError::Reference(name.clone()));
        }

        env::global_scope(env).borrow_mut().define(name.clone(), value);
        Ok(())
    }

    async fn assign_to(
        &mut self,
        target: &Expr,
        value: Value,
        env: &SharedEnv,
    ) -> Result<(), EvalError> {
        match target {
            Expr::Ident(name) => self.assign_ident(name, value, env),
            Expr::Member {
                object, property, ..
            } => {
                let object = self.eval(object, env).await?;
                set_property(&object, property, value)
            }
            Expr::Index { object, index, .. } => {
                let object = self.eval(object, env).await?;
                let key = property_key(&self.eval(index, env).await?);
                set_property(&object, &key, value)
            }
            _ => Err(EvalError::runtime("Invalid left-hand side in assignment")),
        }
    }
}


fn iterate(value: Value, expr: &Expr) -> Result<Vec<Value>, EvalError> {
    match value {
        Value::Array(values) => Ok(values.borrow().clone()),
        Value::String(s) => Ok(s.chars().map(|c| Value::string(c.to_string())).collect()),
        _ => Err(EvalError::type_error(format!(
            "{} is not iterable",
            describe(expr)
        ))),
    }
}

fn closure(def: &Arc<FunctionDef>, env: &SharedEnv) -> Value {
    Value::Function(Rc::new(Function::Closure(Closure {
        def: Arc::clone(def),
        env: Rc::clone(env),
    })))
}

fn short_circuits(op: LogicalOp, lhs: &Value) -> bool {
    match op {
        LogicalOp::And => !lhs.is_truthy(),
        LogicalOp::Or => lhs.is_truthy(),
        LogicalOp::Nullish => !lhs.is_nullish(),
    }
}

fn get_property(target: &Value, key: &str) -> Result<Value, EvalError> {
    if target.is_nullish() {
        return Err(EvalError::type_error(format!(
            "Cannot read properties of {target} (reading '{key}')"
        )));
    }

    Ok(target.property(key).unwrap_or_default())
}

fn set_property(target: &Value, key: &str, value: Value) -> Result<(), EvalError> {
    match target {
        Value::Object(object) => object.borrow_mut().set(key, value),
        Value::Array(values) => {
            let mut values = values.borrow_mut();
            if key == "length" {
                let len = value.to_number();
                if len.is_nan()
                    || len < 0.0
                    || len.fract() != 0.0
                    || len > MAX_ARRAY_LENGTH as f64
                {
                    return Err(invalid_array_length());
                }
                values.resize(len as usize, Value::Undefined);
            } else if let Ok(index) = key.parse::<usize>() {
                if index >= values.len() {
                    if index >= MAX_ARRAY_LENGTH {
                        return Err(invalid_array_length());
                    }
                    values.resize(index + 1, Value::Undefined);
                }
                values[index] = value;
            }
        }
        Value::Undefined | Value::Null => {
            return Err(EvalError::type_error(format!(
                "Cannot set properties of {target} (setting '{key}')"
            )));
        }
        _ => {}
    }

    Ok(())
}

fn invalid_array_length() -> EvalError {
    EvalError::Range("Invalid array length".to_string())
}

/// Converts a computed member key to its property name.
fn property_key(key: &Value) -> SmolStr {
    match key {
        Value::Number(n) => SmolStr::new(number_to_string(*n)),
        Value::String(s) => s.clone(),
        key => SmolStr::new(key.to_string()),
    }
}

fn thrown(value: Value) -> EvalError {
    if let Value::Object(object) = &value {
        let object = object.borrow();
        if let (Some(name), Some(message)) = (object.get("name"), object.get("message")) {
            return EvalError::Thrown {
                name: SmolStr::new(name.to_string()),
                message: message.to_string(),
            };
        }
    }

    EvalError::Thrown {
        name: SmolStr::new_static("Error"),
        message: value.to_string(),
    }
}

fn not_a_function(callee: &Expr) -> EvalError {
    EvalError::type_error(format!("{} is not a function", describe(callee)))
}

/// Source-like rendering of a callee for error messages.
fn describe(expr: &Expr) -> String {
    match expr {
        Expr::Ident(name) => name.to_string(),
        Expr::Member {
            object, property, ..
        } => format!("{}.{property}", describe(object)),
        Expr::Index { object, .. } => format!("{}[...]", describe(object)),
        Expr::Call { callee, .. } => format!("{}(...)", describe(callee)),
        Expr::String(s) => format!("\"{s}\""),
        Expr::Number(n) => number_to_string(*n),
        _ => "expression".to_string(),
    }
}

fn to_primitive(value: Value) -> Value {
    match value {
        Value::Array(_) | Value::Object(_) | Value::Function(_) | Value::Pending(_) => {
            Value::string(value.to_string())
        }
        value => value,
    }
}

fn binary(op: BinaryOp, lhs: Value, rhs: Value) -> Result<Value, EvalError> {
    let value = match op {
        BinaryOp::Add => {
            let (lhs, rhs) = (to_primitive(lhs), to_primitive(rhs));
            if matches!(lhs, Value::String(_)) || matches!(rhs, Value::String(_)) {
                let (lhs, rhs) = (lhs.to_string(), rhs.to_string());
                if lhs.len() + rhs.len() > MAX_STRING_LENGTH {
                    return Err(invalid_string_length());
                }
                Value::string(lhs + &rhs)
            } else {
                Value::Number(lhs.to_number() + rhs.to_number())
            }
        }
        BinaryOp::Sub => Value::Number(lhs.to_number() - rhs.to_number()),
        BinaryOp::Mul => Value::Number(lhs.to_number() * rhs.to_number()),
        BinaryOp::Div => Value::Number(lhs.to_number() / rhs.to_number()),
        BinaryOp::Rem => Value::Number(lhs.to_number() % rhs.to_number()),
        BinaryOp::Pow => Value::Number(lhs.to_number().powf(rhs.to_number())),
        BinaryOp::Eq => Value::Bool(loose_equals(&lhs, &rhs)),
        BinaryOp::NotEq => Value::Bool(!loose_equals(&lhs, &rhs)),
        BinaryOp::StrictEq => Value::Bool(strict_equals(&lhs, &rhs)),
        BinaryOp::StrictNotEq => Value::Bool(!strict_equals(&lhs, &rhs)),
        BinaryOp::Lt => Value::Bool(compare(lhs, rhs) == Some(Ordering::Less)),
        BinaryOp::Gt => Value::Bool(compare(lhs, rhs) == Some(Ordering::Greater)),
        BinaryOp::Lte => Value::Bool(matches!(
            compare(lhs, rhs),
            Some(Ordering::Less | Ordering::Equal)
        )),
        BinaryOp::Gte => Value::Bool(matches!(
            compare(lhs, rhs),
            Some(Ordering::Greater | Ordering::Equal)
        )),
        BinaryOp::In => {
            let key = property_key(&lhs);
            match &rhs {
                Value::Object(object) => Value::Bool(object.borrow().contains_key(&key)),
                Value::Array(values) => Value::Bool(
                    key == "length"
                        || key
                            .parse::<usize>()
                            .is_ok_and(|index| index < values.borrow().len()),
                ),
                _ => {
                    return Err(EvalError::type_error(format!(
                        "Cannot use 'in' operator to search for '{key}' in {rhs}"
                    )));
                }
            }
        }
        BinaryOp::Instanceof => Value::Bool(instance_of(&lhs, &rhs)?),
    };

    Ok(value)
}

fn compare(lhs: Value, rhs: Value) -> Option<Ordering> {
    match (to_primitive(lhs), to_primitive(rhs)) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(&b)),
        (a, b) => a.to_number().partial_cmp(&b.to_number()),
    }
}

pub fn strict_equals(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Number(a), Value::Number(b)) => a == b,
        (Value::String(a), Value::String(b)) => a == b,
        (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
        (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
        (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
        _ => false,
    }
}

pub fn loose_equals(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Undefined | Value::Null, Value::Undefined | Value::Null) => true,
        (Value::Undefined | Value::Null, _) | (_, Value::Undefined | Value::Null) => false,
        (Value::String(a), Value::String(b)) => a == b,
        (
            Value::Number(_) | Value::String(_) | Value::Bool(_),
            Value::Number(_) | Value::String(_) | Value::Bool(_),
        ) => a.to_number() == b.to_number(),
        (
            Value::Array(_) | Value::Object(_) | Value::Function(_) | Value::Pending(_),
            Value::Array(_) | Value::Object(_) | Value::Function(_) | Value::Pending(_),
        ) => strict_equals(a, b),
        (a, b) => loose_equals(&to_primitive(a.clone()), &to_primitive(b.clone())),
    }
}

fn instance_of(value: &Value, constructor: &Value) -> Result<bool, EvalError> {
    match constructor {
        // Error constructors build plain objects tagged with their name.
        Value::Function(function) => Ok(value
            .property("name")
            .is_some_and(|name| {
                matches!(value, Value::Object(_)) && name.to_string() == function.name()
            })),
        Value::Object(_) => Ok(
            match constructor.property("name").map(|name| name.to_string()).as_deref() {
                Some("Array") => matches!(value, Value::Array(_)),
                Some("Object") => matches!(
                    value,
                    Value::Array(_) | Value::Object(_) | Value::Function(_)
                ),
                _ => false,
            },
        ),
        _ => Err(EvalError::type_error(
            "Right-hand side of 'instanceof' is not callable",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::{builtin, lexer::tokenize, parser::Parser};
    use futures::{channel::oneshot, executor::block_on};
    use rstest::rstest;
    use serde_json::json;

    fn run_with(
        code: &str,
        data: serde_json::Value,
        strict: bool,
        bindings: Vec<(&str, Value)>,
    ) -> Result<String, EvalError> {
        run_in_mode(code, data, strict, false, bindings)
    }

    fn run_in_mode(
        code: &str,
        data: serde_json::Value,
        strict: bool,
        async_mode: bool,
        bindings: Vec<(&str, Value)>,
    ) -> Result<String, EvalError> {
        let program = Parser::new(tokenize(code, 1).unwrap())
            .parse_program()
            .unwrap();
        let output = Rc::new(RefCell::new(OutputBuffer::new()));
        let globals = Env::root();
        builtin::install(&mut globals.borrow_mut());

        let root = Env::function(&globals);
        let sink = Rc::clone(&output);
        root.borrow_mut().define(
            "__out",
            Value::function("__out", move |args| {
                for arg in args.iter().filter(|arg| !arg.is_nullish()) {
                    sink.borrow_mut().push_str(&arg.to_string());
                }
                Ok(Value::Undefined)
            }),
        );
        for (name, value) in bindings {
            root.borrow_mut().define(name, value);
        }

        let data = Value::from(data);
        let scope = if strict {
            root.borrow_mut().define("locals", data);
            Rc::clone(&root)
        } else {
            Env::with_object(&root, data)
        };

        let mut interpreter = Interpreter::new(
            Rc::clone(&output),
            Arc::new(crate::escape::escape_xml),
            strict,
            async_mode,
        );
        let result = block_on(interpreter.run(&program, &Env::block(&scope)));
        root.borrow_mut().clear();
        result?;

        Ok(output.take().into_text().unwrap_or_default())
    }

    fn run(code: &str, data: serde_json::Value) -> Result<String, EvalError> {
        run_with(code, data, false, Vec::new())
    }

    #[rstest]
    #[case("1 + 2 * 3", "7")]
    #[case("2 ** 3 ** 2", "512")]
    #[case("'a' + 1", "a1")]
    #[case("[1, 2] + ''", "1,2")]
    #[case("7 % 3", "1")]
    #[case("null ?? 'x'", "x")]
    #[case("0 || 'y'", "y")]
    #[case("1 && 2", "2")]
    #[case("1 == '1'", "true")]
    #[case("1 === '1'", "false")]
    #[case("null == undefined", "true")]
    #[case("'b' > 'a'", "true")]
    #[case("typeof missing", "undefined")]
    #[case("typeof {}", "object")]
    #[case("`x=${1 + 1}`", "x=2")]
    #[case("[1, 2, 3].map(n => n * 2).join('-')", "2-4-6")]
    #[case("[3, 1, 2].sort().join()", "1,2,3")]
    #[case("[3, 1, 10].sort((a, b) => a - b).join()", "1,3,10")]
    #[case("[1, 2, 3].filter(n => n > 1).length", "2")]
    #[case("[1, 2, 3].reduce((a, b) => a + b)", "6")]
    #[case("[1, 2, 3].find(n => n > 1)", "2")]
    #[case("[1, 2].some(n => n > 1)", "true")]
    #[case("[1, 2].every(n => n > 1)", "false")]
    #[case("[1, [2, 3]].concat([4]).length", "3")]
    #[case("'a,b'.split(',').length", "2")]
    #[case("(1.005).toFixed(1)", "1.0")]
    #[case("Math.max(...[1, 5, 3])", "5")]
    #[case("({a: 1, ...{b: 2}}).b", "2")]
    #[case("'k' in {k: 1}", "true")]
    #[case("[] instanceof Array", "true")]
    #[case("new Error('x') instanceof Error", "true")]
    #[case("user?.name", "")]
    #[case("user?.name.first.last", "")]
    #[case("user?.greet()", "")]
    fn test_expression(#[case] expr: &str, #[case] expected: &str) {
        assert_eq!(
            run(&format!("__out({expr})"), json!({"user": null})),
            Ok(expected.to_string())
        );
    }

    #[test]
    fn test_statements() {
        let code = r#"
            var total = 0
            for (let i = 0; i < 5; i++) {
                if (i == 3) continue
                total += i
            }
            const names = []
            for (const item of items) names.push(item.name)
            for (var key in items[0]) __out(key + ';')
            let n = 0
            while (true) { if (++n > 2) break }
            function twice(x) { return x * 2 }
            __out(total, names.join('|'), n, twice(4))
        "#;
        let data = json!({"items": [{"name": "a"}, {"name": "b"}]});

        assert_eq!(run(code, data), Ok("name;7a|b38".to_string()));
    }

    #[test]
    fn test_closures_capture_scope() {
        let code = r#"
            function counter() {
                let count = 0
                return () => ++count
            }
            const next = counter()
            next(); next()
            __out(next())
        "#;
        assert_eq!(run(code, json!({})), Ok("3".to_string()));
    }

    #[test]
    fn test_default_and_rest_params() {
        let code = "function f(a, b = 10, ...rest) { return a + b + rest.length }\n\
                    __out(f(1), ' ', f(1, 2, 3, 4))";
        assert_eq!(run(code, json!({})), Ok("11 5".to_string()));
    }

    #[test]
    fn test_assignment_writes_through_data_object() {
        assert_eq!(
            run("count = count + 1\n__out(count)", json!({"count": 1})),
            Ok("2".to_string())
        );
    }

    #[rstest]
    #[case("missing + 1", EvalError::Reference("missing".into()))]
    #[case("user.name", EvalError::type_error("Cannot read properties of null (reading 'name')"))]
    #[case("nope()", EvalError::Reference("nope".into()))]
    #[case("items.nope()", EvalError::type_error("items.nope is not a function"))]
    #[case("(1)()", EvalError::type_error("1 is not a function"))]
    #[case("const c = 1; c = 2", EvalError::type_error("Assignment to constant variable."))]
    #[case(
        "throw new Error('boom')",
        EvalError::Thrown { name: "Error".into(), message: "boom".to_string() }
    )]
    #[case(
        "throw 'plain'",
        EvalError::Thrown { name: "Error".into(), message: "plain".to_string() }
    )]
    fn test_errors(#[case] code: &str, #[case] expected: EvalError) {
        assert_eq!(run(code, json!({"user": null, "items": []})), Err(expected));
    }

    #[test]
    fn test_strict_mode_rejects_implicit_globals() {
        assert_eq!(
            run_with("leaked = 1", json!({}), true, Vec::new()),
            Err(EvalError::Reference("leaked".into()))
        );
        assert_eq!(run("leaked = 1\n__out(leaked)", json!({})), Ok("1".to_string()));
    }

    #[test]
    fn test_call_depth_is_bounded() {
        let handle = std::thread::Builder::new()
            .stack_size(64 * 1024 * 1024)
            .spawn(|| run("function f(n) { return f(n + 1) }\nf(0)", json!({})))
            .unwrap();

        assert_eq!(
            handle.join().unwrap(),
            Err(EvalError::Range("Maximum call stack size exceeded".to_string()))
        );
    }

    #[test]
    fn test_await_resolved_value() {
        let done = Value::pending(async { Ok(Value::from("!")) });
        assert_eq!(
            run_with("__out(await 1, await done)", json!({}), false, vec![("done", done)]),
            Ok("1!".to_string())
        );
    }

    #[test]
    fn test_await_unresolved_value_fails_in_sync_mode() {
        let pending = Value::pending(futures::future::pending());
        assert_eq!(
            run_with("x = await pending", json!({}), false, vec![("pending", pending)]),
            Err(EvalError::runtime(PENDING_AWAIT))
        );
    }

    #[test]
    fn test_await_suspends_in_async_mode() {
        let (sender, receiver) = oneshot::channel::<Value>();
        let later = Value::pending(receiver.map(|received| {
            received.map_err(|_| EvalError::runtime("sender dropped"))
        }));
        let program = Parser::new(tokenize("const v = await later\n__out(v + '!')", 1).unwrap())
            .parse_program()
            .unwrap();
        let output = Rc::new(RefCell::new(OutputBuffer::new()));
        let env = Env::root();
        let sink = Rc::clone(&output);
        env.borrow_mut().define("later", later);
        env.borrow_mut().define(
            "__out",
            Value::function("__out", move |args| {
                sink.borrow_mut().push_str(&args[0].to_string());
                Ok(Value::Undefined)
            }),
        );

        let mut interpreter = Interpreter::new(
            Rc::clone(&output),
            Arc::new(crate::escape::escape_xml),
            false,
            true,
        );
        let mut run = interpreter.run(&program, &env).boxed_local();
        assert!((&mut run).now_or_never().is_none());

        sender.send(Value::from("done")).unwrap();
        assert_eq!(block_on(run), Ok(()));
        env.borrow_mut().clear();
        assert_eq!(output.take().into_text(), Some("done!".to_string()));
    }

    #[test]
    fn test_sort_callback_can_await() {
        let delayed = Value::async_function("delayed", |args| {
            let value = args.first().cloned().unwrap_or_default();
            async move { Ok::<_, EvalError>(value) }.boxed_local()
        });
        assert_eq!(
            run_in_mode(
                "__out([3, 1, 2].sort((a, b) => await delayed(a - b)).join())",
                json!({}),
                false,
                true,
                vec![("delayed", delayed)],
            ),
            Ok("1,2,3".to_string())
        );
    }

    #[rstest]
    #[case("[5, 1, 4, 2, 3, 1].sort((a, b) => a - b).join()", "1,1,2,3,4,5")]
    #[case("[undefined, 'b', 'a'].sort().length", "3")]
    #[case("[undefined, 'b', 'a'].sort()[2]", "")]
    #[case(
        "[{k: 1, n: 'x'}, {k: 0, n: 'y'}, {k: 1, n: 'z'}].sort((a, b) => a.k - b.k).map(o => o.n)",
        "y,x,z"
    )]
    fn test_sort(#[case] expr: &str, #[case] expected: &str) {
        assert_eq!(run(&format!("__out({expr})"), json!({})), Ok(expected.to_string()));
    }

    #[rstest]
    #[case("const a = []; a.length = 4e9")]
    #[case("const a = []; a[4e9] = 1")]
    #[case("const a = [1]; a[16777216] = 1")]
    fn test_array_growth_is_bounded(#[case] code: &str) {
        assert_eq!(
            run(code, json!({})),
            Err(EvalError::Range("Invalid array length".to_string()))
        );
    }

    #[test]
    fn test_array_growth_within_bound() {
        assert_eq!(
            run("const a = []; a[2] = 'x'; a.length = 4\n__out(a.length, a[2])", json!({})),
            Ok("4x".to_string())
        );
    }

    #[rstest]
    #[case(Value::from(1.0), Value::from("1"), true)]
    #[case(Value::Bool(true), Value::from(1.0), true)]
    #[case(Value::Null, Value::from(0.0), false)]
    #[case(Value::array(vec![Value::from(1.0)]), Value::from("1"), true)]
    #[case(Value::Number(f64::NAN), Value::Number(f64::NAN), false)]
    fn test_loose_equals(#[case] a: Value, #[case] b: Value, #[case] expected: bool) {
        assert_eq!(loose_equals(&a, &b), expected);
    }
}
