//! Async tree-walking evaluator.
//!
//! Every recursive entry point returns a [`BoxFuture`] borrowing the
//! interpreter mutably, so a snippet runs as one future on a single task.
//! Statement blocks and expressions poll under a stack guard, so nesting
//! depth is bounded by the recursion limit rather than the thread's stack.
//! Locks on shared containers are never held across an `.await`.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use indexmap::IndexMap;

use crate::ast::{
    Arg, BinOp, BoolOp, CmpOp, Comprehension, Expr, ExprKind, FStringPart, FunctionDef, Handler,
    Literal, Stmt, StmtKind, Target, UnaryOp,
};
use crate::builtins::{self, Builtin, Module};
use crate::engine::Limits;
use crate::error::{Exception, ExceptionKind, ExecResult};
use crate::format::render_field;
use crate::host::{Bindings, CallArgs, Namespace, OutputSink, Stream};
use crate::ops::{self, iterate};
use crate::stack::{Guarded, grow};
use crate::value::{Awaitable, Function, Key, Pending, Value, lock};

/// One level of local variables.
pub(crate) struct Scope {
    vars: Mutex<HashMap<String, Value>>,
    parent: Option<Arc<Scope>>,
}

impl Scope {
    pub(crate) fn new(parent: Option<Arc<Self>>) -> Arc<Self> {
        Arc::new(Self {
            vars: Mutex::new(HashMap::new()),
            parent,
        })
    }

    fn lookup(&self, name: &str) -> Option<Value> {
        if let Some(value) = lock(&self.vars).get(name).cloned() {
            return Some(value);
        }
        self.parent.as_ref().and_then(|parent| parent.lookup(name))
    }

    fn set(&self, name: &str, value: Value) {
        lock(&self.vars).insert(name.to_owned(), value);
    }

    fn remove(&self, name: &str) -> bool {
        lock(&self.vars).remove(name).is_some()
    }

    fn clear(&self) {
        let vars = std::mem::take(&mut *lock(&self.vars));
        drop(vars);
    }
}

/// How a statement finished.
enum Flow {
    Normal,
    Break,
    Continue,
    Return(Option<Value>),
}

type Items = Box<dyn Iterator<Item = Value> + Send>;

pub(crate) struct Interpreter {
    globals: Bindings,
    sink: Arc<dyn OutputSink>,
    limits: Limits,
    depth: usize,
    ticks: u32,
    handling: Vec<Exception>,
    captured: Vec<Weak<Scope>>,
}

impl Drop for Interpreter {
    // Functions keep their defining scope alive and scopes hold functions,
    // so captured scopes are emptied once the run is over.
    fn drop(&mut self) {
        for scope in self.captured.drain(..) {
            if let Some(scope) = scope.upgrade() {
                scope.clear();
            }
        }
    }
}

fn name_error(name: &str) -> Exception {
    Exception::new(
        ExceptionKind::NameError,
        format!("name '{name}' is not defined"),
    )
}

fn quoted_list(names: &[&str]) -> String {
    let quoted: Vec<String> = names.iter().map(|name| format!("'{name}'")).collect();
    match quoted.split_last() {
        Some((last, rest)) if !rest.is_empty() => format!("{} and {last}", rest.join(", ")),
        Some((last, _)) => last.clone(),
        None => String::new(),
    }
}

fn items_of(value: Value) -> ExecResult<Items> {
    Ok(match value {
        Value::Range(range) => Box::new(range.iter().map(Value::Int)),
        other => Box::new(iterate(&other)?.into_iter()),
    })
}

fn unpack(value: &Value, count: usize) -> ExecResult<Vec<Value>> {
    let items = iterate(value).map_err(|_| {
        Exception::type_error(format!(
            "cannot unpack non-iterable {} object",
            value.type_name()
        ))
    })?;
    match items.len().cmp(&count) {
        Ordering::Greater => Err(Exception::value_error(format!(
            "too many values to unpack (expected {count})"
        ))),
        Ordering::Less => Err(Exception::value_error(format!(
            "not enough values to unpack (expected {count}, got {})",
            items.len()
        ))),
        Ordering::Equal => Ok(items),
    }
}

fn slice_bound(value: &Value) -> ExecResult<Option<i64>> {
    match value {
        Value::None => Ok(None),
        other => other.as_int().map(Some).ok_or_else(|| {
            Exception::type_error(
                "slice indices must be integers or None or have an __index__ method",
            )
        }),
    }
}

fn compare_values(op: CmpOp, left: &Value, right: &Value) -> ExecResult<bool> {
    let ordered = |expected: &[Ordering]| -> ExecResult<bool> {
        Ok(ops::compare(left, right, op.symbol())?.is_some_and(|o| expected.contains(&o)))
    };
    match op {
        CmpOp::Eq => Ok(ops::equals(left, right)),
        CmpOp::NotEq => Ok(!ops::equals(left, right)),
        CmpOp::Lt => ordered(&[Ordering::Less]),
        CmpOp::LtE => ordered(&[Ordering::Less, Ordering::Equal]),
        CmpOp::Gt => ordered(&[Ordering::Greater]),
        CmpOp::GtE => ordered(&[Ordering::Greater, Ordering::Equal]),
        CmpOp::In => ops::contains(right, left),
        CmpOp::NotIn => ops::contains(right, left).map(|found| !found),
        CmpOp::Is => Ok(left.is_same(right)),
        CmpOp::IsNot => Ok(!left.is_same(right)),
    }
}

fn in_place(op: BinOp, current: Value, operand: &Value) -> ExecResult<Value> {
    if let (BinOp::Add, Value::List(items)) = (op, &current) {
        let extra = iterate(operand)?;
        lock(items).extend(extra);
        return Ok(current);
    }
    ops::binary(op, &current, operand)
}

fn is_less(left: &Value, right: &Value, reverse: bool) -> ExecResult<bool> {
    let ordering = if reverse {
        ops::compare(right, left, "<")?
    } else {
        ops::compare(left, right, "<")?
    };
    Ok(ordering == Some(Ordering::Less))
}

/// Stable merge sort over `(key, item)` pairs with a fallible comparison.
fn merge_sort(pairs: Vec<(Value, Value)>, reverse: bool) -> ExecResult<Vec<(Value, Value)>> {
    if pairs.len() <= 1 {
        return Ok(pairs);
    }
    let mut left = pairs;
    let right = left.split_off(left.len() / 2);
    let left = merge_sort(left, reverse)?;
    let right = merge_sort(right, reverse)?;

    let mut merged = Vec::with_capacity(left.len() + right.len());
    let mut left = left.into_iter().peekable();
    let mut right = right.into_iter().peekable();
    while let (Some(l), Some(r)) = (left.peek(), right.peek()) {
        let next = if is_less(&r.0, &l.0, reverse)? {
            right.next()
        } else {
            left.next()
        };
        merged.extend(next);
    }
    merged.extend(left);
    merged.extend(right);
    Ok(merged)
}

impl Interpreter {
    pub(crate) fn new(globals: Bindings, sink: Arc<dyn OutputSink>, limits: Limits) -> Self {
        Self {
            globals,
            sink,
            limits,
            depth: 0,
            ticks: 0,
            handling: Vec::new(),
            captured: Vec::new(),
        }
    }

    /// Runs a snippet body. `Ok(None)` means the body produced no result.
    pub(crate) async fn run(&mut self, body: &[Stmt]) -> ExecResult<Option<Value>> {
        let scope = Scope::new(None);
        self.capture(&scope);
        match self.exec_block(body, &scope).await? {
            Flow::Return(value) => Ok(value),
            Flow::Normal | Flow::Break | Flow::Continue => Ok(None),
        }
    }

    fn capture(&mut self, scope: &Arc<Scope>) {
        let seen = self
            .captured
            .last()
            .is_some_and(|last| std::ptr::eq(last.as_ptr(), Arc::as_ptr(scope)));
        if !seen {
            self.captured.push(Arc::downgrade(scope));
        }
    }

    async fn tick(&mut self) {
        self.ticks += 1;
        if self.ticks >= self.limits.yield_interval.max(1) {
            self.ticks = 0;
            tokio::task::yield_now().await;
        }
    }

    /// The global namespace that extends `module` with capabilities, if any.
    fn extended_module(&self, module: Module) -> Option<Arc<Namespace>> {
        match self.globals.get(module.name()) {
            Some(Value::Namespace(namespace)) if namespace.module() == Some(module) => {
                Some(Arc::clone(namespace))
            }
            _ => None,
        }
    }

    fn lookup(&self, name: &str, scope: &Scope) -> ExecResult<Value> {
        scope
            .lookup(name)
            .or_else(|| self.globals.get(name).cloned())
            .ok_or_else(|| name_error(name))
    }

    fn exec_block<'a>(
        &'a mut self,
        body: &'a [Stmt],
        scope: &'a Arc<Scope>,
    ) -> Guarded<'a, ExecResult<Flow>> {
        let step = async move {
            for stmt in body {
                let flow = self
                    .exec_stmt(stmt, scope)
                    .await
                    .map_err(|err| err.at_line(stmt.line))?;
                if !matches!(flow, Flow::Normal) {
                    return Ok(flow);
                }
            }
            Ok(Flow::Normal)
        };
        grow(step.boxed())
    }

    async fn exec_stmt(&mut self, stmt: &Stmt, scope: &Arc<Scope>) -> ExecResult<Flow> {
        match &stmt.kind {
            StmtKind::Expr(expr) => {
                self.eval(expr, scope).await?;
            }
            StmtKind::Assign { targets, value } => {
                let value = self.eval(value, scope).await?;
                for target in targets {
                    self.assign(target, value.clone(), scope).await?;
                }
            }
            StmtKind::AugAssign { target, op, value } => {
                self.augmented_assign(target, *op, value, scope).await?;
            }
            StmtKind::If { branches, orelse } => {
                for (test, body) in branches {
                    if self.eval(test, scope).await?.is_truthy() {
                        return self.exec_block(body, scope).await;
                    }
                }
                return self.exec_block(orelse, scope).await;
            }
            StmtKind::While { test, body } => loop {
                self.tick().await;
                if !self.eval(test, scope).await?.is_truthy() {
                    break;
                }
                match self.exec_block(body, scope).await? {
                    Flow::Break => break,
                    Flow::Normal | Flow::Continue => {}
                    flow @ Flow::Return(_) => return Ok(flow),
                }
            },
            StmtKind::For { target, iter, body } => {
                let iterable = self.eval(iter, scope).await?;
                for item in items_of(iterable)? {
                    self.tick().await;
                    self.assign(target, item, scope).await?;
                    match self.exec_block(body, scope).await? {
                        Flow::Break => break,
                        Flow::Normal | Flow::Continue => {}
                        flow @ Flow::Return(_) => return Ok(flow),
                    }
                }
            }
            StmtKind::Try {
                body,
                handlers,
                orelse,
                finalbody,
            } => return self.exec_try(body, handlers, orelse, finalbody, scope).await,
            StmtKind::Raise(None) => {
                return Err(self.handling.last().cloned().unwrap_or_else(|| {
                    Exception::runtime_error("No active exception to reraise")
                }));
            }
            StmtKind::Raise(Some(expr)) => {
                let raised = self.eval(expr, scope).await?;
                return Err(match raised {
                    Value::Exception(exc) => Exception::clone(&exc),
                    Value::ExceptionType(kind) => Exception::new(kind, ""),
                    _ => Exception::type_error("exceptions must derive from BaseException"),
                });
            }
            StmtKind::Return(None) => return Ok(Flow::Return(None)),
            StmtKind::Return(Some(expr)) => {
                let value = self.eval(expr, scope).await?;
                return Ok(Flow::Return(Some(value)));
            }
            StmtKind::FunctionDef(def) => {
                let function = self.make_function(def, scope).await?;
                scope.set(&def.name, function);
            }
            StmtKind::Import(names) => {
                for (name, alias) in names {
                    let module = Module::by_name(name).ok_or_else(|| {
                        Exception::new(
                            ExceptionKind::ImportError,
                            format!("No module named '{name}'"),
                        )
                    })?;
                    let value = self
                        .extended_module(module)
                        .map_or(Value::Module(module), Value::Namespace);
                    scope.set(alias.as_deref().unwrap_or(name), value);
                }
            }
            StmtKind::ImportFrom { module, names } => {
                let found = Module::by_name(module).ok_or_else(|| {
                    Exception::new(
                        ExceptionKind::ImportError,
                        format!("No module named '{module}'"),
                    )
                })?;
                let extended = self.extended_module(found);
                for (name, alias) in names {
                    let value = match &extended {
                        Some(namespace) => namespace.member(name),
                        None => found.attribute(name),
                    };
                    let value = value.map_err(|_| {
                        Exception::new(
                            ExceptionKind::ImportError,
                            format!("cannot import name '{name}' from '{module}'"),
                        )
                    })?;
                    scope.set(alias.as_deref().unwrap_or(name), value);
                }
            }
            StmtKind::Delete(targets) => {
                for target in targets {
                    self.delete(target, scope).await?;
                }
            }
            StmtKind::Assert { test, msg } => {
                if !self.eval(test, scope).await?.is_truthy() {
                    let message = match msg {
                        Some(msg) => self.eval(msg, scope).await?.to_str(),
                        None => String::new(),
                    };
                    return Err(Exception::new(ExceptionKind::AssertionError, message));
                }
            }
            StmtKind::Pass => {}
            StmtKind::Break => return Ok(Flow::Break),
            StmtKind::Continue => return Ok(Flow::Continue),
        }
        Ok(Flow::Normal)
    }

    async fn exec_try(
        &mut self,
        body: &[Stmt],
        handlers: &[Handler],
        orelse: &[Stmt],
        finalbody: &[Stmt],
        scope: &Arc<Scope>,
    ) -> ExecResult<Flow> {
        let mut result = match self.exec_block(body, scope).await {
            Ok(Flow::Normal) => self.exec_block(orelse, scope).await,
            Ok(flow) => Ok(flow),
            Err(exc) => self.handle(exc, handlers, scope).await,
        };
        if !finalbody.is_empty() {
            let flow = self.exec_block(finalbody, scope).await?;
            if !matches!(flow, Flow::Normal) {
                result = Ok(flow);
            }
        }
        result
    }

    async fn handle(
        &mut self,
        exc: Exception,
        handlers: &[Handler],
        scope: &Arc<Scope>,
    ) -> ExecResult<Flow> {
        for handler in handlers {
            let matched = match &handler.types {
                None => true,
                Some(types) => {
                    let class = self.eval(types, scope).await?;
                    self.matches_class(&exc, &class)?
                }
            };
            if !matched {
                continue;
            }
            if let Some(name) = &handler.name {
                scope.set(name, Value::from(exc.clone()));
            }
            self.handling.push(exc);
            let flow = self.exec_block(&handler.body, scope).await;
            self.handling.pop();
            return flow;
        }
        Err(exc)
    }

    fn matches_class(&self, exc: &Exception, class: &Value) -> ExecResult<bool> {
        match class {
            Value::ExceptionType(kind) => Ok(exc.kind().is_subclass_of(*kind)),
            Value::Tuple(classes) => {
                for class in classes.iter() {
                    if self.matches_class(exc, class)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            _ => Err(Exception::type_error(
                "catching classes that do not inherit from BaseException is not allowed",
            )),
        }
    }

    async fn make_function(&mut self, def: &Arc<FunctionDef>, scope: &Arc<Scope>) -> ExecResult<Value> {
        let mut defaults = Vec::with_capacity(def.params.len());
        for param in &def.params {
            defaults.push(match &param.default {
                Some(expr) => Some(self.eval(expr, scope).await?),
                None => None,
            });
        }
        self.capture(scope);
        Ok(Value::Function(Arc::new(Function {
            def: Arc::clone(def),
            defaults,
            closure: Arc::clone(scope),
        })))
    }

    fn assign<'a>(
        &'a mut self,
        target: &'a Target,
        value: Value,
        scope: &'a Arc<Scope>,
    ) -> BoxFuture<'a, ExecResult<()>> {
        async move {
            match target {
                Target::Name(name) => scope.set(name, value),
                Target::Subscript { value: container, index } => {
                    let container = self.eval(container, scope).await?;
                    if matches!(index.kind, ExprKind::Slice { .. }) {
                        return Err(Exception::type_error("slice assignment is not supported"));
                    }
                    let index = self.eval(index, scope).await?;
                    ops::set_item(&container, &index, value)?;
                }
                Target::Tuple(targets) => {
                    let items = unpack(&value, targets.len())?;
                    for (target, item) in targets.iter().zip(items) {
                        self.assign(target, item, scope).await?;
                    }
                }
            }
            Ok(())
        }
        .boxed()
    }

    async fn augmented_assign(
        &mut self,
        target: &Target,
        op: BinOp,
        value: &Expr,
        scope: &Arc<Scope>,
    ) -> ExecResult<()> {
        match target {
            Target::Name(name) => {
                let current = self.lookup(name, scope)?;
                let operand = self.eval(value, scope).await?;
                scope.set(name, in_place(op, current, &operand)?);
            }
            Target::Subscript { value: container, index } => {
                let container = self.eval(container, scope).await?;
                let index = self.eval(index, scope).await?;
                let current = ops::get_item(&container, &index)?;
                let operand = self.eval(value, scope).await?;
                ops::set_item(&container, &index, in_place(op, current, &operand)?)?;
            }
            Target::Tuple(_) => {
                return Err(Exception::type_error(
                    "illegal expression for augmented assignment",
                ));
            }
        }
        Ok(())
    }

    fn delete<'a>(&'a mut self, target: &'a Target, scope: &'a Arc<Scope>) -> BoxFuture<'a, ExecResult<()>> {
        async move {
            match target {
                Target::Name(name) => {
                    if !scope.remove(name) {
                        return Err(name_error(name));
                    }
                }
                Target::Subscript { value, index } => {
                    let container = self.eval(value, scope).await?;
                    let index = self.eval(index, scope).await?;
                    ops::delete_item(&container, &index)?;
                }
                Target::Tuple(targets) => {
                    for target in targets {
                        self.delete(target, scope).await?;
                    }
                }
            }
            Ok(())
        }
        .boxed()
    }

    fn eval<'a>(&'a mut self, expr: &'a Expr, scope: &'a Arc<Scope>) -> Guarded<'a, ExecResult<Value>> {
        let step = async move {
            match &expr.kind {
                ExprKind::Literal(literal) => Ok(match literal {
                    Literal::None => Value::None,
                    Literal::Bool(b) => Value::Bool(*b),
                    Literal::Int(i) => Value::Int(*i),
                    Literal::Float(f) => Value::Float(*f),
                    Literal::Str(s) => Value::Str(s.clone()),
                }),
                ExprKind::FString(parts) => {
                    let mut out = String::new();
                    for part in parts {
                        match part {
                            FStringPart::Text(text) => out.push_str(text),
                            FStringPart::Field {
                                expr,
                                conversion,
                                spec,
                            } => {
                                let value = self.eval(expr, scope).await?;
                                out.push_str(&render_field(&value, *conversion, spec)?);
                            }
                        }
                    }
                    Ok(Value::Str(out))
                }
                ExprKind::Name(name) => self.lookup(name, scope),
                ExprKind::List(items) => Ok(Value::list(self.eval_all(items, scope).await?)),
                ExprKind::Tuple(items) => Ok(Value::tuple(self.eval_all(items, scope).await?)),
                ExprKind::Dict(pairs) => {
                    let mut entries = IndexMap::with_capacity(pairs.len());
                    for (key, value) in pairs {
                        let key = Key::from_value(&self.eval(key, scope).await?)?;
                        let value = self.eval(value, scope).await?;
                        entries.insert(key, value);
                    }
                    Ok(Value::dict(entries))
                }
                ExprKind::ListComp { elt, generators } => {
                    let inner = Scope::new(Some(Arc::clone(scope)));
                    let mut out = Vec::new();
                    self.comprehend(generators, elt, None, &inner, &mut out).await?;
                    Ok(Value::list(out.into_iter().map(|(item, _)| item).collect()))
                }
                ExprKind::DictComp {
                    key,
                    value,
                    generators,
                } => {
                    let inner = Scope::new(Some(Arc::clone(scope)));
                    let mut out = Vec::new();
                    self.comprehend(generators, key, Some(&**value), &inner, &mut out)
                        .await?;
                    let mut entries = IndexMap::with_capacity(out.len());
                    for (key, value) in out {
                        entries.insert(Key::from_value(&key)?, value.unwrap_or_default());
                    }
                    Ok(Value::dict(entries))
                }
                ExprKind::BinOp { op, left, right } => {
                    let left = self.eval(left, scope).await?;
                    let right = self.eval(right, scope).await?;
                    ops::binary(*op, &left, &right)
                }
                ExprKind::Unary { op, operand } => {
                    let operand = self.eval(operand, scope).await?;
                    match op {
                        UnaryOp::Neg => ops::negate(&operand),
                        UnaryOp::Pos => ops::positive(&operand),
                        UnaryOp::Not => Ok(Value::Bool(!operand.is_truthy())),
                    }
                }
                ExprKind::BoolOp { op, left, right } => {
                    let left = self.eval(left, scope).await?;
                    let short_circuit = match op {
                        BoolOp::And => !left.is_truthy(),
                        BoolOp::Or => left.is_truthy(),
                    };
                    if short_circuit {
                        Ok(left)
                    } else {
                        self.eval(right, scope).await
                    }
                }
                ExprKind::Compare { left, ops } => {
                    let mut current = self.eval(left, scope).await?;
                    for (op, right) in ops {
                        let right = self.eval(right, scope).await?;
                        if !compare_values(*op, &current, &right)? {
                            return Ok(Value::Bool(false));
                        }
                        current = right;
                    }
                    Ok(Value::Bool(true))
                }
                ExprKind::IfExp { test, body, orelse } => {
                    if self.eval(test, scope).await?.is_truthy() {
                        self.eval(body, scope).await
                    } else {
                        self.eval(orelse, scope).await
                    }
                }
                ExprKind::Call { func, args } => {
                    let callee = self.eval(func, scope).await?;
                    let args = self.eval_args(args, scope).await?;
                    self.call_value(callee, args).await
                }
                ExprKind::Attribute { value, attr } => {
                    let value = self.eval(value, scope).await?;
                    builtins::get_attribute(&value, attr)
                }
                ExprKind::Subscript { value, index } => {
                    let container = self.eval(value, scope).await?;
                    if let ExprKind::Slice { lower, upper, step } = &index.kind {
                        let mut bounds = [None, None, None];
                        for (bound, expr) in bounds.iter_mut().zip([lower, upper, step]) {
                            if let Some(expr) = expr {
                                *bound = slice_bound(&self.eval(expr, scope).await?)?;
                            }
                        }
                        let [lower, upper, step] = bounds;
                        return ops::get_slice(&container, lower, upper, step);
                    }
                    let index = self.eval(index, scope).await?;
                    ops::get_item(&container, &index)
                }
                ExprKind::Slice { .. } => {
                    Err(Exception::type_error("slices are only supported inside subscripts"))
                }
                ExprKind::Await(inner) => {
                    let value = self.eval(inner, scope).await?;
                    self.await_value(value).await
                }
                ExprKind::Lambda(def) => self.make_function(def, scope).await,
            }
        };
        grow(step.boxed())
    }

    async fn eval_all(&mut self, exprs: &[Expr], scope: &Arc<Scope>) -> ExecResult<Vec<Value>> {
        let mut values = Vec::with_capacity(exprs.len());
        for expr in exprs {
            values.push(self.eval(expr, scope).await?);
        }
        Ok(values)
    }

    async fn eval_args(&mut self, args: &[Arg], scope: &Arc<Scope>) -> ExecResult<CallArgs> {
        let mut call = CallArgs::new();
        for arg in args {
            match arg {
                Arg::Positional(expr) => call.positional.push(self.eval(expr, scope).await?),
                Arg::Star(expr) => {
                    let value = self.eval(expr, scope).await?;
                    call.positional.extend(iterate(&value)?);
                }
                Arg::Keyword(name, expr) => {
                    let value = self.eval(expr, scope).await?;
                    Self::add_keyword(&mut call, name.clone(), value)?;
                }
                Arg::DoubleStar(expr) => {
                    let value = self.eval(expr, scope).await?;
                    let Value::Dict(entries) = &value else {
                        return Err(Exception::type_error(format!(
                            "argument after ** must be a mapping, not {}",
                            value.type_name()
                        )));
                    };
                    let snapshot: Vec<(Key, Value)> = lock(entries)
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect();
                    for (key, value) in snapshot {
                        let Key::Str(name) = key else {
                            return Err(Exception::type_error("keywords must be strings"));
                        };
                        Self::add_keyword(&mut call, name, value)?;
                    }
                }
            }
        }
        Ok(call)
    }

    fn add_keyword(call: &mut CallArgs, name: String, value: Value) -> ExecResult<()> {
        if call.keywords.contains_key(&name) {
            return Err(Exception::type_error(format!(
                "got multiple values for keyword argument '{name}'"
            )));
        }
        call.keywords.insert(name, value);
        Ok(())
    }

    fn comprehend<'a>(
        &'a mut self,
        generators: &'a [Comprehension],
        elt: &'a Expr,
        value: Option<&'a Expr>,
        scope: &'a Arc<Scope>,
        out: &'a mut Vec<(Value, Option<Value>)>,
    ) -> BoxFuture<'a, ExecResult<()>> {
        async move {
            let Some((first, rest)) = generators.split_first() else {
                let item = self.eval(elt, scope).await?;
                let paired = match value {
                    Some(expr) => Some(self.eval(expr, scope).await?),
                    None => None,
                };
                ops::ensure_size(out.len() + 1)?;
                out.push((item, paired));
                return Ok(());
            };
            let iterable = self.eval(&first.iter, scope).await?;
            'items: for item in items_of(iterable)? {
                self.tick().await;
                self.assign(&first.target, item, scope).await?;
                for condition in &first.conditions {
                    if !self.eval(condition, scope).await?.is_truthy() {
                        continue 'items;
                    }
                }
                self.comprehend(rest, elt, value, scope, out).await?;
            }
            Ok(())
        }
        .boxed()
    }

    fn call_value(&mut self, callee: Value, args: CallArgs) -> BoxFuture<'_, ExecResult<Value>> {
        async move {
            match callee {
                Value::Function(function) if function.def.is_async => {
                    let label = function.name().to_owned();
                    Ok(Value::Awaitable(Awaitable::new(
                        &label,
                        Pending::Coroutine { function, args },
                    )))
                }
                Value::Function(function) => self.call_function(&function, args).await,
                Value::Builtin(builtin) => self.call_builtin(builtin, args).await,
                Value::Method(method) => {
                    self.call_method(&method.receiver, &method.name, args).await
                }
                Value::Host(function) => {
                    let label = function.name().to_owned();
                    Ok(Value::Awaitable(Awaitable::new(
                        &label,
                        Pending::Host { function, args },
                    )))
                }
                Value::Native(function) => function.call(args),
                Value::ExceptionType(kind) => {
                    args.reject_keywords(kind.name())?;
                    let message = match args.positional.as_slice() {
                        [] => String::new(),
                        [single] => single.to_str(),
                        many => Value::tuple(many.to_vec()).repr(),
                    };
                    Ok(Value::from(Exception::new(kind, message)))
                }
                other => Err(Exception::type_error(format!(
                    "'{}' object is not callable",
                    other.type_name()
                ))),
            }
        }
        .boxed()
    }

    async fn call_function(&mut self, function: &Arc<Function>, args: CallArgs) -> ExecResult<Value> {
        if self.depth >= self.limits.recursion_limit {
            return Err(Exception::new(
                ExceptionKind::RecursionError,
                "maximum recursion depth exceeded",
            ));
        }
        self.tick().await;
        let local = Scope::new(Some(Arc::clone(&function.closure)));
        bind_parameters(function, args, &local)?;
        self.depth += 1;
        let flow = self.exec_block(&function.def.body, &local).await;
        self.depth -= 1;
        match flow? {
            Flow::Return(value) => Ok(value.unwrap_or_default()),
            Flow::Normal | Flow::Break | Flow::Continue => Ok(Value::None),
        }
    }

    async fn call_builtin(&mut self, builtin: Builtin, mut args: CallArgs) -> ExecResult<Value> {
        match builtin {
            Builtin::Print => {
                let text_option = |value: Option<Value>, default: &str, name: &str| match value {
                    None | Some(Value::None) => Ok(default.to_owned()),
                    Some(Value::Str(s)) => Ok(s),
                    Some(other) => Err(Exception::type_error(format!(
                        "{name} must be None or a string, not {}",
                        other.type_name()
                    ))),
                };
                let sep = text_option(args.take_keyword("sep"), " ", "sep")?;
                let end = text_option(args.take_keyword("end"), "\n", "end")?;
                let stream = match args.take_keyword("file") {
                    None | Some(Value::None) => Stream::Stdout,
                    Some(Value::Stream(stream)) => stream,
                    Some(other) => {
                        return Err(Exception::new(
                            ExceptionKind::AttributeError,
                            format!("'{}' object has no attribute 'write'", other.type_name()),
                        ));
                    }
                };
                args.take_keyword("flush");
                args.reject_keywords("print")?;
                let pieces: Vec<String> = args.positional.iter().map(Value::to_str).collect();
                let text = format!("{}{end}", pieces.join(&sep));
                self.sink.write(stream, &text);
                Ok(Value::None)
            }
            Builtin::Map => {
                args.reject_keywords("map")?;
                if args.positional.len() < 2 {
                    return Err(Exception::type_error("map() must have at least two arguments."));
                }
                let mut positional = args.positional.into_iter();
                let function = positional.next().unwrap_or_default();
                let columns = positional
                    .map(|iterable| iterate(&iterable))
                    .collect::<ExecResult<Vec<_>>>()?;
                let rows = columns.iter().map(Vec::len).min().unwrap_or(0);
                let mut out = Vec::with_capacity(rows);
                for row in 0..rows {
                    let row_args = columns.iter().map(|column| column[row].clone()).collect();
                    out.push(
                        self.call_value(function.clone(), CallArgs::positional(row_args))
                            .await?,
                    );
                }
                Ok(Value::list(out))
            }
            Builtin::Filter => {
                args.reject_keywords("filter")?;
                args.expect_positional("filter", 2, 2)?;
                let function = args.positional[0].clone();
                let mut out = Vec::new();
                for item in iterate(&args.positional[1])? {
                    let keep = if matches!(function, Value::None) {
                        item.is_truthy()
                    } else {
                        self.call_value(function.clone(), CallArgs::positional(vec![item.clone()]))
                            .await?
                            .is_truthy()
                    };
                    if keep {
                        out.push(item);
                    }
                }
                Ok(Value::list(out))
            }
            Builtin::Sorted => {
                let key = args.take_keyword("key");
                let reverse = args.take_keyword("reverse");
                args.reject_keywords("sorted")?;
                args.expect_positional("sorted", 1, 1)?;
                let items = iterate(&args.positional[0])?;
                Ok(Value::list(self.sort_items(items, key, reverse).await?))
            }
            Builtin::Min | Builtin::Max => {
                let name = builtin.name();
                let key = args.take_keyword("key");
                let default = args.take_keyword("default");
                args.reject_keywords(name)?;
                let items = match args.positional.len() {
                    0 => {
                        return Err(Exception::type_error(format!(
                            "{name} expected at least 1 argument, got 0"
                        )));
                    }
                    1 => iterate(&args.positional[0])?,
                    _ => args.positional,
                };
                let wanted = if builtin == Builtin::Min {
                    Ordering::Less
                } else {
                    Ordering::Greater
                };
                let mut best: Option<(Value, Value)> = None;
                for item in items {
                    let rank = self.sort_key(key.as_ref(), &item).await?;
                    let replace = match &best {
                        None => true,
                        Some((best_rank, _)) => {
                            ops::compare(&rank, best_rank, if wanted == Ordering::Less { "<" } else { ">" })?
                                == Some(wanted)
                        }
                    };
                    if replace {
                        best = Some((rank, item));
                    }
                }
                match (best, default) {
                    (Some((_, item)), _) => Ok(item),
                    (None, Some(default)) => Ok(default),
                    (None, None) => Err(Exception::value_error(format!(
                        "{name}() iterable argument is empty"
                    ))),
                }
            }
            other => builtins::call(other, args),
        }
    }

    async fn sort_key(&mut self, key: Option<&Value>, item: &Value) -> ExecResult<Value> {
        match key {
            None | Some(Value::None) => Ok(item.clone()),
            Some(function) => {
                self.call_value(function.clone(), CallArgs::positional(vec![item.clone()]))
                    .await
            }
        }
    }

    async fn sort_items(
        &mut self,
        items: Vec<Value>,
        key: Option<Value>,
        reverse: Option<Value>,
    ) -> ExecResult<Vec<Value>> {
        let reverse = reverse.is_some_and(|value| value.is_truthy());
        let mut pairs = Vec::with_capacity(items.len());
        for item in items {
            let rank = self.sort_key(key.as_ref(), &item).await?;
            pairs.push((rank, item));
        }
        Ok(merge_sort(pairs, reverse)?
            .into_iter()
            .map(|(_, item)| item)
            .collect())
    }

    async fn call_method(&mut self, receiver: &Value, name: &str, mut args: CallArgs) -> ExecResult<Value> {
        match (receiver, name) {
            (Value::List(items), "sort") => {
                let key = args.take_keyword("key");
                let reverse = args.take_keyword("reverse");
                args.reject_keywords("sort")?;
                args.expect_positional("sort", 0, 0)?;
                let snapshot = lock(items).clone();
                let sorted = self.sort_items(snapshot, key, reverse).await?;
                *lock(items) = sorted;
                Ok(Value::None)
            }
            (Value::Stream(stream), "write") => {
                args.reject_keywords("write")?;
                args.expect_positional("write", 1, 1)?;
                let Value::Str(text) = &args.positional[0] else {
                    return Err(Exception::type_error(format!(
                        "write() argument must be str, not {}",
                        args.positional[0].type_name()
                    )));
                };
                self.sink.write(*stream, text);
                Ok(Value::Int(
                    i64::try_from(text.chars().count()).unwrap_or(i64::MAX),
                ))
            }
            (Value::Stream(_), "flush") => Ok(Value::None),
            _ => builtins::call_method(receiver, name, args),
        }
    }

    fn await_value(&mut self, value: Value) -> BoxFuture<'_, ExecResult<Value>> {
        async move {
            let Value::Awaitable(awaitable) = value else {
                return Err(Exception::type_error(format!(
                    "object {} can't be used in 'await' expression",
                    value.type_name()
                )));
            };
            let pending = awaitable.take()?;
            self.drive(pending).await
        }
        .boxed()
    }

    fn drive(&mut self, pending: Pending) -> BoxFuture<'_, ExecResult<Value>> {
        async move {
            match pending {
                Pending::Host { function, args } => function.call(args).await,
                Pending::Coroutine { function, args } => self.call_function(&function, args).await,
                Pending::Sleep(delay) => {
                    if delay.is_zero() {
                        tokio::task::yield_now().await;
                    } else {
                        tokio::time::sleep(delay).await;
                    }
                    Ok(Value::None)
                }
                Pending::Gather(items) => self.gather(items).await,
            }
        }
        .boxed()
    }

    /// Host work runs concurrently; snippet coroutines run one after another.
    async fn gather(&mut self, items: Vec<Value>) -> ExecResult<Value> {
        let mut pendings = Vec::with_capacity(items.len());
        for item in items {
            let Value::Awaitable(awaitable) = item else {
                return Err(Exception::type_error(
                    "An asyncio.Future, a coroutine or an awaitable is required",
                ));
            };
            pendings.push(awaitable.take()?);
        }

        let mut results: Vec<Option<ExecResult<Value>>> = vec![None; pendings.len()];
        let mut host = Vec::new();
        let mut local = Vec::new();
        for (index, pending) in pendings.into_iter().enumerate() {
            match pending {
                Pending::Host { function, args } => host.push(
                    async move { (index, function.call(args).await) }.boxed(),
                ),
                Pending::Sleep(delay) => host.push(
                    async move {
                        tokio::time::sleep(delay).await;
                        (index, Ok(Value::None))
                    }
                    .boxed(),
                ),
                other => local.push((index, other)),
            }
        }
        for (index, result) in join_all(host).await {
            results[index] = Some(result);
        }
        for (index, pending) in local {
            results[index] = Some(self.drive(pending).await);
        }

        let mut values = Vec::with_capacity(results.len());
        for result in results {
            values.push(result.unwrap_or(Ok(Value::None))?);
        }
        Ok(Value::list(values))
    }
}

fn bind_parameters(function: &Function, args: CallArgs, local: &Scope) -> ExecResult<()> {
    let def = &function.def;
    let name = def.name.as_str();
    let CallArgs {
        positional,
        mut keywords,
    } = args;
    let declared = def.params.len();
    let given = positional.len();
    if given > declared && def.vararg.is_none() {
        let plural = if declared == 1 { "" } else { "s" };
        let verb = if given == 1 { "was" } else { "were" };
        return Err(Exception::type_error(format!(
            "{name}() takes {declared} positional argument{plural} but {given} {verb} given"
        )));
    }

    let mut positional = positional.into_iter();
    let mut missing = Vec::new();
    for (i, param) in def.params.iter().enumerate() {
        if i < given {
            if keywords.contains_key(&param.name) {
                return Err(Exception::type_error(format!(
                    "{name}() got multiple values for argument '{}'",
                    param.name
                )));
            }
            local.set(&param.name, positional.next().unwrap_or_default());
        } else if let Some(value) = keywords.shift_remove(&param.name) {
            local.set(&param.name, value);
        } else if let Some(Some(default)) = function.defaults.get(i) {
            local.set(&param.name, default.clone());
        } else {
            missing.push(param.name.as_str());
        }
    }
    if !missing.is_empty() {
        let plural = if missing.len() == 1 { "" } else { "s" };
        return Err(Exception::type_error(format!(
            "{name}() missing {} required positional argument{plural}: {}",
            missing.len(),
            quoted_list(&missing)
        )));
    }

    if let Some(vararg) = &def.vararg {
        local.set(vararg, Value::tuple(positional.collect()));
    }
    match &def.kwarg {
        Some(kwarg) => {
            let entries = keywords
                .into_iter()
                .map(|(key, value)| (Key::Str(key), value))
                .collect();
            local.set(kwarg, Value::dict(entries));
        }
        None => {
            if let Some(unexpected) = keywords.keys().next() {
                return Err(Exception::type_error(format!(
                    "{name}() got an unexpected keyword argument '{unexpected}'"
                )));
            }
        }
    }
    Ok(())
}
