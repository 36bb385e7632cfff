//! Tree-walking evaluator.
//!
//! An [`Interpreter`] runs on a blocking thread. Host callbacks from the
//! [`RunEnv`] are awaited with [`Handle::block_on`] so that the interpreter
//! thread is suspended exactly at a load or call until the host answers.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::ast::{CompiledProgram, Expr, ExprKind, Span};
use super::builtins;
use super::native::{Closure, Frame, FunctionTable};
use super::resolve::{SPECIAL_FORMS, root_name};
use super::LANG_NAME;
use crate::lang::{
    Bindings, CallFrame, LangError, LangResult, Phase, ProgramError, ProgramErrorKind, RunEnv,
    RunSummary,
};
use crate::values::{FunctionValue, Kwargs, Value};

type EvalResult<T> = std::result::Result<T, ProgramError>;

const MAX_DEPTH: usize = 200;

struct StackEntry {
    name: String,
    path: String,
    span: Span,
}

/// One execution of module code or a function call.
pub struct Interpreter {
    table: Arc<Mutex<FunctionTable>>,
    env: RunEnv,
    cancel: CancellationToken,
    handle: Handle,
    phase: Phase,
    stack: Vec<StackEntry>,
    summary: RunSummary,
}

impl Interpreter {
    /// Create an interpreter bound to a function table and environment.
    pub fn new(
        table: Arc<Mutex<FunctionTable>>,
        env: RunEnv,
        cancel: CancellationToken,
        handle: Handle,
        phase: Phase,
    ) -> Self {
        Self {
            table,
            env: env.with_stubs(),
            cancel,
            handle,
            phase,
            stack: Vec::new(),
            summary: RunSummary::default(),
        }
    }

    /// Run a module's loads and top-level forms, returning its bindings.
    pub fn run_module(mut self, program: &CompiledProgram) -> LangResult<(Bindings, RunSummary)> {
        let globals = Frame::root();
        for (name, value) in &self.env.predecls {
            globals.define(name, value.clone());
        }
        let mut hidden: Vec<String> = self.env.predecls.keys().cloned().collect();

        self.stack.push(StackEntry {
            name: "<toplevel>".to_string(),
            path: program.path.clone(),
            span: Span { line: 1, col: 1 },
        });

        for load in &program.loads {
            self.set_span(load.span);
            self.check_canceled()?;
            trace!(path = %load.path, "loading module");
            self.summary.record("load", load.path.clone());
            let fut = self.env.load(load.path.clone());
            let bindings = self.block_on(fut)?;
            for name in &load.names {
                let value = bindings.get(name).cloned().ok_or_else(|| {
                    self.error(
                        ProgramErrorKind::Resolution,
                        format!("module '{}' has no binding '{}'", load.path, name),
                    )
                })?;
                globals.define(name, value);
                hidden.push(name.clone());
            }
            if let Some(alias) = &load.alias {
                globals.define(alias, Value::module(load.path.clone(), bindings));
                hidden.push(alias.clone());
            }
        }

        for form in &program.forms {
            self.eval(form, &globals)?;
        }

        let bindings = globals
            .snapshot()
            .into_iter()
            .filter(|(name, _)| !name.starts_with('_') && !hidden.contains(name))
            .collect();
        Ok((bindings, self.summary))
    }

    /// Call a function value previously handed out by this language instance.
    pub fn call_function(
        mut self,
        func: &FunctionValue,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> LangResult<(Value, RunSummary)> {
        let closure = self.table.lock().lookup(&self.env.scope, func)?;
        let value = self.call_closure(&closure, args, kwargs)?;
        Ok((value, self.summary))
    }

    fn set_span(&mut self, span: Span) {
        if let Some(top) = self.stack.last_mut() {
            top.span = span;
        }
    }

    fn frames(&self) -> Vec<CallFrame> {
        self.stack
            .iter()
            .map(|entry| CallFrame {
                name: entry.name.clone(),
                path: entry.path.clone(),
                line: entry.span.line,
                col: entry.span.col,
            })
            .collect()
    }

    fn error(&self, kind: ProgramErrorKind, message: impl Into<String>) -> ProgramError {
        ProgramError::new(kind, self.phase, message).with_frames(self.frames())
    }

    fn runtime(&self, message: impl Into<String>) -> ProgramError {
        self.error(ProgramErrorKind::Runtime, message)
    }

    fn check_canceled(&self) -> EvalResult<()> {
        if self.cancel.is_cancelled() {
            Err(self.error(ProgramErrorKind::Canceled, "context canceled"))
        } else {
            Ok(())
        }
    }

    /// Wait for a host callback, giving up as soon as the run is canceled.
    fn block_on<T>(&self, fut: BoxFuture<'static, LangResult<T>>) -> EvalResult<T> {
        let cancel = self.cancel.clone();
        let phase = self.phase;
        let result = self.handle.block_on(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(LangError::canceled(phase, "context canceled")),
                result = fut => result,
            }
        });
        result.map_err(|err| self.host_error(err))
    }

    fn host_error(&self, err: LangError) -> ProgramError {
        match err {
            LangError::Program(mut inner) => {
                if inner.frames.is_empty() {
                    inner.frames = self.frames();
                }
                inner.phase = self.phase;
                inner
            }
            other => self.error(ProgramErrorKind::Host, other.to_string()),
        }
    }

    fn eval(&mut self, expr: &Expr, frame: &Arc<Frame>) -> EvalResult<Value> {
        self.check_canceled()?;
        match &expr.kind {
            ExprKind::Nil => Ok(Value::None),
            ExprKind::Integer(num) => Ok(Value::Integer(*num)),
            ExprKind::Float(num) => Ok(Value::Float(*num)),
            ExprKind::Boolean(flag) => Ok(Value::Boolean(*flag)),
            ExprKind::String(text) => Ok(Value::String(text.clone())),
            ExprKind::Keyword(kw) => Ok(Value::Symbol(kw.clone())),
            ExprKind::Symbol(sym) => {
                self.set_span(expr.span);
                self.lookup(sym, frame)
            }
            ExprKind::Vector(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.eval(item, frame)?);
                }
                Ok(Value::List(out))
            }
            ExprKind::Map(items) => {
                let mut pairs = Vec::with_capacity(items.len() / 2);
                for pair in items.chunks(2) {
                    let key = self.eval(&pair[0], frame)?;
                    let value = self.eval(&pair[1], frame)?;
                    pairs.push((key, value));
                }
                Ok(Value::dict(pairs))
            }
            ExprKind::List(items) => self.eval_form(expr, items, frame),
        }
    }

    fn lookup(&self, sym: &str, frame: &Arc<Frame>) -> EvalResult<Value> {
        let root = root_name(sym);
        let mut value = frame.get(root).ok_or_else(|| {
            if builtins::is_builtin(root) {
                self.runtime(format!("builtin '{}' can only be called", root))
            } else {
                self.error(ProgramErrorKind::Resolution, format!("undefined: {}", root))
            }
        })?;
        if root.len() < sym.len() {
            for member in sym[root.len() + 1..].split('.') {
                value = value.member(member).cloned().ok_or_else(|| {
                    self.runtime(format!("{} has no member '{}'", value.type_name(), member))
                })?;
            }
        }
        Ok(value)
    }

    fn eval_body(&mut self, body: &[Expr], frame: &Arc<Frame>) -> EvalResult<Value> {
        let mut last = Value::None;
        for expr in body {
            last = self.eval(expr, frame)?;
        }
        Ok(last)
    }

    fn eval_form(&mut self, expr: &Expr, items: &[Expr], frame: &Arc<Frame>) -> EvalResult<Value> {
        self.set_span(expr.span);
        let Some(head) = items.first() else {
            return Err(self.runtime("empty form"));
        };
        let head_sym = head.as_symbol().filter(|h| !frame.contains(root_name(h)));

        if let Some(special) = head_sym.filter(|h| SPECIAL_FORMS.contains(h)) {
            return self.eval_special(special, expr, items, frame);
        }

        let (args, kwargs) = self.eval_args(&items[1..], frame)?;
        self.set_span(expr.span);

        if let Some(name) = head_sym.filter(|h| builtins::is_builtin(h)) {
            return match name {
                "print" => {
                    let text = builtins::render(&args);
                    self.summary.record("print", text.clone());
                    let fut = self.env.print(text);
                    self.block_on(fut)?;
                    Ok(Value::None)
                }
                "fail" => Err(self.runtime(builtins::render(&args))),
                _ => builtins::call(name, args, kwargs).map_err(|msg| self.runtime(msg)),
            };
        }

        let callee = self.eval(head, frame)?;
        self.set_span(expr.span);
        self.apply(callee, args, kwargs)
    }

    fn eval_args(
        &mut self,
        items: &[Expr],
        frame: &Arc<Frame>,
    ) -> EvalResult<(Vec<Value>, Kwargs)> {
        let mut args = Vec::new();
        let mut kwargs = Kwargs::new();
        let mut iter = items.iter();
        while let Some(item) = iter.next() {
            if let ExprKind::Keyword(name) = &item.kind {
                let value_expr = iter.next().ok_or_else(|| {
                    self.runtime(format!("keyword argument :{} has no value", name))
                })?;
                let value = self.eval(value_expr, frame)?;
                if kwargs.insert(name.clone(), value).is_some() {
                    return Err(self.runtime(format!("duplicate keyword argument :{}", name)));
                }
            } else {
                args.push(self.eval(item, frame)?);
            }
        }
        Ok((args, kwargs))
    }

    fn apply(&mut self, callee: Value, args: Vec<Value>, kwargs: Kwargs) -> EvalResult<Value> {
        if let Value::Function(func) = &callee {
            if func.lang == LANG_NAME {
                let closure = self
                    .table
                    .lock()
                    .lookup(&self.env.scope, func)
                    .map_err(|e| self.runtime(e.to_string()))?;
                return self.call_closure(&closure, args, kwargs);
            }
        }
        if !matches!(callee, Value::Function(_) | Value::Builtin(_)) {
            return Err(self.runtime(format!("{} is not callable", callee.type_name())));
        }
        trace!(callee = %callee, "external call");
        self.summary.record("call", callee.to_string());
        let fut = self.env.call(callee, args, kwargs);
        self.block_on(fut)
    }

    fn call_closure(
        &mut self,
        closure: &Closure,
        args: Vec<Value>,
        mut kwargs: Kwargs,
    ) -> EvalResult<Value> {
        if self.stack.len() >= MAX_DEPTH {
            return Err(self.runtime("maximum recursion depth exceeded"));
        }
        if args.len() > closure.params.len() {
            return Err(self.runtime(format!(
                "{} takes {} arguments, got {}",
                closure.name,
                closure.params.len(),
                args.len()
            )));
        }

        let frame = Frame::child(&closure.env);
        let mut args = args.into_iter();
        for param in &closure.params {
            let value = match args.next() {
                Some(value) => {
                    if kwargs.contains_key(param) {
                        return Err(self.runtime(format!(
                            "{} got multiple values for '{}'",
                            closure.name, param
                        )));
                    }
                    value
                }
                None => kwargs.remove(param).ok_or_else(|| {
                    self.runtime(format!("{} missing argument '{}'", closure.name, param))
                })?,
            };
            frame.define(param, value);
        }
        if let Some(extra) = kwargs.keys().next() {
            return Err(self.runtime(format!(
                "{} got an unexpected keyword argument '{}'",
                closure.name, extra
            )));
        }

        self.stack.push(StackEntry {
            name: closure.name.clone(),
            path: closure.path.clone(),
            span: closure.span,
        });
        let result = self.eval_body(&closure.body, &frame);
        self.stack.pop();
        result
    }

    fn make_closure(
        &self,
        name: &str,
        params_expr: &Expr,
        body: &[Expr],
        frame: &Arc<Frame>,
        span: Span,
    ) -> EvalResult<Value> {
        let params = match &params_expr.kind {
            ExprKind::Vector(items) => items
                .iter()
                .filter_map(|p| p.as_symbol().map(str::to_string))
                .collect(),
            _ => return Err(self.runtime("expected a parameter vector")),
        };
        let path = self
            .stack
            .last()
            .map(|entry| entry.path.clone())
            .unwrap_or_default();
        let closure = Closure {
            name: name.to_string(),
            params,
            body: body.to_vec(),
            env: frame.clone(),
            path,
            span,
        };
        Ok(self.table.lock().insert(&self.env.scope, closure))
    }

    fn symbol_arg<'e>(&self, expr: &'e Expr) -> EvalResult<&'e str> {
        expr.as_symbol()
            .ok_or_else(|| self.runtime("expected a symbol"))
    }

    fn eval_special(
        &mut self,
        special: &str,
        expr: &Expr,
        items: &[Expr],
        frame: &Arc<Frame>,
    ) -> EvalResult<Value> {
        match special {
            "def" => {
                let name = self.symbol_arg(&items[1])?;
                let value = self.eval(&items[2], frame)?;
                frame.define(name, value);
                Ok(Value::None)
            }
            "defn" => {
                let name = self.symbol_arg(&items[1])?;
                let value = self.make_closure(name, &items[2], &items[3..], frame, expr.span)?;
                frame.define(name, value);
                Ok(Value::None)
            }
            "fn" => self.make_closure("<lambda>", &items[1], &items[2..], frame, expr.span),
            "if" => {
                let cond = self.eval(&items[1], frame)?;
                if builtins::truthy(&cond) {
                    self.eval(&items[2], frame)
                } else if let Some(otherwise) = items.get(3) {
                    self.eval(otherwise, frame)
                } else {
                    Ok(Value::None)
                }
            }
            "when" => {
                let cond = self.eval(&items[1], frame)?;
                if builtins::truthy(&cond) {
                    self.eval_body(&items[2..], frame)
                } else {
                    Ok(Value::None)
                }
            }
            "do" => self.eval_body(&items[1..], frame),
            "and" => {
                let mut last = Value::Boolean(true);
                for item in &items[1..] {
                    last = self.eval(item, frame)?;
                    if !builtins::truthy(&last) {
                        break;
                    }
                }
                Ok(last)
            }
            "or" => {
                let mut last = Value::Boolean(false);
                for item in &items[1..] {
                    last = self.eval(item, frame)?;
                    if builtins::truthy(&last) {
                        break;
                    }
                }
                Ok(last)
            }
            "let" => {
                let ExprKind::Vector(pairs) = &items[1].kind else {
                    return Err(self.runtime("expected a binding vector"));
                };
                let inner = Frame::child(frame);
                for pair in pairs.chunks(2) {
                    let name = self.symbol_arg(&pair[0])?;
                    let value = self.eval(&pair[1], &inner)?;
                    inner.define(name, value);
                }
                self.eval_body(&items[2..], &inner)
            }
            "for" => {
                let ExprKind::Vector(pairs) = &items[1].kind else {
                    return Err(self.runtime("expected a binding vector"));
                };
                let name = self.symbol_arg(&pairs[0])?;
                let coll = self.eval(&pairs[1], frame)?;
                let elems = match coll {
                    Value::List(items) | Value::Set(items) => items,
                    Value::Dict(items) => items.into_iter().map(|item| item.key).collect(),
                    Value::String(text) => text
                        .chars()
                        .map(|c| Value::String(c.to_string()))
                        .collect(),
                    other => {
                        return Err(self.runtime(format!("cannot iterate {}", other.type_name())));
                    }
                };
                let mut out = Vec::with_capacity(elems.len());
                for elem in elems {
                    let inner = Frame::child(frame);
                    inner.define(name, elem);
                    out.push(self.eval_body(&items[2..], &inner)?);
                }
                Ok(Value::List(out))
            }
            "set!" => {
                let name = self.symbol_arg(&items[1])?;
                let value = self.eval(&items[2], frame)?;
                if frame.set(name, value) {
                    Ok(Value::None)
                } else {
                    Err(self.error(ProgramErrorKind::Resolution, format!("undefined: {}", name)))
                }
            }
            other => Err(self.runtime(format!("{} is not allowed here", other))),
        }
    }
}
