//! Run environment injected into language runtimes.
//!
//! A language never talks to the outside world directly: loading another
//! module, calling an external capability and printing all go through the
//! callbacks carried by [`RunEnv`].

use futures::FutureExt;
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;

use super::Bindings;
use super::error::{LangError, LangResult};
use crate::values::{Kwargs, Value};

/// Print callback.
pub type PrintFn = Arc<dyn Fn(String) -> BoxFuture<'static, LangResult<()>> + Send + Sync>;

/// Module load callback, returning the loaded module's bindings.
pub type LoadFn = Arc<dyn Fn(String) -> BoxFuture<'static, LangResult<Bindings>> + Send + Sync>;

/// External call callback.
pub type CallFn =
    Arc<dyn Fn(Value, Vec<Value>, Kwargs) -> BoxFuture<'static, LangResult<Value>> + Send + Sync>;

/// Scope, predeclared bindings and host callbacks for one execution.
#[derive(Clone, Default)]
pub struct RunEnv {
    /// Scope identifier; unique per durable workflow instance.
    pub scope: String,
    /// Bindings made available to the module.
    pub predecls: Bindings,
    print: Option<PrintFn>,
    load: Option<LoadFn>,
    call: Option<CallFn>,
}

impl fmt::Debug for RunEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunEnv")
            .field("scope", &self.scope)
            .field("predecls", &self.predecls.keys().collect::<Vec<_>>())
            .field("print", &self.print.is_some())
            .field("load", &self.load.is_some())
            .field("call", &self.call.is_some())
            .finish()
    }
}

impl RunEnv {
    /// Create an environment for a scope with no callbacks.
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            ..Default::default()
        }
    }

    /// Set predeclared bindings.
    pub fn with_predecls(mut self, predecls: Bindings) -> Self {
        self.predecls = predecls;
        self
    }

    /// Set the print callback.
    pub fn with_print<F>(mut self, f: F) -> Self
    where
        F: Fn(String) -> BoxFuture<'static, LangResult<()>> + Send + Sync + 'static,
    {
        self.print = Some(Arc::new(f));
        self
    }

    /// Set the load callback.
    pub fn with_load<F>(mut self, f: F) -> Self
    where
        F: Fn(String) -> BoxFuture<'static, LangResult<Bindings>> + Send + Sync + 'static,
    {
        self.load = Some(Arc::new(f));
        self
    }

    /// Set the call callback.
    pub fn with_call<F>(mut self, f: F) -> Self
    where
        F: Fn(Value, Vec<Value>, Kwargs) -> BoxFuture<'static, LangResult<Value>>
            + Send
            + Sync
            + 'static,
    {
        self.call = Some(Arc::new(f));
        self
    }

    /// Fill every missing callback with a stub.
    ///
    /// Stub print discards output, stub load and stub call fail with
    /// [`LangError::NotFound`].
    pub fn with_stubs(mut self) -> Self {
        if self.print.is_none() {
            self.print = Some(stub_print());
        }
        if self.load.is_none() {
            self.load = Some(stub_load());
        }
        if self.call.is_none() {
            self.call = Some(stub_call());
        }
        self
    }

    /// Whether all callbacks are set.
    pub fn is_complete(&self) -> bool {
        self.print.is_some() && self.load.is_some() && self.call.is_some()
    }

    /// Invoke the print callback.
    pub fn print(&self, text: String) -> BoxFuture<'static, LangResult<()>> {
        self.print.clone().unwrap_or_else(stub_print)(text)
    }

    /// Invoke the load callback.
    pub fn load(&self, path: String) -> BoxFuture<'static, LangResult<Bindings>> {
        self.load.clone().unwrap_or_else(stub_load)(path)
    }

    /// Invoke the call callback.
    pub fn call(
        &self,
        func: Value,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> BoxFuture<'static, LangResult<Value>> {
        self.call.clone().unwrap_or_else(stub_call)(func, args, kwargs)
    }
}

fn stub_print() -> PrintFn {
    Arc::new(|_text: String| -> BoxFuture<'static, LangResult<()>> { async { Ok(()) }.boxed() })
}

fn stub_load() -> LoadFn {
    Arc::new(|path: String| -> BoxFuture<'static, LangResult<Bindings>> {
        async move { Err(LangError::NotFound(format!("module '{}'", path))) }.boxed()
    })
}

fn stub_call() -> CallFn {
    Arc::new(
        |func: Value, _args: Vec<Value>, _kwargs: Kwargs| -> BoxFuture<'static, LangResult<Value>> {
            async move { Err(LangError::NotFound(format!("callable {}", func))) }.boxed()
        },
    )
}
