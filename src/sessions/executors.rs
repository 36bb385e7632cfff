//! Capability modules callable from session scripts.
//!
//! An [`Executor`] exposes a named bundle of callables (an integration
//! connection, a helper library) as a module value. The executors of one
//! session are collected in [`Executors`] and kept in a [`SessionRegistry`]
//! for the lifetime of the session, so activities resolve callables through
//! an explicit session-scoped owner.

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::types::{Connection, SessionId};
use crate::lang::{Bindings, LangError, LangResult, Phase, ProgramError, ProgramErrorKind};
use crate::runs::{RunError, RunHandler, Runs, channel_sink, drive};
use crate::values::{CallFlag, CallValue, ExecutorId, Kwargs, Value};

/// Errors raised while dispatching a call.
#[derive(Debug, Clone, Error)]
pub enum CallError {
    /// No executor with this id in the session.
    #[error("executor '{0}' not found")]
    UnknownExecutor(ExecutorId),

    /// Executor has no such function.
    #[error("'{executor}' has no function '{name}'")]
    UnknownFunction {
        /// Executor searched.
        executor: ExecutorId,
        /// Missing function name.
        name: String,
    },

    /// The session's executors are not registered.
    #[error("no executors registered for session {0}")]
    UnknownSession(SessionId),

    /// Integration not registered.
    #[error("integration '{0}' not found")]
    UnknownIntegration(String),

    /// Structured script-level failure.
    #[error("{0}")]
    Program(ProgramError),

    /// Language failure.
    #[error(transparent)]
    Lang(#[from] LangError),

    /// Run registry failure.
    #[error(transparent)]
    Run(#[from] RunError),

    /// Integration failure.
    #[error("{0}")]
    Failed(String),
}

impl CallError {
    /// Integration failure with a message.
    pub fn failed(message: impl Into<String>) -> Self {
        CallError::Failed(message.into())
    }

    /// Convert into the structured form persisted in attempt records.
    pub fn into_program_error(self) -> ProgramError {
        match self {
            CallError::Program(err) => err,
            CallError::Lang(err) => err.into_program_error(Phase::Call),
            CallError::Run(RunError::Lang(err)) => err.into_program_error(Phase::Call),
            CallError::Failed(message) => {
                ProgramError::new(ProgramErrorKind::Runtime, Phase::Call, message)
            }
            other => ProgramError::new(ProgramErrorKind::Host, Phase::Call, other.to_string()),
        }
    }
}

impl From<ProgramError> for CallError {
    fn from(err: ProgramError) -> Self {
        CallError::Program(err)
    }
}

/// Result alias for call dispatch.
pub type CallResult<T> = Result<T, CallError>;

/// Information handed to a native function.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Calling session.
    pub session_id: SessionId,
    /// Canceled when the call should stop.
    pub cancel: CancellationToken,
}

/// A named bundle of callables.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Executor id; the prefix of every callable it issues.
    fn id(&self) -> &ExecutorId;

    /// Script-facing module value.
    fn value(&self) -> Value;

    /// Invoke one of the executor's functions.
    async fn call(
        &self,
        ctx: CallContext,
        name: &str,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> CallResult<Value>;
}

/// Native function body.
pub type NativeFn = Arc<
    dyn Fn(CallContext, Vec<Value>, Kwargs) -> BoxFuture<'static, CallResult<Value>> + Send + Sync,
>;

struct NativeFunction {
    flags: Vec<CallFlag>,
    body: NativeFn,
}

/// Executor assembled from native closures by a [`ModuleBuilder`].
pub struct NativeModule {
    id: ExecutorId,
    functions: BTreeMap<String, NativeFunction>,
    constants: BTreeMap<String, Value>,
}

#[async_trait]
impl Executor for NativeModule {
    fn id(&self) -> &ExecutorId {
        &self.id
    }

    fn value(&self) -> Value {
        let mut members = self.constants.clone();
        for (name, function) in &self.functions {
            members.insert(
                name.clone(),
                Value::Builtin(CallValue::new(&self.id, name, &function.flags)),
            );
        }
        Value::module(self.id.as_str(), members)
    }

    async fn call(
        &self,
        ctx: CallContext,
        name: &str,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> CallResult<Value> {
        let function = self
            .functions
            .get(name)
            .ok_or_else(|| CallError::UnknownFunction {
                executor: self.id.clone(),
                name: name.to_string(),
            })?;
        trace!(executor = %self.id, function = name, "native call");
        (function.body)(ctx, args, kwargs).await
    }
}

/// Builder for [`NativeModule`].
pub struct ModuleBuilder {
    module: NativeModule,
}

impl ModuleBuilder {
    /// Start a module with the given executor id.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            module: NativeModule {
                id: ExecutorId::new(id),
                functions: BTreeMap::new(),
                constants: BTreeMap::new(),
            },
        }
    }

    /// Add a function.
    pub fn function<F>(mut self, name: &str, flags: &[CallFlag], body: F) -> Self
    where
        F: Fn(CallContext, Vec<Value>, Kwargs) -> BoxFuture<'static, CallResult<Value>>
            + Send
            + Sync
            + 'static,
    {
        self.module.functions.insert(
            name.to_string(),
            NativeFunction {
                flags: flags.to_vec(),
                body: Arc::new(body),
            },
        );
        self
    }

    /// Add a constant member.
    pub fn constant(mut self, name: &str, value: Value) -> Self {
        self.module.constants.insert(name.to_string(), value);
        self
    }

    /// Finish the module.
    pub fn build(self) -> Arc<dyn Executor> {
        Arc::new(self.module)
    }
}

/// Executors available to one session.
#[derive(Default)]
pub struct Executors {
    executors: BTreeMap<ExecutorId, Arc<dyn Executor>>,
}

impl Executors {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an executor, replacing one with the same id.
    pub fn add(&mut self, executor: Arc<dyn Executor>) {
        self.executors.insert(executor.id().clone(), executor);
    }

    /// Look up an executor.
    pub fn get(&self, id: &ExecutorId) -> Option<Arc<dyn Executor>> {
        self.executors.get(id).cloned()
    }

    /// Module values keyed by executor id.
    pub fn values(&self) -> Bindings {
        self.executors
            .iter()
            .map(|(id, executor)| (id.as_str().to_string(), executor.value()))
            .collect()
    }

    /// Dispatch a builtin callable to the executor that issued it.
    pub async fn call(
        &self,
        ctx: CallContext,
        function: &CallValue,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> CallResult<Value> {
        let executor = self
            .get(&function.executor)
            .ok_or_else(|| CallError::UnknownExecutor(function.executor.clone()))?;
        executor.call(ctx, &function.name, args, kwargs).await
    }
}

/// Session-scoped owner of [`Executors`].
///
/// Entries are created when a session starts and removed when its workflow
/// body exits.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<SessionId, Arc<Executors>>>>,
}

impl SessionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session's executors.
    pub fn insert(&self, session_id: &SessionId, executors: Executors) -> Arc<Executors> {
        let executors = Arc::new(executors);
        self.sessions
            .lock()
            .insert(session_id.clone(), executors.clone());
        debug!(%session_id, "session executors registered");
        executors
    }

    /// Executors of a session.
    pub fn get(&self, session_id: &SessionId) -> CallResult<Arc<Executors>> {
        self.sessions
            .lock()
            .get(session_id)
            .cloned()
            .ok_or_else(|| CallError::UnknownSession(session_id.clone()))
    }

    /// Drop a session's executors.
    pub fn remove(&self, session_id: &SessionId) {
        if self.sessions.lock().remove(session_id).is_some() {
            debug!(%session_id, "session executors removed");
        }
    }

    /// Number of registered sessions.
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Whether no session is registered.
    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}

/// Factory producing the executor for one connection.
pub type IntegrationFactory =
    Arc<dyn Fn(&Connection) -> CallResult<Arc<dyn Executor>> + Send + Sync>;

/// Integrations sessions can connect to, by name.
#[derive(Default)]
pub struct IntegrationRegistry {
    factories: RwLock<HashMap<String, IntegrationFactory>>,
}

impl IntegrationRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an integration factory.
    pub fn register<F>(&self, integration: &str, factory: F)
    where
        F: Fn(&Connection) -> CallResult<Arc<dyn Executor>> + Send + Sync + 'static,
    {
        self.factories
            .write()
            .insert(integration.to_string(), Arc::new(factory));
    }

    /// Build the executor for a connection.
    pub fn connect(&self, connection: &Connection) -> CallResult<Arc<dyn Executor>> {
        let factory = self
            .factories
            .read()
            .get(&connection.integration)
            .cloned()
            .ok_or_else(|| CallError::UnknownIntegration(connection.integration.clone()))?;
        factory(connection)
    }
}

/// Invokes a callable value on behalf of a session.
#[async_trait]
pub trait Caller: Send + Sync {
    /// Call `function` with the given arguments.
    async fn call(
        &self,
        cancel: CancellationToken,
        function: &Value,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> CallResult<Value>;
}

/// Function overrides installed by `ak.fake`, keyed by callable unique id.
#[derive(Clone, Default)]
pub struct Fakes(Arc<RwLock<HashMap<String, Value>>>);

impl Fakes {
    /// Install `replacement` for `id`, or remove the override when `None`.
    pub fn set(&self, id: String, replacement: Option<Value>) {
        let mut fakes = self.0.write();
        match replacement {
            Some(replacement) => fakes.insert(id, replacement),
            None => fakes.remove(&id),
        };
    }

    /// The override for `id`, if any.
    pub fn get(&self, id: &str) -> Option<Value> {
        self.0.read().get(id).cloned()
    }

    /// `function` itself unless it has an override.
    pub fn resolve(&self, function: Value) -> Value {
        match function.callable_id().and_then(|id| self.get(id)) {
            Some(replacement) => {
                trace!(%function, %replacement, "calling fake");
                replacement
            }
            None => function,
        }
    }
}

/// [`Caller`] resolving builtins through the [`SessionRegistry`] and language
/// functions through a run in the session's scope.
#[derive(Clone)]
pub struct SessionCaller {
    session_id: SessionId,
    registry: SessionRegistry,
    runs: Runs,
    fakes: Fakes,
}

impl SessionCaller {
    /// Caller for one session.
    pub fn new(session_id: SessionId, registry: SessionRegistry, runs: Runs) -> Self {
        Self {
            session_id,
            registry,
            runs,
            fakes: Fakes::default(),
        }
    }

    /// Apply the session's fakes to calls made from inside function runs.
    pub fn with_fakes(mut self, fakes: Fakes) -> Self {
        self.fakes = fakes;
        self
    }

    async fn call_function(
        &self,
        cancel: CancellationToken,
        function: &Value,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> CallResult<Value> {
        let (sink, mut updates) = channel_sink();
        let run = self
            .runs
            .call_function(
                &cancel,
                None,
                self.session_id.as_str(),
                function,
                args,
                kwargs,
                sink,
            )
            .await?;
        let handler = NestedCalls {
            caller: self,
            cancel: run.cancel_token(),
        };
        let state = drive(&run, &mut updates, &handler).await;
        self.runs.discard(run.id())?;
        match state?.into_outcome(Phase::Call) {
            Some(outcome) => Ok(outcome.map(|(_, value)| value)?),
            None => Err(CallError::failed("run ended without a final state")),
        }
    }
}

#[async_trait]
impl Caller for SessionCaller {
    async fn call(
        &self,
        cancel: CancellationToken,
        function: &Value,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> CallResult<Value> {
        match function {
            Value::Builtin(call) if call.has_flag(CallFlag::Privileged) => {
                Err(CallError::Program(ProgramError::new(
                    ProgramErrorKind::NotCallable,
                    Phase::Call,
                    format!("{} can only be called from the session's top level", call.unique_id),
                )))
            }
            Value::Builtin(call) => {
                let executors = self.registry.get(&self.session_id)?;
                let ctx = CallContext {
                    session_id: self.session_id.clone(),
                    cancel,
                };
                executors.call(ctx, call, args, kwargs).await
            }
            Value::Function(_) => self.call_function(cancel, function, args, kwargs).await,
            other => Err(CallError::Program(ProgramError::new(
                ProgramErrorKind::NotCallable,
                Phase::Call,
                format!("{} is not callable", other.type_name()),
            ))),
        }
    }
}

/// Answers the suspensions of a function run started by [`SessionCaller`].
struct NestedCalls<'a> {
    caller: &'a SessionCaller,
    cancel: CancellationToken,
}

#[async_trait]
impl RunHandler for NestedCalls<'_> {
    async fn load(&self, path: &str) -> LangResult<Bindings> {
        Err(LangError::NotFound(format!(
            "module '{}' (loads are only resolved at module top level)",
            path
        )))
    }

    async fn call(&self, function: Value, args: Vec<Value>, kwargs: Kwargs) -> LangResult<Value> {
        let function = self.caller.fakes.resolve(function);
        self.caller
            .call(self.cancel.clone(), &function, args, kwargs)
            .await
            .map_err(|err| LangError::Program(err.into_program_error()))
    }

    async fn print(&self, text: &str) -> LangResult<()> {
        debug!(session_id = %self.caller.session_id, text, "print");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CatalogConfig;
    use crate::lang::Lang;
    use crate::lang::catalog::Catalog;
    use crate::lang::sexpr::SexprLang;
    use futures::FutureExt;

    fn math() -> Arc<dyn Executor> {
        ModuleBuilder::new("math")
            .function("add", &[CallFlag::Pure], |_ctx, args, _kwargs| {
                async move {
                    let mut total = 0;
                    for arg in args {
                        total += arg
                            .as_integer()
                            .ok_or_else(|| CallError::failed("add expects integers"))?;
                    }
                    Ok(Value::Integer(total))
                }
                .boxed()
            })
            .function("sub", &[CallFlag::Pure], |_ctx, args, _kwargs| {
                async move {
                    match args.as_slice() {
                        [Value::Integer(a), Value::Integer(b)] => Ok(Value::Integer(a - b)),
                        _ => Err(CallError::failed("sub expects two integers")),
                    }
                }
                .boxed()
            })
            .constant("zero", Value::Integer(0))
            .build()
    }

    fn ctx() -> CallContext {
        CallContext {
            session_id: SessionId::from("s"),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn executors_dispatch_by_callable() {
        let mut executors = Executors::new();
        executors.add(math());
        let value = executors.values().remove("math").unwrap();
        let Some(Value::Builtin(add)) = value.member("add").cloned() else {
            panic!("add is not a builtin");
        };
        assert!(add.has_flag(CallFlag::Pure));
        assert_eq!(value.member("zero"), Some(&Value::Integer(0)));

        let sum = executors
            .call(ctx(), &add, vec![Value::Integer(2), Value::Integer(3)], Kwargs::new())
            .await
            .unwrap();
        assert_eq!(sum, Value::Integer(5));

        let err = executors
            .call(ctx(), &add, vec![Value::None], Kwargs::new())
            .await
            .unwrap_err();
        assert_eq!(err.into_program_error().kind, ProgramErrorKind::Runtime);

        let missing = CallValue::new(&ExecutorId::new("math"), "mul", &[]);
        assert!(matches!(
            executors.call(ctx(), &missing, vec![], Kwargs::new()).await,
            Err(CallError::UnknownFunction { .. })
        ));
    }

    #[test]
    fn registry_entries_are_scoped_to_sessions() {
        let registry = SessionRegistry::new();
        let id = SessionId::from("s");
        registry.insert(&id, Executors::new());
        assert!(registry.get(&id).is_ok());
        registry.remove(&id);
        assert!(registry.is_empty());
        assert!(matches!(registry.get(&id), Err(CallError::UnknownSession(_))));
    }

    #[test]
    fn unknown_integrations_are_reported() {
        let integrations = IntegrationRegistry::new();
        integrations.register("math", |_conn| Ok(math()));
        let mut conn = Connection {
            connection_id: "c1".into(),
            name: "calc".into(),
            integration: "math".into(),
            config: BTreeMap::new(),
        };
        assert!(integrations.connect(&conn).is_ok());
        conn.integration = "nope".into();
        assert!(matches!(
            integrations.connect(&conn),
            Err(CallError::UnknownIntegration(_))
        ));
    }

    #[tokio::test]
    async fn language_functions_run_in_the_session_scope() {
        let catalog = Arc::new(Catalog::with_builtin_langs(&CatalogConfig::default()));
        let runs = Runs::new(catalog.clone());
        let registry = SessionRegistry::new();
        let session_id = SessionId::from("s");
        let mut executors = Executors::new();
        executors.add(math());
        let values = registry.insert(&session_id, executors).values();

        // define the function in the scope's cached instance
        let lang = catalog.acquire("sexpr", "s").unwrap();
        let module = SexprLang::new()
            .compile_module("lib.sx", b"(defn twice [n] (math.add n n))", &["math".into()])
            .await
            .unwrap();
        let env = crate::lang::RunEnv::new("s").with_predecls(values.clone());
        let (bindings, _) = lang
            .run_module(CancellationToken::new(), env, &module)
            .await
            .unwrap();

        let caller = SessionCaller::new(session_id, registry, runs.clone());
        let result = caller
            .call(
                CancellationToken::new(),
                &bindings["twice"],
                vec![Value::Integer(21)],
                Kwargs::new(),
            )
            .await
            .unwrap();
        assert_eq!(result, Value::Integer(42));
        assert!(runs.list().values().all(Vec::is_empty));

        let err = caller
            .call(CancellationToken::new(), &Value::Integer(1), vec![], Kwargs::new())
            .await
            .unwrap_err();
        assert_eq!(err.into_program_error().kind, ProgramErrorKind::NotCallable);

        let fakes = Fakes::default();
        let sub = values["math"].member("sub").cloned().unwrap();
        fakes.set("math.add".into(), Some(sub));
        let faked = caller.clone().with_fakes(fakes.clone());
        let result = faked
            .call(
                CancellationToken::new(),
                &bindings["twice"],
                vec![Value::Integer(21)],
                Kwargs::new(),
            )
            .await
            .unwrap();
        assert_eq!(result, Value::Integer(0));

        fakes.set("math.add".into(), None);
        let result = faked
            .call(
                CancellationToken::new(),
                &bindings["twice"],
                vec![Value::Integer(21)],
                Kwargs::new(),
            )
            .await
            .unwrap();
        assert_eq!(result, Value::Integer(42));
    }
}
