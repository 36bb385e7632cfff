//! Session workflow.
//!
//! A session runs its build's entry point inside one durable workflow. The
//! workflow owns the run handler answering every load, call and print of the
//! script: loads resolve against the build, privileged builtins (`ak`, `time`,
//! `store`) execute in workflow code, and every other call goes through the
//! session call engine. Session state transitions are recorded as side
//! effects so a replay rebuilds the same history without touching the store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use super::calls::SessionCalls;
use super::executors::{Executors, Fakes, IntegrationRegistry, SessionCaller, SessionRegistry};
use super::syscalls::{self, Subscription, SyscallError};
use super::types::{
    Build, Session, SessionCallAttemptResult, SessionCallSpec, SessionId, SessionState,
};
use crate::config::EngineConfig;
use crate::durable::{HistoryEvent, SignalRouter, WorkflowContext, WorkflowError, WorkflowResult};
use crate::lang::catalog::Catalog;
use crate::lang::{
    Bindings, LangError, LangResult, Module, Phase, ProgramError, ProgramErrorKind,
};
use crate::runs::{RunError, RunHandler, RunId, Runs, channel_sink, drive};
use crate::store::SessionStore;
use crate::values::{CallFlag, Kwargs, Value};

/// Names every session module may reference without declaring them.
pub const GLOBAL_MODULES: &[&str] = &["ak", "env", "store", "time"];

/// Final state and recorded history of a workflow execution.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    /// State the session ended in.
    pub state: SessionState,
    /// Workflow history; pass it to [`SessionWorker::run_session`] to replay.
    pub history: Vec<HistoryEvent>,
}

/// Compile sources into a build.
///
/// The language of each module is chosen by its extension. Modules are
/// compiled with [`GLOBAL_MODULES`] plus `connections` as predeclared names.
pub async fn compile_build(
    catalog: &Catalog,
    build_id: &str,
    sources: &BTreeMap<String, Vec<u8>>,
    connections: &[String],
) -> LangResult<Build> {
    let predecls: Vec<String> = GLOBAL_MODULES
        .iter()
        .map(|name| name.to_string())
        .chain(connections.iter().cloned())
        .collect();
    let mut modules = BTreeMap::new();
    for (path, src) in sources {
        let lang_name = catalog
            .lang_for_path(path)
            .ok_or_else(|| LangError::NotFound(format!("language for '{}'", path)))?;
        let lang = catalog.acquire(&lang_name, "")?;
        let module = lang.compile_module(path, src, &predecls).await?;
        modules.insert(path.clone(), module);
    }
    Ok(Build {
        build_id: build_id.to_string(),
        modules,
    })
}

struct WorkerInner {
    runs: Runs,
    store: Arc<dyn SessionStore>,
    integrations: Arc<IntegrationRegistry>,
    registry: SessionRegistry,
    router: SignalRouter,
    config: EngineConfig,
    shutdown: CancellationToken,
    active: Mutex<HashMap<SessionId, CancellationToken>>,
    stop_reasons: Mutex<HashMap<SessionId, String>>,
}

/// Executes session workflows and owns their shared dependencies.
#[derive(Clone)]
pub struct SessionWorker {
    inner: Arc<WorkerInner>,
}

impl SessionWorker {
    /// Create a worker.
    pub fn new(
        runs: Runs,
        store: Arc<dyn SessionStore>,
        integrations: Arc<IntegrationRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                runs,
                store,
                integrations,
                registry: SessionRegistry::new(),
                router: SignalRouter::new(),
                config,
                shutdown: CancellationToken::new(),
                active: Mutex::new(HashMap::new()),
                stop_reasons: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Run registry used for every session.
    pub fn runs(&self) -> &Runs {
        &self.inner.runs
    }

    /// Persisted state.
    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.inner.store
    }

    /// Routes signals to running session workflows.
    pub fn router(&self) -> &SignalRouter {
        &self.inner.router
    }

    /// Executors of running sessions.
    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    /// Ids of sessions whose workflow is executing here.
    pub fn active_sessions(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.inner.active.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Record a new session and start its workflow.
    pub async fn start_session(
        &self,
        session: Session,
    ) -> WorkflowResult<JoinHandle<WorkflowResult<SessionOutcome>>> {
        self.inner.store.create_session(&session).await?;
        let worker = self.clone();
        let session_id = session.session_id.clone();
        info!(%session_id, entrypoint = %session.entrypoint.path, "session created");
        Ok(tokio::spawn(async move {
            worker.run_session(&session_id, Vec::new()).await
        }))
    }

    /// Execute a recorded session's workflow, replaying `history` first.
    ///
    /// Script failures end the session in an error state and still return
    /// `Ok`; only infrastructure failures return `Err`.
    pub async fn run_session(
        &self,
        session_id: &SessionId,
        history: Vec<HistoryEvent>,
    ) -> WorkflowResult<SessionOutcome> {
        let cancel = self.inner.shutdown.child_token();
        self.inner
            .active
            .lock()
            .insert(session_id.clone(), cancel.clone());
        let ctx = WorkflowContext::replay(session_id.as_str(), history, cancel);
        self.inner.router.register(ctx.signal_sender());

        let span = info_span!("session", %session_id);
        let result = self.execute(&ctx, session_id).instrument(span).await;

        self.inner.router.unregister(session_id.as_str());
        self.inner.registry.remove(session_id);
        self.inner.runs.catalog().release(session_id.as_str());
        self.inner.active.lock().remove(session_id);
        self.inner.stop_reasons.lock().remove(session_id);

        match &result {
            Ok(state) => info!(%session_id, state = state.name(), "session workflow finished"),
            Err(err) => warn!(%session_id, error = %err, "session workflow failed"),
        }
        result.map(|state| SessionOutcome {
            state,
            history: ctx.history(),
        })
    }

    /// Cancel a running session; returns `false` if it is not running here.
    pub fn stop_session(&self, session_id: &SessionId, reason: &str) -> bool {
        let token = self.inner.active.lock().get(session_id).cloned();
        match token {
            Some(token) => {
                self.inner
                    .stop_reasons
                    .lock()
                    .insert(session_id.clone(), reason.to_string());
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every running session.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    async fn execute(
        &self,
        ctx: &WorkflowContext,
        session_id: &SessionId,
    ) -> WorkflowResult<SessionState> {
        let store = self.inner.store.clone();
        let session: Session = ctx
            .execute_local_activity("get_session", || async {
                Ok::<_, WorkflowError>(store.get_session(session_id).await?)
            })
            .await?;
        let build: Build = ctx
            .execute_local_activity("get_build", || async {
                Ok::<_, WorkflowError>(store.get_build(&session.build_id).await?)
            })
            .await?;

        let workflow = SessionWorkflow::new(self.clone(), ctx.clone(), session, build);
        workflow
            .record_state(|at| SessionState::Running { at, run_id: None })
            .await?;

        // deterministic modules first, then privileged globals, then connections
        let mut predecls = Bindings::new();
        predecls.insert("env".into(), syscalls::env_module(&workflow.session.env_vars));
        predecls.extend(syscalls::global_modules());

        let mut executors = Executors::new();
        for connection in &workflow.session.connections {
            match self.inner.integrations.connect(connection) {
                Ok(executor) => {
                    predecls.insert(connection.name.clone(), executor.value());
                    executors.add(executor);
                }
                Err(err) => {
                    warn!(
                        %session_id,
                        connection = %connection.name,
                        error = %err,
                        "connection unavailable"
                    );
                    let error = ProgramError::new(
                        ProgramErrorKind::Host,
                        Phase::Run,
                        format!("connection '{}': {}", connection.name, err),
                    );
                    return workflow
                        .record_state(move |at| SessionState::Error { at, error })
                        .await;
                }
            }
        }
        self.inner.registry.insert(session_id, executors);
        *workflow.predecls.lock() = predecls;

        let outcome = workflow.run_entrypoint().await;
        if let Some(fatal) = workflow.fatal.lock().take() {
            return Err(fatal);
        }
        match outcome {
            Ok((exports, return_value)) => {
                workflow
                    .record_state(move |at| SessionState::Completed {
                        at,
                        exports,
                        return_value,
                    })
                    .await
            }
            Err(err) if err.is_canceled() || ctx.cancel_token().is_cancelled() => {
                let reason = self
                    .inner
                    .stop_reasons
                    .lock()
                    .get(session_id)
                    .cloned()
                    .unwrap_or_else(|| err.to_string());
                workflow
                    .record_state(move |at| SessionState::Stopped { at, reason })
                    .await
            }
            Err(err) => {
                let error = err.into_program_error(Phase::Run);
                workflow
                    .record_state(move |at| SessionState::Error { at, error })
                    .await
            }
        }
    }
}

/// Per-execution state of one session workflow.
///
/// Nothing here is persisted; a replay rebuilds it from the same inputs.
pub(super) struct SessionWorkflow {
    pub(super) worker: SessionWorker,
    pub(super) ctx: WorkflowContext,
    pub(super) session: Session,
    build: Build,
    calls: SessionCalls,
    predecls: Mutex<Bindings>,
    pub(super) state: Mutex<WorkflowState>,
    pub(super) fakes: Fakes,
    fatal: Mutex<Option<WorkflowError>>,
    loaded: Mutex<HashMap<String, Bindings>>,
    loading: Mutex<HashSet<String>>,
}

/// Script-controlled workflow state.
#[derive(Default)]
pub(super) struct WorkflowState {
    pub(super) seq: u32,
    pub(super) poller: Option<Value>,
    pub(super) subscriptions: BTreeMap<String, Subscription>,
}

impl SessionWorkflow {
    pub(super) fn new(
        worker: SessionWorker,
        ctx: WorkflowContext,
        session: Session,
        build: Build,
    ) -> Self {
        let fakes = Fakes::default();
        let caller = SessionCaller::new(
            session.session_id.clone(),
            worker.inner.registry.clone(),
            worker.inner.runs.clone(),
        )
        .with_fakes(fakes.clone());
        let calls = SessionCalls::new(
            worker.inner.store.clone(),
            Arc::new(caller),
            worker.inner.config.activity.clone(),
        );
        Self {
            worker,
            ctx,
            session,
            build,
            calls,
            predecls: Mutex::new(Bindings::new()),
            state: Mutex::new(WorkflowState::default()),
            fakes,
            fatal: Mutex::new(None),
            loaded: Mutex::new(HashMap::new()),
            loading: Mutex::new(HashSet::new()),
        }
    }

    pub(super) fn session_id(&self) -> &SessionId {
        &self.session.session_id
    }

    pub(super) fn store(&self) -> &Arc<dyn SessionStore> {
        &self.worker.inner.store
    }

    async fn record_state<F>(&self, state: F) -> WorkflowResult<SessionState>
    where
        F: FnOnce(DateTime<Utc>) -> SessionState,
    {
        let store = self.store().clone();
        let session_id = self.session_id().clone();
        let state = self
            .ctx
            .side_effect("session_state", || async move {
                let state = state(Utc::now());
                store.update_session_state(&session_id, state.clone()).await?;
                Ok::<_, WorkflowError>(state)
            })
            .await?;
        info!(session_id = %self.session_id(), state = state.name(), "session state");
        Ok(state)
    }

    /// Keep the first infrastructure failure and hand the script an error
    /// that unwinds it.
    fn fail(&self, err: WorkflowError) -> LangError {
        match err {
            WorkflowError::Canceled => LangError::canceled(Phase::Run, "session canceled"),
            err => {
                let message = err.to_string();
                self.fatal.lock().get_or_insert(err);
                self.ctx.cancel_token().cancel();
                LangError::Program(ProgramError::new(ProgramErrorKind::Host, Phase::Run, message))
            }
        }
    }

    fn scope(&self) -> &str {
        self.session.session_id.as_str()
    }

    async fn run_module(&self, module: &Module) -> LangResult<Bindings> {
        let (sink, mut updates) = channel_sink();
        let predecls = self.predecls.lock().clone();
        let run = self
            .worker
            .inner
            .runs
            .run_module(&self.ctx.cancel_token(), None, self.scope(), module, predecls, sink)
            .await
            .map_err(run_error)?;
        debug!(
            session_id = %self.session_id(),
            run_id = %run.id(),
            path = %module.path,
            "module run started"
        );
        let state = drive(&run, &mut updates, self).await;
        self.discard_run(run.id());
        outcome(state.map_err(run_error)?, Phase::Run).map(|(bindings, _)| bindings)
    }

    fn discard_run(&self, run_id: RunId) {
        if let Err(err) = self.worker.inner.runs.discard(run_id) {
            warn!(session_id = %self.session_id(), %run_id, error = %err, "failed to discard run");
        }
    }

    async fn run_entrypoint(&self) -> LangResult<(Bindings, Value)> {
        let entry = &self.session.entrypoint;
        let module = self.build.modules.get(&entry.path).ok_or_else(|| {
            LangError::Program(ProgramError::new(
                ProgramErrorKind::Resolution,
                Phase::Run,
                format!("module '{}' is not part of build {}", entry.path, self.build.build_id),
            ))
        })?;
        let exports = self.run_module(module).await?;
        if entry.name.is_empty() {
            return Ok((exports, Value::None));
        }

        let function = exports.get(&entry.name).cloned().ok_or_else(|| {
            LangError::Program(ProgramError::new(
                ProgramErrorKind::Resolution,
                Phase::Call,
                format!("'{}' is not exported by '{}'", entry.name, entry.path),
            ))
        })?;
        let (sink, mut updates) = channel_sink();
        let run = self
            .worker
            .inner
            .runs
            .call_function(
                &self.ctx.cancel_token(),
                None,
                self.scope(),
                &function,
                Vec::new(),
                self.session.inputs.clone(),
                sink,
            )
            .await
            .map_err(run_error)?;
        debug!(
            session_id = %self.session_id(),
            run_id = %run.id(),
            function = %entry.name,
            "entrypoint call started"
        );
        let state = drive(&run, &mut updates, self).await;
        self.discard_run(run.id());
        let (_, value) = outcome(state.map_err(run_error)?, Phase::Call)?;
        Ok((exports, value))
    }

    async fn external_call(
        &self,
        function: Value,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> LangResult<Value> {
        let spec = {
            let mut state = self.state.lock();
            let seq = state.seq;
            state.seq += 1;
            SessionCallSpec {
                seq,
                function,
                args,
                kwargs,
                poller: state.poller.clone(),
            }
        };
        debug!(
            session_id = %self.session_id(),
            seq = spec.seq,
            function = %spec.function,
            "session call"
        );
        match self.calls.call(&self.ctx, self.session_id(), spec).await {
            Ok(SessionCallAttemptResult::Value(value)) => Ok(value),
            Ok(SessionCallAttemptResult::Error(err)) => Err(LangError::Program(err)),
            Err(err) => Err(self.fail(err)),
        }
    }
}

#[async_trait]
impl RunHandler for SessionWorkflow {
    async fn load(&self, path: &str) -> LangResult<Bindings> {
        if let Some(bindings) = self.loaded.lock().get(path) {
            return Ok(bindings.clone());
        }
        let module = self
            .build
            .modules
            .get(path)
            .ok_or_else(|| LangError::NotFound(format!("module '{}'", path)))?;
        if !self.loading.lock().insert(path.to_string()) {
            return Err(LangError::runtime(Phase::Run, format!("load cycle through '{}'", path)));
        }
        let result = self.run_module(module).await;
        self.loading.lock().remove(path);
        let bindings = result?;
        self.loaded.lock().insert(path.to_string(), bindings.clone());
        Ok(bindings)
    }

    async fn call(&self, function: Value, args: Vec<Value>, kwargs: Kwargs) -> LangResult<Value> {
        let function = self.fakes.resolve(function);
        match &function {
            Value::Builtin(call) if call.has_flag(CallFlag::Privileged) => {
                match self.syscall(call, args, kwargs).await {
                    Ok(value) => Ok(value),
                    Err(SyscallError::Usage(message)) => Err(LangError::runtime(
                        Phase::Run,
                        format!("{}: {}", call.unique_id, message),
                    )),
                    Err(SyscallError::Workflow(err)) => Err(self.fail(err)),
                }
            }
            _ => self.external_call(function, args, kwargs).await,
        }
    }

    async fn print(&self, text: &str) -> LangResult<()> {
        debug!(session_id = %self.session_id(), text, "print");
        let store = self.store().clone();
        let session_id = self.session_id().clone();
        let text = text.to_string();
        self.ctx
            .execute_local_activity("print", || async move {
                Ok::<_, WorkflowError>(store.add_session_print(&session_id, &text).await?)
            })
            .await
            .map_err(|err| self.fail(err))
    }
}

fn run_error(err: RunError) -> LangError {
    match err {
        RunError::Lang(err) => err,
        other => LangError::Program(ProgramError::new(
            ProgramErrorKind::Host,
            Phase::Run,
            other.to_string(),
        )),
    }
}

fn outcome(state: crate::runs::RunState, phase: Phase) -> LangResult<(Bindings, Value)> {
    state
        .into_outcome(phase)
        .unwrap_or_else(|| Err(LangError::runtime(phase, "run ended without a final state")))
}
