//! Registry of live runs.

use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, warn};

use super::run::{Observer, Run};
use super::{RunError, RunId, RunResult, RunState, RunUpdate};
use crate::lang::catalog::Catalog;
use crate::lang::{
    Bindings, LangError, Module, Phase, ProgramError, ProgramErrorKind, RunEnv,
};
use crate::values::{Kwargs, Value};

/// Destination for a run's updates.
///
/// Called while the run's lock is held, so it must not call back into the
/// run synchronously.
pub type UpdateSink = Arc<dyn Fn(RunUpdate) + Send + Sync>;

/// A sink that forwards updates into an unbounded channel.
pub fn channel_sink() -> (UpdateSink, mpsc::UnboundedReceiver<RunUpdate>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sink: UpdateSink = Arc::new(move |update| {
        // a dropped receiver means nobody is interested any more
        let _ = tx.send(update);
    });
    (sink, rx)
}

#[derive(Default)]
struct Registry {
    runs: HashMap<RunId, Option<Arc<Run>>>,
    buckets: BTreeMap<&'static str, BTreeSet<RunId>>,
    bucket_of: HashMap<RunId, &'static str>,
}

impl Registry {
    fn rebucket(&mut self, id: RunId, state: &'static str) {
        if !self.runs.contains_key(&id) {
            return;
        }
        if let Some(previous) = self.bucket_of.insert(id, state) {
            if let Some(bucket) = self.buckets.get_mut(previous) {
                bucket.remove(&id);
            }
        }
        self.buckets.entry(state).or_default().insert(id);
    }

    fn remove(&mut self, id: RunId) {
        self.runs.remove(&id);
        if let Some(previous) = self.bucket_of.remove(&id) {
            if let Some(bucket) = self.buckets.get_mut(previous) {
                bucket.remove(&id);
                if bucket.is_empty() {
                    self.buckets.remove(previous);
                }
            }
        }
    }
}

/// Creates runs against a [`Catalog`] and tracks them until discarded.
#[derive(Clone)]
pub struct Runs {
    catalog: Arc<Catalog>,
    registry: Arc<Mutex<Registry>>,
}

impl Runs {
    /// Create a registry backed by a catalog.
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self {
            catalog,
            registry: Arc::new(Mutex::new(Registry::default())),
        }
    }

    /// Catalog used to acquire languages.
    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    /// Start running a module's top level.
    ///
    /// The compiler version is checked and the id is claimed before the
    /// interpreter starts; a duplicate id fails with
    /// [`RunError::AlreadyExists`].
    pub async fn run_module(
        &self,
        cancel: &CancellationToken,
        id: Option<RunId>,
        scope: &str,
        module: &Module,
        predecls: Bindings,
        sink: UpdateSink,
    ) -> RunResult<Arc<Run>> {
        let lang = self.catalog.acquire(&module.lang, scope)?;
        if !lang
            .is_compiler_version_supported(&module.compiler_version)
            .await?
        {
            return Err(LangError::CompilerVersionMismatch {
                lang: module.lang.clone(),
                expected: lang.compiler_version(),
                actual: module.compiler_version.clone(),
            }
            .into());
        }

        let id = id.unwrap_or_default();
        self.claim(id)?;
        let run = Run::new(id, scope, Phase::Run, cancel, self.observer(sink));
        self.install(&run);

        let env = run_env(&run, predecls);
        let module = module.clone();
        let task_run = run.clone();
        let span = info_span!("run_module", run_id = %id, lang = %module.lang, path = %module.path);
        tokio::spawn(
            async move {
                let running = lang.run_module(task_run.cancel_token(), env, &module);
                let outcome = AssertUnwindSafe(running)
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| Err(panicked(Phase::Run)));
                task_run
                    .finish(outcome.map(|(bindings, summary)| (bindings, Value::None, summary)));
            }
            .instrument(span),
        );
        Ok(run)
    }

    /// Start calling a function value.
    #[allow(clippy::too_many_arguments)]
    pub async fn call_function(
        &self,
        cancel: &CancellationToken,
        id: Option<RunId>,
        scope: &str,
        function: &Value,
        args: Vec<Value>,
        kwargs: Kwargs,
        sink: UpdateSink,
    ) -> RunResult<Arc<Run>> {
        let lang_name = match function {
            Value::Function(func) => func.lang.clone(),
            other => {
                return Err(LangError::Program(ProgramError::new(
                    ProgramErrorKind::NotCallable,
                    Phase::Call,
                    format!("{} is not a function value", other.type_name()),
                ))
                .into());
            }
        };
        let lang = self.catalog.acquire(&lang_name, scope)?;

        let id = id.unwrap_or_default();
        self.claim(id)?;
        let run = Run::new(id, scope, Phase::Call, cancel, self.observer(sink));
        self.install(&run);

        let env = run_env(&run, Bindings::new());
        let function = function.clone();
        let task_run = run.clone();
        let span = info_span!("call_function", run_id = %id, lang = %lang_name);
        tokio::spawn(
            async move {
                let outcome = AssertUnwindSafe(lang.call_function(
                    task_run.cancel_token(),
                    env,
                    &function,
                    args,
                    kwargs,
                ))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(panicked(Phase::Call)));
                task_run.finish(outcome.map(|(value, summary)| (Bindings::new(), value, summary)));
            }
            .instrument(span),
        );
        Ok(run)
    }

    /// Look up a live run.
    pub fn get(&self, id: RunId) -> RunResult<Arc<Run>> {
        self.registry
            .lock()
            .runs
            .get(&id)
            .cloned()
            .flatten()
            .ok_or(RunError::NotFound(id))
    }

    /// Live run ids grouped by state name.
    pub fn list(&self) -> BTreeMap<String, Vec<RunId>> {
        self.registry
            .lock()
            .buckets
            .iter()
            .filter(|(_, ids)| !ids.is_empty())
            .map(|(state, ids)| (state.to_string(), ids.iter().copied().collect()))
            .collect()
    }

    /// Remove a final run from the registry.
    pub fn discard(&self, id: RunId) -> RunResult<()> {
        let run = self.get(id)?;
        let state = run.state();
        if !state.is_final() {
            return Err(RunError::WrongState {
                expected: "final".to_string(),
                actual: state.name().to_string(),
            });
        }
        self.registry.lock().remove(id);
        debug!(run_id = %id, "discarded run");
        Ok(())
    }

    fn claim(&self, id: RunId) -> RunResult<()> {
        let mut registry = self.registry.lock();
        if registry.runs.contains_key(&id) {
            return Err(RunError::AlreadyExists(id));
        }
        registry.runs.insert(id, None);
        Ok(())
    }

    fn install(&self, run: &Arc<Run>) {
        let mut registry = self.registry.lock();
        registry.runs.insert(run.id(), Some(run.clone()));
        registry.rebucket(run.id(), RunState::Running.name());
    }

    fn observer(&self, sink: UpdateSink) -> Observer {
        let registry = self.registry.clone();
        Arc::new(move |update: &RunUpdate| {
            if !matches!(update.next, RunState::Print { .. }) {
                registry.lock().rebucket(update.run_id, update.next.name());
            }
            sink(update.clone());
        })
    }
}

fn panicked(phase: Phase) -> LangError {
    warn!("language backend panicked");
    ProgramError::new(ProgramErrorKind::Host, phase, "language backend panicked").into()
}

fn run_env(run: &Arc<Run>, predecls: Bindings) -> RunEnv {
    let print_run = run.clone();
    let load_run = run.clone();
    let call_run = run.clone();
    RunEnv::new(run.scope())
        .with_predecls(predecls)
        .with_print(move |text| {
            let run = print_run.clone();
            async move { run.print(text) }.boxed()
        })
        .with_load(move |path| {
            let run = load_run.clone();
            async move { run.load(path).await }.boxed()
        })
        .with_call(move |function, args, kwargs| {
            let run = call_run.clone();
            async move { run.call(function, args, kwargs).await }.boxed()
        })
        .with_stubs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CatalogConfig;
    use crate::lang::Lang;
    use crate::lang::sexpr::SexprLang;

    async fn module(src: &str) -> Module {
        SexprLang::new()
            .compile_module("main.sx", src.as_bytes(), &[])
            .await
            .unwrap()
    }

    fn runs() -> Runs {
        Runs::new(Arc::new(Catalog::with_builtin_langs(&CatalogConfig::default())))
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let runs = runs();
        let module = module("(def x 1)").await;
        let id = RunId::new();
        let (sink, _rx) = channel_sink();
        let run = runs
            .run_module(
                &CancellationToken::new(),
                Some(id),
                "s",
                &module,
                Bindings::new(),
                sink.clone(),
            )
            .await
            .unwrap();
        let err = runs
            .run_module(&CancellationToken::new(), Some(id), "s", &module, Bindings::new(), sink)
            .await
            .err();
        assert!(matches!(err, Some(RunError::AlreadyExists(_))));
        run.wait().await;
    }

    #[tokio::test]
    async fn buckets_follow_state_and_discard_cleans_up() {
        let runs = runs();
        let module = module("(load \"lib.sx\" f)\n(def x f)").await;
        let (sink, mut rx) = channel_sink();
        let run = runs
            .run_module(&CancellationToken::new(), None, "s", &module, Bindings::new(), sink)
            .await
            .unwrap();

        let update = rx.recv().await.unwrap();
        assert_eq!(update.next.name(), "load_wait");
        assert_eq!(runs.list().get("load_wait"), Some(&vec![run.id()]));
        assert!(matches!(runs.discard(run.id()), Err(RunError::WrongState { .. })));

        let mut bindings = Bindings::new();
        bindings.insert("f".into(), Value::Integer(7));
        run.return_load(Ok(bindings)).unwrap();
        match run.wait().await {
            RunState::Completed { bindings, .. } => {
                assert_eq!(bindings.get("x"), Some(&Value::Integer(7)))
            }
            other => panic!("unexpected state {other:?}"),
        }
        assert_eq!(runs.list().get("completed"), Some(&vec![run.id()]));

        runs.discard(run.id()).unwrap();
        assert!(runs.list().is_empty());
        assert!(matches!(runs.get(run.id()), Err(RunError::NotFound(_))));
    }

    #[tokio::test]
    async fn compiler_version_is_checked_before_claiming() {
        let runs = runs();
        let mut module = module("(def x 1)").await;
        module.compiler_version = "sexpr-0".into();
        let id = RunId::new();
        let (sink, _rx) = channel_sink();
        let err = runs
            .run_module(&CancellationToken::new(), Some(id), "s", &module, Bindings::new(), sink)
            .await
            .err();
        assert!(matches!(
            err,
            Some(RunError::Lang(LangError::CompilerVersionMismatch { .. }))
        ));
        assert!(matches!(runs.get(id), Err(RunError::NotFound(_))));
        assert!(runs.list().is_empty());
    }

    #[tokio::test]
    async fn non_functions_cannot_be_called() {
        let (sink, _rx) = channel_sink();
        let err = runs()
            .call_function(
                &CancellationToken::new(),
                None,
                "s",
                &Value::Integer(1),
                Vec::new(),
                Kwargs::new(),
                sink,
            )
            .await
            .err();
        assert!(matches!(err, Some(RunError::Lang(LangError::Program(_)))));
    }
}
