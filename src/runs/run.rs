//! A single suspendable run.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{LogEntry, RunError, RunId, RunResult, RunState, RunUpdate};
use crate::lang::{Bindings, LangError, LangResult, Phase, RunSummary};
use crate::values::{Kwargs, Value};

/// Receives every transition of a run, under the run's lock.
pub(crate) type Observer = Arc<dyn Fn(&RunUpdate) + Send + Sync>;

enum Rendezvous {
    Load(oneshot::Sender<LangResult<Bindings>>),
    Call(oneshot::Sender<LangResult<Value>>),
}

struct RunInner {
    state: RunState,
    log: Vec<LogEntry>,
    prints: Vec<String>,
    rendezvous: Option<Rendezvous>,
    cancel_reason: Option<String>,
    interpreter_summary: RunSummary,
}

/// One invocation of `run_module` or `call_function`.
///
/// All mutable state lives behind the run's own lock. The interpreter side
/// enters through the run's environment callbacks; the owner side through
/// [`Run::return_load`], [`Run::return_call`] and [`Run::cancel`].
pub struct Run {
    id: RunId,
    scope: String,
    phase: Phase,
    inner: Mutex<RunInner>,
    cancel: CancellationToken,
    observer: Observer,
    done: watch::Sender<bool>,
}

impl std::fmt::Debug for Run {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Run")
            .field("id", &self.id)
            .field("scope", &self.scope)
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}

fn wrong_state(expected: &str, actual: &RunState) -> RunError {
    RunError::WrongState {
        expected: expected.to_string(),
        actual: actual.name().to_string(),
    }
}

impl Run {
    pub(crate) fn new(
        id: RunId,
        scope: &str,
        phase: Phase,
        parent: &CancellationToken,
        observer: Observer,
    ) -> Arc<Self> {
        let (done, _) = watch::channel(false);
        Arc::new(Self {
            id,
            scope: scope.to_string(),
            phase,
            inner: Mutex::new(RunInner {
                state: RunState::Running,
                log: vec![LogEntry {
                    timestamp: chrono::Utc::now(),
                    state: RunState::Running,
                }],
                prints: Vec::new(),
                rendezvous: None,
                cancel_reason: None,
                interpreter_summary: RunSummary::default(),
            }),
            cancel: parent.child_token(),
            observer,
            done,
        })
    }

    /// Run id.
    pub fn id(&self) -> RunId {
        self.id
    }

    /// Scope the run executes in.
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Current logical state.
    pub fn state(&self) -> RunState {
        self.inner.lock().state.clone()
    }

    /// Timestamped log of every state entered.
    pub fn summary(&self) -> Vec<LogEntry> {
        self.inner.lock().log.clone()
    }

    /// Accumulated print output.
    pub fn prints(&self) -> Vec<String> {
        self.inner.lock().prints.clone()
    }

    /// Summary reported by the language once the run finished.
    pub fn interpreter_summary(&self) -> RunSummary {
        self.inner.lock().interpreter_summary.clone()
    }

    /// Token canceled when the run or its caller is canceled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait until the run reaches a final state and return it.
    pub async fn wait(&self) -> RunState {
        let mut done = self.done.subscribe();
        // the sender lives as long as the run, so this only fails if it is dropped mid-wait
        let _ = done.wait_for(|finished| *finished).await;
        self.state()
    }

    /// Hand a load result back to the interpreter.
    ///
    /// Fails with [`RunError::WrongState`] unless the run is in `LoadWait`.
    pub fn return_load(&self, result: LangResult<Bindings>) -> RunResult<()> {
        let mut inner = self.inner.lock();
        if !matches!(inner.state, RunState::LoadWait { .. }) {
            return Err(wrong_state("load_wait", &inner.state));
        }
        let Some(Rendezvous::Load(tx)) = inner.rendezvous.take() else {
            return Err(wrong_state("load_wait", &inner.state));
        };
        self.transition(&mut inner, RunState::LoadReturned);
        self.transition(&mut inner, RunState::Running);
        // the receiver is gone only when the run was canceled meanwhile
        let _ = tx.send(result);
        Ok(())
    }

    /// Hand a call result back to the interpreter.
    ///
    /// Fails with [`RunError::WrongState`] unless the run is in `CallWait`.
    pub fn return_call(&self, result: LangResult<Value>) -> RunResult<()> {
        let mut inner = self.inner.lock();
        if !matches!(inner.state, RunState::CallWait { .. }) {
            return Err(wrong_state("call_wait", &inner.state));
        }
        let Some(Rendezvous::Call(tx)) = inner.rendezvous.take() else {
            return Err(wrong_state("call_wait", &inner.state));
        };
        self.transition(&mut inner, RunState::CallReturned);
        self.transition(&mut inner, RunState::Running);
        let _ = tx.send(result);
        Ok(())
    }

    /// Cancel the run.
    ///
    /// Fails with [`RunError::WrongState`] if the run is already final. The
    /// run reaches `Canceled` once the interpreter has unwound.
    pub fn cancel(&self, reason: &str) -> RunResult<()> {
        {
            let mut inner = self.inner.lock();
            if inner.state.is_final() {
                return Err(wrong_state("non-final", &inner.state));
            }
            inner.cancel_reason.get_or_insert_with(|| reason.to_string());
        }
        debug!(run_id = %self.id, reason, "canceling run");
        self.cancel.cancel();
        Ok(())
    }

    fn transition(&self, inner: &mut RunInner, next: RunState) {
        let update = RunUpdate {
            run_id: self.id,
            timestamp: chrono::Utc::now(),
            previous: inner.state.clone(),
            next: next.clone(),
        };
        debug!(
            run_id = %self.id,
            scope = %self.scope,
            from = update.previous.name(),
            to = next.name(),
            "run transition"
        );
        inner.log.push(LogEntry {
            timestamp: update.timestamp,
            state: next.clone(),
        });
        if !matches!(next, RunState::Print { .. }) {
            inner.state = next;
        }
        (self.observer)(&update);
    }

    fn canceled_error(&self) -> LangError {
        let reason = self
            .inner
            .lock()
            .cancel_reason
            .clone()
            .unwrap_or_else(|| "context canceled".to_string());
        LangError::canceled(self.phase, reason)
    }

    fn expect_running(&self, inner: &RunInner, op: &str) -> LangResult<()> {
        if self.cancel.is_cancelled() {
            return Err(LangError::canceled(self.phase, "context canceled"));
        }
        match inner.state {
            RunState::Running => Ok(()),
            ref other => Err(LangError::runtime(
                self.phase,
                format!("{} while run is {}", op, other.name()),
            )),
        }
    }

    pub(crate) async fn load(&self, path: String) -> LangResult<Bindings> {
        let rx = {
            let mut inner = self.inner.lock();
            self.expect_running(&inner, "load")?;
            let (tx, rx) = oneshot::channel();
            inner.rendezvous = Some(Rendezvous::Load(tx));
            self.transition(&mut inner, RunState::LoadWait { path });
            rx
        };
        tokio::select! {
            result = rx => result.unwrap_or_else(|_| Err(self.canceled_error())),
            _ = self.cancel.cancelled() => Err(self.canceled_error()),
        }
    }

    pub(crate) async fn call(
        &self,
        function: Value,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> LangResult<Value> {
        let rx = {
            let mut inner = self.inner.lock();
            self.expect_running(&inner, "call")?;
            let (tx, rx) = oneshot::channel();
            inner.rendezvous = Some(Rendezvous::Call(tx));
            self.transition(
                &mut inner,
                RunState::CallWait {
                    function,
                    args,
                    kwargs,
                },
            );
            rx
        };
        tokio::select! {
            result = rx => result.unwrap_or_else(|_| Err(self.canceled_error())),
            _ = self.cancel.cancelled() => Err(self.canceled_error()),
        }
    }

    pub(crate) fn print(&self, text: String) -> LangResult<()> {
        let mut inner = self.inner.lock();
        inner.prints.push(text.clone());
        self.transition(&mut inner, RunState::Print { text });
        Ok(())
    }

    /// Record the interpreter's outcome as the final state.
    pub(crate) fn finish(&self, outcome: LangResult<(Bindings, Value, RunSummary)>) {
        {
            let mut inner = self.inner.lock();
            if inner.state.is_final() {
                return;
            }
            let next = match outcome {
                Ok((bindings, value, summary)) => {
                    inner.interpreter_summary = summary;
                    RunState::Completed { bindings, value }
                }
                Err(LangError::Program(err)) if err.is_canceled() => RunState::Canceled {
                    reason: inner.cancel_reason.clone().unwrap_or(err.message),
                    frames: err.frames,
                },
                Err(LangError::Program(err)) => RunState::Error { error: err },
                Err(LangError::Client(message)) => RunState::ClientError { message },
                Err(other) => RunState::Error {
                    error: other.into_program_error(self.phase),
                },
            };
            inner.rendezvous = None;
            self.transition(&mut inner, next);
        }
        self.done.send_replace(true);
    }
}
