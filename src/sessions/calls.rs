//! Session call engine.
//!
//! Every external call a session script makes gets a sequence number and a
//! persisted [`SessionCallSpec`]. [`execute_call`] runs the attempt loop for
//! one spec, recording every attempt; [`SessionCalls::call`] places that loop
//! either inline (pure callables) or inside a durable activity.

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::executors::Caller;
use super::types::{
    SessionCallAttemptComplete, SessionCallAttemptResult, SessionCallSpec, SessionId,
};
use crate::config::ActivityConfig;
use crate::durable::{ActivityOptions, WorkflowContext, WorkflowError, WorkflowResult};
use crate::lang::{Phase, ProgramError, ProgramErrorKind};
use crate::store::{SessionStore, StoreResult};
use crate::values::{CallFlag, Kwargs, Value};

/// Outcome of one pass of the attempt loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "result", rename_all = "snake_case")]
pub enum CallOutcome {
    /// The last attempt finished with this result.
    Done(SessionCallAttemptResult),
    /// The attempt budget ran out before a last attempt; call again.
    Incomplete,
}

/// What the poll predicate decided about a successful attempt.
enum PollDecision {
    Stop,
    Retry(Option<Duration>),
    Invalid(String),
}

fn decide(verdict: &Value) -> PollDecision {
    match verdict {
        Value::None | Value::Boolean(true) => PollDecision::Stop,
        Value::Boolean(false) => PollDecision::Retry(None),
        Value::Duration(interval) => PollDecision::Retry(Some(*interval)),
        other => PollDecision::Invalid(format!(
            "poller must return none, a boolean or a duration, got {}",
            other.type_name()
        )),
    }
}

fn canceled(reason: &str) -> ProgramError {
    ProgramError::new(ProgramErrorKind::Canceled, Phase::Call, reason)
}

/// Invoke `function`, converting failures, cancellation and panics into an
/// attempt result.
async fn invoke(
    caller: &dyn Caller,
    cancel: &CancellationToken,
    function: &Value,
    args: Vec<Value>,
    kwargs: Kwargs,
) -> SessionCallAttemptResult {
    let call = AssertUnwindSafe(caller.call(cancel.clone(), function, args, kwargs)).catch_unwind();
    let outcome = tokio::select! {
        outcome = call => outcome,
        _ = cancel.cancelled() => {
            return SessionCallAttemptResult::Error(canceled("context canceled"));
        }
    };
    match outcome {
        Ok(Ok(value)) => SessionCallAttemptResult::Value(value),
        Ok(Err(err)) => SessionCallAttemptResult::Error(err.into_program_error()),
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            warn!(%function, panic = %message, "call panicked");
            SessionCallAttemptResult::Error(ProgramError::new(
                ProgramErrorKind::Host,
                Phase::Call,
                format!("call panicked: {}", message),
            ))
        }
    }
}

/// Run the attempt loop for call `seq` of a session.
///
/// At most `max_attempts` attempts are made; if none of them is the last one
/// the result is [`CallOutcome::Incomplete`] and a later invocation resumes
/// after the recorded retry interval. Store failures propagate.
pub async fn execute_call(
    cancel: &CancellationToken,
    store: &dyn SessionStore,
    caller: &dyn Caller,
    session_id: &SessionId,
    seq: u32,
    poller: Option<&Value>,
    max_attempts: u32,
) -> StoreResult<CallOutcome> {
    let spec = store.get_session_call_spec(session_id, seq).await?;
    let previous = store.get_session_call_attempts(session_id, seq).await?;
    let last = previous.last().and_then(|attempt| attempt.complete.as_ref());
    if let Some(complete) = last.filter(|complete| complete.is_last) {
        debug!(%session_id, seq, "call already finished, returning recorded result");
        return Ok(CallOutcome::Done(complete.result.clone()));
    }
    let mut delay = last.and_then(|complete| complete.retry_interval);

    for _ in 0..max_attempts.max(1) {
        let attempt = store.start_session_call_attempt(session_id, seq).await?;
        debug!(%session_id, seq, attempt, "call attempt started");

        let mut result = None;
        if let Some(interval) = delay.take() {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancel.cancelled() => {
                    let err = canceled("canceled while waiting to retry");
                    result = Some(SessionCallAttemptResult::Error(err));
                }
            }
        }
        let result = match result {
            Some(result) => result,
            None => {
                invoke(
                    caller,
                    cancel,
                    &spec.function,
                    spec.args.clone(),
                    spec.kwargs.clone(),
                )
                .await
            }
        };

        let (result, retry) = match (result, poller) {
            (SessionCallAttemptResult::Value(value), Some(poller)) if !cancel.is_cancelled() => {
                match invoke(caller, cancel, poller, vec![value.clone()], Kwargs::new()).await {
                    SessionCallAttemptResult::Error(err) => {
                        (SessionCallAttemptResult::Error(err), None)
                    }
                    SessionCallAttemptResult::Value(verdict) => match decide(&verdict) {
                        PollDecision::Stop => (SessionCallAttemptResult::Value(value), None),
                        PollDecision::Retry(interval) => {
                            (SessionCallAttemptResult::Value(value), Some(interval))
                        }
                        PollDecision::Invalid(message) => (
                            SessionCallAttemptResult::Error(ProgramError::new(
                                ProgramErrorKind::Runtime,
                                Phase::Call,
                                message,
                            )),
                            None,
                        ),
                    },
                }
            }
            (result, _) => (result, None),
        };

        let is_last = retry.is_none();
        let retry_interval = retry.flatten();
        store
            .complete_session_call_attempt(
                session_id,
                seq,
                attempt,
                SessionCallAttemptComplete {
                    completed_at: chrono::Utc::now(),
                    is_last,
                    retry_interval,
                    result: result.clone(),
                },
            )
            .await?;
        debug!(%session_id, seq, attempt, is_last, ?retry_interval, "call attempt completed");

        if is_last {
            return Ok(CallOutcome::Done(result));
        }
        delay = retry_interval;
    }
    info!(%session_id, seq, "attempt budget exhausted, call incomplete");
    Ok(CallOutcome::Incomplete)
}

/// Places session calls inline or inside durable activities.
#[derive(Clone)]
pub struct SessionCalls {
    store: Arc<dyn SessionStore>,
    caller: Arc<dyn Caller>,
    config: ActivityConfig,
}

impl SessionCalls {
    /// Engine for one session's calls.
    pub fn new(
        store: Arc<dyn SessionStore>,
        caller: Arc<dyn Caller>,
        config: ActivityConfig,
    ) -> Self {
        Self {
            store,
            caller,
            config,
        }
    }

    /// Persist `spec` and execute it to a final attempt result.
    ///
    /// Only callables flagged [`CallFlag::Pure`] run inline; everything else
    /// runs in an activity that is invoked again while it reports
    /// [`CallOutcome::Incomplete`].
    pub async fn call(
        &self,
        ctx: &WorkflowContext,
        session_id: &SessionId,
        spec: SessionCallSpec,
    ) -> WorkflowResult<SessionCallAttemptResult> {
        let seq = spec.seq;
        {
            let store = self.store.clone();
            let session_id = session_id.clone();
            let spec = spec.clone();
            ctx.execute_local_activity("create_call_spec", || async move {
                store.create_session_call_spec(&session_id, &spec).await?;
                Ok::<_, WorkflowError>(())
            })
            .await?;
        }

        let pure = matches!(&spec.function, Value::Builtin(call) if call.has_flag(CallFlag::Pure));
        loop {
            let outcome = if pure {
                self.call_inline(ctx, session_id, &spec).await?
            } else {
                self.call_activity(ctx, session_id, &spec).await?
            };
            match outcome {
                CallOutcome::Done(result) => return Ok(result),
                CallOutcome::Incomplete => {
                    debug!(%session_id, seq, "call incomplete, invoking again");
                }
            }
        }
    }

    async fn call_inline(
        &self,
        ctx: &WorkflowContext,
        session_id: &SessionId,
        spec: &SessionCallSpec,
    ) -> WorkflowResult<CallOutcome> {
        let cancel = ctx.cancel_token();
        ctx.execute_local_activity("call_inline", || async {
            Ok::<_, WorkflowError>(execute_call(
                &cancel,
                self.store.as_ref(),
                self.caller.as_ref(),
                session_id,
                spec.seq,
                spec.poller.as_ref(),
                self.config.max_attempts_per_activity,
            )
            .await?)
        })
        .await
    }

    async fn call_activity(
        &self,
        ctx: &WorkflowContext,
        session_id: &SessionId,
        spec: &SessionCallSpec,
    ) -> WorkflowResult<CallOutcome> {
        let options = ActivityOptions::from(&self.config);
        let heartbeat_every = options.heartbeat / 2;
        let max_attempts = self.config.max_attempts_per_activity;
        ctx.execute_activity("call", &options, |actx| {
            let store = self.store.clone();
            let caller = self.caller.clone();
            let session_id = session_id.clone();
            let seq = spec.seq;
            let poller = spec.poller.clone();
            async move {
                let cancel = actx.cancel_token();
                let work = execute_call(
                    &cancel,
                    store.as_ref(),
                    caller.as_ref(),
                    &session_id,
                    seq,
                    poller.as_ref(),
                    max_attempts,
                );
                let heartbeats = async {
                    let period = heartbeat_every.max(Duration::from_millis(1));
                    let mut ticks = tokio::time::interval(period);
                    loop {
                        ticks.tick().await;
                        actx.heartbeat();
                    }
                };
                tokio::select! {
                    outcome = work => outcome.map_err(WorkflowError::from),
                    _ = heartbeats => Err(WorkflowError::Activity {
                        name: "call".into(),
                        message: "heartbeat loop ended".into(),
                    }),
                }
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::executors::CallError;
    use crate::sessions::types::{CodeLocation, Session};
    use crate::store::MemStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    /// Returns scripted results; the poller is a builtin named `poll`.
    struct Scripted {
        results: Mutex<Vec<Result<Value, String>>>,
        verdicts: Mutex<Vec<Value>>,
        calls: Mutex<u32>,
    }

    impl Scripted {
        fn new(results: Vec<Result<Value, String>>, verdicts: Vec<Value>) -> Arc<Self> {
            Arc::new(Self {
                results: Mutex::new(results),
                verdicts: Mutex::new(verdicts),
                calls: Mutex::new(0),
            })
        }
    }

    #[async_trait]
    impl Caller for Scripted {
        async fn call(
            &self,
            _cancel: CancellationToken,
            function: &Value,
            _args: Vec<Value>,
            _kwargs: Kwargs,
        ) -> Result<Value, CallError> {
            if function.callable_id() == Some("t.poll") {
                return Ok(self.verdicts.lock().remove(0));
            }
            if function.callable_id() == Some("t.boom") {
                panic!("kaboom");
            }
            *self.calls.lock() += 1;
            self.results.lock().remove(0).map_err(CallError::failed)
        }
    }

    fn builtin(name: &str, flags: &[CallFlag]) -> Value {
        Value::Builtin(crate::values::CallValue::new(
            &crate::values::ExecutorId::new("t"),
            name,
            flags,
        ))
    }

    async fn setup(function: Value, poller: Option<Value>) -> (Arc<MemStore>, SessionId) {
        let store = Arc::new(MemStore::new());
        let session_id = SessionId::from("s");
        store
            .create_session(&Session {
                session_id: session_id.clone(),
                build_id: "b".into(),
                deployment_id: None,
                entrypoint: CodeLocation::new("main.sx", ""),
                inputs: BTreeMap::new(),
                memo: BTreeMap::new(),
                connections: Vec::new(),
                env_vars: BTreeMap::new(),
                parent_session_id: None,
            })
            .await
            .unwrap();
        store
            .create_session_call_spec(
                &session_id,
                &SessionCallSpec {
                    seq: 0,
                    function,
                    args: vec![],
                    kwargs: Kwargs::new(),
                    poller,
                },
            )
            .await
            .unwrap();
        (store, session_id)
    }

    #[tokio::test]
    async fn failures_end_the_loop() {
        let (store, id) = setup(builtin("get", &[]), None).await;
        let caller = Scripted::new(vec![Err("unreachable host".into())], vec![]);
        let cancel = CancellationToken::new();
        let outcome = execute_call(&cancel, store.as_ref(), caller.as_ref(), &id, 0, None, 10)
            .await
            .unwrap();
        let CallOutcome::Done(SessionCallAttemptResult::Error(err)) = outcome else {
            panic!("expected an error outcome");
        };
        assert_eq!(err.message, "unreachable host");
        let attempts = store.get_session_call_attempts(&id, 0).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert!(attempts[0].complete.as_ref().unwrap().is_last);
    }

    #[tokio::test]
    async fn rerunning_a_finished_call_returns_the_recorded_result() {
        let (store, id) = setup(builtin("get", &[]), None).await;
        let caller = Scripted::new(vec![Ok(Value::Integer(4))], vec![]);
        let cancel = CancellationToken::new();
        let first = execute_call(&cancel, store.as_ref(), caller.as_ref(), &id, 0, None, 10)
            .await
            .unwrap();
        let second = execute_call(&cancel, store.as_ref(), caller.as_ref(), &id, 0, None, 10)
            .await
            .unwrap();
        assert_eq!(first, CallOutcome::Done(SessionCallAttemptResult::Value(Value::Integer(4))));
        assert_eq!(second, first);
        assert_eq!(*caller.calls.lock(), 1);
        assert_eq!(store.get_session_call_attempts(&id, 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn panics_become_attempt_errors() {
        let (store, id) = setup(builtin("boom", &[]), None).await;
        let caller = Scripted::new(vec![], vec![]);
        let cancel = CancellationToken::new();
        let outcome = execute_call(&cancel, store.as_ref(), caller.as_ref(), &id, 0, None, 10)
            .await
            .unwrap();
        let CallOutcome::Done(SessionCallAttemptResult::Error(err)) = outcome else {
            panic!("expected an error outcome");
        };
        assert_eq!(err.kind, ProgramErrorKind::Host);
        assert!(err.message.contains("kaboom"));
    }

    #[tokio::test]
    async fn false_retries_immediately_and_other_verdicts_are_errors() {
        let poller = builtin("poll", &[]);
        let (store, id) = setup(builtin("get", &[]), Some(poller.clone())).await;
        let caller = Scripted::new(
            vec![Ok(Value::Integer(1)), Ok(Value::Integer(2))],
            vec![Value::Boolean(false), Value::String("later".into())],
        );
        let outcome = execute_call(
            &CancellationToken::new(),
            store.as_ref(),
            caller.as_ref(),
            &id,
            0,
            Some(&poller),
            10,
        )
        .await
        .unwrap();
        assert!(matches!(outcome, CallOutcome::Done(SessionCallAttemptResult::Error(_))));
        let attempts = store.get_session_call_attempts(&id, 0).await.unwrap();
        let first = attempts[0].complete.as_ref().unwrap();
        assert!(!first.is_last);
        assert_eq!(first.retry_interval, None);
        assert!(attempts[1].complete.as_ref().unwrap().is_last);
    }

    #[tokio::test(start_paused = true)]
    async fn budget_exhaustion_resumes_on_the_next_invocation() {
        let poller = builtin("poll", &[]);
        let (store, id) = setup(builtin("get", &[]), Some(poller.clone())).await;
        let caller = Scripted::new(
            vec![Ok(Value::Integer(1)), Ok(Value::Integer(2)), Ok(Value::Integer(3))],
            vec![
                Value::Duration(Duration::from_secs(1)),
                Value::Duration(Duration::from_secs(1)),
                Value::None,
            ],
        );
        let cancel = CancellationToken::new();
        let first = execute_call(&cancel, store.as_ref(), caller.as_ref(), &id, 0, Some(&poller), 2)
            .await
            .unwrap();
        assert_eq!(first, CallOutcome::Incomplete);
        let second =
            execute_call(&cancel, store.as_ref(), caller.as_ref(), &id, 0, Some(&poller), 2)
                .await
                .unwrap();
        assert_eq!(
            second,
            CallOutcome::Done(SessionCallAttemptResult::Value(Value::Integer(3)))
        );
        let numbers: Vec<u32> = store
            .get_session_call_attempts(&id, 0)
            .await
            .unwrap()
            .iter()
            .map(|a| a.attempt)
            .collect();
        assert_eq!(numbers, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn pure_calls_run_inline_and_replay() {
        let (store, id) = setup(builtin("get", &[CallFlag::Pure]), None).await;
        let caller = Scripted::new(vec![Ok(Value::Integer(7))], vec![]);
        let calls = SessionCalls::new(store.clone(), caller.clone(), ActivityConfig::default());
        let spec = store.get_session_call_spec(&id, 0).await.unwrap();

        let ctx = WorkflowContext::new("wf", CancellationToken::new());
        let result = calls.call(&ctx, &id, spec.clone()).await.unwrap();
        assert_eq!(result, SessionCallAttemptResult::Value(Value::Integer(7)));
        assert!(ctx
            .history()
            .iter()
            .all(|event| !matches!(event, crate::durable::HistoryEvent::Activity { .. })));

        let replay = WorkflowContext::replay("wf", ctx.history(), CancellationToken::new());
        let again = calls.call(&replay, &id, spec).await.unwrap();
        assert_eq!(again, result);
        assert_eq!(*caller.calls.lock(), 1);
    }
}
