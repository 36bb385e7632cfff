use akrun::config::EngineConfig;
use akrun::lang::ProgramErrorKind;
use akrun::sessions::{
    CallContext, CallError, CallOutcome, Caller, CodeLocation, Connection, Dispatcher,
    IntegrationRegistry, ModuleBuilder, Session, SessionCallAttemptResult, SessionCallSpec,
    SessionId, SessionState, SessionWorker, compile_build, execute_call,
};
use akrun::store::{MemStore, SessionStore};
use akrun::values::{CallValue, ExecutorId, Kwargs, Value};
use akrun::{Catalog, Runs};
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A worker whose `counter` integration returns 1, 2, 3... from `next`.
struct Harness {
    worker: SessionWorker,
    store: Arc<MemStore>,
    calls: Arc<AtomicI64>,
}

fn harness() -> Harness {
    let store = Arc::new(MemStore::new());
    let calls = Arc::new(AtomicI64::new(0));
    let integrations = IntegrationRegistry::new();
    {
        let calls = calls.clone();
        integrations.register("counter", move |connection: &Connection| {
            let calls = calls.clone();
            Ok(ModuleBuilder::new(connection.name.as_str())
                .function("next", &[], move |_ctx: CallContext, _args, _kwargs| {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    async move { Ok(Value::Integer(n)) }.boxed()
                })
                .function("broken", &[], |_ctx: CallContext, _args, _kwargs| {
                    async { Err(CallError::failed("upstream unavailable")) }.boxed()
                })
                .constant("region", Value::String("eu".into()))
                .build())
        });
    }
    let runs = Runs::new(Arc::new(Catalog::with_builtin_langs(&Default::default())));
    let worker = SessionWorker::new(
        runs,
        store.clone(),
        Arc::new(integrations),
        EngineConfig::default(),
    );
    Harness {
        worker,
        store,
        calls,
    }
}

fn connection(integration: &str) -> Connection {
    Connection {
        connection_id: "conn-1".into(),
        name: "svc".into(),
        integration: integration.into(),
        config: BTreeMap::new(),
    }
}

impl Harness {
    async fn session(
        &self,
        sources: &[(&str, &str)],
        entry: &str,
        connections: Vec<Connection>,
    ) -> Session {
        let sources: BTreeMap<String, Vec<u8>> = sources
            .iter()
            .map(|(path, src)| (path.to_string(), src.as_bytes().to_vec()))
            .collect();
        let names: Vec<String> = connections.iter().map(|conn| conn.name.clone()).collect();
        let catalog = self.worker.runs().catalog().clone();
        let build = compile_build(&catalog, "bld", &sources, &names).await.unwrap();
        self.store.save_build(&build).await.unwrap();
        let mut env_vars = BTreeMap::new();
        env_vars.insert("STAGE".to_string(), "test".to_string());
        Session {
            session_id: SessionId::new(),
            build_id: "bld".into(),
            deployment_id: Some("dep".into()),
            entrypoint: CodeLocation::new("main.sx", entry),
            inputs: BTreeMap::new(),
            memo: BTreeMap::new(),
            connections,
            env_vars,
            parent_session_id: None,
        }
    }

    async fn wait_for_state(
        &self,
        session_id: &SessionId,
        done: impl Fn(&SessionState) -> bool,
    ) -> SessionState {
        loop {
            if let Ok(state) = self.store.get_session_state(session_id).await {
                if done(&state) {
                    return state;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[tokio::test]
async fn session_completes_with_exports_and_return_value() {
    let h = harness();
    let mut session = h
        .session(
            &[
                (
                    "main.sx",
                    "(load \"lib.sx\" double)\n\
                     (def first (svc.next))\n\
                     (def stage env.STAGE)\n\
                     (defn main [x] (print \"main\" x) (double (+ x (svc.next))))",
                ),
                ("lib.sx", "(defn double [n] (* n 2))"),
            ],
            "main",
            vec![connection("counter")],
        )
        .await;
    session.inputs.insert("x".into(), Value::Integer(10));
    let session_id = session.session_id.clone();

    let outcome = h.worker.start_session(session).await.unwrap().await.unwrap().unwrap();
    match &outcome.state {
        SessionState::Completed {
            exports,
            return_value,
            ..
        } => {
            assert_eq!(exports.get("first"), Some(&Value::Integer(1)));
            assert_eq!(exports.get("stage"), Some(&Value::String("test".into())));
            assert!(!exports.contains_key("svc"));
            assert_eq!(return_value, &Value::Integer(24));
        }
        other => panic!("unexpected state {other:?}"),
    }
    assert_eq!(h.store.get_session_state(&session_id).await.unwrap(), outcome.state);
    assert_eq!(h.store.get_session_prints(&session_id).await.unwrap(), vec!["main 10".to_string()]);
    assert_eq!(h.calls.load(Ordering::SeqCst), 2);

    // one spec and one last attempt per external call
    for seq in 0..2 {
        let attempts = h.store.get_session_call_attempts(&session_id, seq).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert!(attempts[0].complete.as_ref().unwrap().is_last);
    }
    assert!(h.worker.registry().is_empty());
    assert!(h.worker.active_sessions().is_empty());
}

#[tokio::test]
async fn replaying_the_history_repeats_no_external_work() {
    let h = harness();
    let session = h
        .session(
            &[(
                "main.sx",
                "(def a (svc.next))\n(print \"got\" a)\n(def t (time.now))\n(def b (svc.next))",
            )],
            "",
            vec![connection("counter")],
        )
        .await;
    let session_id = session.session_id.clone();
    let first = h.worker.start_session(session).await.unwrap().await.unwrap().unwrap();
    assert_eq!(h.calls.load(Ordering::SeqCst), 2);

    let replayed = h.worker.run_session(&session_id, first.history.clone()).await.unwrap();
    assert_eq!(replayed.state, first.state);
    assert_eq!(replayed.history, first.history);
    assert_eq!(h.calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.store.get_session_prints(&session_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn unavailable_connection_ends_the_session_in_error() {
    let h = harness();
    let session = h
        .session(&[("main.sx", "(def a (svc.next))")], "", vec![connection("missing")])
        .await;
    let outcome = h.worker.start_session(session).await.unwrap().await.unwrap().unwrap();
    match outcome.state {
        SessionState::Error { error, .. } => {
            assert_eq!(error.kind, ProgramErrorKind::Host);
            assert!(error.message.contains("svc"));
        }
        other => panic!("unexpected state {other:?}"),
    }
    assert_eq!(h.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn integration_failures_surface_as_script_errors_with_frames() {
    let h = harness();
    let session = h
        .session(
            &[("main.sx", "(defn main []\n  (svc.broken))")],
            "main",
            vec![connection("counter")],
        )
        .await;
    let outcome = h.worker.start_session(session).await.unwrap().await.unwrap().unwrap();
    match outcome.state {
        SessionState::Error { error, .. } => {
            assert!(error.message.contains("upstream unavailable"));
            assert!(error.frames.iter().any(|frame| frame.name == "main"));
        }
        other => panic!("unexpected state {other:?}"),
    }
}

#[tokio::test]
async fn poller_retries_until_satisfied() {
    let h = harness();
    let session = h
        .session(
            &[(
                "main.sx",
                "(defn ready [v] (if (< v 3) (ms 10) true))\n\
                 (ak.poll ready)\n\
                 (def n (svc.next))\n\
                 (ak.poll nil)\n\
                 (def m (svc.next))",
            )],
            "",
            vec![connection("counter")],
        )
        .await;
    let session_id = session.session_id.clone();
    let outcome = h.worker.start_session(session).await.unwrap().await.unwrap().unwrap();
    match &outcome.state {
        SessionState::Completed { exports, .. } => {
            assert_eq!(exports.get("n"), Some(&Value::Integer(3)));
            assert_eq!(exports.get("m"), Some(&Value::Integer(4)));
        }
        other => panic!("unexpected state {other:?}"),
    }
    let attempts = h.store.get_session_call_attempts(&session_id, 0).await.unwrap();
    let numbers: Vec<u32> = attempts.iter().map(|attempt| attempt.attempt).collect();
    assert_eq!(numbers, vec![0, 1, 2]);
    let last: Vec<bool> = attempts
        .iter()
        .map(|attempt| attempt.complete.as_ref().unwrap().is_last)
        .collect();
    assert_eq!(last, vec![false, false, true]);
    assert_eq!(h.store.get_session_call_attempts(&session_id, 1).await.unwrap().len(), 1);
}

#[tokio::test]
async fn stopping_a_session_records_the_reason() {
    let h = harness();
    let session = h
        .session(&[("main.sx", "(ak.sleep (minutes 10))")], "", Vec::new())
        .await;
    let session_id = session.session_id.clone();
    let handle = h.worker.start_session(session).await.unwrap();
    h.wait_for_state(&session_id, |state| matches!(state, SessionState::Running { .. }))
        .await;

    assert!(h.worker.stop_session(&session_id, "operator request"));
    let outcome = handle.await.unwrap().unwrap();
    match outcome.state {
        SessionState::Stopped { reason, .. } => assert_eq!(reason, "operator request"),
        other => panic!("unexpected state {other:?}"),
    }
    assert!(!h.worker.stop_session(&session_id, "again"));
}

#[tokio::test]
async fn events_wake_a_session_waiting_on_its_subscription() {
    let h = harness();
    let session = h
        .session(
            &[(
                "main.sx",
                "(defn main []\n\
                 (let [sub (ak.subscribe \"svc\" \"push\")\n\
                 ev (ak.next_event sub)]\n\
                 (ak.unsubscribe sub)\n\
                 (get (get ev \"data\") \"n\")))",
            )],
            "main",
            vec![connection("counter")],
        )
        .await;
    let dispatcher = Dispatcher::new(h.store.clone(), h.worker.router().clone());
    // before the subscription, never delivered
    let mut stale = BTreeMap::new();
    stale.insert("n".to_string(), Value::Integer(0));
    dispatcher.dispatch("conn-1", "push", stale).await.unwrap();

    let handle = h.worker.start_session(session).await.unwrap();
    while h.store.list_signals("conn-1", "push").await.unwrap().is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    dispatcher.dispatch("conn-1", "pull", BTreeMap::new()).await.unwrap();
    let mut data = BTreeMap::new();
    data.insert("n".to_string(), Value::Integer(7));
    dispatcher.dispatch("conn-1", "push", data).await.unwrap();

    let outcome = handle.await.unwrap().unwrap();
    match outcome.state {
        SessionState::Completed { return_value, .. } => assert_eq!(return_value, Value::Integer(7)),
        other => panic!("unexpected state {other:?}"),
    }
    assert!(h.store.list_signals("conn-1", "push").await.unwrap().is_empty());
}

#[tokio::test]
async fn next_event_times_out_with_none() {
    let h = harness();
    let session = h
        .session(
            &[(
                "main.sx",
                "(def sub (ak.subscribe \"svc\"))\n(def ev (ak.next_event sub :timeout (ms 20)))",
            )],
            "",
            vec![connection("counter")],
        )
        .await;
    let outcome = h.worker.start_session(session).await.unwrap().await.unwrap().unwrap();
    match outcome.state {
        SessionState::Completed { exports, .. } => {
            assert_eq!(exports.get("ev"), Some(&Value::None))
        }
        other => panic!("unexpected state {other:?}"),
    }
}

#[tokio::test]
async fn started_children_run_the_same_build() {
    let h = harness();
    let session = h
        .session(
            &[
                ("main.sx", "(def child (ak.start \"child.sx\" \"work\" :inputs {\"k\" 4}))"),
                ("child.sx", "(defn work [k] (store.set \"seen\" k) (* k k))"),
            ],
            "",
            Vec::new(),
        )
        .await;
    let parent_id = session.session_id.clone();
    let outcome = h.worker.start_session(session).await.unwrap().await.unwrap().unwrap();
    let child_id = match outcome.state {
        SessionState::Completed { exports, .. } => match exports.get("child") {
            Some(Value::String(id)) => SessionId(id.clone()),
            other => panic!("unexpected child id {other:?}"),
        },
        other => panic!("unexpected state {other:?}"),
    };

    let state = h.wait_for_state(&child_id, SessionState::is_final).await;
    match state {
        SessionState::Completed { return_value, .. } => {
            assert_eq!(return_value, Value::Integer(16))
        }
        other => panic!("unexpected child state {other:?}"),
    }
    let child = h.store.get_session(&child_id).await.unwrap();
    assert_eq!(child.parent_session_id, Some(parent_id));
    assert_eq!(child.build_id, "bld");
    // deployment-scoped store namespace
    assert_eq!(h.store.get_value("dep", "seen").await.unwrap(), Some(Value::Integer(4)));
}

/// Caller whose poller answers 5s, then true.
struct Polling {
    verdicts: Mutex<Vec<Value>>,
    calls: Mutex<u32>,
}

#[async_trait]
impl Caller for Polling {
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
        *self.calls.lock() += 1;
        Ok(Value::String("pending".into()))
    }
}

#[tokio::test(start_paused = true)]
async fn poll_interval_delays_the_next_attempt() {
    let store = MemStore::new();
    let session_id = SessionId::from("s");
    let id = ExecutorId::new("t");
    let poller = Value::Builtin(CallValue::new(&id, "poll", &[]));
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
                function: Value::Builtin(CallValue::new(&id, "status", &[])),
                args: Vec::new(),
                kwargs: Kwargs::new(),
                poller: Some(poller.clone()),
            },
        )
        .await
        .unwrap();
    let caller = Polling {
        verdicts: Mutex::new(vec![Value::Duration(Duration::from_secs(5)), Value::Boolean(true)]),
        calls: Mutex::new(0),
    };

    let started = tokio::time::Instant::now();
    let outcome = execute_call(
        &CancellationToken::new(),
        &store,
        &caller,
        &session_id,
        0,
        Some(&poller),
        100,
    )
    .await
    .unwrap();
    assert_eq!(
        outcome,
        CallOutcome::Done(SessionCallAttemptResult::Value(Value::String("pending".into())))
    );
    assert!(started.elapsed() >= Duration::from_secs(5));
    assert_eq!(*caller.calls.lock(), 2);

    let attempts = store.get_session_call_attempts(&session_id, 0).await.unwrap();
    assert_eq!(attempts.len(), 2);
    let first = attempts[0].complete.as_ref().unwrap();
    assert!(!first.is_last);
    assert_eq!(first.retry_interval, Some(Duration::from_secs(5)));
    let second = attempts[1].complete.as_ref().unwrap();
    assert!(second.is_last);
    assert_eq!(second.retry_interval, None);
    assert!(attempts[1].started_at >= attempts[0].started_at);
}
