//! Durable-workflow substrate surface.
//!
//! Workflow code reaches nondeterminism (wall clock, ids, I/O, timers,
//! signals) only through a [`WorkflowContext`]. Every such operation is
//! appended to the context's history the first time it executes; a context
//! rebuilt with [`WorkflowContext::replay`] returns the recorded results in
//! order instead of executing again, so a restarted workflow reaches the same
//! suspension point with the same state.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::ActivityConfig;
use crate::runs::RunError;
use crate::store::StoreError;

/// Errors raised by workflow operations.
#[derive(Debug, Clone, Error)]
pub enum WorkflowError {
    /// An activity returned an error.
    #[error("activity '{name}' failed: {message}")]
    Activity {
        /// Activity name.
        name: String,
        /// Failure detail.
        message: String,
    },
    /// An activity exceeded its schedule-to-close or heartbeat timeout.
    #[error("activity '{name}' timed out: {detail}")]
    ActivityTimeout {
        /// Activity name.
        name: String,
        /// Which timeout fired.
        detail: String,
    },
    /// The workflow was canceled.
    #[error("workflow canceled")]
    Canceled,
    /// Replay diverged from the recorded history.
    #[error("non-deterministic replay at event {index}: expected {expected}, found {found}")]
    NonDeterminism {
        /// History position.
        index: usize,
        /// What the workflow asked for.
        expected: String,
        /// What the history holds.
        found: String,
    },
    /// A recorded result could not be (de)serialized.
    #[error("encoding error: {0}")]
    Encoding(String),
    /// Persisted-state failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    /// Run registry failure.
    #[error("run error: {0}")]
    Run(#[from] RunError),
}

impl WorkflowError {
    /// Store and run registry failures are retried by the substrate and never
    /// written into history.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, WorkflowError::Store(_) | WorkflowError::Run(_))
    }
}

/// Result alias for workflow operations.
pub type WorkflowResult<T> = Result<T, WorkflowError>;

/// One recorded decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HistoryEvent {
    /// Result of a side effect.
    SideEffect {
        /// Side-effect label.
        name: String,
        /// Recorded value.
        result: Json,
    },
    /// Outcome of an activity.
    Activity {
        /// Activity name.
        name: String,
        /// Recorded value or failure message.
        result: Result<Json, String>,
    },
    /// Outcome of a local activity.
    LocalActivity {
        /// Activity name.
        name: String,
        /// Recorded value or failure message.
        result: Result<Json, String>,
    },
    /// A durable timer fired.
    Timer {
        /// Timer length in milliseconds.
        duration_ms: u64,
    },
    /// A signal selection resolved; `signal` is empty when the timeout won.
    Signal {
        /// Signal that fired.
        signal: Option<String>,
        /// Signal payload.
        payload: Json,
    },
}

impl HistoryEvent {
    fn label(&self) -> String {
        match self {
            HistoryEvent::SideEffect { name, .. } => format!("side_effect({name})"),
            HistoryEvent::Activity { name, .. } => format!("activity({name})"),
            HistoryEvent::LocalActivity { name, .. } => format!("local_activity({name})"),
            HistoryEvent::Timer { .. } => "timer".to_string(),
            HistoryEvent::Signal { .. } => "signal".to_string(),
        }
    }
}

/// Scheduling options for [`WorkflowContext::execute_activity`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityOptions {
    /// Queue the activity is dispatched on.
    pub task_queue: String,
    /// Upper bound on the whole activity, retries included.
    pub schedule_to_close: Duration,
    /// Maximum silence between heartbeats.
    pub heartbeat: Duration,
    /// Attempts made before the failure is recorded.
    pub max_attempts: u32,
}

impl From<&ActivityConfig> for ActivityOptions {
    fn from(config: &ActivityConfig) -> Self {
        Self {
            task_queue: config.task_queue.clone(),
            schedule_to_close: config.schedule_to_close(),
            heartbeat: config.heartbeat(),
            max_attempts: 1,
        }
    }
}

/// Handle given to a running activity.
#[derive(Clone)]
pub struct ActivityContext {
    last_heartbeat: Arc<Mutex<Instant>>,
    cancel: CancellationToken,
    attempt: u32,
}

impl ActivityContext {
    fn new(cancel: CancellationToken, attempt: u32) -> Self {
        Self {
            last_heartbeat: Arc::new(Mutex::new(Instant::now())),
            cancel,
            attempt,
        }
    }

    /// Report liveness.
    pub fn heartbeat(&self) {
        *self.last_heartbeat.lock() = Instant::now();
    }

    /// Token canceled when the workflow is canceled or the activity times out.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Zero-based substrate attempt.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    fn silent_for(&self) -> Duration {
        self.last_heartbeat.lock().elapsed()
    }
}

#[derive(Default)]
struct SignalHub {
    buffered: Mutex<HashMap<String, VecDeque<Json>>>,
    notify: Notify,
}

impl SignalHub {
    fn push(&self, name: &str, payload: Json) {
        self.buffered
            .lock()
            .entry(name.to_string())
            .or_default()
            .push_back(payload);
        self.notify.notify_waiters();
    }

    fn take_any(&self, names: &[String]) -> Option<(String, Json)> {
        let mut buffered = self.buffered.lock();
        names.iter().find_map(|name| {
            buffered
                .get_mut(name)
                .and_then(VecDeque::pop_front)
                .map(|payload| (name.clone(), payload))
        })
    }
}

/// Delivers signals to one workflow.
#[derive(Clone)]
pub struct SignalSender {
    workflow_id: String,
    hub: Arc<SignalHub>,
}

impl SignalSender {
    /// Workflow the sender targets.
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// Buffer a signal and wake the workflow if it is waiting.
    pub fn send(&self, name: &str, payload: Json) {
        debug!(workflow_id = %self.workflow_id, signal = name, "signal delivered");
        self.hub.push(name, payload);
    }
}

/// Routes signals to running workflows by id.
#[derive(Clone, Default)]
pub struct SignalRouter {
    senders: Arc<Mutex<HashMap<String, SignalSender>>>,
}

impl SignalRouter {
    /// Create an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a workflow reachable.
    pub fn register(&self, sender: SignalSender) {
        self.senders
            .lock()
            .insert(sender.workflow_id.clone(), sender);
    }

    /// Forget a workflow.
    pub fn unregister(&self, workflow_id: &str) {
        self.senders.lock().remove(workflow_id);
    }

    /// Signal a workflow; returns `false` if it is not running here.
    pub fn signal(&self, workflow_id: &str, name: &str, payload: Json) -> bool {
        let sender = self.senders.lock().get(workflow_id).cloned();
        match sender {
            Some(sender) => {
                sender.send(name, payload);
                true
            }
            None => false,
        }
    }
}

struct History {
    events: Vec<HistoryEvent>,
    cursor: usize,
}

/// Deterministic execution context for one workflow instance.
#[derive(Clone)]
pub struct WorkflowContext {
    workflow_id: String,
    history: Arc<Mutex<History>>,
    signals: Arc<SignalHub>,
    cancel: CancellationToken,
}

fn encode<T: Serialize>(value: &T) -> WorkflowResult<Json> {
    serde_json::to_value(value).map_err(|err| WorkflowError::Encoding(err.to_string()))
}

fn decode<T: DeserializeOwned>(value: Json) -> WorkflowResult<T> {
    serde_json::from_value(value).map_err(|err| WorkflowError::Encoding(err.to_string()))
}

impl WorkflowContext {
    /// Fresh context with empty history.
    pub fn new(workflow_id: impl Into<String>, cancel: CancellationToken) -> Self {
        Self::replay(workflow_id, Vec::new(), cancel)
    }

    /// Context that replays `history` before executing anything new.
    pub fn replay(
        workflow_id: impl Into<String>,
        history: Vec<HistoryEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            history: Arc::new(Mutex::new(History {
                events: history,
                cursor: 0,
            })),
            signals: Arc::new(SignalHub::default()),
            cancel,
        }
    }

    /// Workflow id.
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// Cancellation token of the workflow.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Snapshot of the recorded history.
    pub fn history(&self) -> Vec<HistoryEvent> {
        self.history.lock().events.clone()
    }

    /// Whether recorded events remain to be replayed.
    pub fn is_replaying(&self) -> bool {
        let history = self.history.lock();
        history.cursor < history.events.len()
    }

    /// Sender delivering signals to this workflow.
    pub fn signal_sender(&self) -> SignalSender {
        SignalSender {
            workflow_id: self.workflow_id.clone(),
            hub: self.signals.clone(),
        }
    }

    fn next_recorded(&self, expected: &str) -> WorkflowResult<Option<HistoryEvent>> {
        let mut history = self.history.lock();
        if history.cursor >= history.events.len() {
            return Ok(None);
        }
        let index = history.cursor;
        let event = history.events[index].clone();
        if event.label() != expected {
            return Err(WorkflowError::NonDeterminism {
                index,
                expected: expected.to_string(),
                found: event.label(),
            });
        }
        history.cursor += 1;
        trace!(workflow_id = %self.workflow_id, index, event = %expected, "replayed");
        Ok(Some(event))
    }

    fn record(&self, event: HistoryEvent) {
        let mut history = self.history.lock();
        history.events.push(event);
        history.cursor = history.events.len();
    }

    /// Execute `f` once and record its result; replays return the record.
    ///
    /// Failures are not recorded, so a replay after a failed side effect
    /// executes it again.
    pub async fn side_effect<T, F, Fut>(&self, name: &str, f: F) -> WorkflowResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = WorkflowResult<T>>,
    {
        let label = format!("side_effect({name})");
        if let Some(HistoryEvent::SideEffect { result, .. }) = self.next_recorded(&label)? {
            return decode(result);
        }
        let value = f().await?;
        self.record(HistoryEvent::SideEffect {
            name: name.to_string(),
            result: encode(&value)?,
        });
        Ok(value)
    }

    /// Current time, recorded.
    pub async fn now(&self) -> WorkflowResult<DateTime<Utc>> {
        self.side_effect("now", || async { Ok(Utc::now()) }).await
    }

    /// Fresh unique id, recorded.
    pub async fn new_id(&self) -> WorkflowResult<String> {
        self.side_effect("new_id", || async { Ok(uuid::Uuid::new_v4().to_string()) })
            .await
    }

    /// Run an activity with timeouts, heartbeats and bounded retries.
    pub async fn execute_activity<T, F, Fut>(
        &self,
        name: &str,
        options: &ActivityOptions,
        f: F,
    ) -> WorkflowResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: Fn(ActivityContext) -> Fut,
        Fut: Future<Output = WorkflowResult<T>>,
    {
        let label = format!("activity({name})");
        if let Some(HistoryEvent::Activity { result, .. }) = self.next_recorded(&label)? {
            return match result {
                Ok(value) => decode(value),
                Err(message) => Err(WorkflowError::Activity {
                    name: name.to_string(),
                    message,
                }),
            };
        }

        let deadline = Instant::now() + options.schedule_to_close;
        let mut attempt = 0;
        let outcome = loop {
            let activity_cancel = self.cancel.child_token();
            let ctx = ActivityContext::new(activity_cancel.clone(), attempt);
            let watchdog = {
                let ctx = ctx.clone();
                let heartbeat = options.heartbeat;
                async move {
                    loop {
                        tokio::time::sleep(heartbeat).await;
                        if ctx.silent_for() >= heartbeat {
                            break;
                        }
                    }
                }
            };
            debug!(
                workflow_id = %self.workflow_id,
                activity = name,
                task_queue = %options.task_queue,
                attempt,
                "executing activity"
            );
            let result = tokio::select! {
                result = f(ctx) => result,
                _ = watchdog => Err(WorkflowError::ActivityTimeout {
                    name: name.to_string(),
                    detail: "heartbeat".into(),
                }),
                _ = tokio::time::sleep_until(deadline) => Err(WorkflowError::ActivityTimeout {
                    name: name.to_string(),
                    detail: "schedule to close".into(),
                }),
                _ = self.cancel.cancelled() => Err(WorkflowError::Canceled),
            };
            activity_cancel.cancel();
            match result {
                Err(WorkflowError::Canceled) => return Err(WorkflowError::Canceled),
                Err(err @ (WorkflowError::Activity { .. } | WorkflowError::ActivityTimeout { .. }))
                    if attempt + 1 < options.max_attempts && Instant::now() < deadline =>
                {
                    warn!(
                        activity = name,
                        attempt,
                        error = %err,
                        "activity attempt failed, retrying"
                    );
                    attempt += 1;
                }
                other => break other,
            }
        };

        match outcome {
            Ok(value) => {
                self.record(HistoryEvent::Activity {
                    name: name.to_string(),
                    result: Ok(encode(&value)?),
                });
                Ok(value)
            }
            Err(err) if err.is_infrastructure() => {
                warn!(activity = name, error = %err, "activity hit an infrastructure failure");
                Err(err)
            }
            Err(err) => {
                self.record(HistoryEvent::Activity {
                    name: name.to_string(),
                    result: Err(err.to_string()),
                });
                Err(err)
            }
        }
    }

    /// Run short work in-process, recording its outcome.
    pub async fn execute_local_activity<T, F, Fut>(&self, name: &str, f: F) -> WorkflowResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = WorkflowResult<T>>,
    {
        let label = format!("local_activity({name})");
        if let Some(HistoryEvent::LocalActivity { result, .. }) = self.next_recorded(&label)? {
            return match result {
                Ok(value) => decode(value),
                Err(message) => Err(WorkflowError::Activity {
                    name: name.to_string(),
                    message,
                }),
            };
        }
        let result = tokio::select! {
            result = f() => result,
            _ = self.cancel.cancelled() => return Err(WorkflowError::Canceled),
        };
        if matches!(&result, Err(err) if err.is_infrastructure()) {
            return result;
        }
        let recorded = match &result {
            Ok(value) => Ok(encode(value)?),
            Err(err) => Err(err.to_string()),
        };
        self.record(HistoryEvent::LocalActivity {
            name: name.to_string(),
            result: recorded,
        });
        result
    }

    /// Durable sleep.
    pub async fn sleep(&self, duration: Duration) -> WorkflowResult<()> {
        if self.next_recorded("timer")?.is_some() {
            return Ok(());
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.cancel.cancelled() => return Err(WorkflowError::Canceled),
        }
        self.record(HistoryEvent::Timer {
            duration_ms: duration.as_millis() as u64,
        });
        Ok(())
    }

    /// Wait for the first of `names` to fire.
    ///
    /// Returns `None` if `timeout` elapses first.
    pub async fn select_signal(
        &self,
        names: &[String],
        timeout: Option<Duration>,
    ) -> WorkflowResult<Option<(String, Json)>> {
        if let Some(HistoryEvent::Signal { signal, payload }) = self.next_recorded("signal")? {
            return Ok(signal.map(|name| (name, payload)));
        }

        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let fired = loop {
            let notified = self.signals.notify.notified();
            if let Some(fired) = self.signals.take_any(names) {
                break Some(fired);
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)),
                    if deadline.is_some() => break None,
                _ = self.cancel.cancelled() => return Err(WorkflowError::Canceled),
            }
        };
        let event = match &fired {
            Some((name, payload)) => HistoryEvent::Signal {
                signal: Some(name.clone()),
                payload: payload.clone(),
            },
            None => HistoryEvent::Signal {
                signal: None,
                payload: Json::Null,
            },
        };
        self.record(event);
        Ok(fired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn options(max_attempts: u32) -> ActivityOptions {
        ActivityOptions {
            task_queue: "q".into(),
            schedule_to_close: Duration::from_secs(60),
            heartbeat: Duration::from_secs(10),
            max_attempts,
        }
    }

    #[tokio::test]
    async fn side_effects_replay_without_executing() {
        let ctx = WorkflowContext::new("wf", CancellationToken::new());
        let first: u32 = ctx.side_effect("n", || async { Ok(7) }).await.unwrap();
        let id = ctx.new_id().await.unwrap();

        let replay = WorkflowContext::replay("wf", ctx.history(), CancellationToken::new());
        assert!(replay.is_replaying());
        let again: u32 = replay
            .side_effect("n", || async { Ok(99) })
            .await
            .unwrap();
        assert_eq!(again, first);
        assert_eq!(replay.new_id().await.unwrap(), id);
        assert!(!replay.is_replaying());
    }

    #[tokio::test]
    async fn diverging_replay_is_detected() {
        let ctx = WorkflowContext::new("wf", CancellationToken::new());
        ctx.side_effect("a", || async { Ok(1) }).await.unwrap();

        let replay = WorkflowContext::replay("wf", ctx.history(), CancellationToken::new());
        let err = replay.side_effect("b", || async { Ok(1) }).await.unwrap_err();
        assert!(matches!(err, WorkflowError::NonDeterminism { index: 0, .. }));
    }

    #[tokio::test]
    async fn store_failures_are_not_replayed_as_activity_failures() {
        let ctx = WorkflowContext::new("wf", CancellationToken::new());
        let err = ctx
            .execute_activity("call", &options(1), |_| async {
                Err::<u32, _>(WorkflowError::Store(StoreError::Conflict("db down".into())))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Store(_)));
        assert!(ctx.history().is_empty());

        let replay = WorkflowContext::replay("wf", ctx.history(), CancellationToken::new());
        let value: u32 = replay
            .execute_activity("call", &options(1), |_| async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn activities_retry_until_the_attempt_budget() {
        let ctx = WorkflowContext::new("wf", CancellationToken::new());
        let calls = AtomicU32::new(0);
        let result: u32 = ctx
            .execute_activity("flaky", &options(3), |actx| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    assert_eq!(actx.attempt(), n);
                    if n < 2 {
                        Err(WorkflowError::Activity {
                            name: "flaky".into(),
                            message: "try again".into(),
                        })
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(result, 2);
        assert_eq!(ctx.history().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_activities_time_out() {
        let ctx = WorkflowContext::new("wf", CancellationToken::new());
        let err = ctx
            .execute_activity("stuck", &options(1), |_actx| async {
                futures::future::pending::<WorkflowResult<u32>>().await
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::ActivityTimeout { ref detail, .. } if detail == "heartbeat"
        ));

        let replay = WorkflowContext::replay("wf", ctx.history(), CancellationToken::new());
        let replayed = replay
            .execute_activity("stuck", &options(1), |_actx| async { Ok(1u32) })
            .await;
        assert!(matches!(replayed, Err(WorkflowError::Activity { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn select_signal_waits_for_the_first_signal() {
        let ctx = WorkflowContext::new("wf", CancellationToken::new());
        let sender = ctx.signal_sender();
        let names = vec!["a".to_string(), "b".to_string()];

        let waiter = {
            let ctx = ctx.clone();
            let names = names.clone();
            tokio::spawn(async move { ctx.select_signal(&names, None).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        sender.send("b", serde_json::json!(1));
        let fired = waiter.await.unwrap().unwrap();
        assert_eq!(fired, Some(("b".to_string(), serde_json::json!(1))));

        let timed_out = ctx
            .select_signal(&names, Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(timed_out, None);

        let replay = WorkflowContext::replay("wf", ctx.history(), CancellationToken::new());
        assert_eq!(replay.select_signal(&names, None).await.unwrap(), fired);
        assert_eq!(replay.select_signal(&names, None).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_sleep() {
        let cancel = CancellationToken::new();
        let ctx = WorkflowContext::new("wf", cancel.clone());
        let sleeper = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.sleep(Duration::from_secs(3600)).await })
        };
        tokio::task::yield_now().await;
        cancel.cancel();
        assert!(matches!(sleeper.await.unwrap(), Err(WorkflowError::Canceled)));
        assert!(ctx.history().is_empty());
    }

    #[test]
    fn router_reaches_registered_workflows_only() {
        let router = SignalRouter::new();
        let ctx = WorkflowContext::new("wf", CancellationToken::new());
        router.register(ctx.signal_sender());
        assert!(router.signal("wf", "a", Json::Null));
        assert!(!router.signal("other", "a", Json::Null));
        router.unregister("wf");
        assert!(!router.signal("wf", "a", Json::Null));
    }
}
