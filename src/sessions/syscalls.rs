//! Privileged builtin modules.
//!
//! `ak`, `time` and `store` callables carry [`CallFlag::Privileged`] and are
//! executed directly in workflow code so they take part in replay: timers,
//! signal waits and id generation go through the workflow context, store
//! access through recorded local activities. `env` is a plain module of
//! strings.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use super::types::{CodeLocation, Event, Session, SessionId, Signal};
use super::workflow::SessionWorkflow;
use crate::durable::{WorkflowError, WorkflowResult};
use crate::lang::Bindings;
use crate::values::{CallFlag, CallValue, ExecutorId, Kwargs, Value};

/// Errors raised by privileged builtins.
#[derive(Debug, Clone, Error)]
pub enum SyscallError {
    /// The script passed unusable arguments.
    #[error("{0}")]
    Usage(String),
    /// Workflow operation failed.
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
}

type SyscallResult<T> = Result<T, SyscallError>;

fn usage(message: impl Into<String>) -> SyscallError {
    SyscallError::Usage(message.into())
}

fn wrong_type(expected: &str, got: &Value) -> SyscallError {
    usage(format!("{}, got {}", expected, got.type_name()))
}

const AK_FUNCTIONS: &[&str] = &[
    "fake",
    "next_event",
    "poll",
    "sleep",
    "start",
    "subscribe",
    "unsubscribe",
];
const TIME_FUNCTIONS: &[&str] = &["now", "since"];
const STORE_FUNCTIONS: &[&str] = &["delete", "get", "set"];

fn privileged_module(name: &str, functions: &[&str]) -> Value {
    let executor = ExecutorId::new(name);
    let members = functions
        .iter()
        .map(|function| {
            (
                function.to_string(),
                Value::Builtin(CallValue::new(
                    &executor,
                    function,
                    &[CallFlag::Pure, CallFlag::Privileged],
                )),
            )
        })
        .collect();
    Value::module(name, members)
}

/// The `ak`, `time` and `store` modules.
pub fn global_modules() -> Bindings {
    [
        ("ak", AK_FUNCTIONS),
        ("time", TIME_FUNCTIONS),
        ("store", STORE_FUNCTIONS),
    ]
    .into_iter()
    .map(|(name, functions)| (name.to_string(), privileged_module(name, functions)))
    .collect()
}

/// The `env` module exposing session environment variables.
pub fn env_module(vars: &BTreeMap<String, String>) -> Value {
    let members = vars
        .iter()
        .map(|(name, value)| (name.clone(), Value::String(value.clone())))
        .collect();
    Value::module("env", members)
}

/// An event subscription and its read watermark.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Subscription {
    pub(crate) connection_id: String,
    pub(crate) event_type: Option<String>,
    /// Lowest event sequence the next read may return.
    pub(crate) next_seq: u64,
}

struct Args {
    name: String,
    args: std::vec::IntoIter<Value>,
    kwargs: Kwargs,
}

impl Args {
    fn new(name: &str, args: Vec<Value>, kwargs: Kwargs) -> Self {
        Self {
            name: name.to_string(),
            args: args.into_iter(),
            kwargs,
        }
    }

    fn next(&mut self) -> Option<Value> {
        self.args.next()
    }

    fn required(&mut self, what: &str) -> SyscallResult<Value> {
        self.next()
            .ok_or_else(|| usage(format!("{} requires {}", self.name, what)))
    }

    fn string(&mut self, what: &str) -> SyscallResult<String> {
        match self.required(what)? {
            Value::String(text) => Ok(text),
            other => Err(usage(format!(
                "{} expects {} as a string, got {}",
                self.name,
                what,
                other.type_name()
            ))),
        }
    }

    fn kwarg(&mut self, key: &str) -> Option<Value> {
        self.kwargs.remove(key)
    }

    fn rest(&mut self) -> Vec<Value> {
        self.args.by_ref().collect()
    }

    fn finish(mut self) -> SyscallResult<()> {
        if self.args.next().is_some() {
            return Err(usage(format!("{}: too many arguments", self.name)));
        }
        match self.kwargs.keys().next() {
            Some(key) => Err(usage(format!("{}: unexpected keyword :{}", self.name, key))),
            None => Ok(()),
        }
    }
}

fn string_map(value: Value, what: &str) -> SyscallResult<BTreeMap<String, Value>> {
    match value {
        Value::None => Ok(BTreeMap::new()),
        Value::Dict(items) => items
            .into_iter()
            .map(|item| match item.key {
                Value::String(key) => Ok((key, item.value)),
                other => Err(usage(format!(
                    "{} keys must be strings, got {}",
                    what,
                    other.type_name()
                ))),
            })
            .collect(),
        other => Err(usage(format!("{} must be a dict, got {}", what, other.type_name()))),
    }
}

impl SessionWorkflow {
    /// Execute a privileged builtin.
    pub(super) async fn syscall(
        &self,
        call: &CallValue,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> SyscallResult<Value> {
        let mut args = Args::new(&call.unique_id, args, kwargs);
        debug!(session_id = %self.session_id(), syscall = %call.unique_id, "syscall");
        match (call.executor.as_str(), call.name.as_str()) {
            ("ak", "poll") => {
                let poller = args.next().filter(|value| !value.is_none());
                args.finish()?;
                if let Some(poller) = &poller {
                    if poller.callable_id().is_none() {
                        return Err(wrong_type("poller must be callable", poller));
                    }
                }
                self.state.lock().poller = poller;
                Ok(Value::None)
            }
            ("ak", "fake") => {
                let target = args.required("a target callable")?;
                let replacement = args.next().filter(|value| !value.is_none());
                args.finish()?;
                let id = target
                    .callable_id()
                    .ok_or_else(|| usage(format!("cannot fake a {}", target.type_name())))?
                    .to_string();
                self.fakes.set(id, replacement);
                Ok(Value::None)
            }
            ("ak", "sleep") => {
                let duration = args.required("a duration")?;
                args.finish()?;
                let duration = duration
                    .as_duration()
                    .ok_or_else(|| usage(format!("cannot sleep for {}", duration)))?;
                self.ctx.sleep(duration).await?;
                Ok(Value::None)
            }
            ("ak", "start") => {
                let path = args.string("a module path")?;
                let name = match args.next().or_else(|| args.kwarg("name")) {
                    Some(Value::String(name)) => name,
                    Some(Value::None) | None => String::new(),
                    Some(other) => {
                        return Err(wrong_type("function name must be a string", &other));
                    }
                };
                let inputs = string_map(args.kwarg("inputs").unwrap_or_default(), "inputs")?;
                let memo = string_map(args.kwarg("memo").unwrap_or_default(), "memo")?
                    .into_iter()
                    .map(|(key, value)| (key, value.to_string()))
                    .collect();
                args.finish()?;
                let child = self.start_child(CodeLocation::new(path, name), inputs, memo).await?;
                Ok(Value::String(child.to_string()))
            }
            ("ak", "subscribe") => {
                let connection = args.string("a connection")?;
                let event_type = match args.next().or_else(|| args.kwarg("type")) {
                    Some(Value::String(event_type)) => Some(event_type),
                    Some(Value::None) | None => None,
                    Some(other) => {
                        return Err(wrong_type("event type must be a string", &other));
                    }
                };
                args.finish()?;
                self.subscribe(&connection, event_type).await.map(Value::String)
            }
            ("ak", "next_event") => {
                let timeout = match args.kwarg("timeout") {
                    Some(value) => Some(value.as_duration().ok_or_else(|| {
                        usage(format!("timeout must be a non-negative duration, got {}", value))
                    })?),
                    None => None,
                };
                let mut signal_ids = Vec::new();
                for value in args.rest() {
                    match value {
                        Value::String(id) => signal_ids.push(id),
                        Value::List(items) => {
                            for item in items {
                                match item {
                                    Value::String(id) => signal_ids.push(id),
                                    other => {
                                        return Err(wrong_type(
                                            "subscription ids must be strings",
                                            &other,
                                        ));
                                    }
                                }
                            }
                        }
                        other => {
                            return Err(wrong_type("subscription ids must be strings", &other));
                        }
                    }
                }
                args.finish()?;
                Ok(self
                    .next_event(&signal_ids, timeout)
                    .await?
                    .map_or(Value::None, |event| event.to_value()))
            }
            ("ak", "unsubscribe") => {
                let signal_id = args.string("a subscription id")?;
                args.finish()?;
                self.unsubscribe(&signal_id).await?;
                Ok(Value::None)
            }
            ("time", "now") => {
                args.finish()?;
                Ok(Value::Time(self.ctx.now().await?))
            }
            ("time", "since") => {
                let since = match args.required("a time")? {
                    Value::Time(time) => time,
                    other => return Err(wrong_type("expected a time", &other)),
                };
                args.finish()?;
                let now: DateTime<Utc> = self.ctx.now().await?;
                let elapsed = (now - since).to_std().unwrap_or(Duration::ZERO);
                Ok(Value::Duration(elapsed))
            }
            ("store", "get") => {
                let key = args.string("a key")?;
                args.finish()?;
                Ok(self.store_op("store_get", &key, None, false).await?.unwrap_or_default())
            }
            ("store", "set") => {
                let key = args.string("a key")?;
                let value = args.required("a value")?;
                args.finish()?;
                self.store_op("store_set", &key, Some(value), false).await?;
                Ok(Value::None)
            }
            ("store", "delete") => {
                let key = args.string("a key")?;
                args.finish()?;
                Ok(self.store_op("store_delete", &key, None, true).await?.unwrap_or_default())
            }
            _ => Err(usage("unknown privileged function")),
        }
    }

    async fn start_child(
        &self,
        entrypoint: CodeLocation,
        inputs: BTreeMap<String, Value>,
        memo: BTreeMap<String, String>,
    ) -> SyscallResult<SessionId> {
        let parent = &self.session;
        let worker = self.worker.clone();
        let child: SessionId = self
            .ctx
            .execute_local_activity("start_session", || async move {
                let child = Session {
                    session_id: SessionId::new(),
                    build_id: parent.build_id.clone(),
                    deployment_id: parent.deployment_id.clone(),
                    entrypoint,
                    inputs,
                    memo,
                    connections: parent.connections.clone(),
                    env_vars: parent.env_vars.clone(),
                    parent_session_id: Some(parent.session_id.clone()),
                };
                let session_id = child.session_id.clone();
                // the child runs detached; its outcome is recorded in the store
                drop(worker.start_session(child).await?);
                Ok::<_, WorkflowError>(session_id)
            })
            .await?;
        info!(session_id = %self.session_id(), child = %child, "child session started");
        Ok(child)
    }

    async fn subscribe(
        &self,
        connection: &str,
        event_type: Option<String>,
    ) -> SyscallResult<String> {
        let connection_id = self
            .session
            .connections
            .iter()
            .find(|conn| conn.name == connection || conn.connection_id == connection)
            .map(|conn| conn.connection_id.clone())
            .ok_or_else(|| usage(format!("unknown connection '{}'", connection)))?;
        let signal_id = format!("sig_{}", self.ctx.new_id().await?);

        let store = self.store().clone();
        let signal = Signal {
            signal_id: signal_id.clone(),
            workflow_id: self.ctx.workflow_id().to_string(),
            connection_id: connection_id.clone(),
            event_type: event_type.clone(),
        };
        let latest: u64 = self
            .ctx
            .execute_local_activity("subscribe", || async move {
                store.save_signal(&signal).await?;
                Ok::<_, WorkflowError>(store.latest_event_seq().await?)
            })
            .await?;

        debug!(
            session_id = %self.session_id(),
            %signal_id,
            %connection_id,
            next_seq = latest + 1,
            "subscribed"
        );
        self.state.lock().subscriptions.insert(
            signal_id.clone(),
            Subscription {
                connection_id,
                event_type,
                next_seq: latest + 1,
            },
        );
        Ok(signal_id)
    }

    async fn unsubscribe(&self, signal_id: &str) -> SyscallResult<()> {
        if self.state.lock().subscriptions.remove(signal_id).is_none() {
            return Err(usage(format!("unknown subscription '{}'", signal_id)));
        }
        let store = self.store().clone();
        self.ctx
            .execute_local_activity("unsubscribe", || async move {
                Ok::<_, WorkflowError>(store.remove_signal(signal_id).await?)
            })
            .await?;
        Ok(())
    }

    /// Read the next unread event of one subscription, advancing its watermark.
    async fn read_event(&self, signal_id: &str) -> WorkflowResult<Option<Event>> {
        let Some(subscription) = self.state.lock().subscriptions.get(signal_id).cloned() else {
            return Ok(None);
        };
        let store = self.store().clone();
        let event: Option<Event> = self
            .ctx
            .execute_local_activity("get_event", || async move {
                Ok::<_, WorkflowError>(
                    store
                        .get_event(
                            &subscription.connection_id,
                            subscription.event_type.as_deref(),
                            subscription.next_seq,
                        )
                        .await?,
                )
            })
            .await?;
        if let Some(event) = &event {
            if let Some(subscription) = self.state.lock().subscriptions.get_mut(signal_id) {
                subscription.next_seq = event.seq + 1;
            }
        }
        Ok(event)
    }

    /// Wait for the next event on any of `signal_ids`.
    ///
    /// Buffered events are returned first, in the order the ids are given.
    /// Returns `None` if `timeout` elapses before an event arrives.
    pub(super) async fn next_event(
        &self,
        signal_ids: &[String],
        timeout: Option<Duration>,
    ) -> SyscallResult<Option<Event>> {
        if signal_ids.is_empty() {
            return Err(usage("next_event requires at least one subscription"));
        }
        {
            let state = self.state.lock();
            let unknown = signal_ids
                .iter()
                .find(|id| !state.subscriptions.contains_key(*id));
            if let Some(unknown) = unknown {
                return Err(usage(format!("unknown subscription '{}'", unknown)));
            }
        }
        loop {
            for signal_id in signal_ids {
                if let Some(event) = self.read_event(signal_id).await? {
                    return Ok(Some(event));
                }
            }
            match self.ctx.select_signal(signal_ids, timeout).await? {
                None => return Ok(None),
                Some((fired, _)) => {
                    if let Some(event) = self.read_event(&fired).await? {
                        return Ok(Some(event));
                    }
                    // signal for an event an earlier scan already returned
                    debug!(session_id = %self.session_id(), signal_id = %fired, "stale signal");
                }
            }
        }
    }

    async fn store_op(
        &self,
        name: &str,
        key: &str,
        value: Option<Value>,
        delete: bool,
    ) -> SyscallResult<Option<Value>> {
        let namespace = self
            .session
            .deployment_id
            .clone()
            .unwrap_or_else(|| self.session_id().to_string());
        let store = self.store().clone();
        Ok(self
            .ctx
            .execute_local_activity(name, || async move {
                let previous = match (value, delete) {
                    (Some(value), _) => store.set_value(&namespace, key, value).await?,
                    (None, true) => store.delete_value(&namespace, key).await?,
                    (None, false) => store.get_value(&namespace, key).await?,
                };
                Ok::<_, WorkflowError>(previous)
            })
            .await?)
    }

    #[cfg(test)]
    pub(super) fn watermark(&self, signal_id: &str) -> Option<u64> {
        self.state
            .lock()
            .subscriptions
            .get(signal_id)
            .map(|subscription| subscription.next_seq)
    }
}
