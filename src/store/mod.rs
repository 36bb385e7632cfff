//! Persisted-state surface.
//!
//! The engine reads and writes sessions, call attempts, signal records and
//! events only through [`SessionStore`]. [`MemStore`] keeps everything in
//! process memory and backs tests and the CLI.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tracing::debug;

use crate::sessions::types::{
    Build, Event, Session, SessionCallAttempt, SessionCallAttemptComplete, SessionCallSpec,
    SessionId, SessionState, Signal,
};
use crate::values::Value;

/// Errors raised by a [`SessionStore`].
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Record does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// Record already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// Operation conflicts with the record's current state.
    #[error("conflict: {0}")]
    Conflict(String),
    /// Backend failure.
    #[error("backend error: {0}")]
    Backend(String),
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Narrow persistence interface consumed by the session layer.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Record a new session in the `Created` state.
    async fn create_session(&self, session: &Session) -> StoreResult<()>;
    /// Fetch a session.
    async fn get_session(&self, session_id: &SessionId) -> StoreResult<Session>;
    /// Delete a session; only final sessions may be deleted.
    async fn delete_session(&self, session_id: &SessionId) -> StoreResult<()>;
    /// Replace a session's state.
    async fn update_session_state(
        &self,
        session_id: &SessionId,
        state: SessionState,
    ) -> StoreResult<()>;
    /// Current state of a session.
    async fn get_session_state(&self, session_id: &SessionId) -> StoreResult<SessionState>;
    /// Append printed output.
    async fn add_session_print(&self, session_id: &SessionId, text: &str) -> StoreResult<()>;
    /// Printed output in order.
    async fn get_session_prints(&self, session_id: &SessionId) -> StoreResult<Vec<String>>;

    /// Persist a call spec; re-saving an identical spec is a no-op.
    async fn create_session_call_spec(
        &self,
        session_id: &SessionId,
        spec: &SessionCallSpec,
    ) -> StoreResult<()>;
    /// Fetch a call spec.
    async fn get_session_call_spec(
        &self,
        session_id: &SessionId,
        seq: u32,
    ) -> StoreResult<SessionCallSpec>;
    /// Open the next attempt for a call and return its number.
    ///
    /// Fails with [`StoreError::Conflict`] once an attempt was marked last.
    async fn start_session_call_attempt(&self, session_id: &SessionId, seq: u32)
    -> StoreResult<u32>;
    /// Complete an open attempt.
    async fn complete_session_call_attempt(
        &self,
        session_id: &SessionId,
        seq: u32,
        attempt: u32,
        complete: SessionCallAttemptComplete,
    ) -> StoreResult<()>;
    /// Every attempt of a call, in attempt order.
    async fn get_session_call_attempts(
        &self,
        session_id: &SessionId,
        seq: u32,
    ) -> StoreResult<Vec<SessionCallAttempt>>;

    /// Save a signal record.
    async fn save_signal(&self, signal: &Signal) -> StoreResult<()>;
    /// Fetch a signal record.
    async fn get_signal(&self, signal_id: &str) -> StoreResult<Signal>;
    /// Remove a signal record.
    async fn remove_signal(&self, signal_id: &str) -> StoreResult<()>;
    /// Signal records matching an event source.
    async fn list_signals(&self, connection_id: &str, event_type: &str)
    -> StoreResult<Vec<Signal>>;

    /// Append an event and return its sequence number.
    async fn save_event(
        &self,
        connection_id: &str,
        event_type: &str,
        data: BTreeMap<String, Value>,
    ) -> StoreResult<u64>;
    /// Highest sequence number assigned so far.
    async fn latest_event_seq(&self) -> StoreResult<u64>;
    /// First event at or after `min_seq` matching a connection and optional type.
    async fn get_event(
        &self,
        connection_id: &str,
        event_type: Option<&str>,
        min_seq: u64,
    ) -> StoreResult<Option<Event>>;

    /// Read a value from a namespaced key space.
    async fn get_value(&self, namespace: &str, key: &str) -> StoreResult<Option<Value>>;
    /// Write a value, returning the previous one.
    async fn set_value(&self, namespace: &str, key: &str, value: Value)
    -> StoreResult<Option<Value>>;
    /// Delete a value, returning the previous one.
    async fn delete_value(&self, namespace: &str, key: &str) -> StoreResult<Option<Value>>;

    /// Save a build.
    async fn save_build(&self, build: &Build) -> StoreResult<()>;
    /// Fetch a build.
    async fn get_build(&self, build_id: &str) -> StoreResult<Build>;
}

#[derive(Default)]
struct SessionRecord {
    session: Option<Session>,
    state: Option<SessionState>,
    prints: Vec<String>,
    specs: BTreeMap<u32, SessionCallSpec>,
    attempts: BTreeMap<u32, Vec<SessionCallAttempt>>,
}

#[derive(Default)]
struct MemInner {
    sessions: HashMap<SessionId, SessionRecord>,
    signals: BTreeMap<String, Signal>,
    events: Vec<Event>,
    values: HashMap<(String, String), Value>,
    builds: HashMap<String, Build>,
}

impl MemInner {
    fn record(&mut self, session_id: &SessionId) -> StoreResult<&mut SessionRecord> {
        self.sessions
            .get_mut(session_id)
            .filter(|record| record.session.is_some())
            .ok_or_else(|| StoreError::NotFound(format!("session {session_id}")))
    }
}

/// In-memory [`SessionStore`].
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<MemInner>,
}

impl MemStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemStore {
    async fn create_session(&self, session: &Session) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        let record = inner.sessions.entry(session.session_id.clone()).or_default();
        if record.session.is_some() {
            return Err(StoreError::AlreadyExists(format!(
                "session {}",
                session.session_id
            )));
        }
        record.session = Some(session.clone());
        record.state = Some(SessionState::Created { at: Utc::now() });
        debug!(session_id = %session.session_id, "session created");
        Ok(())
    }

    async fn get_session(&self, session_id: &SessionId) -> StoreResult<Session> {
        let mut inner = self.inner.lock();
        let record = inner.record(session_id)?;
        record
            .session
            .clone()
            .ok_or_else(|| StoreError::NotFound(format!("session {session_id}")))
    }

    async fn delete_session(&self, session_id: &SessionId) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        let record = inner.record(session_id)?;
        if !record.state.as_ref().is_some_and(SessionState::is_final) {
            return Err(StoreError::Conflict(format!(
                "session {session_id} is not in a final state"
            )));
        }
        inner.sessions.remove(session_id);
        Ok(())
    }

    async fn update_session_state(
        &self,
        session_id: &SessionId,
        state: SessionState,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        let record = inner.record(session_id)?;
        debug!(%session_id, state = state.name(), "session state");
        record.state = Some(state);
        Ok(())
    }

    async fn get_session_state(&self, session_id: &SessionId) -> StoreResult<SessionState> {
        let mut inner = self.inner.lock();
        let record = inner.record(session_id)?;
        record
            .state
            .clone()
            .ok_or_else(|| StoreError::NotFound(format!("state of session {session_id}")))
    }

    async fn add_session_print(&self, session_id: &SessionId, text: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        inner.record(session_id)?.prints.push(text.to_string());
        Ok(())
    }

    async fn get_session_prints(&self, session_id: &SessionId) -> StoreResult<Vec<String>> {
        let mut inner = self.inner.lock();
        Ok(inner.record(session_id)?.prints.clone())
    }

    async fn create_session_call_spec(
        &self,
        session_id: &SessionId,
        spec: &SessionCallSpec,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        let record = inner.record(session_id)?;
        match record.specs.get(&spec.seq) {
            Some(existing) if existing == spec => Ok(()),
            Some(_) => Err(StoreError::Conflict(format!(
                "call {} of session {session_id} already has a different spec",
                spec.seq
            ))),
            None => {
                record.specs.insert(spec.seq, spec.clone());
                Ok(())
            }
        }
    }

    async fn get_session_call_spec(
        &self,
        session_id: &SessionId,
        seq: u32,
    ) -> StoreResult<SessionCallSpec> {
        let mut inner = self.inner.lock();
        inner
            .record(session_id)?
            .specs
            .get(&seq)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("call {seq} of session {session_id}")))
    }

    async fn start_session_call_attempt(
        &self,
        session_id: &SessionId,
        seq: u32,
    ) -> StoreResult<u32> {
        let mut inner = self.inner.lock();
        let record = inner.record(session_id)?;
        if !record.specs.contains_key(&seq) {
            return Err(StoreError::NotFound(format!(
                "call {seq} of session {session_id}"
            )));
        }
        let attempts = record.attempts.entry(seq).or_default();
        if let Some(last) = attempts.last() {
            if last.complete.as_ref().is_some_and(|c| c.is_last) {
                return Err(StoreError::Conflict(format!(
                    "call {seq} of session {session_id} already finished"
                )));
            }
        }
        let attempt = attempts.last().map_or(0, |last| last.attempt + 1);
        attempts.push(SessionCallAttempt {
            session_id: session_id.clone(),
            seq,
            attempt,
            started_at: Utc::now(),
            complete: None,
        });
        Ok(attempt)
    }

    async fn complete_session_call_attempt(
        &self,
        session_id: &SessionId,
        seq: u32,
        attempt: u32,
        complete: SessionCallAttemptComplete,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        let record = inner.record(session_id)?;
        let entry = record
            .attempts
            .get_mut(&seq)
            .and_then(|attempts| attempts.iter_mut().find(|a| a.attempt == attempt))
            .ok_or_else(|| {
                StoreError::NotFound(format!(
                    "attempt {attempt} of call {seq} of session {session_id}"
                ))
            })?;
        if entry.complete.is_some() {
            return Err(StoreError::Conflict(format!(
                "attempt {attempt} of call {seq} of session {session_id} already complete"
            )));
        }
        entry.complete = Some(complete);
        Ok(())
    }

    async fn get_session_call_attempts(
        &self,
        session_id: &SessionId,
        seq: u32,
    ) -> StoreResult<Vec<SessionCallAttempt>> {
        let mut inner = self.inner.lock();
        Ok(inner
            .record(session_id)?
            .attempts
            .get(&seq)
            .cloned()
            .unwrap_or_default())
    }

    async fn save_signal(&self, signal: &Signal) -> StoreResult<()> {
        self.inner
            .lock()
            .signals
            .insert(signal.signal_id.clone(), signal.clone());
        Ok(())
    }

    async fn get_signal(&self, signal_id: &str) -> StoreResult<Signal> {
        self.inner
            .lock()
            .signals
            .get(signal_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("signal {signal_id}")))
    }

    async fn remove_signal(&self, signal_id: &str) -> StoreResult<()> {
        self.inner
            .lock()
            .signals
            .remove(signal_id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("signal {signal_id}")))
    }

    async fn list_signals(
        &self,
        connection_id: &str,
        event_type: &str,
    ) -> StoreResult<Vec<Signal>> {
        Ok(self
            .inner
            .lock()
            .signals
            .values()
            .filter(|signal| signal.matches(connection_id, event_type))
            .cloned()
            .collect())
    }

    async fn save_event(
        &self,
        connection_id: &str,
        event_type: &str,
        data: BTreeMap<String, Value>,
    ) -> StoreResult<u64> {
        let mut inner = self.inner.lock();
        let seq = inner.events.last().map_or(1, |last| last.seq + 1);
        inner.events.push(Event {
            seq,
            connection_id: connection_id.to_string(),
            event_type: event_type.to_string(),
            data,
            created_at: Utc::now(),
        });
        Ok(seq)
    }

    async fn latest_event_seq(&self) -> StoreResult<u64> {
        Ok(self.inner.lock().events.last().map_or(0, |last| last.seq))
    }

    async fn get_event(
        &self,
        connection_id: &str,
        event_type: Option<&str>,
        min_seq: u64,
    ) -> StoreResult<Option<Event>> {
        let inner = self.inner.lock();
        // events are appended in sequence order
        let start = inner.events.partition_point(|event| event.seq < min_seq);
        Ok(inner.events[start..]
            .iter()
            .find(|event| {
                event.connection_id == connection_id
                    && event_type.is_none_or(|wanted| wanted == event.event_type)
            })
            .cloned())
    }

    async fn get_value(&self, namespace: &str, key: &str) -> StoreResult<Option<Value>> {
        Ok(self
            .inner
            .lock()
            .values
            .get(&(namespace.to_string(), key.to_string()))
            .cloned())
    }

    async fn set_value(
        &self,
        namespace: &str,
        key: &str,
        value: Value,
    ) -> StoreResult<Option<Value>> {
        Ok(self
            .inner
            .lock()
            .values
            .insert((namespace.to_string(), key.to_string()), value))
    }

    async fn delete_value(&self, namespace: &str, key: &str) -> StoreResult<Option<Value>> {
        Ok(self
            .inner
            .lock()
            .values
            .remove(&(namespace.to_string(), key.to_string())))
    }

    async fn save_build(&self, build: &Build) -> StoreResult<()> {
        self.inner
            .lock()
            .builds
            .insert(build.build_id.clone(), build.clone());
        Ok(())
    }

    async fn get_build(&self, build_id: &str) -> StoreResult<Build> {
        self.inner
            .lock()
            .builds
            .get(build_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("build {build_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::types::{CodeLocation, SessionCallAttemptResult};

    fn session(id: &str) -> Session {
        Session {
            session_id: SessionId::from(id),
            build_id: "b".into(),
            deployment_id: None,
            entrypoint: CodeLocation::new("main.sx", "main"),
            inputs: BTreeMap::new(),
            memo: BTreeMap::new(),
            connections: Vec::new(),
            env_vars: BTreeMap::new(),
            parent_session_id: None,
        }
    }

    fn spec(seq: u32) -> SessionCallSpec {
        SessionCallSpec {
            seq,
            function: Value::None,
            args: Vec::new(),
            kwargs: Default::default(),
            poller: None,
        }
    }

    fn complete(is_last: bool) -> SessionCallAttemptComplete {
        SessionCallAttemptComplete {
            completed_at: Utc::now(),
            is_last,
            retry_interval: None,
            result: SessionCallAttemptResult::Value(Value::None),
        }
    }

    #[tokio::test]
    async fn sessions_can_only_be_deleted_once_final() {
        let store = MemStore::new();
        let id = SessionId::from("s1");
        store.create_session(&session("s1")).await.unwrap();
        assert!(matches!(
            store.create_session(&session("s1")).await,
            Err(StoreError::AlreadyExists(_))
        ));
        assert!(matches!(
            store.delete_session(&id).await,
            Err(StoreError::Conflict(_))
        ));
        store
            .update_session_state(
                &id,
                SessionState::Stopped {
                    at: Utc::now(),
                    reason: "done".into(),
                },
            )
            .await
            .unwrap();
        store.delete_session(&id).await.unwrap();
        assert!(matches!(
            store.get_session(&id).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn attempts_are_numbered_and_closed_by_the_last() {
        let store = MemStore::new();
        let id = SessionId::from("s1");
        store.create_session(&session("s1")).await.unwrap();
        store.create_session_call_spec(&id, &spec(0)).await.unwrap();

        assert_eq!(store.start_session_call_attempt(&id, 0).await.unwrap(), 0);
        store
            .complete_session_call_attempt(&id, 0, 0, complete(false))
            .await
            .unwrap();
        assert_eq!(store.start_session_call_attempt(&id, 0).await.unwrap(), 1);
        store
            .complete_session_call_attempt(&id, 0, 1, complete(true))
            .await
            .unwrap();
        assert!(matches!(
            store.complete_session_call_attempt(&id, 0, 1, complete(true)).await,
            Err(StoreError::Conflict(_))
        ));
        assert!(matches!(
            store.start_session_call_attempt(&id, 0).await,
            Err(StoreError::Conflict(_))
        ));
        assert_eq!(store.get_session_call_attempts(&id, 0).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn specs_are_idempotent_but_immutable() {
        let store = MemStore::new();
        let id = SessionId::from("s1");
        store.create_session(&session("s1")).await.unwrap();
        store.create_session_call_spec(&id, &spec(3)).await.unwrap();
        store.create_session_call_spec(&id, &spec(3)).await.unwrap();
        let mut other = spec(3);
        other.args.push(Value::Integer(1));
        assert!(matches!(
            store.create_session_call_spec(&id, &other).await,
            Err(StoreError::Conflict(_))
        ));
        assert!(matches!(
            store.start_session_call_attempt(&id, 4).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn events_are_read_from_a_watermark() {
        let store = MemStore::new();
        assert_eq!(store.latest_event_seq().await.unwrap(), 0);
        let a = store.save_event("c1", "push", BTreeMap::new()).await.unwrap();
        let _ = store.save_event("c2", "push", BTreeMap::new()).await.unwrap();
        let c = store.save_event("c1", "pull", BTreeMap::new()).await.unwrap();

        let first = store.get_event("c1", None, 0).await.unwrap().unwrap();
        assert_eq!(first.seq, a);
        let next = store.get_event("c1", None, first.seq + 1).await.unwrap().unwrap();
        assert_eq!(next.seq, c);
        assert!(store.get_event("c1", Some("push"), a + 1).await.unwrap().is_none());
        assert_eq!(store.latest_event_seq().await.unwrap(), c);
    }

    #[tokio::test]
    async fn signals_are_matched_by_source() {
        let store = MemStore::new();
        let signal = Signal {
            signal_id: "sig".into(),
            workflow_id: "wf".into(),
            connection_id: "c1".into(),
            event_type: None,
        };
        store.save_signal(&signal).await.unwrap();
        assert_eq!(store.list_signals("c1", "any").await.unwrap(), vec![signal.clone()]);
        assert!(store.list_signals("c2", "any").await.unwrap().is_empty());
        store.remove_signal("sig").await.unwrap();
        assert!(matches!(
            store.get_signal("sig").await,
            Err(StoreError::NotFound(_))
        ));
    }
}
