//! Session records shared by the call engine, the workflow and the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::lang::{Bindings, Module, ProgramError};
use crate::runs::RunId;
use crate::values::{Kwargs, Value};

/// Session identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    /// Generate a fresh id.
    ///
    /// Workflow code must derive ids through the workflow context instead.
    pub fn new() -> Self {
        Self(format!("ses_{}", uuid::Uuid::new_v4().simple()))
    }

    /// Borrow as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Function to invoke when a session starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeLocation {
    /// Module path within the build.
    pub path: String,
    /// Exported name to call; empty to only run the module's top level.
    #[serde(default)]
    pub name: String,
}

impl CodeLocation {
    /// Location of `name` inside `path`.
    pub fn new(path: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
        }
    }
}

/// A configured integration instance available to sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    /// Connection id; events are keyed by it.
    pub connection_id: String,
    /// Name the script sees the integration under.
    pub name: String,
    /// Integration implementing the connection.
    pub integration: String,
    /// Integration-specific settings.
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

/// Compiled modules of a deployment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Build {
    /// Build id.
    pub build_id: String,
    /// Compiled modules by path.
    pub modules: BTreeMap<String, Module>,
}

/// Everything needed to start a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Session id.
    pub session_id: SessionId,
    /// Build to execute.
    pub build_id: String,
    /// Deployment the session belongs to, if any.
    #[serde(default)]
    pub deployment_id: Option<String>,
    /// Entry point.
    pub entrypoint: CodeLocation,
    /// Inputs passed to the entry point as keyword arguments.
    #[serde(default)]
    pub inputs: BTreeMap<String, Value>,
    /// Free-form annotations.
    #[serde(default)]
    pub memo: BTreeMap<String, String>,
    /// Connections bound into the script's globals.
    #[serde(default)]
    pub connections: Vec<Connection>,
    /// Deterministic environment variables exposed as the `env` module.
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
    /// Session that started this one.
    #[serde(default)]
    pub parent_session_id: Option<SessionId>,
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    /// Recorded but not started.
    Created {
        /// Transition time.
        at: DateTime<Utc>,
    },
    /// Executing.
    Running {
        /// Transition time.
        at: DateTime<Utc>,
        /// Entry-point run, once known.
        #[serde(default)]
        run_id: Option<RunId>,
    },
    /// Finished successfully.
    Completed {
        /// Transition time.
        at: DateTime<Utc>,
        /// Top-level bindings of the entry module.
        exports: Bindings,
        /// Entry-point function result.
        return_value: Value,
    },
    /// Finished with a script or integration error.
    Error {
        /// Transition time.
        at: DateTime<Utc>,
        /// Structured error.
        error: ProgramError,
    },
    /// Canceled before finishing.
    Stopped {
        /// Transition time.
        at: DateTime<Utc>,
        /// Cancel reason.
        reason: String,
    },
}

impl SessionState {
    /// Variant name.
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Created { .. } => "created",
            SessionState::Running { .. } => "running",
            SessionState::Completed { .. } => "completed",
            SessionState::Error { .. } => "error",
            SessionState::Stopped { .. } => "stopped",
        }
    }

    /// Whether the session can no longer change state.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            SessionState::Completed { .. }
                | SessionState::Error { .. }
                | SessionState::Stopped { .. }
        )
    }
}

/// Durable description of one call site invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionCallSpec {
    /// Sequence number, unique within the session.
    pub seq: u32,
    /// Callee.
    pub function: Value,
    /// Positional arguments.
    #[serde(default)]
    pub args: Vec<Value>,
    /// Keyword arguments.
    #[serde(default)]
    pub kwargs: Kwargs,
    /// Poll predicate consulted after each successful attempt.
    #[serde(default)]
    pub poller: Option<Value>,
}

/// Outcome of one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "v", rename_all = "snake_case")]
pub enum SessionCallAttemptResult {
    /// Returned value.
    Value(Value),
    /// Structured failure.
    Error(ProgramError),
}

/// Completion record of an attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionCallAttemptComplete {
    /// Completion time.
    pub completed_at: DateTime<Utc>,
    /// No further attempts follow.
    pub is_last: bool,
    /// Delay before the next attempt.
    #[serde(default)]
    pub retry_interval: Option<Duration>,
    /// Attempt outcome.
    pub result: SessionCallAttemptResult,
}

/// One attempt at a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionCallAttempt {
    /// Owning session.
    pub session_id: SessionId,
    /// Call sequence number.
    pub seq: u32,
    /// Attempt number, starting at 0.
    pub attempt: u32,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// Set once the attempt finished.
    #[serde(default)]
    pub complete: Option<SessionCallAttemptComplete>,
}

/// Event subscription registered by a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signal {
    /// Signal id; also the workflow signal name.
    pub signal_id: String,
    /// Workflow to wake.
    pub workflow_id: String,
    /// Connection whose events match.
    pub connection_id: String,
    /// Event type filter; `None` matches every type.
    #[serde(default)]
    pub event_type: Option<String>,
}

impl Signal {
    /// Whether an event from `connection_id` of `event_type` matches.
    pub fn matches(&self, connection_id: &str, event_type: &str) -> bool {
        self.connection_id == connection_id
            && self
                .event_type
                .as_deref()
                .is_none_or(|wanted| wanted == event_type)
    }
}

/// An event received from a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Global, monotonically increasing sequence.
    pub seq: u64,
    /// Source connection.
    pub connection_id: String,
    /// Event type.
    pub event_type: String,
    /// Payload.
    pub data: BTreeMap<String, Value>,
    /// Arrival time.
    pub created_at: DateTime<Utc>,
}

impl Event {
    /// Script-facing representation.
    pub fn to_value(&self) -> Value {
        let data = self.data.iter().map(|(k, v)| (k.clone(), v.clone()));
        Value::string_dict(vec![
            ("seq".to_string(), Value::Integer(self.seq as i64)),
            ("type".to_string(), Value::String(self.event_type.clone())),
            (
                "connection_id".to_string(),
                Value::String(self.connection_id.clone()),
            ),
            ("data".to_string(), Value::string_dict(data)),
        ])
    }
}
