//! Suspendable, resumable runs.
//!
//! A [`Run`] wraps one `run_module` or `call_function` invocation as a state
//! machine. The interpreter suspends at every load and call
//! ([`RunState::LoadWait`], [`RunState::CallWait`]) and resumes only when the
//! owner answers with [`Run::return_load`] or [`Run::return_call`]. Every
//! transition is published as a [`RunUpdate`].
//!
//! ```text
//! [start] -> Running
//! Running -> LoadWait -> LoadReturned -> Running
//! Running -> CallWait -> CallReturned -> Running
//! Running -> Print -> Running
//! Running -> Completed | Error | Canceled | ClientError
//! ```

pub mod driver;
pub mod registry;
pub mod remote;
pub mod run;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

pub use driver::{RunHandler, drive};
pub use registry::{Runs, UpdateSink, channel_sink};
pub use run::Run;

use crate::lang::{
    Bindings, CallFrame, LangError, LangResult, Phase, ProgramError, ProgramErrorKind,
};
use crate::values::{Kwargs, Value};

/// Globally unique run identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Generate a fresh id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// State of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    /// Interpreter is executing.
    Running,
    /// Waiting for a module load.
    LoadWait {
        /// Requested module path.
        path: String,
    },
    /// Waiting for an external call.
    CallWait {
        /// Callee.
        function: Value,
        /// Positional arguments.
        args: Vec<Value>,
        /// Keyword arguments.
        kwargs: Kwargs,
    },
    /// A load result was handed back.
    LoadReturned,
    /// A call result was handed back.
    CallReturned,
    /// Script output; the logical state stays `Running`.
    Print {
        /// Printed text.
        text: String,
    },
    /// Finished successfully.
    Completed {
        /// Module bindings (`run_module`).
        #[serde(default)]
        bindings: Bindings,
        /// Return value (`call_function`).
        #[serde(default)]
        value: Value,
    },
    /// Finished with a script error.
    Error {
        /// Structured error.
        error: ProgramError,
    },
    /// Canceled before finishing.
    Canceled {
        /// Cancellation reason.
        reason: String,
        /// Partial call stack at the point of cancellation.
        #[serde(default)]
        frames: Vec<CallFrame>,
    },
    /// Transport failure talking to a remote backend.
    ClientError {
        /// Failure description.
        message: String,
    },
}

impl RunState {
    /// Stable state name, used for bucketing and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            RunState::Running => "running",
            RunState::LoadWait { .. } => "load_wait",
            RunState::CallWait { .. } => "call_wait",
            RunState::LoadReturned => "load_returned",
            RunState::CallReturned => "call_returned",
            RunState::Print { .. } => "print",
            RunState::Completed { .. } => "completed",
            RunState::Error { .. } => "error",
            RunState::Canceled { .. } => "canceled",
            RunState::ClientError { .. } => "client_error",
        }
    }

    /// Whether no further transitions are possible.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            RunState::Completed { .. }
                | RunState::Error { .. }
                | RunState::Canceled { .. }
                | RunState::ClientError { .. }
        )
    }

    /// Result carried by a final state, or `None` for a live state.
    pub fn into_outcome(self, phase: Phase) -> Option<LangResult<(Bindings, Value)>> {
        match self {
            RunState::Completed { bindings, value } => Some(Ok((bindings, value))),
            RunState::Error { error } => Some(Err(LangError::Program(error))),
            RunState::Canceled { reason, frames } => Some(Err(LangError::Program(
                ProgramError::new(ProgramErrorKind::Canceled, phase, reason).with_frames(frames),
            ))),
            RunState::ClientError { message } => Some(Err(LangError::Client(message))),
            _ => None,
        }
    }
}

/// One state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunUpdate {
    /// Run the update belongs to.
    pub run_id: RunId,
    /// Transition time.
    pub timestamp: DateTime<Utc>,
    /// State before the transition.
    pub previous: RunState,
    /// State after the transition.
    pub next: RunState,
}

/// Entry of a run's append-only log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Transition time.
    pub timestamp: DateTime<Utc>,
    /// State entered.
    pub state: RunState,
}

/// Run errors
#[derive(Debug, Clone, Error)]
pub enum RunError {
    /// Operation is not legal in the run's current state
    #[error("wrong state: expected {expected}, run is {actual}")]
    WrongState {
        /// State the operation requires
        expected: String,
        /// State the run is in
        actual: String,
    },

    /// Unknown run id
    #[error("run {0} not found")]
    NotFound(RunId),

    /// Run id already claimed
    #[error("run {0} already exists")]
    AlreadyExists(RunId),

    /// Language-level failure before the run could start
    #[error(transparent)]
    Lang(#[from] LangError),
}

/// Convenience result alias for run operations
pub type RunResult<T> = std::result::Result<T, RunError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_states() {
        assert!(!RunState::Running.is_final());
        assert!(!RunState::Print { text: "x".into() }.is_final());
        assert!(
            RunState::Completed {
                bindings: Bindings::new(),
                value: Value::None
            }
            .is_final()
        );
        assert!(RunState::ClientError { message: "eof".into() }.is_final());
    }

    #[test]
    fn states_serialize_with_a_tag() {
        let state = RunState::LoadWait {
            path: "lib.sx".into(),
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["state"], "load_wait");
        assert_eq!(serde_json::from_value::<RunState>(json).unwrap(), state);
    }
}
