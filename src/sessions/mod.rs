//! Durable sessions.
//!
//! A session executes one entry point of a build inside a durable workflow.
//! [`calls`] records and retries every external call, [`syscalls`] provides
//! the privileged `ak`/`time`/`store`/`env` modules, [`events`] feeds
//! connection events to subscribed sessions and [`workflow`] ties them
//! together.

pub mod calls;
pub mod events;
pub mod executors;
pub mod syscalls;
pub mod types;
pub mod workflow;

pub use calls::{CallOutcome, SessionCalls, execute_call};
pub use events::Dispatcher;
pub use executors::{
    CallContext, CallError, CallResult, Caller, Executor, Executors, Fakes, IntegrationRegistry,
    ModuleBuilder, SessionCaller, SessionRegistry,
};
pub use types::{
    Build, CodeLocation, Connection, Event, Session, SessionCallAttempt, SessionCallAttemptComplete,
    SessionCallAttemptResult, SessionCallSpec, SessionId, SessionState, Signal,
};
pub use workflow::{GLOBAL_MODULES, SessionOutcome, SessionWorker, compile_build};
