//! akrun – suspendable, resumable embedded-language runs for durable sessions
//!
//! This crate implements the run/call engine underneath a durable automation
//! platform:
//! - A closed [`values::Value`] model shared by every embedded language
//! - Pluggable language backends behind the [`lang::Lang`] trait, cached per scope
//!   by a [`lang::catalog::Catalog`]
//! - The [`runs`] state machine that suspends a script at every load/call and
//!   resumes it through explicit returns, locally or over a remote stream
//! - The durable [`sessions`] layer that records call attempts, retries with a
//!   user-supplied poller, and drives a whole script to completion
//!
//! The orchestration substrate and persistence are consumed through the narrow
//! surfaces in [`durable`] and [`store`].

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Engine configuration.
pub mod config;
/// Durable-workflow substrate surface.
pub mod durable;
/// Language plugin interface, run environment and catalog.
pub mod lang;
/// Run state machine (local and remote).
pub mod runs;
/// Session call engine and session workflow.
pub mod sessions;
/// Persisted-state surface.
pub mod store;
/// Tagged-union values crossing the language boundary.
pub mod values;

pub use config::EngineConfig;
pub use lang::catalog::Catalog;
pub use runs::Runs;
pub use values::Value;

/// Current version of the akrun engine
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol version for the remote language service
pub const PROTOCOL_VERSION: &str = "1.0.0";
