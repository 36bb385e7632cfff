//! Remote run backend.
//!
//! The server half executes interpreters against its own [`Runs`](crate::runs::Runs)
//! registry and streams every [`RunUpdate`](crate::runs::RunUpdate) to the
//! peer. The client half presents the same contract as a local language: it
//! answers `LoadWait`/`CallWait`/`Print` against local capabilities and feeds
//! the results back, so capability access always stays on the caller's side.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::{ClientError, RemoteClient, RemoteLang};
pub use server::LangServer;
