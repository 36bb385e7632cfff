//! Error types for language plugins
//!
//! Everything a script author can cause is carried as a structured
//! [`ProgramError`] so that the call-frame stack survives all the way to the
//! persisted session state.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::values::ValueError;

/// Execution phase in which a program error was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Source compilation.
    Compile,
    /// Running a module's top level.
    Run,
    /// Calling a function value.
    Call,
}

/// Classification of a program error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgramErrorKind {
    /// Malformed source text.
    Syntax,
    /// Reference to an undefined name.
    Resolution,
    /// Uncaught failure during evaluation.
    Runtime,
    /// Evaluation was canceled.
    Canceled,
    /// The language cannot call function values.
    NotCallable,
    /// A host callback (load, call, print) failed.
    Host,
}

/// One entry of a call stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallFrame {
    /// Function name (`<toplevel>` for module code).
    pub name: String,
    /// Source path.
    pub path: String,
    /// 1-based line.
    pub line: u32,
    /// 1-based column.
    pub col: u32,
}

impl fmt::Display for CallFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{} in {}", self.path, self.line, self.col, self.name)
    }
}

/// Structured error surfaced to script authors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramError {
    /// Human readable message.
    pub message: String,
    /// Phase the error was raised in.
    pub phase: Phase,
    /// Error classification.
    pub kind: ProgramErrorKind,
    /// Call stack, outermost frame first.
    #[serde(default)]
    pub frames: Vec<CallFrame>,
}

impl ProgramError {
    /// Create an error without frames.
    pub fn new(kind: ProgramErrorKind, phase: Phase, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            phase,
            kind,
            frames: Vec::new(),
        }
    }

    /// Attach a call stack.
    pub fn with_frames(mut self, frames: Vec<CallFrame>) -> Self {
        self.frames = frames;
        self
    }

    /// Whether this error reports a cancellation.
    pub fn is_canceled(&self) -> bool {
        self.kind == ProgramErrorKind::Canceled
    }
}

impl fmt::Display for ProgramError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(frame) = self.frames.last() {
            write!(f, " ({})", frame)?;
        }
        Ok(())
    }
}

impl std::error::Error for ProgramError {}

/// Language plugin errors
#[derive(Debug, Clone, Error)]
pub enum LangError {
    /// Compile, runtime, or cancellation failure inside a script
    #[error("{0}")]
    Program(ProgramError),

    /// Module compiled by an incompatible compiler
    #[error("compiler version mismatch for {lang}: module has '{actual}', plugin is '{expected}'")]
    CompilerVersionMismatch {
        /// Language name
        lang: String,
        /// Version the plugin runs
        expected: String,
        /// Version recorded in the module
        actual: String,
    },

    /// Transport or protocol failure talking to a remote backend
    #[error("client error: {0}")]
    Client(String),

    /// Unknown language, module path, or function
    #[error("not found: {0}")]
    NotFound(String),

    /// Value conversion failure
    #[error("value error: {0}")]
    Value(#[from] ValueError),

    /// Module encoding failure
    #[error("encoding error: {0}")]
    Encoding(String),
}

impl LangError {
    /// Shorthand for a cancellation error.
    pub fn canceled(phase: Phase, reason: impl Into<String>) -> Self {
        LangError::Program(ProgramError::new(ProgramErrorKind::Canceled, phase, reason))
    }

    /// Shorthand for a runtime error.
    pub fn runtime(phase: Phase, message: impl Into<String>) -> Self {
        LangError::Program(ProgramError::new(ProgramErrorKind::Runtime, phase, message))
    }

    /// Whether this error reports a cancellation.
    pub fn is_canceled(&self) -> bool {
        matches!(self, LangError::Program(err) if err.is_canceled())
    }

    /// Convert into a structured program error, keeping structure when present.
    pub fn into_program_error(self, phase: Phase) -> ProgramError {
        match self {
            LangError::Program(err) => err,
            other => ProgramError::new(ProgramErrorKind::Host, phase, other.to_string()),
        }
    }
}

impl From<ProgramError> for LangError {
    fn from(err: ProgramError) -> Self {
        LangError::Program(err)
    }
}

/// Convenience result alias for language operations
pub type LangResult<T> = std::result::Result<T, LangError>;
