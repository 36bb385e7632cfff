//! Language plugin interface.
//!
//! A [`Lang`] compiles source into an opaque [`Module`], reports the module's
//! static dependencies, runs a module to produce its top-level bindings, and
//! calls function values it previously handed out. Every host interaction is
//! routed through the [`RunEnv`] passed to `run_module`/`call_function`.

pub mod catalog;
pub mod data;
pub mod env;
pub mod error;
pub mod sexpr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;

pub use env::RunEnv;
pub use error::{CallFrame, LangError, LangResult, Phase, ProgramError, ProgramErrorKind};

use crate::values::{Kwargs, Value};

/// Named values produced by running a module.
pub type Bindings = BTreeMap<String, Value>;

/// A compiled unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
    /// Language that compiled the module.
    pub lang: String,
    /// Source path.
    pub path: String,
    /// Predeclared names the module was compiled against.
    pub predecls: Vec<String>,
    /// Version of the compiler that produced `compiled`.
    pub compiler_version: String,
    /// Opaque compiled representation.
    pub compiled: Vec<u8>,
}

impl Module {
    /// Serialize the module.
    pub fn encode(&self) -> LangResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| LangError::Encoding(e.to_string()))
    }

    /// Deserialize a module.
    pub fn decode(bytes: &[u8]) -> LangResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| LangError::Encoding(e.to_string()))
    }

    /// Content digest of the encoded module.
    pub fn digest(&self) -> LangResult<String> {
        Ok(blake3::hash(&self.encode()?).to_hex().to_string())
    }

    /// Fail with [`LangError::CompilerVersionMismatch`] unless the module was
    /// compiled by `version`.
    pub fn check_compiler_version(&self, version: &str) -> LangResult<()> {
        if self.compiler_version == version {
            Ok(())
        } else {
            Err(LangError::CompilerVersionMismatch {
                lang: self.lang.clone(),
                expected: version.to_string(),
                actual: self.compiler_version.clone(),
            })
        }
    }
}

/// One interpreter-level event recorded while executing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryEntry {
    /// When the event happened.
    pub timestamp: DateTime<Utc>,
    /// Event kind (`load`, `call`, `print`).
    pub kind: String,
    /// Short description.
    pub detail: String,
}

/// Interpreter-level summary of one execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Recorded events in order.
    pub entries: Vec<SummaryEntry>,
}

impl RunSummary {
    /// Record an event.
    pub fn record(&mut self, kind: &str, detail: impl Into<String>) {
        self.entries.push(SummaryEntry {
            timestamp: Utc::now(),
            kind: kind.to_string(),
            detail: detail.into(),
        });
    }
}

/// Contract every embedded language backend implements.
///
/// `run_module` and `call_function` must execute the interpreter off the async
/// executor, race it against `cancel`, and on cancellation wait for the
/// interpreter to unwind so the reported call stack is accurate.
#[async_trait]
pub trait Lang: Send + Sync {
    /// Language name.
    fn name(&self) -> &str;

    /// Version string stamped into compiled modules.
    fn compiler_version(&self) -> String;

    /// Whether modules compiled by `version` can be executed.
    async fn is_compiler_version_supported(&self, version: &str) -> LangResult<bool> {
        Ok(version == self.compiler_version())
    }

    /// Compile source into a module.
    async fn compile_module(
        &self,
        path: &str,
        src: &[u8],
        predecls: &[String],
    ) -> LangResult<Module>;

    /// Static dependencies (load paths) of a module.
    async fn get_module_dependencies(&self, module: &Module) -> LangResult<Vec<String>>;

    /// Run a module's top level and return its bindings.
    async fn run_module(
        &self,
        cancel: CancellationToken,
        env: RunEnv,
        module: &Module,
    ) -> LangResult<(Bindings, RunSummary)>;

    /// Call a function value previously produced by this language.
    async fn call_function(
        &self,
        cancel: CancellationToken,
        env: RunEnv,
        func: &Value,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> LangResult<(Value, RunSummary)>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module() -> Module {
        Module {
            lang: "sexpr".into(),
            path: "main.sx".into(),
            predecls: vec!["ak".into()],
            compiler_version: "sexpr-1".into(),
            compiled: b"[1,2,3]".to_vec(),
        }
    }

    #[test]
    fn module_encoding_is_byte_identical() {
        let bytes = module().encode().unwrap();
        let decoded = Module::decode(&bytes).unwrap();
        assert_eq!(decoded, module());
        assert_eq!(decoded.encode().unwrap(), bytes);
        assert_eq!(decoded.digest().unwrap(), module().digest().unwrap());
    }

    #[test]
    fn version_check_rejects_other_compilers() {
        assert!(module().check_compiler_version("sexpr-1").is_ok());
        assert!(matches!(
            module().check_compiler_version("sexpr-2"),
            Err(LangError::CompilerVersionMismatch { .. })
        ));
    }
}
