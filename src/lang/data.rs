//! Pass-through data languages.
//!
//! `text`, `json` and `binary` files can be loaded like any other module.
//! They have no dependencies, never suspend, and expose no callable values.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{
    Bindings, Lang, LangError, LangResult, Module, Phase, ProgramError, ProgramErrorKind, RunEnv,
    RunSummary,
};
use crate::values::json::from_json;
use crate::values::{Kwargs, Value};

const COMPILER_VERSION: &str = "data-1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DataKind {
    Text,
    Json,
    Binary,
}

/// A data-format language plugin.
#[derive(Debug, Clone)]
pub struct DataLang {
    kind: DataKind,
}

impl DataLang {
    /// UTF-8 text; binds `text`.
    pub fn text() -> Self {
        Self {
            kind: DataKind::Text,
        }
    }

    /// JSON; object keys become bindings, any other document binds `data`.
    pub fn json() -> Self {
        Self {
            kind: DataKind::Json,
        }
    }

    /// Raw bytes; binds `data`.
    pub fn binary() -> Self {
        Self {
            kind: DataKind::Binary,
        }
    }

    fn syntax_error(path: &str, message: String, line: u32, col: u32) -> LangError {
        ProgramError::new(ProgramErrorKind::Syntax, Phase::Compile, message)
            .with_frames(vec![super::CallFrame {
                name: "<toplevel>".into(),
                path: path.to_string(),
                line,
                col,
            }])
            .into()
    }

    fn bindings(&self, compiled: &[u8]) -> LangResult<Bindings> {
        let mut bindings = Bindings::new();
        match self.kind {
            DataKind::Text => {
                let text = String::from_utf8(compiled.to_vec())
                    .map_err(|e| LangError::Encoding(e.to_string()))?;
                bindings.insert("text".into(), Value::String(text));
            }
            DataKind::Binary => {
                bindings.insert("data".into(), Value::Bytes(compiled.to_vec()));
            }
            DataKind::Json => {
                let doc: serde_json::Value = serde_json::from_slice(compiled)
                    .map_err(|e| LangError::Encoding(e.to_string()))?;
                match &doc {
                    serde_json::Value::Object(map) => {
                        for (key, value) in map {
                            bindings.insert(key.clone(), from_json(value));
                        }
                    }
                    other => {
                        bindings.insert("data".into(), from_json(other));
                    }
                }
            }
        }
        Ok(bindings)
    }
}

#[async_trait]
impl Lang for DataLang {
    fn name(&self) -> &str {
        match self.kind {
            DataKind::Text => "text",
            DataKind::Json => "json",
            DataKind::Binary => "binary",
        }
    }

    fn compiler_version(&self) -> String {
        COMPILER_VERSION.to_string()
    }

    async fn compile_module(
        &self,
        path: &str,
        src: &[u8],
        predecls: &[String],
    ) -> LangResult<Module> {
        match self.kind {
            DataKind::Text => {
                if let Err(err) = std::str::from_utf8(src) {
                    let offset = err.valid_up_to();
                    let line = src[..offset].iter().filter(|b| **b == b'\n').count() as u32 + 1;
                    return Err(Self::syntax_error(
                        path,
                        format!("invalid utf-8: {}", err),
                        line,
                        1,
                    ));
                }
            }
            DataKind::Json => {
                if let Err(err) = serde_json::from_slice::<serde_json::Value>(src) {
                    return Err(Self::syntax_error(
                        path,
                        err.to_string(),
                        err.line() as u32,
                        err.column() as u32,
                    ));
                }
            }
            DataKind::Binary => {}
        }
        Ok(Module {
            lang: self.name().to_string(),
            path: path.to_string(),
            predecls: predecls.to_vec(),
            compiler_version: self.compiler_version(),
            compiled: src.to_vec(),
        })
    }

    async fn get_module_dependencies(&self, _module: &Module) -> LangResult<Vec<String>> {
        Ok(Vec::new())
    }

    async fn run_module(
        &self,
        cancel: CancellationToken,
        _env: RunEnv,
        module: &Module,
    ) -> LangResult<(Bindings, RunSummary)> {
        module.check_compiler_version(&self.compiler_version())?;
        if cancel.is_cancelled() {
            return Err(LangError::canceled(Phase::Run, "context canceled"));
        }
        Ok((self.bindings(&module.compiled)?, RunSummary::default()))
    }

    async fn call_function(
        &self,
        _cancel: CancellationToken,
        _env: RunEnv,
        func: &Value,
        _args: Vec<Value>,
        _kwargs: Kwargs,
    ) -> LangResult<(Value, RunSummary)> {
        Err(ProgramError::new(
            ProgramErrorKind::NotCallable,
            Phase::Call,
            format!("{} modules have no callable values ({})", self.name(), func.type_name()),
        )
        .into())
    }
}
