//! S-expression scripting language.
//!
//! ```text
//! (load "helpers.sx" retry)
//! (defn main [name]
//!   (print "hello" name)
//!   (http.get (str "https://example.com/" name)))
//! ```
//!
//! Compilation parses and resolves the source; the compiled form is the
//! resolved program serialized as JSON. Execution happens on a blocking thread
//! per run, and closures are kept in a per-instance [`native::FunctionTable`].

pub mod ast;
pub mod builtins;
pub mod eval;
pub mod native;
pub mod parser;
pub mod resolve;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use self::ast::CompiledProgram;
use self::eval::Interpreter;
use self::native::FunctionTable;
use super::{
    Bindings, Lang, LangError, LangResult, Module, Phase, ProgramError, ProgramErrorKind, RunEnv,
    RunSummary,
};
use crate::values::{Kwargs, Value, ValueError};

/// Language name.
pub const LANG_NAME: &str = "sexpr";

/// Compiler version stamped into modules.
pub const COMPILER_VERSION: &str = "sexpr-1";

/// The S-expression language plugin.
#[derive(Debug)]
pub struct SexprLang {
    table: Arc<Mutex<FunctionTable>>,
}

impl Default for SexprLang {
    fn default() -> Self {
        Self::new()
    }
}

impl SexprLang {
    /// Create an instance with an empty function table.
    pub fn new() -> Self {
        Self {
            table: Arc::new(Mutex::new(FunctionTable::new(LANG_NAME))),
        }
    }

    fn decode(module: &Module) -> LangResult<CompiledProgram> {
        serde_json::from_slice(&module.compiled).map_err(|e| LangError::Encoding(e.to_string()))
    }
}

#[async_trait]
impl Lang for SexprLang {
    fn name(&self) -> &str {
        LANG_NAME
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
        let source = std::str::from_utf8(src).map_err(|e| {
            ProgramError::new(
                ProgramErrorKind::Syntax,
                Phase::Compile,
                format!("source is not valid utf-8: {}", e),
            )
        })?;
        let forms = parser::parse_forms(path, source)?;
        let program = resolve::resolve(path, forms, predecls)?;
        let compiled =
            serde_json::to_vec(&program).map_err(|e| LangError::Encoding(e.to_string()))?;
        debug!(path, forms = program.forms.len(), loads = program.loads.len(), "compiled module");
        Ok(Module {
            lang: LANG_NAME.to_string(),
            path: path.to_string(),
            predecls: predecls.to_vec(),
            compiler_version: COMPILER_VERSION.to_string(),
            compiled,
        })
    }

    async fn get_module_dependencies(&self, module: &Module) -> LangResult<Vec<String>> {
        let program = Self::decode(module)?;
        Ok(program.loads.into_iter().map(|load| load.path).collect())
    }

    async fn run_module(
        &self,
        cancel: CancellationToken,
        env: RunEnv,
        module: &Module,
    ) -> LangResult<(Bindings, RunSummary)> {
        module.check_compiler_version(COMPILER_VERSION)?;
        let program = Self::decode(module)?;
        let interpreter = Interpreter::new(
            self.table.clone(),
            env,
            cancel,
            Handle::current(),
            Phase::Run,
        );
        join(
            Phase::Run,
            tokio::task::spawn_blocking(move || interpreter.run_module(&program)).await,
        )
    }

    async fn call_function(
        &self,
        cancel: CancellationToken,
        env: RunEnv,
        func: &Value,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> LangResult<(Value, RunSummary)> {
        let func = match func {
            Value::Function(func) if func.lang == LANG_NAME => func.clone(),
            Value::Function(func) => {
                return Err(ValueError::LangMismatch {
                    expected: LANG_NAME.to_string(),
                    actual: func.lang.clone(),
                }
                .into());
            }
            other => {
                return Err(ProgramError::new(
                    ProgramErrorKind::NotCallable,
                    Phase::Call,
                    format!("{} is not callable", other.type_name()),
                )
                .into());
            }
        };
        let interpreter = Interpreter::new(
            self.table.clone(),
            env,
            cancel,
            Handle::current(),
            Phase::Call,
        );
        join(
            Phase::Call,
            tokio::task::spawn_blocking(move || interpreter.call_function(&func, args, kwargs))
                .await,
        )
    }
}

fn join<T>(
    phase: Phase,
    joined: Result<LangResult<T>, tokio::task::JoinError>,
) -> LangResult<T> {
    match joined {
        Ok(result) => result,
        Err(err) => Err(ProgramError::new(
            ProgramErrorKind::Host,
            phase,
            format!("interpreter thread failed: {}", err),
        )
        .into()),
    }
}
