//! Wire envelopes for the remote language service.
//!
//! Every message is one JSON object per line. Requests carry a numeric id
//! chosen by the client; responses echo it. Streaming commands (`run`,
//! `call_function`) answer with an `ok` acknowledgement followed by any
//! number of `update` messages, the last of which carries a final state.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::BTreeMap;

use crate::lang::{Bindings, LangError, LangResult, Module, Phase, ProgramError, RunSummary};
use crate::runs::{LogEntry, RunId, RunState, RunUpdate};
use crate::values::{Kwargs, Value};

/// Client request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Correlation id.
    pub id: u64,
    /// Command name.
    pub command: String,
    /// Command parameters.
    #[serde(default)]
    pub params: Json,
}

/// Server response or stream item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// Id of the request this answers; `0` when the request could not be parsed.
    pub id: u64,
    /// Successful result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok: Option<Json>,
    /// Failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorEnvelope>,
    /// Run state update for streaming commands.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<RunUpdate>,
}

impl ResponseEnvelope {
    /// Successful response.
    pub fn success(id: u64, result: Json) -> Self {
        Self {
            id,
            ok: Some(result),
            error: None,
            update: None,
        }
    }

    /// Failed response.
    pub fn failure(id: u64, error: ErrorEnvelope) -> Self {
        Self {
            id,
            ok: None,
            error: Some(error),
            update: None,
        }
    }

    /// Stream item.
    pub fn update(id: u64, update: RunUpdate) -> Self {
        Self {
            id,
            ok: None,
            error: None,
            update: Some(update),
        }
    }
}

/// Structured error carried on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// Machine-readable category.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Structured payload, such as a serialized [`ProgramError`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Json>,
}

impl ErrorEnvelope {
    /// Build an envelope without details.
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    /// Map back to a language error, restoring program errors losslessly.
    pub fn into_lang_error(self) -> LangError {
        match self.code.as_str() {
            "program_error" => match self
                .details
                .and_then(|details| serde_json::from_value::<ProgramError>(details).ok())
            {
                Some(err) => LangError::Program(err),
                None => LangError::runtime(Phase::Run, self.message),
            },
            "compiler_version_mismatch" => {
                let field = |name: &str| {
                    self.details
                        .as_ref()
                        .and_then(|d| d.get(name))
                        .and_then(Json::as_str)
                        .unwrap_or_default()
                        .to_string()
                };
                LangError::CompilerVersionMismatch {
                    lang: field("lang"),
                    expected: field("expected"),
                    actual: field("actual"),
                }
            }
            "not_found" => LangError::NotFound(self.message),
            "encoding_error" => LangError::Encoding(self.message),
            _ => LangError::Client(format!("{}: {}", self.code, self.message)),
        }
    }
}

impl From<&LangError> for ErrorEnvelope {
    fn from(err: &LangError) -> Self {
        match err {
            LangError::Program(program) => Self {
                code: "program_error".into(),
                message: program.message.clone(),
                details: serde_json::to_value(program).ok(),
            },
            LangError::CompilerVersionMismatch {
                lang,
                expected,
                actual,
            } => Self {
                code: "compiler_version_mismatch".into(),
                message: err.to_string(),
                details: Some(serde_json::json!({
                    "lang": lang,
                    "expected": expected,
                    "actual": actual,
                })),
            },
            LangError::NotFound(what) => Self::new("not_found", what.clone()),
            LangError::Encoding(detail) => Self::new("encoding_error", detail.clone()),
            LangError::Client(detail) => Self::new("client_error", detail.clone()),
            LangError::Value(_) => Self::new("value_error", err.to_string()),
        }
    }
}

/// Result of a load or call handed across the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireResult<T> {
    /// Success.
    Ok(T),
    /// Failure.
    Err(ErrorEnvelope),
}

impl<T> From<LangResult<T>> for WireResult<T> {
    fn from(result: LangResult<T>) -> Self {
        match result {
            Ok(value) => WireResult::Ok(value),
            Err(err) => WireResult::Err(ErrorEnvelope::from(&err)),
        }
    }
}

impl<T> WireResult<T> {
    /// Convert back into a language result.
    pub fn into_result(self) -> LangResult<T> {
        match self {
            WireResult::Ok(value) => Ok(value),
            WireResult::Err(err) => Err(err.into_lang_error()),
        }
    }
}

/// `handshake` parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeParams {
    /// Client name, echoed back.
    pub client: String,
    /// Protocol version the client speaks.
    pub protocol_version: String,
}

/// Language advertised in the handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LangInfo {
    /// File extensions.
    pub extensions: Vec<String>,
    /// Current compiler version.
    pub compiler_version: String,
}

/// `handshake` result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandshakeInfo {
    /// Agreed protocol version.
    pub protocol_version: String,
    /// Server engine version.
    pub server_version: String,
    /// Client name echoed by the server.
    pub client: String,
    /// Languages the server can run.
    pub langs: BTreeMap<String, LangInfo>,
}

/// `compile_module` parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileParams {
    /// Language name.
    pub lang: String,
    /// Source path.
    pub path: String,
    /// Source bytes.
    pub src: Vec<u8>,
    /// Names predeclared for the module.
    #[serde(default)]
    pub predecls: Vec<String>,
}

/// `get_module_dependencies` parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleParams {
    /// Compiled module.
    pub module: Module,
}

/// `is_compiler_version_supported` parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionParams {
    /// Language name.
    pub lang: String,
    /// Version to check.
    pub version: String,
}

/// `run` parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunParams {
    /// Scope the run executes in.
    pub scope: String,
    /// Run id chosen by the client.
    pub run_id: RunId,
    /// Module to run.
    pub module: Module,
    /// Predeclared bindings.
    #[serde(default)]
    pub predecls: Bindings,
}

/// `call_function` parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallFunctionParams {
    /// Scope the function was defined in.
    pub scope: String,
    /// Run id chosen by the client.
    pub run_id: RunId,
    /// Function value.
    pub function: Value,
    /// Positional arguments.
    #[serde(default)]
    pub args: Vec<Value>,
    /// Keyword arguments.
    #[serde(default)]
    pub kwargs: Kwargs,
}

/// `run_load_return` parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadReturnParams {
    /// Target run.
    pub run_id: RunId,
    /// Load outcome.
    pub result: WireResult<Bindings>,
}

/// `run_call_return` parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallReturnParams {
    /// Target run.
    pub run_id: RunId,
    /// Call outcome.
    pub result: WireResult<Value>,
}

/// `run_cancel` parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelParams {
    /// Target run.
    pub run_id: RunId,
    /// Reason recorded on the run.
    pub reason: String,
}

/// Parameters naming a single run (`run_get`, `run_discard`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunIdParams {
    /// Target run.
    pub run_id: RunId,
}

/// `run_get` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSnapshot {
    /// Run id.
    pub run_id: RunId,
    /// Current state.
    pub state: RunState,
    /// Timestamped state log.
    pub log: Vec<LogEntry>,
    /// Print output.
    pub prints: Vec<String>,
    /// Language summary, filled once final.
    pub interpreter_summary: RunSummary,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::{CallFrame, ProgramErrorKind};

    #[test]
    fn program_errors_survive_the_wire() {
        let err = LangError::Program(
            ProgramError::new(ProgramErrorKind::Runtime, Phase::Call, "boom").with_frames(vec![
                CallFrame {
                    name: "f".into(),
                    path: "main.sx".into(),
                    line: 3,
                    col: 5,
                },
            ]),
        );
        let json = serde_json::to_string(&ErrorEnvelope::from(&err)).unwrap();
        let envelope: ErrorEnvelope = serde_json::from_str(&json).unwrap();
        match envelope.into_lang_error() {
            LangError::Program(program) => {
                assert_eq!(program.message, "boom");
                assert_eq!(program.frames.len(), 1);
                assert_eq!(program.frames[0].line, 3);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn version_mismatch_keeps_its_fields() {
        let err = LangError::CompilerVersionMismatch {
            lang: "sexpr".into(),
            expected: "sexpr-1".into(),
            actual: "sexpr-0".into(),
        };
        match ErrorEnvelope::from(&err).into_lang_error() {
            LangError::CompilerVersionMismatch { actual, .. } => assert_eq!(actual, "sexpr-0"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn responses_omit_empty_fields() {
        let response = ResponseEnvelope::success(4, serde_json::json!(true));
        let json = serde_json::to_value(response).unwrap();
        assert_eq!(json, serde_json::json!({"id": 4, "ok": true}));
    }
}
