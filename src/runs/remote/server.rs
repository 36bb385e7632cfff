//! Remote language service.
//!
//! Serves a [`Runs`] registry over one newline-delimited JSON connection.
//! Requests are dispatched concurrently; responses and run updates share a
//! single writer task so lines never interleave.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value as Json, json};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::protocol::{
    CallFunctionParams, CallReturnParams, CancelParams, CompileParams, ErrorEnvelope,
    HandshakeInfo, HandshakeParams, LangInfo, LoadReturnParams, ModuleParams, RequestEnvelope,
    ResponseEnvelope, RunIdParams, RunParams, RunSnapshot, VersionParams,
};
use crate::PROTOCOL_VERSION;
use crate::lang::LangError;
use crate::runs::{RunError, RunId, Runs, UpdateSink};

enum ServiceError {
    Parse(String),
    InvalidParams(String),
    Unsupported(String),
    Protocol(String),
    Run(RunError),
}

impl From<RunError> for ServiceError {
    fn from(err: RunError) -> Self {
        ServiceError::Run(err)
    }
}

impl From<LangError> for ServiceError {
    fn from(err: LangError) -> Self {
        ServiceError::Run(RunError::Lang(err))
    }
}

impl From<ServiceError> for ErrorEnvelope {
    fn from(error: ServiceError) -> Self {
        match error {
            ServiceError::Parse(message) => ErrorEnvelope::new("parse_error", message),
            ServiceError::InvalidParams(message) => ErrorEnvelope::new("invalid_params", message),
            ServiceError::Unsupported(command) => ErrorEnvelope::new(
                "unsupported_command",
                format!("command '{command}' is not supported"),
            ),
            ServiceError::Protocol(message) => ErrorEnvelope::new("protocol_error", message),
            ServiceError::Run(RunError::Lang(err)) => ErrorEnvelope::from(&err),
            ServiceError::Run(err @ RunError::WrongState { .. }) => {
                ErrorEnvelope::new("wrong_state", err.to_string())
            }
            ServiceError::Run(err @ RunError::NotFound(_)) => {
                ErrorEnvelope::new("not_found", err.to_string())
            }
            ServiceError::Run(err @ RunError::AlreadyExists(_)) => {
                ErrorEnvelope::new("already_exists", err.to_string())
            }
        }
    }
}

fn parse_params<T: DeserializeOwned>(value: Json) -> Result<T, ServiceError> {
    serde_json::from_value(value)
        .map_err(|err| ServiceError::InvalidParams(format!("invalid parameters: {err}")))
}

fn to_json<T: Serialize>(value: &T) -> Result<Json, ServiceError> {
    serde_json::to_value(value).map_err(|err| ServiceError::Run(RunError::Lang(
        LangError::Encoding(err.to_string()),
    )))
}

/// Serves the remote protocol on behalf of a local [`Runs`] registry.
#[derive(Clone)]
pub struct LangServer {
    runs: Runs,
    shutdown: CancellationToken,
}

impl LangServer {
    /// Create a server backed by `runs`.
    pub fn new(runs: Runs) -> Self {
        Self {
            runs,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that cancels every run started by this server when triggered.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accept connections on a TCP listener until shut down.
    pub async fn listen(&self, listener: tokio::net::TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = self.shutdown.cancelled() => return Ok(()),
            };
            info!(%peer, "accepted connection");
            let server = self.clone();
            tokio::spawn(async move {
                let (reader, writer) = stream.into_split();
                if let Err(err) = server.serve(reader, writer).await {
                    warn!(%peer, error = %err, "connection failed");
                }
            });
        }
    }

    /// Process one connection until the reader reaches end of stream.
    ///
    /// Runs started on the connection are canceled and discarded when it
    /// closes.
    pub async fn serve<R, W>(&self, reader: R, writer: W) -> std::io::Result<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel::<ResponseEnvelope>();
        let writer_task = tokio::spawn(write_responses(writer, rx));
        let connection = Arc::new(Connection {
            runs: self.runs.clone(),
            cancel: self.shutdown.child_token(),
            tx,
            handshake_completed: AtomicBool::new(false),
            started: parking_lot::Mutex::new(HashSet::new()),
        });

        let mut lines = BufReader::new(reader).lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RequestEnvelope>(&line) {
                Ok(request) => {
                    let connection = connection.clone();
                    tokio::spawn(async move { connection.handle(request).await });
                }
                Err(err) => connection.send(ResponseEnvelope::failure(
                    0,
                    ServiceError::Parse(err.to_string()).into(),
                )),
            }
        }

        connection.close();
        drop(connection);
        match writer_task.await {
            Ok(result) => result,
            Err(err) => Err(std::io::Error::other(err)),
        }
    }
}

async fn write_responses<W>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<ResponseEnvelope>,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(envelope) = rx.recv().await {
        let mut line = serde_json::to_vec(&envelope)?;
        line.push(b'\n');
        writer.write_all(&line).await?;
        writer.flush().await?;
    }
    writer.shutdown().await
}

struct Connection {
    runs: Runs,
    cancel: CancellationToken,
    tx: mpsc::UnboundedSender<ResponseEnvelope>,
    handshake_completed: AtomicBool,
    started: parking_lot::Mutex<HashSet<RunId>>,
}

impl Connection {
    fn send(&self, envelope: ResponseEnvelope) {
        // the writer only stops once every sender is gone
        let _ = self.tx.send(envelope);
    }

    async fn handle(self: Arc<Self>, request: RequestEnvelope) {
        debug!(id = request.id, command = %request.command, "remote request");
        let id = request.id;
        let response = match self.dispatch(id, &request.command, request.params).await {
            Ok(value) => ResponseEnvelope::success(id, value),
            Err(err) => ResponseEnvelope::failure(id, err.into()),
        };
        self.send(response);
    }

    async fn dispatch(&self, id: u64, command: &str, params: Json) -> Result<Json, ServiceError> {
        if command != "handshake" && !self.handshake_completed.load(Ordering::Acquire) {
            return Err(ServiceError::Protocol(
                "handshake required before issuing commands".into(),
            ));
        }
        match command {
            "handshake" => self.cmd_handshake(params),
            "compile_module" => self.cmd_compile_module(params).await,
            "get_module_dependencies" => self.cmd_get_module_dependencies(params).await,
            "is_compiler_version_supported" => self.cmd_is_compiler_version_supported(params).await,
            "run" => self.cmd_run(id, params).await,
            "call_function" => self.cmd_call_function(id, params).await,
            "run_load_return" => {
                let params: LoadReturnParams = parse_params(params)?;
                self.runs
                    .get(params.run_id)?
                    .return_load(params.result.into_result())?;
                Ok(Json::Null)
            }
            "run_call_return" => {
                let params: CallReturnParams = parse_params(params)?;
                self.runs
                    .get(params.run_id)?
                    .return_call(params.result.into_result())?;
                Ok(Json::Null)
            }
            "run_cancel" => {
                let params: CancelParams = parse_params(params)?;
                self.runs.get(params.run_id)?.cancel(&params.reason)?;
                Ok(Json::Null)
            }
            "run_get" => {
                let params: RunIdParams = parse_params(params)?;
                let run = self.runs.get(params.run_id)?;
                to_json(&RunSnapshot {
                    run_id: run.id(),
                    state: run.state(),
                    log: run.summary(),
                    prints: run.prints(),
                    interpreter_summary: run.interpreter_summary(),
                })
            }
            "run_discard" => {
                let params: RunIdParams = parse_params(params)?;
                self.runs.discard(params.run_id)?;
                self.started.lock().remove(&params.run_id);
                Ok(Json::Null)
            }
            "list_runs" => to_json(&self.runs.list()),
            other => Err(ServiceError::Unsupported(other.to_string())),
        }
    }

    fn cmd_handshake(&self, params: Json) -> Result<Json, ServiceError> {
        let params: HandshakeParams = parse_params(params)?;
        if params.protocol_version != PROTOCOL_VERSION {
            return Err(ServiceError::Protocol(format!(
                "unsupported protocol version: expected {}, got {}",
                PROTOCOL_VERSION, params.protocol_version
            )));
        }

        let catalog = self.runs.catalog();
        let mut langs = BTreeMap::new();
        for (name, extensions) in catalog.list() {
            let lang = catalog.acquire(&name, "")?;
            langs.insert(
                name,
                LangInfo {
                    extensions,
                    compiler_version: lang.compiler_version(),
                },
            );
        }
        self.handshake_completed.store(true, Ordering::Release);
        info!(client = %params.client, "handshake completed");
        to_json(&HandshakeInfo {
            protocol_version: PROTOCOL_VERSION.to_string(),
            server_version: crate::VERSION.to_string(),
            client: params.client,
            langs,
        })
    }

    async fn cmd_compile_module(&self, params: Json) -> Result<Json, ServiceError> {
        let params: CompileParams = parse_params(params)?;
        let lang = self.runs.catalog().acquire(&params.lang, "")?;
        let module = lang
            .compile_module(&params.path, &params.src, &params.predecls)
            .await?;
        to_json(&module)
    }

    async fn cmd_get_module_dependencies(&self, params: Json) -> Result<Json, ServiceError> {
        let params: ModuleParams = parse_params(params)?;
        let lang = self.runs.catalog().acquire(&params.module.lang, "")?;
        to_json(&lang.get_module_dependencies(&params.module).await?)
    }

    async fn cmd_is_compiler_version_supported(&self, params: Json) -> Result<Json, ServiceError> {
        let params: VersionParams = parse_params(params)?;
        let lang = self.runs.catalog().acquire(&params.lang, "")?;
        Ok(json!(lang.is_compiler_version_supported(&params.version).await?))
    }

    fn stream_sink(&self, id: u64) -> UpdateSink {
        let tx = self.tx.clone();
        Arc::new(move |update| {
            let _ = tx.send(ResponseEnvelope::update(id, update));
        })
    }

    async fn cmd_run(&self, id: u64, params: Json) -> Result<Json, ServiceError> {
        let params: RunParams = parse_params(params)?;
        let run = self
            .runs
            .run_module(
                &self.cancel,
                Some(params.run_id),
                &params.scope,
                &params.module,
                params.predecls,
                self.stream_sink(id),
            )
            .await?;
        self.started.lock().insert(run.id());
        Ok(json!({ "run_id": run.id() }))
    }

    async fn cmd_call_function(&self, id: u64, params: Json) -> Result<Json, ServiceError> {
        let params: CallFunctionParams = parse_params(params)?;
        let run = self
            .runs
            .call_function(
                &self.cancel,
                Some(params.run_id),
                &params.scope,
                &params.function,
                params.args,
                params.kwargs,
                self.stream_sink(id),
            )
            .await?;
        self.started.lock().insert(run.id());
        Ok(json!({ "run_id": run.id() }))
    }

    /// Cancel every run the peer left behind and discard the ones already final.
    fn close(&self) {
        self.cancel.cancel();
        let started: Vec<RunId> = self.started.lock().drain().collect();
        for run_id in started {
            let Ok(run) = self.runs.get(run_id) else {
                continue;
            };
            let runs = self.runs.clone();
            tokio::spawn(async move {
                run.wait().await;
                if let Err(err) = runs.discard(run_id) {
                    debug!(%run_id, error = %err, "run already gone");
                }
            });
        }
    }
}
