//! Client for the remote language service.
//!
//! [`RemoteClient`] multiplexes requests over one connection by id.
//! [`RemoteLang`] implements [`Lang`] on top of it: the interpreter runs on
//! the server while loads, calls and prints are answered here, against the
//! caller's own [`RunEnv`].

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as Json;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::protocol::{
    CallFunctionParams, CallReturnParams, CancelParams, CompileParams, ErrorEnvelope,
    HandshakeInfo, HandshakeParams, LoadReturnParams, ModuleParams, RequestEnvelope,
    ResponseEnvelope, RunIdParams, RunParams, RunSnapshot, VersionParams, WireResult,
};
use crate::PROTOCOL_VERSION;
use crate::config::RemoteConfig;
use crate::lang::catalog::{Catalog, CatalogEntry};
use crate::lang::{
    Bindings, Lang, LangError, LangResult, Module, Phase, ProgramError, ProgramErrorKind,
    RunEnv, RunSummary,
};
use crate::runs::{RunId, RunState};
use crate::values::{Kwargs, Value};

/// Errors produced by the [`RemoteClient`].
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// I/O failure on the connection.
    #[error("io error: {0}")]
    Io(String),
    /// Envelope could not be encoded or decoded.
    #[error("json error: {0}")]
    Json(String),
    /// The connection closed before a response arrived.
    #[error("connection closed")]
    Closed,
    /// The server answered with an error.
    #[error("{}: {}", .0.code, .0.message)]
    Remote(ErrorEnvelope),
    /// The server sent something the client cannot interpret.
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        ClientError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Json(err.to_string())
    }
}

impl From<ClientError> for LangError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Remote(envelope) => envelope.into_lang_error(),
            other => LangError::Client(other.to_string()),
        }
    }
}

type Pending = Arc<Mutex<Option<HashMap<u64, mpsc::UnboundedSender<ResponseEnvelope>>>>>;

/// Connection to a remote language service.
pub struct RemoteClient {
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    pending: Pending,
    next_id: AtomicU64,
    handshake: HandshakeInfo,
}

impl RemoteClient {
    /// Connect over an arbitrary stream pair and perform the handshake.
    pub async fn connect<R, W>(reader: R, writer: W, client_name: &str) -> Result<Self, ClientError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let pending: Pending = Arc::new(Mutex::new(Some(HashMap::new())));
        let (outgoing, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_requests(writer, rx));
        tokio::spawn(read_responses(reader, pending.clone()));

        let mut client = Self {
            outgoing,
            pending,
            next_id: AtomicU64::new(1),
            handshake: HandshakeInfo::default(),
        };
        client.handshake = client
            .request(
                "handshake",
                &HandshakeParams {
                    client: client_name.to_string(),
                    protocol_version: PROTOCOL_VERSION.to_string(),
                },
            )
            .await?;
        debug!(
            server_version = %client.handshake.server_version,
            langs = client.handshake.langs.len(),
            "connected to remote language service"
        );
        Ok(client)
    }

    /// Connect to a TCP address.
    pub async fn connect_tcp(addr: &str, client_name: &str) -> Result<Self, ClientError> {
        let stream = tokio::net::TcpStream::connect(addr).await?;
        let (reader, writer) = stream.into_split();
        Self::connect(reader, writer, client_name).await
    }

    /// Handshake result.
    pub fn handshake(&self) -> &HandshakeInfo {
        &self.handshake
    }

    /// Issue a unary command and decode its result.
    pub async fn request<P, T>(&self, command: &str, params: &P) -> Result<T, ClientError>
    where
        P: Serialize,
        T: DeserializeOwned,
    {
        let (id, mut rx) = self.send(command, params)?;
        let response = rx.recv().await;
        self.forget(id);
        let response = response.ok_or(ClientError::Closed)?;
        if let Some(error) = response.error {
            return Err(ClientError::Remote(error));
        }
        let ok = response
            .ok
            .ok_or_else(|| ClientError::MalformedResponse(format!("no result for {command}")))?;
        Ok(serde_json::from_value(ok)?)
    }

    /// Issue a streaming command; every message with its id is delivered to
    /// the returned receiver until [`RemoteClient::forget`] is called.
    pub fn stream<P: Serialize>(
        &self,
        command: &str,
        params: &P,
    ) -> Result<(u64, mpsc::UnboundedReceiver<ResponseEnvelope>), ClientError> {
        self.send(command, params)
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending.lock().as_ref().map_or(0, |pending| pending.len())
    }

    /// Stop routing responses for a request id.
    pub fn forget(&self, id: u64) {
        if let Some(pending) = self.pending.lock().as_mut() {
            pending.remove(&id);
        }
    }

    fn send<P: Serialize>(
        &self,
        command: &str,
        params: &P,
    ) -> Result<(u64, mpsc::UnboundedReceiver<ResponseEnvelope>), ClientError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let envelope = RequestEnvelope {
            id,
            command: command.to_string(),
            params: serde_json::to_value(params)?,
        };
        let mut line = serde_json::to_vec(&envelope)?;
        line.push(b'\n');

        let (tx, rx) = mpsc::unbounded_channel();
        match self.pending.lock().as_mut() {
            Some(pending) => pending.insert(id, tx),
            None => return Err(ClientError::Closed),
        };
        if self.outgoing.send(line).is_err() {
            self.forget(id);
            return Err(ClientError::Closed);
        }
        Ok((id, rx))
    }
}

async fn write_requests<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Vec<u8>>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = rx.recv().await {
        let written = async {
            writer.write_all(&line).await?;
            writer.flush().await
        }
        .await;
        if let Err(err) = written {
            warn!(error = %err, "remote connection write failed");
            return;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_responses<R>(reader: R, pending: Pending)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => match serde_json::from_str::<ResponseEnvelope>(&line) {
                Ok(response) => {
                    let target = pending
                        .lock()
                        .as_ref()
                        .and_then(|pending| pending.get(&response.id).cloned());
                    match target {
                        Some(tx) => {
                            let _ = tx.send(response);
                        }
                        None => debug!(id = response.id, "dropping unrouted response"),
                    }
                }
                Err(err) => warn!(error = %err, "malformed response from remote"),
            },
            Ok(None) => break,
            Err(err) => {
                warn!(error = %err, "remote connection read failed");
                break;
            }
        }
    }
    // dropping every sender wakes all waiters with `Closed`
    pending.lock().take();
}

/// A language whose interpreter runs behind a [`RemoteClient`].
pub struct RemoteLang {
    client: Arc<RemoteClient>,
    name: String,
    compiler_version: String,
    cancel_timeout: Duration,
}

impl RemoteLang {
    /// Wrap one of the languages advertised by the server.
    pub fn new(client: Arc<RemoteClient>, name: &str, config: &RemoteConfig) -> LangResult<Self> {
        let info = client
            .handshake()
            .langs
            .get(name)
            .ok_or_else(|| LangError::NotFound(format!("remote language '{}'", name)))?;
        Ok(Self {
            compiler_version: info.compiler_version.clone(),
            client,
            name: name.to_string(),
            cancel_timeout: config.cancel_timeout(),
        })
    }

    /// Build a catalog exposing every language the server advertises.
    pub fn catalog(client: Arc<RemoteClient>, config: &RemoteConfig) -> Catalog {
        let catalog = Catalog::new(&Default::default());
        for (name, info) in &client.handshake().langs {
            let lang: Arc<dyn Lang> = Arc::new(Self {
                client: client.clone(),
                name: name.clone(),
                compiler_version: info.compiler_version.clone(),
                cancel_timeout: config.cancel_timeout(),
            });
            let extensions: Vec<&str> = info.extensions.iter().map(String::as_str).collect();
            // instances hold no interpreter state locally, so one is shared by every scope
            catalog.register(name, CatalogEntry::new(&extensions, move || lang.clone()));
        }
        catalog
    }

    #[allow(clippy::too_many_arguments)]
    async fn pump<T>(
        &self,
        cancel: CancellationToken,
        env: RunEnv,
        run_id: RunId,
        id: u64,
        mut rx: mpsc::UnboundedReceiver<ResponseEnvelope>,
        phase: Phase,
        finish: impl FnOnce(Bindings, Value) -> T,
    ) -> LangResult<(T, RunSummary)> {
        let mut cancel_sent = false;
        let outcome = loop {
            let message = if cancel_sent {
                // after a cancel the remote side must finish promptly
                match tokio::time::timeout(self.cancel_timeout, rx.recv()).await {
                    Ok(message) => message,
                    Err(_) => {
                        warn!(%run_id, "remote run did not finish after cancel");
                        let message = "remote run did not acknowledge cancel";
                        break Err(LangError::canceled(phase, message));
                    }
                }
            } else {
                tokio::select! {
                    message = rx.recv() => message,
                    _ = cancel.cancelled() => {
                        cancel_sent = true;
                        self.send_cancel(run_id).await;
                        continue;
                    }
                }
            };

            let Some(message) = message else {
                break Err(LangError::Client("remote stream closed before the run finished".into()));
            };
            if let Some(error) = message.error {
                break Err(error.into_lang_error());
            }
            let Some(update) = message.update else {
                continue;
            };
            match update.next {
                RunState::LoadWait { path } => {
                    let result = tokio::select! {
                        result = env.load(path) => result,
                        _ = cancel.cancelled() => {
                            Err(LangError::canceled(phase, "context canceled"))
                        }
                    };
                    let params = LoadReturnParams {
                        run_id,
                        result: WireResult::from(result),
                    };
                    if let Err(err) = self.answer("run_load_return", &params).await {
                        self.send_cancel(run_id).await;
                        break Err(err);
                    }
                }
                RunState::CallWait {
                    function,
                    args,
                    kwargs,
                } => {
                    let result = tokio::select! {
                        result = env.call(function, args, kwargs) => result,
                        _ = cancel.cancelled() => {
                            Err(LangError::canceled(phase, "context canceled"))
                        }
                    };
                    let params = CallReturnParams {
                        run_id,
                        result: WireResult::from(result),
                    };
                    if let Err(err) = self.answer("run_call_return", &params).await {
                        self.send_cancel(run_id).await;
                        break Err(err);
                    }
                }
                RunState::Print { text } => {
                    if let Err(err) = env.print(text).await {
                        warn!(%run_id, error = %err, "print handler failed");
                    }
                }
                RunState::Completed { bindings, value } => break Ok(finish(bindings, value)),
                RunState::Error { error } => break Err(LangError::Program(error)),
                RunState::Canceled { reason, frames } => {
                    break Err(LangError::Program(
                        ProgramError::new(ProgramErrorKind::Canceled, phase, reason)
                            .with_frames(frames),
                    ));
                }
                RunState::ClientError { message } => break Err(LangError::Client(message)),
                RunState::Running | RunState::LoadReturned | RunState::CallReturned => {}
            }
        };
        self.client.forget(id);

        let summary = self.collect(run_id).await;
        outcome.map(|value| (value, summary))
    }

    async fn answer<P: Serialize>(&self, command: &str, params: &P) -> LangResult<()> {
        match self.client.request::<_, Json>(command, params).await {
            Ok(_) => Ok(()),
            // the run moved on, typically because it was canceled meanwhile
            Err(ClientError::Remote(envelope)) if envelope.code == "wrong_state" => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn send_cancel(&self, run_id: RunId) {
        let params = CancelParams {
            run_id,
            reason: "context canceled".into(),
        };
        match tokio::time::timeout(
            self.cancel_timeout,
            self.client.request::<_, Json>("run_cancel", &params),
        )
        .await
        {
            Ok(Ok(_)) => debug!(%run_id, "remote run cancel sent"),
            Ok(Err(err)) => debug!(%run_id, error = %err, "remote run cancel rejected"),
            Err(_) => warn!(%run_id, "remote run cancel timed out"),
        }
    }

    /// Fetch the interpreter summary and discard the remote run.
    async fn collect(&self, run_id: RunId) -> RunSummary {
        let params = RunIdParams { run_id };
        let summary = match self.client.request::<_, RunSnapshot>("run_get", &params).await {
            Ok(snapshot) => snapshot.interpreter_summary,
            Err(err) => {
                debug!(%run_id, error = %err, "remote run summary unavailable");
                RunSummary::default()
            }
        };
        if let Err(err) = self.client.request::<_, Json>("run_discard", &params).await {
            warn!(%run_id, error = %err, "failed to discard remote run");
        }
        summary
    }
}

#[async_trait]
impl Lang for RemoteLang {
    fn name(&self) -> &str {
        &self.name
    }

    fn compiler_version(&self) -> String {
        self.compiler_version.clone()
    }

    async fn is_compiler_version_supported(&self, version: &str) -> LangResult<bool> {
        let params = VersionParams {
            lang: self.name.clone(),
            version: version.to_string(),
        };
        Ok(self
            .client
            .request("is_compiler_version_supported", &params)
            .await?)
    }

    async fn compile_module(
        &self,
        path: &str,
        src: &[u8],
        predecls: &[String],
    ) -> LangResult<Module> {
        let params = CompileParams {
            lang: self.name.clone(),
            path: path.to_string(),
            src: src.to_vec(),
            predecls: predecls.to_vec(),
        };
        Ok(self.client.request("compile_module", &params).await?)
    }

    async fn get_module_dependencies(&self, module: &Module) -> LangResult<Vec<String>> {
        let params = ModuleParams {
            module: module.clone(),
        };
        Ok(self
            .client
            .request("get_module_dependencies", &params)
            .await?)
    }

    async fn run_module(
        &self,
        cancel: CancellationToken,
        env: RunEnv,
        module: &Module,
    ) -> LangResult<(Bindings, RunSummary)> {
        let run_id = RunId::new();
        let params = RunParams {
            scope: env.scope.clone(),
            run_id,
            module: module.clone(),
            predecls: env.predecls.clone(),
        };
        let (id, rx) = self.client.stream("run", &params)?;
        debug!(%run_id, lang = %self.name, "started remote run");
        self.pump(cancel, env, run_id, id, rx, Phase::Run, |bindings, _| bindings)
            .await
    }

    async fn call_function(
        &self,
        cancel: CancellationToken,
        env: RunEnv,
        func: &Value,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> LangResult<(Value, RunSummary)> {
        let run_id = RunId::new();
        let params = CallFunctionParams {
            scope: env.scope.clone(),
            run_id,
            function: func.clone(),
            args,
            kwargs,
        };
        let (id, rx) = self.client.stream("call_function", &params)?;
        debug!(%run_id, lang = %self.name, "started remote call");
        self.pump(cancel, env, run_id, id, rx, Phase::Call, |_, value| value)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CatalogConfig;
    use crate::runs::remote::server::LangServer;
    use crate::runs::{Runs, channel_sink};
    use crate::values::{CallValue, ExecutorId};
    use futures::FutureExt;
    use serde_json::json;

    async fn connected() -> (Arc<RemoteClient>, LangServer) {
        let runs = Runs::new(Arc::new(Catalog::with_builtin_langs(&CatalogConfig::default())));
        let server = LangServer::new(runs);
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server_io);
        let serving = server.clone();
        tokio::spawn(async move { serving.serve(server_read, server_write).await });
        let (client_read, client_write) = tokio::io::split(client_io);
        let client = RemoteClient::connect(client_read, client_write, "test")
            .await
            .unwrap();
        (Arc::new(client), server)
    }

    #[tokio::test]
    async fn handshake_lists_builtin_langs() {
        let (client, _server) = connected().await;
        let info = client.handshake();
        assert_eq!(info.protocol_version, PROTOCOL_VERSION);
        assert_eq!(info.langs["sexpr"].compiler_version, "sexpr-1");
        assert!(info.langs.contains_key("json"));
    }

    #[tokio::test]
    async fn remote_compile_errors_keep_their_frames() {
        let (client, _server) = connected().await;
        let lang = RemoteLang::new(client, "sexpr", &RemoteConfig::default()).unwrap();
        let err = lang
            .compile_module("main.sx", b"(def x y)", &[])
            .await
            .unwrap_err();
        match err {
            LangError::Program(program) => {
                assert_eq!(program.kind, ProgramErrorKind::Resolution);
                assert!(!program.frames.is_empty());
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn remote_run_answers_calls_locally() {
        let (client, _server) = connected().await;
        let lang = RemoteLang::new(client.clone(), "sexpr", &RemoteConfig::default()).unwrap();
        let module = lang
            .compile_module("main.sx", b"(def y (ext 20))\n(print y)", &["ext".into()])
            .await
            .unwrap();
        assert_eq!(lang.get_module_dependencies(&module).await.unwrap(), Vec::<String>::new());

        let prints = Arc::new(Mutex::new(Vec::new()));
        let printed = prints.clone();
        let mut predecls = Bindings::new();
        predecls.insert(
            "ext".into(),
            Value::Builtin(CallValue::new(&ExecutorId::new("local"), "ext", &[])),
        );
        let env = RunEnv::new("scope-1")
            .with_predecls(predecls)
            .with_call(|_, args, _| {
                async move { Ok(Value::Integer(args[0].as_integer().unwrap_or(0) + 1)) }.boxed()
            })
            .with_print(move |text| {
                printed.lock().push(text);
                async { Ok(()) }.boxed()
            })
            .with_stubs();

        let (bindings, _) = lang
            .run_module(CancellationToken::new(), env, &module)
            .await
            .unwrap();
        assert_eq!(bindings.get("y"), Some(&Value::Integer(21)));
        assert_eq!(*prints.lock(), vec!["21".to_string()]);

        let runs: std::collections::BTreeMap<String, Vec<RunId>> =
            client.request("list_runs", &json!({})).await.unwrap();
        assert!(runs.is_empty(), "remote run should be discarded");
    }

    #[tokio::test]
    async fn canceling_a_remote_run_drains_the_final_state() {
        let (client, _server) = connected().await;
        let lang = RemoteLang::new(client.clone(), "sexpr", &RemoteConfig::default()).unwrap();
        let module = lang
            .compile_module("main.sx", b"(def y (ext))", &["ext".into()])
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let mut predecls = Bindings::new();
        predecls.insert(
            "ext".into(),
            Value::Builtin(CallValue::new(&ExecutorId::new("local"), "ext", &[])),
        );
        // the local call never answers until canceled
        let env = RunEnv::new("scope-2")
            .with_predecls(predecls)
            .with_call(move |_, _, _| {
                let trigger = trigger.clone();
                async move {
                    trigger.cancel();
                    futures::future::pending::<()>().await;
                    Ok(Value::None)
                }
                .boxed()
            })
            .with_stubs();

        let result = tokio::time::timeout(
            Duration::from_secs(10),
            lang.run_module(cancel.clone(), env, &module),
        )
        .await
        .expect("cancel must finish the run");
        assert!(matches!(result, Err(ref e) if e.is_canceled()));

        let runs: std::collections::BTreeMap<String, Vec<RunId>> =
            client.request("list_runs", &json!({})).await.unwrap();
        assert!(runs.is_empty());
    }

    #[tokio::test]
    async fn local_runs_can_use_a_remote_catalog() {
        let (client, _server) = connected().await;
        let catalog = Arc::new(RemoteLang::catalog(client, &RemoteConfig::default()));
        let lang = catalog.acquire("sexpr", "").unwrap();
        let module = lang
            .compile_module("main.sx", b"(def x (+ 1 2))", &[])
            .await
            .unwrap();

        let runs = Runs::new(catalog);
        let (sink, _rx) = channel_sink();
        let run = runs
            .run_module(&CancellationToken::new(), None, "s", &module, Bindings::new(), sink)
            .await
            .unwrap();
        match run.wait().await {
            RunState::Completed { bindings, .. } => {
                assert_eq!(bindings.get("x"), Some(&Value::Integer(3)))
            }
            other => panic!("unexpected state {other:?}"),
        }
    }

    #[tokio::test]
    async fn a_rejected_answer_still_releases_the_stream() {
        let (client, _server) = connected().await;
        let lang = RemoteLang::new(client.clone(), "sexpr", &RemoteConfig::default()).unwrap();
        let module = lang
            .compile_module("main.sx", b"(def y (ext))", &["ext".into()])
            .await
            .unwrap();

        let mut predecls = Bindings::new();
        predecls.insert(
            "ext".into(),
            Value::Builtin(CallValue::new(&ExecutorId::new("local"), "ext", &[])),
        );
        // the remote run is canceled and discarded before the answer arrives
        let remote = client.clone();
        let env = RunEnv::new("scope-3")
            .with_predecls(predecls)
            .with_call(move |_, _, _| {
                let remote = remote.clone();
                async move {
                    let runs: std::collections::BTreeMap<String, Vec<RunId>> =
                        remote.request("list_runs", &json!({})).await.unwrap();
                    let run_id = runs["scope-3"][0];
                    let cancel = CancelParams {
                        run_id,
                        reason: "gone".into(),
                    };
                    remote.request::<_, Json>("run_cancel", &cancel).await.unwrap();
                    let params = RunIdParams { run_id };
                    while remote.request::<_, Json>("run_discard", &params).await.is_err() {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                    Ok(Value::None)
                }
                .boxed()
            })
            .with_stubs();

        let result = tokio::time::timeout(
            Duration::from_secs(10),
            lang.run_module(CancellationToken::new(), env, &module),
        )
        .await
        .expect("the run must end once its answer is rejected");
        assert!(result.is_err());
        assert_eq!(client.pending_len(), 0);
    }
}
