//! akrun CLI - run scripts as local sessions and serve the remote language protocol

use akrun::config::EngineConfig;
use akrun::lang::Lang;
use akrun::runs::remote::LangServer;
use akrun::sessions::{
    CodeLocation, IntegrationRegistry, Session, SessionId, SessionWorker, compile_build,
};
use akrun::store::{MemStore, SessionStore};
use akrun::values::json::from_json;
use akrun::{Catalog, Runs};
use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "akrun")]
#[command(about = "Suspendable, resumable embedded-language runs", long_about = None)]
struct Cli {
    /// Engine configuration file (JSON); defaults apply when absent
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a script as a local session
    Run {
        /// Entry module; sibling files are part of the build
        path: PathBuf,

        /// Function to call after the module's top level
        #[arg(short, long, default_value = "")]
        entry: String,

        /// Entry point input as key=<json>
        #[arg(short, long = "input")]
        inputs: Vec<String>,

        /// Environment variable exposed through `env` as KEY=VALUE
        #[arg(long = "env")]
        env_vars: Vec<String>,
    },

    /// Serve the remote language protocol over TCP
    Serve {
        /// Listen address
        #[arg(short, long, default_value = "127.0.0.1:7411")]
        listen: String,
    },

    /// List the modules a script loads
    Deps {
        /// Module to inspect
        path: PathBuf,
    },

    /// List available languages and their file extensions
    Langs,
}

fn split_pair<'a>(pair: &'a str, what: &str) -> Result<(&'a str, &'a str)> {
    pair.split_once('=')
        .ok_or_else(|| anyhow!("{what} '{pair}' must look like key=value"))
}

/// Read every file next to `path` that some language understands.
fn read_sources(catalog: &Catalog, path: &Path) -> Result<(String, BTreeMap<String, Vec<u8>>)> {
    let dir = path.parent().filter(|dir| !dir.as_os_str().is_empty()).unwrap_or(Path::new("."));
    let entry = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow!("invalid module path {:?}", path))?
        .to_string();
    let mut sources = BTreeMap::new();
    for item in std::fs::read_dir(dir).with_context(|| format!("reading {:?}", dir))? {
        let item = item?;
        let Some(name) = item.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if item.file_type()?.is_file() && catalog.lang_for_path(&name).is_some() {
            sources.insert(name, std::fs::read(item.path())?);
        }
    }
    if !sources.contains_key(&entry) {
        bail!("no language handles {:?}", path);
    }
    Ok((entry, sources))
}

async fn run(
    config: EngineConfig,
    path: PathBuf,
    entry: String,
    inputs: Vec<String>,
    env_vars: Vec<String>,
) -> Result<()> {
    let catalog = Arc::new(Catalog::with_builtin_langs(&config.catalog));
    let (entry_path, sources) = read_sources(&catalog, &path)?;

    let build_id = format!("bld_{}", uuid::Uuid::new_v4().simple());
    let build = compile_build(&catalog, &build_id, &sources, &[]).await?;
    let store = Arc::new(MemStore::new());
    store.save_build(&build).await?;

    let mut session_inputs = BTreeMap::new();
    for pair in &inputs {
        let (key, raw) = split_pair(pair, "input")?;
        let json: serde_json::Value =
            serde_json::from_str(raw).with_context(|| format!("input '{key}' is not JSON"))?;
        session_inputs.insert(key.to_string(), from_json(&json));
    }
    let mut session_env = BTreeMap::new();
    for pair in &env_vars {
        let (key, value) = split_pair(pair, "env")?;
        session_env.insert(key.to_string(), value.to_string());
    }

    let session = Session {
        session_id: SessionId::new(),
        build_id,
        deployment_id: None,
        entrypoint: CodeLocation::new(entry_path, entry),
        inputs: session_inputs,
        memo: BTreeMap::new(),
        connections: Vec::new(),
        env_vars: session_env,
        parent_session_id: None,
    };
    let session_id = session.session_id.clone();
    let worker = SessionWorker::new(
        Runs::new(catalog),
        store.clone(),
        Arc::new(IntegrationRegistry::new()),
        config,
    );
    let handle = worker.start_session(session).await?;

    let outcome = tokio::select! {
        joined = handle => joined??,
        _ = tokio::signal::ctrl_c() => {
            worker.stop_session(&session_id, "interrupted");
            bail!("interrupted");
        }
    };

    for line in store.get_session_prints(&session_id).await? {
        println!("{line}");
    }
    println!("{}", serde_json::to_string_pretty(&outcome.state)?);
    if !matches!(outcome.state, akrun::sessions::SessionState::Completed { .. }) {
        std::process::exit(1);
    }
    Ok(())
}

async fn serve(config: EngineConfig, listen: String) -> Result<()> {
    let catalog = Arc::new(Catalog::with_builtin_langs(&config.catalog));
    let server = LangServer::new(Runs::new(catalog));
    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("binding {listen}"))?;
    tracing::info!(%listen, "serving language protocol");

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.cancel();
        }
    });
    server.listen(listener).await?;
    Ok(())
}

async fn deps(config: EngineConfig, path: PathBuf) -> Result<()> {
    let catalog = Catalog::with_builtin_langs(&config.catalog);
    let name = path.to_string_lossy().to_string();
    let lang_name = catalog
        .lang_for_path(&name)
        .ok_or_else(|| anyhow!("no language handles {:?}", path))?;
    let lang = catalog.acquire(&lang_name, "")?;
    let src = std::fs::read(&path).with_context(|| format!("reading {:?}", path))?;
    let predecls: Vec<String> = akrun::sessions::GLOBAL_MODULES
        .iter()
        .map(|name| name.to_string())
        .collect();
    let module = lang.compile_module(&name, &src, &predecls).await?;
    for dep in lang.get_module_dependencies(&module).await? {
        println!("{dep}");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => EngineConfig::load_or_default(path)?,
        None => EngineConfig::default(),
    };

    match cli.command {
        Commands::Run {
            path,
            entry,
            inputs,
            env_vars,
        } => run(config, path, entry, inputs, env_vars).await,
        Commands::Serve { listen } => serve(config, listen).await,
        Commands::Deps { path } => deps(config, path).await,
        Commands::Langs => {
            let catalog = Catalog::with_builtin_langs(&config.catalog);
            for (name, extensions) in catalog.list() {
                println!("{name}\t{}", extensions.join(", "));
            }
            Ok(())
        }
    }
}
