use anyhow::{bail, Context, Result};
use canopy_core::{normalize_path, EngineEvent, Resource, ResourceId};
use canopy_engine::{Engine, EngineConfig, EngineDeps};
use canopy_enrich::CommandCompletion;
use canopy_git::{list_worktrees, GhPeerQuery, GitStatusProvider};
use chrono::Utc;
use clap::Parser;
use serde::Serialize;
use serde_json::Value;
use std::{
    fs::OpenOptions,
    io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

const PROTOCOL_VERSION: &str = "1";
const DEFAULT_RESYNC_SECS: u64 = 30;

#[derive(Parser, Debug)]
#[command(name = "canopy-watch", about = "Watch a repository's worktrees and stream their state as JSON lines")]
struct Args {
    /// Repository (or any worktree of it) to watch. Defaults to the current directory.
    #[arg(long, default_value = "")]
    repo: String,
    /// Worktree polled on the short interval. Defaults to the one containing --repo.
    #[arg(long, default_value = "")]
    active: String,
    #[arg(long, default_value = "")]
    log_dir: String,
    /// Shell command producing change descriptions; receives the prompt on stdin.
    #[arg(long, default_value = "")]
    enrich_cmd: String,
    #[arg(long, default_value_t = false)]
    no_peers: bool,
    /// Sidecar note file, relative to each worktree.
    #[arg(long, default_value = "")]
    note_file: String,
    #[arg(long, default_value_t = 0)]
    resync_secs: u64,
    #[arg(long)]
    tick_ms: Option<u64>,
    #[arg(long)]
    active_ms: Option<u64>,
    #[arg(long)]
    background_ms: Option<u64>,
    #[arg(long)]
    debounce_ms: Option<u64>,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

#[derive(Clone, Debug)]
struct Config {
    repo: PathBuf,
    active: Option<PathBuf>,
    log_dir: String,
    enrich_cmd: Option<String>,
    peers: bool,
    resync: Duration,
    debug: bool,
    engine: EngineConfig,
}

#[derive(Debug, Serialize)]
struct Envelope {
    version: &'static str,
    #[serde(rename = "type")]
    r#type: &'static str,
    timestamp: String,
    payload: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Refresh(PathBuf),
    Enrich(PathBuf),
    Active(PathBuf),
    Peers,
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config()?;
    let log_file = init_logging(&config);

    let mut deps = EngineDeps::new(Arc::new(GitStatusProvider::new()));
    if let Some(command) = &config.enrich_cmd {
        deps = deps.with_completion(Arc::new(
            CommandCompletion::new(command.clone()).with_cwd(config.repo.clone()),
        ));
    }
    if config.peers {
        deps = deps.with_remote(Arc::new(GhPeerQuery::new()));
    }

    let engine = Arc::new(Engine::new(deps, config.engine.clone()));
    let printer = tokio::spawn(print_events(engine.subscribe()));
    let mut watch = Watch {
        engine: engine.clone(),
        repo: config.repo.clone(),
        active: None,
        active_hint: config.active.clone(),
        resources: Vec::new(),
    };
    watch
        .resync()
        .await
        .with_context(|| format!("listing worktrees of {}", config.repo.display()))?;
    info!(
        event = "watch_start",
        repo = %config.repo.display(),
        worktrees = watch.resources.len(),
        enrichment = config.enrich_cmd.is_some(),
        peers = config.peers,
        log_file = ?log_file
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut resync = tokio::time::interval(config.resync);
    resync.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = resync.tick() => {
                if let Err(err) = watch.resync().await {
                    warn!(event = "resync_failed", error = %err);
                }
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match parse_command(&line) {
                        Ok(command) => watch.apply(command).await,
                        Err(err) => warn!(event = "command_invalid", line = %line, error = %err),
                    }
                }
                Ok(None) => {
                    debug!(event = "stdin_closed");
                    stdin_open = false;
                }
                Err(err) => {
                    warn!(event = "stdin_error", error = %err);
                    stdin_open = false;
                }
            },
        }
    }

    info!(event = "watch_stop");
    engine.stop();
    printer.abort();
    Ok(())
}

struct Watch {
    engine: Arc<Engine>,
    repo: PathBuf,
    active: Option<ResourceId>,
    /// `--active` path, resolved against the first listing.
    active_hint: Option<PathBuf>,
    resources: Vec<Resource>,
}

impl Watch {
    async fn resync(&mut self) -> Result<(), canopy_core::StatusError> {
        let resources = list_worktrees(&self.repo).await?;
        if let Some(hint) = self.active_hint.take() {
            self.active = resolve_target(&resources, &hint);
        }
        let known = |id: &ResourceId| resources.iter().any(|resource| &resource.id == id);
        if !self.active.as_ref().map_or(false, known) {
            self.active = resources
                .iter()
                .find(|resource| resource.is_current)
                .map(|resource| resource.id.clone());
        }
        self.resources = resources;
        self.engine
            .sync(self.resources.clone(), self.active.clone())
            .await;
        Ok(())
    }

    async fn apply(&mut self, command: Command) {
        let path = match &command {
            Command::Peers => {
                if !self.engine.refresh_peers() {
                    warn!(event = "command_ignored", reason = "peer detection disabled");
                }
                return;
            }
            Command::Refresh(path) | Command::Enrich(path) | Command::Active(path) => path,
        };
        let Some(id) = resolve_target(&self.resources, path) else {
            warn!(event = "command_unknown_worktree", path = %path.display());
            return;
        };
        match command {
            Command::Refresh(_) => {
                self.engine.refresh(&id, false);
            }
            Command::Enrich(_) => {
                self.engine.refresh(&id, true);
            }
            Command::Active(_) => {
                info!(event = "active_changed", active = %id);
                self.active = Some(id);
                self.engine
                    .sync(self.resources.clone(), self.active.clone())
                    .await;
            }
            Command::Peers => {}
        }
    }
}

fn parse_command(line: &str) -> Result<Command> {
    let line = line.trim();
    let (verb, rest) = match line.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (line, ""),
    };
    let path = || -> Result<PathBuf> {
        if rest.is_empty() {
            bail!("`{verb}` needs a worktree path");
        }
        Ok(PathBuf::from(rest))
    };
    match verb {
        "refresh" => Ok(Command::Refresh(path()?)),
        "enrich" => Ok(Command::Enrich(path()?)),
        "active" => Ok(Command::Active(path()?)),
        "peers" => Ok(Command::Peers),
        other => bail!("unknown command `{other}`"),
    }
}

/// Worktree containing `path`; the deepest one wins for nested worktrees.
fn resolve_target(resources: &[Resource], path: &Path) -> Option<ResourceId> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().ok()?.join(path)
    };
    let target = normalize_path(&absolute);
    resources
        .iter()
        .filter(|resource| target.starts_with(resource.path()))
        .max_by_key(|resource| resource.path().components().count())
        .map(|resource| resource.id.clone())
}

fn envelope(event: &EngineEvent) -> serde_json::Result<String> {
    let mut value = serde_json::to_value(event)?;
    let payload = value
        .get_mut("payload")
        .map(Value::take)
        .unwrap_or(Value::Null);
    serde_json::to_string(&Envelope {
        version: PROTOCOL_VERSION,
        r#type: event.event_type(),
        timestamp: Utc::now().to_rfc3339(),
        payload,
    })
}

async fn print_events(mut events: broadcast::Receiver<EngineEvent>) {
    let mut stdout = tokio::io::stdout();
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(event = "event_stream_lagged", skipped);
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        let line = match envelope(&event) {
            Ok(line) => line,
            Err(err) => {
                error!(event = "event_encode_failed", error = %err);
                continue;
            }
        };
        if stdout.write_all(line.as_bytes()).await.is_err()
            || stdout.write_all(b"\n").await.is_err()
            || stdout.flush().await.is_err()
        {
            break;
        }
    }
}

fn load_config() -> Result<Config> {
    let args = Args::parse();
    let repo = resolve_repo(&args.repo)?;
    let active = non_empty(&args.active).map(PathBuf::from);
    let mut engine = EngineConfig::default();
    if let Some(note_file) = resolve_note_file(&args.note_file) {
        engine.monitor.note_file = Some(PathBuf::from(note_file));
    }
    if let Some(ms) = args.tick_ms {
        engine.scheduler.tick_interval = Duration::from_millis(ms.max(1));
    }
    if let Some(ms) = args.active_ms {
        engine.scheduler.active_interval = Duration::from_millis(ms);
    }
    if let Some(ms) = args.background_ms {
        engine.scheduler.background_interval = Duration::from_millis(ms);
    }
    if let Some(ms) = args.debounce_ms {
        engine.monitor.enrich_debounce = Duration::from_millis(ms);
    }

    Ok(Config {
        repo,
        active,
        log_dir: resolve_log_dir(&args.log_dir),
        enrich_cmd: resolve_enrich_cmd(&args.enrich_cmd),
        peers: !(args.no_peers || env_true("CANOPY_NO_PEERS")),
        resync: Duration::from_secs(resolve_resync_secs(args.resync_secs).max(1)),
        debug: args.debug || env_true("CANOPY_DEBUG"),
        engine,
    })
}

/// Where log lines go. Stdout always carries the event stream, so logs use a
/// per-process file, or stderr when asked to or when no file can be opened.
#[derive(Debug)]
enum LogSink {
    File { path: PathBuf, file: std::fs::File },
    Stderr,
}

fn log_sink(log_dir: &str, stderr_requested: bool) -> LogSink {
    if stderr_requested {
        return LogSink::Stderr;
    }
    let Some(dir) = non_empty(log_dir).map(PathBuf::from) else {
        return LogSink::Stderr;
    };
    let path = dir.join(format!("canopy-watch-{}.log", std::process::id()));
    let opened = std::fs::create_dir_all(&dir)
        .and_then(|_| OpenOptions::new().create(true).append(true).open(&path));
    match opened {
        Ok(file) => LogSink::File { path, file },
        Err(err) => {
            eprintln!("log_file_error: {}: {err}", path.display());
            LogSink::Stderr
        }
    }
}

/// `--debug` wins, then `CANOPY_LOG_LEVEL`, then `info`. `RUST_LOG` overrides
/// all of them in [`init_logging`].
fn log_directive(debug: bool, env_level: Option<String>) -> String {
    if debug {
        return "debug".to_string();
    }
    env_level
        .filter(|level| !level.trim().is_empty())
        .unwrap_or_else(|| "info".to_string())
}

fn init_logging(config: &Config) -> Option<PathBuf> {
    let directive = log_directive(config.debug, std::env::var("CANOPY_LOG_LEVEL").ok());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false);
    let (installed, path) = match log_sink(&config.log_dir, env_true("CANOPY_LOG_STDERR")) {
        LogSink::File { path, file } => {
            (builder.with_writer(Mutex::new(file)).try_init(), Some(path))
        }
        LogSink::Stderr => (builder.with_writer(io::stderr).try_init(), None),
    };
    installed.ok().and(path)
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn resolve_repo(repo_flag: &str) -> Result<PathBuf> {
    if let Some(repo) = non_empty(repo_flag) {
        return Ok(PathBuf::from(repo));
    }
    if let Some(repo) = env_non_empty("CANOPY_REPO") {
        return Ok(PathBuf::from(repo));
    }
    std::env::current_dir().context("resolving current directory")
}

fn resolve_log_dir(log_dir_flag: &str) -> String {
    if let Some(dir) = non_empty(log_dir_flag) {
        return dir.to_string();
    }
    env_non_empty("CANOPY_LOG_DIR").unwrap_or_else(|| ".canopy/logs".to_string())
}

fn resolve_enrich_cmd(enrich_flag: &str) -> Option<String> {
    non_empty(enrich_flag)
        .map(str::to_string)
        .or_else(|| env_non_empty("CANOPY_ENRICH_CMD"))
}

fn resolve_note_file(note_flag: &str) -> Option<String> {
    non_empty(note_flag)
        .map(str::to_string)
        .or_else(|| env_non_empty("CANOPY_NOTE_FILE"))
}

fn resolve_resync_secs(resync_flag: u64) -> u64 {
    if resync_flag > 0 {
        return resync_flag;
    }
    env_non_empty("CANOPY_RESYNC_SECS")
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(DEFAULT_RESYNC_SECS)
}
