//! Server configuration, loaded from environment variables at startup and
//! optionally overridden from the command line.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

/// Which Generation Executor backs the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExecutorKind {
    /// Run the external inference command.
    Command,
    /// Render silent WAVs; for smoke tests without a model.
    Silent,
}

/// Runtime configuration for cadenza-server.
///
/// Every field has a default so the server starts without any environment
/// variables set.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP address to bind (default: `"0.0.0.0:8000"`).
    pub bind_address: String,

    /// Root of the per-task storage tree (default: `"./api_storage"`).
    pub storage_path: PathBuf,

    /// `tracing` filter string, e.g. `"info"` or `"debug,tower_http=warn"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,

    /// Also write logs to a daily-rolling file in this directory.
    pub log_dir: Option<PathBuf>,

    /// Comma-separated allowed origins; `None` or `"*"` allows any.
    pub cors_allowed_origins: Option<String>,

    pub enable_swagger: bool,

    /// How long a task is kept after creation.
    pub retention: Duration,

    pub sweep_interval: Duration,

    /// Tasks allowed in `processing` at once.
    pub max_concurrent_jobs: usize,

    /// Submissions allowed to wait for the worker.
    pub queue_capacity: usize,

    /// Per-task executor deadline; `None` means unbounded.
    pub job_timeout: Option<Duration>,

    /// Keep uploaded inputs after a task finishes.
    pub retain_inputs: bool,

    /// Request body limit for submissions, in bytes.
    pub max_upload_bytes: usize,

    pub executor: ExecutorKind,

    /// Program and leading arguments of the inference command.
    pub infer_program: String,
    pub infer_args: Vec<String>,
    pub infer_workdir: Option<PathBuf>,
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let env_or = |key: &str, default: &str| var(key).unwrap_or_else(|| default.to_owned());
        let secs = |key: &str, default: u64| Duration::from_secs(parse(var(key), default));

        Self {
            bind_address: env_or("CADENZA_BIND", "0.0.0.0:8000"),
            storage_path: PathBuf::from(env_or("CADENZA_STORAGE_PATH", "./api_storage")),
            log_level: env_or("CADENZA_LOG", "info"),
            log_json: flag(var("CADENZA_LOG_JSON"), false),
            log_dir: var("CADENZA_LOG_DIR")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            cors_allowed_origins: var("CADENZA_CORS_ORIGINS")
                .map(|v| v.trim().to_owned())
                .filter(|v| !v.is_empty() && v != "*"),
            enable_swagger: flag(var("CADENZA_ENABLE_SWAGGER"), true),
            retention: secs("CADENZA_RETENTION_SECS", 24 * 60 * 60),
            sweep_interval: secs("CADENZA_SWEEP_INTERVAL_SECS", 10 * 60).max(Duration::from_secs(1)),
            max_concurrent_jobs: parse::<usize>(var("CADENZA_MAX_CONCURRENT_JOBS"), 1).max(1),
            queue_capacity: parse::<usize>(var("CADENZA_QUEUE_CAPACITY"), 64).max(1),
            job_timeout: Some(secs("CADENZA_JOB_TIMEOUT_SECS", 0)).filter(|d| !d.is_zero()),
            retain_inputs: flag(var("CADENZA_RETAIN_INPUTS"), true),
            max_upload_bytes: parse::<usize>(var("CADENZA_MAX_UPLOAD_MB"), 100) * 1024 * 1024,
            executor: var("CADENZA_EXECUTOR")
                .and_then(|v| ExecutorKind::from_str(v.trim(), true).ok())
                .unwrap_or(ExecutorKind::Command),
            infer_program: env_or("CADENZA_INFER_PROGRAM", "python3"),
            infer_args: env_or("CADENZA_INFER_ARGS", "infer/infer.py")
                .split_whitespace()
                .map(str::to_owned)
                .collect(),
            infer_workdir: var("CADENZA_INFER_WORKDIR")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
        }
    }

    /// Apply command-line overrides.
    pub fn with_cli(mut self, cli: Cli) -> Self {
        if let Some(bind) = cli.bind {
            self.bind_address = bind;
        }
        if let Some(path) = cli.storage_path {
            self.storage_path = path;
        }
        if let Some(executor) = cli.executor {
            self.executor = executor;
        }
        self
    }
}

/// Command-line flags. Anything not given here comes from `CADENZA_*`
/// environment variables.
#[derive(Debug, Parser)]
#[command(author, version, about = "Asynchronous song-generation server")]
pub struct Cli {
    /// TCP address to bind, e.g. `127.0.0.1:8000`.
    #[arg(long)]
    pub bind: Option<String>,

    /// Root directory for task storage.
    #[arg(long)]
    pub storage_path: Option<PathBuf>,

    /// Generation backend.
    #[arg(long, value_enum)]
    pub executor: Option<ExecutorKind>,
}

// ── private helpers ──────────────────────────────────────────────────────────

fn parse<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn flag(value: Option<String>, default: bool) -> bool {
    match value.as_deref().map(str::trim) {
        Some(v) if v == "1" || v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("yes") => {
            true
        }
        Some(v) if v == "0" || v.eq_ignore_ascii_case("false") || v.eq_ignore_ascii_case("no") => {
            false
        }
        _ => default,
    }
}
