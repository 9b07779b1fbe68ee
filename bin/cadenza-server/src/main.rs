//! cadenza-server – entry point.
//!
//! Startup order:
//! 1. Parse configuration from environment variables and flags.
//! 2. Initialise structured tracing (JSON in production, pretty in dev).
//! 3. Open the task store and recover tasks left by a previous run.
//! 4. Start the generation worker and the cleanup sweeper.
//! 5. Build the Axum router and serve until SIGINT/SIGTERM, then drain.

mod config;
mod error;
mod middleware;
mod routes;
mod schemas;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use cadenza_core::{
    CleanupSweeper, CommandExecutor, FsTaskStore, GenerationExecutor, SilentExecutor,
    SweeperConfig, TaskRegistry, Worker, WorkerConfig,
};
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::config::{Cli, Config, ExecutorKind};
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Configuration ───────────────────────────────────────────────────────
    let cfg = Config::from_env().with_cli(Cli::parse());

    // ── 2. Tracing ─────────────────────────────────────────────────────────────
    let _log_guard = init_tracing(&cfg);
    info!(version = env!("CARGO_PKG_VERSION"), "cadenza-server starting");

    // ── 3. Task store ──────────────────────────────────────────────────────────
    let store = FsTaskStore::open(&cfg.storage_path).await?;
    let (registry, queue) = TaskRegistry::new(store, cfg.queue_capacity);
    let report = registry.recover().await?;
    info!(
        storage_path = %cfg.storage_path.display(),
        loaded = report.loaded,
        interrupted = report.interrupted,
        requeued = report.requeued,
        "task store ready"
    );
    let registry = Arc::new(registry);

    // ── 4. Worker and sweeper ──────────────────────────────────────────────────
    let executor: Arc<dyn GenerationExecutor> = match cfg.executor {
        ExecutorKind::Command => {
            let mut command =
                CommandExecutor::new(&cfg.infer_program).with_args(cfg.infer_args.clone());
            if let Some(dir) = &cfg.infer_workdir {
                command = command.with_working_dir(dir);
            }
            Arc::new(command)
        }
        ExecutorKind::Silent => Arc::new(SilentExecutor::new()),
    };
    info!(executor = executor.name(), "generation executor selected");

    let (stop, shutdown) = watch::channel(false);
    let worker = Worker::new(
        Arc::clone(&registry),
        executor,
        WorkerConfig {
            max_concurrent_jobs: cfg.max_concurrent_jobs,
            job_timeout: cfg.job_timeout,
            retain_inputs: cfg.retain_inputs,
            ..WorkerConfig::default()
        },
    );
    let worker = tokio::spawn(worker.run(queue, shutdown.clone()));

    let sweeper = CleanupSweeper::new(
        Arc::clone(&registry),
        SweeperConfig {
            retention: cfg.retention,
            interval: cfg.sweep_interval,
        },
    );
    let sweeper = tokio::spawn(sweeper.run(shutdown));

    // ── 5. HTTP server with graceful shutdown ──────────────────────────────────
    let addr: SocketAddr = cfg.bind_address.parse()?;
    let state = Arc::new(AppState {
        config: Arc::new(cfg),
        registry,
    });
    let app = routes::build(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // The receivers also stop if the sender is gone, so a failed send is fine.
    let _ = stop.send(true);
    for (name, handle) in [("worker", worker), ("sweeper", sweeper)] {
        if let Err(e) = handle.await {
            warn!(task = name, error = %e, "background task ended abnormally");
        }
    }

    info!("cadenza-server stopped");
    Ok(())
}

/// Console output plus, when `CADENZA_LOG_DIR` is set, a daily-rolling JSON
/// file. The returned guard flushes the file writer on drop.
fn init_tracing(cfg: &Config) -> Option<WorkerGuard> {
    // Warn loudly if the configured value is not a valid filter expression.
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => match cfg.log_level.parse::<EnvFilter>() {
            Ok(f) => f,
            Err(e) => {
                eprintln!(
                    "WARN: CADENZA_LOG='{}' is not a valid tracing filter ({}); \
                     falling back to 'info'",
                    cfg.log_level, e
                );
                EnvFilter::new("info")
            }
        },
    };

    let console = fmt::layer().with_target(true).with_thread_ids(true);
    let console = if cfg.log_json {
        console.json().boxed()
    } else {
        console.boxed()
    };

    let (file, guard) = match &cfg.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "cadenza.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console)
        .with(file)
        .init();
    guard
}

/// Returns a future that resolves when SIGINT (Ctrl-C) or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install CTRL+C signal handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received; draining in-flight tasks");
}
