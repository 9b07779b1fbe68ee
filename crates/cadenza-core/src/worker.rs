//! Worker loop: drains the task queue in FIFO order and drives each task
//! through the Generation Executor.

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::error::ExecutionError;
use crate::executor::{GenerationExecutor, GenerationRequest, ProgressReporter};
use crate::queue::TaskQueue;
use crate::registry::TaskRegistry;
use crate::task::{Task, TaskId};

const START_RETRY_DELAY: Duration = Duration::from_millis(250);

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    /// Upper bound on tasks in `processing` at once.
    pub max_concurrent_jobs: usize,
    /// Per-task executor deadline; `None` waits indefinitely.
    pub job_timeout: Option<Duration>,
    /// Keep `input/` after a task finishes.
    pub retain_inputs: bool,
    /// How long shutdown waits for in-flight tasks before aborting them.
    pub drain_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 1,
            job_timeout: None,
            retain_inputs: true,
            drain_timeout: Duration::from_secs(30),
        }
    }
}

pub struct Worker {
    registry: Arc<TaskRegistry>,
    executor: Arc<dyn GenerationExecutor>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        registry: Arc<TaskRegistry>,
        executor: Arc<dyn GenerationExecutor>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            registry,
            executor,
            config,
        }
    }

    /// Consume `queue` until `shutdown` flips to `true` (or its sender is
    /// dropped), then wait up to `drain_timeout` for in-flight tasks.
    ///
    /// A slot is acquired before dequeuing and tasks are marked `processing`
    /// in dequeue order, so start order is submission order at any capacity.
    pub async fn run(self, mut queue: TaskQueue, mut shutdown: watch::Receiver<bool>) {
        let capacity = self.config.max_concurrent_jobs.max(1);
        let slots = Arc::new(Semaphore::new(capacity));
        let mut jobs = JoinSet::new();
        let this = Arc::new(self);
        info!(executor = this.executor.name(), capacity, "worker started");

        loop {
            while let Some(joined) = jobs.try_join_next() {
                log_join(joined);
            }

            let permit = tokio::select! {
                biased;
                _ = stopped(&mut shutdown) => break,
                permit = Arc::clone(&slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let id = tokio::select! {
                biased;
                _ = stopped(&mut shutdown) => break,
                id = queue.recv() => match id {
                    Some(id) => id,
                    None => break,
                },
            };

            let Some(task) = this.start(id).await else {
                continue;
            };

            let worker = Arc::clone(&this);
            jobs.spawn(async move {
                let _permit = permit;
                worker.execute(task).await;
            });
        }

        if !jobs.is_empty() {
            info!(in_flight = jobs.len(), "waiting for in-flight tasks");
            let drain = async {
                while let Some(joined) = jobs.join_next().await {
                    log_join(joined);
                }
            };
            if tokio::time::timeout(this.config.drain_timeout, drain).await.is_err() {
                warn!(
                    in_flight = jobs.len(),
                    "in-flight tasks did not finish in time; aborting"
                );
                jobs.abort_all();
            }
        }
        info!("worker stopped");
    }

    /// Mark `id` processing, retrying once if the store refuses. A task
    /// that still cannot start stays queued with the reason in its message;
    /// its record on disk is unchanged, so a restart queues it again.
    async fn start(&self, id: TaskId) -> Option<Task> {
        let mut retried = false;
        loop {
            match self.registry.begin_processing(id).await {
                Ok(Some(task)) => return Some(task),
                Ok(None) => {
                    debug!(task_id = %id, "task deleted before processing");
                    return None;
                }
                Err(e) if !retried => {
                    warn!(task_id = %id, error = %e, "failed to start task; retrying");
                    retried = true;
                    tokio::time::sleep(START_RETRY_DELAY).await;
                }
                Err(e) => {
                    error!(task_id = %id, error = %e, "failed to start task");
                    self.registry
                        .annotate(id, format!("could not start: {e}"))
                        .await;
                    return None;
                }
            }
        }
    }

    async fn execute(&self, task: Task) {
        let id = task.id;
        let started = Instant::now();
        let request = GenerationRequest::for_task(&task, &self.registry.store().input_dir(id));
        info!(task_id = %id, kind = %task.kind, "processing task");

        match self.generate(request).await {
            Ok(artifacts) if artifacts.is_empty() => {
                self.record_failure(id, ExecutionError::NoOutput.to_string()).await;
            }
            Ok(artifacts) => match self.registry.complete(id, artifacts).await {
                Ok(Some(_)) => info!(
                    task_id = %id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "task completed"
                ),
                Ok(None) => info!(task_id = %id, "task deleted while processing; output discarded"),
                Err(e) => {
                    error!(task_id = %id, error = %e, "failed to store task output");
                    self.record_failure(id, format!("failed to store output: {e}")).await;
                }
            },
            Err(e) => {
                warn!(
                    task_id = %id,
                    error = %e,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "generation failed"
                );
                self.record_failure(id, e.to_string()).await;
            }
        }

        if !self.config.retain_inputs {
            if let Err(e) = self.registry.discard_inputs(id).await {
                warn!(task_id = %id, error = %e, "failed to remove task inputs");
            }
        }
    }

    /// Run the executor, persisting its progress reports as they arrive.
    ///
    /// The executor runs as its own task so a panic in it fails only this
    /// task. Dropping `run` (timeout, shutdown abort) cancels it.
    async fn generate(&self, request: GenerationRequest) -> Result<Vec<Bytes>, ExecutionError> {
        let id = request.task_id;
        let (reporter, mut progress) = ProgressReporter::channel();
        let executor = Arc::clone(&self.executor);
        let mut run = JoinSet::new();
        run.spawn(async move { executor.generate(request, reporter).await });

        let tracked = async {
            loop {
                tokio::select! {
                    joined = run.join_next() => return executor_outcome(joined),
                    changed = progress.changed() => {
                        if changed.is_err() {
                            return executor_outcome(run.join_next().await);
                        }
                        let percent = *progress.borrow_and_update();
                        if let Err(e) = self.registry.report_progress(id, percent).await {
                            debug!(task_id = %id, error = %e, "progress update not persisted");
                        }
                    }
                }
            }
        };

        match self.config.job_timeout {
            Some(limit) => tokio::time::timeout(limit, tracked)
                .await
                .unwrap_or(Err(ExecutionError::TimedOut(limit))),
            None => tracked.await,
        }
    }

    async fn record_failure(&self, id: TaskId, message: String) {
        match self.registry.fail(id, message).await {
            Ok(Some(_)) => {}
            Ok(None) => debug!(task_id = %id, "task deleted before failure was recorded"),
            Err(e) => error!(task_id = %id, error = %e, "failed to record task failure"),
        }
    }
}

/// Resolves once shutdown is requested or its sender is gone.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

type ExecutorJoin = Option<Result<Result<Vec<Bytes>, ExecutionError>, JoinError>>;

fn executor_outcome(joined: ExecutorJoin) -> Result<Vec<Bytes>, ExecutionError> {
    match joined {
        Some(Ok(result)) => result,
        Some(Err(e)) if e.is_panic() => Err(ExecutionError::Panicked(panic_message(e.into_panic()))),
        Some(Err(_)) | None => Err(ExecutionError::Failed("executor was cancelled".to_owned())),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_owned())
}

fn log_join(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!(error = %e, "task execution panicked");
        }
    }
}
