//! In-memory task index backed by [`FsTaskStore`].
//!
//! The registry is the only writer of task metadata. Each task has its own
//! async write lock, so mutations of one id are serialized (worker status
//! updates, client deletion, sweeper removal) while different ids proceed
//! independently. Readers never take that lock: they clone the snapshot
//! published by the last successful save.
//!
//! Deleting a task flips its `removed` flag under the write lock. Any
//! transition attempted afterwards sees the flag and returns `Ok(None)`
//! instead of recreating the record.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::error::{StoreError, TaskError, INTERRUPTED_BY_RESTART};
use crate::queue::{task_queue, QueueSender, TaskQueue};
use crate::store::{sanitize_file_name, FsTaskStore};
use crate::task::{
    EditInput, InputDescriptor, StyleReference, Submission, Task, TaskId, TaskStatus,
    ValidStyle, ValidSubmission,
};

const LYRICS_FILE: &str = "lyrics.lrc";

struct Entry {
    /// Held for every mutation; `true` once the task has been deleted.
    write: Arc<Mutex<bool>>,
    snapshot: RwLock<Task>,
}

impl Entry {
    fn new(task: Task) -> Arc<Self> {
        Arc::new(Self {
            write: Arc::new(Mutex::new(false)),
            snapshot: RwLock::new(task),
        })
    }

    fn read(&self) -> Task {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn publish(&self, task: Task) {
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = task;
    }
}

/// Outcome of [`TaskRegistry::delete_expired`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    Removed,
    /// Old enough, but currently processing.
    Processing,
    /// Not past the cutoff.
    Retained,
    /// Already gone.
    Missing,
}

/// What [`TaskRegistry::recover`] found on disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub loaded: usize,
    pub interrupted: usize,
    pub requeued: usize,
}

pub struct TaskRegistry {
    store: FsTaskStore,
    entries: RwLock<HashMap<TaskId, Arc<Entry>>>,
    queue: QueueSender,
    /// Serializes creation with queue hand-off so queue order is creation order.
    submit: Mutex<()>,
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self
            .entries
            .read()
            .map(|e| e.len())
            .unwrap_or(0);
        write!(f, "TaskRegistry({count} tasks, root={})", self.store.root().display())
    }
}

impl TaskRegistry {
    /// Build a registry and the queue its worker consumes.
    ///
    /// `queue_capacity` bounds the number of submissions waiting for the
    /// worker; further submissions fail with [`TaskError::QueueFull`].
    pub fn new(store: FsTaskStore, queue_capacity: usize) -> (Self, TaskQueue) {
        let (queue, rx) = task_queue(queue_capacity);
        let registry = Self {
            store,
            entries: RwLock::new(HashMap::new()),
            queue,
            submit: Mutex::new(()),
        };
        (registry, rx)
    }

    pub fn store(&self) -> &FsTaskStore {
        &self.store
    }

    /// Submissions waiting for the worker.
    pub fn queue_depth(&self) -> usize {
        self.queue.depth()
    }

    fn entry(&self, id: TaskId) -> Option<Arc<Entry>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    fn insert(&self, task: Task) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task.id, Entry::new(task));
    }

    fn forget(&self, id: TaskId) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    /// Load every stored task into the index.
    ///
    /// Tasks left `processing` by a previous process are failed with
    /// [`INTERRUPTED_BY_RESTART`] rather than re-run; tasks still `queued`
    /// are handed to the worker again, oldest first.
    pub async fn recover(&self) -> Result<RecoveryReport, TaskError> {
        let _submit = self.submit.lock().await;
        let mut report = RecoveryReport::default();
        let mut requeue = Vec::new();

        for mut task in self.store.list_all().await? {
            match task.status {
                TaskStatus::Processing => {
                    task.mark_failed(INTERRUPTED_BY_RESTART, Utc::now())?;
                    self.store.save(&task).await?;
                    warn!(task_id = %task.id, "task was processing at shutdown; marked failed");
                    report.interrupted += 1;
                }
                TaskStatus::Queued => requeue.push(task.id),
                TaskStatus::Completed | TaskStatus::Failed => {}
            }
            report.loaded += 1;
            self.insert(task);
        }

        for id in requeue {
            self.queue.push(id)?;
            report.requeued += 1;
        }
        Ok(report)
    }

    /// Validate a submission, persist it with its uploads, and queue it.
    ///
    /// Nothing is written when validation fails.
    pub async fn enqueue(&self, submission: Submission) -> Result<Task, TaskError> {
        let valid = submission.validate()?;

        let _submit = self.submit.lock().await;
        self.queue.check_capacity()?;

        let id = TaskId::new();
        let task = Task::new(id, valid.kind, describe(&valid), Utc::now());
        self.store.create(&task).await?;

        if let Err(e) = self.write_inputs(&task, &valid).await {
            if let Err(cleanup) = self.store.delete(id).await {
                warn!(task_id = %id, error = %cleanup, "failed to remove task after input write error");
            }
            return Err(e.into());
        }

        self.insert(task.clone());
        if let Err(e) = self.queue.push(id) {
            self.forget(id);
            if let Err(cleanup) = self.store.delete(id).await {
                warn!(task_id = %id, error = %cleanup, "failed to remove unqueued task");
            }
            return Err(e);
        }

        info!(task_id = %id, kind = %task.kind, "task queued");
        Ok(task)
    }

    async fn write_inputs(&self, task: &Task, valid: &ValidSubmission) -> Result<(), StoreError> {
        let id = task.id;
        self.store
            .write_input(id, &task.input.lyrics_file, valid.lyrics.as_bytes())
            .await?;
        if let (StyleReference::Audio { file }, ValidStyle::Audio(upload)) =
            (&task.input.style, &valid.style)
        {
            self.store.write_input(id, file, &upload.bytes).await?;
        }
        if let (Some(edit), Some((song, _))) = (&task.input.edit, &valid.edit) {
            self.store
                .write_input(id, &edit.ref_song_file, &song.bytes)
                .await?;
        }
        Ok(())
    }

    pub fn get(&self, id: TaskId) -> Result<Task, TaskError> {
        self.entry(id)
            .map(|entry| entry.read())
            .ok_or(TaskError::NotFound(id))
    }

    /// Every indexed task, newest first.
    pub fn list(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|entry| entry.read())
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks
    }

    /// The primary artifact of a completed task.
    pub async fn download(&self, id: TaskId) -> Result<(Task, Bytes), TaskError> {
        let task = self.get(id)?;
        if task.status != TaskStatus::Completed {
            return Err(TaskError::DownloadNotReady {
                id,
                status: task.status,
            });
        }
        let relative = task.output_path.as_deref().ok_or(TaskError::NotFound(id))?;
        let bytes = self
            .store
            .read_artifact(id, relative)
            .await
            .map_err(|e| match e {
                StoreError::NotFound(_) => TaskError::NotFound(id),
                other => other.into(),
            })?;
        Ok((task, bytes))
    }

    /// Remove a task and its files, whatever its state. Returns whether the
    /// task was known; deleting an unknown id is a no-op.
    ///
    /// A processing task keeps running, but its result is discarded.
    pub async fn delete(&self, id: TaskId) -> Result<bool, TaskError> {
        let mut existed = false;
        let _guard = match self.entry(id) {
            Some(entry) => {
                let mut guard = Arc::clone(&entry.write).lock_owned().await;
                if !*guard {
                    *guard = true;
                    existed = true;
                    self.forget(id);
                }
                Some(guard)
            }
            None => None,
        };
        self.store.delete(id).await?;
        if existed {
            info!(task_id = %id, "task deleted");
        }
        Ok(existed)
    }

    /// Remove `id` if it was created before `cutoff` and is not processing.
    /// The status is checked under the task's write lock.
    pub async fn delete_expired(
        &self,
        id: TaskId,
        cutoff: DateTime<Utc>,
    ) -> Result<Expiry, TaskError> {
        let Some(entry) = self.entry(id) else {
            // On disk but not indexed, e.g. written by an earlier process.
            let task = match self.store.load(id).await {
                Ok(task) => task,
                Err(StoreError::NotFound(_)) => return Ok(Expiry::Missing),
                Err(e) => return Err(e.into()),
            };
            return match expiry_of(&task, cutoff) {
                Expiry::Removed => {
                    self.store.delete(id).await?;
                    Ok(Expiry::Removed)
                }
                other => Ok(other),
            };
        };

        let mut guard = Arc::clone(&entry.write).lock_owned().await;
        if *guard {
            return Ok(Expiry::Missing);
        }
        let outcome = expiry_of(&entry.read(), cutoff);
        if outcome == Expiry::Removed {
            *guard = true;
            self.forget(id);
            self.store.delete(id).await?;
        }
        Ok(outcome)
    }

    async fn lock_live(&self, id: TaskId) -> Option<(Arc<Entry>, OwnedMutexGuard<bool>)> {
        let entry = self.entry(id)?;
        let guard = Arc::clone(&entry.write).lock_owned().await;
        if *guard {
            return None;
        }
        Some((entry, guard))
    }

    async fn persist(
        &self,
        entry: &Entry,
        guard: &mut OwnedMutexGuard<bool>,
        task: Task,
    ) -> Result<Option<Task>, TaskError> {
        match self.store.save(&task).await {
            Ok(()) => {
                entry.publish(task.clone());
                Ok(Some(task))
            }
            Err(StoreError::NotFound(_)) => {
                // The directory vanished underneath us; treat as deleted.
                **guard = true;
                self.forget(task.id);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// `queued -> processing`. `Ok(None)` if the task was deleted.
    pub async fn begin_processing(&self, id: TaskId) -> Result<Option<Task>, TaskError> {
        let Some((entry, mut guard)) = self.lock_live(id).await else {
            return Ok(None);
        };
        let mut task = entry.read();
        task.mark_processing(Utc::now())?;
        self.persist(&entry, &mut guard, task).await
    }

    /// Set the status message of a still-queued task in memory only, for
    /// reporting a problem that kept it from being written to disk.
    pub async fn annotate(&self, id: TaskId, message: impl Into<String>) {
        let Some((entry, _guard)) = self.lock_live(id).await else {
            return;
        };
        let mut task = entry.read();
        if task.status != TaskStatus::Queued {
            return;
        }
        task.message = Some(message.into());
        task.updated_at = Utc::now();
        entry.publish(task);
    }

    /// Best-effort progress update; stale or decreasing values are ignored.
    pub async fn report_progress(&self, id: TaskId, percent: u8) -> Result<(), TaskError> {
        let Some((entry, mut guard)) = self.lock_live(id).await else {
            return Ok(());
        };
        let mut task = entry.read();
        if task.set_progress(percent, Utc::now()) {
            self.persist(&entry, &mut guard, task).await?;
        }
        Ok(())
    }

    /// Write `artifacts` under `output/` and mark the task completed.
    /// Artifacts of a deleted task are dropped and `Ok(None)` returned.
    pub async fn complete(
        &self,
        id: TaskId,
        artifacts: Vec<Bytes>,
    ) -> Result<Option<Task>, TaskError> {
        let Some((entry, mut guard)) = self.lock_live(id).await else {
            debug!(task_id = %id, "task deleted while processing; discarding output");
            return Ok(None);
        };
        let mut written = Vec::with_capacity(artifacts.len());
        for (index, audio) in artifacts.iter().enumerate() {
            written.push(
                self.store
                    .write_output(id, &artifact_name(index), audio)
                    .await?,
            );
        }
        let mut task = entry.read();
        task.mark_completed(written, Utc::now())?;
        self.persist(&entry, &mut guard, task).await
    }

    /// `processing -> failed`. `Ok(None)` if the task was deleted.
    pub async fn fail(
        &self,
        id: TaskId,
        error: impl Into<String>,
    ) -> Result<Option<Task>, TaskError> {
        let Some((entry, mut guard)) = self.lock_live(id).await else {
            return Ok(None);
        };
        let mut task = entry.read();
        task.mark_failed(error, Utc::now())?;
        self.persist(&entry, &mut guard, task).await
    }

    /// Drop a finished task's uploaded inputs.
    pub async fn discard_inputs(&self, id: TaskId) -> Result<(), TaskError> {
        let Some((_entry, _guard)) = self.lock_live(id).await else {
            return Ok(());
        };
        self.store.remove_inputs(id).await?;
        Ok(())
    }
}

fn describe(valid: &ValidSubmission) -> InputDescriptor {
    let style = match &valid.style {
        ValidStyle::Audio(upload) => StyleReference::Audio {
            file: format!("ref_audio_{}", sanitize_file_name(&upload.file_name)),
        },
        ValidStyle::Prompt(text) => StyleReference::Prompt { text: text.clone() },
    };
    InputDescriptor {
        lyrics_file: LYRICS_FILE.to_owned(),
        style,
        audio_length: valid.audio_length,
        chunked: valid.chunked,
        batch_infer_num: valid.batch_infer_num,
        edit: valid.edit.as_ref().map(|(song, segments)| EditInput {
            ref_song_file: format!("ref_song_{}", sanitize_file_name(&song.file_name)),
            segments: segments.clone(),
        }),
    }
}

fn expiry_of(task: &Task, cutoff: DateTime<Utc>) -> Expiry {
    if task.status == TaskStatus::Processing {
        Expiry::Processing
    } else if !task.is_expired(cutoff) {
        Expiry::Retained
    } else {
        Expiry::Removed
    }
}

fn artifact_name(index: usize) -> String {
    if index == 0 {
        "output.wav".to_owned()
    } else {
        format!("output_{index}.wav")
    }
}
