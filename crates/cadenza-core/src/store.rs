//! Filesystem task store.
//!
//! Every task owns one directory under the storage root:
//!
//! ```text
//! <root>/<task-id>/
//!     metadata.json   the Task record
//!     input/          uploaded files
//!     output/         generated audio
//! ```
//!
//! Metadata writes go to a temporary file that is fsynced and renamed over
//! `metadata.json`, so readers see either the previous or the new record.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::task::{Task, TaskId};

const METADATA_FILE: &str = "metadata.json";
const INPUT_DIR: &str = "input";
const OUTPUT_DIR: &str = "output";

/// Durable, crash-recoverable persistence of task records and files.
#[derive(Clone, Debug)]
pub struct FsTaskStore {
    root: PathBuf,
}

impl FsTaskStore {
    /// Open (or create) the storage root.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .map_err(StoreError::io(&root))?;
        info!(root = %root.display(), "task store ready");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn task_dir(&self, id: TaskId) -> PathBuf {
        self.root.join(id.to_string())
    }

    pub fn input_dir(&self, id: TaskId) -> PathBuf {
        self.task_dir(id).join(INPUT_DIR)
    }

    pub fn output_dir(&self, id: TaskId) -> PathBuf {
        self.task_dir(id).join(OUTPUT_DIR)
    }

    fn metadata_path(&self, id: TaskId) -> PathBuf {
        self.task_dir(id).join(METADATA_FILE)
    }

    /// Allocate the directory tree for `task` and write its first record.
    pub async fn create(&self, task: &Task) -> Result<(), StoreError> {
        let dir = self.task_dir(task.id);
        match fs::create_dir(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(StoreError::AlreadyExists(task.id));
            }
            Err(e) => return Err(StoreError::io(&dir)(e)),
        }

        let populate = async {
            for sub in [INPUT_DIR, OUTPUT_DIR] {
                let path = dir.join(sub);
                fs::create_dir(&path).await.map_err(StoreError::io(&path))?;
            }
            self.write_metadata(task).await
        };
        if let Err(e) = populate.await {
            if let Err(cleanup) = fs::remove_dir_all(&dir).await {
                warn!(task_id = %task.id, error = %cleanup, "failed to remove partially created task directory");
            }
            return Err(e);
        }

        debug!(task_id = %task.id, dir = %dir.display(), "created task directory");
        Ok(())
    }

    pub async fn load(&self, id: TaskId) -> Result<Task, StoreError> {
        let path = self.metadata_path(id);
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(StoreError::NotFound(id)),
            Err(e) => return Err(StoreError::io(&path)(e)),
        };
        serde_json::from_slice(&raw).map_err(|source| StoreError::Corrupt { id, source })
    }

    /// Atomically replace the record of an existing task.
    ///
    /// Fails with [`StoreError::NotFound`] when the task directory is gone;
    /// a deleted task is never recreated.
    pub async fn save(&self, task: &Task) -> Result<(), StoreError> {
        self.write_metadata(task).await
    }

    async fn write_metadata(&self, task: &Task) -> Result<(), StoreError> {
        let path = self.metadata_path(task.id);
        let tmp = self
            .task_dir(task.id)
            .join(format!(".{METADATA_FILE}.{}.tmp", Uuid::new_v4().simple()));
        let body = serde_json::to_vec_pretty(task)
            .map_err(|source| StoreError::Corrupt { id: task.id, source })?;

        let not_found = |id: TaskId, path: &Path| {
            let path = path.to_path_buf();
            move |e: std::io::Error| {
                if e.kind() == ErrorKind::NotFound {
                    StoreError::NotFound(id)
                } else {
                    StoreError::Io { path, source: e }
                }
            }
        };

        let write = async {
            let mut file = fs::File::create(&tmp)
                .await
                .map_err(not_found(task.id, &tmp))?;
            file.write_all(&body).await.map_err(StoreError::io(&tmp))?;
            file.sync_all().await.map_err(StoreError::io(&tmp))?;
            drop(file);
            fs::rename(&tmp, &path)
                .await
                .map_err(not_found(task.id, &path))
        };
        let result = write.await;
        if result.is_err() {
            let _ = fs::remove_file(&tmp).await;
        }
        result
    }

    /// Remove a task's whole subtree. Missing tasks are not an error.
    pub async fn delete(&self, id: TaskId) -> Result<(), StoreError> {
        let dir = self.task_dir(id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {
                info!(task_id = %id, "removed task directory");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(&dir)(e)),
        }
    }

    /// Snapshot of every readable task record, oldest first.
    ///
    /// Directories that are not task ids, or whose metadata is missing or
    /// corrupt, are skipped.
    pub async fn list_all(&self) -> Result<Vec<Task>, StoreError> {
        let mut entries = fs::read_dir(&self.root)
            .await
            .map_err(StoreError::io(&self.root))?;
        let mut tasks = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(StoreError::io(&self.root))?
        {
            let Some(id) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<TaskId>().ok())
            else {
                continue;
            };
            match self.load(id).await {
                Ok(task) => tasks.push(task),
                // Removed concurrently, or still being created.
                Err(StoreError::NotFound(_)) => {}
                Err(e) => warn!(task_id = %id, error = %e, "skipping unreadable task record"),
            }
        }
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    /// Store an uploaded file under `input/`; returns the stored file name.
    pub async fn write_input(
        &self,
        id: TaskId,
        file_name: &str,
        bytes: &[u8],
    ) -> Result<String, StoreError> {
        let name = sanitize_file_name(file_name);
        let path = self.input_dir(id).join(&name);
        fs::write(&path, bytes).await.map_err(StoreError::io(&path))?;
        debug!(task_id = %id, file = %path.display(), size_bytes = bytes.len(), "saved input file");
        Ok(name)
    }

    /// Store a generated artifact under `output/`; returns its path relative
    /// to the task directory.
    pub async fn write_output(
        &self,
        id: TaskId,
        file_name: &str,
        bytes: &[u8],
    ) -> Result<String, StoreError> {
        let name = sanitize_file_name(file_name);
        let path = self.output_dir(id).join(&name);
        fs::write(&path, bytes).await.map_err(StoreError::io(&path))?;
        Ok(format!("{OUTPUT_DIR}/{name}"))
    }

    /// Read a file referenced relative to the task directory.
    pub async fn read_artifact(&self, id: TaskId, relative: &str) -> Result<Bytes, StoreError> {
        if Path::new(relative)
            .components()
            .any(|c| !matches!(c, std::path::Component::Normal(_)))
        {
            return Err(StoreError::NotFound(id));
        }
        let path = self.task_dir(id).join(relative);
        match fs::read(&path).await {
            Ok(raw) => Ok(Bytes::from(raw)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::NotFound(id)),
            Err(e) => Err(StoreError::io(&path)(e)),
        }
    }

    /// Drop a task's uploaded inputs, keeping its record and outputs.
    pub async fn remove_inputs(&self, id: TaskId) -> Result<(), StoreError> {
        let dir = self.input_dir(id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(&dir)(e)),
        }
    }
}

/// Reduce a client-supplied file name to `[A-Za-z0-9._-]`, dropping any
/// directory components.
pub fn sanitize_file_name(file_name: &str) -> String {
    let base = file_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.trim_matches('.').is_empty() {
        "upload".to_owned()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::task::{InputDescriptor, StyleReference, TaskKind, TaskStatus};
    use chrono::{Duration, Utc};

    fn sample_task() -> Task {
        Task::new(
            TaskId::new(),
            TaskKind::Generate,
            InputDescriptor {
                lyrics_file: "lyrics.lrc".into(),
                style: StyleReference::Prompt { text: "ambient".into() },
                audio_length: 95,
                chunked: true,
                batch_infer_num: 1,
                edit: None,
            },
            Utc::now(),
        )
    }

    async fn store() -> (tempfile::TempDir, FsTaskStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsTaskStore::open(dir.path().join("tasks")).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn create_lays_out_directories_and_record() {
        let (_dir, store) = store().await;
        let task = sample_task();
        store.create(&task).await.unwrap();

        assert!(store.input_dir(task.id).is_dir());
        assert!(store.output_dir(task.id).is_dir());
        assert_eq!(store.load(task.id).await.unwrap(), task);
    }

    #[tokio::test]
    async fn create_rejects_duplicate_ids() {
        let (_dir, store) = store().await;
        let task = sample_task();
        store.create(&task).await.unwrap();
        assert!(matches!(
            store.create(&task).await,
            Err(StoreError::AlreadyExists(id)) if id == task.id
        ));
    }

    #[tokio::test]
    async fn save_replaces_record_without_leaving_temp_files() {
        let (_dir, store) = store().await;
        let mut task = sample_task();
        store.create(&task).await.unwrap();

        task.mark_processing(Utc::now()).unwrap();
        store.save(&task).await.unwrap();

        let loaded = store.load(task.id).await.unwrap();
        assert_eq!(loaded.status, TaskStatus::Processing);

        let mut names = Vec::new();
        let mut entries = fs::read_dir(store.task_dir(task.id)).await.unwrap();
        while let Some(e) = entries.next_entry().await.unwrap() {
            names.push(e.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        assert_eq!(names, vec!["input", "metadata.json", "output"]);
    }

    #[tokio::test]
    async fn save_does_not_resurrect_deleted_task() {
        let (_dir, store) = store().await;
        let task = sample_task();
        store.create(&task).await.unwrap();
        store.delete(task.id).await.unwrap();

        assert!(matches!(store.save(&task).await, Err(StoreError::NotFound(_))));
        assert!(!store.task_dir(task.id).exists());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let (_dir, store) = store().await;
        let task = sample_task();
        store.create(&task).await.unwrap();
        store.write_input(task.id, "lyrics.lrc", b"[00:01.00]hi").await.unwrap();

        store.delete(task.id).await.unwrap();
        store.delete(task.id).await.unwrap();
        assert!(matches!(store.load(task.id).await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn list_all_skips_foreign_and_corrupt_entries() {
        let (_dir, store) = store().await;
        let mut older = sample_task();
        older.created_at = Utc::now() - Duration::hours(2);
        let newer = sample_task();
        store.create(&newer).await.unwrap();
        store.create(&older).await.unwrap();

        fs::create_dir(store.root().join("not-a-task")).await.unwrap();
        let corrupt = TaskId::new();
        fs::create_dir(store.task_dir(corrupt)).await.unwrap();
        fs::write(store.task_dir(corrupt).join(METADATA_FILE), b"{ nope")
            .await
            .unwrap();

        let ids: Vec<_> = store.list_all().await.unwrap().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![older.id, newer.id]);
    }

    #[tokio::test]
    async fn outputs_round_trip_and_reject_traversal() {
        let (_dir, store) = store().await;
        let task = sample_task();
        store.create(&task).await.unwrap();

        let rel = store.write_output(task.id, "output.wav", b"RIFF").await.unwrap();
        assert_eq!(rel, "output/output.wav");
        assert_eq!(&store.read_artifact(task.id, &rel).await.unwrap()[..], b"RIFF");
        assert!(store.read_artifact(task.id, "../metadata.json").await.is_err());
    }

    #[tokio::test]
    async fn remove_inputs_keeps_record() {
        let (_dir, store) = store().await;
        let task = sample_task();
        store.create(&task).await.unwrap();
        store.write_input(task.id, "lyrics.lrc", b"x").await.unwrap();

        store.remove_inputs(task.id).await.unwrap();
        assert!(!store.input_dir(task.id).exists());
        assert!(store.load(task.id).await.is_ok());
    }

    #[test]
    fn sanitizes_file_names() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\music\\my song.wav"), "my_song.wav");
        assert_eq!(sanitize_file_name(".."), "upload");
        assert_eq!(sanitize_file_name(""), "upload");
        assert_eq!(sanitize_file_name("style-ref_01.mp3"), "style-ref_01.mp3");
    }
}
