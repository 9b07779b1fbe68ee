//! Periodic removal of tasks past the retention window.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::registry::{Expiry, TaskRegistry};

const MIN_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Clone, Debug)]
pub struct SweeperConfig {
    /// Tasks created longer ago than this are removed.
    pub retention: Duration,
    pub interval: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(24 * 60 * 60),
            interval: Duration::from_secs(10 * 60),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: usize,
    pub skipped_processing: usize,
    pub failed: usize,
}

pub struct CleanupSweeper {
    registry: Arc<TaskRegistry>,
    config: SweeperConfig,
}

impl CleanupSweeper {
    pub fn new(registry: Arc<TaskRegistry>, config: SweeperConfig) -> Self {
        Self { registry, config }
    }

    /// One pass over every stored task, judged against `now`.
    ///
    /// Walks the storage tree rather than the index so records left behind
    /// by an earlier process are collected too. Failures are logged and the
    /// task is retried on the next pass.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        let retention = chrono::Duration::from_std(self.config.retention)
            .unwrap_or(chrono::Duration::MAX);
        let cutoff = now.checked_sub_signed(retention).unwrap_or(DateTime::<Utc>::MIN_UTC);

        let tasks = match self.registry.store().list_all().await {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(error = %e, "cleanup sweep could not list tasks");
                report.failed += 1;
                return report;
            }
        };

        for task in tasks.iter().filter(|t| t.is_expired(cutoff)) {
            match self.registry.delete_expired(task.id, cutoff).await {
                Ok(Expiry::Removed) => {
                    debug!(task_id = %task.id, status = %task.status, "removed expired task");
                    report.removed += 1;
                }
                Ok(Expiry::Processing) => report.skipped_processing += 1,
                Ok(Expiry::Retained | Expiry::Missing) => {}
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "failed to remove expired task");
                    report.failed += 1;
                }
            }
        }

        if report != SweepReport::default() {
            info!(
                removed = report.removed,
                skipped_processing = report.skipped_processing,
                failed = report.failed,
                "cleanup sweep finished"
            );
        }
        report
    }

    /// Sweep every `interval` until `shutdown` flips to `true`. A sweep in
    /// progress is finished before returning.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        // `interval` panics on a zero period.
        let period = self.config.interval.max(MIN_INTERVAL);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            retention_secs = self.config.retention.as_secs(),
            interval_ms = period.as_millis() as u64,
            "cleanup sweeper started"
        );

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.sweep_once(Utc::now()).await;
                }
            }
        }
        info!("cleanup sweeper stopped");
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::queue::TaskQueue;
    use crate::store::FsTaskStore;
    use crate::task::{Submission, TaskStatus};
    use bytes::Bytes;
    use chrono::Duration as ChronoDuration;
    use tracing_test::traced_test;

    const LRC: &str = "[00:01.00]la\n";

    async fn setup() -> (tempfile::TempDir, Arc<TaskRegistry>, TaskQueue) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsTaskStore::open(dir.path()).await.unwrap();
        let (registry, queue) = TaskRegistry::new(store, 64);
        (dir, Arc::new(registry), queue)
    }

    async fn submit(registry: &TaskRegistry) -> crate::task::Task {
        registry
            .enqueue(Submission::generate(LRC).with_prompt("pop"))
            .await
            .unwrap()
    }

    #[tokio::test]
    #[traced_test]
    async fn removes_expired_tasks_except_processing() {
        let (_dir, registry, _queue) = setup().await;
        let done = submit(&registry).await;
        let busy = submit(&registry).await;
        let queued = submit(&registry).await;
        registry.begin_processing(done.id).await.unwrap();
        registry
            .complete(done.id, vec![Bytes::from_static(b"RIFF")])
            .await
            .unwrap();
        registry.begin_processing(busy.id).await.unwrap();

        let sweeper = CleanupSweeper::new(Arc::clone(&registry), SweeperConfig::default());
        let later = Utc::now() + ChronoDuration::hours(25);
        let report = sweeper.sweep_once(later).await;

        assert_eq!(
            report,
            SweepReport { removed: 2, skipped_processing: 1, failed: 0 }
        );
        assert!(registry.get(done.id).is_err());
        assert!(registry.get(queued.id).is_err());
        assert_eq!(registry.get(busy.id).unwrap().status, TaskStatus::Processing);
        assert!(registry.store().task_dir(busy.id).exists());
        assert!(logs_contain("cleanup sweep finished"));
    }

    #[tokio::test]
    async fn keeps_tasks_inside_retention() {
        let (_dir, registry, _queue) = setup().await;
        let task = submit(&registry).await;
        let sweeper = CleanupSweeper::new(Arc::clone(&registry), SweeperConfig::default());

        let report = sweeper.sweep_once(Utc::now() + ChronoDuration::hours(23)).await;
        assert_eq!(report, SweepReport::default());
        assert!(registry.get(task.id).is_ok());
    }

    #[tokio::test]
    async fn collects_records_missing_from_the_index() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsTaskStore::open(dir.path()).await.unwrap();
        let (old, _q) = TaskRegistry::new(store.clone(), 8);
        let orphan = submit(&old).await;
        drop(old);

        let (fresh, _q) = TaskRegistry::new(store, 8);
        let sweeper = CleanupSweeper::new(Arc::new(fresh), SweeperConfig::default());
        let report = sweeper.sweep_once(Utc::now() + ChronoDuration::days(2)).await;

        assert_eq!(report.removed, 1);
        assert!(!dir.path().join(orphan.id.to_string()).exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_removal_does_not_stop_the_sweep() {
        use std::os::unix::fs::PermissionsExt;

        let (_dir, registry, _queue) = setup().await;
        let stuck = submit(&registry).await;
        let free = submit(&registry).await;
        let store = registry.store();
        store.write_input(stuck.id, "lyrics.lrc", b"x").await.unwrap();
        let locked = store.input_dir(stuck.id);
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o555)).unwrap();

        // Permission bits do not bind a privileged user.
        if std::fs::write(locked.join("canary"), b"").is_ok() {
            std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();
            return;
        }

        let sweeper = CleanupSweeper::new(Arc::clone(&registry), SweeperConfig::default());
        let report = sweeper.sweep_once(Utc::now() + ChronoDuration::days(2)).await;
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();

        assert_eq!(report, SweepReport { removed: 1, failed: 1, skipped_processing: 0 });
        assert!(!store.task_dir(free.id).exists());
        assert!(store.task_dir(stuck.id).exists());
    }

    #[tokio::test]
    async fn zero_interval_does_not_panic() {
        let (_dir, registry, _queue) = setup().await;
        let sweeper = CleanupSweeper::new(
            registry,
            SweeperConfig { retention: Duration::from_secs(60), interval: Duration::ZERO },
        );
        let (stop, shutdown) = watch::channel(false);
        let handle = tokio::spawn(sweeper.run(shutdown));
        tokio::time::sleep(Duration::from_millis(20)).await;
        stop.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let (_dir, registry, _queue) = setup().await;
        let sweeper = CleanupSweeper::new(
            registry,
            SweeperConfig {
                retention: Duration::from_secs(1),
                interval: Duration::from_millis(10),
            },
        );
        let (stop, shutdown) = watch::channel(false);
        let handle = tokio::spawn(sweeper.run(shutdown));
        tokio::time::sleep(Duration::from_millis(30)).await;
        stop.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
