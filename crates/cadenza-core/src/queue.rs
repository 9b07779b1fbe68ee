//! FIFO hand-off of task ids from the registry to the worker loop.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::TaskError;
use crate::task::TaskId;

/// Create a queue admitting at most `capacity` waiting submissions.
pub fn task_queue(capacity: usize) -> (QueueSender, TaskQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    let depth = Arc::new(AtomicUsize::new(0));
    (
        QueueSender {
            tx,
            depth: Arc::clone(&depth),
            capacity: capacity.max(1),
        },
        TaskQueue { rx, depth },
    )
}

/// Producer side, held by the registry.
#[derive(Debug)]
pub struct QueueSender {
    tx: mpsc::UnboundedSender<TaskId>,
    depth: Arc<AtomicUsize>,
    capacity: usize,
}

impl QueueSender {
    /// Number of ids sent but not yet received by the worker.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Fails with [`TaskError::QueueFull`] if no slot is free.
    pub(crate) fn check_capacity(&self) -> Result<(), TaskError> {
        if self.depth() >= self.capacity {
            return Err(TaskError::QueueFull {
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    /// Enqueue without a capacity check. Used for admitted submissions and
    /// for re-queuing at startup.
    pub(crate) fn push(&self, id: TaskId) -> Result<(), TaskError> {
        self.depth.fetch_add(1, Ordering::AcqRel);
        self.tx.send(id).map_err(|_| {
            self.depth.fetch_sub(1, Ordering::AcqRel);
            TaskError::QueueClosed
        })
    }
}

/// Consumer side, owned by the worker loop.
#[derive(Debug)]
pub struct TaskQueue {
    rx: mpsc::UnboundedReceiver<TaskId>,
    depth: Arc<AtomicUsize>,
}

impl TaskQueue {
    /// Next id in submission order; `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<TaskId> {
        let id = self.rx.recv().await?;
        self.depth.fetch_sub(1, Ordering::AcqRel);
        Some(id)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn preserves_order_and_tracks_depth() {
        let (tx, mut rx) = task_queue(2);
        let (a, b) = (TaskId::new(), TaskId::new());
        tx.push(a).unwrap();
        tx.push(b).unwrap();
        assert_eq!(tx.depth(), 2);
        assert!(matches!(tx.check_capacity(), Err(TaskError::QueueFull { capacity: 2 })));

        assert_eq!(rx.recv().await, Some(a));
        assert!(tx.check_capacity().is_ok());
        assert_eq!(rx.recv().await, Some(b));
        assert_eq!(tx.depth(), 0);
    }

    #[tokio::test]
    async fn push_fails_once_worker_is_gone() {
        let (tx, rx) = task_queue(4);
        drop(rx);
        assert!(matches!(tx.push(TaskId::new()), Err(TaskError::QueueClosed)));
        assert_eq!(tx.depth(), 0);
    }
}
