//! Task orchestration for asynchronous song generation.
//!
//! Submissions are validated and persisted by the [`TaskRegistry`], consumed
//! in FIFO order by the [`Worker`], rendered by a [`GenerationExecutor`], and
//! removed after the retention window by the [`CleanupSweeper`]. Every task
//! lives in its own directory under the storage root:
//!
//! ```text
//! <root>/<task-id>/metadata.json
//! <root>/<task-id>/input/...
//! <root>/<task-id>/output/output.wav
//! ```

pub mod error;
pub mod executor;
pub mod queue;
pub mod registry;
pub mod store;
pub mod sweeper;
pub mod task;
pub mod worker;

pub use error::{ExecutionError, StoreError, TaskError, ValidationError};
pub use executor::{
    CommandExecutor, GenerationExecutor, GenerationRequest, ProgressReporter, SilentExecutor,
};
pub use queue::TaskQueue;
pub use registry::{RecoveryReport, TaskRegistry};
pub use store::FsTaskStore;
pub use sweeper::{CleanupSweeper, SweepReport, SweeperConfig};
pub use task::{Submission, Task, TaskId, TaskKind, TaskStatus, Upload};
pub use worker::{Worker, WorkerConfig};
