//! Multi-instance coordination: file locks, worktree isolation, branch
//! merging, and the worker/coordinator pair that ties them together.

pub mod coordinator;
pub mod locks;
pub mod merge;
pub mod worker;
pub mod worktree;

pub use coordinator::{CoordinatorConfig, CoordinatorResult, WorkerCoordinator};
pub use locks::{FileLockManager, LockRecord};
pub use merge::{BranchMerger, MergeReport, MergeStrategy};
pub use worker::{GoalTask, Heartbeat, Worker, WorkerReport, WorkerState, WorkerStatus};
pub use worktree::{StagingArea, WorktreeHandle, WorktreeManager};
