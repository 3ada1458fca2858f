//! Multi-worker coordination: spawn workers, watch their heartbeats,
//! reap the dead, merge what they built.
//!
//! The coordinator is crash-tolerant rather than crash-free: worker death
//! is detected through heartbeat staleness and wall-clock timeouts, the
//! dead worker's claims are released so survivors pick the goals up, and
//! replacements are spawned under a bounded retry budget.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::coord::locks::FileLockManager;
use crate::coord::merge::{BranchMerger, MergeStrategy};
use crate::coord::worker::{GoalTask, Heartbeat, Worker, WorkerReport, WorkerState};
use crate::coord::worktree::{WorktreeHandle, WorktreeManager};
use crate::core::errors::{EngineError, Result};
use crate::core::limits::{ExecutionLimits, ResourceGovernor};
use crate::executor::{ArtifactSource, ExecutorContext};
use crate::persistence::PlanStore;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Number of concurrent workers.
    pub workers: usize,
    /// Hard wall-clock budget per worker; exceeding it kills the worker.
    pub worker_timeout: Duration,
    pub merge_strategy: MergeStrategy,
    /// Bounded wait for the coordinator's own merge lock.
    pub lock_timeout: Duration,
    /// Age past which a lock or heartbeat belongs to a dead process.
    pub stale_lock_threshold: Duration,
    pub branch_prefix: String,
    pub heartbeat_interval: Duration,
    /// Replacement workers spawned after deaths, in total.
    pub max_respawns: u32,
    /// Delete worker branches after a successful merge.
    pub cleanup_branches: bool,
    /// Isolate workers in git worktrees. Off for non-git workspaces;
    /// output files then land in the process working directory.
    pub use_worktrees: bool,
    pub target_branch: String,
    pub limits: ExecutionLimits,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            worker_timeout: Duration::from_secs(900),
            merge_strategy: MergeStrategy::default(),
            lock_timeout: Duration::from_secs(30),
            stale_lock_threshold: Duration::from_secs(120),
            branch_prefix: "wavefront/".to_string(),
            heartbeat_interval: Duration::from_secs(5),
            max_respawns: 2,
            cleanup_branches: true,
            use_worktrees: true,
            target_branch: "main".to_string(),
            limits: ExecutionLimits::default(),
        }
    }
}

impl CoordinatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(EngineError::configuration("workers must be greater than 0"));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(EngineError::configuration(
                "heartbeat_interval must be greater than 0",
            ));
        }
        if self.branch_prefix.is_empty() {
            return Err(EngineError::configuration("branch_prefix must not be empty"));
        }
        self.limits.validate()
    }

    /// Heartbeats older than a few intervals mean the worker stopped
    /// beating, whatever its state file claims.
    fn heartbeat_staleness(&self) -> Duration {
        self.heartbeat_interval * 4
    }
}

/// Aggregate outcome of one coordinated run.
#[derive(Debug, Default)]
pub struct CoordinatorResult {
    pub total_goals: usize,
    pub completed: Vec<String>,
    pub failed: HashMap<String, String>,
    pub merged_branches: Vec<String>,
    pub conflict_branches: Vec<String>,
    pub workers_used: usize,
    pub duration_ms: u64,
    pub errors: Vec<String>,
}

impl CoordinatorResult {
    pub fn all_completed(&self) -> bool {
        self.completed.len() == self.total_goals
    }
}

/// One live worker under supervision.
struct WorkerSlot {
    id: String,
    handle: JoinHandle<()>,
    refresher: JoinHandle<()>,
    heartbeat_path: PathBuf,
    started: Instant,
    worktree: Option<WorktreeHandle>,
    dead: bool,
}

/// Fans goals out over N workers and folds their work back together.
pub struct WorkerCoordinator {
    root: PathBuf,
    config: CoordinatorConfig,
}

impl WorkerCoordinator {
    pub fn new(root: impl Into<PathBuf>, config: CoordinatorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            root: root.into(),
            config,
        })
    }

    fn locks_dir(&self) -> PathBuf {
        self.root.join(".wavefront").join("locks")
    }

    fn workers_dir(&self) -> PathBuf {
        self.root.join(".wavefront").join("workers")
    }

    fn plans_dir(&self) -> PathBuf {
        self.root.join(".wavefront").join("plans")
    }

    pub async fn execute(
        &self,
        goals: Vec<GoalTask>,
        source: Arc<dyn ArtifactSource>,
    ) -> Result<CoordinatorResult> {
        let started = Instant::now();
        let mut result = CoordinatorResult {
            total_goals: goals.len(),
            ..CoordinatorResult::default()
        };
        if goals.is_empty() {
            return Ok(result);
        }

        let worktrees = if self.config.use_worktrees {
            let manager =
                Arc::new(WorktreeManager::new(&self.root, &self.config.branch_prefix).await?);
            if !manager.is_clean().await? {
                return Err(EngineError::DirtyWorkingTree);
            }
            manager.prune().await?;
            Some(manager)
        } else {
            None
        };

        let goals = Arc::new(goals);
        let done: Arc<DashSet<String>> = Arc::new(DashSet::new());
        let governor = ResourceGovernor::with_defaults();
        let (tx, mut rx) = mpsc::channel::<WorkerReport>(goals.len().max(1));
        let mut tx = Some(tx);

        let mut slots = Vec::new();
        for index in 0..self.config.workers {
            let slot = self
                .spawn_worker(
                    index,
                    worktrees.as_ref(),
                    Arc::clone(&goals),
                    Arc::clone(&done),
                    Arc::clone(&governor),
                    Arc::clone(&source),
                    tx.as_ref().expect("sender alive during spawn").clone(),
                )
                .await?;
            slots.push(slot);
        }
        result.workers_used = slots.len();

        // Supervision loop: collect reports, reap stalled workers, respawn
        // within the retry budget, stop when every worker is gone.
        let mut reports = Vec::new();
        let mut respawns_left = self.config.max_respawns;
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(report) => reports.push(report),
                    None => break,
                },
                _ = ticker.tick() => {
                    let reaped = self.reap_stalled(&mut slots, &mut result).await;
                    for _ in 0..reaped {
                        if respawns_left == 0 {
                            continue;
                        }
                        respawns_left -= 1;
                        let index = self.config.workers + (self.config.max_respawns - respawns_left) as usize;
                        match self
                            .spawn_worker(
                                index,
                                worktrees.as_ref(),
                                Arc::clone(&goals),
                                Arc::clone(&done),
                                Arc::clone(&governor),
                                Arc::clone(&source),
                                tx.as_ref().expect("sender alive while respawning").clone(),
                            )
                            .await
                        {
                            Ok(slot) => {
                                result.workers_used += 1;
                                slots.push(slot);
                            }
                            Err(e) => result.errors.push(format!("respawn failed: {e}")),
                        }
                    }
                    if slots.iter().all(|s| s.dead || s.handle.is_finished()) {
                        // Closing our sender lets recv drain and return None.
                        tx.take();
                    }
                }
            }
        }
        for slot in &slots {
            slot.refresher.abort();
        }
        // Every worker has finished or been aborted; reap the join results
        // and drop their status files now that supervision is over.
        let _ = join_all(slots.iter_mut().map(|slot| &mut slot.handle)).await;
        for slot in &slots {
            std::fs::remove_file(&slot.heartbeat_path).ok();
        }

        self.fold_reports(&goals, &done, reports, &mut result);

        if let Some(manager) = &worktrees {
            // Worktrees come down before merging: integration may rewrite a
            // worker branch, which git refuses while it is checked out.
            self.remove_worktrees(manager, &slots, &mut result).await;
            self.merge_phase(manager, &slots, &mut result).await;
            if self.config.cleanup_branches {
                let merged = result.merged_branches.clone();
                self.delete_branches(manager, &merged, &mut result).await;
            }
            manager.prune().await.ok();
        }

        result.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            completed = result.completed.len(),
            failed = result.failed.len(),
            merged = result.merged_branches.len(),
            conflicts = result.conflict_branches.len(),
            "coordinated run finished"
        );
        Ok(result)
    }

    #[allow(clippy::too_many_arguments)]
    async fn spawn_worker(
        &self,
        index: usize,
        worktrees: Option<&Arc<WorktreeManager>>,
        goals: Arc<Vec<GoalTask>>,
        done: Arc<DashSet<String>>,
        governor: Arc<ResourceGovernor>,
        source: Arc<dyn ArtifactSource>,
        tx: mpsc::Sender<WorkerReport>,
    ) -> Result<WorkerSlot> {
        let id = format!("worker-{index}");
        let worktree = match worktrees {
            Some(manager) => {
                let handle = manager.create(&id).await?;
                Some((Arc::clone(manager), handle))
            }
            None => None,
        };
        let worktree_handle = worktree.as_ref().map(|(_, h)| h.clone());

        let heartbeat = Heartbeat::new(
            &self.workers_dir(),
            &id,
            worktree_handle.as_ref().map(|h| h.branch.clone()),
        )?;
        let refresher = heartbeat.spawn_refresher(self.config.heartbeat_interval);

        let locks = FileLockManager::new(self.locks_dir(), &id, self.config.stale_lock_threshold)?;
        let store = PlanStore::new(self.plans_dir())?;
        let ctx = ExecutorContext::new(self.config.limits.clone(), governor)?;
        let worker = Worker::new(&id, locks, Arc::clone(&heartbeat), worktree, &self.root, store, ctx);

        info!(worker_id = %id, "worker spawned");
        let handle = tokio::spawn(worker.run(goals, done, source, tx));
        Ok(WorkerSlot {
            id,
            handle,
            refresher,
            heartbeat_path: heartbeat.path().to_path_buf(),
            started: Instant::now(),
            worktree: worktree_handle,
            dead: false,
        })
    }

    /// Kill workers that blew their wall-clock budget or stopped beating,
    /// and release whatever they had claimed. Returns how many were
    /// reaped.
    async fn reap_stalled(
        &self,
        slots: &mut [WorkerSlot],
        result: &mut CoordinatorResult,
    ) -> usize {
        let now: DateTime<Utc> = Utc::now();
        let mut reaped = 0;
        for slot in slots.iter_mut() {
            if slot.dead || slot.handle.is_finished() {
                continue;
            }

            let timed_out = slot.started.elapsed() > self.config.worker_timeout;
            let stale = match Heartbeat::read_from(&slot.heartbeat_path) {
                // A terminally stopped worker no longer beats; that is not
                // staleness.
                Ok(status) => {
                    !status.is_terminal() && status.is_stale(now, self.config.heartbeat_staleness())
                }
                // Unreadable heartbeat file counts as silence.
                Err(_) => true,
            };
            if !timed_out && !stale {
                continue;
            }

            let err = EngineError::WorkerTimeout {
                worker_id: slot.id.clone(),
            };
            error!(worker_id = %slot.id, timed_out, stale, "reaping worker");
            slot.handle.abort();
            slot.refresher.abort();
            slot.dead = true;
            reaped += 1;
            result.errors.push(err.to_string());

            // Stamp the verdict for anyone inspecting the status files.
            if let Ok(mut status) = Heartbeat::read_from(&slot.heartbeat_path) {
                status.state = WorkerState::Failed;
                status.updated_at = Utc::now();
                if let Ok(json) = serde_json::to_string_pretty(&status) {
                    std::fs::write(&slot.heartbeat_path, json).ok();
                }
            }

            // Free the dead worker's claims so survivors can take over.
            match FileLockManager::new(
                self.locks_dir(),
                "coordinator",
                self.config.stale_lock_threshold,
            )
            .and_then(|manager| manager.release_all_for(&slot.id))
            {
                Ok(released) if !released.is_empty() => {
                    warn!(worker_id = %slot.id, resources = ?released, "released claims of dead worker");
                }
                Ok(_) => {}
                Err(e) => result.errors.push(format!("claim release failed: {e}")),
            }
        }
        reaped
    }

    fn fold_reports(
        &self,
        goals: &[GoalTask],
        done: &DashSet<String>,
        reports: Vec<WorkerReport>,
        result: &mut CoordinatorResult,
    ) {
        let mut last_error: HashMap<String, String> = HashMap::new();
        for report in reports {
            if let Some(error) = &report.error {
                last_error.insert(report.goal.clone(), error.clone());
            } else if let Some(execution) = &report.execution {
                if !execution.is_complete() {
                    let mut parts: Vec<String> = execution
                        .failed
                        .iter()
                        .map(|(id, e)| format!("{id}: {e}"))
                        .collect();
                    parts.sort();
                    last_error.insert(report.goal.clone(), parts.join("; "));
                }
            }
        }

        for goal in goals {
            if done.contains(&goal.goal_hash) {
                result.completed.push(goal.goal.clone());
            } else {
                let error = last_error
                    .remove(&goal.goal)
                    .unwrap_or_else(|| "goal never completed".to_string());
                result.failed.insert(goal.goal.clone(), error);
            }
        }
        result.completed.sort();
    }

    /// Merge worker branches into the target branch, ordered by each
    /// branch's first commit so reruns integrate in a stable order.
    async fn merge_phase(
        &self,
        manager: &WorktreeManager,
        slots: &[WorkerSlot],
        result: &mut CoordinatorResult,
    ) {
        let mut branches: Vec<(DateTime<Utc>, String)> = Vec::new();
        for slot in slots {
            let Some(worktree) = &slot.worktree else { continue };
            match manager
                .first_commit_time(&worktree.branch, &self.config.target_branch)
                .await
            {
                Ok(Some(at)) => branches.push((at, worktree.branch.clone())),
                // No commits of its own: nothing to merge.
                Ok(None) => {}
                Err(e) => result.errors.push(format!("{}: {e}", worktree.branch)),
            }
        }
        branches.sort();

        if branches.is_empty() {
            return;
        }

        // Only one process integrates at a time.
        let merge_lock = match FileLockManager::new(
            self.locks_dir(),
            "coordinator",
            self.config.stale_lock_threshold,
        ) {
            Ok(manager) => manager,
            Err(e) => {
                result.errors.push(format!("merge lock setup failed: {e}"));
                return;
            }
        };
        let merge_resource = format!("merge:{}", self.config.target_branch);
        if let Err(e) = merge_lock
            .acquire(&merge_resource, self.config.lock_timeout)
            .await
        {
            result.errors.push(format!("merge lock: {e}"));
            return;
        }

        let merger = BranchMerger::new(manager.repo_root(), &self.config.target_branch);
        for (_, branch) in branches {
            match merger.merge_branch(&branch, self.config.merge_strategy).await {
                Ok(report) if report.success => result.merged_branches.push(branch),
                Ok(report) => {
                    warn!(branch = %report.branch, conflicts = ?report.conflicts, "branch left unmerged");
                    result.conflict_branches.push(branch);
                }
                Err(e) => result.errors.push(format!("merge {branch}: {e}")),
            }
        }

        merge_lock.release(&merge_resource).ok();
    }

    async fn remove_worktrees(
        &self,
        manager: &WorktreeManager,
        slots: &[WorkerSlot],
        result: &mut CoordinatorResult,
    ) {
        for slot in slots {
            let Some(worktree) = &slot.worktree else { continue };
            if let Err(e) = manager.remove(worktree, true).await {
                result.errors.push(format!("worktree cleanup: {e}"));
            }
        }
    }

    async fn delete_branches(
        &self,
        manager: &WorktreeManager,
        merged: &[String],
        result: &mut CoordinatorResult,
    ) {
        for branch in merged {
            if let Err(e) = manager.delete_branch(branch).await {
                result.errors.push(format!("branch cleanup: {e}"));
            }
        }
    }
}
