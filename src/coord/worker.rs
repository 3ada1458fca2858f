//! Worker lifecycle: claim a goal, execute its graph in isolation, commit,
//! report.
//!
//! Liveness is published through a heartbeat file per worker so any
//! process (or a human with `cat`) can see who is alive and what they are
//! working on. A worker that stops refreshing its heartbeat is presumed
//! dead and its claims are released by the coordinator.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::coord::locks::FileLockManager;
use crate::coord::worktree::{WorktreeHandle, WorktreeManager};
use crate::core::errors::{EngineError, Result};
use crate::executor::{ArtifactSource, ExecutionResult, ExecutorContext};
use crate::graph::ArtifactGraph;
use crate::persistence::{hash_goal, run_checkpointed, PlanStore, SavedExecution};

/// Worker lifecycle states, advanced strictly forward per goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Starting,
    Idle,
    Claiming,
    Executing,
    Committing,
    Stopped,
    Failed,
}

/// One heartbeat snapshot, serialized to
/// `.wavefront/workers/<worker_id>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub worker_id: String,
    pub pid: u32,
    pub state: WorkerState,
    /// Branch this worker commits to, when isolated in a worktree.
    pub branch: Option<String>,
    pub current_goal: Option<String>,
    pub completed_goals: usize,
    pub failed_goals: usize,
    pub updated_at: DateTime<Utc>,
}

impl WorkerStatus {
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        now.signed_duration_since(self.updated_at).num_milliseconds()
            >= threshold.as_millis() as i64
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, WorkerState::Stopped | WorkerState::Failed)
    }
}

/// Publishes worker liveness to a status file.
pub struct Heartbeat {
    path: PathBuf,
    status: std::sync::Mutex<WorkerStatus>,
}

impl Heartbeat {
    pub fn new(dir: &Path, worker_id: &str, branch: Option<String>) -> Result<Arc<Self>> {
        std::fs::create_dir_all(dir)?;
        let status = WorkerStatus {
            worker_id: worker_id.to_string(),
            pid: std::process::id(),
            state: WorkerState::Starting,
            branch,
            current_goal: None,
            completed_goals: 0,
            failed_goals: 0,
            updated_at: Utc::now(),
        };
        let beat = Arc::new(Self {
            path: dir.join(format!("{worker_id}.json")),
            status: std::sync::Mutex::new(status),
        });
        beat.flush()?;
        Ok(beat)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Transition state and publish immediately.
    pub fn set_state(&self, state: WorkerState, current_goal: Option<String>) {
        {
            let mut status = self.status.lock().expect("heartbeat mutex poisoned");
            status.state = state;
            status.current_goal = current_goal;
            status.updated_at = Utc::now();
        }
        if let Err(e) = self.flush() {
            warn!(error = %e, "heartbeat write failed");
        }
    }

    pub fn record_outcome(&self, success: bool) {
        let mut status = self.status.lock().expect("heartbeat mutex poisoned");
        if success {
            status.completed_goals += 1;
        } else {
            status.failed_goals += 1;
        }
        status.updated_at = Utc::now();
    }

    /// Refresh the timestamp without changing state; called from the
    /// background refresher so long executions stay visibly alive.
    pub fn touch(&self) {
        {
            let mut status = self.status.lock().expect("heartbeat mutex poisoned");
            status.updated_at = Utc::now();
        }
        if let Err(e) = self.flush() {
            warn!(error = %e, "heartbeat write failed");
        }
    }

    fn flush(&self) -> Result<()> {
        let json = {
            let status = self.status.lock().expect("heartbeat mutex poisoned");
            serde_json::to_string_pretty(&*status)?
        };
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Spawn a task refreshing the timestamp until the handle is aborted.
    pub fn spawn_refresher(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let beat = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                beat.touch();
            }
        })
    }

    pub fn read_from(path: &Path) -> Result<WorkerStatus> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// A claimable unit of work: one goal with its planned graph.
#[derive(Debug, Clone)]
pub struct GoalTask {
    pub goal: String,
    pub goal_hash: String,
    pub graph: ArtifactGraph,
}

impl GoalTask {
    pub fn new(goal: impl Into<String>, graph: ArtifactGraph) -> Self {
        let goal = goal.into();
        let goal_hash = hash_goal(&goal);
        Self { goal, goal_hash, graph }
    }

    fn lock_resource(&self) -> String {
        format!("goal:{}", self.goal_hash)
    }
}

/// What a worker tells the coordinator about one goal attempt.
#[derive(Debug)]
pub struct WorkerReport {
    pub worker_id: String,
    pub goal: String,
    pub goal_hash: String,
    pub branch: Option<String>,
    pub execution: Option<ExecutionResult>,
    pub error: Option<String>,
}

impl WorkerReport {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
            && self
                .execution
                .as_ref()
                .map(ExecutionResult::is_complete)
                .unwrap_or(false)
    }
}

/// Everything a worker needs, owned per worker.
pub struct Worker {
    pub id: String,
    locks: FileLockManager,
    heartbeat: Arc<Heartbeat>,
    worktree: Option<(Arc<WorktreeManager>, WorktreeHandle)>,
    /// Where output files land when no worktree isolates this worker.
    fallback_root: PathBuf,
    /// Shared snapshot store; progress per goal is checkpointed here so a
    /// dead worker's finished artifacts survive to the next attempt.
    store: PlanStore,
    ctx: ExecutorContext,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        locks: FileLockManager,
        heartbeat: Arc<Heartbeat>,
        worktree: Option<(Arc<WorktreeManager>, WorktreeHandle)>,
        fallback_root: impl Into<PathBuf>,
        store: PlanStore,
        ctx: ExecutorContext,
    ) -> Self {
        Self {
            id: id.into(),
            locks,
            heartbeat,
            worktree,
            fallback_root: fallback_root.into(),
            store,
            ctx,
        }
    }

    pub fn branch(&self) -> Option<&str> {
        self.worktree.as_ref().map(|(_, h)| h.branch.as_str())
    }

    /// Directory artifact output files are written into: the worker's
    /// worktree when isolated, otherwise the process working directory.
    fn output_root(&self) -> PathBuf {
        self.worktree
            .as_ref()
            .map(|(_, h)| h.path.clone())
            .unwrap_or_else(|| self.fallback_root.clone())
    }

    /// Claim-execute-commit loop over the shared goal list. `done` is the
    /// cross-worker set of finished goal hashes.
    pub async fn run(
        self,
        goals: Arc<Vec<GoalTask>>,
        done: Arc<DashSet<String>>,
        source: Arc<dyn ArtifactSource>,
        reports: mpsc::Sender<WorkerReport>,
    ) {
        self.heartbeat.set_state(WorkerState::Idle, None);

        for goal in goals.iter() {
            if done.contains(&goal.goal_hash) {
                continue;
            }

            self.heartbeat
                .set_state(WorkerState::Claiming, Some(goal.goal.clone()));
            match self.locks.try_acquire(&goal.lock_resource()) {
                Ok(()) => {}
                Err(EngineError::LockHeld { holder, .. }) => {
                    // Another worker has it; move on to the next goal.
                    debug!(worker_id = %self.id, goal = %goal.goal, %holder, "goal already claimed");
                    continue;
                }
                Err(e) => {
                    warn!(worker_id = %self.id, error = %e, "claim failed");
                    continue;
                }
            }
            // Re-check after winning the race: the previous holder may have
            // finished the goal before releasing.
            if done.contains(&goal.goal_hash) {
                self.locks.release(&goal.lock_resource()).ok();
                continue;
            }

            info!(worker_id = %self.id, goal = %goal.goal, "goal claimed");
            let report = self.execute_goal(goal, Arc::clone(&source)).await;
            self.heartbeat.record_outcome(report.succeeded());
            if report.succeeded() {
                done.insert(goal.goal_hash.clone());
            }
            self.locks.release(&goal.lock_resource()).ok();

            if reports.send(report).await.is_err() {
                // Coordinator is gone; stop quietly.
                break;
            }
            self.heartbeat.set_state(WorkerState::Idle, None);
        }

        self.heartbeat.set_state(WorkerState::Stopped, None);
    }

    async fn execute_goal(&self, goal: &GoalTask, source: Arc<dyn ArtifactSource>) -> WorkerReport {
        self.heartbeat
            .set_state(WorkerState::Executing, Some(goal.goal.clone()));

        // Pick up where a previous attempt left off; completed artifacts in
        // the snapshot are never re-created. A corrupt snapshot fails the
        // goal rather than silently redoing its side effects.
        let mut saved = match self.store.load(&goal.goal_hash) {
            Ok(saved) => saved,
            Err(EngineError::SnapshotNotFound { .. }) => {
                SavedExecution::new(goal.goal.clone(), goal.graph.clone())
            }
            Err(e) => {
                return WorkerReport {
                    worker_id: self.id.clone(),
                    goal: goal.goal.clone(),
                    goal_hash: goal.goal_hash.clone(),
                    branch: self.branch().map(str::to_string),
                    execution: None,
                    error: Some(e.to_string()),
                }
            }
        };

        let execution =
            match run_checkpointed(&mut saved, source, self.ctx.clone(), &self.store).await {
                Ok(result) => result,
                Err(e) => {
                    return WorkerReport {
                        worker_id: self.id.clone(),
                        goal: goal.goal.clone(),
                        goal_hash: goal.goal_hash.clone(),
                        branch: self.branch().map(str::to_string),
                        execution: None,
                        error: Some(e.to_string()),
                    }
                }
            };

        // Materialize produced files inside this worker's isolation.
        if let Err(e) = self.write_outputs(goal, &execution) {
            return WorkerReport {
                worker_id: self.id.clone(),
                goal: goal.goal.clone(),
                goal_hash: goal.goal_hash.clone(),
                branch: self.branch().map(str::to_string),
                execution: Some(execution),
                error: Some(e.to_string()),
            };
        }

        let mut error = None;
        if let Some((manager, handle)) = &self.worktree {
            self.heartbeat
                .set_state(WorkerState::Committing, Some(goal.goal.clone()));
            let message = format!(
                "{}: {} artifacts",
                goal.goal,
                execution.completed.len() - execution.skipped.len()
            );
            if let Err(e) = manager.commit_all(handle, &message).await {
                error = Some(e.to_string());
            }
        }

        WorkerReport {
            worker_id: self.id.clone(),
            goal: goal.goal.clone(),
            goal_hash: goal.goal_hash.clone(),
            branch: self.branch().map(str::to_string),
            execution: Some(execution),
            error,
        }
    }

    fn write_outputs(&self, goal: &GoalTask, execution: &ExecutionResult) -> Result<()> {
        let root = self.output_root();
        let skipped: &HashSet<String> = &execution.skipped;
        for (id, result) in &execution.completed {
            if skipped.contains(id) {
                continue;
            }
            let Some(content) = &result.content else { continue };
            let Ok(spec) = goal.graph.get(id) else { continue };
            let Some(rel) = &spec.produces_file else { continue };
            let target = root.join(rel);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&target, content.as_bytes())?;
        }
        Ok(())
    }
}
