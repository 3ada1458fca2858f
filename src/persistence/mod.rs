//! Crash-safe persistence and resume.
//!
//! Snapshots are plain JSON files keyed by goal hash, written with a
//! temp-file-then-rename so a crash mid-write never leaves a torn snapshot
//! behind. Loading is fail-closed: a snapshot that does not parse is a
//! `CorruptSnapshot` error, never a silent full rebuild.

use std::collections::{HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::core::errors::{EngineError, Result};
use crate::executor::{
    ArtifactExecutor, ArtifactResult, ArtifactSource, ExecutionEvent, ExecutionResult,
    ExecutorContext,
};
use crate::graph::{ArtifactGraph, ModelTier};

/// Stable identity of a goal, used as the snapshot filename.
pub fn hash_goal(goal: &str) -> String {
    let digest = Sha256::digest(goal.trim().to_lowercase().as_bytes());
    hex::encode(&digest[..8])
}

/// Lifecycle of a saved execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Planned,
    InProgress,
    Paused,
    Completed,
    Failed,
}

/// Durable record of one completed artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRecord {
    pub artifact_id: String,
    pub content_hash: String,
    pub tier: ModelTier,
    pub duration_ms: u64,
    pub verified: bool,
    pub completed_at: DateTime<Utc>,
}

impl CompletionRecord {
    pub fn from_result(result: &ArtifactResult) -> Self {
        Self {
            artifact_id: result.artifact_id.clone(),
            content_hash: result.content_hash.clone(),
            tier: result.tier,
            duration_ms: result.duration_ms,
            verified: result.verified,
            completed_at: Utc::now(),
        }
    }

    /// Rebuild an executor-shaped result from the durable record. Content
    /// is not persisted, only its hash.
    pub fn hydrate(&self) -> ArtifactResult {
        ArtifactResult {
            artifact_id: self.artifact_id.clone(),
            content: None,
            verified: self.verified,
            tier: self.tier,
            duration_ms: self.duration_ms,
            content_hash: self.content_hash.clone(),
        }
    }
}

/// Snapshot of one execution: the full graph plus per-artifact progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedExecution {
    /// Unique per planning session; survives resumes of the same plan.
    pub execution_id: String,
    pub goal: String,
    pub goal_hash: String,
    pub graph: ArtifactGraph,
    pub completed: HashMap<String, CompletionRecord>,
    pub failed: HashMap<String, String>,
    pub status: ExecutionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SavedExecution {
    pub fn new(goal: impl Into<String>, graph: ArtifactGraph) -> Self {
        let goal = goal.into();
        let goal_hash = hash_goal(&goal);
        let now = Utc::now();
        Self {
            execution_id: uuid::Uuid::new_v4().to_string(),
            goal,
            goal_hash,
            graph,
            completed: HashMap::new(),
            failed: HashMap::new(),
            status: ExecutionStatus::Planned,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn mark_completed(&mut self, record: CompletionRecord) {
        self.failed.remove(&record.artifact_id);
        self.completed.insert(record.artifact_id.clone(), record);
        self.updated_at = Utc::now();
    }

    pub fn mark_failed(&mut self, artifact_id: impl Into<String>, error: impl Into<String>) {
        self.failed.insert(artifact_id.into(), error.into());
        self.updated_at = Utc::now();
    }

    /// Ids in the graph with no completion record yet. Failed artifacts are
    /// pending too: a resume re-attempts them.
    pub fn pending_ids(&self) -> HashSet<String> {
        self.graph
            .ids()
            .filter(|id| !self.completed.contains_key(*id))
            .map(str::to_string)
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.pending_ids().is_empty()
    }

    /// Fold an executor run into the snapshot and advance the status.
    pub fn absorb(&mut self, result: &ExecutionResult) {
        for (id, artifact) in &result.completed {
            if !result.skipped.contains(id) {
                self.mark_completed(CompletionRecord::from_result(artifact));
            }
        }
        for (id, error) in &result.failed {
            self.mark_failed(id.clone(), error.clone());
        }
        self.status = if self.is_complete() {
            ExecutionStatus::Completed
        } else if result.cancelled {
            ExecutionStatus::Paused
        } else if result.failed.is_empty() && result.blocked.is_empty() {
            ExecutionStatus::InProgress
        } else {
            ExecutionStatus::Failed
        };
        self.updated_at = Utc::now();
    }
}

/// Directory of execution snapshots, one JSON file per goal hash.
#[derive(Debug, Clone)]
pub struct PlanStore {
    dir: PathBuf,
}

impl PlanStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn snapshot_path(&self, goal_hash: &str) -> PathBuf {
        self.dir.join(format!("{goal_hash}.json"))
    }

    /// Write the snapshot atomically: serialize to a sibling temp file,
    /// then rename over the final name.
    pub fn save(&self, saved: &SavedExecution) -> Result<()> {
        let path = self.snapshot_path(&saved.goal_hash);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(saved)?;
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        debug!(goal_hash = %saved.goal_hash, path = %path.display(), "snapshot saved");
        Ok(())
    }

    pub fn load(&self, goal_hash: &str) -> Result<SavedExecution> {
        let path = self.snapshot_path(goal_hash);
        if !path.exists() {
            return Err(EngineError::SnapshotNotFound {
                goal_hash: goal_hash.to_string(),
            });
        }
        let raw = fs::read_to_string(&path)?;
        serde_json::from_str(&raw).map_err(|e| EngineError::CorruptSnapshot {
            path,
            reason: e.to_string(),
        })
    }

    pub fn find_by_goal(&self, goal: &str) -> Result<SavedExecution> {
        self.load(&hash_goal(goal))
    }

    pub fn exists(&self, goal_hash: &str) -> bool {
        self.snapshot_path(goal_hash).exists()
    }

    pub fn delete(&self, goal_hash: &str) -> Result<()> {
        let path = self.snapshot_path(goal_hash);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Most recently updated snapshots first. Unparseable files are
    /// skipped here; `load` is the fail-closed path.
    pub fn list_recent(&self, limit: usize) -> Result<Vec<SavedExecution>> {
        let mut snapshots = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(raw) = fs::read_to_string(&path) else {
                continue;
            };
            if let Ok(saved) = serde_json::from_str::<SavedExecution>(&raw) {
                snapshots.push(saved);
            }
        }
        snapshots.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        snapshots.truncate(limit);
        Ok(snapshots)
    }
}

/// Append-only JSONL trace alongside the snapshot.
pub struct TraceLogger {
    path: PathBuf,
}

impl TraceLogger {
    pub fn new(store: &PlanStore, goal_hash: &str) -> Self {
        Self {
            path: store.dir().join(format!("{goal_hash}.trace.jsonl")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event line. The file is never truncated; re-runs extend
    /// the same trace.
    pub fn log(&self, event: &str, payload: serde_json::Value) -> Result<()> {
        let mut line = serde_json::Map::new();
        line.insert("ts".to_string(), serde_json::json!(Utc::now().to_rfc3339()));
        line.insert("event".to_string(), serde_json::json!(event));
        if let serde_json::Value::Object(fields) = payload {
            for (k, v) in fields {
                line.insert(k, v);
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", serde_json::Value::Object(line))?;
        Ok(())
    }

    pub fn read_events(&self) -> Result<Vec<serde_json::Value>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&self.path)?;
        raw.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(EngineError::from))
            .collect()
    }
}

/// Streams executor events into the snapshot and trace as they happen, so
/// a crash at any point leaves a resumable record of every artifact that
/// finished before it.
pub struct Checkpointer {
    store: PlanStore,
    trace: TraceLogger,
    saved: SavedExecution,
}

impl Checkpointer {
    pub fn new(store: PlanStore, saved: SavedExecution) -> Self {
        let trace = TraceLogger::new(&store, &saved.goal_hash);
        Self { store, trace, saved }
    }

    pub fn into_saved(self) -> SavedExecution {
        self.saved
    }

    /// Fold one event into the snapshot. Terminal artifact events are
    /// written through to disk immediately; everything is traced.
    pub fn observe(&mut self, event: &ExecutionEvent) -> Result<()> {
        self.trace_event(event)?;
        match event {
            ExecutionEvent::ArtifactCompleted {
                artifact_id,
                verified,
                tier,
                duration_ms,
                content_hash,
                at,
            } => {
                self.saved.mark_completed(CompletionRecord {
                    artifact_id: artifact_id.clone(),
                    content_hash: content_hash.clone(),
                    tier: *tier,
                    duration_ms: *duration_ms,
                    verified: *verified,
                    completed_at: *at,
                });
                self.store.save(&self.saved)
            }
            ExecutionEvent::ArtifactFailed { artifact_id, error, .. } => {
                self.saved.mark_failed(artifact_id.clone(), error.clone());
                self.store.save(&self.saved)
            }
            _ => Ok(()),
        }
    }

    /// Consume events until the executor drops its sender. A failed write
    /// is logged and skipped; losing one checkpoint must not kill the run.
    pub async fn drain(mut self, mut rx: mpsc::UnboundedReceiver<ExecutionEvent>) -> Self {
        while let Some(event) = rx.recv().await {
            if let Err(e) = self.observe(&event) {
                warn!(error = %e, "checkpoint write failed");
            }
        }
        self
    }

    fn trace_event(&self, event: &ExecutionEvent) -> Result<()> {
        let mut value = serde_json::to_value(event)?;
        let name = value
            .get("event")
            .and_then(|v| v.as_str())
            .unwrap_or("event")
            .to_string();
        if let serde_json::Value::Object(fields) = &mut value {
            fields.remove("event");
        }
        self.trace.log(&name, value)
    }
}

/// Execute a snapshot's pending artifacts with durable progress: every
/// completion and failure is checkpointed to the store as it happens,
/// before the run finishes. Already-completed artifacts hydrate and are
/// never re-created. The checkpointer takes over the context's event
/// stream.
pub async fn run_checkpointed(
    saved: &mut SavedExecution,
    source: Arc<dyn ArtifactSource>,
    mut ctx: ExecutorContext,
    store: &PlanStore,
) -> Result<ExecutionResult> {
    saved.status = ExecutionStatus::InProgress;
    store.save(saved)?;

    let (tx, rx) = mpsc::unbounded_channel();
    ctx.events = Some(tx);
    let drain = tokio::spawn(Checkpointer::new(store.clone(), saved.clone()).drain(rx));

    let pending = saved.pending_ids();
    let hydrated: HashMap<String, ArtifactResult> = saved
        .completed
        .values()
        .map(|r| (r.artifact_id.clone(), r.hydrate()))
        .collect();

    let executor = ArtifactExecutor::new(ctx);
    let outcome = executor
        .execute_filtered(&saved.graph, source, Some(&pending), hydrated)
        .await;
    // Dropping the executor closes the event channel and ends the drain.
    drop(executor);
    let checkpointer = drain
        .await
        .map_err(|e| EngineError::internal(format!("checkpoint task failed: {e}")))?;

    let result = outcome?;
    *saved = checkpointer.into_saved();
    saved.absorb(&result);
    store.save(saved)?;
    Ok(result)
}

/// Resume a saved execution from the lowest incomplete wave.
///
/// Prior completions are trusted unconditionally; resume is for picking up
/// after a crash, while `incremental` re-validates inputs for re-runs
/// against a changed graph.
pub async fn resume(
    saved: &mut SavedExecution,
    source: Arc<dyn ArtifactSource>,
    executor: &ArtifactExecutor,
) -> Result<ExecutionResult> {
    let waves = saved.graph.execution_waves()?;
    let pending = saved.pending_ids();
    if pending.is_empty() {
        info!(goal_hash = %saved.goal_hash, "nothing to resume; execution already complete");
        saved.status = ExecutionStatus::Completed;
        return Ok(ExecutionResult {
            skipped: saved.completed.keys().cloned().collect(),
            completed: saved
                .completed
                .values()
                .map(|r| (r.artifact_id.clone(), r.hydrate()))
                .collect(),
            waves,
            ..ExecutionResult::default()
        });
    }

    // Everything from the first wave containing pending work onward is
    // re-examined; completed nodes in those waves stay hydrated.
    let first_pending = waves
        .iter()
        .position(|wave| wave.iter().any(|id| pending.contains(id)))
        .unwrap_or(0);
    let to_execute: HashSet<String> = waves[first_pending..]
        .iter()
        .flatten()
        .filter(|id| pending.contains(*id))
        .cloned()
        .collect();
    let hydrated: HashMap<String, ArtifactResult> = saved
        .completed
        .values()
        .map(|r| (r.artifact_id.clone(), r.hydrate()))
        .collect();

    info!(
        goal_hash = %saved.goal_hash,
        resume_wave = first_pending,
        to_execute = to_execute.len(),
        hydrated = hydrated.len(),
        "resuming execution"
    );

    saved.status = ExecutionStatus::InProgress;
    let result = executor
        .execute_filtered(&saved.graph, source, Some(&to_execute), hydrated)
        .await?;
    saved.absorb(&result);
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutorContext;
    use crate::graph::{ArtifactSpec, ModelTier};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn spec(id: &str, requires: &[&str]) -> ArtifactSpec {
        ArtifactSpec::new(id, format!("artifact {id}"))
            .with_contract(format!("contract for {id}"))
            .with_requires(requires.iter().copied())
    }

    fn chain_graph() -> ArtifactGraph {
        let mut graph = ArtifactGraph::new();
        graph.add(spec("schema", &[])).unwrap();
        graph.add(spec("model", &["schema"])).unwrap();
        graph.add(spec("api", &["model"])).unwrap();
        graph
    }

    fn record(id: &str) -> CompletionRecord {
        CompletionRecord {
            artifact_id: id.to_string(),
            content_hash: format!("hash-{id}"),
            tier: ModelTier::Small,
            duration_ms: 5,
            verified: true,
            completed_at: Utc::now(),
        }
    }

    #[test]
    fn test_goal_hash_is_stable_and_normalized() {
        assert_eq!(hash_goal("Build a parser"), hash_goal("  build a parser "));
        assert_ne!(hash_goal("build a parser"), hash_goal("build a lexer"));
        assert_eq!(hash_goal("x").len(), 16);
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = PlanStore::new(dir.path()).unwrap();

        let mut saved = SavedExecution::new("build the thing", chain_graph());
        saved.mark_completed(record("schema"));
        store.save(&saved).unwrap();

        let loaded = store.load(&saved.goal_hash).unwrap();
        assert_eq!(loaded.goal, "build the thing");
        assert_eq!(loaded.completed.len(), 1);
        assert_eq!(loaded.graph.len(), 3);
        assert_eq!(
            loaded.pending_ids(),
            ["model".to_string(), "api".to_string()].into_iter().collect()
        );
    }

    #[test]
    fn test_corrupt_snapshot_fails_closed() {
        let dir = tempfile::tempdir().unwrap();
        let store = PlanStore::new(dir.path()).unwrap();

        fs::write(dir.path().join("deadbeef.json"), "{ not json").unwrap();
        let err = store.load("deadbeef").unwrap_err();
        assert!(matches!(err, EngineError::CorruptSnapshot { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_missing_snapshot_is_distinct_from_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = PlanStore::new(dir.path()).unwrap();
        assert!(matches!(
            store.load("0000000000000000").unwrap_err(),
            EngineError::SnapshotNotFound { .. }
        ));
    }

    #[test]
    fn test_list_recent_orders_by_update() {
        let dir = tempfile::tempdir().unwrap();
        let store = PlanStore::new(dir.path()).unwrap();

        let older = SavedExecution::new("goal one", chain_graph());
        store.save(&older).unwrap();
        let mut newer = SavedExecution::new("goal two", chain_graph());
        newer.updated_at = Utc::now() + chrono::Duration::seconds(5);
        store.save(&newer).unwrap();

        let recent = store.list_recent(10).unwrap();
        assert_eq!(recent[0].goal, "goal two");
        assert_eq!(store.list_recent(1).unwrap().len(), 1);
    }

    #[test]
    fn test_trace_appends_and_never_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let store = PlanStore::new(dir.path()).unwrap();
        let trace = TraceLogger::new(&store, "abc123");

        trace
            .log("wave_started", serde_json::json!({"wave": 0}))
            .unwrap();
        trace
            .log("wave_completed", serde_json::json!({"wave": 0}))
            .unwrap();

        let events = trace.read_events().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["event"], "wave_started");
        assert_eq!(events[0]["wave"], 0);
        assert!(events[0]["ts"].is_string());
    }

    /// Records which ids were actually re-created on resume.
    struct RecordingSource {
        calls: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ArtifactSource for RecordingSource {
        async fn create(
            &self,
            spec: &ArtifactSpec,
            _tier: ModelTier,
        ) -> crate::core::errors::Result<String> {
            self.calls.lock().unwrap().push(spec.id.clone());
            Ok(format!("content of {}", spec.id))
        }
    }

    #[tokio::test]
    async fn test_resume_skips_completed_waves() {
        let mut graph = chain_graph();
        graph.freeze().unwrap();
        let mut saved = SavedExecution::new("resume me", graph);
        saved.mark_completed(record("schema"));
        saved.mark_completed(record("model"));

        let source = Arc::new(RecordingSource {
            calls: std::sync::Mutex::new(Vec::new()),
        });
        let executor = ArtifactExecutor::new(ExecutorContext::with_defaults());
        let result = resume(&mut saved, source.clone(), &executor).await.unwrap();

        assert_eq!(*source.calls.lock().unwrap(), vec!["api".to_string()]);
        assert!(result.completed.contains_key("api"));
        // Prior completions are trusted, not re-run.
        assert_eq!(result.completed["schema"].content_hash, "hash-schema");
        assert_eq!(saved.status, ExecutionStatus::Completed);
        assert!(saved.is_complete());
    }

    #[tokio::test]
    async fn test_progress_is_checkpointed_while_the_run_executes() {
        use std::sync::atomic::AtomicBool;

        /// While creating the second-wave artifact, watches the store until
        /// the first-wave completion shows up on disk.
        struct SnoopingSource {
            dir: PathBuf,
            goal_hash: String,
            saw_schema_on_disk: AtomicBool,
        }

        #[async_trait]
        impl ArtifactSource for SnoopingSource {
            async fn create(
                &self,
                spec: &ArtifactSpec,
                _tier: ModelTier,
            ) -> crate::core::errors::Result<String> {
                if spec.id == "model" {
                    let store = PlanStore::new(&self.dir)?;
                    for _ in 0..200 {
                        if let Ok(snapshot) = store.load(&self.goal_hash) {
                            if snapshot.completed.contains_key("schema") {
                                self.saw_schema_on_disk.store(true, Ordering::SeqCst);
                                break;
                            }
                        }
                        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                    }
                }
                Ok(format!("content of {}", spec.id))
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let store = PlanStore::new(dir.path()).unwrap();
        let mut saved = SavedExecution::new("durable progress", chain_graph());
        let source = Arc::new(SnoopingSource {
            dir: dir.path().to_path_buf(),
            goal_hash: saved.goal_hash.clone(),
            saw_schema_on_disk: AtomicBool::new(false),
        });

        let result = run_checkpointed(
            &mut saved,
            source.clone(),
            ExecutorContext::with_defaults(),
            &store,
        )
        .await
        .unwrap();

        assert!(result.is_complete());
        // The wave-1 completion hit the store before wave 2 finished.
        assert!(source.saw_schema_on_disk.load(Ordering::SeqCst));
        assert_eq!(saved.status, ExecutionStatus::Completed);

        let trace = TraceLogger::new(&store, &saved.goal_hash);
        let events = trace.read_events().unwrap();
        assert!(events.iter().any(|e| e["event"] == "wave_started"));
        assert!(events.iter().any(|e| e["event"] == "artifact_completed"));
    }

    #[tokio::test]
    async fn test_partial_run_resumes_without_recreating_completed_work() {
        use crate::executor::CancelHandle;

        /// Cancels the run while the first wave is in flight.
        struct CancellingSource {
            handle: CancelHandle,
        }

        #[async_trait]
        impl ArtifactSource for CancellingSource {
            async fn create(
                &self,
                spec: &ArtifactSpec,
                _tier: ModelTier,
            ) -> crate::core::errors::Result<String> {
                self.handle.cancel();
                Ok(format!("content of {}", spec.id))
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let store = PlanStore::new(dir.path()).unwrap();
        let mut saved = SavedExecution::new("interrupted goal", chain_graph());
        let goal_hash = saved.goal_hash.clone();

        let ctx = ExecutorContext::with_defaults();
        let handle = ctx.cancel_handle();
        let first = run_checkpointed(
            &mut saved,
            Arc::new(CancellingSource { handle }),
            ctx,
            &store,
        )
        .await
        .unwrap();
        assert!(first.cancelled);

        // The interrupted run left a resumable snapshot behind.
        let reloaded = store.load(&goal_hash).unwrap();
        assert_eq!(reloaded.status, ExecutionStatus::Paused);
        assert!(reloaded.completed.contains_key("schema"));
        assert_eq!(
            reloaded.pending_ids(),
            ["model".to_string(), "api".to_string()].into_iter().collect()
        );

        // Picking the snapshot back up re-creates only what never finished.
        let mut resumed = store.load(&goal_hash).unwrap();
        let source = Arc::new(RecordingSource {
            calls: std::sync::Mutex::new(Vec::new()),
        });
        let second = run_checkpointed(
            &mut resumed,
            source.clone(),
            ExecutorContext::with_defaults(),
            &store,
        )
        .await
        .unwrap();

        assert!(second.is_complete());
        assert_eq!(
            *source.calls.lock().unwrap(),
            vec!["model".to_string(), "api".to_string()]
        );
        assert_eq!(store.load(&goal_hash).unwrap().status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_resume_on_complete_snapshot_is_a_noop() {
        let mut graph = chain_graph();
        graph.freeze().unwrap();
        let mut saved = SavedExecution::new("done already", graph);
        for id in ["schema", "model", "api"] {
            saved.mark_completed(record(id));
        }

        static UNUSED: AtomicUsize = AtomicUsize::new(0);
        struct PanicSource;
        #[async_trait]
        impl ArtifactSource for PanicSource {
            async fn create(
                &self,
                _spec: &ArtifactSpec,
                _tier: ModelTier,
            ) -> crate::core::errors::Result<String> {
                UNUSED.fetch_add(1, Ordering::SeqCst);
                Ok(String::new())
            }
        }

        let executor = ArtifactExecutor::new(ExecutorContext::with_defaults());
        let result = resume(&mut saved, Arc::new(PanicSource), &executor).await.unwrap();
        assert_eq!(UNUSED.load(Ordering::SeqCst), 0);
        assert_eq!(result.completed.len(), 3);
        assert_eq!(result.skipped.len(), 3);
    }
}
