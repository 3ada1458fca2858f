//! Wave-based parallel execution of artifact graphs.
//!
//! Waves are synchronous barriers: every node in wave `k` reaches a terminal
//! state before wave `k+1` starts, because later waves may read earlier
//! outputs. Within a wave, completion order is unspecified. The only
//! suspension points are the calls into the caller-supplied capabilities
//! (creation and verification); graph work and hashing are synchronous.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::core::errors::{EngineError, Result};
use crate::core::limits::{ExecutionLimits, ResourceGovernor};
use crate::graph::{select_tier, ArtifactGraph, ArtifactSpec, ModelTier, Wave};
use crate::incremental::hash_content;

/// Caller-supplied capability that turns a spec into content. The reference
/// implementation is a language-model backend; the executor does not care.
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    async fn create(&self, spec: &ArtifactSpec, tier: ModelTier) -> Result<String>;
}

/// Optional verification capability, run after each creation.
#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(&self, spec: &ArtifactSpec, content: &str) -> VerificationOutcome;
}

/// Result of checking content against its contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationOutcome {
    pub verified: bool,
    pub issues: Vec<String>,
}

impl VerificationOutcome {
    pub fn pass() -> Self {
        Self { verified: true, issues: Vec::new() }
    }

    pub fn fail(issues: Vec<String>) -> Self {
        Self { verified: false, issues }
    }
}

/// What a verification failure does to the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VerificationPolicy {
    /// Record `verified=false` and keep going.
    #[default]
    Advisory,
    /// Treat an unverified artifact as failed.
    FailOnUnverified,
}

/// Per-artifact state machine. Terminal states are final for one execution
/// instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    Pending,
    Running,
    Completed,
    Failed,
    /// A dependency failed; this node was never executed.
    Blocked,
    /// Satisfied by a previous execution; hydrated, not re-run.
    Skipped,
}

/// Output of executing one spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactResult {
    pub artifact_id: String,
    /// Omitted for hydrated or failed loads.
    pub content: Option<String>,
    pub verified: bool,
    pub tier: ModelTier,
    pub duration_ms: u64,
    pub content_hash: String,
}

/// Aggregate result of one executor run. Built by a single coordinating
/// task draining a channel; never mutated concurrently.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub completed: HashMap<String, ArtifactResult>,
    pub failed: HashMap<String, String>,
    /// Dependents of failed nodes, with the blocking dependency named.
    pub blocked: HashMap<String, String>,
    /// Hydrated from a previous execution instead of re-run.
    pub skipped: HashSet<String>,
    pub waves: Vec<Wave>,
    pub tier_distribution: HashMap<String, usize>,
    pub total_duration_ms: u64,
    pub cancelled: bool,
}

impl ExecutionResult {
    pub fn success_rate(&self) -> f64 {
        let total = self.completed.len() + self.failed.len() + self.blocked.len();
        if total == 0 {
            return 1.0;
        }
        self.completed.len() as f64 / total as f64
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.blocked.is_empty() && !self.cancelled
    }

    pub fn status_of(&self, id: &str) -> ArtifactStatus {
        if self.skipped.contains(id) {
            ArtifactStatus::Skipped
        } else if self.completed.contains_key(id) {
            ArtifactStatus::Completed
        } else if self.failed.contains_key(id) {
            ArtifactStatus::Failed
        } else if self.blocked.contains_key(id) {
            ArtifactStatus::Blocked
        } else {
            ArtifactStatus::Pending
        }
    }
}

/// Event stream emitted during execution, for tracing and UIs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExecutionEvent {
    WaveStarted { wave: usize, artifacts: Vec<String>, at: DateTime<Utc> },
    WaveCompleted { wave: usize, at: DateTime<Utc> },
    ArtifactStarted { artifact_id: String, tier: ModelTier, at: DateTime<Utc> },
    /// Carries the tier and content hash so persistence can be driven
    /// entirely off the event stream.
    ArtifactCompleted {
        artifact_id: String,
        verified: bool,
        tier: ModelTier,
        duration_ms: u64,
        content_hash: String,
        at: DateTime<Utc>,
    },
    ArtifactFailed { artifact_id: String, error: String, at: DateTime<Utc> },
    ArtifactBlocked { artifact_id: String, dependency: String, at: DateTime<Utc> },
    ArtifactSkipped { artifact_id: String, at: DateTime<Utc> },
    Cancelled { at: DateTime<Utc> },
}

pub type EventSender = mpsc::UnboundedSender<ExecutionEvent>;

/// Cancels an in-flight execution: the current wave drains, no new wave
/// starts, partial results remain valid.
#[derive(Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Explicit configuration object passed to the executor; there is no
/// ambient global state, so parallel test runs stay independent.
#[derive(Clone)]
pub struct ExecutorContext {
    pub limits: ExecutionLimits,
    pub governor: Arc<ResourceGovernor>,
    pub verifier: Option<Arc<dyn Verifier>>,
    pub policy: VerificationPolicy,
    pub events: Option<EventSender>,
    cancel_tx: Arc<watch::Sender<bool>>,
    cancel_rx: watch::Receiver<bool>,
}

impl ExecutorContext {
    pub fn new(limits: ExecutionLimits, governor: Arc<ResourceGovernor>) -> Result<Self> {
        limits.validate()?;
        let (tx, rx) = watch::channel(false);
        Ok(Self {
            limits,
            governor,
            verifier: None,
            policy: VerificationPolicy::default(),
            events: None,
            cancel_tx: Arc::new(tx),
            cancel_rx: rx,
        })
    }

    pub fn with_defaults() -> Self {
        Self::new(ExecutionLimits::default(), ResourceGovernor::with_defaults())
            .expect("default limits are valid")
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn Verifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn with_policy(mut self, policy: VerificationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            tx: Arc::clone(&self.cancel_tx),
        }
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    fn emit(&self, event: ExecutionEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

/// Message a wave task sends back to the coordinating owner.
enum WaveMessage {
    Done(ArtifactResult),
    Errored { artifact_id: String, error: String },
}

/// Executes a frozen artifact graph wave by wave.
pub struct ArtifactExecutor {
    ctx: ExecutorContext,
}

impl ArtifactExecutor {
    pub fn new(ctx: ExecutorContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &ExecutorContext {
        &self.ctx
    }

    /// Execute every node of the graph.
    pub async fn execute(
        &self,
        graph: &ArtifactGraph,
        source: Arc<dyn ArtifactSource>,
    ) -> Result<ExecutionResult> {
        self.execute_filtered(graph, source, None, HashMap::new()).await
    }

    /// Execute a subset of the graph, hydrating the rest.
    ///
    /// `to_execute = None` runs everything. Nodes outside the set must be
    /// covered by `hydrated` results (from a cache or a previous run);
    /// they count as skipped and their hashes feed dependents unchanged.
    pub async fn execute_filtered(
        &self,
        graph: &ArtifactGraph,
        source: Arc<dyn ArtifactSource>,
        to_execute: Option<&HashSet<String>>,
        hydrated: HashMap<String, ArtifactResult>,
    ) -> Result<ExecutionResult> {
        let started = Instant::now();
        let waves = graph.execution_waves()?;

        let mut result = ExecutionResult {
            waves: waves.clone(),
            ..ExecutionResult::default()
        };
        for (id, prior) in hydrated {
            result.skipped.insert(id.clone());
            result.completed.insert(id, prior);
        }

        let semaphores = TierSemaphores::from_limits(&self.ctx.limits);

        for (wave_num, wave) in waves.iter().enumerate() {
            if self.ctx.is_cancelled() {
                info!(wave = wave_num, "cancellation observed; no new wave started");
                self.ctx.emit(ExecutionEvent::Cancelled { at: Utc::now() });
                result.cancelled = true;
                break;
            }
            if started.elapsed() > self.ctx.limits.execution_timeout {
                warn!(wave = wave_num, "execution timeout reached; stopping before wave");
                result.cancelled = true;
                break;
            }

            let runnable = self.partition_wave(graph, wave, to_execute, &mut result);
            if runnable.is_empty() {
                continue;
            }

            self.ctx.emit(ExecutionEvent::WaveStarted {
                wave: wave_num,
                artifacts: runnable.clone(),
                at: Utc::now(),
            });
            debug!(wave = wave_num, count = runnable.len(), "wave started");

            self.run_wave(graph, &runnable, &source, &semaphores, &mut result)
                .await;

            self.ctx.emit(ExecutionEvent::WaveCompleted {
                wave: wave_num,
                at: Utc::now(),
            });
        }

        result.total_duration_ms = started.elapsed().as_millis() as u64;
        for r in result.completed.values() {
            *result
                .tier_distribution
                .entry(r.tier.to_string())
                .or_insert(0) += 1;
        }

        info!(
            completed = result.completed.len(),
            failed = result.failed.len(),
            blocked = result.blocked.len(),
            skipped = result.skipped.len(),
            "execution finished"
        );
        Ok(result)
    }

    /// Split one wave into nodes to run now, recording skips and blocks.
    fn partition_wave(
        &self,
        graph: &ArtifactGraph,
        wave: &Wave,
        to_execute: Option<&HashSet<String>>,
        result: &mut ExecutionResult,
    ) -> Vec<String> {
        let mut runnable = Vec::new();
        for id in wave {
            if result.completed.contains_key(id) {
                // Hydrated before the run started.
                continue;
            }
            if let Some(filter) = to_execute {
                if !filter.contains(id) {
                    // Outside the rebuild set and not hydrated: nothing to
                    // do, but dependents can still proceed.
                    result.skipped.insert(id.clone());
                    self.ctx.emit(ExecutionEvent::ArtifactSkipped {
                        artifact_id: id.clone(),
                        at: Utc::now(),
                    });
                    continue;
                }
            }

            // Dependents of failed or blocked nodes never execute with
            // missing inputs; they are reported blocked instead.
            let spec = match graph.get(id) {
                Ok(spec) => spec,
                Err(_) => continue,
            };
            let blocking = spec
                .requires
                .iter()
                .find(|dep| result.failed.contains_key(*dep) || result.blocked.contains_key(*dep));
            if let Some(dep) = blocking {
                let dep_state = if result.failed.contains_key(dep) {
                    "failed"
                } else {
                    "blocked"
                };
                result
                    .blocked
                    .insert(id.clone(), format!("dependency {dep_state}: {dep}"));
                self.ctx.emit(ExecutionEvent::ArtifactBlocked {
                    artifact_id: id.clone(),
                    dependency: dep.clone(),
                    at: Utc::now(),
                });
                continue;
            }

            runnable.push(id.clone());
        }
        runnable
    }

    /// Launch one task per runnable node and drain results serially.
    async fn run_wave(
        &self,
        graph: &ArtifactGraph,
        runnable: &[String],
        source: &Arc<dyn ArtifactSource>,
        semaphores: &TierSemaphores,
        result: &mut ExecutionResult,
    ) {
        let (tx, mut rx) = mpsc::channel::<WaveMessage>(runnable.len().max(1));

        for id in runnable {
            let Ok(spec) = graph.get(id).cloned() else { continue };
            let tier = select_tier(&spec, graph);
            let tx = tx.clone();
            let source = Arc::clone(source);
            let governor = Arc::clone(&self.ctx.governor);
            let semaphore = semaphores.for_tier(tier);
            let verifier = self.ctx.verifier.clone();
            let policy = self.ctx.policy;
            let artifact_timeout = self.ctx.limits.artifact_timeout;
            let events = self.ctx.events.clone();

            tokio::spawn(async move {
                let outcome = run_one(
                    spec,
                    tier,
                    source,
                    governor,
                    semaphore,
                    verifier,
                    policy,
                    artifact_timeout,
                    events,
                )
                .await;
                let _ = tx.send(outcome).await;
            });
        }
        drop(tx);

        // Single-owner accumulation: the result maps are only touched here.
        while let Some(message) = rx.recv().await {
            match message {
                WaveMessage::Done(artifact) => {
                    result.completed.insert(artifact.artifact_id.clone(), artifact);
                }
                WaveMessage::Errored { artifact_id, error } => {
                    result.failed.insert(artifact_id, error);
                }
            }
        }
    }
}

/// Create and verify a single artifact under the concurrency limits.
#[allow(clippy::too_many_arguments)]
async fn run_one(
    spec: ArtifactSpec,
    tier: ModelTier,
    source: Arc<dyn ArtifactSource>,
    governor: Arc<ResourceGovernor>,
    semaphore: Arc<Semaphore>,
    verifier: Option<Arc<dyn Verifier>>,
    policy: VerificationPolicy,
    artifact_timeout: Duration,
    events: Option<EventSender>,
) -> WaveMessage {
    let _tier_permit = match semaphore.acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => {
            return WaveMessage::Errored {
                artifact_id: spec.id,
                error: "tier semaphore closed".to_string(),
            }
        }
    };
    let _call_permit = match governor.acquire_call().await {
        Ok(permit) => permit,
        Err(e) => {
            return WaveMessage::Errored {
                artifact_id: spec.id,
                error: e.to_string(),
            }
        }
    };

    if let Some(tx) = &events {
        let _ = tx.send(ExecutionEvent::ArtifactStarted {
            artifact_id: spec.id.clone(),
            tier,
            at: Utc::now(),
        });
    }

    let started = Instant::now();
    let created = timeout(artifact_timeout, source.create(&spec, tier)).await;
    let duration_ms = started.elapsed().as_millis() as u64;

    let content = match created {
        Ok(Ok(content)) => content,
        Ok(Err(e)) => {
            if let Some(tx) = &events {
                let _ = tx.send(ExecutionEvent::ArtifactFailed {
                    artifact_id: spec.id.clone(),
                    error: e.to_string(),
                    at: Utc::now(),
                });
            }
            return WaveMessage::Errored {
                artifact_id: spec.id,
                error: e.to_string(),
            };
        }
        Err(_) => {
            let error = EngineError::Timeout {
                operation: format!("create({})", spec.id),
                elapsed_ms: duration_ms,
            }
            .to_string();
            if let Some(tx) = &events {
                let _ = tx.send(ExecutionEvent::ArtifactFailed {
                    artifact_id: spec.id.clone(),
                    error: error.clone(),
                    at: Utc::now(),
                });
            }
            return WaveMessage::Errored {
                artifact_id: spec.id,
                error,
            };
        }
    };

    // Buffered content counts against the global memory ceiling until this
    // call hands it back to the wave owner; breaching the ceiling fails the
    // artifact rather than buffering past the limit.
    let _reservation = match governor.reserve_memory(content.len() as u64) {
        Ok(reservation) => reservation,
        Err(e) => {
            let error = e.to_string();
            if let Some(tx) = &events {
                let _ = tx.send(ExecutionEvent::ArtifactFailed {
                    artifact_id: spec.id.clone(),
                    error: error.clone(),
                    at: Utc::now(),
                });
            }
            return WaveMessage::Errored {
                artifact_id: spec.id,
                error,
            };
        }
    };

    let verified = match &verifier {
        Some(v) => {
            let outcome = v.verify(&spec, &content).await;
            if !outcome.verified {
                warn!(artifact_id = %spec.id, issues = ?outcome.issues, "verification failed");
            }
            outcome.verified
        }
        None => true,
    };

    if !verified && policy == VerificationPolicy::FailOnUnverified {
        let error = "verification failed".to_string();
        if let Some(tx) = &events {
            let _ = tx.send(ExecutionEvent::ArtifactFailed {
                artifact_id: spec.id.clone(),
                error: error.clone(),
                at: Utc::now(),
            });
        }
        return WaveMessage::Errored {
            artifact_id: spec.id,
            error,
        };
    }

    let content_hash = hash_content(&content);
    if let Some(tx) = &events {
        let _ = tx.send(ExecutionEvent::ArtifactCompleted {
            artifact_id: spec.id.clone(),
            verified,
            tier,
            duration_ms,
            content_hash: content_hash.clone(),
            at: Utc::now(),
        });
    }

    WaveMessage::Done(ArtifactResult {
        artifact_id: spec.id,
        content: Some(content),
        verified,
        tier,
        duration_ms,
        content_hash,
    })
}

/// One semaphore per tier so cheap work runs wide and expensive work narrow.
struct TierSemaphores {
    small: Arc<Semaphore>,
    medium: Arc<Semaphore>,
    large: Arc<Semaphore>,
}

impl TierSemaphores {
    fn from_limits(limits: &ExecutionLimits) -> Self {
        Self {
            small: Arc::new(Semaphore::new(limits.concurrency_for(ModelTier::Small))),
            medium: Arc::new(Semaphore::new(limits.concurrency_for(ModelTier::Medium))),
            large: Arc::new(Semaphore::new(limits.concurrency_for(ModelTier::Large))),
        }
    }

    fn for_tier(&self, tier: ModelTier) -> Arc<Semaphore> {
        match tier {
            ModelTier::Small => Arc::clone(&self.small),
            ModelTier::Medium => Arc::clone(&self.medium),
            ModelTier::Large => Arc::clone(&self.large),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoSource;

    #[async_trait]
    impl ArtifactSource for EchoSource {
        async fn create(&self, spec: &ArtifactSpec, tier: ModelTier) -> Result<String> {
            Ok(format!("{}::{}", spec.id, tier))
        }
    }

    /// Fails exactly the ids it is given.
    struct FailingSource {
        fail: HashSet<String>,
    }

    #[async_trait]
    impl ArtifactSource for FailingSource {
        async fn create(&self, spec: &ArtifactSpec, _tier: ModelTier) -> Result<String> {
            if self.fail.contains(&spec.id) {
                Err(EngineError::creation(&spec.id, "backend rejected"))
            } else {
                Ok(format!("content of {}", spec.id))
            }
        }
    }

    struct CountingSource {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ArtifactSource for CountingSource {
        async fn create(&self, spec: &ArtifactSpec, _tier: ModelTier) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("content of {}", spec.id))
        }
    }

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
        graph.freeze().unwrap();
        graph
    }

    #[tokio::test]
    async fn test_executes_all_waves_in_order() {
        let graph = chain_graph();
        let executor = ArtifactExecutor::new(ExecutorContext::with_defaults());
        let result = executor.execute(&graph, Arc::new(EchoSource)).await.unwrap();

        assert_eq!(result.completed.len(), 3);
        assert!(result.failed.is_empty());
        assert!(result.is_complete());
        assert_eq!(
            result.waves,
            vec![
                vec!["schema".to_string()],
                vec!["model".to_string()],
                vec!["api".to_string()],
            ]
        );
        // Every completed artifact carries a content hash.
        for r in result.completed.values() {
            assert!(!r.content_hash.is_empty());
        }
    }

    #[tokio::test]
    async fn test_failure_isolation_blocks_dependents_only() {
        // Independent branches: a -> b and x -> y.
        let mut graph = ArtifactGraph::new();
        graph.add(spec("a", &[])).unwrap();
        graph.add(spec("b", &["a"])).unwrap();
        graph.add(spec("x", &[])).unwrap();
        graph.add(spec("y", &["x"])).unwrap();
        graph.freeze().unwrap();

        let source = FailingSource {
            fail: ["a".to_string()].into_iter().collect(),
        };
        let executor = ArtifactExecutor::new(ExecutorContext::with_defaults());
        let result = executor.execute(&graph, Arc::new(source)).await.unwrap();

        assert!(result.failed.contains_key("a"));
        assert!(result.blocked.contains_key("b"));
        assert!(result.completed.contains_key("x"));
        assert!(result.completed.contains_key("y"));
        assert_eq!(result.blocked["b"], "dependency failed: a");
        assert_eq!(result.status_of("a"), ArtifactStatus::Failed);
        assert_eq!(result.status_of("b"), ArtifactStatus::Blocked);
        assert_eq!(result.status_of("x"), ArtifactStatus::Completed);
        assert!(!result.is_complete());
        assert!((result.success_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_blocked_cascades_transitively() {
        let mut graph = ArtifactGraph::new();
        graph.add(spec("a", &[])).unwrap();
        graph.add(spec("b", &["a"])).unwrap();
        graph.add(spec("c", &["b"])).unwrap();
        graph.freeze().unwrap();

        let source = FailingSource {
            fail: ["a".to_string()].into_iter().collect(),
        };
        let executor = ArtifactExecutor::new(ExecutorContext::with_defaults());
        let result = executor.execute(&graph, Arc::new(source)).await.unwrap();

        assert_eq!(result.blocked["b"], "dependency failed: a");
        // The transitive dependent names its blocked dependency, not the
        // original failure.
        assert_eq!(result.blocked["c"], "dependency blocked: b");
        assert!(result.completed.is_empty());
    }

    #[tokio::test]
    async fn test_memory_ceiling_fails_artifact() {
        let mut graph = ArtifactGraph::new();
        graph.add(spec("huge", &[])).unwrap();
        graph.freeze().unwrap();

        // Ceiling of one byte: any real content breaches it.
        let governor = ResourceGovernor::new(4, 1).unwrap();
        let ctx = ExecutorContext::new(ExecutionLimits::default(), governor.clone()).unwrap();
        let result = ArtifactExecutor::new(ctx)
            .execute(&graph, Arc::new(EchoSource))
            .await
            .unwrap();

        assert!(result.failed["huge"].contains("resource exhausted"));
        assert_eq!(governor.stats().limit_violations, 1);
        assert_eq!(governor.stats().memory_usage_bytes, 0);
    }

    #[tokio::test]
    async fn test_filtered_execution_skips_outside_set() {
        let graph = chain_graph();
        let source = Arc::new(CountingSource { calls: AtomicUsize::new(0) });

        let hydrated: HashMap<String, ArtifactResult> = [(
            "schema".to_string(),
            ArtifactResult {
                artifact_id: "schema".to_string(),
                content: None,
                verified: true,
                tier: ModelTier::Small,
                duration_ms: 0,
                content_hash: "cached".to_string(),
            },
        )]
        .into_iter()
        .collect();
        let to_execute: HashSet<String> =
            ["model".to_string(), "api".to_string()].into_iter().collect();

        let executor = ArtifactExecutor::new(ExecutorContext::with_defaults());
        let result = executor
            .execute_filtered(&graph, source.clone(), Some(&to_execute), hydrated)
            .await
            .unwrap();

        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert!(result.skipped.contains("schema"));
        assert_eq!(result.completed["schema"].content_hash, "cached");
        assert!(result.completed.contains_key("api"));
    }

    #[tokio::test]
    async fn test_verification_policy_escalates() {
        struct RejectAll;

        #[async_trait]
        impl Verifier for RejectAll {
            async fn verify(&self, _spec: &ArtifactSpec, _content: &str) -> VerificationOutcome {
                VerificationOutcome::fail(vec!["missing contract element".to_string()])
            }
        }

        let mut graph = ArtifactGraph::new();
        graph.add(spec("only", &[])).unwrap();
        graph.freeze().unwrap();

        // Advisory: completes with verified=false.
        let ctx = ExecutorContext::with_defaults().with_verifier(Arc::new(RejectAll));
        let result = ArtifactExecutor::new(ctx)
            .execute(&graph, Arc::new(EchoSource))
            .await
            .unwrap();
        assert!(!result.completed["only"].verified);

        // FailOnUnverified: escalates to failure.
        let ctx = ExecutorContext::with_defaults()
            .with_verifier(Arc::new(RejectAll))
            .with_policy(VerificationPolicy::FailOnUnverified);
        let result = ArtifactExecutor::new(ctx)
            .execute(&graph, Arc::new(EchoSource))
            .await
            .unwrap();
        assert!(result.failed.contains_key("only"));
    }

    #[tokio::test]
    async fn test_cancellation_stops_future_waves() {
        struct CancellingSource {
            handle: CancelHandle,
        }

        #[async_trait]
        impl ArtifactSource for CancellingSource {
            async fn create(&self, spec: &ArtifactSpec, _tier: ModelTier) -> Result<String> {
                // Cancel while the first wave is in flight.
                self.handle.cancel();
                Ok(format!("content of {}", spec.id))
            }
        }

        let graph = chain_graph();
        let ctx = ExecutorContext::with_defaults();
        let handle = ctx.cancel_handle();
        let executor = ArtifactExecutor::new(ctx);
        let result = executor
            .execute(&graph, Arc::new(CancellingSource { handle }))
            .await
            .unwrap();

        // First wave finished, later waves never started.
        assert!(result.cancelled);
        assert!(result.completed.contains_key("schema"));
        assert!(!result.completed.contains_key("model"));
        assert!(!result.completed.contains_key("api"));
    }

    #[tokio::test]
    async fn test_artifact_timeout_is_isolated() {
        struct SlowSource;

        #[async_trait]
        impl ArtifactSource for SlowSource {
            async fn create(&self, spec: &ArtifactSpec, _tier: ModelTier) -> Result<String> {
                if spec.id == "slow" {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
                Ok(format!("content of {}", spec.id))
            }
        }

        let mut graph = ArtifactGraph::new();
        graph.add(spec("slow", &[])).unwrap();
        graph.add(spec("fast", &[])).unwrap();
        graph.freeze().unwrap();

        let mut limits = ExecutionLimits::conservative();
        limits.artifact_timeout = Duration::from_millis(50);
        let ctx = ExecutorContext::new(limits, ResourceGovernor::with_defaults()).unwrap();
        let result = ArtifactExecutor::new(ctx)
            .execute(&graph, Arc::new(SlowSource))
            .await
            .unwrap();

        assert!(result.failed.contains_key("slow"));
        assert!(result.completed.contains_key("fast"));
    }
}
