use std::path::PathBuf;
use thiserror::Error;

/// Unified error type for the wavefront engine.
///
/// Graph-construction errors are always fatal and surface before any work
/// begins; execution errors are recorded per artifact and never abort
/// independent branches.
#[derive(Debug, Error)]
pub enum EngineError {
    // Graph construction errors
    #[error("artifact already exists in graph: {artifact_id}")]
    DuplicateArtifact { artifact_id: String },

    #[error("cyclic dependency detected: {}", render_cycle(.cycle))]
    CyclicDependency { cycle: Vec<String> },

    #[error("artifact '{artifact_id}' requires non-existent artifacts: {missing:?}")]
    MissingDependency {
        artifact_id: String,
        missing: Vec<String>,
    },

    #[error("artifact not found: {artifact_id}")]
    ArtifactNotFound { artifact_id: String },

    #[error("graph is frozen; no further additions after execution starts")]
    GraphFrozen,

    #[error("graph has {count} artifacts (max: {limit}); break the goal into smaller subgoals")]
    GraphExplosion { count: usize, limit: usize },

    #[error("artifact '{artifact_id}' sits at dependency depth {depth} (max: {limit})")]
    DepthExceeded {
        artifact_id: String,
        depth: usize,
        limit: usize,
    },

    #[error("extension rejected: {reason}")]
    ExtensionRejected { reason: String },

    // Execution errors
    #[error("artifact creation failed: {artifact_id} - {reason}")]
    Creation { artifact_id: String, reason: String },

    #[error("operation timed out: {operation} ({elapsed_ms}ms)")]
    Timeout { operation: String, elapsed_ms: u64 },

    // Persistence errors
    #[error("corrupt snapshot at {path}: {reason}")]
    CorruptSnapshot { path: PathBuf, reason: String },

    #[error("no saved execution for goal hash: {goal_hash}")]
    SnapshotNotFound { goal_hash: String },

    // Coordination errors
    #[error("lock acquisition timed out for resource: {resource}")]
    LockTimeout { resource: String },

    #[error("resource {resource} is held by {holder}")]
    LockHeld { resource: String, holder: String },

    #[error("worker {worker_id} exceeded its wall-clock timeout")]
    WorkerTimeout { worker_id: String },

    #[error("git {operation} failed: {stderr}")]
    Git { operation: String, stderr: String },

    #[error("workspace is not a git repository: {path}")]
    NotARepository { path: PathBuf },

    #[error("working directory not clean; commit or stash changes first")]
    DirtyWorkingTree,

    #[error("resource exhausted: {resource} (current: {current}, limit: {limit})")]
    ResourceExhausted {
        resource: String,
        current: u64,
        limit: u64,
    },

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

fn render_cycle(cycle: &[String]) -> String {
    if cycle.is_empty() {
        return "<empty>".to_string();
    }
    let mut parts: Vec<&str> = cycle.iter().map(String::as_str).collect();
    parts.push(&cycle[0]);
    parts.join(" -> ")
}

impl EngineError {
    pub fn creation(artifact_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Creation {
            artifact_id: artifact_id.into(),
            reason: reason.into(),
        }
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Fatal errors abort before any work begins: bad graphs and corrupt
    /// snapshots are never retried or worked around.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::DuplicateArtifact { .. }
                | Self::CyclicDependency { .. }
                | Self::MissingDependency { .. }
                | Self::GraphFrozen
                | Self::GraphExplosion { .. }
                | Self::DepthExceeded { .. }
                | Self::CorruptSnapshot { .. }
                | Self::Configuration(_)
        )
    }

    /// Transient conditions a worker may route around while other work
    /// proceeds.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Creation { .. }
                | Self::Timeout { .. }
                | Self::LockTimeout { .. }
                | Self::LockHeld { .. }
                | Self::WorkerTimeout { .. }
                | Self::Io(_)
        )
    }
}

/// Result type alias for EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_rendering_closes_the_loop() {
        let err = EngineError::CyclicDependency {
            cycle: vec!["a".into(), "b".into(), "c".into()],
        };
        assert_eq!(
            err.to_string(),
            "cyclic dependency detected: a -> b -> c -> a"
        );
    }

    #[test]
    fn test_fatal_classification() {
        let cycle = EngineError::CyclicDependency { cycle: vec!["x".into()] };
        assert!(cycle.is_fatal());
        assert!(!cycle.is_retryable());

        let corrupt = EngineError::CorruptSnapshot {
            path: PathBuf::from("/tmp/x.json"),
            reason: "truncated".into(),
        };
        assert!(corrupt.is_fatal());

        let creation = EngineError::creation("schema", "backend unavailable");
        assert!(!creation.is_fatal());
        assert!(creation.is_retryable());
    }

    #[test]
    fn test_lock_timeout_is_retryable_not_fatal() {
        let err = EngineError::LockTimeout { resource: "g1".into() };
        assert!(err.is_retryable());
        assert!(!err.is_fatal());
    }
}
