// Core infrastructure modules
pub mod core {
    pub mod errors;
    pub mod limits;
}

// Engine layers, bottom up
pub mod graph; // artifact specs and the dependency graph
pub mod executor; // wave-based parallel execution
pub mod incremental; // content-hash change detection
pub mod persistence; // snapshots, traces, resume
pub mod coord; // multi-worker coordination

// Re-exports for convenience
pub use core::errors::{EngineError, Result};
pub use core::limits::{ExecutionLimits, GovernorStats, ResourceGovernor};

pub use coord::{
    CoordinatorConfig, CoordinatorResult, FileLockManager, GoalTask, MergeReport, MergeStrategy,
    WorkerCoordinator, WorktreeManager,
};
pub use executor::{
    ArtifactExecutor, ArtifactResult, ArtifactSource, ArtifactStatus, ExecutionEvent,
    ExecutionResult, ExecutorContext, VerificationOutcome, VerificationPolicy, Verifier,
};
pub use graph::{
    select_tier, tier_distribution, ArtifactGraph, ArtifactSpec, ModelTier, Wave,
};
pub use incremental::{plan_incremental, ChangeDetector, ChangeSet, IncrementalPlan};
pub use persistence::{
    hash_goal, resume, run_checkpointed, Checkpointer, CompletionRecord, ExecutionStatus,
    PlanStore, SavedExecution, TraceLogger,
};

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct TemplateSource;

    #[async_trait]
    impl ArtifactSource for TemplateSource {
        async fn create(&self, spec: &ArtifactSpec, tier: ModelTier) -> Result<String> {
            Ok(format!("// {} ({tier})\n{}", spec.id, spec.contract))
        }
    }

    fn plan_graph() -> ArtifactGraph {
        let mut graph = ArtifactGraph::new();
        graph
            .add(ArtifactSpec::new("schema", "database schema").with_contract("tables and indexes"))
            .unwrap();
        graph
            .add(
                ArtifactSpec::new("model", "data model")
                    .with_contract("structs mirroring the schema")
                    .with_requires(["schema"]),
            )
            .unwrap();
        graph
            .add(
                ArtifactSpec::new("api", "http api")
                    .with_contract("handlers over the model")
                    .with_requires(["model"]),
            )
            .unwrap();
        graph
    }

    /// Full pipeline: plan, execute, persist, mutate, re-plan
    /// incrementally.
    #[tokio::test]
    async fn test_end_to_end_incremental_pipeline() -> anyhow::Result<()> {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let dir = tempfile::tempdir()?;
        let store = PlanStore::new(dir.path())?;

        let mut graph = plan_graph();
        graph.freeze()?;
        let executor = ArtifactExecutor::new(ExecutorContext::with_defaults());
        let first = executor.execute(&graph, Arc::new(TemplateSource)).await?;
        assert!(first.is_complete());

        let mut saved = SavedExecution::new("build the service", graph.clone());
        saved.absorb(&first);
        store.save(&saved)?;

        // Second run with an unchanged graph: everything hydrates.
        let previous = store.find_by_goal("build the service")?;
        let changes = ChangeDetector::default().detect(&graph, &previous);
        let plan = plan_incremental(&graph, &changes, &previous);
        assert!(plan.to_execute.is_empty());
        assert_eq!(plan.to_skip.len(), 3);

        // Tighten one contract: that artifact and its dependents rebuild.
        let mut changed = ArtifactGraph::new();
        changed
            .add(ArtifactSpec::new("schema", "database schema").with_contract("tables and indexes"))
            .unwrap();
        changed
            .add(
                ArtifactSpec::new("model", "data model")
                    .with_contract("structs plus audit columns")
                    .with_requires(["schema"]),
            )
            .unwrap();
        changed
            .add(
                ArtifactSpec::new("api", "http api")
                    .with_contract("handlers over the model")
                    .with_requires(["model"]),
            )
            .unwrap();

        let changes = ChangeDetector::default().detect(&changed, &previous);
        let plan = plan_incremental(&changed, &changes, &previous);
        assert_eq!(
            plan.to_execute,
            ["model".to_string(), "api".to_string()].into_iter().collect()
        );

        let second = executor
            .execute_filtered(
                &changed,
                Arc::new(TemplateSource),
                Some(&plan.to_execute),
                plan.hydrated,
            )
            .await?;
        assert!(second.skipped.contains("schema"));
        assert!(second.completed.contains_key("api"));
        Ok(())
    }
}
