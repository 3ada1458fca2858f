//! Merging worker branches back into the target branch.
//!
//! Conflicts never error the coordinator: a conflicted merge is aborted,
//! the repository is left exactly as it was, and the report names the
//! conflicting files so a human can integrate by hand.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::coord::worktree::git;
use crate::core::errors::{EngineError, Result};

/// How worker branches are integrated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Keep history linear: fast-forward only, replaying a diverged
    /// branch onto the target first. Divergence that cannot be replayed
    /// cleanly fails the merge.
    #[default]
    FastForward,
    /// Always create a merge commit.
    ThreeWay,
    /// Fast-forward when possible, otherwise merge without committing
    /// and commit only once the index carries no conflicts.
    AbortOnConflict,
}

/// Outcome of merging one branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeReport {
    pub branch: String,
    pub strategy: MergeStrategy,
    pub success: bool,
    /// Files the merge brought into the target branch.
    pub files_merged: Vec<String>,
    /// Files with competing edits when the merge was aborted.
    pub conflicts: Vec<String>,
}

/// Merges branches into a fixed target branch of one repository.
pub struct BranchMerger {
    repo_root: PathBuf,
    target_branch: String,
}

impl BranchMerger {
    pub fn new(repo_root: impl Into<PathBuf>, target_branch: impl Into<String>) -> Self {
        Self {
            repo_root: repo_root.into(),
            target_branch: target_branch.into(),
        }
    }

    pub fn target_branch(&self) -> &str {
        &self.target_branch
    }

    /// Merge `branch` into the target branch under the given strategy.
    ///
    /// All three strategies leave the repository consistent: either the
    /// merge lands completely or the target branch is exactly where it
    /// started.
    pub async fn merge_branch(&self, branch: &str, strategy: MergeStrategy) -> Result<MergeReport> {
        git(&self.repo_root, &["checkout", &self.target_branch]).await?;
        let before = self.head().await?;

        let merged = match strategy {
            MergeStrategy::FastForward => self.linearize_and_ff(branch).await,
            MergeStrategy::ThreeWay => {
                let message = format!("Merge {branch} into {}", self.target_branch);
                git(&self.repo_root, &["merge", "--no-ff", "-m", &message, branch])
                    .await
                    .map(|_| ())
            }
            MergeStrategy::AbortOnConflict => self.merge_if_conflict_free(branch).await,
        };

        match merged {
            Ok(()) => {
                let files_merged = self.changed_since(&before).await?;
                info!(branch, files = files_merged.len(), "branch merged");
                Ok(MergeReport {
                    branch: branch.to_string(),
                    strategy,
                    success: true,
                    files_merged,
                    conflicts: Vec::new(),
                })
            }
            Err(e @ EngineError::Git { .. }) => {
                // Collect the competing files before rolling back; a
                // stopped merge and a stopped rebase expose them the same
                // way.
                let conflicts = self.conflicting_files().await.unwrap_or_default();
                let rolled_back = self.abort_in_progress().await;
                git(&self.repo_root, &["checkout", &self.target_branch])
                    .await
                    .ok();
                if !rolled_back {
                    // A hard git failure, not a conflict.
                    return Err(e);
                }
                warn!(branch, conflicts = ?conflicts, "merge conflict; aborted");
                Ok(MergeReport {
                    branch: branch.to_string(),
                    strategy,
                    success: false,
                    files_merged: Vec::new(),
                    conflicts,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Fast-forward only. A diverged branch is replayed onto the target
    /// first so the target's history stays linear.
    async fn linearize_and_ff(&self, branch: &str) -> Result<()> {
        if git(&self.repo_root, &["merge", "--ff-only", branch])
            .await
            .is_ok()
        {
            return Ok(());
        }
        git(&self.repo_root, &["rebase", &self.target_branch, branch]).await?;
        // Rebase leaves HEAD on the rebased branch.
        git(&self.repo_root, &["checkout", &self.target_branch]).await?;
        git(&self.repo_root, &["merge", "--ff-only", branch]).await?;
        Ok(())
    }

    /// Fast-forward when possible; otherwise merge without committing and
    /// finalize only once the automatic merge produced no conflicts, so no
    /// commit object ever exists for a conflicted attempt.
    async fn merge_if_conflict_free(&self, branch: &str) -> Result<()> {
        if git(&self.repo_root, &["merge", "--ff-only", branch])
            .await
            .is_ok()
        {
            return Ok(());
        }
        git(&self.repo_root, &["merge", "--no-commit", "--no-ff", branch]).await?;
        let message = format!("Merge {branch} into {}", self.target_branch);
        git(&self.repo_root, &["commit", "-m", &message]).await?;
        Ok(())
    }

    /// Roll back whatever operation stopped on conflicts. False means
    /// nothing was in progress.
    async fn abort_in_progress(&self) -> bool {
        if merge_head_exists(&self.repo_root).await {
            git(&self.repo_root, &["merge", "--abort"]).await.ok();
            return true;
        }
        if rebase_in_progress(&self.repo_root).await {
            git(&self.repo_root, &["rebase", "--abort"]).await.ok();
            return true;
        }
        false
    }

    async fn head(&self) -> Result<String> {
        Ok(git(&self.repo_root, &["rev-parse", "HEAD"])
            .await?
            .trim()
            .to_string())
    }

    async fn changed_since(&self, before: &str) -> Result<Vec<String>> {
        let range = format!("{before}..HEAD");
        let out = git(&self.repo_root, &["diff", "--name-only", &range]).await?;
        let mut files: Vec<String> = out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        files.sort();
        Ok(files)
    }

    async fn conflicting_files(&self) -> Result<Vec<String>> {
        let out = git(&self.repo_root, &["diff", "--name-only", "--diff-filter=U"]).await?;
        let mut files: Vec<String> = out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        files.sort();
        Ok(files)
    }
}

async fn merge_head_exists(repo_root: &Path) -> bool {
    git(repo_root, &["rev-parse", "-q", "--verify", "MERGE_HEAD"])
        .await
        .is_ok()
}

async fn rebase_in_progress(repo_root: &Path) -> bool {
    git(repo_root, &["rev-parse", "-q", "--verify", "REBASE_HEAD"])
        .await
        .is_ok()
}
